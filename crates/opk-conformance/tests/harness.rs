//! Orchestrator runs against the native CPU library.

use opk_conformance::{
    BackendStatus, Harness, HarnessConfig, InputFill, OpFilter, Outcome, PoolCase, TableDtype,
    TestCase, Tolerance, default_matrix,
};
use opk_core::{Backend, DType, Shape};
use opk_ops::PoolParams;

fn init_tracing() {
    let _ = tracing_subscriber::fmt::try_init();
}

fn pool_case(input: &[usize], params: PoolParams, dtypes: &[DType]) -> TestCase {
    TestCase::AvgPool(PoolCase {
        input: Shape::new(input),
        params,
        dtypes: dtypes.to_vec(),
        tolerance: Tolerance::relative(1e-3),
        fill: InputFill::Uniform { seed: 11 },
    })
}

#[test]
fn default_matrix_passes_on_cpu() {
    init_tracing();
    let report = Harness::new(HarnessConfig::default()).run();
    assert!(report.success(), "{}", report.to_json().unwrap());
    let summary = report.summary();
    // 4 pooling cases in two dtypes plus 3 rotary cases.
    assert_eq!(summary.passed, 11);
    assert_eq!(summary.failed, 0);
}

#[test]
fn unavailable_backend_does_not_stop_others() {
    init_tracing();
    let config = HarnessConfig {
        backends: vec![Backend::Cuda, Backend::Cpu],
        ops: OpFilter::AvgPool,
        ..HarnessConfig::default()
    };
    let cases = vec![pool_case(&[1, 1, 10], PoolParams::new(&[3], &[1], &[1]), &[DType::F32])];
    let report = Harness::new(config).with_cases(cases).run();

    assert_eq!(report.backends.len(), 2);
    let cpu = &report.backends[0];
    assert_eq!(cpu.backend, "cpu");
    assert_eq!(cpu.status, BackendStatus::Completed);
    assert_eq!(cpu.cases.len(), 1);
    let cuda = &report.backends[1];
    assert!(matches!(cuda.status, BackendStatus::Unavailable { .. }));
    assert!(!report.success());
}

#[test]
fn mismatch_and_precondition_fail_only_their_case() {
    init_tracing();
    let impossible = pool_case(&[1, 1, 2, 2], PoolParams::new(&[2, 2], &[1, 1], &[1, 1]), &[DType::F32])
        .with_tolerance(Tolerance::new(-1.0, 0.0));
    let malformed = pool_case(&[1, 1, 2, 2], PoolParams::new(&[2, 2], &[1], &[1, 1]), &[DType::F32]);
    let good = pool_case(&[1, 1, 2, 2], PoolParams::new(&[2, 2], &[1, 1], &[1, 1]), &[DType::F16]);
    let report = Harness::new(HarnessConfig::default())
        .with_cases(vec![impossible, malformed, good])
        .run();

    let cpu = &report.backends[0];
    assert_eq!(cpu.status, BackendStatus::Completed);
    assert_eq!(cpu.cases.len(), 3);
    match &cpu.cases[0].outcome {
        Outcome::Failed { reason } => assert!(reason.contains("first at [0]"), "{reason}"),
        other => panic!("expected mismatch, got {other:?}"),
    }
    match &cpu.cases[1].outcome {
        Outcome::Failed { reason } => assert!(reason.contains("lengths differ"), "{reason}"),
        other => panic!("expected precondition failure, got {other:?}"),
    }
    assert_eq!(cpu.cases[2].outcome, Outcome::Passed { timing: None });
    assert_eq!(report.failures().count(), 2);
}

#[test]
fn unsupported_rank_is_a_skip() {
    init_tracing();
    let four_d = pool_case(
        &[1, 1, 2, 2, 2, 2],
        PoolParams::new(&[1; 4], &[0; 4], &[1; 4]),
        &[DType::F32],
    );
    let report = Harness::new(HarnessConfig::default())
        .with_cases(vec![four_d])
        .run();
    assert!(matches!(
        report.backends[0].cases[0].outcome,
        Outcome::Skipped { .. }
    ));
    assert!(report.success());
}

#[test]
fn native_failure_aborts_backend() {
    init_tracing();
    let params = PoolParams::new(&[3], &[1], &[1]);
    let cases = vec![
        pool_case(&[1, 1, 10], params.clone(), &[DType::BF16]),
        pool_case(&[1, 1, 10], params, &[DType::F32]),
    ];
    let report = Harness::new(HarnessConfig::default()).with_cases(cases).run();
    let cpu = &report.backends[0];
    assert!(matches!(cpu.status, BackendStatus::Aborted { ref reason } if reason.contains("BAD_TENSOR_DTYPE")));
    assert_eq!(cpu.cases.len(), 1);
    assert!(!report.success());
}

#[test]
fn rope_tables_in_either_dtype_pass() {
    init_tracing();
    let config = HarnessConfig {
        ops: OpFilter::Rope,
        ..HarnessConfig::default()
    };
    let mut cases = Vec::new();
    for case in default_matrix() {
        if let TestCase::Rope(mut rope) = case {
            cases.push(TestCase::Rope(rope.clone()));
            rope.table_dtype = TableDtype::Tensor;
            cases.push(TestCase::Rope(rope));
        }
    }
    assert_eq!(cases.len(), 6);
    let report = Harness::new(config).with_cases(cases).run();
    assert!(report.success(), "{}", report.to_json().unwrap());
    assert_eq!(report.summary().passed, 6);
}

#[test]
fn profiling_reports_timing() {
    init_tracing();
    let mut config = HarnessConfig::default();
    config.profile.enabled = true;
    config.profile.prerun = 1;
    config.profile.iterations = 3;
    config.ops = OpFilter::Rope;
    let cases: Vec<TestCase> = default_matrix()
        .into_iter()
        .filter(|c| matches!(c, TestCase::Rope(r) if r.strides.is_some()))
        .collect();
    let report = Harness::new(config).with_cases(cases).run();
    assert!(report.success());
    match &report.backends[0].cases[0].outcome {
        Outcome::Passed { timing: Some(t) } => {
            assert_eq!(t.iterations, 3);
            assert!(t.native_ms >= 0.0 && t.oracle_ms >= 0.0);
        }
        other => panic!("expected timing, got {other:?}"),
    }
}

#[test]
fn report_written_as_json() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("report.json");
    let cases = vec![pool_case(&[1, 1, 10], PoolParams::new(&[3], &[1], &[1]), &[DType::F16])];
    let report = Harness::new(HarnessConfig::default()).with_cases(cases).run();
    report.write_json(&path).unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    let v: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(v["backends"][0]["backend"], "cpu");
    assert_eq!(v["backends"][0]["cases"][0]["dtype"], "f16");
    assert_eq!(v["profile"]["iterations"], 1000);
}
