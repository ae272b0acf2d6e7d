use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use opk_conformance::{Harness, HarnessConfig, OpFilter};
use opk_core::{Backend, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "opk")]
#[command(about = "Run the opk operator conformance suite")]
struct Args {
    /// Run on the CPU (default when no backend is given).
    #[arg(long)]
    cpu: bool,
    /// Run on NVIDIA GPUs.
    #[arg(long)]
    cuda: bool,
    /// Run on Cambricon MLUs.
    #[arg(long)]
    bang: bool,
    /// Run on Ascend NPUs.
    #[arg(long)]
    ascend: bool,
    /// Run on Moore Threads GPUs.
    #[arg(long)]
    musa: bool,

    /// Operators to run.
    #[arg(long, value_enum, default_value_t = OpArg::All)]
    op: OpArg,

    /// Time the oracle and the native call.
    #[arg(long)]
    profile: bool,
    /// Untimed warm-up calls when profiling.
    #[arg(long, value_name = "N")]
    prerun: Option<u32>,
    /// Timed calls when profiling.
    #[arg(long, value_name = "N")]
    iterations: Option<u32>,
    /// Device ordinal passed to handle creation.
    #[arg(long, value_name = "N")]
    device_id: Option<i32>,

    /// Write the JSON run report here.
    #[arg(long, value_name = "PATH")]
    report: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OpArg {
    All,
    AvgPool,
    Rope,
}

impl From<OpArg> for OpFilter {
    fn from(op: OpArg) -> Self {
        match op {
            OpArg::All => OpFilter::All,
            OpArg::AvgPool => OpFilter::AvgPool,
            OpArg::Rope => OpFilter::Rope,
        }
    }
}

impl Args {
    fn backends(&self) -> Vec<Backend> {
        [
            (self.cpu, Backend::Cpu),
            (self.cuda, Backend::Cuda),
            (self.bang, Backend::Bang),
            (self.ascend, Backend::Ascend),
            (self.musa, Backend::Musa),
        ]
        .into_iter()
        .filter_map(|(on, b)| on.then_some(b))
        .collect()
    }

    /// Flags applied on top of an environment-derived config.
    fn apply(&self, mut config: HarnessConfig) -> HarnessConfig {
        config.backends = self.backends();
        config.ops = self.op.into();
        config.profile.enabled |= self.profile;
        if let Some(n) = self.prerun {
            config.profile.prerun = n;
        }
        if let Some(n) = self.iterations {
            config.profile.iterations = n;
        }
        if let Some(id) = self.device_id {
            config.device_id = id;
        }
        config
    }
}

const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(true) => {
            println!("{GREEN}Test passed!{RESET}");
            ExitCode::SUCCESS
        }
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("{RED}error:{RESET} {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<bool> {
    let config = args.apply(HarnessConfig::from_env()?);
    info!(
        backends = ?config.selected_backends(),
        ops = ?config.ops,
        profile = config.profile.enabled,
        "starting conformance run"
    );
    let report = Harness::new(config).run();

    for backend in &report.backends {
        println!("== {} ==", backend.backend);
        for case in &backend.cases {
            println!("  {case}");
        }
    }

    if let Some(path) = &args.report {
        if let Err(e) = report.write_json(path) {
            eprintln!("{RED}error:{RESET} writing {}: {e}", path.display());
            return Ok(false);
        }
        info!(path = %path.display(), "wrote run report");
    }

    if report.success() {
        return Ok(true);
    }
    let summary = report.summary();
    eprintln!(
        "{RED}Test failed:{RESET} {} passed, {} failed, {} skipped",
        summary.passed, summary.failed, summary.skipped
    );
    for backend in &report.backends {
        match &backend.status {
            opk_conformance::BackendStatus::Completed => {}
            opk_conformance::BackendStatus::Unavailable { reason } => {
                eprintln!("  {}: unavailable: {reason}", backend.backend)
            }
            opk_conformance::BackendStatus::Aborted { reason } => {
                eprintln!("  {}: aborted: {reason}", backend.backend)
            }
        }
    }
    for (backend, case) in report.failures() {
        eprintln!("  {backend}: {case}");
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_command_is_well_formed() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_default_is_cpu_everything() {
        let args = Args::try_parse_from(["opk"]).unwrap();
        let config = args.apply(HarnessConfig::default());
        assert_eq!(config.selected_backends(), vec![Backend::Cpu]);
        assert_eq!(config.ops, OpFilter::All);
        assert!(!config.profile.enabled);
    }

    #[test]
    fn test_flags_override_config() {
        let args = Args::try_parse_from([
            "opk",
            "--cuda",
            "--musa",
            "--op",
            "avg-pool",
            "--profile",
            "--iterations",
            "5",
            "--device-id",
            "2",
        ])
        .unwrap();
        let mut base = HarnessConfig::default();
        base.profile.prerun = 3;
        let config = args.apply(base);
        assert_eq!(config.backends, vec![Backend::Cuda, Backend::Musa]);
        assert_eq!(config.ops, OpFilter::AvgPool);
        assert!(config.profile.enabled);
        assert_eq!(config.profile.prerun, 3);
        assert_eq!(config.profile.iterations, 5);
        assert_eq!(config.device_id, 2);
    }

    #[test]
    fn test_unknown_op_rejected() {
        assert!(Args::try_parse_from(["opk", "--op", "matmul"]).is_err());
    }
}
