//! The test orchestrator: every selected backend × case × dtype.

use opk_core::{Backend, BackendHandle, ErrorKind, ProviderRegistry};
use tracing::{error, info, warn};

use crate::cases::{TestCase, default_matrix, skip_reason};
use crate::config::HarnessConfig;
use crate::report::{BackendReport, BackendStatus, CaseReport, Outcome, RunReport};
use crate::runner::{self, BackendContext, Verdict};

pub struct Harness {
    config: HarnessConfig,
    registry: ProviderRegistry,
    cases: Vec<TestCase>,
}

impl Harness {
    /// Default matrix against the default provider registry.
    pub fn new(config: HarnessConfig) -> Self {
        Self {
            config,
            registry: ProviderRegistry::with_defaults(),
            cases: default_matrix(),
        }
    }

    pub fn with_registry(mut self, registry: ProviderRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_cases(mut self, cases: Vec<TestCase>) -> Self {
        self.cases = cases;
        self
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn run(&self) -> RunReport {
        let backends = self
            .config
            .selected_backends()
            .into_iter()
            .map(|b| self.run_backend(b))
            .collect();
        RunReport {
            profile: self.config.profile,
            backends,
        }
    }

    fn run_backend(&self, backend: Backend) -> BackendReport {
        let unavailable = |reason: String| {
            warn!(%backend, %reason, "backend unavailable");
            BackendReport {
                backend: backend.name().to_string(),
                status: BackendStatus::Unavailable { reason },
                cases: Vec::new(),
            }
        };
        let memory = match self.registry.resolve(backend) {
            Ok(m) => m,
            Err(e) => return unavailable(e.to_string()),
        };
        let handle = match BackendHandle::open(backend, self.config.device_id) {
            Ok(h) => h,
            Err(e) => return unavailable(e.to_string()),
        };
        let ctx = BackendContext {
            handle,
            memory,
            profile: self.config.profile,
        };

        info!(%backend, cases = self.cases.len(), "running conformance cases");
        let mut cases = Vec::new();
        let mut status = BackendStatus::Completed;
        'cases: for case in &self.cases {
            let op = case.operator();
            if !self.config.ops.includes(op) {
                continue;
            }
            let label = case.label();
            for &dtype in case.dtypes() {
                let outcome = if let Some(reason) = skip_reason(backend, op, dtype) {
                    warn!(%backend, %op, %dtype, %reason, "case skipped");
                    Outcome::Skipped { reason }
                } else {
                    let result = match case {
                        TestCase::AvgPool(c) => runner::run_avg_pool(&ctx, c, dtype),
                        TestCase::Rope(c) => runner::run_rope(&ctx, c, dtype),
                    };
                    match result {
                        Ok(Verdict::Passed(timing)) => Outcome::Passed { timing },
                        Ok(Verdict::Mismatch(m)) => {
                            error!(%backend, %op, case = %label, %dtype, "{m}");
                            Outcome::Failed {
                                reason: m.to_string(),
                            }
                        }
                        Err(e) => match e.kind() {
                            ErrorKind::Unsupported => {
                                warn!(%backend, %op, error = %e, "case skipped");
                                Outcome::Skipped {
                                    reason: e.to_string(),
                                }
                            }
                            ErrorKind::Precondition => {
                                error!(%backend, %op, case = %label, error = %e, "case rejected");
                                Outcome::Failed {
                                    reason: e.to_string(),
                                }
                            }
                            ErrorKind::Fatal => {
                                error!(%backend, %op, case = %label, error = %e, "aborting backend");
                                cases.push(CaseReport {
                                    op,
                                    case: label.clone(),
                                    dtype: dtype.to_string(),
                                    outcome: Outcome::Failed {
                                        reason: e.to_string(),
                                    },
                                });
                                status = BackendStatus::Aborted {
                                    reason: e.to_string(),
                                };
                                break 'cases;
                            }
                        },
                    }
                };
                cases.push(CaseReport {
                    op,
                    case: label.clone(),
                    dtype: dtype.to_string(),
                    outcome,
                });
            }
        }
        drop(ctx);
        info!(%backend, "backend finished");

        BackendReport {
            backend: backend.name().to_string(),
            status,
            cases,
        }
    }
}
