//! Run results, serialisable as JSON.

use std::io::Write;
use std::path::Path;

use serde::Serialize;

use crate::cases::Operator;
use crate::config::ProfileConfig;

/// Mean per-call wall time over the profiled iterations.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Timing {
    pub oracle_ms: f64,
    pub native_ms: f64,
    pub iterations: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Passed {
        #[serde(skip_serializing_if = "Option::is_none")]
        timing: Option<Timing>,
    },
    Failed {
        reason: String,
    },
    Skipped {
        reason: String,
    },
}

impl Outcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failed { .. })
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct CaseReport {
    pub op: Operator,
    pub case: String,
    pub dtype: String,
    pub outcome: Outcome,
}

impl std::fmt::Display for CaseReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} dtype={}: ", self.op, self.case, self.dtype)?;
        match &self.outcome {
            Outcome::Passed { timing: None } => f.write_str("ok"),
            Outcome::Passed { timing: Some(t) } => write!(
                f,
                "ok (oracle {:.6} ms, native {:.6} ms over {} iterations)",
                t.oracle_ms, t.native_ms, t.iterations
            ),
            Outcome::Failed { reason } => write!(f, "FAILED: {reason}"),
            Outcome::Skipped { reason } => write!(f, "skipped: {reason}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BackendStatus {
    Completed,
    /// No provider, or the handle could not be opened.
    Unavailable { reason: String },
    /// A fatal error stopped the remaining cases.
    Aborted { reason: String },
}

#[derive(Clone, Debug, Serialize)]
pub struct BackendReport {
    pub backend: String,
    pub status: BackendStatus,
    pub cases: Vec<CaseReport>,
}

impl BackendReport {
    pub fn success(&self) -> bool {
        self.status == BackendStatus::Completed && !self.cases.iter().any(|c| c.outcome.is_failure())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    pub profile: ProfileConfig,
    pub backends: Vec<BackendReport>,
}

impl RunReport {
    /// True iff every case passed or was skipped and every backend completed.
    pub fn success(&self) -> bool {
        self.backends.iter().all(BackendReport::success)
    }

    pub fn summary(&self) -> Summary {
        let mut s = Summary::default();
        for case in self.backends.iter().flat_map(|b| &b.cases) {
            match case.outcome {
                Outcome::Passed { .. } => s.passed += 1,
                Outcome::Failed { .. } => s.failed += 1,
                Outcome::Skipped { .. } => s.skipped += 1,
            }
        }
        s
    }

    /// Failed cases paired with their backend.
    pub fn failures(&self) -> impl Iterator<Item = (&str, &CaseReport)> {
        self.backends.iter().flat_map(|b| {
            b.cases
                .iter()
                .filter(|c| c.outcome.is_failure())
                .map(move |c| (b.backend.as_str(), c))
        })
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn write_json(&self, path: &Path) -> std::io::Result<()> {
        let mut file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(&mut file, self)?;
        file.write_all(b"\n")
    }
}
