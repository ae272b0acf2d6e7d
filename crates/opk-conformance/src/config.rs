//! Harness configuration: defaults, then environment, then explicit overrides.

use opk_core::{Backend, OpkError, Result};
use serde::Serialize;

use crate::cases::Operator;

/// Timing loop settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ProfileConfig {
    pub enabled: bool,
    /// Untimed warm-up calls.
    pub prerun: u32,
    /// Timed calls averaged into the reported mean.
    pub iterations: u32,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            prerun: 10,
            iterations: 1000,
        }
    }
}

/// Which operators to run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OpFilter {
    #[default]
    All,
    AvgPool,
    Rope,
}

impl OpFilter {
    pub fn includes(self, op: Operator) -> bool {
        match self {
            OpFilter::All => true,
            OpFilter::AvgPool => op == Operator::AvgPool,
            OpFilter::Rope => op == Operator::Rope,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HarnessConfig {
    pub backends: Vec<Backend>,
    pub ops: OpFilter,
    pub profile: ProfileConfig,
    pub device_id: i32,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            backends: vec![Backend::Cpu],
            ops: OpFilter::All,
            profile: ProfileConfig::default(),
            device_id: 0,
        }
    }
}

pub const ENV_PROFILE: &str = "OPK_PROFILE";
pub const ENV_PRERUN: &str = "OPK_PRERUN";
pub const ENV_ITERATIONS: &str = "OPK_ITERATIONS";
pub const ENV_DEVICE_ID: &str = "OPK_DEVICE_ID";

impl HarnessConfig {
    /// Defaults overridden by `OPK_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env(|key| std::env::var(key).ok())
    }

    /// Apply overrides looked up through `var`.
    pub fn with_env(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(v) = var(ENV_PROFILE) {
            self.profile.enabled = parse_flag(ENV_PROFILE, &v)?;
        }
        if let Some(v) = var(ENV_PRERUN) {
            self.profile.prerun = parse_num(ENV_PRERUN, &v)?;
        }
        if let Some(v) = var(ENV_ITERATIONS) {
            self.profile.iterations = parse_num(ENV_ITERATIONS, &v)?;
        }
        if let Some(v) = var(ENV_DEVICE_ID) {
            self.device_id = parse_num(ENV_DEVICE_ID, &v)?;
        }
        Ok(self)
    }

    /// Selected backends, deduplicated in canonical order. Empty selects CPU.
    pub fn selected_backends(&self) -> Vec<Backend> {
        let mut backends = self.backends.clone();
        backends.sort();
        backends.dedup();
        if backends.is_empty() {
            backends.push(Backend::Cpu);
        }
        backends
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(OpkError::InvalidArgument(format!(
            "{key}: expected a boolean, got {other:?}"
        ))),
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| OpkError::InvalidArgument(format!("{key}: expected a number, got {value:?}")))
}
