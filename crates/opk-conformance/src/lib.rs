//! Conformance testing of opk operators against a host reference.
//!
//! Each case builds inputs deterministically, computes the expected output with
//! [`opk_ops::oracle`], drives the native operator through the descriptor
//! protocol and checks element-wise closeness with [`compare`].

pub mod cases;
pub mod compare;
pub mod config;
pub mod data;
pub mod harness;
pub mod report;
mod runner;

pub use cases::{Operator, PoolCase, RopeCase, TableDtype, TestCase, default_matrix, skip_reason};
pub use compare::{Mismatch, Tolerance, assert_allclose, compare};
pub use config::{HarnessConfig, OpFilter, ProfileConfig};
pub use data::{InputFill, gen_data, gen_uniform};
pub use harness::Harness;
pub use report::{BackendReport, BackendStatus, CaseReport, Outcome, RunReport, Summary, Timing};
