//! Operators driven through the opk protocol.
//!
//! Shape inference and the reference oracle are pure functions over host
//! values; the bindings plug average pooling and rotary embedding into the
//! generic [`opk_core::OperatorDescriptor`].

pub mod avg_pool;
pub mod oracle;
pub mod rotary_embedding;
pub mod shape_inference;

pub use avg_pool::{AvgPool, AvgPoolArgs, AvgPoolConfig};
pub use rotary_embedding::{Rope, RopeArgs, RopeConfig};
pub use shape_inference::{PoolParams, ShapeError, pool_output_shape};
