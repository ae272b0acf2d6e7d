//! Backend-agnostic plumbing for driving the opk operator ABI.
//!
//! `opk-core` provides the tensor metadata types (`DType`, `Shape`,
//! `TensorDesc`), host and device storage, the per-backend `BackendHandle`,
//! the generic `OperatorDescriptor` lifecycle, and scoped `Workspace` buffers.
//!
//! # Backends
//!
//! Device memory is reached through the [`memory::DeviceMemory`] trait. The
//! default [`registry::ProviderRegistry`] only knows the host (CPU) provider;
//! accelerator providers are registered by the embedding application.

pub mod handle;
pub mod memory;
pub mod protocol;
pub mod registry;
pub mod tensor;
pub mod types;
pub mod workspace;

pub use handle::{BackendHandle, NativeTensorDesc};
pub use memory::{DeviceBuffer, DeviceMemory, DeviceTensor, HostMemory, StreamToken};
pub use protocol::{DescriptorState, NativeOp, OperatorAbi, OperatorDescriptor};
pub use registry::ProviderRegistry;
pub use tensor::{HostTensor, Layout, TensorDesc};
pub use types::{Backend, DType, Shape};
pub use workspace::Workspace;

pub type Result<T> = std::result::Result<T, OpkError>;

#[derive(thiserror::Error, Debug)]
pub enum OpkError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },

    #[error("{call} returned status {status} ({name})")]
    Native {
        call: &'static str,
        status: i32,
        name: &'static str,
    },

    #[error("{call} is not allowed on a descriptor in state {state}")]
    InvalidState {
        call: &'static str,
        state: DescriptorState,
    },

    #[error("workspace size changed between queries: {first} then {now}")]
    WorkspaceDrift { first: u64, now: u64 },

    #[error("workspace of {provided} bytes is smaller than the required {required}")]
    InsufficientWorkspace { required: u64, provided: u64 },

    #[error("Backend not available: {0}")]
    BackendUnavailable(Backend),

    #[error("Backend mismatch: expected {expected}, got {got}")]
    BackendMismatch { expected: Backend, got: Backend },

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("{0} returned null pointer")]
    NullPtr(&'static str),

    #[error("allocation of {0} bytes failed")]
    AllocFailed(usize),
}

/// How the harness must react to an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller-side mistake caught before the native layer; only the current case fails.
    Precondition,
    /// Native or lifecycle failure; nothing more may run on that backend.
    Fatal,
    /// No reference formula or capability for the configuration; a skip.
    Unsupported,
}

impl OpkError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OpkError::InvalidArgument(_)
            | OpkError::ShapeMismatch { .. }
            | OpkError::InsufficientWorkspace { .. }
            | OpkError::BackendMismatch { .. } => ErrorKind::Precondition,
            OpkError::Unsupported(_) => ErrorKind::Unsupported,
            OpkError::Native { .. }
            | OpkError::InvalidState { .. }
            | OpkError::WorkspaceDrift { .. }
            | OpkError::BackendUnavailable(_)
            | OpkError::NullPtr(_)
            | OpkError::AllocFailed(_) => ErrorKind::Fatal,
        }
    }
}

/// Map a native status to `Ok(())` or [`OpkError::Native`].
pub fn check_status(call: &'static str, status: opk_sys::opk_status_t) -> Result<()> {
    if status == opk_sys::OPK_STATUS_SUCCESS {
        Ok(())
    } else {
        Err(OpkError::Native {
            call,
            status,
            name: opk_sys::status_name(status),
        })
    }
}
