//! Generic create → size → execute → destroy protocol shared by all operators.
//!
//! Each operator implements [`OperatorAbi`] to bind its four native entry
//! points. [`OperatorDescriptor`] wraps one operator instance and enforces the
//! lifecycle before anything reaches the native layer.

use std::marker::PhantomData;
use std::ptr::NonNull;

use libc::c_void;
use tracing::{debug, warn};

use crate::handle::{BackendHandle, NativeTensorDesc};
use crate::memory::StreamToken;
use crate::tensor::TensorDesc;
use crate::types::Backend;
use crate::workspace::Workspace;
use crate::{OpkError, Result};

/// A native operator descriptor plus the tensor descriptors it was built from.
///
/// The tensor descriptors are kept alive until the operator descriptor has been
/// destroyed.
#[derive(Debug)]
pub struct NativeOp<R> {
    pub raw: NonNull<R>,
    pub tensors: Vec<NativeTensorDesc>,
}

/// Binding of one operator's native entry points.
pub trait OperatorAbi {
    /// Name used in logs and errors.
    const NAME: &'static str;

    /// Opaque native descriptor type.
    type Raw;

    /// Static configuration consumed by `create`.
    type Config<'a>;

    /// Per-execution buffers.
    type Args<'a>;

    /// Caller-side checks run before `create` reaches the native layer.
    fn validate(_backend: Backend, _config: &Self::Config<'_>) -> Result<()> {
        Ok(())
    }

    /// Descriptors of the buffers in `args`, in the order of
    /// [`NativeOp::tensors`] as returned by `create`.
    fn tensors<'b>(args: &'b Self::Args<'_>) -> Vec<&'b TensorDesc>;

    /// # Safety
    /// `handle` must be live for the duration of the call.
    unsafe fn create(handle: &BackendHandle, config: &Self::Config<'_>) -> Result<NativeOp<Self::Raw>>;

    /// # Safety
    /// `raw` must be a live descriptor returned by `create`.
    unsafe fn workspace_size(raw: NonNull<Self::Raw>) -> Result<u64>;

    /// # Safety
    /// `raw` must be live and every buffer in `args` must match the tensor
    /// descriptors the operator was created with.
    unsafe fn execute(
        raw: NonNull<Self::Raw>,
        workspace: &Workspace,
        args: Self::Args<'_>,
        stream: *mut c_void,
    ) -> Result<()>;

    /// # Safety
    /// `raw` must be live; it is invalid afterwards.
    unsafe fn destroy(raw: NonNull<Self::Raw>) -> Result<()>;
}

/// Lifecycle state of an [`OperatorDescriptor`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescriptorState {
    Uncreated,
    Created,
    Sized { workspace: u64 },
    Destroyed,
}

impl std::fmt::Display for DescriptorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DescriptorState::Uncreated => f.write_str("uncreated"),
            DescriptorState::Created => f.write_str("created"),
            DescriptorState::Sized { workspace } => write!(f, "sized({workspace} bytes)"),
            DescriptorState::Destroyed => f.write_str("destroyed"),
        }
    }
}

/// One operator instance driven through the native protocol.
pub struct OperatorDescriptor<Op: OperatorAbi> {
    state: DescriptorState,
    native: Option<NativeOp<Op::Raw>>,
    backend: Option<Backend>,
    executions: u64,
    _op: PhantomData<Op>,
}

impl<Op: OperatorAbi> Default for OperatorDescriptor<Op> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Op: OperatorAbi> OperatorDescriptor<Op> {
    pub fn new() -> Self {
        Self {
            state: DescriptorState::Uncreated,
            native: None,
            backend: None,
            executions: 0,
            _op: PhantomData,
        }
    }

    pub fn state(&self) -> DescriptorState {
        self.state
    }

    /// Backend inherited from the handle at creation.
    pub fn backend(&self) -> Option<Backend> {
        self.backend
    }

    pub fn executions(&self) -> u64 {
        self.executions
    }

    pub fn create(&mut self, handle: &BackendHandle, config: &Op::Config<'_>) -> Result<()> {
        self.expect_state("create", |s| s == DescriptorState::Uncreated)?;
        Op::validate(handle.backend(), config)?;
        let native = unsafe { Op::create(handle, config)? };
        debug!(op = Op::NAME, backend = %handle.backend(), "descriptor created");
        self.native = Some(native);
        self.backend = Some(handle.backend());
        self.state = DescriptorState::Created;
        Ok(())
    }

    /// Query the scratch size. Repeated queries must agree.
    pub fn query_workspace_size(&mut self) -> Result<u64> {
        let raw = self.live_raw("query_workspace_size")?;
        let size = unsafe { Op::workspace_size(raw)? };
        if let DescriptorState::Sized { workspace } = self.state {
            if workspace != size {
                return Err(OpkError::WorkspaceDrift {
                    first: workspace,
                    now: size,
                });
            }
        }
        self.state = DescriptorState::Sized { workspace: size };
        Ok(size)
    }

    /// Run the operator once. Outputs are overwritten in place.
    pub fn execute(
        &mut self,
        workspace: &Workspace,
        args: Op::Args<'_>,
        stream: Option<&StreamToken>,
    ) -> Result<()> {
        let raw = self.live_raw("execute")?;
        self.ensure_bound(&args)?;
        let required = match self.state {
            DescriptorState::Sized { workspace } => workspace,
            _ => self.query_workspace_size()?,
        };
        if let Some(backend) = self.backend {
            if workspace.backend() != backend {
                return Err(OpkError::BackendMismatch {
                    expected: backend,
                    got: workspace.backend(),
                });
            }
        }
        if workspace.len() < required {
            return Err(OpkError::InsufficientWorkspace {
                required,
                provided: workspace.len(),
            });
        }
        let stream = stream.map_or(std::ptr::null_mut(), StreamToken::as_ptr);
        unsafe { Op::execute(raw, workspace, args, stream)? };
        self.executions += 1;
        Ok(())
    }

    /// Release the native descriptor. Any later call is rejected.
    pub fn destroy(&mut self) -> Result<()> {
        self.live_raw("destroy")?;
        self.state = DescriptorState::Destroyed;
        let Some(native) = self.native.take() else {
            return Ok(());
        };
        let result = unsafe { Op::destroy(native.raw) };
        drop(native.tensors);
        debug!(op = Op::NAME, executions = self.executions, "descriptor destroyed");
        result
    }

    /// Buffers must match the tensor descriptors bound at `create`; the
    /// native kernel trusts them for every offset it computes.
    fn ensure_bound(&self, args: &Op::Args<'_>) -> Result<()> {
        let Some(native) = self.native.as_ref() else {
            return Err(OpkError::InvalidState {
                call: "execute",
                state: self.state,
            });
        };
        let given = Op::tensors(args);
        if given.len() != native.tensors.len() {
            return Err(OpkError::InvalidArgument(format!(
                "{} was created with {} tensors, got {}",
                Op::NAME,
                native.tensors.len(),
                given.len()
            )));
        }
        for (i, (bound, got)) in native.tensors.iter().map(|t| t.desc()).zip(given).enumerate() {
            if bound.shape() != got.shape() {
                return Err(OpkError::ShapeMismatch {
                    expected: bound.shape().dims().to_vec(),
                    got: got.shape().dims().to_vec(),
                });
            }
            if bound.dtype() != got.dtype() || bound.strides() != got.strides() {
                return Err(OpkError::InvalidArgument(format!(
                    "{} tensor {i}: bound as {} {:?}, got {} {:?}",
                    Op::NAME,
                    bound.dtype(),
                    bound.strides().as_slice(),
                    got.dtype(),
                    got.strides().as_slice()
                )));
            }
        }
        Ok(())
    }

    fn live_raw(&self, call: &'static str) -> Result<NonNull<Op::Raw>> {
        self.expect_state(call, |s| {
            matches!(s, DescriptorState::Created | DescriptorState::Sized { .. })
        })?;
        self.native
            .as_ref()
            .map(|n| n.raw)
            .ok_or(OpkError::InvalidState {
                call,
                state: self.state,
            })
    }

    fn expect_state(
        &self,
        call: &'static str,
        allowed: impl Fn(DescriptorState) -> bool,
    ) -> Result<()> {
        if allowed(self.state) {
            Ok(())
        } else {
            Err(OpkError::InvalidState {
                call,
                state: self.state,
            })
        }
    }
}

impl<Op: OperatorAbi> Drop for OperatorDescriptor<Op> {
    fn drop(&mut self) {
        if self.native.is_some() {
            if let Err(e) = self.destroy() {
                warn!(op = Op::NAME, error = %e, "failed to destroy descriptor on drop");
            }
        }
    }
}

impl<Op: OperatorAbi> std::fmt::Debug for OperatorDescriptor<Op> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatorDescriptor")
            .field("op", &Op::NAME)
            .field("state", &self.state)
            .field("backend", &self.backend)
            .field("executions", &self.executions)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;
    use std::sync::Arc;

    use crate::memory::{DeviceMemory, HostMemory};

    /// Native-side state of the fake operator.
    struct FakeRaw {
        sizes: Vec<u64>,
        queries: Cell<usize>,
        log: Rc<Cell<(u32, u32)>>,
    }

    struct FakeConfig {
        sizes: Vec<u64>,
        log: Rc<Cell<(u32, u32)>>,
    }

    /// Counts executions and destroys through `log` as (executes, destroys).
    struct FakeOp;

    impl OperatorAbi for FakeOp {
        const NAME: &'static str = "fake";
        type Raw = FakeRaw;
        type Config<'a> = FakeConfig;
        type Args<'a> = ();

        fn tensors<'b>(_args: &'b ()) -> Vec<&'b TensorDesc> {
            Vec::new()
        }

        unsafe fn create(_handle: &BackendHandle, config: &FakeConfig) -> Result<NativeOp<FakeRaw>> {
            let raw = Box::new(FakeRaw {
                sizes: config.sizes.clone(),
                queries: Cell::new(0),
                log: config.log.clone(),
            });
            Ok(NativeOp {
                raw: NonNull::from(Box::leak(raw)),
                tensors: Vec::new(),
            })
        }

        unsafe fn workspace_size(raw: NonNull<FakeRaw>) -> Result<u64> {
            let raw = unsafe { raw.as_ref() };
            let i = raw.queries.get();
            raw.queries.set(i + 1);
            Ok(raw.sizes[i.min(raw.sizes.len() - 1)])
        }

        unsafe fn execute(
            raw: NonNull<FakeRaw>,
            _workspace: &Workspace,
            _args: (),
            _stream: *mut c_void,
        ) -> Result<()> {
            let raw = unsafe { raw.as_ref() };
            let (e, d) = raw.log.get();
            raw.log.set((e + 1, d));
            Ok(())
        }

        unsafe fn destroy(raw: NonNull<FakeRaw>) -> Result<()> {
            let raw = unsafe { Box::from_raw(raw.as_ptr()) };
            let (e, d) = raw.log.get();
            raw.log.set((e, d + 1));
            Ok(())
        }
    }

    fn setup(sizes: &[u64]) -> (BackendHandle, FakeConfig, Rc<Cell<(u32, u32)>>) {
        let log = Rc::new(Cell::new((0, 0)));
        let config = FakeConfig {
            sizes: sizes.to_vec(),
            log: log.clone(),
        };
        (BackendHandle::open(Backend::Cpu, 0).unwrap(), config, log)
    }

    #[test]
    fn test_full_lifecycle() {
        let (handle, config, log) = setup(&[0]);
        let mut desc = OperatorDescriptor::<FakeOp>::new();
        assert_eq!(desc.state(), DescriptorState::Uncreated);
        desc.create(&handle, &config).unwrap();
        assert_eq!(desc.backend(), Some(Backend::Cpu));
        assert_eq!(desc.query_workspace_size().unwrap(), 0);
        assert_eq!(desc.query_workspace_size().unwrap(), 0);
        let ws = Workspace::empty(Backend::Cpu);
        for _ in 0..3 {
            desc.execute(&ws, (), None).unwrap();
        }
        assert_eq!(desc.executions(), 3);
        desc.destroy().unwrap();
        assert_eq!(desc.state(), DescriptorState::Destroyed);
        assert_eq!(log.get(), (3, 1));
    }

    #[test]
    fn test_execute_before_create_rejected() {
        let mut desc = OperatorDescriptor::<FakeOp>::new();
        let err = desc
            .execute(&Workspace::empty(Backend::Cpu), (), None)
            .unwrap_err();
        assert!(matches!(
            err,
            OpkError::InvalidState {
                call: "execute",
                state: DescriptorState::Uncreated
            }
        ));
    }

    #[test]
    fn test_calls_after_destroy_rejected() {
        let (handle, config, log) = setup(&[0]);
        let mut desc = OperatorDescriptor::<FakeOp>::new();
        desc.create(&handle, &config).unwrap();
        desc.destroy().unwrap();
        let ws = Workspace::empty(Backend::Cpu);
        assert!(matches!(
            desc.execute(&ws, (), None),
            Err(OpkError::InvalidState { call: "execute", .. })
        ));
        assert!(matches!(
            desc.query_workspace_size(),
            Err(OpkError::InvalidState { .. })
        ));
        assert!(matches!(
            desc.destroy(),
            Err(OpkError::InvalidState { call: "destroy", .. })
        ));
        assert!(matches!(
            desc.create(&handle, &config),
            Err(OpkError::InvalidState { call: "create", .. })
        ));
        drop(desc);
        assert_eq!(log.get(), (0, 1));
    }

    #[test]
    fn test_drop_destroys_live_descriptor() {
        let (handle, config, log) = setup(&[0]);
        {
            let mut desc = OperatorDescriptor::<FakeOp>::new();
            desc.create(&handle, &config).unwrap();
        }
        assert_eq!(log.get(), (0, 1));
    }

    #[test]
    fn test_workspace_drift_detected() {
        let (handle, config, _log) = setup(&[16, 32]);
        let mut desc = OperatorDescriptor::<FakeOp>::new();
        desc.create(&handle, &config).unwrap();
        assert_eq!(desc.query_workspace_size().unwrap(), 16);
        assert!(matches!(
            desc.query_workspace_size(),
            Err(OpkError::WorkspaceDrift { first: 16, now: 32 })
        ));
    }

    #[test]
    fn test_workspace_checked_before_execute() {
        let (handle, config, log) = setup(&[64]);
        let mem: Arc<dyn DeviceMemory> = Arc::new(HostMemory::new());
        let mut desc = OperatorDescriptor::<FakeOp>::new();
        desc.create(&handle, &config).unwrap();

        let small = Workspace::allocate(mem.clone(), 32).unwrap();
        assert!(matches!(
            desc.execute(&small, (), None),
            Err(OpkError::InsufficientWorkspace {
                required: 64,
                provided: 32
            })
        ));
        let foreign = Workspace::empty(Backend::Cuda);
        assert!(matches!(
            desc.execute(&foreign, (), None),
            Err(OpkError::BackendMismatch { .. })
        ));
        let ws = Workspace::allocate(mem, 64).unwrap();
        desc.execute(&ws, (), None).unwrap();
        assert_eq!(log.get().0, 1);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(
            DescriptorState::Sized { workspace: 8 }.to_string(),
            "sized(8 bytes)"
        );
    }
}
