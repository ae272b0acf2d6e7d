//! Rotary position embedding bound to the `opk_*rope*` entry points.
//!
//! The operator rotates `t` in place, reading angles from sine and cosine
//! tables indexed by the position ids.

use std::ptr::{self, NonNull};

use libc::c_void;
use opk_core::{
    Backend, BackendHandle, DType, DeviceTensor, NativeOp, NativeTensorDesc, OperatorAbi,
    OpkError, Result, TensorDesc, Workspace, check_status,
};
use opk_sys as sys;
use tracing::debug;

use crate::avg_pool::ensure_backend;

/// Rotary embedding operator.
pub struct Rope;

#[derive(Clone, Copy, Debug)]
pub struct RopeConfig<'a> {
    pub t: &'a TensorDesc,
    pub pos: &'a TensorDesc,
    pub sin: &'a TensorDesc,
    pub cos: &'a TensorDesc,
}

pub struct RopeArgs<'a> {
    pub t: &'a mut DeviceTensor,
    pub pos: &'a DeviceTensor,
    pub sin: &'a DeviceTensor,
    pub cos: &'a DeviceTensor,
}

impl OperatorAbi for Rope {
    const NAME: &'static str = "rope";
    type Raw = sys::opk_rope_desc_t;
    type Config<'a> = RopeConfig<'a>;
    type Args<'a> = RopeArgs<'a>;

    fn validate(backend: Backend, config: &RopeConfig<'_>) -> Result<()> {
        let &[seq, _, dim] = config.t.shape().dims() else {
            return Err(OpkError::InvalidArgument(format!(
                "rotary embedding expects (seq, heads, dim), got {}",
                config.t.shape()
            )));
        };
        if dim % 2 != 0 {
            return Err(OpkError::InvalidArgument(format!(
                "rotary embedding needs an even last dim, got {dim}"
            )));
        }
        if config.pos.shape().dims() != [seq] {
            return Err(OpkError::ShapeMismatch {
                expected: vec![seq],
                got: config.pos.shape().dims().to_vec(),
            });
        }
        if !matches!(config.pos.dtype(), DType::U64 | DType::I64 | DType::I32) {
            return Err(OpkError::InvalidArgument(format!(
                "position ids must be integers, got {}",
                config.pos.dtype()
            )));
        }
        for table in [config.sin, config.cos] {
            let dims = table.shape().dims();
            if dims.len() != 2 || dims[1] != dim {
                return Err(OpkError::ShapeMismatch {
                    expected: vec![dims.first().copied().unwrap_or(0), dim],
                    got: dims.to_vec(),
                });
            }
        }
        if config.sin.shape() != config.cos.shape() {
            return Err(OpkError::ShapeMismatch {
                expected: config.sin.shape().dims().to_vec(),
                got: config.cos.shape().dims().to_vec(),
            });
        }
        for desc in [config.t, config.pos, config.sin, config.cos] {
            ensure_backend(backend, desc.backend())?;
        }
        Ok(())
    }

    fn tensors<'b>(args: &'b RopeArgs<'_>) -> Vec<&'b TensorDesc> {
        vec![args.t.desc(), args.pos.desc(), args.sin.desc(), args.cos.desc()]
    }

    unsafe fn create(handle: &BackendHandle, config: &RopeConfig<'_>) -> Result<NativeOp<Self::Raw>> {
        debug!(
            t = %config.t.shape(),
            table = %config.sin.shape(),
            table_dtype = %config.sin.dtype(),
            "creating rope descriptor"
        );
        let t = NativeTensorDesc::new(config.t)?;
        let pos = NativeTensorDesc::new(config.pos)?;
        let sin = NativeTensorDesc::new(config.sin)?;
        let cos = NativeTensorDesc::new(config.cos)?;
        let mut raw = ptr::null_mut();
        let status = unsafe {
            sys::opk_create_rope_descriptor(
                handle.as_raw(),
                &mut raw,
                t.as_raw(),
                pos.as_raw(),
                sin.as_raw(),
                cos.as_raw(),
            )
        };
        check_status("opk_create_rope_descriptor", status)?;
        let raw = NonNull::new(raw).ok_or(OpkError::NullPtr("opk_create_rope_descriptor"))?;
        Ok(NativeOp {
            raw,
            tensors: vec![t, pos, sin, cos],
        })
    }

    unsafe fn workspace_size(raw: NonNull<Self::Raw>) -> Result<u64> {
        let mut size = 0u64;
        let status = unsafe { sys::opk_get_rope_workspace_size(raw.as_ptr(), &mut size) };
        check_status("opk_get_rope_workspace_size", status)?;
        Ok(size)
    }

    unsafe fn execute(
        raw: NonNull<Self::Raw>,
        workspace: &Workspace,
        args: RopeArgs<'_>,
        stream: *mut c_void,
    ) -> Result<()> {
        for desc in [args.t.desc(), args.pos.desc(), args.sin.desc(), args.cos.desc()] {
            ensure_backend(workspace.backend(), desc.backend())?;
        }
        let status = unsafe {
            sys::opk_rope(
                raw.as_ptr(),
                workspace.as_mut_ptr(),
                workspace.len(),
                args.t.as_mut_ptr(),
                args.pos.as_ptr(),
                args.sin.as_ptr(),
                args.cos.as_ptr(),
                stream,
            )
        };
        check_status("opk_rope", status)
    }

    unsafe fn destroy(raw: NonNull<Self::Raw>) -> Result<()> {
        let status = unsafe { sys::opk_destroy_rope_descriptor(raw.as_ptr()) };
        check_status("opk_destroy_rope_descriptor", status)
    }
}
