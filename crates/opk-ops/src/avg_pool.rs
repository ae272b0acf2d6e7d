//! Average pooling bound to the `opk_*avg_pool*` entry points.

use std::ptr::{self, NonNull};

use libc::c_void;
use opk_core::{
    Backend, BackendHandle, DeviceTensor, NativeOp, NativeTensorDesc, OperatorAbi, OpkError,
    Result, TensorDesc, Workspace, check_status,
};
use opk_sys as sys;
use tracing::debug;

use crate::shape_inference::{PoolParams, pool_output_shape};

/// Average pooling operator.
pub struct AvgPool;

/// Static configuration: output and input descriptors plus window parameters.
#[derive(Clone, Copy, Debug)]
pub struct AvgPoolConfig<'a> {
    pub y: &'a TensorDesc,
    pub x: &'a TensorDesc,
    pub params: &'a PoolParams,
}

/// Buffers for one execution.
pub struct AvgPoolArgs<'a> {
    pub y: &'a mut DeviceTensor,
    pub x: &'a DeviceTensor,
}

impl OperatorAbi for AvgPool {
    const NAME: &'static str = "avg_pool";
    type Raw = sys::opk_avg_pool_desc_t;
    type Config<'a> = AvgPoolConfig<'a>;
    type Args<'a> = AvgPoolArgs<'a>;

    fn validate(backend: Backend, config: &AvgPoolConfig<'_>) -> Result<()> {
        let expected = pool_output_shape(config.x.shape(), config.params)?;
        if &expected != config.y.shape() {
            return Err(OpkError::ShapeMismatch {
                expected: expected.dims().to_vec(),
                got: config.y.shape().dims().to_vec(),
            });
        }
        if config.x.dtype() != config.y.dtype() {
            return Err(OpkError::InvalidArgument(format!(
                "pooling input is {} but output is {}",
                config.x.dtype(),
                config.y.dtype()
            )));
        }
        for desc in [config.x, config.y] {
            ensure_backend(backend, desc.backend())?;
        }
        Ok(())
    }

    fn tensors<'b>(args: &'b AvgPoolArgs<'_>) -> Vec<&'b TensorDesc> {
        vec![args.y.desc(), args.x.desc()]
    }

    unsafe fn create(
        handle: &BackendHandle,
        config: &AvgPoolConfig<'_>,
    ) -> Result<NativeOp<Self::Raw>> {
        debug!(
            x = %config.x.shape(),
            y = %config.y.shape(),
            kernel = ?config.params.kernel.as_slice(),
            "creating avg_pool descriptor"
        );
        let y = NativeTensorDesc::new(config.y)?;
        let x = NativeTensorDesc::new(config.x)?;
        let [kernel, pads, strides] = config.params.as_i64();
        let mut raw = ptr::null_mut();
        let status = unsafe {
            sys::opk_create_avg_pool_descriptor(
                handle.as_raw(),
                &mut raw,
                y.as_raw(),
                x.as_raw(),
                kernel.as_ptr(),
                pads.as_ptr(),
                strides.as_ptr(),
                kernel.len() as u64,
            )
        };
        check_status("opk_create_avg_pool_descriptor", status)?;
        let raw = NonNull::new(raw).ok_or(OpkError::NullPtr("opk_create_avg_pool_descriptor"))?;
        Ok(NativeOp {
            raw,
            tensors: vec![y, x],
        })
    }

    unsafe fn workspace_size(raw: NonNull<Self::Raw>) -> Result<u64> {
        let mut size = 0u64;
        let status = unsafe { sys::opk_get_avg_pool_workspace_size(raw.as_ptr(), &mut size) };
        check_status("opk_get_avg_pool_workspace_size", status)?;
        Ok(size)
    }

    unsafe fn execute(
        raw: NonNull<Self::Raw>,
        workspace: &Workspace,
        args: AvgPoolArgs<'_>,
        stream: *mut c_void,
    ) -> Result<()> {
        for desc in [args.x.desc(), args.y.desc()] {
            ensure_backend(workspace.backend(), desc.backend())?;
        }
        let status = unsafe {
            sys::opk_avg_pool(
                raw.as_ptr(),
                workspace.as_mut_ptr(),
                workspace.len(),
                args.y.as_mut_ptr(),
                args.x.as_ptr(),
                stream,
            )
        };
        check_status("opk_avg_pool", status)
    }

    unsafe fn destroy(raw: NonNull<Self::Raw>) -> Result<()> {
        let status = unsafe { sys::opk_destroy_avg_pool_descriptor(raw.as_ptr()) };
        check_status("opk_destroy_avg_pool_descriptor", status)
    }
}

pub(crate) fn ensure_backend(expected: Backend, got: Backend) -> Result<()> {
    if expected == got {
        Ok(())
    } else {
        Err(OpkError::BackendMismatch { expected, got })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opk_core::{DType, Shape};

    fn desc(dims: &[usize], dtype: DType) -> TensorDesc {
        TensorDesc::contiguous(Shape::new(dims), dtype, Backend::Cpu).unwrap()
    }

    #[test]
    fn test_validate_rejects_wrong_output() {
        let params = PoolParams::new(&[2, 2], &[1, 1], &[1, 1]);
        let x = desc(&[1, 1, 2, 2], DType::F32);
        let y = desc(&[1, 1, 2, 2], DType::F32);
        let config = AvgPoolConfig {
            y: &y,
            x: &x,
            params: &params,
        };
        assert!(matches!(
            AvgPool::validate(Backend::Cpu, &config),
            Err(OpkError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_dtype_mix() {
        let params = PoolParams::new(&[2, 2], &[1, 1], &[1, 1]);
        let x = desc(&[1, 1, 2, 2], DType::F32);
        let y = desc(&[1, 1, 3, 3], DType::F16);
        let config = AvgPoolConfig {
            y: &y,
            x: &x,
            params: &params,
        };
        assert!(matches!(
            AvgPool::validate(Backend::Cpu, &config),
            Err(OpkError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_validate_rejects_foreign_tensor() {
        let params = PoolParams::new(&[3], &[1], &[1]);
        let x = desc(&[1, 1, 10], DType::F32);
        let y = desc(&[1, 1, 10], DType::F32).on_backend(Backend::Cuda);
        let config = AvgPoolConfig {
            y: &y,
            x: &x,
            params: &params,
        };
        assert!(matches!(
            AvgPool::validate(Backend::Cpu, &config),
            Err(OpkError::BackendMismatch { .. })
        ));
    }
}
