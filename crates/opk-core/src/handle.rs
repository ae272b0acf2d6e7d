//! RAII wrappers over native handles and tensor descriptors.

use std::ptr::{self, NonNull};

use opk_sys as sys;
use tracing::{debug, info, warn};

use crate::tensor::TensorDesc;
use crate::types::Backend;
use crate::{OpkError, Result, check_status};

/// An open per-device context. Released on drop.
#[derive(Debug)]
pub struct BackendHandle {
    raw: NonNull<sys::opk_handle_t>,
    backend: Backend,
    device_id: i32,
}

impl BackendHandle {
    pub fn open(backend: Backend, device_id: i32) -> Result<Self> {
        let mut raw = ptr::null_mut();
        let status = unsafe { sys::opk_create_handle(&mut raw, backend.to_sys(), device_id) };
        if status == sys::OPK_STATUS_BAD_DEVICE {
            return Err(OpkError::BackendUnavailable(backend));
        }
        check_status("opk_create_handle", status)?;
        let raw = NonNull::new(raw).ok_or(OpkError::NullPtr("opk_create_handle"))?;
        info!(%backend, device_id, "opened backend handle");
        Ok(Self {
            raw,
            backend,
            device_id,
        })
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn device_id(&self) -> i32 {
        self.device_id
    }

    pub fn as_raw(&self) -> *mut sys::opk_handle_t {
        self.raw.as_ptr()
    }
}

impl Drop for BackendHandle {
    fn drop(&mut self) {
        let status = unsafe { sys::opk_destroy_handle(self.raw.as_ptr()) };
        if let Err(e) = check_status("opk_destroy_handle", status) {
            warn!(backend = %self.backend, error = %e, "failed to release backend handle");
        } else {
            debug!(backend = %self.backend, "released backend handle");
        }
    }
}

/// Native tensor descriptor built from a [`TensorDesc`]. Released on drop.
///
/// Keeps the descriptor it was built from so later buffers can be checked
/// against it.
#[derive(Debug)]
pub struct NativeTensorDesc {
    raw: NonNull<sys::opk_tensor_desc_t>,
    desc: TensorDesc,
}

impl NativeTensorDesc {
    pub fn new(desc: &TensorDesc) -> Result<Self> {
        let shape: Vec<u64> = desc.shape().dims().iter().map(|&d| d as u64).collect();
        let strides: Vec<i64> = desc.strides().iter().map(|&s| s as i64).collect();
        let mut raw = ptr::null_mut();
        let status = unsafe {
            sys::opk_create_tensor_descriptor(
                &mut raw,
                shape.len() as u64,
                shape.as_ptr(),
                strides.as_ptr(),
                desc.dtype().to_sys(),
            )
        };
        check_status("opk_create_tensor_descriptor", status)?;
        let raw = NonNull::new(raw).ok_or(OpkError::NullPtr("opk_create_tensor_descriptor"))?;
        Ok(Self {
            raw,
            desc: desc.clone(),
        })
    }

    /// Layout the native descriptor was built with.
    pub fn desc(&self) -> &TensorDesc {
        &self.desc
    }

    pub fn as_raw(&self) -> *mut sys::opk_tensor_desc_t {
        self.raw.as_ptr()
    }
}

impl Drop for NativeTensorDesc {
    fn drop(&mut self) {
        let status = unsafe { sys::opk_destroy_tensor_descriptor(self.raw.as_ptr()) };
        if let Err(e) = check_status("opk_destroy_tensor_descriptor", status) {
            warn!(error = %e, "failed to release tensor descriptor");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DType, Shape};

    #[test]
    fn test_open_cpu() {
        let h = BackendHandle::open(Backend::Cpu, 0).unwrap();
        assert_eq!(h.backend(), Backend::Cpu);
        assert!(!h.as_raw().is_null());
    }

    #[test]
    fn test_accelerator_unavailable() {
        let err = BackendHandle::open(Backend::Cuda, 0).unwrap_err();
        assert!(matches!(err, OpkError::BackendUnavailable(Backend::Cuda)));
    }

    #[test]
    fn test_native_tensor_desc() {
        let d = TensorDesc::strided(
            Shape::new([3, 32, 128]),
            &[8000, 200, 1],
            DType::F16,
            Backend::Cpu,
        )
        .unwrap();
        let native = NativeTensorDesc::new(&d).unwrap();
        assert!(!native.as_raw().is_null());
        assert_eq!(native.desc(), &d);
    }
}
