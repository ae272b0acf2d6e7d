//! Device memory providers and RAII buffers.
//!
//! Every backend reaches its memory through [`DeviceMemory`]. The host provider
//! ([`HostMemory`]) backs the CPU backend and counts live allocations so tests
//! can assert that nothing leaks.

use std::alloc::{self, Layout as AllocLayout};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Arc;

use libc::c_void;
use parking_lot::Mutex;
use tracing::trace;

use crate::tensor::{HostTensor, TensorDesc};
use crate::types::Backend;
use crate::{OpkError, Result};

/// Opaque per-backend execution queue. The host backend runs synchronously and
/// never needs one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamToken(NonNull<c_void>);

impl StreamToken {
    /// # Safety
    /// `raw` must be a stream object valid for the backend it is passed to.
    pub unsafe fn from_raw(raw: NonNull<c_void>) -> Self {
        Self(raw)
    }

    pub fn as_ptr(&self) -> *mut c_void {
        self.0.as_ptr()
    }
}

/// Allocation and transfer primitives of one backend.
pub trait DeviceMemory: Send + Sync {
    fn backend(&self) -> Backend;

    /// Allocate `bytes` zero-filled bytes. `bytes` must be non-zero.
    fn alloc_zeroed(&self, bytes: usize) -> Result<NonNull<c_void>>;

    /// # Safety
    /// `ptr` must come from `alloc_zeroed` on this provider with the same `bytes`.
    unsafe fn free(&self, ptr: NonNull<c_void>, bytes: usize);

    /// # Safety
    /// `dst` must be valid for `src.len()` bytes of writes.
    unsafe fn copy_to_device(&self, dst: NonNull<c_void>, src: &[u8]) -> Result<()>;

    /// # Safety
    /// `src` must be valid for `dst.len()` bytes of reads.
    unsafe fn copy_to_host(&self, dst: &mut [u8], src: NonNull<c_void>) -> Result<()>;

    /// Block until all work queued on `stream` (or the default queue) has finished.
    fn synchronize(&self, stream: Option<&StreamToken>) -> Result<()>;
}

// ── Host provider ───────────────────────────────────────────────────────

const HOST_ALIGN: usize = 64;

/// Host memory provider for the CPU backend.
#[derive(Default)]
pub struct HostMemory {
    live: Mutex<HashMap<usize, usize>>,
}

impl HostMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of allocations not yet freed.
    pub fn live_allocations(&self) -> usize {
        self.live.lock().len()
    }

    pub fn live_bytes(&self) -> usize {
        self.live.lock().values().sum()
    }
}

impl DeviceMemory for HostMemory {
    fn backend(&self) -> Backend {
        Backend::Cpu
    }

    fn alloc_zeroed(&self, bytes: usize) -> Result<NonNull<c_void>> {
        if bytes == 0 {
            return Err(OpkError::InvalidArgument(
                "zero-sized device allocation".into(),
            ));
        }
        let layout = AllocLayout::from_size_align(bytes, HOST_ALIGN)
            .map_err(|_| OpkError::AllocFailed(bytes))?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw.cast::<c_void>()).ok_or(OpkError::AllocFailed(bytes))?;
        self.live.lock().insert(ptr.as_ptr() as usize, bytes);
        trace!(bytes, "host alloc");
        Ok(ptr)
    }

    unsafe fn free(&self, ptr: NonNull<c_void>, bytes: usize) {
        if self.live.lock().remove(&(ptr.as_ptr() as usize)).is_none() {
            tracing::warn!(bytes, "free of unknown host allocation ignored");
            return;
        }
        if let Ok(layout) = AllocLayout::from_size_align(bytes, HOST_ALIGN) {
            unsafe { alloc::dealloc(ptr.as_ptr().cast::<u8>(), layout) };
        }
    }

    unsafe fn copy_to_device(&self, dst: NonNull<c_void>, src: &[u8]) -> Result<()> {
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_ptr().cast::<u8>(), src.len())
        };
        Ok(())
    }

    unsafe fn copy_to_host(&self, dst: &mut [u8], src: NonNull<c_void>) -> Result<()> {
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr().cast::<u8>(), dst.as_mut_ptr(), dst.len())
        };
        Ok(())
    }

    fn synchronize(&self, _stream: Option<&StreamToken>) -> Result<()> {
        Ok(())
    }
}

// ── Buffers ─────────────────────────────────────────────────────────────

/// Owned device allocation, released on drop.
pub struct DeviceBuffer {
    ptr: NonNull<c_void>,
    len: usize,
    memory: Arc<dyn DeviceMemory>,
}

// SAFETY: the buffer exclusively owns its allocation; providers are Send + Sync.
unsafe impl Send for DeviceBuffer {}
unsafe impl Sync for DeviceBuffer {}

impl DeviceBuffer {
    pub fn zeroed(memory: Arc<dyn DeviceMemory>, len: usize) -> Result<Self> {
        let ptr = memory.alloc_zeroed(len)?;
        Ok(Self { ptr, len, memory })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn backend(&self) -> Backend {
        self.memory.backend()
    }

    pub fn as_ptr(&self) -> *const c_void {
        self.ptr.as_ptr()
    }

    pub fn as_mut_ptr(&self) -> *mut c_void {
        self.ptr.as_ptr()
    }

    /// Overwrite the whole buffer from host bytes.
    pub fn write(&mut self, src: &[u8]) -> Result<()> {
        if src.len() != self.len {
            return Err(OpkError::InvalidArgument(format!(
                "write of {} bytes into buffer of {}",
                src.len(),
                self.len
            )));
        }
        // SAFETY: ptr is valid for len bytes and src.len() == len.
        unsafe { self.memory.copy_to_device(self.ptr, src) }
    }

    /// Copy the whole buffer back to the host.
    pub fn read(&self) -> Result<Vec<u8>> {
        self.memory.synchronize(None)?;
        let mut out = vec![0u8; self.len];
        // SAFETY: ptr is valid for len bytes.
        unsafe { self.memory.copy_to_host(&mut out, self.ptr)? };
        Ok(out)
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr/len come from alloc_zeroed on the same provider.
        unsafe { self.memory.free(self.ptr, self.len) };
    }
}

impl std::fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("backend", &self.memory.backend())
            .field("len", &self.len)
            .finish()
    }
}

/// A tensor resident on a backend.
#[derive(Debug)]
pub struct DeviceTensor {
    desc: TensorDesc,
    buffer: DeviceBuffer,
}

impl DeviceTensor {
    /// Allocate device storage for `host` and copy its bytes over.
    pub fn upload(memory: Arc<dyn DeviceMemory>, host: &HostTensor) -> Result<Self> {
        let desc = host.desc().on_backend(memory.backend());
        let mut buffer = DeviceBuffer::zeroed(memory, desc.storage_bytes())?;
        buffer.write(host.bytes())?;
        Ok(Self { desc, buffer })
    }

    /// Reset device contents to `host`, e.g. before rerunning an in-place operator.
    pub fn restore(&mut self, host: &HostTensor) -> Result<()> {
        if host.desc().shape() != self.desc.shape() || host.desc().dtype() != self.desc.dtype() {
            return Err(OpkError::ShapeMismatch {
                expected: self.desc.shape().dims().to_vec(),
                got: host.desc().shape().dims().to_vec(),
            });
        }
        self.buffer.write(host.bytes())
    }

    pub fn download(&self) -> Result<HostTensor> {
        let bytes = self.buffer.read()?;
        HostTensor::from_bytes(self.desc.on_backend(Backend::Cpu), bytes)
    }

    pub fn desc(&self) -> &TensorDesc {
        &self.desc
    }

    pub fn as_ptr(&self) -> *const c_void {
        self.buffer.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut c_void {
        self.buffer.as_mut_ptr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DType, Shape};

    #[test]
    fn test_host_alloc_tracks_live() {
        let host = Arc::new(HostMemory::new());
        let mem: Arc<dyn DeviceMemory> = host.clone();
        {
            let a = DeviceBuffer::zeroed(mem.clone(), 16).unwrap();
            let _b = DeviceBuffer::zeroed(mem.clone(), 8).unwrap();
            assert_eq!(host.live_allocations(), 2);
            assert_eq!(host.live_bytes(), 24);
            assert_eq!(a.read().unwrap(), vec![0u8; 16]);
            assert_eq!(a.as_ptr() as usize % HOST_ALIGN, 0);
        }
        assert_eq!(host.live_allocations(), 0);
    }

    #[test]
    fn test_zero_alloc_rejected() {
        let host = HostMemory::new();
        assert!(host.alloc_zeroed(0).is_err());
    }

    #[test]
    fn test_buffer_write_len_checked() {
        let mem: Arc<dyn DeviceMemory> = Arc::new(HostMemory::new());
        let mut buf = DeviceBuffer::zeroed(mem, 4).unwrap();
        assert!(buf.write(&[1, 2, 3]).is_err());
        buf.write(&[1, 2, 3, 4]).unwrap();
        assert_eq!(buf.read().unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_tensor_upload_restore() {
        let mem: Arc<dyn DeviceMemory> = Arc::new(HostMemory::new());
        let desc = TensorDesc::contiguous(Shape::new([2, 2]), DType::F32, Backend::Cpu).unwrap();
        let host = HostTensor::from_f32(desc, &[1.0, 2.0, 3.0, 4.0]).unwrap();
        let mut dev = DeviceTensor::upload(mem, &host).unwrap();

        // Clobber device memory, then restore.
        let ptr = dev.as_mut_ptr().cast::<f32>();
        unsafe { *ptr = 9.0 };
        assert_eq!(dev.download().unwrap().to_f32()[0], 9.0);
        dev.restore(&host).unwrap();
        assert_eq!(dev.download().unwrap().to_f32(), vec![1.0, 2.0, 3.0, 4.0]);
    }
}
