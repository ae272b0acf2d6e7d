//! Scratch memory handed to an operator execution.

use std::sync::Arc;

use libc::c_void;

use crate::Result;
use crate::memory::{DeviceBuffer, DeviceMemory};
use crate::types::Backend;

/// Device scratch buffer sized from a descriptor's workspace query.
///
/// A zero-byte workspace holds no allocation and passes a null pointer.
#[derive(Debug)]
pub struct Workspace {
    buffer: Option<DeviceBuffer>,
    backend: Backend,
}

impl Workspace {
    pub fn allocate(memory: Arc<dyn DeviceMemory>, bytes: u64) -> Result<Self> {
        let backend = memory.backend();
        let buffer = if bytes == 0 {
            None
        } else {
            Some(DeviceBuffer::zeroed(memory, bytes as usize)?)
        };
        Ok(Self { buffer, backend })
    }

    pub fn empty(backend: Backend) -> Self {
        Self {
            buffer: None,
            backend,
        }
    }

    pub fn as_mut_ptr(&self) -> *mut c_void {
        self.buffer
            .as_ref()
            .map_or(std::ptr::null_mut(), DeviceBuffer::as_mut_ptr)
    }

    pub fn len(&self) -> u64 {
        self.buffer.as_ref().map_or(0, |b| b.len() as u64)
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_none()
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }
}
