//! C ABI for the opk tensor-operator library.
//!
//! Every operator follows the same four-call pattern:
//! `opk_create_<op>_descriptor`, `opk_get_<op>_workspace_size`, `opk_<op>` and
//! `opk_destroy_<op>_descriptor`, each returning an [`opk_status_t`].
//!
//! With the default `native` feature the entry points are implemented in pure
//! Rust for the CPU device. With the `link` feature they are resolved against
//! an external `libopk` at link time.

#![allow(non_camel_case_types)]

#[cfg(all(feature = "native", feature = "link"))]
compile_error!("features `native` and `link` are mutually exclusive");

use libc::c_int;
#[cfg(feature = "link")]
use libc::c_void;

// ── Status codes ────────────────────────────────────────────────────────

/// Integer status returned by every entry point. Zero is success.
pub type opk_status_t = c_int;

pub const OPK_STATUS_SUCCESS: opk_status_t = 0;
pub const OPK_STATUS_EXECUTION_FAILED: opk_status_t = 1;
pub const OPK_STATUS_BAD_PARAM: opk_status_t = 2;
pub const OPK_STATUS_BAD_TENSOR_DTYPE: opk_status_t = 3;
pub const OPK_STATUS_BAD_TENSOR_SHAPE: opk_status_t = 4;
pub const OPK_STATUS_BAD_TENSOR_STRIDES: opk_status_t = 5;
pub const OPK_STATUS_MEMORY_NOT_ALLOCATED: opk_status_t = 6;
pub const OPK_STATUS_INSUFFICIENT_WORKSPACE: opk_status_t = 7;
pub const OPK_STATUS_BAD_DEVICE: opk_status_t = 8;

/// Human-readable name of a status code, for diagnostics.
pub fn status_name(status: opk_status_t) -> &'static str {
    match status {
        OPK_STATUS_SUCCESS => "SUCCESS",
        OPK_STATUS_EXECUTION_FAILED => "EXECUTION_FAILED",
        OPK_STATUS_BAD_PARAM => "BAD_PARAM",
        OPK_STATUS_BAD_TENSOR_DTYPE => "BAD_TENSOR_DTYPE",
        OPK_STATUS_BAD_TENSOR_SHAPE => "BAD_TENSOR_SHAPE",
        OPK_STATUS_BAD_TENSOR_STRIDES => "BAD_TENSOR_STRIDES",
        OPK_STATUS_MEMORY_NOT_ALLOCATED => "MEMORY_NOT_ALLOCATED",
        OPK_STATUS_INSUFFICIENT_WORKSPACE => "INSUFFICIENT_WORKSPACE",
        OPK_STATUS_BAD_DEVICE => "BAD_DEVICE",
        _ => "UNKNOWN",
    }
}

// ── Opaque handle types ─────────────────────────────────────────────────

/// Opaque per-device context.
#[repr(C)]
pub struct opk_handle_t {
    _private: [u8; 0],
}

/// Opaque tensor metadata (shape, strides, dtype). Owns no storage.
#[repr(C)]
pub struct opk_tensor_desc_t {
    _private: [u8; 0],
}

/// Opaque average-pooling descriptor.
#[repr(C)]
pub struct opk_avg_pool_desc_t {
    _private: [u8; 0],
}

/// Opaque rotary-embedding descriptor.
#[repr(C)]
pub struct opk_rope_desc_t {
    _private: [u8; 0],
}

/// Compute device classes.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum opk_device_t {
    Cpu = 0,
    NvGpu = 1,
    CambriconMlu = 2,
    AscendNpu = 3,
    MtGpu = 4,
}

/// Element types understood by the library.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum opk_dtype_t {
    F16 = 0,
    BF16 = 1,
    F32 = 2,
    F64 = 3,
    I32 = 4,
    I64 = 5,
    U64 = 6,
}

// ── External library declarations (enabled with `link` feature) ─────────

#[cfg(feature = "link")]
unsafe extern "C" {
    pub fn opk_create_handle(
        handle_out: *mut *mut opk_handle_t,
        device: opk_device_t,
        device_id: c_int,
    ) -> opk_status_t;
    pub fn opk_destroy_handle(handle: *mut opk_handle_t) -> opk_status_t;

    pub fn opk_create_tensor_descriptor(
        desc_out: *mut *mut opk_tensor_desc_t,
        ndim: u64,
        shape: *const u64,
        strides: *const i64,
        dtype: opk_dtype_t,
    ) -> opk_status_t;
    pub fn opk_destroy_tensor_descriptor(desc: *mut opk_tensor_desc_t) -> opk_status_t;

    pub fn opk_create_avg_pool_descriptor(
        handle: *mut opk_handle_t,
        desc_out: *mut *mut opk_avg_pool_desc_t,
        y: *mut opk_tensor_desc_t,
        x: *mut opk_tensor_desc_t,
        kernel_shape: *const i64,
        pads: *const i64,
        strides: *const i64,
        n: u64,
    ) -> opk_status_t;
    pub fn opk_get_avg_pool_workspace_size(
        desc: *mut opk_avg_pool_desc_t,
        size_out: *mut u64,
    ) -> opk_status_t;
    pub fn opk_avg_pool(
        desc: *mut opk_avg_pool_desc_t,
        workspace: *mut c_void,
        workspace_size: u64,
        y: *mut c_void,
        x: *const c_void,
        stream: *mut c_void,
    ) -> opk_status_t;
    pub fn opk_destroy_avg_pool_descriptor(desc: *mut opk_avg_pool_desc_t) -> opk_status_t;

    pub fn opk_create_rope_descriptor(
        handle: *mut opk_handle_t,
        desc_out: *mut *mut opk_rope_desc_t,
        t: *mut opk_tensor_desc_t,
        pos_ids: *mut opk_tensor_desc_t,
        sin_table: *mut opk_tensor_desc_t,
        cos_table: *mut opk_tensor_desc_t,
    ) -> opk_status_t;
    pub fn opk_get_rope_workspace_size(
        desc: *mut opk_rope_desc_t,
        size_out: *mut u64,
    ) -> opk_status_t;
    pub fn opk_rope(
        desc: *mut opk_rope_desc_t,
        workspace: *mut c_void,
        workspace_size: u64,
        t: *mut c_void,
        pos_ids: *const c_void,
        sin_table: *const c_void,
        cos_table: *const c_void,
        stream: *mut c_void,
    ) -> opk_status_t;
    pub fn opk_destroy_rope_descriptor(desc: *mut opk_rope_desc_t) -> opk_status_t;
}

// ── Pure-Rust native implementation (enabled with `native` feature) ─────

#[cfg(feature = "native")]
mod native_impl;

#[cfg(feature = "native")]
pub use native_impl::*;
