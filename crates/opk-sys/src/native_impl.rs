//! Pure-Rust CPU implementation of the `opk_*` C ABI.
//!
//! Handles and descriptors are `Box`ed Rust structs cast through the
//! zero-sized marker types. Only [`opk_device_t::Cpu`] is served; every other
//! device reports [`OPK_STATUS_BAD_DEVICE`].
//!
//! # Safety
//!
//! All functions in this module follow C ABI conventions: callers must pass
//! valid pointers obtained from other `opk_*` functions, and data pointers
//! must cover the storage span described by the matching tensor descriptor.
//! Handles and descriptors must be destroyed exactly once.

#![allow(clippy::missing_safety_doc)]

use half::{bf16, f16};
use libc::{c_int, c_void};

use crate::{
    OPK_STATUS_BAD_DEVICE, OPK_STATUS_BAD_PARAM, OPK_STATUS_BAD_TENSOR_DTYPE,
    OPK_STATUS_BAD_TENSOR_SHAPE, OPK_STATUS_BAD_TENSOR_STRIDES, OPK_STATUS_INSUFFICIENT_WORKSPACE,
    OPK_STATUS_MEMORY_NOT_ALLOCATED, OPK_STATUS_SUCCESS, opk_avg_pool_desc_t, opk_device_t,
    opk_dtype_t, opk_handle_t, opk_rope_desc_t, opk_status_t, opk_tensor_desc_t,
};

// ── Native object layouts ───────────────────────────────────────────────

struct NativeHandle {
    device: opk_device_t,
}

impl NativeHandle {
    fn served(&self) -> bool {
        self.device == opk_device_t::Cpu
    }
}

#[derive(Clone, Debug)]
struct TensorLayout {
    shape: Vec<usize>,
    strides: Vec<isize>,
    dtype: opk_dtype_t,
}

impl TensorLayout {
    fn ndim(&self) -> usize {
        self.shape.len()
    }

    fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    fn offset(&self, index: &[usize]) -> isize {
        index
            .iter()
            .zip(self.strides.iter())
            .map(|(&i, &s)| i as isize * s)
            .sum()
    }
}

struct AvgPoolDesc {
    x: TensorLayout,
    y: TensorLayout,
    kernel: Vec<usize>,
    pads: Vec<usize>,
    strides: Vec<usize>,
}

impl AvgPoolDesc {
    /// F16 outputs are accumulated in an f32 staging area held in the workspace.
    fn workspace_size(&self) -> u64 {
        match self.y.dtype {
            opk_dtype_t::F16 => (self.y.numel() * std::mem::size_of::<f32>()) as u64,
            _ => 0,
        }
    }
}

struct RopeDesc {
    t: TensorLayout,
    pos: TensorLayout,
    sin: TensorLayout,
    cos: TensorLayout,
}

// ── Pointer conversion helpers ──────────────────────────────────────────

fn into_raw<T, M>(value: T) -> *mut M {
    Box::into_raw(Box::new(value)) as *mut M
}

unsafe fn as_ref<'a, T, M>(p: *mut M) -> Option<&'a T> {
    if p.is_null() {
        None
    } else {
        Some(unsafe { &*(p as *const T) })
    }
}

unsafe fn drop_raw<T, M>(p: *mut M) -> opk_status_t {
    if p.is_null() {
        return OPK_STATUS_BAD_PARAM;
    }
    unsafe { drop(Box::from_raw(p as *mut T)) };
    OPK_STATUS_SUCCESS
}

// ── Element access ──────────────────────────────────────────────────────

unsafe fn load(base: *const c_void, dtype: opk_dtype_t, offset: isize) -> f32 {
    unsafe {
        match dtype {
            opk_dtype_t::F16 => (base as *const f16).offset(offset).read_unaligned().to_f32(),
            opk_dtype_t::BF16 => (base as *const bf16).offset(offset).read_unaligned().to_f32(),
            opk_dtype_t::F32 => (base as *const f32).offset(offset).read_unaligned(),
            opk_dtype_t::F64 => (base as *const f64).offset(offset).read_unaligned() as f32,
            opk_dtype_t::I32 => (base as *const i32).offset(offset).read_unaligned() as f32,
            opk_dtype_t::I64 => (base as *const i64).offset(offset).read_unaligned() as f32,
            opk_dtype_t::U64 => (base as *const u64).offset(offset).read_unaligned() as f32,
        }
    }
}

unsafe fn store(base: *mut c_void, dtype: opk_dtype_t, offset: isize, value: f32) {
    unsafe {
        match dtype {
            opk_dtype_t::F16 => (base as *mut f16)
                .offset(offset)
                .write_unaligned(f16::from_f32(value)),
            opk_dtype_t::BF16 => (base as *mut bf16)
                .offset(offset)
                .write_unaligned(bf16::from_f32(value)),
            opk_dtype_t::F32 => (base as *mut f32).offset(offset).write_unaligned(value),
            opk_dtype_t::F64 => (base as *mut f64)
                .offset(offset)
                .write_unaligned(value as f64),
            opk_dtype_t::I32 => (base as *mut i32)
                .offset(offset)
                .write_unaligned(value as i32),
            opk_dtype_t::I64 => (base as *mut i64)
                .offset(offset)
                .write_unaligned(value as i64),
            opk_dtype_t::U64 => (base as *mut u64)
                .offset(offset)
                .write_unaligned(value as u64),
        }
    }
}

/// Read a position index; `None` for negative or non-integer storage.
unsafe fn load_index(base: *const c_void, dtype: opk_dtype_t, offset: isize) -> Option<usize> {
    unsafe {
        match dtype {
            opk_dtype_t::U64 => Some((base as *const u64).offset(offset).read_unaligned() as usize),
            opk_dtype_t::I64 => {
                usize::try_from((base as *const i64).offset(offset).read_unaligned()).ok()
            }
            opk_dtype_t::I32 => {
                usize::try_from((base as *const i32).offset(offset).read_unaligned()).ok()
            }
            _ => None,
        }
    }
}

/// Advance a row-major multi-index within `bounds`. Returns false on wrap-around.
fn advance(index: &mut [usize], bounds: &[usize]) -> bool {
    for d in (0..index.len()).rev() {
        index[d] += 1;
        if index[d] < bounds[d] {
            return true;
        }
        index[d] = 0;
    }
    false
}

// ── Handle ──────────────────────────────────────────────────────────────

#[unsafe(no_mangle)]
pub unsafe extern "C" fn opk_create_handle(
    handle_out: *mut *mut opk_handle_t,
    device: opk_device_t,
    _device_id: c_int,
) -> opk_status_t {
    if handle_out.is_null() {
        return OPK_STATUS_BAD_PARAM;
    }
    let handle = NativeHandle { device };
    if !handle.served() {
        return OPK_STATUS_BAD_DEVICE;
    }
    unsafe { *handle_out = into_raw(handle) };
    OPK_STATUS_SUCCESS
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn opk_destroy_handle(handle: *mut opk_handle_t) -> opk_status_t {
    unsafe { drop_raw::<NativeHandle, _>(handle) }
}

// ── Tensor descriptors ──────────────────────────────────────────────────

#[unsafe(no_mangle)]
pub unsafe extern "C" fn opk_create_tensor_descriptor(
    desc_out: *mut *mut opk_tensor_desc_t,
    ndim: u64,
    shape: *const u64,
    strides: *const i64,
    dtype: opk_dtype_t,
) -> opk_status_t {
    if desc_out.is_null() || (ndim > 0 && shape.is_null()) {
        return OPK_STATUS_BAD_PARAM;
    }
    let ndim = ndim as usize;
    let dims: Vec<usize> = if ndim == 0 {
        Vec::new()
    } else {
        unsafe { std::slice::from_raw_parts(shape, ndim) }
            .iter()
            .map(|&d| d as usize)
            .collect()
    };
    if dims.contains(&0) {
        return OPK_STATUS_BAD_TENSOR_SHAPE;
    }
    let strides: Vec<isize> = if strides.is_null() {
        let mut out = vec![1isize; ndim];
        for d in (0..ndim.saturating_sub(1)).rev() {
            out[d] = out[d + 1] * dims[d + 1] as isize;
        }
        out
    } else {
        unsafe { std::slice::from_raw_parts(strides, ndim) }
            .iter()
            .map(|&s| s as isize)
            .collect()
    };
    unsafe {
        *desc_out = into_raw(TensorLayout {
            shape: dims,
            strides,
            dtype,
        })
    };
    OPK_STATUS_SUCCESS
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn opk_destroy_tensor_descriptor(
    desc: *mut opk_tensor_desc_t,
) -> opk_status_t {
    unsafe { drop_raw::<TensorLayout, _>(desc) }
}

// ── Average pooling ─────────────────────────────────────────────────────

#[unsafe(no_mangle)]
pub unsafe extern "C" fn opk_create_avg_pool_descriptor(
    handle: *mut opk_handle_t,
    desc_out: *mut *mut opk_avg_pool_desc_t,
    y: *mut opk_tensor_desc_t,
    x: *mut opk_tensor_desc_t,
    kernel_shape: *const i64,
    pads: *const i64,
    strides: *const i64,
    n: u64,
) -> opk_status_t {
    let (handle, y, x) = unsafe {
        (
            as_ref::<NativeHandle, _>(handle),
            as_ref::<TensorLayout, _>(y),
            as_ref::<TensorLayout, _>(x),
        )
    };
    let (Some(handle), Some(y), Some(x)) = (handle, y, x) else {
        return OPK_STATUS_BAD_PARAM;
    };
    if !handle.served() {
        return OPK_STATUS_BAD_DEVICE;
    }
    if desc_out.is_null() || kernel_shape.is_null() || pads.is_null() || strides.is_null() {
        return OPK_STATUS_BAD_PARAM;
    }
    let n = n as usize;
    if !(1..=3).contains(&n) || x.ndim() != n + 2 || y.ndim() != n + 2 {
        return OPK_STATUS_BAD_TENSOR_SHAPE;
    }
    if x.dtype != y.dtype {
        return OPK_STATUS_BAD_TENSOR_DTYPE;
    }
    if !matches!(x.dtype, opk_dtype_t::F16 | opk_dtype_t::F32) {
        return OPK_STATUS_BAD_TENSOR_DTYPE;
    }

    let (kernel, pad, stride) = unsafe {
        (
            std::slice::from_raw_parts(kernel_shape, n),
            std::slice::from_raw_parts(pads, n),
            std::slice::from_raw_parts(strides, n),
        )
    };
    for d in 0..n {
        if kernel[d] <= 0 || stride[d] <= 0 || pad[d] < 0 || pad[d] * 2 > kernel[d] {
            return OPK_STATUS_BAD_PARAM;
        }
    }
    if x.shape[..2] != y.shape[..2] {
        return OPK_STATUS_BAD_TENSOR_SHAPE;
    }
    for d in 0..n {
        let padded = x.shape[d + 2] as i64 + 2 * pad[d];
        if padded < kernel[d] || (padded - kernel[d]) / stride[d] + 1 != y.shape[d + 2] as i64 {
            return OPK_STATUS_BAD_TENSOR_SHAPE;
        }
    }

    let desc = AvgPoolDesc {
        x: x.clone(),
        y: y.clone(),
        kernel: kernel.iter().map(|&k| k as usize).collect(),
        pads: pad.iter().map(|&p| p as usize).collect(),
        strides: stride.iter().map(|&s| s as usize).collect(),
    };
    unsafe { *desc_out = into_raw(desc) };
    OPK_STATUS_SUCCESS
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn opk_get_avg_pool_workspace_size(
    desc: *mut opk_avg_pool_desc_t,
    size_out: *mut u64,
) -> opk_status_t {
    let Some(desc) = (unsafe { as_ref::<AvgPoolDesc, _>(desc) }) else {
        return OPK_STATUS_BAD_PARAM;
    };
    if size_out.is_null() {
        return OPK_STATUS_BAD_PARAM;
    }
    unsafe { *size_out = desc.workspace_size() };
    OPK_STATUS_SUCCESS
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn opk_avg_pool(
    desc: *mut opk_avg_pool_desc_t,
    workspace: *mut c_void,
    workspace_size: u64,
    y: *mut c_void,
    x: *const c_void,
    _stream: *mut c_void,
) -> opk_status_t {
    let Some(desc) = (unsafe { as_ref::<AvgPoolDesc, _>(desc) }) else {
        return OPK_STATUS_BAD_PARAM;
    };
    if y.is_null() || x.is_null() {
        return OPK_STATUS_MEMORY_NOT_ALLOCATED;
    }
    let required = desc.workspace_size();
    if workspace_size < required {
        return OPK_STATUS_INSUFFICIENT_WORKSPACE;
    }
    if required > 0 && workspace.is_null() {
        return OPK_STATUS_MEMORY_NOT_ALLOCATED;
    }

    let n = desc.kernel.len();
    let mut out_index = vec![0usize; n + 2];
    let mut window = vec![0usize; n];
    let mut in_index = vec![0usize; n + 2];
    let mut lo = vec![0isize; n];
    let mut extent = vec![0usize; n];
    let mut flat = 0usize;

    loop {
        // Window bounds in padded coordinates, clipped to the padded input.
        let mut count = 1usize;
        for d in 0..n {
            let start = (out_index[d + 2] * desc.strides[d]) as isize - desc.pads[d] as isize;
            let end = (start + desc.kernel[d] as isize)
                .min((desc.x.shape[d + 2] + desc.pads[d]) as isize);
            lo[d] = start;
            extent[d] = (end - start) as usize;
            count *= extent[d];
        }

        let mut sum = 0.0f32;
        window.iter_mut().for_each(|w| *w = 0);
        in_index[0] = out_index[0];
        in_index[1] = out_index[1];
        loop {
            let mut inside = true;
            for d in 0..n {
                let pos = lo[d] + window[d] as isize;
                if pos < 0 || pos >= desc.x.shape[d + 2] as isize {
                    inside = false;
                    break;
                }
                in_index[d + 2] = pos as usize;
            }
            if inside {
                sum += unsafe { load(x, desc.x.dtype, desc.x.offset(&in_index)) };
            }
            if !advance(&mut window, &extent) {
                break;
            }
        }
        let mean = sum / count as f32;

        if required > 0 {
            unsafe { (workspace as *mut f32).add(flat).write_unaligned(mean) };
        } else {
            unsafe { store(y, desc.y.dtype, desc.y.offset(&out_index), mean) };
        }

        flat += 1;
        if !advance(&mut out_index, &desc.y.shape) {
            break;
        }
    }

    if required > 0 {
        let mut index = vec![0usize; n + 2];
        for i in 0..flat {
            let v = unsafe { (workspace as *const f32).add(i).read_unaligned() };
            unsafe { store(y, desc.y.dtype, desc.y.offset(&index), v) };
            advance(&mut index, &desc.y.shape);
        }
    }
    OPK_STATUS_SUCCESS
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn opk_destroy_avg_pool_descriptor(
    desc: *mut opk_avg_pool_desc_t,
) -> opk_status_t {
    unsafe { drop_raw::<AvgPoolDesc, _>(desc) }
}

// ── Rotary embedding ────────────────────────────────────────────────────

#[unsafe(no_mangle)]
pub unsafe extern "C" fn opk_create_rope_descriptor(
    handle: *mut opk_handle_t,
    desc_out: *mut *mut opk_rope_desc_t,
    t: *mut opk_tensor_desc_t,
    pos_ids: *mut opk_tensor_desc_t,
    sin_table: *mut opk_tensor_desc_t,
    cos_table: *mut opk_tensor_desc_t,
) -> opk_status_t {
    let handle = unsafe { as_ref::<NativeHandle, _>(handle) };
    let tensors = unsafe {
        (
            as_ref::<TensorLayout, _>(t),
            as_ref::<TensorLayout, _>(pos_ids),
            as_ref::<TensorLayout, _>(sin_table),
            as_ref::<TensorLayout, _>(cos_table),
        )
    };
    let (Some(handle), (Some(t), Some(pos), Some(sin), Some(cos))) = (handle, tensors) else {
        return OPK_STATUS_BAD_PARAM;
    };
    if !handle.served() {
        return OPK_STATUS_BAD_DEVICE;
    }
    if desc_out.is_null() {
        return OPK_STATUS_BAD_PARAM;
    }

    if t.ndim() != 3 || pos.ndim() != 1 || sin.ndim() != 2 || cos.ndim() != 2 {
        return OPK_STATUS_BAD_TENSOR_SHAPE;
    }
    let (seq, dim) = (t.shape[0], t.shape[2]);
    if dim % 2 != 0 || pos.shape[0] != seq || sin.shape != cos.shape || sin.shape[1] != dim {
        return OPK_STATUS_BAD_TENSOR_SHAPE;
    }
    if t.strides[2] != 1 {
        return OPK_STATUS_BAD_TENSOR_STRIDES;
    }
    if !matches!(
        t.dtype,
        opk_dtype_t::F16 | opk_dtype_t::BF16 | opk_dtype_t::F32
    ) {
        return OPK_STATUS_BAD_TENSOR_DTYPE;
    }
    if !matches!(
        pos.dtype,
        opk_dtype_t::U64 | opk_dtype_t::I64 | opk_dtype_t::I32
    ) {
        return OPK_STATUS_BAD_TENSOR_DTYPE;
    }
    if sin.dtype != cos.dtype || (sin.dtype != opk_dtype_t::F32 && sin.dtype != t.dtype) {
        return OPK_STATUS_BAD_TENSOR_DTYPE;
    }

    let desc = RopeDesc {
        t: t.clone(),
        pos: pos.clone(),
        sin: sin.clone(),
        cos: cos.clone(),
    };
    unsafe { *desc_out = into_raw(desc) };
    OPK_STATUS_SUCCESS
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn opk_get_rope_workspace_size(
    desc: *mut opk_rope_desc_t,
    size_out: *mut u64,
) -> opk_status_t {
    if unsafe { as_ref::<RopeDesc, _>(desc) }.is_none() || size_out.is_null() {
        return OPK_STATUS_BAD_PARAM;
    }
    unsafe { *size_out = 0 };
    OPK_STATUS_SUCCESS
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn opk_rope(
    desc: *mut opk_rope_desc_t,
    _workspace: *mut c_void,
    _workspace_size: u64,
    t: *mut c_void,
    pos_ids: *const c_void,
    sin_table: *const c_void,
    cos_table: *const c_void,
    _stream: *mut c_void,
) -> opk_status_t {
    let Some(desc) = (unsafe { as_ref::<RopeDesc, _>(desc) }) else {
        return OPK_STATUS_BAD_PARAM;
    };
    if t.is_null() || pos_ids.is_null() || sin_table.is_null() || cos_table.is_null() {
        return OPK_STATUS_MEMORY_NOT_ALLOCATED;
    }

    let (seq, heads, dim) = (desc.t.shape[0], desc.t.shape[1], desc.t.shape[2]);
    let rows = desc.sin.shape[0];

    // Resolve every position before touching `t` so a bad index leaves it intact.
    let mut positions = Vec::with_capacity(seq);
    for p in 0..seq {
        match unsafe { load_index(pos_ids, desc.pos.dtype, desc.pos.offset(&[p])) } {
            Some(row) if row < rows => positions.push(row),
            _ => return OPK_STATUS_BAD_PARAM,
        }
    }

    for (p, &row) in positions.iter().enumerate() {
        for h in 0..heads {
            for j in 0..dim / 2 {
                let (c0, c1) = (2 * j, 2 * j + 1);
                let (i0, i1) = (desc.t.offset(&[p, h, c0]), desc.t.offset(&[p, h, c1]));
                unsafe {
                    let a = load(t, desc.t.dtype, i0);
                    let b = load(t, desc.t.dtype, i1);
                    let sin0 = load(sin_table, desc.sin.dtype, desc.sin.offset(&[row, c0]));
                    let cos0 = load(cos_table, desc.cos.dtype, desc.cos.offset(&[row, c0]));
                    let sin1 = load(sin_table, desc.sin.dtype, desc.sin.offset(&[row, c1]));
                    let cos1 = load(cos_table, desc.cos.dtype, desc.cos.offset(&[row, c1]));
                    store(t, desc.t.dtype, i0, a * cos0 - b * sin0);
                    store(t, desc.t.dtype, i1, a * sin1 + b * cos1);
                }
            }
        }
    }
    OPK_STATUS_SUCCESS
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn opk_destroy_rope_descriptor(desc: *mut opk_rope_desc_t) -> opk_status_t {
    unsafe { drop_raw::<RopeDesc, _>(desc) }
}
