//! Tensor metadata and host-side storage.
//!
//! A [`TensorDesc`] describes a logical tensor (shape, layout, dtype, backend)
//! without owning memory. [`HostTensor`] pairs a descriptor with host bytes laid
//! out according to it, possibly non-contiguously.

use half::{bf16, f16};
use smallvec::SmallVec;

use crate::types::{Backend, DType, Shape};
use crate::{OpkError, Result};

/// Memory layout of a tensor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Layout {
    /// Row-major, derived from the shape.
    Contiguous,
    /// Explicit per-dimension element strides.
    Strided(SmallVec<[isize; 6]>),
}

/// Immutable tensor metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TensorDesc {
    shape: Shape,
    layout: Layout,
    dtype: DType,
    backend: Backend,
}

impl TensorDesc {
    pub fn contiguous(shape: Shape, dtype: DType, backend: Backend) -> Result<Self> {
        validate_shape(&shape)?;
        Ok(Self {
            shape,
            layout: Layout::Contiguous,
            dtype,
            backend,
        })
    }

    pub fn strided(shape: Shape, strides: &[isize], dtype: DType, backend: Backend) -> Result<Self> {
        validate_shape(&shape)?;
        if strides.len() != shape.ndim() {
            return Err(OpkError::InvalidArgument(format!(
                "{} strides given for rank-{} shape {shape}",
                strides.len(),
                shape.ndim()
            )));
        }
        if let Some(s) = strides.iter().find(|&&s| s < 0) {
            return Err(OpkError::InvalidArgument(format!(
                "negative stride {s} is not supported"
            )));
        }
        Ok(Self {
            shape,
            layout: Layout::Strided(SmallVec::from_slice(strides)),
            dtype,
            backend,
        })
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn ndim(&self) -> usize {
        self.shape.ndim()
    }

    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    /// Resolved element strides.
    pub fn strides(&self) -> SmallVec<[isize; 6]> {
        match &self.layout {
            Layout::Contiguous => self.shape.contiguous_strides(),
            Layout::Strided(s) => s.clone(),
        }
    }

    pub fn is_contiguous(&self) -> bool {
        self.strides() == self.shape.contiguous_strides()
    }

    /// Number of elements the layout spans in storage.
    pub fn storage_len(&self) -> usize {
        let strides = self.strides();
        1 + self
            .shape
            .dims()
            .iter()
            .zip(strides.iter())
            .map(|(&d, &s)| (d - 1) * s as usize)
            .sum::<usize>()
    }

    pub fn storage_bytes(&self) -> usize {
        self.storage_len() * self.dtype.size_bytes()
    }

    /// Element offset of a logical multi-index.
    pub fn offset(&self, index: &[usize]) -> usize {
        index
            .iter()
            .zip(self.strides().iter())
            .map(|(&i, &s)| i * s as usize)
            .sum()
    }

    /// The same tensor placed on another backend.
    pub fn on_backend(&self, backend: Backend) -> Self {
        Self {
            backend,
            ..self.clone()
        }
    }

    /// Storage offsets in logical row-major order.
    pub fn offsets(&self) -> Vec<usize> {
        let dims = self.shape.dims();
        let strides = self.strides();
        let mut out = Vec::with_capacity(self.numel());
        let mut index: SmallVec<[usize; 6]> = SmallVec::from_elem(0, dims.len());
        'outer: loop {
            out.push(
                index
                    .iter()
                    .zip(strides.iter())
                    .map(|(&i, &s)| i * s as usize)
                    .sum(),
            );
            for d in (0..dims.len()).rev() {
                index[d] += 1;
                if index[d] < dims[d] {
                    continue 'outer;
                }
                index[d] = 0;
            }
            break;
        }
        out
    }
}

fn validate_shape(shape: &Shape) -> Result<()> {
    if shape.ndim() == 0 {
        return Err(OpkError::InvalidArgument(
            "tensor rank must be at least 1".into(),
        ));
    }
    if shape.dims().contains(&0) {
        return Err(OpkError::InvalidArgument(format!(
            "tensor dimensions must be positive, got {shape}"
        )));
    }
    Ok(())
}

/// Host-resident tensor storage laid out per its descriptor.
#[derive(Clone, Debug)]
pub struct HostTensor {
    desc: TensorDesc,
    bytes: Vec<u8>,
}

impl HostTensor {
    pub fn zeros(desc: TensorDesc) -> Self {
        let bytes = vec![0u8; desc.storage_bytes()];
        Self { desc, bytes }
    }

    /// Build from logical row-major values, converting to the descriptor's dtype.
    pub fn from_f32(desc: TensorDesc, values: &[f32]) -> Result<Self> {
        Self::from_scalars(desc, values.iter().map(|&v| v as f64), values.len())
    }

    /// Build from logical row-major integer values (e.g. position indices).
    pub fn from_u64(desc: TensorDesc, values: &[u64]) -> Result<Self> {
        Self::from_scalars(desc, values.iter().map(|&v| v as f64), values.len())
    }

    fn from_scalars(
        desc: TensorDesc,
        values: impl Iterator<Item = f64>,
        len: usize,
    ) -> Result<Self> {
        if len != desc.numel() {
            return Err(OpkError::InvalidArgument(format!(
                "{len} values given for tensor of shape {}",
                desc.shape()
            )));
        }
        let mut out = Self::zeros(desc);
        let dtype = out.desc.dtype();
        for (offset, v) in out.desc.offsets().into_iter().zip(values) {
            write_scalar(&mut out.bytes, dtype, offset, v);
        }
        Ok(out)
    }

    /// Wrap raw bytes (e.g. downloaded from a device).
    pub fn from_bytes(desc: TensorDesc, bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() != desc.storage_bytes() {
            return Err(OpkError::InvalidArgument(format!(
                "{} bytes given for storage of {} bytes",
                bytes.len(),
                desc.storage_bytes()
            )));
        }
        Ok(Self { desc, bytes })
    }

    pub fn desc(&self) -> &TensorDesc {
        &self.desc
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Logical row-major values widened to f32.
    pub fn to_f32(&self) -> Vec<f32> {
        let dtype = self.desc.dtype();
        self.desc
            .offsets()
            .into_iter()
            .map(|o| read_scalar(&self.bytes, dtype, o) as f32)
            .collect()
    }

    /// Same logical values re-laid with new strides.
    pub fn rearranged(&self, strides: &[isize]) -> Result<Self> {
        let desc = TensorDesc::strided(
            self.desc.shape().clone(),
            strides,
            self.desc.dtype(),
            self.desc.backend(),
        )?;
        let dtype = desc.dtype();
        let mut out = Self::zeros(desc);
        for (src, dst) in self.desc.offsets().into_iter().zip(out.desc.offsets()) {
            let v = read_scalar(&self.bytes, dtype, src);
            write_scalar(&mut out.bytes, dtype, dst, v);
        }
        Ok(out)
    }
}

fn write_scalar(bytes: &mut [u8], dtype: DType, offset: usize, v: f64) {
    let at = offset * dtype.size_bytes();
    let dst = &mut bytes[at..at + dtype.size_bytes()];
    match dtype {
        DType::F16 => dst.copy_from_slice(&f16::from_f64(v).to_le_bytes()),
        DType::BF16 => dst.copy_from_slice(&bf16::from_f64(v).to_le_bytes()),
        DType::F32 => dst.copy_from_slice(&(v as f32).to_le_bytes()),
        DType::F64 => dst.copy_from_slice(&v.to_le_bytes()),
        DType::I32 => dst.copy_from_slice(&(v as i32).to_le_bytes()),
        DType::I64 => dst.copy_from_slice(&(v as i64).to_le_bytes()),
        DType::U64 => dst.copy_from_slice(&(v as u64).to_le_bytes()),
    }
}

fn read_scalar(bytes: &[u8], dtype: DType, offset: usize) -> f64 {
    let at = offset * dtype.size_bytes();
    let src = &bytes[at..at + dtype.size_bytes()];
    match dtype {
        DType::F16 => f16::from_le_bytes([src[0], src[1]]).to_f64(),
        DType::BF16 => bf16::from_le_bytes([src[0], src[1]]).to_f64(),
        DType::F32 => f32::from_le_bytes([src[0], src[1], src[2], src[3]]) as f64,
        DType::F64 => f64::from_le_bytes(src.try_into().unwrap_or([0; 8])),
        DType::I32 => i32::from_le_bytes([src[0], src[1], src[2], src[3]]) as f64,
        DType::I64 => i64::from_le_bytes(src.try_into().unwrap_or([0; 8])) as f64,
        DType::U64 => u64::from_le_bytes(src.try_into().unwrap_or([0; 8])) as f64,
    }
}
