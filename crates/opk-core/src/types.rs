//! Core type definitions: DType, Shape, Backend.

use half::{bf16, f16};
use opk_sys::{opk_device_t, opk_dtype_t};
use smallvec::SmallVec;

/// Supported data types for tensor elements.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DType {
    F16,
    BF16,
    F32,
    F64,
    I32,
    I64,
    U64,
}

impl DType {
    /// Size in bytes of a single element.
    pub fn size_bytes(self) -> usize {
        match self {
            DType::F16 | DType::BF16 => 2,
            DType::F32 | DType::I32 => 4,
            DType::F64 | DType::I64 | DType::U64 => 8,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, DType::F16 | DType::BF16 | DType::F32 | DType::F64)
    }

    /// Round `value` to the precision this dtype stores.
    pub fn quantize(self, value: f32) -> f32 {
        match self {
            DType::F16 => f16::from_f32(value).to_f32(),
            DType::BF16 => bf16::from_f32(value).to_f32(),
            DType::F32 | DType::F64 => value,
            DType::I32 => value as i32 as f32,
            DType::I64 => value as i64 as f32,
            DType::U64 => value as u64 as f32,
        }
    }

    pub fn to_sys(self) -> opk_dtype_t {
        match self {
            DType::F16 => opk_dtype_t::F16,
            DType::BF16 => opk_dtype_t::BF16,
            DType::F32 => opk_dtype_t::F32,
            DType::F64 => opk_dtype_t::F64,
            DType::I32 => opk_dtype_t::I32,
            DType::I64 => opk_dtype_t::I64,
            DType::U64 => opk_dtype_t::U64,
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DType::F16 => write!(f, "f16"),
            DType::BF16 => write!(f, "bf16"),
            DType::F32 => write!(f, "f32"),
            DType::F64 => write!(f, "f64"),
            DType::I32 => write!(f, "i32"),
            DType::I64 => write!(f, "i64"),
            DType::U64 => write!(f, "u64"),
        }
    }
}

/// Compute backend a tensor, handle or buffer lives on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Backend {
    Cpu,
    Cuda,
    Bang,
    Ascend,
    Musa,
}

impl Backend {
    pub const ALL: [Backend; 5] = [
        Backend::Cpu,
        Backend::Cuda,
        Backend::Bang,
        Backend::Ascend,
        Backend::Musa,
    ];

    pub fn to_sys(self) -> opk_device_t {
        match self {
            Backend::Cpu => opk_device_t::Cpu,
            Backend::Cuda => opk_device_t::NvGpu,
            Backend::Bang => opk_device_t::CambriconMlu,
            Backend::Ascend => opk_device_t::AscendNpu,
            Backend::Musa => opk_device_t::MtGpu,
        }
    }

    /// Short lowercase name, matching the CLI flag.
    pub fn name(self) -> &'static str {
        match self {
            Backend::Cpu => "cpu",
            Backend::Cuda => "cuda",
            Backend::Bang => "bang",
            Backend::Ascend => "ascend",
            Backend::Musa => "musa",
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Tensor shape (dimensions).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Shape(pub SmallVec<[usize; 6]>);

impl Shape {
    pub fn new(dims: impl AsRef<[usize]>) -> Self {
        Self(SmallVec::from_slice(dims.as_ref()))
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Number of dimensions (rank).
    pub fn ndim(&self) -> usize {
        self.0.len()
    }

    /// Total number of elements.
    pub fn numel(&self) -> usize {
        self.0.iter().product()
    }

    /// Row-major strides, in elements.
    pub fn contiguous_strides(&self) -> SmallVec<[isize; 6]> {
        let mut strides: SmallVec<[isize; 6]> = SmallVec::from_elem(1, self.0.len());
        for d in (0..self.0.len().saturating_sub(1)).rev() {
            strides[d] = strides[d + 1] * self.0[d + 1] as isize;
        }
        strides
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::new(dims)
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, ")")
    }
}
