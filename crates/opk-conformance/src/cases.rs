//! The enumerated test matrix.

use opk_core::{Backend, DType, Shape};
use opk_ops::PoolParams;
use serde::Serialize;
use smallvec::SmallVec;

use crate::compare::Tolerance;
use crate::data::InputFill;

/// Operator exercised by a case.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    AvgPool,
    Rope,
}

impl Operator {
    pub fn name(self) -> &'static str {
        match self {
            Operator::AvgPool => "avg_pool",
            Operator::Rope => "rope",
        }
    }
}

impl std::fmt::Display for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Average pooling over an `(N, C, spatial...)` input.
#[derive(Clone, Debug)]
pub struct PoolCase {
    pub input: Shape,
    pub params: PoolParams,
    pub dtypes: Vec<DType>,
    pub tolerance: Tolerance,
    pub fill: InputFill,
}

/// Storage dtype of the rotary sine and cosine tables.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TableDtype {
    /// Full-precision tables; expected values come straight from the formula.
    #[default]
    F32,
    /// Tables stored in the tensor dtype; expected values are cross-checked
    /// against the same quantized tables.
    Tensor,
}

impl TableDtype {
    pub fn resolve(self, tensor: DType) -> DType {
        match self {
            TableDtype::F32 => DType::F32,
            TableDtype::Tensor => tensor,
        }
    }
}

/// Rotary embedding over a `(seq, heads, dim)` tensor.
#[derive(Clone, Debug)]
pub struct RopeCase {
    pub shape: Shape,
    /// Layout of `t`; `None` is contiguous.
    pub strides: Option<SmallVec<[isize; 6]>>,
    pub dtypes: Vec<DType>,
    pub theta: f32,
    /// Rows of the sine and cosine tables.
    pub table_rows: usize,
    pub table_dtype: TableDtype,
    pub tolerance: Tolerance,
    pub fill: InputFill,
}

#[derive(Clone, Debug)]
pub enum TestCase {
    AvgPool(PoolCase),
    Rope(RopeCase),
}

impl TestCase {
    pub fn operator(&self) -> Operator {
        match self {
            TestCase::AvgPool(_) => Operator::AvgPool,
            TestCase::Rope(_) => Operator::Rope,
        }
    }

    pub fn dtypes(&self) -> &[DType] {
        match self {
            TestCase::AvgPool(c) => &c.dtypes,
            TestCase::Rope(c) => &c.dtypes,
        }
    }

    pub fn tolerance(&self) -> Tolerance {
        match self {
            TestCase::AvgPool(c) => c.tolerance,
            TestCase::Rope(c) => c.tolerance,
        }
    }

    /// Override the tolerance of this case.
    pub fn with_tolerance(mut self, tolerance: Tolerance) -> Self {
        match &mut self {
            TestCase::AvgPool(c) => c.tolerance = tolerance,
            TestCase::Rope(c) => c.tolerance = tolerance,
        }
        self
    }

    /// Short human-readable description.
    pub fn label(&self) -> String {
        match self {
            TestCase::AvgPool(c) => format!(
                "x={} k={:?} p={:?} s={:?}",
                c.input,
                c.params.kernel.as_slice(),
                c.params.pads.as_slice(),
                c.params.strides.as_slice()
            ),
            TestCase::Rope(c) => match &c.strides {
                Some(s) => format!("t={} strides={:?}", c.shape, s.as_slice()),
                None => format!("t={}", c.shape),
            },
        }
    }
}

const POOL_TOLERANCE: Tolerance = Tolerance::relative(1e-3);
const ROPE_TOLERANCE: Tolerance = Tolerance::relative(1e-2);
const ROPE_THETA: f32 = 1e4;

fn pool(input: &[usize], kernel: &[usize], pads: &[usize], strides: &[usize]) -> TestCase {
    TestCase::AvgPool(PoolCase {
        input: Shape::new(input),
        params: PoolParams::new(kernel, pads, strides),
        dtypes: vec![DType::F16, DType::F32],
        tolerance: POOL_TOLERANCE,
        fill: InputFill::Ones,
    })
}

fn rope(shape: [usize; 3], strides: Option<[isize; 3]>, seed: u64) -> TestCase {
    TestCase::Rope(RopeCase {
        shape: Shape::new(shape),
        strides: strides.map(|s| SmallVec::from_slice(&s)),
        dtypes: vec![DType::F16],
        theta: ROPE_THETA,
        table_rows: 2 * shape[0],
        table_dtype: TableDtype::F32,
        tolerance: ROPE_TOLERANCE,
        fill: InputFill::Uniform { seed },
    })
}

/// The standard matrix run by the `opk` binary.
pub fn default_matrix() -> Vec<TestCase> {
    vec![
        pool(&[1, 1, 10], &[3], &[1], &[1]),
        pool(&[1, 1, 2, 2], &[2, 2], &[1, 1], &[1, 1]),
        pool(&[32, 4, 224, 224], &[3, 3], &[1, 1], &[2, 2]),
        pool(&[1, 1, 16, 16, 16], &[5, 5, 5], &[2, 2, 2], &[2, 2, 2]),
        rope([1, 32, 128], None, 1),
        rope([4, 1, 32], None, 2),
        rope([3, 32, 128], Some([8000, 200, 1]), 3),
    ]
}

/// Reason a backend cannot run `op` in `dtype`, if any.
pub fn skip_reason(backend: Backend, op: Operator, dtype: DType) -> Option<String> {
    match (backend, op, dtype) {
        (Backend::Musa, Operator::AvgPool, DType::F16) => {
            Some(format!("{backend} has no f16 average pooling"))
        }
        (Backend::Bang, Operator::Rope, _) => Some(format!("{backend} has no rotary embedding")),
        _ => None,
    }
}
