//! Element-wise closeness: `|actual - expected| <= atol + rtol * |expected|`.

use serde::{Deserialize, Serialize};

/// Absolute and relative bounds for one comparison.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tolerance {
    pub atol: f32,
    pub rtol: f32,
}

impl Tolerance {
    pub const fn new(atol: f32, rtol: f32) -> Self {
        Self { atol, rtol }
    }

    /// Relative-only tolerance (`atol = 0`).
    pub const fn relative(rtol: f32) -> Self {
        Self { atol: 0.0, rtol }
    }

    pub fn allowed(&self, expected: f32) -> f32 {
        self.atol + self.rtol * expected.abs()
    }
}

impl std::fmt::Display for Tolerance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "atol={} rtol={}", self.atol, self.rtol)
    }
}

/// Why a comparison failed.
#[derive(Clone, Debug, PartialEq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Mismatch {
    #[error("length mismatch: actual {actual}, expected {expected}")]
    Length { actual: usize, expected: usize },

    #[error(
        "{violations} of {total} elements out of tolerance; first at [{index}]: \
         actual={actual} expected={expected} diff={diff} allowed={allowed}; max diff {max_diff}"
    )]
    Values {
        index: usize,
        actual: f32,
        expected: f32,
        diff: f32,
        allowed: f32,
        violations: usize,
        total: usize,
        max_diff: f32,
    },
}

/// Compare two logical row-major buffers. NaN never compares close.
pub fn compare(actual: &[f32], expected: &[f32], tol: Tolerance) -> Result<(), Mismatch> {
    if actual.len() != expected.len() {
        return Err(Mismatch::Length {
            actual: actual.len(),
            expected: expected.len(),
        });
    }
    let mut first = None;
    let mut violations = 0usize;
    let mut max_diff = 0.0f32;
    for (i, (&a, &e)) in actual.iter().zip(expected).enumerate() {
        let diff = (a - e).abs();
        if diff.is_nan() {
            max_diff = f32::NAN;
        } else if !max_diff.is_nan() {
            max_diff = max_diff.max(diff);
        }
        let allowed = tol.allowed(e);
        if diff.is_nan() || diff > allowed {
            violations += 1;
            first.get_or_insert((i, a, e, diff, allowed));
        }
    }
    match first {
        None => Ok(()),
        Some((index, actual_v, expected_v, diff, allowed)) => Err(Mismatch::Values {
            index,
            actual: actual_v,
            expected: expected_v,
            diff,
            allowed,
            violations,
            total: actual.len(),
            max_diff,
        }),
    }
}

/// Panicking form of [`compare`] for tests.
pub fn assert_allclose(actual: &[f32], expected: &[f32], atol: f32, rtol: f32) {
    if let Err(m) = compare(actual, expected, Tolerance::new(atol, rtol)) {
        panic!("mismatch: {m}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_allclose_exact() {
        assert_allclose(&[1.0, 2.0, 3.0], &[1.0, 2.0, 3.0], 0.0, 0.0);
    }

    #[test]
    fn test_allclose_within_tolerance() {
        assert_allclose(&[1.0009], &[1.0], 0.0, 1e-3);
    }

    #[test]
    #[should_panic(expected = "mismatch")]
    fn test_allclose_fails() {
        assert_allclose(&[1.0], &[2.0], 1e-6, 1e-6);
    }

    #[test]
    fn test_first_offender_reported() {
        let err = compare(&[1.0, 5.0, 7.0], &[1.0, 2.0, 3.0], Tolerance::relative(1e-3)).unwrap_err();
        match err {
            Mismatch::Values {
                index,
                actual,
                expected,
                violations,
                total,
                max_diff,
                ..
            } => {
                assert_eq!((index, actual, expected), (1, 5.0, 2.0));
                assert_eq!((violations, total), (2, 3));
                assert_eq!(max_diff, 4.0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_message_names_index_and_values() {
        let err = compare(&[0.5], &[0.25], Tolerance::relative(1e-3)).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("[0]"), "{msg}");
        assert!(msg.contains("actual=0.5"), "{msg}");
        assert!(msg.contains("expected=0.25"), "{msg}");
    }

    #[test]
    fn test_nan_never_close() {
        assert!(compare(&[f32::NAN], &[f32::NAN], Tolerance::new(1.0, 1.0)).is_err());
        assert!(compare(&[1.0], &[f32::NAN], Tolerance::new(1.0, 1.0)).is_err());
    }

    #[test]
    fn test_length_mismatch() {
        assert_eq!(
            compare(&[1.0], &[1.0, 2.0], Tolerance::relative(1e-3)),
            Err(Mismatch::Length {
                actual: 1,
                expected: 2
            })
        );
    }

    proptest! {
        #[test]
        fn identical_buffers_pass(values in prop::collection::vec(-1e6f32..1e6, 0..64)) {
            prop_assert!(compare(&values, &values, Tolerance::relative(0.0)).is_ok());
        }

        #[test]
        fn scaled_within_rtol_passes(
            values in prop::collection::vec(-1e3f32..1e3, 1..64),
            scale in -0.5f32..0.5,
        ) {
            let rtol = 1e-2;
            let actual: Vec<f32> = values.iter().map(|v| v * (1.0 + scale * rtol)).collect();
            prop_assert!(compare(&actual, &values, Tolerance::relative(rtol)).is_ok());
        }
    }
}
