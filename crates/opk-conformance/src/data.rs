//! Deterministic input generation.

use serde::Serialize;

/// Values in roughly [-1, 1] from a Numerical Recipes LCG. Reproducible across
/// platforms, not random in any stronger sense.
pub fn gen_data(n: usize, seed: u64) -> Vec<f32> {
    lcg(seed)
        .take(n)
        .map(|u| (u * 2.0 - 1.0) as f32)
        .collect()
}

/// Values in [0, 1) from the same generator.
pub fn gen_uniform(n: usize, seed: u64) -> Vec<f32> {
    // Narrowing can round values just below 1.0 up to 1.0.
    lcg(seed)
        .take(n)
        .map(|u| (u as f32).min(1.0 - f32::EPSILON / 2.0))
        .collect()
}

fn lcg(seed: u64) -> impl Iterator<Item = f64> {
    let mut state = seed;
    std::iter::repeat_with(move || {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (state >> 33) as f64 / (1u64 << 31) as f64
    })
}

/// How a case's primary input is filled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputFill {
    Ones,
    Uniform { seed: u64 },
    Signed { seed: u64 },
}

impl InputFill {
    pub fn generate(self, n: usize) -> Vec<f32> {
        match self {
            InputFill::Ones => vec![1.0; n],
            InputFill::Uniform { seed } => gen_uniform(n, seed),
            InputFill::Signed { seed } => gen_data(n, seed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gen_data_deterministic() {
        assert_eq!(gen_data(100, 42), gen_data(100, 42));
        assert_ne!(gen_data(100, 42), gen_data(100, 43));
    }

    #[test]
    fn test_gen_data_range() {
        for x in gen_data(10000, 1) {
            assert!((-1.0..=1.0).contains(&x), "value {x} out of range");
        }
    }

    #[test]
    fn test_gen_uniform_range() {
        for x in gen_uniform(10000, 7) {
            assert!((0.0..1.0).contains(&x), "value {x} out of range");
        }
    }

    #[test]
    fn test_fill_ones() {
        assert_eq!(InputFill::Ones.generate(3), vec![1.0; 3]);
        assert_eq!(
            InputFill::Uniform { seed: 5 }.generate(8),
            gen_uniform(8, 5)
        );
    }
}
