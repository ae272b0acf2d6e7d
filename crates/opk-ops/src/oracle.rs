//! Reference results computed on the host in f32.
//!
//! Inputs are logical row-major values already rounded to the tensor dtype, so
//! the only remaining precision loss is the final store.

use opk_core::{OpkError, Result, Shape};

use crate::shape_inference::{PoolParams, pool_output_shape};

// ── Average pooling ─────────────────────────────────────────────────────

/// Count-include-pad average pooling over spatial rank 1, 2 or 3.
///
/// Padding contributes zeros that still count toward the divisor. A window is
/// clipped only where it runs past the padded extent.
pub fn avg_pool(input: &[f32], shape: &Shape, params: &PoolParams) -> Result<Vec<f32>> {
    let out_shape = pool_output_shape(shape, params)?;
    let n = params.spatial_rank()?;
    if !(1..=3).contains(&n) {
        return Err(OpkError::Unsupported(format!(
            "average pooling over {n} spatial dims"
        )));
    }
    if input.len() != shape.numel() {
        return Err(OpkError::ShapeMismatch {
            expected: shape.dims().to_vec(),
            got: vec![input.len()],
        });
    }

    let in_dims = shape.dims();
    let in_strides = shape.contiguous_strides();
    let out_dims = out_shape.dims();
    let mut out = Vec::with_capacity(out_shape.numel());
    let mut out_index = vec![0usize; n + 2];
    let mut lo = vec![0isize; n];
    let mut extent = vec![0usize; n];
    let mut window = vec![0usize; n];

    loop {
        let mut count = 1usize;
        for d in 0..n {
            let start = (out_index[d + 2] * params.strides[d]) as isize - params.pads[d] as isize;
            let end = (start + params.kernel[d] as isize)
                .min((in_dims[d + 2] + params.pads[d]) as isize);
            lo[d] = start;
            extent[d] = (end - start) as usize;
            count *= extent[d];
        }

        let base = out_index[0] * in_strides[0] as usize + out_index[1] * in_strides[1] as usize;
        let mut sum = 0.0f32;
        window.iter_mut().for_each(|w| *w = 0);
        loop {
            let mut offset = Some(base);
            for d in 0..n {
                let pos = lo[d] + window[d] as isize;
                if pos < 0 || pos >= in_dims[d + 2] as isize {
                    offset = None;
                    break;
                }
                offset = offset.map(|o| o + pos as usize * in_strides[d + 2] as usize);
            }
            if let Some(o) = offset {
                sum += input[o];
            }
            if !advance(&mut window, &extent) {
                break;
            }
        }
        out.push(sum / count as f32);

        if !advance(&mut out_index, out_dims) {
            break;
        }
    }
    Ok(out)
}

/// Odometer increment; false once every index has wrapped.
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

// ── Rotary embedding ────────────────────────────────────────────────────

/// `freq[j] = theta^(-2j/dim)` for each channel pair.
pub fn frequencies(dim: usize, theta: f32) -> Vec<f32> {
    (0..dim / 2)
        .map(|j| 1.0 / theta.powf((2 * j) as f32 / dim as f32))
        .collect()
}

/// Sine and cosine tables of `rows × dim`, row `p` holding angles `p * freq[j]`.
///
/// Pair `j` occupies columns `2j` and `2j + 1` with identical values.
pub fn sin_cos_table(rows: usize, dim: usize, theta: f32) -> (Vec<f32>, Vec<f32>) {
    let freqs = frequencies(dim, theta);
    let mut sin = Vec::with_capacity(rows * dim);
    let mut cos = Vec::with_capacity(rows * dim);
    for p in 0..rows {
        for &f in &freqs {
            let angle = p as f32 * f;
            let (s, c) = angle.sin_cos();
            sin.extend([s, s]);
            cos.extend([c, c]);
        }
    }
    (sin, cos)
}

fn rope_dims(shape: &Shape, t: &[f32], pos: &[u64]) -> Result<(usize, usize, usize)> {
    let &[seq, heads, dim] = shape.dims() else {
        return Err(OpkError::Unsupported(format!(
            "rotary embedding over rank-{} tensor",
            shape.ndim()
        )));
    };
    if dim % 2 != 0 {
        return Err(OpkError::InvalidArgument(format!(
            "rotary embedding needs an even last dim, got {dim}"
        )));
    }
    if t.len() != shape.numel() || pos.len() != seq {
        return Err(OpkError::ShapeMismatch {
            expected: vec![shape.numel(), seq],
            got: vec![t.len(), pos.len()],
        });
    }
    Ok((seq, heads, dim))
}

/// Rotate each adjacent channel pair of a `(seq, heads, dim)` tensor by
/// `pos[p] * freq[j]`.
pub fn rotary_embedding(t: &[f32], shape: &Shape, pos: &[u64], theta: f32) -> Result<Vec<f32>> {
    let (_, heads, dim) = rope_dims(shape, t, pos)?;
    let freqs = frequencies(dim, theta);
    let mut out = t.to_vec();
    for (p, &position) in pos.iter().enumerate() {
        for h in 0..heads {
            let row = (p * heads + h) * dim;
            for (j, &f) in freqs.iter().enumerate() {
                let (s, c) = (position as f32 * f).sin_cos();
                let (a, b) = (t[row + 2 * j], t[row + 2 * j + 1]);
                out[row + 2 * j] = a * c - b * s;
                out[row + 2 * j + 1] = a * s + b * c;
            }
        }
    }
    Ok(out)
}

/// Same rotation, reading angles from precomputed `rows × dim` tables.
pub fn rotary_embedding_with_tables(
    t: &[f32],
    shape: &Shape,
    pos: &[u64],
    sin: &[f32],
    cos: &[f32],
) -> Result<Vec<f32>> {
    let (_, heads, dim) = rope_dims(shape, t, pos)?;
    if sin.len() != cos.len() || sin.len() % dim != 0 {
        return Err(OpkError::InvalidArgument(format!(
            "tables of {} and {} values do not fit dim {dim}",
            sin.len(),
            cos.len()
        )));
    }
    let rows = sin.len() / dim;
    let mut out = t.to_vec();
    for (p, &position) in pos.iter().enumerate() {
        let r = position as usize;
        if r >= rows {
            return Err(OpkError::InvalidArgument(format!(
                "position {position} outside table of {rows} rows"
            )));
        }
        let (s_row, c_row) = (&sin[r * dim..(r + 1) * dim], &cos[r * dim..(r + 1) * dim]);
        for h in 0..heads {
            let row = (p * heads + h) * dim;
            for j in 0..dim / 2 {
                let (c0, c1) = (2 * j, 2 * j + 1);
                let (a, b) = (t[row + c0], t[row + c1]);
                out[row + c0] = a * c_row[c0] - b * s_row[c0];
                out[row + c1] = a * s_row[c1] + b * c_row[c1];
            }
        }
    }
    Ok(out)
}
