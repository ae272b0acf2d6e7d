//! One case on one backend: inputs, oracle, protocol, comparison.

use std::sync::Arc;
use std::time::Instant;

use opk_core::{
    BackendHandle, DType, DeviceMemory, DeviceTensor, HostTensor, OperatorDescriptor, Result,
    Shape, TensorDesc, Workspace,
};
use opk_ops::oracle;
use opk_ops::{
    AvgPool, AvgPoolArgs, AvgPoolConfig, Rope, RopeArgs, RopeConfig, pool_output_shape,
};
use tracing::debug;

use crate::cases::{PoolCase, RopeCase, TableDtype};
use crate::compare::{Mismatch, compare};
use crate::config::ProfileConfig;
use crate::report::Timing;

/// Per-backend resources shared by every case on that backend.
pub(crate) struct BackendContext {
    pub handle: BackendHandle,
    pub memory: Arc<dyn DeviceMemory>,
    pub profile: ProfileConfig,
}

pub(crate) enum Verdict {
    Passed(Option<Timing>),
    Mismatch(Mismatch),
}

fn quantized(values: Vec<f32>, dtype: DType) -> Vec<f32> {
    values.into_iter().map(|v| dtype.quantize(v)).collect()
}

/// Mean wall time of `call` in milliseconds after `prerun` warm-up calls.
fn mean_ms(
    profile: &ProfileConfig,
    mut call: impl FnMut() -> Result<()>,
    sync: impl Fn() -> Result<()>,
) -> Result<f64> {
    for _ in 0..profile.prerun {
        call()?;
    }
    sync()?;
    let iterations = profile.iterations.max(1);
    let start = Instant::now();
    for _ in 0..iterations {
        call()?;
    }
    sync()?;
    Ok(start.elapsed().as_secs_f64() * 1e3 / iterations as f64)
}

pub(crate) fn run_avg_pool(ctx: &BackendContext, case: &PoolCase, dtype: DType) -> Result<Verdict> {
    let backend = ctx.handle.backend();
    let out_shape = pool_output_shape(&case.input, &case.params)?;
    debug!(input = %case.input, output = %out_shape, %dtype, "avg_pool shapes");

    let x_desc = TensorDesc::contiguous(case.input.clone(), dtype, backend)?;
    let y_desc = TensorDesc::contiguous(out_shape, dtype, backend)?;
    let x_host = HostTensor::from_f32(x_desc.clone(), &case.fill.generate(x_desc.numel()))?;
    let x_values = x_host.to_f32();
    let expected = quantized(oracle::avg_pool(&x_values, x_desc.shape(), &case.params)?, dtype);

    let x = DeviceTensor::upload(ctx.memory.clone(), &x_host)?;
    let mut y = DeviceTensor::upload(ctx.memory.clone(), &HostTensor::zeros(y_desc.clone()))?;

    let mut op = OperatorDescriptor::<AvgPool>::new();
    op.create(
        &ctx.handle,
        &AvgPoolConfig {
            y: &y_desc,
            x: &x_desc,
            params: &case.params,
        },
    )?;
    let size = op.query_workspace_size()?;
    debug!(workspace = size, "avg_pool descriptor sized");
    let ws = Workspace::allocate(ctx.memory.clone(), size)?;
    op.execute(&ws, AvgPoolArgs { y: &mut y, x: &x }, None)?;
    ctx.memory.synchronize(None)?;
    let actual = y.download()?.to_f32();

    let verdict = match compare(&actual, &expected, case.tolerance) {
        Err(m) => Verdict::Mismatch(m),
        Ok(()) if !ctx.profile.enabled => Verdict::Passed(None),
        Ok(()) => {
            let oracle_ms = mean_ms(
                &ctx.profile,
                || oracle::avg_pool(&x_values, x_desc.shape(), &case.params).map(drop),
                || Ok(()),
            )?;
            let native_ms = mean_ms(
                &ctx.profile,
                || op.execute(&ws, AvgPoolArgs { y: &mut y, x: &x }, None),
                || ctx.memory.synchronize(None),
            )?;
            Verdict::Passed(Some(Timing {
                oracle_ms,
                native_ms,
                iterations: ctx.profile.iterations,
            }))
        }
    };
    op.destroy()?;
    Ok(verdict)
}

pub(crate) fn run_rope(ctx: &BackendContext, case: &RopeCase, dtype: DType) -> Result<Verdict> {
    let backend = ctx.handle.backend();
    let dims = case.shape.dims();
    let (seq, dim) = (dims[0], dims[dims.len() - 1]);

    let t_contiguous = TensorDesc::contiguous(case.shape.clone(), dtype, backend)?;
    let t_host = HostTensor::from_f32(t_contiguous, &case.fill.generate(case.shape.numel()))?;
    let t_host = match &case.strides {
        Some(strides) => t_host.rearranged(strides)?,
        None => t_host,
    };
    let t_desc = t_host.desc().clone();

    let positions: Vec<u64> = (0..seq as u64).collect();
    let pos_desc = TensorDesc::contiguous(Shape::new([seq]), DType::U64, backend)?;
    let pos_host = HostTensor::from_u64(pos_desc.clone(), &positions)?;

    let table_dtype = case.table_dtype.resolve(dtype);
    let (sin, cos) = oracle::sin_cos_table(case.table_rows, dim, case.theta);
    let table_desc = TensorDesc::contiguous(Shape::new([case.table_rows, dim]), table_dtype, backend)?;
    let sin_host = HostTensor::from_f32(table_desc.clone(), &sin)?;
    let cos_host = HostTensor::from_f32(table_desc.clone(), &cos)?;

    let t_values = t_host.to_f32();
    let reference = match case.table_dtype {
        TableDtype::F32 => oracle::rotary_embedding(&t_values, &case.shape, &positions, case.theta)?,
        TableDtype::Tensor => oracle::rotary_embedding_with_tables(
            &t_values,
            &case.shape,
            &positions,
            &sin_host.to_f32(),
            &cos_host.to_f32(),
        )?,
    };
    let expected = quantized(reference, dtype);
    debug!(shape = %case.shape, layout = ?t_desc.layout(), %dtype, %table_dtype, "rope inputs built");

    let mut t = DeviceTensor::upload(ctx.memory.clone(), &t_host)?;
    let pos = DeviceTensor::upload(ctx.memory.clone(), &pos_host)?;
    let sin_dev = DeviceTensor::upload(ctx.memory.clone(), &sin_host)?;
    let cos_dev = DeviceTensor::upload(ctx.memory.clone(), &cos_host)?;

    let mut op = OperatorDescriptor::<Rope>::new();
    op.create(
        &ctx.handle,
        &RopeConfig {
            t: &t_desc,
            pos: &pos_desc,
            sin: &table_desc,
            cos: &table_desc,
        },
    )?;
    let size = op.query_workspace_size()?;
    debug!(workspace = size, "rope descriptor sized");
    let ws = Workspace::allocate(ctx.memory.clone(), size)?;
    let execute = |t: &mut DeviceTensor, op: &mut OperatorDescriptor<Rope>| {
        op.execute(
            &ws,
            RopeArgs {
                t,
                pos: &pos,
                sin: &sin_dev,
                cos: &cos_dev,
            },
            None,
        )
    };
    execute(&mut t, &mut op)?;
    ctx.memory.synchronize(None)?;
    let actual = t.download()?.to_f32();

    let verdict = match compare(&actual, &expected, case.tolerance) {
        Err(m) => Verdict::Mismatch(m),
        Ok(()) if !ctx.profile.enabled => Verdict::Passed(None),
        Ok(()) => {
            // In place: start the timed runs from the unrotated input.
            t.restore(&t_host)?;
            let oracle_ms = mean_ms(
                &ctx.profile,
                || oracle::rotary_embedding(&t_values, &case.shape, &positions, case.theta).map(drop),
                || Ok(()),
            )?;
            let native_ms = mean_ms(
                &ctx.profile,
                || execute(&mut t, &mut op),
                || ctx.memory.synchronize(None),
            )?;
            Verdict::Passed(Some(Timing {
                oracle_ms,
                native_ms,
                iterations: ctx.profile.iterations,
            }))
        }
    };
    op.destroy()?;
    Ok(verdict)
}
