//! Resource-scoping checks across tensors, workspaces and handles.

use std::sync::Arc;

use opk_core::{
    Backend, BackendHandle, DType, DeviceMemory, DeviceTensor, HostMemory, HostTensor,
    ProviderRegistry, Shape, TensorDesc, Workspace,
};
use proptest::prelude::*;

fn init_tracing() {
    let _ = tracing_subscriber::fmt::try_init();
}

fn host() -> Arc<HostMemory> {
    Arc::new(HostMemory::new())
}

/// Row-major strides with `gap[d]` spare elements after each extent.
fn padded_strides(dims: &[usize], gaps: &[usize]) -> Vec<isize> {
    let mut strides = vec![1isize; dims.len()];
    for d in (0..dims.len().saturating_sub(1)).rev() {
        strides[d] = strides[d + 1] * (dims[d + 1] + gaps[d + 1]) as isize;
    }
    strides
}

#[test]
fn test_workspace_reuse_starts_zeroed() {
    let mem = host();
    for round in 0..3u8 {
        let ws = Workspace::allocate(mem.clone(), 128).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts_mut(ws.as_mut_ptr().cast::<u8>(), 128) };
        assert!(bytes.iter().all(|&b| b == 0), "stale data in round {round}");
        bytes.fill(0xAB);
    }
    assert_eq!(mem.live_allocations(), 0);
}

#[test]
fn test_strided_tensor_survives_device_roundtrip() {
    let mem = host();
    let desc = TensorDesc::strided(Shape::new([2, 3, 4]), &[40, 8, 1], DType::F16, Backend::Cpu)
        .unwrap();
    let values: Vec<f32> = (0..24).map(|i| i as f32 * 0.5).collect();
    let host_tensor = HostTensor::from_f32(desc, &values).unwrap();
    let dev = DeviceTensor::upload(mem.clone(), &host_tensor).unwrap();
    assert_eq!(mem.live_bytes(), host_tensor.desc().storage_bytes());
    assert_eq!(dev.download().unwrap().to_f32(), values);
    drop(dev);
    assert_eq!(mem.live_allocations(), 0);
}

#[test]
fn test_registry_resolves_shared_provider() {
    let registry = ProviderRegistry::with_defaults();
    let a = registry.resolve(Backend::Cpu).unwrap();
    let b = registry.resolve(Backend::Cpu).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(a.backend(), Backend::Cpu);
}

#[test]
fn test_one_handle_per_backend() {
    init_tracing();
    let cpu = BackendHandle::open(Backend::Cpu, 0).unwrap();
    for backend in [Backend::Bang, Backend::Ascend, Backend::Musa] {
        assert!(BackendHandle::open(backend, 0).is_err());
    }
    assert_eq!(cpu.device_id(), 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn padded_layouts_keep_distinct_offsets(
        layout in prop::collection::vec((1usize..=4, 0usize..=3), 1..=4),
    ) {
        let dims: Vec<usize> = layout.iter().map(|l| l.0).collect();
        let gaps: Vec<usize> = layout.iter().map(|l| l.1).collect();
        let desc = TensorDesc::strided(
            Shape::new(&dims),
            &padded_strides(&dims, &gaps),
            DType::F32,
            Backend::Cpu,
        )
        .unwrap();
        let mut offsets = desc.offsets();
        prop_assert_eq!(offsets.len(), desc.numel());
        prop_assert!(offsets.iter().all(|&o| o < desc.storage_len()));
        offsets.sort_unstable();
        offsets.dedup();
        prop_assert_eq!(offsets.len(), desc.numel());
    }

    #[test]
    fn padded_layouts_survive_device_roundtrip(
        layout in prop::collection::vec((1usize..=4, 0usize..=2), 1..=3),
    ) {
        let mem = host();
        let dims: Vec<usize> = layout.iter().map(|l| l.0).collect();
        let gaps: Vec<usize> = layout.iter().map(|l| l.1).collect();
        let desc = TensorDesc::strided(
            Shape::new(&dims),
            &padded_strides(&dims, &gaps),
            DType::F16,
            Backend::Cpu,
        )
        .unwrap();
        let values: Vec<f32> = (0..desc.numel()).map(|i| i as f32 - 3.0).collect();
        let host_tensor = HostTensor::from_f32(desc, &values).unwrap();
        let dev = DeviceTensor::upload(mem.clone(), &host_tensor).unwrap();
        prop_assert_eq!(dev.download().unwrap().to_f32(), values);
        drop(dev);
        prop_assert_eq!(mem.live_allocations(), 0);
    }
}
