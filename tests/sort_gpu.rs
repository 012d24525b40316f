mod common;

use std::sync::Arc;

use futures::executor::block_on;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use sweep::config::{MAX_KEYS, PARTITION_SIZE};
use sweep::harness::{cpu_sort_pairs, sort_pairs, validate_sort};
use sweep::{
    GpuContext, KeyType, Ownership, RadixSorter, SlotId, SortConfig, SortError, SortOrder, SortVariant,
    VariantPolicy,
};

/// Context and sorter, or `None` (reported by `common::skip`) when this
/// machine cannot run the requested configuration.
fn setup(config: SortConfig) -> Option<(GpuContext, RadixSorter)> {
    let _ = env_logger::builder().is_test(true).try_init();
    let context = match block_on(GpuContext::new()) {
        Ok(context) => context,
        Err(e) => {
            common::skip(e);
            return None;
        }
    };
    match RadixSorter::from_context(&context, config) {
        Ok(sorter) => Some((context, sorter)),
        Err(SortError::Capability(e)) => {
            common::skip(e);
            None
        }
        Err(e) => panic!("failed to create sorter: {}", e),
    }
}

fn both_variants() -> [SortConfig; 2] {
    [
        SortConfig::default().with_variant(VariantPolicy::Require(SortVariant::OneSweep)),
        SortConfig::default().with_variant(VariantPolicy::Require(SortVariant::DeviceRadix)),
    ]
}

#[test]
#[serial_test::serial]
fn small_key_range_keeps_payload_order() {
    for config in both_variants() {
        let Some((context, mut sorter)) = setup(config) else { continue };

        let mut rng = StdRng::seed_from_u64(33);
        let keys: Vec<u32> = (0..33_000).map(|_| rng.gen_range(0..=16)).collect();
        let payload: Vec<u32> = (0..33_000).collect();

        let (sorted_keys, sorted_payload) = block_on(sort_pairs(&context, &mut sorter, &keys, &payload)).unwrap();
        let (expected_keys, expected_payload) = cpu_sort_pairs(&keys, &payload, KeyType::U32, SortOrder::Ascending);
        assert_eq!(sorted_keys, expected_keys);
        assert_eq!(sorted_payload, expected_payload);
    }
}

#[test]
#[serial_test::serial]
fn partition_boundary_sizes() {
    for config in both_variants() {
        let Some((context, mut sorter)) = setup(config) else { continue };
        for size in [0, 1, 2, PARTITION_SIZE - 1, PARTITION_SIZE, PARTITION_SIZE + 1, 32768 + 1] {
            assert!(
                block_on(validate_sort(&context, &mut sorter, size, size as u64)).unwrap(),
                "{:?} failed at {} keys",
                sorter.variant(),
                size
            );
        }
    }
}

#[test]
#[serial_test::serial]
fn descending_signed_and_float_keys() {
    let configs = [
        SortConfig::default().with_order(SortOrder::Descending),
        SortConfig::default().with_key_type(KeyType::I32),
        SortConfig::default().with_key_type(KeyType::F32),
        SortConfig::default()
            .with_key_type(KeyType::F32)
            .with_order(SortOrder::Descending),
    ];
    for config in configs {
        let Some((context, mut sorter)) = setup(config.clone()) else { return };
        assert!(
            block_on(validate_sort(&context, &mut sorter, 100_000, 5)).unwrap(),
            "{:?}",
            config
        );
    }
}

#[test]
#[serial_test::serial]
fn keys_only_mode() {
    let Some((context, mut sorter)) = setup(SortConfig::keys_only()) else { return };
    assert!(block_on(validate_sort(&context, &mut sorter, 50_000, 9)).unwrap());

    let (_, payload) = block_on(sort_pairs(&context, &mut sorter, &[3, 2, 1], &[7, 8, 9])).unwrap();
    assert!(payload.is_empty());
}

#[test]
#[serial_test::serial]
fn sorting_sorted_data_changes_nothing() {
    let Some((context, mut sorter)) = setup(SortConfig::default()) else { return };
    let (device, queue) = (context.device(), context.queue());

    let mut rng = StdRng::seed_from_u64(1);
    let keys: Vec<u32> = (0..20_000).map(|_| rng.gen_range(0..1000)).collect();
    let payload: Vec<u32> = (0..20_000).collect();
    let (first_keys, first_payload) = block_on(sort_pairs(&context, &mut sorter, &keys, &payload)).unwrap();

    block_on(sorter.sort(device, queue)).unwrap();
    assert_eq!(block_on(sorter.read_keys(device, queue)).unwrap(), first_keys);
    assert_eq!(block_on(sorter.read_payload(device, queue)).unwrap(), first_payload);
}

#[test]
#[serial_test::serial]
fn reshaped_grids_sort_correctly() {
    for config in both_variants() {
        let config = config.with_max_workgroups_per_dimension(16);
        let Some((context, mut sorter)) = setup(config) else { continue };
        assert_eq!(sorter.max_workgroups_per_dimension(), 16);

        // 547 partitions fold into a 16 x 16 x 3 grid.
        sorter.update_size(context.device(), 1 << 21, true).unwrap();
        let plan = sorter.plan();
        assert!(plan.dispatches().all(|(_, _, grid)| grid.x <= 16));
        assert!(plan.dispatches().any(|(_, _, grid)| grid.is_reshaped()));

        for size in [16 * PARTITION_SIZE - 1, 16 * PARTITION_SIZE, 1 << 21] {
            assert!(block_on(validate_sort(&context, &mut sorter, size, 3)).unwrap());
        }
    }
}

#[test]
#[serial_test::serial]
fn device_side_validation_counts_inversions() {
    let Some((context, mut sorter)) = setup(SortConfig::default()) else { return };
    let (device, queue) = (context.device(), context.queue());

    let keys: Vec<u32> = (0..10_000).rev().collect();
    sorter.update_size(device, 10_000, true).unwrap();
    sorter.upload_keys(queue, &keys).unwrap();
    assert_eq!(block_on(sorter.validate_on_device(device, queue)).unwrap(), 9_999);

    block_on(sorter.sort(device, queue)).unwrap();
    assert_eq!(block_on(sorter.validate_on_device(device, queue)).unwrap(), 0);
}

#[test]
#[serial_test::serial]
fn borrowed_buffers_survive_dispose() {
    let Some((context, mut sorter)) = setup(SortConfig::default()) else { return };
    let (device, queue) = (context.device(), context.queue());
    let size = 5_000u32;

    let make = |label: &str, words: u32| {
        Arc::new(device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: words as u64 * 4,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        }))
    };

    sorter.update_size(device, size, true).unwrap();
    let too_small = sorter.set_buffer(device, SlotId::Keys, make("small", size - 1), Ownership::Borrowed);
    assert!(matches!(too_small, Err(SortError::BufferTooSmall { .. })));

    let keys = make("keys", size);
    sorter
        .set_all_buffers(device, keys.clone(), make("payload", size), make("alt keys", size), make("alt payload", size))
        .unwrap();
    assert_eq!(sorter.buffers().ownership(SlotId::Keys), Ownership::Borrowed);

    let data: Vec<u32> = (0..size).map(|i| i.wrapping_mul(2_654_435_761)).collect();
    sorter.upload_keys(queue, &data).unwrap();
    block_on(sorter.sort(device, queue)).unwrap();
    sorter.dispose();

    let mut expected = data.clone();
    expected.sort_unstable();
    let sorted: Vec<u32> = block_on(sweep::read_buffer(device, queue, &keys, size as u64 * 4)).unwrap();
    assert_eq!(sorted, expected);
}

#[test]
#[serial_test::serial]
fn oversized_inputs_are_rejected() {
    let Some((context, mut sorter)) = setup(SortConfig::default()) else { return };
    let result = sorter.update_size(context.device(), MAX_KEYS + 1, true);
    assert!(matches!(result, Err(SortError::TooManyKeys { .. })));
    assert_eq!(sorter.num_keys(), 0);
}

#[test]
#[serial_test::serial]
fn full_schedule_with_small_grid_cap() {
    let config = SortConfig::default().with_max_workgroups_per_dimension(64);
    let Some((context, _)) = setup(config.clone()) else { return };
    let summary = block_on(sweep::harness::test_all(&context, config, 960, 1 << 30)).unwrap();
    assert_eq!(summary.expected, 5 + 3 + 3);
    assert!(summary.all_passed(), "{} / {}", summary.passed, summary.expected);
    assert!(summary.skipped.is_empty());
}

#[test]
#[serial_test::serial]
fn device_errors_surface_as_invariant_violation() {
    let Some((context, mut sorter)) = setup(SortConfig::default()) else { return };
    let (device, queue) = (context.device(), context.queue());

    sorter.update_size(device, 1_000, true).unwrap();
    queue.write_buffer(sorter.buffers().error_count(), 0, bytemuck::bytes_of(&3u32));
    match block_on(sorter.check_errors(device, queue)) {
        Err(SortError::InvariantViolation { errors }) => assert_eq!(errors, 3),
        other => panic!("expected an invariant violation, got {:?}", other),
    }

    // A real sort resets the counter.
    let keys: Vec<u32> = (0..1_000).rev().collect();
    sorter.upload_keys(queue, &keys).unwrap();
    block_on(sorter.sort(device, queue)).unwrap();
    block_on(sorter.check_errors(device, queue)).unwrap();
}

#[test]
#[serial_test::serial]
fn empty_sort_clears_stale_error_count() {
    let Some((context, mut sorter)) = setup(SortConfig::default()) else { return };
    let (device, queue) = (context.device(), context.queue());

    sorter.update_size(device, 1_000, true).unwrap();
    queue.write_buffer(sorter.buffers().error_count(), 0, bytemuck::bytes_of(&5u32));
    sorter.update_size(device, 0, true).unwrap();

    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("empty sort") });
    sorter.record_sort(device, queue, &mut encoder).unwrap();
    queue.submit(Some(encoder.finish()));
    block_on(sorter.check_errors(device, queue)).unwrap();
}

/// Sorts at the scale sizes of the validation schedule. Run with
/// `cargo test -- --ignored` on a machine with a few hundred MiB of VRAM.
fn scale_size_sorts(size: u32) {
    for config in both_variants() {
        let Some((context, mut sorter)) = setup(config) else { continue };
        assert!(
            block_on(validate_sort(&context, &mut sorter, size, size as u64)).unwrap(),
            "{:?} failed at {} keys",
            sorter.variant(),
            size
        );
    }
}

#[test]
#[ignore]
#[serial_test::serial]
fn sorts_four_million_keys() {
    scale_size_sorts(1 << 22);
}

#[test]
#[ignore]
#[serial_test::serial]
fn sorts_eight_million_keys() {
    scale_size_sorts(1 << 23);
}
