//! Correctness and throughput checks: a CPU reference sort, the size schedule
//! of `test_all`, and batch timing over inputs of reduced bit entropy.

use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::buffers::{partition_counts, pass_hist_entries};
use crate::config::{
    KeyType, SortConfig, SortMode, SortOrder, SortVariant, MAX_KEYS, PARTITION_SIZE, RADIX, RADIX_PASSES,
};
use crate::error::{Result, SortError};
use crate::gpu::GpuContext;
use crate::radix_sort::RadixSorter;

/// Stable CPU sort of `keys` (raw bits of `key_type`) carrying `payload`.
pub fn cpu_sort_pairs(
    keys: &[u32],
    payload: &[u32],
    key_type: KeyType,
    order: SortOrder,
) -> (Vec<u32>, Vec<u32>) {
    let mut pairs: Vec<(u32, u32)> = keys.iter().copied().zip(payload.iter().copied()).collect();
    match order {
        SortOrder::Ascending => pairs.sort_by_key(|&(k, _)| key_type.to_sortable(k)),
        SortOrder::Descending => pairs.sort_by_key(|&(k, _)| !key_type.to_sortable(k)),
    }
    pairs.into_iter().unzip()
}

/// Random key bits for `key_type`. Floats stay finite.
pub fn random_keys(size: u32, seed: u64, key_type: KeyType) -> Vec<u32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..size)
        .map(|_| match key_type {
            KeyType::U32 | KeyType::I32 => rng.gen::<u32>(),
            KeyType::F32 => rng.gen_range(-1.0e6f32..1.0e6).to_bits(),
        })
        .collect()
}

/// Input distributions of decreasing bit entropy. Preset `n` ANDs `n` uniform
/// random words together, so each bit is set with probability `2^-n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntropyPreset {
    Full,
    High,
    Medium,
    Low,
    Minimal,
}

impl EntropyPreset {
    pub fn all() -> [EntropyPreset; 5] {
        [
            EntropyPreset::Full,
            EntropyPreset::High,
            EntropyPreset::Medium,
            EntropyPreset::Low,
            EntropyPreset::Minimal,
        ]
    }

    /// Preset by its 1-based level.
    pub fn from_level(level: u8) -> Option<Self> {
        Self::all().get((level as usize).checked_sub(1)?).copied()
    }

    pub fn level(self) -> u8 {
        match self {
            EntropyPreset::Full => 1,
            EntropyPreset::High => 2,
            EntropyPreset::Medium => 3,
            EntropyPreset::Low => 4,
            EntropyPreset::Minimal => 5,
        }
    }

    /// Shannon entropy per key bit.
    pub fn bit_entropy(self) -> f64 {
        match self {
            EntropyPreset::Full => 1.0,
            EntropyPreset::High => 0.811,
            EntropyPreset::Medium => 0.544,
            EntropyPreset::Low => 0.337,
            EntropyPreset::Minimal => 0.201,
        }
    }

    pub fn generate(self, size: u32, seed: u64) -> Vec<u32> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..size)
            .map(|_| (0..self.level()).fold(u32::MAX, |acc, _| acc & rng.gen::<u32>()))
            .collect()
    }
}

/// Uploads `keys` and `payload`, sorts and reads both back. `payload` is
/// ignored by keys-only sorters.
pub async fn sort_pairs(
    context: &GpuContext,
    sorter: &mut RadixSorter,
    keys: &[u32],
    payload: &[u32],
) -> Result<(Vec<u32>, Vec<u32>)> {
    let size = u32::try_from(keys.len()).map_err(|_| SortError::TooManyKeys {
        keys: u32::MAX,
        max: MAX_KEYS,
    })?;
    let (device, queue) = (context.device(), context.queue());

    sorter.update_size(device, size, true)?;
    sorter.upload_keys(queue, keys)?;
    sorter.upload_payload(queue, payload)?;
    sorter.sort(device, queue).await?;

    let sorted_keys = sorter.read_keys(device, queue).await?;
    let sorted_payload = sorter.read_payload(device, queue).await?;
    Ok((sorted_keys, sorted_payload))
}

/// Sorts `size` random keys with payload `0..size` and compares against the
/// CPU reference. Device-reported invariant violations count as a failed
/// validation rather than an error.
pub async fn validate_sort(
    context: &GpuContext,
    sorter: &mut RadixSorter,
    size: u32,
    seed: u64,
) -> Result<bool> {
    let config = sorter.config().clone();
    let keys = random_keys(size, seed, config.key_type);
    let payload: Vec<u32> = (0..size).collect();

    let (sorted_keys, sorted_payload) = match sort_pairs(context, sorter, &keys, &payload).await {
        Ok(result) => result,
        Err(SortError::InvariantViolation { errors }) => {
            log::warn!("size {}: device reported {} error(s)", size, errors);
            return Ok(false);
        }
        Err(e) => return Err(e),
    };

    let (expected_keys, expected_payload) = cpu_sort_pairs(&keys, &payload, config.key_type, config.order);
    if sorted_keys != expected_keys {
        let first = sorted_keys
            .iter()
            .zip(expected_keys.iter())
            .position(|(a, b)| a != b);
        log::warn!("size {}: keys differ, first mismatch at {:?}", size, first);
        return Ok(false);
    }
    // A stable sort reproduces the reference payload exactly.
    if config.mode == SortMode::Pairs && sorted_payload != expected_payload {
        log::warn!("size {}: payload does not follow its keys", size);
        return Ok(false);
    }
    Ok(true)
}

/// Outcome of `test_all`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestSummary {
    pub passed: u32,
    pub expected: u32,
    /// Sizes not run because they exceed the device memory limits or failed
    /// to allocate.
    pub skipped: Vec<u32>,
}

impl TestSummary {
    pub fn all_passed(&self) -> bool {
        self.passed == self.expected
    }
}

/// Device memory needed to sort `size` keys, per buffer: the largest of a
/// key buffer and the OneSweep pass histogram.
pub fn largest_buffer_bytes(size: u32) -> u64 {
    let keys = size as u64 * 4;
    let partitions = size.div_ceil(PARTITION_SIZE) as u64;
    let pass_hist = partitions * RADIX as u64 * RADIX_PASSES as u64 * 4;
    keys.max(pass_hist)
}

/// Device memory one `validate_sort` of `size` keys holds at once: four data
/// slots, the readback staging buffer, the largest pass histogram and a
/// fixed allowance for scratch buffers.
pub fn sort_memory_bytes(size: u32) -> u64 {
    let (partitions, _) = partition_counts(size);
    let data = 5 * size as u64 * 4;
    let pass_hist = pass_hist_entries(SortVariant::OneSweep, partitions) * 4;
    let scratch = (RADIX as u64 * RADIX_PASSES as u64 + (1 << 20)) * 4;
    data + pass_hist + scratch
}

/// Sizes `test_all` runs, and the ones it has to skip because a single
/// buffer would exceed `max_binding_bytes` or the whole sort would exceed
/// `memory_budget`.
pub fn test_schedule(
    stride: u32,
    max_per_dimension: u32,
    max_binding_bytes: u64,
    memory_budget: u64,
) -> (Vec<u32>, Vec<u32>) {
    let stride = stride.max(1);
    let mut candidates: Vec<u64> = (PARTITION_SIZE..=2 * PARTITION_SIZE)
        .step_by(stride as usize)
        .map(u64::from)
        .collect();
    if candidates.last() != Some(&(2 * PARTITION_SIZE as u64)) {
        candidates.push(2 * PARTITION_SIZE as u64);
    }
    candidates.extend([1 << 21, 1 << 22, 1 << 23]);
    let grid_limit = max_per_dimension as u64 * PARTITION_SIZE as u64;
    candidates.extend([grid_limit.saturating_sub(1), grid_limit, grid_limit + (1 << 20)]);

    let mut sizes = Vec::new();
    let mut skipped = Vec::new();
    for candidate in candidates {
        match u32::try_from(candidate) {
            Ok(size)
                if size <= MAX_KEYS
                    && largest_buffer_bytes(size) <= max_binding_bytes
                    && sort_memory_bytes(size) <= memory_budget =>
            {
                sizes.push(size)
            }
            Ok(size) => skipped.push(size),
            Err(_) => skipped.push(u32::MAX),
        }
    }
    (sizes, skipped)
}

/// Validates every size of the schedule with one sorter built from `config`.
/// Sizes whose buffers the device refuses to allocate are moved to
/// `skipped` instead of failing the run.
pub async fn test_all(
    context: &GpuContext,
    config: SortConfig,
    stride: u32,
    memory_budget: u64,
) -> Result<TestSummary> {
    let mut sorter = RadixSorter::from_context(context, config)?;
    let (sizes, skipped) = test_schedule(
        stride,
        sorter.max_workgroups_per_dimension(),
        context.capabilities.max_binding_bytes,
        memory_budget,
    );
    for size in skipped.iter() {
        log::warn!("skipping {} keys: exceeds device memory limits", size);
    }

    let mut summary = TestSummary {
        passed: 0,
        expected: sizes.len() as u32,
        skipped,
    };
    for (i, size) in sizes.iter().enumerate() {
        match validate_sort(context, &mut sorter, *size, i as u64).await {
            Ok(true) => summary.passed += 1,
            Ok(false) => log::error!("{:?} failed at {} keys", sorter.variant(), size),
            Err(SortError::Allocation { label, source }) => {
                log::warn!("skipping {} keys: could not allocate {}: {}", size, label, source);
                summary.expected -= 1;
                summary.skipped.push(*size);
            }
            Err(e) => return Err(e),
        }
    }
    sorter.dispose();

    log::info!(
        "{:?}: {}/{} sizes passed, {} skipped",
        sorter.variant(),
        summary.passed,
        summary.expected,
        summary.skipped.len()
    );
    Ok(summary)
}

/// Timing of a batch of sorts, in milliseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct TimingStats {
    pub size: u32,
    pub batch: u32,
    pub entropy: EntropyPreset,
    pub mean_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub median_ms: f64,
    pub p95_ms: f64,
    /// Throughput at the median time.
    pub mkeys_per_sec: f64,
}

impl TimingStats {
    pub fn from_samples(size: u32, entropy: EntropyPreset, samples: &[f64]) -> Self {
        let mut sorted = samples.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let mean = if sorted.is_empty() {
            0.0
        } else {
            sorted.iter().sum::<f64>() / sorted.len() as f64
        };
        let median = percentile(&sorted, 50.0);
        Self {
            size,
            batch: samples.len() as u32,
            entropy,
            mean_ms: mean,
            min_ms: sorted.first().copied().unwrap_or(0.0),
            max_ms: sorted.last().copied().unwrap_or(0.0),
            median_ms: median,
            p95_ms: percentile(&sorted, 95.0),
            mkeys_per_sec: if median > 0.0 {
                size as f64 / (median / 1000.0) / 1e6
            } else {
                0.0
            },
        }
    }
}

/// Linear interpolation between the closest ranks of an ascending slice.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = (p / 100.0) * (sorted.len() - 1) as f64;
    let lo = idx.floor() as usize;
    let hi = idx.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        sorted[lo] + (sorted[hi] - sorted[lo]) * (idx - lo as f64)
    }
}

/// Sorts `batch` times (after one warm-up run) and reports wall-clock time
/// per sort, from submission until the device is idle.
pub async fn batch_timing(
    context: &GpuContext,
    config: SortConfig,
    size: u32,
    batch: u32,
    seed: u64,
    entropy: EntropyPreset,
) -> Result<TimingStats> {
    let (device, queue) = (context.device(), context.queue());
    let mut sorter = RadixSorter::from_context(context, config)?;
    sorter.update_size(device, size, true)?;

    let keys = entropy.generate(size, seed);
    let payload: Vec<u32> = (0..size).collect();

    let mut samples = Vec::with_capacity(batch as usize);
    for run in 0..=batch {
        sorter.upload_keys(queue, &keys)?;
        sorter.upload_payload(queue, &payload)?;
        queue.submit(None);
        device.poll(wgpu::Maintain::Wait);

        let start = Instant::now();
        sorter.sort(device, queue).await?;
        let elapsed = start.elapsed().as_secs_f64() * 1000.0;
        // Run 0 warms up caches and pipelines.
        if run > 0 {
            samples.push(elapsed);
        }
    }
    sorter.dispose();

    let stats = TimingStats::from_samples(size, entropy, &samples);
    log::info!(
        "{} keys, entropy {:.3}: median {:.3} ms, {:.1} Mkeys/s",
        size,
        entropy.bit_entropy(),
        stats.median_ms,
        stats.mkeys_per_sec
    );
    Ok(stats)
}
