//! What a sort records, as plain data: which kernel runs over which pass and
//! grid, where a barrier is needed and when the ping-pong buffers swap. The
//! orchestrator turns a `SortPlan` into compute passes; keeping it separate
//! lets the order be checked without a device.

use crate::config::{div_round_up, SortVariant, INIT_WORKGROUPS, RADIX, RADIX_PASSES};

/// Every kernel the sorter can dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kernel {
    InitSweep,
    GlobalHist,
    Scan,
    DigitBinningPass,
    Upsweep,
    ScanPartitions,
    Downsweep,
    Validate,
}

impl Kernel {
    pub fn entry_point(self) -> &'static str {
        match self {
            Kernel::InitSweep => "init_sweep",
            Kernel::GlobalHist => "global_hist",
            Kernel::Scan => "scan",
            Kernel::DigitBinningPass => "digit_binning_pass",
            Kernel::Upsweep => "upsweep",
            Kernel::ScanPartitions => "scan_partitions",
            Kernel::Downsweep => "downsweep",
            Kernel::Validate => "validate",
        }
    }
}

/// A workgroup count folded into up to three dimensions so that no dimension
/// exceeds the device limit. Kernels recover the flat index as
/// `x + y * nx + z * nx * ny` and discard indices past `count`.
///
/// A cap too small to hold `count` in three dimensions is raised to the cube
/// root of `count`. Real device limits (at least 65535) never need this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchGrid {
    pub x: u32,
    pub y: u32,
    pub z: u32,
    /// Workgroups actually needed; `x * y * z` may be larger.
    pub count: u32,
}

impl DispatchGrid {
    pub fn new(count: u32, max_per_dimension: u32) -> Self {
        let max = max_per_dimension.max(1).max(ceil_cbrt(count));
        if count <= max {
            return Self { x: count, y: 1, z: 1, count };
        }

        let x = max;
        let mut y = div_round_up(count, x);
        let mut z = 1;
        if y > max {
            z = div_round_up(y, max);
            y = max;
        }
        Self { x, y, z, count }
    }

    pub fn total(&self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_reshaped(&self) -> bool {
        self.y > 1 || self.z > 1
    }
}

/// Smallest `r` with `r^3 >= n`.
fn ceil_cbrt(n: u32) -> u32 {
    let n = n as u64;
    let mut r = (n as f64).cbrt().round() as u64;
    while r * r * r < n {
        r += 1;
    }
    while r > 0 && (r - 1) * (r - 1) * (r - 1) >= n {
        r -= 1;
    }
    r as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Dispatch {
        kernel: Kernel,
        pass: u32,
        grid: DispatchGrid,
    },
    /// Later dispatches read what earlier ones wrote.
    Barrier,
    /// Source and destination slots trade places.
    Swap,
}

/// Ordered recording of one sort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortPlan {
    steps: Vec<Step>,
}

impl SortPlan {
    pub fn new(
        variant: SortVariant,
        num_keys: u32,
        partitions: u32,
        hist_partitions: u32,
        max_per_dimension: u32,
    ) -> Self {
        let mut steps = Vec::new();
        if num_keys == 0 {
            return Self { steps };
        }

        let grid = |count: u32| DispatchGrid::new(count, max_per_dimension);
        let dispatch = |steps: &mut Vec<Step>, kernel: Kernel, pass: u32, count: u32| {
            steps.push(Step::Dispatch { kernel, pass, grid: grid(count) });
            steps.push(Step::Barrier);
        };

        dispatch(&mut steps, Kernel::InitSweep, 0, INIT_WORKGROUPS);
        match variant {
            SortVariant::OneSweep => {
                dispatch(&mut steps, Kernel::GlobalHist, 0, hist_partitions);
                dispatch(&mut steps, Kernel::Scan, 0, RADIX_PASSES);
                for pass in 0..RADIX_PASSES {
                    dispatch(&mut steps, Kernel::DigitBinningPass, pass, partitions);
                    steps.push(Step::Swap);
                }
            }
            SortVariant::DeviceRadix => {
                for pass in 0..RADIX_PASSES {
                    dispatch(&mut steps, Kernel::Upsweep, pass, partitions);
                    dispatch(&mut steps, Kernel::ScanPartitions, pass, RADIX);
                    dispatch(&mut steps, Kernel::Downsweep, pass, partitions);
                    steps.push(Step::Swap);
                }
            }
        }
        Self { steps }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Ping-pong index holding the result once the plan has run.
    pub fn final_slot(&self) -> usize {
        self.steps.iter().filter(|s| matches!(s, Step::Swap)).count() % 2
    }

    pub fn dispatches(&self) -> impl Iterator<Item = (Kernel, u32, DispatchGrid)> + '_ {
        self.steps.iter().filter_map(|s| match *s {
            Step::Dispatch { kernel, pass, grid } => Some((kernel, pass, grid)),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn small_grid_is_flat() {
        let grid = DispatchGrid::new(9, 65535);
        assert_eq!((grid.x, grid.y, grid.z), (9, 1, 1));
        assert!(!grid.is_reshaped());
    }

    #[test]
    fn grid_folds_into_second_and_third_dimension() {
        let grid = DispatchGrid::new(10, 4);
        assert_eq!((grid.x, grid.y, grid.z), (4, 3, 1));
        assert!(grid.is_reshaped());

        let grid = DispatchGrid::new(40, 4);
        assert_eq!((grid.x, grid.y, grid.z), (4, 4, 3));
        assert!(grid.total() >= 40);
    }

    #[test]
    fn cap_below_cube_root_is_raised() {
        // 4^3 = 64 cannot hold 2185 workgroups; 13^3 = 2197 can.
        let grid = DispatchGrid::new(2185, 4);
        assert_eq!((grid.x, grid.y, grid.z), (13, 13, 13));
        assert!(grid.total() >= 2185);

        let grid = DispatchGrid::new(u32::MAX, 1);
        assert!(grid.x.max(grid.y).max(grid.z) <= 1626);
        assert!(grid.total() >= u32::MAX as u64);
    }

    #[test]
    fn cube_root_rounds_up() {
        for (n, r) in [(0, 0), (1, 1), (2, 2), (8, 2), (9, 3), (27, 3), (2185, 13), (2197, 13), (u32::MAX, 1626)] {
            assert_eq!(ceil_cbrt(n), r, "cbrt({})", n);
        }
    }

    proptest! {
        #[test]
        fn grid_covers_count_within_limits(count in 0u32..5_000_000, max in 1u32..70_000) {
            let grid = DispatchGrid::new(count, max);
            let limit = max.max(ceil_cbrt(count));
            prop_assert!(grid.total() >= count as u64);
            prop_assert!(grid.x <= limit && grid.y <= limit && grid.z <= limit);
            if count > 0 {
                // Spare workgroups are fewer than one row.
                prop_assert!(grid.total() - (count as u64) < (grid.x as u64) * (grid.y as u64));
            }
        }
    }

    #[test]
    fn empty_sort_records_nothing() {
        let plan = SortPlan::new(SortVariant::OneSweep, 0, 0, 0, 65535);
        assert!(plan.is_empty());
        assert_eq!(plan.final_slot(), 0);
    }

    #[test]
    fn onesweep_plan_order() {
        let plan = SortPlan::new(SortVariant::OneSweep, 33_000, 9, 2, 65535);
        let kernels: Vec<(Kernel, u32)> = plan.dispatches().map(|(k, p, _)| (k, p)).collect();
        assert_eq!(
            kernels,
            vec![
                (Kernel::InitSweep, 0),
                (Kernel::GlobalHist, 0),
                (Kernel::Scan, 0),
                (Kernel::DigitBinningPass, 0),
                (Kernel::DigitBinningPass, 1),
                (Kernel::DigitBinningPass, 2),
                (Kernel::DigitBinningPass, 3),
            ]
        );
        assert_eq!(plan.final_slot(), 0);

        // Every dispatch is followed by a barrier.
        for window in plan.steps().windows(2) {
            if let Step::Dispatch { .. } = window[0] {
                assert_eq!(window[1], Step::Barrier);
            }
        }
    }

    #[test]
    fn device_radix_plan_order() {
        let plan = SortPlan::new(SortVariant::DeviceRadix, 3841, 2, 1, 65535);
        let kernels: Vec<Kernel> = plan.dispatches().map(|(k, _, _)| k).collect();
        assert_eq!(kernels.len(), 1 + 3 * RADIX_PASSES as usize);
        assert_eq!(kernels[0], Kernel::InitSweep);
        assert_eq!(&kernels[1..4], &[Kernel::Upsweep, Kernel::ScanPartitions, Kernel::Downsweep]);
        let scan_grid = plan
            .dispatches()
            .find(|(k, _, _)| *k == Kernel::ScanPartitions)
            .map(|(_, _, g)| g.count);
        assert_eq!(scan_grid, Some(RADIX));
        assert_eq!(plan.final_slot(), 0);
    }

    #[test]
    fn binning_grid_uses_partition_count() {
        let plan = SortPlan::new(SortVariant::OneSweep, 3840 * 70, 70, 9, 16);
        let grid = plan
            .dispatches()
            .find(|(k, _, _)| *k == Kernel::DigitBinningPass)
            .map(|(_, _, g)| g);
        assert_eq!(grid, Some(DispatchGrid { x: 16, y: 5, z: 1, count: 70 }));
    }
}
