/// Tuning parameters shared by the host code and the WGSL kernels. They are
/// injected into the shader source as `const` declarations, so changing one
/// here changes both sides.

/// Bits per digit.
pub static RADIX_LOG2: u32 = 8;
/// Number of digit values per pass.
pub static RADIX: u32 = 1 << RADIX_LOG2;
/// Number of digit passes for a 32-bit key.
pub static RADIX_PASSES: u32 = 32 / RADIX_LOG2;
/// Invocations per workgroup for every sorting kernel.
pub static WORKGROUP_SIZE: u32 = 256;
/// Keys each invocation owns during binning.
pub static KEYS_PER_THREAD: u32 = 15;
/// Keys per binning partition (one workgroup each).
pub static PARTITION_SIZE: u32 = WORKGROUP_SIZE * KEYS_PER_THREAD;
/// Keys per global histogram partition.
pub static GLOBAL_HIST_PARTITION_SIZE: u32 = 32768;
/// Workgroups used by the grid-stride initialisation kernel.
pub static INIT_WORKGROUPS: u32 = 256;
/// Lookback entries pack a 2-bit status above a 30-bit count, which bounds the
/// number of keys one sort can handle.
pub static MAX_KEYS: u32 = (1 << 30) - 1;
/// Iterations a workgroup may spin on a not-ready predecessor before it gives
/// up and reports the failure through the error counter.
pub static DEFAULT_LOOKBACK_SPIN_LIMIT: u32 = 1 << 22;

/// Ordering of the sorted output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// How the 32 key bits are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    U32,
    I32,
    F32,
}

impl KeyType {
    /// Maps a raw key to an unsigned value with the same ordering.
    pub fn to_sortable(self, bits: u32) -> u32 {
        match self {
            KeyType::U32 => bits,
            KeyType::I32 => bits ^ 0x8000_0000,
            KeyType::F32 => {
                if bits & 0x8000_0000 != 0 {
                    !bits
                } else {
                    bits | 0x8000_0000
                }
            }
        }
    }

    /// Inverse of `to_sortable`.
    pub fn from_sortable(self, bits: u32) -> u32 {
        match self {
            KeyType::U32 => bits,
            KeyType::I32 => bits ^ 0x8000_0000,
            KeyType::F32 => {
                if bits & 0x8000_0000 != 0 {
                    bits ^ 0x8000_0000
                } else {
                    !bits
                }
            }
        }
    }

    pub(crate) fn shader_id(self) -> u32 {
        match self {
            KeyType::U32 => 0,
            KeyType::I32 => 1,
            KeyType::F32 => 2,
        }
    }
}

/// Whether a payload array travels with the keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SortMode {
    KeysOnly,
    Pairs,
}

/// Sorting algorithm family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SortVariant {
    /// Reduce-then-scan: upsweep, scan and downsweep for every digit.
    DeviceRadix,
    /// Single binning sweep per digit with decoupled lookback.
    OneSweep,
}

/// How a sorter chooses its variant from the adapter capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VariantPolicy {
    /// OneSweep when the adapter supports it, DeviceRadix otherwise.
    Auto,
    /// Fail unless the adapter supports exactly this variant.
    Require(SortVariant),
}

/// Sorter configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortConfig {
    pub order: SortOrder,
    pub key_type: KeyType,
    pub mode: SortMode,
    pub variant: VariantPolicy,
    /// Caps the grid extent per dimension below the device limit. `None` uses
    /// the device limit as is. Mostly useful to exercise grid reshaping on
    /// small inputs.
    pub max_workgroups_per_dimension: Option<u32>,
    pub lookback_spin_limit: u32,
}

impl Default for SortConfig {
    fn default() -> Self {
        Self {
            order: SortOrder::Ascending,
            key_type: KeyType::U32,
            mode: SortMode::Pairs,
            variant: VariantPolicy::Auto,
            max_workgroups_per_dimension: None,
            lookback_spin_limit: DEFAULT_LOOKBACK_SPIN_LIMIT,
        }
    }
}

impl SortConfig {
    pub fn keys_only() -> Self {
        Self {
            mode: SortMode::KeysOnly,
            ..Default::default()
        }
    }

    pub fn with_order(mut self, order: SortOrder) -> Self {
        self.order = order;
        self
    }

    pub fn with_key_type(mut self, key_type: KeyType) -> Self {
        self.key_type = key_type;
        self
    }

    pub fn with_variant(mut self, variant: VariantPolicy) -> Self {
        self.variant = variant;
        self
    }

    /// Caps workgroups per grid dimension below the device limit. Grids that
    /// would not fit in three dimensions of `max` use a larger cap instead.
    pub fn with_max_workgroups_per_dimension(mut self, max: u32) -> Self {
        self.max_workgroups_per_dimension = Some(max);
        self
    }
}

/// Integer division rounding up.
pub fn div_round_up(x: u32, y: u32) -> u32 {
    x.div_ceil(y)
}
