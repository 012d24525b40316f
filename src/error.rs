use thiserror::Error;

use crate::config::SortVariant;

/// The adapter lacks something a sorting variant needs. Reported before any
/// kernel is built.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityError {
    #[error("adapter `{adapter}` supports no sorting variant (needs subgroup width >= 4, subgroup operations and SM5 compute)")]
    NoSupportedVariant { adapter: String },
    #[error("adapter `{adapter}` does not support the {variant:?} variant")]
    VariantUnsupported { adapter: String, variant: SortVariant },
}

#[derive(Debug, Error)]
pub enum SortError {
    #[error("no suitable gpu adapter found")]
    NoAdapter,
    #[error("failed to create device: {0}")]
    RequestDevice(#[from] wgpu::RequestDeviceError),
    #[error(transparent)]
    Capability(#[from] CapabilityError),
    #[error("failed to allocate buffer `{label}`: {source}")]
    Allocation { label: String, source: wgpu::Error },
    #[error("failed to build kernels `{label}`: {source}")]
    Kernel { label: String, source: wgpu::Error },
    #[error("{keys} keys exceed the maximum of {max} keys per sort")]
    TooManyKeys { keys: u32, max: u32 },
    #[error("buffer for {slot} holds {size} bytes, at least {required} needed")]
    BufferTooSmall { slot: String, size: u64, required: u64 },
    #[error("hash table of {requested} buckets cannot be rounded to a power of two")]
    HashTableTooLarge { requested: u32 },
    #[error("no buffer installed for {0}")]
    MissingBuffer(&'static str),
    #[error("kernel `{0}` is not part of this variant")]
    MissingKernel(&'static str),
    #[error("device reported {errors} invariant violation(s); sorted output is not trustworthy")]
    InvariantViolation { errors: u32 },
    #[error("buffer readback failed: {0}")]
    Readback(#[from] wgpu::BufferAsyncError),
}

pub type Result<T> = std::result::Result<T, SortError>;
