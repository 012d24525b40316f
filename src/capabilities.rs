//! Adapter capability probing and sorting-variant selection.
//!
//! The probe is split in two: `AdapterTraits::from_adapter` reads what wgpu
//! reports, and `Capabilities::from_traits` turns that into a decision. The
//! second half is pure, so the policy can be checked without a device.

use crate::config::{SortVariant, VariantPolicy};
use crate::error::CapabilityError;

/// Adapter names of software rasterisers that lack the forward progress
/// guarantees the lookback needs.
static SOFTWARE_ADAPTERS: [&str; 5] = [
    "llvmpipe",
    "lavapipe",
    "swiftshader",
    "microsoft basic render driver",
    "warp",
];

/// Raw facts about an adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterTraits {
    pub name: String,
    pub device_type: wgpu::DeviceType,
    pub min_subgroup_size: u32,
    pub max_subgroup_size: u32,
    pub subgroups: bool,
    pub shader_f16: bool,
    pub compute_shaders: bool,
    pub shader_model_sm5: bool,
    pub max_workgroups_per_dimension: u32,
    pub max_buffer_size: u64,
    pub max_storage_buffer_binding_size: u32,
}

impl AdapterTraits {
    pub fn from_adapter(adapter: &wgpu::Adapter) -> Self {
        let info = adapter.get_info();
        let features = adapter.features();
        let limits = adapter.limits();
        let downlevel = adapter.get_downlevel_capabilities();

        Self {
            name: info.name,
            device_type: info.device_type,
            min_subgroup_size: limits.min_subgroup_size,
            max_subgroup_size: limits.max_subgroup_size,
            subgroups: features.contains(wgpu::Features::SUBGROUP),
            shader_f16: features.contains(wgpu::Features::SHADER_F16),
            compute_shaders: downlevel
                .flags
                .contains(wgpu::DownlevelFlags::COMPUTE_SHADERS),
            shader_model_sm5: matches!(downlevel.shader_model, wgpu::ShaderModel::Sm5),
            max_workgroups_per_dimension: limits.max_compute_workgroups_per_dimension,
            max_buffer_size: limits.max_buffer_size,
            max_storage_buffer_binding_size: limits.max_storage_buffer_binding_size,
        }
    }

    /// True for CPU adapters and known software renderers.
    pub fn is_software(&self) -> bool {
        if self.device_type == wgpu::DeviceType::Cpu {
            return true;
        }
        let name = self.name.to_lowercase();
        SOFTWARE_ADAPTERS.iter().any(|s| name.contains(s))
    }
}

/// What the sorter may do on an adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub adapter_name: String,
    pub min_width: u32,
    pub max_width: u32,
    /// wgpu has no query for the total lane count of a device.
    pub total_lanes: Option<u32>,
    pub has_wave_intrinsics: bool,
    pub has_16bit_types: bool,
    pub is_software: bool,
    pub supports_base_variant: bool,
    pub supports_one_sweep: bool,
    pub max_workgroups_per_dimension: u32,
    /// Largest buffer the sorter can bind, the smaller of the buffer size and
    /// storage binding limits.
    pub max_binding_bytes: u64,
}

impl Capabilities {
    pub fn query(adapter: &wgpu::Adapter) -> Self {
        let caps = Self::from_traits(&AdapterTraits::from_adapter(adapter));
        log::info!(
            "adapter `{}`: subgroup width {}..{}, subgroups {}, f16 {}, base variant {}, onesweep {}",
            caps.adapter_name,
            caps.min_width,
            caps.max_width,
            caps.has_wave_intrinsics,
            caps.has_16bit_types,
            caps.supports_base_variant,
            caps.supports_one_sweep,
        );
        caps
    }

    pub fn from_traits(traits: &AdapterTraits) -> Self {
        let feature_level = traits.compute_shaders && traits.shader_model_sm5;
        let supports_base_variant =
            traits.min_subgroup_size >= 4 && traits.subgroups && feature_level;
        let is_software = traits.is_software();

        Self {
            adapter_name: traits.name.clone(),
            min_width: traits.min_subgroup_size,
            max_width: traits.max_subgroup_size,
            total_lanes: None,
            has_wave_intrinsics: traits.subgroups,
            has_16bit_types: traits.shader_f16,
            is_software,
            supports_base_variant,
            supports_one_sweep: supports_base_variant && !is_software,
            max_workgroups_per_dimension: traits.max_workgroups_per_dimension,
            max_binding_bytes: traits
                .max_buffer_size
                .min(traits.max_storage_buffer_binding_size as u64),
        }
    }

    pub fn supports(&self, variant: SortVariant) -> bool {
        match variant {
            SortVariant::DeviceRadix => self.supports_base_variant,
            SortVariant::OneSweep => self.supports_one_sweep,
        }
    }

    /// Resolves a policy to a concrete variant, or explains why none fits.
    pub fn select_variant(&self, policy: VariantPolicy) -> Result<SortVariant, CapabilityError> {
        match policy {
            VariantPolicy::Auto if self.supports_one_sweep => Ok(SortVariant::OneSweep),
            VariantPolicy::Auto if self.supports_base_variant => Ok(SortVariant::DeviceRadix),
            VariantPolicy::Auto => Err(CapabilityError::NoSupportedVariant {
                adapter: self.adapter_name.clone(),
            }),
            VariantPolicy::Require(variant) if self.supports(variant) => Ok(variant),
            VariantPolicy::Require(variant) => Err(CapabilityError::VariantUnsupported {
                adapter: self.adapter_name.clone(),
                variant,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn discrete_gpu() -> AdapterTraits {
        AdapterTraits {
            name: "NVIDIA GeForce RTX 3070".to_string(),
            device_type: wgpu::DeviceType::DiscreteGpu,
            min_subgroup_size: 32,
            max_subgroup_size: 32,
            subgroups: true,
            shader_f16: true,
            compute_shaders: true,
            shader_model_sm5: true,
            max_workgroups_per_dimension: 65535,
            max_buffer_size: 1 << 30,
            max_storage_buffer_binding_size: 1 << 28,
        }
    }

    #[test]
    fn discrete_gpu_runs_onesweep() {
        let caps = Capabilities::from_traits(&discrete_gpu());
        assert!(caps.supports_base_variant);
        assert!(caps.supports_one_sweep);
        assert_eq!(caps.max_binding_bytes, 1 << 28);
        assert_eq!(caps.select_variant(VariantPolicy::Auto), Ok(SortVariant::OneSweep));
    }

    #[test]
    fn software_adapter_never_runs_onesweep() {
        let traits = AdapterTraits {
            name: "llvmpipe (LLVM 15.0.7, 256 bits)".to_string(),
            device_type: wgpu::DeviceType::Cpu,
            min_subgroup_size: 8,
            max_subgroup_size: 8,
            ..discrete_gpu()
        };
        let caps = Capabilities::from_traits(&traits);
        assert!(caps.supports_base_variant);
        assert!(!caps.supports_one_sweep);
        assert_eq!(caps.select_variant(VariantPolicy::Auto), Ok(SortVariant::DeviceRadix));
        assert!(matches!(
            caps.select_variant(VariantPolicy::Require(SortVariant::OneSweep)),
            Err(CapabilityError::VariantUnsupported { .. })
        ));
    }

    #[test]
    fn software_renderer_detected_by_name() {
        let traits = AdapterTraits {
            name: "Microsoft Basic Render Driver".to_string(),
            device_type: wgpu::DeviceType::VirtualGpu,
            ..discrete_gpu()
        };
        assert!(traits.is_software());
        assert!(!Capabilities::from_traits(&traits).supports_one_sweep);
    }

    #[test]
    fn narrow_or_missing_subgroups_support_nothing() {
        let narrow = AdapterTraits {
            min_subgroup_size: 1,
            ..discrete_gpu()
        };
        let caps = Capabilities::from_traits(&narrow);
        assert!(!caps.supports_base_variant);
        assert!(!caps.supports_one_sweep);
        assert!(matches!(
            caps.select_variant(VariantPolicy::Auto),
            Err(CapabilityError::NoSupportedVariant { .. })
        ));

        let no_waves = AdapterTraits {
            subgroups: false,
            ..discrete_gpu()
        };
        assert!(!Capabilities::from_traits(&no_waves).supports_base_variant);

        let old_model = AdapterTraits {
            shader_model_sm5: false,
            ..discrete_gpu()
        };
        assert!(!Capabilities::from_traits(&old_model).supports_base_variant);
    }
}
