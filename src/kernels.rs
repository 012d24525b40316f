//! WGSL kernel modules, their bind group layout and compute pipelines.

use std::collections::HashMap;

use crate::config::{
    SortVariant, GLOBAL_HIST_PARTITION_SIZE, KEYS_PER_THREAD, PARTITION_SIZE, RADIX, RADIX_LOG2,
    RADIX_PASSES, WORKGROUP_SIZE,
};
use crate::dispatch::{DispatchGrid, Kernel};
use crate::error::{Result, SortError};

static COMMON_SHADER: &str = include_str!("shaders/common.wgsl");
static ONESWEEP_SHADER: &str = include_str!("shaders/onesweep.wgsl");
static DEVICE_RADIX_SHADER: &str = include_str!("shaders/device_radix.wgsl");

/// Lookback entry status, kept in the top two bits of a pass histogram entry.
pub static FLAG_NOT_READY: u32 = 0;
pub static FLAG_REDUCTION: u32 = 1 << 30;
pub static FLAG_INCLUSIVE: u32 = 2 << 30;
pub static FLAG_MASK: u32 = 3 << 30;
pub static VALUE_MASK: u32 = (1 << 30) - 1;

/// Uniform block of the sorting kernels. Must match `SortParams` in
/// `common.wgsl`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SortParams {
    pub num_keys: u32,
    pub partitions: u32,
    pub hist_partitions: u32,
    pub pass_index: u32,
    pub shift: u32,
    pub key_type: u32,
    pub descending: u32,
    pub sort_payload: u32,
    pub spin_limit: u32,
    pub _pad: [u32; 3],
}

unsafe impl bytemuck::Pod for SortParams {}
unsafe impl bytemuck::Zeroable for SortParams {}

/// Tuning constants as WGSL declarations, prepended to every sorting module.
pub fn shader_prelude() -> String {
    format!(
        "const RADIX_LOG2: u32 = {}u;\n\
         const RADIX: u32 = {}u;\n\
         const RADIX_MASK: u32 = {}u;\n\
         const RADIX_PASSES: u32 = {}u;\n\
         const WORKGROUP_SIZE: u32 = {}u;\n\
         const KEYS_PER_THREAD: u32 = {}u;\n\
         const PARTITION_SIZE: u32 = {}u;\n\
         const GLOBAL_HIST_PARTITION_SIZE: u32 = {}u;\n\
         const FLAG_NOT_READY: u32 = {}u;\n\
         const FLAG_REDUCTION: u32 = {}u;\n\
         const FLAG_INCLUSIVE: u32 = {}u;\n\
         const FLAG_MASK: u32 = {}u;\n\
         const VALUE_MASK: u32 = {}u;\n",
        RADIX_LOG2,
        RADIX,
        RADIX - 1,
        RADIX_PASSES,
        WORKGROUP_SIZE,
        KEYS_PER_THREAD,
        PARTITION_SIZE,
        GLOBAL_HIST_PARTITION_SIZE,
        FLAG_NOT_READY,
        FLAG_REDUCTION,
        FLAG_INCLUSIVE,
        FLAG_MASK,
        VALUE_MASK,
    )
}

/// Complete WGSL source of one variant.
pub fn compose_shader(variant: SortVariant) -> String {
    let body = match variant {
        SortVariant::OneSweep => ONESWEEP_SHADER,
        SortVariant::DeviceRadix => DEVICE_RADIX_SHADER,
    };
    format!("{}\n{}\n{}", shader_prelude(), COMMON_SHADER, body)
}

/// Entry points compiled for a variant.
pub fn variant_kernels(variant: SortVariant) -> &'static [Kernel] {
    match variant {
        SortVariant::OneSweep => &[
            Kernel::InitSweep,
            Kernel::GlobalHist,
            Kernel::Scan,
            Kernel::DigitBinningPass,
            Kernel::Validate,
        ],
        SortVariant::DeviceRadix => &[
            Kernel::InitSweep,
            Kernel::Upsweep,
            Kernel::ScanPartitions,
            Kernel::Downsweep,
            Kernel::Validate,
        ],
    }
}

/// One entry of a bind group layout.
pub struct BindGroupInfo {
    pub binding: u32,
    pub visibility: wgpu::ShaderStages,
    pub binding_type: wgpu::BindingType,
}

pub fn uniform_binding(binding: u32) -> BindGroupInfo {
    BindGroupInfo {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        binding_type: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
    }
}

pub fn storage_binding(binding: u32, read_only: bool) -> BindGroupInfo {
    BindGroupInfo {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        binding_type: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
    }
}

/// Params, keys in/out, payload in/out, global histogram, pass histogram,
/// pass index counters and the error counter.
pub fn sort_bind_group_infos() -> Vec<BindGroupInfo> {
    vec![
        uniform_binding(0),
        storage_binding(1, true),
        storage_binding(2, false),
        storage_binding(3, true),
        storage_binding(4, false),
        storage_binding(5, false),
        storage_binding(6, false),
        storage_binding(7, false),
        storage_binding(8, false),
    ]
}

pub fn create_bind_group_layout(
    device: &wgpu::Device,
    label: &str,
    infos: &[BindGroupInfo],
) -> wgpu::BindGroupLayout {
    let layout_entries: Vec<wgpu::BindGroupLayoutEntry> = infos
        .iter()
        .map(|x| wgpu::BindGroupLayoutEntry {
            binding: x.binding,
            visibility: x.visibility,
            ty: x.binding_type,
            count: None,
        })
        .collect();

    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some(label),
        entries: &layout_entries,
    })
}

/// Compiles `source` and creates one pipeline per entry point. Shader or
/// pipeline validation failures come back as `SortError::Kernel`.
pub fn create_pipelines(
    device: &wgpu::Device,
    label: &str,
    source: &str,
    layout: &wgpu::BindGroupLayout,
    entry_points: &[&'static str],
) -> Result<HashMap<&'static str, wgpu::ComputePipeline>> {
    device.push_error_scope(wgpu::ErrorFilter::Validation);

    let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    });
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(label),
        bind_group_layouts: &[layout],
        push_constant_ranges: &[],
    });

    let pipelines = entry_points
        .iter()
        .map(|&entry_point| {
            let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(entry_point),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point,
                compilation_options: Default::default(),
                cache: None,
            });
            (entry_point, pipeline)
        })
        .collect();

    match futures::executor::block_on(device.pop_error_scope()) {
        Some(source) => Err(SortError::Kernel {
            label: label.to_string(),
            source,
        }),
        None => Ok(pipelines),
    }
}

/// Compiled kernels of one sorting variant.
pub struct KernelSet {
    variant: SortVariant,
    layout: wgpu::BindGroupLayout,
    pipelines: HashMap<Kernel, wgpu::ComputePipeline>,
}

impl KernelSet {
    pub fn new(device: &wgpu::Device, variant: SortVariant) -> Result<Self> {
        let label = match variant {
            SortVariant::OneSweep => "onesweep",
            SortVariant::DeviceRadix => "device radix",
        };
        let layout = create_bind_group_layout(device, label, &sort_bind_group_infos());
        let kernels = variant_kernels(variant);
        let entry_points: Vec<&'static str> = kernels.iter().map(|k| k.entry_point()).collect();
        let mut compiled =
            create_pipelines(device, label, &compose_shader(variant), &layout, &entry_points)?;

        let pipelines = kernels
            .iter()
            .filter_map(|k| compiled.remove(k.entry_point()).map(|p| (*k, p)))
            .collect();

        log::debug!("compiled {} kernels for {:?}", kernels.len(), variant);
        Ok(Self {
            variant,
            layout,
            pipelines,
        })
    }

    pub fn variant(&self) -> SortVariant {
        self.variant
    }

    pub fn layout(&self) -> &wgpu::BindGroupLayout {
        &self.layout
    }

    pub fn pipeline(&self, kernel: Kernel) -> Option<&wgpu::ComputePipeline> {
        self.pipelines.get(&kernel)
    }
}

/// A pipeline, its bind group and a grid, ready to be recorded.
pub struct KernelDispatch<'a> {
    pub pipeline: &'a wgpu::ComputePipeline,
    pub bind_group: &'a wgpu::BindGroup,
    pub grid: DispatchGrid,
}

impl<'a> KernelDispatch<'a> {
    pub fn record(&self, pass: &mut wgpu::ComputePass) {
        if self.grid.is_empty() {
            return;
        }
        pass.set_pipeline(self.pipeline);
        pass.set_bind_group(0, self.bind_group, &[]);
        pass.dispatch_workgroups(self.grid.x, self.grid.y, self.grid.z);
    }

    /// Records the dispatch in a compute pass of its own.
    pub fn execute(&self, encoder: &mut wgpu::CommandEncoder, label: &str) {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(label),
            timestamp_writes: None,
        });
        self.record(&mut pass);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_match_uniform_layout() {
        assert_eq!(std::mem::size_of::<SortParams>(), 48);
        assert_eq!(std::mem::size_of::<SortParams>() % 16, 0);
    }

    #[test]
    fn flags_do_not_overlap_values() {
        assert_eq!(FLAG_REDUCTION & VALUE_MASK, 0);
        assert_eq!(FLAG_INCLUSIVE & VALUE_MASK, 0);
        assert_eq!(FLAG_MASK | VALUE_MASK, u32::MAX);
        assert_eq!((FLAG_REDUCTION | 17) & FLAG_MASK, FLAG_REDUCTION);
        // Upgrading a published reduction keeps its count.
        let upgraded = (FLAG_REDUCTION | 17).wrapping_add(FLAG_INCLUSIVE - FLAG_REDUCTION + 100);
        assert_eq!(upgraded & FLAG_MASK, FLAG_INCLUSIVE);
        assert_eq!(upgraded & VALUE_MASK, 117);
    }

    #[test]
    fn composed_source_has_every_entry_point() {
        for variant in [SortVariant::OneSweep, SortVariant::DeviceRadix] {
            let source = compose_shader(variant);
            assert!(source.starts_with("const RADIX_LOG2: u32 = 8u;"));
            for kernel in variant_kernels(variant) {
                assert!(source.contains(&format!("fn {}(", kernel.entry_point())));
            }
        }
    }

    fn validate_wgsl(label: &str, source: &str) {
        use wgpu::naga::valid::{Capabilities, ValidationFlags, Validator};

        let module = match wgpu::naga::front::wgsl::parse_str(source) {
            Ok(module) => module,
            Err(e) => panic!("{} does not parse:\n{}", label, e.emit_to_string(source)),
        };
        if let Err(e) = Validator::new(ValidationFlags::all(), Capabilities::all()).validate(&module) {
            panic!("{} does not validate: {:?}", label, e);
        }
    }

    #[test]
    fn sort_shaders_compile_headless() {
        validate_wgsl("onesweep", &compose_shader(SortVariant::OneSweep));
        validate_wgsl("device radix", &compose_shader(SortVariant::DeviceRadix));
    }

    #[test]
    fn spatial_hash_shader_compiles_headless() {
        validate_wgsl("spatial hash", crate::spatial_hash::SPATIAL_HASH_SHADER);
    }

    #[test]
    fn sort_layout_fits_default_storage_limit() {
        let storage = sort_bind_group_infos()
            .iter()
            .filter(|i| matches!(i.binding_type, wgpu::BindingType::Buffer { ty: wgpu::BufferBindingType::Storage { .. }, .. }))
            .count();
        assert_eq!(storage, 8);
    }
}
