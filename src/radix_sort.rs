//! The sorter: owns its kernels and buffers, records the stage plan into a
//! command encoder and checks the device error counter.

use std::sync::Arc;

use crate::buffers::{create_buffer, Ownership, SlotId, SortBuffers};
use crate::capabilities::Capabilities;
use crate::config::{
    div_round_up, SortConfig, SortMode, SortOrder, SortVariant, RADIX_LOG2, RADIX_PASSES,
    WORKGROUP_SIZE,
};
use crate::dispatch::{DispatchGrid, Kernel, SortPlan, Step};
use crate::error::{Result, SortError};
use crate::gpu::GpuContext;
use crate::kernels::{KernelDispatch, KernelSet, SortParams};
use crate::{map_read, read_buffer};

/// GPU radix sorter for `u32`, `i32` or `f32` keys with an optional `u32`
/// payload.
///
/// Typical use:
///
/// 1. `update_size(n)` (or lend buffers with `set_buffer` first),
/// 2. fill the `Keys`/`Payload` slots (`upload_keys`, or a kernel of your own),
/// 3. `sort`, after which the sorted data is back in the `Keys`/`Payload` slots.
pub struct RadixSorter {
    config: SortConfig,
    variant: SortVariant,
    capabilities: Capabilities,
    kernels: KernelSet,
    buffers: SortBuffers,
    max_per_dimension: u32,
    params: Vec<wgpu::Buffer>,
    bind_groups: Vec<wgpu::BindGroup>,
    bound_generation: Option<u64>,
    /// Ping-pong index of the slot holding the latest result.
    current: usize,
}

impl RadixSorter {
    /// Resolves the variant against `capabilities` before building anything.
    pub fn new(device: &wgpu::Device, capabilities: &Capabilities, config: SortConfig) -> Result<Self> {
        let variant = capabilities.select_variant(config.variant)?;
        let kernels = KernelSet::new(device, variant)?;
        let buffers = SortBuffers::new(device, variant, config.mode)?;

        let device_max = capabilities.max_workgroups_per_dimension.max(1);
        let max_per_dimension = config
            .max_workgroups_per_dimension
            .map_or(device_max, |m| m.clamp(1, device_max));

        let params = (0..RADIX_PASSES)
            .map(|pass| {
                create_buffer(
                    device,
                    &format!("sort params {}", pass),
                    std::mem::size_of::<SortParams>() as u64,
                    wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        log::info!(
            "radix sorter on `{}`: {:?}, {:?} keys, {:?}, {:?}",
            capabilities.adapter_name,
            variant,
            config.key_type,
            config.order,
            config.mode
        );

        Ok(Self {
            config,
            variant,
            capabilities: capabilities.clone(),
            kernels,
            buffers,
            max_per_dimension,
            params,
            bind_groups: Vec::new(),
            bound_generation: None,
            current: 0,
        })
    }

    pub fn from_context(context: &GpuContext, config: SortConfig) -> Result<Self> {
        Self::new(&context.device, &context.capabilities, config)
    }

    pub fn variant(&self) -> SortVariant {
        self.variant
    }

    pub fn config(&self) -> &SortConfig {
        &self.config
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn buffers(&self) -> &SortBuffers {
        &self.buffers
    }

    pub fn num_keys(&self) -> u32 {
        self.buffers.num_keys()
    }

    pub fn max_workgroups_per_dimension(&self) -> u32 {
        self.max_per_dimension
    }

    pub fn set_buffer(
        &mut self,
        device: &wgpu::Device,
        id: SlotId,
        buffer: Arc<wgpu::Buffer>,
        ownership: Ownership,
    ) -> Result<()> {
        self.buffers.set_buffer(device, id, buffer, ownership)
    }

    pub fn set_all_buffers(
        &mut self,
        device: &wgpu::Device,
        keys: Arc<wgpu::Buffer>,
        payload: Arc<wgpu::Buffer>,
        alt_keys: Arc<wgpu::Buffer>,
        alt_payload: Arc<wgpu::Buffer>,
    ) -> Result<()> {
        self.buffers
            .set_all_buffers(device, keys, payload, alt_keys, alt_payload)
    }

    pub fn update_size(&mut self, device: &wgpu::Device, num_keys: u32, dispose: bool) -> Result<()> {
        self.buffers.update_size(device, num_keys, dispose)
    }

    pub fn dispose(&mut self) {
        self.buffers.dispose();
        self.bind_groups.clear();
        self.bound_generation = None;
    }

    /// The stage plan for the current size.
    pub fn plan(&self) -> SortPlan {
        SortPlan::new(
            self.variant,
            self.buffers.num_keys(),
            self.buffers.partitions(),
            self.buffers.hist_partitions(),
            self.max_per_dimension,
        )
    }

    fn params_for(&self, pass: u32) -> SortParams {
        SortParams {
            num_keys: self.buffers.num_keys(),
            partitions: self.buffers.partitions(),
            hist_partitions: self.buffers.hist_partitions(),
            pass_index: pass,
            shift: pass * RADIX_LOG2,
            key_type: self.config.key_type.shader_id(),
            descending: (self.config.order == SortOrder::Descending) as u32,
            sort_payload: (self.config.mode == SortMode::Pairs) as u32,
            spin_limit: self.config.lookback_spin_limit.max(1),
            _pad: [0; 3],
        }
    }

    /// Writes the per-pass parameters and rebuilds the bind groups when the
    /// buffers changed since the last sort.
    fn prepare(&mut self, device: &wgpu::Device, queue: &wgpu::Queue) -> Result<()> {
        let generation = self.buffers.generation();
        if self.bound_generation == Some(generation) {
            return Ok(());
        }
        if self.buffers.num_keys() == 0 {
            self.bind_groups.clear();
            self.bound_generation = Some(generation);
            return Ok(());
        }

        let buffers = &self.buffers;
        let slot = |id: SlotId| buffers.buffer(id).ok_or(SortError::MissingBuffer(id.label()));
        let keys = [slot(SlotId::Keys)?, slot(SlotId::AltKeys)?];
        let payload = [slot(SlotId::Payload)?, slot(SlotId::AltPayload)?];
        let pass_hist = buffers
            .pass_hist()
            .ok_or(SortError::MissingBuffer("pass histogram"))?;

        let mut bind_groups = Vec::with_capacity(RADIX_PASSES as usize);
        for pass in 0..RADIX_PASSES {
            let params = &self.params[pass as usize];
            queue.write_buffer(params, 0, bytemuck::bytes_of(&self.params_for(pass)));

            let src = pass as usize % 2;
            let dst = 1 - src;
            bind_groups.push(device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(&format!("sort pass {}", pass)),
                layout: self.kernels.layout(),
                entries: &[
                    buffer_entry(0, params),
                    buffer_entry(1, keys[src]),
                    buffer_entry(2, keys[dst]),
                    buffer_entry(3, payload[src]),
                    buffer_entry(4, payload[dst]),
                    buffer_entry(5, buffers.global_hist()),
                    buffer_entry(6, pass_hist),
                    buffer_entry(7, buffers.index()),
                    buffer_entry(8, buffers.error_count()),
                ],
            }));
        }

        log::debug!(
            "rebound {} keys ({} partitions) for {:?}",
            buffers.num_keys(),
            buffers.partitions(),
            self.variant
        );
        self.bind_groups = bind_groups;
        self.bound_generation = Some(generation);
        Ok(())
    }

    /// Records a complete sort into `encoder`. Does not look at the error
    /// counter: callers that submit the work themselves must follow up with
    /// `check_errors` to learn whether the result can be trusted.
    pub fn record_sort(
        &mut self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        encoder: &mut wgpu::CommandEncoder,
    ) -> Result<()> {
        self.prepare(device, queue)?;
        let plan = self.plan();
        if plan.is_empty() {
            // No init kernel runs, so clear what an earlier sort left behind.
            encoder.clear_buffer(self.buffers.error_count(), 0, None);
            return Ok(());
        }

        let mut current = self.current;
        let mut segment: Vec<KernelDispatch> = Vec::new();
        for step in plan.steps() {
            match *step {
                Step::Dispatch { kernel, pass, grid } => {
                    let pipeline = self
                        .kernels
                        .pipeline(kernel)
                        .ok_or(SortError::MissingKernel(kernel.entry_point()))?;
                    segment.push(KernelDispatch {
                        pipeline,
                        bind_group: &self.bind_groups[pass as usize],
                        grid,
                    });
                }
                Step::Barrier => flush(encoder, &mut segment),
                Step::Swap => current ^= 1,
            }
        }
        flush(encoder, &mut segment);

        self.current = current;
        Ok(())
    }

    /// Sorts the `Keys`/`Payload` slots in place and waits for the device.
    /// Fails with `InvariantViolation` when a kernel reported a broken
    /// invariant.
    pub async fn sort(&mut self, device: &wgpu::Device, queue: &wgpu::Queue) -> Result<()> {
        if self.buffers.num_keys() == 0 {
            return Ok(());
        }

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("radix sort"),
        });
        self.record_sort(device, queue, &mut encoder)?;
        encoder.copy_buffer_to_buffer(
            self.buffers.error_count(),
            0,
            self.buffers.error_readback(),
            0,
            4,
        );
        queue.submit(Some(encoder.finish()));

        self.read_error_count(device).await.and_then(report_errors)
    }

    /// Reads the device error counter of the last submitted sort.
    pub async fn check_errors(&self, device: &wgpu::Device, queue: &wgpu::Queue) -> Result<()> {
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("error readback"),
        });
        encoder.copy_buffer_to_buffer(
            self.buffers.error_count(),
            0,
            self.buffers.error_readback(),
            0,
            4,
        );
        queue.submit(Some(encoder.finish()));

        self.read_error_count(device).await.and_then(report_errors)
    }

    async fn read_error_count(&self, device: &wgpu::Device) -> Result<u32> {
        let counts: Vec<u32> = map_read(device, self.buffers.error_readback()).await?;
        Ok(counts.first().copied().unwrap_or(0))
    }

    /// Counts adjacent out-of-order pairs of the `Keys` slot on the device.
    pub async fn validate_on_device(&mut self, device: &wgpu::Device, queue: &wgpu::Queue) -> Result<u32> {
        if self.buffers.num_keys() < 2 {
            return Ok(0);
        }
        self.prepare(device, queue)?;

        let pipeline = self
            .kernels
            .pipeline(Kernel::Validate)
            .ok_or(SortError::MissingKernel(Kernel::Validate.entry_point()))?;

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("validate"),
        });
        encoder.clear_buffer(self.buffers.error_count(), 0, None);
        // Bind group 0 reads the caller slot, which holds the sorted keys.
        KernelDispatch {
            pipeline,
            bind_group: &self.bind_groups[0],
            grid: DispatchGrid::new(
                div_round_up(self.buffers.num_keys(), WORKGROUP_SIZE),
                self.max_per_dimension,
            ),
        }
        .execute(&mut encoder, "validate");
        encoder.copy_buffer_to_buffer(
            self.buffers.error_count(),
            0,
            self.buffers.error_readback(),
            0,
            4,
        );
        queue.submit(Some(encoder.finish()));

        self.read_error_count(device).await
    }

    /// Copies `keys` into the `Keys` slot. Key bits are given as `u32`; use
    /// `bytemuck::cast_slice` for `i32`/`f32` data.
    pub fn upload_keys(&self, queue: &wgpu::Queue, keys: &[u32]) -> Result<()> {
        self.upload(queue, SlotId::Keys, keys)
    }

    pub fn upload_payload(&self, queue: &wgpu::Queue, payload: &[u32]) -> Result<()> {
        if self.config.mode == SortMode::KeysOnly {
            log::debug!("keys-only sorter ignores payload upload");
            return Ok(());
        }
        self.upload(queue, SlotId::Payload, payload)
    }

    fn upload(&self, queue: &wgpu::Queue, id: SlotId, data: &[u32]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let buffer = self
            .buffers
            .buffer(id)
            .ok_or(SortError::MissingBuffer(id.label()))?;
        let required = std::mem::size_of_val(data) as u64;
        if buffer.size() < required {
            return Err(SortError::BufferTooSmall {
                slot: id.label().to_string(),
                size: buffer.size(),
                required,
            });
        }
        queue.write_buffer(buffer, 0, bytemuck::cast_slice(data));
        Ok(())
    }

    pub async fn read_keys(&self, device: &wgpu::Device, queue: &wgpu::Queue) -> Result<Vec<u32>> {
        self.read_slot(device, queue, SlotId::Keys).await
    }

    /// Empty in keys-only mode.
    pub async fn read_payload(&self, device: &wgpu::Device, queue: &wgpu::Queue) -> Result<Vec<u32>> {
        if self.config.mode == SortMode::KeysOnly {
            return Ok(Vec::new());
        }
        self.read_slot(device, queue, SlotId::Payload).await
    }

    async fn read_slot(&self, device: &wgpu::Device, queue: &wgpu::Queue, id: SlotId) -> Result<Vec<u32>> {
        let num_keys = self.buffers.num_keys();
        if num_keys == 0 {
            return Ok(Vec::new());
        }
        let id = if self.current == 0 {
            id
        } else {
            match id {
                SlotId::Keys => SlotId::AltKeys,
                SlotId::Payload => SlotId::AltPayload,
                other => other,
            }
        };
        let buffer = self
            .buffers
            .buffer(id)
            .ok_or(SortError::MissingBuffer(id.label()))?;
        read_buffer(device, queue, buffer, num_keys as u64 * 4).await
    }
}

fn buffer_entry(binding: u32, buffer: &wgpu::Buffer) -> wgpu::BindGroupEntry<'_> {
    wgpu::BindGroupEntry {
        binding,
        resource: buffer.as_entire_binding(),
    }
}

/// Records the dispatches gathered since the last barrier in one compute
/// pass. The pass boundary is the barrier.
fn flush(encoder: &mut wgpu::CommandEncoder, segment: &mut Vec<KernelDispatch>) {
    if segment.is_empty() {
        return;
    }
    let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
        label: Some("radix sort"),
        timestamp_writes: None,
    });
    for dispatch in segment.drain(..) {
        dispatch.record(&mut pass);
    }
}

fn report_errors(errors: u32) -> Result<()> {
    if errors != 0 {
        log::error!("sort reported {} invariant violation(s)", errors);
        return Err(SortError::InvariantViolation { errors });
    }
    Ok(())
}
