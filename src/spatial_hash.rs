//! Uniform-grid neighbor lookup for particles. Particles are hashed by the
//! grid cell they fall in, sorted by hash with a `RadixSorter` working on
//! buffers this struct owns, and every cell's `[start, end)` range in the
//! sorted list is recorded.

use std::collections::HashMap;
use std::sync::Arc;

use cgmath::Vector3;

use crate::buffers::create_buffer;
use crate::config::{div_round_up, KeyType, SortConfig, SortMode};
use crate::dispatch::DispatchGrid;
use crate::error::{Result, SortError};
use crate::gpu::GpuContext;
use crate::kernels::{create_bind_group_layout, create_pipelines, storage_binding, uniform_binding, KernelDispatch};
use crate::radix_sort::RadixSorter;
use crate::{read_buffer, Buffer};

pub(crate) static SPATIAL_HASH_SHADER: &str = include_str!("shaders/spatial_hash.wgsl");
static HASH_WORKGROUP_SIZE: u32 = 256;

/// Bytes per particle in the position buffer, one `vec4<f32>`.
const POSITION_BYTES: u64 = 16;

/// `cell_start` value of a cell without particles.
pub static EMPTY_CELL: u32 = u32::MAX;

#[repr(C)]
#[derive(Clone, Copy, Debug)]
struct HashParams {
    world_min: [f32; 3],
    cell_size: f32,
    num_particles: u32,
    hash_mask: u32,
    table_size: u32,
    _pad: u32,
}

unsafe impl bytemuck::Pod for HashParams {}
unsafe impl bytemuck::Zeroable for HashParams {}

/// Grid geometry of the hash.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HashGrid {
    pub world_min: Vector3<f32>,
    pub cell_size: f32,
    /// Number of hash buckets, a power of two.
    pub table_size: u32,
}

impl HashGrid {
    /// `table_size` is rounded up to a power of two, which fails above 2^31.
    pub fn new(world_min: Vector3<f32>, cell_size: f32, table_size: u32) -> Result<Self> {
        let table_size = table_size
            .max(1)
            .checked_next_power_of_two()
            .ok_or(SortError::HashTableTooLarge { requested: table_size })?;
        Ok(Self {
            world_min,
            cell_size,
            table_size,
        })
    }

    pub fn hash_mask(&self) -> u32 {
        self.table_size - 1
    }

    pub fn cell_of(&self, position: Vector3<f32>) -> Vector3<i32> {
        let p = (position - self.world_min) / self.cell_size;
        Vector3::new(p.x.floor() as i32, p.y.floor() as i32, p.z.floor() as i32)
    }

    /// Host mirror of the `cell_hash` kernel.
    pub fn hash_cell(&self, cell: Vector3<i32>) -> u32 {
        let h = (cell.x as u32).wrapping_mul(73856093)
            ^ (cell.y as u32).wrapping_mul(19349663)
            ^ (cell.z as u32).wrapping_mul(83492791);
        h & self.hash_mask()
    }

    pub fn hash_position(&self, position: Vector3<f32>) -> u32 {
        self.hash_cell(self.cell_of(position))
    }
}

pub struct SpatialHash {
    grid: HashGrid,
    num_particles: u32,
    sorter: RadixSorter,
    hashes: Arc<wgpu::Buffer>,
    indices: Arc<wgpu::Buffer>,
    // Ping-pong partners of `hashes` and `indices`, lent to the sorter too.
    _alt_hashes: Arc<wgpu::Buffer>,
    _alt_indices: Arc<wgpu::Buffer>,
    cell_start: Buffer,
    cell_end: Buffer,
    params: wgpu::Buffer,
    pipelines: HashMap<&'static str, wgpu::ComputePipeline>,
    bind_group: wgpu::BindGroup,
    max_per_dimension: u32,
}

impl SpatialHash {
    /// `positions` holds one `vec4<f32>` per particle (w is ignored), see
    /// `create_position_buffer`. The sort always runs on `u32` hashes with
    /// particle indices as payload, whatever `config` says about keys.
    pub fn new(
        context: &GpuContext,
        grid: HashGrid,
        num_particles: u32,
        positions: &wgpu::Buffer,
        config: SortConfig,
    ) -> Result<Self> {
        let device = context.device();
        let required = num_particles as u64 * POSITION_BYTES;
        if positions.size() < required {
            return Err(SortError::BufferTooSmall {
                slot: "particle positions".to_string(),
                size: positions.size(),
                required,
            });
        }
        let config = SortConfig {
            key_type: KeyType::U32,
            mode: SortMode::Pairs,
            ..config
        };
        let mut sorter = RadixSorter::from_context(context, config)?;

        let words = num_particles.max(1) as u64 * 4;
        let usage = wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST;
        let hashes = Arc::new(create_buffer(device, "cell hashes", words, usage)?);
        let indices = Arc::new(create_buffer(device, "particle indices", words, usage)?);
        let alt_hashes = Arc::new(create_buffer(device, "alt cell hashes", words, usage)?);
        let alt_indices = Arc::new(create_buffer(device, "alt particle indices", words, usage)?);

        sorter.set_all_buffers(
            device,
            hashes.clone(),
            indices.clone(),
            alt_hashes.clone(),
            alt_indices.clone(),
        )?;
        sorter.update_size(device, num_particles, false)?;

        let table_bytes = grid.table_size as u64 * 4;
        let cell_start = Buffer::create_buffer(device, table_bytes, usage, Some("cell start"));
        let cell_end = Buffer::create_buffer(device, table_bytes, usage, Some("cell end"));
        let params = create_buffer(
            device,
            "hash params",
            std::mem::size_of::<HashParams>() as u64,
            wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        )?;

        let layout = create_bind_group_layout(
            device,
            "spatial hash",
            &[
                uniform_binding(0),
                storage_binding(1, true),
                storage_binding(2, false),
                storage_binding(3, false),
                storage_binding(4, false),
                storage_binding(5, false),
            ],
        );
        let pipelines = create_pipelines(
            device,
            "spatial hash",
            SPATIAL_HASH_SHADER,
            &layout,
            &["cell_hash", "clear_cells", "find_cell_ranges"],
        )?;
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("spatial hash"),
            layout: &layout,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: params.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 1, resource: positions.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 2, resource: hashes.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 3, resource: indices.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 4, resource: cell_start.buffer.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 5, resource: cell_end.buffer.as_entire_binding() },
            ],
        });

        let max_per_dimension = sorter.max_workgroups_per_dimension();
        log::info!(
            "spatial hash: {} particles, {} buckets, cell size {}",
            num_particles,
            grid.table_size,
            grid.cell_size
        );

        Ok(Self {
            grid,
            num_particles,
            sorter,
            hashes,
            indices,
            _alt_hashes: alt_hashes,
            _alt_indices: alt_indices,
            cell_start,
            cell_end,
            params,
            pipelines,
            bind_group,
            max_per_dimension,
        })
    }

    /// A position buffer in the layout `cell_hash` reads.
    pub fn create_position_buffer(device: &wgpu::Device, positions: &[Vector3<f32>]) -> Buffer {
        let data: Vec<[f32; 4]> = positions.iter().map(|p| [p.x, p.y, p.z, 1.0]).collect();
        // An empty storage binding is invalid, keep at least one element.
        let data = if data.is_empty() { vec![[0.0; 4]] } else { data };
        Buffer::create_buffer_from_data(
            device,
            &data,
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            Some("particle positions"),
        )
    }

    pub fn grid(&self) -> &HashGrid {
        &self.grid
    }

    pub fn sorter(&self) -> &RadixSorter {
        &self.sorter
    }

    pub fn indices(&self) -> &Arc<wgpu::Buffer> {
        &self.indices
    }

    pub fn cell_start(&self) -> &wgpu::Buffer {
        &self.cell_start.buffer
    }

    pub fn cell_end(&self) -> &wgpu::Buffer {
        &self.cell_end.buffer
    }

    fn dispatch(&self, entry_point: &'static str, threads: u32) -> Result<KernelDispatch> {
        let pipeline = self
            .pipelines
            .get(entry_point)
            .ok_or(SortError::MissingKernel(entry_point))?;
        Ok(KernelDispatch {
            pipeline,
            bind_group: &self.bind_group,
            grid: DispatchGrid::new(div_round_up(threads, HASH_WORKGROUP_SIZE), self.max_per_dimension),
        })
    }

    /// Hashes every particle, sorts by hash and rebuilds the cell ranges, in
    /// one submission.
    pub async fn build(&mut self, device: &wgpu::Device, queue: &wgpu::Queue) -> Result<()> {
        let params = HashParams {
            world_min: self.grid.world_min.into(),
            cell_size: self.grid.cell_size,
            num_particles: self.num_particles,
            hash_mask: self.grid.hash_mask(),
            table_size: self.grid.table_size,
            _pad: 0,
        };
        queue.write_buffer(&self.params, 0, bytemuck::bytes_of(&params));

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("spatial hash"),
        });
        self.dispatch("cell_hash", self.num_particles)?
            .execute(&mut encoder, "cell hash");
        self.sorter.record_sort(device, queue, &mut encoder)?;
        self.dispatch("clear_cells", self.grid.table_size)?
            .execute(&mut encoder, "clear cells");
        self.dispatch("find_cell_ranges", self.num_particles)?
            .execute(&mut encoder, "find cell ranges");
        queue.submit(Some(encoder.finish()));

        // record_sort leaves the error check to us.
        self.sorter.check_errors(device, queue).await
    }

    /// Sorted hashes and the particle index of each.
    pub async fn read_sorted(&self, device: &wgpu::Device, queue: &wgpu::Queue) -> Result<(Vec<u32>, Vec<u32>)> {
        let bytes = self.num_particles as u64 * 4;
        let hashes = read_buffer(device, queue, &self.hashes, bytes).await?;
        let indices = read_buffer(device, queue, &self.indices, bytes).await?;
        Ok((hashes, indices))
    }

    /// `(cell_start, cell_end)` per bucket; empty buckets start at `EMPTY_CELL`.
    pub async fn read_cell_ranges(&self, device: &wgpu::Device, queue: &wgpu::Queue) -> Result<(Vec<u32>, Vec<u32>)> {
        let start = self.cell_start.to_vec::<u32>(device, queue).await?;
        let end = self.cell_end.to_vec::<u32>(device, queue).await?;
        Ok((start, end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_are_two_vec4() {
        assert_eq!(std::mem::size_of::<HashParams>(), 32);
    }

    #[test]
    fn table_size_rounds_to_power_of_two() {
        let grid = HashGrid::new(Vector3::new(0.0, 0.0, 0.0), 1.0, 1000).unwrap();
        assert_eq!(grid.table_size, 1024);
        assert_eq!(grid.hash_mask(), 1023);
    }

    #[test]
    fn largest_table_is_two_to_the_31() {
        let origin = Vector3::new(0.0, 0.0, 0.0);
        assert_eq!(HashGrid::new(origin, 1.0, 1 << 31).unwrap().table_size, 1 << 31);
        assert!(matches!(
            HashGrid::new(origin, 1.0, (1 << 31) + 1),
            Err(SortError::HashTableTooLarge { requested }) if requested == (1 << 31) + 1
        ));
        assert!(HashGrid::new(origin, 1.0, u32::MAX).is_err());
    }

    #[test]
    fn positions_in_one_cell_share_a_hash() {
        let grid = HashGrid::new(Vector3::new(-1.0, -1.0, -1.0), 0.5, 4096).unwrap();
        let a = grid.hash_position(Vector3::new(0.1, 0.1, 0.1));
        let b = grid.hash_position(Vector3::new(0.4, 0.2, 0.3));
        assert_eq!(grid.cell_of(Vector3::new(0.1, 0.1, 0.1)), Vector3::new(2, 2, 2));
        assert_eq!(a, b);
        assert!(a < grid.table_size);
    }

    #[test]
    fn negative_cells_hash_within_table() {
        let grid = HashGrid::new(Vector3::new(0.0, 0.0, 0.0), 1.0, 64).unwrap();
        let cell = grid.cell_of(Vector3::new(-2.5, 0.5, 3.5));
        assert_eq!(cell, Vector3::new(-3, 0, 3));
        assert!(grid.hash_cell(cell) < 64);
    }
}
