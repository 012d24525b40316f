//! GPU radix sorting of 32-bit keys (with optional payloads) on wgpu, in a
//! OneSweep flavour with decoupled lookback and a reduce-then-scan flavour
//! for adapters where lookback is unsafe. The sort drives a spatial-hash
//! neighbor search for particle simulations (see `spatial_hash`).

use std::mem;
use bytemuck::Pod;
use wgpu::util::DeviceExt;

pub mod buffers;
pub mod capabilities;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gpu;
pub mod harness;
pub mod kernels;
pub mod radix_sort;
pub mod spatial_hash;

pub use buffers::{Ownership, SlotId, SortBuffers};
pub use capabilities::{AdapterTraits, Capabilities};
pub use config::{KeyType, SortConfig, SortMode, SortOrder, SortVariant, VariantPolicy};
pub use error::{CapabilityError, Result, SortError};
pub use gpu::GpuContext;
pub use radix_sort::RadixSorter;
pub use spatial_hash::{HashGrid, SpatialHash};

/// A trait for things that can copy and convert a wgpu-rs buffer to
/// a std::Vec.
pub trait Convert2Vec where Self: std::marker::Sized {
    fn convert(data: &[u8]) -> Vec<Self>;
}

/// A macro for creating Convert2Vec for specific a primitive
/// number type. Note that the type must implement from_ne_bytes.
macro_rules! impl_convert {
  ($to_type:ty) => {
    impl Convert2Vec for $to_type {
      fn convert(data: &[u8]) -> Vec<Self> {
            data
                .chunks_exact(mem::size_of::<Self>())
                .map(|b| {
                    let mut bytes = [0u8; mem::size_of::<$to_type>()];
                    bytes.copy_from_slice(b);
                    Self::from_ne_bytes(bytes)
                })
                .collect()
      }
    }
  }
}

impl_convert!{f32}
impl_convert!{u32}
impl_convert!{i32}

///////////////////////////////////////////////////////////////////////////////////////

/// Buffer with its byte capacity.
pub struct Buffer {
    pub buffer: wgpu::Buffer,
    pub capacity: usize,
    pub label: Option<String>,
}

impl Buffer {

    pub fn create_buffer_from_data<T: Pod>(
        device: &wgpu::Device,
        t: &[T],
        usage: wgpu::BufferUsages,
        label: Option<&str>)
    -> Self {

        let buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label,
            contents: bytemuck::cast_slice(t),
            usage,
        });
        let capacity = mem::size_of::<T>() * t.len();
        Self {
            buffer,
            capacity,
            label: label.map(String::from),
        }
    }

    pub fn create_buffer(device: &wgpu::Device, capacity: u64, usage: wgpu::BufferUsages, label: Option<&str>) -> Self {
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label,
            size: capacity,
            usage,
            mapped_at_creation: false,
        });
        Self {
            buffer,
            capacity: capacity as usize,
            label: label.map(String::from),
        }
    }

    /// Method for copying the content of the buffer into a vector. The buffer
    /// must have been created with `COPY_SRC`.
    pub async fn to_vec<T: Convert2Vec>(&self, device: &wgpu::Device, queue: &wgpu::Queue) -> Result<Vec<T>> {
        read_buffer(device, queue, &self.buffer, self.capacity as u64).await
    }
}

/// Copies the first `size` bytes of `buffer` through a staging buffer and
/// blocks until the copy is mapped.
pub async fn read_buffer<T: Convert2Vec>(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    buffer: &wgpu::Buffer,
    size: u64,
) -> Result<Vec<T>> {
    if size == 0 {
        return Ok(Vec::new());
    }

    let staging_buffer = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("readback staging"),
        size,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });

    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("readback") });
    encoder.copy_buffer_to_buffer(buffer, 0, &staging_buffer, 0, size);
    queue.submit(Some(encoder.finish()));

    map_read(device, &staging_buffer).await
}

/// Maps a `MAP_READ` buffer, converts its content and unmaps it again.
pub(crate) async fn map_read<T: Convert2Vec>(device: &wgpu::Device, staging: &wgpu::Buffer) -> Result<Vec<T>> {
    let buffer_slice = staging.slice(..);
    let (sender, receiver) = futures::channel::oneshot::channel();
    buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = sender.send(result);
    });
    device.poll(wgpu::Maintain::Wait);

    receiver.await.unwrap_or(Err(wgpu::BufferAsyncError))?;

    let res = {
        let data = buffer_slice.get_mapped_range();
        Convert2Vec::convert(&data)
    };
    staging.unmap();
    Ok(res)
}
