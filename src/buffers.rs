//! Device buffers used by one sorter: the four data slots (keys, payload and
//! their alternates) and the scratch buffers the kernels share.

use std::mem;
use std::sync::Arc;

use crate::config::{
    div_round_up, SortMode, SortVariant, GLOBAL_HIST_PARTITION_SIZE, MAX_KEYS, PARTITION_SIZE,
    RADIX, RADIX_PASSES,
};
use crate::error::{Result, SortError};

static WORD: u64 = mem::size_of::<u32>() as u64;

/// Who is responsible for a data buffer's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Allocated, resized and freed by `SortBuffers`.
    Owned,
    /// Lent by the caller; never allocated or freed here.
    Borrowed,
}

/// The four data slots. `Keys` and `Payload` hold the caller's data before
/// and after a sort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotId {
    Keys,
    Payload,
    AltKeys,
    AltPayload,
}

impl SlotId {
    pub fn label(self) -> &'static str {
        match self {
            SlotId::Keys => "sort keys",
            SlotId::Payload => "sort payload",
            SlotId::AltKeys => "alt keys",
            SlotId::AltPayload => "alt payload",
        }
    }

    fn is_payload(self) -> bool {
        matches!(self, SlotId::Payload | SlotId::AltPayload)
    }
}

enum Slot {
    Owned(Option<wgpu::Buffer>),
    Borrowed(Arc<wgpu::Buffer>),
}

impl Slot {
    fn buffer(&self) -> Option<&wgpu::Buffer> {
        match self {
            Slot::Owned(buffer) => buffer.as_ref(),
            Slot::Borrowed(buffer) => Some(buffer),
        }
    }

    fn ownership(&self) -> Ownership {
        match self {
            Slot::Owned(_) => Ownership::Owned,
            Slot::Borrowed(_) => Ownership::Borrowed,
        }
    }

    fn dispose(&mut self) {
        match self {
            Slot::Owned(buffer) => {
                if let Some(buffer) = buffer.take() {
                    buffer.destroy();
                }
            }
            Slot::Borrowed(_) => {}
        }
    }
}

/// Partition counts for `num_keys` keys: `(binning partitions, global histogram partitions)`.
pub fn partition_counts(num_keys: u32) -> (u32, u32) {
    (
        div_round_up(num_keys, PARTITION_SIZE),
        div_round_up(num_keys, GLOBAL_HIST_PARTITION_SIZE),
    )
}

/// Number of `u32` entries of the pass histogram.
pub fn pass_hist_entries(variant: SortVariant, partitions: u32) -> u64 {
    match variant {
        SortVariant::OneSweep => RADIX as u64 * RADIX_PASSES as u64 * partitions as u64,
        SortVariant::DeviceRadix => RADIX as u64 * partitions as u64,
    }
}

/// Buffers of one sorter. `keys[0]`/`payload[0]` are the caller-facing slots,
/// index 1 the alternates.
pub struct SortBuffers {
    variant: SortVariant,
    mode: SortMode,
    keys: [Slot; 2],
    payload: [Slot; 2],
    num_keys: u32,
    partitions: u32,
    hist_partitions: u32,
    allocated: bool,
    pass_hist: Option<wgpu::Buffer>,
    global_hist: wgpu::Buffer,
    index: wgpu::Buffer,
    error_count: wgpu::Buffer,
    error_readback: wgpu::Buffer,
    generation: u64,
}

impl SortBuffers {
    /// Creates the static scratch buffers. Data slots start empty and owned.
    pub fn new(device: &wgpu::Device, variant: SortVariant, mode: SortMode) -> Result<Self> {
        let global_hist = create_buffer(
            device,
            "global histogram",
            RADIX as u64 * RADIX_PASSES as u64 * WORD,
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
        )?;
        let index = create_buffer(
            device,
            "pass index",
            RADIX_PASSES as u64 * WORD,
            wgpu::BufferUsages::STORAGE,
        )?;
        let error_count = create_buffer(
            device,
            "error count",
            WORD,
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
        )?;
        let error_readback = create_buffer(
            device,
            "error readback",
            WORD,
            wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        )?;

        Ok(Self {
            variant,
            mode,
            keys: [Slot::Owned(None), Slot::Owned(None)],
            payload: [Slot::Owned(None), Slot::Owned(None)],
            num_keys: 0,
            partitions: 0,
            hist_partitions: 0,
            allocated: false,
            pass_hist: None,
            global_hist,
            index,
            error_count,
            error_readback,
            generation: 0,
        })
    }

    /// Installs a buffer in a data slot. A borrowed buffer is only referenced;
    /// an owned one is taken over and freed with the other owned buffers. An
    /// `Owned` buffer that is still shared elsewhere is kept as borrowed.
    pub fn set_buffer(
        &mut self,
        device: &wgpu::Device,
        id: SlotId,
        buffer: Arc<wgpu::Buffer>,
        ownership: Ownership,
    ) -> Result<()> {
        if self.num_keys > 0 && (self.mode == SortMode::Pairs || !id.is_payload()) {
            check_capacity(id, &buffer, self.num_keys)?;
        }

        let slot = match ownership {
            Ownership::Borrowed => Slot::Borrowed(buffer),
            Ownership::Owned => match Arc::try_unwrap(buffer) {
                Ok(buffer) => Slot::Owned(Some(buffer)),
                Err(shared) => {
                    log::debug!("{} is still shared, keeping it as borrowed", id.label());
                    Slot::Borrowed(shared)
                }
            },
        };

        let old = std::mem::replace(self.slot_mut(id), slot);
        drop(old);

        // A slot handed back to the manager needs a buffer before the next sort.
        if self.slot(id).buffer().is_none() && self.num_keys > 0 {
            let buffer = self.create_data_buffer(device, id)?;
            *self.slot_mut(id) = Slot::Owned(Some(buffer));
        }
        self.generation += 1;
        Ok(())
    }

    /// Lends all four data buffers, as a simulation that owns its hash and
    /// index buffers would.
    pub fn set_all_buffers(
        &mut self,
        device: &wgpu::Device,
        keys: Arc<wgpu::Buffer>,
        payload: Arc<wgpu::Buffer>,
        alt_keys: Arc<wgpu::Buffer>,
        alt_payload: Arc<wgpu::Buffer>,
    ) -> Result<()> {
        self.set_buffer(device, SlotId::Keys, keys, Ownership::Borrowed)?;
        self.set_buffer(device, SlotId::Payload, payload, Ownership::Borrowed)?;
        self.set_buffer(device, SlotId::AltKeys, alt_keys, Ownership::Borrowed)?;
        self.set_buffer(device, SlotId::AltPayload, alt_payload, Ownership::Borrowed)
    }

    /// Resizes for `num_keys` keys. Nothing happens when the size is
    /// unchanged. With `dispose == false` the previous owned buffers are not
    /// destroyed eagerly; their handles are dropped and wgpu frees them once
    /// no submitted work uses them.
    pub fn update_size(&mut self, device: &wgpu::Device, num_keys: u32, dispose: bool) -> Result<()> {
        if num_keys > MAX_KEYS {
            return Err(SortError::TooManyKeys { keys: num_keys, max: MAX_KEYS });
        }
        if self.allocated && self.num_keys == num_keys {
            return Ok(());
        }

        let (partitions, hist_partitions) = partition_counts(num_keys);
        self.num_keys = num_keys;
        self.partitions = partitions;
        self.hist_partitions = hist_partitions;

        if dispose {
            self.dispose();
        }
        self.init_buffers(device)?;
        self.allocated = true;
        self.generation += 1;

        log::debug!(
            "sort buffers sized for {} keys: {} partitions, {} histogram partitions",
            num_keys,
            partitions,
            hist_partitions
        );
        Ok(())
    }

    /// Frees the owned data buffers and the pass histogram. Borrowed buffers
    /// are left alone.
    pub fn dispose(&mut self) {
        for slot in self.keys.iter_mut().chain(self.payload.iter_mut()) {
            slot.dispose();
        }
        if let Some(pass_hist) = self.pass_hist.take() {
            pass_hist.destroy();
        }
        self.allocated = false;
    }

    fn init_buffers(&mut self, device: &wgpu::Device) -> Result<()> {
        for id in [SlotId::Keys, SlotId::AltKeys, SlotId::Payload, SlotId::AltPayload] {
            match self.slot(id) {
                Slot::Borrowed(buffer) => {
                    if self.mode == SortMode::Pairs || !id.is_payload() {
                        check_capacity(id, buffer, self.num_keys)?;
                    }
                }
                Slot::Owned(_) => {
                    let buffer = if self.num_keys == 0 {
                        None
                    } else {
                        Some(self.create_data_buffer(device, id)?)
                    };
                    *self.slot_mut(id) = Slot::Owned(buffer);
                }
            }
        }

        self.pass_hist = if self.partitions == 0 {
            None
        } else {
            Some(create_buffer(
                device,
                "pass histogram",
                pass_hist_entries(self.variant, self.partitions) * WORD,
                wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            )?)
        };
        Ok(())
    }

    fn create_data_buffer(&self, device: &wgpu::Device, id: SlotId) -> Result<wgpu::Buffer> {
        // Keys-only sorts still bind payload slots, a single word is enough.
        let size = if id.is_payload() && self.mode == SortMode::KeysOnly {
            WORD
        } else {
            self.num_keys as u64 * WORD
        };
        create_buffer(
            device,
            id.label(),
            size,
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
        )
    }

    fn slot(&self, id: SlotId) -> &Slot {
        match id {
            SlotId::Keys => &self.keys[0],
            SlotId::AltKeys => &self.keys[1],
            SlotId::Payload => &self.payload[0],
            SlotId::AltPayload => &self.payload[1],
        }
    }

    fn slot_mut(&mut self, id: SlotId) -> &mut Slot {
        match id {
            SlotId::Keys => &mut self.keys[0],
            SlotId::AltKeys => &mut self.keys[1],
            SlotId::Payload => &mut self.payload[0],
            SlotId::AltPayload => &mut self.payload[1],
        }
    }

    pub fn buffer(&self, id: SlotId) -> Option<&wgpu::Buffer> {
        self.slot(id).buffer()
    }

    pub fn ownership(&self, id: SlotId) -> Ownership {
        self.slot(id).ownership()
    }

    /// Key buffer of ping-pong index `i` (0 = caller slot, 1 = alternate).
    pub fn keys(&self, i: usize) -> Option<&wgpu::Buffer> {
        self.keys[i].buffer()
    }

    pub fn payload(&self, i: usize) -> Option<&wgpu::Buffer> {
        self.payload[i].buffer()
    }

    pub fn pass_hist(&self) -> Option<&wgpu::Buffer> {
        self.pass_hist.as_ref()
    }

    pub fn global_hist(&self) -> &wgpu::Buffer {
        &self.global_hist
    }

    pub fn index(&self) -> &wgpu::Buffer {
        &self.index
    }

    pub fn error_count(&self) -> &wgpu::Buffer {
        &self.error_count
    }

    pub fn error_readback(&self) -> &wgpu::Buffer {
        &self.error_readback
    }

    pub fn num_keys(&self) -> u32 {
        self.num_keys
    }

    pub fn partitions(&self) -> u32 {
        self.partitions
    }

    pub fn hist_partitions(&self) -> u32 {
        self.hist_partitions
    }

    pub fn mode(&self) -> SortMode {
        self.mode
    }

    /// Bumped whenever a binding may have changed.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

fn check_capacity(id: SlotId, buffer: &wgpu::Buffer, num_keys: u32) -> Result<()> {
    let required = num_keys as u64 * WORD;
    if buffer.size() < required {
        return Err(SortError::BufferTooSmall {
            slot: id.label().to_string(),
            size: buffer.size(),
            required,
        });
    }
    Ok(())
}

/// Creates a buffer and turns allocation and validation failures into an
/// error instead of a device panic.
pub(crate) fn create_buffer(
    device: &wgpu::Device,
    label: &str,
    size: u64,
    usage: wgpu::BufferUsages,
) -> Result<wgpu::Buffer> {
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
    let buffer = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size,
        usage,
        mapped_at_creation: false,
    });
    let out_of_memory = futures::executor::block_on(device.pop_error_scope());
    let invalid = futures::executor::block_on(device.pop_error_scope());

    match out_of_memory.or(invalid) {
        Some(source) => Err(SortError::Allocation {
            label: label.to_string(),
            source,
        }),
        None => Ok(buffer),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_has_no_partitions() {
        assert_eq!(partition_counts(0), (0, 0));
    }

    #[test]
    fn partition_boundaries() {
        assert_eq!(partition_counts(1), (1, 1));
        assert_eq!(partition_counts(PARTITION_SIZE), (1, 1));
        assert_eq!(partition_counts(PARTITION_SIZE + 1), (2, 1));
        assert_eq!(partition_counts(GLOBAL_HIST_PARTITION_SIZE + 1).1, 2);
        assert_eq!(partition_counts(1 << 23), (2185, 256));
    }

    #[test]
    fn pass_histogram_scales_with_variant() {
        assert_eq!(pass_hist_entries(SortVariant::OneSweep, 3), 3 * 256 * 4);
        assert_eq!(pass_hist_entries(SortVariant::DeviceRadix, 3), 3 * 256);
    }
}
