use crate::capabilities::Capabilities;
use crate::error::{Result, SortError};

/// Instance, adapter, device and queue of one compute device, plus what the
/// probe found out about it.
pub struct GpuContext {
    _instance: wgpu::Instance,
    pub adapter: wgpu::Adapter,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub capabilities: Capabilities,
}

impl GpuContext {
    /// Picks an adapter honouring `WGPU_BACKEND` and `WGPU_POWER_PREF`, and
    /// creates a device with every limit the adapter offers so that large
    /// sorts can bind large buffers.
    pub async fn new() -> Result<Self> {
        let backends = wgpu::util::backend_bits_from_env().unwrap_or(wgpu::Backends::PRIMARY);
        let power_preference = wgpu::util::power_preference_from_env()
            .unwrap_or(wgpu::PowerPreference::HighPerformance);

        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends,
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference,
                force_fallback_adapter: false,
                compatible_surface: None,
            })
            .await
            .ok_or(SortError::NoAdapter)?;

        let capabilities = Capabilities::query(&adapter);

        let trace_dir = std::env::var("WGPU_TRACE");
        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("sweep sort device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: adapter.limits(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                trace_dir.ok().as_ref().map(std::path::Path::new),
            )
            .await?;

        Ok(Self {
            _instance: instance,
            adapter,
            device,
            queue,
            capabilities,
        })
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }
}
