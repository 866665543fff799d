//! Compute device bring-up and resource lifetime management.
//!
//! One [`Device`] owns the logical device, the submission queue, the
//! timestamp query pool and one slab store per resource kind. All operations
//! on a device happen from a single logical scheduler; nothing here is
//! thread-safe by design, which keeps lookups and recording allocation-free.
//!
//! Blocking is confined to the operations that are allowed to block:
//! [`Device::wait_for_fence`], [`Device::map_buffer`] and submission.

use std::sync::{mpsc, Arc};

use super::commands::{BindScratch, CommandBuffer};
use super::error::{GpuError, GpuResult};
use super::handles::{Handle, ResourceStore};
use super::pipeline::{self, Pipeline};
use super::resources::{
    needs_black_border, translate_address_mode, translate_buffer_usage, translate_image_usage,
    AccessFlags, Buffer, BufferUsage, Image, ImageDesc, ImageLayout, MemoryProperties, Sampler,
    SamplerDesc,
};
use super::shader::{self, Shader, ShaderSource};

/// Number of slots in the device's timestamp query pool.
pub const TIMESTAMP_QUERY_COUNT: u32 = 32;

/// Upper bound on descriptors written per binding update. The scratch pool
/// that backs descriptor updates is sized once at device init.
pub const MAX_WRITE_DESCRIPTORS: usize = 128;

/// Upper bound on barriers accepted by a single `pipeline_barrier`.
pub const MAX_BARRIERS: usize = 64;

/// Features relevant to the path tracer, resolved at init.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceFeatures {
    pub shader_f16: bool,
    pub float32_filterable: bool,
    /// Samplers may clamp to a border colour.
    pub border_clamp: bool,
    /// Timestamp query pool available.
    pub timestamps: bool,
    /// Timestamps may be written between dispatches, not just around passes.
    pub timestamps_in_commands: bool,
}

/// Limits callers need for buffer packing and dispatch sizing.
#[derive(Clone, Copy, Debug)]
pub struct DeviceLimits {
    pub min_storage_buffer_offset_alignment: u64,
    pub max_push_constant_size: u32,
    pub max_workgroups_per_dimension: u32,
    /// Nanoseconds per timestamp tick.
    pub timestamp_period_ns: f32,
}

/// Host-visible completion signal for a submission.
pub struct Fence {
    pub(crate) submission: Option<wgpu::SubmissionIndex>,
}

/// Map direction for host access to a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapMode {
    Read,
    Write,
}

pub(crate) struct Stores {
    pub buffers: ResourceStore<Buffer>,
    pub images: ResourceStore<Image>,
    pub samplers: ResourceStore<Sampler>,
    pub shaders: ResourceStore<Shader>,
    pub pipelines: ResourceStore<Pipeline>,
    pub command_buffers: ResourceStore<CommandBuffer>,
    pub fences: ResourceStore<Fence>,
}

impl Stores {
    fn new() -> Self {
        Self {
            buffers: ResourceStore::new("buffer"),
            images: ResourceStore::new("image"),
            samplers: ResourceStore::new("sampler"),
            shaders: ResourceStore::new("shader"),
            pipelines: ResourceStore::new("pipeline"),
            command_buffers: ResourceStore::new("command buffer"),
            fences: ResourceStore::new("fence"),
        }
    }
}

/// A logical compute device plus its resource stores.
pub struct Device {
    pub(crate) raw: wgpu::Device,
    pub(crate) queue: wgpu::Queue,
    pub(crate) stores: Stores,
    pub(crate) timestamp_pool: Option<wgpu::QuerySet>,
    /// Resolve target for the query pool; results are copied from here into
    /// the caller's buffer, which stays free of query-resolve usage.
    pub(crate) timestamp_resolve: Option<wgpu::Buffer>,
    /// Command buffers hold a `Weak` to this token; submission verifies it.
    pub(crate) liveness: Arc<()>,
    /// Reusable write-descriptor scratch, bounded by [`MAX_WRITE_DESCRIPTORS`].
    pub(crate) bind_scratch: BindScratch,
    features: DeviceFeatures,
    limits: DeviceLimits,
    adapter_name: String,
}

impl Device {
    /// Number of usable adapters on this system.
    pub fn adapter_count() -> usize {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });
        instance.enumerate_adapters(wgpu::Backends::PRIMARY).len()
    }

    /// Open the adapter at `adapter_index` and create a logical device.
    ///
    /// Fails with [`GpuError::UnsupportedHardware`] if the adapter is missing
    /// push constants, which the renderer cannot work without. Timestamp
    /// support is optional and only disables profiling output.
    pub fn new(adapter_index: usize) -> GpuResult<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });

        let adapters = instance.enumerate_adapters(wgpu::Backends::PRIMARY);
        let adapter = adapters.into_iter().nth(adapter_index).ok_or_else(|| {
            GpuError::UnsupportedHardware(format!("no adapter at index {adapter_index}"))
        })?;

        let info = adapter.get_info();
        log::info!("using adapter '{}' ({:?})", info.name, info.backend);

        let required = wgpu::Features::PUSH_CONSTANTS;
        let supported = adapter.features();
        if !supported.contains(required) {
            return Err(GpuError::UnsupportedHardware(format!(
                "adapter '{}' lacks required features: {:?}",
                info.name,
                required - supported
            )));
        }

        let optional = (wgpu::Features::TIMESTAMP_QUERY
            | wgpu::Features::TIMESTAMP_QUERY_INSIDE_ENCODERS
            | wgpu::Features::SHADER_F16
            | wgpu::Features::FLOAT32_FILTERABLE
            | wgpu::Features::ADDRESS_MODE_CLAMP_TO_BORDER)
            & supported;

        let features = DeviceFeatures {
            shader_f16: supported.contains(wgpu::Features::SHADER_F16),
            float32_filterable: supported.contains(wgpu::Features::FLOAT32_FILTERABLE),
            border_clamp: supported.contains(wgpu::Features::ADDRESS_MODE_CLAMP_TO_BORDER),
            timestamps: supported.contains(wgpu::Features::TIMESTAMP_QUERY),
            timestamps_in_commands: supported
                .contains(wgpu::Features::TIMESTAMP_QUERY_INSIDE_ENCODERS),
        };

        let required_limits = wgpu::Limits {
            max_push_constant_size: 128,
            ..wgpu::Limits::default()
        };

        let (raw, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("gatling device"),
                required_features: required | optional,
                required_limits,
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        ))
        .map_err(|e| GpuError::UnsupportedHardware(e.to_string()))?;

        let timestamp_pool = features.timestamps.then(|| {
            raw.create_query_set(&wgpu::QuerySetDescriptor {
                label: Some("Timestamp Pool"),
                ty: wgpu::QueryType::Timestamp,
                count: TIMESTAMP_QUERY_COUNT,
            })
        });
        let timestamp_resolve = features.timestamps.then(|| {
            raw.create_buffer(&wgpu::BufferDescriptor {
                label: Some("Timestamp Resolve"),
                size: TIMESTAMP_QUERY_COUNT as u64 * 8,
                usage: wgpu::BufferUsages::QUERY_RESOLVE | wgpu::BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            })
        });

        let wlimits = raw.limits();
        let limits = DeviceLimits {
            min_storage_buffer_offset_alignment: wlimits.min_storage_buffer_offset_alignment
                as u64,
            max_push_constant_size: wlimits.max_push_constant_size,
            max_workgroups_per_dimension: wlimits.max_compute_workgroups_per_dimension,
            timestamp_period_ns: queue.get_timestamp_period(),
        };

        Ok(Self {
            raw,
            queue,
            stores: Stores::new(),
            timestamp_pool,
            timestamp_resolve,
            liveness: Arc::new(()),
            bind_scratch: BindScratch::default(),
            features,
            limits,
            adapter_name: info.name,
        })
    }

    pub fn features(&self) -> DeviceFeatures {
        self.features
    }

    pub fn limits(&self) -> DeviceLimits {
        self.limits
    }

    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    // ---- Buffers ------------------------------------------------------

    pub fn create_buffer(
        &mut self,
        usage: BufferUsage,
        memory: MemoryProperties,
        size: u64,
    ) -> GpuResult<Handle<Buffer>> {
        // Copy commands operate on 4-byte granules; pad the allocation, but
        // keep the requested size for range validation.
        let physical_size = size.max(4).div_ceil(4) * 4;
        let raw = self.raw.create_buffer(&wgpu::BufferDescriptor {
            label: None,
            size: physical_size,
            usage: translate_buffer_usage(usage, memory),
            mapped_at_creation: false,
        });

        Ok(self.stores.buffers.create(Buffer {
            raw,
            size,
            usage,
            memory,
            mapped: false,
        }))
    }

    pub fn buffer(&self, handle: Handle<Buffer>) -> GpuResult<&Buffer> {
        self.stores.buffers.get(handle)
    }

    pub fn destroy_buffer(&mut self, handle: Handle<Buffer>) -> GpuResult<()> {
        let buffer = self.stores.buffers.free(handle)?;
        buffer.raw.destroy();
        Ok(())
    }

    /// Convenience upload through the queue's staging belt; the buffer must
    /// have transfer-destination usage.
    pub fn upload_buffer(
        &mut self,
        handle: Handle<Buffer>,
        offset: u64,
        data: &[u8],
    ) -> GpuResult<()> {
        let buffer = self.stores.buffers.get(handle)?;
        self.queue.write_buffer(&buffer.raw, offset, data);
        Ok(())
    }

    // ---- Memory mapping -----------------------------------------------

    /// Map a host-visible buffer. Blocks until the driver signals the map.
    pub fn map_buffer(&mut self, handle: Handle<Buffer>, mode: MapMode) -> GpuResult<()> {
        let buffer = self.stores.buffers.get(handle)?;
        if !buffer.memory.contains(MemoryProperties::HOST_VISIBLE) {
            return Err(GpuError::MapFailed("buffer is not host-visible".into()));
        }
        if buffer.mapped {
            return Err(GpuError::MapFailed("buffer is already mapped".into()));
        }

        let wmode = match mode {
            MapMode::Read => wgpu::MapMode::Read,
            MapMode::Write => wgpu::MapMode::Write,
        };

        let (tx, rx) = mpsc::channel();
        buffer.raw.slice(..).map_async(wmode, move |result| {
            let _ = tx.send(result);
        });

        // The callback may fire on any poll; keep polling through spurious
        // wakeups until it lands.
        let result = loop {
            self.raw.poll(wgpu::Maintain::Wait);
            match rx.try_recv() {
                Ok(result) => break result,
                Err(mpsc::TryRecvError::Empty) => continue,
                Err(mpsc::TryRecvError::Disconnected) => {
                    return Err(GpuError::MapFailed("map callback dropped".into()))
                }
            }
        };
        result.map_err(|e| GpuError::MapFailed(e.to_string()))?;

        self.stores.buffers.get_mut(handle)?.mapped = true;
        Ok(())
    }

    /// Read view of a mapped buffer range.
    pub fn mapped_range(
        &self,
        handle: Handle<Buffer>,
        offset: u64,
        size: u64,
    ) -> GpuResult<wgpu::BufferView<'_>> {
        let buffer = self.stores.buffers.get(handle)?;
        if !buffer.mapped {
            return Err(GpuError::NotMapped);
        }
        Ok(buffer.raw.slice(offset..offset + size).get_mapped_range())
    }

    /// Write view of a mapped buffer range.
    pub fn mapped_range_mut(
        &mut self,
        handle: Handle<Buffer>,
        offset: u64,
        size: u64,
    ) -> GpuResult<wgpu::BufferViewMut<'_>> {
        let buffer = self.stores.buffers.get(handle)?;
        if !buffer.mapped {
            return Err(GpuError::NotMapped);
        }
        Ok(buffer
            .raw
            .slice(offset..offset + size)
            .get_mapped_range_mut())
    }

    pub fn unmap_buffer(&mut self, handle: Handle<Buffer>) -> GpuResult<()> {
        let buffer = self.stores.buffers.get_mut(handle)?;
        if !buffer.mapped {
            return Err(GpuError::NotMapped);
        }
        buffer.raw.unmap();
        buffer.mapped = false;
        Ok(())
    }

    /// Make host writes visible to the device. The backing driver exposes
    /// coherent mapped memory, so this only validates the mapped state.
    pub fn flush_mapped_buffer(&mut self, handle: Handle<Buffer>) -> GpuResult<()> {
        let buffer = self.stores.buffers.get(handle)?;
        if !buffer.mapped {
            return Err(GpuError::NotMapped);
        }
        Ok(())
    }

    /// Make device writes visible to the host. See [`Self::flush_mapped_buffer`].
    pub fn invalidate_mapped_buffer(&mut self, handle: Handle<Buffer>) -> GpuResult<()> {
        self.flush_mapped_buffer(handle)
    }

    // ---- Images and samplers ------------------------------------------

    pub fn create_image(&mut self, desc: ImageDesc) -> GpuResult<Handle<Image>> {
        let dimension = if desc.depth > 1 {
            wgpu::TextureDimension::D3
        } else {
            wgpu::TextureDimension::D2
        };

        let raw = self.raw.create_texture(&wgpu::TextureDescriptor {
            label: None,
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: desc.depth,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension,
            format: desc.format.to_wgpu(),
            usage: translate_image_usage(desc.usage),
            view_formats: &[],
        });
        let view = raw.create_view(&wgpu::TextureViewDescriptor::default());

        Ok(self.stores.images.create(Image {
            raw,
            view,
            desc,
            layout: ImageLayout::Undefined,
            access: AccessFlags::NONE,
        }))
    }

    pub fn image(&self, handle: Handle<Image>) -> GpuResult<&Image> {
        self.stores.images.get(handle)
    }

    pub fn destroy_image(&mut self, handle: Handle<Image>) -> GpuResult<()> {
        let image = self.stores.images.free(handle)?;
        image.raw.destroy();
        Ok(())
    }

    pub fn create_sampler(&mut self, desc: SamplerDesc) -> GpuResult<Handle<Sampler>> {
        let mut desc = desc;
        let mut clamps_to_border = needs_black_border(&desc);
        if clamps_to_border && !self.features.border_clamp {
            // Closest portable behaviour; the edge texel wins over black.
            log::warn!("adapter cannot clamp to border; falling back to edge clamping");
            for mode in [&mut desc.address_u, &mut desc.address_v, &mut desc.address_w] {
                if *mode == super::resources::AddressMode::ClampToBlack {
                    *mode = super::resources::AddressMode::ClampToEdge;
                }
            }
            clamps_to_border = false;
        }

        let filter = if desc.linear_filtering {
            wgpu::FilterMode::Linear
        } else {
            wgpu::FilterMode::Nearest
        };

        let raw = self.raw.create_sampler(&wgpu::SamplerDescriptor {
            label: None,
            address_mode_u: translate_address_mode(desc.address_u),
            address_mode_v: translate_address_mode(desc.address_v),
            address_mode_w: translate_address_mode(desc.address_w),
            mag_filter: filter,
            min_filter: filter,
            mipmap_filter: wgpu::FilterMode::Nearest,
            border_color: clamps_to_border.then_some(wgpu::SamplerBorderColor::TransparentBlack),
            ..Default::default()
        });

        Ok(self.stores.samplers.create(Sampler { raw }))
    }

    pub fn destroy_sampler(&mut self, handle: Handle<Sampler>) -> GpuResult<()> {
        self.stores.samplers.free(handle).map(|_| ())
    }

    // ---- Shaders and pipelines ----------------------------------------

    pub fn create_shader(&mut self, source: ShaderSource) -> GpuResult<Handle<Shader>> {
        let ir = shader::parse_ir(&source)?;
        shader::validate(&ir)?;
        let reflection = shader::reflect(&ir)?;

        let module = match source {
            ShaderSource::Wgsl(text) => self.raw.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: None,
                source: wgpu::ShaderSource::Wgsl(text.into()),
            }),
            ShaderSource::SpirV(words) => {
                self.raw.create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: None,
                    source: wgpu::ShaderSource::SpirV(words.into()),
                })
            }
        };

        Ok(self.stores.shaders.create(Shader { module, reflection }))
    }

    pub fn shader(&self, handle: Handle<Shader>) -> GpuResult<&Shader> {
        self.stores.shaders.get(handle)
    }

    pub fn destroy_shader(&mut self, handle: Handle<Shader>) -> GpuResult<()> {
        self.stores.shaders.free(handle).map(|_| ())
    }

    pub fn create_pipeline(
        &mut self,
        shader: Handle<Shader>,
        label: &str,
    ) -> GpuResult<Handle<Pipeline>> {
        let shader = self.stores.shaders.get(shader)?;
        let pipeline = pipeline::create_pipeline(&self.raw, shader, label)?;
        Ok(self.stores.pipelines.create(pipeline))
    }

    pub fn pipeline(&self, handle: Handle<Pipeline>) -> GpuResult<&Pipeline> {
        self.stores.pipelines.get(handle)
    }

    pub fn destroy_pipeline(&mut self, handle: Handle<Pipeline>) -> GpuResult<()> {
        self.stores.pipelines.free(handle).map(|_| ())
    }

    // ---- Fences -------------------------------------------------------

    pub fn create_fence(&mut self) -> GpuResult<Handle<Fence>> {
        Ok(self.stores.fences.create(Fence { submission: None }))
    }

    pub fn reset_fence(&mut self, handle: Handle<Fence>) -> GpuResult<()> {
        self.stores.fences.get_mut(handle)?.submission = None;
        Ok(())
    }

    /// Block until the submission the fence was signalled with has drained.
    pub fn wait_for_fence(&mut self, handle: Handle<Fence>) -> GpuResult<()> {
        let Some(submission) = self.stores.fences.get(handle)?.submission.clone() else {
            log::warn!("waiting on a fence that has no pending submission");
            return Ok(());
        };

        // Spurious wakeups: poll again until the queue reports completion.
        loop {
            let result = self
                .raw
                .poll(wgpu::Maintain::WaitForSubmissionIndex(submission.clone()));
            if result.is_queue_empty() {
                return Ok(());
            }
        }
    }

    pub fn destroy_fence(&mut self, handle: Handle<Fence>) -> GpuResult<()> {
        self.stores.fences.free(handle).map(|_| ())
    }
}
