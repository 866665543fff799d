//! Command recording and submission.
//!
//! Commands are recorded into a replayable op list and encoded on submit.
//! Two pieces of policy live here:
//!
//! * **Descriptor updates** resolve the caller's `(binding, index)` slots
//!   against the bound pipeline's reflected layout with a merge walk over
//!   slot-sorted lists. A layout slot with no matching resource fails with
//!   `BindingMismatch` before anything reaches the driver.
//! * **Implicit image transitions**: recording a dispatch brings every bound
//!   image into the layout its descriptor kind requires (`ShaderReadOnly`
//!   for sampled, `General` for storage), updating the tracked layout and
//!   access mask and inserting the barrier before the dispatch. Sequential
//!   dispatches therefore compose without manual barriers.

use std::num::NonZeroU64;
use std::sync::Weak;

use super::device::{
    Device, Fence, Stores, MAX_BARRIERS, MAX_WRITE_DESCRIPTORS, TIMESTAMP_QUERY_COUNT,
};
use super::error::{GpuError, GpuResult};
use super::handles::Handle;
use super::pipeline::Pipeline;
use super::resources::{AccessFlags, Buffer, Image, ImageLayout, Sampler, WHOLE_SIZE};
use super::shader::DescriptorKind;

/// A storage- or uniform-buffer slot supplied to a binding update.
#[derive(Clone, Copy, Debug)]
pub struct BufferBindingSlot {
    pub binding: u32,
    pub index: u32,
    pub buffer: Handle<Buffer>,
    pub offset: u64,
    /// Byte length, or [`WHOLE_SIZE`] for the rest of the buffer.
    pub size: u64,
}

impl BufferBindingSlot {
    /// Bind a whole buffer at `binding`, array index 0.
    pub fn entire(binding: u32, buffer: Handle<Buffer>) -> Self {
        Self {
            binding,
            index: 0,
            buffer,
            offset: 0,
            size: WHOLE_SIZE,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ImageBindingSlot {
    pub binding: u32,
    pub index: u32,
    pub image: Handle<Image>,
}

#[derive(Clone, Copy, Debug)]
pub struct SamplerBindingSlot {
    pub binding: u32,
    pub index: u32,
    pub sampler: Handle<Sampler>,
}

/// Resources for one descriptor update, matched against the reflected layout.
#[derive(Clone, Copy, Debug, Default)]
pub struct Bindings<'a> {
    pub buffers: &'a [BufferBindingSlot],
    pub images: &'a [ImageBindingSlot],
    pub samplers: &'a [SamplerBindingSlot],
}

/// An explicit buffer memory dependency.
#[derive(Clone, Copy, Debug)]
pub struct BufferBarrier {
    pub buffer: Handle<Buffer>,
    pub src_access: AccessFlags,
    pub dst_access: AccessFlags,
    pub offset: u64,
    pub size: u64,
}

/// An explicit image layout/memory dependency.
#[derive(Clone, Copy, Debug)]
pub struct ImageBarrier {
    pub image: Handle<Image>,
    pub src_access: AccessFlags,
    pub dst_access: AccessFlags,
    pub new_layout: ImageLayout,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RecordState {
    Initial,
    Recording,
    Executable,
}

pub(crate) enum Cmd {
    BindPipeline(Handle<Pipeline>),
    SetBindGroup(wgpu::BindGroup),
    PushConstants(Vec<u8>),
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    CopyBuffer {
        src: Handle<Buffer>,
        src_offset: u64,
        dst: Handle<Buffer>,
        dst_offset: u64,
        size: u64,
    },
    CopyBufferToImage {
        buffer: Handle<Buffer>,
        buffer_offset: u64,
        image: Handle<Image>,
    },
    /// Ordering point. The backing driver resolves the actual hazards; the
    /// op marks where transitions were recorded relative to dispatches.
    Barrier,
    WriteTimestamp {
        query: u32,
    },
    ResolveTimestamps {
        first: u32,
        count: u32,
        dst: Handle<Buffer>,
        dst_offset: u64,
    },
}

/// A recorded command stream. Holds a non-owning reference to its device;
/// submission verifies the device is still alive.
pub struct CommandBuffer {
    pub(crate) state: RecordState,
    pub(crate) device: Weak<()>,
    pub(crate) ops: Vec<Cmd>,
    pub(crate) bound_pipeline: Option<Handle<Pipeline>>,
    pub(crate) bound_images: Vec<ImageBindingSlot>,
}

/// Reusable scratch for descriptor updates, bounded by
/// [`MAX_WRITE_DESCRIPTORS`]; allocated once per device.
#[derive(Default)]
pub(crate) struct BindScratch {
    buffers: Vec<BufferBindingSlot>,
    images: Vec<ImageBindingSlot>,
    samplers: Vec<SamplerBindingSlot>,
}

/// Layout and access an image must be in for a shader to use it through a
/// binding of the given kind; `None` for non-image bindings.
pub(crate) fn required_image_state(
    binding: &super::shader::ReflectedBinding,
) -> Option<(ImageLayout, AccessFlags)> {
    let layout = match binding.kind {
        DescriptorKind::SampledImage { .. } => ImageLayout::ShaderReadOnly,
        DescriptorKind::StorageImage { .. } => ImageLayout::General,
        _ => return None,
    };
    let mut access = AccessFlags::NONE;
    if binding.read_access {
        access = access | AccessFlags::SHADER_READ;
    }
    if binding.write_access {
        access = access | AccessFlags::SHADER_WRITE;
    }
    Some((layout, access))
}

impl Device {
    pub fn create_command_buffer(&mut self) -> GpuResult<Handle<CommandBuffer>> {
        let device = std::sync::Arc::downgrade(&self.liveness);
        Ok(self.stores.command_buffers.create(CommandBuffer {
            state: RecordState::Initial,
            device,
            ops: Vec::new(),
            bound_pipeline: None,
            bound_images: Vec::new(),
        }))
    }

    pub fn destroy_command_buffer(&mut self, cmd: Handle<CommandBuffer>) -> GpuResult<()> {
        self.stores.command_buffers.free(cmd).map(|_| ())
    }

    fn recording(&mut self, cmd: Handle<CommandBuffer>) -> GpuResult<&mut CommandBuffer> {
        let cb = self.stores.command_buffers.get_mut(cmd)?;
        if cb.state != RecordState::Recording {
            return Err(GpuError::RecordState {
                expected: "recording",
            });
        }
        Ok(cb)
    }

    /// Start recording. Re-beginning an executable buffer discards its
    /// previous contents, matching pool-reset semantics.
    pub fn begin_commands(&mut self, cmd: Handle<CommandBuffer>) -> GpuResult<()> {
        let cb = self.stores.command_buffers.get_mut(cmd)?;
        if cb.state == RecordState::Recording {
            return Err(GpuError::RecordState { expected: "initial" });
        }
        cb.state = RecordState::Recording;
        cb.ops.clear();
        cb.bound_pipeline = None;
        cb.bound_images.clear();
        Ok(())
    }

    pub fn end_commands(&mut self, cmd: Handle<CommandBuffer>) -> GpuResult<()> {
        let cb = self.recording(cmd)?;
        cb.state = RecordState::Executable;
        Ok(())
    }

    pub fn cmd_bind_pipeline(
        &mut self,
        cmd: Handle<CommandBuffer>,
        pipeline: Handle<Pipeline>,
    ) -> GpuResult<()> {
        self.stores.pipelines.get(pipeline)?;
        let cb = self.recording(cmd)?;
        cb.bound_pipeline = Some(pipeline);
        cb.ops.push(Cmd::BindPipeline(pipeline));
        Ok(())
    }

    /// Match the supplied resources against the bound pipeline's reflected
    /// layout and record the resulting descriptor set.
    pub fn cmd_update_bindings(
        &mut self,
        cmd: Handle<CommandBuffer>,
        bindings: &Bindings,
    ) -> GpuResult<()> {
        let pipeline_handle = {
            let cb = self.recording(cmd)?;
            cb.bound_pipeline.ok_or(GpuError::NoPipelineBound)?
        };

        let slot_count = bindings.buffers.len() + bindings.images.len() + bindings.samplers.len();
        if slot_count > MAX_WRITE_DESCRIPTORS {
            return Err(GpuError::LimitReached {
                what: "write descriptors per binding update",
                limit: MAX_WRITE_DESCRIPTORS,
            });
        }

        let alignment = self.limits().min_storage_buffer_offset_alignment;
        let bind_group = {
            let stores = &self.stores;
            let scratch = &mut self.bind_scratch;
            let pipeline = stores.pipelines.get(pipeline_handle)?;

            // Sort the user slots once; the walk below then advances a
            // cursor per resource class instead of rescanning.
            scratch.buffers.clear();
            scratch.buffers.extend_from_slice(bindings.buffers);
            scratch
                .buffers
                .sort_unstable_by_key(|s| (s.binding, s.index));
            scratch.images.clear();
            scratch.images.extend_from_slice(bindings.images);
            scratch
                .images
                .sort_unstable_by_key(|s| (s.binding, s.index));
            scratch.samplers.clear();
            scratch.samplers.extend_from_slice(bindings.samplers);
            scratch
                .samplers
                .sort_unstable_by_key(|s| (s.binding, s.index));

            let mut entries = Vec::with_capacity(pipeline.bindings.len());
            let (mut bi, mut ii, mut si) = (0usize, 0usize, 0usize);

            for layout in &pipeline.bindings {
                if layout.count != 1 {
                    return Err(GpuError::LimitReached {
                        what: "descriptor array size",
                        limit: 1,
                    });
                }
                let key = (layout.binding, 0u32);
                let mismatch = || GpuError::BindingMismatch {
                    binding: layout.binding,
                    index: 0,
                };

                let resource = match layout.kind {
                    DescriptorKind::StorageBuffer | DescriptorKind::UniformBuffer => {
                        while scratch.buffers.get(bi).is_some_and(|s| (s.binding, s.index) < key)
                        {
                            bi += 1;
                        }
                        let slot = scratch
                            .buffers
                            .get(bi)
                            .filter(|s| (s.binding, s.index) == key)
                            .ok_or_else(mismatch)?;

                        let buffer = stores.buffers.get(slot.buffer)?;
                        if layout.kind == DescriptorKind::StorageBuffer
                            && slot.offset % alignment != 0
                        {
                            return Err(GpuError::UnalignedBindingOffset {
                                offset: slot.offset,
                                alignment,
                            });
                        }

                        let size = if slot.size == WHOLE_SIZE {
                            buffer.size - slot.offset
                        } else {
                            slot.size
                        };
                        wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                            buffer: &buffer.raw,
                            offset: slot.offset,
                            size: NonZeroU64::new(size),
                        })
                    }
                    DescriptorKind::SampledImage { .. } | DescriptorKind::StorageImage { .. } => {
                        while scratch.images.get(ii).is_some_and(|s| (s.binding, s.index) < key) {
                            ii += 1;
                        }
                        let slot = scratch
                            .images
                            .get(ii)
                            .filter(|s| (s.binding, s.index) == key)
                            .ok_or_else(mismatch)?;
                        wgpu::BindingResource::TextureView(&stores.images.get(slot.image)?.view)
                    }
                    DescriptorKind::Sampler => {
                        while scratch
                            .samplers
                            .get(si)
                            .is_some_and(|s| (s.binding, s.index) < key)
                        {
                            si += 1;
                        }
                        let slot = scratch
                            .samplers
                            .get(si)
                            .filter(|s| (s.binding, s.index) == key)
                            .ok_or_else(mismatch)?;
                        wgpu::BindingResource::Sampler(&stores.samplers.get(slot.sampler)?.raw)
                    }
                };

                entries.push(wgpu::BindGroupEntry {
                    binding: layout.binding,
                    resource,
                });
            }

            self.raw.create_bind_group(&wgpu::BindGroupDescriptor {
                label: None,
                layout: &pipeline.bind_layout,
                entries: &entries,
            })
        };

        let cb = self.stores.command_buffers.get_mut(cmd)?;
        cb.bound_images = bindings.images.to_vec();
        cb.ops.push(Cmd::SetBindGroup(bind_group));
        Ok(())
    }

    pub fn cmd_push_constants(&mut self, cmd: Handle<CommandBuffer>, data: &[u8]) -> GpuResult<()> {
        let pipeline_handle = {
            let cb = self.recording(cmd)?;
            cb.bound_pipeline.ok_or(GpuError::NoPipelineBound)?
        };
        let reflected = self.stores.pipelines.get(pipeline_handle)?.push_constant_size;
        if data.len() as u32 != reflected {
            return Err(GpuError::PushConstantSize {
                pushed: data.len() as u32,
                reflected,
            });
        }
        let cb = self.stores.command_buffers.get_mut(cmd)?;
        cb.ops.push(Cmd::PushConstants(data.to_vec()));
        Ok(())
    }

    pub fn cmd_copy_buffer(
        &mut self,
        cmd: Handle<CommandBuffer>,
        src: Handle<Buffer>,
        src_offset: u64,
        dst: Handle<Buffer>,
        dst_offset: u64,
        size: u64,
    ) -> GpuResult<()> {
        let src_size = self.stores.buffers.get(src)?.size;
        self.stores.buffers.get(dst)?;
        let size = if size == WHOLE_SIZE {
            src_size - src_offset
        } else {
            size
        };
        let cb = self.recording(cmd)?;
        cb.ops.push(Cmd::CopyBuffer {
            src,
            src_offset,
            dst,
            dst_offset,
            size,
        });
        Ok(())
    }

    /// Copy tightly packed texel rows from a buffer into an image. The image
    /// is implicitly transitioned to `TransferDst`.
    pub fn cmd_copy_buffer_to_image(
        &mut self,
        cmd: Handle<CommandBuffer>,
        buffer: Handle<Buffer>,
        buffer_offset: u64,
        image: Handle<Image>,
    ) -> GpuResult<()> {
        self.stores.buffers.get(buffer)?;
        {
            let img = self.stores.images.get_mut(image)?;
            img.layout = ImageLayout::TransferDst;
            img.access = AccessFlags::TRANSFER_WRITE;
        }
        let cb = self.recording(cmd)?;
        cb.ops.push(Cmd::Barrier);
        cb.ops.push(Cmd::CopyBufferToImage {
            buffer,
            buffer_offset,
            image,
        });
        Ok(())
    }

    /// Explicit memory dependency. Image barriers update the tracked layout
    /// and access mask immediately, at record order.
    pub fn cmd_pipeline_barrier(
        &mut self,
        cmd: Handle<CommandBuffer>,
        buffer_barriers: &[BufferBarrier],
        image_barriers: &[ImageBarrier],
    ) -> GpuResult<()> {
        if buffer_barriers.len() + image_barriers.len() > MAX_BARRIERS {
            return Err(GpuError::LimitReached {
                what: "barriers per pipeline barrier",
                limit: MAX_BARRIERS,
            });
        }
        for barrier in buffer_barriers {
            self.stores.buffers.get(barrier.buffer)?;
        }
        for barrier in image_barriers {
            let img = self.stores.images.get_mut(barrier.image)?;
            img.layout = barrier.new_layout;
            img.access = barrier.dst_access;
        }
        let cb = self.recording(cmd)?;
        cb.ops.push(Cmd::Barrier);
        Ok(())
    }

    /// Record a dispatch, inserting implicit layout transitions for every
    /// image the bound pipeline samples or writes.
    pub fn cmd_dispatch(
        &mut self,
        cmd: Handle<CommandBuffer>,
        x: u32,
        y: u32,
        z: u32,
    ) -> GpuResult<()> {
        let (pipeline_handle, bound_images) = {
            let cb = self.recording(cmd)?;
            let pipeline = cb.bound_pipeline.ok_or(GpuError::NoPipelineBound)?;
            (pipeline, cb.bound_images.clone())
        };

        let mut transitions: Vec<(Handle<Image>, ImageLayout, AccessFlags)> = Vec::new();
        {
            let pipeline = self.stores.pipelines.get(pipeline_handle)?;
            for layout in &pipeline.bindings {
                let Some((required, access)) = required_image_state(layout) else {
                    continue;
                };
                for index in 0..layout.count {
                    let slot = bound_images
                        .iter()
                        .find(|s| s.binding == layout.binding && s.index == index)
                        .ok_or(GpuError::BindingMismatch {
                            binding: layout.binding,
                            index,
                        })?;
                    let image = self.stores.images.get(slot.image)?;
                    if image.layout != required {
                        transitions.push((slot.image, required, access));
                    }
                }
            }
        }

        for (handle, layout, access) in &transitions {
            let image = self.stores.images.get_mut(*handle)?;
            image.layout = *layout;
            image.access = *access;
        }

        let cb = self.stores.command_buffers.get_mut(cmd)?;
        if !transitions.is_empty() {
            cb.ops.push(Cmd::Barrier);
        }
        cb.ops.push(Cmd::Dispatch { x, y, z });
        Ok(())
    }

    /// Reset a range of the timestamp pool. The pool needs no explicit
    /// reset on this backend; the range is still validated so misuse fails
    /// deterministically everywhere.
    pub fn cmd_reset_timestamps(
        &mut self,
        cmd: Handle<CommandBuffer>,
        first: u32,
        count: u32,
    ) -> GpuResult<()> {
        if first + count > TIMESTAMP_QUERY_COUNT {
            return Err(GpuError::LimitReached {
                what: "timestamp queries",
                limit: TIMESTAMP_QUERY_COUNT as usize,
            });
        }
        self.recording(cmd)?;
        Ok(())
    }

    pub fn cmd_write_timestamp(&mut self, cmd: Handle<CommandBuffer>, query: u32) -> GpuResult<()> {
        if query >= TIMESTAMP_QUERY_COUNT {
            return Err(GpuError::LimitReached {
                what: "timestamp queries",
                limit: TIMESTAMP_QUERY_COUNT as usize,
            });
        }
        if !self.features().timestamps_in_commands {
            log::warn!("timestamp queries unsupported by this adapter; skipping");
            self.recording(cmd)?;
            return Ok(());
        }
        let cb = self.recording(cmd)?;
        cb.ops.push(Cmd::WriteTimestamp { query });
        Ok(())
    }

    /// Resolve `count` timestamps starting at `first` into `dst` as u64
    /// ticks at `dst_offset`.
    pub fn cmd_copy_timestamps(
        &mut self,
        cmd: Handle<CommandBuffer>,
        dst: Handle<Buffer>,
        first: u32,
        count: u32,
        dst_offset: u64,
    ) -> GpuResult<()> {
        if first + count > TIMESTAMP_QUERY_COUNT {
            return Err(GpuError::LimitReached {
                what: "timestamp queries",
                limit: TIMESTAMP_QUERY_COUNT as usize,
            });
        }
        self.stores.buffers.get(dst)?;
        if !self.features().timestamps {
            self.recording(cmd)?;
            return Ok(());
        }
        let cb = self.recording(cmd)?;
        cb.ops.push(Cmd::ResolveTimestamps {
            first,
            count,
            dst,
            dst_offset,
        });
        Ok(())
    }

    /// Submit an ended command buffer; `fence` is signalled when the queue
    /// has drained every command in it.
    pub fn submit_command_buffer(
        &mut self,
        cmd: Handle<CommandBuffer>,
        fence: Handle<Fence>,
    ) -> GpuResult<()> {
        let submission = {
            let cb = self.stores.command_buffers.get(cmd)?;
            if cb.state != RecordState::Executable {
                return Err(GpuError::RecordState {
                    expected: "executable",
                });
            }
            if cb.device.upgrade().is_none() {
                return Err(GpuError::DeviceGone);
            }
            let encoded = encode(
                &self.raw,
                &self.stores,
                self.timestamp_pool.as_ref(),
                self.timestamp_resolve.as_ref(),
                cb,
            )?;
            self.queue.submit(Some(encoded))
        };
        self.stores.fences.get_mut(fence)?.submission = Some(submission);
        Ok(())
    }
}

/// Replay a recorded op list into a driver command buffer.
fn encode(
    raw: &wgpu::Device,
    stores: &Stores,
    query_set: Option<&wgpu::QuerySet>,
    timestamp_resolve: Option<&wgpu::Buffer>,
    cb: &CommandBuffer,
) -> GpuResult<wgpu::CommandBuffer> {
    let mut encoder = raw.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("gatling commands"),
    });

    let mut pipeline: Option<&Pipeline> = None;
    let mut bind_group: Option<&wgpu::BindGroup> = None;
    let mut push_data: Option<&[u8]> = None;

    for op in &cb.ops {
        match op {
            Cmd::BindPipeline(handle) => pipeline = Some(stores.pipelines.get(*handle)?),
            Cmd::SetBindGroup(group) => bind_group = Some(group),
            Cmd::PushConstants(data) => push_data = Some(data),
            Cmd::Dispatch { x, y, z } => {
                let pipeline = pipeline.ok_or(GpuError::NoPipelineBound)?;
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: None,
                    timestamp_writes: None,
                });
                pass.set_pipeline(&pipeline.pipeline);
                if let Some(group) = bind_group {
                    pass.set_bind_group(0, group, &[]);
                }
                if pipeline.push_constant_size > 0 {
                    let data = push_data.ok_or(GpuError::PushConstantSize {
                        pushed: 0,
                        reflected: pipeline.push_constant_size,
                    })?;
                    pass.set_push_constants(0, data);
                }
                pass.dispatch_workgroups(*x, *y, *z);
            }
            Cmd::CopyBuffer {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => {
                let src = stores.buffers.get(*src)?;
                let dst = stores.buffers.get(*dst)?;
                encoder.copy_buffer_to_buffer(&src.raw, *src_offset, &dst.raw, *dst_offset, *size);
            }
            Cmd::CopyBufferToImage {
                buffer,
                buffer_offset,
                image,
            } => {
                let buffer = stores.buffers.get(*buffer)?;
                let image = stores.images.get(*image)?;
                let desc = image.desc;
                encoder.copy_buffer_to_texture(
                    wgpu::ImageCopyBuffer {
                        buffer: &buffer.raw,
                        layout: wgpu::ImageDataLayout {
                            offset: *buffer_offset,
                            bytes_per_row: Some(desc.width * desc.format.bytes_per_texel()),
                            rows_per_image: Some(desc.height),
                        },
                    },
                    wgpu::ImageCopyTexture {
                        texture: &image.raw,
                        mip_level: 0,
                        origin: wgpu::Origin3d::ZERO,
                        aspect: wgpu::TextureAspect::All,
                    },
                    wgpu::Extent3d {
                        width: desc.width,
                        height: desc.height,
                        depth_or_array_layers: desc.depth,
                    },
                );
            }
            // Hazards between recorded ops are resolved by the driver's
            // usage tracking; the marker only fixes the record order.
            Cmd::Barrier => {}
            Cmd::WriteTimestamp { query } => {
                if let Some(query_set) = query_set {
                    encoder.write_timestamp(query_set, *query);
                }
            }
            Cmd::ResolveTimestamps {
                first,
                count,
                dst,
                dst_offset,
            } => {
                // Queries resolve into the device's scratch buffer, then
                // copy out; mappable destinations cannot take the resolve
                // directly.
                if let (Some(query_set), Some(scratch)) = (query_set, timestamp_resolve) {
                    let dst = stores.buffers.get(*dst)?;
                    encoder.resolve_query_set(query_set, *first..*first + *count, scratch, 0);
                    encoder.copy_buffer_to_buffer(
                        scratch,
                        0,
                        &dst.raw,
                        *dst_offset,
                        *count as u64 * 8,
                    );
                }
            }
        }
    }

    Ok(encoder.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::shader::{DescriptorKind, ImageViewDim, ReflectedBinding};

    fn binding(kind: DescriptorKind, read: bool, write: bool) -> ReflectedBinding {
        ReflectedBinding {
            binding: 0,
            count: 1,
            kind,
            read_access: read,
            write_access: write,
        }
    }

    #[test]
    fn test_sampled_image_requires_read_only_layout() {
        let b = binding(
            DescriptorKind::SampledImage {
                dim: ImageViewDim::D2,
            },
            true,
            false,
        );
        let (layout, access) = required_image_state(&b).unwrap();
        assert_eq!(layout, ImageLayout::ShaderReadOnly);
        assert_eq!(access, AccessFlags::SHADER_READ);
    }

    #[test]
    fn test_storage_image_requires_general_layout() {
        let b = binding(
            DescriptorKind::StorageImage {
                dim: ImageViewDim::D2,
                format: wgpu::TextureFormat::Rgba32Float,
            },
            true,
            true,
        );
        let (layout, access) = required_image_state(&b).unwrap();
        assert_eq!(layout, ImageLayout::General);
        assert!(access.contains(AccessFlags::SHADER_READ | AccessFlags::SHADER_WRITE));
    }

    #[test]
    fn test_buffers_need_no_layout() {
        let b = binding(DescriptorKind::StorageBuffer, true, true);
        assert!(required_image_state(&b).is_none());
    }
}
