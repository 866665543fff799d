//! Compute-device abstraction.
//!
//! Everything the renderer asks of the GPU goes through [`Device`]:
//! resource creation behind versioned typed handles, command recording with
//! implicit image-layout management, submission and fences, and host
//! mapping. The module is backend-agnostic at the API surface; the
//! implementation drives `wgpu`.

mod commands;
mod device;
mod error;
mod handles;
mod pipeline;
mod resources;
mod shader;

pub use commands::{
    BufferBarrier, BufferBindingSlot, Bindings, CommandBuffer, ImageBarrier, ImageBindingSlot,
    SamplerBindingSlot,
};
pub use device::{
    Device, DeviceFeatures, DeviceLimits, Fence, MapMode, MAX_BARRIERS, MAX_WRITE_DESCRIPTORS,
    TIMESTAMP_QUERY_COUNT,
};
pub use error::{GpuError, GpuResult};
pub use handles::{Handle, ResourceStore};
pub use pipeline::Pipeline;
pub use resources::{
    AccessFlags, AddressMode, Buffer, BufferUsage, Image, ImageDesc, ImageFormat, ImageLayout,
    ImageUsage, MemoryProperties, Sampler, SamplerDesc, WHOLE_SIZE,
};
pub use shader::{
    DescriptorKind, ImageViewDim, ReflectedBinding, Shader, ShaderReflection, ShaderSource,
};
