//! Buffer, image and sampler resources with tracked state.
//!
//! The flag types mirror the driver-facing flags one-to-one; translation to
//! `wgpu` is a declarative mapping so the policy is auditable in one place.
//! Images additionally carry a tracked layout and access mask, mutated only
//! from command recording (see `commands.rs`), which is what makes implicit
//! pre-dispatch transitions possible.

use std::ops::BitOr;

/// Sentinel for "the rest of the buffer" in binding and copy ranges.
pub const WHOLE_SIZE: u64 = u64::MAX;

macro_rules! flag_type {
    ($(#[$doc:meta])* $name:ident { $($(#[$fdoc:meta])* $flag:ident = $bit:expr;)* }) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
        pub struct $name(pub u32);

        impl $name {
            pub const NONE: Self = Self(0);
            $($(#[$fdoc])* pub const $flag: Self = Self($bit);)*

            #[inline]
            pub fn contains(self, other: Self) -> bool {
                (self.0 & other.0) == other.0
            }

            #[inline]
            pub fn intersects(self, other: Self) -> bool {
                (self.0 & other.0) != 0
            }

            #[inline]
            pub fn is_empty(self) -> bool {
                self.0 == 0
            }
        }

        impl BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }
    };
}

flag_type! {
    /// What a buffer may be used for.
    BufferUsage {
        TRANSFER_SRC = 1 << 0;
        TRANSFER_DST = 1 << 1;
        STORAGE = 1 << 2;
        UNIFORM = 1 << 3;
    }
}

flag_type! {
    /// Where a buffer's memory lives and how the host may see it.
    MemoryProperties {
        DEVICE_LOCAL = 1 << 0;
        HOST_VISIBLE = 1 << 1;
        HOST_COHERENT = 1 << 2;
        HOST_CACHED = 1 << 3;
    }
}

flag_type! {
    /// What an image may be used for. Sampled-only images get optimal
    /// tiling from the driver; transfer usage decides the copy directions.
    ImageUsage {
        TRANSFER_SRC = 1 << 0;
        TRANSFER_DST = 1 << 1;
        SAMPLED = 1 << 2;
        STORAGE = 1 << 3;
    }
}

flag_type! {
    /// Memory access kinds, as recorded in barriers and tracked per image.
    AccessFlags {
        SHADER_READ = 1 << 0;
        SHADER_WRITE = 1 << 1;
        TRANSFER_READ = 1 << 2;
        TRANSFER_WRITE = 1 << 3;
        HOST_READ = 1 << 4;
        HOST_WRITE = 1 << 5;
    }
}

/// Tracked image layout. Shader access requires `ShaderReadOnly` (sampled)
/// or `General` (storage); command recording inserts the transitions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ImageLayout {
    #[default]
    Undefined,
    General,
    ShaderReadOnly,
    TransferSrc,
    TransferDst,
}

/// Texel formats the device layer supports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageFormat {
    R8Unorm,
    Rgba8Unorm,
    R32Float,
    Rgba32Float,
}

impl ImageFormat {
    pub fn bytes_per_texel(self) -> u32 {
        match self {
            ImageFormat::R8Unorm => 1,
            ImageFormat::Rgba8Unorm => 4,
            ImageFormat::R32Float => 4,
            ImageFormat::Rgba32Float => 16,
        }
    }

    pub(crate) fn to_wgpu(self) -> wgpu::TextureFormat {
        match self {
            ImageFormat::R8Unorm => wgpu::TextureFormat::R8Unorm,
            ImageFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
            ImageFormat::R32Float => wgpu::TextureFormat::R32Float,
            ImageFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
        }
    }
}

/// One-layer 2D (depth == 1) or 3D image description.
#[derive(Clone, Copy, Debug)]
pub struct ImageDesc {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub format: ImageFormat,
    pub usage: ImageUsage,
}

impl Default for ImageDesc {
    fn default() -> Self {
        Self {
            width: 1,
            height: 1,
            depth: 1,
            format: ImageFormat::Rgba8Unorm,
            usage: ImageUsage::SAMPLED | ImageUsage::TRANSFER_DST,
        }
    }
}

/// Per-axis sampler addressing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AddressMode {
    #[default]
    Repeat,
    MirrorRepeat,
    ClampToEdge,
    /// Samples outside [0, 1) read the border colour, which this device
    /// layer pins to transparent black.
    ClampToBlack,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SamplerDesc {
    pub address_u: AddressMode,
    pub address_v: AddressMode,
    pub address_w: AddressMode,
    pub linear_filtering: bool,
}

/// Declarative translation of usage and memory-property flags to the
/// backing driver's buffer usages. Host-visible memory is staging memory:
/// the transfer direction decides the one map mode the buffer gets, and
/// nothing else is combined with it - the driver only accepts a mappable
/// buffer as exactly `MAP_WRITE | COPY_SRC` (host writes, device reads)
/// or `MAP_READ | COPY_DST` (device writes, host reads).
pub(crate) fn translate_buffer_usage(
    usage: BufferUsage,
    memory: MemoryProperties,
) -> wgpu::BufferUsages {
    let mut out = wgpu::BufferUsages::empty();

    if memory.contains(MemoryProperties::HOST_VISIBLE) {
        if usage.contains(BufferUsage::TRANSFER_SRC) {
            out |= wgpu::BufferUsages::MAP_WRITE | wgpu::BufferUsages::COPY_SRC;
        }
        if usage.contains(BufferUsage::TRANSFER_DST) {
            out |= wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST;
        }
        return out;
    }

    if usage.contains(BufferUsage::TRANSFER_SRC) {
        out |= wgpu::BufferUsages::COPY_SRC;
    }
    if usage.contains(BufferUsage::TRANSFER_DST) {
        out |= wgpu::BufferUsages::COPY_DST;
    }
    if usage.contains(BufferUsage::STORAGE) {
        out |= wgpu::BufferUsages::STORAGE;
    }
    if usage.contains(BufferUsage::UNIFORM) {
        out |= wgpu::BufferUsages::UNIFORM;
    }
    out
}

pub(crate) fn translate_image_usage(usage: ImageUsage) -> wgpu::TextureUsages {
    let mut out = wgpu::TextureUsages::empty();
    if usage.contains(ImageUsage::TRANSFER_SRC) {
        out |= wgpu::TextureUsages::COPY_SRC;
    }
    if usage.contains(ImageUsage::TRANSFER_DST) {
        out |= wgpu::TextureUsages::COPY_DST;
    }
    if usage.contains(ImageUsage::SAMPLED) {
        out |= wgpu::TextureUsages::TEXTURE_BINDING;
    }
    if usage.contains(ImageUsage::STORAGE) {
        out |= wgpu::TextureUsages::STORAGE_BINDING;
    }
    out
}

/// Clamp-to-black policy: any axis clamping to the border forces the
/// transparent-black border colour.
pub(crate) fn needs_black_border(desc: &SamplerDesc) -> bool {
    [desc.address_u, desc.address_v, desc.address_w]
        .iter()
        .any(|m| *m == AddressMode::ClampToBlack)
}

pub(crate) fn translate_address_mode(mode: AddressMode) -> wgpu::AddressMode {
    match mode {
        AddressMode::Repeat => wgpu::AddressMode::Repeat,
        AddressMode::MirrorRepeat => wgpu::AddressMode::MirrorRepeat,
        AddressMode::ClampToEdge => wgpu::AddressMode::ClampToEdge,
        AddressMode::ClampToBlack => wgpu::AddressMode::ClampToBorder,
    }
}

/// A buffer and the creation state needed to validate later operations.
pub struct Buffer {
    pub(crate) raw: wgpu::Buffer,
    pub(crate) size: u64,
    pub(crate) usage: BufferUsage,
    pub(crate) memory: MemoryProperties,
    pub(crate) mapped: bool,
}

impl Buffer {
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    pub fn memory(&self) -> MemoryProperties {
        self.memory
    }
}

/// An image, its default view, and the tracked layout/access state.
pub struct Image {
    pub(crate) raw: wgpu::Texture,
    pub(crate) view: wgpu::TextureView,
    pub(crate) desc: ImageDesc,
    pub(crate) layout: ImageLayout,
    pub(crate) access: AccessFlags,
}

impl Image {
    pub fn desc(&self) -> &ImageDesc {
        &self.desc
    }

    /// Layout as of the last recorded command touching this image.
    pub fn layout(&self) -> ImageLayout {
        self.layout
    }

    /// Access mask as of the last recorded command touching this image.
    pub fn access(&self) -> AccessFlags {
        self.access
    }
}

pub struct Sampler {
    pub(crate) raw: wgpu::Sampler,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_usage_translation() {
        let usage = translate_buffer_usage(
            BufferUsage::STORAGE | BufferUsage::TRANSFER_DST,
            MemoryProperties::DEVICE_LOCAL,
        );
        assert!(usage.contains(wgpu::BufferUsages::STORAGE));
        assert!(usage.contains(wgpu::BufferUsages::COPY_DST));
        assert!(!usage.contains(wgpu::BufferUsages::MAP_READ));
    }

    #[test]
    fn test_host_visible_buffers_translate_to_legal_map_pairs() {
        // The driver accepts only these exact combinations for mappable
        // buffers; anything wider fails buffer creation.
        let upload = translate_buffer_usage(
            BufferUsage::TRANSFER_SRC,
            MemoryProperties::HOST_VISIBLE | MemoryProperties::HOST_COHERENT,
        );
        assert_eq!(
            upload,
            wgpu::BufferUsages::MAP_WRITE | wgpu::BufferUsages::COPY_SRC
        );

        let readback = translate_buffer_usage(
            BufferUsage::TRANSFER_DST,
            MemoryProperties::HOST_VISIBLE
                | MemoryProperties::HOST_COHERENT
                | MemoryProperties::HOST_CACHED,
        );
        assert_eq!(
            readback,
            wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST
        );
    }

    #[test]
    fn test_black_border_policy_is_per_axis() {
        let mut desc = SamplerDesc::default();
        assert!(!needs_black_border(&desc));
        desc.address_w = AddressMode::ClampToBlack;
        assert!(needs_black_border(&desc));
        desc.address_w = AddressMode::ClampToEdge;
        desc.address_u = AddressMode::ClampToBlack;
        assert!(needs_black_border(&desc));
    }

    #[test]
    fn test_flag_ops() {
        let f = AccessFlags::SHADER_READ | AccessFlags::SHADER_WRITE;
        assert!(f.contains(AccessFlags::SHADER_READ));
        assert!(f.intersects(AccessFlags::SHADER_WRITE));
        assert!(!f.contains(AccessFlags::TRANSFER_READ));
        assert!(AccessFlags::NONE.is_empty());
    }
}
