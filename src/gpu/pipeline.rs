//! Compute pipelines built from reflected shader interfaces.

use std::num::NonZeroU32;

use super::error::GpuResult;
use super::shader::{DescriptorKind, ImageViewDim, ReflectedBinding, Shader};

/// A compute pipeline and the objects it owns: the descriptor-set layout,
/// the pipeline layout, and the reflected binding table driving descriptor
/// updates. The layouts are kept on the struct so their lifetime matches the
/// pipeline's, mirroring the ownership rules of the driver objects they wrap.
pub struct Pipeline {
    pub(crate) pipeline: wgpu::ComputePipeline,
    #[allow(dead_code)] // held for ownership; the driver references it internally
    pub(crate) layout: wgpu::PipelineLayout,
    pub(crate) bind_layout: wgpu::BindGroupLayout,
    /// Sorted by binding slot (inherited from reflection).
    pub(crate) bindings: Vec<ReflectedBinding>,
    pub(crate) push_constant_size: u32,
    pub(crate) workgroup_size: [u32; 3],
}

impl Pipeline {
    pub fn workgroup_size(&self) -> [u32; 3] {
        self.workgroup_size
    }

    pub fn push_constant_size(&self) -> u32 {
        self.push_constant_size
    }

    pub fn bindings(&self) -> &[ReflectedBinding] {
        &self.bindings
    }
}

fn view_dimension(dim: ImageViewDim) -> wgpu::TextureViewDimension {
    match dim {
        ImageViewDim::D2 => wgpu::TextureViewDimension::D2,
        ImageViewDim::D3 => wgpu::TextureViewDimension::D3,
    }
}

fn layout_entry(binding: &ReflectedBinding) -> wgpu::BindGroupLayoutEntry {
    let ty = match binding.kind {
        DescriptorKind::StorageBuffer => wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage {
                read_only: !binding.write_access,
            },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        DescriptorKind::UniformBuffer => wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        DescriptorKind::SampledImage { dim } => wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: true },
            view_dimension: view_dimension(dim),
            multisampled: false,
        },
        DescriptorKind::StorageImage { dim, format } => wgpu::BindingType::StorageTexture {
            access: match (binding.read_access, binding.write_access) {
                (true, true) => wgpu::StorageTextureAccess::ReadWrite,
                (false, true) => wgpu::StorageTextureAccess::WriteOnly,
                _ => wgpu::StorageTextureAccess::ReadOnly,
            },
            format,
            view_dimension: view_dimension(dim),
        },
        DescriptorKind::Sampler => {
            wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering)
        }
    };

    wgpu::BindGroupLayoutEntry {
        binding: binding.binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty,
        count: (binding.count > 1).then(|| NonZeroU32::new(binding.count).unwrap()),
    }
}

/// Build a pipeline for a reflected compute shader.
pub(crate) fn create_pipeline(
    device: &wgpu::Device,
    shader: &Shader,
    label: &str,
) -> GpuResult<Pipeline> {
    let reflection = &shader.reflection;

    let entries: Vec<wgpu::BindGroupLayoutEntry> =
        reflection.bindings.iter().map(layout_entry).collect();

    let bind_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some(&format!("{} Bind Group Layout", label)),
        entries: &entries,
    });

    let push_constant_ranges = if reflection.push_constant_size > 0 {
        vec![wgpu::PushConstantRange {
            stages: wgpu::ShaderStages::COMPUTE,
            range: 0..reflection.push_constant_size,
        }]
    } else {
        Vec::new()
    };

    let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(&format!("{} Pipeline Layout", label)),
        bind_group_layouts: &[&bind_layout],
        push_constant_ranges: &push_constant_ranges,
    });

    let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(&format!("{} Pipeline", label)),
        layout: Some(&layout),
        module: &shader.module,
        entry_point: Some(&reflection.entry_point),
        compilation_options: Default::default(),
        cache: None,
    });

    Ok(Pipeline {
        pipeline,
        layout,
        bind_layout,
        bindings: reflection.bindings.clone(),
        push_constant_size: reflection.push_constant_size,
        workgroup_size: reflection.workgroup_size,
    })
}
