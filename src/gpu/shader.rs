//! Shader modules and binding reflection.
//!
//! Pipelines derive their descriptor layouts from the shader itself rather
//! than from caller-supplied tables: the module is parsed into naga IR and
//! every resource global becomes a [`ReflectedBinding`]. The reflected list
//! is kept sorted by binding slot so descriptor updates can run as a merge
//! walk instead of a quadratic scan.

use super::error::{GpuError, GpuResult};

/// Shader source accepted by the device: WGSL text (the in-tree kernels) or
/// a SPIR-V word stream (the material compiler's output).
pub enum ShaderSource<'a> {
    Wgsl(&'a str),
    SpirV(&'a [u32]),
}

/// Descriptor kind of a reflected binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescriptorKind {
    StorageBuffer,
    UniformBuffer,
    SampledImage {
        dim: ImageViewDim,
    },
    StorageImage {
        dim: ImageViewDim,
        format: wgpu::TextureFormat,
    },
    Sampler,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageViewDim {
    D2,
    D3,
}

/// One binding slot as declared by the shader.
#[derive(Clone, Copy, Debug)]
pub struct ReflectedBinding {
    pub binding: u32,
    pub count: u32,
    pub kind: DescriptorKind,
    pub read_access: bool,
    pub write_access: bool,
}

/// Everything a pipeline needs to know about a shader module.
pub struct ShaderReflection {
    /// Sorted by ascending binding slot.
    pub bindings: Vec<ReflectedBinding>,
    /// Size of the push-constant block, zero if the shader declares none.
    pub push_constant_size: u32,
    pub workgroup_size: [u32; 3],
    pub entry_point: String,
}

/// A compiled shader module plus its reflection.
pub struct Shader {
    pub(crate) module: wgpu::ShaderModule,
    pub(crate) reflection: ShaderReflection,
}

impl Shader {
    pub fn reflection(&self) -> &ShaderReflection {
        &self.reflection
    }
}

/// Parse a source into naga IR. Shared by reflection and (for SPIR-V input)
/// revalidation before handing the words to the driver.
pub(crate) fn parse_ir(source: &ShaderSource) -> GpuResult<naga::Module> {
    match source {
        ShaderSource::Wgsl(text) => naga::front::wgsl::parse_str(text)
            .map_err(|e| GpuError::Reflection(e.message().to_string())),
        ShaderSource::SpirV(words) => {
            let options = naga::front::spv::Options::default();
            naga::front::spv::Frontend::new(words.iter().cloned(), &options)
                .parse()
                .map_err(|e| GpuError::Reflection(e.to_string()))
        }
    }
}

fn map_view_dim(dim: naga::ImageDimension) -> GpuResult<ImageViewDim> {
    match dim {
        naga::ImageDimension::D2 => Ok(ImageViewDim::D2),
        naga::ImageDimension::D3 => Ok(ImageViewDim::D3),
        other => Err(GpuError::Reflection(format!(
            "unsupported image dimension {other:?}"
        ))),
    }
}

fn map_storage_format(format: naga::StorageFormat) -> GpuResult<wgpu::TextureFormat> {
    use naga::StorageFormat as Sf;
    Ok(match format {
        Sf::R8Unorm => wgpu::TextureFormat::R8Unorm,
        Sf::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        Sf::R32Float => wgpu::TextureFormat::R32Float,
        Sf::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
        other => {
            return Err(GpuError::Reflection(format!(
                "unsupported storage texel format {other:?}"
            )))
        }
    })
}

/// Reflect the binding interface of a module.
pub(crate) fn reflect(module: &naga::Module) -> GpuResult<ShaderReflection> {
    let entry = module
        .entry_points
        .iter()
        .find(|ep| ep.stage == naga::ShaderStage::Compute)
        .ok_or_else(|| GpuError::Reflection("module has no compute entry point".into()))?;

    let mut bindings = Vec::new();
    let mut push_constant_size = 0u32;

    for (_, var) in module.global_variables.iter() {
        let ty = &module.types[var.ty];

        if var.space == naga::AddressSpace::PushConstant {
            push_constant_size = ty.inner.size(module.to_ctx());
            continue;
        }

        let Some(res) = &var.binding else { continue };
        if res.group != 0 {
            return Err(GpuError::Reflection(format!(
                "binding {} uses descriptor set {}; only set 0 is supported",
                res.binding, res.group
            )));
        }

        // Binding arrays carry their element count in the type; everything
        // else is a single descriptor.
        let (inner, count) = match &ty.inner {
            naga::TypeInner::BindingArray { base, size } => {
                let count = match size {
                    naga::ArraySize::Constant(n) => n.get(),
                    _ => {
                        return Err(GpuError::Reflection(
                            "dynamically sized binding arrays are not supported".into(),
                        ))
                    }
                };
                (&module.types[*base].inner, count)
            }
            inner => (inner, 1),
        };

        let (kind, read_access, write_access) = match (var.space, inner) {
            (naga::AddressSpace::Storage { access }, _) => (
                DescriptorKind::StorageBuffer,
                access.contains(naga::StorageAccess::LOAD),
                access.contains(naga::StorageAccess::STORE),
            ),
            (naga::AddressSpace::Uniform, _) => (DescriptorKind::UniformBuffer, true, false),
            (naga::AddressSpace::Handle, naga::TypeInner::Image { dim, class, .. }) => {
                match class {
                    naga::ImageClass::Sampled { .. } => (
                        DescriptorKind::SampledImage {
                            dim: map_view_dim(*dim)?,
                        },
                        true,
                        false,
                    ),
                    naga::ImageClass::Storage { format, access } => (
                        DescriptorKind::StorageImage {
                            dim: map_view_dim(*dim)?,
                            format: map_storage_format(*format)?,
                        },
                        access.contains(naga::StorageAccess::LOAD),
                        access.contains(naga::StorageAccess::STORE),
                    ),
                    naga::ImageClass::Depth { .. } => {
                        return Err(GpuError::Reflection(
                            "depth images are not supported".into(),
                        ))
                    }
                }
            }
            (naga::AddressSpace::Handle, naga::TypeInner::Sampler { .. }) => {
                (DescriptorKind::Sampler, true, false)
            }
            _ => continue,
        };

        bindings.push(ReflectedBinding {
            binding: res.binding,
            count,
            kind,
            read_access,
            write_access,
        });
    }

    bindings.sort_by_key(|b| b.binding);

    Ok(ShaderReflection {
        bindings,
        push_constant_size,
        workgroup_size: entry.workgroup_size,
        entry_point: entry.name.clone(),
    })
}

/// Validate a parsed module. The driver validates again on module creation,
/// but failing here gives a reflection-stage error with a readable message.
pub(crate) fn validate(module: &naga::Module) -> GpuResult<()> {
    let mut validator = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    );
    validator
        .validate(module)
        .map(|_| ())
        .map_err(|e| GpuError::Reflection(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KERNEL: &str = r#"
        struct Push { frame: u32, pad0: u32, pad1: u32, pad2: u32 }
        var<push_constant> pc: Push;

        @group(0) @binding(0) var<storage, read_write> pixels: array<vec4f>;
        @group(0) @binding(1) var<storage, read> nodes: array<vec4u>;
        @group(0) @binding(2) var env: texture_2d<f32>;
        @group(0) @binding(3) var env_sampler: sampler;
        @group(0) @binding(4) var accum: texture_storage_2d<rgba32float, read_write>;

        @compute @workgroup_size(8, 4, 1)
        fn main(@builtin(global_invocation_id) gid: vec3u) {
            let v = nodes[0].x + pc.frame;
            pixels[gid.x] = vec4f(f32(v));
            let c = textureSampleLevel(env, env_sampler, vec2f(0.5), 0.0);
            textureStore(accum, vec2i(0), c);
        }
    "#;

    #[test]
    fn test_reflect_bindings_sorted_and_typed() {
        let module = parse_ir(&ShaderSource::Wgsl(KERNEL)).unwrap();
        validate(&module).unwrap();
        let refl = reflect(&module).unwrap();

        assert_eq!(refl.entry_point, "main");
        assert_eq!(refl.workgroup_size, [8, 4, 1]);
        assert_eq!(refl.push_constant_size, 16);

        let slots: Vec<u32> = refl.bindings.iter().map(|b| b.binding).collect();
        assert_eq!(slots, vec![0, 1, 2, 3, 4]);

        assert_eq!(refl.bindings[0].kind, DescriptorKind::StorageBuffer);
        assert!(refl.bindings[0].write_access);
        assert_eq!(refl.bindings[1].kind, DescriptorKind::StorageBuffer);
        assert!(!refl.bindings[1].write_access);
        assert!(matches!(
            refl.bindings[2].kind,
            DescriptorKind::SampledImage { dim: ImageViewDim::D2 }
        ));
        assert_eq!(refl.bindings[3].kind, DescriptorKind::Sampler);
        assert!(matches!(
            refl.bindings[4].kind,
            DescriptorKind::StorageImage { .. }
        ));
        assert!(refl.bindings[4].write_access);
    }
}
