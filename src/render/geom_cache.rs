//! Geometry cache: scene baking, hierarchy construction and upload.
//!
//! Baking flattens every visible mesh instance into one face/vertex soup in
//! world space (positions by the instance transform, normals by its inverse
//! transpose). The soup runs through the build/collapse/compress pipeline
//! and the four resulting buffers are packed into a single device-local
//! storage buffer at offsets aligned to the device's storage-buffer
//! alignment, uploaded once through a staging buffer.

use glam::Vec3;

use super::RenderError;
use crate::bvh::builder::{self, BuildParams};
use crate::bvh::collapse::{self, CollapseParams};
use crate::bvh::compress;
use crate::bvh::Aabb;
use crate::gpu::{
    Buffer, BufferBarrier, BufferUsage, Device, Fence, Handle, MapMode, MemoryProperties,
    AccessFlags, WHOLE_SIZE,
};
use crate::scene::{safe_normalize, Face, Material, SceneRegistry, Vertex};

/// World-space face/vertex soup produced by a bake.
#[derive(Default)]
pub struct BakedGeometry {
    pub faces: Vec<Face>,
    pub vertices: Vec<Vertex>,
}

/// Flatten the registry's visible instances.
pub fn bake_instances(registry: &SceneRegistry) -> BakedGeometry {
    let mut baked = BakedGeometry::default();

    for instance in registry.visible_instances() {
        let transform = instance.transform;
        let normal_matrix = transform.matrix3.inverse().transpose();
        let vertex_offset = baked.vertices.len() as u32;

        for face in &instance.mesh.faces {
            baked.faces.push(Face {
                v: [
                    vertex_offset + face.v[0],
                    vertex_offset + face.v[1],
                    vertex_offset + face.v[2],
                ],
                mat_index: face.mat_index,
            });
        }

        for vertex in &instance.mesh.vertices {
            let pos = transform.transform_point3(Vec3::from(vertex.pos));
            let norm = safe_normalize(normal_matrix * Vec3::from(vertex.norm));
            baked.vertices.push(Vertex {
                pos: pos.to_array(),
                norm: norm.to_array(),
                uv: vertex.uv,
            });
        }
    }

    baked
}

/// Offset/size of one buffer inside the packed scene buffer.
#[derive(Clone, Copy, Debug, Default)]
pub struct BufferSpan {
    pub offset: u64,
    pub size: u64,
}

fn align_to(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

/// GPU-resident scene geometry derived from a vector of mesh instances.
pub struct GeometryCache {
    pub scene_buffer: Handle<Buffer>,
    pub nodes: BufferSpan,
    pub faces: BufferSpan,
    pub vertices: BufferSpan,
    pub materials: BufferSpan,
    pub node_count: u32,
    pub aabb: Aabb,
}

impl GeometryCache {
    /// Bake, build the hierarchy and upload. Fails without touching the
    /// device if the scene is too small to traverse.
    pub fn build(
        device: &mut Device,
        registry: &SceneRegistry,
        build_params: &BuildParams,
    ) -> Result<Self, RenderError> {
        let baked = bake_instances(registry);
        if baked.faces.len() < 4 {
            return Err(RenderError::TooFewFaces(baked.faces.len()));
        }

        let binary = builder::build(build_params, &baked.faces, &baked.vertices)?;
        let wide = collapse::collapse(&CollapseParams::default(), binary)?;
        let compressed = compress::compress(wide);

        log::info!(
            "geometry cache: {} faces, {} vertices, {} nodes",
            compressed.faces.len(),
            baked.vertices.len(),
            compressed.nodes.len()
        );

        Ok(Self::upload(
            device,
            &compressed.nodes,
            &compressed.faces,
            &baked.vertices,
            registry.materials(),
            compressed.aabb,
        )?)
    }

    /// Pack the four buffers at aligned offsets and copy them into a
    /// device-local storage buffer.
    pub fn upload(
        device: &mut Device,
        nodes: &[crate::bvh::compress::CwbvhNode],
        faces: &[Face],
        vertices: &[Vertex],
        materials: &[Material],
        aabb: Aabb,
    ) -> Result<Self, crate::gpu::GpuError> {
        let alignment = device.limits().min_storage_buffer_offset_alignment;

        let node_bytes: &[u8] = bytemuck::cast_slice(nodes);
        let face_bytes: &[u8] = bytemuck::cast_slice(faces);
        let vertex_bytes: &[u8] = bytemuck::cast_slice(vertices);
        // An empty material table still needs a non-empty binding.
        let default_material = [Material::diffuse(0.18, 0.18, 0.18)];
        let material_bytes: &[u8] = if materials.is_empty() {
            bytemuck::cast_slice(&default_material)
        } else {
            bytemuck::cast_slice(materials)
        };

        let mut total = 0u64;
        let mut place = |bytes: &[u8]| {
            let offset = align_to(total, alignment);
            total = offset + bytes.len() as u64;
            BufferSpan {
                offset,
                size: bytes.len() as u64,
            }
        };
        let node_span = place(node_bytes);
        let face_span = place(face_bytes);
        let vertex_span = place(vertex_bytes);
        let material_span = place(material_bytes);

        let staging = device.create_buffer(
            BufferUsage::TRANSFER_SRC,
            MemoryProperties::HOST_VISIBLE | MemoryProperties::HOST_COHERENT,
            total,
        )?;
        let scene_buffer = device.create_buffer(
            BufferUsage::STORAGE | BufferUsage::TRANSFER_DST,
            MemoryProperties::DEVICE_LOCAL,
            total,
        )?;

        device.map_buffer(staging, MapMode::Write)?;
        {
            let mut mapped = device.mapped_range_mut(staging, 0, total)?;
            for (span, bytes) in [
                (node_span, node_bytes),
                (face_span, face_bytes),
                (vertex_span, vertex_bytes),
                (material_span, material_bytes),
            ] {
                mapped[span.offset as usize..(span.offset + span.size) as usize]
                    .copy_from_slice(bytes);
            }
        }
        device.unmap_buffer(staging)?;

        let cmd = device.create_command_buffer()?;
        device.begin_commands(cmd)?;
        device.cmd_copy_buffer(cmd, staging, 0, scene_buffer, 0, WHOLE_SIZE)?;
        device.cmd_pipeline_barrier(
            cmd,
            &[BufferBarrier {
                buffer: scene_buffer,
                src_access: AccessFlags::TRANSFER_WRITE,
                dst_access: AccessFlags::SHADER_READ,
                offset: 0,
                size: WHOLE_SIZE,
            }],
            &[],
        )?;
        device.end_commands(cmd)?;

        let fence: Handle<Fence> = device.create_fence()?;
        device.submit_command_buffer(cmd, fence)?;
        device.wait_for_fence(fence)?;

        device.destroy_fence(fence)?;
        device.destroy_command_buffer(cmd)?;
        device.destroy_buffer(staging)?;

        Ok(Self {
            scene_buffer,
            nodes: node_span,
            faces: face_span,
            vertices: vertex_span,
            materials: material_span,
            node_count: nodes.len() as u32,
            aabb,
        })
    }

    pub fn destroy(self, device: &mut Device) {
        let _ = device.destroy_buffer(self.scene_buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Affine3A;
    use std::sync::Arc;

    #[test]
    fn test_bake_applies_transforms_and_offsets() {
        let mesh = Arc::new(crate::scene::Mesh {
            faces: vec![Face { v: [0, 1, 2], mat_index: 3 }],
            vertices: vec![
                Vertex { pos: [0.0, 0.0, 0.0], norm: [0.0, 1.0, 0.0], uv: [0.0, 0.0] },
                Vertex { pos: [1.0, 0.0, 0.0], norm: [0.0, 1.0, 0.0], uv: [0.0, 0.0] },
                Vertex { pos: [0.0, 0.0, 1.0], norm: [0.0, 1.0, 0.0], uv: [0.0, 0.0] },
            ],
        });

        let mut registry = SceneRegistry::new();
        registry.add_instance(mesh.clone(), Affine3A::IDENTITY);
        registry.add_instance(mesh, Affine3A::from_translation(Vec3::new(10.0, 0.0, 0.0)));

        let baked = bake_instances(&registry);
        assert_eq!(baked.faces.len(), 2);
        assert_eq!(baked.vertices.len(), 6);

        // Second instance indexes its own vertex block.
        assert_eq!(baked.faces[1].v, [3, 4, 5]);
        assert_eq!(baked.faces[1].mat_index, 3);
        assert_eq!(baked.vertices[4].pos, [11.0, 0.0, 0.0]);
    }

    #[test]
    fn test_bake_skips_hidden_instances() {
        let mesh = Arc::new(crate::scene::Mesh {
            faces: vec![Face { v: [0, 0, 0], mat_index: 0 }],
            vertices: vec![Vertex::default()],
        });
        let mut registry = SceneRegistry::new();
        let idx = registry.add_instance(mesh, Affine3A::IDENTITY);
        registry.set_visible(idx, false);
        assert!(bake_instances(&registry).faces.is_empty());
    }

    #[test]
    fn test_nonuniform_scale_fixes_normals() {
        let mesh = Arc::new(crate::scene::Mesh {
            faces: vec![Face { v: [0, 0, 0], mat_index: 0 }],
            vertices: vec![Vertex {
                pos: [0.0, 0.0, 0.0],
                // 45 degrees between +x and +y.
                norm: [std::f32::consts::FRAC_1_SQRT_2, std::f32::consts::FRAC_1_SQRT_2, 0.0],
                uv: [0.0, 0.0],
            }],
        });
        let mut registry = SceneRegistry::new();
        registry.add_instance(
            mesh,
            Affine3A::from_scale(Vec3::new(4.0, 1.0, 1.0)),
        );
        let baked = bake_instances(&registry);

        let n = Vec3::from(baked.vertices[0].norm);
        assert!((n.length() - 1.0).abs() < 1e-6);
        // Squashing in x tilts the normal toward y.
        assert!(n.y > n.x);
    }

    #[test]
    fn test_alignment_packing() {
        assert_eq!(align_to(0, 256), 0);
        assert_eq!(align_to(1, 256), 256);
        assert_eq!(align_to(256, 256), 256);
        assert_eq!(align_to(257, 64), 320);
    }
}
