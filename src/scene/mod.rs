//! Scene data model, registry and on-disk serialisation.
//!
//! The POD types here are shared verbatim between the preprocessor, the
//! on-disk scene file, the GPU buffers and the CPU traversal tests; their
//! layouts are load-bearing and pinned by tests.

pub mod reader;
pub mod writer;

use std::path::PathBuf;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::{Affine3A, Vec3};
use thiserror::Error;

use crate::bvh::compress::CwbvhNode;
use crate::bvh::Aabb;

#[derive(Debug, Error)]
pub enum SceneError {
    #[error("failed to {op} '{path}': {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },

    /// The file is too short to contain the fixed header.
    #[error("not a scene file: shorter than the {0}-byte header")]
    TruncatedHeader(u64),

    /// A buffer's offset or size points beyond the end of the file.
    #[error("{buffer} buffer range {offset}+{size} exceeds file length {file_size}")]
    BufferOutOfBounds {
        buffer: &'static str,
        offset: u64,
        size: u64,
        file_size: u64,
    },

    /// A buffer's size is not a multiple of its element stride.
    #[error("{buffer} buffer size {size} is not a multiple of {stride}")]
    MisalignedBuffer {
        buffer: &'static str,
        size: u64,
        stride: u64,
    },

    /// The scene contains no traversable hierarchy.
    #[error("scene file contains no nodes")]
    NoNodes,
}

/// 32-byte vertex: position, unit normal, texture coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct Vertex {
    pub pos: [f32; 3],
    pub norm: [f32; 3],
    pub uv: [f32; 2],
}

/// 16-byte face: three vertex indices and a material index.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct Face {
    pub v: [u32; 3],
    pub mat_index: u32,
}

impl Face {
    /// Two or more coincident indices make the triangle degenerate.
    pub fn is_degenerate(&self) -> bool {
        self.v[0] == self.v[1] || self.v[1] == self.v[2] || self.v[0] == self.v[2]
    }
}

/// 32-byte material: base colour and emission, padded to GPU alignment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct Material {
    pub albedo: [f32; 3],
    pub padding1: f32,
    pub emission: [f32; 3],
    pub padding2: f32,
}

impl Material {
    pub fn diffuse(r: f32, g: f32, b: f32) -> Self {
        Self {
            albedo: [r, g, b],
            ..Default::default()
        }
    }

    /// Emissive materials are importance-sampled; any positive channel counts.
    pub fn is_emissive(&self) -> bool {
        self.emission.iter().any(|c| *c > 0.0)
    }
}

/// Camera record stored in the scene-file header.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct Camera {
    pub origin: [f32; 3],
    pub forward: [f32; 3],
    pub up: [f32; 3],
    pub hfov: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            origin: [0.0; 3],
            forward: [0.0, 0.0, 1.0],
            up: [0.0, 1.0, 0.0],
            hfov: std::f32::consts::FRAC_PI_2,
        }
    }
}

/// A fully preprocessed scene, ready to be written to disk or uploaded.
#[derive(Debug)]
pub struct SceneData {
    pub image_width: u32,
    pub image_height: u32,
    pub aabb: Aabb,
    pub camera: Camera,
    pub nodes: Vec<CwbvhNode>,
    pub faces: Vec<Face>,
    pub vertices: Vec<Vertex>,
    pub materials: Vec<Material>,
}

/// Triangle mesh with its per-face material assignment baked in.
#[derive(Clone, Debug, Default)]
pub struct Mesh {
    pub faces: Vec<Face>,
    pub vertices: Vec<Vertex>,
}

/// One placement of a mesh in the scene.
#[derive(Clone)]
pub struct MeshInstance {
    pub mesh: Arc<Mesh>,
    pub transform: Affine3A,
}

/// Camera state as authored in the scene graph: a world transform plus the
/// physical parameters the vertical field of view derives from.
#[derive(Clone, Copy, Debug)]
pub struct CameraState {
    pub transform: Affine3A,
    /// Vertical aperture, in the same unit as `focal_length`.
    pub aperture: f32,
    pub focal_length: f32,
}

impl Default for CameraState {
    fn default() -> Self {
        Self {
            transform: Affine3A::IDENTITY,
            aperture: 20.25,
            focal_length: 50.0,
        }
    }
}

/// Monotonic change counters observed by the render pass each frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChangeVersions {
    pub scene_state: u32,
    pub sprim_index: u32,
    pub render_settings: u32,
    pub visibility: u32,
}

struct RegistryEntry {
    instance: MeshInstance,
    visible: bool,
}

/// The live scene a render pass draws from: mesh instances, materials and a
/// camera, with change-version counters bumped on every mutation so the
/// renderer can invalidate exactly the caches a change touches.
#[derive(Default)]
pub struct SceneRegistry {
    entries: Vec<RegistryEntry>,
    materials: Vec<Material>,
    camera: CameraState,
    versions: ChangeVersions,
}

impl SceneRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn versions(&self) -> ChangeVersions {
        self.versions
    }

    pub fn add_instance(&mut self, mesh: Arc<Mesh>, transform: Affine3A) -> usize {
        self.entries.push(RegistryEntry {
            instance: MeshInstance { mesh, transform },
            visible: true,
        });
        self.versions.scene_state += 1;
        self.entries.len() - 1
    }

    pub fn set_transform(&mut self, index: usize, transform: Affine3A) {
        self.entries[index].instance.transform = transform;
        self.versions.scene_state += 1;
    }

    pub fn set_visible(&mut self, index: usize, visible: bool) {
        if self.entries[index].visible != visible {
            self.entries[index].visible = visible;
            self.versions.visibility += 1;
            self.versions.scene_state += 1;
        }
    }

    /// Replace the material table. Materials are scene-level prims, so this
    /// bumps the sprim counter alongside the scene state.
    pub fn set_materials(&mut self, materials: Vec<Material>) {
        self.materials = materials;
        self.versions.sprim_index += 1;
        self.versions.scene_state += 1;
    }

    pub fn materials(&self) -> &[Material] {
        &self.materials
    }

    pub fn set_camera(&mut self, camera: CameraState) {
        self.camera = camera;
        self.versions.scene_state += 1;
    }

    pub fn camera(&self) -> &CameraState {
        &self.camera
    }

    /// Called by the renderer when a render setting changes.
    pub fn bump_render_settings(&mut self) {
        self.versions.render_settings += 1;
    }

    /// Visible instances, in authoring order.
    pub fn visible_instances(&self) -> impl Iterator<Item = &MeshInstance> {
        self.entries
            .iter()
            .filter(|e| e.visible)
            .map(|e| &e.instance)
    }
}

/// Build a unit-length normal, falling back to +Y for null input.
pub fn safe_normalize(v: Vec3) -> Vec3 {
    let len = v.length();
    if len > 1e-20 {
        v / len
    } else {
        Vec3::Y
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pod_layout_sizes() {
        assert_eq!(std::mem::size_of::<Vertex>(), 32);
        assert_eq!(std::mem::size_of::<Face>(), 16);
        assert_eq!(std::mem::size_of::<Material>(), 32);
        assert_eq!(std::mem::size_of::<Camera>(), 40);
    }

    #[test]
    fn test_face_degeneracy() {
        let ok = Face {
            v: [0, 1, 2],
            mat_index: 0,
        };
        assert!(!ok.is_degenerate());
        for v in [[0, 0, 2], [0, 1, 1], [2, 1, 2]] {
            assert!(Face { v, mat_index: 0 }.is_degenerate());
        }
    }

    #[test]
    fn test_material_emissive_flag() {
        assert!(!Material::diffuse(0.5, 0.5, 0.5).is_emissive());
        let mut m = Material::default();
        m.emission[1] = 0.01;
        assert!(m.is_emissive());
    }

    #[test]
    fn test_registry_version_bumps() {
        let mut registry = SceneRegistry::new();
        let before = registry.versions();

        let mesh = Arc::new(Mesh::default());
        let idx = registry.add_instance(mesh, Affine3A::IDENTITY);
        assert_ne!(registry.versions().scene_state, before.scene_state);
        assert_eq!(registry.versions().visibility, before.visibility);

        registry.set_visible(idx, false);
        assert_ne!(registry.versions().visibility, before.visibility);

        // Hiding an already-hidden mesh is not a change.
        let mid = registry.versions();
        registry.set_visible(idx, false);
        assert_eq!(registry.versions(), mid);

        registry.set_materials(vec![Material::diffuse(0.18, 0.18, 0.18)]);
        assert_ne!(registry.versions().sprim_index, mid.sprim_index);
    }
}
