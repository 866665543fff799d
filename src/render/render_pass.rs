//! Per-frame orchestration.
//!
//! Each frame starts by reading the registry's four change-version counters.
//! Any difference from the previous frame invalidates the progressive
//! accumulation state, which the very next dispatch observes through a
//! reset frame index. Cache rebuilds follow: the shader cache is keyed, so
//! an unchanged configuration is a lookup; the geometry cache is rebuilt on
//! scene or visibility changes. A rebuild failure surfaces with the stage it
//! happened in and leaves the caches from the previous frame serving.

use bytemuck::{Pod, Zeroable};
use glam::Vec3;

use super::geom_cache::GeometryCache;
use super::material::{KernelConstants, MaterialCompiler};
use super::shader_cache::ShaderCache;
use super::{gamma, RenderError, RenderSettings, RenderStage};
use crate::bvh::builder::BuildParams;
use crate::gpu::{
    Buffer, BufferBindingSlot, BufferUsage, Bindings, Device, Handle, MapMode, MemoryProperties,
};
use crate::scene::{CameraState, ChangeVersions, SceneRegistry};
use crate::trace::traversal_stack_bound;

/// Push-constant block; layout mirrors the kernel's declaration.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct PushConstants {
    /// xyz camera origin, w vertical field of view (radians).
    pub cam_origin: [f32; 4],
    /// xyz camera forward, w focus distance.
    pub cam_forward: [f32; 4],
    /// xyz camera up, w aperture radius.
    pub cam_up: [f32; 4],
    pub background: [f32; 4],
    pub image_size: [u32; 2],
    pub spp: u32,
    pub max_bounces: u32,
    pub rr_bounce_offset: u32,
    pub rr_inv_min_term_prob: f32,
    pub max_sample_value: f32,
    pub frame_index: u32,
    pub dome_light: u32,
    pub _pad: [u32; 3],
}

/// Camera values the kernel consumes, derived from the authored transform.
#[derive(Clone, Copy, Debug)]
pub struct ResolvedCamera {
    pub position: Vec3,
    pub forward: Vec3,
    pub up: Vec3,
    pub vfov: f32,
}

/// Derive the kernel camera: transform the canonical frame through the
/// camera's world transform and compute the vertical field of view from
/// aperture and focal length.
pub fn resolve_camera(state: &CameraState) -> ResolvedCamera {
    let position = state.transform.transform_point3(Vec3::ZERO);
    let forward = state.transform.transform_vector3(-Vec3::Z).normalize_or(-Vec3::Z);
    let up = state.transform.transform_vector3(Vec3::Y).normalize_or(Vec3::Y);
    let vfov = 2.0 * (state.aperture / (2.0 * state.focal_length)).atan();

    ResolvedCamera {
        position,
        forward,
        up,
        vfov,
    }
}

/// What the version counters demand this frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FramePlan {
    pub invalidate_accumulation: bool,
    pub rebuild_geometry: bool,
}

/// Pure invalidation decision, kept separate so it can be pinned by tests.
pub fn plan_frame(last: Option<ChangeVersions>, now: ChangeVersions) -> FramePlan {
    let Some(last) = last else {
        return FramePlan {
            invalidate_accumulation: true,
            rebuild_geometry: true,
        };
    };

    let scene_changed = now.scene_state != last.scene_state;
    let settings_changed = now.render_settings != last.render_settings;
    let visibility_changed = now.visibility != last.visibility;
    let sprim_changed = now.sprim_index != last.sprim_index;

    FramePlan {
        invalidate_accumulation: scene_changed
            || settings_changed
            || visibility_changed
            || sprim_changed,
        rebuild_geometry: scene_changed || visibility_changed,
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RenderPassState {
    #[default]
    Idle,
    Invalidating,
    RebuildingShader,
    RebuildingGeometry,
    Dispatched,
    Resolved,
}

/// Kernel binding slots; fixed so descriptor layouts survive material
/// permutations.
mod binding {
    pub const OUTPUT_PIXELS: u32 = 0;
    pub const PATH_QUEUE: u32 = 1;
    pub const NODES: u32 = 2;
    pub const FACES: u32 = 3;
    pub const VERTICES: u32 = 4;
    pub const MATERIALS: u32 = 5;
    pub const HIT_QUEUE: u32 = 6;
}

/// Per-resolution device buffers.
struct FrameResources {
    width: u32,
    height: u32,
    output: Handle<Buffer>,
    readback: Handle<Buffer>,
    path_queue: Handle<Buffer>,
    hit_queue: Handle<Buffer>,
}

impl FrameResources {
    fn create(device: &mut Device, width: u32, height: u32) -> Result<Self, RenderError> {
        let pixel_count = width as u64 * height as u64;
        let output_size = pixel_count * 16;
        // Queue headers plus one entry per pixel.
        let queue_size = 16 + pixel_count * 32;

        Ok(Self {
            width,
            height,
            output: device.create_buffer(
                BufferUsage::STORAGE | BufferUsage::TRANSFER_SRC,
                MemoryProperties::DEVICE_LOCAL,
                output_size,
            )?,
            readback: device.create_buffer(
                BufferUsage::TRANSFER_DST,
                MemoryProperties::HOST_VISIBLE
                    | MemoryProperties::HOST_COHERENT
                    | MemoryProperties::HOST_CACHED,
                output_size,
            )?,
            path_queue: device.create_buffer(
                BufferUsage::STORAGE,
                MemoryProperties::DEVICE_LOCAL,
                queue_size,
            )?,
            hit_queue: device.create_buffer(
                BufferUsage::STORAGE,
                MemoryProperties::DEVICE_LOCAL,
                queue_size,
            )?,
        })
    }

    fn destroy(self, device: &mut Device) {
        let _ = device.destroy_buffer(self.output);
        let _ = device.destroy_buffer(self.readback);
        let _ = device.destroy_buffer(self.path_queue);
        let _ = device.destroy_buffer(self.hit_queue);
    }
}

/// The render-pass orchestrator.
pub struct RenderPass {
    compiler: Box<dyn MaterialCompiler>,
    settings: RenderSettings,
    build_params: BuildParams,
    shader_cache: ShaderCache,
    geom_cache: Option<GeometryCache>,
    frame: Option<FrameResources>,
    last_versions: Option<ChangeVersions>,
    /// Progressive sample index; zero right after an invalidation.
    frame_index: u32,
    state: RenderPassState,
}

impl RenderPass {
    pub fn new(compiler: Box<dyn MaterialCompiler>, settings: RenderSettings) -> Self {
        Self {
            compiler,
            settings,
            build_params: BuildParams::default(),
            shader_cache: ShaderCache::new(),
            geom_cache: None,
            frame: None,
            last_versions: None,
            frame_index: 0,
            state: RenderPassState::Idle,
        }
    }

    pub fn state(&self) -> RenderPassState {
        self.state
    }

    pub fn settings(&self) -> &RenderSettings {
        &self.settings
    }

    /// Progressive sample index the next dispatch will run with.
    pub fn frame_index(&self) -> u32 {
        self.frame_index
    }

    /// Update settings, bumping the registry's render-settings version so
    /// the next frame invalidates accumulation.
    pub fn set_settings(&mut self, registry: &mut SceneRegistry, settings: RenderSettings) {
        self.settings = settings;
        registry.bump_render_settings();
    }

    /// Render one frame into `output` (RGBA f32, row-major).
    pub fn render_frame(
        &mut self,
        device: &mut Device,
        registry: &SceneRegistry,
        output: &mut [f32],
    ) -> Result<(), RenderError> {
        let result = self.render_frame_inner(device, registry, output);
        self.state = RenderPassState::Idle;
        result
    }

    fn render_frame_inner(
        &mut self,
        device: &mut Device,
        registry: &SceneRegistry,
        output: &mut [f32],
    ) -> Result<(), RenderError> {
        self.state = RenderPassState::Invalidating;
        let versions = registry.versions();
        let plan = plan_frame(self.last_versions, versions);
        if plan.invalidate_accumulation {
            self.frame_index = 0;
        }

        if plan.rebuild_geometry || self.geom_cache.is_none() {
            self.state = RenderPassState::RebuildingGeometry;
            // Build the replacement before dropping the old cache so a
            // failure leaves the previous geometry serving.
            let rebuilt = GeometryCache::build(device, registry, &self.build_params)
                .map_err(|e| e.at_stage(RenderStage::GeometryCache))?;
            if let Some(old) = self.geom_cache.take() {
                old.destroy(device);
            }
            self.geom_cache = Some(rebuilt);
        }

        // Rebuild the shader cache on misses only: AOV, feature or material
        // changes produce a new key. The traversal stack bound follows the
        // freshly built hierarchy.
        self.state = RenderPassState::RebuildingShader;
        let constants = KernelConstants {
            max_stack_size: self
                .geom_cache
                .as_ref()
                .map(|g| traversal_stack_bound(g.node_count))
                .unwrap_or(16)
                .max(1),
            ..KernelConstants::default()
        };
        let (pipeline, workgroup) = {
            let entry = self
                .shader_cache
                .get_or_build(
                    device,
                    self.compiler.as_ref(),
                    registry.materials(),
                    self.settings.aov,
                    self.settings.features,
                    &constants,
                )
                .map_err(|e| e.at_stage(RenderStage::ShaderCache))?;
            (entry.pipeline, entry.workgroup_size)
        };

        self.last_versions = Some(versions);

        self.dispatch(device, registry, output, pipeline, workgroup)
    }

    fn dispatch(
        &mut self,
        device: &mut Device,
        registry: &SceneRegistry,
        output: &mut [f32],
        pipeline: crate::gpu::Handle<crate::gpu::Pipeline>,
        workgroup: [u32; 3],
    ) -> Result<(), RenderError> {
        let settings = self.settings;
        let (width, height) = (settings.image_width, settings.image_height);
        assert!(
            output.len() as u64 >= width as u64 * height as u64 * 4,
            "output buffer too small for {width}x{height}"
        );

        // (Re)allocate per-resolution buffers.
        if self
            .frame
            .as_ref()
            .map(|f| (f.width, f.height) != (width, height))
            .unwrap_or(true)
        {
            if let Some(old) = self.frame.take() {
                old.destroy(device);
            }
            self.frame = Some(
                FrameResources::create(device, width, height)
                    .map_err(|e| e.at_stage(RenderStage::Dispatch))?,
            );
        }

        let geom = self.geom_cache.as_ref().expect("geometry cache built above");
        let frame = self.frame.as_ref().expect("frame resources built above");

        let camera = resolve_camera(registry.camera());
        let push = PushConstants {
            cam_origin: [camera.position.x, camera.position.y, camera.position.z, camera.vfov],
            cam_forward: [camera.forward.x, camera.forward.y, camera.forward.z, 10.0],
            cam_up: [camera.up.x, camera.up.y, camera.up.z, 0.05],
            background: settings.background_color,
            image_size: [width, height],
            spp: settings.spp,
            max_bounces: settings.max_bounces,
            rr_bounce_offset: settings.rr_bounce_offset,
            rr_inv_min_term_prob: settings.rr_inv_min_term_prob,
            max_sample_value: settings.max_sample_value,
            frame_index: self.frame_index,
            dome_light: settings.dome_light_enabled as u32,
            _pad: [0; 3],
        };

        self.state = RenderPassState::Dispatched;
        let mut run = || -> Result<(), crate::gpu::GpuError> {
            let cmd = device.create_command_buffer()?;
            device.begin_commands(cmd)?;
            device.cmd_bind_pipeline(cmd, pipeline)?;

            let buffers = [
                BufferBindingSlot::entire(binding::OUTPUT_PIXELS, frame.output),
                BufferBindingSlot::entire(binding::PATH_QUEUE, frame.path_queue),
                BufferBindingSlot {
                    binding: binding::NODES,
                    index: 0,
                    buffer: geom.scene_buffer,
                    offset: geom.nodes.offset,
                    size: geom.nodes.size,
                },
                BufferBindingSlot {
                    binding: binding::FACES,
                    index: 0,
                    buffer: geom.scene_buffer,
                    offset: geom.faces.offset,
                    size: geom.faces.size,
                },
                BufferBindingSlot {
                    binding: binding::VERTICES,
                    index: 0,
                    buffer: geom.scene_buffer,
                    offset: geom.vertices.offset,
                    size: geom.vertices.size,
                },
                BufferBindingSlot {
                    binding: binding::MATERIALS,
                    index: 0,
                    buffer: geom.scene_buffer,
                    offset: geom.materials.offset,
                    size: geom.materials.size,
                },
                BufferBindingSlot::entire(binding::HIT_QUEUE, frame.hit_queue),
            ];
            device.cmd_update_bindings(
                cmd,
                &Bindings {
                    buffers: &buffers,
                    ..Default::default()
                },
            )?;
            device.cmd_push_constants(cmd, bytemuck::bytes_of(&push))?;
            device.cmd_dispatch(
                cmd,
                width.div_ceil(workgroup[0]),
                height.div_ceil(workgroup[1]),
                1,
            )?;
            device.cmd_copy_buffer(cmd, frame.output, 0, frame.readback, 0, crate::gpu::WHOLE_SIZE)?;
            device.end_commands(cmd)?;

            let fence = device.create_fence()?;
            device.submit_command_buffer(cmd, fence)?;
            device.wait_for_fence(fence)?;
            device.destroy_fence(fence)?;
            device.destroy_command_buffer(cmd)?;
            Ok(())
        };
        run().map_err(|e| RenderError::from(e).at_stage(RenderStage::Dispatch))?;

        self.state = RenderPassState::Resolved;
        let mut read = || -> Result<(), crate::gpu::GpuError> {
            let size = width as u64 * height as u64 * 16;
            device.map_buffer(frame.readback, MapMode::Read)?;
            {
                let mapped = device.mapped_range(frame.readback, 0, size)?;
                let out_bytes: &mut [u8] = bytemuck::cast_slice_mut(output);
                out_bytes[..size as usize].copy_from_slice(&mapped[..size as usize]);
            }
            device.unmap_buffer(frame.readback)?;
            Ok(())
        };
        read().map_err(|e| RenderError::from(e).at_stage(RenderStage::Readback))?;

        if settings.gamma_encode {
            gamma::encode_image(output);
        }

        self.frame_index += 1;
        Ok(())
    }

    /// Release device resources. The pass is unusable afterwards.
    pub fn destroy(mut self, device: &mut Device) {
        self.shader_cache.clear(device);
        if let Some(geom) = self.geom_cache.take() {
            geom.destroy(device);
        }
        if let Some(frame) = self.frame.take() {
            frame.destroy(device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Affine3A;

    #[test]
    fn test_first_frame_invalidates_everything() {
        let plan = plan_frame(None, ChangeVersions::default());
        assert!(plan.invalidate_accumulation);
        assert!(plan.rebuild_geometry);
    }

    #[test]
    fn test_unchanged_versions_keep_accumulation() {
        let v = ChangeVersions {
            scene_state: 4,
            sprim_index: 2,
            render_settings: 7,
            visibility: 1,
        };
        let plan = plan_frame(Some(v), v);
        assert_eq!(plan, FramePlan::default());
    }

    #[test]
    fn test_settings_change_invalidates_but_keeps_geometry() {
        let last = ChangeVersions::default();
        let now = ChangeVersions {
            render_settings: 1,
            ..last
        };
        let plan = plan_frame(Some(last), now);
        assert!(plan.invalidate_accumulation);
        assert!(!plan.rebuild_geometry);
    }

    #[test]
    fn test_visibility_change_rebuilds_geometry() {
        let last = ChangeVersions::default();
        let now = ChangeVersions {
            visibility: 1,
            scene_state: 1,
            ..last
        };
        let plan = plan_frame(Some(last), now);
        assert!(plan.invalidate_accumulation);
        assert!(plan.rebuild_geometry);
    }

    #[test]
    fn test_camera_resolution() {
        // A camera translated to (1, 2, 3), default orientation.
        let state = CameraState {
            transform: Affine3A::from_translation(Vec3::new(1.0, 2.0, 3.0)),
            aperture: 20.25,
            focal_length: 50.0,
        };
        let camera = resolve_camera(&state);
        assert_eq!(camera.position, Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(camera.forward, -Vec3::Z);
        assert_eq!(camera.up, Vec3::Y);

        let expected = 2.0 * (20.25f32 / 100.0).atan();
        assert!((camera.vfov - expected).abs() < 1e-6);
    }

    #[test]
    fn test_push_constant_block_size() {
        // Must match the kernel's declaration and stay within device limits.
        assert_eq!(std::mem::size_of::<PushConstants>(), 112);
    }
}
