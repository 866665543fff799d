//! In-process rendering: shader and geometry caches plus the per-frame
//! render pass that keeps them in sync with the scene registry.

pub mod gamma;
pub mod geom_cache;
pub mod material;
pub mod render_pass;
pub mod shader_cache;

use thiserror::Error;

use crate::bvh::BvhError;
use crate::gpu::GpuError;
use crate::render::material::CompileError;

/// Arbitrary output variable the kernel writes. The id is compiled into the
/// kernel, so switching AOVs rebuilds the shader cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum AovId {
    #[default]
    Color = 0,
    Normal = 1,
    DebugBarycentrics = 2,
    DebugBounces = 3,
    DebugNee = 4,
    DebugOpacity = 5,
}

/// Kernel feature toggles; each becomes a compile-time constant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FeatureFlags {
    pub depth_of_field: bool,
    pub filter_importance_sampling: bool,
    pub next_event_estimation: bool,
    pub progressive_accumulation: bool,
    pub dome_light_camera_visible: bool,
    pub triangle_postponing: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            depth_of_field: false,
            filter_importance_sampling: true,
            next_event_estimation: true,
            progressive_accumulation: true,
            dome_light_camera_visible: true,
            triangle_postponing: false,
        }
    }
}

impl FeatureFlags {
    /// Stable bit encoding used in cache keys.
    pub fn bits(&self) -> u32 {
        (self.depth_of_field as u32)
            | (self.filter_importance_sampling as u32) << 1
            | (self.next_event_estimation as u32) << 2
            | (self.progressive_accumulation as u32) << 3
            | (self.dome_light_camera_visible as u32) << 4
            | (self.triangle_postponing as u32) << 5
    }
}

/// Per-session render configuration.
#[derive(Clone, Copy, Debug)]
pub struct RenderSettings {
    pub image_width: u32,
    pub image_height: u32,
    pub spp: u32,
    pub max_bounces: u32,
    pub rr_bounce_offset: u32,
    pub rr_inv_min_term_prob: f32,
    pub max_sample_value: f32,
    pub background_color: [f32; 4],
    pub dome_light_enabled: bool,
    pub aov: AovId,
    pub features: FeatureFlags,
    /// Encode to sRGB on the CPU after readback.
    pub gamma_encode: bool,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            image_width: 1200,
            image_height: 1200,
            spp: 256,
            max_bounces: 4,
            rr_bounce_offset: 3,
            rr_inv_min_term_prob: 1.0,
            max_sample_value: 10.0,
            background_color: [0.0, 0.0, 0.0, 1.0],
            dome_light_enabled: false,
            aov: AovId::Color,
            features: FeatureFlags::default(),
            gamma_encode: false,
        }
    }
}

/// Stage a failed frame was in; earlier caches survive the failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenderStage {
    ShaderCache,
    GeometryCache,
    Dispatch,
    Readback,
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("render step failed during {stage:?}: {source}")]
    RenderStepFailed {
        stage: RenderStage,
        #[source]
        source: Box<RenderError>,
    },

    #[error(transparent)]
    Gpu(#[from] GpuError),

    #[error(transparent)]
    Bvh(#[from] BvhError),

    #[error(transparent)]
    MaterialCompile(#[from] CompileError),

    /// A root leaf would need special traversal handling; scenes this small
    /// are rejected outright.
    #[error("scene has {0} faces; at least 4 are required")]
    TooFewFaces(usize),

    #[error("no camera in scene")]
    NoCamera,
}

impl RenderError {
    pub(crate) fn at_stage(self, stage: RenderStage) -> RenderError {
        RenderError::RenderStepFailed {
            stage,
            source: Box::new(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_bits_are_distinct() {
        let mut seen = std::collections::HashSet::new();
        let defaults = FeatureFlags {
            depth_of_field: false,
            filter_importance_sampling: false,
            next_event_estimation: false,
            progressive_accumulation: false,
            dome_light_camera_visible: false,
            triangle_postponing: false,
        };
        for i in 0..6 {
            let mut flags = defaults;
            match i {
                0 => flags.depth_of_field = true,
                1 => flags.filter_importance_sampling = true,
                2 => flags.next_event_estimation = true,
                3 => flags.progressive_accumulation = true,
                4 => flags.dome_light_camera_visible = true,
                _ => flags.triangle_postponing = true,
            }
            assert!(seen.insert(flags.bits()));
        }
        assert_eq!(defaults.bits(), 0);
    }
}
