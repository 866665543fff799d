//! The material-compiler seam.
//!
//! Material translation is an external concern; the renderer only needs a
//! function from a material set, an AOV and a feature set to a compiled
//! kernel. The built-in [`KernelCompiler`] serves the bundled WGSL kernel
//! with the compile-time constants spliced in front of the template; a
//! full material pipeline plugs in behind the same trait and may hand back
//! SPIR-V instead.

use thiserror::Error;

use super::{AovId, FeatureFlags};
use crate::scene::Material;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("material translation failed: {0}")]
    Translation(String),
}

/// Compiled kernel in whichever form the compiler produces.
pub enum CompiledShader {
    Wgsl(String),
    SpirV(Vec<u32>),
}

/// Constants injected into the kernel; they mirror the values the host
/// dispatches with, so a mismatch is a correctness bug, not a tuning knob.
#[derive(Clone, Copy, Debug)]
pub struct KernelConstants {
    pub num_threads_x: u32,
    pub num_threads_y: u32,
    pub max_stack_size: u32,
    pub postpone_ratio: f32,
}

impl Default for KernelConstants {
    fn default() -> Self {
        Self {
            num_threads_x: 8,
            num_threads_y: 8,
            max_stack_size: 16,
            postpone_ratio: 0.2,
        }
    }
}

pub trait MaterialCompiler {
    /// Compile a kernel for `materials` emitting `aov`. Must be a pure
    /// function of its inputs: the shader cache keys on their hash.
    fn compile(
        &self,
        materials: &[Material],
        aov: AovId,
        features: FeatureFlags,
        constants: &KernelConstants,
    ) -> Result<CompiledShader, CompileError>;
}

/// Replacement used when a material set fails to compile: a plain diffuse
/// surface carrying each material's base colour.
pub fn fallback_materials(materials: &[Material]) -> Vec<Material> {
    materials
        .iter()
        .map(|m| Material::diffuse(m.albedo[0], m.albedo[1], m.albedo[2]))
        .collect()
}

/// The bundled path-tracing kernel.
pub struct KernelCompiler;

const KERNEL_TEMPLATE: &str = include_str!("../../shaders/main.wgsl");

impl MaterialCompiler for KernelCompiler {
    fn compile(
        &self,
        _materials: &[Material],
        aov: AovId,
        features: FeatureFlags,
        constants: &KernelConstants,
    ) -> Result<CompiledShader, CompileError> {
        let mut source = String::with_capacity(KERNEL_TEMPLATE.len() + 512);

        let mut push_const = |name: &str, value: String| {
            source.push_str("const ");
            source.push_str(name);
            source.push_str(" = ");
            source.push_str(&value);
            source.push_str(";\n");
        };

        push_const("AOV_ID", format!("{}u", aov as u32));
        push_const("NUM_THREADS_X", format!("{}u", constants.num_threads_x));
        push_const("NUM_THREADS_Y", format!("{}u", constants.num_threads_y));
        push_const("MAX_STACK_SIZE", format!("{}u", constants.max_stack_size.max(1)));
        push_const("POSTPONE_RATIO", format!("{:?}f", constants.postpone_ratio));
        // No wave ballot in the baseline shading language; the postponement
        // branch compiles out until a subgroup path exists.
        push_const("TRIANGLE_POSTPONING", "false".to_string());
        push_const(
            "NEXT_EVENT_ESTIMATION",
            format!("{}", features.next_event_estimation),
        );
        push_const(
            "PROGRESSIVE_ACCUMULATION",
            format!("{}", features.progressive_accumulation),
        );
        push_const(
            "DOME_LIGHT_CAMERA_VISIBLE",
            format!("{}", features.dome_light_camera_visible),
        );
        push_const("DEPTH_OF_FIELD", format!("{}", features.depth_of_field));
        push_const(
            "FILTER_IMPORTANCE_SAMPLING",
            format!("{}", features.filter_importance_sampling),
        );

        source.push('\n');
        source.push_str(KERNEL_TEMPLATE);
        Ok(CompiledShader::Wgsl(source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_preserves_base_colour() {
        let mut m = Material::diffuse(0.2, 0.4, 0.6);
        m.emission = [5.0, 5.0, 5.0];
        let fb = fallback_materials(&[m]);
        assert_eq!(fb[0].albedo, [0.2, 0.4, 0.6]);
        assert!(!fb[0].is_emissive());
    }

    #[test]
    fn test_compiled_kernel_parses_and_reflects() {
        let compiled = KernelCompiler
            .compile(
                &[],
                AovId::Color,
                FeatureFlags::default(),
                &KernelConstants::default(),
            )
            .unwrap();
        let CompiledShader::Wgsl(source) = compiled else {
            panic!("bundled compiler emits WGSL");
        };

        let module = naga::front::wgsl::parse_str(&source)
            .unwrap_or_else(|e| panic!("kernel does not parse: {}", e.emit_to_string(&source)));

        // The storage binding table is a wire contract; pin it.
        let mut bindings: Vec<u32> = module
            .global_variables
            .iter()
            .filter_map(|(_, v)| v.binding.as_ref().map(|b| b.binding))
            .collect();
        bindings.sort_unstable();
        assert_eq!(bindings, vec![0, 1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_constants_respond_to_features() {
        let features = FeatureFlags {
            next_event_estimation: false,
            ..Default::default()
        };
        let CompiledShader::Wgsl(source) = KernelCompiler
            .compile(&[], AovId::Normal, features, &KernelConstants::default())
            .unwrap()
        else {
            unreachable!()
        };
        assert!(source.contains("const AOV_ID = 1u;"));
        assert!(source.contains("const NEXT_EVENT_ESTIMATION = false;"));
    }
}
