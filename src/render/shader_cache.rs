//! Invalidation-driven cache of compiled kernels and their pipelines.
//!
//! Entries are keyed by `(AOV, feature bits, material digest)`. On a miss
//! the material compiler produces a kernel, the device reflects its binding
//! interface and builds the descriptor layouts and compute pipeline. A
//! compile failure downgrades the material set to per-material diffuse
//! fallbacks once; if even that fails, the miss is surfaced and whatever
//! entry served the previous frame stays untouched.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use super::material::{
    fallback_materials, CompiledShader, KernelConstants, MaterialCompiler,
};
use super::{AovId, FeatureFlags, RenderError};
use crate::gpu::{Device, Handle, Pipeline, Shader, ShaderSource};
use crate::scene::Material;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ShaderCacheKey {
    pub aov: AovId,
    pub feature_bits: u32,
    pub material_digest: u64,
}

/// A compiled kernel resident on the device.
pub struct ShaderCacheEntry {
    pub shader: Handle<Shader>,
    pub pipeline: Handle<Pipeline>,
    pub workgroup_size: [u32; 3],
}

#[derive(Default)]
pub struct ShaderCache {
    entries: HashMap<ShaderCacheKey, ShaderCacheEntry>,
}

/// Content digest of a material set.
pub fn material_digest(materials: &[Material]) -> u64 {
    let mut hasher = DefaultHasher::new();
    bytemuck::cast_slice::<Material, u8>(materials).hash(&mut hasher);
    hasher.finish()
}

impl ShaderCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(aov: AovId, features: FeatureFlags, materials: &[Material]) -> ShaderCacheKey {
        ShaderCacheKey {
            aov,
            feature_bits: features.bits(),
            material_digest: material_digest(materials),
        }
    }

    pub fn contains(&self, key: &ShaderCacheKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Look up the pipeline for this configuration, building it on a miss.
    #[allow(clippy::too_many_arguments)]
    pub fn get_or_build(
        &mut self,
        device: &mut Device,
        compiler: &dyn MaterialCompiler,
        materials: &[Material],
        aov: AovId,
        features: FeatureFlags,
        constants: &KernelConstants,
    ) -> Result<&ShaderCacheEntry, RenderError> {
        let key = Self::key(aov, features, materials);
        if self.entries.contains_key(&key) {
            return Ok(&self.entries[&key]);
        }

        let compiled = match compiler.compile(materials, aov, features, constants) {
            Ok(compiled) => compiled,
            Err(err) => {
                // One retry with every material downgraded to diffuse.
                log::warn!("material compilation failed ({err}); retrying with diffuse fallback");
                let fallback = fallback_materials(materials);
                compiler.compile(&fallback, aov, features, constants)?
            }
        };

        let shader = match &compiled {
            CompiledShader::Wgsl(source) => {
                device.create_shader(ShaderSource::Wgsl(source.as_str()))?
            }
            CompiledShader::SpirV(words) => {
                device.create_shader(ShaderSource::SpirV(words.as_slice()))?
            }
        };
        let pipeline = match device.create_pipeline(shader, "Path Trace") {
            Ok(pipeline) => pipeline,
            Err(err) => {
                let _ = device.destroy_shader(shader);
                return Err(err.into());
            }
        };
        let workgroup_size = device.pipeline(pipeline)?.workgroup_size();

        log::info!(
            "compiled kernel: aov {:?}, features {:#x}, materials {:#018x}",
            aov,
            key.feature_bits,
            key.material_digest
        );

        Ok(self.entries.entry(key).or_insert(ShaderCacheEntry {
            shader,
            pipeline,
            workgroup_size,
        }))
    }

    /// Drop every cached pipeline, releasing device objects.
    pub fn clear(&mut self, device: &mut Device) {
        for (_, entry) in self.entries.drain() {
            let _ = device.destroy_pipeline(entry.pipeline);
            let _ = device.destroy_shader(entry.shader);
        }
    }
}
