//! # Gatling: GPU path tracing with a compressed wide-BVH pipeline
//!
//! Gatling renders triangle scenes offline on a compute device. The
//! repository splits into an offline preprocessing pipeline and a runtime:
//!
//! ## Preprocessing ([`bvh`], [`scene`])
//!
//! A polygon soup becomes a traversal-ready artifact in three passes:
//! - [`bvh::builder`] - SAH binary BVH with spatial splits
//! - [`bvh::collapse`] - merge into an 8-wide BVH
//! - [`bvh::compress`] - quantise into 80-byte nodes
//!
//! [`scene::writer`] serialises the hierarchy together with the face,
//! vertex and material buffers into a single `.gsd` file;
//! [`scene::reader`] validates and loads it back.
//!
//! **Key design**: nodes are arena-allocated and index-linked, so the
//! in-memory hierarchy, the file image and the GPU buffer are the same
//! bytes.
//!
//! ## Runtime ([`gpu`], [`render`], [`trace`])
//!
//! - [`gpu::Device`] - compute-device abstraction: versioned typed handles,
//!   reflection-derived pipelines, command recording with implicit image
//!   layout transitions, fences and host mapping
//! - [`render::render_pass::RenderPass`] - per-frame orchestration over a
//!   [`scene::SceneRegistry`]: invalidation tracking, shader and geometry
//!   cache rebuilds, dispatch and readback
//! - [`trace`] - host-side traversal of the compressed hierarchy, used by
//!   the preprocessor for validation and by the test suite as the
//!   reference for the GPU kernel
//!
//! ## Entry points
//!
//! - `gp` - preprocessor binary: mesh file in, `.gsd` out
//! - `gatling` - renderer binary: `.gsd` in, image out

pub mod bvh;
pub mod gpu;
pub mod render;
pub mod scene;
pub mod trace;
