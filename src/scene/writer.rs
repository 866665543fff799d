//! Scene-file emission.
//!
//! One contiguous little-endian file: a fixed 256-byte header, then the
//! node, face, vertex and material buffers back to back. Offsets in the
//! header point past the header and the buffers tile the rest of the file
//! exactly. Vertices are written in the interleaved order the kernel's
//! fetches want (`pos.xyz, u, norm.xyz, v`); everything else is the
//! in-memory POD layout.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use byteorder::{LittleEndian, WriteBytesExt};

use super::{SceneData, SceneError};
use crate::bvh::compress::CWBVH_NODE_SIZE;

/// Fixed header size in bytes.
pub const HEADER_SIZE: u64 = 256;

/// Byte strides of the four buffers.
pub const FACE_SIZE: u64 = 16;
pub const VERTEX_SIZE: u64 = 32;
pub const MATERIAL_SIZE: u64 = 32;

fn io_err<'a>(op: &'static str, path: &'a Path) -> impl FnOnce(std::io::Error) -> SceneError + 'a {
    move |source| SceneError::Io {
        op,
        path: path.to_path_buf(),
        source,
    }
}

/// Write `scene` to `path`.
pub fn write_scene(scene: &SceneData, path: &Path) -> Result<(), SceneError> {
    let node_size = scene.nodes.len() as u64 * CWBVH_NODE_SIZE as u64;
    let face_size = scene.faces.len() as u64 * FACE_SIZE;
    let vertex_size = scene.vertices.len() as u64 * VERTEX_SIZE;
    let material_size = scene.materials.len() as u64 * MATERIAL_SIZE;

    let node_offset = HEADER_SIZE;
    let face_offset = node_offset + node_size;
    let vertex_offset = face_offset + face_size;
    let material_offset = vertex_offset + vertex_size;

    let file = File::create(path).map_err(io_err("create", path))?;
    let mut out = BufWriter::new(file);

    let write = |out: &mut BufWriter<File>| -> std::io::Result<()> {
        out.write_u32::<LittleEndian>(scene.image_width)?;
        out.write_u32::<LittleEndian>(scene.image_height)?;
        for (offset, size) in [
            (node_offset, node_size),
            (face_offset, face_size),
            (vertex_offset, vertex_size),
            (material_offset, material_size),
        ] {
            out.write_u64::<LittleEndian>(offset)?;
            out.write_u64::<LittleEndian>(size)?;
        }

        for c in scene.aabb.min.to_array().iter().chain(scene.aabb.max.to_array().iter()) {
            out.write_f32::<LittleEndian>(*c)?;
        }

        let camera = &scene.camera;
        for c in camera
            .origin
            .iter()
            .chain(camera.forward.iter())
            .chain(camera.up.iter())
        {
            out.write_f32::<LittleEndian>(*c)?;
        }
        out.write_f32::<LittleEndian>(camera.hfov)?;

        // Reserved tail of the header.
        const WRITTEN: u64 = 8 + 4 * 16 + 24 + 40;
        out.write_all(&[0u8; (HEADER_SIZE - WRITTEN) as usize])?;

        out.write_all(bytemuck::cast_slice(&scene.nodes))?;
        out.write_all(bytemuck::cast_slice(&scene.faces))?;

        for v in &scene.vertices {
            out.write_f32::<LittleEndian>(v.pos[0])?;
            out.write_f32::<LittleEndian>(v.pos[1])?;
            out.write_f32::<LittleEndian>(v.pos[2])?;
            out.write_f32::<LittleEndian>(v.uv[0])?;
            out.write_f32::<LittleEndian>(v.norm[0])?;
            out.write_f32::<LittleEndian>(v.norm[1])?;
            out.write_f32::<LittleEndian>(v.norm[2])?;
            out.write_f32::<LittleEndian>(v.uv[1])?;
        }

        out.write_all(bytemuck::cast_slice(&scene.materials))?;
        out.flush()
    };

    write(&mut out).map_err(io_err("write", path))
}
