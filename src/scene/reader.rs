//! Scene-file loading and integrity validation.
//!
//! The reader refuses files whose header cannot be trusted: short files,
//! buffer ranges outside the file, and buffer sizes that are not a whole
//! number of elements all fail with a typed error naming the buffer. A
//! well-formed file round-trips bit-exactly through the writer.

use std::io::Cursor;
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};
use glam::Vec3;

use super::writer::{FACE_SIZE, HEADER_SIZE, MATERIAL_SIZE, VERTEX_SIZE};
use super::{Camera, Face, Material, SceneData, SceneError, Vertex};
use crate::bvh::compress::{CwbvhNode, CWBVH_NODE_SIZE};
use crate::bvh::Aabb;

struct BufferRange {
    name: &'static str,
    offset: u64,
    size: u64,
    stride: u64,
}

impl BufferRange {
    fn validate(&self, file_size: u64) -> Result<(), SceneError> {
        if self.offset < HEADER_SIZE
            || self.offset > file_size
            || self.size > file_size - self.offset
        {
            return Err(SceneError::BufferOutOfBounds {
                buffer: self.name,
                offset: self.offset,
                size: self.size,
                file_size,
            });
        }
        if self.size % self.stride != 0 {
            return Err(SceneError::MisalignedBuffer {
                buffer: self.name,
                size: self.size,
                stride: self.stride,
            });
        }
        Ok(())
    }

    fn slice<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        &data[self.offset as usize..(self.offset + self.size) as usize]
    }
}

/// Load and validate a scene file.
pub fn read_scene(path: &Path) -> Result<SceneData, SceneError> {
    let data = std::fs::read(path).map_err(|source| SceneError::Io {
        op: "read",
        path: path.to_path_buf(),
        source,
    })?;
    parse_scene(&data)
}

/// Parse a scene file image. Exposed separately so tests and tools can
/// validate in-memory bytes.
pub fn parse_scene(data: &[u8]) -> Result<SceneData, SceneError> {
    let file_size = data.len() as u64;
    if file_size < HEADER_SIZE {
        return Err(SceneError::TruncatedHeader(HEADER_SIZE));
    }

    let mut header = Cursor::new(&data[..HEADER_SIZE as usize]);
    let read = |h: &mut Cursor<&[u8]>| -> std::io::Result<(u32, u32, [(u64, u64); 4], Aabb, Camera)> {
        let width = h.read_u32::<LittleEndian>()?;
        let height = h.read_u32::<LittleEndian>()?;

        let mut ranges = [(0u64, 0u64); 4];
        for range in &mut ranges {
            range.0 = h.read_u64::<LittleEndian>()?;
            range.1 = h.read_u64::<LittleEndian>()?;
        }

        let mut aabb = [0f32; 6];
        for c in &mut aabb {
            *c = h.read_f32::<LittleEndian>()?;
        }
        let aabb = Aabb::new(
            Vec3::new(aabb[0], aabb[1], aabb[2]),
            Vec3::new(aabb[3], aabb[4], aabb[5]),
        );

        let mut camera = [0f32; 10];
        for c in &mut camera {
            *c = h.read_f32::<LittleEndian>()?;
        }
        let camera = Camera {
            origin: [camera[0], camera[1], camera[2]],
            forward: [camera[3], camera[4], camera[5]],
            up: [camera[6], camera[7], camera[8]],
            hfov: camera[9],
        };

        Ok((width, height, ranges, aabb, camera))
    };
    let (image_width, image_height, ranges, aabb, camera) =
        read(&mut header).expect("header cursor is sized above");

    let [nodes, faces, vertices, materials] = [
        BufferRange {
            name: "node",
            offset: ranges[0].0,
            size: ranges[0].1,
            stride: CWBVH_NODE_SIZE as u64,
        },
        BufferRange {
            name: "face",
            offset: ranges[1].0,
            size: ranges[1].1,
            stride: FACE_SIZE,
        },
        BufferRange {
            name: "vertex",
            offset: ranges[2].0,
            size: ranges[2].1,
            stride: VERTEX_SIZE,
        },
        BufferRange {
            name: "material",
            offset: ranges[3].0,
            size: ranges[3].1,
            stride: MATERIAL_SIZE,
        },
    ];
    for range in [&nodes, &faces, &vertices, &materials] {
        range.validate(file_size)?;
    }
    if nodes.size == 0 {
        return Err(SceneError::NoNodes);
    }

    let nodes: Vec<CwbvhNode> = bytemuck::pod_collect_to_vec(nodes.slice(data));
    let faces: Vec<Face> = bytemuck::pod_collect_to_vec(faces.slice(data));
    let materials: Vec<Material> = bytemuck::pod_collect_to_vec(materials.slice(data));

    // Vertices are interleaved on disk; unpack to the in-memory layout.
    let vertex_bytes = vertices.slice(data);
    let mut vertices = Vec::with_capacity(vertex_bytes.len() / VERTEX_SIZE as usize);
    let mut cursor = Cursor::new(vertex_bytes);
    while (cursor.position() as usize) < vertex_bytes.len() {
        let mut f = [0f32; 8];
        for c in &mut f {
            *c = cursor
                .read_f32::<LittleEndian>()
                .expect("range length validated above");
        }
        vertices.push(Vertex {
            pos: [f[0], f[1], f[2]],
            norm: [f[4], f[5], f[6]],
            uv: [f[3], f[7]],
        });
    }

    Ok(SceneData {
        image_width,
        image_height,
        aabb,
        camera,
        nodes,
        faces,
        vertices,
        materials,
    })
}
