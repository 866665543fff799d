//! Quantisation of a wide BVH into fixed 80-byte nodes.
//!
//! Each node stores its own minimum corner `p` and one power-of-two scale
//! exponent per axis; child boxes become byte pairs on that grid, with the
//! minimum rounded down and the maximum rounded up so a decoded box always
//! contains the box it encodes. The `meta` byte of every slot packs the
//! traversal bit index (interior: 24 + slot, leaves: face offset) and, in
//! the high bits, either the interior marker or the unary face count.
//!
//! Children are assigned to slots by the signed octant of their centroid
//! relative to the node centre, so that XOR-ing the stored index with the
//! ray's octant mask yields near-to-far traversal order.

use bytemuck::{Pod, Zeroable};
use glam::Vec3;

use super::{Aabb, WideBvh, WideChild};
use crate::scene::Face;

/// Byte size of one compressed node.
pub const CWBVH_NODE_SIZE: usize = 80;

/// Compressed wide-BVH node, five 16-byte words.
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct CwbvhNode {
    pub p: [f32; 3],
    pub e: [u8; 3],
    /// Bit per slot: set when the child is an interior node.
    pub imask: u8,
    pub child_base_idx: u32,
    pub face_base_idx: u32,
    pub meta: [u8; 8],
    pub q_lo_x: [u8; 8],
    pub q_lo_y: [u8; 8],
    pub q_lo_z: [u8; 8],
    pub q_hi_x: [u8; 8],
    pub q_hi_y: [u8; 8],
    pub q_hi_z: [u8; 8],
}

impl CwbvhNode {
    /// Per-axis grid scale `2^(e - 127)` as an f32.
    pub fn scale(&self, axis: usize) -> f32 {
        f32::from_bits((self.e[axis] as u32) << 23)
    }

    /// Decode the child box in slot `slot`. Meaningless for empty slots.
    pub fn child_aabb(&self, slot: usize) -> Aabb {
        let p = Vec3::from(self.p);
        let scale = Vec3::new(self.scale(0), self.scale(1), self.scale(2));
        let lo = Vec3::new(
            self.q_lo_x[slot] as f32,
            self.q_lo_y[slot] as f32,
            self.q_lo_z[slot] as f32,
        );
        let hi = Vec3::new(
            self.q_hi_x[slot] as f32,
            self.q_hi_y[slot] as f32,
            self.q_hi_z[slot] as f32,
        );
        Aabb {
            min: p + lo * scale,
            max: p + hi * scale,
        }
    }
}

/// Compressed hierarchy plus the face buffer reordered into traversal order.
pub struct CompressedBvh {
    pub nodes: Vec<CwbvhNode>,
    pub faces: Vec<Face>,
    pub aabb: Aabb,
}

/// Smallest exponent `e` with `255 * 2^e >= extent`, biased by 127.
fn quantisation_exponent(extent: f32) -> u8 {
    if !(extent > 0.0) {
        return 1; // degenerate axis: smallest positive scale
    }
    let mut e = (extent / 255.0).log2().ceil() as i32;
    e = e.clamp(-126, 127);
    // Guard against log/ceil round-off: never clip the extent.
    while 255.0 * f32::from_bits(((e + 127) as u32) << 23) < extent && e < 127 {
        e += 1;
    }
    (e + 127) as u8
}

/// Direction sign vector of a child slot: bit 2 is +x, bit 1 +y, bit 0 +z.
fn slot_direction(slot: usize) -> Vec3 {
    Vec3::new(
        if slot & 0b100 != 0 { 1.0 } else { -1.0 },
        if slot & 0b010 != 0 { 1.0 } else { -1.0 },
        if slot & 0b001 != 0 { 1.0 } else { -1.0 },
    )
}

/// Assign children to the eight slots, maximising the alignment between
/// each child's centroid direction and its slot's octant direction. Greedy
/// over the 64 (child, slot) pairs; the exact assignment problem is not
/// worth solving for eight elements.
fn assign_slots(children: &[(usize, Aabb)], parent: &Aabb) -> [Option<usize>; 8] {
    let centre = parent.center();
    let mut pairs = Vec::with_capacity(children.len() * 8);
    for (ci, (_, aabb)) in children.iter().enumerate() {
        let dir = aabb.center() - centre;
        for slot in 0..8 {
            pairs.push((dir.dot(slot_direction(slot)), ci, slot));
        }
    }
    pairs.sort_unstable_by(|a, b| b.0.total_cmp(&a.0));

    let mut slot_of_child = [usize::MAX; 8];
    let mut slot_taken = [false; 8];
    let mut assigned = 0;
    for (_, ci, slot) in pairs {
        if slot_of_child[ci] != usize::MAX || slot_taken[slot] {
            continue;
        }
        slot_of_child[ci] = slot;
        slot_taken[slot] = true;
        assigned += 1;
        if assigned == children.len() {
            break;
        }
    }

    let mut out = [None; 8];
    for (ci, &slot) in slot_of_child.iter().take(children.len()).enumerate() {
        out[slot] = Some(ci);
    }
    out
}

/// Compress `wide`, consuming it. Faces are re-emitted in slot order so that
/// every leaf's range is contiguous and addressable by a 5-bit offset from
/// the node's face base.
pub fn compress(wide: WideBvh) -> CompressedBvh {
    let mut nodes: Vec<CwbvhNode> = Vec::with_capacity(wide.nodes.len());
    let mut faces: Vec<Face> = Vec::with_capacity(wide.faces.len());

    // (wide node index, output slot) worklist; children are allocated as a
    // contiguous block when their parent is processed.
    let mut worklist = std::collections::VecDeque::new();
    nodes.push(CwbvhNode::default());
    worklist.push_back((0usize, 0usize));

    while let Some((wide_idx, out_idx)) = worklist.pop_front() {
        let node = &wide.nodes[wide_idx];

        let children: Vec<(usize, Aabb)> = node
            .children
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.aabb().map(|aabb| (i, *aabb)))
            .collect();

        let slot_map = assign_slots(&children, &node.aabb);

        let mut out = CwbvhNode {
            p: node.aabb.min.to_array(),
            e: [
                quantisation_exponent(node.aabb.extent().x),
                quantisation_exponent(node.aabb.extent().y),
                quantisation_exponent(node.aabb.extent().z),
            ],
            child_base_idx: nodes.len() as u32,
            face_base_idx: faces.len() as u32,
            // Empty slots keep inverted byte bounds so they can never pass
            // the slab test even if the meta guard were ignored.
            q_lo_x: [255; 8],
            q_lo_y: [255; 8],
            q_lo_z: [255; 8],
            ..Default::default()
        };

        let p = node.aabb.min;
        let inv_scale = Vec3::new(
            1.0 / f32::from_bits((out.e[0] as u32) << 23),
            1.0 / f32::from_bits((out.e[1] as u32) << 23),
            1.0 / f32::from_bits((out.e[2] as u32) << 23),
        );

        let mut face_cursor = 0u8;
        for slot in 0..8 {
            let Some(ci) = slot_map[slot] else { continue };
            let (child_idx, aabb) = children[ci];

            let lo = ((aabb.min - p) * inv_scale).floor().clamp(
                Vec3::ZERO,
                Vec3::splat(255.0),
            );
            let hi = ((aabb.max - p) * inv_scale).ceil().clamp(
                Vec3::ZERO,
                Vec3::splat(255.0),
            );
            out.q_lo_x[slot] = lo.x as u8;
            out.q_lo_y[slot] = lo.y as u8;
            out.q_lo_z[slot] = lo.z as u8;
            out.q_hi_x[slot] = hi.x as u8;
            out.q_hi_y[slot] = hi.y as u8;
            out.q_hi_z[slot] = hi.z as u8;

            match node.children[child_idx] {
                WideChild::Interior { node: wide_child, .. } => {
                    out.imask |= 1 << slot;
                    out.meta[slot] = 0x20 | (24 + slot as u8);
                    let allocated = nodes.len();
                    nodes.push(CwbvhNode::default());
                    worklist.push_back((wide_child as usize, allocated));
                }
                WideChild::Leaf {
                    first_face,
                    face_count,
                    ..
                } => {
                    // The unary count field holds at most three faces.
                    assert!(face_count >= 1 && face_count <= 3);
                    out.meta[slot] = (((1u16 << face_count) - 1) as u8) << 5 | face_cursor;
                    for f in first_face..first_face + face_count {
                        faces.push(wide.faces[f as usize]);
                    }
                    face_cursor += face_count as u8;
                }
                WideChild::Empty => unreachable!(),
            }
        }

        nodes[out_idx] = out;
    }

    CompressedBvh {
        nodes,
        faces,
        aabb: wide.aabb,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bvh::builder::{self, BuildParams};
    use crate::bvh::collapse::{self, CollapseParams};
    use crate::scene::Vertex;

    fn compress_grid(n: usize) -> (CompressedBvh, Vec<Face>, Vec<Vertex>) {
        let mut vertices = Vec::new();
        let mut faces = Vec::new();
        for i in 0..n {
            for j in 0..n {
                let base = vertices.len() as u32;
                for (dx, dz) in [(0.0f32, 0.0f32), (1.0, 0.0), (0.0, 1.0), (1.0, 1.0)] {
                    vertices.push(Vertex {
                        pos: [i as f32 + dx, ((i * 7 + j) % 5) as f32 * 0.25, j as f32 + dz],
                        norm: [0.0, 1.0, 0.0],
                        uv: [dx, dz],
                    });
                }
                faces.push(Face { v: [base, base + 1, base + 2], mat_index: 0 });
                faces.push(Face { v: [base + 1, base + 3, base + 2], mat_index: 0 });
            }
        }
        let binary = builder::build(&BuildParams::default(), &faces, &vertices).unwrap();
        let wide = collapse::collapse(&CollapseParams::default(), binary).unwrap();
        (compress(wide), faces, vertices)
    }

    #[test]
    fn test_node_is_80_bytes() {
        assert_eq!(std::mem::size_of::<CwbvhNode>(), CWBVH_NODE_SIZE);
    }

    #[test]
    fn test_exponent_never_clips() {
        for extent in [0.0f32, 1e-30, 0.5, 1.0, 255.0, 1e6, 3.7e8] {
            let e = quantisation_exponent(extent);
            let scale = f32::from_bits((e as u32) << 23);
            assert!(255.0 * scale >= extent, "extent {extent} clipped");
        }
    }

    #[test]
    fn test_decoded_child_boxes_are_well_formed() {
        let (compressed, _, _) = compress_grid(6);

        // Walk the hierarchy; every occupied slot must decode to a
        // non-inverted box. Containment of the source boxes is pinned by
        // the integration suite, which keeps the pre-compression tree.
        fn check(nodes: &[CwbvhNode], idx: usize) {
            let node = &nodes[idx];
            for slot in 0..8 {
                if node.meta[slot] == 0 {
                    continue;
                }
                let decoded = node.child_aabb(slot);
                assert!(decoded.min.cmple(decoded.max).all());
                if node.imask & (1 << slot) != 0 {
                    let relative = (node.imask as u32 & !(u32::MAX << slot)).count_ones();
                    check(nodes, (node.child_base_idx + relative) as usize);
                }
            }
        }
        check(&compressed.nodes, 0);
    }

    #[test]
    fn test_interior_meta_and_imask_agree() {
        let (compressed, ..) = compress_grid(5);
        for node in &compressed.nodes {
            for slot in 0..8 {
                let meta = node.meta[slot];
                if meta == 0 {
                    assert_eq!(node.imask & (1 << slot), 0);
                    continue;
                }
                let is_interior = node.imask & (1 << slot) != 0;
                assert_eq!(is_interior, (meta & 0b11111) >= 24);
                if is_interior {
                    assert_eq!(meta & 0b11111, 24 + slot as u8);
                } else {
                    // Leaf: unary face count, offset below 24.
                    assert!((meta & 0b11111) < 24);
                    assert!(meta >> 5 > 0);
                }
            }
        }
    }

    #[test]
    fn test_leaf_ranges_tile_face_buffer() {
        let (compressed, source_faces, _) = compress_grid(4);
        // Spatial splits may duplicate faces, never drop them.
        assert!(compressed.faces.len() >= source_faces.len());

        let mut covered = vec![false; compressed.faces.len()];
        for node in &compressed.nodes {
            for slot in 0..8 {
                let meta = node.meta[slot];
                if meta == 0 || node.imask & (1 << slot) != 0 {
                    continue;
                }
                let offset = (meta & 0b11111) as u32;
                let count = (meta >> 5).count_ones();
                for f in 0..count {
                    let idx = (node.face_base_idx + offset + f) as usize;
                    assert!(!covered[idx], "face {idx} referenced twice");
                    covered[idx] = true;
                }
            }
        }
        assert!(covered.iter().all(|&c| c));
    }
}
