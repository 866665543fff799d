//! Collapse a binary BVH into a wide BVH with up to eight children.
//!
//! Every binary node is costed three ways under the SAH metric: as a leaf
//! (area x faces x intersection cost, only if the subtree fits the leaf
//! bound), as a wide interior node (area x traversal cost plus the best
//! distribution of its descendants over eight child slots), or as a
//! pass-through when the parent can spare more than one slot for it. The
//! distribution table is solved bottom-up; reconstruction then walks the
//! optimal decisions and emits wide nodes.

use super::{BinaryBvh, BvhError, WideBvh, WideChild, WideNode};

const WIDTH: usize = 8;
const INF: f32 = f32::INFINITY;

#[derive(Clone, Copy, Debug)]
pub struct CollapseParams {
    /// Hard bound on faces referenced by one wide leaf child.
    pub max_leaf_size: u32,
    pub node_traversal_cost: f32,
    pub face_intersection_cost: f32,
}

impl Default for CollapseParams {
    fn default() -> Self {
        Self {
            max_leaf_size: 3,
            node_traversal_cost: 1.0,
            face_intersection_cost: 0.3,
        }
    }
}

struct Collapser {
    params: CollapseParams,
    /// `cost[n][i-1]`: cost of binary node `n` when its parent grants it
    /// `i` child slots.
    cost: Vec<[f32; WIDTH]>,
    /// Contiguous face range covered by each binary subtree.
    ranges: Vec<(u32, u32)>,
    wide: Vec<WideNode>,
}

/// Collapse `bvh`, consuming it; the face buffer carries over unchanged.
pub fn collapse(params: &CollapseParams, bvh: BinaryBvh) -> Result<WideBvh, BvhError> {
    if bvh.nodes.is_empty() {
        return Err(BvhError::EmptyInput);
    }

    let mut collapser = Collapser {
        params: *params,
        cost: vec![[INF; WIDTH]; bvh.nodes.len()],
        ranges: vec![(0, 0); bvh.nodes.len()],
        wide: Vec::new(),
    };
    collapser.solve(&bvh);

    // The root is always materialised as a node; a single-leaf tree becomes
    // a wide root with one leaf child.
    if bvh.nodes[0].is_leaf() {
        let root = &bvh.nodes[0];
        let mut children = [WideChild::Empty; WIDTH];
        children[0] = WideChild::Leaf {
            first_face: root.first,
            face_count: root.count,
            aabb: root.aabb,
        };
        collapser.wide.push(WideNode {
            aabb: root.aabb,
            children,
        });
    } else {
        collapser.emit_wide(&bvh, 0);
    }

    Ok(WideBvh {
        nodes: collapser.wide,
        faces: bvh.faces,
        aabb: bvh.aabb,
    })
}

impl Collapser {
    /// Fill the cost tables bottom-up. Children are stored after their
    /// parent, so a reverse index walk visits children first.
    fn solve(&mut self, bvh: &BinaryBvh) {
        for n in (0..bvh.nodes.len()).rev() {
            let node = &bvh.nodes[n];
            let area = node.aabb.area();

            if node.is_leaf() {
                self.ranges[n] = (node.first, node.count);
                // A binary leaf cannot be subdivided further; it costs the
                // same however many slots it is granted.
                let cost = area * node.count as f32 * self.params.face_intersection_cost;
                self.cost[n] = [cost; WIDTH];
                continue;
            }

            let left = node.left_child() as usize;
            let right = node.right_child() as usize;
            let (lf, lc) = self.ranges[left];
            let (_, rc) = self.ranges[right];
            self.ranges[n] = (lf, lc + rc);

            let face_count = lc + rc;
            let leaf_cost = if face_count <= self.params.max_leaf_size {
                area * face_count as f32 * self.params.face_intersection_cost
            } else {
                INF
            };
            let internal_cost =
                self.distribute(left, right, WIDTH).0 + area * self.params.node_traversal_cost;

            self.cost[n][0] = leaf_cost.min(internal_cost);
            for i in 2..=WIDTH {
                let (dist, _) = self.distribute(left, right, i);
                self.cost[n][i - 1] = self.cost[n][i - 2].min(dist);
            }
        }
    }

    /// Best way to share `slots` child slots between two subtrees.
    fn distribute(&self, left: usize, right: usize, slots: usize) -> (f32, usize) {
        let mut best = (INF, 1);
        for k in 1..slots {
            let cost = self.cost[left][k - 1] + self.cost[right][slots - k - 1];
            if cost < best.0 {
                best = (cost, k);
            }
        }
        best
    }

    /// Binary nodes that become the children of the wide node rooted at `n`.
    fn expand_root(&self, bvh: &BinaryBvh, n: usize, out: &mut Vec<usize>) {
        let node = &bvh.nodes[n];
        let (_, k) = self.distribute(node.left_child() as usize, node.right_child() as usize, WIDTH);
        self.expand(bvh, node.left_child() as usize, k, out);
        self.expand(bvh, node.right_child() as usize, WIDTH - k, out);
    }

    fn expand(&self, bvh: &BinaryBvh, n: usize, slots: usize, out: &mut Vec<usize>) {
        if slots == 1 {
            out.push(n);
            return;
        }
        // Granting fewer slots was just as good: the node stays one unit.
        if self.cost[n][slots - 1] == self.cost[n][slots - 2] {
            self.expand(bvh, n, slots - 1, out);
            return;
        }
        let node = &bvh.nodes[n];
        let (_, k) = self.distribute(node.left_child() as usize, node.right_child() as usize, slots);
        self.expand(bvh, node.left_child() as usize, k, out);
        self.expand(bvh, node.right_child() as usize, slots - k, out);
    }

    /// Emit the wide node for binary node `n` (which the tables decided to
    /// keep as an interior node) and, recursively, its interior children.
    fn emit_wide(&mut self, bvh: &BinaryBvh, n: usize) -> u32 {
        let wide_idx = self.wide.len() as u32;
        self.wide.push(WideNode {
            aabb: bvh.nodes[n].aabb,
            children: [WideChild::Empty; WIDTH],
        });

        let mut units = Vec::with_capacity(WIDTH);
        self.expand_root(bvh, n, &mut units);
        debug_assert!(units.len() <= WIDTH);

        let mut children = [WideChild::Empty; WIDTH];
        for (slot, &unit) in units.iter().enumerate() {
            let node = &bvh.nodes[unit];
            let area = node.aabb.area();
            let (first, count) = self.ranges[unit];

            let leaf_cost = if node.is_leaf() || count <= self.params.max_leaf_size {
                area * count as f32 * self.params.face_intersection_cost
            } else {
                INF
            };

            children[slot] = if node.is_leaf() || leaf_cost <= self.cost[unit][0] {
                WideChild::Leaf {
                    first_face: first,
                    face_count: count,
                    aabb: node.aabb,
                }
            } else {
                WideChild::Interior {
                    node: self.emit_wide(bvh, unit),
                    aabb: node.aabb,
                }
            };
        }

        self.wide[wide_idx as usize].children = children;
        wide_idx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bvh::builder::{self, BuildParams};
    use crate::scene::{Face, Vertex};
    use glam::Vec3;

    fn grid_mesh(n: usize) -> (Vec<Face>, Vec<Vertex>) {
        // n x n unit quads in the XZ plane, two triangles each.
        let mut vertices = Vec::new();
        let mut faces = Vec::new();
        for i in 0..n {
            for j in 0..n {
                let base = vertices.len() as u32;
                let (x, z) = (i as f32, j as f32);
                for (dx, dz) in [(0.0, 0.0), (1.0, 0.0), (0.0, 1.0), (1.0, 1.0)] {
                    vertices.push(Vertex {
                        pos: [x + dx, (i + j) as f32 * 0.1, z + dz],
                        norm: [0.0, 1.0, 0.0],
                        uv: [dx, dz],
                    });
                }
                faces.push(Face { v: [base, base + 1, base + 2], mat_index: 0 });
                faces.push(Face { v: [base + 1, base + 3, base + 2], mat_index: 0 });
            }
        }
        (faces, vertices)
    }

    fn build_wide(n: usize) -> WideBvh {
        let (faces, vertices) = grid_mesh(n);
        let binary = builder::build(&BuildParams::default(), &faces, &vertices).unwrap();
        collapse(&CollapseParams::default(), binary).unwrap()
    }

    #[test]
    fn test_wide_nodes_respect_bounds() {
        let wide = build_wide(6);
        let params = CollapseParams::default();

        for node in &wide.nodes {
            let mut non_empty = 0;
            for child in &node.children {
                match child {
                    WideChild::Empty => {}
                    WideChild::Interior { node, aabb } => {
                        non_empty += 1;
                        assert!((*node as usize) < wide.nodes.len());
                        assert!(!aabb.is_empty());
                    }
                    WideChild::Leaf { face_count, .. } => {
                        non_empty += 1;
                        assert!(*face_count >= 1);
                        assert!(*face_count <= params.max_leaf_size);
                    }
                }
            }
            assert!(non_empty >= 1);
            assert!(non_empty <= 8);
        }
    }

    #[test]
    fn test_leaves_cover_all_faces_once() {
        let wide = build_wide(5);
        let mut covered = vec![0u32; wide.faces.len()];
        for node in &wide.nodes {
            for child in &node.children {
                if let WideChild::Leaf { first_face, face_count, .. } = child {
                    for f in *first_face..*first_face + *face_count {
                        covered[f as usize] += 1;
                    }
                }
            }
        }
        assert!(covered.iter().all(|&c| c == 1));
    }

    #[test]
    fn test_children_contained_in_parent() {
        let wide = build_wide(4);
        for node in &wide.nodes {
            for child in &node.children {
                if let Some(aabb) = child.aabb() {
                    assert!(node.aabb.min.cmple(aabb.min + Vec3::splat(1e-6)).all());
                    assert!(node.aabb.max.cmpge(aabb.max - Vec3::splat(1e-6)).all());
                }
            }
        }
    }

    #[test]
    fn test_single_leaf_tree() {
        let (faces, vertices) = grid_mesh(1);
        // Keep both triangles in one leaf: generous leaf bound, tiny cost.
        let params = BuildParams {
            leaf_max_face_count: 4,
            ..Default::default()
        };
        let binary = builder::build(&params, &faces[..1], &vertices).unwrap();
        let wide = collapse(&CollapseParams::default(), binary).unwrap();
        assert_eq!(wide.nodes.len(), 1);
        assert!(matches!(wide.nodes[0].children[0], WideChild::Leaf { .. }));
    }
}
