//! Top-down SAH construction of a binary BVH with spatial splits.
//!
//! Object splits bin face centroids along the longest centroid axis and
//! sweep for the SAH minimum; small ranges fall back to an exact sorted
//! sweep. When the best object split leaves heavily overlapping children,
//! a spatial split is evaluated as well: faces are distributed over bins
//! along the axis with their boxes clipped to the bin planes, and faces
//! straddling the winning plane are duplicated into both children. The
//! total number of face references is bounded by the caller's reservation
//! factor; running out reports an error before anything overflows.

use glam::Vec3;

use super::{Aabb, BinaryBvh, BinaryNode, BvhError};
use crate::scene::{Face, Vertex};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinningMode {
    /// Always use `object_bin_count` bins.
    Fixed,
    /// Scale the bin count down with the size of the face range.
    Adaptive,
}

#[derive(Clone, Copy, Debug)]
pub struct BuildParams {
    /// Faces are costed in batches of this size (leaf sizes round up to it).
    pub face_batch_size: u32,
    /// Hard upper bound on faces per leaf.
    pub leaf_max_face_count: u32,
    pub face_intersection_cost: f32,
    pub object_binning_mode: BinningMode,
    /// Ranges smaller than this are split with an exact sweep over every
    /// centroid instead of binning.
    pub object_binning_threshold: u32,
    pub object_bin_count: u32,
    pub spatial_bin_count: u32,
    /// The face buffer is reserved at `input faces x this factor`; spatial
    /// splits may duplicate faces into the slack.
    pub spatial_reserve_factor: f32,
    /// A spatial split is tried when the object split's child overlap area
    /// relative to the root surface area exceeds this.
    pub spatial_split_alpha: f32,
}

impl Default for BuildParams {
    fn default() -> Self {
        Self {
            face_batch_size: 1,
            leaf_max_face_count: 1,
            face_intersection_cost: 1.2,
            object_binning_mode: BinningMode::Fixed,
            object_binning_threshold: 1024,
            object_bin_count: 16,
            spatial_bin_count: 32,
            spatial_reserve_factor: 1.25,
            spatial_split_alpha: 1.0e-4,
        }
    }
}

/// One reference to an input face; spatial splits clip the box and duplicate
/// the reference, never the face itself.
#[derive(Clone, Copy)]
struct FaceRef {
    aabb: Aabb,
    centroid: Vec3,
    face: u32,
}

#[derive(Clone, Copy, Default)]
struct Bin {
    aabb: Aabb,
    count: u32,
}

struct Split {
    cost: f32,
    kind: SplitKind,
}

#[derive(Clone, Copy)]
enum SplitKind {
    /// Partition by bin index (or sorted position) on `axis`.
    Object { axis: usize, threshold: f32 },
    /// Partition by `plane` on `axis`, duplicating straddlers.
    Spatial { axis: usize, plane: f32 },
}

struct Builder<'a> {
    params: BuildParams,
    faces: &'a [Face],
    nodes: Vec<BinaryNode>,
    out_faces: Vec<Face>,
    /// Face references alive across every pending subtree.
    live_refs: usize,
    reserved: usize,
    root_area: f32,
}

/// Build a binary BVH over `faces`. The returned hierarchy references a
/// reorganised copy of the face buffer.
pub fn build(
    params: &BuildParams,
    faces: &[Face],
    vertices: &[Vertex],
) -> Result<BinaryBvh, BvhError> {
    let mut refs = Vec::with_capacity(faces.len());
    let mut dropped = 0usize;

    for (i, face) in faces.iter().enumerate() {
        for &v in &face.v {
            if v as usize >= vertices.len() {
                return Err(BvhError::FaceIndexOutOfRange {
                    face: i as u32,
                    index: v,
                });
            }
        }
        if face.is_degenerate() {
            dropped += 1;
            continue;
        }

        let p0 = Vec3::from(vertices[face.v[0] as usize].pos);
        let p1 = Vec3::from(vertices[face.v[1] as usize].pos);
        let p2 = Vec3::from(vertices[face.v[2] as usize].pos);
        let aabb = Aabb::from_points(p0, p1, p2);
        if aabb.extent() == Vec3::ZERO {
            dropped += 1;
            continue;
        }

        refs.push(FaceRef {
            aabb,
            centroid: aabb.center(),
            face: i as u32,
        });
    }

    if dropped > 0 {
        log::warn!("dropped {dropped} degenerate faces during hierarchy construction");
    }
    if refs.is_empty() {
        return Err(BvhError::EmptyInput);
    }

    let aabb = refs
        .iter()
        .fold(Aabb::EMPTY, |acc, r| acc.union(&r.aabb));

    let reserved = ((refs.len() as f64) * (params.spatial_reserve_factor as f64)).ceil() as usize;
    let mut builder = Builder {
        params: *params,
        faces,
        nodes: Vec::with_capacity(refs.len() * 2),
        out_faces: Vec::with_capacity(reserved),
        live_refs: refs.len(),
        reserved,
        root_area: aabb.area().max(f32::MIN_POSITIVE),
    };

    builder.nodes.push(BinaryNode {
        aabb,
        first: 0,
        count: 0,
    });
    builder.build_node(refs, aabb, 0)?;

    Ok(BinaryBvh {
        nodes: builder.nodes,
        faces: builder.out_faces,
        aabb,
    })
}

impl Builder<'_> {
    fn leaf_cost(&self, count: usize) -> f32 {
        let batch = self.params.face_batch_size.max(1) as usize;
        (count.div_ceil(batch) * batch) as f32 * self.params.face_intersection_cost
    }

    fn build_node(
        &mut self,
        refs: Vec<FaceRef>,
        aabb: Aabb,
        node_idx: usize,
    ) -> Result<(), BvhError> {
        let count = refs.len();
        let fits_leaf = count as u32 <= self.params.leaf_max_face_count.max(1);

        let split = self.find_best_split(&refs, &aabb);

        let make_leaf = match &split {
            _ if count == 1 => true,
            None => fits_leaf,
            Some(split) => fits_leaf && split.cost >= self.leaf_cost(count),
        };

        if make_leaf && fits_leaf {
            self.emit_leaf(refs, aabb, node_idx);
            return Ok(());
        }

        let (left, right) = match split {
            Some(split) => self.partition(refs, &split)?,
            // All centroids coincide; an even median split always succeeds.
            None => median_partition(refs, aabb.largest_axis()),
        };

        let left_aabb = subset_aabb(&left);
        let right_aabb = subset_aabb(&right);

        let left_idx = self.nodes.len();
        self.nodes.push(BinaryNode {
            aabb: left_aabb,
            first: 0,
            count: 0,
        });
        self.nodes.push(BinaryNode {
            aabb: right_aabb,
            first: 0,
            count: 0,
        });
        self.nodes[node_idx] = BinaryNode {
            aabb,
            first: left_idx as u32,
            count: 0,
        };

        self.build_node(left, left_aabb, left_idx)?;
        self.build_node(right, right_aabb, left_idx + 1)
    }

    fn emit_leaf(&mut self, refs: Vec<FaceRef>, aabb: Aabb, node_idx: usize) {
        let first = self.out_faces.len() as u32;
        let count = refs.len() as u32;
        let faces = self.faces;
        self.out_faces
            .extend(refs.iter().map(|r| faces[r.face as usize]));
        self.nodes[node_idx] = BinaryNode { aabb, first, count };
    }

    /// Best object split, upgraded to a spatial split when child overlap
    /// relative to the root is above the alpha threshold.
    fn find_best_split(&self, refs: &[FaceRef], aabb: &Aabb) -> Option<Split> {
        if refs.len() < 2 {
            return None;
        }

        let object = self.find_object_split(refs)?;

        if let SplitKind::Object { .. } = object.kind {
            let (l, r) = trial_bounds(refs, &object);
            let overlap = l.intersection(&r);
            if !overlap.is_empty() && overlap.area() / self.root_area > self.params.spatial_split_alpha
            {
                if let Some(spatial) = self.find_spatial_split(refs, aabb) {
                    if spatial.cost < object.cost {
                        return Some(spatial);
                    }
                }
            }
        }

        Some(object)
    }

    fn find_object_split(&self, refs: &[FaceRef]) -> Option<Split> {
        let mut centroid_bounds = Aabb::EMPTY;
        for r in refs {
            centroid_bounds.grow(r.centroid);
        }
        let axis = centroid_bounds.largest_axis();
        let extent = centroid_bounds.extent()[axis];
        if extent <= 0.0 {
            return None;
        }

        if (refs.len() as u32) < self.params.object_binning_threshold {
            return self.sweep_object_split(refs, axis);
        }

        let bin_count = match self.params.object_binning_mode {
            BinningMode::Fixed => self.params.object_bin_count as usize,
            BinningMode::Adaptive => ((refs.len() as f32).sqrt() as usize)
                .clamp(4, self.params.object_bin_count as usize),
        };

        let min = centroid_bounds.min[axis];
        let scale = bin_count as f32 / extent;
        let bin_of = |c: f32| (((c - min) * scale) as usize).min(bin_count - 1);

        let mut bins = vec![Bin::default(); bin_count];
        for r in refs {
            let bin = &mut bins[bin_of(r.centroid[axis])];
            bin.count += 1;
            bin.aabb = bin.aabb.union(&r.aabb);
        }

        // Sweep: suffix pass first, then walk left accumulating the prefix.
        let mut right_area = vec![0.0f32; bin_count];
        let mut right_count = vec![0u32; bin_count];
        let mut acc = Aabb::EMPTY;
        let mut n = 0u32;
        for i in (0..bin_count).rev() {
            acc = acc.union(&bins[i].aabb);
            n += bins[i].count;
            right_area[i] = acc.area();
            right_count[i] = n;
        }

        let node_area = subset_aabb(refs).area().max(f32::MIN_POSITIVE);
        let mut best: Option<(f32, usize)> = None;
        let mut left = Aabb::EMPTY;
        let mut left_count = 0u32;
        for i in 0..bin_count - 1 {
            left = left.union(&bins[i].aabb);
            left_count += bins[i].count;
            let rc = right_count[i + 1];
            if left_count == 0 || rc == 0 {
                continue;
            }
            let cost = (left.area() * left_count as f32 + right_area[i + 1] * rc as f32)
                / node_area
                * self.params.face_intersection_cost;
            if best.map_or(true, |(c, _)| cost < c) {
                best = Some((cost, i));
            }
        }

        best.map(|(cost, i)| Split {
            cost,
            kind: SplitKind::Object {
                axis,
                threshold: min + (i + 1) as f32 / scale,
            },
        })
    }

    /// Exact SAH sweep over sorted centroids, for small ranges.
    fn sweep_object_split(&self, refs: &[FaceRef], axis: usize) -> Option<Split> {
        let mut order: Vec<&FaceRef> = refs.iter().collect();
        order.sort_unstable_by(|a, b| a.centroid[axis].total_cmp(&b.centroid[axis]));

        let n = order.len();
        let mut right_area = vec![0.0f32; n];
        let mut acc = Aabb::EMPTY;
        for i in (1..n).rev() {
            acc = acc.union(&order[i].aabb);
            right_area[i] = acc.area();
        }

        let node_area = subset_aabb(refs).area().max(f32::MIN_POSITIVE);
        let mut best: Option<(f32, usize)> = None;
        let mut left = Aabb::EMPTY;
        for i in 0..n - 1 {
            left = left.union(&order[i].aabb);
            let cost = (left.area() * (i + 1) as f32 + right_area[i + 1] * (n - i - 1) as f32)
                / node_area
                * self.params.face_intersection_cost;
            if best.map_or(true, |(c, _)| cost < c) {
                best = Some((cost, i));
            }
        }

        best.and_then(|(cost, i)| {
            // Partition by value; fail over to the median split if the
            // boundary centroids are identical.
            let threshold = order[i + 1].centroid[axis];
            if order[i].centroid[axis] == threshold {
                return None;
            }
            Some(Split {
                cost,
                kind: SplitKind::Object { axis, threshold },
            })
        })
    }

    fn find_spatial_split(&self, refs: &[FaceRef], aabb: &Aabb) -> Option<Split> {
        let axis = aabb.largest_axis();
        let min = aabb.min[axis];
        let extent = aabb.extent()[axis];
        if extent <= 0.0 {
            return None;
        }

        let bin_count = self.params.spatial_bin_count as usize;
        let width = extent / bin_count as f32;
        let bin_of = |x: f32| (((x - min) / width) as usize).min(bin_count - 1);

        let mut bins = vec![Bin::default(); bin_count];
        let mut entries = vec![0u32; bin_count];
        let mut exits = vec![0u32; bin_count];

        for r in refs {
            let b0 = bin_of(r.aabb.min[axis]);
            let b1 = bin_of(r.aabb.max[axis]).max(b0);
            entries[b0] += 1;
            exits[b1] += 1;
            for b in b0..=b1 {
                // Clip the face box to the bin's slab.
                let mut clipped = r.aabb;
                clipped.min[axis] = clipped.min[axis].max(min + b as f32 * width);
                clipped.max[axis] = clipped.max[axis].min(min + (b + 1) as f32 * width);
                bins[b].aabb = bins[b].aabb.union(&clipped);
            }
        }

        let mut right_area = vec![0.0f32; bin_count];
        let mut right_count = vec![0u32; bin_count];
        let mut acc = Aabb::EMPTY;
        let mut n = 0u32;
        for i in (0..bin_count).rev() {
            acc = acc.union(&bins[i].aabb);
            n += exits[i];
            right_area[i] = acc.area();
            right_count[i] = n;
        }

        let node_area = aabb.area().max(f32::MIN_POSITIVE);
        let mut best: Option<(f32, usize)> = None;
        let mut left = Aabb::EMPTY;
        let mut left_count = 0u32;
        for i in 0..bin_count - 1 {
            left = left.union(&bins[i].aabb);
            left_count += entries[i];
            let rc = right_count[i + 1];
            if left_count == 0 || rc == 0 {
                continue;
            }
            let cost = (left.area() * left_count as f32 + right_area[i + 1] * rc as f32)
                / node_area
                * self.params.face_intersection_cost;
            if best.map_or(true, |(c, _)| cost < c) {
                best = Some((cost, i));
            }
        }

        best.map(|(cost, i)| Split {
            cost,
            kind: SplitKind::Spatial {
                axis,
                plane: min + (i + 1) as f32 * width,
            },
        })
    }

    fn partition(
        &mut self,
        refs: Vec<FaceRef>,
        split: &Split,
    ) -> Result<(Vec<FaceRef>, Vec<FaceRef>), BvhError> {
        match split.kind {
            SplitKind::Object { axis, threshold } => {
                let (left, right): (Vec<_>, Vec<_>) = refs
                    .into_iter()
                    .partition(|r| r.centroid[axis] < threshold);
                if left.is_empty() || right.is_empty() {
                    // Binning boundaries can collapse under fp round-off.
                    let mut all = left;
                    all.extend(right);
                    return Ok(median_partition(all, axis));
                }
                Ok((left, right))
            }
            SplitKind::Spatial { axis, plane } => {
                let mut left = Vec::with_capacity(refs.len());
                let mut right = Vec::with_capacity(refs.len());
                for r in refs {
                    if r.aabb.max[axis] <= plane {
                        left.push(r);
                    } else if r.aabb.min[axis] >= plane {
                        right.push(r);
                    } else {
                        // Straddler: duplicate the reference with the box
                        // clipped to each side of the plane.
                        if self.live_refs + 1 > self.reserved {
                            return Err(BvhError::OutOfReservation {
                                reserved: self.reserved,
                            });
                        }
                        self.live_refs += 1;

                        let mut l = r;
                        l.aabb.max[axis] = plane;
                        l.centroid = l.aabb.center();
                        let mut rt = r;
                        rt.aabb.min[axis] = plane;
                        rt.centroid = rt.aabb.center();
                        left.push(l);
                        right.push(rt);
                    }
                }
                if left.is_empty() || right.is_empty() {
                    let mut all = left;
                    all.extend(right);
                    return Ok(median_partition(all, axis));
                }
                Ok((left, right))
            }
        }
    }
}

fn subset_aabb(refs: &[FaceRef]) -> Aabb {
    refs.iter().fold(Aabb::EMPTY, |acc, r| acc.union(&r.aabb))
}

/// Child bounds an object split would produce, for the overlap test.
fn trial_bounds(refs: &[FaceRef], split: &Split) -> (Aabb, Aabb) {
    let SplitKind::Object { axis, threshold } = split.kind else {
        return (Aabb::EMPTY, Aabb::EMPTY);
    };
    let mut left = Aabb::EMPTY;
    let mut right = Aabb::EMPTY;
    for r in refs {
        if r.centroid[axis] < threshold {
            left = left.union(&r.aabb);
        } else {
            right = right.union(&r.aabb);
        }
    }
    (left, right)
}

fn median_partition(mut refs: Vec<FaceRef>, axis: usize) -> (Vec<FaceRef>, Vec<FaceRef>) {
    let mid = refs.len() / 2;
    refs.sort_unstable_by(|a, b| a.centroid[axis].total_cmp(&b.centroid[axis]));
    let right = refs.split_off(mid);
    (refs, right)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad_vertices() -> Vec<Vertex> {
        // Two triangles spanning the unit square in the XY plane, plus an
        // isolated triangle offset in +X.
        let positions = [
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [1.0, 1.0, 0.0],
            [3.0, 0.0, 0.0],
            [4.0, 0.0, 0.0],
            [3.0, 1.0, 0.0],
        ];
        positions
            .iter()
            .map(|p| Vertex {
                pos: *p,
                norm: [0.0, 0.0, 1.0],
                uv: [0.0, 0.0],
            })
            .collect()
    }

    fn faces() -> Vec<Face> {
        vec![
            Face { v: [0, 1, 2], mat_index: 0 },
            Face { v: [1, 3, 2], mat_index: 0 },
            Face { v: [4, 5, 6], mat_index: 1 },
        ]
    }

    #[test]
    fn test_build_small_scene() {
        let bvh = build(&BuildParams::default(), &faces(), &quad_vertices()).unwrap();

        // Every input face survives exactly once (no straddlers here).
        assert_eq!(bvh.faces.len(), 3);
        assert!(bvh.nodes.len() >= 3);
        assert_eq!(bvh.aabb.min, Vec3::new(0.0, 0.0, 0.0));
        assert_eq!(bvh.aabb.max, Vec3::new(4.0, 1.0, 0.0));

        // Leaves respect the hard face bound.
        for node in &bvh.nodes {
            if node.is_leaf() {
                assert!(node.count <= BuildParams::default().leaf_max_face_count);
            }
        }
    }

    #[test]
    fn test_degenerate_faces_dropped() {
        let mut all = faces();
        all.push(Face { v: [1, 1, 2], mat_index: 0 });
        let bvh = build(&BuildParams::default(), &all, &quad_vertices()).unwrap();
        assert_eq!(bvh.faces.len(), 3);
    }

    #[test]
    fn test_out_of_range_index_rejected() {
        let bad = vec![Face { v: [0, 1, 99], mat_index: 0 }];
        let err = build(&BuildParams::default(), &bad, &quad_vertices()).unwrap_err();
        assert!(matches!(err, BvhError::FaceIndexOutOfRange { index: 99, .. }));
    }

    #[test]
    fn test_all_degenerate_is_empty_input() {
        let bad = vec![Face { v: [0, 0, 0], mat_index: 0 }];
        let err = build(&BuildParams::default(), &bad, &quad_vertices()).unwrap_err();
        assert!(matches!(err, BvhError::EmptyInput));
    }

    #[test]
    fn test_subtree_face_ranges_are_contiguous() {
        let bvh = build(&BuildParams::default(), &faces(), &quad_vertices()).unwrap();

        // Depth-first leaf emission: walking leaves left to right must cover
        // the face buffer in order without gaps.
        fn walk(bvh: &BinaryBvh, node: usize, next: &mut u32) {
            let n = &bvh.nodes[node];
            if n.is_leaf() {
                assert_eq!(n.first, *next);
                *next += n.count;
            } else {
                walk(bvh, n.left_child() as usize, next);
                walk(bvh, n.right_child() as usize, next);
            }
        }
        let mut next = 0;
        walk(&bvh, 0, &mut next);
        assert_eq!(next as usize, bvh.faces.len());
    }
}
