//! Lockstep traversal of many rays with triangle postponement.
//!
//! Rays are grouped into wavefronts and stepped together, one unit of work
//! per lane per round, the way a GPU subgroup executes the kernel. Before a
//! lane runs divergent triangle tests, the wavefront takes a ballot: when
//! the live-lane count has dropped below `postpone_ratio` of the count the
//! wavefront started with, pending face groups are pushed back so lanes
//! reconverge on coherent node work first. Postponement only ever reorders
//! work within a lane, so results are identical with it on or off.

use super::traversal::{FindMode, TraceGeometry, TraversalState};
use super::{Hit, Ray};
use crate::bvh::compress::CompressedBvh;
use crate::scene::Vertex;

#[derive(Clone, Copy, Debug)]
pub struct WavefrontParams {
    /// Lanes stepped in lockstep; sized like a GPU subgroup.
    pub lane_count: usize,
    /// Fraction of the initial live-lane count below which face work is
    /// deferred.
    pub postpone_ratio: f32,
    /// Compile-time toggle of the postponement branch.
    pub postponing: bool,
}

impl Default for WavefrontParams {
    fn default() -> Self {
        Self {
            lane_count: 32,
            postpone_ratio: 0.2,
            postponing: true,
        }
    }
}

/// Trace `rays` in wavefronts, returning the closest hit per ray.
pub fn trace_closest(
    bvh: &CompressedBvh,
    vertices: &[Vertex],
    rays: &[Ray],
    params: &WavefrontParams,
) -> Vec<Option<Hit>> {
    let geometry = TraceGeometry {
        nodes: &bvh.nodes,
        faces: &bvh.faces,
        vertices,
    };

    let lane_count = params.lane_count.max(1);
    let mut hits = Vec::with_capacity(rays.len());

    for chunk in rays.chunks(lane_count) {
        let mut lanes: Vec<TraversalState> = chunk
            .iter()
            .map(|ray| TraversalState::new(*ray, !bvh.nodes.is_empty()))
            .collect();
        let initial_active = lanes.len();

        loop {
            let active = lanes.iter().filter(|lane| !lane.finished()).count();
            if active == 0 {
                break;
            }

            // The ballot: one vote per round, applied to every lane that is
            // about to leave node traversal for triangle tests.
            let starved = params.postponing
                && (active as f32) < params.postpone_ratio * initial_active as f32;

            for lane in lanes.iter_mut().filter(|lane| !lane.finished()) {
                let postpone =
                    starved && lane.at_face_work() && lane.has_node_work() && lane.can_postpone();
                lane.step(&geometry, FindMode::Closest, postpone);
            }
        }

        hits.extend(lanes.into_iter().map(|lane| {
            (lane.hit.face_index != super::INVALID_FACE_INDEX).then_some(lane.hit)
        }));
    }

    hits
}
