//! Bounding-volume hierarchy construction pipeline.
//!
//! A scene's faces pass through three stages before they reach the GPU:
//!
//! 1. [`builder`] - top-down SAH construction of a binary BVH, with spatial
//!    splits when child overlap is high.
//! 2. [`collapse`] - cost-driven merging of the binary tree into a wide BVH
//!    with up to eight children per interior node.
//! 3. [`compress`] - quantisation of the wide BVH into the fixed 80-byte
//!    node encoding the traversal kernel consumes.
//!
//! Nodes are arena-allocated and addressed by `u32` indices throughout;
//! child and face references are indices, never pointers.

pub mod builder;
pub mod collapse;
pub mod compress;

use glam::Vec3;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BvhError {
    /// A face refers to a vertex index outside the vertex table.
    #[error("face {face} refers to out-of-range vertex index {index}")]
    FaceIndexOutOfRange { face: u32, index: u32 },

    /// Spatial-split duplication would exceed the face-buffer reservation.
    /// Retry with a larger `spatial_reserve_factor`.
    #[error("face duplication exceeds the reservation of {reserved} faces")]
    OutOfReservation { reserved: usize },

    /// Nothing to build: every input face was degenerate or absent.
    #[error("no usable faces in input")]
    EmptyInput,
}

/// Axis-aligned bounding box.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Default for Aabb {
    /// The inverted-empty box, not the zero box.
    fn default() -> Self {
        Aabb::EMPTY
    }
}

impl Aabb {
    /// Inverted-empty box; the identity for [`Aabb::union`].
    pub const EMPTY: Self = Self {
        min: Vec3::splat(f32::INFINITY),
        max: Vec3::splat(f32::NEG_INFINITY),
    };

    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    pub fn from_points(a: Vec3, b: Vec3, c: Vec3) -> Self {
        Self {
            min: a.min(b).min(c),
            max: a.max(b).max(c),
        }
    }

    pub fn union(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    pub fn grow(&mut self, point: Vec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }

    pub fn intersection(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: self.min.max(other.min),
            max: self.max.min(other.max),
        }
    }

    pub fn extent(&self) -> Vec3 {
        (self.max - self.min).max(Vec3::ZERO)
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Surface area; zero for inverted boxes since the extent clamps at zero.
    pub fn area(&self) -> f32 {
        let e = self.extent();
        2.0 * (e.x * e.y + e.y * e.z + e.z * e.x)
    }

    /// True if the two boxes share any volume, area or point.
    pub fn overlaps(&self, other: &Aabb) -> bool {
        let i = self.intersection(other);
        i.min.cmple(i.max).all()
    }

    pub fn largest_axis(&self) -> usize {
        let e = self.extent();
        if e.y > e.x {
            if e.z > e.y {
                2
            } else {
                1
            }
        } else if e.z > e.x {
            2
        } else {
            0
        }
    }

    pub fn is_empty(&self) -> bool {
        self.min.cmpgt(self.max).any()
    }
}

/// Binary BVH node. `count == 0` marks an interior node whose children are
/// the adjacent pair starting at `first`; otherwise `first`/`count` is a
/// face range.
#[derive(Clone, Copy, Debug)]
pub struct BinaryNode {
    pub aabb: Aabb,
    pub first: u32,
    pub count: u32,
}

impl BinaryNode {
    pub fn is_leaf(&self) -> bool {
        self.count > 0
    }

    pub fn left_child(&self) -> u32 {
        self.first
    }

    pub fn right_child(&self) -> u32 {
        self.first + 1
    }
}

/// Binary BVH over a reorganised (and, with spatial splits, partially
/// duplicated) face buffer.
#[derive(Debug)]
pub struct BinaryBvh {
    pub nodes: Vec<BinaryNode>,
    /// Faces in leaf-emission order; every subtree owns a contiguous range.
    pub faces: Vec<crate::scene::Face>,
    pub aabb: Aabb,
}

/// One of up to eight children of a wide-BVH node.
#[derive(Clone, Copy, Debug, Default)]
pub enum WideChild {
    #[default]
    Empty,
    Interior {
        node: u32,
        aabb: Aabb,
    },
    Leaf {
        first_face: u32,
        face_count: u32,
        aabb: Aabb,
    },
}

impl WideChild {
    pub fn aabb(&self) -> Option<&Aabb> {
        match self {
            WideChild::Empty => None,
            WideChild::Interior { aabb, .. } | WideChild::Leaf { aabb, .. } => Some(aabb),
        }
    }
}

#[derive(Clone, Debug)]
pub struct WideNode {
    pub aabb: Aabb,
    pub children: [WideChild; 8],
}

/// Wide BVH sharing the binary BVH's face buffer.
pub struct WideBvh {
    pub nodes: Vec<WideNode>,
    pub faces: Vec<crate::scene::Face>,
    pub aabb: Aabb,
}
