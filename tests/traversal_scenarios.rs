//! Canonical single-triangle query scenarios against the full
//! build/collapse/compress pipeline.

use gatling::bvh::builder::{self, BuildParams};
use gatling::bvh::collapse::{self, CollapseParams};
use gatling::bvh::compress::{self, CompressedBvh};
use gatling::scene::{Face, Vertex};
use gatling::trace::{Ray, INVALID_FACE_INDEX};
use glam::Vec3;

fn unit_triangle() -> (CompressedBvh, Vec<Vertex>) {
    let vertices = vec![
        Vertex {
            pos: [0.0, 0.0, 0.0],
            norm: [0.0, 0.0, -1.0],
            uv: [0.0, 0.0],
        },
        Vertex {
            pos: [1.0, 0.0, 0.0],
            norm: [0.0, 0.0, -1.0],
            uv: [1.0, 0.0],
        },
        Vertex {
            pos: [0.0, 1.0, 0.0],
            norm: [0.0, 0.0, -1.0],
            uv: [0.0, 1.0],
        },
    ];
    let faces = vec![Face {
        v: [0, 1, 2],
        mat_index: 0,
    }];

    let binary = builder::build(&BuildParams::default(), &faces, &vertices).unwrap();
    let wide = collapse::collapse(&CollapseParams::default(), binary).unwrap();
    (compress::compress(wide), vertices)
}

#[test]
fn single_triangle_hit() {
    let (bvh, vertices) = unit_triangle();

    let mut ray = Ray::new(Vec3::new(0.25, 0.25, -1.0), Vec3::new(0.0, 0.0, 1.0));
    ray.tmax = 1e9;

    let hit = bvh.find_hit_closest(&vertices, ray).expect("ray must hit");
    assert!((hit.t - 1.0).abs() < 1e-5);
    assert!((hit.u - 0.25).abs() < 1e-5);
    assert!((hit.v - 0.25).abs() < 1e-5);
    assert_eq!(hit.face_index, 0);
    assert_ne!(hit.face_index, INVALID_FACE_INDEX);
}

#[test]
fn single_triangle_miss() {
    let (bvh, vertices) = unit_triangle();

    let mut ray = Ray::new(Vec3::new(-1.0, -1.0, -1.0), Vec3::new(1.0, 0.0, 0.0));
    ray.tmax = 1e9;

    assert!(bvh.find_hit_closest(&vertices, ray).is_none());
    assert!(!bvh.find_hit_any(&vertices, ray));
}

#[test]
fn grazing_rays_agree_with_direct_test() {
    let (bvh, vertices) = unit_triangle();

    // Rays around the triangle edges: traversal may never reject a ray the
    // plain triangle test accepts.
    for (ox, oy) in [
        (0.0, 0.0),
        (0.5, 0.49),
        (0.99, 0.0),
        (0.0, 0.99),
        (0.5, 0.51),
        (1.01, 0.0),
        (-0.01, 0.5),
    ] {
        let mut ray = Ray::new(Vec3::new(ox, oy, -1.0), Vec3::new(0.0, 0.0, 1.0));
        ray.tmax = 1e9;

        let direct = gatling::trace::intersect_triangle(
            &ray,
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(0.0, 1.0, 0.0),
        );
        let traversed = bvh.find_hit_closest(&vertices, ray);
        assert_eq!(
            direct.is_some(),
            traversed.is_some(),
            "disagreement at origin ({ox}, {oy})"
        );
    }
}
