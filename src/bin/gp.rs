//! Scene preprocessor: loads a Wavefront OBJ polygon soup, rebases it into
//! camera space, builds the compressed hierarchy and writes a `.gsd` scene.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use glam::Vec3;

use gatling::bvh::builder::{self, BuildParams};
use gatling::bvh::collapse::{self, CollapseParams};
use gatling::bvh::compress;
use gatling::bvh::BvhError;
use gatling::scene::writer::write_scene;
use gatling::scene::{safe_normalize, Camera, Face, Material, SceneData, Vertex};

const DEFAULT_IMAGE_WIDTH: u32 = 1200;
const DEFAULT_IMAGE_HEIGHT: u32 = 1200;
const DEFAULT_SR_FRONT: f32 = 1.0;
const DEFAULT_SR_BACK: f32 = 10.0;
const DEFAULT_SR_OUTSIDE_FRUSTUM: f32 = 100.0;

/// Attempts before giving up when spatial splits blow the reservation.
const RESERVE_RETRY_COUNT: u32 = 3;

struct ProgramOptions {
    input_path: PathBuf,
    output_path: PathBuf,
    image_width: u32,
    image_height: u32,
    sr_front: f32,
    sr_back: f32,
    sr_outside_frustum: f32,
}

fn print_usage() {
    eprintln!("Usage: gp <scene.obj> <scene.gsd> [options]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("--image-width        [default: {DEFAULT_IMAGE_WIDTH}]");
    eprintln!("--image-height       [default: {DEFAULT_IMAGE_HEIGHT}]");
    eprintln!("--sr-front           [default: {DEFAULT_SR_FRONT:.2}]");
    eprintln!("--sr-back            [default: {DEFAULT_SR_BACK:.2}]");
    eprintln!("--sr-outside-frustum [default: {DEFAULT_SR_OUTSIDE_FRUSTUM:.2}]");
}

fn parse_args(args: &[String]) -> Option<ProgramOptions> {
    if args.len() < 2 {
        return None;
    }

    let mut options = ProgramOptions {
        input_path: PathBuf::from(&args[0]),
        output_path: PathBuf::from(&args[1]),
        image_width: DEFAULT_IMAGE_WIDTH,
        image_height: DEFAULT_IMAGE_HEIGHT,
        sr_front: DEFAULT_SR_FRONT,
        sr_back: DEFAULT_SR_BACK,
        sr_outside_frustum: DEFAULT_SR_OUTSIDE_FRUSTUM,
    };

    for arg in &args[2..] {
        let (flag, value) = arg.split_once('=')?;
        match flag {
            "--image-width" => options.image_width = value.parse().ok()?,
            "--image-height" => options.image_height = value.parse().ok()?,
            "--sr-front" => options.sr_front = value.parse().ok()?,
            "--sr-back" => options.sr_back = value.parse().ok()?,
            "--sr-outside-frustum" => options.sr_outside_frustum = value.parse().ok()?,
            _ => return None,
        }
    }

    Some(options)
}

#[derive(Default)]
struct LoadedMesh {
    vertices: Vec<Vertex>,
    faces: Vec<Face>,
    materials: Vec<Material>,
}

/// Minimal Wavefront OBJ reader: positions, normals, texture coordinates,
/// triangulated faces and diffuse/emissive colours from the companion MTL.
/// Asset-import breadth beyond that is out of scope here.
fn load_obj(path: &Path) -> Result<LoadedMesh, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("unable to read '{}': {e}", path.display()))?;

    let mut positions: Vec<Vec3> = Vec::new();
    let mut normals: Vec<Vec3> = Vec::new();
    let mut uvs: Vec<[f32; 2]> = Vec::new();

    let mut mesh = LoadedMesh::default();
    // Index 0 is the implicit default surface.
    mesh.materials.push(Material::diffuse(0.18, 0.18, 0.18));
    let mut material_indices: HashMap<String, u32> = HashMap::new();
    let mut current_material = 0u32;

    // One output vertex per distinct position/uv/normal triple.
    let mut remap: HashMap<(u32, u32, u32), u32> = HashMap::new();

    let parse_f32s = |parts: &[&str], n: usize| -> Option<Vec<f32>> {
        if parts.len() < n {
            return None;
        }
        parts[..n].iter().map(|p| p.parse().ok()).collect()
    };

    let resolve = |index: i64, count: usize| -> Option<u32> {
        let resolved = if index > 0 {
            index - 1
        } else if index < 0 {
            count as i64 + index
        } else {
            return None;
        };
        (resolved >= 0 && (resolved as usize) < count).then_some(resolved as u32)
    };

    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        let mut parts = line.split_whitespace();
        let Some(keyword) = parts.next() else { continue };
        let rest: Vec<&str> = parts.collect();
        let bad_line = || format!("{}:{}: malformed '{keyword}'", path.display(), line_no + 1);

        match keyword {
            "v" => {
                let c = parse_f32s(&rest, 3).ok_or_else(bad_line)?;
                positions.push(Vec3::new(c[0], c[1], c[2]));
            }
            "vn" => {
                let c = parse_f32s(&rest, 3).ok_or_else(bad_line)?;
                normals.push(Vec3::new(c[0], c[1], c[2]));
            }
            "vt" => {
                let c = parse_f32s(&rest, 2).ok_or_else(bad_line)?;
                uvs.push([c[0], c[1]]);
            }
            "f" => {
                let mut corner_ids = Vec::with_capacity(rest.len());
                for corner in &rest {
                    let mut it = corner.split('/');
                    let vi: i64 = it.next().and_then(|s| s.parse().ok()).ok_or_else(bad_line)?;
                    let ti: Option<i64> = it.next().and_then(|s| s.parse().ok());
                    let ni: Option<i64> = it.next().and_then(|s| s.parse().ok());

                    let v = resolve(vi, positions.len()).ok_or_else(bad_line)?;
                    let t = ti.and_then(|t| resolve(t, uvs.len()));
                    let n = ni.and_then(|n| resolve(n, normals.len()));

                    let key = (v, t.map_or(u32::MAX, |t| t), n.map_or(u32::MAX, |n| n));
                    let id = *remap.entry(key).or_insert_with(|| {
                        mesh.vertices.push(Vertex {
                            pos: positions[v as usize].to_array(),
                            // Zero marks "no authored normal"; filled in
                            // from face geometry after loading.
                            norm: n
                                .map(|n| safe_normalize(normals[n as usize]).to_array())
                                .unwrap_or([0.0, 0.0, 0.0]),
                            uv: t.map(|t| uvs[t as usize]).unwrap_or([0.0, 0.0]),
                        });
                        mesh.vertices.len() as u32 - 1
                    });
                    corner_ids.push(id);
                }

                // Triangulate the polygon as a fan.
                for i in 1..corner_ids.len().saturating_sub(1) {
                    mesh.faces.push(Face {
                        v: [corner_ids[0], corner_ids[i], corner_ids[i + 1]],
                        mat_index: current_material,
                    });
                }
            }
            "usemtl" => {
                let name = rest.first().copied().unwrap_or_default();
                current_material = material_indices.get(name).copied().unwrap_or(0);
            }
            "mtllib" => {
                let name = rest.first().copied().unwrap_or_default();
                let mtl_path = path.parent().unwrap_or(Path::new(".")).join(name);
                match std::fs::read_to_string(&mtl_path) {
                    Ok(mtl) => load_mtl(&mtl, &mut mesh.materials, &mut material_indices),
                    Err(e) => log::warn!("ignoring material library '{}': {e}", mtl_path.display()),
                }
            }
            _ => {}
        }
    }

    if mesh.faces.is_empty() {
        return Err(format!("'{}' contains no faces", path.display()));
    }

    // Faces without authored normals get a geometric one.
    fill_missing_normals(&mut mesh);

    Ok(mesh)
}

fn load_mtl(text: &str, materials: &mut Vec<Material>, indices: &mut HashMap<String, u32>) {
    let mut current: Option<usize> = None;

    for line in text.lines() {
        let mut parts = line.trim().split_whitespace();
        let Some(keyword) = parts.next() else { continue };
        let rest: Vec<&str> = parts.collect();

        match keyword {
            "newmtl" => {
                let name = rest.first().copied().unwrap_or_default().to_string();
                indices.insert(name, materials.len() as u32);
                current = Some(materials.len());
                materials.push(Material::diffuse(0.18, 0.18, 0.18));
            }
            "Kd" | "Ke" => {
                let Some(index) = current else { continue };
                let c: Vec<f32> = rest.iter().filter_map(|p| p.parse().ok()).collect();
                if c.len() >= 3 {
                    if keyword == "Kd" {
                        materials[index].albedo = [c[0], c[1], c[2]];
                    } else {
                        materials[index].emission = [c[0], c[1], c[2]];
                    }
                }
            }
            _ => {}
        }
    }
}

/// Give vertices without an authored normal the geometric normal of the
/// first face that references them.
fn fill_missing_normals(mesh: &mut LoadedMesh) {
    for face in &mesh.faces {
        let p0 = Vec3::from(mesh.vertices[face.v[0] as usize].pos);
        let p1 = Vec3::from(mesh.vertices[face.v[1] as usize].pos);
        let p2 = Vec3::from(mesh.vertices[face.v[2] as usize].pos);
        let n = safe_normalize((p1 - p0).cross(p2 - p0));

        for &v in &face.v {
            let vertex = &mut mesh.vertices[v as usize];
            if vertex.norm == [0.0, 0.0, 0.0] {
                vertex.norm = n.to_array();
            }
        }
    }
}

/// Rebase the scene into camera space: positions and normals through the
/// view basis, the stored camera reset to the canonical frame.
fn rebase_to_camera_space(mesh: &mut LoadedMesh, camera: &mut Camera) {
    let origin = Vec3::from(camera.origin);
    let forward = safe_normalize(Vec3::from(camera.forward));
    let up = safe_normalize(Vec3::from(camera.up));
    let right = up.cross(forward);

    for vertex in &mut mesh.vertices {
        let p = Vec3::from(vertex.pos) - origin;
        vertex.pos = [p.dot(right), p.dot(up), p.dot(forward)];

        let n = Vec3::from(vertex.norm);
        vertex.norm = safe_normalize(Vec3::new(n.dot(right), n.dot(up), n.dot(forward))).to_array();
    }

    camera.origin = [0.0; 3];
    camera.forward = [0.0, 0.0, 1.0];
    camera.up = [0.0, 1.0, 0.0];
}

fn run(options: &ProgramOptions) -> Result<(), String> {
    log::debug!(
        "subdivision rates: front {}, back {}, outside frustum {}",
        options.sr_front,
        options.sr_back,
        options.sr_outside_frustum
    );

    let mut mesh = load_obj(&options.input_path)?;
    log::info!(
        "loaded {} faces, {} vertices, {} materials",
        mesh.faces.len(),
        mesh.vertices.len(),
        mesh.materials.len()
    );

    if mesh.faces.len() < 4 {
        return Err(format!(
            "scene has {} faces; at least 4 are required",
            mesh.faces.len()
        ));
    }

    // The OBJ carries no camera; start from the canonical one and keep the
    // geometry rebase explicit so authored cameras slot in trivially.
    let mut camera = Camera::default();
    rebase_to_camera_space(&mut mesh, &mut camera);

    // Build; on reservation overflow retry with a doubled reserve factor.
    let mut params = BuildParams::default();
    let binary = loop {
        match builder::build(&params, &mesh.faces, &mesh.vertices) {
            Ok(bvh) => break bvh,
            Err(BvhError::OutOfReservation { reserved })
                if params.spatial_reserve_factor
                    < BuildParams::default().spatial_reserve_factor
                        * (1 << RESERVE_RETRY_COUNT) as f32 =>
            {
                params.spatial_reserve_factor *= 2.0;
                log::warn!(
                    "face reservation of {reserved} exceeded; retrying with factor {}",
                    params.spatial_reserve_factor
                );
            }
            Err(e) => return Err(e.to_string()),
        }
    };

    let wide =
        collapse::collapse(&CollapseParams::default(), binary).map_err(|e| e.to_string())?;
    let compressed = compress::compress(wide);
    log::info!("hierarchy: {} compressed nodes", compressed.nodes.len());

    let scene = SceneData {
        image_width: options.image_width,
        image_height: options.image_height,
        aabb: compressed.aabb,
        camera,
        nodes: compressed.nodes,
        faces: compressed.faces,
        vertices: mesh.vertices,
        materials: mesh.materials,
    };

    write_scene(&scene, &options.output_path).map_err(|e| e.to_string())?;
    log::info!("wrote '{}'", options.output_path.display());
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(options) = parse_args(&args) else {
        print_usage();
        return ExitCode::FAILURE;
    };

    match run(&options) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("gp: {message}");
            ExitCode::FAILURE
        }
    }
}
