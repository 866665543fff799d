//! Offline renderer: consumes a preprocessed `.gsd` scene, dispatches the
//! path-tracing kernel once and writes the result as a binary PPM image.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use gatling::gpu::{
    BufferBindingSlot, BufferUsage, Bindings, Device, MapMode, MemoryProperties, ShaderSource,
    WHOLE_SIZE,
};
use gatling::render::gamma;
use gatling::render::material::{
    CompiledShader, KernelCompiler, KernelConstants, MaterialCompiler,
};
use gatling::render::render_pass::PushConstants;
use gatling::render::{AovId, FeatureFlags};
use gatling::scene::reader::read_scene;
use gatling::trace::traversal_stack_bound;

const DEFAULT_SPP: u32 = 256;
const DEFAULT_MAX_BOUNCES: u32 = 4;
const DEFAULT_RR_BOUNCE_OFFSET: u32 = 3;
const DEFAULT_RR_INV_MIN_TERM_PROB: f32 = 1.0;

struct ProgramOptions {
    input_path: PathBuf,
    output_path: PathBuf,
    spp: u32,
    max_bounces: u32,
    rr_bounce_offset: u32,
    rr_inv_min_term_prob: f32,
}

fn print_usage() {
    eprintln!("Usage: gatling <scene.gsd> <output.ppm> [options]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("--spp                  [default: {DEFAULT_SPP}]");
    eprintln!("--max-bounces          [default: {DEFAULT_MAX_BOUNCES}]");
    eprintln!("--rr-bounce-offset     [default: {DEFAULT_RR_BOUNCE_OFFSET}]");
    eprintln!("--rr-inv-min-term-prob [default: {DEFAULT_RR_INV_MIN_TERM_PROB:.2}]");
}

fn parse_args(args: &[String]) -> Option<ProgramOptions> {
    if args.len() < 2 {
        return None;
    }

    let mut options = ProgramOptions {
        input_path: PathBuf::from(&args[0]),
        output_path: PathBuf::from(&args[1]),
        spp: DEFAULT_SPP,
        max_bounces: DEFAULT_MAX_BOUNCES,
        rr_bounce_offset: DEFAULT_RR_BOUNCE_OFFSET,
        rr_inv_min_term_prob: DEFAULT_RR_INV_MIN_TERM_PROB,
    };

    for arg in &args[2..] {
        let (flag, value) = arg.split_once('=')?;
        match flag {
            "--spp" => options.spp = value.parse().ok()?,
            "--max-bounces" => options.max_bounces = value.parse().ok()?,
            "--rr-bounce-offset" => options.rr_bounce_offset = value.parse().ok()?,
            "--rr-inv-min-term-prob" => options.rr_inv_min_term_prob = value.parse().ok()?,
            _ => return None,
        }
    }

    Some(options)
}

fn write_ppm(path: &Path, width: u32, height: u32, rgba: &[f32]) -> std::io::Result<()> {
    use std::io::Write;

    let mut bytes = Vec::with_capacity(width as usize * height as usize * 3 + 32);
    write!(&mut bytes, "P6\n{width} {height}\n255\n")?;
    for px in rgba.chunks_exact(4) {
        for c in &px[..3] {
            bytes.push((c.clamp(0.0, 1.0) * 255.0 + 0.5) as u8);
        }
    }
    std::fs::write(path, bytes)
}

fn run(options: &ProgramOptions) -> Result<(), String> {
    let scene = read_scene(&options.input_path).map_err(|e| e.to_string())?;
    log::info!(
        "scene: {} nodes, {} faces, {} vertices, {} materials",
        scene.nodes.len(),
        scene.faces.len(),
        scene.vertices.len(),
        scene.materials.len()
    );

    if Device::adapter_count() == 0 {
        return Err("no compute device found".into());
    }
    let mut device = Device::new(0).map_err(|e| e.to_string())?;

    let geometry = gatling::render::geom_cache::GeometryCache::upload(
        &mut device,
        &scene.nodes,
        &scene.faces,
        &scene.vertices,
        &scene.materials,
        scene.aabb,
    )
    .map_err(|e| e.to_string())?;

    // Pixel buffers and the kernel's queue scratch.
    let (width, height) = (scene.image_width, scene.image_height);
    let pixel_count = width as u64 * height as u64;
    let output_size = pixel_count * 16;
    let queue_size = 16 + pixel_count * 32;

    let create = |device: &mut Device, usage, memory, size| {
        device.create_buffer(usage, memory, size).map_err(|e| e.to_string())
    };
    let output_buffer = create(
        &mut device,
        BufferUsage::STORAGE | BufferUsage::TRANSFER_SRC,
        MemoryProperties::DEVICE_LOCAL,
        output_size,
    )?;
    let readback_buffer = create(
        &mut device,
        BufferUsage::TRANSFER_DST,
        MemoryProperties::HOST_VISIBLE | MemoryProperties::HOST_COHERENT | MemoryProperties::HOST_CACHED,
        output_size,
    )?;
    let path_queue = create(
        &mut device,
        BufferUsage::STORAGE,
        MemoryProperties::DEVICE_LOCAL,
        queue_size,
    )?;
    let hit_queue = create(
        &mut device,
        BufferUsage::STORAGE,
        MemoryProperties::DEVICE_LOCAL,
        queue_size,
    )?;
    let timestamp_buffer = create(
        &mut device,
        BufferUsage::TRANSFER_DST,
        MemoryProperties::HOST_VISIBLE | MemoryProperties::HOST_COHERENT | MemoryProperties::HOST_CACHED,
        32 * 8,
    )?;

    // Compile the kernel for this scene.
    let constants = KernelConstants {
        max_stack_size: traversal_stack_bound(scene.nodes.len() as u32).max(1),
        ..KernelConstants::default()
    };
    let features = FeatureFlags {
        progressive_accumulation: false,
        ..Default::default()
    };
    let compiled = KernelCompiler
        .compile(&scene.materials, AovId::Color, features, &constants)
        .map_err(|e| e.to_string())?;
    let shader = match &compiled {
        CompiledShader::Wgsl(source) => device.create_shader(ShaderSource::Wgsl(source.as_str())),
        CompiledShader::SpirV(words) => device.create_shader(ShaderSource::SpirV(words.as_slice())),
    }
    .map_err(|e| e.to_string())?;
    let pipeline = device
        .create_pipeline(shader, "Path Trace")
        .map_err(|e| e.to_string())?;
    let workgroup = device.pipeline(pipeline).map_err(|e| e.to_string())?.workgroup_size();

    // The stored horizontal fov covers the wider image axis.
    let aspect = width as f32 / height as f32;
    let hfov = scene.camera.hfov;
    let vfov = if aspect > 1.0 {
        hfov
    } else {
        2.0 * ((hfov * 0.5).tan() / aspect).atan()
    };

    let push = PushConstants {
        cam_origin: [
            scene.camera.origin[0],
            scene.camera.origin[1],
            scene.camera.origin[2],
            vfov,
        ],
        cam_forward: [
            scene.camera.forward[0],
            scene.camera.forward[1],
            scene.camera.forward[2],
            10.0,
        ],
        cam_up: [scene.camera.up[0], scene.camera.up[1], scene.camera.up[2], 0.0],
        background: [0.0, 0.0, 0.0, 1.0],
        image_size: [width, height],
        spp: options.spp,
        max_bounces: options.max_bounces,
        rr_bounce_offset: options.rr_bounce_offset,
        rr_inv_min_term_prob: options.rr_inv_min_term_prob,
        max_sample_value: 10.0,
        frame_index: 0,
        dome_light: 0,
        _pad: [0; 3],
    };

    type CmdHandle = gatling::gpu::Handle<gatling::gpu::CommandBuffer>;
    let record = |device: &mut Device| -> Result<CmdHandle, gatling::gpu::GpuError> {
        let cmd = device.create_command_buffer()?;
        device.begin_commands(cmd)?;

        device.cmd_reset_timestamps(cmd, 0, 32)?;
        device.cmd_write_timestamp(cmd, 0)?;

        device.cmd_bind_pipeline(cmd, pipeline)?;
        let buffers = [
            BufferBindingSlot::entire(0, output_buffer),
            BufferBindingSlot::entire(1, path_queue),
            BufferBindingSlot {
                binding: 2,
                index: 0,
                buffer: geometry.scene_buffer,
                offset: geometry.nodes.offset,
                size: geometry.nodes.size,
            },
            BufferBindingSlot {
                binding: 3,
                index: 0,
                buffer: geometry.scene_buffer,
                offset: geometry.faces.offset,
                size: geometry.faces.size,
            },
            BufferBindingSlot {
                binding: 4,
                index: 0,
                buffer: geometry.scene_buffer,
                offset: geometry.vertices.offset,
                size: geometry.vertices.size,
            },
            BufferBindingSlot {
                binding: 5,
                index: 0,
                buffer: geometry.scene_buffer,
                offset: geometry.materials.offset,
                size: geometry.materials.size,
            },
            BufferBindingSlot::entire(6, hit_queue),
        ];
        device.cmd_update_bindings(
            cmd,
            &Bindings {
                buffers: &buffers,
                ..Default::default()
            },
        )?;
        device.cmd_push_constants(cmd, bytemuck::bytes_of(&push))?;
        device.cmd_dispatch(
            cmd,
            width.div_ceil(workgroup[0]),
            height.div_ceil(workgroup[1]),
            1,
        )?;

        device.cmd_copy_buffer(cmd, output_buffer, 0, readback_buffer, 0, WHOLE_SIZE)?;
        device.cmd_write_timestamp(cmd, 1)?;
        device.cmd_copy_timestamps(cmd, timestamp_buffer, 0, 2, 0)?;

        device.end_commands(cmd)?;
        Ok(cmd)
    };
    let cmd = record(&mut device).map_err(|e| e.to_string())?;

    let fence = device.create_fence().map_err(|e| e.to_string())?;
    device.reset_fence(fence).map_err(|e| e.to_string())?;

    println!("Rendering...");
    device
        .submit_command_buffer(cmd, fence)
        .map_err(|e| e.to_string())?;
    device.wait_for_fence(fence).map_err(|e| e.to_string())?;

    if device.features().timestamps {
        let read_ts = |device: &mut Device| -> Result<(u64, u64), gatling::gpu::GpuError> {
            device.map_buffer(timestamp_buffer, MapMode::Read)?;
            let (start, end) = {
                let mapped = device.mapped_range(timestamp_buffer, 0, 16)?;
                (
                    u64::from_le_bytes(mapped[0..8].try_into().unwrap()),
                    u64::from_le_bytes(mapped[8..16].try_into().unwrap()),
                )
            };
            device.unmap_buffer(timestamp_buffer)?;
            Ok((start, end))
        };
        if let Ok((start, end)) = read_ts(&mut device) {
            let elapsed_ms = (end.saturating_sub(start)) as f32
                * device.limits().timestamp_period_ns
                / 1_000_000.0;
            println!("Total rendering time: {elapsed_ms:.2}ms");
        }
    }

    // Read the framebuffer back and encode.
    let mut rgba = vec![0.0f32; (pixel_count * 4) as usize];
    {
        device
            .map_buffer(readback_buffer, MapMode::Read)
            .map_err(|e| e.to_string())?;
        let mapped = device
            .mapped_range(readback_buffer, 0, output_size)
            .map_err(|e| e.to_string())?;
        bytemuck::cast_slice_mut::<f32, u8>(&mut rgba).copy_from_slice(&mapped[..]);
        drop(mapped);
        device.unmap_buffer(readback_buffer).map_err(|e| e.to_string())?;
    }
    gamma::encode_image(&mut rgba);

    write_ppm(&options.output_path, width, height, &rgba).map_err(|e| {
        format!(
            "unable to write image '{}': {e}",
            options.output_path.display()
        )
    })?;

    // Tear down; handle errors here are non-fatal.
    let _ = device.destroy_fence(fence);
    let _ = device.destroy_command_buffer(cmd);
    let _ = device.destroy_pipeline(pipeline);
    let _ = device.destroy_shader(shader);
    for buffer in [output_buffer, readback_buffer, path_queue, hit_queue, timestamp_buffer] {
        let _ = device.destroy_buffer(buffer);
    }
    geometry.destroy(&mut device);

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
            eprintln!("gatling: {message}");
            ExitCode::FAILURE
        }
    }
}
