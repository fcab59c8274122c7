//! Headless frame loop over a small render graph.
//!
//! Each frame renders a triangle offscreen, renders into a cube texture with
//! the cube strategy the device supports, and composites the offscreen
//! texture into the swap chain's back buffer.

use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;

use render_rhi::backend::native::{GpuKind, NativeConfig};
use render_rhi::render_graph::{
    add_cube_passes, cube_depth_desc, CubeFaces, CubePathSelector, CubeRenderPath, PassAttachments, RenderGraph,
    RgTextureDesc,
};
use render_rhi::rhi::*;
use render_rhi::{create_device, BackendType, RhiConfig, RhiResult};

const TRIANGLE_SHADER: &str = r#"
@group(0) @binding(0) var<uniform> transform: mat4x4<f32>;

struct VertexOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) color: vec4<f32>,
};

@vertex
fn VSMain(@location(0) position: vec3<f32>, @location(1) color: vec4<f32>) -> VertexOutput {
    var out: VertexOutput;
    out.position = transform * vec4<f32>(position, 1.0);
    out.color = color;
    return out;
}

@fragment
fn PSMain(in: VertexOutput) -> @location(0) vec4<f32> {
    return in.color;
}
"#;

const BLIT_SHADER: &str = r#"
@group(0) @binding(1) var source: texture_2d<f32>;
@group(0) @binding(41) var linear_sampler: sampler;

struct VertexOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
};

@vertex
fn VSMain(@builtin(vertex_index) index: u32) -> VertexOutput {
    let uv = vec2<f32>(f32((index << 1u) & 2u), f32(index & 2u));
    var out: VertexOutput;
    out.position = vec4<f32>(uv * 2.0 - 1.0, 0.0, 1.0);
    out.uv = vec2<f32>(uv.x, 1.0 - uv.y);
    return out;
}

@fragment
fn PSMain(in: VertexOutput) -> @location(0) vec4<f32> {
    return textureSample(source, linear_sampler, in.uv);
}
"#;

#[derive(Parser, Debug)]
#[command(
    name = "render-rhi",
    about = "Render a few frames of a demo render graph",
    long_about = "Renders N frames of a demo render graph on the selected backend.\n\n\
        EXAMPLES:\n\
          # Software explicit GPU\n\
          render-rhi --backend native --frames 10\n\
        \n\
          # No-op backend\n\
          render-rhi --backend null",
    version
)]
struct Args {
    /// Backend to render with.
    #[arg(long, default_value = "native", value_enum)]
    backend: BackendType,

    /// GPU driven by the native backend.
    #[arg(long, default_value = "soft", value_enum)]
    gpu: GpuKind,

    /// Number of frames to render.
    #[arg(long, default_value = "3")]
    frames: u64,

    /// Back buffer width in pixels.
    #[arg(long, default_value = "1280")]
    width: u32,

    /// Back buffer height in pixels.
    #[arg(long, default_value = "720")]
    height: u32,

    /// Frames the CPU may record ahead of the GPU.
    #[arg(long, default_value = "3")]
    frames_in_flight: usize,
}

impl Args {
    fn rhi_config(&self) -> RhiConfig {
        RhiConfig::new(self.backend).with_native(
            NativeConfig::default()
                .with_gpu(self.gpu)
                .with_frames_in_flight(self.frames_in_flight),
        )
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct Vertex {
    position: [f32; 3],
    color: [f32; 4],
}

const TRIANGLE: [Vertex; 3] = [
    Vertex {
        position: [0.0, 0.6, 0.5],
        color: [1.0, 0.2, 0.2, 1.0],
    },
    Vertex {
        position: [-0.6, -0.6, 0.5],
        color: [0.2, 1.0, 0.2, 1.0],
    },
    Vertex {
        position: [0.6, -0.6, 0.5],
        color: [0.2, 0.2, 1.0, 1.0],
    },
];

/// Device objects shared by every frame
struct DemoScene {
    vertex_buffer: BufferHandle,
    input_layout: InputLayoutHandle,
    shaders: Vec<ShaderHandle>,
    triangle_pipeline: PipelineHandle,
    blit_pipeline: PipelineHandle,
    cube_pipelines: Vec<PipelineHandle>,
    cube_path: Option<(CubeRenderPath, PipelineHandle)>,
}

impl DemoScene {
    fn new(device: &mut dyn RhiDevice) -> RhiResult<Self> {
        let vertices: &[u8] = bytemuck::cast_slice(&TRIANGLE[..]);
        let vertex_buffer = device.create_buffer(
            &BufferDesc::new(BufferBindFlag::VertexBuffer, vertices.len() as u64).with_debug_name("triangle"),
        )?;
        device.update_buffer(vertex_buffer, vertices, 0)?;

        let input_layout = device.create_input_layout(&InputLayoutDesc {
            attributes: vec![
                VertexAttribute::new(VertexSemantic::Position, VertexFormat::Float32x3, 0),
                VertexAttribute::new(VertexSemantic::Color, VertexFormat::Float32x4, 12),
            ],
            stride_bytes: std::mem::size_of::<Vertex>() as u32,
        })?;

        let triangle_vs = device.create_shader(ShaderStage::Vertex, "VSMain", TRIANGLE_SHADER)?;
        let triangle_ps = device.create_shader(ShaderStage::Pixel, "PSMain", TRIANGLE_SHADER)?;
        let blit_vs = device.create_shader(ShaderStage::Vertex, "VSMain", BLIT_SHADER)?;
        let blit_ps = device.create_shader(ShaderStage::Pixel, "PSMain", BLIT_SHADER)?;
        let triangle_pipeline = device.create_pipeline(
            "triangle",
            triangle_vs,
            triangle_ps,
            PrimitiveTopologyType::Triangle,
        )?;
        let blit_pipeline = device.create_pipeline("blit", blit_vs, blit_ps, PrimitiveTopologyType::Triangle)?;

        let mut scene = Self {
            vertex_buffer,
            input_layout,
            shaders: vec![triangle_vs, triangle_ps, blit_vs, blit_ps],
            triangle_pipeline,
            blit_pipeline,
            cube_pipelines: Vec::new(),
            cube_path: None,
        };
        scene.select_cube_path(device)?;
        Ok(scene)
    }

    /// Build the pipeline of the cheapest cube path that works on `device`.
    fn select_cube_path(&mut self, device: &mut dyn RhiDevice) -> RhiResult<()> {
        let capabilities = device.capabilities();
        let mut selector = CubePathSelector::new();
        let mut failure = None;
        let mut built = Vec::new();

        let selected = selector.select_with_pipeline(&capabilities, |path| {
            match cube_pipeline(device, path, &mut self.shaders) {
                Ok(pipeline) => {
                    built.push(pipeline);
                    pipeline
                }
                Err(e) => {
                    log::warn!("{:?} cube pipeline failed: {}", path, e);
                    failure.get_or_insert(e);
                    PipelineHandle::NULL
                }
            }
        });
        self.cube_pipelines = built;

        match selected {
            Some((path, pipeline)) => {
                log::info!("Cube rendering path: {:?}", path);
                self.cube_path = Some((path, pipeline));
                Ok(())
            }
            None => match failure {
                Some(e) => Err(e),
                None => {
                    log::warn!("No cube rendering path available");
                    Ok(())
                }
            },
        }
    }

    fn destroy(self, device: &mut dyn RhiDevice) {
        for pipeline in self.cube_pipelines {
            device.destroy_pipeline(pipeline);
        }
        device.destroy_pipeline(self.triangle_pipeline);
        device.destroy_pipeline(self.blit_pipeline);
        for shader in self.shaders {
            device.destroy_shader(shader);
        }
        device.destroy_input_layout(self.input_layout);
        device.destroy_buffer(self.vertex_buffer);
    }
}

/// Pipeline a cube path renders with; null when the path is unavailable.
fn cube_pipeline(
    device: &mut dyn RhiDevice,
    path: CubeRenderPath,
    shaders: &mut Vec<ShaderHandle>,
) -> RhiResult<PipelineHandle> {
    let model = match path {
        CubeRenderPath::PerFace => ShaderModel::Sm5_1,
        CubeRenderPath::Layered | CubeRenderPath::ViewInstanced => ShaderModel::Sm6_1,
    };
    let vs = device.create_shader_ex(ShaderStage::Vertex, "VSMain", TRIANGLE_SHADER, model)?;
    let ps = device.create_shader_ex(ShaderStage::Pixel, "PSMain", TRIANGLE_SHADER, model)?;
    shaders.extend([vs, ps].into_iter().filter(|shader| shader.is_valid()));
    if vs.is_null() || ps.is_null() {
        return Ok(PipelineHandle::NULL);
    }

    let views = match path {
        CubeRenderPath::ViewInstanced => 6,
        CubeRenderPath::Layered | CubeRenderPath::PerFace => 1,
    };
    device.create_pipeline_ex(
        &format!("cube_{:?}", path),
        vs,
        ps,
        PrimitiveTopologyType::Triangle,
        views,
    )
}

fn record_triangle(
    list: &mut CommandList,
    scene: &DemoScene,
    pipeline: PipelineHandle,
    transform: glam::Mat4,
    instances: u32,
) -> RhiResult<()> {
    list.bind_pipeline(pipeline);
    list.bind_input_layout(scene.input_layout);
    list.bind_vertex_buffer(0, scene.vertex_buffer, std::mem::size_of::<Vertex>() as u32, 0);
    list.set_constants(0, bytemuck::bytes_of(&transform.to_cols_array()))?;
    list.draw(3, instances, 0, 0);
    Ok(())
}

fn render_frame(
    device: &mut dyn RhiDevice,
    swap_chain: &dyn SwapChain,
    scene: &DemoScene,
    frame: u64,
    extent: Extent2D,
) -> RhiResult<()> {
    let transform = glam::Mat4::from_rotation_z(frame as f32 * 0.1);
    let cube_extent = Extent2D::new(128, 128);

    let mut graph = RenderGraph::new();
    let offscreen = graph.create_texture(RgTextureDesc::color_2d("offscreen", extent, TextureFormat::Rgba8Unorm));
    let depth = graph.create_texture(RgTextureDesc::depth_2d("offscreen_depth", extent, TextureFormat::Depth32Float));

    graph.add_pass(
        "triangle",
        PassAttachments::new(Some(offscreen), Some(depth), ClearDesc::color([0.1, 0.1, 0.15, 1.0])),
        move |ctx| record_triangle(ctx.command_list, scene, scene.triangle_pipeline, transform, 1),
    );

    if let Some((path, pipeline)) = scene.cube_path {
        let cube = graph.create_texture(RgTextureDesc::color_cube("cube", cube_extent, TextureFormat::R32Float));
        let cube_depth = graph.create_texture(cube_depth_desc(
            path,
            "cube_depth",
            cube_extent,
            TextureFormat::Depth32Float,
        ));
        add_cube_passes(
            &mut graph,
            "cube",
            path,
            cube,
            Some(cube_depth),
            ClearDesc::color([1.0, 1.0, 1.0, 1.0]),
            move |ctx, faces| {
                let instances = match (path, faces) {
                    // layered rendering routes one instance to each face
                    (CubeRenderPath::Layered, CubeFaces::All) => 6,
                    _ => 1,
                };
                record_triangle(ctx.command_list, scene, pipeline, transform, instances)
            },
        );
    }

    graph.add_swap_chain_pass("composite", ClearDesc::default(), move |ctx| {
        let source = ctx.resources.require(offscreen)?;
        ctx.command_list.set_full_viewport(ctx.pass_extent);
        ctx.command_list.set_state(GraphicsState::default().with_depth(false, false, CompareOp::Always));
        ctx.command_list.bind_pipeline(scene.blit_pipeline);
        ctx.command_list.bind_input_layout(InputLayoutHandle::NULL);
        ctx.command_list.bind_texture_2d(0, source);
        ctx.command_list.draw(3, 1, 0, 0);
        Ok(())
    });

    graph.execute(device, Some(swap_chain))
}

fn run(args: &Args) -> RhiResult<()> {
    let mut device = create_device(&args.rhi_config())?;
    log::info!(
        "Device: {} ({} backend, {:?})",
        device.name(),
        device.backend(),
        device.capabilities()
    );

    let extent = Extent2D::new(args.width, args.height);
    let mut swap_chain = device.create_swap_chain(&SwapChainDesc {
        extent,
        ..Default::default()
    })?;
    let scene = DemoScene::new(device.as_mut())?;

    let start = Instant::now();
    let mut result = Ok(());
    for frame in 0..args.frames {
        let back_buffer = swap_chain.current_back_buffer();
        if let Err(e) = render_frame(device.as_mut(), swap_chain.as_ref(), &scene, frame, extent)
            .and_then(|()| swap_chain.present())
        {
            log::error!("Frame {} failed: {}", frame, e);
            result = Err(e);
            break;
        }
        log::debug!("Frame {}: {:?}", frame, device.resource_counts());

        if frame + 1 == args.frames {
            match device.read_texture(back_buffer, 0) {
                Ok(pixels) => log::info!("First back-buffer pixel: {:?}", &pixels[..4.min(pixels.len())]),
                Err(e) => log::info!("Back-buffer readback unavailable: {}", e),
            }
        }
    }

    let elapsed = start.elapsed();
    log::info!(
        "Rendered {} frames in {:.2?} ({} presents)",
        args.frames,
        elapsed,
        swap_chain.present_count()
    );

    device.wait_idle()?;
    scene.destroy(device.as_mut());
    device.destroy_swap_chain(swap_chain);
    log::info!("Live objects at exit: {:?}", device.resource_counts());
    result
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
