//! Common test utilities for device tests.
//!
//! Builds devices for each backend and records the small frames most
//! tests submit.

#![allow(dead_code)]

use render_rhi::backend::native::{SoftGpu, SoftGpuProbe};
use render_rhi::rhi::*;
use render_rhi::{NativeConfig, NativeDevice, NullDevice, RhiResult};

/// Backends available to tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Native,
    Null,
}

/// Vertex and pixel entry points understood by every backend
pub const SHADER_SOURCE: &str = "fn VSMain() {}\nfn PSMain() {}\n";

/// Create a device for `backend`. Native devices run on the software GPU.
pub fn create_device(backend: Backend) -> Box<dyn RhiDevice> {
    match backend {
        Backend::Native => Box::new(
            NativeDevice::with_soft_gpu(NativeConfig::default()).expect("soft GPU device should be created"),
        ),
        Backend::Null => Box::new(NullDevice::new()),
    }
}

/// Native device on a software GPU, together with the probe watching it.
///
/// Tests that pause the probe must resume it before the device drops:
/// dropping waits for every submitted frame.
pub struct SoftContext {
    pub device: NativeDevice,
    pub probe: SoftGpuProbe,
}

impl SoftContext {
    pub fn new() -> Self {
        Self::with_config(NativeConfig::default())
    }

    pub fn with_config(config: NativeConfig) -> Self {
        let gpu = SoftGpu::new();
        let probe = gpu.probe();
        let device = NativeDevice::new(Box::new(gpu), config).expect("soft GPU device should be created");
        Self { device, probe }
    }

    pub fn with_frames_in_flight(frames: usize) -> Self {
        Self::with_config(NativeConfig::default().with_frames_in_flight(frames))
    }
}

impl Drop for SoftContext {
    fn drop(&mut self) {
        self.probe.resume();
    }
}

/// Build a triangle pipeline from [`SHADER_SOURCE`].
pub fn create_pipeline(device: &mut dyn RhiDevice, name: &str) -> RhiResult<PipelineHandle> {
    let vs = device.create_shader(ShaderStage::Vertex, "VSMain", SHADER_SOURCE)?;
    let ps = device.create_shader(ShaderStage::Pixel, "PSMain", SHADER_SOURCE)?;
    device.create_pipeline(name, vs, ps, PrimitiveTopologyType::Triangle)
}

/// A color texture with a framebuffer around it.
pub fn create_target(
    device: &mut dyn RhiDevice,
    extent: Extent2D,
    format: TextureFormat,
) -> RhiResult<(TextureHandle, FramebufferHandle)> {
    let texture = device.create_texture_2d(extent, format)?;
    let framebuffer = device.create_framebuffer(texture, TextureHandle::NULL)?;
    Ok((texture, framebuffer))
}

/// A list with a single pass clearing `framebuffer` to `color`.
pub fn clear_list(framebuffer: FramebufferHandle, color: [f32; 4]) -> CommandList {
    let mut list = CommandList::new();
    list.begin_pass(PassTarget::Framebuffer(framebuffer), ClearDesc::color(color));
    list.end_pass();
    list
}

/// A list drawing one triangle with `pipeline` into `framebuffer` under `state`.
pub fn draw_list(framebuffer: FramebufferHandle, pipeline: PipelineHandle, state: GraphicsState) -> CommandList {
    let mut list = CommandList::new();
    list.begin_pass(PassTarget::Framebuffer(framebuffer), ClearDesc::load());
    list.set_state(state);
    list.set_primitive_topology(PrimitiveTopology::TriangleList);
    list.bind_pipeline(pipeline);
    list.set_constants(0, &[0u8; 64]).expect("64 bytes fit the constants cap");
    list.draw(3, 1, 0, 0);
    list.end_pass();
    list
}
