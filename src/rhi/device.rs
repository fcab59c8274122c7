//! The device contract every backend implements

use crate::error::RhiResult;
use crate::rhi::command::CommandList;
use crate::rhi::handle::*;
use crate::rhi::swap_chain::{SwapChain, SwapChainDesc};
use crate::rhi::types::*;
use crate::BackendType;

/// Rendering hardware interface device.
///
/// Creation methods return a fresh non-zero handle; destroy methods accept
/// any handle and ignore null or unknown ones. Methods that the adapter may
/// not support return the null handle instead of an error.
pub trait RhiDevice {
    fn name(&self) -> &str;
    fn backend(&self) -> BackendType;
    fn capabilities(&self) -> Capabilities;

    /// Block until every submitted command list has finished executing.
    fn wait_idle(&mut self) -> RhiResult<()>;

    // ------------------------------------------------------------------
    // Textures
    // ------------------------------------------------------------------

    /// Render-target or depth-stencil 2D texture, depending on `format`.
    fn create_texture_2d(&mut self, extent: Extent2D, format: TextureFormat) -> RhiResult<TextureHandle>;

    /// Six-face cube render target or depth-stencil texture.
    fn create_texture_cube(&mut self, extent: Extent2D, format: TextureFormat) -> RhiResult<TextureHandle>;

    /// Shader-read-only 2D texture filled with tightly packed `pixels`.
    fn create_sampled_texture(&mut self, desc: &SampledTextureDesc, pixels: &[u8]) -> RhiResult<TextureHandle>;

    /// Shader-read-only cube texture, `faces` holds the six layers back to back.
    fn create_sampled_texture_cube(&mut self, desc: &SampledTextureDesc, faces: &[u8]) -> RhiResult<TextureHandle>;

    /// Rewrite a sampled texture's contents, keeping its handle and view slot.
    fn replace_sampled_texture(&mut self, texture: TextureHandle, pixels: &[u8]) -> RhiResult<()>;

    fn destroy_texture(&mut self, texture: TextureHandle);

    /// Read back one layer of a texture as tightly packed rows.
    fn read_texture(&mut self, texture: TextureHandle, layer: u32) -> RhiResult<Vec<u8>>;

    // ------------------------------------------------------------------
    // Buffers
    // ------------------------------------------------------------------

    fn create_buffer(&mut self, desc: &BufferDesc) -> RhiResult<BufferHandle>;

    /// Write `data` at `offset_bytes`. Null or unknown buffers and empty data are ignored.
    fn update_buffer(&mut self, buffer: BufferHandle, data: &[u8], offset_bytes: u64) -> RhiResult<()>;

    fn destroy_buffer(&mut self, buffer: BufferHandle);

    // ------------------------------------------------------------------
    // Shaders, layouts and pipelines
    // ------------------------------------------------------------------

    fn create_input_layout(&mut self, desc: &InputLayoutDesc) -> RhiResult<InputLayoutHandle>;
    fn destroy_input_layout(&mut self, layout: InputLayoutHandle);

    /// Compile `source`, using `name` as entry point and falling back to the
    /// stage default entry point.
    fn create_shader(&mut self, stage: ShaderStage, name: &str, source: &str) -> RhiResult<ShaderHandle>;

    /// Like [`create_shader`](Self::create_shader) for an explicit shader
    /// model. Returns the null handle when the model is unsupported or the
    /// source does not compile for it.
    fn create_shader_ex(
        &mut self,
        stage: ShaderStage,
        name: &str,
        source: &str,
        model: ShaderModel,
    ) -> RhiResult<ShaderHandle>;

    fn destroy_shader(&mut self, shader: ShaderHandle);

    fn create_pipeline(
        &mut self,
        name: &str,
        vertex_shader: ShaderHandle,
        pixel_shader: ShaderHandle,
        topology: PrimitiveTopologyType,
    ) -> RhiResult<PipelineHandle> {
        self.create_pipeline_ex(name, vertex_shader, pixel_shader, topology, 1)
    }

    /// Pipeline broadcasting each draw to `view_instance_count` render-target
    /// layers. Returns the null handle when view instancing is unsupported.
    fn create_pipeline_ex(
        &mut self,
        name: &str,
        vertex_shader: ShaderHandle,
        pixel_shader: ShaderHandle,
        topology: PrimitiveTopologyType,
        view_instance_count: u32,
    ) -> RhiResult<PipelineHandle>;

    fn destroy_pipeline(&mut self, pipeline: PipelineHandle);

    // ------------------------------------------------------------------
    // Framebuffers
    // ------------------------------------------------------------------

    /// Either attachment may be null.
    fn create_framebuffer(&mut self, color: TextureHandle, depth: TextureHandle) -> RhiResult<FramebufferHandle>;

    /// Renders into all six faces of `color_cube` (and `depth_cube`) at once.
    fn create_framebuffer_cube(
        &mut self,
        color_cube: TextureHandle,
        depth_cube: TextureHandle,
    ) -> RhiResult<FramebufferHandle>;

    /// Renders into a single cube face with a 2D depth attachment.
    fn create_framebuffer_cube_face(
        &mut self,
        color_cube: TextureHandle,
        face: u32,
        depth: TextureHandle,
    ) -> RhiResult<FramebufferHandle>;

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle);

    // ------------------------------------------------------------------
    // Bindless texture table
    // ------------------------------------------------------------------

    fn allocate_texture_descriptor(&mut self, texture: TextureHandle) -> RhiResult<TextureDescIndex>;
    fn update_texture_descriptor(&mut self, index: TextureDescIndex, texture: TextureHandle) -> RhiResult<()>;
    fn free_texture_descriptor(&mut self, index: TextureDescIndex);

    // ------------------------------------------------------------------
    // Fences
    // ------------------------------------------------------------------

    fn create_fence(&mut self, signaled: bool) -> RhiResult<FenceHandle>;
    fn destroy_fence(&mut self, fence: FenceHandle);

    /// Mark `fence` to complete once all work submitted so far has completed.
    fn signal_fence(&mut self, fence: FenceHandle) -> RhiResult<()>;

    fn wait_fence(&mut self, fence: FenceHandle) -> RhiResult<()>;
    fn is_fence_signaled(&mut self, fence: FenceHandle) -> RhiResult<bool>;

    // ------------------------------------------------------------------
    // Swap chains and submission
    // ------------------------------------------------------------------

    fn create_swap_chain(&mut self, desc: &SwapChainDesc) -> RhiResult<Box<dyn SwapChain>>;

    fn destroy_swap_chain(&mut self, swap_chain: Box<dyn SwapChain>) {
        for texture in swap_chain.textures() {
            self.destroy_texture(texture);
        }
    }

    /// Interpret and submit one command list as one frame.
    fn submit_command_list(&mut self, commands: CommandList) -> RhiResult<()>;

    fn resource_counts(&self) -> ResourceCounts;
}
