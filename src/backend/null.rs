//! Null backend
//!
//! Accepts every call, hands out valid handles and renders nothing. Handle
//! bookkeeping matches the native backend (ids never reused, unknown
//! handles reported, destroy of null/unknown ignored) so code paths and
//! object lifetimes can be exercised headless.

use crate::backend::native::bindless::BindlessTable;
use crate::backend::native::gpu::MAX_VIEW_INSTANCES;
use crate::error::{RhiError, RhiResult};
use crate::rhi::*;
use crate::BackendType;

#[derive(Debug)]
struct NullTexture {
    format: TextureFormat,
    cube: bool,
}

#[derive(Debug)]
struct NullBuffer {
    size_bytes: u64,
}

#[derive(Debug)]
struct NullShader {
    stage: ShaderStage,
}

#[derive(Default)]
pub struct NullDevice {
    textures: HandleMap<TextureHandle, NullTexture>,
    buffers: HandleMap<BufferHandle, NullBuffer>,
    shaders: HandleMap<ShaderHandle, NullShader>,
    pipelines: HandleMap<PipelineHandle, ()>,
    input_layouts: HandleMap<InputLayoutHandle, ()>,
    framebuffers: HandleMap<FramebufferHandle, ()>,
    fences: HandleMap<FenceHandle, bool>,
    bindless: BindlessTable,
    submissions: u64,
}

impl NullDevice {
    pub fn new() -> Self {
        log::info!("Null device created");
        Self::default()
    }

    /// Command lists submitted so far.
    pub fn submissions(&self) -> u64 {
        self.submissions
    }

    fn create_texture(&mut self, extent: Extent2D, format: TextureFormat, cube: bool) -> RhiResult<TextureHandle> {
        if extent.is_empty() {
            return Err(RhiError::InvalidParameter(format!(
                "texture has an empty extent {}x{}",
                extent.width, extent.height
            )));
        }
        log::trace!("null: create texture {}x{} {:?} cube={}", extent.width, extent.height, format, cube);
        Ok(self.textures.insert(NullTexture { format, cube }))
    }

    fn require_attachment(&self, texture: TextureHandle, cube: bool, depth: bool) -> RhiResult<()> {
        if texture.is_null() {
            return Ok(());
        }
        let entry = self.textures.require(texture)?;
        if entry.cube != cube || entry.format.is_depth() != depth {
            return Err(RhiError::InvalidParameter(format!(
                "texture {} ({:?}) cannot be a {} attachment here",
                texture.raw(),
                entry.format,
                if depth { "depth" } else { "color" }
            )));
        }
        Ok(())
    }
}

impl RhiDevice for NullDevice {
    fn name(&self) -> &str {
        "Null"
    }

    fn backend(&self) -> BackendType {
        BackendType::Null
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::all()
    }

    fn wait_idle(&mut self) -> RhiResult<()> {
        Ok(())
    }

    fn create_texture_2d(&mut self, extent: Extent2D, format: TextureFormat) -> RhiResult<TextureHandle> {
        self.create_texture(extent, format, false)
    }

    fn create_texture_cube(&mut self, extent: Extent2D, format: TextureFormat) -> RhiResult<TextureHandle> {
        self.create_texture(extent, format, true)
    }

    fn create_sampled_texture(&mut self, desc: &SampledTextureDesc, pixels: &[u8]) -> RhiResult<TextureHandle> {
        let expected = layer_size_bytes(desc.extent, desc.format);
        if pixels.len() != expected {
            return Err(RhiError::InvalidParameter(format!(
                "sampled texture '{}' expects {} bytes, got {}",
                desc.debug_name,
                expected,
                pixels.len()
            )));
        }
        self.create_texture(desc.extent, desc.format, false)
    }

    fn create_sampled_texture_cube(&mut self, desc: &SampledTextureDesc, faces: &[u8]) -> RhiResult<TextureHandle> {
        let expected = layer_size_bytes(desc.extent, desc.format) * 6;
        if faces.len() != expected {
            return Err(RhiError::InvalidParameter(format!(
                "sampled cube '{}' expects {} bytes, got {}",
                desc.debug_name,
                expected,
                faces.len()
            )));
        }
        self.create_texture(desc.extent, desc.format, true)
    }

    fn replace_sampled_texture(&mut self, texture: TextureHandle, _pixels: &[u8]) -> RhiResult<()> {
        self.textures.require(texture)?;
        Ok(())
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        self.textures.remove(texture);
    }

    fn read_texture(&mut self, texture: TextureHandle, _layer: u32) -> RhiResult<Vec<u8>> {
        self.textures.require(texture)?;
        Err(RhiError::InvalidParameter(
            "the null backend keeps no pixel data".to_string(),
        ))
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> RhiResult<BufferHandle> {
        if desc.size_bytes == 0 {
            return Err(RhiError::InvalidParameter(format!(
                "buffer '{}' has zero size",
                desc.debug_name
            )));
        }
        Ok(self.buffers.insert(NullBuffer {
            size_bytes: desc.size_bytes,
        }))
    }

    fn update_buffer(&mut self, buffer: BufferHandle, data: &[u8], offset_bytes: u64) -> RhiResult<()> {
        let Some(entry) = self.buffers.get(buffer) else {
            return Ok(());
        };
        let len = data.len() as u64;
        if offset_bytes.checked_add(len).map_or(true, |end| end > entry.size_bytes) {
            return Err(RhiError::OutOfBounds {
                offset: offset_bytes,
                len,
                size: entry.size_bytes,
            });
        }
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        self.buffers.remove(buffer);
    }

    fn create_input_layout(&mut self, desc: &InputLayoutDesc) -> RhiResult<InputLayoutHandle> {
        if desc.slot_count() > MAX_VERTEX_BUFFER_SLOTS {
            return Err(RhiError::InvalidParameter(format!(
                "input layout reads {} vertex buffer slots",
                desc.slot_count()
            )));
        }
        Ok(self.input_layouts.insert(()))
    }

    fn destroy_input_layout(&mut self, layout: InputLayoutHandle) {
        self.input_layouts.remove(layout);
    }

    fn create_shader(&mut self, stage: ShaderStage, name: &str, _source: &str) -> RhiResult<ShaderHandle> {
        log::trace!("null: create {:?} shader '{}'", stage, name);
        Ok(self.shaders.insert(NullShader { stage }))
    }

    fn create_shader_ex(
        &mut self,
        stage: ShaderStage,
        name: &str,
        source: &str,
        _model: ShaderModel,
    ) -> RhiResult<ShaderHandle> {
        self.create_shader(stage, name, source)
    }

    fn destroy_shader(&mut self, shader: ShaderHandle) {
        self.shaders.remove(shader);
    }

    fn create_pipeline_ex(
        &mut self,
        name: &str,
        vertex_shader: ShaderHandle,
        pixel_shader: ShaderHandle,
        _topology: PrimitiveTopologyType,
        view_instance_count: u32,
    ) -> RhiResult<PipelineHandle> {
        let vs = self.shaders.require(vertex_shader)?.stage;
        let ps = self.shaders.require(pixel_shader)?.stage;
        if vs != ShaderStage::Vertex || ps != ShaderStage::Pixel {
            return Err(RhiError::InvalidParameter(format!(
                "pipeline '{}' needs a vertex and a pixel shader",
                name
            )));
        }
        if view_instance_count > MAX_VIEW_INSTANCES {
            log::warn!(
                "null: pipeline '{}' requests {} views, at most {} are supported",
                name,
                view_instance_count,
                MAX_VIEW_INSTANCES
            );
            return Ok(PipelineHandle::NULL);
        }
        Ok(self.pipelines.insert(()))
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineHandle) {
        self.pipelines.remove(pipeline);
    }

    fn create_framebuffer(&mut self, color: TextureHandle, depth: TextureHandle) -> RhiResult<FramebufferHandle> {
        if color.is_null() && depth.is_null() {
            return Err(RhiError::InvalidParameter(
                "framebuffer needs a color or a depth attachment".to_string(),
            ));
        }
        self.require_attachment(color, false, false)?;
        self.require_attachment(depth, false, true)?;
        Ok(self.framebuffers.insert(()))
    }

    fn create_framebuffer_cube(
        &mut self,
        color_cube: TextureHandle,
        depth_cube: TextureHandle,
    ) -> RhiResult<FramebufferHandle> {
        if color_cube.is_null() && depth_cube.is_null() {
            return Err(RhiError::InvalidParameter(
                "cube framebuffer needs a color or a depth attachment".to_string(),
            ));
        }
        self.require_attachment(color_cube, true, false)?;
        self.require_attachment(depth_cube, true, true)?;
        Ok(self.framebuffers.insert(()))
    }

    fn create_framebuffer_cube_face(
        &mut self,
        color_cube: TextureHandle,
        face: u32,
        depth: TextureHandle,
    ) -> RhiResult<FramebufferHandle> {
        if face >= 6 {
            return Err(RhiError::InvalidParameter(format!("cube face {} out of range", face)));
        }
        if color_cube.is_null() {
            return Err(RhiError::InvalidParameter(
                "cube face framebuffer needs a color cube".to_string(),
            ));
        }
        self.require_attachment(color_cube, true, false)?;
        self.require_attachment(depth, false, true)?;
        Ok(self.framebuffers.insert(()))
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        self.framebuffers.remove(framebuffer);
    }

    fn allocate_texture_descriptor(&mut self, texture: TextureHandle) -> RhiResult<TextureDescIndex> {
        if !texture.is_null() {
            self.textures.require(texture)?;
        }
        let index = self.bindless.allocate();
        self.bindless.set(index, texture);
        Ok(index)
    }

    fn update_texture_descriptor(&mut self, index: TextureDescIndex, texture: TextureHandle) -> RhiResult<()> {
        if !texture.is_null() {
            self.textures.require(texture)?;
        }
        if !self.bindless.set(index, texture) {
            return Err(RhiError::not_found(TextureDescIndex::KIND, index.raw()));
        }
        Ok(())
    }

    fn free_texture_descriptor(&mut self, index: TextureDescIndex) {
        self.bindless.free(index);
    }

    fn create_fence(&mut self, signaled: bool) -> RhiResult<FenceHandle> {
        Ok(self.fences.insert(signaled))
    }

    fn destroy_fence(&mut self, fence: FenceHandle) {
        self.fences.remove(fence);
    }

    fn signal_fence(&mut self, fence: FenceHandle) -> RhiResult<()> {
        *self.fences.require_mut(fence)? = true;
        Ok(())
    }

    fn wait_fence(&mut self, fence: FenceHandle) -> RhiResult<()> {
        if *self.fences.require(fence)? {
            Ok(())
        } else {
            Err(RhiError::InvalidParameter(format!(
                "fence {} was never signaled",
                fence.raw()
            )))
        }
    }

    fn is_fence_signaled(&mut self, fence: FenceHandle) -> RhiResult<bool> {
        Ok(*self.fences.require(fence)?)
    }

    fn create_swap_chain(&mut self, desc: &SwapChainDesc) -> RhiResult<Box<dyn SwapChain>> {
        if desc.buffer_count == 0 {
            return Err(RhiError::InvalidParameter(
                "swap chain needs at least one back buffer".to_string(),
            ));
        }
        let mut back_buffers = Vec::with_capacity(desc.buffer_count as usize);
        for _ in 0..desc.buffer_count {
            back_buffers.push(self.create_texture(desc.extent, desc.format, false)?);
        }
        let depth = match desc.depth_format {
            Some(format) => self.create_texture(desc.extent, format, false)?,
            None => TextureHandle::NULL,
        };
        Ok(Box::new(HeadlessSwapChain::new(desc, back_buffers, depth)))
    }

    fn submit_command_list(&mut self, commands: CommandList) -> RhiResult<()> {
        self.submissions += 1;
        log::trace!(
            "null: submission {} with {} commands",
            self.submissions,
            commands.len()
        );
        Ok(())
    }

    fn resource_counts(&self) -> ResourceCounts {
        ResourceCounts {
            textures: self.textures.len(),
            buffers: self.buffers.len(),
            shaders: self.shaders.len(),
            pipelines: self.pipelines.len(),
            input_layouts: self.input_layouts.len(),
            framebuffers: self.framebuffers.len(),
            fences: self.fences.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_are_valid_and_counted() {
        let mut device = NullDevice::new();
        let texture = device
            .create_texture_2d(Extent2D::new(8, 8), TextureFormat::Rgba8Unorm)
            .unwrap();
        assert!(texture.is_valid());
        assert_eq!(device.resource_counts().textures, 1);

        device.destroy_texture(texture);
        device.destroy_texture(texture);
        device.destroy_texture(TextureHandle::NULL);
        assert_eq!(device.resource_counts().textures, 0);
    }

    #[test]
    fn test_read_texture_is_unsupported() {
        let mut device = NullDevice::new();
        let texture = device
            .create_texture_2d(Extent2D::new(8, 8), TextureFormat::Rgba8Unorm)
            .unwrap();
        assert!(matches!(
            device.read_texture(texture, 0),
            Err(RhiError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_fences() {
        let mut device = NullDevice::new();
        let fence = device.create_fence(false).unwrap();
        assert!(!device.is_fence_signaled(fence).unwrap());
        assert!(device.wait_fence(fence).is_err());
        device.signal_fence(fence).unwrap();
        assert!(device.is_fence_signaled(fence).unwrap());
        device.wait_fence(fence).unwrap();
    }
}
