//! The backend-neutral command stream
//!
//! A [`CommandList`] is an ordered list of [`Command`] records built on the
//! CPU and handed to [`RhiDevice::submit_command_list`](crate::RhiDevice)
//! by value. Records reference objects by handle only; all validation that
//! needs device state happens when the backend interprets the list.

use std::any::Any;
use std::sync::Arc;

use crate::error::{RhiError, RhiResult};
use crate::rhi::handle::*;
use crate::rhi::types::*;

/// Largest per-draw constants payload, in bytes.
pub const MAX_PER_DRAW_CONSTANTS_BYTES: usize = 512;

/// Number of texture/buffer view registers (`t0..t19`).
pub const MAX_TEXTURE_SLOTS: u32 = 20;

/// Number of vertex buffer slots.
pub const MAX_VERTEX_BUFFER_SLOTS: u32 = 2;

/// Register that defaults to the null structured-buffer view instead of the null texture view.
pub const STRUCTURED_BUFFER_DEFAULT_SLOT: u32 = 2;

/// Per-draw constants payload, at most [`MAX_PER_DRAW_CONSTANTS_BYTES`] long.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PerDrawConstants {
    bytes: Vec<u8>,
}

impl PerDrawConstants {
    pub fn new(bytes: &[u8]) -> RhiResult<Self> {
        if bytes.len() > MAX_PER_DRAW_CONSTANTS_BYTES {
            return Err(RhiError::ConstantsTooLarge {
                size: bytes.len(),
                max: MAX_PER_DRAW_CONSTANTS_BYTES,
            });
        }
        Ok(Self {
            bytes: bytes.to_vec(),
        })
    }

    pub fn from_pod<T: bytemuck::Pod>(value: &T) -> RhiResult<Self> {
        Self::new(bytemuck::bytes_of(value))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Opaque UI overlay draw data forwarded to the backend's overlay renderer
#[derive(Clone)]
pub struct OverlayDrawData(pub Arc<dyn Any + Send + Sync>);

impl OverlayDrawData {
    pub fn new<T: Any + Send + Sync>(data: T) -> Self {
        Self(Arc::new(data))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl std::fmt::Debug for OverlayDrawData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayDrawData").finish_non_exhaustive()
    }
}

/// Color/depth pair of a swap chain's current frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapChainTarget {
    pub color: TextureHandle,
    /// May be null when the swap chain has no depth buffer
    pub depth: TextureHandle,
    pub extent: Extent2D,
}

/// What a pass renders into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassTarget {
    SwapChain(SwapChainTarget),
    Framebuffer(FramebufferHandle),
}

/// A single command record
#[derive(Debug, Clone)]
pub enum Command {
    BeginPass {
        target: PassTarget,
        clear: ClearDesc,
    },
    EndPass,
    SetViewport {
        x: i32,
        y: i32,
        width: i32,
        height: i32,
    },
    SetState(GraphicsState),
    SetPrimitiveTopology(PrimitiveTopology),
    BindPipeline(PipelineHandle),
    BindInputLayout(InputLayoutHandle),
    BindVertexBuffer {
        slot: u32,
        buffer: BufferHandle,
        stride_bytes: u32,
        offset_bytes: u64,
    },
    BindIndexBuffer {
        buffer: BufferHandle,
        index_type: IndexType,
        offset_bytes: u64,
    },
    BindTexture2D {
        slot: u32,
        texture: TextureHandle,
    },
    BindTextureCube {
        slot: u32,
        texture: TextureHandle,
    },
    /// Binds a cube texture as a six-layer 2D array
    BindTexture2DArray {
        slot: u32,
        texture: TextureHandle,
    },
    /// Binds whatever texture the bindless table currently maps `index` to
    BindTextureDesc {
        slot: u32,
        index: TextureDescIndex,
    },
    BindStructuredBufferSrv {
        slot: u32,
        buffer: BufferHandle,
    },
    SetConstants {
        slot: u32,
        data: PerDrawConstants,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        base_vertex: i32,
        first_instance: u32,
    },
    RenderOverlay(OverlayDrawData),
}

/// Recorded command stream for one submission
#[derive(Debug, Clone, Default)]
pub struct CommandList {
    commands: Vec<Command>,
}

impl CommandList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn into_commands(self) -> Vec<Command> {
        self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn begin_pass(&mut self, target: PassTarget, clear: ClearDesc) {
        self.push(Command::BeginPass { target, clear });
    }

    pub fn end_pass(&mut self) {
        self.push(Command::EndPass);
    }

    pub fn set_viewport(&mut self, x: i32, y: i32, width: i32, height: i32) {
        self.push(Command::SetViewport {
            x,
            y,
            width,
            height,
        });
    }

    /// Viewport covering the whole extent.
    pub fn set_full_viewport(&mut self, extent: Extent2D) {
        self.set_viewport(0, 0, extent.width as i32, extent.height as i32);
    }

    pub fn set_state(&mut self, state: GraphicsState) {
        self.push(Command::SetState(state));
    }

    pub fn set_primitive_topology(&mut self, topology: PrimitiveTopology) {
        self.push(Command::SetPrimitiveTopology(topology));
    }

    pub fn bind_pipeline(&mut self, pipeline: PipelineHandle) {
        self.push(Command::BindPipeline(pipeline));
    }

    pub fn bind_input_layout(&mut self, layout: InputLayoutHandle) {
        self.push(Command::BindInputLayout(layout));
    }

    pub fn bind_vertex_buffer(
        &mut self,
        slot: u32,
        buffer: BufferHandle,
        stride_bytes: u32,
        offset_bytes: u64,
    ) {
        self.push(Command::BindVertexBuffer {
            slot,
            buffer,
            stride_bytes,
            offset_bytes,
        });
    }

    pub fn bind_index_buffer(&mut self, buffer: BufferHandle, index_type: IndexType, offset_bytes: u64) {
        self.push(Command::BindIndexBuffer {
            buffer,
            index_type,
            offset_bytes,
        });
    }

    pub fn bind_texture_2d(&mut self, slot: u32, texture: TextureHandle) {
        self.push(Command::BindTexture2D { slot, texture });
    }

    pub fn bind_texture_cube(&mut self, slot: u32, texture: TextureHandle) {
        self.push(Command::BindTextureCube { slot, texture });
    }

    pub fn bind_texture_2d_array(&mut self, slot: u32, texture: TextureHandle) {
        self.push(Command::BindTexture2DArray { slot, texture });
    }

    pub fn bind_texture_desc(&mut self, slot: u32, index: TextureDescIndex) {
        self.push(Command::BindTextureDesc { slot, index });
    }

    pub fn bind_structured_buffer_srv(&mut self, slot: u32, buffer: BufferHandle) {
        self.push(Command::BindStructuredBufferSrv { slot, buffer });
    }

    /// Record per-draw constants. Fails without recording when `bytes` exceeds
    /// [`MAX_PER_DRAW_CONSTANTS_BYTES`].
    pub fn set_constants(&mut self, slot: u32, bytes: &[u8]) -> RhiResult<()> {
        let data = PerDrawConstants::new(bytes)?;
        self.push(Command::SetConstants { slot, data });
        Ok(())
    }

    pub fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        self.push(Command::Draw {
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        });
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        base_vertex: i32,
        first_instance: u32,
    ) {
        self.push(Command::DrawIndexed {
            index_count,
            instance_count,
            first_index,
            base_vertex,
            first_instance,
        });
    }

    pub fn render_overlay(&mut self, data: OverlayDrawData) {
        self.push(Command::RenderOverlay(data));
    }
}
