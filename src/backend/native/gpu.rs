//! Explicit GPU API driven by the native backend
//!
//! [`GpuDevice`] is shaped after modern explicit graphics APIs: committed
//! resources in default/upload/readback heaps, CPU-written descriptor heaps
//! addressed by index, command allocators that may only be reset once the
//! GPU finished with them, a recorded [`GpuCommandList`], and a single
//! monotonic queue fence.
//!
//! # Root signature
//!
//! Every pipeline shares one fixed binding layout:
//!
//! ```text
//! parameter 0       constant buffer view, register b0 (per-draw constants)
//! parameters 1..=20 one-descriptor tables, registers t0..t19
//! static samplers   s0 linear/wrap
//!                   s1 comparison point/border white, less-equal (shadows)
//!                   s2 point/border white
//!                   s3 linear/clamp
//! ```

use std::sync::Arc;

use crate::error::{HeapKind, RhiResult};
use crate::rhi::{
    Capabilities, Extent2D, GraphicsState, IndexType, PrimitiveTopology, PrimitiveTopologyType,
    ShaderModel, ShaderStage, TextureFormat, VertexAttribute, Viewport,
};

/// Root parameter of the per-draw constant buffer view.
pub const ROOT_PARAM_CONSTANTS: u32 = 0;

/// Root parameter of descriptor table `t0`; table `tN` is `ROOT_PARAM_FIRST_TABLE + N`.
pub const ROOT_PARAM_FIRST_TABLE: u32 = 1;

/// Alignment of constant buffer view addresses.
pub const CONSTANT_BUFFER_ALIGNMENT: u64 = 256;

/// Most views a multi-view pipeline may broadcast to.
pub const MAX_VIEW_INSTANCES: u32 = 8;

/// Most simultaneously bound render targets.
pub const MAX_RENDER_TARGETS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawResource(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawHeap(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawPipeline(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawAllocator(pub u64);

/// Memory a committed resource lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryHeap {
    /// GPU-local, written only by copies and rendering
    Default,
    /// CPU-writable, GPU-readable
    Upload,
    /// GPU-writable, CPU-readable
    Readback,
}

/// Resource state tracked for transition barriers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    Common,
    RenderTarget,
    DepthWrite,
    PixelShaderResource,
    Present,
    CopyDest,
    CopySource,
    GenericRead,
}

#[derive(Debug, Clone)]
pub struct GpuBufferDesc {
    pub size: u64,
    pub heap: MemoryHeap,
    pub initial_state: ResourceState,
    pub debug_name: String,
}

/// Usage a texture is created for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct GpuTextureUsage {
    pub render_target: bool,
    pub depth_stencil: bool,
    pub shader_resource: bool,
}

#[derive(Debug, Clone)]
pub struct GpuTextureDesc {
    pub extent: Extent2D,
    pub format: TextureFormat,
    /// 1 for 2D textures, 6 for cubes
    pub array_layers: u32,
    pub cube: bool,
    pub usage: GpuTextureUsage,
    pub initial_state: ResourceState,
    pub debug_name: String,
}

/// Contents of one descriptor heap slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewDesc {
    /// Shader view of no texture, reads zero
    NullTexture2D,
    /// Shader view of no buffer, reads zero
    NullStructuredBuffer,
    Texture2D {
        resource: RawResource,
        format: TextureFormat,
    },
    TextureCube {
        resource: RawResource,
        format: TextureFormat,
    },
    Texture2DArray {
        resource: RawResource,
        format: TextureFormat,
        first_layer: u32,
        layer_count: u32,
    },
    StructuredBuffer {
        resource: RawResource,
        stride: u32,
        element_count: u32,
    },
    RenderTarget {
        resource: RawResource,
        format: TextureFormat,
        first_layer: u32,
        layer_count: u32,
    },
    DepthStencil {
        resource: RawResource,
        format: TextureFormat,
        first_layer: u32,
        layer_count: u32,
    },
}

impl ViewDesc {
    pub fn resource(&self) -> Option<RawResource> {
        match *self {
            ViewDesc::NullTexture2D | ViewDesc::NullStructuredBuffer => None,
            ViewDesc::Texture2D { resource, .. }
            | ViewDesc::TextureCube { resource, .. }
            | ViewDesc::Texture2DArray { resource, .. }
            | ViewDesc::StructuredBuffer { resource, .. }
            | ViewDesc::RenderTarget { resource, .. }
            | ViewDesc::DepthStencil { resource, .. } => Some(resource),
        }
    }

    pub fn heap_kind(&self) -> HeapKind {
        match self {
            ViewDesc::RenderTarget { .. } => HeapKind::RenderTarget,
            ViewDesc::DepthStencil { .. } => HeapKind::DepthStencil,
            _ => HeapKind::ShaderResource,
        }
    }
}

/// Slot of a descriptor heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorRef {
    pub heap: RawHeap,
    pub index: u32,
}

/// Compiled shader bytecode
#[derive(Debug, Clone)]
pub struct ShaderBlob {
    pub stage: ShaderStage,
    pub model: ShaderModel,
    pub entry_point: String,
    pub code: Arc<[u8]>,
}

#[derive(Debug, Clone)]
pub struct GpuPipelineDesc {
    pub name: String,
    pub vertex: ShaderBlob,
    pub pixel: ShaderBlob,
    pub input_layout: Vec<VertexAttribute>,
    pub topology_type: PrimitiveTopologyType,
    pub state: GraphicsState,
    pub rtv_formats: Vec<TextureFormat>,
    pub dsv_format: Option<TextureFormat>,
    /// Above 1 builds a multi-view pipeline
    pub view_instance_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexBufferView {
    pub resource: RawResource,
    pub offset: u64,
    pub size: u64,
    pub stride: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexBufferView {
    pub resource: RawResource,
    pub offset: u64,
    pub size: u64,
    pub index_type: IndexType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScissorRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

/// A recorded GPU command
#[derive(Debug, Clone, PartialEq)]
pub enum GpuCommand {
    Barrier {
        resource: RawResource,
        before: ResourceState,
        after: ResourceState,
    },
    SetRenderTargets {
        rtvs: Vec<DescriptorRef>,
        dsv: Option<DescriptorRef>,
    },
    ClearRenderTarget {
        rtv: DescriptorRef,
        color: [f32; 4],
    },
    ClearDepth {
        dsv: DescriptorRef,
        depth: f32,
    },
    SetViewport(Viewport),
    SetScissor(ScissorRect),
    SetPipeline(RawPipeline),
    SetPrimitiveTopology(PrimitiveTopology),
    SetVertexBuffers(Vec<VertexBufferView>),
    SetIndexBuffer(IndexBufferView),
    SetRootConstantBuffer {
        parameter: u32,
        resource: RawResource,
        offset: u64,
    },
    SetRootDescriptorTable {
        parameter: u32,
        descriptor: DescriptorRef,
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
    CopyBufferRegion {
        dst: RawResource,
        dst_offset: u64,
        src: RawResource,
        src_offset: u64,
        size: u64,
    },
    /// Copy one tightly packed layer from a buffer into a texture
    CopyBufferToTexture {
        src: RawResource,
        src_offset: u64,
        dst: RawResource,
        layer: u32,
    },
    /// Copy one texture layer into a buffer as tightly packed rows
    CopyTextureToBuffer {
        src: RawResource,
        layer: u32,
        dst: RawResource,
        dst_offset: u64,
    },
}

/// CPU-side command recording bound to a command allocator
#[derive(Debug, Default)]
pub struct GpuCommandList {
    allocator: Option<RawAllocator>,
    commands: Vec<GpuCommand>,
    open: bool,
}

impl GpuCommandList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start recording into `allocator`. Discards anything recorded before.
    pub fn reset(&mut self, allocator: RawAllocator) {
        self.allocator = Some(allocator);
        self.commands.clear();
        self.open = true;
    }

    pub fn close(&mut self) {
        self.open = false;
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn allocator(&self) -> Option<RawAllocator> {
        self.allocator
    }

    pub fn commands(&self) -> &[GpuCommand] {
        &self.commands
    }

    pub fn take_commands(&mut self) -> Vec<GpuCommand> {
        std::mem::take(&mut self.commands)
    }

    pub fn push(&mut self, command: GpuCommand) {
        debug_assert!(self.open, "recording into a closed command list");
        self.commands.push(command);
    }

    pub fn barrier(&mut self, resource: RawResource, before: ResourceState, after: ResourceState) {
        if before != after {
            self.push(GpuCommand::Barrier {
                resource,
                before,
                after,
            });
        }
    }

    pub fn copy_buffer_region(
        &mut self,
        dst: RawResource,
        dst_offset: u64,
        src: RawResource,
        src_offset: u64,
        size: u64,
    ) {
        self.push(GpuCommand::CopyBufferRegion {
            dst,
            dst_offset,
            src,
            src_offset,
            size,
        });
    }
}

/// Explicit graphics API used by [`NativeDevice`](super::NativeDevice).
pub trait GpuDevice: Send {
    fn adapter_name(&self) -> String;
    fn capabilities(&self) -> Capabilities;

    fn create_buffer(&mut self, desc: &GpuBufferDesc) -> RhiResult<RawResource>;
    fn create_texture(&mut self, desc: &GpuTextureDesc) -> RhiResult<RawResource>;

    /// Free a resource. The GPU must have finished every use of it.
    fn release_resource(&mut self, resource: RawResource);

    /// Write into a buffer in the upload heap.
    fn write_buffer(&mut self, resource: RawResource, offset: u64, data: &[u8]) -> RhiResult<()>;

    /// Read from a buffer in the readback heap.
    fn read_buffer(&mut self, resource: RawResource, offset: u64, out: &mut [u8]) -> RhiResult<()>;

    fn create_descriptor_heap(&mut self, kind: HeapKind, capacity: u32) -> RhiResult<RawHeap>;

    /// Overwrite a descriptor slot. The GPU must not be reading the slot.
    fn write_descriptor(&mut self, heap: RawHeap, index: u32, view: &ViewDesc) -> RhiResult<()>;

    fn compile_shader(
        &mut self,
        stage: ShaderStage,
        source: &str,
        entry_point: &str,
        model: ShaderModel,
    ) -> RhiResult<ShaderBlob>;

    fn create_pipeline(&mut self, desc: &GpuPipelineDesc) -> RhiResult<RawPipeline>;

    /// Free a pipeline. The GPU must have finished every use of it.
    fn release_pipeline(&mut self, pipeline: RawPipeline);

    fn create_command_allocator(&mut self) -> RhiResult<RawAllocator>;

    /// Recycle an allocator's memory. The GPU must have finished the lists recorded from it.
    fn reset_command_allocator(&mut self, allocator: RawAllocator) -> RhiResult<()>;

    /// Submit a closed command list to the queue.
    fn execute(&mut self, list: &mut GpuCommandList) -> RhiResult<()>;

    /// Queue a fence signal to `value` after all previously executed work.
    fn signal(&mut self, value: u64) -> RhiResult<()>;

    fn completed_value(&self) -> u64;

    /// Block until the queue fence reaches `value`.
    fn wait_for_value(&self, value: u64) -> RhiResult<()>;
}
