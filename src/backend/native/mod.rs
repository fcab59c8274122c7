//! Native explicit-API backend
//!
//! [`NativeDevice`] implements [`RhiDevice`] on top of a [`GpuDevice`]: it
//! owns the descriptor heaps and their slot pools, the per-frame resource
//! ring, the pipeline state cache, the bindless table and the per-handle
//! tables, and translates command lists into GPU command lists
//! (see [`interpreter`]).

pub mod bindless;
pub mod descriptors;
pub mod entries;
pub mod frame;
pub mod gpu;
pub mod interpreter;
pub mod pso;
pub mod soft;
pub mod upload;
#[cfg(all(feature = "vulkan", not(target_arch = "wasm32")))]
pub mod vulkan;

pub use gpu::GpuDevice;
pub use soft::{SoftGpu, SoftGpuProbe};

use crate::error::{HeapKind, RhiError, RhiResult};
use crate::rhi::*;
use crate::BackendType;

use bindless::BindlessTable;
use descriptors::*;
use entries::*;
use frame::{DeferredFrees, FrameRing, DEFAULT_FRAMES_IN_FLIGHT};
use gpu::*;
use pso::PsoCache;

/// GPU implementation the native backend drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, clap::ValueEnum)]
pub enum GpuKind {
    /// Host-memory GPU with a validation layer
    #[default]
    Soft,
    /// Vulkan device, requires the `vulkan` feature
    Vulkan,
}

/// Limits of the native backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeConfig {
    pub gpu: GpuKind,
    /// Frame resource slots, i.e. how far the CPU may run ahead of the GPU
    pub frames_in_flight: usize,
    /// Shader-visible descriptor heap size
    pub srv_heap_size: u32,
    pub rtv_heap_size: u32,
    pub dsv_heap_size: u32,
    /// Per-frame constants ring size in bytes
    pub constants_ring_bytes: u64,
    /// Per-frame staging ring size in bytes
    pub upload_ring_bytes: u64,
}

impl Default for NativeConfig {
    fn default() -> Self {
        Self {
            gpu: GpuKind::default(),
            frames_in_flight: DEFAULT_FRAMES_IN_FLIGHT,
            srv_heap_size: 16384,
            rtv_heap_size: 256,
            dsv_heap_size: 256,
            constants_ring_bytes: 512 * 1024,
            upload_ring_bytes: 8 * 1024 * 1024,
        }
    }
}

impl NativeConfig {
    pub fn with_gpu(mut self, gpu: GpuKind) -> Self {
        self.gpu = gpu;
        self
    }

    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames;
        self
    }

    pub fn with_srv_heap_size(mut self, slots: u32) -> Self {
        self.srv_heap_size = slots;
        self
    }

    pub fn with_rtv_heap_size(mut self, slots: u32) -> Self {
        self.rtv_heap_size = slots;
        self
    }

    pub fn with_dsv_heap_size(mut self, slots: u32) -> Self {
        self.dsv_heap_size = slots;
        self
    }

    pub fn with_constants_ring_bytes(mut self, bytes: u64) -> Self {
        self.constants_ring_bytes = bytes;
        self
    }

    pub fn with_upload_ring_bytes(mut self, bytes: u64) -> Self {
        self.upload_ring_bytes = bytes;
        self
    }
}

/// Records the UI overlay into the native command list.
///
/// The font texture view lives in slot [`OVERLAY_FONT_SRV`] of the
/// shader-visible heap.
pub trait OverlayRenderer: Send {
    fn record(
        &mut self,
        draw_data: &OverlayDrawData,
        list: &mut GpuCommandList,
        srv_heap: RawHeap,
    ) -> RhiResult<()>;
}

/// Submission statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameStats {
    pub frames_in_flight: usize,
    pub submissions: u64,
    pub slots_touched: usize,
    /// Last value signaled on the queue fence
    pub last_fence_value: u64,
    pub completed_fence_value: u64,
}

pub struct NativeDevice {
    gpu: Box<dyn GpuDevice>,
    adapter_name: String,
    config: NativeConfig,
    caps: Capabilities,

    srv_heap: RawHeap,
    rtv_heap: Option<RawHeap>,
    dsv_heap: Option<RawHeap>,
    srv_pool: DescriptorPool,
    rtv_pool: DescriptorPool,
    dsv_pool: DescriptorPool,

    frames: FrameRing,
    list: GpuCommandList,
    immediate_allocator: RawAllocator,
    fence_value: u64,
    has_submitted: bool,

    textures: HandleMap<TextureHandle, TextureEntry>,
    buffers: HandleMap<BufferHandle, BufferEntry>,
    shaders: HandleMap<ShaderHandle, ShaderEntry>,
    pipelines: HandleMap<PipelineHandle, PipelineEntry>,
    input_layouts: HandleMap<InputLayoutHandle, InputLayoutEntry>,
    framebuffers: HandleMap<FramebufferHandle, FramebufferEntry>,
    fences: HandleMap<FenceHandle, FenceEntry>,
    bindless: BindlessTable,
    pso_cache: PsoCache,
    pending_updates: Vec<PendingBufferUpdate>,
    overlay: Option<Box<dyn OverlayRenderer>>,
}

impl NativeDevice {
    pub fn new(mut gpu: Box<dyn GpuDevice>, config: NativeConfig) -> RhiResult<Self> {
        if config.srv_heap_size <= FIRST_DYNAMIC_SRV {
            return Err(RhiError::InvalidParameter(format!(
                "shader resource heap needs more than {FIRST_DYNAMIC_SRV} slots, got {}",
                config.srv_heap_size
            )));
        }

        let adapter_name = gpu.adapter_name();
        let caps = gpu.capabilities();
        log::info!("Native device on '{}'", adapter_name);
        log::info!(
            "  shader model 6.1: {}, view instancing: {}, layered rendering: {}",
            caps.shader_model_6_1,
            caps.view_instancing,
            caps.layered_rendering
        );

        let srv_heap = gpu.create_descriptor_heap(HeapKind::ShaderResource, config.srv_heap_size)?;
        gpu.write_descriptor(srv_heap, NULL_TEXTURE_SRV, &ViewDesc::NullTexture2D)?;
        gpu.write_descriptor(srv_heap, NULL_BUFFER_SRV, &ViewDesc::NullStructuredBuffer)?;
        gpu.write_descriptor(srv_heap, OVERLAY_FONT_SRV, &ViewDesc::NullTexture2D)?;

        let frames = FrameRing::new(
            gpu.as_mut(),
            config.frames_in_flight,
            config.constants_ring_bytes,
            config.upload_ring_bytes,
        )?;
        let immediate_allocator = gpu.create_command_allocator()?;

        log::info!(
            "  {} frames in flight, {} shader resource slots",
            config.frames_in_flight,
            config.srv_heap_size
        );

        Ok(Self {
            srv_pool: DescriptorPool::new(
                HeapKind::ShaderResource,
                config.srv_heap_size,
                FIRST_DYNAMIC_SRV,
            ),
            rtv_pool: DescriptorPool::new(HeapKind::RenderTarget, config.rtv_heap_size, 0),
            dsv_pool: DescriptorPool::new(HeapKind::DepthStencil, config.dsv_heap_size, 0),
            gpu,
            adapter_name,
            config,
            caps,
            srv_heap,
            rtv_heap: None,
            dsv_heap: None,
            frames,
            list: GpuCommandList::new(),
            immediate_allocator,
            fence_value: 0,
            has_submitted: false,
            textures: HandleMap::new(),
            buffers: HandleMap::new(),
            shaders: HandleMap::new(),
            pipelines: HandleMap::new(),
            input_layouts: HandleMap::new(),
            framebuffers: HandleMap::new(),
            fences: HandleMap::new(),
            bindless: BindlessTable::new(),
            pso_cache: PsoCache::new(),
            pending_updates: Vec::new(),
            overlay: None,
        })
    }

    /// Device on the software GPU with its default capabilities.
    pub fn with_soft_gpu(config: NativeConfig) -> RhiResult<Self> {
        Self::new(Box::new(SoftGpu::new()), config)
    }

    pub fn config(&self) -> &NativeConfig {
        &self.config
    }

    pub fn set_overlay_renderer(&mut self, renderer: Box<dyn OverlayRenderer>) {
        self.overlay = Some(renderer);
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    pub fn frame_stats(&self) -> FrameStats {
        FrameStats {
            frames_in_flight: self.frames.len(),
            submissions: self.frames.submit_index(),
            slots_touched: self.frames.slots_touched(),
            last_fence_value: self.fence_value,
            completed_fence_value: self.gpu.completed_value(),
        }
    }

    /// Fence value stamped on a frame slot by its last submission.
    pub fn frame_slot_fence(&self, slot: usize) -> Option<u64> {
        self.frames.slot_fence(slot)
    }

    /// Slot used by the most recent submission.
    pub fn active_frame_slot(&self) -> usize {
        self.frames.active_slot()
    }

    pub fn texture_views(&self, texture: TextureHandle) -> Option<TextureViews> {
        self.textures.get(texture).map(|t| t.views)
    }

    pub fn texture_state(&self, texture: TextureHandle) -> Option<ResourceState> {
        self.textures.get(texture).map(|t| t.state)
    }

    pub fn descriptor_usage(&self) -> DescriptorUsage {
        DescriptorUsage {
            shader_resource: self.srv_pool.in_use(FIRST_DYNAMIC_SRV),
            render_target: self.rtv_pool.in_use(0),
            depth_stencil: self.dsv_pool.in_use(0),
        }
    }

    pub fn pso_cache_len(&self) -> usize {
        self.pso_cache.len()
    }

    /// PSO cache misses so far.
    pub fn pso_builds(&self) -> u64 {
        self.pso_cache.builds()
    }

    pub fn pending_buffer_updates(&self) -> usize {
        self.pending_updates.len()
    }

    // ------------------------------------------------------------------
    // Descriptor helpers
    // ------------------------------------------------------------------

    fn ensure_rtv_heap(&mut self) -> RhiResult<RawHeap> {
        if let Some(heap) = self.rtv_heap {
            return Ok(heap);
        }
        let heap = self
            .gpu
            .create_descriptor_heap(HeapKind::RenderTarget, self.config.rtv_heap_size)?;
        self.rtv_heap = Some(heap);
        Ok(heap)
    }

    fn ensure_dsv_heap(&mut self) -> RhiResult<RawHeap> {
        if let Some(heap) = self.dsv_heap {
            return Ok(heap);
        }
        let heap = self
            .gpu
            .create_descriptor_heap(HeapKind::DepthStencil, self.config.dsv_heap_size)?;
        self.dsv_heap = Some(heap);
        Ok(heap)
    }

    /// Allocate a slot in the heap matching `view` and write the view into it.
    fn allocate_view(&mut self, view: &ViewDesc) -> RhiResult<u32> {
        let kind = view.heap_kind();
        let heap = match kind {
            HeapKind::ShaderResource => self.srv_heap,
            HeapKind::RenderTarget => self.ensure_rtv_heap()?,
            HeapKind::DepthStencil => self.ensure_dsv_heap()?,
        };
        let pool = self.pool_mut(kind);
        let index = pool.allocate()?;
        if let Err(err) = self.gpu.write_descriptor(heap, index, view) {
            self.pool_mut(kind).free(index);
            return Err(err);
        }
        Ok(index)
    }

    fn pool_mut(&mut self, kind: HeapKind) -> &mut DescriptorPool {
        match kind {
            HeapKind::ShaderResource => &mut self.srv_pool,
            HeapKind::RenderTarget => &mut self.rtv_pool,
            HeapKind::DepthStencil => &mut self.dsv_pool,
        }
    }

    pub(crate) fn rtv_ref(&self, index: u32) -> RhiResult<DescriptorRef> {
        let heap = self
            .rtv_heap
            .ok_or_else(|| RhiError::InvalidCommand("no render target views exist".to_string()))?;
        Ok(DescriptorRef { heap, index })
    }

    pub(crate) fn dsv_ref(&self, index: u32) -> RhiResult<DescriptorRef> {
        let heap = self
            .dsv_heap
            .ok_or_else(|| RhiError::InvalidCommand("no depth stencil views exist".to_string()))?;
        Ok(DescriptorRef { heap, index })
    }

    pub(crate) fn srv_ref(&self, index: u32) -> DescriptorRef {
        DescriptorRef {
            heap: self.srv_heap,
            index,
        }
    }

    /// Return never-used view slots straight to their pools.
    fn free_views_now(&mut self, views: &TextureViews) {
        for index in views.srv_slots() {
            self.srv_pool.free(index);
        }
        for index in views.rtv_slots() {
            self.rtv_pool.free(index);
        }
        for index in views.dsv_slots() {
            self.dsv_pool.free(index);
        }
    }

    fn defer_views(&mut self, views: &TextureViews) {
        let deferred = self.frames.deferred();
        deferred.srv.extend(views.srv_slots());
        deferred.rtv.extend(views.rtv_slots());
        deferred.dsv.extend(views.dsv_slots());
    }

    pub(crate) fn release_deferred(&mut self, deferred: DeferredFrees) {
        if deferred.is_empty() {
            return;
        }
        log::debug!("Releasing {} deferred objects", deferred.len());
        for resource in deferred.resources {
            self.gpu.release_resource(resource);
        }
        for pipeline in deferred.pipelines {
            self.gpu.release_pipeline(pipeline);
        }
        for index in deferred.srv {
            self.srv_pool.free(index);
        }
        for index in deferred.rtv {
            self.rtv_pool.free(index);
        }
        for index in deferred.dsv {
            self.dsv_pool.free(index);
        }
    }

    // ------------------------------------------------------------------
    // Textures
    // ------------------------------------------------------------------

    fn create_texture(
        &mut self,
        extent: Extent2D,
        format: TextureFormat,
        kind: TextureKind,
        role: TextureRole,
        debug_name: String,
    ) -> RhiResult<TextureHandle> {
        if extent.is_empty() {
            return Err(RhiError::InvalidParameter(format!(
                "texture '{}' has an empty extent {}x{}",
                debug_name, extent.width, extent.height
            )));
        }
        if kind == TextureKind::Cube && extent.width != extent.height {
            return Err(RhiError::InvalidParameter(format!(
                "cube texture '{}' must be square, got {}x{}",
                debug_name, extent.width, extent.height
            )));
        }

        let (usage, initial_state) = match role {
            TextureRole::RenderTarget => (
                GpuTextureUsage {
                    render_target: true,
                    shader_resource: true,
                    ..Default::default()
                },
                ResourceState::RenderTarget,
            ),
            TextureRole::DepthStencil => (
                GpuTextureUsage {
                    depth_stencil: true,
                    shader_resource: true,
                    ..Default::default()
                },
                ResourceState::DepthWrite,
            ),
            TextureRole::Sampled => (
                GpuTextureUsage {
                    shader_resource: true,
                    ..Default::default()
                },
                ResourceState::CopyDest,
            ),
            TextureRole::BackBuffer => (
                GpuTextureUsage {
                    render_target: true,
                    shader_resource: true,
                    ..Default::default()
                },
                ResourceState::Present,
            ),
        };

        let resource = self.gpu.create_texture(&GpuTextureDesc {
            extent,
            format,
            array_layers: kind.layers(),
            cube: kind == TextureKind::Cube,
            usage,
            initial_state,
            debug_name: debug_name.clone(),
        })?;

        let mut views = TextureViews::default();
        if let Err(err) = self.create_texture_views(resource, format, kind, role, &mut views) {
            self.free_views_now(&views);
            self.gpu.release_resource(resource);
            return Err(err);
        }

        Ok(self.textures.insert(TextureEntry {
            resource,
            extent,
            format,
            kind,
            role,
            state: initial_state,
            views,
            debug_name,
        }))
    }

    fn create_texture_views(
        &mut self,
        resource: RawResource,
        format: TextureFormat,
        kind: TextureKind,
        role: TextureRole,
        views: &mut TextureViews,
    ) -> RhiResult<()> {
        match (role, kind) {
            (TextureRole::RenderTarget, TextureKind::Texture2D) => {
                views.rtv = Some(self.allocate_view(&ViewDesc::RenderTarget {
                    resource,
                    format,
                    first_layer: 0,
                    layer_count: 1,
                })?);
                views.srv = Some(self.allocate_view(&shader_view(resource, format, kind))?);
            }
            (TextureRole::RenderTarget, TextureKind::Cube) => {
                let mut faces = Vec::with_capacity(6);
                for face in 0..6 {
                    match self.allocate_view(&ViewDesc::RenderTarget {
                        resource,
                        format,
                        first_layer: face,
                        layer_count: 1,
                    }) {
                        Ok(index) => faces.push(index),
                        Err(err) => {
                            for index in faces {
                                self.rtv_pool.free(index);
                            }
                            return Err(err);
                        }
                    }
                }
                views.rtv_faces = Some([faces[0], faces[1], faces[2], faces[3], faces[4], faces[5]]);
                views.rtv_all_faces = Some(self.allocate_view(&ViewDesc::RenderTarget {
                    resource,
                    format,
                    first_layer: 0,
                    layer_count: 6,
                })?);
                views.srv = Some(self.allocate_view(&shader_view(resource, format, kind))?);
            }
            (TextureRole::DepthStencil, TextureKind::Texture2D) => {
                views.dsv = Some(self.allocate_view(&ViewDesc::DepthStencil {
                    resource,
                    format,
                    first_layer: 0,
                    layer_count: 1,
                })?);
                views.srv = Some(self.allocate_view(&shader_view(resource, format, kind))?);
            }
            (TextureRole::DepthStencil, TextureKind::Cube) => {
                views.dsv_all_faces = Some(self.allocate_view(&ViewDesc::DepthStencil {
                    resource,
                    format,
                    first_layer: 0,
                    layer_count: 6,
                })?);
                views.srv = Some(self.allocate_view(&shader_view(resource, format, kind))?);
            }
            (TextureRole::Sampled, _) => {
                views.srv = Some(self.allocate_view(&shader_view(resource, format, kind))?);
            }
            (TextureRole::BackBuffer, _) => {
                views.rtv = Some(self.allocate_view(&ViewDesc::RenderTarget {
                    resource,
                    format,
                    first_layer: 0,
                    layer_count: 1,
                })?);
            }
        }
        Ok(())
    }

    /// Texture's shader view slot, creating it for textures created without one.
    fn ensure_texture_srv(&mut self, texture: TextureHandle) -> RhiResult<u32> {
        let entry = self.textures.require(texture)?;
        if let Some(srv) = entry.views.srv {
            return Ok(srv);
        }
        let view = shader_view(entry.resource, entry.format, entry.kind);
        let srv = self.allocate_view(&view)?;
        self.textures.require_mut(texture)?.views.srv = Some(srv);
        Ok(srv)
    }

    /// Lazily created six-layer array view of a cube.
    pub(crate) fn ensure_texture_array_srv(&mut self, texture: TextureHandle) -> RhiResult<u32> {
        let entry = self.textures.require(texture)?;
        if let Some(srv) = entry.views.srv_array {
            return Ok(srv);
        }
        if entry.kind != TextureKind::Cube {
            return Err(RhiError::InvalidCommand(format!(
                "texture {} is not a cube and has no array view",
                texture.raw()
            )));
        }
        let view = ViewDesc::Texture2DArray {
            resource: entry.resource,
            format: sampling_format(entry.format),
            first_layer: 0,
            layer_count: 6,
        };
        let srv = self.allocate_view(&view)?;
        self.textures.require_mut(texture)?.views.srv_array = Some(srv);
        Ok(srv)
    }

    fn create_sampled(
        &mut self,
        desc: &SampledTextureDesc,
        kind: TextureKind,
        data: &[u8],
    ) -> RhiResult<TextureHandle> {
        if desc.format.is_depth() {
            return Err(RhiError::InvalidParameter(format!(
                "sampled texture '{}' cannot use depth format {:?}",
                desc.debug_name, desc.format
            )));
        }
        let expected = layer_size_bytes(desc.extent, desc.format) * kind.layers() as usize;
        if data.len() != expected {
            return Err(RhiError::InvalidParameter(format!(
                "sampled texture '{}' expects {} bytes of pixel data, got {}",
                desc.debug_name,
                expected,
                data.len()
            )));
        }

        let texture = self.create_texture(
            desc.extent,
            desc.format,
            kind,
            TextureRole::Sampled,
            desc.debug_name.clone(),
        )?;
        if let Err(err) = self.upload_texture(texture, data) {
            self.destroy_texture(texture);
            return Err(err);
        }
        log::debug!(
            "Created sampled texture '{}' ({}x{} {:?})",
            desc.debug_name,
            desc.extent.width,
            desc.extent.height,
            desc.format
        );
        Ok(texture)
    }

    /// Copy every layer of `data` into `texture` and leave it shader-readable.
    fn upload_texture(&mut self, texture: TextureHandle, data: &[u8]) -> RhiResult<()> {
        let entry = self.textures.require(texture)?;
        let (resource, state, layers) = (entry.resource, entry.state, entry.kind.layers());
        let layer_size = layer_size_bytes(entry.extent, entry.format) as u64;

        let staging = self.gpu.create_buffer(&GpuBufferDesc {
            size: data.len() as u64,
            heap: MemoryHeap::Upload,
            initial_state: ResourceState::GenericRead,
            debug_name: format!("{}_staging", entry.debug_name),
        })?;

        let result = self.gpu.write_buffer(staging, 0, data).and_then(|()| {
            let mut list = self.begin_immediate();
            list.barrier(resource, state, ResourceState::CopyDest);
            for layer in 0..layers {
                list.push(GpuCommand::CopyBufferToTexture {
                    src: staging,
                    src_offset: layer as u64 * layer_size,
                    dst: resource,
                    layer,
                });
            }
            list.barrier(
                resource,
                ResourceState::CopyDest,
                ResourceState::PixelShaderResource,
            );
            self.finish_immediate(list)
        });
        self.gpu.release_resource(staging);
        result?;

        self.textures.require_mut(texture)?.state = ResourceState::PixelShaderResource;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Immediate (synchronous) submissions
    // ------------------------------------------------------------------

    fn begin_immediate(&self) -> GpuCommandList {
        let mut list = GpuCommandList::new();
        list.reset(self.immediate_allocator);
        list
    }

    /// Execute `list` and block until the GPU finished it.
    fn finish_immediate(&mut self, mut list: GpuCommandList) -> RhiResult<()> {
        list.close();
        self.gpu.execute(&mut list)?;
        self.fence_value += 1;
        self.gpu.signal(self.fence_value)?;
        self.gpu.wait_for_value(self.fence_value)?;
        self.gpu.reset_command_allocator(self.immediate_allocator)
    }

    fn immediate_upload_buffer(
        &mut self,
        buffer: BufferHandle,
        data: &[u8],
        offset: u64,
    ) -> RhiResult<()> {
        let entry = self.buffers.require(buffer)?;
        let (resource, state) = (entry.resource, entry.state);

        let staging = self.gpu.create_buffer(&GpuBufferDesc {
            size: data.len() as u64,
            heap: MemoryHeap::Upload,
            initial_state: ResourceState::GenericRead,
            debug_name: format!("{}_staging", entry.desc.debug_name),
        })?;

        let result = self.gpu.write_buffer(staging, 0, data).and_then(|()| {
            let mut list = self.begin_immediate();
            list.barrier(resource, state, ResourceState::CopyDest);
            list.copy_buffer_region(resource, offset, staging, 0, data.len() as u64);
            list.barrier(resource, ResourceState::CopyDest, ResourceState::GenericRead);
            self.finish_immediate(list)
        });
        self.gpu.release_resource(staging);
        result?;

        self.buffers.require_mut(buffer)?.state = ResourceState::GenericRead;
        Ok(())
    }

    fn attachment_check(
        &self,
        texture: TextureHandle,
        kind: TextureKind,
        depth: bool,
    ) -> RhiResult<()> {
        if texture.is_null() {
            return Ok(());
        }
        let entry = self.textures.require(texture)?;
        let role_ok = if depth {
            entry.role == TextureRole::DepthStencil
        } else {
            matches!(entry.role, TextureRole::RenderTarget | TextureRole::BackBuffer)
        };
        if !role_ok || entry.kind != kind {
            return Err(RhiError::InvalidParameter(format!(
                "texture {} ('{}') cannot be a {:?} {} attachment",
                texture.raw(),
                entry.debug_name,
                kind,
                if depth { "depth" } else { "color" }
            )));
        }
        Ok(())
    }
}

/// Format shaders read a texture through.
fn sampling_format(format: TextureFormat) -> TextureFormat {
    match format {
        TextureFormat::Depth32Float => TextureFormat::R32Float,
        other => other,
    }
}

fn shader_view(resource: RawResource, format: TextureFormat, kind: TextureKind) -> ViewDesc {
    let format = sampling_format(format);
    match kind {
        TextureKind::Texture2D => ViewDesc::Texture2D { resource, format },
        TextureKind::Cube => ViewDesc::TextureCube { resource, format },
    }
}

impl RhiDevice for NativeDevice {
    fn name(&self) -> &str {
        &self.adapter_name
    }

    fn backend(&self) -> BackendType {
        BackendType::Native
    }

    fn capabilities(&self) -> Capabilities {
        self.caps
    }

    fn wait_idle(&mut self) -> RhiResult<()> {
        self.gpu.wait_for_value(self.fence_value)
    }

    fn create_texture_2d(&mut self, extent: Extent2D, format: TextureFormat) -> RhiResult<TextureHandle> {
        let role = if format.is_depth() {
            TextureRole::DepthStencil
        } else {
            TextureRole::RenderTarget
        };
        self.create_texture(
            extent,
            format,
            TextureKind::Texture2D,
            role,
            format!("texture2d_{}x{}", extent.width, extent.height),
        )
    }

    fn create_texture_cube(&mut self, extent: Extent2D, format: TextureFormat) -> RhiResult<TextureHandle> {
        let role = if format.is_depth() {
            TextureRole::DepthStencil
        } else {
            TextureRole::RenderTarget
        };
        self.create_texture(
            extent,
            format,
            TextureKind::Cube,
            role,
            format!("cube_{}", extent.width),
        )
    }

    fn create_sampled_texture(&mut self, desc: &SampledTextureDesc, pixels: &[u8]) -> RhiResult<TextureHandle> {
        self.create_sampled(desc, TextureKind::Texture2D, pixels)
    }

    fn create_sampled_texture_cube(
        &mut self,
        desc: &SampledTextureDesc,
        faces: &[u8],
    ) -> RhiResult<TextureHandle> {
        self.create_sampled(desc, TextureKind::Cube, faces)
    }

    fn replace_sampled_texture(&mut self, texture: TextureHandle, pixels: &[u8]) -> RhiResult<()> {
        let entry = self.textures.require(texture)?;
        if entry.role != TextureRole::Sampled {
            return Err(RhiError::InvalidParameter(format!(
                "texture {} ('{}') is not a sampled texture",
                texture.raw(),
                entry.debug_name
            )));
        }
        let expected = layer_size_bytes(entry.extent, entry.format) * entry.kind.layers() as usize;
        if pixels.len() != expected {
            return Err(RhiError::InvalidParameter(format!(
                "texture '{}' expects {} bytes of pixel data, got {}",
                entry.debug_name,
                expected,
                pixels.len()
            )));
        }
        self.upload_texture(texture, pixels)
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        let Some(entry) = self.textures.remove(texture) else {
            return;
        };
        log::trace!("Destroying texture '{}'", entry.debug_name);
        self.frames.deferred().resources.push(entry.resource);
        self.defer_views(&entry.views);
    }

    fn read_texture(&mut self, texture: TextureHandle, layer: u32) -> RhiResult<Vec<u8>> {
        let entry = self.textures.require(texture)?;
        if layer >= entry.kind.layers() {
            return Err(RhiError::InvalidParameter(format!(
                "texture '{}' has no layer {}",
                entry.debug_name, layer
            )));
        }
        let (resource, state) = (entry.resource, entry.state);
        let size = layer_size_bytes(entry.extent, entry.format);

        let readback = self.gpu.create_buffer(&GpuBufferDesc {
            size: size as u64,
            heap: MemoryHeap::Readback,
            initial_state: ResourceState::CopyDest,
            debug_name: format!("{}_readback", entry.debug_name),
        })?;

        let mut pixels = vec![0u8; size];
        let mut list = self.begin_immediate();
        list.barrier(resource, state, ResourceState::CopySource);
        list.push(GpuCommand::CopyTextureToBuffer {
            src: resource,
            layer,
            dst: readback,
            dst_offset: 0,
        });
        list.barrier(resource, ResourceState::CopySource, state);
        let result = self
            .finish_immediate(list)
            .and_then(|()| self.gpu.read_buffer(readback, 0, &mut pixels));
        self.gpu.release_resource(readback);
        result?;

        Ok(pixels)
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> RhiResult<BufferHandle> {
        if desc.size_bytes == 0 {
            return Err(RhiError::InvalidParameter(format!(
                "buffer '{}' has zero size",
                desc.debug_name
            )));
        }
        let structured_view = if desc.bind_flag == BufferBindFlag::StructuredBuffer {
            let stride = desc.structured_stride_bytes;
            let element_count = if stride == 0 {
                0
            } else {
                desc.size_bytes / stride as u64
            };
            if element_count == 0 {
                return Err(RhiError::InvalidParameter(format!(
                    "structured buffer '{}' needs a non-zero stride and at least one element (stride {}, size {})",
                    desc.debug_name, stride, desc.size_bytes
                )));
            }
            Some((stride, element_count as u32))
        } else {
            None
        };

        let resource = self.gpu.create_buffer(&GpuBufferDesc {
            size: desc.size_bytes,
            heap: MemoryHeap::Default,
            initial_state: ResourceState::Common,
            debug_name: desc.debug_name.clone(),
        })?;

        let srv = match structured_view {
            Some((stride, element_count)) => {
                match self.allocate_view(&ViewDesc::StructuredBuffer {
                    resource,
                    stride,
                    element_count,
                }) {
                    Ok(index) => Some(index),
                    Err(err) => {
                        self.gpu.release_resource(resource);
                        return Err(err);
                    }
                }
            }
            None => None,
        };

        Ok(self.buffers.insert(BufferEntry {
            resource,
            desc: desc.clone(),
            state: ResourceState::Common,
            srv,
        }))
    }

    fn update_buffer(&mut self, buffer: BufferHandle, data: &[u8], offset_bytes: u64) -> RhiResult<()> {
        if buffer.is_null() || data.is_empty() {
            return Ok(());
        }
        let Some(entry) = self.buffers.get(buffer) else {
            return Ok(());
        };
        let len = data.len() as u64;
        if offset_bytes.checked_add(len).map_or(true, |end| end > entry.desc.size_bytes) {
            return Err(RhiError::OutOfBounds {
                offset: offset_bytes,
                len,
                size: entry.desc.size_bytes,
            });
        }

        if !self.has_submitted {
            return self.immediate_upload_buffer(buffer, data, offset_bytes);
        }

        if len > self.config.upload_ring_bytes {
            return Err(RhiError::RingOverflow {
                ring: "upload",
                requested: len,
                offset: 0,
                capacity: self.config.upload_ring_bytes,
            });
        }
        self.pending_updates.push(PendingBufferUpdate {
            buffer,
            offset: offset_bytes,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        let Some(entry) = self.buffers.remove(buffer) else {
            return;
        };
        self.pending_updates.retain(|update| update.buffer != buffer);

        if self.has_submitted {
            let deferred = self.frames.deferred();
            deferred.resources.push(entry.resource);
            deferred.srv.extend(entry.srv);
        } else {
            // nothing can be in flight before the first submission
            self.gpu.release_resource(entry.resource);
            if let Some(index) = entry.srv {
                self.srv_pool.free(index);
            }
        }
    }

    fn create_input_layout(&mut self, desc: &InputLayoutDesc) -> RhiResult<InputLayoutHandle> {
        let slots = desc.slot_count();
        if slots > MAX_VERTEX_BUFFER_SLOTS {
            return Err(RhiError::InvalidParameter(format!(
                "input layout reads {} vertex buffer slots, at most {} are supported",
                slots, MAX_VERTEX_BUFFER_SLOTS
            )));
        }
        Ok(self.input_layouts.insert(InputLayoutEntry { desc: desc.clone() }))
    }

    fn destroy_input_layout(&mut self, layout: InputLayoutHandle) {
        if self.input_layouts.remove(layout).is_some() {
            let released = self.pso_cache.purge_input_layout(layout.raw());
            self.frames.deferred().pipelines.extend(released);
        }
    }

    fn create_shader(&mut self, stage: ShaderStage, name: &str, source: &str) -> RhiResult<ShaderHandle> {
        let mut last_error = None;
        for entry_point in entry_point_candidates(stage, name, ShaderModel::Sm5_1) {
            match self.gpu.compile_shader(stage, source, entry_point, ShaderModel::Sm5_1) {
                Ok(blob) => {
                    log::debug!("Compiled {:?} shader '{}' ({})", stage, name, entry_point);
                    return Ok(self.shaders.insert(ShaderEntry {
                        stage,
                        name: name.to_string(),
                        blob,
                    }));
                }
                Err(err) => last_error = Some(err),
            }
        }
        Err(RhiError::ShaderCompilationFailed(format!(
            "{:?} shader '{}': {}",
            stage,
            name,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    fn create_shader_ex(
        &mut self,
        stage: ShaderStage,
        name: &str,
        source: &str,
        model: ShaderModel,
    ) -> RhiResult<ShaderHandle> {
        if model == ShaderModel::Sm5_1 {
            return self.create_shader(stage, name, source);
        }
        if !self.caps.shader_model_6_1 {
            log::warn!("Shader model 6.1 unsupported, '{}' not created", name);
            return Ok(ShaderHandle::NULL);
        }

        for entry_point in entry_point_candidates(stage, name, model) {
            if let Ok(blob) = self.gpu.compile_shader(stage, source, entry_point, model) {
                log::debug!("Compiled {:?} shader '{}' ({}, SM 6.1)", stage, name, entry_point);
                return Ok(self.shaders.insert(ShaderEntry {
                    stage,
                    name: name.to_string(),
                    blob,
                }));
            }
        }
        log::warn!("Shader '{}' failed to compile for SM 6.1", name);
        Ok(ShaderHandle::NULL)
    }

    fn destroy_shader(&mut self, shader: ShaderHandle) {
        self.shaders.remove(shader);
    }

    fn create_pipeline_ex(
        &mut self,
        name: &str,
        vertex_shader: ShaderHandle,
        pixel_shader: ShaderHandle,
        topology: PrimitiveTopologyType,
        view_instance_count: u32,
    ) -> RhiResult<PipelineHandle> {
        let vs = self.shaders.require(vertex_shader)?;
        let ps = self.shaders.require(pixel_shader)?;
        if vs.stage != ShaderStage::Vertex || ps.stage != ShaderStage::Pixel {
            return Err(RhiError::InvalidParameter(format!(
                "pipeline '{}' needs a vertex and a pixel shader, got '{}' ({:?}) and '{}' ({:?})",
                name, vs.name, vs.stage, ps.name, ps.stage
            )));
        }

        let view_instance_count = view_instance_count.max(1);
        if view_instance_count > 1 {
            if !self.caps.view_instancing {
                log::warn!("View instancing unsupported, pipeline '{}' not created", name);
                return Ok(PipelineHandle::NULL);
            }
            if view_instance_count > MAX_VIEW_INSTANCES {
                log::warn!(
                    "Pipeline '{}' requests {} views, at most {} are supported",
                    name,
                    view_instance_count,
                    MAX_VIEW_INSTANCES
                );
                return Ok(PipelineHandle::NULL);
            }
        }

        Ok(self.pipelines.insert(PipelineEntry {
            name: name.to_string(),
            vertex_shader,
            pixel_shader,
            topology_type: topology,
            view_instance_count,
        }))
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineHandle) {
        if self.pipelines.remove(pipeline).is_some() {
            let released = self.pso_cache.purge_pipeline(pipeline.raw());
            self.frames.deferred().pipelines.extend(released);
        }
    }

    fn create_framebuffer(&mut self, color: TextureHandle, depth: TextureHandle) -> RhiResult<FramebufferHandle> {
        if color.is_null() && depth.is_null() {
            return Err(RhiError::InvalidParameter(
                "framebuffer needs a color or a depth attachment".to_string(),
            ));
        }
        self.attachment_check(color, TextureKind::Texture2D, false)?;
        self.attachment_check(depth, TextureKind::Texture2D, true)?;
        Ok(self.framebuffers.insert(FramebufferEntry {
            color,
            color_layout: AttachmentLayout::Whole,
            depth,
        }))
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
        self.attachment_check(color_cube, TextureKind::Cube, false)?;
        self.attachment_check(depth_cube, TextureKind::Cube, true)?;
        Ok(self.framebuffers.insert(FramebufferEntry {
            color: color_cube,
            color_layout: AttachmentLayout::CubeAllFaces,
            depth: depth_cube,
        }))
    }

    fn create_framebuffer_cube_face(
        &mut self,
        color_cube: TextureHandle,
        face: u32,
        depth: TextureHandle,
    ) -> RhiResult<FramebufferHandle> {
        if face >= 6 {
            return Err(RhiError::InvalidParameter(format!(
                "cube face {} out of range",
                face
            )));
        }
        if color_cube.is_null() {
            return Err(RhiError::InvalidParameter(
                "cube face framebuffer needs a color cube".to_string(),
            ));
        }
        self.attachment_check(color_cube, TextureKind::Cube, false)?;
        self.attachment_check(depth, TextureKind::Texture2D, true)?;
        Ok(self.framebuffers.insert(FramebufferEntry {
            color: color_cube,
            color_layout: AttachmentLayout::CubeFace(face),
            depth,
        }))
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        self.framebuffers.remove(framebuffer);
    }

    fn allocate_texture_descriptor(&mut self, texture: TextureHandle) -> RhiResult<TextureDescIndex> {
        let index = self.bindless.allocate();
        if let Err(err) = self.update_texture_descriptor(index, texture) {
            self.bindless.free(index);
            return Err(err);
        }
        Ok(index)
    }

    fn update_texture_descriptor(&mut self, index: TextureDescIndex, texture: TextureHandle) -> RhiResult<()> {
        if self.bindless.get(index).is_none() {
            return Err(RhiError::not_found(TextureDescIndex::KIND, index.raw()));
        }
        if !texture.is_null() {
            self.ensure_texture_srv(texture)?;
        }
        self.bindless.set(index, texture);
        Ok(())
    }

    fn free_texture_descriptor(&mut self, index: TextureDescIndex) {
        self.bindless.free(index);
    }

    fn create_fence(&mut self, signaled: bool) -> RhiResult<FenceHandle> {
        let target = if signaled { Some(0) } else { None };
        Ok(self.fences.insert(FenceEntry { target }))
    }

    fn destroy_fence(&mut self, fence: FenceHandle) {
        self.fences.remove(fence);
    }

    fn signal_fence(&mut self, fence: FenceHandle) -> RhiResult<()> {
        let value = self.fence_value;
        self.fences.require_mut(fence)?.target = Some(value);
        Ok(())
    }

    fn wait_fence(&mut self, fence: FenceHandle) -> RhiResult<()> {
        match self.fences.require(fence)?.target {
            Some(value) => self.gpu.wait_for_value(value),
            None => Err(RhiError::InvalidParameter(format!(
                "fence {} was never signaled",
                fence.raw()
            ))),
        }
    }

    fn is_fence_signaled(&mut self, fence: FenceHandle) -> RhiResult<bool> {
        let target = self.fences.require(fence)?.target;
        Ok(target.map_or(false, |value| self.gpu.completed_value() >= value))
    }

    fn create_swap_chain(&mut self, desc: &SwapChainDesc) -> RhiResult<Box<dyn SwapChain>> {
        if desc.buffer_count == 0 {
            return Err(RhiError::InvalidParameter(
                "swap chain needs at least one back buffer".to_string(),
            ));
        }
        if desc.format.is_depth() {
            return Err(RhiError::InvalidParameter(format!(
                "swap chain format {:?} is a depth format",
                desc.format
            )));
        }

        let mut back_buffers = Vec::with_capacity(desc.buffer_count as usize);
        for index in 0..desc.buffer_count {
            match self.create_texture(
                desc.extent,
                desc.format,
                TextureKind::Texture2D,
                TextureRole::BackBuffer,
                format!("back_buffer{index}"),
            ) {
                Ok(texture) => back_buffers.push(texture),
                Err(err) => {
                    for texture in back_buffers {
                        self.destroy_texture(texture);
                    }
                    return Err(err);
                }
            }
        }

        let depth = match desc.depth_format {
            Some(format) if format.is_depth() => {
                match self.create_texture(
                    desc.extent,
                    format,
                    TextureKind::Texture2D,
                    TextureRole::DepthStencil,
                    "swap_chain_depth".to_string(),
                ) {
                    Ok(texture) => texture,
                    Err(err) => {
                        for texture in back_buffers {
                            self.destroy_texture(texture);
                        }
                        return Err(err);
                    }
                }
            }
            Some(format) => {
                for texture in back_buffers {
                    self.destroy_texture(texture);
                }
                return Err(RhiError::InvalidParameter(format!(
                    "swap chain depth format {:?} is not a depth format",
                    format
                )));
            }
            None => TextureHandle::NULL,
        };

        log::info!(
            "Created swap chain {}x{} with {} back buffers",
            desc.extent.width,
            desc.extent.height,
            desc.buffer_count
        );
        Ok(Box::new(HeadlessSwapChain::new(desc, back_buffers, depth)))
    }

    fn submit_command_list(&mut self, commands: CommandList) -> RhiResult<()> {
        self.submit(commands)
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

/// Entry points tried in order when compiling `name`.
fn entry_point_candidates<'a>(stage: ShaderStage, name: &'a str, model: ShaderModel) -> Vec<&'a str> {
    let mut candidates = Vec::with_capacity(3);
    let fallbacks = match model {
        ShaderModel::Sm6_1 => ["main", stage.default_entry_point()].to_vec(),
        ShaderModel::Sm5_1 => vec![stage.default_entry_point()],
    };
    for candidate in std::iter::once(name).chain(fallbacks) {
        if !candidate.is_empty() && !candidates.contains(&candidate) {
            candidates.push(candidate);
        }
    }
    candidates
}

impl Drop for NativeDevice {
    fn drop(&mut self) {
        if let Err(e) = self.gpu.wait_for_value(self.fence_value) {
            log::warn!("Native device dropped while the GPU was not idle: {}", e);
            return;
        }

        let deferred = self.frames.drain_all();
        self.release_deferred(deferred);
        for pipeline in self.pso_cache.drain() {
            self.gpu.release_pipeline(pipeline);
        }
        for entry in self.textures.drain() {
            self.gpu.release_resource(entry.resource);
        }
        for entry in self.buffers.drain() {
            self.gpu.release_resource(entry.resource);
        }
        for resource in self.frames.ring_resources() {
            self.gpu.release_resource(resource);
        }
        log::debug!("Native device on '{}' destroyed", self.adapter_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> NativeDevice {
        NativeDevice::with_soft_gpu(NativeConfig::default()).unwrap()
    }

    #[test]
    fn test_entry_point_candidates() {
        assert_eq!(
            entry_point_candidates(ShaderStage::Vertex, "ShadowVS", ShaderModel::Sm5_1),
            vec!["ShadowVS", "VSMain"]
        );
        assert_eq!(
            entry_point_candidates(ShaderStage::Pixel, "PSMain", ShaderModel::Sm6_1),
            vec!["PSMain", "main"]
        );
        assert_eq!(
            entry_point_candidates(ShaderStage::Vertex, "CubeVS", ShaderModel::Sm6_1),
            vec!["CubeVS", "main", "VSMain"]
        );
        assert_eq!(
            entry_point_candidates(ShaderStage::Pixel, "", ShaderModel::Sm5_1),
            vec!["PSMain"]
        );
    }

    #[test]
    fn test_color_texture_views() {
        let mut device = device();
        let texture = device
            .create_texture_2d(Extent2D::new(64, 64), TextureFormat::Rgba8Unorm)
            .unwrap();
        let views = device.texture_views(texture).unwrap();
        assert!(views.rtv.is_some());
        assert_eq!(views.srv, Some(FIRST_DYNAMIC_SRV));
        assert!(views.dsv.is_none());
        assert_eq!(device.texture_state(texture), Some(ResourceState::RenderTarget));
    }

    #[test]
    fn test_depth_texture_views() {
        let mut device = device();
        let texture = device
            .create_texture_2d(Extent2D::new(64, 64), TextureFormat::Depth32Float)
            .unwrap();
        let views = device.texture_views(texture).unwrap();
        assert!(views.dsv.is_some());
        assert!(views.srv.is_some());
        assert!(views.rtv.is_none());
        assert_eq!(device.texture_state(texture), Some(ResourceState::DepthWrite));
    }

    #[test]
    fn test_cube_views() {
        let mut device = device();
        let color = device
            .create_texture_cube(Extent2D::new(32, 32), TextureFormat::Rgba16Float)
            .unwrap();
        let views = device.texture_views(color).unwrap();
        assert!(views.rtv_faces.is_some());
        assert!(views.rtv_all_faces.is_some());
        assert!(views.srv_array.is_none());

        let depth = device
            .create_texture_cube(Extent2D::new(32, 32), TextureFormat::Depth32Float)
            .unwrap();
        let views = device.texture_views(depth).unwrap();
        assert!(views.dsv_all_faces.is_some());
        assert!(views.dsv.is_none());
    }

    #[test]
    fn test_structured_buffer_validation() {
        let mut device = device();
        assert!(device.create_buffer(&BufferDesc::structured(64, 0)).is_err());
        assert!(device.create_buffer(&BufferDesc::structured(8, 16)).is_err());

        let before = device.descriptor_usage().shader_resource;
        device.create_buffer(&BufferDesc::structured(64, 16)).unwrap();
        assert_eq!(device.descriptor_usage().shader_resource, before + 1);
    }

    #[test]
    fn test_framebuffer_attachment_checks() {
        let mut device = device();
        let color = device
            .create_texture_2d(Extent2D::new(16, 16), TextureFormat::Rgba8Unorm)
            .unwrap();
        let depth = device
            .create_texture_2d(Extent2D::new(16, 16), TextureFormat::Depth32Float)
            .unwrap();
        let cube = device
            .create_texture_cube(Extent2D::new(16, 16), TextureFormat::Rgba8Unorm)
            .unwrap();

        assert!(device.create_framebuffer(color, depth).is_ok());
        assert!(device.create_framebuffer(depth, color).is_err());
        assert!(device.create_framebuffer(cube, TextureHandle::NULL).is_err());
        assert!(device.create_framebuffer_cube_face(cube, 5, depth).is_ok());
        assert!(device.create_framebuffer_cube_face(cube, 6, depth).is_err());
        assert!(matches!(
            device.create_framebuffer(TextureHandle::from_raw(99), TextureHandle::NULL),
            Err(RhiError::HandleNotFound { kind: "texture", id: 99 })
        ));
    }

    #[test]
    fn test_unsupported_view_instancing_returns_null() {
        let gpu = SoftGpu::with_capabilities(Capabilities::default());
        let mut device = NativeDevice::new(Box::new(gpu), NativeConfig::default()).unwrap();
        let vs = device
            .create_shader(ShaderStage::Vertex, "VSMain", "fn VSMain() {}")
            .unwrap();
        let ps = device
            .create_shader(ShaderStage::Pixel, "PSMain", "fn PSMain() {}")
            .unwrap();

        let pipeline = device
            .create_pipeline_ex("multi", vs, ps, PrimitiveTopologyType::Triangle, 6)
            .unwrap();
        assert!(pipeline.is_null());

        let shader = device
            .create_shader_ex(ShaderStage::Vertex, "VSMain", "fn VSMain() {}", ShaderModel::Sm6_1)
            .unwrap();
        assert!(shader.is_null());
    }
}
