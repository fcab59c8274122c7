//! Object storage, queue execution and validation of the software GPU.
//!
//! CPU-side calls and the queue worker share one [`SoftState`] behind a
//! mutex. Validation follows the rules of explicit APIs:
//! - a barrier's `before` state must match the state the queue tracked
//! - draws need a pipeline, render targets, a viewport and every root
//!   parameter, and every bound resource in the state its use requires
//! - resources, descriptor slots, pipelines and command allocators must
//!   not be released, rewritten or reset while queued work that uses them
//!   has not completed
//!
//! Use tracking works like a fence-stamped residency list: executing a
//! list marks everything it references as "unstamped"; the next signal
//! stamps those objects with its value. An object is idle once it is not
//! unstamped and its stamp is at most the completed value.
//!
//! Violations do not fail the call. They are logged and collected for
//! [`SoftGpuProbe::validation_errors`](super::SoftGpuProbe::validation_errors).

use std::collections::{HashMap, HashSet, VecDeque};

use crate::backend::native::gpu::*;
use crate::error::{HeapKind, RhiError, RhiResult};
use crate::rhi::{
    layer_size_bytes, Capabilities, Extent2D, PrimitiveTopology, TextureFormat, MAX_TEXTURE_SLOTS,
};

use super::texel::{encode_color, encode_depth};

/// Number of root parameters: constants plus one table per texture register.
const ROOT_PARAMETER_COUNT: u32 = ROOT_PARAM_FIRST_TABLE + MAX_TEXTURE_SLOTS;

pub(super) enum QueueItem {
    Execute(Vec<GpuCommand>),
    Signal(u64),
}

/// Work counters of a software GPU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SoftGpuStats {
    /// Command lists executed on the queue
    pub submissions: u64,
    pub signals: u64,
    pub pipelines_created: u64,
    pub draws: u64,
    pub barriers: u64,
    pub clears: u64,
    pub copies: u64,
}

enum Storage {
    Buffer(Vec<u8>),
    Texture {
        extent: Extent2D,
        format: TextureFormat,
        layers: Vec<Vec<u8>>,
    },
}

struct SoftResource {
    name: String,
    heap: MemoryHeap,
    /// State on the queue timeline
    state: ResourceState,
    storage: Storage,
}

struct SoftHeap {
    kind: HeapKind,
    slots: Vec<Option<ViewDesc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum UseKey {
    Resource(RawResource),
    Descriptor(DescriptorRef),
    Pipeline(RawPipeline),
    Allocator(RawAllocator),
}

/// Bindings of the command list being executed
#[derive(Default)]
struct ListState {
    pipeline: Option<RawPipeline>,
    topology: Option<PrimitiveTopology>,
    rtvs: Vec<DescriptorRef>,
    dsv: Option<DescriptorRef>,
    viewport: bool,
    vertex_buffers: usize,
    index_buffer: bool,
    /// Bit per root parameter
    root_parameters: u32,
    tables: [Option<DescriptorRef>; MAX_TEXTURE_SLOTS as usize],
}

pub(super) struct SoftState {
    pub(super) capabilities: Capabilities,
    pub(super) reject_multi_view_pipelines: bool,
    pub(super) queue: VecDeque<QueueItem>,
    pub(super) paused: bool,
    pub(super) shutdown: bool,
    pub(super) completed: u64,
    pub(super) last_signal: u64,
    pub(super) errors: Vec<String>,
    pub(super) stats: SoftGpuStats,

    next_id: u64,
    resources: HashMap<RawResource, SoftResource>,
    heaps: HashMap<RawHeap, SoftHeap>,
    pipelines: HashMap<RawPipeline, GpuPipelineDesc>,
    allocators: HashSet<RawAllocator>,
    unstamped: HashSet<UseKey>,
    last_use: HashMap<UseKey, u64>,
}

fn gpu_error(message: impl Into<String>) -> RhiError {
    RhiError::Gpu(message.into())
}

fn slot_count(attributes: &[crate::rhi::VertexAttribute]) -> usize {
    attributes
        .iter()
        .map(|a| a.input_slot as usize + 1)
        .max()
        .unwrap_or(0)
}

impl SoftState {
    pub(super) fn new(capabilities: Capabilities, reject_multi_view_pipelines: bool) -> Self {
        Self {
            capabilities,
            reject_multi_view_pipelines,
            queue: VecDeque::new(),
            paused: false,
            shutdown: false,
            completed: 0,
            last_signal: 0,
            errors: Vec::new(),
            stats: SoftGpuStats::default(),
            next_id: 0,
            resources: HashMap::new(),
            heaps: HashMap::new(),
            pipelines: HashMap::new(),
            allocators: HashSet::new(),
            unstamped: HashSet::new(),
            last_use: HashMap::new(),
        }
    }

    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn report(&mut self, message: String) {
        log::error!("GPU validation: {}", message);
        self.errors.push(message);
    }

    /// Report `what` if `key` may still be used by queued work.
    fn check_idle(&mut self, key: UseKey, what: &str) {
        if self.unstamped.contains(&key) {
            self.report(format!("{what}: {key:?} is used by work that was never signaled"));
        } else if let Some(&stamp) = self.last_use.get(&key) {
            if stamp > self.completed {
                let completed = self.completed;
                self.report(format!(
                    "{what}: {key:?} is used by work fenced at {stamp}, completed is {completed}"
                ));
            }
        }
    }

    // ------------------------------------------------------------------
    // CPU-side API
    // ------------------------------------------------------------------

    pub(super) fn create_buffer(&mut self, desc: &GpuBufferDesc) -> RhiResult<RawResource> {
        if desc.size == 0 {
            return Err(gpu_error(format!("buffer '{}' has zero size", desc.debug_name)));
        }
        let resource = RawResource(self.alloc_id());
        self.resources.insert(
            resource,
            SoftResource {
                name: desc.debug_name.clone(),
                heap: desc.heap,
                state: desc.initial_state,
                storage: Storage::Buffer(vec![0; desc.size as usize]),
            },
        );
        Ok(resource)
    }

    pub(super) fn create_texture(&mut self, desc: &GpuTextureDesc) -> RhiResult<RawResource> {
        if desc.extent.is_empty() || desc.array_layers == 0 {
            return Err(gpu_error(format!("texture '{}' is empty", desc.debug_name)));
        }
        if desc.cube && desc.array_layers != 6 {
            return Err(gpu_error(format!(
                "cube texture '{}' must have 6 layers",
                desc.debug_name
            )));
        }
        if desc.usage.depth_stencil != desc.format.is_depth() {
            return Err(gpu_error(format!(
                "texture '{}': depth usage does not match format {:?}",
                desc.debug_name, desc.format
            )));
        }
        let layer_size = layer_size_bytes(desc.extent, desc.format);
        let resource = RawResource(self.alloc_id());
        self.resources.insert(
            resource,
            SoftResource {
                name: desc.debug_name.clone(),
                heap: MemoryHeap::Default,
                state: desc.initial_state,
                storage: Storage::Texture {
                    extent: desc.extent,
                    format: desc.format,
                    layers: vec![vec![0; layer_size]; desc.array_layers as usize],
                },
            },
        );
        Ok(resource)
    }

    pub(super) fn release_resource(&mut self, resource: RawResource) {
        self.check_idle(UseKey::Resource(resource), "release_resource");
        if self.resources.remove(&resource).is_none() {
            self.report(format!("release_resource: unknown resource {resource:?}"));
        }
        self.last_use.remove(&UseKey::Resource(resource));
    }

    fn mapped_buffer(&mut self, resource: RawResource, heap: MemoryHeap) -> RhiResult<&mut Vec<u8>> {
        let entry = self
            .resources
            .get_mut(&resource)
            .ok_or_else(|| gpu_error(format!("unknown resource {resource:?}")))?;
        match &mut entry.storage {
            Storage::Buffer(data) if entry.heap == heap => Ok(data),
            _ => Err(gpu_error(format!(
                "resource '{}' is not a buffer in the {:?} heap",
                entry.name, heap
            ))),
        }
    }

    pub(super) fn write_buffer(&mut self, resource: RawResource, offset: u64, data: &[u8]) -> RhiResult<()> {
        self.check_idle(UseKey::Resource(resource), "write_buffer");
        let buffer = self.mapped_buffer(resource, MemoryHeap::Upload)?;
        let end = offset as usize + data.len();
        if end > buffer.len() {
            return Err(RhiError::OutOfBounds {
                offset,
                len: data.len() as u64,
                size: buffer.len() as u64,
            });
        }
        buffer[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    pub(super) fn read_buffer(&mut self, resource: RawResource, offset: u64, out: &mut [u8]) -> RhiResult<()> {
        self.check_idle(UseKey::Resource(resource), "read_buffer");
        let buffer = self.mapped_buffer(resource, MemoryHeap::Readback)?;
        let end = offset as usize + out.len();
        if end > buffer.len() {
            return Err(RhiError::OutOfBounds {
                offset,
                len: out.len() as u64,
                size: buffer.len() as u64,
            });
        }
        out.copy_from_slice(&buffer[offset as usize..end]);
        Ok(())
    }

    pub(super) fn create_descriptor_heap(&mut self, kind: HeapKind, capacity: u32) -> RhiResult<RawHeap> {
        if capacity == 0 {
            return Err(gpu_error(format!("{kind} heap with zero capacity")));
        }
        let heap = RawHeap(self.alloc_id());
        self.heaps.insert(
            heap,
            SoftHeap {
                kind,
                slots: vec![None; capacity as usize],
            },
        );
        Ok(heap)
    }

    pub(super) fn write_descriptor(&mut self, heap: RawHeap, index: u32, view: &ViewDesc) -> RhiResult<()> {
        if let Some(resource) = view.resource() {
            if !self.resources.contains_key(&resource) {
                return Err(gpu_error(format!(
                    "view of unknown resource {resource:?}"
                )));
            }
        }
        self.check_idle(
            UseKey::Descriptor(DescriptorRef { heap, index }),
            "write_descriptor",
        );
        let target = self
            .heaps
            .get_mut(&heap)
            .ok_or_else(|| gpu_error(format!("unknown descriptor heap {heap:?}")))?;
        if target.kind != view.heap_kind() {
            return Err(gpu_error(format!(
                "{:?} view written into a {} heap",
                view, target.kind
            )));
        }
        let capacity = target.slots.len();
        let slot = target.slots.get_mut(index as usize).ok_or_else(|| {
            gpu_error(format!("descriptor {index} out of range (capacity {capacity})"))
        })?;
        *slot = Some(*view);
        Ok(())
    }

    fn view(&self, descriptor: DescriptorRef) -> Option<ViewDesc> {
        self.heaps
            .get(&descriptor.heap)
            .and_then(|heap| heap.slots.get(descriptor.index as usize).copied().flatten())
    }

    pub(super) fn create_pipeline(&mut self, desc: &GpuPipelineDesc) -> RhiResult<RawPipeline> {
        if desc.rtv_formats.len() > MAX_RENDER_TARGETS {
            return Err(gpu_error(format!(
                "pipeline '{}' has {} render targets",
                desc.name,
                desc.rtv_formats.len()
            )));
        }
        if desc.rtv_formats.is_empty() && desc.dsv_format.is_none() {
            return Err(gpu_error(format!(
                "pipeline '{}' has no render target and no depth format",
                desc.name
            )));
        }
        if desc.vertex.stage != crate::rhi::ShaderStage::Vertex
            || desc.pixel.stage != crate::rhi::ShaderStage::Pixel
        {
            return Err(gpu_error(format!("pipeline '{}' has mismatched shader stages", desc.name)));
        }
        if desc.view_instance_count > 1 {
            if !self.capabilities.view_instancing
                || desc.view_instance_count > MAX_VIEW_INSTANCES
                || self.reject_multi_view_pipelines
            {
                return Err(gpu_error(format!(
                    "pipeline '{}' with {} view instances is not supported",
                    desc.name, desc.view_instance_count
                )));
            }
        }
        let pipeline = RawPipeline(self.alloc_id());
        self.pipelines.insert(pipeline, desc.clone());
        self.stats.pipelines_created += 1;
        Ok(pipeline)
    }

    pub(super) fn release_pipeline(&mut self, pipeline: RawPipeline) {
        self.check_idle(UseKey::Pipeline(pipeline), "release_pipeline");
        if self.pipelines.remove(&pipeline).is_none() {
            self.report(format!("release_pipeline: unknown pipeline {pipeline:?}"));
        }
        self.last_use.remove(&UseKey::Pipeline(pipeline));
    }

    pub(super) fn create_command_allocator(&mut self) -> RawAllocator {
        let allocator = RawAllocator(self.alloc_id());
        self.allocators.insert(allocator);
        allocator
    }

    pub(super) fn reset_command_allocator(&mut self, allocator: RawAllocator) -> RhiResult<()> {
        if !self.allocators.contains(&allocator) {
            return Err(gpu_error(format!("unknown command allocator {allocator:?}")));
        }
        self.check_idle(UseKey::Allocator(allocator), "reset_command_allocator");
        Ok(())
    }

    pub(super) fn execute(&mut self, list: &mut GpuCommandList) -> RhiResult<()> {
        if list.is_open() {
            return Err(gpu_error("executing a command list that is still open"));
        }
        let allocator = list
            .allocator()
            .ok_or_else(|| gpu_error("executing a command list without an allocator"))?;
        if !self.allocators.contains(&allocator) {
            return Err(gpu_error(format!("unknown command allocator {allocator:?}")));
        }

        let commands = list.take_commands();
        self.unstamped.insert(UseKey::Allocator(allocator));
        for command in &commands {
            self.mark_uses(command);
        }
        self.stats.submissions += 1;
        self.queue.push_back(QueueItem::Execute(commands));
        Ok(())
    }

    fn mark_descriptor(&mut self, descriptor: DescriptorRef) {
        self.unstamped.insert(UseKey::Descriptor(descriptor));
        if let Some(resource) = self.view(descriptor).and_then(|v| v.resource()) {
            self.unstamped.insert(UseKey::Resource(resource));
        }
    }

    fn mark_uses(&mut self, command: &GpuCommand) {
        let mut resources = Vec::new();
        match command {
            GpuCommand::Barrier { resource, .. } => resources.push(*resource),
            GpuCommand::SetRenderTargets { rtvs, dsv } => {
                for descriptor in rtvs.iter().chain(dsv.iter()) {
                    self.mark_descriptor(*descriptor);
                }
            }
            GpuCommand::ClearRenderTarget { rtv: descriptor, .. }
            | GpuCommand::ClearDepth { dsv: descriptor, .. }
            | GpuCommand::SetRootDescriptorTable { descriptor, .. } => {
                self.mark_descriptor(*descriptor)
            }
            GpuCommand::SetPipeline(pipeline) => {
                self.unstamped.insert(UseKey::Pipeline(*pipeline));
            }
            GpuCommand::SetVertexBuffers(views) => {
                resources.extend(views.iter().map(|v| v.resource))
            }
            GpuCommand::SetIndexBuffer(view) => resources.push(view.resource),
            GpuCommand::SetRootConstantBuffer { resource, .. } => resources.push(*resource),
            GpuCommand::CopyBufferRegion { dst, src, .. }
            | GpuCommand::CopyBufferToTexture { src, dst, .. }
            | GpuCommand::CopyTextureToBuffer { src, dst, .. } => {
                resources.push(*src);
                resources.push(*dst);
            }
            GpuCommand::SetViewport(_)
            | GpuCommand::SetScissor(_)
            | GpuCommand::SetPrimitiveTopology(_)
            | GpuCommand::Draw { .. }
            | GpuCommand::DrawIndexed { .. } => {}
        }
        for resource in resources {
            self.unstamped.insert(UseKey::Resource(resource));
        }
    }

    pub(super) fn signal(&mut self, value: u64) -> RhiResult<()> {
        if value <= self.last_signal {
            return Err(gpu_error(format!(
                "fence signal {} does not exceed the previous signal {}",
                value, self.last_signal
            )));
        }
        for key in self.unstamped.drain() {
            self.last_use.insert(key, value);
        }
        self.last_signal = value;
        self.queue.push_back(QueueItem::Signal(value));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queue timeline
    // ------------------------------------------------------------------

    pub(super) fn run(&mut self, item: QueueItem) {
        match item {
            QueueItem::Execute(commands) => {
                let mut list = ListState::default();
                for command in commands {
                    self.run_command(&mut list, command);
                }
            }
            QueueItem::Signal(value) => {
                self.completed = value;
                self.stats.signals += 1;
            }
        }
    }

    fn run_command(&mut self, list: &mut ListState, command: GpuCommand) {
        match command {
            GpuCommand::Barrier {
                resource,
                before,
                after,
            } => {
                self.stats.barriers += 1;
                match self.resources.get_mut(&resource) {
                    Some(entry) if entry.state == before => entry.state = after,
                    Some(entry) => {
                        let message = format!(
                            "barrier on '{}' expects {:?} but the resource is in {:?}",
                            entry.name, before, entry.state
                        );
                        entry.state = after;
                        self.report(message);
                    }
                    None => self.report(format!("barrier on unknown resource {resource:?}")),
                }
            }
            GpuCommand::SetRenderTargets { rtvs, dsv } => {
                list.rtvs = rtvs;
                list.dsv = dsv;
            }
            GpuCommand::ClearRenderTarget { rtv, color } => self.clear(rtv, |format| encode_color(format, color)),
            GpuCommand::ClearDepth { dsv, depth } => self.clear(dsv, |format| encode_depth(format, depth)),
            GpuCommand::SetViewport(viewport) => {
                list.viewport = viewport.width > 0.0 && viewport.height > 0.0;
            }
            GpuCommand::SetScissor(_) => {}
            GpuCommand::SetPipeline(pipeline) => {
                if !self.pipelines.contains_key(&pipeline) {
                    self.report(format!("set unknown pipeline {pipeline:?}"));
                }
                list.pipeline = Some(pipeline);
            }
            GpuCommand::SetPrimitiveTopology(topology) => list.topology = Some(topology),
            GpuCommand::SetVertexBuffers(views) => {
                for view in &views {
                    self.expect_buffer_readable(view.resource, "vertex buffer");
                }
                list.vertex_buffers = views.len();
            }
            GpuCommand::SetIndexBuffer(view) => {
                self.expect_buffer_readable(view.resource, "index buffer");
                list.index_buffer = true;
            }
            GpuCommand::SetRootConstantBuffer { parameter, resource, .. } => {
                if parameter != ROOT_PARAM_CONSTANTS {
                    self.report(format!("constant buffer bound to root parameter {parameter}"));
                }
                if !self.resources.contains_key(&resource) {
                    self.report(format!("constant buffer {resource:?} does not exist"));
                }
                list.root_parameters |= 1 << parameter.min(31);
            }
            GpuCommand::SetRootDescriptorTable { parameter, descriptor } => {
                let register = parameter.wrapping_sub(ROOT_PARAM_FIRST_TABLE);
                if register >= MAX_TEXTURE_SLOTS {
                    self.report(format!("descriptor table bound to root parameter {parameter}"));
                    return;
                }
                list.tables[register as usize] = Some(descriptor);
                list.root_parameters |= 1 << parameter;
            }
            GpuCommand::Draw { .. } => self.validate_draw(list, false),
            GpuCommand::DrawIndexed { .. } => self.validate_draw(list, true),
            GpuCommand::CopyBufferRegion {
                dst,
                dst_offset,
                src,
                src_offset,
                size,
            } => {
                self.stats.copies += 1;
                if let Err(message) = self.copy_buffer(dst, dst_offset, src, src_offset, size) {
                    self.report(message);
                }
            }
            GpuCommand::CopyBufferToTexture {
                src,
                src_offset,
                dst,
                layer,
            } => {
                self.stats.copies += 1;
                if let Err(message) = self.copy_buffer_to_texture(src, src_offset, dst, layer) {
                    self.report(message);
                }
            }
            GpuCommand::CopyTextureToBuffer {
                src,
                layer,
                dst,
                dst_offset,
            } => {
                self.stats.copies += 1;
                if let Err(message) = self.copy_texture_to_buffer(src, layer, dst, dst_offset) {
                    self.report(message);
                }
            }
        }
    }

    fn expect_buffer_readable(&mut self, resource: RawResource, what: &str) {
        match self.resources.get(&resource) {
            Some(entry) if matches!(entry.state, ResourceState::Common | ResourceState::GenericRead) => {}
            Some(entry) => {
                let message = format!("{} '{}' read in state {:?}", what, entry.name, entry.state);
                self.report(message);
            }
            None => self.report(format!("{what} {resource:?} does not exist")),
        }
    }

    fn clear(&mut self, descriptor: DescriptorRef, encode: impl Fn(TextureFormat) -> Vec<u8>) {
        self.stats.clears += 1;
        let (resource, first_layer, layer_count, expected) = match self.view(descriptor) {
            Some(ViewDesc::RenderTarget {
                resource,
                first_layer,
                layer_count,
                ..
            }) => (resource, first_layer, layer_count, ResourceState::RenderTarget),
            Some(ViewDesc::DepthStencil {
                resource,
                first_layer,
                layer_count,
                ..
            }) => (resource, first_layer, layer_count, ResourceState::DepthWrite),
            other => {
                self.report(format!("clear through {descriptor:?} holding {other:?}"));
                return;
            }
        };

        let Some(entry) = self.resources.get_mut(&resource) else {
            self.report(format!("clear of released resource {resource:?}"));
            return;
        };
        let state_error = (entry.state != expected).then(|| {
            format!(
                "clear of '{}' in state {:?}, expected {:?}",
                entry.name, entry.state, expected
            )
        });
        if let Storage::Texture { format, layers, .. } = &mut entry.storage {
            let texel = encode(*format);
            for layer in layers
                .iter_mut()
                .skip(first_layer as usize)
                .take(layer_count as usize)
            {
                for chunk in layer.chunks_exact_mut(texel.len()) {
                    chunk.copy_from_slice(&texel);
                }
            }
        }
        if let Some(message) = state_error {
            self.report(message);
        }
    }

    fn validate_draw(&mut self, list: &ListState, indexed: bool) {
        self.stats.draws += 1;
        let mut problems = Vec::new();

        let Some(pipeline_id) = list.pipeline.filter(|p| self.pipelines.contains_key(p)) else {
            self.report("draw without a pipeline".to_string());
            return;
        };
        let pipeline = &self.pipelines[&pipeline_id];

        if !list.viewport {
            problems.push("no viewport".to_string());
        }
        let all_parameters = (1u32 << ROOT_PARAMETER_COUNT) - 1;
        if list.root_parameters & all_parameters != all_parameters {
            problems.push(format!(
                "root parameters {:#x} of {:#x} bound",
                list.root_parameters, all_parameters
            ));
        }
        match list.topology {
            Some(topology) if topology.topology_type() == pipeline.topology_type => {}
            other => problems.push(format!(
                "topology {:?} does not match pipeline type {:?}",
                other, pipeline.topology_type
            )),
        }
        let slots = slot_count(&pipeline.input_layout);
        if list.vertex_buffers < slots {
            problems.push(format!(
                "{} vertex buffers bound, pipeline reads {}",
                list.vertex_buffers, slots
            ));
        }
        if indexed && !list.index_buffer {
            problems.push("indexed draw without an index buffer".to_string());
        }

        // render targets against the pipeline's formats
        if list.rtvs.len() != pipeline.rtv_formats.len() {
            problems.push(format!(
                "{} render targets bound, pipeline '{}' writes {}",
                list.rtvs.len(),
                pipeline.name,
                pipeline.rtv_formats.len()
            ));
        }
        let mut attachments = Vec::new();
        for (rtv, expected_format) in list.rtvs.iter().zip(&pipeline.rtv_formats) {
            match self.view(*rtv) {
                Some(ViewDesc::RenderTarget {
                    resource,
                    format,
                    layer_count,
                    ..
                }) => {
                    if format != *expected_format {
                        problems.push(format!(
                            "render target format {:?}, pipeline expects {:?}",
                            format, expected_format
                        ));
                    }
                    if pipeline.view_instance_count > 1 && layer_count < pipeline.view_instance_count {
                        problems.push(format!(
                            "{} views broadcast into {} layers",
                            pipeline.view_instance_count, layer_count
                        ));
                    }
                    attachments.push((resource, ResourceState::RenderTarget));
                }
                other => problems.push(format!("render target slot holds {other:?}")),
            }
        }
        match (list.dsv.and_then(|d| self.view(d)), pipeline.dsv_format) {
            (None, None) => {}
            (Some(ViewDesc::DepthStencil { resource, format, .. }), Some(expected)) => {
                if format != expected {
                    problems.push(format!(
                        "depth format {:?}, pipeline expects {:?}",
                        format, expected
                    ));
                }
                attachments.push((resource, ResourceState::DepthWrite));
            }
            (bound, expected) => problems.push(format!(
                "depth target {:?} does not match pipeline depth format {:?}",
                bound, expected
            )),
        }

        for (resource, expected) in attachments {
            match self.resources.get(&resource) {
                Some(entry) if entry.state == expected => {}
                Some(entry) => problems.push(format!(
                    "attachment '{}' in state {:?}, expected {:?}",
                    entry.name, entry.state, expected
                )),
                None => problems.push(format!("attachment {resource:?} was released")),
            }
        }

        for (register, descriptor) in list.tables.iter().enumerate() {
            let Some(descriptor) = descriptor else {
                continue;
            };
            let Some(view) = self.view(*descriptor) else {
                problems.push(format!("t{register} reads an unwritten descriptor"));
                continue;
            };
            let Some(resource) = view.resource() else {
                continue;
            };
            let Some(entry) = self.resources.get(&resource) else {
                problems.push(format!("t{register} reads released resource {resource:?}"));
                continue;
            };
            let readable = match view {
                ViewDesc::StructuredBuffer { .. } => {
                    matches!(entry.state, ResourceState::Common | ResourceState::GenericRead)
                }
                _ => entry.state == ResourceState::PixelShaderResource,
            };
            if !readable {
                problems.push(format!(
                    "t{} reads '{}' in state {:?}",
                    register, entry.name, entry.state
                ));
            }
        }

        for problem in problems {
            self.report(format!("draw: {problem}"));
        }
    }

    fn copy_buffer(
        &mut self,
        dst: RawResource,
        dst_offset: u64,
        src: RawResource,
        src_offset: u64,
        size: u64,
    ) -> Result<(), String> {
        let data = {
            let source = self.copy_source(src)?;
            let Storage::Buffer(bytes) = &source.storage else {
                return Err(format!("copy source '{}' is not a buffer", source.name));
            };
            let range = src_offset as usize..(src_offset + size) as usize;
            bytes
                .get(range)
                .ok_or_else(|| format!("copy reads past the end of '{}'", source.name))?
                .to_vec()
        };
        let target = self.copy_target(dst)?;
        let name = target.name.clone();
        let Storage::Buffer(bytes) = &mut target.storage else {
            return Err(format!("copy destination '{name}' is not a buffer"));
        };
        bytes
            .get_mut(dst_offset as usize..(dst_offset + size) as usize)
            .ok_or_else(|| format!("copy writes past the end of '{name}'"))?
            .copy_from_slice(&data);
        Ok(())
    }

    fn copy_buffer_to_texture(
        &mut self,
        src: RawResource,
        src_offset: u64,
        dst: RawResource,
        layer: u32,
    ) -> Result<(), String> {
        let layer_size = match self.resources.get(&dst).map(|r| &r.storage) {
            Some(Storage::Texture { extent, format, .. }) => layer_size_bytes(*extent, *format),
            _ => return Err(format!("copy destination {dst:?} is not a texture")),
        };
        let data = {
            let source = self.copy_source(src)?;
            let Storage::Buffer(bytes) = &source.storage else {
                return Err(format!("copy source '{}' is not a buffer", source.name));
            };
            bytes
                .get(src_offset as usize..src_offset as usize + layer_size)
                .ok_or_else(|| format!("texture upload reads past the end of '{}'", source.name))?
                .to_vec()
        };
        let target = self.copy_target(dst)?;
        let name = target.name.clone();
        let Storage::Texture { layers, .. } = &mut target.storage else {
            return Err(format!("copy destination '{name}' is not a texture"));
        };
        layers
            .get_mut(layer as usize)
            .ok_or_else(|| format!("texture '{name}' has no layer {layer}"))?
            .copy_from_slice(&data);
        Ok(())
    }

    fn copy_texture_to_buffer(
        &mut self,
        src: RawResource,
        layer: u32,
        dst: RawResource,
        dst_offset: u64,
    ) -> Result<(), String> {
        let data = {
            let source = self.copy_source(src)?;
            let Storage::Texture { layers, .. } = &source.storage else {
                return Err(format!("copy source '{}' is not a texture", source.name));
            };
            layers
                .get(layer as usize)
                .ok_or_else(|| format!("texture '{}' has no layer {}", source.name, layer))?
                .clone()
        };
        let target = self.copy_target(dst)?;
        let name = target.name.clone();
        let Storage::Buffer(bytes) = &mut target.storage else {
            return Err(format!("copy destination '{name}' is not a buffer"));
        };
        bytes
            .get_mut(dst_offset as usize..dst_offset as usize + data.len())
            .ok_or_else(|| format!("readback writes past the end of '{name}'"))?
            .copy_from_slice(&data);
        Ok(())
    }

    /// Resource readable by a copy: upload heap memory or a resource in COPY_SOURCE.
    fn copy_source(&self, resource: RawResource) -> Result<&SoftResource, String> {
        let entry = self
            .resources
            .get(&resource)
            .ok_or_else(|| format!("copy from released resource {resource:?}"))?;
        let readable = match entry.heap {
            MemoryHeap::Upload => true,
            _ => entry.state == ResourceState::CopySource,
        };
        if !readable {
            return Err(format!(
                "copy from '{}' in state {:?}",
                entry.name, entry.state
            ));
        }
        Ok(entry)
    }

    fn copy_target(&mut self, resource: RawResource) -> Result<&mut SoftResource, String> {
        let entry = self
            .resources
            .get_mut(&resource)
            .ok_or_else(|| format!("copy into released resource {resource:?}"))?;
        if entry.state != ResourceState::CopyDest {
            return Err(format!(
                "copy into '{}' in state {:?}",
                entry.name, entry.state
            ));
        }
        Ok(entry)
    }

    pub(super) fn resource_count(&self) -> usize {
        self.resources.len()
    }
}
