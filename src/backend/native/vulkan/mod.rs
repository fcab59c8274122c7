//! Vulkan implementation of the explicit GPU API.
//!
//! Runs headless on one graphics queue of a Vulkan 1.3 device:
//! - committed resources are buffers and images backed by gpu-allocator
//! - descriptor heaps are CPU tables of image views; each draw writes a
//!   fresh descriptor set from the bound tables (see [`pipeline`] for the
//!   binding layout shaders must use)
//! - render-target bindings become dynamic rendering instances, started
//!   lazily at the first draw
//! - the queue fence is a timeline semaphore
//!
//! Shaders are WGSL, compiled to SPIR-V with naga.

mod conversion;
mod init;
pub mod pipeline;

use std::collections::HashMap;
use std::mem::ManuallyDrop;

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator};

use crate::backend::native::gpu::*;
use crate::error::{HeapKind, RhiError, RhiResult};
use crate::rhi::{Capabilities, Extent2D, ShaderModel, ShaderStage, TextureFormat, MAX_TEXTURE_SLOTS};

use self::conversion::*;
use self::pipeline::{BUFFER_BINDING_BASE, CONSTANTS_BINDING, TEXTURE_BINDING_BASE};

/// Descriptor sets allocated per pool before another pool is chained.
const SETS_PER_POOL: u32 = 1024;

/// Bytes of the buffer bound where no constants or structured buffer is.
const NULL_BUFFER_SIZE: u64 = 512;

/// Largest per-draw constant buffer view.
const CONSTANTS_RANGE: u64 = 512;

fn gpu_error(what: &str, err: impl std::fmt::Debug) -> RhiError {
    RhiError::Gpu(format!("{}: {:?}", what, err))
}

enum VkResource {
    Buffer {
        buffer: vk::Buffer,
        allocation: Allocation,
        size: u64,
    },
    Texture {
        image: vk::Image,
        allocation: Allocation,
        format: TextureFormat,
        extent: Extent2D,
        layers: u32,
    },
}

/// A written descriptor heap slot.
struct VkView {
    desc: ViewDesc,
    image_view: Option<vk::ImageView>,
    extent: Extent2D,
    layers: u32,
}

struct VkHeap {
    kind: HeapKind,
    slots: Vec<Option<VkView>>,
}

/// Command pool plus the descriptor pools draws recorded from it allocate from.
struct VkCommandAllocator {
    pool: vk::CommandPool,
    buffers: Vec<vk::CommandBuffer>,
    next_buffer: usize,
    descriptor_pools: Vec<vk::DescriptorPool>,
    active_pool: usize,
}

/// Bindings accumulated while encoding one command list.
struct EncodeState {
    cb: vk::CommandBuffer,
    allocator: RawAllocator,
    rtvs: Vec<DescriptorRef>,
    dsv: Option<DescriptorRef>,
    /// View mask of the open rendering instance
    rendering: Option<u32>,
    view_mask: u32,
    constants: Option<(vk::Buffer, u64, u64)>,
    tables: [Option<DescriptorRef>; MAX_TEXTURE_SLOTS as usize],
}

pub struct VulkanGpu {
    _entry: ash::Entry,
    instance: ash::Instance,
    debug: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    adapter_name: String,
    capabilities: Capabilities,
    device: ash::Device,
    queue: vk::Queue,
    queue_family: u32,
    allocator: ManuallyDrop<Allocator>,
    timeline: vk::Semaphore,
    last_signal: u64,
    utility_pool: vk::CommandPool,
    samplers: Vec<vk::Sampler>,
    set_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
    null_image: RawResource,
    null_image_view: vk::ImageView,
    null_buffer: RawResource,
    resources: HashMap<RawResource, VkResource>,
    heaps: HashMap<RawHeap, VkHeap>,
    pipelines: HashMap<RawPipeline, (vk::Pipeline, u32)>,
    allocators: HashMap<RawAllocator, VkCommandAllocator>,
    next_id: u64,
}

impl VulkanGpu {
    /// Open the best Vulkan 1.3 device. Validation layers are enabled in debug builds.
    pub fn new() -> RhiResult<Self> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| RhiError::InitializationFailed(format!("Failed to load Vulkan: {}", e)))?;
        let init::Instance { instance, debug } = init::create_instance(&entry, cfg!(debug_assertions))?;

        let adapter = match init::select_adapter(&instance) {
            Ok(adapter) => adapter,
            Err(e) => {
                unsafe { destroy_instance(&instance, &debug) };
                return Err(e);
            }
        };
        let device = match init::create_logical_device(&instance, &adapter) {
            Ok(device) => device,
            Err(e) => {
                unsafe { destroy_instance(&instance, &debug) };
                return Err(e);
            }
        };
        let allocator = match init::create_allocator(&instance, adapter.physical_device, &device) {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe {
                    device.destroy_device(None);
                    destroy_instance(&instance, &debug);
                }
                return Err(e);
            }
        };
        let queue = unsafe { device.get_device_queue(adapter.queue_family, 0) };

        log::info!("Vulkan GPU: {} ({:?})", adapter.name, adapter.capabilities);

        // From here on Drop tears down whatever was created.
        let mut gpu = Self {
            _entry: entry,
            instance,
            debug,
            adapter_name: adapter.name,
            capabilities: adapter.capabilities,
            device,
            queue,
            queue_family: adapter.queue_family,
            allocator: ManuallyDrop::new(allocator),
            timeline: vk::Semaphore::null(),
            last_signal: 0,
            utility_pool: vk::CommandPool::null(),
            samplers: Vec::new(),
            set_layout: vk::DescriptorSetLayout::null(),
            pipeline_layout: vk::PipelineLayout::null(),
            null_image: RawResource(0),
            null_image_view: vk::ImageView::null(),
            null_buffer: RawResource(0),
            resources: HashMap::new(),
            heaps: HashMap::new(),
            pipelines: HashMap::new(),
            allocators: HashMap::new(),
            next_id: 0,
        };
        gpu.create_shared_objects()?;
        Ok(gpu)
    }

    fn create_shared_objects(&mut self) -> RhiResult<()> {
        self.timeline = init::create_timeline(&self.device)?;

        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(self.queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        self.utility_pool = unsafe { self.device.create_command_pool(&pool_info, None) }
            .map_err(|e| gpu_error("Failed to create command pool", e))?;

        self.samplers = pipeline::create_static_samplers(&self.device)?;
        self.set_layout = pipeline::create_set_layout(&self.device, &self.samplers)?;
        let set_layouts = [self.set_layout];
        let layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
        self.pipeline_layout = unsafe { self.device.create_pipeline_layout(&layout_info, None) }
            .map_err(|e| gpu_error("Failed to create pipeline layout", e))?;

        self.null_buffer = self.create_buffer(&GpuBufferDesc {
            size: NULL_BUFFER_SIZE,
            heap: MemoryHeap::Default,
            initial_state: ResourceState::Common,
            debug_name: "null buffer".to_string(),
        })?;
        self.null_image = self.create_texture(&GpuTextureDesc {
            extent: Extent2D::new(1, 1),
            format: TextureFormat::Rgba8Unorm,
            array_layers: 1,
            cube: false,
            usage: GpuTextureUsage {
                shader_resource: true,
                ..Default::default()
            },
            initial_state: ResourceState::CopyDest,
            debug_name: "null texture".to_string(),
        })?;

        let (Some(VkResource::Buffer { buffer, .. }), Some(VkResource::Texture { image, .. })) = (
            self.resources.get(&self.null_buffer),
            self.resources.get(&self.null_image),
        ) else {
            return Err(RhiError::Gpu("null resources missing".to_string()));
        };
        let (buffer, image) = (*buffer, *image);
        self.one_time_submit(|device, cb| unsafe {
            device.cmd_fill_buffer(cb, buffer, 0, vk::WHOLE_SIZE, 0);
            device.cmd_clear_color_image(
                cb,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &vk::ClearColorValue::default(),
                &[full_range(vk::ImageAspectFlags::COLOR, 1)],
            );
            image_barrier(
                device,
                cb,
                image,
                vk::ImageAspectFlags::COLOR,
                1,
                ResourceState::CopyDest,
                ResourceState::PixelShaderResource,
                false,
            );
        })?;
        self.null_image_view = self.create_image_view(
            image,
            TextureFormat::Rgba8Unorm,
            vk::ImageViewType::TYPE_2D,
            0,
            1,
            vk::ImageAspectFlags::COLOR,
        )?;
        Ok(())
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Record and run a command buffer on the queue, waiting for it to finish.
    fn one_time_submit(&self, record: impl FnOnce(&ash::Device, vk::CommandBuffer)) -> RhiResult<()> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.utility_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cbs = unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .map_err(|e| gpu_error("Failed to allocate command buffer", e))?;

        let result = (|| {
            let cb = cbs[0];
            let begin = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            unsafe { self.device.begin_command_buffer(cb, &begin) }
                .map_err(|e| gpu_error("Failed to begin command buffer", e))?;
            record(&self.device, cb);
            unsafe { self.device.end_command_buffer(cb) }
                .map_err(|e| gpu_error("Failed to end command buffer", e))?;

            let fence = unsafe { self.device.create_fence(&vk::FenceCreateInfo::default(), None) }
                .map_err(|e| gpu_error("Failed to create fence", e))?;
            let submit = vk::SubmitInfo::default().command_buffers(&cbs);
            let result = unsafe { self.device.queue_submit(self.queue, &[submit], fence) }
                .and_then(|()| unsafe { self.device.wait_for_fences(&[fence], true, u64::MAX) })
                .map_err(|e| gpu_error("One-time submission failed", e));
            unsafe { self.device.destroy_fence(fence, None) };
            result
        })();

        unsafe { self.device.free_command_buffers(self.utility_pool, &cbs) };
        result
    }

    fn allocate_memory(
        &mut self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: gpu_allocator::MemoryLocation,
        linear: bool,
    ) -> RhiResult<Allocation> {
        self.allocator
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| RhiError::Gpu(format!("Failed to allocate memory for '{}': {}", name, e)))
    }

    fn free_memory(&mut self, allocation: Allocation) {
        if let Err(e) = self.allocator.free(allocation) {
            log::warn!("Failed to free GPU memory: {}", e);
        }
    }

    fn create_image_view(
        &self,
        image: vk::Image,
        format: TextureFormat,
        view_type: vk::ImageViewType,
        first_layer: u32,
        layer_count: u32,
        aspect: vk::ImageAspectFlags,
    ) -> RhiResult<vk::ImageView> {
        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(view_type)
            .format(convert_texture_format(format))
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: first_layer,
                layer_count,
            });
        unsafe { self.device.create_image_view(&view_info, None) }
            .map_err(|e| gpu_error("Failed to create image view", e))
    }

    fn texture(&self, resource: RawResource) -> RhiResult<(vk::Image, TextureFormat, Extent2D, u32)> {
        match self.resources.get(&resource) {
            Some(VkResource::Texture {
                image,
                format,
                extent,
                layers,
                ..
            }) => Ok((*image, *format, *extent, *layers)),
            _ => Err(RhiError::Gpu(format!("{:?} is not a live texture", resource))),
        }
    }

    fn buffer(&self, resource: RawResource) -> RhiResult<(vk::Buffer, u64)> {
        match self.resources.get(&resource) {
            Some(VkResource::Buffer { buffer, size, .. }) => Ok((*buffer, *size)),
            _ => Err(RhiError::Gpu(format!("{:?} is not a live buffer", resource))),
        }
    }

    fn build_view(&self, desc: &ViewDesc) -> RhiResult<VkView> {
        let texture_view = |resource: RawResource,
                            view_type: vk::ImageViewType,
                            first_layer: u32,
                            layer_count: u32,
                            attachment_format: Option<TextureFormat>|
         -> RhiResult<VkView> {
            let (image, image_format, extent, _) = self.texture(resource)?;
            // depth images cannot be reinterpreted as color, views keep the image format
            let format = match attachment_format {
                Some(format) if !image_format.is_depth() => format,
                _ => image_format,
            };
            let image_view = self.create_image_view(
                image,
                format,
                view_type,
                first_layer,
                layer_count,
                aspect_mask(image_format, false),
            )?;
            Ok(VkView {
                desc: *desc,
                image_view: Some(image_view),
                extent,
                layers: layer_count,
            })
        };

        let layered = |count: u32| {
            if count > 1 {
                vk::ImageViewType::TYPE_2D_ARRAY
            } else {
                vk::ImageViewType::TYPE_2D
            }
        };

        match *desc {
            ViewDesc::NullTexture2D | ViewDesc::NullStructuredBuffer | ViewDesc::StructuredBuffer { .. } => {
                Ok(VkView {
                    desc: *desc,
                    image_view: None,
                    extent: Extent2D::default(),
                    layers: 0,
                })
            }
            ViewDesc::Texture2D { resource, format } => {
                texture_view(resource, vk::ImageViewType::TYPE_2D, 0, 1, Some(format))
            }
            ViewDesc::TextureCube { resource, format } => {
                texture_view(resource, vk::ImageViewType::CUBE, 0, 6, Some(format))
            }
            ViewDesc::Texture2DArray {
                resource,
                format,
                first_layer,
                layer_count,
            } => texture_view(
                resource,
                vk::ImageViewType::TYPE_2D_ARRAY,
                first_layer,
                layer_count,
                Some(format),
            ),
            ViewDesc::RenderTarget {
                resource,
                format,
                first_layer,
                layer_count,
            }
            | ViewDesc::DepthStencil {
                resource,
                format,
                first_layer,
                layer_count,
            } => texture_view(
                resource,
                layered(layer_count),
                first_layer,
                layer_count,
                Some(format),
            ),
        }
    }

    fn view(&self, descriptor: DescriptorRef) -> RhiResult<&VkView> {
        self.heaps
            .get(&descriptor.heap)
            .and_then(|heap| heap.slots.get(descriptor.index as usize))
            .and_then(|slot| slot.as_ref())
            .ok_or_else(|| {
                RhiError::Gpu(format!(
                    "descriptor {} of {:?} was never written",
                    descriptor.index, descriptor.heap
                ))
            })
    }

    fn attachment(&self, descriptor: DescriptorRef) -> RhiResult<(vk::ImageView, Extent2D, u32)> {
        let view = self.view(descriptor)?;
        match view.image_view {
            Some(image_view) => Ok((image_view, view.extent, view.layers)),
            None => Err(RhiError::Gpu(format!(
                "descriptor {} is not a texture view",
                descriptor.index
            ))),
        }
    }

    fn allocate_set(&mut self, allocator: RawAllocator) -> RhiResult<vk::DescriptorSet> {
        let device = &self.device;
        let set_layouts = [self.set_layout];
        let entry = self
            .allocators
            .get_mut(&allocator)
            .ok_or_else(|| RhiError::Gpu(format!("{:?} is not a command allocator", allocator)))?;

        loop {
            if entry.active_pool == entry.descriptor_pools.len() {
                entry.descriptor_pools.push(create_descriptor_pool(device)?);
            }
            let alloc_info = vk::DescriptorSetAllocateInfo::default()
                .descriptor_pool(entry.descriptor_pools[entry.active_pool])
                .set_layouts(&set_layouts);
            match unsafe { device.allocate_descriptor_sets(&alloc_info) } {
                Ok(sets) => {
                    return sets
                        .into_iter()
                        .next()
                        .ok_or_else(|| RhiError::Gpu("no descriptor set allocated".to_string()))
                }
                Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL) => {
                    entry.active_pool += 1;
                }
                Err(e) => return Err(gpu_error("Failed to allocate descriptor set", e)),
            }
        }
    }

    /// Descriptor set holding the constants and every bound table.
    fn write_draw_set(&mut self, state: &EncodeState) -> RhiResult<vk::DescriptorSet> {
        let set = self.allocate_set(state.allocator)?;
        let (null_buffer, _) = self.buffer(self.null_buffer)?;

        let constants = match state.constants {
            Some((buffer, offset, range)) => vk::DescriptorBufferInfo {
                buffer,
                offset,
                range,
            },
            None => vk::DescriptorBufferInfo {
                buffer: null_buffer,
                offset: 0,
                range: vk::WHOLE_SIZE,
            },
        };

        let mut image_infos = Vec::with_capacity(MAX_TEXTURE_SLOTS as usize);
        let mut buffer_infos = Vec::with_capacity(MAX_TEXTURE_SLOTS as usize);
        for table in &state.tables {
            let view = match table {
                Some(descriptor) => Some(self.view(*descriptor)?),
                None => None,
            };
            let image_info = match view.and_then(|v| v.image_view.map(|iv| (v, iv))) {
                Some((view, image_view)) => {
                    let depth = match view.desc.resource().map(|r| self.texture(r)) {
                        Some(Ok((_, format, _, _))) => format.is_depth(),
                        _ => false,
                    };
                    vk::DescriptorImageInfo {
                        sampler: vk::Sampler::null(),
                        image_view,
                        image_layout: state_layout(ResourceState::PixelShaderResource, depth),
                    }
                }
                None => vk::DescriptorImageInfo {
                    sampler: vk::Sampler::null(),
                    image_view: self.null_image_view,
                    image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                },
            };
            let buffer_info = match view.map(|v| v.desc) {
                Some(ViewDesc::StructuredBuffer {
                    resource,
                    stride,
                    element_count,
                }) => {
                    let (buffer, _) = self.buffer(resource)?;
                    let range = stride as u64 * element_count as u64;
                    vk::DescriptorBufferInfo {
                        buffer,
                        offset: 0,
                        range: if range == 0 { vk::WHOLE_SIZE } else { range },
                    }
                }
                _ => vk::DescriptorBufferInfo {
                    buffer: null_buffer,
                    offset: 0,
                    range: vk::WHOLE_SIZE,
                },
            };
            image_infos.push(image_info);
            buffer_infos.push(buffer_info);
        }

        let mut writes = Vec::with_capacity(1 + 2 * MAX_TEXTURE_SLOTS as usize);
        writes.push(
            vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(CONSTANTS_BINDING)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .buffer_info(std::slice::from_ref(&constants)),
        );
        writes.push(
            vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(TEXTURE_BINDING_BASE)
                .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                .image_info(&image_infos),
        );
        writes.push(
            vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(BUFFER_BINDING_BASE)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .buffer_info(&buffer_infos),
        );
        unsafe { self.device.update_descriptor_sets(&writes, &[]) };
        Ok(set)
    }

    fn end_rendering(&self, state: &mut EncodeState) {
        if state.rendering.take().is_some() {
            unsafe { self.device.cmd_end_rendering(state.cb) };
        }
    }

    /// Open a rendering instance over the bound targets unless one with the same view mask is open.
    fn ensure_rendering(&self, state: &mut EncodeState) -> RhiResult<()> {
        if state.rendering == Some(state.view_mask) {
            return Ok(());
        }
        self.end_rendering(state);

        let mut area = None;
        let mut layers = u32::MAX;
        let mut color_attachments = Vec::with_capacity(state.rtvs.len());
        for rtv in &state.rtvs {
            let (image_view, extent, view_layers) = self.attachment(*rtv)?;
            area.get_or_insert(extent);
            layers = layers.min(view_layers);
            color_attachments.push(
                vk::RenderingAttachmentInfo::default()
                    .image_view(image_view)
                    .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .load_op(vk::AttachmentLoadOp::LOAD)
                    .store_op(vk::AttachmentStoreOp::STORE),
            );
        }
        let depth_attachment = match state.dsv {
            Some(dsv) => {
                let (image_view, extent, view_layers) = self.attachment(dsv)?;
                area.get_or_insert(extent);
                layers = layers.min(view_layers);
                Some(
                    vk::RenderingAttachmentInfo::default()
                        .image_view(image_view)
                        .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                        .load_op(vk::AttachmentLoadOp::LOAD)
                        .store_op(vk::AttachmentStoreOp::STORE),
                )
            }
            None => None,
        };
        let Some(extent) = area else {
            return Err(RhiError::Gpu("draw without bound render targets".to_string()));
        };

        let mut info = vk::RenderingInfo::default()
            .render_area(full_rect(extent))
            .layer_count(if state.view_mask == 0 { layers } else { 0 })
            .view_mask(state.view_mask)
            .color_attachments(&color_attachments);
        if let Some(depth) = depth_attachment.as_ref() {
            info = info.depth_attachment(depth);
        }
        unsafe { self.device.cmd_begin_rendering(state.cb, &info) };
        state.rendering = Some(state.view_mask);
        Ok(())
    }

    /// Clear one attachment through a rendering instance of its own.
    fn clear_attachment(
        &self,
        state: &mut EncodeState,
        descriptor: DescriptorRef,
        clear: vk::ClearValue,
        depth: bool,
    ) -> RhiResult<()> {
        self.end_rendering(state);
        let (image_view, extent, layers) = self.attachment(descriptor)?;
        let layout = if depth {
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        } else {
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        };
        let attachment = vk::RenderingAttachmentInfo::default()
            .image_view(image_view)
            .image_layout(layout)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(clear);
        let info = vk::RenderingInfo::default()
            .render_area(full_rect(extent))
            .layer_count(layers);
        let info = if depth {
            info.depth_attachment(&attachment)
        } else {
            info.color_attachments(std::slice::from_ref(&attachment))
        };
        unsafe {
            self.device.cmd_begin_rendering(state.cb, &info);
            self.device.cmd_end_rendering(state.cb);
        }
        Ok(())
    }

    fn encode(&mut self, state: &mut EncodeState, command: &GpuCommand) -> RhiResult<()> {
        let cb = state.cb;
        match command {
            GpuCommand::Barrier {
                resource,
                before,
                after,
            } => {
                self.end_rendering(state);
                match self.resources.get(resource) {
                    Some(VkResource::Texture { image, format, layers, .. }) => unsafe {
                        image_barrier(
                            &self.device,
                            cb,
                            *image,
                            aspect_mask(*format, true),
                            *layers,
                            *before,
                            *after,
                            format.is_depth(),
                        )
                    },
                    Some(VkResource::Buffer { buffer, .. }) => {
                        let barrier = vk::BufferMemoryBarrier::default()
                            .buffer(*buffer)
                            .offset(0)
                            .size(vk::WHOLE_SIZE)
                            .src_access_mask(state_access(*before))
                            .dst_access_mask(state_access(*after))
                            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED);
                        unsafe {
                            self.device.cmd_pipeline_barrier(
                                cb,
                                state_stage(*before),
                                state_stage(*after),
                                vk::DependencyFlags::empty(),
                                &[],
                                &[barrier],
                                &[],
                            )
                        };
                    }
                    None => {
                        return Err(RhiError::Gpu(format!("barrier on unknown {:?}", resource)));
                    }
                }
            }
            GpuCommand::SetRenderTargets { rtvs, dsv } => {
                self.end_rendering(state);
                state.rtvs = rtvs.clone();
                state.dsv = *dsv;
            }
            GpuCommand::ClearRenderTarget { rtv, color } => {
                let clear = vk::ClearValue {
                    color: vk::ClearColorValue { float32: *color },
                };
                self.clear_attachment(state, *rtv, clear, false)?;
            }
            GpuCommand::ClearDepth { dsv, depth } => {
                let clear = vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue {
                        depth: *depth,
                        stencil: 0,
                    },
                };
                self.clear_attachment(state, *dsv, clear, true)?;
            }
            GpuCommand::SetViewport(viewport) => {
                // flipped so clip-space +y points up like the other backends
                let flipped = vk::Viewport {
                    x: viewport.x,
                    y: viewport.y + viewport.height,
                    width: viewport.width,
                    height: -viewport.height,
                    min_depth: viewport.min_depth,
                    max_depth: viewport.max_depth,
                };
                unsafe { self.device.cmd_set_viewport(cb, 0, &[flipped]) };
            }
            GpuCommand::SetScissor(rect) => {
                let scissor = vk::Rect2D {
                    offset: vk::Offset2D {
                        x: rect.left.max(0),
                        y: rect.top.max(0),
                    },
                    extent: vk::Extent2D {
                        width: (rect.right - rect.left).max(0) as u32,
                        height: (rect.bottom - rect.top).max(0) as u32,
                    },
                };
                unsafe { self.device.cmd_set_scissor(cb, 0, &[scissor]) };
            }
            GpuCommand::SetPipeline(pipeline) => {
                let (pipeline, view_mask) = self
                    .pipelines
                    .get(pipeline)
                    .copied()
                    .ok_or_else(|| RhiError::Gpu(format!("unknown {:?}", pipeline)))?;
                unsafe {
                    self.device
                        .cmd_bind_pipeline(cb, vk::PipelineBindPoint::GRAPHICS, pipeline)
                };
                state.view_mask = view_mask;
            }
            GpuCommand::SetPrimitiveTopology(topology) => unsafe {
                self.device
                    .cmd_set_primitive_topology(cb, convert_topology(*topology));
            },
            GpuCommand::SetVertexBuffers(views) => {
                let mut buffers = Vec::with_capacity(views.len());
                let mut offsets = Vec::with_capacity(views.len());
                let mut sizes = Vec::with_capacity(views.len());
                let mut strides = Vec::with_capacity(views.len());
                for view in views {
                    buffers.push(self.buffer(view.resource)?.0);
                    offsets.push(view.offset);
                    sizes.push(view.size);
                    strides.push(view.stride as u64);
                }
                unsafe {
                    self.device.cmd_bind_vertex_buffers2(
                        cb,
                        0,
                        &buffers,
                        &offsets,
                        Some(&sizes),
                        Some(&strides),
                    )
                };
            }
            GpuCommand::SetIndexBuffer(view) => {
                let (buffer, _) = self.buffer(view.resource)?;
                unsafe {
                    self.device.cmd_bind_index_buffer(
                        cb,
                        buffer,
                        view.offset,
                        convert_index_type(view.index_type),
                    )
                };
            }
            GpuCommand::SetRootConstantBuffer {
                resource, offset, ..
            } => {
                let (buffer, size) = self.buffer(*resource)?;
                let range = CONSTANTS_RANGE.min(size.saturating_sub(*offset));
                state.constants = Some((buffer, *offset, range));
            }
            GpuCommand::SetRootDescriptorTable {
                parameter,
                descriptor,
            } => {
                let slot = parameter
                    .checked_sub(ROOT_PARAM_FIRST_TABLE)
                    .filter(|slot| *slot < MAX_TEXTURE_SLOTS)
                    .ok_or_else(|| RhiError::Gpu(format!("no descriptor table at parameter {}", parameter)))?;
                state.tables[slot as usize] = Some(*descriptor);
            }
            GpuCommand::Draw {
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            } => {
                self.ensure_rendering(state)?;
                self.bind_draw_set(state)?;
                unsafe {
                    self.device.cmd_draw(
                        cb,
                        *vertex_count,
                        *instance_count,
                        *first_vertex,
                        *first_instance,
                    )
                };
            }
            GpuCommand::DrawIndexed {
                index_count,
                instance_count,
                first_index,
                base_vertex,
                first_instance,
            } => {
                self.ensure_rendering(state)?;
                self.bind_draw_set(state)?;
                unsafe {
                    self.device.cmd_draw_indexed(
                        cb,
                        *index_count,
                        *instance_count,
                        *first_index,
                        *base_vertex,
                        *first_instance,
                    )
                };
            }
            GpuCommand::CopyBufferRegion {
                dst,
                dst_offset,
                src,
                src_offset,
                size,
            } => {
                self.end_rendering(state);
                let (dst, _) = self.buffer(*dst)?;
                let (src, _) = self.buffer(*src)?;
                let region = vk::BufferCopy {
                    src_offset: *src_offset,
                    dst_offset: *dst_offset,
                    size: *size,
                };
                unsafe { self.device.cmd_copy_buffer(cb, src, dst, &[region]) };
            }
            GpuCommand::CopyBufferToTexture {
                src,
                src_offset,
                dst,
                layer,
            } => {
                self.end_rendering(state);
                let (buffer, _) = self.buffer(*src)?;
                let (image, format, extent, _) = self.texture(*dst)?;
                let region = layer_copy(*src_offset, format, extent, *layer);
                unsafe {
                    self.device.cmd_copy_buffer_to_image(
                        cb,
                        buffer,
                        image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[region],
                    )
                };
            }
            GpuCommand::CopyTextureToBuffer {
                src,
                layer,
                dst,
                dst_offset,
            } => {
                self.end_rendering(state);
                let (image, format, extent, _) = self.texture(*src)?;
                let (buffer, _) = self.buffer(*dst)?;
                let region = layer_copy(*dst_offset, format, extent, *layer);
                unsafe {
                    self.device.cmd_copy_image_to_buffer(
                        cb,
                        image,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        buffer,
                        &[region],
                    )
                };
            }
        }
        Ok(())
    }

    fn bind_draw_set(&mut self, state: &EncodeState) -> RhiResult<()> {
        let set = self.write_draw_set(state)?;
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                state.cb,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline_layout,
                0,
                &[set],
                &[],
            )
        };
        Ok(())
    }

    fn next_command_buffer(&mut self, allocator: RawAllocator) -> RhiResult<vk::CommandBuffer> {
        let entry = self
            .allocators
            .get_mut(&allocator)
            .ok_or_else(|| RhiError::Gpu(format!("{:?} is not a command allocator", allocator)))?;
        if entry.next_buffer == entry.buffers.len() {
            let alloc_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(entry.pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            let cbs = unsafe { self.device.allocate_command_buffers(&alloc_info) }
                .map_err(|e| gpu_error("Failed to allocate command buffer", e))?;
            entry.buffers.extend(cbs);
        }
        let cb = entry.buffers[entry.next_buffer];
        entry.next_buffer += 1;
        Ok(cb)
    }
}

fn create_descriptor_pool(device: &ash::Device) -> RhiResult<vk::DescriptorPool> {
    let pool_sizes = [
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: SETS_PER_POOL,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::SAMPLED_IMAGE,
            descriptor_count: SETS_PER_POOL * MAX_TEXTURE_SLOTS,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::STORAGE_BUFFER,
            descriptor_count: SETS_PER_POOL * MAX_TEXTURE_SLOTS,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::SAMPLER,
            descriptor_count: SETS_PER_POOL * pipeline::STATIC_SAMPLER_COUNT,
        },
    ];
    let pool_info = vk::DescriptorPoolCreateInfo::default()
        .max_sets(SETS_PER_POOL)
        .pool_sizes(&pool_sizes);
    unsafe { device.create_descriptor_pool(&pool_info, None) }
        .map_err(|e| gpu_error("Failed to create descriptor pool", e))
}

fn full_range(aspect: vk::ImageAspectFlags, layers: u32) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: aspect,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: layers,
    }
}

fn full_rect(extent: Extent2D) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent: vk::Extent2D {
            width: extent.width,
            height: extent.height,
        },
    }
}

/// Tightly packed copy region of one layer.
fn layer_copy(buffer_offset: u64, format: TextureFormat, extent: Extent2D, layer: u32) -> vk::BufferImageCopy {
    vk::BufferImageCopy {
        buffer_offset,
        buffer_row_length: 0,
        buffer_image_height: 0,
        image_subresource: vk::ImageSubresourceLayers {
            aspect_mask: aspect_mask(format, false),
            mip_level: 0,
            base_array_layer: layer,
            layer_count: 1,
        },
        image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
        image_extent: vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        },
    }
}

#[allow(clippy::too_many_arguments)]
unsafe fn image_barrier(
    device: &ash::Device,
    cb: vk::CommandBuffer,
    image: vk::Image,
    aspect: vk::ImageAspectFlags,
    layers: u32,
    before: ResourceState,
    after: ResourceState,
    depth: bool,
) {
    let barrier = vk::ImageMemoryBarrier::default()
        .image(image)
        .old_layout(state_layout(before, depth))
        .new_layout(state_layout(after, depth))
        .src_access_mask(state_access(before))
        .dst_access_mask(state_access(after))
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .subresource_range(full_range(aspect, layers));
    unsafe {
        device.cmd_pipeline_barrier(
            cb,
            state_stage(before),
            state_stage(after),
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        )
    };
}

unsafe fn destroy_instance(
    instance: &ash::Instance,
    debug: &Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
) {
    unsafe {
        if let Some((debug_utils, messenger)) = debug {
            debug_utils.destroy_debug_utils_messenger(*messenger, None);
        }
        instance.destroy_instance(None);
    }
}

impl GpuDevice for VulkanGpu {
    fn adapter_name(&self) -> String {
        self.adapter_name.clone()
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn create_buffer(&mut self, desc: &GpuBufferDesc) -> RhiResult<RawResource> {
        let usage = vk::BufferUsageFlags::VERTEX_BUFFER
            | vk::BufferUsageFlags::INDEX_BUFFER
            | vk::BufferUsageFlags::UNIFORM_BUFFER
            | vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::TRANSFER_SRC
            | vk::BufferUsageFlags::TRANSFER_DST;
        let buffer_info = vk::BufferCreateInfo::default()
            .size(desc.size.max(1))
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&buffer_info, None) }
            .map_err(|e| gpu_error("Failed to create buffer", e))?;

        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let allocation =
            match self.allocate_memory(&desc.debug_name, requirements, convert_memory_heap(desc.heap), true) {
                Ok(allocation) => allocation,
                Err(e) => {
                    unsafe { self.device.destroy_buffer(buffer, None) };
                    return Err(e);
                }
            };
        if let Err(e) = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        } {
            self.free_memory(allocation);
            unsafe { self.device.destroy_buffer(buffer, None) };
            return Err(gpu_error("Failed to bind buffer memory", e));
        }

        let id = RawResource(self.next_id());
        self.resources.insert(
            id,
            VkResource::Buffer {
                buffer,
                allocation,
                size: desc.size,
            },
        );
        Ok(id)
    }

    fn create_texture(&mut self, desc: &GpuTextureDesc) -> RhiResult<RawResource> {
        let mut usage = vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;
        if desc.usage.render_target {
            usage |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
        }
        if desc.usage.depth_stencil {
            usage |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
        }
        if desc.usage.shader_resource {
            usage |= vk::ImageUsageFlags::SAMPLED;
        }
        let flags = if desc.cube {
            vk::ImageCreateFlags::CUBE_COMPATIBLE
        } else {
            vk::ImageCreateFlags::empty()
        };
        let layers = desc.array_layers.max(1);

        let image_info = vk::ImageCreateInfo::default()
            .flags(flags)
            .image_type(vk::ImageType::TYPE_2D)
            .format(convert_texture_format(desc.format))
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { self.device.create_image(&image_info, None) }
            .map_err(|e| gpu_error("Failed to create image", e))?;

        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        let allocation = match self.allocate_memory(
            &desc.debug_name,
            requirements,
            gpu_allocator::MemoryLocation::GpuOnly,
            false,
        ) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(e);
            }
        };
        if let Err(e) = unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        } {
            self.free_memory(allocation);
            unsafe { self.device.destroy_image(image, None) };
            return Err(gpu_error("Failed to bind image memory", e));
        }

        let id = RawResource(self.next_id());
        self.resources.insert(
            id,
            VkResource::Texture {
                image,
                allocation,
                format: desc.format,
                extent: desc.extent,
                layers,
            },
        );

        // images start undefined; move them into the layout of their initial state
        let aspect = aspect_mask(desc.format, true);
        let layout = state_layout(desc.initial_state, desc.format.is_depth());
        let initial = self.one_time_submit(|device, cb| {
            let barrier = vk::ImageMemoryBarrier::default()
                .image(image)
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(layout)
                .dst_access_mask(state_access(desc.initial_state))
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .subresource_range(full_range(aspect, layers));
            unsafe {
                device.cmd_pipeline_barrier(
                    cb,
                    vk::PipelineStageFlags::TOP_OF_PIPE,
                    state_stage(desc.initial_state),
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[barrier],
                )
            };
        });
        if let Err(e) = initial {
            self.release_resource(id);
            return Err(e);
        }
        Ok(id)
    }

    fn release_resource(&mut self, resource: RawResource) {
        match self.resources.remove(&resource) {
            Some(VkResource::Buffer { buffer, allocation, .. }) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                self.free_memory(allocation);
            }
            Some(VkResource::Texture { image, allocation, .. }) => {
                unsafe { self.device.destroy_image(image, None) };
                self.free_memory(allocation);
            }
            None => log::warn!("release of unknown {:?}", resource),
        }
    }

    fn write_buffer(&mut self, resource: RawResource, offset: u64, data: &[u8]) -> RhiResult<()> {
        let Some(VkResource::Buffer { allocation, size, .. }) = self.resources.get_mut(&resource) else {
            return Err(RhiError::Gpu(format!("{:?} is not a live buffer", resource)));
        };
        let len = data.len() as u64;
        if offset + len > *size {
            return Err(RhiError::OutOfBounds {
                offset,
                len,
                size: *size,
            });
        }
        let mapped = allocation
            .mapped_slice_mut()
            .ok_or_else(|| RhiError::Gpu(format!("{:?} is not CPU-writable", resource)))?;
        mapped[offset as usize..(offset + len) as usize].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&mut self, resource: RawResource, offset: u64, out: &mut [u8]) -> RhiResult<()> {
        let Some(VkResource::Buffer { allocation, size, .. }) = self.resources.get(&resource) else {
            return Err(RhiError::Gpu(format!("{:?} is not a live buffer", resource)));
        };
        let len = out.len() as u64;
        if offset + len > *size {
            return Err(RhiError::OutOfBounds {
                offset,
                len,
                size: *size,
            });
        }
        let mapped = allocation
            .mapped_slice()
            .ok_or_else(|| RhiError::Gpu(format!("{:?} is not CPU-readable", resource)))?;
        out.copy_from_slice(&mapped[offset as usize..(offset + len) as usize]);
        Ok(())
    }

    fn create_descriptor_heap(&mut self, kind: HeapKind, capacity: u32) -> RhiResult<RawHeap> {
        let id = RawHeap(self.next_id());
        let mut slots = Vec::with_capacity(capacity as usize);
        slots.resize_with(capacity as usize, || None);
        self.heaps.insert(id, VkHeap { kind, slots });
        Ok(id)
    }

    fn write_descriptor(&mut self, heap: RawHeap, index: u32, view: &ViewDesc) -> RhiResult<()> {
        let (kind, capacity) = match self.heaps.get(&heap) {
            Some(entry) => (entry.kind, entry.slots.len()),
            None => return Err(RhiError::Gpu(format!("unknown {:?}", heap))),
        };
        if view.heap_kind() != kind {
            return Err(RhiError::Gpu(format!(
                "{:?} cannot be written into a {} heap",
                view, kind
            )));
        }
        if index as usize >= capacity {
            return Err(RhiError::HeapExhausted {
                heap: kind,
                capacity: capacity as u32,
            });
        }

        let built = self.build_view(view)?;
        let slot = self
            .heaps
            .get_mut(&heap)
            .and_then(|entry| entry.slots.get_mut(index as usize))
            .ok_or_else(|| RhiError::Gpu(format!("unknown {:?}", heap)))?;
        if let Some(old) = slot.replace(built).and_then(|old| old.image_view) {
            unsafe { self.device.destroy_image_view(old, None) };
        }
        Ok(())
    }

    fn compile_shader(
        &mut self,
        stage: ShaderStage,
        source: &str,
        entry_point: &str,
        model: ShaderModel,
    ) -> RhiResult<ShaderBlob> {
        if model == ShaderModel::Sm6_1 && !self.capabilities.shader_model_6_1 {
            return Err(RhiError::ShaderCompilationFailed(
                "multiview shaders are not supported by this adapter".to_string(),
            ));
        }
        pipeline::compile_wgsl(stage, source, entry_point, model)
    }

    fn create_pipeline(&mut self, desc: &GpuPipelineDesc) -> RhiResult<RawPipeline> {
        if desc.view_instance_count > 1
            && (!self.capabilities.view_instancing || desc.view_instance_count > MAX_VIEW_INSTANCES)
        {
            return Err(RhiError::Gpu(format!(
                "pipeline '{}' needs {} views",
                desc.name, desc.view_instance_count
            )));
        }
        let pipeline = pipeline::create_graphics_pipeline(&self.device, self.pipeline_layout, desc)?;
        let id = RawPipeline(self.next_id());
        self.pipelines
            .insert(id, (pipeline, pipeline::view_mask(desc.view_instance_count)));
        Ok(id)
    }

    fn release_pipeline(&mut self, pipeline: RawPipeline) {
        if let Some((pipeline, _)) = self.pipelines.remove(&pipeline) {
            unsafe { self.device.destroy_pipeline(pipeline, None) };
        }
    }

    fn create_command_allocator(&mut self) -> RhiResult<RawAllocator> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(self.queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let pool = unsafe { self.device.create_command_pool(&pool_info, None) }
            .map_err(|e| gpu_error("Failed to create command pool", e))?;
        let id = RawAllocator(self.next_id());
        self.allocators.insert(
            id,
            VkCommandAllocator {
                pool,
                buffers: Vec::new(),
                next_buffer: 0,
                descriptor_pools: Vec::new(),
                active_pool: 0,
            },
        );
        Ok(id)
    }

    fn reset_command_allocator(&mut self, allocator: RawAllocator) -> RhiResult<()> {
        let entry = self
            .allocators
            .get_mut(&allocator)
            .ok_or_else(|| RhiError::Gpu(format!("{:?} is not a command allocator", allocator)))?;
        unsafe {
            self.device
                .reset_command_pool(entry.pool, vk::CommandPoolResetFlags::empty())
                .map_err(|e| gpu_error("Failed to reset command pool", e))?;
            for pool in &entry.descriptor_pools {
                self.device
                    .reset_descriptor_pool(*pool, vk::DescriptorPoolResetFlags::empty())
                    .map_err(|e| gpu_error("Failed to reset descriptor pool", e))?;
            }
        }
        entry.next_buffer = 0;
        entry.active_pool = 0;
        Ok(())
    }

    fn execute(&mut self, list: &mut GpuCommandList) -> RhiResult<()> {
        if list.is_open() {
            return Err(RhiError::Gpu("executing an open command list".to_string()));
        }
        let allocator = list
            .allocator()
            .ok_or_else(|| RhiError::Gpu("command list was never reset".to_string()))?;
        let commands = list.take_commands();

        let cb = self.next_command_buffer(allocator)?;
        let begin = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(cb, &begin) }
            .map_err(|e| gpu_error("Failed to begin command buffer", e))?;

        let mut state = EncodeState {
            cb,
            allocator,
            rtvs: Vec::new(),
            dsv: None,
            rendering: None,
            view_mask: 0,
            constants: None,
            tables: [None; MAX_TEXTURE_SLOTS as usize],
        };
        let mut result = Ok(());
        for command in &commands {
            if let Err(e) = self.encode(&mut state, command) {
                result = Err(e);
                break;
            }
        }
        self.end_rendering(&mut state);
        unsafe { self.device.end_command_buffer(cb) }
            .map_err(|e| gpu_error("Failed to end command buffer", e))?;
        result?;

        let cbs = [cb];
        let submit = vk::SubmitInfo::default().command_buffers(&cbs);
        unsafe { self.device.queue_submit(self.queue, &[submit], vk::Fence::null()) }
            .map_err(|e| gpu_error("Queue submission failed", e))
    }

    fn signal(&mut self, value: u64) -> RhiResult<()> {
        if value <= self.last_signal {
            return Err(RhiError::Gpu(format!(
                "fence signal {} does not exceed the previous signal {}",
                value, self.last_signal
            )));
        }
        let semaphores = [self.timeline];
        let values = [value];
        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::default().signal_semaphore_values(&values);
        let submit = vk::SubmitInfo::default()
            .signal_semaphores(&semaphores)
            .push_next(&mut timeline_info);
        unsafe { self.device.queue_submit(self.queue, &[submit], vk::Fence::null()) }
            .map_err(|e| gpu_error("Fence signal failed", e))?;
        self.last_signal = value;
        Ok(())
    }

    fn completed_value(&self) -> u64 {
        unsafe { self.device.get_semaphore_counter_value(self.timeline) }.unwrap_or_else(|e| {
            log::error!("Failed to read the queue fence: {:?}", e);
            0
        })
    }

    fn wait_for_value(&self, value: u64) -> RhiResult<()> {
        if value > self.last_signal {
            return Err(RhiError::Gpu(format!(
                "waiting for fence value {} that was never signaled (last signal {})",
                value, self.last_signal
            )));
        }
        let semaphores = [self.timeline];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        unsafe { self.device.wait_semaphores(&wait_info, u64::MAX) }
            .map_err(|e| gpu_error("Fence wait failed", e))
    }
}

impl Drop for VulkanGpu {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            for heap in std::mem::take(&mut self.heaps).into_values() {
                for view in heap.slots.into_iter().flatten() {
                    if let Some(image_view) = view.image_view {
                        self.device.destroy_image_view(image_view, None);
                    }
                }
            }
            if self.null_image_view != vk::ImageView::null() {
                self.device.destroy_image_view(self.null_image_view, None);
            }
            let resources: Vec<RawResource> = self.resources.keys().copied().collect();
            for resource in resources {
                self.release_resource(resource);
            }
            for (pipeline, _) in std::mem::take(&mut self.pipelines).into_values() {
                self.device.destroy_pipeline(pipeline, None);
            }
            for allocator in std::mem::take(&mut self.allocators).into_values() {
                for pool in allocator.descriptor_pools {
                    self.device.destroy_descriptor_pool(pool, None);
                }
                self.device.destroy_command_pool(allocator.pool, None);
            }
            self.device.destroy_pipeline_layout(self.pipeline_layout, None);
            self.device.destroy_descriptor_set_layout(self.set_layout, None);
            for sampler in self.samplers.drain(..) {
                self.device.destroy_sampler(sampler, None);
            }
            self.device.destroy_command_pool(self.utility_pool, None);
            self.device.destroy_semaphore(self.timeline, None);

            // the allocator frees its memory blocks through the device
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
            destroy_instance(&self.instance, &self.debug);
        }
    }
}
