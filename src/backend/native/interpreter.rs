//! Command-stream interpreter
//!
//! Each submission:
//! 1. begins the next frame slot (waiting on its fence, releasing its
//!    deferred frees, resetting its allocator and rings),
//! 2. flushes queued buffer updates through the slot's upload ring,
//! 3. records every [`Command`] into the native command list while
//!    tracking pipeline, input layout, vertex/index buffers, texture slots,
//!    constants and the open pass's render-target formats,
//! 4. closes, executes and signals the queue fence, stamping the slot.
//!
//! A failing command stops recording. Whatever was recorded up to that
//! point is still executed and fenced so the slot stays consistent, then
//! the error is returned.

use crate::backend::native::descriptors::{NULL_BUFFER_SRV, NULL_TEXTURE_SRV};
use crate::backend::native::entries::TextureKind;
use crate::backend::native::gpu::*;
use crate::backend::native::pso::{pack_state, CachedPso, PsoKey};
use crate::backend::native::NativeDevice;
use crate::error::{RhiError, RhiResult};
use crate::rhi::*;

#[derive(Debug, Clone, Copy)]
struct VertexBinding {
    buffer: BufferHandle,
    stride: u32,
    offset: u64,
}

#[derive(Debug, Clone, Copy)]
struct IndexBinding {
    buffer: BufferHandle,
    index_type: IndexType,
    offset: u64,
}

/// Render targets of the pass being recorded
#[derive(Debug, Clone, Copy)]
struct OpenPass {
    rtv_formats: [Option<TextureFormat>; MAX_RENDER_TARGETS],
    num_render_targets: u32,
    dsv_format: Option<TextureFormat>,
    /// Back buffer returned to the present state when the pass ends
    back_buffer: Option<TextureHandle>,
}

/// Bindings accumulated while walking one command list
#[derive(Debug)]
pub(crate) struct RecordingState {
    state: GraphicsState,
    topology: PrimitiveTopology,
    pipeline: PipelineHandle,
    input_layout: InputLayoutHandle,
    vertex_buffers: [Option<VertexBinding>; MAX_VERTEX_BUFFER_SLOTS as usize],
    index_buffer: Option<IndexBinding>,
    texture_slots: [u32; MAX_TEXTURE_SLOTS as usize],
    constants: PerDrawConstants,
    pass: Option<OpenPass>,
    applied_pipeline: Option<RawPipeline>,
    applied_topology: Option<PrimitiveTopology>,
    pub(crate) draws: u32,
    pub(crate) skipped_draws: u32,
}

impl RecordingState {
    pub(crate) fn new() -> Self {
        let mut texture_slots = [NULL_TEXTURE_SRV; MAX_TEXTURE_SLOTS as usize];
        texture_slots[STRUCTURED_BUFFER_DEFAULT_SLOT as usize] = NULL_BUFFER_SRV;
        Self {
            state: GraphicsState::default(),
            topology: PrimitiveTopology::default(),
            pipeline: PipelineHandle::NULL,
            input_layout: InputLayoutHandle::NULL,
            vertex_buffers: [None; MAX_VERTEX_BUFFER_SLOTS as usize],
            index_buffer: None,
            texture_slots,
            constants: PerDrawConstants::default(),
            pass: None,
            applied_pipeline: None,
            applied_topology: None,
            draws: 0,
            skipped_draws: 0,
        }
    }

    fn forget_applied_state(&mut self) {
        self.applied_pipeline = None;
        self.applied_topology = None;
    }
}

fn check_texture_slot(slot: u32) -> RhiResult<usize> {
    if slot >= MAX_TEXTURE_SLOTS {
        return Err(RhiError::InvalidCommand(format!(
            "texture slot {} out of range (0..{})",
            slot, MAX_TEXTURE_SLOTS
        )));
    }
    Ok(slot as usize)
}

impl NativeDevice {
    pub(crate) fn submit(&mut self, commands: CommandList) -> RhiResult<()> {
        let deferred = self.frames.begin_frame(self.gpu.as_mut())?;
        self.release_deferred(deferred);
        let allocator = self.frames.current().allocator;
        self.list.reset(allocator);
        self.has_submitted = true;

        let recorded = self.record_frame(commands);

        self.list.close();
        self.gpu.execute(&mut self.list)?;
        self.fence_value += 1;
        self.gpu.signal(self.fence_value)?;
        self.frames.end_frame(self.fence_value);

        let rec = recorded?;
        log::trace!(
            "Submission {} on slot {}: {} draws ({} skipped), fence {}",
            self.frames.submit_index(),
            self.frames.active_slot(),
            rec.draws,
            rec.skipped_draws,
            self.fence_value
        );
        Ok(())
    }

    fn record_frame(&mut self, commands: CommandList) -> RhiResult<RecordingState> {
        self.flush_pending_buffer_updates()?;

        let mut rec = RecordingState::new();
        for (index, command) in commands.into_commands().into_iter().enumerate() {
            if let Err(err) = self.record_command(&mut rec, command) {
                log::error!("Command {} failed: {}", index, err);
                self.close_open_pass(&mut rec)?;
                return Err(err);
            }
        }

        if rec.pass.is_some() {
            self.close_open_pass(&mut rec)?;
            return Err(RhiError::InvalidCommand(
                "command list ended inside an open pass".to_string(),
            ));
        }
        Ok(rec)
    }

    /// Copy queued buffer updates through the current slot's upload ring.
    fn flush_pending_buffer_updates(&mut self) -> RhiResult<()> {
        if self.pending_updates.is_empty() {
            return Ok(());
        }
        let updates = std::mem::take(&mut self.pending_updates);
        log::trace!("Flushing {} buffer updates", updates.len());

        for update in updates {
            let Some(entry) = self.buffers.get_mut(update.buffer) else {
                continue;
            };
            let ring = &mut self.frames.current_mut().uploads;
            let allocation = ring.allocate(update.data.len() as u64)?;
            let ring_resource = ring.resource();
            self.gpu
                .write_buffer(ring_resource, allocation.offset, &update.data)?;

            self.list
                .barrier(entry.resource, entry.state, ResourceState::CopyDest);
            self.list.copy_buffer_region(
                entry.resource,
                update.offset,
                ring_resource,
                allocation.offset,
                update.data.len() as u64,
            );
            self.list.barrier(
                entry.resource,
                ResourceState::CopyDest,
                ResourceState::GenericRead,
            );
            entry.state = ResourceState::GenericRead;
        }
        Ok(())
    }

    pub(crate) fn record_command(&mut self, rec: &mut RecordingState, command: Command) -> RhiResult<()> {
        match command {
            Command::BeginPass { target, clear } => self.begin_pass(rec, target, clear),
            Command::EndPass => {
                if rec.pass.is_none() {
                    return Err(RhiError::InvalidCommand(
                        "EndPass without an open pass".to_string(),
                    ));
                }
                self.close_open_pass(rec)
            }
            Command::SetViewport {
                x,
                y,
                width,
                height,
            } => {
                self.set_viewport(x, y, width, height);
                Ok(())
            }
            Command::SetState(state) => {
                rec.state = state;
                Ok(())
            }
            Command::SetPrimitiveTopology(topology) => {
                rec.topology = topology;
                Ok(())
            }
            Command::BindPipeline(pipeline) => {
                rec.pipeline = pipeline;
                Ok(())
            }
            Command::BindInputLayout(layout) => {
                rec.input_layout = layout;
                Ok(())
            }
            Command::BindVertexBuffer {
                slot,
                buffer,
                stride_bytes,
                offset_bytes,
            } => {
                if slot >= MAX_VERTEX_BUFFER_SLOTS {
                    return Err(RhiError::InvalidCommand(format!(
                        "vertex buffer slot {} out of range (0..{})",
                        slot, MAX_VERTEX_BUFFER_SLOTS
                    )));
                }
                rec.vertex_buffers[slot as usize] = (!buffer.is_null()).then_some(VertexBinding {
                    buffer,
                    stride: stride_bytes,
                    offset: offset_bytes,
                });
                Ok(())
            }
            Command::BindIndexBuffer {
                buffer,
                index_type,
                offset_bytes,
            } => {
                rec.index_buffer = (!buffer.is_null()).then_some(IndexBinding {
                    buffer,
                    index_type,
                    offset: offset_bytes,
                });
                Ok(())
            }
            Command::BindTexture2D { slot, texture } => {
                self.bind_texture(rec, slot, texture, TextureKind::Texture2D)
            }
            Command::BindTextureCube { slot, texture } => {
                self.bind_texture(rec, slot, texture, TextureKind::Cube)
            }
            Command::BindTexture2DArray { slot, texture } => {
                let slot = check_texture_slot(slot)?;
                if texture.is_null() {
                    rec.texture_slots[slot] = NULL_TEXTURE_SRV;
                    return Ok(());
                }
                let srv = self.ensure_texture_array_srv(texture)?;
                self.transition_texture(texture, ResourceState::PixelShaderResource)?;
                rec.texture_slots[slot] = srv;
                Ok(())
            }
            Command::BindTextureDesc { slot, index } => {
                let slot = check_texture_slot(slot)?;
                if index.is_null() {
                    rec.texture_slots[slot] = NULL_TEXTURE_SRV;
                    return Ok(());
                }
                let texture = self.bindless.get(index).ok_or_else(|| {
                    RhiError::InvalidCommand(format!(
                        "texture descriptor {} is not allocated",
                        index.raw()
                    ))
                })?;
                if texture.is_null() {
                    rec.texture_slots[slot] = NULL_TEXTURE_SRV;
                    return Ok(());
                }
                let srv = self.ensure_texture_srv(texture)?;
                self.transition_texture(texture, ResourceState::PixelShaderResource)?;
                rec.texture_slots[slot] = srv;
                Ok(())
            }
            Command::BindStructuredBufferSrv { slot, buffer } => {
                let slot = check_texture_slot(slot)?;
                rec.texture_slots[slot] = self
                    .buffers
                    .get(buffer)
                    .and_then(|entry| entry.srv)
                    .unwrap_or(NULL_BUFFER_SRV);
                Ok(())
            }
            Command::SetConstants { slot, data } => {
                if slot != 0 {
                    return Err(RhiError::InvalidCommand(format!(
                        "constants slot {} is not supported, only slot 0 exists",
                        slot
                    )));
                }
                rec.constants = data;
                Ok(())
            }
            Command::Draw {
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            } => {
                if !self.prepare_draw(rec)? {
                    return Ok(());
                }
                self.list.push(GpuCommand::Draw {
                    vertex_count,
                    instance_count,
                    first_vertex,
                    first_instance,
                });
                rec.draws += 1;
                Ok(())
            }
            Command::DrawIndexed {
                index_count,
                instance_count,
                first_index,
                base_vertex,
                first_instance,
            } => {
                let binding = rec.index_buffer.ok_or_else(|| {
                    RhiError::InvalidCommand("indexed draw without an index buffer".to_string())
                })?;
                if !self.prepare_draw(rec)? {
                    return Ok(());
                }
                let entry = self.buffers.require(binding.buffer)?;
                let size = entry.desc.size_bytes;
                if binding.offset >= size {
                    return Err(RhiError::OutOfBounds {
                        offset: binding.offset,
                        len: 0,
                        size,
                    });
                }
                self.list.push(GpuCommand::SetIndexBuffer(IndexBufferView {
                    resource: entry.resource,
                    offset: binding.offset,
                    size: size - binding.offset,
                    index_type: binding.index_type,
                }));
                self.list.push(GpuCommand::DrawIndexed {
                    index_count,
                    instance_count,
                    first_index,
                    base_vertex,
                    first_instance,
                });
                rec.draws += 1;
                Ok(())
            }
            Command::RenderOverlay(data) => {
                if rec.pass.is_none() {
                    return Err(RhiError::InvalidCommand(
                        "RenderOverlay outside of a pass".to_string(),
                    ));
                }
                if let Some(overlay) = self.overlay.as_mut() {
                    overlay.record(&data, &mut self.list, self.srv_heap)?;
                    rec.forget_applied_state();
                }
                Ok(())
            }
        }
    }

    fn transition_texture(&mut self, texture: TextureHandle, after: ResourceState) -> RhiResult<()> {
        let entry = self.textures.require_mut(texture)?;
        if entry.state != after {
            self.list.barrier(entry.resource, entry.state, after);
            entry.state = after;
        }
        Ok(())
    }

    fn set_viewport(&mut self, x: i32, y: i32, width: i32, height: i32) {
        self.list
            .push(GpuCommand::SetViewport(Viewport::from_rect(x, y, width, height)));
        self.list.push(GpuCommand::SetScissor(ScissorRect {
            left: x,
            top: y,
            right: x + width,
            bottom: y + height,
        }));
    }

    fn bind_texture(
        &mut self,
        rec: &mut RecordingState,
        slot: u32,
        texture: TextureHandle,
        kind: TextureKind,
    ) -> RhiResult<()> {
        let slot = check_texture_slot(slot)?;
        if texture.is_null() {
            rec.texture_slots[slot] = NULL_TEXTURE_SRV;
            return Ok(());
        }
        let entry = self.textures.require(texture)?;
        if entry.kind != kind {
            return Err(RhiError::InvalidCommand(format!(
                "texture '{}' is a {:?}, bound as a {:?}",
                entry.debug_name, entry.kind, kind
            )));
        }
        let srv = self.ensure_texture_srv(texture)?;
        self.transition_texture(texture, ResourceState::PixelShaderResource)?;
        rec.texture_slots[slot] = srv;
        Ok(())
    }

    fn begin_pass(&mut self, rec: &mut RecordingState, target: PassTarget, clear: ClearDesc) -> RhiResult<()> {
        if rec.pass.is_some() {
            return Err(RhiError::InvalidCommand(
                "BeginPass while another pass is open".to_string(),
            ));
        }

        let (color, layout, depth, back_buffer) = match target {
            PassTarget::SwapChain(target) => {
                (target.color, AttachmentLayout::Whole, target.depth, Some(target.color))
            }
            PassTarget::Framebuffer(framebuffer) => {
                let entry = self.framebuffers.require(framebuffer)?;
                (entry.color, entry.color_layout, entry.depth, None)
            }
        };

        let mut pass = OpenPass {
            rtv_formats: [None; MAX_RENDER_TARGETS],
            num_render_targets: 0,
            dsv_format: None,
            back_buffer,
        };
        let mut extent = None;
        let mut rtvs = Vec::new();
        let mut dsv = None;

        if !color.is_null() {
            let entry = self.textures.require(color)?;
            let view = match layout {
                AttachmentLayout::Whole => entry.views.rtv,
                AttachmentLayout::CubeFace(face) => entry
                    .views
                    .rtv_faces
                    .and_then(|faces| faces.get(face as usize).copied()),
                AttachmentLayout::CubeAllFaces => entry.views.rtv_all_faces,
            };
            let view = view.ok_or_else(|| {
                RhiError::InvalidCommand(format!(
                    "texture '{}' has no render target view for {:?}",
                    entry.debug_name, layout
                ))
            })?;
            pass.rtv_formats[0] = Some(entry.format);
            pass.num_render_targets = 1;
            extent = Some(entry.extent);
            rtvs.push(self.rtv_ref(view)?);
            self.transition_texture(color, ResourceState::RenderTarget)?;
        }

        if !depth.is_null() {
            let entry = self.textures.require(depth)?;
            let view = if layout == AttachmentLayout::CubeAllFaces {
                entry.views.dsv_all_faces.or(entry.views.dsv)
            } else {
                entry.views.dsv
            };
            let view = view.ok_or_else(|| {
                RhiError::InvalidCommand(format!(
                    "texture '{}' has no depth stencil view",
                    entry.debug_name
                ))
            })?;
            pass.dsv_format = Some(entry.format);
            extent = extent.or(Some(entry.extent));
            dsv = Some(self.dsv_ref(view)?);
            self.transition_texture(depth, ResourceState::DepthWrite)?;
        }

        let extent = extent.ok_or_else(|| {
            RhiError::InvalidCommand("pass has neither a color nor a depth attachment".to_string())
        })?;

        self.list.push(GpuCommand::SetRenderTargets {
            rtvs: rtvs.clone(),
            dsv,
        });
        if clear.clear_color {
            for rtv in &rtvs {
                self.list.push(GpuCommand::ClearRenderTarget {
                    rtv: *rtv,
                    color: clear.color,
                });
            }
        }
        if let (true, Some(dsv)) = (clear.clear_depth, dsv) {
            self.list.push(GpuCommand::ClearDepth {
                dsv,
                depth: clear.depth,
            });
        }
        self.set_viewport(0, 0, extent.width as i32, extent.height as i32);

        rec.pass = Some(pass);
        Ok(())
    }

    /// End the open pass, if any, returning a back buffer to the present state.
    fn close_open_pass(&mut self, rec: &mut RecordingState) -> RhiResult<()> {
        if let Some(pass) = rec.pass.take() {
            if let Some(back_buffer) = pass.back_buffer {
                self.transition_texture(back_buffer, ResourceState::Present)?;
            }
        }
        Ok(())
    }

    /// Bind everything a draw needs. Returns false when the draw is skipped.
    fn prepare_draw(&mut self, rec: &mut RecordingState) -> RhiResult<bool> {
        let pass = rec
            .pass
            .ok_or_else(|| RhiError::InvalidCommand("draw outside of a pass".to_string()))?;
        if rec.pipeline.is_null() {
            return Err(RhiError::InvalidCommand(
                "draw without a bound pipeline".to_string(),
            ));
        }
        let pipeline = self.pipelines.require(rec.pipeline)?;
        if pipeline.topology_type != rec.topology.topology_type() {
            return Err(RhiError::InvalidCommand(format!(
                "pipeline '{}' is built for {:?} primitives, topology is {:?}",
                pipeline.name, pipeline.topology_type, rec.topology
            )));
        }

        let slot_count = if rec.input_layout.is_null() {
            0
        } else {
            self.input_layouts.require(rec.input_layout)?.desc.slot_count()
        };
        if slot_count > MAX_VERTEX_BUFFER_SLOTS {
            return Err(RhiError::InvalidCommand(format!(
                "input layout needs {} vertex buffer slots",
                slot_count
            )));
        }

        let Some(pso) = self.ensure_pso(rec, &pass)? else {
            log::warn!(
                "Skipping draw: pipeline '{}' is disabled for this state",
                pipeline_name(self, rec.pipeline)
            );
            rec.skipped_draws += 1;
            return Ok(false);
        };
        if rec.applied_pipeline != Some(pso) {
            self.list.push(GpuCommand::SetPipeline(pso));
            rec.applied_pipeline = Some(pso);
        }
        if rec.applied_topology != Some(rec.topology) {
            self.list.push(GpuCommand::SetPrimitiveTopology(rec.topology));
            rec.applied_topology = Some(rec.topology);
        }

        if slot_count > 0 {
            let mut views = Vec::with_capacity(slot_count as usize);
            for slot in 0..slot_count {
                let binding =
                    rec.vertex_buffers[slot as usize].ok_or(RhiError::MissingVertexBuffer(slot))?;
                let entry = self.buffers.require(binding.buffer)?;
                let size = entry.desc.size_bytes;
                if binding.offset >= size {
                    return Err(RhiError::OutOfBounds {
                        offset: binding.offset,
                        len: 0,
                        size,
                    });
                }
                views.push(VertexBufferView {
                    resource: entry.resource,
                    offset: binding.offset,
                    size: size - binding.offset,
                    stride: binding.stride,
                });
            }
            self.list.push(GpuCommand::SetVertexBuffers(views));
        }

        let constants = &mut self.frames.current_mut().constants;
        let allocation = constants.allocate(rec.constants.len().max(1) as u64)?;
        let constants_resource = constants.resource();
        if !rec.constants.is_empty() {
            self.gpu.write_buffer(
                constants_resource,
                allocation.offset,
                rec.constants.as_bytes(),
            )?;
        }
        self.list.push(GpuCommand::SetRootConstantBuffer {
            parameter: ROOT_PARAM_CONSTANTS,
            resource: constants_resource,
            offset: allocation.offset,
        });

        for (register, index) in rec.texture_slots.iter().enumerate() {
            let descriptor = self.srv_ref(*index);
            self.list.push(GpuCommand::SetRootDescriptorTable {
                parameter: ROOT_PARAM_FIRST_TABLE + register as u32,
                descriptor,
            });
        }
        Ok(true)
    }

    /// Cached PSO for the current bindings, building it on a miss.
    /// `None` means the combination is disabled and the draw must be skipped.
    fn ensure_pso(&mut self, rec: &RecordingState, pass: &OpenPass) -> RhiResult<Option<RawPipeline>> {
        let key = PsoKey {
            pipeline: rec.pipeline.raw(),
            input_layout: rec.input_layout.raw(),
            packed_state: pack_state(&rec.state),
            rtv_formats: pass.rtv_formats,
            num_render_targets: pass.num_render_targets,
            dsv_format: pass.dsv_format,
        };
        if let Some(cached) = self.pso_cache.get(&key) {
            return Ok(match cached {
                CachedPso::Ready(raw) => Some(raw),
                CachedPso::Disabled => None,
            });
        }

        let pipeline = self.pipelines.require(rec.pipeline)?;
        let view_instance_count = pipeline.view_instance_count;
        if view_instance_count > 1
            && (!self.caps.view_instancing || view_instance_count > MAX_VIEW_INSTANCES)
        {
            log::warn!(
                "Pipeline '{}' needs {} view instances, disabling it",
                pipeline.name,
                view_instance_count
            );
            self.pso_cache.insert(key, CachedPso::Disabled);
            return Ok(None);
        }

        let vertex = self.shaders.require(pipeline.vertex_shader)?.blob.clone();
        let pixel = self.shaders.require(pipeline.pixel_shader)?.blob.clone();
        let input_layout = if rec.input_layout.is_null() {
            Vec::new()
        } else {
            self.input_layouts
                .require(rec.input_layout)?
                .desc
                .attributes
                .clone()
        };
        let desc = GpuPipelineDesc {
            name: pipeline.name.clone(),
            vertex,
            pixel,
            input_layout,
            topology_type: pipeline.topology_type,
            state: rec.state,
            rtv_formats: pass.rtv_formats[..pass.num_render_targets as usize]
                .iter()
                .flatten()
                .copied()
                .collect(),
            dsv_format: pass.dsv_format,
            view_instance_count,
        };

        match self.gpu.create_pipeline(&desc) {
            Ok(raw) => {
                log::debug!("Built PSO for pipeline '{}' ({:#018x})", desc.name, key.fnv1a());
                if let Some(replaced) = self.pso_cache.insert(key, CachedPso::Ready(raw)) {
                    self.frames.deferred().pipelines.push(replaced);
                }
                Ok(Some(raw))
            }
            Err(err) if view_instance_count > 1 => {
                log::warn!(
                    "Multi-view pipeline '{}' failed to build, disabling it: {}",
                    desc.name,
                    err
                );
                self.pso_cache.insert(key, CachedPso::Disabled);
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}

fn pipeline_name(device: &NativeDevice, pipeline: PipelineHandle) -> String {
    device
        .pipelines
        .get(pipeline)
        .map(|p| p.name.clone())
        .unwrap_or_default()
}
