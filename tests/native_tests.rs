//! Native backend behavior on the software GPU.
//!
//! These tests look at what the frame ring, the descriptor heaps and the
//! PSO cache do with the GPU queue, so they drive the device through a
//! [`SoftGpuProbe`](render_rhi::backend::native::SoftGpuProbe).

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{clear_list, create_pipeline, create_target, draw_list, SoftContext, SHADER_SOURCE};
use render_rhi::backend::native::gpu::{GpuCommandList, RawHeap, ResourceState};
use render_rhi::backend::native::soft::SoftGpuDesc;
use render_rhi::backend::native::{OverlayRenderer, SoftGpu};
use render_rhi::render_graph::*;
use render_rhi::rhi::*;
use render_rhi::{NativeConfig, NativeDevice, RenderGraph, RhiError, RhiResult};
use rstest::rstest;

fn srv_of(device: &NativeDevice, texture: TextureHandle) -> u32 {
    device
        .texture_views(texture)
        .and_then(|views| views.srv)
        .expect("texture should have a shader resource view")
}

/// A list drawing one triangle into `framebuffer` after `bind` set up the draw.
fn bound_draw_list(
    framebuffer: FramebufferHandle,
    pipeline: PipelineHandle,
    bind: impl FnOnce(&mut CommandList),
) -> CommandList {
    let mut list = CommandList::new();
    list.begin_pass(PassTarget::Framebuffer(framebuffer), ClearDesc::load());
    list.bind_pipeline(pipeline);
    bind(&mut list);
    list.draw(3, 1, 0, 0);
    list.end_pass();
    list
}

// ============================================================================
// Frame ring
// ============================================================================

/// Submissions walk the frame slots in order, and each slot's fence grows.
#[rstest]
#[case::single(1)]
#[case::double(2)]
#[case::triple(3)]
fn test_frame_slot_fences_increase(#[case] frames_in_flight: usize) {
    let mut ctx = SoftContext::with_frames_in_flight(frames_in_flight);
    let (_, framebuffer) =
        create_target(&mut ctx.device, Extent2D::new(16, 16), TextureFormat::Rgba8Unorm).unwrap();

    let mut last_fence = vec![0u64; frames_in_flight];
    for submission in 0..10u64 {
        ctx.device
            .submit_command_list(clear_list(framebuffer, [0.0, 0.0, 0.0, 1.0]))
            .unwrap();

        let slot = ctx.device.active_frame_slot();
        assert_eq!(slot, (submission % frames_in_flight as u64) as usize);
        let fence = ctx.device.frame_slot_fence(slot).unwrap();
        assert_eq!(fence, submission + 1);
        assert!(fence > last_fence[slot]);
        last_fence[slot] = fence;

        let stats = ctx.device.frame_stats();
        assert_eq!(stats.submissions, submission + 1);
        assert_eq!(stats.last_fence_value, submission + 1);
        assert!(stats.completed_fence_value <= stats.last_fence_value);
        assert_eq!(
            stats.slots_touched,
            (submission as usize + 1).min(frames_in_flight)
        );
    }
}

/// With two frames in flight, the third submission waits for the first.
#[test]
fn test_third_submission_waits_for_first_frame() {
    let mut ctx = SoftContext::with_frames_in_flight(2);
    let (_, framebuffer) =
        create_target(&mut ctx.device, Extent2D::new(16, 16), TextureFormat::Rgba8Unorm).unwrap();

    ctx.probe.pause();
    for _ in 0..2 {
        ctx.device
            .submit_command_list(clear_list(framebuffer, [0.0, 0.0, 0.0, 1.0]))
            .unwrap();
    }
    assert_eq!(ctx.probe.completed_value(), 0);
    assert_eq!(ctx.device.frame_stats().slots_touched, 2);

    let resumed = Arc::new(AtomicBool::new(false));
    let resumer = {
        let probe = ctx.probe.clone();
        let resumed = Arc::clone(&resumed);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            resumed.store(true, Ordering::SeqCst);
            probe.resume();
        })
    };

    ctx.device
        .submit_command_list(clear_list(framebuffer, [0.0, 0.0, 0.0, 1.0]))
        .unwrap();
    assert!(resumed.load(Ordering::SeqCst), "third submission did not wait");
    assert!(ctx.probe.completed_value() >= 1);
    assert_eq!(ctx.device.frame_stats().slots_touched, 2);
    assert_eq!(ctx.device.active_frame_slot(), 0);

    resumer.join().unwrap();
    ctx.device.wait_idle().unwrap();
    assert!(ctx.probe.validation_errors().is_empty());
}

/// A list failing mid-way is still executed and fenced.
#[test]
fn test_failed_submission_is_fenced() {
    let mut ctx = SoftContext::new();
    let (_, framebuffer) =
        create_target(&mut ctx.device, Extent2D::new(16, 16), TextureFormat::Rgba8Unorm).unwrap();

    let mut list = clear_list(framebuffer, [0.0, 0.0, 0.0, 1.0]);
    list.bind_texture_2d(MAX_TEXTURE_SLOTS, TextureHandle::NULL);
    assert!(ctx.device.submit_command_list(list).is_err());

    let stats = ctx.device.frame_stats();
    assert_eq!(stats.submissions, 1);
    assert_eq!(stats.last_fence_value, 1);

    ctx.device.wait_idle().unwrap();
    assert_eq!(ctx.probe.completed_value(), 1);
}

// ============================================================================
// Descriptor slots
// ============================================================================

/// A destroyed texture's view slot is not handed out again until the frame
/// that could still read it has completed.
#[test]
fn test_freed_view_slot_waits_for_fence() {
    let mut ctx = SoftContext::with_frames_in_flight(2);
    let (_, framebuffer) =
        create_target(&mut ctx.device, Extent2D::new(16, 16), TextureFormat::Rgba8Unorm).unwrap();
    let submit = |ctx: &mut SoftContext| {
        ctx.device
            .submit_command_list(clear_list(framebuffer, [0.0, 0.0, 0.0, 1.0]))
            .unwrap();
    };

    submit(&mut ctx);
    ctx.probe.pause();

    let doomed = ctx
        .device
        .create_texture_2d(Extent2D::new(8, 8), TextureFormat::Rgba8Unorm)
        .unwrap();
    let freed_slot = srv_of(&ctx.device, doomed);
    ctx.device.destroy_texture(doomed);

    let second = ctx
        .device
        .create_texture_2d(Extent2D::new(8, 8), TextureFormat::Rgba8Unorm)
        .unwrap();
    assert_ne!(srv_of(&ctx.device, second), freed_slot);

    // lands on the other slot, the freed view belongs to slot 0
    submit(&mut ctx);
    let third = ctx
        .device
        .create_texture_2d(Extent2D::new(8, 8), TextureFormat::Rgba8Unorm)
        .unwrap();
    assert_ne!(srv_of(&ctx.device, third), freed_slot);

    let resumer = {
        let probe = ctx.probe.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            probe.resume();
        })
    };
    // back on slot 0: waits for its fence, then releases the view
    submit(&mut ctx);
    resumer.join().unwrap();
    assert!(ctx.probe.completed_value() >= 1);

    let fourth = ctx
        .device
        .create_texture_2d(Extent2D::new(8, 8), TextureFormat::Rgba8Unorm)
        .unwrap();
    assert_eq!(srv_of(&ctx.device, fourth), freed_slot);

    ctx.device.wait_idle().unwrap();
    assert!(ctx.probe.validation_errors().is_empty());
}

/// The shader resource heap reports exhaustion instead of overwriting slots.
#[test]
fn test_srv_heap_exhaustion() {
    // three reserved slots plus two dynamic ones
    let mut ctx = SoftContext::with_config(NativeConfig::default().with_srv_heap_size(5));
    for _ in 0..2 {
        ctx.device
            .create_texture_2d(Extent2D::new(4, 4), TextureFormat::Rgba8Unorm)
            .unwrap();
    }
    let err = ctx
        .device
        .create_texture_2d(Extent2D::new(4, 4), TextureFormat::Rgba8Unorm)
        .unwrap_err();
    assert!(matches!(err, render_rhi::RhiError::HeapExhausted { .. }));
}

// ============================================================================
// PSO cache
// ============================================================================

/// Identical draws reuse one PSO; a state change builds another.
#[test]
fn test_pso_cache_reuses_identical_state() {
    let mut ctx = SoftContext::new();
    let (_, framebuffer) =
        create_target(&mut ctx.device, Extent2D::new(16, 16), TextureFormat::Rgba8Unorm).unwrap();
    let pipeline = create_pipeline(&mut ctx.device, "cached").unwrap();
    let state = GraphicsState::default();

    for _ in 0..3 {
        ctx.device
            .submit_command_list(draw_list(framebuffer, pipeline, state))
            .unwrap();
    }
    assert_eq!(ctx.device.pso_builds(), 1);
    assert_eq!(ctx.device.pso_cache_len(), 1);

    let culled = state.with_cull_mode(CullMode::None);
    ctx.device
        .submit_command_list(draw_list(framebuffer, pipeline, culled))
        .unwrap();
    ctx.device
        .submit_command_list(draw_list(framebuffer, pipeline, state))
        .unwrap();
    assert_eq!(ctx.device.pso_builds(), 2);
    assert_eq!(ctx.device.pso_cache_len(), 2);

    ctx.device.wait_idle().unwrap();
    let stats = ctx.probe.stats();
    assert_eq!(stats.pipelines_created, 2);
    assert_eq!(stats.draws, 5);
    assert!(ctx.probe.validation_errors().is_empty());
}

/// The render target format is part of the PSO key.
#[test]
fn test_pso_cache_keys_on_target_format() {
    let mut ctx = SoftContext::new();
    let pipeline = create_pipeline(&mut ctx.device, "formats").unwrap();
    for format in [TextureFormat::Rgba8Unorm, TextureFormat::Rgba16Float] {
        let (_, framebuffer) = create_target(&mut ctx.device, Extent2D::new(16, 16), format).unwrap();
        ctx.device
            .submit_command_list(draw_list(framebuffer, pipeline, GraphicsState::default()))
            .unwrap();
    }
    assert_eq!(ctx.device.pso_builds(), 2);
}

/// A multi-view pipeline the driver rejects is disabled and its draws skipped.
#[test]
fn test_rejected_multi_view_pipeline_skips_draws() {
    let gpu = SoftGpu::with_desc(SoftGpuDesc {
        reject_multi_view_pipelines: true,
        ..Default::default()
    });
    let probe = gpu.probe();
    let mut device = NativeDevice::new(Box::new(gpu), NativeConfig::default()).unwrap();

    let cube = device
        .create_texture_cube(Extent2D::new(16, 16), TextureFormat::Rgba8Unorm)
        .unwrap();
    let framebuffer = device.create_framebuffer_cube(cube, TextureHandle::NULL).unwrap();
    let vs = device
        .create_shader_ex(ShaderStage::Vertex, "VSMain", SHADER_SOURCE, ShaderModel::Sm6_1)
        .unwrap();
    let ps = device
        .create_shader_ex(ShaderStage::Pixel, "PSMain", SHADER_SOURCE, ShaderModel::Sm6_1)
        .unwrap();
    let pipeline = device
        .create_pipeline_ex("cube_views", vs, ps, PrimitiveTopologyType::Triangle, 6)
        .unwrap();
    assert!(pipeline.is_valid());

    for _ in 0..2 {
        device
            .submit_command_list(draw_list(framebuffer, pipeline, GraphicsState::default()))
            .unwrap();
    }
    device.wait_idle().unwrap();

    assert_eq!(device.pso_cache_len(), 1);
    assert_eq!(probe.stats().draws, 0);
    assert!(probe.validation_errors().is_empty());
}

/// Destroying a pipeline drops its PSOs and releases them once the GPU is done.
#[test]
fn test_destroy_pipeline_purges_cached_psos() {
    let mut ctx = SoftContext::new();
    let (_, framebuffer) =
        create_target(&mut ctx.device, Extent2D::new(16, 16), TextureFormat::Rgba8Unorm).unwrap();
    let pipeline = create_pipeline(&mut ctx.device, "purged").unwrap();
    let kept = create_pipeline(&mut ctx.device, "kept").unwrap();

    ctx.probe.pause();
    for draw in [pipeline, kept] {
        ctx.device
            .submit_command_list(draw_list(framebuffer, draw, GraphicsState::default()))
            .unwrap();
    }
    assert_eq!(ctx.device.pso_cache_len(), 2);

    ctx.device.destroy_pipeline(pipeline);
    assert_eq!(ctx.device.pso_cache_len(), 1);
    ctx.probe.resume();

    for _ in 0..4 {
        ctx.device
            .submit_command_list(clear_list(framebuffer, [0.0, 0.0, 0.0, 1.0]))
            .unwrap();
    }
    ctx.device.wait_idle().unwrap();

    let errors = ctx.probe.validation_errors();
    assert!(errors.is_empty(), "validation errors: {errors:?}");
    assert!(matches!(
        ctx.device
            .submit_command_list(draw_list(framebuffer, pipeline, GraphicsState::default())),
        Err(RhiError::HandleNotFound { kind: "pipeline", .. })
    ));
}

// ============================================================================
// Draws
// ============================================================================

/// A layout reading vertex buffer slot 0 fails the draw when nothing is bound there.
#[test]
fn test_draw_without_vertex_buffer_fails() {
    let mut ctx = SoftContext::new();
    let (_, framebuffer) =
        create_target(&mut ctx.device, Extent2D::new(16, 16), TextureFormat::Rgba8Unorm).unwrap();
    let pipeline = create_pipeline(&mut ctx.device, "vertices").unwrap();
    let layout = ctx
        .device
        .create_input_layout(&InputLayoutDesc {
            attributes: vec![VertexAttribute::new(VertexSemantic::Position, VertexFormat::Float32x3, 0)],
            stride_bytes: 12,
        })
        .unwrap();

    let list = bound_draw_list(framebuffer, pipeline, |list| list.bind_input_layout(layout));
    assert_eq!(
        ctx.device.submit_command_list(list),
        Err(RhiError::MissingVertexBuffer(0))
    );
    assert_eq!(ctx.device.frame_stats().last_fence_value, 1);
}

/// Indexed draws need an index buffer and reach the GPU with one bound.
#[test]
fn test_draw_indexed() {
    let mut ctx = SoftContext::new();
    let (_, framebuffer) =
        create_target(&mut ctx.device, Extent2D::new(16, 16), TextureFormat::Rgba8Unorm).unwrap();
    let pipeline = create_pipeline(&mut ctx.device, "indexed").unwrap();
    let indices: [u16; 3] = [0, 1, 2];
    let index_buffer = ctx
        .device
        .create_buffer(&BufferDesc::new(BufferBindFlag::IndexBuffer, 6))
        .unwrap();
    ctx.device
        .update_buffer(index_buffer, bytemuck::cast_slice(&indices[..]), 0)
        .unwrap();

    let mut unbound = CommandList::new();
    unbound.begin_pass(PassTarget::Framebuffer(framebuffer), ClearDesc::load());
    unbound.bind_pipeline(pipeline);
    unbound.draw_indexed(3, 1, 0, 0, 0);
    unbound.end_pass();
    assert!(matches!(
        ctx.device.submit_command_list(unbound),
        Err(RhiError::InvalidCommand(_))
    ));

    let mut list = CommandList::new();
    list.begin_pass(PassTarget::Framebuffer(framebuffer), ClearDesc::load());
    list.bind_pipeline(pipeline);
    list.bind_index_buffer(index_buffer, IndexType::Uint16, 0);
    list.draw_indexed(3, 2, 0, 0, 0);
    list.end_pass();
    ctx.device.submit_command_list(list).unwrap();

    ctx.device.wait_idle().unwrap();
    assert_eq!(ctx.probe.stats().draws, 1);
}

/// Per-draw constants overflowing the frame's ring fail the list; the next frame starts over.
#[test]
fn test_constants_ring_overflow() {
    // two 256-byte aligned draws fit
    let mut ctx = SoftContext::with_config(NativeConfig::default().with_constants_ring_bytes(512));
    let (_, framebuffer) =
        create_target(&mut ctx.device, Extent2D::new(16, 16), TextureFormat::Rgba8Unorm).unwrap();
    let pipeline = create_pipeline(&mut ctx.device, "ring").unwrap();

    let list_with_draws = |draws: usize| {
        let mut list = CommandList::new();
        list.begin_pass(PassTarget::Framebuffer(framebuffer), ClearDesc::load());
        list.bind_pipeline(pipeline);
        list.set_constants(0, &[1u8; 64]).unwrap();
        for _ in 0..draws {
            list.draw(3, 1, 0, 0);
        }
        list.end_pass();
        list
    };

    assert_eq!(
        ctx.device.submit_command_list(list_with_draws(3)),
        Err(RhiError::RingOverflow {
            ring: "constants",
            requested: 64,
            offset: 512,
            capacity: 512,
        })
    );
    ctx.device.submit_command_list(list_with_draws(2)).unwrap();
    ctx.device.wait_idle().unwrap();
}

/// The overlay record reaches the installed renderer and is ignored without one.
#[test]
fn test_overlay_is_forwarded() {
    struct CollectingOverlay(Arc<Mutex<Vec<u32>>>);

    impl OverlayRenderer for CollectingOverlay {
        fn record(
            &mut self,
            draw_data: &OverlayDrawData,
            _list: &mut GpuCommandList,
            _srv_heap: RawHeap,
        ) -> RhiResult<()> {
            if let Some(value) = draw_data.downcast_ref::<u32>() {
                self.0.lock().unwrap().push(*value);
            }
            Ok(())
        }
    }

    let mut ctx = SoftContext::new();
    let (_, framebuffer) =
        create_target(&mut ctx.device, Extent2D::new(16, 16), TextureFormat::Rgba8Unorm).unwrap();
    let overlay_list = |value: u32| {
        let mut list = CommandList::new();
        list.begin_pass(PassTarget::Framebuffer(framebuffer), ClearDesc::load());
        list.render_overlay(OverlayDrawData::new(value));
        list.end_pass();
        list
    };

    ctx.device.submit_command_list(overlay_list(1)).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    ctx.device
        .set_overlay_renderer(Box::new(CollectingOverlay(Arc::clone(&seen))));
    ctx.device.submit_command_list(overlay_list(7)).unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![7]);

    let mut outside = CommandList::new();
    outside.render_overlay(OverlayDrawData::new(9u32));
    assert!(matches!(
        ctx.device.submit_command_list(outside),
        Err(RhiError::InvalidCommand(_))
    ));
    assert_eq!(*seen.lock().unwrap(), vec![7]);
}

// ============================================================================
// Texture bindings
// ============================================================================

/// Binding a cube as an array creates its array view once; 2D textures have none.
#[test]
fn test_cube_array_view_is_created_on_first_bind() {
    let mut ctx = SoftContext::new();
    let (texture, framebuffer) =
        create_target(&mut ctx.device, Extent2D::new(16, 16), TextureFormat::Rgba8Unorm).unwrap();
    let pipeline = create_pipeline(&mut ctx.device, "array").unwrap();
    let cube = ctx
        .device
        .create_texture_cube(Extent2D::new(8, 8), TextureFormat::Rgba8Unorm)
        .unwrap();
    assert_eq!(ctx.device.texture_views(cube).unwrap().srv_array, None);

    let draw_from_cube = |ctx: &mut SoftContext| {
        ctx.device
            .submit_command_list(bound_draw_list(framebuffer, pipeline, |list| {
                list.bind_texture_2d_array(0, cube)
            }))
            .unwrap();
    };

    draw_from_cube(&mut ctx);
    let views = ctx.device.texture_views(cube).unwrap();
    let array_slot = views.srv_array.expect("cube should have an array view");
    assert_ne!(Some(array_slot), views.srv);
    let usage = ctx.device.descriptor_usage();

    draw_from_cube(&mut ctx);
    assert_eq!(ctx.device.texture_views(cube).unwrap().srv_array, Some(array_slot));
    assert_eq!(ctx.device.descriptor_usage(), usage);
    assert_eq!(
        ctx.device.texture_state(cube),
        Some(ResourceState::PixelShaderResource)
    );

    let (_, other_target) =
        create_target(&mut ctx.device, Extent2D::new(16, 16), TextureFormat::Rgba8Unorm).unwrap();
    let err = ctx
        .device
        .submit_command_list(bound_draw_list(other_target, pipeline, |list| {
            list.bind_texture_2d_array(0, texture)
        }))
        .unwrap_err();
    assert!(matches!(err, RhiError::InvalidCommand(_)));
    assert_eq!(ctx.device.texture_views(texture).unwrap().srv_array, None);
}

/// Repointing a descriptor index changes what later draws sample.
#[test]
fn test_descriptor_update_is_seen_by_later_draws() {
    let mut ctx = SoftContext::new();
    let (_, framebuffer) =
        create_target(&mut ctx.device, Extent2D::new(16, 16), TextureFormat::Rgba8Unorm).unwrap();
    let pipeline = create_pipeline(&mut ctx.device, "bindless").unwrap();
    let first = ctx
        .device
        .create_texture_2d(Extent2D::new(8, 8), TextureFormat::Rgba8Unorm)
        .unwrap();
    let second = ctx
        .device
        .create_texture_2d(Extent2D::new(8, 8), TextureFormat::Rgba8Unorm)
        .unwrap();
    let index = ctx.device.allocate_texture_descriptor(first).unwrap();

    ctx.device
        .submit_command_list(bound_draw_list(framebuffer, pipeline, |list| {
            list.bind_texture_desc(0, index)
        }))
        .unwrap();
    assert_eq!(
        ctx.device.texture_state(first),
        Some(ResourceState::PixelShaderResource)
    );
    assert_eq!(ctx.device.texture_state(second), Some(ResourceState::RenderTarget));

    ctx.device.update_texture_descriptor(index, second).unwrap();
    ctx.device
        .submit_command_list(bound_draw_list(framebuffer, pipeline, |list| {
            list.bind_texture_desc(0, index)
        }))
        .unwrap();
    assert_eq!(
        ctx.device.texture_state(second),
        Some(ResourceState::PixelShaderResource)
    );

    ctx.device.wait_idle().unwrap();
    let errors = ctx.probe.validation_errors();
    assert!(errors.is_empty(), "validation errors: {errors:?}");
    assert_eq!(ctx.probe.stats().draws, 2);
}

// ============================================================================
// Buffer updates
// ============================================================================

/// Updates after the first submission wait for the next one; destroying the
/// buffer drops what is still queued.
#[test]
fn test_buffer_updates_are_queued_after_first_submit() {
    let mut ctx = SoftContext::new();
    let (_, framebuffer) =
        create_target(&mut ctx.device, Extent2D::new(16, 16), TextureFormat::Rgba8Unorm).unwrap();
    let buffer = ctx
        .device
        .create_buffer(&BufferDesc::new(BufferBindFlag::VertexBuffer, 64))
        .unwrap();

    ctx.device.update_buffer(buffer, &[1u8; 64], 0).unwrap();
    assert_eq!(ctx.device.pending_buffer_updates(), 0);

    ctx.device
        .submit_command_list(clear_list(framebuffer, [0.0, 0.0, 0.0, 1.0]))
        .unwrap();
    ctx.device.update_buffer(buffer, &[2u8; 16], 0).unwrap();
    ctx.device.update_buffer(buffer, &[3u8; 16], 32).unwrap();
    assert_eq!(ctx.device.pending_buffer_updates(), 2);

    ctx.device
        .submit_command_list(clear_list(framebuffer, [0.0, 0.0, 0.0, 1.0]))
        .unwrap();
    assert_eq!(ctx.device.pending_buffer_updates(), 0);

    ctx.device.update_buffer(buffer, &[4u8; 16], 0).unwrap();
    assert_eq!(ctx.device.pending_buffer_updates(), 1);
    ctx.device.destroy_buffer(buffer);
    assert_eq!(ctx.device.pending_buffer_updates(), 0);

    ctx.device
        .submit_command_list(clear_list(framebuffer, [0.0, 0.0, 0.0, 1.0]))
        .unwrap();
    ctx.device.wait_idle().unwrap();
    let errors = ctx.probe.validation_errors();
    assert!(errors.is_empty(), "validation errors: {errors:?}");
}

// ============================================================================
// Readback
// ============================================================================

/// A cleared target reads back as the clear color.
#[rstest]
#[case::black([0.0, 0.0, 0.0, 1.0], [0, 0, 0, 255])]
#[case::red([1.0, 0.0, 0.0, 1.0], [255, 0, 0, 255])]
#[case::transparent([0.0, 0.0, 0.0, 0.0], [0, 0, 0, 0])]
fn test_clear_reads_back(#[case] color: [f32; 4], #[case] expected: [u8; 4]) {
    let mut ctx = SoftContext::new();
    let extent = Extent2D::new(512, 512);
    let (texture, framebuffer) = create_target(&mut ctx.device, extent, TextureFormat::Rgba8Unorm).unwrap();

    ctx.device.submit_command_list(clear_list(framebuffer, color)).unwrap();
    let pixels = ctx.device.read_texture(texture, 0).unwrap();

    assert_eq!(pixels.len(), 512 * 512 * 4);
    assert_eq!(&pixels[..4], &expected);
    assert!(pixels.chunks_exact(4).all(|pixel| pixel == &expected[..]));
    assert!(ctx.probe.validation_errors().is_empty());
}

/// Sampled textures read back what was uploaded, and replacing the pixels
/// keeps the texture's view slot.
#[test]
fn test_sampled_texture_upload_and_replace() {
    let mut ctx = SoftContext::new();
    let desc = SampledTextureDesc {
        extent: Extent2D::new(4, 4),
        format: TextureFormat::Rgba8Unorm,
        debug_name: "checker".to_string(),
    };
    let pixels: Vec<u8> = (0..64).collect();
    let texture = ctx.device.create_sampled_texture(&desc, &pixels).unwrap();
    let slot = srv_of(&ctx.device, texture);
    assert_eq!(ctx.device.read_texture(texture, 0).unwrap(), pixels);

    let replaced: Vec<u8> = (0..64).rev().collect();
    ctx.device.replace_sampled_texture(texture, &replaced).unwrap();
    assert_eq!(ctx.device.read_texture(texture, 0).unwrap(), replaced);
    assert_eq!(srv_of(&ctx.device, texture), slot);
    assert_eq!(
        ctx.device.texture_state(texture),
        Some(ResourceState::PixelShaderResource)
    );

    assert!(matches!(
        ctx.device.replace_sampled_texture(texture, &replaced[..16]),
        Err(RhiError::InvalidParameter(_))
    ));
    assert!(ctx.probe.validation_errors().is_empty());
}

/// Reading a layer the texture does not have fails.
#[test]
fn test_read_missing_layer() {
    let mut ctx = SoftContext::new();
    let texture = ctx
        .device
        .create_texture_2d(Extent2D::new(8, 8), TextureFormat::Rgba8Unorm)
        .unwrap();
    assert!(ctx.device.read_texture(texture, 1).is_err());
}

// ============================================================================
// Whole frames
// ============================================================================

/// A frame rendering, sampling and compositing through the render graph
/// produces no GPU validation errors.
#[test]
fn test_graph_frame_validates_cleanly() {
    let mut ctx = SoftContext::new();
    let device = &mut ctx.device;

    let layout = device
        .create_input_layout(&InputLayoutDesc {
            attributes: vec![VertexAttribute::new(VertexSemantic::Position, VertexFormat::Float32x3, 0)],
            stride_bytes: 12,
        })
        .unwrap();
    let vertices: [[f32; 3]; 3] = [[0.0, 0.5, 0.0], [-0.5, -0.5, 0.0], [0.5, -0.5, 0.0]];
    let vertex_buffer = device
        .create_buffer(&BufferDesc::new(BufferBindFlag::VertexBuffer, 36))
        .unwrap();
    device
        .update_buffer(vertex_buffer, bytemuck::cast_slice(&vertices[..]), 0)
        .unwrap();
    let pipeline = create_pipeline(device, "scene").unwrap();
    let mut swap_chain = device.create_swap_chain(&SwapChainDesc::default()).unwrap();

    for _ in 0..3 {
        let mut graph = RenderGraph::new();
        let extent = Extent2D::new(128, 128);
        let color = graph.create_texture(RgTextureDesc::color_2d("scene", extent, TextureFormat::Rgba8Unorm));
        let depth = graph.create_texture(RgTextureDesc::depth_2d("scene_depth", extent, TextureFormat::Depth32Float));

        graph.add_pass(
            "scene",
            PassAttachments::new(Some(color), Some(depth), ClearDesc::default()),
            move |pass| {
                let list = &mut *pass.command_list;
                list.bind_pipeline(pipeline);
                list.bind_input_layout(layout);
                list.bind_vertex_buffer(0, vertex_buffer, 12, 0);
                list.set_constants(0, &[0u8; 64])?;
                list.draw(3, 1, 0, 0);
                Ok(())
            },
        );
        graph.add_swap_chain_pass("composite", ClearDesc::default(), move |pass| {
            let scene = pass.resources.require(color)?;
            let list = &mut *pass.command_list;
            list.set_state(GraphicsState::default().with_depth(false, false, CompareOp::Always));
            list.bind_pipeline(pipeline);
            list.bind_texture_2d(0, scene);
            list.set_constants(0, &[0u8; 16])?;
            list.draw(3, 1, 0, 0);
            Ok(())
        });

        graph.execute(device, Some(swap_chain.as_ref())).unwrap();
        swap_chain.present().unwrap();
    }

    device.wait_idle().unwrap();
    let errors = ctx.probe.validation_errors();
    assert!(errors.is_empty(), "validation errors: {errors:?}");
    assert_eq!(ctx.probe.stats().draws, 6);
    ctx.device.destroy_swap_chain(swap_chain);
}

/// Every cube path renders its faces without validation errors.
#[rstest]
#[case::layered(CubeRenderPath::Layered, 1)]
#[case::view_instanced(CubeRenderPath::ViewInstanced, 1)]
#[case::per_face(CubeRenderPath::PerFace, 6)]
fn test_cube_paths_render(#[case] path: CubeRenderPath, #[case] draws: u64) {
    let mut ctx = SoftContext::new();
    let device = &mut ctx.device;

    let model = if path.is_single_pass() {
        ShaderModel::Sm6_1
    } else {
        ShaderModel::Sm5_1
    };
    let views = if path == CubeRenderPath::ViewInstanced {
        CUBE_FACE_COUNT
    } else {
        1
    };
    let vs = device
        .create_shader_ex(ShaderStage::Vertex, "VSMain", SHADER_SOURCE, model)
        .unwrap();
    let ps = device
        .create_shader_ex(ShaderStage::Pixel, "PSMain", SHADER_SOURCE, model)
        .unwrap();
    let pipeline = device
        .create_pipeline_ex("cube", vs, ps, PrimitiveTopologyType::Triangle, views)
        .unwrap();
    assert!(pipeline.is_valid());

    let extent = Extent2D::new(32, 32);
    let mut graph = RenderGraph::new();
    let color = graph.create_texture(RgTextureDesc::color_cube("cube", extent, TextureFormat::Rgba16Float));
    let depth = graph.create_texture(cube_depth_desc(path, "cube_depth", extent, TextureFormat::Depth32Float));
    add_cube_passes(
        &mut graph,
        "cube",
        path,
        color,
        Some(depth),
        ClearDesc::default(),
        move |pass, _faces| {
            pass.command_list.bind_pipeline(pipeline);
            pass.command_list.draw(36, 1, 0, 0);
            Ok(())
        },
    );
    graph.execute(device, None).unwrap();

    device.wait_idle().unwrap();
    let errors = ctx.probe.validation_errors();
    assert!(errors.is_empty(), "validation errors: {errors:?}");
    assert_eq!(ctx.probe.stats().draws, draws);
}
