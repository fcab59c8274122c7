//! Device behavior shared by every backend.
//!
//! Each test runs against the native backend on the software GPU and
//! against the null backend.

mod common;

use std::collections::BTreeSet;

use common::{clear_list, create_device, create_pipeline, create_target, Backend, SHADER_SOURCE};
use render_rhi::backend::native::gpu::MAX_VIEW_INSTANCES;
use render_rhi::rhi::*;
use render_rhi::{RenderGraph, RhiError};
use render_rhi::render_graph::{PassAttachments, RgTextureDesc};
use rstest::rstest;

// ============================================================================
// Handles
// ============================================================================

/// Destroying null and unknown handles of every kind does nothing.
#[rstest]
#[case::native(Backend::Native)]
#[case::null(Backend::Null)]
fn test_destroy_null_and_unknown_handles(#[case] backend: Backend) {
    let mut device = create_device(backend);

    for raw in [0, 4242] {
        device.destroy_texture(TextureHandle::from_raw(raw));
        device.destroy_buffer(BufferHandle::from_raw(raw));
        device.destroy_shader(ShaderHandle::from_raw(raw));
        device.destroy_pipeline(PipelineHandle::from_raw(raw));
        device.destroy_input_layout(InputLayoutHandle::from_raw(raw));
        device.destroy_framebuffer(FramebufferHandle::from_raw(raw));
        device.destroy_fence(FenceHandle::from_raw(raw));
        device.free_texture_descriptor(TextureDescIndex::from_raw(raw));
    }

    assert_eq!(device.resource_counts(), ResourceCounts::default());
}

/// Created handles are never zero and never repeat, even after a destroy.
#[rstest]
#[case::native(Backend::Native)]
#[case::null(Backend::Null)]
fn test_handles_are_never_reused(#[case] backend: Backend) {
    let mut device = create_device(backend);
    let mut seen = BTreeSet::new();

    for _ in 0..16 {
        let texture = device
            .create_texture_2d(Extent2D::new(4, 4), TextureFormat::Rgba8Unorm)
            .unwrap();
        assert!(texture.is_valid());
        assert!(seen.insert(texture.raw()), "handle {} handed out twice", texture.raw());
        device.destroy_texture(texture);
    }
}

/// Using a destroyed handle reports which kind of object was missing.
#[rstest]
#[case::native(Backend::Native)]
#[case::null(Backend::Null)]
fn test_stale_handle_is_reported(#[case] backend: Backend) {
    let mut device = create_device(backend);
    let texture = device
        .create_texture_2d(Extent2D::new(4, 4), TextureFormat::Rgba8Unorm)
        .unwrap();
    device.destroy_texture(texture);

    let err = device.create_framebuffer(texture, TextureHandle::NULL).unwrap_err();
    assert_eq!(
        err,
        RhiError::HandleNotFound {
            kind: "texture",
            id: texture.raw()
        }
    );
}

// ============================================================================
// Resources
// ============================================================================

/// Textures with an empty extent are rejected.
#[rstest]
#[case::native(Backend::Native)]
#[case::null(Backend::Null)]
fn test_empty_texture_rejected(#[case] backend: Backend) {
    let mut device = create_device(backend);
    let err = device
        .create_texture_2d(Extent2D::new(0, 16), TextureFormat::Rgba8Unorm)
        .unwrap_err();
    assert!(matches!(err, RhiError::InvalidParameter(_)));
}

/// Buffer updates must stay inside the buffer.
#[rstest]
#[case::native(Backend::Native)]
#[case::null(Backend::Null)]
fn test_update_buffer_bounds(#[case] backend: Backend) {
    let mut device = create_device(backend);
    let buffer = device
        .create_buffer(&BufferDesc::new(BufferBindFlag::VertexBuffer, 64))
        .unwrap();

    device.update_buffer(buffer, &[1u8; 64], 0).unwrap();
    device.update_buffer(buffer, &[1u8; 16], 48).unwrap();

    let err = device.update_buffer(buffer, &[1u8; 16], 56).unwrap_err();
    assert_eq!(
        err,
        RhiError::OutOfBounds {
            offset: 56,
            len: 16,
            size: 64
        }
    );
}

/// Offsets near the top of the address range are rejected, not wrapped.
#[rstest]
#[case::native(Backend::Native)]
#[case::null(Backend::Null)]
fn test_update_buffer_offset_overflow(#[case] backend: Backend) {
    let mut device = create_device(backend);
    let buffer = device
        .create_buffer(&BufferDesc::new(BufferBindFlag::VertexBuffer, 16))
        .unwrap();

    let err = device.update_buffer(buffer, &[1u8; 4], u64::MAX - 1).unwrap_err();
    assert_eq!(
        err,
        RhiError::OutOfBounds {
            offset: u64::MAX - 1,
            len: 4,
            size: 16
        }
    );
}

/// A framebuffer needs at least one attachment, and depth goes in the depth slot.
#[rstest]
#[case::native(Backend::Native)]
#[case::null(Backend::Null)]
fn test_framebuffer_attachment_roles(#[case] backend: Backend) {
    let mut device = create_device(backend);
    let color = device
        .create_texture_2d(Extent2D::new(8, 8), TextureFormat::Rgba8Unorm)
        .unwrap();
    let depth = device
        .create_texture_2d(Extent2D::new(8, 8), TextureFormat::Depth32Float)
        .unwrap();

    assert!(matches!(
        device.create_framebuffer(TextureHandle::NULL, TextureHandle::NULL),
        Err(RhiError::InvalidParameter(_))
    ));
    assert!(matches!(
        device.create_framebuffer(depth, TextureHandle::NULL),
        Err(RhiError::InvalidParameter(_))
    ));
    assert!(matches!(
        device.create_framebuffer(color, color),
        Err(RhiError::InvalidParameter(_))
    ));
    assert!(matches!(
        device.create_framebuffer_cube_face(TextureHandle::NULL, 0, depth),
        Err(RhiError::InvalidParameter(_))
    ));

    let framebuffer = device.create_framebuffer(color, depth).unwrap();
    assert!(framebuffer.is_valid());
    let depth_only = device.create_framebuffer(TextureHandle::NULL, depth).unwrap();
    assert!(depth_only.is_valid());
}

/// Input layouts reading more than two vertex buffer slots are rejected.
#[rstest]
#[case::native(Backend::Native)]
#[case::null(Backend::Null)]
fn test_input_layout_slot_limit(#[case] backend: Backend) {
    let mut device = create_device(backend);

    let two_slots = InputLayoutDesc {
        attributes: vec![
            VertexAttribute::new(VertexSemantic::Position, VertexFormat::Float32x3, 0),
            VertexAttribute::new(VertexSemantic::TexCoord, VertexFormat::Float32x4, 0).per_instance(1),
        ],
        stride_bytes: 12,
    };
    assert!(device.create_input_layout(&two_slots).is_ok());

    let three_slots = InputLayoutDesc {
        attributes: vec![
            VertexAttribute::new(VertexSemantic::Position, VertexFormat::Float32x3, 0),
            VertexAttribute::new(VertexSemantic::TexCoord, VertexFormat::Float32x4, 0).per_instance(2),
        ],
        stride_bytes: 12,
    };
    assert!(device.create_input_layout(&three_slots).is_err());
}

/// Object counts follow creation and destruction.
#[rstest]
#[case::native(Backend::Native)]
#[case::null(Backend::Null)]
fn test_resource_counts(#[case] backend: Backend) {
    let mut device = create_device(backend);

    let (texture, framebuffer) =
        create_target(device.as_mut(), Extent2D::new(8, 8), TextureFormat::Rgba8Unorm).unwrap();
    let pipeline = create_pipeline(device.as_mut(), "counted").unwrap();
    let fence = device.create_fence(false).unwrap();

    let counts = device.resource_counts();
    assert_eq!(counts.textures, 1);
    assert_eq!(counts.framebuffers, 1);
    assert_eq!(counts.shaders, 2);
    assert_eq!(counts.pipelines, 1);
    assert_eq!(counts.fences, 1);

    device.destroy_fence(fence);
    device.destroy_pipeline(pipeline);
    device.destroy_framebuffer(framebuffer);
    device.destroy_texture(texture);

    let counts = device.resource_counts();
    assert_eq!(counts.textures, 0);
    assert_eq!(counts.framebuffers, 0);
    assert_eq!(counts.pipelines, 0);
    assert_eq!(counts.fences, 0);
}

/// Pipelines asking for more views than the device can render give a null handle.
#[rstest]
#[case::native(Backend::Native)]
#[case::null(Backend::Null)]
fn test_too_many_view_instances_gives_null_pipeline(#[case] backend: Backend) {
    let mut device = create_device(backend);
    let vs = device.create_shader(ShaderStage::Vertex, "VSMain", SHADER_SOURCE).unwrap();
    let ps = device.create_shader(ShaderStage::Pixel, "PSMain", SHADER_SOURCE).unwrap();

    let pipeline = device
        .create_pipeline_ex("views", vs, ps, PrimitiveTopologyType::Triangle, MAX_VIEW_INSTANCES + 1)
        .unwrap();
    assert!(pipeline.is_null());
    assert_eq!(device.resource_counts().pipelines, 0);

    let six_views = device
        .create_pipeline_ex("views", vs, ps, PrimitiveTopologyType::Triangle, 6)
        .unwrap();
    assert!(six_views.is_valid());
}

// ============================================================================
// Bindless descriptors
// ============================================================================

/// Freeing every index and allocating again hands back the same index set.
#[rstest]
#[case::native(Backend::Native)]
#[case::null(Backend::Null)]
fn test_bindless_indices_recycle(#[case] backend: Backend) {
    let mut device = create_device(backend);

    let first: Vec<_> = (0..1000)
        .map(|_| device.allocate_texture_descriptor(TextureHandle::NULL).unwrap())
        .collect();
    assert!(first.iter().all(|index| index.is_valid()));

    for index in &first {
        device.free_texture_descriptor(*index);
    }
    let second: BTreeSet<u32> = (0..1000)
        .map(|_| device.allocate_texture_descriptor(TextureHandle::NULL).unwrap().raw())
        .collect();

    let first: BTreeSet<u32> = first.iter().map(|index| index.raw()).collect();
    assert_eq!(first.len(), 1000);
    assert_eq!(first, second);
}

/// Pointing an index at a missing texture fails; a freed index is unknown.
#[rstest]
#[case::native(Backend::Native)]
#[case::null(Backend::Null)]
fn test_bindless_update_checks(#[case] backend: Backend) {
    let mut device = create_device(backend);
    let texture = device
        .create_texture_2d(Extent2D::new(4, 4), TextureFormat::Rgba8Unorm)
        .unwrap();
    let index = device.allocate_texture_descriptor(texture).unwrap();

    device.update_texture_descriptor(index, TextureHandle::NULL).unwrap();
    assert!(matches!(
        device.update_texture_descriptor(index, TextureHandle::from_raw(999)),
        Err(RhiError::HandleNotFound { kind: "texture", .. })
    ));

    device.free_texture_descriptor(index);
    assert!(matches!(
        device.update_texture_descriptor(index, texture),
        Err(RhiError::HandleNotFound {
            kind: "texture descriptor",
            ..
        })
    ));
}

// ============================================================================
// Fences
// ============================================================================

/// Fences created signaled can be waited on; unsignaled fences cannot.
#[rstest]
#[case::native(Backend::Native)]
#[case::null(Backend::Null)]
fn test_fence_signal_and_wait(#[case] backend: Backend) {
    let mut device = create_device(backend);

    let signaled = device.create_fence(true).unwrap();
    assert!(device.is_fence_signaled(signaled).unwrap());
    device.wait_fence(signaled).unwrap();

    let fence = device.create_fence(false).unwrap();
    assert!(!device.is_fence_signaled(fence).unwrap());
    assert!(matches!(device.wait_fence(fence), Err(RhiError::InvalidParameter(_))));

    let (_, framebuffer) = create_target(device.as_mut(), Extent2D::new(8, 8), TextureFormat::Rgba8Unorm).unwrap();
    device.submit_command_list(clear_list(framebuffer, [1.0, 0.0, 0.0, 1.0])).unwrap();
    device.signal_fence(fence).unwrap();
    device.wait_fence(fence).unwrap();
    assert!(device.is_fence_signaled(fence).unwrap());
}

// ============================================================================
// Command lists
// ============================================================================

/// Per-draw constants are capped at 512 bytes.
#[rstest]
#[case::at_limit(MAX_PER_DRAW_CONSTANTS_BYTES, true)]
#[case::over_limit(MAX_PER_DRAW_CONSTANTS_BYTES + 1, false)]
fn test_constants_cap(#[case] size: usize, #[case] accepted: bool) {
    let mut list = CommandList::new();
    let result = list.set_constants(0, &vec![0u8; size]);
    assert_eq!(result.is_ok(), accepted);
    if !accepted {
        assert_eq!(
            result.unwrap_err(),
            RhiError::ConstantsTooLarge {
                size,
                max: MAX_PER_DRAW_CONSTANTS_BYTES
            }
        );
        assert!(list.is_empty());
    }
}

/// A draw with 512 bytes of constants records and submits.
#[rstest]
#[case::native(Backend::Native)]
#[case::null(Backend::Null)]
fn test_draw_with_full_constants(#[case] backend: Backend) {
    let mut device = create_device(backend);
    let (_, framebuffer) = create_target(device.as_mut(), Extent2D::new(16, 16), TextureFormat::Rgba8Unorm).unwrap();
    let pipeline = create_pipeline(device.as_mut(), "constants").unwrap();

    let mut list = CommandList::new();
    list.begin_pass(PassTarget::Framebuffer(framebuffer), ClearDesc::default());
    list.bind_pipeline(pipeline);
    list.set_constants(0, &[7u8; MAX_PER_DRAW_CONSTANTS_BYTES]).unwrap();
    list.draw(3, 1, 0, 0);
    list.end_pass();

    device.submit_command_list(list).unwrap();
    device.wait_idle().unwrap();
}

// ============================================================================
// Swap chains
// ============================================================================

/// Presenting cycles through the back buffers.
#[rstest]
#[case::native(Backend::Native)]
#[case::null(Backend::Null)]
fn test_swap_chain_present_cycles(#[case] backend: Backend) {
    let mut device = create_device(backend);
    let desc = SwapChainDesc {
        extent: Extent2D::new(64, 32),
        buffer_count: 3,
        ..Default::default()
    };
    let mut swap_chain = device.create_swap_chain(&desc).unwrap();
    assert_eq!(swap_chain.back_buffer_count(), 3);
    assert_eq!(swap_chain.extent(), Extent2D::new(64, 32));

    let first = swap_chain.current_back_buffer();
    for _ in 0..3 {
        let target = swap_chain.target();
        let mut list = CommandList::new();
        list.begin_pass(PassTarget::SwapChain(target), ClearDesc::default());
        list.end_pass();
        device.submit_command_list(list).unwrap();
        swap_chain.present().unwrap();
    }
    assert_eq!(swap_chain.current_back_buffer(), first);
    assert_eq!(swap_chain.present_count(), 3);

    device.destroy_swap_chain(swap_chain);
    assert_eq!(device.resource_counts().textures, 0);
}

// ============================================================================
// Render graph
// ============================================================================

/// A graph leaves the device with exactly the objects it had before.
#[rstest]
#[case::native(Backend::Native)]
#[case::null(Backend::Null)]
fn test_render_graph_frame_leaves_no_resources(#[case] backend: Backend) {
    let mut device = create_device(backend);
    let pipeline = create_pipeline(device.as_mut(), "graph").unwrap();
    let before = device.resource_counts();

    for _ in 0..4 {
        let mut graph = RenderGraph::new();
        let extent = Extent2D::new(32, 32);
        let color = graph.create_texture(RgTextureDesc::color_2d("color", extent, TextureFormat::Rgba8Unorm));
        let depth = graph.create_texture(RgTextureDesc::depth_2d("depth", extent, TextureFormat::Depth32Float));
        graph.add_pass(
            "scene",
            PassAttachments::new(Some(color), Some(depth), ClearDesc::default()),
            |ctx| {
                ctx.command_list.bind_pipeline(pipeline);
                ctx.command_list.draw(3, 1, 0, 0);
                Ok(())
            },
        );
        graph.execute(device.as_mut(), None).unwrap();
        assert!(graph.is_empty());
    }

    assert_eq!(device.resource_counts(), before);
}
