//! Conversions from the explicit-API model to Vulkan types.

use ash::vk;

use crate::backend::native::gpu::{MemoryHeap, ResourceState};
use crate::rhi::{
    CompareOp, CullMode, FrontFace, IndexType, PrimitiveTopology, PrimitiveTopologyType,
    TextureFormat, VertexFormat,
};

pub fn convert_texture_format(format: TextureFormat) -> vk::Format {
    match format {
        TextureFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        TextureFormat::Rgba8UnormSrgb => vk::Format::R8G8B8A8_SRGB,
        TextureFormat::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        TextureFormat::Bgra8UnormSrgb => vk::Format::B8G8R8A8_SRGB,
        TextureFormat::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
        TextureFormat::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
        TextureFormat::R32Float => vk::Format::R32_SFLOAT,
        TextureFormat::Depth32Float => vk::Format::D32_SFLOAT,
        TextureFormat::Depth24PlusStencil8 => vk::Format::D24_UNORM_S8_UINT,
    }
}

/// Aspect of a depth or color image. Views of depth textures only see depth; barriers cover stencil too.
pub fn aspect_mask(format: TextureFormat, attachment: bool) -> vk::ImageAspectFlags {
    match format {
        TextureFormat::Depth24PlusStencil8 if attachment => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        TextureFormat::Depth24PlusStencil8 | TextureFormat::Depth32Float => {
            vk::ImageAspectFlags::DEPTH
        }
        _ => vk::ImageAspectFlags::COLOR,
    }
}

pub fn convert_vertex_format(format: VertexFormat) -> vk::Format {
    match format {
        VertexFormat::Float32 => vk::Format::R32_SFLOAT,
        VertexFormat::Float32x2 => vk::Format::R32G32_SFLOAT,
        VertexFormat::Float32x3 => vk::Format::R32G32B32_SFLOAT,
        VertexFormat::Float32x4 => vk::Format::R32G32B32A32_SFLOAT,
        VertexFormat::Unorm8x4 => vk::Format::R8G8B8A8_UNORM,
        VertexFormat::Uint32 => vk::Format::R32_UINT,
    }
}

pub fn convert_memory_heap(heap: MemoryHeap) -> gpu_allocator::MemoryLocation {
    match heap {
        MemoryHeap::Default => gpu_allocator::MemoryLocation::GpuOnly,
        MemoryHeap::Upload => gpu_allocator::MemoryLocation::CpuToGpu,
        MemoryHeap::Readback => gpu_allocator::MemoryLocation::GpuToCpu,
    }
}

pub fn convert_topology(topology: PrimitiveTopology) -> vk::PrimitiveTopology {
    match topology {
        PrimitiveTopology::PointList => vk::PrimitiveTopology::POINT_LIST,
        PrimitiveTopology::LineList => vk::PrimitiveTopology::LINE_LIST,
        PrimitiveTopology::LineStrip => vk::PrimitiveTopology::LINE_STRIP,
        PrimitiveTopology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
        PrimitiveTopology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
    }
}

/// Static topology of a pipeline; the exact topology is dynamic state within the class.
pub fn convert_topology_type(topology_type: PrimitiveTopologyType) -> vk::PrimitiveTopology {
    match topology_type {
        PrimitiveTopologyType::Point => vk::PrimitiveTopology::POINT_LIST,
        PrimitiveTopologyType::Line => vk::PrimitiveTopology::LINE_LIST,
        PrimitiveTopologyType::Triangle => vk::PrimitiveTopology::TRIANGLE_LIST,
    }
}

pub fn convert_index_type(index_type: IndexType) -> vk::IndexType {
    match index_type {
        IndexType::Uint16 => vk::IndexType::UINT16,
        IndexType::Uint32 => vk::IndexType::UINT32,
    }
}

pub fn convert_compare_op(op: CompareOp) -> vk::CompareOp {
    match op {
        CompareOp::Never => vk::CompareOp::NEVER,
        CompareOp::Less => vk::CompareOp::LESS,
        CompareOp::Equal => vk::CompareOp::EQUAL,
        CompareOp::LessEqual => vk::CompareOp::LESS_OR_EQUAL,
        CompareOp::Greater => vk::CompareOp::GREATER,
        CompareOp::NotEqual => vk::CompareOp::NOT_EQUAL,
        CompareOp::GreaterEqual => vk::CompareOp::GREATER_OR_EQUAL,
        CompareOp::Always => vk::CompareOp::ALWAYS,
    }
}

pub fn convert_cull_mode(mode: CullMode) -> vk::CullModeFlags {
    match mode {
        CullMode::None => vk::CullModeFlags::NONE,
        CullMode::Front => vk::CullModeFlags::FRONT,
        CullMode::Back => vk::CullModeFlags::BACK,
    }
}

/// Viewports are flipped (negative height), which reverses the winding seen by the rasterizer.
pub fn convert_front_face(face: FrontFace) -> vk::FrontFace {
    match face {
        FrontFace::Clockwise => vk::FrontFace::COUNTER_CLOCKWISE,
        FrontFace::CounterClockwise => vk::FrontFace::CLOCKWISE,
    }
}

/// Image layout a texture in `state` is kept in.
///
/// There is no presentation engine on a headless device, so `Present`
/// images rest in the general layout.
pub fn state_layout(state: ResourceState, depth: bool) -> vk::ImageLayout {
    match state {
        ResourceState::Common | ResourceState::GenericRead | ResourceState::Present => {
            vk::ImageLayout::GENERAL
        }
        ResourceState::RenderTarget => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        ResourceState::DepthWrite => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        ResourceState::PixelShaderResource if depth => {
            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
        }
        ResourceState::PixelShaderResource => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ResourceState::CopyDest => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        ResourceState::CopySource => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
    }
}

pub fn state_access(state: ResourceState) -> vk::AccessFlags {
    match state {
        ResourceState::Common | ResourceState::Present => {
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE
        }
        ResourceState::RenderTarget => {
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
        }
        ResourceState::DepthWrite => {
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
        }
        ResourceState::PixelShaderResource => vk::AccessFlags::SHADER_READ,
        ResourceState::CopyDest => vk::AccessFlags::TRANSFER_WRITE,
        ResourceState::CopySource => vk::AccessFlags::TRANSFER_READ,
        ResourceState::GenericRead => {
            vk::AccessFlags::SHADER_READ
                | vk::AccessFlags::UNIFORM_READ
                | vk::AccessFlags::VERTEX_ATTRIBUTE_READ
                | vk::AccessFlags::INDEX_READ
                | vk::AccessFlags::TRANSFER_READ
        }
    }
}

pub fn state_stage(state: ResourceState) -> vk::PipelineStageFlags {
    match state {
        ResourceState::Common | ResourceState::Present => vk::PipelineStageFlags::ALL_COMMANDS,
        ResourceState::RenderTarget => vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ResourceState::DepthWrite => {
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS
        }
        ResourceState::PixelShaderResource => vk::PipelineStageFlags::FRAGMENT_SHADER,
        ResourceState::CopyDest | ResourceState::CopySource => vk::PipelineStageFlags::TRANSFER,
        ResourceState::GenericRead => {
            vk::PipelineStageFlags::VERTEX_INPUT
                | vk::PipelineStageFlags::VERTEX_SHADER
                | vk::PipelineStageFlags::FRAGMENT_SHADER
                | vk::PipelineStageFlags::TRANSFER
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_views_drop_stencil_for_sampling() {
        assert_eq!(
            aspect_mask(TextureFormat::Depth24PlusStencil8, false),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(
            aspect_mask(TextureFormat::Depth24PlusStencil8, true),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(
            aspect_mask(TextureFormat::Rgba8Unorm, true),
            vk::ImageAspectFlags::COLOR
        );
    }

    #[test]
    fn test_state_layouts() {
        assert_eq!(
            state_layout(ResourceState::PixelShaderResource, true),
            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
        );
        assert_eq!(
            state_layout(ResourceState::Present, false),
            vk::ImageLayout::GENERAL
        );
    }
}
