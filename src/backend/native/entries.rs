//! Backend-private objects behind each handle kind

use crate::backend::native::gpu::{RawResource, ResourceState, ShaderBlob};
use crate::rhi::{
    AttachmentLayout, BufferDesc, BufferHandle, Extent2D, InputLayoutDesc, PrimitiveTopologyType,
    ShaderHandle, ShaderStage, TextureFormat, TextureHandle,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureKind {
    Texture2D,
    Cube,
}

impl TextureKind {
    pub fn layers(&self) -> u32 {
        match self {
            TextureKind::Texture2D => 1,
            TextureKind::Cube => 6,
        }
    }
}

/// What a texture was created for; decides which views it gets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureRole {
    RenderTarget,
    DepthStencil,
    Sampled,
    BackBuffer,
}

/// Descriptor slots owned by a texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TextureViews {
    pub srv: Option<u32>,
    /// Cube viewed as a six-layer 2D array, created on first use
    pub srv_array: Option<u32>,
    pub rtv: Option<u32>,
    pub rtv_faces: Option<[u32; 6]>,
    pub rtv_all_faces: Option<u32>,
    pub dsv: Option<u32>,
    pub dsv_all_faces: Option<u32>,
}

impl TextureViews {
    pub fn srv_slots(&self) -> Vec<u32> {
        self.srv.into_iter().chain(self.srv_array).collect()
    }

    pub fn rtv_slots(&self) -> Vec<u32> {
        self.rtv
            .into_iter()
            .chain(self.rtv_all_faces)
            .chain(self.rtv_faces.into_iter().flatten())
            .collect()
    }

    pub fn dsv_slots(&self) -> Vec<u32> {
        self.dsv.into_iter().chain(self.dsv_all_faces).collect()
    }
}

#[derive(Debug)]
pub struct TextureEntry {
    pub resource: RawResource,
    pub extent: Extent2D,
    pub format: TextureFormat,
    pub kind: TextureKind,
    pub role: TextureRole,
    /// State after every command recorded so far
    pub state: ResourceState,
    pub views: TextureViews,
    pub debug_name: String,
}

#[derive(Debug)]
pub struct BufferEntry {
    pub resource: RawResource,
    pub desc: BufferDesc,
    pub state: ResourceState,
    pub srv: Option<u32>,
}

#[derive(Debug)]
pub struct ShaderEntry {
    pub stage: ShaderStage,
    pub name: String,
    pub blob: ShaderBlob,
}

#[derive(Debug)]
pub struct PipelineEntry {
    pub name: String,
    pub vertex_shader: ShaderHandle,
    pub pixel_shader: ShaderHandle,
    pub topology_type: PrimitiveTopologyType,
    pub view_instance_count: u32,
}

#[derive(Debug)]
pub struct InputLayoutEntry {
    pub desc: InputLayoutDesc,
}

#[derive(Debug, Clone, Copy)]
pub struct FramebufferEntry {
    pub color: TextureHandle,
    pub color_layout: AttachmentLayout,
    pub depth: TextureHandle,
}

#[derive(Debug, Clone, Copy)]
pub struct FenceEntry {
    /// Queue fence value that completes the fence, `None` until signaled
    pub target: Option<u64>,
}

/// Buffer write queued for the next submission
#[derive(Debug)]
pub struct PendingBufferUpdate {
    pub buffer: BufferHandle,
    pub offset: u64,
    pub data: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_view_slot_listing() {
        let views = TextureViews {
            srv: Some(3),
            srv_array: Some(9),
            rtv_faces: Some([0, 1, 2, 3, 4, 5]),
            rtv_all_faces: Some(6),
            ..Default::default()
        };
        assert_eq!(views.srv_slots(), vec![3, 9]);
        assert_eq!(views.rtv_slots(), vec![6, 0, 1, 2, 3, 4, 5]);
        assert!(views.dsv_slots().is_empty());
    }
}
