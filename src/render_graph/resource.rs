//! Textures declared on the render graph

use crate::error::{RhiError, RhiResult};
use crate::rhi::{Extent2D, TextureFormat, TextureHandle};

/// Identifier of a texture declared on a [`RenderGraph`](super::RenderGraph)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId(pub(crate) u32);

/// Shape of a graph texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RgTextureType {
    #[default]
    Tex2D,
    Cube,
}

/// What a graph texture is rendered as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RgTextureUsage {
    #[default]
    ColorTarget,
    DepthTarget,
}

/// Describes a texture the graph creates for one execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgTextureDesc {
    pub extent: Extent2D,
    pub format: TextureFormat,
    pub usage: RgTextureUsage,
    pub ty: RgTextureType,
    pub debug_name: String,
}

impl RgTextureDesc {
    pub fn color_2d(name: &str, extent: Extent2D, format: TextureFormat) -> Self {
        Self {
            extent,
            format,
            usage: RgTextureUsage::ColorTarget,
            ty: RgTextureType::Tex2D,
            debug_name: name.to_string(),
        }
    }

    pub fn depth_2d(name: &str, extent: Extent2D, format: TextureFormat) -> Self {
        Self {
            extent,
            format,
            usage: RgTextureUsage::DepthTarget,
            ty: RgTextureType::Tex2D,
            debug_name: name.to_string(),
        }
    }

    pub fn color_cube(name: &str, extent: Extent2D, format: TextureFormat) -> Self {
        Self {
            ty: RgTextureType::Cube,
            ..Self::color_2d(name, extent, format)
        }
    }

    pub fn depth_cube(name: &str, extent: Extent2D, format: TextureFormat) -> Self {
        Self {
            ty: RgTextureType::Cube,
            ..Self::depth_2d(name, extent, format)
        }
    }

    /// Check that the format agrees with the usage and the extent is not empty.
    pub fn validate(&self) -> RhiResult<()> {
        if self.extent.is_empty() {
            return Err(RhiError::InvalidParameter(format!(
                "graph texture '{}' has an empty extent",
                self.debug_name
            )));
        }
        let depth_usage = self.usage == RgTextureUsage::DepthTarget;
        if depth_usage != self.format.is_depth() {
            return Err(RhiError::InvalidParameter(format!(
                "graph texture '{}' uses {:?} as a {:?}",
                self.debug_name, self.format, self.usage
            )));
        }
        Ok(())
    }
}

/// A texture declared on the graph, created at execution unless imported
#[derive(Debug, Clone)]
pub struct VirtualTexture {
    pub id: ResourceId,
    pub desc: RgTextureDesc,
    /// Device texture owned by the caller; the graph never destroys it
    pub imported: Option<TextureHandle>,
}

/// Lookup from graph textures to the device textures of the current execution
#[derive(Debug, Clone, Copy)]
pub struct PassResources<'r> {
    pub(crate) textures: &'r [VirtualTexture],
    pub(crate) handles: &'r [TextureHandle],
}

impl<'r> PassResources<'r> {
    /// Device texture backing `id`, if `id` belongs to the executing graph.
    pub fn texture(&self, id: ResourceId) -> Option<TextureHandle> {
        self.handles.get(id.0 as usize).copied()
    }

    pub fn require(&self, id: ResourceId) -> RhiResult<TextureHandle> {
        self.texture(id).ok_or_else(|| {
            RhiError::InvalidParameter(format!("{:?} is not a texture of this graph", id))
        })
    }

    pub fn desc(&self, id: ResourceId) -> Option<&'r RgTextureDesc> {
        self.textures.get(id.0 as usize).map(|t| &t.desc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::color(RgTextureDesc::color_2d("c", Extent2D::new(4, 4), TextureFormat::Rgba8Unorm), true)]
    #[case::depth(RgTextureDesc::depth_cube("d", Extent2D::new(4, 4), TextureFormat::Depth32Float), true)]
    #[case::depth_format_as_color(RgTextureDesc::color_2d("c", Extent2D::new(4, 4), TextureFormat::Depth32Float), false)]
    #[case::empty(RgTextureDesc::color_2d("c", Extent2D::new(0, 4), TextureFormat::Rgba8Unorm), false)]
    fn test_validate(#[case] desc: RgTextureDesc, #[case] valid: bool) {
        assert_eq!(desc.validate().is_ok(), valid);
    }
}
