//! Render pass declarations for the render graph

use crate::error::RhiResult;
use crate::render_graph::resource::*;
use crate::rhi::{AttachmentLayout, ClearDesc, CommandList, Extent2D};

/// Unique identifier for a render pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PassId(pub(crate) u32);

/// Offscreen attachments of a pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PassAttachments {
    pub color: Option<ResourceId>,
    /// Which part of `color` is rendered into
    pub color_layout: AttachmentLayout,
    pub depth: Option<ResourceId>,
    pub clear: ClearDesc,
}

impl PassAttachments {
    pub fn new(color: Option<ResourceId>, depth: Option<ResourceId>, clear: ClearDesc) -> Self {
        Self {
            color,
            color_layout: AttachmentLayout::Whole,
            depth,
            clear,
        }
    }

    pub fn color(color: ResourceId, clear: ClearDesc) -> Self {
        Self::new(Some(color), None, clear)
    }

    pub fn depth_only(depth: ResourceId, clear: ClearDesc) -> Self {
        Self::new(None, Some(depth), clear)
    }

    pub fn with_layout(mut self, color_layout: AttachmentLayout) -> Self {
        self.color_layout = color_layout;
        self
    }
}

/// Where a pass renders
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PassTargetDesc {
    /// A framebuffer the graph builds from graph textures
    Offscreen(PassAttachments),
    /// The current back buffer of the swap chain given to `execute`
    SwapChain { clear: ClearDesc },
}

impl PassTargetDesc {
    pub fn clear(&self) -> ClearDesc {
        match self {
            PassTargetDesc::Offscreen(attachments) => attachments.clear,
            PassTargetDesc::SwapChain { clear } => *clear,
        }
    }
}

/// What a pass's recording callback sees
pub struct PassContext<'c> {
    pub pass_name: &'c str,
    /// Size of the pass's attachments
    pub pass_extent: Extent2D,
    /// Commands recorded here land between the pass's begin and end records
    pub command_list: &'c mut CommandList,
    pub resources: PassResources<'c>,
}

/// Recording callback of a pass, run once during execution
pub type PassCallback<'a> = Box<dyn FnOnce(&mut PassContext<'_>) -> RhiResult<()> + 'a>;

/// A pass waiting in the graph
pub struct PassNode<'a> {
    pub id: PassId,
    pub name: String,
    pub target: PassTargetDesc,
    pub(crate) callback: PassCallback<'a>,
}

impl std::fmt::Debug for PassNode<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PassNode")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

impl PassNode<'_> {
    pub fn renders_into(&self, resource: ResourceId) -> bool {
        match &self.target {
            PassTargetDesc::Offscreen(attachments) => {
                attachments.color == Some(resource) || attachments.depth == Some(resource)
            }
            PassTargetDesc::SwapChain { .. } => false,
        }
    }
}
