//! Render graph definition and execution

use crate::error::{RhiError, RhiResult};
use crate::render_graph::pass::*;
use crate::render_graph::resource::*;
use crate::rhi::{
    AttachmentLayout, ClearDesc, CommandList, Extent2D, FramebufferHandle, Handle, PassTarget,
    RhiDevice, SwapChain, TextureHandle,
};

/// A single frame's worth of passes.
///
/// Passes run in declaration order. Textures declared with
/// [`create_texture`](Self::create_texture) live for one
/// [`execute`](Self::execute) call; afterwards the graph is empty and is
/// rebuilt for the next frame.
#[derive(Debug, Default)]
pub struct RenderGraph<'a> {
    passes: Vec<PassNode<'a>>,
    textures: Vec<VirtualTexture>,
    next_pass_id: u32,
}

impl<'a> RenderGraph<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a texture created at execution and destroyed when it ends
    pub fn create_texture(&mut self, desc: RgTextureDesc) -> ResourceId {
        self.push_texture(desc, None)
    }

    /// Declare a texture owned by the caller
    pub fn import_texture(&mut self, texture: TextureHandle, desc: RgTextureDesc) -> ResourceId {
        self.push_texture(desc, Some(texture))
    }

    fn push_texture(&mut self, desc: RgTextureDesc, imported: Option<TextureHandle>) -> ResourceId {
        let id = ResourceId(self.textures.len() as u32);
        self.textures.push(VirtualTexture { id, desc, imported });
        id
    }

    /// Add a pass rendering into graph textures
    pub fn add_pass(
        &mut self,
        name: &str,
        attachments: PassAttachments,
        callback: impl FnOnce(&mut PassContext<'_>) -> RhiResult<()> + 'a,
    ) -> PassId {
        self.push_pass(name, PassTargetDesc::Offscreen(attachments), Box::new(callback))
    }

    /// Add a pass rendering into the swap chain's current back buffer
    pub fn add_swap_chain_pass(
        &mut self,
        name: &str,
        clear: ClearDesc,
        callback: impl FnOnce(&mut PassContext<'_>) -> RhiResult<()> + 'a,
    ) -> PassId {
        self.push_pass(name, PassTargetDesc::SwapChain { clear }, Box::new(callback))
    }

    fn push_pass(&mut self, name: &str, target: PassTargetDesc, callback: PassCallback<'a>) -> PassId {
        let id = PassId(self.next_pass_id);
        self.next_pass_id += 1;
        self.passes.push(PassNode {
            id,
            name: name.to_string(),
            target,
            callback,
        });
        id
    }

    pub fn pass_count(&self) -> usize {
        self.passes.len()
    }

    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty() && self.textures.is_empty()
    }

    pub fn passes(&self) -> &[PassNode<'a>] {
        &self.passes
    }

    pub fn textures(&self) -> &[VirtualTexture] {
        &self.textures
    }

    /// Drop every pass and texture declaration.
    pub fn clear(&mut self) {
        self.passes.clear();
        self.textures.clear();
        self.next_pass_id = 0;
    }

    /// Run every pass and submit the recorded commands as one command list.
    ///
    /// Transient textures and the framebuffers built for passes are
    /// destroyed before returning, also when a step fails. The graph is
    /// empty afterwards either way.
    pub fn execute(&mut self, device: &mut dyn RhiDevice, swap_chain: Option<&dyn SwapChain>) -> RhiResult<()> {
        let passes = std::mem::take(&mut self.passes);
        let textures = std::mem::take(&mut self.textures);
        self.next_pass_id = 0;

        log::debug!(
            "Executing render graph: {} passes, {} textures",
            passes.len(),
            textures.len()
        );

        let mut transient = Transient::default();
        let result = run(device, swap_chain, passes, &textures, &mut transient);
        transient.destroy(device);
        result
    }
}

/// Objects created by one execution
#[derive(Default)]
struct Transient {
    textures: Vec<TextureHandle>,
    framebuffers: Vec<FramebufferHandle>,
}

impl Transient {
    fn destroy(self, device: &mut dyn RhiDevice) {
        for framebuffer in self.framebuffers {
            device.destroy_framebuffer(framebuffer);
        }
        for texture in self.textures {
            device.destroy_texture(texture);
        }
    }
}

fn run(
    device: &mut dyn RhiDevice,
    swap_chain: Option<&dyn SwapChain>,
    passes: Vec<PassNode<'_>>,
    textures: &[VirtualTexture],
    transient: &mut Transient,
) -> RhiResult<()> {
    let handles = materialize(device, textures, transient)?;
    let resources = PassResources {
        textures,
        handles: &handles,
    };

    let mut command_list = CommandList::new();
    for pass in passes {
        let (target, extent) = match pass.target {
            PassTargetDesc::SwapChain { .. } => {
                let swap_chain = swap_chain.ok_or_else(|| {
                    RhiError::InvalidParameter(format!(
                        "pass '{}' renders to the swap chain but none was given",
                        pass.name
                    ))
                })?;
                (PassTarget::SwapChain(swap_chain.target()), swap_chain.extent())
            }
            PassTargetDesc::Offscreen(attachments) => {
                let (framebuffer, extent) = build_framebuffer(device, &pass.name, &attachments, resources)?;
                transient.framebuffers.push(framebuffer);
                (PassTarget::Framebuffer(framebuffer), extent)
            }
        };

        log::trace!("Recording pass '{}' ({}x{})", pass.name, extent.width, extent.height);
        command_list.begin_pass(target, pass.target.clear());
        let mut context = PassContext {
            pass_name: &pass.name,
            pass_extent: extent,
            command_list: &mut command_list,
            resources,
        };
        (pass.callback)(&mut context)?;
        command_list.end_pass();
    }

    device.submit_command_list(command_list)
}

/// Create every non-imported texture, returning the device handle of each graph texture.
fn materialize(
    device: &mut dyn RhiDevice,
    textures: &[VirtualTexture],
    transient: &mut Transient,
) -> RhiResult<Vec<TextureHandle>> {
    let mut handles = Vec::with_capacity(textures.len());
    for texture in textures {
        let handle = match texture.imported {
            Some(handle) => handle,
            None => {
                texture.desc.validate()?;
                let handle = match texture.desc.ty {
                    RgTextureType::Tex2D => device.create_texture_2d(texture.desc.extent, texture.desc.format)?,
                    RgTextureType::Cube => device.create_texture_cube(texture.desc.extent, texture.desc.format)?,
                };
                transient.textures.push(handle);
                handle
            }
        };
        handles.push(handle);
    }
    Ok(handles)
}

fn build_framebuffer(
    device: &mut dyn RhiDevice,
    pass_name: &str,
    attachments: &PassAttachments,
    resources: PassResources<'_>,
) -> RhiResult<(FramebufferHandle, Extent2D)> {
    let lookup = |id: Option<ResourceId>| -> RhiResult<(TextureHandle, Option<Extent2D>)> {
        match id {
            Some(id) => {
                let handle = resources.require(id)?;
                Ok((handle, resources.desc(id).map(|desc| desc.extent)))
            }
            None => Ok((TextureHandle::NULL, None)),
        }
    };
    let (color, color_extent) = lookup(attachments.color)?;
    let (depth, depth_extent) = lookup(attachments.depth)?;
    let extent = color_extent.or(depth_extent).ok_or_else(|| {
        RhiError::InvalidParameter(format!("pass '{}' has no attachments", pass_name))
    })?;

    let framebuffer = match attachments.color_layout {
        AttachmentLayout::Whole => device.create_framebuffer(color, depth)?,
        AttachmentLayout::CubeAllFaces => device.create_framebuffer_cube(color, depth)?,
        AttachmentLayout::CubeFace(face) => device.create_framebuffer_cube_face(color, face, depth)?,
    };
    debug_assert!(framebuffer.is_valid());
    Ok((framebuffer, extent))
}
