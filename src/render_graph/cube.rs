//! Rendering into all six faces of a cube texture
//!
//! Three strategies exist, from fewest passes to most:
//! - [`CubeRenderPath::Layered`]: one pass over a layered target; the vertex
//!   shader picks the face through the render-target array index
//! - [`CubeRenderPath::ViewInstanced`]: one pass with a six-view pipeline
//! - [`CubeRenderPath::PerFace`]: six passes, one per face, with a 2D depth buffer
//!
//! [`CubePathSelector`] picks the cheapest path the device supports and
//! stops offering a path for the rest of the run once it fails.

use std::rc::Rc;

use crate::error::RhiResult;
use crate::render_graph::graph::RenderGraph;
use crate::render_graph::pass::{PassAttachments, PassContext, PassId};
use crate::render_graph::resource::{ResourceId, RgTextureDesc};
use crate::rhi::{AttachmentLayout, Capabilities, ClearDesc, Extent2D, Handle, PipelineHandle, TextureFormat};

pub const CUBE_FACE_COUNT: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CubeRenderPath {
    Layered,
    ViewInstanced,
    PerFace,
}

impl CubeRenderPath {
    /// Whether all faces are rendered by a single pass.
    pub fn is_single_pass(&self) -> bool {
        !matches!(self, CubeRenderPath::PerFace)
    }

    /// Capability the path needs, checked against the device.
    pub fn is_supported(&self, capabilities: &Capabilities) -> bool {
        match self {
            CubeRenderPath::Layered => capabilities.layered_rendering && capabilities.shader_model_6_1,
            CubeRenderPath::ViewInstanced => capabilities.view_instancing && capabilities.shader_model_6_1,
            CubeRenderPath::PerFace => true,
        }
    }
}

/// Faces a cube pass callback records for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CubeFaces {
    /// Every face in one pass
    All,
    Single(u32),
}

/// Chooses a cube path, latching off paths that failed
#[derive(Debug, Clone, Default)]
pub struct CubePathSelector {
    layered_disabled: bool,
    view_instanced_disabled: bool,
}

impl CubePathSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self, path: CubeRenderPath) -> bool {
        match path {
            CubeRenderPath::Layered => !self.layered_disabled,
            CubeRenderPath::ViewInstanced => !self.view_instanced_disabled,
            CubeRenderPath::PerFace => true,
        }
    }

    /// Stop offering `path`. The per-face path cannot be disabled.
    pub fn disable(&mut self, path: CubeRenderPath) {
        match path {
            CubeRenderPath::Layered if !self.layered_disabled => {
                log::warn!("Layered cube rendering disabled, falling back");
                self.layered_disabled = true;
            }
            CubeRenderPath::ViewInstanced if !self.view_instanced_disabled => {
                log::warn!("View-instanced cube rendering disabled, falling back");
                self.view_instanced_disabled = true;
            }
            _ => {}
        }
    }

    /// Cheapest enabled path. Paths whose capability is missing are disabled on the way.
    pub fn select(&mut self, capabilities: &Capabilities) -> CubeRenderPath {
        for path in [CubeRenderPath::Layered, CubeRenderPath::ViewInstanced] {
            if !self.is_enabled(path) {
                continue;
            }
            if path.is_supported(capabilities) {
                return path;
            }
            self.disable(path);
        }
        CubeRenderPath::PerFace
    }

    /// Select a path together with its pipeline.
    ///
    /// `pipeline_for` returns the pipeline a path renders with; a null
    /// handle means the pipeline could not be built, which disables the
    /// path. Returns `None` only when the per-face pipeline is null too.
    pub fn select_with_pipeline(
        &mut self,
        capabilities: &Capabilities,
        mut pipeline_for: impl FnMut(CubeRenderPath) -> PipelineHandle,
    ) -> Option<(CubeRenderPath, PipelineHandle)> {
        loop {
            let path = self.select(capabilities);
            let pipeline = pipeline_for(path);
            if pipeline.is_valid() {
                return Some((path, pipeline));
            }
            if path == CubeRenderPath::PerFace {
                return None;
            }
            self.disable(path);
        }
    }
}

/// Depth buffer matching a cube path: a cube for single-pass paths, 2D for per-face passes.
pub fn cube_depth_desc(path: CubeRenderPath, name: &str, extent: Extent2D, format: TextureFormat) -> RgTextureDesc {
    if path.is_single_pass() {
        RgTextureDesc::depth_cube(name, extent, format)
    } else {
        RgTextureDesc::depth_2d(name, extent, format)
    }
}

/// Add the passes rendering `color_cube` with `path`.
///
/// `record` is called once with [`CubeFaces::All`] for single-pass paths,
/// or once per face with [`CubeFaces::Single`].
pub fn add_cube_passes<'a>(
    graph: &mut RenderGraph<'a>,
    name: &str,
    path: CubeRenderPath,
    color_cube: ResourceId,
    depth: Option<ResourceId>,
    clear: ClearDesc,
    record: impl Fn(&mut PassContext<'_>, CubeFaces) -> RhiResult<()> + 'a,
) -> Vec<PassId> {
    if path.is_single_pass() {
        let attachments =
            PassAttachments::new(Some(color_cube), depth, clear).with_layout(AttachmentLayout::CubeAllFaces);
        let id = graph.add_pass(name, attachments, move |ctx| record(ctx, CubeFaces::All));
        return vec![id];
    }

    let record = Rc::new(record);
    (0..CUBE_FACE_COUNT)
        .map(|face| {
            let record = Rc::clone(&record);
            let attachments =
                PassAttachments::new(Some(color_cube), depth, clear).with_layout(AttachmentLayout::CubeFace(face));
            graph.add_pass(&format!("{}_face{}", name, face), attachments, move |ctx| {
                record(ctx, CubeFaces::Single(face))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn caps(layered: bool, view_instancing: bool) -> Capabilities {
        Capabilities {
            shader_model_6_1: layered || view_instancing,
            view_instancing,
            layered_rendering: layered,
        }
    }

    #[rstest]
    #[case::everything(caps(true, true), CubeRenderPath::Layered)]
    #[case::view_instancing_only(caps(false, true), CubeRenderPath::ViewInstanced)]
    #[case::nothing(caps(false, false), CubeRenderPath::PerFace)]
    fn test_select_prefers_fewer_passes(#[case] capabilities: Capabilities, #[case] expected: CubeRenderPath) {
        assert_eq!(CubePathSelector::new().select(&capabilities), expected);
    }

    #[test]
    fn test_missing_capability_latches_path_off() {
        let mut selector = CubePathSelector::new();
        assert_eq!(selector.select(&caps(false, true)), CubeRenderPath::ViewInstanced);
        assert!(!selector.is_enabled(CubeRenderPath::Layered));

        // the latch holds even if the capability shows up later
        assert_eq!(selector.select(&caps(true, true)), CubeRenderPath::ViewInstanced);
    }

    #[test]
    fn test_null_pipeline_falls_back() {
        let mut selector = CubePathSelector::new();
        let selected = selector.select_with_pipeline(&Capabilities::all(), |path| match path {
            CubeRenderPath::PerFace => PipelineHandle::from_raw(7),
            _ => PipelineHandle::NULL,
        });
        assert_eq!(selected, Some((CubeRenderPath::PerFace, PipelineHandle::from_raw(7))));
        assert!(!selector.is_enabled(CubeRenderPath::Layered));
        assert!(!selector.is_enabled(CubeRenderPath::ViewInstanced));

        assert_eq!(
            selector.select_with_pipeline(&Capabilities::all(), |_| PipelineHandle::NULL),
            None
        );
    }

    #[rstest]
    #[case::layered(CubeRenderPath::Layered, 1)]
    #[case::view_instanced(CubeRenderPath::ViewInstanced, 1)]
    #[case::per_face(CubeRenderPath::PerFace, 6)]
    fn test_add_cube_passes(#[case] path: CubeRenderPath, #[case] passes: usize) {
        let mut graph = RenderGraph::new();
        let extent = Extent2D::new(32, 32);
        let color = graph.create_texture(RgTextureDesc::color_cube("cube", extent, TextureFormat::R32Float));
        let depth = graph.create_texture(cube_depth_desc(path, "cube_depth", extent, TextureFormat::Depth32Float));

        let ids = add_cube_passes(&mut graph, "shadow", path, color, Some(depth), ClearDesc::default(), |_, _| Ok(()));

        assert_eq!(ids.len(), passes);
        assert_eq!(graph.pass_count(), passes);
        assert!(graph.passes().iter().all(|pass| pass.renders_into(color)));
        assert_eq!(graph.textures()[1].desc.ty == crate::render_graph::RgTextureType::Cube, path.is_single_pass());
    }
}
