//! Presentable back-buffer ring

use crate::error::RhiResult;
use crate::rhi::command::SwapChainTarget;
use crate::rhi::handle::{Handle, TextureHandle};
use crate::rhi::types::{Extent2D, TextureFormat};

/// Swap chain creation parameters
#[derive(Debug, Clone)]
pub struct SwapChainDesc {
    pub extent: Extent2D,
    pub format: TextureFormat,
    /// `None` creates a swap chain without a depth buffer
    pub depth_format: Option<TextureFormat>,
    pub buffer_count: u32,
    pub vsync: bool,
}

impl Default for SwapChainDesc {
    fn default() -> Self {
        Self {
            extent: Extent2D::new(1280, 720),
            format: TextureFormat::Rgba8Unorm,
            depth_format: Some(TextureFormat::Depth32Float),
            buffer_count: 2,
            vsync: true,
        }
    }
}

/// A ring of presentable back buffers owned by a device.
///
/// Back buffers are ordinary device textures; passes reference the current
/// one through [`SwapChain::target`].
pub trait SwapChain {
    fn extent(&self) -> Extent2D;
    fn format(&self) -> TextureFormat;
    fn depth_format(&self) -> Option<TextureFormat>;
    fn back_buffer_count(&self) -> u32;
    fn current_back_buffer(&self) -> TextureHandle;
    fn depth_buffer(&self) -> TextureHandle;

    fn target(&self) -> SwapChainTarget {
        SwapChainTarget {
            color: self.current_back_buffer(),
            depth: self.depth_buffer(),
            extent: self.extent(),
        }
    }

    /// Flip to the next back buffer.
    fn present(&mut self) -> RhiResult<()>;

    fn present_count(&self) -> u64;
    fn vsync(&self) -> bool;
    fn set_vsync(&mut self, vsync: bool);

    /// Every texture the swap chain owns.
    fn textures(&self) -> Vec<TextureHandle>;
}

/// Swap chain without a window surface.
///
/// Back buffers are ordinary device textures created by the backend;
/// presenting flips to the next one in the ring.
#[derive(Debug, Clone)]
pub struct HeadlessSwapChain {
    extent: Extent2D,
    format: TextureFormat,
    depth_format: Option<TextureFormat>,
    back_buffers: Vec<TextureHandle>,
    depth: TextureHandle,
    index: usize,
    presents: u64,
    vsync: bool,
}

impl HeadlessSwapChain {
    pub(crate) fn new(desc: &SwapChainDesc, back_buffers: Vec<TextureHandle>, depth: TextureHandle) -> Self {
        Self {
            extent: desc.extent,
            format: desc.format,
            depth_format: desc.depth_format,
            back_buffers,
            depth,
            index: 0,
            presents: 0,
            vsync: desc.vsync,
        }
    }
}

impl SwapChain for HeadlessSwapChain {
    fn extent(&self) -> Extent2D {
        self.extent
    }

    fn format(&self) -> TextureFormat {
        self.format
    }

    fn depth_format(&self) -> Option<TextureFormat> {
        self.depth_format
    }

    fn back_buffer_count(&self) -> u32 {
        self.back_buffers.len() as u32
    }

    fn current_back_buffer(&self) -> TextureHandle {
        self.back_buffers
            .get(self.index)
            .copied()
            .unwrap_or(TextureHandle::NULL)
    }

    fn depth_buffer(&self) -> TextureHandle {
        self.depth
    }

    fn present(&mut self) -> RhiResult<()> {
        if !self.back_buffers.is_empty() {
            self.index = (self.index + 1) % self.back_buffers.len();
        }
        self.presents += 1;
        log::trace!("present #{} (vsync: {})", self.presents, self.vsync);
        Ok(())
    }

    fn present_count(&self) -> u64 {
        self.presents
    }

    fn vsync(&self) -> bool {
        self.vsync
    }

    fn set_vsync(&mut self, vsync: bool) {
        self.vsync = vsync;
    }

    fn textures(&self) -> Vec<TextureHandle> {
        let mut textures = self.back_buffers.clone();
        if !self.depth.is_null() {
            textures.push(self.depth);
        }
        textures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_back_buffer_rotation() {
        let desc = SwapChainDesc {
            extent: Extent2D::new(4, 4),
            depth_format: None,
            ..Default::default()
        };
        let mut swap_chain = HeadlessSwapChain::new(
            &desc,
            vec![TextureHandle::from_raw(1), TextureHandle::from_raw(2)],
            TextureHandle::NULL,
        );

        assert_eq!(swap_chain.current_back_buffer().raw(), 1);
        swap_chain.present().unwrap();
        assert_eq!(swap_chain.current_back_buffer().raw(), 2);
        swap_chain.present().unwrap();
        assert_eq!(swap_chain.current_back_buffer().raw(), 1);
        assert_eq!(swap_chain.present_count(), 2);
        assert_eq!(swap_chain.textures().len(), 2);
        assert_eq!(swap_chain.target().color.raw(), 1);
    }
}
