//! Render RHI - a backend-agnostic rendering hardware interface with a render graph
//!
//! Rendering code talks to a [`RhiDevice`] through opaque handles and
//! submits frames as [`CommandList`]s. Two backends implement the device:
//! - **Native**: an explicit-API backend (descriptor heaps, per-frame
//!   resource ring, fence-gated deferred freeing, PSO cache, bindless
//!   texture table) driving a [`GpuDevice`](backend::native::GpuDevice)
//! - **Null**: accepts everything and renders nothing, for headless runs
//!
//! # Features
//! - Per-frame render graph creating transient textures and framebuffers
//! - Closed command-stream vocabulary interpreted by each backend
//! - Software explicit GPU with a validation layer, and an optional Vulkan
//!   implementation behind the `vulkan` feature

pub mod backend;
pub mod error;
pub mod render_graph;
pub mod rhi;

pub use backend::create_device;
pub use backend::native::{NativeConfig, NativeDevice};
pub use backend::null::NullDevice;
pub use error::{RhiError, RhiResult};
pub use render_graph::RenderGraph;
pub use rhi::{CommandList, RhiDevice, SwapChain};

/// Backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, clap::ValueEnum)]
pub enum BackendType {
    /// Explicit-API backend
    #[default]
    Native,
    /// No-op backend
    Null,
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendType::Native => write!(f, "native"),
            BackendType::Null => write!(f, "null"),
        }
    }
}

/// Configuration for creating a device
#[derive(Debug, Clone, Default)]
pub struct RhiConfig {
    /// Which backend to use
    pub backend: BackendType,
    /// Limits of the native backend, ignored by the null backend
    pub native: NativeConfig,
}

impl RhiConfig {
    pub fn new(backend: BackendType) -> Self {
        Self {
            backend,
            ..Default::default()
        }
    }

    pub fn with_native(mut self, native: NativeConfig) -> Self {
        self.native = native;
        self
    }
}
