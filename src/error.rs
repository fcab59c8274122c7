//! Error types for the rendering hardware interface
//!
//! Errors fall into two classes. Configuration errors are caused by the
//! caller (a stale handle, an oversized payload, an exhausted heap) and are
//! never recovered from by the device. Backend errors report a failure of
//! the underlying GPU API. Conditions the device tolerates, such as a
//! shader model the adapter lacks, are not errors at all: the operation
//! returns the null handle instead.

use thiserror::Error;

/// Descriptor heap identity, used in error reports and diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapKind {
    /// Shader-visible heap holding texture and buffer views
    ShaderResource,
    RenderTarget,
    DepthStencil,
}

impl std::fmt::Display for HeapKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HeapKind::ShaderResource => write!(f, "shader resource"),
            HeapKind::RenderTarget => write!(f, "render target"),
            HeapKind::DepthStencil => write!(f, "depth stencil"),
        }
    }
}

/// Error type shared by every backend
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RhiError {
    #[error("{heap} descriptor heap exhausted ({capacity} slots)")]
    HeapExhausted { heap: HeapKind, capacity: u32 },
    #[error("{ring} ring overflow: {requested} bytes requested at offset {offset} of {capacity}")]
    RingOverflow {
        ring: &'static str,
        requested: u64,
        offset: u64,
        capacity: u64,
    },
    #[error("per-draw constants too large: {size} bytes (max {max})")]
    ConstantsTooLarge { size: usize, max: usize },
    #[error("missing vertex buffer binding for slot {0}")]
    MissingVertexBuffer(u32),
    #[error("{kind} handle {id} not found")]
    HandleNotFound { kind: &'static str, id: u32 },
    #[error("out of bounds: offset {offset} + {len} bytes exceeds size {size}")]
    OutOfBounds { offset: u64, len: u64, size: u64 },
    #[error("invalid command: {0}")]
    InvalidCommand(String),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("Failed to initialize backend: {0}")]
    InitializationFailed(String),
    #[error("Failed to compile shader: {0}")]
    ShaderCompilationFailed(String),
    #[error("GPU error: {0}")]
    Gpu(String),
}

impl RhiError {
    pub(crate) fn not_found(kind: &'static str, id: u32) -> Self {
        RhiError::HandleNotFound { kind, id }
    }

    /// Whether the error was caused by the caller rather than the GPU API.
    pub fn is_configuration_error(&self) -> bool {
        !matches!(
            self,
            RhiError::InitializationFailed(_)
                | RhiError::ShaderCompilationFailed(_)
                | RhiError::Gpu(_)
        )
    }
}

pub type RhiResult<T> = Result<T, RhiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RhiError::HeapExhausted {
            heap: HeapKind::ShaderResource,
            capacity: 16384,
        };
        assert_eq!(
            err.to_string(),
            "shader resource descriptor heap exhausted (16384 slots)"
        );

        let err = RhiError::not_found("texture", 7);
        assert_eq!(err.to_string(), "texture handle 7 not found");
    }

    #[test]
    fn test_error_classification() {
        assert!(RhiError::MissingVertexBuffer(1).is_configuration_error());
        assert!(RhiError::ConstantsTooLarge { size: 513, max: 512 }.is_configuration_error());
        assert!(!RhiError::Gpu("device removed".into()).is_configuration_error());
        assert!(!RhiError::ShaderCompilationFailed("VSMain".into()).is_configuration_error());
    }
}
