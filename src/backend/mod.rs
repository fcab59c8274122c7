//! Backend implementations of [`RhiDevice`]
//!
//! - [`native`]: explicit-API backend driving a [`GpuDevice`](native::GpuDevice)
//! - [`null`]: accepts every call and renders nothing

pub mod native;
pub mod null;

use crate::error::RhiResult;
use crate::rhi::RhiDevice;
use crate::{BackendType, RhiConfig};

use native::{GpuDevice, GpuKind, NativeDevice, SoftGpu};
use null::NullDevice;

/// Create the device selected by `config.backend`.
///
/// Native initialization failures are returned as errors; there is no
/// silent fallback to the null backend.
pub fn create_device(config: &RhiConfig) -> RhiResult<Box<dyn RhiDevice>> {
    log::info!("Creating {} device", config.backend);
    match config.backend {
        BackendType::Native => {
            let gpu = create_gpu(config.native.gpu)?;
            Ok(Box::new(NativeDevice::new(gpu, config.native.clone())?))
        }
        BackendType::Null => Ok(Box::new(NullDevice::new())),
    }
}

fn create_gpu(kind: GpuKind) -> RhiResult<Box<dyn GpuDevice>> {
    match kind {
        GpuKind::Soft => Ok(Box::new(SoftGpu::new())),
        #[cfg(all(feature = "vulkan", not(target_arch = "wasm32")))]
        GpuKind::Vulkan => Ok(Box::new(native::vulkan::VulkanGpu::new()?)),
        #[cfg(not(all(feature = "vulkan", not(target_arch = "wasm32"))))]
        GpuKind::Vulkan => Err(crate::RhiError::InitializationFailed(
            "built without the `vulkan` feature".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_each_backend() {
        let null = create_device(&RhiConfig::new(BackendType::Null)).unwrap();
        assert_eq!(null.backend(), BackendType::Null);

        let native = create_device(&RhiConfig::new(BackendType::Native)).unwrap();
        assert_eq!(native.backend(), BackendType::Native);
        assert_eq!(native.name(), "Software GPU");
    }

    #[test]
    fn test_native_initialization_failure_is_an_error() {
        let config = RhiConfig::new(BackendType::Native)
            .with_native(native::NativeConfig::default().with_frames_in_flight(0));
        assert!(create_device(&config).is_err());
    }
}
