//! Software implementation of the explicit GPU API
//!
//! [`SoftGpu`] keeps resources in host memory and runs its queue on a
//! worker thread: executed command lists and fence signals are processed in
//! order, so fence values complete asynchronously like on real hardware.
//! Clears and copies are performed for real; draws are validated and
//! counted but not rasterized.
//!
//! A [`SoftGpuProbe`] stays usable after the GPU is moved into a device:
//! it pauses and resumes the queue, and exposes validation errors and
//! work counters.

mod state;
mod texel;

use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use crate::backend::native::gpu::*;
use crate::error::{HeapKind, RhiError, RhiResult};
use crate::rhi::{Capabilities, ShaderModel, ShaderStage};

pub use state::SoftGpuStats;
use state::SoftState;

/// Configuration of a software GPU
#[derive(Debug, Clone)]
pub struct SoftGpuDesc {
    pub adapter_name: String,
    pub capabilities: Capabilities,
    /// Fail every multi-view pipeline build, as drivers with broken view
    /// instancing do
    pub reject_multi_view_pipelines: bool,
}

impl Default for SoftGpuDesc {
    fn default() -> Self {
        Self {
            adapter_name: "Software GPU".to_string(),
            capabilities: Capabilities::all(),
            reject_multi_view_pipelines: false,
        }
    }
}

struct Shared {
    state: Mutex<SoftState>,
    /// Wakes the worker on new work and waiters on completed signals
    changed: Condvar,
}

pub struct SoftGpu {
    desc: SoftGpuDesc,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl Default for SoftGpu {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftGpu {
    /// Software GPU supporting every optional feature.
    pub fn new() -> Self {
        Self::with_desc(SoftGpuDesc::default())
    }

    pub fn with_capabilities(capabilities: Capabilities) -> Self {
        Self::with_desc(SoftGpuDesc {
            capabilities,
            ..Default::default()
        })
    }

    pub fn with_desc(desc: SoftGpuDesc) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(SoftState::new(
                desc.capabilities,
                desc.reject_multi_view_pipelines,
            )),
            changed: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::spawn(move || run_queue(worker_shared));

        Self {
            desc,
            shared,
            worker: Some(worker),
        }
    }

    pub fn probe(&self) -> SoftGpuProbe {
        SoftGpuProbe {
            shared: Arc::clone(&self.shared),
        }
    }
}

fn run_queue(shared: Arc<Shared>) {
    let mut state = shared.state.lock();
    loop {
        if !state.paused {
            if let Some(item) = state.queue.pop_front() {
                state.run(item);
                shared.changed.notify_all();
                continue;
            }
        }
        if state.shutdown && state.queue.is_empty() {
            return;
        }
        shared.changed.wait(&mut state);
    }
}

impl Drop for SoftGpu {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            state.paused = false;
        }
        self.shared.changed.notify_all();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Software GPU queue thread panicked");
            }
        }
    }
}

/// Identifier tokens of a shader source.
fn identifiers(source: &str) -> impl Iterator<Item = &str> {
    source
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|token| !token.is_empty())
}

impl GpuDevice for SoftGpu {
    fn adapter_name(&self) -> String {
        self.desc.adapter_name.clone()
    }

    fn capabilities(&self) -> Capabilities {
        self.desc.capabilities
    }

    fn create_buffer(&mut self, desc: &GpuBufferDesc) -> RhiResult<RawResource> {
        self.shared.state.lock().create_buffer(desc)
    }

    fn create_texture(&mut self, desc: &GpuTextureDesc) -> RhiResult<RawResource> {
        self.shared.state.lock().create_texture(desc)
    }

    fn release_resource(&mut self, resource: RawResource) {
        self.shared.state.lock().release_resource(resource)
    }

    fn write_buffer(&mut self, resource: RawResource, offset: u64, data: &[u8]) -> RhiResult<()> {
        self.shared.state.lock().write_buffer(resource, offset, data)
    }

    fn read_buffer(&mut self, resource: RawResource, offset: u64, out: &mut [u8]) -> RhiResult<()> {
        self.shared.state.lock().read_buffer(resource, offset, out)
    }

    fn create_descriptor_heap(&mut self, kind: HeapKind, capacity: u32) -> RhiResult<RawHeap> {
        self.shared.state.lock().create_descriptor_heap(kind, capacity)
    }

    fn write_descriptor(&mut self, heap: RawHeap, index: u32, view: &ViewDesc) -> RhiResult<()> {
        self.shared.state.lock().write_descriptor(heap, index, view)
    }

    fn compile_shader(
        &mut self,
        stage: ShaderStage,
        source: &str,
        entry_point: &str,
        model: ShaderModel,
    ) -> RhiResult<ShaderBlob> {
        if model == ShaderModel::Sm6_1 && !self.desc.capabilities.shader_model_6_1 {
            return Err(RhiError::ShaderCompilationFailed(
                "shader model 6.1 is not supported".to_string(),
            ));
        }
        if source.trim().is_empty() {
            return Err(RhiError::ShaderCompilationFailed("empty source".to_string()));
        }
        if !identifiers(source).any(|token| token == entry_point) {
            return Err(RhiError::ShaderCompilationFailed(format!(
                "entry point '{}' not found",
                entry_point
            )));
        }
        Ok(ShaderBlob {
            stage,
            model,
            entry_point: entry_point.to_string(),
            code: Arc::from(source.as_bytes()),
        })
    }

    fn create_pipeline(&mut self, desc: &GpuPipelineDesc) -> RhiResult<RawPipeline> {
        self.shared.state.lock().create_pipeline(desc)
    }

    fn release_pipeline(&mut self, pipeline: RawPipeline) {
        self.shared.state.lock().release_pipeline(pipeline)
    }

    fn create_command_allocator(&mut self) -> RhiResult<RawAllocator> {
        Ok(self.shared.state.lock().create_command_allocator())
    }

    fn reset_command_allocator(&mut self, allocator: RawAllocator) -> RhiResult<()> {
        self.shared.state.lock().reset_command_allocator(allocator)
    }

    fn execute(&mut self, list: &mut GpuCommandList) -> RhiResult<()> {
        self.shared.state.lock().execute(list)?;
        self.shared.changed.notify_all();
        Ok(())
    }

    fn signal(&mut self, value: u64) -> RhiResult<()> {
        self.shared.state.lock().signal(value)?;
        self.shared.changed.notify_all();
        Ok(())
    }

    fn completed_value(&self) -> u64 {
        self.shared.state.lock().completed
    }

    fn wait_for_value(&self, value: u64) -> RhiResult<()> {
        let mut state = self.shared.state.lock();
        if value > state.last_signal {
            return Err(RhiError::Gpu(format!(
                "waiting for fence value {} that was never signaled (last signal {})",
                value, state.last_signal
            )));
        }
        while state.completed < value {
            self.shared.changed.wait(&mut state);
        }
        Ok(())
    }
}

/// Test and diagnostics handle onto a [`SoftGpu`]'s queue
#[derive(Clone)]
pub struct SoftGpuProbe {
    shared: Arc<Shared>,
}

impl SoftGpuProbe {
    /// Stop processing queued work. Fence values stop completing.
    pub fn pause(&self) {
        self.shared.state.lock().paused = true;
    }

    pub fn resume(&self) {
        self.shared.state.lock().paused = false;
        self.shared.changed.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        self.shared.state.lock().paused
    }

    pub fn completed_value(&self) -> u64 {
        self.shared.state.lock().completed
    }

    /// Command lists and signals not yet processed.
    pub fn queued_items(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    pub fn validation_errors(&self) -> Vec<String> {
        self.shared.state.lock().errors.clone()
    }

    pub fn stats(&self) -> SoftGpuStats {
        self.shared.state.lock().stats
    }

    /// Live resources, including the device's internal rings.
    pub fn resource_count(&self) -> usize {
        self.shared.state.lock().resource_count()
    }

    /// Block until the queue drained everything submitted so far.
    pub fn wait_idle(&self) {
        let mut state = self.shared.state.lock();
        while !state.queue.is_empty() && !state.paused {
            self.shared.changed.wait(&mut state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rhi::{Extent2D, TextureFormat};
    use std::time::Duration;

    fn texture_desc(format: TextureFormat) -> GpuTextureDesc {
        GpuTextureDesc {
            extent: Extent2D::new(4, 4),
            format,
            array_layers: 1,
            cube: false,
            usage: GpuTextureUsage {
                render_target: true,
                shader_resource: true,
                ..Default::default()
            },
            initial_state: ResourceState::RenderTarget,
            debug_name: "target".to_string(),
        }
    }

    #[test]
    fn test_clear_and_readback() {
        let mut gpu = SoftGpu::new();
        let texture = gpu.create_texture(&texture_desc(TextureFormat::Rgba8Unorm)).unwrap();
        let heap = gpu.create_descriptor_heap(HeapKind::RenderTarget, 4).unwrap();
        gpu.write_descriptor(
            heap,
            0,
            &ViewDesc::RenderTarget {
                resource: texture,
                format: TextureFormat::Rgba8Unorm,
                first_layer: 0,
                layer_count: 1,
            },
        )
        .unwrap();
        let readback = gpu
            .create_buffer(&GpuBufferDesc {
                size: 64,
                heap: MemoryHeap::Readback,
                initial_state: ResourceState::CopyDest,
                debug_name: "readback".to_string(),
            })
            .unwrap();

        let allocator = gpu.create_command_allocator().unwrap();
        let mut list = GpuCommandList::new();
        list.reset(allocator);
        list.push(GpuCommand::ClearRenderTarget {
            rtv: DescriptorRef { heap, index: 0 },
            color: [1.0, 0.0, 0.0, 1.0],
        });
        list.barrier(texture, ResourceState::RenderTarget, ResourceState::CopySource);
        list.push(GpuCommand::CopyTextureToBuffer {
            src: texture,
            layer: 0,
            dst: readback,
            dst_offset: 0,
        });
        list.close();
        gpu.execute(&mut list).unwrap();
        gpu.signal(1).unwrap();
        gpu.wait_for_value(1).unwrap();

        let mut pixels = vec![0u8; 64];
        gpu.read_buffer(readback, 0, &mut pixels).unwrap();
        assert_eq!(&pixels[..4], &[255, 0, 0, 255]);
        assert_eq!(&pixels[60..], &[255, 0, 0, 255]);
        assert!(gpu.probe().validation_errors().is_empty());
    }

    #[test]
    fn test_barrier_mismatch_is_reported() {
        let mut gpu = SoftGpu::new();
        let probe = gpu.probe();
        let texture = gpu.create_texture(&texture_desc(TextureFormat::Rgba8Unorm)).unwrap();
        let allocator = gpu.create_command_allocator().unwrap();

        let mut list = GpuCommandList::new();
        list.reset(allocator);
        list.barrier(texture, ResourceState::CopyDest, ResourceState::PixelShaderResource);
        list.close();
        gpu.execute(&mut list).unwrap();
        gpu.signal(1).unwrap();
        gpu.wait_for_value(1).unwrap();

        assert_eq!(probe.validation_errors().len(), 1);
    }

    #[test]
    fn test_release_while_in_flight_is_reported() {
        let mut gpu = SoftGpu::new();
        let probe = gpu.probe();
        probe.pause();

        let texture = gpu.create_texture(&texture_desc(TextureFormat::Rgba8Unorm)).unwrap();
        let allocator = gpu.create_command_allocator().unwrap();
        let mut list = GpuCommandList::new();
        list.reset(allocator);
        list.barrier(texture, ResourceState::RenderTarget, ResourceState::PixelShaderResource);
        list.close();
        gpu.execute(&mut list).unwrap();
        gpu.signal(1).unwrap();

        gpu.release_resource(texture);
        gpu.reset_command_allocator(allocator).unwrap();
        assert_eq!(probe.validation_errors().len(), 2);

        probe.resume();
        gpu.wait_for_value(1).unwrap();
    }

    #[test]
    fn test_paused_queue_holds_fence() {
        let mut gpu = SoftGpu::new();
        let probe = gpu.probe();
        probe.pause();
        gpu.signal(1).unwrap();

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(gpu.completed_value(), 0);
        assert_eq!(probe.queued_items(), 1);

        probe.resume();
        gpu.wait_for_value(1).unwrap();
        assert_eq!(gpu.completed_value(), 1);
    }

    #[test]
    fn test_wait_for_unsignaled_value_fails() {
        let gpu = SoftGpu::new();
        assert!(gpu.wait_for_value(3).is_err());
        assert!(gpu.wait_for_value(0).is_ok());
    }

    #[test]
    fn test_signal_must_increase() {
        let mut gpu = SoftGpu::new();
        gpu.signal(2).unwrap();
        assert!(gpu.signal(2).is_err());
        assert!(gpu.signal(1).is_err());
    }

    #[test]
    fn test_shader_entry_points() {
        let mut gpu = SoftGpu::new();
        let source = "float4 VSMain(float3 p : POSITION) : SV_Position { return p.xyzz; }";
        assert!(gpu
            .compile_shader(ShaderStage::Vertex, source, "VSMain", ShaderModel::Sm5_1)
            .is_ok());
        assert!(gpu
            .compile_shader(ShaderStage::Vertex, source, "VS", ShaderModel::Sm5_1)
            .is_err());
        assert!(gpu
            .compile_shader(ShaderStage::Vertex, "", "VSMain", ShaderModel::Sm5_1)
            .is_err());

        let mut limited = SoftGpu::with_capabilities(Capabilities::default());
        assert!(limited
            .compile_shader(ShaderStage::Vertex, source, "VSMain", ShaderModel::Sm6_1)
            .is_err());
    }
}
