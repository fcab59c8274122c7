//! Frame resource ring with fence-gated deferred freeing.
//!
//! The CPU records frame N+1 while the GPU still executes frames N, N-1, ...
//! Every per-frame object (command allocator, constants ring, upload ring)
//! therefore exists once per frame slot, and a slot is only reused after
//! the fence value stamped on its last submission has completed.
//!
//! Objects destroyed by the application cannot be freed right away either:
//! the last submission may still reference them. They are appended to the
//! current slot's deferred lists, which are drained the next time the slot
//! is begun, after the wait on its fence.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          FrameRing                           │
//! │  ┌────────────┐   ┌────────────┐   ┌────────────┐            │
//! │  │  Slot 0    │   │  Slot 1    │   │  Slot 2    │  ...       │
//! │  │ allocator  │   │ allocator  │   │ allocator  │            │
//! │  │ rings      │   │ rings      │   │ rings      │            │
//! │  │ fence: 7   │   │ fence: 8   │   │ fence: 6   │            │
//! │  │ deferred   │   │ deferred   │   │ deferred   │            │
//! │  └────────────┘   └────────────┘   └────────────┘            │
//! └──────────────────────────────────────────────────────────────┘
//!
//! begin_frame:
//!   1. slot = submit_index % N, submit_index += 1
//!   2. wait until the queue fence reaches slot.fence_value
//!   3. hand slot.deferred back to the device for freeing
//!   4. reset the slot's allocator and ring cursors
//!
//! end_frame(value):
//!   1. slot.fence_value = value (after the queue signal was issued)
//! ```

use crate::backend::native::gpu::{
    GpuBufferDesc, GpuDevice, MemoryHeap, RawAllocator, RawPipeline, RawResource, ResourceState,
};
use crate::backend::native::upload::UploadRing;
use crate::error::{RhiError, RhiResult};

/// Default number of frames the CPU may run ahead of the GPU.
pub const DEFAULT_FRAMES_IN_FLIGHT: usize = 3;

/// Objects waiting for the GPU to finish with them.
#[derive(Debug, Default)]
pub struct DeferredFrees {
    pub resources: Vec<RawResource>,
    pub pipelines: Vec<RawPipeline>,
    pub srv: Vec<u32>,
    pub rtv: Vec<u32>,
    pub dsv: Vec<u32>,
}

impl DeferredFrees {
    pub fn len(&self) -> usize {
        self.resources.len() + self.pipelines.len() + self.srv.len() + self.rtv.len() + self.dsv.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn append(&mut self, other: DeferredFrees) {
        self.resources.extend(other.resources);
        self.pipelines.extend(other.pipelines);
        self.srv.extend(other.srv);
        self.rtv.extend(other.rtv);
        self.dsv.extend(other.dsv);
    }
}

/// Per-slot objects
#[derive(Debug)]
pub struct FrameResource {
    pub allocator: RawAllocator,
    pub constants: UploadRing,
    pub uploads: UploadRing,
    /// Queue fence value of the last submission that used this slot, 0 if none
    pub fence_value: u64,
    pub deferred: DeferredFrees,
    pub submissions: u64,
}

/// Fixed ring of frame resources
#[derive(Debug)]
pub struct FrameRing {
    frames: Vec<FrameResource>,
    active: usize,
    submit_index: u64,
}

impl FrameRing {
    pub fn new(
        gpu: &mut dyn GpuDevice,
        frames_in_flight: usize,
        constants_ring_bytes: u64,
        upload_ring_bytes: u64,
    ) -> RhiResult<Self> {
        if frames_in_flight == 0 {
            return Err(RhiError::InvalidParameter(
                "frames in flight must be at least 1".to_string(),
            ));
        }

        let mut frames = Vec::with_capacity(frames_in_flight);
        for slot in 0..frames_in_flight {
            let allocator = gpu.create_command_allocator()?;
            let constants = gpu.create_buffer(&GpuBufferDesc {
                size: constants_ring_bytes,
                heap: MemoryHeap::Upload,
                initial_state: ResourceState::GenericRead,
                debug_name: format!("frame{slot}_constants"),
            })?;
            let uploads = gpu.create_buffer(&GpuBufferDesc {
                size: upload_ring_bytes,
                heap: MemoryHeap::Upload,
                initial_state: ResourceState::GenericRead,
                debug_name: format!("frame{slot}_uploads"),
            })?;

            frames.push(FrameResource {
                allocator,
                constants: UploadRing::new(
                    "constants",
                    constants,
                    constants_ring_bytes,
                    UploadRing::CONSTANTS_ALIGNMENT,
                )?,
                uploads: UploadRing::new(
                    "upload",
                    uploads,
                    upload_ring_bytes,
                    UploadRing::UPLOAD_ALIGNMENT,
                )?,
                fence_value: 0,
                deferred: DeferredFrees::default(),
                submissions: 0,
            });
        }

        Ok(Self {
            frames,
            active: 0,
            submit_index: 0,
        })
    }

    /// Move to the next slot, blocking until the GPU finished its previous use.
    ///
    /// Returns the slot's deferred frees; the caller releases them.
    pub fn begin_frame(&mut self, gpu: &mut dyn GpuDevice) -> RhiResult<DeferredFrees> {
        self.active = (self.submit_index % self.frames.len() as u64) as usize;
        self.submit_index += 1;

        let frame = &mut self.frames[self.active];
        if frame.fence_value != 0 && gpu.completed_value() < frame.fence_value {
            log::debug!(
                "frame slot {} waiting for fence {} (completed {})",
                self.active,
                frame.fence_value,
                gpu.completed_value()
            );
            gpu.wait_for_value(frame.fence_value)?;
        }

        let deferred = std::mem::take(&mut frame.deferred);
        gpu.reset_command_allocator(frame.allocator)?;
        frame.constants.reset();
        frame.uploads.reset();
        frame.submissions += 1;

        Ok(deferred)
    }

    /// Stamp the active slot with the fence value its submission signals.
    pub fn end_frame(&mut self, fence_value: u64) {
        self.frames[self.active].fence_value = fence_value;
    }

    pub fn current(&self) -> &FrameResource {
        &self.frames[self.active]
    }

    pub fn current_mut(&mut self) -> &mut FrameResource {
        &mut self.frames[self.active]
    }

    /// Deferred lists of the slot used by the most recent submission.
    pub fn deferred(&mut self) -> &mut DeferredFrees {
        &mut self.frames[self.active].deferred
    }

    pub fn active_slot(&self) -> usize {
        self.active
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn submit_index(&self) -> u64 {
        self.submit_index
    }

    pub fn slot_fence(&self, slot: usize) -> Option<u64> {
        self.frames.get(slot).map(|f| f.fence_value)
    }

    /// Number of slots that carried at least one submission.
    pub fn slots_touched(&self) -> usize {
        self.frames.iter().filter(|f| f.submissions > 0).count()
    }

    /// Highest fence value stamped on any slot.
    pub fn last_fence_value(&self) -> u64 {
        self.frames.iter().map(|f| f.fence_value).max().unwrap_or(0)
    }

    /// Take every slot's deferred lists. Only valid once the GPU is idle.
    pub fn drain_all(&mut self) -> DeferredFrees {
        let mut all = DeferredFrees::default();
        for frame in &mut self.frames {
            all.append(std::mem::take(&mut frame.deferred));
        }
        all
    }

    /// Ring buffers owned by the slots, for release at shutdown.
    pub fn ring_resources(&self) -> Vec<RawResource> {
        self.frames
            .iter()
            .flat_map(|f| [f.constants.resource(), f.uploads.resource()])
            .collect()
    }
}
