//! Per-frame linear upload rings.
//!
//! Each frame resource owns two CPU-writable buffers: one for per-draw
//! constants and one staging area for buffer updates. Allocation is a
//! cursor bump; the cursor is rewound when the frame slot is reused, which
//! only happens after the slot's fence completed. Running past the end is an
//! error rather than a wrap, since wrapping could overwrite data the same
//! frame still references.
//!
//! # Example
//!
//! ```ignore
//! let alloc = ring.allocate(constants.len() as u64)?;
//! gpu.write_buffer(ring.resource(), alloc.offset, constants)?;
//! list.push(GpuCommand::SetRootConstantBuffer {
//!     parameter: ROOT_PARAM_CONSTANTS,
//!     resource: ring.resource(),
//!     offset: alloc.offset,
//! });
//! ```

use crate::backend::native::gpu::RawResource;
use crate::error::{RhiError, RhiResult};

/// A sub-allocation from an upload ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RingAllocation {
    /// Byte offset into the ring buffer.
    pub offset: u64,
    /// Size of the allocation in bytes, after alignment.
    pub size: u64,
}

impl RingAllocation {
    /// Get the end offset (offset + size).
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Cursor-based allocator over one upload-heap buffer.
#[derive(Debug)]
pub struct UploadRing {
    name: &'static str,
    resource: RawResource,
    capacity: u64,
    alignment: u64,
    cursor: u64,
}

impl UploadRing {
    /// Alignment of per-draw constant allocations.
    pub const CONSTANTS_ALIGNMENT: u64 = 256;

    /// Alignment of staged buffer updates.
    pub const UPLOAD_ALIGNMENT: u64 = 16;

    /// Wrap `resource` of `capacity` bytes. `alignment` must be a power of two.
    pub fn new(
        name: &'static str,
        resource: RawResource,
        capacity: u64,
        alignment: u64,
    ) -> RhiResult<Self> {
        if !alignment.is_power_of_two() {
            return Err(RhiError::InvalidParameter(format!(
                "alignment must be a power of 2, got {alignment}"
            )));
        }
        if capacity == 0 {
            return Err(RhiError::InvalidParameter(format!(
                "{name} ring capacity cannot be zero"
            )));
        }

        Ok(Self {
            name,
            resource,
            capacity,
            alignment,
            cursor: 0,
        })
    }

    /// Reserve `size` bytes (rounded up to the ring alignment).
    pub fn allocate(&mut self, size: u64) -> RhiResult<RingAllocation> {
        let size = align_up(size, self.alignment);
        let offset = align_up(self.cursor, self.alignment);

        if offset + size > self.capacity {
            return Err(RhiError::RingOverflow {
                ring: self.name,
                requested: size,
                offset,
                capacity: self.capacity,
            });
        }

        self.cursor = offset + size;
        Ok(RingAllocation { offset, size })
    }

    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    pub fn resource(&self) -> RawResource {
        self.resource
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn used(&self) -> u64 {
        self.cursor
    }

    pub fn remaining(&self) -> u64 {
        self.capacity.saturating_sub(self.cursor)
    }
}

/// Align a value up to the given alignment.
///
/// # Panics
///
/// Debug builds panic if alignment is not a power of 2.
#[inline]
pub fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(capacity: u64, alignment: u64) -> UploadRing {
        UploadRing::new("test", RawResource(1), capacity, alignment).unwrap()
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 16), 272);
    }

    #[test]
    fn test_allocations_are_aligned() {
        let mut ring = ring(4096, UploadRing::CONSTANTS_ALIGNMENT);
        let a = ring.allocate(1).unwrap();
        let b = ring.allocate(64).unwrap();
        assert_eq!(a, RingAllocation { offset: 0, size: 256 });
        assert_eq!(b.offset, 256);
        assert_eq!(ring.used(), 512);
    }

    #[test]
    fn test_overflow_is_an_error() {
        let mut ring = ring(512, UploadRing::CONSTANTS_ALIGNMENT);
        ring.allocate(256).unwrap();
        ring.allocate(256).unwrap();

        let err = ring.allocate(1).unwrap_err();
        assert!(matches!(err, RhiError::RingOverflow { ring: "test", offset: 512, .. }));

        ring.reset();
        assert_eq!(ring.allocate(512).unwrap().offset, 0);
    }

    #[test]
    fn test_invalid_construction() {
        assert!(UploadRing::new("test", RawResource(1), 1024, 3).is_err());
        assert!(UploadRing::new("test", RawResource(1), 0, 16).is_err());
    }
}
