//! Descriptor slot allocation
//!
//! Each descriptor heap is a fixed array of slots. A [`DescriptorPool`]
//! hands out slot indices from a free list, falling back to a bump counter
//! when the free list is empty. Slots are returned to the free list only
//! through the frame ring's deferred lists, once the GPU can no longer be
//! reading them.

use crate::error::{HeapKind, RhiError, RhiResult};

/// Shader-visible slot holding the null 2D texture view.
pub const NULL_TEXTURE_SRV: u32 = 0;

/// Shader-visible slot holding the null structured-buffer view.
pub const NULL_BUFFER_SRV: u32 = 1;

/// Shader-visible slot reserved for the overlay renderer's font texture.
pub const OVERLAY_FONT_SRV: u32 = 2;

/// First shader-visible slot handed out by the pool.
pub const FIRST_DYNAMIC_SRV: u32 = 3;

#[derive(Debug)]
pub struct DescriptorPool {
    kind: HeapKind,
    capacity: u32,
    next: u32,
    free: Vec<u32>,
}

impl DescriptorPool {
    pub fn new(kind: HeapKind, capacity: u32, first_index: u32) -> Self {
        Self {
            kind,
            capacity,
            next: first_index,
            free: Vec::new(),
        }
    }

    pub fn kind(&self) -> HeapKind {
        self.kind
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn allocate(&mut self) -> RhiResult<u32> {
        if let Some(index) = self.free.pop() {
            return Ok(index);
        }
        if self.next >= self.capacity {
            return Err(RhiError::HeapExhausted {
                heap: self.kind,
                capacity: self.capacity,
            });
        }
        let index = self.next;
        self.next += 1;
        Ok(index)
    }

    /// Return a slot. Only call once the GPU has finished with it.
    pub fn free(&mut self, index: u32) {
        debug_assert!(index < self.next, "freeing a slot that was never allocated");
        self.free.push(index);
    }

    /// Slots currently handed out (reserved slots excluded).
    pub fn in_use(&self, first_index: u32) -> u32 {
        self.next - first_index - self.free.len() as u32
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn high_water_mark(&self) -> u32 {
        self.next
    }
}

/// Slot usage of the three heaps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DescriptorUsage {
    pub shader_resource: u32,
    pub render_target: u32,
    pub depth_stencil: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_slots_are_skipped() {
        let mut pool = DescriptorPool::new(HeapKind::ShaderResource, 16, FIRST_DYNAMIC_SRV);
        assert_eq!(pool.allocate().unwrap(), 3);
        assert_eq!(pool.allocate().unwrap(), 4);
        assert_eq!(pool.in_use(FIRST_DYNAMIC_SRV), 2);
    }

    #[test]
    fn test_free_list_is_reused_first() {
        let mut pool = DescriptorPool::new(HeapKind::RenderTarget, 8, 0);
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        pool.free(a);
        assert_eq!(pool.allocate().unwrap(), a);
        assert_eq!(pool.allocate().unwrap(), 2);
        assert_ne!(a, b);
    }

    #[test]
    fn test_exhaustion() {
        let mut pool = DescriptorPool::new(HeapKind::DepthStencil, 2, 0);
        pool.allocate().unwrap();
        pool.allocate().unwrap();
        assert_eq!(
            pool.allocate().unwrap_err(),
            RhiError::HeapExhausted {
                heap: HeapKind::DepthStencil,
                capacity: 2
            }
        );

        pool.free(1);
        assert_eq!(pool.allocate().unwrap(), 1);
    }
}
