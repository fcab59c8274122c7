//! Bindless texture descriptor table
//!
//! Maps stable [`TextureDescIndex`] values to textures so draw records can
//! keep referencing an index while the texture behind it is swapped.
//! Index 0 is never handed out. Freed indices are reused immediately; the
//! table stores handles, not GPU descriptors, so there is nothing the GPU
//! could still be reading.

use std::collections::HashMap;

use crate::rhi::{Handle, TextureDescIndex, TextureHandle};

#[derive(Debug)]
pub struct BindlessTable {
    mapping: HashMap<u32, TextureHandle>,
    free: Vec<u32>,
    next: u32,
}

impl Default for BindlessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl BindlessTable {
    pub fn new() -> Self {
        Self {
            mapping: HashMap::new(),
            free: Vec::new(),
            next: 1,
        }
    }

    /// Reserve an index mapped to nothing yet.
    pub fn allocate(&mut self) -> TextureDescIndex {
        let index = self.free.pop().unwrap_or_else(|| {
            let index = self.next;
            self.next += 1;
            index
        });
        self.mapping.insert(index, TextureHandle::NULL);
        TextureDescIndex::from_raw(index)
    }

    /// Point `index` at `texture` (null clears it). Returns false for unallocated indices.
    pub fn set(&mut self, index: TextureDescIndex, texture: TextureHandle) -> bool {
        match self.mapping.get_mut(&index.raw()) {
            Some(slot) => {
                *slot = texture;
                true
            }
            None => false,
        }
    }

    /// `None` when `index` is not allocated, `Some(NULL)` when it maps to nothing.
    pub fn get(&self, index: TextureDescIndex) -> Option<TextureHandle> {
        self.mapping.get(&index.raw()).copied()
    }

    /// Release `index`. Unknown and already freed indices are ignored.
    pub fn free(&mut self, index: TextureDescIndex) {
        if self.mapping.remove(&index.raw()).is_some() {
            self.free.push(index.raw());
        }
    }

    pub fn len(&self) -> usize {
        self.mapping.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }

    /// Highest index ever handed out.
    pub fn high_water_mark(&self) -> u32 {
        self.next - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_indices_start_at_one() {
        let mut table = BindlessTable::new();
        assert_eq!(table.allocate().raw(), 1);
        assert_eq!(table.allocate().raw(), 2);
    }

    #[test]
    fn test_mapping() {
        let mut table = BindlessTable::new();
        let index = table.allocate();
        assert_eq!(table.get(index), Some(TextureHandle::NULL));

        assert!(table.set(index, TextureHandle::from_raw(5)));
        assert_eq!(table.get(index), Some(TextureHandle::from_raw(5)));

        table.free(index);
        assert_eq!(table.get(index), None);
        assert!(!table.set(index, TextureHandle::from_raw(5)));
    }

    #[test]
    fn test_reuse_after_free() {
        let mut table = BindlessTable::new();
        let first: HashSet<u32> = (0..1000).map(|_| table.allocate().raw()).collect();
        for index in &first {
            table.free(TextureDescIndex::from_raw(*index));
        }
        let second: HashSet<u32> = (0..1000).map(|_| table.allocate().raw()).collect();
        assert_eq!(first, second);
        assert_eq!(table.high_water_mark(), 1000);
    }

    #[test]
    fn test_double_free_is_ignored() {
        let mut table = BindlessTable::new();
        let index = table.allocate();
        table.free(index);
        table.free(index);
        table.free(TextureDescIndex::NULL);

        let a = table.allocate();
        let b = table.allocate();
        assert_ne!(a, b);
    }
}
