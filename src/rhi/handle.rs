//! Opaque object handles
//!
//! Every device object is named by a 32-bit integer where zero is reserved
//! as "invalid". Handles are plain values: they never own the object and
//! outlive it harmlessly, so destroying a null or unknown handle does
//! nothing.

use std::collections::HashMap;
use std::marker::PhantomData;

/// Common behavior of the typed handle wrappers.
pub trait Handle: Copy + Eq + std::hash::Hash + std::fmt::Debug {
    /// Short name used in error reports ("texture", "buffer", ...).
    const KIND: &'static str;

    fn from_raw(raw: u32) -> Self;
    fn raw(self) -> u32;

    fn is_null(self) -> bool {
        self.raw() == 0
    }

    fn is_valid(self) -> bool {
        self.raw() != 0
    }
}

macro_rules! define_handle {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub(crate) u32);

        impl $name {
            /// The reserved invalid handle.
            pub const NULL: Self = Self(0);
        }

        impl Handle for $name {
            const KIND: &'static str = $kind;

            fn from_raw(raw: u32) -> Self {
                Self(raw)
            }

            fn raw(self) -> u32 {
                self.0
            }
        }
    };
}

define_handle!(
    /// Handle to a GPU buffer
    BufferHandle,
    "buffer"
);
define_handle!(
    /// Handle to a 2D or cube texture
    TextureHandle,
    "texture"
);
define_handle!(
    /// Handle to a compiled shader
    ShaderHandle,
    "shader"
);
define_handle!(
    /// Handle to a pipeline description (shaders + topology)
    PipelineHandle,
    "pipeline"
);
define_handle!(
    /// Handle to a vertex input layout
    InputLayoutHandle,
    "input layout"
);
define_handle!(
    /// Handle to a framebuffer (color and depth attachment pair)
    FramebufferHandle,
    "framebuffer"
);
define_handle!(
    /// Handle to a CPU-waitable fence
    FenceHandle,
    "fence"
);
define_handle!(
    /// Index into the bindless texture descriptor table
    TextureDescIndex,
    "texture descriptor"
);

/// Dense id to entry map with a monotonically increasing id counter.
///
/// Ids are never reused, so a stale handle can only miss.
pub struct HandleMap<H: Handle, T> {
    entries: HashMap<u32, T>,
    next_id: u32,
    _marker: PhantomData<H>,
}

impl<H: Handle, T> HandleMap<H, T> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_id: 0,
            _marker: PhantomData,
        }
    }

    pub fn insert(&mut self, entry: T) -> H {
        self.next_id += 1;
        self.entries.insert(self.next_id, entry);
        H::from_raw(self.next_id)
    }

    pub fn get(&self, handle: H) -> Option<&T> {
        self.entries.get(&handle.raw())
    }

    pub fn get_mut(&mut self, handle: H) -> Option<&mut T> {
        self.entries.get_mut(&handle.raw())
    }

    /// Lookup that reports a missing entry as [`RhiError::HandleNotFound`](crate::RhiError).
    pub fn require(&self, handle: H) -> crate::RhiResult<&T> {
        self.get(handle)
            .ok_or_else(|| crate::RhiError::not_found(H::KIND, handle.raw()))
    }

    pub fn require_mut(&mut self, handle: H) -> crate::RhiResult<&mut T> {
        self.entries
            .get_mut(&handle.raw())
            .ok_or_else(|| crate::RhiError::not_found(H::KIND, handle.raw()))
    }

    pub fn remove(&mut self, handle: H) -> Option<T> {
        self.entries.remove(&handle.raw())
    }

    pub fn contains(&self, handle: H) -> bool {
        self.entries.contains_key(&handle.raw())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (H, &T)> {
        self.entries.iter().map(|(id, entry)| (H::from_raw(*id), entry))
    }

    /// Remove every entry, returning them. The id counter keeps counting.
    pub fn drain(&mut self) -> Vec<T> {
        self.entries.drain().map(|(_, entry)| entry).collect()
    }
}

impl<H: Handle, T> Default for HandleMap<H, T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_handles() {
        assert!(TextureHandle::NULL.is_null());
        assert!(!BufferHandle::from_raw(3).is_null());
        assert_eq!(FenceHandle::default(), FenceHandle::NULL);
    }

    #[test]
    fn test_ids_are_not_reused() {
        let mut map: HandleMap<BufferHandle, &str> = HandleMap::new();
        let a = map.insert("a");
        let b = map.insert("b");
        assert_eq!(a.raw(), 1);
        assert_eq!(b.raw(), 2);

        assert_eq!(map.remove(a), Some("a"));
        let c = map.insert("c");
        assert_eq!(c.raw(), 3);
        assert!(map.get(a).is_none());
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_require_reports_kind() {
        let map: HandleMap<ShaderHandle, ()> = HandleMap::new();
        let err = map.require(ShaderHandle::from_raw(9)).unwrap_err();
        assert_eq!(err, crate::RhiError::not_found("shader", 9));
    }
}
