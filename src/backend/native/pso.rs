//! Pipeline state object cache.
//!
//! Native pipeline objects bake the shaders, input layout, fixed-function
//! state and render-target formats together, but the command stream sets
//! those independently. Draws look up a PSO by everything that goes into
//! it, hashed with 64-bit FNV-1a, and build it on first use.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use crate::backend::native::gpu::{RawPipeline, MAX_RENDER_TARGETS};
use crate::rhi::{CompareOp, CullMode, FrontFace, GraphicsState, TextureFormat};

const FNV_OFFSET_BASIS: u64 = 1469598103934665603;
const FNV_PRIME: u64 = 1099511628211;

/// Fold the graphics state into 9 bits:
///
/// ```text
/// bits 0-1  cull mode
/// bit  2    front face
/// bit  3    depth test
/// bit  4    depth write
/// bits 5-7  depth compare op
/// bit  8    blend
/// ```
pub fn pack_state(state: &GraphicsState) -> u32 {
    let cull = match state.rasterizer.cull_mode {
        CullMode::None => 0,
        CullMode::Front => 1,
        CullMode::Back => 2,
    };
    let front_face = match state.rasterizer.front_face {
        FrontFace::Clockwise => 0,
        FrontFace::CounterClockwise => 1,
    };
    let compare = match state.depth.compare_op {
        CompareOp::Never => 0,
        CompareOp::Less => 1,
        CompareOp::Equal => 2,
        CompareOp::LessEqual => 3,
        CompareOp::Greater => 4,
        CompareOp::NotEqual => 5,
        CompareOp::GreaterEqual => 6,
        CompareOp::Always => 7,
    };

    (cull & 3)
        | ((front_face & 1) << 2)
        | ((state.depth.test_enable as u32) << 3)
        | ((state.depth.write_enable as u32) << 4)
        | ((compare & 7) << 5)
        | ((state.blend.enable as u32) << 8)
}

/// Everything a cached PSO depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PsoKey {
    pub pipeline: u32,
    pub input_layout: u32,
    pub packed_state: u32,
    pub rtv_formats: [Option<TextureFormat>; MAX_RENDER_TARGETS],
    pub num_render_targets: u32,
    pub dsv_format: Option<TextureFormat>,
}

impl PsoKey {
    pub fn fnv1a(&self) -> u64 {
        let mut hash = FNV_OFFSET_BASIS;
        let mut mix = |value: u64| {
            for byte in value.to_le_bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(FNV_PRIME);
            }
        };

        mix(self.pipeline as u64);
        mix(self.input_layout as u64);
        mix(self.packed_state as u64);
        mix(self.num_render_targets as u64);
        mix(format_code(self.dsv_format));
        for format in &self.rtv_formats {
            mix(format_code(*format));
        }
        hash
    }
}

impl Hash for PsoKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.fnv1a());
    }
}

fn format_code(format: Option<TextureFormat>) -> u64 {
    format.map(|f| f.code()).unwrap_or(0)
}

/// Cached build result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachedPso {
    Ready(RawPipeline),
    /// Building failed once; draws using this combination are skipped
    Disabled,
}

#[derive(Debug, Default)]
pub struct PsoCache {
    entries: HashMap<PsoKey, CachedPso>,
    builds: u64,
}

impl PsoCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &PsoKey) -> Option<CachedPso> {
        self.entries.get(key).copied()
    }

    /// Store a build result, returning the native object it replaced.
    pub fn insert(&mut self, key: PsoKey, pso: CachedPso) -> Option<RawPipeline> {
        self.builds += 1;
        match self.entries.insert(key, pso) {
            Some(CachedPso::Ready(raw)) if pso != CachedPso::Ready(raw) => Some(raw),
            _ => None,
        }
    }

    /// Drop entries built from `pipeline`, returning their native objects.
    pub fn purge_pipeline(&mut self, pipeline: u32) -> Vec<RawPipeline> {
        self.purge(|key| key.pipeline == pipeline)
    }

    /// Drop entries built with `input_layout`, returning their native objects.
    pub fn purge_input_layout(&mut self, input_layout: u32) -> Vec<RawPipeline> {
        self.purge(|key| key.input_layout == input_layout)
    }

    fn purge(&mut self, matches: impl Fn(&PsoKey) -> bool) -> Vec<RawPipeline> {
        let mut released = Vec::new();
        self.entries.retain(|key, pso| {
            if !matches(key) {
                return true;
            }
            if let CachedPso::Ready(raw) = pso {
                released.push(*raw);
            }
            false
        });
        released
    }

    /// Remove everything, returning the native objects.
    pub fn drain(&mut self) -> Vec<RawPipeline> {
        self.purge(|_| true)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of cache misses that led to a build attempt.
    pub fn builds(&self) -> u64 {
        self.builds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(pipeline: u32, state: GraphicsState) -> PsoKey {
        let mut rtv_formats = [None; MAX_RENDER_TARGETS];
        rtv_formats[0] = Some(TextureFormat::Rgba8Unorm);
        PsoKey {
            pipeline,
            input_layout: 1,
            packed_state: pack_state(&state),
            rtv_formats,
            num_render_targets: 1,
            dsv_format: Some(TextureFormat::Depth32Float),
        }
    }

    #[test]
    fn test_pack_state_layout() {
        let state = GraphicsState::default()
            .with_cull_mode(CullMode::Back)
            .with_depth(true, false, CompareOp::LessEqual)
            .with_blend(true);
        // cull=2, ccw=1<<2, test=1<<3, write=0, compare=3<<5, blend=1<<8
        assert_eq!(pack_state(&state), 2 | 4 | 8 | (3 << 5) | (1 << 8));

        let off = GraphicsState::default()
            .with_cull_mode(CullMode::None)
            .with_depth(false, false, CompareOp::Never);
        assert_eq!(pack_state(&off), 1 << 2);
    }

    #[test]
    fn test_hash_is_deterministic() {
        let a = key(1, GraphicsState::default());
        let b = key(1, GraphicsState::default());
        assert_eq!(a.fnv1a(), b.fnv1a());

        let other_pipeline = key(2, GraphicsState::default());
        let other_state = key(1, GraphicsState::default().with_blend(true));
        assert_ne!(a.fnv1a(), other_pipeline.fnv1a());
        assert_ne!(a.fnv1a(), other_state.fnv1a());
    }

    #[test]
    fn test_hash_of_empty_key() {
        let empty = PsoKey {
            pipeline: 0,
            input_layout: 0,
            packed_state: 0,
            rtv_formats: [None; MAX_RENDER_TARGETS],
            num_render_targets: 0,
            dsv_format: None,
        };
        // 13 zero words hashed byte by byte
        let mut expected = FNV_OFFSET_BASIS;
        for _ in 0..13 * 8 {
            expected = expected.wrapping_mul(FNV_PRIME);
        }
        assert_eq!(empty.fnv1a(), expected);
    }

    #[test]
    fn test_purge() {
        let mut cache = PsoCache::new();
        cache.insert(key(1, GraphicsState::default()), CachedPso::Ready(RawPipeline(10)));
        cache.insert(
            key(1, GraphicsState::default().with_blend(true)),
            CachedPso::Disabled,
        );
        cache.insert(key(2, GraphicsState::default()), CachedPso::Ready(RawPipeline(11)));
        assert_eq!(cache.len(), 3);

        assert_eq!(cache.purge_pipeline(1), vec![RawPipeline(10)]);
        assert_eq!(cache.len(), 1);
        assert_eq!(
            cache.get(&key(2, GraphicsState::default())),
            Some(CachedPso::Ready(RawPipeline(11)))
        );
        assert_eq!(cache.builds(), 3);
    }

    /// Keys that share a hash still get separate entries.
    #[test]
    fn test_colliding_hashes_keep_both_entries() {
        let a = key(1, GraphicsState::default());
        let mut b = a;
        b.rtv_formats[0] = Some(TextureFormat::Bgra8Unorm);

        let mut map = HashMap::with_hasher(ConstantHasher::default());
        map.insert(a, CachedPso::Ready(RawPipeline(1)));
        map.insert(b, CachedPso::Ready(RawPipeline(2)));
        assert_eq!(map.len(), 2);
        assert_eq!(map.get(&a), Some(&CachedPso::Ready(RawPipeline(1))));
        assert_eq!(map.get(&b), Some(&CachedPso::Ready(RawPipeline(2))));
    }

    #[test]
    fn test_replacing_an_entry_returns_the_old_pipeline() {
        let mut cache = PsoCache::new();
        let a = key(1, GraphicsState::default());
        assert_eq!(cache.insert(a, CachedPso::Ready(RawPipeline(1))), None);
        assert_eq!(cache.insert(a, CachedPso::Ready(RawPipeline(2))), Some(RawPipeline(1)));
        assert_eq!(cache.insert(a, CachedPso::Disabled), Some(RawPipeline(2)));
        assert_eq!(cache.len(), 1);
    }

    /// Every key lands in the same bucket.
    #[derive(Default, Clone)]
    struct ConstantHasher;

    impl std::hash::BuildHasher for ConstantHasher {
        type Hasher = Constant;

        fn build_hasher(&self) -> Constant {
            Constant
        }
    }

    struct Constant;

    impl Hasher for Constant {
        fn finish(&self) -> u64 {
            7
        }

        fn write(&mut self, _bytes: &[u8]) {}
    }
}
