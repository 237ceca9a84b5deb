//! Shared building blocks for the pointstream crates: a handle-based arena, spatial primitives, and worker timing.

pub mod arena;
pub mod work_timer;
pub mod geometry;

use ahash::{AHashMap, AHashSet};
pub type SmallKeyHashMap<K, V> = AHashMap<K, V>;
pub type SmallKeyHashSet<K> = AHashSet<K>;

// Re-exports.
pub use glam;
pub use static_assertions;
