use slab::Slab;
use static_assertions::const_assert_eq;
use std::fmt;
use std::mem;
use std::num::NonZeroU32;
use std::ops::{Index, IndexMut};

/// A stable handle to a value stored in an [`Arena32`].
///
/// Handles stay valid until the value is removed; they are never reused while the value is alive. `Option<ArenaId>` still
/// only requires 32 bits.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ArenaId(NonZeroU32);

const_assert_eq!(mem::size_of::<Option<ArenaId>>(), mem::size_of::<u32>());

impl ArenaId {
    /// The raw 32-bit representation. Never zero.
    #[inline]
    pub fn to_raw(self) -> u32 {
        self.0.get()
    }

    /// Inverse of [`ArenaId::to_raw`]; `0` maps to `None`.
    #[inline]
    pub fn from_raw(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    #[inline]
    fn index(self) -> usize {
        (self.0.get() - 1) as usize
    }

    fn from_index(index: usize) -> Self {
        assert!(index < u32::MAX as usize, "arena exhausted 32-bit id space");
        // SAFE: index + 1 is in 1..=u32::MAX
        Self(unsafe { NonZeroU32::new_unchecked(index as u32 + 1) })
    }
}

impl fmt::Debug for ArenaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Stores up to `u32::MAX - 1` values of type `T`, indexed by 32-bit [`ArenaId`]s.
pub struct Arena32<T> {
    values: Slab<T>,
}

impl<T> Default for Arena32<T> {
    fn default() -> Self {
        Self { values: Slab::new() }
    }
}

impl<T> Arena32<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            values: Slab::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[inline]
    pub fn contains(&self, id: ArenaId) -> bool {
        self.values.contains(id.index())
    }

    #[inline]
    pub fn get(&self, id: ArenaId) -> Option<&T> {
        self.values.get(id.index())
    }

    #[inline]
    pub fn get_mut(&mut self, id: ArenaId) -> Option<&mut T> {
        self.values.get_mut(id.index())
    }

    #[inline]
    pub fn insert(&mut self, value: T) -> ArenaId {
        ArenaId::from_index(self.values.insert(value))
    }

    /// Removes the value, freeing its slot. Returns `None` if `id` was not live.
    #[inline]
    pub fn remove(&mut self, id: ArenaId) -> Option<T> {
        self.values.try_remove(id.index())
    }

    pub fn iter(&self) -> impl Iterator<Item = (ArenaId, &T)> {
        self.values
            .iter()
            .map(|(index, value)| (ArenaId::from_index(index), value))
    }
}

impl<T> Index<ArenaId> for Arena32<T> {
    type Output = T;

    #[inline]
    fn index(&self, id: ArenaId) -> &Self::Output {
        self.values.index(id.index())
    }
}

impl<T> IndexMut<ArenaId> for Arena32<T> {
    #[inline]
    fn index_mut(&mut self, id: ArenaId) -> &mut Self::Output {
        self.values.index_mut(id.index())
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
