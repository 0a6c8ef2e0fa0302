//! Arena storage and typed indices.
//!
//! Every IR entity (instruction, operand, block, edge, expression, dependence
//! node) lives in an [`Arena`] owned by its compilation context and is
//! addressed by an [`Id`]. Nothing is freed individually; dropping the owning
//! context releases the whole arena. Graph structures that may contain cycles
//! therefore hold indices, never references.

use std::marker::PhantomData;
use std::ops::{Index, IndexMut};

// =============================================================================
// Typed ID
// =============================================================================

/// A typed index into an [`Arena<T>`].
///
/// The marker keeps IDs from different arenas apart at compile time. Trait
/// impls are written by hand so `Id<T>` is `Copy + Eq + Hash` whatever `T` is.
pub struct Id<T> {
    index: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Copy for Id<T> {}

impl<T> Clone for Id<T> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> PartialEq for Id<T> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<T> Eq for Id<T> {}

impl<T> PartialOrd for Id<T> {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Id<T> {
    #[inline]
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.index.cmp(&other.index)
    }
}

impl<T> std::hash::Hash for Id<T> {
    #[inline]
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}

impl<T> Id<T> {
    /// Sentinel for "no entity".
    pub const INVALID: Self = Id {
        index: u32::MAX,
        _marker: PhantomData,
    };

    #[inline]
    pub const fn new(index: u32) -> Self {
        Id {
            index,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn from_usize(index: usize) -> Self {
        debug_assert!(index < u32::MAX as usize);
        Id::new(index as u32)
    }

    /// Raw index.
    #[inline]
    pub const fn index(self) -> u32 {
        self.index
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.index as usize
    }

    #[inline]
    pub const fn is_valid(self) -> bool {
        self.index != u32::MAX
    }
}

impl<T> std::fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_valid() {
            write!(f, "#{}", self.index)
        } else {
            write!(f, "#INVALID")
        }
    }
}

impl<T> std::fmt::Display for Id<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.index)
    }
}

impl<T> Default for Id<T> {
    fn default() -> Self {
        Self::INVALID
    }
}

// =============================================================================
// Arena
// =============================================================================

/// Append-only storage for homogeneous items.
#[derive(Debug, Clone)]
pub struct Arena<T> {
    items: Vec<T>,
}

impl<T> Arena<T> {
    #[inline]
    pub fn new() -> Self {
        Arena { items: Vec::new() }
    }

    #[inline]
    pub fn with_capacity(capacity: usize) -> Self {
        Arena {
            items: Vec::with_capacity(capacity),
        }
    }

    /// Store an item and return its ID.
    #[inline]
    pub fn alloc(&mut self, item: T) -> Id<T> {
        let id = Id::from_usize(self.items.len());
        self.items.push(item);
        id
    }

    #[inline]
    pub fn get(&self, id: Id<T>) -> Option<&T> {
        self.items.get(id.as_usize())
    }

    #[inline]
    pub fn get_mut(&mut self, id: Id<T>) -> Option<&mut T> {
        self.items.get_mut(id.as_usize())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterate over `(id, item)` pairs in allocation order.
    pub fn iter(&self) -> impl Iterator<Item = (Id<T>, &T)> {
        self.items
            .iter()
            .enumerate()
            .map(|(i, item)| (Id::from_usize(i), item))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Id<T>, &mut T)> {
        self.items
            .iter_mut()
            .enumerate()
            .map(|(i, item)| (Id::from_usize(i), item))
    }

    /// All IDs allocated so far.
    pub fn ids(&self) -> impl Iterator<Item = Id<T>> {
        (0..self.items.len() as u32).map(Id::new)
    }

    /// The ID the next `alloc` will return.
    #[inline]
    pub fn next_id(&self) -> Id<T> {
        Id::from_usize(self.items.len())
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Index<Id<T>> for Arena<T> {
    type Output = T;

    #[inline]
    fn index(&self, id: Id<T>) -> &Self::Output {
        &self.items[id.as_usize()]
    }
}

impl<T> IndexMut<Id<T>> for Arena<T> {
    #[inline]
    fn index_mut(&mut self, id: Id<T>) -> &mut Self::Output {
        &mut self.items[id.as_usize()]
    }
}

// =============================================================================
// Secondary Map
// =============================================================================

/// Dense side table keyed by the IDs of another arena.
///
/// Reads of IDs past the end yield the default value, so analyses can be
/// sized once and still tolerate entities created after they ran.
#[derive(Debug, Clone)]
pub struct SecondaryMap<K, V> {
    values: Vec<V>,
    default: V,
    _marker: PhantomData<fn() -> K>,
}

impl<K, V: Default + Clone> SecondaryMap<K, V> {
    pub fn new() -> Self {
        SecondaryMap {
            values: Vec::new(),
            default: V::default(),
            _marker: PhantomData,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        SecondaryMap {
            values: vec![V::default(); capacity],
            default: V::default(),
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn get(&self, id: Id<K>) -> &V {
        self.values.get(id.as_usize()).unwrap_or(&self.default)
    }

    /// Mutable access, growing the table as needed.
    pub fn get_mut(&mut self, id: Id<K>) -> &mut V {
        let idx = id.as_usize();
        if idx >= self.values.len() {
            self.values.resize(idx + 1, V::default());
        }
        &mut self.values[idx]
    }

    #[inline]
    pub fn set(&mut self, id: Id<K>, value: V) {
        *self.get_mut(id) = value;
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (Id<K>, &V)> {
        self.values
            .iter()
            .enumerate()
            .map(|(i, v)| (Id::from_usize(i), v))
    }
}

impl<K, V: Default + Clone> Default for SecondaryMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V: Default + Clone> Index<Id<K>> for SecondaryMap<K, V> {
    type Output = V;

    #[inline]
    fn index(&self, id: Id<K>) -> &Self::Output {
        self.get(id)
    }
}

impl<K, V: Default + Clone> IndexMut<Id<K>> for SecondaryMap<K, V> {
    #[inline]
    fn index_mut(&mut self, id: Id<K>) -> &mut Self::Output {
        self.get_mut(id)
    }
}

// =============================================================================
// Bit Set
// =============================================================================

/// Growable bit set over dense indices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BitSet {
    words: Vec<u64>,
}

impl BitSet {
    pub fn new() -> Self {
        BitSet { words: Vec::new() }
    }

    pub fn with_capacity(n: usize) -> Self {
        BitSet {
            words: vec![0; n.div_ceil(64)],
        }
    }

    /// Set a bit. Returns `true` if it was previously clear.
    #[inline]
    pub fn insert(&mut self, index: usize) -> bool {
        let word = index / 64;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        let mask = 1u64 << (index % 64);
        let fresh = self.words[word] & mask == 0;
        self.words[word] |= mask;
        fresh
    }

    #[inline]
    pub fn remove(&mut self, index: usize) {
        if let Some(w) = self.words.get_mut(index / 64) {
            *w &= !(1u64 << (index % 64));
        }
    }

    #[inline]
    pub fn contains(&self, index: usize) -> bool {
        self.words
            .get(index / 64)
            .is_some_and(|w| w & (1u64 << (index % 64)) != 0)
    }

    pub fn clear(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }

    pub fn union_with(&mut self, other: &BitSet) {
        if other.words.len() > self.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (dst, src) in self.words.iter_mut().zip(&other.words) {
            *dst |= src;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Set bits in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(wi, &word)| {
            let mut rest = word;
            std::iter::from_fn(move || {
                if rest == 0 {
                    return None;
                }
                let bit = rest.trailing_zeros() as usize;
                rest &= rest - 1;
                Some(wi * 64 + bit)
            })
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe(u32);

    #[test]
    fn test_arena_ids_are_dense() {
        let mut arena: Arena<Probe> = Arena::new();
        let a = arena.alloc(Probe(1));
        let b = arena.alloc(Probe(2));
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
        assert_eq!(arena.next_id().index(), 2);
        arena[b].0 = 20;
        assert_eq!(arena[b].0, 20);
        assert_eq!(arena.ids().count(), 2);
    }

    #[test]
    fn test_secondary_map_defaults_past_end() {
        let mut arena: Arena<Probe> = Arena::new();
        let a = arena.alloc(Probe(0));
        let late = Id::<Probe>::new(40);
        let mut map: SecondaryMap<Probe, u32> = SecondaryMap::new();
        map.set(a, 5);
        assert_eq!(map[a], 5);
        assert_eq!(map[late], 0);
        map[late] += 3;
        assert_eq!(*map.get(late), 3);
    }

    #[test]
    fn test_bit_set_iteration_order() {
        let mut set = BitSet::new();
        assert!(set.insert(100));
        assert!(set.insert(3));
        assert!(!set.insert(3));
        set.insert(64);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![3, 64, 100]);
        set.remove(64);
        assert!(!set.contains(64));
        assert_eq!(set.count(), 2);
    }

    #[test]
    fn test_bit_set_union() {
        let mut a = BitSet::new();
        a.insert(1);
        let mut b = BitSet::new();
        b.insert(130);
        a.union_with(&b);
        assert!(a.contains(1) && a.contains(130));
    }

    #[test]
    fn test_invalid_id() {
        assert!(!Id::<Probe>::INVALID.is_valid());
        assert!(Id::<Probe>::new(0).is_valid());
    }
}
