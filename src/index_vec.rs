//! Typed arena used for typed-AST nodes, symbols and scopes.
//!
//! Nodes refer to each other through small copyable ids instead of owning
//! pointers, so "enclosing scope" and "child expression" are plain lookups.

use std::fmt;
use std::marker::PhantomData;
use std::ops::{Index, IndexMut};

/// A trait for types that can be used as indices.
pub trait Idx: Copy + Eq {
    fn new(raw: u32) -> Self;
    fn index(self) -> usize;
}

/// A Vec indexed by a newtype index for type safety.
#[derive(Clone, PartialEq)]
pub struct IndexVec<I: Idx, T> {
    raw: Vec<T>,
    _marker: PhantomData<fn(I) -> I>,
}

impl<I: Idx, T: fmt::Debug> fmt::Debug for IndexVec<I, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.raw.iter()).finish()
    }
}

impl<I: Idx, T> Default for IndexVec<I, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: Idx, T> IndexVec<I, T> {
    pub fn new() -> Self {
        Self {
            raw: Vec::new(),
            _marker: PhantomData,
        }
    }

    /// Push a value and return its index.
    pub fn push(&mut self, value: T) -> I {
        let idx = I::new(self.raw.len() as u32);
        self.raw.push(value);
        idx
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn get(&self, idx: I) -> Option<&T> {
        self.raw.get(idx.index())
    }

    pub fn get_mut(&mut self, idx: I) -> Option<&mut T> {
        self.raw.get_mut(idx.index())
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.raw.iter()
    }

    pub fn iter_enumerated(&self) -> impl Iterator<Item = (I, &T)> {
        self.raw
            .iter()
            .enumerate()
            .map(|(i, v)| (I::new(i as u32), v))
    }

    pub fn next_idx(&self) -> I {
        I::new(self.raw.len() as u32)
    }
}

impl<I: Idx, T> Index<I> for IndexVec<I, T> {
    type Output = T;

    fn index(&self, idx: I) -> &T {
        &self.raw[idx.index()]
    }
}

impl<I: Idx, T> IndexMut<I> for IndexVec<I, T> {
    fn index_mut(&mut self, idx: I) -> &mut T {
        &mut self.raw[idx.index()]
    }
}

/// Declare a `u32` newtype id usable as an [`IndexVec`] index.
#[macro_export]
macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
        pub struct $name(pub u32);

        impl $crate::index_vec::Idx for $name {
            fn new(raw: u32) -> Self {
                Self(raw)
            }
            fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    define_id!(TestId, "test");

    #[test]
    fn push_returns_sequential_ids() {
        let mut vec: IndexVec<TestId, &str> = IndexVec::new();
        let a = vec.push("a");
        let b = vec.push("b");
        assert_eq!(a, TestId(0));
        assert_eq!(b, TestId(1));
        assert_eq!(vec[b], "b");
        assert_eq!(vec.next_idx(), TestId(2));
    }

    #[test]
    fn iter_enumerated_yields_ids() {
        let mut vec: IndexVec<TestId, u8> = IndexVec::new();
        vec.push(7);
        vec.push(9);
        let pairs: Vec<_> = vec.iter_enumerated().map(|(i, v)| (i.0, *v)).collect();
        assert_eq!(pairs, vec![(0, 7), (1, 9)]);
        assert_eq!(format!("{}", TestId(3)), "test#3");
    }
}
