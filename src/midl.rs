//! Sorted page-number lists used by the freelist.

use crate::page::Pgno;

/// A list of unique page numbers kept in ascending order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Idl {
    ids: Vec<Pgno>,
}

impl Idl {
    pub fn new() -> Self {
        Idl { ids: Vec::new() }
    }

    pub fn from_unsorted(mut ids: Vec<Pgno>) -> Self {
        ids.sort_unstable();
        ids.dedup();
        Idl { ids }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn as_slice(&self) -> &[Pgno] {
        &self.ids
    }

    /// Inserts `id`, returning false if it was already present.
    pub fn insert(&mut self, id: Pgno) -> bool {
        match self.ids.binary_search(&id) {
            Ok(_) => false,
            Err(pos) => {
                self.ids.insert(pos, id);
                true
            }
        }
    }

    /// Merges another list into this one.
    pub fn merge(&mut self, other: &[Pgno]) {
        if other.is_empty() {
            return;
        }
        let mut out = Vec::with_capacity(self.ids.len() + other.len());
        let (mut i, mut j) = (0, 0);
        while i < self.ids.len() && j < other.len() {
            let (a, b) = (self.ids[i], other[j]);
            if a < b {
                out.push(a);
                i += 1;
            } else if b < a {
                out.push(b);
                j += 1;
            } else {
                out.push(a);
                i += 1;
                j += 1;
            }
        }
        out.extend_from_slice(&self.ids[i..]);
        out.extend_from_slice(&other[j..]);
        out.dedup();
        self.ids = out;
    }

    /// Removes and returns the first page of a run of `count` consecutive
    /// page numbers, if the list holds one.
    pub fn take_run(&mut self, count: usize) -> Option<Pgno> {
        if count == 0 || self.ids.len() < count {
            return None;
        }
        let span = count as u64 - 1;
        let start = (0..=self.ids.len() - count).find(|&i| self.ids[i + count - 1] - self.ids[i] == span)?;
        let first = self.ids[start];
        self.ids.drain(start..start + count);
        Some(first)
    }
}
