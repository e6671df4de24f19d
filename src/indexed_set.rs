// indexed_set.rs - Compacting backing store for indexer buckets
//! A bucket of indexed entries with O(1) add and remove.
//!
//! Removal leaves a gap instead of shifting elements, so positions of other
//! entries stay valid. Gaps are reclaimed only during a full scan
//! (`for_each` / `as_vec`), once there are enough of them to be worth it.
//! Handles stay valid across compaction because they point into a
//! generational position tracker rather than at raw positions.

use crate::error::{Result, ScorenetError};
use generational_arena::{Arena, Index};
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};

/// Sets smaller than this never compact during a scan.
pub const MINIMUM_ELEMENT_COUNT_FOR_COMPACTION: usize = 20;
/// Fraction of gaps (relative to live entries) that triggers compaction.
pub const GAP_RATIO_FOR_COMPACTION: f64 = 0.1;

static NEXT_SET_ID: AtomicU64 = AtomicU64::new(1);

/// Removal handle for one entry of one [`IndexedSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryHandle {
    set: u64,
    entry: Index,
}

impl EntryHandle {
    pub fn set_id(&self) -> u64 {
        self.set
    }
}

#[derive(Debug)]
pub struct IndexedSet<T> {
    id: u64,
    elements: Vec<Option<(Index, T)>>,
    positions: Arena<usize>,
    gap_count: usize,
}

impl<T: Copy + Debug> IndexedSet<T> {
    pub fn new() -> Self {
        Self {
            id: NEXT_SET_ID.fetch_add(1, Ordering::Relaxed),
            elements: Vec::new(),
            positions: Arena::new(),
            gap_count: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn add(&mut self, value: T) -> EntryHandle {
        let position = self.elements.len();
        let entry = self.positions.insert(position);
        self.elements.push(Some((entry, value)));
        EntryHandle { set: self.id, entry }
    }

    /// Removes the entry behind `handle`. Removing an entry twice, or with a
    /// handle issued by another set, is a state corruption.
    pub fn remove(&mut self, handle: EntryHandle) -> Result<T> {
        if handle.set != self.id {
            return Err(ScorenetError::corruption(format!(
                "entry handle belongs to set {} but was removed from set {}",
                handle.set, self.id
            )));
        }
        let position = self.positions.remove(handle.entry).ok_or_else(|| {
            ScorenetError::corruption(format!(
                "entry {:?} was already removed from set {}",
                handle.entry, self.id
            ))
        })?;
        let (_, value) = self
            .elements
            .get_mut(position)
            .and_then(Option::take)
            .ok_or_else(|| {
                ScorenetError::corruption(format!(
                    "position {} of set {} is empty but was still tracked",
                    position, self.id
                ))
            })?;
        if position + 1 == self.elements.len() {
            self.elements.pop();
            while matches!(self.elements.last(), Some(None)) {
                self.elements.pop();
                self.gap_count -= 1;
            }
        } else {
            self.gap_count += 1;
        }
        Ok(value)
    }

    pub fn contains(&self, handle: EntryHandle) -> bool {
        handle.set == self.id && self.positions.contains(handle.entry)
    }

    pub fn len(&self) -> usize {
        self.elements.len() - self.gap_count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn gap_count(&self) -> usize {
        self.gap_count
    }

    /// Visits every entry, compacting first when the gap ratio warrants it.
    pub fn for_each(&mut self, mut visitor: impl FnMut(T)) {
        if self.should_compact() {
            self.compact();
        }
        for (_, value) in self.elements.iter().flatten() {
            visitor(*value);
        }
    }

    /// Returns all entries in insertion order, always reclaiming gaps.
    pub fn as_vec(&mut self) -> Vec<T> {
        if self.gap_count > 0 {
            self.compact();
        }
        self.elements.iter().flatten().map(|(_, v)| *v).collect()
    }

    /// Non-compacting iteration.
    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        self.elements.iter().flatten().map(|(_, v)| *v)
    }

    /// Number of physical positions, including gaps.
    pub(crate) fn slot_count(&self) -> usize {
        self.elements.len()
    }

    pub(crate) fn get_at(&self, position: usize) -> Option<T> {
        self.elements
            .get(position)
            .and_then(|slot| slot.as_ref().map(|(_, v)| *v))
    }

    fn should_compact(&self) -> bool {
        let live = self.len();
        self.gap_count > 0
            && live >= MINIMUM_ELEMENT_COUNT_FOR_COMPACTION
            && (self.gap_count as f64) / (live as f64) > GAP_RATIO_FOR_COMPACTION
    }

    fn compact(&mut self) {
        let mut write = 0;
        for read in 0..self.elements.len() {
            if let Some((entry, value)) = self.elements[read].take() {
                if let Some(position) = self.positions.get_mut(entry) {
                    *position = write;
                }
                self.elements[write] = Some((entry, value));
                write += 1;
            }
        }
        self.elements.truncate(write);
        self.gap_count = 0;
    }
}

impl<T: Copy + Debug> Default for IndexedSet<T> {
    fn default() -> Self {
        Self::new()
    }
}
