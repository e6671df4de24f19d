// random_iter.rs - Uniform random selection over indexer matches
//! Random selection among the entries matching an indexer query, without
//! materializing the matches.
//!
//! Each call to `next` picks uniformly among the candidates that are still in
//! play (selection is with replacement). `remove` takes the element returned
//! by the latest `next` out of play, so a caller can draw without replacement.
//! Candidates are positions of the matching buckets laid end to end; gaps and
//! filtered-out entries are taken out of play as they are drawn. Taking a
//! position out of play is a sparse Fisher-Yates swap, so every draw is O(1)
//! apart from locating the bucket.

use crate::indexed_set::IndexedSet;
use rand::Rng;
use rustc_hash::FxHashMap;
use std::fmt::Debug;

/// The physical positions a [`RandomIter`] draws from.
pub enum Candidates<'a, T> {
    /// Matching buckets laid end to end; `starts[i]` is the first position of `sets[i]`.
    Sets {
        sets: Vec<&'a IndexedSet<T>>,
        starts: Vec<usize>,
        total: usize,
    },
    /// Pre-collected distinct matches.
    Owned(Vec<T>),
}

impl<'a, T: Copy + Debug> Candidates<'a, T> {
    pub fn sets(sets: Vec<&'a IndexedSet<T>>) -> Self {
        let mut starts = Vec::with_capacity(sets.len());
        let mut total = 0;
        for set in &sets {
            starts.push(total);
            total += set.slot_count();
        }
        Candidates::Sets { sets, starts, total }
    }

    fn total(&self) -> usize {
        match self {
            Candidates::Sets { total, .. } => *total,
            Candidates::Owned(values) => values.len(),
        }
    }

    fn get(&self, position: usize) -> Option<T> {
        match self {
            Candidates::Sets { sets, starts, .. } => {
                let bucket = starts.partition_point(|start| *start <= position).checked_sub(1)?;
                sets.get(bucket)?.get_at(position - starts[bucket])
            }
            Candidates::Owned(values) => values.get(position).copied(),
        }
    }
}

pub struct RandomIter<'a, T, R> {
    candidates: Candidates<'a, T>,
    rng: &'a mut R,
    filter: Option<Box<dyn FnMut(T) -> bool + 'a>>,
    remaining: usize,
    swapped: FxHashMap<usize, usize>,
    last: Option<usize>,
}

impl<'a, T: Copy + Debug, R: Rng> RandomIter<'a, T, R> {
    pub(crate) fn new(
        candidates: Candidates<'a, T>,
        rng: &'a mut R,
        filter: Option<Box<dyn FnMut(T) -> bool + 'a>>,
    ) -> Self {
        let remaining = candidates.total();
        Self {
            candidates,
            rng,
            filter,
            remaining,
            swapped: FxHashMap::default(),
            last: None,
        }
    }

    /// Takes the element returned by the latest `next` out of play.
    /// Returns false when there is nothing to remove.
    pub fn remove(&mut self) -> bool {
        match self.last.take() {
            Some(slot) => {
                self.take_out_of_play(slot);
                true
            }
            None => false,
        }
    }

    fn resolve(&self, slot: usize) -> usize {
        self.swapped.get(&slot).copied().unwrap_or(slot)
    }

    fn take_out_of_play(&mut self, slot: usize) {
        let last_slot = self.remaining - 1;
        if slot != last_slot {
            let moved = self.resolve(last_slot);
            self.swapped.insert(slot, moved);
        }
        self.swapped.remove(&last_slot);
        self.remaining -= 1;
    }
}

impl<'a, T: Copy + Debug, R: Rng> Iterator for RandomIter<'a, T, R> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.last = None;
        while self.remaining > 0 {
            let slot = self.rng.random_range(0..self.remaining);
            let position = self.resolve(slot);
            match self.candidates.get(position) {
                Some(value) if self.filter.as_mut().map_or(true, |accept| accept(value)) => {
                    self.last = Some(slot);
                    return Some(value);
                }
                _ => self.take_out_of_play(slot),
            }
        }
        None
    }
}
