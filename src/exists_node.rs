// exists_node.rs - IfExists / IfNotExists
//! Passes a left tuple through while it has at least one matching right
//! tuple (`if_exists`) or none at all (`if_not_exists`).
//!
//! Each left tuple owns a counter in the node's arena. Counters change on
//! every matching right event, but the left tuple is only inserted into or
//! retracted from the children when its counter crosses the 0/1 boundary.
//! With a residual filter the node remembers which pairs were counted, so a
//! decrement always undoes exactly one earlier increment.

use crate::arena::{ChildLink, NodeOperation, Side, TupleArena, TupleId};
use crate::error::{Result, ScorenetError};
use crate::functions::{guarded, guarded_on, PairPredicate};
use crate::indexer::{IndexHandle, Indexer};
use crate::join_node::JoinSlots;
use crate::joiner::{extract_keys, indexer_levels, Joiner};
use crate::key::IndexKeys;
use crate::lifecycle;
use crate::nodes::{ensure_empty, unexpected_slot};
use crate::tuple::{StoreEntry, Tuple};
use generational_arena::{Arena, Index};
use rustc_hash::{FxHashMap, FxHashSet};
use std::fmt;

/// Reference to the match counter of one left tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CounterId(pub(crate) Index);

#[derive(Debug)]
struct Counter {
    left: TupleId,
    count: usize,
}

/// Slots an exists node reserves on its left tuples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExistsLeftSlots {
    pub keys: usize,
    pub handle: usize,
    pub counter: usize,
}

pub struct IfExistsNode {
    pub should_exist: bool,
    pub joiners: Vec<Joiner>,
    pub filter: Option<PairPredicate>,
    /// Left counters, filed under left keys.
    left_index: Indexer<CounterId>,
    /// Right tuples, filed under right keys.
    right_index: Indexer<TupleId>,
    counters: Arena<Counter>,
    left_slots: ExistsLeftSlots,
    right_slots: JoinSlots,
    /// Counted pairs, only maintained with a filter.
    counted_by_right: FxHashMap<TupleId, FxHashSet<CounterId>>,
    counted_by_counter: FxHashMap<CounterId, FxHashSet<TupleId>>,
    pub children: Vec<ChildLink>,
}

impl IfExistsNode {
    pub fn new(
        should_exist: bool,
        joiners: Vec<Joiner>,
        filter: Option<PairPredicate>,
        left_slots: ExistsLeftSlots,
        right_slots: JoinSlots,
    ) -> Self {
        Self {
            should_exist,
            left_index: Indexer::new(indexer_levels(&joiners, true)),
            right_index: Indexer::new(indexer_levels(&joiners, false)),
            joiners,
            filter,
            counters: Arena::new(),
            left_slots,
            right_slots,
            counted_by_right: FxHashMap::default(),
            counted_by_counter: FxHashMap::default(),
            children: Vec::new(),
        }
    }

    /// Whether a left tuple with `count` matches is passed to the children.
    fn passes(&self, count: usize) -> bool {
        (count > 0) == self.should_exist
    }

    fn keys_of(&self, side: Side, tuple: &Tuple) -> Result<IndexKeys> {
        let left_side = side == Side::Left;
        guarded_on("exists key extraction", tuple, || extract_keys(&self.joiners, left_side, tuple))
    }

    fn accepts(&self, left: TupleId, right: TupleId, tuples: &TupleArena) -> Result<bool> {
        let filter = match &self.filter {
            Some(filter) => filter,
            None => return Ok(true),
        };
        let left = tuples.get(left)?;
        let right = tuples.get(right)?;
        guarded(
            "exists filter",
            || format!("{} x {}", left.describe(), right.describe()),
            || filter(left, right),
        )
    }

    fn counter(&self, id: CounterId) -> Result<&Counter> {
        self.counters
            .get(id.0)
            .ok_or_else(|| ScorenetError::corruption(format!("exists counter {:?} is not live", id.0)))
    }

    fn counter_mut(&mut self, id: CounterId) -> Result<&mut Counter> {
        self.counters
            .get_mut(id.0)
            .ok_or_else(|| ScorenetError::corruption(format!("exists counter {:?} is not live", id.0)))
    }

    fn stored_keys(&self, tuple: TupleId, slot: usize, tuples: &TupleArena) -> Result<IndexKeys> {
        match tuples.slot(tuple, slot)? {
            StoreEntry::Keys(keys) => Ok(keys.clone()),
            other => Err(unexpected_slot("exists", tuple, "keys", other)),
        }
    }

    fn take_keys_and_handle(&self, tuple: TupleId, slots: JoinSlots, tuples: &mut TupleArena) -> Result<(IndexKeys, IndexHandle)> {
        let keys = match tuples.take_slot(tuple, slots.keys)? {
            StoreEntry::Keys(keys) => keys,
            other => return Err(unexpected_slot("exists", tuple, "keys", &other)),
        };
        let handle = match tuples.take_slot(tuple, slots.handle)? {
            StoreEntry::Handle(handle) => handle,
            other => return Err(unexpected_slot("exists", tuple, "handle", &other)),
        };
        Ok((keys, handle))
    }

    fn left_counter(&self, tuple: TupleId, tuples: &TupleArena) -> Result<CounterId> {
        match tuples.slot(tuple, self.left_slots.counter)? {
            StoreEntry::Counter(id) => Ok(*id),
            other => Err(unexpected_slot("exists", tuple, "counter", other)),
        }
    }

    fn track(&mut self, counter: CounterId, right: TupleId) {
        self.counted_by_counter.entry(counter).or_default().insert(right);
        self.counted_by_right.entry(right).or_default().insert(counter);
    }

    fn untrack(&mut self, counter: CounterId, right: TupleId) -> bool {
        let removed = match self.counted_by_counter.get_mut(&counter) {
            Some(set) => {
                let removed = set.remove(&right);
                if set.is_empty() {
                    self.counted_by_counter.remove(&counter);
                }
                removed
            }
            None => false,
        };
        if let Some(set) = self.counted_by_right.get_mut(&right) {
            set.remove(&counter);
            if set.is_empty() {
                self.counted_by_right.remove(&right);
            }
        }
        removed
    }

    /// Drops every counted pair of a counter.
    fn untrack_counter(&mut self, counter: CounterId) {
        if let Some(rights) = self.counted_by_counter.remove(&counter) {
            for right in rights {
                if let Some(set) = self.counted_by_right.get_mut(&right) {
                    set.remove(&counter);
                    if set.is_empty() {
                        self.counted_by_right.remove(&right);
                    }
                }
            }
        }
    }

    /// Counts the right tuples matching a left tuple from scratch.
    fn count_matches(&mut self, counter: CounterId, left: TupleId, keys: &IndexKeys, tuples: &TupleArena) -> Result<usize> {
        if self.filter.is_none() {
            return Ok(self.right_index.size(keys));
        }
        self.untrack_counter(counter);
        let mut count = 0;
        for right in self.right_index.matches(keys) {
            if self.accepts(left, right, tuples)? {
                self.track(counter, right);
                count += 1;
            }
        }
        Ok(count)
    }

    fn emit_transition(&self, left: TupleId, was: bool, now: bool, emitted: &mut Vec<NodeOperation>) {
        let operation: fn(ChildLink, TupleId) -> NodeOperation = match (was, now) {
            (true, true) => NodeOperation::Update,
            (true, false) => NodeOperation::Retract,
            (false, true) => NodeOperation::Insert,
            (false, false) => return,
        };
        lifecycle::forward(operation, left, &self.children, emitted);
    }

    pub fn insert(&mut self, side: Side, tuple: TupleId, tuples: &mut TupleArena, emitted: &mut Vec<NodeOperation>) -> Result<()> {
        match side {
            Side::Left => self.insert_left(tuple, tuples, emitted),
            Side::Right => self.insert_right(tuple, tuples, emitted),
        }
    }

    pub fn update(&mut self, side: Side, tuple: TupleId, tuples: &mut TupleArena, emitted: &mut Vec<NodeOperation>) -> Result<()> {
        match side {
            Side::Left => self.update_left(tuple, tuples, emitted),
            Side::Right => self.update_right(tuple, tuples, emitted),
        }
    }

    pub fn retract(&mut self, side: Side, tuple: TupleId, tuples: &mut TupleArena, emitted: &mut Vec<NodeOperation>) -> Result<()> {
        match side {
            Side::Left => self.retract_left(tuple, tuples, emitted),
            Side::Right => self.retract_right(tuple, tuples, emitted),
        }
    }

    fn insert_left(&mut self, tuple: TupleId, tuples: &mut TupleArena, emitted: &mut Vec<NodeOperation>) -> Result<()> {
        ensure_empty(tuples, tuple, self.left_slots.counter, "exists")?;
        let keys = self.keys_of(Side::Left, tuples.get(tuple)?)?;
        let id = CounterId(self.counters.insert(Counter { left: tuple, count: 0 }));
        let count = self.count_matches(id, tuple, &keys, tuples)?;
        self.counter_mut(id)?.count = count;
        let handle = self.left_index.put(&keys, id)?;
        tuples.put_slot(tuple, self.left_slots.keys, StoreEntry::Keys(keys))?;
        tuples.put_slot(tuple, self.left_slots.handle, StoreEntry::Handle(handle))?;
        tuples.put_slot(tuple, self.left_slots.counter, StoreEntry::Counter(id))?;
        if self.passes(count) {
            lifecycle::forward(NodeOperation::Insert, tuple, &self.children, emitted);
        }
        Ok(())
    }

    /// Recounts from scratch: the left tuple itself changed, so no earlier
    /// increment can be trusted for it.
    fn update_left(&mut self, tuple: TupleId, tuples: &mut TupleArena, emitted: &mut Vec<NodeOperation>) -> Result<()> {
        let keys = self.keys_of(Side::Left, tuples.get(tuple)?)?;
        let id = self.left_counter(tuple, tuples)?;
        let old_keys = self.stored_keys(tuple, self.left_slots.keys, tuples)?;
        let was = self.passes(self.counter(id)?.count);

        if keys != old_keys {
            let slots = JoinSlots {
                keys: self.left_slots.keys,
                handle: self.left_slots.handle,
            };
            let (old_keys, handle) = self.take_keys_and_handle(tuple, slots, tuples)?;
            self.left_index.remove(&old_keys, &handle)?;
            let handle = self.left_index.put(&keys, id)?;
            tuples.put_slot(tuple, self.left_slots.handle, StoreEntry::Handle(handle))?;
        }
        let count = if keys != old_keys || self.filter.is_some() {
            self.count_matches(id, tuple, &keys, tuples)?
        } else {
            self.counter(id)?.count
        };
        self.counter_mut(id)?.count = count;
        tuples.put_slot(tuple, self.left_slots.keys, StoreEntry::Keys(keys))?;
        self.emit_transition(tuple, was, self.passes(count), emitted);
        Ok(())
    }

    fn retract_left(&mut self, tuple: TupleId, tuples: &mut TupleArena, emitted: &mut Vec<NodeOperation>) -> Result<()> {
        let id = match tuples.take_slot(tuple, self.left_slots.counter)? {
            StoreEntry::Counter(id) => id,
            other => return Err(unexpected_slot("exists", tuple, "counter", &other)),
        };
        let slots = JoinSlots {
            keys: self.left_slots.keys,
            handle: self.left_slots.handle,
        };
        let (keys, handle) = self.take_keys_and_handle(tuple, slots, tuples)?;
        self.left_index.remove(&keys, &handle)?;
        self.untrack_counter(id);
        let counter = self
            .counters
            .remove(id.0)
            .ok_or_else(|| ScorenetError::corruption(format!("exists counter {:?} removed twice", id.0)))?;
        if self.passes(counter.count) {
            lifecycle::forward(NodeOperation::Retract, tuple, &self.children, emitted);
        }
        Ok(())
    }

    /// Applies count deltas for one right event and emits boundary crossings
    /// in the order the counters were first touched.
    fn apply_deltas(&mut self, deltas: Vec<(CounterId, isize)>, emitted: &mut Vec<NodeOperation>) -> Result<()> {
        let mut touched: Vec<(CounterId, bool)> = Vec::new();
        let mut seen = FxHashSet::default();
        for (id, delta) in deltas {
            let passes_before = self.passes(self.counter(id)?.count);
            if seen.insert(id) {
                touched.push((id, passes_before));
            }
            let counter = self.counter_mut(id)?;
            counter.count = if delta >= 0 {
                counter.count + delta as usize
            } else {
                counter.count.checked_sub(delta.unsigned_abs()).ok_or_else(|| {
                    ScorenetError::corruption(format!("exists counter of {:?} dropped below zero", counter.left.0))
                })?
            };
        }
        for (id, was) in touched {
            let counter = self.counter(id)?;
            let now = self.passes(counter.count);
            if was != now {
                let left = counter.left;
                self.emit_transition(left, was, now, emitted);
            }
        }
        Ok(())
    }

    /// Counters a newly filed right tuple increments.
    fn increments(&mut self, right: TupleId, keys: &IndexKeys, tuples: &TupleArena) -> Result<Vec<(CounterId, isize)>> {
        let mut deltas = Vec::new();
        for id in self.left_index.matches(keys) {
            let left = self.counter(id)?.left;
            if self.filter.is_none() {
                deltas.push((id, 1));
            } else if self.accepts(left, right, tuples)? {
                self.track(id, right);
                deltas.push((id, 1));
            }
        }
        Ok(deltas)
    }

    /// Counters a right tuple previously incremented.
    fn decrements(&mut self, right: TupleId, keys: &IndexKeys) -> Vec<(CounterId, isize)> {
        if self.filter.is_none() {
            return self.left_index.matches(keys).into_iter().map(|id| (id, -1)).collect();
        }
        let counted: Vec<CounterId> = self
            .counted_by_right
            .get(&right)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        for id in &counted {
            self.untrack(*id, right);
        }
        counted.into_iter().map(|id| (id, -1)).collect()
    }

    fn insert_right(&mut self, tuple: TupleId, tuples: &mut TupleArena, emitted: &mut Vec<NodeOperation>) -> Result<()> {
        ensure_empty(tuples, tuple, self.right_slots.keys, "exists")?;
        let keys = self.keys_of(Side::Right, tuples.get(tuple)?)?;
        let handle = self.right_index.put(&keys, tuple)?;
        let deltas = self.increments(tuple, &keys, tuples)?;
        tuples.put_slot(tuple, self.right_slots.keys, StoreEntry::Keys(keys))?;
        tuples.put_slot(tuple, self.right_slots.handle, StoreEntry::Handle(handle))?;
        self.apply_deltas(deltas, emitted)
    }

    fn update_right(&mut self, tuple: TupleId, tuples: &mut TupleArena, emitted: &mut Vec<NodeOperation>) -> Result<()> {
        let keys = self.keys_of(Side::Right, tuples.get(tuple)?)?;
        let old_keys = self.stored_keys(tuple, self.right_slots.keys, tuples)?;
        if keys == old_keys {
            if self.filter.is_none() {
                return Ok(());
            }
            let mut deltas = Vec::new();
            for id in self.left_index.matches(&keys) {
                let left = self.counter(id)?.left;
                let counted = self
                    .counted_by_counter
                    .get(&id)
                    .map_or(false, |set| set.contains(&tuple));
                match (counted, self.accepts(left, tuple, tuples)?) {
                    (true, false) => {
                        self.untrack(id, tuple);
                        deltas.push((id, -1));
                    }
                    (false, true) => {
                        self.track(id, tuple);
                        deltas.push((id, 1));
                    }
                    _ => {}
                }
            }
            return self.apply_deltas(deltas, emitted);
        }

        let (old_keys, handle) = self.take_keys_and_handle(tuple, self.right_slots, tuples)?;
        self.right_index.remove(&old_keys, &handle)?;
        let mut deltas = self.decrements(tuple, &old_keys);
        let handle = self.right_index.put(&keys, tuple)?;
        deltas.extend(self.increments(tuple, &keys, tuples)?);
        tuples.put_slot(tuple, self.right_slots.keys, StoreEntry::Keys(keys))?;
        tuples.put_slot(tuple, self.right_slots.handle, StoreEntry::Handle(handle))?;
        self.apply_deltas(deltas, emitted)
    }

    fn retract_right(&mut self, tuple: TupleId, tuples: &mut TupleArena, emitted: &mut Vec<NodeOperation>) -> Result<()> {
        let (keys, handle) = self.take_keys_and_handle(tuple, self.right_slots, tuples)?;
        self.right_index.remove(&keys, &handle)?;
        let deltas = self.decrements(tuple, &keys);
        self.apply_deltas(deltas, emitted)
    }

    /// Number of left tuples currently passed to the children.
    pub fn passing_count(&self) -> usize {
        self.counters.iter().filter(|(_, c)| self.passes(c.count)).count()
    }

    pub fn check_consistency(&self, tuples: &TupleArena) -> Result<()> {
        for (index, counter) in self.counters.iter() {
            let expected = match &self.filter {
                Some(_) => self
                    .counted_by_counter
                    .get(&CounterId(index))
                    .map_or(0, FxHashSet::len),
                None => {
                    let keys = self.stored_keys(counter.left, self.left_slots.keys, tuples)?;
                    self.right_index.size(&keys)
                }
            };
            if expected != counter.count {
                return Err(ScorenetError::consistency_violation(format!(
                    "exists counter of {:?} holds {} but {} matches are live",
                    counter.left.0, counter.count, expected
                )));
            }
        }
        if self.left_index.len() != self.counters.len() {
            return Err(ScorenetError::consistency_violation(format!(
                "exists node has {} counters but {} indexed left tuples",
                self.counters.len(),
                self.left_index.len()
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for IfExistsNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IfExistsNode")
            .field("should_exist", &self.should_exist)
            .field("joiners", &self.joiners)
            .field("filter", &self.filter.as_ref().map(|_| "<function>"))
            .field("counters", &self.counters.len())
            .field("right_size", &self.right_index.len())
            .field("children", &self.children)
            .finish()
    }
}
