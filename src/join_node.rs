// join_node.rs - Indexed two-input join
//! Joins left and right tuples whose joiner keys match and that pass the
//! optional residual filter, producing one output tuple per matching pair.
//!
//! Each side files its tuples in its own [`Indexer`] under its own keys and
//! looks up partners in the opposite indexer. The keys and index handle of a
//! tuple live in two slots of that tuple; the pairs and their output tuples
//! live in the node.

use crate::arena::{ChildLink, NodeOperation, Side, TupleArena, TupleId};
use crate::error::{Result, ScorenetError};
use crate::fact::Facts;
use crate::functions::{guarded, guarded_on, PairPredicate};
use crate::indexer::{IndexHandle, Indexer};
use crate::joiner::{extract_keys, indexer_levels, Joiner};
use crate::key::IndexKeys;
use crate::lifecycle;
use crate::nodes::{ensure_empty, unexpected_slot};
use crate::tuple::{concat_facts, StoreEntry, Tuple};
use rustc_hash::{FxHashMap, FxHashSet};
use std::fmt;

/// Store slots a join reserves on the tuples of one input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinSlots {
    pub keys: usize,
    pub handle: usize,
}

struct JoinInput {
    index: Indexer<TupleId>,
    slots: JoinSlots,
    partners: FxHashMap<TupleId, FxHashSet<TupleId>>,
}

impl JoinInput {
    fn new(joiners: &[Joiner], left_side: bool, slots: JoinSlots) -> Self {
        Self {
            index: Indexer::new(indexer_levels(joiners, left_side)),
            slots,
            partners: FxHashMap::default(),
        }
    }
}

pub struct JoinNode {
    pub joiners: Vec<Joiner>,
    pub filter: Option<PairPredicate>,
    left: JoinInput,
    right: JoinInput,
    /// Output tuple of every live (left, right) pair.
    pairs: FxHashMap<(TupleId, TupleId), TupleId>,
    pub children: Vec<ChildLink>,
    pub out_store_size: usize,
}

/// Orders a (this side, other side) pair as (left, right).
fn pair_key(side: Side, this: TupleId, other: TupleId) -> (TupleId, TupleId) {
    match side {
        Side::Left => (this, other),
        Side::Right => (other, this),
    }
}

impl JoinNode {
    pub fn new(
        joiners: Vec<Joiner>,
        filter: Option<PairPredicate>,
        left_slots: JoinSlots,
        right_slots: JoinSlots,
        out_store_size: usize,
    ) -> Self {
        let left = JoinInput::new(&joiners, true, left_slots);
        let right = JoinInput::new(&joiners, false, right_slots);
        Self {
            joiners,
            filter,
            left,
            right,
            pairs: FxHashMap::default(),
            children: Vec::new(),
            out_store_size,
        }
    }

    /// Number of live joined pairs.
    pub fn pair_count(&self) -> usize {
        self.pairs.len()
    }

    fn input(&self, side: Side) -> &JoinInput {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }

    fn keys_of(&self, side: Side, tuple: &Tuple) -> Result<IndexKeys> {
        let left_side = side == Side::Left;
        guarded_on("join key extraction", tuple, || extract_keys(&self.joiners, left_side, tuple))
    }

    fn accepts(&self, pair: (TupleId, TupleId), tuples: &TupleArena) -> Result<bool> {
        let filter = match &self.filter {
            Some(filter) => filter,
            None => return Ok(true),
        };
        let left = tuples.get(pair.0)?;
        let right = tuples.get(pair.1)?;
        guarded(
            "join filter",
            || format!("{} x {}", left.describe(), right.describe()),
            || filter(left, right),
        )
    }

    fn joined_facts(pair: (TupleId, TupleId), tuples: &TupleArena) -> Result<Facts> {
        Ok(concat_facts(tuples.get(pair.0)?.facts(), tuples.get(pair.1)?.facts()))
    }

    fn stored_keys(&self, side: Side, tuple: TupleId, tuples: &TupleArena) -> Result<IndexKeys> {
        match tuples.slot(tuple, self.input(side).slots.keys)? {
            StoreEntry::Keys(keys) => Ok(keys.clone()),
            other => Err(unexpected_slot("join", tuple, "keys", other)),
        }
    }

    fn take_handle(&self, side: Side, tuple: TupleId, tuples: &mut TupleArena) -> Result<IndexHandle> {
        match tuples.take_slot(tuple, self.input(side).slots.handle)? {
            StoreEntry::Handle(handle) => Ok(handle),
            other => Err(unexpected_slot("join", tuple, "handle", &other)),
        }
    }

    /// Candidate partners of a tuple with `keys` on `side`, in index order.
    fn candidates(&mut self, side: Side, keys: &IndexKeys) -> Vec<TupleId> {
        match side {
            Side::Left => self.right.index.matches(keys),
            Side::Right => self.left.index.matches(keys),
        }
    }

    fn link(&mut self, pair: (TupleId, TupleId), out: TupleId) {
        self.pairs.insert(pair, out);
        self.left.partners.entry(pair.0).or_default().insert(pair.1);
        self.right.partners.entry(pair.1).or_default().insert(pair.0);
    }

    fn unlink(&mut self, pair: (TupleId, TupleId)) -> Result<TupleId> {
        if let Some(set) = self.left.partners.get_mut(&pair.0) {
            set.remove(&pair.1);
            if set.is_empty() {
                self.left.partners.remove(&pair.0);
            }
        }
        if let Some(set) = self.right.partners.get_mut(&pair.1) {
            set.remove(&pair.0);
            if set.is_empty() {
                self.right.partners.remove(&pair.1);
            }
        }
        self.pairs.remove(&pair).ok_or_else(|| {
            ScorenetError::corruption(format!("join pair ({:?}, {:?}) is not live", pair.0 .0, pair.1 .0))
        })
    }

    fn create_pair(&mut self, pair: (TupleId, TupleId), tuples: &mut TupleArena, emitted: &mut Vec<NodeOperation>) -> Result<()> {
        let facts = Self::joined_facts(pair, tuples)?;
        let out = lifecycle::create_and_insert(facts, self.out_store_size, &self.children, tuples, emitted)?;
        self.link(pair, out);
        Ok(())
    }

    /// Files the tuple under `keys` and joins it with every accepted partner.
    fn attach(
        &mut self,
        side: Side,
        tuple: TupleId,
        keys: IndexKeys,
        tuples: &mut TupleArena,
        emitted: &mut Vec<NodeOperation>,
    ) -> Result<()> {
        let handle = match side {
            Side::Left => self.left.index.put(&keys, tuple)?,
            Side::Right => self.right.index.put(&keys, tuple)?,
        };
        for other in self.candidates(side, &keys) {
            let pair = pair_key(side, tuple, other);
            if self.accepts(pair, tuples)? {
                self.create_pair(pair, tuples, emitted)?;
            }
        }
        let slots = self.input(side).slots;
        tuples.put_slot(tuple, slots.keys, StoreEntry::Keys(keys))?;
        tuples.put_slot(tuple, slots.handle, StoreEntry::Handle(handle))
    }

    /// Removes the tuple from its index and retracts all its pairs.
    fn detach(&mut self, side: Side, tuple: TupleId, tuples: &mut TupleArena, emitted: &mut Vec<NodeOperation>) -> Result<()> {
        let keys = match tuples.take_slot(tuple, self.input(side).slots.keys)? {
            StoreEntry::Keys(keys) => keys,
            other => return Err(unexpected_slot("join", tuple, "keys", &other)),
        };
        let handle = self.take_handle(side, tuple, tuples)?;
        match side {
            Side::Left => self.left.index.remove(&keys, &handle)?,
            Side::Right => self.right.index.remove(&keys, &handle)?,
        };
        let partners: Vec<TupleId> = self
            .input(side)
            .partners
            .get(&tuple)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        for other in partners {
            let out = self.unlink(pair_key(side, tuple, other))?;
            lifecycle::retract(out, &self.children, tuples, emitted)?;
        }
        Ok(())
    }

    pub fn insert(&mut self, side: Side, tuple: TupleId, tuples: &mut TupleArena, emitted: &mut Vec<NodeOperation>) -> Result<()> {
        ensure_empty(tuples, tuple, self.input(side).slots.keys, "join")?;
        let keys = self.keys_of(side, tuples.get(tuple)?)?;
        self.attach(side, tuple, keys, tuples, emitted)
    }

    /// With unchanged keys only the residual filter is re-evaluated per
    /// candidate pair; changed keys re-file the tuple and rejoin it.
    pub fn update(&mut self, side: Side, tuple: TupleId, tuples: &mut TupleArena, emitted: &mut Vec<NodeOperation>) -> Result<()> {
        let keys = self.keys_of(side, tuples.get(tuple)?)?;
        let old_keys = self.stored_keys(side, tuple, tuples)?;
        if keys != old_keys {
            self.detach(side, tuple, tuples, emitted)?;
            return self.attach(side, tuple, keys, tuples, emitted);
        }
        for other in self.candidates(side, &keys) {
            let pair = pair_key(side, tuple, other);
            let accepted = self.accepts(pair, tuples)?;
            match (self.pairs.get(&pair).copied(), accepted) {
                (Some(out), true) => {
                    let facts = Self::joined_facts(pair, tuples)?;
                    lifecycle::update_if_different(out, facts, &self.children, tuples, emitted)?;
                }
                (Some(_), false) => {
                    let out = self.unlink(pair)?;
                    lifecycle::retract(out, &self.children, tuples, emitted)?;
                }
                (None, true) => self.create_pair(pair, tuples, emitted)?,
                (None, false) => {}
            }
        }
        Ok(())
    }

    pub fn retract(&mut self, side: Side, tuple: TupleId, tuples: &mut TupleArena, emitted: &mut Vec<NodeOperation>) -> Result<()> {
        self.detach(side, tuple, tuples, emitted)
    }

    pub fn check_consistency(&self, tuples: &TupleArena) -> Result<()> {
        for (&(left, right), &out) in &self.pairs {
            if !tuples.contains(out) || !tuples.contains(left) || !tuples.contains(right) {
                return Err(ScorenetError::consistency_violation(format!(
                    "join pair ({:?}, {:?}) refers to a released tuple",
                    left.0, right.0
                )));
            }
        }
        for input in [&self.left, &self.right] {
            let linked: usize = input.partners.values().map(FxHashSet::len).sum();
            if linked != self.pairs.len() {
                return Err(ScorenetError::consistency_violation(format!(
                    "join has {} pairs but {} partner links",
                    self.pairs.len(),
                    linked
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for JoinNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinNode")
            .field("joiners", &self.joiners)
            .field("filter", &self.filter.as_ref().map(|_| "<function>"))
            .field("left_size", &self.left.index.len())
            .field("right_size", &self.right.index.len())
            .field("pairs", &self.pairs.len())
            .field("children", &self.children)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::joiner::Joiners;
    use crate::key::KeyValue;
    use crate::nodes::test_support::*;
    use std::rc::Rc;

    const LEFT: JoinSlots = JoinSlots { keys: 0, handle: 1 };
    const RIGHT: JoinSlots = JoinSlots { keys: 2, handle: 3 };

    fn first(t: &Tuple) -> KeyValue {
        KeyValue::Int(*t.fact_as::<i64>(0).unwrap())
    }

    fn node(joiners: Vec<Joiner>, filter: Option<PairPredicate>) -> JoinNode {
        let mut node = JoinNode::new(joiners, filter, LEFT, RIGHT, 0);
        node.children.push(child());
        node
    }

    #[test]
    fn test_equal_join_pairs_matching_keys() {
        let mut tuples = TupleArena::new();
        let mut join = node(vec![Joiners::equal(first, first)], None);
        let mut emitted = Vec::new();
        let a1 = settled(&mut tuples, &[1], 4);
        let a2 = settled(&mut tuples, &[2], 4);
        let b1 = settled(&mut tuples, &[1], 4);
        let b3 = settled(&mut tuples, &[3], 4);

        join.insert(Side::Left, a1, &mut tuples, &mut emitted).unwrap();
        join.insert(Side::Left, a2, &mut tuples, &mut emitted).unwrap();
        join.insert(Side::Right, b1, &mut tuples, &mut emitted).unwrap();
        join.insert(Side::Right, b3, &mut tuples, &mut emitted).unwrap();
        let outs = inserted(&emitted);
        assert_eq!(outs.len(), 1);
        assert_eq!(ints(&tuples, outs[0]), vec![1, 1]);
        settle_all(&mut tuples, &emitted);

        emitted.clear();
        join.retract(Side::Left, a1, &mut tuples, &mut emitted).unwrap();
        assert_eq!(retracted(&emitted), outs);
        settle_all(&mut tuples, &emitted);
        assert_eq!(join.pair_count(), 0);
        join.check_consistency(&tuples).unwrap();
    }

    #[test]
    fn test_key_change_rejoins() {
        let mut tuples = TupleArena::new();
        let mut join = node(vec![Joiners::less_than(first, first)], None);
        let mut emitted = Vec::new();
        let a = settled(&mut tuples, &[5], 4);
        let b2 = settled(&mut tuples, &[2], 4);
        let b7 = settled(&mut tuples, &[7], 4);
        join.insert(Side::Right, b2, &mut tuples, &mut emitted).unwrap();
        join.insert(Side::Right, b7, &mut tuples, &mut emitted).unwrap();
        join.insert(Side::Left, a, &mut tuples, &mut emitted).unwrap();
        let first_outs = inserted(&emitted);
        assert_eq!(first_outs.len(), 1);
        assert_eq!(ints(&tuples, first_outs[0]), vec![5, 7]);
        settle_all(&mut tuples, &emitted);

        emitted.clear();
        set_values(&mut tuples, a, &[1]);
        join.update(Side::Left, a, &mut tuples, &mut emitted).unwrap();
        assert_eq!(retracted(&emitted), first_outs);
        assert_eq!(inserted(&emitted).len(), 2);
        settle_all(&mut tuples, &emitted);
        assert_eq!(join.pair_count(), 2);
        join.check_consistency(&tuples).unwrap();
    }

    #[test]
    fn test_same_key_update_reevaluates_filter() {
        let mut tuples = TupleArena::new();
        let parity: PairPredicate = Rc::new(|l: &Tuple, r: &Tuple| {
            (l.fact_as::<i64>(1).unwrap() + r.fact_as::<i64>(1).unwrap()) % 2 == 0
        });
        let mut join = node(vec![Joiners::equal(first, first)], Some(parity));
        let mut emitted = Vec::new();
        let a = settled(&mut tuples, &[1, 2], 4);
        let b = settled(&mut tuples, &[1, 4], 4);
        join.insert(Side::Left, a, &mut tuples, &mut emitted).unwrap();
        join.insert(Side::Right, b, &mut tuples, &mut emitted).unwrap();
        let out = inserted(&emitted)[0];
        settle_all(&mut tuples, &emitted);

        emitted.clear();
        set_values(&mut tuples, b, &[1, 6]);
        join.update(Side::Right, b, &mut tuples, &mut emitted).unwrap();
        assert_eq!(updated(&emitted), vec![out]);
        assert_eq!(ints(&tuples, out), vec![1, 2, 1, 6]);
        settle_all(&mut tuples, &emitted);

        emitted.clear();
        set_values(&mut tuples, b, &[1, 5]);
        join.update(Side::Right, b, &mut tuples, &mut emitted).unwrap();
        assert_eq!(retracted(&emitted), vec![out]);
        settle_all(&mut tuples, &emitted);

        emitted.clear();
        set_values(&mut tuples, a, &[1, 3]);
        join.update(Side::Left, a, &mut tuples, &mut emitted).unwrap();
        assert_eq!(inserted(&emitted).len(), 1);
    }

    #[test]
    fn test_unindexed_join_is_cross_product() {
        let mut tuples = TupleArena::new();
        let mut join = node(Vec::new(), None);
        let mut emitted = Vec::new();
        for v in [1, 2] {
            let t = settled(&mut tuples, &[v], 4);
            join.insert(Side::Left, t, &mut tuples, &mut emitted).unwrap();
        }
        for v in [3, 4, 5] {
            let t = settled(&mut tuples, &[v], 4);
            join.insert(Side::Right, t, &mut tuples, &mut emitted).unwrap();
        }
        assert_eq!(inserted(&emitted).len(), 6);
        assert_eq!(join.pair_count(), 6);
    }

    #[test]
    fn test_double_retract_is_corruption() {
        let mut tuples = TupleArena::new();
        let mut join = node(vec![Joiners::equal(first, first)], None);
        let mut emitted = Vec::new();
        let a = settled(&mut tuples, &[1], 4);
        join.insert(Side::Left, a, &mut tuples, &mut emitted).unwrap();
        join.retract(Side::Left, a, &mut tuples, &mut emitted).unwrap();
        assert!(join
            .retract(Side::Left, a, &mut tuples, &mut emitted)
            .unwrap_err()
            .is_corruption());
    }
}
