// group_node.rs - Grouping and aggregation
use crate::arena::{ChildLink, NodeOperation, TupleArena, TupleId};
use crate::collectors::{Collector, CollectorSupplier, UndoReceipt};
use crate::error::{Result, ScorenetError};
use crate::fact::{FactKey, Facts};
use crate::functions::{guarded, guarded_on, GroupKeyFn};
use crate::lifecycle;
use crate::nodes::{ensure_empty, unexpected_slot};
use crate::tuple::{StoreEntry, Tuple};
use generational_arena::{Arena, Index};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::fmt;

/// Reference to one group of a group node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupId(pub(crate) Index);

type GroupKey = SmallVec<[FactKey; 4]>;
type Receipts = SmallVec<[UndoReceipt; 4]>;

struct GroupEntry {
    key: GroupKey,
    collectors: Vec<Box<dyn Collector>>,
    /// Number of source tuples currently accumulated.
    count: usize,
    /// The group's output tuple.
    out: TupleId,
}

/// Groups input tuples by 0 to 4 key functions and aggregates each group
/// with 0 to 4 collectors. The output tuple of a group carries the key facts
/// followed by the collector results; it exists while the group has members.
pub struct GroupNode {
    pub keys: Vec<GroupKeyFn>,
    pub collectors: Vec<CollectorSupplier>,
    pub slot: usize,
    groups: Arena<GroupEntry>,
    by_key: FxHashMap<GroupKey, GroupId>,
    pub children: Vec<ChildLink>,
    pub out_store_size: usize,
}

impl GroupNode {
    pub fn new(keys: Vec<GroupKeyFn>, collectors: Vec<CollectorSupplier>, slot: usize, out_store_size: usize) -> Self {
        Self {
            keys,
            collectors,
            slot,
            groups: Arena::new(),
            by_key: FxHashMap::default(),
            children: Vec::new(),
            out_store_size,
        }
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    fn key_of(&self, tuple: &Tuple) -> Result<GroupKey> {
        self.keys
            .iter()
            .map(|key| guarded_on("group key", tuple, || key(tuple)).map(FactKey::new))
            .collect()
    }

    fn entry(&self, id: GroupId) -> Result<&GroupEntry> {
        self.groups
            .get(id.0)
            .ok_or_else(|| ScorenetError::corruption(format!("group {:?} is not live", id.0)))
    }

    fn entry_mut(&mut self, id: GroupId) -> Result<&mut GroupEntry> {
        self.groups
            .get_mut(id.0)
            .ok_or_else(|| ScorenetError::corruption(format!("group {:?} is not live", id.0)))
    }

    fn output_facts(entry: &GroupEntry) -> Facts {
        entry
            .key
            .iter()
            .map(|key| key.fact().clone())
            .chain(entry.collectors.iter().map(|c| c.result_as_fact()))
            .collect()
    }

    fn accumulate(entry: &mut GroupEntry, tuple: &Tuple) -> Result<Receipts> {
        entry
            .collectors
            .iter_mut()
            .map(|collector| collector.insert(tuple))
            .collect()
    }

    fn release(entry: &mut GroupEntry, receipts: Receipts) -> Result<()> {
        if receipts.len() != entry.collectors.len() {
            return Err(ScorenetError::corruption(format!(
                "group holds {} collectors but {} receipts were stored",
                entry.collectors.len(),
                receipts.len()
            )));
        }
        for (collector, receipt) in entry.collectors.iter_mut().zip(receipts) {
            collector.remove(receipt)?;
        }
        entry.count -= 1;
        Ok(())
    }

    fn new_collectors(&self) -> Result<Vec<Box<dyn Collector>>> {
        self.collectors
            .iter()
            .map(|supplier| guarded("collector supplier", String::new, || supplier()))
            .collect()
    }

    /// Adds a tuple to the group of `key`, creating the group and its output
    /// tuple when it is new.
    fn join_group(
        &mut self,
        tuple: TupleId,
        key: GroupKey,
        tuples: &mut TupleArena,
        emitted: &mut Vec<NodeOperation>,
    ) -> Result<()> {
        let source = tuples.get(tuple)?;
        let (id, receipts) = match self.by_key.get(&key).copied() {
            Some(id) => {
                let entry = self.entry_mut(id)?;
                let receipts = Self::accumulate(entry, source)?;
                entry.count += 1;
                (id, receipts)
            }
            None => {
                let collectors = self.new_collectors()?;
                let mut entry = GroupEntry {
                    key: key.clone(),
                    collectors,
                    count: 1,
                    out: tuple,
                };
                let receipts = Self::accumulate(&mut entry, source)?;
                let facts = Self::output_facts(&entry);
                entry.out = lifecycle::create_and_insert(facts, self.out_store_size, &self.children, tuples, emitted)?;
                let id = GroupId(self.groups.insert(entry));
                self.by_key.insert(key, id);
                tuples.put_slot(tuple, self.slot, StoreEntry::Group(id, receipts))?;
                return Ok(());
            }
        };
        tuples.put_slot(tuple, self.slot, StoreEntry::Group(id, receipts))?;
        self.refresh(id, tuples, emitted)
    }

    /// Removes a tuple's contribution from its group, retracting the group
    /// when it becomes empty.
    fn leave_group(
        &mut self,
        id: GroupId,
        receipts: Receipts,
        tuples: &mut TupleArena,
        emitted: &mut Vec<NodeOperation>,
    ) -> Result<()> {
        let entry = self.entry_mut(id)?;
        Self::release(entry, receipts)?;
        if entry.count > 0 {
            return self.refresh(id, tuples, emitted);
        }
        let entry = self
            .groups
            .remove(id.0)
            .ok_or_else(|| ScorenetError::corruption(format!("group {:?} removed twice", id.0)))?;
        self.by_key.remove(&entry.key);
        lifecycle::retract(entry.out, &self.children, tuples, emitted)
    }

    fn refresh(&self, id: GroupId, tuples: &mut TupleArena, emitted: &mut Vec<NodeOperation>) -> Result<()> {
        let entry = self.entry(id)?;
        let facts = Self::output_facts(entry);
        lifecycle::update_if_different(entry.out, facts, &self.children, tuples, emitted)?;
        Ok(())
    }

    fn take_membership(&self, tuple: TupleId, tuples: &mut TupleArena) -> Result<(GroupId, Receipts)> {
        match tuples.take_slot(tuple, self.slot)? {
            StoreEntry::Group(id, receipts) => Ok((id, receipts)),
            other => Err(unexpected_slot("group", tuple, "group", &other)),
        }
    }

    pub fn insert(&mut self, tuple: TupleId, tuples: &mut TupleArena, emitted: &mut Vec<NodeOperation>) -> Result<()> {
        ensure_empty(tuples, tuple, self.slot, "group")?;
        let key = self.key_of(tuples.get(tuple)?)?;
        self.join_group(tuple, key, tuples, emitted)
    }

    /// A changed key moves the tuple to another group; otherwise its
    /// contribution is replaced in place.
    pub fn update(&mut self, tuple: TupleId, tuples: &mut TupleArena, emitted: &mut Vec<NodeOperation>) -> Result<()> {
        let key = self.key_of(tuples.get(tuple)?)?;
        let (id, receipts) = self.take_membership(tuple, tuples)?;
        if self.entry(id)?.key != key {
            self.leave_group(id, receipts, tuples, emitted)?;
            return self.join_group(tuple, key, tuples, emitted);
        }
        let source = tuples.get(tuple)?;
        let entry = self.entry_mut(id)?;
        Self::release(entry, receipts)?;
        let receipts = Self::accumulate(entry, source)?;
        entry.count += 1;
        tuples.put_slot(tuple, self.slot, StoreEntry::Group(id, receipts))?;
        self.refresh(id, tuples, emitted)
    }

    pub fn retract(&mut self, tuple: TupleId, tuples: &mut TupleArena, emitted: &mut Vec<NodeOperation>) -> Result<()> {
        let (id, receipts) = self.take_membership(tuple, tuples)?;
        self.leave_group(id, receipts, tuples, emitted)
    }

    pub fn check_consistency(&self, tuples: &TupleArena) -> Result<()> {
        if self.by_key.len() != self.groups.len() {
            return Err(ScorenetError::consistency_violation(format!(
                "group node has {} groups but {} keys",
                self.groups.len(),
                self.by_key.len()
            )));
        }
        for (_, entry) in self.groups.iter() {
            if entry.count == 0 || !tuples.contains(entry.out) {
                return Err(ScorenetError::consistency_violation(format!(
                    "group {:?} is empty or lost its output tuple",
                    entry.key
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for GroupNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupNode")
            .field("keys", &self.keys.len())
            .field("collectors", &self.collectors.len())
            .field("slot", &self.slot)
            .field("groups", &self.groups.len())
            .field("children", &self.children)
            .finish()
    }
}
