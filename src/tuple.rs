// tuple.rs - Tuple data model
//! The unit of data flowing through the network.
//!
//! A [`Tuple`] carries one to four facts plus a store of per-node slots. Slot
//! indices are handed out by the network builder; each slot has exactly one
//! writing node, which keeps its private per-tuple state there.

use crate::arena::TupleId;
use crate::collectors::UndoReceipt;
use crate::exists_node::CounterId;
use crate::fact::{describe_facts, Fact, Facts};
use crate::group_node::GroupId;
use crate::indexer::IndexHandle;
use crate::key::IndexKeys;
use crate::scorer::ScoreUndo;
use crate::state::TupleState;
use smallvec::SmallVec;
use std::rc::Rc;

/// Largest number of facts a tuple may carry.
pub const MAX_ARITY: usize = 4;

/// Private per-tuple state written by the node owning a slot.
#[derive(Debug, Clone, Default)]
pub enum StoreEntry {
    #[default]
    Empty,
    /// Filter outcome of the last insert/update.
    Passed(bool),
    /// The single output tuple derived from this tuple.
    Tuple(TupleId),
    /// The output tuples derived from this tuple (flatten, join).
    Tuples(SmallVec<[TupleId; 4]>),
    /// Extracted index keys at insert time.
    Keys(IndexKeys),
    /// Removal handle of this tuple's indexer entry.
    Handle(IndexHandle),
    /// Existence counter owned by an if-exists node.
    Counter(CounterId),
    /// Group membership and the undo receipts of each collector.
    Group(GroupId, SmallVec<[UndoReceipt; 4]>),
    /// Undo of a score impact.
    Score(ScoreUndo),
}

impl StoreEntry {
    pub fn is_empty(&self) -> bool {
        matches!(self, StoreEntry::Empty)
    }

    /// Short name of the entry kind, used in corruption messages.
    pub fn kind(&self) -> &'static str {
        match self {
            StoreEntry::Empty => "empty",
            StoreEntry::Passed(_) => "passed",
            StoreEntry::Tuple(_) => "tuple",
            StoreEntry::Tuples(_) => "tuples",
            StoreEntry::Keys(_) => "keys",
            StoreEntry::Handle(_) => "handle",
            StoreEntry::Counter(_) => "counter",
            StoreEntry::Group(..) => "group",
            StoreEntry::Score(_) => "score",
        }
    }
}

/// A propagated record of 1..=4 facts.
///
/// Tuples are identified by their arena id, never by value: two tuples with
/// equal facts are distinct propagation entities.
#[derive(Debug)]
pub struct Tuple {
    facts: Facts,
    store: Vec<StoreEntry>,
    pub(crate) state: TupleState,
}

impl Tuple {
    pub fn new(facts: Facts, store_size: usize) -> Self {
        Self {
            facts,
            store: vec![StoreEntry::Empty; store_size],
            state: TupleState::Creating,
        }
    }

    #[inline]
    pub fn arity(&self) -> usize {
        self.facts.len()
    }

    #[inline]
    pub fn facts(&self) -> &[Rc<dyn Fact>] {
        &self.facts
    }

    #[inline]
    pub fn fact(&self, index: usize) -> Option<&Rc<dyn Fact>> {
        self.facts.get(index)
    }

    /// Typed access to the fact at `index`.
    #[inline]
    pub fn fact_as<T: Fact>(&self, index: usize) -> Option<&T> {
        self.facts.get(index)?.as_any().downcast_ref::<T>()
    }

    #[inline]
    pub fn last_fact(&self) -> Option<&Rc<dyn Fact>> {
        self.facts.last()
    }

    #[inline]
    pub fn state(&self) -> TupleState {
        self.state
    }

    pub fn store_size(&self) -> usize {
        self.store.len()
    }

    pub(crate) fn set_facts(&mut self, facts: Facts) {
        self.facts = facts;
    }

    pub(crate) fn slot(&self, slot: usize) -> Option<&StoreEntry> {
        self.store.get(slot)
    }

    pub(crate) fn slot_mut(&mut self, slot: usize) -> Option<&mut StoreEntry> {
        self.store.get_mut(slot)
    }

    pub fn describe(&self) -> String {
        describe_facts(&self.facts)
    }
}

/// Concatenates the facts of two tuples (join output).
pub fn concat_facts(left: &[Rc<dyn Fact>], right: &[Rc<dyn Fact>]) -> Facts {
    left.iter().chain(right).cloned().collect()
}
