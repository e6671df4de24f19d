//arena.rs
use crate::fact::Facts;
use crate::nodes::NodeData;
use crate::scorer::ScoreSink;
use crate::state::TupleState;
use crate::tuple::{StoreEntry, Tuple};
use crate::{ResourceLimits, Result, ScorenetError};
use generational_arena::{Arena, Index};
use slotmap::{DefaultKey, SlotMap};
use tracing::{debug, trace};

pub type NodeId = DefaultKey;

/// Generation-checked reference to a tuple in the [`TupleArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TupleId(pub(crate) Index);

impl TupleId {
    #[inline]
    pub fn index(&self) -> Index {
        self.0
    }
}

/// Which input of a node an event arrives on. Single-input nodes only use `Left`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Left,
    Right,
}

/// One downstream listener of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChildLink {
    pub node: NodeId,
    pub side: Side,
}

impl ChildLink {
    pub fn left(node: NodeId) -> Self {
        Self { node, side: Side::Left }
    }

    pub fn right(node: NodeId) -> Self {
        Self { node, side: Side::Right }
    }
}

/// A unit of propagation work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeOperation {
    Insert(ChildLink, TupleId),
    Update(ChildLink, TupleId),
    Retract(ChildLink, TupleId),
    /// All children have seen the insert/update of an owned tuple.
    Settle(TupleId),
    /// All children have seen the retract of an owned tuple; free it.
    Release(TupleId),
}

/// Storage for every live tuple of one session.
pub struct TupleArena {
    arena: Arena<Tuple>,
    max_tuples: usize,
}

impl TupleArena {
    pub fn new() -> Self {
        Self::with_limits(&ResourceLimits::default())
    }

    pub fn with_limits(limits: &ResourceLimits) -> Self {
        Self {
            arena: Arena::new(),
            max_tuples: limits.max_tuples,
        }
    }

    /// Allocates a tuple in state `Creating` with an empty store of `store_size` slots.
    pub fn acquire(&mut self, facts: Facts, store_size: usize) -> Result<TupleId> {
        let current_count = self.arena.len();
        if current_count >= self.max_tuples {
            return Err(ScorenetError::resource_limit(
                "max_tuples",
                format!("Current: {}, Limit: {}", current_count, self.max_tuples),
            ));
        }
        Ok(TupleId(self.arena.insert(Tuple::new(facts, store_size))))
    }

    pub fn get(&self, id: TupleId) -> Result<&Tuple> {
        self.arena
            .get(id.0)
            .ok_or_else(|| ScorenetError::invalid_index(format!("tuple {:?} is not live", id.0)))
    }

    pub fn get_mut(&mut self, id: TupleId) -> Result<&mut Tuple> {
        self.arena
            .get_mut(id.0)
            .ok_or_else(|| ScorenetError::invalid_index(format!("tuple {:?} is not live", id.0)))
    }

    pub fn contains(&self, id: TupleId) -> bool {
        self.arena.contains(id.0)
    }

    pub fn release(&mut self, id: TupleId) -> Result<Tuple> {
        let mut tuple = self.arena.remove(id.0).ok_or_else(|| {
            ScorenetError::corruption(format!("tuple {:?} released twice", id.0))
        })?;
        tuple.state = TupleState::Dead;
        Ok(tuple)
    }

    #[inline]
    pub fn state(&self, id: TupleId) -> Result<TupleState> {
        Ok(self.get(id)?.state)
    }

    #[inline]
    pub fn set_state(&mut self, id: TupleId, state: TupleState) -> Result<()> {
        self.get_mut(id)?.state = state;
        Ok(())
    }

    pub fn slot(&self, id: TupleId, slot: usize) -> Result<&StoreEntry> {
        let tuple = self.get(id)?;
        let size = tuple.store_size();
        tuple.slot(slot).ok_or_else(|| slot_out_of_range(slot, size))
    }

    /// Takes the entry out of a slot, leaving it empty.
    pub fn take_slot(&mut self, id: TupleId, slot: usize) -> Result<StoreEntry> {
        let tuple = self.get_mut(id)?;
        let size = tuple.store_size();
        tuple
            .slot_mut(slot)
            .map(std::mem::take)
            .ok_or_else(|| slot_out_of_range(slot, size))
    }

    pub fn put_slot(&mut self, id: TupleId, slot: usize, entry: StoreEntry) -> Result<()> {
        let tuple = self.get_mut(id)?;
        let size = tuple.store_size();
        let target = tuple.slot_mut(slot).ok_or_else(|| slot_out_of_range(slot, size))?;
        *target = entry;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (TupleId, &Tuple)> {
        self.arena.iter().map(|(index, tuple)| (TupleId(index), tuple))
    }

    /// Reports tuples left in a transitional state once propagation is quiet.
    #[cfg(debug_assertions)]
    pub fn check_for_leaks(&self) -> Result<()> {
        let stuck: Vec<_> = self
            .arena
            .iter()
            .filter(|(_, t)| t.state != TupleState::Ok)
            .map(|(i, t)| format!("{:?}={:?}", i, t.state))
            .collect();
        if stuck.is_empty() {
            Ok(())
        } else {
            Err(ScorenetError::consistency_violation(format!(
                "{} tuples not settled: {}",
                stuck.len(),
                stuck.join(", ")
            )))
        }
    }
}

impl Default for TupleArena {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TupleArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TupleArena")
            .field("live_tuples", &self.arena.len())
            .field("max_tuples", &self.max_tuples)
            .finish()
    }
}

fn slot_out_of_range(slot: usize, size: usize) -> ScorenetError {
    ScorenetError::corruption(format!(
        "store slot {} out of range for store of size {}",
        slot, size
    ))
}

/// Counters reported by one propagation run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PropagationStats {
    pub steps: usize,
    pub released: usize,
}

/// The runtime node graph of one session.
#[derive(Debug, Default)]
pub struct NodeArena {
    nodes: SlotMap<NodeId, NodeData>,
}

impl NodeArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_node(&mut self, node: NodeData) -> NodeId {
        self.nodes.insert(node)
    }

    pub fn get_node(&self, id: NodeId) -> Option<&NodeData> {
        self.nodes.get(id)
    }

    pub fn get_node_mut(&mut self, id: NodeId) -> Option<&mut NodeData> {
        self.nodes.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &NodeData)> {
        self.nodes.iter()
    }

    /// Runs `initial` and everything it triggers to completion, depth-first.
    ///
    /// Each node appends its emitted operations in natural order; they are
    /// pushed onto the work stack reversed so the first child's whole cascade
    /// completes before the second child sees the event. Released tuples are
    /// freed once the cascade is over. On error the remaining work is
    /// dropped and tuples whose insert never settled are marked `Aborting`.
    pub fn execute_operations(
        &mut self,
        initial: Vec<NodeOperation>,
        tuples: &mut TupleArena,
        scores: &mut dyn ScoreSink,
        limits: &ResourceLimits,
    ) -> Result<PropagationStats> {
        let mut stack: Vec<NodeOperation> = initial.into_iter().rev().collect();
        let mut emitted: Vec<NodeOperation> = Vec::new();
        let mut to_release = Vec::new();
        let mut stats = PropagationStats::default();

        while let Some(operation) = stack.pop() {
            stats.steps += 1;
            if let Err(e) = limits.check_operation_limit(stats.steps) {
                abort_pending(&stack, tuples);
                return Err(e);
            }
            trace!(?operation, "propagate");
            if let Err(e) = self.dispatch(operation, tuples, scores, &mut emitted, &mut to_release) {
                debug!(error = %e, pending = stack.len(), "propagation aborted");
                abort_pending(&stack, tuples);
                return Err(e);
            }
            stack.extend(emitted.drain(..).rev());
        }

        for id in to_release {
            tuples.release(id)?;
            stats.released += 1;
        }
        Ok(stats)
    }

    fn dispatch(
        &mut self,
        operation: NodeOperation,
        tuples: &mut TupleArena,
        scores: &mut dyn ScoreSink,
        emitted: &mut Vec<NodeOperation>,
        to_release: &mut Vec<TupleId>,
    ) -> Result<()> {
        match operation {
            NodeOperation::Insert(link, tuple) => self
                .node_mut(link.node)?
                .insert_collect_ops(link.side, tuple, tuples, scores, emitted),
            NodeOperation::Update(link, tuple) => self
                .node_mut(link.node)?
                .update_collect_ops(link.side, tuple, tuples, scores, emitted),
            NodeOperation::Retract(link, tuple) => self
                .node_mut(link.node)?
                .retract_collect_ops(link.side, tuple, tuples, scores, emitted),
            NodeOperation::Settle(tuple) => match tuples.state(tuple)? {
                TupleState::Creating | TupleState::Updating => {
                    tuples.set_state(tuple, TupleState::Ok)
                }
                other => Err(ScorenetError::corruption(format!(
                    "cannot settle tuple {:?} in state {:?}",
                    tuple.0, other
                ))),
            },
            NodeOperation::Release(tuple) => match tuples.state(tuple)? {
                TupleState::Dying | TupleState::Aborting => {
                    tuples.set_state(tuple, TupleState::Dead)?;
                    to_release.push(tuple);
                    Ok(())
                }
                other => Err(ScorenetError::corruption(format!(
                    "cannot release tuple {:?} in state {:?}",
                    tuple.0, other
                ))),
            },
        }
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut NodeData> {
        self.nodes
            .get_mut(id)
            .ok_or_else(|| ScorenetError::invalid_index(format!("node {:?} does not exist", id)))
    }
}

fn abort_pending(stack: &[NodeOperation], tuples: &mut TupleArena) {
    for operation in stack {
        if let NodeOperation::Settle(tuple) = operation {
            if matches!(tuples.state(*tuple), Ok(TupleState::Creating)) {
                let _ = tuples.set_state(*tuple, TupleState::Aborting);
            }
        }
    }
}
