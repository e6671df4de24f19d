// nodes.rs - Runtime node kinds and single-input nodes
use crate::arena::{ChildLink, NodeOperation, Side, TupleArena, TupleId};
use crate::error::{Result, ScorenetError};
use crate::exists_node::IfExistsNode;
use crate::fact::{Fact, Facts};
use crate::functions::{guarded_on, Flattener, Mapper, Predicate};
use crate::group_node::GroupNode;
use crate::join_node::JoinNode;
use crate::lifecycle;
use crate::scorer::{ScoreSink, ScorerNode};
use crate::state::TupleState;
use crate::tuple::{StoreEntry, Tuple};
use smallvec::{smallvec, SmallVec};
use std::any::TypeId;
use std::fmt;
use std::rc::Rc;

/// Every runtime node kind, dispatched by the executor.
#[derive(Debug)]
pub enum NodeData {
    From(FromNode),
    Filter(FilterNode),
    Map(MapNode),
    FlattenLast(FlattenLastNode),
    Concat(ConcatNode),
    Join(JoinNode),
    IfExists(IfExistsNode),
    Group(GroupNode),
    Scorer(ScorerNode),
}

impl NodeData {
    pub fn kind_name(&self) -> &'static str {
        match self {
            NodeData::From(_) => "From",
            NodeData::Filter(_) => "Filter",
            NodeData::Map(node) if node.expand => "Expand",
            NodeData::Map(_) => "Map",
            NodeData::FlattenLast(_) => "FlattenLast",
            NodeData::Concat(_) => "Concat",
            NodeData::Join(_) => "Join",
            NodeData::IfExists(node) if node.should_exist => "IfExists",
            NodeData::IfExists(_) => "IfNotExists",
            NodeData::Group(_) => "Group",
            NodeData::Scorer(_) => "Scorer",
        }
    }

    pub fn children(&self) -> &[ChildLink] {
        match self {
            NodeData::From(node) => &node.children,
            NodeData::Filter(node) => &node.children,
            NodeData::Map(node) => &node.children,
            NodeData::FlattenLast(node) => &node.children,
            NodeData::Concat(node) => &node.children,
            NodeData::Join(node) => &node.children,
            NodeData::IfExists(node) => &node.children,
            NodeData::Group(node) => &node.children,
            NodeData::Scorer(_) => &[],
        }
    }

    pub fn add_child(&mut self, child: ChildLink) -> Result<()> {
        let children = match self {
            NodeData::From(node) => &mut node.children,
            NodeData::Filter(node) => &mut node.children,
            NodeData::Map(node) => &mut node.children,
            NodeData::FlattenLast(node) => &mut node.children,
            NodeData::Concat(node) => &mut node.children,
            NodeData::Join(node) => &mut node.children,
            NodeData::IfExists(node) => &mut node.children,
            NodeData::Group(node) => &mut node.children,
            NodeData::Scorer(node) => {
                return Err(ScorenetError::configuration(format!(
                    "scorer of '{}' is terminal and cannot have children",
                    node.constraint_name
                )))
            }
        };
        children.push(child);
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeData::Scorer(_))
    }

    pub fn insert_collect_ops(
        &mut self,
        side: Side,
        tuple: TupleId,
        tuples: &mut TupleArena,
        scores: &mut dyn ScoreSink,
        emitted: &mut Vec<NodeOperation>,
    ) -> Result<()> {
        match self {
            NodeData::From(node) => Err(node.not_an_input("insert")),
            NodeData::Filter(node) => node.insert(tuple, tuples, emitted),
            NodeData::Map(node) => node.insert(tuple, tuples, emitted),
            NodeData::FlattenLast(node) => node.insert(tuple, tuples, emitted),
            NodeData::Concat(node) => node.insert(side, tuple, tuples, emitted),
            NodeData::Join(node) => node.insert(side, tuple, tuples, emitted),
            NodeData::IfExists(node) => node.insert(side, tuple, tuples, emitted),
            NodeData::Group(node) => node.insert(tuple, tuples, emitted),
            NodeData::Scorer(node) => node.insert(tuple, tuples, scores),
        }
    }

    pub fn update_collect_ops(
        &mut self,
        side: Side,
        tuple: TupleId,
        tuples: &mut TupleArena,
        scores: &mut dyn ScoreSink,
        emitted: &mut Vec<NodeOperation>,
    ) -> Result<()> {
        match self {
            NodeData::From(node) => Err(node.not_an_input("update")),
            NodeData::Filter(node) => node.update(tuple, tuples, emitted),
            NodeData::Map(node) => node.update(tuple, tuples, emitted),
            NodeData::FlattenLast(node) => node.update(tuple, tuples, emitted),
            NodeData::Concat(node) => node.update(side, tuple, tuples, emitted),
            NodeData::Join(node) => node.update(side, tuple, tuples, emitted),
            NodeData::IfExists(node) => node.update(side, tuple, tuples, emitted),
            NodeData::Group(node) => node.update(tuple, tuples, emitted),
            NodeData::Scorer(node) => node.update(tuple, tuples, scores),
        }
    }

    pub fn retract_collect_ops(
        &mut self,
        side: Side,
        tuple: TupleId,
        tuples: &mut TupleArena,
        scores: &mut dyn ScoreSink,
        emitted: &mut Vec<NodeOperation>,
    ) -> Result<()> {
        match self {
            NodeData::From(node) => Err(node.not_an_input("retract")),
            NodeData::Filter(node) => node.retract(tuple, tuples, emitted),
            NodeData::Map(node) => node.retract(tuple, tuples, emitted),
            NodeData::FlattenLast(node) => node.retract(tuple, tuples, emitted),
            NodeData::Concat(node) => node.retract(side, tuple, tuples, emitted),
            NodeData::Join(node) => node.retract(side, tuple, tuples, emitted),
            NodeData::IfExists(node) => node.retract(side, tuple, tuples, emitted),
            NodeData::Group(node) => node.retract(tuple, tuples, emitted),
            NodeData::Scorer(node) => node.retract(tuple, tuples, scores),
        }
    }

    /// Cross-checks the private state of stateful nodes against the arena.
    pub fn check_consistency(&self, tuples: &TupleArena) -> Result<()> {
        match self {
            NodeData::Join(node) => node.check_consistency(tuples),
            NodeData::IfExists(node) => node.check_consistency(tuples),
            NodeData::Group(node) => node.check_consistency(tuples),
            _ => Ok(()),
        }
    }
}

pub(crate) fn unexpected_slot(node: &str, tuple: TupleId, expected: &str, found: &StoreEntry) -> ScorenetError {
    ScorenetError::corruption(format!(
        "{} expected a {} slot on tuple {:?} but found {}",
        node,
        expected,
        tuple.0,
        found.kind()
    ))
}

/// Fails when a tuple arrives at a node that already holds state for it.
pub(crate) fn ensure_empty(tuples: &TupleArena, tuple: TupleId, slot: usize, node: &str) -> Result<()> {
    let entry = tuples.slot(tuple, slot)?;
    if entry.is_empty() {
        Ok(())
    } else {
        Err(ScorenetError::corruption(format!(
            "tuple {:?} inserted twice into {} (slot holds {})",
            tuple.0,
            node,
            entry.kind()
        )))
    }
}

pub(crate) fn peek_out(tuples: &TupleArena, tuple: TupleId, slot: usize, node: &str) -> Result<TupleId> {
    match tuples.slot(tuple, slot)? {
        StoreEntry::Tuple(out) => Ok(*out),
        other => Err(unexpected_slot(node, tuple, "tuple", other)),
    }
}

pub(crate) fn take_out(tuples: &mut TupleArena, tuple: TupleId, slot: usize, node: &str) -> Result<TupleId> {
    match tuples.take_slot(tuple, slot)? {
        StoreEntry::Tuple(out) => Ok(out),
        other => Err(unexpected_slot(node, tuple, "tuple", &other)),
    }
}

/// Source of one fact type. Driven directly by the session, never by the
/// executor.
pub struct FromNode {
    pub fact_type: TypeId,
    pub type_name: &'static str,
    pub children: Vec<ChildLink>,
    pub store_size: usize,
}

impl FromNode {
    pub fn new(fact_type: TypeId, type_name: &'static str, store_size: usize) -> Self {
        Self {
            fact_type,
            type_name,
            children: Vec::new(),
            store_size,
        }
    }

    pub fn insert_fact(
        &self,
        fact: Rc<dyn Fact>,
        tuples: &mut TupleArena,
        emitted: &mut Vec<NodeOperation>,
    ) -> Result<TupleId> {
        lifecycle::create_and_insert(smallvec![fact], self.store_size, &self.children, tuples, emitted)
    }

    /// Replaces the fact of a settled source tuple and queues its update.
    /// Always propagates: only the domain layer knows what changed.
    pub fn update_fact(
        &self,
        tuple: TupleId,
        fact: Rc<dyn Fact>,
        tuples: &mut TupleArena,
        emitted: &mut Vec<NodeOperation>,
    ) -> Result<()> {
        let state = tuples.state(tuple)?;
        if state != TupleState::Ok {
            return Err(ScorenetError::corruption(format!(
                "cannot update source tuple {:?} of {} in state {:?}",
                tuple.0, self.type_name, state
            )));
        }
        tuples.get_mut(tuple)?.set_facts(smallvec![fact]);
        lifecycle::update(tuple, &self.children, tuples, emitted)
    }

    pub fn retract_fact(
        &self,
        tuple: TupleId,
        tuples: &mut TupleArena,
        emitted: &mut Vec<NodeOperation>,
    ) -> Result<()> {
        lifecycle::retract(tuple, &self.children, tuples, emitted)
    }

    fn not_an_input(&self, verb: &str) -> ScorenetError {
        ScorenetError::corruption(format!(
            "from node of {} received a propagated {}",
            self.type_name, verb
        ))
    }
}

impl fmt::Debug for FromNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FromNode")
            .field("type_name", &self.type_name)
            .field("children", &self.children)
            .field("store_size", &self.store_size)
            .finish()
    }
}

/// Passes through the tuples accepted by a predicate. Its slot remembers
/// whether the tuple was passed, so updates can turn into inserts/retracts.
pub struct FilterNode {
    pub predicate: Predicate,
    pub slot: usize,
    pub children: Vec<ChildLink>,
}

impl FilterNode {
    pub fn new(predicate: Predicate, slot: usize) -> Self {
        Self {
            predicate,
            slot,
            children: Vec::new(),
        }
    }

    fn test(&self, tuple: &Tuple) -> Result<bool> {
        guarded_on("filter predicate", tuple, || (self.predicate)(tuple))
    }

    pub fn insert(&mut self, tuple: TupleId, tuples: &mut TupleArena, emitted: &mut Vec<NodeOperation>) -> Result<()> {
        ensure_empty(tuples, tuple, self.slot, "filter")?;
        let passed = self.test(tuples.get(tuple)?)?;
        tuples.put_slot(tuple, self.slot, StoreEntry::Passed(passed))?;
        if passed {
            lifecycle::forward(NodeOperation::Insert, tuple, &self.children, emitted);
        }
        Ok(())
    }

    pub fn update(&mut self, tuple: TupleId, tuples: &mut TupleArena, emitted: &mut Vec<NodeOperation>) -> Result<()> {
        let passes = self.test(tuples.get(tuple)?)?;
        let passed = match tuples.take_slot(tuple, self.slot)? {
            StoreEntry::Passed(passed) => passed,
            other => return Err(unexpected_slot("filter", tuple, "passed", &other)),
        };
        tuples.put_slot(tuple, self.slot, StoreEntry::Passed(passes))?;
        let operation: fn(ChildLink, TupleId) -> NodeOperation = match (passed, passes) {
            (true, true) => NodeOperation::Update,
            (true, false) => NodeOperation::Retract,
            (false, true) => NodeOperation::Insert,
            (false, false) => return Ok(()),
        };
        lifecycle::forward(operation, tuple, &self.children, emitted);
        Ok(())
    }

    pub fn retract(&mut self, tuple: TupleId, tuples: &mut TupleArena, emitted: &mut Vec<NodeOperation>) -> Result<()> {
        match tuples.take_slot(tuple, self.slot)? {
            StoreEntry::Passed(true) => {
                lifecycle::forward(NodeOperation::Retract, tuple, &self.children, emitted);
                Ok(())
            }
            StoreEntry::Passed(false) => Ok(()),
            other => Err(unexpected_slot("filter", tuple, "passed", &other)),
        }
    }
}

impl fmt::Debug for FilterNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterNode")
            .field("predicate", &"<function>")
            .field("slot", &self.slot)
            .field("children", &self.children)
            .finish()
    }
}

/// Derives one output tuple per input tuple. With `expand` the mapped facts
/// are appended to the input facts instead of replacing them.
pub struct MapNode {
    pub mapper: Mapper,
    pub arity: usize,
    pub expand: bool,
    pub slot: usize,
    pub children: Vec<ChildLink>,
    pub out_store_size: usize,
}

impl MapNode {
    pub fn new(mapper: Mapper, arity: usize, expand: bool, slot: usize, out_store_size: usize) -> Self {
        Self {
            mapper,
            arity,
            expand,
            slot,
            children: Vec::new(),
            out_store_size,
        }
    }

    fn compute(&self, tuple: &Tuple) -> Result<Facts> {
        let operation = if self.expand { "expand mapping" } else { "mapping" };
        let produced = guarded_on(operation, tuple, || (self.mapper)(tuple))?;
        let facts: Facts = if self.expand {
            tuple.facts().iter().cloned().chain(produced).collect()
        } else {
            produced
        };
        if facts.len() != self.arity {
            return Err(ScorenetError::invalid_arity(self.arity, facts.len()));
        }
        Ok(facts)
    }

    pub fn insert(&mut self, tuple: TupleId, tuples: &mut TupleArena, emitted: &mut Vec<NodeOperation>) -> Result<()> {
        ensure_empty(tuples, tuple, self.slot, "map")?;
        let facts = self.compute(tuples.get(tuple)?)?;
        let out = lifecycle::create_and_insert(facts, self.out_store_size, &self.children, tuples, emitted)?;
        tuples.put_slot(tuple, self.slot, StoreEntry::Tuple(out))
    }

    pub fn update(&mut self, tuple: TupleId, tuples: &mut TupleArena, emitted: &mut Vec<NodeOperation>) -> Result<()> {
        let facts = self.compute(tuples.get(tuple)?)?;
        let out = peek_out(tuples, tuple, self.slot, "map")?;
        lifecycle::update_if_different(out, facts, &self.children, tuples, emitted)?;
        Ok(())
    }

    pub fn retract(&mut self, tuple: TupleId, tuples: &mut TupleArena, emitted: &mut Vec<NodeOperation>) -> Result<()> {
        let out = take_out(tuples, tuple, self.slot, "map")?;
        lifecycle::retract(out, &self.children, tuples, emitted)
    }
}

impl fmt::Debug for MapNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapNode")
            .field("mapper", &"<function>")
            .field("arity", &self.arity)
            .field("expand", &self.expand)
            .field("slot", &self.slot)
            .field("children", &self.children)
            .finish()
    }
}

/// Replaces the last fact of each tuple by every item it flattens into, one
/// output tuple per item.
pub struct FlattenLastNode {
    pub flattener: Flattener,
    pub slot: usize,
    pub children: Vec<ChildLink>,
    pub out_store_size: usize,
}

impl FlattenLastNode {
    pub fn new(flattener: Flattener, slot: usize, out_store_size: usize) -> Self {
        Self {
            flattener,
            slot,
            children: Vec::new(),
            out_store_size,
        }
    }

    fn outputs(&self, tuple: &Tuple) -> Result<Vec<Facts>> {
        let (last, prefix) = tuple
            .facts()
            .split_last()
            .ok_or_else(|| ScorenetError::invalid_arity(1, 0))?;
        let items = guarded_on("flattening", tuple, || (self.flattener)(last))?;
        Ok(items
            .into_iter()
            .map(|item| prefix.iter().cloned().chain(std::iter::once(item)).collect())
            .collect())
    }

    pub fn insert(&mut self, tuple: TupleId, tuples: &mut TupleArena, emitted: &mut Vec<NodeOperation>) -> Result<()> {
        ensure_empty(tuples, tuple, self.slot, "flatten")?;
        let outputs = self.outputs(tuples.get(tuple)?)?;
        let mut outs: SmallVec<[TupleId; 4]> = SmallVec::with_capacity(outputs.len());
        for facts in outputs {
            outs.push(lifecycle::create_and_insert(facts, self.out_store_size, &self.children, tuples, emitted)?);
        }
        tuples.put_slot(tuple, self.slot, StoreEntry::Tuples(outs))
    }

    /// Matches new items against previous outputs by structural equality of
    /// the flattened fact, as a multiset: a kept item updates its output
    /// tuple, a vanished one retracts it, a new one inserts.
    pub fn update(&mut self, tuple: TupleId, tuples: &mut TupleArena, emitted: &mut Vec<NodeOperation>) -> Result<()> {
        let outputs = self.outputs(tuples.get(tuple)?)?;
        let old = match tuples.take_slot(tuple, self.slot)? {
            StoreEntry::Tuples(old) => old,
            other => return Err(unexpected_slot("flatten", tuple, "tuples", &other)),
        };
        let mut old_items = Vec::with_capacity(old.len());
        for out in &old {
            let last = tuples
                .get(*out)?
                .last_fact()
                .cloned()
                .ok_or_else(|| ScorenetError::corruption("flattened tuple without facts"))?;
            old_items.push(last);
        }

        let mut used = vec![false; old.len()];
        let assignment: Vec<Option<usize>> = outputs
            .iter()
            .map(|facts| {
                let item = facts.last()?;
                let found = (0..old.len()).find(|&j| !used[j] && old_items[j].fact_eq(item.as_ref()));
                if let Some(j) = found {
                    used[j] = true;
                }
                found
            })
            .collect();

        for (j, out) in old.iter().enumerate() {
            if !used[j] {
                lifecycle::retract(*out, &self.children, tuples, emitted)?;
            }
        }
        let mut outs: SmallVec<[TupleId; 4]> = SmallVec::with_capacity(outputs.len());
        for (facts, kept) in outputs.into_iter().zip(assignment) {
            match kept {
                Some(j) => {
                    lifecycle::update_if_different(old[j], facts, &self.children, tuples, emitted)?;
                    outs.push(old[j]);
                }
                None => outs.push(lifecycle::create_and_insert(
                    facts,
                    self.out_store_size,
                    &self.children,
                    tuples,
                    emitted,
                )?),
            }
        }
        tuples.put_slot(tuple, self.slot, StoreEntry::Tuples(outs))
    }

    pub fn retract(&mut self, tuple: TupleId, tuples: &mut TupleArena, emitted: &mut Vec<NodeOperation>) -> Result<()> {
        let outs = match tuples.take_slot(tuple, self.slot)? {
            StoreEntry::Tuples(outs) => outs,
            other => return Err(unexpected_slot("flatten", tuple, "tuples", &other)),
        };
        for out in outs {
            lifecycle::retract(out, &self.children, tuples, emitted)?;
        }
        Ok(())
    }
}

impl fmt::Debug for FlattenLastNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlattenLastNode")
            .field("flattener", &"<function>")
            .field("slot", &self.slot)
            .field("children", &self.children)
            .finish()
    }
}

/// Union of two streams of equal arity. Each input tuple gets its own output
/// clone, kept in the slot of the side it came from.
#[derive(Debug)]
pub struct ConcatNode {
    pub left_slot: usize,
    pub right_slot: usize,
    pub children: Vec<ChildLink>,
    pub out_store_size: usize,
}

impl ConcatNode {
    pub fn new(left_slot: usize, right_slot: usize, out_store_size: usize) -> Self {
        Self {
            left_slot,
            right_slot,
            children: Vec::new(),
            out_store_size,
        }
    }

    fn slot(&self, side: Side) -> usize {
        match side {
            Side::Left => self.left_slot,
            Side::Right => self.right_slot,
        }
    }

    pub fn insert(&mut self, side: Side, tuple: TupleId, tuples: &mut TupleArena, emitted: &mut Vec<NodeOperation>) -> Result<()> {
        let slot = self.slot(side);
        ensure_empty(tuples, tuple, slot, "concat")?;
        let facts: Facts = tuples.get(tuple)?.facts().iter().cloned().collect();
        let out = lifecycle::create_and_insert(facts, self.out_store_size, &self.children, tuples, emitted)?;
        tuples.put_slot(tuple, slot, StoreEntry::Tuple(out))
    }

    pub fn update(&mut self, side: Side, tuple: TupleId, tuples: &mut TupleArena, emitted: &mut Vec<NodeOperation>) -> Result<()> {
        let out = peek_out(tuples, tuple, self.slot(side), "concat")?;
        let facts: Facts = tuples.get(tuple)?.facts().iter().cloned().collect();
        lifecycle::update_if_different(out, facts, &self.children, tuples, emitted)?;
        Ok(())
    }

    pub fn retract(&mut self, side: Side, tuple: TupleId, tuples: &mut TupleArena, emitted: &mut Vec<NodeOperation>) -> Result<()> {
        let out = take_out(tuples, tuple, self.slot(side), "concat")?;
        lifecycle::retract(out, &self.children, tuples, emitted)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::arena::NodeId;
    use slotmap::SlotMap;

    /// A child link to a node id that exists only for comparisons.
    pub fn child() -> ChildLink {
        let mut keys: SlotMap<NodeId, ()> = SlotMap::new();
        ChildLink::left(keys.insert(()))
    }

    /// A settled tuple of integer facts with `store_size` slots.
    pub fn settled(tuples: &mut TupleArena, values: &[i64], store_size: usize) -> TupleId {
        let facts: Facts = values.iter().map(|v| Rc::new(*v) as Rc<dyn Fact>).collect();
        let id = tuples.acquire(facts, store_size).unwrap();
        tuples.set_state(id, TupleState::Ok).unwrap();
        id
    }

    /// Replaces the facts of a settled tuple, as an upstream update would.
    pub fn set_values(tuples: &mut TupleArena, id: TupleId, values: &[i64]) {
        let facts: Facts = values.iter().map(|v| Rc::new(*v) as Rc<dyn Fact>).collect();
        tuples.get_mut(id).unwrap().set_facts(facts);
    }

    /// Marks every tuple created by the emitted operations as settled.
    pub fn settle_all(tuples: &mut TupleArena, emitted: &[NodeOperation]) {
        for op in emitted {
            match op {
                NodeOperation::Settle(id) => tuples.set_state(*id, TupleState::Ok).unwrap(),
                NodeOperation::Release(id) => {
                    tuples.release(*id).unwrap();
                }
                _ => {}
            }
        }
    }

    pub fn inserted(emitted: &[NodeOperation]) -> Vec<TupleId> {
        emitted
            .iter()
            .filter_map(|op| match op {
                NodeOperation::Insert(_, id) => Some(*id),
                _ => None,
            })
            .collect()
    }

    pub fn retracted(emitted: &[NodeOperation]) -> Vec<TupleId> {
        emitted
            .iter()
            .filter_map(|op| match op {
                NodeOperation::Retract(_, id) => Some(*id),
                _ => None,
            })
            .collect()
    }

    pub fn updated(emitted: &[NodeOperation]) -> Vec<TupleId> {
        emitted
            .iter()
            .filter_map(|op| match op {
                NodeOperation::Update(_, id) => Some(*id),
                _ => None,
            })
            .collect()
    }

    pub fn ints(tuples: &TupleArena, id: TupleId) -> Vec<i64> {
        tuples
            .get(id)
            .unwrap()
            .facts()
            .iter()
            .map(|f| *f.as_any().downcast_ref::<i64>().unwrap())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    fn even_filter() -> FilterNode {
        let mut node = FilterNode::new(Rc::new(|t: &Tuple| t.fact_as::<i64>(0).map_or(false, |v| v % 2 == 0)), 0);
        node.children.push(child());
        node
    }

    #[test]
    fn test_filter_update_transitions() {
        let mut tuples = TupleArena::new();
        let mut filter = even_filter();
        let c = filter.children[0];
        let t = settled(&mut tuples, &[1], 1);
        let mut emitted = Vec::new();

        filter.insert(t, &mut tuples, &mut emitted).unwrap();
        assert!(emitted.is_empty());

        set_values(&mut tuples, t, &[2]);
        filter.update(t, &mut tuples, &mut emitted).unwrap();
        assert_eq!(emitted, vec![NodeOperation::Insert(c, t)]);

        emitted.clear();
        set_values(&mut tuples, t, &[4]);
        filter.update(t, &mut tuples, &mut emitted).unwrap();
        assert_eq!(emitted, vec![NodeOperation::Update(c, t)]);

        emitted.clear();
        set_values(&mut tuples, t, &[5]);
        filter.update(t, &mut tuples, &mut emitted).unwrap();
        assert_eq!(emitted, vec![NodeOperation::Retract(c, t)]);

        emitted.clear();
        filter.update(t, &mut tuples, &mut emitted).unwrap();
        assert!(emitted.is_empty());

        filter.retract(t, &mut tuples, &mut emitted).unwrap();
        assert!(emitted.is_empty());
        assert!(tuples.slot(t, 0).unwrap().is_empty());
    }

    #[test]
    fn test_filter_protocol_violations() {
        let mut tuples = TupleArena::new();
        let mut filter = even_filter();
        let t = settled(&mut tuples, &[2], 1);
        let mut emitted = Vec::new();
        assert!(filter.retract(t, &mut tuples, &mut emitted).unwrap_err().is_corruption());
        assert!(filter.update(t, &mut tuples, &mut emitted).unwrap_err().is_corruption());

        let t = settled(&mut tuples, &[2], 1);
        filter.insert(t, &mut tuples, &mut emitted).unwrap();
        assert!(filter.insert(t, &mut tuples, &mut emitted).unwrap_err().is_corruption());
    }

    #[test]
    fn test_filter_panic_leaves_slot_untouched() {
        let mut tuples = TupleArena::new();
        let mut filter = FilterNode::new(Rc::new(|_: &Tuple| panic!("boom")), 0);
        let t = settled(&mut tuples, &[3], 1);
        let err = filter.insert(t, &mut tuples, &mut Vec::new()).unwrap_err();
        assert!(err.is_user_code());
        assert!(tuples.slot(t, 0).unwrap().is_empty());
    }

    #[test]
    fn test_map_updates_only_on_change() {
        let mut tuples = TupleArena::new();
        let mapper: Mapper = Rc::new(|t: &Tuple| {
            let v = *t.fact_as::<i64>(0).unwrap();
            smallvec![Rc::new(v / 10) as Rc<dyn Fact>]
        });
        let mut map = MapNode::new(mapper, 1, false, 0, 0);
        map.children.push(child());
        let t = settled(&mut tuples, &[12], 1);
        let mut emitted = Vec::new();

        map.insert(t, &mut tuples, &mut emitted).unwrap();
        let out = inserted(&emitted)[0];
        assert_eq!(ints(&tuples, out), vec![1]);
        settle_all(&mut tuples, &emitted);

        emitted.clear();
        set_values(&mut tuples, t, &[15]);
        map.update(t, &mut tuples, &mut emitted).unwrap();
        assert!(emitted.is_empty());

        set_values(&mut tuples, t, &[25]);
        map.update(t, &mut tuples, &mut emitted).unwrap();
        assert_eq!(updated(&emitted), vec![out]);
        assert_eq!(ints(&tuples, out), vec![2]);
    }

    #[test]
    fn test_expand_appends_and_checks_arity() {
        let mut tuples = TupleArena::new();
        let mapper: Mapper = Rc::new(|t: &Tuple| {
            let v = *t.fact_as::<i64>(0).unwrap();
            smallvec![Rc::new(v * 2) as Rc<dyn Fact>]
        });
        let mut expand = MapNode::new(mapper.clone(), 2, true, 0, 0);
        expand.children.push(child());
        let t = settled(&mut tuples, &[4], 1);
        let mut emitted = Vec::new();
        expand.insert(t, &mut tuples, &mut emitted).unwrap();
        assert_eq!(ints(&tuples, inserted(&emitted)[0]), vec![4, 8]);

        let mut wrong = MapNode::new(mapper, 3, true, 0, 0);
        let t = settled(&mut tuples, &[4], 1);
        assert!(matches!(
            wrong.insert(t, &mut tuples, &mut Vec::new()),
            Err(ScorenetError::InvalidArity { expected: 3, actual: 2 })
        ));
    }

    fn digits_node() -> FlattenLastNode {
        // 123 flattens into 1, 2, 3
        let flattener: Flattener = Rc::new(|fact: &Rc<dyn Fact>| {
            let v = *fact.as_any().downcast_ref::<i64>().unwrap();
            v.to_string()
                .chars()
                .map(|c| Rc::new(c.to_digit(10).unwrap() as i64) as Rc<dyn Fact>)
                .collect()
        });
        let mut node = FlattenLastNode::new(flattener, 0, 0);
        node.children.push(child());
        node
    }

    #[test]
    fn test_flatten_update_retracts_only_vanished_items() {
        let mut tuples = TupleArena::new();
        let mut node = digits_node();
        let t = settled(&mut tuples, &[9, 122], 1);
        let mut emitted = Vec::new();

        node.insert(t, &mut tuples, &mut emitted).unwrap();
        let outs = inserted(&emitted);
        assert_eq!(outs.len(), 3);
        assert_eq!(ints(&tuples, outs[0]), vec![9, 1]);
        settle_all(&mut tuples, &emitted);

        // 122 -> 232: one "2" survives, the other "2" survives, "1" vanishes, "3" is new
        emitted.clear();
        set_values(&mut tuples, t, &[9, 232]);
        node.update(t, &mut tuples, &mut emitted).unwrap();
        assert_eq!(retracted(&emitted), vec![outs[0]]);
        assert_eq!(inserted(&emitted).len(), 1);
        assert!(updated(&emitted).is_empty());
        settle_all(&mut tuples, &emitted);

        emitted.clear();
        node.retract(t, &mut tuples, &mut emitted).unwrap();
        assert_eq!(retracted(&emitted).len(), 3);
    }

    #[test]
    fn test_flatten_prefix_change_updates_outputs() {
        let mut tuples = TupleArena::new();
        let mut node = digits_node();
        let t = settled(&mut tuples, &[1, 45], 1);
        let mut emitted = Vec::new();
        node.insert(t, &mut tuples, &mut emitted).unwrap();
        settle_all(&mut tuples, &emitted);
        let outs = inserted(&emitted);

        emitted.clear();
        set_values(&mut tuples, t, &[2, 45]);
        node.update(t, &mut tuples, &mut emitted).unwrap();
        assert_eq!(updated(&emitted), outs);
        assert_eq!(ints(&tuples, outs[1]), vec![2, 5]);
    }

    #[test]
    fn test_concat_keeps_sides_apart() {
        let mut tuples = TupleArena::new();
        let mut concat = ConcatNode::new(0, 1, 0);
        concat.children.push(child());
        let t = settled(&mut tuples, &[7], 2);
        let mut emitted = Vec::new();

        concat.insert(Side::Left, t, &mut tuples, &mut emitted).unwrap();
        concat.insert(Side::Right, t, &mut tuples, &mut emitted).unwrap();
        let outs = inserted(&emitted);
        assert_eq!(outs.len(), 2);
        assert_ne!(outs[0], outs[1]);
        settle_all(&mut tuples, &emitted);

        emitted.clear();
        concat.retract(Side::Left, t, &mut tuples, &mut emitted).unwrap();
        assert_eq!(retracted(&emitted), vec![outs[0]]);
        assert!(matches!(tuples.slot(t, 1).unwrap(), StoreEntry::Tuple(out) if *out == outs[1]));
    }
}
