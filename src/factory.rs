//factory.rs
use crate::arena::{ChildLink, NodeArena, NodeId};
use crate::constraint::{ConstraintId, ImpactType};
use crate::error::{Result, ScorenetError};
use crate::exists_node::{ExistsLeftSlots, IfExistsNode};
use crate::fact::Fact;
use crate::group_node::GroupNode;
use crate::join_node::{JoinNode, JoinSlots};
use crate::node_sharing::NodeSharingManager;
use crate::nodes::{ConcatNode, FilterNode, FlattenLastNode, FromNode, MapNode, NodeData};
use crate::resource_limits::SessionConfig;
use crate::score::Score;
use crate::score_inliner::ScoreInliner;
use crate::scorer::{ScorerNode, Weigher};
use crate::session::Session;
use crate::stream_def::{Stream, StreamDefinition, StreamId};
use crate::tuple::MAX_ARITY;
use rustc_hash::FxHashMap;
use std::any::TypeId;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::{debug, info};

#[derive(Debug)]
struct DefinedStream {
    definition: StreamDefinition,
    arity: usize,
}

#[derive(Debug, Clone)]
struct ConstraintDef<S> {
    name: Rc<str>,
    weight: S,
    impact_type: ImpactType,
}

/// Store slots a node reserves on the tuples it receives.
#[derive(Debug, Clone, Copy)]
enum SlotPlan {
    Source,
    Single(usize),
    Concat(usize, usize),
    Join(JoinSlots, JoinSlots),
    Exists(ExistsLeftSlots, JoinSlots),
}

/// Records stream definitions and turns them into sessions.
///
/// Problems found while declaring streams (arity overflow, empty groupings,
/// concatenating streams of different arity) are collected and reported by
/// [`ConstraintFactory::build_session`] as one `Configuration` error.
#[derive(Debug)]
pub struct ConstraintFactory<S: Score> {
    streams: Vec<DefinedStream>,
    node_sharer: NodeSharingManager,
    constraints: Vec<ConstraintDef<S>>,
    errors: Vec<String>,
}

impl<S: Score> Default for ConstraintFactory<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Score> ConstraintFactory<S> {
    pub fn new() -> Self {
        Self {
            streams: Vec::new(),
            node_sharer: NodeSharingManager::new(),
            constraints: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn from<T: Fact>(factory: &Rc<RefCell<Self>>) -> Stream<S> {
        Self::add_stream(
            factory,
            StreamDefinition::From {
                fact_type: TypeId::of::<T>(),
                type_name: std::any::type_name::<T>(),
            },
        )
    }

    /// Records `definition`, or returns the existing stream with the same
    /// retrieval id.
    pub fn add_stream(factory: &Rc<RefCell<Self>>, definition: StreamDefinition) -> Stream<S> {
        let mut this = factory.borrow_mut();
        let retrieval_id = definition.retrieval_id();
        if let Some(id) = this.node_sharer.get_stream(&retrieval_id) {
            debug!(stream = id.0, kind = definition.kind_name(), "stream shared");
            let arity = this.streams[id.0].arity;
            return Stream {
                id,
                arity,
                factory: Rc::clone(factory),
            };
        }

        let arity = this.output_arity(&definition);
        let id = StreamId(this.streams.len());
        if let Err(e) = this.node_sharer.register_stream(retrieval_id, id) {
            this.errors.push(e);
        }
        debug!(stream = id.0, arity, definition = ?definition, "stream defined");
        this.streams.push(DefinedStream { definition, arity });
        Stream {
            id,
            arity,
            factory: Rc::clone(factory),
        }
    }

    /// Registers a constraint scoring every tuple of `source`.
    pub fn add_constraint(
        factory: &Rc<RefCell<Self>>,
        source: StreamId,
        name: &str,
        weight: S,
        impact_type: ImpactType,
        weigher: Weigher,
    ) -> Result<ConstraintId> {
        let (constraint, constraint_name) = {
            let mut this = factory.borrow_mut();
            if this.constraints.iter().any(|c| &*c.name == name) {
                return Err(ScorenetError::configuration(format!(
                    "constraint '{}' is defined twice",
                    name
                )));
            }
            let constraint = ConstraintId(this.constraints.len());
            let constraint_name: Rc<str> = Rc::from(name);
            this.constraints.push(ConstraintDef {
                name: Rc::clone(&constraint_name),
                weight,
                impact_type,
            });
            (constraint, constraint_name)
        };
        Self::add_stream(
            factory,
            StreamDefinition::Scorer {
                source,
                constraint,
                constraint_name,
                weigher,
            },
        );
        Ok(constraint)
    }

    pub(crate) fn report(&mut self, problem: String) {
        self.errors.push(problem);
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn constraint_count(&self) -> usize {
        self.constraints.len()
    }

    /// Definitions that resolved to an already declared stream.
    pub fn shared_count(&self) -> usize {
        self.node_sharer.hits()
    }

    pub fn definition(&self, id: StreamId) -> Option<&StreamDefinition> {
        self.streams.get(id.0).map(|s| &s.definition)
    }

    fn arity_of(&mut self, id: StreamId) -> usize {
        match self.streams.get(id.0) {
            Some(stream) => stream.arity,
            None => {
                self.errors.push(format!("unknown stream #{}", id.0));
                0
            }
        }
    }

    fn output_arity(&mut self, definition: &StreamDefinition) -> usize {
        let arity = match definition {
            StreamDefinition::From { .. } => 1,
            StreamDefinition::Filter { source, .. }
            | StreamDefinition::IfExists { left: source, .. }
            | StreamDefinition::FlattenLast { source, .. }
            | StreamDefinition::Scorer { source, .. } => self.arity_of(*source),
            StreamDefinition::Join { left, right, .. } => self.arity_of(*left) + self.arity_of(*right),
            StreamDefinition::Map { arity, .. } => *arity,
            StreamDefinition::Concat { left, right } => {
                let (l, r) = (self.arity_of(*left), self.arity_of(*right));
                if l != r {
                    self.errors.push(format!(
                        "cannot concat a stream of arity {} with one of arity {}",
                        l, r
                    ));
                }
                l
            }
            StreamDefinition::Group { keys, collectors, .. } => {
                if keys.is_empty() && collectors.is_empty() {
                    self.errors
                        .push("group_by needs at least one key or collector".to_string());
                }
                keys.len() + collectors.len()
            }
        };
        if arity > MAX_ARITY {
            self.errors.push(format!(
                "{} produces tuples of arity {}, the maximum is {}",
                definition.kind_name(),
                arity,
                MAX_ARITY
            ));
        } else if arity == 0 && matches!(definition, StreamDefinition::Map { .. }) {
            self.errors
                .push(format!("{} produces tuples of arity 0", definition.kind_name()));
        }
        arity
    }

    /// Instantiates the network. Streams are visited in creation order,
    /// which is a valid dependency order.
    pub fn build_session(&self, config: &SessionConfig) -> Result<Session<S>> {
        if !self.errors.is_empty() {
            return Err(ScorenetError::configuration(self.errors.join("; ")));
        }

        let count = self.streams.len();
        let mut child_counts = vec![0usize; count];
        for stream in &self.streams {
            for (parent, _) in stream.definition.inputs() {
                child_counts[parent.0] += 1;
            }
        }
        for (i, stream) in self.streams.iter().enumerate() {
            if child_counts[i] == 0 && !matches!(stream.definition, StreamDefinition::Scorer { .. }) {
                return Err(ScorenetError::configuration(format!(
                    "stream #{} ({:?}) is not consumed by any constraint",
                    i, stream.definition
                )));
            }
        }

        // Pass-through nodes keep their state on the tuples of their source.
        let mut owners = Vec::with_capacity(count);
        for (i, stream) in self.streams.iter().enumerate() {
            let owner = match stream.definition.inputs().first() {
                Some((parent, _)) if !stream.definition.creates_tuples() => owners[parent.0],
                _ => i,
            };
            owners.push(owner);
        }

        let mut store_sizes = vec![0usize; count];
        let mut reserve = |stream: StreamId, slots: usize| {
            let owner = owners[stream.0];
            let first = store_sizes[owner];
            store_sizes[owner] += slots;
            first
        };
        let mut plans = Vec::with_capacity(count);
        for stream in &self.streams {
            let plan = match &stream.definition {
                StreamDefinition::From { .. } => SlotPlan::Source,
                StreamDefinition::Filter { source, .. }
                | StreamDefinition::Map { source, .. }
                | StreamDefinition::FlattenLast { source, .. }
                | StreamDefinition::Group { source, .. }
                | StreamDefinition::Scorer { source, .. } => SlotPlan::Single(reserve(*source, 1)),
                StreamDefinition::Concat { left, right } => {
                    SlotPlan::Concat(reserve(*left, 1), reserve(*right, 1))
                }
                StreamDefinition::Join { left, right, .. } => {
                    let l = reserve(*left, 2);
                    let r = reserve(*right, 2);
                    SlotPlan::Join(
                        JoinSlots { keys: l, handle: l + 1 },
                        JoinSlots { keys: r, handle: r + 1 },
                    )
                }
                StreamDefinition::IfExists { left, right, .. } => {
                    let l = reserve(*left, 3);
                    let r = reserve(*right, 2);
                    SlotPlan::Exists(
                        ExistsLeftSlots {
                            keys: l,
                            handle: l + 1,
                            counter: l + 2,
                        },
                        JoinSlots { keys: r, handle: r + 1 },
                    )
                }
            };
            plans.push(plan);
        }

        let mut nodes = NodeArena::new();
        let mut node_ids: Vec<NodeId> = Vec::with_capacity(count);
        for (i, (stream, plan)) in self.streams.iter().zip(&plans).enumerate() {
            let data = instantiate(&stream.definition, *plan, store_sizes[i], stream.arity)?;
            debug!(stream = i, kind = data.kind_name(), ?plan, "node created");
            node_ids.push(nodes.insert_node(data));
        }

        for (i, stream) in self.streams.iter().enumerate() {
            for (parent, side) in stream.definition.inputs() {
                let parent_node = nodes.get_node_mut(node_ids[parent.0]).ok_or_else(|| {
                    ScorenetError::invalid_index(format!("node of stream #{} is missing", parent.0))
                })?;
                parent_node.add_child(ChildLink {
                    node: node_ids[i],
                    side,
                })?;
            }
        }

        let mut from_nodes = FxHashMap::default();
        for (stream, node) in self.streams.iter().zip(&node_ids) {
            if let StreamDefinition::From { fact_type, .. } = stream.definition {
                from_nodes.insert(fact_type, *node);
            }
        }

        let mut inliner = ScoreInliner::new(config.constraint_match_enabled);
        for (i, constraint) in self.constraints.iter().enumerate() {
            let id = inliner.register_constraint(&constraint.name, constraint.weight.clone(), constraint.impact_type)?;
            if id != ConstraintId(i) {
                return Err(ScorenetError::corruption(format!(
                    "constraint '{}' registered as {:?}, expected #{}",
                    constraint.name, id, i
                )));
            }
        }

        info!(
            nodes = nodes.len(),
            source_types = from_nodes.len(),
            constraints = self.constraints.len(),
            shared = self.node_sharer.hits(),
            "network built"
        );
        Ok(Session::new(
            nodes,
            from_nodes,
            inliner,
            config.clone(),
            self.node_sharer.hits(),
        ))
    }
}

fn instantiate(definition: &StreamDefinition, plan: SlotPlan, out_store_size: usize, arity: usize) -> Result<NodeData> {
    let data = match (definition, plan) {
        (StreamDefinition::From { fact_type, type_name }, SlotPlan::Source) => {
            NodeData::From(FromNode::new(*fact_type, *type_name, out_store_size))
        }
        (StreamDefinition::Filter { predicate, .. }, SlotPlan::Single(slot)) => {
            NodeData::Filter(FilterNode::new(Rc::clone(predicate), slot))
        }
        (
            StreamDefinition::Map {
                mapper, expand, ..
            },
            SlotPlan::Single(slot),
        ) => NodeData::Map(MapNode::new(Rc::clone(mapper), arity, *expand, slot, out_store_size)),
        (StreamDefinition::FlattenLast { flattener, .. }, SlotPlan::Single(slot)) => {
            NodeData::FlattenLast(FlattenLastNode::new(Rc::clone(flattener), slot, out_store_size))
        }
        (StreamDefinition::Concat { .. }, SlotPlan::Concat(left, right)) => {
            NodeData::Concat(ConcatNode::new(left, right, out_store_size))
        }
        (StreamDefinition::Join { joiners, filter, .. }, SlotPlan::Join(left, right)) => {
            NodeData::Join(JoinNode::new(joiners.clone(), filter.clone(), left, right, out_store_size))
        }
        (
            StreamDefinition::IfExists {
                should_exist,
                joiners,
                filter,
                ..
            },
            SlotPlan::Exists(left, right),
        ) => NodeData::IfExists(IfExistsNode::new(*should_exist, joiners.clone(), filter.clone(), left, right)),
        (StreamDefinition::Group { keys, collectors, .. }, SlotPlan::Single(slot)) => {
            NodeData::Group(GroupNode::new(keys.clone(), collectors.clone(), slot, out_store_size))
        }
        (
            StreamDefinition::Scorer {
                constraint,
                constraint_name,
                weigher,
                ..
            },
            SlotPlan::Single(slot),
        ) => NodeData::Scorer(ScorerNode::new(*constraint, Rc::clone(constraint_name), weigher.clone(), slot)),
        (definition, plan) => {
            return Err(ScorenetError::corruption(format!(
                "slot plan {:?} does not fit {}",
                plan,
                definition.kind_name()
            )))
        }
    };
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::Collectors;
    use crate::joiner::Joiners;
    use crate::key::KeyValue;
    use crate::score::SimpleScore;

    type Factory = Rc<RefCell<ConstraintFactory<SimpleScore>>>;

    fn factory() -> Factory {
        Rc::new(RefCell::new(ConstraintFactory::new()))
    }

    #[test]
    fn test_from_streams_are_shared() {
        let f = factory();
        let a = ConstraintFactory::from::<i64>(&f);
        let b = ConstraintFactory::from::<i64>(&f);
        let c = ConstraintFactory::from::<String>(&f);
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
        assert_eq!(f.borrow().stream_count(), 2);
        assert_eq!(f.borrow().shared_count(), 1);
    }

    #[test]
    fn test_join_arity_overflow_is_reported_at_build() {
        let f = factory();
        let a = ConstraintFactory::from::<i64>(&f);
        let pair = a.join(&a, Vec::new());
        let quad = pair.join(&pair, Vec::new());
        let five = quad.join(&a, Vec::new());
        assert_eq!(five.arity(), 5);
        five.penalize("too wide", SimpleScore::new(1)).unwrap();
        let err = f.borrow().build_session(&SessionConfig::default()).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_dangling_stream_is_rejected() {
        let f = factory();
        let a = ConstraintFactory::from::<i64>(&f);
        let _unused = a.filter(|_| true);
        a.penalize("all", SimpleScore::new(1)).unwrap();
        let err = f.borrow().build_session(&SessionConfig::default()).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_duplicate_constraint_name() {
        let f = factory();
        let a = ConstraintFactory::from::<i64>(&f);
        a.penalize("c", SimpleScore::new(1)).unwrap();
        let err = a.reward("c", SimpleScore::new(1)).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_empty_group_and_concat_mismatch() {
        let f = factory();
        let a = ConstraintFactory::from::<i64>(&f);
        a.group_by(Vec::new(), Vec::new()).penalize("empty", SimpleScore::new(1)).unwrap();
        a.join(&a, Vec::new()).concat(&a).penalize("mixed", SimpleScore::new(1)).unwrap();
        let err = f.borrow().build_session(&SessionConfig::default()).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("group_by"));
        assert!(message.contains("concat"));
    }

    #[test]
    fn test_build_wires_shared_nodes_once() {
        let f = factory();
        let a = ConstraintFactory::from::<i64>(&f);
        let positive: crate::functions::Predicate =
            Rc::new(|t: &crate::tuple::Tuple| t.fact_as::<i64>(0).map_or(false, |v| *v > 0));
        a.filter_shared(positive.clone()).penalize("p1", SimpleScore::new(1)).unwrap();
        a.filter_shared(positive).penalize("p2", SimpleScore::new(2)).unwrap();
        a.join(&a, vec![Joiners::equal(|_| KeyValue::Null, |_| KeyValue::Null)])
            .group_by(Vec::new(), vec![Collectors::count()])
            .penalize("pairs", SimpleScore::new(1))
            .unwrap();
        let session = f.borrow().build_session(&SessionConfig::default()).unwrap();
        let stats = session.statistics();
        // from, filter, 2 scorers, join, group, scorer
        assert_eq!(stats.total_nodes, 7);
        assert_eq!(stats.node_type_counts.get("Filter"), Some(&1));
        assert_eq!(stats.shared_streams, 1);
    }
}
