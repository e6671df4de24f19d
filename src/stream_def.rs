// stream_def.rs - Declarative stream graph
//! Streams describe the network before it exists. Each operation on a
//! [`Stream`] records a [`StreamDefinition`] in its [`ConstraintFactory`];
//! definitions with an equal [`RetrievalId`] are recorded once and shared.

use crate::arena::Side;
use crate::collectors::CollectorSupplier;
use crate::constraint::ConstraintId;
use crate::error::Result;
use crate::fact::{Fact, Facts};
use crate::factory::ConstraintFactory;
use crate::functions::{function_id, Flattener, GroupKeyFn, Mapper, PairPredicate, Predicate};
use crate::joiner::{Joiner, JoinerType};
use crate::score::Score;
use crate::scorer::Weigher;
use crate::tuple::Tuple;
use smallvec::{smallvec, SmallVec};
use std::any::TypeId;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Position of a definition in its factory, in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub usize);

/// Identity of a joiner: its relation and the addresses of both key functions.
pub type JoinerId = (JoinerType, usize, usize);

/// Structural identity of a definition. Parents are already deduplicated, so
/// comparing their ids is enough.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RetrievalId {
    From(TypeId),
    Filter {
        source: StreamId,
        predicate: usize,
    },
    Join {
        left: StreamId,
        right: StreamId,
        joiners: Vec<JoinerId>,
        filter: Option<usize>,
    },
    IfExists {
        left: StreamId,
        right: StreamId,
        should_exist: bool,
        joiners: Vec<JoinerId>,
        filter: Option<usize>,
    },
    Map {
        source: StreamId,
        mapper: usize,
        arity: usize,
        expand: bool,
    },
    FlattenLast {
        source: StreamId,
        flattener: usize,
    },
    Concat {
        left: StreamId,
        right: StreamId,
    },
    Group {
        source: StreamId,
        keys: Vec<usize>,
        collectors: Vec<usize>,
    },
    Scorer {
        source: StreamId,
        constraint: ConstraintId,
    },
}

fn joiner_ids(joiners: &[Joiner]) -> Vec<JoinerId> {
    joiners
        .iter()
        .map(|j| (j.joiner_type, function_id(&j.left), function_id(&j.right)))
        .collect()
}

#[derive(Clone)]
pub enum StreamDefinition {
    From {
        fact_type: TypeId,
        type_name: &'static str,
    },
    Filter {
        source: StreamId,
        predicate: Predicate,
    },
    Join {
        left: StreamId,
        right: StreamId,
        joiners: Vec<Joiner>,
        filter: Option<PairPredicate>,
    },
    IfExists {
        left: StreamId,
        right: StreamId,
        should_exist: bool,
        joiners: Vec<Joiner>,
        filter: Option<PairPredicate>,
    },
    Map {
        source: StreamId,
        mapper: Mapper,
        arity: usize,
        expand: bool,
    },
    FlattenLast {
        source: StreamId,
        flattener: Flattener,
    },
    Concat {
        left: StreamId,
        right: StreamId,
    },
    Group {
        source: StreamId,
        keys: Vec<GroupKeyFn>,
        collectors: Vec<CollectorSupplier>,
    },
    Scorer {
        source: StreamId,
        constraint: ConstraintId,
        constraint_name: Rc<str>,
        weigher: Weigher,
    },
}

impl StreamDefinition {
    pub fn retrieval_id(&self) -> RetrievalId {
        match self {
            StreamDefinition::From { fact_type, .. } => RetrievalId::From(*fact_type),
            StreamDefinition::Filter { source, predicate } => RetrievalId::Filter {
                source: *source,
                predicate: function_id(predicate),
            },
            StreamDefinition::Join {
                left,
                right,
                joiners,
                filter,
            } => RetrievalId::Join {
                left: *left,
                right: *right,
                joiners: joiner_ids(joiners),
                filter: filter.as_ref().map(function_id),
            },
            StreamDefinition::IfExists {
                left,
                right,
                should_exist,
                joiners,
                filter,
            } => RetrievalId::IfExists {
                left: *left,
                right: *right,
                should_exist: *should_exist,
                joiners: joiner_ids(joiners),
                filter: filter.as_ref().map(function_id),
            },
            StreamDefinition::Map {
                source,
                mapper,
                arity,
                expand,
            } => RetrievalId::Map {
                source: *source,
                mapper: function_id(mapper),
                arity: *arity,
                expand: *expand,
            },
            StreamDefinition::FlattenLast { source, flattener } => RetrievalId::FlattenLast {
                source: *source,
                flattener: function_id(flattener),
            },
            StreamDefinition::Concat { left, right } => RetrievalId::Concat {
                left: *left,
                right: *right,
            },
            StreamDefinition::Group {
                source,
                keys,
                collectors,
            } => RetrievalId::Group {
                source: *source,
                keys: keys.iter().map(function_id).collect(),
                collectors: collectors.iter().map(function_id).collect(),
            },
            StreamDefinition::Scorer {
                source, constraint, ..
            } => RetrievalId::Scorer {
                source: *source,
                constraint: *constraint,
            },
        }
    }

    /// The streams this one consumes, with the input side each feeds.
    pub fn inputs(&self) -> SmallVec<[(StreamId, Side); 2]> {
        match self {
            StreamDefinition::From { .. } => SmallVec::new(),
            StreamDefinition::Filter { source, .. }
            | StreamDefinition::Map { source, .. }
            | StreamDefinition::FlattenLast { source, .. }
            | StreamDefinition::Group { source, .. }
            | StreamDefinition::Scorer { source, .. } => smallvec![(*source, Side::Left)],
            StreamDefinition::Join { left, right, .. }
            | StreamDefinition::IfExists { left, right, .. }
            | StreamDefinition::Concat { left, right } => {
                smallvec![(*left, Side::Left), (*right, Side::Right)]
            }
        }
    }

    /// Whether the runtime node allocates its own output tuples rather than
    /// passing upstream tuples through.
    pub fn creates_tuples(&self) -> bool {
        !matches!(
            self,
            StreamDefinition::Filter { .. } | StreamDefinition::IfExists { .. } | StreamDefinition::Scorer { .. }
        )
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            StreamDefinition::From { .. } => "From",
            StreamDefinition::Filter { .. } => "Filter",
            StreamDefinition::Join { .. } => "Join",
            StreamDefinition::IfExists { should_exist: true, .. } => "IfExists",
            StreamDefinition::IfExists { .. } => "IfNotExists",
            StreamDefinition::Map { expand: true, .. } => "Expand",
            StreamDefinition::Map { .. } => "Map",
            StreamDefinition::FlattenLast { .. } => "FlattenLast",
            StreamDefinition::Concat { .. } => "Concat",
            StreamDefinition::Group { .. } => "Group",
            StreamDefinition::Scorer { .. } => "Scorer",
        }
    }
}

impl fmt::Debug for StreamDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamDefinition::From { type_name, .. } => write!(f, "From({})", type_name),
            StreamDefinition::Scorer {
                source,
                constraint_name,
                ..
            } => write!(f, "Scorer({:?} -> '{}')", source, constraint_name),
            other => write!(f, "{}({:?})", other.kind_name(), other.inputs()),
        }
    }
}

/// Handle on a declared stream. Operations return new handles and never
/// modify the stream they are called on.
#[derive(Clone)]
pub struct Stream<S: Score> {
    pub(crate) id: StreamId,
    pub(crate) arity: usize,
    pub(crate) factory: Rc<RefCell<ConstraintFactory<S>>>,
}

impl<S: Score> fmt::Debug for Stream<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("arity", &self.arity)
            .finish()
    }
}

impl<S: Score> Stream<S> {
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Number of facts in the tuples of this stream.
    pub fn arity(&self) -> usize {
        self.arity
    }

    fn derive(&self, definition: StreamDefinition) -> Self {
        ConstraintFactory::add_stream(&self.factory, definition)
    }

    /// Registers a problem for build time when `other` belongs to another
    /// factory.
    fn check_same_factory(&self, other: &Stream<S>, operation: &str) {
        if !Rc::ptr_eq(&self.factory, &other.factory) {
            self.factory
                .borrow_mut()
                .report(format!("{} combines streams of different factories", operation));
        }
    }

    pub fn filter<F>(&self, predicate: F) -> Self
    where
        F: Fn(&Tuple) -> bool + 'static,
    {
        self.filter_shared(Rc::new(predicate))
    }

    /// Like [`Stream::filter`]; passing the same `Rc` twice on the same
    /// stream yields one shared node.
    pub fn filter_shared(&self, predicate: Predicate) -> Self {
        self.derive(StreamDefinition::Filter {
            source: self.id,
            predicate,
        })
    }

    pub fn join(&self, other: &Stream<S>, joiners: Vec<Joiner>) -> Self {
        self.join_with(other, joiners, None)
    }

    /// Join with a residual filter applied to each indexed match.
    pub fn join_filtered<F>(&self, other: &Stream<S>, joiners: Vec<Joiner>, filter: F) -> Self
    where
        F: Fn(&Tuple, &Tuple) -> bool + 'static,
    {
        self.join_with(other, joiners, Some(Rc::new(filter)))
    }

    pub fn join_with(&self, other: &Stream<S>, joiners: Vec<Joiner>, filter: Option<PairPredicate>) -> Self {
        self.check_same_factory(other, "join");
        self.derive(StreamDefinition::Join {
            left: self.id,
            right: other.id,
            joiners,
            filter,
        })
    }

    pub fn if_exists(&self, other: &Stream<S>, joiners: Vec<Joiner>) -> Self {
        self.exists_with(other, true, joiners, None)
    }

    pub fn if_not_exists(&self, other: &Stream<S>, joiners: Vec<Joiner>) -> Self {
        self.exists_with(other, false, joiners, None)
    }

    pub fn if_exists_filtered<F>(&self, other: &Stream<S>, joiners: Vec<Joiner>, filter: F) -> Self
    where
        F: Fn(&Tuple, &Tuple) -> bool + 'static,
    {
        self.exists_with(other, true, joiners, Some(Rc::new(filter)))
    }

    pub fn if_not_exists_filtered<F>(&self, other: &Stream<S>, joiners: Vec<Joiner>, filter: F) -> Self
    where
        F: Fn(&Tuple, &Tuple) -> bool + 'static,
    {
        self.exists_with(other, false, joiners, Some(Rc::new(filter)))
    }

    pub fn exists_with(
        &self,
        other: &Stream<S>,
        should_exist: bool,
        joiners: Vec<Joiner>,
        filter: Option<PairPredicate>,
    ) -> Self {
        self.check_same_factory(other, "if_exists");
        self.derive(StreamDefinition::IfExists {
            left: self.id,
            right: other.id,
            should_exist,
            joiners,
            filter,
        })
    }

    /// Replaces each tuple by `arity` facts computed from it.
    pub fn map<F>(&self, arity: usize, mapper: F) -> Self
    where
        F: Fn(&Tuple) -> Facts + 'static,
    {
        self.map_shared(arity, Rc::new(mapper))
    }

    pub fn map_shared(&self, arity: usize, mapper: Mapper) -> Self {
        self.derive(StreamDefinition::Map {
            source: self.id,
            mapper,
            arity,
            expand: false,
        })
    }

    /// Appends `added` facts computed from each tuple.
    pub fn expand<F>(&self, added: usize, mapper: F) -> Self
    where
        F: Fn(&Tuple) -> Facts + 'static,
    {
        self.derive(StreamDefinition::Map {
            source: self.id,
            mapper: Rc::new(mapper),
            arity: self.arity + added,
            expand: true,
        })
    }

    /// Replaces the last fact of each tuple by each item it flattens into.
    pub fn flatten_last<F>(&self, flattener: F) -> Self
    where
        F: Fn(&Rc<dyn Fact>) -> Vec<Rc<dyn Fact>> + 'static,
    {
        self.derive(StreamDefinition::FlattenLast {
            source: self.id,
            flattener: Rc::new(flattener),
        })
    }

    pub fn concat(&self, other: &Stream<S>) -> Self {
        self.check_same_factory(other, "concat");
        self.derive(StreamDefinition::Concat {
            left: self.id,
            right: other.id,
        })
    }

    /// Groups by the key functions and aggregates each group with the
    /// collectors. The resulting tuples hold the keys, then the results.
    pub fn group_by(&self, keys: Vec<GroupKeyFn>, collectors: Vec<CollectorSupplier>) -> Self {
        self.derive(StreamDefinition::Group {
            source: self.id,
            keys,
            collectors,
        })
    }

    /// Aggregates the whole stream into a single tuple.
    pub fn aggregate(&self, collectors: Vec<CollectorSupplier>) -> Self {
        self.group_by(Vec::new(), collectors)
    }

    /// Penalizes every tuple by `weight`.
    pub fn penalize(&self, name: &str, weight: S) -> Result<ConstraintId> {
        self.penalize_with(name, weight, Weigher::unit())
    }

    /// Penalizes every tuple by `weight` times its match weight.
    pub fn penalize_with(&self, name: &str, weight: S, weigher: Weigher) -> Result<ConstraintId> {
        ConstraintFactory::add_constraint(&self.factory, self.id, name, weight, crate::constraint::ImpactType::Penalty, weigher)
    }

    pub fn reward(&self, name: &str, weight: S) -> Result<ConstraintId> {
        self.reward_with(name, weight, Weigher::unit())
    }

    pub fn reward_with(&self, name: &str, weight: S, weigher: Weigher) -> Result<ConstraintId> {
        ConstraintFactory::add_constraint(&self.factory, self.id, name, weight, crate::constraint::ImpactType::Reward, weigher)
    }
}
