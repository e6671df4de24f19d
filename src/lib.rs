// lib.rs - Main library file
//!
//! Incremental constraint score evaluation over a RETE-style dataflow
//! network. Constraints are declared as streams on a [`ConstraintBuilder`];
//! the built [`Session`] keeps the score current as facts are inserted,
//! updated and retracted, touching only the part of the network a change
//! reaches.

pub mod analysis;
pub mod arena;
pub mod collectors;
pub mod constraint;
pub mod constraint_builder;
pub mod error;
pub mod exists_node;
pub mod fact;
pub mod fact_impls;
pub mod factory;
pub mod functions;
pub mod group_node;
pub mod indexed_set;
pub mod indexer;
pub mod join_node;
pub mod joiner;
pub mod key;
pub(crate) mod lifecycle;
pub mod node_sharing;
pub mod nodes;
pub mod random_iter;
pub mod resource_limits;
pub mod score;
pub mod score_inliner;
pub mod scorer;
pub mod session;
pub mod state;
pub mod stream_def;
pub mod tuple;

pub use analysis::{ConstraintAnalysis, ConstraintViolation, ConstraintViolationReport, NetworkStatistics};
pub use collectors::{Collector, CollectorSupplier, Collectors};
pub use constraint::{ConstraintId, ConstraintWeights, ImpactType};
pub use constraint_builder::ConstraintBuilder;
pub use error::{Result, ScorenetError};
pub use fact::{downcast_fact, Fact, FactKey, Facts};
pub use fact_impls::{FactList, FactSet};
pub use functions::{Flattener, GroupKeyFn, Mapper, PairPredicate, Predicate};
pub use indexer::{IndexHandle, Indexer, LevelKind};
pub use joiner::{Joiner, JoinerType, Joiners};
pub use key::{IndexKeys, KeyValue};
pub use resource_limits::{ResourceLimits, SessionConfig};
pub use score::{HardMediumSoftScore, HardSoftDecimalScore, HardSoftScore, Score, SimpleDecimalScore, SimpleScore};
pub use score_inliner::{ConstraintMatch, ConstraintMatchTotal};
pub use scorer::{MatchWeight, Weigher};
pub use session::{FactHandle, Session};
pub use state::TupleState;
pub use stream_def::{Stream, StreamId};
pub use tuple::{Tuple, MAX_ARITY};

/// Panics in debug builds when a session is not quiet and coherent between
/// mutations (unsettled tuples, stale bookkeeping, score drift).
#[macro_export]
macro_rules! assert_no_leaks {
    ($session:expr) => {
        #[cfg(debug_assertions)]
        if let Err(e) = $session.validate_consistency() {
            panic!("Memory leak detected: {}", e);
        }
    };
}

/// Convenience function to create a new constraint builder.
pub fn builder<S: Score>() -> ConstraintBuilder<S> {
    ConstraintBuilder::new()
}

/// Convenience function to create a constraint builder with custom resource limits.
pub fn builder_with_limits<S: Score>(limits: ResourceLimits) -> ConstraintBuilder<S> {
    ConstraintBuilder::new().with_config(SessionConfig::new().with_limits(limits))
}

/// A "prelude" module for easily importing the most commonly used types.
pub mod prelude {
    pub use crate::{
        builder, builder_with_limits, Collectors, ConstraintBuilder, Fact, FactHandle, GroupKeyFn,
        HardMediumSoftScore, HardSoftScore, Joiners, KeyValue, ResourceLimits, Result, Score,
        ScorenetError, Session, SessionConfig, SimpleScore, Stream, Tuple, Weigher,
    };

    pub use std::rc::Rc;
}
