//session.rs
use crate::analysis::{ConstraintAnalysis, ConstraintViolationReport, NetworkStatistics};
use crate::arena::{NodeArena, NodeId, NodeOperation, TupleArena, TupleId};
use crate::error::{Result, ScorenetError};
use crate::fact::{downcast_fact, Fact};
use crate::nodes::{FromNode, NodeData};
use crate::resource_limits::SessionConfig;
use crate::score::Score;
use crate::score_inliner::{ConstraintMatch, ConstraintMatchTotal, ScoreInliner};
use crate::state::TupleState;
use rustc_hash::FxHashMap;
use std::any::TypeId;
use std::rc::Rc;
use tracing::{error, trace, warn};

/// Identity of an inserted fact, stable across updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FactHandle(pub u64);

#[derive(Debug)]
struct FactRecord {
    fact: Rc<dyn Fact>,
    tuple: TupleId,
    from: NodeId,
}

/// A built network with its working memory and running score.
///
/// Every mutation is propagated to completion before it returns. When
/// propagation fails half way the session is poisoned: queries keep working
/// but every further mutation returns [`ScorenetError::Poisoned`].
#[derive(Debug)]
pub struct Session<S: Score> {
    nodes: NodeArena,
    tuples: TupleArena,
    from_nodes: FxHashMap<TypeId, NodeId>,
    facts: FxHashMap<FactHandle, FactRecord>,
    next_handle: u64,
    inliner: ScoreInliner<S>,
    config: SessionConfig,
    poisoned: Option<String>,
    propagation_steps: u64,
    shared_streams: usize,
}

fn from_node(nodes: &NodeArena, id: NodeId) -> Result<&FromNode> {
    match nodes.get_node(id) {
        Some(NodeData::From(node)) => Ok(node),
        Some(other) => Err(ScorenetError::corruption(format!(
            "expected a from node, found {}",
            other.kind_name()
        ))),
        None => Err(ScorenetError::invalid_index(format!("from node {:?} does not exist", id))),
    }
}

impl<S: Score> Session<S> {
    pub(crate) fn new(
        nodes: NodeArena,
        from_nodes: FxHashMap<TypeId, NodeId>,
        inliner: ScoreInliner<S>,
        config: SessionConfig,
        shared_streams: usize,
    ) -> Self {
        Self {
            nodes,
            tuples: TupleArena::with_limits(&config.limits),
            from_nodes,
            facts: FxHashMap::default(),
            next_handle: 0,
            inliner,
            config,
            poisoned: None,
            propagation_steps: 0,
            shared_streams,
        }
    }

    pub fn insert<T: Fact>(&mut self, fact: T) -> Result<FactHandle> {
        self.insert_rc(Rc::new(fact))
    }

    pub fn insert_rc(&mut self, fact: Rc<dyn Fact>) -> Result<FactHandle> {
        self.check_usable()?;
        self.config.limits.check_fact_limit(self.facts.len())?;
        let from = *self
            .from_nodes
            .get(&fact.as_any().type_id())
            .ok_or_else(|| ScorenetError::unregistered_type(fact.type_name()))?;

        let mut operations = Vec::new();
        let tuple = from_node(&self.nodes, from)?.insert_fact(Rc::clone(&fact), &mut self.tuples, &mut operations)?;
        let handle = FactHandle(self.next_handle);
        self.next_handle += 1;
        trace!(handle = handle.0, fact = ?fact, "insert");
        self.facts.insert(handle, FactRecord { fact, tuple, from });
        self.propagate(operations, "insert")?;
        Ok(handle)
    }

    pub fn insert_batch<T: Fact>(&mut self, facts: impl IntoIterator<Item = T>) -> Result<Vec<FactHandle>> {
        facts.into_iter().map(|fact| self.insert(fact)).collect()
    }

    /// Replaces the fact behind `handle`. The new fact must have the same
    /// concrete type.
    pub fn update<T: Fact>(&mut self, handle: FactHandle, fact: T) -> Result<()> {
        self.update_rc(handle, Rc::new(fact))
    }

    pub fn update_rc(&mut self, handle: FactHandle, fact: Rc<dyn Fact>) -> Result<()> {
        self.check_usable()?;
        let (tuple, from) = match self.facts.get(&handle) {
            Some(record) if record.fact.as_any().type_id() != fact.as_any().type_id() => {
                return Err(ScorenetError::type_mismatch(format!(
                    "fact {} is a {}, cannot update it with a {}",
                    handle.0,
                    record.fact.type_name(),
                    fact.type_name()
                )));
            }
            Some(record) => (record.tuple, record.from),
            None => return Err(ScorenetError::FactNotFound(handle.0)),
        };

        let mut operations = Vec::new();
        trace!(handle = handle.0, fact = ?fact, "update");
        from_node(&self.nodes, from)?.update_fact(tuple, Rc::clone(&fact), &mut self.tuples, &mut operations)?;
        if let Some(record) = self.facts.get_mut(&handle) {
            record.fact = fact;
        }
        self.propagate(operations, "update")
    }

    /// Removes the fact behind `handle` and returns it.
    pub fn retract(&mut self, handle: FactHandle) -> Result<Rc<dyn Fact>> {
        self.check_usable()?;
        let (tuple, from) = match self.facts.get(&handle) {
            Some(record) => (record.tuple, record.from),
            None => return Err(ScorenetError::FactNotFound(handle.0)),
        };
        let mut operations = Vec::new();
        from_node(&self.nodes, from)?.retract_fact(tuple, &mut self.tuples, &mut operations)?;
        let record = self
            .facts
            .remove(&handle)
            .ok_or(ScorenetError::FactNotFound(handle.0))?;
        trace!(handle = handle.0, fact = ?record.fact, "retract");
        self.propagate(operations, "retract")?;
        Ok(record.fact)
    }

    /// Retracts every fact, oldest first.
    pub fn clear(&mut self) -> Result<()> {
        let mut handles: Vec<FactHandle> = self.facts.keys().copied().collect();
        handles.sort_unstable();
        for handle in handles {
            self.retract(handle)?;
        }
        Ok(())
    }

    fn check_usable(&self) -> Result<()> {
        match &self.poisoned {
            Some(reason) => {
                warn!(reason = reason.as_str(), "mutation rejected by poisoned session");
                Err(ScorenetError::poisoned(reason.clone()))
            }
            None => Ok(()),
        }
    }

    fn propagate(&mut self, operations: Vec<NodeOperation>, action: &str) -> Result<()> {
        match self
            .nodes
            .execute_operations(operations, &mut self.tuples, &mut self.inliner, &self.config.limits)
        {
            Ok(stats) => {
                self.propagation_steps += stats.steps as u64;
                trace!(action, steps = stats.steps, released = stats.released, score = ?self.inliner.score(), "propagated");
                Ok(())
            }
            Err(e) => {
                error!(action, error = %e, "propagation failed, session poisoned");
                self.poisoned = Some(format!("{} failed: {}", action, e));
                Err(e)
            }
        }
    }

    pub fn get_fact(&self, handle: FactHandle) -> Option<&Rc<dyn Fact>> {
        self.facts.get(&handle).map(|record| &record.fact)
    }

    pub fn get_fact_as<T: Fact>(&self, handle: FactHandle) -> Option<&T> {
        self.get_fact(handle).and_then(|fact| downcast_fact::<T>(fact.as_ref()))
    }

    pub fn contains(&self, handle: FactHandle) -> bool {
        self.facts.contains_key(&handle)
    }

    pub fn handles(&self) -> impl Iterator<Item = FactHandle> + '_ {
        self.facts.keys().copied()
    }

    pub fn score(&self) -> S {
        self.inliner.score()
    }

    pub fn fact_count(&self) -> usize {
        self.facts.len()
    }

    /// Every tracked contribution; requires constraint match tracking.
    pub fn constraint_matches(&self) -> Result<Vec<ConstraintMatch<S>>> {
        self.inliner.constraint_matches()
    }

    pub fn constraint_match_totals(&self) -> Vec<ConstraintMatchTotal<S>> {
        self.inliner.constraint_match_totals()
    }

    /// Changes the weight of a constraint; the score is re-derived without
    /// propagating anything.
    pub fn set_constraint_weight(&mut self, name: &str, weight: S) -> Result<()> {
        self.check_usable()?;
        self.inliner.set_constraint_weight(name, weight)
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.is_some()
    }

    pub fn poison_reason(&self) -> Option<&str> {
        self.poisoned.as_deref()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Checks that the network is quiet and internally coherent: every live
    /// tuple settled, every fact backed by a live tuple, every node's
    /// bookkeeping matching the tuple stores, and the score equal to the sum
    /// of the constraint totals.
    pub fn validate_consistency(&self) -> Result<()> {
        for (id, tuple) in self.tuples.iter() {
            if tuple.state() != TupleState::Ok {
                return Err(ScorenetError::consistency_violation(format!(
                    "tuple {:?} ({}) is {:?} between mutations",
                    id.index(),
                    tuple.describe(),
                    tuple.state()
                )));
            }
        }
        for (handle, record) in &self.facts {
            if !self.tuples.contains(record.tuple) {
                return Err(ScorenetError::consistency_violation(format!(
                    "fact {} has no live source tuple",
                    handle.0
                )));
            }
        }
        for (_, node) in self.nodes.iter() {
            node.check_consistency(&self.tuples)?;
        }
        let total = self
            .inliner
            .constraint_match_totals()
            .into_iter()
            .fold(S::null_score(), |acc, t| acc + t.score);
        if total != self.inliner.score() {
            return Err(ScorenetError::consistency_violation(format!(
                "score {:?} differs from the constraint totals {:?}",
                self.inliner.score(),
                total
            )));
        }
        Ok(())
    }

    pub fn statistics(&self) -> NetworkStatistics {
        ConstraintAnalysis::network_statistics(self)
    }

    pub fn violation_report(&self) -> ConstraintViolationReport<S> {
        ConstraintAnalysis::analyze_violations(self)
    }

    pub(crate) fn nodes(&self) -> &NodeArena {
        &self.nodes
    }

    pub(crate) fn tuples(&self) -> &TupleArena {
        &self.tuples
    }

    pub(crate) fn inliner(&self) -> &ScoreInliner<S> {
        &self.inliner
    }

    pub(crate) fn shared_streams(&self) -> usize {
        self.shared_streams
    }

    pub(crate) fn propagation_steps(&self) -> u64 {
        self.propagation_steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::Collectors;
    use crate::constraint_builder::ConstraintBuilder;
    use crate::functions::GroupKeyFn;
    use crate::joiner::Joiners;
    use crate::key::KeyValue;
    use crate::resource_limits::ResourceLimits;
    use crate::score::{HardSoftScore, SimpleScore};
    use crate::scorer::Weigher;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    struct A {
        name: &'static str,
        key: i64,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    struct B {
        name: &'static str,
        key: i64,
    }

    crate::impl_fact!(A, B);

    fn a_key(t: &crate::tuple::Tuple) -> KeyValue {
        t.fact_as::<A>(0).map_or(KeyValue::Null, |a| KeyValue::Int(a.key))
    }

    fn b_key(t: &crate::tuple::Tuple) -> KeyValue {
        t.fact_as::<B>(0).map_or(KeyValue::Null, |b| KeyValue::Int(b.key))
    }

    fn joined_session() -> Session<SimpleScore> {
        let builder = ConstraintBuilder::<SimpleScore>::new();
        builder
            .for_each::<A>()
            .join(&builder.for_each::<B>(), vec![Joiners::equal(a_key, b_key)])
            .penalize("a meets b", SimpleScore::new(1))
            .unwrap();
        builder.build().unwrap()
    }

    #[test]
    fn test_join_scenario() {
        let mut session = joined_session();
        let a1 = session.insert(A { name: "a1", key: 1 }).unwrap();
        session.insert(A { name: "a2", key: 2 }).unwrap();
        session.insert(B { name: "b1", key: 1 }).unwrap();
        session.insert(B { name: "b2", key: 3 }).unwrap();
        assert_eq!(session.score(), SimpleScore::new(-1));

        let removed = session.retract(a1).unwrap();
        assert_eq!(downcast_fact::<A>(removed.as_ref()).map(|a| a.name), Some("a1"));
        assert_eq!(session.score(), SimpleScore::new(0));

        session.insert(A { name: "a1", key: 1 }).unwrap();
        assert_eq!(session.score(), SimpleScore::new(-1));
        session.validate_consistency().unwrap();
    }

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    struct Team {
        members: Vec<i64>,
    }

    crate::impl_fact!(Team);

    #[test]
    fn test_flatten_last_scenario() {
        let builder = ConstraintBuilder::<SimpleScore>::new();
        builder
            .for_each::<Team>()
            .flatten_last(|fact: &Rc<dyn Fact>| {
                downcast_fact::<Team>(fact.as_ref()).map_or_else(Vec::new, |team| {
                    team.members.iter().map(|m| Rc::new(*m) as Rc<dyn Fact>).collect()
                })
            })
            .penalize_with(
                "member load",
                SimpleScore::new(1),
                Weigher::long(|t: &crate::tuple::Tuple| t.fact_as::<i64>(0).copied().unwrap_or(0)),
            )
            .unwrap();
        let mut session = builder.build().unwrap();

        let first = session.insert(Team { members: vec![1, 2, 3] }).unwrap();
        assert_eq!(session.score(), SimpleScore::new(-6));
        session.insert(Team { members: vec![5, 5] }).unwrap();
        assert_eq!(session.score(), SimpleScore::new(-16));
        session.update(first, Team { members: vec![4] }).unwrap();
        assert_eq!(session.score(), SimpleScore::new(-14));
        session.update(first, Team { members: Vec::new() }).unwrap();
        assert_eq!(session.score(), SimpleScore::new(-10));
        session.retract(first).unwrap();
        assert_eq!(session.score(), SimpleScore::new(-10));
        session.validate_consistency().unwrap();
    }

    #[test]
    fn test_concat_scenario() {
        let builder = ConstraintBuilder::<SimpleScore>::new();
        let a = builder.for_each::<A>();
        a.filter(|t: &crate::tuple::Tuple| t.fact_as::<A>(0).map_or(false, |a| a.key > 0))
            .concat(&a.filter(|t: &crate::tuple::Tuple| t.fact_as::<A>(0).map_or(false, |a| a.key > 5)))
            .penalize("positive or big", SimpleScore::new(1))
            .unwrap();
        let mut session = builder.build().unwrap();

        let h = session.insert(A { name: "a", key: 3 }).unwrap();
        assert_eq!(session.score(), SimpleScore::new(-1));
        session.update(h, A { name: "a", key: 7 }).unwrap();
        assert_eq!(session.score(), SimpleScore::new(-2));
        session.insert(A { name: "b", key: -1 }).unwrap();
        assert_eq!(session.score(), SimpleScore::new(-2));
        session.update(h, A { name: "a", key: 0 }).unwrap();
        assert_eq!(session.score(), SimpleScore::new(0));
        session.update(h, A { name: "a", key: 9 }).unwrap();
        session.retract(h).unwrap();
        assert_eq!(session.score(), SimpleScore::new(0));
        session.validate_consistency().unwrap();
    }

    #[test]
    fn test_rejected_update_keeps_old_fact() {
        let mut session = joined_session();
        let h = session.insert(A { name: "a", key: 1 }).unwrap();
        let tuple = session.facts[&h].tuple;
        session.tuples.set_state(tuple, TupleState::Dying).unwrap();

        let err = session.update(h, A { name: "a", key: 2 }).unwrap_err();
        assert!(err.is_corruption());
        assert_eq!(session.get_fact_as::<A>(h).map(|a| a.key), Some(1));
        session.tuples.set_state(tuple, TupleState::Ok).unwrap();
        session.validate_consistency().unwrap();
    }

    #[test]
    fn test_update_moves_join_match() {
        let mut session = joined_session();
        let a = session.insert(A { name: "a", key: 1 }).unwrap();
        session.insert(B { name: "b", key: 2 }).unwrap();
        assert_eq!(session.score(), SimpleScore::new(0));
        session.update(a, A { name: "a", key: 2 }).unwrap();
        assert_eq!(session.score(), SimpleScore::new(-1));
        assert_eq!(session.get_fact_as::<A>(a).map(|a| a.key), Some(2));
        session.validate_consistency().unwrap();
    }

    #[test]
    fn test_filter_follows_updates() {
        let builder = ConstraintBuilder::<SimpleScore>::new();
        builder
            .for_each::<A>()
            .filter(|t| t.fact_as::<A>(0).map_or(false, |a| a.key > 10))
            .penalize_with("big keys", SimpleScore::new(1), Weigher::long(|t| t.fact_as::<A>(0).map_or(0, |a| a.key)))
            .unwrap();
        let mut session = builder.build().unwrap();
        let h = session.insert(A { name: "x", key: 5 }).unwrap();
        assert_eq!(session.score(), SimpleScore::new(0));
        session.update(h, A { name: "x", key: 12 }).unwrap();
        assert_eq!(session.score(), SimpleScore::new(-12));
        session.update(h, A { name: "x", key: 20 }).unwrap();
        assert_eq!(session.score(), SimpleScore::new(-20));
        session.update(h, A { name: "x", key: 1 }).unwrap();
        assert_eq!(session.score(), SimpleScore::new(0));
        session.validate_consistency().unwrap();
    }

    #[test]
    fn test_if_not_exists() {
        let builder = ConstraintBuilder::<HardSoftScore>::new();
        builder
            .for_each::<A>()
            .if_not_exists(&builder.for_each::<B>(), vec![Joiners::equal(a_key, b_key)])
            .penalize("unmatched a", HardSoftScore::hard(1))
            .unwrap();
        let mut session = builder.build().unwrap();
        session.insert(A { name: "a", key: 1 }).unwrap();
        assert_eq!(session.score(), HardSoftScore::hard(-1));
        assert!(!session.score().is_feasible());
        let b = session.insert(B { name: "b", key: 1 }).unwrap();
        let b2 = session.insert(B { name: "b2", key: 1 }).unwrap();
        assert_eq!(session.score(), HardSoftScore::hard(0));
        session.retract(b).unwrap();
        assert_eq!(session.score(), HardSoftScore::hard(0));
        session.retract(b2).unwrap();
        assert_eq!(session.score(), HardSoftScore::hard(-1));
        session.validate_consistency().unwrap();
    }

    #[test]
    fn test_group_count_per_key() {
        let key: GroupKeyFn = Rc::new(|t: &crate::tuple::Tuple| -> Rc<dyn Fact> {
            Rc::new(t.fact_as::<A>(0).map_or(0, |a| a.key))
        });
        let builder = ConstraintBuilder::<SimpleScore>::new();
        builder
            .for_each::<A>()
            .group_by(vec![key], vec![Collectors::count()])
            .filter(|t| t.fact_as::<usize>(1).map_or(false, |count| *count > 1))
            .penalize_with(
                "crowded key",
                SimpleScore::new(1),
                Weigher::long(|t| t.fact_as::<usize>(1).map_or(0, |count| *count as i64)),
            )
            .unwrap();
        let mut session = builder.build().unwrap();
        let first = session.insert(A { name: "p", key: 7 }).unwrap();
        assert_eq!(session.score(), SimpleScore::new(0));
        session.insert(A { name: "q", key: 7 }).unwrap();
        session.insert(A { name: "r", key: 8 }).unwrap();
        assert_eq!(session.score(), SimpleScore::new(-2));
        session.update(first, A { name: "p", key: 8 }).unwrap();
        assert_eq!(session.score(), SimpleScore::new(-2));
        session.retract(first).unwrap();
        assert_eq!(session.score(), SimpleScore::new(0));
        session.validate_consistency().unwrap();
    }

    #[test]
    fn test_handle_and_type_errors() {
        let mut session = joined_session();
        let h = session.insert(A { name: "a", key: 1 }).unwrap();
        let err = session.update(h, B { name: "b", key: 1 }).unwrap_err();
        assert!(matches!(err, ScorenetError::TypeMismatch { .. }));
        let err = session.insert(42i64).unwrap_err();
        assert!(matches!(err, ScorenetError::UnregisteredType { .. }));
        session.retract(h).unwrap();
        assert!(matches!(session.retract(h), Err(ScorenetError::FactNotFound(_))));
        assert!(!session.is_poisoned());
        session.validate_consistency().unwrap();
    }

    #[test]
    fn test_panicking_predicate_poisons_session() {
        let builder = ConstraintBuilder::<SimpleScore>::new();
        builder
            .for_each::<A>()
            .filter(|t| {
                let a = t.fact_as::<A>(0).map_or(0, |a| a.key);
                assert!(a >= 0, "negative key");
                true
            })
            .penalize("any", SimpleScore::new(1))
            .unwrap();
        let mut session = builder.build().unwrap();
        session.insert(A { name: "ok", key: 1 }).unwrap();
        let err = session.insert(A { name: "bad", key: -1 }).unwrap_err();
        assert!(err.is_user_code());
        assert!(err.to_string().contains("bad"));
        assert!(session.is_poisoned());
        let err = session.insert(A { name: "later", key: 2 }).unwrap_err();
        assert!(matches!(err, ScorenetError::Poisoned { .. }));
        assert_eq!(session.score(), SimpleScore::new(-1));
    }

    #[test]
    fn test_fact_limit() {
        let builder = ConstraintBuilder::<SimpleScore>::new().with_config(SessionConfig::new().with_limits(
            ResourceLimits {
                max_facts: 2,
                ..ResourceLimits::default()
            },
        ));
        builder.for_each::<A>().penalize("any", SimpleScore::new(1)).unwrap();
        let mut session = builder.build().unwrap();
        session.insert(A { name: "1", key: 1 }).unwrap();
        session.insert(A { name: "2", key: 2 }).unwrap();
        let err = session.insert(A { name: "3", key: 3 }).unwrap_err();
        assert!(matches!(err, ScorenetError::ResourceLimit { .. }));
        assert!(!session.is_poisoned());
    }

    #[test]
    fn test_weight_change_and_matches() {
        let builder = ConstraintBuilder::<SimpleScore>::new()
            .with_config(SessionConfig::new().with_constraint_matches(true));
        builder
            .for_each::<A>()
            .join(&builder.for_each::<B>(), vec![Joiners::equal(a_key, b_key)])
            .penalize("a meets b", SimpleScore::new(1))
            .unwrap();
        let mut session = builder.build().unwrap();
        session.insert(A { name: "a", key: 1 }).unwrap();
        session.insert(B { name: "b", key: 1 }).unwrap();
        session.insert(B { name: "c", key: 1 }).unwrap();
        session.set_constraint_weight("a meets b", SimpleScore::new(5)).unwrap();
        assert_eq!(session.score(), SimpleScore::new(-10));

        let matches = session.constraint_matches().unwrap();
        assert_eq!(matches.len(), 2);
        assert!(matches.iter().all(|m| m.justification.len() == 2));
        let totals = session.constraint_match_totals();
        assert_eq!(totals[0].match_count, 2);
        assert!(session.set_constraint_weight("missing", SimpleScore::new(1)).is_err());
    }

    #[test]
    fn test_clear_returns_to_empty() {
        let mut session = joined_session();
        session.insert_batch((0..5).map(|key| A { name: "a", key })).unwrap();
        session.insert_batch((0..5).map(|key| B { name: "b", key })).unwrap();
        assert_eq!(session.score(), SimpleScore::new(-5));
        session.clear().unwrap();
        assert_eq!(session.fact_count(), 0);
        assert_eq!(session.score(), SimpleScore::new(0));
        assert!(session.tuples().is_empty());
    }

    fn mixed_session() -> Session<SimpleScore> {
        let builder = ConstraintBuilder::<SimpleScore>::new()
            .with_config(SessionConfig::new().with_constraint_matches(true));
        let a = builder.for_each::<A>();
        let b = builder.for_each::<B>();
        a.join(&b, vec![Joiners::equal(a_key, b_key)])
            .penalize("pairs", SimpleScore::new(1))
            .unwrap();
        a.if_exists(&b, vec![Joiners::less_than(a_key, b_key)])
            .reward("smaller a", SimpleScore::new(2))
            .unwrap();
        a.group_by(Vec::new(), vec![Collectors::sum(|t| t.fact_as::<A>(0).map_or(0, |a| a.key))])
            .penalize_with("key sum", SimpleScore::new(1), Weigher::long(|t| t.fact_as::<i64>(0).copied().unwrap_or(0)))
            .unwrap();
        builder.build().unwrap()
    }

    /// Justifications per constraint, order independent.
    fn match_summary(session: &Session<SimpleScore>) -> Vec<(String, Vec<String>)> {
        let mut by_constraint: FxHashMap<String, Vec<String>> = FxHashMap::default();
        for m in session.constraint_matches().unwrap() {
            by_constraint
                .entry(m.constraint_name)
                .or_default()
                .push(format!("{:?}", m.justification));
        }
        let mut summary: Vec<(String, Vec<String>)> = by_constraint.into_iter().collect();
        for (_, justifications) in &mut summary {
            justifications.sort();
        }
        summary.sort();
        summary
    }

    proptest! {
        #[test]
        fn prop_update_equals_retract_then_insert(
            a_keys in proptest::collection::vec(0i64..4, 1..8),
            b_keys in proptest::collection::vec(0i64..4, 1..8),
            changes in proptest::collection::vec((any::<bool>(), any::<prop::sample::Index>(), 0i64..4), 1..12),
        ) {
            let mut updated = mixed_session();
            let mut replaced = mixed_session();
            let mut updated_handles = (Vec::new(), Vec::new());
            let mut replaced_handles = (Vec::new(), Vec::new());
            for key in &a_keys {
                updated_handles.0.push(updated.insert(A { name: "a", key: *key }).unwrap());
                replaced_handles.0.push(replaced.insert(A { name: "a", key: *key }).unwrap());
            }
            for key in &b_keys {
                updated_handles.1.push(updated.insert(B { name: "b", key: *key }).unwrap());
                replaced_handles.1.push(replaced.insert(B { name: "b", key: *key }).unwrap());
            }

            for (on_a, index, key) in changes {
                if on_a {
                    let i = index.index(a_keys.len());
                    updated.update(updated_handles.0[i], A { name: "a", key }).unwrap();
                    replaced.retract(replaced_handles.0[i]).unwrap();
                    replaced_handles.0[i] = replaced.insert(A { name: "a", key }).unwrap();
                } else {
                    let i = index.index(b_keys.len());
                    updated.update(updated_handles.1[i], B { name: "b", key }).unwrap();
                    replaced.retract(replaced_handles.1[i]).unwrap();
                    replaced_handles.1[i] = replaced.insert(B { name: "b", key }).unwrap();
                }
                prop_assert_eq!(updated.score(), replaced.score());
                prop_assert_eq!(updated.constraint_match_totals(), replaced.constraint_match_totals());
                prop_assert_eq!(match_summary(&updated), match_summary(&replaced));
            }
            updated.validate_consistency().unwrap();
            replaced.validate_consistency().unwrap();
        }

        #[test]
        fn prop_retract_undoes_insert(
            a_keys in proptest::collection::vec(0i64..4, 0..12),
            b_keys in proptest::collection::vec(0i64..4, 0..12),
            seed in any::<u64>(),
        ) {
            let mut session = mixed_session();

            let mut handles = Vec::new();
            for key in &a_keys {
                handles.push(session.insert(A { name: "a", key: *key }).unwrap());
            }
            for key in &b_keys {
                handles.push(session.insert(B { name: "b", key: *key }).unwrap());
            }
            session.validate_consistency().unwrap();

            handles.shuffle(&mut StdRng::seed_from_u64(seed));
            for handle in handles {
                session.retract(handle).unwrap();
            }
            prop_assert_eq!(session.score(), SimpleScore::new(0));
            prop_assert!(session.tuples().is_empty());
            session.validate_consistency().unwrap();
        }
    }
}
