// scorer.rs - Terminal scoring nodes
use crate::arena::{TupleArena, TupleId};
use crate::constraint::ConstraintId;
use crate::error::{Result, ScorenetError};
use crate::fact::Facts;
use crate::functions::{function_id, guarded_on};
use crate::score_inliner::MatchId;
use crate::tuple::{StoreEntry, Tuple};
use rust_decimal::Decimal;
use std::fmt;
use std::rc::Rc;

/// The weight of one match, before multiplication by the constraint weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchWeight {
    Long(i64),
    Big(Decimal),
}

/// Exactly what has to be subtracted when a scored tuple goes away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoreUndo {
    pub constraint: ConstraintId,
    pub weight: MatchWeight,
    pub tracked: Option<MatchId>,
}

/// Receiver of score impacts, implemented by the session's score inliner.
pub trait ScoreSink {
    fn impact(
        &mut self,
        constraint: ConstraintId,
        weight: MatchWeight,
        justification: Option<Facts>,
    ) -> Result<ScoreUndo>;

    fn undo(&mut self, undo: ScoreUndo) -> Result<()>;

    /// Whether impacts should carry a justification.
    fn is_tracking(&self) -> bool;
}

/// Match weight function of a scoring node.
#[derive(Clone)]
pub enum Weigher {
    Int(Rc<dyn Fn(&Tuple) -> i32>),
    Long(Rc<dyn Fn(&Tuple) -> i64>),
    Big(Rc<dyn Fn(&Tuple) -> Decimal>),
}

impl Weigher {
    pub fn int(f: impl Fn(&Tuple) -> i32 + 'static) -> Self {
        Weigher::Int(Rc::new(f))
    }

    pub fn long(f: impl Fn(&Tuple) -> i64 + 'static) -> Self {
        Weigher::Long(Rc::new(f))
    }

    pub fn big(f: impl Fn(&Tuple) -> Decimal + 'static) -> Self {
        Weigher::Big(Rc::new(f))
    }

    /// Every match weighs one.
    pub fn unit() -> Self {
        Weigher::Int(Rc::new(|_| 1))
    }

    pub fn weigh(&self, tuple: &Tuple) -> MatchWeight {
        match self {
            Weigher::Int(f) => MatchWeight::Long(i64::from(f(tuple))),
            Weigher::Long(f) => MatchWeight::Long(f(tuple)),
            Weigher::Big(f) => MatchWeight::Big(f(tuple)),
        }
    }

    /// Closure identity, used to share identical scoring nodes.
    pub fn function_id(&self) -> usize {
        match self {
            Weigher::Int(f) => function_id(f),
            Weigher::Long(f) => function_id(f),
            Weigher::Big(f) => function_id(f),
        }
    }
}

impl fmt::Debug for Weigher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Weigher::Int(_) => "Int",
            Weigher::Long(_) => "Long",
            Weigher::Big(_) => "Big",
        };
        write!(f, "Weigher::{}(<function>)", kind)
    }
}

/// Converts every tuple reaching it into a score impact, keeping the undo in
/// the tuple's slot.
#[derive(Debug)]
pub struct ScorerNode {
    pub constraint: ConstraintId,
    pub constraint_name: Rc<str>,
    pub weigher: Weigher,
    pub slot: usize,
}

impl ScorerNode {
    pub fn new(constraint: ConstraintId, constraint_name: Rc<str>, weigher: Weigher, slot: usize) -> Self {
        Self {
            constraint,
            constraint_name,
            weigher,
            slot,
        }
    }

    fn evaluate(&self, tuple: &Tuple, scores: &dyn ScoreSink) -> Result<(MatchWeight, Option<Facts>)> {
        let operation = format!("weigher of '{}'", self.constraint_name);
        let weight = guarded_on(&operation, tuple, || self.weigher.weigh(tuple))?;
        let justification = if scores.is_tracking() {
            Some(tuple.facts().iter().cloned().collect())
        } else {
            None
        };
        Ok((weight, justification))
    }

    pub fn insert(&mut self, tuple_id: TupleId, tuples: &mut TupleArena, scores: &mut dyn ScoreSink) -> Result<()> {
        if !tuples.slot(tuple_id, self.slot)?.is_empty() {
            return Err(ScorenetError::corruption(format!(
                "tuple {:?} inserted twice into scorer of '{}'",
                tuple_id.0, self.constraint_name
            )));
        }
        let (weight, justification) = self.evaluate(tuples.get(tuple_id)?, scores)?;
        let undo = scores.impact(self.constraint, weight, justification)?;
        tuples.put_slot(tuple_id, self.slot, StoreEntry::Score(undo))
    }

    /// Undo then re-impact, whether or not the weight changed.
    pub fn update(&mut self, tuple_id: TupleId, tuples: &mut TupleArena, scores: &mut dyn ScoreSink) -> Result<()> {
        let (weight, justification) = self.evaluate(tuples.get(tuple_id)?, scores)?;
        let previous = self.take_undo(tuple_id, tuples, "updated")?;
        scores.undo(previous)?;
        let undo = scores.impact(self.constraint, weight, justification)?;
        tuples.put_slot(tuple_id, self.slot, StoreEntry::Score(undo))
    }

    pub fn retract(&mut self, tuple_id: TupleId, tuples: &mut TupleArena, scores: &mut dyn ScoreSink) -> Result<()> {
        let previous = self.take_undo(tuple_id, tuples, "retracted")?;
        scores.undo(previous)
    }

    fn take_undo(&self, tuple_id: TupleId, tuples: &mut TupleArena, verb: &str) -> Result<ScoreUndo> {
        match tuples.take_slot(tuple_id, self.slot)? {
            StoreEntry::Score(undo) => Ok(undo),
            other => Err(ScorenetError::corruption(format!(
                "tuple {:?} {} in scorer of '{}' but its slot holds {}",
                tuple_id.0,
                verb,
                self.constraint_name,
                other.kind()
            ))),
        }
    }
}
