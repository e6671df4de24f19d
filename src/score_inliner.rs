// score_inliner.rs - Running score accumulator with exact undo
use crate::constraint::{ConstraintId, ConstraintWeights, ImpactType};
use crate::error::{Result, ScorenetError};
use crate::fact::Facts;
use crate::score::Score;
use crate::scorer::{MatchWeight, ScoreSink, ScoreUndo};
use generational_arena::{Arena, Index};
use rust_decimal::Decimal;
use tracing::debug;

/// Reference to a tracked constraint match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MatchId(pub(crate) Index);

/// One recorded score contribution.
#[derive(Debug, Clone)]
pub struct ConstraintMatch<S: Score> {
    pub constraint_id: ConstraintId,
    pub constraint_name: String,
    /// The facts that caused this contribution.
    pub justification: Facts,
    pub match_weight: MatchWeight,
    pub score: S,
}

/// Aggregate of all contributions of one constraint.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstraintMatchTotal<S: Score> {
    pub constraint_id: ConstraintId,
    pub constraint_name: String,
    pub match_count: usize,
    pub score: S,
}

#[derive(Debug, Clone)]
struct TrackedMatch {
    constraint: ConstraintId,
    justification: Facts,
    weight: MatchWeight,
}

#[derive(Debug, Clone)]
struct ConstraintState<S> {
    impact_type: ImpactType,
    match_count: usize,
    long_sum: i64,
    big_sum: Decimal,
    score: S,
}

/// Accumulates impacts of every scoring node of a session.
#[derive(Debug)]
pub struct ScoreInliner<S: Score> {
    weights: ConstraintWeights<S>,
    constraints: Vec<ConstraintState<S>>,
    score: S,
    tracking: bool,
    matches: Arena<TrackedMatch>,
}

impl<S: Score> ScoreInliner<S> {
    pub fn new(tracking: bool) -> Self {
        Self {
            weights: ConstraintWeights::new(),
            constraints: Vec::new(),
            score: S::null_score(),
            tracking,
            matches: Arena::new(),
        }
    }

    /// Registers a constraint; names must be unique within a session.
    pub fn register_constraint(
        &mut self,
        name: &str,
        weight: S,
        impact_type: ImpactType,
    ) -> Result<ConstraintId> {
        let id = self.weights.register(name, weight).ok_or_else(|| {
            ScorenetError::configuration(format!("constraint '{}' is defined twice", name))
        })?;
        self.constraints.push(ConstraintState {
            impact_type,
            match_count: 0,
            long_sum: 0,
            big_sum: Decimal::ZERO,
            score: S::null_score(),
        });
        Ok(id)
    }

    pub fn score(&self) -> S {
        self.score.clone()
    }

    pub fn weights(&self) -> &ConstraintWeights<S> {
        &self.weights
    }

    pub fn is_tracking(&self) -> bool {
        self.tracking
    }

    pub fn constraint_count(&self) -> usize {
        self.constraints.len()
    }

    /// Total number of active matches across all constraints.
    pub fn match_count(&self) -> usize {
        self.constraints.iter().map(|c| c.match_count).sum()
    }

    /// Changes a constraint weight and re-derives the total from the
    /// accumulated match weights, without touching the network.
    pub fn set_constraint_weight(&mut self, name: &str, weight: S) -> Result<()> {
        let id = self
            .weights
            .get_id(name)
            .ok_or_else(|| ScorenetError::ConstraintNotFound(name.to_string()))?;
        self.weights.set_weight(id, weight.clone());
        let state = &mut self.constraints[id.0];
        let sign = state.impact_type.sign();
        let new_score = weight.mul(sign * state.long_sum) + weight.mul_decimal(Decimal::from(sign) * state.big_sum);
        let old_score = std::mem::replace(&mut state.score, new_score.clone());
        self.score = self.score.clone() - old_score + new_score;
        debug!(constraint = name, score = ?self.score, "constraint weight changed");
        Ok(())
    }

    pub fn constraint_match_totals(&self) -> Vec<ConstraintMatchTotal<S>> {
        self.weights
            .get_all_constraints()
            .map(|(id, name)| {
                let state = &self.constraints[id.0];
                ConstraintMatchTotal {
                    constraint_id: id,
                    constraint_name: name.to_string(),
                    match_count: state.match_count,
                    score: state.score.clone(),
                }
            })
            .collect()
    }

    /// Every tracked match with its justification, grouped by constraint.
    pub fn constraint_matches(&self) -> Result<Vec<ConstraintMatch<S>>> {
        if !self.tracking {
            return Err(ScorenetError::MatchTrackingDisabled);
        }
        let mut matches: Vec<ConstraintMatch<S>> = self
            .matches
            .iter()
            .map(|(_, tracked)| ConstraintMatch {
                constraint_id: tracked.constraint,
                constraint_name: self
                    .weights
                    .get_name(tracked.constraint)
                    .unwrap_or_default()
                    .to_string(),
                justification: tracked.justification.clone(),
                match_weight: tracked.weight,
                score: self.contribution(tracked.constraint, tracked.weight),
            })
            .collect();
        matches.sort_by_key(|m| m.constraint_id);
        Ok(matches)
    }

    fn contribution(&self, constraint: ConstraintId, weight: MatchWeight) -> S {
        let (constraint_weight, sign) = match (self.weights.get_weight(constraint), self.constraints.get(constraint.0)) {
            (Some(w), Some(state)) => (w, state.impact_type.sign()),
            _ => return S::null_score(),
        };
        match weight {
            MatchWeight::Long(w) => constraint_weight.mul(sign * w),
            MatchWeight::Big(w) => constraint_weight.mul_decimal(Decimal::from(sign) * w),
        }
    }

    fn state_mut(&mut self, constraint: ConstraintId) -> Result<&mut ConstraintState<S>> {
        self.constraints.get_mut(constraint.0).ok_or_else(|| {
            ScorenetError::corruption(format!("unknown constraint {:?}", constraint))
        })
    }
}

impl<S: Score> ScoreSink for ScoreInliner<S> {
    fn impact(
        &mut self,
        constraint: ConstraintId,
        weight: MatchWeight,
        justification: Option<Facts>,
    ) -> Result<ScoreUndo> {
        let contribution = self.contribution(constraint, weight);
        let state = self.state_mut(constraint)?;
        match weight {
            MatchWeight::Long(w) => {
                state.long_sum = state.long_sum.checked_add(w).ok_or_else(|| {
                    ScorenetError::overflow(
                        "constraint match weight",
                        format!("{:?}: {} + {}", constraint, state.long_sum, w),
                    )
                })?
            }
            MatchWeight::Big(w) => state.big_sum += w,
        }
        state.match_count += 1;
        state.score = state.score.clone() + contribution.clone();
        self.score = self.score.clone() + contribution;

        let tracked = match (self.tracking, justification) {
            (true, Some(justification)) => Some(MatchId(self.matches.insert(TrackedMatch {
                constraint,
                justification,
                weight,
            }))),
            _ => None,
        };
        Ok(ScoreUndo {
            constraint,
            weight,
            tracked,
        })
    }

    fn undo(&mut self, undo: ScoreUndo) -> Result<()> {
        if let Some(id) = undo.tracked {
            self.matches.remove(id.0).ok_or_else(|| {
                ScorenetError::corruption(format!("constraint match {:?} undone twice", id.0))
            })?;
        }
        let contribution = self.contribution(undo.constraint, undo.weight);
        let state = self.state_mut(undo.constraint)?;
        if state.match_count == 0 {
            return Err(ScorenetError::corruption(format!(
                "constraint {:?} has no match left to undo",
                undo.constraint
            )));
        }
        match undo.weight {
            MatchWeight::Long(w) => {
                state.long_sum = state.long_sum.checked_sub(w).ok_or_else(|| {
                    ScorenetError::overflow(
                        "constraint match weight",
                        format!("{:?}: {} - {}", undo.constraint, state.long_sum, w),
                    )
                })?
            }
            MatchWeight::Big(w) => state.big_sum -= w,
        }
        state.match_count -= 1;
        state.score = state.score.clone() - contribution.clone();
        self.score = self.score.clone() - contribution;
        Ok(())
    }

    fn is_tracking(&self) -> bool {
        self.tracking
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact::Fact;
    use crate::score::{HardSoftScore, SimpleDecimalScore, SimpleScore};
    use smallvec::smallvec;
    use std::rc::Rc;

    #[test]
    fn test_impact_and_undo_restore_score() {
        let mut inliner = ScoreInliner::new(false);
        let hard = inliner
            .register_constraint("hard", HardSoftScore::ONE_HARD, ImpactType::Penalty)
            .unwrap();
        let soft = inliner
            .register_constraint("soft", HardSoftScore::soft(3), ImpactType::Reward)
            .unwrap();

        let u1 = inliner.impact(hard, MatchWeight::Long(2), None).unwrap();
        let u2 = inliner.impact(soft, MatchWeight::Long(1), None).unwrap();
        assert_eq!(inliner.score(), HardSoftScore::new(-2, 3));
        assert_eq!(inliner.match_count(), 2);

        inliner.undo(u1).unwrap();
        assert_eq!(inliner.score(), HardSoftScore::new(0, 3));
        inliner.undo(u2).unwrap();
        assert_eq!(inliner.score(), HardSoftScore::null_score());
        assert!(inliner.undo(u2).unwrap_err().is_corruption());
    }

    #[test]
    fn test_duplicate_constraint_name_is_configuration_error() {
        let mut inliner = ScoreInliner::new(false);
        inliner
            .register_constraint("c", SimpleScore::ONE, ImpactType::Penalty)
            .unwrap();
        let err = inliner
            .register_constraint("c", SimpleScore::ONE, ImpactType::Penalty)
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_set_constraint_weight_rederives_total() {
        let mut inliner = ScoreInliner::new(false);
        let c = inliner
            .register_constraint("c", SimpleScore::ONE, ImpactType::Penalty)
            .unwrap();
        inliner.impact(c, MatchWeight::Long(2), None).unwrap();
        inliner.impact(c, MatchWeight::Long(3), None).unwrap();
        assert_eq!(inliner.score(), SimpleScore::new(-5));

        inliner.set_constraint_weight("c", SimpleScore::new(10)).unwrap();
        assert_eq!(inliner.score(), SimpleScore::new(-50));
        assert!(matches!(
            inliner.set_constraint_weight("missing", SimpleScore::ONE),
            Err(ScorenetError::ConstraintNotFound(_))
        ));
    }

    #[test]
    fn test_tracked_matches_carry_justification() {
        let mut inliner = ScoreInliner::new(true);
        let c = inliner
            .register_constraint("c", SimpleDecimalScore::new(Decimal::ONE), ImpactType::Reward)
            .unwrap();
        let facts: Facts = smallvec![Rc::new(7i64) as Rc<dyn Fact>];
        let undo = inliner
            .impact(c, MatchWeight::Big(Decimal::new(25, 1)), Some(facts))
            .unwrap();

        let matches = inliner.constraint_matches().unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].constraint_name, "c");
        assert_eq!(matches[0].score, SimpleDecimalScore::new(Decimal::new(25, 1)));
        assert_eq!(matches[0].justification[0].as_any().downcast_ref::<i64>(), Some(&7));

        inliner.undo(undo).unwrap();
        assert!(inliner.constraint_matches().unwrap().is_empty());
        let totals = inliner.constraint_match_totals();
        assert_eq!(totals[0].match_count, 0);
        assert!(totals[0].score.is_zero());
    }

    #[test]
    fn test_weight_sum_overflow_is_an_error() {
        let mut inliner = ScoreInliner::new(false);
        let c = inliner
            .register_constraint("c", SimpleScore::ONE, ImpactType::Reward)
            .unwrap();
        inliner.impact(c, MatchWeight::Long(i64::MAX), None).unwrap();
        let err = inliner.impact(c, MatchWeight::Long(1), None).unwrap_err();
        assert!(matches!(err, ScorenetError::Overflow { .. }));
        assert_eq!(inliner.score(), SimpleScore::new(i64::MAX));
        assert_eq!(inliner.match_count(), 1);
    }

    #[test]
    fn test_matches_require_tracking() {
        let inliner: ScoreInliner<SimpleScore> = ScoreInliner::new(false);
        assert!(matches!(
            inliner.constraint_matches(),
            Err(ScorenetError::MatchTrackingDisabled)
        ));
    }
}
