// constraint.rs

use crate::score::Score;
use rustc_hash::FxHashMap as HashMap;

/// A type-safe, cheap-to-copy identifier for constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConstraintId(pub usize);

/// Direction of a constraint's score impact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImpactType {
    /// Matches subtract `weight * match_weight` from the score.
    Penalty,
    /// Matches add `weight * match_weight` to the score.
    Reward,
}

impl ImpactType {
    /// Sign applied to a match weight.
    pub fn sign(&self) -> i64 {
        match self {
            ImpactType::Penalty => -1,
            ImpactType::Reward => 1,
        }
    }
}

/// Manages constraint weights and the mapping between names and ids.
#[derive(Debug, Clone)]
pub struct ConstraintWeights<S: Score> {
    weights: Vec<S>,
    names: Vec<String>,
    name_to_id: HashMap<String, ConstraintId>,
}

impl<S: Score> ConstraintWeights<S> {
    pub fn new() -> Self {
        Self {
            weights: Vec::new(),
            names: Vec::new(),
            name_to_id: HashMap::default(),
        }
    }

    /// Registers a constraint, returning `None` when the name is taken.
    pub fn register(&mut self, name: &str, weight: S) -> Option<ConstraintId> {
        if self.name_to_id.contains_key(name) {
            return None;
        }
        let id = ConstraintId(self.names.len());
        self.names.push(name.to_string());
        self.weights.push(weight);
        self.name_to_id.insert(name.to_string(), id);
        Some(id)
    }

    pub fn get_id(&self, name: &str) -> Option<ConstraintId> {
        self.name_to_id.get(name).copied()
    }

    pub fn get_name(&self, id: ConstraintId) -> Option<&str> {
        self.names.get(id.0).map(String::as_str)
    }

    pub fn get_weight(&self, id: ConstraintId) -> Option<&S> {
        self.weights.get(id.0)
    }

    /// Replaces the weight of a known constraint, returning the previous one.
    pub fn set_weight(&mut self, id: ConstraintId, weight: S) -> Option<S> {
        self.weights
            .get_mut(id.0)
            .map(|slot| std::mem::replace(slot, weight))
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// All registered constraints in registration order.
    pub fn get_all_constraints(&self) -> impl Iterator<Item = (ConstraintId, &str)> {
        self.names
            .iter()
            .enumerate()
            .map(|(i, name)| (ConstraintId(i), name.as_str()))
    }
}

impl<S: Score> Default for ConstraintWeights<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::score::HardSoftScore;

    #[test]
    fn test_register_and_lookup() {
        let mut weights = ConstraintWeights::new();
        let room = weights.register("room conflict", HardSoftScore::ONE_HARD).unwrap();
        let gap = weights.register("room gap", HardSoftScore::soft(2)).unwrap();
        assert_ne!(room, gap);
        assert!(weights.register("room conflict", HardSoftScore::ONE_SOFT).is_none());
        assert_eq!(weights.get_id("room gap"), Some(gap));
        assert_eq!(weights.get_name(room), Some("room conflict"));
        assert_eq!(weights.get_weight(gap), Some(&HardSoftScore::soft(2)));
        assert_eq!(weights.len(), 2);
    }

    #[test]
    fn test_set_weight_returns_previous() {
        let mut weights = ConstraintWeights::new();
        let id = weights.register("c", HardSoftScore::ONE_SOFT).unwrap();
        let previous = weights.set_weight(id, HardSoftScore::soft(5));
        assert_eq!(previous, Some(HardSoftScore::ONE_SOFT));
        assert_eq!(weights.get_weight(id), Some(&HardSoftScore::soft(5)));
        assert!(weights.set_weight(ConstraintId(9), HardSoftScore::ONE_SOFT).is_none());
    }

    #[test]
    fn test_impact_sign() {
        assert_eq!(ImpactType::Penalty.sign(), -1);
        assert_eq!(ImpactType::Reward.sign(), 1);
    }
}
