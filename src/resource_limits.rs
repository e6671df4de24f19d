//resource_limits.rs
//! Resource limits and session configuration for the scorenet engine

use crate::error::{Result, ScorenetError};

/// Resource limits to prevent unbounded growth and runaway propagation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Maximum number of live tuples in one session
    pub max_tuples: usize,
    /// Maximum propagation steps triggered by a single mutation
    pub max_operations_per_batch: usize,
    /// Maximum number of facts inserted into one session
    pub max_facts: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_tuples: 10_000_000,
            max_operations_per_batch: 10_000_000,
            max_facts: 1_000_000,
        }
    }
}

impl ResourceLimits {
    /// Create conservative limits for small systems
    pub fn conservative() -> Self {
        Self {
            max_tuples: 100_000,
            max_operations_per_batch: 100_000,
            max_facts: 50_000,
        }
    }

    /// Create aggressive limits for high-performance systems
    pub fn aggressive() -> Self {
        Self {
            max_tuples: 100_000_000,
            max_operations_per_batch: 100_000_000,
            max_facts: 10_000_000,
        }
    }

    /// Check if the propagation of one mutation ran for too many steps
    pub fn check_operation_limit(&self, current_ops: usize) -> Result<()> {
        if current_ops > self.max_operations_per_batch {
            return Err(ScorenetError::infinite_loop(self.max_operations_per_batch));
        }
        Ok(())
    }

    /// Check if one more fact fits in the session
    pub fn check_fact_limit(&self, current_facts: usize) -> Result<()> {
        if current_facts >= self.max_facts {
            return Err(ScorenetError::resource_limit(
                "max_facts",
                format!("Current: {}, Limit: {}", current_facts, self.max_facts),
            ));
        }
        Ok(())
    }
}

/// Per-session settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionConfig {
    pub limits: ResourceLimits,
    /// Record each score contribution with its justification facts.
    pub constraint_match_enabled: bool,
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_constraint_matches(mut self, enabled: bool) -> Self {
        self.constraint_match_enabled = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profiles_are_ordered() {
        let small = ResourceLimits::conservative();
        let normal = ResourceLimits::default();
        let large = ResourceLimits::aggressive();
        assert!(small.max_tuples < normal.max_tuples);
        assert!(normal.max_tuples < large.max_tuples);
    }

    #[test]
    fn test_operation_limit() {
        let limits = ResourceLimits {
            max_operations_per_batch: 3,
            ..ResourceLimits::default()
        };
        assert!(limits.check_operation_limit(3).is_ok());
        assert!(matches!(
            limits.check_operation_limit(4),
            Err(ScorenetError::InfiniteLoop { max_iterations: 3 })
        ));
    }

    #[test]
    fn test_fact_limit_and_config_builder() {
        let config = SessionConfig::new()
            .with_limits(ResourceLimits { max_facts: 2, ..ResourceLimits::conservative() })
            .with_constraint_matches(true);
        assert!(config.constraint_match_enabled);
        assert!(config.limits.check_fact_limit(1).is_ok());
        assert!(config.limits.check_fact_limit(2).is_err());
    }
}
