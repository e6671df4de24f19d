//analysis.rs
use crate::fact::Facts;
use crate::nodes::NodeData;
use crate::score::Score;
use crate::session::Session;
use rustc_hash::FxHashMap as HashMap;

/// Analysis tools for constraint sessions
pub struct ConstraintAnalysis;

impl ConstraintAnalysis {
    /// Per-constraint breakdown of the current score. Justifications are
    /// only filled in when the session tracks constraint matches.
    pub fn analyze_violations<S: Score>(session: &Session<S>) -> ConstraintViolationReport<S> {
        let total_score = session.score();
        let mut justifications: HashMap<usize, Vec<Facts>> = HashMap::default();
        if let Ok(matches) = session.constraint_matches() {
            for m in matches {
                justifications
                    .entry(m.constraint_id.0)
                    .or_default()
                    .push(m.justification);
            }
        }

        let violations = session
            .constraint_match_totals()
            .into_iter()
            .filter(|total| total.match_count > 0)
            .map(|total| ConstraintViolation {
                justifications: justifications.remove(&total.constraint_id.0).unwrap_or_default(),
                constraint_name: total.constraint_name,
                match_count: total.match_count,
                score: total.score,
            })
            .collect();

        ConstraintViolationReport {
            feasible: total_score.is_feasible(),
            total_score,
            violations,
        }
    }

    pub fn network_statistics<S: Score>(session: &Session<S>) -> NetworkStatistics {
        let mut stats = NetworkStatistics {
            total_nodes: session.nodes().len(),
            live_tuples: session.tuples().len(),
            facts: session.fact_count(),
            constraints: session.inliner().constraint_count(),
            matches: session.inliner().match_count(),
            join_pairs: 0,
            groups: 0,
            shared_streams: session.shared_streams(),
            propagation_steps: session.propagation_steps(),
            node_type_counts: HashMap::default(),
        };

        for (_, node) in session.nodes().iter() {
            match node {
                NodeData::Join(join) => stats.join_pairs += join.pair_count(),
                NodeData::Group(group) => stats.groups += group.group_count(),
                _ => {}
            }
            *stats.node_type_counts.entry(node.kind_name().to_string()).or_insert(0) += 1;
        }

        stats
    }
}

#[derive(Debug, Clone)]
pub struct ConstraintViolationReport<S: Score> {
    pub total_score: S,
    pub violations: Vec<ConstraintViolation<S>>,
    pub feasible: bool,
}

#[derive(Debug, Clone)]
pub struct ConstraintViolation<S: Score> {
    pub constraint_name: String,
    pub match_count: usize,
    pub score: S,
    pub justifications: Vec<Facts>,
}

#[derive(Debug, Clone)]
pub struct NetworkStatistics {
    pub total_nodes: usize,
    pub live_tuples: usize,
    pub facts: usize,
    pub constraints: usize,
    /// Active score contributions across all constraints.
    pub matches: usize,
    pub join_pairs: usize,
    pub groups: usize,
    /// Stream declarations that resolved to an existing node.
    pub shared_streams: usize,
    pub propagation_steps: u64,
    pub node_type_counts: HashMap<String, usize>,
}

#[cfg(test)]
mod tests {
    use crate::constraint_builder::ConstraintBuilder;
    use crate::joiner::Joiners;
    use crate::key::KeyValue;
    use crate::resource_limits::SessionConfig;
    use crate::score::HardSoftScore;

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    struct Shift {
        employee: u32,
        day: u32,
    }
    crate::impl_fact!(Shift);

    fn day(t: &crate::tuple::Tuple) -> KeyValue {
        t.fact_as::<Shift>(0).map_or(KeyValue::Null, |s| KeyValue::from(s.day))
    }

    fn build(tracking: bool) -> crate::session::Session<HardSoftScore> {
        let builder = ConstraintBuilder::<HardSoftScore>::new()
            .with_config(SessionConfig::new().with_constraint_matches(tracking));
        builder
            .for_each_unique_pair::<Shift, _>(|s| KeyValue::from(s.employee))
            .filter(|t| {
                let (a, b) = (t.fact_as::<Shift>(0), t.fact_as::<Shift>(1));
                matches!((a, b), (Some(a), Some(b)) if a.day == b.day)
            })
            .penalize("same day", HardSoftScore::hard(1))
            .unwrap();
        let shifts = builder.for_each::<Shift>();
        shifts
            .join(&shifts, vec![Joiners::equal(day, day)])
            .reward("company", HardSoftScore::soft(1))
            .unwrap();
        builder.build().unwrap()
    }

    #[test]
    fn test_violation_report_with_tracking() {
        let mut session = build(true);
        session.insert(Shift { employee: 1, day: 1 }).unwrap();
        session.insert(Shift { employee: 2, day: 1 }).unwrap();
        session.insert(Shift { employee: 3, day: 2 }).unwrap();

        let report = session.violation_report();
        assert!(!report.feasible);
        assert_eq!(report.total_score, HardSoftScore::new(-1, 5));
        assert_eq!(report.violations.len(), 2);
        let same_day = &report.violations[0];
        assert_eq!(same_day.constraint_name, "same day");
        assert_eq!(same_day.match_count, 1);
        assert_eq!(same_day.justifications.len(), 1);
        assert_eq!(same_day.justifications[0].len(), 2);
    }

    #[test]
    fn test_report_without_tracking_has_no_justifications() {
        let mut session = build(false);
        session.insert(Shift { employee: 1, day: 1 }).unwrap();
        let report = session.violation_report();
        assert!(report.feasible);
        assert_eq!(report.violations.len(), 1);
        assert!(report.violations[0].justifications.is_empty());
    }

    #[test]
    fn test_network_statistics() {
        let mut session = build(false);
        session.insert(Shift { employee: 1, day: 1 }).unwrap();
        session.insert(Shift { employee: 2, day: 1 }).unwrap();
        let stats = session.statistics();
        assert_eq!(stats.node_type_counts.get("From"), Some(&1));
        assert_eq!(stats.node_type_counts.get("Join"), Some(&2));
        assert_eq!(stats.node_type_counts.get("Scorer"), Some(&2));
        assert_eq!(stats.facts, 2);
        // one unique pair plus four self-join pairs
        assert_eq!(stats.join_pairs, 5);
        assert_eq!(stats.matches, 5);
        assert!(stats.shared_streams >= 1);
        assert!(stats.propagation_steps > 0);
    }
}
