// joiner.rs - Joiner types and index level derivation
use crate::indexer::LevelKind;
use crate::key::{IndexKeys, KeyValue};
use crate::tuple::Tuple;
use std::fmt;
use std::rc::Rc;

/// Extracts one join key component from a tuple.
pub type KeyFn = Rc<dyn Fn(&Tuple) -> KeyValue>;

/// Relation between the left key and the right key of a joiner:
/// a left tuple matches a right tuple when `left OP right` holds.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum JoinerType {
    Equal,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    /// The left key is a collection containing the right key.
    Contain,
    /// The left key is a member of the right key collection.
    ContainedIn,
    /// The two collections share at least one member.
    ContainAny,
}

impl JoinerType {
    /// Returns the relation with operands swapped. This is essential for
    /// creating the correct index for the right-hand side of a join. For
    /// example, if the join is `left.key < right.key`, the right index must
    /// find entries where `right.key > left.key`.
    pub fn inverse(&self) -> JoinerType {
        match self {
            JoinerType::Equal => JoinerType::Equal,
            JoinerType::LessThan => JoinerType::GreaterThan,
            JoinerType::LessThanOrEqual => JoinerType::GreaterThanOrEqual,
            JoinerType::GreaterThan => JoinerType::LessThan,
            JoinerType::GreaterThanOrEqual => JoinerType::LessThanOrEqual,
            JoinerType::Contain => JoinerType::ContainedIn,
            JoinerType::ContainedIn => JoinerType::Contain,
            JoinerType::ContainAny => JoinerType::ContainAny,
        }
    }

    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            JoinerType::LessThan
                | JoinerType::LessThanOrEqual
                | JoinerType::GreaterThan
                | JoinerType::GreaterThanOrEqual
        )
    }

    pub fn is_containment(&self) -> bool {
        matches!(
            self,
            JoinerType::Contain | JoinerType::ContainedIn | JoinerType::ContainAny
        )
    }

    /// Evaluates `left OP right` directly.
    pub fn matches(&self, left: &KeyValue, right: &KeyValue) -> bool {
        match self {
            JoinerType::Equal => left == right,
            JoinerType::LessThan => left < right,
            JoinerType::LessThanOrEqual => left <= right,
            JoinerType::GreaterThan => left > right,
            JoinerType::GreaterThanOrEqual => left >= right,
            JoinerType::Contain => left.members().contains(right),
            JoinerType::ContainedIn => right.members().contains(left),
            JoinerType::ContainAny => {
                let right_members = right.members();
                left.members().iter().any(|m| right_members.contains(m))
            }
        }
    }
}

/// One indexable join condition: a relation between a key extracted from the
/// left tuple and a key extracted from the right tuple.
#[derive(Clone)]
pub struct Joiner {
    pub joiner_type: JoinerType,
    pub left: KeyFn,
    pub right: KeyFn,
}

impl fmt::Debug for Joiner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Joiner")
            .field("joiner_type", &self.joiner_type)
            .field("left", &"<function>")
            .field("right", &"<function>")
            .finish()
    }
}

/// Constructors for [`Joiner`]s.
pub struct Joiners;

impl Joiners {
    pub fn new<L, R>(joiner_type: JoinerType, left: L, right: R) -> Joiner
    where
        L: Fn(&Tuple) -> KeyValue + 'static,
        R: Fn(&Tuple) -> KeyValue + 'static,
    {
        Joiner {
            joiner_type,
            left: Rc::new(left),
            right: Rc::new(right),
        }
    }

    pub fn equal<L, R>(left: L, right: R) -> Joiner
    where
        L: Fn(&Tuple) -> KeyValue + 'static,
        R: Fn(&Tuple) -> KeyValue + 'static,
    {
        Self::new(JoinerType::Equal, left, right)
    }

    pub fn less_than<L, R>(left: L, right: R) -> Joiner
    where
        L: Fn(&Tuple) -> KeyValue + 'static,
        R: Fn(&Tuple) -> KeyValue + 'static,
    {
        Self::new(JoinerType::LessThan, left, right)
    }

    pub fn less_than_or_equal<L, R>(left: L, right: R) -> Joiner
    where
        L: Fn(&Tuple) -> KeyValue + 'static,
        R: Fn(&Tuple) -> KeyValue + 'static,
    {
        Self::new(JoinerType::LessThanOrEqual, left, right)
    }

    pub fn greater_than<L, R>(left: L, right: R) -> Joiner
    where
        L: Fn(&Tuple) -> KeyValue + 'static,
        R: Fn(&Tuple) -> KeyValue + 'static,
    {
        Self::new(JoinerType::GreaterThan, left, right)
    }

    pub fn greater_than_or_equal<L, R>(left: L, right: R) -> Joiner
    where
        L: Fn(&Tuple) -> KeyValue + 'static,
        R: Fn(&Tuple) -> KeyValue + 'static,
    {
        Self::new(JoinerType::GreaterThanOrEqual, left, right)
    }

    pub fn contain<L, R>(left: L, right: R) -> Joiner
    where
        L: Fn(&Tuple) -> KeyValue + 'static,
        R: Fn(&Tuple) -> KeyValue + 'static,
    {
        Self::new(JoinerType::Contain, left, right)
    }

    pub fn contained_in<L, R>(left: L, right: R) -> Joiner
    where
        L: Fn(&Tuple) -> KeyValue + 'static,
        R: Fn(&Tuple) -> KeyValue + 'static,
    {
        Self::new(JoinerType::ContainedIn, left, right)
    }

    pub fn contain_any<L, R>(left: L, right: R) -> Joiner
    where
        L: Fn(&Tuple) -> KeyValue + 'static,
        R: Fn(&Tuple) -> KeyValue + 'static,
    {
        Self::new(JoinerType::ContainAny, left, right)
    }
}

/// Groups joiners into indexer levels. Consecutive `Equal` joiners collapse
/// into one level keyed by a composite value; every other joiner is a level
/// of its own.
pub(crate) fn level_groups(joiners: &[Joiner]) -> Vec<std::ops::Range<usize>> {
    let mut groups = Vec::new();
    let mut start = 0;
    while start < joiners.len() {
        let mut end = start + 1;
        if joiners[start].joiner_type == JoinerType::Equal {
            while end < joiners.len() && joiners[end].joiner_type == JoinerType::Equal {
                end += 1;
            }
        }
        groups.push(start..end);
        start = end;
    }
    groups
}

/// Level kinds of the left-side indexer (`Side::Left`) or the right-side
/// indexer, which stores right tuples and is queried with left keys.
pub(crate) fn indexer_levels(joiners: &[Joiner], left_side: bool) -> Vec<LevelKind> {
    level_groups(joiners)
        .into_iter()
        .map(|range| {
            let declared = joiners[range.start].joiner_type;
            let relation = if left_side { declared } else { declared.inverse() };
            LevelKind::for_relation(relation)
        })
        .collect()
}

/// Extracts the per-level keys of a tuple on one side of the join.
pub(crate) fn extract_keys(joiners: &[Joiner], left_side: bool, tuple: &Tuple) -> IndexKeys {
    level_groups(joiners)
        .into_iter()
        .map(|range| {
            let mut values = joiners[range.clone()].iter().map(|joiner| {
                if left_side {
                    (joiner.left)(tuple)
                } else {
                    (joiner.right)(tuple)
                }
            });
            if range.len() == 1 {
                values.next().unwrap_or(KeyValue::Null)
            } else {
                KeyValue::composite(values)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact::Fact;
    use smallvec::smallvec;

    fn int_key(index: usize) -> impl Fn(&Tuple) -> KeyValue {
        move |t: &Tuple| KeyValue::from(t.fact_as::<i64>(index).copied())
    }

    #[test]
    fn test_joiner_type_inverse() {
        assert_eq!(JoinerType::Equal.inverse(), JoinerType::Equal);
        assert_eq!(JoinerType::LessThan.inverse(), JoinerType::GreaterThan);
        assert_eq!(
            JoinerType::LessThanOrEqual.inverse(),
            JoinerType::GreaterThanOrEqual
        );
        assert_eq!(JoinerType::GreaterThan.inverse(), JoinerType::LessThan);
        assert_eq!(
            JoinerType::GreaterThanOrEqual.inverse(),
            JoinerType::LessThanOrEqual
        );
        assert_eq!(JoinerType::Contain.inverse(), JoinerType::ContainedIn);
        assert_eq!(JoinerType::ContainedIn.inverse(), JoinerType::Contain);
        assert_eq!(JoinerType::ContainAny.inverse(), JoinerType::ContainAny);
    }

    #[test]
    fn test_matches_comparisons_with_ties() {
        let three = KeyValue::Int(3);
        let five = KeyValue::Int(5);
        assert!(JoinerType::LessThan.matches(&three, &five));
        assert!(!JoinerType::LessThan.matches(&five, &five));
        assert!(JoinerType::LessThanOrEqual.matches(&five, &five));
        assert!(JoinerType::GreaterThanOrEqual.matches(&five, &five));
        assert!(!JoinerType::GreaterThan.matches(&three, &five));
    }

    #[test]
    fn test_matches_containment() {
        let set = KeyValue::set([KeyValue::Int(1), KeyValue::Int(2)]);
        let other = KeyValue::set([KeyValue::Int(2), KeyValue::Int(9)]);
        assert!(JoinerType::Contain.matches(&set, &KeyValue::Int(2)));
        assert!(JoinerType::ContainedIn.matches(&KeyValue::Int(1), &set));
        assert!(!JoinerType::ContainedIn.matches(&KeyValue::Int(9), &set));
        assert!(JoinerType::ContainAny.matches(&set, &other));
        assert!(!JoinerType::ContainAny.matches(&set, &KeyValue::set([KeyValue::Int(7)])));
    }

    #[test]
    fn test_consecutive_equal_joiners_merge() {
        let joiners = vec![
            Joiners::equal(int_key(0), int_key(0)),
            Joiners::equal(int_key(1), int_key(1)),
            Joiners::less_than(int_key(2), int_key(2)),
            Joiners::equal(int_key(0), int_key(0)),
        ];
        assert_eq!(level_groups(&joiners), vec![0..2, 2..3, 3..4]);

        let left_levels = indexer_levels(&joiners, true);
        let right_levels = indexer_levels(&joiners, false);
        assert_eq!(left_levels[1], LevelKind::Comparison(JoinerType::LessThan));
        assert_eq!(right_levels[1], LevelKind::Comparison(JoinerType::GreaterThan));
        assert_eq!(left_levels[0], LevelKind::Equal);

        let tuple = Tuple::new(
            smallvec![
                Rc::new(1i64) as Rc<dyn Fact>,
                Rc::new(2i64) as Rc<dyn Fact>,
                Rc::new(3i64) as Rc<dyn Fact>
            ],
            0,
        );
        let keys = extract_keys(&joiners, true, &tuple);
        assert_eq!(keys.len(), 3);
        assert_eq!(keys[0], KeyValue::composite([KeyValue::Int(1), KeyValue::Int(2)]));
        assert_eq!(keys[1], KeyValue::Int(3));
        assert_eq!(keys[2], KeyValue::Int(1));
    }
}
