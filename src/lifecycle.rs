// lifecycle.rs - Owned output tuple transitions
//! Helpers used by every node that creates its own output tuples.
//!
//! An owned tuple moves `Creating -> Ok` once all children have seen its
//! insert, `Ok -> Updating -> Ok` around an update, and `Ok -> Dying -> Dead`
//! around a retract. The final transition of each is queued after the child
//! operations (`Settle` / `Release`), so it runs once the whole cascade below
//! has completed.

use crate::arena::{ChildLink, NodeOperation, TupleArena, TupleId};
use crate::error::{Result, ScorenetError};
use crate::fact::Facts;
use crate::state::TupleState;

/// Allocates an output tuple and queues its insert.
pub(crate) fn create_and_insert(
    facts: Facts,
    store_size: usize,
    children: &[ChildLink],
    tuples: &mut TupleArena,
    emitted: &mut Vec<NodeOperation>,
) -> Result<TupleId> {
    let out = tuples.acquire(facts, store_size)?;
    emitted.extend(children.iter().map(|child| NodeOperation::Insert(*child, out)));
    emitted.push(NodeOperation::Settle(out));
    Ok(out)
}

/// Queues the update of a settled output tuple.
pub(crate) fn update(
    out: TupleId,
    children: &[ChildLink],
    tuples: &mut TupleArena,
    emitted: &mut Vec<NodeOperation>,
) -> Result<()> {
    expect_settled(out, tuples, "update")?;
    tuples.set_state(out, TupleState::Updating)?;
    emitted.extend(children.iter().map(|child| NodeOperation::Update(*child, out)));
    emitted.push(NodeOperation::Settle(out));
    Ok(())
}

/// Replaces the facts of an output tuple and queues an update only when at
/// least one fact changed structurally. Returns whether an update was queued.
pub(crate) fn update_if_different(
    out: TupleId,
    facts: Facts,
    children: &[ChildLink],
    tuples: &mut TupleArena,
    emitted: &mut Vec<NodeOperation>,
) -> Result<bool> {
    let tuple = tuples.get_mut(out)?;
    if crate::fact::facts_equal(tuple.facts(), &facts) {
        return Ok(false);
    }
    tuple.set_facts(facts);
    update(out, children, tuples, emitted)?;
    Ok(true)
}

/// Queues the retract of a settled output tuple; it is freed after the
/// cascade.
pub(crate) fn retract(
    out: TupleId,
    children: &[ChildLink],
    tuples: &mut TupleArena,
    emitted: &mut Vec<NodeOperation>,
) -> Result<()> {
    expect_settled(out, tuples, "retract")?;
    tuples.set_state(out, TupleState::Dying)?;
    emitted.extend(children.iter().map(|child| NodeOperation::Retract(*child, out)));
    emitted.push(NodeOperation::Release(out));
    Ok(())
}

/// Forwards an event on a tuple owned upstream, unchanged.
pub(crate) fn forward(
    operation: fn(ChildLink, TupleId) -> NodeOperation,
    tuple: TupleId,
    children: &[ChildLink],
    emitted: &mut Vec<NodeOperation>,
) {
    emitted.extend(children.iter().map(|child| operation(*child, tuple)));
}

fn expect_settled(out: TupleId, tuples: &TupleArena, verb: &str) -> Result<()> {
    match tuples.state(out)? {
        TupleState::Ok => Ok(()),
        other => Err(ScorenetError::corruption(format!(
            "cannot {} tuple {:?} in state {:?}",
            verb, out.0, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::NodeId;
    use crate::fact::Fact;
    use slotmap::SlotMap;
    use smallvec::smallvec;
    use std::rc::Rc;

    fn facts(value: i64) -> Facts {
        smallvec![Rc::new(value) as Rc<dyn Fact>]
    }

    fn child() -> ChildLink {
        let mut keys: SlotMap<NodeId, ()> = SlotMap::new();
        ChildLink::left(keys.insert(()))
    }

    #[test]
    fn test_insert_queues_children_then_settle() {
        let mut tuples = TupleArena::new();
        let mut emitted = Vec::new();
        let c = child();
        let out = create_and_insert(facts(1), 0, &[c, c], &mut tuples, &mut emitted).unwrap();
        assert_eq!(
            emitted,
            vec![
                NodeOperation::Insert(c, out),
                NodeOperation::Insert(c, out),
                NodeOperation::Settle(out)
            ]
        );
        assert_eq!(tuples.state(out).unwrap(), TupleState::Creating);
    }

    #[test]
    fn test_update_if_different_skips_equal_facts() {
        let mut tuples = TupleArena::new();
        let mut emitted = Vec::new();
        let c = child();
        let out = create_and_insert(facts(1), 0, &[c], &mut tuples, &mut emitted).unwrap();
        tuples.set_state(out, TupleState::Ok).unwrap();
        emitted.clear();

        assert!(!update_if_different(out, facts(1), &[c], &mut tuples, &mut emitted).unwrap());
        assert!(emitted.is_empty());
        assert!(update_if_different(out, facts(2), &[c], &mut tuples, &mut emitted).unwrap());
        assert_eq!(emitted, vec![NodeOperation::Update(c, out), NodeOperation::Settle(out)]);
        assert_eq!(tuples.state(out).unwrap(), TupleState::Updating);
    }

    #[test]
    fn test_retract_requires_settled_tuple() {
        let mut tuples = TupleArena::new();
        let mut emitted = Vec::new();
        let c = child();
        let out = create_and_insert(facts(1), 0, &[c], &mut tuples, &mut emitted).unwrap();
        assert!(retract(out, &[c], &mut tuples, &mut emitted).unwrap_err().is_corruption());

        tuples.set_state(out, TupleState::Ok).unwrap();
        emitted.clear();
        retract(out, &[c], &mut tuples, &mut emitted).unwrap();
        assert_eq!(emitted, vec![NodeOperation::Retract(c, out), NodeOperation::Release(out)]);
        assert_eq!(tuples.state(out).unwrap(), TupleState::Dying);
    }
}
