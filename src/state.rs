// state.rs - Tuple state management

/// Represents the lifecycle state of a tuple in the propagation network.
///
/// A tuple receives exactly one insert, any number of updates and exactly one
/// retract. The state records where in that lifecycle it currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TupleState {
    /// Insert is being propagated to downstream nodes
    Creating,
    /// Tuple is stable and active in the network
    Ok,
    /// Update is being propagated to downstream nodes
    Updating,
    /// Retract is being propagated; the tuple is released afterwards
    Dying,
    /// Tuple was retracted while its insert was still in flight
    Aborting,
    /// Tuple is released and its arena slot may be reused
    Dead,
}

impl TupleState {
    /// Returns true if the tuple is in a transitional state that requires processing.
    pub fn is_dirty(&self) -> bool {
        matches!(
            self,
            TupleState::Creating | TupleState::Updating | TupleState::Dying
        )
    }

    /// Returns true if downstream nodes may still receive insert/update for this tuple.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            TupleState::Creating | TupleState::Ok | TupleState::Updating
        )
    }
}

impl Default for TupleState {
    fn default() -> Self {
        TupleState::Dead
    }
}
