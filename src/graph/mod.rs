//! Graph snapshot, transition guard, and snapshot store.

pub mod guard;
pub mod snapshot;
pub mod store;

pub use guard::{
    AllowedTransitions, all_predecessors_done, allowed_transitions, blockers, check_transition,
    predecessors_satisfied,
};
pub use snapshot::GraphSnapshot;
pub use store::{FetchTicket, SnapshotStore};
