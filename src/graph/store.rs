//! Per-project snapshot slots with generation-tagged refreshes.
//!
//! A scope is *tracked* while it is in the desired set. Each time a scope
//! starts being tracked it receives a fresh generation from a monotonic
//! counter. Refreshes take a [`FetchTicket`] before they suspend and may only
//! commit if the scope is still tracked under the same generation, so a fetch
//! that resolves after its scope was dropped (or dropped and re-added) is
//! discarded.
//!
//! Within one generation, every ticket also carries a sequence number taken
//! when the fetch began. A commit is refused if a later-begun fetch has
//! already committed, so overlapping refreshes that resolve out of order
//! never replace a newer snapshot with an older one.

use super::GraphSnapshot;
use crate::types::ProjectId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Identity of an in-flight refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTicket {
    pub project_id: ProjectId,
    pub generation: u64,
    /// Order in which the fetch began, across all projects.
    pub sequence: u64,
}

#[derive(Debug)]
struct Slot {
    generation: u64,
    snapshot: Option<Arc<GraphSnapshot>>,
    /// Sequence of the ticket that produced `snapshot`.
    committed: u64,
}

/// Holds the latest snapshot for each tracked project.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    slots: Mutex<HashMap<ProjectId, Slot>>,
    next_generation: AtomicU64,
    next_sequence: AtomicU64,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ProjectId, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start tracking a project. No-op if it is already tracked.
    ///
    /// Returns the generation the scope is tracked under.
    pub fn track(&self, project_id: ProjectId) -> u64 {
        let mut slots = self.lock();
        slots
            .entry(project_id)
            .or_insert_with(|| Slot {
                generation: self.next_generation.fetch_add(1, Ordering::Relaxed) + 1,
                snapshot: None,
                committed: 0,
            })
            .generation
    }

    /// Stop tracking a project and drop its snapshot.
    ///
    /// Outstanding tickets for the project become stale.
    pub fn untrack(&self, project_id: ProjectId) -> bool {
        self.lock().remove(&project_id).is_some()
    }

    pub fn is_tracked(&self, project_id: ProjectId) -> bool {
        self.lock().contains_key(&project_id)
    }

    pub fn tracked(&self) -> Vec<ProjectId> {
        let mut ids: Vec<ProjectId> = self.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Tag a refresh that is about to start. `None` if the project is not tracked.
    pub fn begin_fetch(&self, project_id: ProjectId) -> Option<FetchTicket> {
        let slots = self.lock();
        let slot = slots.get(&project_id)?;
        Some(FetchTicket {
            project_id,
            generation: slot.generation,
            sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed) + 1,
        })
    }

    /// True while the ticket's scope is tracked under the same generation.
    pub fn is_current(&self, ticket: &FetchTicket) -> bool {
        self.lock()
            .get(&ticket.project_id)
            .is_some_and(|slot| slot.generation == ticket.generation)
    }

    /// Replace the project's snapshot if the ticket is still current and no
    /// later-begun fetch has committed yet.
    ///
    /// Returns whether the snapshot was applied.
    pub fn commit(&self, ticket: &FetchTicket, snapshot: GraphSnapshot) -> bool {
        let mut slots = self.lock();
        match slots.get_mut(&ticket.project_id) {
            Some(slot) if slot.generation == ticket.generation => {
                if ticket.sequence < slot.committed {
                    debug!(
                        project_id = ticket.project_id,
                        sequence = ticket.sequence,
                        committed = slot.committed,
                        "Discarding superseded snapshot refresh"
                    );
                    return false;
                }
                slot.snapshot = Some(Arc::new(snapshot));
                slot.committed = ticket.sequence;
                true
            }
            _ => {
                debug!(
                    project_id = ticket.project_id,
                    generation = ticket.generation,
                    "Discarding stale snapshot refresh"
                );
                false
            }
        }
    }

    /// Latest committed snapshot for a project.
    pub fn get(&self, project_id: ProjectId) -> Option<Arc<GraphSnapshot>> {
        self.lock()
            .get(&project_id)
            .and_then(|slot| slot.snapshot.clone())
    }

    /// Drop every slot (session teardown).
    pub fn clear(&self) {
        self.lock().clear();
    }
}
