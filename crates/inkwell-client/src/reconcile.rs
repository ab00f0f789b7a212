use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of one optimistic write, keyed by its correlation id.
///
/// Every write starts `Pending` and leaves it before the call that started it
/// returns: `Confirmed` by the authoritative response or a matching push,
/// `RolledBack` on failure or timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationState {
    Pending,
    Confirmed,
    RolledBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    SendMessage,
    ToggleReaction,
    PostComment,
    PostReview,
}

/// User-visible report of a rolled-back write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureNotice {
    pub correlation_id: Uuid,
    pub kind: MutationKind,
    pub reason: String,
}

/// Outcomes kept after a mutation settles, so a late response or push can
/// still tell how it ended.
const SETTLED_WINDOW: usize = 256;

/// Pending mutations plus a bounded window of recent outcomes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ledger {
    pending: HashMap<Uuid, MutationKind>,
    settled: VecDeque<(Uuid, MutationState)>,
}

impl Ledger {
    pub fn begin(&mut self, correlation_id: Uuid, kind: MutationKind) {
        self.pending.insert(correlation_id, kind);
    }

    pub fn state(&self, correlation_id: Uuid) -> Option<MutationState> {
        if self.pending.contains_key(&correlation_id) {
            return Some(MutationState::Pending);
        }
        self.settled
            .iter()
            .rev()
            .find(|(id, _)| *id == correlation_id)
            .map(|(_, state)| *state)
    }

    pub fn is_pending(&self, correlation_id: Uuid) -> bool {
        self.pending.contains_key(&correlation_id)
    }

    /// Pending to Confirmed. Returns false when the mutation was not pending.
    pub fn confirm(&mut self, correlation_id: Uuid) -> bool {
        self.settle(correlation_id, MutationState::Confirmed)
    }

    /// Pending to RolledBack. A mutation already confirmed by a push stays
    /// confirmed, since the write is known to have landed.
    pub fn roll_back(&mut self, correlation_id: Uuid) -> bool {
        self.settle(correlation_id, MutationState::RolledBack)
    }

    fn settle(&mut self, correlation_id: Uuid, outcome: MutationState) -> bool {
        if self.pending.remove(&correlation_id).is_none() {
            return false;
        }
        if self.settled.len() == SETTLED_WINDOW {
            self.settled.pop_front();
        }
        self.settled.push_back((correlation_id, outcome));
        true
    }

    pub fn pending(&self) -> impl Iterator<Item = (Uuid, MutationKind)> + '_ {
        self.pending.iter().map(|(id, kind)| (*id, *kind))
    }
}
