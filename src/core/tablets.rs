use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    op::{TabletError, TabletStatus},
    types::{TabletId, TabletState},
};

/// Progress of a single tablet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletProgress {
    /// Tablet id.
    pub tablet_id: TabletId,
    /// Current state.
    pub state: TabletState,
    /// Error from the most recent failed RPC, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<TabletError>,
}

impl TabletProgress {
    fn pending(tablet_id: TabletId) -> Self {
        Self {
            tablet_id,
            state: TabletState::Pending,
            last_error: None,
        }
    }

    /// True when the next dispatch cycle may pick this tablet.
    pub fn is_dispatchable(&self) -> bool {
        match self.state {
            TabletState::Pending => true,
            TabletState::Failed => !self.is_terminally_failed(),
            TabletState::Dispatched | TabletState::Done => false,
        }
    }

    /// True when the tablet failed with a terminal error.
    pub fn is_terminally_failed(&self) -> bool {
        self.state == TabletState::Failed
            && self.last_error.as_ref().is_some_and(TabletError::is_terminal)
    }
}

/// What [`TabletProgressSet::mark_result`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultTransition {
    /// State before the result was applied.
    pub previous: TabletState,
    /// State after; equal to `previous` when the result was ignored.
    pub current: TabletState,
    /// False when the result was dropped.
    pub applied: bool,
}

/// Tablet membership of one operation with per-tablet state. Membership is
/// fixed at construction; iteration is by ascending tablet id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TabletProgressSet {
    tablets: BTreeMap<TabletId, TabletProgress>,
}

impl TabletProgressSet {
    /// Every tablet starts [`TabletState::Pending`]. Duplicates collapse.
    pub fn from_ids(ids: impl IntoIterator<Item = TabletId>) -> Self {
        let tablets = ids
            .into_iter()
            .map(|id| (id.clone(), TabletProgress::pending(id)))
            .collect();
        Self { tablets }
    }

    /// Rebuilds from persisted entries. In-flight state is not durable, so
    /// a persisted `Dispatched` comes back as `Pending`.
    pub fn from_progress(entries: impl IntoIterator<Item = TabletProgress>) -> Self {
        let tablets = entries
            .into_iter()
            .map(|mut entry| {
                if entry.state == TabletState::Dispatched {
                    entry.state = TabletState::Pending;
                }
                (entry.tablet_id.clone(), entry)
            })
            .collect();
        Self { tablets }
    }

    /// Number of tablets.
    pub fn len(&self) -> usize {
        self.tablets.len()
    }

    /// True for a restoration with no tablets.
    pub fn is_empty(&self) -> bool {
        self.tablets.is_empty()
    }

    /// Whether `tablet_id` belongs to the operation.
    pub fn contains(&self, tablet_id: &str) -> bool {
        self.tablets.contains_key(tablet_id)
    }

    /// Progress of one tablet.
    pub fn get(&self, tablet_id: &str) -> Option<&TabletProgress> {
        self.tablets.get(tablet_id)
    }

    /// Tablets in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = &TabletProgress> {
        self.tablets.values()
    }

    /// Ids of tablets eligible for dispatch, ascending.
    pub fn dispatchable_ids(&self) -> Vec<TabletId> {
        self.tablets
            .values()
            .filter(|t| t.is_dispatchable())
            .map(|t| t.tablet_id.clone())
            .collect()
    }

    /// Moves an eligible tablet to `Dispatched`.
    ///
    /// # Panics
    ///
    /// If `tablet_id` is not a member.
    pub fn mark_dispatched(&mut self, tablet_id: &str) {
        let tablet = self.member_mut(tablet_id);
        debug_assert!(tablet.is_dispatchable(), "dispatching ineligible tablet {tablet_id}");
        tablet.state = TabletState::Dispatched;
    }

    /// Applies an RPC outcome. Results for `Done` or terminally failed
    /// tablets are ignored so a terminal failure stays sticky.
    ///
    /// # Panics
    ///
    /// If `tablet_id` is not a member.
    pub fn mark_result(&mut self, tablet_id: &str, status: TabletStatus) -> ResultTransition {
        let tablet = self.member_mut(tablet_id);
        let previous = tablet.state;
        if previous == TabletState::Done || tablet.is_terminally_failed() {
            return ResultTransition {
                previous,
                current: previous,
                applied: false,
            };
        }
        match status {
            Ok(()) => {
                tablet.state = TabletState::Done;
                tablet.last_error = None;
            }
            Err(err) => {
                tablet.state = TabletState::Failed;
                tablet.last_error = Some(err);
            }
        }
        ResultTransition {
            previous,
            current: tablet.state,
            applied: true,
        }
    }

    /// Vacuously true for an empty set.
    pub fn all_done(&self) -> bool {
        self.tablets.values().all(|t| t.state == TabletState::Done)
    }

    /// First terminal error by tablet id, if any.
    pub fn terminal_error(&self) -> Option<(&TabletId, &TabletError)> {
        self.tablets
            .values()
            .filter(|t| t.is_terminally_failed())
            .find_map(|t| t.last_error.as_ref().map(|e| (&t.tablet_id, e)))
    }

    /// Count of tablets in `state`.
    pub fn count_in(&self, state: TabletState) -> usize {
        self.tablets.values().filter(|t| t.state == state).count()
    }

    fn member_mut(&mut self, tablet_id: &str) -> &mut TabletProgress {
        match self.tablets.get_mut(tablet_id) {
            Some(tablet) => tablet,
            None => panic!("tablet {tablet_id} is not part of this operation"),
        }
    }
}
