//! Role-change watcher: pushes only when the mapped subset of roles changed.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::LinkError;
use crate::pusher::{MetadataPusher, PushResult};

/// A member's role set changed in the source community.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleChangeEvent {
    pub user_id: String,
    #[serde(rename = "oldRoleIds")]
    pub old_roles: HashSet<String>,
    #[serde(rename = "newRoleIds")]
    pub new_roles: HashSet<String>,
}

/// What the watcher did with an event.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchOutcome {
    /// The relevant subset did not change; no push.
    Ignored,
    Synced(PushResult),
}

/// Per-user tracking state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackState {
    Unknown,
    /// Last relevant role subset observed for the user.
    Tracked(BTreeSet<String>),
}

/// Filters role-change events down to the ones that affect metadata.
///
/// Events for one user are handled strictly in arrival order: each user with
/// pending events has exactly one drain task, and the queue entry exists only
/// while that task runs.
pub struct RoleChangeWatcher {
    pusher: Arc<MetadataPusher>,
    /// Last relevant subset per linked user.
    tracked: DashMap<String, BTreeSet<String>>,
    pending: DashMap<String, VecDeque<RoleChangeEvent>>,
}

impl RoleChangeWatcher {
    pub fn new(pusher: Arc<MetadataPusher>) -> Self {
        Self {
            pusher,
            tracked: DashMap::new(),
            pending: DashMap::new(),
        }
    }

    pub fn state(&self, user_id: &str) -> TrackState {
        match self.tracked.get(user_id) {
            Some(relevant) => TrackState::Tracked(relevant.clone()),
            None => TrackState::Unknown,
        }
    }

    /// Apply the relevant-subset diff rule to one event.
    ///
    /// Only users whose relevant roles changed and who are still linked are
    /// tracked; a skipped sync returns the user to `Unknown`.
    pub async fn handle(&self, event: &RoleChangeEvent) -> Result<WatchOutcome, LinkError> {
        let role_map = self.pusher.role_map();
        let relevant_old = role_map.project(&event.old_roles);
        let relevant_new = role_map.project(&event.new_roles);

        if let Some(last) = self.tracked.get(&event.user_id) {
            if *last != relevant_old {
                warn!(
                    user_id = %event.user_id,
                    last = ?*last,
                    old = ?relevant_old,
                    "role-change baseline differs from last observed roles"
                );
            }
        }

        if relevant_old == relevant_new {
            debug!(user_id = %event.user_id, "irrelevant role change ignored");
            if let Some(mut last) = self.tracked.get_mut(&event.user_id) {
                *last = relevant_new;
            }
            return Ok(WatchOutcome::Ignored);
        }

        info!(
            user_id = %event.user_id,
            old = ?relevant_old,
            new = ?relevant_new,
            "relevant role change"
        );
        let result = self.pusher.sync(&event.user_id, &event.new_roles).await?;
        if result.is_skipped() {
            self.tracked.remove(&event.user_id);
        } else {
            self.tracked.insert(event.user_id.clone(), relevant_new);
        }
        Ok(WatchOutcome::Synced(result))
    }

    /// Queue an event behind any pending events for the same user, starting
    /// a drain task if none is running.
    pub fn enqueue(self: &Arc<Self>, event: RoleChangeEvent) {
        match self.pending.entry(event.user_id.clone()) {
            Entry::Occupied(mut queue) => queue.get_mut().push_back(event),
            Entry::Vacant(slot) => {
                let user_id = slot.key().clone();
                slot.insert(VecDeque::from([event]));
                tokio::spawn(Arc::clone(self).drain(user_id));
            }
        }
    }

    async fn drain(self: Arc<Self>, user_id: String) {
        loop {
            let event = match self.pending.entry(user_id.clone()) {
                Entry::Occupied(mut queue) => {
                    let next = queue.get_mut().pop_front();
                    match next {
                        Some(event) => event,
                        None => {
                            queue.remove();
                            break;
                        }
                    }
                }
                Entry::Vacant(_) => break,
            };
            if let Err(e) = self.handle(&event).await {
                warn!(user_id = %event.user_id, error = %e, "role-change handling failed");
            }
        }
    }

    /// Consume events until `cancel` fires or all senders are dropped.
    ///
    /// Different users are processed in parallel; events for the same user
    /// are processed one at a time, in the order received.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<RoleChangeEvent>,
        cancel: CancellationToken,
    ) {
        info!("role-change watcher started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => {
                    let Some(event) = event else { break };
                    self.enqueue(event);
                }
            }
        }
        info!("role-change watcher stopped");
    }
}
