//! Awareness sub-channel
//!
//! Ephemeral per-connection state (identity, cursor) keyed by client ID.
//! Each client owns a clock; a remote state only replaces ours when its
//! clock is newer, and a `null` state with the current clock removes it.

use cowrite_core::{AwarenessEntry, ClientId, ListenerSet, Subscription};
use cowrite_protocol::{AwarenessState, AwarenessUpdate};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Which clients an awareness update touched
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
    /// True when the change was made through `set_local_state`
    pub local: bool,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

#[derive(Default)]
struct AwarenessInner {
    states: HashMap<ClientId, serde_json::Value>,
    clocks: HashMap<ClientId, u32>,
}

/// Presence states for one document session
pub struct Awareness {
    client_id: ClientId,
    inner: Mutex<AwarenessInner>,
    updates: ListenerSet<AwarenessChange>,
}

impl Awareness {
    pub fn new(client_id: ClientId) -> Self {
        Self {
            client_id,
            inner: Mutex::new(AwarenessInner::default()),
            updates: ListenerSet::new(),
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn local_state(&self) -> Option<serde_json::Value> {
        self.inner.lock().states.get(&self.client_id).cloned()
    }

    /// Merge `partial` into the local state.
    ///
    /// Top-level fields of a JSON object are merged into the existing object;
    /// any other value replaces the state outright.
    pub fn set_local_state(&self, partial: serde_json::Value) {
        let change = {
            let mut inner = self.inner.lock();
            let existed = inner.states.contains_key(&self.client_id);

            let next = match (inner.states.remove(&self.client_id), partial) {
                (Some(serde_json::Value::Object(mut current)), serde_json::Value::Object(fields)) => {
                    current.extend(fields);
                    serde_json::Value::Object(current)
                }
                (_, replacement) => replacement,
            };
            inner.states.insert(self.client_id, next);
            *inner.clocks.entry(self.client_id).or_insert(0) += 1;

            let mut change = AwarenessChange {
                local: true,
                ..Default::default()
            };
            if existed {
                change.updated.push(self.client_id);
            } else {
                change.added.push(self.client_id);
            }
            change
        };

        self.updates.emit(&change);
    }

    /// Withdraw the local state; peers see the client leave
    pub fn clear_local_state(&self) {
        let removed = {
            let mut inner = self.inner.lock();
            let removed = inner.states.remove(&self.client_id).is_some();
            if removed {
                *inner.clocks.entry(self.client_id).or_insert(0) += 1;
            }
            removed
        };

        if removed {
            self.updates.emit(&AwarenessChange {
                removed: vec![self.client_id],
                local: true,
                ..Default::default()
            });
        }
    }

    /// All current raw states, including the local one
    pub fn states(&self) -> HashMap<ClientId, serde_json::Value> {
        self.inner.lock().states.clone()
    }

    /// Current states that pass validation; malformed ones are skipped
    pub fn entries(&self) -> Vec<AwarenessEntry> {
        let inner = self.inner.lock();
        let mut entries: Vec<AwarenessEntry> = inner
            .states
            .iter()
            .filter_map(|(client_id, state)| AwarenessEntry::from_state(*client_id, state))
            .collect();
        entries.sort_by_key(|entry| entry.client_id);
        entries
    }

    pub fn on_update<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&AwarenessChange) + Send + Sync + 'static,
    {
        self.updates.subscribe(listener)
    }

    pub fn listener_count(&self) -> usize {
        self.updates.len()
    }

    /// Merge states received from the relay
    pub fn apply_remote(&self, update: &AwarenessUpdate) {
        let change = {
            let mut inner = self.inner.lock();
            let mut change = AwarenessChange::default();

            for remote in &update.states {
                if remote.client_id == self.client_id {
                    continue;
                }

                let current_clock = inner.clocks.get(&remote.client_id).copied().unwrap_or(0);
                let known = inner.states.contains_key(&remote.client_id);
                let newer = remote.clock > current_clock;
                let removal_now = remote.clock == current_clock && remote.state.is_none() && known;
                if !newer && !removal_now {
                    continue;
                }

                inner.clocks.insert(remote.client_id, remote.clock);
                match &remote.state {
                    Some(state) => {
                        let previous = inner.states.insert(remote.client_id, state.clone());
                        match previous {
                            None => change.added.push(remote.client_id),
                            Some(previous) if previous != *state => change.updated.push(remote.client_id),
                            Some(_) => {}
                        }
                    }
                    None => {
                        if inner.states.remove(&remote.client_id).is_some() {
                            change.removed.push(remote.client_id);
                        }
                    }
                }
            }
            change
        };

        if !change.is_empty() {
            self.updates.emit(&change);
        }
    }

    /// Forget every remote state, e.g. after the link to the relay is lost
    pub fn remove_remote_states(&self) {
        let removed: Vec<ClientId> = {
            let mut inner = self.inner.lock();
            let remote: Vec<ClientId> = inner
                .states
                .keys()
                .copied()
                .filter(|client_id| *client_id != self.client_id)
                .collect();
            for client_id in &remote {
                inner.states.remove(client_id);
            }
            remote
        };

        if !removed.is_empty() {
            self.updates.emit(&AwarenessChange {
                removed,
                ..Default::default()
            });
        }
    }

    /// The local state as a wire update, if one was ever published
    pub fn local_update(&self) -> Option<AwarenessUpdate> {
        let inner = self.inner.lock();
        let clock = *inner.clocks.get(&self.client_id)?;
        Some(AwarenessUpdate::new(vec![AwarenessState {
            client_id: self.client_id,
            clock,
            state: inner.states.get(&self.client_id).cloned(),
        }]))
    }

    /// Bump the local clock and return the local state as a wire update.
    ///
    /// Sent on every (re)connect: peers that saw us leave hold our last
    /// clock, so re-announcing with the same clock would be ignored.
    pub fn renew_local(&self) -> Option<AwarenessUpdate> {
        let mut inner = self.inner.lock();
        let state = inner.states.get(&self.client_id).cloned()?;
        let clock = inner.clocks.entry(self.client_id).or_insert(0);
        *clock += 1;
        Some(AwarenessUpdate::new(vec![AwarenessState {
            client_id: self.client_id,
            clock: *clock,
            state: Some(state),
        }]))
    }

    /// Every known state as a wire update
    pub fn full_update(&self) -> AwarenessUpdate {
        let inner = self.inner.lock();
        let mut states: Vec<AwarenessState> = inner
            .states
            .iter()
            .map(|(client_id, state)| AwarenessState {
                client_id: *client_id,
                clock: inner.clocks.get(client_id).copied().unwrap_or(0),
                state: Some(state.clone()),
            })
            .collect();
        states.sort_by_key(|state| state.client_id);
        AwarenessUpdate::new(states)
    }
}

impl std::fmt::Debug for Awareness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Awareness")
            .field("client_id", &self.client_id)
            .field("states", &self.inner.lock().states.len())
            .finish()
    }
}
