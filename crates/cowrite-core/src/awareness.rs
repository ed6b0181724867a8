//! Awareness entries and the deduplicated presence roster
//!
//! Awareness states arrive as untyped JSON. They are validated here, at the
//! boundary: a state whose `user` carries neither an `id` nor a `name` is
//! dropped instead of flowing downstream with holes in it.

use crate::document::ClientId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Identity block published by each connection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessUser {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, rename = "colorLight", skip_serializing_if = "Option::is_none")]
    pub color_light: Option<String>,
}

/// One validated awareness state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwarenessEntry {
    pub client_id: ClientId,
    pub user: AwarenessUser,
}

impl AwarenessEntry {
    /// Validate a raw awareness state of the form `{ "user": { ... } }`.
    ///
    /// Empty strings count as absent. Returns `None` when the state has no
    /// usable identity.
    pub fn from_state(client_id: ClientId, state: &serde_json::Value) -> Option<Self> {
        let user = state.get("user")?;
        let mut user: AwarenessUser = serde_json::from_value(user.clone()).ok()?;

        user.id = user.id.filter(|s| !s.is_empty());
        user.name = user.name.filter(|s| !s.is_empty());
        if user.id.is_none() && user.name.is_none() {
            return None;
        }

        Some(Self { client_id, user })
    }

    /// Logical participant identity: the user ID, or `name:<name>` without one
    pub fn participant_key(&self) -> String {
        match &self.user.id {
            Some(id) => id.clone(),
            None => format!("name:{}", self.user.name.as_deref().unwrap_or_default()),
        }
    }
}

/// A logical participant, possibly holding several connections
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub key: String,
    pub name: Option<String>,
    pub color: Option<String>,
    pub client_ids: Vec<ClientId>,
}

/// Participants keyed by logical identity rather than connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceRoster {
    participants: BTreeMap<String, Participant>,
}

impl PresenceRoster {
    pub fn from_entries(entries: impl IntoIterator<Item = AwarenessEntry>) -> Self {
        let mut participants: BTreeMap<String, Participant> = BTreeMap::new();

        for entry in entries {
            let key = entry.participant_key();
            let participant = participants.entry(key.clone()).or_insert_with(|| Participant {
                key,
                name: None,
                color: None,
                client_ids: Vec::new(),
            });
            if participant.name.is_none() {
                participant.name = entry.user.name.clone();
            }
            if participant.color.is_none() {
                participant.color = entry.user.color.clone();
            }
            participant.client_ids.push(entry.client_id);
        }

        for participant in participants.values_mut() {
            participant.client_ids.sort_unstable();
        }

        Self { participants }
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn participants(&self) -> impl Iterator<Item = &Participant> {
        self.participants.values()
    }

    pub fn get(&self, key: &str) -> Option<&Participant> {
        self.participants.get(key)
    }

    pub fn keys(&self) -> BTreeSet<&str> {
        self.participants.keys().map(String::as_str).collect()
    }
}

/// Remembers the last published roster and reports only membership changes
#[derive(Debug, Default)]
pub struct RosterTracker {
    last: PresenceRoster,
}

impl RosterTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the new roster when its key set or count differs from the
    /// previous one; `None` when observers need not be told.
    pub fn update(&mut self, roster: PresenceRoster) -> Option<&PresenceRoster> {
        let changed = roster.len() != self.last.len() || roster.keys() != self.last.keys();
        if !changed {
            return None;
        }
        self.last = roster;
        Some(&self.last)
    }

    pub fn current(&self) -> &PresenceRoster {
        &self.last
    }

    pub fn reset(&mut self) {
        self.last = PresenceRoster::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(client_id: ClientId, state: serde_json::Value) -> Option<AwarenessEntry> {
        AwarenessEntry::from_state(client_id, &state)
    }

    #[test]
    fn test_same_id_on_two_connections_is_one_participant() {
        let roster = PresenceRoster::from_entries(
            [
                entry(1, json!({"user": {"id": "a", "name": "Alice"}})),
                entry(2, json!({"user": {"id": "a", "name": "Alice"}})),
            ]
            .into_iter()
            .flatten(),
        );

        assert_eq!(roster.len(), 1);
        assert_eq!(roster.get("a").unwrap().client_ids, vec![1, 2]);
    }

    #[test]
    fn test_anonymous_same_name_keyed_by_name() {
        let roster = PresenceRoster::from_entries(
            [
                entry(3, json!({"user": {"name": "Bob"}})),
                entry(4, json!({"user": {"name": "Bob"}})),
            ]
            .into_iter()
            .flatten(),
        );

        assert_eq!(roster.len(), 1);
        assert!(roster.get("name:Bob").is_some());
    }

    #[test]
    fn test_malformed_states_dropped() {
        assert!(entry(1, json!({})).is_none());
        assert!(entry(1, json!({"user": {}})).is_none());
        assert!(entry(1, json!({"user": {"id": "", "name": ""}})).is_none());
        assert!(entry(1, json!({"user": "not-an-object"})).is_none());
        assert!(entry(1, json!({"cursor": {"anchor": 3}})).is_none());
    }

    #[test]
    fn test_tracker_reports_membership_changes_only() {
        let mut tracker = RosterTracker::new();
        let alice = entry(1, json!({"user": {"id": "a", "name": "Alice"}})).unwrap();
        let alice_tab = entry(2, json!({"user": {"id": "a", "name": "Alice"}})).unwrap();
        let bob = entry(3, json!({"user": {"id": "b", "name": "Bob"}})).unwrap();

        assert!(tracker.update(PresenceRoster::from_entries([alice.clone()])).is_some());
        // A second tab for the same participant does not change membership
        assert!(tracker
            .update(PresenceRoster::from_entries([alice.clone(), alice_tab]))
            .is_none());
        assert_eq!(
            tracker
                .update(PresenceRoster::from_entries([alice, bob]))
                .map(|r| r.len()),
            Some(2)
        );
        assert!(tracker.update(PresenceRoster::default()).is_some());
        assert!(tracker.current().is_empty());
    }
}
