//! Presence styling broadcaster
//!
//! Publishes the local identity into the awareness channel and keeps one
//! stylesheet fragment with selection, caret and label rules for every
//! remote client.

use crate::collaborators::StyleSink;
use cowrite_core::{AwarenessEntry, AwarenessUser, ClientId, PresenceColor, Subscription};
use cowrite_transport::Awareness;
use parking_lot::Mutex;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Who the local user is
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalIdentity {
    pub id: Option<String>,
    pub name: Option<String>,
}

impl LocalIdentity {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            name: Some(name.into()),
        }
    }

    pub fn anonymous(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: Some(name.into()),
        }
    }
}

pub struct PresenceBroadcaster {
    awareness: Arc<Awareness>,
    sink: Arc<dyn StyleSink>,
    style_id: String,
    color: PresenceColor,
    subscription: Mutex<Option<Subscription>>,
    detached: AtomicBool,
}

impl PresenceBroadcaster {
    /// Publish `identity` and start maintaining the remote-client stylesheet
    pub fn attach(awareness: Arc<Awareness>, identity: &LocalIdentity, sink: Arc<dyn StyleSink>) -> Self {
        // Without an id the color is seeded per session
        let seed = match &identity.id {
            Some(id) => id.clone(),
            None => uuid::Uuid::new_v4().to_string(),
        };
        let color = PresenceColor::from_identity(&seed);

        let user = AwarenessUser {
            id: identity.id.clone(),
            name: identity.name.clone(),
            color: Some(color.color()),
            color_light: Some(color.color_light()),
        };
        match serde_json::to_value(&user) {
            Ok(user) => awareness.set_local_state(serde_json::json!({ "user": user })),
            Err(e) => warn!(error = %e, "Failed to encode local presence"),
        }

        let style_id = format!("cowrite-presence-{}", awareness.client_id());
        let subscription = {
            let weak = Arc::downgrade(&awareness);
            let sink = sink.clone();
            let style_id = style_id.clone();
            awareness.on_update(move |_| {
                if let Some(awareness) = weak.upgrade() {
                    sink.replace(&style_id, &stylesheet_for(&awareness));
                }
            })
        };
        sink.replace(&style_id, &stylesheet_for(&awareness));
        debug!(style_id = %style_id, hue = color.hue, "Presence attached");

        Self {
            awareness,
            sink,
            style_id,
            color,
            subscription: Mutex::new(Some(subscription)),
            detached: AtomicBool::new(false),
        }
    }

    pub fn color(&self) -> PresenceColor {
        self.color
    }

    pub fn style_id(&self) -> &str {
        &self.style_id
    }

    /// The fragment as it would be rendered now
    pub fn stylesheet(&self) -> String {
        stylesheet_for(&self.awareness)
    }

    /// Unsubscribe and remove the injected stylesheet. Idempotent.
    pub fn detach(&self) {
        if self.detached.swap(true, Ordering::SeqCst) {
            return;
        }
        drop(self.subscription.lock().take());
        self.sink.remove(&self.style_id);
        debug!(style_id = %self.style_id, "Presence detached");
    }
}

impl Drop for PresenceBroadcaster {
    fn drop(&mut self) {
        self.detach();
    }
}

fn stylesheet_for(awareness: &Awareness) -> String {
    render_stylesheet(awareness.client_id(), &awareness.entries())
}

/// Rule-sets for every entry except `local`, ordered by client ID
pub fn render_stylesheet(local: ClientId, entries: &[AwarenessEntry]) -> String {
    let mut css = String::new();
    let mut remote: Vec<&AwarenessEntry> = entries.iter().filter(|e| e.client_id != local).collect();
    remote.sort_by_key(|e| e.client_id);

    for entry in remote {
        let derived = PresenceColor::from_identity(&entry.participant_key());
        let color = entry
            .user
            .color
            .as_deref()
            .filter(|c| is_safe_color(c))
            .map(str::to_string)
            .unwrap_or_else(|| derived.color());
        let light = entry
            .user
            .color_light
            .as_deref()
            .filter(|c| is_safe_color(c))
            .map(str::to_string)
            .unwrap_or_else(|| derived.color_light());
        let label = escape_css_string(entry.user.name.as_deref().unwrap_or("Anonymous"));
        let id = entry.client_id;

        let _ = writeln!(css, ".yRemoteSelection-{id} {{ background-color: {light}; }}");
        let _ = writeln!(
            css,
            ".yRemoteSelectionHead-{id} {{ border-left: 2px solid {color}; border-color: {color}; }}"
        );
        let _ = writeln!(
            css,
            ".yRemoteSelectionHead-{id}::after {{ content: \"{label}\"; background-color: {color}; }}"
        );
    }
    css
}

/// Colors come from peers; anything that could break out of a declaration is refused
fn is_safe_color(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 64
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '#' | '(' | ')' | ',' | '.' | '%' | ' '))
}

fn escape_css_string(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '"' => escaped.push_str("\\\""),
            '\\' => escaped.push_str("\\\\"),
            '\n' => escaped.push_str("\\a "),
            c if c.is_control() => {}
            c => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::MemoryStyleSink;
    use cowrite_protocol::{AwarenessState, AwarenessUpdate};
    use serde_json::json;

    fn entry(client_id: ClientId, id: Option<&str>, name: &str, color: Option<&str>) -> AwarenessEntry {
        AwarenessEntry {
            client_id,
            user: AwarenessUser {
                id: id.map(String::from),
                name: Some(name.to_string()),
                color: color.map(String::from),
                color_light: None,
            },
        }
    }

    #[test]
    fn test_stylesheet_skips_local_client() {
        let css = render_stylesheet(
            1,
            &[entry(1, Some("me"), "Me", None), entry(2, Some("b"), "Bea", Some("#ff0000"))],
        );
        assert!(!css.contains("yRemoteSelection-1 "));
        assert!(css.contains(".yRemoteSelection-2 {"));
        assert!(css.contains(".yRemoteSelectionHead-2::after { content: \"Bea\"; background-color: #ff0000; }"));
    }

    #[test]
    fn test_untrusted_color_and_name_are_neutralized() {
        let css = render_stylesheet(
            1,
            &[entry(7, None, "Eve\" } body { display: none", Some("red; } * { color: red"))],
        );
        let derived = PresenceColor::from_identity("name:Eve\" } body { display: none");
        assert!(css.contains(&derived.color()));
        assert!(css.contains("content: \"Eve\\\" } body { display: none\""));
        assert!(!css.contains("red;"));
    }

    #[test]
    fn test_attach_publishes_identity_and_detach_cleans_up() {
        let awareness = Arc::new(Awareness::new(10));
        let sink = Arc::new(MemoryStyleSink::new());
        let presence = PresenceBroadcaster::attach(awareness.clone(), &LocalIdentity::new("user-42", "Ada"), sink.clone());

        let state = awareness.local_state().unwrap();
        assert_eq!(state["user"]["id"], "user-42");
        assert_eq!(state["user"]["color"], PresenceColor::from_identity("user-42").color());
        assert_eq!(state["user"]["colorLight"], PresenceColor::from_identity("user-42").color_light());

        awareness.apply_remote(&AwarenessUpdate::new(vec![AwarenessState {
            client_id: 11,
            clock: 1,
            state: Some(json!({"user": {"id": "b", "name": "Bo"}})),
        }]));
        let css = sink.get(presence.style_id()).unwrap();
        assert!(css.contains(".yRemoteSelection-11"));
        assert_eq!(awareness.listener_count(), 1);

        presence.detach();
        presence.detach();
        assert!(sink.is_empty());
        assert_eq!(awareness.listener_count(), 0);
    }

    #[test]
    fn test_anonymous_identity_still_colored() {
        let awareness = Arc::new(Awareness::new(3));
        let sink = Arc::new(MemoryStyleSink::new());
        let _presence = PresenceBroadcaster::attach(awareness.clone(), &LocalIdentity::anonymous("Guest"), sink);

        let entry = AwarenessEntry::from_state(3, &awareness.local_state().unwrap()).unwrap();
        assert_eq!(entry.participant_key(), "name:Guest");
        assert!(entry.user.color.is_some());
    }
}
