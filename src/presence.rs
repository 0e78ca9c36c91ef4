//! Presence tracking for remote cursors
//!
//! Folds sync/join/leave events from the presence channel into a table of
//! remote participants. Entries not refreshed within the stale window are
//! pruned.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use crate::backend::{PresenceEvent, PresenceEventKind, PresencePayload};

/// Drop participants not seen for this long
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(5);

/// Cursor colors handed out by participant id
pub const PARTICIPANT_COLORS: &[&str] = &[
    "#e6194b", "#3cb44b", "#4363d8", "#f58231", "#911eb4", "#42d4f4", "#f032e6", "#bfef45",
];

/// Stable color for a participant id
pub fn participant_color(id: &str) -> &'static str {
    let sum = id.bytes().fold(0usize, |acc, b| acc.wrapping_add(b as usize));
    PARTICIPANT_COLORS[sum % PARTICIPANT_COLORS.len()]
}

/// A remote participant as last reported
#[derive(Debug, Clone, PartialEq)]
pub struct Participant {
    pub id: String,
    pub display_name: String,
    pub cursor: Option<(f64, f64)>,
    pub online: bool,
    pub color: &'static str,
}

impl Participant {
    fn from_payload(id: &str, payload: &PresencePayload) -> Self {
        Self {
            id: id.to_string(),
            display_name: payload.display_name.clone(),
            cursor: payload.cursor,
            online: payload.online,
            color: participant_color(id),
        }
    }
}

/// Remote participants of one session, excluding ourselves
#[derive(Debug)]
pub struct PresenceTracker {
    local_id: String,
    stale_after: Duration,
    participants: HashMap<String, (Participant, Instant)>,
}

impl PresenceTracker {
    pub fn new(local_id: impl Into<String>, stale_after: Duration) -> Self {
        Self {
            local_id: local_id.into(),
            stale_after,
            participants: HashMap::new(),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Fold one presence event into the table
    pub fn apply(&mut self, event: &PresenceEvent) {
        match event.kind {
            PresenceEventKind::Sync => {
                self.participants
                    .retain(|id, _| event.state.contains_key(id));
                for (id, payload) in &event.state {
                    self.upsert(id, payload);
                }
            }
            PresenceEventKind::Join => {
                let joined = event
                    .participant_id
                    .as_ref()
                    .and_then(|id| event.state.get(id).map(|p| (id, p)));
                if let Some((id, payload)) = joined {
                    self.upsert(id, payload);
                }
            }
            PresenceEventKind::Leave => {
                if let Some(id) = &event.participant_id {
                    self.participants.remove(id);
                }
            }
        }
    }

    fn upsert(&mut self, id: &str, payload: &PresencePayload) {
        if id == self.local_id {
            return;
        }
        trace!(participant = %id, "presence update");
        self.participants.insert(
            id.to_string(),
            (Participant::from_payload(id, payload), Instant::now()),
        );
    }

    /// Remove participants not refreshed within the stale window
    pub fn prune_stale(&mut self) -> usize {
        let now = Instant::now();
        let before = self.participants.len();
        self.participants
            .retain(|_, (_, seen)| now.duration_since(*seen) < self.stale_after);
        before - self.participants.len()
    }

    pub fn get(&self, id: &str) -> Option<&Participant> {
        self.participants.get(id).map(|(p, _)| p)
    }

    /// Participants ordered by id
    pub fn participants(&self) -> Vec<&Participant> {
        let mut all: Vec<_> = self.participants.values().map(|(p, _)| p).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Online participants that have a cursor on the canvas
    pub fn cursors(&self) -> Vec<(&Participant, (f64, f64))> {
        self.participants()
            .into_iter()
            .filter(|p| p.online)
            .filter_map(|p| p.cursor.map(|c| (p, c)))
            .collect()
    }

    pub fn count(&self) -> usize {
        self.participants.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(name: &str, cursor: Option<(f64, f64)>) -> PresencePayload {
        PresencePayload {
            display_name: name.into(),
            cursor,
            online: true,
        }
    }

    fn sync(entries: &[(&str, PresencePayload)]) -> PresenceEvent {
        PresenceEvent {
            kind: PresenceEventKind::Sync,
            participant_id: None,
            state: entries
                .iter()
                .map(|(id, p)| (id.to_string(), p.clone()))
                .collect(),
        }
    }

    #[test]
    fn sync_replaces_table_and_skips_self() {
        let mut tracker = PresenceTracker::new("alice", DEFAULT_STALE_AFTER);
        tracker.apply(&sync(&[
            ("alice", payload("Alice", Some((1.0, 1.0)))),
            ("bob", payload("Bob", Some((2.0, 2.0)))),
            ("carol", payload("Carol", None)),
        ]));
        assert_eq!(tracker.count(), 2);
        assert!(tracker.get("alice").is_none());

        tracker.apply(&sync(&[("bob", payload("Bob", Some((5.0, 5.0))))]));
        assert_eq!(tracker.count(), 1);
        assert_eq!(tracker.get("bob").unwrap().cursor, Some((5.0, 5.0)));
    }

    #[test]
    fn join_and_leave_touch_one_entry() {
        let mut tracker = PresenceTracker::new("alice", DEFAULT_STALE_AFTER);
        let mut join = sync(&[("bob", payload("Bob", None))]);
        join.kind = PresenceEventKind::Join;
        join.participant_id = Some("bob".into());
        tracker.apply(&join);
        assert_eq!(tracker.count(), 1);

        let leave = PresenceEvent {
            kind: PresenceEventKind::Leave,
            participant_id: Some("bob".into()),
            state: HashMap::new(),
        };
        tracker.apply(&leave);
        assert_eq!(tracker.count(), 0);
    }

    #[test]
    fn cursors_only_for_online_with_position() {
        let mut tracker = PresenceTracker::new("alice", DEFAULT_STALE_AFTER);
        let mut away = payload("Dan", Some((9.0, 9.0)));
        away.online = false;
        tracker.apply(&sync(&[
            ("bob", payload("Bob", Some((2.0, 3.0)))),
            ("carol", payload("Carol", None)),
            ("dan", away),
        ]));

        let cursors = tracker.cursors();
        assert_eq!(cursors.len(), 1);
        assert_eq!(cursors[0].0.id, "bob");
        assert_eq!(cursors[0].1, (2.0, 3.0));
    }

    #[test]
    fn colors_are_stable_per_id() {
        assert_eq!(participant_color("bob"), participant_color("bob"));
        assert!(PARTICIPANT_COLORS.contains(&participant_color("someone-else")));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_participants_are_pruned() {
        let mut tracker = PresenceTracker::new("alice", Duration::from_secs(5));
        tracker.apply(&sync(&[("bob", payload("Bob", None))]));

        tokio::time::advance(Duration::from_secs(3)).await;
        tracker.apply(&sync(&[
            ("bob", payload("Bob", None)),
            ("carol", payload("Carol", None)),
        ]));
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(tracker.prune_stale(), 0);

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(tracker.prune_stale(), 2);
    }
}
