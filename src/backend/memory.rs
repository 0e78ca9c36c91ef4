//! In-memory collaborator implementations
//!
//! One `MemoryBackend` plays object store, change feed, action log and
//! presence channel for any number of sessions in the same process. Every
//! write is echoed to all change subscribers of the row's session, including
//! the writer, the way row-level change feeds behave.
//!
//! Failure injection hooks let tests exercise the error paths.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};
use uuid::Uuid;

use super::{
    ActionLogStore, ActionRow, ChangeEvent, ChangeEventType, ChangeFeed, ChannelStatus,
    NewActionRow, NewObjectRow, ObjectFilter, ObjectKind, ObjectRow, ObjectStore,
    PresenceChannel, PresenceEvent, PresenceEventKind, PresencePayload, PresenceSubscription,
    Subscription,
};

struct FeedSubscriber {
    session_id: String,
    events: mpsc::UnboundedSender<ChangeEvent>,
    status: watch::Sender<ChannelStatus>,
}

struct PresenceSubscriber {
    session_id: String,
    events: mpsc::UnboundedSender<PresenceEvent>,
}

#[derive(Default)]
struct MemoryState {
    objects: Vec<ObjectRow>,
    actions: Vec<ActionRow>,
    feeds: Vec<FeedSubscriber>,
    presence: HashMap<String, HashMap<String, PresencePayload>>,
    presence_subs: Vec<PresenceSubscriber>,
    objects_failing: bool,
    actions_failing: bool,
    subscribe_failing: bool,
    presence_join_failures: usize,
}

impl MemoryState {
    fn publish(&mut self, event: ChangeEvent) {
        let Some(session_id) = event.session_id().map(str::to_string) else {
            return;
        };
        self.feeds.retain(|sub| {
            if sub.session_id != session_id {
                return !sub.events.is_closed();
            }
            sub.events.send(event.clone()).is_ok()
        });
    }

    fn publish_presence(&mut self, session_id: &str, kind: PresenceEventKind, who: Option<&str>) {
        let state = self.presence.get(session_id).cloned().unwrap_or_default();
        let event = PresenceEvent {
            kind,
            participant_id: who.map(str::to_string),
            state,
        };
        self.presence_subs.retain(|sub| {
            if sub.session_id != session_id {
                return !sub.events.is_closed();
            }
            sub.events.send(event.clone()).is_ok()
        });
    }
}

/// Shared in-process backend. Clones point at the same state.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend").finish()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make every object-store call fail until reset
    pub fn set_failing(&self, failing: bool) {
        self.lock().objects_failing = failing;
    }

    /// Make every action-log call fail until reset
    pub fn set_action_log_failing(&self, failing: bool) {
        self.lock().actions_failing = failing;
    }

    /// Make change-feed subscriptions fail until reset
    pub fn set_subscribe_failing(&self, failing: bool) {
        self.lock().subscribe_failing = failing;
    }

    /// Fail the next `count` presence joins
    pub fn fail_presence_joins(&self, count: usize) {
        self.lock().presence_join_failures = count;
    }

    /// Push a channel status to every subscriber of a session
    pub fn set_channel_status(&self, session_id: &str, status: ChannelStatus) {
        let state = self.lock();
        for sub in state.feeds.iter().filter(|s| s.session_id == session_id) {
            let _ = sub.status.send(status);
        }
    }

    /// Mark a row as soft-deleted, as another client's archive would
    pub fn soft_delete(&self, id: Uuid, session_id: &str) -> Result<()> {
        let mut state = self.lock();
        let row = state
            .objects
            .iter_mut()
            .find(|r| r.id == id && r.session_id == session_id)
            .ok_or_else(|| anyhow!("object {} not found", id))?;
        let old = row.clone();
        let now = Utc::now();
        row.deleted_at = Some(now);
        row.updated_at = now;
        let new = row.clone();
        state.publish(ChangeEvent {
            event_type: ChangeEventType::Update,
            new: Some(new),
            old: Some(old),
        });
        Ok(())
    }

    /// Snapshot of every stored row (including soft-deleted)
    pub fn rows(&self) -> Vec<ObjectRow> {
        self.lock().objects.clone()
    }

    /// Snapshot of the action log
    pub fn actions(&self) -> Vec<ActionRow> {
        self.lock().actions.clone()
    }

    /// Participants currently tracked in a session
    pub fn presence_state(&self, session_id: &str) -> HashMap<String, PresencePayload> {
        self.lock()
            .presence
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ObjectStore for MemoryBackend {
    async fn insert(&self, row: NewObjectRow) -> Result<ObjectRow> {
        let mut state = self.lock();
        if state.objects_failing {
            bail!("object store unavailable");
        }

        let id = row.id.unwrap_or_else(Uuid::new_v4);
        if state.objects.iter().any(|r| r.id == id) {
            bail!("duplicate key: object {} already exists", id);
        }

        let now = Utc::now();
        let stored = ObjectRow {
            id,
            session_id: row.session_id,
            author_id: row.author_id,
            kind: row.kind,
            data: row.data,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        trace!(id = %id, session = %stored.session_id, "insert object");
        state.objects.push(stored.clone());
        state.publish(ChangeEvent {
            event_type: ChangeEventType::Insert,
            new: Some(stored.clone()),
            old: None,
        });
        Ok(stored)
    }

    async fn update(
        &self,
        id: Uuid,
        session_id: &str,
        kind: ObjectKind,
        data: Value,
    ) -> Result<ObjectRow> {
        let mut state = self.lock();
        if state.objects_failing {
            bail!("object store unavailable");
        }

        let row = state
            .objects
            .iter_mut()
            .find(|r| r.id == id && r.session_id == session_id && r.deleted_at.is_none())
            .ok_or_else(|| anyhow!("object {} not found in session {}", id, session_id))?;
        let old = row.clone();
        row.kind = kind;
        row.data = data;
        row.updated_at = Utc::now();
        let new = row.clone();
        trace!(id = %id, session = %session_id, "update object");
        state.publish(ChangeEvent {
            event_type: ChangeEventType::Update,
            new: Some(new.clone()),
            old: Some(old),
        });
        Ok(new)
    }

    async fn delete(&self, id: Uuid, session_id: &str) -> Result<()> {
        let mut state = self.lock();
        if state.objects_failing {
            bail!("object store unavailable");
        }

        let Some(idx) = state
            .objects
            .iter()
            .position(|r| r.id == id && r.session_id == session_id)
        else {
            // Deleting an absent row affects nothing
            return Ok(());
        };
        let old = state.objects.remove(idx);
        trace!(id = %id, session = %session_id, "delete object");
        state.publish(ChangeEvent {
            event_type: ChangeEventType::Delete,
            new: None,
            old: Some(old),
        });
        Ok(())
    }

    async fn delete_all(&self, session_id: &str) -> Result<()> {
        let mut state = self.lock();
        if state.objects_failing {
            bail!("object store unavailable");
        }

        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.objects)
            .into_iter()
            .partition(|r| r.session_id == session_id);
        state.objects = kept;
        debug!(session = %session_id, count = removed.len(), "delete all objects");
        for old in removed {
            state.publish(ChangeEvent {
                event_type: ChangeEventType::Delete,
                new: None,
                old: Some(old),
            });
        }
        Ok(())
    }

    async fn select(&self, filter: &ObjectFilter) -> Result<Vec<ObjectRow>> {
        let state = self.lock();
        if state.objects_failing {
            bail!("object store unavailable");
        }

        let mut rows: Vec<ObjectRow> = state
            .objects
            .iter()
            .filter(|r| r.session_id == filter.session_id)
            .filter(|r| filter.author_id.as_ref().is_none_or(|a| &r.author_id == a))
            .filter(|r| filter.include_deleted || r.deleted_at.is_none())
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.created_at);
        Ok(rows)
    }
}

#[async_trait]
impl ChangeFeed for MemoryBackend {
    async fn subscribe(&self, session_id: &str) -> Result<Subscription> {
        let mut state = self.lock();
        if state.subscribe_failing {
            bail!("realtime channel unavailable");
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ChannelStatus::Subscribed);
        state.feeds.push(FeedSubscriber {
            session_id: session_id.to_string(),
            events: events_tx,
            status: status_tx,
        });
        debug!(session = %session_id, "change feed subscribed");
        Ok(Subscription {
            events: events_rx,
            status: status_rx,
        })
    }
}

#[async_trait]
impl ActionLogStore for MemoryBackend {
    async fn insert_action(&self, row: NewActionRow) -> Result<ActionRow> {
        let mut state = self.lock();
        if state.actions_failing {
            bail!("action log unavailable");
        }

        let stored = ActionRow {
            id: Uuid::new_v4(),
            user_id: row.user_id,
            canvas_id: row.canvas_id,
            action_type: row.action_type,
            object_type: row.object_type,
            object_id: row.object_id,
            before_state: row.before_state,
            after_state: row.after_state,
            timestamp: row.timestamp,
            undone_at: None,
        };
        state.actions.push(stored.clone());
        Ok(stored)
    }

    async fn set_undone(&self, id: Uuid, undone_at: Option<DateTime<Utc>>) -> Result<()> {
        let mut state = self.lock();
        if state.actions_failing {
            bail!("action log unavailable");
        }

        let row = state
            .actions
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| anyhow!("action {} not found", id))?;
        row.undone_at = undone_at;
        Ok(())
    }

    async fn delete_action(&self, id: Uuid) -> Result<()> {
        let mut state = self.lock();
        if state.actions_failing {
            bail!("action log unavailable");
        }

        state.actions.retain(|r| r.id != id);
        trace!(action = %id, "delete action");
        Ok(())
    }

    async fn load_actions(
        &self,
        user_id: &str,
        canvas_id: &str,
        limit: usize,
    ) -> Result<Vec<ActionRow>> {
        let state = self.lock();
        if state.actions_failing {
            bail!("action log unavailable");
        }

        let mut rows: Vec<ActionRow> = state
            .actions
            .iter()
            .filter(|r| r.user_id == user_id && r.canvas_id == canvas_id)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.timestamp);
        let skip = rows.len().saturating_sub(limit);
        Ok(rows.split_off(skip))
    }
}

#[async_trait]
impl PresenceChannel for MemoryBackend {
    async fn join(&self, session_id: &str, participant_id: &str) -> Result<PresenceSubscription> {
        let mut state = self.lock();
        if state.presence_join_failures > 0 {
            state.presence_join_failures -= 1;
            bail!("presence channel refused join");
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let snapshot = PresenceEvent {
            kind: PresenceEventKind::Sync,
            participant_id: None,
            state: state.presence.get(session_id).cloned().unwrap_or_default(),
        };
        let _ = tx.send(snapshot);
        state.presence_subs.push(PresenceSubscriber {
            session_id: session_id.to_string(),
            events: tx,
        });
        debug!(session = %session_id, participant = %participant_id, "presence joined");
        Ok(PresenceSubscription { events: rx })
    }

    async fn track(
        &self,
        session_id: &str,
        participant_id: &str,
        payload: PresencePayload,
    ) -> Result<()> {
        let mut state = self.lock();
        let previous = state
            .presence
            .entry(session_id.to_string())
            .or_default()
            .insert(participant_id.to_string(), payload);
        if previous.is_none() {
            state.publish_presence(session_id, PresenceEventKind::Join, Some(participant_id));
        }
        state.publish_presence(session_id, PresenceEventKind::Sync, None);
        Ok(())
    }

    async fn leave(&self, session_id: &str, participant_id: &str) -> Result<()> {
        let mut state = self.lock();
        let removed = state
            .presence
            .get_mut(session_id)
            .and_then(|m| m.remove(participant_id));
        if removed.is_some() {
            state.publish_presence(session_id, PresenceEventKind::Leave, Some(participant_id));
            state.publish_presence(session_id, PresenceEventKind::Sync, None);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_row(session: &str) -> NewObjectRow {
        NewObjectRow {
            id: None,
            session_id: session.to_string(),
            author_id: "alice".to_string(),
            kind: ObjectKind::Rect,
            data: json!({"x": 1.0}),
        }
    }

    #[tokio::test]
    async fn writes_echo_to_session_subscribers_only() {
        let backend = MemoryBackend::new();
        let mut mine = backend.subscribe("s1").await.unwrap();
        let mut other = backend.subscribe("s2").await.unwrap();

        let row = backend.insert(new_row("s1")).await.unwrap();

        let event = mine.events.try_recv().unwrap();
        assert_eq!(event.event_type, ChangeEventType::Insert);
        assert_eq!(event.row_id(), Some(row.id));
        assert!(other.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn update_and_delete_are_session_scoped() {
        let backend = MemoryBackend::new();
        let row = backend.insert(new_row("s1")).await.unwrap();

        assert!(
            backend
                .update(row.id, "s2", ObjectKind::Rect, json!({}))
                .await
                .is_err()
        );
        backend.delete(row.id, "s2").await.unwrap();
        assert_eq!(backend.rows().len(), 1);

        backend.delete(row.id, "s1").await.unwrap();
        assert!(backend.rows().is_empty());
    }

    #[tokio::test]
    async fn select_hides_soft_deleted_rows() {
        let backend = MemoryBackend::new();
        let kept = backend.insert(new_row("s1")).await.unwrap();
        let archived = backend.insert(new_row("s1")).await.unwrap();
        backend.soft_delete(archived.id, "s1").unwrap();

        let rows = backend.select(&ObjectFilter::session("s1")).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, kept.id);

        let bob = backend
            .select(&ObjectFilter::session("s1").author("bob"))
            .await
            .unwrap();
        assert!(bob.is_empty());
    }

    #[tokio::test]
    async fn failing_store_reports_errors() {
        let backend = MemoryBackend::new();
        backend.set_failing(true);
        assert!(backend.insert(new_row("s1")).await.is_err());
        backend.set_failing(false);
        assert!(backend.insert(new_row("s1")).await.is_ok());
    }

    #[tokio::test]
    async fn presence_join_receives_snapshot_then_updates() {
        let backend = MemoryBackend::new();
        backend
            .track(
                "s1",
                "bob",
                PresencePayload {
                    display_name: "Bob".into(),
                    cursor: Some((1.0, 2.0)),
                    online: true,
                },
            )
            .await
            .unwrap();

        let mut sub = backend.join("s1", "alice").await.unwrap();
        let first = sub.events.try_recv().unwrap();
        assert_eq!(first.kind, PresenceEventKind::Sync);
        assert!(first.state.contains_key("bob"));

        backend.leave("s1", "bob").await.unwrap();
        let leave = sub.events.try_recv().unwrap();
        assert_eq!(leave.kind, PresenceEventKind::Leave);
        assert_eq!(leave.participant_id.as_deref(), Some("bob"));
    }
}
