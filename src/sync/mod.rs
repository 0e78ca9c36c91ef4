//! Realtime sync engine for canvas-sync
//!
//! Subscribes to the session's change feed and merges remote row changes
//! into the local shape store:
//! - own writes echoing back are dropped via the echo ledger
//! - every handler is idempotent, so duplicate and out-of-order delivery
//!   converge to the same store
//! - concurrent edits resolve last-write-wins; the store reflects whatever
//!   row the backend last accepted
//!
//! Remote changes are applied with the replay flag held so nothing reaches
//! the action history.

pub mod presence_protocol;

use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::backend::{ChangeEvent, ChangeEventType, ChangeFeed, ChannelStatus, Subscription};
use crate::echo::EchoLedger;
use crate::persistence::decode;
use crate::replay::ReplayFlag;
use crate::shapes::{Shape, ShapeId};
use crate::status::StatusSlot;
use crate::store::ShapeStore;

/// Connection state of the change feed subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Subscribed,
    ChannelError,
    TimedOut,
    Closed,
}

impl ConnectionStatus {
    /// Terminal states; the caller decides whether to `start` again
    pub fn is_failed(self) -> bool {
        matches!(
            self,
            ConnectionStatus::ChannelError | ConnectionStatus::TimedOut | ConnectionStatus::Closed
        )
    }
}

impl From<ChannelStatus> for ConnectionStatus {
    fn from(status: ChannelStatus) -> Self {
        match status {
            ChannelStatus::Joining => ConnectionStatus::Connecting,
            ChannelStatus::Subscribed => ConnectionStatus::Subscribed,
            ChannelStatus::ChannelError => ConnectionStatus::ChannelError,
            ChannelStatus::TimedOut => ConnectionStatus::TimedOut,
            ChannelStatus::Closed => ConnectionStatus::Closed,
        }
    }
}

/// What applying one remote event did to the store
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Inserted(Shape),
    Updated(Shape),
    Removed(ShapeId),
    /// Our own write echoing back
    SuppressedEcho,
    /// Already applied (duplicate insert, delete of an absent shape)
    Duplicate,
    /// Not for this session, not for a known shape, or engine stopped
    Ignored,
    /// Row could not be decoded
    Rejected,
}

/// Change feed subscription plus the merge rules for one session
pub struct RealtimeSync {
    feed: Arc<dyn ChangeFeed>,
    session_id: String,
    status: ConnectionStatus,
    subscription: Option<Subscription>,
    errors: StatusSlot,
    replay: ReplayFlag,
}

impl std::fmt::Debug for RealtimeSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeSync")
            .field("session_id", &self.session_id)
            .field("status", &self.status)
            .finish()
    }
}

impl RealtimeSync {
    pub fn new(
        feed: Arc<dyn ChangeFeed>,
        session_id: impl Into<String>,
        errors: StatusSlot,
        replay: ReplayFlag,
    ) -> Self {
        Self {
            feed,
            session_id: session_id.into(),
            status: ConnectionStatus::Disconnected,
            subscription: None,
            errors,
            replay,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Whether a subscription is held. Events are only applied while live.
    pub fn is_live(&self) -> bool {
        self.subscription.is_some()
    }

    /// Subscribe to the session topic. No automatic retry on failure.
    pub async fn start(&mut self) -> bool {
        if self.is_live() {
            return true;
        }

        self.status = ConnectionStatus::Connecting;
        match self.feed.subscribe(&self.session_id).await {
            Ok(subscription) => {
                let status = ConnectionStatus::from(*subscription.status.borrow());
                self.subscription = Some(subscription);
                self.transition(status);
                info!(session = %self.session_id, status = ?self.status, "realtime sync started");
                !self.status.is_failed()
            }
            Err(e) => {
                warn!(session = %self.session_id, error = %e, "failed to subscribe");
                self.errors.set_error(format!("Failed to subscribe: {}", e));
                self.status = ConnectionStatus::ChannelError;
                false
            }
        }
    }

    /// Unsubscribe and reset. Late events are no longer applied.
    pub fn stop(&mut self) {
        if self.subscription.take().is_some() {
            debug!(session = %self.session_id, "realtime sync stopped");
        }
        self.status = ConnectionStatus::Disconnected;
    }

    /// Pick up a channel status change, if any. Returns the new status.
    pub fn poll_status(&mut self) -> Option<ConnectionStatus> {
        let subscription = self.subscription.as_mut()?;
        let next = match subscription.status.has_changed() {
            Ok(true) => ConnectionStatus::from(*subscription.status.borrow_and_update()),
            Ok(false) => return None,
            // Sender gone: the channel is closed for good
            Err(_) => ConnectionStatus::Closed,
        };
        if next == self.status {
            return None;
        }
        self.transition(next);
        Some(next)
    }

    fn transition(&mut self, next: ConnectionStatus) {
        self.status = next;
        if next.is_failed() {
            warn!(session = %self.session_id, status = ?next, "realtime channel failed");
            self.errors
                .set_error(format!("Realtime channel {:?}", next));
            self.subscription = None;
        }
    }

    /// Next queued event without waiting
    pub fn try_next(&mut self) -> Option<ChangeEvent> {
        self.subscription.as_mut()?.events.try_recv().ok()
    }

    /// Wait for the next event. `None` once stopped or the feed closes.
    pub async fn next_event(&mut self) -> Option<ChangeEvent> {
        let event = self.subscription.as_mut()?.events.recv().await;
        if event.is_none() {
            self.transition(ConnectionStatus::Closed);
        }
        event
    }

    /// Merge one remote event into the store
    pub fn apply(
        &self,
        event: ChangeEvent,
        store: &mut ShapeStore,
        echo: &mut EchoLedger,
    ) -> SyncOutcome {
        if !self.is_live() {
            trace!("sync stopped, dropping late event");
            return SyncOutcome::Ignored;
        }
        if event.session_id() != Some(self.session_id.as_str()) {
            return SyncOutcome::Ignored;
        }
        let Some(row_id) = event.row_id() else {
            return SyncOutcome::Ignored;
        };
        let id = ShapeId(row_id);

        let _replay = self.replay.hold();
        let outcome = match event.event_type {
            ChangeEventType::Insert => self.apply_insert(id, &event, store, echo),
            ChangeEventType::Update => self.apply_update(id, &event, store),
            ChangeEventType::Delete => {
                if echo.is_own(id) {
                    SyncOutcome::SuppressedEcho
                } else if store.delete(id) {
                    SyncOutcome::Removed(id)
                } else {
                    SyncOutcome::Duplicate
                }
            }
        };
        trace!(id = %id, event = ?event.event_type, outcome = ?outcome, "remote change");
        outcome
    }

    fn apply_insert(
        &self,
        id: ShapeId,
        event: &ChangeEvent,
        store: &mut ShapeStore,
        echo: &mut EchoLedger,
    ) -> SyncOutcome {
        // Local writes land in the store before they are persisted, so an own
        // echo for an absent shape means a later local delete removed it.
        if echo.is_own(id) {
            return SyncOutcome::SuppressedEcho;
        }
        if store.contains(id) {
            return SyncOutcome::Duplicate;
        }
        match self.decode(event) {
            Some(shape) => {
                store.insert(shape.clone());
                SyncOutcome::Inserted(shape)
            }
            None => SyncOutcome::Rejected,
        }
    }

    fn apply_update(&self, id: ShapeId, event: &ChangeEvent, store: &mut ShapeStore) -> SyncOutcome {
        let Some(row) = event.new.as_ref() else {
            return SyncOutcome::Ignored;
        };
        if row.is_soft_deleted() {
            // Absent locally means our own removal echoing back
            return if store.delete(id) {
                SyncOutcome::Removed(id)
            } else {
                SyncOutcome::SuppressedEcho
            };
        }
        if !store.contains(id) {
            return SyncOutcome::Ignored;
        }
        match self.decode(event) {
            Some(shape) => {
                store.replace(shape.clone());
                SyncOutcome::Updated(shape)
            }
            None => SyncOutcome::Rejected,
        }
    }

    fn decode(&self, event: &ChangeEvent) -> Option<Shape> {
        let row = event.new.as_ref()?;
        match decode(row) {
            Ok(shape) => Some(shape),
            Err(e) => {
                warn!(id = %row.id, error = %e, "failed to decode remote row");
                self.errors
                    .set_error(format!("Failed to decode remote change: {}", e));
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, ObjectKind, ObjectRow};
    use crate::persistence::encode;
    use crate::shapes::{ShapeDraft, ShapePatch};
    use chrono::Utc;

    fn row_for(shape: &Shape, session: &str) -> ObjectRow {
        let (kind, data) = encode(shape).unwrap();
        let now = Utc::now();
        ObjectRow {
            id: shape.id.0,
            session_id: session.into(),
            author_id: "bob".into(),
            kind,
            data,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    fn insert(shape: &Shape) -> ChangeEvent {
        ChangeEvent {
            event_type: ChangeEventType::Insert,
            new: Some(row_for(shape, "canvas-1")),
            old: None,
        }
    }

    fn delete(shape: &Shape) -> ChangeEvent {
        ChangeEvent {
            event_type: ChangeEventType::Delete,
            new: None,
            old: Some(row_for(shape, "canvas-1")),
        }
    }

    async fn live_engine(backend: &MemoryBackend) -> RealtimeSync {
        let mut sync = RealtimeSync::new(
            Arc::new(backend.clone()),
            "canvas-1",
            StatusSlot::new(),
            ReplayFlag::new(),
        );
        assert!(sync.start().await);
        sync
    }

    fn rect() -> Shape {
        ShapeDraft::rectangle(100.0, 100.0, 100.0, 60.0)
            .fill("#ff0000")
            .build(ShapeId::new())
    }

    #[tokio::test]
    async fn start_moves_to_subscribed() {
        let backend = MemoryBackend::new();
        let sync = live_engine(&backend).await;
        assert_eq!(sync.status(), ConnectionStatus::Subscribed);
        assert!(sync.is_live());
    }

    #[tokio::test]
    async fn subscribe_failure_is_recorded() {
        let backend = MemoryBackend::new();
        backend.set_subscribe_failing(true);
        let errors = StatusSlot::new();
        let mut sync = RealtimeSync::new(
            Arc::new(backend.clone()),
            "canvas-1",
            errors.clone(),
            ReplayFlag::new(),
        );

        assert!(!sync.start().await);
        assert_eq!(sync.status(), ConnectionStatus::ChannelError);
        assert!(errors.error().unwrap().contains("subscribe"));
    }

    #[tokio::test]
    async fn channel_timeout_drops_subscription() {
        let backend = MemoryBackend::new();
        let mut sync = live_engine(&backend).await;

        backend.set_channel_status("canvas-1", ChannelStatus::TimedOut);
        assert_eq!(sync.poll_status(), Some(ConnectionStatus::TimedOut));
        assert!(!sync.is_live());
        assert_eq!(sync.poll_status(), None);
    }

    #[tokio::test]
    async fn duplicate_insert_is_idempotent() {
        let backend = MemoryBackend::new();
        let sync = live_engine(&backend).await;
        let mut store = ShapeStore::new();
        let mut echo = EchoLedger::default();
        let shape = rect();

        assert_eq!(
            sync.apply(insert(&shape), &mut store, &mut echo),
            SyncOutcome::Inserted(shape.clone())
        );
        assert_eq!(
            sync.apply(insert(&shape), &mut store, &mut echo),
            SyncOutcome::Duplicate
        );
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(shape.id), Some(&shape));
    }

    #[tokio::test]
    async fn own_insert_echo_is_suppressed_once() {
        let backend = MemoryBackend::new();
        let sync = live_engine(&backend).await;
        let mut store = ShapeStore::new();
        let mut echo = EchoLedger::default();
        let shape = rect();
        store.insert(shape.clone());
        echo.mark_own(shape.id);

        assert_eq!(
            sync.apply(insert(&shape), &mut store, &mut echo),
            SyncOutcome::SuppressedEcho
        );
        assert!(echo.is_empty());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn own_insert_after_local_removal_stays_removed() {
        let backend = MemoryBackend::new();
        let sync = live_engine(&backend).await;
        let mut store = ShapeStore::new();
        let mut echo = EchoLedger::default();
        let shape = rect();
        // added, then deleted before either echo arrived
        echo.mark_own(shape.id);
        echo.mark_own(shape.id);

        assert_eq!(
            sync.apply(insert(&shape), &mut store, &mut echo),
            SyncOutcome::SuppressedEcho
        );
        assert_eq!(
            sync.apply(delete(&shape), &mut store, &mut echo),
            SyncOutcome::SuppressedEcho
        );
        assert!(!store.contains(shape.id));
        assert!(echo.is_empty());
    }

    #[tokio::test]
    async fn remote_update_overwrites_in_place() {
        let backend = MemoryBackend::new();
        let sync = live_engine(&backend).await;
        let mut store = ShapeStore::new();
        let mut echo = EchoLedger::default();
        let first = rect();
        let second = rect();
        store.insert(first.clone());
        store.insert(second.clone());

        let mut moved = first.clone();
        ShapePatch::position(5.0, 6.0).apply(&mut moved);
        let event = ChangeEvent {
            event_type: ChangeEventType::Update,
            new: Some(row_for(&moved, "canvas-1")),
            old: Some(row_for(&first, "canvas-1")),
        };

        assert_eq!(
            sync.apply(event, &mut store, &mut echo),
            SyncOutcome::Updated(moved.clone())
        );
        assert_eq!(store.ids(), vec![first.id, second.id]);
        assert_eq!(store.get(first.id), Some(&moved));
    }

    #[tokio::test]
    async fn update_for_unknown_shape_is_ignored() {
        let backend = MemoryBackend::new();
        let sync = live_engine(&backend).await;
        let mut store = ShapeStore::new();
        let mut echo = EchoLedger::default();
        let shape = rect();

        let event = ChangeEvent {
            event_type: ChangeEventType::Update,
            new: Some(row_for(&shape, "canvas-1")),
            old: None,
        };
        assert_eq!(
            sync.apply(event, &mut store, &mut echo),
            SyncOutcome::Ignored
        );
        assert!(store.is_empty());
        assert!(sync.errors.error().is_none());
    }

    #[tokio::test]
    async fn soft_delete_update_removes_or_is_discarded() {
        let backend = MemoryBackend::new();
        let sync = live_engine(&backend).await;
        let mut store = ShapeStore::new();
        let mut echo = EchoLedger::default();
        let shape = rect();
        store.insert(shape.clone());
        store.select(shape.id);

        let mut archived = row_for(&shape, "canvas-1");
        archived.deleted_at = Some(Utc::now());
        let event = ChangeEvent {
            event_type: ChangeEventType::Update,
            new: Some(archived),
            old: None,
        };

        assert_eq!(
            sync.apply(event.clone(), &mut store, &mut echo),
            SyncOutcome::Removed(shape.id)
        );
        assert_eq!(store.selected(), None);
        assert_eq!(
            sync.apply(event, &mut store, &mut echo),
            SyncOutcome::SuppressedEcho
        );
    }

    #[tokio::test]
    async fn delete_handles_echo_and_absence() {
        let backend = MemoryBackend::new();
        let sync = live_engine(&backend).await;
        let mut store = ShapeStore::new();
        let mut echo = EchoLedger::default();
        let shape = rect();

        echo.mark_own(shape.id);
        assert_eq!(
            sync.apply(delete(&shape), &mut store, &mut echo),
            SyncOutcome::SuppressedEcho
        );
        assert_eq!(
            sync.apply(delete(&shape), &mut store, &mut echo),
            SyncOutcome::Duplicate
        );

        store.insert(shape.clone());
        assert_eq!(
            sync.apply(delete(&shape), &mut store, &mut echo),
            SyncOutcome::Removed(shape.id)
        );
    }

    #[tokio::test]
    async fn other_sessions_and_stopped_engine_are_ignored() {
        let backend = MemoryBackend::new();
        let mut sync = live_engine(&backend).await;
        let mut store = ShapeStore::new();
        let mut echo = EchoLedger::default();
        let shape = rect();

        let foreign = ChangeEvent {
            event_type: ChangeEventType::Insert,
            new: Some(row_for(&shape, "canvas-2")),
            old: None,
        };
        assert_eq!(
            sync.apply(foreign, &mut store, &mut echo),
            SyncOutcome::Ignored
        );

        sync.stop();
        assert_eq!(sync.status(), ConnectionStatus::Disconnected);
        assert_eq!(
            sync.apply(insert(&shape), &mut store, &mut echo),
            SyncOutcome::Ignored
        );
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn malformed_row_is_rejected() {
        let backend = MemoryBackend::new();
        let sync = live_engine(&backend).await;
        let mut store = ShapeStore::new();
        let mut echo = EchoLedger::default();
        let mut row = row_for(&rect(), "canvas-1");
        row.kind = ObjectKind::Circle;

        let event = ChangeEvent {
            event_type: ChangeEventType::Insert,
            new: Some(row),
            old: None,
        };
        assert_eq!(
            sync.apply(event, &mut store, &mut echo),
            SyncOutcome::Rejected
        );
        assert!(sync.errors.error().unwrap().contains("decode"));
    }

    #[tokio::test]
    async fn remote_apply_holds_replay_flag() {
        let backend = MemoryBackend::new();
        let sync = live_engine(&backend).await;
        let flag = sync.replay.clone();
        let mut store = ShapeStore::new();
        let mut echo = EchoLedger::default();

        sync.apply(insert(&rect()), &mut store, &mut echo);
        assert!(!flag.is_active());
    }

    #[tokio::test]
    async fn feed_delivers_backend_writes() {
        use crate::backend::{NewObjectRow, ObjectStore};

        let backend = MemoryBackend::new();
        let mut sync = live_engine(&backend).await;
        let shape = rect();
        let (kind, data) = encode(&shape).unwrap();
        backend
            .insert(NewObjectRow {
                id: Some(shape.id.0),
                session_id: "canvas-1".into(),
                author_id: "bob".into(),
                kind,
                data,
            })
            .await
            .unwrap();

        let event = sync.next_event().await.unwrap();
        assert_eq!(event.event_type, ChangeEventType::Insert);
        assert_eq!(event.row_id(), Some(shape.id.0));
        assert!(sync.try_next().is_none());
    }
}
