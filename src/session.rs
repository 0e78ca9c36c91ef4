//! Collaboration session: one client's view of one shared canvas.
//!
//! Owns every per-session component and wires the mutation path:
//! store first, then persist, then record. Failed writes roll the optimistic
//! local change back. Several sessions can live in one process, each with
//! its own store, stacks, echo ledger and replay flag.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::{
    ActionLogStore, ChangeFeed, MemoryBackend, ObjectStore, PresenceChannel, PresencePayload,
};
use crate::clipboard::Clipboard;
use crate::config::SessionConfig;
use crate::drag::DragBatch;
use crate::echo::EchoLedger;
use crate::events::{CanvasEvent, EventSink, Origin};
use crate::history::ActionHistory;
use crate::persistence::{PersistenceGateway, decode};
use crate::presence::PresenceTracker;
use crate::replay::{ReplayBusy, ReplayFlag};
use crate::shapes::{Shape, ShapeDraft, ShapeId, ShapePatch};
use crate::status::StatusSlot;
use crate::store::ShapeStore;
use crate::sync::presence_protocol::{PresenceError, PresenceLink};
use crate::sync::{ConnectionStatus, RealtimeSync, SyncOutcome};
use crate::undo::{self, ReplayTarget};

/// Who this client is and which canvas it edits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Collaboration session (canvas) id
    pub session_id: String,
    /// Author / user id stamped on rows and actions
    pub author_id: String,
    pub display_name: String,
}

impl Identity {
    pub fn new(session_id: impl Into<String>, author_id: impl Into<String>) -> Self {
        let author_id = author_id.into();
        Self {
            session_id: session_id.into(),
            display_name: author_id.clone(),
            author_id,
        }
    }

    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }
}

/// External collaborators a session talks to
#[derive(Clone)]
pub struct Backends {
    pub objects: Arc<dyn ObjectStore>,
    pub actions: Arc<dyn ActionLogStore>,
    pub feed: Arc<dyn ChangeFeed>,
    pub presence: Arc<dyn PresenceChannel>,
}

impl Backends {
    /// Every collaborator backed by one in-memory backend
    pub fn memory(backend: &MemoryBackend) -> Self {
        Self {
            objects: Arc::new(backend.clone()),
            actions: Arc::new(backend.clone()),
            feed: Arc::new(backend.clone()),
            presence: Arc::new(backend.clone()),
        }
    }
}

pub struct CanvasSession {
    config: SessionConfig,
    identity: Identity,
    store: ShapeStore,
    gateway: PersistenceGateway,
    echo: EchoLedger,
    sync: RealtimeSync,
    history: ActionHistory,
    drag: DragBatch,
    clipboard: Clipboard,
    presence_channel: Arc<dyn PresenceChannel>,
    presence: Option<PresenceLink>,
    tracker: PresenceTracker,
    cursor: Option<(f64, f64)>,
    last_heartbeat: Option<Instant>,
    status: StatusSlot,
    events: EventSink,
}

impl std::fmt::Debug for CanvasSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CanvasSession")
            .field("identity", &self.identity)
            .field("shapes", &self.store.len())
            .field("history", &self.history)
            .field("sync", &self.sync)
            .finish()
    }
}

impl CanvasSession {
    pub fn new(config: SessionConfig, identity: Identity, backends: Backends) -> Self {
        let status = StatusSlot::new();
        let replay = ReplayFlag::new();

        let gateway = PersistenceGateway::new(
            backends.objects,
            identity.session_id.clone(),
            identity.author_id.clone(),
            status.clone(),
        );
        let sync = RealtimeSync::new(
            backends.feed,
            identity.session_id.clone(),
            status.clone(),
            replay.clone(),
        );
        let history = ActionHistory::new(
            backends.actions,
            identity.author_id.clone(),
            identity.session_id.clone(),
            config.history_limit,
            replay,
            status.clone(),
        );

        Self {
            echo: EchoLedger::new(config.echo_window()),
            clipboard: Clipboard::new(config.paste_offset),
            tracker: PresenceTracker::new(
                identity.author_id.clone(),
                config.presence.stale_after(),
            ),
            store: ShapeStore::new(),
            drag: DragBatch::new(),
            presence_channel: backends.presence,
            presence: None,
            cursor: None,
            last_heartbeat: None,
            events: EventSink::default(),
            gateway,
            sync,
            history,
            status,
            config,
            identity,
        }
    }

    // --- Lifecycle ---

    /// Replace the store with the session's persisted shapes and rebuild
    /// history from the action log. Returns the number of shapes loaded.
    pub async fn load(&mut self) -> usize {
        let rows = self.gateway.load().await;
        self.store.clear();
        for row in &rows {
            match decode(row) {
                Ok(shape) => {
                    self.store.insert(shape);
                }
                Err(e) => {
                    warn!(id = %row.id, error = %e, "skipping unreadable row");
                    self.status.set_error(format!("Failed to load shape: {}", e));
                }
            }
        }
        self.history.hydrate().await;

        info!(
            session = %self.identity.session_id,
            shapes = self.store.len(),
            undo = self.history.undo_count(),
            "canvas loaded"
        );
        self.events.emit(CanvasEvent::Cleared {
            origin: Origin::Remote,
        });
        for shape in self.store.iter() {
            self.events.emit(CanvasEvent::ShapeAdded {
                shape: shape.clone(),
                origin: Origin::Remote,
            });
        }
        self.emit_history();
        self.store.len()
    }

    /// Subscribe to remote changes
    pub async fn connect(&mut self) -> bool {
        let ok = self.sync.start().await;
        self.events
            .emit(CanvasEvent::ConnectionChanged(self.sync.status()));
        ok
    }

    /// Unsubscribe; events still queued are dropped
    pub fn disconnect(&mut self) {
        self.sync.stop();
        self.events
            .emit(CanvasEvent::ConnectionChanged(ConnectionStatus::Disconnected));
    }

    /// Pick up a channel status change and publish it
    pub fn poll_connection(&mut self) -> Option<ConnectionStatus> {
        let status = self.sync.poll_status()?;
        self.events.emit(CanvasEvent::ConnectionChanged(status));
        Some(status)
    }

    // --- Remote changes ---

    /// Apply every queued remote event. Returns how many were processed.
    pub fn process_remote(&mut self) -> usize {
        self.poll_connection();
        let mut processed = 0;
        while let Some(event) = self.sync.try_next() {
            self.handle_remote(event);
            processed += 1;
        }
        processed
    }

    /// Wait for one remote event and apply it
    pub async fn next_remote(&mut self) -> Option<SyncOutcome> {
        let event = self.sync.next_event().await?;
        Some(self.handle_remote(event))
    }

    fn handle_remote(&mut self, event: crate::backend::ChangeEvent) -> SyncOutcome {
        let selected = self.store.selected();
        let outcome = self.sync.apply(event, &mut self.store, &mut self.echo);

        match &outcome {
            SyncOutcome::Inserted(shape) => self.events.emit(CanvasEvent::ShapeAdded {
                shape: shape.clone(),
                origin: Origin::Remote,
            }),
            SyncOutcome::Updated(shape) => self.events.emit(CanvasEvent::ShapeUpdated {
                shape: shape.clone(),
                origin: Origin::Remote,
            }),
            SyncOutcome::Removed(id) => {
                self.drag.cancel(*id);
                self.events.emit(CanvasEvent::ShapeRemoved {
                    id: *id,
                    origin: Origin::Remote,
                });
            }
            _ => {}
        }
        self.emit_selection_if_changed(selected);
        outcome
    }

    // --- Local mutations ---

    /// Create a shape, persist it and record an Add. `None` if the store
    /// rejected the write; the local add is rolled back.
    pub async fn add_shape(&mut self, draft: ShapeDraft) -> Option<Shape> {
        let mut shape = self.store.add(draft);
        self.echo.mark_own(shape.id);

        let Some(row) = self.gateway.save(&shape).await else {
            self.echo.forget(shape.id);
            self.store.delete(shape.id);
            return None;
        };

        let stored_id = ShapeId(row.id);
        if stored_id != shape.id {
            debug!(local = %shape.id, stored = %stored_id, "store assigned a new id");
            self.echo.forget(shape.id);
            self.echo.mark_own(stored_id);
            self.store.rekey(shape.id, stored_id);
            shape.id = stored_id;
        }

        self.events.emit(CanvasEvent::ShapeAdded {
            shape: shape.clone(),
            origin: Origin::Local,
        });
        if self.history.record_add(&shape).await {
            self.emit_history();
        }
        Some(shape)
    }

    /// Merge `patch` into a shape and persist the full result.
    ///
    /// Returns false for an unknown id, a patch that does not fit the
    /// shape's kind, or a failed write (rolled back). Position-only patches
    /// on a shape being dragged are not recorded.
    pub async fn update_shape(&mut self, id: ShapeId, patch: ShapePatch) -> bool {
        let Some(before) = self.store.get(id).cloned() else {
            self.status.set_error(format!("Shape {} not found", id));
            return false;
        };
        if !self.store.update(id, &patch) {
            self.status.set_error(format!(
                "Update does not apply to {} {}",
                before.tag().name(),
                id
            ));
            return false;
        }
        let Some(after) = self.store.get(id).cloned() else {
            return false;
        };
        if after == before {
            return true;
        }

        if !self.gateway.persist_update(&after).await {
            self.store.replace(before);
            return false;
        }

        self.events.emit(CanvasEvent::ShapeUpdated {
            shape: after.clone(),
            origin: Origin::Local,
        });
        if self.drag.is_dragging(id) && patch.is_position_only() {
            return true;
        }
        if self.history.record_update(&before, &after).await {
            self.emit_history();
        }
        true
    }

    /// Delete a shape and record it. False for an unknown id or a failed
    /// write (the shape is put back).
    pub async fn delete_shape(&mut self, id: ShapeId) -> bool {
        let Some(shape) = self.store.get(id).cloned() else {
            self.status.set_error(format!("Shape {} not found", id));
            return false;
        };
        let selected = self.store.selected();

        self.store.delete(id);
        self.echo.mark_own(id);
        if !self.gateway.remove(id).await {
            self.echo.forget(id);
            self.store.insert(shape);
            if selected == Some(id) {
                self.store.select(id);
            }
            return false;
        }

        self.drag.cancel(id);
        self.events.emit(CanvasEvent::ShapeRemoved {
            id,
            origin: Origin::Local,
        });
        self.emit_selection_if_changed(selected);
        if self.history.record_delete(&shape).await {
            self.emit_history();
        }
        true
    }

    /// Remove every shape as one undoable DeleteMultiple
    pub async fn clear(&mut self) -> bool {
        let shapes: Vec<Shape> = self.store.iter().cloned().collect();
        if shapes.is_empty() {
            return true;
        }
        let selected = self.store.selected();

        self.store.clear();
        for shape in &shapes {
            self.echo.mark_own(shape.id);
        }
        if !self.gateway.remove_all().await {
            for shape in &shapes {
                self.echo.forget(shape.id);
                self.store.insert(shape.clone());
            }
            if let Some(id) = selected {
                self.store.select(id);
            }
            return false;
        }

        for shape in &shapes {
            self.drag.cancel(shape.id);
        }
        self.events.emit(CanvasEvent::Cleared {
            origin: Origin::Local,
        });
        self.emit_selection_if_changed(selected);
        if self.history.record_delete_many(shapes).await {
            self.emit_history();
        }
        true
    }

    // --- Drag ---

    pub fn start_drag(&mut self, id: ShapeId) -> bool {
        let Some(shape) = self.store.get(id) else {
            return false;
        };
        self.drag.start_drag(shape);
        self.events.emit(CanvasEvent::DragStarted(id));
        true
    }

    /// One drag frame: move, persist, do not record
    pub async fn drag_to(&mut self, id: ShapeId, x: f64, y: f64) -> bool {
        self.update_shape(id, ShapePatch::position(x, y)).await
    }

    /// Finish the gesture. Returns true when one Update was recorded.
    pub async fn end_drag(&mut self, id: ShapeId) -> bool {
        let Some(current) = self.store.get(id).cloned() else {
            self.drag.cancel(id);
            return false;
        };
        let recorded = match self.drag.end_drag(&current) {
            Some((before, after)) => self.history.record_update(&before, &after).await,
            None => false,
        };
        self.events.emit(CanvasEvent::DragEnded { id, recorded });
        if recorded {
            self.emit_history();
        }
        recorded
    }

    pub fn is_dragging(&self, id: ShapeId) -> bool {
        self.drag.is_dragging(id)
    }

    // --- Undo / redo ---

    pub async fn undo(&mut self) -> Result<bool, ReplayBusy> {
        let selected = self.store.selected();
        let target = ReplayTarget {
            store: &mut self.store,
            gateway: &self.gateway,
            echo: &mut self.echo,
            events: &self.events,
        };
        let result = undo::undo(&mut self.history, target).await;
        self.emit_selection_if_changed(selected);
        result
    }

    pub async fn redo(&mut self) -> Result<bool, ReplayBusy> {
        let selected = self.store.selected();
        let target = ReplayTarget {
            store: &mut self.store,
            gateway: &self.gateway,
            echo: &mut self.echo,
            events: &self.events,
        };
        let result = undo::redo(&mut self.history, target).await;
        self.emit_selection_if_changed(selected);
        result
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    // --- Clipboard ---

    /// Copy the given shapes; unknown ids are skipped
    pub fn copy(&mut self, ids: &[ShapeId]) -> usize {
        let shapes: Vec<&Shape> = ids.iter().filter_map(|id| self.store.get(*id)).collect();
        self.clipboard.copy(shapes)
    }

    pub fn copy_selected(&mut self) -> usize {
        match self.store.selected() {
            Some(id) => self.copy(&[id]),
            None => 0,
        }
    }

    /// Add offset copies of the clipboard, each as its own Add
    pub async fn paste(&mut self) -> Vec<Shape> {
        let mut pasted = Vec::new();
        for draft in self.clipboard.paste_drafts() {
            if let Some(shape) = self.add_shape(draft).await {
                pasted.push(shape);
            }
        }
        pasted
    }

    // --- Selection ---

    pub fn select(&mut self, id: ShapeId) -> bool {
        let previous = self.store.selected();
        let ok = self.store.select(id);
        self.emit_selection_if_changed(previous);
        ok
    }

    pub fn deselect(&mut self) {
        let previous = self.store.selected();
        self.store.deselect();
        self.emit_selection_if_changed(previous);
    }

    // --- Presence ---

    /// Join the presence topic with the configured backoff
    pub async fn join_presence(&mut self) -> Result<(), PresenceError> {
        if self.presence.is_some() {
            return Ok(());
        }
        let link = PresenceLink::connect(
            self.presence_channel.clone(),
            &self.identity.session_id,
            &self.identity.author_id,
            &self.config.presence.backoff(),
        )
        .await
        .inspect_err(|e| self.status.set_error(e.to_string()))?;
        self.presence = Some(link);
        self.heartbeat().await;
        Ok(())
    }

    /// Broadcast a new cursor position
    pub async fn move_cursor(&mut self, x: f64, y: f64) -> bool {
        self.cursor = Some((x, y));
        self.heartbeat().await
    }

    /// Re-broadcast our presence so others do not prune us
    pub async fn heartbeat(&mut self) -> bool {
        let Some(link) = &self.presence else {
            return false;
        };
        let payload = PresencePayload {
            display_name: self.identity.display_name.clone(),
            cursor: self.cursor,
            online: true,
        };
        match link.track(payload).await {
            Ok(()) => {
                self.last_heartbeat = Some(Instant::now());
                true
            }
            Err(e) => {
                warn!(error = %e, "failed to track presence");
                self.status.set_error(format!("Failed to track presence: {}", e));
                false
            }
        }
    }

    /// Re-send our presence once the configured heartbeat interval has
    /// passed. Drive this from the client's timer loop; returns whether a
    /// heartbeat went out.
    pub async fn tick(&mut self) -> bool {
        if self.presence.is_none() {
            return false;
        }
        let interval = self.config.presence.heartbeat();
        if self
            .last_heartbeat
            .is_some_and(|at| at.elapsed() < interval)
        {
            return false;
        }
        self.heartbeat().await
    }

    /// Fold queued presence events and prune stale participants
    pub fn poll_presence(&mut self) -> usize {
        let mut processed = 0;
        if let Some(link) = self.presence.as_mut() {
            while let Some(event) = link.try_next() {
                self.tracker.apply(&event);
                processed += 1;
            }
        }
        self.tracker.prune_stale();
        processed
    }

    pub async fn leave_presence(&mut self) {
        let Some(link) = self.presence.take() else {
            return;
        };
        self.last_heartbeat = None;
        if let Err(e) = link.leave().await {
            warn!(error = %e, "failed to leave presence");
        }
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.tracker
    }

    // --- Accessors ---

    pub fn store(&self) -> &ShapeStore {
        &self.store
    }

    pub fn shape(&self, id: ShapeId) -> Option<&Shape> {
        self.store.get(id)
    }

    pub fn history(&self) -> &ActionHistory {
        &self.history
    }

    pub fn status(&self) -> &StatusSlot {
        &self.status
    }

    pub fn connection(&self) -> ConnectionStatus {
        self.sync.status()
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn clipboard(&self) -> &Clipboard {
        &self.clipboard
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CanvasEvent> {
        self.events.subscribe()
    }

    fn emit_history(&self) {
        self.events.emit(CanvasEvent::HistoryChanged {
            can_undo: self.history.can_undo(),
            can_redo: self.history.can_redo(),
        });
    }

    fn emit_selection_if_changed(&self, previous: Option<ShapeId>) {
        let current = self.store.selected();
        if current != previous {
            self.events.emit(CanvasEvent::SelectionChanged(current));
        }
    }
}
