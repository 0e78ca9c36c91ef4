//! Action history ledger: reversible action records and bounded undo/redo stacks.
//!
//! Records are persisted to the action log before they reach the in-memory
//! undo stack. A record that could not be persisted is never pushed, so every
//! stack entry has a durable counterpart whose `undone_at` marker can be
//! mirrored by undo/redo.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};
use uuid::Uuid;

pub use crate::backend::{ActionType, ObjectType};
use crate::backend::{ActionLogStore, ActionRow, NewActionRow};
use crate::replay::ReplayFlag;
use crate::shapes::{KindTag, Shape, ShapeId};
use crate::status::StatusSlot;

/// Default cap on each stack
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

impl From<KindTag> for ObjectType {
    fn from(tag: KindTag) -> Self {
        match tag {
            KindTag::Rectangle => ObjectType::Rectangle,
            KindTag::Circle => ObjectType::Circle,
            KindTag::Text => ObjectType::Text,
            KindTag::Emoji => ObjectType::Emoji,
        }
    }
}

/// State captured on one side of an action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Snapshot {
    One(Shape),
    Many(Vec<Shape>),
}

impl Snapshot {
    pub fn shapes(&self) -> &[Shape] {
        match self {
            Snapshot::One(shape) => std::slice::from_ref(shape),
            Snapshot::Many(shapes) => shapes,
        }
    }

    /// The single shape, if this snapshot holds exactly one
    pub fn single(&self) -> Option<&Shape> {
        match self {
            Snapshot::One(shape) => Some(shape),
            Snapshot::Many(_) => None,
        }
    }
}

/// One undoable unit of work
#[derive(Debug, Clone, PartialEq)]
pub struct ActionRecord {
    /// Id of the durable log row
    pub id: Uuid,
    pub action_type: ActionType,
    pub object_type: ObjectType,
    /// Shape id, or comma-joined ids for bulk actions
    pub object_id: String,
    pub before: Option<Snapshot>,
    pub after: Option<Snapshot>,
    pub timestamp: DateTime<Utc>,
    pub undone_at: Option<DateTime<Utc>>,
}

impl ActionRecord {
    fn from_row(row: &ActionRow) -> Result<Self> {
        let before = row
            .before_state
            .clone()
            .map(serde_json::from_value)
            .transpose()
            .with_context(|| format!("Malformed before_state on action {}", row.id))?;
        let after = row
            .after_state
            .clone()
            .map(serde_json::from_value)
            .transpose()
            .with_context(|| format!("Malformed after_state on action {}", row.id))?;

        Ok(Self {
            id: row.id,
            action_type: row.action_type,
            object_type: row.object_type,
            object_id: row.object_id.clone(),
            before,
            after,
            timestamp: row.timestamp,
            undone_at: row.undone_at,
        })
    }

    /// Parsed ids from `object_id`; malformed entries are dropped
    pub fn object_ids(&self) -> Vec<ShapeId> {
        self.object_id
            .split(',')
            .filter_map(ShapeId::parse)
            .collect()
    }
}

/// Whether the before/after pair is well-formed for the action type
fn states_match(action: ActionType, before: &Option<Snapshot>, after: &Option<Snapshot>) -> bool {
    match action {
        ActionType::Add => before.is_none() && after.is_some(),
        ActionType::Update => before.is_some() && after.is_some(),
        ActionType::Delete | ActionType::DeleteMultiple => before.is_some() && after.is_none(),
    }
}

/// Undo/redo stacks backed by a durable action log
pub struct ActionHistory {
    log: Arc<dyn ActionLogStore>,
    user_id: String,
    canvas_id: String,
    /// Oldest at the front, most recent at the back
    undo_stack: VecDeque<ActionRecord>,
    redo_stack: VecDeque<ActionRecord>,
    limit: usize,
    replay: ReplayFlag,
    status: StatusSlot,
}

impl std::fmt::Debug for ActionHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionHistory")
            .field("undo", &self.undo_stack.len())
            .field("redo", &self.redo_stack.len())
            .field("limit", &self.limit)
            .finish()
    }
}

impl ActionHistory {
    pub fn new(
        log: Arc<dyn ActionLogStore>,
        user_id: impl Into<String>,
        canvas_id: impl Into<String>,
        limit: usize,
        replay: ReplayFlag,
        status: StatusSlot,
    ) -> Self {
        Self {
            log,
            user_id: user_id.into(),
            canvas_id: canvas_id.into(),
            undo_stack: VecDeque::new(),
            redo_stack: VecDeque::new(),
            limit: limit.max(1),
            replay,
            status,
        }
    }

    /// Record a completed mutation.
    ///
    /// Returns false when a replay is in progress, when the states do not
    /// fit the action type, or when the action log rejects the write. In the
    /// last case the stacks are left untouched.
    pub async fn record(
        &mut self,
        action_type: ActionType,
        object_type: ObjectType,
        object_id: String,
        before: Option<Snapshot>,
        after: Option<Snapshot>,
    ) -> bool {
        if self.replay.is_active() {
            trace!(action = ?action_type, object = %object_id, "replay in progress, not recording");
            return false;
        }
        if !states_match(action_type, &before, &after) {
            warn!(action = ?action_type, object = %object_id, "action states do not match type");
            self.status
                .set_error(format!("Invalid {:?} action for {}", action_type, object_id));
            return false;
        }

        let timestamp = Utc::now();
        let persisted = async {
            let before_state = before.as_ref().map(serde_json::to_value).transpose()?;
            let after_state = after.as_ref().map(serde_json::to_value).transpose()?;
            self.log
                .insert_action(NewActionRow {
                    user_id: self.user_id.clone(),
                    canvas_id: self.canvas_id.clone(),
                    action_type,
                    object_type,
                    object_id: object_id.clone(),
                    before_state,
                    after_state,
                    timestamp,
                })
                .await
        }
        .await;

        let row = match persisted {
            Ok(row) => row,
            Err(e) => {
                warn!(action = ?action_type, object = %object_id, error = %e, "failed to record action");
                self.status.set_error(format!("Failed to record action: {}", e));
                return false;
            }
        };

        debug!(action = ?action_type, object = %object_id, "action recorded");
        self.push_undo(ActionRecord {
            id: row.id,
            action_type,
            object_type,
            object_id,
            before,
            after,
            timestamp: row.timestamp,
            undone_at: None,
        });
        self.redo_stack.clear();
        true
    }

    pub async fn record_add(&mut self, shape: &Shape) -> bool {
        self.record(
            ActionType::Add,
            shape.tag().into(),
            shape.id.to_string(),
            None,
            Some(Snapshot::One(shape.clone())),
        )
        .await
    }

    pub async fn record_update(&mut self, before: &Shape, after: &Shape) -> bool {
        self.record(
            ActionType::Update,
            after.tag().into(),
            after.id.to_string(),
            Some(Snapshot::One(before.clone())),
            Some(Snapshot::One(after.clone())),
        )
        .await
    }

    pub async fn record_delete(&mut self, shape: &Shape) -> bool {
        self.record(
            ActionType::Delete,
            shape.tag().into(),
            shape.id.to_string(),
            Some(Snapshot::One(shape.clone())),
            None,
        )
        .await
    }

    pub async fn record_delete_many(&mut self, shapes: Vec<Shape>) -> bool {
        let object_id = shapes
            .iter()
            .map(|s| s.id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        self.record(
            ActionType::DeleteMultiple,
            ObjectType::Mixed,
            object_id,
            Some(Snapshot::Many(shapes)),
            None,
        )
        .await
    }

    /// Rebuild both stacks from the durable log.
    ///
    /// Rows without `undone_at` go to the undo stack. Undone rows go to the
    /// redo stack unless a later action superseded them.
    pub async fn hydrate(&mut self) -> usize {
        let rows = match self
            .log
            .load_actions(&self.user_id, &self.canvas_id, self.limit.saturating_mul(2))
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!(canvas = %self.canvas_id, error = %e, "failed to load action history");
                self.status.set_error(format!("Failed to load history: {}", e));
                return 0;
            }
        };

        let records: Vec<ActionRecord> = rows
            .iter()
            .filter_map(|row| match ActionRecord::from_row(row) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(action = %row.id, error = %e, "skipping unreadable action");
                    None
                }
            })
            .collect();

        let newest_active = records
            .iter()
            .filter(|r| r.undone_at.is_none())
            .map(|r| r.timestamp)
            .max();

        let (active, mut undone): (Vec<_>, Vec<_>) =
            records.into_iter().partition(|r| r.undone_at.is_none());
        undone.retain(|r| newest_active.is_none_or(|t| r.timestamp >= t));
        undone.sort_by_key(|r| r.undone_at);

        self.undo_stack.clear();
        self.redo_stack.clear();
        for record in active {
            self.push_undo(record);
        }
        for record in undone {
            self.push_redo(record);
        }
        self.undo_stack.len() + self.redo_stack.len()
    }

    /// Mirror the undone state of a record to the action log. Failures are
    /// logged but do not block the replay.
    pub(crate) async fn mark_undone(&self, record: &mut ActionRecord, undone: bool) {
        let at = undone.then(Utc::now);
        match self.log.set_undone(record.id, at).await {
            Ok(()) => record.undone_at = at,
            Err(e) => {
                warn!(action = %record.id, error = %e, "failed to mirror undo marker");
                self.status.set_error(format!("Failed to update history: {}", e));
            }
        }
    }

    /// Remove a record that was skipped during replay from the action log,
    /// so a reloaded session does not offer it again.
    pub(crate) async fn discard(&self, record: &ActionRecord) {
        if let Err(e) = self.log.delete_action(record.id).await {
            warn!(action = %record.id, error = %e, "failed to discard skipped action");
            self.status.set_error(format!("Failed to update history: {}", e));
        }
    }

    pub(crate) fn pop_undo(&mut self) -> Option<ActionRecord> {
        self.undo_stack.pop_back()
    }

    pub(crate) fn pop_redo(&mut self) -> Option<ActionRecord> {
        self.redo_stack.pop_back()
    }

    /// Push onto the undo stack, evicting the oldest entry past the cap
    pub(crate) fn push_undo(&mut self, record: ActionRecord) {
        self.undo_stack.push_back(record);
        while self.undo_stack.len() > self.limit {
            self.undo_stack.pop_front();
        }
    }

    pub(crate) fn push_redo(&mut self, record: ActionRecord) {
        self.redo_stack.push_back(record);
        while self.redo_stack.len() > self.limit {
            self.redo_stack.pop_front();
        }
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo_count(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_count(&self) -> usize {
        self.redo_stack.len()
    }

    /// Undo stack, most recent first
    pub fn undo_stack(&self) -> impl Iterator<Item = &ActionRecord> {
        self.undo_stack.iter().rev()
    }

    /// Redo stack, most recent first
    pub fn redo_stack(&self) -> impl Iterator<Item = &ActionRecord> {
        self.redo_stack.iter().rev()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn replay_flag(&self) -> &ReplayFlag {
        &self.replay
    }

    /// Drop all in-memory history
    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::shapes::ShapeDraft;
    use proptest::prelude::*;

    fn history(backend: &MemoryBackend, limit: usize) -> ActionHistory {
        ActionHistory::new(
            Arc::new(backend.clone()),
            "alice",
            "canvas-1",
            limit,
            ReplayFlag::new(),
            StatusSlot::new(),
        )
    }

    fn rect() -> Shape {
        ShapeDraft::rectangle(0.0, 0.0, 10.0, 10.0).build(ShapeId::new())
    }

    #[tokio::test]
    async fn record_persists_then_pushes() {
        let backend = MemoryBackend::new();
        let mut history = history(&backend, 50);
        let shape = rect();

        assert!(history.record_add(&shape).await);
        assert_eq!(history.undo_count(), 1);

        let rows = backend.actions();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].action_type, ActionType::Add);
        assert!(rows[0].before_state.is_none());
        assert_eq!(rows[0].object_id, shape.id.to_string());
        assert_eq!(history.undo_stack().next().unwrap().id, rows[0].id);
    }

    #[tokio::test]
    async fn replay_flag_blocks_recording() {
        let backend = MemoryBackend::new();
        let mut history = history(&backend, 50);
        let _guard = history.replay_flag().clone().try_enter().unwrap();

        assert!(!history.record_add(&rect()).await);
        assert_eq!(history.undo_count(), 0);
        assert!(backend.actions().is_empty());
    }

    #[tokio::test]
    async fn persistence_failure_leaves_stacks_unchanged() {
        let backend = MemoryBackend::new();
        let mut history = history(&backend, 50);
        assert!(history.record_add(&rect()).await);

        backend.set_action_log_failing(true);
        assert!(!history.record_add(&rect()).await);
        assert_eq!(history.undo_count(), 1);
        assert!(history.status.error().unwrap().contains("record action"));
    }

    #[tokio::test]
    async fn mismatched_states_are_rejected() {
        let backend = MemoryBackend::new();
        let mut history = history(&backend, 50);
        let shape = rect();

        let ok = history
            .record(
                ActionType::Delete,
                ObjectType::Rectangle,
                shape.id.to_string(),
                None,
                Some(Snapshot::One(shape)),
            )
            .await;
        assert!(!ok);
        assert!(backend.actions().is_empty());
    }

    #[tokio::test]
    async fn new_record_clears_redo() {
        let backend = MemoryBackend::new();
        let mut history = history(&backend, 50);
        history.record_add(&rect()).await;
        let popped = history.pop_undo().unwrap();
        history.push_redo(popped);
        assert!(history.can_redo());

        history.record_add(&rect()).await;
        assert!(!history.can_redo());
    }

    #[tokio::test]
    async fn sixty_records_keep_the_newest_fifty() {
        let backend = MemoryBackend::new();
        let mut history = history(&backend, 50);
        let shapes: Vec<Shape> = (0..60).map(|_| rect()).collect();
        for shape in &shapes {
            assert!(history.record_add(shape).await);
        }

        assert_eq!(history.undo_count(), 50);
        let oldest_kept = history.undo_stack().last().unwrap();
        assert_eq!(oldest_kept.object_id, shapes[10].id.to_string());
        let newest = history.undo_stack().next().unwrap();
        assert_eq!(newest.object_id, shapes[59].id.to_string());
    }

    #[tokio::test]
    async fn bulk_delete_joins_ids() {
        let backend = MemoryBackend::new();
        let mut history = history(&backend, 50);
        let shapes = vec![rect(), rect()];

        assert!(history.record_delete_many(shapes.clone()).await);
        let record = history.undo_stack().next().unwrap();
        assert_eq!(record.object_type, ObjectType::Mixed);
        assert_eq!(record.object_ids(), vec![shapes[0].id, shapes[1].id]);
        assert_eq!(record.before.as_ref().unwrap().shapes().len(), 2);
    }

    #[tokio::test]
    async fn hydrate_restores_stacks_from_log() {
        let backend = MemoryBackend::new();
        let mut first = history(&backend, 50);
        let a = rect();
        let b = rect();
        first.record_add(&a).await;
        first.record_add(&b).await;
        let mut top = first.pop_undo().unwrap();
        first.mark_undone(&mut top, true).await;

        let mut reloaded = history(&backend, 50);
        assert_eq!(reloaded.hydrate().await, 2);
        assert_eq!(reloaded.undo_count(), 1);
        assert_eq!(reloaded.redo_count(), 1);
        assert_eq!(
            reloaded.redo_stack().next().unwrap().object_id,
            b.id.to_string()
        );
        assert_eq!(
            reloaded.undo_stack().next().unwrap().after,
            Some(Snapshot::One(a))
        );
    }

    #[tokio::test]
    async fn hydrate_with_unbounded_limit() {
        let backend = MemoryBackend::new();
        let mut first = history(&backend, usize::MAX);
        first.record_add(&rect()).await;

        let mut reloaded = history(&backend, usize::MAX);
        assert_eq!(reloaded.hydrate().await, 1);
        assert_eq!(reloaded.undo_count(), 1);
    }

    #[tokio::test]
    async fn discarded_action_stays_out_of_reload() {
        let backend = MemoryBackend::new();
        let mut first = history(&backend, 50);
        first.record_add(&rect()).await;
        first.record_add(&rect()).await;
        let mut top = first.pop_undo().unwrap();
        first.mark_undone(&mut top, true).await;
        first.discard(&top).await;

        let mut reloaded = history(&backend, 50);
        assert_eq!(reloaded.hydrate().await, 1);
        assert!(!reloaded.can_redo());
    }

    proptest! {
        #[test]
        fn undo_stack_never_exceeds_limit(limit in 1usize..20, count in 0usize..40) {
            let backend = MemoryBackend::new();
            let mut history = history(&backend, limit);
            tokio_test::block_on(async {
                for _ in 0..count {
                    history.record_add(&rect()).await;
                }
            });
            prop_assert_eq!(history.undo_count(), count.min(limit));
            prop_assert_eq!(backend.actions().len(), count);
        }
    }
}
