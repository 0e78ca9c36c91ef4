//! Undo/redo engine: replays inverse or forward operations from the history.
//!
//! Replays go through the shape store and persistence gateway like any local
//! edit, but with the replay flag held so nothing is re-recorded. Failure
//! policy:
//!
//! - Undo of Add that cannot reach the store goes back on the undo stack and
//!   reports failure. A target that is already gone counts as success.
//! - Undo of Update/Delete/DeleteMultiple that fails is dropped for good: it
//!   lands on neither stack, is removed from the action log, and the call
//!   still reports success.
//! - Redo that fails goes back on the redo stack and reports failure.

use tracing::{debug, info, warn};

use crate::echo::EchoLedger;
use crate::events::{CanvasEvent, EventSink, Origin};
use crate::history::{ActionHistory, ActionRecord, ActionType, Snapshot};
use crate::persistence::PersistenceGateway;
use crate::replay::ReplayBusy;
use crate::shapes::{Shape, ShapeId};
use crate::store::ShapeStore;

/// Session state a replay writes through
pub struct ReplayTarget<'a> {
    pub store: &'a mut ShapeStore,
    pub gateway: &'a PersistenceGateway,
    pub echo: &'a mut EchoLedger,
    pub events: &'a EventSink,
}

/// Result of dispatching one record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Applied,
    Failed,
}

/// Revert the most recent action.
///
/// `Ok(false)` when there is nothing to undo or an Add could not be reverted.
/// `Err(ReplayBusy)` when another replay holds the flag.
pub async fn undo(
    history: &mut ActionHistory,
    mut target: ReplayTarget<'_>,
) -> Result<bool, ReplayBusy> {
    let _guard = history.replay_flag().try_enter()?;

    let Some(mut record) = history.pop_undo() else {
        return Ok(false);
    };
    history.mark_undone(&mut record, true).await;
    debug!(action = ?record.action_type, object = %record.object_id, "undo");

    let step = match record.action_type {
        ActionType::Add => remove_all(&mut target, &record.after).await,
        ActionType::Update => match record.before.as_ref().and_then(Snapshot::single) {
            Some(before) => overwrite(&mut target, before).await,
            None => Step::Failed,
        },
        ActionType::Delete | ActionType::DeleteMultiple => {
            recreate_all(&mut target, &record.before).await
        }
    };

    let done = match (step, record.action_type) {
        (Step::Applied, _) => {
            history.push_redo(record);
            true
        }
        (Step::Failed, ActionType::Add) => {
            history.mark_undone(&mut record, false).await;
            history.push_undo(record);
            false
        }
        (Step::Failed, _) => {
            warn!(
                action = ?record.action_type,
                object = %record.object_id,
                "undo target unavailable, dropping action"
            );
            history.discard(&record).await;
            true
        }
    };

    emit_history(history, target.events);
    Ok(done)
}

/// Re-apply the most recently undone action.
///
/// `Ok(false)` when there is nothing to redo or the replay failed; in the
/// latter case the record stays on the redo stack.
pub async fn redo(
    history: &mut ActionHistory,
    mut target: ReplayTarget<'_>,
) -> Result<bool, ReplayBusy> {
    let _guard = history.replay_flag().try_enter()?;

    let Some(mut record) = history.pop_redo() else {
        return Ok(false);
    };
    history.mark_undone(&mut record, false).await;
    debug!(action = ?record.action_type, object = %record.object_id, "redo");

    let step = match record.action_type {
        ActionType::Add => recreate_all(&mut target, &record.after).await,
        ActionType::Update => match record.after.as_ref().and_then(Snapshot::single) {
            Some(after) => overwrite(&mut target, after).await,
            None => Step::Failed,
        },
        ActionType::Delete | ActionType::DeleteMultiple => {
            remove_ids(&mut target, &record_ids(&record)).await
        }
    };

    let done = match step {
        Step::Applied => {
            history.push_undo(record);
            true
        }
        Step::Failed => {
            info!(action = ?record.action_type, object = %record.object_id, "redo failed, keeping action");
            history.mark_undone(&mut record, true).await;
            history.push_redo(record);
            false
        }
    };

    emit_history(history, target.events);
    Ok(done)
}

fn emit_history(history: &ActionHistory, events: &EventSink) {
    events.emit(CanvasEvent::HistoryChanged {
        can_undo: history.can_undo(),
        can_redo: history.can_redo(),
    });
}

/// Ids a record touches, preferring snapshot ids over the joined string
fn record_ids(record: &ActionRecord) -> Vec<ShapeId> {
    match record.before.as_ref().or(record.after.as_ref()) {
        Some(snapshot) => snapshot.shapes().iter().map(|s| s.id).collect(),
        None => record.object_ids(),
    }
}

async fn remove_all(target: &mut ReplayTarget<'_>, snapshot: &Option<Snapshot>) -> Step {
    let ids: Vec<ShapeId> = snapshot
        .as_ref()
        .map(|s| s.shapes().iter().map(|shape| shape.id).collect())
        .unwrap_or_default();
    remove_ids(target, &ids).await
}

/// Delete shapes locally and in the store. Absent shapes count as removed.
async fn remove_ids(target: &mut ReplayTarget<'_>, ids: &[ShapeId]) -> Step {
    let mut step = Step::Applied;
    for &id in ids {
        let local = target.store.get(id).cloned();
        if local.is_some() {
            target.store.delete(id);
            target.echo.mark_own(id);
        }

        if target.gateway.remove(id).await {
            if local.is_some() {
                target.events.emit(CanvasEvent::ShapeRemoved {
                    id,
                    origin: Origin::Replay,
                });
            }
            continue;
        }

        if let Some(shape) = local {
            target.echo.forget(id);
            target.store.insert(shape);
        }
        step = Step::Failed;
    }
    step
}

async fn recreate_all(target: &mut ReplayTarget<'_>, snapshot: &Option<Snapshot>) -> Step {
    let Some(snapshot) = snapshot else {
        return Step::Failed;
    };
    let mut step = Step::Applied;
    for shape in snapshot.shapes() {
        if recreate(target, shape).await == Step::Failed {
            step = Step::Failed;
        }
    }
    step
}

/// Bring a shape back under its original id
async fn recreate(target: &mut ReplayTarget<'_>, shape: &Shape) -> Step {
    if target.store.contains(shape.id) {
        debug!(id = %shape.id, "shape already present, nothing to recreate");
        return Step::Applied;
    }

    target.store.insert(shape.clone());
    target.echo.mark_own(shape.id);
    if target.gateway.save(shape).await.is_none() {
        target.echo.forget(shape.id);
        target.store.delete(shape.id);
        return Step::Failed;
    }

    target.events.emit(CanvasEvent::ShapeAdded {
        shape: shape.clone(),
        origin: Origin::Replay,
    });
    Step::Applied
}

/// Replace a live shape with a full snapshot
async fn overwrite(target: &mut ReplayTarget<'_>, snapshot: &Shape) -> Step {
    let Some(current) = target.store.get(snapshot.id).cloned() else {
        return Step::Failed;
    };

    target.store.replace(snapshot.clone());
    if !target.gateway.persist_update(snapshot).await {
        target.store.replace(current);
        return Step::Failed;
    }

    target.events.emit(CanvasEvent::ShapeUpdated {
        shape: snapshot.clone(),
        origin: Origin::Replay,
    });
    Step::Applied
}
