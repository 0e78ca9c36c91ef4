//! Drag batching: one undoable action per drag gesture.
//!
//! Intermediate moves go to the store and backend as usual; the session skips
//! recording them while a drag is active. `end_drag` hands back the start
//! and final snapshots so exactly one Update can be recorded.

use std::collections::HashMap;

use tracing::trace;

use crate::shapes::{Shape, ShapeId};

/// Start-of-drag snapshots keyed by shape id
#[derive(Debug, Default)]
pub struct DragBatch {
    started: HashMap<ShapeId, Shape>,
}

impl DragBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture the shape's state at drag start. A second start for the same
    /// shape keeps the original snapshot.
    pub fn start_drag(&mut self, shape: &Shape) {
        self.started.entry(shape.id).or_insert_with(|| {
            trace!(id = %shape.id, x = shape.x, y = shape.y, "drag started");
            shape.clone()
        });
    }

    pub fn is_dragging(&self, id: ShapeId) -> bool {
        self.started.contains_key(&id)
    }

    pub fn any_dragging(&self) -> bool {
        !self.started.is_empty()
    }

    /// Close the gesture. Returns `(before, after)` when the shape changed;
    /// `None` when no drag was open or nothing moved.
    pub fn end_drag(&mut self, current: &Shape) -> Option<(Shape, Shape)> {
        let before = self.started.remove(&current.id)?;
        if before == *current {
            trace!(id = %current.id, "drag ended without change");
            return None;
        }
        Some((before, current.clone()))
    }

    /// Drop a pending drag without producing an action
    pub fn cancel(&mut self, id: ShapeId) -> Option<Shape> {
        self.started.remove(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shapes::ShapeDraft;

    #[test]
    fn end_returns_start_and_final_state() {
        let mut batch = DragBatch::new();
        let start = ShapeDraft::rectangle(10.0, 10.0, 5.0, 5.0).build(ShapeId::new());
        batch.start_drag(&start);
        assert!(batch.is_dragging(start.id));

        let mut end = start.clone();
        end.x = 40.0;
        end.y = 25.0;

        let (before, after) = batch.end_drag(&end).unwrap();
        assert_eq!((before.x, before.y), (10.0, 10.0));
        assert_eq!((after.x, after.y), (40.0, 25.0));
        assert!(!batch.is_dragging(start.id));
    }

    #[test]
    fn unchanged_drag_yields_nothing() {
        let mut batch = DragBatch::new();
        let shape = ShapeDraft::circle(0.0, 0.0, 1.0).build(ShapeId::new());
        batch.start_drag(&shape);
        assert!(batch.end_drag(&shape).is_none());
        assert!(!batch.any_dragging());
    }

    #[test]
    fn end_without_start_yields_nothing() {
        let mut batch = DragBatch::new();
        let shape = ShapeDraft::circle(0.0, 0.0, 1.0).build(ShapeId::new());
        assert!(batch.end_drag(&shape).is_none());
    }

    #[test]
    fn restart_keeps_first_snapshot() {
        let mut batch = DragBatch::new();
        let mut shape = ShapeDraft::circle(0.0, 0.0, 1.0).build(ShapeId::new());
        batch.start_drag(&shape);
        shape.x = 5.0;
        batch.start_drag(&shape);
        shape.x = 9.0;

        let (before, _) = batch.end_drag(&shape).unwrap();
        assert_eq!(before.x, 0.0);
    }
}
