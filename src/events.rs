//! Canvas change notifications for UI subscribers.
//!
//! The session, sync engine and undo/redo engine publish here explicitly;
//! nothing observes the store implicitly.

use tokio::sync::broadcast;
use tracing::trace;

use crate::shapes::{Shape, ShapeId};
use crate::sync::ConnectionStatus;

/// Default broadcast buffer; slow subscribers see `Lagged`
pub const EVENT_CAPACITY: usize = 256;

/// Where a change came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// User gesture in this session
    Local,
    /// Another client, via the change feed
    Remote,
    /// Undo or redo
    Replay,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CanvasEvent {
    ShapeAdded { shape: Shape, origin: Origin },
    ShapeUpdated { shape: Shape, origin: Origin },
    ShapeRemoved { id: ShapeId, origin: Origin },
    Cleared { origin: Origin },
    SelectionChanged(Option<ShapeId>),
    HistoryChanged { can_undo: bool, can_redo: bool },
    ConnectionChanged(ConnectionStatus),
    DragStarted(ShapeId),
    /// `recorded` is true when the gesture produced an undoable action
    DragEnded { id: ShapeId, recorded: bool },
}

/// Publisher half; clones share one broadcast channel
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<CanvasEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CanvasEvent> {
        self.tx.subscribe()
    }

    /// Publish to current subscribers. Having none is not an error.
    pub fn emit(&self, event: CanvasEvent) {
        trace!(?event, "canvas event");
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(EVENT_CAPACITY)
    }
}
