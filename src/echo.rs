//! Echo suppression ledger
//!
//! The change feed delivers our own writes back to us. Before a write, the id
//! is marked here; when the matching notification arrives, the sync engine
//! consumes the mark and drops the event. Marks expire after a fixed window so
//! an echo that never arrives does not pin memory. Each write adds one mark,
//! so several quick writes to the same id (undo then redo) each swallow
//! exactly one echo; a delivery beyond that is treated as foreign.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use crate::shapes::ShapeId;

/// Default lifetime of an echo mark
pub const DEFAULT_ECHO_WINDOW: Duration = Duration::from_millis(5000);

#[derive(Debug, Clone, Copy)]
struct Mark {
    pending: usize,
    deadline: Instant,
}

/// Recently written ids with per-entry expiry
#[derive(Debug)]
pub struct EchoLedger {
    window: Duration,
    entries: HashMap<ShapeId, Mark>,
}

impl EchoLedger {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: HashMap::new(),
        }
    }

    /// Remember one write to `id`; refreshes the deadline
    pub fn mark_own(&mut self, id: ShapeId) {
        self.evict_expired();
        let deadline = Instant::now() + self.window;
        self.entries
            .entry(id)
            .and_modify(|mark| {
                mark.pending += 1;
                mark.deadline = deadline;
            })
            .or_insert(Mark {
                pending: 1,
                deadline,
            });
    }

    /// Check and consume one mark for `id`
    pub fn is_own(&mut self, id: ShapeId) -> bool {
        self.evict_expired();
        let Some(mark) = self.entries.get_mut(&id) else {
            return false;
        };
        mark.pending -= 1;
        if mark.pending == 0 {
            self.entries.remove(&id);
        }
        trace!(id = %id, "echo consumed");
        true
    }

    /// Withdraw one mark after a failed write
    pub fn forget(&mut self, id: ShapeId) {
        if let Some(mark) = self.entries.get_mut(&id) {
            mark.pending = mark.pending.saturating_sub(1);
            if mark.pending == 0 {
                self.entries.remove(&id);
            }
        }
    }

    /// Number of ids with live marks
    pub fn len(&mut self) -> usize {
        self.evict_expired();
        self.entries.len()
    }

    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }

    fn evict_expired(&mut self) {
        let now = Instant::now();
        self.entries.retain(|_, mark| mark.deadline > now);
    }
}

impl Default for EchoLedger {
    fn default() -> Self {
        Self::new(DEFAULT_ECHO_WINDOW)
    }
}
