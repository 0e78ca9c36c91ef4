//! Replay-in-progress flag shared by sync, history and undo/redo.
//!
//! While the flag is held, the history ledger refuses to record. Undo/redo
//! treat a held flag as "busy" and reject the call instead of queueing it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

/// Returned by undo/redo when another replay already holds the flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("undo/redo already in progress")]
pub struct ReplayBusy;

#[derive(Debug, Clone, Default)]
pub struct ReplayFlag {
    active: Arc<AtomicBool>,
}

impl ReplayFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Take the flag exclusively. Fails if it is already held.
    pub fn try_enter(&self) -> Result<ReplayGuard, ReplayBusy> {
        self.active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ReplayGuard {
                flag: self.clone(),
                restore: false,
            })
            .map_err(|_| ReplayBusy)
    }

    /// Hold the flag for the guard's lifetime, restoring the previous value
    /// on drop. Used by remote apply, which may nest inside a replay.
    pub fn hold(&self) -> ReplayGuard {
        let restore = self.active.swap(true, Ordering::SeqCst);
        ReplayGuard {
            flag: self.clone(),
            restore,
        }
    }
}

/// Releases the replay flag on drop
#[derive(Debug)]
pub struct ReplayGuard {
    flag: ReplayFlag,
    restore: bool,
}

impl Drop for ReplayGuard {
    fn drop(&mut self) {
        self.flag.active.store(self.restore, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_enter_is_busy() {
        let flag = ReplayFlag::new();
        let guard = flag.try_enter().unwrap();
        assert!(flag.is_active());
        assert_eq!(flag.try_enter().unwrap_err(), ReplayBusy);

        drop(guard);
        assert!(!flag.is_active());
        assert!(flag.try_enter().is_ok());
    }

    #[test]
    fn nested_hold_restores_outer_state() {
        let flag = ReplayFlag::new();
        let outer = flag.try_enter().unwrap();
        {
            let _inner = flag.hold();
            assert!(flag.is_active());
        }
        assert!(flag.is_active());
        drop(outer);
        assert!(!flag.is_active());
    }
}
