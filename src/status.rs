//! Shared status slot: last error text plus in-flight flags.
//!
//! Every component holds a clone. Operations report expected failures here
//! and return a sentinel (`false`, `None`, empty list) instead of `Err`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct StatusInner {
    error: Mutex<Option<String>>,
    saving: AtomicBool,
    loading: AtomicBool,
}

/// Cloneable handle to the session's status
#[derive(Debug, Clone, Default)]
pub struct StatusSlot {
    inner: Arc<StatusInner>,
}

impl StatusSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error message, replacing the previous one
    pub fn set_error(&self, msg: impl Into<String>) {
        let mut guard = self.inner.error.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(msg.into());
    }

    pub fn clear_error(&self) {
        let mut guard = self.inner.error.lock().unwrap_or_else(|e| e.into_inner());
        *guard = None;
    }

    /// Last recorded error, if any
    pub fn error(&self) -> Option<String> {
        self.inner
            .error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Take the last error, leaving the slot empty
    pub fn take_error(&self) -> Option<String> {
        self.inner
            .error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    pub fn is_saving(&self) -> bool {
        self.inner.saving.load(Ordering::SeqCst)
    }

    pub fn is_loading(&self) -> bool {
        self.inner.loading.load(Ordering::SeqCst)
    }

    /// Raise the `saving` flag until the guard drops
    pub fn saving(&self) -> FlagGuard<'_> {
        FlagGuard::raise(&self.inner.saving)
    }

    /// Raise the `loading` flag until the guard drops
    pub fn loading(&self) -> FlagGuard<'_> {
        FlagGuard::raise(&self.inner.loading)
    }
}

/// Lowers an in-flight flag on drop
#[derive(Debug)]
pub struct FlagGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> FlagGuard<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self { flag }
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_error() {
        let slot = StatusSlot::new();
        let other = slot.clone();

        other.set_error("store offline");
        assert_eq!(slot.error().as_deref(), Some("store offline"));
        assert_eq!(slot.take_error().as_deref(), Some("store offline"));
        assert!(other.error().is_none());
    }

    #[test]
    fn saving_flag_follows_guard() {
        let slot = StatusSlot::new();
        {
            let _guard = slot.saving();
            assert!(slot.is_saving());
            assert!(!slot.is_loading());
        }
        assert!(!slot.is_saving());
    }
}
