//! Realtime sync and undo/redo core for a collaborative drawing canvas.
//!
//! A [`CanvasSession`] applies local edits optimistically, persists them
//! through the object store, merges other clients' changes from the change
//! feed, and keeps a per-user undo/redo history in a durable action log.
//! The external collaborators are traits in [`backend`];
//! [`backend::MemoryBackend`] implements all of them in-process.

pub mod backend;
pub mod clipboard;
pub mod config;
pub mod drag;
pub mod echo;
pub mod events;
pub mod history;
pub mod persistence;
pub mod presence;
pub mod replay;
pub mod session;
pub mod shapes;
pub mod status;
pub mod store;
pub mod sync;
pub mod undo;

pub use config::SessionConfig;
pub use events::{CanvasEvent, Origin};
pub use history::{ActionHistory, ActionRecord, ActionType, ObjectType, Snapshot};
pub use replay::{ReplayBusy, ReplayFlag};
pub use session::{Backends, CanvasSession, Identity};
pub use shapes::{KindTag, Shape, ShapeDraft, ShapeId, ShapeKind, ShapePatch, Style};
pub use status::StatusSlot;
pub use store::ShapeStore;
pub use sync::{ConnectionStatus, RealtimeSync, SyncOutcome};
