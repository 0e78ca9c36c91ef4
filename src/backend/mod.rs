//! Interfaces of the external collaborators.
//!
//! The object store, change feed, action log and presence channel are black
//! boxes to this crate. They are modelled as `async_trait` traits returning
//! `anyhow::Result`; the components in this crate convert those errors into
//! the status-slot convention at their boundary.
//!
//! [`memory::MemoryBackend`] implements all four in-process.

pub mod memory;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

pub use memory::MemoryBackend;

// --- Object store ---

/// Object type enum as the store knows it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Rect,
    Circle,
    Text,
}

/// A persisted canvas object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectRow {
    pub id: Uuid,
    pub session_id: String,
    pub author_id: String,
    #[serde(rename = "type")]
    pub kind: ObjectKind,
    pub data: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl ObjectRow {
    pub fn is_soft_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Insert payload. `id` is optional; the store assigns one when absent.
#[derive(Debug, Clone, PartialEq)]
pub struct NewObjectRow {
    pub id: Option<Uuid>,
    pub session_id: String,
    pub author_id: String,
    pub kind: ObjectKind,
    pub data: Value,
}

/// Equality filters supported by [`ObjectStore::select`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectFilter {
    pub session_id: String,
    pub author_id: Option<String>,
    pub include_deleted: bool,
}

impl ObjectFilter {
    /// Live rows of one session
    pub fn session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            author_id: None,
            include_deleted: false,
        }
    }

    pub fn author(mut self, author_id: impl Into<String>) -> Self {
        self.author_id = Some(author_id.into());
        self
    }
}

/// Row-level CRUD over canvas objects.
///
/// Update and delete are scoped by id AND session id. `select` returns rows
/// ordered by `created_at` ascending.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn insert(&self, row: NewObjectRow) -> Result<ObjectRow>;

    async fn update(
        &self,
        id: Uuid,
        session_id: &str,
        kind: ObjectKind,
        data: Value,
    ) -> Result<ObjectRow>;

    async fn delete(&self, id: Uuid, session_id: &str) -> Result<()>;

    async fn delete_all(&self, session_id: &str) -> Result<()>;

    async fn select(&self, filter: &ObjectFilter) -> Result<Vec<ObjectRow>>;
}

// --- Change feed ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeEventType {
    Insert,
    Update,
    Delete,
}

/// Row-level change notification
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub event_type: ChangeEventType,
    pub new: Option<ObjectRow>,
    pub old: Option<ObjectRow>,
}

impl ChangeEvent {
    /// Id of the affected row, taken from `new` then `old`
    pub fn row_id(&self) -> Option<Uuid> {
        self.new.as_ref().or(self.old.as_ref()).map(|r| r.id)
    }

    /// Session the affected row belongs to
    pub fn session_id(&self) -> Option<&str> {
        self.new
            .as_ref()
            .or(self.old.as_ref())
            .map(|r| r.session_id.as_str())
    }
}

/// Subscription status reported by the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Joining,
    Subscribed,
    ChannelError,
    TimedOut,
    Closed,
}

/// Live subscription to one session's change topic
#[derive(Debug)]
pub struct Subscription {
    pub events: mpsc::UnboundedReceiver<ChangeEvent>,
    pub status: watch::Receiver<ChannelStatus>,
}

/// Topic-per-session change notification channel
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, session_id: &str) -> Result<Subscription>;
}

// --- Action log ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Add,
    Update,
    Delete,
    DeleteMultiple,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    Rectangle,
    Circle,
    Text,
    Emoji,
    /// Bulk actions spanning several kinds
    Mixed,
}

/// Durable action history row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRow {
    pub id: Uuid,
    pub user_id: String,
    pub canvas_id: String,
    pub action_type: ActionType,
    pub object_type: ObjectType,
    pub object_id: String,
    pub before_state: Option<Value>,
    pub after_state: Option<Value>,
    pub timestamp: DateTime<Utc>,
    pub undone_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewActionRow {
    pub user_id: String,
    pub canvas_id: String,
    pub action_type: ActionType,
    pub object_type: ObjectType,
    pub object_id: String,
    pub before_state: Option<Value>,
    pub after_state: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

/// Durable store for undoable actions
#[async_trait]
pub trait ActionLogStore: Send + Sync {
    async fn insert_action(&self, row: NewActionRow) -> Result<ActionRow>;

    /// Set or clear the `undone_at` marker
    async fn set_undone(&self, id: Uuid, undone_at: Option<DateTime<Utc>>) -> Result<()>;

    /// Remove an action that can no longer be replayed. Absent ids are a no-op.
    async fn delete_action(&self, id: Uuid) -> Result<()>;

    /// Most recent `limit` actions for a user on a canvas, oldest first
    async fn load_actions(
        &self,
        user_id: &str,
        canvas_id: &str,
        limit: usize,
    ) -> Result<Vec<ActionRow>>;
}

// --- Presence ---

/// Attributes a participant broadcasts about itself
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresencePayload {
    pub display_name: String,
    pub cursor: Option<(f64, f64)>,
    pub online: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceEventKind {
    Sync,
    Join,
    Leave,
}

/// Presence notification carrying the full state map keyed by participant id
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEvent {
    pub kind: PresenceEventKind,
    /// Participant that joined or left; `None` for plain syncs
    pub participant_id: Option<String>,
    pub state: HashMap<String, PresencePayload>,
}

#[derive(Debug)]
pub struct PresenceSubscription {
    pub events: mpsc::UnboundedReceiver<PresenceEvent>,
}

/// Per-session presence topic
#[async_trait]
pub trait PresenceChannel: Send + Sync {
    async fn join(&self, session_id: &str, participant_id: &str) -> Result<PresenceSubscription>;

    async fn track(
        &self,
        session_id: &str,
        participant_id: &str,
        payload: PresencePayload,
    ) -> Result<()>;

    async fn leave(&self, session_id: &str, participant_id: &str) -> Result<()>;
}
