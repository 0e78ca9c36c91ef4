//! Persistence gateway: shape <-> row conversion and object-store calls.
//!
//! Rows carry a flat JSON attribute bag. Emoji shapes are written as `text`
//! rows with an extra `emoji` attribute; [`decode`] is the only place that
//! tells the two apart.
//!
//! Every gateway call catches the store's error, writes it to the shared
//! status slot, and returns a falsy value. Callers decide from the return
//! value whether to roll back their optimistic local change.

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::backend::{NewObjectRow, ObjectFilter, ObjectKind, ObjectRow, ObjectStore};
use crate::shapes::{DEFAULT_FONT_SIZE, KindTag, Shape, ShapeId, ShapeKind, Style};
use crate::status::StatusSlot;

/// The `data` bag stored on each row
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectData {
    x: f64,
    y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fill: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stroke: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stroke_width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rotation: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    draggable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    height: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    radius: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    font_size: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    emoji: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    layer: Option<i32>,
}

/// Store object type for a shape kind
pub fn object_kind(tag: KindTag) -> ObjectKind {
    match tag {
        KindTag::Rectangle => ObjectKind::Rect,
        KindTag::Circle => ObjectKind::Circle,
        KindTag::Text | KindTag::Emoji => ObjectKind::Text,
    }
}

/// Flatten a shape into the store's `(type, data)` pair
pub fn encode(shape: &Shape) -> Result<(ObjectKind, Value)> {
    let mut data = ObjectData {
        x: shape.x,
        y: shape.y,
        fill: Some(shape.style.fill.clone()),
        stroke: Some(shape.style.stroke.clone()),
        stroke_width: Some(shape.style.stroke_width),
        rotation: Some(shape.style.rotation),
        draggable: Some(shape.style.draggable),
        ..ObjectData::default()
    };

    match &shape.kind {
        ShapeKind::Rectangle { width, height } => {
            data.width = Some(*width);
            data.height = Some(*height);
        }
        ShapeKind::Circle { radius } => {
            data.radius = Some(*radius);
        }
        ShapeKind::Text { text, font_size } => {
            data.text = Some(text.clone());
            data.font_size = Some(*font_size);
        }
        ShapeKind::Emoji {
            emoji,
            font_size,
            layer,
        } => {
            data.text = Some(emoji.clone());
            data.emoji = Some(emoji.clone());
            data.font_size = Some(*font_size);
            data.layer = Some(*layer);
        }
    }

    let value = serde_json::to_value(&data).context("Failed to encode shape data")?;
    Ok((object_kind(shape.tag()), value))
}

/// Rebuild a shape from a store row
pub fn decode(row: &ObjectRow) -> Result<Shape> {
    let data: ObjectData = serde_json::from_value(row.data.clone())
        .with_context(|| format!("Malformed data for object {}", row.id))?;

    let kind = match row.kind {
        ObjectKind::Rect => ShapeKind::Rectangle {
            width: data
                .width
                .ok_or_else(|| anyhow!("rect {} has no width", row.id))?,
            height: data
                .height
                .ok_or_else(|| anyhow!("rect {} has no height", row.id))?,
        },
        ObjectKind::Circle => ShapeKind::Circle {
            radius: data
                .radius
                .ok_or_else(|| anyhow!("circle {} has no radius", row.id))?,
        },
        ObjectKind::Text => match data.emoji.clone() {
            Some(emoji) => ShapeKind::Emoji {
                emoji,
                font_size: data.font_size.unwrap_or(crate::shapes::DEFAULT_EMOJI_SIZE),
                layer: data.layer.unwrap_or(0),
            },
            None => ShapeKind::Text {
                text: data
                    .text
                    .clone()
                    .ok_or_else(|| anyhow!("text {} has no text", row.id))?,
                font_size: data.font_size.unwrap_or(DEFAULT_FONT_SIZE),
            },
        },
    };

    let defaults = Style::default_for(kind.tag());
    Ok(Shape {
        id: ShapeId(row.id),
        x: data.x,
        y: data.y,
        style: Style {
            fill: data.fill.unwrap_or(defaults.fill),
            stroke: data.stroke.unwrap_or(defaults.stroke),
            stroke_width: data.stroke_width.unwrap_or(defaults.stroke_width),
            rotation: data.rotation.unwrap_or(defaults.rotation),
            draggable: data.draggable.unwrap_or(defaults.draggable),
        },
        kind,
    })
}

/// Object-store access scoped to one collaboration session and author
#[derive(Clone)]
pub struct PersistenceGateway {
    objects: Arc<dyn ObjectStore>,
    session_id: String,
    author_id: String,
    status: StatusSlot,
}

impl std::fmt::Debug for PersistenceGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceGateway")
            .field("session_id", &self.session_id)
            .field("author_id", &self.author_id)
            .finish()
    }
}

impl PersistenceGateway {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        session_id: impl Into<String>,
        author_id: impl Into<String>,
        status: StatusSlot,
    ) -> Self {
        Self {
            objects,
            session_id: session_id.into(),
            author_id: author_id.into(),
            status,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn author_id(&self) -> &str {
        &self.author_id
    }

    /// Insert a new shape. `None` on failure, with the error recorded.
    pub async fn save(&self, shape: &Shape) -> Option<ObjectRow> {
        let _saving = self.status.saving();
        let result = async {
            let (kind, data) = encode(shape)?;
            self.objects
                .insert(NewObjectRow {
                    id: Some(shape.id.0),
                    session_id: self.session_id.clone(),
                    author_id: self.author_id.clone(),
                    kind,
                    data,
                })
                .await
        }
        .await;

        match result {
            Ok(row) => {
                debug!(id = %row.id, session = %self.session_id, "shape saved");
                Some(row)
            }
            Err(e) => {
                self.fail("save shape", shape.id, &e);
                None
            }
        }
    }

    /// Overwrite a stored shape with its full post-mutation snapshot
    pub async fn persist_update(&self, shape: &Shape) -> bool {
        let _saving = self.status.saving();
        let result = async {
            let (kind, data) = encode(shape)?;
            self.objects
                .update(shape.id.0, &self.session_id, kind, data)
                .await
        }
        .await;

        match result {
            Ok(_) => true,
            Err(e) => {
                self.fail("update shape", shape.id, &e);
                false
            }
        }
    }

    /// Hard-delete one shape within this session
    pub async fn remove(&self, id: ShapeId) -> bool {
        let _saving = self.status.saving();
        match self.objects.delete(id.0, &self.session_id).await {
            Ok(()) => true,
            Err(e) => {
                self.fail("delete shape", id, &e);
                false
            }
        }
    }

    /// Hard-delete every shape in this session
    pub async fn remove_all(&self) -> bool {
        let _saving = self.status.saving();
        match self.objects.delete_all(&self.session_id).await {
            Ok(()) => true,
            Err(e) => {
                warn!(session = %self.session_id, error = %e, "failed to clear canvas");
                self.status.set_error(format!("Failed to clear canvas: {}", e));
                false
            }
        }
    }

    /// Live rows of the session, oldest first
    pub async fn load(&self) -> Vec<ObjectRow> {
        self.select(ObjectFilter::session(&self.session_id)).await
    }

    /// Live rows this author created in the session
    pub async fn load_for_author(&self) -> Vec<ObjectRow> {
        self.select(ObjectFilter::session(&self.session_id).author(&self.author_id))
            .await
    }

    async fn select(&self, filter: ObjectFilter) -> Vec<ObjectRow> {
        let _loading = self.status.loading();
        match self.objects.select(&filter).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(session = %self.session_id, error = %e, "failed to load shapes");
                self.status.set_error(format!("Failed to load shapes: {}", e));
                Vec::new()
            }
        }
    }

    fn fail(&self, op: &str, id: ShapeId, e: &anyhow::Error) {
        warn!(id = %id, session = %self.session_id, error = %e, "failed to {}", op);
        self.status.set_error(format!("Failed to {}: {}", op, e));
    }
}
