//! Shape types for the collaborative canvas.
//!
//! `Shape` is the unit everything else moves around: local edits, remote
//! change events and undo snapshots all carry a full `Shape`. The
//! kind-specific attributes live in the `ShapeKind` tagged union, so a shape
//! can never carry two attribute sets at once.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default font size for text shapes
pub const DEFAULT_FONT_SIZE: f64 = 16.0;

/// Default font size for emoji stamps
pub const DEFAULT_EMOJI_SIZE: f64 = 32.0;

/// Shape identifier - UUID generated client-side before persistence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShapeId(pub Uuid);

impl ShapeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse an id coming from the UI or the store. Malformed ids yield `None`.
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s.trim()).ok().map(Self)
    }
}

impl Default for ShapeId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ShapeId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for ShapeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Discriminant of [`ShapeKind`], used to pick a collection in the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KindTag {
    Rectangle,
    Circle,
    Text,
    Emoji,
}

impl KindTag {
    pub const ALL: [KindTag; 4] = [
        KindTag::Rectangle,
        KindTag::Circle,
        KindTag::Text,
        KindTag::Emoji,
    ];

    /// Display name for logs
    pub fn name(self) -> &'static str {
        match self {
            KindTag::Rectangle => "rectangle",
            KindTag::Circle => "circle",
            KindTag::Text => "text",
            KindTag::Emoji => "emoji",
        }
    }
}

/// Style attributes shared by every shape kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Style {
    pub fill: String,
    pub stroke: String,
    pub stroke_width: f64,
    /// Rotation in degrees
    pub rotation: f64,
    pub draggable: bool,
}

impl Style {
    /// Defaults applied by the store when a draft leaves a field unset
    pub fn default_for(tag: KindTag) -> Self {
        let (fill, stroke, stroke_width) = match tag {
            KindTag::Rectangle => ("#3b82f6", "#1e3a8a", 2.0),
            KindTag::Circle => ("#10b981", "#065f46", 2.0),
            KindTag::Text => ("#111827", "transparent", 0.0),
            KindTag::Emoji => ("#000000", "transparent", 0.0),
        };
        Self {
            fill: fill.to_string(),
            stroke: stroke.to_string(),
            stroke_width,
            rotation: 0.0,
            draggable: true,
        }
    }
}

/// Kind-specific attributes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ShapeKind {
    Rectangle { width: f64, height: f64 },
    Circle { radius: f64 },
    Text { text: String, font_size: f64 },
    /// Emoji stamp. Stored as a `text` row with an `emoji` attribute.
    Emoji {
        emoji: String,
        font_size: f64,
        #[serde(default)]
        layer: i32,
    },
}

impl ShapeKind {
    pub fn tag(&self) -> KindTag {
        match self {
            ShapeKind::Rectangle { .. } => KindTag::Rectangle,
            ShapeKind::Circle { .. } => KindTag::Circle,
            ShapeKind::Text { .. } => KindTag::Text,
            ShapeKind::Emoji { .. } => KindTag::Emoji,
        }
    }
}

/// A drawable object on the canvas
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shape {
    pub id: ShapeId,
    pub x: f64,
    pub y: f64,
    #[serde(flatten)]
    pub style: Style,
    #[serde(flatten)]
    pub kind: ShapeKind,
}

impl Shape {
    pub fn tag(&self) -> KindTag {
        self.kind.tag()
    }

    /// Whether two snapshots sit at the same canvas position
    pub fn same_position(&self, other: &Shape) -> bool {
        self.x == other.x && self.y == other.y
    }
}

/// A shape about to be created. Unset style fields get per-kind defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct ShapeDraft {
    pub x: f64,
    pub y: f64,
    pub kind: ShapeKind,
    pub fill: Option<String>,
    pub stroke: Option<String>,
    pub stroke_width: Option<f64>,
    pub rotation: Option<f64>,
    pub draggable: Option<bool>,
}

impl ShapeDraft {
    pub fn new(x: f64, y: f64, kind: ShapeKind) -> Self {
        Self {
            x,
            y,
            kind,
            fill: None,
            stroke: None,
            stroke_width: None,
            rotation: None,
            draggable: None,
        }
    }

    pub fn rectangle(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self::new(x, y, ShapeKind::Rectangle { width, height })
    }

    pub fn circle(x: f64, y: f64, radius: f64) -> Self {
        Self::new(x, y, ShapeKind::Circle { radius })
    }

    pub fn text(x: f64, y: f64, text: impl Into<String>) -> Self {
        Self::new(
            x,
            y,
            ShapeKind::Text {
                text: text.into(),
                font_size: DEFAULT_FONT_SIZE,
            },
        )
    }

    pub fn emoji(x: f64, y: f64, emoji: impl Into<String>) -> Self {
        Self::new(
            x,
            y,
            ShapeKind::Emoji {
                emoji: emoji.into(),
                font_size: DEFAULT_EMOJI_SIZE,
                layer: 0,
            },
        )
    }

    /// Draft that reproduces an existing shape's attributes (clipboard paste)
    pub fn from_shape(shape: &Shape) -> Self {
        Self {
            x: shape.x,
            y: shape.y,
            kind: shape.kind.clone(),
            fill: Some(shape.style.fill.clone()),
            stroke: Some(shape.style.stroke.clone()),
            stroke_width: Some(shape.style.stroke_width),
            rotation: Some(shape.style.rotation),
            draggable: Some(shape.style.draggable),
        }
    }

    pub fn fill(mut self, fill: impl Into<String>) -> Self {
        self.fill = Some(fill.into());
        self
    }

    pub fn stroke(mut self, stroke: impl Into<String>) -> Self {
        self.stroke = Some(stroke.into());
        self
    }

    pub fn stroke_width(mut self, width: f64) -> Self {
        self.stroke_width = Some(width);
        self
    }

    pub fn rotation(mut self, degrees: f64) -> Self {
        self.rotation = Some(degrees);
        self
    }

    pub fn draggable(mut self, draggable: bool) -> Self {
        self.draggable = Some(draggable);
        self
    }

    /// Finish the draft under the given id
    pub fn build(self, id: ShapeId) -> Shape {
        let defaults = Style::default_for(self.kind.tag());
        Shape {
            id,
            x: self.x,
            y: self.y,
            style: Style {
                fill: self.fill.unwrap_or(defaults.fill),
                stroke: self.stroke.unwrap_or(defaults.stroke),
                stroke_width: self.stroke_width.unwrap_or(defaults.stroke_width),
                rotation: self.rotation.unwrap_or(defaults.rotation),
                draggable: self.draggable.unwrap_or(defaults.draggable),
            },
            kind: self.kind,
        }
    }
}

/// Partial update for a shape. Only the populated fields are merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShapePatch {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub fill: Option<String>,
    pub stroke: Option<String>,
    pub stroke_width: Option<f64>,
    pub rotation: Option<f64>,
    pub draggable: Option<bool>,
    pub width: Option<f64>,
    pub height: Option<f64>,
    pub radius: Option<f64>,
    pub text: Option<String>,
    pub font_size: Option<f64>,
    pub emoji: Option<String>,
    pub layer: Option<i32>,
}

impl ShapePatch {
    /// Move-only patch, the shape of every drag frame
    pub fn position(x: f64, y: f64) -> Self {
        Self {
            x: Some(x),
            y: Some(y),
            ..Self::default()
        }
    }

    pub fn fill(fill: impl Into<String>) -> Self {
        Self {
            fill: Some(fill.into()),
            ..Self::default()
        }
    }

    pub fn size(width: f64, height: f64) -> Self {
        Self {
            width: Some(width),
            height: Some(height),
            ..Self::default()
        }
    }

    /// True when the patch touches `x`/`y` and nothing else
    pub fn is_position_only(&self) -> bool {
        let moves = self.x.is_some() || self.y.is_some();
        let rest = ShapePatch {
            x: None,
            y: None,
            ..self.clone()
        };
        moves && rest.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        *self == ShapePatch::default()
    }

    /// Whether every kind-specific field in the patch belongs to `tag`
    pub fn applies_to(&self, tag: KindTag) -> bool {
        let rect_fields = self.width.is_some() || self.height.is_some();
        let circle_fields = self.radius.is_some();
        let text_fields = self.text.is_some();
        let emoji_fields = self.emoji.is_some() || self.layer.is_some();
        let sized_font = self.font_size.is_some();

        match tag {
            KindTag::Rectangle => !(circle_fields || text_fields || emoji_fields || sized_font),
            KindTag::Circle => !(rect_fields || text_fields || emoji_fields || sized_font),
            KindTag::Text => !(rect_fields || circle_fields || emoji_fields),
            KindTag::Emoji => !(rect_fields || circle_fields || text_fields),
        }
    }

    /// Merge into `shape`. Returns false without touching the shape when the
    /// patch carries attributes of another kind.
    pub fn apply(&self, shape: &mut Shape) -> bool {
        if !self.applies_to(shape.tag()) {
            return false;
        }

        if let Some(x) = self.x {
            shape.x = x;
        }
        if let Some(y) = self.y {
            shape.y = y;
        }
        if let Some(fill) = &self.fill {
            shape.style.fill = fill.clone();
        }
        if let Some(stroke) = &self.stroke {
            shape.style.stroke = stroke.clone();
        }
        if let Some(w) = self.stroke_width {
            shape.style.stroke_width = w;
        }
        if let Some(r) = self.rotation {
            shape.style.rotation = r;
        }
        if let Some(d) = self.draggable {
            shape.style.draggable = d;
        }

        match &mut shape.kind {
            ShapeKind::Rectangle { width, height } => {
                if let Some(w) = self.width {
                    *width = w;
                }
                if let Some(h) = self.height {
                    *height = h;
                }
            }
            ShapeKind::Circle { radius } => {
                if let Some(r) = self.radius {
                    *radius = r;
                }
            }
            ShapeKind::Text { text, font_size } => {
                if let Some(t) = &self.text {
                    *text = t.clone();
                }
                if let Some(size) = self.font_size {
                    *font_size = size;
                }
            }
            ShapeKind::Emoji {
                emoji,
                font_size,
                layer,
            } => {
                if let Some(e) = &self.emoji {
                    *emoji = e.clone();
                }
                if let Some(size) = self.font_size {
                    *font_size = size;
                }
                if let Some(l) = self.layer {
                    *layer = l;
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draft_fills_style_defaults() {
        let shape = ShapeDraft::rectangle(10.0, 20.0, 100.0, 60.0)
            .fill("#ff0000")
            .build(ShapeId::new());

        assert_eq!(shape.style.fill, "#ff0000");
        assert_eq!(shape.style.stroke, Style::default_for(KindTag::Rectangle).stroke);
        assert!(shape.style.draggable);
        assert_eq!(shape.tag(), KindTag::Rectangle);
    }

    #[test]
    fn position_only_detection() {
        assert!(ShapePatch::position(1.0, 2.0).is_position_only());
        assert!(
            ShapePatch {
                x: Some(3.0),
                ..ShapePatch::default()
            }
            .is_position_only()
        );

        let mut moved_and_filled = ShapePatch::position(1.0, 2.0);
        moved_and_filled.fill = Some("#000".into());
        assert!(!moved_and_filled.is_position_only());
        assert!(!ShapePatch::default().is_position_only());
    }

    #[test]
    fn patch_rejects_foreign_kind_fields() {
        let mut circle = ShapeDraft::circle(0.0, 0.0, 5.0).build(ShapeId::new());
        let before = circle.clone();

        assert!(!ShapePatch::size(10.0, 10.0).apply(&mut circle));
        assert_eq!(circle, before);

        let grow = ShapePatch {
            radius: Some(9.0),
            x: Some(4.0),
            ..ShapePatch::default()
        };
        assert!(grow.apply(&mut circle));
        assert_eq!(circle.kind, ShapeKind::Circle { radius: 9.0 });
        assert_eq!(circle.x, 4.0);
    }

    #[test]
    fn font_size_applies_to_text_and_emoji_only() {
        let patch = ShapePatch {
            font_size: Some(40.0),
            ..ShapePatch::default()
        };
        assert!(patch.applies_to(KindTag::Text));
        assert!(patch.applies_to(KindTag::Emoji));
        assert!(!patch.applies_to(KindTag::Rectangle));
    }

    #[test]
    fn snapshot_json_is_flat() {
        let shape = ShapeDraft::emoji(5.0, 6.0, "🎉").build(ShapeId::new());
        let value = serde_json::to_value(&shape).unwrap();

        assert_eq!(value["kind"], "emoji");
        assert_eq!(value["emoji"], "🎉");
        assert_eq!(value["fill"], "#000000");

        let back: Shape = serde_json::from_value(value).unwrap();
        assert_eq!(back, shape);
    }

    #[test]
    fn malformed_id_is_rejected() {
        assert!(ShapeId::parse("not-a-uuid").is_none());
        let id = ShapeId::new();
        assert_eq!(ShapeId::parse(&id.to_string()), Some(id));
    }
}
