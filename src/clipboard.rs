//! Copy/paste buffer.
//!
//! Paste positions are always computed from the copied snapshot, so pasting
//! the same buffer repeatedly lands every copy at the same offset.

use crate::shapes::{Shape, ShapeDraft};

/// Default paste offset on both axes
pub const DEFAULT_PASTE_OFFSET: f64 = 20.0;

#[derive(Debug, Clone)]
pub struct Clipboard {
    items: Vec<Shape>,
    offset: f64,
}

impl Clipboard {
    pub fn new(offset: f64) -> Self {
        Self {
            items: Vec::new(),
            offset,
        }
    }

    /// Replace the buffer with snapshots of `shapes`
    pub fn copy<'a>(&mut self, shapes: impl IntoIterator<Item = &'a Shape>) -> usize {
        self.items = shapes.into_iter().cloned().collect();
        self.items.len()
    }

    /// Drafts for a paste: the copied shapes shifted by the offset. The
    /// session assigns fresh ids when it adds them.
    pub fn paste_drafts(&self) -> Vec<ShapeDraft> {
        self.items
            .iter()
            .map(|shape| {
                let mut draft = ShapeDraft::from_shape(shape);
                draft.x = shape.x + self.offset;
                draft.y = shape.y + self.offset;
                draft
            })
            .collect()
    }

    pub fn items(&self) -> &[Shape] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl Default for Clipboard {
    fn default() -> Self {
        Self::new(DEFAULT_PASTE_OFFSET)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shapes::ShapeId;

    #[test]
    fn paste_offset_is_not_cumulative() {
        let mut clipboard = Clipboard::default();
        let shape = ShapeDraft::rectangle(100.0, 100.0, 10.0, 10.0).build(ShapeId::new());
        clipboard.copy([&shape]);

        for _ in 0..2 {
            let drafts = clipboard.paste_drafts();
            assert_eq!(drafts.len(), 1);
            assert_eq!((drafts[0].x, drafts[0].y), (120.0, 120.0));
        }
    }

    #[test]
    fn paste_keeps_style_and_kind() {
        let mut clipboard = Clipboard::new(5.0);
        let shape = ShapeDraft::emoji(0.0, 0.0, "🎉")
            .rotation(30.0)
            .build(ShapeId::new());
        clipboard.copy([&shape]);

        let pasted = clipboard.paste_drafts().remove(0).build(ShapeId::new());
        assert_eq!(pasted.kind, shape.kind);
        assert_eq!(pasted.style, shape.style);
        assert_eq!((pasted.x, pasted.y), (5.0, 5.0));
    }

    #[test]
    fn empty_clipboard_pastes_nothing() {
        assert!(Clipboard::default().paste_drafts().is_empty());
    }
}
