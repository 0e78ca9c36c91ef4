//! In-memory shape store - the client's authoritative view of the canvas.
//!
//! Shapes are kept in one ordered collection per kind. Insertion order is
//! per-client and is not expected to match other clients. Persistence is a
//! separate, explicit step performed by callers.

use std::collections::HashMap;

use crate::shapes::{KindTag, Shape, ShapeDraft, ShapeId, ShapePatch};

/// Shape collections grouped by kind, plus the current selection
#[derive(Debug, Default, Clone)]
pub struct ShapeStore {
    collections: HashMap<KindTag, Vec<Shape>>,
    selected: Option<ShapeId>,
}

impl ShapeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shape from a draft under a fresh id
    pub fn add(&mut self, draft: ShapeDraft) -> Shape {
        let shape = draft.build(ShapeId::new());
        self.collection_mut(shape.tag()).push(shape.clone());
        shape
    }

    /// Append an existing shape, keeping its id. Returns false if the id is taken.
    pub fn insert(&mut self, shape: Shape) -> bool {
        if self.contains(shape.id) {
            return false;
        }
        self.collection_mut(shape.tag()).push(shape);
        true
    }

    /// Merge a partial update. Returns false when the id is unknown or the
    /// patch does not fit the shape's kind.
    pub fn update(&mut self, id: ShapeId, patch: &ShapePatch) -> bool {
        match self.get_mut(id) {
            Some(shape) => patch.apply(shape),
            None => false,
        }
    }

    /// Overwrite a shape with a full snapshot, keeping its slot in the
    /// collection. A kind change moves it to the end of the new collection.
    pub fn replace(&mut self, shape: Shape) -> bool {
        let Some((tag, idx)) = self.locate(shape.id) else {
            return false;
        };

        if tag == shape.tag() {
            self.collection_mut(tag)[idx] = shape;
        } else {
            self.collection_mut(tag).remove(idx);
            self.collection_mut(shape.tag()).push(shape);
        }
        true
    }

    /// Remove a shape. Clears the selection if it pointed at this shape.
    pub fn delete(&mut self, id: ShapeId) -> bool {
        let Some((tag, idx)) = self.locate(id) else {
            return false;
        };
        self.collection_mut(tag).remove(idx);
        if self.selected == Some(id) {
            self.selected = None;
        }
        true
    }

    /// Change a shape's id in place (store assigned an authoritative id)
    pub fn rekey(&mut self, old: ShapeId, new: ShapeId) -> bool {
        if old == new {
            return self.contains(old);
        }
        if self.contains(new) {
            return false;
        }
        match self.get_mut(old) {
            Some(shape) => {
                shape.id = new;
                if self.selected == Some(old) {
                    self.selected = Some(new);
                }
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: ShapeId) -> Option<&Shape> {
        self.locate(id)
            .and_then(|(tag, idx)| self.collections.get(&tag).map(|c| &c[idx]))
    }

    pub fn contains(&self, id: ShapeId) -> bool {
        self.locate(id).is_some()
    }

    /// Empty every collection and the selection
    pub fn clear(&mut self) {
        self.collections.clear();
        self.selected = None;
    }

    /// Shapes of one kind, in insertion order
    pub fn of_kind(&self, tag: KindTag) -> &[Shape] {
        self.collections.get(&tag).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Iterate all shapes, kind by kind
    pub fn iter(&self) -> impl Iterator<Item = &Shape> {
        KindTag::ALL.into_iter().flat_map(|tag| self.of_kind(tag).iter())
    }

    pub fn ids(&self) -> Vec<ShapeId> {
        self.iter().map(|s| s.id).collect()
    }

    pub fn len(&self) -> usize {
        self.collections.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Select a shape. Returns false if it does not exist.
    pub fn select(&mut self, id: ShapeId) -> bool {
        if self.contains(id) {
            self.selected = Some(id);
            true
        } else {
            false
        }
    }

    pub fn deselect(&mut self) {
        self.selected = None;
    }

    pub fn selected(&self) -> Option<ShapeId> {
        self.selected
    }

    fn locate(&self, id: ShapeId) -> Option<(KindTag, usize)> {
        KindTag::ALL.into_iter().find_map(|tag| {
            self.of_kind(tag)
                .iter()
                .position(|s| s.id == id)
                .map(|idx| (tag, idx))
        })
    }

    fn get_mut(&mut self, id: ShapeId) -> Option<&mut Shape> {
        let (tag, idx) = self.locate(id)?;
        self.collections.get_mut(&tag).map(|c| &mut c[idx])
    }

    fn collection_mut(&mut self, tag: KindTag) -> &mut Vec<Shape> {
        self.collections.entry(tag).or_default()
    }
}
