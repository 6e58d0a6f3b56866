//! Session-wide list of overlay patterns.

use log::info;
use xrdpix_core::{Pattern, Signal};

use crate::{Error, Result};

/// Stable identity of an overlay; survives reordering and removal of
/// other overlays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OverlayId(u64);

/// An overlay entry.
#[derive(Debug)]
pub struct Overlay {
    id: OverlayId,
    pattern: Pattern,
}

impl Overlay {
    #[must_use]
    pub fn id(&self) -> OverlayId {
        self.id
    }

    #[must_use]
    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }
}

/// Ordered overlays with indexed change signals.
#[derive(Debug, Default)]
pub struct OverlayModel {
    overlays: Vec<Overlay>,
    next_id: u64,
    added: Signal<()>,
    removed: Signal<usize>,
    changed: Signal<usize>,
}

impl OverlayModel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Emitted after an overlay is appended.
    #[must_use]
    pub fn overlay_added(&self) -> &Signal<()> {
        &self.added
    }

    /// Emitted with the former index of a removed overlay.
    #[must_use]
    pub fn overlay_removed(&self) -> &Signal<usize> {
        &self.removed
    }

    /// Emitted with the index of an overlay whose data or scaling changed.
    #[must_use]
    pub fn overlay_changed(&self) -> &Signal<usize> {
        &self.changed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.overlays.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.overlays.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Overlay> {
        self.overlays.iter()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Overlay> {
        self.overlays.get(index)
    }

    /// Current index of the overlay with `id`.
    #[must_use]
    pub fn index_of(&self, id: OverlayId) -> Option<usize> {
        self.overlays.iter().position(|o| o.id == id)
    }

    /// Overlay with `id`.
    #[must_use]
    pub fn by_id(&self, id: OverlayId) -> Option<&Overlay> {
        self.overlays.iter().find(|o| o.id == id)
    }

    fn check(&self, index: usize) -> Result<()> {
        if index < self.overlays.len() {
            Ok(())
        } else {
            Err(Error::IndexOutOfRange {
                what: "overlay",
                index,
                len: self.overlays.len(),
            })
        }
    }

    /// Append a value copy of `pattern`'s published data.
    pub fn add_overlay(&mut self, pattern: &Pattern) -> OverlayId {
        self.push(pattern.snapshot())
    }

    /// Append a pattern, taking ownership.
    pub fn push(&mut self, pattern: Pattern) -> OverlayId {
        let id = OverlayId(self.next_id);
        self.next_id += 1;
        info!("overlay '{}' added", pattern.name());
        self.overlays.push(Overlay { id, pattern });
        self.added.emit(&());
        id
    }

    /// Remove the overlay at `index`.
    ///
    /// # Errors
    /// Returns `IndexOutOfRange` for a bad index.
    pub fn remove_overlay(&mut self, index: usize) -> Result<Overlay> {
        self.check(index)?;
        let overlay = self.overlays.remove(index);
        info!("overlay '{}' removed", overlay.pattern.name());
        self.removed.emit(&index);
        Ok(overlay)
    }

    /// Remove every overlay, last first.
    pub fn clear(&mut self) {
        while self.overlays.pop().is_some() {
            self.removed.emit(&self.overlays.len());
        }
    }

    /// Set the scaling of the overlay at `index`.
    ///
    /// # Errors
    /// Returns `IndexOutOfRange` for a bad index or the pattern's error.
    pub fn set_scaling(&mut self, index: usize, scaling: f64) -> Result<()> {
        self.update(index, |p| p.set_scaling(scaling))
    }

    /// Set the offset of the overlay at `index`.
    ///
    /// # Errors
    /// Returns `IndexOutOfRange` for a bad index or the pattern's error.
    pub fn set_offset(&mut self, index: usize, offset: f64) -> Result<()> {
        self.update(index, |p| p.set_offset(offset))
    }

    /// Rename the overlay at `index`.
    ///
    /// # Errors
    /// Returns `IndexOutOfRange` for a bad index.
    pub fn rename(&mut self, index: usize, name: &str) -> Result<()> {
        self.update(index, |p| {
            p.set_name(name);
            Ok(())
        })
    }

    /// Apply `f` to the overlay pattern at `index` and emit `overlay_changed`.
    ///
    /// # Errors
    /// Returns `IndexOutOfRange` for a bad index or the error of `f`, in
    /// which case nothing is emitted.
    pub fn update(
        &mut self,
        index: usize,
        f: impl FnOnce(&mut Pattern) -> xrdpix_core::Result<()>,
    ) -> Result<()> {
        self.check(index)?;
        f(&mut self.overlays[index].pattern)?;
        self.changed.emit(&index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn pattern(name: &str) -> Pattern {
        Pattern::new(vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0], name).unwrap()
    }

    #[test]
    fn test_add_is_value_copy() {
        let mut source = pattern("current");
        let mut model = OverlayModel::new();
        let id = model.add_overlay(&source);
        source.set_scaling(10.0).unwrap();
        assert_eq!(model.by_id(id).unwrap().pattern().y(), &[4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_ids_are_stable_across_removal() {
        let mut model = OverlayModel::new();
        let a = model.push(pattern("a"));
        let b = model.push(pattern("b"));
        assert_eq!(model.index_of(b), Some(1));
        model.remove_overlay(0).unwrap();
        assert_eq!(model.index_of(a), None);
        assert_eq!(model.index_of(b), Some(0));
        let c = model.push(pattern("c"));
        assert_ne!(c, a);
    }

    #[test]
    fn test_remove_then_add_keeps_length() {
        let mut model = OverlayModel::new();
        for name in ["a", "b", "c"] {
            model.push(pattern(name));
        }
        let removed = model.remove_overlay(1).unwrap();
        model.add_overlay(removed.pattern());
        assert_eq!(model.len(), 3);
    }

    #[test]
    fn test_indexed_signals() {
        let mut model = OverlayModel::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let (l1, l2, l3) = (Rc::clone(&log), Rc::clone(&log), Rc::clone(&log));
        let _s1 = model.overlay_added().subscribe(move |_| l1.borrow_mut().push("added".to_string()));
        let _s2 = model
            .overlay_removed()
            .subscribe(move |i| l2.borrow_mut().push(format!("removed {i}")));
        let _s3 = model
            .overlay_changed()
            .subscribe(move |i| l3.borrow_mut().push(format!("changed {i}")));

        model.push(pattern("a"));
        model.push(pattern("b"));
        model.set_offset(1, 2.0).unwrap();
        assert!(model.set_scaling(5, 1.0).is_err());
        model.remove_overlay(0).unwrap();
        assert_eq!(
            *log.borrow(),
            vec!["added", "added", "changed 1", "removed 0"]
        );
        assert_eq!(model.get(0).unwrap().pattern().y(), &[6.0, 7.0, 8.0]);
    }
}
