//! Ordered set of a bundle's image references.

use crate::lockconfig;

/// A locked image plus whether it is itself a bundle (`None` = not yet known).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub image_ref: lockconfig::ImageRef,
    pub is_bundle: Option<bool>,
}

impl ImageRef {
    /// An entry whose bundle status is known.
    pub fn new(image_ref: lockconfig::ImageRef, is_bundle: bool) -> Self {
        Self {
            image_ref,
            is_bundle: Some(is_bundle),
        }
    }

    /// An entry not yet checked against the registry.
    pub fn unclassified(image_ref: lockconfig::ImageRef) -> Self {
        Self {
            image_ref,
            is_bundle: None,
        }
    }

    /// The locked `repo@digest` reference.
    pub fn image(&self) -> &str {
        &self.image_ref.image
    }

    /// Copy with its own annotation map.
    pub fn deep_copy(&self) -> Self {
        Self {
            image_ref: self.image_ref.deep_copy(),
            is_bundle: self.is_bundle,
        }
    }
}

/// Insertion-ordered references keyed by image string.
///
/// Adding an image that is already present replaces the stored entry in
/// place; new images are appended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageRefs {
    refs: Vec<ImageRef>,
}

impl ImageRefs {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append new images; replace the entry for images already present.
    pub fn add(&mut self, refs: impl IntoIterator<Item = ImageRef>) {
        for r in refs {
            match self.refs.iter_mut().find(|existing| existing.image() == r.image()) {
                Some(existing) => *existing = r.deep_copy(),
                None => self.refs.push(r),
            }
        }
    }

    /// Entry for `image`, matched on the full reference string.
    pub fn find(&self, image: &str) -> Option<&ImageRef> {
        self.refs.iter().find(|r| r.image() == image)
    }

    /// Every entry in insertion order.
    pub fn all(&self) -> &[ImageRef] {
        &self.refs
    }

    /// Number of distinct images.
    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    /// Independent copy; later changes to either side do not leak.
    pub fn deep_copy(&self) -> Self {
        let mut copy = Self::new();
        copy.add(self.refs.iter().map(ImageRef::deep_copy));
        copy
    }

    pub(crate) fn iter_mut(&mut self) -> std::slice::IterMut<'_, ImageRef> {
        self.refs.iter_mut()
    }
}

impl FromIterator<ImageRef> for ImageRefs {
    fn from_iter<I: IntoIterator<Item = ImageRef>>(iter: I) -> Self {
        let mut refs = Self::new();
        refs.add(iter);
        refs
    }
}
