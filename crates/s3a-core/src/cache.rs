//! Caller-owned memory of user intent between runs.
//!
//! Each edited entity has its own history mask, keyed by [`CacheKey`]. Runs
//! name their key explicitly, so switching to another component can never
//! pick up the previous component's history.

use std::collections::HashMap;

use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::component::{ComponentTable, InstanceId};

/// What a cached history belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheKey {
    /// A component already in the table.
    Component(InstanceId),
    /// A region being drawn that has no component yet.
    Unassigned,
}

impl From<InstanceId> for CacheKey {
    fn from(id: InstanceId) -> Self {
        Self::Component(id)
    }
}

/// History masks per [`CacheKey`].
///
/// Entries live until cleared. Each holds a full-image mask, so callers that
/// delete components should [`prune`](Self::prune) against the table
/// afterwards.
#[derive(Debug, Clone, Default)]
pub struct ProcessorCache {
    history: HashMap<CacheKey, Option<GrayImage>>,
}

impl ProcessorCache {
    /// An empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The remembered history mask for `key`, if any.
    #[must_use]
    pub fn history(&self, key: CacheKey) -> Option<&GrayImage> {
        self.history.get(&key).and_then(Option::as_ref)
    }

    /// Mutable slot for `key`, created empty on first use.
    pub fn slot(&mut self, key: CacheKey) -> &mut Option<GrayImage> {
        self.history.entry(key).or_default()
    }

    /// Whether the next run for `key` starts without history.
    #[must_use]
    pub fn is_first_run(&self, key: CacheKey) -> bool {
        self.history(key).is_none()
    }

    /// Forget the history for `key`.
    pub fn clear(&mut self, key: CacheKey) {
        if self.history.remove(&key).is_some() {
            tracing::debug!(?key, "cleared processing history");
        }
    }

    /// Forget every history.
    pub fn clear_all(&mut self) {
        self.history.clear();
    }

    /// Move the unassigned history to a newly created component.
    pub fn assign(&mut self, id: InstanceId) {
        if let Some(history) = self.history.remove(&CacheKey::Unassigned) {
            self.history.insert(CacheKey::Component(id), history);
        }
    }

    /// Drop histories of components no longer in `table`. The unassigned
    /// history is kept.
    pub fn prune(&mut self, table: &ComponentTable) {
        let before = self.history.len();
        self.history.retain(|key, _| match key {
            CacheKey::Component(id) => table.get(*id).is_some(),
            CacheKey::Unassigned => true,
        });
        let dropped = before - self.history.len();
        if dropped > 0 {
            tracing::debug!(dropped, "pruned histories of removed components");
        }
    }

    /// Number of keys with a stored history.
    #[must_use]
    pub fn len(&self) -> usize {
        self.history.values().filter(|h| h.is_some()).count()
    }

    /// Whether no key has a stored history.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::component::Component;
    use crate::geometry::XYVertices;

    #[test]
    fn keys_are_isolated() {
        let mut cache = ProcessorCache::new();
        let a = CacheKey::Component(InstanceId(1));
        let b = CacheKey::Component(InstanceId(2));
        *cache.slot(a) = Some(GrayImage::new(3, 3));
        assert!(!cache.is_first_run(a));
        assert!(cache.is_first_run(b));
        assert!(cache.history(CacheKey::Unassigned).is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn clear_resets_one_key() {
        let mut cache = ProcessorCache::new();
        *cache.slot(CacheKey::Unassigned) = Some(GrayImage::new(1, 1));
        *cache.slot(InstanceId(4).into()) = Some(GrayImage::new(1, 1));
        cache.clear(CacheKey::Unassigned);
        assert!(cache.is_first_run(CacheKey::Unassigned));
        assert_eq!(cache.len(), 1);
        cache.clear_all();
        assert!(cache.is_empty());
    }

    #[test]
    fn assign_moves_unassigned_history() {
        let mut cache = ProcessorCache::new();
        *cache.slot(CacheKey::Unassigned) = Some(GrayImage::new(2, 2));
        cache.assign(InstanceId(9));
        assert!(cache.is_first_run(CacheKey::Unassigned));
        assert!(!cache.is_first_run(CacheKey::Component(InstanceId(9))));
    }

    #[test]
    fn prune_drops_removed_components_only() {
        let mut table = ComponentTable::new();
        let square = XYVertices::from_pairs([(0.0, 0.0), (3.0, 0.0), (3.0, 3.0), (0.0, 3.0)]);
        table.add(vec![Component::new(square.clone().into()), Component::new(square.into())]);

        let mut cache = ProcessorCache::new();
        for key in [
            CacheKey::Component(InstanceId(0)),
            CacheKey::Component(InstanceId(1)),
            CacheKey::Unassigned,
        ] {
            *cache.slot(key) = Some(GrayImage::new(2, 2));
        }
        table.remove(&[InstanceId(1)]).unwrap();
        cache.prune(&table);

        assert!(!cache.is_first_run(CacheKey::Component(InstanceId(0))));
        assert!(cache.is_first_run(CacheKey::Component(InstanceId(1))));
        assert!(!cache.is_first_run(CacheKey::Unassigned));
        assert_eq!(cache.len(), 2);
    }
}
