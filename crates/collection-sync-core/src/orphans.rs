use crate::types::CollectionIdentifier;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Nodes whose declared parent is not present in the tree.
///
/// Indexed both ways: orphan -> awaited parent, and awaited parent -> orphans,
/// so a resolution pass only visits parents that might have appeared.
#[derive(Debug, Default, Clone)]
pub struct OrphanRegistry {
    awaiting: HashMap<CollectionIdentifier, CollectionIdentifier>,
    waiters: BTreeMap<CollectionIdentifier, BTreeSet<CollectionIdentifier>>,
}

impl OrphanRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, orphan: CollectionIdentifier, parent: CollectionIdentifier) {
        if let Some(previous) = self.awaiting.insert(orphan.clone(), parent.clone()) {
            self.unlink(&orphan, &previous);
        }
        self.waiters.entry(parent).or_default().insert(orphan);
    }

    /// Returns the parent the orphan was waiting for.
    pub(crate) fn remove(&mut self, orphan: &CollectionIdentifier) -> Option<CollectionIdentifier> {
        let parent = self.awaiting.remove(orphan)?;
        self.unlink(orphan, &parent);
        Some(parent)
    }

    fn unlink(&mut self, orphan: &CollectionIdentifier, parent: &CollectionIdentifier) {
        if let Some(set) = self.waiters.get_mut(parent) {
            set.remove(orphan);
            if set.is_empty() {
                self.waiters.remove(parent);
            }
        }
    }

    pub fn contains(&self, orphan: &CollectionIdentifier) -> bool {
        self.awaiting.contains_key(orphan)
    }

    pub fn awaited_parent(&self, orphan: &CollectionIdentifier) -> Option<&CollectionIdentifier> {
        self.awaiting.get(orphan)
    }

    /// Whether any orphan is waiting for `parent`.
    pub fn is_awaited(&self, parent: &CollectionIdentifier) -> bool {
        self.waiters.contains_key(parent)
    }

    pub fn len(&self) -> usize {
        self.awaiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.awaiting.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CollectionIdentifier, &CollectionIdentifier)> {
        self.awaiting.iter()
    }

    /// `(orphan, parent)` pairs whose parent satisfies `present`, in a
    /// deterministic order.
    pub(crate) fn resolvable(
        &self,
        present: impl Fn(&CollectionIdentifier) -> bool,
    ) -> Vec<(CollectionIdentifier, CollectionIdentifier)> {
        self.waiters
            .iter()
            .filter(|(parent, _)| present(parent))
            .flat_map(|(parent, orphans)| {
                orphans
                    .iter()
                    .map(move |orphan| (orphan.clone(), parent.clone()))
            })
            .collect()
    }

    pub(crate) fn clear(&mut self) {
        self.awaiting.clear();
        self.waiters.clear();
    }
}
