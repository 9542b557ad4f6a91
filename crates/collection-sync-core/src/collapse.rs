use crate::notify::Changes;
use crate::tree_index::TreeIndex;
use crate::types::{Collection, CollectionIdentifier, CollectionRow};
use std::collections::HashMap;

/// Collapse writes made through the synchronizer that the store has not yet
/// echoed back, keyed per identifier.
#[derive(Debug, Default)]
pub struct PendingCollapseWrites {
    writes: HashMap<CollectionIdentifier, bool>,
}

impl PendingCollapseWrites {
    pub fn record(&mut self, id: CollectionIdentifier, value: bool) {
        self.writes.insert(id, value);
    }

    /// Consume the pending write for `id`, if any. Returns true when `row` is
    /// exactly the echo of that write: same collapsed value, and name and
    /// parent unchanged from `current`.
    pub fn take_echo(
        &mut self,
        id: &CollectionIdentifier,
        row: &CollectionRow,
        current: Option<&Collection>,
    ) -> bool {
        let Some(expected) = self.writes.remove(id) else {
            return false;
        };
        expected == row.collapsed && current.is_some_and(|collection| collection.matches_row(row))
    }

    pub fn forget(&mut self, id: &CollectionIdentifier) {
        self.writes.remove(id);
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.writes.clear();
    }
}

pub(crate) fn set_collapsed(
    index: &mut TreeIndex,
    echoes: &mut PendingCollapseWrites,
    id: CollectionIdentifier,
    value: bool,
) -> Changes {
    echoes.record(id.clone(), value);
    index.set_collapsed(id, value);
    Changes::COLLAPSED
}

/// Expand every ancestor of `target`. `None` when the target is not in the
/// visible tree, in which case nothing changed.
pub(crate) fn expand_ancestors_of(index: &mut TreeIndex, target: &CollectionIdentifier) -> Option<Changes> {
    let ancestors = index.visible_ancestors(target)?;
    for ancestor in ancestors {
        index.set_collapsed(ancestor, false);
    }
    Some(Changes::COLLAPSED)
}

/// Set every known collection to `value`.
pub(crate) fn set_all(index: &mut TreeIndex, value: bool) -> Changes {
    let ids: Vec<CollectionIdentifier> = index.collections().keys().cloned().collect();
    for id in ids {
        index.set_collapsed(id, value);
    }
    Changes::COLLAPSED
}

/// Collapsed unless explicitly expanded.
pub(crate) fn is_collapsed(index: &TreeIndex, id: &CollectionIdentifier) -> bool {
    index.collapsed().get(id) != Some(&false)
}
