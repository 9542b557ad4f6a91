use crate::tree_index::TreeIndex;
use crate::types::{CollectionIdentifier, CollectionItemWithChildren, LibraryIdentifier};
use std::collections::HashMap;
use std::sync::Arc;

/// Immutable projection of the visible forest, roots in display order.
pub type TreeSnapshot = Arc<[CollectionItemWithChildren]>;

/// Immutable copy of the collapsed map.
pub type CollapsedSnapshot = Arc<HashMap<CollectionIdentifier, bool>>;

/// Answers "how many items are directly assigned to this collection".
///
/// Implemented by the store; only consulted when item counts are enabled.
pub trait ItemCounter: Send + Sync {
    fn count_items(&self, library: &LibraryIdentifier, collection: &CollectionIdentifier) -> usize;
}

impl<F> ItemCounter for F
where
    F: Fn(&LibraryIdentifier, &CollectionIdentifier) -> usize + Send + Sync,
{
    fn count_items(&self, library: &LibraryIdentifier, collection: &CollectionIdentifier) -> usize {
        self(library, collection)
    }
}

/// Item counts keyed by collection key, for fixtures and replay scripts.
impl ItemCounter for HashMap<String, usize> {
    fn count_items(&self, _library: &LibraryIdentifier, collection: &CollectionIdentifier) -> usize {
        collection
            .key()
            .and_then(|key| self.get(key))
            .copied()
            .unwrap_or(0)
    }
}

/// Where item counts come from when a snapshot is built.
pub(crate) struct CountSource<'a> {
    pub library: &'a LibraryIdentifier,
    pub counter: &'a dyn ItemCounter,
}

/// Walk the root set and resolve every node's data from the flat collection
/// map. Orphaned subtrees are not part of the result.
pub(crate) fn build_snapshot(index: &TreeIndex, counts: Option<CountSource<'_>>) -> TreeSnapshot {
    index
        .root_ids()
        .filter_map(|id| build_item(index, id, counts.as_ref()))
        .collect()
}

fn build_item(
    index: &TreeIndex,
    id: &CollectionIdentifier,
    counts: Option<&CountSource<'_>>,
) -> Option<CollectionItemWithChildren> {
    let Some(current) = index.collections().get(id) else {
        tracing::warn!("No collection data for tree node {}, skipping", id);
        return None;
    };
    let mut collection = current.clone();
    if let Some(source) = counts {
        collection.item_count = Some(source.counter.count_items(source.library, id));
    }
    let children = index
        .child_ids(id)
        .filter_map(|child| build_item(index, child, counts))
        .collect();
    Some(CollectionItemWithChildren {
        collection,
        children,
    })
}
