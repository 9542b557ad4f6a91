//! Keeps a hierarchical, collapsible tree of collections in step with a store
//! that reports its changes as deletion, insertion and modification indices
//! over frozen row snapshots.
//!
//! [`CollectionTree`] is the synchronous core: it applies batches, resolves
//! out-of-order parents through an orphan registry and composes
//! [`TreeUpdate`]s. [`CollectionTreeSynchronizer`] wraps it in a single tokio
//! worker so batches are applied strictly in order while reads and collapse
//! commands stay synchronous.
//!
//! ```
//! use collection_sync_core::{Batch, CollectionRow, CollectionTree, SyncConfig};
//!
//! let mut tree = CollectionTree::new(SyncConfig::default());
//! let rows = vec![
//!     CollectionRow::new("B", Some("A"), "Child"),
//!     CollectionRow::new("A", None, "Parent"),
//! ];
//! let updates = tree.apply(Batch::initial(rows)).unwrap();
//! let snapshot = updates[0].tree.as_ref().unwrap();
//! assert_eq!(snapshot[0].collection.name, "Parent");
//! assert_eq!(snapshot[0].children[0].collection.name, "Child");
//! ```

pub mod collapse;
pub mod config;
pub mod error;
pub mod notify;
pub mod orphans;
pub mod processor;
pub mod snapshot;
pub mod synchronizer;
pub mod tree;
pub mod tree_index;
pub mod types;

pub use collapse::PendingCollapseWrites;
pub use config::SyncConfig;
pub use error::{SyncError, SyncFault};
pub use notify::{Changes, NotificationGate, TreeConsumer, TreeEvent, TreeUpdate, DEFAULT_UPDATE_THRESHOLD};
pub use orphans::OrphanRegistry;
pub use processor::{Batch, BatchRun, ChangeSet, ChangeSetProcessor};
pub use snapshot::{CollapsedSnapshot, ItemCounter, TreeSnapshot};
pub use synchronizer::CollectionTreeSynchronizer;
pub use tree::{BatchProgress, CollectionTree};
pub use tree_index::{Placement, TreeIndex};
pub use types::{
    Collection, CollectionIdentifier, CollectionItemWithChildren, CollectionRow, CustomLibraryType,
    CustomType, LibraryIdentifier,
};
