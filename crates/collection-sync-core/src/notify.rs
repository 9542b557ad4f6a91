use crate::error::SyncFault;
use crate::snapshot::{CollapsedSnapshot, TreeSnapshot};
use tokio::sync::mpsc;

pub const DEFAULT_UPDATE_THRESHOLD: usize = 200;

/// Payload delivered to the consumer. `None` fields mean "unchanged, do not
/// redraw that aspect"; both are delivered together when both changed.
#[derive(Clone, Debug, Default)]
pub struct TreeUpdate {
    pub tree: Option<TreeSnapshot>,
    pub collapsed: Option<CollapsedSnapshot>,
}

impl TreeUpdate {
    pub fn is_collapsed_only(&self) -> bool {
        self.tree.is_none() && self.collapsed.is_some()
    }
}

/// Receiver side of the synchronizer (the UI layer).
pub trait TreeConsumer: Send + Sync {
    fn on_change(&self, update: TreeUpdate);

    /// Called after a fault forced a rebuild from a complete snapshot. The
    /// rebuilt tree has already been delivered through `on_change`.
    fn on_resync(&self, _fault: &SyncFault) {}
}

#[derive(Clone, Debug)]
pub enum TreeEvent {
    Changed(TreeUpdate),
    Resynced(SyncFault),
}

impl TreeConsumer for mpsc::UnboundedSender<TreeEvent> {
    fn on_change(&self, update: TreeUpdate) {
        if let Err(e) = self.send(TreeEvent::Changed(update)) {
            tracing::error!("Tree consumer channel send failed (receiver dropped): {}", e);
        }
    }

    fn on_resync(&self, fault: &SyncFault) {
        if let Err(e) = self.send(TreeEvent::Resynced(fault.clone())) {
            tracing::error!("Tree consumer channel send failed (receiver dropped): {}", e);
        }
    }
}

/// Which aspects changed since the last emission.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Changes {
    pub tree: bool,
    pub collapsed: bool,
}

impl Changes {
    pub const TREE: Changes = Changes {
        tree: true,
        collapsed: false,
    };
    pub const COLLAPSED: Changes = Changes {
        tree: false,
        collapsed: true,
    };

    pub fn is_empty(&self) -> bool {
        !self.tree && !self.collapsed
    }

    pub fn merge(&mut self, other: Changes) {
        self.tree |= other.tree;
        self.collapsed |= other.collapsed;
    }
}

/// Decides when a batch emits and what the payload carries.
///
/// Counts processed entries and asks for an intermediate emission every
/// `threshold` entries so a large initial sync shows up early without a
/// rebuild per row.
#[derive(Debug)]
pub struct NotificationGate {
    threshold: usize,
    processed: usize,
    pending: Changes,
}

impl NotificationGate {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold: threshold.max(1),
            processed: 0,
            pending: Changes::default(),
        }
    }

    pub fn mark(&mut self, changes: Changes) {
        self.pending.merge(changes);
    }

    /// Record one processed entry. Returns true when an intermediate emission
    /// is due.
    pub fn record_processed(&mut self) -> bool {
        self.processed += 1;
        self.processed % self.threshold == 0
    }

    pub fn processed(&self) -> usize {
        self.processed
    }

    /// Take the pending changes, leaving the gate clean.
    pub fn take(&mut self) -> Changes {
        std::mem::take(&mut self.pending)
    }

    /// Assemble a payload for `changes`, building only what changed.
    /// Returns `None` when nothing changed.
    pub fn compose(
        changes: Changes,
        tree: impl FnOnce() -> TreeSnapshot,
        collapsed: impl FnOnce() -> CollapsedSnapshot,
    ) -> Option<TreeUpdate> {
        if changes.is_empty() {
            return None;
        }
        Some(TreeUpdate {
            tree: changes.tree.then(tree),
            collapsed: changes.collapsed.then(collapsed),
        })
    }
}
