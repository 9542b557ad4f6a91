use anyhow::{Context, Result};
use collection_sync_core::{
    ChangeSet, CollapsedSnapshot, CollectionIdentifier, CollectionRow, CollectionTreeSynchronizer, ItemCounter,
    SyncConfig, TreeEvent, TreeSnapshot,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A replay script.
///
/// ```json
/// {
///   "item_counts": { "A": 3 },
///   "steps": [
///     { "op": "rows", "rows": [{ "key": "A", "name": "Papers" }] },
///     { "op": "set_collapsed", "key": "A", "collapsed": false }
///   ]
/// }
/// ```
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Script {
    #[serde(default)]
    pub item_counts: HashMap<String, usize>,
    pub steps: Vec<ScriptStep>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ScriptStep {
    /// A new frozen snapshot. Without `change`, the first snapshot is an
    /// initial delivery and later ones are diffed against their predecessor.
    Rows {
        rows: Vec<CollectionRow>,
        #[serde(default)]
        change: Option<ExplicitChange>,
    },
    Resync {
        rows: Vec<CollectionRow>,
    },
    SetCollapsed {
        key: String,
        collapsed: bool,
    },
    ExpandAncestorsOf {
        key: String,
    },
    ExpandAll,
    CollapseAll,
}

/// Change markers given verbatim, for scripts that exercise bad input.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExplicitChange {
    pub initial: bool,
    pub deletions: Vec<usize>,
    pub insertions: Vec<usize>,
    pub modifications: Vec<usize>,
}

impl ExplicitChange {
    fn into_change_set(self) -> ChangeSet {
        if self.initial {
            return ChangeSet::Initial;
        }
        ChangeSet::Update {
            deletions: self.deletions,
            insertions: self.insertions,
            modifications: self.modifications,
        }
    }
}

impl Script {
    pub fn load(path: &Path) -> Result<Self> {
        let input =
            std::fs::read_to_string(path).with_context(|| format!("failed to read script {}", path.display()))?;
        serde_json::from_str(&input).with_context(|| format!("invalid script {}", path.display()))
    }
}

/// What a consumer would be showing once the script has run.
pub struct Outcome {
    pub tree: TreeSnapshot,
    pub collapsed: CollapsedSnapshot,
    pub notifications: usize,
    pub resyncs: Vec<String>,
    pub orphans: usize,
}

impl Outcome {
    pub fn is_collapsed(&self, id: &CollectionIdentifier) -> bool {
        self.collapsed.get(id) != Some(&false)
    }
}

pub async fn replay(config: SyncConfig, script: Script) -> Result<Outcome> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let counter: Arc<dyn ItemCounter> = Arc::new(script.item_counts);
    let sync = CollectionTreeSynchronizer::init_with_counter(config, Arc::new(tx), Some(counter))?;

    let mut previous: Option<Vec<CollectionRow>> = None;
    for (n, step) in script.steps.into_iter().enumerate() {
        match step {
            ScriptStep::Rows { rows, change } => {
                let change_set = match (change, &previous) {
                    (Some(change), _) => change.into_change_set(),
                    (None, Some(previous)) => ChangeSet::between(previous, &rows),
                    (None, None) => ChangeSet::Initial,
                };
                sync.react_to_update(rows.clone(), change_set)
                    .with_context(|| format!("step {n}"))?;
                previous = Some(rows);
            }
            ScriptStep::Resync { rows } => {
                sync.resync(rows.clone()).with_context(|| format!("step {n}"))?;
                previous = Some(rows);
            }
            // Collapse commands act on the tree as of this step, so drain the
            // queue first.
            ScriptStep::SetCollapsed { key, collapsed } => {
                sync.flush().await?;
                sync.set_collapsed(CollectionIdentifier::collection(key), collapsed)?;
            }
            ScriptStep::ExpandAncestorsOf { key } => {
                sync.flush().await?;
                if !sync.expand_ancestors_of(&CollectionIdentifier::collection(key.as_str()))? {
                    tracing::warn!("Step {}: {} is not in the visible tree", n, key);
                }
            }
            ScriptStep::ExpandAll => {
                sync.flush().await?;
                sync.expand_all()?;
            }
            ScriptStep::CollapseAll => {
                sync.flush().await?;
                sync.collapse_all()?;
            }
        }
    }
    sync.flush().await?;

    let mut outcome = Outcome {
        tree: Arc::from(Vec::new()),
        collapsed: CollapsedSnapshot::default(),
        notifications: 0,
        resyncs: Vec::new(),
        orphans: sync.orphan_count()?,
    };
    while let Ok(event) = rx.try_recv() {
        match event {
            TreeEvent::Changed(update) => {
                outcome.notifications += 1;
                if let Some(tree) = update.tree {
                    outcome.tree = tree;
                }
                if let Some(collapsed) = update.collapsed {
                    outcome.collapsed = collapsed;
                }
            }
            TreeEvent::Resynced(fault) => outcome.resyncs.push(fault.to_string()),
        }
    }
    tracing::info!(
        "Replay finished: {} notifications, {} resyncs, {} orphans",
        outcome.notifications,
        outcome.resyncs.len(),
        outcome.orphans
    );
    Ok(outcome)
}
