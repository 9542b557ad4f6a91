use crate::collapse::{self, PendingCollapseWrites};
use crate::config::SyncConfig;
use crate::error::SyncFault;
use crate::notify::{Changes, NotificationGate, TreeUpdate};
use crate::processor::{Batch, BatchRun, ChangeSetProcessor};
use crate::snapshot::{build_snapshot, CollapsedSnapshot, CountSource, ItemCounter, TreeSnapshot};
use crate::tree_index::{CycleMode, TreeIndex};
use crate::types::{Collection, CollectionIdentifier, CollectionRow};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Outcome of one [`CollectionTree::resume`] call.
#[derive(Debug)]
pub enum BatchProgress {
    /// An intermediate notification is due; call `resume` again to continue.
    Yielded(TreeUpdate),
    /// The batch is through. `None` when nothing changed.
    Finished(Option<TreeUpdate>),
    /// The liveness check failed; the batch was abandoned part-way.
    Cancelled,
}

/// Synchronous state machine behind the synchronizer: tree index, orphan
/// registry, lock-step row list and pending collapse echoes.
///
/// Holds no locks and spawns nothing; the async wrapper decides when it runs.
pub struct CollectionTree {
    index: TreeIndex,
    processor: ChangeSetProcessor,
    echoes: PendingCollapseWrites,
    config: SyncConfig,
    counter: Option<Arc<dyn ItemCounter>>,
    /// Loops quarantined by the last rebuild; later batches do not fault on them.
    accepted_loops: BTreeSet<CollectionIdentifier>,
}

impl CollectionTree {
    pub fn new(config: SyncConfig) -> Self {
        Self::with_counter(config, None)
    }

    pub fn with_counter(config: SyncConfig, counter: Option<Arc<dyn ItemCounter>>) -> Self {
        if config.include_item_counts && counter.is_none() {
            tracing::warn!("Item counts enabled without an item counter; counts will be omitted");
        }
        Self {
            index: TreeIndex::new(),
            processor: ChangeSetProcessor::new(),
            echoes: PendingCollapseWrites::default(),
            config,
            counter,
            accepted_loops: BTreeSet::new(),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn index(&self) -> &TreeIndex {
        &self.index
    }

    fn counts_enabled(&self) -> bool {
        self.config.include_item_counts && self.counter.is_some()
    }

    // === Batches ===

    pub fn begin(&self, batch: Batch) -> BatchRun {
        BatchRun::new(batch, self.config.update_threshold)
    }

    /// Apply a whole batch, returning every notification it produced in order.
    pub fn apply(&mut self, batch: Batch) -> Result<Vec<TreeUpdate>, SyncFault> {
        let mut run = self.begin(batch);
        let mut updates = Vec::new();
        loop {
            match self.resume(&mut run, &|| true)? {
                BatchProgress::Yielded(update) => updates.push(update),
                BatchProgress::Finished(update) => {
                    updates.extend(update);
                    return Ok(updates);
                }
                BatchProgress::Cancelled => return Ok(updates),
            }
        }
    }

    /// Advance `run` until an intermediate notification is due or the batch
    /// ends. `is_live` is consulted before every entry.
    pub fn resume(
        &mut self,
        run: &mut BatchRun,
        is_live: &dyn Fn() -> bool,
    ) -> Result<BatchProgress, SyncFault> {
        if run.is_noop() {
            return Ok(BatchProgress::Finished(None));
        }
        if run.take_reset() {
            self.reset();
            run.gate.mark(Changes::TREE);
            run.gate.mark(Changes::COLLAPSED);
        }

        let counts_enabled = self.counts_enabled();
        let rows = Arc::clone(&run.batch.rows);
        while let Some((step, throttled)) = run.next_step() {
            if !is_live() {
                return Ok(BatchProgress::Cancelled);
            }
            let changes = self.processor.apply_step(
                step,
                &rows,
                &mut self.index,
                &mut self.echoes,
                counts_enabled,
            )?;
            run.gate.mark(changes);

            if throttled && run.gate.record_processed() {
                let pending = run.gate.take();
                if let Some(update) = self.emit(pending) {
                    return Ok(BatchProgress::Yielded(update));
                }
            }
        }
        if !is_live() {
            return Ok(BatchProgress::Cancelled);
        }

        self.processor.check_alignment(&rows)?;
        // Entries are placed in index order, so a reparent may briefly point
        // beneath its own subtree. Whatever still loops now is a real cycle.
        if self.index.attempt_resolve(CycleMode::Quarantine)? > 0 {
            run.gate.mark(Changes::TREE);
        }
        self.check_loops()?;
        tracing::debug!(
            "Applied batch: {} rows, {} entries processed, {} orphans pending",
            rows.len(),
            run.gate.processed(),
            self.index.orphans().len()
        );
        let pending = run.gate.take();
        Ok(BatchProgress::Finished(self.emit(pending)))
    }

    /// Fail on any loop that was not already accepted by the last rebuild.
    fn check_loops(&mut self) -> Result<(), SyncFault> {
        let looping: BTreeSet<CollectionIdentifier> = self.index.looping_orphans().cloned().collect();
        if let Some(key) = looping.difference(&self.accepted_loops).next() {
            return Err(SyncFault::CycleDetected { key: key.clone() });
        }
        self.accepted_loops = looping;
        Ok(())
    }

    /// Drop all incremental state and rebuild from a complete row snapshot.
    /// Rows that would close a parent cycle stay in the orphan registry.
    pub fn rebuild(&mut self, rows: &[CollectionRow]) -> TreeUpdate {
        self.reset();
        for row in rows {
            let id = row.identifier();
            if self.index.contains(&id) {
                tracing::warn!("Duplicate row {} in snapshot, keeping the first", id);
                continue;
            }
            self.index.set_collapsed(id, row.collapsed);
            if let Err(fault) = self.index.insert(
                Collection::from_row(row),
                row.parent_identifier(),
                BTreeSet::new(),
                CycleMode::Quarantine,
            ) {
                tracing::warn!("Rebuild skipped {}: {}", row.key, fault);
            }
        }
        // Every row keeps its slot, duplicates included, so later batches
        // stay aligned with the store's row list.
        self.processor.reset_to(rows);
        self.accepted_loops = self.index.looping_orphans().cloned().collect();
        self.full_update()
    }

    fn reset(&mut self) {
        self.index.clear();
        self.processor.reset();
        self.echoes.clear();
        self.accepted_loops.clear();
    }

    // === Snapshots and notifications ===

    pub fn snapshot(&self) -> TreeSnapshot {
        let counts = match (&self.counter, self.config.include_item_counts) {
            (Some(counter), true) => Some(CountSource {
                library: &self.config.library_id,
                counter: counter.as_ref(),
            }),
            _ => None,
        };
        build_snapshot(&self.index, counts)
    }

    pub fn collapsed_snapshot(&self) -> CollapsedSnapshot {
        Arc::new(self.index.collapsed().clone())
    }

    fn emit(&self, changes: Changes) -> Option<TreeUpdate> {
        NotificationGate::compose(changes, || self.snapshot(), || self.collapsed_snapshot())
    }

    pub fn full_update(&self) -> TreeUpdate {
        TreeUpdate {
            tree: Some(self.snapshot()),
            collapsed: Some(self.collapsed_snapshot()),
        }
    }

    // === Collapse control ===

    pub fn set_collapsed(&mut self, id: CollectionIdentifier, value: bool) -> TreeUpdate {
        let changes = collapse::set_collapsed(&mut self.index, &mut self.echoes, id, value);
        self.emit(changes).unwrap_or_default()
    }

    pub fn expand_ancestors_of(&mut self, target: &CollectionIdentifier) -> Option<TreeUpdate> {
        let changes = collapse::expand_ancestors_of(&mut self.index, target)?;
        self.emit(changes)
    }

    pub fn expand_all(&mut self) -> TreeUpdate {
        let changes = collapse::set_all(&mut self.index, false);
        self.emit(changes).unwrap_or_default()
    }

    pub fn collapse_all(&mut self) -> TreeUpdate {
        let changes = collapse::set_all(&mut self.index, true);
        self.emit(changes).unwrap_or_default()
    }

    pub fn is_collapsed(&self, id: &CollectionIdentifier) -> bool {
        collapse::is_collapsed(&self.index, id)
    }

    pub fn pending_collapse_writes(&self) -> usize {
        self.echoes.len()
    }

    // === Lookups ===

    pub fn collection(&self, id: &CollectionIdentifier) -> Option<&Collection> {
        self.index.collection(id)
    }

    pub fn parent_of(&self, id: &CollectionIdentifier) -> Option<&CollectionIdentifier> {
        self.index.parent_of(id)
    }

    pub fn orphan_count(&self) -> usize {
        self.index.orphans().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::ChangeSet;
    use crate::types::CollectionItemWithChildren;
    use std::collections::HashMap;

    fn row(key: &str, parent: Option<&str>, name: &str) -> CollectionRow {
        CollectionRow::new(key, parent, name)
    }

    fn id(key: &str) -> CollectionIdentifier {
        CollectionIdentifier::collection(key)
    }

    fn names(items: &[CollectionItemWithChildren]) -> Vec<String> {
        items.iter().map(|item| item.collection.name.clone()).collect()
    }

    fn insert_all(rows: &[CollectionRow]) -> ChangeSet {
        ChangeSet::Update {
            deletions: vec![],
            insertions: (0..rows.len()).collect(),
            modifications: vec![],
        }
    }

    // === Batches ===

    #[test]
    fn out_of_order_rows_in_one_batch_form_one_tree() {
        let rows = vec![
            row("C", Some("A"), "Cherry"),
            row("B", Some("A"), "Banana"),
            row("A", None, "Fruit"),
        ];
        let mut tree = CollectionTree::new(SyncConfig::default());
        let updates = tree.apply(Batch::new(rows.clone(), insert_all(&rows))).unwrap();

        let snapshot = updates.last().unwrap().tree.clone().unwrap();
        assert_eq!(names(&snapshot), vec!["Fruit"]);
        assert_eq!(names(&snapshot[0].children), vec!["Banana", "Cherry"]);
        assert_eq!(tree.orphan_count(), 0);
    }

    #[test]
    fn orphan_resolves_in_later_batch() {
        let mut tree = CollectionTree::new(SyncConfig::default());
        let v1 = vec![row("B", Some("A"), "Child")];
        tree.apply(Batch::new(v1.clone(), insert_all(&v1))).unwrap();
        assert_eq!(tree.orphan_count(), 1);
        assert!(tree.snapshot().is_empty());

        let v2 = vec![row("A", None, "Parent"), row("B", Some("A"), "Child")];
        tree.apply(Batch::new(v2.clone(), ChangeSet::between(&v1, &v2))).unwrap();
        assert_eq!(tree.orphan_count(), 0);
        let snapshot = tree.snapshot();
        assert_eq!(names(&snapshot[0].children), vec!["Child"]);
    }

    #[test]
    fn rename_preserves_subtree() {
        let mut tree = CollectionTree::new(SyncConfig::default());
        let v1 = vec![row("A", None, "Parent"), row("B", Some("A"), "Child")];
        tree.apply(Batch::initial(v1.clone())).unwrap();

        let v2 = vec![row("A", None, "Renamed"), row("B", Some("A"), "Child")];
        let updates = tree.apply(Batch::new(v2.clone(), ChangeSet::between(&v1, &v2))).unwrap();

        let snapshot = updates[0].tree.clone().unwrap();
        assert_eq!(names(&snapshot), vec!["Renamed"]);
        assert_eq!(names(&snapshot[0].children), vec!["Child"]);
    }

    #[test]
    fn empty_batch_emits_nothing() {
        let mut tree = CollectionTree::new(SyncConfig::default());
        let rows = vec![row("A", None, "Parent")];
        tree.apply(Batch::initial(rows.clone())).unwrap();
        let before = (tree.snapshot(), tree.collapsed_snapshot());

        let updates = tree.apply(Batch::new(rows, ChangeSet::empty())).unwrap();
        assert!(updates.is_empty());
        assert_eq!(before, (tree.snapshot(), tree.collapsed_snapshot()));
    }

    #[test]
    fn large_batches_yield_intermediate_snapshots() {
        let config = SyncConfig {
            update_threshold: 2,
            ..SyncConfig::default()
        };
        let rows: Vec<_> = (0..5).map(|i| row(&format!("k{i}"), None, &format!("n{i}"))).collect();
        let mut tree = CollectionTree::new(config);
        let updates = tree.apply(Batch::initial(rows)).unwrap();

        let sizes: Vec<usize> = updates.iter().map(|u| u.tree.as_ref().unwrap().len()).collect();
        assert_eq!(sizes, vec![2, 4, 5]);
    }

    #[test]
    fn cancelled_run_stops_before_next_entry() {
        let rows: Vec<_> = (0..3).map(|i| row(&format!("k{i}"), None, "n")).collect();
        let mut tree = CollectionTree::new(SyncConfig::default());
        let mut run = tree.begin(Batch::initial(rows));
        let progress = tree.resume(&mut run, &|| false).unwrap();
        assert!(matches!(progress, BatchProgress::Cancelled));
        assert!(tree.index().is_empty());
    }

    #[test]
    fn cancellation_after_first_chunks_stops_mid_batch() {
        let rows: Vec<_> = (0..5).map(|i| row(&format!("k{i}"), None, "n")).collect();
        let mut tree = CollectionTree::new(SyncConfig {
            update_threshold: 1,
            ..SyncConfig::default()
        });
        let checks = std::cell::Cell::new(0);
        let is_live = || {
            checks.set(checks.get() + 1);
            checks.get() < 3
        };

        let mut run = tree.begin(Batch::initial(rows));
        assert!(matches!(tree.resume(&mut run, &is_live).unwrap(), BatchProgress::Yielded(_)));
        assert!(matches!(tree.resume(&mut run, &is_live).unwrap(), BatchProgress::Yielded(_)));
        assert!(matches!(tree.resume(&mut run, &is_live).unwrap(), BatchProgress::Cancelled));
        assert_eq!(tree.index().len(), 2);
    }

    #[test]
    fn repeated_initial_batch_does_not_duplicate() {
        let rows = vec![row("A", None, "Parent"), row("B", Some("A"), "Child")];
        let mut tree = CollectionTree::new(SyncConfig::default());
        tree.apply(Batch::initial(rows.clone())).unwrap();
        tree.apply(Batch::initial(rows)).unwrap();
        assert_eq!(tree.index().len(), 2);
        tree.index().verify_structure().unwrap();
    }

    // === Collapse and echoes ===

    #[test]
    fn collapse_echo_is_suppressed_once() {
        let mut rows = vec![row("A", None, "Parent")];
        let mut tree = CollectionTree::new(SyncConfig::default());
        tree.apply(Batch::initial(rows.clone())).unwrap();

        let update = tree.set_collapsed(id("A"), false);
        assert!(update.is_collapsed_only());
        assert_eq!(tree.pending_collapse_writes(), 1);

        rows[0].collapsed = false;
        let modified = ChangeSet::Update {
            deletions: vec![],
            insertions: vec![],
            modifications: vec![0],
        };
        let updates = tree.apply(Batch::new(rows.clone(), modified.clone())).unwrap();
        assert!(updates.is_empty());
        assert_eq!(tree.pending_collapse_writes(), 0);

        // A second identical modification is no longer an echo.
        rows[0].name = "Renamed".into();
        let updates = tree.apply(Batch::new(rows, modified)).unwrap();
        assert_eq!(updates.len(), 1);
        assert!(updates[0].tree.is_some());
    }

    #[test]
    fn expand_ancestors_is_collapse_only() {
        let rows = vec![
            row("root", None, "Root"),
            row("mid", Some("root"), "Mid"),
            row("leaf", Some("mid"), "Leaf"),
        ];
        let mut tree = CollectionTree::new(SyncConfig::default());
        tree.apply(Batch::initial(rows)).unwrap();
        let shape = tree.snapshot();

        let update = tree.expand_ancestors_of(&id("leaf")).unwrap();
        assert!(update.is_collapsed_only());
        let collapsed = update.collapsed.unwrap();
        assert_eq!(collapsed.get(&id("root")), Some(&false));
        assert_eq!(collapsed.get(&id("mid")), Some(&false));
        assert_eq!(collapsed.get(&id("leaf")), Some(&true));
        assert_eq!(tree.snapshot(), shape);

        assert!(tree.expand_ancestors_of(&id("missing")).is_none());
    }

    #[test]
    fn expand_and_collapse_all() {
        let rows = vec![row("A", None, "a"), row("B", Some("A"), "b")];
        let mut tree = CollectionTree::new(SyncConfig::default());
        tree.apply(Batch::initial(rows)).unwrap();

        tree.expand_all();
        assert!(!tree.is_collapsed(&id("A")) && !tree.is_collapsed(&id("B")));
        tree.collapse_all();
        assert!(tree.is_collapsed(&id("A")) && tree.is_collapsed(&id("B")));
    }

    // === Recovery ===

    #[test]
    fn rebuild_quarantines_cycles() {
        let rows = vec![
            row("A", Some("B"), "a"),
            row("B", Some("A"), "b"),
            row("C", None, "c"),
        ];
        let mut tree = CollectionTree::new(SyncConfig::default());
        assert!(matches!(
            tree.apply(Batch::initial(rows.clone())),
            Err(SyncFault::CycleDetected { .. })
        ));

        let update = tree.rebuild(&rows);
        assert_eq!(names(&update.tree.unwrap()), vec!["c"]);
        assert_eq!(tree.orphan_count(), 1);
        tree.index().verify_structure().unwrap();

        // The store still loops; unrelated batches go through.
        let mut next = rows.clone();
        next.push(row("D", None, "d"));
        tree.apply(Batch::new(next.clone(), ChangeSet::between(&rows, &next))).unwrap();
        assert_eq!(names(&tree.snapshot()), vec!["c", "d"]);

        // Breaking the loop brings both nodes back.
        let mut fixed = next.clone();
        fixed[0].parent_key = None;
        tree.apply(Batch::new(fixed.clone(), ChangeSet::between(&next, &fixed))).unwrap();
        assert_eq!(names(&tree.snapshot()), vec!["a", "c", "d"]);
        assert_eq!(tree.orphan_count(), 0);
    }

    #[test]
    fn rebuild_with_duplicate_rows_stays_aligned() {
        let rows = vec![row("A", None, "a"), row("B", None, "b"), row("A", None, "a")];
        let mut tree = CollectionTree::new(SyncConfig::default());
        tree.rebuild(&rows);
        assert_eq!(names(&tree.snapshot()), vec!["a", "b"]);

        let mut grown = rows.clone();
        grown.push(row("C", None, "c"));
        let insert_c = ChangeSet::Update {
            deletions: vec![],
            insertions: vec![3],
            modifications: vec![],
        };
        tree.apply(Batch::new(grown.clone(), insert_c)).unwrap();
        assert_eq!(names(&tree.snapshot()), vec!["a", "b", "c"]);

        // Dropping the second A releases its slot and keeps the node.
        let deduped = vec![row("A", None, "a"), row("B", None, "b"), row("C", None, "c")];
        let drop_second_a = ChangeSet::Update {
            deletions: vec![2],
            insertions: vec![],
            modifications: vec![],
        };
        tree.apply(Batch::new(deduped, drop_second_a)).unwrap();
        assert_eq!(names(&tree.snapshot()), vec!["a", "b", "c"]);
        tree.index().verify_structure().unwrap();
    }

    #[test]
    fn reparent_through_own_subtree_within_one_batch() {
        // W is processed before P, so it briefly points beneath itself.
        let old = vec![row("W", None, "w"), row("P", Some("W"), "p")];
        let new = vec![row("W", Some("X"), "w"), row("P", None, "p"), row("X", Some("P"), "x")];
        let mut tree = CollectionTree::new(SyncConfig::default());
        tree.apply(Batch::initial(old.clone())).unwrap();
        tree.apply(Batch::new(new.clone(), ChangeSet::between(&old, &new))).unwrap();

        assert_eq!(tree.parent_of(&id("W")), Some(&id("X")));
        assert_eq!(tree.parent_of(&id("X")), Some(&id("P")));
        assert_eq!(tree.orphan_count(), 0);
        tree.index().verify_structure().unwrap();
    }

    #[test]
    fn item_counts_come_from_counter() {
        let counts: HashMap<String, usize> = [("A".to_string(), 9)].into();
        let config = SyncConfig {
            include_item_counts: true,
            ..SyncConfig::default()
        };
        let mut tree = CollectionTree::with_counter(config, Some(Arc::new(counts)));
        tree.apply(Batch::initial(vec![row("A", None, "a")])).unwrap();
        assert_eq!(tree.snapshot()[0].collection.item_count, Some(9));
        assert_eq!(tree.collection(&id("A")).unwrap().item_count, None);
    }
}
