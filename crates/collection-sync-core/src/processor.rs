use crate::collapse::PendingCollapseWrites;
use crate::error::SyncFault;
use crate::notify::{Changes, NotificationGate};
use crate::tree_index::{CycleMode, TreeIndex};
use crate::types::{Collection, CollectionIdentifier, CollectionRow};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// How a frozen row snapshot differs from the previous one.
///
/// Deletion indices refer to the previous list; insertion and modification
/// indices refer to the new snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChangeSet {
    /// The store has no change markers (first delivery): rebuild from every row.
    Initial,
    Update {
        deletions: Vec<usize>,
        insertions: Vec<usize>,
        modifications: Vec<usize>,
    },
}

impl ChangeSet {
    pub fn empty() -> Self {
        Self::Update {
            deletions: Vec::new(),
            insertions: Vec::new(),
            modifications: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Initial => false,
            Self::Update {
                deletions,
                insertions,
                modifications,
            } => deletions.is_empty() && insertions.is_empty() && modifications.is_empty(),
        }
    }

    /// Derive the change set that turns `old` into `new`.
    ///
    /// Rows present in both lists whose relative order changed are reported as
    /// a deletion plus an insertion, the way the store reports moves.
    pub fn between(old: &[CollectionRow], new: &[CollectionRow]) -> Self {
        let new_positions: HashMap<&str, usize> = new
            .iter()
            .enumerate()
            .map(|(idx, row)| (row.key.as_str(), idx))
            .collect();
        let old_positions: HashMap<&str, usize> = old
            .iter()
            .enumerate()
            .map(|(idx, row)| (row.key.as_str(), idx))
            .collect();

        // Survivors in old order, mapped to their new position.
        let survivors: Vec<(usize, usize)> = old
            .iter()
            .enumerate()
            .filter_map(|(old_idx, row)| new_positions.get(row.key.as_str()).map(|&new_idx| (old_idx, new_idx)))
            .collect();
        let new_order: Vec<usize> = survivors.iter().map(|&(_, new_idx)| new_idx).collect();
        let in_place = longest_increasing_run(&new_order);

        let mut moved_old = BTreeSet::new();
        let mut moved_new = BTreeSet::new();
        let mut modifications = Vec::new();
        for (&(old_idx, new_idx), keep) in survivors.iter().zip(in_place) {
            if !keep {
                moved_old.insert(old_idx);
                moved_new.insert(new_idx);
            } else if old[old_idx] != new[new_idx] {
                modifications.push(new_idx);
            }
        }

        let deletions = old
            .iter()
            .enumerate()
            .filter(|(idx, row)| !new_positions.contains_key(row.key.as_str()) || moved_old.contains(idx))
            .map(|(idx, _)| idx)
            .collect();
        let insertions = new
            .iter()
            .enumerate()
            .filter(|(idx, row)| !old_positions.contains_key(row.key.as_str()) || moved_new.contains(idx))
            .map(|(idx, _)| idx)
            .collect();
        modifications.sort_unstable();

        Self::Update {
            deletions,
            insertions,
            modifications,
        }
    }
}

/// Flags the elements of `seq` that form one longest strictly increasing
/// subsequence.
fn longest_increasing_run(seq: &[usize]) -> Vec<bool> {
    let mut tails: Vec<usize> = Vec::new();
    let mut prev: Vec<Option<usize>> = vec![None; seq.len()];
    for (i, &value) in seq.iter().enumerate() {
        let pos = tails.partition_point(|&t| seq[t] < value);
        if pos > 0 {
            prev[i] = Some(tails[pos - 1]);
        }
        if pos == tails.len() {
            tails.push(i);
        } else {
            tails[pos] = i;
        }
    }
    let mut keep = vec![false; seq.len()];
    let mut current = tails.last().copied();
    while let Some(i) = current {
        keep[i] = true;
        current = prev[i];
    }
    keep
}

/// A frozen row snapshot together with its change set.
#[derive(Clone, Debug)]
pub struct Batch {
    pub rows: Arc<[CollectionRow]>,
    pub change_set: ChangeSet,
}

impl Batch {
    pub fn new(rows: impl Into<Arc<[CollectionRow]>>, change_set: ChangeSet) -> Self {
        Self {
            rows: rows.into(),
            change_set,
        }
    }

    pub fn initial(rows: impl Into<Arc<[CollectionRow]>>) -> Self {
        Self::new(rows, ChangeSet::Initial)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Step {
    Delete(usize),
    Insert(usize),
    Modify(usize),
}

impl Step {
    /// Deletions are cheap and do not count towards the throttle.
    fn is_throttled(self) -> bool {
        !matches!(self, Step::Delete(_))
    }
}

/// In-flight application of one batch. Survives across lock releases so the
/// worker can hand out intermediate notifications between chunks.
#[derive(Debug)]
pub struct BatchRun {
    pub(crate) batch: Batch,
    steps: Vec<Step>,
    position: usize,
    reset_first: bool,
    pub(crate) gate: NotificationGate,
}

impl BatchRun {
    pub fn new(batch: Batch, update_threshold: usize) -> Self {
        let (steps, reset_first) = match &batch.change_set {
            ChangeSet::Initial => ((0..batch.rows.len()).map(Step::Insert).collect(), true),
            ChangeSet::Update {
                deletions,
                insertions,
                modifications,
            } => (plan(deletions, insertions, modifications), false),
        };
        Self {
            batch,
            steps,
            position: 0,
            reset_first,
            gate: NotificationGate::new(update_threshold),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.steps.is_empty() && !self.reset_first
    }

    pub(crate) fn take_reset(&mut self) -> bool {
        std::mem::take(&mut self.reset_first)
    }

    pub(crate) fn next_step(&mut self) -> Option<(Step, bool)> {
        let step = *self.steps.get(self.position)?;
        self.position += 1;
        Some((step, step.is_throttled()))
    }
}

/// Deletions descending, then insertions ascending, then modifications
/// ascending.
fn plan(deletions: &[usize], insertions: &[usize], modifications: &[usize]) -> Vec<Step> {
    let mut deletions = deletions.to_vec();
    deletions.sort_unstable_by(|a, b| b.cmp(a));
    deletions.dedup();
    let mut insertions = insertions.to_vec();
    insertions.sort_unstable();
    insertions.dedup();
    let mut modifications = modifications.to_vec();
    modifications.sort_unstable();
    modifications.dedup();

    deletions
        .into_iter()
        .map(Step::Delete)
        .chain(insertions.into_iter().map(Step::Insert))
        .chain(modifications.into_iter().map(Step::Modify))
        .collect()
}

/// Applies change-set entries to the tree index, keeping a list of
/// identifiers in lock-step with the store's own row list.
#[derive(Debug, Default)]
pub struct ChangeSetProcessor {
    rows: Vec<CollectionIdentifier>,
    /// Extra slots held by identifiers that appear more than once in the
    /// store's row list. Only the first occurrence lives in the index.
    duplicates: HashMap<CollectionIdentifier, usize>,
}

impl ChangeSetProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub(crate) fn reset(&mut self) {
        self.rows.clear();
        self.duplicates.clear();
    }

    pub(crate) fn reset_to(&mut self, rows: &[CollectionRow]) {
        self.rows = rows.iter().map(CollectionRow::identifier).collect();
        self.duplicates.clear();
        let mut seen = HashSet::with_capacity(self.rows.len());
        for id in &self.rows {
            if !seen.insert(id) {
                *self.duplicates.entry(id.clone()).or_default() += 1;
            }
        }
    }

    /// Drops one extra slot of `id`. Returns false when `id` has none left.
    fn release_duplicate(&mut self, id: &CollectionIdentifier) -> bool {
        match self.duplicates.get_mut(id) {
            Some(extra) if *extra > 1 => {
                *extra -= 1;
                true
            }
            Some(_) => {
                self.duplicates.remove(id);
                true
            }
            None => false,
        }
    }

    pub(crate) fn apply_step(
        &mut self,
        step: Step,
        rows: &[CollectionRow],
        index: &mut TreeIndex,
        echoes: &mut PendingCollapseWrites,
        counts_enabled: bool,
    ) -> Result<Changes, SyncFault> {
        match step {
            Step::Delete(idx) => {
                if idx >= self.rows.len() {
                    return Err(SyncFault::malformed(format!(
                        "deletion index {idx} out of bounds ({} rows)",
                        self.rows.len()
                    )));
                }
                let id = self.rows.remove(idx);
                if self.release_duplicate(&id) {
                    tracing::debug!("Released duplicate slot of {}", id);
                    return Ok(Changes::default());
                }
                index.delete(&id);
                echoes.forget(&id);
                Ok(Changes {
                    tree: true,
                    collapsed: true,
                })
            }
            Step::Insert(idx) => {
                let row = row_at(rows, idx, "insertion")?;
                if idx > self.rows.len() {
                    return Err(SyncFault::malformed(format!(
                        "insertion index {idx} beyond tracked rows ({})",
                        self.rows.len()
                    )));
                }
                let id = row.identifier();
                self.rows.insert(idx, id.clone());
                index.set_collapsed(id, row.collapsed);
                index.insert(Collection::from_row(row), row.parent_identifier(), BTreeSet::new(), CycleMode::Quarantine)?;
                Ok(Changes {
                    tree: true,
                    collapsed: true,
                })
            }
            Step::Modify(idx) => {
                let row = row_at(rows, idx, "modification")?;
                let id = row.identifier();
                if self.rows.get(idx) != Some(&id) {
                    return Err(SyncFault::malformed(format!(
                        "modification index {idx} does not point at {id}"
                    )));
                }
                if self.duplicates.contains_key(&id) && self.rows.iter().position(|tracked| tracked == &id) != Some(idx) {
                    // Only the first occurrence feeds the index.
                    return Ok(Changes::default());
                }
                if echoes.take_echo(&id, row, index.collection(&id)) {
                    tracing::debug!("Skipping collapse echo for {}", id);
                    return Ok(Changes::default());
                }

                let collapsed = index.set_collapsed(id.clone(), row.collapsed);
                let unchanged = index
                    .collection(&id)
                    .is_some_and(|current| current.matches_row(row));
                if unchanged {
                    // Same data; item counts may still have moved.
                    return Ok(Changes {
                        tree: counts_enabled,
                        collapsed,
                    });
                }

                let children = index.detach(&id).map(|(_, children)| children).unwrap_or_default();
                index.insert(Collection::from_row(row), row.parent_identifier(), children, CycleMode::Quarantine)?;
                Ok(Changes {
                    tree: true,
                    collapsed,
                })
            }
        }
    }

    /// The tracked list must mirror the snapshot once a batch is through.
    pub(crate) fn check_alignment(&self, rows: &[CollectionRow]) -> Result<(), SyncFault> {
        if self.rows.len() != rows.len() {
            return Err(SyncFault::malformed(format!(
                "tracked {} rows but snapshot has {}",
                self.rows.len(),
                rows.len()
            )));
        }
        if let Some(idx) = self
            .rows
            .iter()
            .zip(rows)
            .position(|(id, row)| id.key() != Some(row.key.as_str()))
        {
            return Err(SyncFault::malformed(format!("row {idx} diverged from snapshot")));
        }
        Ok(())
    }
}

fn row_at<'a>(rows: &'a [CollectionRow], idx: usize, what: &str) -> Result<&'a CollectionRow, SyncFault> {
    rows.get(idx).ok_or_else(|| {
        SyncFault::malformed(format!("{what} index {idx} out of bounds ({} rows)", rows.len()))
    })
}
