use crate::error::SyncFault;
use crate::orphans::OrphanRegistry;
use crate::types::{Collection, CollectionIdentifier};
use std::collections::{BTreeSet, HashMap};

/// Ordering key of a node within its container: case-folded name, then exact
/// name, then identifier.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct SortKey {
    folded: String,
    name: String,
    pub(crate) id: CollectionIdentifier,
}

impl SortKey {
    pub(crate) fn new(name: &str, id: CollectionIdentifier) -> Self {
        Self {
            folded: name.to_lowercase(),
            name: name.to_string(),
            id,
        }
    }
}

/// Where a node currently lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Placement {
    Root,
    Child(CollectionIdentifier),
    Orphan,
}

#[derive(Clone, Debug)]
pub(crate) struct TreeNode {
    /// Declared parent from the row, independent of placement.
    pub(crate) parent: Option<CollectionIdentifier>,
    pub(crate) placement: Placement,
    pub(crate) sort_key: SortKey,
    pub(crate) children: BTreeSet<SortKey>,
}

/// How to treat an attachment that would put a node beneath its own descendant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CycleMode {
    /// Fail with [`SyncFault::CycleDetected`].
    Reject,
    /// Leave the node in the orphan registry.
    Quarantine,
}

/// The authoritative in-memory forest.
///
/// `nodes` is an arena keyed by identifier: every structural mutation updates
/// it together with the container it touches, so lookups never scan the tree.
/// Display data lives only in `collections`.
#[derive(Debug, Default, Clone)]
pub struct TreeIndex {
    roots: BTreeSet<SortKey>,
    nodes: HashMap<CollectionIdentifier, TreeNode>,
    collections: HashMap<CollectionIdentifier, Collection>,
    collapsed: HashMap<CollectionIdentifier, bool>,
    orphans: OrphanRegistry,
}

impl TreeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn clear(&mut self) {
        self.roots.clear();
        self.nodes.clear();
        self.collections.clear();
        self.collapsed.clear();
        self.orphans.clear();
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &CollectionIdentifier) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn collection(&self, id: &CollectionIdentifier) -> Option<&Collection> {
        self.collections.get(id)
    }

    pub(crate) fn collections(&self) -> &HashMap<CollectionIdentifier, Collection> {
        &self.collections
    }

    pub(crate) fn node_for(&self, id: &CollectionIdentifier) -> Option<&TreeNode> {
        self.nodes.get(id)
    }

    pub fn placement(&self, id: &CollectionIdentifier) -> Option<&Placement> {
        self.nodes.get(id).map(|node| &node.placement)
    }

    /// Structural parent. `None` for roots, orphans and unknown identifiers.
    pub fn parent_of(&self, id: &CollectionIdentifier) -> Option<&CollectionIdentifier> {
        match self.placement(id)? {
            Placement::Child(parent) => Some(parent),
            Placement::Root | Placement::Orphan => None,
        }
    }

    pub fn root_ids(&self) -> impl Iterator<Item = &CollectionIdentifier> {
        self.roots.iter().map(|key| &key.id)
    }

    pub fn child_ids(&self, id: &CollectionIdentifier) -> impl Iterator<Item = &CollectionIdentifier> {
        self.nodes
            .get(id)
            .into_iter()
            .flat_map(|node| node.children.iter().map(|key| &key.id))
    }

    /// Ancestors of `id`, nearest first, when `id` is reachable from the root
    /// set. `None` for unknown identifiers and nodes inside orphaned subtrees.
    pub fn visible_ancestors(&self, id: &CollectionIdentifier) -> Option<Vec<CollectionIdentifier>> {
        let mut ancestors = Vec::new();
        let mut current = id;
        loop {
            match &self.nodes.get(current)?.placement {
                Placement::Root => return Some(ancestors),
                Placement::Orphan => return None,
                Placement::Child(parent) => {
                    ancestors.push(parent.clone());
                    current = parent;
                }
            }
        }
    }

    /// Orphans whose parent is present. Attaching them would close a loop.
    pub fn looping_orphans(&self) -> impl Iterator<Item = &CollectionIdentifier> {
        self.orphans
            .iter()
            .filter(|(_, parent)| self.nodes.contains_key(*parent))
            .map(|(orphan, _)| orphan)
    }

    pub fn orphans(&self) -> &OrphanRegistry {
        &self.orphans
    }

    // === Collapsed state ===

    pub fn collapsed(&self) -> &HashMap<CollectionIdentifier, bool> {
        &self.collapsed
    }

    /// Returns whether the stored value changed.
    pub(crate) fn set_collapsed(&mut self, id: CollectionIdentifier, value: bool) -> bool {
        self.collapsed.insert(id, value) != Some(value)
    }

    pub(crate) fn remove_collapsed(&mut self, id: &CollectionIdentifier) -> bool {
        self.collapsed.remove(id).is_some()
    }

    // === Structural mutation ===

    /// Insert a node carrying `collection`, reusing `children` (a subtree kept
    /// across a modification). Places it as root, child or orphan and then
    /// reattaches any orphans that were waiting for it.
    pub(crate) fn insert(
        &mut self,
        collection: Collection,
        parent: Option<CollectionIdentifier>,
        children: BTreeSet<SortKey>,
        mode: CycleMode,
    ) -> Result<(), SyncFault> {
        let id = collection.identifier.clone();
        if self.nodes.contains_key(&id) {
            return Err(SyncFault::malformed(format!("{id} inserted twice")));
        }
        let sort_key = SortKey::new(&collection.name, id.clone());
        self.collections.insert(id.clone(), collection);
        self.nodes.insert(
            id.clone(),
            TreeNode {
                parent,
                placement: Placement::Orphan,
                sort_key,
                children,
            },
        );
        self.place(&id, mode)?;
        if self.orphans.is_awaited(&id) {
            self.attempt_resolve(mode)?;
        }
        Ok(())
    }

    fn place(&mut self, id: &CollectionIdentifier, mode: CycleMode) -> Result<(), SyncFault> {
        let Some(node) = self.nodes.get(id) else {
            return Ok(());
        };
        let (parent, sort_key) = (node.parent.clone(), node.sort_key.clone());
        match parent {
            None => {
                self.roots.insert(sort_key);
                self.set_placement(id, Placement::Root);
                Ok(())
            }
            Some(parent) if self.nodes.contains_key(&parent) => {
                if self.is_ancestor_or_self(id, &parent) {
                    self.orphan(id.clone(), parent);
                    return match mode {
                        CycleMode::Reject => Err(SyncFault::CycleDetected { key: id.clone() }),
                        CycleMode::Quarantine => {
                            tracing::warn!("Quarantining {} in orphan registry: parent chain loops", id);
                            Ok(())
                        }
                    };
                }
                self.attach(id, parent);
                Ok(())
            }
            Some(parent) => {
                self.orphan(id.clone(), parent);
                Ok(())
            }
        }
    }

    /// Reattach orphans whose parent is present, repeating until a pass makes
    /// no progress. Returns how many were reattached.
    pub(crate) fn attempt_resolve(&mut self, mode: CycleMode) -> Result<usize, SyncFault> {
        let mut resolved = 0;
        loop {
            let candidates = self.orphans.resolvable(|parent| self.nodes.contains_key(parent));
            let mut progressed = false;
            for (orphan, parent) in candidates {
                if self.is_ancestor_or_self(&orphan, &parent) {
                    match mode {
                        CycleMode::Reject => return Err(SyncFault::CycleDetected { key: orphan }),
                        CycleMode::Quarantine => continue,
                    }
                }
                self.orphans.remove(&orphan);
                self.attach(&orphan, parent);
                progressed = true;
                resolved += 1;
            }
            if !progressed {
                return Ok(resolved);
            }
        }
    }

    /// Remove `id` from its container and from the arena, handing back its
    /// data and its child set. The children still point at `id`; the caller
    /// either reinserts `id` or orphans them.
    pub(crate) fn detach(
        &mut self,
        id: &CollectionIdentifier,
    ) -> Option<(Collection, BTreeSet<SortKey>)> {
        let node = self.nodes.remove(id)?;
        match &node.placement {
            Placement::Root => {
                self.roots.remove(&node.sort_key);
            }
            Placement::Child(parent) => {
                if let Some(parent) = self.nodes.get_mut(parent) {
                    parent.children.remove(&node.sort_key);
                }
            }
            Placement::Orphan => {
                self.orphans.remove(id);
            }
        }
        let collection = self.collections.remove(id)?;
        Some((collection, node.children))
    }

    /// Delete `id`. Its direct children move to the orphan registry with their
    /// own subtrees intact. Returns false if `id` was unknown.
    pub(crate) fn delete(&mut self, id: &CollectionIdentifier) -> bool {
        self.remove_collapsed(id);
        let Some((_, children)) = self.detach(id) else {
            return false;
        };
        for child in children {
            self.orphan(child.id, id.clone());
        }
        true
    }

    fn attach(&mut self, id: &CollectionIdentifier, parent: CollectionIdentifier) {
        let Some(sort_key) = self.nodes.get(id).map(|node| node.sort_key.clone()) else {
            return;
        };
        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            parent_node.children.insert(sort_key);
        }
        self.set_placement(id, Placement::Child(parent));
    }

    fn orphan(&mut self, id: CollectionIdentifier, parent: CollectionIdentifier) {
        self.set_placement(&id, Placement::Orphan);
        self.orphans.insert(id, parent);
    }

    fn set_placement(&mut self, id: &CollectionIdentifier, placement: Placement) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.placement = placement;
        }
    }

    /// Whether `candidate` is `start` or one of its structural ancestors.
    fn is_ancestor_or_self(&self, candidate: &CollectionIdentifier, start: &CollectionIdentifier) -> bool {
        let mut current = start;
        loop {
            if current == candidate {
                return true;
            }
            match self.nodes.get(current).map(|node| &node.placement) {
                Some(Placement::Child(parent)) => current = parent,
                _ => return false,
            }
        }
    }

    /// Check that every node sits in exactly one container consistent with its
    /// placement. Intended for tests and debug assertions.
    pub fn verify_structure(&self) -> Result<(), String> {
        let mut seen: HashMap<&CollectionIdentifier, &'static str> = HashMap::new();

        for key in &self.roots {
            claim(&mut seen, &key.id, "root set")?;
            let node = self.nodes.get(&key.id).ok_or(format!("root {} not in arena", key.id))?;
            if node.placement != Placement::Root || node.sort_key != *key {
                return Err(format!("root {} has stale placement or sort key", key.id));
            }
        }
        for (id, node) in &self.nodes {
            for child in &node.children {
                claim(&mut seen, &child.id, "a child set")?;
                let child_node = self
                    .nodes
                    .get(&child.id)
                    .ok_or(format!("child {} of {id} not in arena", child.id))?;
                if child_node.placement != Placement::Child(id.clone()) {
                    return Err(format!("child {} of {id} has placement {:?}", child.id, child_node.placement));
                }
                if child_node.sort_key != *child {
                    return Err(format!("child {} of {id} has a stale sort key", child.id));
                }
            }
            if !self.collections.contains_key(id) {
                return Err(format!("{id} has no collection data"));
            }
        }
        for (orphan, parent) in self.orphans.iter() {
            claim(&mut seen, orphan, "orphan registry")?;
            let node = self.nodes.get(orphan).ok_or(format!("orphan {orphan} not in arena"))?;
            if node.placement != Placement::Orphan || node.parent.as_ref() != Some(parent) {
                return Err(format!("orphan {orphan} is inconsistent"));
            }
        }
        if seen.len() != self.nodes.len() {
            return Err(format!("{} nodes but {} owned", self.nodes.len(), seen.len()));
        }
        Ok(())
    }
}

fn claim<'a>(
    seen: &mut HashMap<&'a CollectionIdentifier, &'static str>,
    key: &'a CollectionIdentifier,
    owner: &'static str,
) -> Result<(), String> {
    match seen.insert(key, owner) {
        Some(previous) => Err(format!("{key} owned by both {previous} and {owner}")),
        None => Ok(()),
    }
}
