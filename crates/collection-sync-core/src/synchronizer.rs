use crate::config::SyncConfig;
use crate::error::{SyncError, SyncFault};
use crate::notify::{TreeConsumer, TreeUpdate};
use crate::processor::{Batch, ChangeSet};
use crate::snapshot::{ItemCounter, TreeSnapshot};
use crate::tree::{BatchProgress, CollectionTree};
use crate::types::{Collection, CollectionIdentifier, CollectionRow};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

enum Command {
    Apply(Batch),
    Resync(Arc<[CollectionRow]>),
    Flush(oneshot::Sender<()>),
}

struct Shared {
    tree: Mutex<CollectionTree>,
    /// Held from a state change until its notification has been delivered,
    /// so the consumer sees updates in the order the state changed. Taken
    /// before `tree`.
    delivery: Mutex<()>,
    consumer: Arc<dyn TreeConsumer>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, CollectionTree> {
        self.tree.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn delivery(&self) -> MutexGuard<'_, ()> {
        self.delivery.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `change` under the state lock and deliver its update before any
    /// later change can deliver. The state lock is released first, so the
    /// consumer may read back.
    fn commit<R>(&self, change: impl FnOnce(&mut CollectionTree) -> (Option<TreeUpdate>, R)) -> R {
        let _delivery = self.delivery();
        let (update, result) = change(&mut *self.lock());
        if let Some(update) = update {
            self.consumer.on_change(update);
        }
        result
    }

    /// Apply one batch in chunks. Locks are held for one chunk at a time and
    /// released before yielding to the runtime.
    async fn apply_batch(&self, batch: Batch, cancel: &CancellationToken) {
        let rows = Arc::clone(&batch.rows);
        let mut run = self.lock().begin(batch);
        let is_live = || !cancel.is_cancelled();
        loop {
            let done = {
                let _delivery = self.delivery();
                let progress = self.lock().resume(&mut run, &is_live);
                match progress {
                    Ok(BatchProgress::Yielded(update)) => {
                        self.consumer.on_change(update);
                        false
                    }
                    Ok(BatchProgress::Finished(update)) => {
                        if let Some(update) = update {
                            self.consumer.on_change(update);
                        }
                        true
                    }
                    Ok(BatchProgress::Cancelled) => {
                        tracing::info!("Abandoning batch of {} rows: synchronizer cancelled", rows.len());
                        true
                    }
                    Err(fault) => {
                        tracing::warn!("Batch fault, rebuilding tree from {} rows: {}", rows.len(), fault);
                        let update = self.lock().rebuild(&rows);
                        self.consumer.on_change(update);
                        self.consumer.on_resync(&fault);
                        true
                    }
                }
            };
            if done {
                return;
            }
            tokio::task::yield_now().await;
        }
    }

    fn resync(&self, rows: &[CollectionRow]) {
        tracing::info!("Resyncing tree from {} rows", rows.len());
        self.commit(|tree| (Some(tree.rebuild(rows)), ()));
    }
}

/// Background worker that applies queued commands strictly in submission
/// order. Exits when the synchronizer is cancelled or dropped.
async fn run_worker(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<Command>, cancel: CancellationToken) {
    tracing::info!("Collection tree worker started");
    loop {
        let command = tokio::select! {
            _ = cancel.cancelled() => break,
            command = rx.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };
        match command {
            Command::Apply(batch) => shared.apply_batch(batch, &cancel).await,
            Command::Resync(rows) => shared.resync(&rows),
            Command::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    tracing::info!("Collection tree worker stopped");
}

/// Keeps a collapsible collection tree in step with a store that reports
/// changes as index sets over frozen row snapshots.
///
/// Writes go through a single worker task; reads and collapse commands take
/// the same lock, so the consumer never observes a half-applied entry.
/// Notifications arrive in the order the state changed. `on_change` may call
/// the read methods but not the mutating ones.
pub struct CollectionTreeSynchronizer {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
}

impl CollectionTreeSynchronizer {
    /// Start the worker on the current tokio runtime.
    pub fn init(config: SyncConfig, consumer: Arc<dyn TreeConsumer>) -> Result<Self, SyncError> {
        Self::init_with_counter(config, consumer, None)
    }

    pub fn init_with_counter(
        config: SyncConfig,
        consumer: Arc<dyn TreeConsumer>,
        counter: Option<Arc<dyn ItemCounter>>,
    ) -> Result<Self, SyncError> {
        let runtime = Handle::try_current()?;
        let shared = Arc::new(Shared {
            tree: Mutex::new(CollectionTree::with_counter(config, counter)),
            delivery: Mutex::new(()),
            consumer,
        });
        let (commands, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        runtime.spawn(run_worker(Arc::clone(&shared), rx, cancel.clone()));
        Ok(Self {
            shared,
            commands,
            cancel,
        })
    }

    fn ensure_live(&self) -> Result<(), SyncError> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }

    fn send(&self, command: Command) -> Result<(), SyncError> {
        self.ensure_live()?;
        self.commands.send(command).map_err(|_| SyncError::Cancelled)
    }

    // === Writes (queued) ===

    /// Queue a batch. Returns immediately.
    pub fn submit(&self, batch: Batch) -> Result<(), SyncError> {
        self.send(Command::Apply(batch))
    }

    /// Queue the store's notification for `rows`.
    pub fn react_to_update(
        &self,
        rows: impl Into<Arc<[CollectionRow]>>,
        change_set: ChangeSet,
    ) -> Result<(), SyncError> {
        self.submit(Batch::new(rows, change_set))
    }

    /// Queue a full rebuild from a complete snapshot.
    pub fn resync(&self, rows: impl Into<Arc<[CollectionRow]>>) -> Result<(), SyncError> {
        self.send(Command::Resync(rows.into()))
    }

    /// Resolves once everything queued before it has been applied and
    /// delivered.
    pub async fn flush(&self) -> Result<(), SyncError> {
        let (done, wait) = oneshot::channel();
        self.send(Command::Flush(done))?;
        wait.await.map_err(|_| SyncError::Cancelled)
    }

    // === Collapse control (synchronous) ===

    pub fn set_collapsed(&self, id: CollectionIdentifier, value: bool) -> Result<(), SyncError> {
        self.ensure_live()?;
        self.shared.commit(|tree| (Some(tree.set_collapsed(id, value)), ()));
        Ok(())
    }

    /// Returns false when the target is not in the visible tree.
    pub fn expand_ancestors_of(&self, target: &CollectionIdentifier) -> Result<bool, SyncError> {
        self.ensure_live()?;
        Ok(self.shared.commit(|tree| {
            let update = tree.expand_ancestors_of(target);
            let found = update.is_some();
            (update, found)
        }))
    }

    pub fn expand_all(&self) -> Result<(), SyncError> {
        self.ensure_live()?;
        self.shared.commit(|tree| (Some(tree.expand_all()), ()));
        Ok(())
    }

    pub fn collapse_all(&self) -> Result<(), SyncError> {
        self.ensure_live()?;
        self.shared.commit(|tree| (Some(tree.collapse_all()), ()));
        Ok(())
    }

    // === Reads ===

    pub fn get_collection(&self, id: &CollectionIdentifier) -> Result<Option<Collection>, SyncError> {
        self.ensure_live()?;
        Ok(self.shared.lock().collection(id).cloned())
    }

    pub fn parent_of(&self, id: &CollectionIdentifier) -> Result<Option<CollectionIdentifier>, SyncError> {
        self.ensure_live()?;
        Ok(self.shared.lock().parent_of(id).cloned())
    }

    pub fn is_collapsed(&self, id: &CollectionIdentifier) -> Result<bool, SyncError> {
        self.ensure_live()?;
        Ok(self.shared.lock().is_collapsed(id))
    }

    pub fn snapshot(&self) -> Result<TreeSnapshot, SyncError> {
        self.ensure_live()?;
        Ok(self.shared.lock().snapshot())
    }

    pub fn orphan_count(&self) -> Result<usize, SyncError> {
        self.ensure_live()?;
        Ok(self.shared.lock().orphan_count())
    }

    // === Lifecycle ===

    /// Stop the worker. Any in-flight batch is abandoned at its next entry and
    /// every later call returns [`SyncError::Cancelled`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for CollectionTreeSynchronizer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::TreeEvent;
    use crate::snapshot::CollapsedSnapshot;
    use std::sync::{OnceLock, Weak};
    use std::time::Duration;

    fn row(key: &str, parent: Option<&str>, name: &str) -> CollectionRow {
        CollectionRow::new(key, parent, name)
    }

    fn id(key: &str) -> CollectionIdentifier {
        CollectionIdentifier::collection(key)
    }

    fn start() -> (CollectionTreeSynchronizer, mpsc::UnboundedReceiver<TreeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (CollectionTreeSynchronizer::init(SyncConfig::default(), Arc::new(tx)).unwrap(), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<TreeEvent>) -> Vec<TreeEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    // === Batches ===

    #[tokio::test]
    async fn initial_batch_delivers_tree() {
        let (sync, mut rx) = start();
        sync.submit(Batch::initial(vec![row("A", None, "Alpha"), row("B", Some("A"), "Beta")]))
            .unwrap();
        sync.flush().await.unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        let TreeEvent::Changed(update) = &events[0] else {
            panic!("expected a change, got {:?}", events[0]);
        };
        let tree = update.tree.as_ref().unwrap();
        assert_eq!(tree[0].children[0].collection.name, "Beta");
        assert!(update.collapsed.is_some());
        assert_eq!(sync.parent_of(&id("B")).unwrap(), Some(id("A")));
    }

    #[tokio::test]
    async fn batches_apply_in_submission_order() {
        let (sync, _rx) = start();
        let mut previous: Vec<CollectionRow> = Vec::new();
        sync.submit(Batch::initial(previous.clone())).unwrap();
        for i in 0..20 {
            let mut next = previous.clone();
            next.push(row(&format!("k{i}"), None, &format!("name {i}")));
            sync.react_to_update(next.clone(), ChangeSet::between(&previous, &next))
                .unwrap();
            previous = next;
        }
        sync.flush().await.unwrap();
        assert_eq!(sync.snapshot().unwrap().len(), 20);
    }

    #[tokio::test]
    async fn empty_update_is_silent() {
        let (sync, mut rx) = start();
        let rows = vec![row("A", None, "Alpha")];
        sync.submit(Batch::initial(rows.clone())).unwrap();
        sync.flush().await.unwrap();
        drain(&mut rx);

        sync.submit(Batch::new(rows, ChangeSet::empty())).unwrap();
        sync.flush().await.unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    // === Collapse ===

    #[tokio::test]
    async fn collapse_toggle_is_collapsed_only() {
        let (sync, mut rx) = start();
        sync.submit(Batch::initial(vec![row("A", None, "Alpha")])).unwrap();
        sync.flush().await.unwrap();
        drain(&mut rx);

        sync.set_collapsed(id("A"), false).unwrap();
        let events = drain(&mut rx);
        assert!(matches!(&events[..], [TreeEvent::Changed(update)] if update.is_collapsed_only()));
        assert!(!sync.is_collapsed(&id("A")).unwrap());

        assert!(!sync.expand_ancestors_of(&id("missing")).unwrap());
        assert!(drain(&mut rx).is_empty());
    }

    // === Faults ===

    #[tokio::test]
    async fn malformed_batch_triggers_resync() {
        let (sync, mut rx) = start();
        let rows = vec![row("A", None, "Alpha"), row("B", None, "Beta")];
        let bogus = ChangeSet::Update {
            deletions: vec![7],
            insertions: vec![],
            modifications: vec![],
        };
        sync.submit(Batch::new(rows, bogus)).unwrap();
        sync.flush().await.unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2, "{events:?}");
        let TreeEvent::Changed(TreeUpdate { tree: Some(tree), .. }) = &events[0] else {
            panic!("expected rebuilt tree first");
        };
        assert_eq!(tree.len(), 2);
        assert!(matches!(events[1], TreeEvent::Resynced(SyncFault::MalformedBatch { .. })));
    }

    #[tokio::test]
    async fn cycle_triggers_resync() {
        let (sync, mut rx) = start();
        sync.submit(Batch::initial(vec![row("A", Some("B"), "a"), row("B", Some("A"), "b")]))
            .unwrap();
        sync.flush().await.unwrap();

        let events = drain(&mut rx);
        assert!(matches!(events.last(), Some(TreeEvent::Resynced(SyncFault::CycleDetected { .. }))));
        assert_eq!(sync.orphan_count().unwrap(), 1);
    }

    // === Lifecycle ===

    #[tokio::test]
    async fn cancelled_synchronizer_rejects_calls() {
        let (sync, _rx) = start();
        sync.cancel();
        assert!(sync.is_cancelled());
        assert!(matches!(sync.submit(Batch::initial(vec![])), Err(SyncError::Cancelled)));
        assert!(matches!(sync.get_collection(&id("A")), Err(SyncError::Cancelled)));
        assert!(matches!(sync.set_collapsed(id("A"), true), Err(SyncError::Cancelled)));
        assert!(matches!(sync.flush().await, Err(SyncError::Cancelled)));
    }

    struct Reentrant {
        sync: OnceLock<Weak<CollectionTreeSynchronizer>>,
        seen: Mutex<Vec<Option<String>>>,
    }

    impl TreeConsumer for Reentrant {
        fn on_change(&self, _update: TreeUpdate) {
            let Some(sync) = self.sync.get().and_then(Weak::upgrade) else {
                return;
            };
            let name = sync.get_collection(&id("A")).ok().flatten().map(|c| c.name);
            self.seen.lock().unwrap().push(name);
        }
    }

    #[tokio::test]
    async fn consumer_may_read_back_during_notification() {
        let consumer = Arc::new(Reentrant {
            sync: OnceLock::new(),
            seen: Mutex::new(Vec::new()),
        });
        let sync = Arc::new(CollectionTreeSynchronizer::init(SyncConfig::default(), consumer.clone()).unwrap());
        let _ = consumer.sync.set(Arc::downgrade(&sync));

        sync.submit(Batch::initial(vec![row("A", None, "Alpha")])).unwrap();
        sync.flush().await.unwrap();
        assert_eq!(*consumer.seen.lock().unwrap(), vec![Some("Alpha".to_string())]);
    }

    #[test]
    fn init_outside_runtime_is_an_error() {
        let (tx, _rx) = mpsc::unbounded_channel::<TreeEvent>();
        let result = CollectionTreeSynchronizer::init(SyncConfig::default(), Arc::new(tx));
        assert!(matches!(result, Err(SyncError::NoRuntime(_))));
    }

    struct CancelOnFirstUpdate {
        sync: OnceLock<Weak<CollectionTreeSynchronizer>>,
        updates: Mutex<usize>,
    }

    impl TreeConsumer for CancelOnFirstUpdate {
        fn on_change(&self, _update: TreeUpdate) {
            let mut updates = self.updates.lock().unwrap();
            *updates += 1;
            if *updates == 1 {
                if let Some(sync) = self.sync.get().and_then(Weak::upgrade) {
                    sync.cancel();
                }
            }
        }
    }

    #[tokio::test]
    async fn cancel_mid_batch_abandons_remaining_entries() {
        let consumer = Arc::new(CancelOnFirstUpdate {
            sync: OnceLock::new(),
            updates: Mutex::new(0),
        });
        let config = SyncConfig {
            update_threshold: 1,
            ..SyncConfig::default()
        };
        let sync = Arc::new(CollectionTreeSynchronizer::init(config, consumer.clone()).unwrap());
        let _ = consumer.sync.set(Arc::downgrade(&sync));

        let rows: Vec<CollectionRow> = (0..5).map(|i| row(&format!("k{i}"), None, "name")).collect();
        sync.submit(Batch::initial(rows)).unwrap();
        // Either answered or dropped by the stopping worker; both mean the
        // batch is no longer running.
        let _ = sync.flush().await;

        assert_eq!(*consumer.updates.lock().unwrap(), 1);
        assert!(sync.is_cancelled());
        assert!(matches!(sync.submit(Batch::initial(vec![])), Err(SyncError::Cancelled)));
        assert!(matches!(sync.snapshot(), Err(SyncError::Cancelled)));
        assert!(matches!(sync.get_collection(&id("k0")), Err(SyncError::Cancelled)));
    }

    /// Records the latest collapsed map it was sent. On the first tree update
    /// it starts a collapse toggle on another thread and stalls, so the toggle
    /// races the delivery in flight.
    struct LatestView {
        sync: OnceLock<Weak<CollectionTreeSynchronizer>>,
        collapsed: Mutex<Option<CollapsedSnapshot>>,
        toggler: Mutex<Option<std::thread::JoinHandle<()>>>,
    }

    impl TreeConsumer for LatestView {
        fn on_change(&self, update: TreeUpdate) {
            if update.tree.is_some() {
                if let Some(sync) = self.sync.get().and_then(Weak::upgrade) {
                    let toggler = std::thread::spawn(move || {
                        let _ = sync.set_collapsed(id("A"), false);
                    });
                    *self.toggler.lock().unwrap() = Some(toggler);
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
            if let Some(collapsed) = update.collapsed {
                *self.collapsed.lock().unwrap() = Some(collapsed);
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn collapse_during_delivery_is_not_overwritten() {
        let consumer = Arc::new(LatestView {
            sync: OnceLock::new(),
            collapsed: Mutex::new(None),
            toggler: Mutex::new(None),
        });
        let sync = Arc::new(CollectionTreeSynchronizer::init(SyncConfig::default(), consumer.clone()).unwrap());
        let _ = consumer.sync.set(Arc::downgrade(&sync));

        sync.submit(Batch::initial(vec![row("A", None, "Alpha")])).unwrap();
        sync.flush().await.unwrap();
        let toggler = consumer.toggler.lock().unwrap().take().unwrap();
        toggler.join().unwrap();

        let shown = consumer
            .collapsed
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|collapsed| collapsed.get(&id("A")).copied());
        assert_eq!(shown, Some(false));
        assert!(!sync.is_collapsed(&id("A")).unwrap());
    }
}
