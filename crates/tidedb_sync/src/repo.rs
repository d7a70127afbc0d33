//! The repo: write and transaction coordinator.
//!
//! One repo ties a [`SyncTree`] to a [`PersistentConnection`]. It owns the
//! write-id counter and the transaction queue tree, resolves deferred
//! values, applies writes optimistically before their network round-trip,
//! and reconciles on acknowledgment. All engine state lives behind one
//! mutex (the serial context); network sends, listener events, and user
//! callbacks are collected while the lock is held and executed after it is
//! released, so any of them may re-enter the repo.

use crate::error::{SyncError, SyncResult};
use crate::events::{
    raise_cancels, raise_events, CancelCallback, EventCallback, EventRegistration, RaisedCancel,
    RaisedEvent,
};
use crate::persistence::PersistenceEngine;
use crate::range_merge::apply_range_merges;
use crate::sync_tree::{ListenProvider, SyncTree};
use crate::view::filter_node;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tidedb_connection::{
    ConnectionConfig, ConnectionDelegate, CredentialProvider, PersistentConnection, Transport,
    INTERRUPT_REPO,
};
use tidedb_core::{
    resolve_deferred_node, CompoundWrite, Node, Path, QuerySpec, SnapshotSource,
};
use tidedb_wire::{simple_hash, ListenHash, RangeMergeUpdate, Status};
use tracing::{debug, trace, warn};

/// Retries before a transaction gives up against concurrent writers.
const TRANSACTION_MAX_RETRIES: u32 = 25;

/// Segment that routes a path to engine metadata instead of synced data.
const INFO_SEGMENT: &str = ".info";

/// Completion for a plain write.
pub type WriteCallback = Box<dyn FnOnce(SyncResult<()>) + Send>;

/// A transaction's update function: maps the current value to the value to
/// commit, or `None` to abort.
///
/// Runs inside the engine's serial context and may run several times; it
/// must be pure over its input and must not call back into the repo.
pub type TransactionUpdate = Arc<dyn Fn(&Node) -> Option<Node> + Send + Sync>;

/// Completion for a transaction: the committed value, or why it ended.
pub type TransactionCallback = Box<dyn FnOnce(SyncResult<Node>) + Send>;

/// Completion for a one-shot read.
pub type GetCallback = Box<dyn FnOnce(SyncResult<Node>) + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TransactionStatus {
    Run,
    Sent,
    SentNeedsAbort,
    NeedsAbort,
}

struct TransactionRecord {
    order: u64,
    path: Path,
    update: TransactionUpdate,
    on_complete: Option<TransactionCallback>,
    status: TransactionStatus,
    retry_count: u32,
    current_write_id: u64,
    current_output_raw: Node,
    current_output_resolved: Node,
    applied_locally: bool,
    abort_error: Option<SyncError>,
    watch_query: QuerySpec,
    watch_registration: u64,
}

/// A transaction batch ready to be put against a consistent prior hash.
struct TransactionBatch {
    path: Path,
    data: serde_json::Value,
    hash: String,
}

/// Work that must run after the repo lock is released.
#[derive(Default)]
struct Deferred {
    events: Vec<RaisedEvent>,
    cancels: Vec<RaisedCancel>,
    batches: Vec<TransactionBatch>,
    callbacks: Vec<Box<dyn FnOnce() + Send>>,
}

enum ListenCommand {
    Start(QuerySpec, Option<u64>),
    Stop(QuerySpec, Option<u64>),
}

/// Forwards sync-tree listen decisions to the connection, deferred so the
/// network call (and its hash computation) happens outside the repo lock.
struct DeferredListenProvider {
    commands: Mutex<Vec<ListenCommand>>,
}

impl ListenProvider for DeferredListenProvider {
    fn start_listen(&self, query: &QuerySpec, tag: Option<u64>) {
        self.commands
            .lock()
            .push(ListenCommand::Start(query.clone(), tag));
    }
    fn stop_listen(&self, query: &QuerySpec, tag: Option<u64>) {
        self.commands
            .lock()
            .push(ListenCommand::Stop(query.clone(), tag));
    }
}

/// A listen provider for the metadata tree; metadata never listens.
struct NoListens;

impl ListenProvider for NoListens {
    fn start_listen(&self, _query: &QuerySpec, _tag: Option<u64>) {}
    fn stop_listen(&self, _query: &QuerySpec, _tag: Option<u64>) {}
}

struct RepoInner {
    sync_tree: SyncTree,
    info_tree: SyncTree,
    write_id_counter: u64,
    transaction_queue: PathTreeOfTransactions,
    transaction_order: u64,
    server_time_offset_ms: f64,
    on_disconnect_local: CompoundWrite,
    disposed: bool,
}

type PathTreeOfTransactions = tidedb_core::PathTree<Vec<TransactionRecord>>;

/// The engine's top-level coordinator.
pub struct Repo {
    connection: Arc<PersistentConnection>,
    listen_commands: Arc<DeferredListenProvider>,
    weak_self: Weak<Repo>,
    inner: Mutex<RepoInner>,
}

/// Snapshot source over the sync tree's currently-visible data.
struct VisibleSource<'a> {
    sync_tree: &'a SyncTree,
}

impl SnapshotSource for VisibleSource<'_> {
    fn node_at(&self, path: &Path) -> Node {
        self.sync_tree
            .calc_complete_event_cache(path, &[])
            .unwrap_or_else(Node::empty)
    }
}

impl Repo {
    /// Creates a repo over a transport and credential provider, wiring a
    /// persistent connection and registering itself as its delegate.
    pub fn new(
        config: ConnectionConfig,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialProvider>,
        persistence: Box<dyn PersistenceEngine>,
    ) -> Arc<Self> {
        let connection = PersistentConnection::new(config, transport, credentials);
        let listen_commands = Arc::new(DeferredListenProvider {
            commands: Mutex::new(Vec::new()),
        });
        let sync_tree = SyncTree::new(
            Arc::clone(&listen_commands) as Arc<dyn ListenProvider>,
            persistence,
        );
        let mut info_tree = SyncTree::new(
            Arc::new(NoListens) as Arc<dyn ListenProvider>,
            Box::new(crate::persistence::NoopPersistence),
        );
        // Metadata is always complete; hold it synced so later listener
        // registrations see an initial value immediately.
        info_tree.keep_synced(QuerySpec::default_at(Path::new("/.info")), true);
        info_tree.apply_server_overwrite(
            Path::new("/.info"),
            Node::from_json(&serde_json::json!({
                "connected": false,
                "serverTimeOffset": 0.0,
            })),
        );

        let repo = Arc::new_cyclic(|weak| Self {
            connection: Arc::clone(&connection),
            listen_commands,
            weak_self: weak.clone(),
            inner: Mutex::new(RepoInner {
                sync_tree,
                info_tree,
                write_id_counter: 0,
                transaction_queue: PathTreeOfTransactions::new(),
                transaction_order: 0,
                server_time_offset_ms: 0.0,
                on_disconnect_local: CompoundWrite::empty(),
                disposed: false,
            }),
        });
        let delegate: Weak<dyn ConnectionDelegate> =
            Arc::downgrade(&repo) as Weak<dyn ConnectionDelegate>;
        connection.set_delegate(delegate);
        repo
    }

    /// The underlying connection (interrupt, resume, lifecycle hooks).
    pub fn connection(&self) -> &Arc<PersistentConnection> {
        &self.connection
    }

    /// Begins connecting.
    pub fn open(self: &Arc<Self>) {
        self.connection.open();
    }

    /// Pauses the whole engine; the connection stays down until resumed.
    pub fn interrupt(&self) {
        self.connection.interrupt(INTERRUPT_REPO);
    }

    /// Resumes after an [`Repo::interrupt`].
    pub fn resume(&self) {
        self.connection.resume(INTERRUPT_REPO);
    }

    /// Synchronously tears the engine down and drops all callbacks.
    pub fn dispose(&self) {
        {
            let mut inner = self.inner.lock();
            inner.disposed = true;
            inner.transaction_queue = PathTreeOfTransactions::new();
        }
        self.connection.dispose();
    }

    /// True once [`Repo::dispose`] has run; all further calls fail fast.
    pub fn is_disposed(&self) -> bool {
        self.inner.lock().disposed
    }

    /// Current estimate of `serverTime - localTime`, in milliseconds.
    pub fn server_time_offset_ms(&self) -> f64 {
        self.inner.lock().server_time_offset_ms
    }

    // ---- listens --------------------------------------------------------

    /// Attaches a listener to a query. Returns the registration id used to
    /// detach it later.
    pub fn listen(
        self: &Arc<Self>,
        query: QuerySpec,
        on_event: EventCallback,
        on_cancel: CancelCallback,
    ) -> u64 {
        let registration = EventRegistration::new(on_event, on_cancel);
        let id = registration.id;
        let deferred = {
            let mut inner = self.inner.lock();
            let tree = if is_info_path(&query.path) {
                &mut inner.info_tree
            } else {
                &mut inner.sync_tree
            };
            let events = tree.add_event_registration(query, registration);
            Deferred {
                events,
                ..Deferred::default()
            }
        };
        self.finish(deferred);
        id
    }

    /// Detaches a listener.
    pub fn unlisten(self: &Arc<Self>, query: &QuerySpec, registration_id: u64) {
        let deferred = {
            let mut inner = self.inner.lock();
            let tree = if is_info_path(&query.path) {
                &mut inner.info_tree
            } else {
                &mut inner.sync_tree
            };
            tree.remove_event_registration(query, Some(registration_id), None);
            Deferred::default()
        };
        self.finish(deferred);
    }

    /// Keeps a query synced without delivering events.
    pub fn keep_synced(self: &Arc<Self>, query: QuerySpec, keep: bool) {
        let deferred = {
            let mut inner = self.inner.lock();
            inner.sync_tree.keep_synced(query, keep);
            Deferred::default()
        };
        self.finish(deferred);
    }

    // ---- writes ---------------------------------------------------------

    /// Overwrites the value at a path, optimistically and then durably.
    pub fn set(
        self: &Arc<Self>,
        path: Path,
        value: serde_json::Value,
        on_complete: WriteCallback,
    ) {
        if self.is_disposed() {
            on_complete(Err(SyncError::Disposed));
            return;
        }
        let raw = Node::from_json(&value);
        let (write_id, deferred) = {
            let mut inner = self.inner.lock();
            let now = server_now_ms(inner.server_time_offset_ms);
            let resolved = {
                let source = VisibleSource {
                    sync_tree: &inner.sync_tree,
                };
                resolve_deferred_node(&raw, &source, &path, now)
            };
            inner.write_id_counter += 1;
            let write_id = inner.write_id_counter;
            let mut deferred = Deferred::default();
            deferred.events = inner
                .sync_tree
                .apply_user_overwrite(path.clone(), resolved, write_id, true);
            // A direct write always wins over overlapping transactions.
            abort_transactions_in_subtree(
                &mut inner,
                &path,
                SyncError::WriteCanceled,
                &mut deferred,
            );
            rerun_transactions(&mut inner, &path, &mut deferred);
            send_ready_transactions(&mut inner, self.connection.is_connected(), &mut deferred);
            (write_id, deferred)
        };
        self.finish(deferred);

        let repo = Arc::downgrade(self);
        let ack_path = path.clone();
        self.connection.put(
            &path,
            value,
            None,
            Box::new(move |status, _data| {
                if let Some(repo) = repo.upgrade() {
                    repo.on_write_ack(write_id, &ack_path, status, on_complete);
                }
            }),
        );
    }

    /// Merges named children into the value at a path.
    pub fn update(
        self: &Arc<Self>,
        path: Path,
        children: BTreeMap<String, serde_json::Value>,
        on_complete: WriteCallback,
    ) {
        if self.is_disposed() {
            on_complete(Err(SyncError::Disposed));
            return;
        }
        if children.is_empty() {
            trace!(%path, "empty update");
            on_complete(Ok(()));
            return;
        }
        let raw_value = serde_json::Value::Object(
            children
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );
        let write = CompoundWrite::from_entries(
            children
                .iter()
                .map(|(key, value)| (Path::new(key), Node::from_json(value))),
        );
        let (write_id, deferred) = {
            let mut inner = self.inner.lock();
            let now = server_now_ms(inner.server_time_offset_ms);
            let resolved = {
                let source = VisibleSource {
                    sync_tree: &inner.sync_tree,
                };
                tidedb_core::resolve_deferred_compound_write(&write, &source, &path, now)
            };
            inner.write_id_counter += 1;
            let write_id = inner.write_id_counter;
            let mut deferred = Deferred::default();
            deferred.events = inner
                .sync_tree
                .apply_user_merge(path.clone(), resolved, write_id);
            for (rel, _) in write.entries() {
                let child_path = path.append(&rel);
                abort_transactions_in_subtree(
                    &mut inner,
                    &child_path,
                    SyncError::WriteCanceled,
                    &mut deferred,
                );
            }
            rerun_transactions(&mut inner, &path, &mut deferred);
            send_ready_transactions(&mut inner, self.connection.is_connected(), &mut deferred);
            (write_id, deferred)
        };
        self.finish(deferred);

        let repo = Arc::downgrade(self);
        let ack_path = path.clone();
        self.connection.merge(
            &path,
            raw_value,
            Box::new(move |status, _data| {
                if let Some(repo) = repo.upgrade() {
                    repo.on_write_ack(write_id, &ack_path, status, on_complete);
                }
            }),
        );
    }

    fn on_write_ack(
        self: &Arc<Self>,
        write_id: u64,
        path: &Path,
        status: Status,
        on_complete: WriteCallback,
    ) {
        let deferred = {
            let mut inner = self.inner.lock();
            let mut deferred = Deferred::default();
            deferred.events = inner.sync_tree.ack_user_write(write_id, !status.is_ok());
            rerun_transactions(&mut inner, path, &mut deferred);
            send_ready_transactions(&mut inner, self.connection.is_connected(), &mut deferred);
            deferred
        };
        if !status.is_ok() {
            warn!(%path, status = status.as_wire(), "write rejected");
        }
        self.finish(deferred);
        let result = if status.is_ok() {
            Ok(())
        } else {
            Err(SyncError::from_status(&status))
        };
        on_complete(result);
    }

    // ---- transactions ---------------------------------------------------

    /// Runs an atomic read-modify-write at a path.
    ///
    /// `update` sees the latest locally-visible value and returns the value
    /// to commit, or `None` to abort. With `apply_locally` the intermediate
    /// states are visible to local listeners while the transaction retries.
    pub fn run_transaction(
        self: &Arc<Self>,
        path: Path,
        update: TransactionUpdate,
        apply_locally: bool,
        on_complete: TransactionCallback,
    ) {
        if self.is_disposed() {
            on_complete(Err(SyncError::Disposed));
            return;
        }
        // Hold the location synced while the transaction is outstanding.
        let watch_query = QuerySpec::default_at(path.clone());
        let watch = EventRegistration::silent();
        let watch_registration = watch.id;
        let deferred = {
            let mut inner = self.inner.lock();
            let mut deferred = Deferred::default();
            deferred
                .events
                .extend(inner.sync_tree.add_event_registration(watch_query.clone(), watch));

            let input = inner
                .sync_tree
                .calc_complete_event_cache(&path, &[])
                .unwrap_or_else(Node::empty);
            match update(&input) {
                None => {
                    inner.sync_tree.remove_event_registration(
                        &watch_query,
                        Some(watch_registration),
                        None,
                    );
                    deferred
                        .callbacks
                        .push(Box::new(move || on_complete(Err(SyncError::Aborted))));
                }
                Some(raw) => {
                    let now = server_now_ms(inner.server_time_offset_ms);
                    let resolved = {
                        let source = VisibleSource {
                            sync_tree: &inner.sync_tree,
                        };
                        resolve_deferred_node(&raw, &source, &path, now)
                    };
                    inner.write_id_counter += 1;
                    inner.transaction_order += 1;
                    let record = TransactionRecord {
                        order: inner.transaction_order,
                        path: path.clone(),
                        update,
                        on_complete: Some(on_complete),
                        status: TransactionStatus::Run,
                        retry_count: 0,
                        current_write_id: inner.write_id_counter,
                        current_output_raw: raw,
                        current_output_resolved: resolved.clone(),
                        applied_locally: apply_locally,
                        abort_error: None,
                        watch_query,
                        watch_registration,
                    };
                    deferred.events.extend(inner.sync_tree.apply_user_overwrite(
                        path.clone(),
                        resolved,
                        record.current_write_id,
                        apply_locally,
                    ));
                    push_transaction(&mut inner.transaction_queue, record);
                    send_ready_transactions(
                        &mut inner,
                        self.connection.is_connected(),
                        &mut deferred,
                    );
                }
            }
            deferred
        };
        self.finish(deferred);
    }

    fn on_transaction_response(self: &Arc<Self>, path: Path, status: Status) {
        debug!(%path, status = status.as_wire(), "transaction batch settled");
        let deferred = {
            let mut inner = self.inner.lock();
            let mut deferred = Deferred::default();
            let sent: Vec<u64> = transactions_in_subtree(&inner.transaction_queue, &path)
                .into_iter()
                .filter(|(_, s)| {
                    matches!(
                        s,
                        TransactionStatus::Sent | TransactionStatus::SentNeedsAbort
                    )
                })
                .map(|(order, _)| order)
                .collect();
            match status {
                Status::Ok => {
                    for order in sent {
                        complete_sent_transaction(&mut inner, &path, order, &mut deferred);
                    }
                    rerun_transactions(&mut inner, &path, &mut deferred);
                }
                Status::DataStale => {
                    for order in sent {
                        if let Some(record) =
                            transaction_mut(&mut inner.transaction_queue, &path, order)
                        {
                            record.status = unsent_status(record.status);
                            record.retry_count += 1;
                        }
                    }
                    rerun_transactions(&mut inner, &path, &mut deferred);
                }
                Status::Disconnect => {
                    // Requeued; the batch is resent after reconnecting.
                    for order in sent {
                        if let Some(record) =
                            transaction_mut(&mut inner.transaction_queue, &path, order)
                        {
                            record.status = unsent_status(record.status);
                        }
                    }
                }
                other => {
                    let error = SyncError::from_status(&other);
                    for order in sent {
                        abort_transaction(&mut inner, &path, order, error.clone(), &mut deferred);
                    }
                    rerun_transactions(&mut inner, &path, &mut deferred);
                }
            }
            send_ready_transactions(&mut inner, self.connection.is_connected(), &mut deferred);
            deferred
        };
        self.finish(deferred);
    }

    // ---- reads ----------------------------------------------------------

    /// One-shot read. Prefers the server; falls back to the local cache
    /// when offline, and fails with [`SyncError::Offline`] only when
    /// neither is available.
    pub fn get(self: &Arc<Self>, query: QuerySpec, on_complete: GetCallback) {
        if self.is_disposed() {
            on_complete(Err(SyncError::Disposed));
            return;
        }
        let repo = Arc::downgrade(self);
        self.connection.get(
            query.clone(),
            Box::new(move |status, data| {
                let Some(repo) = repo.upgrade() else {
                    return;
                };
                if status.is_ok() {
                    let node = Node::from_json(&data);
                    let deferred = {
                        let mut inner = repo.inner.lock();
                        let mut deferred = Deferred::default();
                        if query.is_default() {
                            deferred.events = inner
                                .sync_tree
                                .apply_server_overwrite(query.path.clone(), node.clone());
                            rerun_transactions(&mut inner, &query.path, &mut deferred);
                        }
                        deferred
                    };
                    repo.finish(deferred);
                    on_complete(Ok(filter_node(&query.params, &node)));
                } else {
                    let cached = {
                        let inner = repo.inner.lock();
                        inner
                            .sync_tree
                            .calc_complete_event_cache(&query.path, &[])
                    };
                    match cached {
                        Some(node) => on_complete(Ok(filter_node(&query.params, &node))),
                        None => on_complete(Err(SyncError::from_status(&status))),
                    }
                }
            }),
        );
    }

    // ---- onDisconnect registrations ------------------------------------

    /// Registers a value to be written server-side when this client drops.
    pub fn on_disconnect_set(
        self: &Arc<Self>,
        path: Path,
        value: serde_json::Value,
        on_complete: WriteCallback,
    ) {
        let raw = Node::from_json(&value);
        {
            let mut inner = self.inner.lock();
            let now = server_now_ms(inner.server_time_offset_ms);
            let resolved = {
                let source = VisibleSource {
                    sync_tree: &inner.sync_tree,
                };
                resolve_deferred_node(&raw, &source, &path, now)
            };
            inner.on_disconnect_local = inner.on_disconnect_local.add_write(&path, resolved);
        }
        self.connection
            .on_disconnect_put(&path, value, status_adapter(on_complete));
    }

    /// Registers a merge to run server-side when this client drops.
    pub fn on_disconnect_update(
        self: &Arc<Self>,
        path: Path,
        children: BTreeMap<String, serde_json::Value>,
        on_complete: WriteCallback,
    ) {
        let raw_value =
            serde_json::Value::Object(children.iter().map(|(k, v)| (k.clone(), v.clone())).collect());
        {
            let mut inner = self.inner.lock();
            let now = server_now_ms(inner.server_time_offset_ms);
            for (key, value) in &children {
                let child_path = path.append(&Path::new(key));
                let node = Node::from_json(value);
                let resolved = {
                    let source = VisibleSource {
                        sync_tree: &inner.sync_tree,
                    };
                    resolve_deferred_node(&node, &source, &child_path, now)
                };
                inner.on_disconnect_local =
                    inner.on_disconnect_local.add_write(&child_path, resolved);
            }
        }
        self.connection
            .on_disconnect_merge(&path, raw_value, status_adapter(on_complete));
    }

    /// Cancels on-disconnect registrations at or below a path.
    pub fn on_disconnect_cancel(self: &Arc<Self>, path: Path, on_complete: WriteCallback) {
        {
            let mut inner = self.inner.lock();
            inner.on_disconnect_local = inner.on_disconnect_local.remove_write(&path);
        }
        self.connection
            .on_disconnect_cancel(&path, status_adapter(on_complete));
    }

    // ---- deferred-work execution ---------------------------------------

    /// Runs everything that was deferred out of the lock: network listens,
    /// transaction batches, events, cancels, user callbacks.
    fn finish(self: &Arc<Self>, deferred: Deferred) {
        self.flush_listen_commands();
        for batch in deferred.batches {
            let repo = Arc::downgrade(self);
            let path = batch.path.clone();
            self.connection.put(
                &batch.path,
                batch.data,
                Some(batch.hash),
                Box::new(move |status, _data| {
                    if let Some(repo) = repo.upgrade() {
                        repo.on_transaction_response(path, status);
                    }
                }),
            );
        }
        raise_events(deferred.events);
        raise_cancels(deferred.cancels);
        for callback in deferred.callbacks {
            callback();
        }
    }

    fn flush_listen_commands(self: &Arc<Self>) {
        let commands: Vec<ListenCommand> =
            std::mem::take(&mut *self.listen_commands.commands.lock());
        for command in commands {
            match command {
                ListenCommand::Start(query, tag) => {
                    let hash_repo = Arc::downgrade(self);
                    let hash_query = query.clone();
                    let status_repo = Arc::downgrade(self);
                    let status_query = query.clone();
                    self.connection.listen(
                        query,
                        tag,
                        Arc::new(move || {
                            let node = hash_repo
                                .upgrade()
                                .map(|repo| {
                                    let inner = repo.inner.lock();
                                    inner.sync_tree.server_cache_for_listen(&hash_query)
                                })
                                .unwrap_or_else(Node::empty);
                            ListenHash::for_node(&node)
                        }),
                        Arc::new(move |status| {
                            let Some(repo) = status_repo.upgrade() else {
                                return;
                            };
                            if status.is_ok() {
                                // The server has sent everything it has for
                                // this query; the view is now complete.
                                let events = {
                                    let mut inner = repo.inner.lock();
                                    match tag {
                                        Some(tag) => {
                                            inner.sync_tree.apply_tagged_listen_complete(tag)
                                        }
                                        None => inner
                                            .sync_tree
                                            .apply_listen_complete(status_query.path.clone()),
                                    }
                                };
                                raise_events(events);
                                return;
                            }
                            warn!(query = %status_query, status = status.as_wire(), "listen rejected");
                            let cancels = {
                                let mut inner = repo.inner.lock();
                                inner.sync_tree.remove_event_registration(
                                    &status_query,
                                    None,
                                    Some(SyncError::from_status(&status)),
                                )
                            };
                            raise_cancels(cancels);
                            repo.flush_listen_commands();
                        }),
                    );
                }
                ListenCommand::Stop(query, tag) => {
                    self.connection.unlisten(&query, tag);
                }
            }
        }
    }

    fn update_info(self: &Arc<Self>, key: &str, node: Node) -> Deferred {
        let mut inner = self.inner.lock();
        let events = inner
            .info_tree
            .apply_server_overwrite(Path::new(INFO_SEGMENT).child(key), node);
        Deferred {
            events,
            ..Deferred::default()
        }
    }
}

impl ConnectionDelegate for Repo {
    fn on_connect(&self) {
        // Listens and plain writes replay inside the connection; only the
        // transaction batches need a fresh send from here.
        let this = match self_arc(self) {
            Some(this) => this,
            None => return,
        };
        debug!("connection established");
        let mut deferred = this.update_info("connected", Node::leaf(true));
        {
            let mut inner = this.inner.lock();
            send_ready_transactions(&mut inner, true, &mut deferred);
        }
        this.finish(deferred);
    }

    fn on_disconnect(&self) {
        let Some(this) = self_arc(self) else { return };
        debug!("connection lost");
        let mut deferred = this.update_info("connected", Node::leaf(false));
        {
            let mut inner = this.inner.lock();
            // The server runs the registered on-disconnect writes now;
            // reflect them locally.
            let local = std::mem::replace(&mut inner.on_disconnect_local, CompoundWrite::empty());
            for (path, node) in local.entries() {
                deferred
                    .events
                    .extend(inner.sync_tree.apply_server_overwrite(path.clone(), node.clone()));
            }
        }
        this.finish(deferred);
    }

    fn on_data_update(
        &self,
        path: &Path,
        data: &serde_json::Value,
        is_merge: bool,
        tag: Option<u64>,
    ) {
        let Some(this) = self_arc(self) else { return };
        let deferred = {
            let mut inner = this.inner.lock();
            let mut deferred = Deferred::default();
            deferred.events = match (is_merge, tag) {
                (false, None) => inner
                    .sync_tree
                    .apply_server_overwrite(path.clone(), Node::from_json(data)),
                (false, Some(tag)) => {
                    inner
                        .sync_tree
                        .apply_tagged_overwrite(tag, path.clone(), Node::from_json(data))
                }
                (true, None) => inner
                    .sync_tree
                    .apply_server_merge(path.clone(), compound_from_json(data)),
                (true, Some(tag)) => {
                    inner
                        .sync_tree
                        .apply_tagged_merge(tag, path.clone(), compound_from_json(data))
                }
            };
            rerun_transactions(&mut inner, path, &mut deferred);
            send_ready_transactions(&mut inner, this.connection.is_connected(), &mut deferred);
            deferred
        };
        this.finish(deferred);
    }

    fn on_range_merge(&self, path: &Path, updates: &[RangeMergeUpdate], tag: Option<u64>) {
        let Some(this) = self_arc(self) else { return };
        let deferred = {
            let mut inner = this.inner.lock();
            let mut deferred = Deferred::default();
            let existing = match tag.and_then(|t| inner.sync_tree.query_for_tag(t).cloned()) {
                Some(query) => Some(inner.sync_tree.server_cache_for_listen(&query)),
                None => inner.sync_tree.server_cache_at(path),
            };
            match existing {
                Some(existing) => {
                    let merged = apply_range_merges(&existing, updates);
                    deferred.events = match tag {
                        Some(tag) => {
                            inner.sync_tree.apply_tagged_overwrite(tag, path.clone(), merged)
                        }
                        None => inner.sync_tree.apply_server_overwrite(path.clone(), merged),
                    };
                    rerun_transactions(&mut inner, path, &mut deferred);
                }
                None => {
                    // Nothing cached to merge into; a full update follows.
                    warn!(%path, "range merge without cached data");
                }
            }
            deferred
        };
        this.finish(deferred);
    }

    fn on_listen_revoked(&self, path: &Path) {
        let Some(this) = self_arc(self) else { return };
        let deferred = {
            let mut inner = this.inner.lock();
            let cancels = inner.sync_tree.apply_listen_revoked(path);
            Deferred {
                cancels,
                ..Deferred::default()
            }
        };
        this.finish(deferred);
    }

    fn on_server_time_offset(&self, offset_ms: f64) {
        let Some(this) = self_arc(self) else { return };
        {
            let mut inner = this.inner.lock();
            inner.server_time_offset_ms = offset_ms;
        }
        let deferred = this.update_info("serverTimeOffset", Node::leaf(offset_ms));
        this.finish(deferred);
    }
}

// Delegate methods arrive through `&self` but deferred work needs the Arc
// back; the repo keeps a weak self-reference from construction for that.
fn self_arc(repo: &Repo) -> Option<Arc<Repo>> {
    repo.weak_self.upgrade()
}

fn is_info_path(path: &Path) -> bool {
    path.front() == Some(INFO_SEGMENT)
}

fn server_now_ms(offset_ms: f64) -> f64 {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64() * 1000.0)
        .unwrap_or(0.0);
    now + offset_ms
}

fn status_adapter(on_complete: WriteCallback) -> tidedb_connection::StatusCallback {
    Box::new(move |status, _data| {
        let result = if status.is_ok() {
            Ok(())
        } else {
            Err(SyncError::from_status(&status))
        };
        on_complete(result);
    })
}

/// Interprets a wire merge body as a compound write (keys may be deep).
fn compound_from_json(data: &serde_json::Value) -> CompoundWrite {
    match data.as_object() {
        Some(map) => CompoundWrite::from_entries(
            map.iter()
                .map(|(key, value)| (Path::new(key), Node::from_json(value))),
        ),
        None => CompoundWrite::empty(),
    }
}

// ---- transaction queue helpers -----------------------------------------

/// The status a sent transaction returns to when its batch is not applied.
fn unsent_status(status: TransactionStatus) -> TransactionStatus {
    if status == TransactionStatus::SentNeedsAbort {
        TransactionStatus::NeedsAbort
    } else {
        TransactionStatus::Run
    }
}

fn push_transaction(queue: &mut PathTreeOfTransactions, record: TransactionRecord) {
    let path = record.path.clone();
    match queue.get_mut(&path) {
        Some(list) => list.push(record),
        None => queue.set(&path, vec![record]),
    }
}

/// All (order, status) pairs in the subtree rooted at `path`.
fn transactions_in_subtree(
    queue: &PathTreeOfTransactions,
    path: &Path,
) -> Vec<(u64, TransactionStatus)> {
    let mut found = Vec::new();
    if let Some(subtree) = queue.subtree(path) {
        subtree.for_each(&mut |_rel, list: &Vec<TransactionRecord>| {
            for record in list {
                found.push((record.order, record.status));
            }
        });
    }
    found.sort_by_key(|(order, _)| *order);
    found
}

fn transaction_mut<'a>(
    queue: &'a mut PathTreeOfTransactions,
    path: &Path,
    order: u64,
) -> Option<&'a mut TransactionRecord> {
    let paths: Vec<Path> = {
        let mut paths = Vec::new();
        if let Some(subtree) = queue.subtree(path) {
            subtree.for_each(&mut |rel, _list: &Vec<TransactionRecord>| {
                paths.push(path.append(rel));
            });
        }
        paths
    };
    for p in paths {
        let found = queue
            .get_mut(&p)
            .and_then(|list| list.iter_mut().position(|r| r.order == order));
        if let Some(idx) = found {
            return queue.get_mut(&p).and_then(|list| list.get_mut(idx));
        }
    }
    None
}

fn take_transaction(
    queue: &mut PathTreeOfTransactions,
    path: &Path,
    order: u64,
) -> Option<TransactionRecord> {
    let paths: Vec<Path> = {
        let mut paths = Vec::new();
        if let Some(subtree) = queue.subtree(path) {
            subtree.for_each(&mut |rel, _list: &Vec<TransactionRecord>| {
                paths.push(path.append(rel));
            });
        }
        paths
    };
    for p in paths {
        if let Some(list) = queue.get_mut(&p) {
            if let Some(idx) = list.iter().position(|r| r.order == order) {
                let record = list.remove(idx);
                if list.is_empty() {
                    queue.remove(&p);
                }
                return Some(record);
            }
        }
    }
    None
}

/// Finds the nearest ancestor path (inclusive) that roots a transaction
/// queue, walking from the root toward `path`.
fn root_most_transaction_path(queue: &PathTreeOfTransactions, path: &Path) -> Path {
    queue
        .find_root_most(path)
        .map(|(p, _)| p)
        .unwrap_or_else(|| path.clone())
}

fn complete_sent_transaction(
    inner: &mut RepoInner,
    path: &Path,
    order: u64,
    deferred: &mut Deferred,
) {
    let Some(mut record) = take_transaction(&mut inner.transaction_queue, path, order) else {
        return;
    };
    deferred
        .events
        .extend(inner.sync_tree.ack_user_write(record.current_write_id, false));
    let canceled = record.status == TransactionStatus::SentNeedsAbort;
    release_watch(inner, &record, deferred);
    let snapshot = record.current_output_resolved.clone();
    if let Some(on_complete) = record.on_complete.take() {
        let error = record.abort_error.clone();
        deferred.callbacks.push(Box::new(move || {
            if canceled {
                on_complete(Err(error.unwrap_or(SyncError::WriteCanceled)));
            } else {
                on_complete(Ok(snapshot));
            }
        }));
    }
}

fn abort_transaction(
    inner: &mut RepoInner,
    path: &Path,
    order: u64,
    error: SyncError,
    deferred: &mut Deferred,
) {
    let Some(mut record) = take_transaction(&mut inner.transaction_queue, path, order) else {
        return;
    };
    trace!(%path, order, %error, "transaction aborted");
    deferred
        .events
        .extend(inner.sync_tree.ack_user_write(record.current_write_id, true));
    release_watch(inner, &record, deferred);
    if let Some(on_complete) = record.on_complete.take() {
        deferred
            .callbacks
            .push(Box::new(move || on_complete(Err(error))));
    }
}

fn release_watch(inner: &mut RepoInner, record: &TransactionRecord, deferred: &mut Deferred) {
    let cancels = inner.sync_tree.remove_event_registration(
        &record.watch_query,
        Some(record.watch_registration),
        None,
    );
    deferred.cancels.extend(cancels);
}

/// Marks overlapping transactions for abort: sent ones once their response
/// arrives, unsent ones immediately.
fn abort_transactions_in_subtree(
    inner: &mut RepoInner,
    path: &Path,
    error: SyncError,
    deferred: &mut Deferred,
) {
    for (order, status) in transactions_in_subtree(&inner.transaction_queue, path) {
        match status {
            TransactionStatus::Sent => {
                if let Some(record) = transaction_mut(&mut inner.transaction_queue, path, order) {
                    record.status = TransactionStatus::SentNeedsAbort;
                    record.abort_error = Some(error.clone());
                }
            }
            TransactionStatus::Run | TransactionStatus::NeedsAbort => {
                abort_transaction(inner, path, order, error.clone(), deferred);
            }
            TransactionStatus::SentNeedsAbort => {}
        }
    }
}

/// Reruns every transaction rooted at the nearest ancestor queue node of
/// `path`, recomputing each against the latest visible value.
fn rerun_transactions(inner: &mut RepoInner, path: &Path, deferred: &mut Deferred) {
    let root = root_most_transaction_path(&inner.transaction_queue, path);
    let runnable = transactions_in_subtree(&inner.transaction_queue, &root);
    if runnable.is_empty() {
        return;
    }
    let all_ids: Vec<u64> = collect_write_ids(&inner.transaction_queue, &root);
    for (order, status) in runnable {
        match status {
            TransactionStatus::Sent | TransactionStatus::SentNeedsAbort => continue,
            TransactionStatus::NeedsAbort => {
                let error = transaction_mut(&mut inner.transaction_queue, &root, order)
                    .and_then(|r| r.abort_error.clone())
                    .unwrap_or(SyncError::WriteCanceled);
                abort_transaction(inner, &root, order, error, deferred);
            }
            TransactionStatus::Run => {
                rerun_one(inner, &root, order, &all_ids, deferred);
            }
        }
    }
}

fn collect_write_ids(queue: &PathTreeOfTransactions, root: &Path) -> Vec<u64> {
    let mut ids = Vec::new();
    if let Some(subtree) = queue.subtree(root) {
        subtree.for_each(&mut |_rel, list: &Vec<TransactionRecord>| {
            for record in list {
                ids.push(record.current_write_id);
            }
        });
    }
    ids
}

fn rerun_one(
    inner: &mut RepoInner,
    root: &Path,
    order: u64,
    exclude_ids: &[u64],
    deferred: &mut Deferred,
) {
    let (txn_path, old_write_id, retry_count, update, applied_locally) = {
        let Some(record) = transaction_mut(&mut inner.transaction_queue, root, order) else {
            return;
        };
        (
            record.path.clone(),
            record.current_write_id,
            record.retry_count,
            Arc::clone(&record.update),
            record.applied_locally,
        )
    };
    if retry_count >= TRANSACTION_MAX_RETRIES {
        abort_transaction(inner, root, order, SyncError::TooManyRetries, deferred);
        return;
    }
    // Remove the old optimistic write, then recompute against the latest
    // value with every queued transaction's write excluded.
    deferred
        .events
        .extend(inner.sync_tree.ack_user_write(old_write_id, true));
    let input = inner
        .sync_tree
        .calc_complete_event_cache(&txn_path, exclude_ids)
        .unwrap_or_else(Node::empty);
    match update(&input) {
        None => {
            abort_transaction(inner, root, order, SyncError::Aborted, deferred);
        }
        Some(raw) => {
            let now = server_now_ms(inner.server_time_offset_ms);
            let resolved = {
                let source = VisibleSource {
                    sync_tree: &inner.sync_tree,
                };
                resolve_deferred_node(&raw, &source, &txn_path, now)
            };
            inner.write_id_counter += 1;
            let new_id = inner.write_id_counter;
            deferred.events.extend(inner.sync_tree.apply_user_overwrite(
                txn_path,
                resolved.clone(),
                new_id,
                applied_locally,
            ));
            if let Some(record) = transaction_mut(&mut inner.transaction_queue, root, order) {
                record.current_write_id = new_id;
                record.current_output_raw = raw;
                record.current_output_resolved = resolved;
            }
        }
    }
}

/// Builds and queues a batch put for every transaction queue whose members
/// are all ready to send.
fn send_ready_transactions(inner: &mut RepoInner, connected: bool, deferred: &mut Deferred) {
    if !connected {
        return;
    }
    let roots = transaction_roots(&inner.transaction_queue);
    for root in roots {
        let members = transactions_in_subtree(&inner.transaction_queue, &root);
        if members.is_empty()
            || !members
                .iter()
                .all(|(_, status)| *status == TransactionStatus::Run)
        {
            continue;
        }
        let write_ids = collect_write_ids(&inner.transaction_queue, &root);
        // The batch is validated against the server state without any of
        // its own writes applied.
        let prior = inner
            .sync_tree
            .calc_complete_event_cache(&root, &write_ids)
            .unwrap_or_else(Node::empty);
        let mut snap = prior.clone();
        for (order, _) in &members {
            if let Some(record) = transaction_mut(&mut inner.transaction_queue, &root, *order) {
                let rel = record.path.relative_to(&root).unwrap_or_else(Path::root);
                snap = snap.update(&rel, record.current_output_raw.clone());
                record.status = TransactionStatus::Sent;
            }
        }
        deferred.batches.push(TransactionBatch {
            path: root.clone(),
            data: snap.to_json(false),
            hash: simple_hash(&prior),
        });
    }
}

/// The root-most paths that hold transaction queues.
fn transaction_roots(queue: &PathTreeOfTransactions) -> Vec<Path> {
    let mut roots: Vec<Path> = Vec::new();
    queue.for_each(&mut |path, _list: &Vec<TransactionRecord>| {
        if !roots.iter().any(|root| root.contains(path)) {
            roots.push(path.clone());
        }
    });
    roots
}
