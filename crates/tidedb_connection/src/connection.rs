//! The persistent connection state machine.
//!
//! One logical connection to the backend. Tracks every outstanding listen,
//! put, get, and on-disconnect action so that the full in-flight state can
//! be replayed after a network drop, drives reconnection backoff, injects
//! credentials, and demultiplexes server push messages to a delegate.
//!
//! All mutation happens under one mutex (the engine's serial context).
//! Effects that leave the component (frames to the transport, completion
//! callbacks, delegate notifications) are collected while the lock is held
//! and executed after it is released, so a callback may safely re-enter the
//! connection.

use crate::backoff::Backoff;
use crate::config::ConnectionConfig;
use crate::credentials::CredentialProvider;
use crate::transport::Transport;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tidedb_core::{Path, QuerySpec};
use tidedb_wire::{
    parse_server_message, Action, ControlMessage, ListenHash, RangeMergeUpdate, Request,
    ServerMessage, ServerPush, Status,
};
use tracing::{debug, trace, warn};

/// Interrupt reason: the server killed the connection permanently.
pub const INTERRUPT_SERVER_KILL: &str = "server_kill";
/// Interrupt reason: the embedding application asked the engine to pause.
pub const INTERRUPT_REPO: &str = "repo_interrupt";
/// Interrupt reason: the application moved to the background.
pub const INTERRUPT_BACKGROUND: &str = "background";

/// States of the connection establishment sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport; may be waiting out a backoff delay.
    Disconnected,
    /// Fetching a credential context for the next attempt.
    GettingToken,
    /// Transport opening; waiting for the server hello.
    Connecting,
    /// Credentials sent; waiting for their acknowledgment.
    Authenticating,
    /// Fully established; writes are permitted.
    Connected,
}

/// One-shot completion for a request: status plus response data.
pub type StatusCallback = Box<dyn FnOnce(Status, serde_json::Value) + Send>;

/// Repeated completion for a listen; re-invoked after every (re)send.
pub type ListenCallback = Arc<dyn Fn(Status) + Send + Sync>;

/// Produces the latest local digest for a listen's cached data.
pub type HashProvider = Arc<dyn Fn() -> ListenHash + Send + Sync>;

/// Receives connection lifecycle events and server pushes.
pub trait ConnectionDelegate: Send + Sync {
    /// The connection is established and state has been replayed.
    fn on_connect(&self);
    /// The connection dropped; a reconnect will be attempted.
    fn on_disconnect(&self);
    /// Authoritative data for a path (overwrite or merge).
    fn on_data_update(
        &self,
        path: &Path,
        data: &serde_json::Value,
        is_merge: bool,
        tag: Option<u64>,
    );
    /// A range merge for a path.
    fn on_range_merge(&self, path: &Path, updates: &[RangeMergeUpdate], tag: Option<u64>);
    /// The server revoked listens at a path.
    fn on_listen_revoked(&self, path: &Path);
    /// A fresh estimate of the server clock offset, in milliseconds.
    fn on_server_time_offset(&self, offset_ms: f64);
}

struct OutstandingListen {
    tag: Option<u64>,
    hash: HashProvider,
    on_complete: ListenCallback,
    /// Registration order; reconnect replay resends listens by it.
    order: u64,
    sent: bool,
}

struct OutstandingPut {
    action: Action,
    body: serde_json::Value,
    /// Carried a hash; such writes are failed locally on disconnect so the
    /// coordinator can requeue the transaction behind them.
    conditional: bool,
    on_complete: Option<StatusCallback>,
    sent: bool,
}

struct OutstandingGet {
    body: serde_json::Value,
    on_complete: Option<StatusCallback>,
    deadline: Instant,
    sent: bool,
}

struct DisconnectEntry {
    id: u64,
    action: Action,
    body: serde_json::Value,
    on_complete: Option<StatusCallback>,
    path: Path,
    sent: bool,
}

enum PendingRequest {
    Listen(QuerySpec),
    Put(u64),
    Get(u64),
    OnDisconnect(u64),
    Auth,
    AppCheck,
    Stats,
    FireAndForget,
}

enum Effect {
    OpenTransport,
    CloseTransport,
    SendFrame(serde_json::Value),
    SendListen(QuerySpec),
    Status(StatusCallback, Status, serde_json::Value),
    ListenStatus(ListenCallback, Status),
    Connect,
    Disconnect,
    DataUpdate(Path, serde_json::Value, bool, Option<u64>),
    RangeMerge(Path, Vec<RangeMergeUpdate>, Option<u64>),
    ListenRevoked(Path),
    ServerTimeOffset(f64),
    StartAttempt,
}

struct Inner {
    state: ConnectionState,
    interrupts: HashSet<String>,
    disposed: bool,
    request_counter: u64,
    pending: HashMap<u64, PendingRequest>,
    listens: HashMap<QuerySpec, OutstandingListen>,
    listen_counter: u64,
    puts: BTreeMap<u64, OutstandingPut>,
    put_counter: u64,
    gets: BTreeMap<u64, OutstandingGet>,
    get_counter: u64,
    disconnect_queue: VecDeque<DisconnectEntry>,
    disconnect_counter: u64,
    cached_auth: Option<String>,
    cached_app_check: Option<String>,
    force_token_refresh: bool,
    attempt_counter: u64,
    backoff: Backoff,
    established_at: Option<Instant>,
    next_attempt_at: Option<Instant>,
    server_time_offset_ms: f64,
}

/// One logical connection to the backend.
pub struct PersistentConnection {
    config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialProvider>,
    delegate: Mutex<Option<Weak<dyn ConnectionDelegate>>>,
    inner: Mutex<Inner>,
}

impl PersistentConnection {
    /// Creates a connection over the given transport and credentials.
    ///
    /// The connection starts disconnected; call [`PersistentConnection::open`]
    /// to begin connecting.
    pub fn new(
        config: ConnectionConfig,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Arc<Self> {
        let backoff = Backoff::new(config.backoff.clone());
        Arc::new(Self {
            config,
            transport,
            credentials,
            delegate: Mutex::new(None),
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                interrupts: HashSet::new(),
                disposed: false,
                request_counter: 0,
                pending: HashMap::new(),
                listens: HashMap::new(),
                listen_counter: 0,
                puts: BTreeMap::new(),
                put_counter: 0,
                gets: BTreeMap::new(),
                get_counter: 0,
                disconnect_queue: VecDeque::new(),
                disconnect_counter: 0,
                cached_auth: None,
                cached_app_check: None,
                force_token_refresh: false,
                attempt_counter: 0,
                backoff,
                established_at: None,
                next_attempt_at: None,
                server_time_offset_ms: 0.0,
            }),
        })
    }

    /// Registers the delegate. Held weakly to break the ownership cycle
    /// with the coordinator.
    pub fn set_delegate(&self, delegate: Weak<dyn ConnectionDelegate>) {
        *self.delegate.lock() = Some(delegate);
    }

    /// The current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// True when writes are currently permitted.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Latest estimate of the server clock offset, in milliseconds.
    pub fn server_time_offset_ms(&self) -> f64 {
        self.inner.lock().server_time_offset_ms
    }

    /// Begins connecting (unless interrupted or disposed).
    pub fn open(&self) {
        self.start_attempt();
    }

    /// Adds a named interrupt reason; the connection closes and stays down
    /// while any reason is present.
    pub fn interrupt(&self, reason: &str) {
        let effects = {
            let mut inner = self.inner.lock();
            inner.interrupts.insert(reason.to_owned());
            debug!(reason, "connection interrupted");
            if inner.state == ConnectionState::Disconnected {
                Vec::new()
            } else {
                self.handle_closed_locked(&mut inner)
            }
        };
        self.apply(effects);
    }

    /// Removes an interrupt reason; reconnects when none remain.
    pub fn resume(&self, reason: &str) {
        let reconnect = {
            let mut inner = self.inner.lock();
            inner.interrupts.remove(reason);
            inner.interrupts.is_empty() && inner.state == ConnectionState::Disconnected
        };
        if reconnect {
            self.start_attempt();
        }
    }

    /// The application moved to the background; the connection closes.
    pub fn on_background(&self) {
        self.interrupt(INTERRUPT_BACKGROUND);
    }

    /// The application returned to the foreground; the connection resumes.
    pub fn on_foreground(&self) {
        self.resume(INTERRUPT_BACKGROUND);
    }

    /// Synchronously tears the connection down and drops every callback.
    pub fn dispose(&self) {
        let effects = {
            let mut inner = self.inner.lock();
            inner.disposed = true;
            let mut effects = if inner.state != ConnectionState::Disconnected {
                self.handle_closed_locked(&mut inner)
            } else {
                Vec::new()
            };
            inner.listens.clear();
            inner.puts.clear();
            inner.gets.clear();
            inner.disconnect_queue.clear();
            inner.pending.clear();
            inner.next_attempt_at = None;
            effects.push(Effect::CloseTransport);
            effects
        };
        self.apply(effects);
    }

    /// Whether [`PersistentConnection::dispose`] has been called.
    pub fn is_disposed(&self) -> bool {
        self.inner.lock().disposed
    }

    // ---- outgoing operations -------------------------------------------

    /// Records a listen and sends it if connected.
    ///
    /// `hash` is called at every (re)send to fetch the latest local digest.
    /// Listening twice for an identical query is a programming error; the
    /// older registration is replaced defensively in release builds.
    pub fn listen(
        &self,
        query: QuerySpec,
        tag: Option<u64>,
        hash: HashProvider,
        on_complete: ListenCallback,
    ) {
        let effects = {
            let mut inner = self.inner.lock();
            debug_assert!(
                !inner.listens.contains_key(&query),
                "duplicate listen for {query}",
            );
            trace!(%query, ?tag, "listen recorded");
            inner.listen_counter += 1;
            let order = inner.listen_counter;
            inner.listens.insert(
                query.clone(),
                OutstandingListen {
                    tag,
                    hash,
                    on_complete,
                    order,
                    sent: false,
                },
            );
            if inner.state == ConnectionState::Connected {
                vec![Effect::SendListen(query)]
            } else {
                Vec::new()
            }
        };
        self.apply(effects);
    }

    /// Removes a recorded listen; sends an unlisten only if it was sent.
    pub fn unlisten(&self, query: &QuerySpec, tag: Option<u64>) {
        let effects = {
            let mut inner = self.inner.lock();
            let Some(listen) = inner.listens.remove(query) else {
                return;
            };
            trace!(%query, "listen removed");
            if listen.sent && inner.state == ConnectionState::Connected {
                let mut body = serde_json::json!({ "p": query.path.to_string() });
                if !query.is_default() {
                    body["q"] = serde_json::Value::Object(query.params.to_wire());
                }
                if let Some(tag) = tag {
                    body["t"] = serde_json::json!(tag);
                }
                let frame = self
                    .build_request_locked(&mut inner, Action::Unlisten, body, PendingRequest::FireAndForget);
                vec![Effect::SendFrame(frame)]
            } else {
                Vec::new()
            }
        };
        self.apply(effects);
    }

    /// Queues an overwrite; sent immediately when connected, otherwise
    /// replayed in order on (re)connect.
    ///
    /// A put carrying `hash` is conditional: on disconnect it is failed
    /// locally with [`Status::Disconnect`] instead of being replayed.
    pub fn put(
        &self,
        path: &Path,
        data: serde_json::Value,
        hash: Option<String>,
        on_complete: StatusCallback,
    ) {
        self.queue_write(Action::Put, path, data, hash, on_complete);
    }

    /// Queues a merge of children; same queueing rules as puts.
    pub fn merge(&self, path: &Path, data: serde_json::Value, on_complete: StatusCallback) {
        self.queue_write(Action::Merge, path, data, None, on_complete);
    }

    fn queue_write(
        &self,
        action: Action,
        path: &Path,
        data: serde_json::Value,
        hash: Option<String>,
        on_complete: StatusCallback,
    ) {
        let effects = {
            let mut inner = self.inner.lock();
            let mut body = serde_json::json!({ "p": path.to_string(), "d": data });
            let conditional = hash.is_some();
            if let Some(hash) = hash {
                body["h"] = serde_json::Value::String(hash);
            }
            inner.put_counter += 1;
            let id = inner.put_counter;
            inner.puts.insert(
                id,
                OutstandingPut {
                    action,
                    body,
                    conditional,
                    on_complete: Some(on_complete),
                    sent: false,
                },
            );
            if inner.state == ConnectionState::Connected {
                vec![self.send_put_effect_locked(&mut inner, id)]
            } else {
                Vec::new()
            }
        };
        self.apply(effects);
    }

    /// Issues a one-shot read. Fails locally with [`Status::Offline`] if no
    /// connection becomes available before the configured timeout (enforced
    /// by the driver's timer calling [`PersistentConnection::tick`]).
    pub fn get(&self, query: QuerySpec, on_complete: StatusCallback) {
        let effects = {
            let mut inner = self.inner.lock();
            let mut body = serde_json::json!({ "p": query.path.to_string() });
            if !query.is_default() {
                body["q"] = serde_json::Value::Object(query.params.to_wire());
            }
            inner.get_counter += 1;
            let id = inner.get_counter;
            inner.gets.insert(
                id,
                OutstandingGet {
                    body,
                    on_complete: Some(on_complete),
                    deadline: Instant::now() + self.config.get_timeout,
                    sent: false,
                },
            );
            if inner.state == ConnectionState::Connected {
                vec![self.send_get_effect_locked(&mut inner, id)]
            } else {
                Vec::new()
            }
        };
        self.apply(effects);
    }

    /// Registers a put to run server-side when the connection drops.
    pub fn on_disconnect_put(
        &self,
        path: &Path,
        data: serde_json::Value,
        on_complete: StatusCallback,
    ) {
        self.queue_disconnect_action(Action::OnDisconnectPut, path, data, on_complete);
    }

    /// Registers a merge to run server-side when the connection drops.
    pub fn on_disconnect_merge(
        &self,
        path: &Path,
        data: serde_json::Value,
        on_complete: StatusCallback,
    ) {
        self.queue_disconnect_action(Action::OnDisconnectMerge, path, data, on_complete);
    }

    /// Cancels on-disconnect registrations at or below a path.
    pub fn on_disconnect_cancel(&self, path: &Path, on_complete: StatusCallback) {
        let effects = {
            let mut inner = self.inner.lock();
            // A cancel clears any queued action it covers.
            inner
                .disconnect_queue
                .retain(|entry| {
                    entry.action == Action::OnDisconnectCancel || !path.contains(&entry.path)
                });
            self.enqueue_disconnect_locked(
                &mut inner,
                Action::OnDisconnectCancel,
                path,
                serde_json::Value::Null,
                on_complete,
            )
        };
        self.apply(effects);
    }

    fn queue_disconnect_action(
        &self,
        action: Action,
        path: &Path,
        data: serde_json::Value,
        on_complete: StatusCallback,
    ) {
        let effects = {
            let mut inner = self.inner.lock();
            self.enqueue_disconnect_locked(&mut inner, action, path, data, on_complete)
        };
        self.apply(effects);
    }

    fn enqueue_disconnect_locked(
        &self,
        inner: &mut Inner,
        action: Action,
        path: &Path,
        data: serde_json::Value,
        on_complete: StatusCallback,
    ) -> Vec<Effect> {
        let mut body = serde_json::json!({ "p": path.to_string() });
        if action != Action::OnDisconnectCancel {
            body["d"] = data;
        }
        inner.disconnect_counter += 1;
        let id = inner.disconnect_counter;
        inner.disconnect_queue.push_back(DisconnectEntry {
            id,
            action,
            body,
            on_complete: Some(on_complete),
            path: path.clone(),
            sent: false,
        });
        if inner.state == ConnectionState::Connected {
            vec![self.send_disconnect_entry_effect_locked(inner, id)]
        } else {
            Vec::new()
        }
    }

    /// Proactively presents a new auth token, or clears auth when `None`.
    pub fn refresh_auth_token(&self, token: Option<String>) {
        let effects = {
            let mut inner = self.inner.lock();
            inner.cached_auth = token.clone();
            if inner.state != ConnectionState::Connected {
                Vec::new()
            } else {
                match token {
                    Some(token) => {
                        let body = serde_json::json!({ "cred": token });
                        let frame = self.build_request_locked(
                            &mut inner,
                            Action::Auth,
                            body,
                            PendingRequest::Auth,
                        );
                        vec![Effect::SendFrame(frame)]
                    }
                    None => {
                        let frame = self.build_request_locked(
                            &mut inner,
                            Action::Unauth,
                            serde_json::json!({}),
                            PendingRequest::FireAndForget,
                        );
                        vec![Effect::SendFrame(frame)]
                    }
                }
            }
        };
        self.apply(effects);
    }

    /// Proactively presents a new app-check token.
    pub fn refresh_app_check_token(&self, token: Option<String>) {
        let effects = {
            let mut inner = self.inner.lock();
            inner.cached_app_check = token.clone();
            match (inner.state, token) {
                (ConnectionState::Connected, Some(token)) => {
                    let body = serde_json::json!({ "token": token });
                    let frame = self.build_request_locked(
                        &mut inner,
                        Action::AppCheck,
                        body,
                        PendingRequest::AppCheck,
                    );
                    vec![Effect::SendFrame(frame)]
                }
                _ => Vec::new(),
            }
        };
        self.apply(effects);
    }

    /// Reports client stats when connected; dropped otherwise.
    pub fn report_stats(&self, counters: serde_json::Value) {
        let effects = {
            let mut inner = self.inner.lock();
            if inner.state != ConnectionState::Connected {
                return;
            }
            let body = serde_json::json!({ "c": counters });
            let frame =
                self.build_request_locked(&mut inner, Action::Stats, body, PendingRequest::Stats);
            vec![Effect::SendFrame(frame)]
        };
        self.apply(effects);
    }

    // ---- driver entry points -------------------------------------------

    /// Timer entry point: expires overdue gets and starts a reconnect
    /// attempt once the backoff delay has elapsed.
    pub fn tick(&self, now: Instant) {
        let effects = {
            let mut inner = self.inner.lock();
            let mut effects = Vec::new();
            let connected = inner.state == ConnectionState::Connected;
            let overdue: Vec<u64> = inner
                .gets
                .iter()
                .filter(|(_, get)| !connected && !get.sent && now >= get.deadline)
                .map(|(id, _)| *id)
                .collect();
            for id in overdue {
                if let Some(mut get) = inner.gets.remove(&id) {
                    if let Some(cb) = get.on_complete.take() {
                        effects.push(Effect::Status(cb, Status::Offline, serde_json::Value::Null));
                    }
                }
            }
            let due = inner.state == ConnectionState::Disconnected
                && !inner.disposed
                && inner.interrupts.is_empty()
                && inner.next_attempt_at.map(|at| now >= at).unwrap_or(false);
            if due {
                effects.push(Effect::StartAttempt);
            }
            effects
        };
        self.apply(effects);
    }

    /// The next scheduled reconnect attempt, if one is pending.
    pub fn next_attempt_at(&self) -> Option<Instant> {
        self.inner.lock().next_attempt_at
    }

    /// Transport-layer callback: the transport closed or failed to open.
    pub fn on_transport_closed(&self) {
        let effects = {
            let mut inner = self.inner.lock();
            if inner.state == ConnectionState::Disconnected {
                Vec::new()
            } else {
                self.handle_closed_locked(&mut inner)
            }
        };
        self.apply(effects);
    }

    /// Feeds one inbound frame from the transport.
    pub fn handle_incoming(&self, frame: &serde_json::Value) {
        let message = match parse_server_message(frame) {
            Ok(message) => message,
            Err(err) => {
                warn!(%err, "dropping malformed server frame");
                return;
            }
        };
        let effects = {
            let mut inner = self.inner.lock();
            match message {
                ServerMessage::Control(control) => self.handle_control_locked(&mut inner, control),
                ServerMessage::Response(response) => {
                    self.handle_response_locked(&mut inner, response.number, response.status, response.data)
                }
                ServerMessage::Push(push) => self.handle_push_locked(&mut inner, push),
            }
        };
        self.apply(effects);
    }

    // ---- connection establishment --------------------------------------

    fn start_attempt(&self) {
        // Token fetch happens outside the lock; a stale result is detected
        // by comparing the attempt counter afterwards.
        let (attempt, force_refresh) = {
            let mut inner = self.inner.lock();
            if inner.disposed
                || !inner.interrupts.is_empty()
                || inner.state != ConnectionState::Disconnected
            {
                return;
            }
            inner.state = ConnectionState::GettingToken;
            inner.attempt_counter += 1;
            inner.next_attempt_at = None;
            (inner.attempt_counter, std::mem::take(&mut inner.force_token_refresh))
        };
        debug!(attempt, "starting connection attempt");
        let context = self.credentials.fetch_context(force_refresh);
        let effects = {
            let mut inner = self.inner.lock();
            if inner.attempt_counter != attempt || inner.state != ConnectionState::GettingToken {
                // A newer attempt superseded this fetch; discard the result.
                trace!(attempt, "discarding stale token fetch");
                return;
            }
            match context {
                Ok(context) => {
                    inner.cached_auth = context.auth_token;
                    inner.cached_app_check = context.app_check_token;
                    inner.state = ConnectionState::Connecting;
                    vec![Effect::OpenTransport]
                }
                Err(err) => {
                    warn!(%err, "credential fetch failed");
                    inner.state = ConnectionState::Disconnected;
                    self.schedule_retry_locked(&mut inner);
                    Vec::new()
                }
            }
        };
        self.apply(effects);
    }

    fn handle_control_locked(&self, inner: &mut Inner, control: ControlMessage) -> Vec<Effect> {
        match control {
            ControlMessage::Hello { timestamp_ms, .. } => {
                let offset = timestamp_ms - now_ms();
                inner.server_time_offset_ms = offset;
                let mut effects = vec![Effect::ServerTimeOffset(offset)];
                if inner.cached_auth.is_some() {
                    inner.state = ConnectionState::Authenticating;
                    let token = inner.cached_auth.clone().unwrap_or_default();
                    let body = serde_json::json!({ "cred": token });
                    let frame =
                        self.build_request_locked(inner, Action::Auth, body, PendingRequest::Auth);
                    effects.push(Effect::SendFrame(frame));
                } else {
                    effects.extend(self.finish_connect_locked(inner));
                }
                effects
            }
            ControlMessage::Reset { host } => {
                debug!(?host, "server requested reset");
                // A server-initiated reset reconnects without backoff.
                inner.backoff.reset();
                let effects = self.handle_closed_locked(inner);
                inner.next_attempt_at = Some(Instant::now());
                effects
            }
            ControlMessage::Shutdown { reason } => {
                warn!(%reason, "server shut the connection down");
                inner.interrupts.insert(INTERRUPT_SERVER_KILL.to_owned());
                self.handle_closed_locked(inner)
            }
        }
    }

    fn finish_connect_locked(&self, inner: &mut Inner) -> Vec<Effect> {
        inner.state = ConnectionState::Connected;
        inner.established_at = Some(Instant::now());
        debug!("connection established; replaying outstanding state");
        let mut effects = Vec::new();
        if inner.cached_app_check.is_some() {
            let token = inner.cached_app_check.clone().unwrap_or_default();
            let body = serde_json::json!({ "token": token });
            let frame =
                self.build_request_locked(inner, Action::AppCheck, body, PendingRequest::AppCheck);
            effects.push(Effect::SendFrame(frame));
        }
        // Replay order: listens, then writes, then on-disconnect actions,
        // then queued reads, each in original order.
        let mut queries: Vec<(u64, QuerySpec)> = inner
            .listens
            .iter()
            .map(|(query, listen)| (listen.order, query.clone()))
            .collect();
        queries.sort_by_key(|(order, _)| *order);
        for (_, query) in queries {
            effects.push(Effect::SendListen(query));
        }
        let put_ids: Vec<u64> = inner
            .puts
            .iter()
            .filter(|(_, put)| !put.sent)
            .map(|(id, _)| *id)
            .collect();
        for id in put_ids {
            effects.push(self.send_put_effect_locked(inner, id));
        }
        let disconnect_ids: Vec<u64> = inner
            .disconnect_queue
            .iter()
            .filter(|entry| !entry.sent)
            .map(|entry| entry.id)
            .collect();
        for id in disconnect_ids {
            effects.push(self.send_disconnect_entry_effect_locked(inner, id));
        }
        let get_ids: Vec<u64> = inner
            .gets
            .iter()
            .filter(|(_, get)| !get.sent)
            .map(|(id, _)| *id)
            .collect();
        for id in get_ids {
            effects.push(self.send_get_effect_locked(inner, id));
        }
        effects.push(Effect::Connect);
        effects
    }

    fn handle_closed_locked(&self, inner: &mut Inner) -> Vec<Effect> {
        let was_connected = inner.state == ConnectionState::Connected;
        inner.state = ConnectionState::Disconnected;
        let mut effects = vec![Effect::CloseTransport];
        // Outstanding request callbacks are dropped, never invoked.
        inner.pending.clear();
        for listen in inner.listens.values_mut() {
            listen.sent = false;
        }
        // Conditional writes fail locally so the coordinator can requeue
        // the transactions behind them; plain writes are replayed.
        let canceled: Vec<u64> = inner
            .puts
            .iter()
            .filter(|(_, put)| put.sent && put.conditional)
            .map(|(id, _)| *id)
            .collect();
        for id in canceled {
            if let Some(mut put) = inner.puts.remove(&id) {
                if let Some(cb) = put.on_complete.take() {
                    effects.push(Effect::Status(cb, Status::Disconnect, serde_json::Value::Null));
                }
            }
        }
        for put in inner.puts.values_mut() {
            put.sent = false;
        }
        for get in inner.gets.values_mut() {
            get.sent = false;
        }
        for entry in inner.disconnect_queue.iter_mut() {
            entry.sent = false;
        }
        if let Some(established_at) = inner.established_at.take() {
            inner
                .backoff
                .note_connection_result(established_at, Instant::now());
        }
        if was_connected {
            effects.push(Effect::Disconnect);
        }
        self.schedule_retry_locked(inner);
        effects
    }

    fn schedule_retry_locked(&self, inner: &mut Inner) {
        if inner.disposed || !inner.interrupts.is_empty() {
            inner.next_attempt_at = None;
            return;
        }
        let delay = inner.backoff.next_delay();
        trace!(?delay, "scheduling reconnect attempt");
        inner.next_attempt_at = Some(Instant::now() + delay);
    }

    // ---- responses and pushes ------------------------------------------

    fn handle_response_locked(
        &self,
        inner: &mut Inner,
        number: u64,
        status: Status,
        data: serde_json::Value,
    ) -> Vec<Effect> {
        let Some(pending) = inner.pending.remove(&number) else {
            trace!(number, "response for unknown request");
            return Vec::new();
        };
        match pending {
            PendingRequest::Listen(query) => {
                let Some(listen) = inner.listens.get(&query) else {
                    return Vec::new();
                };
                let cb = Arc::clone(&listen.on_complete);
                if !status.is_ok() {
                    // Server rejection removes the listen; the status is
                    // delivered to the callback, never thrown.
                    inner.listens.remove(&query);
                }
                vec![Effect::ListenStatus(cb, status)]
            }
            PendingRequest::Put(id) => match inner.puts.remove(&id) {
                Some(mut put) => match put.on_complete.take() {
                    Some(cb) => vec![Effect::Status(cb, status, data)],
                    None => Vec::new(),
                },
                None => Vec::new(),
            },
            PendingRequest::Get(id) => match inner.gets.remove(&id) {
                Some(mut get) => match get.on_complete.take() {
                    Some(cb) => vec![Effect::Status(cb, status, data)],
                    None => Vec::new(),
                },
                None => Vec::new(),
            },
            PendingRequest::OnDisconnect(id) => {
                let mut effects = Vec::new();
                if let Some(entry) = inner
                    .disconnect_queue
                    .iter_mut()
                    .find(|entry| entry.id == id)
                {
                    if let Some(cb) = entry.on_complete.take() {
                        effects.push(Effect::Status(cb, status, data));
                    }
                }
                effects
            }
            PendingRequest::Auth => {
                if status.is_ok() {
                    if inner.state == ConnectionState::Authenticating {
                        self.finish_connect_locked(inner)
                    } else {
                        Vec::new()
                    }
                } else {
                    warn!(status = status.as_wire(), "auth rejected");
                    // Clear the bad token and reconnect with a fresh fetch.
                    inner.cached_auth = None;
                    inner.force_token_refresh = true;
                    let effects = self.handle_closed_locked(inner);
                    inner.backoff.reset();
                    inner.next_attempt_at = Some(Instant::now());
                    effects
                }
            }
            PendingRequest::AppCheck => {
                if !status.is_ok() {
                    warn!(status = status.as_wire(), "app check rejected");
                    inner.cached_app_check = None;
                }
                Vec::new()
            }
            PendingRequest::Stats => {
                if !status.is_ok() {
                    warn!(status = status.as_wire(), "stats report rejected");
                }
                Vec::new()
            }
            PendingRequest::FireAndForget => Vec::new(),
        }
    }

    fn handle_push_locked(&self, inner: &mut Inner, push: ServerPush) -> Vec<Effect> {
        match push {
            ServerPush::DataUpdate {
                path,
                data,
                is_merge,
                tag,
            } => vec![Effect::DataUpdate(path, data, is_merge, tag)],
            ServerPush::RangeMerge { path, updates, tag } => {
                vec![Effect::RangeMerge(path, updates, tag)]
            }
            ServerPush::ListenRevoked { path, .. } => {
                // Remove every recorded listen at or below the path; the
                // delegate surfaces permission-denied to the registrations.
                let revoked: Vec<QuerySpec> = inner
                    .listens
                    .keys()
                    .filter(|query| path.contains(&query.path))
                    .cloned()
                    .collect();
                let mut effects = Vec::new();
                for query in revoked {
                    if let Some(listen) = inner.listens.remove(&query) {
                        effects.push(Effect::ListenStatus(
                            listen.on_complete,
                            Status::PermissionDenied,
                        ));
                    }
                }
                effects.push(Effect::ListenRevoked(path));
                effects
            }
            ServerPush::AuthRevoked { status, reason } => {
                warn!(status = status.as_wire(), %reason, "auth revoked");
                inner.cached_auth = None;
                inner.force_token_refresh = true;
                let effects = self.handle_closed_locked(inner);
                inner.backoff.reset();
                inner.next_attempt_at = Some(Instant::now());
                effects
            }
            ServerPush::AppCheckRevoked { status, reason } => {
                warn!(status = status.as_wire(), %reason, "app check revoked");
                inner.cached_app_check = None;
                Vec::new()
            }
            ServerPush::SecurityDebug { message } => {
                warn!(%message, "security debug");
                Vec::new()
            }
        }
    }

    // ---- send helpers ---------------------------------------------------

    fn build_request_locked(
        &self,
        inner: &mut Inner,
        action: Action,
        body: serde_json::Value,
        pending: PendingRequest,
    ) -> serde_json::Value {
        inner.request_counter += 1;
        let number = inner.request_counter;
        inner.pending.insert(number, pending);
        Request::new(number, action, body).to_wire()
    }

    fn send_put_effect_locked(&self, inner: &mut Inner, id: u64) -> Effect {
        let (action, body) = {
            let put = inner.puts.get_mut(&id).expect("put exists");
            put.sent = true;
            (put.action, put.body.clone())
        };
        let frame = self.build_request_locked(inner, action, body, PendingRequest::Put(id));
        Effect::SendFrame(frame)
    }

    fn send_get_effect_locked(&self, inner: &mut Inner, id: u64) -> Effect {
        let body = {
            let get = inner.gets.get_mut(&id).expect("get exists");
            get.sent = true;
            get.body.clone()
        };
        let frame = self.build_request_locked(inner, Action::Get, body, PendingRequest::Get(id));
        Effect::SendFrame(frame)
    }

    fn send_disconnect_entry_effect_locked(&self, inner: &mut Inner, id: u64) -> Effect {
        let (action, body) = {
            let entry = inner
                .disconnect_queue
                .iter_mut()
                .find(|entry| entry.id == id)
                .expect("disconnect entry exists");
            entry.sent = true;
            (entry.action, entry.body.clone())
        };
        let frame =
            self.build_request_locked(inner, action, body, PendingRequest::OnDisconnect(id));
        Effect::SendFrame(frame)
    }

    fn send_listen(&self, query: &QuerySpec) {
        // The hash provider re-enters the sync tree, so it runs unlocked.
        let (hash_provider, tag) = {
            let inner = self.inner.lock();
            let Some(listen) = inner.listens.get(query) else {
                return;
            };
            (Arc::clone(&listen.hash), listen.tag)
        };
        let hash = hash_provider();
        let frame = {
            let mut inner = self.inner.lock();
            let Some(listen) = inner.listens.get_mut(query) else {
                return;
            };
            listen.sent = true;
            let mut body = serde_json::json!({
                "p": query.path.to_string(),
                "h": hash.simple(),
            });
            if !query.is_default() {
                body["q"] = serde_json::Value::Object(query.params.to_wire());
            }
            if let Some(tag) = tag {
                body["t"] = serde_json::json!(tag);
            }
            if let ListenHash::Compound { compound, .. } = &hash {
                body["ch"] = compound.to_wire();
            }
            self.build_request_locked(
                &mut inner,
                Action::Listen,
                body,
                PendingRequest::Listen(query.clone()),
            )
        };
        if let Err(err) = self.transport.send(frame) {
            warn!(%err, "listen send failed");
        }
    }

    // ---- effect execution ----------------------------------------------

    fn apply(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::OpenTransport => {
                    if let Err(err) = self.transport.open() {
                        warn!(%err, "transport open failed");
                        self.on_transport_closed();
                    }
                }
                Effect::CloseTransport => self.transport.close(),
                Effect::SendFrame(frame) => {
                    if let Err(err) = self.transport.send(frame) {
                        warn!(%err, "send failed");
                    }
                }
                Effect::SendListen(query) => self.send_listen(&query),
                Effect::Status(cb, status, data) => cb(status, data),
                Effect::ListenStatus(cb, status) => cb(status),
                Effect::Connect => self.with_delegate(|d| d.on_connect()),
                Effect::Disconnect => self.with_delegate(|d| d.on_disconnect()),
                Effect::DataUpdate(path, data, is_merge, tag) => {
                    self.with_delegate(|d| d.on_data_update(&path, &data, is_merge, tag))
                }
                Effect::RangeMerge(path, updates, tag) => {
                    self.with_delegate(|d| d.on_range_merge(&path, &updates, tag))
                }
                Effect::ListenRevoked(path) => {
                    self.with_delegate(|d| d.on_listen_revoked(&path))
                }
                Effect::ServerTimeOffset(offset) => {
                    self.with_delegate(|d| d.on_server_time_offset(offset))
                }
                Effect::StartAttempt => self.start_attempt(),
            }
        }
    }

    fn with_delegate(&self, f: impl FnOnce(&dyn ConnectionDelegate)) {
        let delegate = self.delegate.lock().clone();
        if let Some(delegate) = delegate.and_then(|weak| weak.upgrade()) {
            f(delegate.as_ref());
        }
    }
}

fn now_ms() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64() * 1000.0)
        .unwrap_or(0.0)
}

/// A completion callback that discards the result.
pub fn ignore_status() -> StatusCallback {
    Box::new(|_status, _data| {})
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentials;
    use crate::transport::MockTransport;
    use std::time::Duration;
    use tidedb_core::QueryParams;

    #[derive(Default)]
    struct TestDelegate {
        events: Mutex<Vec<String>>,
    }

    impl TestDelegate {
        fn events(&self) -> Vec<String> {
            self.events.lock().clone()
        }
    }

    impl ConnectionDelegate for TestDelegate {
        fn on_connect(&self) {
            self.events.lock().push("connect".into());
        }
        fn on_disconnect(&self) {
            self.events.lock().push("disconnect".into());
        }
        fn on_data_update(
            &self,
            path: &Path,
            _data: &serde_json::Value,
            is_merge: bool,
            _tag: Option<u64>,
        ) {
            self.events
                .lock()
                .push(format!("update {path} merge={is_merge}"));
        }
        fn on_range_merge(&self, path: &Path, _updates: &[RangeMergeUpdate], _tag: Option<u64>) {
            self.events.lock().push(format!("range_merge {path}"));
        }
        fn on_listen_revoked(&self, path: &Path) {
            self.events.lock().push(format!("revoked {path}"));
        }
        fn on_server_time_offset(&self, _offset_ms: f64) {
            self.events.lock().push("offset".into());
        }
    }

    struct Fixture {
        conn: Arc<PersistentConnection>,
        transport: Arc<MockTransport>,
        delegate: Arc<TestDelegate>,
    }

    fn fixture(auth: Option<&str>) -> Fixture {
        let transport = Arc::new(MockTransport::new());
        let credentials = match auth {
            Some(token) => Arc::new(StaticCredentials::with_auth_token(token)),
            None => Arc::new(StaticCredentials::new()),
        };
        let conn = PersistentConnection::new(
            ConnectionConfig::default(),
            Arc::clone(&transport) as Arc<dyn Transport>,
            credentials as Arc<dyn CredentialProvider>,
        );
        let delegate = Arc::new(TestDelegate::default());
        let weak = Arc::downgrade(&delegate) as Weak<dyn ConnectionDelegate>;
        conn.set_delegate(weak);
        Fixture {
            conn,
            transport,
            delegate,
        }
    }

    fn hello_frame() -> serde_json::Value {
        serde_json::json!({
            "t": "c",
            "d": { "t": "h", "d": { "ts": 1_700_000_000_000.0_f64, "s": "session", "h": "host" } }
        })
    }

    fn response_frame(number: u64, status: &str) -> serde_json::Value {
        serde_json::json!({
            "t": "d",
            "d": { "r": number, "b": { "s": status, "d": null } }
        })
    }

    fn sent_actions(transport: &MockTransport) -> Vec<String> {
        transport
            .sent_frames()
            .iter()
            .map(|f| f["d"]["a"].as_str().unwrap_or("?").to_owned())
            .collect()
    }

    fn last_request_number(transport: &MockTransport) -> u64 {
        transport
            .sent_frames()
            .last()
            .and_then(|f| f["d"]["r"].as_u64())
            .unwrap()
    }

    fn connect(fx: &Fixture) {
        fx.conn.open();
        fx.conn.handle_incoming(&hello_frame());
        if fx.conn.state() == ConnectionState::Authenticating {
            let number = last_request_number(&fx.transport);
            fx.conn.handle_incoming(&response_frame(number, "ok"));
        }
        assert_eq!(fx.conn.state(), ConnectionState::Connected);
    }

    fn null_hash() -> HashProvider {
        Arc::new(|| ListenHash::Simple(String::new()))
    }

    #[test]
    fn connects_without_credentials_on_hello() {
        let fx = fixture(None);
        fx.conn.open();
        assert_eq!(fx.conn.state(), ConnectionState::Connecting);
        assert!(fx.transport.is_open());
        fx.conn.handle_incoming(&hello_frame());
        assert!(fx.conn.is_connected());
        assert_eq!(fx.delegate.events(), vec!["offset", "connect"]);
    }

    #[test]
    fn authenticates_before_connecting() {
        let fx = fixture(Some("tok"));
        fx.conn.open();
        fx.conn.handle_incoming(&hello_frame());
        assert_eq!(fx.conn.state(), ConnectionState::Authenticating);
        assert_eq!(sent_actions(&fx.transport), vec!["auth"]);
        let number = last_request_number(&fx.transport);
        fx.conn.handle_incoming(&response_frame(number, "ok"));
        assert!(fx.conn.is_connected());
    }

    #[test]
    fn auth_rejection_clears_token_and_retries() {
        let fx = fixture(Some("bad"));
        fx.conn.open();
        fx.conn.handle_incoming(&hello_frame());
        let number = last_request_number(&fx.transport);
        fx.conn.handle_incoming(&response_frame(number, "invalid_token"));
        assert_eq!(fx.conn.state(), ConnectionState::Disconnected);
        assert!(fx.conn.next_attempt_at().is_some());
    }

    #[test]
    fn replays_state_in_order_on_connect() {
        let fx = fixture(None);
        let query = QuerySpec::new(Path::new("/rooms"), QueryParams::default());
        fx.conn
            .listen(query, None, null_hash(), Arc::new(|_status| {}));
        fx.conn
            .put(&Path::new("/rooms/a"), serde_json::json!(1), None, ignore_status());
        fx.conn.on_disconnect_put(
            &Path::new("/presence/me"),
            serde_json::json!(false),
            ignore_status(),
        );
        fx.conn.get(
            QuerySpec::new(Path::new("/rooms/b"), QueryParams::default()),
            ignore_status(),
        );
        // Nothing leaves while disconnected.
        assert!(fx.transport.sent_frames().is_empty());

        connect(&fx);
        assert_eq!(sent_actions(&fx.transport), vec!["q", "p", "o", "g"]);
    }

    #[test]
    fn listens_replay_in_registration_order() {
        let fx = fixture(None);
        let paths: Vec<String> = (0..8).map(|i| format!("/q{i}")).collect();
        for path in &paths {
            fx.conn.listen(
                QuerySpec::new(Path::new(path), QueryParams::default()),
                None,
                null_hash(),
                Arc::new(|_status| {}),
            );
        }
        connect(&fx);
        let sent: Vec<String> = fx
            .transport
            .sent_frames()
            .iter()
            .filter(|f| f["d"]["a"].as_str() == Some("q"))
            .filter_map(|f| f["d"]["b"]["p"].as_str().map(str::to_owned))
            .collect();
        assert_eq!(sent, paths);
    }

    #[test]
    fn conditional_put_fails_locally_on_disconnect() {
        let fx = fixture(None);
        connect(&fx);
        fx.transport.clear_sent();

        let failed = Arc::new(Mutex::new(None));
        let failed_in = Arc::clone(&failed);
        fx.conn.put(
            &Path::new("/txn"),
            serde_json::json!(2),
            Some("hash".into()),
            Box::new(move |status, _| *failed_in.lock() = Some(status)),
        );
        fx.conn
            .put(&Path::new("/plain"), serde_json::json!(3), None, ignore_status());
        assert_eq!(sent_actions(&fx.transport), vec!["p", "p"]);

        fx.conn.on_transport_closed();
        assert_eq!(*failed.lock(), Some(Status::Disconnect));

        // The plain put is replayed on the next connection.
        fx.transport.clear_sent();
        fx.conn.tick(Instant::now() + Duration::from_secs(120));
        fx.conn.handle_incoming(&hello_frame());
        let frames = fx.transport.sent_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["d"]["b"]["p"], "/plain");
    }

    #[test]
    fn queued_get_times_out_offline() {
        let fx = fixture(None);
        let status = Arc::new(Mutex::new(None));
        let status_in = Arc::clone(&status);
        fx.conn.get(
            QuerySpec::new(Path::new("/x"), QueryParams::default()),
            Box::new(move |s, _| *status_in.lock() = Some(s)),
        );
        fx.conn.tick(Instant::now() + Duration::from_secs(30));
        assert_eq!(*status.lock(), Some(Status::Offline));
    }

    #[test]
    fn interrupt_blocks_connection_until_resumed() {
        let fx = fixture(None);
        fx.conn.interrupt(INTERRUPT_REPO);
        fx.conn.open();
        assert_eq!(fx.conn.state(), ConnectionState::Disconnected);
        assert!(!fx.transport.is_open());

        fx.conn.resume(INTERRUPT_REPO);
        assert_eq!(fx.conn.state(), ConnectionState::Connecting);
    }

    #[test]
    fn listen_rejection_removes_registration() {
        let fx = fixture(None);
        connect(&fx);
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let statuses_in = Arc::clone(&statuses);
        let query = QuerySpec::new(Path::new("/secret"), QueryParams::default());
        fx.conn.listen(
            query.clone(),
            None,
            null_hash(),
            Arc::new(move |status| statuses_in.lock().push(status)),
        );
        let number = last_request_number(&fx.transport);
        fx.conn
            .handle_incoming(&response_frame(number, "permission_denied"));
        assert_eq!(*statuses.lock(), vec![Status::PermissionDenied]);

        // The registration is gone, so re-listening is permitted.
        fx.conn
            .listen(query, None, null_hash(), Arc::new(|_status| {}));
    }

    #[test]
    fn listen_revocation_notifies_and_drops() {
        let fx = fixture(None);
        connect(&fx);
        let query = QuerySpec::new(Path::new("/rooms/a"), QueryParams::default());
        fx.conn
            .listen(query, None, null_hash(), Arc::new(|_status| {}));
        fx.conn.handle_incoming(&serde_json::json!({
            "t": "d",
            "d": { "a": "c", "b": { "p": "/rooms" } }
        }));
        assert!(fx.delegate.events().contains(&"revoked /rooms".to_owned()));
    }

    #[test]
    fn data_update_reaches_delegate() {
        let fx = fixture(None);
        connect(&fx);
        fx.conn.handle_incoming(&serde_json::json!({
            "t": "d",
            "d": { "a": "d", "b": { "p": "/rooms/a", "d": {"name": "general"} } }
        }));
        assert!(fx
            .delegate
            .events()
            .contains(&"update /rooms/a merge=false".to_owned()));
    }

    #[test]
    fn shutdown_control_interrupts_permanently() {
        let fx = fixture(None);
        connect(&fx);
        fx.conn.handle_incoming(&serde_json::json!({
            "t": "c",
            "d": { "t": "s", "d": "maintenance" }
        }));
        assert_eq!(fx.conn.state(), ConnectionState::Disconnected);
        // No retry while the server-kill interrupt is in place.
        fx.conn.tick(Instant::now() + Duration::from_secs(600));
        assert_eq!(fx.conn.state(), ConnectionState::Disconnected);
        fx.conn.resume(INTERRUPT_SERVER_KILL);
        assert_eq!(fx.conn.state(), ConnectionState::Connecting);
    }

    #[test]
    fn disconnect_cancel_clears_covered_actions() {
        let fx = fixture(None);
        fx.conn.on_disconnect_put(
            &Path::new("/presence/me"),
            serde_json::json!(false),
            ignore_status(),
        );
        fx.conn
            .on_disconnect_cancel(&Path::new("/presence"), ignore_status());
        connect(&fx);
        let actions = sent_actions(&fx.transport);
        assert!(actions.contains(&"oc".to_owned()));
        assert!(!actions.contains(&"o".to_owned()));
    }

    #[test]
    fn refresh_auth_while_connected_sends_auth() {
        let fx = fixture(None);
        connect(&fx);
        fx.transport.clear_sent();
        fx.conn.refresh_auth_token(Some("fresh".into()));
        assert_eq!(sent_actions(&fx.transport), vec!["auth"]);
        fx.conn.refresh_auth_token(None);
        assert_eq!(sent_actions(&fx.transport), vec!["auth", "unauth"]);
    }
}
