//! End-to-end tests: repo, connection, and a fake in-memory server.

use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::Arc;
use tidedb_connection::{ConnectionConfig, MockTransport, StaticCredentials, Transport};
use tidedb_core::{Node, Path, QuerySpec, Scalar};
use tidedb_sync::{DataEventType, EventCallback, NoopPersistence, Repo, SyncResult};
use tidedb_wire::simple_hash;

/// A scripted backend behind the mock transport. It applies puts and
/// merges to an in-memory tree, enforces the conditional-put hash, echoes
/// every applied write through the listen channel, and answers gets from
/// the tree.
struct FakeServer {
    data: Mutex<Node>,
    cursor: Mutex<usize>,
}

impl FakeServer {
    fn new() -> Self {
        Self {
            data: Mutex::new(Node::empty()),
            cursor: Mutex::new(0),
        }
    }

    fn data_at(&self, path: &Path) -> Node {
        self.data.lock().child(path)
    }

    fn set_data(&self, path: &Path, node: Node) {
        let mut data = self.data.lock();
        *data = data.update(path, node);
    }

    /// Handles every frame the client has sent since the last call,
    /// looping until the client stops producing new ones.
    fn process(&self, repo: &Arc<Repo>, transport: &MockTransport) {
        loop {
            let frames = transport.sent_frames();
            let start = {
                let mut cursor = self.cursor.lock();
                let start = *cursor;
                *cursor = frames.len();
                start
            };
            if start == frames.len() {
                return;
            }
            for frame in &frames[start..] {
                self.handle(repo, frame);
            }
        }
    }

    fn handle(&self, repo: &Arc<Repo>, frame: &serde_json::Value) {
        let request = &frame["d"];
        let Some(number) = request["r"].as_u64() else {
            return;
        };
        let action = request["a"].as_str().unwrap_or("");
        let body = &request["b"];
        match action {
            "q" | "n" | "o" | "om" | "oc" | "s" => {
                respond(repo, number, "ok", serde_json::Value::Null);
            }
            "p" => {
                let path = Path::new(body["p"].as_str().unwrap_or("/"));
                if let Some(expected) = body["h"].as_str() {
                    let actual = simple_hash(&self.data_at(&path));
                    if expected != actual {
                        respond(repo, number, "datastale", serde_json::Value::Null);
                        return;
                    }
                }
                let node = Node::from_json(&body["d"]);
                self.set_data(&path, node.clone());
                push_data(repo, &path, node.to_json(false));
                respond(repo, number, "ok", serde_json::Value::Null);
            }
            "m" => {
                let path = Path::new(body["p"].as_str().unwrap_or("/"));
                if let Some(children) = body["d"].as_object() {
                    for (key, value) in children {
                        let child = path.append(&Path::new(key));
                        self.set_data(&child, Node::from_json(value));
                    }
                }
                let merged = self.data_at(&path);
                push_data(repo, &path, merged.to_json(false));
                respond(repo, number, "ok", serde_json::Value::Null);
            }
            "g" => {
                let path = Path::new(body["p"].as_str().unwrap_or("/"));
                let data = self.data_at(&path).to_json(false);
                respond(repo, number, "ok", data);
            }
            _ => {}
        }
    }
}

fn respond(repo: &Arc<Repo>, number: u64, status: &str, data: serde_json::Value) {
    repo.connection().handle_incoming(&serde_json::json!({
        "t": "d",
        "d": { "r": number, "b": { "s": status, "d": data } }
    }));
}

fn push_data(repo: &Arc<Repo>, path: &Path, data: serde_json::Value) {
    repo.connection().handle_incoming(&serde_json::json!({
        "t": "d",
        "d": { "a": "d", "b": { "p": path.to_string(), "d": data } }
    }));
}

fn hello(repo: &Arc<Repo>) {
    repo.connection().handle_incoming(&serde_json::json!({
        "t": "c",
        "d": { "t": "h", "d": { "ts": 1_700_000_000_000.0_f64, "s": "session", "h": "host" } }
    }));
}

struct Harness {
    repo: Arc<Repo>,
    transport: Arc<MockTransport>,
    server: FakeServer,
}

impl Harness {
    fn new() -> Self {
        let transport = Arc::new(MockTransport::new());
        let repo = Repo::new(
            ConnectionConfig::default(),
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::new(StaticCredentials::new()),
            Box::new(NoopPersistence),
        );
        Self {
            repo,
            transport,
            server: FakeServer::new(),
        }
    }

    fn connect(&self) {
        self.repo.open();
        hello(&self.repo);
        assert!(self.repo.connection().is_connected());
        self.pump();
    }

    /// Lets the fake server answer everything outstanding.
    fn pump(&self) {
        self.server.process(&self.repo, &self.transport);
    }

    /// Attaches a listener that records each value snapshot.
    fn watch(&self, path: &str) -> Arc<Mutex<Vec<serde_json::Value>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let on_event: EventCallback = Arc::new(move |event| {
            if event.kind == DataEventType::Value {
                sink.lock().push(event.node.to_json(false));
            }
        });
        self.repo.listen(
            QuerySpec::default_at(Path::new(path)),
            on_event,
            Arc::new(|_| {}),
        );
        self.pump();
        log
    }
}

#[test]
fn write_listen_and_read_back() {
    let h = Harness::new();
    h.connect();
    let log = h.watch("/users/ada");

    h.repo.set(
        Path::new("/users/ada"),
        serde_json::json!({ "name": "Ada", "score": 10 }),
        Box::new(|result| assert!(result.is_ok())),
    );
    h.pump();

    assert_eq!(
        log.lock().last().unwrap(),
        &serde_json::json!({ "name": "Ada", "score": 10 })
    );

    let read: Arc<Mutex<Option<SyncResult<Node>>>> = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&read);
    h.repo.get(
        QuerySpec::default_at(Path::new("/users/ada/score")),
        Box::new(move |result| *sink.lock() = Some(result)),
    );
    h.pump();
    let node = read.lock().take().unwrap().unwrap();
    assert_eq!(node.value().and_then(Scalar::as_number), Some(10.0));
}

#[test]
fn writes_made_offline_replay_on_connect() {
    let h = Harness::new();
    let log = h.watch("/doc");

    // Queued while disconnected; visible locally right away.
    h.repo
        .set(Path::new("/doc/title"), serde_json::json!("draft"), Box::new(|_| {}));
    h.repo.update(
        Path::new("/doc"),
        [("status".to_owned(), serde_json::json!("open"))].into(),
        Box::new(|_| {}),
    );
    assert!(log.lock().is_empty(), "no events before the cache completes");

    h.connect();
    h.pump();
    assert_eq!(
        h.server.data_at(&Path::new("/doc")).to_json(false),
        serde_json::json!({ "title": "draft", "status": "open" })
    );
    assert_eq!(
        log.lock().last().unwrap(),
        &serde_json::json!({ "title": "draft", "status": "open" })
    );
}

#[test]
fn contended_transaction_retries_until_it_wins() {
    let h = Harness::new();
    h.connect();
    let log = h.watch("/counter");
    h.repo
        .set(Path::new("/counter"), serde_json::json!(0), Box::new(|_| {}));
    h.pump();

    // Another client bumps the counter between our send and its arrival:
    // the first batch fails the hash check, the rerun sees the fresh value.
    h.server.set_data(&Path::new("/counter"), Node::leaf(50.0));
    let result: Arc<Mutex<Option<SyncResult<Node>>>> = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&result);
    h.repo.run_transaction(
        Path::new("/counter"),
        Arc::new(|current| {
            let n = current.value().and_then(Scalar::as_number).unwrap_or(0.0);
            Some(Node::leaf(n + 1.0))
        }),
        true,
        Box::new(move |r| *sink.lock() = Some(r)),
    );
    // First response is datastale; the server then echoes its data and the
    // retried batch commits.
    push_data(&h.repo, &Path::new("/counter"), serde_json::json!(50));
    h.pump();

    let committed = result.lock().take().unwrap().unwrap();
    assert_eq!(committed.value().and_then(Scalar::as_number), Some(51.0));
    assert_eq!(
        h.server
            .data_at(&Path::new("/counter"))
            .value()
            .and_then(Scalar::as_number),
        Some(51.0)
    );
    // Integral values serialize without a fractional part.
    assert_eq!(log.lock().last().unwrap(), &serde_json::json!(51));
}

#[test]
fn server_timestamp_resolves_against_server_clock() {
    let h = Harness::new();
    h.connect();
    let log = h.watch("/beat");
    h.repo.set(
        Path::new("/beat"),
        serde_json::json!({ ".sv": "timestamp" }),
        Box::new(|_| {}),
    );
    let local = log.lock().last().cloned().unwrap();
    assert!(local.as_f64().unwrap() > 1.0e12, "resolved to a clock value");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// After the server has acknowledged and echoed every write, the
    /// client's visible value matches a model applied write-by-write.
    #[test]
    fn acknowledged_writes_converge_with_the_server(
        writes in prop::collection::vec(
            (
                prop::sample::select(vec!["/a", "/a/x", "/a/y", "/b", "/b/z"]),
                0i64..100,
            ),
            1..20,
        )
    ) {
        let h = Harness::new();
        h.connect();
        let log = h.watch("/");
        // Seed the root listen so the view is complete before any write.
        push_data(&h.repo, &Path::root(), serde_json::Value::Null);

        let mut model = Node::empty();
        for (path, value) in &writes {
            let path = Path::new(path);
            model = model.update(&path, Node::from_json(&serde_json::json!(value)));
            h.repo.set(path, serde_json::json!(value), Box::new(|_| {}));
        }
        h.pump();

        prop_assert_eq!(
            h.server.data_at(&Path::root()).to_json(false),
            model.to_json(false)
        );
        let last_event = log.lock().last().cloned().unwrap();
        prop_assert_eq!(last_event, model.to_json(false));
    }
}
