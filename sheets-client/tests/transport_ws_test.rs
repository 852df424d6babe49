//! Transport WebSocket Integration Tests
//!
//! Each test runs a throwaway backend on 127.0.0.1:0 that records what the
//! client sends and can push commands or drop connections on demand.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{accept_async, tungstenite::Message};

use sheets_client::{Config, ConnectionStatus, Notebook, SharedModel, Transport};

#[derive(Default)]
struct ServerStats {
    accepted: AtomicUsize,
    open: AtomicUsize,
    max_open: AtomicUsize,
}

struct TestServer {
    addr: SocketAddr,
    stats: Arc<ServerStats>,
    received: mpsc::UnboundedReceiver<Value>,
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl TestServer {
    fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    async fn recv_json(&mut self) -> Value {
        match timeout(Duration::from_secs(5), self.received.recv()).await {
            Ok(Some(value)) => value,
            Ok(None) => panic!("Server stopped"),
            Err(_) => panic!("Timeout waiting for client message"),
        }
    }
}

/// Start a backend that closes its first `close_first` connections right after
/// the handshake and greets every later one with `greeting`.
async fn start_test_server(close_first: usize, greeting: Vec<Value>) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind listener");
    let addr = listener.local_addr().expect("Failed to get addr");
    let stats = Arc::new(ServerStats::default());
    let (tx, received) = mpsc::unbounded_channel();

    let server_stats = stats.clone();
    let handle = tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            let index = server_stats.accepted.fetch_add(1, Ordering::SeqCst);
            let stats = server_stats.clone();
            let tx = tx.clone();
            let greeting = greeting.clone();

            tokio::spawn(async move {
                let Ok(mut ws) = accept_async(tcp).await else {
                    return;
                };
                let open = stats.open.fetch_add(1, Ordering::SeqCst) + 1;
                stats.max_open.fetch_max(open, Ordering::SeqCst);

                if index < close_first {
                    stats.open.fetch_sub(1, Ordering::SeqCst);
                    let _ = ws.close(None).await;
                    return;
                }

                for message in greeting {
                    ws.send(Message::Text(message.to_string()))
                        .await
                        .expect("Send error");
                }
                while let Some(Ok(frame)) = ws.next().await {
                    if let Message::Text(text) = frame {
                        let value: Value = serde_json::from_str(&text).expect("Invalid JSON");
                        let _ = tx.send(value);
                    }
                }
                stats.open.fetch_sub(1, Ordering::SeqCst);
            });
        }
    });

    TestServer {
        addr,
        stats,
        received,
        handle,
    }
}

fn test_config(url: String) -> Config {
    Config {
        server_url: url,
        reconnect_delay: Duration::from_millis(20),
        ..Config::default()
    }
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let waited = timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    if waited.is_err() {
        panic!("Timeout waiting for {what}");
    }
}

fn record_statuses(transport: &Transport) -> Arc<Mutex<Vec<ConnectionStatus>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    transport.subscribe(move |status| sink.lock().unwrap().push(status));
    seen
}

fn assert_valid_transitions(statuses: &[ConnectionStatus]) {
    use ConnectionStatus::*;
    for pair in statuses.windows(2) {
        let allowed = matches!(
            (pair[0], pair[1]),
            (Init, Opening)
                | (Opening, Opened)
                | (Opening, Reopening)
                | (Opened, Reopening)
                | (Reopening, Opening)
        );
        assert!(allowed, "unexpected transition {:?} -> {:?}", pair[0], pair[1]);
    }
}

#[tokio::test]
async fn test_notebook_goes_live_on_connect() {
    let server = start_test_server(0, Vec::new()).await;
    let notebook = Notebook::new(&test_config(server.url()));
    let statuses = record_statuses(notebook.transport());
    assert!(!notebook.model().connection_live());

    notebook.open();
    wait_until("live connection", || notebook.model().connection_live()).await;

    assert_eq!(notebook.transport().status(), ConnectionStatus::Opened);
    assert_eq!(
        statuses.lock().unwrap()[..3],
        [
            ConnectionStatus::Init,
            ConnectionStatus::Opening,
            ConnectionStatus::Opened
        ]
    );
}

#[tokio::test]
async fn test_local_actions_reach_backend() {
    let mut server = start_test_server(0, Vec::new()).await;
    let notebook = Notebook::new(&test_config(server.url()));
    notebook.open();
    wait_until("connection", || notebook.transport().is_connected()).await;

    notebook.update_file("a.py", "x = 1").expect("edit should be sent");
    notebook.execute_file("a.py", true).expect("run should be sent");
    notebook
        .delete_file("a.py", |_| true)
        .expect("delete should be sent");

    let edit = server.recv_json().await;
    assert_eq!(edit["command"], "FileEdit");
    assert_eq!(edit["filename"], "a.py");
    assert_eq!(edit["content"], "x = 1");
    assert_eq!(edit["external_edit"], false);

    let run = server.recv_json().await;
    assert_eq!(run["command"], "ExecutionRequest");
    assert_eq!(run["content"], "x = 1");
    assert_eq!(run["subexpressions"], true);

    let delete = server.recv_json().await;
    assert_eq!(delete["command"], "FileDelete");
    assert!(notebook.model().file("a.py").is_none());
}

#[tokio::test]
async fn test_backend_pushes_are_applied_and_bad_ones_dropped() {
    let greeting = vec![
        json!({"command": "FileEdit", "filename": "a.py", "content": "x = 1", "external_edit": true}),
        json!({"command": "NotARealThing", "filename": "a.py"}),
        json!({"filename": "a.py", "content": "no kind"}),
        json!({"command": "Analysis", "filename": "a.py", "content": "x = 1", "properties": {"variables_used": []}}),
        json!({"command": "Analysis", "filename": "gone.py", "content": "", "properties": {}}),
        json!({
            "command": "Execution",
            "filename": "a.py",
            "content": "x = 1",
            "emitted": [],
            "defines": {"x": {"repr": "1", "self_naming": false}},
            "start_time": 1.0,
            "end_time": 1.5,
            "exec_time": 0.5,
            "with_subexpressions": false,
        }),
    ];
    let server = start_test_server(0, greeting).await;
    let notebook = Notebook::new(&test_config(server.url()));
    notebook.open();

    let model = notebook.model().clone();
    wait_until("execution result", || {
        model.file("a.py").is_some_and(|file| file.output.is_some())
    })
    .await;

    let snapshot = model.snapshot();
    assert_eq!(snapshot.file_names(), vec!["a.py".to_string()]);
    let file = snapshot.file("a.py").unwrap();
    assert!(file.external_edit);
    assert!(file.analysis.is_some());
    assert!(!file.is_executing);
    assert!(!file.output_is_stale());
    assert_eq!(notebook.transport().status(), ConnectionStatus::Opened);
    assert_eq!(server.stats.accepted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_reconnect_converges_after_forced_closures() {
    let server = start_test_server(3, Vec::new()).await;
    let model = SharedModel::default();
    let transport = Transport::new(server.url(), Duration::from_millis(20), model);
    let statuses = record_statuses(&transport);

    transport.open();
    wait_until("fourth connection", || {
        transport.status() == ConnectionStatus::Opened
            && server.stats.accepted.load(Ordering::SeqCst) >= 4
    })
    .await;

    let statuses = statuses.lock().unwrap().clone();
    assert_valid_transitions(&statuses);
    let reopenings = statuses
        .iter()
        .filter(|s| **s == ConnectionStatus::Reopening)
        .count();
    assert!(reopenings >= 3, "saw {reopenings} reopenings: {statuses:?}");
    assert_eq!(server.stats.max_open.load(Ordering::SeqCst), 1);
    assert!(transport.is_connected());
}

#[tokio::test]
async fn test_keeps_retrying_without_backend() {
    // Bind and release a port so nothing is listening on it.
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let transport = Transport::new(
        format!("ws://{addr}"),
        Duration::from_millis(10),
        SharedModel::default(),
    );
    let statuses = record_statuses(&transport);

    transport.open();
    wait_until("several attempts", || {
        statuses
            .lock()
            .unwrap()
            .iter()
            .filter(|s| **s == ConnectionStatus::Reopening)
            .count()
            >= 3
    })
    .await;

    let statuses = statuses.lock().unwrap().clone();
    assert_valid_transitions(&statuses);
    assert!(!statuses.contains(&ConnectionStatus::Opened));
    assert!(!transport.is_connected());
}

#[tokio::test]
async fn test_shutdown_returns_to_init() {
    let server = start_test_server(0, Vec::new()).await;
    let transport = Transport::new(server.url(), Duration::from_millis(20), SharedModel::default());
    transport.open();
    wait_until("connection", || transport.is_connected()).await;

    transport.shutdown();
    assert_eq!(transport.status(), ConnectionStatus::Init);
    assert!(!transport.is_connected());

    transport.open();
    wait_until("second connection", || transport.is_connected()).await;
    assert_eq!(server.stats.accepted.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_dropping_last_handle_stops_reconnecting() {
    // Every connection is closed right away, so a live loop keeps dialing.
    let server = start_test_server(usize::MAX, Vec::new()).await;
    let transport = Transport::new(server.url(), Duration::from_millis(10), SharedModel::default());
    let clone = transport.clone();
    transport.open();
    wait_until("repeated connections", || {
        server.stats.accepted.load(Ordering::SeqCst) >= 3
    })
    .await;

    drop(transport);
    drop(clone);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let settled = server.stats.accepted.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(server.stats.accepted.load(Ordering::SeqCst), settled);
}

#[tokio::test]
async fn test_stalled_handshake_times_out_and_retries() {
    // Accepts TCP connections but never answers the WebSocket upgrade.
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind listener");
    let addr = listener.local_addr().expect("Failed to get addr");
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();
    let silent = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((tcp, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            held.push(tcp);
        }
    });

    let transport = Transport::with_connect_timeout(
        format!("ws://{addr}"),
        Duration::from_millis(10),
        Duration::from_millis(100),
        SharedModel::default(),
    );
    let statuses = record_statuses(&transport);
    transport.open();
    wait_until("timed-out attempts", || {
        statuses
            .lock()
            .unwrap()
            .iter()
            .filter(|s| **s == ConnectionStatus::Reopening)
            .count()
            >= 2
    })
    .await;
    silent.abort();

    let statuses = statuses.lock().unwrap().clone();
    assert_valid_transitions(&statuses);
    assert!(!statuses.contains(&ConnectionStatus::Opened));
    assert!(accepted.load(Ordering::SeqCst) >= 2);
    assert!(!transport.is_connected());
}

#[tokio::test]
async fn test_notebook_uses_configured_connect_timeout() {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind listener");
    let addr = listener.local_addr().expect("Failed to get addr");
    let silent = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((tcp, _)) = listener.accept().await {
            held.push(tcp);
        }
    });

    let notebook = Notebook::new(&Config {
        connect_timeout: Duration::from_millis(50),
        ..test_config(format!("ws://{addr}"))
    });
    let statuses = record_statuses(notebook.transport());
    notebook.open();
    wait_until("a timed-out attempt", || {
        statuses.lock().unwrap().contains(&ConnectionStatus::Reopening)
    })
    .await;
    silent.abort();
    assert!(!notebook.model().connection_live());
}
