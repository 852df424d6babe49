//! Reconnecting WebSocket transport to the execution backend.
//!
//! One background task owns the socket. It walks
//! `Init → Opening → Opened → Reopening → Opening → …`, retrying after a fixed
//! delay whenever a connection fails or drops. Outbound frames go through a
//! per-connection queue that is detached only by the connection that owns it,
//! so a replaced socket can never receive writes or start a second retry cycle.
//!
//! Delivery is at most once: a command is applied to the local model first and
//! then queued on the open connection. Nothing is replayed after a reconnect.
//!
//! The loop lives as long as some [`Transport`] handle does. Each `open` starts
//! a new run; `shutdown` ends it, after which the old loop can neither change
//! the status nor attach a socket even if it has not been cancelled yet.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use shared_types::Command;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::activity::Direction;
use crate::error::ClientError;
use crate::model::SharedModel;

/// Direction recorded when a local command is sent.
///
/// Outbound traffic currently reports `Down`, the same as inbound pushes, which
/// is what the connectivity icon has always shown for a send.
// TODO: switch to Direction::Up once the icon's meaning for sends is settled.
const OUTBOUND_DIRECTION: Direction = Direction::Down;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    /// No connection attempt made yet
    Init,
    /// Connection attempt in flight
    Opening,
    /// Connected; traffic flows both ways
    Opened,
    /// Connection lost; waiting to retry
    Reopening,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionStatus::Init => "INIT",
            ConnectionStatus::Opening => "OPENING",
            ConnectionStatus::Opened => "OPENED",
            ConnectionStatus::Reopening => "REOPENING",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type StatusListener = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Outbound {
    generation: u64,
    tx: mpsc::UnboundedSender<Message>,
}

struct StatusBoard {
    status: ConnectionStatus,
    /// Bumped by every `open` and `shutdown`.
    run: u64,
    listeners: Vec<(SubscriptionId, StatusListener)>,
}

impl StatusBoard {
    fn listeners(&self) -> Vec<StatusListener> {
        self.listeners
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect()
    }
}

/// State the connection loop shares with the handles.
struct Shared {
    url: String,
    reconnect_delay: Duration,
    connect_timeout: Duration,
    model: SharedModel,
    board: Mutex<StatusBoard>,
    /// Held while listeners are called, so each one sees changes in order.
    delivery: Mutex<()>,
    next_subscription: AtomicU64,
    outbound: Mutex<Option<Outbound>>,
    generation: AtomicU64,
}

/// Owns the loop task. Only reachable through handles, never from the task.
struct Driver {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Driver {
    fn drop(&mut self) {
        let task = self
            .task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = task {
            debug!(url = %self.shared.url, "Last transport handle dropped; stopping");
            handle.abort();
        }
        self.shared.stop();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cloneable handle to one logical backend connection.
#[derive(Clone)]
pub struct Transport {
    driver: Arc<Driver>,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("url", &self.shared().url)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Transport {
    pub fn new(url: impl Into<String>, reconnect_delay: Duration, model: SharedModel) -> Self {
        Self::with_connect_timeout(url, reconnect_delay, DEFAULT_CONNECT_TIMEOUT, model)
    }

    pub fn with_connect_timeout(
        url: impl Into<String>,
        reconnect_delay: Duration,
        connect_timeout: Duration,
        model: SharedModel,
    ) -> Self {
        let shared = Arc::new(Shared {
            url: url.into(),
            reconnect_delay,
            connect_timeout,
            model,
            board: Mutex::new(StatusBoard {
                status: ConnectionStatus::Init,
                run: 0,
                listeners: Vec::new(),
            }),
            delivery: Mutex::new(()),
            next_subscription: AtomicU64::new(1),
            outbound: Mutex::new(None),
            generation: AtomicU64::new(0),
        });
        Self {
            driver: Arc::new(Driver {
                shared,
                task: Mutex::new(None),
            }),
        }
    }

    fn shared(&self) -> &Shared {
        &self.driver.shared
    }

    pub fn url(&self) -> &str {
        &self.shared().url
    }

    pub fn model(&self) -> &SharedModel {
        &self.shared().model
    }

    /// Start the connection loop. Calling again while it runs does nothing.
    pub fn open(&self) {
        let mut task = lock(&self.driver.task);
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let run = self.shared().begin_run();
        let shared = Arc::clone(&self.driver.shared);
        *task = Some(tokio::spawn(connection_loop(shared, run)));
    }

    /// Stop the connection loop and drop the current connection.
    ///
    /// Status returns to `Init`; `open` may be called again later.
    pub fn shutdown(&self) {
        if let Some(handle) = lock(&self.driver.task).take() {
            handle.abort();
        }
        self.shared().stop();
    }

    pub fn status(&self) -> ConnectionStatus {
        lock(&self.shared().board).status
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.shared().outbound).is_some()
    }

    /// Register a status callback. It is called right away with the current
    /// status and then on every change, in order.
    ///
    /// Callbacks run on whichever thread changed the status. They must not
    /// subscribe, open or shut down this transport.
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(ConnectionStatus) + Send + Sync + 'static,
    {
        let shared = self.shared();
        let id = SubscriptionId(shared.next_subscription.fetch_add(1, Ordering::SeqCst));
        let listener: StatusListener = Arc::new(listener);

        let _delivery = lock(&shared.delivery);
        let current = {
            let mut board = lock(&shared.board);
            board.listeners.push((id, listener.clone()));
            board.status
        };
        listener(current);
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        lock(&self.shared().board)
            .listeners
            .retain(|(existing, _)| *existing != id);
    }

    /// Apply `command` locally, then queue it on the open connection.
    ///
    /// The local apply happens even when there is no connection; in that case
    /// the command is not retried and `NotConnected` is returned.
    pub fn send(&self, command: Command) -> Result<(), ClientError> {
        let model = &self.shared().model;
        model.set_connection_direction(Some(OUTBOUND_DIRECTION));
        model.apply_command(&command);
        info!(%command, "Send");

        let text = command.encode()?;
        let outbound = lock(&self.shared().outbound);
        let Some(outbound) = outbound.as_ref() else {
            warn!(kind = %command.kind(), "Send while disconnected; command applied locally only");
            return Err(ClientError::NotConnected);
        };
        outbound
            .tx
            .send(Message::Text(text))
            .map_err(|_| ClientError::NotConnected)
    }

    /// Send an untyped payload. Anything the dispatch registry does not
    /// recognise as a command is refused before touching the model.
    pub fn send_value(&self, payload: &serde_json::Value) -> Result<(), ClientError> {
        let command = shared_types::decode(payload).map_err(ClientError::InvalidCommand)?;
        self.send(command)
    }

    /// Handle one inbound text frame. Returns whether a command was applied.
    ///
    /// Undecodable frames are logged and dropped without touching the model.
    pub fn handle_incoming(&self, text: &str) -> bool {
        self.shared().handle_incoming(text)
    }
}

impl Shared {
    fn begin_run(&self) -> u64 {
        let mut board = lock(&self.board);
        board.run += 1;
        board.run
    }

    /// Move to `status` on behalf of `run`. Returns false once that run has
    /// been superseded, in which case nothing changes.
    fn transition(&self, run: u64, status: ConnectionStatus) -> bool {
        let _delivery = lock(&self.delivery);
        let listeners = {
            let mut board = lock(&self.board);
            if board.run != run {
                return false;
            }
            if board.status == status {
                return true;
            }
            board.status = status;
            board.listeners()
        };
        debug!(%status, url = %self.url, "Connection status changed");
        for listener in listeners {
            listener(status);
        }
        true
    }

    /// End the current run, drop its connection and return to `Init`.
    fn stop(&self) {
        let _delivery = lock(&self.delivery);
        let listeners = {
            let mut board = lock(&self.board);
            board.run += 1;
            lock(&self.outbound).take();
            if board.status == ConnectionStatus::Init {
                return;
            }
            board.status = ConnectionStatus::Init;
            board.listeners()
        };
        debug!(url = %self.url, "Connection status changed to INIT");
        for listener in listeners {
            listener(ConnectionStatus::Init);
        }
    }

    fn handle_incoming(&self, text: &str) -> bool {
        let command = match shared_types::decode_str(text) {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, "Bad command; dropping message");
                return false;
            }
        };
        info!(%command, "Incoming");
        self.model.set_connection_direction(Some(Direction::Down));
        self.model.apply_command(&command);
        true
    }

    fn attach(&self, run: u64, generation: u64, tx: mpsc::UnboundedSender<Message>) -> bool {
        let board = lock(&self.board);
        if board.run != run {
            return false;
        }
        let previous = lock(&self.outbound).replace(Outbound { generation, tx });
        if let Some(previous) = previous {
            warn!(
                previous = previous.generation,
                generation, "Replacing a connection that was still attached"
            );
        }
        true
    }

    fn detach(&self, generation: u64) {
        let mut outbound = lock(&self.outbound);
        if outbound
            .as_ref()
            .is_some_and(|current| current.generation == generation)
        {
            outbound.take();
        }
    }

    /// Pump one established connection until it closes or fails.
    async fn serve(&self, run: u64, socket: WebSocketStream<MaybeTlsStream<TcpStream>>) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        if !self.attach(run, generation, tx) {
            debug!(url = %self.url, generation, "Transport stopped; dropping new connection");
            let _ = sink.close().await;
            return;
        }
        info!(url = %self.url, generation, "Connected to WebSocket");
        self.transition(run, ConnectionStatus::Opened);

        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        self.handle_incoming(&text);
                    }
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => {
                            self.handle_incoming(&text);
                        }
                        Err(_) => warn!("Dropping non UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Close(reason))) => {
                        info!(?reason, "Closed by backend");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    None => break,
                },
                message = rx.recv() => match message {
                    Some(message) => {
                        if let Err(e) = sink.send(message).await {
                            warn!(error = %e, "WebSocket write failed");
                            break;
                        }
                    }
                    // Queue dropped by shutdown.
                    None => break,
                },
            }
        }

        self.detach(generation);
        let _ = sink.close().await;
    }
}

async fn connection_loop(shared: Arc<Shared>, run: u64) {
    while shared.transition(run, ConnectionStatus::Opening) {
        debug!(url = %shared.url, "Opening socket");
        let connect = connect_async(shared.url.as_str());
        match timeout(shared.connect_timeout, connect).await {
            Ok(Ok((socket, _response))) => shared.serve(run, socket).await,
            Ok(Err(e)) => debug!(url = %shared.url, error = %e, "Connect failed"),
            Err(_) => warn!(
                url = %shared.url,
                timeout_ms = shared.connect_timeout.as_millis() as u64,
                "Connect timed out"
            ),
        }
        if !shared.transition(run, ConnectionStatus::Reopening) {
            break;
        }
        info!(delay_ms = shared.reconnect_delay.as_millis() as u64, "Closed; reopening");
        tokio::time::sleep(shared.reconnect_delay).await;
    }
    debug!(url = %shared.url, run, "Connection loop stopped");
}
