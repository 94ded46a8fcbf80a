//! Duplex connection to the remote agent
//!
//! One `Connection` owns at most one websocket. The transport runs in a tokio
//! task; the handle and the task share the state behind a mutex together with
//! a generation counter. Every emission from the task is gated on the
//! generation it was spawned with, so once `cleanup()` (or a re-open) bumps
//! the generation, an outstanding connect or read can no longer revive the
//! connection or deliver events.
//!
//! ```text
//! closed --open()--> connecting --ready--> open --close()--> closing --> closed
//!    any --transport failure--> error --open()--> connecting
//! ```

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::error::{ConnectionError, ProtocolError, Result};
use crate::messages::AgentMessage;
use crate::options::ConnectionOptions;

/// Time allowed for the close handshake before the socket is dropped
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
    Closing,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Closed => "closed",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Error delivered through the event channel
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionFault {
    Transport(String),
    Decode(ProtocolError),
}

impl fmt::Display for ConnectionFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionFault::Transport(msg) => write!(f, "transport: {}", msg),
            ConnectionFault::Decode(err) => write!(f, "{}", err),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Status(ConnectionState),
    Message(AgentMessage),
    Error(ConnectionFault),
}

enum Command {
    Send(String),
    Close,
}

struct Shared {
    state: ConnectionState,
    generation: u64,
    events: Option<UnboundedSender<ConnectionEvent>>,
    commands: Option<UnboundedSender<Command>>,
}

impl Shared {
    fn emit(&self, event: ConnectionEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("Connection {} -> {}", self.state, state);
            self.state = state;
            self.emit(ConnectionEvent::Status(state));
        }
    }
}

/// Handle to one duplex channel
pub struct Connection {
    shared: Arc<Mutex<Shared>>,
    task: Option<JoinHandle<()>>,
}

impl Connection {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                state: ConnectionState::Closed,
                generation: 0,
                events: None,
                commands: None,
            })),
            task: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    /// Receive status, message and error events.
    ///
    /// There is a single subscriber: subscribing again replaces the previous
    /// receiver, which then sees its channel closed.
    pub fn subscribe(&self) -> UnboundedReceiver<ConnectionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.lock().events = Some(tx);
        rx
    }

    /// Start connecting to `url`. Must be called inside a tokio runtime.
    ///
    /// Only allowed from `closed` or `error`; anything else must be closed
    /// first.
    pub fn open(&mut self, url: &str, options: &ConnectionOptions) -> Result<()> {
        let state = self.state();
        match state {
            ConnectionState::Closed => {}
            ConnectionState::Error => self.cleanup(),
            other => return Err(ConnectionError::NotClosed(other)),
        }

        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(ConnectionError::InvalidUrl(url.to_string()));
        }

        let init_frame = AgentMessage::init_client_data(options.to_overrides()).encode()?;
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let generation = {
            let mut shared = self.shared.lock();
            shared.generation += 1;
            shared.commands = Some(command_tx);
            shared.set_state(ConnectionState::Connecting);
            shared.generation
        };

        info!("Connecting to agent");

        let task = tokio::spawn(run_transport(
            url.to_string(),
            init_frame,
            command_rx,
            Arc::clone(&self.shared),
            generation,
        ));
        self.task = Some(task);

        Ok(())
    }

    /// Transmit a message. Rejected unless the connection is open.
    pub fn send(&self, message: &AgentMessage) -> Result<()> {
        let shared = self.shared.lock();
        if shared.state != ConnectionState::Open {
            return Err(ConnectionError::NotOpen(shared.state));
        }

        let text = message.encode()?;
        shared
            .commands
            .as_ref()
            .ok_or_else(|| ConnectionError::Transport("transport task is gone".into()))?
            .send(Command::Send(text))
            .map_err(|_| ConnectionError::Transport("transport task is gone".into()))
    }

    /// Begin a graceful shutdown. The transport reports `closed` when done.
    ///
    /// No-op when already closed or closing. From `error` this is a cleanup.
    pub fn close(&mut self) {
        let mut shared = self.shared.lock();
        let state = shared.state;
        match state {
            ConnectionState::Closed | ConnectionState::Closing => {}
            ConnectionState::Error => {
                drop(shared);
                self.cleanup();
            }
            ConnectionState::Open | ConnectionState::Connecting => {
                shared.set_state(ConnectionState::Closing);
                let delivered = shared
                    .commands
                    .as_ref()
                    .map(|commands| commands.send(Command::Close).is_ok())
                    .unwrap_or(false);

                if !delivered {
                    shared.commands = None;
                    shared.set_state(ConnectionState::Closed);
                }
            }
        }
    }

    /// Tear down from any state. Always ends `closed`; no transport event is
    /// delivered afterwards. Idempotent.
    pub fn cleanup(&mut self) {
        {
            let mut shared = self.shared.lock();
            shared.generation += 1;
            shared.commands = None;
            shared.set_state(ConnectionState::Closed);
        }

        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Run `f` on the shared state only if `generation` is still current
fn with_current<F>(shared: &Mutex<Shared>, generation: u64, f: F) -> bool
where
    F: FnOnce(&mut Shared),
{
    let mut guard = shared.lock();
    if guard.generation != generation {
        return false;
    }
    f(&mut guard);
    true
}

fn fail(shared: &Mutex<Shared>, generation: u64, reason: String) {
    warn!("Connection failed: {}", reason);
    with_current(shared, generation, |s| {
        s.commands = None;
        s.set_state(ConnectionState::Error);
        s.emit(ConnectionEvent::Error(ConnectionFault::Transport(reason)));
    });
}

fn finish_closed(shared: &Mutex<Shared>, generation: u64) {
    with_current(shared, generation, |s| {
        s.commands = None;
        s.set_state(ConnectionState::Closed);
    });
}

async fn run_transport(
    url: String,
    init_frame: String,
    mut commands: UnboundedReceiver<Command>,
    shared: Arc<Mutex<Shared>>,
    generation: u64,
) {
    let connect = connect_async(url.as_str());
    tokio::pin!(connect);

    let ws = loop {
        tokio::select! {
            result = &mut connect => match result {
                Ok((ws, _response)) => break ws,
                Err(e) => {
                    fail(&shared, generation, e.to_string());
                    return;
                }
            },
            command = commands.recv() => match command {
                Some(Command::Close) | None => {
                    debug!("Connect abandoned");
                    finish_closed(&shared, generation);
                    return;
                }
                // send() rejects everything until the state is open
                Some(Command::Send(_)) => {}
            },
        }
    };

    let (mut write, mut read) = ws.split();

    // The client-init frame goes out before anything else
    if let Err(e) = write.send(Message::Text(init_frame)).await {
        fail(&shared, generation, e.to_string());
        return;
    }

    let opened = with_current(&shared, generation, |s| {
        if s.state == ConnectionState::Connecting {
            s.set_state(ConnectionState::Open);
        }
    });
    if !opened {
        return;
    }
    info!("Agent connection open");

    loop {
        tokio::select! {
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let event = match AgentMessage::decode(&text) {
                        Ok(message) => ConnectionEvent::Message(message),
                        Err(e) => {
                            warn!("Dropping undecodable frame: {}", e);
                            ConnectionEvent::Error(ConnectionFault::Decode(e))
                        }
                    };
                    if !with_current(&shared, generation, |s| s.emit(event)) {
                        return;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    info!("Agent closed the connection: {:?}", frame);
                    finish_closed(&shared, generation);
                    return;
                }
                Some(Ok(Message::Binary(data))) => {
                    debug!("Ignoring {} byte binary frame", data.len());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    fail(&shared, generation, e.to_string());
                    return;
                }
                None => {
                    finish_closed(&shared, generation);
                    return;
                }
            },
            command = commands.recv() => match command {
                Some(Command::Send(text)) => {
                    if let Err(e) = write.send(Message::Text(text)).await {
                        fail(&shared, generation, e.to_string());
                        return;
                    }
                }
                Some(Command::Close) | None => {
                    let graceful = tokio::time::timeout(CLOSE_TIMEOUT, async {
                        if write.send(Message::Close(None)).await.is_err() {
                            return;
                        }
                        while let Some(Ok(frame)) = read.next().await {
                            if frame.is_close() {
                                break;
                            }
                        }
                    })
                    .await;

                    if graceful.is_err() {
                        debug!("Close handshake timed out");
                    }
                    finish_closed(&shared, generation);
                    return;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    async fn next_event(events: &mut UnboundedReceiver<ConnectionEvent>) -> ConnectionEvent {
        timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("no event within 5s")
            .expect("event channel closed")
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
        assert_eq!(
            serde_json::to_string(&ConnectionState::Error).unwrap(),
            "\"error\""
        );
    }

    #[test]
    fn test_new_connection_is_closed() {
        let connection = Connection::new();
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_send_rejected_when_closed() {
        let connection = Connection::new();
        let err = connection.send(&AgentMessage::user_activity()).unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::NotOpen(ConnectionState::Closed)
        ));
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let mut connection = Connection::new();
        let mut events = connection.subscribe();
        connection.cleanup();
        connection.cleanup();
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_close_when_closed_is_noop() {
        let mut connection = Connection::new();
        let mut events = connection.subscribe();
        connection.close();
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_open_rejects_bad_scheme() {
        let mut connection = Connection::new();
        let err = connection
            .open("http://example.invalid", &ConnectionOptions::new())
            .unwrap_err();
        assert!(matches!(err, ConnectionError::InvalidUrl(_)));
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_open_twice_rejected() {
        // Accepts TCP but never answers the websocket handshake
        let silent = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("ws://{}", silent.local_addr().unwrap());

        let mut connection = Connection::new();
        let _events = connection.subscribe();
        connection.open(&url, &ConnectionOptions::new()).unwrap();
        assert_eq!(connection.state(), ConnectionState::Connecting);

        let err = connection
            .open(&url, &ConnectionOptions::new())
            .unwrap_err();
        assert!(matches!(err, ConnectionError::NotClosed(_)));
        connection.cleanup();
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_resubscribe_replaces_receiver() {
        let mut connection = Connection::new();
        let mut first = connection.subscribe();
        let mut second = connection.subscribe();

        assert!(matches!(
            first.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));

        connection.shared.lock().set_state(ConnectionState::Error);
        connection.close();
        assert_eq!(
            second.try_recv().unwrap(),
            ConnectionEvent::Status(ConnectionState::Error)
        );
        assert_eq!(
            second.try_recv().unwrap(),
            ConnectionEvent::Status(ConnectionState::Closed)
        );
    }

    #[tokio::test]
    async fn test_close_while_connecting_abandons_connect() {
        // Accepts TCP but never answers the websocket handshake
        let silent = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("ws://{}", silent.local_addr().unwrap());

        let mut connection = Connection::new();
        let mut events = connection.subscribe();
        connection.open(&url, &ConnectionOptions::new()).unwrap();
        assert_eq!(
            next_event(&mut events).await,
            ConnectionEvent::Status(ConnectionState::Connecting)
        );

        connection.close();
        assert_eq!(
            next_event(&mut events).await,
            ConnectionEvent::Status(ConnectionState::Closing)
        );
        assert_eq!(
            next_event(&mut events).await,
            ConnectionEvent::Status(ConnectionState::Closed)
        );
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_open_recovers_from_error() {
        let refused = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            format!("ws://{}", listener.local_addr().unwrap())
        };

        let agent = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let agent_url = format!("ws://{}", agent.local_addr().unwrap());
        tokio::spawn(async move {
            let (stream, _) = agent.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let mut connection = Connection::new();
        let mut events = connection.subscribe();
        connection.open(&refused, &ConnectionOptions::new()).unwrap();
        assert_eq!(
            next_event(&mut events).await,
            ConnectionEvent::Status(ConnectionState::Connecting)
        );
        assert_eq!(
            next_event(&mut events).await,
            ConnectionEvent::Status(ConnectionState::Error)
        );
        assert!(matches!(
            next_event(&mut events).await,
            ConnectionEvent::Error(ConnectionFault::Transport(_))
        ));

        connection.open(&agent_url, &ConnectionOptions::new()).unwrap();
        let statuses = [
            ConnectionState::Closed,
            ConnectionState::Connecting,
            ConnectionState::Open,
        ];
        for expected in statuses {
            assert_eq!(next_event(&mut events).await, ConnectionEvent::Status(expected));
        }

        connection.cleanup();
    }
}
