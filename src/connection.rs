//! Single-connection management: connect, login, reader task, actions.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::{
    action::{Action, ActionResponse},
    config::ManagerConfig,
    constants::{MAX_EVENT_QUEUE_SIZE, SOCKET_BUF_SIZE},
    error::{AmiError, AmiResult},
    event::RawEvent,
    protocol::{AmiFrame, AmiParser, FrameKind},
};

/// Connection status for a manager session
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionStatus {
    /// Session is active.
    Connected,
    /// Session ended.
    Disconnected(DisconnectReason),
}

/// Reason for disconnection
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DisconnectReason {
    /// TCP I/O error (io::Error is not Clone, so we store the message)
    IoError(String),
    /// Clean EOF on the TCP connection
    ConnectionClosed,
    /// Client called disconnect()
    ClientRequested,
    /// The stream produced a frame the parser could not make sense of
    ProtocolError(String),
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::IoError(msg) => write!(f, "I/O error: {}", msg),
            DisconnectReason::ConnectionClosed => write!(f, "connection closed"),
            DisconnectReason::ClientRequested => write!(f, "client requested disconnect"),
            DisconnectReason::ProtocolError(msg) => write!(f, "protocol error: {}", msg),
        }
    }
}

/// Establish a TCP connection with a timeout.
async fn tcp_connect_with_timeout(
    host: &str,
    port: u16,
    connect_timeout: Duration,
) -> AmiResult<TcpStream> {
    let timeout_ms = connect_timeout.as_millis() as u64;
    let tcp_result = timeout(connect_timeout, TcpStream::connect((host, port))).await;

    match tcp_result {
        Ok(Ok(s)) => {
            debug!("[CONNECT] TCP connection established");
            Ok(s)
        }
        Ok(Err(e)) => {
            warn!("[CONNECT] TCP connect failed: {}", e);
            Err(AmiError::Io(e))
        }
        Err(_) => {
            warn!("[CONNECT] TCP connect timed out after {}ms", timeout_ms);
            Err(AmiError::Timeout { timeout_ms })
        }
    }
}

/// Shared state between ManagerConnection and the reader task
struct SharedState {
    pending_reply: Mutex<Option<oneshot::Sender<AmiFrame>>>,
    /// Action reply timeout in milliseconds
    action_timeout_ms: AtomicU64,
    /// Set when events have been dropped due to a full queue
    event_overflow: AtomicBool,
    /// Total count of dropped events
    dropped_event_count: AtomicU64,
}

/// Options fixed at connection time.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Capacity of the mpsc channel delivering events. Default: 1000.
    pub event_queue_size: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            event_queue_size: MAX_EVENT_QUEUE_SIZE,
        }
    }
}

/// Manager connection handle (Clone + Send)
///
/// Actions are serialized through the writer mutex. The reader task
/// routes replies to the pending oneshot channel.
#[derive(Clone)]
pub struct ManagerConnection {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    shared: Arc<SharedState>,
    status_rx: watch::Receiver<ConnectionStatus>,
    server_version: Arc<str>,
}

impl std::fmt::Debug for ManagerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerConnection")
            .field("connected", &self.is_connected())
            .field("server_version", &self.server_version)
            .finish()
    }
}

/// Event stream receiver (!Clone)
///
/// Receives raw events from the background reader task via an mpsc channel.
///
/// Events are delivered as `Result<RawEvent, AmiError>`. An
/// `Err(AmiError::QueueFull)` indicates that one or more events were
/// dropped because the application fell behind. Use
/// [`ManagerConnection::dropped_event_count`] for the exact count.
pub struct AmiEventStream {
    rx: mpsc::Receiver<Result<RawEvent, AmiError>>,
    status_rx: watch::Receiver<ConnectionStatus>,
}

impl std::fmt::Debug for AmiEventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmiEventStream")
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Read a single frame from the socket into the parser.
///
/// Used during the login handshake, on the unsplit TcpStream.
async fn recv_frame(
    stream: &mut TcpStream,
    parser: &mut AmiParser,
    read_buffer: &mut [u8],
    read_timeout: Duration,
) -> AmiResult<AmiFrame> {
    loop {
        if let Some(frame) = parser.parse_frame()? {
            trace!("[RECV] Parsed frame from buffer: {:?}", frame.kind);
            return Ok(frame);
        }

        trace!("[RECV] Buffer needs more data, reading from socket");
        let read_result = timeout(read_timeout, stream.read(read_buffer)).await;

        let bytes_read = match read_result {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(AmiError::Io(e)),
            Err(_) => {
                return Err(AmiError::Timeout {
                    timeout_ms: read_timeout.as_millis() as u64,
                })
            }
        };

        trace!("[RECV] Read {} bytes from socket", bytes_read);
        if bytes_read == 0 {
            return Err(AmiError::ConnectionClosed);
        }

        parser.add_data(&read_buffer[..bytes_read])?;
    }
}

/// Perform the login handshake on the stream.
///
/// The server greets with a version banner line, then the client sends a
/// `Login` action and waits for the response frame.
async fn login(
    stream: &mut TcpStream,
    parser: &mut AmiParser,
    read_buffer: &mut [u8],
    config: &ManagerConfig,
) -> AmiResult<String> {
    debug!("[AUTH] Waiting for version banner");
    let banner = recv_frame(stream, parser, read_buffer, config.connect_timeout).await?;
    if banner.kind != FrameKind::Banner {
        return Err(AmiError::protocol_error("Expected version banner"));
    }
    let version = banner.banner.unwrap_or_default();
    debug!("[AUTH] Server banner: {}", version);

    let action = Action::login(&config.username, &config.password);
    let wire = action.to_wire_format()?;
    debug!("Sending action: Login [REDACTED]");
    stream.write_all(wire.as_bytes()).await.map_err(AmiError::Io)?;

    let reply = recv_frame(stream, parser, read_buffer, config.connect_timeout).await?;
    if reply.kind != FrameKind::Response {
        return Err(AmiError::protocol_error("Expected login response"));
    }
    let response = ActionResponse::new(reply.fields);
    if !response.is_success() {
        return Err(AmiError::auth_failed(
            response
                .message()
                .unwrap_or("Authentication failed")
                .to_string(),
        ));
    }

    debug!("Authentication successful");
    Ok(version)
}

/// Try to send an event (or error) to the application via try_send.
///
/// If the channel is full, drop the item, set the overflow flag, and
/// increment the dropped counter. Before each dispatch, check the overflow
/// flag and attempt to deliver a QueueFull error notification first.
fn dispatch_event(
    event_tx: &mpsc::Sender<Result<RawEvent, AmiError>>,
    shared: &SharedState,
    item: Result<RawEvent, AmiError>,
) -> bool {
    if shared.event_overflow.load(Ordering::Relaxed) {
        match event_tx.try_send(Err(AmiError::QueueFull)) {
            Ok(()) => {
                shared.event_overflow.store(false, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return false,
            Err(mpsc::error::TrySendError::Full(_)) => {}
        }
    }

    match event_tx.try_send(item) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Closed(_)) => false,
        Err(mpsc::error::TrySendError::Full(_)) => {
            shared.event_overflow.store(true, Ordering::Relaxed);
            shared.dropped_event_count.fetch_add(1, Ordering::Relaxed);
            warn!("Event queue full, dropping event");
            true
        }
    }
}

/// Background reader loop
async fn reader_loop(
    reader: OwnedReadHalf,
    parser: AmiParser,
    shared: Arc<SharedState>,
    status_tx: watch::Sender<ConnectionStatus>,
    event_tx: mpsc::Sender<Result<RawEvent, AmiError>>,
) {
    let result = std::panic::AssertUnwindSafe(reader_loop_inner(
        reader,
        parser,
        shared,
        status_tx.clone(),
        event_tx,
    ));
    if futures_util::FutureExt::catch_unwind(result).await.is_err() {
        tracing::error!("reader task panicked");
        let _ = status_tx.send(ConnectionStatus::Disconnected(DisconnectReason::IoError(
            "reader task panicked".to_string(),
        )));
    }
}

async fn reader_loop_inner(
    mut reader: OwnedReadHalf,
    mut parser: AmiParser,
    shared: Arc<SharedState>,
    status_tx: watch::Sender<ConnectionStatus>,
    event_tx: mpsc::Sender<Result<RawEvent, AmiError>>,
) {
    let mut read_buffer = [0u8; SOCKET_BUF_SIZE];

    loop {
        // Try to parse a complete frame from buffered data first
        match parser.parse_frame() {
            Ok(Some(frame)) => {
                match frame.kind {
                    FrameKind::Event => {
                        let raw = RawEvent::from_fields(frame.fields);
                        if !dispatch_event(&event_tx, &shared, Ok(raw)) {
                            debug!("Event channel closed, reader exiting");
                            return;
                        }
                    }
                    FrameKind::Response => {
                        let mut pending = shared.pending_reply.lock().await;
                        if let Some(tx) = pending.take() {
                            let _ = tx.send(frame);
                        } else {
                            warn!("Received response frame but no pending action");
                        }
                    }
                    FrameKind::Banner | FrameKind::Unknown => {
                        debug!("Ignoring unexpected frame: {:?}", frame.kind);
                    }
                }
                continue;
            }
            Ok(None) => {
                // Need more data from socket
            }
            Err(e) => {
                warn!("Parser error: {}", e);
                let _ = status_tx.send(ConnectionStatus::Disconnected(
                    DisconnectReason::ProtocolError(e.to_string()),
                ));
                return;
            }
        }

        match reader.read(&mut read_buffer).await {
            Ok(0) => {
                info!("Connection closed (EOF)");
                let _ = status_tx.send(ConnectionStatus::Disconnected(
                    DisconnectReason::ConnectionClosed,
                ));
                return;
            }
            Ok(n) => {
                if let Err(e) = parser.add_data(&read_buffer[..n]) {
                    warn!("Buffer error: {}", e);
                    let _ = status_tx.send(ConnectionStatus::Disconnected(
                        DisconnectReason::ProtocolError(e.to_string()),
                    ));
                    return;
                }
            }
            Err(e) => {
                warn!("Read error: {}", e);
                let _ = status_tx.send(ConnectionStatus::Disconnected(DisconnectReason::IoError(
                    e.to_string(),
                )));
                return;
            }
        }
    }
}

impl ManagerConnection {
    /// Connect and authenticate.
    pub async fn connect(config: &ManagerConfig) -> AmiResult<(Self, AmiEventStream)> {
        Self::connect_with_options(config, ConnectOptions::default()).await
    }

    /// Connect and authenticate with custom options.
    pub async fn connect_with_options(
        config: &ManagerConfig,
        options: ConnectOptions,
    ) -> AmiResult<(Self, AmiEventStream)> {
        info!("Connecting to manager at {}:{}", config.host, config.port);

        let mut stream =
            tcp_connect_with_timeout(&config.host, config.port, config.connect_timeout).await?;
        let mut parser = AmiParser::new();
        let mut read_buffer = [0u8; SOCKET_BUF_SIZE];

        let version = login(&mut stream, &mut parser, &mut read_buffer, config).await?;

        info!("Successfully connected and authenticated");
        Ok(Self::split_and_spawn(stream, parser, config, options, version))
    }

    fn split_and_spawn(
        stream: TcpStream,
        parser: AmiParser,
        config: &ManagerConfig,
        options: ConnectOptions,
        version: String,
    ) -> (Self, AmiEventStream) {
        let queue_size = options.event_queue_size.max(1);

        let (read_half, write_half) = stream.into_split();

        let shared = Arc::new(SharedState {
            pending_reply: Mutex::new(None),
            action_timeout_ms: AtomicU64::new(config.action_timeout.as_millis() as u64),
            event_overflow: AtomicBool::new(false),
            dropped_event_count: AtomicU64::new(0),
        });

        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connected);
        let status_rx2 = status_tx.subscribe();
        let (event_tx, event_rx) = mpsc::channel(queue_size);

        tokio::spawn(reader_loop(
            read_half,
            parser,
            shared.clone(),
            status_tx,
            event_tx,
        ));

        let connection = ManagerConnection {
            writer: Arc::new(Mutex::new(write_half)),
            shared,
            status_rx,
            server_version: version.into(),
        };

        let stream = AmiEventStream {
            rx: event_rx,
            status_rx: status_rx2,
        };

        (connection, stream)
    }

    /// Send an action and wait for the reply.
    ///
    /// The writer lock is held through the entire send-and-receive cycle to
    /// prevent concurrent actions from overwriting the pending reply slot
    /// (at most one action is in flight per connection).
    pub async fn send_action(&self, action: &Action) -> AmiResult<ActionResponse> {
        if !self.is_connected() {
            return Err(AmiError::NotConnected);
        }

        let wire = action.to_wire_format()?;
        match action.name() {
            "Login" => debug!("Sending action: Login [REDACTED]"),
            _ => debug!("Sending action: {} ({})", action.name(), action.action_id()),
        }

        // Lock writer — serializes concurrent actions and holds through reply.
        let mut writer = self.writer.lock().await;

        // Set up reply channel
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending_reply.lock().await;
            *pending = Some(tx);
        }

        // Write action
        writer.write_all(wire.as_bytes()).await.map_err(AmiError::Io)?;

        // Wait for reply from reader task with action timeout (writer still locked)
        let timeout_ms = self.shared.action_timeout_ms.load(Ordering::Relaxed);
        let frame = match timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(_)) => {
                drop(writer);
                return Err(AmiError::ConnectionClosed);
            }
            Err(_) => {
                let mut pending = self.shared.pending_reply.lock().await;
                pending.take();
                drop(writer);
                return Err(AmiError::Timeout { timeout_ms });
            }
        };

        drop(writer);

        let response = ActionResponse::new(frame.fields);
        match response.action_id() {
            Some(id) if id == action.action_id() => {}
            other => {
                warn!(
                    "Reply correlation mismatch: sent {}, got {:?}",
                    action.action_id(),
                    other
                );
                return Err(AmiError::protocol_error("reply ActionID mismatch"));
            }
        }
        debug!("Received response: success={}", response.is_success());
        Ok(response)
    }

    /// Send an action and require a successful response.
    pub async fn send_action_ok(&self, action: &Action) -> AmiResult<()> {
        self.send_action(action).await?.into_result().map(|_| ())
    }

    /// Health probe: send `Ping` and require a success reply.
    pub async fn ping(&self) -> AmiResult<()> {
        self.send_action_ok(&Action::ping()).await
    }

    /// Server version string from the connect-time banner.
    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    /// Number of events dropped due to a full event queue.
    pub fn dropped_event_count(&self) -> u64 {
        self.shared.dropped_event_count.load(Ordering::Relaxed)
    }

    /// Set the action reply timeout for subsequent actions.
    pub fn set_action_timeout(&self, duration: Duration) {
        self.shared
            .action_timeout_ms
            .store(duration.as_millis() as u64, Ordering::Relaxed);
    }

    /// Whether the connection is alive (not yet disconnected).
    pub fn is_connected(&self) -> bool {
        matches!(*self.status_rx.borrow(), ConnectionStatus::Connected)
    }

    /// Current connection status snapshot.
    pub fn status(&self) -> ConnectionStatus {
        self.status_rx.borrow().clone()
    }

    /// Disconnect: best-effort `Logoff`, then shut down the write half.
    ///
    /// The logoff is advisory; a dead peer must not block teardown, so its
    /// failure is ignored.
    pub async fn disconnect(&self) -> AmiResult<()> {
        info!("Client requested disconnect");
        if self.is_connected() {
            let _ = timeout(
                Duration::from_millis(500),
                self.send_action(&Action::logoff()),
            )
            .await;
        }
        let mut writer = self.writer.lock().await;
        writer.shutdown().await.map_err(AmiError::Io)?;
        Ok(())
    }
}

impl AmiEventStream {
    /// Receive the next event, or None if the channel is closed.
    ///
    /// Returns `Err(AmiError::QueueFull)` if events were dropped because the
    /// application was not draining events fast enough. This is a one-time
    /// notification per overflow episode — subsequent calls return real
    /// events. Parse errors from the reader task are also surfaced here.
    pub async fn recv(&mut self) -> Option<Result<RawEvent, AmiError>> {
        self.rx.recv().await
    }

    /// Whether the connection is alive (not yet disconnected).
    pub fn is_connected(&self) -> bool {
        matches!(*self.status_rx.borrow(), ConnectionStatus::Connected)
    }

    /// Current connection status snapshot.
    pub fn status(&self) -> ConnectionStatus {
        self.status_rx.borrow().clone()
    }
}

impl futures_util::Stream for AmiEventStream {
    type Item = Result<RawEvent, AmiError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_status_eq() {
        assert_eq!(ConnectionStatus::Connected, ConnectionStatus::Connected);
        assert_eq!(
            ConnectionStatus::Disconnected(DisconnectReason::ClientRequested),
            ConnectionStatus::Disconnected(DisconnectReason::ClientRequested)
        );
        assert_ne!(
            ConnectionStatus::Connected,
            ConnectionStatus::Disconnected(DisconnectReason::ConnectionClosed)
        );
    }

    #[test]
    fn test_disconnect_reason_display() {
        assert_eq!(
            DisconnectReason::ConnectionClosed.to_string(),
            "connection closed"
        );
        assert_eq!(
            DisconnectReason::IoError("broken pipe".into()).to_string(),
            "I/O error: broken pipe"
        );
    }
}
