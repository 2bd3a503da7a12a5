//! The `Connection` actor (§3, §4.2-§4.5): one TCP/TLS socket to a single
//! coordinator, multiplexing many in-flight requests over stream ids.
//!
//! Grounded on the teacher's single-socket `Conn` (`protocol/conn.rs`):
//! `open()`'s connect/handshake/auth sequence, the write-coalescing queue,
//! and the "connection is broken" fan-out all come straight from there.
//! What the teacher never needed — per-request stream-id multiplexing,
//! since MySQL's classic protocol is strictly request/response on one
//! socket — is rebuilt here as a small actor: a writer task draining a
//! `WriteQueue`, a reader task decoding frames and routing them back to
//! whichever caller is waiting on that stream id, and a `Connection` handle
//! (`Arc<Inner>`) cloned freely between them and every caller.

pub mod auth;
mod transport;

pub use auth::{AuthProvider, Authenticator, PlainTextAuthProvider, PlainTextAuthenticator};
pub use transport::Transport;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, Notify};
use tokio::time::Instant;
use tokio_util::codec::Decoder;

#[cfg(any(test, feature = "test-util"))]
use tokio::io::DuplexStream;

use crate::config::{PoolingOptions, ProtocolOptions, SocketOptions, SslOptions};
use crate::endpoint::Endpoint;
use crate::error::{Error, ErrorCode, Result};
use crate::operation::{self, CompletionSender, OperationState, RowSender};
use crate::prepared_cache::PreparedCache;
use crate::protocol::request::{QueryParams, Request, StartupOptions};
use crate::protocol::response::{self, PreparedResult, QueryResult, Response, ServerError};
use crate::protocol::{FrameDecoder, FrameHeader, NodeEvent, Opcode, ProtocolVersion};
use crate::stream_id_pool::StreamIdPool;
use crate::write_queue::{QueueItem, WriteQueue};

type PrepareOutcome = std::result::Result<PreparedResult, String>;
type KeyspaceOutcome = std::result::Result<(), String>;

/// A handle to one in-flight (or not-yet-written) request, used to abandon
/// it later — e.g. a speculative-execution sibling that lost the race
/// (§4.6, §5 Cancellation). Cancellation is keyed off a shared flag rather
/// than the stream id, since a stream id is recycled the instant its
/// current occupant completes.
#[derive(Debug, Clone)]
pub enum OperationHandle {
    Dispatched {
        stream_id: i16,
        cancelled: Arc<AtomicBool>,
    },
    Pending {
        cancelled: Arc<AtomicBool>,
    },
}

impl OperationHandle {
    pub fn cancel(&self) {
        let cancelled = match self {
            Self::Dispatched { cancelled, .. } | Self::Pending { cancelled } => cancelled,
        };
        cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        let cancelled = match self {
            Self::Dispatched { cancelled, .. } | Self::Pending { cancelled } => cancelled,
        };
        cancelled.load(Ordering::Relaxed)
    }
}

/// Everything needed to reproduce one outgoing frame, held either until a
/// stream id frees up (`pendingWrites`, §4.5) or handed straight to
/// `dispatch_reserved`.
pub struct StreamRequest {
    request: Request,
    custom_payload: Option<HashMap<String, Vec<u8>>>,
    completion: CompletionSender,
    row_sender: Option<RowSender>,
    cancelled: Arc<AtomicBool>,
    read_timeout: Option<Duration>,
}

impl StreamRequest {
    /// Start building a request, returning the receiver the caller awaits
    /// for the final `QueryResult` and the cancellation flag an
    /// `OperationHandle` shares with it.
    pub fn new(request: Request) -> (Self, oneshot::Receiver<Result<QueryResult>>, Arc<AtomicBool>) {
        let (tx, rx) = oneshot::channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        let req = Self {
            request,
            custom_payload: None,
            completion: tx,
            row_sender: None,
            cancelled: Arc::clone(&cancelled),
            read_timeout: None,
        };
        (req, rx, cancelled)
    }

    #[must_use]
    pub fn with_custom_payload(mut self, payload: HashMap<String, Vec<u8>>) -> Self {
        self.custom_payload = Some(payload);
        self
    }

    /// Stream rows as they're parsed off the wire instead of buffering the
    /// whole `RowsResult` into the final completion (§4.4 "row" events).
    #[must_use]
    pub fn with_row_sender(mut self, row_sender: RowSender) -> Self {
        self.row_sender = Some(row_sender);
        self
    }

    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }
}

/// Everything `Connection::open` needs, gathered from `ClientConfig` plus
/// the target coordinator (§6 configuration options).
#[derive(Clone)]
pub struct ConnectionOptions {
    pub endpoint: Endpoint,
    pub socket_options: SocketOptions,
    pub ssl_options: Option<SslOptions>,
    pub pooling: PoolingOptions,
    pub protocol_options: ProtocolOptions,
    pub auth_provider: Option<Arc<dyn AuthProvider>>,
    pub prepared_cache: Arc<PreparedCache>,
}

struct SharedState {
    stream_ids: StreamIdPool,
    handlers: HashMap<i16, OperationState>,
    pending_writes: VecDeque<StreamRequest>,
    timed_out_handlers: usize,
    sending_idle_query: bool,
    /// In-flight `PREPARE`s, deduplicated by (query, keyspace) so
    /// concurrent callers preparing the same statement share one round
    /// trip (§4.5 `prepareOnce`).
    preparing: HashMap<(String, Option<String>), broadcast::Sender<Arc<PrepareOutcome>>>,
    /// The one in-flight `USE` switch, if any (§4.5 `toBeKeyspace`).
    to_be_keyspace: Option<(String, broadcast::Sender<Arc<KeyspaceOutcome>>)>,
    current_keyspace: Option<String>,
}

struct Inner {
    endpoint: Endpoint,
    version: AtomicU8,
    coalescing_threshold: usize,
    heartbeat_interval: Duration,
    read_timeout: Option<Duration>,
    connected: AtomicBool,
    heartbeat_generation: AtomicU64,
    close_notify: Notify,
    #[expect(
        dead_code,
        reason = "held so the cache outlives every handler sharing it; not read directly by Connection"
    )]
    prepared_cache: Arc<PreparedCache>,
    write_tx: mpsc::UnboundedSender<QueueItem>,
    state: std::sync::Mutex<SharedState>,
    node_events: broadcast::Sender<NodeEvent>,
}

/// Distinguishes "server rejected our protocol version" from every other
/// handshake failure, so `open()` knows when a downgrade-and-retry applies
/// (§3, S1) versus when to give up outright.
enum HandshakeError {
    Protocol(Error),
    Other(Error),
}

impl From<Error> for HandshakeError {
    fn from(err: Error) -> Self {
        HandshakeError::Other(err)
    }
}

fn server_error_to_driver_error(err: ServerError) -> Error {
    match err.code {
        ErrorCode::BadCredentials => Error::AuthenticationError {
            inner: Box::new(Error::ResponseError {
                code: err.code,
                message: err.message,
                unprepared_id: None,
                detail: err.detail,
            }),
        },
        _ => Error::ResponseError {
            code: err.code,
            message: err.message,
            unprepared_id: err.unprepared_id,
            detail: err.detail,
        },
    }
}

/// Read one frame during the handshake, before a protocol version is
/// negotiated. Unlike `FrameDecoder` (fixed-width once negotiated), this
/// infers the header width from the version byte on every attempt, so a
/// server replying at a narrower width than we assumed still parses
/// (§3 S1, `FrameHeader::peek_version`).
async fn read_handshake_frame(transport: &mut Transport, buf: &mut BytesMut) -> Result<(FrameHeader, BytesMut)> {
    loop {
        if !buf.is_empty() {
            if let Ok(server_version) = FrameHeader::peek_version(&buf[..1]) {
                let header_len = server_version.header_len();
                if buf.len() >= header_len {
                    let header = FrameHeader::decode(&buf[..header_len], server_version)?;
                    let total = header_len + header.body_len as usize;
                    if buf.len() >= total {
                        let mut frame = buf.split_to(total);
                        let body = frame.split_off(header_len);
                        return Ok((header, body));
                    }
                }
            }
        }
        let n = transport.read_buf(buf).await.map_err(Error::IoError)?;
        if n == 0 {
            return Err(Error::socket_closed(false, None));
        }
    }
}

#[derive(Clone)]
pub struct Connection(Arc<Inner>);

impl Connection {
    /// Open a connection, downgrading the protocol version and retrying
    /// with a fresh socket on each rejection until one is accepted or the
    /// ladder bottoms out at v1 (§3 step 3, S1).
    pub async fn open(options: &ConnectionOptions) -> Result<Connection> {
        let mut attempt_version = options.protocol_options.max_version;
        loop {
            match Self::try_open(options, attempt_version).await {
                Ok(connection) => return Ok(connection),
                Err(HandshakeError::Protocol(err)) => match attempt_version.step_down() {
                    Some(next) => {
                        tracing::warn!(
                            endpoint = %options.endpoint,
                            from = ?attempt_version,
                            to = ?next,
                            "server rejected protocol version, downgrading"
                        );
                        attempt_version = next;
                    }
                    None => return Err(err),
                },
                Err(HandshakeError::Other(err)) => return Err(err),
            }
        }
    }

    async fn try_open(
        options: &ConnectionOptions,
        version: ProtocolVersion,
    ) -> std::result::Result<Connection, HandshakeError> {
        let tcp = tokio::time::timeout(
            options.socket_options.connect_timeout,
            TcpStream::connect((options.endpoint.address.as_str(), options.endpoint.port)),
        )
        .await
        .map_err(|_| {
            HandshakeError::Other(Error::ConnectionError {
                endpoint: options.endpoint.clone(),
                message: "connect timed out".to_string(),
            })
        })?
        .map_err(|e| {
            HandshakeError::Other(Error::ConnectionError {
                endpoint: options.endpoint.clone(),
                message: format!("connect failed: {e}"),
            })
        })?;

        tcp.set_nodelay(options.socket_options.tcp_no_delay)
            .map_err(|e| HandshakeError::Other(Error::IoError(e)))?;

        #[cfg_attr(not(feature = "tls"), allow(unused_mut))]
        let mut transport = Transport::tcp(tcp);

        #[cfg(feature = "tls")]
        if let Some(ssl) = &options.ssl_options {
            transport = transport
                .upgrade_to_tls(&options.endpoint.address, ssl.reject_unauthorized)
                .await
                .map_err(HandshakeError::Other)?;
        }

        let mut buf = BytesMut::with_capacity(4096);
        let startup = Request::Startup(StartupOptions::default())
            .write(version, 0, None)
            .map_err(HandshakeError::Other)?;
        transport
            .write_all(&startup)
            .await
            .map_err(|e| HandshakeError::Other(Error::IoError(e)))?;
        transport.flush().await.map_err(|e| HandshakeError::Other(Error::IoError(e)))?;

        let (header, body) = read_handshake_frame(&mut transport, &mut buf)
            .await
            .map_err(HandshakeError::Other)?;
        let negotiated = header.version;
        let parsed = response::parse(header.opcode, &body, negotiated).map_err(HandshakeError::Other)?;

        match parsed {
            Response::Ready => {}
            Response::Authenticate { authenticator } => {
                Self::run_auth(&mut transport, &mut buf, negotiated, options, &authenticator)
                    .await
                    .map_err(HandshakeError::Other)?;
            }
            Response::Error(server_err) if server_err.code == ErrorCode::ProtocolError => {
                return Err(HandshakeError::Protocol(Error::ProtocolError(server_err.message)));
            }
            Response::Error(server_err) => {
                return Err(HandshakeError::Other(server_error_to_driver_error(server_err)));
            }
            other => {
                return Err(HandshakeError::Other(Error::ProtocolError(format!(
                    "unexpected STARTUP response {other:?}"
                ))));
            }
        }

        Ok(Self::from_open_transport(options, negotiated, transport))
    }

    async fn run_auth(
        transport: &mut Transport,
        buf: &mut BytesMut,
        version: ProtocolVersion,
        options: &ConnectionOptions,
        authenticator_name: &str,
    ) -> Result<()> {
        let provider = options.auth_provider.as_ref().ok_or_else(|| Error::AuthenticationError {
            inner: Box::new(Error::BadConfigError(format!(
                "server requires authenticator {authenticator_name} but no AuthProvider is configured"
            ))),
        })?;
        let mut authenticator = provider.new_authenticator(&options.endpoint, authenticator_name).await?;

        if version == ProtocolVersion::V1 {
            let username = authenticator.username().unwrap_or_default().to_string();
            let password = authenticator.password().unwrap_or_default().to_string();
            let frame = Request::Credentials { username, password }.write(version, 0, None)?;
            transport.write_all(&frame).await.map_err(Error::IoError)?;
            transport.flush().await.map_err(Error::IoError)?;
            let (header, body) = read_handshake_frame(transport, buf).await?;
            return match response::parse(header.opcode, &body, version)? {
                Response::Ready => Ok(()),
                Response::Error(err) => Err(server_error_to_driver_error(err)),
                other => Err(Error::ProtocolError(format!("unexpected CREDENTIALS response {other:?}"))),
            };
        }

        let mut token = authenticator.initial_response().await?;
        loop {
            let frame = Request::AuthResponse { token }.write(version, 0, None)?;
            transport.write_all(&frame).await.map_err(Error::IoError)?;
            transport.flush().await.map_err(Error::IoError)?;
            let (header, body) = read_handshake_frame(transport, buf).await?;
            match response::parse(header.opcode, &body, version)? {
                Response::AuthSuccess { token: final_token } => {
                    return authenticator.on_authentication_success(final_token).await;
                }
                Response::AuthChallenge { token: challenge } => {
                    token = authenticator.evaluate_challenge(challenge).await?;
                }
                Response::Error(err) => return Err(server_error_to_driver_error(err)),
                other => return Err(Error::ProtocolError(format!("unexpected auth response {other:?}"))),
            }
        }
    }

    fn from_open_transport(options: &ConnectionOptions, version: ProtocolVersion, transport: Transport) -> Self {
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (node_events_tx, _) = broadcast::channel(64);
        let state = SharedState {
            stream_ids: StreamIdPool::new(version),
            handlers: HashMap::new(),
            pending_writes: VecDeque::new(),
            timed_out_handlers: 0,
            sending_idle_query: false,
            preparing: HashMap::new(),
            to_be_keyspace: None,
            current_keyspace: None,
        };
        let inner = Arc::new(Inner {
            endpoint: options.endpoint.clone(),
            version: AtomicU8::new(version.raw()),
            coalescing_threshold: options.socket_options.coalescing_threshold,
            heartbeat_interval: options.pooling.heart_beat_interval,
            read_timeout: options.socket_options.read_timeout,
            connected: AtomicBool::new(true),
            heartbeat_generation: AtomicU64::new(0),
            close_notify: Notify::new(),
            prepared_cache: Arc::clone(&options.prepared_cache),
            write_tx,
            state: std::sync::Mutex::new(state),
            node_events: node_events_tx,
        });
        let connection = Self(inner);

        let (read_half, write_half) = tokio::io::split(transport);
        let decoder = FrameDecoder::new(version);

        let writer = connection.clone();
        tokio::spawn(async move { writer.writer_loop(write_half, write_rx).await });

        let reader = connection.clone();
        tokio::spawn(async move { reader.reader_loop(read_half, decoder).await });

        connection.reset_heartbeat();
        connection
    }

    #[cfg(any(test, feature = "test-util"))]
    pub fn from_duplex_for_test(transport: DuplexStream, version: ProtocolVersion, options: &ConnectionOptions) -> Self {
        Self::from_open_transport(options, version, Transport::Duplex(transport))
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.0.endpoint
    }

    pub fn negotiated_version(&self) -> ProtocolVersion {
        self.version()
    }

    pub fn is_connected(&self) -> bool {
        self.0.connected.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.lock_state().handlers.len()
    }

    pub fn current_keyspace(&self) -> Option<String> {
        self.lock_state().current_keyspace.clone()
    }

    pub fn subscribe_node_events(&self) -> broadcast::Receiver<NodeEvent> {
        self.0.node_events.subscribe()
    }

    fn version(&self) -> ProtocolVersion {
        ProtocolVersion::from_raw(self.0.version.load(Ordering::Relaxed))
            .expect("connection always stores a valid protocol version byte")
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SharedState> {
        self.0.state.lock().expect("connection state lock poisoned")
    }

    /// Reserve a stream id and hand the request to the writer task, or
    /// park it in `pendingWrites` if the id space is exhausted (§4.5
    /// `sendStream`).
    pub async fn send_stream(&self, req: StreamRequest) -> OperationHandle {
        if !self.is_connected() {
            let _ = req.completion.send(Err(Error::socket_closed(true, None)));
            return OperationHandle::Pending { cancelled: req.cancelled };
        }

        let reserved = self.lock_state().stream_ids.pop();
        match reserved {
            Some(stream_id) => self.dispatch_reserved(stream_id, req).await,
            None => {
                let cancelled = Arc::clone(&req.cancelled);
                self.lock_state().pending_writes.push_back(req);
                OperationHandle::Pending { cancelled }
            }
        }
    }

    /// Hand a request, already holding a reserved stream id, to the writer
    /// task and wait for its write-callback before registering the
    /// handler — preserving the "stream id reserved before write,
    /// handler registered after" ordering (§8 properties 1-3).
    async fn dispatch_reserved(&self, stream_id: i16, req: StreamRequest) -> OperationHandle {
        let StreamRequest {
            request,
            custom_payload,
            completion,
            row_sender,
            cancelled,
            read_timeout,
        } = req;

        let (written_tx, written_rx) = oneshot::channel();
        let item = QueueItem {
            request,
            stream_id,
            custom_payload,
            cancelled: Arc::clone(&cancelled),
            written: written_tx,
        };

        if self.0.write_tx.send(item).is_err() {
            self.return_or_free(stream_id);
            let _ = completion.send(Err(Error::socket_closed(true, None)));
            return OperationHandle::Pending { cancelled };
        }

        match written_rx.await {
            Ok(Ok(())) => {
                let op = OperationState::new(stream_id, completion, row_sender, Arc::clone(&cancelled));
                self.lock_state().handlers.insert(stream_id, op);
                self.reset_heartbeat();
                if let Some(timeout) = read_timeout.or(self.0.read_timeout) {
                    self.spawn_read_timeout(stream_id, timeout);
                }
                OperationHandle::Dispatched { stream_id, cancelled }
            }
            Ok(Err(err)) => {
                self.return_or_free(stream_id);
                let _ = completion.send(Err(err));
                OperationHandle::Pending { cancelled }
            }
            Err(_) => {
                self.return_or_free(stream_id);
                let _ = completion.send(Err(Error::socket_closed(true, None)));
                OperationHandle::Pending { cancelled }
            }
        }
    }

    /// Free a stream id that was reserved but never got a handler
    /// registered (the write itself failed). Unlike `return_stream_id`,
    /// there's no in-flight operation to hand off to a pending write, so
    /// this always goes back to the free pool.
    fn return_or_free(&self, stream_id: i16) {
        self.lock_state().stream_ids.push(stream_id);
        self.try_redispatch_pending();
    }

    /// A stream id just freed up (its response arrived, or a reservation
    /// that never got written was released). Hand it straight to the
    /// oldest pending write if one exists, instead of round-tripping it
    /// through the free pool (§4.5, pendingWrites draining).
    fn return_stream_id(&self, stream_id: i16) -> Option<StreamRequest> {
        let mut state = self.lock_state();
        match state.pending_writes.pop_front() {
            Some(next) => Some(next),
            None => {
                state.stream_ids.push(stream_id);
                None
            }
        }
    }

    fn try_redispatch_pending(&self) {
        let next = {
            let mut state = self.lock_state();
            match state.stream_ids.pop() {
                Some(id) => state.pending_writes.pop_front().map(|req| (id, req)),
                None => None,
            }
        };
        if let Some((stream_id, req)) = next {
            let connection = self.clone();
            tokio::spawn(async move {
                connection.dispatch_reserved(stream_id, req).await;
            });
        }
    }

    async fn writer_loop(self, mut write_half: WriteHalf<Transport>, mut rx: mpsc::UnboundedReceiver<QueueItem>) {
        let mut queue = WriteQueue::new(self.0.coalescing_threshold);
        'outer: loop {
            if !self.is_connected() {
                break 'outer;
            }
            if queue.is_empty() {
                tokio::select! {
                    biased;
                    () = self.0.close_notify.notified() => break 'outer,
                    item = rx.recv() => match item {
                        Some(item) => queue.push(item),
                        None => break 'outer,
                    },
                }
            }
            while let Ok(item) = rx.try_recv() {
                queue.push(item);
            }

            let buf = queue.drain(self.version());
            if buf.is_empty() {
                continue;
            }
            if let Err(e) = write_half.write_all(&buf).await {
                self.close_with(Error::IoError(e)).await;
                break;
            }
            if let Err(e) = write_half.flush().await {
                self.close_with(Error::IoError(e)).await;
                break;
            }
        }

        queue.fail_all();
        while let Ok(item) = rx.try_recv() {
            let _ = item.written.send(Err(Error::socket_closed(true, None)));
        }
    }

    async fn reader_loop(self, mut read_half: ReadHalf<Transport>, mut decoder: FrameDecoder) {
        let mut buf = BytesMut::with_capacity(8192);
        loop {
            if !self.is_connected() {
                return;
            }
            loop {
                match decoder.decode(&mut buf) {
                    Ok(Some((header, body))) => self.dispatch_frame(header, body).await,
                    Ok(None) => break,
                    Err(e) => {
                        self.close_with(e).await;
                        return;
                    }
                }
            }

            tokio::select! {
                biased;
                () = self.0.close_notify.notified() => return,
                result = read_half.read_buf(&mut buf) => match result {
                    Ok(0) => {
                        self.close_with(Error::socket_closed(false, None)).await;
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        self.close_with(Error::IoError(e)).await;
                        return;
                    }
                },
            }
        }
    }

    async fn dispatch_frame(&self, header: FrameHeader, body: BytesMut) {
        if header.stream < 0 {
            if header.opcode == Opcode::Event {
                match response::parse(header.opcode, &body, self.version()) {
                    Ok(Response::Event(event)) => {
                        let _ = self.0.node_events.send(event);
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(endpoint = %self.0.endpoint, error = %err, "malformed node event frame");
                    }
                }
            }
            return;
        }

        let parsed = response::parse(header.opcode, &body, self.version());
        self.handle_response(header.stream, parsed).await;
    }

    /// Route a parsed response to its waiting operation and free/redispatch
    /// the stream id (§4.5). Every response is treated as final: the frame
    /// parser already buffers a whole `ROWS` body before the connection
    /// ever sees it, so there is no partial/incremental delivery at this
    /// layer (see DESIGN.md).
    async fn handle_response(&self, stream_id: i16, parsed: Result<Response>) {
        let mut op = {
            let mut state = self.lock_state();
            let Some(mut op) = state.handlers.remove(&stream_id) else {
                drop(state);
                tracing::warn!(stream_id, "response for an unknown or already-freed stream id");
                return;
            };
            if op.state() == operation::State::TimedOut && state.timed_out_handlers > 0 {
                state.timed_out_handlers -= 1;
            }
            op
        };

        match parsed {
            Ok(Response::Result(QueryResult::Rows(rows))) => op.complete_rows(rows),
            Ok(Response::Result(result)) => op.complete(Ok(result)),
            Ok(Response::Ready) => op.complete(Ok(QueryResult::Void)),
            Ok(Response::Error(server_err)) => op.complete(Err(server_error_to_driver_error(server_err))),
            Ok(other) => op.complete(Err(Error::DriverInternalError(format!(
                "unexpected response on stream {stream_id}: {other:?}"
            )))),
            Err(err) => op.complete(Err(err)),
        }

        if let Some(next) = self.return_stream_id(stream_id) {
            let connection = self.clone();
            tokio::spawn(async move {
                connection.dispatch_reserved(stream_id, next).await;
            });
        }
    }

    fn spawn_read_timeout(&self, stream_id: i16, timeout: Duration) {
        let connection = self.clone();
        let started = Instant::now();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            connection.fire_read_timeout(stream_id, started.elapsed().as_millis() as u64).await;
        });
    }

    async fn fire_read_timeout(&self, stream_id: i16, elapsed_ms: u64) {
        let mut state = self.lock_state();
        if let Some(op) = state.handlers.get_mut(&stream_id) {
            if op.mark_timed_out(self.0.endpoint.clone(), elapsed_ms) {
                state.timed_out_handlers += 1;
            }
        }
    }

    /// Reschedule the idle-query heartbeat (§4.5). Uses a generation
    /// counter rather than an abortable timer handle: a superseded timer
    /// simply finds its generation stale when it fires and does nothing,
    /// which is cheaper than threading cancellation through every write.
    fn reset_heartbeat(&self) {
        if self.0.heartbeat_interval.is_zero() {
            return;
        }
        let generation = self.0.heartbeat_generation.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        let connection = self.clone();
        let interval = self.0.heartbeat_interval;
        tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            connection.fire_heartbeat_if_current(generation).await;
        });
    }

    async fn fire_heartbeat_if_current(&self, generation: u64) {
        if self.0.heartbeat_generation.load(Ordering::SeqCst) != generation {
            return;
        }
        if !self.is_connected() {
            return;
        }
        {
            let mut state = self.lock_state();
            if state.sending_idle_query {
                drop(state);
                self.reset_heartbeat();
                return;
            }
            state.sending_idle_query = true;
        }

        let result = self
            .run_to_completion(
                Request::Query {
                    query: "SELECT key FROM system.local".to_string(),
                    params: QueryParams::default(),
                },
                None,
            )
            .await;
        self.lock_state().sending_idle_query = false;

        if let Err(err) = result {
            tracing::warn!(endpoint = %self.0.endpoint, error = %err, "idle heartbeat query failed");
        }
        self.reset_heartbeat();
    }

    async fn run_to_completion(&self, request: Request, read_timeout: Option<Duration>) -> Result<QueryResult> {
        let (req, rx, _cancelled) = StreamRequest::new(request);
        let req = match read_timeout {
            Some(timeout) => req.with_read_timeout(timeout),
            None => req,
        };
        self.send_stream(req).await;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::socket_closed(false, None)),
        }
    }

    pub async fn simple_query(&self, query: &str) -> Result<QueryResult> {
        self.run_to_completion(
            Request::Query {
                query: query.to_string(),
                params: QueryParams::default(),
            },
            None,
        )
        .await
    }

    pub async fn register(&self, event_types: Vec<String>) -> Result<()> {
        self.run_to_completion(Request::Register { event_types }, None).await.map(|_| ())
    }

    /// Prepare a statement, deduplicating concurrent callers preparing the
    /// same `(query, keyspace)` pair onto one wire round trip (§4.5
    /// `prepareOnce`). The caller that actually issues the `PREPARE` gets
    /// the exact error; followers reconstruct a driver error from the
    /// broadcast outcome's string form, since `Error` isn't `Clone`.
    pub async fn prepare_once(&self, query: &str, keyspace: Option<&str>) -> Result<PreparedResult> {
        let key = (query.to_string(), keyspace.map(str::to_string));
        let role = {
            let mut state = self.lock_state();
            match state.preparing.get(&key) {
                Some(sender) => Err(sender.subscribe()),
                None => {
                    let (tx, rx) = broadcast::channel(1);
                    state.preparing.insert(key.clone(), tx);
                    Ok(rx)
                }
            }
        };

        match role {
            Err(mut follower) => match follower.recv().await {
                Ok(outcome) => (*outcome).clone().map_err(Error::DriverInternalError),
                Err(_) => Err(Error::DriverInternalError(
                    "prepare broadcast closed before completing".to_string(),
                )),
            },
            Ok(_leader_rx) => {
                let result = self.prepare_on_wire(query, keyspace).await;
                let outcome: PrepareOutcome = result.as_ref().map(Clone::clone).map_err(ToString::to_string);
                let mut state = self.lock_state();
                if let Some(sender) = state.preparing.remove(&key) {
                    let _ = sender.send(Arc::new(outcome));
                }
                drop(state);
                result
            }
        }
    }

    async fn prepare_on_wire(&self, query: &str, keyspace: Option<&str>) -> Result<PreparedResult> {
        match self
            .run_to_completion(
                Request::Prepare {
                    query: query.to_string(),
                    keyspace: keyspace.map(str::to_string),
                },
                None,
            )
            .await?
        {
            QueryResult::Prepared(prepared) => Ok(prepared),
            other => Err(Error::DriverInternalError(format!("PREPARE returned unexpected result {other:?}"))),
        }
    }

    /// Switch the connection's keyspace, deduplicating concurrent callers
    /// targeting the same keyspace onto one `USE` round trip (§4.5
    /// `toBeKeyspace`). Callers targeting a *different* keyspace while one
    /// switch is already in flight race independently rather than queue
    /// behind it — see DESIGN.md.
    pub async fn change_keyspace(&self, keyspace: &str) -> Result<()> {
        let role = {
            let mut state = self.lock_state();
            if state.current_keyspace.as_deref() == Some(keyspace) {
                return Ok(());
            }
            match &state.to_be_keyspace {
                Some((pending, sender)) if pending == keyspace => Err(sender.subscribe()),
                _ => {
                    let (tx, rx) = broadcast::channel(1);
                    state.to_be_keyspace = Some((keyspace.to_string(), tx));
                    Ok(rx)
                }
            }
        };

        match role {
            Err(mut follower) => match follower.recv().await {
                Ok(outcome) => (*outcome).clone().map_err(Error::DriverInternalError),
                Err(_) => Err(Error::DriverInternalError(
                    "keyspace-switch broadcast closed before completing".to_string(),
                )),
            },
            Ok(_leader_rx) => {
                let result = self.use_keyspace_on_wire(keyspace).await;
                if result.is_ok() {
                    self.lock_state().current_keyspace = Some(keyspace.to_string());
                }
                let outcome: KeyspaceOutcome = result.as_ref().map(|_| ()).map_err(ToString::to_string);
                let mut state = self.lock_state();
                if let Some((pending, sender)) = state.to_be_keyspace.take() {
                    if pending == keyspace {
                        let _ = sender.send(Arc::new(outcome));
                    } else {
                        state.to_be_keyspace = Some((pending, sender));
                    }
                }
                drop(state);
                result
            }
        }
    }

    async fn use_keyspace_on_wire(&self, keyspace: &str) -> Result<()> {
        match self
            .run_to_completion(
                Request::Query {
                    query: format!("USE \"{keyspace}\""),
                    params: QueryParams::default(),
                },
                None,
            )
            .await?
        {
            QueryResult::SetKeyspace(_) => Ok(()),
            other => Err(Error::DriverInternalError(format!("USE returned unexpected result {other:?}"))),
        }
    }

    /// Tear the connection down and fail every outstanding operation
    /// exactly once, idempotently (§4.5 "Close", §8 property 2).
    pub async fn close(&self) {
        self.close_with(Error::DriverInternalError("connection closed".to_string())).await;
    }

    async fn close_with(&self, err: Error) {
        if !self.0.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        self.0.close_notify.notify_waiters();

        let message = err.to_string();
        let (handlers, pending_writes) = {
            let mut state = self.lock_state();
            state.stream_ids.clear();
            (std::mem::take(&mut state.handlers), std::mem::take(&mut state.pending_writes))
        };

        for mut op in handlers.into_values() {
            op.fail(Error::SocketError {
                message: message.clone(),
                request_not_written: false,
                inner: None,
            });
        }
        for pending in pending_writes {
            let _ = pending.completion.send(Err(Error::socket_closed(true, None)));
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::connection::auth::PlainTextAuthProvider;

    fn test_options() -> ConnectionOptions {
        ConnectionOptions {
            endpoint: Endpoint::new("test", 9042),
            socket_options: SocketOptions::default(),
            ssl_options: None,
            pooling: PoolingOptions {
                heart_beat_interval: Duration::ZERO,
            },
            protocol_options: ProtocolOptions::default(),
            auth_provider: Some(Arc::new(PlainTextAuthProvider {
                username: "alice".to_string(),
                password: "secret".to_string(),
            })),
            prepared_cache: Arc::new(PreparedCache::new()),
        }
    }

    #[tokio::test]
    async fn operation_handle_cancel_sets_the_shared_flag() {
        let (req, _rx, cancelled) = StreamRequest::new(Request::Options);
        let handle = OperationHandle::Pending {
            cancelled: Arc::clone(&cancelled),
        };
        assert!(!handle.is_cancelled());
        handle.cancel();
        assert!(cancelled.load(Ordering::Relaxed));
        drop(req);
    }

    #[tokio::test]
    async fn socket_error_fans_out_to_every_handler_exactly_once() {
        let (client, _server) = tokio::io::duplex(4096);
        let connection = Connection::from_duplex_for_test(client, ProtocolVersion::V4, &test_options());

        let (req1, rx1, _c1) = StreamRequest::new(Request::Options);
        let (req2, rx2, _c2) = StreamRequest::new(Request::Options);
        let h1 = connection.send_stream(req1).await;
        let h2 = connection.send_stream(req2).await;
        assert!(matches!(h1, OperationHandle::Dispatched { .. }));
        assert!(matches!(h2, OperationHandle::Dispatched { .. }));

        connection.close().await;
        connection.close().await; // idempotent: must not panic or double-fire

        assert!(rx1.await.unwrap().is_err());
        assert!(rx2.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn pending_write_is_failed_not_written_when_stream_ids_are_exhausted() {
        let (client, _server) = tokio::io::duplex(4096);
        let options = test_options();
        let connection = Connection::from_duplex_for_test(client, ProtocolVersion::V2, &options);

        // Drain the whole v1/v2 stream id space (128) without waiting on
        // each write, then one more should queue as a pending write.
        let mut handles = Vec::new();
        let mut receivers = Vec::new();
        for _ in 0..128 {
            let (req, rx, _c) = StreamRequest::new(Request::Options);
            handles.push(connection.send_stream(req).await);
            receivers.push(rx);
        }
        let (overflow_req, overflow_rx, _c) = StreamRequest::new(Request::Options);
        let overflow_handle = connection.send_stream(overflow_req).await;
        assert!(matches!(overflow_handle, OperationHandle::Pending { .. }));

        connection.close().await;
        assert!(overflow_rx.await.unwrap().is_err());
    }
}
