//! # RESP Connection
//!
//! Purpose: One multiplexed RESP2 connection over TCP. Many callers share it;
//! their requests are pipelined on the socket and replies are matched in
//! FIFO order by a background reader task.
//!
//! ## Design Principles
//! 1. **Pipelining**: The writer lock is held only while framing and writing;
//!    callers await their replies after releasing it.
//! 2. **FIFO Matching**: Each request pushes a responder onto the link's
//!    queue under the writer lock, so queue order equals wire order.
//! 3. **Per-Link State**: Every (re)connect gets a fresh `Link` queue, so a
//!    dying reader can only fail the requests it owned.
//! 4. **Lazy Healing**: A failed link is re-established by the next request;
//!    no background reconnect loop.
//!
//! ## Guarded Transactions
//!
//! ```text
//! writer lock held ─────────────────────────────────────────────┐
//! WATCH k  EXISTS k ... ──await──> conditions hold?             │
//!     no  -> UNWATCH, return None                               │
//!     err -> UNWATCH (reset link if replies are missing), Err   │
//!     yes -> MULTI  SADD ...  SET ...  EXEC ──────────── release┘
//! EXEC -> array (applied) | null (a watched key changed: None)
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use tagkv_common::{Command, Reply, Transaction};

use crate::config::EndpointConfig;
use crate::connection::signals::{ConnectionEvent, ConnectionSignals, FailureKind};
use crate::connection::{Connector, RawConnection};
use crate::error::{ClientError, ClientResult};
use crate::resp::{command_args, decode_reply, encode_command, raw_args};

type Responder = oneshot::Sender<ClientResult<Reply>>;
type Pending = oneshot::Receiver<ClientResult<Reply>>;

/// State shared with reader tasks.
#[derive(Debug, Default)]
struct Shared {
    connected: AtomicBool,
    outstanding: AtomicUsize,
    /// Bumped on every (re)connect; a reader only reports for its own link.
    generation: AtomicU64,
}

/// Reply queue of one physical socket.
#[derive(Debug, Default)]
struct Link {
    pending: Mutex<VecDeque<Responder>>,
}

impl Link {
    fn push(&self, responder: Responder, shared: &Shared) {
        self.pending.lock().push_back(responder);
        shared.outstanding.fetch_add(1, Ordering::AcqRel);
    }

    /// Hands `reply` to the oldest waiter. Returns false if nobody waited.
    fn complete(&self, reply: Reply, shared: &Shared) -> bool {
        let responder = self.pending.lock().pop_front();
        match responder {
            Some(responder) => {
                shared.outstanding.fetch_sub(1, Ordering::AcqRel);
                // The waiter may have timed out and dropped its receiver.
                let _ = responder.send(Ok(reply));
                true
            }
            None => false,
        }
    }

    fn fail_all(&self, shared: &Shared) {
        let drained: Vec<Responder> = self.pending.lock().drain(..).collect();
        shared
            .outstanding
            .fetch_sub(drained.len(), Ordering::AcqRel);
        for responder in drained {
            let _ = responder.send(Err(ClientError::ConnectionClosed));
        }
    }
}

/// Socket-side state guarded by the writer lock.
struct WriterState {
    stream: Option<OwnedWriteHalf>,
    link: Arc<Link>,
    selected_db: u32,
    ever_connected: bool,
    buf: Vec<u8>,
}

/// Reader task plus the queue it drains, for `close`.
struct ReaderHandle {
    task: JoinHandle<()>,
    link: Arc<Link>,
}

/// Multiplexed RESP2 connection.
pub struct RespConnection {
    config: EndpointConfig,
    signals: ConnectionSignals,
    shared: Arc<Shared>,
    writer: tokio::sync::Mutex<WriterState>,
    reader: Mutex<Option<ReaderHandle>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for RespConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RespConnection")
            .field("endpoint", &self.config.address)
            .field("connected", &self.is_connected())
            .field("outstanding", &self.outstanding_requests())
            .finish()
    }
}

impl RespConnection {
    /// Opens the connection and authenticates if a password is configured.
    pub async fn connect(config: EndpointConfig) -> ClientResult<Self> {
        config.validate()?;
        let conn = RespConnection {
            config,
            signals: ConnectionSignals::new(),
            shared: Arc::new(Shared::default()),
            writer: tokio::sync::Mutex::new(WriterState {
                stream: None,
                link: Arc::new(Link::default()),
                selected_db: 0,
                ever_connected: false,
                buf: Vec::with_capacity(256),
            }),
            reader: Mutex::new(None),
            closed: AtomicBool::new(false),
        };
        {
            let mut state = conn.writer.lock().await;
            conn.establish(&mut state).await?;
        }
        Ok(conn)
    }

    /// Connects a fresh socket, replacing whatever link was there.
    async fn establish(&self, state: &mut WriterState) -> ClientResult<()> {
        let stream = match open_stream(&self.config).await {
            Ok(stream) => stream,
            Err(err) => {
                self.emit_failure(FailureKind::UnableToConnect, err.to_string());
                return Err(err);
            }
        };
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        let link = Arc::new(Link::default());
        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let task = tokio::spawn(read_loop(
            read_half,
            Arc::clone(&link),
            Arc::clone(&self.shared),
            self.signals.clone(),
            self.config.address.clone(),
            generation,
        ));
        let previous = self.reader.lock().replace(ReaderHandle {
            task,
            link: Arc::clone(&link),
        });
        if let Some(previous) = previous {
            previous.task.abort();
            previous.link.fail_all(&self.shared);
        }

        state.stream = Some(write_half);
        state.link = link;
        state.selected_db = 0;
        self.shared.connected.store(true, Ordering::Release);

        if let Some(password) = self.config.password.clone() {
            let frame = raw_args("AUTH", [Bytes::from(password)]);
            let mut pending = self.write_frames(state, vec![frame]).await?;
            let reply = match pending.pop() {
                Some(rx) => self.await_reply(rx).await?,
                None => return Err(ClientError::ConnectionClosed),
            };
            if let Reply::Error(message) = reply {
                self.mark_failed(state, FailureKind::AuthenticationFailure, message.clone());
                return Err(ClientError::Server(message));
            }
        }

        if state.ever_connected {
            self.signals.emit(&ConnectionEvent::ConnectionRestored {
                endpoint: self.config.address.clone(),
            });
        }
        state.ever_connected = true;
        debug!(endpoint = %self.config.address, generation, "connection established");
        Ok(())
    }

    /// Re-establishes the link if the reader reported it dead.
    async fn ensure_connected(&self, state: &mut WriterState) -> ClientResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::Disconnected(self.config.address.clone()));
        }
        if state.stream.is_some() && self.shared.connected.load(Ordering::Acquire) {
            return Ok(());
        }
        self.establish(state).await
    }

    /// Switches database if needed, then writes `frames` as one batch.
    ///
    /// Returns the receivers for `frames` only; a `SELECT` reply is checked
    /// before returning.
    async fn dispatch(
        &self,
        state: &mut WriterState,
        db: u32,
        frames: Vec<Vec<Bytes>>,
    ) -> ClientResult<Vec<Pending>> {
        self.ensure_connected(state).await?;
        if state.selected_db != db {
            let frame = raw_args("SELECT", [Bytes::from(db.to_string())]);
            let mut pending = self.write_frames(state, vec![frame]).await?;
            if let Some(rx) = pending.pop() {
                if let Reply::Error(message) = self.await_reply(rx).await? {
                    return Err(ClientError::Server(message));
                }
            }
            state.selected_db = db;
        }
        self.write_frames(state, frames).await
    }

    async fn write_frames(
        &self,
        state: &mut WriterState,
        frames: Vec<Vec<Bytes>>,
    ) -> ClientResult<Vec<Pending>> {
        state.buf.clear();
        let mut receivers = Vec::with_capacity(frames.len());
        for frame in &frames {
            encode_command(frame, &mut state.buf);
            let (tx, rx) = oneshot::channel();
            state.link.push(tx, &self.shared);
            receivers.push(rx);
        }

        let result = match state.stream.as_mut() {
            Some(stream) => stream.write_all(&state.buf).await,
            None => return Err(ClientError::Disconnected(self.config.address.clone())),
        };
        if let Err(err) = result {
            self.mark_failed(state, FailureKind::SocketFailure, err.to_string());
            return Err(err.into());
        }
        Ok(receivers)
    }

    async fn await_reply(&self, rx: Pending) -> ClientResult<Reply> {
        let received = match self.config.response_timeout() {
            Some(limit) => tokio::time::timeout(limit, rx)
                .await
                .map_err(|_| ClientError::Timeout(limit))?,
            None => rx.await,
        };
        received.map_err(|_| ClientError::ConnectionClosed)?
    }

    async fn await_all(&self, receivers: Vec<Pending>) -> ClientResult<Vec<Reply>> {
        let mut replies = Vec::with_capacity(receivers.len());
        for rx in receivers {
            replies.push(self.await_reply(rx).await?);
        }
        Ok(replies)
    }

    /// Reads the WATCH reply and one existence reply per condition.
    ///
    /// `Ok(false)` as soon as one condition does not hold.
    async fn evaluate_guards(
        &self,
        transaction: &Transaction,
        receivers: Vec<Pending>,
    ) -> ClientResult<bool> {
        let replies = self.await_all(receivers).await?;
        let mut replies = replies.into_iter();
        match replies.next() {
            Some(Reply::Status(_)) => {}
            Some(Reply::Error(message)) => return Err(ClientError::Server(message)),
            other => return Err(ClientError::UnexpectedResponse(format!("{other:?}"))),
        }
        for (condition, reply) in transaction.conditions.iter().zip(replies) {
            let present = match reply {
                Reply::Integer(count) => count > 0,
                Reply::Error(message) => return Err(ClientError::Server(message)),
                other => return Err(ClientError::UnexpectedResponse(format!("{other:?}"))),
            };
            if present != condition.expects_present() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Clears the connection's WATCH set. A failure resets the link, which
    /// drops the server session and its watches with it.
    async fn release_watch(&self, state: &mut WriterState, db: u32) -> ClientResult<()> {
        let result = match self.dispatch(state, db, vec![raw_args("UNWATCH", [])]).await {
            Ok(receivers) => self.await_all(receivers).await.and_then(|mut replies| {
                match replies.pop() {
                    Some(Reply::Status(_)) => Ok(()),
                    Some(Reply::Error(message)) => Err(ClientError::Server(message)),
                    other => Err(ClientError::UnexpectedResponse(format!("{other:?}"))),
                }
            }),
            Err(err) => Err(err),
        };
        if let Err(err) = &result {
            self.mark_failed(state, FailureKind::ProtocolFailure, format!("UNWATCH failed: {err}"));
        }
        result
    }

    /// Leaves no WATCH behind after a guard phase failed with `err`.
    ///
    /// Replies that never arrived mean the session state is unknown, so the
    /// link is reset instead of queueing UNWATCH behind them.
    async fn abandon_watch(&self, state: &mut WriterState, db: u32, err: &ClientError) {
        match err {
            ClientError::Server(_) | ClientError::UnexpectedResponse(_) => {
                if let Err(unwatch) = self.release_watch(state, db).await {
                    debug!(endpoint = %self.config.address, error = %unwatch, "watch released by reset");
                }
            }
            _ => {
                if state.stream.is_some() {
                    self.mark_failed(
                        state,
                        FailureKind::ProtocolFailure,
                        format!("guard evaluation failed: {err}"),
                    );
                }
            }
        }
    }

    /// Tears down the current link after a write-side failure.
    fn mark_failed(&self, state: &mut WriterState, failure: FailureKind, message: String) {
        state.stream = None;
        if let Some(reader) = self.reader.lock().take() {
            reader.task.abort();
        }
        state.link.fail_all(&self.shared);
        if self.shared.connected.swap(false, Ordering::AcqRel) {
            self.emit_failure(failure, message);
        }
    }

    fn emit_failure(&self, failure: FailureKind, message: String) {
        self.signals.emit(&ConnectionEvent::ConnectionFailed {
            endpoint: self.config.address.clone(),
            failure,
            message,
        });
    }
}

impl RawConnection for RespConnection {
    async fn execute(&self, db: u32, command: Command) -> ClientResult<Reply> {
        let frame = command_args(&command);
        let mut receivers = {
            let mut state = self.writer.lock().await;
            self.dispatch(&mut state, db, vec![frame]).await?
        };
        match receivers.pop() {
            Some(rx) => self.await_reply(rx).await,
            None => Err(ClientError::ConnectionClosed),
        }
    }

    async fn transaction(&self, db: u32, transaction: Transaction) -> ClientResult<Option<Vec<Reply>>> {
        let mut state = self.writer.lock().await;

        if !transaction.conditions.is_empty() {
            let mut watched: Vec<Bytes> = Vec::with_capacity(transaction.conditions.len());
            for condition in &transaction.conditions {
                if !watched.contains(condition.key()) {
                    watched.push(condition.key().clone());
                }
            }
            let mut frames = vec![raw_args("WATCH", watched)];
            frames.extend(
                transaction
                    .conditions
                    .iter()
                    .map(|condition| command_args(&condition.probe())),
            );
            let receivers = self.dispatch(&mut state, db, frames).await?;

            match self.evaluate_guards(&transaction, receivers).await {
                Ok(true) => {}
                Ok(false) => {
                    self.release_watch(&mut state, db).await?;
                    return Ok(None);
                }
                Err(err) => {
                    self.abandon_watch(&mut state, db, &err).await;
                    return Err(err);
                }
            }
        }

        let mut frames = Vec::with_capacity(transaction.commands.len() + 2);
        frames.push(raw_args("MULTI", []));
        frames.extend(transaction.commands.iter().map(command_args));
        frames.push(raw_args("EXEC", []));
        let receivers = self.dispatch(&mut state, db, frames).await?;
        drop(state);

        let mut replies = self.await_all(receivers).await?;
        match replies.pop() {
            Some(Reply::Array(results)) => Ok(Some(results)),
            Some(Reply::Nil) => Ok(None),
            Some(Reply::Error(message)) => Err(ClientError::Server(message)),
            other => Err(ClientError::UnexpectedResponse(format!("{other:?}"))),
        }
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.shared.connected.load(Ordering::Acquire)
    }

    fn outstanding_requests(&self) -> usize {
        self.shared.outstanding.load(Ordering::Acquire)
    }

    fn signals(&self) -> &ConnectionSignals {
        &self.signals
    }

    fn endpoint(&self) -> &str {
        &self.config.address
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.connected.store(false, Ordering::Release);
        if let Some(reader) = self.reader.lock().take() {
            reader.task.abort();
            reader.link.fail_all(&self.shared);
        }
        // The write half is dropped here when uncontended, otherwise with the
        // connection itself.
        if let Ok(mut state) = self.writer.try_lock() {
            state.stream = None;
        }
        debug!(endpoint = %self.config.address, "connection closed");
    }
}

impl Drop for RespConnection {
    fn drop(&mut self) {
        self.close();
    }
}

async fn open_stream(config: &EndpointConfig) -> ClientResult<TcpStream> {
    let connect = TcpStream::connect(config.address.as_str());
    let stream = match config.connect_timeout() {
        Some(limit) => tokio::time::timeout(limit, connect)
            .await
            .map_err(|_| ClientError::Timeout(limit))??,
        None => connect.await?,
    };
    Ok(stream)
}

/// Decodes replies off the socket and completes waiters in order.
async fn read_loop(
    mut reader: OwnedReadHalf,
    link: Arc<Link>,
    shared: Arc<Shared>,
    signals: ConnectionSignals,
    endpoint: String,
    generation: u64,
) {
    let mut buffer = BytesMut::with_capacity(8 * 1024);

    let (failure, message) = 'read: loop {
        match reader.read_buf(&mut buffer).await {
            Ok(0) => break (FailureKind::SocketClosed, "connection closed by peer".to_string()),
            Ok(_) => {}
            Err(err) => break (FailureKind::SocketFailure, err.to_string()),
        }

        loop {
            match decode_reply(&mut buffer) {
                Ok(Some(reply)) => {
                    if let Reply::Error(message) = &reply {
                        signals.emit(&ConnectionEvent::ErrorMessage {
                            endpoint: endpoint.clone(),
                            message: message.clone(),
                        });
                    }
                    if !link.complete(reply, &shared) {
                        signals.emit(&ConnectionEvent::InternalError {
                            origin: "resp-reader",
                            message: "reply received with no pending request".to_string(),
                        });
                    }
                }
                Ok(None) => break,
                Err(err) => break 'read (FailureKind::ProtocolFailure, err.to_string()),
            }
        }
    };

    link.fail_all(&shared);
    let current = shared.generation.load(Ordering::Acquire) == generation;
    if current && shared.connected.swap(false, Ordering::AcqRel) {
        warn!(%endpoint, %failure, "connection lost");
        signals.emit(&ConnectionEvent::ConnectionFailed {
            endpoint,
            failure,
            message,
        });
    }
}

/// Opens `RespConnection`s to one endpoint.
#[derive(Debug, Clone)]
pub struct RespConnector {
    endpoint: EndpointConfig,
}

impl RespConnector {
    pub fn new(endpoint: EndpointConfig) -> Self {
        RespConnector { endpoint }
    }
}

impl Connector for RespConnector {
    type Connection = RespConnection;

    async fn connect(&self, slot: usize) -> ClientResult<RespConnection> {
        debug!(slot, endpoint = %self.endpoint.address, "opening pooled connection");
        RespConnection::connect(self.endpoint.clone()).await
    }
}
