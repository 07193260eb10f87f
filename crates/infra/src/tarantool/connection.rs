//! Connection manager for a single logical Tarantool session.
//!
//! ## Concurrency
//!
//! A session owns one TCP socket split into two halves:
//!
//! - a **writer task** drains a queue of fully-encoded request packets, so
//!   packets from concurrent callers are written whole and never interleave
//! - a **reader task** decodes response packets and routes each to the waiter
//!   registered under its `sync` id
//!
//! Callers therefore share one [`Connection`] freely (`&self` everywhere).
//!
//! ## Reconnect
//!
//! Dialing applies a fixed timeout and is retried a bounded number of times
//! with a fixed delay. When an established session dies, in-flight requests
//! fail with [`IprotoError::SessionClosed`] and the next call re-dials under
//! the same policy. Schema introspection is never performed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rmpv::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::error::IprotoError;
use super::protocol::{
    GREETING_LEN, Greeting, RequestType, Response, auth_body, call_body, encode_request,
    read_frame,
};

/// Outbound packets buffered per session before callers wait.
const OUTBOUND_QUEUE_DEPTH: usize = 256;

/// Dial/reconnect policy and credentials.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Authenticate as this user after the greeting; `None` stays `guest`.
    pub user: Option<String>,
    pub password: String,
    /// Applies to TCP connect and to reading the greeting.
    pub dial_timeout: Duration,
    /// Default per-request deadline.
    pub request_timeout: Duration,
    /// Pause between failed dial attempts.
    pub reconnect_delay: Duration,
    /// Extra dial attempts after the first one fails.
    pub max_reconnects: u32,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            user: None,
            password: String::new(),
            dial_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(1),
            max_reconnects: 3,
        }
    }
}

impl ConnectOptions {
    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = password.into();
        self
    }

    fn total_attempts(&self) -> u32 {
        self.max_reconnects.saturating_add(1)
    }
}

type Waiter = oneshot::Sender<Result<Response, IprotoError>>;

/// State shared between a session and its IO tasks.
#[derive(Debug, Default)]
struct Shared {
    pending: Mutex<HashMap<u64, Waiter>>,
    closed: AtomicBool,
}

impl Shared {
    fn register(&self, sync: u64, waiter: Waiter) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(sync, waiter);
    }

    fn take_waiter(&self, sync: u64) -> Option<Waiter> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&sync)
    }

    /// Mark the session dead and fail every in-flight request.
    fn shut_down(&self, reason: &str) {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<Waiter> = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, w)| w)
            .collect();
        for waiter in drained {
            let _ = waiter.send(Err(IprotoError::SessionClosed(reason.to_string())));
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// One live socket plus its IO tasks. Dropping it stops both tasks.
#[derive(Debug)]
struct Session {
    outbound: mpsc::Sender<Vec<u8>>,
    shared: Arc<Shared>,
    next_sync: AtomicU64,
    server_version: String,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Session {
    async fn dial(address: &str, options: &ConnectOptions) -> Result<Self, IprotoError> {
        let stream = tokio::time::timeout(options.dial_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| IprotoError::Timeout(options.dial_timeout))??;
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let mut raw = [0u8; GREETING_LEN];
        tokio::time::timeout(options.dial_timeout, reader.read_exact(&mut raw))
            .await
            .map_err(|_| IprotoError::Timeout(options.dial_timeout))??;
        let greeting = Greeting::parse(&raw)?;

        let shared = Arc::new(Shared::default());
        let (outbound, queue) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);

        let session = Self {
            outbound,
            shared: shared.clone(),
            next_sync: AtomicU64::new(1),
            server_version: greeting.version.clone(),
            reader: tokio::spawn(read_loop(reader, shared.clone())),
            writer: tokio::spawn(write_loop(write_half, queue, shared)),
        };

        if let Some(user) = &options.user {
            let body = auth_body(user, &options.password, &greeting.salt);
            session
                .request(RequestType::Auth, body, options.request_timeout)
                .await?;
            debug!(user = %user, "authenticated");
        }

        Ok(session)
    }

    async fn request(
        &self,
        request_type: RequestType,
        body: Vec<(Value, Value)>,
        timeout: Duration,
    ) -> Result<Value, IprotoError> {
        if self.shared.is_closed() {
            return Err(IprotoError::SessionClosed("session is closed".to_string()));
        }

        let sync = self.next_sync.fetch_add(1, Ordering::Relaxed);
        let frame = encode_request(request_type, sync, body)?;

        let (tx, rx) = oneshot::channel();
        self.shared.register(sync, tx);

        if self.outbound.send(frame).await.is_err() {
            self.shared.take_waiter(sync);
            return Err(IprotoError::SessionClosed("writer stopped".to_string()));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result?.into_data(),
            Ok(Err(_)) => Err(IprotoError::SessionClosed("response dropped".to_string())),
            Err(_) => {
                // A late response for this sync is discarded by the reader. For
                // calls with side effects on the session (take) the caller must
                // reset the connection; see `Connection::reset`.
                self.shared.take_waiter(sync);
                Err(IprotoError::Timeout(timeout))
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Stop both IO tasks, which closes the socket, and fail in-flight requests.
    fn terminate(&self, reason: &str) {
        self.reader.abort();
        self.writer.abort();
        self.shared.shut_down(reason);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.terminate("session dropped");
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::Receiver<Vec<u8>>,
    shared: Arc<Shared>,
) {
    while let Some(frame) = queue.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            warn!(error = %e, "tarantool write failed; closing session");
            shared.shut_down(&e.to_string());
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(mut reader: BufReader<OwnedReadHalf>, shared: Arc<Shared>) {
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "tarantool read failed; closing session");
                shared.shut_down(&e.to_string());
                return;
            }
        };

        match Response::decode(&frame) {
            Ok(response) => match shared.take_waiter(response.sync) {
                Some(waiter) => {
                    let _ = waiter.send(Ok(response));
                }
                None => debug!(sync = response.sync, "response without waiter discarded"),
            },
            Err(e) => warn!(error = %e, "undecodable response packet skipped"),
        }
    }
}

/// A managed connection to one Tarantool instance.
///
/// Create it once at startup with [`Connection::connect`] and share it behind
/// an `Arc`. The underlying socket is released when the connection is closed
/// or dropped.
#[derive(Debug)]
pub struct Connection {
    address: String,
    options: ConnectOptions,
    session: tokio::sync::Mutex<Option<Arc<Session>>>,
    closed: AtomicBool,
}

impl Connection {
    /// Dial `address`, retrying per `options`.
    ///
    /// Exhausting the attempts returns [`IprotoError::ConnectFailed`]; callers
    /// treat that as fatal at startup.
    pub async fn connect(
        address: impl Into<String>,
        options: ConnectOptions,
    ) -> Result<Self, IprotoError> {
        let connection = Self {
            address: address.into(),
            options,
            session: tokio::sync::Mutex::new(None),
            closed: AtomicBool::new(false),
        };
        connection.session().await?;
        Ok(connection)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Call a stored procedure with the default request timeout.
    pub async fn call(&self, function: &str, args: Vec<Value>) -> Result<Value, IprotoError> {
        self.call_with_timeout(function, args, self.options.request_timeout)
            .await
    }

    /// Call a stored procedure, waiting at most `timeout` for its response.
    ///
    /// Long-polling procedures need a deadline longer than their own wait.
    #[instrument(skip(self, args), fields(address = %self.address), err)]
    pub async fn call_with_timeout(
        &self,
        function: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value, IprotoError> {
        let session = self.session().await?;
        session
            .request(RequestType::Call, call_body(function, args), timeout)
            .await
    }

    pub async fn ping(&self) -> Result<(), IprotoError> {
        let session = self.session().await?;
        session
            .request(RequestType::Ping, Vec::new(), self.options.request_timeout)
            .await
            .map(|_| ())
    }

    /// Server banner of the current session, if one is established.
    pub async fn server_version(&self) -> Option<String> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|s| s.server_version.clone())
    }

    /// Release the socket. Idempotent; later calls fail with
    /// [`IprotoError::Shutdown`].
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.session.lock().await.take().is_some() {
            info!(address = %self.address, "tarantool connection closed");
        }
    }

    /// Close the current socket; the next call dials a fresh session.
    ///
    /// Tarantool returns every job taken on a closed session to the ready
    /// state, so this is how a `take` whose reply was lost gives its job back.
    pub async fn reset(&self, reason: &str) {
        if let Some(session) = self.session.lock().await.take() {
            warn!(address = %self.address, reason, "dropping tarantool session");
            session.terminate(reason);
        }
    }

    /// Current live session, dialing a new one if needed.
    async fn session(&self) -> Result<Arc<Session>, IprotoError> {
        if self.is_closed() {
            return Err(IprotoError::Shutdown);
        }

        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            if !session.is_closed() {
                return Ok(session.clone());
            }
            warn!(address = %self.address, "tarantool session lost; reconnecting");
        }
        *guard = None;

        let session = Arc::new(self.dial_with_retries().await?);
        *guard = Some(session.clone());
        Ok(session)
    }

    async fn dial_with_retries(&self) -> Result<Session, IprotoError> {
        let attempts = self.options.total_attempts();
        let mut last_error = None;

        for attempt in 1..=attempts {
            match Session::dial(&self.address, &self.options).await {
                Ok(session) => {
                    info!(
                        address = %self.address,
                        attempt,
                        server = %session.server_version,
                        "connected to tarantool"
                    );
                    return Ok(session);
                }
                Err(e) => {
                    warn!(address = %self.address, attempt, error = %e, "tarantool dial failed");
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.options.reconnect_delay).await;
                    }
                }
            }
        }

        Err(IprotoError::ConnectFailed {
            address: self.address.clone(),
            attempts,
            reason: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }
}
