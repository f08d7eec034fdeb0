//! Transport session to a remote interpreter.
//!
//! `ReplSession` owns one TCP connection. Callers send requests from any
//! task; a reader task feeds incoming bytes through the reassembler and
//! dispatcher, so responses are matched to requests by id and may arrive in
//! any order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::cache::{NameCache, NameSlot, Names};
use crate::config::SessionConfig;
use crate::dispatch::Dispatcher;
use crate::hooks::Hooks;
use crate::ipc::codec::{
    encode_request, escape_string, DecodeError, InvalidNamespace, NamespacePath, Outcome, Payload,
};
use crate::ipc::framing::Reassembler;
use crate::registry::{ContextId, Registry, RequestId, TrackedRequest};
use crate::tmpfile;

/// Read buffer size for the reader task.
const READ_CHUNK: usize = 8 * 1024;

/// Session-level error types.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Every connection attempt failed.
    #[error("Connection to {addr} failed after {attempts} attempt(s): {source}")]
    ConnectionFailed {
        addr: String,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    /// The namespace cannot be written as a request token; nothing was sent.
    #[error(transparent)]
    InvalidNamespace(#[from] InvalidNamespace),

    /// Writing the request line failed.
    #[error("Send failed: {0}")]
    Send(#[source] std::io::Error),

    /// The session has been torn down or the interpreter hung up.
    #[error("Session is closed")]
    Closed,

    /// Spilling large code to a temp file failed; nothing was sent.
    #[error("Temp file error: {0}")]
    TempFile(#[source] std::io::Error),

    /// A name-list query produced no usable list.
    #[error("Names for {slot} unavailable: {reason}")]
    NamesUnavailable { slot: NameSlot, reason: String },
}

/// Result of a synchronous call.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncReply {
    Resolved(Outcome),
    /// Nothing arrived within the budget, or the request was abandoned.
    NoValue,
}

impl SyncReply {
    /// The outcome, or `None` for [`SyncReply::NoValue`].
    pub fn outcome(&self) -> Option<&Outcome> {
        match self {
            SyncReply::Resolved(outcome) => Some(outcome),
            SyncReply::NoValue => None,
        }
    }

    pub fn into_outcome(self) -> Option<Outcome> {
        match self {
            SyncReply::Resolved(outcome) => Some(outcome),
            SyncReply::NoValue => None,
        }
    }
}

/// One sent line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptEntry {
    pub at: DateTime<Utc>,
    pub request_id: String,
    pub line: String,
}

/// Inbound half shared between the session and its reader task.
struct Inbound {
    context: ContextId,
    reassembler: Mutex<Reassembler>,
    dispatcher: Dispatcher,
}

impl Inbound {
    fn reassembler(&self) -> MutexGuard<'_, Reassembler> {
        self.reassembler.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the number of responses dispatched to a request.
    fn on_bytes(&self, chunk: &[u8]) -> usize {
        let decoded = self.reassembler().push(chunk);

        let mut dispatched = 0;
        for item in decoded {
            match item {
                Ok(response) => {
                    debug!("{}: response for {}", self.context, response.request_id);
                    if self.dispatcher.dispatch(response).is_ok() {
                        dispatched += 1;
                    }
                }
                Err(DecodeError::ProtocolViolation { reason, consumed }) => {
                    warn!("{}: dropped {consumed} bytes: {reason}", self.context);
                }
                Err(DecodeError::Malformed(reason)) => {
                    debug!("{}: waiting for more bytes: {reason}", self.context);
                }
            }
        }
        dispatched
    }
}

/// Connect with a fixed delay between attempts.
///
/// A zero attempt count is treated as one.
///
/// # Errors
///
/// Returns [`SessionError::ConnectionFailed`] carrying the last I/O error once
/// `max_attempts` attempts have failed.
pub async fn connect_with_retry(
    addr: &str,
    max_attempts: u32,
    delay: Duration,
) -> Result<TcpStream, SessionError> {
    let attempts = max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Could not set TCP_NODELAY on {addr}: {e}");
                }
                return Ok(stream);
            }
            Err(e) if attempt < attempts => {
                debug!("Connect to {addr} failed (attempt {attempt}/{attempts}): {e}");
                attempt += 1;
                tokio::time::sleep(delay).await;
            }
            Err(source) => {
                return Err(SessionError::ConnectionFailed {
                    addr: addr.to_string(),
                    attempts,
                    source,
                })
            }
        }
    }
}

async fn read_loop(mut reader: OwnedReadHalf, inbound: Arc<Inbound>, connected: Arc<AtomicBool>) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                info!("{}: interpreter closed the connection", inbound.context);
                break;
            }
            Ok(n) => {
                inbound.on_bytes(&buf[..n]);
            }
            Err(e) => {
                warn!("{}: read failed: {e}", inbound.context);
                break;
            }
        }
    }
    connected.store(false, Ordering::SeqCst);
}

/// A live connection to one interpreter, owned by one REPL context.
pub struct ReplSession {
    context: ContextId,
    addr: String,
    config: Arc<SessionConfig>,
    hooks: Hooks,
    inbound: Arc<Inbound>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    connected: Arc<AtomicBool>,
    names: NameCache,
    transcript: Mutex<VecDeque<TranscriptEntry>>,
}

impl ReplSession {
    /// Connect to the interpreter at `config.host:config.port`.
    pub async fn connect(
        context: ContextId,
        config: Arc<SessionConfig>,
        hooks: Hooks,
    ) -> Result<Self, SessionError> {
        let addr = config.addr();
        let stream =
            connect_with_retry(&addr, config.connect_attempts, config.retry_delay()).await?;
        info!("{context}: connected to {addr}");

        let (read_half, write_half) = stream.into_split();
        let registry = Arc::new(Registry::new());
        let inbound = Arc::new(Inbound {
            context: context.clone(),
            reassembler: Mutex::new(Reassembler::with_max_buffer(config.max_buffer_bytes)),
            dispatcher: Dispatcher::new(registry, hooks.clone()),
        });
        let connected = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(read_loop(read_half, inbound.clone(), connected.clone()));

        Ok(Self {
            context,
            addr,
            config,
            hooks,
            inbound,
            writer: tokio::sync::Mutex::new(Some(write_half)),
            reader: Mutex::new(Some(reader)),
            connected,
            names: NameCache::new(),
            transcript: Mutex::new(VecDeque::new()),
        })
    }

    fn registry(&self) -> &Arc<Registry> {
        self.inbound.dispatcher.registry()
    }

    /// Send `code` for evaluation in `namespace`.
    ///
    /// The request is registered before any bytes are written, so a response
    /// can never outrun its registration. A temp file attached by the caller
    /// is kept as is and the code is sent inline.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The session is torn down or the interpreter hung up (`SessionError::Closed`)
    /// - `namespace` has a segment that is not an identifier (`SessionError::InvalidNamespace`)
    /// - The spill file cannot be written (`SessionError::TempFile`)
    /// - Writing the line fails (`SessionError::Send`)
    ///
    /// Nothing stays registered after an error.
    pub async fn send(
        &self,
        namespace: &NamespacePath,
        code: &str,
        mut request: TrackedRequest,
    ) -> Result<RequestId, SessionError> {
        if !self.is_connected() {
            return Err(SessionError::Closed);
        }
        let tokens = namespace.tokens()?;

        let spill = request.tmpfile.is_none()
            && (request.force_tmpfile || code.len() > self.config.inline_limit);
        let wire_code = if spill {
            let path = tmpfile::write(code).map_err(SessionError::TempFile)?;
            let loader = self
                .config
                .tmpfile_loader
                .replace("{path}", &escape_string(&path.to_string_lossy()));
            request.tmpfile = Some(path);
            loader
        } else {
            code.to_string()
        };

        let origin = request.origin.clone();
        let id = self.registry().register(request);
        self.hooks.busy.start(&origin);

        let line = encode_request(&tokens, id.as_str(), &wire_code);
        if let Err(e) = self.write_line(&line).await {
            warn!("{}: request {id} not sent: {e}", self.context);
            if let Some(request) = self.registry().withdraw(id.as_str()) {
                if let Some(path) = request.tmpfile() {
                    tmpfile::remove(path);
                }
                self.hooks.busy.stop(&origin);
            }
            return Err(e);
        }

        self.record(&id, &line);
        Ok(id)
    }

    async fn write_line(&self, line: &str) -> Result<(), SessionError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(SessionError::Closed)?;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(SessionError::Send)?;
        writer.flush().await.map_err(SessionError::Send)
    }

    fn record(&self, id: &RequestId, line: &str) {
        trace!("{} -> {}", self.context, line.trim_end());

        let limit = self.config.transcript_lines;
        if limit == 0 {
            return;
        }
        let mut transcript = self.transcript.lock().unwrap_or_else(PoisonError::into_inner);
        while transcript.len() >= limit {
            transcript.pop_front();
        }
        transcript.push_back(TranscriptEntry {
            at: Utc::now(),
            request_id: id.to_string(),
            line: line.trim_end().to_string(),
        });
    }

    /// Send a request and wait up to `budget` for its outcome.
    ///
    /// On timeout the request stays registered and its callbacks still run
    /// when the response arrives.
    ///
    /// # Errors
    ///
    /// Only the errors of [`send`](Self::send). A timeout or an abandoned
    /// request is `Ok(SyncReply::NoValue)`, and a remote failure is
    /// `Ok(SyncReply::Resolved(Outcome::Failure(_)))`.
    pub async fn call_sync(
        &self,
        namespace: &NamespacePath,
        code: &str,
        request: TrackedRequest,
        budget: Duration,
    ) -> Result<SyncReply, SessionError> {
        let (tx, rx) = oneshot::channel();
        let id = self.send(namespace, code, request.with_waiter(tx)).await?;

        match timeout(budget, rx).await {
            Ok(Ok(outcome)) => Ok(SyncReply::Resolved(outcome)),
            Ok(Err(_)) => {
                debug!("{}: request {id} ended without a value", self.context);
                Ok(SyncReply::NoValue)
            }
            Err(_) => {
                debug!(
                    "{}: request {id} still outstanding after {}ms",
                    self.context,
                    budget.as_millis()
                );
                Ok(SyncReply::NoValue)
            }
        }
    }

    /// [`call_sync`](Self::call_sync) with default callbacks and the
    /// configured budget.
    pub async fn eval_sync(
        &self,
        namespace: &NamespacePath,
        code: &str,
    ) -> Result<SyncReply, SessionError> {
        let request = TrackedRequest::new(self.context.clone(), self.context.clone());
        self.call_sync(namespace, code, request, self.config.sync_timeout())
            .await
    }

    /// Name list for `slot`, fetched once per connection.
    pub async fn names(&self, slot: NameSlot) -> Result<Names, SessionError> {
        self.names
            .get_or_fetch(slot, || self.fetch_names(slot))
            .await
    }

    /// Name list for `slot` if already fetched.
    pub async fn cached_names(&self, slot: NameSlot) -> Option<Names> {
        self.names.get(slot).await
    }

    async fn fetch_names(&self, slot: NameSlot) -> Result<Vec<String>, SessionError> {
        let unavailable = |reason: String| SessionError::NamesUnavailable { slot, reason };

        let request = TrackedRequest::new(self.context.clone(), self.context.clone())
            .show_errors(false)
            .on_success(|_| {})
            .on_failure(|_| {});
        let reply = self
            .call_sync(
                &NamespacePath::Root,
                self.config.names_query(slot),
                request,
                self.config.sync_timeout(),
            )
            .await?;

        match reply {
            SyncReply::Resolved(Outcome::Success(Payload::Value(value))) => value
                .into_string_list()
                .ok_or_else(|| unavailable("reply is not a list of names".to_string())),
            SyncReply::Resolved(Outcome::Success(Payload::Nothing)) => {
                Err(unavailable("query returned nothing".to_string()))
            }
            SyncReply::Resolved(Outcome::Failure(failure)) => Err(unavailable(failure.message)),
            SyncReply::NoValue => Err(unavailable("no reply".to_string())),
        }
    }

    /// Feed bytes received from the interpreter.
    ///
    /// The reader task calls this for every chunk; editors running their own
    /// I/O loop may call it directly. Returns the number of responses that
    /// resolved a request.
    pub fn on_bytes(&self, chunk: &[u8]) -> usize {
        self.inbound.on_bytes(chunk)
    }

    /// Close the connection and settle every outstanding request.
    ///
    /// Returns the number of requests drained. Calling it again is a no-op.
    pub async fn teardown(&self) -> usize {
        let writer = self.writer.lock().await.take();
        let was_open = writer.is_some();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                debug!("{}: shutdown failed: {e}", self.context);
            }
        }

        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = reader {
            handle.abort();
        }
        self.connected.store(false, Ordering::SeqCst);

        self.inbound.reassembler().clear();
        self.names.evict().await;
        let drained = self.inbound.dispatcher.drain(self.config.teardown);

        if was_open {
            info!(
                "{}: session to {} closed, {drained} request(s) {}",
                self.context,
                self.addr,
                self.config.teardown.as_str()
            );
        }
        drained
    }

    /// False once torn down or after the interpreter hung up.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Number of registered requests.
    pub fn outstanding(&self) -> usize {
        self.registry().len()
    }

    /// True until the response for `id` has been handled or the session is
    /// torn down.
    pub fn is_outstanding(&self, id: &RequestId) -> bool {
        self.registry().contains(id.as_str())
    }

    /// Sent lines, oldest first.
    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        self.transcript
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Bytes of an incomplete response held back by the reassembler.
    pub fn buffered_bytes(&self) -> usize {
        self.inbound.reassembler().len()
    }

    /// REPL context that owns this session.
    pub fn context(&self) -> &ContextId {
        &self.context
    }

    /// `host:port` this session connected to.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}

impl std::fmt::Debug for ReplSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplSession")
            .field("context", &self.context)
            .field("addr", &self.addr)
            .field("connected", &self.is_connected())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

impl Drop for ReplSession {
    fn drop(&mut self) {
        let reader = self
            .reader
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = reader {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::codec::RemoteFailure;
    use pretty_assertions::assert_eq;
    use tokio::net::TcpListener;

    fn inbound() -> Inbound {
        Inbound {
            context: "repl".into(),
            reassembler: Mutex::new(Reassembler::new()),
            dispatcher: Dispatcher::new(Arc::new(Registry::new()), Hooks::default()),
        }
    }

    #[test]
    fn test_session_error_display() {
        let err = SessionError::ConnectionFailed {
            addr: "127.0.0.1:1".to_string(),
            attempts: 3,
            source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
        };
        assert_eq!(
            err.to_string(),
            "Connection to 127.0.0.1:1 failed after 3 attempt(s): refused"
        );
        assert_eq!(SessionError::Closed.to_string(), "Session is closed");

        let err = SessionError::NamesUnavailable {
            slot: NameSlot::Core,
            reason: "no reply".to_string(),
        };
        assert_eq!(err.to_string(), "Names for core unavailable: no reply");
    }

    #[test]
    fn test_on_bytes_dispatches_across_chunks() {
        let inbound = inbound();
        let registry = inbound.dispatcher.registry().clone();
        registry
            .register_with_id(
                "0000beef".into(),
                TrackedRequest::new("a.jl".into(), "repl".into()),
            )
            .unwrap();

        assert_eq!(inbound.on_bytes(b"(response-done \"0000"), 0);
        assert!(registry.contains("0000beef"));
        assert_eq!(inbound.on_bytes(b"beef\" 1)\n"), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_on_bytes_survives_garbage_and_unknown_ids() {
        let inbound = inbound();
        let registry = inbound.dispatcher.registry().clone();
        let id = registry.register(TrackedRequest::new("a.jl".into(), "repl".into()));

        let wire = format!(
            "(hello world) (response-done \"ffffffff\" 1) (response-failure \"{id}\" \"oops\" ())"
        );
        assert_eq!(inbound.on_bytes(wire.as_bytes()), 1);
        assert!(registry.is_empty());
        assert_eq!(inbound.reassembler().len(), 0);
    }

    #[test]
    fn test_sync_reply_accessors() {
        let failure = Outcome::Failure(RemoteFailure::new("boom", Vec::new()));
        assert_eq!(SyncReply::Resolved(failure.clone()).outcome(), Some(&failure));
        assert_eq!(SyncReply::NoValue.into_outcome(), None);
    }

    #[tokio::test]
    async fn test_connect_with_retry_gives_up() {
        // Bind then drop to get a port nobody is listening on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = connect_with_retry(&addr, 3, Duration::from_millis(10))
            .await
            .unwrap_err();
        match err {
            SessionError::ConnectionFailed {
                addr: failed,
                attempts,
                ..
            } => {
                assert_eq!(failed, addr);
                assert_eq!(attempts, 3);
            }
            other => panic!("Expected ConnectionFailed, got {other:?}"),
        }
    }
}
