//! Registry of requests in flight.
//!
//! Every evaluation request is registered under a fresh [`RequestId`] before
//! its bytes are written, and stays registered until the matching response
//! has been dispatched or the session is torn down. The registry is the only
//! owner of the callbacks and cleanup obligations attached to a request.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::ipc::{Outcome, Payload, RemoteFailure};

/// Short random token correlating a request with its response.
///
/// Eight lowercase hex characters drawn from two random 16-bit halves.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(String);

impl RequestId {
    pub fn generate() -> Self {
        let high: u16 = rand::random();
        let low: u16 = rand::random();
        Self(format!("{high:04x}{low:04x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl Borrow<str> for RequestId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Name of an editor-side context: a source buffer or a REPL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(String);

impl ContextId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContextId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

pub type SuccessCallback = Box<dyn FnOnce(Payload) + Send>;
pub type FailureCallback = Box<dyn FnOnce(RemoteFailure) + Send>;

/// An outstanding request and everything that must happen when it ends.
pub struct TrackedRequest {
    pub(crate) origin: ContextId,
    pub(crate) display: ContextId,
    pub(crate) on_success: SuccessCallback,
    pub(crate) on_failure: FailureCallback,
    pub(crate) show_errors: bool,
    pub(crate) tmpfile: Option<PathBuf>,
    pub(crate) force_tmpfile: bool,
    pub(crate) waiter: Option<oneshot::Sender<Outcome>>,
}

impl TrackedRequest {
    /// Create a request originating in `origin` whose output belongs to the
    /// REPL `display`.
    ///
    /// The default callbacks log a generic acknowledgement or failure notice,
    /// and errors are shown.
    pub fn new(origin: ContextId, display: ContextId) -> Self {
        let done_in = display.clone();
        let failed_in = display.clone();
        Self {
            origin,
            display,
            on_success: Box::new(move |_| info!("{done_in}: evaluation finished")),
            on_failure: Box::new(move |failure| {
                warn!("{failed_in}: evaluation failed: {}", failure.message)
            }),
            show_errors: true,
            tmpfile: None,
            force_tmpfile: false,
            waiter: None,
        }
    }

    pub fn on_success(mut self, callback: impl FnOnce(Payload) + Send + 'static) -> Self {
        self.on_success = Box::new(callback);
        self
    }

    pub fn on_failure(mut self, callback: impl FnOnce(RemoteFailure) + Send + 'static) -> Self {
        self.on_failure = Box::new(callback);
        self
    }

    /// Whether a remote failure is handed to the error viewer.
    pub fn show_errors(mut self, show: bool) -> Self {
        self.show_errors = show;
        self
    }

    /// Send the code through a temp file regardless of its size.
    pub fn via_tmpfile(mut self) -> Self {
        self.force_tmpfile = true;
        self
    }

    /// Attach a temp file to delete once the request ends.
    pub fn with_tmpfile(mut self, path: impl Into<PathBuf>) -> Self {
        self.tmpfile = Some(path.into());
        self
    }

    pub(crate) fn with_waiter(mut self, waiter: oneshot::Sender<Outcome>) -> Self {
        self.waiter = Some(waiter);
        self
    }

    pub fn origin(&self) -> &ContextId {
        &self.origin
    }

    pub fn display(&self) -> &ContextId {
        &self.display
    }

    pub fn shows_errors(&self) -> bool {
        self.show_errors
    }

    pub fn tmpfile(&self) -> Option<&Path> {
        self.tmpfile.as_deref()
    }
}

impl fmt::Debug for TrackedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedRequest")
            .field("origin", &self.origin)
            .field("display", &self.display)
            .field("show_errors", &self.show_errors)
            .field("tmpfile", &self.tmpfile)
            .field("waiting", &self.waiter.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Request id {0} is already outstanding")]
    DuplicateId(RequestId),
}

enum Slot {
    Pending(TrackedRequest),
    /// Callbacks taken by the dispatcher; still counted as registered until
    /// retired.
    Resolving,
}

/// Map of request id to tracked request.
#[derive(Default)]
pub struct Registry {
    entries: Mutex<HashMap<RequestId, Slot>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RequestId, Slot>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a request under a fresh id.
    ///
    /// The id is redrawn if it collides with an outstanding request.
    pub fn register(&self, request: TrackedRequest) -> RequestId {
        let mut entries = self.lock();
        let id = loop {
            let candidate = RequestId::generate();
            if !entries.contains_key(&candidate) {
                break candidate;
            }
            debug!("Request id {candidate} already outstanding, drawing another");
        };
        entries.insert(id.clone(), Slot::Pending(request));
        id
    }

    /// Register a request under a caller-chosen id.
    ///
    /// For ids fixed in advance, such as in tests against a scripted peer.
    /// Fails with [`RegistryError::DuplicateId`] if `id` is outstanding, leaving
    /// the existing entry untouched.
    pub fn register_with_id(
        &self,
        id: RequestId,
        request: TrackedRequest,
    ) -> Result<(), RegistryError> {
        let mut entries = self.lock();
        if entries.contains_key(&id) {
            return Err(RegistryError::DuplicateId(id));
        }
        entries.insert(id, Slot::Pending(request));
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Ids of all registered requests, sorted.
    pub fn ids(&self) -> Vec<RequestId> {
        let mut ids: Vec<_> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Take the request out for resolution, leaving it registered.
    ///
    /// Returns `None` for unknown ids and for requests already being
    /// resolved, so each request resolves at most once.
    pub(crate) fn begin_resolve(&self, id: &str) -> Option<TrackedRequest> {
        let mut entries = self.lock();
        let slot = entries.get_mut(id)?;
        match std::mem::replace(slot, Slot::Resolving) {
            Slot::Pending(request) => Some(request),
            Slot::Resolving => None,
        }
    }

    /// Remove a request after resolution.
    pub(crate) fn retire(&self, id: &str) -> bool {
        self.lock().remove(id).is_some()
    }

    /// Remove a pending request that never reached the interpreter.
    pub(crate) fn withdraw(&self, id: &str) -> Option<TrackedRequest> {
        let mut entries = self.lock();
        match entries.remove(id)? {
            Slot::Pending(request) => Some(request),
            Slot::Resolving => {
                // Put it back; the dispatcher still owns this one.
                entries.insert(RequestId::from(id), Slot::Resolving);
                None
            }
        }
    }

    /// Remove every pending request.
    ///
    /// Requests mid-resolution are left for the dispatcher to retire.
    pub(crate) fn drain(&self) -> Vec<(RequestId, TrackedRequest)> {
        let mut entries = self.lock();
        let pending: Vec<RequestId> = entries
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Pending(_)))
            .map(|(id, _)| id.clone())
            .collect();

        let mut drained = Vec::with_capacity(pending.len());
        for id in pending {
            if let Some(Slot::Pending(request)) = entries.remove(&id) {
                drained.push((id, request));
            }
        }
        drained.sort_by(|a, b| a.0.cmp(&b.0));
        drained
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("outstanding", &self.len())
            .finish()
    }
}
