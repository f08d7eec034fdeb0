//! Editor collaborators the protocol engine calls into.
//!
//! The engine decides *when* a busy indicator starts or stops and *whether*
//! a remote failure should be shown; drawing spinners and error buffers is
//! the editor's business. These traits are the seam, so an editor front end
//! (or a test) can plug in its own implementations.

use std::sync::Arc;

use tracing::{debug, error};

use crate::ipc::RemoteFailure;
use crate::registry::ContextId;

/// Busy indicator tied to an originating context.
///
/// `start` and `stop` are each called once per request.
pub trait BusyIndicator: Send + Sync {
    fn start(&self, origin: &ContextId);
    fn stop(&self, origin: &ContextId);
}

/// Viewer for remote errors and their stack traces.
pub trait ErrorViewer: Send + Sync {
    fn show(&self, origin: &ContextId, failure: &RemoteFailure);
}

/// Busy indicator that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingBusy;

impl BusyIndicator for TracingBusy {
    fn start(&self, origin: &ContextId) {
        debug!("{origin}: busy");
    }

    fn stop(&self, origin: &ContextId) {
        debug!("{origin}: idle");
    }
}

/// Error viewer that logs the message and stack.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorViewer;

impl ErrorViewer for TracingErrorViewer {
    fn show(&self, origin: &ContextId, failure: &RemoteFailure) {
        error!("{origin}: {}", failure.message);
        for frame in &failure.stack {
            error!("  in {frame}");
        }
    }
}

/// The collaborators injected into a session.
#[derive(Clone)]
pub struct Hooks {
    pub busy: Arc<dyn BusyIndicator>,
    pub errors: Arc<dyn ErrorViewer>,
}

impl Hooks {
    pub fn new(busy: Arc<dyn BusyIndicator>, errors: Arc<dyn ErrorViewer>) -> Self {
        Self { busy, errors }
    }
}

impl Default for Hooks {
    fn default() -> Self {
        Self::new(Arc::new(TracingBusy), Arc::new(TracingErrorViewer))
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks").finish_non_exhaustive()
    }
}
