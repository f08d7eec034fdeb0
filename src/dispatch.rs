//! Routing decoded responses to the requests that asked for them.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::TeardownPolicy;
use crate::hooks::Hooks;
use crate::ipc::{Outcome, RemoteFailure, Response};
use crate::registry::{Registry, TrackedRequest};
use crate::tmpfile;

/// Message given to failure callbacks when the connection goes away under a
/// request.
pub const CONNECTION_CLOSED: &str = "connection closed";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// No outstanding request carries this id. The response is dropped.
    #[error("Unknown request id {0}")]
    UnknownRequestId(String),
}

/// Resolves responses against a session's registry.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
    hooks: Hooks,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, hooks: Hooks) -> Self {
        Self { registry, hooks }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn dispatch(&self, response: Response) -> Result<(), DispatchError> {
        self.resolve(&response.request_id, response.outcome)
    }

    /// Run the callbacks for request `id`, then clean up after it.
    ///
    /// The request stays registered while its callbacks run. Afterwards its
    /// temp file is deleted, the busy indicator stopped, and the entry
    /// removed, even if a callback panicked.
    pub fn resolve(&self, id: &str, outcome: Outcome) -> Result<(), DispatchError> {
        let Some(request) = self.registry.begin_resolve(id) else {
            warn!("Dropping response for unknown request {id}");
            return Err(DispatchError::UnknownRequestId(id.to_string()));
        };

        let TrackedRequest {
            origin,
            on_success,
            on_failure,
            show_errors,
            tmpfile,
            waiter,
            ..
        } = request;

        let delivered = outcome.clone();
        let result = catch_unwind(AssertUnwindSafe(|| match outcome {
            Outcome::Success(payload) => on_success(payload),
            Outcome::Failure(failure) => {
                if show_errors {
                    self.hooks.errors.show(&origin, &failure);
                }
                on_failure(failure);
            }
        }));
        if let Err(panic) = result {
            error!("Callback for request {id} panicked: {}", panic_message(&*panic));
        }

        if let Some(path) = tmpfile {
            tmpfile::remove(&path);
        }
        self.hooks.busy.stop(&origin);
        self.registry.retire(id);

        if let Some(waiter) = waiter {
            // Receiver gone means the sync caller already timed out.
            let _ = waiter.send(delivered);
        }
        Ok(())
    }

    /// End every pending request without a response.
    ///
    /// Returns the number of requests drained.
    pub fn drain(&self, policy: TeardownPolicy) -> usize {
        let drained = self.registry.drain();
        let count = drained.len();

        for (id, request) in drained {
            let TrackedRequest {
                origin,
                on_failure,
                tmpfile,
                waiter,
                ..
            } = request;
            info!("Request {id} from {origin} {}", policy.as_str());

            let delivered = match policy {
                TeardownPolicy::Abandon => None,
                TeardownPolicy::Fail => {
                    let failure = RemoteFailure::new(CONNECTION_CLOSED, Vec::new());
                    let result = catch_unwind(AssertUnwindSafe(|| on_failure(failure.clone())));
                    if let Err(panic) = result {
                        error!("Callback for request {id} panicked: {}", panic_message(&*panic));
                    }
                    Some(Outcome::Failure(failure))
                }
            };

            if let Some(path) = tmpfile {
                tmpfile::remove(&path);
            }
            self.hooks.busy.stop(&origin);

            // Dropping the waiter unblocks a sync caller with no value.
            if let (Some(waiter), Some(outcome)) = (waiter, delivered) {
                let _ = waiter.send(outcome);
            }
        }
        count
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use pretty_assertions::assert_eq;
    use tokio::sync::oneshot;

    use crate::hooks::{BusyIndicator, ErrorViewer};
    use crate::ipc::Payload;
    use crate::registry::{ContextId, RequestId};
    use crate::sexp::Sexp;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn push(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl BusyIndicator for Recorder {
        fn start(&self, origin: &ContextId) {
            self.push(format!("start {origin}"));
        }

        fn stop(&self, origin: &ContextId) {
            self.push(format!("stop {origin}"));
        }
    }

    impl ErrorViewer for Recorder {
        fn show(&self, origin: &ContextId, failure: &RemoteFailure) {
            self.push(format!("show {origin}: {}", failure.message));
        }
    }

    fn setup() -> (Dispatcher, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let hooks = Hooks::new(recorder.clone(), recorder.clone());
        (Dispatcher::new(Arc::new(Registry::new()), hooks), recorder)
    }

    fn request() -> TrackedRequest {
        TrackedRequest::new("scratch.jl".into(), "repl".into())
    }

    fn success(id: &str, value: Sexp) -> Response {
        Response {
            request_id: id.to_string(),
            outcome: Outcome::Success(Payload::Value(value)),
        }
    }

    fn failure(id: &str, message: &str) -> Response {
        Response {
            request_id: id.to_string(),
            outcome: Outcome::Failure(RemoteFailure::new(message, vec!["top-level".into()])),
        }
    }

    #[test]
    fn test_success_runs_callback_and_cleans_up() {
        let (dispatcher, recorder) = setup();
        let tmp = tmpfile::write("x = 42").unwrap();
        let seen = Arc::new(Mutex::new(None));

        let sink = seen.clone();
        dispatcher
            .registry()
            .register_with_id(
                RequestId::from("abcd1234"),
                request()
                    .with_tmpfile(&tmp)
                    .on_success(move |payload| *sink.lock().unwrap() = Some(payload)),
            )
            .unwrap();

        let (response, _) =
            crate::ipc::decode_response(b"(response-done \"abcd1234\" \"42\")").unwrap();
        dispatcher.dispatch(response).unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            Some(Payload::Value(Sexp::string("42")))
        );
        assert!(!tmp.exists());
        assert!(dispatcher.registry().is_empty());
        assert_eq!(recorder.events(), vec!["stop scratch.jl".to_string()]);
    }

    #[test]
    fn test_callback_sees_request_still_registered() {
        let (dispatcher, _) = setup();
        let registry = dispatcher.registry().clone();
        let observed = Arc::new(Mutex::new(None));

        let sink = observed.clone();
        let view = registry.clone();
        let id = registry.register(request().on_success(move |_| {
            *sink.lock().unwrap() = Some(view.len());
        }));

        dispatcher.dispatch(success(id.as_str(), Sexp::Int(1))).unwrap();
        assert_eq!(*observed.lock().unwrap(), Some(1));
        assert!(!registry.contains(id.as_str()));
    }

    #[test]
    fn test_failure_shown_only_when_enabled() {
        let (dispatcher, recorder) = setup();
        let messages = Arc::new(Mutex::new(Vec::new()));

        let sink = messages.clone();
        let loud = dispatcher.registry().register(
            request().on_failure(move |f| sink.lock().unwrap().push(f.message)),
        );
        let sink = messages.clone();
        let quiet = dispatcher.registry().register(
            request()
                .show_errors(false)
                .on_failure(move |f| sink.lock().unwrap().push(f.message)),
        );

        dispatcher.dispatch(failure(loud.as_str(), "UndefVarError: y")).unwrap();
        dispatcher.dispatch(failure(quiet.as_str(), "DomainError")).unwrap();

        assert_eq!(
            *messages.lock().unwrap(),
            vec!["UndefVarError: y".to_string(), "DomainError".to_string()]
        );
        assert_eq!(
            recorder.events(),
            vec![
                "show scratch.jl: UndefVarError: y".to_string(),
                "stop scratch.jl".to_string(),
                "stop scratch.jl".to_string(),
            ]
        );
    }

    #[test]
    fn test_unknown_id_is_rejected() {
        let (dispatcher, recorder) = setup();
        let known = dispatcher.registry().register(request());

        assert_eq!(
            dispatcher.dispatch(success("ffffffff", Sexp::Int(0))),
            Err(DispatchError::UnknownRequestId("ffffffff".to_string()))
        );
        assert!(dispatcher.registry().contains(known.as_str()));
        assert!(recorder.events().is_empty());
    }

    #[test]
    fn test_second_response_for_same_id_is_unknown() {
        let (dispatcher, _) = setup();
        let id = dispatcher.registry().register(request());

        dispatcher.dispatch(success(id.as_str(), Sexp::Int(1))).unwrap();
        assert!(dispatcher.dispatch(success(id.as_str(), Sexp::Int(2))).is_err());
    }

    #[test]
    fn test_out_of_order_resolution() {
        let (dispatcher, _) = setup();
        let order = Arc::new(Mutex::new(Vec::new()));

        let sink = order.clone();
        let a = dispatcher
            .registry()
            .register(request().on_success(move |_| sink.lock().unwrap().push("a")));
        let sink = order.clone();
        let b = dispatcher
            .registry()
            .register(request().on_success(move |_| sink.lock().unwrap().push("b")));

        dispatcher.dispatch(success(b.as_str(), Sexp::Int(2))).unwrap();
        assert!(dispatcher.registry().contains(a.as_str()));
        dispatcher.dispatch(success(a.as_str(), Sexp::Int(1))).unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["b", "a"]);
        assert!(dispatcher.registry().is_empty());
    }

    #[test]
    fn test_panicking_callback_still_cleans_up() {
        let (dispatcher, recorder) = setup();
        let tmp = tmpfile::write("boom").unwrap();
        let id = dispatcher.registry().register(
            request()
                .with_tmpfile(&tmp)
                .on_success(|_| panic!("callback exploded")),
        );

        dispatcher.dispatch(success(id.as_str(), Sexp::Int(1))).unwrap();

        assert!(!tmp.exists());
        assert!(dispatcher.registry().is_empty());
        assert_eq!(recorder.events(), vec!["stop scratch.jl".to_string()]);
    }

    #[test]
    fn test_waiter_receives_outcome() {
        let (dispatcher, _) = setup();
        let (tx, mut rx) = oneshot::channel();
        let id = dispatcher.registry().register(request().with_waiter(tx));

        dispatcher.dispatch(success(id.as_str(), Sexp::Int(7))).unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            Outcome::Success(Payload::Value(Sexp::Int(7)))
        );
    }

    #[test]
    fn test_drain_abandon_skips_callbacks() {
        let (dispatcher, recorder) = setup();
        let called = Arc::new(Mutex::new(false));
        let tmp = tmpfile::write("big").unwrap();
        let (tx, mut rx) = oneshot::channel();

        let sink = called.clone();
        dispatcher.registry().register(
            request()
                .with_tmpfile(&tmp)
                .with_waiter(tx)
                .on_failure(move |_| *sink.lock().unwrap() = true),
        );

        assert_eq!(dispatcher.drain(TeardownPolicy::Abandon), 1);
        assert!(!*called.lock().unwrap());
        assert!(!tmp.exists());
        assert!(dispatcher.registry().is_empty());
        assert!(rx.try_recv().is_err());
        assert_eq!(recorder.events(), vec!["stop scratch.jl".to_string()]);
    }

    #[test]
    fn test_drain_fail_reports_connection_closed() {
        let (dispatcher, recorder) = setup();
        let messages = Arc::new(Mutex::new(Vec::new()));
        let (tx, mut rx) = oneshot::channel();

        let sink = messages.clone();
        dispatcher.registry().register(
            request()
                .with_waiter(tx)
                .on_failure(move |f| sink.lock().unwrap().push(f.message)),
        );

        assert_eq!(dispatcher.drain(TeardownPolicy::Fail), 1);
        assert_eq!(*messages.lock().unwrap(), vec![CONNECTION_CLOSED.to_string()]);
        assert_eq!(
            rx.try_recv().unwrap(),
            Outcome::Failure(RemoteFailure::new(CONNECTION_CLOSED, Vec::new()))
        );
        // Teardown failures are not shown in the error viewer.
        assert_eq!(recorder.events(), vec!["stop scratch.jl".to_string()]);
        assert_eq!(dispatcher.drain(TeardownPolicy::Fail), 0);
    }
}
