//! snailwire: asynchronous REPL protocol engine
//!
//! This library connects an editor to a running interpreter over TCP and
//! keeps any number of evaluation requests in flight:
//!
//! - `ipc` - wire codec, stream reassembly and the transport session
//! - `registry` - outstanding requests keyed by request id
//! - `dispatch` - routing responses to callbacks, with cleanup
//! - `cache` - per-connection name lists
//! - `manager` - one session per REPL context
//! - `hooks` - busy indicator and error viewer seams
//!
//! # Example
//!
//! ```ignore
//! use snailwire::{Hooks, NamespacePath, SessionConfig, SessionManager};
//!
//! let manager = SessionManager::new(SessionConfig::default(), Hooks::default());
//! let session = manager.connect(&"repl".into()).await?;
//! let reply = session.eval_sync(&NamespacePath::Root, "1 + 1").await?;
//! ```

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod hooks;
pub mod ipc;
pub mod manager;
pub mod registry;
pub mod sexp;
pub mod tmpfile;

pub use cache::NameSlot;
pub use config::{SessionConfig, TeardownPolicy};
pub use hooks::Hooks;
pub use ipc::{NamespacePath, Outcome, Payload, RemoteFailure, ReplSession, SessionError, SyncReply};
pub use manager::SessionManager;
pub use registry::{ContextId, RequestId, TrackedRequest};
pub use sexp::Sexp;
