//! Wire protocol and transport to a remote interpreter.
//!
//! # Protocol
//!
//! Requests are single lines of the interpreter's own syntax, naming the
//! target namespace, a request id, and the escaped source text:
//!
//! ```text
//! (ns = [:Main, :Plots], reqid = "1f3a09c2", code = "plot(x)")\n
//! ```
//!
//! Responses are s-expressions, one per request, in any order:
//!
//! ```text
//! (response-done "1f3a09c2" :nothing)
//! (response-failure "1f3a09c2" "UndefVarError: x" ("top-level scope"))
//! ```
//!
//! Responses are not delimited; the reader accumulates bytes until a whole
//! datum has arrived.
//!
//! # Usage
//!
//! ```ignore
//! use snailwire::ipc::{NamespacePath, ReplSession};
//!
//! let session = ReplSession::connect("repl".into(), config, Hooks::default()).await?;
//! let reply = session.eval_sync(&NamespacePath::Root, "1 + 1").await?;
//! ```

mod client;
mod codec;
mod framing;

pub use client::{connect_with_retry, ReplSession, SessionError, SyncReply, TranscriptEntry};
pub use codec::{
    decode_request, decode_response, encode_request, escape_string, DecodeError, DecodedRequest,
    InvalidNamespace, MalformedRequest, NamespacePath, Outcome, Payload, RemoteFailure, Response,
    DONE_HEAD, FAILURE_HEAD, NOTHING_KEYWORD, ROOT_NAMESPACE,
};
pub use framing::{Reassembler, DEFAULT_MAX_BUFFER};
