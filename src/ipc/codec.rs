//! Wire codec for evaluation requests and interpreter responses.
//!
//! # Request (client → interpreter)
//!
//! One line per request, a record of namespace path, request id and escaped
//! source text:
//!
//! ```text
//! (ns = [:Main, :Plots], reqid = "3fa81c07", code = "plot(x)\nsavefig(\"a.png\")")\n
//! ```
//!
//! # Response (interpreter → client)
//!
//! One s-expression per message, in one of two shapes:
//!
//! ```text
//! (response-done "3fa81c07" <payload>)
//! (response-failure "3fa81c07" "UndefVarError: x not defined" ("top-level scope" "eval"))
//! ```
//!
//! A missing payload or the keyword `:nothing` means the code ran and
//! produced no value.

use std::fmt::Write as _;

use thiserror::Error;

use crate::sexp::{self, ReadError, Sexp};

/// Namespace used when no path is supplied.
pub const ROOT_NAMESPACE: &str = "Main";

/// Head symbol of a success response.
pub const DONE_HEAD: &str = "response-done";

/// Head symbol of a failure response.
pub const FAILURE_HEAD: &str = "response-failure";

/// Keyword the interpreter sends for "ran, returned nothing".
pub const NOTHING_KEYWORD: &str = ":nothing";

/// Characters that cannot appear inside a namespace token.
const FORBIDDEN_IN_NAMESPACE: &[char] = &[
    '"', '\'', '[', ']', '(', ')', ',', '=', ':', ';', '\\', '$', '.',
];

/// Evaluation context a code fragment runs in.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum NamespacePath {
    /// The interpreter's root namespace.
    #[default]
    Root,
    /// A dotted name such as `Main.Plots`.
    Qualified(String),
    /// Ordered segments; each may itself be dotted.
    Segments(Vec<String>),
}

impl NamespacePath {
    /// Flatten the path into the namespace tokens sent on the wire.
    ///
    /// An empty segment list is treated as the root namespace.
    pub fn tokens(&self) -> Result<Vec<String>, InvalidNamespace> {
        let raw: Vec<&str> = match self {
            NamespacePath::Root => vec![ROOT_NAMESPACE],
            NamespacePath::Qualified(name) => name.split('.').collect(),
            NamespacePath::Segments(segments) if segments.is_empty() => vec![ROOT_NAMESPACE],
            NamespacePath::Segments(segments) => {
                segments.iter().flat_map(|s| s.split('.')).collect()
            }
        };

        raw.into_iter()
            .map(|token| {
                if is_valid_token(token) {
                    Ok(token.to_string())
                } else {
                    Err(InvalidNamespace {
                        path: self.to_string(),
                        token: token.to_string(),
                    })
                }
            })
            .collect()
    }
}

impl std::fmt::Display for NamespacePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NamespacePath::Root => f.write_str(ROOT_NAMESPACE),
            NamespacePath::Qualified(name) => f.write_str(name),
            NamespacePath::Segments(segments) => f.write_str(&segments.join(".")),
        }
    }
}

fn is_valid_token(token: &str) -> bool {
    !token.is_empty()
        && token
            .chars()
            .all(|c| !c.is_whitespace() && !c.is_control() && !FORBIDDEN_IN_NAMESPACE.contains(&c))
}

/// A namespace path that cannot be rendered as tokens.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid namespace token {token:?} in {path:?}")]
pub struct InvalidNamespace {
    pub path: String,
    pub token: String,
}

/// Result value of a successful evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// The code ran and produced no value.
    Nothing,
    Value(Sexp),
}

impl Payload {
    pub fn value(&self) -> Option<&Sexp> {
        match self {
            Payload::Nothing => None,
            Payload::Value(v) => Some(v),
        }
    }
}

/// Error raised by the interpreter while evaluating a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFailure {
    pub message: String,
    /// Stack frame descriptions, innermost first.
    pub stack: Vec<String>,
}

impl RemoteFailure {
    pub fn new(message: impl Into<String>, stack: Vec<String>) -> Self {
        Self {
            message: message.into(),
            stack,
        }
    }
}

/// How a request ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(Payload),
    Failure(RemoteFailure),
}

/// A decoded interpreter response.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub request_id: String,
    pub outcome: Outcome,
}

impl Response {
    /// Render the response the way the interpreter sends it.
    pub fn to_wire(&self) -> String {
        let id = Sexp::string(self.request_id.as_str());
        let datum = match &self.outcome {
            Outcome::Success(Payload::Nothing) => Sexp::List(vec![
                Sexp::symbol(DONE_HEAD),
                id,
                Sexp::symbol(NOTHING_KEYWORD),
            ]),
            Outcome::Success(Payload::Value(v)) => {
                Sexp::List(vec![Sexp::symbol(DONE_HEAD), id, v.clone()])
            }
            Outcome::Failure(failure) => Sexp::List(vec![
                Sexp::symbol(FAILURE_HEAD),
                id,
                Sexp::string(failure.message.as_str()),
                Sexp::List(failure.stack.iter().map(|f| Sexp::string(f.as_str())).collect()),
            ]),
        };
        format!("{datum}\n")
    }

    fn from_datum(datum: Sexp) -> Result<Self, String> {
        let Sexp::List(items) = datum else {
            return Err(format!("expected a response list, got `{datum}`"));
        };
        let mut items = items.into_iter();
        let head = items.next();

        let outcome_head = match head.as_ref().and_then(Sexp::as_symbol) {
            Some(head) => head.to_string(),
            None => return Err("response is not headed by a symbol".to_string()),
        };

        let request_id = match items.next() {
            Some(Sexp::Str(id)) => id,
            Some(other) => return Err(format!("request id must be a string, got `{other}`")),
            None => return Err(format!("`{outcome_head}` without a request id")),
        };

        let outcome = match outcome_head.as_str() {
            DONE_HEAD => {
                let payload = match items.next() {
                    None => Payload::Nothing,
                    Some(Sexp::Symbol(s)) if s == NOTHING_KEYWORD => Payload::Nothing,
                    Some(value) => Payload::Value(value),
                };
                Outcome::Success(payload)
            }
            FAILURE_HEAD => {
                let message = match items.next() {
                    Some(Sexp::Str(message)) => message,
                    Some(other) => {
                        return Err(format!("failure message must be a string, got `{other}`"))
                    }
                    None => return Err("failure without a message".to_string()),
                };
                let stack = match items.next() {
                    None => Vec::new(),
                    Some(frames) => frames
                        .into_string_list()
                        .ok_or_else(|| "stack must be a list of strings".to_string())?,
                };
                Outcome::Failure(RemoteFailure { message, stack })
            }
            other => return Err(format!("unknown response head `{other}`")),
        };

        if let Some(extra) = items.next() {
            return Err(format!("unexpected trailing element `{extra}`"));
        }

        Ok(Self {
            request_id,
            outcome,
        })
    }
}

/// Failure to turn buffered bytes into a [`Response`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Not a complete datum yet. Nothing was consumed; wait for more bytes.
    #[error("Malformed response: {0}")]
    Malformed(String),

    /// A complete datum that matches no response shape, or bytes that can
    /// never start one (a stray `)`, runaway nesting). `consumed` bytes
    /// should be dropped.
    #[error("Protocol violation: {reason}")]
    ProtocolViolation { reason: String, consumed: usize },
}

/// Decode one response from the front of `input`.
///
/// Returns the response and the number of bytes it occupied.
pub fn decode_response(input: &[u8]) -> Result<(Response, usize), DecodeError> {
    let (datum, consumed) = sexp::read(input).map_err(|e| match e {
        ReadError::Incomplete => DecodeError::Malformed("incomplete datum".to_string()),
        ReadError::Invalid { reason, consumed } => {
            DecodeError::ProtocolViolation { reason, consumed }
        }
    })?;

    let response = Response::from_datum(datum)
        .map_err(|reason| DecodeError::ProtocolViolation { reason, consumed })?;

    Ok((response, consumed))
}

/// Encode an evaluation request as one newline-terminated line.
///
/// `namespace` is the output of [`NamespacePath::tokens`].
pub fn encode_request(namespace: &[String], request_id: &str, code: &str) -> String {
    let ns = namespace
        .iter()
        .map(|token| format!(":{token}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "(ns = [{ns}], reqid = \"{}\", code = \"{}\")\n",
        escape_string(request_id),
        escape_string(code)
    )
}

/// Escape text for use inside a double-quoted string literal.
pub fn escape_string(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 8);
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            // Interpolation marker in the interpreter's string syntax.
            '$' => out.push_str("\\$"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_ascii_control() => {
                let _ = write!(out, "\\x{:02x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// A request line as the interpreter sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRequest {
    pub namespace: Vec<String>,
    pub request_id: String,
    pub code: String,
}

/// A line that is not an encoded request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Malformed request line: {0}")]
pub struct MalformedRequest(String);

/// Inverse of [`encode_request`].
pub fn decode_request(line: &str) -> Result<DecodedRequest, MalformedRequest> {
    let malformed = |what: &str| MalformedRequest(what.to_string());
    let line = line.strip_suffix('\n').unwrap_or(line);

    let rest = line
        .strip_prefix("(ns = [")
        .ok_or_else(|| malformed("missing namespace list"))?;
    let (list, rest) = rest
        .split_once(']')
        .ok_or_else(|| malformed("unterminated namespace list"))?;
    let namespace = list
        .split(',')
        .map(|token| {
            token
                .trim()
                .strip_prefix(':')
                .map(str::to_string)
                .ok_or_else(|| malformed("namespace token without ':'"))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let rest = rest
        .strip_prefix(", reqid = ")
        .ok_or_else(|| malformed("missing reqid field"))?;
    let (request_id, rest) = take_quoted(rest).ok_or_else(|| malformed("bad reqid string"))?;

    let rest = rest
        .strip_prefix(", code = ")
        .ok_or_else(|| malformed("missing code field"))?;
    let (code, rest) = take_quoted(rest).ok_or_else(|| malformed("bad code string"))?;

    if rest != ")" {
        return Err(malformed("trailing data after record"));
    }

    Ok(DecodedRequest {
        namespace,
        request_id,
        code,
    })
}

/// Read a quoted, escaped string from the front of `input`.
fn take_quoted(input: &str) -> Option<(String, &str)> {
    let body = input.strip_prefix('"')?;
    let mut out = String::new();
    let mut chars = body.char_indices();

    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return Some((out, &body[i + 1..])),
            '\\' => {
                let (_, escaped) = chars.next()?;
                match escaped {
                    'n' => out.push('\n'),
                    'r' => out.push('\r'),
                    't' => out.push('\t'),
                    'x' => {
                        let hi = chars.next()?.1;
                        let lo = chars.next()?.1;
                        let code = u32::from_str_radix(&format!("{hi}{lo}"), 16).ok()?;
                        out.push(char::from_u32(code)?);
                    }
                    other => out.push(other),
                }
            }
            c => out.push(c),
        }
    }
    None
}
