//! Reassembly of interpreter responses from a chunked byte stream.
//!
//! Responses are self-delimiting s-expressions, so there is no length
//! header. The reassembler appends each chunk to a buffer and scans only the
//! new bytes, tracking list depth, strings and comments, until the datum at
//! the front is known to be complete. Only then is it handed to the reader,
//! so every byte is scanned once and parsed once however the stream is
//! split.
//!
//! # Resource exhaustion
//!
//! An unterminated string or list keeps the reassembler waiting, because it
//! cannot be told apart from a message still in flight. The buffer is
//! therefore capped: once a partial datum grows past `max_buffer` bytes it
//! is discarded and reported as a protocol violation. Nesting deeper than
//! [`MAX_DEPTH`] is reported the same way as soon as it is seen. Buffering
//! is linear in the size of the pending datum.

use tracing::trace;

use super::codec::{decode_response, DecodeError, Response};
use crate::sexp::{is_delimiter, MAX_DEPTH};

/// Default cap on buffered partial-response bytes (100MB).
pub const DEFAULT_MAX_BUFFER: usize = 100 * 1024 * 1024;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum Lexeme {
    #[default]
    Between,
    Atom,
    Str,
    StrEscape,
    Comment,
}

enum Scan {
    /// The front datum ends within the scanned bytes.
    Complete,
    TooDeep,
    Pending,
}

/// Resumable scan for the end of the datum at the front of the buffer.
#[derive(Debug, Default, Clone, Copy)]
struct Boundary {
    pos: usize,
    depth: usize,
    lexeme: Lexeme,
}

impl Boundary {
    fn advance(&mut self, buf: &[u8]) -> Scan {
        while let Some(&b) = buf.get(self.pos) {
            self.pos += 1;
            match self.lexeme {
                Lexeme::Comment => {
                    if b == b'\n' {
                        self.lexeme = Lexeme::Between;
                    }
                }
                Lexeme::StrEscape => self.lexeme = Lexeme::Str,
                Lexeme::Str => match b {
                    b'\\' => self.lexeme = Lexeme::StrEscape,
                    b'"' => {
                        self.lexeme = Lexeme::Between;
                        if self.depth == 0 {
                            return Scan::Complete;
                        }
                    }
                    _ => {}
                },
                Lexeme::Atom if !is_delimiter(b) => {}
                Lexeme::Atom if self.depth == 0 => return Scan::Complete,
                Lexeme::Atom | Lexeme::Between => {
                    self.lexeme = Lexeme::Between;
                    match b {
                        b';' => self.lexeme = Lexeme::Comment,
                        b'"' => self.lexeme = Lexeme::Str,
                        b'(' => {
                            self.depth += 1;
                            if self.depth > MAX_DEPTH {
                                return Scan::TooDeep;
                            }
                        }
                        // At depth 0 this is a stray paren; the reader reports it.
                        b')' if self.depth <= 1 => return Scan::Complete,
                        b')' => self.depth -= 1,
                        b if b.is_ascii_whitespace() => {}
                        _ => self.lexeme = Lexeme::Atom,
                    }
                }
            }
        }
        Scan::Pending
    }

    /// Nothing but whitespace and finished comments scanned so far.
    fn is_idle(&self) -> bool {
        self.depth == 0 && self.lexeme == Lexeme::Between
    }
}

/// Per-connection accumulation buffer.
#[derive(Debug)]
pub struct Reassembler {
    buffer: Vec<u8>,
    max_buffer: usize,
    boundary: Boundary,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reassembler {
    pub fn new() -> Self {
        Self::with_max_buffer(DEFAULT_MAX_BUFFER)
    }

    /// Reassembler that gives up on a partial datum past `max_buffer` bytes.
    pub fn with_max_buffer(max_buffer: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_buffer,
            boundary: Boundary::default(),
        }
    }

    /// Append a chunk and extract every response it completes, in order.
    ///
    /// Only [`DecodeError::ProtocolViolation`] appears in the output;
    /// incomplete data simply stays buffered.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<Response, DecodeError>> {
        self.buffer.extend_from_slice(chunk);

        let mut decoded = Vec::new();
        loop {
            match self.boundary.advance(&self.buffer) {
                Scan::Complete => match decode_response(&self.buffer) {
                    Ok((response, consumed)) => {
                        self.consume(consumed);
                        decoded.push(Ok(response));
                    }
                    Err(DecodeError::ProtocolViolation { reason, consumed }) => {
                        self.consume(consumed);
                        decoded.push(Err(DecodeError::ProtocolViolation { reason, consumed }));
                    }
                    Err(DecodeError::Malformed(reason)) => {
                        // Scanner and reader disagree; wait for more bytes.
                        trace!("datum not readable yet: {reason}");
                        break;
                    }
                },
                Scan::TooDeep => {
                    decoded.push(Err(self.discard(format!(
                        "lists nested deeper than {MAX_DEPTH}"
                    ))));
                }
                Scan::Pending => {
                    if self.boundary.is_idle() {
                        let idle = self.boundary.pos;
                        self.consume(idle);
                    } else if self.buffer.len() > self.max_buffer {
                        let reason = format!("partial response exceeded {} bytes", self.max_buffer);
                        decoded.push(Err(self.discard(reason)));
                    } else {
                        trace!("waiting for more bytes ({} buffered)", self.buffer.len());
                    }
                    break;
                }
            }
        }
        decoded
    }

    /// Drop the first `count` bytes plus any whitespace after them, and
    /// restart the scan.
    fn consume(&mut self, count: usize) {
        let count = count.min(self.buffer.len());
        let idle = self.buffer[count..]
            .iter()
            .take_while(|b| b.is_ascii_whitespace())
            .count();
        self.buffer.drain(..count + idle);
        self.boundary = Boundary::default();
    }

    fn discard(&mut self, reason: String) -> DecodeError {
        let consumed = self.buffer.len();
        self.consume(consumed);
        DecodeError::ProtocolViolation { reason, consumed }
    }

    /// Number of buffered bytes not yet parsed.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Drop any partial response.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.boundary = Boundary::default();
    }
}
