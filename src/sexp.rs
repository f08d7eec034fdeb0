//! S-expression values carried by interpreter responses.
//!
//! The interpreter answers with Lisp-style data: lists, strings, numbers and
//! symbols. [`read`] parses a single datum from the front of a byte buffer
//! and reports how many bytes it consumed, so a caller accumulating a stream
//! can keep the remainder for the next message.
//!
//! # Grammar
//!
//! ```text
//! datum   := list | string | atom
//! list    := '(' datum* ')'
//! string  := '"' (char | '\' escape)* '"'
//! atom    := integer | float | symbol        ; ends at a delimiter
//! ```
//!
//! Whitespace and `;` line comments may appear between data.
//!
//! An atom is only complete once a delimiter follows it: `42` at the very end
//! of the buffer could still be the prefix of `421`, so the reader reports
//! [`ReadError::Incomplete`] rather than guessing.
//!
//! Lists are read with an explicit stack and nesting is capped at
//! [`MAX_DEPTH`], so hostile input cannot exhaust the call stack.

use std::fmt;

use serde::Serialize;

/// A single parsed datum.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Sexp {
    Int(i64),
    Float(f64),
    Str(String),
    /// Bare symbol, including keywords such as `:nothing` and `nil`.
    Symbol(String),
    List(Vec<Sexp>),
}

impl Sexp {
    /// Build a symbol datum.
    pub fn symbol(name: impl Into<String>) -> Self {
        Sexp::Symbol(name.into())
    }

    /// Build a string datum.
    pub fn string(text: impl Into<String>) -> Self {
        Sexp::Str(text.into())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Sexp::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_symbol(&self) -> Option<&str> {
        match self {
            Sexp::Symbol(s) => Some(s),
            _ => None,
        }
    }

    /// `nil` is the empty list.
    pub fn is_nil(&self) -> bool {
        match self {
            Sexp::Symbol(s) => s == "nil",
            Sexp::List(items) => items.is_empty(),
            _ => false,
        }
    }

    /// View the datum as list elements (`nil` counts as an empty list).
    pub fn as_list(&self) -> Option<&[Sexp]> {
        match self {
            Sexp::List(items) => Some(items),
            Sexp::Symbol(s) if s == "nil" => Some(&[]),
            _ => None,
        }
    }

    /// Convert a list of strings or symbols into owned names.
    ///
    /// Returns `None` if the datum is not a list or any element is not a
    /// string or symbol.
    pub fn into_string_list(self) -> Option<Vec<String>> {
        match self {
            Sexp::List(items) => items
                .into_iter()
                .map(|item| match item {
                    Sexp::Str(s) | Sexp::Symbol(s) => Some(s),
                    _ => None,
                })
                .collect(),
            Sexp::Symbol(s) if s == "nil" => Some(Vec::new()),
            _ => None,
        }
    }
}

impl fmt::Display for Sexp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sexp::Int(i) => write!(f, "{i}"),
            // Debug keeps the decimal point so the value reads back as a float.
            Sexp::Float(x) => write!(f, "{x:?}"),
            Sexp::Symbol(s) => f.write_str(s),
            Sexp::Str(s) => {
                f.write_str("\"")?;
                for c in s.chars() {
                    match c {
                        '"' => f.write_str("\\\"")?,
                        '\\' => f.write_str("\\\\")?,
                        '\n' => f.write_str("\\n")?,
                        '\t' => f.write_str("\\t")?,
                        '\r' => f.write_str("\\r")?,
                        c => write!(f, "{c}")?,
                    }
                }
                f.write_str("\"")
            }
            Sexp::List(items) => {
                f.write_str("(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str(")")
            }
        }
    }
}

/// Deepest list nesting the reader accepts.
pub const MAX_DEPTH: usize = 512;

/// Why [`read`] could not produce a datum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadError {
    /// The input ends before the datum does.
    Incomplete,
    /// The input cannot be read as a datum at this position. Skipping the
    /// first `consumed` bytes resynchronizes the stream.
    Invalid { reason: String, consumed: usize },
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadError::Incomplete => f.write_str("input ends inside a datum"),
            ReadError::Invalid { reason, .. } => f.write_str(reason),
        }
    }
}

/// Read one datum from the front of `input`.
///
/// On success returns the datum and the number of bytes consumed, including
/// any whitespace or comments in front of it. Strings and atoms that are not
/// valid UTF-8 are decoded lossily. Lists nested deeper than [`MAX_DEPTH`]
/// are rejected without recursing.
pub fn read(input: &[u8]) -> Result<(Sexp, usize), ReadError> {
    let mut reader = Reader { input, pos: 0 };
    let datum = reader.datum()?;
    Ok((datum, reader.pos))
}

/// Bytes that end an atom.
pub(crate) fn is_delimiter(b: u8) -> bool {
    b.is_ascii_whitespace() || matches!(b, b'(' | b')' | b'"' | b';')
}

struct Reader<'a> {
    input: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    /// Skip whitespace and `;` comments.
    fn skip_atmosphere(&mut self) {
        while let Some(b) = self.peek() {
            if b == b';' {
                while let Some(c) = self.peek() {
                    if c == b'\n' {
                        break;
                    }
                    self.pos += 1;
                }
            } else if b.is_ascii_whitespace() {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn datum(&mut self) -> Result<Sexp, ReadError> {
        // Lists still open, innermost last.
        let mut open: Vec<Vec<Sexp>> = Vec::new();
        loop {
            self.skip_atmosphere();
            let value = match self.peek().ok_or(ReadError::Incomplete)? {
                b'(' => {
                    if open.len() >= MAX_DEPTH {
                        return Err(ReadError::Invalid {
                            reason: format!("lists nested deeper than {MAX_DEPTH}"),
                            consumed: self.input.len(),
                        });
                    }
                    self.pos += 1;
                    open.push(Vec::new());
                    continue;
                }
                b')' => match open.pop() {
                    Some(items) => {
                        self.pos += 1;
                        Sexp::List(items)
                    }
                    None => return Err(self.stray_close()),
                },
                b'"' => {
                    self.pos += 1;
                    self.string()?
                }
                _ => self.atom()?,
            };
            match open.last_mut() {
                Some(items) => items.push(value),
                None => return Ok(value),
            }
        }
    }

    /// A run of `)` with nothing open.
    fn stray_close(&mut self) -> ReadError {
        let start = self.pos;
        while self.peek() == Some(b')') {
            self.pos += 1;
        }
        ReadError::Invalid {
            reason: format!("unexpected ')' at byte {start}"),
            consumed: self.pos,
        }
    }

    fn string(&mut self) -> Result<Sexp, ReadError> {
        // Collect raw bytes so a multi-byte character split across chunks
        // is only decoded once the closing quote has arrived.
        let mut bytes = Vec::new();
        loop {
            let b = self.peek().ok_or(ReadError::Incomplete)?;
            self.pos += 1;
            match b {
                b'"' => break,
                b'\\' => {
                    let escaped = self.peek().ok_or(ReadError::Incomplete)?;
                    self.pos += 1;
                    match escaped {
                        b'n' => bytes.push(b'\n'),
                        b't' => bytes.push(b'\t'),
                        b'r' => bytes.push(b'\r'),
                        // Escaped newline is a line continuation.
                        b'\n' => {}
                        other => bytes.push(other),
                    }
                }
                other => bytes.push(other),
            }
        }
        Ok(Sexp::Str(into_text(bytes)))
    }

    fn atom(&mut self) -> Result<Sexp, ReadError> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if is_delimiter(b) {
                break;
            }
            self.pos += 1;
        }
        if self.pos == self.input.len() {
            return Err(ReadError::Incomplete);
        }
        let text = String::from_utf8_lossy(&self.input[start..self.pos]);
        Ok(parse_atom(&text))
    }
}

/// Decode text, replacing invalid UTF-8 with U+FFFD.
fn into_text(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}

fn parse_atom(text: &str) -> Sexp {
    if let Ok(i) = text.parse::<i64>() {
        return Sexp::Int(i);
    }
    // Only treat numeric-looking text as a float; `nan` and `inf` stay symbols.
    let unsigned = text.strip_prefix(&['-', '+'][..]).unwrap_or(text);
    let numeric = unsigned
        .strip_prefix('.')
        .unwrap_or(unsigned)
        .starts_with(|c: char| c.is_ascii_digit());
    if numeric {
        if let Ok(x) = text.parse::<f64>() {
            return Sexp::Float(x);
        }
    }
    Sexp::Symbol(text.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn read_str(input: &str) -> Result<(Sexp, usize), ReadError> {
        read(input.as_bytes())
    }

    #[test]
    fn test_read_nested_list() {
        let (datum, consumed) = read_str(r#"(done "ab" (1 2.5 foo))"#).unwrap();
        assert_eq!(
            datum,
            Sexp::List(vec![
                Sexp::symbol("done"),
                Sexp::string("ab"),
                Sexp::List(vec![Sexp::Int(1), Sexp::Float(2.5), Sexp::symbol("foo")]),
            ])
        );
        assert_eq!(consumed, 23);
    }

    #[test]
    fn test_read_string_escapes() {
        let (datum, _) = read_str(r#""a\"b\\c\nd" "#).unwrap();
        assert_eq!(datum, Sexp::string("a\"b\\c\nd"));
    }

    #[test]
    fn test_consumed_stops_after_datum() {
        let input = "(a) (b)";
        let (datum, consumed) = read_str(input).unwrap();
        assert_eq!(datum, Sexp::List(vec![Sexp::symbol("a")]));
        assert_eq!(&input[consumed..], " (b)");
    }

    #[test]
    fn test_leading_whitespace_and_comments_are_consumed() {
        let (datum, consumed) = read_str("  ; greeting\n  (x)").unwrap();
        assert_eq!(datum, Sexp::List(vec![Sexp::symbol("x")]));
        assert_eq!(consumed, 18);
    }

    #[test]
    fn test_truncated_inputs_are_incomplete() {
        for input in ["", "   ", "(a b", "(a \"unterminated", "\"abc\\", "(x (y)", "42"] {
            assert_eq!(read_str(input), Err(ReadError::Incomplete), "input: {input:?}");
        }
    }

    #[test]
    fn test_stray_close_parens_are_skipped_together() {
        match read_str(" ))) (a)") {
            Err(ReadError::Invalid { consumed, .. }) => assert_eq!(consumed, 4),
            other => panic!("Expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn test_deep_nesting_is_rejected_without_overflow() {
        let input = vec![b'('; 200_000];
        match read(&input) {
            Err(ReadError::Invalid { consumed, .. }) => assert_eq!(consumed, input.len()),
            other => panic!("Expected Invalid, got {other:?}"),
        }

        let mut nested = "(".repeat(MAX_DEPTH);
        nested.push_str(&")".repeat(MAX_DEPTH));
        let (_, consumed) = read_str(&nested).unwrap();
        assert_eq!(consumed, nested.len());
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let (datum, consumed) = read(b"(\"a\xffb\" sym\xfe)").unwrap();
        assert_eq!(
            datum,
            Sexp::List(vec![Sexp::string("a\u{fffd}b"), Sexp::symbol("sym\u{fffd}")])
        );
        assert_eq!(consumed, 12);
    }

    #[test]
    fn test_split_utf8_string_waits_for_rest() {
        let full = "(\"héllo\")".as_bytes();
        // Cut inside the two-byte 'é'.
        let cut = full.iter().position(|&b| b == 0xC3).unwrap() + 1;
        assert_eq!(read(&full[..cut]), Err(ReadError::Incomplete));
        assert_eq!(
            read(full).unwrap().0,
            Sexp::List(vec![Sexp::string("héllo")])
        );
    }

    #[test]
    fn test_atoms() {
        assert_eq!(parse_atom("-17"), Sexp::Int(-17));
        assert_eq!(parse_atom("1e3"), Sexp::Float(1000.0));
        assert_eq!(parse_atom(".5"), Sexp::Float(0.5));
        assert_eq!(parse_atom("nan"), Sexp::symbol("nan"));
        assert_eq!(parse_atom(":nothing"), Sexp::symbol(":nothing"));
    }

    #[test]
    fn test_display_reads_back() {
        let datum = Sexp::List(vec![
            Sexp::symbol("response-done"),
            Sexp::string("line one\nsaid \"hi\" \\o/"),
            Sexp::Float(3.0),
            Sexp::Int(-2),
        ]);
        let printed = format!("{datum} ");
        assert_eq!(read_str(&printed).unwrap().0, datum);
    }

    #[test]
    fn test_string_list_conversion() {
        let list = Sexp::List(vec![Sexp::string("sin"), Sexp::symbol("cos")]);
        assert_eq!(
            list.into_string_list(),
            Some(vec!["sin".to_string(), "cos".to_string()])
        );
        assert_eq!(Sexp::symbol("nil").into_string_list(), Some(Vec::new()));
        assert_eq!(Sexp::List(vec![Sexp::Int(1)]).into_string_list(), None);
        assert!(Sexp::symbol("nil").is_nil());
    }
}
