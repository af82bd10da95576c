//! Incremental JSON value framing.
//!
//! A WebSocket text frame is not guaranteed to hold exactly one JSON value:
//! Home Assistant may coalesce several messages into one frame, and a large
//! reply (e.g. `get_states`) may arrive split across several reads.
//! [`JsonStream`] accepts arbitrary byte chunks and yields every complete
//! top-level value in arrival order, finding boundaries from JSON syntax
//! alone:
//!
//! - objects and arrays end when their brackets balance (brackets inside
//!   strings and escape sequences do not count)
//! - a top-level string ends at its closing quote
//! - a top-level literal (number, `true`, `false`, `null`) ends at the next
//!   whitespace or structural byte, so `12` followed later by `3` is `123`
//!
//! Each delimited slice is then validated and materialised by `serde_json`.

use serde_json::Value;
use thiserror::Error;

/// Default cap on bytes buffered for a single incomplete value.
pub const DEFAULT_MAX_BUFFER: usize = 64 * 1024 * 1024;

/// Framing failures.
#[derive(Error, Debug)]
pub enum FrameError {
    /// A delimited value is not valid JSON.
    #[error("invalid JSON value: {0}")]
    Syntax(#[from] serde_json::Error),

    /// A byte that cannot start a value appeared between values.
    #[error("unexpected byte 0x{byte:02x} between values")]
    UnexpectedByte { byte: u8 },

    /// A single value grew past the buffer limit.
    #[error("incomplete value exceeds {limit} bytes")]
    Overflow { limit: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scan {
    Between,
    Container {
        depth: usize,
        in_string: bool,
        escaped: bool,
    },
    String {
        escaped: bool,
    },
    Literal,
}

/// Push-based JSON value splitter. See the module docs.
#[derive(Debug)]
pub struct JsonStream {
    buf: Vec<u8>,
    /// First byte not yet handed out (or skipped as whitespace).
    head: usize,
    /// Next byte to scan.
    cursor: usize,
    /// First byte of the value being scanned.
    start: usize,
    scan: Scan,
    max_buffer: usize,
}

impl JsonStream {
    pub fn new() -> Self {
        Self::with_max_buffer(DEFAULT_MAX_BUFFER)
    }

    pub fn with_max_buffer(max_buffer: usize) -> Self {
        Self {
            buf: Vec::new(),
            head: 0,
            cursor: 0,
            start: 0,
            scan: Scan::Between,
            max_buffer,
        }
    }

    /// Append a chunk of transport bytes.
    pub fn feed(&mut self, chunk: &[u8]) {
        if self.head > 0 {
            self.buf.drain(..self.head);
            self.cursor -= self.head;
            self.start = self.start.saturating_sub(self.head);
            self.head = 0;
        }
        self.buf.extend_from_slice(chunk);
    }

    /// Number of buffered bytes not yet returned as a value.
    pub fn pending_bytes(&self) -> usize {
        self.buf.len() - self.head
    }

    /// Next complete value, or `None` until more bytes are fed.
    pub fn next_value(&mut self) -> Option<Result<Value, FrameError>> {
        while self.cursor < self.buf.len() {
            let byte = self.buf[self.cursor];

            match self.scan {
                Scan::Between => match byte {
                    b' ' | b'\t' | b'\n' | b'\r' => {
                        self.cursor += 1;
                        self.head = self.cursor;
                    }
                    b'{' | b'[' => self.begin(Scan::Container {
                        depth: 1,
                        in_string: false,
                        escaped: false,
                    }),
                    b'"' => self.begin(Scan::String { escaped: false }),
                    b'}' | b']' | b',' | b':' => {
                        self.cursor += 1;
                        self.head = self.cursor;
                        return Some(Err(FrameError::UnexpectedByte { byte }));
                    }
                    _ => self.begin(Scan::Literal),
                },

                Scan::Container {
                    depth,
                    in_string: true,
                    escaped,
                } => {
                    self.cursor += 1;
                    let (in_string, escaped) = match byte {
                        _ if escaped => (true, false),
                        b'\\' => (true, true),
                        b'"' => (false, false),
                        _ => continue,
                    };
                    self.scan = Scan::Container {
                        depth,
                        in_string,
                        escaped,
                    };
                }

                Scan::Container { depth, .. } => {
                    self.cursor += 1;
                    let (depth, in_string) = match byte {
                        b'"' => (depth, true),
                        b'{' | b'[' => (depth + 1, false),
                        b'}' | b']' if depth == 1 => return Some(self.complete(self.cursor)),
                        b'}' | b']' => (depth - 1, false),
                        _ => continue,
                    };
                    self.scan = Scan::Container {
                        depth,
                        in_string,
                        escaped: false,
                    };
                }

                Scan::String { escaped } => {
                    self.cursor += 1;
                    match byte {
                        _ if escaped => self.scan = Scan::String { escaped: false },
                        b'\\' => self.scan = Scan::String { escaped: true },
                        b'"' => return Some(self.complete(self.cursor)),
                        _ => {}
                    }
                }

                Scan::Literal => {
                    if is_delimiter(byte) {
                        // The delimiter belongs to whatever comes next.
                        return Some(self.complete(self.cursor));
                    }
                    self.cursor += 1;
                }
            }
        }

        if self.pending_bytes() > self.max_buffer {
            self.close();
            return Some(Err(FrameError::Overflow {
                limit: self.max_buffer,
            }));
        }

        None
    }

    /// Discard any partial value. Returns the number of bytes dropped.
    ///
    /// Closing is not a framing error: the transport ended, so whatever was
    /// in flight is simply gone.
    pub fn close(&mut self) -> usize {
        let discarded = self.pending_bytes();
        self.buf.clear();
        self.head = 0;
        self.cursor = 0;
        self.start = 0;
        self.scan = Scan::Between;
        discarded
    }

    fn begin(&mut self, scan: Scan) {
        self.start = self.cursor;
        self.cursor += 1;
        self.scan = scan;
    }

    fn complete(&mut self, end: usize) -> Result<Value, FrameError> {
        let result = serde_json::from_slice(&self.buf[self.start..end]).map_err(FrameError::from);
        self.scan = Scan::Between;
        self.cursor = end;
        self.head = end;
        result
    }
}

impl Default for JsonStream {
    fn default() -> Self {
        Self::new()
    }
}

impl Iterator for JsonStream {
    type Item = Result<Value, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_value()
    }
}

fn is_delimiter(byte: u8) -> bool {
    matches!(
        byte,
        b' ' | b'\t' | b'\n' | b'\r' | b'{' | b'}' | b'[' | b']' | b'"' | b',' | b':'
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn drain(stream: &mut JsonStream) -> Vec<Value> {
        stream.map(|v| v.unwrap()).collect()
    }

    #[test]
    fn yields_nothing_for_empty_input() {
        let mut stream = JsonStream::new();
        stream.feed(b"");
        assert!(stream.next_value().is_none());
        stream.feed(b"  \n\t ");
        assert!(stream.next_value().is_none());
        assert_eq!(stream.pending_bytes(), 0);
    }

    #[test]
    fn splits_concatenated_values() {
        let mut stream = JsonStream::new();
        stream.feed(br#"{"type":"auth_ok"}{"id":1,"type":"result"}[1,2]"#);

        assert_eq!(
            drain(&mut stream),
            vec![
                json!({"type": "auth_ok"}),
                json!({"id": 1, "type": "result"}),
                json!([1, 2]),
            ]
        );
    }

    #[test]
    fn joins_value_split_across_chunks() {
        let mut stream = JsonStream::new();
        stream.feed(br#"{"type":"ev"#);
        assert!(stream.next_value().is_none());
        stream.feed(br#"ent","event":{"data":{}}"#);
        assert!(stream.next_value().is_none());
        stream.feed(b"}");

        assert_eq!(
            drain(&mut stream),
            vec![json!({"type": "event", "event": {"data": {}}})]
        );
    }

    #[test]
    fn brackets_inside_strings_do_not_count() {
        let mut stream = JsonStream::new();
        stream.feed(br#"{"s":"}{][\"\\"}{"t":1}"#);

        assert_eq!(
            drain(&mut stream),
            vec![json!({"s": "}{][\"\\"}), json!({"t": 1})]
        );
    }

    #[test]
    fn escape_split_across_chunks() {
        let mut stream = JsonStream::new();
        stream.feed(br#"{"s":"a\"#);
        assert!(stream.next_value().is_none());
        stream.feed(br#""}"}"#);
        assert_eq!(drain(&mut stream), vec![json!({"s": "a\"}"})]);
    }

    #[test]
    fn top_level_literal_waits_for_delimiter() {
        let mut stream = JsonStream::new();
        stream.feed(b"12");
        assert!(stream.next_value().is_none());
        stream.feed(b"3 true");
        assert_eq!(stream.next_value().unwrap().unwrap(), json!(123));
        assert!(stream.next_value().is_none());
        stream.feed(b"\n\"x\"null{}");
        assert_eq!(
            drain(&mut stream),
            vec![json!(true), json!("x"), json!(null), json!({})]
        );
    }

    #[test]
    fn close_discards_partial_value() {
        let mut stream = JsonStream::new();
        stream.feed(br#"{"a":1}{"b":"#);
        assert_eq!(stream.next_value().unwrap().unwrap(), json!({"a": 1}));
        assert!(stream.next_value().is_none());

        assert_eq!(stream.close(), 5);
        assert!(stream.next_value().is_none());

        stream.feed(br#"{"c":3}"#);
        assert_eq!(drain(&mut stream), vec![json!({"c": 3})]);
    }

    #[test]
    fn stray_closing_bracket_is_rejected() {
        let mut stream = JsonStream::new();
        stream.feed(br#"} {"ok":true}"#);

        assert!(matches!(
            stream.next_value(),
            Some(Err(FrameError::UnexpectedByte { byte: b'}' }))
        ));
        assert_eq!(stream.next_value().unwrap().unwrap(), json!({"ok": true}));
    }

    #[test]
    fn invalid_json_is_a_syntax_error() {
        let mut stream = JsonStream::new();
        stream.feed(br#"{"a" 1} nope "#);

        assert!(matches!(stream.next_value(), Some(Err(FrameError::Syntax(_)))));
        assert!(matches!(stream.next_value(), Some(Err(FrameError::Syntax(_)))));
        assert!(stream.next_value().is_none());
    }

    #[test]
    fn oversized_value_overflows() {
        let mut stream = JsonStream::with_max_buffer(16);
        stream.feed(br#"{"key":"0123456789abcdef"#);

        assert!(matches!(
            stream.next_value(),
            Some(Err(FrameError::Overflow { limit: 16 }))
        ));
        assert_eq!(stream.pending_bytes(), 0);
    }

    #[test]
    fn compacts_consumed_bytes_on_feed() {
        let mut stream = JsonStream::new();
        stream.feed(br#"{"a":1}{"b""#);
        assert!(stream.next_value().is_some());
        assert!(stream.next_value().is_none());

        stream.feed(br#":2}"#);
        assert_eq!(stream.buf.len(), 7);
        assert_eq!(drain(&mut stream), vec![json!({"b": 2})]);
    }
}
