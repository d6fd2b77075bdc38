//! Line framing for the CRLF-delimited wire format.
//!
//! Wire format:
//! ```text
//! <line bytes>\r\n<line bytes>\r\n...
//! ```
//! There is no length prefix.  A message ends where the two-byte delimiter
//! `\r\n` begins, and the delimiter itself is not part of the message.
//!
//! # Why a buffer is needed (for beginners)
//!
//! TCP is a *stream* protocol.  A single `read()` call may return:
//!
//! - half a line (`b"PRIVMSG #ru"`), with the rest arriving on the next read;
//! - several lines at once (`b"A\r\nB\r\nC\r\n"`);
//! - a mix of both (`b"A\r\nB\r\nC"`), and the delimiter itself can be split
//!   between reads (`b"A\r"` followed by `b"\n"`).
//!
//! [`LineFramer`] accumulates every byte it is given in a pending buffer and
//! hands out complete lines one at a time.  Whatever follows the last
//! delimiter stays buffered until a later [`LineFramer::push`] completes it.

use std::borrow::Cow;

use thiserror::Error;

/// The message delimiter used on the wire.
pub const LINE_DELIMITER: &[u8] = b"\r\n";

/// The delimiter as a string slice, for text senders.
pub const LINE_DELIMITER_STR: &str = "\r\n";

/// Default upper bound for a single line, in bytes (64 KiB).
pub const DEFAULT_MAX_LINE_LENGTH: usize = 64 * 1024;

/// Errors produced while splitting the byte stream into lines.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    /// A line grew past the configured limit.  The offending bytes have been
    /// discarded, and so will the rest of that line up to its delimiter.
    #[error("line exceeds {limit} bytes ({buffered} bytes discarded)")]
    LineTooLong { limit: usize, buffered: usize },
}

/// Splits an incoming byte stream into CRLF-terminated lines.
///
/// # Example
///
/// ```rust
/// use linewire_core::protocol::framing::LineFramer;
///
/// let mut framer = LineFramer::new();
/// framer.push(b"NICK bot\r\nUSER b");
/// assert_eq!(framer.next_line().unwrap(), Some(b"NICK bot".to_vec()));
/// assert_eq!(framer.next_line().unwrap(), None);
///
/// framer.push(b"ot 0 * :bot\r\n");
/// assert_eq!(framer.next_line().unwrap(), Some(b"USER bot 0 * :bot".to_vec()));
/// ```
#[derive(Debug, Clone)]
pub struct LineFramer {
    pending: Vec<u8>,
    /// Offset from which the next delimiter search starts.  Everything before
    /// it is known to contain no delimiter.
    scan_from: usize,
    max_line_length: usize,
    /// Set after an unterminated line overflowed: bytes are dropped until the
    /// delimiter that ends it.
    discarding: bool,
}

impl LineFramer {
    /// Creates a framer with the [`DEFAULT_MAX_LINE_LENGTH`] limit.
    pub fn new() -> Self {
        Self::with_max_line_length(DEFAULT_MAX_LINE_LENGTH)
    }

    /// Creates a framer that rejects lines longer than `max_line_length` bytes.
    ///
    /// A limit of zero is treated as one byte.
    pub fn with_max_line_length(max_line_length: usize) -> Self {
        Self {
            pending: Vec::with_capacity(4096),
            scan_from: 0,
            max_line_length: max_line_length.max(1),
            discarding: false,
        }
    }

    /// Appends freshly read bytes to the pending buffer.
    pub fn push(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
    }

    /// Removes and returns the next complete line, without its delimiter.
    ///
    /// Returns `Ok(None)` when the buffer holds no complete line yet.  Empty
    /// lines (a bare `\r\n`) are skipped rather than returned.
    ///
    /// # Errors
    ///
    /// Returns [`FramingError::LineTooLong`] when a line (complete or still
    /// pending) exceeds the limit.  The oversized bytes are dropped before
    /// the error is returned, so calling `next_line` again is always safe.
    /// A line that overflows before its delimiter arrives is reported once;
    /// its remaining bytes are dropped silently as they come in.
    pub fn next_line(&mut self) -> Result<Option<Vec<u8>>, FramingError> {
        loop {
            let Some(end) = find_delimiter(&self.pending, self.scan_from) else {
                if self.discarding {
                    self.drop_unterminated();
                    return Ok(None);
                }
                if self.pending.len() > self.max_line_length {
                    let buffered = self.drop_unterminated();
                    self.discarding = true;
                    return Err(FramingError::LineTooLong {
                        limit: self.max_line_length,
                        buffered,
                    });
                }
                // The last byte may be the `\r` of a delimiter split across reads.
                self.scan_from = self.pending.len().saturating_sub(LINE_DELIMITER.len() - 1);
                return Ok(None);
            };

            let mut line: Vec<u8> = self.pending.drain(..end + LINE_DELIMITER.len()).collect();
            line.truncate(end);
            self.scan_from = 0;

            if self.discarding {
                // Tail of a line already reported as too long.
                self.discarding = false;
                continue;
            }
            if line.len() > self.max_line_length {
                return Err(FramingError::LineTooLong {
                    limit: self.max_line_length,
                    buffered: line.len(),
                });
            }
            if !line.is_empty() {
                return Ok(Some(line));
            }
        }
    }

    /// Number of bytes waiting for a delimiter.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Discards all buffered bytes and any partially discarded line.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.scan_from = 0;
        self.discarding = false;
    }

    /// Drops the pending bytes of an unterminated line and returns how many
    /// were dropped.  A trailing `\r` is kept, since it may start the
    /// delimiter that ends the line.
    fn drop_unterminated(&mut self) -> usize {
        let keep = usize::from(self.pending.last() == Some(&b'\r'));
        let dropped = self.pending.len() - keep;
        self.pending.drain(..dropped);
        self.scan_from = 0;
        dropped
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns `message` with a trailing `\r\n`, borrowing when it already has one.
///
/// ```rust
/// use linewire_core::protocol::framing::terminate_line;
///
/// assert_eq!(terminate_line("PING"), "PING\r\n");
/// assert_eq!(terminate_line("PING\r\n"), "PING\r\n");
/// ```
pub fn terminate_line(message: &str) -> Cow<'_, str> {
    if message.ends_with(LINE_DELIMITER_STR) {
        Cow::Borrowed(message)
    } else {
        Cow::Owned(format!("{message}{LINE_DELIMITER_STR}"))
    }
}

fn find_delimiter(haystack: &[u8], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(LINE_DELIMITER.len())
        .position(|window| window == LINE_DELIMITER)
        .map(|pos| pos + from)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
