//! # linewire-core
//!
//! Transport-independent building blocks for line-oriented connections:
//! splitting a byte stream into CRLF-terminated lines, decoding each line
//! into an application message, and dispatching messages to listeners.
//!
//! This crate has no dependencies on sockets or an async runtime.  The
//! `linewire-client` crate owns the TCP side and drives these pieces from
//! its background receive task.
//!
//! # How a message travels (for beginners)
//!
//! ```text
//! socket bytes ──► LineFramer ──► Decoder::decode ──► ListenerSet::dispatch
//!                  (one line       (bytes → message)    (accept? → receive)
//!                   at a time)
//! ```
//!
//! - **`protocol`** – the [`LineFramer`], the [`Decoder`] hook with its
//!   stock implementations, and an IRC line parser.
//! - **`dispatch`** – the [`Listener`] trait, the closure-backed
//!   [`MessageListener`], and the thread-safe [`ListenerSet`].

pub mod dispatch;
pub mod protocol;

pub use dispatch::{DispatchOutcome, Listener, ListenerSet, MessageListener, SharedListener};
pub use protocol::decode::{Decoder, RawDecoder, Utf8Decoder};
pub use protocol::framing::{terminate_line, FramingError, LineFramer, LINE_DELIMITER};
pub use protocol::irc::{IrcDecoder, IrcMessage, IrcParseError};
