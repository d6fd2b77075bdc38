//! Protocol module containing the line framer and the decode hook.

pub mod decode;
pub mod framing;
pub mod irc;

pub use decode::{Decoder, RawDecoder, Utf8Decoder};
pub use framing::{terminate_line, FramingError, LineFramer, LINE_DELIMITER};
pub use irc::{IrcDecoder, IrcMessage, IrcParseError};
