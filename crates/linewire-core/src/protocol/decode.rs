//! The decode hook: turning one framed line into an application message.
//!
//! The receive loop calls [`Decoder::decode`] exactly once per complete line
//! (delimiter already stripped) and hands the result to the listeners.  The
//! connection itself never looks inside the message, so any type works as
//! long as it can be shared across threads.
//!
//! Three stock decoders are provided:
//!
//! | Decoder                          | Message      | Never fails? |
//! |----------------------------------|--------------|--------------|
//! | [`RawDecoder`]                   | `Vec<u8>`    | yes          |
//! | [`Utf8Decoder`]                  | `String`     | yes (lossy)  |
//! | [`crate::protocol::irc::IrcDecoder`] | `IrcMessage` | no       |

use std::convert::Infallible;
use std::fmt;

/// Converts a raw line into a message value.
///
/// Implementations must be cheap to share: the decoder lives inside the
/// connection and is called from the background receive task.
///
/// # Example
///
/// ```rust
/// use linewire_core::protocol::decode::Decoder;
///
/// struct Upper;
///
/// impl Decoder for Upper {
///     type Message = String;
///     type Error = std::string::FromUtf8Error;
///
///     fn decode(&self, segment: &[u8]) -> Result<String, Self::Error> {
///         Ok(String::from_utf8(segment.to_vec())?.to_uppercase())
///     }
/// }
///
/// assert_eq!(Upper.decode(b"ping").unwrap(), "PING");
/// ```
pub trait Decoder: Send + Sync + 'static {
    /// The decoded message handed to listeners.
    type Message: Send + Sync + 'static;
    /// Reported (and the line skipped) when a line cannot be decoded.
    type Error: fmt::Display;

    /// Decodes one line.  `segment` never contains the `\r\n` delimiter.
    ///
    /// # Errors
    ///
    /// Returns `Self::Error` when the bytes are not a valid message.
    fn decode(&self, segment: &[u8]) -> Result<Self::Message, Self::Error>;
}

/// Identity decoder: listeners receive the raw line bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawDecoder;

impl Decoder for RawDecoder {
    type Message = Vec<u8>;
    type Error = Infallible;

    fn decode(&self, segment: &[u8]) -> Result<Vec<u8>, Infallible> {
        Ok(segment.to_vec())
    }
}

/// Decodes each line as UTF-8 text, replacing invalid sequences with U+FFFD.
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8Decoder;

impl Decoder for Utf8Decoder {
    type Message = String;
    type Error = Infallible;

    fn decode(&self, segment: &[u8]) -> Result<String, Infallible> {
        Ok(String::from_utf8_lossy(segment).into_owned())
    }
}
