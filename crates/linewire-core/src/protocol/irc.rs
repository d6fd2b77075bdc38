//! IRC line decoder.
//!
//! IRC is the canonical CRLF line protocol, so a ready-made [`Decoder`] for
//! it is provided.  Only the line grammar is handled here; command semantics
//! belong to the application.
//!
//! ```text
//! [":" prefix " "] command {" " param} [" :" trailing]
//! ```
//!
//! Example: `:nick!user@host PRIVMSG #rust :hello there` parses into
//! prefix `nick!user@host`, command `PRIVMSG`, params `["#rust", "hello there"]`.

use std::fmt;

use thiserror::Error;

use crate::protocol::decode::Decoder;

/// Errors that can occur while parsing an IRC line.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IrcParseError {
    /// The line contained nothing but whitespace.
    #[error("cannot parse an empty IRC line")]
    Empty,

    /// The line had a prefix but no command after it.
    #[error("IRC line has no command: {0:?}")]
    MissingCommand(String),
}

/// A single parsed IRC line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrcMessage {
    /// The line as received, without the delimiter.
    pub raw: String,
    /// Message origin, without the leading `:`.
    pub prefix: Option<String>,
    /// Command word or three-digit numeric reply.
    pub command: String,
    /// Middle parameters followed by the trailing parameter, if any.
    pub params: Vec<String>,
}

impl IrcMessage {
    /// Parses one IRC line.
    ///
    /// # Errors
    ///
    /// Returns [`IrcParseError::Empty`] for blank input and
    /// [`IrcParseError::MissingCommand`] when only a prefix is present.
    pub fn parse(line: &str) -> Result<Self, IrcParseError> {
        if line.trim().is_empty() {
            return Err(IrcParseError::Empty);
        }

        let (prefix, rest) = match line.strip_prefix(':') {
            Some(stripped) => match stripped.split_once(' ') {
                Some((prefix, rest)) => (Some(prefix.to_string()), rest),
                None => return Err(IrcParseError::MissingCommand(line.to_string())),
            },
            None => (None, line),
        };

        let (middle, trailing) = match rest.split_once(" :") {
            Some((middle, trailing)) => (middle, Some(trailing)),
            None => (rest, None),
        };

        let mut words = middle.split_whitespace();
        let command = words
            .next()
            .ok_or_else(|| IrcParseError::MissingCommand(line.to_string()))?
            .to_string();
        let mut params: Vec<String> = words.map(str::to_string).collect();
        if let Some(trailing) = trailing {
            params.push(trailing.to_string());
        }

        Ok(Self {
            raw: line.to_string(),
            prefix,
            command,
            params,
        })
    }

    /// Nickname part of the prefix (`nick` in `nick!user@host`).
    pub fn nick(&self) -> Option<&str> {
        let prefix = self.prefix.as_deref()?;
        Some(prefix.split_once('!').map_or(prefix, |(nick, _)| nick))
    }

    /// Returns true for a server `PING`.
    pub fn is_ping(&self) -> bool {
        self.command.eq_ignore_ascii_case("PING")
    }

    /// The token a `PONG` reply must echo, when this is a `PING`.
    pub fn ping_token(&self) -> Option<&str> {
        if self.is_ping() {
            self.params.first().map(String::as_str)
        } else {
            None
        }
    }
}

impl fmt::Display for IrcMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// [`Decoder`] producing [`IrcMessage`]s.  Invalid UTF-8 is replaced lossily.
#[derive(Debug, Clone, Copy, Default)]
pub struct IrcDecoder;

impl Decoder for IrcDecoder {
    type Message = IrcMessage;
    type Error = IrcParseError;

    fn decode(&self, segment: &[u8]) -> Result<IrcMessage, IrcParseError> {
        IrcMessage::parse(&String::from_utf8_lossy(segment))
    }
}
