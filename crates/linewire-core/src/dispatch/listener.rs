//! The [`Listener`] observer contract and its closure-backed implementation.
//!
//! Dispatch is a two-step handshake:
//!
//! 1. the connection asks [`Listener::accept`] whether the message is wanted;
//! 2. only when that returns `true` does it call [`Listener::receive`],
//!    exactly once for that message.
//!
//! Splitting the cheap filter from the handler lets one listener ignore most
//! traffic without paying for its full handling logic.

use std::fmt;
use std::sync::Arc;

/// An observer registered with a connection.
///
/// Both methods are called from the connection's background receive task,
/// never concurrently for the same message.  A slow `receive` delays every
/// later message on that connection, so long-running work should be handed
/// off to another task.
pub trait Listener<M>: Send + Sync {
    /// Returns true if this listener wants `message`.
    fn accept(&self, message: &M) -> bool;

    /// Handles a message previously accepted by [`Listener::accept`].
    fn receive(&self, message: &M);
}

type AcceptFn<M> = Box<dyn Fn(&M) -> bool + Send + Sync>;
type ReceiveFn<M> = Box<dyn Fn(&M) + Send + Sync>;

/// A [`Listener`] built from two closures.
///
/// # Example
///
/// ```rust
/// use linewire_core::dispatch::{Listener, MessageListener};
///
/// let pings = MessageListener::new(
///     |line: &String| line.starts_with("PING"),
///     |line: &String| println!("got {line}"),
/// );
/// assert!(pings.accept(&"PING :x".to_string()));
/// assert!(!pings.accept(&"NOTICE".to_string()));
/// ```
pub struct MessageListener<M> {
    accept: AcceptFn<M>,
    receive: ReceiveFn<M>,
}

impl<M> MessageListener<M> {
    /// Creates a listener from a filter predicate and a handler.
    pub fn new<A, R>(accept: A, receive: R) -> Self
    where
        A: Fn(&M) -> bool + Send + Sync + 'static,
        R: Fn(&M) + Send + Sync + 'static,
    {
        Self {
            accept: Box::new(accept),
            receive: Box::new(receive),
        }
    }

    /// Creates a listener without a filter: every message is accepted.
    pub fn accept_all<R>(receive: R) -> Self
    where
        R: Fn(&M) + Send + Sync + 'static,
    {
        Self::new(|_| true, receive)
    }

    /// Wraps the listener in an `Arc`, ready for `add_listener`.
    ///
    /// Keep a clone of the returned `Arc` to remove the listener later:
    /// membership is by identity, not by value.
    pub fn shared(self) -> Arc<dyn Listener<M>>
    where
        M: 'static,
    {
        Arc::new(self)
    }
}

impl<M> Listener<M> for MessageListener<M> {
    fn accept(&self, message: &M) -> bool {
        (self.accept)(message)
    }

    fn receive(&self, message: &M) {
        (self.receive)(message)
    }
}

impl<M> fmt::Debug for MessageListener<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageListener").finish_non_exhaustive()
    }
}
