//! Listener contract and the registry connections dispatch through.

pub mod listener;
pub mod registry;

pub use listener::{Listener, MessageListener};
pub use registry::{DispatchOutcome, ListenerSet, SharedListener};
