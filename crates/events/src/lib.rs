//! Event contract and the self-describing envelope events are persisted in.

pub mod envelope;
pub mod event;

pub use envelope::{EnvelopeError, EventEnvelope};
pub use event::Event;
