use chrono::{DateTime, Utc};

/// A fact recorded in an aggregate's stream.
///
/// The type key and schema version travel with the payload in the
/// [`EventEnvelope`](crate::EventEnvelope), so a stored event can be routed and
/// upcast without knowing its Rust type. Keys are dotted and namespaced by the
/// aggregate category, e.g. `"workflow.job.retry_scheduled"`.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    fn event_type(&self) -> &'static str;

    /// Bumped whenever the payload shape of this event type changes.
    fn version(&self) -> u32;

    /// Business time of the transition, not the time it was persisted.
    fn occurred_at(&self) -> DateTime<Utc>;
}
