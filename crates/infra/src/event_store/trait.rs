use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use sagaflow_core::{AggregateId, ExpectedVersion};
use sagaflow_events::{EnvelopeError, Event, EventEnvelope};
use std::sync::Arc;

/// An event ready to be appended to a stream (not yet assigned a sequence number).
///
/// Built from a typed domain event with [`UncommittedEvent::from_typed`], which
/// seals the event into a self-describing [`EventEnvelope`]. The store never
/// looks inside the envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UncommittedEvent {
    pub event_id: Uuid,
    pub stream_id: AggregateId,
    pub aggregate_type: String,
    pub occurred_at: DateTime<Utc>,
    pub envelope: EventEnvelope,
}

/// A stored event in an append-only stream (assigned a sequence number).
///
/// Sequence numbers are assigned by the store during append. Within a stream
/// they start at 1, increase by exactly one per event and never change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: Uuid,
    pub stream_id: AggregateId,
    pub aggregate_type: String,

    /// Position in the stream, starting at 1.
    pub sequence_number: u64,

    pub occurred_at: DateTime<Utc>,
    pub envelope: EventEnvelope,
}

impl StoredEvent {
    pub fn stream_version(&self) -> u64 {
        self.sequence_number
    }

    pub fn event_type(&self) -> &str {
        self.envelope.event_type()
    }
}

/// Event store operation error.
///
/// Infrastructure errors only. Domain rejections never reach the store.
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// The stream moved past the version the writer loaded.
    #[error(
        "optimistic concurrency check failed on stream {stream_id}: expected {expected:?}, found {actual}"
    )]
    Concurrency {
        stream_id: AggregateId,
        expected: ExpectedVersion,
        actual: u64,
    },

    #[error("aggregate type mismatch: {0}")]
    AggregateTypeMismatch(String),

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    /// Backend unreachable or failing (IO, pool closed, poisoned lock).
    #[error("event store unavailable: {0}")]
    Unavailable(String),
}

impl EventStoreError {
    pub fn is_concurrency(&self) -> bool {
        matches!(self, EventStoreError::Concurrency { .. })
    }
}

/// Append-only event store.
///
/// Events are organised into **streams**, one per aggregate instance, keyed by
/// the aggregate's id. The store keeps a total, gap-free order inside each
/// stream and nothing more.
///
/// ## Append Semantics
///
/// `append()`:
/// - Validates that every event targets `stream_id` and carries one aggregate type
/// - Checks optimistic concurrency (`expected_version` against the current version)
/// - Assigns sequence numbers starting at `current_version + 1`
/// - Persists the batch atomically (all or nothing)
///
/// A failed expectation is reported as [`EventStoreError::Concurrency`] and is
/// never retried here. It is the only guard against lost updates when several
/// writers load, modify and save the same aggregate.
///
/// ## Load Semantics
///
/// `load_stream()` returns the stream in sequence order, or an empty vector if
/// the stream does not exist yet.
pub trait EventStore: Send + Sync {
    fn append(
        &self,
        stream_id: AggregateId,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    fn load_stream(&self, stream_id: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Ids of every stream of `aggregate_type`, sorted by id.
    fn stream_ids(&self, aggregate_type: &str) -> Result<Vec<AggregateId>, EventStoreError>;
}

impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    fn append(
        &self,
        stream_id: AggregateId,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).append(stream_id, events, expected_version)
    }

    fn load_stream(&self, stream_id: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).load_stream(stream_id)
    }

    fn stream_ids(&self, aggregate_type: &str) -> Result<Vec<AggregateId>, EventStoreError> {
        (**self).stream_ids(aggregate_type)
    }
}

impl UncommittedEvent {
    /// Seal a typed domain event for `stream_id`.
    pub fn from_typed<E>(
        stream_id: AggregateId,
        aggregate_type: impl Into<String>,
        event: &E,
    ) -> Result<Self, EnvelopeError>
    where
        E: Event + Serialize,
    {
        Ok(Self {
            event_id: Uuid::now_v7(),
            stream_id,
            aggregate_type: aggregate_type.into(),
            occurred_at: event.occurred_at(),
            envelope: EventEnvelope::seal(event)?,
        })
    }
}

/// Validate that a batch targets one stream and one aggregate type.
///
/// Returns the batch's aggregate type.
pub(crate) fn validate_batch(
    stream_id: AggregateId,
    events: &[UncommittedEvent],
) -> Result<Option<String>, EventStoreError> {
    let Some(first) = events.first() else {
        return Ok(None);
    };

    for (idx, e) in events.iter().enumerate() {
        if e.stream_id != stream_id {
            return Err(EventStoreError::InvalidAppend(format!(
                "event at index {idx} targets stream {}, not {stream_id}",
                e.stream_id
            )));
        }
        if e.aggregate_type != first.aggregate_type {
            return Err(EventStoreError::AggregateTypeMismatch(format!(
                "batch contains multiple aggregate_types (index {idx})"
            )));
        }
    }

    Ok(Some(first.aggregate_type.clone()))
}
