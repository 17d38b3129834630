//! Generic load/save bridge between event-sourced aggregates and the store.
//!
//! ```text
//! get_by_id:  load_stream -> validate ordering -> open envelopes -> replay
//! save:       seal uncommitted -> append(expected = committed version) -> mark committed
//! ```
//!
//! A concurrency conflict is always surfaced to the caller and never retried
//! here: merging two concurrent intents is a business decision.

use std::marker::PhantomData;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

use sagaflow_core::{Aggregate, AggregateId, AggregateRoot, EventSourced, ExpectedVersion};
use sagaflow_events::{EnvelopeError, Event};

use crate::event_store::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};

#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Another writer advanced the stream after this aggregate was loaded.
    #[error(
        "concurrency conflict on {aggregate_type} {stream_id}: expected version {expected}, found {actual}"
    )]
    Concurrency {
        aggregate_type: &'static str,
        stream_id: AggregateId,
        expected: u64,
        actual: u64,
    },

    #[error("{aggregate_type} {stream_id} not found")]
    NotFound {
        aggregate_type: &'static str,
        stream_id: AggregateId,
    },

    #[error(transparent)]
    Store(EventStoreError),

    #[error("failed to encode event for {stream_id}: {source}")]
    Encode {
        stream_id: AggregateId,
        #[source]
        source: EnvelopeError,
    },

    #[error("failed to decode event {sequence_number} of {stream_id}: {source}")]
    Decode {
        stream_id: AggregateId,
        sequence_number: u64,
        #[source]
        source: EnvelopeError,
    },

    /// The store returned a stream that breaks its own ordering contract.
    #[error("corrupt stream {stream_id}: {reason}")]
    CorruptStream { stream_id: AggregateId, reason: String },
}

impl RepositoryError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, RepositoryError::Concurrency { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RepositoryError::NotFound { .. })
    }
}

/// Repository for one aggregate type over any [`EventStore`].
pub struct Repository<A, S> {
    store: S,
    _aggregate: PhantomData<fn() -> A>,
}

impl<A, S: Clone> Clone for Repository<A, S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            _aggregate: PhantomData,
        }
    }
}

impl<A, S: core::fmt::Debug> core::fmt::Debug for Repository<A, S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Repository").field("store", &self.store).finish()
    }
}

impl<A, S> Repository<A, S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            _aggregate: PhantomData,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<A, S> Repository<A, S>
where
    A: Aggregate,
    A::Event: Event + Serialize + DeserializeOwned,
    S: EventStore,
{
    /// Rebuild the aggregate from its stream. `None` if the stream is empty.
    pub fn get_by_id(&self, id: A::Id) -> Result<Option<EventSourced<A>>, RepositoryError> {
        let stream_id: AggregateId = id.into();
        let history = self
            .store
            .load_stream(stream_id)
            .map_err(|e| self.map_store_error(e))?;
        if history.is_empty() {
            return Ok(None);
        }

        validate_loaded_stream(stream_id, A::AGGREGATE_TYPE, &history)?;

        let events = history
            .iter()
            .map(|stored| {
                stored
                    .envelope
                    .open::<A::Event>()
                    .map_err(|source| RepositoryError::Decode {
                        stream_id,
                        sequence_number: stored.sequence_number,
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(EventSourced::load_from_history(id, events)))
    }

    /// Like [`get_by_id`](Self::get_by_id), but an absent stream is an error.
    pub fn load_required(&self, id: A::Id) -> Result<EventSourced<A>, RepositoryError> {
        self.get_by_id(id)?.ok_or_else(|| RepositoryError::NotFound {
            aggregate_type: A::AGGREGATE_TYPE,
            stream_id: id.into(),
        })
    }

    /// When the aggregate's stream was last appended to. `None` if it is empty.
    pub fn last_change(&self, id: A::Id) -> Result<Option<DateTime<Utc>>, RepositoryError> {
        let history = self
            .store
            .load_stream(id.into())
            .map_err(|e| self.map_store_error(e))?;
        Ok(history.last().map(|stored| stored.occurred_at))
    }

    /// Append the aggregate's uncommitted events.
    ///
    /// No-op when nothing is buffered. On conflict the buffer is left intact so
    /// the caller can inspect what it tried to write.
    pub fn save(
        &self,
        aggregate: &mut EventSourced<A>,
    ) -> Result<Vec<StoredEvent>, RepositoryError> {
        if !aggregate.has_uncommitted() {
            return Ok(vec![]);
        }

        let stream_id: AggregateId = (*aggregate.id()).into();
        let expected = aggregate.committed_version();

        let events = aggregate
            .uncommitted_events()
            .iter()
            .map(|event| {
                UncommittedEvent::from_typed(stream_id, A::AGGREGATE_TYPE, event)
                    .map_err(|source| RepositoryError::Encode { stream_id, source })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let committed = self
            .store
            .append(stream_id, events, ExpectedVersion::Exact(expected))
            .map_err(|e| self.map_store_error(e))?;

        aggregate.mark_as_committed();
        debug!(
            aggregate_type = A::AGGREGATE_TYPE,
            stream_id = %stream_id,
            version = aggregate.version(),
            appended = committed.len(),
            "aggregate saved"
        );
        Ok(committed)
    }

    /// Ids of every stored aggregate of this type, sorted (roughly creation order).
    pub fn ids(&self) -> Result<Vec<A::Id>, RepositoryError> {
        let ids = self
            .store
            .stream_ids(A::AGGREGATE_TYPE)
            .map_err(|e| self.map_store_error(e))?;
        Ok(ids.into_iter().map(A::Id::from).collect())
    }

    fn map_store_error(&self, err: EventStoreError) -> RepositoryError {
        match err {
            EventStoreError::Concurrency {
                stream_id,
                expected,
                actual,
            } => RepositoryError::Concurrency {
                aggregate_type: A::AGGREGATE_TYPE,
                stream_id,
                expected: match expected {
                    ExpectedVersion::Exact(v) => v,
                    ExpectedVersion::Any => actual,
                },
                actual,
            },
            other => RepositoryError::Store(other),
        }
    }
}

fn validate_loaded_stream(
    stream_id: AggregateId,
    aggregate_type: &str,
    stream: &[StoredEvent],
) -> Result<(), RepositoryError> {
    let corrupt = |reason: String| RepositoryError::CorruptStream { stream_id, reason };

    for (idx, e) in stream.iter().enumerate() {
        if e.stream_id != stream_id {
            return Err(corrupt(format!(
                "event at index {idx} belongs to stream {}",
                e.stream_id
            )));
        }
        if e.aggregate_type != aggregate_type {
            return Err(corrupt(format!(
                "event at index {idx} has aggregate_type '{}', expected '{aggregate_type}'",
                e.aggregate_type
            )));
        }
        let expected = idx as u64 + 1;
        if e.sequence_number != expected {
            return Err(corrupt(format!(
                "expected sequence_number {expected}, found {}",
                e.sequence_number
            )));
        }
    }
    Ok(())
}
