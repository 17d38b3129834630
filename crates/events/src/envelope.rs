use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::Event;

/// Self-describing wrapper for an event payload: `{type, schemaVersion, data}`.
///
/// The event store treats `data` as opaque; only the owning aggregate knows how
/// to open it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    event_type: String,
    schema_version: u32,
    data: JsonValue,
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("failed to encode {event_type}: {source}")]
    Encode {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to decode {event_type} (schema v{schema_version}): {source}")]
    Decode {
        event_type: String,
        schema_version: u32,
        #[source]
        source: serde_json::Error,
    },
}

impl EventEnvelope {
    pub fn new(event_type: impl Into<String>, schema_version: u32, data: JsonValue) -> Self {
        Self {
            event_type: event_type.into(),
            schema_version,
            data,
        }
    }

    /// Wrap a typed event, capturing its type key and schema version.
    pub fn seal<E>(event: &E) -> Result<Self, EnvelopeError>
    where
        E: Event + Serialize,
    {
        let data = serde_json::to_value(event).map_err(|source| EnvelopeError::Encode {
            event_type: event.event_type().to_string(),
            source,
        })?;

        Ok(Self::new(event.event_type(), event.version(), data))
    }

    /// Deserialize `data` back into a typed event.
    pub fn open<E>(&self) -> Result<E, EnvelopeError>
    where
        E: DeserializeOwned,
    {
        E::deserialize(&self.data).map_err(|source| EnvelopeError::Decode {
            event_type: self.event_type.clone(),
            schema_version: self.schema_version,
            source,
        })
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub fn data(&self) -> &JsonValue {
        &self.data
    }
}
