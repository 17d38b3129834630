//! Typed stream identifiers for the workflow aggregates.

use serde::{Deserialize, Serialize};

use sagaflow_core::AggregateId;

macro_rules! stream_id {
    ($(#[$meta:meta])* $t:ident) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $t(pub AggregateId);

        impl $t {
            pub fn new() -> Self {
                Self(AggregateId::new())
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<AggregateId> for $t {
            fn from(value: AggregateId) -> Self {
                Self(value)
            }
        }

        impl From<$t> for AggregateId {
            fn from(value: $t) -> Self {
                value.0
            }
        }
    };
}

stream_id!(
    /// Identifier of an [`Activity`](crate::Activity) stream.
    ActivityId
);
stream_id!(
    /// Identifier of a [`Workflow`](crate::Workflow) stream.
    WorkflowId
);
stream_id!(
    /// Identifier of a [`Saga`](crate::Saga) stream.
    SagaId
);
stream_id!(
    /// Identifier of a [`BackgroundJob`](crate::BackgroundJob) stream.
    JobId
);
