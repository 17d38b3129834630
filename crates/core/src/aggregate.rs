//! Aggregate contract for event-sourced state machines.

use crate::error::{DomainError, DomainResult};
use crate::id::AggregateId;

/// Aggregate root marker + minimal interface.
pub trait AggregateRoot {
    /// Strongly-typed aggregate identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the aggregate identifier.
    fn id(&self) -> &Self::Id;

    /// Number of events ever applied to this instance (history + new commands).
    fn version(&self) -> u64;
}

/// Optimistic concurrency expectation for an aggregate stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Skip version checking.
    Any,
    /// Require the stream to be at an exact version.
    Exact(u64),
}

impl ExpectedVersion {
    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }

    pub fn check(self, actual: u64) -> DomainResult<()> {
        if self.matches(actual) {
            Ok(())
        } else {
            Err(DomainError::conflict(format!(
                "optimistic concurrency check failed (expected: {self:?}, actual: {actual})"
            )))
        }
    }
}

/// Aggregate execution semantics (pure, deterministic).
///
/// - **Decision logic**: `handle(&self, cmd)` returns events.
/// - **State mutation**: `apply(&mut self, event)` evolves state.
///
/// Aggregates must not perform IO. Version tracking and the uncommitted buffer
/// live in [`EventSourced`], so implementations only fold events into state.
pub trait Aggregate: Sized {
    /// Typed identifier, convertible to and from the stream id.
    type Id: Copy
        + Eq
        + core::hash::Hash
        + core::fmt::Debug
        + Into<AggregateId>
        + From<AggregateId>;
    type Command: core::fmt::Debug;
    type Event: Clone + core::fmt::Debug;
    type Error: core::fmt::Debug;

    /// Stable stream category (e.g. `"workflow.job"`).
    const AGGREGATE_TYPE: &'static str;

    /// A blank, not-yet-created instance ready for rehydration.
    fn empty(id: Self::Id) -> Self;

    /// Evolve in-memory state from a single event. Must be deterministic.
    fn apply(&mut self, event: &Self::Event);

    /// Decide which events to emit given the current state and a command.
    ///
    /// This must not mutate state. State evolution is done through `apply`.
    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error>;
}

/// An aggregate together with its stream version and the events produced
/// since it was loaded.
///
/// `version` always equals the number of events applied, whether they came
/// from history or from new commands.
pub struct EventSourced<A: Aggregate> {
    id: A::Id,
    state: A,
    version: u64,
    uncommitted: Vec<A::Event>,
}

impl<A: Aggregate> EventSourced<A> {
    /// A fresh aggregate with no history.
    pub fn new(id: A::Id) -> Self {
        Self {
            id,
            state: A::empty(id),
            version: 0,
            uncommitted: Vec::new(),
        }
    }

    /// Rebuild state by replaying `events` in order. Touches nothing external.
    pub fn load_from_history<I>(id: A::Id, events: I) -> Self
    where
        I: IntoIterator<Item = A::Event>,
    {
        let mut this = Self::new(id);
        for event in events {
            this.state.apply(&event);
            this.version += 1;
        }
        this
    }

    /// Run a command: decide, then apply and buffer every resulting event.
    ///
    /// If `handle` rejects the command, nothing is applied.
    pub fn execute(&mut self, command: &A::Command) -> Result<&[A::Event], A::Error> {
        let decided = self.state.handle(command)?;
        let start = self.uncommitted.len();
        for event in decided {
            self.state.apply(&event);
            self.version += 1;
            self.uncommitted.push(event);
        }
        Ok(&self.uncommitted[start..])
    }

    pub fn state(&self) -> &A {
        &self.state
    }

    pub fn into_state(self) -> A {
        self.state
    }

    /// Events produced since load, in production order.
    pub fn uncommitted_events(&self) -> &[A::Event] {
        &self.uncommitted
    }

    pub fn has_uncommitted(&self) -> bool {
        !self.uncommitted.is_empty()
    }

    /// Clear the buffer after a successful append.
    pub fn mark_as_committed(&mut self) {
        self.uncommitted.clear();
    }

    /// Version of the stream as last loaded or saved.
    pub fn committed_version(&self) -> u64 {
        self.version - self.uncommitted.len() as u64
    }
}

impl<A: Aggregate> AggregateRoot for EventSourced<A> {
    type Id = A::Id;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

impl<A> Clone for EventSourced<A>
where
    A: Aggregate + Clone,
{
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            state: self.state.clone(),
            version: self.version,
            uncommitted: self.uncommitted.clone(),
        }
    }
}

impl<A> core::fmt::Debug for EventSourced<A>
where
    A: Aggregate + core::fmt::Debug,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventSourced")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("version", &self.version)
            .field("uncommitted", &self.uncommitted)
            .finish()
    }
}

impl<A> PartialEq for EventSourced<A>
where
    A: Aggregate + PartialEq,
    A::Event: PartialEq,
{
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.version == other.version
            && self.state == other.state
            && self.uncommitted == other.uncommitted
    }
}
