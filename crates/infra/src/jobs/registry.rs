//! Type-keyed handler registry.
//!
//! Populated once at startup; resolution order is exact key, then category
//! pattern (`"email.*"` matches `"email.welcome"`), then the `"*"` wildcard.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use serde_json::Value as JsonValue;
use thiserror::Error;

/// Suffix appended to an activity type to find its undo handler.
pub const COMPENSATION_SUFFIX: &str = ".compensate";

/// Business logic behind one job/activity type.
///
/// Returns a short result string that is persisted on success.
pub trait JobHandler: Send + Sync {
    fn execute(&self, payload: &JsonValue) -> anyhow::Result<String>;
}

impl<F> JobHandler for F
where
    F: Fn(&JsonValue) -> anyhow::Result<String> + Send + Sync,
{
    fn execute(&self, payload: &JsonValue) -> anyhow::Result<String> {
        self(payload)
    }
}

/// Failure of a single handler invocation.
///
/// Always captured into a Failed transition; never rethrown past the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    #[error("no handler registered for '{0}'")]
    NotRegistered(String),

    #[error("handler failed: {0}")]
    Failed(String),

    #[error("handler timed out after {0:?}")]
    TimedOut(Duration),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl core::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut keys: Vec<&String> = self.handlers.keys().collect();
        keys.sort();
        f.debug_struct("HandlerRegistry").field("keys", &keys).finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `type_key`, replacing any previous registration.
    pub fn register<H>(&mut self, type_key: impl Into<String>, handler: H) -> &mut Self
    where
        H: JobHandler + 'static,
    {
        self.handlers.insert(type_key.into(), Arc::new(handler));
        self
    }

    pub fn resolve(&self, type_key: &str) -> Result<Arc<dyn JobHandler>, HandlerError> {
        if let Some(h) = self.handlers.get(type_key) {
            return Ok(h.clone());
        }

        // Longest matching category wins, so resolution is independent of map order.
        let category = self
            .handlers
            .iter()
            .filter_map(|(pattern, handler)| {
                let prefix = pattern.strip_suffix('*')?;
                (prefix.ends_with('.') && type_key.starts_with(prefix))
                    .then_some((prefix.len(), handler))
            })
            .max_by_key(|(len, _)| *len);
        if let Some((_, h)) = category {
            return Ok(h.clone());
        }

        self.handlers
            .get("*")
            .cloned()
            .ok_or_else(|| HandlerError::NotRegistered(type_key.to_string()))
    }

    pub fn contains(&self, type_key: &str) -> bool {
        self.resolve(type_key).is_ok()
    }
}

/// Registry key of the undo handler for `activity_type`.
pub fn compensation_key(activity_type: &str) -> String {
    format!("{activity_type}{COMPENSATION_SUFFIX}")
}

/// Run `handler` on its own thread, bounded by `timeout`.
///
/// A panic becomes [`HandlerError::Panicked`]. On expiry the call returns
/// [`HandlerError::TimedOut`]; the handler thread is detached and its eventual
/// result discarded.
pub fn execute_with_timeout(
    handler: Arc<dyn JobHandler>,
    payload: JsonValue,
    timeout: Duration,
) -> Result<String, HandlerError> {
    let (tx, rx) = mpsc::channel();

    thread::Builder::new()
        .name("job-handler".to_string())
        .spawn(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.execute(&payload)));
            let _ = tx.send(outcome);
        })
        .map_err(|e| HandlerError::Failed(format!("failed to spawn handler thread: {e}")))?;

    match rx.recv_timeout(timeout) {
        Ok(Ok(Ok(result))) => Ok(result),
        Ok(Ok(Err(err))) => Err(HandlerError::Failed(format!("{err:#}"))),
        Ok(Err(panic)) => Err(HandlerError::Panicked(panic_message(panic.as_ref()))),
        Err(mpsc::RecvTimeoutError::Timeout) => Err(HandlerError::TimedOut(timeout)),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(HandlerError::Panicked(
            "handler thread exited without a result".to_string(),
        )),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
