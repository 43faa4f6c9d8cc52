//! Scheduled workflow inputs.
//!
//! A timer delivers its input to the owning instance once `fire_at` has
//! passed. Timer inputs take the same path as routed events: they are applied
//! under the instance lock, so they observe consistent state and are
//! serialized with every other input for that instance.
//!
//! The engine keeps one keyed timer per non-terminal instance,
//! [`DEADLINE_TIMER_KEY`], re-armed after every accepted transition. When it
//! fires, the workflow's [`timeout_input`](crate::Workflow::timeout_input)
//! is applied like any other input.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Key of the per-instance deadline timer.
pub const DEADLINE_TIMER_KEY: &str = "deadline";

/// A scheduled input for a workflow instance.
///
/// Scheduling a timer with a `key` replaces any pending timer with the same
/// key on the same instance.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use clinhub::Timer;
///
/// let timer = Timer::after(Duration::from_secs(3600), "SpecimenReminder")
///     .with_key("specimen-reminder");
/// assert_eq!(timer.key(), Some("specimen-reminder"));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timer<I> {
    /// When the timer should fire (UTC).
    pub fire_at: OffsetDateTime,

    /// The input to deliver when the timer fires.
    pub input: I,

    /// Optional key for replacement and cancellation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl<I> Timer<I> {
    /// Create a timer that fires at a specific time.
    pub fn at(fire_at: OffsetDateTime, input: I) -> Self {
        Self {
            fire_at,
            input,
            key: None,
        }
    }

    /// Create a timer that fires after a delay from now.
    pub fn after(delay: Duration, input: I) -> Self {
        Self::at(OffsetDateTime::now_utc() + delay, input)
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }
}
