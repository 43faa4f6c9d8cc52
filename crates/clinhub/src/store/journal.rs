//! Write-ahead journal of ingested clinical events.

use std::fmt;
use std::future::Future;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::event::{ClinicalEvent, EventId, ValidatedEnvelope};
use crate::identity::CanonicalId;

/// Routing progress of a journaled event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteStatus {
    /// Journaled, not yet fully routed. Replayed on recovery.
    Pending,
    /// Every subscriber target was handled.
    Routed,
    /// No subscriber matched; kept for operator visibility.
    Unrouted,
}

impl RouteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteStatus::Pending => "pending",
            RouteStatus::Routed => "routed",
            RouteStatus::Unrouted => "unrouted",
        }
    }
}

impl fmt::Display for RouteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A journaled event with its routing progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub event: ClinicalEvent,
    pub status: RouteStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub routed_at: Option<OffsetDateTime>,
}

/// Result of appending to the journal.
#[derive(Debug, Clone)]
pub enum AppendOutcome {
    /// The event was journaled with a fresh causal token.
    Appended(ClinicalEvent),
    /// The source already delivered this `source_event_id`.
    Existing(ClinicalEvent),
}

impl AppendOutcome {
    pub fn event(&self) -> &ClinicalEvent {
        match self {
            AppendOutcome::Appended(event) | AppendOutcome::Existing(event) => event,
        }
    }

    pub fn into_event(self) -> ClinicalEvent {
        match self {
            AppendOutcome::Appended(event) | AppendOutcome::Existing(event) => event,
        }
    }
}

/// Durable event journal written before routing.
pub trait EventJournal: Send + Sync + Clone + 'static {
    /// Persist an event as [`RouteStatus::Pending`].
    ///
    /// Assigns the event id and the next causal token of its source in the
    /// same atomic step. An envelope whose `(source, source_event_id)` is
    /// already journaled is not appended again.
    fn append(
        &self,
        envelope: ValidatedEnvelope,
        patient: CanonicalId,
    ) -> impl Future<Output = crate::Result<AppendOutcome>> + Send;

    fn mark_routed(&self, id: EventId) -> impl Future<Output = crate::Result<()>> + Send;

    fn mark_unrouted(&self, id: EventId) -> impl Future<Output = crate::Result<()>> + Send;

    /// Pending events in journal order.
    fn pending_events(
        &self,
        limit: u32,
    ) -> impl Future<Output = crate::Result<Vec<ClinicalEvent>>> + Send;

    /// Pending events of `patient`, or of any identity merged into it,
    /// journaled before `event`, in journal order.
    ///
    /// `patient` is expected to be a surviving identity.
    fn pending_before(
        &self,
        patient: CanonicalId,
        event: EventId,
        limit: u32,
    ) -> impl Future<Output = crate::Result<Vec<ClinicalEvent>>> + Send;

    fn load_event(
        &self,
        id: EventId,
    ) -> impl Future<Output = crate::Result<Option<JournalEntry>>> + Send;

    /// Unrouted events, most recent first.
    fn list_unrouted(
        &self,
        limit: u32,
    ) -> impl Future<Output = crate::Result<Vec<ClinicalEvent>>> + Send;

    fn count_events(
        &self,
        status: RouteStatus,
    ) -> impl Future<Output = crate::Result<u64>> + Send;
}
