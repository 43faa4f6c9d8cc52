//! Enterprise master patient index (EMPI).
//!
//! Maps subsystem-local patient identifiers to a single canonical identity.
//!
//! Mappings are append-only: a merge never deletes a local identifier
//! mapping. The superseded identity keeps its identifiers and gains a
//! `superseded_by` pointer; every lookup follows the pointer chain to the
//! surviving identity.
//!
//! Linearizability per identity is achieved with optimistic versioning:
//! every mutation bumps the identity's `version`, and
//! [`IdentityStore::commit_merge`] only applies when both versions still
//! match. [`IdentityResolver`] retries on conflict.

mod resolver;

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

pub use resolver::{IdentityConfig, IdentityResolver};

use crate::audit::AuditRecord;
use crate::error::Result;
use crate::subsystem::Subsystem;

/// Globally unique canonical patient identifier (UUID v7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalId(Uuid);

impl CanonicalId {
    /// Generate a new time-ordered identifier.
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for CanonicalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for CanonicalId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A patient identifier as known by one subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalIdentifier {
    pub subsystem: Subsystem,
    pub local_id: String,
}

impl LocalIdentifier {
    pub fn new(subsystem: Subsystem, local_id: impl Into<String>) -> Self {
        Self {
            subsystem,
            local_id: local_id.into(),
        }
    }
}

impl fmt::Display for LocalIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.subsystem, self.local_id)
    }
}

/// A canonical patient identity and the local identifiers it owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalIdentity {
    pub id: CanonicalId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Local identifiers mapped to this identity, including those inherited
    /// from identities merged into it.
    pub identifiers: BTreeSet<LocalIdentifier>,
    /// Set once this identity lost a merge.
    pub superseded_by: Option<CanonicalId>,
    /// Optimistic concurrency version, bumped by every mutation.
    pub version: u64,
}

impl CanonicalIdentity {
    /// Returns `true` if this identity was merged into another one.
    pub fn is_superseded(&self) -> bool {
        self.superseded_by.is_some()
    }

    /// Merge tie-break: earlier creation wins, smaller id breaks exact ties.
    pub(crate) fn outranks(&self, other: &CanonicalIdentity) -> bool {
        (self.created_at, self.id) < (other.created_at, other.id)
    }
}

/// Append-only record of a completed merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRecord {
    pub survivor: CanonicalId,
    pub superseded: CanonicalId,
    #[serde(with = "time::serde::rfc3339")]
    pub merged_at: OffsetDateTime,
}

/// A merge to apply if neither identity changed since it was read.
#[derive(Debug, Clone)]
pub struct MergePlan {
    pub survivor: CanonicalId,
    pub survivor_version: u64,
    pub superseded: CanonicalId,
    pub superseded_version: u64,
    pub merged_at: OffsetDateTime,
}

/// Result of provisioning a canonical identity for a local identifier.
#[derive(Debug, Clone)]
pub enum ProvisionOutcome {
    /// A new identity was created and the local identifier mapped to it.
    Created(CanonicalIdentity),
    /// A concurrent caller mapped the local identifier first.
    Existing(CanonicalId),
}

/// Result of linking a local identifier to an identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
    /// The mapping was recorded.
    Linked,
    /// The local identifier was already mapped to this identity.
    AlreadyLinked(CanonicalId),
    /// The target was superseded since it was read; resolve and retry.
    TargetSuperseded,
}

/// Storage for the identity map.
pub trait IdentityStore: Send + Sync + Clone + 'static {
    /// Find the identity a local identifier was originally mapped to.
    ///
    /// The returned identity may be superseded; callers follow the chain.
    fn find_local(
        &self,
        local: &LocalIdentifier,
    ) -> impl Future<Output = Result<Option<CanonicalId>>> + Send;

    /// Load an identity record, superseded or not.
    fn load_identity(
        &self,
        id: CanonicalId,
    ) -> impl Future<Output = Result<Option<CanonicalIdentity>>> + Send;

    /// Atomically create `id` and map `local` to it, unless `local` is
    /// already mapped.
    ///
    /// `audit` is queued in the same atomic step, only when the identity is
    /// created.
    fn provision(
        &self,
        local: &LocalIdentifier,
        id: CanonicalId,
        created_at: OffsetDateTime,
        audit: AuditRecord,
    ) -> impl Future<Output = Result<ProvisionOutcome>> + Send;

    /// Map `local` to the (non-superseded) identity `id`.
    ///
    /// `audit` is queued with the mapping, only on [`LinkOutcome::Linked`].
    fn link(
        &self,
        local: &LocalIdentifier,
        id: CanonicalId,
        audit: AuditRecord,
    ) -> impl Future<Output = Result<LinkOutcome>> + Send;

    /// Apply a merge if both identities still carry the planned versions.
    ///
    /// Returns `false` on a version conflict; nothing is written then,
    /// `audit` included.
    fn commit_merge(
        &self,
        plan: &MergePlan,
        audit: AuditRecord,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Merge records where `id` is the survivor or the superseded side.
    fn merge_history(
        &self,
        id: CanonicalId,
    ) -> impl Future<Output = Result<Vec<MergeRecord>>> + Send;

    /// Number of non-superseded identities.
    fn count_identities(&self) -> impl Future<Output = Result<u64>> + Send;
}
