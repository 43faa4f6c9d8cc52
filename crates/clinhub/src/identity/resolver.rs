use time::OffsetDateTime;
use tracing::{debug, info};

use super::{
    CanonicalId, CanonicalIdentity, IdentityStore, LinkOutcome, LocalIdentifier, MergePlan,
    MergeRecord, ProvisionOutcome,
};
use crate::audit::{AuditKind, AuditRecord, AuditReference};
use crate::error::{Error, Result};
use crate::subsystem::Subsystem;

/// Upper bound on supersede hops followed by a single lookup.
const MAX_SUPERSEDE_HOPS: usize = 64;

/// Identity resolution configuration.
#[derive(Debug, Clone)]
pub struct IdentityConfig {
    /// Provision a new canonical identity for unknown local identifiers.
    ///
    /// Default: `true`
    pub auto_provision: bool,

    /// Optimistic retries before a merge gives up with
    /// [`Error::MergeConflict`].
    ///
    /// Default: 8
    pub max_merge_retries: u32,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            auto_provision: true,
            max_merge_retries: 8,
        }
    }
}

/// Resolves local patient identifiers to canonical identities.
///
/// # Example
///
/// ```ignore
/// let resolver = IdentityResolver::new(store, IdentityConfig::default());
///
/// let first = resolver.resolve(Subsystem::Cpoe, "12345").await?;
/// let again = resolver.resolve(Subsystem::Cpoe, "12345").await?;
/// assert_eq!(first.id, again.id);
/// ```
#[derive(Clone)]
pub struct IdentityResolver<S> {
    store: S,
    config: IdentityConfig,
}

impl<S> IdentityResolver<S>
where
    S: IdentityStore,
{
    pub fn new(store: S, config: IdentityConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &IdentityConfig {
        &self.config
    }

    /// Resolve a local identifier to its surviving canonical identity.
    ///
    /// Repeated calls, including concurrent first calls, return the same
    /// identity: provisioning is an atomic insert-or-get in the store.
    pub async fn resolve(&self, subsystem: Subsystem, local_id: &str) -> Result<CanonicalIdentity> {
        let local = LocalIdentifier::new(subsystem, local_id);

        if let Some(id) = self.store.find_local(&local).await? {
            return self.lookup(id).await;
        }

        if !self.config.auto_provision {
            return Err(Error::UnknownIdentity {
                subsystem,
                local_id: local_id.to_string(),
            });
        }

        let candidate = CanonicalId::generate();
        let audit = AuditRecord::new(AuditKind::IdentityProvisioned, AuditReference::Identity(candidate))
            .with_detail(local.to_string());
        match self
            .store
            .provision(&local, candidate, OffsetDateTime::now_utc(), audit)
            .await?
        {
            ProvisionOutcome::Created(identity) => {
                info!(identity = %identity.id, local = %local, "provisioned canonical identity");
                Ok(identity)
            }
            ProvisionOutcome::Existing(id) => {
                debug!(identity = %id, local = %local, "lost provisioning race");
                self.lookup(id).await
            }
        }
    }

    /// Load an identity, redirecting transparently to the survivor.
    pub async fn lookup(&self, id: CanonicalId) -> Result<CanonicalIdentity> {
        let mut current = id;
        for _ in 0..MAX_SUPERSEDE_HOPS {
            let identity = self
                .store
                .load_identity(current)
                .await?
                .ok_or_else(|| Error::UnknownCanonicalIdentity(current.to_string()))?;
            match identity.superseded_by {
                Some(next) => current = next,
                None => return Ok(identity),
            }
        }
        Err(Error::SupersedeChainTooLong(id.to_string()))
    }

    /// Merge two identities believed to be the same patient.
    ///
    /// Commutative and idempotent: both argument orders pick the same
    /// survivor, and merging identities that already share a survivor
    /// returns it unchanged.
    pub async fn merge(&self, a: CanonicalId, b: CanonicalId) -> Result<CanonicalIdentity> {
        for attempt in 1..=self.config.max_merge_retries {
            let left = self.lookup(a).await?;
            let right = self.lookup(b).await?;

            if left.id == right.id {
                return Ok(left);
            }

            let (survivor, superseded) = if left.outranks(&right) {
                (left, right)
            } else {
                (right, left)
            };

            let plan = MergePlan {
                survivor: survivor.id,
                survivor_version: survivor.version,
                superseded: superseded.id,
                superseded_version: superseded.version,
                merged_at: OffsetDateTime::now_utc(),
            };

            let audit = AuditRecord::new(AuditKind::IdentityMerged, AuditReference::Identity(plan.survivor))
                .with_detail(format!("superseded {}", plan.superseded));
            if self.store.commit_merge(&plan, audit).await? {
                info!(
                    survivor = %plan.survivor,
                    superseded = %plan.superseded,
                    "merged canonical identities"
                );
                return self.lookup(plan.survivor).await;
            }

            debug!(attempt, left = %a, right = %b, "merge version conflict, retrying");
        }

        Err(Error::MergeConflict {
            left: a.to_string(),
            right: b.to_string(),
            attempts: self.config.max_merge_retries,
        })
    }

    /// Attach a local identifier to an existing identity.
    ///
    /// Linking to the identity (or a survivor of it) that already owns the
    /// identifier is a no-op.
    pub async fn link(
        &self,
        subsystem: Subsystem,
        local_id: &str,
        id: CanonicalId,
    ) -> Result<CanonicalIdentity> {
        let local = LocalIdentifier::new(subsystem, local_id);

        for _ in 0..=self.config.max_merge_retries {
            let target = self.lookup(id).await?;
            let audit = AuditRecord::new(AuditKind::IdentityLinked, AuditReference::Identity(target.id))
                .with_detail(local.to_string());
            match self.store.link(&local, target.id, audit).await? {
                LinkOutcome::Linked => {
                    info!(identity = %target.id, local = %local, "linked local identifier");
                    return self.lookup(target.id).await;
                }
                LinkOutcome::AlreadyLinked(existing) => {
                    let owner = self.lookup(existing).await?;
                    if owner.id == target.id {
                        return Ok(owner);
                    }
                    return Err(Error::IdentityConflict {
                        subsystem,
                        local_id: local_id.to_string(),
                        existing: owner.id.to_string(),
                    });
                }
                LinkOutcome::TargetSuperseded => continue,
            }
        }

        Err(Error::MergeConflict {
            left: id.to_string(),
            right: local.to_string(),
            attempts: self.config.max_merge_retries,
        })
    }

    /// Merge trail for an identity and the identities merged into it.
    pub async fn history(&self, id: CanonicalId) -> Result<Vec<MergeRecord>> {
        let mut records = self.store.merge_history(id).await?;
        records.sort_by_key(|record| record.merged_at);
        Ok(records)
    }
}
