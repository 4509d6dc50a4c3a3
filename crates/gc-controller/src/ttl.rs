//! TTL evaluation
//!
//! Computes when a resource expires under a policy's [`TtlSpec`]. Four modes
//! exist and the first applicable one wins, in this order:
//!
//! 1. **Fixed**: `creationTimestamp + secondsAfterCreation`
//! 2. **Field-path**: `creationTimestamp + <integer at fieldPath>`
//!    (**Mapped** when `mappings` is set: the string at `fieldPath` is looked
//!    up in `mappings`, falling back to `default`)
//! 3. **Relative**: `<timestamp at relativeTo> + secondsAfter`
//!
//! Anything missing or unparsable yields "no TTL" so a malformed policy or
//! resource never causes mass deletion.

use chrono::{DateTime, Duration, Utc};
use kube::api::DynamicObject;
use serde_json::Value;

use crate::crds::TtlSpec;
use crate::fieldpath;

/// Which TTL rule applies to a policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlMode {
    Fixed,
    FieldPath,
    Mapped,
    Relative,
}

impl TtlMode {
    /// Resolves mode priority for a spec; `None` when no mode is configured.
    #[must_use]
    pub fn of(ttl: &TtlSpec) -> Option<Self> {
        if ttl.seconds_after_creation.is_some() {
            Some(Self::Fixed)
        } else if ttl.field_path.is_some() {
            if ttl.mappings.is_some() {
                Some(Self::Mapped)
            } else {
                Some(Self::FieldPath)
            }
        } else if ttl.relative_to.is_some() {
            Some(Self::Relative)
        } else {
            None
        }
    }
}

/// Outcome of checking one resource at one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// TTL elapsed at the given instant
    Expired(DateTime<Utc>),
    /// TTL elapses at the given instant
    Pending(DateTime<Utc>),
    /// No TTL applies; the resource is never collected by this policy
    NoTtl,
}

impl Expiry {
    #[must_use]
    pub fn is_expired(&self) -> bool {
        matches!(self, Expiry::Expired(_))
    }
}

/// Expiration instant of `resource` under `ttl`, rendered from its document form.
#[must_use]
pub fn expiration(ttl: &TtlSpec, resource: &DynamicObject) -> Option<DateTime<Utc>> {
    let doc = fieldpath::document(resource);
    expiration_of(ttl, resource, &doc)
}

/// Same as [`expiration`] for callers that already rendered the document.
#[must_use]
pub fn expiration_of(ttl: &TtlSpec, resource: &DynamicObject, doc: &Value) -> Option<DateTime<Utc>> {
    let created = || resource.metadata.creation_timestamp.as_ref().map(|t| t.0);

    match TtlMode::of(ttl)? {
        TtlMode::Fixed => add_seconds(created()?, ttl.seconds_after_creation?),
        TtlMode::FieldPath => {
            let path = ttl.field_path.as_deref()?;
            let seconds = fieldpath::lookup(doc, path).and_then(fieldpath::as_i64)?;
            add_seconds(created()?, seconds)
        }
        TtlMode::Mapped => {
            let path = ttl.field_path.as_deref()?;
            let seconds = mapped_seconds(ttl, fieldpath::lookup(doc, path))?;
            add_seconds(created()?, seconds)
        }
        TtlMode::Relative => {
            let path = ttl.relative_to.as_deref()?;
            let reference = fieldpath::lookup(doc, path).and_then(fieldpath::as_timestamp)?;
            add_seconds(reference, ttl.seconds_after.unwrap_or(0))
        }
    }
}

/// Mapped-mode TTL seconds for a resolved field value.
///
/// A present value with no mapping falls back to `default`; an absent value has no TTL.
#[must_use]
pub fn mapped_seconds(ttl: &TtlSpec, value: Option<&Value>) -> Option<i64> {
    let key = fieldpath::as_string(value?)?;
    ttl.mappings
        .as_ref()
        .and_then(|mappings| mappings.get(&key).copied())
        .or(ttl.default)
}

/// Classifies `resource` against `ttl` at `now`. Expired iff `now >= expiration`.
#[must_use]
pub fn check(ttl: &TtlSpec, resource: &DynamicObject, doc: &Value, now: DateTime<Utc>) -> Expiry {
    match expiration_of(ttl, resource, doc) {
        Some(at) if now >= at => Expiry::Expired(at),
        Some(at) => Expiry::Pending(at),
        None => Expiry::NoTtl,
    }
}

/// Convenience wrapper over [`check`] that renders the document itself.
#[must_use]
pub fn is_expired(ttl: &TtlSpec, resource: &DynamicObject, now: DateTime<Utc>) -> Expiry {
    let doc = fieldpath::document(resource);
    check(ttl, resource, &doc, now)
}

fn add_seconds(base: DateTime<Utc>, seconds: i64) -> Option<DateTime<Utc>> {
    base.checked_add_signed(Duration::try_seconds(seconds)?)
}
