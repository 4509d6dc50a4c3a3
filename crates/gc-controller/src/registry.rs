//! Per-policy watch and rate limiter ownership
//!
//! Every tracked policy UID owns one slot holding its [`WatchEntry`], its
//! [`RateLimiter`] and its last reconciled [`PolicyState`]. Operations on one
//! UID are serialized by the slot's async mutex; different UIDs never contend.
//!
//! Removing a slot marks it retired before dropping it from the map, so a
//! caller that was waiting on the old mutex retries against a fresh slot
//! instead of resurrecting state for a deleted policy.

use dashmap::DashMap;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::rate_limit::RateLimiter;
use crate::types::Result;
use crate::watch::{ResourceCache, WatchEntry, WatchProvider, WatchTarget};

/// Reconciliation state of one policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PolicyState {
    #[default]
    NotTracked,
    Active,
    Paused,
    Error,
}

impl fmt::Display for PolicyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyState::NotTracked => write!(f, "NotTracked"),
            PolicyState::Active => write!(f, "Active"),
            PolicyState::Paused => write!(f, "Paused"),
            PolicyState::Error => write!(f, "Error"),
        }
    }
}

/// What [`PolicyRegistry::ensure`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    Created,
    Reused,
    Replaced,
}

/// Everything an evaluation pass needs from a tracked policy
#[derive(Clone)]
pub struct PolicyHandles {
    pub target: WatchTarget,
    pub cache: Arc<dyn ResourceCache>,
    pub limiter: Arc<RateLimiter>,
    /// Cancelled when the policy's watch is torn down or the process shuts down
    pub cancel: CancellationToken,
}

#[derive(Default)]
struct PolicySlot {
    watch: Option<WatchEntry>,
    limiter: Option<Arc<RateLimiter>>,
    state: PolicyState,
    retired: bool,
}

impl PolicySlot {
    fn handles(&self) -> Option<PolicyHandles> {
        let watch = self.watch.as_ref()?;
        let limiter = self.limiter.clone()?;
        Some(PolicyHandles {
            target: watch.target().clone(),
            cache: watch.cache(),
            limiter,
            cancel: watch.cancel_token(),
        })
    }
}

pub struct PolicyRegistry {
    provider: Arc<dyn WatchProvider>,
    slots: DashMap<String, Arc<Mutex<PolicySlot>>>,
    root: CancellationToken,
}

impl PolicyRegistry {
    /// Watches opened by this registry stop when `root` is cancelled.
    pub fn new(provider: Arc<dyn WatchProvider>, root: CancellationToken) -> Self {
        Self {
            provider,
            slots: DashMap::new(),
            root,
        }
    }

    async fn lock_or_create(&self, uid: &str) -> OwnedMutexGuard<PolicySlot> {
        loop {
            let slot = self
                .slots
                .entry(uid.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(PolicySlot::default())))
                .clone();
            let guard = slot.lock_owned().await;
            if !guard.retired {
                return guard;
            }
        }
    }

    async fn lock_existing(&self, uid: &str) -> Option<(Arc<Mutex<PolicySlot>>, OwnedMutexGuard<PolicySlot>)> {
        loop {
            let slot = self.slots.get(uid).map(|entry| entry.value().clone())?;
            let guard = slot.clone().lock_owned().await;
            if !guard.retired {
                return Some((slot, guard));
            }
        }
    }

    /// Makes sure `uid` has a watch on `target` and a limiter at `rate`.
    ///
    /// A watch on a different target is stopped before the new one opens, so
    /// no event from the old scope is observed afterwards. On failure the slot
    /// is left without a watch.
    pub async fn ensure(&self, uid: &str, target: &WatchTarget, rate: f64) -> Result<EnsureOutcome> {
        let mut slot = self.lock_or_create(uid).await;

        let current = slot.watch.as_ref().map(|watch| watch.target().clone());
        let outcome = match current {
            Some(existing) if existing == *target => EnsureOutcome::Reused,
            Some(existing) => {
                info!(uid, from = %existing, to = %target, "Watch target changed, replacing watch");
                if let Some(old) = slot.watch.take() {
                    old.stop().await;
                }
                slot.watch = Some(self.provider.open(target, &self.root).await?);
                EnsureOutcome::Replaced
            }
            None => {
                slot.watch = Some(self.provider.open(target, &self.root).await?);
                debug!(uid, watch = %target, "Watch created");
                EnsureOutcome::Created
            }
        };

        match slot.limiter.as_ref() {
            Some(limiter) => limiter.reconfigure(rate).await?,
            None => slot.limiter = Some(Arc::new(RateLimiter::new(rate)?)),
        }

        Ok(outcome)
    }

    /// Handles for an evaluation pass, if `uid` has a live watch.
    pub async fn handles(&self, uid: &str) -> Option<PolicyHandles> {
        let (_, slot) = self.lock_existing(uid).await?;
        slot.handles()
    }

    /// Stops and forgets everything owned by `uid`. Returns whether anything
    /// was there; calling it again is a no-op.
    pub async fn remove(&self, uid: &str) -> bool {
        let Some((arc, mut slot)) = self.lock_existing(uid).await else {
            return false;
        };

        let had_state = slot.watch.is_some() || slot.limiter.is_some() || slot.state != PolicyState::NotTracked;
        if let Some(watch) = slot.watch.take() {
            watch.stop().await;
        }
        slot.limiter = None;
        slot.state = PolicyState::NotTracked;
        slot.retired = true;
        self.slots.remove_if(uid, |_, current| Arc::ptr_eq(current, &arc));
        drop(slot);

        if had_state {
            debug!(uid, "Policy state removed");
        }
        had_state
    }

    /// Removes every slot whose UID is not in `live`. Returns the removed UIDs.
    pub async fn prune(&self, live: &HashSet<String>) -> Vec<String> {
        let stale: Vec<String> = self
            .slots
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|uid| !live.contains(uid))
            .collect();

        let mut removed = Vec::new();
        for uid in stale {
            if self.remove(&uid).await {
                removed.push(uid);
            }
        }
        if !removed.is_empty() {
            info!(count = removed.len(), "Pruned state of deleted policies");
        }
        removed
    }

    pub async fn state(&self, uid: &str) -> PolicyState {
        match self.lock_existing(uid).await {
            Some((_, slot)) => slot.state,
            None => PolicyState::NotTracked,
        }
    }

    pub async fn set_state(&self, uid: &str, state: PolicyState) {
        if state == PolicyState::NotTracked {
            self.remove(uid).await;
            return;
        }
        let mut slot = self.lock_or_create(uid).await;
        slot.state = state;
    }

    /// Target of the live watch for `uid`
    pub async fn target(&self, uid: &str) -> Option<WatchTarget> {
        let (_, slot) = self.lock_existing(uid).await?;
        slot.watch.as_ref().map(|watch| watch.target().clone())
    }

    /// Number of tracked policies
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Stops every watch.
    pub async fn shutdown(&self) {
        let uids: Vec<String> = self.slots.iter().map(|entry| entry.key().clone()).collect();
        for uid in uids {
            self.remove(&uid).await;
        }
    }
}
