//! # Leader election
//!
//! Only the leader replica evaluates policies. [`LeaseLeadership`] holds a
//! coordination/v1 Lease: it creates the lease when missing, takes it over once
//! the previous holder stops renewing, and renews it on a fixed interval. Losing
//! the lease after holding it fires [`LeaseLeadership::lost`].

use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, PostParams};
use kube::core::ObjectMeta;
use kube::{Client, Error as KubeError};

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Whether this replica may act
pub trait LeadershipSignal: Send + Sync {
    fn is_leader(&self) -> bool;
}

/// Single-replica deployments and tests
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysLeader;

impl LeadershipSignal for AlwaysLeader {
    fn is_leader(&self) -> bool {
        true
    }
}

/// Errors that can occur during lease operations
#[derive(Error, Debug)]
pub enum LeaseError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] KubeError),

    #[error("Lease is held by another holder: {holder}")]
    LockHeld { holder: String },

    #[error("Lease validation failed: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone)]
pub struct LeaseSettings {
    pub name: String,
    pub namespace: String,
    pub identity: String,
    pub lease_duration: Duration,
    pub renew_interval: Duration,
}

/// Lease-backed leadership
pub struct LeaseLeadership {
    leader: Arc<AtomicBool>,
    lost: CancellationToken,
    task: JoinHandle<()>,
}

impl LeaseLeadership {
    /// Starts the acquire/renew loop. It runs until `shutdown` fires.
    #[must_use]
    pub fn start(client: Client, settings: LeaseSettings, shutdown: CancellationToken) -> Self {
        let leader = Arc::new(AtomicBool::new(false));
        let lost = CancellationToken::new();

        let task = tokio::spawn(run_election(
            Api::namespaced(client, &settings.namespace),
            settings,
            leader.clone(),
            lost.clone(),
            shutdown,
        ));

        Self { leader, lost, task }
    }

    /// Cancelled once leadership is lost after having been held
    #[must_use]
    pub fn lost(&self) -> CancellationToken {
        self.lost.clone()
    }
}

impl LeadershipSignal for LeaseLeadership {
    fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }
}

impl Drop for LeaseLeadership {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_election(
    leases: Api<Lease>,
    settings: LeaseSettings,
    leader: Arc<AtomicBool>,
    lost: CancellationToken,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(settings.renew_interval);
    let mut last_renewal: Option<tokio::time::Instant> = None;

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        let was_leader = leader.load(Ordering::SeqCst);
        let held = match try_acquire_or_renew(&leases, &settings, Utc::now()).await {
            Ok(()) => true,
            Err(LeaseError::LockHeld { holder }) => {
                debug!(lease = %settings.name, holder = %holder, "Lease held by another replica");
                false
            }
            Err(e) => {
                warn!(lease = %settings.name, error = %e, "Failed to renew lease");
                // Keep acting until the lease could have expired for others
                was_leader
                    && last_renewal.is_some_and(|at| at.elapsed() < settings.lease_duration)
            }
        };

        if held {
            if !was_leader {
                info!(lease = %settings.name, identity = %settings.identity, "Acquired leadership");
            }
            last_renewal = Some(tokio::time::Instant::now());
            leader.store(true, Ordering::SeqCst);
        } else if was_leader {
            error!(lease = %settings.name, identity = %settings.identity, "Lost leadership");
            leader.store(false, Ordering::SeqCst);
            lost.cancel();
            break;
        }
    }
}

async fn try_acquire_or_renew(
    leases: &Api<Lease>,
    settings: &LeaseSettings,
    now: DateTime<Utc>,
) -> Result<(), LeaseError> {
    let Some(existing) = leases.get_opt(&settings.name).await? else {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(settings.name.clone()),
                namespace: Some(settings.namespace.clone()),
                ..Default::default()
            },
            spec: Some(lease_spec(settings, now, now, 0)?),
        };
        return match leases.create(&PostParams::default(), &lease).await {
            Ok(_) => Ok(()),
            Err(KubeError::Api(err)) if err.code == 409 => Err(LeaseError::LockHeld {
                holder: "unknown".to_string(),
            }),
            Err(e) => Err(e.into()),
        };
    };

    let spec = existing.spec.clone().unwrap_or_default();
    let ours = spec.holder_identity.as_deref() == Some(settings.identity.as_str());
    if !ours && !lease_expired(&spec, now) {
        return Err(LeaseError::LockHeld {
            holder: spec.holder_identity.unwrap_or_else(|| "unknown".to_string()),
        });
    }

    let (acquired, transitions) = if ours {
        (spec.acquire_time.map_or(now, |t| t.0), spec.lease_transitions.unwrap_or(0))
    } else {
        (now, spec.lease_transitions.unwrap_or(0) + 1)
    };

    let mut updated = existing;
    updated.spec = Some(lease_spec(settings, acquired, now, transitions)?);

    // resourceVersion from the read makes a concurrent takeover fail with 409
    match leases.replace(&settings.name, &PostParams::default(), &updated).await {
        Ok(_) => Ok(()),
        Err(KubeError::Api(err)) if err.code == 409 => Err(LeaseError::LockHeld {
            holder: "unknown".to_string(),
        }),
        Err(e) => Err(e.into()),
    }
}

fn lease_spec(
    settings: &LeaseSettings,
    acquired: DateTime<Utc>,
    renewed: DateTime<Utc>,
    transitions: i32,
) -> Result<LeaseSpec, LeaseError> {
    let duration = i32::try_from(settings.lease_duration.as_secs())
        .map_err(|_| LeaseError::ValidationError("lease duration too large".to_string()))?;
    Ok(LeaseSpec {
        holder_identity: Some(settings.identity.clone()),
        lease_duration_seconds: Some(duration),
        acquire_time: Some(MicroTime(acquired)),
        renew_time: Some(MicroTime(renewed)),
        lease_transitions: Some(transitions),
        ..Default::default()
    })
}

/// A lease without holder, renew time or duration counts as expired.
fn lease_expired(spec: &LeaseSpec, now: DateTime<Utc>) -> bool {
    if spec.holder_identity.as_deref().map_or(true, str::is_empty) {
        return true;
    }
    let (Some(renew_time), Some(duration_seconds)) = (&spec.renew_time, spec.lease_duration_seconds) else {
        return true;
    };
    renew_time.0 + chrono::Duration::seconds(i64::from(duration_seconds)) < now
}
