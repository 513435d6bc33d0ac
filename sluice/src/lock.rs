use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::RenewalPolicy;
use crate::error::PipelineError;

/// Proof of ownership for a named lease.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct LeaseToken(pub Uuid);

impl Default for LeaseToken {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseToken {
    /// Create a new lease token using UUID v7.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for LeaseToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A time-bounded exclusive claim on a shard name.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Lease {
    /// Name of the claimed shard or unit.
    pub name: String,
    /// Logical owner; re-acquiring with the same holder extends the lease.
    pub holder: String,
    /// Token that must accompany renew and release.
    pub token: LeaseToken,
    /// Timestamp when the lease expires.
    pub expires_at: DateTime<Utc>,
    /// Number of times this lease has been extended.
    pub renewals: u32,
}

impl Lease {
    pub fn new(
        name: impl Into<String>,
        holder: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            holder: holder.into(),
            token: LeaseToken::new(),
            expires_at: Utc::now() + ttl,
            renewals: 0,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Push the expiry to `now + ttl`.
    pub fn extend(&mut self, now: DateTime<Utc>, ttl: Duration) {
        self.expires_at = now + ttl;
        self.renewals += 1;
    }
}

/// Grants short-lived, renewable, named leases.
///
/// At most one unexpired lease per name exists at any instant as observed
/// by a single store. The store is the only place mutual exclusion is
/// enforced across workers.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Acquire `name` for `holder`.
    ///
    /// Returns `None` when a valid lease is held by a different holder.
    /// Re-acquiring as the current holder succeeds and extends the lease.
    async fn try_acquire(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> anyhow::Result<Option<Lease>>;

    /// Extend a held lease. `false` means ownership is lost.
    async fn renew(
        &self,
        name: &str,
        token: LeaseToken,
        ttl: Duration,
    ) -> anyhow::Result<bool>;

    /// Release a held lease. A mismatched token is a no-op.
    async fn release(&self, name: &str, token: LeaseToken)
    -> anyhow::Result<()>;
}

/// Single-process lock store.
///
/// Expired entries are treated as absent and overwritten on the next
/// acquisition.
#[derive(Debug, Default)]
pub struct InMemoryLockStore {
    leases: Mutex<HashMap<String, Lease>>,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The currently valid lease for `name`, if any.
    pub fn current(&self, name: &str) -> Option<Lease> {
        let now = Utc::now();
        self.leases
            .lock()
            .get(name)
            .filter(|lease| !lease.is_expired_at(now))
            .cloned()
    }

    /// Number of unexpired leases.
    pub fn held_count(&self) -> usize {
        let now = Utc::now();
        self.leases
            .lock()
            .values()
            .filter(|lease| !lease.is_expired_at(now))
            .count()
    }
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn try_acquire(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> anyhow::Result<Option<Lease>> {
        let now = Utc::now();
        let mut leases = self.leases.lock();

        if let Some(existing) = leases.get_mut(name) {
            if !existing.is_expired_at(now) {
                if existing.holder != holder {
                    return Ok(None);
                }
                existing.extend(now, ttl);
                return Ok(Some(existing.clone()));
            }
        }

        let lease = Lease::new(name, holder, ttl);
        leases.insert(name.to_string(), lease.clone());
        Ok(Some(lease))
    }

    async fn renew(
        &self,
        name: &str,
        token: LeaseToken,
        ttl: Duration,
    ) -> anyhow::Result<bool> {
        let now = Utc::now();
        let mut leases = self.leases.lock();
        match leases.get_mut(name) {
            Some(lease) if lease.token == token && !lease.is_expired_at(now) => {
                lease.extend(now, ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(
        &self,
        name: &str,
        token: LeaseToken,
    ) -> anyhow::Result<()> {
        let mut leases = self.leases.lock();
        if leases.get(name).is_some_and(|lease| lease.token == token) {
            leases.remove(name);
        }
        Ok(())
    }
}

/// Keeps a held lease alive in the background while a unit is processed.
///
/// The renewer sleeps until `renew_at_fraction` of the TTL has elapsed (or
/// until `min_margin` before expiry) and renews. A failed renewal flips
/// the lost flag, which stages check before writing or flushing.
pub struct LeaseKeeper {
    lease: Lease,
    store: Arc<dyn LockStore>,
    lost: Arc<AtomicBool>,
    cancel_tx: mpsc::Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl LeaseKeeper {
    pub fn spawn(
        store: Arc<dyn LockStore>,
        lease: Lease,
        ttl: Duration,
        policy: RenewalPolicy,
    ) -> Self {
        let lost = Arc::new(AtomicBool::new(false));
        let (cancel_tx, mut cancel_rx) = mpsc::channel::<()>(1);

        let renewer_store = Arc::clone(&store);
        let renewer_lost = Arc::clone(&lost);
        let name = lease.name.clone();
        let token = lease.token;
        let mut local_expires_at = lease.expires_at;

        let handle = tokio::spawn(async move {
            loop {
                let sleep_dur =
                    renewal_delay(local_expires_at, Utc::now(), ttl, policy);

                tokio::select! {
                    _ = tokio::time::sleep(sleep_dur) => {}
                    _ = cancel_rx.recv() => break,
                }

                match renewer_store.renew(&name, token, ttl).await {
                    Ok(true) => {
                        local_expires_at = Utc::now() + ttl;
                        tracing::trace!(lease = %name, "lease renewed");
                    }
                    Ok(false) => {
                        renewer_lost.store(true, Ordering::SeqCst);
                        tracing::warn!(lease = %name, "lease ownership lost");
                        break;
                    }
                    Err(err) => {
                        renewer_lost.store(true, Ordering::SeqCst);
                        tracing::warn!(
                            lease = %name,
                            error = %err,
                            "lease renewal failed; treating ownership as lost"
                        );
                        break;
                    }
                }
            }
        });

        Self {
            lease,
            store,
            lost,
            cancel_tx,
            handle: Some(handle),
        }
    }

    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Fails with `LostOwnership` once a renewal has failed.
    pub fn ensure_owned(&self) -> Result<(), PipelineError> {
        if self.is_lost() {
            return Err(PipelineError::lost_ownership(&self.lease.name));
        }
        Ok(())
    }

    /// Stop renewing and release the lease if it is still ours.
    pub async fn release(mut self) -> anyhow::Result<()> {
        self.stop().await;
        if self.is_lost() {
            return Ok(());
        }
        self.store.release(&self.lease.name, self.lease.token).await
    }

    /// Stop renewing and let the lease expire on its own.
    pub async fn abandon(mut self) {
        self.stop().await;
    }

    async fn stop(&mut self) {
        let _ = self.cancel_tx.try_send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl std::fmt::Debug for LeaseKeeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseKeeper")
            .field("lease", &self.lease)
            .field("lost", &self.is_lost())
            .field("renewing", &self.handle.is_some())
            .finish()
    }
}

impl Drop for LeaseKeeper {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// How long the renewer sleeps before its next attempt.
pub fn renewal_delay(
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
    ttl: Duration,
    policy: RenewalPolicy,
) -> std::time::Duration {
    let remaining = (expires_at - now).to_std().unwrap_or_default();
    let ttl_total = ttl.to_std().unwrap_or_default();
    let target = ttl_total.mul_f32(1.0 - policy.renew_at_fraction);

    if remaining > target {
        remaining - target
    } else if remaining > policy.min_margin {
        remaining - policy.min_margin
    } else {
        std::time::Duration::ZERO
    }
}
