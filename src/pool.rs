//! Credentialed accounts shared by one pooled backend.
//!
//! Instances live in a slot arena for the lifetime of the process. The set of
//! instances that are not checked out is kept as a sorted index of
//! `(used, id)` pairs, so the head is always the least-used account. Tokens
//! and quota counters are written back into the slot on checkin.

use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::BackendError;

pub type InstanceId = usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub user: String,
    pub secret: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tokens {
    /// Identity token from the sign-in leg; also used for usage queries.
    pub id_token: String,
    /// Service-scoped token used for chat calls.
    pub access_token: String,
}

impl Tokens {
    pub fn is_empty(&self) -> bool {
        self.id_token.is_empty() || self.access_token.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Quota {
    pub used: u64,
    pub limit: u64,
}

impl Quota {
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.used)
    }
}

/// Upstream calls needed to keep an instance usable.
#[async_trait]
pub trait InstanceAuthority: Send + Sync {
    /// Exchanges account credentials for a short-lived identity token.
    async fn sign_in(&self, account: &Account) -> Result<String, BackendError>;
    /// Exchanges the identity token for a service access token.
    async fn exchange(&self, id_token: &str) -> Result<String, BackendError>;
    async fn usage(&self, tokens: &Tokens) -> Result<Quota, BackendError>;
}

#[derive(Debug, Clone, Error)]
pub enum PoolError {
    #[error("no instance available")]
    Empty,
    #[error("instance quota exhausted ({used}/{limit})")]
    Exhausted { used: u64, limit: u64 },
    #[error("instance refresh failed: {0}")]
    Refresh(BackendError),
}

#[derive(Debug)]
struct Slot {
    account: Account,
    tokens: Tokens,
    quota: Quota,
    checked_out: bool,
    /// Last refresh failed; the slot sorts behind every healthy one.
    failed: bool,
}

impl Slot {
    fn key(&self, id: InstanceId) -> (u64, InstanceId) {
        if self.failed {
            (u64::MAX, id)
        } else {
            (self.quota.used, id)
        }
    }
}

#[derive(Debug)]
struct Checkout {
    id: InstanceId,
    account: Account,
    tokens: Tokens,
    quota: Quota,
    failed: bool,
}

#[derive(Debug, Default)]
struct PoolState {
    slots: Vec<Slot>,
    available: BTreeSet<(u64, InstanceId)>,
}

impl PoolState {
    fn take_head(&mut self, min_headroom: u64) -> Result<Checkout, PoolError> {
        let &(key, id) = self.available.first().ok_or(PoolError::Empty)?;
        let slot = &mut self.slots[id];
        if !slot.failed && slot.quota.limit > 0 && slot.quota.remaining() < min_headroom {
            return Err(PoolError::Exhausted {
                used: slot.quota.used,
                limit: slot.quota.limit,
            });
        }
        self.available.remove(&(key, id));
        slot.checked_out = true;
        Ok(Checkout {
            id,
            account: slot.account.clone(),
            tokens: slot.tokens.clone(),
            quota: slot.quota,
            failed: slot.failed,
        })
    }

    fn take(&mut self, id: InstanceId) -> Option<Checkout> {
        let slot = self.slots.get_mut(id)?;
        if slot.checked_out {
            return None;
        }
        let key = slot.key(id);
        slot.checked_out = true;
        let checkout = Checkout {
            id,
            account: slot.account.clone(),
            tokens: slot.tokens.clone(),
            quota: slot.quota,
            failed: slot.failed,
        };
        self.available.remove(&key);
        Some(checkout)
    }

    fn put_back(&mut self, id: InstanceId, tokens: Tokens, quota: Quota, failed: bool) {
        let Some(slot) = self.slots.get_mut(id) else {
            return;
        };
        slot.tokens = tokens;
        slot.quota = quota;
        slot.failed = failed;
        slot.checked_out = false;
        let key = slot.key(id);
        self.available.insert(key);
    }
}

pub struct InstancePool {
    name: String,
    authority: Arc<dyn InstanceAuthority>,
    min_headroom: u64,
    state: Mutex<PoolState>,
}

impl InstancePool {
    pub fn new(
        name: impl Into<String>,
        authority: Arc<dyn InstanceAuthority>,
        accounts: impl IntoIterator<Item = Account>,
    ) -> Arc<Self> {
        Self::with_min_headroom(name, authority, accounts, 0)
    }

    /// Like [`InstancePool::new`], but checkout refuses the least-used
    /// instance when it has fewer than `min_headroom` calls left of a known
    /// limit.
    pub fn with_min_headroom(
        name: impl Into<String>,
        authority: Arc<dyn InstanceAuthority>,
        accounts: impl IntoIterator<Item = Account>,
        min_headroom: u64,
    ) -> Arc<Self> {
        let slots = accounts
            .into_iter()
            .map(|account| Slot {
                account,
                tokens: Tokens::default(),
                quota: Quota::default(),
                checked_out: false,
                failed: false,
            })
            .collect::<Vec<_>>();
        let available = (0..slots.len()).map(|id| (0, id)).collect();
        Arc::new(Self {
            name: name.into(),
            authority,
            min_headroom,
            state: Mutex::new(PoolState { slots, available }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn min_headroom(&self) -> u64 {
        self.min_headroom
    }

    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn available(&self) -> usize {
        self.lock().available.len()
    }

    /// Current quota of every instance, checked out or not.
    pub fn snapshot(&self) -> Vec<(InstanceId, Quota)> {
        self.lock()
            .slots
            .iter()
            .enumerate()
            .map(|(id, slot)| (id, slot.quota))
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lease(self: &Arc<Self>, checkout: Checkout) -> InstanceLease {
        InstanceLease {
            pool: Arc::clone(self),
            id: checkout.id,
            account: checkout.account,
            tokens: checkout.tokens,
            quota: checkout.quota,
            failed: checkout.failed,
        }
    }

    /// Hands out the least-used instance with fresh usage counters.
    ///
    /// An instance without tokens, or whose usage query fails, gets exactly
    /// one refresh. An instance whose refresh fails is held aside while the
    /// next one is tried, then goes back into the pool behind every healthy
    /// instance. The checkout fails only when no instance is left.
    pub async fn checkout(self: &Arc<Self>) -> Result<InstanceLease, PoolError> {
        let mut rejected = Vec::new();
        let mut last_error = None;

        loop {
            // Rejected leases lock the pool on drop, so the guard must be
            // released before any early return.
            let head = self.lock().take_head(self.min_headroom);
            let checkout = match head {
                Ok(checkout) => checkout,
                Err(PoolError::Empty) => {
                    return Err(match last_error {
                        Some(error) => PoolError::Refresh(error),
                        None => PoolError::Empty,
                    });
                }
                Err(error) => return Err(error),
            };
            let mut lease = self.lease(checkout);
            let id = lease.id;

            let fresh = if lease.tokens.is_empty() {
                false
            } else {
                match self.authority.usage(&lease.tokens).await {
                    Ok(quota) => {
                        lease.quota = quota;
                        lease.failed = false;
                        true
                    }
                    Err(error) => {
                        debug!(pool = %self.name, instance = id, error = %error, "usage query failed");
                        false
                    }
                }
            };

            if !fresh {
                if let Err(error) = self.refresh(&mut lease).await {
                    warn!(pool = %self.name, instance = id, user = %lease.account.user, error = %error, "instance refresh failed");
                    lease.failed = true;
                    rejected.push(lease);
                    last_error = Some(error);
                    continue;
                }
            }

            debug!(
                pool = %self.name,
                instance = id,
                used = lease.quota.used,
                limit = lease.quota.limit,
                skipped = rejected.len(),
                "instance checked out"
            );
            return Ok(lease);
        }
    }

    /// Runs both sign-in legs, then reloads usage with the new tokens.
    pub async fn refresh(&self, lease: &mut InstanceLease) -> Result<(), BackendError> {
        let tokens = self.authenticate(&lease.account).await?;
        let quota = self.authority.usage(&tokens).await?;
        lease.tokens = tokens;
        lease.quota = quota;
        lease.failed = false;
        info!(pool = %self.name, instance = lease.id, used = quota.used, limit = quota.limit, "instance refreshed");
        Ok(())
    }

    /// Best-effort usage reload after a call; failures keep the old counters.
    pub async fn sync_usage(&self, lease: &mut InstanceLease) {
        match self.authority.usage(&lease.tokens).await {
            Ok(quota) => lease.quota = quota,
            Err(error) => {
                debug!(pool = %self.name, instance = lease.id, error = %error, "post-call usage query failed")
            }
        }
    }

    async fn authenticate(&self, account: &Account) -> Result<Tokens, BackendError> {
        let id_token = self.authority.sign_in(account).await?;
        let access_token = self.authority.exchange(&id_token).await?;
        Ok(Tokens {
            id_token,
            access_token,
        })
    }

    /// Checks every idle instance once, refreshing those with missing or
    /// rejected tokens. Instances checked out by a request are skipped.
    pub async fn revalidate(self: &Arc<Self>) {
        let idle = self
            .lock()
            .available
            .iter()
            .map(|&(_, id)| id)
            .collect::<Vec<_>>();

        for id in idle {
            let taken = self.lock().take(id);
            let Some(checkout) = taken else {
                continue;
            };
            let mut lease = self.lease(checkout);
            if !lease.tokens.is_empty() {
                if let Ok(quota) = self.authority.usage(&lease.tokens).await {
                    lease.quota = quota;
                    lease.failed = false;
                    debug!(pool = %self.name, instance = id, used = quota.used, limit = quota.limit, "instance still valid");
                    continue;
                }
            }
            if let Err(error) = self.refresh(&mut lease).await {
                lease.failed = true;
                warn!(pool = %self.name, instance = id, user = %lease.account.user, error = %error, "background refresh failed");
            }
        }
    }

    /// Revalidates immediately, then on every tick until `shutdown` fires.
    pub fn spawn_revalidation(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => pool.revalidate().await,
                }
            }
            debug!(pool = %pool.name, "revalidation stopped");
        })
    }

    fn checkin(&self, id: InstanceId, tokens: Tokens, quota: Quota, failed: bool) {
        self.lock().put_back(id, tokens, quota, failed);
    }
}

/// Exclusive use of one instance. Dropping the lease checks it back in.
pub struct InstanceLease {
    pool: Arc<InstancePool>,
    id: InstanceId,
    account: Account,
    tokens: Tokens,
    quota: Quota,
    failed: bool,
}

impl InstanceLease {
    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn tokens(&self) -> &Tokens {
        &self.tokens
    }

    pub fn quota(&self) -> Quota {
        self.quota
    }

    pub fn set_quota(&mut self, quota: Quota) {
        self.quota = quota;
    }
}

impl std::fmt::Debug for InstanceLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceLease")
            .field("pool", &self.pool.name)
            .field("id", &self.id)
            .field("user", &self.account.user)
            .field("quota", &self.quota)
            .field("failed", &self.failed)
            .finish()
    }
}

impl Drop for InstanceLease {
    fn drop(&mut self) {
        self.pool
            .checkin(self.id, std::mem::take(&mut self.tokens), self.quota, self.failed);
    }
}
