//! # Asset Ledger
//!
//! Owns every [`AssetAccount`]. Each account sits behind its own mutex in a
//! concurrent map, so operations on different assets never contend and
//! operations on the same asset are serialized.
//!
//! ## Write discipline
//!
//! Every mutation clones the account, applies the change to the clone,
//! persists it, and only then replaces the in-memory copy while the mutex is
//! still held. A failed write leaves the ledger untouched.
//!
//! ## Collateral
//!
//! The ledger does not know about credit lines. `unlock_balance` asks a
//! [`CollateralGuard`] (implemented by the credit manager) whether the asset
//! backs a line, and runs its check while the guard holds that line.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::asset::{
    Asset, AssetAccount, AssetSnapshot, AssetSource, LedgerError, LockPurpose, LockRequest,
    LockedBalance,
};
use crate::clock::SharedClock;
use crate::config::MAX_UNLOCK_ATTEMPTS;
use crate::storage::{Collection, Store};
use crate::types::{AssetId, CreditLineId, LockId, UserId};

// ---------------------------------------------------------------------------
// CollateralGuard
// ---------------------------------------------------------------------------

/// View of credit line pledges used while releasing a lock.
pub trait CollateralGuard: Send + Sync {
    /// Open line the asset currently backs, if any.
    fn backing_line(&self, asset_id: &AssetId) -> Option<CreditLineId>;

    /// Runs `check` with the line's mutex held, passing its collateral asset
    /// ids and the collateral it requires at its current usage. Returns
    /// `false` without calling `check` if the line no longer exists.
    fn with_line_held(
        &self,
        line_id: &CreditLineId,
        check: &mut dyn FnMut(&[AssetId], u64),
    ) -> bool;
}

/// Guard for contexts with no credit lines at all.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoCollateral;

impl CollateralGuard for NoCollateral {
    fn backing_line(&self, _asset_id: &AssetId) -> Option<CreditLineId> {
        None
    }

    fn with_line_held(
        &self,
        _line_id: &CreditLineId,
        _check: &mut dyn FnMut(&[AssetId], u64),
    ) -> bool {
        false
    }
}

/// Line context captured while the guard holds the line.
struct Backing<'a> {
    line_id: CreditLineId,
    collateral_assets: &'a [AssetId],
    required: u64,
}

enum UnlockAttempt {
    /// The pledge moved between lookup and commit.
    Retry,
    Failed(LedgerError),
}

impl From<LedgerError> for UnlockAttempt {
    fn from(e: LedgerError) -> Self {
        UnlockAttempt::Failed(e)
    }
}

type AssetKey = (UserId, String, AssetSource);

// ---------------------------------------------------------------------------
// AssetLedger
// ---------------------------------------------------------------------------

/// Balances and locked portions per asset.
pub struct AssetLedger {
    accounts: DashMap<AssetId, Arc<Mutex<AssetAccount>>>,
    /// (user, ticker, source) → asset id, for upserts.
    by_key: DashMap<AssetKey, AssetId>,
    /// lock id → owning asset id.
    lock_index: DashMap<LockId, AssetId>,
    store: Store,
    clock: SharedClock,
}

impl AssetLedger {
    /// Loads every persisted account from `store`.
    pub fn new(store: Store, clock: SharedClock) -> Result<Self, LedgerError> {
        let ledger = Self {
            accounts: DashMap::new(),
            by_key: DashMap::new(),
            lock_index: DashMap::new(),
            store,
            clock,
        };

        let accounts: Vec<AssetAccount> = ledger.store.load_all(Collection::Assets)?;
        for account in accounts {
            let id = account.asset.id;
            ledger.by_key.insert(
                (
                    account.asset.user_id.clone(),
                    account.asset.ticker.clone(),
                    account.asset.source.clone(),
                ),
                id,
            );
            for lock in &account.locks {
                ledger.lock_index.insert(lock.id, id);
            }
            ledger.accounts.insert(id, Arc::new(Mutex::new(account)));
        }
        debug!(assets = ledger.accounts.len(), "asset ledger loaded");
        Ok(ledger)
    }

    fn cell(&self, asset_id: &AssetId) -> Result<Arc<Mutex<AssetAccount>>, LedgerError> {
        self.accounts
            .get(asset_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(LedgerError::AssetNotFound(*asset_id))
    }

    fn asset_of_lock(&self, lock_id: &LockId) -> Result<AssetId, LedgerError> {
        self.lock_index
            .get(lock_id)
            .map(|entry| *entry.value())
            .ok_or(LedgerError::LockNotFound(*lock_id))
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    /// Creates or replaces the balance snapshot for (user, ticker, source).
    ///
    /// The existing asset id is reused on replace. A snapshot whose balance
    /// is below the asset's locked total is rejected.
    pub fn upsert_asset(&self, snapshot: AssetSnapshot) -> Result<Asset, LedgerError> {
        snapshot.validate()?;
        let ticker = snapshot.normalized_ticker();
        let key = (snapshot.user_id.clone(), ticker.clone(), snapshot.source.clone());
        let now = self.clock.now();

        let existing = match self.by_key.entry(key) {
            Entry::Occupied(entry) => *entry.get(),
            Entry::Vacant(vacant) => {
                let asset = Asset {
                    id: Uuid::new_v4(),
                    user_id: snapshot.user_id,
                    ticker,
                    balance: snapshot.balance,
                    usd_price_micros: snapshot.usd_price_micros,
                    source: snapshot.source,
                    last_updated: now,
                };
                let account = AssetAccount {
                    asset: asset.clone(),
                    locks: Vec::new(),
                };
                self.store.put(Collection::Assets, &asset.id, &account)?;
                self.accounts
                    .insert(asset.id, Arc::new(Mutex::new(account)));
                vacant.insert(asset.id);
                info!(
                    asset_id = %asset.id,
                    user = %asset.user_id,
                    ticker = %asset.ticker,
                    balance = asset.balance,
                    "asset created"
                );
                return Ok(asset);
            }
        };

        let cell = self.cell(&existing)?;
        let mut account = cell.lock();
        let locked = account.locked_total();
        if snapshot.balance < locked {
            warn!(
                asset_id = %existing,
                balance = snapshot.balance,
                locked,
                "balance snapshot below locked total"
            );
            return Err(LedgerError::LockedExceedsBalance {
                asset_id: existing,
                balance: snapshot.balance,
                locked,
            });
        }

        let mut updated = account.clone();
        updated.asset.balance = snapshot.balance;
        updated.asset.usd_price_micros = snapshot.usd_price_micros;
        updated.asset.last_updated = now;
        self.store.put(Collection::Assets, &existing, &updated)?;
        *account = updated;

        debug!(asset_id = %existing, balance = snapshot.balance, "asset snapshot replaced");
        Ok(account.asset.clone())
    }

    /// Locks part of an asset's free balance.
    pub fn lock_balance(
        &self,
        asset_id: &AssetId,
        request: LockRequest,
    ) -> Result<LockedBalance, LedgerError> {
        if request.amount == 0 {
            return Err(LedgerError::ZeroAmount);
        }
        let now = self.clock.now();
        if let Some(unlock_at) = request.unlock_at {
            if unlock_at <= now {
                return Err(LedgerError::Invalid(
                    "unlock date must be in the future".into(),
                ));
            }
        }

        let cell = self.cell(asset_id)?;
        let mut account = cell.lock();
        let free = account.free_balance();
        if request.amount > free {
            warn!(asset_id = %asset_id, free, requested = request.amount, "lock rejected");
            return Err(LedgerError::InsufficientBalance {
                asset_id: *asset_id,
                free,
                requested: request.amount,
            });
        }

        let lock = LockedBalance {
            id: Uuid::new_v4(),
            asset_id: *asset_id,
            amount: request.amount,
            purpose: request.purpose,
            target_chain: request.target_chain,
            locked_at: now,
            unlock_at: request.unlock_at,
        };
        let mut updated = account.clone();
        updated.locks.push(lock.clone());
        self.store.put(Collection::Assets, asset_id, &updated)?;
        *account = updated;
        self.lock_index.insert(lock.id, *asset_id);

        info!(
            lock_id = %lock.id,
            asset_id = %asset_id,
            amount = lock.amount,
            purpose = lock.purpose.label(),
            "balance locked"
        );
        Ok(lock)
    }

    /// Removes a lock.
    ///
    /// A credit-backing lock on an asset pledged to a line is only released
    /// if the line's remaining collateral still covers its usage. The check
    /// runs with the line held, so `adjust_used` cannot raise usage in
    /// between.
    pub fn unlock_balance(
        &self,
        lock_id: &LockId,
        guard: &dyn CollateralGuard,
    ) -> Result<LockedBalance, LedgerError> {
        for attempt in 1..=MAX_UNLOCK_ATTEMPTS {
            let asset_id = self.asset_of_lock(lock_id)?;

            let outcome = match guard.backing_line(&asset_id) {
                None => self.try_unlock(lock_id, &asset_id, None, guard),
                Some(line_id) => {
                    let mut result = None;
                    let held = guard.with_line_held(&line_id, &mut |assets, required| {
                        let backing = Backing {
                            line_id,
                            collateral_assets: assets,
                            required,
                        };
                        result = Some(self.try_unlock(lock_id, &asset_id, Some(backing), guard));
                    });
                    if held {
                        result.unwrap_or(Err(UnlockAttempt::Retry))
                    } else {
                        Err(UnlockAttempt::Retry)
                    }
                }
            };

            match outcome {
                Ok(lock) => return Ok(lock),
                Err(UnlockAttempt::Failed(e)) => return Err(e),
                Err(UnlockAttempt::Retry) => {
                    debug!(lock_id = %lock_id, attempt, "collateral pledge moved, retrying unlock");
                }
            }
        }

        warn!(lock_id = %lock_id, "unlock gave up after repeated pledge changes");
        Err(LedgerError::Conflict {
            lock_id: *lock_id,
            attempts: MAX_UNLOCK_ATTEMPTS,
        })
    }

    fn try_unlock(
        &self,
        lock_id: &LockId,
        asset_id: &AssetId,
        backing: Option<Backing<'_>>,
        guard: &dyn CollateralGuard,
    ) -> Result<LockedBalance, UnlockAttempt> {
        // Other pledged assets can't lose credit-backing locks while we hold
        // the line, so reading them before the asset lock is safe.
        let mut others: u64 = 0;
        if let Some(b) = &backing {
            for id in b.collateral_assets.iter().filter(|id| *id != asset_id) {
                others = others.saturating_add(self.credit_backing_total(id)?);
            }
        }

        let cell = self.cell(asset_id)?;
        let mut account = cell.lock();

        if guard.backing_line(asset_id) != backing.as_ref().map(|b| b.line_id) {
            return Err(UnlockAttempt::Retry);
        }

        let pos = account
            .locks
            .iter()
            .position(|l| l.id == *lock_id)
            .ok_or(LedgerError::LockNotFound(*lock_id))?;

        if let Some(b) = &backing {
            let lock = &account.locks[pos];
            if lock.purpose == LockPurpose::CreditBacking {
                let remaining = others
                    .saturating_add(account.credit_backing_total())
                    .saturating_sub(lock.amount);
                if remaining < b.required {
                    warn!(
                        lock_id = %lock_id,
                        line_id = %b.line_id,
                        required = b.required,
                        remaining,
                        "unlock rejected, lock backs outstanding credit"
                    );
                    return Err(LedgerError::LockInUse {
                        lock_id: *lock_id,
                        line_id: b.line_id,
                        required: b.required,
                        remaining,
                    }
                    .into());
                }
            }
        }

        let mut updated = account.clone();
        let removed = updated.locks.remove(pos);
        self.store
            .put(Collection::Assets, asset_id, &updated)
            .map_err(LedgerError::from)?;
        *account = updated;
        self.lock_index.remove(lock_id);

        info!(
            lock_id = %lock_id,
            asset_id = %asset_id,
            amount = removed.amount,
            "balance unlocked"
        );
        Ok(removed)
    }

    /// Applies a confirmed outgoing transfer. Locked funds cannot be spent.
    pub fn debit(&self, asset_id: &AssetId, amount: u64) -> Result<Asset, LedgerError> {
        if amount == 0 {
            return Err(LedgerError::ZeroAmount);
        }
        let cell = self.cell(asset_id)?;
        let mut account = cell.lock();
        let free = account.free_balance();
        if amount > free {
            warn!(asset_id = %asset_id, free, requested = amount, "debit rejected");
            return Err(LedgerError::InsufficientBalance {
                asset_id: *asset_id,
                free,
                requested: amount,
            });
        }

        let mut updated = account.clone();
        updated.asset.balance -= amount;
        updated.asset.last_updated = self.clock.now();
        self.store.put(Collection::Assets, asset_id, &updated)?;
        *account = updated;

        info!(asset_id = %asset_id, amount, balance = account.asset.balance, "asset debited");
        Ok(account.asset.clone())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// `balance − Σ locks`.
    pub fn free_balance(&self, asset_id: &AssetId) -> Result<u64, LedgerError> {
        Ok(self.cell(asset_id)?.lock().free_balance())
    }

    pub fn asset(&self, asset_id: &AssetId) -> Result<Asset, LedgerError> {
        Ok(self.cell(asset_id)?.lock().asset.clone())
    }

    /// Asset plus locks, as one snapshot.
    pub fn account(&self, asset_id: &AssetId) -> Result<AssetAccount, LedgerError> {
        Ok(self.cell(asset_id)?.lock().clone())
    }

    /// Every asset owned by `user_id`, ordered by ticker.
    pub fn assets_for_user(&self, user_id: &str) -> Vec<Asset> {
        let cells: Vec<_> = self
            .accounts
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut assets: Vec<Asset> = cells
            .iter()
            .map(|cell| cell.lock().asset.clone())
            .filter(|asset| asset.user_id == user_id)
            .collect();
        assets.sort_by(|a, b| a.ticker.cmp(&b.ticker).then(a.id.cmp(&b.id)));
        assets
    }

    pub fn locks_for_asset(&self, asset_id: &AssetId) -> Result<Vec<LockedBalance>, LedgerError> {
        Ok(self.cell(asset_id)?.lock().locks.clone())
    }

    pub fn lock(&self, lock_id: &LockId) -> Result<LockedBalance, LedgerError> {
        let asset_id = self.asset_of_lock(lock_id)?;
        self.cell(&asset_id)?
            .lock()
            .locks
            .iter()
            .find(|l| l.id == *lock_id)
            .cloned()
            .ok_or(LedgerError::LockNotFound(*lock_id))
    }

    /// Owner of an asset.
    pub fn owner_of(&self, asset_id: &AssetId) -> Result<UserId, LedgerError> {
        Ok(self.cell(asset_id)?.lock().asset.user_id.clone())
    }

    /// Sum of credit-backing locks on one asset.
    pub fn credit_backing_total(&self, asset_id: &AssetId) -> Result<u64, LedgerError> {
        Ok(self.cell(asset_id)?.lock().credit_backing_total())
    }

    /// Sum of credit-backing locks over `asset_ids`, visited in id order.
    pub fn collateral_for(&self, asset_ids: &[AssetId]) -> Result<u64, LedgerError> {
        let mut ids = asset_ids.to_vec();
        ids.sort();
        ids.dedup();
        let mut total: u64 = 0;
        for id in &ids {
            total = total.saturating_add(self.credit_backing_total(id)?);
        }
        Ok(total)
    }

    /// Number of assets tracked.
    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
