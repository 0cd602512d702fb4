//! # Credit Line Manager
//!
//! Owns every [`CreditLine`] and the pledge index (asset → line). Enforces
//! the collateral invariant:
//!
//! ```text
//! Σ CreditBacking locks over collateral assets ≥ ceil(used × ratio)
//! ```
//!
//! ## Locking
//!
//! Lines are locked before assets, never the other way round. `adjust_used`
//! reads collateral with the line held; the ledger's `unlock_balance` goes
//! through [`CollateralGuard::with_line_held`] so it takes the same line
//! mutex first. Pledge index entries are never held while another lock is
//! acquired.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::line::{CreditError, CreditLine, CreditLinePatch, CreditLineStatus, OpenCreditLine};
use crate::clock::SharedClock;
use crate::config::MAX_INTEREST_RATE_BPS;
use crate::ledger::{AssetLedger, CollateralGuard};
use crate::storage::{Collection, Store};
use crate::types::{mul_bps_ceil, AssetId, CreditLineId};

/// Collateral-backed credit limits and their utilization.
pub struct CreditLineManager {
    lines: DashMap<CreditLineId, Arc<Mutex<CreditLine>>>,
    /// asset → the open line it backs.
    pledges: DashMap<AssetId, CreditLineId>,
    ledger: Arc<AssetLedger>,
    store: Store,
    clock: SharedClock,
    collateral_ratio_bps: u32,
}

impl CreditLineManager {
    /// Loads persisted lines and rebuilds the pledge index from the ones
    /// still open.
    pub fn new(
        store: Store,
        clock: SharedClock,
        ledger: Arc<AssetLedger>,
        collateral_ratio_bps: u32,
    ) -> Result<Self, CreditError> {
        let manager = Self {
            lines: DashMap::new(),
            pledges: DashMap::new(),
            ledger,
            store,
            clock,
            collateral_ratio_bps,
        };

        let lines: Vec<CreditLine> = manager.store.load_all(Collection::CreditLines)?;
        for line in lines {
            if !line.status.is_terminal() {
                for asset_id in &line.collateral_asset_ids {
                    manager.pledges.insert(*asset_id, line.id);
                }
            }
            manager.lines.insert(line.id, Arc::new(Mutex::new(line)));
        }
        debug!(
            lines = manager.lines.len(),
            pledged_assets = manager.pledges.len(),
            "credit line manager loaded"
        );
        Ok(manager)
    }

    fn cell(&self, id: &CreditLineId) -> Result<Arc<Mutex<CreditLine>>, CreditError> {
        self.lines
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(CreditError::LineNotFound(*id))
    }

    /// Collateral a line needs at usage `used`.
    pub fn required_collateral(&self, used: u64) -> u64 {
        mul_bps_ceil(used, self.collateral_ratio_bps)
    }

    pub fn collateral_ratio_bps(&self) -> u32 {
        self.collateral_ratio_bps
    }

    // -----------------------------------------------------------------------
    // Validation helpers
    // -----------------------------------------------------------------------

    fn validate_rate(rate_bps: u32) -> Result<(), CreditError> {
        if rate_bps > MAX_INTEREST_RATE_BPS {
            return Err(CreditError::Invalid(format!(
                "interest rate {rate_bps} bps exceeds maximum {MAX_INTEREST_RATE_BPS}"
            )));
        }
        Ok(())
    }

    /// Dedups `ids` and checks each asset exists and belongs to `user_id`.
    fn validate_collateral(
        &self,
        user_id: &str,
        ids: &[AssetId],
    ) -> Result<Vec<AssetId>, CreditError> {
        let mut seen = HashSet::new();
        let unique: Vec<AssetId> = ids.iter().copied().filter(|id| seen.insert(*id)).collect();
        if unique.is_empty() {
            return Err(CreditError::Invalid(
                "at least one collateral asset is required".into(),
            ));
        }
        for asset_id in &unique {
            let owner = self.ledger.owner_of(asset_id)?;
            if owner != user_id {
                return Err(CreditError::Invalid(format!(
                    "asset {asset_id} does not belong to user {user_id}"
                )));
            }
        }
        Ok(unique)
    }

    /// Pledges each asset to `line_id`. On conflict, releases whatever this
    /// call pledged and fails.
    fn reserve_pledges(&self, line_id: CreditLineId, assets: &[AssetId]) -> Result<(), CreditError> {
        let mut reserved = Vec::new();
        for asset_id in assets {
            let conflict = match self.pledges.entry(*asset_id) {
                Entry::Occupied(entry) if *entry.get() != line_id => Some(*entry.get()),
                Entry::Occupied(_) => None,
                Entry::Vacant(vacant) => {
                    vacant.insert(line_id);
                    reserved.push(*asset_id);
                    None
                }
            };
            if let Some(other) = conflict {
                self.release_pledges(line_id, &reserved);
                return Err(CreditError::CollateralAlreadyPledged {
                    asset_id: *asset_id,
                    line_id: other,
                });
            }
        }
        Ok(())
    }

    /// Drops the pledges `line_id` holds on `assets`.
    fn release_pledges(&self, line_id: CreditLineId, assets: &[AssetId]) {
        for asset_id in assets {
            self.pledges.remove_if(asset_id, |_, owner| *owner == line_id);
        }
    }

    fn check_collateral(&self, assets: &[AssetId], used: u64) -> Result<u64, CreditError> {
        let available = self.ledger.collateral_for(assets)?;
        let required = self.required_collateral(used);
        if available < required {
            return Err(CreditError::InsufficientCollateral {
                required,
                available,
            });
        }
        Ok(available)
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    /// Opens a line with `used = 0`.
    ///
    /// Every collateral asset must belong to the user and back no other open
    /// line, and together they must hold some credit-backing collateral.
    pub fn open(&self, request: OpenCreditLine) -> Result<CreditLine, CreditError> {
        let now = self.clock.now();
        if request.user_id.trim().is_empty() {
            return Err(CreditError::Invalid("user id is empty".into()));
        }
        Self::validate_rate(request.interest_rate_bps)?;
        if request.expires_at <= now {
            return Err(CreditError::Invalid("expiry must be in the future".into()));
        }
        let assets = self.validate_collateral(&request.user_id, &request.collateral_asset_ids)?;

        let line = CreditLine {
            id: Uuid::new_v4(),
            user_id: request.user_id,
            limit: request.limit,
            used: 0,
            interest_rate_bps: request.interest_rate_bps,
            collateral_asset_ids: assets.clone(),
            status: CreditLineStatus::Active,
            created_at: now,
            updated_at: now,
            expires_at: request.expires_at,
            closed_at: None,
        };

        // Publish the line locked, so anyone resolving a fresh pledge waits
        // for the outcome instead of finding nothing.
        let cell = Arc::new(Mutex::new(line.clone()));
        let _held = cell.lock();
        self.lines.insert(line.id, Arc::clone(&cell));

        let committed = self
            .reserve_pledges(line.id, &assets)
            .and_then(|()| {
                let available = self.check_collateral(&assets, 0)?;
                if available == 0 {
                    return Err(CreditError::InsufficientCollateral {
                        required: 1,
                        available,
                    });
                }
                Ok(available)
            })
            .and_then(|available| {
                self.store.put(Collection::CreditLines, &line.id, &line)?;
                Ok(available)
            });

        match committed {
            Ok(collateral) => {
                info!(
                    line_id = %line.id,
                    user = %line.user_id,
                    limit = line.limit,
                    collateral,
                    "credit line opened"
                );
                Ok(line)
            }
            Err(e) => {
                self.release_pledges(line.id, &assets);
                self.lines.remove(&line.id);
                warn!(user = %line.user_id, error = %e, "credit line rejected");
                Err(e)
            }
        }
    }

    /// Changes `used` by `delta` (positive draws, negative repays).
    ///
    /// Draws need an active, unexpired line, room under the limit, and
    /// collateral for the new usage. Repayments are accepted while paused.
    pub fn adjust_used(&self, id: &CreditLineId, delta: i64) -> Result<CreditLine, CreditError> {
        if delta == 0 {
            return Err(CreditError::Invalid("delta must be non-zero".into()));
        }
        let cell = self.cell(id)?;
        let mut line = cell.lock();
        let now = self.clock.now();
        let amount = delta.unsigned_abs();

        let new_used = if delta > 0 {
            let new_used = line.check_draw(amount, now)?;
            if let Err(e) = self.check_collateral(&line.collateral_asset_ids, new_used) {
                warn!(line_id = %id, amount, error = %e, "draw rejected");
                return Err(e);
            }
            new_used
        } else {
            line.check_repay(amount)?
        };

        let mut updated = line.clone();
        updated.used = new_used;
        updated.updated_at = now;
        self.store.put(Collection::CreditLines, id, &updated)?;
        *line = updated;

        info!(line_id = %id, delta, used = line.used, limit = line.limit, "credit usage adjusted");
        Ok(line.clone())
    }

    /// Closes a line with nothing outstanding and releases its pledges.
    pub fn close(&self, id: &CreditLineId) -> Result<CreditLine, CreditError> {
        let cell = self.cell(id)?;
        let mut line = cell.lock();
        if line.status.is_terminal() {
            return Err(CreditError::AlreadyClosed(*id));
        }
        if line.used != 0 {
            return Err(CreditError::NonZeroBalance {
                line_id: *id,
                used: line.used,
            });
        }

        let now = self.clock.now();
        let mut updated = line.clone();
        updated.status = CreditLineStatus::Closed;
        updated.closed_at = Some(now);
        updated.updated_at = now;
        self.store.put(Collection::CreditLines, id, &updated)?;
        *line = updated;
        self.release_pledges(*id, &line.collateral_asset_ids);

        info!(line_id = %id, "credit line closed");
        Ok(line.clone())
    }

    /// Edits limit, rate, expiry or collateral set, re-validating
    /// `used ≤ limit` and the collateral invariant against the new values.
    pub fn edit_credit_line(
        &self,
        id: &CreditLineId,
        patch: CreditLinePatch,
    ) -> Result<CreditLine, CreditError> {
        let cell = self.cell(id)?;
        let mut line = cell.lock();
        if line.status.is_terminal() {
            return Err(CreditError::AlreadyClosed(*id));
        }
        let now = self.clock.now();

        let mut updated = line.clone();
        if let Some(rate) = patch.interest_rate_bps {
            Self::validate_rate(rate)?;
            updated.interest_rate_bps = rate;
        }
        if let Some(expires_at) = patch.expires_at {
            if expires_at <= now {
                return Err(CreditError::Invalid("expiry must be in the future".into()));
            }
            updated.expires_at = expires_at;
        }
        if let Some(limit) = patch.limit {
            if limit < updated.used {
                return Err(CreditError::CreditLimitExceeded {
                    line_id: *id,
                    limit,
                    used: updated.used,
                    requested: 0,
                });
            }
            updated.limit = limit;
        }

        let mut added = Vec::new();
        let mut removed = Vec::new();
        if let Some(ids) = &patch.collateral_asset_ids {
            let assets = self.validate_collateral(&line.user_id, ids)?;
            added = assets
                .iter()
                .filter(|a| !line.is_backed_by(a))
                .copied()
                .collect();
            removed = line
                .collateral_asset_ids
                .iter()
                .filter(|a| !assets.contains(a))
                .copied()
                .collect();
            updated.collateral_asset_ids = assets;
        }
        updated.updated_at = now;

        let committed = self
            .reserve_pledges(*id, &added)
            .and_then(|()| self.check_collateral(&updated.collateral_asset_ids, updated.used))
            .and_then(|_| {
                self.store
                    .put(Collection::CreditLines, id, &updated)
                    .map_err(CreditError::from)
            });
        if let Err(e) = committed {
            self.release_pledges(*id, &added);
            warn!(line_id = %id, error = %e, "credit line edit rejected");
            return Err(e);
        }

        *line = updated;
        self.release_pledges(*id, &removed);

        info!(
            line_id = %id,
            limit = line.limit,
            collateral_assets = line.collateral_asset_ids.len(),
            "credit line edited"
        );
        Ok(line.clone())
    }

    /// Pauses or resumes a line.
    pub fn set_status(
        &self,
        id: &CreditLineId,
        status: CreditLineStatus,
    ) -> Result<CreditLine, CreditError> {
        if status.is_terminal() {
            return Err(CreditError::Invalid(
                "use close to close a credit line".into(),
            ));
        }
        let cell = self.cell(id)?;
        let mut line = cell.lock();
        if line.status.is_terminal() {
            return Err(CreditError::AlreadyClosed(*id));
        }
        if line.status == status {
            return Ok(line.clone());
        }

        let mut updated = line.clone();
        updated.status = status;
        updated.updated_at = self.clock.now();
        self.store.put(Collection::CreditLines, id, &updated)?;
        *line = updated;

        info!(line_id = %id, status = ?status, "credit line status changed");
        Ok(line.clone())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// `used / limit × 100`, 0 when the limit is 0.
    pub fn utilization_rate(&self, id: &CreditLineId) -> Result<f64, CreditError> {
        Ok(self.cell(id)?.lock().utilization_pct())
    }

    pub fn available_credit(&self, id: &CreditLineId) -> Result<u64, CreditError> {
        Ok(self.cell(id)?.lock().available())
    }

    pub fn line(&self, id: &CreditLineId) -> Result<CreditLine, CreditError> {
        Ok(self.cell(id)?.lock().clone())
    }

    /// Every line of `user_id`, closed ones included, oldest first.
    pub fn lines_for_user(&self, user_id: &str) -> Vec<CreditLine> {
        let cells: Vec<_> = self
            .lines
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut lines: Vec<CreditLine> = cells
            .iter()
            .map(|cell| cell.lock().clone())
            .filter(|line| line.user_id == user_id)
            .collect();
        lines.sort_by_key(|line| line.created_at);
        lines
    }

    /// Open line `asset_id` currently backs, if any.
    pub fn line_backed_by(&self, asset_id: &AssetId) -> Option<CreditLine> {
        let line_id = self.backing_line(asset_id)?;
        self.line(&line_id).ok()
    }

    /// Lines not yet closed.
    pub fn open_line_count(&self) -> usize {
        let cells: Vec<_> = self
            .lines
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        cells
            .iter()
            .filter(|cell| !cell.lock().status.is_terminal())
            .count()
    }
}

impl CollateralGuard for CreditLineManager {
    fn backing_line(&self, asset_id: &AssetId) -> Option<CreditLineId> {
        self.pledges.get(asset_id).map(|entry| *entry.value())
    }

    fn with_line_held(
        &self,
        line_id: &CreditLineId,
        check: &mut dyn FnMut(&[AssetId], u64),
    ) -> bool {
        let Ok(cell) = self.cell(line_id) else {
            return false;
        };
        let line = cell.lock();
        if line.status.is_terminal() {
            return false;
        }
        check(&line.collateral_asset_ids, self.required_collateral(line.used));
        true
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
