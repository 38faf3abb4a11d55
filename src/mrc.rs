//! Manifest request code cache and lookup.
//!
//! Request codes refresh on Steam's own cadence (every *4 and *9 minute
//! of the hour), so cached codes are scheduled to drop exactly at the
//! next refresh boundary. Lookups are single-flight: concurrent misses
//! for the same manifest share one upstream request. Accounts holding a
//! license for the depot are asked in round-robin order.

use crate::cm::{self, CmError, CmSession};
use crate::constants::{CM_MRC_TIMEOUT, MRC_CACHE_CAP, MRC_REFRESH_OFFSET, MRC_REFRESH_PERIOD};
use crate::state::{MrcEntry, Ts3State};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::Instant;

/// Failures surfaced to `/mrc` clients.
#[derive(Debug, thiserror::Error)]
pub enum MrcError {
    /// No registered account holds a license for the (app, depot) pair.
    #[error("no account with a license for this depot")]
    Unlicensed,
    /// The CM did not answer within the deadline.
    #[error("CM request timed out")]
    Timeout,
    /// Any other upstream failure.
    #[error("CM request failed: {0}")]
    Upstream(CmError),
}

/// Looks up the request code for a manifest, fetching it from the CM on a
/// cache miss. Returns the code and the remaining cache lifetime, which
/// doubles as the client-facing `max-age`.
pub async fn lookup(
    state: &Arc<Ts3State>,
    app_id: u32,
    depot_id: u32,
    manifest_id: u64,
) -> Result<(u64, u64), MrcError> {
    if let Some(hit) = cache_get(state, manifest_id) {
        return Ok(hit);
    }

    // Single-flight: concurrent misses for one manifest share a cell
    let cell = {
        let mut flights = state.mrc_flights.lock();
        Arc::clone(
            flights
                .entry(manifest_id)
                .or_insert_with(|| Arc::new(OnceCell::new())),
        )
    };
    let result = cell
        .get_or_try_init(|| fetch_and_insert(state, app_id, depot_id, manifest_id))
        .await
        .copied();
    state.mrc_flights.lock().remove(&manifest_id);
    result
}

fn cache_get(state: &Ts3State, manifest_id: u64) -> Option<(u64, u64)> {
    let catalog = state.lock_catalog();
    let entry = catalog.mrcs.get(&manifest_id)?;
    let remaining = entry
        .expires_at
        .saturating_duration_since(Instant::now())
        .as_secs();
    Some((entry.code, remaining))
}

async fn fetch_and_insert(
    state: &Arc<Ts3State>,
    app_id: u32,
    depot_id: u32,
    manifest_id: u64,
) -> Result<(u64, u64), MrcError> {
    // Pick the next owning account, round-robin per depot
    let session: Arc<dyn CmSession> = {
        let mut catalog = state.lock_catalog();
        let catalog = &mut *catalog;
        let depot = catalog
            .apps
            .get_mut(&app_id)
            .and_then(|app| app.depots.get_mut(&depot_id))
            .ok_or(MrcError::Unlicensed)?;
        let steam_id = depot.take_next().ok_or(MrcError::Unlicensed)?;
        catalog
            .accounts
            .get(&steam_id)
            .and_then(|account| account.session.clone())
            .ok_or(MrcError::Upstream(CmError::Transport(
                "account has no live CM session".into(),
            )))?
    };

    let code = cm::with_timeout(
        CM_MRC_TIMEOUT,
        session.manifest_request_code(app_id, depot_id, manifest_id),
    )
    .await
    .map_err(|e| match e {
        CmError::Timeout => MrcError::Timeout,
        other => MrcError::Upstream(other),
    })?;

    let remaining = insert(state, manifest_id, code);
    Ok((code, remaining))
}

/// Seconds until the next Steam refresh boundary: codes refresh every
/// [`MRC_REFRESH_PERIOD`] seconds at [`MRC_REFRESH_OFFSET`] past the
/// boundary.
pub fn seconds_until_refresh(now: i64) -> u64 {
    let now = now.max(0) as u64;
    let period = MRC_REFRESH_PERIOD;
    ((now + 60) / period * period + MRC_REFRESH_OFFSET) - now
}

fn insert(state: &Arc<Ts3State>, manifest_id: u64, code: u64) -> u64 {
    let mut catalog = state.lock_catalog();
    if catalog.mrcs.len() >= MRC_CACHE_CAP {
        // Bounded eviction: drop the smallest manifest ID. Entries age
        // out on the refresh cadence anyway. Dropping the entry cancels
        // its removal job.
        let first = catalog.mrcs.keys().next().copied();
        if let Some(first) = first {
            catalog.mrcs.remove(&first);
        }
    }
    let remaining = seconds_until_refresh(chrono::Utc::now().timestamp());
    let expires_at = Instant::now() + Duration::from_secs(remaining);
    let expiry = {
        let state = Arc::clone(state);
        tokio::spawn(async move {
            tokio::time::sleep_until(expires_at).await;
            state.lock_catalog().mrcs.remove(&manifest_id);
        })
        .abort_handle()
    };
    catalog.mrcs.insert(
        manifest_id,
        MrcEntry {
            code,
            expires_at,
            expiry,
        },
    );
    remaining
}
