//! Per-account session management and the catalog builder.
//!
//! Every registered account is driven by one task that owns its upstream
//! CM session: connect, sign in (or renew the token first when it nears
//! expiry), walk the catalog pipeline, then idle until the connection
//! drops, the renewal deadline arrives or the process stops. Invalidated
//! accounts are removed; everything else reconnects.
//!
//! The pipeline folds per-account results into the shared catalog:
//! licenses -> package info -> PICS access tokens -> app info -> depot
//! keys. Partial failures are never surfaced to HTTP clients; they are
//! logged and the session reconnects.

use crate::cm::{self, CmError, CmSession, License, TokenInfo};
use crate::constants::{
    CM_CONNECT_TIMEOUT, CM_DEPOT_KEY_TIMEOUT, CM_LICENSES_TIMEOUT, CM_PICS_TIMEOUT,
    CM_RENEW_TIMEOUT, CM_SIGN_IN_TIMEOUT, DEPOT_KEY_BURST, TOKEN_RENEWAL_LEAD,
};
use crate::manifest;
use crate::persist::LoadedState;
use crate::state::{AccountEntry, AppEntry, RemoveStatus, Status, Ts3State};
use crate::vdf;
use futures::future::join_all;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Why a connection cycle ended.
enum Outcome {
    /// Transient condition; open a fresh connection.
    Reconnect,
    /// Steam invalidated the account's token; erase the account.
    Remove,
    /// The process is stopping.
    Stop,
    /// Unrecoverable upstream failure; fail the whole process.
    Fatal,
}

// =============================================================================
// Bootstrap
// =============================================================================

/// Installs persisted state into the catalog and spawns a session task
/// per account. With no accounts the catalog is emitted immediately and
/// the process goes straight to *running*.
pub fn bootstrap(state: &Arc<Ts3State>, loaded: LoadedState) {
    let mut catalog = state.lock_catalog();
    catalog.timestamp = loaded.timestamp;
    for (token, info) in loaded.accounts {
        catalog
            .accounts
            .insert(info.steam_id, AccountEntry::new(token, info));
    }
    for (app_id, (pics_at, depots)) in loaded.apps {
        let mut app = AppEntry {
            pics_at,
            ..AppEntry::default()
        };
        for depot_id in depots {
            app.depots.entry(depot_id).or_default();
        }
        catalog.apps.insert(app_id, app);
    }
    catalog.depot_keys = loaded.depot_keys;

    if catalog.accounts.is_empty() {
        // Nothing can own the persisted apps; drop them and serve an
        // empty catalog right away.
        if !catalog.apps.is_empty() {
            catalog.apps.clear();
            catalog.catalog_dirty = true;
        }
        manifest::update_manifest(state, &mut catalog);
        drop(catalog);
        state.set_status(Status::Running);
    } else {
        let steam_ids: Vec<u64> = catalog.accounts.keys().copied().collect();
        drop(catalog);
        for steam_id in steam_ids {
            spawn_account_task(state, steam_id);
        }
    }
}

/// Spawns the session task for an account already present in the catalog.
pub fn spawn_account_task(state: &Arc<Ts3State>, steam_id: u64) -> JoinHandle<()> {
    let state = Arc::clone(state);
    tokio::spawn(async move { run_account(&state, steam_id).await })
}

/// Registers a token captured by the sign-in bridge: a new account is
/// emplaced and its task started; an existing account only picks up the
/// token when the new one is renewable and the old one is not.
pub fn register_signin_token(state: &Arc<Ts3State>, token: String) {
    let Some(info) = TokenInfo::parse(&token) else {
        return;
    };
    let mut catalog = state.lock_catalog();
    match catalog.accounts.entry(info.steam_id) {
        std::collections::btree_map::Entry::Vacant(entry) => {
            entry.insert(AccountEntry::new(token, info));
            catalog.state_dirty = true;
            manifest::update_manifest(state, &mut catalog);
            drop(catalog);
            tracing::info!(steam_id = info.steam_id, "Account added");
            spawn_account_task(state, info.steam_id);
        },
        std::collections::btree_map::Entry::Occupied(mut entry) => {
            let account = entry.get_mut();
            if info.renewable && !account.token_info.renewable {
                account.token = token;
                account.token_info = info;
                let cycle = Arc::clone(&account.cycle);
                catalog.state_dirty = true;
                manifest::update_manifest(state, &mut catalog);
                drop(catalog);
                tracing::info!(steam_id = info.steam_id, "Account token replaced");
                // The account task reconnects and signs in with the
                // replacement token.
                cycle.notify_one();
            }
            // Otherwise the account already has an equivalent or better
            // token; discard the new one.
        },
    }
}

// =============================================================================
// Session lifecycle
// =============================================================================

async fn run_account(state: &Arc<Ts3State>, steam_id: u64) {
    loop {
        let Some((token, info, cycle)) = ({
            let catalog = state.lock_catalog();
            catalog.accounts.get(&steam_id).map(|account| {
                (
                    account.token.clone(),
                    account.token_info,
                    Arc::clone(&account.cycle),
                )
            })
        }) else {
            return;
        };

        let session: Arc<dyn CmSession> =
            match cm::with_timeout(CM_CONNECT_TIMEOUT, state.connector.connect()).await {
                Ok(session) => Arc::from(session),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to connect to a Steam CM server");
                    state.fail();
                    return;
                },
            };
        state.connection_opened();
        if let Some(account) = state.lock_catalog().accounts.get_mut(&steam_id) {
            account.session = Some(Arc::clone(&session));
        }

        let outcome = tokio::select! {
            outcome = run_session(state, steam_id, &token, info, session.as_ref(), &cycle) => outcome,
            () = state.shutdown.cancelled() => Outcome::Stop,
        };

        session.disconnect().await;
        if let Some(account) = state.lock_catalog().accounts.get_mut(&steam_id) {
            account.session = None;
        }
        state.connection_closed();

        match outcome {
            Outcome::Reconnect if state.status() != Status::Stopping => {},
            Outcome::Reconnect | Outcome::Stop => return,
            Outcome::Remove => {
                remove_account(state, steam_id);
                return;
            },
            Outcome::Fatal => {
                state.fail();
                return;
            },
        }
    }
}

async fn run_session(
    state: &Arc<Ts3State>,
    steam_id: u64,
    token: &str,
    info: TokenInfo,
    session: &dyn CmSession,
    cycle: &Notify,
) -> Outcome {
    let renew_at = info.expires - TOKEN_RENEWAL_LEAD.as_secs() as i64;
    if info.renewable && chrono::Utc::now().timestamp() >= renew_at {
        // Less than the renewal lead left until expiry; renew before
        // signing in. The fresh connection picks up the new token.
        return renew_token(state, steam_id, token, session).await;
    }

    match cm::with_timeout(CM_SIGN_IN_TIMEOUT, session.sign_in(token)).await {
        Ok(()) => {},
        Err(e) if e.invalidates_account() => {
            tracing::info!(
                steam_id,
                "Auth token for account has been invalidated, removing it"
            );
            return Outcome::Remove;
        },
        Err(e) if e.is_service_unavailable() => return Outcome::Reconnect,
        Err(e) => {
            tracing::error!(steam_id, error = %e, "Failed to sign into account");
            return Outcome::Fatal;
        },
    }

    if let Err(outcome) = build_catalog(state, steam_id, session).await {
        return outcome;
    }

    // Idle: hold the connection until something needs a new one.
    let renewal_due = async {
        if info.renewable {
            let delay = (renew_at - chrono::Utc::now().timestamp()).max(0);
            tokio::time::sleep(Duration::from_secs(delay as u64)).await;
        } else {
            std::future::pending::<()>().await;
        }
    };
    tokio::select! {
        () = renewal_due => renew_token(state, steam_id, token, session).await,
        () = session.disconnected() => Outcome::Reconnect,
        () = cycle.notified() => Outcome::Reconnect,
    }
}

async fn renew_token(
    state: &Arc<Ts3State>,
    steam_id: u64,
    token: &str,
    session: &dyn CmSession,
) -> Outcome {
    match cm::with_timeout(CM_RENEW_TIMEOUT, session.renew_token(token)).await {
        Ok(Some(new_token)) => {
            if let Some(new_info) = TokenInfo::parse(&new_token) {
                let mut catalog = state.lock_catalog();
                if let Some(account) = catalog.accounts.get_mut(&steam_id) {
                    account.token = new_token;
                    account.token_info = new_info;
                }
                catalog.state_dirty = true;
                manifest::update_manifest(state, &mut catalog);
                drop(catalog);
                tracing::info!(steam_id, "Renewed auth token for account");
            }
            Outcome::Reconnect
        },
        Ok(None) => Outcome::Reconnect,
        Err(e) => {
            tracing::error!(steam_id, error = %e, "Failed to renew token for account");
            Outcome::Reconnect
        },
    }
}

/// Erases an invalidated account and everything only it provided.
fn remove_account(state: &Arc<Ts3State>, steam_id: u64) {
    let mut catalog = state.lock_catalog();
    let Some(account) = catalog.accounts.get_mut(&steam_id) else {
        return;
    };
    account.remove = RemoveStatus::PendingRemove;
    let was_ready = account.ready;
    catalog.state_dirty = true;
    catalog.remove_account_refs(steam_id);
    catalog.accounts.remove(&steam_id);
    if was_ready {
        catalog.num_ready_accs -= 1;
    }
    if state.status() == Status::Setup && catalog.num_ready_accs == catalog.accounts.len() {
        // This account was the last one the initial sweep waited for
        manifest::sync_catalog(state, &mut catalog);
        drop(catalog);
        state.set_status(Status::Running);
    } else {
        manifest::update_manifest(state, &mut catalog);
    }
}

/// Marks the account's initial sweep complete, transitioning the process
/// to *running* when it was the last one, or republishes the catalog when
/// already running.
fn mark_ready(state: &Arc<Ts3State>, steam_id: u64) {
    let mut guard = state.lock_catalog();
    let catalog = &mut *guard;
    if state.status() == Status::Running {
        manifest::sync_catalog(state, catalog);
        return;
    }
    let Some(account) = catalog.accounts.get_mut(&steam_id) else {
        return;
    };
    if !account.ready {
        account.ready = true;
        catalog.num_ready_accs += 1;
        if catalog.num_ready_accs == catalog.accounts.len() {
            manifest::sync_catalog(state, catalog);
            state.set_status(Status::Running);
        }
    }
}

// =============================================================================
// Catalog builder pipeline
// =============================================================================

async fn step<T, F>(deadline: Duration, fut: F, steam_id: u64, what: &str) -> Result<T, Outcome>
where
    F: Future<Output = Result<T, CmError>>,
{
    cm::with_timeout(deadline, fut).await.map_err(|e| {
        tracing::error!(steam_id, error = %e, "{what}");
        Outcome::Reconnect
    })
}

async fn build_catalog(
    state: &Arc<Ts3State>,
    steam_id: u64,
    session: &dyn CmSession,
) -> Result<(), Outcome> {
    let licenses = step(
        CM_LICENSES_TIMEOUT,
        session.licenses(),
        steam_id,
        "Failed to get licenses for account",
    )
    .await?;
    if licenses.is_empty() {
        mark_ready(state, steam_id);
        return Ok(());
    }

    let owned_app_ids = collect_package_info(state, steam_id, session, &licenses).await?;

    let tokens = step(
        CM_PICS_TIMEOUT,
        session.app_access_tokens(&owned_app_ids),
        steam_id,
        "Failed to get PICS access tokens for account's apps",
    )
    .await?;
    let mut app_requests = Vec::with_capacity(tokens.len());
    for token in tokens {
        match token.result {
            Ok(access_token) => app_requests.push((token.app_id, access_token)),
            // Some apps are just weird and don't provide an access token
            Err(CmError::AccessTokenDenied) => app_requests.push((token.app_id, 0)),
            Err(e) => {
                tracing::error!(
                    steam_id,
                    app_id = token.app_id,
                    error = %e,
                    "Failed to get PICS access token for app"
                );
                return Err(Outcome::Reconnect);
            },
        }
    }

    let infos = step(
        CM_PICS_TIMEOUT,
        session.app_info(&app_requests),
        steam_id,
        "Failed to get PICS info for account's apps",
    )
    .await?;
    let missing_keys = extract_app_depots(state, steam_id, &app_requests, infos)?;

    mark_ready(state, steam_id);

    fetch_depot_keys(state, steam_id, session, missing_keys).await
}

/// Decodes binary VDF package blobs into the account's candidate depot
/// set and the list of owned apps.
async fn collect_package_info(
    state: &Arc<Ts3State>,
    steam_id: u64,
    session: &dyn CmSession,
    licenses: &[License],
) -> Result<Vec<u32>, Outcome> {
    let packages = step(
        CM_PICS_TIMEOUT,
        session.package_info(licenses),
        steam_id,
        "Failed to get PICS info for account's packages",
    )
    .await?;
    let mut owned_app_ids = BTreeSet::new();
    let mut catalog = state.lock_catalog();
    let Some(account) = catalog.accounts.get_mut(&steam_id) else {
        return Err(Outcome::Stop);
    };
    for package in &packages {
        let data = match &package.data {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(
                    steam_id,
                    package_id = package.id,
                    error = %e,
                    "Failed to get PICS info for package"
                );
                return Err(Outcome::Reconnect);
            },
        };
        let node = vdf::parse_binary(data);
        if let Some(depot_ids) = node.child("depotids") {
            for &depot_id in depot_ids.int_attrs.values() {
                account.depot_ids.insert(depot_id as u32);
            }
        }
        if let Some(app_ids) = node.child("appids") {
            for &app_id in app_ids.int_attrs.values() {
                owned_app_ids.insert(app_id as u32);
                // App IDs double as depot IDs for some products
                account.depot_ids.insert(app_id as u32);
            }
        }
    }
    Ok(owned_app_ids.into_iter().collect())
}

/// Walks text VDF app info blobs: associates depots that carry manifests
/// (and the workshop depot) with this account and collects the depots
/// still missing a decryption key.
fn extract_app_depots(
    state: &Arc<Ts3State>,
    steam_id: u64,
    app_requests: &[(u32, u64)],
    infos: Vec<cm::PicsEntry>,
) -> Result<Vec<(u32, u32)>, Outcome> {
    // Hard per-app failures abort the sweep before anything is applied
    for info in &infos {
        match &info.data {
            Ok(_) | Err(CmError::MissingToken) => {},
            Err(e) => {
                tracing::error!(
                    steam_id,
                    app_id = info.id,
                    error = %e,
                    "Could not get PICS info for app"
                );
                return Err(Outcome::Reconnect);
            },
        }
    }

    let mut missing_keys = BTreeSet::new();
    let mut catalog = state.lock_catalog();
    let catalog = &mut *catalog;
    let Some(account) = catalog.accounts.get_mut(&steam_id) else {
        return Err(Outcome::Stop);
    };
    for info in &infos {
        let Ok(data) = &info.data else {
            continue;
        };
        let Some(root) = std::str::from_utf8(data).ok().and_then(vdf::parse_text) else {
            tracing::error!(
                steam_id,
                app_id = info.id,
                "Failed to parse VDF app info for app"
            );
            return Err(Outcome::Reconnect);
        };
        let Some(depots_node) = root.child("depots") else {
            continue;
        };

        let mut depot_ids = Vec::new();
        if let Some(workshop) = depots_node.attr("workshopdepot") {
            if let Ok(depot_id) = workshop.parse::<u32>() {
                depot_ids.push(depot_id);
            }
        }
        for (name, depot) in &depots_node.children {
            if depot.child("manifests").is_none() {
                continue;
            }
            let Ok(depot_id) = name.parse::<u32>() else {
                continue;
            };
            // Retain only depots the account's licenses cover
            if account.depot_ids.remove(&depot_id) {
                depot_ids.push(depot_id);
            }
        }
        if depot_ids.is_empty() {
            continue;
        }

        let app = match catalog.apps.entry(info.id) {
            std::collections::btree_map::Entry::Vacant(entry) => {
                catalog.catalog_dirty = true;
                entry.insert(AppEntry::default())
            },
            std::collections::btree_map::Entry::Occupied(entry) => entry.into_mut(),
        };
        if let Some(name) = root.child("common").and_then(|common| common.attr("name")) {
            app.name = name.to_owned();
        }
        let pics_at = app_requests
            .iter()
            .find(|&&(app_id, _)| app_id == info.id)
            .map_or(0, |&(_, access_token)| access_token);
        if app.pics_at != pics_at {
            app.pics_at = pics_at;
            catalog.catalog_dirty = true;
        }
        for depot_id in depot_ids {
            let depot = match app.depots.entry(depot_id) {
                std::collections::btree_map::Entry::Vacant(entry) => {
                    catalog.catalog_dirty = true;
                    entry.insert(crate::state::DepotEntry::default())
                },
                std::collections::btree_map::Entry::Occupied(entry) => entry.into_mut(),
            };
            depot.add_owner(steam_id);
            if !catalog.depot_keys.contains_key(&depot_id) {
                missing_keys.insert((info.id, depot_id));
            }
        }
    }
    account.depot_ids.clear();
    Ok(missing_keys.into_iter().collect())
}

/// Requests missing depot keys in bursts of [`DEPOT_KEY_BURST`]; the CM
/// silently drops excess concurrent requests. Timeouts are retried by
/// re-sending the same request; `Blocked` marks a pre-download depot with
/// no key yet and is dropped.
async fn fetch_depot_keys(
    state: &Arc<Ts3State>,
    steam_id: u64,
    session: &dyn CmSession,
    missing: Vec<(u32, u32)>,
) -> Result<(), Outcome> {
    if missing.is_empty() {
        return Ok(());
    }
    for burst in missing.chunks(DEPOT_KEY_BURST) {
        let results = join_all(
            burst
                .iter()
                .map(|&(app_id, depot_id)| fetch_depot_key(session, app_id, depot_id)),
        )
        .await;
        for (&(_, depot_id), result) in burst.iter().zip(results) {
            match result {
                Ok(Some(key)) => {
                    let mut catalog = state.lock_catalog();
                    catalog.depot_keys.insert(depot_id, key);
                    catalog.catalog_dirty = true;
                },
                Ok(None) => {},
                Err(e) => {
                    tracing::error!(
                        steam_id,
                        depot_id,
                        error = %e,
                        "Failed to get decryption key for depot"
                    );
                    return Err(Outcome::Reconnect);
                },
            }
        }
    }
    if state.is_running() {
        let mut catalog = state.lock_catalog();
        manifest::sync_catalog(state, &mut catalog);
    }
    Ok(())
}

async fn fetch_depot_key(
    session: &dyn CmSession,
    app_id: u32,
    depot_id: u32,
) -> Result<Option<[u8; 32]>, CmError> {
    loop {
        match cm::with_timeout(CM_DEPOT_KEY_TIMEOUT, session.depot_key(app_id, depot_id)).await {
            Ok(key) => return Ok(Some(key)),
            // Timeouts are common for depot key requests, just re-send
            Err(e) if e.is_timeout() => {},
            Err(e) if e.is_predownload_depot() => return Ok(None),
            Err(e) => return Err(e),
        }
    }
}
