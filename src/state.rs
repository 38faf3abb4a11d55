//! Shared server state: the catalog store.
//!
//! One [`Ts3State`] instance is shared by the HTTP server, the sign-in
//! bridge, the per-account session tasks and the request code cache. The
//! catalog mutex linearizes every read and write of accounts, the
//! app/depot tree, depot keys and the MRC cache; process status and the
//! connection counter are plain atomics.

use crate::cm::{CmConnector, CmSession, TokenInfo};
use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Process status
// =============================================================================

/// Global process status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    /// First account sign-ins and initial catalog generation in progress.
    Setup = 0,
    /// The server answers catalog and request code queries.
    Running = 1,
    /// A stop request has been received.
    Stopping = 2,
}

// =============================================================================
// Catalog entities
// =============================================================================

/// Whether an account is slated for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveStatus {
    None,
    /// The account's token was invalidated; its entry is erased once its
    /// session task winds down.
    PendingRemove,
}

/// A registered Steam account and its live session handle.
pub struct AccountEntry {
    /// Authentication token.
    pub token: String,
    /// Information parsed from `token`.
    pub token_info: TokenInfo,
    pub remove: RemoveStatus,
    /// True once the initial catalog sweep for this account completed.
    pub ready: bool,
    /// Candidate depot IDs gathered from package info, consumed while app
    /// info responses arrive.
    pub depot_ids: BTreeSet<u32>,
    /// Live CM session, present while the account is connected. Shared
    /// with the request code path.
    pub session: Option<Arc<dyn CmSession>>,
    /// Nudges the account task to drop its connection and reconnect,
    /// picking up a replaced token.
    pub cycle: Arc<Notify>,
}

impl AccountEntry {
    pub fn new(token: String, token_info: TokenInfo) -> Self {
        Self {
            token,
            token_info,
            remove: RemoveStatus::None,
            ready: false,
            depot_ids: BTreeSet::new(),
            session: None,
            cycle: Arc::new(Notify::new()),
        }
    }
}

/// A depot: which accounts hold a license for it, and the round-robin
/// cursor naming the next account to ask for request codes.
#[derive(Debug, Default, Clone)]
pub struct DepotEntry {
    /// Steam IDs of owning accounts. Non-empty for every entry that
    /// survives a prune.
    pub accounts: Vec<u64>,
    /// Index into `accounts`; always in bounds.
    pub next_acc: usize,
}

impl DepotEntry {
    /// Appends an owner if absent, resetting the cursor to the head.
    pub fn add_owner(&mut self, steam_id: u64) {
        if !self.accounts.contains(&steam_id) {
            self.accounts.push(steam_id);
            self.next_acc = 0;
        }
    }

    /// Removes an owner; resets the cursor when the list changed.
    pub fn remove_owner(&mut self, steam_id: u64) {
        let before = self.accounts.len();
        self.accounts.retain(|&id| id != steam_id);
        if self.accounts.len() != before {
            self.next_acc = 0;
        }
    }

    /// Yields the Steam ID at the cursor and advances it, wrapping at the
    /// end of the list.
    pub fn take_next(&mut self) -> Option<u64> {
        let &steam_id = self.accounts.get(self.next_acc)?;
        self.next_acc = (self.next_acc + 1) % self.accounts.len();
        Some(steam_id)
    }
}

/// A Steam application and its depots.
#[derive(Debug, Default, Clone)]
pub struct AppEntry {
    pub name: String,
    /// PICS access token; zero when the app has none.
    pub pics_at: u64,
    pub depots: BTreeMap<u32, DepotEntry>,
}

/// A cached manifest request code.
pub struct MrcEntry {
    pub code: u64,
    /// When the code is dropped from the cache.
    pub expires_at: tokio::time::Instant,
    /// The scheduled removal job; cancelled on eviction.
    pub expiry: AbortHandle,
}

impl Drop for MrcEntry {
    fn drop(&mut self) {
        self.expiry.abort();
    }
}

// =============================================================================
// Serialized catalog buffers
// =============================================================================

/// A serialized catalog plus its pre-compressed variants. Variants are
/// kept only when strictly smaller than the identity encoding.
#[derive(Debug, Default, Clone)]
pub struct CatalogBuf {
    pub identity: Bytes,
    pub deflate: Option<Bytes>,
    #[cfg(feature = "brotli")]
    pub brotli: Option<Bytes>,
    #[cfg(feature = "zstd")]
    pub zstd: Option<Bytes>,
}

/// The pre-serialized JSON and binary catalog forms. Swapped wholesale
/// behind an `Arc`: an in-flight response keeps its snapshot alive, so a
/// rebuild can never pull buffers out from under a reader.
#[derive(Debug, Default)]
pub struct SerializedCatalog {
    pub json: CatalogBuf,
    pub bin: CatalogBuf,
}

// =============================================================================
// Catalog
// =============================================================================

/// Everything guarded by the catalog mutex.
pub struct Catalog {
    /// Steam accounts the server has access to, by Steam ID.
    pub accounts: BTreeMap<u64, AccountEntry>,
    /// Applications owned by the server's accounts.
    pub apps: BTreeMap<u32, AppEntry>,
    /// Known AES-256 depot decryption keys.
    pub depot_keys: BTreeMap<u32, [u8; 32]>,
    /// Manifest request code cache.
    pub mrcs: BTreeMap<u64, MrcEntry>,
    /// Timestamp (seconds since epoch) of the last catalog update.
    pub timestamp: i64,
    /// Number of accounts whose initial sweep has completed.
    pub num_ready_accs: usize,
    /// The catalog entities changed; serialized forms need a rebuild.
    pub catalog_dirty: bool,
    /// `state.json` needs a rewrite.
    pub state_dirty: bool,
    pub serialized: Arc<SerializedCatalog>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self {
            accounts: BTreeMap::new(),
            apps: BTreeMap::new(),
            depot_keys: BTreeMap::new(),
            mrcs: BTreeMap::new(),
            timestamp: 0,
            num_ready_accs: 0,
            catalog_dirty: false,
            state_dirty: false,
            serialized: Arc::new(SerializedCatalog::default()),
        }
    }
}

impl Catalog {
    /// Erases depots with no owning accounts and apps with no depots.
    /// Marks the catalog dirty when anything was dropped.
    pub fn prune(&mut self) {
        for app in self.apps.values_mut() {
            let before = app.depots.len();
            app.depots.retain(|_, depot| !depot.accounts.is_empty());
            if app.depots.len() != before {
                self.catalog_dirty = true;
            }
        }
        let before = self.apps.len();
        self.apps.retain(|_, app| !app.depots.is_empty());
        if self.apps.len() != before {
            self.catalog_dirty = true;
        }
    }

    /// Drops every depot reference to `steam_id` and prunes the tree.
    pub fn remove_account_refs(&mut self, steam_id: u64) {
        for app in self.apps.values_mut() {
            for depot in app.depots.values_mut() {
                depot.remove_owner(steam_id);
            }
        }
        self.prune();
    }
}

// =============================================================================
// Shared state
// =============================================================================

/// The root shared state object.
pub struct Ts3State {
    status: AtomicU8,
    /// Set when a fatal upstream error should fail the process exit code.
    failed: AtomicBool,
    /// Number of active upstream CM connections.
    num_cm_connections: AtomicU32,
    cm_drained: Notify,
    pub catalog: Mutex<Catalog>,
    /// Cancelled when the process enters `Stopping`.
    pub shutdown: CancellationToken,
    pub connector: Arc<dyn CmConnector>,
    /// Directory holding `state.json`; `None` disables persistence.
    pub state_dir: Option<PathBuf>,
    /// In-flight request code fetches, for single-flight coalescing.
    /// Cells hold (code, initial remaining lifetime).
    pub mrc_flights: Mutex<std::collections::HashMap<u64, Arc<tokio::sync::OnceCell<(u64, u64)>>>>,
}

impl Ts3State {
    pub fn new(connector: Arc<dyn CmConnector>, state_dir: Option<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            status: AtomicU8::new(Status::Setup as u8),
            failed: AtomicBool::new(false),
            num_cm_connections: AtomicU32::new(0),
            cm_drained: Notify::new(),
            catalog: Mutex::new(Catalog::default()),
            shutdown: CancellationToken::new(),
            connector,
            state_dir,
            mrc_flights: Mutex::new(std::collections::HashMap::new()),
        })
    }

    pub fn status(&self) -> Status {
        match self.status.load(Ordering::Relaxed) {
            0 => Status::Setup,
            1 => Status::Running,
            _ => Status::Stopping,
        }
    }

    pub fn set_status(&self, status: Status) {
        self.status.store(status as u8, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.status() == Status::Running
    }

    /// Initiates shutdown: flips the status and wakes everything waiting
    /// on the shutdown token.
    pub fn stop(&self) {
        self.set_status(Status::Stopping);
        self.shutdown.cancel();
    }

    /// Fatal upstream failure: like [`Ts3State::stop`], but the process
    /// exits non-zero.
    pub fn fail(&self) {
        self.failed.store(true, Ordering::Relaxed);
        self.stop();
    }

    pub fn exit_code(&self) -> i32 {
        i32::from(self.failed.load(Ordering::Relaxed))
    }

    pub fn connection_opened(&self) {
        self.num_cm_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        if self.num_cm_connections.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.cm_drained.notify_waiters();
        }
    }

    /// Waits until every CM connection has reported back closed.
    pub async fn wait_cm_drained(&self) {
        loop {
            let notified = self.cm_drained.notified();
            tokio::pin!(notified);
            // Register before checking, or a wakeup can slip past
            notified.as_mut().enable();
            if self.num_cm_connections.load(Ordering::Relaxed) == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn lock_catalog(&self) -> MutexGuard<'_, Catalog> {
        self.catalog.lock()
    }
}
