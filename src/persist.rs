//! `state.json` persistence.
//!
//! The state file carries everything the server wants back after a
//! restart: account auth tokens, the owned app/depot tree and known depot
//! keys. Reads are fatal when the file exists but cannot be parsed;
//! writes are logged and tolerated, since the in-memory state stays
//! authoritative.

use crate::cm::TokenInfo;
use crate::state::{Catalog, RemoveStatus};
use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

/// State recovered from `state.json`.
#[derive(Debug, Default)]
pub struct LoadedState {
    pub timestamp: i64,
    /// Valid, unexpired tokens with their parsed info.
    pub accounts: Vec<(String, TokenInfo)>,
    /// App ID to (PICS access token, depot IDs).
    pub apps: BTreeMap<u32, (u64, Vec<u32>)>,
    pub depot_keys: BTreeMap<u32, [u8; 32]>,
}

/// Loads `state.json` from `dir`. A missing file yields the default
/// (empty) state; a file that exists but does not parse is an error.
/// Unknown keys and malformed entries are skipped.
pub fn load(dir: &Path) -> Result<LoadedState> {
    let path = dir.join("state.json");
    let data = match std::fs::read(&path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!("State file not found, initializing new state");
            return Ok(LoadedState::default());
        },
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read state file {}", path.display()));
        },
    };
    let doc: Value = serde_json::from_slice(&data)
        .with_context(|| format!("Failed to parse state file {}", path.display()))?;
    let doc = doc
        .as_object()
        .context("State file's JSON root is not an object")?;

    let mut loaded = LoadedState {
        timestamp: doc.get("timestamp").and_then(Value::as_i64).unwrap_or(0),
        ..LoadedState::default()
    };

    let now = chrono::Utc::now().timestamp();
    if let Some(accounts) = doc.get("accounts").and_then(Value::as_array) {
        for entry in accounts {
            let Some(token) = entry.as_str() else {
                continue;
            };
            let Some(info) = TokenInfo::parse(token) else {
                tracing::warn!(token, "Auth token is invalid; skipping it");
                continue;
            };
            if info.expires <= now {
                tracing::warn!(
                    steam_id = info.steam_id,
                    "Auth token for account has expired; skipping it"
                );
                continue;
            }
            loaded.accounts.push((token.to_owned(), info));
        }
    }

    if let Some(apps) = doc.get("apps").and_then(Value::as_object) {
        for (id, app) in apps {
            let Ok(app_id) = id.parse::<u32>() else {
                continue;
            };
            let Some(app) = app.as_object() else {
                continue;
            };
            let pics_at = app.get("pics_at").and_then(Value::as_u64).unwrap_or(0);
            let depots: Vec<u32> = app
                .get("depots")
                .and_then(Value::as_array)
                .map(|ids| {
                    ids.iter()
                        .filter_map(|v| v.as_u64().and_then(|id| u32::try_from(id).ok()))
                        .collect()
                })
                .unwrap_or_default();
            loaded.apps.insert(app_id, (pics_at, depots));
        }
    }

    if let Some(keys) = doc.get("depot_keys").and_then(Value::as_object) {
        for (id, b64) in keys {
            let Ok(depot_id) = id.parse::<u32>() else {
                continue;
            };
            let Some(b64) = b64.as_str().filter(|s| s.len() == 44) else {
                continue;
            };
            let Ok(key) = BASE64.decode(b64) else {
                continue;
            };
            let Ok(key) = <[u8; 32]>::try_from(key) else {
                continue;
            };
            loaded.depot_keys.insert(depot_id, key);
        }
    }

    Ok(loaded)
}

/// Writes `state.json` under `dir`, creating the directory tree as
/// needed. Accounts flagged for removal are omitted.
pub fn save(dir: &Path, catalog: &Catalog) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create state directory {}", dir.display()))?;
    let mut out = Vec::with_capacity(4096);
    let mut ser = serde_json::Serializer::new(&mut out);
    StateDoc(catalog)
        .serialize(&mut ser)
        .expect("state JSON serialization is infallible");
    let path = dir.join("state.json");
    std::fs::write(&path, out)
        .with_context(|| format!("Failed to write state file {}", path.display()))
}

struct StateDoc<'a>(&'a Catalog);

impl Serialize for StateDoc<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(4))?;
        map.serialize_entry("timestamp", &self.0.timestamp.max(0))?;
        let tokens: Vec<&str> = self
            .0
            .accounts
            .values()
            .filter(|acc| acc.remove == RemoveStatus::None)
            .map(|acc| acc.token.as_str())
            .collect();
        map.serialize_entry("accounts", &tokens)?;
        map.serialize_entry("apps", &StateApps(self.0))?;
        map.serialize_entry("depot_keys", &StateDepotKeys(self.0))?;
        map.end()
    }
}

struct StateApps<'a>(&'a Catalog);

impl Serialize for StateApps<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.apps.len()))?;
        for (&app_id, app) in &self.0.apps {
            map.serialize_entry(app_id.to_string().as_str(), &StateApp(app))?;
        }
        map.end()
    }
}

struct StateApp<'a>(&'a crate::state::AppEntry);

impl Serialize for StateApp<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let len = if self.0.pics_at == 0 { 1 } else { 2 };
        let mut map = serializer.serialize_map(Some(len))?;
        if self.0.pics_at != 0 {
            map.serialize_entry("pics_at", &self.0.pics_at)?;
        }
        let depots: Vec<u32> = self.0.depots.keys().copied().collect();
        map.serialize_entry("depots", &depots)?;
        map.end()
    }
}

struct StateDepotKeys<'a>(&'a Catalog);

impl Serialize for StateDepotKeys<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.depot_keys.len()))?;
        for (&depot_id, key) in &self.0.depot_keys {
            map.serialize_entry(depot_id.to_string().as_str(), &BASE64.encode(key))?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cm::sim::make_token;
    use crate::state::{AccountEntry, AppEntry, DepotEntry};

    fn far_future() -> i64 {
        chrono::Utc::now().timestamp() + 365 * 24 * 3600
    }

    #[test]
    fn missing_state_file_is_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load(dir.path()).unwrap();
        assert_eq!(loaded.timestamp, 0);
        assert!(loaded.accounts.is_empty());
    }

    #[test]
    fn malformed_state_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("state.json"), b"[1, 2").unwrap();
        assert!(load(dir.path()).is_err());
    }

    #[test]
    fn save_then_load_preserves_everything() {
        let dir = tempfile::tempdir().unwrap();
        let mut catalog = Catalog::default();
        catalog.timestamp = 1_735_689_600;

        let token = make_token(1001, far_future(), true);
        let info = TokenInfo::parse(&token).unwrap();
        catalog
            .accounts
            .insert(1001, AccountEntry::new(token.clone(), info));

        let mut app = AppEntry {
            name: "App".into(),
            pics_at: 55,
            depots: BTreeMap::new(),
        };
        let mut depot = DepotEntry::default();
        depot.add_owner(1001);
        app.depots.insert(731, depot);
        catalog.apps.insert(730, app);
        catalog.depot_keys.insert(731, [3; 32]);

        save(dir.path(), &catalog).unwrap();
        let loaded = load(dir.path()).unwrap();
        assert_eq!(loaded.timestamp, 1_735_689_600);
        assert_eq!(loaded.accounts, vec![(token, info)]);
        assert_eq!(loaded.apps[&730], (55, vec![731]));
        assert_eq!(loaded.depot_keys[&731], [3; 32]);
    }

    #[test]
    fn accounts_flagged_for_removal_are_omitted() {
        let dir = tempfile::tempdir().unwrap();
        let mut catalog = Catalog::default();
        let token = make_token(1001, far_future(), false);
        let mut entry = AccountEntry::new(token.clone(), TokenInfo::parse(&token).unwrap());
        entry.remove = RemoveStatus::PendingRemove;
        catalog.accounts.insert(1001, entry);

        save(dir.path(), &catalog).unwrap();
        let loaded = load(dir.path()).unwrap();
        assert!(loaded.accounts.is_empty());
    }

    #[test]
    fn expired_and_invalid_tokens_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let expired = make_token(1002, chrono::Utc::now().timestamp() - 60, false);
        let valid = make_token(1003, far_future(), false);
        let doc = serde_json::json!({
            "timestamp": 7,
            "accounts": ["garbage", expired, valid, 17],
            "ignored_key": {"x": 1},
        });
        std::fs::write(dir.path().join("state.json"), doc.to_string()).unwrap();
        let loaded = load(dir.path()).unwrap();
        assert_eq!(loaded.accounts.len(), 1);
        assert_eq!(loaded.accounts[0].1.steam_id, 1003);
    }

    #[test]
    fn bad_depot_keys_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let good = BASE64.encode([9u8; 32]);
        let doc = serde_json::json!({
            "depot_keys": {
                "731": good,
                "732": "dG9vc2hvcnQ=",
                "oops": good,
                "733": 12,
            }
        });
        std::fs::write(dir.path().join("state.json"), doc.to_string()).unwrap();
        let loaded = load(dir.path()).unwrap();
        assert_eq!(loaded.depot_keys.len(), 1);
        assert_eq!(loaded.depot_keys[&731], [9; 32]);
    }
}
