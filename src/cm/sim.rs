//! Scripted in-process CM backend.
//!
//! Serves the same role as an in-memory database backend: the full control
//! plane can run against it without a Steam connection. Integration tests
//! script account ownership, depot keys, auth flows and failures through
//! the [`SimConnector`] handle; the daemon falls back to it when built
//! without a real transport.
//!
//! Responses are encoded the way the real CM encodes them (binary VDF for
//! packages, text VDF for apps), so the decoding path is exercised end to
//! end.

use super::{
    AppAccessToken, AuthEvent, CmAuthSession, CmConnector, CmError, CmSession, ConfirmationKind,
    EResult, License, PicsEntry, TokenInfo,
};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};

/// Builds an unsigned JWT auth token with the claims the server reads.
pub fn make_token(steam_id: u64, expires: i64, renewable: bool) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"EdDSA","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(
        serde_json::json!({
            "sub": steam_id.to_string(),
            "exp": expires,
            "per": i64::from(renewable),
        })
        .to_string(),
    );
    format!("{header}.{payload}.c2ln")
}

/// An application granted to a simulated account.
#[derive(Debug, Clone, Default)]
pub struct SimApp {
    pub id: u32,
    pub name: String,
    /// PICS access token; zero means none.
    pub access_token: u64,
    /// When set, the access-token stage reports denial for this app.
    pub access_token_denied: bool,
    /// Depots that carry a `manifests` node in the app info.
    pub depots: Vec<u32>,
    /// Depots without manifests (configs, tools); must be ignored.
    pub plain_depots: Vec<u32>,
    pub workshop_depot: Option<u32>,
}

#[derive(Debug, Clone, Default)]
struct SimPackage {
    app_ids: Vec<u32>,
    depot_ids: Vec<u32>,
}

#[derive(Debug, Default)]
struct SimProfile {
    licenses: Vec<License>,
    packages: HashMap<u32, SimPackage>,
    apps: HashMap<u32, SimApp>,
    revoked: bool,
}

#[derive(Debug, Clone)]
struct SimCredentials {
    password: String,
    steam_id: u64,
    confirmations: Vec<ConfirmationKind>,
    code: Option<String>,
    renewable: bool,
}

#[derive(Default)]
struct Directory {
    profiles: HashMap<u64, SimProfile>,
    /// Tokens this backend treats as valid, by token string.
    tokens: HashMap<String, u64>,
    credentials: HashMap<String, SimCredentials>,
    depot_keys: HashMap<u32, [u8; 32]>,
    /// Remaining injected timeouts per depot key request.
    depot_key_timeouts: HashMap<u32, u32>,
    fail_connect: bool,
    mrc_delay: Option<Duration>,
    token_expiry: i64,
}

/// Handle to the scripted backend; clones share one directory.
#[derive(Clone, Default)]
pub struct SimConnector {
    dir: Arc<Mutex<Directory>>,
    mrc_requests: Arc<AtomicU32>,
}

impl SimConnector {
    pub fn new() -> Self {
        let connector = Self::default();
        // Far-future default expiry for issued tokens
        connector.dir.lock().token_expiry = 4_102_444_800;
        connector
    }

    /// Issues a token the backend will accept for `steam_id`.
    pub fn issue_token(&self, steam_id: u64, expires: i64, renewable: bool) -> String {
        let token = make_token(steam_id, expires, renewable);
        let mut dir = self.dir.lock();
        dir.tokens.insert(token.clone(), steam_id);
        dir.profiles.entry(steam_id).or_default();
        token
    }

    /// Grants `steam_id` a license for `package_id` covering `app`.
    pub fn grant_app(&self, steam_id: u64, package_id: u32, app: SimApp) {
        let mut dir = self.dir.lock();
        let profile = dir.profiles.entry(steam_id).or_default();
        if !profile.licenses.iter().any(|l| l.package_id == package_id) {
            profile.licenses.push(License {
                package_id,
                access_token: u64::from(package_id) << 8,
            });
        }
        let package = profile.packages.entry(package_id).or_default();
        package.app_ids.push(app.id);
        package.depot_ids.extend(&app.depots);
        package.depot_ids.extend(&app.plain_depots);
        profile.apps.insert(app.id, app);
    }

    pub fn set_depot_key(&self, depot_id: u32, key: [u8; 32]) {
        self.dir.lock().depot_keys.insert(depot_id, key);
    }

    /// Makes the next `count` key requests for `depot_id` time out.
    pub fn inject_depot_key_timeouts(&self, depot_id: u32, count: u32) {
        self.dir.lock().depot_key_timeouts.insert(depot_id, count);
    }

    /// Marks the account's tokens invalidated; sign-in reports
    /// access-denied from then on.
    pub fn revoke(&self, steam_id: u64) {
        if let Some(profile) = self.dir.lock().profiles.get_mut(&steam_id) {
            profile.revoked = true;
        }
    }

    pub fn fail_connects(&self, fail: bool) {
        self.dir.lock().fail_connect = fail;
    }

    /// Delays request code responses, e.g. beyond the caller's deadline.
    pub fn set_mrc_delay(&self, delay: Duration) {
        self.dir.lock().mrc_delay = Some(delay);
    }

    pub fn add_credentials(
        &self,
        account_name: &str,
        password: &str,
        steam_id: u64,
        confirmations: Vec<ConfirmationKind>,
        code: Option<&str>,
        renewable: bool,
    ) {
        let mut dir = self.dir.lock();
        dir.profiles.entry(steam_id).or_default();
        dir.credentials.insert(
            account_name.to_owned(),
            SimCredentials {
                password: password.to_owned(),
                steam_id,
                confirmations,
                code: code.map(str::to_owned),
                renewable,
            },
        );
    }

    /// Number of request code fetches the backend has served.
    pub fn mrc_request_count(&self) -> u32 {
        self.mrc_requests.load(Ordering::Relaxed)
    }

    fn issue_token_locked(dir: &mut Directory, steam_id: u64, renewable: bool) -> String {
        let token = make_token(steam_id, dir.token_expiry, renewable);
        dir.tokens.insert(token.clone(), steam_id);
        dir.profiles.entry(steam_id).or_default();
        token
    }
}

#[async_trait]
impl CmConnector for SimConnector {
    async fn connect(&self) -> Result<Box<dyn CmSession>, CmError> {
        if self.dir.lock().fail_connect {
            return Err(CmError::Transport("connection refused".into()));
        }
        Ok(Box::new(SimSession {
            dir: Arc::clone(&self.dir),
            mrc_requests: Arc::clone(&self.mrc_requests),
            steam_id: Mutex::new(None),
            closed: AtomicBool::new(false),
            closed_notify: Notify::new(),
        }))
    }

    async fn connect_auth(
        &self,
    ) -> Result<(Box<dyn CmAuthSession>, mpsc::Receiver<AuthEvent>), CmError> {
        if self.dir.lock().fail_connect {
            return Err(CmError::Transport("connection refused".into()));
        }
        let (tx, rx) = mpsc::channel(8);
        Ok((
            Box::new(SimAuthSession {
                dir: Arc::clone(&self.dir),
                events: Mutex::new(Some(tx)),
                pending: Mutex::new(None),
            }),
            rx,
        ))
    }
}

// =============================================================================
// Content session
// =============================================================================

struct SimSession {
    dir: Arc<Mutex<Directory>>,
    mrc_requests: Arc<AtomicU32>,
    steam_id: Mutex<Option<u64>>,
    closed: AtomicBool,
    closed_notify: Notify,
}

impl SimSession {
    fn signed_in(&self) -> Result<u64, CmError> {
        self.steam_id
            .lock()
            .ok_or_else(|| CmError::Transport("not signed in".into()))
    }
}

#[async_trait]
impl CmSession for SimSession {
    async fn sign_in(&self, token: &str) -> Result<(), CmError> {
        let info =
            TokenInfo::parse(token).ok_or_else(|| CmError::Protocol("malformed token".into()))?;
        let dir = self.dir.lock();
        match dir.tokens.get(token) {
            Some(&steam_id) if steam_id == info.steam_id => {
                if dir.profiles.get(&steam_id).is_some_and(|p| p.revoked) {
                    return Err(CmError::SteamCm(EResult::AccessDenied));
                }
                *self.steam_id.lock() = Some(steam_id);
                Ok(())
            },
            _ => Err(CmError::SteamCm(EResult::AccessDenied)),
        }
    }

    async fn renew_token(&self, token: &str) -> Result<Option<String>, CmError> {
        let info =
            TokenInfo::parse(token).ok_or_else(|| CmError::Protocol("malformed token".into()))?;
        let mut dir = self.dir.lock();
        if !dir.tokens.contains_key(token) {
            return Err(CmError::SteamCm(EResult::AccessDenied));
        }
        if !info.renewable {
            return Ok(None);
        }
        let new_token = SimConnector::issue_token_locked(&mut dir, info.steam_id, true);
        Ok(Some(new_token))
    }

    async fn licenses(&self) -> Result<Vec<License>, CmError> {
        let steam_id = self.signed_in()?;
        let dir = self.dir.lock();
        Ok(dir
            .profiles
            .get(&steam_id)
            .map(|p| p.licenses.clone())
            .unwrap_or_default())
    }

    async fn package_info(&self, packages: &[License]) -> Result<Vec<PicsEntry>, CmError> {
        let steam_id = self.signed_in()?;
        let dir = self.dir.lock();
        let profile = dir.profiles.get(&steam_id);
        Ok(packages
            .iter()
            .map(|license| {
                let package = profile.and_then(|p| p.packages.get(&license.package_id));
                PicsEntry {
                    id: license.package_id,
                    data: Ok(encode_package_vdf(package)),
                }
            })
            .collect())
    }

    async fn app_access_tokens(&self, app_ids: &[u32]) -> Result<Vec<AppAccessToken>, CmError> {
        let steam_id = self.signed_in()?;
        let dir = self.dir.lock();
        let profile = dir.profiles.get(&steam_id);
        Ok(app_ids
            .iter()
            .map(|&app_id| {
                let app = profile.and_then(|p| p.apps.get(&app_id));
                let result = match app {
                    Some(app) if app.access_token_denied => Err(CmError::AccessTokenDenied),
                    Some(app) => Ok(app.access_token),
                    None => Ok(0),
                };
                AppAccessToken { app_id, result }
            })
            .collect())
    }

    async fn app_info(&self, apps: &[(u32, u64)]) -> Result<Vec<PicsEntry>, CmError> {
        let steam_id = self.signed_in()?;
        let dir = self.dir.lock();
        let profile = dir.profiles.get(&steam_id);
        Ok(apps
            .iter()
            .map(|&(app_id, _access_token)| {
                let data = profile
                    .and_then(|p| p.apps.get(&app_id))
                    .map_or_else(|| b"\"appinfo\"\n{\n}\n".to_vec(), encode_app_vdf);
                PicsEntry {
                    id: app_id,
                    data: Ok(data),
                }
            })
            .collect())
    }

    async fn depot_key(&self, _app_id: u32, depot_id: u32) -> Result<[u8; 32], CmError> {
        self.signed_in()?;
        let mut dir = self.dir.lock();
        if let Some(remaining) = dir.depot_key_timeouts.get_mut(&depot_id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(CmError::Timeout);
            }
        }
        dir.depot_keys
            .get(&depot_id)
            .copied()
            .ok_or(CmError::SteamCm(EResult::Blocked))
    }

    async fn manifest_request_code(
        &self,
        _app_id: u32,
        depot_id: u32,
        manifest_id: u64,
    ) -> Result<u64, CmError> {
        self.signed_in()?;
        let delay = self.dir.lock().mrc_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.mrc_requests.fetch_add(1, Ordering::Relaxed);
        Ok(manifest_id
            .rotate_left(17)
            .wrapping_mul(0x9E37_79B9_7F4A_7C15)
            ^ u64::from(depot_id))
    }

    async fn disconnect(&self) {
        self.closed.store(true, Ordering::Release);
        self.closed_notify.notify_waiters();
    }

    async fn disconnected(&self) {
        loop {
            let notified = self.closed_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.closed.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }
}

// =============================================================================
// Auth session
// =============================================================================

struct SimAuthSession {
    dir: Arc<Mutex<Directory>>,
    events: Mutex<Option<mpsc::Sender<AuthEvent>>>,
    /// Credentials awaiting a confirmation code.
    pending: Mutex<Option<SimCredentials>>,
}

impl SimAuthSession {
    async fn emit(&self, event: AuthEvent) {
        let sender = self.events.lock().clone();
        if let Some(sender) = sender {
            let _ = sender.send(event).await;
        }
    }

    async fn complete(&self, creds: &SimCredentials) {
        let token = {
            let mut dir = self.dir.lock();
            SimConnector::issue_token_locked(&mut dir, creds.steam_id, creds.renewable)
        };
        self.emit(AuthEvent::Completed(Ok(token))).await;
    }
}

#[async_trait]
impl CmAuthSession for SimAuthSession {
    async fn begin_credentials(
        &self,
        _device_name: &str,
        account_name: &str,
        password: &str,
    ) -> Result<(), CmError> {
        let creds = self.dir.lock().credentials.get(account_name).cloned();
        match creds {
            Some(creds) if creds.password == password => {
                if creds.confirmations.is_empty() {
                    self.complete(&creds).await;
                } else {
                    let kinds = creds.confirmations.clone();
                    *self.pending.lock() = Some(creds);
                    self.emit(AuthEvent::AwaitingConfirmation(kinds)).await;
                }
            },
            _ => {
                self.emit(AuthEvent::Completed(Err(CmError::SteamCm(
                    EResult::InvalidPassword,
                ))))
                .await;
            },
        }
        Ok(())
    }

    async fn begin_qr(&self, _device_name: &str) -> Result<(), CmError> {
        self.emit(AuthEvent::NewUrl(
            "https://s.team/q/1/2372462679780599330".into(),
        ))
        .await;
        Ok(())
    }

    async fn submit_code(&self, _kind: ConfirmationKind, code: &str) -> Result<(), CmError> {
        let creds = self.pending.lock().take();
        match creds {
            Some(creds) if creds.code.as_deref() == Some(code) => {
                self.complete(&creds).await;
            },
            Some(creds) => {
                *self.pending.lock() = Some(creds);
                self.emit(AuthEvent::Completed(Err(CmError::SteamCm(EResult::Fail))))
                    .await;
            },
            None => {},
        }
        Ok(())
    }

    async fn disconnect(&self) {
        // The bridge observes the dropped sender as a channel close.
        self.events.lock().take();
    }
}

// =============================================================================
// VDF encoding
// =============================================================================

fn encode_package_vdf(package: Option<&SimPackage>) -> Vec<u8> {
    fn id_list(out: &mut Vec<u8>, name: &str, ids: &[u32]) {
        out.push(0x00);
        out.extend_from_slice(name.as_bytes());
        out.push(0);
        for (idx, &id) in ids.iter().enumerate() {
            out.push(0x02);
            out.extend_from_slice(idx.to_string().as_bytes());
            out.push(0);
            out.extend_from_slice(&(id as i32).to_le_bytes());
        }
        out.push(0x08);
    }

    let mut out = Vec::new();
    if let Some(package) = package {
        id_list(&mut out, "appids", &package.app_ids);
        id_list(&mut out, "depotids", &package.depot_ids);
    }
    out.push(0x08);
    out
}

fn encode_app_vdf(app: &SimApp) -> Vec<u8> {
    let mut out = String::new();
    out.push_str("\"appinfo\"\n{\n");
    if !app.name.is_empty() {
        let _ = writeln!(
            out,
            "\t\"common\"\n\t{{\n\t\t\"name\"\t\"{}\"\n\t}}",
            app.name.replace('\\', "\\\\").replace('"', "\\\"")
        );
    }
    out.push_str("\t\"depots\"\n\t{\n");
    if let Some(workshop) = app.workshop_depot {
        let _ = writeln!(out, "\t\t\"workshopdepot\"\t\"{workshop}\"");
    }
    for &depot in &app.depots {
        let _ = writeln!(
            out,
            "\t\t\"{depot}\"\n\t\t{{\n\t\t\t\"manifests\"\n\t\t\t{{\n\t\t\t\t\"public\"\t\"1\"\n\t\t\t}}\n\t\t}}"
        );
    }
    for &depot in &app.plain_depots {
        let _ = writeln!(
            out,
            "\t\t\"{depot}\"\n\t\t{{\n\t\t\t\"config\"\t\"{{}}\"\n\t\t}}"
        );
    }
    out.push_str("\t}\n}\n");
    out.into_bytes()
}
