//! Steam CM provider interface.
//!
//! The actual Steam Content-Manager client is an external collaborator;
//! this module defines the traits the control plane drives it through, the
//! error model used to classify upstream failures, and auth token parsing.
//! [`sim`] provides a scripted in-process backend for tests and for running
//! the daemon without a real Steam link.

pub mod sim;
pub mod token;

pub use token::TokenInfo;

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;

// =============================================================================
// Error model
// =============================================================================

/// Steam EResult codes the control plane reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum EResult {
    Fail = 2,
    InvalidPassword = 5,
    AccessDenied = 15,
    Timeout = 16,
    ServiceUnavailable = 20,
    Blocked = 40,
    InvalidSignature = 75,
}

/// Errors reported by the CM provider.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CmError {
    /// The underlying connection failed or dropped mid-request.
    #[error("CM transport error: {0}")]
    Transport(String),

    /// Steam rejected the request with the given EResult.
    #[error("Steam CM rejected the request: {0:?}")]
    SteamCm(EResult),

    /// The request did not complete within its deadline.
    #[error("CM request timed out")]
    Timeout,

    /// Steam does not hand out a PICS access token for this app.
    #[error("PICS access token denied")]
    AccessTokenDenied,

    /// A PICS request was made without a required access token.
    #[error("PICS access token missing")]
    MissingToken,

    /// The response could not be decoded.
    #[error("CM protocol error: {0}")]
    Protocol(String),
}

impl CmError {
    /// Whether this error means Steam has invalidated the account's auth
    /// token, so the account must be removed.
    pub fn invalidates_account(&self) -> bool {
        matches!(
            self,
            Self::SteamCm(EResult::AccessDenied | EResult::InvalidSignature)
        )
    }

    /// Whether this is a transient CM-side outage worth a plain reconnect.
    pub fn is_service_unavailable(&self) -> bool {
        matches!(self, Self::SteamCm(EResult::ServiceUnavailable))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// Whether a depot key request failed only because the depot is not
    /// released yet. Only the CM-reported `Blocked` result qualifies;
    /// `Blocked` from any other error class does not.
    pub fn is_predownload_depot(&self) -> bool {
        matches!(self, Self::SteamCm(EResult::Blocked))
    }

    /// Numeric error class for the sign-in wire protocol.
    pub fn type_code(&self) -> i32 {
        match self {
            Self::Transport(_) => 1,
            Self::SteamCm(_) => 2,
            Self::Timeout | Self::AccessTokenDenied | Self::MissingToken => 3,
            Self::Protocol(_) => 4,
        }
    }

    /// Numeric primary code for the sign-in wire protocol.
    pub fn primary_code(&self) -> i32 {
        match self {
            Self::Transport(_) => 1,
            Self::SteamCm(_) => 2,
            Self::Timeout => 3,
            Self::AccessTokenDenied => 4,
            Self::MissingToken => 5,
            Self::Protocol(_) => 6,
        }
    }

    /// Auxiliary code (the EResult) for the sign-in wire protocol, when
    /// the error class carries one.
    pub fn auxiliary_code(&self) -> Option<i32> {
        match self {
            Self::SteamCm(eresult) => Some(*eresult as i32),
            _ => None,
        }
    }
}

/// Runs a CM request with the deadline the control plane assigns to it.
pub async fn with_timeout<T, F>(deadline: Duration, fut: F) -> Result<T, CmError>
where
    F: Future<Output = Result<T, CmError>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(CmError::Timeout),
    }
}

// =============================================================================
// Request/response data
// =============================================================================

/// A Steam license: what a package an account owns, plus its access token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct License {
    pub package_id: u32,
    pub access_token: u64,
}

/// One entry of a PICS product-info response. `data` is a VDF blob:
/// binary VDF for packages, text VDF for apps.
#[derive(Debug)]
pub struct PicsEntry {
    pub id: u32,
    pub data: Result<Vec<u8>, CmError>,
}

/// One entry of a PICS access-token response.
#[derive(Debug)]
pub struct AppAccessToken {
    pub app_id: u32,
    pub result: Result<u64, CmError>,
}

/// Confirmation channels Steam may offer during interactive sign-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationKind {
    Device,
    GuardCode,
    Email,
}

impl ConfirmationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Device => "device",
            Self::GuardCode => "guard_code",
            Self::Email => "email",
        }
    }
}

/// Events emitted by an interactive auth session.
#[derive(Debug)]
pub enum AuthEvent {
    /// A (new) QR code URL to present to the user.
    NewUrl(String),
    /// Steam awaits one of the listed confirmations.
    AwaitingConfirmation(Vec<ConfirmationKind>),
    /// The exchange finished; on success carries the auth token.
    Completed(Result<String, CmError>),
}

// =============================================================================
// Provider traits
// =============================================================================

/// An authenticated content session with a Steam CM server.
///
/// All requests are asynchronous; deadlines are applied by the caller via
/// [`with_timeout`]. Requests on one session are totally ordered by the
/// caller; the provider may multiplex them on the wire.
#[async_trait]
pub trait CmSession: Send + Sync {
    /// Signs the session in with a stored auth token.
    async fn sign_in(&self, token: &str) -> Result<(), CmError>;

    /// Asks Steam to renew a renewable auth token. `None` means Steam
    /// declined to issue a new one at this time.
    async fn renew_token(&self, token: &str) -> Result<Option<String>, CmError>;

    /// Lists the licenses the signed-in account owns.
    async fn licenses(&self) -> Result<Vec<License>, CmError>;

    /// PICS product info for packages; entries carry binary VDF blobs.
    async fn package_info(&self, packages: &[License]) -> Result<Vec<PicsEntry>, CmError>;

    /// PICS access tokens for apps, with per-app results.
    async fn app_access_tokens(&self, app_ids: &[u32]) -> Result<Vec<AppAccessToken>, CmError>;

    /// PICS product info for apps; entries carry text VDF blobs.
    async fn app_info(&self, apps: &[(u32, u64)]) -> Result<Vec<PicsEntry>, CmError>;

    /// Requests the decryption key of a depot.
    async fn depot_key(&self, app_id: u32, depot_id: u32) -> Result<[u8; 32], CmError>;

    /// Requests the manifest request code for a specific manifest.
    async fn manifest_request_code(
        &self,
        app_id: u32,
        depot_id: u32,
        manifest_id: u64,
    ) -> Result<u64, CmError>;

    /// Closes the session. Idempotent.
    async fn disconnect(&self);

    /// Resolves once the upstream connection has dropped, whether by
    /// [`CmSession::disconnect`] or from the server side.
    async fn disconnected(&self);
}

/// An interactive authentication session used by the sign-in bridge.
/// Progress is delivered on the event channel returned at connect time.
#[async_trait]
pub trait CmAuthSession: Send + Sync {
    async fn begin_credentials(
        &self,
        device_name: &str,
        account_name: &str,
        password: &str,
    ) -> Result<(), CmError>;

    async fn begin_qr(&self, device_name: &str) -> Result<(), CmError>;

    async fn submit_code(&self, kind: ConfirmationKind, code: &str) -> Result<(), CmError>;

    /// Closes the session. Idempotent.
    async fn disconnect(&self);
}

/// Factory for CM sessions. One connector is shared by the whole server.
#[async_trait]
pub trait CmConnector: Send + Sync {
    /// Opens a content session.
    async fn connect(&self) -> Result<Box<dyn CmSession>, CmError>;

    /// Opens an auth-only session for the sign-in bridge.
    async fn connect_auth(
        &self,
    ) -> Result<(Box<dyn CmAuthSession>, mpsc::Receiver<AuthEvent>), CmError>;
}
