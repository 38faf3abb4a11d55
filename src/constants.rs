//! Centralized constants for timeouts and limits.
//!
//! All magic numbers in the server should be defined here with documented
//! rationale, so limits can be audited and tuned in one place.

use std::time::Duration;

// =============================================================================
// Steam CM timeouts
// =============================================================================

/// Timeout for establishing a CM connection.
pub const CM_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for a sign-in exchange.
pub const CM_SIGN_IN_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for an auth token renewal exchange.
pub const CM_RENEW_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for the license list request.
pub const CM_LICENSES_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for PICS product-info and access-token requests.
pub const CM_PICS_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for a single depot decryption key request.
/// Timeouts are retried indefinitely; they are common for these requests.
pub const CM_DEPOT_KEY_TIMEOUT: Duration = Duration::from_secs(3);

/// Timeout for a manifest request code request. Also bounds how long an
/// HTTP `/mrc` client waits.
pub const CM_MRC_TIMEOUT: Duration = Duration::from_secs(2);

// =============================================================================
// Catalog builder
// =============================================================================

/// Number of depot key requests kept in flight at once. The CM silently
/// drops excess concurrent requests, so bursts must stay small.
pub const DEPOT_KEY_BURST: usize = 5;

/// Auth tokens are renewed this long before their expiry.
pub const TOKEN_RENEWAL_LEAD: Duration = Duration::from_secs(7 * 24 * 3600);

// =============================================================================
// Request code cache
// =============================================================================

/// Maximum number of cached manifest request codes.
pub const MRC_CACHE_CAP: usize = 128;

/// Steam refreshes request codes every 5 minutes.
pub const MRC_REFRESH_PERIOD: u64 = 300;

/// Offset of the refresh within the 5-minute boundary (every *4 and *9
/// minute of the hour).
pub const MRC_REFRESH_OFFSET: u64 = 240;

// =============================================================================
// Transport limits
// =============================================================================

/// Maximum size of an incoming sign-in WebSocket message. Larger or
/// fragmented frames are rejected to resist memory-exhaustion attempts.
pub const SIGNIN_RX_LIMIT: usize = 32 * 1024;
