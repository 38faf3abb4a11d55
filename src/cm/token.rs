//! Steam auth token parsing.
//!
//! Auth tokens are JWTs. The server only needs three claims from the
//! payload - the Steam ID, the expiry time and whether the token is
//! renewable - and, like the upstream client library, reads them without
//! verifying the signature (Steam does that).

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;

/// Information parsed from an auth token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenInfo {
    /// 64-bit Steam ID of the account.
    pub steam_id: u64,
    /// Expiry timestamp, seconds since the Unix epoch.
    pub expires: i64,
    /// Whether Steam will renew this token on request.
    pub renewable: bool,
}

#[derive(Deserialize)]
struct Claims {
    sub: String,
    exp: i64,
    #[serde(default)]
    per: i64,
}

impl TokenInfo {
    /// Parses a token string. Returns `None` for anything that is not a
    /// JWT with the expected claims.
    pub fn parse(token: &str) -> Option<Self> {
        let mut segments = token.split('.');
        let _header = segments.next()?;
        let payload = segments.next()?;
        let _signature = segments.next()?;
        if segments.next().is_some() {
            return None;
        }
        let payload = URL_SAFE_NO_PAD.decode(payload).ok()?;
        let claims: Claims = serde_json::from_slice(&payload).ok()?;
        let steam_id: u64 = claims.sub.parse().ok()?;
        if steam_id == 0 {
            return None;
        }
        Some(Self {
            steam_id,
            expires: claims.exp,
            renewable: claims.per == 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cm::sim::make_token;

    #[test]
    fn parses_round_trip() {
        let token = make_token(76_561_199_000_000_001, 4_102_444_800, true);
        let info = TokenInfo::parse(&token).unwrap();
        assert_eq!(info.steam_id, 76_561_199_000_000_001);
        assert_eq!(info.expires, 4_102_444_800);
        assert!(info.renewable);

        let info = TokenInfo::parse(&make_token(42, 100, false)).unwrap();
        assert!(!info.renewable);
    }

    #[test]
    fn rejects_garbage() {
        assert!(TokenInfo::parse("").is_none());
        assert!(TokenInfo::parse("not-a-token").is_none());
        assert!(TokenInfo::parse("a.b").is_none());
        assert!(TokenInfo::parse("a.!!!.c").is_none());
        assert!(TokenInfo::parse("a.b.c.d").is_none());
    }

    #[test]
    fn rejects_zero_steam_id() {
        assert!(TokenInfo::parse(&make_token(0, 100, false)).is_none());
    }
}
