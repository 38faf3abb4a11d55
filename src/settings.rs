//! Server settings loaded from `settings.json`.
//!
//! The settings file lives in the per-platform configuration directory
//! (`~/.config/tek-s3/settings.json` on Linux). A missing file falls back
//! to defaults; an unparseable file is a fatal startup error.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;

/// Path of the Unix domain socket bound for `unix:` endpoints.
#[cfg(unix)]
pub const UNIX_SOCKET_PATH: &str = "/run/tek-s3.sock";

/// Parsed `settings.json` contents. Unknown keys are ignored.
#[derive(Debug, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub listen_endpoint: Option<String>,
}

/// Where the HTTP server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenEndpoint {
    /// TCP socket on the given interface and port.
    Tcp(SocketAddr),
    /// Unix domain socket at [`UNIX_SOCKET_PATH`], mode 0660, owned by the
    /// named user and group.
    #[cfg(unix)]
    Unix { user: String, group: String },
}

impl Default for ListenEndpoint {
    fn default() -> Self {
        Self::Tcp(SocketAddr::from(([127, 0, 0, 1], 8080)))
    }
}

impl fmt::Display for ListenEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "{addr}"),
            #[cfg(unix)]
            Self::Unix { user, group } => {
                write!(f, "{UNIX_SOCKET_PATH} ({user}:{group})")
            },
        }
    }
}

impl FromStr for ListenEndpoint {
    type Err = anyhow::Error;

    /// Parses a `listen_endpoint` value.
    ///
    /// Accepted forms are `"<ipv4>:<port>"`, `"<ipv6>:<port>"` and, on
    /// Unix, `"unix:<user>:<group>"`. The address is split at the last
    /// colon so unbracketed IPv6 addresses work.
    fn from_str(s: &str) -> Result<Self> {
        #[cfg(unix)]
        if let Some(rest) = s.strip_prefix("unix:") {
            let Some((user, group)) = rest.split_once(':') else {
                bail!("invalid listen_endpoint value: expected unix:<user>:<group>");
            };
            if user.is_empty() || group.is_empty() {
                bail!("invalid listen_endpoint value: empty user or group name");
            }
            return Ok(Self::Unix {
                user: user.to_owned(),
                group: group.to_owned(),
            });
        }
        let Some((iface, port)) = s.rsplit_once(':') else {
            bail!("invalid listen_endpoint value: ':' not found");
        };
        let iface: IpAddr = iface
            .parse()
            .context("invalid listen_endpoint value: bad interface address")?;
        let port: u16 = port
            .parse()
            .ok()
            .filter(|&p| p >= 1)
            .context("invalid listen_endpoint value: port number must be in range [1, 65535]")?;
        Ok(Self::Tcp(SocketAddr::new(iface, port)))
    }
}

impl Settings {
    /// Loads settings from the per-platform config directory.
    ///
    /// A missing directory or file yields defaults; a file that exists but
    /// does not parse is an error.
    pub fn load() -> Result<Self> {
        let Some(path) = settings_path() else {
            tracing::info!("Config directory not found, using defaults");
            return Ok(Self::default());
        };
        Self::load_from(&path)
    }

    /// Loads settings from an explicit path.
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("Settings file not found, using defaults");
                return Ok(Self::default());
            },
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read settings file {}", path.display()));
            },
        };
        serde_json::from_slice(&data)
            .with_context(|| format!("Failed to parse settings file {}", path.display()))
    }

    /// Resolves the configured listen endpoint, defaulting to
    /// `127.0.0.1:8080`.
    pub fn listen_endpoint(&self) -> Result<ListenEndpoint> {
        match self.listen_endpoint.as_deref() {
            None | Some("") => Ok(ListenEndpoint::default()),
            Some(value) => value.parse(),
        }
    }
}

/// Path of the settings file, if the config directory is known.
pub fn settings_path() -> Option<PathBuf> {
    Some(dirs::config_dir()?.join("tek-s3").join("settings.json"))
}

/// Directory holding `state.json`, if a state directory is known.
pub fn state_dir() -> Option<PathBuf> {
    // XDG state dir on Linux, local data dir elsewhere.
    dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .map(|dir| dir.join("tek-s3"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_endpoint_is_local() {
        let settings = Settings::default();
        assert_eq!(
            settings.listen_endpoint().unwrap(),
            ListenEndpoint::Tcp(SocketAddr::from(([127, 0, 0, 1], 8080)))
        );
    }

    #[test]
    fn parses_ipv4_endpoint() {
        let ep: ListenEndpoint = "0.0.0.0:9090".parse().unwrap();
        assert_eq!(ep, ListenEndpoint::Tcp(SocketAddr::from(([0, 0, 0, 0], 9090))));
    }

    #[test]
    fn parses_ipv6_endpoint() {
        let ep: ListenEndpoint = "::1:8080".parse().unwrap();
        let ListenEndpoint::Tcp(addr) = ep else {
            panic!("expected TCP endpoint");
        };
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), 8080);
    }

    #[test]
    fn rejects_missing_colon() {
        assert!("127.0.0.1".parse::<ListenEndpoint>().is_err());
    }

    #[test]
    fn rejects_port_zero_and_overflow() {
        assert!("127.0.0.1:0".parse::<ListenEndpoint>().is_err());
        assert!("127.0.0.1:65536".parse::<ListenEndpoint>().is_err());
    }

    #[cfg(unix)]
    #[test]
    fn parses_unix_endpoint() {
        let ep: ListenEndpoint = "unix:www-data:www-data".parse().unwrap();
        assert_eq!(
            ep,
            ListenEndpoint::Unix {
                user: "www-data".into(),
                group: "www-data".into()
            }
        );
    }

    #[test]
    fn unknown_settings_keys_are_ignored() {
        let settings: Settings =
            serde_json::from_str(r#"{"listen_endpoint":"127.0.0.1:8080","nope":1}"#).unwrap();
        assert_eq!(settings.listen_endpoint.as_deref(), Some("127.0.0.1:8080"));
    }

    #[test]
    fn missing_settings_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load_from(&dir.path().join("settings.json")).unwrap();
        assert!(settings.listen_endpoint.is_none());
    }

    #[test]
    fn malformed_settings_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(Settings::load_from(&path).is_err());
    }
}
