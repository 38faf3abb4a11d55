//! tek-s3 daemon entry point.
//!
//! Runs in the foreground: loads `settings.json` and `state.json`, starts
//! the per-account CM sessions and the HTTP/WebSocket server, then waits
//! for SIGINT/SIGTERM. Shutdown drains every upstream connection before
//! the process exits; the exit code is non-zero when initialization
//! failed or a fatal upstream error terminated the run.

use anyhow::{Context, Result};
use std::process::ExitCode;
use std::sync::Arc;
use tek_s3::cm::sim::SimConnector;
use tek_s3::settings::{ListenEndpoint, Settings};
use tek_s3::state::Ts3State;
use tek_s3::{http, persist, session, settings};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    println!("tek-s3 {}", env!("CARGO_PKG_VERSION"));
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{e:#}");
            ExitCode::FAILURE
        },
    }
}

async fn run() -> Result<ExitCode> {
    let settings = Settings::load()?;
    let endpoint = settings.listen_endpoint()?;

    let state_dir = settings::state_dir();
    let loaded = match &state_dir {
        Some(dir) => persist::load(dir)?,
        None => {
            tracing::info!("State directory not found, initializing new state");
            persist::LoadedState::default()
        },
    };

    // The Steam CM transport is pluggable behind cm::CmConnector; this
    // build ships with the in-process simulated backend only.
    let connector = Arc::new(SimConnector::new());
    tracing::warn!("No Steam CM transport linked into this build; using the simulated backend");

    let state = Ts3State::new(connector, state_dir);
    session::bootstrap(&state, loaded);

    let app = http::router(Arc::clone(&state));
    {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            wait_for_stop_signal().await;
            tracing::info!("Shutdown signal received, stopping");
            state.stop();
        });
    }
    let shutdown = {
        let state = Arc::clone(&state);
        async move { state.shutdown.cancelled().await }
    };

    match endpoint {
        ListenEndpoint::Tcp(addr) => {
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind to {addr}"))?;
            tracing::info!(%addr, "Listening");
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
                .context("HTTP server error")?;
        },
        #[cfg(unix)]
        ListenEndpoint::Unix { user, group } => {
            let listener = bind_unix_socket(&user, &group)?;
            tracing::info!(path = settings::UNIX_SOCKET_PATH, "Listening");
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
                .context("HTTP server error")?;
        },
    }

    // The server is down; make sure the process is marked stopping even
    // when the serve loop ended on its own, then drain CM connections.
    state.stop();
    state.wait_cm_drained().await;
    Ok(ExitCode::from(u8::try_from(state.exit_code()).unwrap_or(1)))
}

async fn wait_for_stop_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Binds the Unix domain socket with mode 0660 and the configured owner.
#[cfg(unix)]
fn bind_unix_socket(user: &str, group: &str) -> Result<tokio::net::UnixListener> {
    use settings::UNIX_SOCKET_PATH;
    use std::os::unix::fs::PermissionsExt;

    match std::fs::remove_file(UNIX_SOCKET_PATH) {
        Ok(()) => {},
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to remove stale {UNIX_SOCKET_PATH}"));
        },
    }
    let listener = tokio::net::UnixListener::bind(UNIX_SOCKET_PATH)
        .with_context(|| format!("Failed to bind to {UNIX_SOCKET_PATH}"))?;
    std::fs::set_permissions(UNIX_SOCKET_PATH, std::fs::Permissions::from_mode(0o660))
        .context("Failed to set socket permissions")?;

    let uid = nix::unistd::User::from_name(user)
        .context("Failed to look up socket user")?
        .with_context(|| format!("Unknown user {user}"))?
        .uid;
    let gid = nix::unistd::Group::from_name(group)
        .context("Failed to look up socket group")?
        .with_context(|| format!("Unknown group {group}"))?
        .gid;
    std::os::unix::fs::chown(
        UNIX_SOCKET_PATH,
        Some(uid.as_raw()),
        Some(gid.as_raw()),
    )
    .context("Failed to set socket ownership")?;
    Ok(listener)
}
