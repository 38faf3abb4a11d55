//! Common test utilities for integration tests.
//!
//! Builds servers backed by the scripted CM backend and waits for them to
//! finish their initial sweep.

// Compiled once per integration test target; not every target uses every
// helper.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use tek_s3::cm::TokenInfo;
use tek_s3::cm::sim::{SimApp, SimConnector};
use tek_s3::persist::LoadedState;
use tek_s3::session;
use tek_s3::state::Ts3State;

/// Far-future token expiry.
pub fn far_future() -> i64 {
    unix_now() + 365 * 24 * 3600
}

/// Current Unix time in seconds.
pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

/// A backend where account 1001 owns app 730 with depots 731/732.
pub fn connector_with_cs2() -> SimConnector {
    let connector = SimConnector::new();
    connector.grant_app(
        1001,
        100,
        SimApp {
            id: 730,
            name: "Counter-Strike 2".into(),
            access_token: 0xFEED_F00D,
            depots: vec![731, 732],
            ..SimApp::default()
        },
    );
    connector.set_depot_key(731, [0x11; 32]);
    connector.set_depot_key(732, [0x22; 32]);
    connector
}

/// Boots a server for the given accounts and waits until it is running.
pub async fn running_state(connector: SimConnector, steam_ids: &[u64]) -> Arc<Ts3State> {
    let mut loaded = LoadedState::default();
    for &steam_id in steam_ids {
        let token = connector.issue_token(steam_id, far_future(), false);
        loaded
            .accounts
            .push((token.clone(), TokenInfo::parse(&token).unwrap()));
    }
    let state = Ts3State::new(Arc::new(connector), None);
    session::bootstrap(&state, loaded);
    wait_until(|| state.is_running()).await;
    state
}

/// Polls `condition` until it holds, with a hard deadline.
pub async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
