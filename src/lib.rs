// Correctness: Must handle all fallible operations
#![deny(unused_must_use)]
// Quality: Pedantic but pragmatic
#![warn(clippy::all)]
#![warn(rust_2018_idioms)]
#![allow(clippy::module_name_repetitions)] // e.g., mrc::MrcError is clearer
#![allow(clippy::missing_errors_doc)] // Error returns self-documenting via type

//! tek-s3 - credential-hiding proxy server for Steam content distribution.
//!
//! Operators register Steam accounts with the server; end users then fetch
//! the manifest catalog, per-manifest request codes, and per-depot
//! decryption keys over plain HTTP without ever seeing the credentials.
//! Many anonymous clients are multiplexed onto a small pool of long-lived
//! authenticated Steam CM sessions.
//!
//! The library exposes the full control plane so integration tests can
//! drive it end to end against the scripted CM backend in [`cm::sim`]:
//!
//! - [`cm`] - Steam CM provider interface (traits, errors, auth tokens)
//! - [`session`] - per-account session manager and catalog builder
//! - [`state`] - shared catalog store
//! - [`manifest`] - catalog serialization and pre-compression
//! - [`mrc`] - manifest request code cache
//! - [`http`] - HTTP/WebSocket server
//! - [`persist`] - `state.json` persistence
//! - [`settings`] - `settings.json` loading

pub mod cm;
pub mod constants;
pub mod http;
pub mod manifest;
pub mod mrc;
pub mod persist;
pub mod session;
pub mod settings;
pub mod state;
pub mod vdf;
