//! Catalog serialization and pre-compression.
//!
//! [`update_manifest`] keeps the pre-serialized JSON and binary catalog
//! forms, their compressed variants and `state.json` in sync with the
//! in-memory catalog. It must be called with the catalog lock held.
//!
//! JSON object keys are emitted in ascending numeric order of their
//! integer interpretation, so serialization is deterministic and
//! round-trips byte for byte.

use crate::persist;
use crate::state::{Catalog, CatalogBuf, SerializedCatalog, Ts3State};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};
use std::sync::Arc;

/// Refreshes the serialized catalog buffers and, when the state is dirty,
/// rewrites `state.json`. Call with the catalog lock held.
pub fn update_manifest(state: &Ts3State, catalog: &mut Catalog) {
    if catalog.catalog_dirty || catalog.serialized.json.identity.is_empty() {
        if catalog.catalog_dirty {
            catalog.catalog_dirty = false;
            catalog.state_dirty = true;
            catalog.timestamp = chrono::Utc::now().timestamp();
        } else if catalog.timestamp == 0 {
            // Cold start without a persisted timestamp
            catalog.timestamp = chrono::Utc::now().timestamp();
        }
        catalog.serialized = Arc::new(SerializedCatalog {
            json: build_buf(serialize_json(catalog)),
            bin: build_buf(serialize_bin(catalog)),
        });
    }
    if catalog.state_dirty {
        catalog.state_dirty = false;
        match &state.state_dir {
            Some(dir) => {
                if let Err(e) = persist::save(dir, catalog) {
                    tracing::error!(error = %e, "Cannot save state");
                }
            },
            None => tracing::error!("Cannot save state: state directory not found"),
        }
    }
}

/// Prunes empty depots/apps and refreshes the serialized forms. The
/// catalog builder's sync step. Call with the catalog lock held.
pub fn sync_catalog(state: &Ts3State, catalog: &mut Catalog) {
    catalog.prune();
    update_manifest(state, catalog);
}

// =============================================================================
// JSON catalog
// =============================================================================

/// Serializes the public JSON catalog (`/manifest`).
pub fn serialize_json(catalog: &Catalog) -> Vec<u8> {
    let mut out = Vec::with_capacity(4096);
    let mut ser = serde_json::Serializer::new(&mut out);
    JsonCatalog(catalog)
        .serialize(&mut ser)
        .expect("catalog JSON serialization is infallible");
    out
}

struct JsonCatalog<'a>(&'a Catalog);

impl Serialize for JsonCatalog<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("apps", &JsonApps(self.0))?;
        map.serialize_entry("depot_keys", &JsonDepotKeys(self.0))?;
        map.end()
    }
}

struct JsonApps<'a>(&'a Catalog);

impl Serialize for JsonApps<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.apps.len()))?;
        for (&app_id, app) in &self.0.apps {
            map.serialize_entry(app_id.to_string().as_str(), &JsonApp(app))?;
        }
        map.end()
    }
}

struct JsonApp<'a>(&'a crate::state::AppEntry);

impl Serialize for JsonApp<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let len = if self.0.pics_at == 0 { 2 } else { 3 };
        let mut map = serializer.serialize_map(Some(len))?;
        map.serialize_entry("name", &self.0.name)?;
        if self.0.pics_at != 0 {
            map.serialize_entry("pics_at", &self.0.pics_at)?;
        }
        map.serialize_entry("depots", &JsonDepotIds(self.0))?;
        map.end()
    }
}

struct JsonDepotIds<'a>(&'a crate::state::AppEntry);

impl Serialize for JsonDepotIds<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.0.depots.len()))?;
        for depot_id in self.0.depots.keys() {
            seq.serialize_element(depot_id)?;
        }
        seq.end()
    }
}

struct JsonDepotKeys<'a>(&'a Catalog);

impl Serialize for JsonDepotKeys<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.depot_keys.len()))?;
        for (&depot_id, key) in &self.0.depot_keys {
            map.serialize_entry(depot_id.to_string().as_str(), &BASE64.encode(key))?;
        }
        map.end()
    }
}

// =============================================================================
// Binary catalog
// =============================================================================

/// Serializes the packed binary catalog (`/manifest-bin`). Little-endian:
///
/// ```text
/// u32 crc32 | i32 num_apps | i32 num_depots | i32 num_depot_keys
/// num_apps x { u64 pics_access_token; i32 name_len; i32 num_depots }
/// num_depots x u32 depot_id            (grouped per app, app order)
/// num_depot_keys x { i32 depot_id; u8[32] key }
/// name bytes, concatenated in app order, no separators
/// ```
///
/// The CRC-32 (IEEE) covers everything after the first four bytes.
pub fn serialize_bin(catalog: &Catalog) -> Vec<u8> {
    let num_depots: usize = catalog.apps.values().map(|app| app.depots.len()).sum();
    let names_len: usize = catalog.apps.values().map(|app| app.name.len()).sum();
    let mut buf = BytesMut::with_capacity(
        16 + catalog.apps.len() * 16 + num_depots * 4 + catalog.depot_keys.len() * 36 + names_len,
    );
    buf.put_u32_le(0); // CRC placeholder
    buf.put_i32_le(catalog.apps.len() as i32);
    buf.put_i32_le(num_depots as i32);
    buf.put_i32_le(catalog.depot_keys.len() as i32);
    for app in catalog.apps.values() {
        buf.put_u64_le(app.pics_at);
        buf.put_i32_le(app.name.len() as i32);
        buf.put_i32_le(app.depots.len() as i32);
    }
    for app in catalog.apps.values() {
        for &depot_id in app.depots.keys() {
            buf.put_u32_le(depot_id);
        }
    }
    for (&depot_id, key) in &catalog.depot_keys {
        buf.put_i32_le(depot_id as i32);
        buf.put_slice(key);
    }
    for app in catalog.apps.values() {
        buf.put_slice(app.name.as_bytes());
    }
    let mut out = buf.to_vec();
    let crc = crc32fast::hash(&out[4..]);
    out[..4].copy_from_slice(&crc.to_le_bytes());
    out
}

/// An app decoded from the binary catalog.
#[derive(Debug, PartialEq, Eq)]
pub struct BinApp {
    pub pics_at: u64,
    pub name: String,
    pub depots: Vec<u32>,
}

/// A decoded binary catalog.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BinCatalog {
    pub apps: Vec<BinApp>,
    pub depot_keys: Vec<(u32, [u8; 32])>,
}

/// Decodes a binary catalog, verifying its CRC. Used by clients of the
/// binary endpoint and by the round-trip tests.
pub fn parse_bin(data: &[u8]) -> Option<BinCatalog> {
    let mut cur = data;
    if cur.remaining() < 16 {
        return None;
    }
    let crc = cur.get_u32_le();
    if crc32fast::hash(&data[4..]) != crc {
        return None;
    }
    let num_apps = usize::try_from(cur.get_i32_le()).ok()?;
    let num_depots = usize::try_from(cur.get_i32_le()).ok()?;
    let num_depot_keys = usize::try_from(cur.get_i32_le()).ok()?;
    if cur.remaining() < num_apps * 16 {
        return None;
    }
    let mut apps = Vec::with_capacity(num_apps);
    let mut depot_counts = Vec::with_capacity(num_apps);
    let mut name_lens = Vec::with_capacity(num_apps);
    for _ in 0..num_apps {
        let pics_at = cur.get_u64_le();
        name_lens.push(usize::try_from(cur.get_i32_le()).ok()?);
        depot_counts.push(usize::try_from(cur.get_i32_le()).ok()?);
        apps.push(BinApp {
            pics_at,
            name: String::new(),
            depots: Vec::new(),
        });
    }
    if depot_counts.iter().sum::<usize>() != num_depots
        || cur.remaining() < num_depots * 4 + num_depot_keys * 36
    {
        return None;
    }
    for (app, &count) in apps.iter_mut().zip(&depot_counts) {
        for _ in 0..count {
            app.depots.push(cur.get_u32_le());
        }
    }
    let mut depot_keys = Vec::with_capacity(num_depot_keys);
    for _ in 0..num_depot_keys {
        let depot_id = u32::try_from(cur.get_i32_le()).ok()?;
        let mut key = [0u8; 32];
        cur.copy_to_slice(&mut key);
        depot_keys.push((depot_id, key));
    }
    if cur.remaining() != name_lens.iter().sum::<usize>() {
        return None;
    }
    for (app, &len) in apps.iter_mut().zip(&name_lens) {
        let mut name = vec![0u8; len];
        cur.copy_to_slice(&mut name);
        app.name = String::from_utf8(name).ok()?;
    }
    Some(BinCatalog { apps, depot_keys })
}

// =============================================================================
// Compression
// =============================================================================

fn build_buf(identity: Vec<u8>) -> CatalogBuf {
    let deflate = deflate_best(&identity).map(Bytes::from);
    #[cfg(feature = "brotli")]
    let brotli = brotli_best(&identity).map(Bytes::from);
    #[cfg(feature = "zstd")]
    let zstd = zstd_best(&identity).map(Bytes::from);
    CatalogBuf {
        identity: Bytes::from(identity),
        deflate,
        #[cfg(feature = "brotli")]
        brotli,
        #[cfg(feature = "zstd")]
        zstd,
    }
}

/// Keeps a compressed variant only when strictly smaller than the input.
fn keep_if_smaller(compressed: Vec<u8>, original_len: usize) -> Option<Vec<u8>> {
    (compressed.len() < original_len).then_some(compressed)
}

fn deflate_best(data: &[u8]) -> Option<Vec<u8>> {
    use flate2::Compression;
    use flate2::write::ZlibEncoder;
    use std::io::Write;

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(data).ok()?;
    keep_if_smaller(encoder.finish().ok()?, data.len())
}

#[cfg(feature = "brotli")]
fn brotli_best(data: &[u8]) -> Option<Vec<u8>> {
    use brotli::enc::BrotliEncoderParams;
    use brotli::enc::backward_references::BrotliEncoderMode;

    let params = BrotliEncoderParams {
        quality: 11,
        lgwin: 24,
        mode: BrotliEncoderMode::BROTLI_MODE_TEXT,
        ..BrotliEncoderParams::default()
    };
    let mut out = Vec::new();
    brotli::BrotliCompress(&mut &data[..], &mut out, &params).ok()?;
    keep_if_smaller(out, data.len())
}

#[cfg(feature = "zstd")]
fn zstd_best(data: &[u8]) -> Option<Vec<u8>> {
    let level = *zstd::compression_level_range().end();
    keep_if_smaller(zstd::bulk::compress(data, level).ok()?, data.len())
}
