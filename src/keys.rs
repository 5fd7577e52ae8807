//! Engine key namespace.
//!
//! A store hosts many regions on one engine instance, so every key written
//! through the Raft apply path is tagged. Data keys are partitioned by
//! column family while preserving byte order inside each family; per-region
//! metadata lives under a separate local prefix that can never collide with
//! user data.

/// Column family for plain user data.
pub const CF_DEFAULT: &str = "default";
/// Column family for transaction locks.
pub const CF_LOCK: &str = "lock";
/// Column family for commit records.
pub const CF_WRITE: &str = "write";

const DATA_PREFIX: u8 = b'z';
const LOCAL_PREFIX: u8 = 0x01;
const REGION_STATE_SUFFIX: u8 = 0x01;
const APPLY_STATE_SUFFIX: u8 = 0x02;

/// Encode a user key under its column family.
///
/// Layout: `z | len(cf) | cf | key`. The length byte keeps families from
/// bleeding into each other while leaving in-family ordering untouched.
pub fn key_with_cf(cf: &str, key: &[u8]) -> Vec<u8> {
    debug_assert!(cf.len() <= u8::MAX as usize);
    let mut out = Vec::with_capacity(2 + cf.len() + key.len());
    out.push(DATA_PREFIX);
    out.push(cf.len() as u8);
    out.extend_from_slice(cf.as_bytes());
    out.extend_from_slice(key);
    out
}

/// Key of the persisted [`RegionLocalState`](crate::region::RegionLocalState).
pub fn region_state_key(region_id: u64) -> Vec<u8> {
    local_key(region_id, REGION_STATE_SUFFIX)
}

/// Key of the persisted [`ApplyState`](crate::region::ApplyState).
pub fn apply_state_key(region_id: u64) -> Vec<u8> {
    local_key(region_id, APPLY_STATE_SUFFIX)
}

fn local_key(region_id: u64, suffix: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(10);
    out.push(LOCAL_PREFIX);
    out.push(suffix);
    out.extend_from_slice(&region_id.to_be_bytes());
    out
}
