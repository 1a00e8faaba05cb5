//! Identifier helpers
use bech32::{Bech32m, Hrp};
use uuid7::uuid7;

/// Human-readable part of every document record id.
pub const RECORD_HRP: &str = "doc_";

// construct a time-ordered unique id then encode it using bech32m
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

pub fn new_record_id() -> anyhow::Result<String> {
    new_uuid_to_bech32(RECORD_HRP)
}

/// Checks that `id` decodes as a bech32 string carrying the record hrp and
/// a 16 byte uuid payload.
pub fn is_record_id(id: &str) -> bool {
    match bech32::decode(id) {
        Ok((hrp, data)) => hrp.as_str() == RECORD_HRP && data.len() == 16,
        Err(_) => false,
    }
}
