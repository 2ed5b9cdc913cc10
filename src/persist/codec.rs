//! Key/value encoding of restoration records for the sys catalog log.
//!
//! Key: one [`SysRowEntryType`] byte followed by the raw 16-byte id.
//! Value: [`STRING_VALUE_TAG`] followed by the JSON-encoded entry.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    core::tablets::TabletProgress,
    types::{ObjectId, OperationState, RestorationId, SysRowEntryType},
};

/// Value prefix marking a structured string payload.
pub const STRING_VALUE_TAG: u8 = b'S';

/// Structural decode failures. Bad snapshot/schedule ids are not reported
/// here; they are defaulted with a warning by the record loader.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Key has no entry type byte.
    #[error("empty key")]
    EmptyKey,
    /// Entry type byte is not a known [`SysRowEntryType`].
    #[error("unknown entry type byte {0}")]
    UnknownEntryType(u8),
    /// Key belongs to another kind of catalog row.
    #[error("expected {expected:?} entry, got {actual:?}")]
    WrongEntryType {
        /// Type the decoder handles.
        expected: SysRowEntryType,
        /// Type found in the key.
        actual: SysRowEntryType,
    },
    /// Restoration id in the key is not 16 bytes.
    #[error("bad id in key: {0}")]
    BadKeyId(#[from] crate::types::IdDecodeError),
    /// Value has no tag byte.
    #[error("empty value")]
    EmptyValue,
    /// Value does not start with [`STRING_VALUE_TAG`].
    #[error("unexpected value tag {0:#04x}")]
    UnexpectedValueTag(u8),
    /// JSON payload did not parse.
    #[error("payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// One write to the sys catalog log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValuePair {
    /// Entry type byte followed by the object id.
    pub key: Vec<u8>,
    /// Tagged payload.
    pub value: Vec<u8>,
}

/// Catalog object touched by a restoration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterMetadataEntry {
    /// Catalog object id.
    pub id: ObjectId,
    /// Kind of catalog row.
    #[serde(rename = "type")]
    pub entry_type: SysRowEntryType,
}

/// Persisted form of a restoration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SysRestorationEntry {
    /// Aggregate state at write time.
    pub state: OperationState,
    /// Full tablet membership.
    pub tablet_restorations: Vec<TabletProgress>,
    /// Raw snapshot id; expected 16 bytes.
    pub snapshot_id: Vec<u8>,
    /// Raw schedule id; empty or all-zero when absent.
    #[serde(default)]
    pub schedule_id: Vec<u8>,
    /// Whether the sys catalog itself was rolled back.
    #[serde(default)]
    pub is_sys_catalog_restored: bool,
    /// Target hybrid time, raw.
    pub restore_at_ht: u64,
    /// Write version; the highest one wins on load.
    pub version: u64,
    /// Hybrid time the restoration completed, raw.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complete_time_ht: Option<u64>,
    /// Catalog objects touched by the restoration.
    #[serde(default)]
    pub master_metadata: Vec<MasterMetadataEntry>,
}

/// Builds a log key for `entry_type` and raw `id`.
pub fn encode_key(entry_type: SysRowEntryType, id: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + id.len());
    key.push(entry_type.as_byte());
    key.extend_from_slice(id);
    key
}

/// Splits a log key into its entry type and raw id bytes.
pub fn decode_key(key: &[u8]) -> Result<(SysRowEntryType, &[u8]), CodecError> {
    let (&first, id) = key.split_first().ok_or(CodecError::EmptyKey)?;
    let entry_type = SysRowEntryType::from_byte(first).ok_or(CodecError::UnknownEntryType(first))?;
    Ok((entry_type, id))
}

/// Encodes one restoration record as a log write.
pub fn encode_restoration(
    restoration_id: &RestorationId,
    entry: &SysRestorationEntry,
) -> Result<KeyValuePair, CodecError> {
    let key = encode_key(SysRowEntryType::SnapshotRestoration, restoration_id.as_bytes());
    let mut value = vec![STRING_VALUE_TAG];
    serde_json::to_writer(&mut value, entry)?;
    Ok(KeyValuePair { key, value })
}

/// Decodes a log write produced by [`encode_restoration`].
pub fn decode_restoration(
    pair: &KeyValuePair,
) -> Result<(RestorationId, SysRestorationEntry), CodecError> {
    let (entry_type, raw_id) = decode_key(&pair.key)?;
    if entry_type != SysRowEntryType::SnapshotRestoration {
        return Err(CodecError::WrongEntryType {
            expected: SysRowEntryType::SnapshotRestoration,
            actual: entry_type,
        });
    }
    let restoration_id = RestorationId::from_slice(raw_id)?;

    let (&tag, payload) = pair.value.split_first().ok_or(CodecError::EmptyValue)?;
    if tag != STRING_VALUE_TAG {
        return Err(CodecError::UnexpectedValueTag(tag));
    }
    let entry = serde_json::from_slice(payload)?;
    Ok((restoration_id, entry))
}
