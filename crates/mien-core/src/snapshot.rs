//! Versioned snapshot wire format.
//!
//! A snapshot is two paired blobs: the backend's opaque album bytes, and a
//! metadata blob describing the named identities. The metadata layout is
//! fixed little-endian:
//!
//! ```text
//! [u16 tag = 0xFACE][u16 version]
//! [i32 next_face_id]
//! per named identity:
//!   [i32 face_id][u16 name_len][name utf-8]
//!   [i64 enrolled_at][i64 last_updated][i32 score]
//!   [u8 slot_count] then per slot: [i32 slot_id][i64 last_seen]
//! ```
//!
//! Any layout change requires bumping [`SNAPSHOT_VERSION`]; a mismatched
//! tag or version is a hard load failure with no partial application.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, TimeZone, Utc};
use thiserror::Error;

use crate::album::ConsistencyError;
use crate::backend::BackendError;
use crate::identity::EnrolledIdentity;
use crate::types::{FaceId, SlotId};

const VERSION_TAG: u16 = 0xFACE;
pub const SNAPSHOT_VERSION: u16 = 3;

/// The two paired blobs produced by a save.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Backend-native album bytes, restored via
    /// [`FeatureBackend::restore_album`](crate::backend::FeatureBackend::restore_album).
    pub album: Vec<u8>,
    /// Identity metadata in the format above.
    pub metadata: Vec<u8>,
}

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("metadata truncated: needed {needed} more bytes at offset {offset}")]
    Truncated { offset: usize, needed: usize },
    #[error("bad metadata tag {found:#06x} (expected {VERSION_TAG:#06x})")]
    BadTag { found: u16 },
    #[error("metadata version {found} does not match {SNAPSHOT_VERSION}")]
    VersionMismatch { found: u16 },
    #[error("malformed record at offset {offset}: {reason}")]
    MalformedRecord { offset: usize, reason: String },
    #[error("restored state is inconsistent: {0}")]
    Inconsistent(#[from] ConsistencyError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Encode the metadata blob. Session-only identities are skipped and do
/// not survive a restart.
pub fn encode_metadata<'a>(
    next_face_id: FaceId,
    records: impl IntoIterator<Item = &'a EnrolledIdentity>,
) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&VERSION_TAG.to_le_bytes());
    buf.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
    buf.extend_from_slice(&next_face_id.0.to_le_bytes());

    for record in records {
        let Some(name) = record.name() else {
            continue;
        };
        buf.extend_from_slice(&record.face_id().0.to_le_bytes());
        let name_bytes = name.as_bytes();
        buf.extend_from_slice(&(name_bytes.len() as u16).to_le_bytes());
        buf.extend_from_slice(name_bytes);
        buf.extend_from_slice(&record.enrolled_at().timestamp().to_le_bytes());
        buf.extend_from_slice(&record.last_updated().timestamp().to_le_bytes());
        buf.extend_from_slice(&record.score().to_le_bytes());
        buf.push(record.slots().len() as u8);
        for (slot, seen) in record.slots() {
            buf.extend_from_slice(&slot.0.to_le_bytes());
            buf.extend_from_slice(&seen.timestamp().to_le_bytes());
        }
    }

    buf
}

/// Decode the metadata blob into the persisted next-id cursor and the
/// named identity records. All-or-nothing: any malformed byte fails the
/// whole decode.
pub fn decode_metadata(bytes: &[u8]) -> Result<(FaceId, Vec<EnrolledIdentity>), SnapshotError> {
    let mut reader = Reader::new(bytes);

    let tag = reader.read_u16()?;
    if tag != VERSION_TAG {
        return Err(SnapshotError::BadTag { found: tag });
    }
    let version = reader.read_u16()?;
    if version != SNAPSHOT_VERSION {
        return Err(SnapshotError::VersionMismatch { found: version });
    }
    let next_face_id = FaceId(reader.read_i32()?);

    let mut records = Vec::new();
    let mut seen_faces = HashSet::new();
    let mut seen_slots = HashSet::new();

    while !reader.is_empty() {
        let offset = reader.pos;
        let face_id = FaceId(reader.read_i32()?);
        if !face_id.is_known() {
            return Err(malformed(offset, "record with unknown face id"));
        }
        if !seen_faces.insert(face_id) {
            return Err(malformed(offset, format!("duplicate face id {face_id}")));
        }

        let name_len = reader.read_u16()? as usize;
        let name_bytes = reader.read_bytes(name_len)?;
        let name = std::str::from_utf8(name_bytes)
            .map_err(|_| malformed(offset, "name is not valid utf-8"))?
            .to_owned();
        if name.is_empty() {
            return Err(malformed(offset, "record with empty name"));
        }

        let enrolled_at = reader.read_time()?;
        let last_updated = reader.read_time()?;
        let score = reader.read_i32()?;

        let slot_count = reader.read_u8()? as usize;
        let mut slots = BTreeMap::new();
        for _ in 0..slot_count {
            let slot = SlotId(reader.read_i32()?);
            if !seen_slots.insert(slot) {
                return Err(malformed(offset, format!("slot {slot} claimed twice")));
            }
            let seen = reader.read_time()?;
            slots.insert(slot, seen);
        }
        if slots.is_empty() {
            return Err(malformed(offset, "record with no slots"));
        }

        records.push(EnrolledIdentity::restored(
            face_id,
            name,
            enrolled_at,
            last_updated,
            score,
            slots,
        ));
    }

    Ok((next_face_id, records))
}

fn malformed(offset: usize, reason: impl Into<String>) -> SnapshotError {
    SnapshotError::MalformedRecord {
        offset,
        reason: reason.into(),
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], SnapshotError> {
        let end = self.pos.checked_add(n).filter(|end| *end <= self.bytes.len());
        match end {
            Some(end) => {
                let out = &self.bytes[self.pos..end];
                self.pos = end;
                Ok(out)
            }
            None => Err(SnapshotError::Truncated {
                offset: self.pos,
                needed: n - (self.bytes.len() - self.pos),
            }),
        }
    }

    fn read_u8(&mut self) -> Result<u8, SnapshotError> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, SnapshotError> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_i32(&mut self) -> Result<i32, SnapshotError> {
        let b = self.read_bytes(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_i64(&mut self) -> Result<i64, SnapshotError> {
        let b = self.read_bytes(8)?;
        Ok(i64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn read_time(&mut self) -> Result<DateTime<Utc>, SnapshotError> {
        let offset = self.pos;
        let secs = self.read_i64()?;
        Utc.timestamp_opt(secs, 0)
            .single()
            .ok_or_else(|| malformed(offset, format!("timestamp {secs} out of range")))
    }
}
