use std::fmt;

use serde::{Deserialize, Serialize};

/// Recognition scores are backend-normalized to `0..=MAX_SCORE`.
pub type RecognitionScore = i32;

/// Highest score a backend may report; also the score assigned to a
/// freshly registered identity.
pub const MAX_SCORE: RecognitionScore = 1000;

/// Stable handle for one recognized person across many detections.
///
/// Zero is reserved for "unknown"; allocation is monotonic with a
/// wraparound-safe scan that skips it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FaceId(pub i32);

impl FaceId {
    pub const UNKNOWN: FaceId = FaceId(0);

    pub fn is_known(self) -> bool {
        self != Self::UNKNOWN
    }
}

impl fmt::Display for FaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ephemeral per-frame handle from the upstream detector. Not owned here;
/// invalidated wholesale when the tracker resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackingId(pub i32);

impl TrackingId {
    pub const NONE: TrackingId = TrackingId(0);

    pub fn is_some(self) -> bool {
        self != Self::NONE
    }
}

impl fmt::Display for TrackingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One backend album slot: bounded storage for up to `samples_per_slot`
/// feature samples belonging to a single identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotId(pub i32);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fixed dimensions of a backend album.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlbumCapacity {
    pub slots: usize,
    pub samples_per_slot: usize,
}

/// One entry of the ranked list returned by [`FaceAlbum::identify`].
///
/// [`FaceAlbum::identify`]: crate::backend::FaceAlbum::identify
#[derive(Debug, Clone, Copy)]
pub struct SlotMatch {
    pub slot: SlotId,
    pub score: RecognitionScore,
}

/// Debug-level match candidate surfaced to the caller alongside a
/// resolved identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognitionMatch {
    pub face_id: FaceId,
    pub name: Option<String>,
    pub score: RecognitionScore,
}

/// Per-detection metadata handed in by the upstream detector.
#[derive(Debug, Clone, Copy)]
pub struct DetectionMeta {
    pub tracking_id: TrackingId,
    /// Non-zero when the detector is coasting on a stale position rather
    /// than an actual detection in this frame. Held frames are not
    /// submitted for recognition.
    pub hold_count: u32,
    /// Capture timestamp of the source frame, for deterministic
    /// enrollment timing when processing recorded footage.
    pub timestamp_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_face_id_is_zero_and_not_known() {
        assert_eq!(FaceId::UNKNOWN, FaceId(0));
        assert!(!FaceId::UNKNOWN.is_known());
        assert!(FaceId(1).is_known());
        assert!(FaceId(-3).is_known());
    }

    #[test]
    fn tracking_none_is_zero() {
        assert!(!TrackingId::NONE.is_some());
        assert!(TrackingId(7).is_some());
    }
}
