//! mien-core — Stable face identities over a pluggable recognition backend.
//!
//! The backend (feature extraction, ranked identification, per-slot
//! verification over a bounded album) is consumed through the traits in
//! [`backend`]; everything else — identity records, the mirrored
//! slot/identity index, and the versioned snapshot format — lives here.

pub mod album;
pub mod backend;
pub mod identity;
pub mod snapshot;
pub mod types;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use album::AlbumIndex;
pub use backend::{BackendError, FaceAlbum, FeatureBackend, FeatureExtractor};
pub use identity::EnrolledIdentity;
pub use snapshot::{Snapshot, SnapshotError};
pub use types::{
    AlbumCapacity, DetectionMeta, FaceId, RecognitionMatch, RecognitionScore, SlotId, SlotMatch,
    TrackingId, MAX_SCORE,
};
