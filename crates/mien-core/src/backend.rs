//! Capability contract for the feature-extraction-and-matching backend.
//!
//! The backend is an external collaborator: it owns feature vectors and the
//! bounded album storage, and supplies extraction, ranked identification,
//! and per-slot verification. Its accuracy and algorithms are out of scope
//! here — the engine only relies on the interface below.

use thiserror::Error;

use crate::types::{AlbumCapacity, DetectionMeta, RecognitionScore, SlotId, SlotMatch};

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("feature extraction failed: {0}")]
    Extraction(String),
    #[error("identify failed: {0}")]
    Identify(String),
    #[error("verify failed for slot {slot}: {reason}")]
    Verify { slot: SlotId, reason: String },
    #[error("slot {0} out of album range")]
    SlotOutOfRange(SlotId),
    #[error("sample {sample} of slot {slot} is not registered")]
    SampleNotRegistered { slot: SlotId, sample: usize },
    #[error("album is full")]
    AlbumFull,
    #[error("malformed serialized album: {0}")]
    MalformedAlbum(String),
}

/// Extracts feature samples from detected faces.
///
/// The extractor is moved onto the worker thread and runs without holding
/// any engine state, so it must be `Send`.
pub trait FeatureExtractor: Send {
    /// Source image type; opaque to the engine.
    type Image: Send + 'static;
    type Features: Send + 'static;

    fn extract(
        &mut self,
        image: &Self::Image,
        meta: &DetectionMeta,
    ) -> Result<Self::Features, BackendError>;
}

/// A bounded album of `slots × samples_per_slot` feature samples.
///
/// Slot bookkeeping (which slot belongs to whom) is *not* the album's
/// concern; that lives in [`AlbumIndex`](crate::album::AlbumIndex).
pub trait FaceAlbum {
    type Features;

    fn capacity(&self) -> AlbumCapacity;

    /// Rank registered slots against `features`, best first, at most
    /// `max_results` entries.
    fn identify(
        &self,
        features: &Self::Features,
        max_results: usize,
    ) -> Result<Vec<SlotMatch>, BackendError>;

    /// Score `features` against one slot's stored samples.
    fn verify(&self, features: &Self::Features, slot: SlotId)
        -> Result<RecognitionScore, BackendError>;

    fn register(
        &mut self,
        features: &Self::Features,
        slot: SlotId,
        sample: usize,
    ) -> Result<(), BackendError>;

    /// Remove every sample stored in `slot`.
    fn clear_slot(&mut self, slot: SlotId) -> Result<(), BackendError>;

    /// Remove a single sample from `slot`.
    fn clear_sample(&mut self, slot: SlotId, sample: usize) -> Result<(), BackendError>;

    /// Copy one stored sample back out of the album.
    fn feature(&self, slot: SlotId, sample: usize) -> Result<Self::Features, BackendError>;

    /// Number of slots with at least one registered sample.
    fn registered_slots(&self) -> usize;

    /// Number of samples registered in `slot` (0 for an empty or
    /// out-of-range slot).
    fn sample_count(&self, slot: SlotId) -> usize;

    fn is_registered(&self, slot: SlotId) -> bool;

    fn sample_present(&self, slot: SlotId, sample: usize) -> bool;

    /// Opaque backend-native bytes, restorable via
    /// [`FeatureBackend::restore_album`].
    fn serialize(&self) -> Result<Vec<u8>, BackendError>;
}

/// Factory tying the extractor and album halves of one backend together.
pub trait FeatureBackend {
    type Image: Send + 'static;
    type Features: Send + 'static;
    type Album: FaceAlbum<Features = Self::Features>;
    type Extractor: FeatureExtractor<Image = Self::Image, Features = Self::Features> + 'static;

    fn create_album(&self, capacity: AlbumCapacity) -> Result<Self::Album, BackendError>;

    fn restore_album(&self, bytes: &[u8]) -> Result<Self::Album, BackendError>;

    fn create_extractor(&self) -> Result<Self::Extractor, BackendError>;
}
