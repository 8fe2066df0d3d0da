//! Deterministic in-memory backend for tests.
//!
//! Features are plain vectors; scores are cosine similarity scaled to
//! `0..=MAX_SCORE`, so tests can dial in exact ranked-match scenarios by
//! choosing vector geometry.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::{BackendError, FaceAlbum, FeatureBackend, FeatureExtractor};
use crate::types::{AlbumCapacity, DetectionMeta, RecognitionScore, SlotId, SlotMatch, MAX_SCORE};

/// Test "image": carries its own feature vector, plus a switch to make
/// extraction fail.
#[derive(Debug, Clone)]
pub struct MockImage {
    pub features: Vec<f32>,
    pub fail_extraction: bool,
}

impl MockImage {
    pub fn new(features: impl Into<Vec<f32>>) -> Self {
        Self {
            features: features.into(),
            fail_extraction: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            features: Vec::new(),
            fail_extraction: true,
        }
    }
}

impl<const N: usize> From<[f32; N]> for MockImage {
    fn from(features: [f32; N]) -> Self {
        Self::new(features.to_vec())
    }
}

fn similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom > 0.0 {
        dot / denom
    } else {
        0.0
    }
}

fn score_of(a: &[f32], b: &[f32]) -> RecognitionScore {
    (similarity(a, b).max(0.0) * MAX_SCORE as f32).round() as RecognitionScore
}

pub struct MockExtractor {
    delay: Option<Duration>,
}

impl MockExtractor {
    pub fn new() -> Self {
        Self { delay: None }
    }

    /// Sleep for `delay` inside every extract call, to make an in-flight
    /// extraction observable from the caller thread.
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay: Some(delay) }
    }
}

impl Default for MockExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl FeatureExtractor for MockExtractor {
    type Image = MockImage;
    type Features = Vec<f32>;

    fn extract(
        &mut self,
        image: &MockImage,
        _meta: &DetectionMeta,
    ) -> Result<Vec<f32>, BackendError> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if image.fail_extraction {
            return Err(BackendError::Extraction("forced failure".into()));
        }
        Ok(image.features.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockAlbum {
    samples: Vec<Vec<Option<Vec<f32>>>>,
    samples_per_slot: usize,
}

impl MockAlbum {
    fn slot(&self, slot: SlotId) -> Result<&Vec<Option<Vec<f32>>>, BackendError> {
        usize::try_from(slot.0)
            .ok()
            .and_then(|i| self.samples.get(i))
            .ok_or(BackendError::SlotOutOfRange(slot))
    }

    fn slot_mut(&mut self, slot: SlotId) -> Result<&mut Vec<Option<Vec<f32>>>, BackendError> {
        usize::try_from(slot.0)
            .ok()
            .and_then(|i| self.samples.get_mut(i))
            .ok_or(BackendError::SlotOutOfRange(slot))
    }

    fn slot_score(&self, slot_samples: &[Option<Vec<f32>>], features: &[f32]) -> RecognitionScore {
        slot_samples
            .iter()
            .flatten()
            .map(|sample| score_of(features, sample))
            .max()
            .unwrap_or(0)
    }
}

impl FaceAlbum for MockAlbum {
    type Features = Vec<f32>;

    fn capacity(&self) -> AlbumCapacity {
        AlbumCapacity {
            slots: self.samples.len(),
            samples_per_slot: self.samples_per_slot,
        }
    }

    fn identify(
        &self,
        features: &Vec<f32>,
        max_results: usize,
    ) -> Result<Vec<SlotMatch>, BackendError> {
        let mut matches: Vec<SlotMatch> = self
            .samples
            .iter()
            .enumerate()
            .filter(|(_, samples)| samples.iter().any(Option::is_some))
            .map(|(i, samples)| SlotMatch {
                slot: SlotId(i as i32),
                score: self.slot_score(samples, features),
            })
            .collect();
        // ties break toward the lower slot id, deterministically
        matches.sort_by(|a, b| b.score.cmp(&a.score).then(a.slot.cmp(&b.slot)));
        matches.truncate(max_results);
        Ok(matches)
    }

    fn verify(&self, features: &Vec<f32>, slot: SlotId) -> Result<RecognitionScore, BackendError> {
        let samples = self.slot(slot)?;
        if !samples.iter().any(Option::is_some) {
            return Err(BackendError::Verify {
                slot,
                reason: "slot is empty".into(),
            });
        }
        Ok(self.slot_score(samples, features))
    }

    fn register(
        &mut self,
        features: &Vec<f32>,
        slot: SlotId,
        sample: usize,
    ) -> Result<(), BackendError> {
        let per_slot = self.samples_per_slot;
        let samples = self.slot_mut(slot)?;
        if sample >= per_slot {
            return Err(BackendError::SampleNotRegistered { slot, sample });
        }
        samples[sample] = Some(features.clone());
        Ok(())
    }

    fn clear_slot(&mut self, slot: SlotId) -> Result<(), BackendError> {
        let samples = self.slot_mut(slot)?;
        samples.iter_mut().for_each(|s| *s = None);
        Ok(())
    }

    fn clear_sample(&mut self, slot: SlotId, sample: usize) -> Result<(), BackendError> {
        let samples = self.slot_mut(slot)?;
        match samples.get_mut(sample) {
            Some(s) => {
                *s = None;
                Ok(())
            }
            None => Err(BackendError::SampleNotRegistered { slot, sample }),
        }
    }

    fn feature(&self, slot: SlotId, sample: usize) -> Result<Vec<f32>, BackendError> {
        self.slot(slot)?
            .get(sample)
            .and_then(|s| s.clone())
            .ok_or(BackendError::SampleNotRegistered { slot, sample })
    }

    fn registered_slots(&self) -> usize {
        self.samples
            .iter()
            .filter(|samples| samples.iter().any(Option::is_some))
            .count()
    }

    fn sample_count(&self, slot: SlotId) -> usize {
        self.slot(slot)
            .map(|samples| samples.iter().filter(|s| s.is_some()).count())
            .unwrap_or(0)
    }

    fn is_registered(&self, slot: SlotId) -> bool {
        self.slot(slot)
            .map(|samples| samples.iter().any(Option::is_some))
            .unwrap_or(false)
    }

    fn sample_present(&self, slot: SlotId, sample: usize) -> bool {
        self.slot(slot)
            .ok()
            .and_then(|samples| samples.get(sample))
            .map(Option::is_some)
            .unwrap_or(false)
    }

    fn serialize(&self) -> Result<Vec<u8>, BackendError> {
        serde_json::to_vec(self).map_err(|e| BackendError::MalformedAlbum(e.to_string()))
    }
}

/// Backend factory. `extract_delay` makes the worker observably busy in
/// async-mode tests.
#[derive(Debug, Clone, Default)]
pub struct MockBackend {
    pub extract_delay: Option<Duration>,
}

impl FeatureBackend for MockBackend {
    type Image = MockImage;
    type Features = Vec<f32>;
    type Album = MockAlbum;
    type Extractor = MockExtractor;

    fn create_album(&self, capacity: AlbumCapacity) -> Result<MockAlbum, BackendError> {
        Ok(MockAlbum {
            samples: vec![vec![None; capacity.samples_per_slot]; capacity.slots],
            samples_per_slot: capacity.samples_per_slot,
        })
    }

    fn restore_album(&self, bytes: &[u8]) -> Result<MockAlbum, BackendError> {
        serde_json::from_slice(bytes).map_err(|e| BackendError::MalformedAlbum(e.to_string()))
    }

    fn create_extractor(&self) -> Result<MockExtractor, BackendError> {
        Ok(MockExtractor {
            delay: self.extract_delay,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn album() -> MockAlbum {
        MockBackend::default()
            .create_album(AlbumCapacity {
                slots: 4,
                samples_per_slot: 2,
            })
            .unwrap()
    }

    #[test]
    fn identify_ranks_by_similarity() {
        let mut album = album();
        album.register(&vec![1.0, 0.0], SlotId(0), 0).unwrap();
        album.register(&vec![0.0, 1.0], SlotId(1), 0).unwrap();

        let matches = album.identify(&vec![0.9, 0.1], 10).unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].slot, SlotId(0));
        assert!(matches[0].score > matches[1].score);
    }

    #[test]
    fn verify_uses_best_sample() {
        let mut album = album();
        album.register(&vec![1.0, 0.0], SlotId(0), 0).unwrap();
        album.register(&vec![0.0, 1.0], SlotId(0), 1).unwrap();
        let score = album.verify(&vec![0.0, 1.0], SlotId(0)).unwrap();
        assert_eq!(score, MAX_SCORE);
    }

    #[test]
    fn serialize_restore_round_trip() {
        let mut album = album();
        album.register(&vec![1.0, 0.0], SlotId(2), 1).unwrap();
        let bytes = FaceAlbum::serialize(&album).unwrap();
        let restored = MockBackend::default().restore_album(&bytes).unwrap();
        assert!(restored.sample_present(SlotId(2), 1));
        assert_eq!(restored.registered_slots(), 1);
    }

    #[test]
    fn restore_rejects_garbage() {
        assert!(matches!(
            MockBackend::default().restore_album(b"not an album"),
            Err(BackendError::MalformedAlbum(_))
        ));
    }
}
