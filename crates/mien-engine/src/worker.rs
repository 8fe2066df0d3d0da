//! Background feature extraction.
//!
//! Extraction runs on a dedicated thread connected to the caller by a pair
//! of single-slot channels, so at most one detection is in flight at a
//! time. Submitting while busy is rejected rather than queued; the caller
//! retries on a later frame. An inline mode runs the extractor on the
//! caller thread for deterministic tests.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use mien_core::{BackendError, DetectionMeta, FeatureExtractor};

pub(crate) struct ExtractionRequest<I> {
    pub image: I,
    pub meta: DetectionMeta,
    pub enrollment_enabled: bool,
    pub generation: u64,
}

pub(crate) struct ExtractionOutcome<F> {
    pub features: Result<F, BackendError>,
    pub meta: DetectionMeta,
    pub enrollment_enabled: bool,
    pub generation: u64,
}

pub(crate) struct ExtractionWorker<E: FeatureExtractor> {
    mode: Mode<E>,
    in_flight: bool,
}

enum Mode<E: FeatureExtractor> {
    Background {
        request_tx: Option<Sender<ExtractionRequest<E::Image>>>,
        outcome_rx: Receiver<ExtractionOutcome<E::Features>>,
        handle: Option<JoinHandle<()>>,
    },
    Inline {
        extractor: E,
        pending: Option<ExtractionOutcome<E::Features>>,
    },
}

impl<E: FeatureExtractor + 'static> ExtractionWorker<E> {
    /// Move the extractor onto a background thread.
    pub fn spawn(mut extractor: E) -> Self {
        let (request_tx, request_rx) = bounded::<ExtractionRequest<E::Image>>(1);
        let (outcome_tx, outcome_rx) = bounded::<ExtractionOutcome<E::Features>>(1);

        let handle = thread::Builder::new()
            .name("mien-extract".into())
            .spawn(move || {
                while let Ok(request) = request_rx.recv() {
                    let features = extractor.extract(&request.image, &request.meta);
                    if let Err(err) = &features {
                        tracing::warn!(error = %err, "feature extraction failed");
                    }
                    let outcome = ExtractionOutcome {
                        features,
                        meta: request.meta,
                        enrollment_enabled: request.enrollment_enabled,
                        generation: request.generation,
                    };
                    if outcome_tx.send(outcome).is_err() {
                        break;
                    }
                }
                tracing::debug!("extraction worker exiting");
            })
            .expect("failed to spawn extraction thread");

        Self {
            mode: Mode::Background {
                request_tx: Some(request_tx),
                outcome_rx,
                handle: Some(handle),
            },
            in_flight: false,
        }
    }

    /// Run the extractor on the caller thread; results are held until the
    /// next [`try_collect`](Self::try_collect).
    pub fn inline(extractor: E) -> Self {
        Self {
            mode: Mode::Inline {
                extractor,
                pending: None,
            },
            in_flight: false,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight
    }

    /// Hand a detection to the extractor. Returns false if a previous
    /// detection is still in flight.
    pub fn submit(
        &mut self,
        image: E::Image,
        meta: DetectionMeta,
        enrollment_enabled: bool,
        generation: u64,
    ) -> bool {
        if self.in_flight {
            return false;
        }
        match &mut self.mode {
            Mode::Background { request_tx, .. } => {
                let Some(tx) = request_tx.as_ref() else {
                    return false;
                };
                let request = ExtractionRequest {
                    image,
                    meta,
                    enrollment_enabled,
                    generation,
                };
                match tx.try_send(request) {
                    Ok(()) => {
                        self.in_flight = true;
                        true
                    }
                    Err(TrySendError::Full(_)) => false,
                    Err(TrySendError::Disconnected(_)) => {
                        tracing::warn!("extraction thread is gone; dropping detection");
                        false
                    }
                }
            }
            Mode::Inline { extractor, pending } => {
                let features = extractor.extract(&image, &meta);
                *pending = Some(ExtractionOutcome {
                    features,
                    meta,
                    enrollment_enabled,
                    generation,
                });
                self.in_flight = true;
                true
            }
        }
    }

    /// Fetch the finished extraction, if any. Never blocks.
    pub fn try_collect(&mut self) -> Option<ExtractionOutcome<E::Features>> {
        let outcome = match &mut self.mode {
            Mode::Background { outcome_rx, .. } => outcome_rx.try_recv().ok(),
            Mode::Inline { pending, .. } => pending.take(),
        };
        if outcome.is_some() {
            self.in_flight = false;
        }
        outcome
    }
}

impl<E: FeatureExtractor> Drop for ExtractionWorker<E> {
    fn drop(&mut self) {
        if let Mode::Background {
            request_tx, handle, ..
        } = &mut self.mode
        {
            drop(request_tx.take());
            if let Some(handle) = handle.take() {
                if handle.join().is_err() {
                    tracing::warn!("extraction thread panicked");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use mien_core::mock::{MockExtractor, MockImage};
    use mien_core::TrackingId;

    use super::*;

    fn meta(tracking: i32) -> DetectionMeta {
        DetectionMeta {
            tracking_id: TrackingId(tracking),
            hold_count: 0,
            timestamp_ms: 0,
        }
    }

    #[test]
    fn background_round_trip() {
        let mut worker = ExtractionWorker::spawn(MockExtractor::new());
        assert!(worker.submit(MockImage::from([1.0, 0.0]), meta(7), true, 0));
        let outcome = loop {
            if let Some(outcome) = worker.try_collect() {
                break outcome;
            }
            std::thread::sleep(Duration::from_millis(1));
        };
        assert_eq!(outcome.meta.tracking_id, TrackingId(7));
        assert_eq!(outcome.features.unwrap(), vec![1.0, 0.0]);
        assert!(!worker.is_busy());
    }

    #[test]
    fn rejects_second_submit_while_busy() {
        let mut worker =
            ExtractionWorker::spawn(MockExtractor::with_delay(Duration::from_millis(50)));
        assert!(worker.submit(MockImage::from([1.0, 0.0]), meta(1), true, 0));
        assert!(worker.is_busy());
        assert!(!worker.submit(MockImage::from([0.0, 1.0]), meta(2), true, 0));
        while worker.try_collect().is_none() {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(worker.submit(MockImage::from([0.0, 1.0]), meta(2), true, 0));
    }

    #[test]
    fn inline_mode_completes_immediately() {
        let mut worker = ExtractionWorker::inline(MockExtractor::new());
        assert!(worker.submit(MockImage::from([0.5, 0.5]), meta(3), false, 4));
        assert!(worker.is_busy());
        let outcome = worker.try_collect().unwrap();
        assert_eq!(outcome.generation, 4);
        assert!(!outcome.enrollment_enabled);
        assert!(worker.try_collect().is_none());
    }

    #[test]
    fn extraction_failure_is_reported_not_dropped() {
        let mut worker = ExtractionWorker::spawn(MockExtractor::new());
        assert!(worker.submit(MockImage::failing(), meta(9), true, 0));
        let outcome = loop {
            if let Some(outcome) = worker.try_collect() {
                break outcome;
            }
            std::thread::sleep(Duration::from_millis(1));
        };
        assert!(outcome.features.is_err());
    }
}
