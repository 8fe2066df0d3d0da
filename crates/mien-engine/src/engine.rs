//! Public engine facade.
//!
//! Owns the backend album, the extraction worker, and the resolver, and
//! exposes the submit/collect cycle plus the management surface (naming,
//! erasure, enrollment policy, persistence).

use std::fs;
use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use mien_core::{
    snapshot, AlbumIndex, BackendError, DetectionMeta, FaceAlbum, FaceId, FeatureBackend,
    RecognitionMatch, RecognitionScore, Snapshot, SnapshotError, TrackingId,
};
use thiserror::Error;

use crate::config::EngineConfig;
use crate::resolver::{IdentityResolver, ResolverError};
use crate::worker::ExtractionWorker;

/// On-disk file names inside a snapshot directory.
const ALBUM_FILE: &str = "album.bin";
const METADATA_FILE: &str = "identities.bin";

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("no record for face {0}")]
    UnknownFace(FaceId),
    #[error("merge target {0} must be a named identity")]
    MergeTargetUnnamed(FaceId),
    #[error("stored name for face {0} does not match")]
    NameMismatch(FaceId),
    #[error("nothing to save: no named identities")]
    NoNamedIdentities,
    #[error("snapshot album has {found} slots but capacity is {capacity}")]
    SnapshotTooLarge { found: usize, capacity: usize },
}

impl From<ResolverError> for EngineError {
    fn from(err: ResolverError) -> Self {
        match err {
            ResolverError::Backend(e) => EngineError::Backend(e),
            ResolverError::MissingRecord(face) => EngineError::UnknownFace(face),
            ResolverError::MergeTargetUnnamed(face) => EngineError::MergeTargetUnnamed(face),
            ResolverError::NameMismatch(face) => EngineError::NameMismatch(face),
        }
    }
}

/// What the engine currently believes about one tracked face.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityReport {
    pub face_id: FaceId,
    pub name: Option<String>,
    pub score: RecognitionScore,
    /// Runner-up matches from the last resolution, for diagnostics.
    pub matches: Vec<RecognitionMatch>,
    /// Set exactly once after this record absorbed another in a merge, so
    /// callers can migrate references to the dropped id.
    pub previous_face_id: Option<FaceId>,
    /// Set once when a positive enrollment quota for this face ran out;
    /// carries the granted count.
    pub enrollment_completed: Option<i32>,
}

/// A named identity, as listed to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownIdentity {
    pub face_id: FaceId,
    pub name: String,
    pub enrolled_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

pub struct FaceIdEngine<B: FeatureBackend> {
    cfg: EngineConfig,
    // Declared before the backend and album so drop joins the extraction
    // thread first.
    worker: ExtractionWorker<B::Extractor>,
    backend: B,
    album: B::Album,
    resolver: IdentityResolver,
    /// Bumped on tracker reset; stale in-flight extractions are discarded.
    generation: u64,
    synchronous: bool,
}

impl<B: FeatureBackend> FaceIdEngine<B> {
    pub fn new(cfg: EngineConfig, backend: B) -> Result<Self, EngineError> {
        let album = backend.create_album(cfg.capacity)?;
        let extractor = backend.create_extractor()?;
        let synchronous = cfg.synchronous;
        let worker = if synchronous {
            ExtractionWorker::inline(extractor)
        } else {
            ExtractionWorker::spawn(extractor)
        };
        tracing::info!(
            slots = cfg.capacity.slots,
            samples_per_slot = cfg.capacity.samples_per_slot,
            synchronous,
            "engine initialized"
        );
        Ok(Self {
            resolver: IdentityResolver::new(cfg.clone()),
            cfg,
            backend,
            album,
            worker,
            generation: 0,
            synchronous,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    /// Whether an extraction is currently in flight.
    pub fn is_busy(&self) -> bool {
        self.worker.is_busy()
    }

    /// Hand one detection to the extraction worker. Returns false when the
    /// detection is not usable (held rather than freshly detected), when
    /// there is nothing it could change (empty album and enrollment off),
    /// or when a previous extraction is still in flight.
    pub fn submit_detection(
        &mut self,
        image: B::Image,
        meta: DetectionMeta,
        enrollment_enabled: bool,
    ) -> bool {
        if meta.hold_count != 0 {
            tracing::trace!(tracking = %meta.tracking_id, "skipping held detection");
            return false;
        }
        if !enrollment_enabled && self.resolver.index().is_empty() {
            return false;
        }
        self.worker
            .submit(image, meta, enrollment_enabled, self.generation)
    }

    /// Fold any finished extraction into the album, then report what is
    /// known about `tracking`. Never blocks.
    pub fn collect(&mut self, tracking: TrackingId) -> Option<IdentityReport> {
        if let Some(outcome) = self.worker.try_collect() {
            // Both flags refer to this outcome, so consume both even when
            // the first already discards it.
            let stale = outcome.generation != self.generation;
            let cancelled = self.resolver.take_cancelled();
            if stale {
                tracing::info!("discarding features extracted before tracker reset");
            } else if cancelled {
                tracing::info!("discarding features from a cancelled enrollment");
            } else {
                match outcome.features {
                    Ok(features) => {
                        let now = self.resolution_time(&outcome.meta);
                        match self.resolver.resolve(
                            &mut self.album,
                            &features,
                            &outcome.meta,
                            outcome.enrollment_enabled,
                            now,
                        ) {
                            Ok(resolved) => {
                                tracing::debug!(outcome = ?resolved, "detection resolved");
                                #[cfg(debug_assertions)]
                                if let Err(err) =
                                    self.resolver.index().check_consistency(&self.album)
                                {
                                    debug_assert!(false, "bookkeeping out of sync: {err}");
                                }
                            }
                            Err(err) => {
                                tracing::warn!(error = %err, "failed to resolve detection")
                            }
                        }
                    }
                    Err(err) => tracing::warn!(error = %err, "dropping failed extraction"),
                }
            }
        }

        let face = self.resolver.index().face_for_tracking(tracking);
        if !face.is_known() {
            return None;
        }
        let enrollment_completed = self.resolver.enrollment_completed_for(face);
        let record = self.resolver.index_mut().record_mut(face)?;
        let report = IdentityReport {
            face_id: face,
            name: record.name().map(str::to_owned),
            score: record.score(),
            matches: record.debug_matches().to_vec(),
            previous_face_id: record
                .previous_face_id()
                .is_known()
                .then(|| record.previous_face_id()),
            enrollment_completed,
        };
        record.clear_previous_face_id();
        Some(report)
    }

    /// Grant enrollment updates (negative `quota` for unlimited), optionally
    /// restricted to one identity.
    pub fn set_allowed_enrollments(&mut self, quota: i32, for_face: FaceId) {
        let pending = self.worker.is_busy();
        self.resolver.set_allowed_enrollments(quota, for_face, pending);
    }

    /// Name an identity, optionally merging it into an existing named
    /// record. Returns the surviving face id.
    pub fn assign_name(
        &mut self,
        face: FaceId,
        name: String,
        merge_with: Option<FaceId>,
    ) -> Result<FaceId, EngineError> {
        let kept = self
            .resolver
            .assign_name(&mut self.album, face, name, merge_with)?;
        Ok(kept)
    }

    pub fn rename(
        &mut self,
        face: FaceId,
        old_name: &str,
        new_name: String,
    ) -> Result<(), EngineError> {
        self.resolver.rename(face, old_name, new_name)?;
        Ok(())
    }

    pub fn erase(&mut self, face: FaceId) -> Result<(), EngineError> {
        self.resolver.erase(&mut self.album, face)?;
        Ok(())
    }

    pub fn erase_all(&mut self) -> Result<(), EngineError> {
        self.resolver.erase_all(&mut self.album)?;
        Ok(())
    }

    /// Number of identities currently tracked, named or not.
    pub fn identity_count(&self) -> usize {
        self.resolver.index().len()
    }

    /// Every named identity.
    pub fn enrolled_names(&self) -> Vec<KnownIdentity> {
        self.resolver
            .index()
            .records()
            .filter_map(|record| {
                record.name().map(|name| KnownIdentity {
                    face_id: record.face_id(),
                    name: name.to_owned(),
                    enrolled_at: record.enrolled_at(),
                    last_seen: record.last_seen(),
                })
            })
            .collect()
    }

    /// The external tracker restarted: its handles no longer mean anything,
    /// and any in-flight extraction belongs to the old handle space.
    pub fn clear_tracking_data(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.resolver.index_mut().clear_tracking();
        tracing::debug!(generation = self.generation, "tracking data cleared");
    }

    /// Switch between background-thread and inline extraction. Any
    /// extraction in flight on the old worker is discarded.
    pub fn set_synchronous(&mut self, synchronous: bool) -> Result<(), EngineError> {
        if synchronous == self.synchronous {
            return Ok(());
        }
        let extractor = self.backend.create_extractor()?;
        self.worker = if synchronous {
            ExtractionWorker::inline(extractor)
        } else {
            ExtractionWorker::spawn(extractor)
        };
        self.synchronous = synchronous;
        tracing::info!(synchronous, "extraction mode switched");
        Ok(())
    }

    /// Serialize the named identities and their album data. Session-only
    /// records are not included.
    pub fn snapshot(&self) -> Result<Snapshot, EngineError> {
        let mut named = 0usize;
        let mut keep = self.backend.create_album(self.album.capacity())?;
        for record in self.resolver.index().records() {
            if record.is_session_only() {
                continue;
            }
            named += 1;
            for slot in record.slots().keys() {
                for sample in 0..self.album.capacity().samples_per_slot {
                    if self.album.sample_present(*slot, sample) {
                        let features = self.album.feature(*slot, sample)?;
                        keep.register(&features, *slot, sample)?;
                    }
                }
            }
        }
        if named == 0 {
            return Err(EngineError::NoNamedIdentities);
        }
        let metadata = snapshot::encode_metadata(
            self.resolver.index().next_face_id(),
            self.resolver.index().records(),
        );
        tracing::info!(named, "snapshot built");
        Ok(Snapshot {
            album: keep.serialize()?,
            metadata,
        })
    }

    pub fn save(&self, dir: &Path) -> Result<(), EngineError> {
        let snapshot = self.snapshot()?;
        fs::create_dir_all(dir)?;
        fs::write(dir.join(ALBUM_FILE), &snapshot.album)?;
        fs::write(dir.join(METADATA_FILE), &snapshot.metadata)?;
        tracing::info!(dir = %dir.display(), "snapshot saved");
        Ok(())
    }

    /// Restore a snapshot, replacing the current album and bookkeeping.
    /// Everything is decoded and cross-checked into temporaries first, so a
    /// bad snapshot leaves the running state untouched.
    pub fn restore(&mut self, snapshot: &Snapshot) -> Result<Vec<KnownIdentity>, EngineError> {
        let album = self.backend.restore_album(&snapshot.album)?;
        if album.capacity().slots > self.cfg.capacity.slots
            || album.capacity().samples_per_slot > self.cfg.capacity.samples_per_slot
        {
            return Err(EngineError::SnapshotTooLarge {
                found: album.capacity().slots,
                capacity: self.cfg.capacity.slots,
            });
        }

        let (next_face_id, records) = snapshot::decode_metadata(&snapshot.metadata)?;
        let mut index = AlbumIndex::new();
        for record in records {
            index.insert_record(record);
        }
        index.set_next_face_id(next_face_id);
        index
            .check_consistency(&album)
            .map_err(SnapshotError::from)?;

        self.album = album;
        self.resolver.replace_index(index);
        self.generation = self.generation.wrapping_add(1);
        let names = self.enrolled_names();
        tracing::info!(identities = names.len(), "snapshot restored");
        Ok(names)
    }

    pub fn load(&mut self, dir: &Path) -> Result<Vec<KnownIdentity>, EngineError> {
        let snapshot = Snapshot {
            album: fs::read(dir.join(ALBUM_FILE))?,
            metadata: fs::read(dir.join(METADATA_FILE))?,
        };
        self.restore(&snapshot)
    }

    fn resolution_time(&self, meta: &DetectionMeta) -> DateTime<Utc> {
        if self.cfg.use_detection_timestamps {
            if let Some(at) = Utc.timestamp_millis_opt(meta.timestamp_ms as i64).single() {
                return at;
            }
        }
        Utc::now()
    }
}
