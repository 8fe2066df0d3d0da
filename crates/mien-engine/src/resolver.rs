//! Identity resolution over extracted features.
//!
//! Given one detection's features, the resolver ranks album slots, decides
//! between recognizing an existing identity, merging two records that turn
//! out to be the same person, and enrolling a new one, and keeps the
//! [`AlbumIndex`] bookkeeping in lockstep with the backend album.

use chrono::{DateTime, Utc};
use mien_core::{
    AlbumIndex, BackendError, DetectionMeta, FaceAlbum, FaceId, RecognitionMatch,
    RecognitionScore, SlotId, SlotMatch, TrackingId, MAX_SCORE,
};
use thiserror::Error;

use crate::config::EngineConfig;

#[derive(Error, Debug)]
pub enum ResolverError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("no record for face {0}")]
    MissingRecord(FaceId),
    #[error("merge target {0} must be a named identity")]
    MergeTargetUnnamed(FaceId),
    #[error("stored name for face {0} does not match")]
    NameMismatch(FaceId),
}

/// What happened to one detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// Matched an existing identity.
    Recognized {
        face_id: FaceId,
        score: RecognitionScore,
    },
    /// Matched, and in doing so revealed that two records were the same
    /// person; `dropped` was folded into `kept`.
    Merged {
        kept: FaceId,
        dropped: FaceId,
        score: RecognitionScore,
    },
    /// Enrolled as a new identity.
    Registered {
        face_id: FaceId,
        score: RecognitionScore,
    },
    /// Below threshold and enrollment was not permitted.
    NoMatch,
}

pub struct IdentityResolver {
    cfg: EngineConfig,
    index: AlbumIndex,
    /// Remaining enrollment updates; negative means unlimited.
    enrollment_quota: i32,
    /// Quota as originally granted, for completion reporting.
    original_quota: i32,
    /// When known, only this identity may receive enrollment updates.
    enrollment_id: FaceId,
    /// Tracking handle the targeted enrollment is following.
    enrollment_tracking: TrackingId,
    /// Set when a targeted enrollment is cancelled while an extraction is
    /// in flight; the next outcome is discarded.
    enrollment_cancelled: bool,
}

impl IdentityResolver {
    pub fn new(cfg: EngineConfig) -> Self {
        Self {
            cfg,
            index: AlbumIndex::new(),
            enrollment_quota: -1,
            original_quota: -1,
            enrollment_id: FaceId::UNKNOWN,
            enrollment_tracking: TrackingId::NONE,
            enrollment_cancelled: false,
        }
    }

    pub fn index(&self) -> &AlbumIndex {
        &self.index
    }

    pub fn index_mut(&mut self) -> &mut AlbumIndex {
        &mut self.index
    }

    /// Swap in restored bookkeeping (after a validated snapshot load).
    pub fn replace_index(&mut self, index: AlbumIndex) {
        self.index = index;
    }

    /// Grant `quota` enrollment updates (negative for unlimited). A known
    /// `for_face` restricts updates to that identity; switching away from
    /// an unfinished targeted enrollment cancels it, and if
    /// `extraction_pending` the next extraction outcome is discarded so a
    /// frame submitted under the old policy cannot land under the new one.
    pub fn set_allowed_enrollments(
        &mut self,
        quota: i32,
        for_face: FaceId,
        extraction_pending: bool,
    ) {
        if !for_face.is_known()
            && self.enrollment_id.is_known()
            && self.enrollment_quota > 0
            && extraction_pending
        {
            tracing::info!(face = %self.enrollment_id, "cancelling targeted enrollment in progress");
            self.enrollment_cancelled = true;
        }
        self.enrollment_quota = quota;
        self.original_quota = quota;
        self.enrollment_id = for_face;
        self.enrollment_tracking = if for_face.is_known() {
            match self.index.record(for_face) {
                Some(record) => record.tracking_id(),
                None => {
                    tracing::warn!(face = %for_face, "enrollment target has no record");
                    TrackingId::NONE
                }
            }
        } else {
            TrackingId::NONE
        };
        tracing::debug!(quota, face = %for_face, "enrollment policy updated");
    }

    pub fn take_cancelled(&mut self) -> bool {
        std::mem::take(&mut self.enrollment_cancelled)
    }

    /// If a positive targeted quota just ran out for `face`, report how
    /// many updates were granted. One-shot.
    pub fn enrollment_completed_for(&mut self, face: FaceId) -> Option<i32> {
        if self.enrollment_quota == 0 && self.original_quota > 0 && self.enrollment_id == face {
            let granted = self.original_quota;
            self.original_quota = 0;
            return Some(granted);
        }
        None
    }

    /// Resolve one detection's features against the album, then reconcile
    /// the result with whatever identity the tracking handle already had.
    pub fn resolve<A: FaceAlbum>(
        &mut self,
        album: &mut A,
        features: &A::Features,
        meta: &DetectionMeta,
        enrollment_enabled: bool,
        now: DateTime<Utc>,
    ) -> Result<ResolveOutcome, ResolverError> {
        let (recognized, score, outcome) =
            self.recognize(album, features, meta, enrollment_enabled, now)?;
        let (face, merged) = self.reconcile_tracking(album, recognized, meta, enrollment_enabled);

        if recognized.is_known() && face.is_known() {
            self.index.bind_tracking(meta.tracking_id, face);
            if let Some(record) = self.index.record_mut(face) {
                record.set_score(score);
            }
        }

        Ok(match merged {
            Some((kept, dropped)) => ResolveOutcome::Merged {
                kept,
                dropped,
                score,
            },
            None if face != recognized && face.is_known() && recognized.is_known() => {
                ResolveOutcome::Recognized {
                    face_id: face,
                    score,
                }
            }
            None => outcome,
        })
    }

    fn recognize<A: FaceAlbum>(
        &mut self,
        album: &mut A,
        features: &A::Features,
        meta: &DetectionMeta,
        enrollment_enabled: bool,
        now: DateTime<Utc>,
    ) -> Result<(FaceId, RecognitionScore, ResolveOutcome), ResolverError> {
        let quota_left = self.enrollment_quota != 0;
        let targeted = self.enrollment_id.is_known();

        // First face ever seen: nothing to rank against.
        if album.registered_slots() == 0 {
            if enrollment_enabled && quota_left && !targeted {
                if let Some(face) = self.register_new(album, features, meta, now)? {
                    return Ok((
                        face,
                        MAX_SCORE,
                        ResolveOutcome::Registered {
                            face_id: face,
                            score: MAX_SCORE,
                        },
                    ));
                }
            }
            return Ok((FaceId::UNKNOWN, 0, ResolveOutcome::NoMatch));
        }

        let matches = album.identify(features, album.capacity().slots)?;

        if matches
            .first()
            .is_some_and(|m| m.score > self.cfg.recognition_threshold)
        {
            return self.accept_match(album, features, &matches, meta, now);
        }

        if enrollment_enabled && quota_left {
            if targeted
                && meta.tracking_id.is_some()
                && meta.tracking_id == self.enrollment_tracking
            {
                // Below threshold, but we are deliberately enrolling this
                // person: keep adding their data so recognition converges.
                let mut score = 0;
                for m in &matches {
                    if self.index.face_for_slot(m.slot) == self.enrollment_id {
                        score = m.score;
                        self.update_existing_slot(album, m.slot, features, meta, now)?;
                        break;
                    }
                }
                tracing::info!(face = %self.enrollment_id, score, "sub-threshold update for enrollment target");
                return Ok((
                    self.enrollment_id,
                    score,
                    ResolveOutcome::Recognized {
                        face_id: self.enrollment_id,
                        score,
                    },
                ));
            }

            if !targeted {
                let too_close = matches
                    .first()
                    .is_some_and(|m| {
                        m.score >= self.cfg.recognition_threshold - self.cfg.add_margin
                    });
                if !too_close {
                    if let Some(face) = self.register_new(album, features, meta, now)? {
                        return Ok((
                            face,
                            MAX_SCORE,
                            ResolveOutcome::Registered {
                                face_id: face,
                                score: MAX_SCORE,
                            },
                        ));
                    }
                    return Ok((FaceId::UNKNOWN, 0, ResolveOutcome::NoMatch));
                }
                tracing::debug!(
                    best = matches.first().map(|m| m.score).unwrap_or(0),
                    "best match too close to threshold to enroll a new identity"
                );
            }
        }

        Ok((FaceId::UNKNOWN, 0, ResolveOutcome::NoMatch))
    }

    /// The top match cleared the threshold. Decide whether the top slot or
    /// a lower-ranked named identity wins, fold session-only duplicates
    /// into named records, and feed the sample back into the album.
    fn accept_match<A: FaceAlbum>(
        &mut self,
        album: &mut A,
        features: &A::Features,
        matches: &[SlotMatch],
        meta: &DetectionMeta,
        now: DateTime<Utc>,
    ) -> Result<(FaceId, RecognitionScore, ResolveOutcome), ResolverError> {
        let mut slot = matches[0].slot;
        let mut face = self.index.face_for_slot(slot);
        let mut score = matches[0].score;
        if !face.is_known() || self.index.record(face).is_none() {
            tracing::warn!(%slot, "matched a slot with no bookkeeping");
            return Ok((FaceId::UNKNOWN, 0, ResolveOutcome::NoMatch));
        }

        // Snapshot the ranking before any merge rewires it.
        let debug_matches = self.build_debug_matches(matches);

        let mut update_slot = true;
        let mut merged_from = None;

        let top_session_only = self
            .index
            .record(face)
            .is_some_and(|r| r.is_session_only());
        if top_session_only && face != self.enrollment_id {
            if let Some((runner_idx, named)) = self.named_runner_up(matches, face) {
                let second = matches[runner_idx];
                if second.score >= self.cfg.recognition_threshold - self.cfg.second_best_margin
                    && !self.runner_up_contested(matches, runner_idx, face, named)
                {
                    tracing::info!(
                        top = %face,
                        top_score = score,
                        named = %named,
                        named_score = second.score,
                        "named identity close behind a session-only top match; merging"
                    );
                    match self.merge_identities(album, named, face) {
                        Ok(()) => {
                            merged_from = Some(face);
                            // The merge may have discarded the matched slot.
                            if !self
                                .index
                                .record(named)
                                .is_some_and(|r| r.has_slot(slot))
                            {
                                update_slot = false;
                            }
                            slot = second.slot;
                            face = named;
                            score = second.score;
                        }
                        Err(err) => {
                            tracing::warn!(keep = %named, drop = %face, error = %err, "merge failed")
                        }
                    }
                }
            }
        }

        if let Some(record) = self.index.record_mut(face) {
            record.set_debug_matches(debug_matches);
        }

        if update_slot {
            self.update_existing_slot(album, slot, features, meta, now)?;
        }

        // A targeted enrollment follows the person, not the tracker: adopt
        // the current handle if the old one went away.
        if self.enrollment_id == face && self.enrollment_tracking != meta.tracking_id {
            self.enrollment_tracking = meta.tracking_id;
        }

        let outcome = match merged_from {
            Some(dropped) => ResolveOutcome::Merged {
                kept: face,
                dropped,
                score,
            },
            None => ResolveOutcome::Recognized {
                face_id: face,
                score,
            },
        };
        Ok((face, score, outcome))
    }

    /// First lower-ranked match belonging to a different, named identity.
    fn named_runner_up(
        &self,
        matches: &[SlotMatch],
        top_face: FaceId,
    ) -> Option<(usize, FaceId)> {
        for (i, m) in matches.iter().enumerate().skip(1) {
            let face = self.index.face_for_slot(m.slot);
            if !face.is_known() || face == top_face {
                continue;
            }
            match self.index.record(face) {
                Some(record) if !record.is_session_only() => return Some((i, face)),
                _ => continue,
            }
        }
        None
    }

    /// A different named identity scoring close behind the runner-up makes
    /// the merge ambiguous; leave the records alone.
    fn runner_up_contested(
        &self,
        matches: &[SlotMatch],
        runner_idx: usize,
        top_face: FaceId,
        named: FaceId,
    ) -> bool {
        let margin = self.cfg.second_best_margin;
        let floor = (matches[runner_idx].score - margin)
            .min(self.cfg.recognition_threshold - 2 * margin);
        for m in &matches[runner_idx + 1..] {
            if m.score <= floor {
                break;
            }
            let face = self.index.face_for_slot(m.slot);
            if !face.is_known() || face == named || face == top_face {
                continue;
            }
            if self
                .index
                .record(face)
                .is_some_and(|r| !r.is_session_only())
            {
                tracing::info!(contender = %face, score = m.score, "merge contested by another named identity");
                return true;
            }
        }
        false
    }

    fn build_debug_matches(&self, matches: &[SlotMatch]) -> Vec<RecognitionMatch> {
        let mut out: Vec<RecognitionMatch> = Vec::new();
        for m in matches {
            if out.len() >= self.cfg.max_debug_matches {
                break;
            }
            let face = self.index.face_for_slot(m.slot);
            if !face.is_known() {
                continue;
            }
            if out.iter().any(|d| d.face_id == face) {
                continue;
            }
            let name = self
                .index
                .record(face)
                .and_then(|r| r.name().map(str::to_owned));
            out.push(RecognitionMatch {
                face_id: face,
                name,
                score: m.score,
            });
        }
        out
    }

    /// The detection matched `slot`. Refresh last-seen, keep the tracking
    /// binding current, and, where enrollment policy and the update
    /// throttle allow, fold the new features in as another sample.
    fn update_existing_slot<A: FaceAlbum>(
        &mut self,
        album: &mut A,
        slot: SlotId,
        features: &A::Features,
        meta: &DetectionMeta,
        now: DateTime<Utc>,
    ) -> Result<(), ResolverError> {
        let face = self.index.face_for_slot(slot);
        let Some(record) = self.index.record(face) else {
            debug_assert!(false, "slot {slot} matched without a record");
            tracing::warn!(%slot, "matched slot has no record");
            return Ok(());
        };
        let named = !record.is_session_only();
        let old_tracking = record.tracking_id();
        let elapsed_ms = now
            .signed_duration_since(record.last_updated())
            .num_milliseconds();

        if let Some(record) = self.index.record_mut(face) {
            record.touch_slot(slot, now);
        }
        // The record follows the new handle, but the handle's map entry is
        // not rewritten here: reconciliation still needs the old binding to
        // detect that two records are the same tracked person.
        if old_tracking != meta.tracking_id && meta.tracking_id.is_some() {
            tracing::debug!(%face, old = %old_tracking, new = %meta.tracking_id, "tracking handle moved");
            self.index.remove_tracking(old_tracking);
            if let Some(record) = self.index.record_mut(face) {
                record.set_tracking_id(meta.tracking_id);
            }
        }

        let allowed = self.enrollment_quota != 0
            && (!self.enrollment_id.is_known() || self.enrollment_id == face);
        let throttled = elapsed_ms < self.cfg.time_between_updates.as_millis() as i64;
        if !allowed || throttled {
            tracing::debug!(%face, allowed, throttled, "skipping sample update");
            return Ok(());
        }

        let sample_count = album.sample_count(slot);
        let has_space = sample_count < album.capacity().samples_per_slot;
        let targeted = self.enrollment_quota > 0 && self.enrollment_id.is_known();
        // Session-only records keep churning even when full so their data
        // tracks appearance changes; named ones stop unless configured (or
        // explicitly targeted) to keep refreshing.
        let refresh_when_full = !named || self.cfg.enroll_when_full || targeted;

        if has_space {
            album.register(features, slot, sample_count)?;
            tracing::debug!(%face, %slot, sample = sample_count, "stored new sample");
        } else if refresh_when_full {
            self.replace_weakest_sample(album, slot, features)?;
        } else {
            return Ok(());
        }

        self.index.register_slot(face, slot, now);
        if self.enrollment_quota > 0 {
            self.enrollment_quota -= 1;
            tracing::debug!(%face, remaining = self.enrollment_quota, "enrollment update consumed");
        }
        Ok(())
    }

    /// Slot is full: re-verify each stored sample against the slot and
    /// replace the weakest one, but only if the new sample outscores it.
    fn replace_weakest_sample<A: FaceAlbum>(
        &self,
        album: &mut A,
        slot: SlotId,
        features: &A::Features,
    ) -> Result<(), ResolverError> {
        let new_score = album.verify(features, slot)?;
        let mut weakest: Option<(usize, RecognitionScore)> = None;
        let mut lowest = new_score;
        for sample in 0..album.capacity().samples_per_slot {
            if !album.sample_present(slot, sample) {
                continue;
            }
            let held = album.feature(slot, sample)?;
            album.clear_sample(slot, sample)?;
            let rescored = album.verify(&held, slot);
            // Restore before propagating so a verify error cannot lose data.
            album.register(&held, slot, sample)?;
            let rescored = rescored?;
            if rescored < lowest {
                lowest = rescored;
                weakest = Some((sample, rescored));
            }
        }
        match weakest {
            Some((sample, evicted)) => {
                album.register(features, slot, sample)?;
                tracing::debug!(%slot, sample, evicted, new_score, "replaced weakest sample");
            }
            None => {
                tracing::debug!(%slot, new_score, "new sample outscores no stored sample; keeping all");
            }
        }
        Ok(())
    }

    /// Enroll a brand-new identity. Reports `None` when the album has no
    /// slot to give it, which skips enrollment for this detection only.
    fn register_new<A: FaceAlbum>(
        &mut self,
        album: &mut A,
        features: &A::Features,
        meta: &DetectionMeta,
        now: DateTime<Utc>,
    ) -> Result<Option<FaceId>, ResolverError> {
        let slot = match self.next_album_slot(album) {
            Ok(slot) => slot,
            Err(ResolverError::Backend(BackendError::AlbumFull)) => return Ok(None),
            Err(err) => return Err(err),
        };
        album.register(features, slot, 0)?;
        let face = self.index.allocate_face_id();
        self.index
            .insert_record(mien_core::EnrolledIdentity::new(face, now));
        self.index.register_slot(face, slot, now);
        self.index.bind_tracking(meta.tracking_id, face);
        if self.enrollment_quota > 0 {
            self.enrollment_quota -= 1;
        }
        tracing::info!(%face, %slot, tracking = %meta.tracking_id, "registered new identity");
        Ok(Some(face))
    }

    /// Find a slot for a new identity, evicting the oldest session-only
    /// record if the album is full. Named identities are never evicted.
    fn next_album_slot<A: FaceAlbum>(&mut self, album: &mut A) -> Result<SlotId, ResolverError> {
        let capacity = album.capacity().slots;
        if album.registered_slots() < capacity {
            return self
                .index
                .next_free_slot(capacity, |s| album.is_registered(s))
                .ok_or(ResolverError::Backend(BackendError::AlbumFull));
        }

        let Some(victim) = self.index.eviction_candidate() else {
            tracing::warn!("album full of named identities; cannot enroll");
            return Err(ResolverError::Backend(BackendError::AlbumFull));
        };
        tracing::info!(%victim, "album full; evicting oldest session-only identity");
        let slots = self.index.remove_identity(victim).unwrap_or_default();
        let mut freed = None;
        for s in &slots {
            album.clear_slot(*s)?;
            freed.get_or_insert(*s);
        }
        freed.ok_or(ResolverError::Backend(BackendError::AlbumFull))
    }

    /// The tracker already associated `meta.tracking_id` with an identity.
    /// If recognition now says the face is someone else, decide whether the
    /// two records are the same person and should merge, which survives,
    /// or (both named) that they must stay separate.
    fn reconcile_tracking<A: FaceAlbum>(
        &mut self,
        album: &mut A,
        recognized: FaceId,
        meta: &DetectionMeta,
        enrollment_enabled: bool,
    ) -> (FaceId, Option<(FaceId, FaceId)>) {
        let current = self.index.face_for_tracking(meta.tracking_id);
        if !recognized.is_known() {
            return (current, None);
        }
        if !current.is_known() || current == recognized {
            return (recognized, None);
        }
        if self.index.record(current).is_none() {
            // Already folded into another record during recognition.
            return (recognized, None);
        }
        let Some(recognized_named) = self.index.record(recognized).map(|r| !r.is_session_only())
        else {
            debug_assert!(false, "recognized face {recognized} without a record");
            return (recognized, None);
        };
        let (current_named, current_enrolled) = match self.index.record(current) {
            Some(r) => (!r.is_session_only(), r.enrolled_at()),
            None => return (recognized, None),
        };

        let (keep, drop) = match (recognized_named, current_named) {
            // Two people with real names are never the same record.
            (true, true) => {
                tracing::warn!(
                    tracking = %meta.tracking_id,
                    %current,
                    %recognized,
                    "tracked face recognized as a different named identity; not merging"
                );
                self.index.remove_tracking(meta.tracking_id);
                return (recognized, None);
            }
            (true, false) => (recognized, current),
            (false, true) => (current, recognized),
            // Both session-only: the earlier enrollment wins.
            (false, false) => {
                let recognized_enrolled = self
                    .index
                    .record(recognized)
                    .map(|r| r.enrolled_at())
                    .unwrap_or(current_enrolled);
                if current_enrolled <= recognized_enrolled {
                    (current, recognized)
                } else {
                    (recognized, current)
                }
            }
        };

        if drop == recognized || self.merging_allowed(keep, enrollment_enabled) {
            match self.merge_identities(album, keep, drop) {
                Ok(()) => return (keep, Some((keep, drop))),
                Err(err) => {
                    tracing::warn!(%keep, %drop, error = %err, "merge failed");
                    return (keep, None);
                }
            }
        }
        if drop == self.enrollment_id {
            tracing::info!(old = %self.enrollment_id, new = %keep, "retargeting enrollment after recognition");
            self.enrollment_id = keep;
        }
        (keep, None)
    }

    /// Growing `into` by merging counts as enrollment, so it obeys the
    /// same policy gates as adding samples.
    fn merging_allowed(&self, into: FaceId, enrollment_enabled: bool) -> bool {
        enrollment_enabled
            && self.enrollment_quota != 0
            && (!self.enrollment_id.is_known() || self.enrollment_id == into)
    }

    /// Fold `drop`'s record into `keep`'s: move its newest slots across up
    /// to the per-identity cap, clear the rest from the backend, and leave
    /// a one-shot marker on `keep` so callers can observe the rename.
    pub fn merge_identities<A: FaceAlbum>(
        &mut self,
        album: &mut A,
        keep: FaceId,
        drop: FaceId,
    ) -> Result<(), ResolverError> {
        if keep == drop {
            tracing::info!(%keep, "merge of an identity into itself; nothing to do");
            return Ok(());
        }
        if self.index.record(keep).is_none() {
            return Err(ResolverError::MissingRecord(keep));
        }
        let Some(drop_record) = self.index.record(drop) else {
            return Err(ResolverError::MissingRecord(drop));
        };

        let cap = self.cfg.max_slots_per_identity;
        let mut drop_slots: Vec<(SlotId, DateTime<Utc>)> = drop_record
            .slots()
            .iter()
            .map(|(s, t)| (*s, *t))
            .collect();
        // Newest-seen data from the dropped record is the most useful.
        drop_slots.sort_by_key(|(_, seen)| std::cmp::Reverse(*seen));

        let keep_len = self.index.record(keep).map(|r| r.slots().len()).unwrap_or(0);
        let room = cap.saturating_sub(keep_len).min(drop_slots.len());
        let (transfer, discard) = drop_slots.split_at(room);

        for (slot, _) in transfer {
            if !self.index.transfer_slot(*slot, drop, keep) {
                return Err(ResolverError::MissingRecord(drop));
            }
        }
        for (slot, _) in discard {
            self.index.release_slot(drop, *slot);
            album.clear_slot(*slot)?;
        }

        self.index.remove_identity(drop);

        // A restored record can arrive holding more slots than the cap;
        // once drop's surplus is gone, trim keep's oldest as well.
        let mut keep_slots: Vec<(SlotId, DateTime<Utc>)> = self
            .index
            .record(keep)
            .map(|r| r.slots().iter().map(|(s, t)| (*s, *t)).collect())
            .unwrap_or_default();
        if keep_slots.len() > cap {
            keep_slots.sort_by_key(|(_, seen)| *seen);
            for (slot, _) in &keep_slots[..keep_slots.len() - cap] {
                self.index.release_slot(keep, *slot);
                album.clear_slot(*slot)?;
            }
        }

        if let Some(record) = self.index.record_mut(keep) {
            record.set_previous_face_id(drop);
        }
        if self.enrollment_id == drop {
            tracing::info!(old = %drop, new = %keep, "enrollment target merged away; retargeting");
            self.enrollment_id = keep;
        }
        tracing::info!(%keep, %drop, moved = transfer.len(), discarded = discard.len(), "merged identities");
        Ok(())
    }

    /// Attach a name, optionally folding `face` into an already named
    /// record. Returns the surviving face id.
    pub fn assign_name<A: FaceAlbum>(
        &mut self,
        album: &mut A,
        face: FaceId,
        name: String,
        merge_with: Option<FaceId>,
    ) -> Result<FaceId, ResolverError> {
        match merge_with {
            Some(target) if target.is_known() && target != face => {
                let named = self
                    .index
                    .record(target)
                    .ok_or(ResolverError::MissingRecord(target))?
                    .name()
                    .is_some();
                if !named {
                    return Err(ResolverError::MergeTargetUnnamed(target));
                }
                if self.index.record(face).is_none() {
                    return Err(ResolverError::MissingRecord(face));
                }
                self.merge_identities(album, target, face)?;
                if let Some(record) = self.index.record_mut(target) {
                    record.set_name(name);
                }
                Ok(target)
            }
            _ => {
                let record = self
                    .index
                    .record_mut(face)
                    .ok_or(ResolverError::MissingRecord(face))?;
                record.set_name(name);
                tracing::info!(%face, "identity named");
                Ok(face)
            }
        }
    }

    /// Change a name, guarding against renaming the wrong record.
    pub fn rename(
        &mut self,
        face: FaceId,
        old_name: &str,
        new_name: String,
    ) -> Result<(), ResolverError> {
        let record = self
            .index
            .record_mut(face)
            .ok_or(ResolverError::MissingRecord(face))?;
        if record.name() != Some(old_name) {
            return Err(ResolverError::NameMismatch(face));
        }
        record.set_name(new_name);
        tracing::info!(%face, "identity renamed");
        Ok(())
    }

    /// Remove one identity and its backend data.
    pub fn erase<A: FaceAlbum>(
        &mut self,
        album: &mut A,
        face: FaceId,
    ) -> Result<(), ResolverError> {
        let slots = self
            .index
            .remove_identity(face)
            .ok_or(ResolverError::MissingRecord(face))?;
        for slot in slots {
            album.clear_slot(slot)?;
        }
        if self.enrollment_id == face {
            self.enrollment_id = FaceId::UNKNOWN;
            self.enrollment_tracking = TrackingId::NONE;
        }
        tracing::info!(%face, "identity erased");
        Ok(())
    }

    /// Remove every identity and all backend data.
    pub fn erase_all<A: FaceAlbum>(&mut self, album: &mut A) -> Result<(), ResolverError> {
        let faces: Vec<FaceId> = self.index.records().map(|r| r.face_id()).collect();
        for face in faces {
            if let Some(slots) = self.index.remove_identity(face) {
                for slot in slots {
                    album.clear_slot(slot)?;
                }
            }
        }
        self.enrollment_id = FaceId::UNKNOWN;
        self.enrollment_tracking = TrackingId::NONE;
        tracing::info!("all identities erased");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use mien_core::mock::{MockAlbum, MockBackend};
    use mien_core::{AlbumCapacity, FeatureBackend};

    use super::*;

    fn cfg() -> EngineConfig {
        EngineConfig {
            capacity: AlbumCapacity {
                slots: 4,
                samples_per_slot: 2,
            },
            time_between_updates: Duration::ZERO,
            ..EngineConfig::default()
        }
    }

    fn album(capacity: AlbumCapacity) -> MockAlbum {
        MockBackend::default().create_album(capacity).unwrap()
    }

    fn meta(tracking: i32) -> DetectionMeta {
        DetectionMeta {
            tracking_id: TrackingId(tracking),
            hold_count: 0,
            timestamp_ms: 0,
        }
    }

    fn resolve(
        resolver: &mut IdentityResolver,
        album: &mut MockAlbum,
        features: &[f32],
        tracking: i32,
    ) -> ResolveOutcome {
        resolver
            .resolve(album, &features.to_vec(), &meta(tracking), true, Utc::now())
            .unwrap()
    }

    #[test]
    fn first_detection_registers_face_one() {
        let mut resolver = IdentityResolver::new(cfg());
        let mut album = album(cfg().capacity);
        let outcome = resolve(&mut resolver, &mut album, &[1.0, 0.0], 1);
        assert_eq!(
            outcome,
            ResolveOutcome::Registered {
                face_id: FaceId(1),
                score: MAX_SCORE
            }
        );
        resolver.index().check_consistency(&album).unwrap();
    }

    #[test]
    fn same_face_recognized_not_duplicated() {
        let mut resolver = IdentityResolver::new(cfg());
        let mut album = album(cfg().capacity);
        resolve(&mut resolver, &mut album, &[1.0, 0.0], 1);
        let outcome = resolve(&mut resolver, &mut album, &[1.0, 0.001], 1);
        assert!(matches!(
            outcome,
            ResolveOutcome::Recognized { face_id: FaceId(1), .. }
        ));
        assert_eq!(resolver.index().len(), 1);
        resolver.index().check_consistency(&album).unwrap();
    }

    #[test]
    fn distinct_face_registers_second_identity() {
        let mut resolver = IdentityResolver::new(cfg());
        let mut album = album(cfg().capacity);
        resolve(&mut resolver, &mut album, &[1.0, 0.0], 1);
        let outcome = resolve(&mut resolver, &mut album, &[0.0, 1.0], 2);
        assert_eq!(
            outcome,
            ResolveOutcome::Registered {
                face_id: FaceId(2),
                score: MAX_SCORE
            }
        );
        resolver.index().check_consistency(&album).unwrap();
    }

    #[test]
    fn near_threshold_face_is_neither_matched_nor_enrolled() {
        let mut resolver = IdentityResolver::new(cfg());
        let mut album = album(cfg().capacity);
        resolve(&mut resolver, &mut album, &[1.0, 0.0], 1);
        // cos = 0.6 -> score 600: under the 750 threshold but inside the
        // 200-point add margin.
        let outcome = resolve(&mut resolver, &mut album, &[0.6, 0.8], 2);
        assert_eq!(outcome, ResolveOutcome::NoMatch);
        assert_eq!(resolver.index().len(), 1);
    }

    #[test]
    fn tracked_session_only_faces_merge_keeping_earlier() {
        let mut resolver = IdentityResolver::new(cfg());
        let mut album = album(cfg().capacity);
        resolve(&mut resolver, &mut album, &[1.0, 0.0], 1);
        resolve(&mut resolver, &mut album, &[0.0, 1.0], 2);
        // Tracker handle 2 now sees face 1's features: same person, so the
        // earlier record absorbs the later one.
        let outcome = resolve(&mut resolver, &mut album, &[1.0, 0.0], 2);
        assert!(matches!(
            outcome,
            ResolveOutcome::Merged {
                kept: FaceId(1),
                dropped: FaceId(2),
                ..
            }
        ));
        assert_eq!(resolver.index().len(), 1);
        assert_eq!(
            resolver.index().record(FaceId(1)).unwrap().previous_face_id(),
            FaceId(2)
        );
        resolver.index().check_consistency(&album).unwrap();
    }

    #[test]
    fn two_named_identities_never_merge() {
        let mut resolver = IdentityResolver::new(cfg());
        let mut album = album(cfg().capacity);
        resolve(&mut resolver, &mut album, &[1.0, 0.0], 1);
        resolve(&mut resolver, &mut album, &[0.0, 1.0], 2);
        resolver
            .assign_name(&mut album, FaceId(1), "ada".into(), None)
            .unwrap();
        resolver
            .assign_name(&mut album, FaceId(2), "grace".into(), None)
            .unwrap();
        let outcome = resolve(&mut resolver, &mut album, &[1.0, 0.0], 2);
        assert!(matches!(
            outcome,
            ResolveOutcome::Recognized { face_id: FaceId(1), .. }
        ));
        assert_eq!(resolver.index().len(), 2);
        resolver.index().check_consistency(&album).unwrap();
    }

    #[test]
    fn named_record_survives_merge_with_session_only() {
        let mut resolver = IdentityResolver::new(cfg());
        let mut album = album(cfg().capacity);
        resolve(&mut resolver, &mut album, &[1.0, 0.0], 1);
        resolver
            .assign_name(&mut album, FaceId(1), "ada".into(), None)
            .unwrap();
        resolve(&mut resolver, &mut album, &[0.0, 1.0], 2);
        // Session-only face 2's tracker now matches named face 1.
        let outcome = resolve(&mut resolver, &mut album, &[1.0, 0.0], 2);
        assert!(matches!(
            outcome,
            ResolveOutcome::Merged {
                kept: FaceId(1),
                dropped: FaceId(2),
                ..
            }
        ));
        assert_eq!(
            resolver.index().record(FaceId(1)).unwrap().name(),
            Some("ada")
        );
        resolver.index().check_consistency(&album).unwrap();
    }

    #[test]
    fn merge_trims_keep_slots_over_the_cap() {
        let capacity = AlbumCapacity {
            slots: 8,
            samples_per_slot: 2,
        };
        let mut resolver = IdentityResolver::new(EngineConfig {
            capacity,
            time_between_updates: Duration::ZERO,
            ..EngineConfig::default()
        });
        let mut album = album(capacity);
        resolve(&mut resolver, &mut album, &[1.0, 0.0], 1);
        resolve(&mut resolver, &mut album, &[0.0, 1.0], 2);
        // Grow face 1 past the per-identity cap, as a loaded snapshot can.
        let base = Utc::now();
        for (i, features) in [[1.0f32, 0.02], [1.0, 0.04], [1.0, 0.06]].iter().enumerate() {
            let slot = SlotId(2 + i as i32);
            album.register(&features.to_vec(), slot, 0).unwrap();
            resolver.index_mut().register_slot(
                FaceId(1),
                slot,
                base + chrono::Duration::seconds(i as i64 + 1),
            );
        }
        resolver
            .merge_identities(&mut album, FaceId(1), FaceId(2))
            .unwrap();
        let cap = EngineConfig::default().max_slots_per_identity;
        assert_eq!(resolver.index().record(FaceId(1)).unwrap().slots().len(), cap);
        // Face 2's slot went first, then face 1's oldest.
        assert!(!album.is_registered(SlotId(1)));
        assert!(!album.is_registered(SlotId(0)));
        resolver.index().check_consistency(&album).unwrap();
    }

    #[test]
    fn merge_into_itself_is_a_no_op() {
        let mut resolver = IdentityResolver::new(cfg());
        let mut album = album(cfg().capacity);
        resolve(&mut resolver, &mut album, &[1.0, 0.0], 1);
        resolver
            .merge_identities(&mut album, FaceId(1), FaceId(1))
            .unwrap();
        assert_eq!(resolver.index().len(), 1);
        resolver.index().check_consistency(&album).unwrap();
    }

    #[test]
    fn full_album_evicts_oldest_session_only() {
        let capacity = AlbumCapacity {
            slots: 2,
            samples_per_slot: 2,
        };
        let mut resolver = IdentityResolver::new(EngineConfig {
            capacity,
            time_between_updates: Duration::ZERO,
            ..EngineConfig::default()
        });
        let mut album = album(capacity);
        resolve(&mut resolver, &mut album, &[1.0, 0.0], 1);
        resolve(&mut resolver, &mut album, &[0.0, 1.0], 2);
        // Face 1 is the oldest session-only record; a third person evicts it.
        let outcome = resolve(&mut resolver, &mut album, &[0.5, -0.866], 3);
        assert!(matches!(
            outcome,
            ResolveOutcome::Registered { face_id: FaceId(3), .. }
        ));
        assert!(resolver.index().record(FaceId(1)).is_none());
        assert!(resolver.index().record(FaceId(2)).is_some());
        resolver.index().check_consistency(&album).unwrap();
    }

    #[test]
    fn named_identities_are_never_evicted() {
        let capacity = AlbumCapacity {
            slots: 1,
            samples_per_slot: 2,
        };
        let mut resolver = IdentityResolver::new(EngineConfig {
            capacity,
            time_between_updates: Duration::ZERO,
            ..EngineConfig::default()
        });
        let mut album = album(capacity);
        resolve(&mut resolver, &mut album, &[1.0, 0.0], 1);
        resolver
            .assign_name(&mut album, FaceId(1), "ada".into(), None)
            .unwrap();
        let outcome = resolve(&mut resolver, &mut album, &[0.0, 1.0], 2);
        assert_eq!(outcome, ResolveOutcome::NoMatch);
        assert!(resolver.index().record(FaceId(1)).is_some());
        assert_eq!(
            resolver.index().record(FaceId(1)).unwrap().name(),
            Some("ada")
        );
        resolver.index().check_consistency(&album).unwrap();
    }

    #[test]
    fn second_best_named_match_wins_over_session_only() {
        // Features arranged so an unnamed record ranks first and a named
        // one lands just behind, inside the second-best margin.
        let mut resolver = IdentityResolver::new(cfg());
        let mut album = album(cfg().capacity);
        resolve(&mut resolver, &mut album, &[1.0, 0.0], 1); // session-only
        // 60 degrees away: scores 500 against face 1, far enough below the
        // add margin to enroll as a second identity.
        resolve(&mut resolver, &mut album, &[0.5, 0.866], 2); // will be named
        resolver
            .assign_name(&mut album, FaceId(2), "ada".into(), None)
            .unwrap();
        resolver.index_mut().clear_tracking();

        // A face 25 degrees from face 1 and 35 from face 2 scores ~906 and
        // ~819: both above threshold, with the named record close behind
        // the unnamed one.
        let outcome = resolve(&mut resolver, &mut album, &[0.9063, 0.4226], 5);
        assert!(matches!(
            outcome,
            ResolveOutcome::Merged {
                kept: FaceId(2),
                dropped: FaceId(1),
                ..
            }
        ));
        assert_eq!(
            resolver.index().record(FaceId(2)).unwrap().name(),
            Some("ada")
        );
        resolver.index().check_consistency(&album).unwrap();
    }

    #[test]
    fn enrollment_quota_limits_updates() {
        let mut resolver = IdentityResolver::new(cfg());
        let mut album = album(cfg().capacity);
        resolver.set_allowed_enrollments(1, FaceId::UNKNOWN, false);
        resolve(&mut resolver, &mut album, &[1.0, 0.0], 1);
        // Quota spent on the registration; nothing further may enroll.
        let outcome = resolve(&mut resolver, &mut album, &[0.0, 1.0], 2);
        assert_eq!(outcome, ResolveOutcome::NoMatch);
        assert_eq!(resolver.index().len(), 1);
    }

    #[test]
    fn targeted_enrollment_completion_reports_once() {
        let mut resolver = IdentityResolver::new(cfg());
        let mut album = album(cfg().capacity);
        resolve(&mut resolver, &mut album, &[1.0, 0.0], 1);
        resolver.set_allowed_enrollments(2, FaceId(1), false);
        resolve(&mut resolver, &mut album, &[1.0, 0.01], 1);
        assert_eq!(resolver.enrollment_completed_for(FaceId(1)), None);
        resolve(&mut resolver, &mut album, &[1.0, 0.02], 1);
        assert_eq!(resolver.enrollment_completed_for(FaceId(1)), Some(2));
        assert_eq!(resolver.enrollment_completed_for(FaceId(1)), None);
    }

    #[test]
    fn targeted_enrollment_ignores_other_faces() {
        let mut resolver = IdentityResolver::new(cfg());
        let mut album = album(cfg().capacity);
        resolve(&mut resolver, &mut album, &[1.0, 0.0], 1);
        resolver.set_allowed_enrollments(5, FaceId(1), false);
        // A different person shows up mid-enrollment: not enrolled.
        let outcome = resolve(&mut resolver, &mut album, &[0.0, 1.0], 2);
        assert_eq!(outcome, ResolveOutcome::NoMatch);
        assert_eq!(resolver.index().len(), 1);
    }

    #[test]
    fn cancelling_targeted_enrollment_sets_discard_flag() {
        let mut resolver = IdentityResolver::new(cfg());
        let mut album = album(cfg().capacity);
        resolve(&mut resolver, &mut album, &[1.0, 0.0], 1);
        resolver.set_allowed_enrollments(5, FaceId(1), false);
        resolver.set_allowed_enrollments(-1, FaceId::UNKNOWN, true);
        assert!(resolver.take_cancelled());
        assert!(!resolver.take_cancelled());
    }

    #[test]
    fn assign_name_with_merge_requires_named_target() {
        let mut resolver = IdentityResolver::new(cfg());
        let mut album = album(cfg().capacity);
        resolve(&mut resolver, &mut album, &[1.0, 0.0], 1);
        resolve(&mut resolver, &mut album, &[0.0, 1.0], 2);
        let err = resolver
            .assign_name(&mut album, FaceId(1), "ada".into(), Some(FaceId(2)))
            .unwrap_err();
        assert!(matches!(err, ResolverError::MergeTargetUnnamed(FaceId(2))));
    }

    #[test]
    fn rename_checks_old_name() {
        let mut resolver = IdentityResolver::new(cfg());
        let mut album = album(cfg().capacity);
        resolve(&mut resolver, &mut album, &[1.0, 0.0], 1);
        resolver
            .assign_name(&mut album, FaceId(1), "ada".into(), None)
            .unwrap();
        assert!(matches!(
            resolver.rename(FaceId(1), "grace", "hopper".into()),
            Err(ResolverError::NameMismatch(FaceId(1)))
        ));
        resolver.rename(FaceId(1), "ada", "lovelace".into()).unwrap();
        assert_eq!(
            resolver.index().record(FaceId(1)).unwrap().name(),
            Some("lovelace")
        );
    }

    #[test]
    fn erase_clears_backend_slots() {
        let mut resolver = IdentityResolver::new(cfg());
        let mut album = album(cfg().capacity);
        resolve(&mut resolver, &mut album, &[1.0, 0.0], 1);
        resolver.erase(&mut album, FaceId(1)).unwrap();
        assert!(resolver.index().is_empty());
        assert_eq!(album.registered_slots(), 0);
        resolver.index().check_consistency(&album).unwrap();
    }

    #[test]
    fn erase_all_resets_everything() {
        let mut resolver = IdentityResolver::new(cfg());
        let mut album = album(cfg().capacity);
        resolve(&mut resolver, &mut album, &[1.0, 0.0], 1);
        resolve(&mut resolver, &mut album, &[0.0, 1.0], 2);
        resolver.erase_all(&mut album).unwrap();
        assert!(resolver.index().is_empty());
        assert_eq!(album.registered_slots(), 0);
    }
}
