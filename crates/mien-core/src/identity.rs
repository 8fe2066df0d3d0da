//! Per-identity enrollment record.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::types::{FaceId, RecognitionMatch, RecognitionScore, SlotId, TrackingId};

/// Everything remembered about one enrolled identity.
///
/// An identity is "session-only" until it is given a name; session-only
/// identities are eligible for eviction when the album fills up and are
/// never persisted.
#[derive(Debug, Clone)]
pub struct EnrolledIdentity {
    face_id: FaceId,
    name: Option<String>,
    enrolled_at: DateTime<Utc>,
    last_updated: DateTime<Utc>,
    score: RecognitionScore,
    /// Album slots holding this identity's samples, with the last time
    /// each slot matched a detection.
    slots: BTreeMap<SlotId, DateTime<Utc>>,
    tracking_id: TrackingId,
    /// Set when this record absorbed another via a merge, so the caller
    /// can observe the identity change once. Cleared after reporting.
    previous_face_id: FaceId,
    debug_matches: Vec<RecognitionMatch>,
}

impl EnrolledIdentity {
    pub fn new(face_id: FaceId, enrolled_at: DateTime<Utc>) -> Self {
        Self {
            face_id,
            name: None,
            enrolled_at,
            last_updated: enrolled_at,
            score: 0,
            slots: BTreeMap::new(),
            tracking_id: TrackingId::NONE,
            previous_face_id: FaceId::UNKNOWN,
            debug_matches: Vec::new(),
        }
    }

    /// Reconstruct a record from persisted fields. Restored identities are
    /// named by definition (session-only records are never serialized).
    pub fn restored(
        face_id: FaceId,
        name: String,
        enrolled_at: DateTime<Utc>,
        last_updated: DateTime<Utc>,
        score: RecognitionScore,
        slots: BTreeMap<SlotId, DateTime<Utc>>,
    ) -> Self {
        Self {
            face_id,
            name: Some(name),
            enrolled_at,
            last_updated,
            score,
            slots,
            tracking_id: TrackingId::NONE,
            previous_face_id: FaceId::UNKNOWN,
            debug_matches: Vec::new(),
        }
    }

    pub fn face_id(&self) -> FaceId {
        self.face_id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn set_name(&mut self, name: String) {
        self.name = Some(name);
    }

    /// Enrolled but unnamed; eligible for eviction.
    pub fn is_session_only(&self) -> bool {
        self.name.is_none()
    }

    pub fn enrolled_at(&self) -> DateTime<Utc> {
        self.enrolled_at
    }

    pub fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }

    /// Most recent last-seen time across this identity's slots. Falls back
    /// to the enrollment time for a (transiently) slotless record.
    pub fn last_seen(&self) -> DateTime<Utc> {
        self.slots
            .values()
            .copied()
            .max()
            .unwrap_or(self.enrolled_at)
    }

    pub fn score(&self) -> RecognitionScore {
        self.score
    }

    pub fn set_score(&mut self, score: RecognitionScore) {
        self.score = score;
    }

    pub fn slots(&self) -> &BTreeMap<SlotId, DateTime<Utc>> {
        &self.slots
    }

    pub fn has_slot(&self, slot: SlotId) -> bool {
        self.slots.contains_key(&slot)
    }

    /// First slot in id order, if any.
    pub fn first_slot(&self) -> Option<SlotId> {
        self.slots.keys().next().copied()
    }

    pub fn tracking_id(&self) -> TrackingId {
        self.tracking_id
    }

    pub fn set_tracking_id(&mut self, tracking_id: TrackingId) {
        self.tracking_id = tracking_id;
    }

    pub fn clear_tracking_id(&mut self) {
        self.tracking_id = TrackingId::NONE;
    }

    pub fn previous_face_id(&self) -> FaceId {
        self.previous_face_id
    }

    /// Mark this record as having just absorbed `previous` in a merge.
    /// Reported once, then cleared via [`clear_previous_face_id`](Self::clear_previous_face_id).
    pub fn set_previous_face_id(&mut self, previous: FaceId) {
        self.previous_face_id = previous;
    }

    /// Drop the one-shot "just merged" marker after it has been reported.
    pub fn clear_previous_face_id(&mut self) {
        self.previous_face_id = FaceId::UNKNOWN;
    }

    pub fn debug_matches(&self) -> &[RecognitionMatch] {
        &self.debug_matches
    }

    pub fn set_debug_matches(&mut self, matches: Vec<RecognitionMatch>) {
        self.debug_matches = matches;
    }

    /// Record that `slot` holds data for this identity as of `at`, and mark
    /// the record updated. Used both when adding a slot and when new sample
    /// data lands in an existing one.
    pub(crate) fn add_or_update_slot(&mut self, slot: SlotId, at: DateTime<Utc>) {
        self.slots.insert(slot, at);
        self.last_updated = at;
    }

    /// Refresh a slot's last-seen time without counting as an enrollment
    /// update (does not reset the update throttle).
    pub fn touch_slot(&mut self, slot: SlotId, at: DateTime<Utc>) {
        if let Some(seen) = self.slots.get_mut(&slot) {
            *seen = at;
        }
    }

    /// Move a slot (with its last-seen time) in from another record.
    pub(crate) fn adopt_slot(&mut self, slot: SlotId, seen: DateTime<Utc>) {
        self.slots.insert(slot, seen);
    }

    pub(crate) fn remove_slot(&mut self, slot: SlotId) -> bool {
        self.slots.remove(&slot).is_some()
    }
}
