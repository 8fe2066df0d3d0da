//! Mirrored slot/identity index.
//!
//! Two maps that must never disagree — slot → identity, and the slot set
//! embedded in every identity record — are owned by one structure that only
//! exposes paired mutations. A standalone consistency check remains for
//! load-time validation and debug assertions.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::backend::FaceAlbum;
use crate::identity::EnrolledIdentity;
use crate::types::{FaceId, SlotId, TrackingId};

#[derive(Error, Debug)]
pub enum ConsistencyError {
    #[error("backend album has {backend} registered slots but index maps {index}")]
    SlotCountMismatch { backend: usize, index: usize },
    #[error("slot {0} is in the index but not registered in the backend")]
    SlotNotRegistered(SlotId),
    #[error("slot {slot} of face {face} is missing from the slot index")]
    MissingSlotMapping { slot: SlotId, face: FaceId },
    #[error("slot {slot} maps to face {mapped} instead of {face}")]
    SlotMappedElsewhere {
        slot: SlotId,
        mapped: FaceId,
        face: FaceId,
    },
}

/// Forward/reverse bookkeeping for the album: identity records, the
/// slot-to-identity mirror, the ephemeral tracking-handle map, and the
/// allocation cursors for new identities and slots.
#[derive(Debug, Default)]
pub struct AlbumIndex {
    records: BTreeMap<FaceId, EnrolledIdentity>,
    slot_to_face: BTreeMap<SlotId, FaceId>,
    tracking_to_face: HashMap<TrackingId, FaceId>,
    next_face_id: i32,
    next_slot: i32,
}

impl AlbumIndex {
    pub fn new() -> Self {
        Self {
            records: BTreeMap::new(),
            slot_to_face: BTreeMap::new(),
            tracking_to_face: HashMap::new(),
            next_face_id: 1,
            next_slot: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn records(&self) -> impl Iterator<Item = &EnrolledIdentity> {
        self.records.values()
    }

    pub fn record(&self, face: FaceId) -> Option<&EnrolledIdentity> {
        self.records.get(&face)
    }

    pub fn record_mut(&mut self, face: FaceId) -> Option<&mut EnrolledIdentity> {
        self.records.get_mut(&face)
    }

    /// Identity owning `slot`, or [`FaceId::UNKNOWN`] if the mapping is
    /// missing (a degraded lookup, not a crash).
    pub fn face_for_slot(&self, slot: SlotId) -> FaceId {
        match self.slot_to_face.get(&slot) {
            Some(face) => *face,
            None => {
                tracing::error!(%slot, "no identity mapped for slot");
                FaceId::UNKNOWN
            }
        }
    }

    pub fn face_for_tracking(&self, tracking: TrackingId) -> FaceId {
        self.tracking_to_face
            .get(&tracking)
            .copied()
            .unwrap_or(FaceId::UNKNOWN)
    }

    /// Insert a freshly created record, mirroring its slots into the slot
    /// index. The record's slots must not collide with existing mappings.
    pub fn insert_record(&mut self, record: EnrolledIdentity) {
        let face = record.face_id();
        for slot in record.slots().keys() {
            let prev = self.slot_to_face.insert(*slot, face);
            debug_assert!(prev.is_none(), "slot {slot} already mapped");
        }
        if record.tracking_id().is_some() {
            self.tracking_to_face.insert(record.tracking_id(), face);
        }
        self.records.insert(face, record);
    }

    /// Paired mutation: add `slot` to `face`'s record and the slot index.
    /// Returns false if the record is missing.
    pub fn register_slot(&mut self, face: FaceId, slot: SlotId, at: DateTime<Utc>) -> bool {
        let Some(record) = self.records.get_mut(&face) else {
            return false;
        };
        record.add_or_update_slot(slot, at);
        self.slot_to_face.insert(slot, face);
        true
    }

    /// Paired mutation: repoint `slot` from `from`'s record to `to`'s,
    /// carrying its last-seen time. Returns false if either record or the
    /// slot itself is missing.
    pub fn transfer_slot(&mut self, slot: SlotId, from: FaceId, to: FaceId) -> bool {
        if !self.records.contains_key(&to) {
            return false;
        }
        let Some(seen) = self
            .records
            .get_mut(&from)
            .and_then(|r| r.slots().get(&slot).copied())
        else {
            return false;
        };
        self.records
            .get_mut(&from)
            .map(|r| r.remove_slot(slot));
        if let Some(record) = self.records.get_mut(&to) {
            record.adopt_slot(slot, seen);
        }
        self.slot_to_face.insert(slot, to);
        true
    }

    /// Paired mutation: drop `slot` from `face`'s record and the slot
    /// index. The caller is responsible for clearing the backend slot.
    pub fn release_slot(&mut self, face: FaceId, slot: SlotId) -> bool {
        let removed_from_record = self
            .records
            .get_mut(&face)
            .map(|r| r.remove_slot(slot))
            .unwrap_or(false);
        let removed_from_index = self.slot_to_face.remove(&slot).is_some();
        removed_from_record && removed_from_index
    }

    /// Remove an identity entirely, returning the slots that must be
    /// cleared in the backend. Also drops its tracking binding and scrubs
    /// any stale tracking or slot entries still pointing at it.
    pub fn remove_identity(&mut self, face: FaceId) -> Option<Vec<SlotId>> {
        let record = self.records.remove(&face)?;
        self.tracking_to_face.remove(&record.tracking_id());

        let slots: Vec<SlotId> = record.slots().keys().copied().collect();
        for slot in &slots {
            self.slot_to_face.remove(slot);
        }

        self.tracking_to_face.retain(|tracking, mapped| {
            if *mapped == face {
                tracing::warn!(%tracking, %face, "removed stale tracking binding");
                false
            } else {
                true
            }
        });
        self.slot_to_face.retain(|slot, mapped| {
            if *mapped == face {
                tracing::warn!(%slot, %face, "removed stale slot binding");
                false
            } else {
                true
            }
        });

        Some(slots)
    }

    /// Attach a tracking handle to an identity, dropping the record's old
    /// handle binding if it changed.
    pub fn bind_tracking(&mut self, tracking: TrackingId, face: FaceId) {
        if let Some(record) = self.records.get_mut(&face) {
            let old = record.tracking_id();
            if old != tracking && self.tracking_to_face.get(&old) == Some(&face) {
                self.tracking_to_face.remove(&old);
            }
            record.set_tracking_id(tracking);
        }
        if tracking.is_some() {
            self.tracking_to_face.insert(tracking, face);
        }
    }

    pub fn remove_tracking(&mut self, tracking: TrackingId) {
        if let Some(face) = self.tracking_to_face.remove(&tracking) {
            if let Some(record) = self.records.get_mut(&face) {
                record.clear_tracking_id();
            }
        }
    }

    /// Forget every tracking handle (external tracker reset).
    pub fn clear_tracking(&mut self) {
        for record in self.records.values_mut() {
            record.clear_tracking_id();
        }
        self.tracking_to_face.clear();
    }

    /// Next unused identity, monotonic, skipping [`FaceId::UNKNOWN`] and
    /// wrapping rather than colliding with live ids.
    pub fn allocate_face_id(&mut self) -> FaceId {
        while self.records.contains_key(&FaceId(self.next_face_id))
            || self.next_face_id == FaceId::UNKNOWN.0
        {
            self.next_face_id = self.next_face_id.wrapping_add(1);
        }
        FaceId(self.next_face_id)
    }

    pub fn next_face_id(&self) -> FaceId {
        FaceId(self.next_face_id)
    }

    /// Seed the allocation cursor (from a restored snapshot).
    pub fn set_next_face_id(&mut self, face: FaceId) {
        self.next_face_id = face.0.max(1);
    }

    /// Bounded wraparound scan for an unregistered slot id. `is_registered`
    /// answers against the backend album. Returns `None` if every id in
    /// `0..capacity` is taken.
    pub fn next_free_slot(
        &mut self,
        capacity: usize,
        is_registered: impl Fn(SlotId) -> bool,
    ) -> Option<SlotId> {
        for _ in 0..capacity {
            let candidate = SlotId(self.next_slot);
            self.next_slot += 1;
            if self.next_slot as usize >= capacity {
                self.next_slot = 0;
            }
            if !is_registered(candidate) {
                return Some(candidate);
            }
        }
        None
    }

    /// Eviction victim when the album is full: the session-only identity
    /// with the oldest last-update time. Named identities are never
    /// candidates.
    pub fn eviction_candidate(&self) -> Option<FaceId> {
        self.records
            .values()
            .filter(|r| r.is_session_only())
            .min_by_key(|r| r.last_updated())
            .map(|r| r.face_id())
    }

    /// Validate the three bookkeeping invariants against a backend album:
    /// registered-slot counts agree, every indexed slot is registered, and
    /// every record's slot maps back to that record.
    pub fn check_consistency<A: FaceAlbum>(&self, album: &A) -> Result<(), ConsistencyError> {
        let backend_count = album.registered_slots();
        if backend_count != self.slot_to_face.len() {
            return Err(ConsistencyError::SlotCountMismatch {
                backend: backend_count,
                index: self.slot_to_face.len(),
            });
        }

        for slot in self.slot_to_face.keys() {
            if !album.is_registered(*slot) {
                return Err(ConsistencyError::SlotNotRegistered(*slot));
            }
        }

        for record in self.records.values() {
            for slot in record.slots().keys() {
                match self.slot_to_face.get(slot) {
                    None => {
                        return Err(ConsistencyError::MissingSlotMapping {
                            slot: *slot,
                            face: record.face_id(),
                        })
                    }
                    Some(mapped) if *mapped != record.face_id() => {
                        return Err(ConsistencyError::SlotMappedElsewhere {
                            slot: *slot,
                            mapped: *mapped,
                            face: record.face_id(),
                        })
                    }
                    Some(_) => {}
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FaceAlbum, FeatureBackend};
    use crate::mock::{MockAlbum, MockBackend};
    use crate::types::AlbumCapacity;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn album_with(slots: &[SlotId]) -> MockAlbum {
        let backend = MockBackend::default();
        let mut album = backend
            .create_album(AlbumCapacity {
                slots: 8,
                samples_per_slot: 2,
            })
            .unwrap();
        for slot in slots {
            album.register(&vec![1.0, 0.0], *slot, 0).unwrap();
        }
        album
    }

    fn seeded_index() -> AlbumIndex {
        let mut index = AlbumIndex::new();
        let mut a = EnrolledIdentity::new(FaceId(1), t(10));
        a.add_or_update_slot(SlotId(0), t(10));
        index.insert_record(a);
        let mut b = EnrolledIdentity::new(FaceId(2), t(20));
        b.add_or_update_slot(SlotId(1), t(20));
        index.insert_record(b);
        index
    }

    #[test]
    fn paired_ops_keep_maps_in_sync() {
        let mut index = seeded_index();
        assert_eq!(index.face_for_slot(SlotId(0)), FaceId(1));
        assert_eq!(index.face_for_slot(SlotId(1)), FaceId(2));

        assert!(index.transfer_slot(SlotId(1), FaceId(2), FaceId(1)));
        assert_eq!(index.face_for_slot(SlotId(1)), FaceId(1));
        assert!(index.record(FaceId(1)).unwrap().has_slot(SlotId(1)));
        assert!(!index.record(FaceId(2)).unwrap().has_slot(SlotId(1)));

        assert!(index.release_slot(FaceId(1), SlotId(1)));
        assert_eq!(index.face_for_slot(SlotId(1)), FaceId::UNKNOWN);
    }

    #[test]
    fn transfer_to_missing_record_fails() {
        let mut index = seeded_index();
        assert!(!index.transfer_slot(SlotId(0), FaceId(1), FaceId(9)));
        // nothing changed
        assert_eq!(index.face_for_slot(SlotId(0)), FaceId(1));
    }

    #[test]
    fn remove_identity_returns_slots_and_clears_tracking() {
        let mut index = seeded_index();
        index.bind_tracking(TrackingId(5), FaceId(1));
        let slots = index.remove_identity(FaceId(1)).unwrap();
        assert_eq!(slots, vec![SlotId(0)]);
        assert_eq!(index.face_for_tracking(TrackingId(5)), FaceId::UNKNOWN);
        assert_eq!(index.face_for_slot(SlotId(0)), FaceId::UNKNOWN);
    }

    #[test]
    fn bind_tracking_drops_old_handle() {
        let mut index = seeded_index();
        index.bind_tracking(TrackingId(5), FaceId(1));
        index.bind_tracking(TrackingId(6), FaceId(1));
        assert_eq!(index.face_for_tracking(TrackingId(5)), FaceId::UNKNOWN);
        assert_eq!(index.face_for_tracking(TrackingId(6)), FaceId(1));
    }

    #[test]
    fn face_id_allocation_skips_unknown_and_live_ids() {
        let mut index = seeded_index(); // holds 1 and 2
        assert_eq!(index.allocate_face_id(), FaceId(3));

        let mut wrapping = AlbumIndex::new();
        wrapping.set_next_face_id(FaceId(i32::MAX));
        let id = wrapping.allocate_face_id();
        assert_eq!(id, FaceId(i32::MAX));
        wrapping.insert_record(EnrolledIdentity::new(id, t(0)));
        // wraps through i32::MIN.. and must never hand out 0
        let next = wrapping.allocate_face_id();
        assert_ne!(next, FaceId::UNKNOWN);
        assert_ne!(next, id);
    }

    #[test]
    fn next_free_slot_wraps_and_bounds() {
        let mut index = AlbumIndex::new();
        let taken = [SlotId(0), SlotId(1)];
        let slot = index
            .next_free_slot(4, |s| taken.contains(&s))
            .unwrap();
        assert_eq!(slot, SlotId(2));
        // completely full
        assert!(index.next_free_slot(4, |_| true).is_none());
    }

    #[test]
    fn eviction_prefers_oldest_session_only() {
        let mut index = AlbumIndex::new();
        let mut named = EnrolledIdentity::new(FaceId(1), t(1));
        named.set_name("Ada".into());
        index.insert_record(named);
        index.insert_record(EnrolledIdentity::new(FaceId(2), t(50)));
        index.insert_record(EnrolledIdentity::new(FaceId(3), t(5)));
        assert_eq!(index.eviction_candidate(), Some(FaceId(3)));
    }

    #[test]
    fn eviction_never_picks_named() {
        let mut index = AlbumIndex::new();
        let mut named = EnrolledIdentity::new(FaceId(1), t(1));
        named.set_name("Ada".into());
        index.insert_record(named);
        assert_eq!(index.eviction_candidate(), None);
    }

    #[test]
    fn consistency_accepts_matching_state() {
        let index = seeded_index();
        let album = album_with(&[SlotId(0), SlotId(1)]);
        assert!(index.check_consistency(&album).is_ok());
    }

    #[test]
    fn consistency_rejects_count_mismatch() {
        let index = seeded_index();
        let album = album_with(&[SlotId(0)]);
        assert!(matches!(
            index.check_consistency(&album),
            Err(ConsistencyError::SlotCountMismatch { .. })
        ));
    }

    #[test]
    fn consistency_rejects_unregistered_slot() {
        let index = seeded_index();
        let album = album_with(&[SlotId(0), SlotId(7)]);
        assert!(matches!(
            index.check_consistency(&album),
            Err(ConsistencyError::SlotNotRegistered(_))
        ));
    }
}
