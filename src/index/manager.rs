//! Stream index manager
//!
//! Owns every identity's stream bundle, the reverse map from an activity to
//! the references pointing at it, and the single read/write lock guarding
//! both. Coordinator and reader share one manager through an `Arc`.

use super::bucket::{DayKey, Reference};
use super::stream_index::{Placement, StreamIndex};
use super::streams::IdentityStreams;
use crate::model::{Activity, ActivityId, IdentityId, StreamType};
use ahash::{AHashMap, AHashSet};
use parking_lot::{RwLock, RwLockReadGuard, RwLockUpgradableReadGuard, RwLockWriteGuard};
use serde::Serialize;

/// Position of one reference: whose index, which type, which day.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RefLocation {
    pub identity: IdentityId,
    pub stream: StreamType,
    pub day: DayKey,
}

/// Counters for the whole store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub identities: usize,
    pub indices: usize,
    pub references: usize,
    pub indexed_activities: usize,
}

/// Lock-protected state. Reached only through the manager's guards.
#[derive(Debug, Default)]
pub struct IndexStore {
    streams: AHashMap<IdentityId, IdentityStreams>,
    locations: AHashMap<ActivityId, AHashSet<RefLocation>>,
}

impl IndexStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&mut self, activity_id: &ActivityId, location: RefLocation) {
        self.locations
            .entry(activity_id.clone())
            .or_default()
            .insert(location);
    }

    fn forget(&mut self, activity_id: &ActivityId, location: &RefLocation) {
        if let Some(set) = self.locations.get_mut(activity_id) {
            set.remove(location);
            if set.is_empty() {
                self.locations.remove(activity_id);
            }
        }
    }

    pub fn index(&self, identity: &IdentityId, stream: StreamType) -> Option<&StreamIndex> {
        self.streams.get(identity)?.get(stream)
    }

    pub fn index_mut(&mut self, identity: &IdentityId, stream: StreamType) -> Option<&mut StreamIndex> {
        self.streams.get_mut(identity)?.get_mut(stream)
    }

    /// The index, created along with the identity's bundle when missing.
    pub fn index_or_create(&mut self, identity: &IdentityId, stream: StreamType) -> &mut StreamIndex {
        self.streams
            .entry(identity.clone())
            .or_default()
            .get_or_create(stream)
    }

    /// Add (or find) the reference for the activity's current day.
    ///
    /// An index holds at most one reference per activity. When the activity
    /// already sits in another day of this index, an older reference is moved
    /// to the current day and a newer one is left where it is.
    pub fn add_reference(
        &mut self,
        identity: &IdentityId,
        stream: StreamType,
        activity: &Activity,
        hidden: bool,
    ) -> Placement {
        let ts = activity.effective_timestamp();
        let target = DayKey::from_timestamp(ts);
        let elsewhere = self.locations.get(&activity.id).and_then(|set| {
            set.iter()
                .find(|l| &l.identity == identity && l.stream == stream && l.day != target)
                .cloned()
        });

        let mut moved_from = None;
        if let Some(stale) = elsewhere {
            let held_at = self
                .index(identity, stream)
                .and_then(|index| index.get_at(stale.day, &activity.id))
                .map(|r| r.last_updated);
            match held_at {
                Some(at) if at >= ts => {
                    return Placement {
                        day: stale.day,
                        created: false,
                        moved_from: None,
                    };
                }
                Some(_) => {
                    self.remove_reference_at(&stale, &activity.id);
                    moved_from = Some(stale.day);
                }
                None => self.forget(&activity.id, &stale),
            }
        }

        let mut placement = self
            .index_or_create(identity, stream)
            .get_or_create(activity, hidden);
        if placement.created {
            self.record(
                &activity.id,
                RefLocation {
                    identity: identity.clone(),
                    stream,
                    day: placement.day,
                },
            );
        }
        if moved_from.is_some() {
            placement.created = false;
            placement.moved_from = moved_from;
        }
        placement
    }

    /// Remove a reference from the day of `at_timestamp`, or from wherever it
    /// is when no timestamp is given.
    pub fn remove_reference(
        &mut self,
        identity: &IdentityId,
        stream: StreamType,
        activity_id: &ActivityId,
        at_timestamp: Option<i64>,
    ) -> Option<Reference> {
        let (day, reference) = self
            .index_mut(identity, stream)?
            .remove(activity_id, at_timestamp)?;
        self.forget(
            activity_id,
            &RefLocation {
                identity: identity.clone(),
                stream,
                day,
            },
        );
        Some(reference)
    }

    pub fn remove_reference_at(
        &mut self,
        location: &RefLocation,
        activity_id: &ActivityId,
    ) -> Option<Reference> {
        let reference = self
            .index_mut(&location.identity, location.stream)?
            .remove_at(location.day, activity_id)?;
        self.forget(activity_id, location);
        Some(reference)
    }

    /// Refresh a reference in its current day.
    pub fn update_reference(&mut self, location: &RefLocation, activity: &Activity, hidden: bool) -> bool {
        match self.index_mut(&location.identity, location.stream) {
            Some(index) => index.update_in_place(location.day, activity, hidden),
            None => false,
        }
    }

    pub fn set_reference_hidden(
        &mut self,
        location: &RefLocation,
        activity_id: &ActivityId,
        hidden: bool,
    ) -> bool {
        match self.index_mut(&location.identity, location.stream) {
            Some(index) => index.set_hidden(location.day, activity_id, hidden),
            None => false,
        }
    }

    pub fn has_reference(
        &self,
        identity: &IdentityId,
        stream: StreamType,
        activity_id: &ActivityId,
        at_timestamp: Option<i64>,
    ) -> bool {
        self.index(identity, stream)
            .and_then(|index| index.get(activity_id, at_timestamp))
            .is_some()
    }

    /// Every reference to the activity, across identities and types.
    pub fn locations_of(&self, activity_id: &ActivityId) -> Vec<RefLocation> {
        let mut locations: Vec<RefLocation> = self
            .locations
            .get(activity_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        locations.sort_by(|a, b| {
            (&a.identity, a.stream, a.day).cmp(&(&b.identity, b.stream, b.day))
        });
        locations
    }

    pub fn latest_activity_time(&self, identity: &IdentityId) -> Option<i64> {
        self.streams.get(identity)?.latest_activity_time
    }

    pub fn set_latest_activity_time(&mut self, identity: &IdentityId, ts: i64) {
        self.streams
            .entry(identity.clone())
            .or_default()
            .latest_activity_time = Some(ts);
    }

    /// Ids of the activities in an index, newest first.
    pub fn activity_ids(&self, identity: &IdentityId, stream: StreamType) -> Vec<ActivityId> {
        self.index(identity, stream)
            .map(|index| index.iter().map(|(_, r)| r.activity_id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> IndexStats {
        let mut stats = IndexStats {
            identities: self.streams.len(),
            indexed_activities: self.locations.len(),
            ..Default::default()
        };
        for streams in self.streams.values() {
            for (_, index) in streams.iter() {
                stats.indices += 1;
                stats.references += index.len();
            }
        }
        stats
    }

    /// Structural invariants: bucket counts, per-index dedup, and the reverse
    /// map matching the bucket trees exactly.
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut seen = 0usize;
        for (identity, streams) in &self.streams {
            for (stream, index) in streams.iter() {
                index
                    .check_counts()
                    .map_err(|e| format!("{}/{}: {}", identity, stream, e))?;
                let mut ids = AHashSet::new();
                for (day, reference) in index.iter() {
                    if !ids.insert(reference.activity_id.clone()) {
                        return Err(format!(
                            "{}/{}: duplicate reference to {}",
                            identity, stream, reference.activity_id
                        ));
                    }
                    let location = RefLocation {
                        identity: identity.clone(),
                        stream,
                        day,
                    };
                    let tracked = self
                        .locations
                        .get(&reference.activity_id)
                        .is_some_and(|set| set.contains(&location));
                    if !tracked {
                        return Err(format!(
                            "{}/{}: reference to {} in {} missing from reverse map",
                            identity, stream, reference.activity_id, day
                        ));
                    }
                    seen += 1;
                }
            }
        }
        let tracked: usize = self.locations.values().map(|set| set.len()).sum();
        if tracked != seen {
            return Err(format!(
                "reverse map tracks {} references but bucket trees hold {}",
                tracked, seen
            ));
        }
        Ok(())
    }
}

/// Owner of the index store and its lock.
#[derive(Debug, Default)]
pub struct StreamIndexManager {
    store: RwLock<IndexStore>,
}

impl StreamIndexManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared access for readers and count queries.
    pub fn read(&self) -> RwLockReadGuard<'_, IndexStore> {
        self.store.read()
    }

    /// Shared access that can be upgraded in place. Only one upgradable
    /// guard exists at a time, so nothing writes between the read and the
    /// upgrade.
    pub fn upgradable_read(&self) -> RwLockUpgradableReadGuard<'_, IndexStore> {
        self.store.upgradable_read()
    }

    /// Exclusive access for lifecycle mutations and read repairs.
    pub fn write(&self) -> RwLockWriteGuard<'_, IndexStore> {
        self.store.write()
    }

    pub fn stats(&self) -> IndexStats {
        self.read().stats()
    }

    pub fn check_invariants(&self) -> Result<(), String> {
        self.read().check_invariants()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::IdentityKind;

    fn activity(id: &str, ts: i64) -> Activity {
        Activity {
            id: ActivityId::new(id),
            owner: IdentityId::new("u1"),
            owner_kind: IdentityKind::Person,
            stream_owner: "alice".into(),
            poster: IdentityId::new("u1"),
            hidden: false,
            posted_at: ts,
            last_updated: None,
            mentioned_ids: Vec::new(),
            commenter_ids: Vec::new(),
        }
    }

    #[test]
    fn test_reverse_map_follows_adds_and_removes() {
        let mut store = IndexStore::new();
        let a = activity("a", 1_000);
        let u1 = IdentityId::new("u1");
        let u2 = IdentityId::new("u2");
        store.add_reference(&u1, StreamType::Feed, &a, false);
        store.add_reference(&u1, StreamType::MyActivities, &a, false);
        store.add_reference(&u2, StreamType::Feed, &a, false);
        // duplicate add is a no-op
        store.add_reference(&u2, StreamType::Feed, &a, false);

        assert_eq!(store.locations_of(&a.id).len(), 3);
        assert!(store.check_invariants().is_ok());

        store.remove_reference(&u2, StreamType::Feed, &a.id, None);
        assert_eq!(store.locations_of(&a.id).len(), 2);
        assert!(!store.has_reference(&u2, StreamType::Feed, &a.id, None));
        assert!(store.check_invariants().is_ok());

        for location in store.locations_of(&a.id) {
            store.remove_reference_at(&location, &a.id);
        }
        assert!(store.locations_of(&a.id).is_empty());
        assert_eq!(store.stats().indexed_activities, 0);
    }

    #[test]
    fn test_add_moves_reference_across_days() {
        let mut store = IndexStore::new();
        let u1 = IdentityId::new("u1");
        let mut a = activity("a", 1_000);
        store.add_reference(&u1, StreamType::Feed, &a, false);

        // activity refreshed two days later without an update event
        a.last_updated = Some(1_000 + 2 * 86_400_000);
        let placement = store.add_reference(&u1, StreamType::Feed, &a, false);
        assert!(!placement.created);
        assert_eq!(placement.moved_from, Some(DayKey::from_timestamp(1_000)));
        assert_eq!(placement.day, DayKey::from_timestamp(a.effective_timestamp()));

        let index = store.index(&u1, StreamType::Feed).unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index.number(), 1);
        assert_eq!(store.locations_of(&a.id).len(), 1);
        assert!(store.check_invariants().is_ok());

        // an older snapshot leaves the newer reference alone
        let stale = activity("a", 1_000);
        let placement = store.add_reference(&u1, StreamType::Feed, &stale, false);
        assert!(!placement.created);
        assert_eq!(placement.moved_from, None);
        assert_eq!(placement.day, DayKey::from_timestamp(a.effective_timestamp()));
        assert_eq!(store.index(&u1, StreamType::Feed).unwrap().len(), 1);
        assert!(store.check_invariants().is_ok());
    }

    #[test]
    fn test_manager_guards() {
        let manager = StreamIndexManager::new();
        {
            let mut store = manager.write();
            store.add_reference(&IdentityId::new("u1"), StreamType::Feed, &activity("a", 5), false);
        }
        let stats = manager.stats();
        assert_eq!(stats.identities, 1);
        assert_eq!(stats.indices, 1);
        assert_eq!(stats.references, 1);
        assert!(manager.check_invariants().is_ok());
    }
}
