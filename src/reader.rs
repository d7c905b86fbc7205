//! Paginated, self-healing stream reads
//!
//! A `StreamCursor` walks one index newest-first under the shared lock. It
//! yields the activities a page should show and collects the repairs it
//! finds necessary on the way:
//! - references to activities that no longer exist
//! - `Feed`/`Connection` references to activities of spaces the reader left
//! - later duplicates of an activity already yielded
//! - the count cache, after a full walk over an index that claimed zero
//!
//! The walk holds an upgradable guard. Repairs are applied after upgrading it,
//! and each removal is re-checked against the store and backend first.

use crate::index::{DayKey, IndexStore, RefLocation, Reference, StreamIndex, StreamIndexManager};
use crate::model::{Activity, ActivityId, Identity, StreamType};
use crate::store::SocialBackend;
use ahash::AHashSet;
use parking_lot::RwLockUpgradableReadGuard;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a walk returns and which filters apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Full activities with the space membership check
    Activities,
    /// Ids only, no membership check
    Ids,
    /// Only activities of the reader's own stream
    Viewer,
}

/// Index fix-up found during a walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Repair {
    Remove {
        day: DayKey,
        activity_id: ActivityId,
        cause: RepairCause,
    },
    SetNumber(i64),
}

/// Why a reference was scheduled for removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairCause {
    /// The activity no longer exists
    Dangling,
    /// The reader is not a member of the activity's space
    Leaked { space: String },
    /// A newer reference to the same activity was already yielded
    Duplicate,
}

/// Lazy walk over one index.
pub struct StreamCursor<'a, B: SocialBackend> {
    entries: Box<dyn Iterator<Item = (DayKey, &'a Reference)> + 'a>,
    backend: &'a B,
    owner: &'a Identity,
    stream: StreamType,
    mode: ReadMode,
    seen: AHashSet<ActivityId>,
    repairs: Vec<Repair>,
    /// Visible entries walked over, skipped ones included
    visible: i64,
    zero_count: bool,
    exhausted: bool,
}

impl<'a, B: SocialBackend> StreamCursor<'a, B> {
    pub fn new(
        index: &'a StreamIndex,
        backend: &'a B,
        owner: &'a Identity,
        stream: StreamType,
        mode: ReadMode,
    ) -> Self {
        StreamCursor {
            entries: Box::new(index.iter()),
            backend,
            owner,
            stream,
            mode,
            seen: AHashSet::new(),
            repairs: Vec::new(),
            visible: 0,
            zero_count: index.number() <= 0,
            exhausted: false,
        }
    }

    /// Skip `offset` entries by forward iteration.
    pub fn skip_entries(&mut self, offset: usize) {
        for _ in 0..offset {
            match self.entries.next() {
                Some((_, reference)) => {
                    if !reference.hidden {
                        self.visible += 1;
                    }
                }
                None => {
                    self.exhausted = true;
                    return;
                }
            }
        }
    }

    fn schedule_removal(&mut self, day: DayKey, activity_id: &ActivityId, cause: RepairCause) {
        self.repairs.push(Repair::Remove {
            day,
            activity_id: activity_id.clone(),
            cause,
        });
    }

    /// Whether a space activity leaked into a stream of a non-member.
    fn is_leaked(&self, activity: &Activity) -> bool {
        if self.mode != ReadMode::Activities
            || !self.stream.checks_space_membership()
            || !activity.is_space_activity()
        {
            return false;
        }
        match self.backend.space_by_pretty_name(&activity.stream_owner) {
            Ok(Some(space)) => !space.has_member(&self.owner.remote_id),
            Ok(None) => false,
            Err(err) => {
                warn!(owner = %self.owner.remote_id, error = %err, "space lookup failed");
                false
            }
        }
    }

    /// Repairs collected so far, plus the count fix after a full walk.
    pub fn finish(mut self) -> Vec<Repair> {
        if self.exhausted && self.zero_count && self.visible > 0 {
            self.repairs.push(Repair::SetNumber(self.visible));
        }
        self.repairs
    }
}

impl<'a, B: SocialBackend> Iterator for StreamCursor<'a, B> {
    type Item = Activity;

    fn next(&mut self) -> Option<Activity> {
        loop {
            let Some((day, reference)) = self.entries.next() else {
                self.exhausted = true;
                return None;
            };
            let id = &reference.activity_id;
            let activity = match self.backend.find_activity(id) {
                Ok(Some(activity)) => activity,
                Ok(None) => {
                    debug!(owner = %self.owner.remote_id, activity = %id, "dangling reference");
                    self.schedule_removal(day, id, RepairCause::Dangling);
                    continue;
                }
                Err(err) => {
                    warn!(owner = %self.owner.remote_id, error = %err, "exception while loading activities");
                    continue;
                }
            };

            if self.is_leaked(&activity) {
                info!(
                    owner = %self.owner.remote_id,
                    activity = %id,
                    space = %activity.stream_owner,
                    "cleanup leaked space activity"
                );
                let space = activity.stream_owner.clone();
                self.schedule_removal(day, id, RepairCause::Leaked { space });
                continue;
            }

            if !self.seen.insert(activity.id.clone()) {
                debug!(owner = %self.owner.remote_id, activity = %id, "duplicate reference");
                self.schedule_removal(day, id, RepairCause::Duplicate);
                continue;
            }

            if activity.hidden {
                continue;
            }
            self.visible += 1;

            if self.mode == ReadMode::Viewer && activity.stream_owner != self.owner.remote_id {
                continue;
            }
            return Some(activity);
        }
    }
}

/// Read side of the stream indices.
pub struct PaginatedReader<B: SocialBackend> {
    index: Arc<StreamIndexManager>,
    backend: Arc<B>,
}

impl<B: SocialBackend> PaginatedReader<B> {
    pub fn new(index: Arc<StreamIndexManager>, backend: Arc<B>) -> Self {
        PaginatedReader { index, backend }
    }

    /// Up to `limit` visible activities of `owner`'s index, from `offset`.
    pub fn activities(
        &self,
        owner: &Identity,
        stream: StreamType,
        offset: usize,
        limit: usize,
    ) -> Vec<Activity> {
        self.walk(owner, stream, offset, limit, ReadMode::Activities)
    }

    pub fn activity_ids(
        &self,
        owner: &Identity,
        stream: StreamType,
        offset: usize,
        limit: usize,
    ) -> Vec<ActivityId> {
        self.walk(owner, stream, offset, limit, ReadMode::Ids)
            .into_iter()
            .map(|a| a.id)
            .collect()
    }

    /// `MyActivities` restricted to activities of the owner's own stream.
    pub fn viewer_activities(&self, owner: &Identity, offset: usize, limit: usize) -> Vec<Activity> {
        self.walk(owner, StreamType::MyActivities, offset, limit, ReadMode::Viewer)
    }

    /// Cached count, never negative.
    pub fn number_of(&self, owner: &Identity, stream: StreamType) -> i64 {
        self.index
            .read()
            .index(&owner.id, stream)
            .map_or(0, |index| index.number().max(0))
    }

    pub fn has_size_of(&self, owner: &Identity, stream: StreamType) -> bool {
        self.number_of(owner, stream) > 0
    }

    fn walk(
        &self,
        owner: &Identity,
        stream: StreamType,
        offset: usize,
        limit: usize,
        mode: ReadMode,
    ) -> Vec<Activity> {
        let store = self.index.upgradable_read();
        let (page, repairs) = {
            let Some(index) = store.index(&owner.id, stream) else {
                return Vec::new();
            };
            let mut cursor = StreamCursor::new(index, &*self.backend, owner, stream, mode);
            cursor.skip_entries(offset);
            let page: Vec<Activity> = cursor.by_ref().take(limit).collect();
            (page, cursor.finish())
        };
        if !repairs.is_empty() {
            let mut store = RwLockUpgradableReadGuard::upgrade(store);
            apply_repairs(&mut store, &*self.backend, owner, stream, &repairs);
        }
        page
    }
}

/// Apply a walk's repairs. Removals first, then the count.
///
/// Each removal is checked again before it is applied: a repair collected
/// earlier may have been overtaken by a lifecycle event (a rejoin, a
/// re-created body, a duplicate already cleaned up).
pub fn apply_repairs<B: SocialBackend + ?Sized>(
    store: &mut IndexStore,
    backend: &B,
    owner: &Identity,
    stream: StreamType,
    repairs: &[Repair],
) {
    let mut removed = 0;
    let mut outdated = 0;
    for repair in repairs {
        let Repair::Remove {
            day,
            activity_id,
            cause,
        } = repair
        else {
            continue;
        };
        if !still_needed(store, backend, owner, stream, *day, activity_id, cause) {
            debug!(owner = %owner.remote_id, activity = %activity_id, ?cause, "repair outdated");
            outdated += 1;
            continue;
        }
        let location = RefLocation {
            identity: owner.id.clone(),
            stream,
            day: *day,
        };
        if store.remove_reference_at(&location, activity_id).is_some() {
            removed += 1;
        }
    }
    for repair in repairs {
        if let Repair::SetNumber(number) = repair {
            if let Some(index) = store.index_mut(&owner.id, stream) {
                // a writer may have filled the cache since
                if index.number() <= 0 {
                    index.set_number(*number);
                }
            }
        }
    }
    debug!(
        owner = %owner.remote_id,
        %stream,
        removed,
        outdated,
        repairs = repairs.len(),
        "read repairs applied"
    );
}

fn still_needed<B: SocialBackend + ?Sized>(
    store: &IndexStore,
    backend: &B,
    owner: &Identity,
    stream: StreamType,
    day: DayKey,
    activity_id: &ActivityId,
    cause: &RepairCause,
) -> bool {
    match cause {
        RepairCause::Dangling => matches!(backend.find_activity(activity_id), Ok(None)),
        RepairCause::Leaked { space } => match backend.space_by_pretty_name(space) {
            Ok(Some(space)) => !space.has_member(&owner.remote_id),
            Ok(None) | Err(_) => false,
        },
        RepairCause::Duplicate => store
            .index(&owner.id, stream)
            .is_some_and(|index| index.locate(activity_id).iter().any(|d| *d != day)),
    }
}
