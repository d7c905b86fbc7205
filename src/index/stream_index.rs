//! One identity's index for one stream type.

use super::bucket::{DayBucket, DayKey, MonthBucket, Reference, YearBucket};
use crate::model::{Activity, ActivityId};
use std::collections::BTreeMap;

/// Where `get_or_create` put (or found) a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub day: DayKey,
    pub created: bool,
    /// Day the reference was moved out of, when it lived elsewhere
    pub moved_from: Option<DayKey>,
}

/// Time-bucketed reference list with an advisory visible count.
#[derive(Debug, Clone, Default)]
pub struct StreamIndex {
    years: BTreeMap<i32, YearBucket>,
    /// Count cache, a hint only
    number: i64,
    /// Effective timestamp of the last bulk-loaded activity
    last_migration: Option<i64>,
}

impl StreamIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn day(&self, key: DayKey) -> Option<&DayBucket> {
        self.years
            .get(&key.year)?
            .months
            .get(&key.month)?
            .days
            .get(&key.day)
    }

    fn day_mut(&mut self, key: DayKey) -> Option<&mut DayBucket> {
        self.years
            .get_mut(&key.year)?
            .months
            .get_mut(&key.month)?
            .days
            .get_mut(&key.day)
    }

    fn day_or_create(&mut self, key: DayKey) -> &mut DayBucket {
        self.years
            .entry(key.year)
            .or_default()
            .months
            .entry(key.month)
            .or_default()
            .days
            .entry(key.day)
            .or_default()
    }

    /// Adjust the visible count of a day and every level above it.
    fn adjust_visible(&mut self, key: DayKey, delta: i64) {
        let Some(year) = self.years.get_mut(&key.year) else {
            return;
        };
        let Some(month) = year.months.get_mut(&key.month) else {
            return;
        };
        let Some(day) = month.days.get_mut(&key.day) else {
            return;
        };
        if delta > 0 {
            day.inc();
        } else {
            day.dec();
        }
        month.visible += delta;
        year.visible += delta;
        self.number = (self.number + delta).max(0);
    }

    /// Drop empty buckets on the path to `key`.
    fn prune(&mut self, key: DayKey) {
        let Some(year) = self.years.get_mut(&key.year) else {
            return;
        };
        if let Some(month) = year.months.get_mut(&key.month) {
            if month.days.get(&key.day).is_some_and(DayBucket::is_empty) {
                month.days.remove(&key.day);
            }
            if month.days.is_empty() {
                year.months.remove(&key.month);
            }
        }
        if year.months.is_empty() {
            self.years.remove(&key.year);
        }
    }

    /// Locate or create the reference for the activity's current day. Only
    /// that day is consulted; index-wide dedup is the store's job.
    pub fn get_or_create(&mut self, activity: &Activity, hidden: bool) -> Placement {
        let ts = activity.effective_timestamp();
        let key = DayKey::from_timestamp(ts);
        let created = self.day_or_create(key).insert(Reference {
            activity_id: activity.id.clone(),
            last_updated: ts,
            hidden,
        });
        if created && !hidden {
            self.adjust_visible(key, 1);
        }
        Placement {
            day: key,
            created,
            moved_from: None,
        }
    }

    /// Refresh a reference in place: new timestamp inside the same day and
    /// a new hidden snapshot. Returns false when the day does not hold it.
    pub fn update_in_place(&mut self, key: DayKey, activity: &Activity, hidden: bool) -> bool {
        let Some(day) = self.day_mut(key) else {
            return false;
        };
        if !day.retime(&activity.id, activity.effective_timestamp()) {
            return false;
        }
        self.set_hidden(key, &activity.id, hidden);
        true
    }

    /// Set a reference's hidden snapshot, moving the visible counts when it changes.
    pub fn set_hidden(&mut self, key: DayKey, id: &ActivityId, hidden: bool) -> bool {
        let previous = match self.day_mut(key).and_then(|d| d.set_hidden(id, hidden)) {
            Some(previous) => previous,
            None => return false,
        };
        if previous == hidden {
            return false;
        }
        self.adjust_visible(key, if hidden { -1 } else { 1 });
        true
    }

    /// Remove the reference held by one specific day.
    pub fn remove_at(&mut self, key: DayKey, id: &ActivityId) -> Option<Reference> {
        let reference = self.day_mut(key)?.remove(id)?;
        if !reference.hidden {
            self.adjust_visible(key, -1);
        }
        self.prune(key);
        Some(reference)
    }

    /// Remove a reference, either from the day of `at_timestamp` or, when no
    /// timestamp is given, from the first bucket found holding it.
    pub fn remove(
        &mut self,
        id: &ActivityId,
        at_timestamp: Option<i64>,
    ) -> Option<(DayKey, Reference)> {
        let key = match at_timestamp {
            Some(ts) => DayKey::from_timestamp(ts),
            None => self.locate(id).into_iter().next()?,
        };
        self.remove_at(key, id).map(|r| (key, r))
    }

    /// Lookup without mutation.
    pub fn get(&self, id: &ActivityId, at_timestamp: Option<i64>) -> Option<(DayKey, &Reference)> {
        match at_timestamp {
            Some(ts) => {
                let key = DayKey::from_timestamp(ts);
                self.day(key)?.get(id).map(|r| (key, r))
            }
            None => {
                let key = self.locate(id).into_iter().next()?;
                self.day(key)?.get(id).map(|r| (key, r))
            }
        }
    }

    /// The reference held by one specific day.
    pub fn get_at(&self, key: DayKey, id: &ActivityId) -> Option<&Reference> {
        self.day(key)?.get(id)
    }

    pub fn contains(&self, id: &ActivityId) -> bool {
        self.get(id, None).is_some()
    }

    /// Every day bucket holding the activity, newest first.
    pub fn locate(&self, id: &ActivityId) -> Vec<DayKey> {
        self.iter_days()
            .filter(|(_, day)| day.contains(id))
            .map(|(key, _)| key)
            .collect()
    }

    fn iter_days(&self) -> impl Iterator<Item = (DayKey, &DayBucket)> + '_ {
        self.years.iter().rev().flat_map(|(&y, year)| {
            year.months.iter().rev().flat_map(move |(&m, month)| {
                month
                    .days
                    .iter()
                    .rev()
                    .map(move |(&d, day)| (DayKey::new(y, m, d), day))
            })
        })
    }

    /// All references, newest first, with the day that holds them.
    pub fn iter(&self) -> impl Iterator<Item = (DayKey, &Reference)> + '_ {
        self.iter_days()
            .flat_map(|(key, day)| day.iter().map(move |r| (key, r)))
    }

    pub fn day_visible(&self, key: DayKey) -> Option<i64> {
        self.day(key).map(DayBucket::visible)
    }

    /// Sum of the year-level visible counts.
    pub fn visible_total(&self) -> i64 {
        self.years.values().map(YearBucket::visible).sum()
    }

    pub fn len(&self) -> usize {
        self.iter_days().map(|(_, day)| day.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.years.is_empty()
    }

    pub fn number(&self) -> i64 {
        self.number
    }

    pub fn set_number(&mut self, number: i64) {
        self.number = number.max(0);
    }

    pub fn last_migration(&self) -> Option<i64> {
        self.last_migration
    }

    pub fn set_last_migration(&mut self, ts: i64) {
        self.last_migration = Some(ts);
    }

    /// Check that every level's visible count matches its references.
    pub fn check_counts(&self) -> Result<(), String> {
        for (&y, year) in &self.years {
            let mut year_sum = 0;
            for (&m, month) in &year.months {
                let month_sum: i64 = month.days.values().map(DayBucket::visible).sum();
                for (&d, day) in &month.days {
                    let actual = day.iter().filter(|r| !r.hidden).count() as i64;
                    if actual != day.visible() {
                        return Err(format!(
                            "day {} visible={} but holds {} visible references",
                            DayKey::new(y, m, d),
                            day.visible(),
                            actual
                        ));
                    }
                }
                if month_sum != MonthBucket::visible(month) {
                    return Err(format!(
                        "month {}/{} visible={} but days sum to {}",
                        y, m, month.visible, month_sum
                    ));
                }
                year_sum += month.visible;
            }
            if year_sum != year.visible {
                return Err(format!(
                    "year {} visible={} but months sum to {}",
                    y, year.visible, year_sum
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{IdentityId, IdentityKind};

    const DAY_MS: i64 = 24 * 3600 * 1000;

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
    fn test_get_or_create_is_idempotent() {
        let mut index = StreamIndex::new();
        let a = activity("a", 10 * DAY_MS);
        assert!(index.get_or_create(&a, false).created);
        assert!(!index.get_or_create(&a, false).created);
        assert_eq!(index.len(), 1);
        assert_eq!(index.number(), 1);
    }

    #[test]
    fn test_hidden_reference_not_counted() {
        let mut index = StreamIndex::new();
        let placement = index.get_or_create(&activity("a", DAY_MS), true);
        assert_eq!(index.number(), 0);
        assert_eq!(index.day_visible(placement.day), Some(0));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_iterates_newest_first_across_days() {
        let mut index = StreamIndex::new();
        index.get_or_create(&activity("old", DAY_MS), false);
        index.get_or_create(&activity("new", 400 * DAY_MS), false);
        index.get_or_create(&activity("mid", 40 * DAY_MS), false);
        let ids: Vec<_> = index.iter().map(|(_, r)| r.activity_id.0.clone()).collect();
        assert_eq!(ids, vec!["new", "mid", "old"]);
    }

    #[test]
    fn test_remove_by_timestamp_and_search() {
        let mut index = StreamIndex::new();
        let a = activity("a", 3 * DAY_MS);
        index.get_or_create(&a, false);
        // wrong day: nothing removed
        assert!(index.remove(&a.id, Some(7 * DAY_MS)).is_none());
        assert!(index.remove(&a.id, Some(3 * DAY_MS)).is_some());
        assert!(index.is_empty());
        assert_eq!(index.number(), 0);

        index.get_or_create(&a, false);
        assert!(index.remove(&a.id, None).is_some());
        assert!(index.is_empty());
    }

    #[test]
    fn test_set_hidden_adjusts_all_levels() {
        let mut index = StreamIndex::new();
        let a = activity("a", 5 * DAY_MS);
        let placement = index.get_or_create(&a, false);
        assert!(index.set_hidden(placement.day, &a.id, true));
        assert!(!index.set_hidden(placement.day, &a.id, true));
        assert_eq!(index.day_visible(placement.day), Some(0));
        assert_eq!(index.visible_total(), 0);
        assert!(index.set_hidden(placement.day, &a.id, false));
        assert_eq!(index.visible_total(), 1);
        assert!(index.check_counts().is_ok());
    }

    #[test]
    fn test_update_in_place_retimes() {
        let mut index = StreamIndex::new();
        let mut a = activity("a", 5 * DAY_MS);
        let b = activity("b", 5 * DAY_MS + 10);
        let placement = index.get_or_create(&a, false);
        index.get_or_create(&b, false);
        a.last_updated = Some(5 * DAY_MS + 20);
        assert!(index.update_in_place(placement.day, &a, false));
        let first = index.iter().next().map(|(_, r)| r.activity_id.clone());
        assert_eq!(first, Some(a.id.clone()));
    }
}
