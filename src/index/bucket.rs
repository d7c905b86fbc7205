//! Year → Month → Day bucket tree
//!
//! References are partitioned by the UTC day of their timestamp. Every level
//! keeps a visible count; the tree is iterated newest-first at every level.

use crate::model::ActivityId;
use ahash::AHashMap;
use chrono::{DateTime, Datelike};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};

/// Address of a day bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DayKey {
    pub year: i32,
    pub month: u32,
    pub day: u32,
}

impl DayKey {
    pub fn new(year: i32, month: u32, day: u32) -> Self {
        DayKey { year, month, day }
    }

    /// Bucket for a Unix ms timestamp (UTC). Out-of-range timestamps land on the epoch.
    pub fn from_timestamp(ms: i64) -> Self {
        let dt = DateTime::from_timestamp_millis(ms).unwrap_or_default();
        DayKey {
            year: dt.year(),
            month: dt.month(),
            day: dt.day(),
        }
    }
}

impl std::fmt::Display for DayKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04}/{:02}/{:02}", self.year, self.month, self.day)
    }
}

/// Index entry pointing at an activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub activity_id: ActivityId,
    /// Denormalized activity timestamp (Unix ms)
    pub last_updated: i64,
    /// Hidden flag snapshot taken at insert/update time
    pub hidden: bool,
}

/// Leaf bucket: references of one day, newest first.
#[derive(Debug, Clone, Default)]
pub struct DayBucket {
    order: BTreeSet<(Reverse<i64>, ActivityId)>,
    refs: AHashMap<ActivityId, Reference>,
    visible: i64,
}

impl DayBucket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &ActivityId) -> Option<&Reference> {
        self.refs.get(id)
    }

    pub fn contains(&self, id: &ActivityId) -> bool {
        self.refs.contains_key(id)
    }

    /// Insert a reference. Returns false when the day already holds the activity.
    pub fn insert(&mut self, reference: Reference) -> bool {
        if self.refs.contains_key(&reference.activity_id) {
            return false;
        }
        self.order
            .insert((Reverse(reference.last_updated), reference.activity_id.clone()));
        self.refs.insert(reference.activity_id.clone(), reference);
        true
    }

    pub fn remove(&mut self, id: &ActivityId) -> Option<Reference> {
        let reference = self.refs.remove(id)?;
        self.order
            .remove(&(Reverse(reference.last_updated), reference.activity_id.clone()));
        Some(reference)
    }

    /// Move a reference to a new timestamp inside the same day.
    pub fn retime(&mut self, id: &ActivityId, last_updated: i64) -> bool {
        let Some(reference) = self.refs.get_mut(id) else {
            return false;
        };
        if reference.last_updated != last_updated {
            self.order
                .remove(&(Reverse(reference.last_updated), id.clone()));
            reference.last_updated = last_updated;
            self.order.insert((Reverse(last_updated), id.clone()));
        }
        true
    }

    /// Set the hidden snapshot. Returns the previous value.
    pub fn set_hidden(&mut self, id: &ActivityId, hidden: bool) -> Option<bool> {
        let reference = self.refs.get_mut(id)?;
        let previous = reference.hidden;
        reference.hidden = hidden;
        Some(previous)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Reference> + '_ {
        self.order.iter().filter_map(move |(_, id)| self.refs.get(id))
    }

    pub fn inc(&mut self) {
        self.visible += 1;
    }

    pub fn dec(&mut self) {
        self.visible -= 1;
    }

    pub fn visible(&self) -> i64 {
        self.visible
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MonthBucket {
    pub(crate) days: BTreeMap<u32, DayBucket>,
    pub(crate) visible: i64,
}

#[derive(Debug, Clone, Default)]
pub struct YearBucket {
    pub(crate) months: BTreeMap<u32, MonthBucket>,
    pub(crate) visible: i64,
}

impl YearBucket {
    pub fn visible(&self) -> i64 {
        self.visible
    }
}

impl MonthBucket {
    pub fn visible(&self) -> i64 {
        self.visible
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(id: &str, ts: i64) -> Reference {
        Reference {
            activity_id: ActivityId::new(id),
            last_updated: ts,
            hidden: false,
        }
    }

    #[test]
    fn test_day_key_from_timestamp() {
        // 2013-07-04T12:00:00Z
        let key = DayKey::from_timestamp(1_372_939_200_000);
        assert_eq!(key, DayKey::new(2013, 7, 4));
        assert_eq!(key.to_string(), "2013/07/04");
        assert_eq!(DayKey::from_timestamp(0), DayKey::new(1970, 1, 1));
    }

    #[test]
    fn test_day_bucket_orders_newest_first() {
        let mut day = DayBucket::new();
        assert!(day.insert(reference("a", 10)));
        assert!(day.insert(reference("b", 30)));
        assert!(day.insert(reference("c", 20)));
        let ids: Vec<_> = day.iter().map(|r| r.activity_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    #[test]
    fn test_day_bucket_dedups_by_activity_id() {
        let mut day = DayBucket::new();
        assert!(day.insert(reference("a", 10)));
        assert!(!day.insert(reference("a", 99)));
        assert_eq!(day.len(), 1);
        assert_eq!(day.get(&ActivityId::new("a")).map(|r| r.last_updated), Some(10));
    }

    #[test]
    fn test_day_bucket_retime_reorders() {
        let mut day = DayBucket::new();
        day.insert(reference("a", 10));
        day.insert(reference("b", 20));
        assert!(day.retime(&ActivityId::new("a"), 30));
        let ids: Vec<_> = day.iter().map(|r| r.activity_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(!day.retime(&ActivityId::new("zzz"), 1));
    }

    #[test]
    fn test_day_bucket_remove() {
        let mut day = DayBucket::new();
        day.insert(reference("a", 10));
        assert!(day.remove(&ActivityId::new("a")).is_some());
        assert!(day.remove(&ActivityId::new("a")).is_none());
        assert!(day.is_empty());
        assert_eq!(day.iter().count(), 0);
    }
}
