//! In-memory social backend for unit tests, simulation and benches.

use super::{ActivityQuery, ActivityStore, IdentityStore, PersistenceSession, RelationshipStore, SpaceStore};
use crate::error::{Result, StreamError};
use crate::model::{
    ActiveIdentityFilter, Activity, ActivityId, Identity, IdentityId, IdentityKind, Space,
};
use ahash::{AHashMap, AHashSet};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

const DAY_MS: i64 = 24 * 3600 * 1000;

#[derive(Debug, Default)]
struct BackendState {
    identities: AHashMap<IdentityId, Identity>,
    by_remote: AHashMap<(IdentityKind, String), IdentityId>,
    /// Insertion-ordered connection lists, kept symmetric
    connections: AHashMap<IdentityId, Vec<IdentityId>>,
    spaces: AHashMap<String, Space>,
    activities: AHashMap<ActivityId, Activity>,
    last_login: AHashMap<String, i64>,
    groups: AHashMap<String, Vec<String>>,
    now_ms: i64,
}

/// Thread-safe in-memory implementation of every store contract.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    state: RwLock<BackendState>,
    commits: AtomicU64,
    fail_lookups: AtomicBool,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_identity(&self, identity: Identity) {
        let mut state = self.state.write();
        state
            .by_remote
            .insert((identity.kind, identity.remote_id.clone()), identity.id.clone());
        state.identities.insert(identity.id.clone(), identity);
    }

    /// Register a person and return it.
    pub fn add_person(&self, id: &str, remote_id: &str) -> Identity {
        let identity = Identity::person(id, remote_id);
        self.add_identity(identity.clone());
        identity
    }

    /// Register a space identity plus its space record.
    pub fn add_space(&self, id: &str, pretty_name: &str) -> Identity {
        let identity = Identity::space(id, pretty_name);
        self.add_identity(identity.clone());
        self.state.write().spaces.insert(
            pretty_name.to_string(),
            Space {
                pretty_name: pretty_name.to_string(),
                members: Vec::new(),
            },
        );
        identity
    }

    pub fn add_space_member(&self, pretty_name: &str, member_remote_id: &str) {
        let mut state = self.state.write();
        if let Some(space) = state.spaces.get_mut(pretty_name) {
            if !space.has_member(member_remote_id) {
                space.members.push(member_remote_id.to_string());
            }
        }
    }

    pub fn remove_space_member(&self, pretty_name: &str, member_remote_id: &str) {
        let mut state = self.state.write();
        if let Some(space) = state.spaces.get_mut(pretty_name) {
            space.members.retain(|m| m != member_remote_id);
        }
    }

    /// Confirm a relationship between two identities.
    pub fn connect(&self, a: &IdentityId, b: &IdentityId) {
        if a == b {
            return;
        }
        let mut state = self.state.write();
        for (from, to) in [(a, b), (b, a)] {
            let list = state.connections.entry(from.clone()).or_default();
            if !list.contains(to) {
                list.push(to.clone());
            }
        }
    }

    pub fn disconnect(&self, a: &IdentityId, b: &IdentityId) {
        let mut state = self.state.write();
        for (from, to) in [(a, b), (b, a)] {
            if let Some(list) = state.connections.get_mut(from) {
                list.retain(|c| c != to);
            }
        }
    }

    pub fn put_activity(&self, activity: Activity) {
        self.state
            .write()
            .activities
            .insert(activity.id.clone(), activity);
    }

    /// Drop an activity body without touching any index.
    pub fn remove_activity(&self, id: &ActivityId) -> Option<Activity> {
        self.state.write().activities.remove(id)
    }

    pub fn set_now(&self, now_ms: i64) {
        self.state.write().now_ms = now_ms;
    }

    pub fn record_login(&self, remote_id: &str, at_ms: i64) {
        self.state
            .write()
            .last_login
            .insert(remote_id.to_string(), at_ms);
    }

    pub fn add_group_member(&self, group: &str, remote_id: &str) {
        self.state
            .write()
            .groups
            .entry(group.to_string())
            .or_default()
            .push(remote_id.to_string());
    }

    /// Make every identity lookup fail with a backend error.
    pub fn set_fail_lookups(&self, fail: bool) {
        self.fail_lookups.store(fail, Ordering::SeqCst);
    }

    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    /// Activity body without going through the store contract.
    pub fn activity(&self, id: &ActivityId) -> Option<Activity> {
        self.state.read().activities.get(id).cloned()
    }

    pub fn space_members(&self, pretty_name: &str) -> Vec<String> {
        self.state
            .read()
            .spaces
            .get(pretty_name)
            .map(|space| space.members.clone())
            .unwrap_or_default()
    }

    fn check_lookups(&self) -> Result<()> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(StreamError::Backend("identity lookup unavailable".into()));
        }
        Ok(())
    }
}

impl IdentityStore for InMemoryBackend {
    fn find_identity(&self, kind: IdentityKind, remote_id: &str) -> Result<Option<Identity>> {
        self.check_lookups()?;
        let state = self.state.read();
        Ok(state
            .by_remote
            .get(&(kind, remote_id.to_string()))
            .and_then(|id| state.identities.get(id))
            .cloned())
    }

    fn find_identity_by_id(&self, id: &IdentityId) -> Result<Option<Identity>> {
        self.check_lookups()?;
        Ok(self.state.read().identities.get(id).cloned())
    }

    fn active_users(&self, filter: &ActiveIdentityFilter) -> Result<AHashSet<String>> {
        let state = self.state.read();
        let users = match filter {
            ActiveIdentityFilter::LastLoginWithinDays(days) => {
                let since = state.now_ms - i64::from(*days) * DAY_MS;
                state
                    .last_login
                    .iter()
                    .filter(|(_, at)| **at >= since)
                    .map(|(user, _)| user.clone())
                    .collect()
            }
            ActiveIdentityFilter::Groups(groups) => groups
                .iter()
                .filter_map(|g| state.groups.get(g))
                .flatten()
                .cloned()
                .collect(),
        };
        Ok(users)
    }
}

impl RelationshipStore for InMemoryBackend {
    fn connections(&self, identity: &Identity, offset: usize, limit: usize) -> Result<Vec<Identity>> {
        let state = self.state.read();
        let Some(list) = state.connections.get(&identity.id) else {
            return Ok(Vec::new());
        };
        Ok(list
            .iter()
            .filter_map(|id| state.identities.get(id).cloned())
            .skip(offset)
            .take(limit)
            .collect())
    }

    fn has_confirmed_relationship(&self, a: &IdentityId, b: &IdentityId) -> Result<bool> {
        Ok(self
            .state
            .read()
            .connections
            .get(a)
            .is_some_and(|list| list.contains(b)))
    }
}

impl SpaceStore for InMemoryBackend {
    fn space_by_pretty_name(&self, pretty_name: &str) -> Result<Option<Space>> {
        Ok(self.state.read().spaces.get(pretty_name).cloned())
    }
}

impl ActivityStore for InMemoryBackend {
    fn find_activity(&self, id: &ActivityId) -> Result<Option<Activity>> {
        Ok(self.state.read().activities.get(id).cloned())
    }

    fn query_activities(
        &self,
        query: &ActivityQuery,
    ) -> Result<Box<dyn Iterator<Item = Activity> + '_>> {
        let state = self.state.read();
        let mut matching: Vec<Activity> = state
            .activities
            .values()
            .filter(|a| a.owner == query.owner)
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            b.effective_timestamp()
                .cmp(&a.effective_timestamp())
                .then_with(|| a.id.cmp(&b.id))
        });
        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(Box::new(matching.into_iter().skip(query.offset).take(limit)))
    }
}

impl PersistenceSession for InMemoryBackend {
    fn commit(&self) {
        self.commits.fetch_add(1, Ordering::SeqCst);
    }
}
