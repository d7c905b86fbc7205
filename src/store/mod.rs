//! External collaborator contracts
//!
//! The index core never owns identities, relationships, spaces or activity
//! bodies. It reaches them through these narrow traits:
//! - `IdentityStore`: identity lookups and "active users" queries
//! - `RelationshipStore`: paged connections, confirmed-relationship check
//! - `SpaceStore`: space by pretty name
//! - `ActivityStore`: activity by id, newest-first activity queries
//! - `PersistenceSession`: commit checkpoint
//!
//! `InMemoryBackend` implements all of them for tests, simulation and benches.

mod memory;

pub use memory::InMemoryBackend;

use crate::error::Result;
use crate::model::{
    ActiveIdentityFilter, Activity, ActivityId, Identity, IdentityId, IdentityKind, Space,
};
use ahash::AHashSet;

pub trait IdentityStore: Send + Sync {
    fn find_identity(&self, kind: IdentityKind, remote_id: &str) -> Result<Option<Identity>>;

    fn find_identity_by_id(&self, id: &IdentityId) -> Result<Option<Identity>>;

    /// Remote ids of the users matching the filter.
    fn active_users(&self, filter: &ActiveIdentityFilter) -> Result<AHashSet<String>>;
}

pub trait RelationshipStore: Send + Sync {
    /// Confirmed connections of an identity, in a stable order. `offset`
    /// and `limit` count returned identities, so connections that no longer
    /// resolve never shift a page.
    fn connections(&self, identity: &Identity, offset: usize, limit: usize) -> Result<Vec<Identity>>;

    fn has_confirmed_relationship(&self, a: &IdentityId, b: &IdentityId) -> Result<bool>;
}

pub trait SpaceStore: Send + Sync {
    fn space_by_pretty_name(&self, pretty_name: &str) -> Result<Option<Space>>;
}

/// Activities owned by an identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityQuery {
    pub owner: IdentityId,
    pub offset: usize,
    /// `None` loads everything
    pub limit: Option<usize>,
}

impl ActivityQuery {
    /// Every activity of the owner's stream, no limit.
    pub fn stream_of(owner: &IdentityId) -> Self {
        ActivityQuery {
            owner: owner.clone(),
            offset: 0,
            limit: None,
        }
    }
}

pub trait ActivityStore: Send + Sync {
    fn find_activity(&self, id: &ActivityId) -> Result<Option<Activity>>;

    /// Matching activities, newest first.
    fn query_activities(
        &self,
        query: &ActivityQuery,
    ) -> Result<Box<dyn Iterator<Item = Activity> + '_>>;
}

pub trait PersistenceSession: Send + Sync {
    /// Make prior mutations durable.
    fn commit(&self);
}

/// Everything the fan-out engine and the reader need from the outside.
pub trait SocialBackend:
    IdentityStore + RelationshipStore + SpaceStore + ActivityStore + PersistenceSession
{
}

impl<T> SocialBackend for T where
    T: IdentityStore + RelationshipStore + SpaceStore + ActivityStore + PersistenceSession
{
}
