//! Per-event context handed to the coordinator.

use crate::error::{NodeKind, Result, StreamError};
use crate::model::{Activity, Identity, IdentityId};

/// Everything one lifecycle event carries.
///
/// `identity` depends on the event: the stream owner for create events, the
/// commenter for comment updates, the member for space membership changes.
#[derive(Debug, Clone)]
pub struct StreamContext {
    pub identity: Identity,
    pub activity: Option<Activity>,
    /// Poster override. Defaults to the activity's poster.
    pub poster_id: Option<IdentityId>,
    pub mentioners: Vec<IdentityId>,
    pub commenters: Vec<IdentityId>,
    /// Effective timestamp of the activity before this event
    pub old_last_updated: Option<i64>,
    pub space_identity: Option<Identity>,
    failure: Option<StreamError>,
}

impl StreamContext {
    pub fn new(identity: Identity, activity: Activity) -> Self {
        StreamContext {
            identity,
            activity: Some(activity),
            poster_id: None,
            mentioners: Vec::new(),
            commenters: Vec::new(),
            old_last_updated: None,
            space_identity: None,
            failure: None,
        }
    }

    /// Context for a membership change: no activity involved.
    pub fn membership(member: Identity, space: Identity) -> Self {
        StreamContext {
            identity: member,
            activity: None,
            poster_id: None,
            mentioners: Vec::new(),
            commenters: Vec::new(),
            old_last_updated: None,
            space_identity: Some(space),
            failure: None,
        }
    }

    pub fn with_poster(mut self, poster: IdentityId) -> Self {
        self.poster_id = Some(poster);
        self
    }

    pub fn with_mentioners(mut self, mentioners: Vec<IdentityId>) -> Self {
        self.mentioners = mentioners;
        self
    }

    pub fn with_commenters(mut self, commenters: Vec<IdentityId>) -> Self {
        self.commenters = commenters;
        self
    }

    pub fn with_old_last_updated(mut self, ts: i64) -> Self {
        self.old_last_updated = Some(ts);
        self
    }

    pub fn activity(&self) -> Result<&Activity> {
        self.activity
            .as_ref()
            .ok_or_else(|| StreamError::not_found(NodeKind::Activity, "<context>"))
    }

    pub fn poster(&self) -> Result<IdentityId> {
        match &self.poster_id {
            Some(id) => Ok(id.clone()),
            None => Ok(self.activity()?.poster.clone()),
        }
    }

    pub fn space(&self) -> Result<&Identity> {
        self.space_identity
            .as_ref()
            .ok_or_else(|| StreamError::not_found(NodeKind::Space, "<context>"))
    }

    /// Record a failure. The first one wins.
    pub fn fail(&mut self, err: StreamError) {
        if self.failure.is_none() {
            self.failure = Some(err);
        }
    }

    pub fn failure(&self) -> Option<&StreamError> {
        self.failure.as_ref()
    }

    pub fn failed(&self) -> bool {
        self.failure.is_some()
    }
}
