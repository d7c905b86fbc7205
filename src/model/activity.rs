use super::{IdentityId, IdentityKind};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActivityId(pub String);

impl ActivityId {
    pub fn new(id: impl Into<String>) -> Self {
        ActivityId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ActivityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An activity as seen by the index: enough to place and filter references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    pub id: ActivityId,
    /// Identity whose stream owns the activity (a person or a space)
    pub owner: IdentityId,
    pub owner_kind: IdentityKind,
    /// Remote id of the owning stream (username or space pretty name)
    pub stream_owner: String,
    pub poster: IdentityId,
    pub hidden: bool,
    /// Unix ms
    pub posted_at: i64,
    /// Unix ms, bumped by edits and comments
    pub last_updated: Option<i64>,
    /// Mention entries, either `id` or `id@count`
    pub mentioned_ids: Vec<String>,
    pub commenter_ids: Vec<IdentityId>,
}

impl Activity {
    /// Timestamp used to place references into buckets.
    pub fn effective_timestamp(&self) -> i64 {
        self.last_updated.unwrap_or(self.posted_at)
    }

    pub fn is_space_activity(&self) -> bool {
        self.owner_kind == IdentityKind::Space
    }

    pub fn is_commenter(&self, identity: &IdentityId) -> bool {
        self.commenter_ids.iter().any(|c| c == identity)
    }

    pub fn is_mentioned(&self, identity: &IdentityId) -> bool {
        let id = identity.as_str();
        self.mentioned_ids.iter().any(|m| match m.strip_prefix(id) {
            Some(rest) => rest.is_empty() || rest.starts_with('@'),
            None => false,
        })
    }
}
