use serde::{Deserialize, Serialize};

/// Opaque identity id assigned by the identity store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityId(pub String);

impl IdentityId {
    pub fn new(id: impl Into<String>) -> Self {
        IdentityId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdentityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity provider: a person or a space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IdentityKind {
    Person,
    Space,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    pub kind: IdentityKind,
    /// Username for persons, pretty name for spaces
    pub remote_id: String,
    pub enabled: bool,
}

impl Identity {
    pub fn person(id: impl Into<String>, remote_id: impl Into<String>) -> Self {
        Identity {
            id: IdentityId::new(id),
            kind: IdentityKind::Person,
            remote_id: remote_id.into(),
            enabled: true,
        }
    }

    pub fn space(id: impl Into<String>, pretty_name: impl Into<String>) -> Self {
        Identity {
            id: IdentityId::new(id),
            kind: IdentityKind::Space,
            remote_id: pretty_name.into(),
            enabled: true,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Space {
    pub pretty_name: String,
    /// Remote ids of the member persons
    pub members: Vec<String>,
}

impl Space {
    pub fn has_member(&self, remote_id: &str) -> bool {
        self.members.iter().any(|m| m == remote_id)
    }
}

/// Query filter for "active users".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActiveIdentityFilter {
    /// Users who logged in within the last N days
    LastLoginWithinDays(u32),
    /// Members of any of the listed groups
    Groups(Vec<String>),
}
