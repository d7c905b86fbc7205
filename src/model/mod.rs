//! Domain model shared by the index, the fan-out engine and the reader:
//! - `Identity` / `IdentityId`: users and spaces
//! - `Activity` / `ActivityId`: the indexed posts
//! - `StreamType`: the five per-identity indices

mod activity;
mod identity;
mod stream_type;

pub use activity::{Activity, ActivityId};
pub use identity::{ActiveIdentityFilter, Identity, IdentityId, IdentityKind, Space};
pub use stream_type::StreamType;
