pub mod config;
pub mod dst;
pub mod error;
pub mod fanout;
pub mod index;
pub mod model;
pub mod observability;
pub mod reader;
pub mod store;

pub use config::{BatchConfig, BatchScope, StreamConfig};
pub use error::{Result, StreamError};
pub use fanout::{CommitBatcher, FanoutCoordinator, FanoutReport, RecipientSelector, StreamContext};
pub use index::{IndexStats, StreamIndexManager};
pub use model::{Activity, ActivityId, Identity, IdentityId, IdentityKind, StreamType};
pub use reader::PaginatedReader;
pub use store::{InMemoryBackend, SocialBackend};
