//! Fan-out engine
//!
//! Turns activity lifecycle events into stream index mutations:
//! - `FanoutCoordinator`: one entry point per lifecycle event
//! - `RecipientSelector`: bounded choice of connections for broad fan-out
//! - `CommitBatcher`: persistence commits every N recipient writes
//! - `StreamContext`: event payload plus the recorded failure

mod batch;
mod context;
mod coordinator;
mod recipients;

pub use batch::CommitBatcher;
pub use context::StreamContext;
pub use coordinator::FanoutCoordinator;
pub use recipients::{FanoutReport, RecipientSelector};
