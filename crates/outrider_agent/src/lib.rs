//! The Outrider agent: connects to one or more controllers,
//! subscribes to the command publication stream, matches and executes
//! jobs in workers, schedules local jobs, and can relay a lower tier's
//! returns upward.

pub mod beacons;
pub mod config;
pub mod conn;
pub mod dispatch;
pub mod events;
pub mod grains;
pub mod relay;
pub mod supervisor;

use outrider_matcher::MatcherContext;
use std::sync::{Arc, RwLock};

/// Shared matcher context: readers clone the inner `Arc`, refreshes
/// swap it whole so no partial tree is ever visible.
pub type SharedMatcherCtx = Arc<RwLock<Arc<MatcherContext>>>;

/// Swap in a freshly built matcher context.
pub fn swap_matcher_ctx(shared: &SharedMatcherCtx, ctx: MatcherContext) {
    let mut guard = shared.write().unwrap_or_else(|e| e.into_inner());
    *guard = Arc::new(ctx);
}
