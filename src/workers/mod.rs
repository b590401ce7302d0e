//! Queue consumers — the check-in, escalation, release, and notification
//! workers. Each worker is idempotent: re-running a job observes the state a
//! previous run committed and exits without repeating side effects.

pub mod checkin;
pub mod escalation;
pub mod notify;
pub mod release;

use std::sync::Arc;

use crate::clock::Clock;
use crate::queue::QueueBackend;
use crate::store::Store;
use crate::token::TokenGenerator;

pub use checkin::CheckinWorker;
pub use escalation::EscalationWorker;
pub use notify::NotifyWorker;
pub use release::ReleaseWorker;

/// Shared dependencies injected into every worker.
#[derive(Clone)]
pub struct WorkerDeps {
    pub store: Arc<dyn Store>,
    pub queue: Arc<dyn QueueBackend>,
    pub clock: Arc<dyn Clock>,
    pub tokens: Arc<dyn TokenGenerator>,
    /// Public base URL for check-in and trustee access links.
    pub base_url: String,
}
