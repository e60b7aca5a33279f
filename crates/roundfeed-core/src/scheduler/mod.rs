mod backoff;
mod classify;
mod history;
mod priority;
mod queue;
#[allow(clippy::module_inception)]
mod scheduler;
mod status;

pub use priority::Priority;
pub use scheduler::RequestScheduler;
pub use status::{RateLimitStatus, SchedulerStats};
