mod countdown;
mod provider;

pub use countdown::{ClientTimerSync, TimerEvent, TimerSyncResult};
pub use provider::{LocalReferenceTimeProvider, ReferenceTime, ReferenceTimeProvider};
