mod event;
mod parser;
mod poller;
mod registry;
mod source;
mod state;

pub use event::{StandingRow, StatusState, UpdateEvent, UpdateKind, UpdatePayload};
pub use parser::parse_text;
pub use poller::PollSynchronizer;
pub use registry::{EventRegistry, Subscription};
pub use source::{ContentItem, ContentSource, LocalContentSource};
pub use state::PollingState;
