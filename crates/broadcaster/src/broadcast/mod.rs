//! Output streams for the caller: subscription status and received messages.

pub mod messages;
pub mod status;

pub use messages::{MessageBroadcaster, MessageEvent};
pub use status::{BroadcasterStatus, BroadcasterStatusType, StatusBroadcaster};
