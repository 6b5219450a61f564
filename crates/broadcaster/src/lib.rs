pub mod broadcast;
pub mod broadcaster;
pub mod clock;
pub mod config;
pub mod error;
pub mod history;
pub mod logging;
pub mod secrets;
pub mod transport;

pub use broadcast::{BroadcasterStatus, BroadcasterStatusType, MessageEvent};
pub use broadcaster::{Broadcaster, BroadcasterOptions};
pub use clock::{Clock, SystemClock};
pub use config::{load_config, load_config_from_str, Backend, BroadcasterConfig};
pub use error::{BroadcasterError, ConfigError, HistoryError, Result, TransportError};
pub use history::{HistoryMessage, HistoryOutput, HistoryRequest};
pub use logging::LogFormat;
pub use secrets::{resolve_secret, SecretError, SecretSource};
pub use transport::{
    event_channel, ConfirmResult, SubscribeOptions, Transport, TransportEvent,
    TransportEventReceiver, TransportEventSender, TransportMessage, TransportStatus,
};
