//! Channel transports (WhatsApp, Telegram, Signal, ...) share one lifecycle
//! manager and one reconnect policy regardless of their wire protocol.

pub mod dedupe;
pub mod manager;
pub mod orchestrator;
pub mod reconnect;

pub use dedupe::InboundDedupe;
pub use manager::{AccountStatus, ChannelContext, ChannelPlugin, PluginManager};
pub use orchestrator::{Orchestrator, OutboundTransport, SessionSerializer};
pub use reconnect::ReconnectPolicy;
