use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::access::AccessPolicy;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// gateway.json — channel plugins, accounts, bindings
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Top-level `gateway.json` shape. Distinct from the agent-facing
/// [`super::Config`] — this is consumed by the channel gateway binary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub gateway: GatewaySettings,
    #[serde(default)]
    pub channels: HashMap<String, ChannelConfig>,
    #[serde(default)]
    pub bindings: Vec<Binding>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    #[serde(default = "d_account_id")]
    pub account_id: String,
    #[serde(default = "d_log_level")]
    pub log_level: String,
    #[serde(default = "d_heartbeat_secs")]
    pub heartbeat_seconds: u64,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            account_id: d_account_id(),
            log_level: d_log_level(),
            heartbeat_seconds: d_heartbeat_secs(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

fn d_account_id() -> String {
    "default".into()
}
fn d_log_level() -> String {
    "info".into()
}
fn d_heartbeat_secs() -> u64 {
    30
}

/// Bounded exponential backoff with jitter, used by channel transports that
/// need to reconnect (e.g. a WhatsApp socket dropping).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "d_min_delay_ms")]
    pub min_delay_ms: u64,
    #[serde(default = "d_max_delay_ms")]
    pub max_delay_ms: u64,
    /// `None` = retry forever.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default = "d_jitter_factor")]
    pub jitter_factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: d_min_delay_ms(),
            max_delay_ms: d_max_delay_ms(),
            max_attempts: None,
            jitter_factor: d_jitter_factor(),
        }
    }
}

fn d_min_delay_ms() -> u64 {
    1_000
}
fn d_max_delay_ms() -> u64 {
    60_000
}
fn d_jitter_factor() -> f64 {
    0.2
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub accounts: HashMap<String, ChannelAccountConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelAccountConfig {
    #[serde(default)]
    pub auth_dir: Option<String>,
    #[serde(flatten)]
    pub access: AccessPolicy,
    #[serde(default = "d_true")]
    pub send_read_receipts: bool,
}

impl Default for ChannelAccountConfig {
    fn default() -> Self {
        Self {
            auth_dir: None,
            access: AccessPolicy::default(),
            send_read_receipts: true,
        }
    }
}

fn d_true() -> bool {
    true
}

/// Declarative rule mapping `(channel, account?, peer?)` to an agent id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Binding {
    pub agent_id: String,
    #[serde(rename = "match")]
    pub match_: BindingMatch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindingMatch {
    pub channel: String,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub peer_kind: Option<String>,
    #[serde(default)]
    pub peer_id: Option<String>,
}
