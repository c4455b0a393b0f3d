use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Access control policy (per channel account)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Inbound access policy for one channel account. Mirrors the
/// `gateway.json` `channels.<id>.accounts.<acctId>` shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessPolicy {
    #[serde(default)]
    pub dm_policy: DmPolicyMode,
    #[serde(default)]
    pub group_policy: GroupPolicyMode,
    /// E.164 numbers (or `"*"`) allowed to DM. The operator's own number
    /// enables self-chat mode when present here with no wildcard.
    #[serde(default)]
    pub allow_from: Vec<String>,
    /// E.164 numbers (or `"*"`) allowed to trigger replies in groups.
    #[serde(default)]
    pub group_allow_from: Vec<String>,
}

impl Default for AccessPolicy {
    fn default() -> Self {
        Self {
            dm_policy: DmPolicyMode::Pairing,
            group_policy: GroupPolicyMode::Disabled,
            allow_from: Vec::new(),
            group_allow_from: Vec::new(),
        }
    }
}

impl AccessPolicy {
    /// Self-chat mode: `allow_from` names exactly the operator's own number
    /// and carries no wildcard.
    pub fn self_chat_number(&self) -> Option<&str> {
        if self.allow_from.len() == 1 && self.allow_from[0] != "*" {
            Some(self.allow_from[0].as_str())
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DmPolicyMode {
    Pairing,
    Allowlist,
    Open,
    Disabled,
}

impl Default for DmPolicyMode {
    fn default() -> Self {
        Self::Pairing
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupPolicyMode {
    Open,
    Allowlist,
    Disabled,
}

impl Default for GroupPolicyMode {
    fn default() -> Self {
        Self::Disabled
    }
}

/// Pairing grace window after a transport reconnect: pairing replies are
/// suppressed for this long, to avoid acting on backlog delivered right
/// after reconnect.
pub const DEFAULT_PAIRING_GRACE_MS: i64 = 30_000;
