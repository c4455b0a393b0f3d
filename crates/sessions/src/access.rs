//! Access control (C8) — a deterministic inbound policy decision plus the
//! pairing-code side channel it can trigger.
//!
//! `check_inbound` is deterministic given its inputs; the one side effect
//! (persisting a [`PairingRequest`]) is isolated behind the injected
//! [`PairingStore`] so the decision logic itself stays easy to test.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};

use sa_domain::config::{AccessPolicy, DmPolicyMode, GroupPolicyMode};
use sa_domain::error::Result;
use sa_domain::persistence::{read_json_or_default, write_json_atomic};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Normalization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Strip a `whatsapp:` prefix, drop everything but digits and `+`, and
/// guarantee a leading `+`. Idempotent: re-normalizing an already-normal
/// number is a no-op.
pub fn normalize_e164(input: &str) -> String {
    let stripped = input.strip_prefix("whatsapp:").unwrap_or(input).trim();
    let kept: String = stripped
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '+')
        .collect();
    if kept.starts_with('+') {
        kept
    } else {
        format!("+{kept}")
    }
}

fn e164_eq(a: &str, b: &str) -> bool {
    normalize_e164(a) == normalize_e164(b)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inbound context + decision
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct InboundContext {
    pub account_id: String,
    pub channel: String,
    pub from: String,
    pub self_e164: Option<String>,
    pub sender_e164: Option<String>,
    pub group: bool,
    pub is_from_me: bool,
    pub body: String,
    pub reply_to_jid: Option<String>,
    pub message_timestamp: DateTime<Utc>,
    pub message_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub allowed: bool,
    pub should_mark_read: bool,
    pub is_self_chat: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deny_reason: Option<String>,
}

fn deny(reason: &str, is_self_chat: bool) -> CheckResult {
    CheckResult {
        allowed: false,
        should_mark_read: true,
        is_self_chat,
        deny_reason: Some(reason.to_string()),
    }
}

fn allow(is_self_chat: bool) -> CheckResult {
    CheckResult {
        allowed: true,
        should_mark_read: true,
        is_self_chat,
        deny_reason: None,
    }
}

/// A pairing code generated as a side effect of a denied DM, to be sent
/// back to the sender so they can complete pairing out of band.
#[derive(Debug, Clone)]
pub struct PairingOutcome {
    pub code: String,
    pub reply: String,
}

/// Decide whether an inbound message is allowed through, per policy.
///
/// Order of decisions (spec-mandated, do not reorder):
/// 1. Self-chat mode (`allow_from` names the normalized self number):
///    groups are always blocked; DMs pass iff the sender is self.
/// 2. Group, not self-chat: requires an open/allowlist group policy.
/// 3. Direct, not self-chat: disabled policy denies outright; a mirrored
///    outbound DM to a non-self peer denies; non-open policies require
///    `allow_from` membership, and a `pairing` policy miss (outside the
///    post-reconnect grace window) records a pairing request.
pub async fn check_inbound(
    ctx: &InboundContext,
    policy: &AccessPolicy,
    connected_at: DateTime<Utc>,
    pairing_grace_ms: i64,
    pairing_store: &PairingStore,
) -> (CheckResult, Option<PairingOutcome>) {
    let self_e164 = ctx.self_e164.as_deref().map(normalize_e164);
    let sender_e164 = ctx.sender_e164.as_deref().map(normalize_e164);

    let is_self_chat = match &self_e164 {
        Some(self_n) => policy.allow_from.iter().any(|a| e164_eq(a, self_n)),
        None => false,
    };

    if is_self_chat {
        if ctx.group {
            return (deny("group_blocked_self_chat_mode", true), None);
        }
        let sender_is_self = match (&self_e164, &sender_e164) {
            (Some(s), Some(snd)) => s == snd,
            _ => ctx.is_from_me,
        };
        return if sender_is_self {
            (allow(true), None)
        } else {
            (deny("sender_not_self_in_self_chat_mode", true), None)
        };
    }

    if ctx.group {
        if !matches!(
            policy.group_policy,
            GroupPolicyMode::Open | GroupPolicyMode::Allowlist
        ) {
            return (deny("group_policy_not_permissive", false), None);
        }
        if policy.group_policy == GroupPolicyMode::Allowlist {
            if policy.group_allow_from.is_empty() {
                return (deny("group_allowlist_empty", false), None);
            }
            let sender_allowed = policy.group_allow_from.iter().any(|a| a == "*")
                || sender_e164
                    .as_deref()
                    .map(|s| policy.group_allow_from.iter().any(|a| e164_eq(a, s)))
                    .unwrap_or(false);
            if !sender_allowed {
                return (deny("group_sender_not_allowlisted", false), None);
            }
        }
        return (allow(false), None);
    }

    // Direct message, not self-chat.
    if policy.dm_policy == DmPolicyMode::Disabled {
        return (deny("dm_policy_disabled", false), None);
    }
    if ctx.is_from_me {
        return (deny("outbound_dm_to_non_self", false), None);
    }
    if policy.dm_policy == DmPolicyMode::Open {
        return (allow(false), None);
    }

    let wildcard = policy.allow_from.iter().any(|a| a == "*");
    let sender_allowed = wildcard
        || sender_e164
            .as_deref()
            .map(|s| policy.allow_from.iter().any(|a| e164_eq(a, s)))
            .unwrap_or(false);

    if sender_allowed {
        return (allow(false), None);
    }

    let mut pairing_outcome = None;
    if policy.dm_policy == DmPolicyMode::Pairing {
        let is_backlog = ctx.message_timestamp < connected_at - Duration::milliseconds(pairing_grace_ms);
        if !is_backlog {
            if let Some(sender) = sender_e164.clone() {
                if let Ok(req) = pairing_store.get_or_create(&sender) {
                    pairing_outcome = Some(PairingOutcome {
                        code: req.code.clone(),
                        reply: build_pairing_reply(&req.code, &sender),
                    });
                }
            }
        }
    }

    (deny("dm_sender_not_allowlisted", false), pairing_outcome)
}

pub fn build_pairing_reply(code: &str, sender_id: &str) -> String {
    format!(
        "You're not paired yet. Reply with code {code} to continue chatting \
         with me (requested from {sender_id})."
    )
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pairing store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingRequest {
    pub phone: String,
    pub code: String,
    pub created_at: DateTime<Utc>,
}

/// Keyed by normalized E.164. A code is generated once per phone and then
/// persists — a collision (phone already has a pending request) returns
/// the existing code rather than regenerating.
pub struct PairingStore {
    path: PathBuf,
    requests: RwLock<HashMap<String, PairingRequest>>,
}

impl PairingStore {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let requests: HashMap<String, PairingRequest> = read_json_or_default(&path)?;
        Ok(Self {
            path,
            requests: RwLock::new(requests),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, phone: &str) -> Option<PairingRequest> {
        self.requests.read().get(&normalize_e164(phone)).cloned()
    }

    pub fn get_or_create(&self, phone: &str) -> Result<PairingRequest> {
        let key = normalize_e164(phone);
        if let Some(existing) = self.requests.read().get(&key).cloned() {
            return Ok(existing);
        }
        let req = PairingRequest {
            phone: key.clone(),
            code: generate_pairing_code(),
            created_at: Utc::now(),
        };
        self.requests.write().insert(key, req.clone());
        self.flush()?;
        Ok(req)
    }

    fn flush(&self) -> Result<()> {
        write_json_atomic(&self.path, &*self.requests.read())
    }
}

fn generate_pairing_code() -> String {
    let n: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("{n:06}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ctx(group: bool, is_from_me: bool, self_e164: Option<&str>, sender_e164: Option<&str>) -> InboundContext {
        InboundContext {
            account_id: "acct".into(),
            channel: "whatsapp".into(),
            from: sender_e164.unwrap_or("+10000000000").to_string(),
            self_e164: self_e164.map(str::to_string),
            sender_e164: sender_e164.map(str::to_string),
            group,
            is_from_me,
            body: "hi".into(),
            reply_to_jid: None,
            message_timestamp: Utc::now(),
            message_key: "k1".into(),
        }
    }

    fn store() -> PairingStore {
        let dir = tempdir().unwrap();
        PairingStore::load(dir.path().join("pairing.json")).unwrap()
    }

    #[tokio::test]
    async fn s1_self_chat_allowed() {
        let policy = AccessPolicy {
            allow_from: vec!["+15551234567".into()],
            ..Default::default()
        };
        let c = ctx(false, true, Some("+15551234567"), Some("+15551234567"));
        let store = store();
        let (result, _) = check_inbound(&c, &policy, Utc::now(), 30_000, &store).await;
        assert!(result.allowed);
        assert!(result.is_self_chat);
    }

    #[tokio::test]
    async fn s2_group_blocked_under_self_chat() {
        let policy = AccessPolicy {
            allow_from: vec!["+15551234567".into()],
            ..Default::default()
        };
        let c = ctx(true, true, Some("+15551234567"), Some("+15551234567"));
        let store = store();
        let (result, _) = check_inbound(&c, &policy, Utc::now(), 30_000, &store).await;
        assert!(!result.allowed);
        assert_eq!(result.deny_reason.as_deref(), Some("group_blocked_self_chat_mode"));
    }

    #[tokio::test]
    async fn s3_dm_disabled_denies() {
        let policy = AccessPolicy {
            dm_policy: DmPolicyMode::Disabled,
            ..Default::default()
        };
        let c = ctx(false, false, None, Some("+15550000000"));
        let store = store();
        let (result, _) = check_inbound(&c, &policy, Utc::now(), 30_000, &store).await;
        assert!(!result.allowed);
    }

    #[tokio::test]
    async fn s4_group_allowlist_miss() {
        let policy = AccessPolicy {
            group_policy: GroupPolicyMode::Allowlist,
            group_allow_from: vec!["+15551112222".into()],
            ..Default::default()
        };
        let c = ctx(true, false, None, Some("+15550000000"));
        let store = store();
        let (result, _) = check_inbound(&c, &policy, Utc::now(), 30_000, &store).await;
        assert!(!result.allowed);
        assert_eq!(result.deny_reason.as_deref(), Some("group_sender_not_allowlisted"));
    }

    #[tokio::test]
    async fn pairing_denial_records_a_pairing_request() {
        let policy = AccessPolicy::default(); // dm_policy: pairing, allow_from empty
        let c = ctx(false, false, None, Some("+15559998888"));
        let store = store();
        let (result, outcome) = check_inbound(&c, &policy, Utc::now() - Duration::hours(1), 30_000, &store).await;
        assert!(!result.allowed);
        assert_eq!(result.deny_reason.as_deref(), Some("dm_sender_not_allowlisted"));
        let outcome = outcome.expect("pairing outcome expected");
        assert_eq!(outcome.code.len(), 6);
        assert!(store.get("+15559998888").is_some());
    }

    #[tokio::test]
    async fn pairing_reply_suppressed_during_grace_window() {
        let policy = AccessPolicy::default();
        let now = Utc::now();
        let mut c = ctx(false, false, None, Some("+15559998888"));
        c.message_timestamp = now;
        let store = store();
        // connected_at far in the future relative to the message: the message
        // predates (connected_at - grace), so it's backlog and reply is suppressed.
        let (result, outcome) = check_inbound(&c, &policy, now + Duration::hours(1), 30_000, &store).await;
        assert!(!result.allowed);
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn pairing_code_collision_keeps_first_code() {
        let store = store();
        let first = store.get_or_create("+15551112222").unwrap();
        let second = store.get_or_create("+15551112222").unwrap();
        assert_eq!(first.code, second.code);
    }

    #[test]
    fn normalize_e164_is_idempotent() {
        for input in ["whatsapp:+1 (555) 123-4567", "15551234567", "+15551234567"] {
            let once = normalize_e164(input);
            let twice = normalize_e164(&once);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn normalize_e164_strips_whatsapp_prefix_and_adds_plus() {
        assert_eq!(normalize_e164("whatsapp:+15551234567"), "+15551234567");
        assert_eq!(normalize_e164("5551234567"), "+5551234567");
    }
}
