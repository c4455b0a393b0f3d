//! Channel→agent routing and session-key construction (C9).
//!
//! Distinct from [`super::session_key`], which implements the older
//! per-agent `DmScope` grammar used by the CLI/API surface. This module
//! implements the gateway's binding-precedence grammar: channel events
//! carry a `(channel, accountId, peer?)` triple, `resolve_route` binds
//! that to an agent via `gateway.json`'s `bindings`, and `build_session_key`
//! canonicalizes the resulting route into one stable string.

use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use sa_domain::config::{Binding, GatewayConfig};
use sa_domain::error::Result;
use sa_domain::persistence::{read_json_or_default, write_json_atomic};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchedBy {
    BindingPeer,
    BindingAccount,
    BindingChannel,
    Default,
}

#[derive(Debug, Clone)]
pub struct PeerRef {
    pub peer_kind: String,
    pub peer_id: String,
}

#[derive(Debug, Clone)]
pub struct Route {
    pub agent_id: String,
    pub channel: String,
    pub account_id: String,
    pub session_key: String,
    pub main_session_key: String,
    pub matched_by: MatchedBy,
}

/// Resolve the agent that should handle an inbound event, and build its
/// canonical session key.
///
/// Binding precedence: a peer-level match (channel + account-or-wildcard +
/// matching `peerKind`/`peerId`) beats an account-level match (channel +
/// exact account, no peer constraint), which beats a channel-level match
/// (channel only), which falls back to `default_agent_id`.
pub fn resolve_route(
    cfg: &GatewayConfig,
    default_agent_id: &str,
    channel: &str,
    account_id: &str,
    peer: Option<&PeerRef>,
) -> Route {
    let candidates: Vec<&Binding> = cfg
        .bindings
        .iter()
        .filter(|b| {
            b.match_.channel.eq_ignore_ascii_case(channel)
                && match &b.match_.account_id {
                    None => true,
                    Some(a) if a == "*" => true,
                    Some(a) => a.eq_ignore_ascii_case(account_id),
                }
        })
        .collect();

    let (agent_id, matched_by) = peer
        .and_then(|p| {
            candidates
                .iter()
                .find(|b| {
                    b.match_
                        .peer_kind
                        .as_deref()
                        .is_some_and(|k| k.eq_ignore_ascii_case(&p.peer_kind))
                        && b.match_
                            .peer_id
                            .as_deref()
                            .is_some_and(|id| id == p.peer_id)
                })
                .map(|b| (b.agent_id.clone(), MatchedBy::BindingPeer))
        })
        .or_else(|| {
            candidates
                .iter()
                .find(|b| b.match_.account_id.is_some() && b.match_.peer_id.is_none())
                .map(|b| (b.agent_id.clone(), MatchedBy::BindingAccount))
        })
        .or_else(|| {
            candidates
                .iter()
                .find(|b| b.match_.account_id.is_none() && b.match_.peer_id.is_none())
                .map(|b| (b.agent_id.clone(), MatchedBy::BindingChannel))
        })
        .unwrap_or_else(|| (default_agent_id.to_string(), MatchedBy::Default));

    let main_session_key = format!("agent:{agent_id}:main");
    let session_key = build_session_key(&agent_id, channel, account_id, peer);

    Route {
        agent_id,
        channel: channel.to_string(),
        account_id: account_id.to_string(),
        session_key,
        main_session_key,
        matched_by,
    }
}

/// `agent:<id>:main` with no peer, else
/// `agent:<id>:<channel>:<account>:<peerKind>:<peerId>`.
pub fn build_session_key(
    agent_id: &str,
    channel: &str,
    account_id: &str,
    peer: Option<&PeerRef>,
) -> String {
    match peer {
        None => format!("agent:{agent_id}:main"),
        Some(p) => format!(
            "agent:{agent_id}:{channel}:{account_id}:{}:{}",
            p.peer_kind, p.peer_id
        ),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session meta store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    pub session_key: String,
    pub created_at: chrono::DateTime<Utc>,
    pub updated_at: chrono::DateTime<Utc>,
    pub last_channel: String,
    pub last_to: String,
    pub last_account_id: String,
    pub last_agent_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SessionMetaFile {
    #[serde(flatten)]
    entries: std::collections::HashMap<String, SessionMeta>,
}

/// Atomic read-modify-write over a per-agent session-meta file: preserves
/// `created_at` on an existing entry and always refreshes `updated_at` and
/// the last-used fields.
pub fn upsert_session_meta(
    path: &Path,
    session_key: &str,
    channel: &str,
    to: &str,
    account_id: &str,
    agent_id: &str,
) -> Result<SessionMeta> {
    let mut file: SessionMetaFile = read_json_or_default(path)?;
    let now = Utc::now();

    let created_at = file
        .entries
        .get(session_key)
        .map(|m| m.created_at)
        .unwrap_or(now);

    let meta = SessionMeta {
        session_key: session_key.to_string(),
        created_at,
        updated_at: now,
        last_channel: channel.to_string(),
        last_to: to.to_string(),
        last_account_id: account_id.to_string(),
        last_agent_id: agent_id.to_string(),
    };

    file.entries.insert(session_key.to_string(), meta.clone());
    write_json_atomic(path, &file)?;
    Ok(meta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sa_domain::config::BindingMatch;
    use tempfile::tempdir;

    fn binding(agent: &str, channel: &str, account: Option<&str>, peer: Option<(&str, &str)>) -> Binding {
        Binding {
            agent_id: agent.to_string(),
            match_: BindingMatch {
                channel: channel.to_string(),
                account_id: account.map(str::to_string),
                peer_kind: peer.map(|(k, _)| k.to_string()),
                peer_id: peer.map(|(_, id)| id.to_string()),
            },
        }
    }

    #[test]
    fn s5_peer_match_beats_account_match() {
        let cfg = GatewayConfig {
            bindings: vec![
                binding("A", "x", Some("default"), None),
                binding("B", "x", None, Some(("direct", "+1"))),
            ],
            ..Default::default()
        };
        let peer = PeerRef {
            peer_kind: "direct".into(),
            peer_id: "+1".into(),
        };
        let route = resolve_route(&cfg, "fallback", "x", "default", Some(&peer));
        assert_eq!(route.agent_id, "B");
        assert_eq!(route.matched_by, MatchedBy::BindingPeer);
    }

    #[test]
    fn falls_back_to_account_level_binding() {
        let cfg = GatewayConfig {
            bindings: vec![binding("A", "x", Some("default"), None)],
            ..Default::default()
        };
        let route = resolve_route(&cfg, "fallback", "x", "default", None);
        assert_eq!(route.agent_id, "A");
        assert_eq!(route.matched_by, MatchedBy::BindingAccount);
    }

    #[test]
    fn falls_back_to_channel_level_binding() {
        let cfg = GatewayConfig {
            bindings: vec![binding("A", "x", None, None)],
            ..Default::default()
        };
        let route = resolve_route(&cfg, "fallback", "x", "other-account", None);
        assert_eq!(route.agent_id, "A");
        assert_eq!(route.matched_by, MatchedBy::BindingChannel);
    }

    #[test]
    fn falls_back_to_default_agent_when_nothing_matches() {
        let cfg = GatewayConfig::default();
        let route = resolve_route(&cfg, "fallback", "x", "default", None);
        assert_eq!(route.agent_id, "fallback");
        assert_eq!(route.matched_by, MatchedBy::Default);
        assert_eq!(route.session_key, "agent:fallback:main");
    }

    #[test]
    fn build_session_key_round_trips_through_itself() {
        let no_peer = build_session_key("bot", "x", "default", None);
        assert_eq!(build_session_key("bot", "x", "default", None), no_peer);

        let peer = PeerRef {
            peer_kind: "direct".into(),
            peer_id: "+1".into(),
        };
        let with_peer = build_session_key("bot", "x", "default", Some(&peer));
        assert_eq!(with_peer, "agent:bot:x:default:direct:+1");
    }

    #[test]
    fn upsert_session_meta_preserves_created_at() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meta.json");

        let first = upsert_session_meta(&path, "agent:bot:main", "x", "+1", "default", "bot").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = upsert_session_meta(&path, "agent:bot:main", "x", "+2", "default", "bot").unwrap();

        assert_eq!(first.created_at, second.created_at);
        assert!(second.updated_at >= first.updated_at);
        assert_eq!(second.last_to, "+2");
    }
}
