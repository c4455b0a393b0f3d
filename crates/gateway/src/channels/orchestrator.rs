//! Gateway orchestrator (C10): inbound event in, access-checked and routed,
//! a serialized agent turn run, outbound reply out.
//!
//! Generic over [`OutboundTransport`] so it composes access control
//! ([`sa_sessions::access`]), routing ([`sa_sessions::routing`]), and
//! dedupe ([`super::dedupe::InboundDedupe`]) without depending on any one
//! channel's wire protocol. A concrete transport (WhatsApp, Telegram, ...)
//! only has to implement `send`/`send_composing`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use sa_domain::config::{AccessPolicy, GatewayConfig};
use sa_sessions::{
    check_inbound, normalize_e164, resolve_route, upsert_session_meta, InboundContext,
    PairingStore, PeerRef,
};

use crate::runtime::{run_turn, TurnEvent, TurnInput};
use crate::state::AppState;

use super::dedupe::InboundDedupe;

/// The interval at which a typing indicator is refreshed while a turn runs.
const TYPING_REFRESH: Duration = Duration::from_secs(5);

/// What a concrete channel plugin must provide for the orchestrator to
/// deliver a reply. Implementations live with the transport, never here.
#[async_trait]
pub trait OutboundTransport: Send + Sync {
    async fn send(&self, account_id: &str, to: &str, body: &str) -> Result<(), String>;
    async fn send_composing(&self, account_id: &str, to: &str) -> Result<(), String>;
}

/// One FIFO lock per session key, so two inbound messages for the same
/// session never run their agent turns concurrently.
#[derive(Default)]
pub struct SessionSerializer {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionSerializer {
    async fn lock_for(&self, session_key: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(session_key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// Ties C8 (access), C9 (routing), and C11 (dedupe) to a single agent turn
/// per inbound message, for a transport `T`.
pub struct Orchestrator<T: OutboundTransport> {
    pub dedupe: InboundDedupe,
    pub pairing: PairingStore,
    pub serializer: SessionSerializer,
    pub session_meta_path: PathBuf,
    pub transport: Arc<T>,
}

impl<T: OutboundTransport> Orchestrator<T> {
    pub fn new(pairing_path: PathBuf, session_meta_path: PathBuf, transport: Arc<T>) -> sa_domain::error::Result<Self> {
        Ok(Self {
            dedupe: InboundDedupe::default(),
            pairing: PairingStore::load(pairing_path)?,
            serializer: SessionSerializer::default(),
            session_meta_path,
            transport,
        })
    }

    /// Run the full C10 pipeline for one inbound message. Never propagates
    /// an error to the caller — every failure is logged and swallowed so a
    /// malformed or unlucky message can't take the connector down.
    pub async fn handle_inbound(
        &self,
        state: &AppState,
        gateway_cfg: &GatewayConfig,
        policy: &AccessPolicy,
        default_agent_id: &str,
        ctx: InboundContext,
        pairing_grace_ms: i64,
    ) {
        // 1. Dedupe — duplicate deliveries from a reconnecting transport are
        // dropped silently before anything else runs.
        if self.dedupe.is_recent_inbound(&ctx.message_key) {
            tracing::debug!(message_key = %ctx.message_key, "dropping duplicate inbound message");
            return;
        }

        // 2. Access decision. A denial may still produce a pairing reply.
        let connected_at = chrono::Utc::now();
        let (decision, pairing) =
            check_inbound(&ctx, policy, connected_at, pairing_grace_ms, &self.pairing).await;

        if let Some(outcome) = pairing {
            if let Err(e) = self.transport.send(&ctx.account_id, &ctx.from, &outcome.reply).await {
                tracing::warn!(error = %e, to = %ctx.from, "failed to send pairing reply");
            }
        }

        if !decision.allowed {
            tracing::info!(
                account_id = %ctx.account_id,
                channel = %ctx.channel,
                reason = ?decision.deny_reason,
                "inbound message denied"
            );
            return;
        }

        // 3. Route + session metadata.
        let peer = PeerRef {
            peer_kind: if ctx.group { "group".to_string() } else { "direct".to_string() },
            peer_id: ctx.from.clone(),
        };
        let route = resolve_route(gateway_cfg, default_agent_id, &ctx.channel, &ctx.account_id, Some(&peer));
        let session_key = route.session_key.clone();

        if let Err(e) = upsert_session_meta(
            &self.session_meta_path,
            &session_key,
            &route.channel,
            &ctx.from,
            &route.account_id,
            &route.agent_id,
        ) {
            tracing::warn!(error = %e, session_key = %session_key, "failed to persist session metadata");
        }

        // 4. Defense in depth: re-check the reply destination against
        // allow_from even though step 2 already allowed the inbound sender.
        // Catches policy/config drift between the inbound and outbound side
        // of the same peer rather than trusting step 2's decision forever.
        if !ctx.group {
            let wildcard = policy.allow_from.iter().any(|a| a == "*");
            let still_allowed = wildcard
                || policy.allow_from.iter().any(|a| normalize_e164(a) == normalize_e164(&ctx.from));
            if !still_allowed {
                tracing::warn!(to = %ctx.from, "outbound reply blocked by defense-in-depth allow_from check");
                return;
            }
        }

        // 5. Serialized agent run, with a typing indicator kept warm while
        // the turn is in flight.
        let _guard = self.serializer.lock_for(&session_key).await;

        let typing_cancel = CancellationToken::new();
        let typing_task = {
            let transport = self.transport.clone();
            let account_id = route.account_id.clone();
            let to = ctx.from.clone();
            let cancel = typing_cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = transport.send_composing(&account_id, &to).await {
                    tracing::debug!(error = %e, "typing indicator send failed");
                }
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(TYPING_REFRESH) => {
                            if let Err(e) = transport.send_composing(&account_id, &to).await {
                                tracing::debug!(error = %e, "typing indicator refresh failed");
                            }
                        }
                    }
                }
            })
        };

        let input = TurnInput {
            session_key: session_key.clone(),
            session_id: session_key.clone(),
            user_message: ctx.body.clone(),
            model: None,
            response_format: None,
            agent: None,
            routing_profile: None,
        };

        let (_run_id, mut rx) = run_turn(state.clone(), input);

        let mut reply = String::new();
        while let Some(event) = rx.recv().await {
            match event {
                TurnEvent::Final { content } | TurnEvent::Stopped { content } => reply = content,
                TurnEvent::Error { message } => {
                    tracing::warn!(session_key = %session_key, error = %message, "turn error");
                }
                _ => {}
            }
        }

        typing_cancel.cancel();
        let _ = typing_task.await;

        if reply.is_empty() {
            return;
        }
        if let Err(e) = self.transport.send(&route.account_id, &ctx.from, &reply).await {
            tracing::warn!(error = %e, to = %ctx.from, "failed to send reply");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    // `handle_inbound` needs a full `AppState` (provider registry, session
    // store, workspace, ...) which isn't practical to construct in a unit
    // test, so these cover the orchestrator's own pieces — `Orchestrator`
    // construction and `SessionSerializer`'s locking — rather than the
    // whole pipeline.

    #[tokio::test]
    async fn orchestrator_new_creates_empty_pairing_store() {
        let dir = tempdir().unwrap();
        struct NoopTransport;
        #[async_trait]
        impl OutboundTransport for NoopTransport {
            async fn send(&self, _account_id: &str, _to: &str, _body: &str) -> Result<(), String> {
                Ok(())
            }
            async fn send_composing(&self, _account_id: &str, _to: &str) -> Result<(), String> {
                Ok(())
            }
        }

        let orch = Orchestrator::new(
            dir.path().join("pairing.json"),
            dir.path().join("session_meta.json"),
            Arc::new(NoopTransport),
        )
        .unwrap();

        assert!(!orch.dedupe.is_recent_inbound("k1"));
        assert!(orch.dedupe.is_recent_inbound("k1"));
    }

    #[tokio::test]
    async fn session_serializer_same_key_is_mutually_exclusive() {
        let serializer = SessionSerializer::default();

        let first = serializer.lock_for("s1").await;

        // A second lock attempt for the same key must not resolve until the
        // first guard is dropped.
        let serializer = Arc::new(serializer);
        let s2 = serializer.clone();
        let handle = tokio::spawn(async move {
            let _g = s2.lock_for("s1").await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished(), "second lock should still be waiting");

        drop(first);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn session_serializer_distinct_keys_do_not_block() {
        let serializer = SessionSerializer::default();
        let _a = serializer.lock_for("s1").await;
        // A different key must acquire immediately even while "s1" is held.
        let b = tokio::time::timeout(Duration::from_millis(50), serializer.lock_for("s2")).await;
        assert!(b.is_ok(), "distinct session keys must not contend");
    }
}
