//! Generic per-account plugin lifecycle manager.
//!
//! A [`ChannelPlugin`] is generic over its own config shape and resolved
//! account type so the manager stays transport-agnostic: the same
//! start/stop/snapshot machinery drives WhatsApp, Telegram, Signal, or any
//! future transport.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Per-account runtime status, as reported by a running plugin task.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AccountStatus {
    pub running: bool,
    pub last_error: Option<String>,
    pub last_start_at: Option<DateTime<Utc>>,
    pub last_stop_at: Option<DateTime<Utc>>,
}

/// Handed to a plugin's `start_account` task. The plugin reads `account` and
/// reports status transitions through `set_status`; it must stop promptly
/// once `cancellation.is_cancelled()`.
#[derive(Clone)]
pub struct ChannelContext<Account> {
    pub account_id: String,
    pub account: Account,
    pub cancellation: CancellationToken,
    status: Arc<RwLock<HashMap<String, AccountStatus>>>,
}

impl<Account> ChannelContext<Account> {
    pub fn get_status(&self) -> AccountStatus {
        self.status
            .read()
            .get(&self.account_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_status(&self, status: AccountStatus) {
        self.status.write().insert(self.account_id.clone(), status);
    }
}

/// A channel transport. `Config` is the plugin's slice of the gateway config;
/// `Account` is what `resolve_account` turns an account id into.
#[async_trait]
pub trait ChannelPlugin<Config, Account>: Send + Sync
where
    Config: Send + Sync,
    Account: Clone + Send + Sync + 'static,
{
    fn list_account_ids(&self, cfg: &Config) -> Vec<String>;
    fn resolve_account(&self, cfg: &Config, id: &str) -> Option<Account>;

    fn is_enabled(&self, _account: &Account, _cfg: &Config) -> bool {
        true
    }

    fn is_configured(&self, _account: &Account, _cfg: &Config) -> bool {
        true
    }

    /// Drive the account's connection until `ctx.cancellation` fires or the
    /// transport gives up on its own. Returning ends the task.
    async fn start_account(&self, ctx: ChannelContext<Account>) -> sa_domain::error::Result<()>;

    /// Best-effort graceful shutdown hook, called before the task is awaited.
    async fn stop_account(&self, _ctx: &ChannelContext<Account>) {}
}

struct RunningTask {
    cancellation: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns one plugin's accounts: which are running, their last known status,
/// and the tasks driving them.
pub struct PluginManager<Config, Account> {
    plugin: Arc<dyn ChannelPlugin<Config, Account>>,
    config: RwLock<Config>,
    status: Arc<RwLock<HashMap<String, AccountStatus>>>,
    tasks: RwLock<HashMap<String, RunningTask>>,
}

impl<Config, Account> PluginManager<Config, Account>
where
    Config: Clone + Send + Sync + 'static,
    Account: Clone + Send + Sync + 'static,
{
    pub fn new(plugin: Arc<dyn ChannelPlugin<Config, Account>>, config: Config) -> Self {
        Self {
            plugin,
            config: RwLock::new(config),
            status: Arc::new(RwLock::new(HashMap::new())),
            tasks: RwLock::new(HashMap::new()),
        }
    }

    pub fn replace_config(&self, config: Config) {
        *self.config.write() = config;
    }

    fn set_status(&self, id: &str, status: AccountStatus) {
        self.status.write().insert(id.to_string(), status);
    }

    /// Start one account. No-op if it is already running.
    pub async fn start_account(&self, id: &str) {
        if self.tasks.read().contains_key(id) {
            return;
        }

        let cfg = self.config.read().clone();
        let Some(account) = self.plugin.resolve_account(&cfg, id) else {
            self.set_status(
                id,
                AccountStatus {
                    running: false,
                    last_error: Some("account not configured".to_string()),
                    ..Default::default()
                },
            );
            return;
        };

        if !self.plugin.is_enabled(&account, &cfg) || !self.plugin.is_configured(&account, &cfg) {
            self.set_status(
                id,
                AccountStatus {
                    running: false,
                    last_error: Some("disabled or not configured".to_string()),
                    ..Default::default()
                },
            );
            return;
        }

        let cancellation = CancellationToken::new();
        self.set_status(
            id,
            AccountStatus {
                running: true,
                last_error: None,
                last_start_at: Some(Utc::now()),
                last_stop_at: None,
            },
        );

        let ctx = ChannelContext {
            account_id: id.to_string(),
            account,
            cancellation: cancellation.clone(),
            status: self.status.clone(),
        };
        let plugin = self.plugin.clone();
        let status = self.status.clone();
        let account_id = id.to_string();

        let handle = tokio::spawn(async move {
            let result = plugin.start_account(ctx).await;
            let mut map = status.write();
            let entry = map.entry(account_id.clone()).or_default();
            entry.running = false;
            entry.last_stop_at = Some(Utc::now());
            if let Err(err) = result {
                tracing::warn!(account_id = %account_id, error = %err, "channel account task ended with error");
                entry.last_error = Some(err.to_string());
            }
        });

        self.tasks.write().insert(
            id.to_string(),
            RunningTask {
                cancellation,
                handle,
            },
        );
    }

    /// Abort one account's task and await its completion.
    pub async fn stop_account(&self, id: &str) {
        let task = self.tasks.write().remove(id);
        let Some(task) = task else {
            return;
        };
        task.cancellation.cancel();

        let cfg = self.config.read().clone();
        if let Some(account) = self.plugin.resolve_account(&cfg, id) {
            let ctx = ChannelContext {
                account_id: id.to_string(),
                account,
                cancellation: task.cancellation.clone(),
                status: self.status.clone(),
            };
            self.plugin.stop_account(&ctx).await;
        }

        let _ = task.handle.await;
    }

    pub async fn start_all(&self) {
        let cfg = self.config.read().clone();
        for id in self.plugin.list_account_ids(&cfg) {
            self.start_account(&id).await;
        }
    }

    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.tasks.read().keys().cloned().collect();
        for id in ids {
            self.stop_account(&id).await;
        }
    }

    /// Merged status over every configured account id and every id with a
    /// known runtime status (accounts that were removed from config but are
    /// still stopping, or failed to resolve, still show up here).
    pub fn get_snapshot(&self) -> HashMap<String, AccountStatus> {
        let cfg = self.config.read().clone();
        let mut ids: BTreeSet<String> = self.plugin.list_account_ids(&cfg).into_iter().collect();
        ids.extend(self.status.read().keys().cloned());

        let status = self.status.read();
        ids.into_iter()
            .map(|id| {
                let s = status.get(&id).cloned().unwrap_or_default();
                (id, s)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct FakeConfig {
        accounts: Vec<(String, bool, bool)>, // id, enabled, configured
    }

    struct FakePlugin {
        starts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ChannelPlugin<FakeConfig, String> for FakePlugin {
        fn list_account_ids(&self, cfg: &FakeConfig) -> Vec<String> {
            cfg.accounts.iter().map(|(id, _, _)| id.clone()).collect()
        }

        fn resolve_account(&self, cfg: &FakeConfig, id: &str) -> Option<String> {
            cfg.accounts
                .iter()
                .find(|(aid, _, _)| aid == id)
                .map(|(aid, _, _)| aid.clone())
        }

        fn is_enabled(&self, account: &String, cfg: &FakeConfig) -> bool {
            cfg.accounts
                .iter()
                .find(|(aid, _, _)| aid == account)
                .map(|(_, enabled, _)| *enabled)
                .unwrap_or(false)
        }

        fn is_configured(&self, account: &String, cfg: &FakeConfig) -> bool {
            cfg.accounts
                .iter()
                .find(|(aid, _, _)| aid == account)
                .map(|(_, _, configured)| *configured)
                .unwrap_or(false)
        }

        async fn start_account(&self, ctx: ChannelContext<String>) -> sa_domain::error::Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            while !ctx.cancellation.is_cancelled() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn start_account_is_noop_when_already_running() {
        let starts = Arc::new(AtomicUsize::new(0));
        let plugin = Arc::new(FakePlugin {
            starts: starts.clone(),
        });
        let cfg = FakeConfig {
            accounts: vec![("acct1".to_string(), true, true)],
        };
        let manager = PluginManager::new(plugin, cfg);

        manager.start_account("acct1").await;
        manager.start_account("acct1").await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert!(manager.get_snapshot()["acct1"].running);
    }

    #[tokio::test]
    async fn disabled_account_never_starts() {
        let starts = Arc::new(AtomicUsize::new(0));
        let plugin = Arc::new(FakePlugin {
            starts: starts.clone(),
        });
        let cfg = FakeConfig {
            accounts: vec![("acct1".to_string(), false, true)],
        };
        let manager = PluginManager::new(plugin, cfg);

        manager.start_account("acct1").await;

        assert_eq!(starts.load(Ordering::SeqCst), 0);
        let snapshot = manager.get_snapshot();
        assert!(!snapshot["acct1"].running);
        assert!(snapshot["acct1"].last_error.is_some());
    }

    #[tokio::test]
    async fn stop_account_cancels_and_marks_stopped() {
        let starts = Arc::new(AtomicUsize::new(0));
        let plugin = Arc::new(FakePlugin {
            starts: starts.clone(),
        });
        let cfg = FakeConfig {
            accounts: vec![("acct1".to_string(), true, true)],
        };
        let manager = PluginManager::new(plugin, cfg);

        manager.start_account("acct1").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.stop_account("acct1").await;

        let snapshot = manager.get_snapshot();
        assert!(!snapshot["acct1"].running);
        assert!(snapshot["acct1"].last_stop_at.is_some());
    }

    #[tokio::test]
    async fn snapshot_includes_unresolvable_configured_ids() {
        let starts = Arc::new(AtomicUsize::new(0));
        let plugin = Arc::new(FakePlugin { starts });
        let cfg = FakeConfig {
            accounts: vec![("ghost".to_string(), true, true)],
        };
        let manager: PluginManager<FakeConfig, String> = PluginManager::new(plugin, cfg.clone());
        // Replace config with one that no longer resolves "ghost" to force the
        // not-configured branch via a plugin returning None — simulate by
        // starting before removal then checking the snapshot still reports it.
        manager.replace_config(FakeConfig { accounts: vec![] });
        let snapshot = manager.get_snapshot();
        assert!(snapshot.get("ghost").is_none());
        // With the original config the id surfaces even without starting it.
        manager.replace_config(cfg);
        let snapshot = manager.get_snapshot();
        assert!(snapshot.contains_key("ghost"));
    }
}
