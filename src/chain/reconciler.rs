//! Periodic backfill of agent identifiers for souls whose mint confirmation
//! never reached the server.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{ChainClient, RegistryEvent};
use crate::store::{SetOnce, SoulStore};

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub interval: Duration,
    /// Souls examined per pass.
    pub batch_size: usize,
    /// Upper bound on one receipt lookup.
    pub request_timeout: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(120),
            batch_size: 50,
            request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub scanned: usize,
    pub backfilled: usize,
    /// Receipt not available yet.
    pub pending: usize,
    /// Receipt available but no registry event in it.
    pub missing_event: usize,
    /// Another writer got there first.
    pub already_set: usize,
    pub errors: usize,
}

#[derive(Debug)]
pub struct Reconciler {
    store: Arc<dyn SoulStore>,
    chain: Arc<dyn ChainClient>,
    event: RegistryEvent,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn SoulStore>,
        chain: Arc<dyn ChainClient>,
        event: RegistryEvent,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            chain,
            event,
            config,
        }
    }

    /// One scan over souls awaiting their agent id. Never fails: every
    /// problem is counted in the report and logged.
    pub async fn run_once(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let souls = match self.store.souls_awaiting_agent_id(self.config.batch_size) {
            Ok(souls) => souls,
            Err(e) => {
                error!(error = %e, "reconcile: could not list souls");
                report.errors += 1;
                return report;
            }
        };

        for soul in souls {
            report.scanned += 1;
            // Stuck souls rotate to the back of the next scan.
            if let Err(e) = self.store.mark_reconcile_checked(&soul.id, Utc::now()) {
                warn!(soul = %soul.handle, error = %e, "could not record reconcile check");
            }
            let Some(tx_hash) = soul.mint_tx_hash.as_deref() else {
                continue;
            };

            let lookup = tokio::time::timeout(
                self.config.request_timeout,
                self.chain.transaction_logs(tx_hash),
            )
            .await;
            let logs = match lookup {
                Ok(Ok(Some(logs))) => logs,
                Ok(Ok(None)) => {
                    debug!(soul = %soul.handle, tx = tx_hash, "receipt not available yet");
                    report.pending += 1;
                    continue;
                }
                Ok(Err(e)) => {
                    warn!(soul = %soul.handle, tx = tx_hash, error = %e, "receipt lookup failed");
                    report.errors += 1;
                    continue;
                }
                Err(_) => {
                    warn!(soul = %soul.handle, tx = tx_hash, "receipt lookup timed out");
                    report.errors += 1;
                    continue;
                }
            };

            let Some(agent_id) = self.event.extract_agent_id(&logs) else {
                warn!(soul = %soul.handle, tx = tx_hash, "no registry event in receipt");
                report.missing_event += 1;
                continue;
            };

            match self.store.set_agent_id(&soul.id, &agent_id, Utc::now()) {
                Ok(SetOnce::Written) => {
                    info!(soul = %soul.handle, agent_id = %agent_id, "backfilled agent id");
                    report.backfilled += 1;
                }
                Ok(SetOnce::Unchanged) => report.already_set += 1,
                Ok(SetOnce::AlreadySet(existing)) => {
                    warn!(
                        soul = %soul.handle,
                        existing = %existing,
                        observed = %agent_id,
                        "agent id already set to a different value"
                    );
                    report.already_set += 1;
                }
                Err(e) => {
                    error!(soul = %soul.handle, error = %e, "could not record agent id");
                    report.errors += 1;
                }
            }
        }

        if report.scanned > 0 {
            info!(
                scanned = report.scanned,
                backfilled = report.backfilled,
                pending = report.pending,
                errors = report.errors,
                "reconcile pass finished"
            );
        }
        report
    }

    /// Run [`run_once`](Self::run_once) on a fixed interval until the
    /// returned handle is shut down.
    pub fn spawn(self: Arc<Self>) -> ReconcilerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let period = self.config.interval;

        let task = tokio::spawn(async move {
            info!(interval_secs = period.as_secs(), "reconciler started");
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.run_once().await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("reconciler stopped");
        });

        ReconcilerHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

#[derive(Debug)]
pub struct ReconcilerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReconcilerHandle {
    /// Signal the loop to stop and wait for the in-flight pass to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "reconciler task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testing::ScriptedChain;
    use crate::chain::DEFAULT_REGISTRY_EVENT;
    use crate::quota::QuotaPolicy;
    use crate::store::MemoryStore;
    use crate::types::Soul;

    fn minted(store: &dyn SoulStore, handle: &str, tx: &str) -> Soul {
        let soul = Soul::new(handle, handle, format!("0x{}", handle), Utc::now());
        store.insert_soul(&soul, &QuotaPolicy::default()).unwrap();
        store.record_mint_tx(&soul.id, tx, Utc::now()).unwrap();
        soul
    }

    fn reconciler(store: Arc<dyn SoulStore>, chain: ScriptedChain) -> Reconciler {
        Reconciler::new(
            store,
            Arc::new(chain),
            RegistryEvent::new(DEFAULT_REGISTRY_EVENT, None),
            ReconcilerConfig {
                request_timeout: Duration::from_millis(200),
                ..ReconcilerConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn test_backfills_missing_agent_id() {
        let store: Arc<dyn SoulStore> = Arc::new(MemoryStore::new());
        let soul = minted(store.as_ref(), "ada", "0xtx1");
        let pending = minted(store.as_ref(), "bob", "0xtx2");

        let r = reconciler(store.clone(), ScriptedChain::default().with_mint("0xtx1", 17));
        let report = r.run_once().await;
        assert_eq!(report.scanned, 2);
        assert_eq!(report.backfilled, 1);
        assert_eq!(report.pending, 1);

        let soul = store.soul_by_id(&soul.id).unwrap().unwrap();
        assert_eq!(soul.agent_id.as_deref(), Some("17"));
        assert!(store.soul_by_id(&pending.id).unwrap().unwrap().agent_id.is_none());

        // Second pass only looks at the soul still waiting.
        let report = r.run_once().await;
        assert_eq!(report.scanned, 1);
        assert_eq!(report.backfilled, 0);
    }

    #[tokio::test]
    async fn test_chain_unavailable_is_reported_not_raised() {
        let store: Arc<dyn SoulStore> = Arc::new(MemoryStore::new());
        let soul = minted(store.as_ref(), "ada", "0xtx1");
        let chain = ScriptedChain {
            unavailable: true,
            ..Default::default()
        };
        let report = reconciler(store.clone(), chain).run_once().await;
        assert_eq!(report.errors, 1);
        assert!(store.soul_by_id(&soul.id).unwrap().unwrap().agent_id.is_none());
    }

    #[tokio::test]
    async fn test_missing_event_is_counted() {
        let store: Arc<dyn SoulStore> = Arc::new(MemoryStore::new());
        minted(store.as_ref(), "ada", "0xtx1");
        let chain = ScriptedChain::default();
        chain.receipts.lock().insert("0xtx1".into(), Vec::new());
        let report = reconciler(store, chain).run_once().await;
        assert_eq!(report.missing_event, 1);
    }

    #[tokio::test]
    async fn test_stuck_souls_do_not_block_newer_mints() {
        let store: Arc<dyn SoulStore> = Arc::new(MemoryStore::new());
        minted(store.as_ref(), "stuck_a", "0xdead1");
        minted(store.as_ref(), "stuck_b", "0xdead2");
        let good = minted(store.as_ref(), "good", "0xgood");

        let chain = ScriptedChain::default().with_mint("0xgood", 21);
        chain.receipts.lock().insert("0xdead1".into(), Vec::new());
        chain.receipts.lock().insert("0xdead2".into(), Vec::new());
        let r = Reconciler::new(
            store.clone(),
            Arc::new(chain),
            RegistryEvent::new(DEFAULT_REGISTRY_EVENT, None),
            ReconcilerConfig {
                batch_size: 2,
                ..ReconcilerConfig::default()
            },
        );

        let first = r.run_once().await;
        assert_eq!(first.missing_event, 2);
        assert_eq!(first.backfilled, 0);

        let second = r.run_once().await;
        assert_eq!(second.scanned, 2);
        assert_eq!(second.backfilled, 1);
        assert_eq!(
            store.soul_by_id(&good.id).unwrap().unwrap().agent_id.as_deref(),
            Some("21")
        );
    }

    #[tokio::test]
    async fn test_client_confirmation_wins_race() {
        let store: Arc<dyn SoulStore> = Arc::new(MemoryStore::new());
        let soul = minted(store.as_ref(), "ada", "0xtx1");
        let r = reconciler(store.clone(), ScriptedChain::default().with_mint("0xtx1", 17));

        // Client confirmation lands first with a different id.
        store.set_agent_id(&soul.id, "99", Utc::now()).unwrap();
        let report = r.run_once().await;
        assert_eq!(report.scanned, 0);
        assert_eq!(
            store.soul_by_id(&soul.id).unwrap().unwrap().agent_id.as_deref(),
            Some("99")
        );
    }

    #[tokio::test]
    async fn test_spawned_loop_backfills_and_shuts_down() {
        let store: Arc<dyn SoulStore> = Arc::new(MemoryStore::new());
        let soul = minted(store.as_ref(), "ada", "0xtx1");
        let r = Reconciler::new(
            store.clone(),
            Arc::new(ScriptedChain::default().with_mint("0xtx1", 5)),
            RegistryEvent::new(DEFAULT_REGISTRY_EVENT, None),
            ReconcilerConfig {
                interval: Duration::from_millis(10),
                ..ReconcilerConfig::default()
            },
        );
        let handle = Arc::new(r).spawn();

        for _ in 0..100 {
            if store.soul_by_id(&soul.id).unwrap().unwrap().agent_id.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.shutdown().await;
        assert_eq!(
            store.soul_by_id(&soul.id).unwrap().unwrap().agent_id.as_deref(),
            Some("5")
        );
    }
}
