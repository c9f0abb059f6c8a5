//! Shared attempt state, the tagged dispatch over attempt modes and the
//! registry the initiator and the pull dispatcher share.

use super::lazy::{LazyAttempt, WalletAttempt};
use super::legacy::LegacyAttempt;
use super::pull::PullInfo;
use super::{BootstrapContext, BootstrapMode};
use crate::ledger::{Account, Block};

use tracing::info;

use colored::Colorize;
use tokio::sync::Notify;
use tokio::time::{Duration, Instant};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Progress is logged at most this often per attempt.
const LOG_INTERVAL: Duration = Duration::from_secs(15);

/// State common to every attempt mode. Stopping is a token (flag + notify)
/// observed at suspension points; nothing happens in destructors.
pub struct Attempt {
    /// Opaque trace tag carried by log lines.
    pub id: String,
    pub incremental_id: u64,
    pub mode: BootstrapMode,
    pub started_at: Instant,
    pub total_blocks: AtomicU64,
    pulling: AtomicU32,
    pub requeued_pulls: AtomicU32,
    stopped: AtomicBool,
    pub condition: Notify,
    next_log: Mutex<Instant>,
}

impl Attempt {
    pub fn new(mode: BootstrapMode, incremental_id: u64, id: Option<String>) -> Attempt {
        let id = id.unwrap_or_else(|| {
            let bytes: [u8; 16] = rand::random();
            bytes.iter().map(|b| format!("{:02X}", b)).collect()
        });
        info!(
            "[{}] starting {} bootstrap attempt with ID {}",
            "bootstrap".cyan(),
            mode.as_str(),
            id
        );
        Attempt {
            id,
            incremental_id,
            mode,
            started_at: Instant::now(),
            total_blocks: AtomicU64::new(0),
            pulling: AtomicU32::new(0),
            requeued_pulls: AtomicU32::new(0),
            stopped: AtomicBool::new(false),
            condition: Notify::new(),
            next_log: Mutex::new(Instant::now()),
        }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.condition.notify_waiters();
    }

    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn pulling(&self) -> u32 {
        self.pulling.load(Ordering::SeqCst)
    }

    pub fn pull_started(&self) {
        self.pulling.fetch_add(1, Ordering::SeqCst);
        self.condition.notify_waiters();
    }

    pub fn pull_finished(&self) {
        self.pulling.fetch_sub(1, Ordering::SeqCst);
        self.condition.notify_waiters();
    }

    /// Account for queued pulls evicted wholesale (attempt stop or abort).
    pub fn pulls_evicted(&self, count: u32) {
        if count > 0 {
            self.pulling.fetch_sub(count, Ordering::SeqCst);
            self.condition.notify_waiters();
        }
    }

    pub fn still_pulling(&self) -> bool {
        !self.stopped() && self.pulling() > 0
    }

    /// Rate-limit progress logging to one line per window.
    pub fn should_log(&self) -> bool {
        let mut next_log = self.next_log.lock().unwrap();
        let now = Instant::now();
        if *next_log <= now {
            *next_log = now + LOG_INTERVAL;
            true
        } else {
            false
        }
    }

    /// Park on the condition with a bounded wait.
    pub async fn wait_condition(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.condition.notified()).await;
    }
}

/// Tagged dispatch over the three attempt modes. Mode-specific operations
/// live on the mode-specific types; this enum carries only what the shared
/// pipelines need.
#[derive(Clone)]
pub enum AttemptKind {
    Legacy(Arc<LegacyAttempt>),
    Lazy(Arc<LazyAttempt>),
    Wallet(Arc<WalletAttempt>),
}

impl AttemptKind {
    pub fn base(&self) -> &Attempt {
        match self {
            AttemptKind::Legacy(attempt) => &attempt.base,
            AttemptKind::Lazy(attempt) => &attempt.base,
            AttemptKind::Wallet(attempt) => &attempt.base,
        }
    }

    /// The peer this attempt's pulls go to.
    pub fn pull_endpoint(&self) -> SocketAddr {
        match self {
            AttemptKind::Legacy(attempt) => attempt.endpoint,
            AttemptKind::Lazy(attempt) => attempt.endpoint,
            AttemptKind::Wallet(attempt) => attempt.endpoint,
        }
    }

    /// Hand one received block onward; returns whether the pull should stop
    /// early (lazy duplicate suppression).
    pub async fn process_block(
        &self,
        ctx: &BootstrapContext,
        block: Block,
        known_account: Account,
    ) -> bool {
        match self {
            AttemptKind::Legacy(attempt) => {
                attempt.process_block(ctx, block, known_account).await
            }
            AttemptKind::Lazy(attempt) => {
                attempt.core.process_block(ctx, block, known_account).await
            }
            AttemptKind::Wallet(attempt) => {
                attempt.core.process_block(ctx, block, known_account).await
            }
        }
    }

    /// A pull was requeued after a failure.
    pub fn on_requeue(&self) {
        self.base().requeued_pulls.fetch_add(1, Ordering::SeqCst);
        if let AttemptKind::Legacy(attempt) = self {
            attempt.restart_condition();
        }
    }

    /// A pull ran out of retries without closing its gap.
    pub fn on_pull_exhausted(&self, ctx: &BootstrapContext, pull: &PullInfo) {
        ctx.counters.inc_bulk_pull_failed_account();
        match self {
            AttemptKind::Legacy(_) => (),
            AttemptKind::Lazy(attempt) => attempt.core.pull_exhausted(pull),
            AttemptKind::Wallet(attempt) => attempt.core.pull_exhausted(pull),
        }
    }

    /// A pull completed cleanly; legacy attempts remember recent heads for
    /// frontier confirmation.
    pub fn on_pull_complete(&self, pull: &PullInfo) {
        if let AttemptKind::Legacy(attempt) = self {
            attempt.add_recent_pull(pull.head);
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    by_id: HashMap<u64, AttemptKind>,
    legacy: Option<Arc<LegacyAttempt>>,
    lazy: Option<Arc<LazyAttempt>>,
    wallet: Option<Arc<WalletAttempt>>,
}

/// Live attempts, indexed by incremental id and by mode slot. At most one
/// attempt per mode is live at a time.
#[derive(Default)]
pub struct AttemptRegistry {
    inner: Mutex<RegistryInner>,
}

impl AttemptRegistry {
    pub fn new() -> AttemptRegistry {
        AttemptRegistry::default()
    }

    pub fn find(&self, incremental_id: u64) -> Option<AttemptKind> {
        let inner = self.inner.lock().unwrap();
        inner.by_id.get(&incremental_id).cloned()
    }

    pub fn insert(&self, attempt: AttemptKind) {
        let mut inner = self.inner.lock().unwrap();
        inner.by_id.insert(attempt.base().incremental_id, attempt.clone());
        match attempt {
            AttemptKind::Legacy(a) => inner.legacy = Some(a),
            AttemptKind::Lazy(a) => inner.lazy = Some(a),
            AttemptKind::Wallet(a) => inner.wallet = Some(a),
        }
    }

    pub fn remove(&self, incremental_id: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(attempt) = inner.by_id.remove(&incremental_id) {
            // Only vacate the mode slot if a newer attempt hasn't taken it.
            match attempt {
                AttemptKind::Legacy(_) => {
                    if inner.legacy.as_ref().map(|a| a.base.incremental_id)
                        == Some(incremental_id)
                    {
                        inner.legacy = None;
                    }
                }
                AttemptKind::Lazy(_) => {
                    if inner.lazy.as_ref().map(|a| a.base.incremental_id) == Some(incremental_id)
                    {
                        inner.lazy = None;
                    }
                }
                AttemptKind::Wallet(_) => {
                    if inner.wallet.as_ref().map(|a| a.base.incremental_id)
                        == Some(incremental_id)
                    {
                        inner.wallet = None;
                    }
                }
            }
        }
    }

    pub fn current_legacy(&self) -> Option<Arc<LegacyAttempt>> {
        self.inner.lock().unwrap().legacy.clone()
    }

    pub fn current_lazy(&self) -> Option<Arc<LazyAttempt>> {
        self.inner.lock().unwrap().lazy.clone()
    }

    pub fn current_wallet(&self) -> Option<Arc<WalletAttempt>> {
        self.inner.lock().unwrap().wallet.clone()
    }

    pub fn in_progress(&self) -> bool {
        !self.inner.lock().unwrap().by_id.is_empty()
    }

    pub fn all(&self) -> Vec<AttemptKind> {
        self.inner.lock().unwrap().by_id.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[actix_rt::test]
    async fn test_pulling_counters() {
        let attempt = Attempt::new(BootstrapMode::Legacy, 1, Some("test".to_string()));
        assert!(!attempt.still_pulling());
        attempt.pull_started();
        attempt.pull_started();
        assert_eq!(2, attempt.pulling());
        assert!(attempt.still_pulling());
        attempt.pull_finished();
        attempt.pull_finished();
        assert!(!attempt.still_pulling());
    }

    #[actix_rt::test]
    async fn test_stop_token() {
        let attempt = Attempt::new(BootstrapMode::Lazy, 2, None);
        assert!(!attempt.stopped());
        assert_eq!(32, attempt.id.len());
        attempt.stop();
        assert!(attempt.stopped());
        attempt.pull_started();
        assert!(!attempt.still_pulling());
    }
}
