//! The initiator owns every live attempt: it schedules them, coalesces
//! duplicate requests, cancels them and surfaces their state.

use super::attempt::{Attempt, AttemptKind, AttemptRegistry};
use super::connections::{self, BootstrapConnections};
use super::lazy::{self, LazyAttempt, WalletAttempt};
use super::legacy::{self, LegacyAttempt};
use super::{BootstrapConfig, BootstrapContext, BootstrapMode, Counters};
use crate::ledger::{Account, BlockHash, Ledger};
use crate::process::BlockProcessor;
use crate::rep_crawler::RepCrawler;
use crate::util;

use tracing::{info, warn};

use actix::Addr;
use colored::Colorize;
use rand::seq::SliceRandom;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub struct BootstrapInitiator {
    ctx: BootstrapContext,
    incremental: AtomicU64,
    /// Realtime endpoints of peers eligible as lazy/wallet pull sources.
    default_peers: Mutex<Vec<SocketAddr>>,
}

impl BootstrapInitiator {
    pub fn new(
        ledger: Arc<Ledger>,
        processor: BlockProcessor,
        config: Arc<BootstrapConfig>,
        counters: Arc<Counters>,
        crawler: Option<Addr<RepCrawler>>,
        peers: Vec<SocketAddr>,
    ) -> Arc<BootstrapInitiator> {
        let connections = BootstrapConnections::new(config.clone());
        let ctx = BootstrapContext {
            ledger,
            processor,
            connections: connections.clone(),
            attempts: Arc::new(AttemptRegistry::new()),
            counters,
            config,
            crawler,
        };
        tokio::spawn(connections::run_dispatcher(ctx.clone()));
        tokio::spawn(connections.run_sweeper());
        Arc::new(BootstrapInitiator {
            ctx,
            incremental: AtomicU64::new(0),
            default_peers: Mutex::new(peers),
        })
    }

    /// The shared context, for exchanges driven outside the initiator.
    pub fn context(&self) -> BootstrapContext {
        self.ctx.clone()
    }

    fn next_id(&self) -> u64 {
        self.incremental.fetch_add(1, Ordering::SeqCst)
    }

    fn remember_peer(&self, endpoint: SocketAddr) {
        let mut peers = self.default_peers.lock().unwrap();
        if !peers.contains(&endpoint) {
            peers.push(endpoint);
        }
    }

    fn pick_peer(&self) -> Option<SocketAddr> {
        let peers = self.default_peers.lock().unwrap();
        peers.choose(&mut rand::thread_rng()).copied()
    }

    /// Start a legacy attempt against `endpoint` (a peer's realtime
    /// address). Returns whether a new attempt was started; without `force`
    /// a running legacy attempt coalesces the request.
    pub fn bootstrap(
        self: &Arc<Self>,
        endpoint: SocketAddr,
        force: bool,
        id: Option<String>,
    ) -> bool {
        if self.ctx.config.disable_legacy_bootstrap {
            warn!("legacy bootstrap is disabled");
            return false;
        }
        if let Some(existing) = self.ctx.attempts.current_legacy() {
            if !force && !existing.base.stopped() {
                return false;
            }
            self.stop_one(&AttemptKind::Legacy(existing));
        }
        self.remember_peer(endpoint);
        let incremental_id = self.next_id();
        let attempt = LegacyAttempt::new(
            Attempt::new(BootstrapMode::Legacy, incremental_id, id),
            endpoint,
            util::bootstrap_endpoint(endpoint),
            self.ctx.config.frontiers_age,
            self.ctx.config.clone(),
        );
        self.ctx.attempts.insert(AttemptKind::Legacy(attempt.clone()));
        self.ctx.counters.inc_initiated();
        self.notify_listeners(true);
        let ctx = self.ctx.clone();
        let initiator = self.clone();
        tokio::spawn(async move {
            legacy::run(attempt.clone(), ctx).await;
            initiator.finish_attempt(attempt.base.incremental_id);
        });
        true
    }

    /// Start a lazy attempt seeded at `hash`. A running lazy attempt absorbs
    /// the seed instead unless `force`.
    pub fn bootstrap_lazy(
        self: &Arc<Self>,
        hash: BlockHash,
        force: bool,
        confirmed: bool,
        id: Option<String>,
    ) -> bool {
        if let Some(existing) = self.ctx.attempts.current_lazy() {
            if !force && !existing.base.stopped() {
                existing.core.seed(hash);
                return false;
            }
            self.stop_one(&AttemptKind::Lazy(existing));
        }
        let peer = match self.pick_peer() {
            Some(peer) => peer,
            None => {
                warn!("no peers available for lazy bootstrap");
                return false;
            }
        };
        let incremental_id = self.next_id();
        let scan_destinations = confirmed || self.ctx.config.lazy_destinations;
        let attempt = LazyAttempt::new(
            Attempt::new(BootstrapMode::Lazy, incremental_id, id),
            peer,
            util::bootstrap_endpoint(peer),
            hash,
            confirmed,
            scan_destinations,
        );
        self.ctx.attempts.insert(AttemptKind::Lazy(attempt.clone()));
        self.ctx.counters.inc_initiated();
        self.notify_listeners(true);
        let ctx = self.ctx.clone();
        let initiator = self.clone();
        tokio::spawn(async move {
            lazy::run(attempt.clone(), ctx).await;
            initiator.finish_attempt(attempt.base.incremental_id);
        });
        true
    }

    /// Start a wallet-lazy attempt over the supplied wallet accounts. A
    /// running wallet attempt absorbs the accounts instead.
    pub fn bootstrap_wallet(self: &Arc<Self>, accounts: Vec<Account>) -> bool {
        if accounts.is_empty() {
            return false;
        }
        if let Some(existing) = self.ctx.attempts.current_wallet() {
            if !existing.base.stopped() {
                existing.wallet_add(accounts);
                return false;
            }
            self.stop_one(&AttemptKind::Wallet(existing));
        }
        let peer = match self.pick_peer() {
            Some(peer) => peer,
            None => {
                warn!("no peers available for wallet bootstrap");
                return false;
            }
        };
        let incremental_id = self.next_id();
        let attempt = WalletAttempt::new(
            Attempt::new(BootstrapMode::WalletLazy, incremental_id, None),
            peer,
            util::bootstrap_endpoint(peer),
            accounts,
            self.ctx.config.lazy_destinations,
        );
        self.ctx.attempts.insert(AttemptKind::Wallet(attempt.clone()));
        self.ctx.counters.inc_initiated();
        self.notify_listeners(true);
        let ctx = self.ctx.clone();
        let initiator = self.clone();
        tokio::spawn(async move {
            lazy::run_wallet(attempt.clone(), ctx).await;
            initiator.finish_attempt(attempt.base.incremental_id);
        });
        true
    }

    pub fn current_attempt(&self) -> Option<Arc<LegacyAttempt>> {
        self.ctx.attempts.current_legacy()
    }

    pub fn current_lazy_attempt(&self) -> Option<Arc<LazyAttempt>> {
        self.ctx.attempts.current_lazy()
    }

    pub fn current_wallet_attempt(&self) -> Option<Arc<WalletAttempt>> {
        self.ctx.attempts.current_wallet()
    }

    pub fn in_progress(&self) -> bool {
        self.ctx.attempts.in_progress()
    }

    /// Signal every attempt to stop and evict their queued pulls. In-flight
    /// exchanges observe the stop token and unwind.
    pub fn stop_attempts(&self) {
        for attempt in self.ctx.attempts.all().into_iter() {
            self.stop_one(&attempt);
        }
    }

    /// Full shutdown: attempts, then the pool and its waiters.
    pub fn stop(&self) {
        self.stop_attempts();
        self.ctx.connections.stop();
    }

    fn stop_one(&self, attempt: &AttemptKind) {
        attempt.base().stop();
        let evicted =
            self.ctx.connections.pulls.clear_attempt(attempt.base().incremental_id);
        attempt.base().pulls_evicted(evicted as u32);
    }

    fn finish_attempt(&self, incremental_id: u64) {
        let _ = self.ctx.connections.pulls.clear_attempt(incremental_id);
        self.ctx.attempts.remove(incremental_id);
        self.notify_listeners(false);
    }

    fn notify_listeners(&self, starting: bool) {
        info!(
            "[{}] bootstrap {} ({} attempts live)",
            "bootstrap".cyan(),
            if starting { "attempt started" } else { "attempt exited" },
            self.ctx.attempts.all().len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::Counters;

    fn initiator() -> Arc<BootstrapInitiator> {
        let ledger = Arc::new(Ledger::temporary().unwrap());
        let processor = BlockProcessor::new(ledger.clone());
        BootstrapInitiator::new(
            ledger,
            processor,
            Arc::new(BootstrapConfig::dev()),
            Arc::new(Counters::new()),
            None,
            vec![],
        )
    }

    #[actix_rt::test]
    async fn test_lazy_requires_peer() {
        let initiator = initiator();
        assert!(!initiator.bootstrap_lazy(BlockHash::digest(b"seed"), false, false, None));
        assert!(!initiator.in_progress());
    }

    #[actix_rt::test]
    async fn test_legacy_coalesces() {
        let initiator = initiator();
        let endpoint: SocketAddr = "127.0.0.1:39998".parse().unwrap();
        assert!(initiator.bootstrap(endpoint, false, Some("first".to_string())));
        // A second request without force coalesces onto the live attempt.
        assert!(!initiator.bootstrap(endpoint, false, Some("second".to_string())));
        assert!(initiator.in_progress());
        assert_eq!("first", initiator.current_attempt().unwrap().base.id);
        initiator.stop();
    }

    #[actix_rt::test]
    async fn test_counters_count_initiated() {
        let initiator = initiator();
        let endpoint: SocketAddr = "127.0.0.1:39996".parse().unwrap();
        initiator.bootstrap(endpoint, false, None);
        initiator.bootstrap(endpoint, true, None);
        assert_eq!(2, initiator.context().counters.initiated());
        initiator.stop();
    }
}
