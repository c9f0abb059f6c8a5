//! The bootstrap subsystem: attempts, exchanges, pull queuing, connection
//! pooling and the initiator that owns them.
//!
//! Data flow: the [initiator](initiator::BootstrapInitiator) creates an
//! attempt; a legacy attempt opens a [frontier](frontier) exchange over a
//! pooled connection, which emits pull descriptors into the shared
//! [pull queue](pull::PullQueue); the dispatcher in [connections] leases
//! connections and drives [bulk pull](bulk_pull) exchanges; received blocks
//! flow into the external [block processor](crate::process::BlockProcessor);
//! the attempt observes ledger progress and decides to requeue, stop or
//! complete. Lazy and wallet attempts skip the frontier pass and synthesize
//! pulls from seed hashes or account lists.

pub mod attempt;
pub mod bulk_pull;
pub mod bulk_push;
pub mod connections;
pub mod frontier;
pub mod initiator;
pub mod lazy;
pub mod legacy;
pub mod listener;
pub mod pull;

pub use attempt::{Attempt, AttemptKind, AttemptRegistry};
pub use connections::{BootstrapClient, BootstrapConnections};
pub use initiator::BootstrapInitiator;
pub use pull::{PullInfo, PullQueue};

use crate::ledger::{Amount, Ledger};
use crate::process::BlockProcessor;
use crate::rep_crawler::RepCrawler;

use actix::Addr;
use tokio::time::Duration;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapMode {
    Legacy,
    Lazy,
    WalletLazy,
}

impl BootstrapMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BootstrapMode::Legacy => "legacy",
            BootstrapMode::Lazy => "lazy",
            BootstrapMode::WalletLazy => "wallet_lazy",
        }
    }
}

/// Tunables of the subsystem. [BootstrapConfig::dev] shrinks every limit so
/// multi-node tests converge in milliseconds.
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    /// Target number of concurrent pull exchanges.
    pub bootstrap_connections: usize,
    /// Hard cap on open bootstrap sockets; leases wait above this.
    pub bootstrap_connections_max: usize,
    /// Idle sockets kept pooled per process.
    pub max_idle_connections: usize,
    /// Idle sockets older than this are closed by the sweep.
    pub idle_timeout: Duration,
    /// Wall-clock budget for a single socket read or write.
    pub tcp_io_timeout: Duration,
    pub connect_timeout: Duration,

    pub frontier_retry_limit: u32,
    pub lazy_retry_limit: u32,
    /// `age` sent in frontier requests; `u32::MAX` disables the filter.
    pub frontiers_age: u32,
    pub bulk_push_cost_limit: u64,

    /// Requeues past this trip the frontier confirmation restart condition.
    pub requeued_pulls_limit: u32,
    pub frontier_confirmation_blocks_limit: u64,
    pub bootstrap_max_confirm_frontiers: usize,
    pub required_frontier_confirmation_ratio: f64,
    pub frontier_confirmation_rounds: u32,
    pub frontier_confirmation_wait: Duration,

    /// Per-pull block cap used by lazy pulls.
    pub lazy_max_pull_count: u32,
    pub lazy_batch_size: usize,
    pub lazy_max_blocks: usize,
    pub lazy_expiry: Duration,
    /// Scan destination accounts discovered from sends even when the seed is
    /// unconfirmed.
    pub lazy_destinations: bool,

    /// Streams slower than this after warmup are aborted.
    pub minimum_blocks_per_sec: f64,
    pub warmup_time: Duration,

    pub disable_legacy_bootstrap: bool,
    pub disable_bulk_push_client: bool,

    pub online_weight_minimum: Amount,
    pub bootstrap_fraction_numerator: u64,
}

impl BootstrapConfig {
    pub fn live() -> Self {
        BootstrapConfig {
            bootstrap_connections: 4,
            bootstrap_connections_max: 64,
            max_idle_connections: 8,
            idle_timeout: Duration::from_secs(60),
            tcp_io_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(5),
            frontier_retry_limit: 16,
            lazy_retry_limit: 64,
            frontiers_age: u32::MAX,
            bulk_push_cost_limit: 200,
            requeued_pulls_limit: 256,
            frontier_confirmation_blocks_limit: 128 * 1024,
            bootstrap_max_confirm_frontiers: 70,
            required_frontier_confirmation_ratio: 0.8,
            frontier_confirmation_rounds: 20,
            frontier_confirmation_wait: Duration::from_millis(500),
            lazy_max_pull_count: 512,
            lazy_batch_size: 64,
            lazy_max_blocks: 1024 * 1024,
            lazy_expiry: Duration::from_secs(300),
            lazy_destinations: false,
            minimum_blocks_per_sec: 10.0,
            warmup_time: Duration::from_secs(1),
            disable_legacy_bootstrap: false,
            disable_bulk_push_client: false,
            online_weight_minimum: 60_000,
            bootstrap_fraction_numerator: 3,
        }
    }

    pub fn dev() -> Self {
        BootstrapConfig {
            bootstrap_connections: 4,
            bootstrap_connections_max: 16,
            max_idle_connections: 4,
            idle_timeout: Duration::from_secs(10),
            tcp_io_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(2),
            frontier_retry_limit: 4,
            lazy_retry_limit: 8,
            frontiers_age: u32::MAX,
            bulk_push_cost_limit: 200,
            requeued_pulls_limit: 8,
            frontier_confirmation_blocks_limit: 128 * 1024,
            bootstrap_max_confirm_frontiers: 16,
            required_frontier_confirmation_ratio: 0.8,
            frontier_confirmation_rounds: 4,
            frontier_confirmation_wait: Duration::from_millis(25),
            lazy_max_pull_count: 128,
            lazy_batch_size: 8,
            lazy_max_blocks: 4096,
            lazy_expiry: Duration::from_secs(15),
            lazy_destinations: false,
            minimum_blocks_per_sec: 0.0,
            warmup_time: Duration::from_secs(1),
            disable_legacy_bootstrap: false,
            disable_bulk_push_client: false,
            online_weight_minimum: 1_000,
            bootstrap_fraction_numerator: 3,
        }
    }

    /// The weight above which an account counts as a principal
    /// representative.
    pub fn minimum_principal_weight(&self) -> Amount {
        self.online_weight_minimum / self.bootstrap_fraction_numerator as Amount
    }
}

/// Exported counters. Values convey totals since process start.
#[derive(Debug, Default)]
pub struct Counters {
    initiated: AtomicU64,
    bulk_pull_failed_account: AtomicU64,
    frontier_confirmation_successful: AtomicU64,
    frontier_confirmation_failed: AtomicU64,
}

impl Counters {
    pub fn new() -> Counters {
        Counters::default()
    }

    pub fn inc_initiated(&self) {
        self.initiated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn initiated(&self) -> u64 {
        self.initiated.load(Ordering::Relaxed)
    }

    pub fn inc_bulk_pull_failed_account(&self) {
        self.bulk_pull_failed_account.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bulk_pull_failed_account(&self) -> u64 {
        self.bulk_pull_failed_account.load(Ordering::Relaxed)
    }

    pub fn inc_frontier_confirmation_successful(&self) {
        self.frontier_confirmation_successful.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frontier_confirmation_successful(&self) -> u64 {
        self.frontier_confirmation_successful.load(Ordering::Relaxed)
    }

    pub fn inc_frontier_confirmation_failed(&self) {
        self.frontier_confirmation_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frontier_confirmation_failed(&self) -> u64 {
        self.frontier_confirmation_failed.load(Ordering::Relaxed)
    }
}

/// Advisory in-memory exclusion list. A peer that misbehaves twice stops
/// receiving leases; nothing is persisted.
#[derive(Debug, Default)]
pub struct PeerExclusion {
    strikes: Mutex<HashMap<SocketAddr, u32>>,
}

const EXCLUSION_STRIKES: u32 = 2;

impl PeerExclusion {
    pub fn new() -> PeerExclusion {
        PeerExclusion::default()
    }

    /// Record a misbehavior; returns the strike count.
    pub fn add_strike(&self, endpoint: SocketAddr) -> u32 {
        let mut strikes = self.strikes.lock().unwrap();
        let count = strikes.entry(endpoint).or_insert(0);
        *count += 1;
        *count
    }

    pub fn is_excluded(&self, endpoint: &SocketAddr) -> bool {
        let strikes = self.strikes.lock().unwrap();
        strikes.get(endpoint).map_or(false, |count| *count >= EXCLUSION_STRIKES)
    }
}

/// Everything an attempt or exchange needs to reach the rest of the node.
/// Cloning is cheap; attempts receive this as a parameter instead of holding
/// back-references.
#[derive(Clone)]
pub struct BootstrapContext {
    pub ledger: Arc<Ledger>,
    pub processor: BlockProcessor,
    pub connections: Arc<BootstrapConnections>,
    pub attempts: Arc<AttemptRegistry>,
    pub counters: Arc<Counters>,
    pub config: Arc<BootstrapConfig>,
    pub crawler: Option<Addr<RepCrawler>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[actix_rt::test]
    async fn test_peer_exclusion_two_strikes() {
        let exclusion = PeerExclusion::new();
        let peer: SocketAddr = "127.0.0.1:7075".parse().unwrap();
        assert!(!exclusion.is_excluded(&peer));
        assert_eq!(1, exclusion.add_strike(peer));
        assert!(!exclusion.is_excluded(&peer));
        assert_eq!(2, exclusion.add_strike(peer));
        assert!(exclusion.is_excluded(&peer));
    }
}
