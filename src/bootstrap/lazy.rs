//! Lazy bootstrap: recursive pulling seeded by a hash, discovering
//! predecessors (and receive sources) on the fly, plus the wallet variant
//! seeded by a list of accounts of interest.

use super::attempt::Attempt;
use super::bulk_pull;
use super::pull::PullInfo;
use super::BootstrapContext;
use crate::ledger::{Account, Amount, Block, BlockHash, HashOrAccount, Ledger};

use tracing::{debug, info};

use colored::Colorize;
use tokio::time::{Duration, Instant};

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

/// Expiry is relaxed by this factor when the seed is known to be cemented
/// network-side.
const CONFIRMED_EXPIRY_FACTOR: u32 = 4;

#[derive(Default)]
struct LazyTables {
    /// Hashes yet to pull; queue for order, set for dedup.
    pending: VecDeque<BlockHash>,
    pending_set: HashSet<BlockHash>,
    /// Hashes already pulled or found locally; prevents re-pulling.
    processed: HashSet<BlockHash>,
    /// Balances observed on state blocks, for send/receive disambiguation.
    balances: HashMap<BlockHash, Amount>,
    /// Destination accounts discovered from send blocks.
    destinations: VecDeque<Account>,
    destinations_seen: HashSet<Account>,
    /// State blocks whose send/receive nature is still undecidable:
    /// hash -> (previous, balance, link).
    state_unknown: HashMap<BlockHash, (BlockHash, Amount, HashOrAccount)>,
}

/// The traversal engine shared by lazy and wallet-lazy attempts.
pub struct LazyCore {
    tables: Mutex<LazyTables>,
    /// Scan destination accounts discovered from sends.
    scan_destinations: bool,
}

impl LazyCore {
    pub fn new(scan_destinations: bool) -> LazyCore {
        LazyCore { tables: Mutex::new(LazyTables::default()), scan_destinations }
    }

    /// Add a hash to the pending set; returns whether it was new.
    pub fn seed(&self, hash: BlockHash) -> bool {
        let mut tables = self.tables.lock().unwrap();
        if tables.processed.contains(&hash) {
            return false;
        }
        if tables.pending_set.insert(hash) {
            tables.pending.push_back(hash);
            true
        } else {
            false
        }
    }

    pub fn pending_len(&self) -> usize {
        self.tables.lock().unwrap().pending.len()
    }

    pub fn processed_len(&self) -> usize {
        self.tables.lock().unwrap().processed.len()
    }

    pub fn state_unknown_len(&self) -> usize {
        self.tables.lock().unwrap().state_unknown.len()
    }

    /// A pull gave up after exhausting retries; stop chasing its head.
    pub fn pull_exhausted(&self, pull: &PullInfo) {
        let mut tables = self.tables.lock().unwrap();
        if !pull.head.is_zero() {
            tables.processed.insert(pull.head);
        }
    }

    /// Take up to `batch` hashes that are still unknown locally.
    fn drain_batch(&self, ledger: &Ledger, batch: usize) -> Vec<BlockHash> {
        let mut tables = self.tables.lock().unwrap();
        let mut out = vec![];
        while out.len() < batch {
            let hash = match tables.pending.pop_front() {
                Some(hash) => hash,
                None => break,
            };
            tables.pending_set.remove(&hash);
            if tables.processed.contains(&hash) {
                continue;
            }
            if ledger.block_or_pruned_exists(&hash).unwrap_or(false) {
                tables.processed.insert(hash);
                continue;
            }
            out.push(hash);
        }
        out
    }

    /// Take discovered destination accounts that are still unknown locally.
    fn drain_destinations(&self, ledger: &Ledger) -> Vec<Account> {
        if !self.scan_destinations {
            return vec![];
        }
        let mut tables = self.tables.lock().unwrap();
        let mut out = vec![];
        while let Some(account) = tables.destinations.pop_front() {
            match ledger.account_info(&account) {
                Ok(None) => out.push(account),
                _ => (),
            }
        }
        out
    }

    /// Inspect one received block: mark it processed, queue its unknown
    /// dependencies, classify state links. Returns whether the pull should
    /// stop (the hash was already walked).
    pub async fn process_block(
        &self,
        ctx: &BootstrapContext,
        block: Block,
        known_account: Account,
    ) -> bool {
        let hash = block.hash();
        {
            let mut tables = self.tables.lock().unwrap();
            if tables.processed.contains(&hash) {
                // The peer is re-sending ground we covered; cut the pull.
                return true;
            }
            tables.processed.insert(hash);
            tables.pending_set.remove(&hash);

            let previous = block.previous();
            if !previous.is_zero() {
                Self::add_dependency(&mut tables, &ctx.ledger, previous);
            }
            match &block {
                Block::Send { destination, .. } => {
                    if tables.destinations_seen.insert(*destination) {
                        tables.destinations.push_back(*destination);
                    }
                }
                Block::Receive { source, .. } | Block::Open { source, .. } => {
                    Self::add_dependency(&mut tables, &ctx.ledger, *source);
                }
                Block::State { balance, link, .. } => {
                    tables.balances.insert(hash, *balance);
                    if !link.is_zero() {
                        Self::classify_state_link(
                            &mut tables,
                            &ctx.ledger,
                            hash,
                            previous,
                            *balance,
                            *link,
                        );
                    }
                }
                Block::Change { .. } => (),
            }
        }
        ctx.processor.add(block, known_account).await;
        false
    }

    fn add_dependency(tables: &mut LazyTables, ledger: &Ledger, hash: BlockHash) {
        if tables.processed.contains(&hash) {
            return;
        }
        if ledger.block_or_pruned_exists(&hash).unwrap_or(false) {
            return;
        }
        if tables.pending_set.insert(hash) {
            tables.pending.push_back(hash);
        }
    }

    /// Decide whether a state block's link is a send destination or a
    /// receive source. The previous balance may be local, observed earlier
    /// in this walk, or still unknown.
    fn classify_state_link(
        tables: &mut LazyTables,
        ledger: &Ledger,
        hash: BlockHash,
        previous: BlockHash,
        balance: Amount,
        link: HashOrAccount,
    ) {
        let previous_balance = if previous.is_zero() {
            Some(0)
        } else {
            match ledger.block_balance(&previous) {
                Ok(Some(balance)) => Some(balance),
                _ => tables.balances.get(&previous).copied(),
            }
        };
        match previous_balance {
            Some(pb) if balance < pb => {
                // A send: the link names a destination account.
                let destination = link.as_account();
                if tables.destinations_seen.insert(destination) {
                    tables.destinations.push_back(destination);
                }
            }
            Some(_) => {
                // A receive (or open): the link names the source send.
                Self::add_dependency(tables, ledger, link.as_hash());
            }
            None => {
                // Undecidable without more context; retried after the batch.
                tables.state_unknown.insert(hash, (previous, balance, link));
            }
        }
    }

    /// Re-run classification for blocks whose context may have arrived.
    fn retry_state_unknown(&self, ledger: &Ledger) {
        let mut tables = self.tables.lock().unwrap();
        let entries: Vec<(BlockHash, (BlockHash, Amount, HashOrAccount))> =
            tables.state_unknown.iter().map(|(k, v)| (*k, *v)).collect();
        for (hash, (previous, balance, link)) in entries.into_iter() {
            let known = match ledger.block_balance(&previous) {
                Ok(Some(balance)) => Some(balance),
                _ => tables.balances.get(&previous).copied(),
            };
            if known.is_some() {
                tables.state_unknown.remove(&hash);
                Self::classify_state_link(&mut tables, ledger, hash, previous, balance, link);
            }
        }
    }
}

/// The shared batch loop: drain pending hashes into pulls, wait for the
/// pulls to land, retry undecided state blocks, and finish when no new work
/// appeared or the expiry clock elapsed.
async fn run_walk(base: &Attempt, core: &LazyCore, ctx: &BootstrapContext, expiry: Duration) {
    let deadline = Instant::now() + expiry;
    loop {
        if base.stopped() || Instant::now() >= deadline {
            break;
        }
        if core.processed_len() >= ctx.config.lazy_max_blocks {
            debug!("lazy attempt reached its block cap");
            break;
        }
        let batch = core.drain_batch(&ctx.ledger, ctx.config.lazy_batch_size);
        let destinations = core.drain_destinations(&ctx.ledger);
        if batch.is_empty() && destinations.is_empty() && base.pulling() == 0 {
            break;
        }
        for hash in batch.into_iter() {
            base.pull_started();
            ctx.connections.pulls.push_back(PullInfo::new(
                Account::zero(),
                hash,
                BlockHash::zero(),
                ctx.config.lazy_max_pull_count,
                ctx.config.lazy_retry_limit,
                base.incremental_id,
            ));
        }
        for account in destinations.into_iter() {
            base.pull_started();
            ctx.connections.pulls.push_back(PullInfo::new(
                account,
                BlockHash::zero(),
                BlockHash::zero(),
                ctx.config.lazy_max_pull_count,
                ctx.config.lazy_retry_limit,
                base.incremental_id,
            ));
        }
        while base.still_pulling() && Instant::now() < deadline {
            base.wait_condition(Duration::from_millis(100)).await;
            if base.should_log() {
                info!(
                    "[{}] attempt {} pulling={} pending={} processed={}",
                    "bootstrap".cyan(),
                    base.id,
                    base.pulling(),
                    core.pending_len(),
                    core.processed_len()
                );
            }
        }
        ctx.processor.flush().await;
        core.retry_state_unknown(&ctx.ledger);
    }
}

pub struct LazyAttempt {
    pub base: Attempt,
    /// The peer's realtime endpoint.
    pub peer: SocketAddr,
    /// The peer's bootstrap listener.
    pub endpoint: SocketAddr,
    /// The seed hash is known cemented network-side, relaxing expiry.
    pub confirmed: bool,
    pub seed: BlockHash,
    pub core: LazyCore,
}

impl LazyAttempt {
    pub fn new(
        base: Attempt,
        peer: SocketAddr,
        endpoint: SocketAddr,
        seed: BlockHash,
        confirmed: bool,
        scan_destinations: bool,
    ) -> Arc<LazyAttempt> {
        Arc::new(LazyAttempt {
            base,
            peer,
            endpoint,
            confirmed,
            seed,
            core: LazyCore::new(scan_destinations),
        })
    }
}

pub async fn run(attempt: Arc<LazyAttempt>, ctx: BootstrapContext) {
    // A seed the ledger already holds completes immediately with zero pulls.
    if ctx.ledger.block_or_pruned_exists(&attempt.seed).unwrap_or(false) {
        info!(
            "[{}] lazy attempt {} seed already present, nothing to do",
            "bootstrap".cyan(),
            attempt.base.id
        );
        return;
    }
    attempt.core.seed(attempt.seed);
    let expiry = if attempt.confirmed {
        ctx.config.lazy_expiry * CONFIRMED_EXPIRY_FACTOR
    } else {
        ctx.config.lazy_expiry
    };
    run_walk(&attempt.base, &attempt.core, &ctx, expiry).await;

    let unresolved = attempt.core.state_unknown_len();
    for _ in 0..unresolved {
        ctx.counters.inc_bulk_pull_failed_account();
    }
    ctx.processor.clear_unchecked();
    info!(
        "[{}] exiting lazy bootstrap attempt {} with {} total blocks ({} unresolved)",
        "bootstrap".cyan(),
        attempt.base.id,
        attempt.base.total_blocks.load(Ordering::SeqCst),
        unresolved
    );
}

pub struct WalletAttempt {
    pub base: Attempt,
    pub peer: SocketAddr,
    pub endpoint: SocketAddr,
    pub core: LazyCore,
    wallet_accounts: Mutex<VecDeque<Account>>,
}

impl WalletAttempt {
    pub fn new(
        base: Attempt,
        peer: SocketAddr,
        endpoint: SocketAddr,
        accounts: Vec<Account>,
        scan_destinations: bool,
    ) -> Arc<WalletAttempt> {
        Arc::new(WalletAttempt {
            base,
            peer,
            endpoint,
            core: LazyCore::new(scan_destinations),
            wallet_accounts: Mutex::new(accounts.into()),
        })
    }

    pub fn wallet_size(&self) -> usize {
        self.wallet_accounts.lock().unwrap().len()
    }

    /// Queue more accounts onto a live attempt.
    pub fn wallet_add(&self, accounts: Vec<Account>) {
        let mut wallet = self.wallet_accounts.lock().unwrap();
        wallet.extend(accounts);
    }
}

pub async fn run_wallet(attempt: Arc<WalletAttempt>, ctx: BootstrapContext) {
    // Seed phase: each wallet account gets a by-account pull (the server
    // resolves its current head, standing in for a frontier probe) and a
    // pending-receivables scan whose sources seed the walk.
    loop {
        if attempt.base.stopped() {
            break;
        }
        let account = {
            let mut wallet = attempt.wallet_accounts.lock().unwrap();
            match wallet.pop_front() {
                Some(account) => account,
                None => break,
            }
        };
        attempt.base.pull_started();
        ctx.connections.pulls.push_back(PullInfo::new(
            account,
            BlockHash::zero(),
            BlockHash::zero(),
            ctx.config.lazy_max_pull_count,
            ctx.config.lazy_retry_limit,
            attempt.base.incremental_id,
        ));

        match ctx.connections.lease(attempt.endpoint, attempt.base.incremental_id, false).await {
            Ok(mut client) => {
                match bulk_pull::bulk_pull_account_client(&mut client, &ctx, account, 0).await {
                    Ok(entries) => {
                        ctx.connections.release(client, true);
                        for entry in entries.into_iter() {
                            attempt.core.seed(entry.hash);
                        }
                    }
                    Err(err) => {
                        debug!("receivables scan for {:?} failed: {:?}", account, err);
                        ctx.connections.fail(client);
                    }
                }
            }
            Err(err) => debug!("no connection for receivables scan: {:?}", err),
        }
    }

    run_walk(&attempt.base, &attempt.core, &ctx, ctx.config.lazy_expiry).await;

    let unresolved = attempt.core.state_unknown_len();
    for _ in 0..unresolved {
        ctx.counters.inc_bulk_pull_failed_account();
    }
    ctx.processor.clear_unchecked();
    info!(
        "[{}] exiting wallet_lazy bootstrap attempt {} with {} total blocks",
        "bootstrap".cyan(),
        attempt.base.id,
        attempt.base.total_blocks.load(Ordering::SeqCst)
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::types::hash;

    #[actix_rt::test]
    async fn test_seed_dedup() {
        let core = LazyCore::new(false);
        let h = BlockHash::digest(b"seed");
        assert!(core.seed(h));
        assert!(!core.seed(h));
        assert_eq!(1, core.pending_len());
    }

    #[actix_rt::test]
    async fn test_drain_batch_skips_known() {
        let ledger = Ledger::temporary().unwrap();
        let genesis_account = Account::from_bytes(hash(b"genesis"));
        let genesis_hash = ledger.initialize(genesis_account, 10).unwrap();

        let core = LazyCore::new(false);
        core.seed(genesis_hash);
        core.seed(BlockHash::digest(b"unknown"));

        let batch = core.drain_batch(&ledger, 10);
        assert_eq!(vec![BlockHash::digest(b"unknown")], batch);
        // The known hash was marked processed, not dropped silently.
        assert_eq!(1, core.processed_len());
    }

    #[actix_rt::test]
    async fn test_state_link_classification_deferred() {
        let ledger = Ledger::temporary().unwrap();
        let mut tables = LazyTables::default();

        let previous = BlockHash::digest(b"prev");
        let link = HashOrAccount::from(BlockHash::digest(b"link"));
        // Previous balance unknown: undecidable.
        LazyCore::classify_state_link(
            &mut tables,
            &ledger,
            BlockHash::digest(b"state"),
            previous,
            100,
            link,
        );
        assert_eq!(1, tables.state_unknown.len());

        // Once the previous balance is observed, a lower balance is a send.
        tables.balances.insert(previous, 500);
        let core = LazyCore::new(true);
        *core.tables.lock().unwrap() = tables;
        core.retry_state_unknown(&ledger);
        let tables = core.tables.lock().unwrap();
        assert!(tables.state_unknown.is_empty());
        assert_eq!(1, tables.destinations.len());
    }

    #[actix_rt::test]
    async fn test_open_state_is_receive() {
        let ledger = Ledger::temporary().unwrap();
        let mut tables = LazyTables::default();
        let link = HashOrAccount::from(BlockHash::digest(b"source"));
        // Zero previous: balance can only have come from the link source.
        LazyCore::classify_state_link(
            &mut tables,
            &ledger,
            BlockHash::digest(b"open"),
            BlockHash::zero(),
            100,
            link,
        );
        assert!(tables.state_unknown.is_empty());
        assert!(tables.pending_set.contains(&link.as_hash()));
    }
}
