//! The legacy bootstrap attempt: frontier exchange, concurrent pulls, an
//! optional reverse push, gated by frontier confirmation against the
//! representative crawler.
//!
//! ```text
//! INIT -> FRONTIERS -> PULLING -> PUSHING -> DONE
//!                         ^__________|
//! ```

use super::attempt::Attempt;
use super::pull::PullInfo;
use super::{bulk_push, frontier, BootstrapConfig, BootstrapContext};
use crate::client;
use crate::ledger::{Account, Amount, Block, BlockHash, HashOrAccount};
use crate::message::ConfirmReq;
use crate::protocol::{Request, Response};
use crate::rep_crawler::{
    CrawlResponse, GetRepresentatives, RegisterActive, Representative, VoteTally,
};
use crate::util;

use tracing::{debug, error, info, warn};

use colored::Colorize;
use rand::Rng;
use tokio::time::{sleep, Duration};

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub struct LegacyAttempt {
    pub base: Attempt,
    /// The peer's realtime endpoint (its identity for the crawler).
    pub peer: SocketAddr,
    /// The peer's bootstrap listener, where exchanges connect.
    pub endpoint: SocketAddr,
    pub frontiers_age: u32,
    config: Arc<BootstrapConfig>,
    frontier_pulls: Mutex<VecDeque<PullInfo>>,
    bulk_push_targets: Mutex<Vec<(BlockHash, BlockHash)>>,
    recent_pulls_head: Mutex<VecDeque<BlockHash>>,
    pub frontiers_received: AtomicBool,
    pub frontiers_confirmed: AtomicBool,
    frontiers_confirmation_pending: AtomicBool,
    pub account_count: AtomicU64,
}

impl LegacyAttempt {
    pub fn new(
        base: Attempt,
        peer: SocketAddr,
        endpoint: SocketAddr,
        frontiers_age: u32,
        config: Arc<BootstrapConfig>,
    ) -> Arc<LegacyAttempt> {
        Arc::new(LegacyAttempt {
            base,
            peer,
            endpoint,
            frontiers_age,
            config,
            frontier_pulls: Mutex::new(VecDeque::new()),
            bulk_push_targets: Mutex::new(vec![]),
            recent_pulls_head: Mutex::new(VecDeque::new()),
            frontiers_received: AtomicBool::new(false),
            frontiers_confirmed: AtomicBool::new(false),
            frontiers_confirmation_pending: AtomicBool::new(false),
            account_count: AtomicU64::new(0),
        })
    }

    #[cfg(test)]
    pub(crate) fn for_tests(base: Attempt, endpoint: SocketAddr) -> Arc<LegacyAttempt> {
        Self::new(base, endpoint, endpoint, u32::MAX, Arc::new(BootstrapConfig::dev()))
    }

    /// Queue a pull discovered by the frontier exchange. A zero head is
    /// never queued: a malicious frontier must not produce unbounded pulls.
    pub fn add_frontier(&self, pull: PullInfo) {
        if !pull.head.is_zero() {
            let mut pulls = self.frontier_pulls.lock().unwrap();
            pulls.push_back(pull);
        }
    }

    pub fn add_bulk_push_target(&self, head: BlockHash, end: BlockHash) {
        let mut targets = self.bulk_push_targets.lock().unwrap();
        targets.push((head, end));
    }

    pub fn request_bulk_push_target(&self) -> Option<(BlockHash, BlockHash)> {
        let mut targets = self.bulk_push_targets.lock().unwrap();
        targets.pop()
    }

    /// Sliding window of recently completed pull heads; loop detection and
    /// confirmation candidates.
    pub fn add_recent_pull(&self, head: BlockHash) {
        if head.is_zero() {
            return;
        }
        let mut recent = self.recent_pulls_head.lock().unwrap();
        recent.push_back(head);
        if recent.len() > self.config.bootstrap_max_confirm_frontiers {
            recent.pop_front();
        }
    }

    pub async fn process_block(
        &self,
        ctx: &BootstrapContext,
        block: Block,
        known_account: Account,
    ) -> bool {
        ctx.processor.add(block, known_account).await;
        self.restart_condition();
        false
    }

    /// Conditions to start frontier confirmation: excessive requeues
    /// (usually bad pulls) or a large bootstrap.
    pub fn restart_condition(&self) {
        if !self.frontiers_confirmation_pending.load(Ordering::SeqCst)
            && !self.frontiers_confirmed.load(Ordering::SeqCst)
            && (self.base.requeued_pulls.load(Ordering::SeqCst) > self.config.requeued_pulls_limit
                || self.base.total_blocks.load(Ordering::SeqCst)
                    > self.config.frontier_confirmation_blocks_limit)
        {
            self.frontiers_confirmation_pending.store(true, Ordering::SeqCst);
            self.base.condition.notify_waiters();
        }
    }

    fn confirmation_pending(&self) -> bool {
        self.frontiers_confirmation_pending.load(Ordering::SeqCst)
    }

    fn take_frontier_pulls(&self) -> Vec<PullInfo> {
        let mut pulls = self.frontier_pulls.lock().unwrap();
        pulls.drain(..).collect()
    }

    fn clear_frontier_pulls(&self) {
        let mut pulls = self.frontier_pulls.lock().unwrap();
        pulls.clear();
    }

    /// One frontier request against the target peer. Returns `true` on
    /// failure, matching the retry loop's sense.
    async fn request_frontier(&self, ctx: &BootstrapContext, first_attempt: bool) -> bool {
        let mut client = match ctx
            .connections
            .lease(self.endpoint, self.base.incremental_id, !first_attempt)
            .await
        {
            Ok(client) => client,
            Err(err) => {
                debug!("no connection for frontier request: {:?}", err);
                return true;
            }
        };
        match frontier::request_frontiers(ctx, self, &mut client).await {
            Ok(()) => {
                ctx.connections.release(client, true);
                false
            }
            Err(err) => {
                debug!("frontier request failed: {:?}", err);
                ctx.connections.fail(client);
                self.clear_frontier_pulls();
                true
            }
        }
    }

    /// Run pending frontier confirmation; aborts the attempt on failure.
    pub(crate) async fn attempt_restart_check(&self, ctx: &BootstrapContext) {
        if !self.confirmation_pending() {
            return;
        }
        let confirmed = self.confirm_frontiers(ctx).await;
        if confirmed {
            ctx.counters.inc_frontier_confirmation_successful();
            self.frontiers_confirmed.store(true, Ordering::SeqCst);
        } else {
            ctx.counters.inc_frontier_confirmation_failed();
            error!(
                "[{}] frontier confirmation failed for peer {:?} after {:?}",
                "bootstrap".cyan(),
                self.peer,
                self.base.started_at.elapsed()
            );
            self.base.stop();
            let evicted = ctx.connections.pulls.clear_attempt(self.base.incremental_id);
            self.base.pulls_evicted(evicted as u32);
        }
        self.frontiers_confirmation_pending.store(false, Ordering::SeqCst);
    }

    /// Verify that a weighted quorum of representatives endorses the
    /// frontiers this attempt is pulling toward.
    pub(crate) async fn confirm_frontiers(&self, ctx: &BootstrapContext) -> bool {
        if self.frontiers_confirmed.load(Ordering::SeqCst) {
            return true;
        }
        let crawler = match &ctx.crawler {
            Some(crawler) => crawler,
            None => return false,
        };

        // Candidate frontiers: unresolved pull heads plus recent pull heads.
        let max = self.config.bootstrap_max_confirm_frontiers;
        let mut frontiers =
            ctx.connections.pulls.heads_for_attempt(self.base.incremental_id, max);
        {
            let recent = self.recent_pulls_head.lock().unwrap();
            for head in recent.iter() {
                if frontiers.len() == max {
                    break;
                }
                if !head.is_zero() && !frontiers.contains(head) {
                    frontiers.push(*head);
                }
            }
        }
        frontiers
            .retain(|hash| !ctx.ledger.block_or_pruned_exists(hash).unwrap_or(false));
        if frontiers.is_empty() {
            return true;
        }
        let frontiers_count = frontiers.len();

        let reps = match crawler
            .send(GetRepresentatives {
                count: usize::MAX,
                min_weight: Some(self.config.minimum_principal_weight()),
            })
            .await
        {
            Ok(result) => result.reps,
            Err(err) => {
                warn!("crawler unavailable: {:?}", err);
                return false;
            }
        };
        // Fewer than two known representatives is insufficient endorsement.
        if reps.len() < 2 {
            warn!(
                "[{}] insufficient representatives ({}) to confirm frontiers",
                "bootstrap".cyan(),
                reps.len()
            );
            return false;
        }
        let reps_weight: Amount = reps.iter().map(|rep| rep.weight).sum();
        let selected = select_confirmation_reps(&reps, reps_weight);
        let queried = selected.len();

        // Make the crawler treat the answering votes as solicited, so its
        // representative table learns from them too.
        let _ = crawler.send(RegisterActive { hashes: frontiers.clone() }).await;

        let mut voters: HashMap<BlockHash, HashMap<Account, Amount>> = HashMap::new();
        let mut confirmed_count = 0usize;
        let rounds = self.config.frontier_confirmation_rounds;
        for round in 0..=rounds {
            // Votes the crawler has already cached count toward the tally.
            let cached: HashMap<BlockHash, (Amount, usize)> = match crawler
                .send(VoteTally { hashes: frontiers.clone() })
                .await
            {
                Ok(result) => result
                    .tallies
                    .into_iter()
                    .map(|(hash, weight, count)| (hash, (weight, count)))
                    .collect(),
                Err(_) => HashMap::new(),
            };
            frontiers.retain(|hash| {
                let in_ledger = ctx.ledger.block_or_pruned_exists(hash).unwrap_or(false);
                let (mut tally, mut count) = voters
                    .get(hash)
                    .map(|v| (v.values().sum::<Amount>(), v.len()))
                    .unwrap_or((0, 0));
                if let Some((cached_tally, cached_count)) = cached.get(hash) {
                    tally = tally.max(*cached_tally);
                    count = count.max(*cached_count);
                }
                // Tally above 12.5% of rep weight with 60% of queried reps
                // responding counts as confirmed.
                let endorsed = in_ledger
                    || (tally > reps_weight / 8 && count as f64 >= queried as f64 * 0.6);
                if endorsed {
                    confirmed_count += 1;
                }
                !endorsed
            });
            if confirmed_count as f64
                >= frontiers_count as f64 * self.config.required_frontier_confirmation_ratio
            {
                return true;
            }
            if round == rounds || self.base.stopped() {
                break;
            }

            let request = Request::ConfirmReq(ConfirmReq {
                hash_roots: frontiers
                    .iter()
                    .map(|hash| (*hash, HashOrAccount::from(*hash)))
                    .collect(),
            });
            let channels: Vec<SocketAddr> = selected.iter().map(|rep| rep.channel).collect();
            for (channel, response) in client::fanout(channels, request).await {
                if let Response::ConfirmAck(ack) = response {
                    if ack.vote.validate().is_err() {
                        continue;
                    }
                    let weight = ctx.ledger.weight(&ack.vote.account).unwrap_or(0);
                    for hash in ack.vote.hashes.iter() {
                        voters
                            .entry(*hash)
                            .or_insert_with(HashMap::new)
                            .insert(ack.vote.account, weight);
                    }
                    crawler.do_send(CrawlResponse { channel, vote: ack.vote });
                }
            }
            sleep(self.config.frontier_confirmation_wait).await;
        }
        info!(
            "[{}] failed to confirm frontiers: {} of {} unconfirmed",
            "bootstrap".cyan(),
            frontiers.len(),
            frontiers_count
        );
        false
    }

    async fn request_push(&self, ctx: &BootstrapContext) {
        let mut client =
            match ctx.connections.lease(self.endpoint, self.base.incremental_id, false).await {
                Ok(client) => client,
                Err(err) => {
                    debug!("no connection for bulk push: {:?}", err);
                    return;
                }
            };
        match bulk_push::bulk_push_client(&mut client, ctx, self).await {
            Ok(pushed) => {
                debug!("exiting bulk push client, {} blocks", pushed);
                ctx.connections.release(client, true);
            }
            Err(err) => {
                debug!("bulk push client failed: {:?}", err);
                ctx.connections.fail(client);
            }
        }
    }
}

/// Sample confirmation targets: random picks from the bottom half of the
/// principal representatives, topped up from the upper half until a quarter
/// of the total weight is covered.
fn select_confirmation_reps(
    reps: &[Representative],
    reps_weight: Amount,
) -> Vec<Representative> {
    const REPS_LIMIT: usize = 20;
    if reps.len() <= 2 {
        return reps.to_vec();
    }
    let half = reps.len() / 2;
    let mut bottom: Vec<Representative> = reps[half..].to_vec();
    util::shuffle(&mut bottom);
    bottom.truncate(REPS_LIMIT);

    let mut selected = bottom;
    let mut total: Amount = selected.iter().map(|rep| rep.weight).sum();
    let top = &reps[..half];
    let mut rng = rand::thread_rng();
    let mut spins = 0;
    while total < reps_weight / 4 && spins < top.len() * 4 {
        let pick = &top[rng.gen_range(0..top.len())];
        if !selected.iter().any(|rep| rep.account == pick.account) {
            total += pick.weight;
            selected.push(pick.clone());
        }
        spins += 1;
    }
    selected
}

/// Drive the whole legacy state machine to completion.
pub async fn run(attempt: Arc<LegacyAttempt>, ctx: BootstrapContext) {
    // FRONTIERS: retry the exchange until it succeeds or we are stopped.
    let mut frontier_failure = true;
    let mut frontier_attempts = 0u64;
    while !attempt.base.stopped() && frontier_failure {
        frontier_attempts += 1;
        frontier_failure = attempt.request_frontier(&ctx, frontier_attempts == 1).await;
        if frontier_failure {
            sleep(Duration::from_millis(100)).await;
        }
    }
    attempt.frontiers_received.store(true, Ordering::SeqCst);

    // The frontier peer being a known principal representative satisfies the
    // confirmation policy outright.
    if let Some(crawler) = &ctx.crawler {
        if let Ok(true) =
            crawler.send(crate::rep_crawler::IsPrincipal { channel: attempt.peer }).await
        {
            attempt.frontiers_confirmed.store(true, Ordering::SeqCst);
        }
    }

    // Queue the discovered pulls in random order.
    let mut pulls = attempt.take_frontier_pulls();
    util::shuffle(&mut pulls);
    attempt.account_count.store(pulls.len() as u64, Ordering::SeqCst);
    info!(
        "[{}] completed frontier request, {} out of sync accounts according to {:?}",
        "bootstrap".cyan(),
        pulls.len(),
        attempt.peer
    );
    for pull in pulls.into_iter() {
        attempt.base.pull_started();
        ctx.connections.pulls.push_back(pull);
    }

    // PULLING: wait for the queue to drain and in-flight pulls to land;
    // flushing the processor may surface more gaps, so re-check after.
    while !attempt.base.stopped() {
        if attempt.confirmation_pending() {
            attempt.attempt_restart_check(&ctx).await;
            continue;
        }
        if attempt.base.pulling() == 0 {
            debug!("flushing block processor");
            ctx.processor.flush().await;
            if attempt.base.pulling() == 0 {
                break;
            }
        } else {
            attempt.base.wait_condition(Duration::from_millis(250)).await;
            if attempt.base.should_log() {
                info!(
                    "[{}] attempt {} pulling={} total_blocks={}",
                    "bootstrap".cyan(),
                    attempt.base.id,
                    attempt.base.pulling(),
                    attempt.base.total_blocks.load(Ordering::SeqCst)
                );
            }
        }
    }

    // PUSHING: upload the unsynced records collected during the frontier
    // pass.
    if !attempt.base.stopped() {
        info!("[{}] completed legacy pulls", "bootstrap".cyan());
        if !ctx.config.disable_bulk_push_client {
            attempt.request_push(&ctx).await;
        }
    }

    ctx.processor.clear_unchecked();
    let total = attempt.base.total_blocks.load(Ordering::SeqCst);
    info!(
        "[{}] exiting legacy bootstrap attempt {} with {} total blocks",
        "bootstrap".cyan(),
        attempt.base.id,
        total
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::BootstrapMode;

    fn rep(seed: u8, weight: Amount) -> Representative {
        Representative::new(
            Account::from_bytes(crate::ledger::types::hash(&[seed])),
            weight,
            format!("127.0.0.1:{}", 9000 + seed as u16).parse().unwrap(),
        )
    }

    #[actix_rt::test]
    async fn test_select_confirmation_reps_covers_quarter_weight() {
        let reps: Vec<Representative> =
            (0..10u8).map(|i| rep(i, 1_000 - (i as Amount) * 50)).collect();
        let total: Amount = reps.iter().map(|r| r.weight).sum();
        let selected = select_confirmation_reps(&reps, total);
        let selected_weight: Amount = selected.iter().map(|r| r.weight).sum();
        assert!(selected_weight >= total / 4);
        // No duplicates.
        let accounts: std::collections::HashSet<Account> =
            selected.iter().map(|r| r.account).collect();
        assert_eq!(accounts.len(), selected.len());
    }

    #[actix_rt::test]
    async fn test_recent_pull_window_caps() {
        let attempt = LegacyAttempt::for_tests(
            Attempt::new(BootstrapMode::Legacy, 1, Some("recent".to_string())),
            "127.0.0.1:17075".parse().unwrap(),
        );
        let cap = BootstrapConfig::dev().bootstrap_max_confirm_frontiers;
        for i in 0..(cap + 5) {
            attempt.add_recent_pull(BlockHash::digest(&[i as u8]));
        }
        let recent = attempt.recent_pulls_head.lock().unwrap();
        assert_eq!(cap, recent.len());
    }

    #[actix_rt::test]
    async fn test_zero_head_frontier_rejected() {
        let attempt = LegacyAttempt::for_tests(
            Attempt::new(BootstrapMode::Legacy, 1, Some("frontier".to_string())),
            "127.0.0.1:17075".parse().unwrap(),
        );
        attempt.add_frontier(PullInfo::new(
            Account::zero(),
            BlockHash::zero(),
            BlockHash::zero(),
            0,
            4,
            1,
        ));
        assert!(attempt.take_frontier_pulls().is_empty());
    }
}
