//! Client and server halves of the frontier exchange.
//!
//! The server walks its account table in ascending order and streams
//! `(account, head)` pairs. The client walks its own table with a parallel
//! cursor and classifies each divergence: accounts the peer lacks become
//! bulk-push targets, chains where the peer is ahead (or forked) become pull
//! descriptors.

use super::connections::BootstrapClient;
use super::legacy::LegacyAttempt;
use super::pull::PullInfo;
use super::BootstrapContext;
use crate::ledger::{Account, BlockHash, Ledger};
use crate::wire::{FrontierPair, FrontierReq};
use crate::{Error, Result};

use tracing::debug;

use colored::Colorize;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Duration, Instant};

use std::collections::VecDeque;

/// Accounts fetched per read batch, bounding read-transaction duration.
const ACCOUNT_BATCH: usize = 128;

/// An ascending cursor over the local account table, reading in batches.
/// With an age filter only recently-modified accounts are yielded; the
/// all-zero pair marks exhaustion.
struct AccountCursor<'a> {
    ledger: &'a Ledger,
    age: Option<u32>,
    queue: VecDeque<(Account, BlockHash)>,
    next_start: Option<Account>,
    pub current: Account,
    pub frontier: BlockHash,
}

impl<'a> AccountCursor<'a> {
    fn new(ledger: &'a Ledger, start: Account, age: Option<u32>) -> AccountCursor<'a> {
        AccountCursor {
            ledger,
            age,
            queue: VecDeque::new(),
            next_start: Some(start),
            current: Account::zero(),
            frontier: BlockHash::zero(),
        }
    }

    /// Advance to the next (filtered) account, refilling the batch queue as
    /// needed.
    fn next(&mut self) -> Result<()> {
        if self.queue.is_empty() {
            self.fill()?;
        }
        match self.queue.pop_front() {
            Some((account, frontier)) => {
                self.current = account;
                self.frontier = frontier;
            }
            None => {
                self.current = Account::zero();
                self.frontier = BlockHash::zero();
            }
        }
        Ok(())
    }

    fn fill(&mut self) -> Result<()> {
        let now = crate::util::seconds_since_epoch();
        while self.queue.len() < ACCOUNT_BATCH {
            let start = match self.next_start {
                Some(start) => start,
                None => break,
            };
            let batch = self.ledger.accounts_range(start, ACCOUNT_BATCH)?;
            if batch.is_empty() {
                self.next_start = None;
                break;
            }
            self.next_start = batch[batch.len() - 1].0.successor();
            for (account, info) in batch.into_iter() {
                let include = match self.age {
                    Some(age) => age == u32::MAX || now.saturating_sub(info.modified) <= age as u64,
                    None => true,
                };
                if include {
                    self.queue.push_back((account, info.head));
                }
            }
        }
        if self.queue.len() < ACCOUNT_BATCH && self.next_start.is_none() {
            // Table exhausted: the empty record ends the walk.
            self.queue.push_back((Account::zero(), BlockHash::zero()));
        }
        Ok(())
    }
}

/// Run the client half over a leased connection, filling the attempt's
/// frontier pulls and bulk-push targets.
pub async fn request_frontiers(
    ctx: &BootstrapContext,
    attempt: &LegacyAttempt,
    client: &mut BootstrapClient,
) -> Result<()> {
    let io_timeout = ctx.config.tcp_io_timeout;
    let request =
        FrontierReq { start: Account::zero(), age: attempt.frontiers_age, count: u32::MAX };
    let mut buf = vec![];
    request.encode(&mut buf);
    timeout(io_timeout, client.stream.write_all(&buf)).await??;

    let mut cursor = AccountCursor::new(&ctx.ledger, Account::zero(), None);
    cursor.next()?;

    let mut count: u64 = 0;
    let mut bulk_push_cost: u64 = 0;
    let mut last_account: Option<Account> = None;
    let started = Instant::now();

    loop {
        if attempt.base.stopped() {
            return Err(Error::AttemptStopped);
        }
        let pair = timeout(io_timeout, FrontierPair::decode(&mut client.stream)).await??;
        count += 1;

        // Abort streams that crawl once past the warmup window.
        let elapsed = started.elapsed();
        if elapsed > ctx.config.warmup_time {
            let rate = count as f64 / elapsed.as_secs_f64();
            if rate < ctx.config.minimum_blocks_per_sec {
                debug!("aborting frontier req, stream too slow ({:.1}/s)", rate);
                return Err(Error::SlowStream);
            }
        }
        if attempt.base.should_log() {
            debug!(
                "[{}] received {} frontiers from {:?}",
                "bootstrap".cyan(),
                count,
                client.endpoint
            );
        }

        if pair.is_terminator() {
            // Drain the remainder of the local table: accounts the peer has
            // never heard of.
            while !cursor.current.is_zero() {
                unsynced(ctx, attempt, &mut bulk_push_cost, cursor.frontier, BlockHash::zero());
                cursor.next()?;
            }
            debug!("bulk push cost: {}", bulk_push_cost);
            return Ok(());
        }

        // The stream must ascend strictly and stay within the requested
        // count.
        if let Some(last) = last_account {
            if pair.account <= last {
                return Err(Error::MalformedFrame);
            }
        }
        last_account = Some(pair.account);
        if count > request.count as u64 {
            return Err(Error::MalformedFrame);
        }

        while !cursor.current.is_zero() && cursor.current < pair.account {
            // We know about an account they don't.
            unsynced(ctx, attempt, &mut bulk_push_cost, cursor.frontier, BlockHash::zero());
            cursor.next()?;
        }
        if !cursor.current.is_zero() {
            if pair.account == cursor.current {
                if pair.frontier == cursor.frontier {
                    // In sync.
                } else if ctx.ledger.block_or_pruned_exists(&pair.frontier)? {
                    // We know about a block they don't.
                    unsynced(ctx, attempt, &mut bulk_push_cost, cursor.frontier, pair.frontier);
                } else {
                    // Either we're behind or there's a fork we differ on.
                    // Either way bulk pushing will probably not be effective.
                    attempt.add_frontier(PullInfo::new(
                        pair.account,
                        pair.frontier,
                        cursor.frontier,
                        0,
                        ctx.config.frontier_retry_limit,
                        attempt.base.incremental_id,
                    ));
                    bulk_push_cost += 5;
                }
                cursor.next()?;
            } else {
                // The peer has an account we lack.
                attempt.add_frontier(PullInfo::new(
                    pair.account,
                    pair.frontier,
                    BlockHash::zero(),
                    0,
                    ctx.config.frontier_retry_limit,
                    attempt.base.incremental_id,
                ));
            }
        } else {
            attempt.add_frontier(PullInfo::new(
                pair.account,
                pair.frontier,
                BlockHash::zero(),
                0,
                ctx.config.frontier_retry_limit,
                attempt.base.incremental_id,
            ));
        }
    }
}

/// Record a divergence for the later bulk push, within the cost budget. An
/// aged (partial) frontier walk never accumulates push targets.
fn unsynced(
    ctx: &BootstrapContext,
    attempt: &LegacyAttempt,
    cost: &mut u64,
    head: BlockHash,
    end: BlockHash,
) {
    if *cost < ctx.config.bulk_push_cost_limit && attempt.frontiers_age == u32::MAX {
        attempt.add_bulk_push_target(head, end);
        *cost += if end.is_zero() { 2 } else { 1 };
    }
}

/// Serve one frontier request: ascending pairs, age-filtered, capped by the
/// requested count, closed by the all-zero pair.
pub async fn serve_frontiers<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    ledger: &Ledger,
    request: FrontierReq,
    io_timeout: Duration,
) -> Result<()> {
    let mut cursor = AccountCursor::new(ledger, request.start, Some(request.age));
    cursor.next()?;
    let mut count: u32 = 0;
    while !cursor.current.is_zero() && count < request.count {
        let pair = FrontierPair { account: cursor.current, frontier: cursor.frontier };
        let mut buf = Vec::with_capacity(FrontierPair::SIZE);
        pair.encode(&mut buf);
        timeout(io_timeout, stream.write_all(&buf)).await??;
        count += 1;
        cursor.next()?;
    }
    let mut buf = Vec::with_capacity(FrontierPair::SIZE);
    FrontierPair::terminator().encode(&mut buf);
    timeout(io_timeout, stream.write_all(&buf)).await??;
    timeout(io_timeout, stream.flush()).await??;
    debug!("frontier sending finished ({} pairs)", count);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::types::hash;

    fn seeded_ledger(n: u8) -> (Ledger, Vec<Account>) {
        let ledger = Ledger::temporary().unwrap();
        let mut accounts = vec![];
        for i in 0..n {
            let account = Account::from_bytes(hash(&[i]));
            ledger.initialize(account, 10).unwrap();
            accounts.push(account);
        }
        accounts.sort();
        (ledger, accounts)
    }

    #[actix_rt::test]
    async fn test_serve_all_frontiers_ascending() {
        let (ledger, accounts) = seeded_ledger(5);
        let (mut client_io, mut server_io) = tokio::io::duplex(4096);

        let request = FrontierReq { start: Account::zero(), age: u32::MAX, count: u32::MAX };
        serve_frontiers(&mut server_io, &ledger, request, Duration::from_secs(1))
            .await
            .unwrap();
        drop(server_io);

        let mut received = vec![];
        loop {
            let pair = FrontierPair::decode(&mut client_io).await.unwrap();
            if pair.is_terminator() {
                break;
            }
            received.push(pair.account);
        }
        // All accounts, smallest first, terminator last.
        assert_eq!(accounts, received);
    }

    #[actix_rt::test]
    async fn test_serve_respects_count_and_start() {
        let (ledger, accounts) = seeded_ledger(5);
        let (mut client_io, mut server_io) = tokio::io::duplex(4096);

        let request = FrontierReq { start: accounts[2], age: u32::MAX, count: 2 };
        serve_frontiers(&mut server_io, &ledger, request, Duration::from_secs(1))
            .await
            .unwrap();
        drop(server_io);

        let mut received = vec![];
        loop {
            let pair = FrontierPair::decode(&mut client_io).await.unwrap();
            if pair.is_terminator() {
                break;
            }
            received.push(pair.account);
        }
        assert_eq!(accounts[2..4].to_vec(), received);
    }

    #[actix_rt::test]
    async fn test_age_filter_excludes_stale() {
        let (ledger, _) = seeded_ledger(3);
        let (mut client_io, mut server_io) = tokio::io::duplex(4096);

        // A small age still admits the freshly initialized accounts.
        let request = FrontierReq { start: Account::zero(), age: 5, count: u32::MAX };
        serve_frontiers(&mut server_io, &ledger, request, Duration::from_secs(1))
            .await
            .unwrap();
        drop(server_io);

        let mut received = 0;
        loop {
            let pair = FrontierPair::decode(&mut client_io).await.unwrap();
            if pair.is_terminator() {
                break;
            }
            received += 1;
        }
        assert_eq!(3, received);
    }
}
