//! Client and server halves of the bulk-pull exchanges.
//!
//! `bulk_pull` streams one chain newest-first from a start (block hash or
//! account) down to a stop hash, the open block, or a count cap.
//! `bulk_pull_account` streams one account's pending receivables above a
//! minimum amount.

use super::attempt::AttemptKind;
use super::connections::BootstrapClient;
use super::pull::PullInfo;
use super::BootstrapContext;
use crate::ledger::{Account, Amount, BlockHash, HashOrAccount, Ledger};
use crate::wire::{
    self, BulkPull, BulkPullAccount, BulkPullAccountFlags, PendingEntry,
};
use crate::{Error, Result};

use tracing::debug;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Duration, Instant};

use std::collections::HashSet;

/// Run one pull over a leased connection. Returns whether the pull closed
/// its gap; a clean stream that stops short reports `false` so the caller
/// can requeue.
pub async fn bulk_pull_client(
    client: &mut BootstrapClient,
    ctx: &BootstrapContext,
    attempt: &AttemptKind,
    pull: &mut PullInfo,
) -> Result<bool> {
    let io_timeout = ctx.config.tcp_io_timeout;
    let start: HashOrAccount =
        if pull.head.is_zero() { pull.account.into() } else { pull.head.into() };
    let request = BulkPull {
        start,
        end: pull.end,
        count_present: pull.count > 0,
        count: pull.count,
    };
    let mut buf = vec![];
    request.encode(&mut buf);
    timeout(io_timeout, client.stream.write_all(&buf)).await??;

    let mut expected = pull.head;
    let mut received: u64 = 0;
    // Set when the attempt has already walked this ground; the rest of the
    // stream is drained so the connection stays reusable.
    let mut draining = false;
    let started = Instant::now();

    loop {
        if attempt.base().stopped() {
            return Err(Error::AttemptStopped);
        }
        let block = match timeout(io_timeout, wire::read_block(&mut client.stream)).await?? {
            Some(block) => block,
            None => break,
        };
        let hash = block.hash();
        if !pull.head.is_zero() {
            // The stream must walk the requested chain, newest first.
            if hash != expected {
                return Err(Error::MalformedFrame);
            }
            expected = block.previous();
        }
        received += 1;

        let elapsed = started.elapsed();
        if elapsed > ctx.config.warmup_time {
            let rate = received as f64 / elapsed.as_secs_f64();
            if rate < ctx.config.minimum_blocks_per_sec {
                debug!("aborting bulk pull, stream too slow ({:.1}/s)", rate);
                return Err(Error::SlowStream);
            }
        }
        if draining {
            continue;
        }

        pull.processed += 1;
        attempt.base().total_blocks.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if attempt.process_block(ctx, block, pull.account).await {
            draining = true;
        }
    }

    let complete = draining
        || pull.head.is_zero()
        || expected.is_zero()
        || expected == pull.end
        || (pull.head == pull.end && received > 0)
        || (pull.count > 0 && received >= pull.count as u64);
    Ok(complete)
}

/// Serve one bulk-pull request over the given stream.
pub async fn serve_bulk_pull<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    ledger: &Ledger,
    request: BulkPull,
    io_timeout: Duration,
) -> Result<()> {
    // `start == end` asks for exactly that block.
    if !request.end.is_zero() && request.start.as_hash() == request.end {
        if let Some(entry) = ledger.get_block(&request.end)? {
            send_block(stream, &entry.block, io_timeout).await?;
        }
        return send_terminator(stream, io_timeout).await;
    }

    // Resolve the start: a known block hash wins, otherwise it names an
    // account whose head we serve from.
    let (mut current, account) = match ledger.get_block(&request.start.as_hash())? {
        Some(entry) => (request.start.as_hash(), entry.sideband.account),
        None => {
            let account = request.start.as_account();
            match ledger.account_info(&account)? {
                Some(info) => (info.head, account),
                None => (BlockHash::zero(), account),
            }
        }
    };

    // An end that is not on this account's chain behaves like zero.
    let mut end = request.end;
    if !end.is_zero() {
        match ledger.block_account(&end)? {
            Some(end_account) if end_account == account => (),
            _ => end = BlockHash::zero(),
        }
    }

    let cap = request.cap();
    let mut sent: u32 = 0;
    while !current.is_zero() && current != end {
        let entry = match ledger.get_block(&current)? {
            Some(entry) => entry,
            // Pruned or diverged view: terminate cleanly.
            None => break,
        };
        send_block(stream, &entry.block, io_timeout).await?;
        sent += 1;
        if let Some(cap) = cap {
            if sent >= cap {
                break;
            }
        }
        current = entry.block.previous();
    }
    send_terminator(stream, io_timeout).await
}

async fn send_block<S: AsyncWrite + Unpin>(
    stream: &mut S,
    block: &crate::ledger::Block,
    io_timeout: Duration,
) -> Result<()> {
    let mut buf = vec![];
    wire::encode_block(block, &mut buf);
    timeout(io_timeout, stream.write_all(&buf)).await??;
    Ok(())
}

async fn send_terminator<S: AsyncWrite + Unpin>(stream: &mut S, io_timeout: Duration) -> Result<()> {
    let mut buf = vec![];
    wire::encode_block_terminator(&mut buf);
    timeout(io_timeout, stream.write_all(&buf)).await??;
    timeout(io_timeout, stream.flush()).await??;
    Ok(())
}

/// Fetch one account's receivables (hash + amount + source mode).
pub async fn bulk_pull_account_client(
    client: &mut BootstrapClient,
    ctx: &BootstrapContext,
    account: Account,
    minimum_amount: Amount,
) -> Result<Vec<PendingEntry>> {
    let io_timeout = ctx.config.tcp_io_timeout;
    let request = BulkPullAccount {
        account,
        minimum_amount,
        flags: BulkPullAccountFlags::PendingHashAndAmount,
    };
    let mut buf = vec![];
    request.encode(&mut buf);
    timeout(io_timeout, client.stream.write_all(&buf)).await??;

    let mut entries = vec![];
    loop {
        let entry = timeout(io_timeout, PendingEntry::decode(&mut client.stream)).await??;
        if entry.is_terminator() {
            break;
        }
        entries.push(entry);
    }
    Ok(entries)
}

/// Serve one bulk-pull-account request: the pending index in ascending key
/// order, closed by an all-zero record.
pub async fn serve_bulk_pull_account<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    ledger: &Ledger,
    request: BulkPullAccount,
    io_timeout: Duration,
) -> Result<()> {
    let pending = ledger.pending_range(&request.account, request.minimum_amount)?;
    match request.flags {
        BulkPullAccountFlags::PendingHashAndAmount => {
            for (hash, info) in pending.into_iter() {
                let entry = PendingEntry { hash, amount: info.amount, source: info.source };
                let mut buf = vec![];
                entry.encode(&mut buf);
                timeout(io_timeout, stream.write_all(&buf)).await??;
            }
            let mut buf = vec![];
            PendingEntry::terminator().encode(&mut buf);
            timeout(io_timeout, stream.write_all(&buf)).await??;
        }
        BulkPullAccountFlags::PendingAddressOnly => {
            let mut seen: HashSet<Account> = HashSet::new();
            for (_hash, info) in pending.into_iter() {
                if seen.insert(info.source) {
                    timeout(io_timeout, stream.write_all(info.source.as_bytes())).await??;
                }
            }
            timeout(io_timeout, stream.write_all(Account::zero().as_bytes())).await??;
        }
    }
    timeout(io_timeout, stream.flush()).await??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::types::hash;
    use crate::ledger::Block;
    use crate::wire::read_block;

    fn timeout_1s() -> Duration {
        Duration::from_secs(1)
    }

    /// Genesis plus a two-block extension on the genesis account.
    fn chain_ledger() -> (Ledger, Account, Vec<BlockHash>) {
        let ledger = Ledger::temporary().unwrap();
        let genesis_account = Account::from_bytes(hash(b"genesis"));
        let genesis_hash = ledger.initialize(genesis_account, 1_000).unwrap();
        let other = Account::from_bytes(hash(b"other"));
        let send_1 = Block::Send { previous: genesis_hash, destination: other, balance: 900 };
        ledger.process(&send_1).unwrap();
        let send_2 = Block::Send { previous: send_1.hash(), destination: other, balance: 800 };
        ledger.process(&send_2).unwrap();
        (ledger, genesis_account, vec![genesis_hash, send_1.hash(), send_2.hash()])
    }

    async fn collect_blocks<S: AsyncRead + Unpin>(stream: &mut S) -> Vec<Block> {
        let mut blocks = vec![];
        while let Some(block) = read_block(stream).await.unwrap() {
            blocks.push(block);
        }
        blocks
    }

    #[actix_rt::test]
    async fn test_single_block_when_start_equals_end() {
        let (ledger, _account, hashes) = chain_ledger();
        let (mut client_io, mut server_io) = tokio::io::duplex(8192);
        let request = BulkPull {
            start: HashOrAccount::from(hashes[0]),
            end: hashes[0],
            count_present: false,
            count: 0,
        };
        serve_bulk_pull(&mut server_io, &ledger, request, timeout_1s()).await.unwrap();
        drop(server_io);

        let blocks = collect_blocks(&mut client_io).await;
        assert_eq!(1, blocks.len());
        assert_eq!(hashes[0], blocks[0].hash());
    }

    #[actix_rt::test]
    async fn test_empty_account_emits_nothing() {
        let (ledger, _account, _hashes) = chain_ledger();
        let (mut client_io, mut server_io) = tokio::io::duplex(8192);
        let request = BulkPull {
            start: HashOrAccount::from(Account::from_bytes(hash(b"nobody"))),
            end: BlockHash::zero(),
            count_present: false,
            count: 0,
        };
        serve_bulk_pull(&mut server_io, &ledger, request, timeout_1s()).await.unwrap();
        drop(server_io);

        assert!(collect_blocks(&mut client_io).await.is_empty());
    }

    #[actix_rt::test]
    async fn test_full_chain_newest_first() {
        let (ledger, account, hashes) = chain_ledger();
        let (mut client_io, mut server_io) = tokio::io::duplex(8192);
        let request = BulkPull {
            start: HashOrAccount::from(account),
            end: BlockHash::zero(),
            count_present: false,
            count: 0,
        };
        serve_bulk_pull(&mut server_io, &ledger, request, timeout_1s()).await.unwrap();
        drop(server_io);

        let blocks = collect_blocks(&mut client_io).await;
        let received: Vec<BlockHash> = blocks.iter().map(|b| b.hash()).collect();
        assert_eq!(vec![hashes[2], hashes[1], hashes[0]], received);
    }

    #[actix_rt::test]
    async fn test_count_cap() {
        let (ledger, account, hashes) = chain_ledger();
        let (mut client_io, mut server_io) = tokio::io::duplex(8192);
        let request = BulkPull {
            start: HashOrAccount::from(account),
            end: BlockHash::zero(),
            count_present: true,
            count: 2,
        };
        serve_bulk_pull(&mut server_io, &ledger, request, timeout_1s()).await.unwrap();
        drop(server_io);

        let blocks = collect_blocks(&mut client_io).await;
        let received: Vec<BlockHash> = blocks.iter().map(|b| b.hash()).collect();
        assert_eq!(vec![hashes[2], hashes[1]], received);
    }

    #[actix_rt::test]
    async fn test_end_off_chain_behaves_like_zero() {
        let (ledger, account, hashes) = chain_ledger();
        // A block on a different account's chain.
        let other = Account::from_bytes(hash(b"other"));
        let open = Block::Open { source: hashes[1], representative: other, account: other };
        ledger.process(&open).unwrap();

        let (mut client_io, mut server_io) = tokio::io::duplex(8192);
        let request = BulkPull {
            start: HashOrAccount::from(account),
            end: open.hash(),
            count_present: false,
            count: 0,
        };
        serve_bulk_pull(&mut server_io, &ledger, request, timeout_1s()).await.unwrap();
        drop(server_io);

        // The whole chain comes back, not a truncation at the foreign end.
        assert_eq!(3, collect_blocks(&mut client_io).await.len());
    }

    #[actix_rt::test]
    async fn test_pending_stream_and_address_mode() {
        let ledger = Ledger::temporary().unwrap();
        let genesis_account = Account::from_bytes(hash(b"genesis"));
        let genesis_hash = ledger.initialize(genesis_account, 1_000).unwrap();
        let other = Account::from_bytes(hash(b"other"));
        let send_1 = Block::Send { previous: genesis_hash, destination: other, balance: 900 };
        ledger.process(&send_1).unwrap();
        let send_2 = Block::Send { previous: send_1.hash(), destination: other, balance: 600 };
        ledger.process(&send_2).unwrap();

        // Triples mode, filtered by minimum amount.
        let (mut client_io, mut server_io) = tokio::io::duplex(8192);
        let request = BulkPullAccount {
            account: other,
            minimum_amount: 200,
            flags: BulkPullAccountFlags::PendingHashAndAmount,
        };
        serve_bulk_pull_account(&mut server_io, &ledger, request, timeout_1s()).await.unwrap();
        drop(server_io);
        let mut entries = vec![];
        loop {
            let entry = PendingEntry::decode(&mut client_io).await.unwrap();
            if entry.is_terminator() {
                break;
            }
            entries.push(entry);
        }
        assert_eq!(1, entries.len());
        assert_eq!(send_2.hash(), entries[0].hash);
        assert_eq!(300, entries[0].amount);
        assert_eq!(genesis_account, entries[0].source);

        // Address-only mode deduplicates sources.
        let (mut client_io, mut server_io) = tokio::io::duplex(8192);
        let request = BulkPullAccount {
            account: other,
            minimum_amount: 0,
            flags: BulkPullAccountFlags::PendingAddressOnly,
        };
        serve_bulk_pull_account(&mut server_io, &ledger, request, timeout_1s()).await.unwrap();
        drop(server_io);
        let mut sources = vec![];
        loop {
            let mut bytes = [0u8; 32];
            tokio::io::AsyncReadExt::read_exact(&mut client_io, &mut bytes).await.unwrap();
            let source = Account::from_bytes(bytes);
            if source.is_zero() {
                break;
            }
            sources.push(source);
        }
        assert_eq!(vec![genesis_account], sources);
    }
}
