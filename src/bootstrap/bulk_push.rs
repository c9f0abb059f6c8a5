//! Client and server halves of the bulk-push exchange: the reverse upload of
//! locally-known blocks the peer lacks, derived from the frontier exchange's
//! unsynced records.

use super::connections::BootstrapClient;
use super::legacy::LegacyAttempt;
use super::BootstrapContext;
use crate::ledger::Ledger;
use crate::process::BlockProcessor;
use crate::wire::{self, BootstrapRequest};
use crate::{Error, Result};

use tracing::debug;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Duration};

/// Upper bound on blocks accepted in one push; a peer exceeding it is
/// misbehaving.
const MAX_PUSH_BLOCKS: u64 = 256 * 1024;

/// Push every accumulated target chain to the peer. Returns the number of
/// blocks sent.
pub async fn bulk_push_client(
    client: &mut BootstrapClient,
    ctx: &BootstrapContext,
    attempt: &LegacyAttempt,
) -> Result<u64> {
    let io_timeout = ctx.config.tcp_io_timeout;
    let mut buf = vec![];
    BootstrapRequest::BulkPush.encode(&mut buf);
    timeout(io_timeout, client.stream.write_all(&buf)).await??;
    let pushed = push_targets(&mut client.stream, &ctx.ledger, attempt, io_timeout).await?;
    debug!("bulk push finished, {} blocks sent", pushed);
    Ok(pushed)
}

async fn push_targets<S: AsyncWrite + Unpin>(
    stream: &mut S,
    ledger: &Ledger,
    attempt: &LegacyAttempt,
    io_timeout: Duration,
) -> Result<u64> {
    let mut pushed: u64 = 0;
    while let Some((head, end)) = attempt.request_bulk_push_target() {
        if attempt.base.stopped() {
            return Err(Error::AttemptStopped);
        }
        // Walk the chain newest-first; the receiver's processor reorders.
        let mut current = head;
        while !current.is_zero() && current != end {
            let entry = match ledger.get_block(&current)? {
                Some(entry) => entry,
                // Pruned mid-chain: push what exists.
                None => break,
            };
            let mut buf = vec![];
            wire::encode_block(&entry.block, &mut buf);
            timeout(io_timeout, stream.write_all(&buf)).await??;
            pushed += 1;
            current = entry.block.previous();
        }
    }
    let mut buf = vec![];
    wire::encode_block_terminator(&mut buf);
    timeout(io_timeout, stream.write_all(&buf)).await??;
    timeout(io_timeout, stream.flush()).await??;
    Ok(pushed)
}

/// Receive a pushed block stream and feed it to the block processor.
pub async fn serve_bulk_push<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    processor: &BlockProcessor,
    io_timeout: Duration,
) -> Result<u64> {
    let mut received: u64 = 0;
    loop {
        let block = match timeout(io_timeout, wire::read_block(stream)).await?? {
            Some(block) => block,
            None => break,
        };
        received += 1;
        if received > MAX_PUSH_BLOCKS {
            return Err(Error::MalformedFrame);
        }
        let account = block.account();
        processor.add(block, account).await;
    }
    debug!("bulk push received {} blocks", received);
    Ok(received)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::{Attempt, BootstrapMode};
    use crate::ledger::types::hash;
    use crate::ledger::{Account, Block, BlockHash};

    #[actix_rt::test]
    async fn test_push_walks_target_chain() {
        let ledger = Ledger::temporary().unwrap();
        let genesis_account = Account::from_bytes(hash(b"genesis"));
        let genesis_hash = ledger.initialize(genesis_account, 1_000).unwrap();
        let other = Account::from_bytes(hash(b"other"));
        let send = Block::Send { previous: genesis_hash, destination: other, balance: 900 };
        ledger.process(&send).unwrap();

        let attempt = LegacyAttempt::for_tests(
            Attempt::new(BootstrapMode::Legacy, 1, Some("push-test".to_string())),
            "127.0.0.1:17075".parse().unwrap(),
        );
        attempt.add_bulk_push_target(send.hash(), BlockHash::zero());

        let (mut client_io, mut server_io) = tokio::io::duplex(8192);
        let pushed =
            push_targets(&mut server_io, &ledger, &attempt, Duration::from_secs(1)).await.unwrap();
        drop(server_io);
        assert_eq!(2, pushed);

        let mut received = vec![];
        while let Some(block) = wire::read_block(&mut client_io).await.unwrap() {
            received.push(block.hash());
        }
        assert_eq!(vec![send.hash(), genesis_hash], received);
    }
}
