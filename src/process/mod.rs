//! Asynchronous block validation and commit.
//!
//! Bootstrap exchanges hand every received block to the [BlockProcessor]
//! without assuming validity; the processor applies them to the ledger on a
//! worker task. Bulk pulls deliver chains newest-first, so most blocks arrive
//! before their dependencies: blocks that hit a gap park in an unchecked
//! table keyed by the missing hash and replay once it lands.
//!
//! The input queue is bounded; `add` suspends when it is at capacity, which
//! backpressures the pull pipelines.

use crate::ledger::{Account, Block, BlockHash, Ledger, ProcessResult};

use tracing::{debug, warn};

use tokio::sync::{mpsc, Notify};
use tokio::time::{timeout, Duration};

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Queue capacity before `add` suspends.
const MAX_QUEUE: usize = 8192;
/// Cap on blocks parked waiting for a dependency.
const MAX_UNCHECKED: usize = 65536;

/// A block awaiting validation, with the account the puller believes it
/// belongs to.
#[derive(Debug, Clone)]
pub struct UncheckedBlock {
    pub block: Block,
    pub account: Account,
}

#[derive(Clone)]
pub struct BlockProcessor {
    sender: mpsc::Sender<UncheckedBlock>,
    state: Arc<ProcessorState>,
}

struct ProcessorState {
    ledger: Arc<Ledger>,
    in_flight: AtomicUsize,
    idle: Notify,
    unchecked: Mutex<HashMap<BlockHash, Vec<UncheckedBlock>>>,
    unchecked_len: AtomicUsize,
}

impl BlockProcessor {
    /// Create the processor and spawn its worker task.
    pub fn new(ledger: Arc<Ledger>) -> BlockProcessor {
        let (sender, receiver) = mpsc::channel(MAX_QUEUE);
        let state = Arc::new(ProcessorState {
            ledger,
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            unchecked: Mutex::new(HashMap::new()),
            unchecked_len: AtomicUsize::new(0),
        });
        let worker_state = state.clone();
        tokio::spawn(async move { run(receiver, worker_state).await });
        BlockProcessor { sender, state }
    }

    /// Enqueue a block. Suspends while the input queue is at capacity.
    pub async fn add(&self, block: Block, account: Account) {
        self.state.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.sender.send(UncheckedBlock { block, account }).await.is_err() {
            self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
            warn!("block processor queue closed");
        }
    }

    /// Wait until every enqueued block has been applied or parked.
    pub async fn flush(&self) {
        loop {
            if self.state.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            let _ = timeout(Duration::from_millis(100), self.state.idle.notified()).await;
        }
    }

    /// Drop all parked blocks. Called when an attempt finishes so stale
    /// dependencies do not accumulate across attempts.
    pub fn clear_unchecked(&self) {
        let mut unchecked = self.state.unchecked.lock().unwrap();
        unchecked.clear();
        self.state.unchecked_len.store(0, Ordering::SeqCst);
    }

    pub fn unchecked_len(&self) -> usize {
        self.state.unchecked_len.load(Ordering::SeqCst)
    }
}

async fn run(mut receiver: mpsc::Receiver<UncheckedBlock>, state: Arc<ProcessorState>) {
    while let Some(item) = receiver.recv().await {
        process_one(&state, item);
        if state.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            state.idle.notify_waiters();
        }
    }
}

/// Apply one block and cascade through any parked dependents it unblocks.
fn process_one(state: &ProcessorState, item: UncheckedBlock) {
    let mut work = VecDeque::new();
    work.push_back(item);
    while let Some(next) = work.pop_front() {
        let hash = next.block.hash();
        let result = match state.ledger.process(&next.block) {
            Ok(result) => result,
            Err(err) => {
                warn!("ledger error while processing {:?}: {:?}", hash, err);
                continue;
            }
        };
        match result {
            ProcessResult::Progress | ProcessResult::Old => {
                for dependent in take_dependents(state, &hash) {
                    work.push_back(dependent);
                }
            }
            ProcessResult::GapPrevious => {
                let previous = next.block.previous();
                park(state, previous, next);
            }
            ProcessResult::GapSource => {
                let source = source_dependency(&next.block);
                park(state, source, next);
            }
            ProcessResult::Fork
            | ProcessResult::BalanceMismatch
            | ProcessResult::Unreceivable => {
                debug!("rejected block {:?}: {:?}", hash, result);
            }
        }
    }
}

/// The hash a gapped receive is waiting on.
fn source_dependency(block: &Block) -> BlockHash {
    match block.source() {
        Some(source) => source,
        None => block.link().as_hash(),
    }
}

fn park(state: &ProcessorState, dependency: BlockHash, item: UncheckedBlock) {
    if state.unchecked_len.load(Ordering::SeqCst) >= MAX_UNCHECKED {
        warn!("unchecked table full, dropping block {:?}", item.block.hash());
        return;
    }
    let mut unchecked = state.unchecked.lock().unwrap();
    unchecked.entry(dependency).or_insert_with(Vec::new).push(item);
    state.unchecked_len.fetch_add(1, Ordering::SeqCst);
}

fn take_dependents(state: &ProcessorState, hash: &BlockHash) -> Vec<UncheckedBlock> {
    let mut unchecked = state.unchecked.lock().unwrap();
    match unchecked.remove(hash) {
        Some(dependents) => {
            state.unchecked_len.fetch_sub(dependents.len(), Ordering::SeqCst);
            dependents
        }
        None => vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::types::hash;
    use crate::ledger::Account;

    fn chain(ledger: &Ledger) -> (Account, Vec<Block>) {
        let genesis_account = Account::from_bytes(hash(b"genesis"));
        let genesis_hash = ledger.initialize(genesis_account, 1_000).unwrap();
        let other = Account::from_bytes(hash(b"other"));
        let send = Block::Send { previous: genesis_hash, destination: other, balance: 400 };
        let open = Block::Open { source: send.hash(), representative: other, account: other };
        (other, vec![send, open])
    }

    #[actix_rt::test]
    async fn test_out_of_order_blocks_converge() {
        let source = Ledger::temporary().unwrap();
        let (other, blocks) = chain(&source);

        let target = Arc::new(Ledger::temporary().unwrap());
        let genesis_account = Account::from_bytes(hash(b"genesis"));
        target.initialize(genesis_account, 1_000).unwrap();

        let processor = BlockProcessor::new(target.clone());
        // Deliver newest-first, as a bulk pull would.
        for block in blocks.iter().rev() {
            processor.add(block.clone(), other).await;
        }
        processor.flush().await;
        // Parked dependents replayed once the send arrived.
        assert_eq!(400, target.account_info(&other).unwrap().unwrap().balance);
        assert_eq!(600, target.account_info(&genesis_account).unwrap().unwrap().balance);
        assert_eq!(0, processor.unchecked_len());
    }

    #[actix_rt::test]
    async fn test_unresolvable_block_stays_parked() {
        let ledger = Arc::new(Ledger::temporary().unwrap());
        let genesis_account = Account::from_bytes(hash(b"genesis"));
        ledger.initialize(genesis_account, 1_000).unwrap();

        let processor = BlockProcessor::new(ledger.clone());
        let orphan = Block::Send {
            previous: BlockHash::digest(b"never arrives"),
            destination: genesis_account,
            balance: 0,
        };
        processor.add(orphan, Account::zero()).await;
        processor.flush().await;
        assert_eq!(1, processor.unchecked_len());
        processor.clear_unchecked();
        assert_eq!(0, processor.unchecked_len());
    }
}
