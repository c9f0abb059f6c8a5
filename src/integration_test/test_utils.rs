use crate::ledger::{Account, Amount, Block, BlockHash, Ledger};
use crate::node::{Node, NodeOptions};
use crate::util::keypair_from_seed;
use crate::wire::{self, BulkPull};

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{sleep, Duration, Instant};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

/// Each test node takes a realtime port and the bootstrap port above it.
static NEXT_PORT: AtomicU16 = AtomicU16::new(23200);

pub fn next_endpoint() -> SocketAddr {
    let port = NEXT_PORT.fetch_add(4, Ordering::SeqCst);
    format!("127.0.0.1:{}", port).parse().unwrap()
}

/// The account every test network's supply starts in.
pub fn genesis_account() -> Account {
    Account::from_bytes(keypair_from_seed(b"test genesis").public.to_bytes())
}

pub const GENESIS_AMOUNT: Amount = 1_000;

/// Start a node on a fresh port pair with a temporary, genesis-initialized
/// ledger.
pub async fn start_node(peers: Vec<SocketAddr>, voting_seed: Option<&str>) -> Node {
    let ip = next_endpoint();
    let ledger = Arc::new(Ledger::temporary().unwrap());
    ledger.initialize(genesis_account(), GENESIS_AMOUNT).unwrap();
    let node = Node::start(NodeOptions {
        listener_ip: ip,
        peers,
        voting_seed: voting_seed.map(|s| s.to_string()),
        dev_network: true,
        ledger,
    })
    .await
    .unwrap();
    // Give the spawned listeners a beat to bind.
    sleep(Duration::from_millis(200)).await;
    node
}

/// Poll a condition until it holds or the timeout passes.
pub async fn wait_until<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(50)).await;
    }
}

/// Issue one raw bulk-pull against a node's bootstrap listener and collect
/// the streamed blocks.
pub async fn raw_bulk_pull(bootstrap_endpoint: SocketAddr, request: BulkPull) -> Vec<Block> {
    let mut stream = TcpStream::connect(bootstrap_endpoint).await.unwrap();
    let mut buf = vec![];
    request.encode(&mut buf);
    stream.write_all(&buf).await.unwrap();
    let mut blocks = vec![];
    while let Some(block) = wire::read_block(&mut stream).await.unwrap() {
        blocks.push(block);
    }
    blocks
}

/// Extend the genesis chain with a self-send and its receive, the smallest
/// ledger change that moves the frontier.
pub fn self_send_cycle(ledger: &Ledger, amount: Amount) -> (Block, Block) {
    let genesis = genesis_account();
    let info = ledger.account_info(&genesis).unwrap().unwrap();
    let send = Block::Send {
        previous: info.head,
        destination: genesis,
        balance: info.balance - amount,
    };
    ledger.process(&send).unwrap();
    let receive = Block::Receive { previous: send.hash(), source: send.hash() };
    ledger.process(&receive).unwrap();
    (send, receive)
}

/// A four-block chain across two accounts:
/// genesis send -> open -> send back -> genesis receive.
pub struct CrossChain {
    pub other: Account,
    pub send_1: Block,
    pub open_1: Block,
    pub send_2: Block,
    pub receive_2: Block,
}

pub fn build_cross_chain(ledger: &Ledger, sent: Amount, returned: Amount) -> CrossChain {
    let genesis = genesis_account();
    let other = Account::from_bytes(keypair_from_seed(b"cross chain account").public.to_bytes());
    let info = ledger.account_info(&genesis).unwrap().unwrap();

    let send_1 =
        Block::Send { previous: info.head, destination: other, balance: info.balance - sent };
    ledger.process(&send_1).unwrap();
    let open_1 = Block::Open { source: send_1.hash(), representative: other, account: other };
    ledger.process(&open_1).unwrap();
    let send_2 =
        Block::Send { previous: open_1.hash(), destination: genesis, balance: sent - returned };
    ledger.process(&send_2).unwrap();
    let receive_2 = Block::Receive { previous: send_1.hash(), source: send_2.hash() };
    ledger.process(&receive_2).unwrap();
    CrossChain { other, send_1, open_1, send_2, receive_2 }
}

pub fn zero_end() -> BlockHash {
    BlockHash::zero()
}
