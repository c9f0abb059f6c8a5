//! Component assembly: wires the ledger, block processor, peer view,
//! representative crawler, both listeners and the bootstrap initiator into a
//! running node.

use crate::bootstrap::listener::BootstrapListener;
use crate::bootstrap::{BootstrapConfig, BootstrapInitiator, Counters};
use crate::ledger::{Account, Amount, Ledger};
use crate::process::BlockProcessor;
use crate::rep_crawler::{self, CrawlerConfig, RepCrawler};
use crate::server::{self, Router};
use crate::util;
use crate::view::View;
use crate::Result;

use tracing::error;

use actix::{Actor, Addr};
use ed25519_dalek::Keypair;

use std::net::SocketAddr;
use std::sync::Arc;

/// Supply of the development network's genesis account.
pub const DEV_GENESIS_AMOUNT: Amount = 1_000_000_000_000_000_000_000;

/// The development network's genesis account, derived from a fixed seed.
pub fn dev_genesis_account() -> Account {
    Account::from_bytes(util::keypair_from_seed(b"tundra dev genesis").public.to_bytes())
}

pub struct NodeOptions {
    /// Realtime listener address; the bootstrap listener binds one port
    /// above it.
    pub listener_ip: SocketAddr,
    /// Realtime endpoints of initial peers.
    pub peers: Vec<SocketAddr>,
    /// Seed phrase for the node's voting key, when it represents weight.
    pub voting_seed: Option<String>,
    pub dev_network: bool,
    /// An opened (and genesis-initialized) ledger.
    pub ledger: Arc<Ledger>,
}

pub struct Node {
    pub ip: SocketAddr,
    pub ledger: Arc<Ledger>,
    pub processor: BlockProcessor,
    pub view: Addr<View>,
    pub crawler: Addr<RepCrawler>,
    pub initiator: Arc<BootstrapInitiator>,
    pub counters: Arc<Counters>,
    pub config: Arc<BootstrapConfig>,
}

impl Node {
    /// Start every component and both listeners.
    pub async fn start(options: NodeOptions) -> Result<Node> {
        let config = Arc::new(if options.dev_network {
            BootstrapConfig::dev()
        } else {
            BootstrapConfig::live()
        });
        let counters = Arc::new(Counters::new());
        let ledger = options.ledger;
        let processor = BlockProcessor::new(ledger.clone());

        let mut view = View::new(options.listener_ip);
        view.init(options.peers.clone());
        let view_addr = view.start();

        let crawler_config = CrawlerConfig {
            dev_network: options.dev_network,
            online_weight_minimum: config.online_weight_minimum,
            bootstrap_fraction_numerator: config.bootstrap_fraction_numerator,
        };
        let crawler = RepCrawler::new(ledger.clone(), crawler_config.clone()).start();

        let initiator = BootstrapInitiator::new(
            ledger.clone(),
            processor.clone(),
            config.clone(),
            counters.clone(),
            Some(crawler.clone()),
            options.peers,
        );

        let voting_key: Option<Arc<Keypair>> = options
            .voting_seed
            .map(|seed| Arc::new(util::keypair_from_seed(seed.as_bytes())));

        // Realtime listener (handshakes, confirm-requests).
        let router = Router::new(view_addr.clone(), ledger.clone(), voting_key).start();
        let listener_ip = options.listener_ip;
        tokio::spawn(server::server::listen(listener_ip, router));

        // Bootstrap-protocol listener, one port above.
        let bootstrap_listener = BootstrapListener::new(
            util::bootstrap_endpoint(listener_ip),
            ledger.clone(),
            processor.clone(),
            config.tcp_io_timeout,
            config.idle_timeout,
        );
        tokio::spawn(async move {
            if let Err(err) = bootstrap_listener.listen().await {
                error!("bootstrap listener exited: {:?}", err);
            }
        });

        // The ongoing representative crawl.
        tokio::spawn(rep_crawler::run(crawler.clone(), view_addr.clone(), crawler_config));

        Ok(Node {
            ip: listener_ip,
            ledger,
            processor,
            view: view_addr,
            crawler,
            initiator,
            counters,
            config,
        })
    }

    pub fn stop(&self) {
        self.initiator.stop();
    }
}
