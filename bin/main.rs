//! Node launcher: loads settings, opens the ledger and runs the listeners,
//! the representative crawler and (when a peer is supplied) an initial
//! legacy bootstrap.

use zfx_tundra::ledger::Ledger;
use zfx_tundra::node::{self, Node, NodeOptions};
use zfx_tundra::server::Settings;
use zfx_tundra::util;
use zfx_tundra::Result;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use tracing::info;
use tracing_subscriber;

use clap::{App, Arg};

fn main() -> Result<()> {
    tracing_subscriber::fmt().compact().with_max_level(tracing::Level::INFO).init();

    let matches = App::new("zfx-tundra")
        .version("0.1")
        .author("zero.fx labs ltd.")
        .about("Runs an account-chain ledger node and bootstraps it from peers")
        .arg(
            Arg::with_name("listener-ip")
                .short("a")
                .long("listener-ip")
                .value_name("LISTENER_IP")
                .takes_value(true),
        )
        .arg(Arg::with_name("peer").short("b").long("peer").value_name("PEER_IP").multiple(true))
        .arg(
            Arg::with_name("voting-seed")
                .short("k")
                .long("voting-seed")
                .value_name("SEED_PHRASE")
                .takes_value(true),
        )
        .arg(Arg::with_name("db-path").short("d").long("db-path").value_name("DB").takes_value(true))
        .arg(Arg::with_name("bootstrap").long("bootstrap").help("Start a legacy bootstrap at once"))
        .get_matches();

    let settings = Settings::new().unwrap_or_default();

    let listener_ip: SocketAddr = match matches.value_of("listener-ip") {
        Some(ip) => util::parse_endpoint(ip)?,
        None => util::parse_endpoint(&settings.listener_ip)?,
    };
    let mut peers: Vec<SocketAddr> = vec![];
    if let Some(values) = matches.values_of("peer") {
        for value in values {
            peers.push(util::parse_endpoint(value)?);
        }
    } else {
        for value in settings.bootstrap_peers.iter() {
            peers.push(util::parse_endpoint(value)?);
        }
    }
    let voting_seed = matches
        .value_of("voting-seed")
        .map(|s| s.to_string())
        .or_else(|| settings.voting_seed.clone());
    let db_path =
        matches.value_of("db-path").map(|s| s.to_string()).unwrap_or(settings.db_path.clone());
    let dev_network = settings.network == "dev";
    let bootstrap_now = matches.is_present("bootstrap");

    let system = actix_rt::System::new();
    system.block_on(async move {
        let ledger = Arc::new(Ledger::open(Path::new(&db_path))?);
        ledger.initialize(node::dev_genesis_account(), node::DEV_GENESIS_AMOUNT)?;
        info!("ledger holds {} blocks", ledger.block_count());

        let node = Node::start(NodeOptions {
            listener_ip,
            peers: peers.clone(),
            voting_seed,
            dev_network,
            ledger,
        })
        .await?;

        if bootstrap_now {
            if let Some(peer) = peers.first() {
                node.initiator.bootstrap(*peer, false, None);
            }
        }

        futures::future::pending::<()>().await;
        Ok(())
    })
}
