//! The representative crawler probes peers with confirm-requests to learn
//! their weighted identity. Legacy bootstrap attempts consult it before
//! trusting a peer's frontier set.
//!
//! The actor owns the representative records (indexed by account, read in
//! descending weight order, mapped by channel endpoint), the active-challenge
//! window and the vote cache. The periodic crawl loop runs as a spawned task
//! in [run].

use crate::client;
use crate::ledger::{Account, Amount, BlockHash, HashOrAccount, Ledger};
use crate::message::{ConfirmReq, Vote};
use crate::protocol::{Request, Response};
use crate::view::{GetPeers, SampleK, View};

use tracing::{debug, info};

use actix::{Actor, Addr, Context, Handler};
use colored::Colorize;
use tokio::time::{sleep, Duration, Instant};

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

/// How long a challenge stays in the active window.
const ACTIVE_WINDOW: Duration = Duration::from_secs(5);
/// Retries when a random challenge collides with an active one.
const CHALLENGE_RETRIES: usize = 4;
/// Peers probed per crawl when known weight is sufficient / insufficient.
const CONSERVATIVE_COUNT: usize = 10;
const AGGRESSIVE_COUNT: usize = 40;
/// Cap on cached vote tallies.
const VOTE_CACHE_MAX: usize = 4096;

/// A peer known to speak for a weighted account.
#[derive(Debug, Clone)]
pub struct Representative {
    pub account: Account,
    pub weight: Amount,
    pub channel: SocketAddr,
    pub last_request: Instant,
    pub last_response: Instant,
}

impl Representative {
    pub fn new(account: Account, weight: Amount, channel: SocketAddr) -> Representative {
        Representative {
            account,
            weight,
            channel,
            last_request: Instant::now(),
            last_response: Instant::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    pub dev_network: bool,
    pub online_weight_minimum: Amount,
    pub bootstrap_fraction_numerator: u64,
}

impl CrawlerConfig {
    pub fn minimum_principal_weight(&self) -> Amount {
        self.online_weight_minimum / self.bootstrap_fraction_numerator as Amount
    }

    fn crawl_interval(&self, sufficient_weight: bool) -> Duration {
        if self.dev_network {
            Duration::from_millis(100)
        } else if sufficient_weight {
            Duration::from_secs(7)
        } else {
            Duration::from_secs(3)
        }
    }
}

pub struct RepCrawler {
    ledger: Arc<Ledger>,
    config: CrawlerConfig,
    probable_reps: HashMap<Account, Representative>,
    /// Accounts speaking through each endpoint; one host may carry several.
    by_channel: HashMap<SocketAddr, HashSet<Account>>,
    /// Challenges a vote may currently answer.
    active: HashMap<BlockHash, Instant>,
    /// Votes awaiting validation.
    responses: VecDeque<(SocketAddr, Vote)>,
    /// Aggregated voters per hash, backing the frontier-trust gate.
    vote_cache: HashMap<BlockHash, HashMap<Account, Amount>>,
}

impl RepCrawler {
    pub fn new(ledger: Arc<Ledger>, config: CrawlerConfig) -> RepCrawler {
        RepCrawler {
            ledger,
            config,
            probable_reps: HashMap::new(),
            by_channel: HashMap::new(),
            active: HashMap::new(),
            responses: VecDeque::new(),
            vote_cache: HashMap::new(),
        }
    }

    fn purge_active(&mut self) {
        let now = Instant::now();
        self.active.retain(|_, expiry| *expiry > now);
    }

    fn unlink_channel(&mut self, account: &Account, channel: &SocketAddr) {
        if let Some(accounts) = self.by_channel.get_mut(channel) {
            accounts.remove(account);
            if accounts.is_empty() {
                self.by_channel.remove(channel);
            }
        }
    }

    /// Inspect queued votes: known-weight accounts become (or refresh)
    /// representative records; every validated vote lands in the cache.
    fn validate(&mut self) {
        let minimum = self.config.minimum_principal_weight();
        while let Some((channel, vote)) = self.responses.pop_front() {
            let weight = match self.ledger.weight(&vote.account) {
                Ok(weight) => weight,
                Err(_) => continue,
            };
            // The vote cache records every vote; only heavy accounts become
            // representative records.
            if self.vote_cache.len() < VOTE_CACHE_MAX {
                for hash in vote.hashes.iter() {
                    self.vote_cache
                        .entry(*hash)
                        .or_insert_with(HashMap::new)
                        .insert(vote.account, weight);
                }
            }
            if weight < minimum {
                continue;
            }
            match self.probable_reps.get_mut(&vote.account) {
                Some(existing) => {
                    existing.last_response = Instant::now();
                    existing.weight = weight;
                    if existing.channel != channel {
                        // The representative moved endpoints.
                        let old = existing.channel;
                        existing.channel = channel;
                        let account = existing.account;
                        self.unlink_channel(&account, &old);
                        self.by_channel.entry(channel).or_insert_with(HashSet::new).insert(account);
                        info!(
                            "[{}] representative {:?} moved to {:?}",
                            "rep_crawler".magenta(),
                            account,
                            channel
                        );
                    }
                }
                None => {
                    self.probable_reps
                        .insert(vote.account, Representative::new(vote.account, weight, channel));
                    self.by_channel
                        .entry(channel)
                        .or_insert_with(HashSet::new)
                        .insert(vote.account);
                    info!(
                        "[{}] found a representative at {:?}",
                        "rep_crawler".magenta(),
                        channel
                    );
                }
            }
        }
    }

    /// Refresh weights from the ledger, dropping accounts that lost all
    /// weight.
    fn update_weights(&mut self) {
        let mut dropped = vec![];
        for (account, rep) in self.probable_reps.iter_mut() {
            match self.ledger.weight(account) {
                Ok(weight) if weight > 0 => rep.weight = weight,
                _ => dropped.push((*account, rep.channel)),
            }
        }
        for (account, channel) in dropped.into_iter() {
            self.probable_reps.remove(&account);
            self.unlink_channel(&account, &channel);
        }
    }

    fn total_weight(&self) -> Amount {
        self.probable_reps.values().map(|rep| rep.weight).sum()
    }

    /// Representatives in descending weight order above a floor.
    fn representatives(&self, count: usize, min_weight: Amount) -> Vec<Representative> {
        let mut reps: Vec<Representative> = self
            .probable_reps
            .values()
            .filter(|rep| rep.weight > min_weight)
            .cloned()
            .collect();
        reps.sort_by(|a, b| b.weight.cmp(&a.weight));
        reps.truncate(count);
        reps
    }
}

impl Actor for RepCrawler {
    type Context = Context<Self>;

    fn started(&mut self, _ctx: &mut Context<Self>) {
        debug!(": started");
    }
}

/// Pick a challenge for this crawl round and open its active window.
#[derive(Debug, Clone, Message)]
#[rtype(result = "ChallengeResult")]
pub struct PrepareQuery;

#[derive(Debug, Clone, MessageResponse)]
pub struct ChallengeResult {
    pub challenge: Option<(BlockHash, HashOrAccount)>,
}

impl Handler<PrepareQuery> for RepCrawler {
    type Result = ChallengeResult;

    fn handle(&mut self, _msg: PrepareQuery, _ctx: &mut Context<Self>) -> Self::Result {
        self.purge_active();
        let mut challenge = None;
        // Avoid re-sending a live challenge.
        for _ in 0..CHALLENGE_RETRIES {
            match self.ledger.random_hash_root() {
                Ok(Some((hash, root))) => {
                    if !self.active.contains_key(&hash) {
                        challenge = Some((hash, root));
                        break;
                    }
                    challenge = Some((hash, root));
                }
                _ => break,
            }
        }
        if let Some((hash, _)) = challenge {
            self.active.insert(hash, Instant::now() + ACTIVE_WINDOW);
        }
        ChallengeResult { challenge }
    }
}

/// Open the active window for externally driven queries (the legacy
/// frontier-trust gate), so their answering votes pass the gate.
#[derive(Debug, Clone, Message)]
#[rtype(result = "()")]
pub struct RegisterActive {
    pub hashes: Vec<BlockHash>,
}

impl Handler<RegisterActive> for RepCrawler {
    type Result = ();

    fn handle(&mut self, msg: RegisterActive, _ctx: &mut Context<Self>) -> Self::Result {
        let expiry = Instant::now() + ACTIVE_WINDOW;
        for hash in msg.hashes.into_iter() {
            self.active.insert(hash, expiry);
        }
    }
}

/// An incoming vote from a channel; queued iff it answers a live challenge
/// and its signature verifies.
#[derive(Debug, Clone, Message)]
#[rtype(result = "bool")]
pub struct CrawlResponse {
    pub channel: SocketAddr,
    pub vote: Vote,
}

impl Handler<CrawlResponse> for RepCrawler {
    type Result = bool;

    fn handle(&mut self, msg: CrawlResponse, _ctx: &mut Context<Self>) -> Self::Result {
        self.purge_active();
        let live = msg.vote.hashes.iter().any(|hash| self.active.contains_key(hash));
        if !live || msg.vote.validate().is_err() {
            return false;
        }
        self.responses.push_back((msg.channel, msg.vote));
        true
    }
}

/// Validate queued votes and refresh weights.
#[derive(Debug, Clone, Message)]
#[rtype(result = "()")]
pub struct Validate;

impl Handler<Validate> for RepCrawler {
    type Result = ();

    fn handle(&mut self, _msg: Validate, _ctx: &mut Context<Self>) -> Self::Result {
        self.update_weights();
        self.validate();
    }
}

/// Drop representatives whose channels are no longer live in the peer
/// table.
#[derive(Debug, Clone, Message)]
#[rtype(result = "()")]
pub struct CleanupReps {
    pub live: Vec<SocketAddr>,
}

impl Handler<CleanupReps> for RepCrawler {
    type Result = ();

    fn handle(&mut self, msg: CleanupReps, _ctx: &mut Context<Self>) -> Self::Result {
        let live: HashSet<SocketAddr> = msg.live.into_iter().collect();
        let dead: Vec<(Account, SocketAddr)> = self
            .probable_reps
            .values()
            .filter(|rep| !live.contains(&rep.channel))
            .map(|rep| (rep.account, rep.channel))
            .collect();
        for (account, channel) in dead.into_iter() {
            self.probable_reps.remove(&account);
            self.unlink_channel(&account, &channel);
        }
    }
}

#[derive(Debug, Clone, Message)]
#[rtype(result = "RepsResult")]
pub struct GetRepresentatives {
    pub count: usize,
    /// Defaults to the principal-representative floor.
    pub min_weight: Option<Amount>,
}

#[derive(Debug, Clone, MessageResponse)]
pub struct RepsResult {
    pub reps: Vec<Representative>,
}

impl Handler<GetRepresentatives> for RepCrawler {
    type Result = RepsResult;

    fn handle(&mut self, msg: GetRepresentatives, _ctx: &mut Context<Self>) -> Self::Result {
        let min_weight =
            msg.min_weight.unwrap_or_else(|| self.config.minimum_principal_weight());
        RepsResult { reps: self.representatives(msg.count, min_weight) }
    }
}

#[derive(Debug, Clone, Message)]
#[rtype(result = "WeightResult")]
pub struct TotalWeight;

#[derive(Debug, Clone, MessageResponse)]
pub struct WeightResult {
    pub weight: Amount,
}

impl Handler<TotalWeight> for RepCrawler {
    type Result = WeightResult;

    fn handle(&mut self, _msg: TotalWeight, _ctx: &mut Context<Self>) -> Self::Result {
        WeightResult { weight: self.total_weight() }
    }
}

/// Whether the endpoint carries a principal representative.
#[derive(Debug, Clone, Message)]
#[rtype(result = "bool")]
pub struct IsPrincipal {
    pub channel: SocketAddr,
}

impl Handler<IsPrincipal> for RepCrawler {
    type Result = bool;

    fn handle(&mut self, msg: IsPrincipal, _ctx: &mut Context<Self>) -> Self::Result {
        let minimum = self.config.minimum_principal_weight();
        match self.by_channel.get(&msg.channel) {
            Some(accounts) => accounts.iter().any(|account| {
                self.probable_reps.get(account).map_or(false, |rep| rep.weight > minimum)
            }),
            None => false,
        }
    }
}

/// Cached vote tallies for the given hashes: `(hash, weight, voters)`.
#[derive(Debug, Clone, Message)]
#[rtype(result = "TallyResult")]
pub struct VoteTally {
    pub hashes: Vec<BlockHash>,
}

#[derive(Debug, Clone, MessageResponse)]
pub struct TallyResult {
    pub tallies: Vec<(BlockHash, Amount, usize)>,
}

impl Handler<VoteTally> for RepCrawler {
    type Result = TallyResult;

    fn handle(&mut self, msg: VoteTally, _ctx: &mut Context<Self>) -> Self::Result {
        let tallies = msg
            .hashes
            .into_iter()
            .map(|hash| match self.vote_cache.get(&hash) {
                Some(voters) => (hash, voters.values().sum(), voters.len()),
                None => (hash, 0, 0),
            })
            .collect();
        TallyResult { tallies }
    }
}

/// The periodic crawl: validate and clean the table, pick a challenge, probe
/// a peer sample, queue the answering votes. Interval adapts to how much
/// weight is already known.
pub async fn run(crawler: Addr<RepCrawler>, view: Addr<View>, config: CrawlerConfig) {
    loop {
        let peers = match view.send(GetPeers).await {
            Ok(result) => result.peers,
            Err(_) => break,
        };
        if crawler.send(CleanupReps { live: peers }).await.is_err() {
            break;
        }
        let _ = crawler.send(Validate).await;

        let total_weight = match crawler.send(TotalWeight).await {
            Ok(result) => result.weight,
            Err(_) => break,
        };
        let sufficient_weight = total_weight > config.online_weight_minimum;
        // Crawl more aggressively while weight is missing; the extra half
        // picks up reps that failed to answer when first observed.
        let count = if sufficient_weight { CONSERVATIVE_COUNT } else { AGGRESSIVE_COUNT };
        let count = count + count / 2;
        let targets = match view.send(SampleK { k: count }).await {
            Ok(result) => result.sample,
            Err(_) => break,
        };

        if !targets.is_empty() {
            if let Ok(ChallengeResult { challenge: Some((hash, root)) }) =
                crawler.send(PrepareQuery).await
            {
                let request =
                    Request::ConfirmReq(ConfirmReq { hash_roots: vec![(hash, root)] });
                for (channel, response) in client::fanout(targets, request).await {
                    if let Response::ConfirmAck(ack) = response {
                        crawler.do_send(CrawlResponse { channel, vote: ack.vote });
                    }
                }
            }
        }

        sleep(config.crawl_interval(sufficient_weight)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::types::hash;
    use crate::ledger::Block;
    use crate::util::keypair_from_seed;

    fn crawler_with_rep() -> (Addr<RepCrawler>, Arc<Ledger>, ed25519_dalek::Keypair, BlockHash)
    {
        let keypair = keypair_from_seed(b"rep");
        let rep_account = Account::from_bytes(keypair.public.to_bytes());
        let ledger = Arc::new(Ledger::temporary().unwrap());
        let genesis_hash = ledger.initialize(rep_account, 10_000).unwrap();
        let config = CrawlerConfig {
            dev_network: true,
            online_weight_minimum: 1_000,
            bootstrap_fraction_numerator: 3,
        };
        let crawler = RepCrawler::new(ledger.clone(), config).start();
        (crawler, ledger, keypair, genesis_hash)
    }

    #[actix_rt::test]
    async fn test_vote_on_active_hash_becomes_rep() {
        let (crawler, _ledger, keypair, genesis_hash) = crawler_with_rep();
        let channel: SocketAddr = "127.0.0.1:9100".parse().unwrap();

        crawler.send(RegisterActive { hashes: vec![genesis_hash] }).await.unwrap();
        let vote = Vote::sign(&keypair, 1, vec![genesis_hash]);
        assert!(crawler.send(CrawlResponse { channel, vote }).await.unwrap());
        crawler.send(Validate).await.unwrap();

        let reps = crawler
            .send(GetRepresentatives { count: 10, min_weight: None })
            .await
            .unwrap()
            .reps;
        assert_eq!(1, reps.len());
        assert_eq!(channel, reps[0].channel);
        assert_eq!(10_000, reps[0].weight);
        assert!(crawler.send(IsPrincipal { channel }).await.unwrap());
        assert_eq!(10_000, crawler.send(TotalWeight).await.unwrap().weight);

        let tallies =
            crawler.send(VoteTally { hashes: vec![genesis_hash] }).await.unwrap().tallies;
        assert_eq!((genesis_hash, 10_000, 1), tallies[0]);
    }

    #[actix_rt::test]
    async fn test_vote_without_active_hash_dropped() {
        let (crawler, _ledger, keypair, genesis_hash) = crawler_with_rep();
        let channel: SocketAddr = "127.0.0.1:9101".parse().unwrap();
        let vote = Vote::sign(&keypair, 1, vec![genesis_hash]);
        assert!(!crawler.send(CrawlResponse { channel, vote }).await.unwrap());
    }

    #[actix_rt::test]
    async fn test_forged_vote_dropped() {
        let (crawler, _ledger, keypair, genesis_hash) = crawler_with_rep();
        let channel: SocketAddr = "127.0.0.1:9102".parse().unwrap();
        crawler.send(RegisterActive { hashes: vec![genesis_hash] }).await.unwrap();
        let mut vote = Vote::sign(&keypair, 1, vec![genesis_hash]);
        vote.account = Account::from_bytes(hash(b"someone else"));
        assert!(!crawler.send(CrawlResponse { channel, vote }).await.unwrap());
    }

    #[actix_rt::test]
    async fn test_channel_change_updates_record() {
        let (crawler, _ledger, keypair, genesis_hash) = crawler_with_rep();
        let old: SocketAddr = "127.0.0.1:9103".parse().unwrap();
        let new: SocketAddr = "127.0.0.1:9104".parse().unwrap();

        crawler.send(RegisterActive { hashes: vec![genesis_hash] }).await.unwrap();
        let vote = Vote::sign(&keypair, 1, vec![genesis_hash]);
        crawler.send(CrawlResponse { channel: old, vote: vote.clone() }).await.unwrap();
        crawler.send(Validate).await.unwrap();
        assert!(crawler.send(IsPrincipal { channel: old }).await.unwrap());

        crawler.send(RegisterActive { hashes: vec![genesis_hash] }).await.unwrap();
        crawler.send(CrawlResponse { channel: new, vote }).await.unwrap();
        crawler.send(Validate).await.unwrap();
        assert!(!crawler.send(IsPrincipal { channel: old }).await.unwrap());
        assert!(crawler.send(IsPrincipal { channel: new }).await.unwrap());
    }

    #[actix_rt::test]
    async fn test_cleanup_drops_dead_channels() {
        let (crawler, _ledger, keypair, genesis_hash) = crawler_with_rep();
        let channel: SocketAddr = "127.0.0.1:9105".parse().unwrap();
        crawler.send(RegisterActive { hashes: vec![genesis_hash] }).await.unwrap();
        let vote = Vote::sign(&keypair, 1, vec![genesis_hash]);
        crawler.send(CrawlResponse { channel, vote }).await.unwrap();
        crawler.send(Validate).await.unwrap();

        crawler.send(CleanupReps { live: vec![] }).await.unwrap();
        let reps = crawler
            .send(GetRepresentatives { count: 10, min_weight: Some(0) })
            .await
            .unwrap()
            .reps;
        assert!(reps.is_empty());
    }

    #[actix_rt::test]
    async fn test_weight_update_drops_divested_rep() {
        let (crawler, ledger, keypair, genesis_hash) = crawler_with_rep();
        let rep_account = Account::from_bytes(keypair.public.to_bytes());
        let channel: SocketAddr = "127.0.0.1:9106".parse().unwrap();
        crawler.send(RegisterActive { hashes: vec![genesis_hash] }).await.unwrap();
        let vote = Vote::sign(&keypair, 1, vec![genesis_hash]);
        crawler.send(CrawlResponse { channel, vote }).await.unwrap();
        crawler.send(Validate).await.unwrap();

        // Delegate everything elsewhere; the record should disappear.
        let other = Account::from_bytes(hash(b"new rep"));
        let change = Block::Change { previous: genesis_hash, representative: other };
        ledger.process(&change).unwrap();
        assert_eq!(0, ledger.weight(&rep_account).unwrap());
        crawler.send(Validate).await.unwrap();
        let reps = crawler
            .send(GetRepresentatives { count: 10, min_weight: Some(0) })
            .await
            .unwrap()
            .reps;
        assert!(reps.is_empty());
    }
}
