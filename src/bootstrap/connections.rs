//! The bootstrap connection pool and the dispatcher that marries queued
//! pulls to leased connections.
//!
//! A connection is either idle in the pool or exclusively leased to one
//! exchange. `leased + idle` never exceeds `bootstrap_connections_max`; a
//! lease above the cap waits cooperatively until a slot frees or the caller
//! stops. A periodic sweep closes idle sockets past their timeout.

use super::bulk_pull;
use super::pull::{PullInfo, PullQueue};
use super::{AttemptKind, BootstrapConfig, BootstrapContext, PeerExclusion};
use crate::{Error, Result};

use tracing::{debug, warn};

use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::{sleep, timeout, Duration, Instant};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// A client socket exclusively leased from the pool for one exchange.
pub struct BootstrapClient {
    pub endpoint: SocketAddr,
    pub stream: TcpStream,
    pub bootstrap_id: u64,
}

impl std::fmt::Debug for BootstrapClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrapClient")
            .field("endpoint", &self.endpoint)
            .field("bootstrap_id", &self.bootstrap_id)
            .finish()
    }
}

struct IdleEntry {
    endpoint: SocketAddr,
    stream: TcpStream,
    since: Instant,
}

struct PoolState {
    idle: Vec<IdleEntry>,
    /// Leased plus idle connections.
    total: usize,
}

pub struct BootstrapConnections {
    config: Arc<BootstrapConfig>,
    pub pulls: PullQueue,
    state: Mutex<PoolState>,
    /// Wakes lease waiters when a slot frees.
    slots: Notify,
    stopped: AtomicBool,
    pub exclusion: PeerExclusion,
    /// Concurrent pull exchanges in flight, bounded by
    /// `bootstrap_connections`.
    active_pulls: AtomicUsize,
    pull_slot: Notify,
}

impl BootstrapConnections {
    pub fn new(config: Arc<BootstrapConfig>) -> Arc<BootstrapConnections> {
        Arc::new(BootstrapConnections {
            config,
            pulls: PullQueue::new(),
            state: Mutex::new(PoolState { idle: vec![], total: 0 }),
            slots: Notify::new(),
            stopped: AtomicBool::new(false),
            exclusion: PeerExclusion::new(),
            active_pulls: AtomicUsize::new(0),
            pull_slot: Notify::new(),
        })
    }

    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Stop leasing, drop idle sockets and wake every waiter.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        {
            let mut state = self.state.lock().unwrap();
            let dropped = state.idle.len();
            state.idle.clear();
            state.total -= dropped;
        }
        self.slots.notify_waiters();
        self.pull_slot.notify_waiters();
    }

    /// Total connections currently accounted for (leased + idle).
    pub fn total(&self) -> usize {
        self.state.lock().unwrap().total
    }

    pub fn idle_len(&self) -> usize {
        self.state.lock().unwrap().idle.len()
    }

    /// Lease a connection to `endpoint`, reusing an idle one unless
    /// `force_new`. Waits cooperatively while the pool is saturated.
    pub async fn lease(
        &self,
        endpoint: SocketAddr,
        bootstrap_id: u64,
        force_new: bool,
    ) -> Result<BootstrapClient> {
        loop {
            if self.stopped() {
                return Err(Error::AttemptStopped);
            }
            if self.exclusion.is_excluded(&endpoint) {
                return Err(Error::PeerExcluded);
            }
            let may_connect = {
                let mut state = self.state.lock().unwrap();
                if !force_new {
                    if let Some(i) = state.idle.iter().position(|e| e.endpoint == endpoint) {
                        let entry = state.idle.remove(i);
                        return Ok(BootstrapClient { endpoint, stream: entry.stream, bootstrap_id });
                    }
                }
                if state.total < self.config.bootstrap_connections_max {
                    state.total += 1;
                    true
                } else {
                    false
                }
            };
            if !may_connect {
                // Saturated: wait for a slot, then re-check.
                let _ = timeout(Duration::from_millis(250), self.slots.notified()).await;
                continue;
            }
            match timeout(self.config.connect_timeout, TcpStream::connect(endpoint)).await {
                Ok(Ok(stream)) => {
                    debug!("connected to {:?}", endpoint);
                    return Ok(BootstrapClient { endpoint, stream, bootstrap_id });
                }
                Ok(Err(err)) => {
                    self.drop_slot();
                    return Err(Error::IO(err));
                }
                Err(_) => {
                    self.drop_slot();
                    return Err(Error::Timeout);
                }
            }
        }
    }

    /// Return a connection to the pool, or drop it when it is not reusable
    /// or the idle set is full.
    pub fn release(&self, client: BootstrapClient, reusable: bool) {
        let mut state = self.state.lock().unwrap();
        if reusable && !self.stopped() && state.idle.len() < self.config.max_idle_connections {
            state.idle.push(IdleEntry {
                endpoint: client.endpoint,
                stream: client.stream,
                since: Instant::now(),
            });
        } else {
            state.total -= 1;
            drop(state);
            self.slots.notify_one();
        }
    }

    /// Drop an errored connection and record a strike against its peer.
    pub fn fail(&self, client: BootstrapClient) {
        let strikes = self.exclusion.add_strike(client.endpoint);
        debug!("dropping connection to {:?} (strike {})", client.endpoint, strikes);
        drop(client);
        self.drop_slot();
    }

    fn drop_slot(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.total -= 1;
        }
        self.slots.notify_one();
    }

    /// Close idle connections past the idle timeout. Runs until stopped.
    pub async fn run_sweeper(self: Arc<Self>) {
        loop {
            sleep(self.config.idle_timeout / 2).await;
            if self.stopped() {
                break;
            }
            let dropped = {
                let mut state = self.state.lock().unwrap();
                let before = state.idle.len();
                let idle_timeout = self.config.idle_timeout;
                state.idle.retain(|entry| entry.since.elapsed() < idle_timeout);
                let dropped = before - state.idle.len();
                state.total -= dropped;
                dropped
            };
            if dropped > 0 {
                debug!("closed {} idle bootstrap connections", dropped);
                self.slots.notify_waiters();
            }
        }
    }
}

/// Pop pulls, resolve their attempt, lease a connection and drive the bulk
/// pull exchange. Concurrency is bounded by `bootstrap_connections`; the pool
/// cap bounds everything else.
pub async fn run_dispatcher(ctx: BootstrapContext) {
    loop {
        if ctx.connections.stopped() {
            break;
        }
        if ctx.connections.active_pulls.load(Ordering::SeqCst) >= ctx.config.bootstrap_connections
        {
            let _ =
                timeout(Duration::from_millis(250), ctx.connections.pull_slot.notified()).await;
            continue;
        }
        let pull = match ctx.connections.pulls.pop_front() {
            Some(pull) => pull,
            None => {
                ctx.connections.pulls.wait(Duration::from_millis(250)).await;
                continue;
            }
        };
        let attempt = match ctx.attempts.find(pull.bootstrap_id) {
            Some(attempt) => attempt,
            // The owning attempt is gone; the descriptor dies with it.
            None => continue,
        };
        if attempt.base().stopped() {
            attempt.base().pull_finished();
            continue;
        }
        let endpoint = attempt.pull_endpoint();
        let client = match ctx.connections.lease(endpoint, pull.bootstrap_id, false).await {
            Ok(client) => client,
            Err(Error::AttemptStopped) => {
                attempt.base().pull_finished();
                continue;
            }
            Err(err) => {
                debug!("lease to {:?} failed: {:?}", endpoint, err);
                requeue_pull(&ctx, &attempt, bump_attempts(pull));
                continue;
            }
        };
        ctx.connections.active_pulls.fetch_add(1, Ordering::SeqCst);
        let task_ctx = ctx.clone();
        tokio::spawn(async move {
            run_pull(task_ctx, client, attempt, pull).await;
        });
    }
}

fn bump_attempts(mut pull: PullInfo) -> PullInfo {
    pull.attempts += 1;
    pull
}

async fn run_pull(
    ctx: BootstrapContext,
    mut client: BootstrapClient,
    attempt: AttemptKind,
    mut pull: PullInfo,
) {
    pull.attempts += 1;
    let result = bulk_pull::bulk_pull_client(&mut client, &ctx, &attempt, &mut pull).await;
    match result {
        Ok(true) => {
            ctx.connections.release(client, true);
            attempt.on_pull_complete(&pull);
            attempt.base().pull_finished();
        }
        Ok(false) => {
            // The stream ended cleanly but the gap is still open.
            ctx.connections.release(client, true);
            requeue_pull(&ctx, &attempt, pull);
        }
        Err(err) => {
            warn!("pull from {:?} failed: {:?}", client.endpoint, err);
            ctx.connections.fail(client);
            requeue_pull(&ctx, &attempt, pull);
        }
    }
    ctx.connections.active_pulls.fetch_sub(1, Ordering::SeqCst);
    ctx.connections.pull_slot.notify_one();
}

fn requeue_pull(ctx: &BootstrapContext, attempt: &AttemptKind, pull: PullInfo) {
    if attempt.base().stopped() {
        attempt.base().pull_finished();
        return;
    }
    if pull.attempts < pull.retry_limit {
        attempt.on_requeue();
        // Head of the line: progress on the failed chain comes first.
        ctx.connections.pulls.push_front(pull);
    } else {
        debug!(
            "pull for account {:?} head {:?} ran out of retries",
            pull.account, pull.head
        );
        attempt.on_pull_exhausted(ctx, &pull);
        attempt.base().pull_finished();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    fn connections() -> Arc<BootstrapConnections> {
        let mut config = BootstrapConfig::dev();
        config.bootstrap_connections_max = 2;
        config.max_idle_connections = 2;
        BootstrapConnections::new(Arc::new(config))
    }

    #[actix_rt::test]
    async fn test_lease_release_reuse() {
        let (listener, addr) = listener().await;
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });
        let pool = connections();

        let client = pool.lease(addr, 1, false).await.unwrap();
        assert_eq!(1, pool.total());
        assert_eq!(0, pool.idle_len());

        pool.release(client, true);
        assert_eq!(1, pool.total());
        assert_eq!(1, pool.idle_len());

        // Reuse keeps the accounting stable.
        let client = pool.lease(addr, 1, false).await.unwrap();
        assert_eq!(1, pool.total());
        assert_eq!(0, pool.idle_len());
        pool.release(client, false);
        assert_eq!(0, pool.total());
    }

    #[actix_rt::test]
    async fn test_lease_waits_at_cap() {
        let (listener, addr) = listener().await;
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });
        let pool = connections();

        let a = pool.lease(addr, 1, false).await.unwrap();
        let _b = pool.lease(addr, 1, true).await.unwrap();
        assert_eq!(2, pool.total());

        // The third lease parks until a slot frees.
        let pool_clone = pool.clone();
        let waiter = tokio::spawn(async move { pool_clone.lease(addr, 1, true).await });
        sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        pool.release(a, false);
        let leased = timeout(Duration::from_secs(2), waiter).await.unwrap().unwrap();
        assert!(leased.is_ok());
        assert_eq!(2, pool.total());
    }

    #[actix_rt::test]
    async fn test_stop_unblocks_lease() {
        let (listener, addr) = listener().await;
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });
        let pool = connections();
        let _a = pool.lease(addr, 1, false).await.unwrap();
        let _b = pool.lease(addr, 1, true).await.unwrap();

        let pool_clone = pool.clone();
        let waiter = tokio::spawn(async move { pool_clone.lease(addr, 1, true).await });
        sleep(Duration::from_millis(20)).await;
        pool.stop();
        match timeout(Duration::from_secs(2), waiter).await.unwrap().unwrap() {
            Err(Error::AttemptStopped) => (),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[actix_rt::test]
    async fn test_excluded_peer_refused() {
        let (_listener, addr) = listener().await;
        let pool = connections();
        pool.exclusion.add_strike(addr);
        pool.exclusion.add_strike(addr);
        match pool.lease(addr, 1, false).await {
            Err(Error::PeerExcluded) => (),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }
}
