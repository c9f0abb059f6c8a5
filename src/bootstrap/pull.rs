//! Pull descriptors and the shared pull queue.

use crate::ledger::{Account, BlockHash};

use tokio::sync::Notify;

use std::collections::VecDeque;
use std::sync::Mutex;

/// One unit of pull work: a request for blocks along one chain, newest-first,
/// up to a stop hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullInfo {
    /// The account the chain belongs to; may be zero for lazy by-hash pulls.
    pub account: Account,
    /// Newest hash wanted, inclusive; zero means "the peer's head for
    /// `account`".
    pub head: BlockHash,
    /// Stop sentinel: pull until this hash's parent, or to the open block
    /// when zero.
    pub end: BlockHash,
    /// Cap on blocks returned; zero means unbounded up to `end`.
    pub count: u32,
    /// Dispatch attempts so far.
    pub attempts: u32,
    /// Blocks received across all tries of this pull.
    pub processed: u64,
    pub retry_limit: u32,
    /// Owning attempt's incremental id; queue eviction keys on this.
    pub bootstrap_id: u64,
}

impl PullInfo {
    pub fn new(
        account: Account,
        head: BlockHash,
        end: BlockHash,
        count: u32,
        retry_limit: u32,
        bootstrap_id: u64,
    ) -> PullInfo {
        PullInfo { account, head, end, count, attempts: 0, processed: 0, retry_limit, bootstrap_id }
    }

    pub fn retries_remaining(&self) -> u32 {
        self.retry_limit.saturating_sub(self.attempts)
    }
}

/// FIFO of pull descriptors shared across attempts. One lock; waiters park on
/// the notify.
pub struct PullQueue {
    inner: Mutex<VecDeque<PullInfo>>,
    notify: Notify,
}

impl PullQueue {
    pub fn new() -> PullQueue {
        PullQueue { inner: Mutex::new(VecDeque::new()), notify: Notify::new() }
    }

    pub fn push_back(&self, pull: PullInfo) {
        {
            let mut queue = self.inner.lock().unwrap();
            queue.push_back(pull);
        }
        self.notify.notify_one();
    }

    /// Requeues go to the front so progress on the failed chain is
    /// prioritized over newly discovered pulls.
    pub fn push_front(&self, pull: PullInfo) {
        {
            let mut queue = self.inner.lock().unwrap();
            queue.push_front(pull);
        }
        self.notify.notify_one();
    }

    pub fn pop_front(&self) -> Option<PullInfo> {
        let mut queue = self.inner.lock().unwrap();
        queue.pop_front()
    }

    /// Evict every descriptor owned by an attempt; returns how many were
    /// dropped.
    pub fn clear_attempt(&self, bootstrap_id: u64) -> usize {
        let mut queue = self.inner.lock().unwrap();
        let before = queue.len();
        queue.retain(|pull| pull.bootstrap_id != bootstrap_id);
        before - queue.len()
    }

    pub fn len(&self) -> usize {
        let queue = self.inner.lock().unwrap();
        queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Distinct non-zero heads queued for an attempt, for frontier
    /// confirmation.
    pub fn heads_for_attempt(&self, bootstrap_id: u64, max: usize) -> Vec<BlockHash> {
        let queue = self.inner.lock().unwrap();
        let mut heads = vec![];
        for pull in queue.iter() {
            if heads.len() == max {
                break;
            }
            if pull.bootstrap_id == bootstrap_id
                && !pull.head.is_zero()
                && !heads.contains(&pull.head)
            {
                heads.push(pull.head);
            }
        }
        heads
    }

    /// Suspend until a push lands or the timeout passes.
    pub async fn wait(&self, timeout: tokio::time::Duration) {
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pull(id: u64, head_seed: u8) -> PullInfo {
        PullInfo::new(
            Account::zero(),
            BlockHash::digest(&[head_seed]),
            BlockHash::zero(),
            0,
            4,
            id,
        )
    }

    #[actix_rt::test]
    async fn test_fifo_and_requeue_order() {
        let queue = PullQueue::new();
        queue.push_back(pull(1, 1));
        queue.push_back(pull(1, 2));
        // A requeue jumps the line.
        queue.push_front(pull(1, 3));

        assert_eq!(3, queue.len());
        assert_eq!(BlockHash::digest(&[3]), queue.pop_front().unwrap().head);
        assert_eq!(BlockHash::digest(&[1]), queue.pop_front().unwrap().head);
        assert_eq!(BlockHash::digest(&[2]), queue.pop_front().unwrap().head);
        assert!(queue.pop_front().is_none());
    }

    #[actix_rt::test]
    async fn test_clear_attempt() {
        let queue = PullQueue::new();
        queue.push_back(pull(1, 1));
        queue.push_back(pull(2, 2));
        queue.push_back(pull(1, 3));

        assert_eq!(2, queue.clear_attempt(1));
        assert_eq!(1, queue.len());
        assert_eq!(2, queue.pop_front().unwrap().bootstrap_id);
    }

    #[actix_rt::test]
    async fn test_heads_for_attempt_dedup() {
        let queue = PullQueue::new();
        queue.push_back(pull(1, 1));
        queue.push_back(pull(1, 1));
        queue.push_back(pull(1, 2));
        queue.push_back(pull(2, 3));

        let heads = queue.heads_for_attempt(1, 10);
        assert_eq!(vec![BlockHash::digest(&[1]), BlockHash::digest(&[2])], heads);
    }
}
