//! The account-chain ledger store.
//!
//! Backed by `sled` trees: `accounts` (account → [AccountInfo]), `blocks`
//! (hash → [BlockEntry]), `pending` ([PendingKey] → [PendingInfo]), `pruned`
//! (hash existence records) and `rep_weights` (representative → delegated
//! weight). Values are bincode-encoded; composite keys use fixed-layout
//! `zerocopy` structs so that range scans follow account order.
//!
//! The bootstrap subsystem only reads; writes go through [Ledger::process],
//! driven by the block processor.

pub mod block;
pub mod types;

pub use block::{Block, BlockSideband, BlockType};
pub use types::{Account, Amount, BlockHash, HashOrAccount};

use crate::util;
use crate::Result;

use tracing::debug;
use zerocopy::{AsBytes, FromBytes, Unaligned};

use std::path::Path;

/// Per-account head record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub head: BlockHash,
    pub open_block: BlockHash,
    pub balance: Amount,
    pub representative: Account,
    /// Seconds since epoch of the last head change; the frontier server's age
    /// filter reads this.
    pub modified: u64,
    pub block_count: u64,
}

/// A receivable: an amount sent to an account but not yet received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingInfo {
    /// The account that sent the funds.
    pub source: Account,
    pub amount: Amount,
}

/// A stored block together with its ledger-derived sideband.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEntry {
    pub block: Block,
    pub sideband: BlockSideband,
}

/// Composite key of the pending tree: receiving account then source hash, so
/// that one account's receivables form a contiguous ascending range.
#[derive(Clone, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct PendingKey {
    pub account: [u8; 32],
    pub hash: [u8; 32],
}

impl PendingKey {
    pub fn new(account: Account, hash: BlockHash) -> PendingKey {
        PendingKey { account: account.bytes(), hash: hash.bytes() }
    }
}

/// Outcome of applying one block to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessResult {
    /// The block was appended.
    Progress,
    /// The block already exists (or was pruned).
    Old,
    /// The predecessor is not in the ledger yet.
    GapPrevious,
    /// The send side of a receive is not in the ledger yet.
    GapSource,
    /// The block contends for an occupied chain position.
    Fork,
    /// The stated balance is inconsistent with the chain.
    BalanceMismatch,
    /// The referenced send was already received.
    Unreceivable,
}

pub struct Ledger {
    _db: sled::Db,
    accounts: sled::Tree,
    blocks: sled::Tree,
    pending: sled::Tree,
    pruned: sled::Tree,
    rep_weights: sled::Tree,
}

impl Ledger {
    pub fn open(path: &Path) -> Result<Ledger> {
        let db = sled::open(path)?;
        Self::with_db(db)
    }

    /// An in-memory ledger for tests.
    pub fn temporary() -> Result<Ledger> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::with_db(db)
    }

    fn with_db(db: sled::Db) -> Result<Ledger> {
        let accounts = db.open_tree("accounts")?;
        let blocks = db.open_tree("blocks")?;
        let pending = db.open_tree("pending")?;
        let pruned = db.open_tree("pruned")?;
        let rep_weights = db.open_tree("rep_weights")?;
        Ok(Ledger { _db: db, accounts, blocks, pending, pruned, rep_weights })
    }

    /// The deterministic open block of a network's genesis account.
    pub fn genesis_block(account: Account) -> Block {
        Block::Open { source: BlockHash::zero(), representative: account, account }
    }

    /// Seed the genesis account with the full supply. Idempotent.
    pub fn initialize(&self, account: Account, amount: Amount) -> Result<BlockHash> {
        let genesis = Self::genesis_block(account);
        let hash = genesis.hash();
        if self.block_exists(&hash)? {
            return Ok(hash);
        }
        let sideband = BlockSideband {
            account,
            balance: amount,
            height: 1,
            timestamp: util::seconds_since_epoch(),
            successor: BlockHash::zero(),
        };
        self.put_block(&hash, &BlockEntry { block: genesis, sideband })?;
        let info = AccountInfo {
            head: hash,
            open_block: hash,
            balance: amount,
            representative: account,
            modified: util::seconds_since_epoch(),
            block_count: 1,
        };
        self.put_account(&account, &info)?;
        self.add_rep_weight(&account, amount)?;
        Ok(hash)
    }

    // -- block application

    /// Apply one block. Validation is structural: chain positions, pending
    /// availability and balance consistency. Signatures and work are checked
    /// upstream of the ledger.
    pub fn process(&self, block: &Block) -> Result<ProcessResult> {
        let hash = block.hash();
        if self.block_or_pruned_exists(&hash)? {
            return Ok(ProcessResult::Old);
        }
        let result = match block {
            Block::Send { previous, destination, balance } => {
                self.process_send(&hash, block, previous, destination, *balance)?
            }
            Block::Receive { previous, source } => {
                self.process_receive(&hash, block, previous, source)?
            }
            Block::Open { source, representative, account } => {
                self.process_open(&hash, block, source, representative, account)?
            }
            Block::Change { previous, representative } => {
                self.process_change(&hash, block, previous, representative)?
            }
            Block::State { account, previous, representative, balance, link } => {
                self.process_state(&hash, block, account, previous, representative, *balance, link)?
            }
        };
        if result == ProcessResult::Progress {
            debug!("appended block {:?}", hash);
        }
        Ok(result)
    }

    fn head_entry(
        &self,
        previous: &BlockHash,
    ) -> Result<std::result::Result<(BlockEntry, AccountInfo), ProcessResult>> {
        let prev = match self.get_block(previous)? {
            Some(entry) => entry,
            None => return Ok(Err(ProcessResult::GapPrevious)),
        };
        let account = prev.sideband.account;
        let info = match self.account_info(&account)? {
            Some(info) => info,
            None => return Ok(Err(ProcessResult::GapPrevious)),
        };
        if info.head != *previous {
            // The position after `previous` is already taken.
            return Ok(Err(ProcessResult::Fork));
        }
        Ok(Ok((prev, info)))
    }

    fn process_send(
        &self,
        hash: &BlockHash,
        block: &Block,
        previous: &BlockHash,
        destination: &Account,
        balance: Amount,
    ) -> Result<ProcessResult> {
        let (prev, mut info) = match self.head_entry(previous)? {
            Ok(found) => found,
            Err(result) => return Ok(result),
        };
        if balance > prev.sideband.balance {
            return Ok(ProcessResult::BalanceMismatch);
        }
        let account = prev.sideband.account;
        let amount = prev.sideband.balance - balance;
        self.append(hash, block, &prev, &mut info, account, balance)?;
        self.put_pending(
            &PendingKey::new(*destination, *hash),
            &PendingInfo { source: account, amount },
        )?;
        self.sub_rep_weight(&info.representative, amount)?;
        Ok(ProcessResult::Progress)
    }

    fn process_receive(
        &self,
        hash: &BlockHash,
        block: &Block,
        previous: &BlockHash,
        source: &BlockHash,
    ) -> Result<ProcessResult> {
        let (prev, mut info) = match self.head_entry(previous)? {
            Ok(found) => found,
            Err(result) => return Ok(result),
        };
        let account = prev.sideband.account;
        let key = PendingKey::new(account, *source);
        let pending = match self.get_pending(&key)? {
            Some(pending) => pending,
            None => {
                return Ok(if self.block_or_pruned_exists(source)? {
                    ProcessResult::Unreceivable
                } else {
                    ProcessResult::GapSource
                })
            }
        };
        let balance = prev.sideband.balance + pending.amount;
        self.append(hash, block, &prev, &mut info, account, balance)?;
        self.remove_pending(&key)?;
        self.add_rep_weight(&info.representative, pending.amount)?;
        Ok(ProcessResult::Progress)
    }

    fn process_open(
        &self,
        hash: &BlockHash,
        block: &Block,
        source: &BlockHash,
        representative: &Account,
        account: &Account,
    ) -> Result<ProcessResult> {
        if self.account_info(account)?.is_some() {
            return Ok(ProcessResult::Fork);
        }
        let key = PendingKey::new(*account, *source);
        let pending = match self.get_pending(&key)? {
            Some(pending) => pending,
            None => {
                return Ok(if self.block_or_pruned_exists(source)? {
                    ProcessResult::Unreceivable
                } else {
                    ProcessResult::GapSource
                })
            }
        };
        let sideband = BlockSideband {
            account: *account,
            balance: pending.amount,
            height: 1,
            timestamp: util::seconds_since_epoch(),
            successor: BlockHash::zero(),
        };
        self.put_block(hash, &BlockEntry { block: block.clone(), sideband })?;
        let info = AccountInfo {
            head: *hash,
            open_block: *hash,
            balance: pending.amount,
            representative: *representative,
            modified: util::seconds_since_epoch(),
            block_count: 1,
        };
        self.put_account(account, &info)?;
        self.remove_pending(&key)?;
        self.add_rep_weight(representative, pending.amount)?;
        Ok(ProcessResult::Progress)
    }

    fn process_change(
        &self,
        hash: &BlockHash,
        block: &Block,
        previous: &BlockHash,
        representative: &Account,
    ) -> Result<ProcessResult> {
        let (prev, mut info) = match self.head_entry(previous)? {
            Ok(found) => found,
            Err(result) => return Ok(result),
        };
        let account = prev.sideband.account;
        let balance = prev.sideband.balance;
        let old_rep = info.representative;
        info.representative = *representative;
        self.append(hash, block, &prev, &mut info, account, balance)?;
        self.sub_rep_weight(&old_rep, balance)?;
        self.add_rep_weight(representative, balance)?;
        Ok(ProcessResult::Progress)
    }

    fn process_state(
        &self,
        hash: &BlockHash,
        block: &Block,
        account: &Account,
        previous: &BlockHash,
        representative: &Account,
        balance: Amount,
        link: &HashOrAccount,
    ) -> Result<ProcessResult> {
        if previous.is_zero() {
            // Opens an account: the link names the source send.
            if self.account_info(account)?.is_some() {
                return Ok(ProcessResult::Fork);
            }
            let key = PendingKey::new(*account, link.as_hash());
            let pending = match self.get_pending(&key)? {
                Some(pending) => pending,
                None => {
                    return Ok(if self.block_or_pruned_exists(&link.as_hash())? {
                        ProcessResult::Unreceivable
                    } else {
                        ProcessResult::GapSource
                    })
                }
            };
            if balance != pending.amount {
                return Ok(ProcessResult::BalanceMismatch);
            }
            let sideband = BlockSideband {
                account: *account,
                balance,
                height: 1,
                timestamp: util::seconds_since_epoch(),
                successor: BlockHash::zero(),
            };
            self.put_block(hash, &BlockEntry { block: block.clone(), sideband })?;
            let info = AccountInfo {
                head: *hash,
                open_block: *hash,
                balance,
                representative: *representative,
                modified: util::seconds_since_epoch(),
                block_count: 1,
            };
            self.put_account(account, &info)?;
            self.remove_pending(&key)?;
            self.add_rep_weight(representative, balance)?;
            return Ok(ProcessResult::Progress);
        }
        let (prev, mut info) = match self.head_entry(previous)? {
            Ok(found) => found,
            Err(result) => return Ok(result),
        };
        if prev.sideband.account != *account {
            return Ok(ProcessResult::Fork);
        }
        let old_rep = info.representative;
        let old_balance = prev.sideband.balance;
        if balance < old_balance {
            // A send: the link is the destination account.
            let amount = old_balance - balance;
            info.representative = *representative;
            self.append(hash, block, &prev, &mut info, *account, balance)?;
            if !link.is_zero() {
                self.put_pending(
                    &PendingKey::new(link.as_account(), *hash),
                    &PendingInfo { source: *account, amount },
                )?;
            }
            self.sub_rep_weight(&old_rep, old_balance)?;
            self.add_rep_weight(representative, balance)?;
        } else if balance > old_balance {
            // A receive: the link is the source send hash.
            let key = PendingKey::new(*account, link.as_hash());
            let pending = match self.get_pending(&key)? {
                Some(pending) => pending,
                None => {
                    return Ok(if self.block_or_pruned_exists(&link.as_hash())? {
                        ProcessResult::Unreceivable
                    } else {
                        ProcessResult::GapSource
                    })
                }
            };
            if balance != old_balance + pending.amount {
                return Ok(ProcessResult::BalanceMismatch);
            }
            info.representative = *representative;
            self.append(hash, block, &prev, &mut info, *account, balance)?;
            self.remove_pending(&key)?;
            self.sub_rep_weight(&old_rep, old_balance)?;
            self.add_rep_weight(representative, balance)?;
        } else {
            // Balance unchanged: a representative change.
            info.representative = *representative;
            self.append(hash, block, &prev, &mut info, *account, balance)?;
            self.sub_rep_weight(&old_rep, old_balance)?;
            self.add_rep_weight(representative, balance)?;
        }
        Ok(ProcessResult::Progress)
    }

    /// Store `block` as the new head and link it behind `prev`.
    fn append(
        &self,
        hash: &BlockHash,
        block: &Block,
        prev: &BlockEntry,
        info: &mut AccountInfo,
        account: Account,
        balance: Amount,
    ) -> Result<()> {
        let sideband = BlockSideband {
            account,
            balance,
            height: prev.sideband.height + 1,
            timestamp: util::seconds_since_epoch(),
            successor: BlockHash::zero(),
        };
        self.put_block(hash, &BlockEntry { block: block.clone(), sideband })?;
        let mut updated_prev = prev.clone();
        updated_prev.sideband.successor = *hash;
        self.put_block(&prev.block.hash(), &updated_prev)?;
        info.head = *hash;
        info.balance = balance;
        info.modified = util::seconds_since_epoch();
        info.block_count += 1;
        self.put_account(&account, info)?;
        Ok(())
    }

    // -- pruning

    /// Discard a block body while keeping its existence on record.
    pub fn prune(&self, hash: &BlockHash) -> Result<()> {
        let _ = self.blocks.remove(hash.as_bytes())?;
        let _ = self.pruned.insert(hash.as_bytes(), &[])?;
        Ok(())
    }

    // -- reads

    pub fn account_info(&self, account: &Account) -> Result<Option<AccountInfo>> {
        match self.accounts.get(account.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn account_head(&self, account: &Account) -> Result<Option<BlockHash>> {
        Ok(self.account_info(account)?.map(|info| info.head))
    }

    /// Accounts in ascending order starting at `start` (inclusive), at most
    /// `max` of them. Both frontier halves read in batches through this.
    pub fn accounts_range(&self, start: Account, max: usize) -> Result<Vec<(Account, AccountInfo)>> {
        let mut out = Vec::with_capacity(max);
        for kv in self.accounts.range(start.bytes().to_vec()..) {
            if out.len() == max {
                break;
            }
            let (k, v) = kv?;
            let mut bytes = [0u8; 32];
            if k.len() != 32 {
                continue;
            }
            bytes.copy_from_slice(&k);
            out.push((Account::from_bytes(bytes), bincode::deserialize(&v)?));
        }
        Ok(out)
    }

    pub fn account_count(&self) -> usize {
        self.accounts.len()
    }

    pub fn get_block(&self, hash: &BlockHash) -> Result<Option<BlockEntry>> {
        match self.blocks.get(hash.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn block_exists(&self, hash: &BlockHash) -> Result<bool> {
        Ok(self.blocks.contains_key(hash.as_bytes())?)
    }

    pub fn pruned_exists(&self, hash: &BlockHash) -> Result<bool> {
        Ok(self.pruned.contains_key(hash.as_bytes())?)
    }

    /// Whether a block's existence is known, with or without its body.
    pub fn block_or_pruned_exists(&self, hash: &BlockHash) -> Result<bool> {
        Ok(self.block_exists(hash)? || self.pruned_exists(hash)?)
    }

    pub fn block_account(&self, hash: &BlockHash) -> Result<Option<Account>> {
        Ok(self.get_block(hash)?.map(|entry| entry.sideband.account))
    }

    pub fn block_balance(&self, hash: &BlockHash) -> Result<Option<Amount>> {
        Ok(self.get_block(hash)?.map(|entry| entry.sideband.balance))
    }

    pub fn successor(&self, hash: &BlockHash) -> Result<Option<BlockHash>> {
        Ok(self
            .get_block(hash)?
            .map(|entry| entry.sideband.successor)
            .filter(|successor| !successor.is_zero()))
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    // -- pending

    fn get_pending(&self, key: &PendingKey) -> Result<Option<PendingInfo>> {
        match self.pending.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn pending_exists(&self, account: &Account, source: &BlockHash) -> Result<bool> {
        Ok(self.pending.contains_key(PendingKey::new(*account, *source).as_bytes())?)
    }

    /// One account's receivables in ascending source-hash order, filtered by
    /// a minimum amount.
    pub fn pending_range(
        &self,
        account: &Account,
        minimum: Amount,
    ) -> Result<Vec<(BlockHash, PendingInfo)>> {
        let mut out = vec![];
        for kv in self.pending.scan_prefix(account.as_bytes()) {
            let (k, v) = kv?;
            let key = match PendingKey::read_from(k.as_ref()) {
                Some(key) => key,
                None => continue,
            };
            let info: PendingInfo = bincode::deserialize(&v)?;
            if info.amount >= minimum {
                out.push((BlockHash::from_bytes(key.hash), info));
            }
        }
        Ok(out)
    }

    fn put_pending(&self, key: &PendingKey, info: &PendingInfo) -> Result<()> {
        let _ = self.pending.insert(key.as_bytes(), bincode::serialize(info)?)?;
        Ok(())
    }

    fn remove_pending(&self, key: &PendingKey) -> Result<()> {
        let _ = self.pending.remove(key.as_bytes())?;
        Ok(())
    }

    // -- weights

    /// Voting weight delegated to a representative account.
    pub fn weight(&self, representative: &Account) -> Result<Amount> {
        match self.rep_weights.get(representative.as_bytes())? {
            Some(bytes) => Ok(bincode::deserialize(&bytes)?),
            None => Ok(0),
        }
    }

    fn add_rep_weight(&self, representative: &Account, amount: Amount) -> Result<()> {
        let weight = self.weight(representative)? + amount;
        let _ = self.rep_weights.insert(representative.as_bytes(), bincode::serialize(&weight)?)?;
        Ok(())
    }

    fn sub_rep_weight(&self, representative: &Account, amount: Amount) -> Result<()> {
        let weight = self.weight(representative)?.saturating_sub(amount);
        let _ = self.rep_weights.insert(representative.as_bytes(), bincode::serialize(&weight)?)?;
        Ok(())
    }

    /// A uniformly random block hash and its root, for crawler challenges.
    pub fn random_hash_root(&self) -> Result<Option<(BlockHash, HashOrAccount)>> {
        let count = self.blocks.len();
        if count == 0 {
            return Ok(None);
        }
        let nth = rand::Rng::gen_range(&mut rand::thread_rng(), 0..count);
        match self.blocks.iter().nth(nth) {
            Some(kv) => {
                let (k, v) = kv?;
                let mut bytes = [0u8; 32];
                bytes.copy_from_slice(&k);
                let entry: BlockEntry = bincode::deserialize(&v)?;
                Ok(Some((BlockHash::from_bytes(bytes), entry.block.root())))
            }
            None => Ok(None),
        }
    }

    fn put_block(&self, hash: &BlockHash, entry: &BlockEntry) -> Result<()> {
        let _ = self.blocks.insert(hash.as_bytes(), bincode::serialize(entry)?)?;
        Ok(())
    }

    fn put_account(&self, account: &Account, info: &AccountInfo) -> Result<()> {
        let _ = self.accounts.insert(account.as_bytes(), bincode::serialize(info)?)?;
        Ok(())
    }
}
