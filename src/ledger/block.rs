//! The block object model.
//!
//! Five block kinds exist. The four legacy kinds (`send`, `receive`, `open`,
//! `change`) each mutate one aspect of an account chain; `state` blocks carry
//! the full account state and use `link` either as a send destination or a
//! receive source, which only ledger context can disambiguate.
//!
//! Block bodies have a fixed wire layout (32-byte identifiers, little-endian
//! integers). A block's hash is the Blake2b-256 digest of its type tag
//! followed by its body.

use super::types::{hash, Account, Amount, BlockHash, HashOrAccount};
use crate::{Error, Result};

use std::convert::TryInto;

/// Block type tags as they appear on the wire. Tag `0` is the
/// `not_a_block` stream terminator and never names a real block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockType {
    Send,
    Receive,
    Open,
    Change,
    State,
}

impl BlockType {
    pub fn as_u8(&self) -> u8 {
        match self {
            BlockType::Send => 1,
            BlockType::Receive => 2,
            BlockType::Open => 3,
            BlockType::Change => 4,
            BlockType::State => 5,
        }
    }

    pub fn from_u8(tag: u8) -> Option<BlockType> {
        match tag {
            1 => Some(BlockType::Send),
            2 => Some(BlockType::Receive),
            3 => Some(BlockType::Open),
            4 => Some(BlockType::Change),
            5 => Some(BlockType::State),
            _ => None,
        }
    }

    /// Size of the serialized body for this block type.
    pub fn body_size(&self) -> usize {
        match self {
            BlockType::Send => 80,
            BlockType::Receive => 64,
            BlockType::Open => 96,
            BlockType::Change => 64,
            BlockType::State => 144,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Block {
    Send { previous: BlockHash, destination: Account, balance: Amount },
    Receive { previous: BlockHash, source: BlockHash },
    Open { source: BlockHash, representative: Account, account: Account },
    Change { previous: BlockHash, representative: Account },
    State {
        account: Account,
        previous: BlockHash,
        representative: Account,
        balance: Amount,
        link: HashOrAccount,
    },
}

impl Block {
    pub fn block_type(&self) -> BlockType {
        match self {
            Block::Send { .. } => BlockType::Send,
            Block::Receive { .. } => BlockType::Receive,
            Block::Open { .. } => BlockType::Open,
            Block::Change { .. } => BlockType::Change,
            Block::State { .. } => BlockType::State,
        }
    }

    /// Serialize the block body into `buf`. Infallible for valid blocks.
    pub fn serialize_body(&self, buf: &mut Vec<u8>) {
        match self {
            Block::Send { previous, destination, balance } => {
                buf.extend_from_slice(previous.as_bytes());
                buf.extend_from_slice(destination.as_bytes());
                buf.extend_from_slice(&balance.to_le_bytes());
            }
            Block::Receive { previous, source } => {
                buf.extend_from_slice(previous.as_bytes());
                buf.extend_from_slice(source.as_bytes());
            }
            Block::Open { source, representative, account } => {
                buf.extend_from_slice(source.as_bytes());
                buf.extend_from_slice(representative.as_bytes());
                buf.extend_from_slice(account.as_bytes());
            }
            Block::Change { previous, representative } => {
                buf.extend_from_slice(previous.as_bytes());
                buf.extend_from_slice(representative.as_bytes());
            }
            Block::State { account, previous, representative, balance, link } => {
                buf.extend_from_slice(account.as_bytes());
                buf.extend_from_slice(previous.as_bytes());
                buf.extend_from_slice(representative.as_bytes());
                buf.extend_from_slice(&balance.to_le_bytes());
                buf.extend_from_slice(&link.bytes());
            }
        }
    }

    /// Deserialize a block body of the given type. The body length must match
    /// the type exactly.
    pub fn deserialize_body(block_type: BlockType, body: &[u8]) -> Result<Block> {
        if body.len() != block_type.body_size() {
            return Err(Error::MalformedFrame);
        }
        let word = |i: usize| -> [u8; 32] { body[i * 32..(i + 1) * 32].try_into().unwrap() };
        let block = match block_type {
            BlockType::Send => Block::Send {
                previous: BlockHash::from_bytes(word(0)),
                destination: Account::from_bytes(word(1)),
                balance: Amount::from_le_bytes(body[64..80].try_into().unwrap()),
            },
            BlockType::Receive => Block::Receive {
                previous: BlockHash::from_bytes(word(0)),
                source: BlockHash::from_bytes(word(1)),
            },
            BlockType::Open => Block::Open {
                source: BlockHash::from_bytes(word(0)),
                representative: Account::from_bytes(word(1)),
                account: Account::from_bytes(word(2)),
            },
            BlockType::Change => Block::Change {
                previous: BlockHash::from_bytes(word(0)),
                representative: Account::from_bytes(word(1)),
            },
            BlockType::State => Block::State {
                account: Account::from_bytes(word(0)),
                previous: BlockHash::from_bytes(word(1)),
                representative: Account::from_bytes(word(2)),
                balance: Amount::from_le_bytes(body[96..112].try_into().unwrap()),
                link: HashOrAccount::from_bytes(body[112..144].try_into().unwrap()),
            },
        };
        Ok(block)
    }

    /// The block's content-defined identity.
    pub fn hash(&self) -> BlockHash {
        let mut buf = Vec::with_capacity(1 + self.block_type().body_size());
        buf.push(self.block_type().as_u8());
        self.serialize_body(&mut buf);
        BlockHash::from_bytes(hash(&buf))
    }

    /// Hash of the preceding block in the account chain; zero for blocks that
    /// open an account.
    pub fn previous(&self) -> BlockHash {
        match self {
            Block::Send { previous, .. } => *previous,
            Block::Receive { previous, .. } => *previous,
            Block::Open { .. } => BlockHash::zero(),
            Block::Change { previous, .. } => *previous,
            Block::State { previous, .. } => *previous,
        }
    }

    /// The chain position this block contends for: `previous` when extending
    /// a chain, the account itself when opening one.
    pub fn root(&self) -> HashOrAccount {
        match self {
            Block::Open { account, .. } => HashOrAccount::from(*account),
            Block::State { account, previous, .. } => {
                if previous.is_zero() {
                    HashOrAccount::from(*account)
                } else {
                    HashOrAccount::from(*previous)
                }
            }
            _ => HashOrAccount::from(self.previous()),
        }
    }

    /// The owning account, or zero where the account is contextual (legacy
    /// send/receive/change blocks).
    pub fn account(&self) -> Account {
        match self {
            Block::Open { account, .. } => *account,
            Block::State { account, .. } => *account,
            _ => Account::zero(),
        }
    }

    /// A state block's link field; zero for other kinds.
    pub fn link(&self) -> HashOrAccount {
        match self {
            Block::State { link, .. } => *link,
            _ => HashOrAccount::zero(),
        }
    }

    /// The receive source, where the block type states one.
    pub fn source(&self) -> Option<BlockHash> {
        match self {
            Block::Receive { source, .. } => Some(*source),
            Block::Open { source, .. } => Some(*source),
            _ => None,
        }
    }

    /// The send destination, where the block type states one.
    pub fn destination(&self) -> Option<Account> {
        match self {
            Block::Send { destination, .. } => Some(*destination),
            _ => None,
        }
    }

    /// The resulting balance, for block types that carry one.
    pub fn balance(&self) -> Option<Amount> {
        match self {
            Block::Send { balance, .. } => Some(*balance),
            Block::State { balance, .. } => Some(*balance),
            _ => None,
        }
    }

    pub fn representative(&self) -> Option<Account> {
        match self {
            Block::Open { representative, .. } => Some(*representative),
            Block::Change { representative, .. } => Some(*representative),
            Block::State { representative, .. } => Some(*representative),
            _ => None,
        }
    }
}

/// Ledger-derived metadata stored alongside a block, never sent on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSideband {
    pub account: Account,
    pub balance: Amount,
    pub height: u64,
    pub timestamp: u64,
    pub successor: BlockHash,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> Block {
        Block::State {
            account: Account::from_bytes(hash(b"account")),
            previous: BlockHash::digest(b"previous"),
            representative: Account::from_bytes(hash(b"rep")),
            balance: 1_000_000,
            link: HashOrAccount::from(BlockHash::digest(b"link")),
        }
    }

    #[actix_rt::test]
    async fn test_body_round_trip() {
        let blocks = vec![
            Block::Send {
                previous: BlockHash::digest(b"prev"),
                destination: Account::from_bytes(hash(b"dest")),
                balance: 42,
            },
            Block::Receive {
                previous: BlockHash::digest(b"prev"),
                source: BlockHash::digest(b"source"),
            },
            Block::Open {
                source: BlockHash::digest(b"source"),
                representative: Account::from_bytes(hash(b"rep")),
                account: Account::from_bytes(hash(b"account")),
            },
            Block::Change {
                previous: BlockHash::digest(b"prev"),
                representative: Account::from_bytes(hash(b"rep")),
            },
            sample_state(),
        ];
        for block in blocks {
            let mut body = vec![];
            block.serialize_body(&mut body);
            assert_eq!(body.len(), block.block_type().body_size());
            let decoded = Block::deserialize_body(block.block_type(), &body).unwrap();
            assert_eq!(block, decoded);
            assert_eq!(block.hash(), decoded.hash());
        }
    }

    #[actix_rt::test]
    async fn test_truncated_body_rejected() {
        let block = sample_state();
        let mut body = vec![];
        block.serialize_body(&mut body);
        body.pop();
        match Block::deserialize_body(BlockType::State, &body) {
            Err(crate::Error::MalformedFrame) => (),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[actix_rt::test]
    async fn test_root() {
        let open = Block::Open {
            source: BlockHash::digest(b"source"),
            representative: Account::from_bytes(hash(b"rep")),
            account: Account::from_bytes(hash(b"account")),
        };
        assert_eq!(open.root().as_account(), open.account());
        assert!(open.previous().is_zero());

        let state = sample_state();
        assert_eq!(state.root().as_hash(), state.previous());
    }
}
