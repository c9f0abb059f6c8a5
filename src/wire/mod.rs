//! Fixed-layout serialization of the bootstrap protocol.
//!
//! Every bootstrap exchange starts with a one-byte message kind followed by a
//! fixed-size header. Identifiers are raw 32-byte values, integers are
//! little-endian fixed-width. Responses stream: frontier pairs are 64-byte
//! records terminated by an all-zero pair, block streams are
//! tag + length + body records terminated by the `not_a_block` tag, pending
//! streams are 80-byte triples terminated by an all-zero triple.
//!
//! Encoding is infallible for valid objects. Decoding fails with
//! [Error::MalformedFrame](crate::Error::MalformedFrame) on a short read, an
//! unrecognized tag or an inconsistent length.

use crate::ledger::{Account, Amount, Block, BlockHash, BlockType, HashOrAccount};
use crate::{Error, Result};

use tokio::io::{AsyncRead, AsyncReadExt};

/// Stream terminator tag for block streams.
pub const NOT_A_BLOCK: u8 = 0;

/// Read exactly `N` bytes; a short read is a protocol violation.
async fn read_array<R: AsyncRead + Unpin, const N: usize>(reader: &mut R) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf).await.map_err(|err| match err.kind() {
        std::io::ErrorKind::UnexpectedEof => Error::MalformedFrame,
        _ => Error::IO(err),
    })?;
    Ok(buf)
}

async fn read_u8<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u8> {
    let buf = read_array::<_, 1>(reader).await?;
    Ok(buf[0])
}

async fn read_u32_le<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u32> {
    let buf = read_array::<_, 4>(reader).await?;
    Ok(u32::from_le_bytes(buf))
}

async fn read_u128_le<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u128> {
    let buf = read_array::<_, 16>(reader).await?;
    Ok(u128::from_le_bytes(buf))
}

/// Kind tag introducing each bootstrap request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    FrontierReq,
    BulkPull,
    BulkPullAccount,
    BulkPush,
}

impl MessageKind {
    pub fn as_u8(&self) -> u8 {
        match self {
            MessageKind::FrontierReq => 1,
            MessageKind::BulkPull => 2,
            MessageKind::BulkPullAccount => 3,
            MessageKind::BulkPush => 4,
        }
    }

    pub fn from_u8(tag: u8) -> Option<MessageKind> {
        match tag {
            1 => Some(MessageKind::FrontierReq),
            2 => Some(MessageKind::BulkPull),
            3 => Some(MessageKind::BulkPullAccount),
            4 => Some(MessageKind::BulkPush),
            _ => None,
        }
    }
}

/// `frontier_req`: start(32) ‖ age(u32) ‖ count(u32).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrontierReq {
    pub start: Account,
    /// Only accounts modified within `age` seconds are included; `u32::MAX`
    /// disables the filter.
    pub age: u32,
    pub count: u32,
}

impl FrontierReq {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(MessageKind::FrontierReq.as_u8());
        buf.extend_from_slice(self.start.as_bytes());
        buf.extend_from_slice(&self.age.to_le_bytes());
        buf.extend_from_slice(&self.count.to_le_bytes());
    }

    pub async fn decode<R: AsyncRead + Unpin>(reader: &mut R) -> Result<FrontierReq> {
        let start = Account::from_bytes(read_array::<_, 32>(reader).await?);
        let age = read_u32_le(reader).await?;
        let count = read_u32_le(reader).await?;
        Ok(FrontierReq { start, age, count })
    }
}

/// One record of a frontier response stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrontierPair {
    pub account: Account,
    pub frontier: BlockHash,
}

impl FrontierPair {
    pub const SIZE: usize = 64;

    /// The all-zero pair closing a frontier stream.
    pub fn terminator() -> FrontierPair {
        FrontierPair { account: Account::zero(), frontier: BlockHash::zero() }
    }

    pub fn is_terminator(&self) -> bool {
        self.account.is_zero() && self.frontier.is_zero()
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.account.as_bytes());
        buf.extend_from_slice(self.frontier.as_bytes());
    }

    pub async fn decode<R: AsyncRead + Unpin>(reader: &mut R) -> Result<FrontierPair> {
        let account = Account::from_bytes(read_array::<_, 32>(reader).await?);
        let frontier = BlockHash::from_bytes(read_array::<_, 32>(reader).await?);
        Ok(FrontierPair { account, frontier })
    }
}

/// `bulk_pull`: start(32) ‖ end(32) ‖ flags(1) ‖ count(u32).
///
/// `start` is an account unless it matches a known block hash; `count` is
/// meaningful only when bit 0 of the flags byte is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkPull {
    pub start: HashOrAccount,
    pub end: BlockHash,
    pub count_present: bool,
    pub count: u32,
}

const BULK_PULL_COUNT_PRESENT: u8 = 0x01;

impl BulkPull {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(MessageKind::BulkPull.as_u8());
        buf.extend_from_slice(&self.start.bytes());
        buf.extend_from_slice(self.end.as_bytes());
        buf.push(if self.count_present { BULK_PULL_COUNT_PRESENT } else { 0 });
        buf.extend_from_slice(&self.count.to_le_bytes());
    }

    pub async fn decode<R: AsyncRead + Unpin>(reader: &mut R) -> Result<BulkPull> {
        let start = HashOrAccount::from_bytes(read_array::<_, 32>(reader).await?);
        let end = BlockHash::from_bytes(read_array::<_, 32>(reader).await?);
        let flags = read_u8(reader).await?;
        if flags & !BULK_PULL_COUNT_PRESENT != 0 {
            return Err(Error::MalformedFrame);
        }
        let count_present = flags & BULK_PULL_COUNT_PRESENT != 0;
        let count = read_u32_le(reader).await?;
        Ok(BulkPull { start, end, count_present, count })
    }

    /// The effective block cap, `None` when unbounded.
    pub fn cap(&self) -> Option<u32> {
        if self.count_present && self.count > 0 {
            Some(self.count)
        } else {
            None
        }
    }
}

/// Response mode of a `bulk_pull_account` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkPullAccountFlags {
    /// Emit `(hash, amount, source)` triples.
    PendingHashAndAmount,
    /// Emit only the unique sending addresses.
    PendingAddressOnly,
}

impl BulkPullAccountFlags {
    pub fn as_u8(&self) -> u8 {
        match self {
            BulkPullAccountFlags::PendingHashAndAmount => 0,
            BulkPullAccountFlags::PendingAddressOnly => 1,
        }
    }

    pub fn from_u8(tag: u8) -> Option<BulkPullAccountFlags> {
        match tag {
            0 => Some(BulkPullAccountFlags::PendingHashAndAmount),
            1 => Some(BulkPullAccountFlags::PendingAddressOnly),
            _ => None,
        }
    }
}

/// `bulk_pull_account`: account(32) ‖ minimum_amount(16) ‖ flags(1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkPullAccount {
    pub account: Account,
    pub minimum_amount: Amount,
    pub flags: BulkPullAccountFlags,
}

impl BulkPullAccount {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(MessageKind::BulkPullAccount.as_u8());
        buf.extend_from_slice(self.account.as_bytes());
        buf.extend_from_slice(&self.minimum_amount.to_le_bytes());
        buf.push(self.flags.as_u8());
    }

    pub async fn decode<R: AsyncRead + Unpin>(reader: &mut R) -> Result<BulkPullAccount> {
        let account = Account::from_bytes(read_array::<_, 32>(reader).await?);
        let minimum_amount = read_u128_le(reader).await?;
        let flags =
            BulkPullAccountFlags::from_u8(read_u8(reader).await?).ok_or(Error::MalformedFrame)?;
        Ok(BulkPullAccount { account, minimum_amount, flags })
    }
}

/// One record of a pending (receivable) response stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingEntry {
    pub hash: BlockHash,
    pub amount: Amount,
    pub source: Account,
}

impl PendingEntry {
    pub fn terminator() -> PendingEntry {
        PendingEntry { hash: BlockHash::zero(), amount: 0, source: Account::zero() }
    }

    pub fn is_terminator(&self) -> bool {
        self.hash.is_zero() && self.amount == 0 && self.source.is_zero()
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.hash.as_bytes());
        buf.extend_from_slice(&self.amount.to_le_bytes());
        buf.extend_from_slice(self.source.as_bytes());
    }

    pub async fn decode<R: AsyncRead + Unpin>(reader: &mut R) -> Result<PendingEntry> {
        let hash = BlockHash::from_bytes(read_array::<_, 32>(reader).await?);
        let amount = read_u128_le(reader).await?;
        let source = Account::from_bytes(read_array::<_, 32>(reader).await?);
        Ok(PendingEntry { hash, amount, source })
    }
}

/// A decoded bootstrap request, as the listener dispatches it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapRequest {
    Frontier(FrontierReq),
    BulkPull(BulkPull),
    BulkPullAccount(BulkPullAccount),
    BulkPush,
}

impl BootstrapRequest {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            BootstrapRequest::Frontier(req) => req.encode(buf),
            BootstrapRequest::BulkPull(req) => req.encode(buf),
            BootstrapRequest::BulkPullAccount(req) => req.encode(buf),
            BootstrapRequest::BulkPush => buf.push(MessageKind::BulkPush.as_u8()),
        }
    }

    pub async fn decode<R: AsyncRead + Unpin>(reader: &mut R) -> Result<BootstrapRequest> {
        let kind = MessageKind::from_u8(read_u8(reader).await?).ok_or(Error::MalformedFrame)?;
        let request = match kind {
            MessageKind::FrontierReq => {
                BootstrapRequest::Frontier(FrontierReq::decode(reader).await?)
            }
            MessageKind::BulkPull => BootstrapRequest::BulkPull(BulkPull::decode(reader).await?),
            MessageKind::BulkPullAccount => {
                BootstrapRequest::BulkPullAccount(BulkPullAccount::decode(reader).await?)
            }
            MessageKind::BulkPush => BootstrapRequest::BulkPush,
        };
        Ok(request)
    }
}

/// Append one block record: tag ‖ length(u32) ‖ body.
pub fn encode_block(block: &Block, buf: &mut Vec<u8>) {
    let block_type = block.block_type();
    buf.push(block_type.as_u8());
    buf.extend_from_slice(&(block_type.body_size() as u32).to_le_bytes());
    block.serialize_body(buf);
}

/// Append the `not_a_block` stream terminator.
pub fn encode_block_terminator(buf: &mut Vec<u8>) {
    buf.push(NOT_A_BLOCK);
}

/// Read one block record; `None` is the stream terminator.
pub async fn read_block<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Block>> {
    let tag = read_u8(reader).await?;
    if tag == NOT_A_BLOCK {
        return Ok(None);
    }
    let block_type = BlockType::from_u8(tag).ok_or(Error::MalformedFrame)?;
    let len = read_u32_le(reader).await? as usize;
    if len != block_type.body_size() {
        return Err(Error::MalformedFrame);
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|err| match err.kind() {
        std::io::ErrorKind::UnexpectedEof => Error::MalformedFrame,
        _ => Error::IO(err),
    })?;
    let block = Block::deserialize_body(block_type, &body)?;
    Ok(Some(block))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::types::hash;

    fn sample_block() -> Block {
        Block::Send {
            previous: BlockHash::digest(b"previous"),
            destination: Account::from_bytes(hash(b"destination")),
            balance: 12_345,
        }
    }

    #[actix_rt::test]
    async fn test_request_round_trip() {
        let requests = vec![
            BootstrapRequest::Frontier(FrontierReq {
                start: Account::from_bytes(hash(b"start")),
                age: u32::MAX,
                count: 1000,
            }),
            BootstrapRequest::BulkPull(BulkPull {
                start: HashOrAccount::from(BlockHash::digest(b"head")),
                end: BlockHash::digest(b"end"),
                count_present: true,
                count: 2,
            }),
            BootstrapRequest::BulkPullAccount(BulkPullAccount {
                account: Account::from_bytes(hash(b"account")),
                minimum_amount: 10,
                flags: BulkPullAccountFlags::PendingAddressOnly,
            }),
            BootstrapRequest::BulkPush,
        ];
        for request in requests {
            let mut buf = vec![];
            request.encode(&mut buf);
            let mut reader = std::io::Cursor::new(buf);
            let decoded = BootstrapRequest::decode(&mut reader).await.unwrap();
            assert_eq!(request, decoded);
        }
    }

    #[actix_rt::test]
    async fn test_block_stream_round_trip() {
        let block = sample_block();
        let mut buf = vec![];
        encode_block(&block, &mut buf);
        encode_block_terminator(&mut buf);

        let mut reader = std::io::Cursor::new(buf);
        assert_eq!(Some(block), read_block(&mut reader).await.unwrap());
        assert_eq!(None, read_block(&mut reader).await.unwrap());
    }

    #[actix_rt::test]
    async fn test_unknown_tags_rejected() {
        let mut reader = std::io::Cursor::new(vec![0xffu8; 16]);
        match BootstrapRequest::decode(&mut reader).await {
            Err(Error::MalformedFrame) => (),
            other => panic!("unexpected: {:?}", other),
        }

        let mut reader = std::io::Cursor::new(vec![9u8, 0, 0, 0, 0]);
        match read_block(&mut reader).await {
            Err(Error::MalformedFrame) => (),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[actix_rt::test]
    async fn test_short_read_is_malformed() {
        let block = sample_block();
        let mut buf = vec![];
        encode_block(&block, &mut buf);
        buf.truncate(buf.len() - 3);
        let mut reader = std::io::Cursor::new(buf);
        match read_block(&mut reader).await {
            Err(Error::MalformedFrame) => (),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[actix_rt::test]
    async fn test_inconsistent_length_rejected() {
        let block = sample_block();
        let mut buf = vec![];
        encode_block(&block, &mut buf);
        // Corrupt the length field.
        buf[1] = buf[1].wrapping_add(1);
        let mut reader = std::io::Cursor::new(buf);
        match read_block(&mut reader).await {
            Err(Error::MalformedFrame) => (),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[actix_rt::test]
    async fn test_frontier_pair_terminator() {
        let pair = FrontierPair::terminator();
        assert!(pair.is_terminator());
        let mut buf = vec![];
        pair.encode(&mut buf);
        assert_eq!(FrontierPair::SIZE, buf.len());
        let mut reader = std::io::Cursor::new(buf);
        assert!(FrontierPair::decode(&mut reader).await.unwrap().is_terminator());
    }
}
