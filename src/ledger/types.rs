//! Account and block-hash identifiers.
//!
//! Both are 32-byte values. Accounts are public keys ordered by their numeric
//! (big-endian) value, which is the order the frontier exchange iterates them
//! in. The all-zero value is the "none / end of stream" sentinel throughout
//! the wire protocol.

use std::convert::TryInto;
use std::fmt;
use std::str::FromStr;

use base58check::{FromBase58Check, ToBase58Check};
use blake2::digest::{Update, VariableOutput};
use blake2::Blake2bVar;

/// Raw balance units carried by blocks and pending entries.
pub type Amount = u128;

/// Blake2b-256 of an input byte slice.
pub fn hash(input: &[u8]) -> [u8; 32] {
    let mut hasher = Blake2bVar::new(32).unwrap();
    hasher.update(input);
    let mut buf = [0u8; 32];
    hasher.finalize_variable(&mut buf).unwrap();
    buf
}

/// A public-key-identified chain of blocks.
///
/// Displayed using the Base58check format.
#[derive(Hash, Eq, PartialEq, Ord, PartialOrd, Copy, Clone, Serialize, Deserialize, Default)]
pub struct Account([u8; 32]);

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0.to_base58check(0))
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0.to_base58check(0))
    }
}

impl FromStr for Account {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, crate::Error> {
        let (vsn, bytes) = s.from_base58check().map_err(|_| crate::Error::TryFromStringError)?;
        if vsn != 0 {
            return Err(crate::Error::TryFromStringError);
        }
        let bytes: [u8; 32] =
            bytes.as_slice().try_into().map_err(|_| crate::Error::TryFromStringError)?;
        Ok(Account(bytes))
    }
}

impl Account {
    pub fn from_bytes(bytes: [u8; 32]) -> Account {
        Account(bytes)
    }

    /// The all-zeroes sentinel account.
    pub fn zero() -> Account {
        Account([0u8; 32])
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// The maximal (all `0xFF`) account value.
    pub fn max() -> Account {
        Account([255u8; 32])
    }

    pub fn bytes(&self) -> [u8; 32] {
        self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The next account by numeric value, or `None` past the maximum.
    ///
    /// Frontier iteration resumes from `successor` of the last seen account.
    pub fn successor(&self) -> Option<Account> {
        let mut bytes = self.0;
        for i in (0..32).rev() {
            if bytes[i] == 255 {
                bytes[i] = 0;
            } else {
                bytes[i] += 1;
                return Some(Account(bytes));
            }
        }
        None
    }
}

/// A 32-byte block identifier. The zero hash means "none".
///
/// Displayed as lowercase hex.
#[derive(Hash, Eq, PartialEq, Ord, PartialOrd, Copy, Clone, Serialize, Deserialize, Default)]
pub struct BlockHash([u8; 32]);

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl BlockHash {
    pub fn from_bytes(bytes: [u8; 32]) -> BlockHash {
        BlockHash(bytes)
    }

    /// Hash of an input byte slice.
    pub fn digest(input: &[u8]) -> BlockHash {
        BlockHash(hash(input))
    }

    pub fn zero() -> BlockHash {
        BlockHash([0u8; 32])
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    pub fn bytes(&self) -> [u8; 32] {
        self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// A 32-byte wire value which is either a block hash or an account; the
/// bulk-pull server resolves the interpretation against its ledger.
#[derive(Hash, Eq, PartialEq, Ord, PartialOrd, Copy, Clone, Serialize, Deserialize, Default)]
pub struct HashOrAccount([u8; 32]);

impl fmt::Debug for HashOrAccount {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self.as_hash())
    }
}

impl HashOrAccount {
    pub fn from_bytes(bytes: [u8; 32]) -> HashOrAccount {
        HashOrAccount(bytes)
    }

    pub fn zero() -> HashOrAccount {
        HashOrAccount([0u8; 32])
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    pub fn bytes(&self) -> [u8; 32] {
        self.0
    }

    pub fn as_hash(&self) -> BlockHash {
        BlockHash(self.0)
    }

    pub fn as_account(&self) -> Account {
        Account(self.0)
    }
}

impl From<BlockHash> for HashOrAccount {
    fn from(hash: BlockHash) -> Self {
        HashOrAccount(hash.bytes())
    }
}

impl From<Account> for HashOrAccount {
    fn from(account: Account) -> Self {
        HashOrAccount(account.bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[actix_rt::test]
    async fn test_account_order() {
        let mut a = [0u8; 32];
        a[31] = 1;
        let mut b = [0u8; 32];
        b[30] = 1;
        assert!(Account::from_bytes(a) < Account::from_bytes(b));
        assert!(Account::zero() < Account::from_bytes(a));
        assert!(Account::from_bytes(b) < Account::max());
    }

    #[actix_rt::test]
    async fn test_account_successor() {
        let zero = Account::zero();
        let one = zero.successor().unwrap();
        assert!(zero < one);
        assert_eq!(one.bytes()[31], 1);

        let mut carry = [0u8; 32];
        carry[31] = 255;
        let next = Account::from_bytes(carry).successor().unwrap();
        assert_eq!(next.bytes()[30], 1);
        assert_eq!(next.bytes()[31], 0);

        assert!(Account::max().successor().is_none());
    }

    #[actix_rt::test]
    async fn test_account_display_round_trip() {
        let account = Account::from_bytes(hash(b"an account"));
        let s = format!("{}", account);
        assert_eq!(account, s.parse().unwrap());
    }
}
