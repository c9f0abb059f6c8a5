//! Realtime protocol messages: the version handshake that populates the peer
//! table, and the confirm-request / vote exchange the representative crawler
//! runs over it.

use crate::ledger::types::hash;
use crate::ledger::{Account, BlockHash, HashOrAccount};
use crate::{Error, Result};

use ed25519_dalek::{Keypair, PublicKey, Signature, Signer};

use std::convert::TryFrom;
use std::net::SocketAddr;

/// Handshake sent when contacting a peer; the responder registers the sender
/// in its peer table.
#[derive(Debug, Clone, Serialize, Deserialize, Message)]
#[rtype(result = "VersionAck")]
pub struct Version {
    pub ip: SocketAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize, MessageResponse)]
pub struct VersionAck {
    pub ip: SocketAddr,
    pub peer_list: Vec<SocketAddr>,
}

/// A challenge asking a peer to vote on the listed hash/root pairs.
#[derive(Debug, Clone, Serialize, Deserialize, Message)]
#[rtype(result = "ConfirmAckResult")]
pub struct ConfirmReq {
    pub hash_roots: Vec<(BlockHash, HashOrAccount)>,
}

/// A vote over a set of hashes, answering a confirm-request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmAck {
    pub vote: Vote,
}

#[derive(Debug, Clone, Serialize, Deserialize, MessageResponse)]
pub struct ConfirmAckResult {
    pub ack: Option<ConfirmAck>,
}

/// A signed statement by a representative that it has seen the listed hashes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    /// The voting account (an ed25519 public key).
    pub account: Account,
    pub signature: Vec<u8>,
    pub timestamp: u64,
    pub hashes: Vec<BlockHash>,
}

impl Vote {
    fn digest(timestamp: u64, hashes: &[BlockHash]) -> [u8; 32] {
        let mut buf = Vec::with_capacity(8 + hashes.len() * 32);
        buf.extend_from_slice(&timestamp.to_le_bytes());
        for h in hashes.iter() {
            buf.extend_from_slice(h.as_bytes());
        }
        hash(&buf)
    }

    pub fn sign(keypair: &Keypair, timestamp: u64, hashes: Vec<BlockHash>) -> Vote {
        let digest = Self::digest(timestamp, &hashes);
        let signature = keypair.sign(&digest);
        Vote {
            account: Account::from_bytes(keypair.public.to_bytes()),
            signature: signature.to_bytes().to_vec(),
            timestamp,
            hashes,
        }
    }

    /// Verify the vote's signature against its account key.
    pub fn validate(&self) -> Result<()> {
        let public = PublicKey::from_bytes(&self.account.bytes())?;
        let bytes: &[u8] = &self.signature;
        let signature = Signature::try_from(bytes).map_err(|_| Error::InvalidResponse)?;
        let digest = Self::digest(self.timestamp, &self.hashes);
        public.verify_strict(&digest, &signature)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::keypair_from_seed;

    #[actix_rt::test]
    async fn test_vote_sign_validate() {
        let keypair = keypair_from_seed(b"voter");
        let hashes = vec![BlockHash::digest(b"one"), BlockHash::digest(b"two")];
        let vote = Vote::sign(&keypair, 7, hashes.clone());
        assert_eq!(vote.hashes, hashes);
        vote.validate().unwrap();

        // Tampering invalidates the signature.
        let mut forged = vote.clone();
        forged.hashes.push(BlockHash::digest(b"three"));
        assert!(forged.validate().is_err());
    }
}
