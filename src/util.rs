//! Utility functions shared across the node components.
use std::net::{SocketAddr, ToSocketAddrs};

use chrono::Utc;
use rand::seq::SliceRandom;

use crate::{Error, Result};

/// Wall clock seconds since the unix epoch, as stored in account records.
#[inline]
pub fn seconds_since_epoch() -> u64 {
    Utc::now().timestamp() as u64
}

/// Fraction of `qty` relative to `total`.
#[inline]
pub fn percent_of(qty: u128, total: u128) -> f64 {
    if total == 0 {
        0.0
    } else {
        qty as f64 / total as f64
    }
}

/// Parse a peer endpoint description (`IP:PORT` or a resolvable hostname).
pub fn parse_endpoint(s: &str) -> Result<SocketAddr> {
    s.to_socket_addrs()
        .map_err(|_| Error::PeerParseError)?
        .next()
        .ok_or(Error::PeerParseError)
}

/// Shuffle a slice in place with the thread rng.
pub fn shuffle<T>(items: &mut [T]) {
    let mut rng = rand::thread_rng();
    items.shuffle(&mut rng);
}

/// By convention a node's bootstrap listener sits one port above its
/// realtime listener.
pub fn bootstrap_endpoint(realtime: SocketAddr) -> SocketAddr {
    SocketAddr::new(realtime.ip(), realtime.port().wrapping_add(1))
}

/// Derive a deterministic ed25519 keypair from a seed phrase.
pub fn keypair_from_seed(seed: &[u8]) -> ed25519_dalek::Keypair {
    let secret = ed25519_dalek::SecretKey::from_bytes(&crate::ledger::types::hash(seed))
        .expect("32-byte digest is a valid secret key");
    let public = ed25519_dalek::PublicKey::from(&secret);
    ed25519_dalek::Keypair { secret, public }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[actix_rt::test]
    async fn test_parse_endpoint() {
        let addr: SocketAddr = "0.0.0.0:1111".parse().unwrap();
        assert_eq!(addr, parse_endpoint("0.0.0.0:1111").unwrap());

        match parse_endpoint("not-an-endpoint") {
            Err(Error::PeerParseError) => (),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[actix_rt::test]
    async fn test_percent_of() {
        assert_eq!(0.0, percent_of(1, 0));
        assert_eq!(0.5, percent_of(1, 2));
    }
}
