//! # Tundra
//!
//! Tundra is the bootstrap machinery of an account-chain ledger node: the
//! components that bring a freshly started (or lagging) node into convergence
//! with the network by pulling blocks from peers over a framed binary
//! protocol.
//!
//! ## Bootstrap
//!
//! Bootstrap attempts come in three modes. A `legacy` attempt requests the
//! peer's frontier set, turns the divergences into bulk pulls and finishes by
//! pushing back the blocks the peer lacks. A `lazy` attempt walks block
//! dependencies recursively from a seed hash. A `wallet_lazy` attempt seeds
//! the lazy walk from a set of accounts of interest.
//!
//! ## Representative crawler
//!
//! The crawler probes peers with confirm-requests to learn their weighted
//! identity. Legacy attempts consult it before trusting a peer's frontier
//! set.

#[macro_use]
extern crate serde_derive;
#[macro_use]
extern crate actix_derive;
extern crate colored;

pub mod channel;
pub mod client;
pub mod message;
pub mod protocol;
pub mod server;
pub mod util;

pub mod ledger;
pub mod process;
pub mod view;
pub mod wire;

pub mod bootstrap;
pub mod node;
pub mod rep_crawler;

#[cfg(test)]
mod integration_test;

use protocol::{Request, Response};

#[derive(Debug)]
pub enum Error {
    IO(std::io::Error),
    Sled(sled::Error),
    Bincode(bincode::Error),
    Actix(actix::MailboxError),
    Dalek(ed25519_dalek::ed25519::Error),

    // client errors
    InvalidResponse,
    EmptyResponse,
    ChannelError(String),

    // wire errors
    MalformedFrame,

    // bootstrap errors
    SlowStream,
    FrontierUnconfirmed,
    AttemptStopped,
    Timeout,
    PeerExcluded,

    // ledger errors
    GenesisUndefined,
    BlockNotFound,
    AccountNotFound,

    /// Error caused by converting from a `String` to an account or hash
    TryFromStringError,
    /// Error when parsing a peer endpoint description
    PeerParseError,
}

impl std::error::Error for Error {}

impl std::convert::From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::IO(error)
    }
}

impl std::convert::From<sled::Error> for Error {
    fn from(error: sled::Error) -> Self {
        Error::Sled(error)
    }
}

impl std::convert::From<bincode::Error> for Error {
    fn from(error: bincode::Error) -> Self {
        Error::Bincode(error)
    }
}

impl std::convert::From<actix::MailboxError> for Error {
    fn from(error: actix::MailboxError) -> Self {
        Error::Actix(error)
    }
}

impl std::convert::From<ed25519_dalek::ed25519::Error> for Error {
    fn from(error: ed25519_dalek::ed25519::Error) -> Self {
        Error::Dalek(error)
    }
}

impl std::convert::From<tokio::time::error::Elapsed> for Error {
    fn from(_error: tokio::time::error::Elapsed) -> Self {
        Error::Timeout
    }
}

impl std::convert::From<channel::Error<Request, Response>> for Error {
    fn from(error: channel::Error<Request, Response>) -> Self {
        match error {
            channel::Error::IO(io_err) => Error::IO(io_err),
            channel::Error::ReadError(err) => {
                let s = format!("{:?}", err);
                Error::ChannelError(s)
            }
            channel::Error::WriteError(err) => {
                let s = format!("{:?}", err);
                Error::ChannelError(s)
            }
        }
    }
}

impl std::convert::From<channel::Error<Response, Request>> for Error {
    fn from(error: channel::Error<Response, Request>) -> Self {
        match error {
            channel::Error::IO(io_err) => Error::IO(io_err),
            channel::Error::ReadError(err) => {
                let s = format!("{:?}", err);
                Error::ChannelError(s)
            }
            channel::Error::WriteError(err) => {
                let s = format!("{:?}", err);
                Error::ChannelError(s)
            }
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
