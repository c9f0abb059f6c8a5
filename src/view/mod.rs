//! The peer table: the most up to date set of peer endpoints, with uniform
//! random sampling for the representative crawler.

mod sampleable_map;
mod view;

pub use sampleable_map::SampleableMap;
pub use view::{ContainsPeer, GetPeers, InsertPeer, PeersResult, SampleK, SampleResult, View};
