//! Typed, length-delimited bincode channels over TCP, used by the realtime
//! message protocol (handshakes, confirm-requests and votes).

mod asymmetric;

pub use asymmetric::{Channel, Error, Receiver, Sender};
