//! The realtime network message protocol.
//!
//! One request/response pair per connection, carried over the framed bincode
//! [Channel](crate::channel::Channel). The bootstrap protocol does not pass
//! through here; it has its own fixed-layout codec in [wire](crate::wire) and
//! its own listener.

use crate::message;

#[derive(Debug, Clone, Serialize, Deserialize, Message)]
#[rtype(result = "Response")]
pub enum Request {
    // Handshake
    Version(message::Version),
    // Representative crawler
    ConfirmReq(message::ConfirmReq),
}

#[derive(Debug, Clone, Serialize, Deserialize, MessageResponse)]
pub enum Response {
    // Handshake
    VersionAck(message::VersionAck),
    // Representative crawler
    ConfirmAck(message::ConfirmAck),
    /// The peer had nothing to answer with (e.g. it holds no voting key).
    Empty,
}
