//! The realtime listener: one framed request/response per connection,
//! routed to the peer view and the vote responder.

pub mod router;
pub mod server;
pub mod settings;

pub use router::{Router, RouterRequest};
pub use server::Server;
pub use settings::Settings;
