use crate::ledger::{BlockHash, Ledger};
use crate::message::{ConfirmAck, Vote};
use crate::protocol::{Request, Response};
use crate::util;
use crate::view::View;

use tracing::{debug, info};

use actix::{Actor, Addr, Context, Handler, ResponseFuture};
use ed25519_dalek::Keypair;

use std::sync::Arc;

/// Routes realtime requests: handshakes to the view, confirm-requests to
/// the local vote responder.
pub struct Router {
    view: Addr<View>,
    ledger: Arc<Ledger>,
    /// Present on nodes that vote (hold a representative key).
    voting_key: Option<Arc<Keypair>>,
}

impl Router {
    pub fn new(view: Addr<View>, ledger: Arc<Ledger>, voting_key: Option<Arc<Keypair>>) -> Self {
        Router { view, ledger, voting_key }
    }
}

impl Actor for Router {
    type Context = Context<Self>;

    fn started(&mut self, _ctx: &mut Context<Self>) {
        debug!("router started");
    }
}

#[derive(Debug, Clone, Message)]
#[rtype(result = "Response")]
pub struct RouterRequest {
    pub request: Request,
}

impl Handler<RouterRequest> for Router {
    type Result = ResponseFuture<Response>;

    fn handle(&mut self, msg: RouterRequest, _ctx: &mut Context<Self>) -> Self::Result {
        let view = self.view.clone();
        let ledger = self.ledger.clone();
        let voting_key = self.voting_key.clone();
        Box::pin(async move {
            match msg.request {
                Request::Version(version) => {
                    info!("routing Version -> View");
                    match view.send(version).await {
                        Ok(ack) => Response::VersionAck(ack),
                        Err(_) => Response::Empty,
                    }
                }
                Request::ConfirmReq(req) => {
                    // Vote over the requested hashes this node can vouch
                    // for.
                    let keypair = match voting_key {
                        Some(keypair) => keypair,
                        None => return Response::Empty,
                    };
                    let known: Vec<BlockHash> = req
                        .hash_roots
                        .iter()
                        .map(|(hash, _root)| *hash)
                        .filter(|hash| ledger.block_or_pruned_exists(hash).unwrap_or(false))
                        .collect();
                    if known.is_empty() {
                        return Response::Empty;
                    }
                    let vote = Vote::sign(&keypair, util::seconds_since_epoch(), known);
                    Response::ConfirmAck(ConfirmAck { vote })
                }
            }
        })
    }
}
