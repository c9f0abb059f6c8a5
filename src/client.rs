//! Client side of the realtime protocol: send one request to one or many
//! peers and collect the responses.

use crate::channel::Channel;
use crate::protocol::{Request, Response};
use crate::Result;

use tracing::debug;

use futures::FutureExt;
use std::net::SocketAddr;

/// Send a request to a peer and wait for its response.
pub async fn oneshot(ip: SocketAddr, request: Request) -> Result<Option<Response>> {
    let channel: Channel<Request, Response> = Channel::connect(&ip).await?;
    let (mut sender, mut receiver) = channel.split();
    let () = sender.send(request).await?;
    let response = receiver.recv().await?;
    Ok(response)
}

/// Send a request to many peers and collect the successful responses,
/// tagged by the peer that answered.
pub async fn fanout(ips: Vec<SocketAddr>, request: Request) -> Vec<(SocketAddr, Response)> {
    let mut client_futs = vec![];
    // Fan the request out concurrently and collect the client futures.
    for ip in ips.iter().cloned() {
        let request = request.clone();
        let client_fut =
            tokio::spawn(async move { (ip, err_to_none(oneshot(ip, request).await)) });
        client_futs.push(client_fut);
    }
    // Join the futures and keep the responses that arrived.
    futures::future::join_all(client_futs)
        .map(|results| {
            let mut responses = vec![];
            for r in results.into_iter() {
                match r {
                    Ok((ip, Some(response))) => responses.push((ip, response)),
                    Ok((_, None)) => (),
                    Err(err) => debug!("error joining client future: {:?}", err),
                }
            }
            responses
        })
        .await
}

/// Collapse errors into `None`; unreachable peers are normal during a crawl.
#[inline]
fn err_to_none<T>(x: Result<Option<T>>) -> Option<T> {
    match x {
        Ok(result) => result,
        Err(err) => {
            debug!("{:?}", err);
            None
        }
    }
}
