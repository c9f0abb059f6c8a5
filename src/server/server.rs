use super::router::{Router, RouterRequest};
use crate::channel::Channel;
use crate::protocol::{Request, Response};
use crate::{Error, Result};

use tracing::{debug, error, info};

use actix::Addr;
use actix_rt::net::TcpStream;
use actix_service::fn_service;

use std::net::SocketAddr;

/// Accepts realtime connections and serves one request per connection.
pub struct Server {
    /// The ip address which this server binds to.
    ip: SocketAddr,
    router: Addr<Router>,
}

impl Server {
    pub fn new(ip: SocketAddr, router: Addr<Router>) -> Server {
        Server { ip, router }
    }

    // Starts an actix server that listens for incoming connections.
    pub async fn listen(&self) -> Result<()> {
        let ip = self.ip;
        let router = self.router.clone();
        info!("listening on {:?}", ip);

        actix_server::Server::build()
            .bind("listener", ip, move || {
                let router = router.clone();

                // one service process per incoming connection
                fn_service(move |stream: TcpStream| {
                    let router = router.clone();
                    async move { Server::process_stream(stream, router).await }
                })
            })?
            .run()
            .await
            .map_err(Error::IO)
    }

    async fn process_stream(stream: TcpStream, router: Addr<Router>) -> Result<()> {
        let channel: Channel<Response, Request> = Channel::wrap(stream)?;
        let (mut sender, mut receiver) = channel.split();
        match receiver.recv().await? {
            Some(request) => {
                let response = router.send(RouterRequest { request }).await?;
                sender.send(response).await?;
            }
            None => debug!("connection closed before a request arrived"),
        }
        Ok(())
    }
}

/// Bind-and-serve wrapper suitable for spawning.
pub async fn listen(ip: SocketAddr, router: Addr<Router>) {
    let server = Server::new(ip, router);
    if let Err(err) = server.listen().await {
        error!("realtime server on {:?} exited: {:?}", ip, err);
    }
}
