//! The bootstrap-protocol listener: accepts connections, decodes requests
//! and runs the matching server half. Clients pool and reuse connections, so
//! one socket may carry several requests back to back.

use super::{bulk_pull, bulk_push, frontier};
use crate::ledger::Ledger;
use crate::process::BlockProcessor;
use crate::wire::BootstrapRequest;
use crate::{Error, Result};

use tracing::{debug, info};

use colored::Colorize;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};

use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Clone)]
pub struct BootstrapListener {
    pub ip: SocketAddr,
    ledger: Arc<Ledger>,
    processor: BlockProcessor,
    io_timeout: Duration,
    /// How long a pooled client socket may sit quiet between requests.
    request_timeout: Duration,
}

impl BootstrapListener {
    pub fn new(
        ip: SocketAddr,
        ledger: Arc<Ledger>,
        processor: BlockProcessor,
        io_timeout: Duration,
        request_timeout: Duration,
    ) -> BootstrapListener {
        BootstrapListener { ip, ledger, processor, io_timeout, request_timeout }
    }

    /// Bind and serve until the task is dropped.
    pub async fn listen(self) -> Result<()> {
        let listener = TcpListener::bind(&self.ip).await?;
        info!("[{}] listening on {:?}", "bootstrap".cyan(), self.ip);
        loop {
            let (stream, remote) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(err) = server.process_stream(stream).await {
                    debug!("bootstrap connection from {:?} closed: {:?}", remote, err);
                }
            });
        }
    }

    /// Serve requests off one socket until the peer goes quiet or violates
    /// the protocol.
    async fn process_stream(&self, mut stream: TcpStream) -> Result<()> {
        loop {
            let request =
                match timeout(self.request_timeout, BootstrapRequest::decode(&mut stream)).await {
                    Ok(Ok(request)) => request,
                    // Idle or closed between requests; a normal end of life
                    // for a pooled connection.
                    Ok(Err(Error::MalformedFrame)) => return Ok(()),
                    Ok(Err(err)) => return Err(err),
                    Err(_) => return Ok(()),
                };
            match request {
                BootstrapRequest::Frontier(req) => {
                    frontier::serve_frontiers(&mut stream, &self.ledger, req, self.io_timeout)
                        .await?
                }
                BootstrapRequest::BulkPull(req) => {
                    bulk_pull::serve_bulk_pull(&mut stream, &self.ledger, req, self.io_timeout)
                        .await?
                }
                BootstrapRequest::BulkPullAccount(req) => {
                    bulk_pull::serve_bulk_pull_account(
                        &mut stream,
                        &self.ledger,
                        req,
                        self.io_timeout,
                    )
                    .await?
                }
                BootstrapRequest::BulkPush => {
                    let received =
                        bulk_push::serve_bulk_push(&mut stream, &self.processor, self.io_timeout)
                            .await?;
                    debug!("bulk push upload of {} blocks accepted", received);
                }
            }
        }
    }
}
