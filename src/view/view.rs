use super::sampleable_map::SampleableMap;

use crate::message::{Version, VersionAck};
use crate::util;

use tracing::debug;

use actix::{Actor, Context, Handler};

use std::net::SocketAddr;

/// Peers handed out in a version ack.
const PEER_LIST_MAX: usize = 8;

/// The view contains the most up to date set of peer endpoints.
#[derive(Debug)]
pub struct View {
    ip: SocketAddr,
    peers: SampleableMap<SocketAddr, u64>,
}

impl View {
    pub fn new(ip: SocketAddr) -> Self {
        Self { ip, peers: SampleableMap::new() }
    }

    /// Seed the view with the configured bootstrap peers.
    pub fn init(&mut self, ips: Vec<SocketAddr>) {
        for ip in ips.iter() {
            if self.insert_update(*ip) {
                debug!("seeded peer {:?}", ip);
            }
        }
    }

    // Returns whether the peer was newly inserted.
    fn insert_update(&mut self, ip: SocketAddr) -> bool {
        if ip == self.ip {
            return false;
        }
        self.peers.insert(ip, util::seconds_since_epoch()).is_none()
    }
}

impl Actor for View {
    type Context = Context<Self>;

    fn started(&mut self, _ctx: &mut Context<Self>) {
        debug!(": started")
    }
}

impl Handler<Version> for View {
    type Result = VersionAck;

    fn handle(&mut self, msg: Version, _ctx: &mut Context<Self>) -> Self::Result {
        let _ = self.insert_update(msg.ip);

        let peer_list =
            self.peers.sample(PEER_LIST_MAX).iter().map(|(ip, _)| *ip).collect();
        VersionAck { ip: self.ip, peer_list }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Message)]
#[rtype(result = "PeersResult")]
pub struct GetPeers;

#[derive(Debug, Clone, Serialize, Deserialize, MessageResponse)]
pub struct PeersResult {
    pub peers: Vec<SocketAddr>,
}

impl Handler<GetPeers> for View {
    type Result = PeersResult;

    fn handle(&mut self, _msg: GetPeers, _ctx: &mut Context<Self>) -> Self::Result {
        let peers = self.peers.iter().map(|(ip, _)| *ip).collect();
        PeersResult { peers }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Message)]
#[rtype(result = "SampleResult")]
pub struct SampleK {
    pub k: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, MessageResponse)]
pub struct SampleResult {
    pub sample: Vec<SocketAddr>,
}

impl Handler<SampleK> for View {
    type Result = SampleResult;

    fn handle(&mut self, msg: SampleK, _ctx: &mut Context<Self>) -> Self::Result {
        let sample = self.peers.sample(msg.k).iter().map(|(ip, _)| *ip).collect();
        SampleResult { sample }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Message)]
#[rtype(result = "bool")]
pub struct ContainsPeer {
    pub ip: SocketAddr,
}

impl Handler<ContainsPeer> for View {
    type Result = bool;

    fn handle(&mut self, msg: ContainsPeer, _ctx: &mut Context<Self>) -> Self::Result {
        self.peers.contains_key(&msg.ip)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Message)]
#[rtype(result = "bool")]
pub struct InsertPeer {
    pub ip: SocketAddr,
}

impl Handler<InsertPeer> for View {
    type Result = bool;

    fn handle(&mut self, msg: InsertPeer, _ctx: &mut Context<Self>) -> Self::Result {
        self.insert_update(msg.ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix::Actor;

    #[actix_rt::test]
    async fn test_version_registers_peer() {
        let self_ip: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let peer_ip: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        let view = View::new(self_ip).start();

        let ack = view.send(Version { ip: peer_ip }).await.unwrap();
        assert_eq!(self_ip, ack.ip);

        assert!(view.send(ContainsPeer { ip: peer_ip }).await.unwrap());
        assert!(!view.send(ContainsPeer { ip: self_ip }).await.unwrap());

        let peers = view.send(GetPeers).await.unwrap().peers;
        assert_eq!(vec![peer_ip], peers);
    }

    #[actix_rt::test]
    async fn test_self_never_inserted() {
        let self_ip: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let view = View::new(self_ip).start();
        assert!(!view.send(InsertPeer { ip: self_ip }).await.unwrap());
        assert!(view.send(GetPeers).await.unwrap().peers.is_empty());
    }
}
