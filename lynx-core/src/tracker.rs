//! Tracker client: find a lynk's swarm, failing over to peers for a fresher tracker address.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{LynkError, Result};
use crate::lynk::Peer;
use crate::peers::PeerDirectory;
use crate::wire::{self, Request};

pub struct TrackerClient {
    peers: Arc<PeerDirectory>,
    self_ip: String,
    server_port: u16,
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl TrackerClient {
    pub fn new(
        peers: Arc<PeerDirectory>,
        self_ip: impl Into<String>,
        server_port: u16,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Self {
        Self {
            peers,
            self_ip: self_ip.into(),
            server_port,
            connect_timeout,
            read_timeout,
        }
    }

    pub fn from_config(config: &Config, peers: Arc<PeerDirectory>) -> Self {
        Self::new(
            peers,
            config.self_ip().to_string(),
            config.server_port,
            config.connect_timeout(),
            config.read_timeout(),
        )
    }

    pub fn peers(&self) -> &Arc<PeerDirectory> {
        &self.peers
    }

    /// Ask the tracker for the lynk's swarm and record every peer it lists.
    ///
    /// The peer set is rebuilt from the reply; EOF from the tracker ends the list.
    pub async fn discover_peers(&self, lynk: &str, tracker_addr: &str) -> Result<Vec<Peer>> {
        let stream = self.resolve_tracker(lynk, tracker_addr).await?;
        let (reader, mut writer) = stream.into_split();
        let request = Request::SwarmRequest {
            ip: self.self_ip.clone(),
            port: self.server_port,
            lynk: lynk.to_string(),
        };
        writer.write_all(request.encode().as_bytes()).await?;
        writer.flush().await?;

        self.peers.reset(lynk);
        let mut reader = BufReader::new(reader);
        loop {
            match wire::read_line(&mut reader, self.read_timeout).await {
                Ok(Some(line)) => match wire::parse_peer_line(&line) {
                    Some(peer) => {
                        self.peers.add_if_absent(lynk, peer);
                    }
                    None => debug!("Ignoring tracker line {:?}", line),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!("Swarm reply for {} cut short: {}", lynk, e);
                    break;
                }
            }
        }
        let peers = self.peers.peers_of(lynk);
        info!("Swarm for {}: {} peer(s)", lynk, peers.len());
        Ok(peers)
    }

    /// Connect to the recorded tracker, else to the first tracker address a known peer
    /// hands back. Per-peer failures only move on to the next peer.
    pub async fn resolve_tracker(&self, lynk: &str, tracker_addr: &str) -> Result<TcpStream> {
        match wire::connect(tracker_addr, self.connect_timeout).await {
            Ok(stream) => return Ok(stream),
            Err(e) => warn!("Tracker {} for {} unreachable: {}", tracker_addr, lynk, e),
        }
        for peer in self.peers.peers_of(lynk) {
            match self.tracker_via_peer(lynk, &peer).await {
                Ok((addr, stream)) => {
                    info!("Peer {} redirected {} to tracker {}", peer, lynk, addr);
                    return Ok(stream);
                }
                Err(e) => debug!("Peer {} gave no usable tracker: {}", peer, e),
            }
        }
        Err(LynkError::TrackerUnreachable(lynk.to_string()))
    }

    async fn tracker_via_peer(&self, lynk: &str, peer: &Peer) -> Result<(String, TcpStream)> {
        let stream = wire::connect(&peer.addr(), self.connect_timeout).await?;
        let (reader, mut writer) = stream.into_split();
        let request = Request::TrackerRequest {
            lynk: lynk.to_string(),
        };
        writer.write_all(request.encode().as_bytes()).await?;
        writer.flush().await?;
        let mut reader = BufReader::new(reader);
        let addr = wire::read_line(&mut reader, self.read_timeout)
            .await?
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .ok_or_else(|| LynkError::NotFound(format!("tracker address from {peer}")))?;
        let tracker = wire::connect(&addr, self.connect_timeout).await?;
        Ok((addr, tracker))
    }
}
