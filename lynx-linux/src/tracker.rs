//! Minimal in-memory tracker: swarm membership per lynk, lost on restart.

use std::sync::Arc;
use std::time::Duration;

use lynx_core::wire::{self, Request};
use lynx_core::{Peer, PeerDirectory};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

/// Accept loop for `Swarm_Request` lines. Each requester joins the lynk's swarm and is
/// sent every other member, then the connection is closed.
pub async fn run_tracker(
    listener: TcpListener,
    swarms: Arc<PeerDirectory>,
    read_timeout: Duration,
) -> anyhow::Result<()> {
    info!("Tracker listening on {}", listener.local_addr()?);
    loop {
        let (stream, remote) = listener.accept().await?;
        let swarms = swarms.clone();
        tokio::spawn(async move {
            if let Err(e) = handle(stream, &swarms, read_timeout).await {
                debug!("Tracker connection {} ended: {}", remote, e);
            }
        });
    }
}

async fn handle(
    stream: TcpStream,
    swarms: &PeerDirectory,
    read_timeout: Duration,
) -> lynx_core::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let Some(line) = wire::read_line(&mut reader, read_timeout).await? else {
        return Ok(());
    };
    let Some(Request::SwarmRequest { ip, port, lynk }) = Request::parse(&line) else {
        debug!("Tracker ignoring {:?}", line);
        return Ok(());
    };
    let requester = Peer::new(ip, port);
    if swarms.add_if_absent(&lynk, requester.clone()) {
        info!("{} joined swarm {}", requester, lynk);
    }
    let reply: String = swarms
        .peers_of(&lynk)
        .iter()
        .filter(|p| **p != requester)
        .map(wire::encode_peer_line)
        .collect();
    writer.write_all(reply.as_bytes()).await?;
    writer.shutdown().await?;
    Ok(())
}
