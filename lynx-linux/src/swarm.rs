//! Swarm operations backed by this daemon's tracker and the lynk's recorded tracker.

use std::path::Path;
use std::sync::Arc;

use lynx_core::{manifest, Config, Peer, PeerDirectory, SwarmService, TrackerClient};
use tracing::{debug, info};

pub struct TrackerSwarm {
    /// Membership table served by our own tracker.
    local: Arc<PeerDirectory>,
    me: Peer,
    client: TrackerClient,
}

impl TrackerSwarm {
    /// `peers` is the node's peer directory, so tracker failover can ask known peers.
    pub fn new(config: &Config, local: Arc<PeerDirectory>, peers: Arc<PeerDirectory>) -> Self {
        Self {
            local,
            me: Peer::new(config.self_ip().to_string(), config.server_port),
            client: TrackerClient::from_config(config, peers),
        }
    }
}

impl SwarmService for TrackerSwarm {
    /// Re-announce ourselves to the lynk's tracker so the swarm knows we hold the new
    /// manifest.
    async fn push_meta(&self, manifest_path: &Path) -> lynx_core::Result<()> {
        let m = manifest::parse(manifest_path)?;
        let peers = self.client.discover_peers(&m.name, &m.tracker).await?;
        info!(
            "Pushed {} manifest ({} file(s)); {} other peer(s) in swarm",
            m.name,
            m.files.len(),
            peers.len()
        );
        Ok(())
    }

    async fn create_swarm(&self, lynk: &str) -> lynx_core::Result<()> {
        if self.local.add_if_absent(lynk, self.me.clone()) {
            info!("Created swarm {} seeded with {}", lynk, self.me);
        } else {
            debug!("Swarm {} already seeded", lynk);
        }
        Ok(())
    }
}
