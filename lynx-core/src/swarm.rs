//! Swarm-side collaborators the core calls out to.

use std::future::Future;
use std::path::Path;

use crate::error::Result;

/// Tracker-side swarm operations provided by the host.
pub trait SwarmService: Send + Sync {
    /// Broadcast an updated manifest to the rest of the swarm.
    fn push_meta(&self, manifest_path: &Path) -> impl Future<Output = Result<()>> + Send;

    /// Register a newly published lynk with the tracker-side service.
    fn create_swarm(&self, lynk: &str) -> impl Future<Output = Result<()>> + Send;
}
