//! Lynx core: peer-to-peer directory sync.
//!
//! A published directory (a lynk) is described by its `meta.info` manifest. Peers find
//! each other through a tracker, fetch whole files from one another, and a periodic
//! reconciliation pass rebuilds and pushes a lynk's manifest when its directory changes.

pub mod config;
pub mod crypto;
pub mod error;
pub mod lynk;
pub mod manifest;
pub mod node;
pub mod peers;
pub mod reconcile;
pub mod registry;
pub mod serve;
pub mod swarm;
pub mod tracker;
pub mod transfer;
pub mod wire;

pub use config::Config;
pub use crypto::{Cipher, PayloadError};
pub use error::{LynkError, Result};
pub use lynk::{FileEntry, Lynk, Peer, SyncStatus};
pub use manifest::Manifest;
pub use node::Node;
pub use peers::PeerDirectory;
pub use reconcile::{Change, LynkSync, SyncReport};
pub use registry::Registry;
pub use swarm::SwarmService;
pub use tracker::TrackerClient;
pub use transfer::TransferClient;
