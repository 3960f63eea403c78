//! Data model: lynks, their files, swarm peers and sync status.

use std::fmt;
use std::str::FromStr;

/// Key/value separator used by manifests, the registry file and tracker replies.
pub const SEP: &str = ":::";

/// Manifest file name inside every lynk directory.
pub const META_FILE: &str = "meta.info";

/// Registry file name inside the Lynx home directory.
pub const REGISTRY_FILE: &str = "lynks.txt";

/// Path component marking tracker scratch directories; never part of a manifest.
pub const TRACKER_MARKER: &str = "_Tracker";

/// Chunk fields written for every file. Informational only; transfer is whole-file.
pub const DEFAULT_CHUNK_LENGTH: u64 = 32;
pub const DEFAULT_CHUNKS: &str = "256";

/// A bare file name: no separators, not `.` or `..`.
pub fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}

/// One replicated file inside a lynk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileEntry {
    pub length: u64,
    pub path: String,
    pub name: String,
    pub chunk_length: u64,
    pub chunks: String,
}

/// A published or joined directory under synchronization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Lynk {
    pub name: String,
    pub owner: String,
    pub status: SyncStatus,
    /// Tracker `host:port` from the `announce` record.
    pub tracker: String,
    /// Derived from the manifest; never edited by hand.
    pub files: Vec<FileEntry>,
}

impl Lynk {
    pub fn stub(name: &str, status: SyncStatus, owner: &str) -> Self {
        Self {
            name: name.to_string(),
            owner: owner.to_string(),
            status,
            ..Default::default()
        }
    }

    pub fn file(&self, name: &str) -> Option<&FileEntry> {
        self.files.iter().find(|f| f.name == name)
    }

    /// Display column: file names in manifest order.
    pub fn file_names(&self) -> Vec<&str> {
        self.files.iter().map(|f| f.name.as_str()).collect()
    }

    /// Display column: file sizes in manifest order.
    pub fn file_sizes(&self) -> Vec<u64> {
        self.files.iter().map(|f| f.length).collect()
    }
}

/// Reachable swarm member. Equality is on both fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Peer {
    pub ip: String,
    pub port: u16,
}

impl Peer {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Persisted sync state of a lynk.
///
/// `Unsynced` -> `Syncing` when a fetch or rebuild starts, `Syncing` -> `Synced` when it
/// completes and the swarm was told, any failure -> `Unsynced`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SyncStatus {
    #[default]
    Unsynced,
    Syncing,
    Synced,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Unsynced => "Unsynced",
            SyncStatus::Syncing => "Syncing",
            SyncStatus::Synced => "Synced",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = std::convert::Infallible;

    /// Lenient: anything unrecognised is `Unsynced`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim() {
            "Syncing" => SyncStatus::Syncing,
            "Synced" => SyncStatus::Synced,
            _ => SyncStatus::Unsynced,
        })
    }
}
