//! Node: the owned handle a front end drives. Holds the registry, swarm state and clients
//! for one Lynx home, from `open` to `close`.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::crypto::Cipher;
use crate::error::{LynkError, Result};
use crate::lynk::{is_plain_name, FileEntry, Lynk, META_FILE};
use crate::manifest;
use crate::peers::PeerDirectory;
use crate::reconcile::{self, SyncReport};
use crate::registry::Registry;
use crate::swarm::SwarmService;
use crate::tracker::TrackerClient;
use crate::transfer::TransferClient;

pub struct Node<S> {
    config: Config,
    registry: Arc<Registry>,
    peers: Arc<PeerDirectory>,
    cipher: Arc<Cipher>,
    transfer: TransferClient,
    swarm: S,
    selected: Mutex<Option<usize>>,
}

impl<S: SwarmService> Node<S> {
    /// Load the registry under `config.home` (creating it if needed) and wire up clients.
    pub fn open(config: Config, swarm: S) -> Result<Self> {
        Self::open_with_peers(config, Arc::new(PeerDirectory::new()), swarm)
    }

    /// Like [`open`](Self::open), over a peer directory the caller also hands to `swarm`.
    pub fn open_with_peers(config: Config, peers: Arc<PeerDirectory>, swarm: S) -> Result<Self> {
        let registry = Arc::new(Registry::open(&config.home)?);
        let cipher = Arc::new(Cipher::from_secret(&config.shared_secret));
        let tracker = TrackerClient::from_config(&config, peers.clone());
        let transfer = TransferClient::from_config(&config, registry.clone(), tracker, cipher.clone());
        Ok(Self {
            config,
            registry,
            peers,
            cipher,
            transfer,
            swarm,
            selected: Mutex::new(None),
        })
    }

    /// Wait for in-flight work on every lynk, then drop the handle.
    pub async fn close(self) {
        for lynk in self.registry.lynks().await {
            drop(self.registry.lock_lynk(&lynk.name).await);
        }
        info!("Closed Lynx home {}", self.registry.home().display());
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn peers(&self) -> &Arc<PeerDirectory> {
        &self.peers
    }

    pub fn cipher(&self) -> &Arc<Cipher> {
        &self.cipher
    }

    pub fn swarm(&self) -> &S {
        &self.swarm
    }

    /// Tracker address written into manifests published here.
    pub fn tracker_addr(&self) -> String {
        format!("{}:{}", self.config.self_ip(), self.config.tracker_port)
    }

    /// Publish `<home>/<name>`: write its manifest, register it and create its swarm.
    pub async fn publish(&self, name: &str) -> Result<Lynk> {
        if !is_plain_name(name) {
            return Err(LynkError::InvalidFormat(PathBuf::from(name)));
        }
        let owner = &self.config.owner;
        if self.registry.contains(name, owner).await? {
            return Err(LynkError::Duplicate(format!("lynk {name} owned by {owner}")));
        }
        let dir = self.registry.lynk_dir(name);
        if !dir.is_dir() {
            return Err(LynkError::NotFound(format!(
                "directory {name} in {}",
                self.registry.home().display()
            )));
        }
        {
            let _guard = self.registry.lock_lynk(name).await;
            let built = manifest::build(&dir, &self.tracker_addr(), name, owner)?;
            info!("Published {} with {} file(s)", name, built.files.len());
        }
        self.registry.add(name, owner).await?;
        self.swarm.create_swarm(name).await?;
        self.registry
            .get(name)
            .await
            .ok_or_else(|| LynkError::NotFound(format!("lynk {name}")))
    }

    /// Join the lynk described by a `meta.info` received from its owner, then fetch its files.
    pub async fn join(&self, meta_path: &Path) -> Result<()> {
        let received = manifest::parse(meta_path)?;
        let name = received.name.clone();
        if !is_plain_name(&name) {
            return Err(LynkError::InvalidFormat(meta_path.to_path_buf()));
        }
        if self.registry.contains(&name, &received.owner).await? {
            return Err(LynkError::Duplicate(format!(
                "lynk {name} owned by {}",
                received.owner
            )));
        }
        let target = self.registry.manifest_path(&name);
        if target.exists() {
            return Err(LynkError::Duplicate(format!("directory {name}")));
        }
        {
            let _guard = self.registry.lock_lynk(&name).await;
            std::fs::create_dir_all(self.registry.lynk_dir(&name))?;
            manifest::write(&target, &received)?;
        }
        self.registry.add(&name, &received.owner).await?;
        info!("Joined {} ({} file(s) listed)", name, received.files.len());
        self.transfer.update_lynk(&name).await
    }

    /// Unregister a lynk, optionally deleting its directory.
    pub async fn remove(&self, name: &str, delete_local: bool) -> Result<()> {
        let _guard = self.registry.lock_lynk(name).await;
        self.registry.remove(name, delete_local).await?;
        *self.selected_slot() = None;
        Ok(())
    }

    /// Add a file to a lynk. Files outside the lynk directory are copied in first.
    pub async fn add_file(&self, name: &str, file: &Path) -> Result<FileEntry> {
        let file_name = file
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| is_plain_name(n) && *n != META_FILE)
            .ok_or_else(|| LynkError::InvalidFormat(file.to_path_buf()))?
            .to_string();
        let _guard = self.registry.lock_lynk(name).await;
        let manifest_path = self.registry.manifest_path(name);
        if manifest::parse(&manifest_path)?.contains(&file_name) {
            return Err(LynkError::Duplicate(file_name));
        }
        let dir = self.registry.lynk_dir(name);
        let inside = match (std::fs::canonicalize(file), std::fs::canonicalize(&dir)) {
            (Ok(f), Ok(d)) => f.starts_with(d),
            (Err(e), _) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LynkError::NotFound(file.display().to_string()))
            }
            (Err(e), _) | (_, Err(e)) => return Err(e.into()),
        };
        let local = if inside {
            file.to_path_buf()
        } else {
            let dest = dir.join(&file_name);
            std::fs::copy(file, &dest)?;
            dest
        };
        let entry = manifest::append_file(&local, &manifest_path)?;
        self.registry.refresh(name).await?;
        self.swarm.push_meta(&manifest_path).await?;
        Ok(entry)
    }

    /// Delete by position in `lynks()` and that lynk's file list.
    pub async fn delete_file(&self, lynk_index: usize, file_index: usize) -> Result<()> {
        let lynk = self
            .registry
            .lynks()
            .await
            .into_iter()
            .nth(lynk_index)
            .ok_or_else(|| LynkError::NotFound(format!("lynk #{lynk_index}")))?;
        let file = lynk
            .files
            .get(file_index)
            .ok_or_else(|| LynkError::NotFound(format!("file #{file_index} of {}", lynk.name)))?;
        self.delete_file_named(&lynk.name, &file.name).await
    }

    /// Remove the local copy, rebuild the manifest without it and push.
    pub async fn delete_file_named(&self, name: &str, file: &str) -> Result<()> {
        let _guard = self.registry.lock_lynk(name).await;
        let lynk = self.registry.refresh(name).await?;
        let entry = lynk
            .file(file)
            .ok_or_else(|| LynkError::NotFound(format!("{name}/{file}")))?;
        let dir = self.registry.lynk_dir(name);
        let local = match (
            std::fs::canonicalize(&entry.path),
            std::fs::canonicalize(&dir),
        ) {
            (Ok(p), Ok(d)) if p.starts_with(&d) => p,
            _ => dir.join(&entry.name),
        };
        match std::fs::remove_file(&local) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!("Deleted {} from {}", file, name);
        reconcile::rebuild_and_push(&self.registry, &self.swarm, name, Some(file)).await
    }

    pub async fn lynks(&self) -> Vec<Lynk> {
        self.registry.lynks().await
    }

    pub async fn files(&self, index: usize) -> Result<Vec<FileEntry>> {
        self.registry
            .lynks()
            .await
            .into_iter()
            .nth(index)
            .map(|l| l.files)
            .ok_or_else(|| LynkError::NotFound(format!("lynk #{index}")))
    }

    pub async fn lynk_name_at(&self, index: usize) -> Option<String> {
        self.registry.lynks().await.into_iter().nth(index).map(|l| l.name)
    }

    pub fn selected_index(&self) -> Option<usize> {
        *self.selected_slot()
    }

    pub async fn select(&self, index: usize) -> Result<()> {
        if index >= self.registry.lynks().await.len() {
            return Err(LynkError::NotFound(format!("lynk #{index}")));
        }
        *self.selected_slot() = Some(index);
        Ok(())
    }

    pub async fn fetch_file(&self, name: &str, file: &str) -> Result<PathBuf> {
        self.transfer.fetch_file(name, file).await
    }

    pub async fn update_lynk(&self, name: &str) -> Result<()> {
        self.transfer.update_lynk(name).await
    }

    pub fn is_downloading(&self, name: &str) -> bool {
        self.transfer.is_downloading(name)
    }

    /// Stop the running download of a lynk before its next file.
    pub fn stop_download(&self, name: &str) -> bool {
        self.transfer.stop_download(name)
    }

    /// Reconcile every lynk, then retry the files of lynks whose download never finished.
    pub async fn sync_all(&self) -> SyncReport {
        let report = reconcile::sync_all(&self.registry, &self.swarm).await;
        for name in &report.pending {
            if self.transfer.is_downloading(name) {
                debug!("{} still downloading; not retrying", name);
                continue;
            }
            if let Err(e) = self.transfer.fetch_missing(name).await {
                warn!("Fetching pending files of {} failed: {}", name, e);
            }
        }
        report
    }

    fn selected_slot(&self) -> std::sync::MutexGuard<'_, Option<usize>> {
        self.selected.lock().unwrap_or_else(|e| e.into_inner())
    }
}
