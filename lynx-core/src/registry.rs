//! Lynk registry: `lynks.txt` plus the in-memory set derived from every member manifest.
//!
//! Every mutation reloads the registry file and re-parses all manifests. Registries are
//! small, so O(members) per change is fine.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};

use crate::error::{LynkError, Result};
use crate::lynk::{Lynk, SyncStatus, META_FILE, REGISTRY_FILE, SEP};
use crate::manifest;

pub struct Registry {
    home: PathBuf,
    lynks: RwLock<Vec<Lynk>>,
    guards: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Registry {
    /// Load `<home>/lynks.txt`, creating it (and `home`) when absent.
    pub fn open(home: impl Into<PathBuf>) -> Result<Self> {
        let home = home.into();
        fs::create_dir_all(&home)?;
        let path = home.join(REGISTRY_FILE);
        if !path.exists() {
            fs::File::create(&path)?;
        }
        let lynks = derive(&home, load(&path)?);
        info!("Registry at {} holds {} lynk(s)", path.display(), lynks.len());
        Ok(Self {
            home,
            lynks: RwLock::new(lynks),
            guards: Mutex::new(HashMap::new()),
        })
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn registry_path(&self) -> PathBuf {
        self.home.join(REGISTRY_FILE)
    }

    pub fn lynk_dir(&self, name: &str) -> PathBuf {
        self.home.join(name)
    }

    pub fn manifest_path(&self, name: &str) -> PathBuf {
        self.lynk_dir(name).join(META_FILE)
    }

    /// Snapshot in registry order.
    pub async fn lynks(&self) -> Vec<Lynk> {
        self.lynks.read().await.clone()
    }

    pub async fn get(&self, name: &str) -> Option<Lynk> {
        self.lynks.read().await.iter().find(|l| l.name == name).cloned()
    }

    /// Exclusive access to one lynk's manifest and files.
    pub async fn lock_lynk(&self, name: &str) -> OwnedMutexGuard<()> {
        let guard = {
            let mut guards = self.guards.lock().unwrap_or_else(|e| e.into_inner());
            guards.entry(name.to_string()).or_default().clone()
        };
        guard.lock_owned().await
    }

    /// Whether `lynks.txt` already lists this (name, owner) pair.
    pub async fn contains(&self, name: &str, owner: &str) -> Result<bool> {
        let _set = self.lynks.read().await;
        Ok(is_listed(&load(&self.registry_path())?, name, owner))
    }

    /// Register a lynk. A (name, owner) pair already listed is a `Duplicate` and the file
    /// is left as it was.
    pub async fn add(&self, name: &str, owner: &str) -> Result<()> {
        let mut set = self.lynks.write().await;
        let path = self.registry_path();
        let mut stubs = load(&path)?;
        if is_listed(&stubs, name, owner) {
            return Err(LynkError::Duplicate(format!("lynk {name} owned by {owner}")));
        }
        stubs.push(Lynk::stub(name, SyncStatus::Unsynced, owner));
        manifest::write_atomic(&path, encode(&stubs).as_bytes())?;
        *set = derive(&self.home, load(&path)?);
        info!("Added lynk {} ({})", name, owner);
        Ok(())
    }

    /// Drop a lynk from the registry, optionally deleting its directory tree.
    pub async fn remove(&self, name: &str, delete_local: bool) -> Result<()> {
        let mut set = self.lynks.write().await;
        if !set.iter().any(|l| l.name == name) {
            return Err(LynkError::NotFound(format!("lynk {name}")));
        }
        set.retain(|l| l.name != name);
        manifest::write_atomic(&self.registry_path(), encode(&set).as_bytes())?;
        if delete_local {
            match fs::remove_dir_all(self.lynk_dir(name)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.guards
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
        info!("Removed lynk {} (local files deleted: {})", name, delete_local);
        Ok(())
    }

    /// Re-read `lynks.txt` and every member manifest.
    pub async fn reload(&self) -> Result<()> {
        let mut set = self.lynks.write().await;
        *set = derive(&self.home, load(&self.registry_path())?);
        Ok(())
    }

    /// Re-derive one lynk from its manifest; the in-memory copy is only a cache.
    pub async fn refresh(&self, name: &str) -> Result<Lynk> {
        let parsed = manifest::parse(&self.manifest_path(name))?;
        let mut set = self.lynks.write().await;
        let lynk = set
            .iter_mut()
            .find(|l| l.name == name)
            .ok_or_else(|| LynkError::NotFound(format!("lynk {name}")))?;
        lynk.tracker = parsed.tracker;
        lynk.files = parsed.files;
        Ok(lynk.clone())
    }

    pub async fn set_status(&self, name: &str, status: SyncStatus) -> Result<()> {
        let mut set = self.lynks.write().await;
        let lynk = set
            .iter_mut()
            .find(|l| l.name == name)
            .ok_or_else(|| LynkError::NotFound(format!("lynk {name}")))?;
        if lynk.status == status {
            return Ok(());
        }
        debug!("{}: {} -> {}", name, lynk.status, status);
        lynk.status = status;
        manifest::write_atomic(&self.registry_path(), encode(&set).as_bytes())
    }

    /// `"<lynk>/<file>"` is listed in that lynk's manifest on disk.
    pub async fn have_file(&self, file_path: &str) -> bool {
        let parts: Vec<&str> = file_path.split('/').collect();
        let [lynk, file] = parts.as_slice() else {
            debug!("{} is an invalid file path", file_path);
            return false;
        };
        if self.get(lynk).await.is_none() {
            return false;
        }
        manifest::parse(&self.manifest_path(lynk))
            .map(|m| m.contains(file))
            .unwrap_or(false)
    }

    pub async fn tracker_of(&self, name: &str) -> Result<String> {
        Ok(manifest::parse(&self.manifest_path(name))?.tracker)
    }
}

/// Registry stubs, one per `name:::status:::owner` line.
pub fn load(registry_path: &Path) -> Result<Vec<Lynk>> {
    let text = fs::read_to_string(registry_path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => LynkError::NotFound(registry_path.display().to_string()),
        _ => LynkError::Io(e),
    })?;
    let mut out = Vec::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let parts: Vec<&str> = line.splitn(3, SEP).collect();
        let [name, status, owner] = parts.as_slice() else {
            warn!("Skipping malformed registry line {:?}", line);
            continue;
        };
        let status = status.parse().unwrap_or_default();
        out.push(Lynk::stub(name, status, owner));
    }
    Ok(out)
}

fn encode(lynks: &[Lynk]) -> String {
    lynks
        .iter()
        .map(|l| format!("{}{SEP}{}{SEP}{}\n", l.name, l.status, l.owner))
        .collect()
}

fn is_listed(stubs: &[Lynk], name: &str, owner: &str) -> bool {
    let wanted = format!("{name}{owner}");
    stubs
        .iter()
        .any(|l| format!("{}{}", l.name, l.owner).trim() == wanted.trim())
}

fn derive(home: &Path, stubs: Vec<Lynk>) -> Vec<Lynk> {
    stubs
        .into_iter()
        .map(|mut lynk| {
            match manifest::parse(&home.join(&lynk.name).join(META_FILE)) {
                Ok(m) => {
                    lynk.tracker = m.tracker;
                    lynk.files = m.files;
                }
                Err(e) => warn!("Manifest for {} unreadable: {}", lynk.name, e),
            }
            lynk
        })
        .collect()
}
