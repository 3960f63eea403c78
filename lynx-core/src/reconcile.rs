//! Reconciliation: compare each lynk directory with its manifest, rebuild and push on change.

use std::collections::HashMap;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::error::{LynkError, Result};
use crate::lynk::{FileEntry, SyncStatus};
use crate::manifest::{self, Manifest};
use crate::registry::Registry;
use crate::swarm::SwarmService;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Added(String),
    Removed(String),
    Modified(String),
    /// Listed but never held here: a download that has not completed yet.
    Missing(String),
}

/// Outcome of one pass over the registry.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub pushed: Vec<String>,
    pub unchanged: Vec<String>,
    /// Lynks still listing files that were never fetched.
    pub pending: Vec<String>,
    pub failed: Vec<(String, LynkError)>,
}

/// What reconciling a single lynk did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LynkSync {
    pub pushed: bool,
    pub missing: usize,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// An entry is held once its recorded path points inside the lynk directory.
fn is_held(entry: &FileEntry, lynk_root: &Path) -> bool {
    Path::new(&entry.path).starts_with(lynk_root)
}

/// Name-keyed difference between the manifest's file list and what is on disk now.
/// A recorded file absent from disk counts as removed only if it was held under
/// `lynk_root` (the canonical lynk directory); otherwise it is still to be fetched.
pub fn detect_changes(
    recorded: &[FileEntry],
    on_disk: &[FileEntry],
    lynk_root: &Path,
) -> Vec<Change> {
    let known: HashMap<&str, u64> = recorded.iter().map(|f| (f.name.as_str(), f.length)).collect();
    let present: HashMap<&str, u64> = on_disk.iter().map(|f| (f.name.as_str(), f.length)).collect();

    let mut changes = Vec::new();
    for f in on_disk {
        match known.get(f.name.as_str()) {
            None => changes.push(Change::Added(f.name.clone())),
            Some(&len) if len != f.length => changes.push(Change::Modified(f.name.clone())),
            Some(_) => {}
        }
    }
    for f in recorded {
        if present.contains_key(f.name.as_str()) {
            continue;
        }
        if is_held(f, lynk_root) {
            changes.push(Change::Removed(f.name.clone()));
        } else {
            changes.push(Change::Missing(f.name.clone()));
        }
    }
    changes
}

/// One pass over every registered lynk in registry order. A failing lynk is reported,
/// marked `Unsynced` and skipped; the rest still run.
pub async fn sync_all<S: SwarmService>(registry: &Registry, swarm: &S) -> SyncReport {
    let mut report = SyncReport::default();
    for lynk in registry.lynks().await {
        match sync_lynk(registry, swarm, &lynk.name).await {
            Ok(outcome) => {
                if outcome.missing > 0 {
                    report.pending.push(lynk.name.clone());
                }
                if outcome.pushed {
                    report.pushed.push(lynk.name);
                } else {
                    report.unchanged.push(lynk.name);
                }
            }
            Err(e) => {
                warn!("Reconciling {} failed: {}", lynk.name, e);
                if let Err(e) = registry.set_status(&lynk.name, SyncStatus::Unsynced).await {
                    warn!("Could not mark {} unsynced: {}", lynk.name, e);
                }
                report.failed.push((lynk.name, e));
            }
        }
    }
    debug!(
        "Sync pass: {} pushed, {} unchanged, {} pending, {} failed",
        report.pushed.len(),
        report.unchanged.len(),
        report.pending.len(),
        report.failed.len()
    );
    report
}

/// Reconcile one lynk. Files still waiting to be fetched never trigger a push on their own.
pub async fn sync_lynk<S: SwarmService>(
    registry: &Registry,
    swarm: &S,
    name: &str,
) -> Result<LynkSync> {
    let _guard = registry.lock_lynk(name).await;
    let dir = registry.lynk_dir(name);
    let on_disk = manifest::scan(&dir)?;
    let root = std::fs::canonicalize(&dir)?;
    let lynk = registry.refresh(name).await?;
    let changes = detect_changes(&lynk.files, &on_disk, &root);
    let mut outcome = LynkSync {
        pushed: false,
        missing: 0,
    };
    for change in &changes {
        match change {
            Change::Added(f) | Change::Modified(f) => {
                info!("File {} has been added or changed in {}", f, name)
            }
            Change::Removed(f) => info!("File {} has been removed from {}", f, name),
            Change::Missing(f) => {
                debug!("File {} of {} not fetched yet", f, name);
                outcome.missing += 1;
            }
        }
    }
    if changes.len() > outcome.missing {
        rebuild_and_push(registry, swarm, name, None).await?;
        outcome.pushed = true;
    }
    Ok(outcome)
}

/// Rewrite the manifest from disk truth, keeping the recorded tracker and owner, then
/// tell the swarm. Entries never fetched here stay listed and leave the lynk `Unsynced`;
/// `forget` drops one of them regardless. Caller holds the lynk's lock.
pub(crate) async fn rebuild_and_push<S: SwarmService>(
    registry: &Registry,
    swarm: &S,
    name: &str,
    forget: Option<&str>,
) -> Result<()> {
    let lynk = registry.refresh(name).await?;
    registry.set_status(name, SyncStatus::Syncing).await?;
    let dir = registry.lynk_dir(name);
    let root = std::fs::canonicalize(&dir)?;
    let mut rebuilt = Manifest::new(&lynk.tracker, name, &lynk.owner);
    rebuilt.files = manifest::scan(&dir)?;
    let unfetched: Vec<FileEntry> = lynk
        .files
        .into_iter()
        .filter(|f| forget != Some(f.name.as_str()))
        .filter(|f| !is_held(f, &root) && !rebuilt.contains(&f.name))
        .collect();
    let waiting = unfetched.len();
    rebuilt.files.extend(unfetched);
    manifest::write(&registry.manifest_path(name), &rebuilt)?;
    registry.refresh(name).await?;
    swarm.push_meta(&registry.manifest_path(name)).await?;
    let status = if waiting == 0 {
        SyncStatus::Synced
    } else {
        SyncStatus::Unsynced
    };
    registry.set_status(name, status).await
}
