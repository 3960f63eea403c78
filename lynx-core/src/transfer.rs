//! Transfer client: whole-file fetch from the swarm, one peer at a time.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::crypto::Cipher;
use crate::error::{LynkError, Result};
use crate::lynk::{is_plain_name, Peer, SyncStatus};
use crate::manifest;
use crate::registry::Registry;
use crate::tracker::TrackerClient;
use crate::wire::{self, Request};

/// What one peer did with a file request.
#[derive(Debug)]
pub enum PeerOutcome {
    Delivered(Vec<u8>),
    Declined,
}

pub struct TransferClient {
    registry: Arc<Registry>,
    tracker: TrackerClient,
    cipher: Arc<Cipher>,
    connect_timeout: Duration,
    read_timeout: Duration,
    retries: u32,
    /// Lynks with a download in progress; clearing the flag asks it to stop.
    downloads: Mutex<HashMap<String, Arc<AtomicBool>>>,
}

/// Drops the lynk's download flag when the download ends, however it ends.
struct DownloadGuard<'a> {
    downloads: &'a Mutex<HashMap<String, Arc<AtomicBool>>>,
    lynk: String,
}

impl Drop for DownloadGuard<'_> {
    fn drop(&mut self) {
        self.downloads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.lynk);
    }
}

impl TransferClient {
    pub fn new(
        registry: Arc<Registry>,
        tracker: TrackerClient,
        cipher: Arc<Cipher>,
        connect_timeout: Duration,
        read_timeout: Duration,
        retries: u32,
    ) -> Self {
        Self {
            registry,
            tracker,
            cipher,
            connect_timeout,
            read_timeout,
            retries,
            downloads: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(
        config: &Config,
        registry: Arc<Registry>,
        tracker: TrackerClient,
        cipher: Arc<Cipher>,
    ) -> Self {
        Self::new(
            registry,
            tracker,
            cipher,
            config.connect_timeout(),
            config.read_timeout(),
            config.fetch_retries,
        )
    }

    pub fn tracker(&self) -> &TrackerClient {
        &self.tracker
    }

    /// Fetch `file` of `lynk` into `<home>/<lynk>/<file>`.
    ///
    /// Each attempt asks the tracker for the swarm and walks it in order. A failed
    /// attempt is repeated up to the retry budget; the last error is returned.
    pub async fn fetch_file(&self, lynk: &str, file: &str) -> Result<PathBuf> {
        let tracker_addr = self.registry.tracker_of(lynk).await?;
        let mut last = None;
        for attempt in 0..=self.retries {
            match self.fetch_once(lynk, &tracker_addr, file).await {
                Ok(path) => return Ok(path),
                Err(e @ LynkError::InvalidFormat(_)) => return Err(e),
                Err(e) => {
                    warn!("Fetch {}/{} attempt {} failed: {}", lynk, file, attempt + 1, e);
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or_else(|| LynkError::FileUnavailable {
            lynk: lynk.to_string(),
            file: file.to_string(),
        }))
    }

    /// Fetch every file the lynk's manifest lists. Failures do not stop the remaining
    /// files; the last one is returned and the lynk is left `Unsynced`.
    pub async fn update_lynk(&self, lynk: &str) -> Result<()> {
        self.download(lynk, false).await
    }

    /// Like [`update_lynk`](Self::update_lynk) but skips files already held locally.
    pub async fn fetch_missing(&self, lynk: &str) -> Result<()> {
        self.download(lynk, true).await
    }

    pub fn is_downloading(&self, lynk: &str) -> bool {
        self.downloads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(lynk)
    }

    /// Ask a running download to stop before its next file. Returns false if none runs.
    pub fn stop_download(&self, lynk: &str) -> bool {
        match self
            .downloads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(lynk)
        {
            Some(active) => {
                active.store(false, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    async fn download(&self, lynk: &str, only_missing: bool) -> Result<()> {
        let active = {
            let mut downloads = self.downloads.lock().unwrap_or_else(|e| e.into_inner());
            if downloads.contains_key(lynk) {
                debug!("{} is already downloading", lynk);
                return Ok(());
            }
            let active = Arc::new(AtomicBool::new(true));
            downloads.insert(lynk.to_string(), active.clone());
            active
        };
        let _done = DownloadGuard {
            downloads: &self.downloads,
            lynk: lynk.to_string(),
        };

        let current = self.registry.refresh(lynk).await?;
        let dir = self.registry.lynk_dir(lynk);
        self.registry.set_status(lynk, SyncStatus::Syncing).await?;
        let mut last = None;
        for file in &current.files {
            if !active.load(Ordering::SeqCst) {
                info!("Download of {} stopped", lynk);
                self.registry.set_status(lynk, SyncStatus::Unsynced).await?;
                return Err(LynkError::Stopped(lynk.to_string()));
            }
            if only_missing && dir.join(&file.name).is_file() {
                continue;
            }
            if let Err(e) = self.fetch_file(lynk, &file.name).await {
                warn!("Giving up on {}/{}: {}", lynk, file.name, e);
                last = Some(e);
            }
        }
        match last {
            Some(e) => {
                self.registry.set_status(lynk, SyncStatus::Unsynced).await?;
                Err(e)
            }
            None => {
                info!("{} is up to date ({} file(s))", lynk, current.files.len());
                self.registry.set_status(lynk, SyncStatus::Synced).await
            }
        }
    }

    async fn fetch_once(&self, lynk: &str, tracker_addr: &str, file: &str) -> Result<PathBuf> {
        let peers = self.tracker.discover_peers(lynk, tracker_addr).await?;
        self.fetch_from_peers(lynk, file, &peers).await
    }

    /// Try `peers` strictly in order; the first one that delivers wins. Declines and
    /// per-peer failures move on to the next peer.
    pub async fn fetch_from_peers(&self, lynk: &str, file: &str, peers: &[Peer]) -> Result<PathBuf> {
        if !is_plain_name(file) || !is_plain_name(lynk) {
            return Err(LynkError::InvalidFormat(PathBuf::from(format!("{lynk}/{file}"))));
        }
        for peer in peers {
            info!("Downloading {} from {}", file, peer);
            match self.ask_peer(peer, lynk, file).await {
                Ok(PeerOutcome::Delivered(data)) => {
                    let path = self.store(lynk, file, &data).await?;
                    info!("Received {} ({} bytes) from {}", file, data.len(), peer);
                    return Ok(path);
                }
                Ok(PeerOutcome::Declined) => debug!("{} does not have {}", peer, file),
                Err(e) => warn!("Did not receive {} from {}: {}", file, peer, e),
            }
        }
        Err(LynkError::FileUnavailable {
            lynk: lynk.to_string(),
            file: file.to_string(),
        })
    }

    /// One request/reply exchange with a single peer.
    pub async fn ask_peer(&self, peer: &Peer, lynk: &str, file: &str) -> Result<PeerOutcome> {
        let stream = wire::connect(&peer.addr(), self.connect_timeout).await?;
        let (reader, mut writer) = stream.into_split();
        let request = Request::HaveFile {
            lynk: lynk.to_string(),
            file: file.to_string(),
        };
        writer.write_all(request.encode().as_bytes()).await?;
        writer.flush().await?;

        let mut reader = BufReader::new(reader);
        let reply = wire::read_line(&mut reader, self.read_timeout)
            .await?
            .ok_or_else(|| {
                LynkError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "peer closed before replying",
                ))
            })?;
        if reply.trim() == wire::NO {
            return Ok(PeerOutcome::Declined);
        }
        let payload = wire::read_to_close(&mut reader, self.read_timeout).await?;
        let data = self
            .cipher
            .decode_payload(&payload)
            .map_err(|e| LynkError::TransferCorrupt(format!("{file} from {peer}: {e}")))?;
        Ok(PeerOutcome::Delivered(data))
    }

    /// Write the file and repoint its manifest entry at the local copy, which marks it
    /// as held here.
    async fn store(&self, lynk: &str, file: &str, data: &[u8]) -> Result<PathBuf> {
        let _guard = self.registry.lock_lynk(lynk).await;
        let dir = self.registry.lynk_dir(lynk);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(file);
        tokio::fs::write(&path, data).await?;
        match manifest::record_local(&self.registry.manifest_path(lynk), file, &path) {
            Ok(_) | Err(LynkError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        if self.registry.get(lynk).await.is_some() {
            self.registry.refresh(lynk).await?;
        }
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Manifest;
    use crate::peers::PeerDirectory;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::AsyncBufReadExt;
    use tokio::net::TcpListener;

    const SECRET: &str = "test-secret";

    fn client(home: &std::path::Path, retries: u32) -> TransferClient {
        let registry = Arc::new(Registry::open(home).unwrap());
        let tracker = TrackerClient::new(
            Arc::new(PeerDirectory::new()),
            "127.0.0.1",
            8080,
            Duration::from_millis(500),
            Duration::from_secs(2),
        );
        TransferClient::new(
            registry,
            tracker,
            Arc::new(Cipher::from_secret(SECRET)),
            Duration::from_millis(500),
            Duration::from_secs(2),
            retries,
        )
    }

    /// A peer that answers every request with `reply` and counts connections.
    async fn fake_peer(reply: Vec<u8>) -> (Peer, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let (r, mut w) = stream.into_split();
                let mut line = String::new();
                tokio::io::BufReader::new(r).read_line(&mut line).await.unwrap();
                assert!(line.starts_with("Do_You_Have_FileName:Demo/"));
                w.write_all(&reply).await.unwrap();
            }
        });
        (Peer::new("127.0.0.1", port), hits)
    }

    /// Accepts and holds every connection without ever answering.
    async fn silent_peer() -> Peer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        Peer::new("127.0.0.1", port)
    }

    /// Like `fake_peer`, but waits `delay` before answering.
    async fn slow_peer(reply: Vec<u8>, delay: Duration) -> (Peer, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let reply = reply.clone();
                tokio::spawn(async move {
                    let (r, mut w) = stream.into_split();
                    let mut line = String::new();
                    tokio::io::BufReader::new(r).read_line(&mut line).await.unwrap();
                    tokio::time::sleep(delay).await;
                    w.write_all(&reply).await.unwrap();
                });
            }
        });
        (Peer::new("127.0.0.1", port), hits)
    }

    fn two_file_manifest(home: &std::path::Path, tracker_addr: &str) -> std::path::PathBuf {
        let dir = home.join("Demo");
        std::fs::create_dir_all(&dir).unwrap();
        let mut m = Manifest::new(tracker_addr, "Demo", "alice");
        for name in ["one.txt", "two.txt"] {
            m.files.push(crate::lynk::FileEntry {
                length: 9,
                path: format!("/elsewhere/{name}"),
                name: name.to_string(),
                chunk_length: 32,
                chunks: "256".into(),
            });
        }
        manifest::write(&dir.join(crate::lynk::META_FILE), &m).unwrap();
        dir
    }

    fn yes_with(plain: &[u8]) -> Vec<u8> {
        let mut out = b"YES\n".to_vec();
        out.extend(Cipher::from_secret(SECRET).encode_payload(plain).unwrap());
        out
    }

    async fn dead_peer() -> Peer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Peer::new("127.0.0.1", listener.local_addr().unwrap().port())
    }

    /// Tracker that lists `peer` as the whole swarm on every request.
    async fn fake_tracker(peer: &Peer) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let reply = wire::encode_peer_line(peer);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let (r, mut w) = stream.into_split();
                let mut line = String::new();
                tokio::io::BufReader::new(r).read_line(&mut line).await.unwrap();
                w.write_all(reply.as_bytes()).await.unwrap();
            }
        });
        addr
    }

    fn register_demo(home: &std::path::Path, tracker_addr: &str) {
        let dir = home.join("Demo");
        std::fs::create_dir_all(&dir).unwrap();
        manifest::write(
            &dir.join(crate::lynk::META_FILE),
            &Manifest::new(tracker_addr, "Demo", "alice"),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn first_delivering_peer_wins_and_later_peers_untouched() {
        let home = tempfile::tempdir().unwrap();
        let (p0, p0_hits) = fake_peer(b"NO\n".to_vec()).await;
        let (p1, p1_hits) = fake_peer(yes_with(b"known plaintext X")).await;
        let (p2, p2_hits) = fake_peer(yes_with(b"wrong")).await;

        let path = client(home.path(), 0)
            .fetch_from_peers("Demo", "x.txt", &[p0, p1, p2])
            .await
            .unwrap();
        assert_eq!(path, home.path().join("Demo").join("x.txt"));
        assert_eq!(std::fs::read(&path).unwrap(), b"known plaintext X");
        assert_eq!(p0_hits.load(Ordering::SeqCst), 1);
        assert_eq!(p1_hits.load(Ordering::SeqCst), 1);
        assert_eq!(p2_hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn exhaustion_is_unavailable_and_writes_nothing() {
        let home = tempfile::tempdir().unwrap();
        let (p0, _) = fake_peer(b"NO\n".to_vec()).await;
        let p1 = dead_peer().await;
        let res = client(home.path(), 0)
            .fetch_from_peers("Demo", "x.txt", &[p0, p1])
            .await;
        assert!(matches!(res, Err(LynkError::FileUnavailable { .. })));
        assert!(!home.path().join("Demo").join("x.txt").exists());
    }

    #[tokio::test]
    async fn corrupt_payload_moves_to_next_peer() {
        let home = tempfile::tempdir().unwrap();
        let (bad, _) = fake_peer(b"YES\nnot a sealed payload".to_vec()).await;
        let (good, _) = fake_peer(yes_with(b"ok")).await;
        let c = client(home.path(), 0);

        assert!(matches!(
            c.ask_peer(&bad, "Demo", "x.txt").await,
            Err(LynkError::TransferCorrupt(_))
        ));
        let path = c.fetch_from_peers("Demo", "x.txt", &[bad, good]).await.unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"ok");
    }

    #[tokio::test]
    async fn rejects_path_like_names() {
        let home = tempfile::tempdir().unwrap();
        let res = client(home.path(), 0)
            .fetch_from_peers("Demo", "../escape", &[])
            .await;
        assert!(matches!(res, Err(LynkError::InvalidFormat(_))));
    }

    #[tokio::test]
    async fn fetch_file_discovers_then_downloads() {
        let home = tempfile::tempdir().unwrap();
        let (peer, _) = fake_peer(yes_with(b"from the swarm")).await;

        let tracker_addr = fake_tracker(&peer).await;
        register_demo(home.path(), &tracker_addr);
        let c = client(home.path(), 0);
        c.registry.add("Demo", "alice").await.unwrap();

        let path = c.fetch_file("Demo", "y.txt").await.unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"from the swarm");
    }

    #[tokio::test]
    async fn retries_then_surfaces_last_error() {
        let home = tempfile::tempdir().unwrap();
        let (peer, hits) = fake_peer(b"NO\n".to_vec()).await;

        let tracker_addr = fake_tracker(&peer).await;
        register_demo(home.path(), &tracker_addr);
        let c = client(home.path(), 2);
        c.registry.add("Demo", "alice").await.unwrap();

        let res = c.fetch_file("Demo", "y.txt").await;
        assert!(matches!(res, Err(LynkError::FileUnavailable { .. })));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn update_lynk_fetches_every_listed_file() {
        let home = tempfile::tempdir().unwrap();
        let (peer, hits) = fake_peer(yes_with(b"same body")).await;
        let tracker_addr = fake_tracker(&peer).await;
        let dir = two_file_manifest(home.path(), &tracker_addr);
        let c = client(home.path(), 0);
        c.registry.add("Demo", "alice").await.unwrap();

        c.update_lynk("Demo").await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(std::fs::read(dir.join("two.txt")).unwrap(), b"same body");
        let lynk = c.registry.get("Demo").await.unwrap();
        assert_eq!(lynk.status, SyncStatus::Synced);
        let root = std::fs::canonicalize(&dir).unwrap();
        assert!(lynk
            .files
            .iter()
            .all(|f| std::path::Path::new(&f.path).starts_with(&root)));
        assert!(!c.is_downloading("Demo"));

        c.fetch_missing("Demo").await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn silent_peer_does_not_stall_the_fetch() {
        let home = tempfile::tempdir().unwrap();
        let (good, _) = fake_peer(yes_with(b"still arrives")).await;
        let c = TransferClient::new(
            Arc::new(Registry::open(home.path()).unwrap()),
            TrackerClient::new(
                Arc::new(PeerDirectory::new()),
                "127.0.0.1",
                8080,
                Duration::from_millis(200),
                Duration::from_millis(200),
            ),
            Arc::new(Cipher::from_secret(SECRET)),
            Duration::from_millis(200),
            Duration::from_millis(200),
            0,
        );
        let peers = [silent_peer().await, good];

        let fetched = tokio::time::timeout(
            Duration::from_secs(3),
            c.fetch_from_peers("Demo", "x.txt", &peers),
        )
        .await
        .expect("fetch stalled on a silent peer")
        .unwrap();
        assert_eq!(std::fs::read(fetched).unwrap(), b"still arrives");
    }

    #[tokio::test]
    async fn stop_download_ends_update_before_next_file() {
        let home = tempfile::tempdir().unwrap();
        let (peer, hits) = slow_peer(yes_with(b"body"), Duration::from_millis(300)).await;
        let tracker_addr = fake_tracker(&peer).await;
        let dir = two_file_manifest(home.path(), &tracker_addr);
        let c = Arc::new(client(home.path(), 0));
        c.registry.add("Demo", "alice").await.unwrap();
        assert!(!c.stop_download("Demo"));

        let running = c.clone();
        let task = tokio::spawn(async move { running.update_lynk("Demo").await });
        while hits.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(c.is_downloading("Demo"));
        assert!(c.stop_download("Demo"));

        let res = task.await.unwrap();
        assert!(matches!(res, Err(LynkError::Stopped(l)) if l == "Demo"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(dir.join("one.txt").is_file());
        assert!(!dir.join("two.txt").exists());
        assert!(!c.is_downloading("Demo"));
        assert_eq!(c.registry.get("Demo").await.unwrap().status, SyncStatus::Unsynced);
    }
}
