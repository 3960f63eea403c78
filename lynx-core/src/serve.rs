//! Peer file service: answers file requests and tracker-address lookups from the swarm.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::crypto::Cipher;
use crate::error::{LynkError, Result};
use crate::lynk::is_plain_name;
use crate::registry::Registry;
use crate::wire::{self, Request};

/// Accept loop; one task per connection. Runs until the listener fails.
pub async fn run_peer_service(
    listener: TcpListener,
    registry: Arc<Registry>,
    cipher: Arc<Cipher>,
    read_timeout: Duration,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Peer file service listening on {}", addr);
    }
    loop {
        let (stream, remote) = listener.accept().await?;
        let registry = registry.clone();
        let cipher = cipher.clone();
        tokio::spawn(async move {
            if let Err(e) = handle(stream, &registry, &cipher, read_timeout).await {
                debug!("Peer connection {} ended: {}", remote, e);
            }
        });
    }
}

async fn handle(
    stream: TcpStream,
    registry: &Registry,
    cipher: &Cipher,
    read_timeout: Duration,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let Some(line) = wire::read_line(&mut reader, read_timeout).await? else {
        return Ok(());
    };
    match Request::parse(&line) {
        Some(Request::HaveFile { lynk, file }) => {
            let reply = match file_reply(registry, cipher, &lynk, &file).await {
                Ok(Some(payload)) => {
                    info!("Sending {}/{} ({} bytes encoded)", lynk, file, payload.len());
                    let mut out = format!("{}\n", wire::YES).into_bytes();
                    out.extend(payload);
                    out
                }
                Ok(None) => format!("{}\n", wire::NO).into_bytes(),
                Err(e) => {
                    warn!("Cannot serve {}/{}: {}", lynk, file, e);
                    format!("{}\n", wire::NO).into_bytes()
                }
            };
            writer.write_all(&reply).await?;
        }
        Some(Request::TrackerRequest { lynk }) => {
            let tracker = registry.tracker_of(&lynk).await?;
            writer.write_all(format!("{tracker}\n").as_bytes()).await?;
        }
        Some(Request::SwarmRequest { .. }) | None => {
            debug!("Ignoring request {:?}", line);
        }
    }
    writer.shutdown().await?;
    Ok(())
}

/// Encoded contents of a file we hold, or `None` if we do not list it.
async fn file_reply(
    registry: &Registry,
    cipher: &Cipher,
    lynk: &str,
    file: &str,
) -> Result<Option<Vec<u8>>> {
    if !is_plain_name(lynk) || !is_plain_name(file) {
        return Ok(None);
    }
    let _guard = registry.lock_lynk(lynk).await;
    if !registry.have_file(&format!("{lynk}/{file}")).await {
        return Ok(None);
    }
    let Some(path) = local_path(registry, lynk, file).await else {
        return Ok(None);
    };
    let data = tokio::fs::read(&path).await?;
    let payload = cipher
        .encode_payload(&data)
        .map_err(|e| LynkError::TransferCorrupt(e.to_string()))?;
    Ok(Some(payload))
}

/// The file under the lynk directory, else the manifest's recorded path if it lies
/// inside that directory.
async fn local_path(registry: &Registry, lynk: &str, file: &str) -> Option<PathBuf> {
    let dir = registry.lynk_dir(lynk);
    let direct = dir.join(file);
    if direct.is_file() {
        return Some(direct);
    }
    let recorded = PathBuf::from(&registry.get(lynk).await?.file(file)?.path);
    let root = std::fs::canonicalize(&dir).ok()?;
    let real = std::fs::canonicalize(&recorded).ok()?;
    inside(&root, &real).then_some(real)
}

fn inside(root: &Path, path: &Path) -> bool {
    path.starts_with(root) && path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lynk::Peer;
    use crate::manifest;
    use crate::peers::PeerDirectory;
    use crate::tracker::TrackerClient;
    use crate::transfer::TransferClient;
    use tokio::io::AsyncReadExt;

    const SECRET: &str = "serve-secret";

    async fn serving(home: &Path) -> (Peer, Arc<Registry>) {
        let dir = home.join("Demo");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("a.txt"), b"hello swarm").unwrap();
        manifest::build(&dir, "10.0.0.1:9000", "Demo", "alice").unwrap();
        let registry = Arc::new(Registry::open(home).unwrap());
        registry.add("Demo", "alice").await.unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(run_peer_service(
            listener,
            registry.clone(),
            Arc::new(Cipher::from_secret(SECRET)),
            Duration::from_secs(2),
        ));
        (Peer::new("127.0.0.1", port), registry)
    }

    async fn exchange(peer: &Peer, line: &str) -> Vec<u8> {
        let mut stream = TcpStream::connect(peer.addr()).await.unwrap();
        stream.write_all(line.as_bytes()).await.unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn answers_no_for_unknown_files() {
        let home = tempfile::tempdir().unwrap();
        let (peer, _) = serving(home.path()).await;
        assert_eq!(exchange(&peer, "Do_You_Have_FileName:Demo/zzz.txt\n").await, b"NO\n");
        assert_eq!(exchange(&peer, "Do_You_Have_FileName:Other/a.txt\n").await, b"NO\n");
        assert_eq!(exchange(&peer, "Do_You_Have_FileName:Demo/../lynks.txt\n").await, b"NO\n");
    }

    #[tokio::test]
    async fn answers_tracker_requests() {
        let home = tempfile::tempdir().unwrap();
        let (peer, _) = serving(home.path()).await;
        assert_eq!(exchange(&peer, "Tracker_Request:Demo/\n").await, b"10.0.0.1:9000\n");
    }

    #[tokio::test]
    async fn serves_sealed_payload_after_yes() {
        let home = tempfile::tempdir().unwrap();
        let (peer, _) = serving(home.path()).await;
        let reply = exchange(&peer, "Do_You_Have_FileName:Demo/a.txt\n").await;
        let payload = reply.strip_prefix(b"YES\n").unwrap();
        let plain = Cipher::from_secret(SECRET).decode_payload(payload).unwrap();
        assert_eq!(plain, b"hello swarm");
    }

    #[tokio::test]
    async fn transfer_client_fetches_from_service() {
        let server_home = tempfile::tempdir().unwrap();
        let (peer, _) = serving(server_home.path()).await;

        let client_home = tempfile::tempdir().unwrap();
        let client = TransferClient::new(
            Arc::new(Registry::open(client_home.path()).unwrap()),
            TrackerClient::new(
                Arc::new(PeerDirectory::new()),
                "127.0.0.1",
                0,
                Duration::from_millis(500),
                Duration::from_secs(2),
            ),
            Arc::new(Cipher::from_secret(SECRET)),
            Duration::from_millis(500),
            Duration::from_secs(2),
            0,
        );
        let path = client.fetch_from_peers("Demo", "a.txt", &[peer]).await.unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"hello swarm");
    }
}
