// Lynx Linux: peer file service, tracker and periodic reconciliation daemon.

mod config;
mod swarm;
mod tracker;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use lynx_core::{Node, PeerDirectory};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::swarm::TrackerSwarm;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Run,
    Version,
    Publish(String),
    Join(PathBuf),
    Remove { name: String, delete_local: bool },
    List,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> anyhow::Result<Command> {
    let args: Vec<String> = args.into_iter().collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        return Ok(Command::Version);
    }
    let cmd = match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        [] | ["run"] => Command::Run,
        ["publish", name] => Command::Publish(name.to_string()),
        ["join", path] => Command::Join(PathBuf::from(path)),
        ["remove", name] => Command::Remove {
            name: name.to_string(),
            delete_local: false,
        },
        ["remove", name, "--delete-local"] => Command::Remove {
            name: name.to_string(),
            delete_local: true,
        },
        ["list"] => Command::List,
        other => bail!(
            "unrecognised arguments {:?}; usage: lynx-linux [run | publish <name> | join <meta.info> | remove <name> [--delete-local] | list]",
            other
        ),
    };
    Ok(cmd)
}

fn main() -> anyhow::Result<()> {
    let command = parse_args(std::env::args().skip(1))?;
    if command == Command::Version {
        println!("lynx-linux {}", VERSION);
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("lynx_core=info,lynx_linux=info")),
        )
        .init();

    let cfg = config::load();
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg, command))
}

async fn run(cfg: lynx_core::Config, command: Command) -> anyhow::Result<()> {
    let swarms = Arc::new(PeerDirectory::new());
    let peers = Arc::new(PeerDirectory::new());
    let swarm = TrackerSwarm::new(&cfg, swarms.clone(), peers.clone());
    let node = Node::open_with_peers(cfg.clone(), peers, swarm)
        .with_context(|| format!("opening Lynx home {}", cfg.home.display()))?;

    match command {
        Command::Run => serve(node, swarms).await?,
        Command::Publish(name) => {
            let lynk = node
                .publish(&name)
                .await
                .with_context(|| format!("publishing {name}"))?;
            println!(
                "Published {} ({} file(s)); share {}",
                lynk.name,
                lynk.files.len(),
                node.registry().manifest_path(&lynk.name).display()
            );
        }
        Command::Join(path) => node
            .join(&path)
            .await
            .with_context(|| format!("joining {}", path.display()))?,
        Command::Remove { name, delete_local } => node
            .remove(&name, delete_local)
            .await
            .with_context(|| format!("removing {name}"))?,
        Command::List => {
            for (i, lynk) in node.lynks().await.iter().enumerate() {
                println!(
                    "{i}\t{}\t{}\t{}\t{} file(s)",
                    lynk.name,
                    lynk.owner,
                    lynk.status,
                    lynk.files.len()
                );
            }
        }
        Command::Version => {}
    }
    Ok(())
}

/// Long-running mode: both listeners plus the reconciliation timer, until a signal.
async fn serve(node: Node<TrackerSwarm>, swarms: Arc<PeerDirectory>) -> anyhow::Result<()> {
    let cfg = node.config().clone();
    let read_timeout = cfg.read_timeout();
    let period = cfg.sync_interval();
    let peer_listener = TcpListener::bind(("0.0.0.0", cfg.server_port))
        .await
        .with_context(|| format!("binding peer service port {}", cfg.server_port))?;
    let tracker_listener = TcpListener::bind(("0.0.0.0", cfg.tracker_port))
        .await
        .with_context(|| format!("binding tracker port {}", cfg.tracker_port))?;

    tokio::spawn(lynx_core::serve::run_peer_service(
        peer_listener,
        node.registry().clone(),
        node.cipher().clone(),
        read_timeout,
    ));
    tokio::spawn(async move {
        if let Err(e) = tracker::run_tracker(tracker_listener, swarms, read_timeout).await {
            warn!("Tracker stopped: {:#}", e);
        }
    });

    seed_own_swarms(&node).await?;

    let node = Arc::new(node);
    let syncer = node.clone();
    let sync_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            if let Err(e) = syncer.registry().reload().await {
                warn!("Reloading registry failed: {}", e);
                continue;
            }
            if let Err(e) = seed_own_swarms(&syncer).await {
                warn!("Seeding swarms failed: {}", e);
            }
            let report = syncer.sync_all().await;
            for (name, e) in &report.failed {
                warn!("{} not reconciled: {}", name, e);
            }
        }
    });
    info!(
        "lynx-linux {} running: peers on {}, tracker on {}, sync every {:?}",
        VERSION,
        cfg.server_port,
        cfg.tracker_port,
        period
    );

    shutdown_signal().await?;
    sync_task.abort();
    let _ = sync_task.await;
    if let Ok(node) = Arc::try_unwrap(node) {
        node.close().await;
    }
    Ok(())
}

/// Swarms of lynks we publish live in our tracker's memory only, so every lynk naming
/// this node's tracker (including ones published by a separate `publish` run) is seeded.
async fn seed_own_swarms(node: &Node<TrackerSwarm>) -> lynx_core::Result<()> {
    let own_tracker = node.tracker_addr();
    for lynk in node.lynks().await {
        if lynk.tracker == own_tracker {
            lynx_core::SwarmService::create_swarm(node.swarm(), &lynk.name).await?;
        }
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix). On shutdown, runtime and tasks exit; systemd may restart if configured.
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lynx_core::{Config, Peer};

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn commands_parse() {
        assert_eq!(parse_args(args(&[])).unwrap(), Command::Run);
        assert_eq!(parse_args(args(&["-V"])).unwrap(), Command::Version);
        assert_eq!(
            parse_args(args(&["publish", "Demo"])).unwrap(),
            Command::Publish("Demo".into())
        );
        assert_eq!(
            parse_args(args(&["remove", "Demo", "--delete-local"])).unwrap(),
            Command::Remove {
                name: "Demo".into(),
                delete_local: true
            }
        );
        assert_eq!(
            parse_args(args(&["join", "/tmp/meta.info"])).unwrap(),
            Command::Join(PathBuf::from("/tmp/meta.info"))
        );
        assert!(parse_args(args(&["publish"])).is_err());
    }

    #[tokio::test]
    async fn running_daemon_seeds_lynks_published_later() {
        let home = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(home.path().join("Demo")).unwrap();
        std::fs::write(home.path().join("Demo").join("a.txt"), b"a").unwrap();
        let cfg = Config {
            home: home.path().to_path_buf(),
            advertise_ip: Some("127.0.0.1".parse().unwrap()),
            server_port: 18090,
            ..Config::default()
        };
        let open = |table: Arc<PeerDirectory>| {
            let peers = Arc::new(PeerDirectory::new());
            let swarm = TrackerSwarm::new(&cfg, table, peers.clone());
            Node::open_with_peers(cfg.clone(), peers, swarm).unwrap()
        };

        let table = Arc::new(PeerDirectory::new());
        let daemon = open(table.clone());
        seed_own_swarms(&daemon).await.unwrap();

        // A separate `publish` run has its own, throwaway tracker table.
        let cli = open(Arc::new(PeerDirectory::new()));
        cli.publish("Demo").await.unwrap();
        assert!(table.peers_of("Demo").is_empty());

        daemon.registry().reload().await.unwrap();
        seed_own_swarms(&daemon).await.unwrap();
        assert_eq!(table.peers_of("Demo"), vec![Peer::new("127.0.0.1", 18090)]);
    }
}
