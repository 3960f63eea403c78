//! Node configuration. Loading from file and environment is the host's job.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Lynx home directory holding `lynks.txt` and one directory per lynk.
    pub home: PathBuf,
    /// Owner recorded in lynks published from this node.
    pub owner: String,
    /// Port of our peer file service, announced to trackers.
    pub server_port: u16,
    /// Tracker port written into newly published manifests.
    pub tracker_port: u16,
    /// Address announced to trackers; detected when unset.
    pub advertise_ip: Option<IpAddr>,
    pub sync_interval_secs: u64,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    /// Extra whole-file attempts after a failed fetch.
    pub fetch_retries: u32,
    /// Passphrase the shared payload key is derived from.
    pub shared_secret: String,
}

impl Default for Config {
    fn default() -> Self {
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Lynx");
        let owner = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
        Self {
            home,
            owner,
            server_port: 8080,
            tracker_port: 9000,
            advertise_ip: None,
            sync_interval_secs: 10,
            connect_timeout_ms: 2_000,
            read_timeout_ms: 10_000,
            fetch_retries: 3,
            shared_secret: "lynx".to_string(),
        }
    }
}

impl Config {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }

    /// IP this node announces: configured, else first routable IPv4, else loopback.
    pub fn self_ip(&self) -> IpAddr {
        self.advertise_ip
            .or_else(detect_ipv4)
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }
}

/// Connecting a UDP socket sends nothing; it only selects the outbound interface.
fn detect_ipv4() -> Option<IpAddr> {
    let sock = UdpSocket::bind(("0.0.0.0", 0)).ok()?;
    sock.connect(("192.0.2.1", 9)).ok()?;
    let ip = sock.local_addr().ok()?.ip();
    (!ip.is_loopback() && !ip.is_unspecified()).then_some(ip)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advertise_ip_wins() {
        let cfg = Config {
            advertise_ip: Some("10.1.2.3".parse().unwrap()),
            ..Config::default()
        };
        assert_eq!(cfg.self_ip().to_string(), "10.1.2.3");
    }

    #[test]
    fn defaults_match_lynx_ports() {
        let cfg = Config::default();
        assert_eq!(cfg.server_port, 8080);
        assert_eq!(cfg.tracker_port, 9000);
        assert!(cfg.home.ends_with("Lynx"));
        assert_eq!(cfg.sync_interval(), Duration::from_secs(10));
    }
}
