//! Load config from file and environment.

use std::path::PathBuf;

use lynx_core::Config;
use tracing::warn;

/// Daemon configuration. File: ~/.config/lynx/config.toml or /etc/lynx/config.toml.
/// Env overrides: LYNX_HOME, LYNX_OWNER, LYNX_SERVER_PORT, LYNX_TRACKER_PORT,
/// LYNX_SYNC_INTERVAL, LYNX_SECRET.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |key| std::env::var(key).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("LYNX_HOME") {
        c.home = PathBuf::from(s);
    }
    if let Some(s) = var("LYNX_OWNER") {
        c.owner = s;
    }
    if let Some(p) = var("LYNX_SERVER_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.server_port = p;
    }
    if let Some(p) = var("LYNX_TRACKER_PORT").and_then(|s| s.parse::<u16>().ok()) {
        c.tracker_port = p;
    }
    if let Some(n) = var("LYNX_SYNC_INTERVAL").and_then(|s| s.parse::<u64>().ok()) {
        c.sync_interval_secs = n;
    }
    if let Some(s) = var("LYNX_SECRET") {
        c.shared_secret = s;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/lynx/config.toml"));
    }
    out.push(PathBuf::from("/etc/lynx/config.toml"));
    out
}

/// First existing config file wins; a file that does not parse falls back to defaults.
fn load_file() -> Option<Config> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    let text = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<Config>(&text) {
        Ok(c) => Some(c),
        Err(e) => {
            warn!("Ignoring {}: {}", path.display(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn file_values_and_defaults_merge() {
        let c: Config = toml::from_str("owner = \"carol\"\nserver_port = 8181\n").unwrap();
        assert_eq!(c.owner, "carol");
        assert_eq!(c.server_port, 8181);
        assert_eq!(c.tracker_port, 9000);
        assert!(toml::from_str::<Config>("proxy_port = 1\n").is_err());
    }

    #[test]
    fn env_overrides_file() {
        let vars: HashMap<&str, &str> = [
            ("LYNX_HOME", "/srv/lynx"),
            ("LYNX_SERVER_PORT", "7000"),
            ("LYNX_TRACKER_PORT", "not-a-port"),
            ("LYNX_SYNC_INTERVAL", "30"),
            ("LYNX_SECRET", "s3cret"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        apply_env(&mut c, |k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(c.home, PathBuf::from("/srv/lynx"));
        assert_eq!(c.server_port, 7000);
        assert_eq!(c.tracker_port, 9000);
        assert_eq!(c.sync_interval_secs, 30);
        assert_eq!(c.shared_secret, "s3cret");
    }
}
