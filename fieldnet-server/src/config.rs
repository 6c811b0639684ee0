//! Load coordinator config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;
use tracing::warn;

/// Daemon configuration. File: ~/.config/fieldnet/config.toml or
/// /etc/fieldnet/config.toml. Env overrides: FIELDNET_LISTEN_PORT,
/// FIELDNET_BRIDGE_PORT, FIELDNET_CERT, FIELDNET_KEY.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Encrypted listener port (default 5050).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Plaintext sensor-facing bridge port. Disabled unless set; the
    /// conventional deployment value is 5051.
    #[serde(default)]
    pub bridge_port: Option<u16>,
    /// PEM certificate chain for the TLS listener.
    #[serde(default = "default_cert_path")]
    pub cert_path: PathBuf,
    /// PEM private key for the TLS listener.
    #[serde(default = "default_key_path")]
    pub key_path: PathBuf,
}

fn default_listen_port() -> u16 {
    5050
}
fn default_cert_path() -> PathBuf {
    PathBuf::from("/etc/fieldnet/server.crt")
}
fn default_key_path() -> PathBuf {
    PathBuf::from("/etc/fieldnet/server.key")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            bridge_port: None,
            cert_path: default_cert_path(),
            key_path: default_key_path(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_else(Config::default);
    if let Ok(s) = std::env::var("FIELDNET_LISTEN_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.listen_port = p;
        }
    }
    if let Ok(s) = std::env::var("FIELDNET_BRIDGE_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.bridge_port = Some(p);
        }
    }
    if let Ok(s) = std::env::var("FIELDNET_CERT") {
        c.cert_path = PathBuf::from(s);
    }
    if let Ok(s) = std::env::var("FIELDNET_KEY") {
        c.key_path = PathBuf::from(s);
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/fieldnet/config.toml"));
    }
    out.push(PathBuf::from("/etc/fieldnet/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<Config>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "config file failed to parse, using defaults")
                    }
                },
                Err(e) => {
                    warn!(path = %p.display(), error = %e, "config file unreadable, using defaults")
                }
            }
            break;
        }
    }
    None
}
