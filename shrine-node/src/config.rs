//! Load node config from file and environment.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::Deserialize;
use shrine_core::{
    sha1_transform, sha256_transform, BincodeCodec, JsonCodec, NopHandshake, PathTransform,
    ServerConfig, Settle, VersionHandshake,
};

/// Node configuration. File: `--config PATH`, else ~/.config/shrine/config.toml, else
/// /etc/shrine/config.toml. Env overrides: SHRINE_LISTEN_ADDR, SHRINE_BOOTSTRAP
/// (comma-separated), SHRINE_STORAGE_ROOT.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// TCP listen address (default 0.0.0.0:7070).
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Seed peers dialed on start.
    #[serde(default)]
    pub bootstrap: Vec<String>,
    /// Directory holding one file per stored key.
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,
    #[serde(default)]
    pub path_transform: PathTransformKind,
    #[serde(default)]
    pub codec: CodecKind,
    #[serde(default)]
    pub handshake: HandshakeKind,
    /// Wait for peer acks up to this long before streaming. Ignored if `settle_delay_ms` is set.
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    /// Fixed sleep between announce and stream instead of waiting for acks.
    #[serde(default)]
    pub settle_delay_ms: Option<u64>,
    /// 0 disables the handshake timeout.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Force-close a peer whose stream is not drained in time. Unset waits forever.
    #[serde(default)]
    pub stream_timeout_ms: Option<u64>,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PathTransformKind {
    #[default]
    Sha1,
    Sha256,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    #[default]
    Bincode,
    Json,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HandshakeKind {
    #[default]
    Version,
    None,
}

fn default_listen_addr() -> String {
    "0.0.0.0:7070".to_string()
}
fn default_storage_root() -> PathBuf {
    PathBuf::from("shrine-data")
}
fn default_ack_timeout_ms() -> u64 {
    2000
}
fn default_handshake_timeout_ms() -> u64 {
    10_000
}
fn default_queue_capacity() -> usize {
    1024
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            bootstrap: Vec::new(),
            storage_root: default_storage_root(),
            path_transform: PathTransformKind::default(),
            codec: CodecKind::default(),
            handshake: HandshakeKind::default(),
            ack_timeout_ms: default_ack_timeout_ms(),
            settle_delay_ms: None,
            handshake_timeout_ms: default_handshake_timeout_ms(),
            stream_timeout_ms: None,
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Config {
    pub fn into_server_config(self) -> ServerConfig {
        let transform: PathTransform = match self.path_transform {
            PathTransformKind::Sha1 => Arc::new(sha1_transform),
            PathTransformKind::Sha256 => Arc::new(sha256_transform),
        };
        let settle = match self.settle_delay_ms {
            Some(ms) => Settle::Delay(Duration::from_millis(ms)),
            None => Settle::Ack {
                timeout: Duration::from_millis(self.ack_timeout_ms),
            },
        };

        let mut server = ServerConfig::new(self.listen_addr, self.storage_root)
            .with_bootstrap(self.bootstrap)
            .with_path_transform(transform)
            .with_settle(settle);
        server = match self.codec {
            CodecKind::Bincode => server.with_codec(Arc::new(BincodeCodec)),
            CodecKind::Json => server.with_codec(Arc::new(JsonCodec)),
        };
        server = match self.handshake {
            HandshakeKind::Version => server.with_handshake(Arc::new(VersionHandshake)),
            HandshakeKind::None => server.with_handshake(Arc::new(NopHandshake)),
        };
        server.transport.queue_capacity = self.queue_capacity;
        server.transport.handshake_timeout =
            (self.handshake_timeout_ms > 0).then(|| Duration::from_millis(self.handshake_timeout_ms));
        server.transport.stream_timeout = self.stream_timeout_ms.map(Duration::from_millis);
        server
    }
}

/// Load config: defaults, then config file (if present), then env vars.
/// An explicit `path` must exist and parse; the well-known locations are optional.
pub fn load(path: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match path {
        Some(p) => load_file(p)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(p) => load_file(&p)?,
            None => Config::default(),
        },
    };
    apply_env(&mut c, |name| std::env::var(name).ok());
    Ok(c)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("SHRINE_LISTEN_ADDR") {
        if !s.is_empty() {
            c.listen_addr = s;
        }
    }
    if let Some(s) = var("SHRINE_BOOTSTRAP") {
        c.bootstrap = s
            .split(',')
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(String::from)
            .collect();
    }
    if let Some(s) = var("SHRINE_STORAGE_ROOT") {
        if !s.is_empty() {
            c.storage_root = PathBuf::from(s);
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/shrine/config.toml"));
    }
    out.push(PathBuf::from("/etc/shrine/config.toml"));
    out
}

fn load_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let c: Config =
        toml::from_str(&s).with_context(|| format!("parsing config {}", path.display()))?;
    if c.queue_capacity == 0 {
        bail!("{}: queue_capacity must be at least 1", path.display());
    }
    Ok(c)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn write(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let p = dir.path().join("config.toml");
        std::fs::write(&p, body).unwrap();
        p
    }

    #[test]
    fn empty_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let p = write(&dir, "");
        assert_eq!(load_file(&p).unwrap(), Config::default());
    }

    #[test]
    fn file_values_parse() {
        let dir = tempfile::tempdir().unwrap();
        let p = write(
            &dir,
            r#"
listen_addr = "127.0.0.1:4000"
bootstrap = ["127.0.0.1:3000", "127.0.0.1:5000"]
storage_root = "/var/lib/shrine"
path_transform = "sha256"
codec = "json"
handshake = "none"
settle_delay_ms = 5
stream_timeout_ms = 30000
"#,
        );
        let c = load_file(&p).unwrap();
        assert_eq!(c.listen_addr, "127.0.0.1:4000");
        assert_eq!(c.bootstrap.len(), 2);
        assert_eq!(c.storage_root, PathBuf::from("/var/lib/shrine"));
        assert_eq!(c.path_transform, PathTransformKind::Sha256);
        assert_eq!(c.codec, CodecKind::Json);
        assert_eq!(c.handshake, HandshakeKind::None);

        let server = c.into_server_config();
        assert_eq!(server.settle, Settle::Delay(Duration::from_millis(5)));
        assert_eq!(
            server.transport.stream_timeout,
            Some(Duration::from_secs(30))
        );
        let transform = server.path_transform.unwrap();
        assert_eq!(transform("hello"), sha256_transform("hello"));
    }

    #[test]
    fn unknown_fields_and_bad_choices_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_file(&write(&dir, "proxy_port = 3128")).is_err());
        assert!(load_file(&write(&dir, "codec = \"xml\"")).is_err());
        assert!(load_file(&write(&dir, "queue_capacity = 0")).is_err());
    }

    #[test]
    fn explicit_missing_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(Some(&dir.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn env_overrides_file() {
        let env: HashMap<&str, &str> = [
            ("SHRINE_LISTEN_ADDR", "127.0.0.1:9999"),
            ("SHRINE_BOOTSTRAP", " 10.0.0.1:7070, ,10.0.0.2:7070"),
            ("SHRINE_STORAGE_ROOT", "/tmp/shrine"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        apply_env(&mut c, |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.listen_addr, "127.0.0.1:9999");
        assert_eq!(c.bootstrap, vec!["10.0.0.1:7070", "10.0.0.2:7070"]);
        assert_eq!(c.storage_root, PathBuf::from("/tmp/shrine"));
    }

    #[test]
    fn defaults_map_to_ack_settle() {
        let server = Config::default().into_server_config();
        assert_eq!(
            server.settle,
            Settle::Ack {
                timeout: Duration::from_secs(2)
            }
        );
        assert_eq!(
            server.transport.handshake_timeout,
            Some(Duration::from_secs(10))
        );
        assert_eq!(server.transport.queue_capacity, 1024);
    }
}
