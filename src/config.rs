//! Layered runtime configuration (§4.10).
//!
//! Precedence, lowest to highest: built-in defaults < TOML file
//! (`kwmd.toml` in the platform config directory) < `KWMD_*` environment
//! variables < CLI flags. Everything is validated eagerly at startup so a
//! bad value is rejected before any socket opens, not discovered mid-run.

use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{fs, io};

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{CoreError, SemanticError};

/// Fully resolved, validated configuration for one `kwmd` process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Directory holding the event log and serialization blobs (§4.9).
    pub data_dir: PathBuf,
    /// Path to the Unix-domain socket the external-client broker listens on.
    pub socket_path: PathBuf,
    /// Path to the TLS tunnel proxy executable (§4.2, §6).
    pub proxy_path: PathBuf,
    /// Path to the crypto-helper sub-process executable (§4.4).
    pub helper_path: PathBuf,

    pub reconnect_delay: DurationSeconds,
    pub backoff_factor: u32,
    pub max_backoff: u32,
    pub wm_serialization_delay: DurationSeconds,
    pub server_transfer_budget: usize,
    pub queue_quench_max: usize,

    pub tunnel_connect_timeout: DurationSeconds,
    pub tunnel_auth_timeout: DurationSeconds,

    /// Passphrase used to derive the at-rest encryption key for the blob
    /// store (§4.9). Never logged, never included in `--print-config`.
    #[serde(skip_serializing)]
    pub encryption_passphrase: Option<String>,
}

/// A `Duration` that (de)serializes as whole seconds, matching how the
/// config file and environment overrides express time values.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DurationSeconds(pub u64);

impl DurationSeconds {
    pub fn as_duration(self) -> Duration {
        Duration::from_secs(self.0)
    }
}

impl From<Duration> for DurationSeconds {
    fn from(d: Duration) -> Self {
        DurationSeconds(d.as_secs())
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let base = default_config_dir();
        Self {
            data_dir: base.join("data"),
            socket_path: base.join("kwmd.sock"),
            proxy_path: PathBuf::from("kwm-proxy"),
            helper_path: PathBuf::from("kwm-crypto-helper"),
            reconnect_delay: constants::RECONNECT_DELAY.into(),
            backoff_factor: constants::BACKOFF_FACTOR,
            max_backoff: constants::MAX_BACKOFF,
            wm_serialization_delay: constants::WM_SERIALIZATION_DELAY.into(),
            server_transfer_budget: constants::SERVER_TRANSFER_BUDGET,
            queue_quench_max: constants::QUEUE_QUENCH_MAX,
            tunnel_connect_timeout: constants::TUNNEL_CONNECT_TIMEOUT.into(),
            tunnel_auth_timeout: constants::TUNNEL_AUTH_TIMEOUT.into(),
            encryption_passphrase: None,
        }
    }
}

/// On-disk representation of `kwmd.toml`. Every field is optional: absent
/// fields fall back through env vars to the built-in default.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    data_dir: Option<PathBuf>,
    socket_path: Option<PathBuf>,
    proxy_path: Option<PathBuf>,
    helper_path: Option<PathBuf>,
    reconnect_delay_secs: Option<u64>,
    backoff_factor: Option<u32>,
    max_backoff: Option<u32>,
    wm_serialization_delay_secs: Option<u64>,
    server_transfer_budget: Option<usize>,
    queue_quench_max: Option<usize>,
    tunnel_connect_timeout_secs: Option<u64>,
    tunnel_auth_timeout_secs: Option<u64>,
}

/// CLI-flag overrides layered on top of file + env (highest precedence).
#[derive(Debug, Default)]
pub struct CliOverrides {
    pub data_dir: Option<PathBuf>,
    pub socket_path: Option<PathBuf>,
}

pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("kwmd"))
        .unwrap_or_else(|| PathBuf::from("kwmd"))
}

impl RuntimeConfig {
    /// Loads the config file (if present at `config_path`, or the platform
    /// default otherwise), applies `KWMD_*` env overrides, then `cli`
    /// overrides, and validates the result.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides) -> Result<Self, CoreError> {
        let mut cfg = RuntimeConfig::default();

        let path = config_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| default_config_dir().join("kwmd.toml"));
        if let Some(file) = load_file(&path)? {
            cfg.apply_file(file);
        }

        cfg.apply_env();
        cfg.apply_cli(cli);
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_file(&mut self, f: FileConfig) {
        if let Some(v) = f.data_dir {
            self.data_dir = v;
        }
        if let Some(v) = f.socket_path {
            self.socket_path = v;
        }
        if let Some(v) = f.proxy_path {
            self.proxy_path = v;
        }
        if let Some(v) = f.helper_path {
            self.helper_path = v;
        }
        if let Some(v) = f.reconnect_delay_secs {
            self.reconnect_delay = DurationSeconds(v);
        }
        if let Some(v) = f.backoff_factor {
            self.backoff_factor = v;
        }
        if let Some(v) = f.max_backoff {
            self.max_backoff = v;
        }
        if let Some(v) = f.wm_serialization_delay_secs {
            self.wm_serialization_delay = DurationSeconds(v);
        }
        if let Some(v) = f.server_transfer_budget {
            self.server_transfer_budget = v;
        }
        if let Some(v) = f.queue_quench_max {
            self.queue_quench_max = v;
        }
        if let Some(v) = f.tunnel_connect_timeout_secs {
            self.tunnel_connect_timeout = DurationSeconds(v);
        }
        if let Some(v) = f.tunnel_auth_timeout_secs {
            self.tunnel_auth_timeout = DurationSeconds(v);
        }
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("KWMD_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("KWMD_SOCKET_PATH") {
            self.socket_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("KWMD_PROXY_PATH") {
            self.proxy_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("KWMD_HELPER_PATH") {
            self.helper_path = PathBuf::from(v);
        }
        if let Some(v) = env_u64("KWMD_RECONNECT_DELAY_SECS") {
            self.reconnect_delay = DurationSeconds(v);
        }
        if let Some(v) = env_u32("KWMD_BACKOFF_FACTOR") {
            self.backoff_factor = v;
        }
        if let Some(v) = env_u32("KWMD_MAX_BACKOFF") {
            self.max_backoff = v;
        }
        if let Some(v) = env_u64("KWMD_WM_SERIALIZATION_DELAY_SECS") {
            self.wm_serialization_delay = DurationSeconds(v);
        }
        if let Some(v) = env_usize("KWMD_SERVER_TRANSFER_BUDGET") {
            self.server_transfer_budget = v;
        }
        if let Some(v) = env_usize("KWMD_QUEUE_QUENCH_MAX") {
            self.queue_quench_max = v;
        }
        if let Ok(v) = std::env::var("KWMD_ENCRYPTION_PASSPHRASE") {
            self.encryption_passphrase = Some(v);
        }
    }

    fn apply_cli(&mut self, cli: CliOverrides) {
        if let Some(v) = cli.data_dir {
            self.data_dir = v;
        }
        if let Some(v) = cli.socket_path {
            self.socket_path = v;
        }
    }

    /// Rejects nonsensical values before any socket is opened (§4.10).
    pub fn validate(&self) -> Result<(), CoreError> {
        let bad = |msg: &str| {
            CoreError::Semantic(SemanticError::InvalidConfig(msg.to_string()))
        };

        if self.data_dir.as_os_str().is_empty() {
            return Err(bad("data_dir must not be empty"));
        }
        if self.socket_path.as_os_str().is_empty() {
            return Err(bad("socket_path must not be empty"));
        }
        if self.backoff_factor < 1 {
            return Err(bad("backoff_factor must be >= 1"));
        }
        if self.server_transfer_budget == 0 {
            return Err(bad("server_transfer_budget must be > 0"));
        }
        if self.queue_quench_max == 0 {
            return Err(bad("queue_quench_max must be > 0"));
        }
        if self.reconnect_delay.0 == 0 {
            return Err(bad("reconnect_delay must be > 0 seconds"));
        }
        if self.tunnel_connect_timeout.0 == 0 {
            return Err(bad("tunnel_connect_timeout must be > 0 seconds"));
        }
        Ok(())
    }

    /// JSON rendering used by `kwmd print-config`; never includes the
    /// encryption passphrase.
    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn ensure_data_dir(&self) -> io::Result<()> {
        fs::create_dir_all(&self.data_dir)
    }
}

fn load_file(path: &Path) -> Result<Option<FileConfig>, CoreError> {
    if !path.exists() {
        return Ok(None);
    }
    let text = fs::read_to_string(path)
        .map_err(|e| CoreError::Semantic(SemanticError::InvalidConfig(e.to_string())))?;
    let parsed: FileConfig = toml::from_str(&text)
        .map_err(|e| CoreError::Semantic(SemanticError::InvalidConfig(e.to_string())))?;
    Ok(Some(parsed))
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
fn env_u32(key: &str) -> Option<u32> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_validates() {
        assert!(RuntimeConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_backoff_factor_rejected() {
        let mut cfg = RuntimeConfig::default();
        cfg.backoff_factor = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn env_override_beats_file_and_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kwmd.toml");
        let mut f = fs::File::create(&path).unwrap();
        writeln!(f, "backoff_factor = 7").unwrap();

        std::env::set_var("KWMD_BACKOFF_FACTOR", "9");
        let cfg = RuntimeConfig::load(Some(&path), CliOverrides::default()).unwrap();
        std::env::remove_var("KWMD_BACKOFF_FACTOR");

        assert_eq!(cfg.backoff_factor, 9);
    }

    #[test]
    fn file_overrides_default_when_no_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kwmd.toml");
        let mut f = fs::File::create(&path).unwrap();
        writeln!(f, "max_backoff = 11").unwrap();

        let cfg = RuntimeConfig::load(Some(&path), CliOverrides::default()).unwrap();
        assert_eq!(cfg.max_backoff, 11);
    }

    #[test]
    fn cli_override_beats_everything() {
        let cli = CliOverrides {
            data_dir: Some(PathBuf::from("/tmp/kwmd-cli-override")),
            socket_path: None,
        };
        let cfg = RuntimeConfig::load(None, cli).unwrap();
        assert_eq!(cfg.data_dir, PathBuf::from("/tmp/kwmd-cli-override"));
    }

    #[test]
    fn print_config_omits_passphrase() {
        let mut cfg = RuntimeConfig::default();
        cfg.encryption_passphrase = Some("super-secret".to_string());
        let json = cfg.to_json_pretty().unwrap();
        assert!(!json.contains("super-secret"));
    }
}
