use std::path::{Path, PathBuf};

use libnixwire::paths;
use libnixwire::{ClientSettings, StderrMode};
use serde::Deserialize;
use tracing::warn;

/// Command used for `--stdio` when none is configured
pub const DEFAULT_DAEMON_COMMAND: &str = "nix-daemon --stdio";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// CLI configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Daemon socket, overriding `NIX_DAEMON_SOCKET_PATH`
    pub socket: Option<PathBuf>,

    /// Command spawned for the stdio transport
    /// e.g. "nix-daemon --stdio" or "ssh builder nix-daemon --stdio"
    pub daemon_command: Option<String>,

    pub stderr_mode: StderrMode,

    /// Settings pushed to the daemon right after connecting
    pub settings: Option<ClientSettings>,
}

impl Config {
    /// Load config from default location (~/.config/nixwire/config.toml)
    pub fn load() -> Self {
        let Some(path) = Self::config_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        Self::from_path(&path).unwrap_or_else(|e| {
            warn!("Ignoring config: {e}");
            Self::default()
        })
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }

    /// Get config file path
    fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("nixwire/config.toml"))
    }

    pub fn socket_path(&self) -> PathBuf {
        self.socket
            .clone()
            .unwrap_or_else(paths::default_socket_path)
    }

    pub fn daemon_command(&self) -> &str {
        self.daemon_command
            .as_deref()
            .unwrap_or(DEFAULT_DAEMON_COMMAND)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libnixwire::log::Verbosity;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn full_config() {
        let file = write_config(
            r#"
socket = "/run/nix/daemon.sock"
daemon_command = "sudo nix-daemon --stdio"
stderr_mode = "strict"

[settings]
keep_going = true
verbosity = "talkative"
max_build_jobs = 4

[settings.overrides]
substituters = "https://cache.nixos.org"
"#,
        );
        let config = Config::from_path(file.path()).unwrap();

        assert_eq!(config.socket_path(), PathBuf::from("/run/nix/daemon.sock"));
        assert_eq!(config.daemon_command(), "sudo nix-daemon --stdio");
        assert_eq!(config.stderr_mode, StderrMode::Strict);

        let settings = config.settings.unwrap();
        assert!(settings.keep_going);
        assert_eq!(settings.verbosity, Verbosity::Talkative);
        assert_eq!(settings.max_build_jobs, 4);
        assert!(settings.use_substitutes);
        assert_eq!(
            settings.overrides.get("substituters").map(String::as_str),
            Some("https://cache.nixos.org")
        );
    }

    #[test]
    fn empty_config_uses_defaults() {
        let file = write_config("");
        let config = Config::from_path(file.path()).unwrap();
        assert_eq!(config.daemon_command(), DEFAULT_DAEMON_COMMAND);
        assert_eq!(config.stderr_mode, StderrMode::Compat);
        assert!(config.settings.is_none());
    }

    #[test]
    fn unknown_stderr_mode_is_an_error() {
        let file = write_config("stderr_mode = \"fast\"");
        let err = Config::from_path(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::from_path(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
