use std::env;
use std::path::PathBuf;

/// Socket the daemon listens on in a default multi-user install
pub const DEFAULT_SOCKET_PATH: &str = "/nix/var/nix/daemon-socket/socket";

/// Environment variable overriding the daemon socket location
pub const SOCKET_PATH_VAR: &str = "NIX_DAEMON_SOCKET_PATH";

/// Get the daemon socket path
pub fn default_socket_path() -> PathBuf {
    socket_path_from(env::var_os(SOCKET_PATH_VAR))
}

fn socket_path_from(var: Option<std::ffi::OsString>) -> PathBuf {
    match var {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => PathBuf::from(DEFAULT_SOCKET_PATH),
    }
}
