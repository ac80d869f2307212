mod config;

use std::io::{self, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{self, Child, ExitCode, Stdio};

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use libnixwire::{Connection, ConnectionOptions, StderrMode};

use crate::config::Config;

type DaemonConnection = Connection<Box<dyn Read>, Box<dyn Write>, io::Stderr>;

/// nixwire - talk to a Nix daemon over its worker protocol
#[derive(Parser)]
#[command(name = "nixwire", version, about)]
struct Cli {
    /// Daemon socket (default: $NIX_DAEMON_SOCKET_PATH or the system socket)
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    /// Spawn the daemon and talk to it over stdin/stdout
    #[arg(long, global = true)]
    stdio: bool,

    /// Decode stderr frames directly from the stream
    #[arg(long, global = true)]
    strict: bool,

    /// Read configuration from this file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check whether store paths are valid
    IsValid {
        /// Store paths to check
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Show what the daemon reported during the handshake
    Info,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("nixwire=info,libnixwire=info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => match Config::from_path(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error: {e}");
                return ExitCode::from(2);
            }
        },
        None => Config::load(),
    };

    let (mut conn, child) = match connect(&cli, &config) {
        Ok(parts) => parts,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::from(2);
        }
    };

    let code = match &cli.command {
        Command::IsValid { paths } => cmd_is_valid(&mut conn, paths),
        Command::Info => cmd_info(&conn),
    };

    // Closing our end lets a stdio daemon exit
    drop(conn);
    if let Some(mut child) = child {
        if let Err(e) = child.wait() {
            warn!("Failed to wait for daemon: {e}");
        }
    }
    code
}

fn connect(
    cli: &Cli,
    config: &Config,
) -> Result<(DaemonConnection, Option<Child>), Box<dyn std::error::Error>> {
    let (reader, writer, child) = if cli.stdio {
        spawn_daemon(config.daemon_command())?
    } else {
        let path = cli.socket.clone().unwrap_or_else(|| config.socket_path());
        let (reader, writer) = open_socket(&path)?;
        (reader, writer, None)
    };

    let stderr_mode = if cli.strict {
        StderrMode::Strict
    } else {
        config.stderr_mode
    };
    let mut conn = Connection::with_options(
        reader,
        writer,
        io::stderr(),
        ConnectionOptions { stderr_mode },
    )?;

    if let Some(settings) = &config.settings {
        conn.set_options(settings)?;
    }
    Ok((conn, child))
}

fn open_socket(path: &Path) -> io::Result<(Box<dyn Read>, Box<dyn Write>)> {
    let stream = UnixStream::connect(path).map_err(|e| {
        if e.kind() == io::ErrorKind::ConnectionRefused || e.kind() == io::ErrorKind::NotFound {
            io::Error::new(
                e.kind(),
                format!(
                    "cannot connect to daemon socket ({}): is nix-daemon running?",
                    path.display()
                ),
            )
        } else {
            e
        }
    })?;
    info!(socket = %path.display(), "Connecting to daemon socket");
    let writer = stream.try_clone()?;
    Ok((Box::new(BufReader::new(stream)), Box::new(writer)))
}

fn spawn_daemon(command: &str) -> io::Result<(Box<dyn Read>, Box<dyn Write>, Option<Child>)> {
    let mut words = command.split_whitespace();
    let program = words
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty daemon command"))?;

    let mut child = process::Command::new(program)
        .args(words)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .map_err(|e| io::Error::new(e.kind(), format!("cannot spawn `{command}`: {e}")))?;
    info!(%command, pid = child.id(), "Spawned daemon");

    let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
        return Err(io::Error::other("daemon pipes unavailable"));
    };
    Ok((Box::new(BufReader::new(stdout)), Box::new(stdin), Some(child)))
}

/// Exit status: 0 if every path is valid, 1 if any is not, 2 on error
fn cmd_is_valid(conn: &mut DaemonConnection, paths: &[String]) -> ExitCode {
    let mut all_valid = true;
    for path in paths {
        match conn.is_valid_path(path) {
            Ok(true) => println!("{path}: valid"),
            Ok(false) => {
                println!("{path}: invalid");
                all_valid = false;
            }
            Err(e) => {
                // The stream position is unknown after a failed reply
                eprintln!("Error: {path}: {e}");
                return ExitCode::from(2);
            }
        }
    }
    if all_valid {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}

fn cmd_info(conn: &DaemonConnection) -> ExitCode {
    let peer = conn.peer();
    println!("nix version: {}", peer.nix_version);
    println!("protocol:    {}", peer.protocol);
    println!("trust:       {}", peer.trust);
    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_is_valid() {
        let cli = Cli::try_parse_from([
            "nixwire",
            "--strict",
            "is-valid",
            "/nix/store/abc-hello",
            "/nix/store/def-world",
        ])
        .unwrap();
        assert!(cli.strict);
        assert!(!cli.stdio);
        match cli.command {
            Command::IsValid { paths } => assert_eq!(paths.len(), 2),
            Command::Info => panic!("wrong subcommand"),
        }
    }

    #[test]
    fn is_valid_needs_a_path() {
        assert!(Cli::try_parse_from(["nixwire", "is-valid"]).is_err());
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["nixwire", "info", "--socket", "/tmp/nix.sock"]).unwrap();
        assert_eq!(cli.socket, Some(PathBuf::from("/tmp/nix.sock")));
        assert!(matches!(cli.command, Command::Info));
    }

    #[test]
    fn empty_daemon_command() {
        let err = spawn_daemon("   ").err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
