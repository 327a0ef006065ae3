//! Command-line options for both binaries

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{ClientConfig, ServerConfig};

/// Daemon options used by syncboxd
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "syncbox daemon: per-user file store for syncbox clients")]
pub struct DaemonOpts {
    /// TCP port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Directory holding the password file and user areas
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Concurrent connection limit
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// TOML settings file; flags override it
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl DaemonOpts {
    pub fn apply(&self, cfg: &mut ServerConfig) {
        if let Some(port) = self.port {
            cfg.port = port;
        }
        if let Some(dir) = &self.data_dir {
            cfg.data_dir = dir.clone();
        }
        if let Some(max) = self.max_connections {
            cfg.max_connections = max;
        }
    }
}

/// Client options. `-h` names the host, so help is `--help` only.
#[derive(Clone, Debug, Parser)]
#[command(
    author,
    version,
    about = "syncbox: keep a local directory in step with your area on a syncbox server",
    disable_help_flag = true
)]
pub struct ClientOpts {
    /// Server host name or address
    #[arg(short = 'h', long)]
    pub host: Option<String>,

    /// Server port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Local directory to keep in sync
    #[arg(long)]
    pub dir: Option<PathBuf>,

    /// Account name (prompted when omitted)
    #[arg(short, long)]
    pub user: Option<String>,

    /// Account password (prompted when omitted)
    #[arg(long, env = "SYNCBOX_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Create the account instead of logging on
    #[arg(long)]
    pub signup: bool,

    /// Append a transfer journal to this file
    #[arg(long = "log")]
    pub journal: Option<PathBuf>,

    /// TOML settings file; flags override it
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// List each transfer as it finishes
    #[arg(short, long)]
    pub verbose: bool,

    /// Print help
    #[arg(long, action = ArgAction::Help)]
    pub help: Option<bool>,

    /// Run one command and exit; without it an interactive menu starts
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Show the files stored on the server
    List,
    /// Show what a sync would transfer
    Diff,
    /// Upload what the server lacks, then download what this directory lacks
    Sync,
}

impl ClientOpts {
    pub fn apply(&self, cfg: &mut ClientConfig) {
        if let Some(host) = &self.host {
            cfg.host = host.clone();
        }
        if let Some(port) = self.port {
            cfg.port = port;
        }
        if let Some(dir) = &self.dir {
            cfg.data_dir = dir.clone();
        }
        if let Some(journal) = &self.journal {
            cfg.journal = Some(journal.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_flags_override_config() {
        let opts = ClientOpts::try_parse_from([
            "syncbox", "-h", "box.lan", "-p", "4000", "--dir", "music", "--user", "alice", "--signup", "sync",
        ])
        .unwrap();
        assert_eq!(opts.command, Some(Command::Sync));
        assert!(opts.signup);

        let mut cfg = ClientConfig::default();
        opts.apply(&mut cfg);
        assert_eq!(cfg.address(), "box.lan:4000");
        assert_eq!(cfg.data_dir, PathBuf::from("music"));
        assert_eq!(cfg.journal, None);
    }

    #[test]
    fn test_client_defaults_to_menu() {
        let opts = ClientOpts::try_parse_from(["syncbox"]).unwrap();
        assert!(opts.command.is_none());
        let mut cfg = ClientConfig::default();
        opts.apply(&mut cfg);
        assert_eq!(cfg, ClientConfig::default());
    }

    #[test]
    fn test_bad_flags_are_rejected() {
        assert!(ClientOpts::try_parse_from(["syncbox", "-p", "notaport"]).is_err());
        assert!(ClientOpts::try_parse_from(["syncbox", "upload"]).is_err());
        assert!(DaemonOpts::try_parse_from(["syncboxd", "--port", "70000"]).is_err());
    }

    #[test]
    fn test_daemon_flags() {
        let opts = DaemonOpts::try_parse_from(["syncboxd", "-p", "5000", "--max-connections", "8"]).unwrap();
        let mut cfg = ServerConfig::default();
        opts.apply(&mut cfg);
        assert_eq!(cfg.port, 5000);
        assert_eq!(cfg.max_connections, 8);
        assert_eq!(cfg.data_dir, PathBuf::from("serverdata"));
    }
}
