//! Command-line argument parsing and configuration.
//!
//! Supports:
//! - CLI arguments via clap
//! - TOML configuration file, including a `[node]` table of [`NodeConfig`] tunables
//! - Merging CLI with file config (CLI takes precedence)

use crate::core::config::NodeConfig;
use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_FILE: &str = "peerlink.toml";

/// peerlink - P2P chat and file transfer over WebRTC data channels.
///
/// Starts two nodes on an in-process relay, links them over loopback,
/// exchanges a chat line and optionally a file.
#[derive(Parser, Deserialize, Clone, Debug)]
#[command(author, version, about)]
#[command(propagate_version = true)]
pub struct Args {
    /// Verbosity level (-v, -vv, -vvv).
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    #[serde(default)]
    pub verbose: u8,

    /// TOML configuration file. Defaults to ./peerlink.toml when present.
    #[clap(long)]
    pub conf: Option<PathBuf>,

    /// Display name of the sending node.
    #[clap(long)]
    pub display_name: Option<String>,

    /// Chat line sent once the link is up.
    #[clap(short, long)]
    pub message: Option<String>,

    /// File to send across the link.
    #[clap(short, long)]
    pub send: Option<PathBuf>,

    /// Directory for received files. Defaults to the current directory.
    #[clap(long)]
    pub out_dir: Option<PathBuf>,

    /// Chunk size for outgoing files, in bytes.
    #[clap(long)]
    pub chunk_size: Option<usize>,

    /// STUN/TURN server url; may be repeated.
    #[clap(long = "ice-server")]
    #[serde(default)]
    pub ice_servers: Vec<String>,

    /// Let both nodes offer at once, leaving the collision to glare resolution.
    #[clap(long)]
    #[serde(default)]
    pub no_tie_break: bool,

    /// Append logs to this file.
    #[clap(long)]
    pub log_file: Option<PathBuf>,

    /// Node tunables; file only.
    #[clap(skip)]
    #[serde(default)]
    pub node: NodeConfig,
}

impl Args {
    /// Load Args from CLI + TOML file (if it exists).
    /// CLI values override those from the file.
    pub fn load() -> Result<Self> {
        let mut cli_args = Args::parse();

        // Resolve relative paths to absolute before anything changes directory
        cli_args.conf = cli_args.conf.map(Self::resolve_path);

        let path = cli_args
            .conf
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        match Self::from_file(&path)? {
            Some(file_args) => Ok(Self::merge(file_args, cli_args)),
            None => Ok(cli_args),
        }
    }

    /// Resolve a potentially relative path to an absolute one.
    fn resolve_path(p: PathBuf) -> PathBuf {
        if p.is_absolute() {
            p
        } else {
            std::env::current_dir().unwrap_or_default().join(p)
        }
    }

    /// Load args from a TOML file; `None` when the file does not exist.
    fn from_file(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("parsing {}", path.display()))
            .map(Some)
    }

    fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str::<Args>(content)?)
    }

    /// Merge file args with CLI args (CLI takes precedence).
    fn merge(mut file: Args, cli: Args) -> Args {
        if cli.verbose > 0 {
            file.verbose = cli.verbose;
        }
        if cli.conf.is_some() {
            file.conf = cli.conf;
        }
        if cli.display_name.is_some() {
            file.display_name = cli.display_name;
        }
        if cli.message.is_some() {
            file.message = cli.message;
        }
        if cli.send.is_some() {
            file.send = cli.send;
        }
        if cli.out_dir.is_some() {
            file.out_dir = cli.out_dir;
        }
        if cli.chunk_size.is_some() {
            file.chunk_size = cli.chunk_size;
        }
        if !cli.ice_servers.is_empty() {
            file.ice_servers = cli.ice_servers;
        }
        if cli.no_tie_break {
            file.no_tie_break = true;
        }
        if cli.log_file.is_some() {
            file.log_file = cli.log_file;
        }
        file
    }

    /// Node configuration with the top-level overrides applied.
    pub fn node_config(&self) -> NodeConfig {
        let mut cfg = self.node.clone();
        if let Some(name) = &self.display_name {
            cfg.display_name = name.clone();
        }
        if let Some(size) = self.chunk_size {
            cfg.chunk_size = size;
        }
        if self.no_tie_break {
            cfg.tie_break_initiation = false;
        }
        cfg
    }
}
