//! Daemon configuration: CLI flags with environment fallbacks.

use clap::Parser;
use std::path::PathBuf;

use crate::discovery;
use crate::store;

pub const DEFAULT_PORT: u16 = 4519;
pub const DEFAULT_APP: &str = "claude-code";

#[derive(Debug, Parser)]
#[command(name = "beacon-daemon")]
#[command(about = "Local observability event bus for developer tooling")]
#[command(version)]
pub struct Cli {
    /// Port to listen on (loopback only)
    #[arg(long, env = "BEACON_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Override the discovery/cache directory
    #[arg(long, env = "BEACON_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Disable voice announcements
    #[arg(long, env = "BEACON_NO_VOICE")]
    pub no_voice: bool,

    /// Ring buffer capacity
    #[arg(long, default_value_t = store::DEFAULT_CAPACITY)]
    pub capacity: usize,

    /// Append accepted events to a JSONL journal at this path
    #[arg(long, env = "BEACON_JOURNAL")]
    pub journal: Option<PathBuf>,

    /// Default app label for envelopes that do not carry one
    #[arg(long, default_value = DEFAULT_APP)]
    pub app: String,

    /// Serve dashboard assets from this directory on unmatched routes
    #[arg(long, env = "BEACON_ASSETS")]
    pub assets: Option<PathBuf>,
}

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub cache_dir: PathBuf,
    pub voice_enabled: bool,
    pub capacity: usize,
    pub journal: Option<PathBuf>,
    pub default_app: String,
    pub default_app_root: String,
    pub assets: Option<PathBuf>,
}

impl Config {
    pub fn resolve(cli: Cli) -> Result<Self, String> {
        let cache_dir = match cli.cache_dir {
            Some(dir) => dir,
            None => discovery::default_dir()?,
        };

        let default_app_root = std::env::current_dir()
            .map_err(|err| format!("Failed to resolve working directory: {}", err))?
            .to_string_lossy()
            .to_string();

        Ok(Self {
            port: cli.port,
            cache_dir,
            voice_enabled: !cli.no_voice,
            capacity: cli.capacity,
            journal: cli.journal,
            default_app: cli.app,
            default_app_root,
            assets: cli.assets,
        })
    }

    pub fn clips_dir(&self) -> PathBuf {
        self.cache_dir.join("voice")
    }
}
