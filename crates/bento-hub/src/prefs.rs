// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Persistent host preferences, overridable per run from the command line.

use std::path::PathBuf;

use bento_app_core::config::{ConfigError, ConfigService, ConfigStore};
use bento_proto::default_socket_path;
use clap::Parser;
use serde::{Deserialize, Serialize};

/// Config key the preferences live under.
pub const PREFS_KEY: &str = "hub";

/// Hub preferences stored through the config service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostPrefs {
    /// Unix socket the hub listens on.
    pub socket_path: String,
    /// Patch log file.
    pub db_path: String,
    /// Collapse the log after this many records; `None` collapses only at startup.
    pub collapse_every: Option<u64>,
}

impl Default for HostPrefs {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path().display().to_string(),
            db_path: "bento.db".to_owned(),
            collapse_every: Some(1024),
        }
    }
}

impl HostPrefs {
    /// Loads the stored prefs, writing the defaults on first run.
    pub fn load<S: ConfigStore>(config: &ConfigService<S>) -> Result<Self, ConfigError> {
        config.load_or_init(PREFS_KEY)
    }

    /// Applies command line overrides.
    pub fn with_args(mut self, args: &Args) -> Self {
        if let Some(socket) = &args.socket {
            self.socket_path = socket.display().to_string();
        }
        if let Some(db) = &args.db {
            self.db_path = db.display().to_string();
        }
        if let Some(every) = args.collapse_every {
            self.collapse_every = (every > 0).then_some(every);
        }
        self
    }
}

/// Command line of `bento-hub`.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Bento state hub over a Unix socket")]
pub struct Args {
    /// Unix socket to listen on (overrides prefs).
    #[arg(long)]
    pub socket: Option<PathBuf>,
    /// Patch log file (overrides prefs).
    #[arg(long)]
    pub db: Option<PathBuf>,
    /// Collapse the log every N records; 0 disables periodic collapse.
    #[arg(long)]
    pub collapse_every: Option<u64>,
    /// Keep the patch log in memory; nothing survives a restart.
    #[arg(long)]
    pub ephemeral: bool,
    /// Ignore stored preferences and do not write them.
    #[arg(long)]
    pub no_config: bool,
    /// Countdown tick period in milliseconds.
    #[arg(long, default_value_t = 1000)]
    pub tick_ms: u64,
}
