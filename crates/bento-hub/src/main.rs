// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! `bento-hub` entry point.

use std::time::Duration;

use anyhow::{Context, Result};
use bento_app_core::config::ConfigService;
use bento_config_fs::FsConfigStore;
use bento_hub::{demo, Args, HostPrefs, Hub};
use bento_kernel::Dispatcher;
use bento_log::{FileStore, MemoryStore, PatchLog};
use clap::Parser;
use tokio::net::UnixListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let prefs = load_prefs(&args).with_args(&args);

    let log = if args.ephemeral {
        PatchLog::open(MemoryStore::new())?
    } else {
        let store = FileStore::open(&prefs.db_path)
            .with_context(|| format!("opening patch log {}", prefs.db_path))?;
        PatchLog::open(store)?
    };

    let countdown = demo::Countdown::new();
    let mut config = demo::kernel_config(&countdown);
    config.collapse_every = prefs.collapse_every;
    let dispatcher = Dispatcher::start(config, log).context("starting dispatcher")?;
    tokio::spawn(countdown.run(dispatcher.clone(), Duration::from_millis(args.tick_ms)));
    demo::on_start(&dispatcher).await?;

    // Remove stale socket if present
    let _ = std::fs::remove_file(&prefs.socket_path);
    let listener = UnixListener::bind(&prefs.socket_path)
        .with_context(|| format!("binding {}", prefs.socket_path))?;
    info!(socket = %prefs.socket_path, db = %prefs.db_path, "bento hub listening");

    let hub = Hub::new(dispatcher);
    let served = tokio::select! {
        res = hub.serve(listener) => res,
        res = tokio::signal::ctrl_c() => {
            info!("shutting down");
            res.map_err(Into::into)
        }
    };
    let _ = std::fs::remove_file(&prefs.socket_path);
    served
}

// Config is best-effort: a missing or unreadable config dir falls back to defaults.
fn load_prefs(args: &Args) -> HostPrefs {
    if args.no_config {
        return HostPrefs::default();
    }
    match FsConfigStore::new().map(ConfigService::new) {
        Ok(config) => HostPrefs::load(&config).unwrap_or_else(|err| {
            warn!(%err, "ignoring unreadable hub prefs");
            HostPrefs::default()
        }),
        Err(err) => {
            warn!(%err, "config dir unavailable; using defaults");
            HostPrefs::default()
        }
    }
}
