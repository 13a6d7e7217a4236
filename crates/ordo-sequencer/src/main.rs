// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Ordo sequencer: assigns the global order for every connected client.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use ordo_app_core::config::{ConfigService, ConfigStore};
use ordo_app_core::prefs::{SequencerPrefs, TickState, SEQUENCER_PREFS_KEY, TICK_STATE_KEY};
use ordo_config_fs::FsConfigStore;
use ordo_proto::{BlobType, Tick};
use ordo_sequencer::{SequencerConfig, SequencerService, ServiceError};
use tokio::net::UnixListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Ordo tuplespace sequencer")]
struct Args {
    /// Unix socket to listen on (defaults to the saved preference)
    #[arg(long)]
    socket: Option<PathBuf>,
    /// Blob encoding advertised to clients (cbor or json)
    #[arg(long)]
    blob: Option<BlobType>,
    /// Resume from this tick instead of the saved one
    #[arg(long)]
    tick: Option<Tick>,
    /// Neither read nor save the tick state
    #[arg(long)]
    no_persist: bool,
    /// Config directory (defaults to the platform config dir)
    #[arg(long)]
    config_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    // Config (best-effort)
    let store = match &args.config_dir {
        Some(dir) => FsConfigStore::at(dir),
        None => FsConfigStore::new(),
    };
    let config: Option<ConfigService<FsConfigStore>> = match store {
        Ok(store) => Some(ConfigService::new(store)),
        Err(err) => {
            warn!(?err, "config store unavailable; running without persistence");
            None
        }
    };

    let prefs: SequencerPrefs = match &config {
        Some(cfg) => {
            let (prefs, err) = cfg.load_or_default(SEQUENCER_PREFS_KEY);
            if let Some(err) = err {
                warn!(?err, "ignoring unreadable sequencer prefs");
            }
            // Persist defaults once if absent
            if let Err(err) = cfg.save(SEQUENCER_PREFS_KEY, &prefs) {
                warn!(?err, "could not save sequencer prefs");
            }
            prefs
        }
        None => SequencerPrefs::default(),
    };

    let persist = config.as_ref().filter(|_| !args.no_persist);
    let saved_tick = persist.map_or(0, |cfg| {
        let (state, err): (TickState, _) = cfg.load_or_default(TICK_STATE_KEY);
        if let Some(err) = err {
            warn!(?err, "ignoring unreadable tick state");
        }
        state.tick
    });

    let socket_path = args
        .socket
        .unwrap_or_else(|| PathBuf::from(&prefs.socket_path));
    let seq_config = SequencerConfig {
        blob: args.blob.unwrap_or(prefs.blob),
        start_tick: args.tick.unwrap_or(saved_tick),
    };

    // Remove stale socket if present
    let _ = std::fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("bind {}", socket_path.display()))?;
    info!(
        socket = %socket_path.display(),
        tick = seq_config.start_tick,
        "sequencer listening"
    );

    let mut terminate = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    let (stop_tx, stop_rx) = oneshot::channel();
    let run = SequencerService::new(seq_config, Some(listener)).run(stop_rx);
    tokio::pin!(run);

    let stopped = tokio::select! {
        res = &mut run => Some(res),
        res = tokio::signal::ctrl_c() => {
            if let Err(err) = res {
                warn!(?err, "ctrl-c handler failed");
            }
            None
        }
        _ = terminate.recv() => None,
    };
    let outcome = match stopped {
        Some(res) => res,
        None => {
            info!("shutting down");
            let _ = stop_tx.send(());
            run.await
        }
    };

    let result = conclude(persist, outcome);
    let _ = std::fs::remove_file(&socket_path);
    result?;
    Ok(())
}

/// Save the final tick whether the loop stopped cleanly or failed, then
/// report the loop's outcome.
fn conclude<S: ConfigStore>(
    persist: Option<&ConfigService<S>>,
    outcome: Result<Tick, ServiceError>,
) -> Result<Tick> {
    let tick = match &outcome {
        Ok(tick) => *tick,
        Err(err) => err.tick,
    };
    if let Some(cfg) = persist {
        match cfg.save(TICK_STATE_KEY, &TickState { tick }) {
            Ok(()) => info!(tick, "saved tick state"),
            Err(err) if outcome.is_ok() => return Err(err).context("save tick state"),
            Err(err) => error!(?err, tick, "could not save tick state"),
        }
    }
    Ok(outcome?)
}
