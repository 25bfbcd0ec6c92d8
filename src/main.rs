// =============================================================================
// Matrixon Sync - Main Entry Point
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Runs one sync client against a homeserver and logs every lifecycle
//   signal it produces until interrupted.
//
// Runtime Requirements:
//   • --config <path> or MATRIXON_SYNC_CONFIG pointing to a TOML file,
//     and/or MATRIXON_SYNC_* environment variables
//
// =============================================================================

use matrixon_sync::{ConfiguredClient, SyncConfig, SyncMode, SyncSignal};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{prelude::*, EnvFilter};

mod clap;

#[tokio::main]
async fn main() {
    let args = clap::parse();

    let mut config = match SyncConfig::figment(args.config.as_deref()).extract::<SyncConfig>() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("It looks like your config is invalid. The following error occurred: {e}");
            std::process::exit(1);
        }
    };
    if let Some(log) = args.log {
        config.log = log;
    }
    if let Some(mode) = args.mode {
        config.mode = match mode {
            clap::ModeArg::Cursor => SyncMode::Cursor,
            clap::ModeArg::Windowed => SyncMode::Windowed,
        };
    }

    init_tracing(&config.log);
    info!("🚀 Starting Matrixon Sync {}", clap::version());

    if let Err(e) = run(config).await {
        error!(kind = e.kind(), "❌ Sync client failed: {}", e);
        std::process::exit(1);
    }
}

fn init_tracing(directive: &str) {
    let registry = tracing_subscriber::Registry::default();
    let fmt_layer = tracing_subscriber::fmt::Layer::new();
    let filter_layer = match EnvFilter::try_new(directive) {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("It looks like your config is invalid. The following error occurred while parsing it: {e}");
            EnvFilter::new("warn")
        }
    };

    let subscriber = registry.with(filter_layer).with(fmt_layer);
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to install tracing subscriber: {e}");
    }
}

async fn run(config: SyncConfig) -> matrixon_sync::Result<()> {
    let mut client = ConfiguredClient::from_config(&config, None).await?;

    let mut signals = client.signals().subscribe().await;
    let printer = tokio::spawn(async move {
        while let Some(signal) = signals.recv().await {
            log_signal(&signal);
        }
    });

    client.start().await?;
    shutdown_signal().await;

    if let Some(summary) = client.stop_and_wait().await {
        info!(
            batches = summary.batches,
            failures = summary.failures,
            "✅ Sync client stopped"
        );
    }
    drop(client);
    printer.abort();
    Ok(())
}

fn log_signal(signal: &SyncSignal) {
    match signal {
        SyncSignal::AccountData { event } => {
            info!(signal = %signal.kind(), event_type = ?event.get("type"), "account data")
        }
        SyncSignal::RoomAccountData { room_id, event } => {
            info!(signal = %signal.kind(), %room_id, event_type = ?event.get("type"), "room account data")
        }
        SyncSignal::RoomJoin { room_id } => info!(signal = %signal.kind(), %room_id, "🏠 joined"),
        SyncSignal::RoomFailedDecryption { room_id, event, error } => warn!(
            signal = %signal.kind(),
            %room_id,
            event_id = ?event.event_id,
            %error,
            "failed to decrypt"
        ),
        SyncSignal::RoomLeave { room_id, event }
        | SyncSignal::RoomInvite { room_id, event }
        | SyncSignal::RoomMessage { room_id, event }
        | SyncSignal::RoomArchived { room_id, event }
        | SyncSignal::RoomUpgraded { room_id, event }
        | SyncSignal::RoomEncryptedEvent { room_id, event }
        | SyncSignal::RoomDecryptedEvent { room_id, event }
        | SyncSignal::RoomEvent { room_id, event } => info!(
            signal = %signal.kind(),
            %room_id,
            event_id = ?event.event_id,
            event_type = %event.event_type,
            sender = %event.sender,
            "room signal"
        ),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let sig: &str;

    tokio::select! {
        _ = ctrl_c => { sig = "Ctrl+C"; },
        _ = terminate => { sig = "SIGTERM"; },
    }

    warn!("Received {}, shutting down...", sig);
}
