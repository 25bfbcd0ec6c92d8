// =============================================================================
// Matrixon Sync - Command Line Interface
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// =============================================================================

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Returns the current version of the crate with extra info if supplied
///
/// Set the environment variable `MATRIXON_SYNC_VERSION_EXTRA` at build time
/// to append it in parenthesis, e.g. a git commit hash.
pub fn version() -> String {
    let cargo_pkg_version = env!("CARGO_PKG_VERSION");

    match option_env!("MATRIXON_SYNC_VERSION_EXTRA") {
        Some(x) => format!("{} ({})", cargo_pkg_version, x),
        None => cargo_pkg_version.to_owned(),
    }
}

/// Sync protocol override
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeArg {
    Cursor,
    Windowed,
}

/// Matrixon Sync - follow a Matrix account and log its room lifecycle signals
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[clap(about, version, name = "matrixon-sync")]
pub struct Args {
    /// Path to configuration file
    #[clap(short, long, env = "MATRIXON_SYNC_CONFIG")]
    pub config: Option<PathBuf>,

    /// tracing filter directive, overrides the configured `log`
    #[clap(short, long)]
    pub log: Option<String>,

    /// Sync protocol, overrides the configured `mode`
    #[clap(short, long, value_enum)]
    pub mode: Option<ModeArg>,
}

pub fn parse() -> Args {
    Args::parse()
}
