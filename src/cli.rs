// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Talon Gateway: an always-on personal AI assistant reachable from chat
/// channels and a browser WebSocket client.
#[derive(Parser, Debug)]
#[command(
    name = "talon-gateway",
    about = "Personal AI assistant gateway: boot orchestrator and admin CLI",
    version,
    long_about = None,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to the gateway config file (overrides the search path).
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace). Ignored when
    /// SVEN_LOG_FILE / TALON_LOG_FILE is set, which always logs at debug.
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Base URL of a running gateway's admin API, used by the admin
    /// subcommands (health/status/reset-session/reload-config/shutdown).
    #[arg(long, default_value = "http://127.0.0.1:8787", global = true)]
    pub admin_url: String,

    /// Bearer token for the admin API (or set TALON_GATEWAY_TOKEN).
    #[arg(long, env = "TALON_GATEWAY_TOKEN", global = true)]
    pub token: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the gateway: boot every subsystem and serve until shutdown.
    /// This is also the default action when no subcommand is given.
    Serve,

    /// Print the effective configuration (after merge + secret
    /// resolution) and exit.
    ShowConfig,

    /// Query `/api/health` on a running gateway.
    Health,

    /// Query `/api/sessions` on a running gateway.
    Status,

    /// Reset a session's transcript via `/api/admin/reset-session`.
    ResetSession {
        /// Session key to reset, e.g. "local:dm:u1".
        session_key: String,
    },

    /// Trigger a config hot-reload via `/api/admin/reload-config`.
    ReloadConfig,

    /// Request a graceful shutdown via `/api/admin/shutdown`.
    Shutdown,
}
