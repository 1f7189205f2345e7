// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Tracing setup. Generalizes the teacher's `init_logging`: that function
//! silences tracing entirely unless a TUI-unsafe override is set, since
//! writing to stderr corrupts a live ratatui frame. This binary has no
//! TUI, so the default is simply stderr at a verbosity-selected level;
//! the file-output escape hatch is kept under a renamed env var for
//! operators who run this under a supervisor that already multiplexes
//! stderr for other purposes.

use std::sync::Mutex;

use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

pub fn init(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if let Ok(log_path) = std::env::var("TALON_LOG_FILE") {
        if let Ok(file) = std::fs::OpenOptions::new().create(true).append(true).open(&log_path) {
            let _ = tracing_subscriber::registry()
                .with(fmt::layer().with_target(true).with_ansi(false).with_writer(Mutex::new(file)))
                .with(filter)
                .try_init();
            return;
        }
    }

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
