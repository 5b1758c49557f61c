// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Logging setup for the tracing service daemons.
//!
//! A thin, reload-capable `tracing-subscriber` bridge: stderr always gets a
//! compact formatter, an optional rotating file sink can be added on top,
//! and the filter can be swapped at runtime (used when a consumer asks the
//! service to dump more verbose diagnostics for a single session).

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{reload, EnvFilter, Layer};

pub type FilterHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

/// Holds the non-blocking file appender's background worker alive for the
/// life of the process; dropping it stops flushing.
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

fn env_filter(default: LevelFilter) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(default.into())
        .from_env_lossy()
}

/// Installs the process-wide subscriber. Call once, at daemon startup.
///
/// `log_file` selects an optional rotating file sink in addition to stderr;
/// `default_level` seeds the env-filter when `RUST_LOG` is unset.
pub fn init(log_file: Option<&Path>, default_level: LevelFilter) -> (LogGuard, FilterHandle) {
    let (filter_layer, filter_handle) = reload::Layer::new(env_filter(default_level));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .compact();

    let (file_layer, file_guard) = match log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_else(|| "tracehub.log".to_string());
            let appender = tracing_appender::rolling::daily(dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .json();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let subscriber = tracing_subscriber::registry()
        .with(filter_layer)
        .with(stderr_layer)
        .with(file_layer);

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::debug!("global tracing subscriber already installed");
    }

    (
        LogGuard {
            _file_guard: file_guard,
        },
        filter_handle,
    )
}

/// Replaces the active filter directive, e.g. in response to a consumer
/// asking for more verbose output on a running daemon.
pub fn set_filter(handle: &FilterHandle, directive: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(directive)?;
    handle.reload(filter)?;
    Ok(())
}
