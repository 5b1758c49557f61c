// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Daemon configuration, read once at startup from the environment.
//! Grounded on the env-var-driven `Config` shape used elsewhere in this
//! workspace for long-running services: a handful of `_DD`-style
//! overrides with hardcoded defaults, no config file.

use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::filter::LevelFilter;

const ENV_PRODUCER_SOCKET: &str = "_DD_TRACEHUBD_PRODUCER_SOCKET";
const ENV_CONSUMER_SOCKET: &str = "_DD_TRACEHUBD_CONSUMER_SOCKET";
const ENV_LOG_FILE: &str = "_DD_TRACEHUBD_LOG_FILE";
const ENV_LOG_LEVEL: &str = "_DD_TRACEHUBD_LOG_LEVEL";
const ENV_SNAPSHOT_INTERVAL_SECS: &str = "_DD_TRACEHUBD_SNAPSHOT_INTERVAL_SECS";

const DEFAULT_PRODUCER_SOCKET: &str = "/run/tracehub/producer.sock";
const DEFAULT_CONSUMER_SOCKET: &str = "/run/tracehub/consumer.sock";
const DEFAULT_SNAPSHOT_INTERVAL_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct Config {
    pub producer_socket_path: PathBuf,
    pub consumer_socket_path: PathBuf,
    pub log_file: Option<PathBuf>,
    pub log_level: LevelFilter,
    /// §4.K.6: minimum spacing between a session's clock/stats snapshots.
    pub snapshot_interval: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        let producer_socket_path = std::env::var_os(ENV_PRODUCER_SOCKET).map(PathBuf::from).unwrap_or_else(|| PathBuf::from(DEFAULT_PRODUCER_SOCKET));
        let consumer_socket_path = std::env::var_os(ENV_CONSUMER_SOCKET).map(PathBuf::from).unwrap_or_else(|| PathBuf::from(DEFAULT_CONSUMER_SOCKET));
        let log_file = std::env::var_os(ENV_LOG_FILE).map(PathBuf::from);
        let log_level = std::env::var(ENV_LOG_LEVEL).ok().and_then(|s| s.parse().ok()).unwrap_or(LevelFilter::INFO);
        let snapshot_interval = std::env::var(ENV_SNAPSHOT_INTERVAL_SECS)
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(DEFAULT_SNAPSHOT_INTERVAL_SECS));

        Config { producer_socket_path, consumer_socket_path, log_file, log_level, snapshot_interval }
    }
}
