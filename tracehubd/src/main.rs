// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use tracehub_ipc::ProducerIpcHost;
use tracehub_runtime::TaskRunner;
use tracehubd::config::Config;
use tracehubd::core_handle::ServiceHandle;
use tracehubd::file_drain::FileDrainRegistry;
use tracehubd::producer_registry::ProducerConnections;
use tracehubd::{consumer_port, producer_port};

fn main() -> anyhow::Result<()> {
    let config = Config::from_env();
    let (_log_guard, _filter_handle) = tracehub_log::init(config.log_file.as_deref(), config.log_level);

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(run(config))
}

async fn run(config: Config) -> anyhow::Result<()> {
    let runner = TaskRunner::spawn("tracehubd-core");
    let service = ServiceHandle::new(runner);
    let connections = Arc::new(ProducerConnections::new());

    let file_drains = Arc::new(FileDrainRegistry::new());

    let producer_registration = producer_port::build_registration(Arc::new(service.clone()), connections);
    let consumer_registration = consumer_port::build_registration(service, config.snapshot_interval, file_drains);

    let producer_host = ProducerIpcHost::new(vec![producer_registration]);
    let consumer_host = ProducerIpcHost::new(vec![consumer_registration]);

    tracing::info!(
        producer_socket = %config.producer_socket_path.display(),
        consumer_socket = %config.consumer_socket_path.display(),
        "tracehubd starting"
    );

    tokio::try_join!(
        producer_host.serve(config.producer_socket_path),
        consumer_host.serve(config.consumer_socket_path),
    )?;
    Ok(())
}
