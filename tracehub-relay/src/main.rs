// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use clap::Parser;
use tracehub_relay::cli::RelayArgs;

fn main() -> anyhow::Result<()> {
    let args = RelayArgs::parse();
    tracing_subscriber::fmt::init();

    if args.background {
        // Must happen before the tokio runtime starts: forking a
        // multi-threaded async runtime is not supported, the child would
        // only keep whichever thread called fork.
        nix::unistd::daemon(false, false)?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(tracehub_relay::relay::run(&args.listen_path, &args.downstream, args.set_socket_permissions.as_ref()))
}
