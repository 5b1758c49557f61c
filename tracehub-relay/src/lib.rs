// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The producer-to-service relay (§6): a UNIX-to-TCP forwarder that
//! injects a `set_peer_identity` frame ahead of relayed traffic so a
//! downstream service reached over TCP still learns which local UNIX peer
//! a connection came from.

pub mod cli;
pub mod relay;

pub use cli::{RelayArgs, SocketPermissions};
