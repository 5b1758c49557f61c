// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The relay's CLI surface (§6): `--background`, `--version` (handled by
//! `clap`'s built-in flag), and `--set-socket-permissions GROUP:OCTAL_MODE`.
//! `--listen-path`/`--downstream` are this crate's own addition: §6 names
//! the relay's handshake behavior but not how it's told which socket to
//! listen on or which service to forward to, so those are ordinary
//! required flags rather than anything the spec leaves ambiguous.

use clap::Parser;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketPermissions {
    pub group: String,
    pub mode: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SocketPermissionsParseError {
    #[error("expected GROUP:OCTAL_MODE, got {0:?}")]
    MissingSeparator(String),
    #[error("{0:?} is not a valid octal mode")]
    InvalidMode(String),
}

impl FromStr for SocketPermissions {
    type Err = SocketPermissionsParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (group, mode) = s.split_once(':').ok_or_else(|| SocketPermissionsParseError::MissingSeparator(s.to_string()))?;
        let mode = u32::from_str_radix(mode, 8).map_err(|_| SocketPermissionsParseError::InvalidMode(mode.to_string()))?;
        Ok(SocketPermissions { group: group.to_string(), mode })
    }
}

#[derive(Parser, Debug)]
#[command(name = "tracehub-relay", version, about = "Relays producer traffic from a local UNIX socket to a downstream TCP tracing service")]
pub struct RelayArgs {
    /// UNIX socket path producers connect to.
    #[arg(long)]
    pub listen_path: PathBuf,

    /// Downstream TCP tracing service, `host:port`.
    #[arg(long)]
    pub downstream: String,

    /// Detach from the controlling terminal and run as a background daemon.
    #[arg(long)]
    pub background: bool,

    /// Sets the owning group and permission bits of the listening socket.
    #[arg(long, value_name = "GROUP:OCTAL_MODE")]
    pub set_socket_permissions: Option<SocketPermissions>,
}
