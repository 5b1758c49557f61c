// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Forwards producer traffic from a local UNIX socket to a downstream TCP
//! tracing service (§6), injecting a `set_peer_identity` frame carrying the
//! UNIX peer's kernel credentials ahead of the first byte the producer
//! sends, since the downstream service can no longer read `SO_PEERCRED`
//! once the connection is relayed over TCP.

use crate::cli::SocketPermissions;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UnixListener, UnixStream};
use tracehub_ipc::frame::encode_frame;
use tracehub_ipc::socket::PeerIdentity;
use tracehub_ipc::wire::ClientFrame;

/// Binds `listen_path`, applying `permissions` if given, and forwards every
/// accepted connection to `downstream_addr` until an error stops the
/// accept loop (the caller decides whether that's fatal).
pub async fn run(listen_path: &Path, downstream_addr: &str, permissions: Option<&SocketPermissions>) -> anyhow::Result<()> {
    let _ = std::fs::remove_file(listen_path);
    let listener = UnixListener::bind(listen_path)?;
    if let Some(perm) = permissions {
        apply_socket_permissions(listen_path, perm)?;
    }
    tracing::info!(path = %listen_path.display(), downstream = downstream_addr, "relay listening");

    loop {
        let (stream, _addr) = listener.accept().await?;
        let downstream_addr = downstream_addr.to_string();
        tokio::spawn(async move {
            if let Err(e) = relay_one_connection(stream, &downstream_addr).await {
                tracing::warn!(error = %e, "relay connection ended with an error");
            }
        });
    }
}

async fn relay_one_connection(unix_stream: UnixStream, downstream_addr: &str) -> anyhow::Result<()> {
    let identity = PeerIdentity::from_peer_cred(&unix_stream)?;
    let mut tcp_stream = TcpStream::connect(downstream_addr).await?;

    let frame = ClientFrame::SetPeerIdentity { uid: identity.uid, pid: identity.pid };
    let payload = bincode::serialize(&frame)?;
    tcp_stream.write_all(&encode_frame(&payload)).await?;

    let (mut unix_read, mut unix_write) = tokio::io::split(unix_stream);
    let (mut tcp_read, mut tcp_write) = tokio::io::split(tcp_stream);

    tokio::select! {
        res = tokio::io::copy(&mut unix_read, &mut tcp_write) => { res?; }
        res = tokio::io::copy(&mut tcp_read, &mut unix_write) => { res?; }
    }
    Ok(())
}

fn apply_socket_permissions(path: &Path, perm: &SocketPermissions) -> anyhow::Result<()> {
    let group = nix::unistd::Group::from_name(&perm.group)?.ok_or_else(|| anyhow::anyhow!("unknown group {:?}", perm.group))?;
    nix::unistd::chown(path, None, Some(group.gid))?;
    let mode = nix::sys::stat::Mode::from_bits_truncate(perm.mode);
    nix::sys::stat::fchmodat(None, path, mode, nix::sys::stat::FchmodatFlags::FollowSymlink)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt as _};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn relayed_connection_carries_a_leading_set_peer_identity_frame() {
        let tcp_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let downstream_addr = tcp_listener.local_addr().unwrap().to_string();

        let (unix_a, mut unix_b) = UnixStream::pair().unwrap();
        let relay_task = tokio::spawn(async move { relay_one_connection(unix_a, &downstream_addr).await });

        let (mut accepted, _) = tcp_listener.accept().await.unwrap();

        let mut len_buf = [0u8; 4];
        accepted.read_exact(&mut len_buf).await.unwrap();
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        accepted.read_exact(&mut payload).await.unwrap();
        let frame: ClientFrame = bincode::deserialize(&payload).unwrap();
        match frame {
            ClientFrame::SetPeerIdentity { uid, .. } => assert_eq!(uid, nix::unistd::getuid().as_raw()),
            other => panic!("expected SetPeerIdentity, got {other:?}"),
        }

        unix_b.write_all(b"ping").await.unwrap();
        let mut echo = [0u8; 4];
        accepted.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"ping");

        drop(unix_b);
        drop(accepted);
        let _ = relay_task.await;
    }
}
