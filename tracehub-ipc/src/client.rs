// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Producer IPC client (§4.I): connects to the service's named socket,
//! binds services by name, and invokes methods on them. Tracks pending
//! requests by `RequestId` so replies can be routed back to their caller
//! regardless of arrival order.

use crate::frame::{encode_frame, BufferedFrameDeserializer};
use crate::platform_handle::PlatformHandle;
use crate::socket::{recv_with_fds, send_with_fds};
use crate::wire::{BindServiceOk, ClientFrame, MethodId, RequestId, ServerFrame, ServiceId};
use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Connecting,
    Connected,
    Disconnected,
}

enum DeferredReply {
    Single(oneshot::Sender<Result<Vec<u8>, String>>),
    Streaming(mpsc::UnboundedSender<Result<Vec<u8>, String>>),
}

struct Shared {
    state: Mutex<ConnState>,
    pending: Mutex<HashMap<RequestId, DeferredReply>>,
    next_request_id: AtomicU64,
    received_fd: Mutex<Option<PlatformHandle<UnixStream>>>,
    outbound: mpsc::UnboundedSender<(Vec<u8>, Vec<PlatformHandle<OwnedFd>>)>,
}

/// A bound proxy to one named service on the remote host. Method calls go
/// out as `InvokeMethod` frames tagged with this proxy's `service_id`.
#[derive(Clone)]
pub struct ServiceProxy {
    shared: Arc<Shared>,
    service_id: ServiceId,
}

impl ServiceProxy {
    pub fn service_id(&self) -> ServiceId {
        self.service_id
    }

    /// Invokes a unary method, awaiting exactly one reply.
    pub async fn invoke(&self, method_id: MethodId, args: Vec<u8>) -> Result<Vec<u8>, String> {
        self.invoke_with_fds(method_id, args, Vec::new()).await
    }

    /// Like [`ServiceProxy::invoke`], but sends `fds` alongside the call
    /// (e.g. a consumer's `write_into_file` output fd, §4.K.1).
    pub async fn invoke_with_fds(&self, method_id: MethodId, args: Vec<u8>, fds: Vec<OwnedFd>) -> Result<Vec<u8>, String> {
        let request_id = self.shared.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .unwrap()
            .insert(request_id, DeferredReply::Single(tx));
        self.send_invoke(request_id, method_id, args, false, fds);
        rx.await.unwrap_or_else(|_| Err("disconnected".to_string()))
    }

    /// Invokes a streaming method; the returned channel yields each reply
    /// until the host sends one with `has_more == false`.
    pub fn invoke_streaming(
        &self,
        method_id: MethodId,
        args: Vec<u8>,
    ) -> mpsc::UnboundedReceiver<Result<Vec<u8>, String>> {
        let request_id = self.shared.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared
            .pending
            .lock()
            .unwrap()
            .insert(request_id, DeferredReply::Streaming(tx));
        self.send_invoke(request_id, method_id, args, false, Vec::new());
        rx
    }

    /// Sends a method call without registering for a reply at all (the
    /// `drop_reply` request bit, distinct from a streaming/unary call whose
    /// reply is merely unawaited).
    pub fn send(&self, method_id: MethodId, args: Vec<u8>) {
        let request_id = self.shared.next_request_id.fetch_add(1, Ordering::Relaxed);
        self.send_invoke(request_id, method_id, args, true, Vec::new());
    }

    fn send_invoke(&self, request_id: RequestId, method_id: MethodId, args: Vec<u8>, drop_reply: bool, fds: Vec<OwnedFd>) {
        let frame = ClientFrame::InvokeMethod {
            request_id,
            service_id: self.service_id,
            method_id,
            args,
            drop_reply,
        };
        let payload = bincode::serialize(&frame).expect("ClientFrame is always serializable");
        let handles = fds.into_iter().map(PlatformHandle::from).collect();
        let _ = self.shared.outbound.send((encode_frame(&payload), handles));
    }
}

/// The client side of a producer/consumer connection to the tracing
/// service's IPC host.
pub struct ProducerIpcClient {
    shared: Arc<Shared>,
}

impl ProducerIpcClient {
    /// Connects to `socket_path`. Requests made before the connection
    /// completes are queued and flushed once it does, per §4.I.
    pub async fn connect(socket_path: impl AsRef<Path>) -> std::io::Result<Self> {
        let stream = UnixStream::connect(socket_path).await?;
        Ok(Self::from_stream(stream))
    }

    fn from_stream(stream: UnixStream) -> Self {
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<(Vec<u8>, Vec<PlatformHandle<OwnedFd>>)>();
        let shared = Arc::new(Shared {
            state: Mutex::new(ConnState::Connecting),
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
            received_fd: Mutex::new(None),
            outbound: outbound_tx,
        });
        *shared.state.lock().unwrap() = ConnState::Connected;

        let stream = Arc::new(stream);
        let reader_stream = stream.clone();
        let reader_shared = shared.clone();
        tokio::spawn(async move {
            let mut deserializer = BufferedFrameDeserializer::new();
            loop {
                let mut buf = [0u8; 4096];
                let (n, fds) = match recv_with_fds(&reader_stream, &mut buf, 1).await {
                    Ok((0, _)) | Err(_) => break,
                    Ok(result) => result,
                };
                if let Some(fd) = fds.into_iter().next() {
                    *reader_shared.received_fd.lock().unwrap() = Some(fd);
                }
                let dst = deserializer.begin_receive(n);
                dst[..n].copy_from_slice(&buf[..n]);
                deserializer.end_receive(n);
                loop {
                    match deserializer.pop_next_frame() {
                        Ok(Some(frame)) => dispatch_server_frame(&reader_shared, &frame),
                        Ok(None) => break,
                        Err(_) => return disconnect_all(&reader_shared),
                    }
                }
            }
            disconnect_all(&reader_shared);
        });

        tokio::spawn(async move {
            while let Some((bytes, fds)) = outbound_rx.recv().await {
                if send_with_fds(&stream, &bytes, &fds).await.is_err() {
                    break;
                }
            }
        });

        ProducerIpcClient { shared }
    }

    /// Binds a named service, returning a proxy once the host replies.
    pub async fn bind_service(&self, service_name: impl Into<String>) -> Result<ServiceProxy, String> {
        let request_id = self.shared.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .unwrap()
            .insert(request_id, DeferredReply::Single(tx));
        let frame = ClientFrame::BindService {
            request_id,
            service_name: service_name.into(),
        };
        let payload = bincode::serialize(&frame).expect("ClientFrame is always serializable");
        let _ = self.shared.outbound.send((encode_frame(&payload), Vec::new()));

        let raw = rx.await.unwrap_or_else(|_| Err("disconnected".to_string()))?;
        let ok: BindServiceOk = bincode::deserialize(&raw).map_err(|e| e.to_string())?;
        Ok(ServiceProxy {
            shared: self.shared.clone(),
            service_id: ok.service_id,
        })
    }

    /// Consumes the most recently received out-of-band file descriptor, if
    /// any, per §4.I's "one stashed FD per frame" contract.
    pub fn take_received_fd(&self) -> Option<PlatformHandle<UnixStream>> {
        self.shared.received_fd.lock().unwrap().take()
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.state.lock().unwrap() == ConnState::Connected
    }
}

fn dispatch_server_frame(shared: &Arc<Shared>, frame: &[u8]) {
    let decoded: ServerFrame = match bincode::deserialize(frame) {
        Ok(f) => f,
        Err(_) => return disconnect_all(shared),
    };
    match decoded {
        ServerFrame::BindServiceReply { request_id, result } => {
            if let Some(DeferredReply::Single(tx)) = shared.pending.lock().unwrap().remove(&request_id) {
                let result = result.map(|ok| bincode::serialize(&ok).unwrap_or_default());
                let _ = tx.send(result);
            }
        }
        ServerFrame::MethodReply {
            request_id,
            has_more,
            result,
        } => {
            let mut pending = shared.pending.lock().unwrap();
            match pending.get(&request_id) {
                Some(DeferredReply::Streaming(tx)) => {
                    let _ = tx.send(result);
                    if !has_more {
                        pending.remove(&request_id);
                    }
                }
                Some(DeferredReply::Single(_)) => {
                    if let Some(DeferredReply::Single(tx)) = pending.remove(&request_id) {
                        let _ = tx.send(result);
                    }
                }
                None => {}
            }
        }
    }
}

fn disconnect_all(shared: &Arc<Shared>) {
    *shared.state.lock().unwrap() = ConnState::Disconnected;
    for (_, reply) in shared.pending.lock().unwrap().drain() {
        match reply {
            DeferredReply::Single(tx) => {
                let _ = tx.send(Err("disconnected".to_string()));
            }
            DeferredReply::Streaming(tx) => {
                let _ = tx.send(Err("disconnected".to_string()));
            }
        }
    }
}
