// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Producer IPC host (§4.J): listens on a named socket, accepts producer
//! connections, and routes `BindService`/`InvokeMethod` frames to
//! registered service implementations.

use crate::frame::{encode_frame, BufferedFrameDeserializer};
use crate::platform_handle::PlatformHandle;
use crate::socket::{recv_with_fds, send_with_fds, PeerIdentity};
use crate::wire::{BindServiceOk, ClientFrame, MethodId, ServerFrame, ServiceId};
use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, Mutex};

/// A method's successful result: the `bincode`-encoded reply payload, plus
/// any FDs to pass alongside it (e.g. handing a producer its SMB, per
/// §4.B/§4.K.1). Empty `fds` is the common case.
pub struct MethodOutcome {
    pub payload: Vec<u8>,
    pub fds: Vec<OwnedFd>,
}

impl From<Vec<u8>> for MethodOutcome {
    fn from(payload: Vec<u8>) -> Self {
        MethodOutcome { payload, fds: Vec::new() }
    }
}

/// A method implementation: takes the raw `bincode`-encoded argument bytes,
/// a client-connection tag, and any FDs the client sent alongside this call
/// (e.g. a consumer's `write_into_file` output fd, §4.K.1), returns one
/// reply.
#[async_trait::async_trait]
pub trait ServiceMethod: Send + Sync {
    async fn invoke(&self, client: ClientId, identity: PeerIdentity, args: Vec<u8>, fds: Vec<OwnedFd>) -> Result<MethodOutcome, String>;

    /// Streaming variant for a method that answers with more than one
    /// reply (§8 scenario 3): pushes each reply to `replies` in order and
    /// returns once the last one has been sent. The default forwards to
    /// [`ServiceMethod::invoke`] for a single reply, which is the common
    /// case; override this directly for a method that needs to stream.
    async fn invoke_streaming(
        &self,
        client: ClientId,
        identity: PeerIdentity,
        args: Vec<u8>,
        fds: Vec<OwnedFd>,
        replies: mpsc::UnboundedSender<Result<MethodOutcome, String>>,
    ) {
        let _ = replies.send(self.invoke(client, identity, args, fds).await);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub u64);

/// One registered service: a stable name, an id assigned at registration,
/// and its named methods.
pub struct ServiceRegistration {
    pub name: String,
    pub methods: Vec<(String, Arc<dyn ServiceMethod>)>,
    /// Invoked when a client that had bound this service disconnects, so
    /// the service can clean up connection-scoped state (§4.J).
    pub on_client_disconnect: Option<Arc<dyn Fn(ClientId) + Send + Sync>>,
}

struct Registry {
    services: Vec<ServiceRegistration>,
}

impl Registry {
    fn find_by_name(&self, name: &str) -> Option<(ServiceId, &ServiceRegistration)> {
        self.services
            .iter()
            .enumerate()
            .find(|(_, s)| s.name == name)
            .map(|(i, s)| (i as ServiceId, s))
    }

    fn find_method(&self, service_id: ServiceId, method_id: MethodId) -> Option<Arc<dyn ServiceMethod>> {
        self.services
            .get(service_id as usize)
            .and_then(|s| s.methods.get(method_id as usize))
            .map(|(_, m)| m.clone())
    }
}

/// Listens on a Unix domain socket and dispatches inbound frames to
/// registered services.
pub struct ProducerIpcHost {
    registry: Arc<Registry>,
    next_client_id: Arc<AtomicU32>,
}

impl ProducerIpcHost {
    pub fn new(services: Vec<ServiceRegistration>) -> Self {
        Self {
            registry: Arc::new(Registry { services }),
            next_client_id: Arc::new(AtomicU32::new(1)),
        }
    }

    /// Binds the listening socket and serves connections until the
    /// returned future is dropped or the listener errors.
    pub async fn serve(self, socket_path: impl AsRef<Path>) -> std::io::Result<()> {
        let _ = std::fs::remove_file(&socket_path);
        let listener = UnixListener::bind(socket_path)?;
        loop {
            let (stream, _addr) = listener.accept().await?;
            let identity = PeerIdentity::from_peer_cred(&stream)?;
            let client_id = ClientId(self.next_client_id.fetch_add(1, Ordering::Relaxed) as u64);
            let registry = self.registry.clone();
            tokio::spawn(serve_connection(stream, identity, client_id, registry));
        }
    }
}

async fn serve_connection(
    stream: UnixStream,
    // Kernel credentials captured at accept time; retained for the life of
    // the connection so frames received just before disconnect can still
    // be attributed (§4.B), and handed to every method invocation since
    // the service core trusts this over anything a producer claims.
    identity: PeerIdentity,
    client_id: ClientId,
    registry: Arc<Registry>,
) {
    let stream = Arc::new(stream);
    let bound_services: Arc<Mutex<HashMap<ServiceId, ()>>> = Arc::new(Mutex::new(HashMap::new()));
    let mut deserializer = BufferedFrameDeserializer::new();
    // FDs a client sent ride along with whatever bytes arrived in the same
    // `recvmsg` call, not necessarily the frame they're semantically meant
    // for, so they're queued here and handed to the next `InvokeMethod`
    // this loop dispatches (§4.B: one stashed batch per frame is the
    // contract every client here follows).
    let mut pending_fds: Vec<OwnedFd> = Vec::new();

    loop {
        let mut buf = [0u8; 4096];
        let (n, fds) = match recv_with_fds(&stream, &mut buf, 1).await {
            Ok((0, _)) | Err(_) => break,
            Ok(result) => result,
        };
        pending_fds.extend(fds.into_iter().filter_map(|f| f.into_owned_fd().ok()));
        let dst = deserializer.begin_receive(n);
        dst[..n].copy_from_slice(&buf[..n]);
        deserializer.end_receive(n);

        loop {
            let frame = match deserializer.pop_next_frame() {
                Ok(Some(f)) => f,
                Ok(None) => break,
                Err(_) => return notify_disconnect(&registry, &bound_services, client_id).await,
            };
            let decoded: ClientFrame = match bincode::deserialize(&frame) {
                Ok(f) => f,
                Err(_) => return notify_disconnect(&registry, &bound_services, client_id).await,
            };

            match decoded {
                // On AF_UNIX, kernel credentials are authoritative and a
                // claimed identity is always ignored (§4.J).
                ClientFrame::SetPeerIdentity { .. } => {}
                ClientFrame::BindService { request_id, service_name } => {
                    let reply = match registry.find_by_name(&service_name) {
                        Some((service_id, svc)) => {
                            bound_services.lock().await.insert(service_id, ());
                            Ok(BindServiceOk {
                                service_id,
                                method_ids: svc
                                    .methods
                                    .iter()
                                    .enumerate()
                                    .map(|(i, (name, _))| (name.clone(), i as MethodId))
                                    .collect(),
                            })
                        }
                        None => Err(format!("no such service: {service_name}")),
                    };
                    let frame = ServerFrame::BindServiceReply { request_id, result: reply };
                    send_server_frame(&stream, &frame, &[]).await;
                }
                ClientFrame::InvokeMethod {
                    request_id,
                    service_id,
                    method_id,
                    args,
                    drop_reply,
                } => {
                    let method = registry.find_method(service_id, method_id);
                    let stream = stream.clone();
                    let call_fds = std::mem::take(&mut pending_fds);
                    tokio::spawn(async move {
                        let (tx, mut rx) = mpsc::unbounded_channel();
                        match method {
                            Some(m) => {
                                tokio::spawn(async move { m.invoke_streaming(client_id, identity, args, call_fds, tx).await });
                            }
                            None => {
                                let _ = tx.send(Err("no such method".to_string()));
                            }
                        };
                        if drop_reply {
                            return;
                        }
                        // One item of lookahead: a reply isn't known to be
                        // the last (`has_more = false`) until the channel
                        // that fed it has closed.
                        let mut pending = rx.recv().await;
                        while let Some(outcome) = pending {
                            let next = rx.recv().await;
                            let (result, fds) = match outcome {
                                Ok(MethodOutcome { payload, fds }) => (Ok(payload), fds),
                                Err(e) => (Err(e), Vec::new()),
                            };
                            let frame = ServerFrame::MethodReply { request_id, has_more: next.is_some(), result };
                            let handles: Vec<PlatformHandle<OwnedFd>> = fds.into_iter().map(PlatformHandle::from).collect();
                            send_server_frame(&stream, &frame, &handles).await;
                            pending = next;
                        }
                    });
                }
            }
        }
    }
    notify_disconnect(&registry, &bound_services, client_id).await;
}

async fn send_server_frame(stream: &Arc<UnixStream>, frame: &ServerFrame, fds: &[PlatformHandle<OwnedFd>]) {
    let payload = bincode::serialize(frame).expect("ServerFrame is always serializable");
    let _ = send_with_fds(stream, &encode_frame(&payload), fds).await;
}

async fn notify_disconnect(
    registry: &Registry,
    bound_services: &Mutex<HashMap<ServiceId, ()>>,
    client_id: ClientId,
) {
    let bound = bound_services.lock().await;
    for service_id in bound.keys() {
        if let Some(svc) = registry.services.get(*service_id as usize) {
            if let Some(cb) = &svc.on_client_disconnect {
                cb(client_id);
            }
        }
    }
}
