// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The producer-facing service (§4.I/§4.J, §4.K.1/§4.K.3): `RegisterProducer`,
//! `RegisterDataSource`, `UnregisterDataSource`, `CommitData`, and the
//! `GetAsyncCommand` long-poll a producer uses to receive the commands the
//! core can't push to it directly.

use crate::core_handle::ServiceHandle;
use crate::producer_registry::{PendingCommand, ProducerConnections};
use crate::wire::{
    AsyncCommandWire, ChunkToMoveWire, ChunkToPatchWire, CommitDataRequest, RegisterDataSourceRequest, RegisterProducerReply,
    RegisterProducerRequest, UnregisterDataSourceRequest,
};
use async_trait::async_trait;
use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex};
use tracehub_common::ids::BitmapAllocator;
use tracehub_ipc::socket::PeerIdentity;
use tracehub_ipc::{ClientId, MethodOutcome, ServiceMethod, ServiceRegistration};
use tracehub_service::core::{ChunkToMove, ChunkToPatch};
use tracehub_service::ids::BufferId;
use tracehub_service::Producer;

const MAX_PRODUCERS: usize = 1 << 16;

fn decode<T: serde::de::DeserializeOwned>(args: &[u8]) -> Result<T, String> {
    bincode::deserialize(args).map_err(|e| e.to_string())
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, String> {
    bincode::serialize(value).map_err(|e| e.to_string())
}

fn current_producer(connections: &ProducerConnections, client: ClientId) -> Result<u16, String> {
    connections.producer_id_for(client).ok_or_else(|| "producer not registered".to_string())
}

struct RegisterProducerMethod {
    service: Arc<ServiceHandle>,
    connections: Arc<ProducerConnections>,
    producer_ids: Arc<Mutex<BitmapAllocator>>,
}

#[async_trait]
impl ServiceMethod for RegisterProducerMethod {
    async fn invoke(&self, client: ClientId, identity: PeerIdentity, args: Vec<u8>, _fds: Vec<OwnedFd>) -> Result<MethodOutcome, String> {
        let req: RegisterProducerRequest = decode(&args)?;
        let producer_id = self
            .producer_ids
            .lock()
            .unwrap()
            .allocate()
            .ok_or_else(|| "producer id space exhausted".to_string())? as u16;

        let channel = self.connections.register(client, producer_id);
        let mut producer = Producer::new(identity.uid, req.name, channel);
        producer.smb_page_size_kb = req.page_size_hint_kb;
        producer.shm_size_kb_hint = req.shm_size_hint_kb;
        if let Some(max_writer_id) = req.max_writer_id_hint {
            producer.max_writer_id = max_writer_id;
        }
        self.service.with_core(move |core| core.add_producer(producer_id, producer)).await;

        encode(&RegisterProducerReply { producer_id }).map(Into::into)
    }
}

struct RegisterDataSourceMethod {
    service: Arc<ServiceHandle>,
    connections: Arc<ProducerConnections>,
}

#[async_trait]
impl ServiceMethod for RegisterDataSourceMethod {
    async fn invoke(&self, client: ClientId, _identity: PeerIdentity, args: Vec<u8>, _fds: Vec<OwnedFd>) -> Result<MethodOutcome, String> {
        let req: RegisterDataSourceRequest = decode(&args)?;
        let producer_id = current_producer(&self.connections, client)?;
        self.service.with_core(move |core| core.register_data_source(producer_id, &req.name)).await;
        Ok(Vec::new().into())
    }
}

struct UnregisterDataSourceMethod {
    service: Arc<ServiceHandle>,
    connections: Arc<ProducerConnections>,
}

#[async_trait]
impl ServiceMethod for UnregisterDataSourceMethod {
    async fn invoke(&self, client: ClientId, _identity: PeerIdentity, args: Vec<u8>, _fds: Vec<OwnedFd>) -> Result<MethodOutcome, String> {
        let req: UnregisterDataSourceRequest = decode(&args)?;
        let producer_id = current_producer(&self.connections, client)?;
        self.service.with_core(move |core| core.unregister_data_source(producer_id, &req.name)).await;
        Ok(Vec::new().into())
    }
}

struct CommitDataMethod {
    service: Arc<ServiceHandle>,
    connections: Arc<ProducerConnections>,
}

#[async_trait]
impl ServiceMethod for CommitDataMethod {
    async fn invoke(&self, client: ClientId, _identity: PeerIdentity, args: Vec<u8>, _fds: Vec<OwnedFd>) -> Result<MethodOutcome, String> {
        let req: CommitDataRequest = decode(&args)?;
        let producer_id = current_producer(&self.connections, client)?;

        let chunks_to_move: Vec<ChunkToMove> = req
            .chunks_to_move
            .into_iter()
            .map(|c: ChunkToMoveWire| ChunkToMove { buffer_id: BufferId(c.buffer_id), page_idx: c.page_idx, chunk_idx: c.chunk_idx })
            .collect();
        let chunks_to_patch: Vec<ChunkToPatch> = req
            .chunks_to_patch
            .into_iter()
            .map(|c: ChunkToPatchWire| ChunkToPatch {
                buffer_id: BufferId(c.buffer_id),
                writer_id: c.writer_id,
                chunk_id: c.chunk_id,
                patches: c.patches,
                has_more_patches: c.has_more_patches,
            })
            .collect();

        self.service
            .with_core(move |core| {
                core.commit_data(producer_id, &chunks_to_move, &chunks_to_patch);
                if let Some(flush_request_id) = req.flush_request_id {
                    core.ack_flush_from_commit(producer_id, flush_request_id);
                }
            })
            .await;
        Ok(Vec::new().into())
    }
}

struct GetAsyncCommandMethod {
    connections: Arc<ProducerConnections>,
}

#[async_trait]
impl ServiceMethod for GetAsyncCommandMethod {
    async fn invoke(&self, client: ClientId, _identity: PeerIdentity, _args: Vec<u8>, _fds: Vec<OwnedFd>) -> Result<MethodOutcome, String> {
        let producer_id = current_producer(&self.connections, client)?;
        match self.connections.next_command(producer_id).await {
            Some(PendingCommand::CreateDataSourceInstance { instance_id, data_source_name, target_buffer }) => {
                encode(&AsyncCommandWire::CreateDataSourceInstance { instance_id, data_source_name, target_buffer }).map(Into::into)
            }
            Some(PendingCommand::TeardownDataSourceInstance { instance_id }) => {
                encode(&AsyncCommandWire::TeardownDataSourceInstance { instance_id }).map(Into::into)
            }
            Some(PendingCommand::RequestFlush { flush_request_id, instance_ids }) => {
                encode(&AsyncCommandWire::RequestFlush { flush_request_id, instance_ids }).map(Into::into)
            }
            Some(PendingCommand::DeliverSmb { fd, page_size, total_size }) => {
                let payload = encode(&AsyncCommandWire::DeliverSmb { page_size, total_size })?;
                Ok(MethodOutcome { payload, fds: vec![fd] })
            }
            None => Err("producer disconnected".to_string()),
        }
    }
}

/// Builds the `"producer"` service registration, wiring every method above
/// to `service`/`connections`, plus the disconnect hook that erases a
/// dropped producer from both (§4.J).
pub fn build_registration(service: Arc<ServiceHandle>, connections: Arc<ProducerConnections>) -> ServiceRegistration {
    let producer_ids = Arc::new(Mutex::new(BitmapAllocator::new(MAX_PRODUCERS)));

    ServiceRegistration {
        name: "producer".to_string(),
        methods: vec![
            (
                "register_producer".to_string(),
                Arc::new(RegisterProducerMethod { service: service.clone(), connections: connections.clone(), producer_ids }) as Arc<dyn ServiceMethod>,
            ),
            (
                "register_data_source".to_string(),
                Arc::new(RegisterDataSourceMethod { service: service.clone(), connections: connections.clone() }),
            ),
            (
                "unregister_data_source".to_string(),
                Arc::new(UnregisterDataSourceMethod { service: service.clone(), connections: connections.clone() }),
            ),
            (
                "commit_data".to_string(),
                Arc::new(CommitDataMethod { service: service.clone(), connections: connections.clone() }),
            ),
            ("get_async_command".to_string(), Arc::new(GetAsyncCommandMethod { connections: connections.clone() })),
        ],
        on_client_disconnect: Some(Arc::new(move |client: ClientId| {
            let service = service.clone();
            let connections = connections.clone();
            tokio::spawn(async move {
                if let Some(producer_id) = connections.remove(client) {
                    service.with_core(move |core| core.remove_producer(producer_id)).await;
                }
            });
        })),
    }
}
