// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-producer connection bookkeeping (§4.K.1/§4.K.4/§4.K.5): maps an
//! IPC `ClientId` to the `producer_id` the core knows it by, and queues
//! the commands the core wants to push to that producer until its next
//! `GetAsyncCommand` long-poll call picks them up. The service core talks
//! to a producer only through [`tracehub_service::ProducerChannel`]; this
//! module is the implementation that turns those calls into queued
//! commands instead of direct IPC writes, since a producer never receives
//! anything except as a reply to a call it made.

use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracehub_ipc::ClientId;
use tracehub_service::ids::DataSourceInstanceId;
use tracehub_service::ProducerChannel;

/// One instruction queued for a producer, awaiting its next
/// `GetAsyncCommand` call. Kept distinct from [`crate::wire::AsyncCommandWire`]
/// since `DeliverSmb` carries an owned fd that has no business being
/// `bincode`-encoded; it only becomes wire-shaped (payload plus an
/// out-of-band fd) at the point `GetAsyncCommand` actually answers.
pub enum PendingCommand {
    CreateDataSourceInstance {
        instance_id: u64,
        data_source_name: String,
        target_buffer: u16,
    },
    TeardownDataSourceInstance {
        instance_id: u64,
    },
    RequestFlush {
        flush_request_id: u64,
        instance_ids: Vec<u64>,
    },
    DeliverSmb {
        fd: OwnedFd,
        page_size: usize,
        total_size: usize,
    },
}

struct ChannelImpl {
    tx: mpsc::UnboundedSender<PendingCommand>,
}

impl ProducerChannel for ChannelImpl {
    fn create_data_source_instance(&self, instance_id: DataSourceInstanceId, data_source_name: &str, target_buffer: u16) {
        let _ = self.tx.send(PendingCommand::CreateDataSourceInstance {
            instance_id: instance_id.0,
            data_source_name: data_source_name.to_string(),
            target_buffer,
        });
    }

    fn teardown_data_source_instance(&self, instance_id: DataSourceInstanceId) {
        let _ = self.tx.send(PendingCommand::TeardownDataSourceInstance { instance_id: instance_id.0 });
    }

    fn request_flush(&self, flush_request_id: u64, instance_ids: &[DataSourceInstanceId]) {
        let _ = self.tx.send(PendingCommand::RequestFlush {
            flush_request_id,
            instance_ids: instance_ids.iter().map(|i| i.0).collect(),
        });
    }

    fn deliver_smb(&self, fd: OwnedFd, page_size: usize, total_size: usize) {
        let _ = self.tx.send(PendingCommand::DeliverSmb { fd, page_size, total_size });
    }
}

#[derive(Default)]
pub struct ProducerConnections {
    by_client: Mutex<HashMap<ClientId, u16>>,
    senders: Mutex<HashMap<u16, mpsc::UnboundedSender<PendingCommand>>>,
    queues: Mutex<HashMap<u16, Arc<AsyncMutex<mpsc::UnboundedReceiver<PendingCommand>>>>>,
}

impl ProducerConnections {
    pub fn new() -> Self {
        ProducerConnections::default()
    }

    /// Registers a freshly connected producer and returns the
    /// [`ProducerChannel`] the core should be given for it.
    pub fn register(&self, client: ClientId, producer_id: u16) -> Arc<dyn ProducerChannel> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.by_client.lock().unwrap().insert(client, producer_id);
        self.senders.lock().unwrap().insert(producer_id, tx.clone());
        self.queues.lock().unwrap().insert(producer_id, Arc::new(AsyncMutex::new(rx)));
        Arc::new(ChannelImpl { tx })
    }

    pub fn producer_id_for(&self, client: ClientId) -> Option<u16> {
        self.by_client.lock().unwrap().get(&client).copied()
    }

    /// Awaits the next command queued for `producer_id`. Resolves to
    /// `None` once the producer's sender has been dropped, i.e. it
    /// disconnected.
    pub async fn next_command(&self, producer_id: u16) -> Option<PendingCommand> {
        let queue = self.queues.lock().unwrap().get(&producer_id).cloned()?;
        let mut rx = queue.lock().await;
        rx.recv().await
    }

    /// Drops a disconnected producer's bookkeeping and returns its
    /// `producer_id`, so the caller can also tell the core to forget it.
    pub fn remove(&self, client: ClientId) -> Option<u16> {
        let producer_id = self.by_client.lock().unwrap().remove(&client)?;
        self.senders.lock().unwrap().remove(&producer_id);
        self.queues.lock().unwrap().remove(&producer_id);
        Some(producer_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registered_producer_receives_queued_commands_in_order() {
        let connections = ProducerConnections::new();
        let channel = connections.register(ClientId(1), 7);
        assert_eq!(connections.producer_id_for(ClientId(1)), Some(7));

        channel.teardown_data_source_instance(DataSourceInstanceId(42));
        match connections.next_command(7).await {
            Some(PendingCommand::TeardownDataSourceInstance { instance_id }) => assert_eq!(instance_id, 42),
            _ => panic!("expected a queued teardown command"),
        }
    }

    #[tokio::test]
    async fn removing_a_producer_closes_its_command_queue() {
        let connections = ProducerConnections::new();
        connections.register(ClientId(1), 7);
        assert_eq!(connections.remove(ClientId(1)), Some(7));
        assert_eq!(connections.producer_id_for(ClientId(1)), None);
        assert!(connections.next_command(7).await.is_none());
    }
}
