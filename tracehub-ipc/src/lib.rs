// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Unix-socket transport, FD passing, and the producer/service RPC
//! framing (§4.A, §4.B, §4.I, §4.J).

pub mod client;
pub mod frame;
pub mod handles;
pub mod host;
pub mod platform_handle;
pub mod socket;
pub mod wire;

pub use client::{ProducerIpcClient, ServiceProxy};
pub use frame::{BufferedFrameDeserializer, Frame, FrameError};
pub use host::{ClientId, MethodOutcome, ProducerIpcHost, ServiceMethod, ServiceRegistration};
pub use platform_handle::PlatformHandle;
pub use socket::PeerIdentity;
