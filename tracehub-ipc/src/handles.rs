// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! FD-carrying message plumbing, grounded on the teacher's
//! `datadog-ipc/src/handles.rs`: a transport-agnostic way for a message
//! type to declare which of its fields are out-of-band file descriptors
//! rather than inline bytes.

use crate::platform_handle::PlatformHandle;
use std::error::Error as StdError;

/// A channel able to move `PlatformHandle`s alongside a serialized message.
pub trait HandlesTransport {
    type Error: StdError;

    fn move_handle<T>(&mut self, handle: &PlatformHandle<T>) -> Result<(), Self::Error>;

    fn provide_handle<T>(&mut self, hint: &PlatformHandle<T>) -> Result<PlatformHandle<T>, Self::Error>;
}

/// Implemented on request/reply payloads so the transport layer can find
/// and move the handles they carry without knowing their concrete shape.
pub trait TransferHandles {
    fn move_handles<Transport: HandlesTransport>(
        &self,
        transport: &mut Transport,
    ) -> Result<(), Transport::Error>;

    fn receive_handles<Transport: HandlesTransport>(
        &mut self,
        transport: &mut Transport,
    ) -> Result<(), Transport::Error>;
}

mod transfer_impls {
    use super::{HandlesTransport, TransferHandles};

    impl<T, E> TransferHandles for Result<T, E>
    where
        T: TransferHandles,
    {
        fn move_handles<Transport: HandlesTransport>(
            &self,
            transport: &mut Transport,
        ) -> Result<(), Transport::Error> {
            match self {
                Ok(inner) => inner.move_handles(transport),
                Err(_) => Ok(()),
            }
        }

        fn receive_handles<Transport: HandlesTransport>(
            &mut self,
            transport: &mut Transport,
        ) -> Result<(), Transport::Error> {
            match self {
                Ok(inner) => inner.receive_handles(transport),
                Err(_) => Ok(()),
            }
        }
    }

    impl<T> TransferHandles for Option<T>
    where
        T: TransferHandles,
    {
        fn move_handles<Transport: HandlesTransport>(
            &self,
            transport: &mut Transport,
        ) -> Result<(), Transport::Error> {
            match self {
                Some(inner) => inner.move_handles(transport),
                None => Ok(()),
            }
        }

        fn receive_handles<Transport: HandlesTransport>(
            &mut self,
            transport: &mut Transport,
        ) -> Result<(), Transport::Error> {
            match self {
                Some(inner) => inner.receive_handles(transport),
                None => Ok(()),
            }
        }
    }

    macro_rules! no_handles {
        ($($t:ty),*) => {
            $(impl TransferHandles for $t {
                fn move_handles<Transport: HandlesTransport>(&self, _t: &mut Transport) -> Result<(), Transport::Error> { Ok(()) }
                fn receive_handles<Transport: HandlesTransport>(&mut self, _t: &mut Transport) -> Result<(), Transport::Error> { Ok(()) }
            })*
        };
    }
    no_handles!((), bool, u8, u16, u32, u64, i32, i64, usize, String, Vec<u8>);
}
