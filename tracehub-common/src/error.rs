// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// A trait for error messages that are cheap to construct and safe to log
/// without allocating, mirroring the constraints FFI boundaries impose on
/// error text.
///
/// Implementors must guarantee the returned string is valid UTF-8 and
/// `'static`, so callers on either side of a process boundary can log it
/// without worrying about lifetimes or encoding.
pub trait FfiSafeErrorMessage {
    /// Returns a static description of the error.
    fn as_static_str(&self) -> &'static str;
}

/// Typed failures from `EnableTracing` (§4.K.1). Every variant here is a
/// rejection that must leave the service state unchanged.
#[derive(Debug, thiserror::Error)]
pub enum EnableTracingError {
    #[error("consumer already owns an active tracing session")]
    ConsumerBusy,
    #[error("lockdown mode forbids a non-root consumer from starting a session")]
    LockdownViolation,
    #[error("duration_ms {0} exceeds the 24h guardrail cap")]
    DurationGuardrail(u64),
    #[error("total buffer size {0} bytes exceeds the 32MiB guardrail cap")]
    BufferSizeGuardrail(u64),
    #[error("{0} buffers requested, exceeds kMaxBuffersPerConsumer")]
    TooManyBuffers(usize),
    #[error("system already has kMaxConcurrentTracingSessions active sessions")]
    TooManySessions,
    #[error("write_into_file requested without a file descriptor")]
    MissingFileDescriptor,
    #[error("buffer id space exhausted")]
    BufferIdsExhausted,
}

impl FfiSafeErrorMessage for EnableTracingError {
    fn as_static_str(&self) -> &'static str {
        match self {
            Self::ConsumerBusy => "consumer already owns an active tracing session",
            Self::LockdownViolation => "lockdown mode forbids this consumer",
            Self::DurationGuardrail(_) => "duration guardrail exceeded",
            Self::BufferSizeGuardrail(_) => "buffer size guardrail exceeded",
            Self::TooManyBuffers(_) => "too many buffers requested",
            Self::TooManySessions => "too many concurrent tracing sessions",
            Self::MissingFileDescriptor => "write_into_file requires a file descriptor",
            Self::BufferIdsExhausted => "buffer id space exhausted",
        }
    }
}

/// Failures from shared-memory setup (§4.F/§4.K.1).
#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    #[error("failed to create shared memory region: {0}")]
    Create(#[source] std::io::Error),
    #[error("failed to map shared memory region: {0}")]
    Map(#[source] std::io::Error),
    #[error("page size {0} is not a multiple of the OS page size")]
    InvalidPageSize(usize),
    #[error("shm size {0} is not a multiple of the page size")]
    InvalidShmSize(usize),
}
