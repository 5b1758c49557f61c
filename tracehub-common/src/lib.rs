// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ambient utilities shared by every crate in the tracing service workspace.

pub mod error;
pub mod ids;
pub mod threading;
pub mod worker;

pub use error::FfiSafeErrorMessage;
