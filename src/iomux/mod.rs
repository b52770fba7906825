// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Per-node stdio multiplexer.
//!
//! A daemon spawning user tasks hands their stdio pipe descriptors to a
//! [SharedIoMux], attaches remote client sockets to it, and drives the
//! reactor on one dedicated thread. Task output fans out to every attached
//! client (plus a bounded replay cache for late joiners); client stdin routes
//! to one or all tasks. All buffers come from fixed pools sized at startup,
//! and pool exhaustion is backpressure rather than failure.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod client;
pub mod codec;
pub mod coordinator;
pub mod fd;
pub mod pool;
pub mod reactor;
pub mod task;

pub use self::{
    codec::{
        FrameHeader,
        FrameKind,
        InitMessage,
        HEADER_SIZE,
    },
    coordinator::{
        IoMux,
        IoMuxOptions,
        SharedIoMux,
        TaskStdio,
    },
    reactor::Wakeup,
};
