// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

/// Maximum payload carried by a single stdio frame. Protocol-global: both
/// sides of the wire size their buffers from this constant, and a received
/// header announcing more than this is a protocol violation.
pub const MAX_PAYLOAD: usize = 4096;

/// Length of the opaque credential signature carried by the init message.
pub const CRED_SIGLEN: usize = 64;
