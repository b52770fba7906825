// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    limits,
};
use ::byteorder::{
    ByteOrder,
    NetworkEndian,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Size of a frame header on the wire.
pub const HEADER_SIZE: usize = 10;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Kind of a stdio frame.
#[repr(u16)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FrameKind {
    /// Client-to-task input for a single task.
    Stdin = 1,
    /// Task standard output.
    Stdout = 2,
    /// Task standard error.
    Stderr = 3,
    /// Client-to-task input fanned out to every task.
    AllStdin = 4,
}

/// Fixed header preceding every payload on the wire. All fields big-endian.
/// A `length` of zero marks end-of-file in the direction of the frame kind.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FrameHeader {
    pub kind: FrameKind,
    pub gtaskid: u16,
    pub ltaskid: u16,
    pub length: u32,
}

/// First message written on a freshly attached client connection.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct InitMessage {
    /// Opaque credential signature echoed back to the client.
    pub cred_sig: [u8; limits::CRED_SIGLEN],
    /// Logical rank of this node within the job.
    pub nodeid: u32,
    /// Number of stdout streams this node serves.
    pub stdout_objs: u32,
    /// Number of stderr streams this node serves.
    pub stderr_objs: u32,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl FrameHeader {
    pub fn new(kind: FrameKind, gtaskid: u16, ltaskid: u16, length: u32) -> Self {
        Self {
            kind,
            gtaskid,
            ltaskid,
            length,
        }
    }

    /// Parses a header, rejecting unknown kinds and oversized payloads.
    pub fn parse(bytes: &[u8]) -> Result<Self, Fail> {
        if bytes.len() < HEADER_SIZE {
            return Err(Fail::new(libc::EINVAL, "frame header is too short"));
        }
        let kind: FrameKind = FrameKind::try_from(NetworkEndian::read_u16(&bytes[0..2]))?;
        let gtaskid: u16 = NetworkEndian::read_u16(&bytes[2..4]);
        let ltaskid: u16 = NetworkEndian::read_u16(&bytes[4..6]);
        let length: u32 = NetworkEndian::read_u32(&bytes[6..10]);
        if length as usize > limits::MAX_PAYLOAD {
            let cause: String = format!(
                "frame length of {} exceeds maximum of {}",
                length,
                limits::MAX_PAYLOAD
            );
            error!("parse(): {}", cause);
            return Err(Fail::new(libc::EPROTO, &cause));
        }
        Ok(Self {
            kind,
            gtaskid,
            ltaskid,
            length,
        })
    }

    /// Writes this header into the first [HEADER_SIZE] bytes of `bytes`.
    pub fn serialize(&self, bytes: &mut [u8]) {
        NetworkEndian::write_u16(&mut bytes[0..2], self.kind as u16);
        NetworkEndian::write_u16(&mut bytes[2..4], self.gtaskid);
        NetworkEndian::write_u16(&mut bytes[4..6], self.ltaskid);
        NetworkEndian::write_u32(&mut bytes[6..10], self.length);
    }
}

impl InitMessage {
    /// Size of the init message on the wire.
    pub const SIZE: usize = limits::CRED_SIGLEN + 12;

    /// Writes this message into the first [Self::SIZE] bytes of `bytes`.
    pub fn serialize(&self, bytes: &mut [u8]) {
        let n: usize = limits::CRED_SIGLEN;
        bytes[0..n].copy_from_slice(&self.cred_sig);
        NetworkEndian::write_u32(&mut bytes[n..n + 4], self.nodeid);
        NetworkEndian::write_u32(&mut bytes[n + 4..n + 8], self.stdout_objs);
        NetworkEndian::write_u32(&mut bytes[n + 8..n + 12], self.stderr_objs);
    }

    /// Parses an init message.
    pub fn parse(bytes: &[u8]) -> Result<Self, Fail> {
        if bytes.len() < Self::SIZE {
            return Err(Fail::new(libc::EINVAL, "init message is too short"));
        }
        let n: usize = limits::CRED_SIGLEN;
        let mut cred_sig: [u8; limits::CRED_SIGLEN] = [0; limits::CRED_SIGLEN];
        cred_sig.copy_from_slice(&bytes[0..n]);
        Ok(Self {
            cred_sig,
            nodeid: NetworkEndian::read_u32(&bytes[n..n + 4]),
            stdout_objs: NetworkEndian::read_u32(&bytes[n + 4..n + 8]),
            stderr_objs: NetworkEndian::read_u32(&bytes[n + 8..n + 12]),
        })
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl TryFrom<u16> for FrameKind {
    type Error = Fail;

    fn try_from(n: u16) -> Result<Self, Fail> {
        match n {
            1 => Ok(FrameKind::Stdin),
            2 => Ok(FrameKind::Stdout),
            3 => Ok(FrameKind::Stderr),
            4 => Ok(FrameKind::AllStdin),
            _ => Err(Fail::new(libc::EPROTO, "unknown frame kind")),
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        FrameHeader,
        FrameKind,
        InitMessage,
        HEADER_SIZE,
    };
    use crate::runtime::limits;
    use ::anyhow::Result;

    #[test]
    fn header_wire_layout_is_big_endian() -> Result<()> {
        let header: FrameHeader = FrameHeader::new(FrameKind::Stdout, 0x0102, 0x0304, 0x0000_0A0B);
        let mut bytes: [u8; HEADER_SIZE] = [0; HEADER_SIZE];
        header.serialize(&mut bytes);
        crate::ensure_eq!(bytes, [0x00, 0x02, 0x01, 0x02, 0x03, 0x04, 0x00, 0x00, 0x0A, 0x0B]);
        crate::ensure_eq!(FrameHeader::parse(&bytes)?, header);
        Ok(())
    }

    #[test]
    fn header_rejects_unknown_kind() -> Result<()> {
        let bytes: [u8; HEADER_SIZE] = [0x00, 0x09, 0, 0, 0, 0, 0, 0, 0, 0];
        crate::ensure_eq!(FrameHeader::parse(&bytes).is_err(), true);
        Ok(())
    }

    #[test]
    fn header_rejects_oversized_length() -> Result<()> {
        let header: FrameHeader = FrameHeader::new(FrameKind::Stdin, 0, 0, limits::MAX_PAYLOAD as u32 + 1);
        let mut bytes: [u8; HEADER_SIZE] = [0; HEADER_SIZE];
        header.serialize(&mut bytes);
        crate::ensure_eq!(FrameHeader::parse(&bytes).is_err(), true);
        Ok(())
    }

    #[test]
    fn init_message_roundtrip() -> Result<()> {
        let msg: InitMessage = InitMessage {
            cred_sig: [0x5A; limits::CRED_SIGLEN],
            nodeid: 7,
            stdout_objs: 4,
            stderr_objs: 4,
        };
        let mut bytes: [u8; InitMessage::SIZE] = [0; InitMessage::SIZE];
        msg.serialize(&mut bytes);
        crate::ensure_eq!(InitMessage::parse(&bytes)?, msg);
        Ok(())
    }
}
