// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    iomux::{
        codec::{
            FrameHeader,
            HEADER_SIZE,
        },
        coordinator::IoMux,
        pool::Msg,
        reactor::IoRegistrant,
    },
    runtime::{
        fail::Fail,
        SharedObject,
    },
};
use ::std::{
    collections::VecDeque,
    io,
    ops::{
        Deref,
        DerefMut,
    },
    os::unix::io::RawFd,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Debug tag for client socket registrants.
const CLIENT_IO_MAGIC: u32 = 0x10102;

//======================================================================================================================
// Structures
//======================================================================================================================

/// One attached remote client: reads framed stdin messages off the socket and
/// writes framed task output back.
pub struct Client {
    magic: u32,
    sock_fd: RawFd,
    /// The reactor asked this endpoint to shut down.
    shutdown: bool,

    /// Incoming header accumulates here until complete.
    header_scratch: [u8; HEADER_SIZE],
    header_filled: usize,
    /// Parsed header of the in-progress incoming message.
    header: Option<FrameHeader>,
    /// Incoming payload accumulates into this pooled buffer.
    in_msg: Option<Msg>,
    in_remaining: usize,
    in_eof: bool,

    /// Outgoing message currently being written.
    out_msg: Option<Msg>,
    out_remaining: usize,
    out_eof: bool,
    /// Outgoing messages waiting on the socket.
    queue: VecDeque<Msg>,
    /// The queue was seeded from the replay cache.
    queue_primed: bool,
}

#[derive(Clone)]
pub struct SharedClient(SharedObject<Client>);

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Client {
    pub fn new(sock_fd: RawFd) -> Self {
        Self {
            magic: CLIENT_IO_MAGIC,
            sock_fd,
            shutdown: false,
            header_scratch: [0; HEADER_SIZE],
            header_filled: 0,
            header: None,
            in_msg: None,
            in_remaining: 0,
            in_eof: false,
            out_msg: None,
            out_remaining: 0,
            out_eof: false,
            queue: VecDeque::new(),
            queue_primed: false,
        }
    }

    /// Returns whether this client still accepts task output.
    pub fn accepts_output(&self) -> bool {
        !self.out_eof
    }

    /// Queues an outgoing frame for this client.
    pub fn enqueue_output(&mut self, msg: Msg) {
        self.queue.push_back(msg);
    }

    /// Marks the incoming direction finished and returns any half-read
    /// message buffer to its pool.
    fn end_input(&mut self) {
        self.in_eof = true;
        self.in_msg = None;
        self.header = None;
        self.header_filled = 0;
    }

    /// Reads header bytes until the scratch area is full.
    ///
    /// Returns false when the header is still incomplete (short read, would
    /// block, or the peer closed the stream).
    fn fill_header(&mut self) -> bool {
        while self.header_filled < HEADER_SIZE {
            let n: isize = unsafe {
                libc::read(
                    self.sock_fd,
                    self.header_scratch[self.header_filled..].as_mut_ptr() as *mut libc::c_void,
                    HEADER_SIZE - self.header_filled,
                )
            };
            if n < 0 {
                let errno: i32 = io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO);
                match errno {
                    libc::EINTR => continue,
                    libc::EAGAIN => return false,
                    _ => {
                        warn!("fill_header(): error reading client header (errno={:?})", errno);
                        self.end_input();
                        return false;
                    },
                }
            }
            if n == 0 {
                debug!("fill_header(): eof on client socket fd={:?}", self.sock_fd);
                self.end_input();
                return false;
            }
            self.header_filled += n as usize;
        }
        true
    }

    /// Reads payload bytes into the incoming message buffer.
    ///
    /// Returns false while the payload is incomplete.
    fn fill_payload(&mut self) -> bool {
        while self.in_remaining > 0 {
            let n: isize = {
                let msg: &Msg = match self.in_msg.as_ref() {
                    Some(msg) => msg,
                    None => return false,
                };
                let mut storage = msg.storage_mut();
                let offset: usize = msg.len() - self.in_remaining;
                unsafe {
                    libc::read(
                        self.sock_fd,
                        storage[offset..].as_mut_ptr() as *mut libc::c_void,
                        self.in_remaining,
                    )
                }
            };
            if n < 0 {
                let errno: i32 = io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO);
                match errno {
                    libc::EINTR => continue,
                    libc::EAGAIN => return false,
                    _ => {
                        warn!("fill_payload(): error reading client payload (errno={:?})", errno);
                        self.end_input();
                        return false;
                    },
                }
            }
            if n == 0 {
                debug!("fill_payload(): eof on client socket fd={:?}", self.sock_fd);
                self.end_input();
                return false;
            }
            self.in_remaining -= n as usize;
        }
        true
    }
}

impl SharedClient {
    pub fn new(client: Client) -> Self {
        Self(SharedObject::new(client))
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl IoRegistrant for SharedClient {
    fn fd(&self) -> RawFd {
        self.sock_fd
    }

    fn readable(&mut self, mux: &mut IoMux) -> bool {
        debug_assert_eq!(self.magic, CLIENT_IO_MAGIC);
        if self.in_eof {
            return false;
        }
        if self.shutdown {
            // Half-close: stop accepting stdin, keep draining output.
            unsafe { libc::shutdown(self.sock_fd, libc::SHUT_RD) };
            self.in_eof = true;
        }
        self.in_msg.is_some() || !mux.pool().incoming().is_empty()
    }

    fn writable(&mut self, mux: &mut IoMux) -> bool {
        debug_assert_eq!(self.magic, CLIENT_IO_MAGIC);
        if self.out_eof {
            return false;
        }
        // A newly attached client first replays the recent-output cache.
        if !self.queue_primed {
            let client: &mut Client = self.0.deref_mut();
            for msg in mux.cache().iter() {
                client.queue.push_back(msg.clone());
            }
            client.queue_primed = true;
        }
        self.out_msg.is_some() || !self.queue.is_empty()
    }

    fn handle_read(&mut self, mux: &mut IoMux) -> Result<(), Fail> {
        trace!("client handle_read(): fd={:?}", self.sock_fd);
        debug_assert_eq!(self.magic, CLIENT_IO_MAGIC);

        // An exhausted incoming pool is backpressure: retry on a later pass.
        if self.in_msg.is_none() {
            match mux.pool().incoming().acquire() {
                None => return Ok(()),
                Some(msg) => self.in_msg = Some(msg),
            }
        }

        if self.header.is_none() {
            if !self.fill_header() {
                return Ok(());
            }
            let header: FrameHeader = FrameHeader::parse(&self.header_scratch)?;
            self.header_filled = 0;
            self.in_remaining = header.length as usize;
            if let Some(msg) = self.in_msg.as_ref() {
                msg.set_len(header.length as usize);
            }
            self.header = Some(header);
        }

        if !self.fill_payload() {
            return Ok(());
        }

        // Message complete: hand it to the coordinator for routing.
        let header: FrameHeader = self.header.take().expect("header was parsed above");
        let msg: Msg = self.in_msg.take().expect("payload was read above");
        mux.route_stdin(header, msg)
    }

    fn handle_write(&mut self, mux: &mut IoMux) -> Result<(), Fail> {
        trace!("client handle_write(): fd={:?}", self.sock_fd);
        debug_assert_eq!(self.magic, CLIENT_IO_MAGIC);

        let msg: Msg = match self.out_msg.take() {
            Some(msg) => msg,
            None => match self.queue.pop_front() {
                None => return Ok(()),
                Some(msg) => {
                    self.out_remaining = msg.len();
                    msg
                },
            },
        };

        loop {
            let n: isize = {
                let bytes = msg.bytes();
                let offset: usize = bytes.len() - self.out_remaining;
                unsafe {
                    libc::write(
                        self.sock_fd,
                        bytes[offset..].as_ptr() as *const libc::c_void,
                        self.out_remaining,
                    )
                }
            };
            if n < 0 {
                let errno: i32 = io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO);
                match errno {
                    libc::EINTR => continue,
                    libc::EAGAIN => {
                        self.out_msg = Some(msg);
                        return Ok(());
                    },
                    libc::EPIPE | libc::ECONNRESET => {
                        // Peer is gone: stop writing and release everything queued.
                        debug!("handle_write(): client fd={:?} went away (errno={:?})", self.sock_fd, errno);
                        self.out_eof = true;
                        mux.free_outgoing(msg);
                        let stranded: VecDeque<Msg> = ::std::mem::take(&mut self.0.deref_mut().queue);
                        for queued in stranded {
                            mux.free_outgoing(queued);
                        }
                        return Ok(());
                    },
                    _ => {
                        error!("handle_write(): error writing to client (errno={:?})", errno);
                        self.out_msg = Some(msg);
                        return Ok(());
                    },
                }
            }
            self.out_remaining -= n as usize;
            if self.out_remaining > 0 {
                self.out_msg = Some(msg);
                return Ok(());
            }
            mux.free_outgoing(msg);
            return Ok(());
        }
    }

    fn request_shutdown(&mut self) {
        self.shutdown = true;
    }

    fn force_close(&mut self) {
        let client: &mut Client = self.0.deref_mut();
        client.end_input();
        client.out_eof = true;
        client.out_msg = None;
        client.queue.clear();
    }

    fn is_closed(&self) -> bool {
        if !self.in_eof {
            return false;
        }
        if self.out_eof {
            return true;
        }
        self.shutdown && self.out_msg.is_none() && self.queue.is_empty()
    }
}

impl Deref for SharedClient {
    type Target = Client;

    fn deref(&self) -> &Self::Target {
        self.0.deref()
    }
}

impl DerefMut for SharedClient {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.0.deref_mut()
    }
}
