// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    collections::cbuf::ByteRing,
    iomux::{
        codec::{
            FrameHeader,
            FrameKind,
            HEADER_SIZE,
        },
        coordinator::IoMux,
        fd,
        pool::{
            drain_queue,
            Msg,
        },
        reactor::IoRegistrant,
    },
    runtime::{
        fail::Fail,
        limits,
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

/// Debug tag for task stdin registrants.
const TASK_IN_MAGIC: u32 = 0x10103;

/// Debug tag for task stdout/stderr registrants.
const TASK_OUT_MAGIC: u32 = 0x10104;

/// The staging buffer holds a few frames worth of task output so short frames
/// coalesce and line boundaries can be found.
const CBUF_CAPACITY: usize = 4 * limits::MAX_PAYLOAD;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Feeds one task's stdin pipe from messages routed by clients.
pub struct TaskWriter {
    magic: u32,
    /// Write end of the task's stdin pipe; -1 once closed.
    pipe_fd: RawFd,
    gtaskid: u16,
    /// Message currently being written.
    msg: Option<Msg>,
    /// Unwritten bytes of that message.
    remaining: usize,
    /// Messages waiting to be written.
    queue: VecDeque<Msg>,
}

#[derive(Clone)]
pub struct SharedTaskWriter(SharedObject<TaskWriter>);

/// Drains one task's stdout or stderr pipe into a staging ring, from which
/// the coordinator packs wire frames.
pub struct TaskReader {
    magic: u32,
    /// Read end of the task's output pipe; -1 once closed.
    pipe_fd: RawFd,
    kind: FrameKind,
    gtaskid: u16,
    ltaskid: u16,
    cbuf: ByteRing,
    /// The task closed its end of the pipe.
    eof: bool,
    /// The zero-length EOF frame went out to clients.
    eof_msg_sent: bool,
}

#[derive(Clone)]
pub struct SharedTaskReader(SharedObject<TaskReader>);

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl TaskWriter {
    pub fn new(pipe_fd: RawFd, gtaskid: u16) -> Self {
        Self {
            magic: TASK_IN_MAGIC,
            pipe_fd,
            gtaskid,
            msg: None,
            remaining: 0,
            queue: VecDeque::new(),
        }
    }

    pub fn gtaskid(&self) -> u16 {
        self.gtaskid
    }

    /// Returns whether the stdin pipe is still open.
    pub fn is_open(&self) -> bool {
        self.pipe_fd >= 0
    }

    /// Queues a stdin message (zero-length means close the pipe).
    pub fn enqueue(&mut self, msg: Msg) {
        self.queue.push_back(msg);
    }

    fn close_pipe(&mut self) {
        if self.pipe_fd >= 0 {
            fd::close(self.pipe_fd);
            self.pipe_fd = -1;
        }
    }
}

impl SharedTaskWriter {
    pub fn new(writer: TaskWriter) -> Self {
        Self(SharedObject::new(writer))
    }
}

impl TaskReader {
    pub fn new(pipe_fd: RawFd, kind: FrameKind, gtaskid: u16, ltaskid: u16) -> Result<Self, Fail> {
        debug_assert!(kind == FrameKind::Stdout || kind == FrameKind::Stderr);
        Ok(Self {
            magic: TASK_OUT_MAGIC,
            pipe_fd,
            kind,
            gtaskid,
            ltaskid,
            cbuf: ByteRing::new(CBUF_CAPACITY)?,
            eof: false,
            eof_msg_sent: false,
        })
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    /// Returns the number of staged output bytes not yet packed into frames.
    pub fn buffered(&self) -> usize {
        self.cbuf.used()
    }

    /// Packs one frame of staged output into `msg`, applying the line policy.
    ///
    /// In line mode a frame ends on a newline when one fits; a line that
    /// fills the whole payload is truncated at [limits::MAX_PAYLOAD]; a
    /// partial line with room to grow is held for the next read. Returns
    /// false when nothing was packed.
    pub fn build_frame(&mut self, msg: &Msg, buffered_stdio: bool) -> bool {
        let payload_len: usize = {
            let mut storage = msg.storage_mut();
            let payload: &mut [u8] = &mut storage[HEADER_SIZE..HEADER_SIZE + limits::MAX_PAYLOAD];
            if buffered_stdio {
                let avail: usize = self.cbuf.peek_line(limits::MAX_PAYLOAD);
                if avail >= limits::MAX_PAYLOAD {
                    // A line longer than one payload must be truncated.
                    self.cbuf.read(payload)
                } else if avail == 0 {
                    0
                } else {
                    self.cbuf.read_lines(payload)
                }
            } else {
                self.cbuf.read(payload)
            }
        };
        if payload_len == 0 {
            return false;
        }
        let header: FrameHeader = FrameHeader::new(self.kind, self.gtaskid, self.ltaskid, payload_len as u32);
        header.serialize(&mut msg.storage_mut());
        msg.set_len(HEADER_SIZE + payload_len);
        true
    }
}

impl SharedTaskReader {
    pub fn new(reader: TaskReader) -> Self {
        Self(SharedObject::new(reader))
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl IoRegistrant for SharedTaskWriter {
    fn fd(&self) -> RawFd {
        self.pipe_fd
    }

    fn writable(&mut self, _mux: &mut IoMux) -> bool {
        debug_assert_eq!(self.magic, TASK_IN_MAGIC);
        self.msg.is_some() || !self.queue.is_empty()
    }

    fn handle_write(&mut self, _mux: &mut IoMux) -> Result<(), Fail> {
        trace!("task handle_write(): fd={:?}", self.pipe_fd);
        debug_assert_eq!(self.magic, TASK_IN_MAGIC);

        let msg: Msg = match self.msg.take() {
            Some(msg) => msg,
            None => match self.queue.pop_front() {
                None => return Ok(()),
                Some(msg) => {
                    if msg.len() == 0 {
                        // Zero length is the stdin EOF marker.
                        debug!("handle_write(): stdin eof, closing pipe fd={:?}", self.pipe_fd);
                        self.close_pipe();
                        return Ok(());
                    }
                    self.remaining = msg.len();
                    msg
                },
            },
        };

        loop {
            let n: isize = {
                let bytes = msg.bytes();
                let offset: usize = bytes.len() - self.remaining;
                unsafe {
                    libc::write(
                        self.pipe_fd,
                        bytes[offset..].as_ptr() as *const libc::c_void,
                        self.remaining,
                    )
                }
            };
            if n < 0 {
                let errno: i32 = io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO);
                match errno {
                    libc::EINTR => continue,
                    libc::EAGAIN => {
                        self.msg = Some(msg);
                        return Ok(());
                    },
                    _ => {
                        error!("handle_write(): error writing to task stdin (errno={:?})", errno);
                        self.close_pipe();
                        drain_queue(&mut self.queue);
                        return Ok(());
                    },
                }
            }
            self.remaining -= n as usize;
            if self.remaining > 0 {
                self.msg = Some(msg);
            }
            return Ok(());
        }
    }

    fn request_shutdown(&mut self) {
        self.close_pipe();
        drain_queue(&mut self.queue);
        self.msg = None;
    }

    fn force_close(&mut self) {
        self.request_shutdown();
    }

    fn is_closed(&self) -> bool {
        self.pipe_fd < 0
    }
}

impl IoRegistrant for SharedTaskReader {
    fn fd(&self) -> RawFd {
        self.pipe_fd
    }

    fn readable(&mut self, _mux: &mut IoMux) -> bool {
        debug_assert_eq!(self.magic, TASK_OUT_MAGIC);
        !self.eof_msg_sent && self.cbuf.free() > 0
    }

    fn handle_read(&mut self, mux: &mut IoMux) -> Result<(), Fail> {
        let reader: &mut TaskReader = self.0.deref_mut();
        trace!("task handle_read(): fd={:?}", reader.pipe_fd);
        debug_assert_eq!(reader.magic, TASK_OUT_MAGIC);

        if !reader.eof && reader.cbuf.free() > 0 {
            match reader.cbuf.write_from_fd(reader.pipe_fd) {
                Ok(0) => {
                    debug!("handle_read(): eof on task output fd={:?}", reader.pipe_fd);
                    reader.eof = true;
                },
                Ok(_) => {},
                Err(ref e) if e.errno == libc::EAGAIN => {},
                Err(e) => {
                    // Peer-gone errors end the stream like an EOF would.
                    warn!("handle_read(): error reading task output: {:?}", e);
                    reader.eof = true;
                },
            }
        }

        // Pack staged output into frames for every live client.
        mux.route_task_output(reader);

        if reader.cbuf.is_empty() && reader.eof && !reader.eof_msg_sent {
            if mux.send_eof_frame(reader.kind, reader.gtaskid, reader.ltaskid) {
                reader.eof_msg_sent = true;
            }
        }
        Ok(())
    }

    fn request_shutdown(&mut self) {
        self.eof = true;
    }

    fn force_close(&mut self) {
        self.eof = true;
        self.eof_msg_sent = true;
    }

    fn is_closed(&self) -> bool {
        self.eof_msg_sent
    }
}

impl Deref for SharedTaskWriter {
    type Target = TaskWriter;

    fn deref(&self) -> &Self::Target {
        self.0.deref()
    }
}

impl DerefMut for SharedTaskWriter {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.0.deref_mut()
    }
}

impl Deref for SharedTaskReader {
    type Target = TaskReader;

    fn deref(&self) -> &Self::Target {
        self.0.deref()
    }
}

impl DerefMut for SharedTaskReader {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.0.deref_mut()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        FrameKind,
        TaskReader,
    };
    use crate::{
        iomux::{
            codec::{
                FrameHeader,
                HEADER_SIZE,
            },
            pool::{
                BufferPool,
                Msg,
            },
        },
        runtime::limits,
    };
    use ::anyhow::Result;

    fn reader_with(bytes: &[u8]) -> Result<TaskReader, anyhow::Error> {
        let mut reader: TaskReader = TaskReader::new(-1, FrameKind::Stdout, 3, 0)?;
        crate::ensure_eq!(reader.cbuf.write_from_slice(bytes), bytes.len());
        Ok(reader)
    }

    #[test]
    fn build_frame_unbuffered_drains_everything() -> Result<()> {
        let pool: BufferPool = BufferPool::new(0, 1);
        let msg: Msg = pool.outgoing().acquire().expect("free buffer");
        let mut reader: TaskReader = reader_with(b"partial line without newline")?;

        crate::ensure_eq!(reader.build_frame(&msg, false), true);
        let header: FrameHeader = FrameHeader::parse(&msg.bytes())?;
        crate::ensure_eq!(header.kind, FrameKind::Stdout);
        crate::ensure_eq!(header.gtaskid, 3);
        crate::ensure_eq!(header.length as usize, 28);
        crate::ensure_eq!(reader.buffered(), 0);
        Ok(())
    }

    #[test]
    fn build_frame_line_mode_holds_partial_line() -> Result<()> {
        let pool: BufferPool = BufferPool::new(0, 1);
        let msg: Msg = pool.outgoing().acquire().expect("free buffer");
        let mut reader: TaskReader = reader_with(b"first\nsecond\ntail without newline")?;

        crate::ensure_eq!(reader.build_frame(&msg, true), true);
        crate::ensure_eq!(msg.len(), HEADER_SIZE + 13);
        crate::ensure_eq!(&msg.bytes()[HEADER_SIZE..], b"first\nsecond\n");

        // The unfinished tail stays staged.
        crate::ensure_eq!(reader.buffered(), 20);
        crate::ensure_eq!(reader.build_frame(&msg, true), false);
        Ok(())
    }

    #[test]
    fn build_frame_line_mode_truncates_runaway_line() -> Result<()> {
        let pool: BufferPool = BufferPool::new(0, 1);
        let msg: Msg = pool.outgoing().acquire().expect("free buffer");
        let bytes: Vec<u8> = vec![b'x'; limits::MAX_PAYLOAD + 16];
        let mut reader: TaskReader = reader_with(&bytes)?;

        crate::ensure_eq!(reader.build_frame(&msg, true), true);
        crate::ensure_eq!(msg.len(), HEADER_SIZE + limits::MAX_PAYLOAD);
        crate::ensure_eq!(reader.buffered(), 16);
        Ok(())
    }
}
