// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    iomux::{
        client::{
            Client,
            SharedClient,
        },
        codec::{
            FrameHeader,
            FrameKind,
            InitMessage,
            HEADER_SIZE,
        },
        fd,
        pool::{
            BufferPool,
            Msg,
        },
        reactor::{
            SharedEventLoop,
            Wakeup,
        },
        task::{
            SharedTaskReader,
            SharedTaskWriter,
            TaskReader,
            TaskWriter,
        },
    },
    runtime::{
        fail::Fail,
        limits,
        SharedObject,
    },
};
use ::std::{
    collections::VecDeque,
    ops::{
        Deref,
        DerefMut,
    },
    os::unix::io::RawFd,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Tunables for one multiplexer instance.
#[derive(Clone, Debug)]
pub struct IoMuxOptions {
    /// Frame task output on line boundaries.
    pub buffered_stdio: bool,
    /// Replay-cache capacity, in messages.
    pub max_msg_cache: usize,
    /// Number of pooled buffers for client-to-task traffic.
    pub incoming_buffers: usize,
    /// Number of pooled buffers for task-to-client traffic.
    pub outgoing_buffers: usize,
}

/// Descriptors for one task's standard streams.
///
/// A stream redirected to a local file instead of a pipe is simply absent
/// and never touches the multiplexer.
#[derive(Clone, Debug)]
pub struct TaskStdio {
    pub gtaskid: u16,
    pub ltaskid: u16,
    /// Write end of the task's stdin pipe.
    pub stdin: Option<RawFd>,
    /// Read end of the task's stdout pipe.
    pub stdout: Option<RawFd>,
    /// Read end of the task's stderr pipe.
    pub stderr: Option<RawFd>,
}

/// The stdio multiplexer coordinator.
///
/// Owns the buffer pools, the endpoint lists, and the replay cache, and
/// routes messages between them: one stdin frame goes to one or all task
/// writers; one frame of task output fans out to every live client plus the
/// replay cache. The whole structure is confined to the reactor thread; the
/// only primitive another thread may touch is the [Wakeup] handle.
pub struct IoMux {
    options: IoMuxOptions,
    nodeid: u32,
    cred_sig: [u8; limits::CRED_SIGLEN],
    pool: BufferPool,
    /// Recent output frames replayed to late-attaching clients, oldest first.
    outgoing_cache: VecDeque<Msg>,
    writers: Vec<SharedTaskWriter>,
    stdout_readers: Vec<SharedTaskReader>,
    stderr_readers: Vec<SharedTaskReader>,
    clients: Vec<SharedClient>,
    reactor: SharedEventLoop,
    /// Local fd carrying daemon diagnostics to the client; closed first on teardown.
    debug_channel: Option<RawFd>,
}

#[derive(Clone)]
pub struct SharedIoMux(SharedObject<IoMux>);

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl SharedIoMux {
    /// Creates a multiplexer for the job rooted at this node.
    pub fn new(nodeid: u32, cred_sig: [u8; limits::CRED_SIGLEN], options: IoMuxOptions) -> Result<Self, Fail> {
        crate::runtime::logging::initialize();
        let reactor: SharedEventLoop = SharedEventLoop::new()?;
        let pool: BufferPool = BufferPool::new(options.incoming_buffers, options.outgoing_buffers);
        Ok(Self(SharedObject::new(IoMux {
            options,
            nodeid,
            cred_sig,
            pool,
            outgoing_cache: VecDeque::new(),
            writers: Vec::new(),
            stdout_readers: Vec::new(),
            stderr_readers: Vec::new(),
            clients: Vec::new(),
            reactor,
            debug_channel: None,
        })))
    }

    /// Wraps a task's stdio pipe descriptors into reactor registrants.
    pub fn add_task(&mut self, stdio: TaskStdio) -> Result<(), Fail> {
        let mut reactor: SharedEventLoop = self.reactor.clone();
        if let Some(stdin_fd) = stdio.stdin {
            fd::set_nonblocking(stdin_fd)?;
            fd::set_cloexec(stdin_fd)?;
            let writer: SharedTaskWriter = SharedTaskWriter::new(TaskWriter::new(stdin_fd, stdio.gtaskid));
            self.writers.push(writer.clone());
            reactor.register(Box::new(writer));
        }
        if let Some(stdout_fd) = stdio.stdout {
            fd::set_nonblocking(stdout_fd)?;
            fd::set_cloexec(stdout_fd)?;
            let reader: SharedTaskReader = SharedTaskReader::new(TaskReader::new(
                stdout_fd,
                FrameKind::Stdout,
                stdio.gtaskid,
                stdio.ltaskid,
            )?);
            self.stdout_readers.push(reader.clone());
            reactor.register(Box::new(reader));
        }
        if let Some(stderr_fd) = stdio.stderr {
            fd::set_nonblocking(stderr_fd)?;
            fd::set_cloexec(stderr_fd)?;
            let reader: SharedTaskReader = SharedTaskReader::new(TaskReader::new(
                stderr_fd,
                FrameKind::Stderr,
                stdio.gtaskid,
                stdio.ltaskid,
            )?);
            self.stderr_readers.push(reader.clone());
            reactor.register(Box::new(reader));
        }
        Ok(())
    }

    /// Attaches a connected client socket.
    ///
    /// The init message goes out blocking before the socket joins the
    /// reactor; the new client's queue is seeded from the replay cache on its
    /// first writability check.
    pub fn attach_client(&mut self, sock_fd: RawFd) -> Result<(), Fail> {
        debug!("attach_client(): fd={:?}", sock_fd);
        let init: InitMessage = InitMessage {
            cred_sig: self.cred_sig,
            nodeid: self.nodeid,
            stdout_objs: self.stdout_readers.len() as u32,
            stderr_objs: self.stderr_readers.len() as u32,
        };
        let mut bytes: [u8; InitMessage::SIZE] = [0; InitMessage::SIZE];
        init.serialize(&mut bytes);
        fd::set_blocking(sock_fd)?;
        fd::write_all(sock_fd, &bytes)?;
        fd::set_nonblocking(sock_fd)?;
        fd::set_cloexec(sock_fd)?;

        let client: SharedClient = SharedClient::new(Client::new(sock_fd));
        self.clients.push(client.clone());
        let mut reactor: SharedEventLoop = self.reactor.clone();
        reactor.register(Box::new(client));
        trace!("attach_client(): now handling {:?} client(s)", self.clients.len());
        reactor.wakeup().signal();
        Ok(())
    }

    /// Records the local fd carrying daemon diagnostics.
    pub fn set_debug_channel(&mut self, debug_fd: RawFd) {
        self.debug_channel = Some(debug_fd);
    }

    /// Returns a cross-thread handle that forces the next poll to return.
    pub fn wakeup(&self) -> Wakeup {
        self.reactor.wakeup()
    }

    /// Runs one reactor pass. A negative timeout waits indefinitely.
    pub fn poll_once(&mut self, timeout_ms: i32) -> Result<(), Fail> {
        let mut reactor: SharedEventLoop = self.reactor.clone();
        reactor.poll_once(self.0.deref_mut(), timeout_ms)
    }

    /// Runs the reactor until every registrant has been torn down.
    pub fn run(&mut self) -> Result<(), Fail> {
        debug!("run(): io handler started");
        while self.reactor.len() > 0 {
            self.poll_once(-1)?;
        }
        debug!("run(): io handler exited");
        Ok(())
    }

    /// Begins teardown: closes the debug channel, asks every registrant to
    /// shut down, and wakes the reactor so it can flush and unregister them.
    pub fn close_all(&mut self) {
        debug!("close_all(): closing debug channel");
        if let Some(debug_fd) = self.0.deref_mut().debug_channel.take() {
            fd::close(debug_fd);
        }
        let mut reactor: SharedEventLoop = self.reactor.clone();
        reactor.shutdown_all();
        reactor.wakeup().signal();
    }
}

impl IoMux {
    /// Returns the buffer pools.
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Returns the replay cache, oldest message first.
    pub fn cache(&self) -> &VecDeque<Msg> {
        &self.outgoing_cache
    }

    /// Routes one complete stdin message to its destination task(s).
    ///
    /// The caller's handle is consumed; each target queue holds its own
    /// clone, so the reference count matches the number of destinations and
    /// an unroutable message is released immediately.
    pub fn route_stdin(&mut self, header: FrameHeader, msg: Msg) -> Result<(), Fail> {
        match header.kind {
            FrameKind::AllStdin => {
                for i in 0..self.writers.len() {
                    let mut writer: SharedTaskWriter = self.writers[i].clone();
                    if writer.is_open() {
                        writer.enqueue(msg.clone());
                    }
                }
            },
            FrameKind::Stdin => {
                for i in 0..self.writers.len() {
                    let mut writer: SharedTaskWriter = self.writers[i].clone();
                    if writer.is_open() && writer.gtaskid() == header.gtaskid {
                        writer.enqueue(msg.clone());
                        break;
                    }
                }
            },
            _ => {
                let cause: String = format!("invalid frame kind {:?} on the stdin side", header.kind);
                error!("route_stdin(): {}", cause);
                return Err(Fail::new(libc::EPROTO, &cause));
            },
        }
        Ok(())
    }

    /// Packs staged output from `reader` into frames and fans each one out,
    /// until the staging ring drains or the outgoing pool runs dry.
    pub fn route_task_output(&mut self, reader: &mut TaskReader) {
        while reader.buffered() > 0 {
            let msg: Msg = match self.pool.outgoing().acquire() {
                Some(msg) => msg,
                None => return,
            };
            if !reader.build_frame(&msg, self.options.buffered_stdio) {
                // Partial line held for the next read; the unused buffer
                // drops straight back to the pool.
                return;
            }
            self.fan_out(msg);
        }
    }

    /// Sends a zero-length EOF frame for a finished output stream to every
    /// live client. Returns false when no outgoing buffer was available; the
    /// caller retries on a later pass.
    pub fn send_eof_frame(&mut self, kind: FrameKind, gtaskid: u16, ltaskid: u16) -> bool {
        let msg: Msg = match self.pool.outgoing().acquire() {
            Some(msg) => msg,
            None => {
                debug!("send_eof_frame(): outgoing pool empty, retrying later");
                return false;
            },
        };
        let header: FrameHeader = FrameHeader::new(kind, gtaskid, ltaskid, 0);
        header.serialize(&mut msg.storage_mut());
        msg.set_len(HEADER_SIZE);
        for i in 0..self.clients.len() {
            let mut client: SharedClient = self.clients[i].clone();
            if client.accepts_output() {
                client.enqueue_output(msg.clone());
            }
        }
        true
    }

    /// Releases one handle on an outgoing message. When that was the last
    /// handle the freed buffer invites more packing from the task readers.
    pub fn free_outgoing(&mut self, msg: Msg) {
        let last: bool = msg.ref_count() == 1;
        drop(msg);
        if last {
            self.invite_packing();
            self.reactor.wakeup().signal();
        }
    }

    /// Walks the task readers, packing more output while buffers last.
    /// Stderr drains ahead of stdout, mirroring the per-task service order.
    fn invite_packing(&mut self) {
        let ntasks: usize = self.stderr_readers.len().max(self.stdout_readers.len());
        for i in 0..ntasks {
            if self.pool.outgoing().is_empty() {
                return;
            }
            if i < self.stderr_readers.len() {
                let mut reader: SharedTaskReader = self.stderr_readers[i].clone();
                self.route_task_output(reader.deref_mut());
            }
            if self.pool.outgoing().is_empty() {
                return;
            }
            if i < self.stdout_readers.len() {
                let mut reader: SharedTaskReader = self.stdout_readers[i].clone();
                self.route_task_output(reader.deref_mut());
            }
        }
    }

    /// Forgets endpoints the reactor has unregistered, then lets freed
    /// buffers drive more packing.
    pub fn purge_closed(&mut self) {
        use crate::iomux::reactor::IoRegistrant;
        let before: usize =
            self.clients.len() + self.writers.len() + self.stdout_readers.len() + self.stderr_readers.len();
        self.clients.retain(|c: &SharedClient| !c.is_closed());
        self.writers.retain(|w: &SharedTaskWriter| w.is_open());
        self.stdout_readers.retain(|r: &SharedTaskReader| !r.is_closed());
        self.stderr_readers.retain(|r: &SharedTaskReader| !r.is_closed());
        let after: usize =
            self.clients.len() + self.writers.len() + self.stdout_readers.len() + self.stderr_readers.len();
        if after < before {
            self.invite_packing();
        }
    }

    /// Fans one output frame out to every live client and the replay cache.
    fn fan_out(&mut self, msg: Msg) {
        for i in 0..self.clients.len() {
            let mut client: SharedClient = self.clients[i].clone();
            if client.accepts_output() {
                client.enqueue_output(msg.clone());
            }
        }
        // The cache keeps its own reference; over capacity, the oldest entry
        // gives its reference up (live clients may still hold theirs).
        self.outgoing_cache.push_back(msg);
        if self.outgoing_cache.len() > self.options.max_msg_cache {
            self.outgoing_cache.pop_front();
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for IoMuxOptions {
    fn default() -> Self {
        Self {
            buffered_stdio: true,
            max_msg_cache: 64,
            incoming_buffers: 32,
            outgoing_buffers: 128,
        }
    }
}

impl Deref for SharedIoMux {
    type Target = IoMux;

    fn deref(&self) -> &Self::Target {
        self.0.deref()
    }
}

impl DerefMut for SharedIoMux {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.0.deref_mut()
    }
}
