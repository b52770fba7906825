// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    iomux::{
        coordinator::IoMux,
        fd,
    },
    runtime::{
        fail::Fail,
        SharedObject,
    },
};
use ::std::{
    io,
    ops::{
        Deref,
        DerefMut,
    },
    os::unix::io::RawFd,
};

//======================================================================================================================
// Traits
//======================================================================================================================

/// A descriptor registered with the event loop.
///
/// Before every wait the loop asks each registrant whether it currently wants
/// to read or write; handlers run level-triggered in registration order once
/// the descriptor is ready. A registrant whose handler fails is force-closed,
/// and any registrant reporting [`is_closed`](IoRegistrant::is_closed) is
/// unregistered at the end of the pass and its descriptor closed.
pub trait IoRegistrant {
    /// Returns the registered descriptor, or -1 once the endpoint closed it.
    fn fd(&self) -> RawFd;

    /// Returns whether the registrant wants to read.
    fn readable(&mut self, _mux: &mut IoMux) -> bool {
        false
    }

    /// Returns whether the registrant wants to write.
    fn writable(&mut self, _mux: &mut IoMux) -> bool {
        false
    }

    /// Handles read readiness.
    fn handle_read(&mut self, _mux: &mut IoMux) -> Result<(), Fail> {
        Ok(())
    }

    /// Handles write readiness.
    fn handle_write(&mut self, _mux: &mut IoMux) -> Result<(), Fail> {
        Ok(())
    }

    /// Asks the registrant to begin an orderly shutdown.
    fn request_shutdown(&mut self);

    /// Tears the endpoint down immediately after a terminal failure.
    fn force_close(&mut self);

    /// Returns whether the endpoint is finished and may be unregistered.
    fn is_closed(&self) -> bool;
}

//======================================================================================================================
// Structures
//======================================================================================================================

struct Registered {
    registrant: Box<dyn IoRegistrant>,
}

/// A level-triggered readiness loop over registered descriptors.
///
/// The loop owns a self-pipe whose read end is always in the poll set, so a
/// [Wakeup] handle can force the next wait to return from any thread. That
/// handle is the only part of the loop that may cross threads.
pub struct EventLoop {
    objs: Vec<Registered>,
    wakeup_rfd: RawFd,
    wakeup_wfd: RawFd,
}

#[derive(Clone)]
pub struct SharedEventLoop(SharedObject<EventLoop>);

/// A thread-safe handle that forces the event loop's next wait to return.
#[derive(Clone)]
pub struct Wakeup {
    wfd: RawFd,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl SharedEventLoop {
    /// Creates an event loop with its self-pipe.
    pub fn new() -> Result<Self, Fail> {
        let mut fds: [RawFd; 2] = [-1; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(Fail::last_os_error("could not create wakeup pipe"));
        }
        for pipe_fd in fds {
            fd::set_nonblocking(pipe_fd)?;
            fd::set_cloexec(pipe_fd)?;
        }
        Ok(Self(SharedObject::new(EventLoop {
            objs: Vec::new(),
            wakeup_rfd: fds[0],
            wakeup_wfd: fds[1],
        })))
    }

    /// Adds a registrant to the poll set.
    pub fn register(&mut self, registrant: Box<dyn IoRegistrant>) {
        trace!("register(): fd={:?}", registrant.fd());
        self.objs.push(Registered { registrant });
    }

    /// Returns the number of live registrants.
    pub fn len(&self) -> usize {
        self.objs.len()
    }

    /// Returns a cross-thread wakeup handle.
    pub fn wakeup(&self) -> Wakeup {
        Wakeup { wfd: self.wakeup_wfd }
    }

    /// Requests an orderly shutdown from every registrant.
    pub fn shutdown_all(&mut self) {
        for obj in self.objs.iter_mut() {
            obj.registrant.request_shutdown();
        }
    }

    /// Runs one pass: collect readiness, wait, dispatch, sweep.
    ///
    /// A negative `timeout_ms` waits until a descriptor is ready or the
    /// self-pipe is signalled.
    pub fn poll_once(&mut self, mux: &mut IoMux, timeout_ms: i32) -> Result<(), Fail> {
        // Readiness survey. Index 0 of the poll set is always the self-pipe.
        let mut pollfds: Vec<libc::pollfd> = Vec::with_capacity(self.objs.len() + 1);
        pollfds.push(libc::pollfd {
            fd: self.wakeup_rfd,
            events: libc::POLLIN,
            revents: 0,
        });
        let mut wants: Vec<(usize, bool, bool)> = Vec::with_capacity(self.objs.len());
        for i in 0..self.objs.len() {
            let reads: bool = self.objs[i].registrant.readable(mux);
            let writes: bool = self.objs[i].registrant.writable(mux);
            if !reads && !writes {
                continue;
            }
            let mut events: libc::c_short = 0;
            if reads {
                events |= libc::POLLIN;
            }
            if writes {
                events |= libc::POLLOUT;
            }
            pollfds.push(libc::pollfd {
                fd: self.objs[i].registrant.fd(),
                events,
                revents: 0,
            });
            wants.push((i, reads, writes));
        }

        let rc: i32 = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms) };
        if rc < 0 {
            if io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                return Ok(());
            }
            return Err(Fail::last_os_error("poll failed"));
        }

        // Drain the self-pipe so the next wait blocks again.
        if pollfds[0].revents & libc::POLLIN != 0 {
            let mut sink: [u8; 64] = [0; 64];
            while unsafe { libc::read(self.wakeup_rfd, sink.as_mut_ptr() as *mut libc::c_void, sink.len()) } > 0 {}
        }

        // Dispatch in registration order. Error conditions are delivered to
        // the read handler so the endpoint observes the EOF itself.
        for (slot, (i, reads, writes)) in wants.iter().enumerate() {
            let revents: libc::c_short = pollfds[slot + 1].revents;
            let error_bits: libc::c_short = libc::POLLERR | libc::POLLHUP | libc::POLLNVAL;
            if *reads && revents & (libc::POLLIN | error_bits) != 0 {
                if let Err(e) = self.objs[*i].registrant.handle_read(mux) {
                    warn!("poll_once(): read handler failed (fd={:?}): {:?}", self.objs[*i].registrant.fd(), e);
                    self.objs[*i].registrant.force_close();
                    continue;
                }
            }
            if *writes && revents & (libc::POLLOUT | error_bits) != 0 {
                if let Err(e) = self.objs[*i].registrant.handle_write(mux) {
                    warn!("poll_once(): write handler failed (fd={:?}): {:?}", self.objs[*i].registrant.fd(), e);
                    self.objs[*i].registrant.force_close();
                }
            }
        }

        // Sweep finished registrants.
        let mut i: usize = 0;
        let mut swept: bool = false;
        while i < self.objs.len() {
            if self.objs[i].registrant.is_closed() {
                let obj: Registered = self.objs.remove(i);
                let obj_fd: RawFd = obj.registrant.fd();
                trace!("poll_once(): unregistering fd={:?}", obj_fd);
                if obj_fd >= 0 {
                    fd::close(obj_fd);
                }
                swept = true;
            } else {
                i += 1;
            }
        }
        if swept {
            mux.purge_closed();
        }

        Ok(())
    }
}

impl Wakeup {
    /// Forces the event loop's next wait to return. Safe from any thread.
    pub fn signal(&self) {
        let byte: u8 = 1;
        unsafe { libc::write(self.wfd, &byte as *const u8 as *const libc::c_void, 1) };
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Deref for SharedEventLoop {
    type Target = EventLoop;

    fn deref(&self) -> &Self::Target {
        self.0.deref()
    }
}

impl DerefMut for SharedEventLoop {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.0.deref_mut()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        for obj in self.objs.drain(..) {
            let obj_fd: RawFd = obj.registrant.fd();
            if obj_fd >= 0 {
                fd::close(obj_fd);
            }
        }
        fd::close(self.wakeup_rfd);
        fd::close(self.wakeup_wfd);
    }
}
