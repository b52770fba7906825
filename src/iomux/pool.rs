// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    iomux::codec::HEADER_SIZE,
    runtime::limits,
};
use ::std::{
    cell::{
        Cell,
        Ref,
        RefCell,
        RefMut,
    },
    collections::VecDeque,
    rc::Rc,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Capacity of every pooled buffer: one full frame.
pub const BUFFER_CAPACITY: usize = HEADER_SIZE + limits::MAX_PAYLOAD;

//======================================================================================================================
// Structures
//======================================================================================================================

/// One side of the buffer pool: a free list of fixed-capacity byte storages.
///
/// Every storage is allocated once at startup and shuttles between this free
/// list and live [Msg] handles for the life of the multiplexer; the hot paths
/// never touch the allocator. An empty free list is backpressure, not
/// failure: callers return without progress and retry on a later pass.
struct PoolState {
    free: Vec<Box<[u8]>>,
}

/// A cloneable reference to one pool side.
#[derive(Clone)]
pub struct PoolHandle(Rc<RefCell<PoolState>>);

/// The two fixed-size free lists backing the multiplexer: one for messages
/// inbound from clients (stdin), one for messages outbound to clients
/// (stdout/stderr).
pub struct BufferPool {
    incoming: PoolHandle,
    outgoing: PoolHandle,
}

struct MsgState {
    /// The pooled storage.
    storage: RefCell<Box<[u8]>>,
    /// Valid length of the message within the storage.
    length: Cell<usize>,
    /// Pool the storage returns to when the last handle drops.
    home: PoolHandle,
}

/// A reference-counted handle to a pooled message buffer.
///
/// Cloning a handle is the fan-out primitive: every queue membership holds
/// one clone, so the reference count always equals the number of places the
/// message lives. Dropping the last handle returns the storage to its origin
/// pool; a leak or double free is unrepresentable.
pub struct Msg(Option<Rc<MsgState>>);

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl BufferPool {
    /// Creates a pool with `n_in` incoming and `n_out` outgoing buffers.
    pub fn new(n_in: usize, n_out: usize) -> Self {
        Self {
            incoming: PoolHandle::with_buffers(n_in),
            outgoing: PoolHandle::with_buffers(n_out),
        }
    }

    pub fn incoming(&self) -> &PoolHandle {
        &self.incoming
    }

    pub fn outgoing(&self) -> &PoolHandle {
        &self.outgoing
    }
}

impl PoolHandle {
    fn with_buffers(count: usize) -> Self {
        let free: Vec<Box<[u8]>> = (0..count).map(|_| vec![0u8; BUFFER_CAPACITY].into_boxed_slice()).collect();
        Self(Rc::new(RefCell::new(PoolState { free })))
    }

    /// Takes a buffer from the free list, or `None` when exhausted.
    pub fn acquire(&self) -> Option<Msg> {
        let storage: Box<[u8]> = self.0.borrow_mut().free.pop()?;
        Some(Msg(Some(Rc::new(MsgState {
            storage: RefCell::new(storage),
            length: Cell::new(0),
            home: self.clone(),
        }))))
    }

    /// Returns the number of free buffers.
    pub fn available(&self) -> usize {
        self.0.borrow().free.len()
    }

    /// Returns whether the free list is exhausted.
    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    fn release(&self, storage: Box<[u8]>) {
        self.0.borrow_mut().free.push(storage);
    }
}

impl Msg {
    /// Returns the valid length of the message.
    pub fn len(&self) -> usize {
        self.state().length.get()
    }

    /// Sets the valid length of the message.
    pub fn set_len(&self, length: usize) {
        assert!(length <= BUFFER_CAPACITY);
        self.state().length.set(length);
    }

    /// Returns the number of live handles on this message.
    pub fn ref_count(&self) -> usize {
        Rc::strong_count(self.0.as_ref().expect("message was already consumed"))
    }

    /// Borrows the valid bytes of the message.
    pub fn bytes(&self) -> Ref<'_, [u8]> {
        let length: usize = self.len();
        Ref::map(self.state().storage.borrow(), |s: &Box<[u8]>| &s[..length])
    }

    /// Mutably borrows the full storage of the message.
    pub fn storage_mut(&self) -> RefMut<'_, [u8]> {
        RefMut::map(self.state().storage.borrow_mut(), |s: &mut Box<[u8]>| &mut s[..])
    }

    fn state(&self) -> &MsgState {
        self.0.as_ref().expect("message was already consumed")
    }
}

/// Drains a queue of messages, dropping (and thereby releasing) each one.
pub fn drain_queue(queue: &mut VecDeque<Msg>) {
    while queue.pop_front().is_some() {}
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Clone for Msg {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl Drop for Msg {
    fn drop(&mut self) {
        if let Some(rc) = self.0.take() {
            // The last handle returns the storage to its origin pool.
            if let Ok(state) = Rc::try_unwrap(rc) {
                state.home.release(state.storage.into_inner());
            }
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
