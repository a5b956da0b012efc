//! Per-agent dispatch: matching a signal's kind to a handler.
//!
//! Each agent owns a dispatch table mapping signal kinds to handler
//! functions with optional guard predicates and a default fallback.
//! Lookup is a linear scan over a contiguous entry array — typical
//! tables hold fewer than sixteen entries and fit in a cache line,
//! where a hash would cost more than it saves.

use crate::mailbox::Mailbox;
use crate::signal::{Signal, SignalRef};
use crate::{heap, AgentId, Kind, Result, RuntimeError};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

/// Dispatch table capacity used when a topology does not request one.
pub const DEFAULT_CAPACITY: u32 = 16;

const ENTRY_ACTIVE: u16 = 0x0001;
const ENTRY_HAS_GUARD: u16 = 0x0002;

/// Handler invoked for a matched signal. Receives the agent's private
/// state bytes and the signal; returns zero on success, any other
/// status is surfaced as [`RuntimeError::HandlerFailed`].
pub type Handler = fn(state: &mut [u8], signal: &Signal) -> i32;

/// Guard predicate evaluated before its handler runs. Returning
/// `false` rejects the signal without touching agent state.
pub type Guard = fn(state: &[u8], signal: &Signal) -> bool;

/// Zero-initialized private state buffer owned by one agent.
///
/// Only the owning agent's handlers mutate it; the runtime hands the
/// bytes to handlers as a plain slice and never interprets them.
pub struct AgentState {
    bytes: RefCell<Box<[u8]>>,
    block: heap::Block,
}

impl AgentState {
    pub fn new(size: usize) -> Result<Rc<AgentState>> {
        let block = heap::allocate(size)?;
        Ok(Rc::new(AgentState {
            bytes: RefCell::new(vec![0u8; size].into_boxed_slice()),
            block,
        }))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.borrow().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read access for assertions and guards outside dispatch.
    pub fn with<T>(&self, f: impl FnOnce(&[u8]) -> T) -> T {
        f(&self.bytes.borrow())
    }

    /// Typed read of the leading state bytes.
    pub fn read<T: bytemuck::AnyBitPattern>(&self) -> Option<T> {
        let bytes = self.bytes.borrow();
        bytes
            .get(..std::mem::size_of::<T>())
            .map(bytemuck::pod_read_unaligned)
    }
}

impl Drop for AgentState {
    fn drop(&mut self) {
        heap::free(self.block);
    }
}

impl fmt::Debug for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentState").field("len", &self.len()).finish()
    }
}

#[derive(Clone, Copy)]
struct DispatchEntry {
    kind: Kind,
    flags: u16,
    handler: Handler,
    guard: Option<Guard>,
}

impl DispatchEntry {
    #[inline]
    fn is_active(&self) -> bool {
        self.flags & ENTRY_ACTIVE != 0
    }
}

/// Per-agent mapping from signal kind to handler.
pub struct DispatchTable {
    entries: RefCell<Vec<DispatchEntry>>,
    capacity: u32,
    agent_id: AgentId,
    default_handler: Cell<Option<Handler>>,
    state: RefCell<Option<Rc<AgentState>>>,
    lookup_count: Cell<u64>,
    hit_count: Cell<u64>,
    miss_count: Cell<u64>,
    entries_block: heap::Block,
}

impl DispatchTable {
    /// Create a table with room for `capacity` handler entries.
    pub fn new(capacity: u32, agent_id: AgentId) -> Result<Rc<DispatchTable>> {
        let capacity = capacity.max(1);
        let entries_block = heap::allocate(
            capacity as usize * std::mem::size_of::<DispatchEntry>(),
        )?;
        Ok(Rc::new(DispatchTable {
            entries: RefCell::new(Vec::with_capacity(capacity as usize)),
            capacity,
            agent_id,
            default_handler: Cell::new(None),
            state: RefCell::new(None),
            lookup_count: Cell::new(0),
            hit_count: Cell::new(0),
            miss_count: Cell::new(0),
            entries_block,
        }))
    }

    #[inline]
    pub fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    /// Register a handler for `kind`, updating in place if an active
    /// entry for the same kind exists.
    pub fn register(&self, kind: Kind, handler: Handler, guard: Option<Guard>) -> Result<()> {
        let mut entries = self.entries.borrow_mut();

        if let Some(entry) = entries.iter_mut().find(|e| e.is_active() && e.kind == kind) {
            entry.handler = handler;
            entry.guard = guard;
            entry.flags = if guard.is_some() {
                ENTRY_ACTIVE | ENTRY_HAS_GUARD
            } else {
                ENTRY_ACTIVE
            };
            return Ok(());
        }

        if entries.len() as u32 >= self.capacity {
            return Err(RuntimeError::TableFull {
                capacity: self.capacity,
            });
        }

        let mut flags = ENTRY_ACTIVE;
        if guard.is_some() {
            flags |= ENTRY_HAS_GUARD;
        }
        entries.push(DispatchEntry {
            kind,
            flags,
            handler,
            guard,
        });
        Ok(())
    }

    /// Clear the active bit of the entry for `kind`.
    pub fn unregister(&self, kind: Kind) -> Result<()> {
        let mut entries = self.entries.borrow_mut();
        match entries.iter_mut().find(|e| e.is_active() && e.kind == kind) {
            Some(entry) => {
                entry.flags &= !ENTRY_ACTIVE;
                Ok(())
            }
            None => Err(RuntimeError::NoHandler { kind }),
        }
    }

    /// Install the fallback invoked when no entry matches.
    pub fn set_default(&self, handler: Handler) {
        self.default_handler.set(Some(handler));
    }

    /// Cache the agent state so [`invoke`](Self::invoke) needs no
    /// registry lookup.
    pub fn set_state(&self, state: Rc<AgentState>) {
        *self.state.borrow_mut() = Some(state);
    }

    /// Handler registered for `kind`, if any.
    pub fn lookup(&self, kind: Kind) -> Option<Handler> {
        self.entries
            .borrow()
            .iter()
            .find(|e| e.is_active() && e.kind == kind)
            .map(|e| e.handler)
    }

    /// Dispatch `signal` against the cached agent state.
    pub fn invoke(&self, signal: &Signal) -> Result<()> {
        let state = self.state.borrow().clone();
        match state {
            Some(state) => {
                let mut bytes = state.bytes.borrow_mut();
                self.invoke_inner(&mut bytes[..], signal)
            }
            None => self.invoke_inner(&mut [], signal),
        }
    }

    /// Dispatch `signal` against an explicit state, overriding the
    /// cached one.
    pub fn invoke_with_state(&self, state: &AgentState, signal: &Signal) -> Result<()> {
        let mut bytes = state.bytes.borrow_mut();
        self.invoke_inner(&mut bytes[..], signal)
    }

    fn invoke_inner(&self, state: &mut [u8], signal: &Signal) -> Result<()> {
        self.lookup_count.set(self.lookup_count.get() + 1);

        let entry = self
            .entries
            .borrow()
            .iter()
            .find(|e| e.is_active() && e.kind == signal.kind())
            .copied();

        let Some(entry) = entry else {
            self.miss_count.set(self.miss_count.get() + 1);
            return match self.default_handler.get() {
                Some(default) => match default(state, signal) {
                    0 => Ok(()),
                    status => Err(RuntimeError::HandlerFailed {
                        kind: signal.kind(),
                        status,
                    }),
                },
                None => Err(RuntimeError::NoHandler {
                    kind: signal.kind(),
                }),
            };
        };

        self.hit_count.set(self.hit_count.get() + 1);

        if let Some(guard) = entry.guard {
            if !guard(state, signal) {
                return Err(RuntimeError::GuardRejected {
                    kind: signal.kind(),
                });
            }
        }

        match (entry.handler)(state, signal) {
            0 => Ok(()),
            status => Err(RuntimeError::HandlerFailed {
                kind: signal.kind(),
                status,
            }),
        }
    }

    /// Dequeue and dispatch until the mailbox is empty. Returns the
    /// number of signals processed; dispatch outcomes are reflected in
    /// the table counters, not the return value.
    pub fn process_queue(&self, mailbox: &Mailbox) -> u32 {
        let mut processed = 0;
        while let Some(signal) = mailbox.dequeue() {
            self.dispatch_and_release(signal);
            processed += 1;
        }
        processed
    }

    /// Like [`process_queue`](Self::process_queue) but stops after
    /// `max` signals; the scheduler uses this for fair rotation.
    pub fn process_batch(&self, mailbox: &Mailbox, max: u32) -> u32 {
        let mut processed = 0;
        while processed < max {
            let Some(signal) = mailbox.dequeue() else { break };
            self.dispatch_and_release(signal);
            processed += 1;
        }
        processed
    }

    fn dispatch_and_release(&self, signal: SignalRef) {
        if let Err(err) = self.invoke(&signal) {
            tracing::trace!(agent = self.agent_id, %err, "dispatch outcome");
        }
    }

    #[inline]
    pub fn lookup_count(&self) -> u64 {
        self.lookup_count.get()
    }

    #[inline]
    pub fn hit_count(&self) -> u64 {
        self.hit_count.get()
    }

    #[inline]
    pub fn miss_count(&self) -> u64 {
        self.miss_count.get()
    }

    pub fn reset_stats(&self) {
        self.lookup_count.set(0);
        self.hit_count.set(0);
        self.miss_count.set(0);
    }

    /// Active handler entries.
    pub fn len(&self) -> u32 {
        self.entries.borrow().iter().filter(|e| e.is_active()).count() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

impl Drop for DispatchTable {
    fn drop(&mut self) {
        heap::free(self.entries_block);
    }
}

impl fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchTable")
            .field("agent", &self.agent_id)
            .field("entries", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
