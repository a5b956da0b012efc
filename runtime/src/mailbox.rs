//! Bounded per-agent mailboxes.
//!
//! A mailbox is a power-of-two ring of [`SignalRef`] slots with
//! monotonic head/tail indices masked into the buffer. Exactly one
//! consumer (the scheduler, on the owning agent's turn) dequeues;
//! any code path may enqueue. Overflow policy is reject-newest: a
//! full mailbox refuses the signal, counts the drop, and raises its
//! overflow flag so the caller decides whether to retry, log, or
//! propagate.

use crate::signal::SignalRef;
use crate::{heap, next_power_of_two, AgentId, Result, RuntimeError};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

/// Mailbox capacity used when a topology does not request one.
pub const DEFAULT_CAPACITY: u32 = 256;

/// Mailbox flag bits.
pub const FLAG_ACTIVE: u16 = 0x0001;
pub const FLAG_OVERFLOW: u16 = 0x0002;

/// Bounded SPSC ring of signal references.
pub struct Mailbox {
    ring: RefCell<Box<[Option<SignalRef>]>>,
    capacity: u32,
    mask: u32,
    head: Cell<u32>,
    tail: Cell<u32>,
    count: Cell<u32>,
    total_enqueued: Cell<u32>,
    total_dequeued: Cell<u32>,
    dropped: Cell<u32>,
    owner: Cell<AgentId>,
    flags: Cell<u16>,
    descriptor_block: heap::Block,
    ring_block: heap::Block,
}

impl Mailbox {
    /// Create a mailbox, rounding the requested capacity up to the
    /// next power of two.
    pub fn new(capacity: u32) -> Result<Rc<Mailbox>> {
        let capacity = next_power_of_two(capacity);
        let descriptor_block = heap::allocate(std::mem::size_of::<Mailbox>())?;
        let ring_block = match heap::allocate(
            capacity as usize * std::mem::size_of::<Option<SignalRef>>(),
        ) {
            Ok(block) => block,
            Err(err) => {
                heap::free(descriptor_block);
                return Err(err);
            }
        };

        let ring = (0..capacity).map(|_| None).collect::<Vec<_>>();
        Ok(Rc::new(Mailbox {
            ring: RefCell::new(ring.into_boxed_slice()),
            capacity,
            mask: capacity - 1,
            head: Cell::new(0),
            tail: Cell::new(0),
            count: Cell::new(0),
            total_enqueued: Cell::new(0),
            total_dequeued: Cell::new(0),
            dropped: Cell::new(0),
            owner: Cell::new(0),
            flags: Cell::new(FLAG_ACTIVE),
            descriptor_block,
            ring_block,
        }))
    }

    /// Enqueue a reference to `signal`.
    ///
    /// On success the mailbox takes its own handle (the reference
    /// count rises by one). When full the signal is refused, the drop
    /// counted, and the caller keeps sole responsibility for its
    /// handle.
    pub fn enqueue(&self, signal: &SignalRef) -> Result<()> {
        // Attempts are counted whether or not they are accepted, so
        // that total_enqueued - total_dequeued - dropped == count
        // holds for the lifetime of the mailbox.
        self.total_enqueued.set(self.total_enqueued.get() + 1);

        if self.count.get() == self.capacity {
            self.dropped.set(self.dropped.get() + 1);
            self.flags.set(self.flags.get() | FLAG_OVERFLOW);
            return Err(RuntimeError::QueueFull {
                count: self.count.get(),
                capacity: self.capacity,
            });
        }

        let slot = (self.tail.get() & self.mask) as usize;
        self.ring.borrow_mut()[slot] = Some(signal.clone());
        self.tail.set(self.tail.get().wrapping_add(1));
        self.count.set(self.count.get() + 1);
        Ok(())
    }

    /// Dequeue the oldest signal, or `None` when empty. The caller
    /// inherits the mailbox's handle and drops it when finished.
    pub fn dequeue(&self) -> Option<SignalRef> {
        if self.count.get() == 0 {
            return None;
        }

        let slot = (self.head.get() & self.mask) as usize;
        let signal = self.ring.borrow_mut()[slot].take();
        self.head.set(self.head.get().wrapping_add(1));
        self.count.set(self.count.get() - 1);
        self.total_dequeued.set(self.total_dequeued.get() + 1);
        signal
    }

    /// Next signal without removing it; head, tail, and counters are
    /// untouched. The returned handle is an extra borrow and drops
    /// without affecting the queued reference.
    pub fn peek(&self) -> Option<SignalRef> {
        if self.count.get() == 0 {
            return None;
        }
        let slot = (self.head.get() & self.mask) as usize;
        self.ring.borrow()[slot].clone()
    }

    #[inline]
    pub fn len(&self) -> u32 {
        self.count.get()
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count.get() == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.count.get() == self.capacity
    }

    #[inline]
    pub fn total_enqueued(&self) -> u32 {
        self.total_enqueued.get()
    }

    #[inline]
    pub fn total_dequeued(&self) -> u32 {
        self.total_dequeued.get()
    }

    /// Signals refused because the ring was full.
    #[inline]
    pub fn dropped(&self) -> u32 {
        self.dropped.get()
    }

    /// True once any enqueue has been refused.
    #[inline]
    pub fn overflowed(&self) -> bool {
        self.flags.get() & FLAG_OVERFLOW != 0
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.flags.get() & FLAG_ACTIVE != 0
    }

    #[inline]
    pub fn owner(&self) -> AgentId {
        self.owner.get()
    }

    pub(crate) fn set_owner(&self, owner: AgentId) {
        self.owner.set(owner);
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        // Slots still holding references release them when the ring
        // drops; only the heap charges need explicit return.
        heap::free(self.ring_block);
        heap::free(self.descriptor_block);
    }
}

impl fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox")
            .field("owner", &self.owner.get())
            .field("count", &self.count.get())
            .field("capacity", &self.capacity)
            .field("dropped", &self.dropped.get())
            .finish()
    }
}
