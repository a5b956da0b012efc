//! Signal envelopes and their reference-counted lifecycle.
//!
//! A signal is an immutable envelope: kind, origin, flags, payload
//! bytes, and a cycle-counter timestamp captured at creation. One
//! emission may fan out to many mailboxes; every destination holds the
//! same envelope through a [`SignalRef`] handle, and the envelope is
//! destroyed exactly when the last handle drops. The envelope and its
//! payload buffer are both charged against the [`heap`](crate::heap)
//! region and release their charge on destruction.

use crate::{heap, AgentId, Kind, Result, RuntimeError};
use std::cell::Cell;
use std::fmt;
use std::rc::Rc;
use std::sync::OnceLock;

/// Largest accepted payload, in bytes.
pub const MAX_PAYLOAD: usize = 64 * 1024;

/// Signal flag bits.
pub const FLAG_OWNS_PAYLOAD: u16 = 0x0001;
pub const FLAG_HEAP_ALLOCATED: u16 = 0x0002;
pub const FLAG_PROCESSED: u16 = 0x0004;
pub const FLAG_BROADCAST: u16 = 0x0008;

/// Shared handle to a signal. The reference count is the number of
/// live handles: one per holding mailbox plus any the caller retains.
pub type SignalRef = Rc<Signal>;

static CLOCK: OnceLock<quanta::Clock> = OnceLock::new();

/// Process-wide cycle-counter clock used for signal timestamps and
/// scheduler wall time.
pub(crate) fn clock() -> &'static quanta::Clock {
    CLOCK.get_or_init(quanta::Clock::new)
}

/// Immutable message envelope shared between emitter and destinations.
#[derive(PartialEq)]
pub struct Signal {
    kind: Kind,
    origin: AgentId,
    flags: Cell<u16>,
    payload: Box<[u8]>,
    capacity: usize,
    timestamp: u64,
    envelope_block: heap::Block,
    payload_block: Option<heap::Block>,
}

/// Create a signal, copying the caller's payload bytes into a buffer
/// owned by the envelope. Returns a handle with reference count one.
pub fn create(kind: Kind, origin: AgentId, payload: &[u8]) -> Result<SignalRef> {
    if payload.len() > MAX_PAYLOAD {
        return Err(RuntimeError::PayloadTooLarge {
            size: payload.len(),
            limit: MAX_PAYLOAD,
        });
    }

    let envelope_block = heap::allocate(std::mem::size_of::<Signal>())?;
    let mut flags = FLAG_HEAP_ALLOCATED;

    let (payload_block, capacity) = if payload.is_empty() {
        (None, 0)
    } else {
        let block = match heap::allocate(payload.len()) {
            Ok(block) => block,
            Err(err) => {
                heap::free(envelope_block);
                return Err(err);
            }
        };
        flags |= FLAG_OWNS_PAYLOAD;
        let capacity = block.size();
        (Some(block), capacity)
    };

    Ok(Rc::new(Signal {
        kind,
        origin,
        flags: Cell::new(flags),
        payload: payload.to_vec().into_boxed_slice(),
        capacity,
        timestamp: clock().raw(),
        envelope_block,
        payload_block,
    }))
}

/// Number of live handles to `signal`.
#[inline]
pub fn ref_count(signal: &SignalRef) -> usize {
    Rc::strong_count(signal)
}

impl Signal {
    /// Frequency class of this signal.
    #[inline]
    pub fn kind(&self) -> Kind {
        self.kind
    }

    /// Id of the emitting agent.
    #[inline]
    pub fn origin(&self) -> AgentId {
        self.origin
    }

    /// Cycle-counter timestamp captured at creation.
    #[inline]
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Payload bytes. Empty when the signal carries no payload.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Logical payload size in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Allocated payload capacity (aligned), zero when payload-free.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Typed read of the leading payload bytes.
    ///
    /// The payload buffer carries no alignment guarantee, so the value
    /// is read out rather than viewed in place. Returns `None` when
    /// the payload is shorter than `T`.
    pub fn payload_as<T: bytemuck::AnyBitPattern>(&self) -> Option<T> {
        self.payload
            .get(..std::mem::size_of::<T>())
            .map(bytemuck::pod_read_unaligned)
    }

    #[inline]
    pub fn flags(&self) -> u16 {
        self.flags.get()
    }

    #[inline]
    pub fn owns_payload(&self) -> bool {
        self.flags.get() & FLAG_OWNS_PAYLOAD != 0
    }

    #[inline]
    pub fn is_processed(&self) -> bool {
        self.flags.get() & FLAG_PROCESSED != 0
    }

    #[inline]
    pub fn is_broadcast(&self) -> bool {
        self.flags.get() & FLAG_BROADCAST != 0
    }

    pub(crate) fn set_broadcast(&self) {
        self.flags.set(self.flags.get() | FLAG_BROADCAST);
    }

    /// Mark the signal processed and release the caller's handle.
    pub fn mark_processed(self: SignalRef) {
        self.flags.set(self.flags.get() | FLAG_PROCESSED);
    }
}

impl Drop for Signal {
    fn drop(&mut self) {
        if let Some(block) = self.payload_block.take() {
            heap::free(block);
        }
        heap::free(self.envelope_block);
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("kind", &self.kind)
            .field("origin", &self.origin)
            .field("len", &self.payload.len())
            .field("flags", &format_args!("{:#06x}", self.flags.get()))
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_copies_payload_and_sets_flags() {
        let sig = create(7, 3, &100u32.to_le_bytes()).unwrap();
        assert_eq!(sig.kind(), 7);
        assert_eq!(sig.origin(), 3);
        assert_eq!(sig.len(), 4);
        assert_eq!(sig.payload(), &100u32.to_le_bytes());
        assert!(sig.owns_payload());
        assert!(!sig.is_broadcast());
        assert!(sig.capacity() >= sig.len());
        assert_eq!(ref_count(&sig), 1);
    }

    #[test]
    fn payload_free_signal_owns_nothing() {
        let sig = create(1, 1, &[]).unwrap();
        assert!(sig.is_empty());
        assert_eq!(sig.capacity(), 0);
        assert!(!sig.owns_payload());
    }

    #[test]
    fn typed_payload_view() {
        let sig = create(2, 1, &12345u32.to_le_bytes()).unwrap();
        assert_eq!(sig.payload_as::<u32>().unwrap(), 12345);
        assert!(sig.payload_as::<u64>().is_none());
    }

    #[test]
    fn payload_size_boundary() {
        let max = vec![0xAB; MAX_PAYLOAD];
        let sig = create(1, 1, &max).unwrap();
        assert_eq!(sig.len(), MAX_PAYLOAD);
        drop(sig);

        let over = vec![0xCD; MAX_PAYLOAD + 1];
        assert_eq!(
            create(1, 1, &over),
            Err(RuntimeError::PayloadTooLarge {
                size: MAX_PAYLOAD + 1,
                limit: MAX_PAYLOAD,
            })
        );
    }

    #[test]
    fn handles_share_one_envelope() {
        let sig = create(4, 2, b"pulse").unwrap();
        let other = sig.clone();
        assert_eq!(ref_count(&sig), 2);
        drop(other);
        assert_eq!(ref_count(&sig), 1);
    }

    #[test]
    fn create_then_drop_restores_heap_usage() {
        let before = heap::used();
        let sig = create(9, 5, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        assert!(heap::used() > before);
        drop(sig);
        assert_eq!(heap::used(), before);
    }

    #[test]
    fn mark_processed_sets_flag_and_consumes_handle() {
        let sig = create(6, 1, &[]).unwrap();
        let held = sig.clone();
        sig.mark_processed();
        assert!(held.is_processed());
        assert_eq!(ref_count(&held), 1);
    }

    #[test]
    fn timestamps_are_monotonic_per_thread() {
        let a = create(1, 1, &[]).unwrap();
        let b = create(1, 1, &[]).unwrap();
        assert!(b.timestamp() >= a.timestamp());
    }

    #[test]
    fn exhausted_heap_propagates_alloc_failure() {
        std::thread::spawn(|| {
            heap::init(4096);
            let err = create(1, 1, &vec![0u8; 8192]).unwrap_err();
            assert!(matches!(err, RuntimeError::AllocFailed { .. }));
            // The envelope charge was rolled back.
            assert_eq!(heap::used(), 0);
        })
        .join()
        .unwrap();
    }
}
