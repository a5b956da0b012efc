//! Signal routing: fanning one emission out to destination mailboxes.
//!
//! The routing table is an open-addressed hash table keyed by
//! `(source agent, kind)`, hashed with FNV-1a and probed linearly.
//! Each entry carries its destination ids in declaration order plus a
//! lazily resolved cache of destination mailbox handles: a one-shot
//! [`RoutingTable::resolve`] pass fills the cache after all agents
//! exist, and [`RoutingTable::broadcast`] repairs any hole it finds on
//! first use.

use crate::registry::Registry;
use crate::signal::{self, SignalRef};
use crate::{heap, mailbox::Mailbox, next_power_of_two, AgentId, Kind, Result, RuntimeError};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

/// Routing table capacity used when none is requested.
pub const DEFAULT_CAPACITY: u32 = 64;

const FNV_OFFSET_BASIS: u32 = 2_166_136_261;
const FNV_PRIME: u32 = 16_777_619;

/// FNV-1a over the `(source, kind)` pair.
#[inline]
pub(crate) fn fnv1a(source: AgentId, kind: Kind) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    hash ^= u32::from(source);
    hash = hash.wrapping_mul(FNV_PRIME);
    hash ^= u32::from(kind);
    hash.wrapping_mul(FNV_PRIME)
}

struct RouteEntry {
    source: AgentId,
    kind: Kind,
    dests: Vec<AgentId>,
    /// Parallel to `dests`; holes are repaired on first use.
    queues: RefCell<Vec<Option<Rc<Mailbox>>>>,
    dests_block: heap::Block,
    queues_block: heap::Block,
}

impl Drop for RouteEntry {
    fn drop(&mut self) {
        heap::free(self.dests_block);
        heap::free(self.queues_block);
    }
}

/// Open-addressed map from `(source, kind)` to destination mailboxes.
pub struct RoutingTable {
    slots: Box<[Option<RouteEntry>]>,
    capacity: u32,
    mask: u32,
    entry_count: u32,
    collisions: Cell<u64>,
    slots_block: heap::Block,
}

impl RoutingTable {
    /// Create a table, rounding the requested capacity up to the next
    /// power of two.
    pub fn new(capacity: u32) -> Result<RoutingTable> {
        let capacity = next_power_of_two(capacity);
        let slots_block = heap::allocate(
            capacity as usize * std::mem::size_of::<Option<RouteEntry>>(),
        )?;
        Ok(RoutingTable {
            slots: (0..capacity).map(|_| None).collect(),
            capacity,
            mask: capacity - 1,
            entry_count: 0,
            collisions: Cell::new(0),
            slots_block,
        })
    }

    /// Probe for the slot holding `(source, kind)`. Returns the slot
    /// index and whether a live entry was found there; counts every
    /// probe step past the first as a collision.
    fn find_slot(&self, source: AgentId, kind: Kind) -> (usize, bool) {
        let start = (fnv1a(source, kind) & self.mask) as usize;
        let mut index = start;
        loop {
            match &self.slots[index] {
                None => return (index, false),
                Some(entry) if entry.source == source && entry.kind == kind => {
                    return (index, true);
                }
                Some(_) => {
                    self.collisions.set(self.collisions.get() + 1);
                    index = (index + 1) & self.mask as usize;
                    if index == start {
                        return (index, false);
                    }
                }
            }
        }
    }

    /// Declare the route `(source, kind) -> destinations`.
    ///
    /// An existing entry for the pair is replaced and its old arrays
    /// freed; destinations keep declaration order.
    pub fn add(&mut self, source: AgentId, kind: Kind, destinations: &[AgentId]) -> Result<()> {
        if destinations.is_empty() {
            return Err(RuntimeError::NoRoute { from_agent: source, kind });
        }

        let (index, found) = self.find_slot(source, kind);
        if !found && self.entry_count == self.capacity {
            return Err(RuntimeError::TableFull {
                capacity: self.capacity,
            });
        }

        let dests_block =
            heap::allocate(destinations.len() * std::mem::size_of::<AgentId>())?;
        let queues_block = match heap::allocate(
            destinations.len() * std::mem::size_of::<Option<Rc<Mailbox>>>(),
        ) {
            Ok(block) => block,
            Err(err) => {
                heap::free(dests_block);
                return Err(err);
            }
        };

        // Replacing drops the old entry, returning its charges.
        self.slots[index] = Some(RouteEntry {
            source,
            kind,
            dests: destinations.to_vec(),
            queues: RefCell::new(vec![None; destinations.len()]),
            dests_block,
            queues_block,
        });
        if !found {
            self.entry_count += 1;
        }
        tracing::debug!(source, kind, dests = ?destinations, "route declared");
        Ok(())
    }

    /// Destinations of `(source, kind)` in declaration order.
    pub fn lookup(&self, source: AgentId, kind: Kind) -> Result<&[AgentId]> {
        let (index, found) = self.find_slot(source, kind);
        if !found {
            return Err(RuntimeError::NoRoute { from_agent: source, kind });
        }
        Ok(&self.slots[index].as_ref().expect("probed live slot").dests)
    }

    /// Fill every entry's mailbox cache from the registry. Idempotent;
    /// called once after topology construction.
    pub fn resolve(&self, registry: &Registry) {
        for entry in self.slots.iter().flatten() {
            let mut queues = entry.queues.borrow_mut();
            for (dest, queue) in entry.dests.iter().zip(queues.iter_mut()) {
                *queue = registry.mailbox(*dest);
            }
        }
    }

    /// Fan `signal` out to every destination of its route.
    ///
    /// Returns the number of successful deliveries. A missing route
    /// delivers zero; a full destination mailbox counts its own drop
    /// and is skipped. Routes with more than one destination stamp the
    /// broadcast flag before delivery.
    pub fn broadcast(&self, signal: &SignalRef, registry: &Registry) -> u32 {
        let (index, found) = self.find_slot(signal.origin(), signal.kind());
        if !found {
            return 0;
        }
        let entry = self.slots[index].as_ref().expect("probed live slot");

        if entry.dests.len() > 1 {
            signal.set_broadcast();
        }

        let mut delivered = 0;
        let mut queues = entry.queues.borrow_mut();
        for (dest, queue) in entry.dests.iter().zip(queues.iter_mut()) {
            if queue.is_none() {
                *queue = registry.mailbox(*dest);
            }
            let Some(mailbox) = queue else { continue };
            if mailbox.enqueue(signal).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Live routes.
    #[inline]
    pub fn entry_count(&self) -> u32 {
        self.entry_count
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Probe steps taken past home slots, for diagnostics.
    #[inline]
    pub fn collision_count(&self) -> u64 {
        self.collisions.get()
    }
}

impl Drop for RoutingTable {
    fn drop(&mut self) {
        heap::free(self.slots_block);
    }
}

impl fmt::Debug for RoutingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingTable")
            .field("entries", &self.entry_count)
            .field("capacity", &self.capacity)
            .field("collisions", &self.collisions.get())
            .finish()
    }
}

/// Create, broadcast, and release in one step.
///
/// The creator's reference is dropped on return, so a signal with zero
/// deliveries is freed immediately while queued references keep it
/// alive.
pub fn emit_signal(
    routing: &RoutingTable,
    registry: &Registry,
    kind: Kind,
    origin: AgentId,
    payload: &[u8],
) -> Result<u32> {
    let sig = signal::create(kind, origin, payload)?;
    let delivered = routing.broadcast(&sig, registry);
    tracing::trace!(kind, origin, delivered, "signal emitted");
    Ok(delivered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchTable;
    use crate::registry::Agent;
    use crate::signal::ref_count;

    fn network(ids: &[AgentId]) -> Registry {
        let mut registry = Registry::new(16);
        for &id in ids {
            registry
                .register(Agent::new(
                    id,
                    None,
                    None,
                    Mailbox::new(4).unwrap(),
                    DispatchTable::new(4, id).unwrap(),
                ))
                .unwrap();
        }
        registry
    }

    #[test]
    fn hash_is_stable_and_spreads() {
        assert_eq!(fnv1a(1, 2), fnv1a(1, 2));
        assert_ne!(fnv1a(1, 2), fnv1a(2, 1));
    }

    #[test]
    fn add_then_lookup_preserves_declaration_order() {
        let mut table = RoutingTable::new(8).unwrap();
        table.add(1, 10, &[5, 2, 9]).unwrap();
        assert_eq!(table.lookup(1, 10).unwrap(), &[5, 2, 9]);
        assert_eq!(table.entry_count(), 1);
    }

    #[test]
    fn missing_route_is_reported() {
        let table = RoutingTable::new(8).unwrap();
        assert_eq!(
            table.lookup(1, 10).unwrap_err(),
            RuntimeError::NoRoute { from_agent: 1, kind: 10 }
        );
    }

    #[test]
    fn re_adding_replaces_the_entry() {
        let mut table = RoutingTable::new(8).unwrap();
        table.add(1, 10, &[2]).unwrap();
        table.add(1, 10, &[3, 4]).unwrap();
        assert_eq!(table.lookup(1, 10).unwrap(), &[3, 4]);
        assert_eq!(table.entry_count(), 1);
    }

    #[test]
    fn empty_destination_list_is_rejected() {
        let mut table = RoutingTable::new(8).unwrap();
        assert!(table.add(1, 10, &[]).is_err());
    }

    #[test]
    fn linear_probing_survives_collisions() {
        let mut table = RoutingTable::new(4).unwrap();
        // Four distinct keys into four slots: every key must remain
        // retrievable whatever its home slot.
        table.add(1, 1, &[2]).unwrap();
        table.add(2, 1, &[3]).unwrap();
        table.add(3, 1, &[4]).unwrap();
        table.add(4, 1, &[1]).unwrap();

        assert_eq!(table.lookup(1, 1).unwrap(), &[2]);
        assert_eq!(table.lookup(2, 1).unwrap(), &[3]);
        assert_eq!(table.lookup(3, 1).unwrap(), &[4]);
        assert_eq!(table.lookup(4, 1).unwrap(), &[1]);

        assert_eq!(
            table.add(5, 1, &[1]).unwrap_err(),
            RuntimeError::TableFull { capacity: 4 }
        );
    }

    #[test]
    fn resolve_fills_and_is_idempotent() {
        let registry = network(&[1, 2, 3]);
        let mut table = RoutingTable::new(8).unwrap();
        table.add(1, 10, &[2, 3]).unwrap();

        table.resolve(&registry);
        table.resolve(&registry);

        // Cached handles deliver without consulting the registry.
        let sig = signal::create(10, 1, &[1]).unwrap();
        assert_eq!(table.broadcast(&sig, &registry), 2);
    }

    #[test]
    fn broadcast_delivers_once_per_destination() {
        let registry = network(&[1, 2, 3]);
        let mut table = RoutingTable::new(8).unwrap();
        table.add(1, 10, &[2, 3]).unwrap();

        let sig = signal::create(10, 1, &12345u32.to_le_bytes()).unwrap();
        let delivered = table.broadcast(&sig, &registry);
        assert_eq!(delivered, 2);
        assert!(sig.is_broadcast());
        // One reference per destination plus the creator's.
        assert_eq!(ref_count(&sig), 3);

        for id in [2u16, 3u16] {
            let mailbox = registry.mailbox(id).unwrap();
            assert_eq!(mailbox.len(), 1);
            let received = mailbox.dequeue().unwrap();
            assert_eq!(received.payload_as::<u32>().unwrap(), 12345);
        }
    }

    #[test]
    fn single_destination_is_not_flagged_broadcast() {
        let registry = network(&[1, 2]);
        let mut table = RoutingTable::new(8).unwrap();
        table.add(1, 10, &[2]).unwrap();

        let sig = signal::create(10, 1, &[]).unwrap();
        assert_eq!(table.broadcast(&sig, &registry), 1);
        assert!(!sig.is_broadcast());
    }

    #[test]
    fn broadcast_without_route_delivers_nothing() {
        let registry = network(&[1, 2]);
        let table = RoutingTable::new(8).unwrap();
        let sig = signal::create(10, 1, &[]).unwrap();
        assert_eq!(table.broadcast(&sig, &registry), 0);
        assert_eq!(ref_count(&sig), 1);
    }

    #[test]
    fn full_destination_counts_a_drop_not_an_error() {
        let registry = network(&[1, 2]);
        let mut table = RoutingTable::new(8).unwrap();
        table.add(1, 10, &[2]).unwrap();

        let mailbox = registry.mailbox(2).unwrap();
        for _ in 0..mailbox.capacity() {
            let sig = signal::create(10, 1, &[]).unwrap();
            assert_eq!(table.broadcast(&sig, &registry), 1);
        }

        let sig = signal::create(10, 1, &[]).unwrap();
        assert_eq!(table.broadcast(&sig, &registry), 0);
        assert_eq!(mailbox.dropped(), 1);
        assert!(mailbox.overflowed());
    }

    #[test]
    fn emit_releases_the_creator_reference() {
        let registry = network(&[1, 2]);
        let mut table = RoutingTable::new(8).unwrap();
        table.add(1, 10, &[2]).unwrap();

        let delivered = emit_signal(&table, &registry, 10, 1, &100u32.to_le_bytes()).unwrap();
        assert_eq!(delivered, 1);

        let mailbox = registry.mailbox(2).unwrap();
        let sig = mailbox.dequeue().unwrap();
        // Only the queued reference survived emission.
        assert_eq!(ref_count(&sig), 1);
        assert_eq!(sig.payload_as::<u32>().unwrap(), 100);
    }

    #[test]
    fn lookup_always_returns_declaration_order() {
        use proptest::prelude::*;
        proptest!(|(routes in proptest::collection::vec(
            (1u16..32, 1u16..8, proptest::collection::vec(1u16..64, 1..6)),
            1..24,
        ))| {
            let mut table = RoutingTable::new(64).unwrap();
            // Later declarations for the same key replace earlier
            // ones, so remember only the last.
            let mut expected: Vec<((AgentId, Kind), Vec<AgentId>)> = Vec::new();
            for (source, kind, dests) in &routes {
                table.add(*source, *kind, dests).unwrap();
                match expected.iter_mut().find(|(key, _)| *key == (*source, *kind)) {
                    Some((_, old)) => *old = dests.clone(),
                    None => expected.push(((*source, *kind), dests.clone())),
                }
            }
            for ((source, kind), dests) in &expected {
                prop_assert_eq!(table.lookup(*source, *kind).unwrap(), &dests[..]);
            }
            prop_assert_eq!(table.entry_count(), expected.len() as u32);
        });
    }

    #[test]
    fn emit_without_route_returns_zero_and_frees() {
        let registry = network(&[1]);
        let table = RoutingTable::new(8).unwrap();
        let before = heap::used();
        assert_eq!(emit_signal(&table, &registry, 10, 1, &[1, 2]).unwrap(), 0);
        assert_eq!(heap::used(), before);
    }
}
