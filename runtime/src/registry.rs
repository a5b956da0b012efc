//! Agent records and the registries describing a static network.
//!
//! The agent registry is a 1-indexed slot array: agent ids are
//! assigned by the wiring generator and double as slot positions, so
//! by-id lookup is constant time. By-name lookup walks the slots —
//! registries hold tens of agents, not thousands. The frequency
//! registry is an advisory side table mapping kind ids to names and
//! expected payload sizes for debugging and reflection.

use crate::dispatch::{AgentState, DispatchTable};
use crate::mailbox::Mailbox;
use crate::{AgentId, Kind, Result, RuntimeError};
use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

/// Registry capacity used when none is requested.
pub const DEFAULT_CAPACITY: u32 = 64;

/// Agent flag bits.
pub const FLAG_ACTIVE: u16 = 0x0001;
pub const FLAG_INITIALIZED: u16 = 0x0002;
pub const FLAG_HAS_HANDLERS: u16 = 0x0004;

/// One agent of the network: private state, inbound mailbox, and
/// dispatch table. Immutable after registration except for counters
/// and the state buffer (which only its own handlers mutate).
pub struct Agent {
    id: AgentId,
    name: Option<String>,
    state: Option<Rc<AgentState>>,
    mailbox: Rc<Mailbox>,
    dispatch: Rc<DispatchTable>,
    flags: u16,
    signal_count: Cell<u64>,
}

impl Agent {
    pub fn new(
        id: AgentId,
        name: Option<String>,
        state: Option<Rc<AgentState>>,
        mailbox: Rc<Mailbox>,
        dispatch: Rc<DispatchTable>,
    ) -> Agent {
        let mut flags = FLAG_ACTIVE;
        if state.is_some() {
            flags |= FLAG_INITIALIZED;
        }
        if !dispatch.is_empty() {
            flags |= FLAG_HAS_HANDLERS;
        }
        mailbox.set_owner(id);
        Agent {
            id,
            name,
            state,
            mailbox,
            dispatch,
            flags,
            signal_count: Cell::new(0),
        }
    }

    #[inline]
    pub fn id(&self) -> AgentId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    #[inline]
    pub fn state(&self) -> Option<&Rc<AgentState>> {
        self.state.as_ref()
    }

    #[inline]
    pub fn mailbox(&self) -> &Rc<Mailbox> {
        &self.mailbox
    }

    #[inline]
    pub fn dispatch(&self) -> &Rc<DispatchTable> {
        &self.dispatch
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.flags & FLAG_ACTIVE != 0
    }

    /// Signals this agent has processed.
    #[inline]
    pub fn signal_count(&self) -> u64 {
        self.signal_count.get()
    }

    pub(crate) fn bump_signal_count(&self) {
        self.signal_count.set(self.signal_count.get() + 1);
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("queued", &self.mailbox.len())
            .field("processed", &self.signal_count.get())
            .finish()
    }
}

/// Slot array of agents describing the static topology.
#[derive(Debug)]
pub struct Registry {
    slots: Vec<Option<Agent>>,
    capacity: u32,
    /// Highest registered agent id.
    high_water: u32,
}

impl Registry {
    pub fn new(capacity: u32) -> Registry {
        let capacity = if capacity == 0 { DEFAULT_CAPACITY } else { capacity };
        Registry {
            slots: (0..capacity).map(|_| None).collect(),
            capacity,
            high_water: 0,
        }
    }

    /// Install an agent in its id slot.
    pub fn register(&mut self, agent: Agent) -> Result<()> {
        let id = agent.id();
        if id == 0 || u32::from(id) > self.capacity {
            return Err(RuntimeError::CapacityExceeded {
                id,
                capacity: self.capacity,
            });
        }
        let slot = &mut self.slots[usize::from(id) - 1];
        if slot.is_some() {
            return Err(RuntimeError::AgentExists(id));
        }
        tracing::debug!(agent = id, name = agent.name(), "agent registered");
        *slot = Some(agent);
        self.high_water = self.high_water.max(u32::from(id));
        Ok(())
    }

    /// Agent by id, if live.
    pub fn get(&self, id: AgentId) -> Option<&Agent> {
        if id == 0 || u32::from(id) > self.capacity {
            return None;
        }
        self.slots[usize::from(id) - 1].as_ref()
    }

    /// Agent by name; linear scan in id order.
    pub fn get_by_name(&self, name: &str) -> Option<&Agent> {
        self.iter().find(|agent| agent.name() == Some(name))
    }

    /// Mailbox handle of the agent with `id`.
    pub fn mailbox(&self, id: AgentId) -> Option<Rc<Mailbox>> {
        self.get(id).map(|agent| agent.mailbox().clone())
    }

    /// Dispatch table handle of the agent with `id`.
    pub fn dispatch(&self, id: AgentId) -> Option<Rc<DispatchTable>> {
        self.get(id).map(|agent| agent.dispatch().clone())
    }

    /// Live agents in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Agent> {
        self.slots.iter().filter_map(|slot| slot.as_ref())
    }

    /// Number of live agents.
    pub fn len(&self) -> u32 {
        self.slots.iter().filter(|slot| slot.is_some()).count() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Highest registered agent id.
    #[inline]
    pub fn high_water(&self) -> u32 {
        self.high_water
    }
}

impl fmt::Display for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "registry: {} agents (capacity {})",
            self.len(),
            self.capacity
        )?;
        for agent in self.iter() {
            writeln!(
                f,
                "  agent {}: name={} state={}B queued={} processed={}",
                agent.id(),
                agent.name().unwrap_or("-"),
                agent.state().map(|s| s.len()).unwrap_or(0),
                agent.mailbox().len(),
                agent.signal_count(),
            )?;
        }
        Ok(())
    }
}

/// Advisory description of one frequency class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrequencyInfo {
    pub kind: Kind,
    pub name: String,
    pub payload_size: u32,
}

/// Side table mapping kind ids to names and expected payload sizes.
/// Purely advisory: the runtime never interprets payloads.
#[derive(Default)]
pub struct FrequencyRegistry {
    entries: Vec<Option<FrequencyInfo>>,
    by_name: hashbrown::HashMap<String, Kind>,
}

impl FrequencyRegistry {
    pub fn new(capacity: u32) -> FrequencyRegistry {
        let capacity = if capacity == 0 { DEFAULT_CAPACITY } else { capacity };
        FrequencyRegistry {
            entries: (0..capacity).map(|_| None).collect(),
            by_name: hashbrown::HashMap::new(),
        }
    }

    pub fn register(&mut self, kind: Kind, name: &str, payload_size: u32) -> Result<()> {
        if kind == 0 || usize::from(kind) > self.entries.len() {
            return Err(RuntimeError::CapacityExceeded {
                id: kind,
                capacity: self.entries.len() as u32,
            });
        }
        let slot = &mut self.entries[usize::from(kind) - 1];
        if let Some(old) = slot.take() {
            self.by_name.remove(&old.name);
        }
        self.by_name.insert(name.to_owned(), kind);
        *slot = Some(FrequencyInfo {
            kind,
            name: name.to_owned(),
            payload_size,
        });
        Ok(())
    }

    pub fn get(&self, kind: Kind) -> Option<&FrequencyInfo> {
        if kind == 0 || usize::from(kind) > self.entries.len() {
            return None;
        }
        self.entries[usize::from(kind) - 1].as_ref()
    }

    pub fn get_by_name(&self, name: &str) -> Option<&FrequencyInfo> {
        self.by_name.get(name).and_then(|kind| self.get(*kind))
    }

    pub fn len(&self) -> u32 {
        self.entries.iter().filter(|slot| slot.is_some()).count() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_agent(id: AgentId, name: Option<&str>) -> Agent {
        Agent::new(
            id,
            name.map(str::to_owned),
            None,
            Mailbox::new(4).unwrap(),
            DispatchTable::new(4, id).unwrap(),
        )
    }

    #[test]
    fn register_and_lookup_by_id() {
        let mut registry = Registry::new(8);
        registry.register(test_agent(1, Some("sensor"))).unwrap();
        registry.register(test_agent(3, None)).unwrap();

        assert_eq!(registry.get(1).unwrap().name(), Some("sensor"));
        assert!(registry.get(2).is_none());
        assert_eq!(registry.get(3).unwrap().id(), 3);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.high_water(), 3);
    }

    #[test]
    fn mailbox_owner_is_stamped_on_registration() {
        let registry = {
            let mut r = Registry::new(4);
            r.register(test_agent(2, None)).unwrap();
            r
        };
        assert_eq!(registry.get(2).unwrap().mailbox().owner(), 2);
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let mut registry = Registry::new(8);
        registry.register(test_agent(1, None)).unwrap();
        assert_eq!(
            registry.register(test_agent(1, None)).unwrap_err(),
            RuntimeError::AgentExists(1)
        );
    }

    #[test]
    fn out_of_range_ids_are_rejected() {
        let mut registry = Registry::new(4);
        assert_eq!(
            registry.register(test_agent(0, None)).unwrap_err(),
            RuntimeError::CapacityExceeded { id: 0, capacity: 4 }
        );
        assert_eq!(
            registry.register(test_agent(5, None)).unwrap_err(),
            RuntimeError::CapacityExceeded { id: 5, capacity: 4 }
        );
    }

    #[test]
    fn lookup_by_name_is_linear_over_live_agents() {
        let mut registry = Registry::new(8);
        registry.register(test_agent(2, Some("hub"))).unwrap();
        registry.register(test_agent(5, Some("leaf"))).unwrap();

        assert_eq!(registry.get_by_name("leaf").unwrap().id(), 5);
        assert!(registry.get_by_name("missing").is_none());
    }

    #[test]
    fn iteration_is_in_id_order() {
        let mut registry = Registry::new(8);
        registry.register(test_agent(7, None)).unwrap();
        registry.register(test_agent(2, None)).unwrap();
        registry.register(test_agent(4, None)).unwrap();

        let ids: Vec<_> = registry.iter().map(Agent::id).collect();
        assert_eq!(ids, vec![2, 4, 7]);
    }

    #[test]
    fn display_summarizes_agents() {
        let mut registry = Registry::new(4);
        registry.register(test_agent(1, Some("sink"))).unwrap();
        let text = registry.to_string();
        assert!(text.contains("1 agents"));
        assert!(text.contains("name=sink"));
    }

    #[test]
    fn frequency_registry_round_trip() {
        let mut freqs = FrequencyRegistry::new(16);
        freqs.register(3, "heartbeat", 4).unwrap();
        freqs.register(9, "telemetry", 32).unwrap();

        assert_eq!(freqs.get(3).unwrap().name, "heartbeat");
        assert_eq!(freqs.get_by_name("telemetry").unwrap().kind, 9);
        assert!(freqs.get(4).is_none());
        assert_eq!(freqs.len(), 2);
    }

    #[test]
    fn frequency_reregistration_replaces_name_index() {
        let mut freqs = FrequencyRegistry::new(16);
        freqs.register(3, "ping", 4).unwrap();
        freqs.register(3, "pulse", 8).unwrap();

        assert!(freqs.get_by_name("ping").is_none());
        assert_eq!(freqs.get_by_name("pulse").unwrap().payload_size, 8);
        assert_eq!(freqs.len(), 1);
    }

    #[test]
    fn frequency_zero_and_overflow_rejected() {
        let mut freqs = FrequencyRegistry::new(4);
        assert!(freqs.register(0, "bad", 0).is_err());
        assert!(freqs.register(5, "bad", 0).is_err());
    }
}
