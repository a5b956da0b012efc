//! Static network construction from a topology descriptor.
//!
//! The descriptor is the contract between the wiring generator and
//! the runtime: an ordered list of agent specs and a list of socket
//! definitions. [`init`] is the one-shot constructor — it builds
//! every agent (state buffer, mailbox, dispatch table), declares
//! every socket as a route, resolves the mailbox caches, and returns
//! a fully wired [`Network`]. Any sub-failure unwinds everything
//! built so far; there is no partially constructed network.

use crate::dispatch::{self, AgentState, DispatchTable};
use crate::mailbox::{self, Mailbox};
use crate::registry::{Agent, Registry};
use crate::routing::{self, RoutingTable};
use crate::{AgentId, Kind, Result, RuntimeError};
use serde::{Deserialize, Serialize};
use std::rc::Rc;

/// Description of one agent to construct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSpec {
    /// 1-based agent id; doubles as the registry slot.
    pub id: AgentId,
    /// Optional debug name.
    #[serde(default)]
    pub name: Option<String>,
    /// Private state buffer size in bytes; zero means stateless.
    #[serde(default)]
    pub state_size: usize,
    /// Requested mailbox capacity; zero selects the default (256).
    #[serde(default)]
    pub mailbox_capacity: u32,
}

impl AgentSpec {
    pub fn new(id: AgentId) -> AgentSpec {
        AgentSpec {
            id,
            name: None,
            state_size: 0,
            mailbox_capacity: 0,
        }
    }

    pub fn named(id: AgentId, name: &str) -> AgentSpec {
        AgentSpec {
            id,
            name: Some(name.to_owned()),
            state_size: 0,
            mailbox_capacity: 0,
        }
    }

    pub fn with_state(mut self, state_size: usize) -> AgentSpec {
        self.state_size = state_size;
        self
    }

    pub fn with_mailbox_capacity(mut self, capacity: u32) -> AgentSpec {
        self.mailbox_capacity = capacity;
        self
    }
}

/// One declared connection: signals of `kind` emitted by `source`
/// are delivered to `dest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketDef {
    pub source: AgentId,
    pub kind: Kind,
    pub dest: AgentId,
}

impl SocketDef {
    pub fn new(source: AgentId, kind: Kind, dest: AgentId) -> SocketDef {
        SocketDef { source, kind, dest }
    }
}

/// Complete static description of a network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkTopology {
    #[serde(default)]
    pub name: String,
    pub agents: Vec<AgentSpec>,
    #[serde(default)]
    pub sockets: Vec<SocketDef>,
}

/// A fully constructed network: the agent registry plus its resolved
/// routing table. Dropping the network tears everything down.
#[derive(Debug)]
pub struct Network {
    registry: Rc<Registry>,
    routing: Rc<RoutingTable>,
}

impl Network {
    #[inline]
    pub fn registry(&self) -> &Rc<Registry> {
        &self.registry
    }

    #[inline]
    pub fn routing(&self) -> &Rc<RoutingTable> {
        &self.routing
    }

    /// Emit a signal into the network from `origin`.
    pub fn emit(&self, kind: Kind, origin: AgentId, payload: &[u8]) -> Result<u32> {
        routing::emit_signal(&self.routing, &self.registry, kind, origin, payload)
    }

    /// Tear the network down, releasing every agent's dispatch table,
    /// mailbox (and the signal references it still holds), state
    /// buffer, and the routing table.
    pub fn shutdown(self) {
        tracing::info!("network shutdown");
        // Dropping the fields performs the teardown.
    }
}

/// Build a network from its descriptor.
///
/// Fails with [`RuntimeError::AgentExists`] on duplicate ids,
/// [`RuntimeError::AgentNotFound`] when a socket names an unknown
/// endpoint, and propagates allocation failures. On any error the
/// partially built network is fully unwound.
pub fn init(topology: &NetworkTopology) -> Result<Network> {
    if topology.agents.is_empty() {
        return Err(RuntimeError::AgentNotFound(0));
    }

    let capacity = topology
        .agents
        .iter()
        .map(|spec| u32::from(spec.id))
        .max()
        .unwrap_or(0);
    let mut registry = Registry::new(capacity);

    for spec in &topology.agents {
        let agent = build_agent(spec)?;
        registry.register(agent)?;
    }

    let mut routing = RoutingTable::new(routing_capacity(topology.sockets.len()))?;
    for (source, kind, dests) in group_sockets(&registry, &topology.sockets)? {
        routing.add(source, kind, &dests)?;
    }

    let registry = Rc::new(registry);
    let routing = Rc::new(routing);
    routing.resolve(&registry);

    tracing::info!(
        name = %topology.name,
        agents = registry.len(),
        routes = routing.entry_count(),
        "network initialized"
    );

    Ok(Network { registry, routing })
}

/// Preferred alias matching the teardown name.
pub fn shutdown(network: Network) {
    network.shutdown();
}

fn build_agent(spec: &AgentSpec) -> Result<Agent> {
    let state = if spec.state_size > 0 {
        Some(AgentState::new(spec.state_size)?)
    } else {
        None
    };

    let capacity = if spec.mailbox_capacity == 0 {
        mailbox::DEFAULT_CAPACITY
    } else {
        spec.mailbox_capacity
    };
    let mailbox = Mailbox::new(capacity)?;

    let dispatch = DispatchTable::new(dispatch::DEFAULT_CAPACITY, spec.id)?;
    if let Some(state) = &state {
        dispatch.set_state(state.clone());
    }

    Ok(Agent::new(
        spec.id,
        spec.name.clone(),
        state,
        mailbox,
        dispatch,
    ))
}

/// Group sockets by `(source, kind)` preserving declaration order,
/// validating both endpoints and deduplicating repeated destinations.
fn group_sockets(
    registry: &Registry,
    sockets: &[SocketDef],
) -> Result<Vec<(AgentId, Kind, Vec<AgentId>)>> {
    let mut groups: Vec<(AgentId, Kind, Vec<AgentId>)> = Vec::new();
    for socket in sockets {
        if registry.get(socket.source).is_none() {
            return Err(RuntimeError::AgentNotFound(socket.source));
        }
        if registry.get(socket.dest).is_none() {
            return Err(RuntimeError::AgentNotFound(socket.dest));
        }

        match groups
            .iter_mut()
            .find(|(source, kind, _)| *source == socket.source && *kind == socket.kind)
        {
            Some((_, _, dests)) => {
                if !dests.contains(&socket.dest) {
                    dests.push(socket.dest);
                }
            }
            None => groups.push((socket.source, socket.kind, vec![socket.dest])),
        }
    }
    Ok(groups)
}

fn routing_capacity(socket_count: usize) -> u32 {
    ((socket_count * 2).max(8)) as u32
}
