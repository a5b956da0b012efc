//! Signal runtime for the Hyphal agent language.
//!
//! Hosts a static network of agents, each owning private state and a
//! bounded inbound mailbox. Agents communicate exclusively by emitting
//! typed signals along declared sockets; a cooperative tidal-cycle
//! scheduler pumps the network through REST → SENSE → ACT phases until
//! quiescence.
//!
//! # Architecture
//! - Budgeted region heap backing every dynamic runtime object
//! - Reference-counted signal envelopes shared across destinations
//! - Power-of-two ring mailboxes with reject-newest overflow
//! - FNV-1a open-addressed routing with cached mailbox handles
//! - Linear per-agent dispatch tables with optional guards
//! - Single-threaded cooperative scheduler with a quiescence contract
//!
//! # Example
//! ```no_run
//! use runtime::prelude::*;
//!
//! fn on_pulse(_state: &mut [u8], signal: &Signal) -> i32 {
//!     println!("pulse from agent {}", signal.origin());
//!     0
//! }
//!
//! let topology = NetworkTopology {
//!     name: "pair".into(),
//!     agents: vec![AgentSpec::new(1), AgentSpec::new(2)],
//!     sockets: vec![SocketDef::new(1, 7, 2)],
//! };
//! let network = topology::init(&topology).unwrap();
//! network.registry().get(2).unwrap().dispatch().register(7, on_pulse, None).unwrap();
//! network.emit(7, 1, &42u32.to_le_bytes()).unwrap();
//!
//! let scheduler = Scheduler::new(&network);
//! scheduler.run();
//! ```

pub mod context;
pub mod dispatch;
pub mod heap;
pub mod mailbox;
pub mod registry;
pub mod routing;
pub mod scheduler;
pub mod signal;
pub mod topology;

pub mod prelude {
    pub use crate::context;
    pub use crate::dispatch::{AgentState, DispatchTable, Guard, Handler};
    pub use crate::heap;
    pub use crate::mailbox::Mailbox;
    pub use crate::registry::{Agent, FrequencyRegistry, Registry};
    pub use crate::routing::{emit_signal, RoutingTable};
    pub use crate::scheduler::{Scheduler, SchedulerConfig, SchedulerStats, TidalPhase};
    pub use crate::signal::{Signal, SignalRef};
    pub use crate::topology::{self, AgentSpec, Network, NetworkTopology, SocketDef};
    pub use crate::{AgentId, Kind, Result, RuntimeError};
}

// Re-exports
pub use dispatch::{AgentState, DispatchTable};
pub use mailbox::Mailbox;
pub use registry::Registry;
pub use routing::{emit_signal, RoutingTable};
pub use scheduler::Scheduler;
pub use signal::{Signal, SignalRef};
pub use topology::{Network, NetworkTopology};

/// Identifier of a signal frequency class.
pub type Kind = u16;

/// Identifier of an agent; ids are 1-based, 0 is reserved.
pub type AgentId = u16;

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Unified error type for runtime operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    #[error("mailbox full: {count}/{capacity}")]
    QueueFull { count: u32, capacity: u32 },

    #[error("mailbox empty")]
    QueueEmpty,

    #[error("heap exhausted: requested {requested} bytes, {free} free")]
    AllocFailed { requested: usize, free: usize },

    #[error("payload too large: {size} bytes (limit {limit})")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("no route for signal {kind} from agent {from_agent}")]
    NoRoute { from_agent: AgentId, kind: Kind },

    #[error("no handler for signal {kind}")]
    NoHandler { kind: Kind },

    #[error("guard rejected signal {kind}")]
    GuardRejected { kind: Kind },

    #[error("handler for signal {kind} returned status {status}")]
    HandlerFailed { kind: Kind, status: i32 },

    #[error("agent {0} not found")]
    AgentNotFound(AgentId),

    #[error("agent {0} already registered")]
    AgentExists(AgentId),

    #[error("agent id {id} outside registry capacity {capacity}")]
    CapacityExceeded { id: AgentId, capacity: u32 },

    #[error("table full: {capacity} entries")]
    TableFull { capacity: u32 },
}

/// Round `x` up to the next power of two, with a floor of 1.
pub(crate) fn next_power_of_two(x: u32) -> u32 {
    x.max(1).next_power_of_two()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_carry_numbers() {
        let err = RuntimeError::QueueFull {
            count: 16,
            capacity: 16,
        };
        assert_eq!(err.to_string(), "mailbox full: 16/16");

        let err = RuntimeError::NoRoute { from_agent: 3, kind: 9 };
        assert_eq!(err.to_string(), "no route for signal 9 from agent 3");
    }

    #[test]
    fn power_of_two_rounding() {
        assert_eq!(next_power_of_two(0), 1);
        assert_eq!(next_power_of_two(1), 1);
        assert_eq!(next_power_of_two(3), 4);
        assert_eq!(next_power_of_two(256), 256);
        assert_eq!(next_power_of_two(1000), 1024);
    }
}
