//! Tidal-cycle scheduler: REST → SENSE → ACT until quiescence.
//!
//! One logical worker drives the whole network. Each cycle walks the
//! agents in id order and lets every agent take exactly one signal
//! from its mailbox — fair rotation that bounds per-agent latency and
//! keeps a fast sender from starving its siblings. A dequeued signal
//! is dispatched through the agent's table (with the ambient network
//! context installed so handlers can emit), then the scheduler's
//! reference is released. The run loop terminates when
//! `max_empty_cycles` consecutive cycles process nothing — the
//! quiescence contract — or when shutdown is requested.

use crate::context::{self, NetworkContext};
use crate::registry::Registry;
use crate::routing::RoutingTable;
use crate::signal::clock;
use crate::topology::Network;
use crate::heap;
use std::cell::Cell;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

/// Phase of the tidal cycle, advertised for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TidalPhase {
    /// Idle bookkeeping between cycles.
    Rest,
    /// Reading from agent mailboxes.
    Sense,
    /// Running handlers, which may emit further signals.
    Act,
}

/// Scheduler tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Consecutive signal-free cycles before the run loop concludes
    /// the network is quiescent.
    pub max_empty_cycles: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_empty_cycles: 10,
        }
    }
}

/// Cooperative single-threaded scheduler over one network.
pub struct Scheduler {
    registry: Rc<Registry>,
    routing: Rc<RoutingTable>,
    config: SchedulerConfig,
    phase: Cell<TidalPhase>,
    running: Rc<Cell<bool>>,
    empty_cycles: Cell<u32>,
    cycle_count: Cell<u64>,
    signals_processed: Cell<u64>,
    agent_turns: Cell<u64>,
    dispatch_errors: Cell<u64>,
    started_at: Cell<u64>,
    ended_at: Cell<u64>,
}

impl Scheduler {
    pub fn new(network: &Network) -> Scheduler {
        Self::with_config(network, SchedulerConfig::default())
    }

    pub fn with_config(network: &Network, config: SchedulerConfig) -> Scheduler {
        Scheduler {
            registry: network.registry().clone(),
            routing: network.routing().clone(),
            config,
            phase: Cell::new(TidalPhase::Rest),
            running: Rc::new(Cell::new(true)),
            empty_cycles: Cell::new(0),
            cycle_count: Cell::new(0),
            signals_processed: Cell::new(0),
            agent_turns: Cell::new(0),
            dispatch_errors: Cell::new(0),
            started_at: Cell::new(0),
            ended_at: Cell::new(0),
        }
    }

    /// Run one tidal cycle. Returns the number of signals processed.
    pub fn run_cycle(&self) -> u32 {
        self.phase.set(TidalPhase::Rest);
        // REST is bookkeeping only; reserved for idle-time hooks.

        let mut processed = 0u32;
        for agent in self.registry.iter() {
            self.phase.set(TidalPhase::Sense);
            let Some(signal) = agent.mailbox().dequeue() else {
                continue;
            };

            self.phase.set(TidalPhase::Act);
            let guard = context::install(NetworkContext {
                routing: self.routing.clone(),
                registry: self.registry.clone(),
                running: self.running.clone(),
            });
            if let Err(err) = agent.dispatch().invoke(&signal) {
                self.dispatch_errors.set(self.dispatch_errors.get() + 1);
                tracing::debug!(agent = agent.id(), %err, "dispatch error");
            }
            drop(guard);

            agent.bump_signal_count();
            drop(signal);
            processed += 1;
        }

        self.cycle_count.set(self.cycle_count.get() + 1);
        self.signals_processed
            .set(self.signals_processed.get() + u64::from(processed));
        if processed > 0 {
            self.agent_turns
                .set(self.agent_turns.get() + u64::from(processed));
            self.empty_cycles.set(0);
        } else {
            self.empty_cycles.set(self.empty_cycles.get() + 1);
        }
        self.phase.set(TidalPhase::Rest);
        processed
    }

    /// Drive cycles until quiescence or shutdown. Returns the total
    /// number of signals processed over the scheduler's lifetime.
    pub fn run(&self) -> u64 {
        self.started_at.set(clock().raw());
        tracing::info!(agents = self.registry.len(), "scheduler running");

        while self.running.get() {
            self.run_cycle();
            if self.empty_cycles.get() >= self.config.max_empty_cycles {
                tracing::info!(
                    cycles = self.cycle_count.get(),
                    "network quiescent, stopping"
                );
                break;
            }
        }

        self.ended_at.set(clock().raw());
        self.signals_processed.get()
    }

    /// Run exactly `n` cycles regardless of quiescence; for tests and
    /// deterministic benchmarks.
    pub fn run_cycles(&self, n: u64) -> u64 {
        self.started_at.set(clock().raw());
        for _ in 0..n {
            self.run_cycle();
        }
        self.ended_at.set(clock().raw());
        self.signals_processed.get()
    }

    /// Stop the run loop after the current cycle.
    pub fn shutdown(&self) {
        self.running.set(false);
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    #[inline]
    pub fn phase(&self) -> TidalPhase {
        self.phase.get()
    }

    #[inline]
    pub fn cycle_count(&self) -> u64 {
        self.cycle_count.get()
    }

    #[inline]
    pub fn signals_processed(&self) -> u64 {
        self.signals_processed.get()
    }

    #[inline]
    pub fn dispatch_errors(&self) -> u64 {
        self.dispatch_errors.get()
    }

    #[inline]
    pub fn empty_cycles(&self) -> u32 {
        self.empty_cycles.get()
    }

    /// Snapshot of the scheduler counters and timing.
    pub fn stats(&self) -> SchedulerStats {
        let elapsed = if self.ended_at.get() > self.started_at.get() {
            clock().delta(self.started_at.get(), self.ended_at.get())
        } else {
            Duration::ZERO
        };
        let signals = self.signals_processed.get();
        let throughput = if elapsed.as_nanos() > 0 {
            ((signals as u128 * 1_000_000_000) / elapsed.as_nanos()) as u64
        } else {
            0
        };
        SchedulerStats {
            cycles: self.cycle_count.get(),
            signals_processed: signals,
            agent_turns: self.agent_turns.get(),
            dispatch_errors: self.dispatch_errors.get(),
            heap_used: heap::used(),
            elapsed,
            throughput,
        }
    }
}

/// Point-in-time scheduler statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStats {
    pub cycles: u64,
    pub signals_processed: u64,
    /// Agent turns that processed a signal, summed over all cycles.
    pub agent_turns: u64,
    pub dispatch_errors: u64,
    pub heap_used: usize,
    pub elapsed: Duration,
    /// Signals per second over the measured window.
    pub throughput: u64,
}

impl fmt::Display for SchedulerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "scheduler statistics")?;
        writeln!(f, "  cycles run:        {}", self.cycles)?;
        writeln!(f, "  signals processed: {}", self.signals_processed)?;
        writeln!(f, "  agent turns:       {}", self.agent_turns)?;
        writeln!(f, "  dispatch errors:   {}", self.dispatch_errors)?;
        writeln!(f, "  heap used:         {} bytes", self.heap_used)?;
        writeln!(f, "  elapsed:           {:?}", self.elapsed)?;
        write!(f, "  throughput:        ~{} signals/sec", self.throughput)
    }
}
