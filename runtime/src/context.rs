//! Ambient network context for handler code.
//!
//! Handlers are plain function pointers: they receive their agent's
//! state and the signal, nothing else. To let them emit further
//! signals and request shutdown, the scheduler installs the active
//! network (routing table, registry, running flag) in a thread-local
//! slot around every handler invocation. Outside an invocation the
//! operations fail soft: [`emit`] delivers to nobody and
//! [`request_shutdown`] is a no-op.

use crate::registry::Registry;
use crate::routing::{self, RoutingTable};
use crate::{AgentId, Kind, Result};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

#[derive(Clone)]
pub(crate) struct NetworkContext {
    pub(crate) routing: Rc<RoutingTable>,
    pub(crate) registry: Rc<Registry>,
    pub(crate) running: Rc<Cell<bool>>,
}

thread_local! {
    static CURRENT: RefCell<Option<NetworkContext>> = const { RefCell::new(None) };
}

/// Installs `ctx` for the current thread; restores the previous
/// context when dropped.
pub(crate) struct ContextGuard {
    previous: Option<NetworkContext>,
}

pub(crate) fn install(ctx: NetworkContext) -> ContextGuard {
    let previous = CURRENT.with(|current| current.borrow_mut().replace(ctx));
    ContextGuard { previous }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        CURRENT.with(|current| {
            *current.borrow_mut() = self.previous.take();
        });
    }
}

/// True while a handler invocation (or other installed scope) is
/// active on this thread.
pub fn in_cycle() -> bool {
    CURRENT.with(|current| current.borrow().is_some())
}

/// Emit a signal through the active network.
///
/// Same contract as [`routing::emit_signal`]; with no active network
/// the emission has no route and delivers to nobody.
pub fn emit(kind: Kind, origin: AgentId, payload: &[u8]) -> Result<u32> {
    let ctx = CURRENT.with(|current| current.borrow().clone());
    match ctx {
        Some(ctx) => routing::emit_signal(&ctx.routing, &ctx.registry, kind, origin, payload),
        None => Ok(0),
    }
}

/// Ask the running scheduler to stop after the current cycle. No-op
/// outside a cycle.
pub fn request_shutdown() {
    CURRENT.with(|current| {
        if let Some(ctx) = current.borrow().as_ref() {
            ctx.running.set(false);
        }
    });
}
