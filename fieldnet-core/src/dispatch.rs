//! Message-type to handler dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::header::MsgType;
use crate::packet::Packet;
use crate::registry::Connection;

type Handler<C> = Box<dyn Fn(&Packet, &Arc<Connection>, &C) -> anyhow::Result<()> + Send + Sync>;

/// Handler table keyed by message type. Built once at startup, then shared
/// immutably by every connection task.
pub struct Dispatcher<C> {
    handlers: HashMap<MsgType, Handler<C>>,
}

impl<C> Dispatcher<C> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, msg_type: MsgType, handler: F)
    where
        F: Fn(&Packet, &Arc<Connection>, &C) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers.insert(msg_type, Box::new(handler));
    }

    pub fn has_handler(&self, msg_type: MsgType) -> bool {
        self.handlers.contains_key(&msg_type)
    }

    /// Invoke the handler for the packet's type. A missing handler is not an
    /// error (types we receive but do not serve are logged and skipped); a
    /// failing handler is logged and swallowed so one bad message never
    /// terminates the connection loop.
    pub fn dispatch(&self, packet: &Packet, conn: &Arc<Connection>, ctx: &C) {
        let msg_type = packet.header().msg_type();
        let Some(handler) = self.handlers.get(&msg_type) else {
            debug!(?msg_type, source = %packet.header().source(), "no handler registered, ignoring");
            return;
        };
        if let Err(e) = handler(packet, conn, ctx) {
            warn!(?msg_type, source = %packet.header().source(), error = %e, "handler failed");
        }
    }
}

impl<C> Default for Dispatcher<C> {
    fn default() -> Self {
        Self::new()
    }
}
