//! Fan-out of decoded inbound messages to registered handlers.
//!
//! Handlers for one message type run in registration order on the receive
//! thread of the circuit the message arrived on. A handler that returns an
//! error or panics is logged and skipped; the remaining handlers still run.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::net::{Circuit, Message, MessageType};

pub type Handler = Arc<dyn Fn(&Message, &Arc<Circuit>) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Default)]
pub struct CallbackDispatcher {
    handlers: RwLock<HashMap<MessageType, Vec<(HandlerId, Handler)>>>,
    next_id: AtomicU64,
}

impl CallbackDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, kind: MessageType, handler: F) -> HandlerId
    where
        F: Fn(&Message, &Arc<Circuit>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    pub fn unregister(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let mut removed = false;
        handlers.retain(|_, list| {
            let before = list.len();
            list.retain(|(handler_id, _)| *handler_id != id);
            removed |= list.len() != before;
            !list.is_empty()
        });
        removed
    }

    pub fn handler_count(&self, kind: MessageType) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Runs every handler registered for the message's type. Returns how many
    /// completed without error.
    pub fn dispatch(&self, message: &Message, circuit: &Arc<Circuit>) -> usize {
        // Snapshot so handlers may register or unregister while running.
        let handlers: Vec<(HandlerId, Handler)> = match self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&message.kind)
        {
            Some(list) => list.clone(),
            None => {
                log::trace!("No handler for {} on {}", message, circuit);
                return 0;
            }
        };

        let mut succeeded = 0;
        for (id, handler) in handlers {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(message, circuit))) {
                Ok(Ok(())) => succeeded += 1,
                Ok(Err(e)) => {
                    log::warn!("Handler {:?} for {} failed: {:#}", id, message, e);
                }
                Err(payload) => {
                    log::warn!(
                        "Handler {:?} for {} panicked: {}",
                        id,
                        message,
                        panic_message(payload.as_ref())
                    );
                }
            }
        }
        succeeded
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}
