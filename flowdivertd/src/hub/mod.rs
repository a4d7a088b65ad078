//! # In-process provider hub
//!
//! Connects in-process providers to the engine over bounded crossbeam
//! channels.
//!
//! ```text
//!             ControlChannel::send (try_send)
//!   Engine  ──────────────────────────────▶  link[unit]  ──▶  ProviderHandle
//!     ▲                                                          │
//!     │ handle_message / on_drained / detach_provider            │ send / drop
//!     └──────────── dispatcher thread ◀──── HubEvent queue ◀─────┘
//! ```
//!
//! A full link is reported to the engine as [`ChannelError::WouldBlock`]
//! and the link is marked blocked. The provider's next read clears the mark
//! and queues [`HubEvent::Drained`], which the dispatcher turns into
//! [`Engine::on_drained`].

mod dispatcher;
mod provider;

#[cfg(test)]
mod tests;

pub use dispatcher::{spawn_dispatcher, DispatcherHandle};
pub use provider::ProviderHandle;

use crate::channel_config::ChannelConfig;
use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use flowdivert::{ChannelError, ControlChannel, ControlUnit, Engine, GroupOwner};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Provider-side failures.
#[derive(Error, Debug)]
pub enum HubError {
    /// The dispatcher has stopped; nothing will read this message.
    #[error("hub is shut down")]
    Closed,

    #[error("wire error: {0}")]
    Wire(#[from] flowdivert_wire::Error),
}

/// Work for the dispatcher thread.
#[derive(Debug)]
pub enum HubEvent {
    /// A framed message from the provider on `unit`.
    Inbound { unit: ControlUnit, raw: Bytes },
    /// The provider on `unit` read from a link the engine found full.
    Drained(ControlUnit),
    /// The provider on `unit` went away.
    Detached(ControlUnit),
    Shutdown,
}

/// Engine → provider half of one attachment.
pub(crate) struct Link {
    tx: Sender<Bytes>,
    blocked: AtomicBool,
}

impl Link {
    /// Called by the provider after each successful read.
    pub(crate) fn note_read(&self) -> bool {
        self.blocked.swap(false, Ordering::AcqRel)
    }
}

/// Registry of provider links; the engine's [`ControlChannel`].
pub struct Hub {
    links: RwLock<HashMap<ControlUnit, Arc<Link>>>,
    events: Sender<HubEvent>,
    link_capacity: usize,
}

impl Hub {
    /// Create a hub and the receiving end of its dispatcher queue.
    pub fn new(config: &ChannelConfig) -> (Arc<Self>, Receiver<HubEvent>) {
        let (events, events_rx) = crossbeam_channel::bounded(config.dispatcher_capacity);
        let hub = Arc::new(Self {
            links: RwLock::new(HashMap::new()),
            events,
            link_capacity: config.provider_link_capacity,
        });
        (hub, events_rx)
    }

    /// Register a provider with the engine and open its link.
    pub fn attach(&self, engine: &Engine, owner: GroupOwner) -> flowdivert::Result<ProviderHandle> {
        let unit = engine.attach_provider(owner)?;
        let (tx, rx) = crossbeam_channel::bounded(self.link_capacity);
        let link = Arc::new(Link {
            tx,
            blocked: AtomicBool::new(false),
        });
        self.links.write().insert(unit, Arc::clone(&link));
        info!(%unit, ?owner, capacity = self.link_capacity, "provider attached to hub");
        Ok(ProviderHandle::new(unit, rx, link, self.events.clone()))
    }

    /// Close the link for `unit`. Later sends to it report `Disconnected`.
    pub fn unregister(&self, unit: ControlUnit) -> bool {
        let removed = self.links.write().remove(&unit).is_some();
        if removed {
            debug!(%unit, "provider link closed");
        }
        removed
    }

    pub fn provider_count(&self) -> usize {
        self.links.read().len()
    }

    /// Ask the dispatcher to stop once it reaches this point in its queue.
    pub fn request_shutdown(&self) {
        let _ = self.events.send(HubEvent::Shutdown);
    }
}

impl ControlChannel for Hub {
    fn send(&self, unit: ControlUnit, message: Bytes) -> Result<(), ChannelError> {
        let link = self
            .links
            .read()
            .get(&unit)
            .cloned()
            .ok_or(ChannelError::Disconnected(unit))?;

        match link.tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Disconnected(_)) => Err(ChannelError::Disconnected(unit)),
            Err(TrySendError::Full(message)) => {
                link.blocked.store(true, Ordering::Release);
                // Any read after this store reports the drain.
                match link.tx.try_send(message) {
                    Ok(()) => Ok(()),
                    Err(TrySendError::Full(_)) => Err(ChannelError::WouldBlock),
                    Err(TrySendError::Disconnected(_)) => Err(ChannelError::Disconnected(unit)),
                }
            }
        }
    }
}
