use super::{HubError, HubEvent, Link};
use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use flowdivert::ControlUnit;
use flowdivert_wire::{FlowId, Frame, Message};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// A provider's end of its hub attachment.
///
/// Reads engine messages from the provider's link and sends provider
/// messages to the dispatcher. Dropping the handle detaches the provider:
/// the engine resets every flow still in its group.
pub struct ProviderHandle {
    unit: ControlUnit,
    rx: Receiver<Bytes>,
    link: Arc<Link>,
    events: Sender<HubEvent>,
}

impl ProviderHandle {
    pub(super) fn new(
        unit: ControlUnit,
        rx: Receiver<Bytes>,
        link: Arc<Link>,
        events: Sender<HubEvent>,
    ) -> Self {
        Self {
            unit,
            rx,
            link,
            events,
        }
    }

    /// The control unit the engine assigned to this provider.
    pub fn unit(&self) -> ControlUnit {
        self.unit
    }

    /// Send one framed message to the engine.
    ///
    /// Blocks while the dispatcher queue is full.
    pub fn send(&self, raw: Bytes) -> Result<(), HubError> {
        self.events
            .send(HubEvent::Inbound {
                unit: self.unit,
                raw,
            })
            .map_err(|_| HubError::Closed)
    }

    /// Encode `message` for `flow_id` and send it.
    pub fn send_message(&self, flow_id: FlowId, message: &Message) -> Result<(), HubError> {
        let raw = message.encode(flow_id)?;
        self.send(raw)
    }

    /// Block until the engine sends something. `None` once the link is
    /// closed and empty.
    pub fn recv(&self) -> Option<Bytes> {
        let raw = self.rx.recv().ok()?;
        self.after_read();
        Some(raw)
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<Bytes> {
        match self.rx.recv_timeout(timeout) {
            Ok(raw) => {
                self.after_read();
                Some(raw)
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_recv(&self) -> Option<Bytes> {
        match self.rx.try_recv() {
            Ok(raw) => {
                self.after_read();
                Some(raw)
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Receive and parse the next message, waiting at most `timeout`.
    pub fn recv_frame(&self, timeout: Duration) -> Option<Result<Frame, HubError>> {
        self.recv_timeout(timeout)
            .map(|raw| Frame::parse(raw).map_err(HubError::from))
    }

    /// Messages waiting on the link.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    fn after_read(&self) {
        if self.link.note_read() {
            trace!(unit = %self.unit, "link drained");
            let _ = self.events.send(HubEvent::Drained(self.unit));
        }
    }
}

impl Drop for ProviderHandle {
    fn drop(&mut self) {
        debug!(unit = %self.unit, "provider handle dropped, detaching");
        let _ = self.events.send(HubEvent::Detached(self.unit));
    }
}
