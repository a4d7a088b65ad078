//! Per-group backpressure.
//!
//! When the channel reports `WouldBlock` the group is marked blocked.
//! From then on every control message queues behind the same FIFO until
//! [`ProviderGroup::flush`] empties it, so nothing issued later overtakes
//! anything issued earlier. Data messages are never queued here: a blocked
//! group refuses them and they stay in their flow's send buffer, to be
//! re-drained once the queue has flushed.
//!
//! Channel sends happen with the group's write lock held. That is what
//! keeps concurrent senders from interleaving out of order.

use super::ProviderGroup;
use crate::channel::{ChannelError, ControlChannel};
use bytes::Bytes;
use tracing::{debug, trace};

/// Outcome of offering a data message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSend {
    Sent,
    /// Not sent; the group is blocked. Keep the data and retry on drain.
    Blocked,
}

impl ProviderGroup {
    /// Send a control message, queueing it if the channel is blocked.
    ///
    /// Returns `Ok(true)` if this call moved the group into the blocked
    /// state.
    pub fn send_control(
        &self,
        channel: &dyn ControlChannel,
        message: Bytes,
    ) -> Result<bool, ChannelError> {
        let mut inner = self.inner.write();
        if inner.blocked {
            inner.send_queue.push_back(message);
            trace!(unit = %self.unit, queued = inner.send_queue.len(), "control message queued");
            return Ok(false);
        }
        match channel.send(self.unit, message.clone()) {
            Ok(()) => Ok(false),
            Err(ChannelError::WouldBlock) => {
                inner.blocked = true;
                inner.send_queue.push_back(message);
                debug!(unit = %self.unit, "control channel blocked");
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    /// Send a data message unless the group is blocked.
    pub fn send_data(
        &self,
        channel: &dyn ControlChannel,
        message: Bytes,
    ) -> Result<DataSend, ChannelError> {
        let mut inner = self.inner.write();
        if inner.blocked {
            return Ok(DataSend::Blocked);
        }
        match channel.send(self.unit, message) {
            Ok(()) => Ok(DataSend::Sent),
            Err(ChannelError::WouldBlock) => {
                inner.blocked = true;
                debug!(unit = %self.unit, "control channel blocked on data");
                Ok(DataSend::Blocked)
            }
            Err(e) => Err(e),
        }
    }

    /// Retry queued messages in order.
    ///
    /// Returns `Ok(true)` once the queue is empty and the group unblocked,
    /// `Ok(false)` if the channel blocked again part-way.
    pub fn flush(&self, channel: &dyn ControlChannel) -> Result<bool, ChannelError> {
        let mut inner = self.inner.write();
        while let Some(front) = inner.send_queue.front() {
            match channel.send(self.unit, front.clone()) {
                Ok(()) => {
                    inner.send_queue.pop_front();
                }
                Err(ChannelError::WouldBlock) => {
                    inner.blocked = true;
                    return Ok(false);
                }
                Err(e) => return Err(e),
            }
        }
        inner.blocked = false;
        Ok(true)
    }

    pub fn is_blocked(&self) -> bool {
        self.inner.read().blocked
    }

    pub fn queued(&self) -> usize {
        self.inner.read().send_queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ControlUnit, GroupOwner};
    use crate::testing::RecordingChannel;

    #[test]
    fn test_queue_flushes_in_order() {
        let channel = RecordingChannel::new();
        let group = ProviderGroup::new(ControlUnit(2), GroupOwner::Kernel);

        channel.set_blocked(true);
        assert!(group.send_control(&channel, Bytes::from_static(b"S1")).unwrap());
        assert!(!group.send_control(&channel, Bytes::from_static(b"S2")).unwrap());
        assert!(!group.send_control(&channel, Bytes::from_static(b"S3")).unwrap());
        assert_eq!(group.queued(), 3);
        assert!(channel.sent().is_empty());

        channel.set_blocked(false);
        // A data message offered before the flush must not jump the queue.
        assert_eq!(
            group.send_data(&channel, Bytes::from_static(b"D")).unwrap(),
            DataSend::Blocked
        );
        assert!(group.flush(&channel).unwrap());
        let sent: Vec<_> = channel.sent().into_iter().map(|(_, m)| m).collect();
        assert_eq!(sent, vec![&b"S1"[..], &b"S2"[..], &b"S3"[..]]);
        assert!(!group.is_blocked());
    }

    #[test]
    fn test_flush_stops_when_blocked_again() {
        let channel = RecordingChannel::new();
        let group = ProviderGroup::new(ControlUnit(2), GroupOwner::Kernel);
        channel.set_blocked(true);
        group.send_control(&channel, Bytes::from_static(b"A")).unwrap();
        group.send_control(&channel, Bytes::from_static(b"B")).unwrap();

        channel.set_capacity(1);
        assert!(!group.flush(&channel).unwrap());
        assert_eq!(group.queued(), 1);
        assert!(group.is_blocked());

        channel.set_blocked(false);
        assert!(group.flush(&channel).unwrap());
        assert_eq!(channel.sent().len(), 2);
    }

    #[test]
    fn test_hard_failure_propagates() {
        let channel = RecordingChannel::new();
        let group = ProviderGroup::new(ControlUnit(4), GroupOwner::Kernel);
        channel.set_disconnected(true);
        assert_eq!(
            group.send_control(&channel, Bytes::from_static(b"X")),
            Err(ChannelError::Disconnected(ControlUnit(4)))
        );
        assert_eq!(group.queued(), 0);
    }
}
