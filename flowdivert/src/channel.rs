//! Control-channel boundary.
//!
//! The engine hands fully framed messages to a [`ControlChannel`] and is
//! told about inbound traffic, drained capacity and group lifecycle through
//! [`Engine`](crate::Engine) methods. How bytes actually reach the provider
//! is the channel's business.

use crate::registry::ControlUnit;
use bytes::Bytes;
use thiserror::Error;

/// Send failures reported by a channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The provider's receive queue is full. Not a failure: the message is
    /// retried once the channel reports drained capacity.
    #[error("channel would block")]
    WouldBlock,

    /// The provider for this unit is gone.
    #[error("provider for unit {0} disconnected")]
    Disconnected(ControlUnit),

    #[error("channel failure: {0}")]
    Other(String),
}

/// Outbound half of the provider control channel.
///
/// `send` must not block and must not call back into the engine on the
/// calling thread: it runs with the sending group's lock held so that
/// messages leave in the order they were issued.
pub trait ControlChannel: Send + Sync {
    fn send(&self, unit: ControlUnit, message: Bytes) -> Result<(), ChannelError>;
}
