//! Error types for the flow-divert engine.
//!
//! Errors fall into the classes the engine treats differently:
//!
//! - **Protocol** (`Wire`): a malformed message from the provider. The
//!   message is dropped, nothing else changes.
//! - **Authentication** (`Auth`, `NotAuthorized`): token or HMAC failures.
//!   The operation fails; an unverified token is never accepted as valid.
//! - **Resource** (`Trie`, `FlowIdExhausted`, `NoBufferSpace`): the update or
//!   write is refused and prior state is left intact.
//! - **Policy / transport** (`NoProviderGroup`, `GroupDefunct`,
//!   `PermissionDenied`, `Refused`, `Reset`): surfaced to the flow as a
//!   connection failure, possibly after fail-over.
//!
//! At the socket boundary every error becomes a [`std::io::Error`].

use crate::auth::AuthError;
use crate::channel::ChannelError;
use crate::registry::ControlUnit;
use crate::trie::TrieError;
use flowdivert_wire::FlowId;
use std::io;
use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the engine.
#[derive(Error, Debug)]
pub enum Error {
    #[error("wire: {0}")]
    Wire(#[from] flowdivert_wire::Error),

    #[error("authentication: {0}")]
    Auth(#[from] AuthError),

    #[error("identity map: {0}")]
    Trie(#[from] TrieError),

    #[error("control channel: {0}")]
    Channel(#[from] ChannelError),

    /// No registered group can take the flow.
    #[error("no provider group available")]
    NoProviderGroup,

    /// The group's provider has gone away.
    #[error("provider group {0} is defunct")]
    GroupDefunct(ControlUnit),

    /// Every unit in the requested namespace is taken.
    #[error("no free control unit")]
    NoFreeUnit,

    /// The id drawn for a flow is already in use in the target group.
    #[error("flow id {0} already present in group")]
    FlowIdCollision(FlowId),

    /// No unused flow id found within the configured number of attempts.
    #[error("no free flow id after {0} attempts")]
    FlowIdExhausted(u32),

    /// Message addressed to a flow the group does not hold.
    #[error("unknown flow {0}")]
    UnknownFlow(FlowId),

    #[error("invalid destination")]
    InvalidDestination,

    /// A token failed verification, or could not be verified when
    /// verification is mandatory.
    #[error("not authorized")]
    NotAuthorized,

    /// The caller's signing identity is not in the group's identity map.
    #[error("application identity not permitted")]
    PermissionDenied,

    /// The provider rejected the connection with this error code.
    #[error("connection refused by provider (error {0})")]
    Refused(u32),

    /// The flow was torn down without a graceful close.
    #[error("connection reset")]
    Reset,

    /// The relevant direction of the flow is closed.
    #[error("flow closed")]
    Closed,

    #[error("flow already connected")]
    AlreadyConnected,

    #[error("flow not connected")]
    NotConnected,

    /// A datagram or key larger than any configured limit.
    #[error("message too large")]
    MessageTooLarge,

    /// The flow's send buffer is full; retry after the provider grants
    /// more credit.
    #[error("send buffer full")]
    NoBufferSpace,
}

impl Error {
    /// Provider error code to report for this error in a CLOSE message.
    pub fn wire_code(&self) -> u32 {
        match self {
            Error::Refused(code) => *code,
            Error::PermissionDenied => 1,
            Error::NotAuthorized => 80,
            Error::InvalidDestination => 22,
            Error::Closed | Error::NotConnected => 57,
            _ => 54,
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        let kind = match &err {
            Error::Refused(_) => io::ErrorKind::ConnectionRefused,
            Error::PermissionDenied | Error::NotAuthorized | Error::Auth(_) => {
                io::ErrorKind::PermissionDenied
            }
            Error::NotConnected => io::ErrorKind::NotConnected,
            Error::AlreadyConnected => io::ErrorKind::AlreadyExists,
            Error::InvalidDestination | Error::MessageTooLarge => io::ErrorKind::InvalidInput,
            Error::NoBufferSpace => io::ErrorKind::WouldBlock,
            Error::Closed => io::ErrorKind::BrokenPipe,
            Error::Wire(_) => io::ErrorKind::InvalidData,
            Error::Trie(_) | Error::FlowIdExhausted(_) | Error::NoFreeUnit => {
                io::ErrorKind::OutOfMemory
            }
            Error::NoProviderGroup
            | Error::GroupDefunct(_)
            | Error::Reset
            | Error::Channel(_)
            | Error::FlowIdCollision(_)
            | Error::UnknownFlow(_) => io::ErrorKind::ConnectionReset,
        };
        io::Error::new(kind, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_kinds() {
        let refused: io::Error = Error::Refused(61).into();
        assert_eq!(refused.kind(), io::ErrorKind::ConnectionRefused);

        let reset: io::Error = Error::NoProviderGroup.into();
        assert_eq!(reset.kind(), io::ErrorKind::ConnectionReset);

        let denied: io::Error = Error::PermissionDenied.into();
        assert_eq!(denied.kind(), io::ErrorKind::PermissionDenied);

        let busy: io::Error = Error::NoBufferSpace.into();
        assert_eq!(busy.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_wire_code_passes_provider_code_through() {
        assert_eq!(Error::Refused(61).wire_code(), 61);
        assert_eq!(Error::Reset.wire_code(), 54);
    }
}
