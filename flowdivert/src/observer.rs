//! Engine event hook.
//!
//! The engine reports lifecycle and traffic events through an
//! [`EngineObserver`]. Hosts forward them to their metrics pipeline; the
//! default observer drops them.

use crate::registry::ControlUnit;

/// Something worth counting happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    FlowCreated,
    FlowClosed,
    ConnectSent { unit: ControlUnit },
    ConnectAccepted { unit: ControlUnit },
    ConnectRejected { unit: ControlUnit, code: u32 },
    FailOver { from: ControlUnit, to: ControlUnit },
    /// Fail-over exhausted its candidates and the flow connects directly.
    Fallback,
    BytesToProvider(usize),
    BytesFromProvider(usize),
    BackpressureEngaged { unit: ControlUnit },
    BackpressureDrained { unit: ControlUnit },
    GroupAttached { unit: ControlUnit },
    GroupDetached { unit: ControlUnit },
}

/// Receives [`EngineEvent`]s. Must be cheap and non-blocking.
pub trait EngineObserver: Send + Sync {
    fn on_event(&self, event: EngineEvent);
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl EngineObserver for NoopObserver {
    fn on_event(&self, _event: EngineEvent) {}
}
