//! Event-driven metrics collection.
//!
//! Recording never blocks: events go over an unbounded crossbeam channel
//! to a task on the tokio runtime that folds them into a
//! [`MetricsSnapshot`] and logs it periodically.

use anyhow::Result;
use crossbeam_channel::Sender;
use flowdivert::{EngineEvent, EngineObserver};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::config::TelemetryConfig;

/// Global metrics event sender
static METRICS_SENDER: OnceCell<Sender<MetricsEvent>> = OnceCell::new();

/// Metrics events for fire-and-forget recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricsEvent {
    FlowCreated,
    FlowClosed,
    ConnectSent,
    ConnectAccepted,
    ConnectRejected { code: u32 },
    FailOver,
    Fallback,
    BytesToProvider(usize),
    BytesFromProvider(usize),
    BackpressureEngaged,
    BackpressureDrained,
    GroupAttached,
    GroupDetached,
}

impl From<EngineEvent> for MetricsEvent {
    fn from(event: EngineEvent) -> Self {
        match event {
            EngineEvent::FlowCreated => MetricsEvent::FlowCreated,
            EngineEvent::FlowClosed => MetricsEvent::FlowClosed,
            EngineEvent::ConnectSent { .. } => MetricsEvent::ConnectSent,
            EngineEvent::ConnectAccepted { .. } => MetricsEvent::ConnectAccepted,
            EngineEvent::ConnectRejected { code, .. } => MetricsEvent::ConnectRejected { code },
            EngineEvent::FailOver { .. } => MetricsEvent::FailOver,
            EngineEvent::Fallback => MetricsEvent::Fallback,
            EngineEvent::BytesToProvider(n) => MetricsEvent::BytesToProvider(n),
            EngineEvent::BytesFromProvider(n) => MetricsEvent::BytesFromProvider(n),
            EngineEvent::BackpressureEngaged { .. } => MetricsEvent::BackpressureEngaged,
            EngineEvent::BackpressureDrained { .. } => MetricsEvent::BackpressureDrained,
            EngineEvent::GroupAttached { .. } => MetricsEvent::GroupAttached,
            EngineEvent::GroupDetached { .. } => MetricsEvent::GroupDetached,
        }
    }
}

/// Engine observer that feeds the metrics channel.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsObserver;

impl EngineObserver for MetricsObserver {
    fn on_event(&self, event: EngineEvent) {
        record_metric(event.into());
    }
}

/// Aggregated counters.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub flows_created: u64,
    pub flows_closed: u64,
    pub connects_sent: u64,
    pub connects_accepted: u64,
    pub connects_rejected: u64,
    pub failovers: u64,
    pub fallbacks: u64,
    pub bytes_to_provider: u64,
    pub bytes_from_provider: u64,
    pub backpressure_engaged: u64,
    pub backpressure_drained: u64,
    pub groups_active: u64,
    pub last_reject_code: Option<u32>,
}

impl MetricsSnapshot {
    pub fn apply(&mut self, event: MetricsEvent) {
        match event {
            MetricsEvent::FlowCreated => self.flows_created += 1,
            MetricsEvent::FlowClosed => self.flows_closed += 1,
            MetricsEvent::ConnectSent => self.connects_sent += 1,
            MetricsEvent::ConnectAccepted => self.connects_accepted += 1,
            MetricsEvent::ConnectRejected { code } => {
                self.connects_rejected += 1;
                self.last_reject_code = Some(code);
            }
            MetricsEvent::FailOver => self.failovers += 1,
            MetricsEvent::Fallback => self.fallbacks += 1,
            MetricsEvent::BytesToProvider(n) => self.bytes_to_provider += n as u64,
            MetricsEvent::BytesFromProvider(n) => self.bytes_from_provider += n as u64,
            MetricsEvent::BackpressureEngaged => self.backpressure_engaged += 1,
            MetricsEvent::BackpressureDrained => self.backpressure_drained += 1,
            MetricsEvent::GroupAttached => self.groups_active += 1,
            MetricsEvent::GroupDetached => {
                self.groups_active = self.groups_active.saturating_sub(1)
            }
        }
    }

    pub fn flows_active(&self) -> u64 {
        self.flows_created.saturating_sub(self.flows_closed)
    }

    fn report(&self, service: &str) {
        tracing::info!(
            service,
            flows_active = self.flows_active(),
            flows_created = self.flows_created,
            connects_sent = self.connects_sent,
            connects_accepted = self.connects_accepted,
            connects_rejected = self.connects_rejected,
            failovers = self.failovers,
            fallbacks = self.fallbacks,
            bytes_to_provider = self.bytes_to_provider,
            bytes_from_provider = self.bytes_from_provider,
            backpressure_engaged = self.backpressure_engaged,
            groups_active = self.groups_active,
            "metrics"
        );
    }
}

/// Handle to the metrics task for graceful shutdown
pub struct MetricsHandle {
    task_handle: Option<JoinHandle<()>>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl MetricsHandle {
    /// Create a disabled handle (when metrics are disabled)
    pub fn disabled() -> Self {
        Self {
            task_handle: None,
            shutdown_tx: None,
        }
    }

    /// Stop the task, waiting at most five seconds for its final report.
    pub async fn shutdown(self) {
        if let Some(tx) = self.shutdown_tx {
            let _ = tx.send(());
        }
        if let Some(handle) = self.task_handle {
            match tokio::time::timeout(Duration::from_secs(5), handle).await {
                Ok(Err(e)) => {
                    tracing::error!(error = ?e, "Metrics task panicked during shutdown");
                }
                Ok(Ok(())) => {}
                Err(_) => {
                    tracing::error!("Metrics task shutdown timed out after 5 seconds");
                }
            }
        }
    }
}

/// Record a metrics event (fire-and-forget).
///
/// A no-op until [`start_metrics_task`] has run.
#[inline]
pub fn record_metric(event: MetricsEvent) {
    if let Some(sender) = METRICS_SENDER.get() {
        let _ = sender.send(event);
    }
}

/// Install the global sender and spawn the aggregation task.
///
/// Can only succeed once per process.
pub fn start_metrics_task(
    config: &TelemetryConfig,
    runtime_handle: &tokio::runtime::Handle,
) -> Result<MetricsHandle> {
    let (tx, rx) = crossbeam_channel::unbounded::<MetricsEvent>();

    METRICS_SENDER
        .set(tx)
        .map_err(|_| anyhow::anyhow!("Metrics sender already initialized"))?;

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();
    let service = config.service_name.clone();
    let report_every = Duration::from_secs(config.report_interval_secs.max(1));

    let task_handle = runtime_handle.spawn(async move {
        tracing::debug!("Metrics collection task started");
        let mut snapshot = MetricsSnapshot::default();
        let mut report = tokio::time::interval(report_every);
        report.tick().await;
        let mut poll = tokio::time::interval(Duration::from_millis(100));

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                _ = report.tick() => snapshot.report(&service),
                _ = poll.tick() => {
                    // Bounded per tick so shutdown stays responsive.
                    for event in rx.try_iter().take(1000) {
                        snapshot.apply(event);
                    }
                }
            }
        }

        for event in rx.try_iter() {
            snapshot.apply(event);
        }
        snapshot.report(&service);
        tracing::debug!("Metrics task stopped");
    });

    Ok(MetricsHandle {
        task_handle: Some(task_handle),
        shutdown_tx: Some(shutdown_tx),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowdivert::ControlUnit;

    #[test]
    fn test_engine_events_map_to_metrics() {
        let unit = ControlUnit(3);
        assert_eq!(
            MetricsEvent::from(EngineEvent::ConnectRejected { unit, code: 61 }),
            MetricsEvent::ConnectRejected { code: 61 }
        );
        assert_eq!(
            MetricsEvent::from(EngineEvent::FailOver { from: unit, to: ControlUnit(5) }),
            MetricsEvent::FailOver
        );
        assert_eq!(
            MetricsEvent::from(EngineEvent::BytesToProvider(42)),
            MetricsEvent::BytesToProvider(42)
        );
    }

    #[test]
    fn test_snapshot_counts() {
        let mut snapshot = MetricsSnapshot::default();
        for event in [
            MetricsEvent::GroupAttached,
            MetricsEvent::FlowCreated,
            MetricsEvent::FlowCreated,
            MetricsEvent::ConnectRejected { code: 61 },
            MetricsEvent::FailOver,
            MetricsEvent::BytesToProvider(100),
            MetricsEvent::BytesToProvider(28),
            MetricsEvent::FlowClosed,
            MetricsEvent::GroupDetached,
            MetricsEvent::GroupDetached,
        ] {
            snapshot.apply(event);
        }

        assert_eq!(snapshot.flows_active(), 1);
        assert_eq!(snapshot.connects_rejected, 1);
        assert_eq!(snapshot.last_reject_code, Some(61));
        assert_eq!(snapshot.failovers, 1);
        assert_eq!(snapshot.bytes_to_provider, 128);
        assert_eq!(snapshot.groups_active, 0);
    }

    #[test]
    fn test_record_without_task_is_noop() {
        record_metric(MetricsEvent::FlowCreated);
    }
}
