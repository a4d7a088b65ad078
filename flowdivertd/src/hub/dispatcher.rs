use super::{Hub, HubEvent};
use crossbeam_channel::{Receiver, Sender};
use flowdivert::{Engine, Error};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Handle for the dispatcher thread.
///
/// Dropping it asks the thread to stop without waiting for it.
pub struct DispatcherHandle {
    thread: Option<JoinHandle<()>>,
    events: Sender<HubEvent>,
}

impl DispatcherHandle {
    /// Stop after already-queued provider traffic and wait for the thread.
    pub fn shutdown(mut self) {
        info!("Shutting down dispatcher");
        let _ = self.events.send(HubEvent::Shutdown);
        if let Some(thread) = self.thread.take() {
            if let Err(e) = thread.join() {
                error!(error = ?e, "Dispatcher thread panicked");
            }
        }
    }
}

impl Drop for DispatcherHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            debug!("DispatcherHandle dropped, signaling shutdown");
            let _ = self.events.try_send(HubEvent::Shutdown);
        }
    }
}

/// Spawn the native thread that feeds provider traffic into the engine.
///
/// It runs until it dequeues [`HubEvent::Shutdown`] or every sender is
/// gone.
pub fn spawn_dispatcher(
    engine: Arc<Engine>,
    hub: Arc<Hub>,
    events: Receiver<HubEvent>,
) -> io::Result<DispatcherHandle> {
    let sender = hub.events.clone();
    let thread = thread::Builder::new()
        .name("flowdivert-dispatch".to_string())
        .spawn(move || run(&engine, &hub, &events))?;

    Ok(DispatcherHandle {
        thread: Some(thread),
        events: sender,
    })
}

fn run(engine: &Engine, hub: &Hub, events: &Receiver<HubEvent>) {
    debug!("dispatcher started");
    let mut handled: u64 = 0;

    while let Ok(event) = events.recv() {
        match event {
            HubEvent::Inbound { unit, raw } => {
                handled += 1;
                match engine.handle_message(unit, raw) {
                    Ok(()) => {}
                    // Late traffic for flows that already closed.
                    Err(Error::UnknownFlow(flow_id)) => {
                        debug!(%unit, %flow_id, "message for unknown flow")
                    }
                    Err(e) => warn!(%unit, error = %e, "provider message rejected"),
                }
            }
            HubEvent::Drained(unit) => engine.on_drained(unit),
            HubEvent::Detached(unit) => {
                hub.unregister(unit);
                engine.detach_provider(unit);
            }
            HubEvent::Shutdown => break,
        }
    }

    debug!(handled, "dispatcher stopped");
}
