//! The assembled host: registry, hub, engine and dispatcher.

use crate::config::DaemonConfig;
use crate::hub::{spawn_dispatcher, DispatcherHandle, Hub, ProviderHandle};
use anyhow::{Context, Result};
use flowdivert::{Engine, EngineObserver, GroupOwner, Registry};
use std::sync::Arc;
use tracing::info;

/// A running flow-divert host.
pub struct Daemon {
    engine: Arc<Engine>,
    hub: Arc<Hub>,
    dispatcher: DispatcherHandle,
}

impl Daemon {
    /// Build the engine on a fresh registry and start dispatching.
    pub fn start(config: &DaemonConfig, observer: Arc<dyn EngineObserver>) -> Result<Self> {
        let (hub, events) = Hub::new(&config.global.channels);
        let engine = Arc::new(
            Engine::new(
                config.engine.clone(),
                Arc::new(Registry::new()),
                Arc::clone(&hub) as Arc<dyn flowdivert::ControlChannel>,
            )
            .with_observer(observer),
        );
        let dispatcher = spawn_dispatcher(Arc::clone(&engine), Arc::clone(&hub), events)
            .context("failed to spawn dispatcher thread")?;

        info!(
            link_capacity = config.global.channels.provider_link_capacity,
            chunk_size = config.engine.chunk_size,
            "flow-divert engine started"
        );
        Ok(Self {
            engine,
            hub,
            dispatcher,
        })
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Attach an in-process provider.
    pub fn attach_provider(&self, owner: GroupOwner) -> flowdivert::Result<ProviderHandle> {
        self.hub.attach(&self.engine, owner)
    }

    /// Reset every flow, detach every provider and stop the dispatcher.
    pub fn shutdown(self) {
        let providers = self.hub.provider_count();
        self.engine.detach_all();
        self.dispatcher.shutdown();
        info!(providers, "flow-divert engine stopped");
    }
}
