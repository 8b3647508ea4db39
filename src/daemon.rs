//! The long-running dispatcher process.

use futures::stream::BoxStream;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::blob::BlobStore;
use crate::bus::{BusMessage, MessageBus};
use crate::cluster::{ResourcePool, WorkerLauncher};
use crate::config::Settings;
use crate::db::MetadataStore;
use crate::dispatch::{Dispatcher, GraphContext};
use crate::error::Result;

/// Environment variable naming the config file, also passed to scripts so
/// that `train-dispatch report` finds the same services.
pub const CONFIG_ENV: &str = "TRAIN_DISPATCH_CONFIG";

pub struct Daemon {
    settings: Settings,
    bus: Arc<dyn MessageBus>,
    pool: Arc<ResourcePool>,
    dispatcher: Arc<Dispatcher>,
}

impl Daemon {
    /// Connect every collaborator named in `settings` and acquire the pool.
    ///
    /// Fails fast: a daemon that cannot reach its pool never starts.
    pub async fn start(settings: Settings, config_path: Option<&Path>) -> Result<Self> {
        let store = crate::connect_store(&settings.metadata).await?;
        let blobs = crate::build_blob_store(&settings.blob)?;
        let bus = crate::build_bus(&settings.bus)?;
        let launcher = crate::build_launcher(&settings.cluster);

        let mut ctx = GraphContext::new(store.clone(), blobs.clone());
        if let Some(path) = config_path {
            ctx = ctx.with_env(CONFIG_ENV, path.display().to_string());
        }

        Self::from_parts(settings, store, bus, launcher, ctx).await
    }

    pub async fn from_parts(
        settings: Settings,
        store: MetadataStore,
        bus: Arc<dyn MessageBus>,
        launcher: Arc<dyn WorkerLauncher>,
        ctx: GraphContext,
    ) -> Result<Self> {
        let pool = Arc::new(ResourcePool::acquire(settings.cluster.clone(), launcher).await?);
        let dispatcher = Arc::new(Dispatcher::new(
            store,
            pool.clone(),
            Arc::new(ctx),
            settings.dispatcher.poll_interval(),
        ));

        Ok(Self {
            settings,
            bus,
            pool,
            dispatcher,
        })
    }

    pub fn pool(&self) -> &ResourcePool {
        &self.pool
    }

    /// Subscribe to the configured channel and serve until `shutdown`.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let messages = match self.bus.subscribe(&self.settings.bus.channel).await {
            Ok(messages) => messages,
            Err(e) => {
                self.pool.close().await?;
                return Err(e);
            }
        };
        self.serve(messages, shutdown).await
    }

    /// Serve an already open subscription, then drain and release the pool.
    pub async fn serve(self, messages: BoxStream<'static, BusMessage>, shutdown: CancellationToken) -> Result<()> {
        info!(
            channel = %self.settings.bus.channel,
            address = %self.pool.address(),
            "Daemon started"
        );

        let consumer = {
            let dispatcher = self.dispatcher.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { dispatcher.run(messages, shutdown).await })
        };
        if let Err(e) = consumer.await {
            error!(error = %e, "Subscriber loop aborted");
        }

        let timeout = self.settings.dispatcher.drain_timeout();
        if !self.dispatcher.drain(timeout).await {
            warn!(
                in_flight = self.dispatcher.in_flight(),
                timeout_secs = timeout.as_secs(),
                "Jobs still running at shutdown, cancelling them"
            );
        }

        self.pool.close().await?;

        // Cancelled jobs still get their terminal status written.
        let grace = self.settings.dispatcher.poll_interval() * 4;
        self.dispatcher.drain(grace).await;

        info!("Daemon stopped");
        Ok(())
    }
}
