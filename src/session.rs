//! Streaming session: owns the registry and every component built on it

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::camera::FrameSource;
use crate::config::Config;
use crate::landmarks::SampleBatcher;
use crate::link::{
    ConnectionRegistry, Connector, InboundMessage, Link, LinkError, LinkEvent, LinkId, LinkOptions,
    ReconnectSupervisor, RegistryConfig, Subscription,
};
use crate::streaming::{FrameBudget, FrameStreamer, StatsAggregator, StatsSnapshot};

/// Wires one registry to its supervisor, frame streamer and sample batcher
pub struct StreamingSession {
    config: Config,
    registry: Arc<ConnectionRegistry>,
    supervisor: ReconnectSupervisor,
    streamer: FrameStreamer,
    batcher: SampleBatcher,
    stats: Arc<StatsAggregator>,
    shut_down: AtomicBool,
}

impl StreamingSession {
    pub fn new(config: Config, connector: Arc<dyn Connector>, source: Arc<dyn FrameSource>) -> Self {
        let registry = ConnectionRegistry::new(connector, RegistryConfig::from(&config.registry));
        let stats = Arc::new(StatsAggregator::new());

        let supervisor = ReconnectSupervisor::from_config(Arc::clone(&registry), &config.reconnect);
        let streamer = FrameStreamer::new(
            Arc::clone(&registry),
            source,
            Arc::clone(&stats),
            FrameBudget::from(&config.video),
        )
        .with_refresh_hz(config.video.refresh_hz);
        let batcher = SampleBatcher::new(Arc::clone(&registry), &config.landmarks);

        Self {
            config,
            registry,
            supervisor,
            streamer,
            batcher,
            stats,
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn supervisor(&self) -> &ReconnectSupervisor {
        &self.supervisor
    }

    pub fn streamer(&self) -> &FrameStreamer {
        &self.streamer
    }

    pub fn batcher(&self) -> &SampleBatcher {
        &self.batcher
    }

    /// Start supervising links
    pub fn start(&self) {
        self.supervisor.start();
    }

    pub fn open(&self, url: &str) -> Result<LinkId, LinkError> {
        self.registry.open(url)
    }

    /// Open every link listed in the configuration, in order
    pub fn open_configured_links(&self) -> Result<Vec<LinkId>, LinkError> {
        self.config
            .links
            .iter()
            .map(|link| {
                self.registry.open_with(
                    &link.url,
                    LinkOptions {
                        auto_reconnect: link.auto_reconnect,
                    },
                )
            })
            .collect()
    }

    pub fn links(&self) -> Vec<Link> {
        self.registry.links()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn on_state_change<F>(&self, callback: F) -> Subscription
    where
        F: FnMut(LinkEvent) + Send + 'static,
    {
        self.registry.on_state_change(callback)
    }

    pub fn on_message<F>(&self, callback: F) -> Subscription
    where
        F: FnMut(InboundMessage) + Send + 'static,
    {
        self.registry.on_message(callback)
    }

    pub fn log_stats(&self) {
        self.stats.log_stats();
        self.batcher.log_stats();
        for link in self.links() {
            info!(link_id = %link.id, state = %link.state, retry_count = link.retry_count, "Link status");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Stop producers, close every link, then stop the supervisor.
    /// Only the first call does anything.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.streamer.stop();
        self.batcher.stop();

        let closed = self.registry.close_all();
        if self.registry.link_count() > 0 {
            warn!(remaining = self.registry.link_count(), "Links still registered after close");
        }

        self.supervisor.stop();
        info!(closed, "Session shut down");
    }
}

impl Drop for StreamingSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}
