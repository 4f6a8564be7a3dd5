//! Reconnect supervision: exponential backoff around the upstream client.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::bus::{DomainEvent, EventBus};
use crate::ingest::IngestionEngine;
use crate::upstream::UpstreamClient;

const INITIAL_BACKOFF_SECS: u64 = 1;
const BACKOFF_LIMIT_SECS: u64 = 60;

/// Exponential reconnect delay: doubles from `initial` up to `limit`, reset
/// to `initial` after a successful connection.
pub struct Backoff {
    initial: u64,
    limit: u64,
    current: u64,
}

impl Backoff {
    pub fn new(initial: u64, limit: u64) -> Self {
        Self {
            initial,
            limit,
            current: initial,
        }
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.current)
    }

    pub fn advance(&mut self) {
        self.current = (self.current * 2).min(self.limit);
    }
}

/// Connection parameters for the supervised upstream session.
#[derive(Clone, Debug)]
pub struct UpstreamConfig {
    pub url: String,
    pub token: String,
}

/// Run upstream sessions forever. Each attempt connects, refreshes the
/// registry, subscribes, and feeds the ingestion engine until the stream
/// ends; any failure sleeps out the backoff and retries. A misconfigured
/// token never succeeds and keeps retrying; operator visibility is via the
/// logs.
pub async fn run_supervisor(config: UpstreamConfig, bus: Arc<EventBus>, engine: Arc<IngestionEngine>) {
    let mut backoff = Backoff::new(INITIAL_BACKOFF_SECS, BACKOFF_LIMIT_SECS);

    loop {
        match UpstreamClient::connect(&config.url, &config.token).await {
            Ok(client) => {
                backoff.reset();
                if let Err(e) = run_session(client, &bus, &engine).await {
                    warn!(error = %e, "upstream session failed");
                }
            }
            Err(e) => {
                warn!(error = %e, "upstream connection failed");
            }
        }

        let delay = backoff.wait();
        info!(seconds = delay.as_secs(), "reconnecting to upstream after backoff");
        tokio::time::sleep(delay).await;
        backoff.advance();
    }
}

async fn run_session(
    mut client: UpstreamClient,
    bus: &Arc<EventBus>,
    engine: &IngestionEngine,
) -> anyhow::Result<()> {
    let registry = client.fetch_registry().await?;
    bus.publish(DomainEvent::RegistryUpdated { registry });
    client.subscribe_events().await?;

    if let Err(e) = engine.run(client.into_event_stream()).await {
        error!(error = %e, "ingestion torn down by storage failure");
        return Err(e.into());
    }
    info!("upstream session ended");
    Ok(())
}
