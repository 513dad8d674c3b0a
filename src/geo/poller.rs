//! Periodic refresh of the Geo override table.
//!
//! # Responsibilities
//! - Fetch the Geo proxy settings from the backend every interval
//! - Rebuild and swap the Geo table when the settings change
//! - Release the backend transport of a replaced Geo target
//! - Stop on shutdown
//!
//! # Design Decisions
//! - The poller is the only writer of the Geo table; it replaces the table
//!   wholesale, readers are never blocked
//! - A failed fetch keeps the last known table

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::api::{AuthorizeError, GeoProxyData};
use crate::routing::router::Dispatcher;
use crate::routing::routes::{RouteContext, RouteError};

#[derive(Debug, thiserror::Error)]
pub enum GeoError {
    #[error("fetching geo proxy data: {0}")]
    Fetch(#[from] AuthorizeError),

    #[error("building geo routes: {0}")]
    Routes(#[from] RouteError),
}

pub struct GeoPoller {
    routes: Arc<RouteContext>,
    dispatcher: Arc<Dispatcher>,
    interval: Duration,
    current: Option<GeoProxyData>,
}

impl GeoPoller {
    pub fn new(routes: Arc<RouteContext>, dispatcher: Arc<Dispatcher>, interval: Duration) -> Self {
        Self {
            routes,
            dispatcher,
            interval,
            current: None,
        }
    }

    /// Poll until a shutdown signal arrives.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(interval_secs = self.interval.as_secs(), "Geo poller started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        tracing::warn!(error = %e, "Geo proxy refresh failed, keeping previous routes");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Geo poller stopping");
                    return;
                }
            }
        }
    }

    /// Fetch once; returns whether the Geo table changed.
    pub async fn poll_once(&mut self) -> Result<bool, GeoError> {
        let data = self.routes.api().geo_proxy_data().await?;
        if self.current.as_ref() == Some(&data) {
            return Ok(false);
        }

        let table = self.routes.geo_table(&data)?;
        tracing::info!(
            geo_proxy_url = %data.geo_proxy_url,
            enabled = table.is_some(),
            "Geo proxy settings changed"
        );
        self.dispatcher.replace_geo_routes(table);
        if let Some(previous) = self.current.replace(data.clone()) {
            self.routes.release_geo(&previous, &data);
        }
        Ok(true)
    }
}
