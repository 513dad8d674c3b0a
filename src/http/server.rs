//! HTTP server setup.
//!
//! # Responsibilities
//! - Build the route set and dispatcher from configuration
//! - Wire tower-http middleware (request id, tracing)
//! - Hand every request to the dispatcher
//! - Run the Geo poller alongside the listener
//! - Drain gracefully on shutdown
//!
//! # Design Decisions
//! - A single axum fallback handler: routing is the dispatcher's job, not axum's
//! - No request timeout layer; long Git transfers are bounded by the
//!   backend header timeout and client disconnects instead

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::Request,
    response::Response,
    Router,
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::config::GatewayConfig;
use crate::geo::GeoPoller;
use crate::http::request::{propagate_request_id_layer, set_request_id_layer};
use crate::lifecycle::Shutdown;
use crate::routing::router::Dispatcher;
use crate::routing::routes::{RouteContext, RouteError};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("building routes: {0}")]
    Routes(#[from] RouteError),

    #[error("server io: {0}")]
    Io(#[from] std::io::Error),
}

pub struct GatewayServer {
    config: GatewayConfig,
    routes: Arc<RouteContext>,
    dispatcher: Arc<Dispatcher>,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig) -> Result<Self, ServerError> {
        let routes = Arc::new(RouteContext::from_config(&config)?);
        let table = routes.main_table()?;
        tracing::info!(
            routes = table.len(),
            prefix = %routes.prefix().as_str(),
            backend = %config.backend.url,
            "Route table compiled"
        );
        let dispatcher = Arc::new(Dispatcher::new(routes.prefix().clone(), table));

        Ok(Self {
            config,
            routes,
            dispatcher,
        })
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// The axum application: middleware around a dispatching fallback.
    pub fn router(&self) -> Router {
        Router::new()
            .fallback(dispatch)
            .with_state(self.dispatcher.clone())
            .layer(propagate_request_id_layer())
            .layer(TraceLayer::new_for_http())
            .layer(set_request_id_layer())
    }

    /// Serve `listener` until `shutdown` fires.
    pub async fn run(self, listener: TcpListener, shutdown: Arc<Shutdown>) -> Result<(), ServerError> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        if self.config.geo.enabled {
            let poller = GeoPoller::new(
                self.routes.clone(),
                self.dispatcher.clone(),
                self.config.geo.poll_interval(),
            );
            tokio::spawn(poller.run(shutdown.subscribe()));
        }

        let app = self.router().into_make_service_with_connect_info::<SocketAddr>();
        let mut stop = shutdown.subscribe();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = stop.recv().await;
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

async fn dispatch(State(dispatcher): State<Arc<Dispatcher>>, req: Request<Body>) -> Response {
    dispatcher.dispatch(req).await
}
