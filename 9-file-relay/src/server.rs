use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    response::Response,
    routing::get,
};
use tokio::net::{TcpListener, ToSocketAddrs};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    config::RelayConfig,
    session::{self, Hub},
};

pub struct RelayServer {
    listener: TcpListener,
    hub: Arc<Hub>,
}

impl RelayServer {
    pub fn new(listener: TcpListener, config: RelayConfig) -> Self {
        Self {
            listener,
            hub: Arc::new(Hub::new(config)),
        }
    }

    pub async fn bind<A>(addr: A, config: RelayConfig) -> Result<Self>
    where
        A: ToSocketAddrs,
    {
        let listener = TcpListener::bind(addr)
            .await
            .context("failed to bind relay listener")?;
        Ok(Self::new(listener, config))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn hub(&self) -> Arc<Hub> {
        Arc::clone(&self.hub)
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let RelayServer { listener, hub } = self;
        let app = router(Arc::clone(&hub));

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.await;
                info!("relay shutting down");
                hub.shutdown().await;
            })
            .await
            .context("relay server failed")
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

pub fn router(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/healthz", get(|| async { "ok" }))
        .layer(TraceLayer::new_for_http())
        .with_state(hub)
}

async fn ws_upgrade(State(hub): State<Arc<Hub>>, ws: WebSocketUpgrade) -> Response {
    let limit = hub.config().max_message_size;
    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| session::handle_socket(socket, hub))
}
