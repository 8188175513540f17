//! HTTP + WebSocket server over a running pipeline

pub mod handlers;
pub mod router;
pub mod websocket;

#[cfg(test)]
pub mod tests;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use arbor_pipeline::PipelineContext;
use tokio::net::TcpListener;
use tracing::info;

pub use router::create_router;

/// Shared state handed to every handler.
#[derive(Debug)]
pub struct ServerState {
    pub ctx: Arc<PipelineContext>,
}

impl ServerState {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        ServerState { ctx }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 7890,
        }
    }
}

pub struct ArborServer {
    state: Arc<ServerState>,
    config: ServerConfig,
}

impl ArborServer {
    pub fn new(ctx: Arc<PipelineContext>, config: ServerConfig) -> Self {
        ArborServer {
            state: Arc::new(ServerState::new(ctx)),
            config,
        }
    }

    pub fn state(&self) -> Arc<ServerState> {
        Arc::clone(&self.state)
    }

    /// Bind the configured address and serve until the pipeline shuts down.
    pub async fn start(self) -> anyhow::Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {}", addr))?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr: SocketAddr = listener.local_addr()?;
        info!("Arbor server listening on http://{}", addr);
        let shutdown = self.state.ctx.shutdown_token();
        let router = create_router(self.state);
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await?;
        info!("Arbor server stopped");
        Ok(())
    }
}
