//! SMTP server implementation

use crate::smtp::SmtpHandler;
use anyhow::Result;
use mailflow_common::config::SmtpConfig;
use mailflow_pipeline::PipelineHandle;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

/// SMTP server accepting inbound mail and feeding the pipeline
pub struct SmtpServer {
    config: SmtpConfig,
    hostname: String,
    pipeline: PipelineHandle,
    connection_semaphore: Arc<Semaphore>,
}

impl SmtpServer {
    /// Create a new SMTP server
    pub fn new(config: SmtpConfig, hostname: String, pipeline: PipelineHandle) -> Self {
        let max_connections = config.max_connections.max(1);
        Self {
            config,
            hostname,
            pipeline,
            connection_semaphore: Arc::new(Semaphore::new(max_connections)),
        }
    }

    /// Run the listener loop; returns only on a bind or accept error
    pub async fn run(&self) -> Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;

        info!("SMTP server listening on {}", addr);

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let permit = match self.connection_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            warn!("Max connections reached, rejecting {}", peer_addr);
                            continue;
                        }
                    };

                    let handler = SmtpHandler::new(
                        self.config.clone(),
                        self.hostname.clone(),
                        self.pipeline.clone(),
                        peer_addr,
                    );

                    tokio::spawn(async move {
                        if let Err(e) = handler.handle(stream).await {
                            error!("SMTP session error from {}: {}", peer_addr, e);
                        }
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}
