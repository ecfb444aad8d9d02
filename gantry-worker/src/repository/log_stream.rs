//! Log stream repository
//!
//! Opens the persistent connection a log forwarder pushes lines on.

use anyhow::{Context, Result};
use async_trait::async_trait;
use gantry_client::{ControllerClient, LogStream};
use gantry_core::domain::log::LogStreamKey;
use std::sync::Arc;

/// Open connection to the controller's stage log endpoint
#[async_trait]
pub trait LogStreamSink: Send {
    /// Pushes one log line
    async fn send_line(&mut self, line: &str) -> Result<()>;

    /// Keep-alive while no lines are flowing
    async fn ping(&mut self) -> Result<()>;

    /// Sends a close frame and releases the connection
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Factory for log stream connections
#[async_trait]
pub trait LogStreamConnector: Send + Sync {
    /// Opens the stream identified by `key`
    async fn connect(&self, key: &LogStreamKey) -> Result<Box<dyn LogStreamSink>>;
}

/// WebSocket implementation of LogStreamConnector
pub struct WsLogStreamConnector {
    client: Arc<ControllerClient>,
}

impl WsLogStreamConnector {
    pub fn new(client: Arc<ControllerClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LogStreamConnector for WsLogStreamConnector {
    async fn connect(&self, key: &LogStreamKey) -> Result<Box<dyn LogStreamSink>> {
        let stream = self
            .client
            .open_stage_log_stream(key)
            .await
            .with_context(|| format!("Failed to open log stream {}", key.file_name()))?;

        Ok(Box::new(stream))
    }
}

#[async_trait]
impl LogStreamSink for LogStream {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        LogStream::send_line(self, line)
            .await
            .context("Failed to push log line")
    }

    async fn ping(&mut self) -> Result<()> {
        LogStream::ping(self).await.context("Failed to ping log stream")
    }

    async fn close(self: Box<Self>) -> Result<()> {
        LogStream::close(*self)
            .await
            .context("Failed to close log stream")
    }
}
