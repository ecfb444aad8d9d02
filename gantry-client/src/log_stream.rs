//! Stage log stream connection
//!
//! A worker opens one persistent WebSocket per stage (or task) log and pushes
//! each log line as a text frame. The controller republishes the lines on the
//! log bus for viewers.

use futures::SinkExt;
use gantry_core::domain::log::LogStreamKey;
use reqwest::Url;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::ControllerClient;
use crate::error::{ClientError, Result};

/// An open stage log stream
pub struct LogStream {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl LogStream {
    /// Push one log line
    pub async fn send_line(&mut self, line: &str) -> Result<()> {
        self.socket.send(Message::text(line.to_string())).await?;
        Ok(())
    }

    /// Keep-alive frame for idle periods
    pub async fn ping(&mut self) -> Result<()> {
        self.socket.send(Message::Ping(Default::default())).await?;
        Ok(())
    }

    /// Send a close frame and release the connection
    pub async fn close(mut self) -> Result<()> {
        self.socket.close(None).await?;
        Ok(())
    }
}

impl ControllerClient {
    /// URL of the stage log stream endpoint for one stream key
    pub fn stage_log_stream_url(&self, key: &LogStreamKey) -> Result<Url> {
        let raw = format!(
            "{}/api/v1/projects/{}/pipelines/{}/records/{}/stagelogstream",
            self.ws_base_url(),
            key.owner,
            key.pipeline,
            key.run
        );
        let mut url = Url::parse(&raw)
            .map_err(|e| ClientError::ParseError(format!("Invalid log stream URL {}: {}", raw, e)))?;

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("stage", key.stage.as_str());
            if let Some(task) = &key.task {
                query.append_pair("task", task);
            }
        }

        Ok(url)
    }

    /// Open a persistent log stream for a stage or task
    pub async fn open_stage_log_stream(&self, key: &LogStreamKey) -> Result<LogStream> {
        let url = self.stage_log_stream_url(key)?;
        debug!("Opening log stream {}", url);

        let (socket, _) = tokio_tungstenite::connect_async(url.as_str()).await?;

        Ok(LogStream { socket })
    }
}
