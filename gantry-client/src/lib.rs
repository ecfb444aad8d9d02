//! Gantry HTTP Client
//!
//! A type-safe client for the Gantry controller API, shared by workers and
//! tooling.
//!
//! # Example
//!
//! ```no_run
//! use gantry_client::ControllerClient;
//!
//! #[tokio::main]
//! async fn main() -> gantry_client::Result<()> {
//!     let client = ControllerClient::new("http://localhost:8080");
//!
//!     if let Some(event) = client.next_event().await? {
//!         println!("Claimed event: {}", event.id);
//!     }
//!     Ok(())
//! }
//! ```

pub mod error;
mod events;
pub mod log_stream;

// Re-export commonly used types
pub use error::{ClientError, Result};
pub use log_stream::LogStream;

use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;

/// HTTP client for the Gantry controller API
///
/// Methods are grouped into:
/// - Event lifecycle (create, fetch, claim, update, lease renewal, reset)
/// - Archived records
/// - Stage log stream connections
#[derive(Debug, Clone)]
pub struct ControllerClient {
    /// Base URL of the controller (e.g., "http://localhost:8080")
    base_url: String,
    /// HTTP client instance
    client: Client,
}

impl ControllerClient {
    /// Create a new controller client
    ///
    /// # Arguments
    /// * `base_url` - The base URL of the controller API (e.g., "http://localhost:8080")
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    /// Create a new controller client with a custom HTTP client
    ///
    /// # Arguments
    /// * `base_url` - The base URL of the controller API
    /// * `client` - A configured reqwest Client
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Get the base URL of the controller
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Base URL with the scheme switched to its WebSocket counterpart
    fn ws_base_url(&self) -> String {
        if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            self.base_url.clone()
        }
    }

    // =============================================================================
    // Response Handlers
    // =============================================================================

    /// Handle an API response and deserialize JSON
    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let status = response.status();

        if !status.is_success() {
            return Err(Self::error_from(response).await);
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::ParseError(format!("Failed to parse JSON response: {}", e)))
    }

    /// Handle an API response where `204 No Content` means "nothing there"
    async fn handle_optional_response<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<Option<T>> {
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }

        self.handle_response(response).await.map(Some)
    }

    /// Handle an API response that returns no content
    async fn handle_empty_response(&self, response: reqwest::Response) -> Result<()> {
        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        Ok(())
    }

    async fn error_from(response: reqwest::Response) -> ClientError {
        let status = response.status();
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        ClientError::api_error(status.as_u16(), error_text)
    }
}
