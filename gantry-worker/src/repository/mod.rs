//! Repository layer
//!
//! Repositories abstract communication with the controller: the event
//! lifecycle over HTTP and the per-stage log streams over WebSocket.
//!
//! All repositories are trait-based so the stage manager can be exercised
//! against in-memory fakes.

mod events;
mod log_stream;

// Re-export traits
pub use events::{EventRepository, is_event_gone};
pub use log_stream::{LogStreamConnector, LogStreamSink};

// Re-export implementations
pub use events::HttpEventRepository;
pub use log_stream::WsLogStreamConnector;
