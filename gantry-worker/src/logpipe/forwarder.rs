//! Log buffer forwarder

use anyhow::Result;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::oneshot;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::repository::LogStreamSink;

/// Tails a log buffer and pushes its lines until told to stop
///
/// On stop the remaining bytes are drained, a trailing partial line is
/// pushed as is, and the stream is closed.
pub(super) async fn forward(
    file: File,
    mut sink: Box<dyn LogStreamSink>,
    mut stop: oneshot::Receiver<()>,
    poll_interval: Duration,
    ping_interval: Duration,
    name: String,
) {
    let mut reader = BufReader::new(file);
    let mut pending = Vec::new();
    let mut sent = 0usize;
    let mut last_activity = Instant::now();

    let mut ticker = time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = &mut stop => break,
            _ = ticker.tick() => {
                match drain(&mut reader, &mut pending, sink.as_mut()).await {
                    Ok(0) if last_activity.elapsed() >= ping_interval => {
                        if let Err(e) = sink.ping().await {
                            warn!("Log stream {} lost: {:#}", name, e);
                            return;
                        }
                        last_activity = Instant::now();
                    }
                    Ok(0) => {}
                    Ok(n) => {
                        sent += n;
                        last_activity = Instant::now();
                    }
                    Err(e) => {
                        warn!("Log stream {} lost: {:#}", name, e);
                        return;
                    }
                }
            }
        }
    }

    match drain(&mut reader, &mut pending, sink.as_mut()).await {
        Ok(n) => sent += n,
        Err(e) => {
            warn!("Log stream {} lost while draining: {:#}", name, e);
            return;
        }
    }

    if let Some(line) = complete_line(&pending) {
        match sink.send_line(&line).await {
            Ok(()) => sent += 1,
            Err(e) => warn!("Log stream {} lost while draining: {:#}", name, e),
        }
    }

    if let Err(e) = sink.close().await {
        debug!("Log stream {} did not close cleanly: {:#}", name, e);
    }

    debug!("Log stream {} closed after {} lines", name, sent);
}

/// Pushes every complete line available in the buffer
///
/// A trailing line without its newline stays in `pending` until the rest of
/// it is written.
async fn drain(
    reader: &mut BufReader<File>,
    pending: &mut Vec<u8>,
    sink: &mut dyn LogStreamSink,
) -> Result<usize> {
    let mut sent = 0;

    loop {
        let read = reader.read_until(b'\n', pending).await?;
        if read == 0 || pending.last() != Some(&b'\n') {
            return Ok(sent);
        }

        if let Some(line) = complete_line(pending) {
            sink.send_line(&line).await?;
            sent += 1;
        }
        pending.clear();
    }
}

/// Decodes a buffered line, `None` when nothing but line endings is left
fn complete_line(bytes: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(bytes);
    let line = line.trim_end_matches(['\n', '\r']);
    if line.is_empty() {
        None
    } else {
        Some(line.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complete_line() {
        assert_eq!(complete_line(b"hello\r\n"), Some("hello".to_string()));
        assert_eq!(complete_line(b"\n"), None);
        assert_eq!(complete_line(b""), None);
        assert_eq!(complete_line(b"caf\xe9\n"), Some("caf\u{fffd}".to_string()));
    }
}
