//! Ingestion path: newline-delimited event records from a local
//! producer, forwarded to the log-ingestion pool and teed into the
//! hub.
//!
//! Nothing on this path closes the connection except the client
//! itself: malformed records are skipped, a dead downstream only
//! costs the forward. Local subscribers stay live even when the
//! downstream is down.

use std::time::Duration;

use bytes::Bytes;
use histwire_event::Event;
use tokio::io::{AsyncRead, AsyncWriteExt as _};

use crate::ProxyState;
use crate::io::{LineError, LineReader};

const FORWARD_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardCounters {
    pub forwarded: u64,
    pub failures: u64,
}

pub struct ForwardStats(parking_lot::Mutex<ForwardCounters>);

impl ForwardStats {
    pub fn new() -> Self {
        Self(parking_lot::Mutex::new(ForwardCounters::default()))
    }

    fn record_success(&self) {
        self.0.lock().forwarded += 1;
    }

    fn record_failure(&self) {
        self.0.lock().failures += 1;
    }

    pub fn snapshot(&self) -> ForwardCounters {
        *self.0.lock()
    }
}

impl Default for ForwardStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Consumes records until EOF. `first` is the line the classifier
/// already read.
pub async fn handle<R>(first: Bytes, mut reader: LineReader<R>, state: ProxyState) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
{
    let stop_signal = state.stop_signal.clone();

    process_record(&first, &state).await;

    loop {
        let line = tokio::select! {
            line = reader.next_line() => line,
            () = stop_signal.stopped() => return Ok(()),
        };

        match line {
            Ok(Some(record)) => process_record(&record, &state).await,
            Ok(None) => return Ok(()),
            Err(LineError::TooLong) => {
                debug!("Oversized record, closing the ingestion connection");
                return Ok(());
            }
            Err(LineError::Io(error)) => {
                debug!(%error, "Ingestion connection failed");
                return Ok(());
            }
        }
    }
}

async fn process_record(record: &Bytes, state: &ProxyState) {
    if record.is_empty() {
        return;
    }

    if let Err(error) = Event::decode_line(record) {
        debug!(%error, "Skipping malformed record");
        return;
    }

    forward(record, state).await;

    // Published even when the forward failed.
    state.hub.publish(record).await;
}

async fn forward(record: &Bytes, state: &ProxyState) {
    let mut handle = match state.pool.acquire().await {
        Ok(handle) => handle,
        Err(error) => {
            debug!(%error, "No downstream connection, dropping the forward");
            state.forward_stats.record_failure();
            return;
        }
    };

    let written = tokio::time::timeout(FORWARD_DEADLINE, async {
        handle.write_all(record).await?;
        handle.write_all(b"\n").await?;
        handle.flush().await
    })
    .await;

    match written {
        Ok(Ok(())) => {
            state.pool.release(handle, true);
            state.forward_stats.record_success();
        }
        Ok(Err(error)) => {
            debug!(%error, "Forward failed");
            state.pool.release(handle, false);
            state.forward_stats.record_failure();
        }
        Err(_elapsed) => {
            debug!("Forward deadline elapsed");
            state.pool.release(handle, false);
            state.forward_stats.record_failure();
        }
    }
}
