//! Local socket listener and per-connection dispatch.

use std::os::unix::fs::PermissionsExt as _;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context as _;
use async_trait::async_trait;
use camino::Utf8Path;
use histwire_task::{StopSignal, Task};
use tokio::net::{UnixListener, UnixStream};
use tracing::Instrument as _;

use crate::ProxyState;
use crate::classify::{FirstLine, classify};
use crate::io::{LineError, LineReader};

/// Owner-only: the socket is the only authentication layer local
/// clients get.
const SOCKET_MODE: u32 = 0o600;

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(0);

pub struct ProxyListener {
    listener: UnixListener,
    state: ProxyState,
}

impl ProxyListener {
    /// Removes any stale socket file, binds a fresh listener and
    /// restricts it to the owner.
    pub fn init_and_bind(path: &Utf8Path, state: ProxyState) -> anyhow::Result<Self> {
        info!(%path, "Initiating listener…");

        match std::fs::remove_file(path) {
            Ok(()) => debug!(%path, "Removed stale socket file"),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => {
                return Err(error).with_context(|| format!("couldn't remove stale socket file at {path}"));
            }
        }

        let listener = UnixListener::bind(path).with_context(|| format!("failed to bind {path}"))?;

        std::fs::set_permissions(path, std::fs::Permissions::from_mode(SOCKET_MODE))
            .with_context(|| format!("failed to restrict permissions on {path}"))?;

        info!(%path, "Listener started successfully");

        Ok(Self { listener, state })
    }

    async fn accept_loop(self) -> anyhow::Result<()> {
        loop {
            match self.listener.accept().await.context("failed to accept connection") {
                Ok((stream, _)) => {
                    let state = self.state.clone();
                    let peer = NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed);

                    tokio::spawn(
                        async move {
                            if let Err(e) = handle_peer(stream, state).await {
                                error!(error = format!("{e:#}"), "Peer failure");
                            }
                        }
                        .instrument(info_span!("peer", id = peer)),
                    );
                }
                Err(e) => error!(error = format!("{e:#}"), "Listener failure"),
            }
        }
    }
}

#[async_trait]
impl Task for ProxyListener {
    const NAME: &'static str = "socket listener";

    async fn run(self, stop_signal: StopSignal) -> anyhow::Result<()> {
        tokio::select! {
            result = self.accept_loop() => result,
            () = stop_signal.stopped() => Ok(()),
        }
    }
}

async fn handle_peer(stream: UnixStream, state: ProxyState) -> anyhow::Result<()> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = LineReader::new(read_half);

    let first = match reader.next_line().await {
        Ok(Some(line)) => line,
        Ok(None) => {
            trace!("Peer connected and left without a word");
            return Ok(());
        }
        Err(LineError::TooLong) => {
            debug!("First line exceeds the read buffer, closing");
            return Ok(());
        }
        Err(LineError::Io(error)) => {
            debug!(%error, "Couldn't read the first line");
            return Ok(());
        }
    };

    // The classification is final: the connection belongs to the
    // chosen handler until it closes.
    match classify(first) {
        Ok(FirstLine::Request(request_line)) => {
            let mut write_half = write_half;
            state.search.handle(request_line, &mut reader, &mut write_half).await
        }
        Ok(FirstLine::Subscribe(sub)) => crate::subscriber::handle(sub, reader, write_half, state).await,
        Ok(FirstLine::Ingest(record)) => crate::ingest::handle(record, reader, state).await,
        Err(error) => {
            debug!(%error, "Unusable first line, closing");
            Ok(())
        }
    }
}
