#[macro_use]
extern crate tracing;

pub mod classify;
pub mod config;
pub mod hub;
pub mod ingest;
pub mod io;
pub mod listener;
pub mod pool;
pub mod report;
pub mod search;
pub mod subscriber;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use histwire_task::{StopSignal, TaskSet};

use crate::config::Conf;
use crate::hub::Hub;
use crate::ingest::ForwardStats;
use crate::pool::Pool;
use crate::search::SearchClient;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Everything a connection handler needs, cheap to clone.
#[derive(Clone)]
pub struct ProxyState {
    pub conf: Arc<Conf>,
    pub pool: Arc<Pool>,
    pub hub: Arc<Hub>,
    pub forward_stats: Arc<ForwardStats>,
    pub search: Arc<SearchClient>,
    pub stop_signal: StopSignal,
}

/// Runs the proxy until `until` resolves, then shuts down in order:
/// signal the tasks (listener stops accepting, handlers drain), close
/// the pool, remove the socket file.
///
/// The pool is closed only after the tasks are done so that a handler
/// releasing a borrowed connection never races the pool teardown.
pub async fn serve(state: ProxyState, mut tasks: TaskSet, until: impl Future<Output = ()>) -> anyhow::Result<()> {
    let socket_path = state.conf.socket_path.clone();

    let listener =
        listener::ProxyListener::init_and_bind(&socket_path, state.clone()).context("failed to set up local socket")?;

    tasks.register(listener);
    tasks.register(report::ReporterTask { state: state.clone() });

    info!(
        socket = %socket_path,
        ingest = %state.conf.ingest.addr(),
        search = %state.conf.search.addr(),
        debug = state.conf.debug,
        "histwire proxy started",
    );

    until.await;

    info!("Shutting down");

    tasks.shutdown(SHUTDOWN_GRACE).await;

    state.pool.close();

    if let Err(error) = std::fs::remove_file(&socket_path) {
        warn!(%error, path = %socket_path, "Couldn’t remove the socket file");
    }

    Ok(())
}
