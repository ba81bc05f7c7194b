use std::sync::Arc;

use anyhow::Context as _;
use histwire_proxy::config::Conf;
use histwire_proxy::hub::Hub;
use histwire_proxy::ingest::ForwardStats;
use histwire_proxy::pool::{Pool, PoolConfig, TlsDial};
use histwire_proxy::search::SearchClient;
use histwire_proxy::{ProxyState, serve};
use histwire_task::TaskSet;
use tap::Pipe as _;

pub(crate) async fn run(conf: Conf) -> anyhow::Result<()> {
    // TLS material is loaded before the listener binds: bad
    // certificates must fail the startup, not the first forward.
    let ingest_connector =
        histwire_tls::build_client_connector(&conf.tls_files).context("log-ingestion TLS material")?;

    let dialer = TlsDial {
        addr: conf.ingest.addr(),
        server_name: conf.ingest.host.clone(),
        connector: ingest_connector,
    };

    let pool_config = PoolConfig {
        capacity: conf.pool_capacity,
        ..PoolConfig::default()
    };

    let search = SearchClient::from_conf(&conf)
        .context("search service client")?
        .pipe(Arc::new);

    let tasks = TaskSet::new();

    let state = ProxyState {
        conf: Arc::new(conf),
        pool: Pool::new(Arc::new(dialer), pool_config).pipe(Arc::new),
        hub: Hub::new().pipe(Arc::new),
        forward_stats: ForwardStats::new().pipe(Arc::new),
        search,
        stop_signal: tasks.stop_signal(),
    };

    serve(state, tasks, async {
        if let Err(error) = wait_for_signal().await {
            error!(error = format!("{error:#}"), "Signal stream failed");
        }
    })
    .await
}

async fn wait_for_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate_signal = signal(SignalKind::terminate()).context("failed to create terminate signal stream")?;
    let mut quit_signal = signal(SignalKind::quit()).context("failed to create quit signal stream")?;
    let mut interrupt_signal = signal(SignalKind::interrupt()).context("failed to create interrupt signal stream")?;

    futures::future::select_all(vec![
        Box::pin(terminate_signal.recv()),
        Box::pin(quit_signal.recv()),
        Box::pin(interrupt_signal.recv()),
    ])
    .await;

    Ok(())
}
