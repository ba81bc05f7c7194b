//! Periodic one-line counters report.

use std::time::Duration;

use async_trait::async_trait;
use histwire_task::{StopSignal, Task};

use crate::ProxyState;

const REPORT_INTERVAL: Duration = Duration::from_secs(30);

pub struct ReporterTask {
    pub state: ProxyState,
}

#[async_trait]
impl Task for ReporterTask {
    const NAME: &'static str = "stats reporter";

    async fn run(self, stop_signal: StopSignal) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(REPORT_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // The first tick fires immediately; skip it so the banner
        // isn't followed by an all-zero report.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                () = stop_signal.stopped() => return Ok(()),
            }

            let pool = self.state.pool.stats();
            let forwards = self.state.forward_stats.snapshot();
            let hub = self.state.hub.stats().await;

            info!(
                pool_active = pool.active(),
                pool_idle = pool.idle,
                pool_opened = pool.opened,
                forwarded = forwards.forwarded,
                forward_failures = forwards.failures,
                subscribers = hub.subscribers,
                total_published = hub.total_published,
                total_subscribes = hub.total_subscribes,
                "Proxy counters",
            );
        }
    }
}
