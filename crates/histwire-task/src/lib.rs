//! Task plumbing for the histwire daemons.
//!
//! A [`TaskSet`] owns every long-running task of a process (listener,
//! reporters) and wires them all to one stop signal. Shutdown is a
//! single call: broadcast the signal, then join the tasks under a
//! shared deadline, aborting whatever ignores it. Registered tasks
//! never outlive the set.

#[macro_use]
extern crate tracing;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// A long-running unit of work owned by a [`TaskSet`].
///
/// Implementations treat a fired [`StopSignal`] as a clean exit, not
/// an error.
#[async_trait]
pub trait Task: Send {
    const NAME: &'static str;

    async fn run(self, stop_signal: StopSignal) -> anyhow::Result<()>;
}

/// Passive side of the stop broadcast. Cheap to clone; every clone
/// observes the same signal.
#[derive(Clone, Debug)]
pub struct StopSignal(watch::Receiver<bool>);

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once the owning [`TaskSet`] begins shutting down. A
    /// set that is already gone counts as stopped.
    pub async fn stopped(&self) {
        let mut rx = self.0.clone();
        let _ = rx.wait_for(|&stopped| stopped).await;
    }
}

struct RunningTask {
    name: &'static str,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl Drop for RunningTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Registry of a process's long-running tasks, sharing one stop signal.
pub struct TaskSet {
    children: Vec<RunningTask>,
    stop_tx: watch::Sender<bool>,
    signal: StopSignal,
}

impl TaskSet {
    pub fn new() -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);

        Self {
            children: Vec::new(),
            stop_tx,
            signal: StopSignal(stop_rx),
        }
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.signal.clone()
    }

    pub fn register<T>(&mut self, task: T)
    where
        T: Task + 'static,
    {
        let handle = tokio::spawn(task.run(self.signal.clone()));

        self.children.push(RunningTask { name: T::NAME, handle });
    }

    /// Broadcasts the stop signal, then joins every registered task.
    ///
    /// `grace` bounds the whole join, not each task: whatever hasn't
    /// finished when the deadline passes is aborted. Outcomes are
    /// logged per task.
    pub async fn shutdown(mut self, grace: Duration) {
        let _ = self.stop_tx.send(true);

        let deadline = tokio::time::Instant::now() + grace;

        for mut task in self.children.drain(..) {
            match tokio::time::timeout_at(deadline, &mut task.handle).await {
                Ok(Ok(Ok(()))) => debug!(task = task.name, "Task stopped cleanly"),
                Ok(Ok(Err(error))) => error!(task = task.name, error = format!("{error:#}"), "Task failed"),
                Ok(Err(join_error)) => error!(task = task.name, %join_error, "Task panicked"),
                // Dropping the straggler aborts it.
                Err(_elapsed) => warn!(task = task.name, "Task ignored the stop signal, aborting"),
            }
        }
    }
}

impl Default for TaskSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NotifiesOnStop(tokio::sync::oneshot::Sender<()>);

    #[async_trait]
    impl Task for NotifiesOnStop {
        const NAME: &'static str = "notifies on stop";

        async fn run(self, stop_signal: StopSignal) -> anyhow::Result<()> {
            stop_signal.stopped().await;
            let _ = self.0.send(());
            Ok(())
        }
    }

    struct Stubborn;

    #[async_trait]
    impl Task for Stubborn {
        const NAME: &'static str = "stubborn";

        async fn run(self, _stop_signal: StopSignal) -> anyhow::Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn registered_tasks_observe_the_stop_signal() {
        let (tx, rx) = tokio::sync::oneshot::channel();

        let mut tasks = TaskSet::new();
        tasks.register(NotifiesOnStop(tx));

        tokio::time::timeout(Duration::from_secs(1), tasks.shutdown(Duration::from_secs(5)))
            .await
            .expect("shutdown completes well before the grace period");

        rx.await.expect("the task saw the stop signal before exiting");
    }

    #[tokio::test]
    async fn stragglers_are_aborted_at_the_deadline() {
        let mut tasks = TaskSet::new();
        tasks.register(Stubborn);

        tokio::time::timeout(Duration::from_secs(1), tasks.shutdown(Duration::from_millis(50)))
            .await
            .expect("the deadline bounds the join");
    }

    #[tokio::test]
    async fn stop_signal_is_sticky() {
        let tasks = TaskSet::new();
        let signal = tasks.stop_signal();

        assert!(!signal.is_stopped());

        tasks.shutdown(Duration::from_millis(10)).await;

        assert!(signal.is_stopped());

        // Resolves immediately, even though the set is gone.
        tokio::time::timeout(Duration::from_millis(100), signal.stopped())
            .await
            .expect("stopped() resolves after shutdown");
    }

    #[tokio::test]
    async fn dropping_the_set_aborts_its_tasks() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        struct HoldsSender(tokio::sync::oneshot::Sender<()>);

        #[async_trait]
        impl Task for HoldsSender {
            const NAME: &'static str = "holds sender";

            async fn run(self, _stop_signal: StopSignal) -> anyhow::Result<()> {
                std::future::pending::<()>().await;
                drop(self.0);
                Ok(())
            }
        }

        let mut tasks = TaskSet::new();
        tasks.register(HoldsSender(tx));

        drop(tasks);

        // The sender drops when the aborted task is torn down.
        rx.await.expect_err("task was aborted with its set");
    }
}
