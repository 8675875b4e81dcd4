use std::future::Future;
use std::time::Duration;

use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::client::api::ClientError;

#[derive(Debug, Clone, Copy)]
pub struct PollConfig {
    /// Session list refresh.
    pub list_interval: Duration,
    /// Message refresh for the chat currently on screen.
    pub message_interval: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            list_interval: Duration::from_secs(10),
            message_interval: Duration::from_secs(3),
        }
    }
}

/// Returned by a tick handler to keep polling or end the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickControl {
    Continue,
    Stop,
}

/// A fixed-interval fetch loop running as its own task.
///
/// Ticks run strictly one after another: a fetch that outlives its interval
/// swallows the ticks it missed instead of queueing them. Stopping aborts the
/// task, including a fetch in flight, and may be called any number of times.
pub struct Poller {
    name: &'static str,
    task: Option<JoinHandle<()>>,
}

impl Poller {
    pub fn new(name: &'static str) -> Self {
        Self { name, task: None }
    }

    /// Starts polling, replacing any loop this poller was already running.
    pub fn start<T, F, Fut, H>(&mut self, every: Duration, mut fetch: F, mut on_tick: H)
    where
        T: Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, ClientError>> + Send + 'static,
        H: FnMut(Result<T, ClientError>) -> TickControl + Send + 'static,
    {
        self.stop();

        let name = self.name;
        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                let result = fetch().await;
                if on_tick(result) == TickControl::Stop {
                    debug!(poller = name, "Poll loop finished");
                    break;
                }
            }
        }));
        debug!(poller = name, every_ms = every.as_millis() as u64, "Poll loop started");
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!(poller = self.name, "Poll loop stopped");
        }
    }

    /// Lets another task end the current loop without owning the poller.
    pub fn abort_handle(&self) -> Option<AbortHandle> {
        self.task.as_ref().map(JoinHandle::abort_handle)
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.stop();
    }
}
