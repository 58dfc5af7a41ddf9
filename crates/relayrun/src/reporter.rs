//! # Progress Reporter
//!
//! Ships progress snapshots of one execution tree to the client. Handlers
//! mutate the tree as often as they like; the reporter looks at it once per
//! interval and sends a snapshot only when something changed.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::callback;
use crate::callback::CallbackService;
use crate::execution::ExecutionCallback;

pub struct ProgressReporter {
    root: ExecutionCallback,
    callback: CallbackService,
    task: Option<JoinHandle<()>>,
}

impl ProgressReporter {
    /// Starts polling `root` every `interval` on the current runtime.
    pub fn start(root: ExecutionCallback, callback: CallbackService, interval: Duration) -> Self {
        let period = interval.max(Duration::from_millis(1));
        let task = tokio::spawn({
            let root = root.clone();
            let callback = callback.clone();
            async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                // the first tick completes immediately
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if let Err(e) = report(&root, &callback) {
                        debug!(invocation = %callback.invocation_id(), error = %e, "progress reporting stopped");
                        break;
                    }
                }
            }
        });

        Self {
            root,
            callback,
            task: Some(task),
        }
    }

    /// Sends a snapshot now if the tree changed since the last one.
    pub fn flush(&self) -> callback::Result<bool> {
        report(&self.root, &self.callback)
    }

    /// Stops polling, then flushes. Once this returns no further progress
    /// is sent, so the terminal message can follow safely.
    pub async fn stop(mut self) -> callback::Result<bool> {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        self.flush()
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn report(root: &ExecutionCallback, callback: &CallbackService) -> callback::Result<bool> {
    if !root.take_dirty() {
        return Ok(false);
    }
    callback.progress(root.progress())?;
    Ok(true)
}
