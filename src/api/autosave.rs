//! Purpose: Periodic background saves of every open document in a `Lapis` context.
//! Exports: `AutosaveHandle`.
//! Role: Heartbeat that keeps session locks fresh while documents stay open.
//! Notes: Dropping the handle stops the loop; an in-flight save cycle still completes.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use super::config::Lapis;

pub struct AutosaveHandle {
    task: Option<JoinHandle<()>>,
}

impl AutosaveHandle {
    pub fn stop(mut self) {
        self.abort();
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for AutosaveHandle {
    fn drop(&mut self) {
        self.abort();
    }
}

impl Lapis {
    /// Saves all open documents every `interval`, starting one interval from now.
    /// Keep `interval` well under `Config::lock_expire` so locks never look abandoned.
    pub fn start_autosave(&self, interval: Duration) -> AutosaveHandle {
        let lapis = self.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match lapis.save_all().await {
                    Ok(saved) => info!(saved, "autosave finished"),
                    Err(err) => warn!(error = %err, "autosave failed"),
                }
            }
        });
        AutosaveHandle { task: Some(task) }
    }
}
