//! Session timer – one-second ticks driving the elapsed-time display.
//!
//! Elapsed time is recomputed from the start instant on every tick rather
//! than counted, so a late tick never makes the display drift.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use crate::feedback::Feedback;

const TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct TimerShared {
    ticking: bool,
    elapsed_secs: u64,
}

pub struct SessionTimer {
    shared: Arc<Mutex<TimerShared>>,
    feedback: Feedback,
    task: Option<JoinHandle<()>>,
}

impl SessionTimer {
    pub fn new(feedback: Feedback) -> Self {
        Self {
            shared: Arc::default(),
            feedback,
            task: None,
        }
    }

    /// Start ticking from now.  Restarting an active timer resets it.
    pub fn start(&mut self) {
        self.stop();
        let started = Instant::now();
        {
            let mut shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
            shared.ticking = true;
            shared.elapsed_secs = 0;
        }
        self.feedback.set_elapsed(0);

        let shared = Arc::clone(&self.shared);
        let feedback = self.feedback.clone();
        self.task = Some(tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(started + TICK, TICK);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticks.tick().await;
                let mut state = shared.lock().unwrap_or_else(|e| e.into_inner());
                if !state.ticking {
                    break;
                }
                state.elapsed_secs = started.elapsed().as_secs();
                // Display is updated under the same lock `stop` takes.
                feedback.set_elapsed(state.elapsed_secs);
            }
        }));
        debug!("Session timer started");
    }

    /// Cancel the tick.  No display update happens after this returns.
    pub fn stop(&mut self) {
        self.shared.lock().unwrap_or_else(|e| e.into_inner()).ticking = false;
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("Session timer stopped");
        }
    }

    #[cfg(test)]
    pub fn elapsed_secs(&self) -> u64 {
        self.shared.lock().unwrap_or_else(|e| e.into_inner()).elapsed_secs
    }

    /// Read the elapsed value for the finished take and reset it for the
    /// next session.  The display keeps showing the last value.
    pub fn take_elapsed(&mut self) -> u64 {
        std::mem::take(&mut self.shared.lock().unwrap_or_else(|e| e.into_inner()).elapsed_secs)
    }
}

impl Drop for SessionTimer {
    fn drop(&mut self) {
        self.stop();
    }
}
