//! Periodic heartbeat timer.
//!
//! The timer task only signals ticks; the session loop builds the heartbeat
//! frame itself when a tick arrives, so the sequence number it carries is
//! always read from the same place frames are decoded.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

/// A running heartbeat timer; aborted when dropped
#[derive(Debug)]
pub struct Heartbeat {
    interval: Duration,
    handle: JoinHandle<()>,
    ticks: mpsc::UnboundedReceiver<Instant>,
}

impl Heartbeat {
    /// Start ticking every `interval`, first tick one interval from now
    pub fn start(interval: Duration) -> Self {
        let (tx, ticks) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // Skip the immediate first tick
            ticker.tick().await;
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            debug!(?interval, "Heartbeat task started");
            loop {
                let at = ticker.tick().await;
                if tx.send(at).is_err() {
                    break;
                }
            }
            debug!("Heartbeat task exiting");
        });

        Self {
            interval,
            handle,
            ticks,
        }
    }

    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait for the next tick
    pub async fn tick(&mut self) -> Option<Instant> {
        self.ticks.recv().await
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Next tick of an optional heartbeat; pends forever when none is running
pub async fn next_tick(heartbeat: &mut Option<Heartbeat>) -> Option<Instant> {
    match heartbeat {
        Some(hb) => hb.tick().await,
        None => std::future::pending().await,
    }
}
