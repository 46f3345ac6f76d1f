//! Heartbeat pulse fan-out driving the periodic maintenance sweeps.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Pulses carry no payload and are cheap to drop on lag.
const PULSE_CHANNEL_CAPACITY: usize = 16;

/// Recurring pulse source consumed by the publisher and expirer sweeps.
///
/// Each subscriber gets an independent receiver, so one subscriber's sweep
/// cannot block or delay another's.
#[derive(Debug)]
pub struct Heartbeat {
    pulses: broadcast::Sender<()>,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

impl Heartbeat {
    /// Create a heartbeat with no ticker attached.
    #[must_use]
    pub fn new() -> Self {
        let (pulses, _) = broadcast::channel(PULSE_CHANNEL_CAPACITY);
        Self { pulses }
    }

    /// Get an independent pulse receiver.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.pulses.subscribe()
    }

    /// Emit a single pulse now.
    pub fn pulse(&self) {
        let _ = self.pulses.send(());
    }

    /// Spawn a task emitting a pulse every `interval`.
    pub fn spawn_ticker(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let heartbeat = Arc::clone(self);
        tracing::debug!(?interval, "starting heartbeat ticker");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately; skip it so pulses start
            // one full interval after spawn.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                heartbeat.pulse();
            }
        })
    }
}
