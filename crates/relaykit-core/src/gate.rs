//! Readiness gate shared by the reliability controllers.
//!
//! Operations that touch a controller's live index await the gate first:
//! they proceed synchronously once restoration has completed, and suspend
//! on the readiness signal otherwise. The signal fires exactly once per
//! process lifetime; there is no re-initialization.

use std::sync::Mutex;

use tokio::sync::watch;

/// Restore progress of a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// No restore attempted yet.
    Uninitialized,
    /// Restore in flight; restored records are staged, not yet merged.
    Restoring,
    /// Staged records merged, readiness signal fired.
    Ready,
}

/// Tri-state init gate with a one-shot broadcast readiness signal.
#[derive(Debug)]
pub struct InitGate {
    state: Mutex<GateState>,
    ready: watch::Sender<bool>,
}

impl Default for InitGate {
    fn default() -> Self {
        Self::new()
    }
}

impl InitGate {
    /// Create a gate in the `Uninitialized` state.
    #[must_use]
    pub fn new() -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            state: Mutex::new(GateState::Uninitialized),
            ready,
        }
    }

    /// Transition `Uninitialized` -> `Restoring`.
    ///
    /// Returns false when a restore already ran (or is running), in which
    /// case the caller must not restore again.
    pub fn begin_restore(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state == GateState::Uninitialized {
            *state = GateState::Restoring;
            true
        } else {
            false
        }
    }

    /// Transition to `Ready` and fire the readiness signal.
    ///
    /// Releases every current and future waiter; calling it again is a no-op.
    pub fn mark_ready(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == GateState::Ready {
            return;
        }
        *state = GateState::Ready;
        self.ready.send_replace(true);
        tracing::trace!("init gate ready");
    }

    /// Whether the gate has reached `Ready`.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        *self.state.lock().unwrap() == GateState::Ready
    }

    /// Current gate state.
    #[must_use]
    pub fn state(&self) -> GateState {
        *self.state.lock().unwrap()
    }

    /// Suspend until the gate is `Ready`; returns immediately once fired.
    pub async fn wait_ready(&self) {
        if self.is_ready() {
            return;
        }
        let mut rx = self.ready.subscribe();
        // The send side lives in self, so the channel cannot close under us.
        let _ = rx.wait_for(|ready| *ready).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn begin_restore_runs_once() {
        let gate = InitGate::new();
        assert_eq!(gate.state(), GateState::Uninitialized);
        assert!(gate.begin_restore());
        assert_eq!(gate.state(), GateState::Restoring);
        assert!(!gate.begin_restore(), "second restore must be refused");
        gate.mark_ready();
        assert!(!gate.begin_restore(), "no re-initialization after ready");
    }

    #[tokio::test]
    async fn wait_ready_suspends_until_signal() {
        let gate = Arc::new(InitGate::new());
        assert!(gate.begin_restore());

        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.wait_ready().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "waiter must suspend before ready");

        gate.mark_ready();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter released by readiness signal")
            .unwrap();
    }

    #[tokio::test]
    async fn wait_ready_is_immediate_after_signal() {
        let gate = InitGate::new();
        gate.begin_restore();
        gate.mark_ready();
        gate.mark_ready(); // idempotent
        gate.wait_ready().await;
        assert!(gate.is_ready());
    }
}
