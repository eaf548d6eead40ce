//! Expiry countdown for unanswered outbound sessions.
//!
//! A sender that generated a code but never heard from a responder must
//! not hold its relay subscription and peer connection forever. The
//! controller arms a single countdown when the session starts; if it
//! fires, the owning session force-closes and discards its state. The
//! moment the session reaches `Open` the countdown is disarmed for good —
//! an established transfer is never expired out from under the user.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

/// One-shot countdown tied to a session's lifetime.
///
/// Dropping the controller disarms it; `disarm` is idempotent and safe
/// to call from any state.
pub struct ExpiryController {
    task: Option<JoinHandle<()>>,
}

impl ExpiryController {
    /// A controller that will never fire (responder sessions).
    pub fn disarmed() -> Self {
        Self { task: None }
    }

    /// Arm the countdown; `on_expire` runs once if `deadline` elapses
    /// before `disarm` is called.
    pub fn arm<F>(deadline: Duration, on_expire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let task = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            debug!(event = "session_expiry_fired", ?deadline);
            on_expire();
        });
        Self { task: Some(task) }
    }

    pub fn is_armed(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Cancel the countdown. Safe to call repeatedly, and after firing.
    pub fn disarm(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for ExpiryController {
    fn drop(&mut self) {
        self.disarm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn fires_after_deadline() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let _ctl = ExpiryController::arm(Duration::from_secs(600), move || {
            flag.store(true, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(599)).await;
        assert!(!fired.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_prevents_firing() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let mut ctl = ExpiryController::arm(Duration::from_secs(600), move || {
            flag.store(true, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(10)).await;
        ctl.disarm();
        ctl.disarm(); // idempotent

        tokio::time::sleep(Duration::from_secs(1000)).await;
        assert!(!fired.load(Ordering::SeqCst));
        assert!(!ctl.is_armed());
    }

    #[tokio::test]
    async fn disarmed_controller_is_inert() {
        let mut ctl = ExpiryController::disarmed();
        assert!(!ctl.is_armed());
        ctl.disarm();
    }
}
