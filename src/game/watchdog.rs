//! Spawn Watchdog
//!
//! Every freshly admitted player gets a timer: if the client has not
//! confirmed character spawn before the window elapses, the timer fires and
//! the player is removed. Confirming spawn, leaving, or dropping the player
//! cancels the timer.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Default window before an unconfirmed spawn is abandoned.
pub const SPAWN_TIMEOUT: Duration = Duration::from_secs(10);

/// One player's spawn timer. Arming replaces any previous timer.
#[derive(Debug, Default)]
pub struct SpawnWatchdog {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SpawnWatchdog {
    /// Create an unarmed watchdog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer: after `window`, run `on_expire`. Any previously armed
    /// timer is cancelled first.
    pub fn arm<F>(&self, window: Duration, on_expire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            on_expire.await;
        });
        let mut slot = self.handle.lock().expect("watchdog lock poisoned");
        if let Some(prev) = slot.replace(task) {
            prev.abort();
        }
    }

    /// Cancel the timer if armed. Idempotent.
    pub fn cancel(&self) {
        let mut slot = self.handle.lock().expect("watchdog lock poisoned");
        if let Some(task) = slot.take() {
            task.abort();
        }
    }

    /// Whether a timer is currently armed.
    pub fn is_armed(&self) -> bool {
        self.handle
            .lock()
            .expect("watchdog lock poisoned")
            .is_some()
    }
}

impl Drop for SpawnWatchdog {
    fn drop(&mut self) {
        self.cancel();
    }
}
