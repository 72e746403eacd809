// Timer Scheduling Module
// One-shot deferred callbacks used to arm and disarm the double reset window

use core::time::Duration;

// Import logging macros for debug output
use log::{debug, warn};

// Import anyhow for error handling following existing patterns
use anyhow::Result;

pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// Deferred one-shot callback service.
///
/// Callbacks run on the service's own execution context, never inside
/// `schedule`.
pub trait TimerService: Send + Sync {
    fn schedule(
        &self,
        name: &'static str,
        delay: Duration,
        callback: TimerCallback,
    ) -> Result<Box<dyn PendingTimer>>;
}

/// Handle to a scheduled callback. Dropping the handle deletes the timer.
pub trait PendingTimer: Send {
    /// Stop the timer. `Ok(false)` when it had already fired or been stopped.
    fn cancel(&mut self) -> Result<bool>;
}

/// Holds at most one live timer of a given role
pub struct TimerSlot {
    name: &'static str,
    timer: Option<Box<dyn PendingTimer>>,
}

impl TimerSlot {
    pub const fn new(name: &'static str) -> Self {
        Self { name, timer: None }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_occupied(&self) -> bool {
        self.timer.is_some()
    }

    /// Stop then delete the current timer, if any
    pub fn cancel(&mut self) {
        let Some(mut timer) = self.timer.take() else {
            return;
        };

        match timer.cancel() {
            Ok(true) => debug!("⏹️ Cancelled pending {} timer", self.name),
            Ok(false) => debug!("⏹️ {} timer was already stopped", self.name),
            Err(e) => warn!("⚠️ Failed to stop {} timer: {}", self.name, e),
        }
    }

    /// Cancel any previous timer and schedule `callback` after `delay`.
    ///
    /// Returns false when the timer service refused; the slot is then empty.
    pub fn replace(
        &mut self,
        service: &dyn TimerService,
        delay: Duration,
        callback: TimerCallback,
    ) -> bool {
        self.cancel();

        match service.schedule(self.name, delay, callback) {
            Ok(timer) => {
                self.timer = Some(timer);
                true
            }
            Err(e) => {
                warn!("⚠️ Failed to start {} timer: {}", self.name, e);
                false
            }
        }
    }
}

impl Drop for TimerSlot {
    fn drop(&mut self) {
        self.cancel();
    }
}
