use core::time::Duration;

// Import ESP-IDF high resolution timer service
use esp_idf_svc::timer::{EspTaskTimerService, EspTimer};

// Import logging macros for debug output
use log::debug;

// Import anyhow for error handling following existing patterns
use anyhow::{anyhow, Result};

use crate::scheduler::{PendingTimer, TimerCallback, TimerService};

/// One-shot callbacks dispatched from the esp_timer task
pub struct EspDeferredTimers {
    service: EspTaskTimerService,
}

impl EspDeferredTimers {
    pub fn new() -> Result<Self> {
        let service = EspTaskTimerService::new()
            .map_err(|e| anyhow!("Failed to create esp_timer service: {}", e))?;
        Ok(Self { service })
    }
}

impl TimerService for EspDeferredTimers {
    fn schedule(
        &self,
        name: &'static str,
        delay: Duration,
        callback: TimerCallback,
    ) -> Result<Box<dyn PendingTimer>> {
        let mut callback = Some(callback);
        let timer = self
            .service
            .timer(move || {
                if let Some(callback) = callback.take() {
                    callback();
                }
            })
            .map_err(|e| anyhow!("esp_timer_create({}) failed: {}", name, e))?;

        timer
            .after(delay)
            .map_err(|e| anyhow!("esp_timer_start_once({}) failed: {}", name, e))?;

        debug!("⏱️ Timer '{}' started: {:?}", name, delay);
        Ok(Box::new(EspPendingTimer { name, timer }))
    }
}

/// Dropping the inner `EspTimer` stops and deletes it
struct EspPendingTimer {
    name: &'static str,
    timer: EspTimer<'static>,
}

impl PendingTimer for EspPendingTimer {
    fn cancel(&mut self) -> Result<bool> {
        self.timer
            .cancel()
            .map_err(|e| anyhow!("esp_timer_stop({}) failed: {}", self.name, e))
    }
}
