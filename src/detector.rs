// Double Reset Detector Module
// Decides once per boot whether the user reset the board twice within the window
// Rejects resets caused by flashing, debugging and firmware upgrades

use core::time::Duration;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

// Import logging macros for debug output
use log::{debug, info, warn};

// Import anyhow for error handling following existing patterns
use anyhow::{anyhow, Result};

use crate::config::{BackendKind, DetectorConfig};
use crate::firmware_identity::{self, FirmwareIdentitySource};
use crate::reset_reason::ResetReasonSource;
use crate::scheduler::{TimerService, TimerSlot};
use crate::state_dump;
use crate::store::{
    commit_logged, erase_detector_keys, remove_logged, Backend, FlashPartition, FlashStore,
    RetainedWord, VolatileStore, ARMED_MAGIC, FIRMWARE_DIRTY_KEY, MAGIC_KEY,
};

const ARM_TIMER_NAME: &str = "drd_arm";
const DISARM_TIMER_NAME: &str = "drd_disarm";

/// Hardware collaborators the detector reads from and drives
pub struct Platform {
    pub reset_reason: Box<dyn ResetReasonSource>,
    pub firmware: Box<dyn FirmwareIdentitySource>,
    pub flash: Box<dyn FlashPartition>,
    pub retained: RetainedWord,
    pub timers: Arc<dyn TimerService>,
}

/// Double reset detector.
///
/// Owns the persistent DRD state of one physical device, so only one
/// instance may exist per process. On hardware use `esp::take()`.
///
/// The first `check_and_clear` of a boot evaluates and caches the verdict;
/// later calls return the cached value.
pub struct DoubleResetDetector {
    state: Arc<Mutex<DetectorState>>,
}

struct DetectorState {
    this: Weak<Mutex<DetectorState>>,
    config: DetectorConfig,
    backend: Backend,
    reset_reason: Box<dyn ResetReasonSource>,
    firmware: Box<dyn FirmwareIdentitySource>,
    partition: Box<dyn FlashPartition>,
    retained: RetainedWord,
    timers: Arc<dyn TimerService>,
    configured: bool,
    evaluated: bool,
    cached_result: bool,
    arm_timer: TimerSlot,
    disarm_timer: TimerSlot,
    arm_window_s: u32,
    firmware_id_dirty: bool,
}

impl DoubleResetDetector {
    pub fn new(config: DetectorConfig, platform: Platform) -> Self {
        let backend = match config.backend {
            BackendKind::Volatile => Backend::Volatile(VolatileStore::new(platform.retained)),
            BackendKind::Flash => Backend::Flash(FlashStore::new(config.namespace.clone())),
        };

        let state = Arc::new_cyclic(|this| {
            Mutex::new(DetectorState {
                this: this.clone(),
                config,
                backend,
                reset_reason: platform.reset_reason,
                firmware: platform.firmware,
                partition: platform.flash,
                retained: platform.retained,
                timers: platform.timers,
                configured: false,
                evaluated: false,
                cached_result: false,
                arm_timer: TimerSlot::new(ARM_TIMER_NAME),
                disarm_timer: TimerSlot::new(DISARM_TIMER_NAME),
                arm_window_s: 0,
                firmware_id_dirty: false,
            })
        });

        Self { state }
    }

    /// Initialize and open the selected backend. Later calls are no-ops.
    ///
    /// A flash failure leaves the detector unable to detect this boot
    /// rather than failing startup.
    pub fn configure(&self) -> Result<()> {
        self.lock().configure()
    }

    /// Evaluate using the configured detection window
    pub fn check_and_clear(&self) -> bool {
        let mut state = self.lock();
        let window_s = state.config.window_seconds;
        state.check_and_clear(window_s)
    }

    /// Evaluate using an explicit detection window in seconds
    pub fn check_and_clear_with_window(&self, window_s: u32) -> bool {
        self.lock().check_and_clear(window_s)
    }

    /// Erase all detector state, or zero the RTC marker
    pub fn clear_flag(&self) {
        self.lock().clear_flag();
    }

    /// Backend in use. May differ from the configured one after a flash fallback.
    pub fn backend_kind(&self) -> BackendKind {
        self.lock().backend.kind()
    }

    pub fn is_evaluated(&self) -> bool {
        self.lock().evaluated
    }

    pub fn config(&self) -> DetectorConfig {
        self.lock().config.clone()
    }

    fn lock(&self) -> MutexGuard<'_, DetectorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for DoubleResetDetector {
    fn drop(&mut self) {
        let mut guard = self.lock();
        let state = &mut *guard;

        state.arm_timer.cancel();
        state.disarm_timer.cancel();

        if let Backend::Flash(flash) = &mut state.backend {
            flash.close();
        }
    }
}

/// Run `f` on the detector state from a timer callback
fn with_state(this: &Weak<Mutex<DetectorState>>, f: fn(&mut DetectorState)) {
    let Some(state) = this.upgrade() else {
        debug!("⏰ DRD timer fired after the detector was dropped");
        return;
    };

    let mut guard = state.lock().unwrap_or_else(PoisonError::into_inner);
    f(&mut guard);
}

impl DetectorState {
    fn configure(&mut self) -> Result<()> {
        if self.configured {
            return Ok(());
        }

        let Backend::Flash(flash) = &mut self.backend else {
            info!("🔧 DRD using RTC backend");
            self.configured = true;
            return Ok(());
        };

        if let Err(e) = self.partition.init() {
            warn!("⚠️ NVS init failed in configure(): {}", e);
        }

        let result = match self.partition.open(flash.namespace()) {
            Ok(handle) => {
                flash.attach(handle);
                info!("🔧 DRD using NVS backend, namespace='{}'", flash.namespace());
                Ok(())
            }
            Err(e) => {
                warn!("⚠️ Failed to open NVS namespace '{}': {}", flash.namespace(), e);
                Err(anyhow!(
                    "Failed to open DRD NVS namespace '{}': {}",
                    flash.namespace(),
                    e
                ))
            }
        };

        self.configured = true;
        result
    }

    fn check_and_clear(&mut self, window_s: u32) -> bool {
        if self.evaluated {
            return self.cached_result;
        }

        self.evaluated = true;
        self.cached_result = false;

        let reason = self.reset_reason.reset_reason();
        let tooling_reset = reason.is_tooling_induced(self.config.suppress_tooling_resets);

        info!("🔌 Reset reason: {}", reason);
        if tooling_reset {
            info!("🛠️ Reset reason indicates tooling activity, DRD arming will be delayed");
        }

        if !self.configured
            && self.configure().is_err()
            && self.backend.kind() == BackendKind::Flash
        {
            warn!("⚠️ DRD configure failed with NVS backend, falling back to RTC behavior");
            self.backend = Backend::Volatile(VolatileStore::new(self.retained));
        }

        let double_reset = match self.backend {
            Backend::Volatile(store) => self.evaluate_volatile(store, tooling_reset, window_s),
            Backend::Flash(_) => self.evaluate_flash(tooling_reset, window_s),
        };

        self.cached_result = double_reset;
        double_reset
    }

    fn evaluate_volatile(&mut self, store: VolatileStore, tooling_reset: bool, window_s: u32) -> bool {
        if tooling_reset {
            store.disarm();
            return false;
        }

        if store.is_armed() {
            info!("🎯 Double reset detected using RTC backend");
            store.disarm();
            return true;
        }

        info!("⏳ Arming RTC double-reset window, window_s={}", window_s);
        store.arm();
        self.schedule_disarm(window_s);
        false
    }

    fn evaluate_flash(&mut self, tooling_reset: bool, window_s: u32) -> bool {
        let Backend::Flash(flash) = &mut self.backend else {
            return false;
        };

        let Some(store) = flash.store_mut() else {
            warn!("⚠️ NVS backend selected but not ready, skipping DRD detection");
            return false;
        };

        state_dump::dump_detector_state(store);

        let current = self.firmware.current_digest();
        if current.is_none() {
            warn!("⚠️ Failed to read app ELF SHA-256, treating firmware as dirty for DRD");
            self.firmware_id_dirty = true;
        }

        let identity = firmware_identity::reconcile(store, current);
        if identity.firmware_changed {
            self.firmware_id_dirty = true;
        }

        let stored_dirty = match store.get_u8(FIRMWARE_DIRTY_KEY) {
            Ok(Some(value)) => value != 0,
            Ok(None) => false,
            Err(e) => {
                warn!("⚠️ Failed to read fw_dirty, assuming dirty: {}", e);
                true
            }
        };
        let firmware_dirty = stored_dirty || self.firmware_id_dirty;

        info!(
            "📋 DRD status: firmware_dirty={}, first_boot_seen={}",
            firmware_dirty, identity.first_boot_seen
        );

        let armed = match store.get_u32(MAGIC_KEY) {
            Ok(value) => value == Some(ARMED_MAGIC),
            Err(e) => {
                warn!("⚠️ Failed to read DRD magic: {}", e);
                false
            }
        };

        if !tooling_reset && !firmware_dirty && armed {
            info!("🎯 Double reset detected using NVS backend");
            self.disarm_timer.cancel();
            remove_logged(store, MAGIC_KEY, "after double reset");
            commit_logged(store, "after double reset");
            return true;
        }

        if firmware_dirty {
            info!(
                "⏳ Firmware dirty for DRD, arming after delay: delay_s={}, window_s={}",
                self.config.arm_delay_seconds, window_s
            );
            self.schedule_arm(window_s);
        } else if tooling_reset {
            info!(
                "🛠️ Tooling reset detected, clearing DRD flag and arming after delay: delay_s={}, window_s={}",
                self.config.arm_delay_seconds, window_s
            );
            remove_logged(store, MAGIC_KEY, "during tooling reset");
            commit_logged(store, "after tooling reset clear");
            self.schedule_arm(window_s);
        } else {
            info!("✅ Firmware clean, arming DRD window: window_s={}", window_s);
            let armed = match store.set_u32(MAGIC_KEY, ARMED_MAGIC) {
                Ok(()) => commit_logged(store, "after arming"),
                Err(e) => {
                    warn!("⚠️ Failed to set DRD magic: {}", e);
                    false
                }
            };

            if armed {
                self.schedule_disarm(window_s);
            }
        }

        false
    }

    fn clear_flag(&mut self) {
        if !self.configured {
            if let Err(e) = self.configure() {
                warn!("⚠️ clear_flag could not configure the DRD backend: {}", e);
            }
        }

        match &mut self.backend {
            Backend::Volatile(store) => {
                store.disarm();
                info!("🧹 RTC double-reset flag cleared");
            }
            Backend::Flash(flash) => match flash.store_mut() {
                Some(store) => {
                    erase_detector_keys(store);
                    info!("🧹 NVS double-reset flag cleared");
                }
                None => warn!("⚠️ clear_flag called but NVS is not ready"),
            },
        }
    }

    fn schedule_arm(&mut self, window_s: u32) {
        self.arm_timer.cancel();
        self.arm_window_s = window_s;

        let delay_s = self.config.arm_delay_seconds;
        if delay_s == 0 {
            self.on_arm_elapsed();
            return;
        }

        let this = self.this.clone();
        self.arm_timer.replace(
            self.timers.as_ref(),
            Duration::from_secs(delay_s.into()),
            Box::new(move || with_state(&this, DetectorState::on_arm_elapsed)),
        );
    }

    fn on_arm_elapsed(&mut self) {
        let window_s = self.arm_window_s;

        let Backend::Flash(flash) = &mut self.backend else {
            warn!("⚠️ DRD arm timer fired but NVS backend is not ready");
            return;
        };

        let Some(store) = flash.store_mut() else {
            warn!("⚠️ DRD arm timer fired but NVS backend is not ready");
            return;
        };

        info!(
            "⏰ DRD arm delay elapsed, marking firmware clean and arming: window_s={}",
            window_s
        );

        if let Err(e) = store.set_u8(FIRMWARE_DIRTY_KEY, 0) {
            warn!("⚠️ Failed to set fw_dirty=0 in arm callback: {}", e);
            return;
        }

        if let Err(e) = store.set_u32(MAGIC_KEY, ARMED_MAGIC) {
            warn!("⚠️ Failed to set DRD magic in arm callback: {}", e);
            return;
        }

        if let Err(e) = store.commit() {
            warn!("⚠️ NVS commit failed in arm callback: {}", e);
            return;
        }

        self.schedule_disarm(window_s);
    }

    fn schedule_disarm(&mut self, window_s: u32) {
        let this = self.this.clone();
        self.disarm_timer.replace(
            self.timers.as_ref(),
            Duration::from_secs(window_s.into()),
            Box::new(move || with_state(&this, DetectorState::on_disarm_elapsed)),
        );
    }

    fn on_disarm_elapsed(&mut self) {
        match &mut self.backend {
            Backend::Volatile(store) => {
                store.disarm();
                info!("⌛ DRD disarm window elapsed, RTC flag cleared");
            }
            Backend::Flash(flash) => {
                let Some(store) = flash.store_mut() else {
                    warn!("⚠️ DRD disarm timer fired but NVS backend is not ready");
                    return;
                };

                remove_logged(store, MAGIC_KEY, "in disarm callback");
                commit_logged(store, "in disarm callback");
                info!("⌛ DRD disarm window elapsed, DRD magic cleared");
            }
        }
    }
}
