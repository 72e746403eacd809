// ESP-IDF Platform Module
// Binds the detector to the real chip: reset cause, app descriptor, RTC memory, NVS, esp_timer
// Provides the one canonical detector instance for the device

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

// Import ESP-IDF system bindings
use esp_idf_svc::sys;

// Import logging macros for debug output
use log::info;

// Import anyhow for error handling following existing patterns
use anyhow::{bail, Result};

use crate::config::DetectorConfig;
use crate::detector::{DoubleResetDetector, Platform};
use crate::firmware_identity::{FirmwareDigest, FirmwareIdentitySource};
use crate::reset_reason::{ResetReason, ResetReasonSource};
use crate::store::RetainedWord;

mod nvs;
mod timer;

pub use nvs::EspFlashPartition;
pub use timer::EspDeferredTimers;

// RTC slow memory survives soft and pin resets, but not power loss
#[link_section = ".rtc.data"]
static RTC_MAGIC: AtomicU32 = AtomicU32::new(0);

// Set once the detector for this device has been handed out
static DETECTOR_TAKEN: AtomicBool = AtomicBool::new(false);

/// Reset cause reported by `esp_reset_reason()`
pub struct EspResetReason;

impl ResetReasonSource for EspResetReason {
    fn reset_reason(&self) -> ResetReason {
        from_raw(unsafe { sys::esp_reset_reason() })
    }
}

fn from_raw(raw: sys::esp_reset_reason_t) -> ResetReason {
    match raw {
        sys::esp_reset_reason_t_ESP_RST_POWERON => ResetReason::PowerOn,
        sys::esp_reset_reason_t_ESP_RST_EXT => ResetReason::ExternalPin,
        sys::esp_reset_reason_t_ESP_RST_SW => ResetReason::Software,
        sys::esp_reset_reason_t_ESP_RST_PANIC => ResetReason::Panic,
        sys::esp_reset_reason_t_ESP_RST_INT_WDT => ResetReason::InterruptWatchdog,
        sys::esp_reset_reason_t_ESP_RST_TASK_WDT => ResetReason::TaskWatchdog,
        sys::esp_reset_reason_t_ESP_RST_WDT => ResetReason::OtherWatchdog,
        sys::esp_reset_reason_t_ESP_RST_DEEPSLEEP => ResetReason::DeepSleepWake,
        sys::esp_reset_reason_t_ESP_RST_BROWNOUT => ResetReason::Brownout,
        sys::esp_reset_reason_t_ESP_RST_SDIO => ResetReason::PeripheralBus,
        sys::esp_reset_reason_t_ESP_RST_USB => ResetReason::Usb,
        sys::esp_reset_reason_t_ESP_RST_JTAG => ResetReason::Jtag,
        _ => ResetReason::Unknown,
    }
}

/// ELF SHA-256 embedded in the running image's app descriptor
pub struct EspAppDescriptor;

impl FirmwareIdentitySource for EspAppDescriptor {
    fn current_digest(&self) -> Option<FirmwareDigest> {
        let app = unsafe { sys::esp_app_get_description() };
        if app.is_null() {
            return None;
        }

        Some(FirmwareDigest::new(unsafe { (*app).app_elf_sha256 }))
    }
}

/// Take the device's detector, taking the default NVS partition on configure
pub fn take(config: DetectorConfig) -> Result<DoubleResetDetector> {
    take_with_partition(config, EspFlashPartition::new())
}

/// Take the device's detector using an NVS partition the application already owns
pub fn take_with_partition(
    config: DetectorConfig,
    partition: EspFlashPartition,
) -> Result<DoubleResetDetector> {
    if DETECTOR_TAKEN.swap(true, Ordering::SeqCst) {
        bail!("Double reset detector already taken");
    }

    let timers = match EspDeferredTimers::new() {
        Ok(timers) => timers,
        Err(e) => {
            DETECTOR_TAKEN.store(false, Ordering::SeqCst);
            return Err(e);
        }
    };

    info!("🔧 Double reset detector created: backend={:?}", config.backend);

    Ok(DoubleResetDetector::new(
        config,
        Platform {
            reset_reason: Box::new(EspResetReason),
            firmware: Box::new(EspAppDescriptor),
            flash: Box::new(partition),
            retained: RetainedWord::new(&RTC_MAGIC),
            timers: Arc::new(timers),
        },
    ))
}
