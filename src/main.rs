// Import logging macros for debug output
use log::{info, warn};

// Import anyhow for error handling following existing patterns
use anyhow::Result;

use pup_drd::DetectorConfig;

#[cfg(target_os = "espidf")]
fn main() -> Result<()> {
    // It is necessary to call this function once. Otherwise some patches to the runtime
    // implemented by esp-idf-sys might not link properly. See https://github.com/esp-rs/esp-idf-template/issues/71
    esp_idf_svc::sys::link_patches();

    // Bind the log crate to the ESP Logging facilities
    esp_idf_svc::log::EspLogger::initialize_default();

    info!("🚀 Starting double reset detector");

    let config = DetectorConfig::from_build_env();
    let detector = pup_drd::esp::take(config)?;

    if let Err(e) = detector.configure() {
        log::error!("❌ Failed to configure double reset detector: {}", e);
        warn!("⚠️ Continuing boot, double reset detection may be unavailable");
    }

    if detector.check_and_clear() {
        info!("🔁 Double reset detected, entering alternate mode");
    } else {
        info!("▶️ No double reset, continuing normal boot");
    }

    // Keep the detector alive so its arm/disarm timers can fire
    loop {
        std::thread::park();
    }
}

#[cfg(not(target_os = "espidf"))]
fn main() -> Result<()> {
    use std::time::Duration;

    use pup_drd::sim::SimDevice;
    use pup_drd::{BackendKind, FirmwareDigest, ResetReason};

    let config = DetectorConfig {
        backend: BackendKind::Flash,
        ..DetectorConfig::default()
    };
    config.validate()?;

    let device = SimDevice::new(FirmwareDigest::of_image(b"pup-drd host simulation"));

    // Freshly flashed image: wait out the arm delay so the window opens
    let first = device.boot(ResetReason::PowerOn, config.clone());
    let verdict = first.detector.check_and_clear();
    println!("boot 1 (power on, new firmware): double reset = {}", verdict);
    first
        .timers
        .advance(Duration::from_secs(u64::from(config.arm_delay_seconds)));
    drop(first);

    // Second press while the window is open
    let second = device.boot(ResetReason::ExternalPin, config);
    let verdict = second.detector.check_and_clear();
    println!("boot 2 (reset pin, window open): double reset = {}", verdict);

    if verdict {
        info!("🔁 Double reset detected in simulation");
    } else {
        warn!("⚠️ Simulation did not detect the double reset");
    }

    Ok(())
}
