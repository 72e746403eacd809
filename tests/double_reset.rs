// End-to-end boot sequences against the simulated device

use std::time::Duration;

use pup_drd::sim::{SimBoot, SimDevice};
use pup_drd::store::{
    APP_SHA256_KEY, ARMED_MAGIC, FIRMWARE_DIRTY_KEY, FIRST_BOOT_KEY, LEGACY_APP_HASH_KEY,
    LEGACY_BOOT_KEY, MAGIC_KEY,
};
use pup_drd::{BackendKind, DetectorConfig, FirmwareDigest, ResetReason};

const NS: &str = "drd";
const WINDOW: Duration = Duration::from_secs(8);
const ARM_DELAY: Duration = Duration::from_secs(10);

fn flash_config() -> DetectorConfig {
    DetectorConfig {
        backend: BackendKind::Flash,
        suppress_tooling_resets: true,
        window_seconds: 8,
        arm_delay_seconds: 10,
        namespace: NS.to_string(),
    }
}

fn volatile_config() -> DetectorConfig {
    DetectorConfig {
        backend: BackendKind::Volatile,
        ..flash_config()
    }
}

fn firmware(tag: &str) -> FirmwareDigest {
    FirmwareDigest::of_image(tag.as_bytes())
}

/// Boot a freshly flashed image and let the arm delay elapse so the window is open
fn armed_device() -> (SimDevice, SimBoot) {
    let device = SimDevice::new(firmware("pup firmware v1"));
    let boot = device.boot(ResetReason::PowerOn, flash_config());
    assert!(!boot.detector.check_and_clear());
    boot.timers.advance(ARM_DELAY);
    assert_eq!(device.flash().u32(NS, MAGIC_KEY), Some(ARMED_MAGIC));
    (device, boot)
}

#[test]
fn second_reset_inside_window_is_detected() {
    let (device, first) = armed_device();
    assert_eq!(first.timers.remaining("drd_disarm"), Some(WINDOW));
    first.timers.advance(Duration::from_secs(3));
    drop(first);

    let second = device.boot(ResetReason::ExternalPin, flash_config());
    assert!(second.detector.check_and_clear());
    assert!(!device.flash().contains(NS, MAGIC_KEY));
    assert_eq!(second.timers.pending(), 0);
    drop(second);

    // The detection consumed the marker: the next press starts a new window
    let third = device.boot(ResetReason::ExternalPin, flash_config());
    assert!(!third.detector.check_and_clear());
    assert_eq!(device.flash().u32(NS, MAGIC_KEY), Some(ARMED_MAGIC));
    assert_eq!(third.timers.remaining("drd_disarm"), Some(WINDOW));
}

#[test]
fn reset_after_window_is_not_detected() {
    let (device, first) = armed_device();
    first.timers.advance(WINDOW);
    assert!(!device.flash().contains(NS, MAGIC_KEY));
    drop(first);

    let second = device.boot(ResetReason::ExternalPin, flash_config());
    assert!(!second.detector.check_and_clear());
}

#[test]
fn firmware_change_delays_arming() {
    let (mut device, first) = armed_device();
    drop(first);

    device.flash_firmware(firmware("pup firmware v2"));
    let second = device.boot(ResetReason::ExternalPin, flash_config());
    assert!(!second.detector.check_and_clear());
    assert!(!device.flash().contains(NS, MAGIC_KEY));
    assert_eq!(device.flash().u8(NS, FIRMWARE_DIRTY_KEY), Some(1));
    assert_eq!(
        device.flash().blob(NS, APP_SHA256_KEY),
        Some(firmware("pup firmware v2").as_bytes().to_vec())
    );
    assert_eq!(second.timers.remaining("drd_arm"), Some(ARM_DELAY));

    // Reset again before the arm delay elapsed
    second.timers.advance(Duration::from_secs(2));
    drop(second);

    let third = device.boot(ResetReason::ExternalPin, flash_config());
    assert!(!third.detector.check_and_clear());
    assert_eq!(third.timers.remaining("drd_arm"), Some(ARM_DELAY));
    assert_eq!(device.flash().u8(NS, FIRMWARE_DIRTY_KEY), Some(1));
}

#[test]
fn tooling_reset_clears_marker_and_rearms_after_delay() {
    let (device, first) = armed_device();
    drop(first);

    let second = device.boot(ResetReason::Software, flash_config());
    assert!(!second.detector.check_and_clear());
    assert!(!device.flash().contains(NS, MAGIC_KEY));
    assert_eq!(second.timers.remaining("drd_arm"), Some(ARM_DELAY));

    second.timers.advance(ARM_DELAY);
    assert_eq!(device.flash().u32(NS, MAGIC_KEY), Some(ARMED_MAGIC));
    drop(second);

    let third = device.boot(ResetReason::ExternalPin, flash_config());
    assert!(third.detector.check_and_clear());
}

#[test]
fn software_reset_counts_when_suppression_is_off() {
    let (device, first) = armed_device();
    drop(first);

    let config = DetectorConfig {
        suppress_tooling_resets: false,
        ..flash_config()
    };
    let second = device.boot(ResetReason::Software, config);
    assert!(second.detector.check_and_clear());
}

#[test]
fn explicit_configure_failure_disables_detection_for_the_boot() {
    let device = SimDevice::new(firmware("pup firmware v1"));
    device
        .flash()
        .seed_blob(NS, APP_SHA256_KEY, firmware("pup firmware v1").as_bytes());
    device.flash().seed_u32(NS, MAGIC_KEY, ARMED_MAGIC);
    device.flash().fail_init(true);

    let boot = device.boot(ResetReason::ExternalPin, flash_config());
    assert!(boot.detector.configure().is_err());

    assert!(!boot.detector.check_and_clear());
    assert!(!boot.detector.check_and_clear_with_window(30));
    assert_eq!(boot.detector.backend_kind(), BackendKind::Flash);
    assert_eq!(boot.timers.pending(), 0);
    assert_eq!(device.flash().u32(NS, MAGIC_KEY), Some(ARMED_MAGIC));
    assert_eq!(device.retained().load(), 0);
}

#[test]
fn clear_flag_prevents_detection_on_next_boot() {
    let (device, first) = armed_device();
    first.detector.clear_flag();
    drop(first);

    let second = device.boot(ResetReason::ExternalPin, flash_config());
    assert!(!second.detector.check_and_clear());
}

#[test]
fn clear_flag_before_evaluation_configures_lazily() {
    let (device, first) = armed_device();
    drop(first);

    let second = device.boot(ResetReason::ExternalPin, flash_config());
    second.detector.clear_flag();
    second.detector.clear_flag();
    assert!(!device.flash().contains(NS, MAGIC_KEY));
    assert!(!second.detector.check_and_clear());
}

#[test]
fn legacy_identity_is_migrated() {
    let device = SimDevice::new(firmware("pup firmware v3"));
    device.flash().seed_u32(NS, LEGACY_APP_HASH_KEY, 0x1234_ABCD);
    device.flash().seed_u32(NS, LEGACY_BOOT_KEY, 42);
    device.flash().seed_u32(NS, MAGIC_KEY, ARMED_MAGIC);

    let boot = device.boot(ResetReason::ExternalPin, flash_config());
    assert!(!boot.detector.check_and_clear());

    assert!(!device.flash().contains(NS, LEGACY_APP_HASH_KEY));
    assert!(!device.flash().contains(NS, MAGIC_KEY));
    assert_eq!(device.flash().u8(NS, FIRMWARE_DIRTY_KEY), Some(1));
    assert_eq!(device.flash().u8(NS, FIRST_BOOT_KEY), Some(1));
    assert!(device.flash().contains(NS, APP_SHA256_KEY));
    assert_eq!(boot.timers.remaining("drd_arm"), Some(ARM_DELAY));

    // The legacy boot timestamp is only ever erased, by clear_flag
    assert_eq!(device.flash().u32(NS, LEGACY_BOOT_KEY), Some(42));
    boot.detector.clear_flag();
    assert!(!device.flash().contains(NS, LEGACY_BOOT_KEY));
}

#[test]
fn volatile_backend_detects_second_reset() {
    let device = SimDevice::new(firmware("pup firmware v1"));
    let first = device.boot(ResetReason::PowerOn, volatile_config());
    assert!(!first.detector.check_and_clear());
    drop(first);

    let second = device.boot(ResetReason::ExternalPin, volatile_config());
    assert!(second.detector.check_and_clear());
    assert_eq!(device.retained().load(), 0);
    assert!(!device.flash().contains(NS, MAGIC_KEY));
}

#[test]
fn power_loss_clears_volatile_marker() {
    let device = SimDevice::new(firmware("pup firmware v1"));
    let first = device.boot(ResetReason::ExternalPin, volatile_config());
    assert!(!first.detector.check_and_clear());
    drop(first);

    device.power_loss();
    let second = device.boot(ResetReason::PowerOn, volatile_config());
    assert!(!second.detector.check_and_clear());
    assert_eq!(device.retained().load(), ARMED_MAGIC);
}

#[test]
fn flash_state_survives_power_loss() {
    let (device, first) = armed_device();
    drop(first);

    device.power_loss();
    let second = device.boot(ResetReason::PowerOn, flash_config());
    assert!(second.detector.check_and_clear());
}

#[test]
fn custom_namespace_isolates_state() {
    let device = SimDevice::new(firmware("pup firmware v1"));
    let config = DetectorConfig {
        namespace: "pup_drd".to_string(),
        arm_delay_seconds: 0,
        ..flash_config()
    };

    let boot = device.boot(ResetReason::PowerOn, config);
    assert!(!boot.detector.check_and_clear());
    assert_eq!(device.flash().u32("pup_drd", MAGIC_KEY), Some(ARMED_MAGIC));
    assert!(!device.flash().contains(NS, MAGIC_KEY));
}
