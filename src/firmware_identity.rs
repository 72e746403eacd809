// Firmware Identity Module
// Tracks the running image's SHA-256 so a freshly flashed image never arms immediately
// Handles migration away from the legacy 32-bit identity key

use core::fmt;

// Import logging macros for debug output
use log::{info, warn};

// Cryptographic hashing for image fingerprinting
use sha2::{Digest, Sha256};

use crate::store::{
    commit_logged, remove_logged, KeyValueStore, APP_SHA256_KEY, FIRMWARE_DIRTY_KEY,
    FIRST_BOOT_KEY, LEGACY_APP_HASH_KEY, MAGIC_KEY,
};

pub const DIGEST_LEN: usize = 32;

/// SHA-256 identity of a firmware image
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FirmwareDigest([u8; DIGEST_LEN]);

impl FirmwareDigest {
    pub const fn new(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    /// Hash a raw image, used where no app descriptor is embedded
    pub fn of_image(image: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(image);
        Self(hasher.finalize().into())
    }

    /// `None` unless `bytes` is exactly one digest long
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; DIGEST_LEN]>::try_from(bytes).ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Fixed-width lowercase hex, for logs only
    pub fn to_hex(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for FirmwareDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for FirmwareDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FirmwareDigest({})", self)
    }
}

/// Read-only accessor for the running image's digest. `None` means unavailable.
pub trait FirmwareIdentitySource: Send {
    fn current_digest(&self) -> Option<FirmwareDigest>;
}

/// Outcome of comparing the running image against the stored identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityCheck {
    pub stored: Option<FirmwareDigest>,
    pub firmware_changed: bool,
    pub first_boot_seen: bool,
    pub legacy_migrated: bool,
    /// Every write of the identity update was accepted and committed
    pub update_committed: bool,
}

/// Compare `current` with the stored digest and reset detector state on change.
///
/// On change the marker is erased, the digest stored, the legacy key removed,
/// `fw_dirty` and `first_boot` set, then committed. Individual failures are
/// logged and reported through `update_committed`.
///
/// With `current == None` nothing is compared or written.
pub fn reconcile(store: &mut dyn KeyValueStore, current: Option<FirmwareDigest>) -> IdentityCheck {
    let stored = read_stored_digest(store);

    let legacy_present = match store.get_u32(LEGACY_APP_HASH_KEY) {
        Ok(value) => value.is_some(),
        Err(e) => {
            warn!("⚠️ Failed to read legacy app hash: {}", e);
            false
        }
    };

    let mut first_boot_seen = match store.get_u8(FIRST_BOOT_KEY) {
        Ok(value) => value.unwrap_or(0) != 0,
        Err(e) => {
            warn!("⚠️ Failed to read first boot flag: {}", e);
            false
        }
    };

    match stored {
        Some(digest) => info!("🔍 DRD stored app SHA-256: {}", digest),
        None => info!("🔍 DRD stored app SHA-256: <none>"),
    }

    let Some(current) = current else {
        info!("🔍 DRD current app SHA-256: <unavailable>");
        return IdentityCheck {
            stored,
            firmware_changed: false,
            first_boot_seen,
            legacy_migrated: false,
            update_committed: false,
        };
    };

    info!("🔍 DRD current app SHA-256: {}", current);

    let firmware_changed = match stored {
        None if legacy_present => {
            info!("🔄 No stored app SHA-256 but legacy app_hash exists, migrating DRD identity");
            true
        }
        None => {
            info!("🆕 No stored firmware identity, treating as first boot for this image");
            true
        }
        Some(digest) if digest != current => {
            info!("🔄 Firmware identity changed for DRD");
            true
        }
        Some(_) => {
            info!("✅ Firmware identity unchanged for DRD");
            false
        }
    };

    if !firmware_changed {
        return IdentityCheck {
            stored,
            firmware_changed,
            first_boot_seen,
            legacy_migrated: false,
            update_committed: true,
        };
    }

    let mut ok = remove_logged(store, MAGIC_KEY, "after firmware change");

    if let Err(e) = store.set_blob(APP_SHA256_KEY, current.as_bytes()) {
        warn!("⚠️ Failed to store app SHA-256: {}", e);
        ok = false;
    }

    let legacy_migrated =
        legacy_present && remove_logged(store, LEGACY_APP_HASH_KEY, "during migration");
    ok &= !legacy_present || legacy_migrated;

    if let Err(e) = store.set_u8(FIRMWARE_DIRTY_KEY, 1) {
        warn!("⚠️ Failed to set fw_dirty=1: {}", e);
        ok = false;
    }

    match store.set_u8(FIRST_BOOT_KEY, 1) {
        Ok(()) => first_boot_seen = true,
        Err(e) => {
            warn!("⚠️ Failed to set first_boot=1: {}", e);
            ok = false;
        }
    }

    ok &= commit_logged(store, "after identity update");

    if ok {
        info!("🧹 DRD state reset due to firmware identity change, firmware marked dirty");
    } else {
        warn!("⚠️ DRD identity update only partially persisted, treating firmware as dirty");
    }

    IdentityCheck {
        stored,
        firmware_changed,
        first_boot_seen,
        legacy_migrated,
        update_committed: ok,
    }
}

fn read_stored_digest(store: &dyn KeyValueStore) -> Option<FirmwareDigest> {
    let mut buf = [0u8; DIGEST_LEN * 2];
    match store.get_blob(APP_SHA256_KEY, &mut buf) {
        Ok(Some(bytes)) => {
            let digest = FirmwareDigest::from_slice(bytes);
            if digest.is_none() {
                warn!(
                    "⚠️ Stored app SHA-256 has unexpected length {}, ignoring it",
                    bytes.len()
                );
            }
            digest
        }
        Ok(None) => None,
        Err(e) => {
            warn!("⚠️ Failed to read stored app SHA-256: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimFlash;
    use crate::store::ARMED_MAGIC;

    const NS: &str = "drd";

    fn digest(fill: u8) -> FirmwareDigest {
        FirmwareDigest::new([fill; DIGEST_LEN])
    }

    #[test]
    fn hex_rendering_is_fixed_width() {
        let mut bytes = [0u8; DIGEST_LEN];
        bytes[0] = 0x0a;
        bytes[31] = 0xff;
        let hex = FirmwareDigest::new(bytes).to_hex();

        assert_eq!(hex.len(), 64);
        assert!(hex.starts_with("0a00"));
        assert!(hex.ends_with("00ff"));
    }

    #[test]
    fn image_digest_matches_sha256() {
        let hex = FirmwareDigest::of_image(b"abc").to_hex();
        assert_eq!(
            hex,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn from_slice_rejects_wrong_length() {
        assert!(FirmwareDigest::from_slice(&[0u8; 16]).is_none());
        assert_eq!(FirmwareDigest::from_slice(&[7u8; 32]), Some(digest(7)));
    }

    #[test]
    fn first_run_stores_identity_and_marks_dirty() {
        let flash = SimFlash::new();
        flash.seed_u32(NS, MAGIC_KEY, ARMED_MAGIC);
        let mut store = flash.open(NS).unwrap();

        let check = reconcile(store.as_mut(), Some(digest(1)));

        assert!(check.firmware_changed);
        assert!(check.first_boot_seen);
        assert!(check.update_committed);
        assert_eq!(check.stored, None);
        assert_eq!(flash.blob(NS, APP_SHA256_KEY), Some(vec![1u8; DIGEST_LEN]));
        assert_eq!(flash.u8(NS, FIRMWARE_DIRTY_KEY), Some(1));
        assert!(!flash.contains(NS, MAGIC_KEY));
    }

    #[test]
    fn unchanged_identity_writes_nothing() {
        let flash = SimFlash::new();
        flash.seed_blob(NS, APP_SHA256_KEY, &[2u8; DIGEST_LEN]);
        flash.seed_u32(NS, MAGIC_KEY, ARMED_MAGIC);
        let mut store = flash.open(NS).unwrap();

        let check = reconcile(store.as_mut(), Some(digest(2)));

        assert!(!check.firmware_changed);
        assert_eq!(check.stored, Some(digest(2)));
        assert_eq!(flash.u32(NS, MAGIC_KEY), Some(ARMED_MAGIC));
        assert!(!flash.contains(NS, FIRMWARE_DIRTY_KEY));
    }

    #[test]
    fn legacy_identity_is_migrated_once() {
        let flash = SimFlash::new();
        flash.seed_u32(NS, LEGACY_APP_HASH_KEY, 0xDEAD_BEEF);
        let mut store = flash.open(NS).unwrap();

        let check = reconcile(store.as_mut(), Some(digest(3)));
        assert!(check.firmware_changed);
        assert!(check.legacy_migrated);
        assert!(!flash.contains(NS, LEGACY_APP_HASH_KEY));

        let again = reconcile(store.as_mut(), Some(digest(3)));
        assert!(!again.firmware_changed);
        assert!(!again.legacy_migrated);
    }

    #[test]
    fn truncated_stored_digest_counts_as_changed() {
        let flash = SimFlash::new();
        flash.seed_blob(NS, APP_SHA256_KEY, &[4u8; 16]);
        let mut store = flash.open(NS).unwrap();

        let check = reconcile(store.as_mut(), Some(digest(4)));
        assert!(check.firmware_changed);
        assert_eq!(check.stored, None);
    }

    #[test]
    fn unavailable_digest_leaves_store_untouched() {
        let flash = SimFlash::new();
        flash.seed_blob(NS, APP_SHA256_KEY, &[5u8; DIGEST_LEN]);
        let mut store = flash.open(NS).unwrap();

        let check = reconcile(store.as_mut(), None);
        assert!(!check.firmware_changed);
        assert!(!check.update_committed);
        assert_eq!(flash.blob(NS, APP_SHA256_KEY), Some(vec![5u8; DIGEST_LEN]));
    }

    #[test]
    fn write_failure_is_reported_not_raised() {
        let flash = SimFlash::new();
        let mut store = flash.open(NS).unwrap();
        flash.fail_writes(true);

        let check = reconcile(store.as_mut(), Some(digest(6)));
        assert!(check.firmware_changed);
        assert!(!check.update_committed);
        assert!(!flash.contains(NS, APP_SHA256_KEY));
    }
}
