// Detector Storage Module
// Persistence backends for double reset state: RTC retained memory and NVS flash
// Handles key layout, the armed marker, and best-effort erase/commit helpers

use core::sync::atomic::{AtomicU32, Ordering};

// Import logging macros for debug output
use log::{debug, warn};

// Import anyhow for error handling following existing patterns
use anyhow::Result;

use crate::config::BackendKind;

/// Sentinel stored while the double reset window is open
pub const ARMED_MAGIC: u32 = 0xD0B1_E5E5;

// NVS storage keys for detector state
pub const MAGIC_KEY: &str = "magic";
pub const LEGACY_BOOT_KEY: &str = "last_boot_us"; // Written by early releases, only ever erased
pub const LEGACY_APP_HASH_KEY: &str = "app_hash"; // 32-bit identity, read for migration only
pub const APP_SHA256_KEY: &str = "app_sha256";
pub const FIRMWARE_DIRTY_KEY: &str = "fw_dirty";
pub const FIRST_BOOT_KEY: &str = "first_boot";

/// Every key the detector owns inside its namespace
pub const DETECTOR_KEYS: [&str; 6] = [
    MAGIC_KEY,
    LEGACY_BOOT_KEY,
    FIRMWARE_DIRTY_KEY,
    FIRST_BOOT_KEY,
    APP_SHA256_KEY,
    LEGACY_APP_HASH_KEY,
];

/// Key/value access to one opened namespace.
///
/// Reads return `Ok(None)` when the key is absent. Writes are staged until
/// `commit` makes them durable.
pub trait KeyValueStore: Send {
    fn get_u8(&self, key: &str) -> Result<Option<u8>>;
    fn set_u8(&mut self, key: &str, value: u8) -> Result<()>;
    fn get_u32(&self, key: &str) -> Result<Option<u32>>;
    fn set_u32(&mut self, key: &str, value: u32) -> Result<()>;
    fn get_blob<'a>(&self, key: &str, buf: &'a mut [u8]) -> Result<Option<&'a [u8]>>;
    fn set_blob(&mut self, key: &str, value: &[u8]) -> Result<()>;
    /// Returns whether the key existed
    fn remove(&mut self, key: &str) -> Result<bool>;
    fn commit(&mut self) -> Result<()>;
}

/// Flash medium that hands out namespaced stores
pub trait FlashPartition: Send {
    /// Initialize the medium. Must be idempotent and must never erase user data.
    fn init(&mut self) -> Result<()>;
    fn open(&mut self, namespace: &str) -> Result<Box<dyn KeyValueStore>>;
}

/// One word of memory that survives soft resets but not power loss
#[derive(Clone, Copy)]
pub struct RetainedWord(&'static AtomicU32);

impl RetainedWord {
    pub const fn new(cell: &'static AtomicU32) -> Self {
        Self(cell)
    }

    pub fn load(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn store(&self, value: u32) {
        self.0.store(value, Ordering::SeqCst);
    }
}

/// RTC memory backend, no commit step and no failure modes
#[derive(Clone, Copy)]
pub struct VolatileStore {
    word: RetainedWord,
}

impl VolatileStore {
    pub fn new(word: RetainedWord) -> Self {
        Self { word }
    }

    pub fn is_armed(&self) -> bool {
        self.word.load() == ARMED_MAGIC
    }

    pub fn arm(&self) {
        self.word.store(ARMED_MAGIC);
    }

    pub fn disarm(&self) {
        self.word.store(0);
    }
}

/// NVS backend. `handle` is only present once the namespace opened successfully.
pub struct FlashStore {
    namespace: String,
    handle: Option<Box<dyn KeyValueStore>>,
}

impl FlashStore {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            handle: None,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn is_ready(&self) -> bool {
        self.handle.is_some()
    }

    pub fn attach(&mut self, handle: Box<dyn KeyValueStore>) {
        self.handle = Some(handle);
    }

    pub fn store_mut(&mut self) -> Option<&mut (dyn KeyValueStore + 'static)> {
        self.handle.as_deref_mut()
    }

    /// Drop the namespace handle, closing it
    pub fn close(&mut self) {
        if self.handle.take().is_some() {
            debug!("🔒 Closed NVS namespace '{}'", self.namespace);
        }
    }
}

/// Active backend. The detector can downgrade Flash to Volatile at runtime.
pub enum Backend {
    Volatile(VolatileStore),
    Flash(FlashStore),
}

impl Backend {
    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Volatile(_) => BackendKind::Volatile,
            Backend::Flash(_) => BackendKind::Flash,
        }
    }
}

/// Erase a key, treating "not found" as success. Failures are logged only.
pub fn remove_logged(store: &mut dyn KeyValueStore, key: &str, context: &str) -> bool {
    match store.remove(key) {
        Ok(existed) => {
            if existed {
                debug!("🗑️ Removed key '{}' ({})", key, context);
            }
            true
        }
        Err(e) => {
            warn!("⚠️ Failed to erase '{}' {}: {}", key, context, e);
            false
        }
    }
}

/// Commit staged writes. Failures are logged only.
pub fn commit_logged(store: &mut dyn KeyValueStore, context: &str) -> bool {
    match store.commit() {
        Ok(()) => true,
        Err(e) => {
            warn!("⚠️ NVS commit {} failed: {}", context, e);
            false
        }
    }
}

/// Remove every detector-owned key and commit
pub fn erase_detector_keys(store: &mut dyn KeyValueStore) {
    for key in DETECTOR_KEYS {
        remove_logged(store, key, "while clearing detector state");
    }
    commit_logged(store, "in clear_flag");
}
