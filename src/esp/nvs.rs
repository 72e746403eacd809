// Import ESP-IDF's NVS (Non-Volatile Storage) functionality
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};
use esp_idf_svc::sys::{self, EspError};

// Import logging macros for debug output
use log::{info, warn};

// Import anyhow for error handling following existing patterns
use anyhow::{anyhow, Result};

use crate::store::{FlashPartition, KeyValueStore};

/// Default NVS partition, initialized without ever erasing it
pub struct EspFlashPartition {
    partition: Option<EspDefaultNvsPartition>,
}

impl EspFlashPartition {
    pub fn new() -> Self {
        Self { partition: None }
    }

    /// Use a partition the application already took (avoids singleton conflicts)
    pub fn with_partition(partition: EspDefaultNvsPartition) -> Self {
        Self {
            partition: Some(partition),
        }
    }
}

impl Default for EspFlashPartition {
    fn default() -> Self {
        Self::new()
    }
}

impl FlashPartition for EspFlashPartition {
    fn init(&mut self) -> Result<()> {
        if self.partition.is_some() {
            return Ok(());
        }

        // EspDefaultNvsPartition::take() erases the partition on these errors, so
        // initialize it ourselves first and keep user data intact
        let err = unsafe { sys::nvs_flash_init() };
        if err == sys::ESP_ERR_NVS_NO_FREE_PAGES as sys::esp_err_t
            || err == sys::ESP_ERR_NVS_NEW_VERSION_FOUND as sys::esp_err_t
        {
            warn!("⚠️ nvs_flash_init reported no free pages or new version, skipping erase");
        }
        EspError::convert(err).map_err(|e| anyhow!("nvs_flash_init failed: {}", e))?;

        let partition = EspDefaultNvsPartition::take()
            .map_err(|e| anyhow!("Failed to take default NVS partition: {}", e))?;

        info!("✅ NVS partition initialized for DRD");
        self.partition = Some(partition);
        Ok(())
    }

    fn open(&mut self, namespace: &str) -> Result<Box<dyn KeyValueStore>> {
        let partition = self
            .partition
            .clone()
            .ok_or_else(|| anyhow!("NVS partition not initialized"))?;

        let nvs = EspNvs::new(partition, namespace, true)
            .map_err(|e| anyhow!("Failed to open NVS namespace '{}': {}", namespace, e))?;

        Ok(Box::new(NvsNamespace { nvs }))
    }
}

/// Read-write handle on one NVS namespace
struct NvsNamespace {
    nvs: EspNvs<NvsDefault>,
}

impl KeyValueStore for NvsNamespace {
    fn get_u8(&self, key: &str) -> Result<Option<u8>> {
        self.nvs
            .get_u8(key)
            .map_err(|e| anyhow!("Failed to read u8 '{}': {}", key, e))
    }

    fn set_u8(&mut self, key: &str, value: u8) -> Result<()> {
        self.nvs
            .set_u8(key, value)
            .map_err(|e| anyhow!("Failed to write u8 '{}': {}", key, e))
    }

    fn get_u32(&self, key: &str) -> Result<Option<u32>> {
        self.nvs
            .get_u32(key)
            .map_err(|e| anyhow!("Failed to read u32 '{}': {}", key, e))
    }

    fn set_u32(&mut self, key: &str, value: u32) -> Result<()> {
        self.nvs
            .set_u32(key, value)
            .map_err(|e| anyhow!("Failed to write u32 '{}': {}", key, e))
    }

    fn get_blob<'a>(&self, key: &str, buf: &'a mut [u8]) -> Result<Option<&'a [u8]>> {
        self.nvs
            .get_blob(key, buf)
            .map_err(|e| anyhow!("Failed to read blob '{}': {}", key, e))
    }

    fn set_blob(&mut self, key: &str, value: &[u8]) -> Result<()> {
        self.nvs
            .set_blob(key, value)
            .map_err(|e| anyhow!("Failed to write blob '{}': {}", key, e))
    }

    fn remove(&mut self, key: &str) -> Result<bool> {
        self.nvs
            .remove(key)
            .map_err(|e| anyhow!("Failed to erase '{}': {}", key, e))
    }

    fn commit(&mut self) -> Result<()> {
        EspError::convert(unsafe { sys::nvs_commit(self.nvs.handle()) })
            .map_err(|e| anyhow!("nvs_commit failed: {}", e))
    }
}
