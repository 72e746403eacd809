use log::{debug, log_enabled, Level};

use crate::store::{KeyValueStore, DETECTOR_KEYS};

/// Dump every detector-owned key from an opened namespace at debug level
pub fn dump_detector_state(store: &dyn KeyValueStore) {
    if !log_enabled!(Level::Debug) {
        return;
    }

    debug!("🔍 DEBUG: DRD storage contents:");
    for (key, value) in snapshot(store) {
        debug!("   📝 '{}' = {}", key, value);
    }
}

/// Human readable value of each detector key, probing u8, u32 then blob
pub fn snapshot(store: &dyn KeyValueStore) -> Vec<(&'static str, String)> {
    DETECTOR_KEYS
        .iter()
        .map(|&key| (key, describe_key(store, key)))
        .collect()
}

fn describe_key(store: &dyn KeyValueStore, key: &str) -> String {
    if let Ok(Some(value)) = store.get_u8(key) {
        return format!("{} (u8)", value);
    }

    if let Ok(Some(value)) = store.get_u32(key) {
        return format!("0x{:08X} (u32)", value);
    }

    let mut buffer = [0u8; 64];
    match store.get_blob(key, &mut buffer) {
        Ok(Some(blob)) => {
            let hex: String = blob.iter().map(|b| format!("{:02x}", b)).collect();
            format!("<blob {} bytes> {}", blob.len(), hex)
        }
        Ok(None) => "<not found>".to_string(),
        Err(e) => format!("<error: {}>", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimFlash;
    use crate::store::{ARMED_MAGIC, APP_SHA256_KEY, FIRMWARE_DIRTY_KEY, MAGIC_KEY};

    #[test]
    fn snapshot_describes_each_key_type() {
        let flash = SimFlash::new();
        flash.seed_u32("drd", MAGIC_KEY, ARMED_MAGIC);
        flash.seed_u8("drd", FIRMWARE_DIRTY_KEY, 1);
        flash.seed_blob("drd", APP_SHA256_KEY, &[0xab, 0x01]);
        let store = flash.open("drd").unwrap();

        let values = snapshot(store.as_ref());
        let lookup = |key: &str| {
            values
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.clone())
                .unwrap()
        };

        assert_eq!(values.len(), DETECTOR_KEYS.len());
        assert_eq!(lookup(MAGIC_KEY), "0xD0B1E5E5 (u32)");
        assert_eq!(lookup(FIRMWARE_DIRTY_KEY), "1 (u8)");
        assert_eq!(lookup(APP_SHA256_KEY), "<blob 2 bytes> ab01");
        assert_eq!(lookup("first_boot"), "<not found>");
    }
}
