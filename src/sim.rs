// Simulation Module
// Host-side stand-ins for the ESP32 collaborators: NVS flash, RTC memory, esp_timer
// Used by the host build of the binary and by the test suites

use core::sync::atomic::AtomicU32;
use core::time::Duration;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

// Import logging macros for debug output
use log::debug;

// Import anyhow for error handling following existing patterns
use anyhow::{anyhow, bail, Result};

use crate::config::DetectorConfig;
use crate::detector::{DoubleResetDetector, Platform};
use crate::firmware_identity::{FirmwareDigest, FirmwareIdentitySource};
use crate::reset_reason::{ResetReason, ResetReasonSource};
use crate::scheduler::{PendingTimer, TimerCallback, TimerService};
use crate::store::{FlashPartition, KeyValueStore, RetainedWord};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SimValue {
    U8(u8),
    U32(u32),
    Blob(Vec<u8>),
}

#[derive(Default)]
struct FlashState {
    durable: HashMap<(String, String), SimValue>,
    fail_init: bool,
    fail_writes: bool,
    init_calls: usize,
    open_calls: usize,
}

/// Simulated NVS partition shared by every boot of a simulated device
#[derive(Clone, Default)]
pub struct SimFlash {
    state: Arc<Mutex<FlashState>>,
}

impl SimFlash {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh partition driver, as seen by a newly booted process
    pub fn partition(&self) -> SimPartition {
        SimPartition {
            flash: self.clone(),
            initialized: false,
        }
    }

    /// Initialize a fresh partition driver and open `namespace` on it
    pub fn open(&self, namespace: &str) -> Result<Box<dyn KeyValueStore>> {
        let mut partition = self.partition();
        partition.init()?;
        partition.open(namespace)
    }

    pub fn fail_init(&self, fail: bool) {
        lock(&self.state).fail_init = fail;
    }

    pub fn fail_writes(&self, fail: bool) {
        lock(&self.state).fail_writes = fail;
    }

    pub fn init_calls(&self) -> usize {
        lock(&self.state).init_calls
    }

    pub fn open_calls(&self) -> usize {
        lock(&self.state).open_calls
    }

    pub fn seed_u8(&self, namespace: &str, key: &str, value: u8) {
        self.seed(namespace, key, SimValue::U8(value));
    }

    pub fn seed_u32(&self, namespace: &str, key: &str, value: u32) {
        self.seed(namespace, key, SimValue::U32(value));
    }

    pub fn seed_blob(&self, namespace: &str, key: &str, value: &[u8]) {
        self.seed(namespace, key, SimValue::Blob(value.to_vec()));
    }

    /// Committed presence of `key`, whatever its type
    pub fn contains(&self, namespace: &str, key: &str) -> bool {
        self.durable(namespace, key).is_some()
    }

    pub fn u8(&self, namespace: &str, key: &str) -> Option<u8> {
        match self.durable(namespace, key)? {
            SimValue::U8(value) => Some(value),
            _ => None,
        }
    }

    pub fn u32(&self, namespace: &str, key: &str) -> Option<u32> {
        match self.durable(namespace, key)? {
            SimValue::U32(value) => Some(value),
            _ => None,
        }
    }

    pub fn blob(&self, namespace: &str, key: &str) -> Option<Vec<u8>> {
        match self.durable(namespace, key)? {
            SimValue::Blob(value) => Some(value),
            _ => None,
        }
    }

    fn seed(&self, namespace: &str, key: &str, value: SimValue) {
        lock(&self.state)
            .durable
            .insert((namespace.to_string(), key.to_string()), value);
    }

    fn durable(&self, namespace: &str, key: &str) -> Option<SimValue> {
        lock(&self.state)
            .durable
            .get(&(namespace.to_string(), key.to_string()))
            .cloned()
    }

    fn writes_fail(&self) -> bool {
        lock(&self.state).fail_writes
    }
}

/// Per-process view of the simulated partition
pub struct SimPartition {
    flash: SimFlash,
    initialized: bool,
}

impl FlashPartition for SimPartition {
    fn init(&mut self) -> Result<()> {
        let mut state = lock(&self.flash.state);
        state.init_calls += 1;
        if state.fail_init {
            bail!("nvs_flash_init failed: ESP_ERR_NVS_NO_FREE_PAGES");
        }
        self.initialized = true;
        Ok(())
    }

    fn open(&mut self, namespace: &str) -> Result<Box<dyn KeyValueStore>> {
        lock(&self.flash.state).open_calls += 1;
        if !self.initialized {
            bail!("NVS partition not initialized");
        }

        debug!("📂 Simulated NVS namespace '{}' opened", namespace);
        Ok(Box::new(SimNamespace {
            flash: self.flash.clone(),
            namespace: namespace.to_string(),
            staged: HashMap::new(),
        }))
    }
}

/// Open namespace handle. Writes stay staged until `commit`.
struct SimNamespace {
    flash: SimFlash,
    namespace: String,
    staged: HashMap<String, Option<SimValue>>,
}

impl SimNamespace {
    fn read(&self, key: &str) -> Option<SimValue> {
        match self.staged.get(key) {
            Some(staged) => staged.clone(),
            None => self.flash.durable(&self.namespace, key),
        }
    }

    fn stage(&mut self, key: &str, value: Option<SimValue>) -> Result<()> {
        if self.flash.writes_fail() {
            bail!("simulated flash write failure for '{}'", key);
        }
        self.staged.insert(key.to_string(), value);
        Ok(())
    }
}

impl KeyValueStore for SimNamespace {
    fn get_u8(&self, key: &str) -> Result<Option<u8>> {
        Ok(match self.read(key) {
            Some(SimValue::U8(value)) => Some(value),
            _ => None,
        })
    }

    fn set_u8(&mut self, key: &str, value: u8) -> Result<()> {
        self.stage(key, Some(SimValue::U8(value)))
    }

    fn get_u32(&self, key: &str) -> Result<Option<u32>> {
        Ok(match self.read(key) {
            Some(SimValue::U32(value)) => Some(value),
            _ => None,
        })
    }

    fn set_u32(&mut self, key: &str, value: u32) -> Result<()> {
        self.stage(key, Some(SimValue::U32(value)))
    }

    fn get_blob<'a>(&self, key: &str, buf: &'a mut [u8]) -> Result<Option<&'a [u8]>> {
        match self.read(key) {
            Some(SimValue::Blob(value)) => {
                let target = buf
                    .get_mut(..value.len())
                    .ok_or_else(|| anyhow!("buffer too small for blob '{}'", key))?;
                target.copy_from_slice(&value);
                Ok(Some(&*target))
            }
            _ => Ok(None),
        }
    }

    fn set_blob(&mut self, key: &str, value: &[u8]) -> Result<()> {
        self.stage(key, Some(SimValue::Blob(value.to_vec())))
    }

    fn remove(&mut self, key: &str) -> Result<bool> {
        let existed = self.read(key).is_some();
        self.stage(key, None)?;
        Ok(existed)
    }

    fn commit(&mut self) -> Result<()> {
        if self.flash.writes_fail() {
            bail!("simulated flash commit failure");
        }

        let mut state = lock(&self.flash.state);
        for (key, value) in self.staged.drain() {
            let slot = (self.namespace.clone(), key);
            match value {
                Some(value) => {
                    state.durable.insert(slot, value);
                }
                None => {
                    state.durable.remove(&slot);
                }
            }
        }
        Ok(())
    }
}

struct TimerEntry {
    id: u64,
    name: &'static str,
    due: Duration,
    callback: TimerCallback,
}

#[derive(Default)]
struct TimerQueue {
    now: Duration,
    next_id: u64,
    entries: Vec<TimerEntry>,
    fail_next: bool,
}

/// Timer service driven by a virtual clock
#[derive(Clone, Default)]
pub struct ManualTimerService {
    queue: Arc<Mutex<TimerQueue>>,
}

impl ManualTimerService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `schedule` call fail, as if `esp_timer_create` did
    pub fn fail_next_schedule(&self) {
        lock(&self.queue).fail_next = true;
    }

    pub fn now(&self) -> Duration {
        lock(&self.queue).now
    }

    pub fn pending(&self) -> usize {
        lock(&self.queue).entries.len()
    }

    /// Time left until the named timer fires
    pub fn remaining(&self, name: &str) -> Option<Duration> {
        let queue = lock(&self.queue);
        queue
            .entries
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.due - queue.now)
    }

    /// Move the clock forward, firing due callbacks in deadline order
    pub fn advance(&self, by: Duration) {
        let target = lock(&self.queue).now + by;

        loop {
            let next = {
                let mut queue = lock(&self.queue);
                let index = queue
                    .entries
                    .iter()
                    .enumerate()
                    .filter(|(_, entry)| entry.due <= target)
                    .min_by_key(|(_, entry)| (entry.due, entry.id))
                    .map(|(index, _)| index);

                index.map(|index| {
                    let entry = queue.entries.remove(index);
                    queue.now = entry.due;
                    entry
                })
            };

            let Some(entry) = next else {
                break;
            };

            debug!("⏰ Simulated timer '{}' fired at {:?}", entry.name, entry.due);
            (entry.callback)();
        }

        lock(&self.queue).now = target;
    }
}

impl TimerService for ManualTimerService {
    fn schedule(
        &self,
        name: &'static str,
        delay: Duration,
        callback: TimerCallback,
    ) -> Result<Box<dyn PendingTimer>> {
        let mut queue = lock(&self.queue);
        if queue.fail_next {
            queue.fail_next = false;
            bail!("simulated esp_timer_create failure for '{}'", name);
        }

        let id = queue.next_id;
        queue.next_id += 1;
        let due = queue.now + delay;
        queue.entries.push(TimerEntry {
            id,
            name,
            due,
            callback,
        });

        Ok(Box::new(ManualTimer {
            id,
            queue: self.queue.clone(),
        }))
    }
}

struct ManualTimer {
    id: u64,
    queue: Arc<Mutex<TimerQueue>>,
}

impl ManualTimer {
    fn withdraw(&self) -> bool {
        let mut queue = lock(&self.queue);
        let before = queue.entries.len();
        queue.entries.retain(|entry| entry.id != self.id);
        queue.entries.len() != before
    }
}

impl PendingTimer for ManualTimer {
    fn cancel(&mut self) -> Result<bool> {
        Ok(self.withdraw())
    }
}

impl Drop for ManualTimer {
    fn drop(&mut self) {
        self.withdraw();
    }
}

/// Reset reason fixed for the lifetime of one simulated boot
pub struct FixedResetReason(pub ResetReason);

impl ResetReasonSource for FixedResetReason {
    fn reset_reason(&self) -> ResetReason {
        self.0
    }
}

/// Firmware identity of the simulated image, `None` when unreadable
pub struct FixedFirmware(pub Option<FirmwareDigest>);

impl FirmwareIdentitySource for FixedFirmware {
    fn current_digest(&self) -> Option<FirmwareDigest> {
        self.0
    }
}

/// One running process on a simulated device
pub struct SimBoot {
    pub detector: DoubleResetDetector,
    pub timers: ManualTimerService,
}

/// A simulated board: flash and RTC memory persist across `boot` calls
pub struct SimDevice {
    flash: SimFlash,
    retained: RetainedWord,
    firmware: Option<FirmwareDigest>,
}

impl SimDevice {
    pub fn new(firmware: FirmwareDigest) -> Self {
        // Each device needs its own 'static RTC word
        let cell: &'static AtomicU32 = Box::leak(Box::new(AtomicU32::new(0)));
        Self {
            flash: SimFlash::new(),
            retained: RetainedWord::new(cell),
            firmware: Some(firmware),
        }
    }

    pub fn flash(&self) -> &SimFlash {
        &self.flash
    }

    pub fn retained(&self) -> RetainedWord {
        self.retained
    }

    /// Replace the running image, as a flashing session would
    pub fn flash_firmware(&mut self, firmware: FirmwareDigest) {
        self.firmware = Some(firmware);
    }

    pub fn firmware_unavailable(&mut self) {
        self.firmware = None;
    }

    /// RTC memory does not survive power loss
    pub fn power_loss(&self) {
        self.retained.store(0);
    }

    pub fn boot(&self, reason: ResetReason, config: DetectorConfig) -> SimBoot {
        let timers = ManualTimerService::new();
        let platform = Platform {
            reset_reason: Box::new(FixedResetReason(reason)),
            firmware: Box::new(FixedFirmware(self.firmware)),
            flash: Box::new(self.flash.partition()),
            retained: self.retained,
            timers: Arc::new(timers.clone()),
        };

        SimBoot {
            detector: DoubleResetDetector::new(config, platform),
            timers,
        }
    }
}
