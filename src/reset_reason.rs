// Reset Reason Module
// Classifies the hardware-reported boot cause as a user reset or tooling activity

use core::fmt;

/// Hardware-reported cause of the current boot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResetReason {
    PowerOn,
    ExternalPin,
    Software,
    Panic,
    InterruptWatchdog,
    TaskWatchdog,
    OtherWatchdog,
    DeepSleepWake,
    Brownout,
    PeripheralBus, // SDIO
    Usb,
    Jtag,
    Unknown,
}

/// Read-only accessor for the reset cause of the current boot
pub trait ResetReasonSource: Send {
    fn reset_reason(&self) -> ResetReason;
}

impl ResetReason {
    pub const ALL: [ResetReason; 13] = [
        ResetReason::PowerOn,
        ResetReason::ExternalPin,
        ResetReason::Software,
        ResetReason::Panic,
        ResetReason::InterruptWatchdog,
        ResetReason::TaskWatchdog,
        ResetReason::OtherWatchdog,
        ResetReason::DeepSleepWake,
        ResetReason::Brownout,
        ResetReason::PeripheralBus,
        ResetReason::Usb,
        ResetReason::Jtag,
        ResetReason::Unknown,
    ];

    /// True when the reset was most likely caused by flashing or debugging.
    ///
    /// With suppression disabled every reset is treated as a user reset.
    pub fn is_tooling_induced(self, suppress_tooling_resets: bool) -> bool {
        suppress_tooling_resets
            && matches!(
                self,
                ResetReason::Software | ResetReason::Usb | ResetReason::Jtag
            )
    }

    pub fn description(self) -> &'static str {
        match self {
            ResetReason::PowerOn => "Power-on reset",
            ResetReason::ExternalPin => "External pin reset",
            ResetReason::Software => "Software reset",
            ResetReason::Panic => "Panic reset",
            ResetReason::InterruptWatchdog => "Interrupt watchdog reset",
            ResetReason::TaskWatchdog => "Task watchdog reset",
            ResetReason::OtherWatchdog => "Other watchdog reset",
            ResetReason::DeepSleepWake => "Deep-sleep wakeup",
            ResetReason::Brownout => "Brownout reset",
            ResetReason::PeripheralBus => "SDIO reset",
            ResetReason::Usb => "USB reset",
            ResetReason::Jtag => "JTAG reset",
            ResetReason::Unknown => "Unknown reset reason",
        }
    }
}

impl fmt::Display for ResetReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}
