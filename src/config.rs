//! Configuration constants for device identification and orchestration timing.

// Allow unused items - these are part of the protocol spec and may be used by
// callers embedding the library.
#![allow(dead_code)]

use std::time::Duration;

// ============================================================================
// USB Device Identifiers
// ============================================================================

/// Raspberry Pi Foundation USB Vendor ID.
pub const RP2040_VID: u16 = 0x2E8A;

/// Product ID for the device in normal operation mode.
pub const RP2040_PID: u16 = 0x000A;

/// Product ID for the device in bootloader mode.
pub const RP2040_BOOTLOADER_PID: u16 = 0x0003;

/// Vendor-specific pairing used by alternate device variants.
pub const ALT_DEVICE_VID: u16 = 0xFADE;

/// Product ID for alternate device variants (normal mode).
pub const ALT_DEVICE_PID: u16 = 0x1212;

// ============================================================================
// Discovery and Connection Timing
// ============================================================================

/// Default timeout for device connection attempts.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between device discovery scans.
pub const DISCOVERY_INTERVAL: Duration = Duration::from_secs(1);

/// Timeout waiting for a device to reconnect after a firmware flash.
pub const RECONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout waiting for a device to enter bootloader mode.
pub const BOOTLOADER_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Protocol Timing
// ============================================================================

/// Default timeout waiting for a command response.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between read-pump polls while waiting for a response.
pub const RESPONSE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Per-read timeout for the non-blocking HID input drain, in milliseconds.
pub const READ_DRAIN_TIMEOUT_MS: i32 = 10;

/// Delay between consecutive setup/teardown commands.
pub const COMMAND_GAP: Duration = Duration::from_millis(100);

/// Backoff inserted between test retry attempts.
pub const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Budget reserved at the end of a step's window; retries that would not fit
/// within it are not attempted.
pub const RETRY_TIME_BUFFER: Duration = Duration::from_secs(2);

// ============================================================================
// Flash Workflow
// ============================================================================

/// Timeout for the external loader sub-process.
pub const FLASH_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

/// Per-device deadline for one worker in parallel flash mode.
pub const FLASH_DEVICE_DEADLINE: Duration = Duration::from_secs(300);

/// Interval between registry polls during flash phase transitions.
pub const FLASH_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Loader tools probed in order during auto-detection.
pub const FLASH_TOOL_CANDIDATES: &[&str] = &["picotool", "uf2conv.py", "rp2040load"];

/// Well-known mount points for the bootloader mass-storage volume.
pub const BOOTLOADER_MOUNT_CANDIDATES: &[&str] =
    &["/media/RPI-RP2", "/mnt/RPI-RP2", "/Volumes/RPI-RP2"];

/// Volume label exposed by the bootloader mass-storage device.
pub const BOOTLOADER_VOLUME_LABEL: &str = "RPI-RP2";

// ============================================================================
// Monitoring
// ============================================================================

/// Maximum entries retained in each monitoring ring buffer.
pub const MAX_HISTORY_SIZE: usize = 1000;

/// Interval between device health evaluations.
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Interval between periodic status report lines.
pub const PERIODIC_STATUS_INTERVAL: Duration = Duration::from_secs(10);

/// Current-test inactivity threshold that flags a device as warning.
pub const STALL_WARNING_SECS: i64 = 60;

/// Inactivity threshold that flags a device as unresponsive (error).
pub const STALL_ERROR_SECS: i64 = 300;

/// Device log lines captured into a failure snapshot.
pub const SNAPSHOT_LOG_LINES: usize = 50;

/// Communication entries captured into a failure snapshot.
pub const SNAPSHOT_COMM_ENTRIES: usize = 20;

// ============================================================================
// Identification Helpers
// ============================================================================

/// Check if a VID/PID pairing is a supported device in normal operation mode.
pub fn is_normal_mode(vid: u16, pid: u16) -> bool {
    (vid == RP2040_VID && pid == RP2040_PID) || (vid == ALT_DEVICE_VID && pid == ALT_DEVICE_PID)
}

/// Check if a VID/PID pairing is a supported device in bootloader mode.
pub fn is_bootloader_mode(vid: u16, pid: u16) -> bool {
    vid == RP2040_VID && pid == RP2040_BOOTLOADER_PID
}

/// Check if a VID/PID pairing is any supported device.
pub fn is_compatible_device(vid: u16, pid: u16) -> bool {
    is_normal_mode(vid, pid) || is_bootloader_mode(vid, pid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_normal_mode() {
        assert!(is_normal_mode(RP2040_VID, RP2040_PID));
        assert!(is_normal_mode(ALT_DEVICE_VID, ALT_DEVICE_PID));
        assert!(!is_normal_mode(RP2040_VID, RP2040_BOOTLOADER_PID));
        assert!(!is_normal_mode(0x1234, RP2040_PID));
    }

    #[test]
    fn test_is_bootloader_mode() {
        assert!(is_bootloader_mode(RP2040_VID, RP2040_BOOTLOADER_PID));
        assert!(!is_bootloader_mode(RP2040_VID, RP2040_PID));
        assert!(!is_bootloader_mode(ALT_DEVICE_VID, ALT_DEVICE_PID));
    }

    #[test]
    fn test_is_compatible_device() {
        assert!(is_compatible_device(RP2040_VID, RP2040_PID));
        assert!(is_compatible_device(RP2040_VID, RP2040_BOOTLOADER_PID));
        assert!(is_compatible_device(ALT_DEVICE_VID, ALT_DEVICE_PID));
        assert!(!is_compatible_device(0x1234, 0x5678));
    }
}
