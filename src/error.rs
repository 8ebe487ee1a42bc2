//! Error types for the test orchestrator.

use thiserror::Error;

/// Result type alias for orchestrator operations.
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Errors that can occur during orchestration.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// Error reported by the HID bus driver.
    #[error("HID bus error: {0}")]
    Bus(String),

    /// Standard I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV encoding or decoding error.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// No record exists for the requested serial number.
    #[error("Device {serial} not found or disconnected")]
    DeviceNotFound { serial: String },

    /// The device has a record but no open handle.
    #[error("Device {serial} is not connected")]
    NotConnected { serial: String },

    /// A report write transferred fewer bytes than the full frame.
    #[error("Short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    /// Inbound frame failed header validation.
    #[error("Frame checksum mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    /// Inbound frame declared an out-of-range payload length.
    #[error("Frame payload length {length} exceeds maximum {max}")]
    PayloadTooLong { length: usize, max: usize },

    /// Inbound frame carried an unknown command discriminant.
    #[error("Unknown command kind: 0x{kind:02X}")]
    UnknownCommandKind { kind: u8 },

    /// No response arrived within the wait deadline.
    #[error("Timeout waiting for response to command {sequence}")]
    ResponseTimeout { sequence: u8 },

    /// Device never reappeared in bootloader mode.
    #[error("Device {serial} did not enter bootloader mode within timeout")]
    BootloaderTimeout { serial: String },

    /// No firmware loader tool could be located.
    #[error("No firmware loader tool available")]
    NoFlashTool,

    /// The firmware image to flash does not exist.
    #[error("Firmware file not found: {path}")]
    FirmwareNotFound { path: String },

    /// The loader sub-process exited non-zero.
    #[error("Flash command failed: {stderr}")]
    FlashCommandFailed { stderr: String },

    /// The bootloader mass-storage volume is not mounted.
    #[error("Could not find bootloader mount point")]
    MountNotFound,

    /// A sub-process exceeded its execution deadline.
    #[error("Sub-process '{program}' timed out after {timeout_ms}ms")]
    SubprocessTimeout { program: String, timeout_ms: u64 },

    /// Two steps in one configuration share a name.
    #[error("Duplicate step name in configuration: {name}")]
    DuplicateStep { name: String },

    /// A predecessor list names a step that does not exist.
    #[error("Step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    /// The step dependency relation contains a cycle.
    #[error("Dependency cycle detected involving step '{name}'")]
    DependencyCycle { name: String },

    /// Operation was cancelled by the caller.
    #[error("Operation cancelled")]
    Cancelled,
}

impl HarnessError {
    /// Check if this error is transient and may succeed on retry.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            HarnessError::ResponseTimeout { .. }
                | HarnessError::ShortWrite { .. }
                | HarnessError::Bus(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_is_retriable() {
        assert!(HarnessError::ResponseTimeout { sequence: 7 }.is_retriable());
        assert!(HarnessError::Bus("read failed".into()).is_retriable());
        assert!(!HarnessError::NoFlashTool.is_retriable());
        assert!(!HarnessError::DuplicateStep {
            name: "step".into()
        }
        .is_retriable());
    }

    #[test]
    fn test_error_display() {
        let err = HarnessError::ShortWrite {
            written: 12,
            expected: 64,
        };
        assert_eq!(err.to_string(), "Short write: 12 of 64 bytes");
    }
}
