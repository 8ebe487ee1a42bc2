//! 64-byte wire frame encoding and decoding.
//!
//! Outbound commands are fixed 64-byte HID reports: byte 0 command kind,
//! byte 1 sequence id, byte 2 payload length, byte 3 header checksum,
//! bytes 4.. textual JSON payload, zero padded. Inbound reports are UTF-8
//! text; packets tagged `TEST_RESPONSE:` carry structured responses, all
//! other packets are opaque device log lines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bus::REPORT_SIZE;
use crate::error::{HarnessError, Result};

/// Maximum payload bytes that fit in one report.
pub const MAX_PAYLOAD: usize = 61;

/// Leading tag that distinguishes responses from log lines.
pub const RESPONSE_TAG: &str = "TEST_RESPONSE:";

/// Test command kinds, as wire discriminants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CommandKind {
    EnterBootloader = 0x80,
    SystemStateQuery = 0x81,
    ExecuteTest = 0x82,
    ConfigurationQuery = 0x83,
    PerformanceMetrics = 0x84,
}

impl CommandKind {
    /// Parse a command kind from its wire discriminant.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x80 => Some(CommandKind::EnterBootloader),
            0x81 => Some(CommandKind::SystemStateQuery),
            0x82 => Some(CommandKind::ExecuteTest),
            0x83 => Some(CommandKind::ConfigurationQuery),
            0x84 => Some(CommandKind::PerformanceMetrics),
            _ => None,
        }
    }

    /// Name as used in monitoring and report output.
    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::EnterBootloader => "ENTER_BOOTLOADER",
            CommandKind::SystemStateQuery => "SYSTEM_STATE_QUERY",
            CommandKind::ExecuteTest => "EXECUTE_TEST",
            CommandKind::ConfigurationQuery => "CONFIGURATION_QUERY",
            CommandKind::PerformanceMetrics => "PERFORMANCE_METRICS",
        }
    }
}

/// Command response status codes reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ResponseStatus {
    Success = 0x00,
    InvalidCommand = 0x01,
    AuthenticationFailed = 0x02,
    ParameterInvalid = 0x03,
    SystemBusy = 0x04,
    HardwareFault = 0x05,
    Timeout = 0x06,
}

impl ResponseStatus {
    /// Parse a status from its wire code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(ResponseStatus::Success),
            0x01 => Some(ResponseStatus::InvalidCommand),
            0x02 => Some(ResponseStatus::AuthenticationFailed),
            0x03 => Some(ResponseStatus::ParameterInvalid),
            0x04 => Some(ResponseStatus::SystemBusy),
            0x05 => Some(ResponseStatus::HardwareFault),
            0x06 => Some(ResponseStatus::Timeout),
            _ => None,
        }
    }

    /// Name as used in error messages and reports.
    pub fn name(&self) -> &'static str {
        match self {
            ResponseStatus::Success => "SUCCESS",
            ResponseStatus::InvalidCommand => "ERROR_INVALID_COMMAND",
            ResponseStatus::AuthenticationFailed => "ERROR_AUTHENTICATION_FAILED",
            ResponseStatus::ParameterInvalid => "ERROR_PARAMETER_INVALID",
            ResponseStatus::SystemBusy => "ERROR_SYSTEM_BUSY",
            ResponseStatus::HardwareFault => "ERROR_HARDWARE_FAULT",
            ResponseStatus::Timeout => "ERROR_TIMEOUT",
        }
    }
}

/// Test kinds understood by the device firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum TestKind {
    PemfTimingValidation = 0x01,
    BatteryAdcCalibration = 0x02,
    LedFunctionality = 0x03,
    SystemStressTest = 0x04,
    UsbCommunicationTest = 0x05,
}

impl TestKind {
    /// Name as used in reports.
    pub fn name(&self) -> &'static str {
        match self {
            TestKind::PemfTimingValidation => "PEMF_TIMING_VALIDATION",
            TestKind::BatteryAdcCalibration => "BATTERY_ADC_CALIBRATION",
            TestKind::LedFunctionality => "LED_FUNCTIONALITY",
            TestKind::SystemStressTest => "SYSTEM_STRESS_TEST",
            TestKind::UsbCommunicationTest => "USB_COMMUNICATION_TEST",
        }
    }
}

/// An outbound command frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Command {
    /// Command kind discriminant.
    pub kind: CommandKind,
    /// Sequence id, assigned by the protocol layer at send time.
    pub sequence: u8,
    /// Structured payload, serialised as JSON text on the wire.
    pub payload: Value,
}

impl Command {
    /// Create a command with an unassigned sequence id.
    pub fn new(kind: CommandKind, payload: Value) -> Self {
        Self {
            kind,
            sequence: 0,
            payload,
        }
    }

    /// Create a bootloader entry command.
    pub fn enter_bootloader(timeout_ms: u64) -> Self {
        Self::new(
            CommandKind::EnterBootloader,
            serde_json::json!({ "timeout_ms": timeout_ms }),
        )
    }

    /// Create a system state query command.
    pub fn system_state_query(query_type: &str) -> Self {
        Self::new(
            CommandKind::SystemStateQuery,
            serde_json::json!({ "query_type": query_type }),
        )
    }

    /// Create a test execution command.
    pub fn execute_test(test_type: TestKind, parameters: Value) -> Self {
        Self::new(
            CommandKind::ExecuteTest,
            serde_json::json!({
                "test_type": test_type as u8,
                "parameters": parameters,
            }),
        )
    }

    /// Create a configuration query command.
    pub fn configuration_query() -> Self {
        Self::new(CommandKind::ConfigurationQuery, serde_json::json!({}))
    }

    /// Create a performance metrics query command.
    pub fn performance_metrics() -> Self {
        Self::new(CommandKind::PerformanceMetrics, serde_json::json!({}))
    }

    /// Encode into the 64-byte report format.
    ///
    /// Payloads longer than 61 bytes are truncated at the report boundary;
    /// the checksum covers the truncated length.
    pub fn encode(&self) -> [u8; REPORT_SIZE] {
        let payload_json = self.payload.to_string();
        let payload_bytes = payload_json.as_bytes();
        let length = payload_bytes.len().min(MAX_PAYLOAD);

        let mut report = [0u8; REPORT_SIZE];
        report[0] = self.kind as u8;
        report[1] = self.sequence;
        report[2] = length as u8;
        report[3] = checksum(self.kind as u8, self.sequence, length as u8);
        report[4..4 + length].copy_from_slice(&payload_bytes[..length]);
        report
    }

    /// Decode a command from the 64-byte report format.
    pub fn decode(report: &[u8; REPORT_SIZE]) -> Result<Self> {
        let kind = CommandKind::from_byte(report[0])
            .ok_or(HarnessError::UnknownCommandKind { kind: report[0] })?;
        let sequence = report[1];
        let length = report[2] as usize;
        if length > MAX_PAYLOAD {
            return Err(HarnessError::PayloadTooLong {
                length,
                max: MAX_PAYLOAD,
            });
        }
        let expected = checksum(report[0], sequence, report[2]);
        if report[3] != expected {
            return Err(HarnessError::ChecksumMismatch {
                expected,
                actual: report[3],
            });
        }
        let payload = serde_json::from_slice(&report[4..4 + length])?;
        Ok(Self {
            kind,
            sequence,
            payload,
        })
    }
}

/// Header checksum: (kind + sequence + length) mod 256.
fn checksum(kind: u8, sequence: u8, length: u8) -> u8 {
    kind.wrapping_add(sequence).wrapping_add(length)
}

/// An inbound response record.
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    /// Sequence id of the originating command.
    pub sequence: u8,
    /// Device-reported status.
    pub status: ResponseStatus,
    /// Response type tag.
    pub response_type: String,
    /// Structured response data.
    pub data: Value,
    /// Receive timestamp.
    pub timestamp: DateTime<Utc>,
}

#[derive(Deserialize)]
struct ResponseWire {
    #[serde(default)]
    command_id: u8,
    #[serde(default)]
    status: u8,
    #[serde(default = "default_response_type", rename = "type")]
    response_type: String,
    #[serde(default)]
    data: Value,
}

fn default_response_type() -> String {
    "unknown".to_string()
}

impl Response {
    /// Parse a response from a device log line.
    ///
    /// Returns `None` when the line is not a response or fails to parse;
    /// such lines stay in the log stream.
    pub fn from_log_line(line: &str) -> Option<Self> {
        let body = line.strip_prefix(RESPONSE_TAG)?;
        let wire: ResponseWire = match serde_json::from_str(body) {
            Ok(wire) => wire,
            Err(e) => {
                tracing::error!("Failed to parse response: {e}");
                return None;
            }
        };
        let status = ResponseStatus::from_code(wire.status)?;
        Some(Self {
            sequence: wire.command_id,
            status,
            response_type: wire.response_type,
            data: wire.data,
            timestamp: Utc::now(),
        })
    }

    /// Numeric performance metrics attached to this response, if any.
    pub fn performance_metrics(&self) -> Vec<(String, f64)> {
        self.data
            .get("performance_metrics")
            .and_then(Value::as_object)
            .map(|metrics| {
                metrics
                    .iter()
                    .filter_map(|(name, value)| value.as_f64().map(|v| (name.clone(), v)))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// One classified inbound report from the read pump.
#[derive(Debug)]
pub enum ReadEvent {
    /// A structured test response.
    Response(Response),
    /// An opaque device log line.
    LogLine(String),
    /// Nothing decodable (empty or non-UTF-8 packet).
    Empty,
}

/// Classify one inbound 64-byte report.
pub fn classify_report(report: &[u8; REPORT_SIZE]) -> ReadEvent {
    let text = match std::str::from_utf8(report) {
        Ok(text) => text.trim_end_matches('\0'),
        Err(_) => return ReadEvent::Empty,
    };
    if text.is_empty() {
        return ReadEvent::Empty;
    }
    match Response::from_log_line(text) {
        Some(response) => ReadEvent::Response(response),
        None => ReadEvent::LogLine(text.to_string()),
    }
}
