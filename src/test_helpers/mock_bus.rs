//! Scripted in-memory HID bus for tests.
//!
//! `MockBus` plays the role of the HID driver; `ScriptedDevice` emulates
//! one device end-to-end: it decodes outbound command frames, replies
//! according to a per-command script, and re-enumerates through mode
//! transitions (normal / bootloader / gone) on a configurable timeline.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::bus::{BusDeviceInfo, DeviceHandle, HidBus, REPORT_SIZE};
use crate::config::{RP2040_BOOTLOADER_PID, RP2040_PID, RP2040_VID};
use crate::error::{HarnessError, Result};
use crate::frame::{Command, CommandKind, ResponseStatus, RESPONSE_TAG};

/// Bus-visible mode of a scripted device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockMode {
    Normal,
    Bootloader,
    Gone,
}

/// One scripted reply to a command.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Swallow the command; no response is emitted.
    Ignore,
    /// Respond with the given status and data bag.
    Respond(ResponseStatus, Value),
}

impl Reply {
    /// Respond with a status and empty data.
    pub fn status(status: ResponseStatus) -> Self {
        Reply::Respond(status, Value::Object(Default::default()))
    }

    /// Respond success with empty data.
    pub fn success() -> Self {
        Self::status(ResponseStatus::Success)
    }
}

#[derive(Hash, PartialEq, Eq)]
enum ScriptKey {
    Kind(u8),
    Test(u8),
}

struct DeviceState {
    base_mode: MockMode,
    transitions: Vec<(Instant, MockMode)>,
    scripts: HashMap<ScriptKey, VecDeque<Reply>>,
    bootloader_ack_plan: Vec<(Duration, MockMode)>,
    outgoing: VecDeque<[u8; REPORT_SIZE]>,
    written: Vec<Command>,
}

struct DeviceShared {
    serial: String,
    path: String,
    state: Mutex<DeviceState>,
    fail_writes_short: AtomicBool,
}

impl DeviceShared {
    fn current_mode(&self) -> MockMode {
        let state = self.state.lock().expect("mock device lock");
        let now = Instant::now();
        state
            .transitions
            .iter()
            .filter(|(at, _)| *at <= now)
            .last()
            .map(|(_, mode)| *mode)
            .unwrap_or(state.base_mode)
    }
}

/// A scripted device registered on a [`MockBus`].
#[derive(Clone)]
pub struct ScriptedDevice {
    shared: Arc<DeviceShared>,
}

impl ScriptedDevice {
    fn with_mode(serial: &str, base_mode: MockMode) -> Self {
        Self {
            shared: Arc::new(DeviceShared {
                serial: serial.to_string(),
                path: format!("/mock/hid/{serial}"),
                state: Mutex::new(DeviceState {
                    base_mode,
                    transitions: Vec::new(),
                    scripts: HashMap::new(),
                    bootloader_ack_plan: Vec::new(),
                    outgoing: VecDeque::new(),
                    written: Vec::new(),
                }),
                fail_writes_short: AtomicBool::new(false),
            }),
        }
    }

    /// A device enumerated in normal operation mode.
    pub fn connected(serial: &str) -> Self {
        Self::with_mode(serial, MockMode::Normal)
    }

    /// A device enumerated in bootloader mode.
    pub fn bootloader(serial: &str) -> Self {
        Self::with_mode(serial, MockMode::Bootloader)
    }

    /// Serial number of this device.
    pub fn serial(&self) -> &str {
        &self.shared.serial
    }

    /// Queue one scripted reply for a command kind.
    ///
    /// Replies pop in FIFO order; once the queue is empty the device
    /// answers success.
    pub fn script(&self, kind: CommandKind, reply: Reply) {
        let mut state = self.shared.state.lock().expect("mock device lock");
        state
            .scripts
            .entry(ScriptKey::Kind(kind as u8))
            .or_default()
            .push_back(reply);
    }

    /// Queue one scripted reply for a specific test kind carried in an
    /// execute-test command.
    pub fn script_test(&self, test_type: crate::frame::TestKind, reply: Reply) {
        let mut state = self.shared.state.lock().expect("mock device lock");
        state
            .scripts
            .entry(ScriptKey::Test(test_type as u8))
            .or_default()
            .push_back(reply);
    }

    /// Make every write report fewer bytes than the full frame.
    pub fn fail_writes_short(&self) {
        self.shared.fail_writes_short.store(true, Ordering::SeqCst);
    }

    /// Push a raw text line into the device's outbound stream.
    pub fn inject_line(&self, line: &str) {
        assert!(line.len() <= REPORT_SIZE, "mock line exceeds report size");
        let mut report = [0u8; REPORT_SIZE];
        report[..line.len()].copy_from_slice(line.as_bytes());
        let mut state = self.shared.state.lock().expect("mock device lock");
        state.outgoing.push_back(report);
    }

    /// Schedule a mode transition at `delay` from now.
    pub fn set_mode_after(&self, delay: Duration, mode: MockMode) {
        let mut state = self.shared.state.lock().expect("mock device lock");
        state.transitions.push((Instant::now() + delay, mode));
    }

    /// Arm mode transitions that fire once the device acknowledges an
    /// enter-bootloader command (relative to the acknowledgement time).
    pub fn schedule_after_bootloader_ack(&self, plan: &[(Duration, MockMode)]) {
        let mut state = self.shared.state.lock().expect("mock device lock");
        state.bootloader_ack_plan = plan.to_vec();
    }

    /// Commands decoded from host writes, in order.
    pub fn written_commands(&self) -> Vec<Command> {
        let state = self.shared.state.lock().expect("mock device lock");
        state.written.clone()
    }

    fn enumeration_info(&self) -> Option<BusDeviceInfo> {
        let (product_id, product) = match self.shared.current_mode() {
            MockMode::Normal => (RP2040_PID, "Test Device"),
            MockMode::Bootloader => (RP2040_BOOTLOADER_PID, "RP2 Boot"),
            MockMode::Gone => return None,
        };
        Some(BusDeviceInfo {
            vendor_id: RP2040_VID,
            product_id,
            serial_number: self.shared.serial.clone(),
            manufacturer: "MockWorks".to_string(),
            product: product.to_string(),
            path: self.shared.path.clone(),
        })
    }
}

/// In-memory HID bus holding scripted devices.
#[derive(Default)]
pub struct MockBus {
    devices: Mutex<Vec<ScriptedDevice>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device on the bus.
    pub fn add_device(&self, device: ScriptedDevice) {
        self.devices.lock().expect("mock bus lock").push(device);
    }

    /// Remove a device from the bus entirely.
    pub fn remove_device(&self, serial: &str) {
        self.devices
            .lock()
            .expect("mock bus lock")
            .retain(|d| d.serial() != serial);
    }

    /// Find a registered device by serial.
    pub fn device(&self, serial: &str) -> Option<ScriptedDevice> {
        self.devices
            .lock()
            .expect("mock bus lock")
            .iter()
            .find(|d| d.serial() == serial)
            .cloned()
    }
}

impl HidBus for MockBus {
    fn enumerate(&self, vendor_id: u16, product_id: u16) -> Result<Vec<BusDeviceInfo>> {
        let devices = self.devices.lock().expect("mock bus lock");
        Ok(devices
            .iter()
            .filter_map(|device| device.enumeration_info())
            .filter(|info| info.vendor_id == vendor_id && info.product_id == product_id)
            .collect())
    }

    fn open(&self, path: &str) -> Result<Arc<dyn DeviceHandle>> {
        let devices = self.devices.lock().expect("mock bus lock");
        let device = devices
            .iter()
            .find(|d| d.shared.path == path)
            .ok_or_else(|| HarnessError::Bus(format!("no device at {path}")))?;
        if device.shared.current_mode() == MockMode::Gone {
            return Err(HarnessError::Bus(format!("device at {path} is gone")));
        }
        Ok(Arc::new(ScriptedHandle {
            shared: Arc::clone(&device.shared),
        }))
    }
}

struct ScriptedHandle {
    shared: Arc<DeviceShared>,
}

impl DeviceHandle for ScriptedHandle {
    fn write_report(&self, report: &[u8; REPORT_SIZE]) -> Result<usize> {
        if self.shared.fail_writes_short.load(Ordering::SeqCst) {
            return Ok(REPORT_SIZE / 2);
        }

        let command = Command::decode(report)?;
        let mut state = self.shared.state.lock().expect("mock device lock");
        state.written.push(command.clone());

        let reply = pick_reply(&mut state, &command);
        if let Reply::Respond(status, data) = reply {
            if command.kind == CommandKind::EnterBootloader && status == ResponseStatus::Success {
                let now = Instant::now();
                let plan: Vec<(Instant, MockMode)> = state
                    .bootloader_ack_plan
                    .iter()
                    .map(|(delay, mode)| (now + *delay, *mode))
                    .collect();
                state.transitions.extend(plan);
            }

            let mut body = serde_json::json!({
                "command_id": command.sequence,
                "status": status as u8,
            });
            if data.as_object().map(|m| !m.is_empty()).unwrap_or(false) {
                body["data"] = data;
            }
            let line = format!("{RESPONSE_TAG}{body}");
            assert!(
                line.len() <= REPORT_SIZE,
                "scripted response exceeds report size: {line}"
            );
            let mut response = [0u8; REPORT_SIZE];
            response[..line.len()].copy_from_slice(line.as_bytes());
            state.outgoing.push_back(response);
        }

        Ok(REPORT_SIZE)
    }

    fn read_report(&self, _timeout_ms: i32) -> Result<Option<[u8; REPORT_SIZE]>> {
        let mut state = self.shared.state.lock().expect("mock device lock");
        Ok(state.outgoing.pop_front())
    }
}

fn pick_reply(state: &mut DeviceState, command: &Command) -> Reply {
    if command.kind == CommandKind::ExecuteTest {
        if let Some(test_type) = command
            .payload
            .get("test_type")
            .and_then(Value::as_u64)
        {
            if let Some(queue) = state.scripts.get_mut(&ScriptKey::Test(test_type as u8)) {
                if let Some(reply) = queue.pop_front() {
                    return reply;
                }
            }
        }
    }
    if let Some(queue) = state.scripts.get_mut(&ScriptKey::Kind(command.kind as u8)) {
        if let Some(reply) = queue.pop_front() {
            return reply;
        }
    }
    Reply::success()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::TestKind;

    #[test]
    fn test_device_disappears_and_reappears_in_bootloader() {
        let bus = MockBus::new();
        let device = ScriptedDevice::connected("DEV001");
        bus.add_device(device.clone());

        assert_eq!(bus.enumerate(RP2040_VID, RP2040_PID).unwrap().len(), 1);

        device.set_mode_after(Duration::ZERO, MockMode::Gone);
        std::thread::sleep(Duration::from_millis(5));
        assert!(bus.enumerate(RP2040_VID, RP2040_PID).unwrap().is_empty());
        assert!(bus
            .enumerate(RP2040_VID, RP2040_BOOTLOADER_PID)
            .unwrap()
            .is_empty());

        device.set_mode_after(Duration::ZERO, MockMode::Bootloader);
        std::thread::sleep(Duration::from_millis(5));
        let boot = bus.enumerate(RP2040_VID, RP2040_BOOTLOADER_PID).unwrap();
        assert_eq!(boot.len(), 1);
        assert_eq!(boot[0].product_id, RP2040_BOOTLOADER_PID);
    }

    #[test]
    fn test_scripted_replies_pop_in_order() {
        let bus = MockBus::new();
        let device = ScriptedDevice::connected("DEV001");
        device.script_test(TestKind::LedFunctionality, Reply::Ignore);
        device.script_test(
            TestKind::LedFunctionality,
            Reply::status(ResponseStatus::SystemBusy),
        );
        bus.add_device(device.clone());

        let handle = bus.open("/mock/hid/DEV001").unwrap();
        let mut command =
            Command::execute_test(TestKind::LedFunctionality, serde_json::json!({}));
        command.sequence = 1;
        handle.write_report(&command.encode()).unwrap();
        // First reply ignored: nothing to read.
        assert!(handle.read_report(0).unwrap().is_none());

        command.sequence = 2;
        handle.write_report(&command.encode()).unwrap();
        let report = handle.read_report(0).unwrap().expect("reply expected");
        let text = std::str::from_utf8(&report).unwrap().trim_end_matches('\0');
        assert!(text.contains("\"status\":4"));
        assert!(text.contains("\"command_id\":2"));

        // Queue exhausted: defaults to success.
        command.sequence = 3;
        handle.write_report(&command.encode()).unwrap();
        let report = handle.read_report(0).unwrap().expect("reply expected");
        let text = std::str::from_utf8(&report).unwrap();
        assert!(text.contains("\"status\":0"));
    }

    #[test]
    fn test_bootloader_ack_arms_transition_plan() {
        let bus = MockBus::new();
        let device = ScriptedDevice::connected("DEV001");
        device.schedule_after_bootloader_ack(&[
            (Duration::from_millis(0), MockMode::Gone),
            (Duration::from_millis(20), MockMode::Bootloader),
        ]);
        bus.add_device(device.clone());

        let handle = bus.open("/mock/hid/DEV001").unwrap();
        let mut command = Command::enter_bootloader(5000);
        command.sequence = 1;
        handle.write_report(&command.encode()).unwrap();

        std::thread::sleep(Duration::from_millis(5));
        assert!(bus.enumerate(RP2040_VID, RP2040_PID).unwrap().is_empty());
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(
            bus.enumerate(RP2040_VID, RP2040_BOOTLOADER_PID)
                .unwrap()
                .len(),
            1
        );
    }
}
