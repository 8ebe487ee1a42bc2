//! Firmware flashing and bootloader lifecycle supervision.
//!
//! Drives a device through the three-phase update pipeline: bootloader
//! entry (command + re-enumeration), loader invocation (external
//! sub-process), and reconnection. Each phase has its own timeout and
//! terminal failure; per-phase durations are recorded on the operation.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::{
    BOOTLOADER_MOUNT_CANDIDATES, BOOTLOADER_TIMEOUT, BOOTLOADER_VOLUME_LABEL,
    FLASH_DEVICE_DEADLINE, FLASH_POLL_INTERVAL, FLASH_TOOL_CANDIDATES, FLASH_TOOL_TIMEOUT,
    RECONNECTION_TIMEOUT,
};
use crate::error::{HarnessError, Result};
use crate::exec::CommandExecutor;
use crate::frame::{Command, ResponseStatus};
use crate::poll::poll_until;
use crate::protocol::CommandClient;
use crate::registry::{DeviceRegistry, DeviceStatus};

/// Firmware flashing terminal result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlashResult {
    Success,
    BootloaderEntryFailed,
    FlashFailed,
    ReconnectionFailed,
    Timeout,
    Error,
}

/// Firmware flashing operation tracking.
#[derive(Debug, Clone, Serialize)]
pub struct FlashOperation {
    pub device_serial: String,
    pub firmware_path: PathBuf,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub result: Option<FlashResult>,
    pub error_message: Option<String>,
    /// Elapsed seconds of the bootloader-entry phase.
    pub bootloader_entry_time: Option<f64>,
    /// Elapsed seconds of the loader sub-process phase.
    pub flash_duration: Option<f64>,
    /// Elapsed seconds of the reconnection phase.
    pub reconnection_time: Option<f64>,
}

impl FlashOperation {
    fn new(device_serial: &str, firmware_path: &Path) -> Self {
        Self {
            device_serial: device_serial.to_string(),
            firmware_path: firmware_path.to_path_buf(),
            start_time: Utc::now(),
            end_time: None,
            result: None,
            error_message: None,
            bootloader_entry_time: None,
            flash_duration: None,
            reconnection_time: None,
        }
    }

    /// Total operation duration in seconds.
    pub fn total_duration(&self) -> Option<f64> {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds() as f64 / 1000.0)
    }
}

#[derive(Default)]
struct SupervisorState {
    operations: HashMap<String, FlashOperation>,
    cancelled: HashSet<String>,
}

/// Manages firmware flashing operations: bootloader mode triggering,
/// loader dispatch, and reconnection detection.
pub struct FlashSupervisor {
    registry: Arc<DeviceRegistry>,
    client: Arc<CommandClient>,
    executor: Arc<dyn CommandExecutor>,
    bootloader_timeout: Duration,
    reconnection_timeout: Duration,
    flash_tool: Option<PathBuf>,
    state: Mutex<SupervisorState>,
}

impl FlashSupervisor {
    /// Create a supervisor with default timeouts and auto-detected loader.
    pub fn new(
        registry: Arc<DeviceRegistry>,
        client: Arc<CommandClient>,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        let flash_tool = detect_flash_tool(executor.as_ref());
        Self::with_options(
            registry,
            client,
            executor,
            BOOTLOADER_TIMEOUT,
            RECONNECTION_TIMEOUT,
            flash_tool,
        )
    }

    /// Create a supervisor with explicit timeouts and loader path.
    pub fn with_options(
        registry: Arc<DeviceRegistry>,
        client: Arc<CommandClient>,
        executor: Arc<dyn CommandExecutor>,
        bootloader_timeout: Duration,
        reconnection_timeout: Duration,
        flash_tool: Option<PathBuf>,
    ) -> Self {
        Self {
            registry,
            client,
            executor,
            bootloader_timeout,
            reconnection_timeout,
            flash_tool,
            state: Mutex::new(SupervisorState::default()),
        }
    }

    /// Path of the configured loader tool, if any.
    pub fn flash_tool(&self) -> Option<&Path> {
        self.flash_tool.as_deref()
    }

    /// Verify that a loader tool is available and responds to `--help`.
    pub fn verify_flash_tool(&self) -> bool {
        let Some(tool) = &self.flash_tool else {
            return false;
        };
        self.executor
            .execute_with_timeout(
                &tool.to_string_lossy(),
                vec!["--help".to_string()],
                Duration::from_secs(5),
            )
            .map(|output| output.success)
            .unwrap_or(false)
    }

    /// Flash firmware to a device with full workflow supervision.
    ///
    /// Runs the three phases in order and records per-phase durations.
    /// Never panics or propagates; the outcome lives on the returned
    /// operation record.
    pub fn flash_firmware(&self, serial: &str, firmware_path: &Path) -> FlashOperation {
        self.flash_firmware_with_deadline(serial, firmware_path, Instant::now() + FLASH_DEVICE_DEADLINE)
    }

    fn flash_firmware_with_deadline(
        &self,
        serial: &str,
        firmware_path: &Path,
        deadline: Instant,
    ) -> FlashOperation {
        let operation = FlashOperation::new(serial, firmware_path);
        {
            let mut state = self.state.lock().expect("supervisor lock poisoned");
            state.cancelled.remove(serial);
            state.operations.insert(serial.to_string(), operation);
        }
        info!(serial, "Starting firmware flash operation");

        // Phase 1 - bootloader entry.
        let phase_start = Instant::now();
        let entered = self.enter_bootloader(serial, deadline);
        self.update_operation(serial, |op| {
            op.bootloader_entry_time = Some(phase_start.elapsed().as_secs_f64());
        });
        if !entered {
            return self.finish(serial, FlashResult::BootloaderEntryFailed, Some("Failed to enter bootloader mode"));
        }

        // Phase 2 - loader invocation.
        let phase_start = Instant::now();
        let flash_outcome = self.execute_firmware_flash(serial, firmware_path);
        self.update_operation(serial, |op| {
            op.flash_duration = Some(phase_start.elapsed().as_secs_f64());
        });
        if let Err(e) = flash_outcome {
            let message = e.to_string();
            return self.finish(serial, FlashResult::FlashFailed, Some(&message));
        }

        // Phase 3 - reconnection.
        let phase_start = Instant::now();
        let reconnected = self.wait_for_reconnection(serial, deadline);
        self.update_operation(serial, |op| {
            op.reconnection_time = Some(phase_start.elapsed().as_secs_f64());
        });
        if !reconnected {
            return self.finish(
                serial,
                FlashResult::ReconnectionFailed,
                Some("Device did not reconnect after flashing"),
            );
        }

        info!(serial, "Firmware flash completed successfully");
        self.finish(serial, FlashResult::Success, None)
    }

    /// Trigger bootloader mode entry and watch re-enumeration.
    ///
    /// The device must acknowledge the command, drop out of connected
    /// status, then reappear in bootloader status before the phase
    /// deadline.
    pub fn enter_bootloader(&self, serial: &str, device_deadline: Instant) -> bool {
        if !self.registry.is_connected(serial) {
            error!(serial, "Device not connected");
            return false;
        }
        info!(serial, "Triggering bootloader mode");

        let command = Command::enter_bootloader(self.bootloader_timeout.as_millis() as u64);
        let response = self
            .client
            .send_and_wait(serial, &command, Some(self.bootloader_timeout));
        match response {
            Some(r) if r.status == ResponseStatus::Success => {
                info!(serial, "Bootloader command acknowledged");
            }
            Some(r) => {
                error!(serial, "Bootloader command failed: {}", r.status.name());
                return false;
            }
            None => {
                error!(serial, "Bootloader command failed: no response");
                return false;
            }
        }

        // The handle is about to vanish with the re-enumeration.
        self.registry.disconnect(serial);

        let deadline = (Instant::now() + self.bootloader_timeout).min(device_deadline);
        let dropped = poll_until(FLASH_POLL_INTERVAL, deadline, || {
            if self.is_cancelled(serial) {
                return true;
            }
            self.registry.discover();
            self.registry
                .info(serial)
                .map(|record| record.status != DeviceStatus::Connected)
                .unwrap_or(false)
        });
        if !dropped || self.is_cancelled(serial) {
            error!(serial, "Device did not leave connected status");
            return false;
        }

        let in_bootloader = poll_until(FLASH_POLL_INTERVAL, deadline, || {
            if self.is_cancelled(serial) {
                return true;
            }
            self.registry.discover();
            self.registry
                .info(serial)
                .map(|record| record.status == DeviceStatus::Bootloader)
                .unwrap_or(false)
        });
        if !in_bootloader || self.is_cancelled(serial) {
            error!(serial, "Device did not enter bootloader mode within timeout");
            return false;
        }
        info!(serial, "Device entered bootloader mode");
        true
    }

    /// Dispatch the external loader for one firmware image.
    fn execute_firmware_flash(&self, serial: &str, firmware_path: &Path) -> Result<()> {
        let Some(tool) = &self.flash_tool else {
            error!(serial, "No firmware flashing tool available");
            return Err(HarnessError::NoFlashTool);
        };
        if !firmware_path.exists() {
            return Err(HarnessError::FirmwareNotFound {
                path: firmware_path.display().to_string(),
            });
        }

        let tool_name = tool.to_string_lossy();
        let firmware = firmware_path.to_string_lossy().into_owned();

        if tool_name.contains("uf2conv") {
            // Mass-storage loader: copy the image onto the bootloader volume.
            let mount = self.find_bootloader_mount().ok_or(HarnessError::MountNotFound)?;
            let destination = mount.join(
                firmware_path
                    .file_name()
                    .unwrap_or_else(|| std::ffi::OsStr::new("firmware.uf2")),
            );
            info!(serial, "Copying firmware to {}", destination.display());
            std::fs::copy(firmware_path, &destination)?;
            return Ok(());
        }

        let args = if tool_name.contains("picotool") {
            vec!["load".to_string(), firmware, "--force".to_string()]
        } else {
            vec![firmware]
        };

        info!(serial, "Executing flash command: {} {}", tool_name, args.join(" "));
        let output = self
            .executor
            .execute_with_timeout(&tool_name, args, FLASH_TOOL_TIMEOUT)?;
        if output.success {
            info!(serial, "Firmware flashing completed");
            Ok(())
        } else {
            Err(HarnessError::FlashCommandFailed {
                stderr: output.stderr.trim().to_string(),
            })
        }
    }

    /// Locate the bootloader mass-storage mount point.
    fn find_bootloader_mount(&self) -> Option<PathBuf> {
        for candidate in BOOTLOADER_MOUNT_CANDIDATES {
            let path = Path::new(candidate);
            if path.is_dir() {
                return Some(path.to_path_buf());
            }
        }

        // Fall back to the system mount table.
        let output = self.executor.execute("mount", vec![]).ok()?;
        for line in output.stdout.lines() {
            if line.contains(BOOTLOADER_VOLUME_LABEL) {
                let mut parts = line.split_whitespace();
                // "<source> on <mount point> ..." - third field.
                if let Some(mount_point) = parts.nth(2) {
                    return Some(PathBuf::from(mount_point));
                }
            }
        }
        None
    }

    /// Wait for the device to reappear connected, then reopen its handle.
    fn wait_for_reconnection(&self, serial: &str, device_deadline: Instant) -> bool {
        info!(serial, "Waiting for device to reconnect");
        let deadline = (Instant::now() + self.reconnection_timeout).min(device_deadline);
        let reconnected = poll_until(FLASH_POLL_INTERVAL, deadline, || {
            if self.is_cancelled(serial) {
                return true;
            }
            self.registry.discover();
            let connected = self
                .registry
                .info(serial)
                .map(|record| record.status == DeviceStatus::Connected)
                .unwrap_or(false);
            connected && self.registry.connect(serial)
        });
        if !reconnected || self.is_cancelled(serial) {
            error!(
                serial,
                "Device did not reconnect within {:.0}s",
                self.reconnection_timeout.as_secs_f64()
            );
            return false;
        }
        info!(serial, "Device reconnected successfully");
        true
    }

    /// Flash firmware to multiple devices.
    ///
    /// Parallel mode submits one worker per device to a bounded pool;
    /// sequential mode preserves map order.
    pub fn flash_multiple(
        &self,
        device_firmware_map: &HashMap<String, PathBuf>,
        parallel: bool,
        max_parallel: usize,
    ) -> HashMap<String, FlashOperation> {
        if device_firmware_map.is_empty() {
            return HashMap::new();
        }
        info!(
            "Starting firmware flash for {} device(s)",
            device_firmware_map.len()
        );

        let mut pairs: Vec<(&String, &PathBuf)> = device_firmware_map.iter().collect();
        pairs.sort_by(|a, b| a.0.cmp(b.0));

        if !parallel {
            return pairs
                .into_iter()
                .map(|(serial, firmware)| {
                    let operation = self.flash_firmware(serial, firmware);
                    if operation.result != Some(FlashResult::Success) {
                        error!(
                            serial = serial.as_str(),
                            "Flash failed: {}",
                            operation.error_message.as_deref().unwrap_or("unknown")
                        );
                    }
                    (serial.clone(), operation)
                })
                .collect();
        }

        let workers = max_parallel.max(1).min(pairs.len());
        let pool = match rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("flash-worker-{i}"))
            .build()
        {
            Ok(pool) => pool,
            Err(e) => {
                error!("Failed to build flash worker pool: {e}");
                return HashMap::new();
            }
        };

        pool.install(|| {
            pairs
                .par_iter()
                .map(|(serial, firmware)| {
                    let deadline = Instant::now() + FLASH_DEVICE_DEADLINE;
                    let operation = self.flash_firmware_with_deadline(serial, firmware, deadline);
                    ((*serial).clone(), operation)
                })
                .collect()
        })
    }

    /// Current flash operation record for a device.
    pub fn operation_status(&self, serial: &str) -> Option<FlashOperation> {
        let state = self.state.lock().expect("supervisor lock poisoned");
        state.operations.get(serial).cloned()
    }

    /// Cancel an in-flight flash operation for a device.
    ///
    /// Cooperative: the current phase poll observes the flag at its next
    /// iteration.
    pub fn cancel(&self, serial: &str) -> bool {
        let mut state = self.state.lock().expect("supervisor lock poisoned");
        state.cancelled.insert(serial.to_string());
        match state.operations.get_mut(serial) {
            Some(operation) if operation.end_time.is_none() => {
                operation.result = Some(FlashResult::Error);
                operation.error_message = Some("Operation cancelled".to_string());
                operation.end_time = Some(Utc::now());
                true
            }
            _ => false,
        }
    }

    fn is_cancelled(&self, serial: &str) -> bool {
        let state = self.state.lock().expect("supervisor lock poisoned");
        state.cancelled.contains(serial)
    }

    fn update_operation<F: FnOnce(&mut FlashOperation)>(&self, serial: &str, f: F) {
        let mut state = self.state.lock().expect("supervisor lock poisoned");
        if let Some(operation) = state.operations.get_mut(serial) {
            f(operation);
        }
    }

    /// Fix the operation's terminal result, unless a cancel already did.
    fn finish(
        &self,
        serial: &str,
        result: FlashResult,
        error_message: Option<&str>,
    ) -> FlashOperation {
        let mut state = self.state.lock().expect("supervisor lock poisoned");
        let operation = state
            .operations
            .get_mut(serial)
            .expect("operation inserted at start");
        if operation.end_time.is_none() {
            operation.result = Some(result);
            operation.error_message = error_message.map(str::to_string);
            operation.end_time = Some(Utc::now());
        }
        operation.clone()
    }
}

/// Auto-detect an available firmware loader via `which`.
pub fn detect_flash_tool(executor: &dyn CommandExecutor) -> Option<PathBuf> {
    for tool in FLASH_TOOL_CANDIDATES {
        if let Ok(output) = executor.execute("which", vec![tool.to_string()]) {
            if output.success {
                let path = output.stdout.trim().to_string();
                if !path.is_empty() {
                    info!("Detected flash tool: {path}");
                    return Some(PathBuf::from(path));
                }
            }
        }
    }
    warn!("No firmware flashing tool detected. Manual path required.");
    None
}
