//! Device discovery, status tracking, and handle ownership.
//!
//! The registry enumerates candidate devices on the HID bus (normal and
//! bootloader product ids), tracks their lifecycle, owns the open handles,
//! and provides the polling primitives other components use to synchronise
//! with bus-visible state changes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::bus::{DeviceHandle, HidBus};
use crate::config::{
    ALT_DEVICE_PID, ALT_DEVICE_VID, CONNECTION_TIMEOUT, DISCOVERY_INTERVAL, RP2040_BOOTLOADER_PID,
    RP2040_PID, RP2040_VID,
};
use crate::poll::poll_until;

/// Device connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Disconnected,
    Connected,
    Bootloader,
    Error,
}

impl DeviceStatus {
    /// Status string as used in reports and log lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Disconnected => "disconnected",
            DeviceStatus::Connected => "connected",
            DeviceStatus::Bootloader => "bootloader",
            DeviceStatus::Error => "error",
        }
    }
}

/// Information about a tracked device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceRecord {
    /// USB Vendor ID.
    pub vendor_id: u16,
    /// USB Product ID.
    pub product_id: u16,
    /// Device serial number.
    pub serial_number: String,
    /// Manufacturer name (if reported).
    pub manufacturer: String,
    /// Product name (if reported).
    pub product: String,
    /// Opaque bus path used to open the device.
    #[serde(skip)]
    pub path: String,
    /// Current connection status.
    pub status: DeviceStatus,
    /// Wall-clock of the last successful enumeration sighting.
    pub last_seen: DateTime<Utc>,
}

struct RegistryInner {
    devices: HashMap<String, DeviceRecord>,
    handles: HashMap<String, Arc<dyn DeviceHandle>>,
}

/// Manages USB HID device discovery and connection for automated testing.
///
/// Supports multi-device testing with device identification and status
/// tracking. The registry is the sole owner of open handles; borrowed
/// references are valid for the duration of a single operation.
pub struct DeviceRegistry {
    bus: Arc<dyn HidBus>,
    connection_timeout: Duration,
    discovery_interval: Duration,
    inner: Mutex<RegistryInner>,
}

impl DeviceRegistry {
    /// Create a registry with default discovery timing.
    pub fn new(bus: Arc<dyn HidBus>) -> Self {
        Self::with_timing(bus, CONNECTION_TIMEOUT, DISCOVERY_INTERVAL)
    }

    /// Create a registry with explicit connection timeout and poll interval.
    pub fn with_timing(
        bus: Arc<dyn HidBus>,
        connection_timeout: Duration,
        discovery_interval: Duration,
    ) -> Self {
        Self {
            bus,
            connection_timeout,
            discovery_interval,
            inner: Mutex::new(RegistryInner {
                devices: HashMap::new(),
                handles: HashMap::new(),
            }),
        }
    }

    /// Discover all connected test devices.
    ///
    /// Enumerates normal-mode, bootloader-mode, and alternate-variant
    /// pairings and folds the union into the record table. A record absent
    /// from two consecutive scan intervals transitions to disconnected.
    /// Bus enumeration errors are logged and yield an empty list.
    pub fn discover(&self) -> Vec<DeviceRecord> {
        let now = Utc::now();
        let mut discovered = Vec::new();

        let scans = [
            (RP2040_VID, RP2040_PID, DeviceStatus::Connected),
            (RP2040_VID, RP2040_BOOTLOADER_PID, DeviceStatus::Bootloader),
            (ALT_DEVICE_VID, ALT_DEVICE_PID, DeviceStatus::Connected),
        ];

        for (vid, pid, status) in scans {
            match self.bus.enumerate(vid, pid) {
                Ok(devices) => {
                    for info in devices {
                        discovered.push(DeviceRecord {
                            vendor_id: info.vendor_id,
                            product_id: info.product_id,
                            serial_number: info.serial_number,
                            manufacturer: info.manufacturer,
                            product: info.product,
                            path: info.path,
                            status,
                            last_seen: now,
                        });
                    }
                }
                Err(e) => {
                    error!("Device discovery failed for {vid:04x}:{pid:04x}: {e}");
                    return Vec::new();
                }
            }
        }

        let mut inner = self.inner.lock().expect("registry lock poisoned");
        for record in &discovered {
            inner
                .devices
                .insert(record.serial_number.clone(), record.clone());
        }

        // Mark devices missing from two consecutive scans as disconnected.
        let stale_cutoff = now
            - chrono::Duration::from_std(self.discovery_interval * 2)
                .unwrap_or_else(|_| chrono::Duration::seconds(2));
        for record in inner.devices.values_mut() {
            if record.last_seen < stale_cutoff {
                record.status = DeviceStatus::Disconnected;
            }
        }

        discovered
    }

    /// Connect to a specific device by serial number.
    ///
    /// Fails if the serial is unknown or the record is disconnected. A
    /// device that already has an open handle is a success.
    pub fn connect(&self, serial: &str) -> bool {
        let path = {
            let inner = self.inner.lock().expect("registry lock poisoned");
            if inner.handles.contains_key(serial) {
                return true;
            }
            match inner.devices.get(serial) {
                Some(record) if record.status != DeviceStatus::Disconnected => record.path.clone(),
                _ => {
                    error!(serial, "Device not found or disconnected");
                    return false;
                }
            }
        };

        // Open without holding the registry lock.
        match self.bus.open(&path) {
            Ok(handle) => {
                let mut inner = self.inner.lock().expect("registry lock poisoned");
                inner.handles.insert(serial.to_string(), handle);
                info!(serial, "Connected to device");
                true
            }
            Err(e) => {
                error!(serial, "Failed to connect to device: {e}");
                false
            }
        }
    }

    /// Disconnect from a specific device. Idempotent: a missing handle is
    /// a success, and the underlying channel closes when the last borrowed
    /// reference is dropped.
    pub fn disconnect(&self, serial: &str) -> bool {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        if inner.handles.remove(serial).is_some() {
            info!(serial, "Disconnected from device");
        }
        true
    }

    /// Disconnect from all connected devices.
    pub fn disconnect_all(&self) {
        let serials: Vec<String> = {
            let inner = self.inner.lock().expect("registry lock poisoned");
            inner.handles.keys().cloned().collect()
        };
        for serial in serials {
            self.disconnect(&serial);
        }
    }

    /// Serial numbers of currently connected devices.
    pub fn connected_devices(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        let mut serials: Vec<String> = inner.handles.keys().cloned().collect();
        serials.sort();
        serials
    }

    /// Check if a device currently has an open handle.
    pub fn is_connected(&self, serial: &str) -> bool {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.handles.contains_key(serial)
    }

    /// Get the tracked record for a device.
    pub fn info(&self, serial: &str) -> Option<DeviceRecord> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.devices.get(serial).cloned()
    }

    /// Borrow the handle for a connected device.
    ///
    /// The returned reference is intended for the duration of a single
    /// protocol operation.
    pub fn handle(&self, serial: &str) -> Option<Arc<dyn DeviceHandle>> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.handles.get(serial).cloned()
    }

    /// Wait for a device to reach an expected status.
    ///
    /// Polls discovery at the configured interval up to the deadline. With
    /// no expected status, any connected-like status (connected or
    /// bootloader) satisfies the wait.
    pub fn wait_for(
        &self,
        serial: &str,
        timeout: Duration,
        expected_status: Option<DeviceStatus>,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        poll_until(self.discovery_interval, deadline, || {
            self.discover();
            match self.info(serial) {
                Some(record) => match expected_status {
                    Some(expected) => record.status == expected,
                    None => matches!(
                        record.status,
                        DeviceStatus::Connected | DeviceStatus::Bootloader
                    ),
                },
                None => false,
            }
        })
    }

    /// Wait for a device to reconnect after a disconnection (e.g. after a
    /// firmware flash), then open a handle to it.
    pub fn wait_for_reconnection(&self, serial: &str, timeout: Duration) -> bool {
        debug!(serial, "Waiting for device to reconnect");
        if !self.wait_for(serial, timeout, Some(DeviceStatus::Connected)) {
            return false;
        }
        self.connect(serial)
    }

    /// Wait for a device to enter bootloader mode.
    pub fn wait_for_bootloader(&self, serial: &str, timeout: Duration) -> bool {
        self.wait_for(serial, timeout, Some(DeviceStatus::Bootloader))
    }

    /// Default connection timeout configured at construction.
    pub fn connection_timeout(&self) -> Duration {
        self.connection_timeout
    }

    /// Poll interval configured at construction.
    pub fn discovery_interval(&self) -> Duration {
        self.discovery_interval
    }
}
