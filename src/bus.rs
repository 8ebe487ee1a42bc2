//! HID bus abstraction.
//!
//! Provides a trait-based abstraction over the HID driver, enabling both
//! real hardware and mock testing. The orchestrator exchanges fixed-size
//! 64-byte reports with devices; the bus layer knows nothing about their
//! contents.

use std::ffi::CString;
use std::sync::{Arc, Mutex};

use hidapi::HidApi;

#[cfg(test)]
use mockall::automock;

use crate::error::{HarnessError, Result};

/// Size of every HID report exchanged with a device, in both directions.
pub const REPORT_SIZE: usize = 64;

/// Identity of one device as seen during bus enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusDeviceInfo {
    /// USB Vendor ID.
    pub vendor_id: u16,
    /// USB Product ID.
    pub product_id: u16,
    /// Device serial number string.
    pub serial_number: String,
    /// Manufacturer name (if reported).
    pub manufacturer: String,
    /// Product name (if reported).
    pub product: String,
    /// Opaque bus path used to open the device.
    pub path: String,
}

/// An opened, exclusively-owned byte channel to one device.
///
/// Handles are internally synchronised: one report is transferred at a time.
/// Callers serialise higher-level request/response traffic per device.
#[cfg_attr(test, automock)]
pub trait DeviceHandle: Send + Sync {
    /// Write one 64-byte report. Returns the number of payload bytes written.
    fn write_report(&self, report: &[u8; REPORT_SIZE]) -> Result<usize>;

    /// Read one 64-byte report, waiting at most `timeout_ms` milliseconds.
    ///
    /// Returns `None` when no report arrived within the timeout.
    fn read_report(&self, timeout_ms: i32) -> Result<Option<[u8; REPORT_SIZE]>>;
}

/// Abstraction over the HID bus driver (enumerate / open).
pub trait HidBus: Send + Sync {
    /// Enumerate devices matching a vendor/product pairing.
    fn enumerate(&self, vendor_id: u16, product_id: u16) -> Result<Vec<BusDeviceInfo>>;

    /// Open the device at `path` in non-blocking mode.
    fn open(&self, path: &str) -> Result<Arc<dyn DeviceHandle>>;
}

/// Real bus backed by hidapi.
pub struct HidApiBus {
    api: Mutex<HidApi>,
}

impl HidApiBus {
    /// Initialise the hidapi context.
    pub fn new() -> Result<Self> {
        let api = HidApi::new().map_err(|e| HarnessError::Bus(e.to_string()))?;
        Ok(Self {
            api: Mutex::new(api),
        })
    }
}

impl HidBus for HidApiBus {
    fn enumerate(&self, vendor_id: u16, product_id: u16) -> Result<Vec<BusDeviceInfo>> {
        let mut api = self.api.lock().expect("hidapi lock poisoned");
        api.refresh_devices()
            .map_err(|e| HarnessError::Bus(e.to_string()))?;

        let devices = api
            .device_list()
            .filter(|d| d.vendor_id() == vendor_id && d.product_id() == product_id)
            .map(|d| BusDeviceInfo {
                vendor_id: d.vendor_id(),
                product_id: d.product_id(),
                serial_number: d.serial_number().unwrap_or_default().to_string(),
                manufacturer: d.manufacturer_string().unwrap_or_default().to_string(),
                product: d.product_string().unwrap_or_default().to_string(),
                path: d.path().to_string_lossy().into_owned(),
            })
            .collect();

        Ok(devices)
    }

    fn open(&self, path: &str) -> Result<Arc<dyn DeviceHandle>> {
        let api = self.api.lock().expect("hidapi lock poisoned");
        let c_path =
            CString::new(path).map_err(|_| HarnessError::Bus(format!("bad path: {path}")))?;
        let device = api
            .open_path(&c_path)
            .map_err(|e| HarnessError::Bus(e.to_string()))?;
        device
            .set_blocking_mode(false)
            .map_err(|e| HarnessError::Bus(e.to_string()))?;
        Ok(Arc::new(HidApiHandle {
            device: Mutex::new(device),
        }))
    }
}

/// Handle wrapping one hidapi device.
struct HidApiHandle {
    device: Mutex<hidapi::HidDevice>,
}

impl DeviceHandle for HidApiHandle {
    fn write_report(&self, report: &[u8; REPORT_SIZE]) -> Result<usize> {
        // hidapi expects a leading report-id byte; these devices use no
        // report ids, so it is always zero and not counted as payload.
        let mut buf = [0u8; REPORT_SIZE + 1];
        buf[1..].copy_from_slice(report);

        let device = self.device.lock().expect("device lock poisoned");
        let written = device
            .write(&buf)
            .map_err(|e| HarnessError::Bus(e.to_string()))?;
        Ok(written.saturating_sub(1))
    }

    fn read_report(&self, timeout_ms: i32) -> Result<Option<[u8; REPORT_SIZE]>> {
        let mut buf = [0u8; REPORT_SIZE];
        let device = self.device.lock().expect("device lock poisoned");
        let read = device
            .read_timeout(&mut buf, timeout_ms)
            .map_err(|e| HarnessError::Bus(e.to_string()))?;
        if read == 0 {
            return Ok(None);
        }
        Ok(Some(buf))
    }
}
