//! Automated test orchestrator for USB HID connected embedded devices.
//!
//! The orchestrator discovers devices on the bus, drives them through
//! structured test sequences over a binary command/response protocol,
//! flashes firmware via external loaders with full lifecycle supervision,
//! and aggregates per-device results into CI-friendly reports.
//!
//! # Overview
//!
//! - [`registry::DeviceRegistry`] - enumeration, status tracking, handles
//! - [`protocol::CommandClient`] - framing, correlation, read pump
//! - [`sequencer::TestSequencer`] - dependency-ordered execution
//! - [`flasher::FlashSupervisor`] - three-phase firmware update workflow
//! - [`monitor::RealTimeMonitor`] - event bus, progress, snapshots
//! - [`collector::ResultCollector`] - metrics, trends, artifacts
//! - [`report`] - JSON / JUnit / CSV / TAP / HTML renderers
//! - [`ci::CiPipeline`] - headless end-to-end pipeline
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use hidtest::bus::HidApiBus;
//! use hidtest::protocol::CommandClient;
//! use hidtest::registry::DeviceRegistry;
//! use hidtest::sequencer::{basic_validation_config, TestSequencer};
//!
//! let bus = Arc::new(HidApiBus::new()?);
//! let registry = Arc::new(DeviceRegistry::new(bus));
//! registry.discover();
//!
//! let client = Arc::new(CommandClient::new(registry.clone(), None));
//! let sequencer = TestSequencer::new(registry, client, None);
//! let results = sequencer.execute(&basic_validation_config(), None, None)?;
//! ```

pub mod bus;
pub mod ci;
pub mod collector;
pub mod config;
pub mod error;
pub mod exec;
pub mod flasher;
pub mod frame;
pub mod monitor;
pub mod poll;
pub mod protocol;
pub mod registry;
pub mod report;
pub mod sequencer;
pub mod test_helpers;

pub use error::{HarnessError, Result};
