//! Real-time test monitoring and debugging.
//!
//! A single-producer-multi-observer event bus. Components submit lifecycle
//! and wire events; a dedicated drain thread maintains per-device derived
//! state (progress, health, communication statistics), captures system
//! snapshots on failure, and emits human-readable log lines gated by the
//! configured verbosity. Ring-buffer capture is independent of verbosity.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::config::{
    HEALTH_CHECK_INTERVAL, MAX_HISTORY_SIZE, PERIODIC_STATUS_INTERVAL, SNAPSHOT_COMM_ENTRIES,
    SNAPSHOT_LOG_LINES, STALL_ERROR_SECS, STALL_WARNING_SECS,
};
use crate::error::Result;
use crate::frame::{Command, Response};
use crate::sequencer::TestExecution;

/// Logging verbosity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Minimal,
    Normal,
    Verbose,
    Debug,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "minimal" => Ok(LogLevel::Minimal),
            "normal" => Ok(LogLevel::Normal),
            "verbose" => Ok(LogLevel::Verbose),
            "debug" => Ok(LogLevel::Debug),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

/// Types of monitoring events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TestStarted,
    TestCompleted,
    TestFailed,
    CommandSent,
    ResponseReceived,
    DeviceCommunication,
    SystemStateSnapshot,
    ProgressUpdate,
}

impl EventKind {
    /// Event name as used in log lines and exports.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::TestStarted => "test_started",
            EventKind::TestCompleted => "test_completed",
            EventKind::TestFailed => "test_failed",
            EventKind::CommandSent => "command_sent",
            EventKind::ResponseReceived => "response_received",
            EventKind::DeviceCommunication => "device_communication",
            EventKind::SystemStateSnapshot => "system_state_snapshot",
            EventKind::ProgressUpdate => "progress_update",
        }
    }
}

/// Direction of a communication log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Sent,
    Received,
}

/// One monitoring event.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorEvent {
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub device_serial: String,
    pub test_name: Option<String>,
    pub data: Value,
    pub correlation_id: Option<String>,
}

/// Device communication log entry.
#[derive(Debug, Clone, Serialize)]
pub struct CommunicationEntry {
    pub timestamp: DateTime<Utc>,
    pub device_serial: String,
    pub direction: Direction,
    pub message_type: String,
    pub data: Value,
    pub correlation_id: Option<String>,
    pub latency_ms: Option<f64>,
    pub sequence_number: Option<u64>,
    pub protocol_details: Value,
}

/// Device health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Warning,
    Error,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Warning => "warning",
            HealthState::Error => "error",
        }
    }
}

/// Real-time per-device progress counters.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressStatus {
    pub device_serial: String,
    pub current_test: Option<String>,
    pub completed_tests: usize,
    pub total_tests: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub start_time: DateTime<Utc>,
    pub estimated_completion: Option<DateTime<Utc>>,
    pub current_test_start: Option<DateTime<Utc>>,
    pub last_activity: DateTime<Utc>,
    pub health: HealthState,
    /// Elapsed seconds of the most recently completed test.
    pub last_test_duration: Option<f64>,
    pub performance_metrics: HashMap<String, f64>,
}

impl ProgressStatus {
    fn new(device_serial: &str, now: DateTime<Utc>) -> Self {
        Self {
            device_serial: device_serial.to_string(),
            current_test: None,
            completed_tests: 0,
            total_tests: 0,
            success_count: 0,
            failure_count: 0,
            start_time: now,
            estimated_completion: None,
            current_test_start: None,
            last_activity: now,
            health: HealthState::Healthy,
            last_test_duration: None,
            performance_metrics: HashMap::new(),
        }
    }
}

/// System state snapshot captured on test failure.
#[derive(Debug, Clone, Serialize)]
pub struct SystemSnapshot {
    pub timestamp: DateTime<Utc>,
    pub device_serial: String,
    pub test_name: String,
    pub system_state: Value,
    pub device_logs: Vec<String>,
    pub communication_history: Vec<Value>,
    pub performance_metrics: HashMap<String, f64>,
    pub error_context: Option<String>,
}

/// Monitor construction parameters.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub log_level: LogLevel,
    pub max_history_size: usize,
    pub enable_snapshots: bool,
    pub health_check_interval: std::time::Duration,
    pub periodic_status_interval: std::time::Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Normal,
            max_history_size: MAX_HISTORY_SIZE,
            enable_snapshots: true,
            health_check_interval: HEALTH_CHECK_INTERVAL,
            periodic_status_interval: PERIODIC_STATUS_INTERVAL,
        }
    }
}

type Callback = Box<dyn Fn(&MonitorEvent) + Send>;

#[derive(Default)]
struct MonitorState {
    events: VecDeque<MonitorEvent>,
    comm_logs: VecDeque<CommunicationEntry>,
    snapshots: VecDeque<SystemSnapshot>,
    progress: HashMap<String, ProgressStatus>,
    pending: HashMap<String, CommunicationEntry>,
}

struct Shared {
    state: Mutex<MonitorState>,
    callbacks: Mutex<Vec<(EventKind, Callback)>>,
}

/// Real-time test monitoring and debugging system.
pub struct RealTimeMonitor {
    config: MonitorConfig,
    active: Arc<AtomicBool>,
    sender: Mutex<Option<Sender<MonitorEvent>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shared: Arc<Shared>,
    correlation_counter: AtomicU64,
    sequence_counter: AtomicU64,
}

impl RealTimeMonitor {
    /// Create a monitor with default configuration.
    pub fn new() -> Self {
        Self::with_config(MonitorConfig::default())
    }

    /// Create a monitor with explicit configuration.
    pub fn with_config(config: MonitorConfig) -> Self {
        Self {
            config,
            active: Arc::new(AtomicBool::new(false)),
            sender: Mutex::new(None),
            worker: Mutex::new(None),
            shared: Arc::new(Shared {
                state: Mutex::new(MonitorState::default()),
                callbacks: Mutex::new(Vec::new()),
            }),
            correlation_counter: AtomicU64::new(0),
            sequence_counter: AtomicU64::new(0),
        }
    }

    /// Start the background drain thread.
    pub fn start(&self) {
        if self.active.swap(true, Ordering::SeqCst) {
            return;
        }
        let (tx, rx) = mpsc::channel::<MonitorEvent>();
        *self.sender.lock().expect("monitor lock poisoned") = Some(tx);

        let shared = Arc::clone(&self.shared);
        let active = Arc::clone(&self.active);
        let config = self.config.clone();

        let handle = std::thread::Builder::new()
            .name("monitor-drain".to_string())
            .spawn(move || {
                let mut last_health_check = Instant::now();
                let mut last_status_report = Instant::now();
                loop {
                    match rx.recv_timeout(std::time::Duration::from_millis(100)) {
                        Ok(event) => process_event(&shared, &config, event),
                        Err(RecvTimeoutError::Timeout) => {
                            if !active.load(Ordering::SeqCst) {
                                break;
                            }
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }

                    update_progress_estimates(&shared);

                    if last_health_check.elapsed() >= config.health_check_interval {
                        perform_health_checks(&shared);
                        last_health_check = Instant::now();
                    }
                    if last_status_report.elapsed() >= config.periodic_status_interval {
                        periodic_status_report(&shared, &config);
                        last_status_report = Instant::now();
                    }
                }
            })
            .expect("failed to spawn monitor thread");

        *self.worker.lock().expect("monitor lock poisoned") = Some(handle);
        info!("Real-time monitoring started");
    }

    /// Stop the drain thread, draining queued events first.
    ///
    /// The cancellation token plus the channel disconnect bound the join to
    /// one drain interval.
    pub fn stop(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        self.sender.lock().expect("monitor lock poisoned").take();
        if let Some(handle) = self.worker.lock().expect("monitor lock poisoned").take() {
            handle.join().ok();
        }
        info!("Real-time monitoring stopped");
    }

    /// Whether the drain thread is running.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Register a callback for a specific event kind.
    ///
    /// Callbacks run on the drain thread and must be non-blocking.
    pub fn register_callback<F>(&self, kind: EventKind, callback: F)
    where
        F: Fn(&MonitorEvent) + Send + 'static,
    {
        self.shared
            .callbacks
            .lock()
            .expect("monitor lock poisoned")
            .push((kind, Box::new(callback)));
    }

    fn submit(&self, event: MonitorEvent) {
        let sender = {
            let guard = self.sender.lock().expect("monitor lock poisoned");
            guard.clone()
        };
        match sender {
            // Submission never blocks: the queue is unbounded.
            Some(tx) => {
                tx.send(event).ok();
            }
            // Without a drain thread, process synchronously.
            None => process_event(&self.shared, &self.config, event),
        }
    }

    // ------------------------------------------------------------------
    // Event producers
    // ------------------------------------------------------------------

    /// Record that a test has started.
    pub fn log_test_started(&self, serial: &str, test_name: &str, total_tests: usize) {
        self.submit(MonitorEvent {
            kind: EventKind::TestStarted,
            timestamp: Utc::now(),
            device_serial: serial.to_string(),
            test_name: Some(test_name.to_string()),
            data: json!({ "total_tests": total_tests }),
            correlation_id: None,
        });
    }

    /// Record that a test completed successfully.
    pub fn log_test_completed(&self, serial: &str, test_name: &str, execution: &TestExecution) {
        self.submit(MonitorEvent {
            kind: EventKind::TestCompleted,
            timestamp: Utc::now(),
            device_serial: serial.to_string(),
            test_name: Some(test_name.to_string()),
            data: json!({
                "duration": execution.duration_secs(),
                "status": execution.status.as_str(),
                "retry_attempt": execution.retry_attempt,
            }),
            correlation_id: None,
        });
    }

    /// Record that a test failed or timed out.
    pub fn log_test_failed(&self, serial: &str, test_name: &str, execution: &TestExecution) {
        self.submit(MonitorEvent {
            kind: EventKind::TestFailed,
            timestamp: Utc::now(),
            device_serial: serial.to_string(),
            test_name: Some(test_name.to_string()),
            data: json!({
                "duration": execution.duration_secs(),
                "status": execution.status.as_str(),
                "error_message": execution.error_message,
                "retry_attempt": execution.retry_attempt,
            }),
            correlation_id: None,
        });
    }

    /// Record a sent command; mints and returns its correlation id.
    pub fn log_command_sent(&self, serial: &str, command: &Command) -> String {
        let correlation_id = format!(
            "cmd_{:06}",
            self.correlation_counter.fetch_add(1, Ordering::SeqCst)
        );
        let sequence_number = self.sequence_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let now = Utc::now();

        let payload_json = command.payload.to_string();
        let protocol_details = if self.config.log_level == LogLevel::Debug {
            let length = payload_json.len().min(crate::frame::MAX_PAYLOAD) as u8;
            let checksum = (command.kind as u8)
                .wrapping_add(command.sequence)
                .wrapping_add(length);
            json!({
                "command_kind": command.kind as u8,
                "command_id": command.sequence,
                "payload_json": payload_json.as_str(),
                "raw_bytes_length": crate::bus::REPORT_SIZE,
                "checksum": checksum,
            })
        } else {
            Value::Null
        };

        let entry = CommunicationEntry {
            timestamp: now,
            device_serial: serial.to_string(),
            direction: Direction::Sent,
            message_type: command.kind.name().to_string(),
            data: command.payload.clone(),
            correlation_id: Some(correlation_id.clone()),
            latency_ms: None,
            sequence_number: Some(sequence_number),
            protocol_details,
        };

        {
            let mut state = self.shared.state.lock().expect("monitor lock poisoned");
            push_capped(
                &mut state.comm_logs,
                entry.clone(),
                self.config.max_history_size,
            );
            state.pending.insert(correlation_id.clone(), entry);
        }

        self.submit(MonitorEvent {
            kind: EventKind::CommandSent,
            timestamp: now,
            device_serial: serial.to_string(),
            test_name: None,
            data: json!({
                "command_type": command.kind.name(),
                "command_id": command.sequence,
                "payload_size": payload_json.len(),
                "sequence_number": sequence_number,
            }),
            correlation_id: Some(correlation_id.clone()),
        });

        correlation_id
    }

    /// Record a received response, computing latency from its correlated
    /// command.
    pub fn log_response_received(
        &self,
        serial: &str,
        response: &Response,
        correlation_id: Option<&str>,
    ) {
        let now = Utc::now();

        let latency_ms = {
            let mut state = self.shared.state.lock().expect("monitor lock poisoned");
            let latency = correlation_id
                .and_then(|cid| state.pending.get(cid))
                .and_then(|sent| (now - sent.timestamp).num_microseconds())
                .map(|us| us as f64 / 1000.0);

            let protocol_details = if self.config.log_level == LogLevel::Debug {
                json!({
                    "status_code": response.status as u8,
                    "command_id": response.sequence,
                    "data_json": response.data.to_string(),
                    "latency_ms": latency,
                })
            } else {
                Value::Null
            };

            push_capped(
                &mut state.comm_logs,
                CommunicationEntry {
                    timestamp: now,
                    device_serial: serial.to_string(),
                    direction: Direction::Received,
                    message_type: response.response_type.clone(),
                    data: response.data.clone(),
                    correlation_id: correlation_id.map(str::to_string),
                    latency_ms: latency,
                    sequence_number: None,
                    protocol_details,
                },
                self.config.max_history_size,
            );
            if let Some(cid) = correlation_id {
                state.pending.remove(cid);
            }
            latency
        };

        self.submit(MonitorEvent {
            kind: EventKind::ResponseReceived,
            timestamp: now,
            device_serial: serial.to_string(),
            test_name: None,
            data: json!({
                "response_type": response.response_type,
                "status": response.status.name(),
                "command_id": response.sequence,
                "latency_ms": latency_ms,
            }),
            correlation_id: correlation_id.map(str::to_string),
        });
    }

    /// Record raw device communication (unstructured log traffic).
    pub fn log_device_communication(
        &self,
        serial: &str,
        message: &str,
        direction: Direction,
        raw_bytes: Option<&[u8]>,
    ) {
        let mut data = json!({
            "direction": direction,
            "message": message,
            "message_length": message.len(),
            "raw_bytes_length": raw_bytes.map(<[u8]>::len),
        });
        if self.config.log_level == LogLevel::Debug {
            data["raw_bytes_hex"] = raw_bytes
                .map(|bytes| Value::String(to_hex(bytes)))
                .unwrap_or(Value::Null);
            data["message_type_detected"] = Value::String(detect_message_type(message).to_string());
            data["log_level_detected"] = Value::String(detect_log_level(message).to_string());
        }

        self.submit(MonitorEvent {
            kind: EventKind::DeviceCommunication,
            timestamp: Utc::now(),
            device_serial: serial.to_string(),
            test_name: None,
            data,
            correlation_id: None,
        });
    }

    // ------------------------------------------------------------------
    // Queryable views
    // ------------------------------------------------------------------

    /// Current progress for one device.
    pub fn device_progress(&self, serial: &str) -> Option<ProgressStatus> {
        let state = self.shared.state.lock().expect("monitor lock poisoned");
        state.progress.get(serial).cloned()
    }

    /// Progress for all devices.
    pub fn all_progress(&self) -> HashMap<String, ProgressStatus> {
        let state = self.shared.state.lock().expect("monitor lock poisoned");
        state.progress.clone()
    }

    /// Communication logs, optionally filtered by device.
    pub fn communication_logs(
        &self,
        serial: Option<&str>,
        max_entries: usize,
    ) -> Vec<CommunicationEntry> {
        let state = self.shared.state.lock().expect("monitor lock poisoned");
        let logs: Vec<CommunicationEntry> = state
            .comm_logs
            .iter()
            .filter(|log| serial.map(|s| log.device_serial == s).unwrap_or(true))
            .cloned()
            .collect();
        tail(logs, max_entries)
    }

    /// System snapshots, optionally filtered by device.
    pub fn system_snapshots(&self, serial: Option<&str>) -> Vec<SystemSnapshot> {
        let state = self.shared.state.lock().expect("monitor lock poisoned");
        state
            .snapshots
            .iter()
            .filter(|snap| serial.map(|s| snap.device_serial == s).unwrap_or(true))
            .cloned()
            .collect()
    }

    /// Event history with optional device and kind filtering.
    pub fn event_history(
        &self,
        serial: Option<&str>,
        kinds: Option<&[EventKind]>,
        max_entries: usize,
    ) -> Vec<MonitorEvent> {
        let state = self.shared.state.lock().expect("monitor lock poisoned");
        let events: Vec<MonitorEvent> = state
            .events
            .iter()
            .filter(|event| serial.map(|s| event.device_serial == s).unwrap_or(true))
            .filter(|event| kinds.map(|k| k.contains(&event.kind)).unwrap_or(true))
            .cloned()
            .collect();
        tail(events, max_entries)
    }

    /// Recent communication statistics for one device (last 60 seconds).
    pub fn communication_stats(&self, serial: &str) -> Value {
        let state = self.shared.state.lock().expect("monitor lock poisoned");
        let cutoff = Utc::now() - chrono::Duration::seconds(60);
        let recent: Vec<&CommunicationEntry> = state
            .comm_logs
            .iter()
            .filter(|log| log.device_serial == serial && log.timestamp >= cutoff)
            .collect();

        let sent = recent
            .iter()
            .filter(|log| log.direction == Direction::Sent)
            .count();
        let received = recent
            .iter()
            .filter(|log| log.direction == Direction::Received)
            .count();
        let latencies: Vec<f64> = recent.iter().filter_map(|log| log.latency_ms).collect();
        let pending = state
            .pending
            .values()
            .filter(|cmd| cmd.device_serial == serial)
            .count();

        json!({
            "total_messages": recent.len(),
            "sent_commands": sent,
            "received_responses": received,
            "avg_latency_ms": mean(&latencies),
            "max_latency_ms": latencies.iter().cloned().fold(None, |acc: Option<f64>, v| {
                Some(acc.map_or(v, |a| a.max(v)))
            }),
            "pending_commands": pending,
        })
    }

    /// Export all monitoring state as JSON.
    pub fn export(&self, path: &Path) -> Result<()> {
        let state = self.shared.state.lock().expect("monitor lock poisoned");
        let export = json!({
            "metadata": {
                "export_timestamp": Utc::now(),
                "log_level": self.config.log_level,
                "snapshots_enabled": self.config.enable_snapshots,
                "max_history_size": self.config.max_history_size,
            },
            "device_progress": state.progress,
            "event_history": state.events.iter().collect::<Vec<_>>(),
            "communication_logs": state.comm_logs.iter().collect::<Vec<_>>(),
            "system_snapshots": state.snapshots.iter().collect::<Vec<_>>(),
        });
        drop(state);
        std::fs::write(path, serde_json::to_string_pretty(&export)?)?;
        info!("Monitoring data exported to {}", path.display());
        Ok(())
    }
}

impl Default for RealTimeMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RealTimeMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

// ----------------------------------------------------------------------
// Drain-thread internals
// ----------------------------------------------------------------------

fn process_event(shared: &Shared, config: &MonitorConfig, event: MonitorEvent) {
    {
        let mut state = shared.state.lock().expect("monitor lock poisoned");
        push_capped(&mut state.events, event.clone(), config.max_history_size);
        log_event(config, &event);
        update_progress(&mut state, &event);

        if event.kind == EventKind::TestFailed && config.enable_snapshots {
            capture_failure_snapshot(&mut state, config, &event);
        }
    }

    // Callbacks run outside the state lock so they may query the monitor.
    let callbacks = shared.callbacks.lock().expect("monitor lock poisoned");
    for (kind, callback) in callbacks.iter() {
        if *kind == event.kind {
            callback(&event);
        }
    }
}

fn log_event(config: &MonitorConfig, event: &MonitorEvent) {
    let name = event.test_name.as_deref().unwrap_or("N/A");
    match config.log_level {
        LogLevel::Minimal => {
            if matches!(event.kind, EventKind::TestFailed | EventKind::ProgressUpdate) {
                info!(
                    "[{}] {}: {}",
                    event.device_serial,
                    event.kind.as_str(),
                    name
                );
            }
        }
        LogLevel::Normal => {
            if matches!(
                event.kind,
                EventKind::TestStarted
                    | EventKind::TestCompleted
                    | EventKind::TestFailed
                    | EventKind::ProgressUpdate
            ) {
                info!(
                    "[{}] {}: {}",
                    event.device_serial,
                    event.kind.as_str(),
                    name
                );
            }
        }
        LogLevel::Verbose => {
            info!(
                "[{}] [{}] {}: {} - {}",
                event.timestamp.format("%H:%M:%S%.3f"),
                event.device_serial,
                event.kind.as_str(),
                name,
                summarize_event_data(&event.data)
            );
        }
        LogLevel::Debug => {
            debug!(
                "[{}] [{}] {}: test={} correlation={} data={}",
                event.timestamp.format("%H:%M:%S%.3f"),
                event.device_serial,
                event.kind.as_str(),
                name,
                event.correlation_id.as_deref().unwrap_or("N/A"),
                event.data
            );
        }
    }
}

fn summarize_event_data(data: &Value) -> String {
    let Some(map) = data.as_object() else {
        return "No data".to_string();
    };
    if map.is_empty() {
        return "No data".to_string();
    }
    map.iter()
        .take(3)
        .map(|(key, value)| match value {
            Value::Object(_) => format!("{key}={{...}}"),
            Value::Array(items) => format!("{key}=[{} items]", items.len()),
            other => format!("{key}={other}"),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn update_progress(state: &mut MonitorState, event: &MonitorEvent) {
    let progress = state
        .progress
        .entry(event.device_serial.clone())
        .or_insert_with(|| ProgressStatus::new(&event.device_serial, event.timestamp));

    match event.kind {
        EventKind::TestStarted => {
            progress.current_test = event.test_name.clone();
            progress.current_test_start = Some(event.timestamp);
            progress.last_activity = event.timestamp;
            if let Some(total) = event.data.get("total_tests").and_then(Value::as_u64) {
                if total > 0 {
                    progress.total_tests = total as usize;
                }
            }
        }
        EventKind::TestCompleted => {
            progress.completed_tests += 1;
            progress.success_count += 1;
            progress.current_test = None;
            progress.current_test_start = None;
            progress.last_activity = event.timestamp;
            progress.last_test_duration = event.data.get("duration").and_then(Value::as_f64);
        }
        EventKind::TestFailed => {
            progress.completed_tests += 1;
            progress.failure_count += 1;
            progress.current_test = None;
            progress.current_test_start = None;
            progress.last_activity = event.timestamp;
            progress.last_test_duration = event.data.get("duration").and_then(Value::as_f64);
        }
        EventKind::CommandSent | EventKind::ResponseReceived => {
            progress.last_activity = event.timestamp;
        }
        _ => {}
    }
}

fn update_progress_estimates(shared: &Shared) {
    let now = Utc::now();
    let mut state = shared.state.lock().expect("monitor lock poisoned");
    for progress in state.progress.values_mut() {
        if progress.completed_tests == 0 {
            continue;
        }
        let elapsed = (now - progress.start_time).num_milliseconds() as f64 / 1000.0;
        if elapsed <= 0.0 {
            continue;
        }
        let avg = elapsed / progress.completed_tests as f64;

        if progress.total_tests > progress.completed_tests {
            let remaining = (progress.total_tests - progress.completed_tests) as f64;
            progress.estimated_completion =
                Some(now + chrono::Duration::milliseconds((avg * remaining * 1000.0) as i64));
        } else if progress.total_tests > 0 {
            progress.estimated_completion = Some(now);
        }

        let metrics = &mut progress.performance_metrics;
        metrics.insert(
            "tests_per_second".to_string(),
            progress.completed_tests as f64 / elapsed,
        );
        metrics.insert(
            "success_rate".to_string(),
            progress.success_count as f64 / progress.completed_tests as f64,
        );
        metrics.insert("average_test_duration".to_string(), avg);
        if progress.total_tests > 0 {
            metrics.insert(
                "completion_percentage".to_string(),
                progress.completed_tests as f64 / progress.total_tests as f64 * 100.0,
            );
        }
    }
}

fn perform_health_checks(shared: &Shared) {
    let now = Utc::now();
    let mut state = shared.state.lock().expect("monitor lock poisoned");

    // Recent communication balance per device, over the last five minutes.
    let cutoff = now - chrono::Duration::seconds(300);
    let mut sent_counts: HashMap<String, usize> = HashMap::new();
    let mut received_counts: HashMap<String, usize> = HashMap::new();
    for log in state.comm_logs.iter().filter(|l| l.timestamp >= cutoff) {
        let counts = match log.direction {
            Direction::Sent => &mut sent_counts,
            Direction::Received => &mut received_counts,
        };
        *counts.entry(log.device_serial.clone()).or_default() += 1;
    }

    for progress in state.progress.values_mut() {
        let idle_secs = (now - progress.last_activity).num_seconds();

        let mut health = HealthState::Healthy;
        if idle_secs > STALL_ERROR_SECS {
            health = HealthState::Error;
            error!(
                "[{}] Device appears unresponsive (no activity for {idle_secs}s)",
                progress.device_serial
            );
        } else if progress.current_test.is_some() && idle_secs > STALL_WARNING_SECS {
            health = HealthState::Warning;
            warn!(
                "[{}] Test '{}' may be stalled (no activity for {idle_secs}s)",
                progress.device_serial,
                progress.current_test.as_deref().unwrap_or("")
            );
        }

        if progress.completed_tests > 5 {
            let failure_rate = progress.failure_count as f64 / progress.completed_tests as f64;
            if failure_rate > 0.5 {
                health = HealthState::Error;
                error!(
                    "[{}] High failure rate: {:.1}%",
                    progress.device_serial,
                    failure_rate * 100.0
                );
            } else if failure_rate > 0.2 && health == HealthState::Healthy {
                health = HealthState::Warning;
                warn!(
                    "[{}] Elevated failure rate: {:.1}%",
                    progress.device_serial,
                    failure_rate * 100.0
                );
            }
        }

        let sent = sent_counts
            .get(&progress.device_serial)
            .copied()
            .unwrap_or(0);
        let received = received_counts
            .get(&progress.device_serial)
            .copied()
            .unwrap_or(0);
        if sent > received + 5 {
            if health == HealthState::Healthy {
                health = HealthState::Warning;
            }
            warn!(
                "[{}] Communication imbalance: {sent} sent, {received} received",
                progress.device_serial
            );
        }

        progress.health = health;
    }
}

fn periodic_status_report(shared: &Shared, config: &MonitorConfig) {
    if !matches!(config.log_level, LogLevel::Verbose | LogLevel::Debug) {
        return;
    }
    let now = Utc::now();
    let state = shared.state.lock().expect("monitor lock poisoned");
    for progress in state.progress.values() {
        if progress.total_tests == 0 {
            continue;
        }
        let completion = progress.completed_tests as f64 / progress.total_tests as f64 * 100.0;
        let mut line = format!(
            "[{}] {completion:.1}% complete ({}/{}) - Success: {}, Failed: {} - Health: {}",
            progress.device_serial,
            progress.completed_tests,
            progress.total_tests,
            progress.success_count,
            progress.failure_count,
            progress.health.as_str(),
        );
        if let Some(test) = &progress.current_test {
            line.push_str(&format!(" - Current: {test}"));
        }
        if let Some(eta) = progress.estimated_completion {
            let remaining = (eta - now).num_seconds().max(0);
            line.push_str(&format!(" - ETA: {remaining}s"));
        }
        info!("{line}");
    }
}

fn capture_failure_snapshot(state: &mut MonitorState, config: &MonitorConfig, event: &MonitorEvent) {
    let serial = &event.device_serial;

    let device_logs: Vec<String> = state
        .events
        .iter()
        .filter(|e| &e.device_serial == serial)
        .map(|e| {
            format!(
                "[{}] {}: {}",
                e.timestamp.format("%H:%M:%S%.3f"),
                e.kind.as_str(),
                e.test_name.as_deref().unwrap_or("N/A")
            )
        })
        .collect();
    let device_logs = tail(device_logs, SNAPSHOT_LOG_LINES);

    let communication_history: Vec<Value> = tail(
        state
            .comm_logs
            .iter()
            .filter(|log| &log.device_serial == serial)
            .map(|log| {
                let summary = log.data.to_string();
                let truncated = if summary.len() > 100 {
                    format!("{}...", &summary[..100])
                } else {
                    summary
                };
                json!({
                    "timestamp": log.timestamp,
                    "direction": log.direction,
                    "message_type": log.message_type,
                    "correlation_id": log.correlation_id,
                    "data_summary": truncated,
                })
            })
            .collect(),
        SNAPSHOT_COMM_ENTRIES,
    );

    let progress = state.progress.get(serial);
    let mut performance_metrics = progress
        .map(|p| p.performance_metrics.clone())
        .unwrap_or_default();
    if let Some(p) = progress {
        let elapsed = (event.timestamp - p.start_time).num_milliseconds() as f64 / 1000.0;
        performance_metrics.insert("elapsed_time".to_string(), elapsed);
    }

    let pending_count = state
        .pending
        .values()
        .filter(|cmd| &cmd.device_serial == serial)
        .count();

    let snapshot = SystemSnapshot {
        timestamp: event.timestamp,
        device_serial: serial.clone(),
        test_name: event
            .test_name
            .clone()
            .unwrap_or_else(|| "unknown".to_string()),
        system_state: json!({
            "timestamp": event.timestamp,
            "device_serial": serial,
            "progress": progress,
            "pending_commands": pending_count,
        }),
        device_logs,
        communication_history,
        performance_metrics,
        error_context: event
            .data
            .get("error_message")
            .and_then(Value::as_str)
            .map(str::to_string),
    };

    push_capped(&mut state.snapshots, snapshot, config.max_history_size);
    if matches!(config.log_level, LogLevel::Verbose | LogLevel::Debug) {
        info!(
            "Captured failure snapshot for {}:{}",
            serial,
            event.test_name.as_deref().unwrap_or("unknown")
        );
    }
}

// ----------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------

fn push_capped<T>(ring: &mut VecDeque<T>, item: T, cap: usize) {
    if cap > 0 && ring.len() == cap {
        ring.pop_front();
    }
    ring.push_back(item);
}

fn tail<T>(mut items: Vec<T>, max: usize) -> Vec<T> {
    if items.len() > max {
        items.drain(..items.len() - max);
    }
    items
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Classify a device log line for protocol debugging.
fn detect_message_type(message: &str) -> &'static str {
    if message.starts_with("TEST_RESPONSE:") {
        "test_response"
    } else if message.starts_with("LOG:") {
        "log_message"
    } else if message.starts_with("ERROR:") {
        "error_message"
    } else if message.starts_with("DEBUG:") {
        "debug_message"
    } else if message.starts_with("WARN:") {
        "warning_message"
    } else {
        "unknown"
    }
}

fn detect_log_level(message: &str) -> &'static str {
    if message.starts_with("ERROR:") {
        "error"
    } else if message.starts_with("WARN:") {
        "warning"
    } else if message.starts_with("DEBUG:") {
        "debug"
    } else if message.starts_with("LOG:") {
        "info"
    } else {
        "unknown"
    }
}
