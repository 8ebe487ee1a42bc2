//! Test sequencing and orchestration.
//!
//! Executes a test configuration against one or more devices, honouring
//! step dependencies, per-step retry budgets, timeouts, and the
//! parallel/sequential flag. Per execution, status advances monotonically:
//! pending -> running -> {completed, failed, timeout}, or pending ->
//! skipped; terminal states never regress.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::config::{COMMAND_GAP, RETRY_BACKOFF, RETRY_TIME_BUFFER};
use crate::error::{HarnessError, Result};
use crate::frame::{Command, CommandKind, ResponseStatus, Response, TestKind};
use crate::monitor::RealTimeMonitor;
use crate::protocol::CommandClient;
use crate::registry::DeviceRegistry;

/// Test execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
    Skipped,
}

impl TestStatus {
    /// Status string as used in reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            TestStatus::Pending => "pending",
            TestStatus::Running => "running",
            TestStatus::Completed => "completed",
            TestStatus::Failed => "failed",
            TestStatus::Timeout => "timeout",
            TestStatus::Skipped => "skipped",
        }
    }

    /// Whether this status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TestStatus::Completed | TestStatus::Failed | TestStatus::Timeout | TestStatus::Skipped
        )
    }
}

/// Individual test step configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestStep {
    /// Step name, unique within its configuration.
    pub name: String,
    /// Test kind executed by the device.
    pub test_type: TestKind,
    /// Parameter bag forwarded to the device.
    #[serde(default)]
    pub parameters: Value,
    /// Per-step timeout in seconds.
    #[serde(default = "default_step_timeout")]
    pub timeout: f64,
    /// Retry budget: up to retry_count + 1 total attempts.
    #[serde(default)]
    pub retry_count: u32,
    /// Whether a failure of this step skips the rest of the device's steps.
    #[serde(default = "default_required")]
    pub required: bool,
    /// Names of predecessor steps that must complete first.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl TestStep {
    /// Create a step with default timing and no dependencies.
    pub fn new(name: &str, test_type: TestKind) -> Self {
        Self {
            name: name.to_string(),
            test_type,
            parameters: Value::Object(Default::default()),
            timeout: default_step_timeout(),
            retry_count: 0,
            required: default_required(),
            depends_on: Vec::new(),
        }
    }

    /// Create a communication-test step with default settings.
    pub fn named(name: &str) -> Self {
        Self::new(name, TestKind::UsbCommunicationTest)
    }

    /// Per-step timeout as a duration.
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs_f64(self.timeout.max(0.0))
    }
}

fn default_step_timeout() -> f64 {
    30.0
}

fn default_required() -> bool {
    true
}

/// A raw command sent during setup or teardown batches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSpec {
    pub kind: CommandKind,
    #[serde(default)]
    pub payload: Value,
}

impl CommandSpec {
    fn to_command(&self) -> Command {
        Command::new(self.kind, self.payload.clone())
    }
}

/// Complete test sequence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestConfiguration {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<TestStep>,
    #[serde(default)]
    pub parallel_execution: bool,
    #[serde(default = "default_max_parallel")]
    pub max_parallel_devices: usize,
    /// Wall-clock budget for the whole sequence, in seconds.
    #[serde(default = "default_global_timeout")]
    pub global_timeout: f64,
    #[serde(default)]
    pub setup_commands: Vec<CommandSpec>,
    #[serde(default)]
    pub teardown_commands: Vec<CommandSpec>,
}

fn default_max_parallel() -> usize {
    4
}

fn default_global_timeout() -> f64 {
    300.0
}

impl TestConfiguration {
    /// Global timeout as a duration.
    pub fn global_timeout_duration(&self) -> Duration {
        Duration::from_secs_f64(self.global_timeout.max(0.0))
    }

    /// Validate the configuration before execution.
    ///
    /// Rejects duplicate step names, unknown predecessor names, and
    /// dependency cycles. Invalid configurations never start executing.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for step in &self.steps {
            if !names.insert(step.name.as_str()) {
                return Err(HarnessError::DuplicateStep {
                    name: step.name.clone(),
                });
            }
        }

        for step in &self.steps {
            for dependency in &step.depends_on {
                if !names.contains(dependency.as_str()) {
                    return Err(HarnessError::UnknownDependency {
                        step: step.name.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        // Depth-first cycle detection over the dependency relation.
        let index: HashMap<&str, &TestStep> =
            self.steps.iter().map(|s| (s.name.as_str(), s)).collect();
        let mut visited = HashSet::new();
        for step in &self.steps {
            let mut in_progress = HashSet::new();
            visit(step, &index, &mut visited, &mut in_progress)?;
        }
        return Ok(());

        fn visit<'a>(
            step: &'a TestStep,
            index: &HashMap<&'a str, &'a TestStep>,
            visited: &mut HashSet<&'a str>,
            in_progress: &mut HashSet<&'a str>,
        ) -> Result<()> {
            if visited.contains(step.name.as_str()) {
                return Ok(());
            }
            if !in_progress.insert(step.name.as_str()) {
                return Err(HarnessError::DependencyCycle {
                    name: step.name.clone(),
                });
            }
            for dependency in &step.depends_on {
                if let Some(dep_step) = index.get(dependency.as_str()) {
                    visit(dep_step, index, visited, in_progress)?;
                }
            }
            in_progress.remove(step.name.as_str());
            visited.insert(step.name.as_str());
            Ok(())
        }
    }
}

/// Mutable per-(step, device) execution record.
#[derive(Debug, Clone, Serialize)]
pub struct TestExecution {
    pub step: TestStep,
    pub device_serial: String,
    pub status: TestStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub response: Option<Response>,
    pub error_message: Option<String>,
    pub retry_attempt: u32,
}

impl TestExecution {
    /// Create a pending execution record.
    pub fn new(step: TestStep, device_serial: &str) -> Self {
        Self {
            step,
            device_serial: device_serial.to_string(),
            status: TestStatus::Pending,
            start_time: None,
            end_time: None,
            response: None,
            error_message: None,
            retry_attempt: 0,
        }
    }

    /// Execution duration in seconds, when both endpoints are known.
    pub fn duration_secs(&self) -> Option<f64> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => {
                (end - start).num_microseconds().map(|us| us as f64 / 1e6)
            }
            _ => None,
        }
    }
}

#[derive(Default)]
struct SequencerState {
    executions: HashMap<String, Vec<TestExecution>>,
    cancelled: HashSet<String>,
}

/// Orchestrates test sequence execution across single or multiple devices.
pub struct TestSequencer {
    registry: Arc<DeviceRegistry>,
    client: Arc<CommandClient>,
    monitor: Option<Arc<RealTimeMonitor>>,
    state: Mutex<SequencerState>,
}

impl TestSequencer {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        client: Arc<CommandClient>,
        monitor: Option<Arc<RealTimeMonitor>>,
    ) -> Self {
        Self {
            registry,
            client,
            monitor,
            state: Mutex::new(SequencerState::default()),
        }
    }

    /// Execute a test sequence on the given devices.
    ///
    /// With no explicit target list, all currently connected devices are
    /// used. The caller-supplied timeout overrides the configuration's
    /// global timeout; in parallel mode the same wall-clock budget applies
    /// to every device independently.
    ///
    /// Blocks until every device terminates or its deadline fires, and
    /// returns the execution records per device.
    pub fn execute(
        &self,
        config: &TestConfiguration,
        target_devices: Option<&[String]>,
        global_timeout: Option<Duration>,
    ) -> Result<HashMap<String, Vec<TestExecution>>> {
        config.validate()?;

        let devices: Vec<String> = match target_devices {
            Some(targets) => targets.to_vec(),
            None => self.registry.connected_devices(),
        };
        if devices.is_empty() {
            error!("No target devices specified or connected");
            return Ok(HashMap::new());
        }

        let timeout = global_timeout.unwrap_or_else(|| config.global_timeout_duration());
        let start = Instant::now();
        info!(
            "Starting test sequence '{}' on {} device(s) (timeout: {:.0}s)",
            config.name,
            devices.len(),
            timeout.as_secs_f64()
        );

        {
            let mut state = self.state.lock().expect("sequencer lock poisoned");
            for serial in &devices {
                state.cancelled.remove(serial);
                state.executions.insert(
                    serial.clone(),
                    config
                        .steps
                        .iter()
                        .map(|step| TestExecution::new(step.clone(), serial))
                        .collect(),
                );
            }
        }

        self.run_command_batch(&config.setup_commands, &devices, "setup");

        if config.parallel_execution {
            self.execute_parallel(config, &devices, timeout)?;
        } else {
            self.execute_sequential(config, &devices, timeout, start);
        }

        self.run_command_batch(&config.teardown_commands, &devices, "teardown");

        let state = self.state.lock().expect("sequencer lock poisoned");
        Ok(devices
            .iter()
            .map(|serial| {
                (
                    serial.clone(),
                    state.executions.get(serial).cloned().unwrap_or_default(),
                )
            })
            .collect())
    }

    fn execute_sequential(
        &self,
        config: &TestConfiguration,
        devices: &[String],
        timeout: Duration,
        start: Instant,
    ) {
        for (position, serial) in devices.iter().enumerate() {
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                error!("Global timeout reached, skipping remaining devices");
                for remaining in &devices[position..] {
                    self.mark_remaining(
                        remaining,
                        0,
                        TestStatus::Timeout,
                        Some("global/device timeout reached"),
                    );
                }
                break;
            }
            info!(serial = serial.as_str(), "Executing tests on device");
            self.run_device_sequence(config, serial, timeout - elapsed);
        }
    }

    fn execute_parallel(
        &self,
        config: &TestConfiguration,
        devices: &[String],
        timeout: Duration,
    ) -> Result<()> {
        let workers = config.max_parallel_devices.max(1).min(devices.len());
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("seq-worker-{i}"))
            .build()
            .map_err(|e| {
                HarnessError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
            })?;

        pool.install(|| {
            devices.par_iter().for_each(|serial| {
                self.run_device_sequence(config, serial, timeout);
            });
        });
        Ok(())
    }

    /// Run the full step list against one device, strictly sequentially.
    fn run_device_sequence(&self, config: &TestConfiguration, serial: &str, timeout: Duration) {
        let device_start = Instant::now();
        let total = config.steps.len();

        for idx in 0..total {
            if self.is_cancelled(serial) {
                self.mark_remaining(serial, idx, TestStatus::Skipped, Some("execution cancelled"));
                break;
            }

            let elapsed = device_start.elapsed();
            if elapsed >= timeout {
                error!(serial, "Device timeout reached, marking remaining tests as timeout");
                self.mark_remaining(
                    serial,
                    idx,
                    TestStatus::Timeout,
                    Some("global/device timeout reached"),
                );
                break;
            }

            let step = config.steps[idx].clone();
            if !self.dependencies_met(serial, &step) {
                warn!(
                    serial,
                    step = step.name.as_str(),
                    "Skipping step due to unmet dependency"
                );
                self.with_execution(serial, idx, |e| {
                    if !e.status.is_terminal() {
                        e.status = TestStatus::Skipped;
                    }
                });
                // A required step that cannot run ends the device's run.
                if step.required {
                    self.mark_remaining(
                        serial,
                        idx + 1,
                        TestStatus::Skipped,
                        Some("skipped due to required dependency failure"),
                    );
                    break;
                }
                continue;
            }

            self.run_single_test(serial, idx, &step, timeout - elapsed, total);

            let status = self.status_of(serial, idx);
            if step.required && matches!(status, Some(TestStatus::Failed | TestStatus::Timeout)) {
                error!(serial, step = step.name.as_str(), "Required test failed");
                self.mark_remaining(
                    serial,
                    idx + 1,
                    TestStatus::Skipped,
                    Some("skipped due to required dependency failure"),
                );
                break;
            }
        }
    }

    /// Run one step with retry logic inside the remaining device budget.
    fn run_single_test(
        &self,
        serial: &str,
        idx: usize,
        step: &TestStep,
        budget: Duration,
        total_tests: usize,
    ) {
        if let Some(monitor) = &self.monitor {
            monitor.log_test_started(serial, &step.name, total_tests);
        }

        let window_start = Instant::now();
        let max_attempts = step.retry_count + 1;

        for attempt in 0..max_attempts {
            if self.is_cancelled(serial) {
                return;
            }

            self.with_execution(serial, idx, |e| {
                e.retry_attempt = attempt;
                e.status = TestStatus::Running;
                e.start_time = Some(Utc::now());
                e.end_time = None;
                e.response = None;
            });

            let remaining = budget.saturating_sub(window_start.elapsed());
            let attempt_timeout = step.timeout_duration().min(remaining);
            let command = Command::execute_test(step.test_type, step.parameters.clone());
            let response = self.client.send_and_wait(serial, &command, Some(attempt_timeout));

            // A cancel that landed during the wait already fixed the
            // terminal state; do not overwrite it.
            if self.is_cancelled(serial) {
                return;
            }

            let now = Utc::now();
            let mut completed = false;
            self.with_execution(serial, idx, |e| {
                e.end_time = Some(now);
                match &response {
                    Some(r) if r.status == ResponseStatus::Success => {
                        e.response = Some(r.clone());
                        e.status = TestStatus::Completed;
                        e.error_message = None;
                        completed = true;
                    }
                    Some(r) => {
                        e.response = Some(r.clone());
                        e.status = TestStatus::Failed;
                        e.error_message =
                            Some(format!("Device returned error: {}", r.status.name()));
                    }
                    None => {
                        e.status = TestStatus::Timeout;
                        e.error_message = Some("No response received (timeout)".to_string());
                    }
                }
            });

            if completed {
                info!(serial, "Test '{}' completed", step.name);
                if let Some(monitor) = &self.monitor {
                    if let Some(execution) = self.execution_clone(serial, idx) {
                        monitor.log_test_completed(serial, &step.name, &execution);
                    }
                }
                return;
            }

            let elapsed = window_start.elapsed();
            if attempt + 1 < max_attempts && elapsed + RETRY_TIME_BUFFER < budget {
                warn!(
                    serial,
                    "Retrying test '{}' (attempt {}/{})",
                    step.name,
                    attempt + 2,
                    max_attempts
                );
                std::thread::sleep(RETRY_BACKOFF);
            } else {
                error!(
                    serial,
                    "Test '{}' failed after {} attempt(s)",
                    step.name,
                    attempt + 1
                );
                if let Some(monitor) = &self.monitor {
                    if let Some(execution) = self.execution_clone(serial, idx) {
                        monitor.log_test_failed(serial, &step.name, &execution);
                    }
                }
                return;
            }
        }
    }

    fn run_command_batch(&self, commands: &[CommandSpec], devices: &[String], label: &str) {
        if commands.is_empty() {
            return;
        }
        info!("Executing {label} commands");
        for serial in devices {
            for spec in commands {
                if let Err(e) = self.client.send(serial, &spec.to_command()) {
                    error!(serial, "{label} command failed: {e}");
                }
                std::thread::sleep(COMMAND_GAP);
            }
        }
    }

    /// Whether every predecessor of `step` completed on this device.
    fn dependencies_met(&self, serial: &str, step: &TestStep) -> bool {
        if step.depends_on.is_empty() {
            return true;
        }
        let state = self.state.lock().expect("sequencer lock poisoned");
        let Some(executions) = state.executions.get(serial) else {
            return false;
        };
        step.depends_on.iter().all(|dependency| {
            executions
                .iter()
                .find(|e| &e.step.name == dependency)
                .map(|e| e.status == TestStatus::Completed)
                .unwrap_or(false)
        })
    }

    /// Cancel ongoing execution for a device.
    ///
    /// The running execution transitions to failed immediately; the worker
    /// observes the flag at its next state check and stops issuing
    /// commands.
    pub fn cancel(&self, serial: &str) -> bool {
        let mut state = self.state.lock().expect("sequencer lock poisoned");
        state.cancelled.insert(serial.to_string());
        match state.executions.get_mut(serial) {
            Some(executions) => {
                for execution in executions.iter_mut() {
                    if execution.status == TestStatus::Running {
                        execution.status = TestStatus::Failed;
                        execution.error_message = Some("execution cancelled".to_string());
                        execution.end_time = Some(Utc::now());
                    }
                }
                true
            }
            None => false,
        }
    }

    /// Current execution records for a device.
    pub fn execution_status(&self, serial: &str) -> Option<Vec<TestExecution>> {
        let state = self.state.lock().expect("sequencer lock poisoned");
        state.executions.get(serial).cloned()
    }

    fn is_cancelled(&self, serial: &str) -> bool {
        let state = self.state.lock().expect("sequencer lock poisoned");
        state.cancelled.contains(serial)
    }

    fn status_of(&self, serial: &str, idx: usize) -> Option<TestStatus> {
        let state = self.state.lock().expect("sequencer lock poisoned");
        state
            .executions
            .get(serial)
            .and_then(|executions| executions.get(idx))
            .map(|e| e.status)
    }

    fn with_execution<F: FnOnce(&mut TestExecution)>(&self, serial: &str, idx: usize, f: F) {
        let mut state = self.state.lock().expect("sequencer lock poisoned");
        if let Some(execution) = state
            .executions
            .get_mut(serial)
            .and_then(|executions| executions.get_mut(idx))
        {
            f(execution);
        }
    }

    fn execution_clone(&self, serial: &str, idx: usize) -> Option<TestExecution> {
        let state = self.state.lock().expect("sequencer lock poisoned");
        state
            .executions
            .get(serial)
            .and_then(|executions| executions.get(idx))
            .cloned()
    }

    /// Mark executions from `from_idx` onward with a terminal status,
    /// leaving already-terminal records untouched.
    fn mark_remaining(
        &self,
        serial: &str,
        from_idx: usize,
        status: TestStatus,
        message: Option<&str>,
    ) {
        let mut state = self.state.lock().expect("sequencer lock poisoned");
        if let Some(executions) = state.executions.get_mut(serial) {
            for execution in executions.iter_mut().skip(from_idx) {
                if !execution.status.is_terminal() {
                    execution.status = status;
                    if let Some(message) = message {
                        execution.error_message = Some(message.to_string());
                    }
                }
            }
        }
    }
}

/// A basic validation configuration exercising each core subsystem.
pub fn basic_validation_config() -> TestConfiguration {
    TestConfiguration {
        name: "Basic Device Validation".to_string(),
        description: "Basic functionality validation for RP2040 devices".to_string(),
        steps: vec![
            TestStep {
                name: "system_health_check".to_string(),
                test_type: TestKind::UsbCommunicationTest,
                parameters: serde_json::json!({ "message_count": 10, "timeout_ms": 1000 }),
                timeout: 10.0,
                retry_count: 0,
                required: true,
                depends_on: vec![],
            },
            TestStep {
                name: "pemf_timing_validation".to_string(),
                test_type: TestKind::PemfTimingValidation,
                parameters: serde_json::json!({ "duration_ms": 5000, "tolerance_percent": 1.0 }),
                timeout: 15.0,
                retry_count: 0,
                required: true,
                depends_on: vec!["system_health_check".to_string()],
            },
            TestStep {
                name: "battery_adc_test".to_string(),
                test_type: TestKind::BatteryAdcCalibration,
                parameters: serde_json::json!({ "reference_voltage": 3.3 }),
                timeout: 10.0,
                retry_count: 0,
                required: true,
                depends_on: vec!["system_health_check".to_string()],
            },
            TestStep {
                name: "led_functionality_test".to_string(),
                test_type: TestKind::LedFunctionality,
                parameters: serde_json::json!({ "pattern": "all", "duration_ms": 2000 }),
                timeout: 10.0,
                retry_count: 0,
                required: true,
                depends_on: vec!["system_health_check".to_string()],
            },
        ],
        parallel_execution: false,
        max_parallel_devices: 4,
        global_timeout: 120.0,
        setup_commands: vec![],
        teardown_commands: vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(steps: Vec<TestStep>) -> TestConfiguration {
        TestConfiguration {
            name: "unit".to_string(),
            description: String::new(),
            steps,
            parallel_execution: false,
            max_parallel_devices: 4,
            global_timeout: 30.0,
            setup_commands: vec![],
            teardown_commands: vec![],
        }
    }

    #[test]
    fn test_validate_accepts_dag() {
        let mut b = TestStep::named("b");
        b.depends_on = vec!["a".to_string()];
        let config = config_with(vec![TestStep::named("a"), b]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicate_names() {
        let config = config_with(vec![TestStep::named("a"), TestStep::named("a")]);
        assert!(matches!(
            config.validate(),
            Err(HarnessError::DuplicateStep { name }) if name == "a"
        ));
    }

    #[test]
    fn test_validate_rejects_unknown_dependency() {
        let mut a = TestStep::named("a");
        a.depends_on = vec!["ghost".to_string()];
        let config = config_with(vec![a]);
        assert!(matches!(
            config.validate(),
            Err(HarnessError::UnknownDependency { dependency, .. }) if dependency == "ghost"
        ));
    }

    #[test]
    fn test_validate_rejects_cycle() {
        let mut a = TestStep::named("a");
        a.depends_on = vec!["c".to_string()];
        let mut b = TestStep::named("b");
        b.depends_on = vec!["a".to_string()];
        let mut c = TestStep::named("c");
        c.depends_on = vec!["b".to_string()];
        let config = config_with(vec![a, b, c]);
        assert!(matches!(
            config.validate(),
            Err(HarnessError::DependencyCycle { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_self_dependency() {
        let mut a = TestStep::named("a");
        a.depends_on = vec!["a".to_string()];
        let config = config_with(vec![a]);
        assert!(matches!(
            config.validate(),
            Err(HarnessError::DependencyCycle { .. })
        ));
    }

    #[test]
    fn test_execution_duration() {
        let mut execution = TestExecution::new(TestStep::named("a"), "DEV001");
        assert!(execution.duration_secs().is_none());
        let start = Utc::now();
        execution.start_time = Some(start);
        execution.end_time = Some(start + chrono::Duration::milliseconds(1500));
        let duration = execution.duration_secs().unwrap();
        assert!((duration - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_step_serde_defaults() {
        let step: TestStep = serde_json::from_str(
            r#"{ "name": "comm", "test_type": "USB_COMMUNICATION_TEST" }"#,
        )
        .unwrap();
        assert_eq!(step.timeout, 30.0);
        assert_eq!(step.retry_count, 0);
        assert!(step.required);
        assert!(step.depends_on.is_empty());
    }

    #[test]
    fn test_configuration_serde_round_trip() {
        let config = basic_validation_config();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: TestConfiguration = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.steps.len(), 4);
        assert_eq!(parsed.steps[1].depends_on, vec!["system_health_check"]);
        assert!(parsed.validate().is_ok());
    }
}
