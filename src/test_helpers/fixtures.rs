//! Builders for creating test instances of orchestrator data types.

use std::collections::HashMap;

use chrono::Utc;
use serde_json::Value;

use crate::collector::{environment_info, ResultCollector, SuiteResult, TrendStore};
use crate::frame::TestKind;
use crate::sequencer::{TestConfiguration, TestExecution, TestStatus, TestStep};

/// Builder for creating test [`TestStep`] instances.
pub struct TestStepBuilder {
    step: TestStep,
}

impl TestStepBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            step: TestStep::named(name),
        }
    }

    pub fn test_type(mut self, test_type: TestKind) -> Self {
        self.step.test_type = test_type;
        self
    }

    pub fn parameters(mut self, parameters: Value) -> Self {
        self.step.parameters = parameters;
        self
    }

    pub fn timeout(mut self, seconds: f64) -> Self {
        self.step.timeout = seconds;
        self
    }

    pub fn retry_count(mut self, retries: u32) -> Self {
        self.step.retry_count = retries;
        self
    }

    pub fn required(mut self, required: bool) -> Self {
        self.step.required = required;
        self
    }

    pub fn depends_on(mut self, names: &[&str]) -> Self {
        self.step.depends_on = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn build(self) -> TestStep {
        self.step
    }
}

/// Builder for creating test [`TestConfiguration`] instances.
pub struct ConfigurationBuilder {
    config: TestConfiguration,
}

impl ConfigurationBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            config: TestConfiguration {
                name: name.to_string(),
                description: format!("{name} test configuration"),
                steps: Vec::new(),
                parallel_execution: false,
                max_parallel_devices: 4,
                global_timeout: 30.0,
                setup_commands: Vec::new(),
                teardown_commands: Vec::new(),
            },
        }
    }

    pub fn step(mut self, step: TestStep) -> Self {
        self.config.steps.push(step);
        self
    }

    pub fn parallel(mut self, max_devices: usize) -> Self {
        self.config.parallel_execution = true;
        self.config.max_parallel_devices = max_devices;
        self
    }

    pub fn global_timeout(mut self, seconds: f64) -> Self {
        self.config.global_timeout = seconds;
        self
    }

    pub fn build(self) -> TestConfiguration {
        self.config
    }
}

/// An execution record in a given terminal state with plausible timing.
pub fn execution_with_status(
    serial: &str,
    name: &str,
    status: TestStatus,
    duration_ms: i64,
) -> TestExecution {
    let mut execution = TestExecution::new(TestStep::named(name), serial);
    execution.status = status;
    if status != TestStatus::Skipped && status != TestStatus::Pending {
        let start = Utc::now() - chrono::Duration::milliseconds(duration_ms);
        execution.start_time = Some(start);
        execution.end_time = Some(start + chrono::Duration::milliseconds(duration_ms));
    }
    if status == TestStatus::Failed {
        execution.error_message = Some("Device returned error: ERROR_HARDWARE_FAULT".to_string());
    }
    execution
}

/// A small single-device suite result with one completed, one failed, and
/// one skipped execution; exercises every report renderer path.
pub fn sample_suite_result() -> SuiteResult {
    let mut comm = execution_with_status("DEV001", "comm_check", TestStatus::Completed, 1200);
    comm.step.parameters = serde_json::json!({ "message_count": 10 });

    let timing = execution_with_status("DEV001", "timing_check", TestStatus::Failed, 2500);
    let led = execution_with_status("DEV001", "led_check", TestStatus::Skipped, 0);

    let mut results = HashMap::new();
    results.insert("DEV001".to_string(), vec![comm, timing, led]);

    let end = Utc::now();
    let start = end - chrono::Duration::seconds(12);
    let mut trends = TrendStore::new();
    ResultCollector::new().collect(
        "sample_suite",
        "Sample suite for renderer tests",
        &results,
        start,
        end,
        environment_info(),
        &mut trends,
    )
}
