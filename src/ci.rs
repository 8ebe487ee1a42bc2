//! CI/CD pipeline integration.
//!
//! Headless end-to-end driver: environment detection, device setup with
//! retry, optional firmware-flash pass, test execution, report
//! generation, artifact retention, and exit-code mapping.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};

use crate::bus::HidBus;
use crate::collector::{environment_info, ResultCollector, SuiteResult, TrendStore};
use crate::error::Result;
use crate::exec::CommandExecutor;
use crate::flasher::{FlashResult, FlashSupervisor};
use crate::frame::TestKind;
use crate::monitor::{LogLevel, MonitorConfig, RealTimeMonitor};
use crate::protocol::CommandClient;
use crate::registry::{DeviceRegistry, DeviceStatus};
use crate::report::{ReportFormat, ReportWriter};
use crate::sequencer::{TestConfiguration, TestSequencer, TestStatus, TestStep};

/// Process exit codes for the orchestrator.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const TEST_FAILURES: i32 = 1;
    pub const DEVICE_SETUP_FAILURE: i32 = 2;
    pub const FLASH_FAILURE: i32 = 3;
    pub const INTERNAL_ERROR: i32 = 4;
    pub const INTERRUPTED: i32 = 130;
}

/// Information about the detected CI environment.
#[derive(Debug, Clone, Serialize)]
pub struct CiEnvironment {
    pub ci_system: String,
    pub build_number: Option<String>,
    pub branch_name: Option<String>,
    pub commit_hash: Option<String>,
    pub pull_request: Option<String>,
    pub workspace_path: String,
}

impl CiEnvironment {
    /// Detect the CI system from the process environment.
    pub fn detect() -> Self {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_vars(&vars)
    }

    /// Detect the CI system from an explicit variable map.
    pub fn from_vars(vars: &HashMap<String, String>) -> Self {
        let get = |key: &str| vars.get(key).cloned();

        let (ci_system, build_number, branch_name, commit_hash, pull_request);
        if vars.contains_key("JENKINS_URL") {
            ci_system = "jenkins";
            build_number = get("BUILD_NUMBER");
            branch_name = get("GIT_BRANCH");
            commit_hash = get("GIT_COMMIT");
            pull_request = None;
        } else if vars.contains_key("GITHUB_ACTIONS") {
            ci_system = "github_actions";
            build_number = get("GITHUB_RUN_NUMBER");
            branch_name = get("GITHUB_REF_NAME");
            commit_hash = get("GITHUB_SHA");
            pull_request = get("GITHUB_EVENT_NUMBER");
        } else if vars.contains_key("GITLAB_CI") {
            ci_system = "gitlab_ci";
            build_number = get("CI_PIPELINE_ID");
            branch_name = get("CI_COMMIT_REF_NAME");
            commit_hash = get("CI_COMMIT_SHA");
            pull_request = get("CI_MERGE_REQUEST_IID");
        } else if vars.contains_key("AZURE_HTTP_USER_AGENT") {
            ci_system = "azure_devops";
            build_number = get("BUILD_BUILDNUMBER");
            branch_name = get("BUILD_SOURCEBRANCH");
            commit_hash = get("BUILD_SOURCEVERSION");
            pull_request = None;
        } else if vars.contains_key("CI") {
            ci_system = "generic_ci";
            build_number = None;
            branch_name = None;
            commit_hash = None;
            pull_request = None;
        } else {
            ci_system = "unknown";
            build_number = None;
            branch_name = None;
            commit_hash = None;
            pull_request = None;
        }

        Self {
            ci_system: ci_system.to_string(),
            build_number,
            branch_name,
            commit_hash,
            pull_request,
            workspace_path: std::env::current_dir()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
        }
    }
}

/// CI-specific test configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CiConfig {
    pub test_config: TestConfiguration,
    #[serde(default = "default_required_devices")]
    pub required_devices: usize,
    #[serde(default = "default_max_parallel")]
    pub max_parallel_devices: usize,
    #[serde(default)]
    pub firmware_path: Option<PathBuf>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: f64,
    #[serde(default = "default_true")]
    pub fail_fast: bool,
    #[serde(default = "default_true")]
    pub generate_artifacts: bool,
    #[serde(default = "default_retention_days")]
    pub artifact_retention_days: u64,
}

fn default_required_devices() -> usize {
    1
}

fn default_max_parallel() -> usize {
    4
}

fn default_timeout_seconds() -> f64 {
    300.0
}

fn default_true() -> bool {
    true
}

fn default_retention_days() -> u64 {
    30
}

impl CiConfig {
    /// Load from a JSON file, falling back to the default suite.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)?;
                Ok(serde_json::from_str(&content)?)
            }
            None => Ok(Self::default_pipeline()),
        }
    }

    /// The built-in CI validation suite.
    pub fn default_pipeline() -> Self {
        let mut comm = TestStep::new("device_communication_test", TestKind::UsbCommunicationTest);
        comm.parameters = json!({ "message_count": 3, "timeout_ms": 1000 });
        comm.timeout = 10.0;

        let mut pemf = TestStep::new("pemf_timing_validation", TestKind::PemfTimingValidation);
        pemf.parameters = json!({ "duration_ms": 2000, "tolerance_percent": 1.0 });
        pemf.timeout = 15.0;
        pemf.depends_on = vec!["device_communication_test".to_string()];

        let mut battery = TestStep::new("battery_monitoring_test", TestKind::BatteryAdcCalibration);
        battery.parameters = json!({ "reference_voltage": 3.3 });
        battery.timeout = 10.0;
        battery.depends_on = vec!["device_communication_test".to_string()];

        let mut stress = TestStep::new("system_health_check", TestKind::SystemStressTest);
        stress.parameters = json!({ "duration_ms": 3000, "load_level": 2 });
        stress.timeout = 15.0;
        stress.required = false;
        stress.depends_on = vec![
            "pemf_timing_validation".to_string(),
            "battery_monitoring_test".to_string(),
        ];

        Self {
            test_config: TestConfiguration {
                name: "CI Validation Suite".to_string(),
                description: "Automated validation for CI/CD pipeline".to_string(),
                steps: vec![comm, pemf, battery, stress],
                parallel_execution: true,
                max_parallel_devices: 4,
                global_timeout: 120.0,
                setup_commands: vec![],
                teardown_commands: vec![],
            },
            required_devices: 1,
            max_parallel_devices: 4,
            firmware_path: None,
            timeout_seconds: 300.0,
            fail_fast: true,
            generate_artifacts: true,
            artifact_retention_days: 30,
        }
    }
}

/// Comprehensive CI pipeline result.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutcome {
    pub success: bool,
    pub exit_code: i32,
    pub total_tests: usize,
    pub passed_tests: usize,
    pub failed_tests: usize,
    pub skipped_tests: usize,
    pub duration_seconds: f64,
    pub devices_tested: Vec<String>,
    pub artifacts_generated: Vec<PathBuf>,
    pub error_summary: Option<String>,
}

impl PipelineOutcome {
    fn aborted(exit_code: i32, duration: Duration, summary: &str) -> Self {
        Self {
            success: false,
            exit_code,
            total_tests: 0,
            passed_tests: 0,
            failed_tests: 0,
            skipped_tests: 0,
            duration_seconds: duration.as_secs_f64(),
            devices_tested: Vec::new(),
            artifacts_generated: Vec::new(),
            error_summary: Some(summary.to_string()),
        }
    }
}

/// End-to-end CI pipeline with automated device management.
pub struct CiPipeline {
    output_dir: PathBuf,
    registry: Arc<DeviceRegistry>,
    sequencer: TestSequencer,
    flasher: FlashSupervisor,
    monitor: Arc<RealTimeMonitor>,
    collector: ResultCollector,
    trends: Mutex<TrendStore>,
    environment: CiEnvironment,
    interrupted: Arc<AtomicBool>,
}

impl CiPipeline {
    /// Build a pipeline over explicit bus and executor implementations.
    pub fn with_components(
        output_dir: &Path,
        bus: Arc<dyn HidBus>,
        executor: Arc<dyn CommandExecutor>,
        log_level: LogLevel,
        interrupted: Arc<AtomicBool>,
    ) -> Result<Self> {
        std::fs::create_dir_all(output_dir)?;
        std::fs::create_dir_all(output_dir.join("logs"))?;

        let monitor = Arc::new(RealTimeMonitor::with_config(MonitorConfig {
            log_level,
            ..MonitorConfig::default()
        }));
        let registry = Arc::new(DeviceRegistry::new(bus));
        let client = Arc::new(CommandClient::new(
            Arc::clone(&registry),
            Some(Arc::clone(&monitor)),
        ));
        let sequencer = TestSequencer::new(
            Arc::clone(&registry),
            Arc::clone(&client),
            Some(Arc::clone(&monitor)),
        );
        let flasher = FlashSupervisor::new(Arc::clone(&registry), client, executor);

        Ok(Self {
            output_dir: output_dir.to_path_buf(),
            registry,
            sequencer,
            flasher,
            monitor,
            collector: ResultCollector::new(),
            trends: Mutex::new(TrendStore::new()),
            environment: CiEnvironment::detect(),
            interrupted,
        })
    }

    /// Access the flash supervisor (tool availability checks).
    pub fn flasher(&self) -> &FlashSupervisor {
        &self.flasher
    }

    /// Run the complete pipeline: setup, optional flash, tests, reports.
    pub fn run(&self, config: &CiConfig) -> PipelineOutcome {
        let pipeline_start = Instant::now();
        self.monitor.start();

        let outcome = self.run_stages(config, pipeline_start);

        // Cleanup always happens, whatever the outcome.
        self.monitor.stop();
        self.registry.disconnect_all();
        if let Err(e) = self.prune_old_outputs(config.artifact_retention_days) {
            warn!("Failed to prune old outputs: {e}");
        }

        outcome
    }

    fn run_stages(&self, config: &CiConfig, pipeline_start: Instant) -> PipelineOutcome {
        if self.is_interrupted() {
            return PipelineOutcome::aborted(
                exit_code::INTERRUPTED,
                pipeline_start.elapsed(),
                "Interrupted before device setup",
            );
        }

        // Stage 1: device discovery and connection.
        let (devices, setup_ok) = self.discover_and_setup(config.required_devices, 3);
        if !setup_ok {
            return PipelineOutcome::aborted(
                exit_code::DEVICE_SETUP_FAILURE,
                pipeline_start.elapsed(),
                "Failed to discover and setup required devices",
            );
        }

        // Stage 2: optional firmware flash pass.
        let mut flash_ok = true;
        if let Some(firmware) = &config.firmware_path {
            flash_ok = self.flash_all(&devices, firmware, config.max_parallel_devices);
            if !flash_ok && config.fail_fast {
                let mut outcome = PipelineOutcome::aborted(
                    exit_code::FLASH_FAILURE,
                    pipeline_start.elapsed(),
                    "Firmware flashing failed",
                );
                outcome.devices_tested = devices;
                return outcome;
            }
        }

        if self.is_interrupted() {
            return PipelineOutcome::aborted(
                exit_code::INTERRUPTED,
                pipeline_start.elapsed(),
                "Interrupted before test execution",
            );
        }

        // Stage 3: test execution.
        let start_time = Utc::now();
        let execution_results = match self.sequencer.execute(
            &config.test_config,
            Some(&devices),
            Some(Duration::from_secs_f64(config.timeout_seconds.max(0.0))),
        ) {
            Ok(results) => results,
            Err(e) => {
                error!("Test execution failed: {e}");
                return PipelineOutcome::aborted(
                    exit_code::INTERNAL_ERROR,
                    pipeline_start.elapsed(),
                    &format!("Test execution failed: {e}"),
                );
            }
        };
        let end_time = Utc::now();

        // Stage 4: aggregation.
        let mut env = environment_info();
        env["ci"] = serde_json::to_value(&self.environment).unwrap_or_default();
        let suite = {
            let mut trends = self.trends.lock().expect("trend store lock poisoned");
            self.collector.collect(
                &config.test_config.name,
                &config.test_config.description,
                &execution_results,
                start_time,
                end_time,
                env,
                &mut trends,
            )
        };
        self.log_summary(&suite);

        // Stage 5: reports and artifacts.
        let artifacts = if config.generate_artifacts {
            self.generate_reports(&suite, true)
        } else {
            self.generate_reports(&suite, false)
        };

        let test_ok = suite
            .device_results
            .values()
            .all(|result| result.overall_status != TestStatus::Failed);
        let exit = if !test_ok {
            exit_code::TEST_FAILURES
        } else if !flash_ok {
            exit_code::FLASH_FAILURE
        } else {
            exit_code::SUCCESS
        };

        PipelineOutcome {
            success: test_ok && flash_ok,
            exit_code: exit,
            total_tests: suite.aggregate_metrics.total_tests,
            passed_tests: suite.aggregate_metrics.passed_tests,
            failed_tests: suite.aggregate_metrics.failed_tests,
            skipped_tests: suite.aggregate_metrics.skipped_tests,
            duration_seconds: pipeline_start.elapsed().as_secs_f64(),
            devices_tested: devices,
            artifacts_generated: artifacts,
            error_summary: if test_ok {
                None
            } else {
                Some("Test failures detected".to_string())
            },
        }
    }

    /// Discover and connect devices with retry.
    fn discover_and_setup(&self, required: usize, max_attempts: u32) -> (Vec<String>, bool) {
        info!("Discovering devices (required: {required})...");
        let mut connected: Vec<String> = Vec::new();

        for attempt in 1..=max_attempts {
            if self.is_interrupted() {
                break;
            }
            info!("Discovery attempt {attempt}/{max_attempts}");

            let records = self.registry.discover();
            info!("Found {} device(s)", records.len());

            for record in &records {
                if record.status == DeviceStatus::Connected
                    && !connected.contains(&record.serial_number)
                    && self.registry.connect(&record.serial_number)
                {
                    connected.push(record.serial_number.clone());
                }
            }

            if connected.len() >= required {
                info!("Successfully connected to {} device(s)", connected.len());
                return (connected, true);
            }

            if attempt < max_attempts {
                warn!(
                    "Only {} device(s) connected, retrying in 3 seconds...",
                    connected.len()
                );
                for serial in &connected {
                    self.registry.disconnect(serial);
                }
                connected.clear();
                std::thread::sleep(Duration::from_secs(3));
            }
        }

        error!(
            "Failed to connect to required devices: {}/{required}",
            connected.len()
        );
        (connected, false)
    }

    /// Flash firmware to every device in parallel; true if all succeeded.
    fn flash_all(&self, devices: &[String], firmware: &Path, max_parallel: usize) -> bool {
        if !firmware.exists() {
            error!("Firmware file not found: {}", firmware.display());
            return false;
        }
        info!(
            "Flashing firmware to {} device(s) (parallel: {max_parallel})...",
            devices.len()
        );

        let map: HashMap<String, PathBuf> = devices
            .iter()
            .map(|serial| (serial.clone(), firmware.to_path_buf()))
            .collect();
        let results = self.flasher.flash_multiple(&map, true, max_parallel);

        let mut succeeded = 0;
        for (serial, operation) in &results {
            if operation.result == Some(FlashResult::Success) {
                succeeded += 1;
                info!(
                    "Firmware flash successful: {serial} ({:.1}s)",
                    operation.total_duration().unwrap_or(0.0)
                );
            } else {
                error!(
                    "Firmware flash failed: {serial} - {}",
                    operation.error_message.as_deref().unwrap_or("unknown")
                );
            }
        }
        info!(
            "Firmware flash completed: {succeeded}/{} successful",
            devices.len()
        );
        succeeded == devices.len()
    }

    /// Render reports into the output directory.
    fn generate_reports(&self, suite: &SuiteResult, with_artifacts: bool) -> Vec<PathBuf> {
        let writer = match ReportWriter::new(&self.output_dir) {
            Ok(writer) => writer,
            Err(e) => {
                error!("Failed to prepare report directory: {e}");
                return Vec::new();
            }
        };

        let mut formats = vec![ReportFormat::Json, ReportFormat::JunitXml];
        if with_artifacts {
            formats.push(ReportFormat::Html);
            formats.push(ReportFormat::Csv);
        }
        if matches!(self.environment.ci_system.as_str(), "jenkins" | "azure_devops") {
            formats.push(ReportFormat::Tap);
        }

        let mut paths = writer.generate(suite, &formats);
        if with_artifacts {
            match writer.save_artifacts(suite) {
                Ok(mut artifact_paths) => paths.append(&mut artifact_paths),
                Err(e) => warn!("Failed to save artifacts: {e}"),
            }
        }
        paths
    }

    fn log_summary(&self, suite: &SuiteResult) {
        let metrics = &suite.aggregate_metrics;
        info!("{}", "=".repeat(60));
        info!("TEST SUITE COMPLETED: {}", suite.suite_name);
        info!("{}", "=".repeat(60));
        info!("Total Tests: {}", metrics.total_tests);
        info!("Passed: {}", metrics.passed_tests);
        info!("Failed: {}", metrics.failed_tests);
        info!("Skipped: {}", metrics.skipped_tests);
        info!("Success Rate: {:.1}%", metrics.success_rate);
        info!("Duration: {:.1} seconds", suite.duration);
        info!("Devices Tested: {}", suite.device_results.len());

        for (serial, result) in &suite.device_results {
            info!(
                "  {serial}: {}/{} passed ({:.1}%)",
                result.metrics.passed_tests,
                result.metrics.total_tests,
                result.metrics.success_rate
            );
        }

        if metrics.failed_tests > 0 {
            error!("FAILED TESTS:");
            for (serial, result) in &suite.device_results {
                for execution in &result.executions {
                    if execution.status == TestStatus::Failed {
                        error!(
                            "  {serial}: {} - {}",
                            execution.step.name,
                            execution.error_message.as_deref().unwrap_or("unknown")
                        );
                    }
                }
            }
        }
        info!("{}", "=".repeat(60));
    }

    /// Remove report, artifact, and log files older than the retention
    /// period.
    fn prune_old_outputs(&self, retention_days: u64) -> Result<()> {
        if retention_days == 0 {
            return Ok(());
        }
        let cutoff = std::time::SystemTime::now()
            .checked_sub(Duration::from_secs(retention_days * 24 * 60 * 60));
        let Some(cutoff) = cutoff else {
            return Ok(());
        };

        let mut removed = 0usize;
        for dir in [
            self.output_dir.clone(),
            self.output_dir.join("artifacts"),
            self.output_dir.join("logs"),
        ] {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let is_output_file = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| matches!(e, "json" | "xml" | "html" | "csv" | "tap" | "log"))
                    .unwrap_or(false);
                if !is_output_file {
                    continue;
                }
                let modified = entry.metadata().and_then(|m| m.modified());
                if let Ok(modified) = modified {
                    if modified < cutoff && std::fs::remove_file(&path).is_ok() {
                        removed += 1;
                    }
                }
            }
        }
        if removed > 0 {
            info!("Cleaned up {removed} old output file(s)");
        }
        Ok(())
    }

    fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_detect_github_actions() {
        let env = CiEnvironment::from_vars(&vars(&[
            ("GITHUB_ACTIONS", "true"),
            ("GITHUB_RUN_NUMBER", "42"),
            ("GITHUB_REF_NAME", "main"),
            ("GITHUB_SHA", "abc123"),
        ]));
        assert_eq!(env.ci_system, "github_actions");
        assert_eq!(env.build_number.as_deref(), Some("42"));
        assert_eq!(env.branch_name.as_deref(), Some("main"));
        assert_eq!(env.commit_hash.as_deref(), Some("abc123"));
    }

    #[test]
    fn test_detect_jenkins_and_generic() {
        let env = CiEnvironment::from_vars(&vars(&[
            ("JENKINS_URL", "http://jenkins"),
            ("BUILD_NUMBER", "7"),
        ]));
        assert_eq!(env.ci_system, "jenkins");
        assert_eq!(env.build_number.as_deref(), Some("7"));

        let env = CiEnvironment::from_vars(&vars(&[("CI", "1")]));
        assert_eq!(env.ci_system, "generic_ci");

        let env = CiEnvironment::from_vars(&vars(&[]));
        assert_eq!(env.ci_system, "unknown");
    }

    #[test]
    fn test_default_pipeline_config_is_valid() {
        let config = CiConfig::default_pipeline();
        assert!(config.test_config.validate().is_ok());
        assert_eq!(config.test_config.steps.len(), 4);
        assert!(config.fail_fast);
        assert_eq!(config.required_devices, 1);
    }

    #[test]
    fn test_config_parses_with_defaults() {
        let json = r#"{
            "test_config": {
                "name": "Minimal",
                "steps": [
                    { "name": "comm", "test_type": "USB_COMMUNICATION_TEST" }
                ]
            }
        }"#;
        let config: CiConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.required_devices, 1);
        assert_eq!(config.max_parallel_devices, 4);
        assert_eq!(config.timeout_seconds, 300.0);
        assert!(config.generate_artifacts);
        assert_eq!(config.artifact_retention_days, 30);
        assert!(config.test_config.validate().is_ok());
    }
}
