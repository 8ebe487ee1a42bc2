//! Test result collection and analysis.
//!
//! Converts accumulated execution state into the terminal suite result:
//! per-device and aggregate metrics, artifact synthesis, performance trend
//! detection, and failure analysis. The collector is stateless per run;
//! trend history lives in a caller-owned [`TrendStore`].

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};

use crate::sequencer::{TestExecution, TestStatus};

/// Test execution metrics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TestMetrics {
    pub total_tests: usize,
    pub passed_tests: usize,
    pub failed_tests: usize,
    pub skipped_tests: usize,
    pub timeout_tests: usize,
    pub total_duration: f64,
    pub average_duration: f64,
    pub success_rate: f64,
}

/// Test results for a single device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceResult {
    pub device_serial: String,
    pub executions: Vec<TestExecution>,
    pub metrics: TestMetrics,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub overall_status: TestStatus,
}

/// Synthesised suite artifact (timing data, error reports, performance).
#[derive(Debug, Clone, Serialize)]
pub struct SuiteArtifact {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub content: Value,
    pub timestamp: DateTime<Utc>,
    pub size_bytes: usize,
    pub metadata: Value,
}

/// Trend direction for one performance metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Improving,
    Degrading,
    Stable,
    Unknown,
}

impl TrendDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrendDirection::Improving => "improving",
            TrendDirection::Degrading => "degrading",
            TrendDirection::Stable => "stable",
            TrendDirection::Unknown => "unknown",
        }
    }
}

/// Performance trend data for regression analysis.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceTrend {
    pub metric_name: String,
    pub historical_values: Vec<f64>,
    pub current_value: f64,
    pub trend_direction: TrendDirection,
    pub regression_detected: bool,
    pub confidence_level: f64,
}

/// Complete test suite results.
#[derive(Debug, Clone, Serialize)]
pub struct SuiteResult {
    pub suite_name: String,
    pub description: String,
    pub device_results: BTreeMap<String, DeviceResult>,
    pub aggregate_metrics: TestMetrics,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Suite duration in seconds.
    pub duration: f64,
    pub artifacts: Vec<SuiteArtifact>,
    pub performance_trends: Vec<PerformanceTrend>,
    pub environment_info: Value,
}

/// Samples retained per metric for trend analysis.
const TREND_HISTORY_CAP: usize = 30;

/// Caller-owned store of performance metric history across runs.
#[derive(Debug, Default)]
pub struct TrendStore {
    history: HashMap<String, Vec<(DateTime<Utc>, f64)>>,
}

impl TrendStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sample and return the historical values preceding it.
    fn record(&mut self, metric: &str, timestamp: DateTime<Utc>, value: f64) -> Vec<f64> {
        let samples = self.history.entry(metric.to_string()).or_default();
        samples.push((timestamp, value));
        if samples.len() > TREND_HISTORY_CAP {
            let excess = samples.len() - TREND_HISTORY_CAP;
            samples.drain(..excess);
        }
        samples[..samples.len() - 1]
            .iter()
            .map(|(_, v)| *v)
            .collect()
    }

    /// Retained sample count for one metric.
    pub fn sample_count(&self, metric: &str) -> usize {
        self.history.get(metric).map(Vec::len).unwrap_or(0)
    }
}

/// Collects and analyses test execution results.
#[derive(Debug, Default)]
pub struct ResultCollector;

impl ResultCollector {
    pub fn new() -> Self {
        Self
    }

    /// Build the terminal suite result from raw execution records.
    pub fn collect(
        &self,
        suite_name: &str,
        description: &str,
        execution_results: &HashMap<String, Vec<TestExecution>>,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        environment_info: Value,
        trends: &mut TrendStore,
    ) -> SuiteResult {
        let mut device_results = BTreeMap::new();
        let mut all_executions = Vec::new();

        for (serial, executions) in execution_results {
            let metrics = calculate_metrics(executions);
            let device_start = executions
                .iter()
                .filter_map(|e| e.start_time)
                .min()
                .unwrap_or(start_time);
            let device_end = executions
                .iter()
                .filter_map(|e| e.end_time)
                .max()
                .unwrap_or(end_time);

            device_results.insert(
                serial.clone(),
                DeviceResult {
                    device_serial: serial.clone(),
                    executions: executions.clone(),
                    metrics,
                    start_time: device_start,
                    end_time: device_end,
                    overall_status: overall_status(executions),
                },
            );
            all_executions.extend(executions.iter().cloned());
        }

        let aggregate_metrics = calculate_metrics(&all_executions);
        let artifacts = collect_artifacts(&all_executions, suite_name);
        let performance_trends = analyze_trends(&all_executions, trends);

        SuiteResult {
            suite_name: suite_name.to_string(),
            description: description.to_string(),
            device_results,
            aggregate_metrics,
            start_time,
            end_time,
            duration: (end_time - start_time).num_milliseconds() as f64 / 1000.0,
            artifacts,
            performance_trends,
            environment_info,
        }
    }

    /// Group failures by step and device; flag widespread failures with
    /// remediation hints.
    pub fn failure_analysis(&self, suite: &SuiteResult) -> Value {
        let mut failure_by_test: BTreeMap<String, usize> = BTreeMap::new();
        let mut failure_by_device: BTreeMap<String, usize> = BTreeMap::new();

        for device_result in suite.device_results.values() {
            for execution in &device_result.executions {
                if execution.status == TestStatus::Failed {
                    *failure_by_test.entry(execution.step.name.clone()).or_default() += 1;
                    *failure_by_device
                        .entry(execution.device_serial.clone())
                        .or_default() += 1;
                }
            }
        }

        let total_devices = suite.device_results.len();
        let mut common_failures = Vec::new();
        for (test_name, failures) in &failure_by_test {
            if total_devices > 0 && *failures as f64 > total_devices as f64 * 0.5 {
                common_failures.push(json!({
                    "test_name": test_name,
                    "failure_rate": *failures as f64 / total_devices as f64 * 100.0,
                    "affected_devices": failures,
                }));
            }
        }

        let mut recommendations = Vec::new();
        if !common_failures.is_empty() {
            recommendations.push(
                "Multiple devices failed the same tests - check for firmware or hardware issues"
                    .to_string(),
            );
        }
        if suite.aggregate_metrics.timeout_tests > 0 {
            recommendations.push(
                "Some tests timed out - consider increasing timeout values or checking device responsiveness"
                    .to_string(),
            );
        }

        json!({
            "total_failures": suite.aggregate_metrics.failed_tests,
            "failure_by_test": failure_by_test,
            "failure_by_device": failure_by_device,
            "common_failures": common_failures,
            "recommendations": recommendations,
        })
    }

    /// Per-test duration statistics and the slowest-tests ranking.
    pub fn performance_analysis(&self, suite: &SuiteResult) -> Value {
        let mut test_times: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for device_result in suite.device_results.values() {
            for execution in &device_result.executions {
                if let Some(duration) = execution.duration_secs() {
                    test_times
                        .entry(execution.step.name.clone())
                        .or_default()
                        .push(duration);
                }
            }
        }

        let mut execution_times = BTreeMap::new();
        let mut averages: Vec<(String, f64)> = Vec::new();
        for (test_name, times) in &test_times {
            let mean_time = mean(times);
            averages.push((test_name.clone(), mean_time));
            execution_times.insert(
                test_name.clone(),
                json!({
                    "min": times.iter().cloned().fold(f64::INFINITY, f64::min),
                    "max": times.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
                    "mean": mean_time,
                    "median": median(times),
                    "std_dev": std_dev(times),
                }),
            );
        }

        averages.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        averages.truncate(5);

        json!({
            "execution_times": execution_times,
            "slowest_tests": averages,
        })
    }

    /// Regression report over the suite's detected trends.
    pub fn regression_report(&self, suite: &SuiteResult) -> Value {
        let regressions: Vec<&PerformanceTrend> = suite
            .performance_trends
            .iter()
            .filter(|t| t.regression_detected)
            .collect();

        let details: Vec<Value> = regressions
            .iter()
            .map(|trend| {
                json!({
                    "metric_name": trend.metric_name,
                    "current_value": trend.current_value,
                    "historical_mean": mean(&trend.historical_values),
                    "trend_direction": trend.trend_direction.as_str(),
                    "confidence_level": trend.confidence_level,
                    "severity": regression_severity(trend),
                })
            })
            .collect();

        let mut recommendations = Vec::new();
        if !regressions.is_empty() {
            recommendations.extend([
                "Review recent code changes that might affect performance".to_string(),
                "Run additional validation tests to confirm regressions".to_string(),
                "Investigate hardware or environmental factors".to_string(),
            ]);
        }

        let analyzed = suite.performance_trends.len();
        json!({
            "summary": {
                "total_metrics_analyzed": analyzed,
                "regressions_detected": regressions.len(),
                "regression_rate": if analyzed > 0 {
                    regressions.len() as f64 / analyzed as f64 * 100.0
                } else {
                    0.0
                },
            },
            "regressions": details,
            "recommendations": recommendations,
        })
    }
}

/// Calculate metrics for a list of executions.
fn calculate_metrics(executions: &[TestExecution]) -> TestMetrics {
    if executions.is_empty() {
        return TestMetrics::default();
    }

    let total = executions.len();
    let passed = count_status(executions, TestStatus::Completed);
    let failed = count_status(executions, TestStatus::Failed);
    let skipped = count_status(executions, TestStatus::Skipped);
    let timeout = count_status(executions, TestStatus::Timeout);

    let durations: Vec<f64> = executions.iter().filter_map(|e| e.duration_secs()).collect();
    let total_duration: f64 = durations.iter().sum();
    let average_duration = if durations.is_empty() {
        0.0
    } else {
        total_duration / durations.len() as f64
    };

    TestMetrics {
        total_tests: total,
        passed_tests: passed,
        failed_tests: failed,
        skipped_tests: skipped,
        timeout_tests: timeout,
        total_duration,
        average_duration,
        success_rate: passed as f64 / total as f64 * 100.0,
    }
}

fn count_status(executions: &[TestExecution], status: TestStatus) -> usize {
    executions.iter().filter(|e| e.status == status).count()
}

/// Overall device status: completed iff every required execution reached
/// completed; an empty execution list is skipped.
fn overall_status(executions: &[TestExecution]) -> TestStatus {
    if executions.is_empty() {
        return TestStatus::Skipped;
    }
    let all_required_completed = executions
        .iter()
        .filter(|e| e.step.required)
        .all(|e| e.status == TestStatus::Completed);
    if all_required_completed {
        TestStatus::Completed
    } else {
        TestStatus::Failed
    }
}

/// Build timing, error, and performance artifacts from the execution list.
fn collect_artifacts(executions: &[TestExecution], suite_name: &str) -> Vec<SuiteArtifact> {
    let timestamp = Utc::now();
    let mut artifacts = Vec::new();

    let timing_rows: Vec<Value> = executions
        .iter()
        .filter_map(|e| {
            e.duration_secs().map(|duration| {
                json!({
                    "test_name": e.step.name,
                    "device_serial": e.device_serial,
                    "duration": duration,
                    "start_time": e.start_time,
                    "end_time": e.end_time,
                    "status": e.status.as_str(),
                })
            })
        })
        .collect();
    if !timing_rows.is_empty() {
        artifacts.push(make_artifact(suite_name, "timing", "timing_data", timing_rows, timestamp));
    }

    let error_rows: Vec<Value> = executions
        .iter()
        .filter(|e| e.status == TestStatus::Failed && e.error_message.is_some())
        .map(|e| {
            json!({
                "test_name": e.step.name,
                "device_serial": e.device_serial,
                "error_message": e.error_message,
                "timestamp": e.end_time.or(e.start_time),
                "retry_attempt": e.retry_attempt,
                "test_parameters": e.step.parameters,
            })
        })
        .collect();
    if !error_rows.is_empty() {
        artifacts.push(make_artifact(suite_name, "error", "error_reports", error_rows, timestamp));
    }

    let performance_rows: Vec<Value> = executions
        .iter()
        .filter_map(|e| {
            let response = e.response.as_ref()?;
            let metrics = response.performance_metrics();
            if metrics.is_empty() {
                return None;
            }
            Some(json!({
                "test_name": e.step.name,
                "device_serial": e.device_serial,
                "metrics": metrics.into_iter().collect::<BTreeMap<String, f64>>(),
                "timestamp": response.timestamp,
            }))
        })
        .collect();
    if !performance_rows.is_empty() {
        artifacts.push(make_artifact(
            suite_name,
            "performance",
            "performance_data",
            performance_rows,
            timestamp,
        ));
    }

    artifacts
}

fn make_artifact(
    suite_name: &str,
    kind: &str,
    suffix: &str,
    rows: Vec<Value>,
    timestamp: DateTime<Utc>,
) -> SuiteArtifact {
    let row_count = rows.len();
    let content = Value::Array(rows);
    let size_bytes = content.to_string().len();
    SuiteArtifact {
        name: format!("{suite_name}_{suffix}"),
        kind: kind.to_string(),
        content,
        timestamp,
        size_bytes,
        metadata: json!({ "row_count": row_count, "suite_name": suite_name }),
    }
}

/// Analyse performance trends across completed responses.
fn analyze_trends(executions: &[TestExecution], store: &mut TrendStore) -> Vec<PerformanceTrend> {
    let now = Utc::now();

    // Mean of each metric across this run's completed responses.
    let mut current: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for execution in executions {
        if execution.status != TestStatus::Completed {
            continue;
        }
        if let Some(response) = &execution.response {
            for (name, value) in response.performance_metrics() {
                current.entry(name).or_default().push(value);
            }
        }
    }

    let mut trends = Vec::new();
    for (metric_name, values) in current {
        let current_value = mean(&values);
        let historical = store.record(&metric_name, now, current_value);
        if historical.len() < 3 {
            continue;
        }
        let (direction, regression_detected, confidence) =
            detect_regression(&historical, current_value);
        trends.push(PerformanceTrend {
            metric_name,
            historical_values: historical,
            current_value,
            trend_direction: direction,
            regression_detected,
            confidence_level: confidence,
        });
    }
    trends
}

/// Statistical regression detection over one metric's history.
///
/// Direction compares the slope of the last five samples against a stable
/// band of 0.1 historical standard deviations; a positive slope counts as
/// degrading (higher-is-worse convention). Regression is a z-score above
/// 2.0, falling back to a 20% relative-change test when the history has no
/// variance.
fn detect_regression(historical: &[f64], current: f64) -> (TrendDirection, bool, f64) {
    if historical.len() < 3 {
        return (TrendDirection::Unknown, false, 0.0);
    }

    let hist_mean = mean(historical);
    let hist_stdev = std_dev(historical);

    let recent: Vec<f64> = historical
        .iter()
        .rev()
        .take(5)
        .rev()
        .cloned()
        .collect();
    let direction = if recent.len() >= 2 {
        let slope = (recent[recent.len() - 1] - recent[0]) / recent.len() as f64;
        if slope.abs() <= hist_stdev * 0.1 {
            TrendDirection::Stable
        } else if slope > 0.0 {
            TrendDirection::Degrading
        } else {
            TrendDirection::Improving
        }
    } else {
        TrendDirection::Stable
    };

    if hist_stdev > 0.0 {
        let z_score = (current - hist_mean).abs() / hist_stdev;
        (direction, z_score > 2.0, (z_score / 3.0).min(1.0))
    } else {
        let change = if hist_mean != 0.0 {
            (current - hist_mean).abs() / hist_mean
        } else {
            0.0
        };
        (direction, change > 0.2, (change * 2.0).min(1.0))
    }
}

fn regression_severity(trend: &PerformanceTrend) -> &'static str {
    if trend.confidence_level >= 0.9 {
        "critical"
    } else if trend.confidence_level >= 0.7 {
        "high"
    } else if trend.confidence_level >= 0.5 {
        "medium"
    } else {
        "low"
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Sample standard deviation, matching the reference statistics.
fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let variance =
        values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    variance.sqrt()
}

/// Collect environment information for report context.
pub fn environment_info() -> Value {
    json!({
        "timestamp": Utc::now(),
        "platform": std::env::consts::OS,
        "architecture": std::env::consts::ARCH,
        "hostname": std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()),
        "user": std::env::var("USER").unwrap_or_else(|_| "unknown".to_string()),
        "working_directory": std::env::current_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| "unknown".to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Response;
    use crate::sequencer::TestStep;

    fn execution(serial: &str, name: &str, status: TestStatus, secs: f64) -> TestExecution {
        let mut execution = TestExecution::new(TestStep::named(name), serial);
        execution.status = status;
        let start = Utc::now();
        execution.start_time = Some(start);
        execution.end_time = Some(start + chrono::Duration::milliseconds((secs * 1000.0) as i64));
        if status == TestStatus::Failed {
            execution.error_message = Some("Device returned error: ERROR_SYSTEM_BUSY".to_string());
        }
        execution
    }

    fn with_metrics(mut execution: TestExecution, metrics: Value) -> TestExecution {
        execution.response = Response::from_log_line(&format!(
            r#"TEST_RESPONSE:{{"command_id":1,"status":0,"type":"test_result","data":{{"performance_metrics":{metrics}}}}}"#
        ));
        execution
    }

    #[test]
    fn test_metrics_counts_and_rates() {
        let executions = vec![
            execution("D1", "a", TestStatus::Completed, 1.0),
            execution("D1", "b", TestStatus::Failed, 2.0),
            execution("D1", "c", TestStatus::Skipped, 0.0),
            execution("D1", "d", TestStatus::Timeout, 3.0),
        ];
        let metrics = calculate_metrics(&executions);
        assert_eq!(metrics.total_tests, 4);
        assert_eq!(metrics.passed_tests, 1);
        assert_eq!(metrics.failed_tests, 1);
        assert_eq!(metrics.skipped_tests, 1);
        assert_eq!(metrics.timeout_tests, 1);
        assert_eq!(metrics.success_rate, 25.0);
        assert!((metrics.total_duration - 6.0).abs() < 1e-6);
    }

    #[test]
    fn test_empty_executions_give_zero_metrics_and_skipped_status() {
        let metrics = calculate_metrics(&[]);
        assert_eq!(metrics.total_tests, 0);
        assert_eq!(metrics.success_rate, 0.0);
        assert_eq!(overall_status(&[]), TestStatus::Skipped);
    }

    #[test]
    fn test_overall_status_required_semantics() {
        // A failed optional step does not fail the device.
        let mut optional = execution("D1", "b", TestStatus::Failed, 1.0);
        optional.step.required = false;
        let executions = vec![execution("D1", "a", TestStatus::Completed, 1.0), optional];
        assert_eq!(overall_status(&executions), TestStatus::Completed);

        // A skipped required step does.
        let executions = vec![
            execution("D1", "a", TestStatus::Completed, 1.0),
            execution("D1", "b", TestStatus::Skipped, 0.0),
        ];
        assert_eq!(overall_status(&executions), TestStatus::Failed);
    }

    #[test]
    fn test_collect_builds_suite_result() {
        let collector = ResultCollector::new();
        let mut store = TrendStore::new();
        let mut results = HashMap::new();
        results.insert(
            "D1".to_string(),
            vec![
                execution("D1", "a", TestStatus::Completed, 1.0),
                execution("D1", "b", TestStatus::Failed, 2.0),
            ],
        );

        let start = Utc::now() - chrono::Duration::seconds(10);
        let end = Utc::now();
        let suite = collector.collect(
            "suite",
            "desc",
            &results,
            start,
            end,
            environment_info(),
            &mut store,
        );

        assert_eq!(suite.aggregate_metrics.total_tests, 2);
        assert_eq!(suite.device_results["D1"].overall_status, TestStatus::Failed);
        assert!((suite.duration - 10.0).abs() < 0.5);
        // Timing and error artifacts synthesised.
        let kinds: Vec<&str> = suite.artifacts.iter().map(|a| a.kind.as_str()).collect();
        assert!(kinds.contains(&"timing"));
        assert!(kinds.contains(&"error"));
    }

    #[test]
    fn test_performance_artifact_from_response_bag() {
        let executions = vec![with_metrics(
            execution("D1", "a", TestStatus::Completed, 1.0),
            json!({"latency_us": 120.0}),
        )];
        let artifacts = collect_artifacts(&executions, "suite");
        assert!(artifacts.iter().any(|a| a.kind == "performance"));
    }

    #[test]
    fn test_trend_detection_needs_three_samples() {
        let mut store = TrendStore::new();
        let run = |store: &mut TrendStore| {
            let executions = vec![with_metrics(
                execution("D1", "a", TestStatus::Completed, 1.0),
                json!({"latency_us": 100.0}),
            )];
            analyze_trends(&executions, store)
        };
        assert!(run(&mut store).is_empty()); // 0 historical
        assert!(run(&mut store).is_empty()); // 1
        assert!(run(&mut store).is_empty()); // 2
        let trends = run(&mut store); // 3 historical samples now
        assert_eq!(trends.len(), 1);
        assert_eq!(trends[0].metric_name, "latency_us");
        assert!(!trends[0].regression_detected);
    }

    #[test]
    fn test_regression_detected_on_spike() {
        // Flat history, then a 2x spike: zero-variance fallback path.
        let historical = vec![100.0, 100.0, 100.0, 100.0];
        let (direction, regression, confidence) = detect_regression(&historical, 200.0);
        assert_eq!(direction, TrendDirection::Stable);
        assert!(regression);
        assert_eq!(confidence, 1.0);
    }

    #[test]
    fn test_regression_z_score_path() {
        let historical = vec![100.0, 101.0, 99.0, 100.0, 102.0, 98.0];
        let (_, regression, confidence) = detect_regression(&historical, 150.0);
        assert!(regression);
        assert!(confidence > 0.9);

        let (_, no_regression, _) = detect_regression(&historical, 100.5);
        assert!(!no_regression);
    }

    #[test]
    fn test_trend_direction_degrading_on_rising_slope() {
        let historical = vec![10.0, 30.0, 50.0, 70.0, 90.0, 110.0];
        let (direction, _, _) = detect_regression(&historical, 120.0);
        assert_eq!(direction, TrendDirection::Degrading);

        let falling: Vec<f64> = historical.iter().rev().cloned().collect();
        let (direction, _, _) = detect_regression(&falling, 5.0);
        assert_eq!(direction, TrendDirection::Improving);
    }

    #[test]
    fn test_trend_store_caps_history() {
        let mut store = TrendStore::new();
        let now = Utc::now();
        for i in 0..40 {
            store.record("metric", now, i as f64);
        }
        assert_eq!(store.sample_count("metric"), TREND_HISTORY_CAP);
    }

    #[test]
    fn test_failure_analysis_flags_common_failures() {
        let collector = ResultCollector::new();
        let mut store = TrendStore::new();
        let mut results = HashMap::new();
        for serial in ["D1", "D2", "D3"] {
            results.insert(
                serial.to_string(),
                vec![execution(serial, "flaky", TestStatus::Failed, 1.0)],
            );
        }
        let suite = collector.collect(
            "suite",
            "",
            &results,
            Utc::now(),
            Utc::now(),
            json!({}),
            &mut store,
        );

        let analysis = collector.failure_analysis(&suite);
        assert_eq!(analysis["total_failures"], 3);
        assert_eq!(analysis["common_failures"].as_array().unwrap().len(), 1);
        assert!(!analysis["recommendations"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_performance_analysis_ranks_slowest() {
        let collector = ResultCollector::new();
        let mut store = TrendStore::new();
        let mut results = HashMap::new();
        results.insert(
            "D1".to_string(),
            vec![
                execution("D1", "fast", TestStatus::Completed, 0.5),
                execution("D1", "slow", TestStatus::Completed, 5.0),
            ],
        );
        let suite = collector.collect(
            "suite",
            "",
            &results,
            Utc::now(),
            Utc::now(),
            json!({}),
            &mut store,
        );

        let analysis = collector.performance_analysis(&suite);
        let slowest = analysis["slowest_tests"].as_array().unwrap();
        assert_eq!(slowest[0][0], "slow");
    }

    #[test]
    fn test_median_and_std_dev() {
        assert_eq!(median(&[1.0, 3.0, 2.0]), 2.0);
        assert_eq!(median(&[1.0, 2.0, 3.0, 4.0]), 2.5);
        assert_eq!(std_dev(&[5.0]), 0.0);
        assert!((std_dev(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]) - 2.138).abs() < 0.01);
    }
}
