//! End-to-end sequencer scenarios against the scripted in-memory bus.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use hidtest::collector::{environment_info, ResultCollector, TrendStore};
use hidtest::frame::{ResponseStatus, TestKind};
use hidtest::monitor::{EventKind, RealTimeMonitor};
use hidtest::protocol::CommandClient;
use hidtest::registry::DeviceRegistry;
use hidtest::sequencer::{TestExecution, TestSequencer, TestStatus};
use hidtest::test_helpers::fixtures::{ConfigurationBuilder, TestStepBuilder};
use hidtest::test_helpers::mock_bus::{MockBus, Reply, ScriptedDevice};

struct Harness {
    bus: Arc<MockBus>,
    monitor: Arc<RealTimeMonitor>,
    sequencer: TestSequencer,
}

fn harness(devices: Vec<ScriptedDevice>) -> Harness {
    let bus = Arc::new(MockBus::new());
    for device in devices {
        bus.add_device(device);
    }
    let registry = Arc::new(DeviceRegistry::with_timing(
        bus.clone(),
        Duration::from_secs(1),
        Duration::from_millis(5),
    ));
    registry.discover();
    for serial in registry
        .discover()
        .iter()
        .map(|r| r.serial_number.clone())
        .collect::<Vec<_>>()
    {
        assert!(registry.connect(&serial), "failed to connect {serial}");
    }

    let monitor = Arc::new(RealTimeMonitor::new());
    let client = Arc::new(CommandClient::new(
        Arc::clone(&registry),
        Some(Arc::clone(&monitor)),
    ));
    let sequencer = TestSequencer::new(registry, client, Some(Arc::clone(&monitor)));
    Harness {
        bus,
        monitor,
        sequencer,
    }
}

fn statuses(executions: &[TestExecution]) -> Vec<TestStatus> {
    executions.iter().map(|e| e.status).collect()
}

fn collect_suite(
    results: &HashMap<String, Vec<TestExecution>>,
) -> hidtest::collector::SuiteResult {
    let mut trends = TrendStore::new();
    ResultCollector::new().collect(
        "scenario",
        "",
        results,
        Utc::now(),
        Utc::now(),
        environment_info(),
        &mut trends,
    )
}

/// S1: single device, two dependent steps, both succeed.
#[test]
fn two_dependent_steps_both_succeed() {
    let device = ScriptedDevice::connected("DEV001");
    let h = harness(vec![device]);

    let config = ConfigurationBuilder::new("s1")
        .step(
            TestStepBuilder::new("step_a")
                .test_type(TestKind::UsbCommunicationTest)
                .timeout(2.0)
                .build(),
        )
        .step(
            TestStepBuilder::new("step_b")
                .test_type(TestKind::PemfTimingValidation)
                .timeout(2.0)
                .depends_on(&["step_a"])
                .build(),
        )
        .build();

    let results = h.sequencer.execute(&config, None, None).unwrap();
    let executions = &results["DEV001"];
    assert_eq!(
        statuses(executions),
        vec![TestStatus::Completed, TestStatus::Completed]
    );
    assert!(executions.iter().all(|e| e.response.is_some()));

    let suite = collect_suite(&results);
    assert_eq!(suite.aggregate_metrics.total_tests, 2);
    assert_eq!(suite.aggregate_metrics.passed_tests, 2);
    assert_eq!(suite.aggregate_metrics.failed_tests, 0);
    assert_eq!(
        suite.device_results["DEV001"].overall_status,
        TestStatus::Completed
    );
}

/// S2: a required step fails; downstream steps cascade to skipped.
#[test]
fn required_failure_cascades_to_skipped() {
    let device = ScriptedDevice::connected("DEV001");
    device.script_test(
        TestKind::PemfTimingValidation,
        Reply::status(ResponseStatus::HardwareFault),
    );
    let h = harness(vec![device.clone()]);

    let config = ConfigurationBuilder::new("s2")
        .step(
            TestStepBuilder::new("step_a")
                .test_type(TestKind::PemfTimingValidation)
                .timeout(2.0)
                .build(),
        )
        .step(
            TestStepBuilder::new("step_b")
                .test_type(TestKind::BatteryAdcCalibration)
                .timeout(2.0)
                .depends_on(&["step_a"])
                .build(),
        )
        .step(
            TestStepBuilder::new("step_c")
                .test_type(TestKind::LedFunctionality)
                .timeout(2.0)
                .depends_on(&["step_b"])
                .build(),
        )
        .build();

    let results = h.sequencer.execute(&config, None, None).unwrap();
    let executions = &results["DEV001"];
    assert_eq!(
        statuses(executions),
        vec![TestStatus::Failed, TestStatus::Skipped, TestStatus::Skipped]
    );
    // The original error is preserved; downstream skips get the
    // standard cascade message.
    assert_eq!(
        executions[0].error_message.as_deref(),
        Some("Device returned error: ERROR_HARDWARE_FAULT")
    );
    for skipped in &executions[1..] {
        assert_eq!(
            skipped.error_message.as_deref(),
            Some("skipped due to required dependency failure")
        );
    }

    // Retry budget 0 means exactly one attempt reached the wire.
    assert_eq!(device.written_commands().len(), 1);

    let suite = collect_suite(&results);
    assert_eq!(suite.aggregate_metrics.passed_tests, 0);
    assert_eq!(suite.aggregate_metrics.failed_tests, 1);
    assert_eq!(suite.aggregate_metrics.skipped_tests, 2);
    assert_eq!(
        suite.device_results["DEV001"].overall_status,
        TestStatus::Failed
    );
}

/// S3: an optional step failure does not cascade.
#[test]
fn optional_failure_does_not_cascade() {
    let device = ScriptedDevice::connected("DEV001");
    device.script_test(
        TestKind::BatteryAdcCalibration,
        Reply::status(ResponseStatus::SystemBusy),
    );
    let h = harness(vec![device]);

    let config = ConfigurationBuilder::new("s3")
        .step(
            TestStepBuilder::new("step_a")
                .test_type(TestKind::UsbCommunicationTest)
                .timeout(2.0)
                .build(),
        )
        .step(
            TestStepBuilder::new("step_b")
                .test_type(TestKind::BatteryAdcCalibration)
                .timeout(2.0)
                .required(false)
                .build(),
        )
        .step(
            TestStepBuilder::new("step_c")
                .test_type(TestKind::LedFunctionality)
                .timeout(2.0)
                .depends_on(&["step_a"])
                .build(),
        )
        .build();

    let results = h.sequencer.execute(&config, None, None).unwrap();
    let executions = &results["DEV001"];
    assert_eq!(
        statuses(executions),
        vec![TestStatus::Completed, TestStatus::Failed, TestStatus::Completed]
    );

    let suite = collect_suite(&results);
    assert_eq!(suite.aggregate_metrics.passed_tests, 2);
    assert_eq!(suite.aggregate_metrics.failed_tests, 1);
    // No required failure: the device run counts as completed.
    assert_eq!(
        suite.device_results["DEV001"].overall_status,
        TestStatus::Completed
    );
}

/// S4: a timeout with one retry budget succeeds on the second attempt.
#[test]
fn timeout_then_retry_succeeds() {
    let device = ScriptedDevice::connected("DEV001");
    device.script_test(TestKind::LedFunctionality, Reply::Ignore);
    device.script_test(TestKind::LedFunctionality, Reply::success());
    let h = harness(vec![device.clone()]);

    let config = ConfigurationBuilder::new("s4")
        .step(
            TestStepBuilder::new("step_a")
                .test_type(TestKind::LedFunctionality)
                .timeout(0.5)
                .retry_count(1)
                .build(),
        )
        .global_timeout(20.0)
        .build();

    let results = h.sequencer.execute(&config, None, None).unwrap();
    let executions = &results["DEV001"];
    assert_eq!(executions[0].status, TestStatus::Completed);
    assert_eq!(executions[0].retry_attempt, 1);

    // Exactly two sends observed, on the wire and in the monitoring log.
    assert_eq!(device.written_commands().len(), 2);
    let sent_events = h
        .monitor
        .event_history(Some("DEV001"), Some(&[EventKind::CommandSent]), 100);
    assert_eq!(sent_events.len(), 2);
}

/// Retry budget exhaustion preserves the last observed terminal state.
#[test]
fn retry_budget_exhaustion_keeps_timeout() {
    let device = ScriptedDevice::connected("DEV001");
    device.script_test(TestKind::LedFunctionality, Reply::Ignore);
    device.script_test(TestKind::LedFunctionality, Reply::Ignore);
    let h = harness(vec![device.clone()]);

    let config = ConfigurationBuilder::new("retry-exhaustion")
        .step(
            TestStepBuilder::new("step_a")
                .test_type(TestKind::LedFunctionality)
                .timeout(0.4)
                .retry_count(1)
                .build(),
        )
        .global_timeout(20.0)
        .build();

    let results = h.sequencer.execute(&config, None, None).unwrap();
    let execution = &results["DEV001"][0];
    assert_eq!(execution.status, TestStatus::Timeout);
    assert_eq!(execution.retry_attempt, 1);
    assert_eq!(
        execution.error_message.as_deref(),
        Some("No response received (timeout)")
    );
    assert_eq!(device.written_commands().len(), 2);
}

/// A required timeout cascades exactly like a required failure.
#[test]
fn required_timeout_cascades() {
    let device = ScriptedDevice::connected("DEV001");
    device.script_test(TestKind::SystemStressTest, Reply::Ignore);
    let h = harness(vec![device]);

    let config = ConfigurationBuilder::new("timeout-cascade")
        .step(
            TestStepBuilder::new("step_a")
                .test_type(TestKind::SystemStressTest)
                .timeout(0.3)
                .build(),
        )
        .step(
            TestStepBuilder::new("step_b")
                .test_type(TestKind::LedFunctionality)
                .timeout(1.0)
                .build(),
        )
        .build();

    let results = h.sequencer.execute(&config, None, None).unwrap();
    assert_eq!(
        statuses(&results["DEV001"]),
        vec![TestStatus::Timeout, TestStatus::Skipped]
    );
}

/// Global deadline of zero transitions every execution to timeout.
#[test]
fn zero_global_deadline_times_out_everything() {
    let h = harness(vec![
        ScriptedDevice::connected("DEV001"),
        ScriptedDevice::connected("DEV002"),
    ]);

    let config = ConfigurationBuilder::new("deadline-zero")
        .step(TestStepBuilder::new("step_a").build())
        .step(TestStepBuilder::new("step_b").build())
        .build();

    let results = h
        .sequencer
        .execute(&config, None, Some(Duration::ZERO))
        .unwrap();

    // Number of executions equals devices x steps, all timed out.
    assert_eq!(results.len(), 2);
    for executions in results.values() {
        assert_eq!(executions.len(), 2);
        for execution in executions {
            assert_eq!(execution.status, TestStatus::Timeout);
            assert_eq!(
                execution.error_message.as_deref(),
                Some("global/device timeout reached")
            );
        }
    }
}

/// Zero steps: empty execution lists, device status skipped.
#[test]
fn zero_steps_yields_skipped_device() {
    let h = harness(vec![ScriptedDevice::connected("DEV001")]);
    let config = ConfigurationBuilder::new("empty").build();

    let results = h.sequencer.execute(&config, None, None).unwrap();
    assert!(results["DEV001"].is_empty());

    let suite = collect_suite(&results);
    assert_eq!(suite.aggregate_metrics.total_tests, 0);
    assert_eq!(
        suite.device_results["DEV001"].overall_status,
        TestStatus::Skipped
    );
}

/// A step depending on a later step is skipped, not deadlocked.
#[test]
fn forward_dependency_is_skipped() {
    let h = harness(vec![ScriptedDevice::connected("DEV001")]);

    let config = ConfigurationBuilder::new("forward-dep")
        .step(
            TestStepBuilder::new("step_a")
                .required(false)
                .depends_on(&["step_b"])
                .timeout(1.0)
                .build(),
        )
        .step(TestStepBuilder::new("step_b").timeout(1.0).build())
        .build();

    let results = h.sequencer.execute(&config, None, None).unwrap();
    assert_eq!(
        statuses(&results["DEV001"]),
        vec![TestStatus::Skipped, TestStatus::Completed]
    );
}

/// Parallel mode: independent devices, one failing, one passing.
#[test]
fn parallel_devices_are_independent() {
    let good = ScriptedDevice::connected("DEV-A");
    let bad = ScriptedDevice::connected("DEV-B");
    bad.script_test(
        TestKind::UsbCommunicationTest,
        Reply::status(ResponseStatus::HardwareFault),
    );
    let h = harness(vec![good, bad]);

    let config = ConfigurationBuilder::new("parallel")
        .step(
            TestStepBuilder::new("comm")
                .test_type(TestKind::UsbCommunicationTest)
                .timeout(2.0)
                .build(),
        )
        .step(
            TestStepBuilder::new("led")
                .test_type(TestKind::LedFunctionality)
                .timeout(2.0)
                .build(),
        )
        .parallel(2)
        .build();

    let results = h.sequencer.execute(&config, None, None).unwrap();
    assert_eq!(
        statuses(&results["DEV-A"]),
        vec![TestStatus::Completed, TestStatus::Completed]
    );
    // Failure on DEV-B does not affect DEV-A.
    assert_eq!(
        statuses(&results["DEV-B"]),
        vec![TestStatus::Failed, TestStatus::Skipped]
    );

    let suite = collect_suite(&results);
    assert_eq!(suite.device_results["DEV-A"].overall_status, TestStatus::Completed);
    assert_eq!(suite.device_results["DEV-B"].overall_status, TestStatus::Failed);
}

/// Cancellation: the running execution fails, the rest are skipped.
#[test]
fn cancellation_stops_the_device() {
    let device = ScriptedDevice::connected("DEV001");
    device.script_test(TestKind::SystemStressTest, Reply::Ignore);
    let h = harness(vec![device]);

    let config = ConfigurationBuilder::new("cancel")
        .step(
            TestStepBuilder::new("step_a")
                .test_type(TestKind::SystemStressTest)
                .timeout(3.0)
                .required(false)
                .build(),
        )
        .step(TestStepBuilder::new("step_b").timeout(1.0).build())
        .build();

    let sequencer = Arc::new(h.sequencer);
    let canceller = {
        let sequencer = Arc::clone(&sequencer);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            assert!(sequencer.cancel("DEV001"));
        })
    };

    let results = sequencer.execute(&config, None, None).unwrap();
    canceller.join().unwrap();

    let executions = &results["DEV001"];
    assert_eq!(executions[0].status, TestStatus::Failed);
    assert_eq!(
        executions[0].error_message.as_deref(),
        Some("execution cancelled")
    );
    assert_eq!(executions[1].status, TestStatus::Skipped);
    let _ = &h.bus;
}

/// Running the same configuration twice yields the same terminal states.
#[test]
fn rerun_is_deterministic_in_terminal_states() {
    let device = ScriptedDevice::connected("DEV001");
    // One busy reply per run for the battery step.
    device.script_test(
        TestKind::BatteryAdcCalibration,
        Reply::status(ResponseStatus::SystemBusy),
    );
    device.script_test(
        TestKind::BatteryAdcCalibration,
        Reply::status(ResponseStatus::SystemBusy),
    );
    let h = harness(vec![device]);

    let config = ConfigurationBuilder::new("rerun")
        .step(
            TestStepBuilder::new("comm")
                .test_type(TestKind::UsbCommunicationTest)
                .timeout(2.0)
                .build(),
        )
        .step(
            TestStepBuilder::new("battery")
                .test_type(TestKind::BatteryAdcCalibration)
                .timeout(2.0)
                .required(false)
                .build(),
        )
        .build();

    let first = h.sequencer.execute(&config, None, None).unwrap();
    let second = h.sequencer.execute(&config, None, None).unwrap();
    assert_eq!(statuses(&first["DEV001"]), statuses(&second["DEV001"]));
}

/// Setup and teardown batches reach the device around the main sequence.
#[test]
fn setup_and_teardown_commands_are_sent() {
    let device = ScriptedDevice::connected("DEV001");
    let h = harness(vec![device.clone()]);

    let mut config = ConfigurationBuilder::new("setup-teardown")
        .step(
            TestStepBuilder::new("comm")
                .test_type(TestKind::UsbCommunicationTest)
                .timeout(2.0)
                .build(),
        )
        .build();
    config.setup_commands = vec![hidtest::sequencer::CommandSpec {
        kind: hidtest::frame::CommandKind::SystemStateQuery,
        payload: json!({ "query_type": "system_health" }),
    }];
    config.teardown_commands = vec![hidtest::sequencer::CommandSpec {
        kind: hidtest::frame::CommandKind::ConfigurationQuery,
        payload: json!({}),
    }];

    let results = h.sequencer.execute(&config, None, None).unwrap();
    assert_eq!(results["DEV001"][0].status, TestStatus::Completed);

    let kinds: Vec<_> = device
        .written_commands()
        .iter()
        .map(|c| c.kind)
        .collect();
    assert_eq!(
        kinds,
        vec![
            hidtest::frame::CommandKind::SystemStateQuery,
            hidtest::frame::CommandKind::ExecuteTest,
            hidtest::frame::CommandKind::ConfigurationQuery,
        ]
    );
}
