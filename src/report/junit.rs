//! JUnit XML report rendering for CI systems.

use std::io::Write;

use crate::collector::SuiteResult;
use crate::error::Result;
use crate::sequencer::TestStatus;

use super::xml_escape;

/// Render a JUnit XML report: `testsuites` with one `testsuite` per
/// device, `testcase` children carrying failure/error/skipped states and
/// time attributes in seconds.
pub fn render_junit(suite: &SuiteResult, sink: &mut dyn Write) -> Result<()> {
    writeln!(sink, r#"<?xml version="1.0" encoding="UTF-8"?>"#)?;
    writeln!(
        sink,
        r#"<testsuites name="{}" tests="{}" failures="{}" skipped="{}" time="{:.3}" timestamp="{}">"#,
        xml_escape(&suite.suite_name),
        suite.aggregate_metrics.total_tests,
        suite.aggregate_metrics.failed_tests,
        suite.aggregate_metrics.skipped_tests,
        suite.duration,
        suite.start_time.format("%Y-%m-%dT%H:%M:%S"),
    )?;

    for (serial, device_result) in &suite.device_results {
        let device_time =
            (device_result.end_time - device_result.start_time).num_milliseconds() as f64 / 1000.0;
        writeln!(
            sink,
            r#"  <testsuite name="{}.{}" tests="{}" failures="{}" skipped="{}" time="{:.3}" timestamp="{}">"#,
            xml_escape(&suite.suite_name),
            xml_escape(serial),
            device_result.metrics.total_tests,
            device_result.metrics.failed_tests,
            device_result.metrics.skipped_tests,
            device_time,
            device_result.start_time.format("%Y-%m-%dT%H:%M:%S"),
        )?;
        writeln!(sink, "    <properties>")?;
        writeln!(
            sink,
            r#"      <property name="device_serial" value="{}"/>"#,
            xml_escape(serial)
        )?;
        writeln!(sink, "    </properties>")?;

        for execution in &device_result.executions {
            write!(
                sink,
                r#"    <testcase classname="{}.{}" name="{}" time="{:.3}""#,
                xml_escape(&suite.suite_name),
                xml_escape(serial),
                xml_escape(&execution.step.name),
                execution.duration_secs().unwrap_or(0.0),
            )?;

            let error_message = execution.error_message.as_deref();
            match execution.status {
                TestStatus::Failed => {
                    writeln!(sink, ">")?;
                    let message = error_message.unwrap_or("Test failed");
                    writeln!(
                        sink,
                        r#"      <failure message="{}" type="TestFailure">{}</failure>"#,
                        xml_escape(message),
                        xml_escape(error_message.unwrap_or("No error details available")),
                    )?;
                    write_system_out(sink, execution)?;
                    writeln!(sink, "    </testcase>")?;
                }
                TestStatus::Timeout => {
                    writeln!(sink, ">")?;
                    writeln!(
                        sink,
                        r#"      <error message="Test timeout" type="TestTimeout">Test execution timed out</error>"#
                    )?;
                    write_system_out(sink, execution)?;
                    writeln!(sink, "    </testcase>")?;
                }
                TestStatus::Skipped => {
                    writeln!(sink, ">")?;
                    writeln!(sink, r#"      <skipped message="Test was skipped"/>"#)?;
                    writeln!(sink, "    </testcase>")?;
                }
                _ => {
                    if has_system_out(execution) {
                        writeln!(sink, ">")?;
                        write_system_out(sink, execution)?;
                        writeln!(sink, "    </testcase>")?;
                    } else {
                        writeln!(sink, "/>")?;
                    }
                }
            }
        }
        writeln!(sink, "  </testsuite>")?;
    }
    writeln!(sink, "</testsuites>")?;
    Ok(())
}

fn has_system_out(execution: &crate::sequencer::TestExecution) -> bool {
    !execution.step.parameters.is_null()
        && execution.step.parameters.as_object().map(|m| !m.is_empty()).unwrap_or(true)
        || execution.response.is_some()
}

fn write_system_out(
    sink: &mut dyn Write,
    execution: &crate::sequencer::TestExecution,
) -> Result<()> {
    if !has_system_out(execution) {
        return Ok(());
    }
    let output = serde_json::json!({
        "parameters": execution.step.parameters,
        "response_data": execution.response.as_ref().map(|r| &r.data),
    });
    writeln!(
        sink,
        "      <system-out>{}</system-out>",
        xml_escape(&serde_json::to_string_pretty(&output)?)
    )?;
    Ok(())
}
