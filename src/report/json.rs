//! JSON report rendering.

use std::io::Write;

use chrono::Utc;
use serde_json::json;

use crate::collector::{ResultCollector, SuiteResult};
use crate::error::Result;

/// Render the machine-readable JSON report.
///
/// Shape: `{metadata, summary, device_results, performance_trends,
/// artifacts, environment_info, analysis}`.
pub fn render_json(suite: &SuiteResult, sink: &mut dyn Write) -> Result<()> {
    let collector = ResultCollector::new();

    let mut device_results = serde_json::Map::new();
    for (serial, device_result) in &suite.device_results {
        let executions: Vec<serde_json::Value> = device_result
            .executions
            .iter()
            .map(|execution| {
                let mut entry = json!({
                    "test_name": execution.step.name,
                    "test_type": execution.step.test_type.name(),
                    "status": execution.status.as_str(),
                    "start_time": execution.start_time,
                    "end_time": execution.end_time,
                    "duration": execution.duration_secs(),
                    "retry_attempt": execution.retry_attempt,
                    "error_message": execution.error_message,
                    "parameters": execution.step.parameters,
                    "required": execution.step.required,
                    "timeout": execution.step.timeout,
                });
                if let Some(response) = &execution.response {
                    entry["response"] = json!({
                        "status": response.status.name(),
                        "data": response.data,
                        "timestamp": response.timestamp,
                    });
                }
                entry
            })
            .collect();

        device_results.insert(
            serial.clone(),
            json!({
                "device_serial": serial,
                "overall_status": device_result.overall_status.as_str(),
                "metrics": device_result.metrics,
                "start_time": device_result.start_time,
                "end_time": device_result.end_time,
                "executions": executions,
            }),
        );
    }

    let report = json!({
        "metadata": {
            "report_version": "1.0",
            "generated_at": Utc::now(),
            "generator": "hidtest",
            "suite_name": suite.suite_name,
        },
        "summary": {
            "suite_name": suite.suite_name,
            "description": suite.description,
            "start_time": suite.start_time,
            "end_time": suite.end_time,
            "duration": suite.duration,
            "total_devices": suite.device_results.len(),
            "aggregate_metrics": suite.aggregate_metrics,
        },
        "device_results": device_results,
        "performance_trends": suite.performance_trends,
        "artifacts": suite.artifacts,
        "environment_info": suite.environment_info,
        "analysis": {
            "failure_analysis": collector.failure_analysis(suite),
            "performance_analysis": collector.performance_analysis(suite),
            "regression_report": collector.regression_report(suite),
        },
    });

    sink.write_all(serde_json::to_string_pretty(&report)?.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::fixtures::sample_suite_result;

    #[test]
    fn test_json_report_shape() {
        let suite = sample_suite_result();
        let mut buffer = Vec::new();
        render_json(&suite, &mut buffer).unwrap();

        let parsed: serde_json::Value = serde_json::from_slice(&buffer).unwrap();
        for key in [
            "metadata",
            "summary",
            "device_results",
            "performance_trends",
            "artifacts",
            "environment_info",
            "analysis",
        ] {
            assert!(parsed.get(key).is_some(), "missing key {key}");
        }
        assert_eq!(parsed["summary"]["aggregate_metrics"]["total_tests"], 3);
        assert_eq!(
            parsed["device_results"]["DEV001"]["executions"]
                .as_array()
                .unwrap()
                .len(),
            3
        );
    }
}
