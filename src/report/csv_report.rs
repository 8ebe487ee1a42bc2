//! CSV report rendering for data analysis.

use std::io::Write;

use crate::collector::SuiteResult;
use crate::error::Result;

/// Render one CSV row per execution.
pub fn render_csv(suite: &SuiteResult, sink: &mut dyn Write) -> Result<()> {
    let mut writer = csv::Writer::from_writer(sink);
    writer.write_record([
        "suite_name",
        "device_serial",
        "test_name",
        "test_type",
        "status",
        "duration",
        "start_time",
        "end_time",
        "retry_attempt",
        "error_message",
        "required",
        "timeout",
        "parameters",
    ])?;

    for (serial, device_result) in &suite.device_results {
        for execution in &device_result.executions {
            let record = [
                suite.suite_name.clone(),
                serial.clone(),
                execution.step.name.clone(),
                execution.step.test_type.name().to_string(),
                execution.status.as_str().to_string(),
                execution
                    .duration_secs()
                    .map(|d| format!("{d:.3}"))
                    .unwrap_or_default(),
                execution
                    .start_time
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default(),
                execution
                    .end_time
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default(),
                execution.retry_attempt.to_string(),
                execution
                    .error_message
                    .clone()
                    .unwrap_or_default(),
                execution.step.required.to_string(),
                execution.step.timeout.to_string(),
                execution.step.parameters.to_string(),
            ];
            writer.write_record(&record)?;
        }
    }

    writer.flush()?;
    Ok(())
}
