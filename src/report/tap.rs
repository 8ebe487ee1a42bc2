//! TAP (Test Anything Protocol) v13 report rendering.

use std::io::Write;

use crate::collector::SuiteResult;
use crate::error::Result;
use crate::sequencer::TestStatus;

/// Render a TAP version 13 stream: plan line, one `ok`/`not ok` line per
/// execution, `# SKIP` directives, and a YAMLish diagnostic block for each
/// failure.
pub fn render_tap(suite: &SuiteResult, sink: &mut dyn Write) -> Result<()> {
    writeln!(sink, "TAP version 13")?;
    writeln!(sink, "1..{}", suite.aggregate_metrics.total_tests)?;

    let mut test_number = 0usize;
    for (serial, device_result) in &suite.device_results {
        for execution in &device_result.executions {
            test_number += 1;
            let test_name = format!("{serial}.{}", execution.step.name);

            match execution.status {
                TestStatus::Completed => {
                    writeln!(sink, "ok {test_number} - {test_name}")?;
                }
                TestStatus::Skipped => {
                    writeln!(sink, "ok {test_number} - {test_name} # SKIP")?;
                }
                _ => {
                    writeln!(sink, "not ok {test_number} - {test_name}")?;
                    if let Some(message) = &execution.error_message {
                        writeln!(sink, "  ---")?;
                        writeln!(sink, "  message: {message}")?;
                        writeln!(sink, "  severity: fail")?;
                        writeln!(sink, "  ---")?;
                    }
                }
            }
        }
    }
    Ok(())
}
