//! Self-contained HTML summary report.

use std::io::Write;

use crate::collector::SuiteResult;
use crate::error::Result;
use crate::sequencer::TestStatus;

use super::xml_escape;

/// Render a standalone HTML page: summary cards, performance trends, and
/// per-device execution tables.
pub fn render_html(suite: &SuiteResult, sink: &mut dyn Write) -> Result<()> {
    let metrics = &suite.aggregate_metrics;
    let passed_devices = suite
        .device_results
        .values()
        .filter(|r| r.overall_status == TestStatus::Completed)
        .count();

    let rate_class = if metrics.success_rate >= 90.0 {
        "success"
    } else if metrics.success_rate >= 70.0 {
        "warning"
    } else {
        "failure"
    };

    writeln!(
        sink,
        r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="UTF-8">
  <meta name="viewport" content="width=device-width, initial-scale=1.0">
  <title>{title} - Test Report</title>
  <style>
    body {{ font-family: 'Segoe UI', Tahoma, Geneva, Verdana, sans-serif; margin: 0; padding: 20px; background-color: #f5f5f5; }}
    .container {{ max-width: 1100px; margin: 0 auto; background: white; border-radius: 8px; box-shadow: 0 2px 10px rgba(0,0,0,0.1); overflow: hidden; }}
    .header {{ background: linear-gradient(135deg, #667eea 0%, #764ba2 100%); color: white; padding: 30px; text-align: center; }}
    .header h1 {{ margin: 0; font-weight: 300; }}
    .summary {{ display: grid; grid-template-columns: repeat(auto-fit, minmax(160px, 1fr)); gap: 16px; padding: 24px; background: #f8f9fa; }}
    .card {{ background: white; padding: 16px; border-radius: 8px; text-align: center; box-shadow: 0 2px 4px rgba(0,0,0,0.1); }}
    .card h3 {{ margin: 0 0 8px 0; color: #495057; font-size: 0.8em; text-transform: uppercase; letter-spacing: 1px; }}
    .card .value {{ font-size: 1.8em; font-weight: bold; margin: 0; }}
    .success {{ color: #28a745; }}
    .failure {{ color: #dc3545; }}
    .warning {{ color: #ffc107; }}
    .info {{ color: #17a2b8; }}
    .section {{ padding: 24px; border-bottom: 1px solid #e9ecef; }}
    .section h2 {{ margin: 0 0 16px 0; color: #495057; border-bottom: 2px solid #667eea; padding-bottom: 8px; }}
    table {{ width: 100%; border-collapse: collapse; }}
    th, td {{ text-align: left; padding: 8px; border-bottom: 1px solid #f1f3f4; }}
    .badge {{ padding: 3px 8px; border-radius: 4px; font-size: 0.8em; font-weight: bold; text-transform: uppercase; }}
    .badge-completed {{ background: #d4edda; color: #155724; }}
    .badge-failed {{ background: #f8d7da; color: #721c24; }}
    .badge-timeout {{ background: #fff3cd; color: #856404; }}
    .badge-skipped {{ background: #e2e3e5; color: #383d41; }}
    .regression {{ background: #f8d7da; border: 1px solid #f5c6cb; color: #721c24; padding: 12px; border-radius: 8px; margin-bottom: 12px; }}
    .footer {{ text-align: center; padding: 16px; color: #6c757d; font-size: 0.9em; }}
  </style>
</head>
<body>
  <div class="container">
    <div class="header">
      <h1>{title}</h1>
      <p>{description}</p>
      <p>Generated on {generated}</p>
    </div>
    <div class="summary">
      <div class="card"><h3>Total Tests</h3><p class="value info">{total}</p></div>
      <div class="card"><h3>Passed</h3><p class="value success">{passed}</p></div>
      <div class="card"><h3>Failed</h3><p class="value failure">{failed}</p></div>
      <div class="card"><h3>Success Rate</h3><p class="value {rate_class}">{rate:.1}%</p></div>
      <div class="card"><h3>Duration</h3><p class="value info">{duration:.1}s</p></div>
      <div class="card"><h3>Devices</h3><p class="value info">{passed_devices}/{devices}</p></div>
    </div>"#,
        title = xml_escape(&suite.suite_name),
        description = xml_escape(&suite.description),
        generated = suite.end_time.format("%Y-%m-%d %H:%M:%S"),
        total = metrics.total_tests,
        passed = metrics.passed_tests,
        failed = metrics.failed_tests,
        rate_class = rate_class,
        rate = metrics.success_rate,
        duration = suite.duration,
        passed_devices = passed_devices,
        devices = suite.device_results.len(),
    )?;

    writeln!(sink, r#"    <div class="section"><h2>Performance Trends</h2>"#)?;
    if suite.performance_trends.is_empty() {
        writeln!(sink, "      <p>No performance trend data available.</p>")?;
    } else {
        let regressions = suite
            .performance_trends
            .iter()
            .filter(|t| t.regression_detected)
            .count();
        if regressions > 0 {
            writeln!(
                sink,
                r#"      <div class="regression"><strong>Performance regression detected!</strong> {regressions} metric(s) show potential regression.</div>"#
            )?;
        }
        writeln!(
            sink,
            "      <table><tr><th>Metric</th><th>Current</th><th>Trend</th><th>Status</th><th>Confidence</th></tr>"
        )?;
        for trend in &suite.performance_trends {
            writeln!(
                sink,
                r#"      <tr><td>{}</td><td>{:.3}</td><td>{}</td><td><span class="badge badge-{}">{}</span></td><td>{:.1}%</td></tr>"#,
                xml_escape(&trend.metric_name),
                trend.current_value,
                trend.trend_direction.as_str(),
                if trend.regression_detected { "failed" } else { "completed" },
                if trend.regression_detected { "REGRESSION" } else { "OK" },
                trend.confidence_level * 100.0,
            )?;
        }
        writeln!(sink, "      </table>")?;
    }
    writeln!(sink, "    </div>")?;

    writeln!(sink, r#"    <div class="section"><h2>Device Results</h2>"#)?;
    for (serial, device_result) in &suite.device_results {
        let status_class = if device_result.overall_status == TestStatus::Completed {
            "success"
        } else {
            "failure"
        };
        writeln!(
            sink,
            r#"      <h3>{} <span class="{}">{}</span></h3>
      <table><tr><th>Test</th><th>Status</th><th>Duration</th><th>Error</th></tr>"#,
            xml_escape(serial),
            status_class,
            device_result.overall_status.as_str().to_uppercase(),
        )?;
        for execution in &device_result.executions {
            writeln!(
                sink,
                r#"      <tr><td>{}</td><td><span class="badge badge-{}">{}</span></td><td>{}</td><td>{}</td></tr>"#,
                xml_escape(&execution.step.name),
                badge_class(execution.status),
                execution.status.as_str(),
                execution
                    .duration_secs()
                    .map(|d| format!("{d:.2}s"))
                    .unwrap_or_else(|| "N/A".to_string()),
                xml_escape(execution.error_message.as_deref().unwrap_or("")),
            )?;
        }
        writeln!(sink, "      </table>")?;
    }
    writeln!(sink, "    </div>")?;

    writeln!(
        sink,
        r#"    <div class="footer"><p>Report generated by hidtest</p></div>
  </div>
</body>
</html>"#
    )?;
    Ok(())
}

fn badge_class(status: TestStatus) -> &'static str {
    match status {
        TestStatus::Completed => "completed",
        TestStatus::Failed => "failed",
        TestStatus::Timeout => "timeout",
        _ => "skipped",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::fixtures::sample_suite_result;

    #[test]
    fn test_html_renders_summary_and_devices() {
        let suite = sample_suite_result();
        let mut buffer = Vec::new();
        render_html(&suite, &mut buffer).unwrap();
        let html = String::from_utf8(buffer).unwrap();

        assert!(html.starts_with("<!DOCTYPE html>"));
        assert!(html.contains("sample_suite"));
        assert!(html.contains("DEV001"));
        assert!(html.contains("badge-failed"));
        assert!(html.contains("</html>"));
    }
}
