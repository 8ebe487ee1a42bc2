//! Test report generation in CI-friendly formats.
//!
//! One renderer per format; each takes a borrowed suite result and writes
//! to an output sink. The writer persists one file per format per run into
//! the output directory.

mod csv_report;
mod html;
mod json;
mod junit;
mod tap;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::Utc;
use tracing::{info, warn};

use crate::collector::SuiteResult;
use crate::error::Result;

pub use csv_report::render_csv;
pub use html::render_html;
pub use json::render_json;
pub use junit::render_junit;
pub use tap::render_tap;

/// Supported report output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportFormat {
    Json,
    JunitXml,
    Csv,
    Tap,
    Html,
}

impl ReportFormat {
    /// File extension for this format.
    pub fn extension(&self) -> &'static str {
        match self {
            ReportFormat::Json => "json",
            ReportFormat::JunitXml => "xml",
            ReportFormat::Csv => "csv",
            ReportFormat::Tap => "tap",
            ReportFormat::Html => "html",
        }
    }

    /// Filename infix for this format.
    fn infix(&self) -> &'static str {
        match self {
            ReportFormat::Json => "report",
            ReportFormat::JunitXml => "junit",
            ReportFormat::Csv => "data",
            ReportFormat::Tap => "tap",
            ReportFormat::Html => "report",
        }
    }
}

impl FromStr for ReportFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ReportFormat::Json),
            "junit" | "xml" => Ok(ReportFormat::JunitXml),
            "csv" => Ok(ReportFormat::Csv),
            "tap" => Ok(ReportFormat::Tap),
            "html" => Ok(ReportFormat::Html),
            other => Err(format!("unknown report format: {other}")),
        }
    }
}

/// Render a suite result in the given format to any sink.
pub fn render(format: ReportFormat, suite: &SuiteResult, sink: &mut dyn Write) -> Result<()> {
    match format {
        ReportFormat::Json => render_json(suite, sink),
        ReportFormat::JunitXml => render_junit(suite, sink),
        ReportFormat::Csv => render_csv(suite, sink),
        ReportFormat::Tap => render_tap(suite, sink),
        ReportFormat::Html => render_html(suite, sink),
    }
}

/// Writes report files into an output directory.
pub struct ReportWriter {
    output_dir: PathBuf,
}

impl ReportWriter {
    /// Create a writer rooted at `output_dir` (created if missing).
    pub fn new(output_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(output_dir)?;
        Ok(Self {
            output_dir: output_dir.to_path_buf(),
        })
    }

    /// Generate one file per requested format; returns the written paths.
    ///
    /// A failing renderer is logged and skipped so one bad format cannot
    /// sink the whole report pass.
    pub fn generate(&self, suite: &SuiteResult, formats: &[ReportFormat]) -> Vec<PathBuf> {
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let stem = sanitize_name(&suite.suite_name);
        let mut written = Vec::new();

        for format in formats {
            let filename = format!(
                "{stem}_{}_{timestamp}.{}",
                format.infix(),
                format.extension()
            );
            let path = self.output_dir.join(filename);
            match self.write_one(*format, suite, &path) {
                Ok(()) => {
                    info!("Generated {:?} report: {}", format, path.display());
                    written.push(path);
                }
                Err(e) => warn!("Failed to generate {:?} report: {e}", format),
            }
        }
        written
    }

    fn write_one(&self, format: ReportFormat, suite: &SuiteResult, path: &Path) -> Result<()> {
        let mut file = std::fs::File::create(path)?;
        render(format, suite, &mut file)?;
        file.flush()?;
        Ok(())
    }

    /// Persist suite artifacts as JSON files under `artifacts/`.
    pub fn save_artifacts(&self, suite: &SuiteResult) -> Result<Vec<PathBuf>> {
        let dir = self.output_dir.join("artifacts");
        std::fs::create_dir_all(&dir)?;
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();

        let mut paths = Vec::new();
        for artifact in &suite.artifacts {
            let path = dir.join(format!("{}_{timestamp}.json", sanitize_name(&artifact.name)));
            let payload = serde_json::json!({
                "artifact_info": {
                    "name": artifact.name,
                    "type": artifact.kind,
                    "timestamp": artifact.timestamp,
                    "size_bytes": artifact.size_bytes,
                    "metadata": artifact.metadata,
                },
                "content": artifact.content,
            });
            std::fs::write(&path, serde_json::to_string_pretty(&payload)?)?;
            paths.push(path);
        }
        Ok(paths)
    }
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Escape a string for XML text and attribute contexts.
pub(crate) fn xml_escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            other => escaped.push(other),
        }
    }
    escaped
}
