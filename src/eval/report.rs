use std::{
    fmt, fs,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::HarnessError;

/// Outcome of one replayed turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnResult {
    /// `account:conversation:turn`
    #[serde(rename = "id")]
    pub composite_id: String,
    pub prompt: String,
    pub reply: String,
    #[serde(rename = "pass")]
    pub passed: bool,
    pub latency_ms: u64,
    #[serde(rename = "tokens")]
    pub token_count: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<String>,
}

pub fn composite_id(account: &str, conversation: &str, turn: u32) -> String {
    format!("{account}:{conversation}:{turn}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub passed: usize,
    pub total: usize,
}

impl Summary {
    pub fn all_passed(&self) -> bool {
        self.passed == self.total
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} passed", self.passed, self.total)
    }
}

/// All turn results of one run, in completion order.
#[derive(Debug, Clone)]
pub struct Report {
    pub timestamp: DateTime<Utc>,
    pub results: Vec<TurnResult>,
    /// Conversations cut short by the run deadline.
    pub cancelled_conversations: usize,
}

impl Report {
    pub fn new(results: Vec<TurnResult>) -> Self {
        Self {
            timestamp: Utc::now(),
            results,
            cancelled_conversations: 0,
        }
    }

    pub fn summary(&self) -> Summary {
        Summary {
            passed: self.results.iter().filter(|r| r.passed).count(),
            total: self.results.len(),
        }
    }

    pub fn failed(&self) -> impl Iterator<Item = &TurnResult> {
        self.results.iter().filter(|r| !r.passed)
    }
}

/// Destination for the finished report.
pub trait ReportSink {
    /// Persist `report` and return where it went.
    fn write(&self, report: &Report) -> Result<PathBuf, HarnessError>;
}

/// Writes the results as one pretty-printed JSON array named after the
/// report timestamp, e.g. `reports/2024-05-01T09-30-00.json`.
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    dir: PathBuf,
}

impl JsonFileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn target_path(&self, report: &Report) -> PathBuf {
        let stem = report.timestamp.format("%Y-%m-%dT%H-%M-%S").to_string();
        let mut path = self.dir.join(format!("{stem}.json"));
        let mut n = 1;
        while path.exists() {
            path = self.dir.join(format!("{stem}-{n}.json"));
            n += 1;
        }
        path
    }
}

fn write_error(path: &Path) -> impl FnOnce(std::io::Error) -> HarnessError + '_ {
    move |source| HarnessError::ReportWrite {
        path: path.to_path_buf(),
        source,
    }
}

impl ReportSink for JsonFileSink {
    fn write(&self, report: &Report) -> Result<PathBuf, HarnessError> {
        fs::create_dir_all(&self.dir).map_err(write_error(&self.dir))?;

        let path = self.target_path(report);
        let file = fs::File::create(&path).map_err(write_error(&path))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &report.results)?;
        writer.write_all(b"\n").map_err(write_error(&path))?;
        writer.flush().map_err(write_error(&path))?;

        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::{composite_id, JsonFileSink, Report, ReportSink, TurnResult};

    fn result(turn: u32, passed: bool) -> TurnResult {
        TurnResult {
            composite_id: composite_id("acme", "c1", turn),
            prompt: format!("prompt {turn}"),
            reply: "reply".to_string(),
            passed,
            latency_ms: 12,
            token_count: 3,
            failures: Vec::new(),
        }
    }

    #[test]
    fn summary_counts_passes() {
        let report = Report::new(vec![result(1, true), result(2, false), result(3, true)]);
        let summary = report.summary();
        assert_eq!(summary.to_string(), "2/3 passed");
        assert!(!summary.all_passed());
        assert_eq!(report.failed().count(), 1);
        assert_eq!(Report::new(Vec::new()).summary().to_string(), "0/0 passed");
    }

    #[test]
    fn writes_timestamped_json_array() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonFileSink::new(dir.path().join("reports"));
        let mut report = Report::new(vec![result(1, true)]);
        report.timestamp = chrono::Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap();

        let path = sink.write(&report).expect("report written");
        assert_eq!(path.file_name().unwrap(), "2024-05-01T09-30-00.json");

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let rows = written.as_array().expect("top-level array");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], "acme:c1:1");
        assert_eq!(rows[0]["pass"], true);
        assert_eq!(rows[0]["latency_ms"], 12);
        assert_eq!(rows[0]["tokens"], 3);
        assert!(rows[0].get("failures").is_none());

        let second = sink.write(&report).unwrap();
        assert_eq!(second.file_name().unwrap(), "2024-05-01T09-30-00-1.json");
    }
}
