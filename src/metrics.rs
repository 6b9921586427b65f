use anyhow::Result;
use serde_json::json;
use std::fs::{File, OpenOptions};
use std::io::Write;

use crate::config::Config;

// ---------------------------------------------------------------------------
// Metrics sink
// ---------------------------------------------------------------------------

/// Fire-and-forget scalar sink: a run-level config snapshot at startup, then
/// key/value scalars per epoch, mirrored to stderr and (optionally) appended
/// to a JSONL file. Write failures after startup are reported and swallowed;
/// metrics never abort training.
pub struct MetricsLogger {
    file: Option<File>,
}

impl MetricsLogger {
    pub fn new(run: &str, cfg: &Config) -> Result<Self> {
        let file = match &cfg.metrics {
            Some(path) => Some(OpenOptions::new().create(true).append(true).open(path)?),
            None => None,
        };
        let mut logger = Self { file };
        let snapshot = json!({ "run": run, "config": cfg });
        eprintln!("[metrics] {snapshot}");
        logger.write_line(&snapshot.to_string());
        Ok(logger)
    }

    /// Sink with no file and no snapshot, for tests.
    pub fn disabled() -> Self {
        Self { file: None }
    }

    pub fn log(&mut self, epoch: usize, scalars: &[(&str, f64)]) {
        let mut obj = serde_json::Map::new();
        obj.insert("ep".into(), json!(epoch));
        for (key, value) in scalars {
            obj.insert((*key).into(), json!(value));
        }
        let line = serde_json::Value::Object(obj).to_string();
        eprintln!("[metrics] {line}");
        self.write_line(&line);
    }

    fn write_line(&mut self, line: &str) {
        if let Some(f) = &mut self.file {
            if let Err(e) = writeln!(f, "{line}") {
                eprintln!("[metrics] write failed (ignored): {e}");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jsonl_file_output() -> Result<()> {
        let path = std::env::temp_dir().join("byol_metrics_test.jsonl");
        let _ = std::fs::remove_file(&path);

        let mut cfg = Config::test();
        cfg.metrics = Some(path.to_string_lossy().into_owned());
        let mut logger = MetricsLogger::new("test-run", &cfg)?;
        logger.log(0, &[("loss", 1.5), ("acc", 0.25)]);
        logger.log(1, &[("loss", 1.2)]);
        drop(logger);

        let content = std::fs::read_to_string(&path)?;
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3, "snapshot + 2 scalar lines");

        let snapshot: serde_json::Value = serde_json::from_str(lines[0])?;
        assert_eq!(snapshot["run"], "test-run");
        assert_eq!(snapshot["config"]["dataset"], "blobs-tiny");

        let ep0: serde_json::Value = serde_json::from_str(lines[1])?;
        assert_eq!(ep0["ep"], 0);
        assert_eq!(ep0["loss"], 1.5);

        let _ = std::fs::remove_file(&path);
        Ok(())
    }

    #[test]
    fn test_disabled_sink_is_silent_noop() {
        let mut logger = MetricsLogger::disabled();
        logger.log(5, &[("loss", 0.1)]);
    }
}
