//! Append-only JSON-lines log of ingest and ask operations.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum MetricEvent {
    Ingest {
        doc_id: String,
        chunks: usize,
        latency_ms: u64,
    },
    Ask {
        question: String,
        contexts: usize,
        latency_ms: u64,
    },
}

#[derive(Serialize)]
struct Record<'a> {
    #[serde(flatten)]
    event: &'a MetricEvent,
    timestamp: DateTime<Utc>,
}

pub struct MetricsLog {
    path: Option<PathBuf>,
    lock: Mutex<()>,
}

impl MetricsLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            lock: Mutex::new(()),
        }
    }

    /// A log that drops every event.
    pub fn disabled() -> Self {
        Self {
            path: None,
            lock: Mutex::new(()),
        }
    }

    /// Append one event. Write failures are logged and otherwise ignored.
    pub fn record(&self, event: MetricEvent) {
        let path = match self.path {
            Some(ref p) => p,
            None => return,
        };
        let line = match serde_json::to_string(&Record {
            event: &event,
            timestamp: Utc::now(),
        }) {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, "failed to serialize metric");
                return;
            }
        };

        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let result = (|| -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut f = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            writeln!(f, "{}", line)
        })();
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "failed to append metric");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_appended_as_json_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let log = MetricsLog::new(tmp.path().join("metrics.jsonl"));
        log.record(MetricEvent::Ingest {
            doc_id: "d1".into(),
            chunks: 3,
            latency_ms: 12,
        });
        log.record(MetricEvent::Ask {
            question: "why?".into(),
            contexts: 2,
            latency_ms: 40,
        });

        let content = std::fs::read_to_string(tmp.path().join("metrics.jsonl")).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "ingest");
        assert_eq!(lines[0]["doc_id"], "d1");
        assert_eq!(lines[0]["chunks"], 3);
        assert!(lines[0]["timestamp"].is_string());
        assert_eq!(lines[1]["event"], "ask");
        assert_eq!(lines[1]["contexts"], 2);
    }

    #[test]
    fn disabled_log_writes_nothing() {
        MetricsLog::disabled().record(MetricEvent::Ingest {
            doc_id: "d".into(),
            chunks: 0,
            latency_ms: 0,
        });
    }
}
