//! Append-only event sink.
//!
//! Single background task that owns all telemetry I/O: every EngineEvent
//! is serialized as one JSON line into `{dir}/{asset}/events.jsonl`.
//! Nothing here ever touches the hot path; producers hand events over a
//! channel and move on.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::Config;
use crate::types::EngineEvent;

struct JsonlWriter {
    out: BufWriter<File>,
    lines: u64,
}

impl JsonlWriter {
    fn open(path: &PathBuf) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            out: BufWriter::new(file),
            lines: 0,
        })
    }

    fn append(&mut self, event: &EngineEvent) {
        match serde_json::to_string(event) {
            Ok(line) => {
                if writeln!(self.out, "{}", line).is_ok() {
                    self.lines += 1;
                }
            }
            Err(e) => warn!(error = %e, "event serialization failed"),
        }
    }

    fn flush(&mut self) {
        self.out.flush().ok();
    }
}

/// Consume the event stream until every sender is dropped, flushing once
/// per 64 events and on significant events.
pub async fn event_writer(mut rx: mpsc::Receiver<EngineEvent>, config: Config) {
    let path = PathBuf::from(&config.event_log_dir)
        .join(config.asset.symbol())
        .join("events.jsonl");

    let mut writer = match JsonlWriter::open(&path) {
        Ok(w) => w,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "event log unavailable, telemetry disabled");
            while rx.recv().await.is_some() {}
            return;
        }
    };
    info!(path = %path.display(), "event log open");

    while let Some(event) = rx.recv().await {
        let significant = !matches!(event, EngineEvent::Snapshot { .. });
        writer.append(&event);
        if significant || writer.lines % 64 == 0 {
            writer.flush();
        }
    }

    writer.flush();
    info!(lines = writer.lines, "event log closed");
}
