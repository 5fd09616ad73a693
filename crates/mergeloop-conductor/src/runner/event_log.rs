//! Structured event logging for loop and orchestration runs.
//!
//! Writes append-only JSONL to `.mergeloop/runs/{run}/events.jsonl`.

use crate::store::run_dir;
use mergeloop_core::{ProposalId, Severity};
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

// ── Event types ──

/// A run event. Serialized as tagged JSON (`"type": "loop_start"`, etc.).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    LoopStart {
        proposal: ProposalId,
        max_iterations: u32,
    },
    IterationStart {
        proposal: ProposalId,
        iteration: u32,
    },
    IssuesIdentified {
        proposal: ProposalId,
        iteration: u32,
        count: usize,
        out_of_scope: usize,
    },
    IdentifyFailed {
        proposal: ProposalId,
        iteration: u32,
        error: String,
    },
    IssuesValidated {
        proposal: ProposalId,
        iteration: u32,
        valid: usize,
        rejected: usize,
        duplicates: usize,
    },
    IssueReappeared {
        proposal: ProposalId,
        iteration: u32,
        fingerprint: String,
        severity: Severity,
        file: String,
    },
    FixApplied {
        proposal: ProposalId,
        iteration: u32,
        fingerprint: String,
        file: String,
    },
    FixUnfixable {
        proposal: ProposalId,
        iteration: u32,
        fingerprint: String,
        severity: Severity,
        reason: String,
        blocking: bool,
    },
    CommitPushed {
        proposal: ProposalId,
        iteration: u32,
        sha: String,
        files: usize,
    },
    TestsRun {
        proposal: ProposalId,
        iteration: u32,
        passed: u32,
        failed: u32,
        new_code_coverage: f64,
    },
    GateDecided {
        proposal: ProposalId,
        approved: bool,
        reason: String,
    },
    LoopFinished {
        proposal: ProposalId,
        result: String,
        reason: String,
        iterations: u32,
        duration_ms: u64,
    },
    ReviewPosted {
        proposal: ProposalId,
        potential: usize,
        valid: usize,
        reported: usize,
    },
    PlanComputed {
        proposals: usize,
        batches: Vec<Vec<ProposalId>>,
        excluded: Vec<ProposalId>,
    },
    ProposalStatus {
        proposal: ProposalId,
        from: String,
        to: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    MergeResult {
        proposal: ProposalId,
        status: String,
        reason: String,
        rebased: bool,
    },
    OrchestrationFinished {
        merged: usize,
        failed: usize,
        conflict: usize,
        duration_ms: u64,
    },
}

/// Wrapper that adds sequence number and timestamp to each event.
#[derive(Debug, Serialize)]
pub struct FullEvent {
    pub seq: u32,
    pub ts: String,
    #[serde(flatten)]
    pub event: Event,
}

// ── EventLogger ──

/// Append-only JSONL event writer, shared by concurrent loops of one run.
pub struct EventLogger {
    jsonl_path: Option<PathBuf>,
    stdout_json: bool,
    seq: Mutex<u32>,
}

impl EventLogger {
    /// Path: `{workdir}/.mergeloop/runs/{run_name}/events.jsonl`.
    pub fn new(workdir: &Path, run_name: &str) -> Self {
        Self {
            jsonl_path: Some(run_dir(workdir, run_name).join("events.jsonl")),
            stdout_json: false,
            seq: Mutex::new(0),
        }
    }

    /// Logger that writes nothing.
    pub fn disabled() -> Self {
        Self {
            jsonl_path: None,
            stdout_json: false,
            seq: Mutex::new(0),
        }
    }

    /// Also print each event as one JSON line on stdout.
    pub fn with_stdout_json(mut self, enabled: bool) -> Self {
        self.stdout_json = enabled;
        self
    }

    pub fn jsonl_path(&self) -> Option<&Path> {
        self.jsonl_path.as_deref()
    }

    /// Record an event. Best-effort: silently ignores write failures.
    pub fn record(&self, event: Event) {
        let mut seq = self.seq.lock().unwrap_or_else(|e| e.into_inner());
        let full = FullEvent {
            seq: *seq,
            ts: now_rfc3339(),
            event,
        };
        *seq += 1;

        if let Ok(line) = serde_json::to_string(&full) {
            if self.stdout_json {
                println!("{line}");
            }
            if let Some(path) = &self.jsonl_path {
                let _ = append_line(path, &line);
            }
        }
    }
}

/// Append a single line to a file, creating parent dirs if needed.
fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")
}

// ── Run naming ──

/// Fixed namespace UUID for run ids.
const RUN_NS: Uuid = Uuid::from_bytes([
    0x3e, 0x70, 0x91, 0x0a, 0x00, 0x00, 0x40, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01,
]);

/// Deterministic run id per kind, scope and start time.
pub fn run_id(kind: &str, scope: &str, started: time::OffsetDateTime) -> Uuid {
    Uuid::new_v5(
        &RUN_NS,
        format!("{kind}-{scope}-{}", started.unix_timestamp_nanos()).as_bytes(),
    )
}

/// Run directory name, e.g. `autofix-20261018T101500Z-1b4e28ba`.
pub fn run_name(kind: &str, scope: &str) -> String {
    let now = time::OffsetDateTime::now_utc();
    let id = run_id(kind, scope, now).simple().to_string();
    format!(
        "{kind}-{:04}{:02}{:02}T{:02}{:02}{:02}Z-{}",
        now.year(),
        u8::from(now.month()),
        now.day(),
        now.hour(),
        now.minute(),
        now.second(),
        &id[..8]
    )
}

pub fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}

pub fn format_elapsed(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{secs}s")
    } else {
        format!("{}m{}s", secs / 60, secs % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_loop_start_serialization() {
        let event = Event::LoopStart {
            proposal: 42,
            max_iterations: 5,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"loop_start""#));
        assert!(json.contains(r#""proposal":42"#));
        assert!(json.contains(r#""max_iterations":5"#));
    }

    #[test]
    fn event_reappeared_uses_lowercase_severity() {
        let event = Event::IssueReappeared {
            proposal: 1,
            iteration: 2,
            fingerprint: "abc".into(),
            severity: Severity::High,
            file: "src/lib.rs".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"issue_reappeared""#));
        assert!(json.contains(r#""severity":"high""#));
    }

    #[test]
    fn status_event_omits_missing_reason() {
        let event = Event::ProposalStatus {
            proposal: 3,
            from: "PENDING".into(),
            to: "APPROVED".into(),
            reason: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("reason"));
    }

    #[test]
    fn full_event_includes_seq_and_ts() {
        let full = FullEvent {
            seq: 5,
            ts: "2026-02-18T10:00:00Z".into(),
            event: Event::IterationStart {
                proposal: 9,
                iteration: 1,
            },
        };
        let json = serde_json::to_string(&full).unwrap();
        assert!(json.contains(r#""seq":5"#));
        assert!(json.contains(r#""ts":"2026-02-18T10:00:00Z""#));
        assert!(json.contains(r#""type":"iteration_start""#));
    }

    #[test]
    fn event_logger_creates_and_appends() {
        let dir = tempfile::tempdir().unwrap();
        let logger = EventLogger::new(dir.path(), "autofix-test");

        logger.record(Event::LoopStart {
            proposal: 7,
            max_iterations: 2,
        });
        logger.record(Event::IterationStart {
            proposal: 7,
            iteration: 1,
        });

        let path = logger.jsonl_path().unwrap();
        assert!(path.ends_with(".mergeloop/runs/autofix-test/events.jsonl"));
        let content = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = content.trim().lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(first["seq"], 0);
        assert_eq!(second["seq"], 1);
        assert_eq!(first["type"], "loop_start");
        assert_eq!(second["type"], "iteration_start");
    }

    #[test]
    fn disabled_logger_writes_nothing() {
        let logger = EventLogger::disabled();
        logger.record(Event::IterationStart {
            proposal: 1,
            iteration: 1,
        });
        assert!(logger.jsonl_path().is_none());
    }

    #[test]
    fn run_id_is_deterministic() {
        let t = time::OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        assert_eq!(run_id("autofix", "42", t), run_id("autofix", "42", t));
        assert_ne!(run_id("autofix", "42", t), run_id("autofix", "43", t));
        assert_eq!(run_id("review", "1", t).get_version_num(), 5);
    }

    #[test]
    fn run_name_has_kind_stamp_and_suffix() {
        let name = run_name("orchestrate", "main");
        let parts: Vec<&str> = name.split('-').collect();
        assert_eq!(parts[0], "orchestrate");
        assert_eq!(parts[1].len(), 16);
        assert!(parts[1].ends_with('Z'));
        assert_eq!(parts[2].len(), 8);
    }

    #[test]
    fn elapsed_formatting() {
        assert_eq!(format_elapsed(std::time::Duration::from_secs(42)), "42s");
        assert_eq!(format_elapsed(std::time::Duration::from_secs(125)), "2m5s");
    }
}
