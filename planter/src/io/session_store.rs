//! Durable, append-only session persistence.
//!
//! Layout under `<workspace>/<session_dir>/<session_id>/`:
//! - `events.jsonl`: one [`EventEnvelope`] per line, append-only.
//! - `state.json`: snapshot rewritten atomically after every step.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::types::{EventEnvelope, EventKind, SessionStatus, StepRecord};
use crate::io::atomic::write_json_atomic;
use crate::io::config::ConfigError;

pub const EVENTS_FILE: &str = "events.jsonl";
pub const STATE_FILE: &str = "state.json";

static SESSION_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("session id pattern should be valid"));

/// Reject ids that could escape the session directory.
pub fn validate_session_id(id: &str) -> Result<(), ConfigError> {
    if SESSION_ID_RE.is_match(id) {
        Ok(())
    } else {
        Err(ConfigError::InvalidSessionId(id.to_string()))
    }
}

/// Mint a fresh id: `YYYYmmdd-HHMMSS-<6 hex>`.
pub fn new_session_id() -> String {
    let suffix: u32 = rand::thread_rng().gen_range(0..0x100_0000);
    format!("{}-{suffix:06x}", Utc::now().format("%Y%m%d-%H%M%S"))
}

/// Current time as an RFC 3339 UTC string.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Snapshot persisted in `state.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    #[serde(default)]
    pub objective: Option<String>,
    pub status: SessionStatus,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub step_count: u64,
    #[serde(default)]
    pub last_seq: u64,
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    /// Most recent step records, verbatim.
    #[serde(default)]
    pub replay: Vec<StepRecord>,
    /// One-line summaries of steps evicted from `replay`.
    #[serde(default)]
    pub summaries: Vec<String>,
}

impl SessionState {
    pub fn new(session_id: &str) -> Self {
        let now = now_rfc3339();
        Self {
            session_id: session_id.to_string(),
            objective: None,
            status: SessionStatus::Running,
            created_at: now.clone(),
            updated_at: now,
            step_count: 0,
            last_seq: 0,
            answer: None,
            error: None,
            replay: Vec::new(),
            summaries: Vec::new(),
        }
    }

    /// Record a step, keeping at most `cap` records verbatim.
    pub fn record_step(&mut self, record: &StepRecord, cap: usize) {
        self.step_count += 1;
        self.replay.push(record.clone());
        let overflow = self.replay.len().saturating_sub(cap);
        if overflow > 0 {
            self.summaries
                .extend(self.replay.drain(..overflow).map(|old| old.summary()));
        }
    }

    /// Rebuild a snapshot from a log when `state.json` is missing or unreadable.
    pub fn from_events(session_id: &str, events: &[EventEnvelope], cap: usize) -> Self {
        let mut state = Self::new(session_id);
        if let Some(first) = events.first() {
            state.created_at = first.ts.clone();
        }
        for envelope in events {
            state.last_seq = state.last_seq.max(envelope.seq);
            state.updated_at = envelope.ts.clone();
            match envelope.kind {
                EventKind::SessionStarted => {
                    state.objective = envelope
                        .data
                        .get("objective")
                        .and_then(|v| v.as_str())
                        .map(str::to_string);
                    state.status = SessionStatus::Running;
                }
                EventKind::Step => {
                    if let Ok(record) = serde_json::from_value::<StepRecord>(envelope.data.clone()) {
                        state.record_step(&record, cap);
                    }
                }
                EventKind::SessionFinished => {
                    if let Some(status) = envelope
                        .data
                        .get("status")
                        .and_then(|v| serde_json::from_value(v.clone()).ok())
                    {
                        state.status = status;
                    }
                    state.answer = envelope
                        .data
                        .get("answer")
                        .and_then(|v| v.as_str())
                        .map(str::to_string);
                    state.error = envelope
                        .data
                        .get("error")
                        .and_then(|v| v.as_str())
                        .map(str::to_string);
                }
                EventKind::Trace | EventKind::Delta => {}
            }
        }
        state
    }
}

/// Row returned by [`SessionStore::list_sessions`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub objective: Option<String>,
    pub status: SessionStatus,
    pub created_at: String,
}

/// Append handle for one session's `events.jsonl`.
#[derive(Debug)]
pub struct EventLog {
    path: PathBuf,
    file: File,
}

impl EventLog {
    /// Open for appending, creating the file if needed.
    ///
    /// A trailing partial line left by a crash is terminated first so new
    /// records always start on their own line.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open event log {}", path.display()))?;
        let len = file
            .metadata()
            .with_context(|| format!("stat event log {}", path.display()))?
            .len();
        if len > 0 {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::End(-1))
                .with_context(|| format!("seek event log {}", path.display()))?;
            file.read_exact(&mut last)
                .with_context(|| format!("read event log {}", path.display()))?;
            if last[0] != b'\n' {
                warn!(path = %path.display(), "terminating partial trailing event line");
                file.write_all(b"\n")
                    .with_context(|| format!("repair event log {}", path.display()))?;
            }
        }
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn append(&mut self, envelope: &EventEnvelope) -> Result<()> {
        let mut line = serde_json::to_string(envelope).context("serialize event")?;
        line.push('\n');
        self.file
            .write_all(line.as_bytes())
            .with_context(|| format!("append event {}", self.path.display()))?;
        self.file
            .flush()
            .with_context(|| format!("flush event log {}", self.path.display()))?;
        Ok(())
    }
}

/// Filesystem-backed session enumeration and persistence.
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    /// `root` is `<workspace>/<session_dir>`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    pub fn events_path(&self, id: &str) -> PathBuf {
        self.session_dir(id).join(EVENTS_FILE)
    }

    pub fn state_path(&self, id: &str) -> PathBuf {
        self.session_dir(id).join(STATE_FILE)
    }

    pub fn exists(&self, id: &str) -> bool {
        self.events_path(id).exists()
    }

    /// Create the session directory and return an append handle to its log.
    pub fn open_log(&self, id: &str) -> Result<EventLog> {
        validate_session_id(id)?;
        let dir = self.session_dir(id);
        fs::create_dir_all(&dir).with_context(|| format!("create session dir {}", dir.display()))?;
        EventLog::open(&self.events_path(id))
    }

    /// All parseable events of a session, in log order. Malformed lines are skipped.
    pub fn events(&self, id: &str) -> Result<Vec<EventEnvelope>> {
        validate_session_id(id)?;
        let path = self.events_path(id);
        let file = File::open(&path).with_context(|| format!("open {}", path.display()))?;
        let mut events = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| format!("read {}", path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<EventEnvelope>(&line) {
                Ok(envelope) => events.push(envelope),
                Err(err) => warn!(line = idx + 1, err = %err, "skipping malformed event line"),
            }
        }
        Ok(events)
    }

    pub fn load_state(&self, id: &str) -> Result<Option<SessionState>> {
        validate_session_id(id)?;
        let path = self.state_path(id);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
        };
        match serde_json::from_str(&contents) {
            Ok(state) => Ok(Some(state)),
            Err(err) => {
                warn!(path = %path.display(), err = %err, "ignoring unreadable session state");
                Ok(None)
            }
        }
    }

    pub fn save_state(&self, state: &SessionState) -> Result<()> {
        write_json_atomic(&self.state_path(&state.session_id), state)
    }

    /// Sessions ordered most-recent-first by event log modification time.
    pub fn list_sessions(&self, limit: usize) -> Result<Vec<SessionSummary>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err).with_context(|| format!("read {}", self.root.display())),
        };

        let mut found: Vec<(SystemTime, String)> = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("read {}", self.root.display()))?;
            let id = entry.file_name().to_string_lossy().into_owned();
            if validate_session_id(&id).is_err() {
                continue;
            }
            let Ok(meta) = fs::metadata(self.events_path(&id)) else {
                continue;
            };
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            found.push((modified, id));
        }
        found.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));

        let mut sessions = Vec::with_capacity(limit.min(found.len()));
        for (_, id) in found {
            if sessions.len() >= limit {
                break;
            }
            match self.summarize(&id) {
                Ok(summary) => sessions.push(summary),
                Err(err) => warn!(session_id = %id, err = %err, "skipping unreadable session"),
            }
        }
        Ok(sessions)
    }

    /// Summary from the snapshot, or from the log when the snapshot is unusable.
    fn summarize(&self, id: &str) -> Result<SessionSummary> {
        let snapshot = match self.load_state(id) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(session_id = %id, err = %err, "could not read session state");
                None
            }
        };
        let state = match snapshot {
            Some(state) => state,
            None => {
                debug!(session_id = %id, "rebuilding summary from event log");
                SessionState::from_events(id, &self.events(id)?, usize::MAX)
            }
        };
        Ok(SessionSummary {
            id: id.to_string(),
            objective: state.objective,
            status: state.status,
            created_at: state.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::core::types::StepKind;

    fn envelope(seq: u64, kind: EventKind, data: serde_json::Value) -> EventEnvelope {
        EventEnvelope {
            seq,
            kind,
            ts: format!("2026-01-01T00:00:0{seq}.000Z"),
            data,
        }
    }

    fn step(n: u32) -> StepRecord {
        StepRecord {
            step: n,
            depth: 0,
            kind: StepKind::ToolCall,
            payload: json!({"tool": "list_files"}),
            elapsed_secs: 0.5,
        }
    }

    #[test]
    fn session_ids_are_validated() {
        assert!(validate_session_id("20260101-120000-abc123").is_ok());
        assert!(validate_session_id("my_session").is_ok());
        assert!(validate_session_id("../etc").is_err());
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id(&new_session_id()).is_ok());
    }

    #[test]
    fn replay_is_capped_and_older_steps_summarized() {
        let mut state = SessionState::new("s");
        for n in 1..=5 {
            state.record_step(&step(n), 2);
        }
        assert_eq!(state.step_count, 5);
        assert_eq!(
            state.replay.iter().map(|r| r.step).collect::<Vec<_>>(),
            vec![4, 5]
        );
        assert_eq!(state.summaries.len(), 3);
        assert!(state.summaries[0].starts_with("d0 s1 tool: list_files"));
    }

    #[test]
    fn events_round_trip_and_skip_malformed_lines() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(temp.path());
        let mut log = store.open_log("s1").expect("open");
        log.append(&envelope(1, EventKind::SessionStarted, json!({"objective": "o"})))
            .expect("append");
        drop(log);

        let mut raw = fs::OpenOptions::new()
            .append(true)
            .open(store.events_path("s1"))
            .expect("open raw");
        raw.write_all(b"{not json").expect("write partial");
        drop(raw);

        let mut log = store.open_log("s1").expect("reopen");
        log.append(&envelope(2, EventKind::Trace, json!({"message": "hi"})))
            .expect("append");

        let events = store.events("s1").expect("events");
        assert_eq!(events.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn list_sessions_is_most_recent_first() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(temp.path());
        for id in ["older", "newer"] {
            let mut log = store.open_log(id).expect("open");
            log.append(&envelope(
                1,
                EventKind::SessionStarted,
                json!({"objective": format!("{id} objective")}),
            ))
            .expect("append");
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        fs::create_dir_all(temp.path().join("not-a-session")).expect("mkdir");

        let sessions = store.list_sessions(10).expect("list");
        assert_eq!(
            sessions.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
            vec!["newer", "older"]
        );
        assert_eq!(sessions[0].objective.as_deref(), Some("newer objective"));
        assert_eq!(sessions[0].status, SessionStatus::Running);
        assert_eq!(store.list_sessions(1).expect("list").len(), 1);
    }

    #[test]
    fn unreadable_sessions_do_not_fail_the_listing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::new(temp.path());
        for id in ["good", "bad-state"] {
            let mut log = store.open_log(id).expect("open");
            log.append(&envelope(1, EventKind::SessionStarted, json!({"objective": id})))
                .expect("append");
        }
        fs::create_dir_all(store.state_path("bad-state")).expect("state as dir");
        fs::create_dir_all(store.events_path("bad-log")).expect("log as dir");

        let mut ids: Vec<String> = store
            .list_sessions(10)
            .expect("list")
            .into_iter()
            .map(|s| s.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["bad-state".to_string(), "good".to_string()]);
    }

    #[test]
    fn state_rebuilds_from_events() {
        let events = vec![
            envelope(1, EventKind::SessionStarted, json!({"objective": "o"})),
            envelope(2, EventKind::Step, serde_json::to_value(step(1)).expect("step")),
            envelope(
                3,
                EventKind::SessionFinished,
                json!({"status": "complete", "answer": "done"}),
            ),
        ];
        let state = SessionState::from_events("s", &events, 10);
        assert_eq!(state.last_seq, 3);
        assert_eq!(state.step_count, 1);
        assert_eq!(state.status, SessionStatus::Complete);
        assert_eq!(state.answer.as_deref(), Some("done"));
    }
}
