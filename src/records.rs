//! Append-only execution records
//!
//! One record is persisted per sandbox run, never mutated. Storage is a
//! JSONL file: append one line per record, read back by scanning.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sandbox::ExecStopType;

/// Ephemeral request for one sandbox run, owned by one engine iteration.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub session_key: String,
    /// Trace id of the turn this run belongs to
    pub trace_id: String,
    /// Model-generated code, without the preamble
    pub code: String,
    /// Chain-of-thought / reasoning text accompanying the code
    pub thoughts: String,
    /// Identity of the user whose message triggered this turn
    pub trigger_user: Option<String>,
    /// Platform id of the triggering message, when known
    pub trigger_message_id: Option<String>,
    /// Model-side bookkeeping: generation latency in milliseconds
    pub generation_time_ms: u64,
    /// Model-side bookkeeping: token usage
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Persisted outcome of one sandbox run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub session_key: String,
    pub code: String,
    pub thoughts: String,
    /// Combined output, already size-capped
    pub outputs: String,
    pub success: bool,
    pub stop_type: ExecStopType,
    pub exec_time_ms: u64,
    pub generation_time_ms: u64,
    pub total_time_ms: u64,
    pub trigger_user: Option<String>,
    /// Serialized metrics blob (token counts and friends)
    pub metrics: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Append-only JSONL store for execution records.
pub struct RecordStore {
    path: PathBuf,
}

impl RecordStore {
    /// Open (or create) a store at `path`; parent directories are created.
    pub fn new(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }

    /// Append one record. Each record is a single JSON line.
    pub fn append(&self, record: &ExecutionRecord) -> io::Result<()> {
        let line = serde_json::to_string(record)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")
    }

    /// The most recent `limit` records for a session, oldest first.
    ///
    /// Scans the whole file; fine for the diagnostic use this serves.
    pub fn recent(&self, session_key: &str, limit: usize) -> io::Result<Vec<ExecutionRecord>> {
        let file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut matching = Vec::new();
        for line in io::BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            // tolerate a torn final line from a crashed writer
            if let Ok(record) = serde_json::from_str::<ExecutionRecord>(&line) {
                if record.session_key == session_key {
                    matching.push(record);
                }
            }
        }
        let skip = matching.len().saturating_sub(limit);
        Ok(matching.split_off(skip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> RecordStore {
        let path = std::env::temp_dir()
            .join(format!("sandbot-records-{}", uuid::Uuid::now_v7()))
            .join("exec_records.jsonl");
        RecordStore::new(path).unwrap()
    }

    fn record(session: &str, code: &str, stop: ExecStopType) -> ExecutionRecord {
        ExecutionRecord {
            session_key: session.to_string(),
            code: code.to_string(),
            thoughts: String::new(),
            outputs: "ok".to_string(),
            success: stop.is_success(),
            stop_type: stop,
            exec_time_ms: 12,
            generation_time_ms: 340,
            total_time_ms: 352,
            trigger_user: Some("alice".to_string()),
            metrics: serde_json::json!({"prompt_tokens": 100}),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn append_then_read_back_filtered_by_session() {
        let store = temp_store();
        store.append(&record("a", "print(1)", ExecStopType::Normal)).unwrap();
        store.append(&record("b", "print(2)", ExecStopType::Error)).unwrap();
        store.append(&record("a", "print(3)", ExecStopType::Agent)).unwrap();

        let recent = store.recent("a", 10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].code, "print(1)");
        assert_eq!(recent[1].code, "print(3)");
        assert_eq!(recent[1].stop_type, ExecStopType::Agent);
        assert!(recent[1].success);
    }

    #[test]
    fn recent_honors_limit_keeping_newest() {
        let store = temp_store();
        for i in 0..5 {
            store.append(&record("s", &format!("run {}", i), ExecStopType::Normal)).unwrap();
        }
        let recent = store.recent("s", 2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].code, "run 3");
        assert_eq!(recent[1].code, "run 4");
    }

    #[test]
    fn missing_file_reads_empty() {
        let store = temp_store();
        assert!(store.recent("nobody", 5).unwrap().is_empty());
    }

    #[test]
    fn stop_type_round_trips_as_snake_case() {
        let json = serde_json::to_string(&ExecStopType::MultimodalAgent).unwrap();
        assert_eq!(json, "\"multimodal_agent\"");
        let back: ExecStopType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ExecStopType::MultimodalAgent);
    }
}
