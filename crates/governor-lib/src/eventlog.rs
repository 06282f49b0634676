//! Append-only usage event log
//!
//! Durable record of every usage event, one JSON line per event,
//! partitioned by agent and day. The log is write-only on the hot path;
//! it backs offline reprocessing and audits, while the in-memory ledger
//! serves aggregation.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::error::{GovernorError, Result};
use crate::models::UsageEvent;

/// Append-only JSONL event log partitioned by agent and day
pub struct EventLog {
    dir: PathBuf,
}

impl EventLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Append one event to its agent+day partition
    pub fn append(&self, event: &UsageEvent) -> Result<()> {
        let path = self.partition_path(&event.agent_id, event.timestamp);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| GovernorError::Store(format!("create {:?}: {}", parent, e)))?;
        }

        let line = serde_json::to_string(event)
            .map_err(|e| GovernorError::Store(format!("serialize event: {}", e)))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| GovernorError::Store(format!("open {:?}: {}", path, e)))?;
        writeln!(file, "{}", line)
            .map_err(|e| GovernorError::Store(format!("append {:?}: {}", path, e)))?;

        Ok(())
    }

    /// Read back one agent+day partition, oldest first
    pub fn read_partition(&self, agent_id: &str, timestamp: i64) -> Result<Vec<UsageEvent>> {
        let path = self.partition_path(agent_id, timestamp);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let data = std::fs::read_to_string(&path)
            .map_err(|e| GovernorError::Store(format!("read {:?}: {}", path, e)))?;

        let mut events = Vec::new();
        for line in data.lines().filter(|l| !l.trim().is_empty()) {
            let event: UsageEvent = serde_json::from_str(line)
                .map_err(|e| GovernorError::Store(format!("parse {:?}: {}", path, e)))?;
            events.push(event);
        }
        Ok(events)
    }

    fn partition_path(&self, agent_id: &str, timestamp: i64) -> PathBuf {
        let day = DateTime::from_timestamp(timestamp, 0)
            .unwrap_or_else(Utc::now)
            .format("%Y-%m-%d")
            .to_string();
        // Agent ids become directory names; keep them path-safe
        let agent: String = agent_id
            .chars()
            .map(|c| if c == '/' || c == '\\' || c == '.' { '_' } else { c })
            .collect();
        self.dir.join(agent).join(format!("{}.jsonl", day))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Outcome;

    fn event(agent: &str, tokens: u64, ts: i64) -> UsageEvent {
        UsageEvent {
            agent_id: agent.to_string(),
            model: "gpt-large".to_string(),
            tokens,
            cost_units: 0.1,
            duration_ms: 500,
            outcome: Outcome::Success,
            timestamp: ts,
        }
    }

    #[test]
    fn test_append_and_read_partition() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path());
        let ts = 1_700_000_000;

        log.append(&event("agent-1", 100, ts)).unwrap();
        log.append(&event("agent-1", 200, ts + 60)).unwrap();

        let events = log.read_partition("agent-1", ts).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].tokens, 100);
        assert_eq!(events[1].tokens, 200);
    }

    #[test]
    fn test_partitions_split_by_day() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path());
        let ts = 1_700_000_000;

        log.append(&event("agent-1", 1, ts)).unwrap();
        log.append(&event("agent-1", 2, ts + 86_400)).unwrap();

        assert_eq!(log.read_partition("agent-1", ts).unwrap().len(), 1);
        assert_eq!(log.read_partition("agent-1", ts + 86_400).unwrap().len(), 1);
    }

    #[test]
    fn test_partitions_split_by_agent() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path());
        let ts = 1_700_000_000;

        log.append(&event("agent-1", 1, ts)).unwrap();
        log.append(&event("agent-2", 2, ts)).unwrap();

        let first = log.read_partition("agent-1", ts).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].agent_id, "agent-1");
    }

    #[test]
    fn test_missing_partition_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path());
        assert!(log.read_partition("unseen", 1_700_000_000).unwrap().is_empty());
    }
}
