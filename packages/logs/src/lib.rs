use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

/// Which pipeline stream a log line belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Build,
    Run,
    System,
}

impl LogStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStream::Build => "build",
            LogStream::Run => "run",
            LogStream::System => "system",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Error,
}

/// One ordered, append-only log line for a case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub level: LogLevel,
    pub line: String,
}

struct CaseChannel {
    backlog: VecDeque<LogRecord>,
    live: broadcast::Sender<LogRecord>,
}

impl CaseChannel {
    fn new() -> Self {
        let (live, _) = broadcast::channel(256);
        Self {
            backlog: VecDeque::new(),
            live,
        }
    }
}

/// Append-only, ordered, per-case log channel.
///
/// Writers from the build, run and system streams interleave through the
/// store's write lock, which preserves per-stream order and makes global
/// order the append order. Retention is bounded: once a case exceeds the
/// configured line cap the oldest lines are dropped first, without reordering
/// what remains.
pub struct CaseLogStore {
    channels: Arc<RwLock<HashMap<String, CaseChannel>>>,
    retention: usize,
}

impl CaseLogStore {
    pub fn new(retention: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            retention: retention.max(1),
        }
    }

    /// Append one line for a case; live subscribers see it immediately.
    pub async fn append(
        &self,
        case_id: &str,
        stream: LogStream,
        level: LogLevel,
        line: impl Into<String>,
    ) {
        let record = LogRecord {
            timestamp: Utc::now(),
            stream,
            level,
            line: line.into(),
        };

        let mut channels = self.channels.write().await;
        let channel = channels
            .entry(case_id.to_string())
            .or_insert_with(CaseChannel::new);

        channel.backlog.push_back(record.clone());
        while channel.backlog.len() > self.retention {
            channel.backlog.pop_front();
        }

        // Live delivery is best-effort; a case with no subscribers is fine.
        let _ = channel.live.send(record);
    }

    pub async fn build_line(&self, case_id: &str, line: impl Into<String>) {
        self.append(case_id, LogStream::Build, LogLevel::Info, line).await;
    }

    pub async fn run_line(&self, case_id: &str, line: impl Into<String>) {
        self.append(case_id, LogStream::Run, LogLevel::Info, line).await;
    }

    pub async fn system_info(&self, case_id: &str, line: impl Into<String>) {
        self.append(case_id, LogStream::System, LogLevel::Info, line).await;
    }

    pub async fn system_error(&self, case_id: &str, line: impl Into<String>) {
        self.append(case_id, LogStream::System, LogLevel::Error, line).await;
    }

    /// Attach a live consumer: returns the retained backlog plus a receiver
    /// for every record appended afterwards.
    pub async fn subscribe(
        &self,
        case_id: &str,
    ) -> (Vec<LogRecord>, broadcast::Receiver<LogRecord>) {
        let mut channels = self.channels.write().await;
        let channel = channels
            .entry(case_id.to_string())
            .or_insert_with(CaseChannel::new);
        (
            channel.backlog.iter().cloned().collect(),
            channel.live.subscribe(),
        )
    }

    /// Replay the retained history for a case, newest-last.
    pub async fn replay(&self, case_id: &str, limit: Option<usize>) -> Vec<LogRecord> {
        let channels = self.channels.read().await;
        let Some(channel) = channels.get(case_id) else {
            return Vec::new();
        };

        let records: Vec<LogRecord> = channel.backlog.iter().cloned().collect();
        match limit {
            Some(max) if records.len() > max => records[records.len() - max..].to_vec(),
            _ => records,
        }
    }

    /// Drop all retained lines for a case. Used when a new attempt begins so
    /// stale lines from the previous attempt never precede fresh ones.
    pub async fn clear(&self, case_id: &str) {
        let mut channels = self.channels.write().await;
        if let Some(channel) = channels.get_mut(case_id) {
            channel.backlog.clear();
            debug!("Cleared log backlog for case {}", case_id);
        }
    }

    /// Remove the case's channel entirely (archive teardown).
    pub async fn remove(&self, case_id: &str) {
        let mut channels = self.channels.write().await;
        channels.remove(case_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_and_replay_order() {
        let store = CaseLogStore::new(100);
        store.build_line("c1", "step 1").await;
        store.build_line("c1", "step 2").await;
        store.run_line("c1", "listening").await;

        let records = store.replay("c1", None).await;
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].line, "step 1");
        assert_eq!(records[1].line, "step 2");
        assert_eq!(records[2].stream, LogStream::Run);
    }

    #[tokio::test]
    async fn test_retention_drops_oldest_first() {
        let store = CaseLogStore::new(3);
        for i in 0..5 {
            store.build_line("c1", format!("line {}", i)).await;
        }

        let records = store.replay("c1", None).await;
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].line, "line 2");
        assert_eq!(records[2].line, "line 4");
    }

    #[tokio::test]
    async fn test_replay_limit_returns_tail() {
        let store = CaseLogStore::new(100);
        for i in 0..10 {
            store.build_line("c1", format!("line {}", i)).await;
        }

        let records = store.replay("c1", Some(2)).await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].line, "line 8");
        assert_eq!(records[1].line, "line 9");
    }

    #[tokio::test]
    async fn test_subscribe_receives_backlog_and_live() {
        let store = CaseLogStore::new(100);
        store.system_info("c1", "queued").await;

        let (backlog, mut live) = store.subscribe("c1").await;
        assert_eq!(backlog.len(), 1);

        store.build_line("c1", "building").await;
        let next = live.recv().await.unwrap();
        assert_eq!(next.line, "building");
        assert_eq!(next.stream, LogStream::Build);
    }

    #[tokio::test]
    async fn test_per_stream_order_preserved_under_interleaving() {
        let store = Arc::new(CaseLogStore::new(1000));

        let build_store = Arc::clone(&store);
        let build = tokio::spawn(async move {
            for i in 0..50 {
                build_store.build_line("c1", format!("build {}", i)).await;
            }
        });
        let run_store = Arc::clone(&store);
        let run = tokio::spawn(async move {
            for i in 0..50 {
                run_store.run_line("c1", format!("run {}", i)).await;
            }
        });

        build.await.unwrap();
        run.await.unwrap();

        let records = store.replay("c1", None).await;
        let build_lines: Vec<&str> = records
            .iter()
            .filter(|r| r.stream == LogStream::Build)
            .map(|r| r.line.as_str())
            .collect();
        let run_lines: Vec<&str> = records
            .iter()
            .filter(|r| r.stream == LogStream::Run)
            .map(|r| r.line.as_str())
            .collect();

        for (i, line) in build_lines.iter().enumerate() {
            assert_eq!(*line, format!("build {}", i));
        }
        for (i, line) in run_lines.iter().enumerate() {
            assert_eq!(*line, format!("run {}", i));
        }
    }

    #[tokio::test]
    async fn test_clear_empties_backlog() {
        let store = CaseLogStore::new(100);
        store.build_line("c1", "old attempt").await;
        store.clear("c1").await;

        assert!(store.replay("c1", None).await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_case_replays_empty() {
        let store = CaseLogStore::new(100);
        assert!(store.replay("missing", None).await.is_empty());
    }
}
