use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Operations started within this window and not finished count as active.
const ACTIVE_WINDOW_MINUTES: i64 = 5;
const RECENT_WINDOW_MINUTES: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecStatus {
    Started,
    Completed,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEntry {
    pub id: u64,
    pub session_id: String,
    pub step: String,
    pub jurisdiction: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: ExecStatus,
    pub duration_ms: Option<u64>,
    pub result_kind: Option<String>,
    pub result_len: Option<usize>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecStats {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub running: usize,
    /// Completed / finished, in percent. Zero when nothing has finished.
    pub success_rate: f64,
    pub avg_duration_ms: Option<f64>,
    pub step_usage: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionActivity {
    pub session_id: String,
    pub stats: ExecStats,
    pub entries: Vec<ExecutionEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LiveStatus {
    pub active_operations: Vec<ExecutionEntry>,
    pub recent_activity: Vec<ExecutionEntry>,
    pub active_sessions: usize,
}

/// Process-wide, bounded record of step executions. Observability only;
/// nothing in the pipeline reads it back.
pub struct ExecutionLog {
    entries: Mutex<VecDeque<ExecutionEntry>>,
    capacity: usize,
    next_id: AtomicU64,
    tx: broadcast::Sender<ExecutionEntry>,
}

impl ExecutionLog {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (tx, _) = broadcast::channel(256);
        Arc::new(Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            tx,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEntry> {
        self.tx.subscribe()
    }

    /// Record the start of a step and return its entry id.
    pub fn start(&self, session_id: &str, step: &str, jurisdiction: Option<&str>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = ExecutionEntry {
            id,
            session_id: session_id.to_string(),
            step: step.to_string(),
            jurisdiction: jurisdiction.map(str::to_string),
            started_at: Utc::now(),
            finished_at: None,
            status: ExecStatus::Started,
            duration_ms: None,
            result_kind: None,
            result_len: None,
            error: None,
        };
        let _ = self.tx.send(entry.clone());
        let mut entries = self.lock();
        entries.push_back(entry);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
        id
    }

    pub fn finish_ok(&self, id: u64, result_kind: &str, result_len: usize) {
        self.finish(id, |e| {
            e.status = ExecStatus::Completed;
            e.result_kind = Some(result_kind.to_string());
            e.result_len = Some(result_len);
        });
    }

    pub fn finish_err(&self, id: u64, error: &str) {
        self.finish(id, |e| {
            e.status = ExecStatus::Error;
            e.error = Some(error.to_string());
        });
    }

    fn finish(&self, id: u64, update: impl FnOnce(&mut ExecutionEntry)) {
        let snapshot = {
            let mut entries = self.lock();
            let Some(entry) = entries.iter_mut().rev().find(|e| e.id == id) else {
                return;
            };
            let now = Utc::now();
            entry.finished_at = Some(now);
            entry.duration_ms = Some((now - entry.started_at).num_milliseconds().max(0) as u64);
            update(entry);
            entry.clone()
        };
        let _ = self.tx.send(snapshot);
    }

    /// Newest first.
    pub fn recent(&self, limit: usize, session_id: Option<&str>) -> Vec<ExecutionEntry> {
        self.lock()
            .iter()
            .rev()
            .filter(|e| session_id.map_or(true, |s| e.session_id == s))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn stats(&self, session_id: Option<&str>) -> ExecStats {
        let entries = self.lock();
        compute_stats(entries.iter().filter(|e| session_id.map_or(true, |s| e.session_id == s)))
    }

    pub fn session_activity(&self, session_id: &str) -> Option<SessionActivity> {
        let entries: Vec<ExecutionEntry> = self
            .lock()
            .iter()
            .filter(|e| e.session_id == session_id)
            .cloned()
            .collect();
        if entries.is_empty() {
            return None;
        }
        Some(SessionActivity {
            session_id: session_id.to_string(),
            stats: compute_stats(entries.iter()),
            entries,
        })
    }

    pub fn live_status(&self, now: DateTime<Utc>) -> LiveStatus {
        let active_cutoff = now - Duration::minutes(ACTIVE_WINDOW_MINUTES);
        let recent_cutoff = now - Duration::minutes(RECENT_WINDOW_MINUTES);
        let entries = self.lock();

        let active_operations: Vec<ExecutionEntry> = entries
            .iter()
            .filter(|e| e.status == ExecStatus::Started && e.started_at >= active_cutoff)
            .cloned()
            .collect();
        let recent_activity: Vec<ExecutionEntry> = entries
            .iter()
            .rev()
            .filter(|e| e.finished_at.unwrap_or(e.started_at) >= recent_cutoff)
            .cloned()
            .collect();
        let mut sessions: Vec<&str> = recent_activity.iter().map(|e| e.session_id.as_str()).collect();
        sessions.sort_unstable();
        sessions.dedup();

        LiveStatus {
            active_sessions: sessions.len(),
            active_operations,
            recent_activity,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<ExecutionEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn compute_stats<'a>(entries: impl Iterator<Item = &'a ExecutionEntry>) -> ExecStats {
    let mut stats = ExecStats::default();
    let mut total_ms = 0u64;
    let mut timed = 0u64;
    for e in entries {
        stats.total += 1;
        *stats.step_usage.entry(e.step.clone()).or_default() += 1;
        match e.status {
            ExecStatus::Completed => stats.completed += 1,
            ExecStatus::Error => stats.failed += 1,
            ExecStatus::Started => stats.running += 1,
        }
        if let Some(ms) = e.duration_ms {
            total_ms += ms;
            timed += 1;
        }
    }
    let finished = stats.completed + stats.failed;
    if finished > 0 {
        stats.success_rate = stats.completed as f64 / finished as f64 * 100.0;
    }
    if timed > 0 {
        stats.avg_duration_ms = Some(total_ms as f64 / timed as f64);
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_evicts_oldest() {
        let log = ExecutionLog::new(2);
        let a = log.start("s1", "classify_themes", None);
        log.start("s1", "identify_col_issue", None);
        log.start("s2", "detect_jurisdiction", Some("Germany"));

        let recent = log.recent(10, None);
        assert_eq!(recent.len(), 2);
        assert!(recent.iter().all(|e| e.id != a));
        assert_eq!(recent[0].session_id, "s2");
    }

    #[test]
    fn finishing_an_evicted_entry_is_ignored() {
        let log = ExecutionLog::new(1);
        let a = log.start("s1", "classify_themes", None);
        log.start("s1", "identify_col_issue", None);
        log.finish_ok(a, "list", 1);
        assert_eq!(log.stats(None).completed, 0);
    }

    #[test]
    fn stats_and_success_rate() {
        let log = ExecutionLog::new(100);
        let a = log.start("s1", "classify_themes", None);
        let b = log.start("s1", "identify_col_issue", None);
        let c = log.start("s1", "identify_col_issue", None);
        log.start("s2", "generate_abstract", None);
        log.finish_ok(a, "list", 2);
        log.finish_ok(b, "text", 40);
        log.finish_err(c, "model timed out");

        let s1 = log.stats(Some("s1"));
        assert_eq!((s1.total, s1.completed, s1.failed, s1.running), (3, 2, 1, 0));
        assert!((s1.success_rate - 66.666).abs() < 0.01);
        assert_eq!(s1.step_usage.get("identify_col_issue"), Some(&2));
        assert!(s1.avg_duration_ms.is_some());

        let all = log.stats(None);
        assert_eq!(all.running, 1);
        assert_eq!(all.total, 4);
    }

    #[test]
    fn empty_stats_have_zero_rate() {
        let log = ExecutionLog::new(10);
        let stats = log.stats(None);
        assert_eq!(stats.success_rate, 0.0);
        assert!(stats.avg_duration_ms.is_none());
    }

    #[test]
    fn recent_filters_by_session() {
        let log = ExecutionLog::new(10);
        log.start("s1", "classify_themes", None);
        log.start("s2", "classify_themes", None);
        log.start("s1", "generate_abstract", None);

        let s1 = log.recent(10, Some("s1"));
        assert_eq!(s1.len(), 2);
        assert_eq!(s1[0].step, "generate_abstract");
        assert_eq!(log.recent(1, None).len(), 1);
    }

    #[test]
    fn session_activity_for_unknown_session() {
        let log = ExecutionLog::new(10);
        log.start("s1", "classify_themes", None);
        assert!(log.session_activity("nope").is_none());
        let act = log.session_activity("s1").unwrap();
        assert_eq!(act.entries.len(), 1);
        assert_eq!(act.stats.running, 1);
    }

    #[test]
    fn live_status_windows() {
        let log = ExecutionLog::new(10);
        let a = log.start("s1", "classify_themes", None);
        log.start("s2", "identify_col_issue", None);
        log.finish_ok(a, "list", 1);

        let now = log.live_status(Utc::now());
        assert_eq!(now.active_operations.len(), 1);
        assert_eq!(now.active_operations[0].session_id, "s2");
        assert_eq!(now.recent_activity.len(), 2);
        assert_eq!(now.active_sessions, 2);

        let later = log.live_status(Utc::now() + Duration::minutes(30));
        assert!(later.active_operations.is_empty());
        assert!(later.recent_activity.is_empty());
        assert_eq!(later.active_sessions, 0);
    }

    #[tokio::test]
    async fn subscribers_see_start_and_finish() {
        let log = ExecutionLog::new(10);
        let mut rx = log.subscribe();
        let id = log.start("s1", "classify_themes", None);
        log.finish_err(id, "boom");

        let started = rx.recv().await.unwrap();
        assert_eq!(started.status, ExecStatus::Started);
        let finished = rx.recv().await.unwrap();
        assert_eq!(finished.status, ExecStatus::Error);
        assert_eq!(finished.error.as_deref(), Some("boom"));
    }
}
