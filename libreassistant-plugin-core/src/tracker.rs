//! # Usage Tracker Module
//!
//! Per-request usage tracking with duplicate-call support and queryable
//! analytics.
//!
//! Every dispatch turn owns a `RequestSession` keyed by request id. Sessions
//! are independent: all writes go through the session's own lock, and no
//! operation on one session can observe or mutate another. Finished sessions
//! are archived as immutable snapshots in a bounded ring (default 100), so
//! analytics reads never contend with live dispatches.
//!
//! Invocation records are append-only; indices are contiguous from zero and
//! reflect real start order within the session.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;

/// Terminal outcome of a request session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    Completed,
    Duplicate,
    BudgetExhausted,
    Cancelled,
    Failed,
}

impl SessionOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            SessionOutcome::Completed => "completed",
            SessionOutcome::Duplicate => "duplicate",
            SessionOutcome::BudgetExhausted => "budget_exhausted",
            SessionOutcome::Cancelled => "cancelled",
            SessionOutcome::Failed => "failed",
        }
    }
}

/// One plugin invocation within a session.
#[derive(Debug, Clone, Serialize)]
pub struct InvocationRecord {
    /// Position within the session, contiguous from 0.
    pub index: usize,
    pub plugin_id: String,
    pub input: Value,
    /// Free-text justification supplied by the language model.
    pub reason: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub success: Option<bool>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub cancelled: bool,
    /// True when the call was blocked by consecutive-duplicate detection
    /// and never dispatched.
    pub duplicate_blocked: bool,
    #[serde(skip)]
    pub fingerprint: String,
}

struct RequestSession {
    request_id: String,
    started_at: DateTime<Utc>,
    records: Vec<InvocationRecord>,
    /// Fingerprint of the most recently dispatched invocation.
    last_fingerprint: Option<String>,
}

/// Immutable snapshot of a finished (or in-flight) session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub request_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<SessionOutcome>,
    pub invocations: Vec<InvocationRecord>,
}

/// Aggregated usage of one plugin across archived sessions.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PluginUsage {
    pub invocations: usize,
    pub successes: usize,
    pub failures: usize,
    pub success_rate: f64,
    pub average_duration_ms: f64,
}

/// Analytics snapshot over the session archive.
#[derive(Debug, Clone, Serialize)]
pub struct UsageAnalytics {
    pub sessions: usize,
    pub invocations: usize,
    pub duplicates_blocked: usize,
    pub outcomes: BTreeMap<&'static str, usize>,
    pub plugins: BTreeMap<String, PluginUsage>,
    /// Plugin ids ordered by invocation count, most used first.
    pub most_used: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// How many finished sessions to retain for analytics.
    pub archive_size: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self { archive_size: 100 }
    }
}

/// Process-wide tracker of request sessions.
pub struct UsageTracker {
    active: DashMap<String, Arc<Mutex<RequestSession>>>,
    archive: StdMutex<VecDeque<Arc<SessionSummary>>>,
    config: TrackerConfig,
}

impl UsageTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            active: DashMap::new(),
            archive: StdMutex::new(VecDeque::new()),
            config,
        }
    }

    /// Open a session for a dispatch turn.
    pub fn start_session(&self, request_id: &str) {
        if self.active.contains_key(request_id) {
            tracing::warn!(request_id, "replacing session with duplicate request id");
        }
        self.active.insert(
            request_id.to_string(),
            Arc::new(Mutex::new(RequestSession {
                request_id: request_id.to_string(),
                started_at: Utc::now(),
                records: Vec::new(),
                last_fingerprint: None,
            })),
        );
    }

    fn session(&self, request_id: &str) -> Option<Arc<Mutex<RequestSession>>> {
        self.active.get(request_id).map(|entry| entry.value().clone())
    }

    /// Append a dispatched invocation record; returns its index.
    pub async fn record_invocation(
        &self,
        request_id: &str,
        plugin_id: &str,
        input: Value,
        reason: &str,
        fingerprint: String,
    ) -> Option<usize> {
        let session = self.session(request_id)?;
        let mut session = session.lock().await;
        let index = session.records.len();
        session.records.push(InvocationRecord {
            index,
            plugin_id: plugin_id.to_string(),
            input,
            reason: reason.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: None,
            success: None,
            result: None,
            error: None,
            cancelled: false,
            duplicate_blocked: false,
            fingerprint: fingerprint.clone(),
        });
        session.last_fingerprint = Some(fingerprint);
        Some(index)
    }

    /// Record the outcome of a dispatched invocation.
    pub async fn update_result(
        &self,
        request_id: &str,
        index: usize,
        result: Result<&Value, &str>,
    ) {
        let Some(session) = self.session(request_id) else {
            return;
        };
        let mut session = session.lock().await;
        let Some(record) = session.records.get_mut(index) else {
            tracing::warn!(request_id, index, "update for unknown invocation record");
            return;
        };
        let finished = Utc::now();
        record.finished_at = Some(finished);
        record.duration_ms = Some(
            (finished - record.started_at)
                .num_milliseconds()
                .max(0) as u64,
        );
        match result {
            Ok(value) => {
                record.success = Some(true);
                record.result = Some(value.clone());
            }
            Err(error) => {
                record.success = Some(false);
                record.error = Some(error.to_string());
            }
        }
    }

    /// Mark an in-flight invocation as cancelled.
    pub async fn mark_cancelled(&self, request_id: &str, index: usize) {
        let Some(session) = self.session(request_id) else {
            return;
        };
        let mut session = session.lock().await;
        if let Some(record) = session.records.get_mut(index) {
            let finished = Utc::now();
            record.finished_at = Some(finished);
            record.duration_ms = Some(
                (finished - record.started_at)
                    .num_milliseconds()
                    .max(0) as u64,
            );
            record.success = Some(false);
            record.cancelled = true;
            record.error = Some("cancelled by caller".to_string());
        }
    }

    /// True iff the fingerprint equals the immediately preceding dispatched
    /// invocation's fingerprint.
    pub async fn is_consecutive_duplicate(&self, request_id: &str, fingerprint: &str) -> bool {
        let Some(session) = self.session(request_id) else {
            return false;
        };
        let session = session.lock().await;
        session.last_fingerprint.as_deref() == Some(fingerprint)
    }

    /// Record a call that duplicate detection blocked before dispatch.
    pub async fn record_duplicate_blocked(
        &self,
        request_id: &str,
        plugin_id: &str,
        input: Value,
        reason: &str,
        fingerprint: String,
    ) {
        let Some(session) = self.session(request_id) else {
            return;
        };
        let mut session = session.lock().await;
        let index = session.records.len();
        let now = Utc::now();
        session.records.push(InvocationRecord {
            index,
            plugin_id: plugin_id.to_string(),
            input,
            reason: reason.to_string(),
            started_at: now,
            finished_at: Some(now),
            duration_ms: Some(0),
            success: Some(false),
            result: None,
            error: Some("blocked: consecutive duplicate of the previous invocation".to_string()),
            cancelled: false,
            duplicate_blocked: true,
            fingerprint,
        });
    }

    /// Snapshot of a session's invocation records, in start order.
    pub async fn invocations(&self, request_id: &str) -> Vec<InvocationRecord> {
        match self.session(request_id) {
            Some(session) => session.lock().await.records.clone(),
            None => Vec::new(),
        }
    }

    /// Close a session and move it into the archive.
    pub async fn finish_session(
        &self,
        request_id: &str,
        outcome: SessionOutcome,
    ) -> Option<Arc<SessionSummary>> {
        let (_, session) = self.active.remove(request_id)?;
        let session = session.lock().await;
        let summary = Arc::new(SessionSummary {
            request_id: session.request_id.clone(),
            started_at: session.started_at,
            finished_at: Some(Utc::now()),
            outcome: Some(outcome),
            invocations: session.records.clone(),
        });

        let mut archive = self.archive.lock().expect("archive lock poisoned");
        archive.push_back(summary.clone());
        while archive.len() > self.config.archive_size {
            archive.pop_front();
        }
        tracing::debug!(
            request_id,
            outcome = outcome.as_str(),
            invocations = summary.invocations.len(),
            "session archived"
        );
        Some(summary)
    }

    /// Archive every still-active session. Used at shutdown.
    pub async fn finish_all(&self, outcome: SessionOutcome) {
        let ids: Vec<String> = self.active.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.finish_session(&id, outcome).await;
        }
    }

    /// Summary of an active or archived session.
    pub async fn session_summary(&self, request_id: &str) -> Option<SessionSummary> {
        if let Some(session) = self.session(request_id) {
            let session = session.lock().await;
            return Some(SessionSummary {
                request_id: session.request_id.clone(),
                started_at: session.started_at,
                finished_at: None,
                outcome: None,
                invocations: session.records.clone(),
            });
        }
        self.archive
            .lock()
            .expect("archive lock poisoned")
            .iter()
            .rev()
            .find(|summary| summary.request_id == request_id)
            .map(|summary| summary.as_ref().clone())
    }

    /// Archived sessions, oldest first.
    pub fn archived(&self) -> Vec<Arc<SessionSummary>> {
        self.archive
            .lock()
            .expect("archive lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Aggregate usage analytics over the archive.
    pub fn analytics(&self) -> UsageAnalytics {
        let archive = self.archive.lock().expect("archive lock poisoned");

        let mut outcomes: BTreeMap<&'static str, usize> = BTreeMap::new();
        let mut plugins: BTreeMap<String, PluginUsage> = BTreeMap::new();
        let mut durations: BTreeMap<String, (u64, usize)> = BTreeMap::new();
        let mut invocations = 0usize;
        let mut duplicates_blocked = 0usize;

        for summary in archive.iter() {
            if let Some(outcome) = summary.outcome {
                *outcomes.entry(outcome.as_str()).or_default() += 1;
            }
            for record in &summary.invocations {
                if record.duplicate_blocked {
                    duplicates_blocked += 1;
                    continue;
                }
                invocations += 1;
                let usage = plugins.entry(record.plugin_id.clone()).or_default();
                usage.invocations += 1;
                match record.success {
                    Some(true) => usage.successes += 1,
                    Some(false) => usage.failures += 1,
                    None => {}
                }
                if let Some(ms) = record.duration_ms {
                    let entry = durations.entry(record.plugin_id.clone()).or_default();
                    entry.0 += ms;
                    entry.1 += 1;
                }
            }
        }

        for (plugin, usage) in plugins.iter_mut() {
            if usage.invocations > 0 {
                usage.success_rate = usage.successes as f64 / usage.invocations as f64;
            }
            if let Some((total, count)) = durations.get(plugin) {
                if *count > 0 {
                    usage.average_duration_ms = *total as f64 / *count as f64;
                }
            }
        }

        let mut most_used: Vec<(String, usize)> = plugins
            .iter()
            .map(|(id, usage)| (id.clone(), usage.invocations))
            .collect();
        most_used.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        UsageAnalytics {
            sessions: archive.len(),
            invocations,
            duplicates_blocked,
            outcomes,
            plugins,
            most_used: most_used.into_iter().map(|(id, _)| id).collect(),
        }
    }
}

impl Default for UsageTracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}
