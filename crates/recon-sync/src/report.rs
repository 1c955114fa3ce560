//! Per-run report: record outcomes, batch timing and network health.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use recon_core::{Change, InvalidOutcome, RecordOutcome};
use recon_storage::{AttemptObserver, AttemptSample};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const REPORT_TITLE: &str = "DOCCS SYNC REPORT";

const EMPTY_RATE_THRESHOLD: f64 = 0.05;
const CONSECUTIVE_FAILURE_THRESHOLD: u32 = 3;
const SLOW_AVERAGE_MS: f64 = 2000.0;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error(transparent)]
    InvalidOutcome(#[from] InvalidOutcome),
    #[error("serializing report: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordEntry {
    pub identifier: String,
    pub outcome: RecordOutcome,
    pub message: String,
    pub changes: Vec<Change>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchTiming {
    pub batch_index: usize,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub processing_seconds: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingTotals {
    pub total_seconds: f64,
    pub batch_count: usize,
    pub average_seconds: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingTime {
    #[serde(flatten)]
    pub totals: ProcessingTotals,
    pub by_batch: Vec<BatchTiming>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSample {
    pub timestamp: DateTime<Utc>,
    pub duration_ms: f64,
    pub success: bool,
    pub error_type: Option<String>,
    pub is_empty: bool,
    pub retry_attempt: u32,
    pub backoff_delay_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsecutiveFailures {
    pub current: u32,
    pub max: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkTotals {
    pub total_requests: u64,
    pub failed_requests: u64,
    pub empty_responses: u64,
    pub total_request_time_ms: f64,
    pub average_request_time_ms: f64,
    pub errors_by_type: BTreeMap<String, u64>,
    pub consecutive_failures: ConsecutiveFailures,
    /// Attempts that were followed by a backoff and another attempt.
    pub retry_attempts: u64,
    pub total_backoff_ms: u64,
    /// Lookups that succeeded on a second or later attempt.
    pub successful_retries: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkMetrics {
    #[serde(flatten)]
    pub totals: NetworkTotals,
    pub request_times: Vec<RequestSample>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub total: u64,
    pub by_outcome: BTreeMap<RecordOutcome, u64>,
    pub by_field_change: BTreeMap<String, u64>,
    pub processing_time: ProcessingTime,
    pub network_metrics: NetworkMetrics,
}

/// [`Summary`] without the per-batch and per-request series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummarySnapshot {
    pub total: u64,
    pub by_outcome: BTreeMap<RecordOutcome, u64>,
    pub by_field_change: BTreeMap<String, u64>,
    pub processing_time: ProcessingTotals,
    pub network_metrics: NetworkTotals,
}

/// Nearest-rank latency percentiles in milliseconds (sorted index, no interpolation).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Percentiles {
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

impl Percentiles {
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let mut sorted = samples.to_vec();
        sorted.sort_by(f64::total_cmp);
        let at = |p: f64| {
            let idx = ((sorted.len() as f64) * p).floor() as usize;
            sorted[idx.min(sorted.len() - 1)]
        };
        Some(Self {
            p50: at(0.5),
            p75: at(0.75),
            p90: at(0.9),
            p95: at(0.95),
            p99: at(0.99),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkAnalysis {
    #[serde(flatten)]
    pub metrics: NetworkTotals,
    pub failure_rate: f64,
    pub empty_response_rate: f64,
    pub request_time_percentiles: Option<Percentiles>,
    pub recommendations: Vec<String>,
}

/// One run's report. Build a fresh one per run; nothing here is global.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Report {
    /// Keyed by store record id.
    pub records: BTreeMap<String, RecordEntry>,
    pub summary: Summary,
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one record's terminal outcome.
    ///
    /// Call at most once per record: a second call replaces the entry but the
    /// summary counters are incremented again.
    pub fn add_record(
        &mut self,
        record_id: &str,
        identifier: &str,
        outcome: RecordOutcome,
        message: impl Into<String>,
        changes: Vec<Change>,
    ) {
        self.summary.total += 1;
        *self.summary.by_outcome.entry(outcome).or_default() += 1;
        if outcome == RecordOutcome::Changed {
            for change in &changes {
                *self.summary.by_field_change.entry(change.field.clone()).or_default() += 1;
            }
        }
        self.records.insert(
            record_id.to_string(),
            RecordEntry {
                identifier: identifier.to_string(),
                outcome,
                message: message.into(),
                changes,
                timestamp: Utc::now(),
            },
        );
    }

    /// Same as [`Report::add_record`] with the outcome given by its wire name.
    pub fn add_record_named(
        &mut self,
        record_id: &str,
        identifier: &str,
        outcome: &str,
        message: impl Into<String>,
        changes: Vec<Change>,
    ) -> Result<(), ReportError> {
        let outcome = outcome.parse::<RecordOutcome>()?;
        self.add_record(record_id, identifier, outcome, message, changes);
        Ok(())
    }

    pub fn add_batch_time(&mut self, batch_index: usize, start: DateTime<Utc>, end: DateTime<Utc>) {
        let processing_seconds = (end - start).num_milliseconds() as f64 / 1000.0;
        let time = &mut self.summary.processing_time;
        time.totals.total_seconds += processing_seconds;
        time.totals.batch_count += 1;
        time.totals.average_seconds = time.totals.total_seconds / time.totals.batch_count as f64;
        time.by_batch.push(BatchTiming {
            batch_index,
            start_time: start,
            end_time: end,
            processing_seconds,
        });
    }

    pub fn add_network_metric(&mut self, sample: &AttemptSample) {
        let metrics = &mut self.summary.network_metrics;
        let totals = &mut metrics.totals;
        let duration_ms = sample.duration.as_secs_f64() * 1000.0;
        let backoff_delay_ms = sample.backoff_delay.as_millis() as u64;

        totals.total_requests += 1;
        totals.total_request_time_ms += duration_ms;
        totals.average_request_time_ms = totals.total_request_time_ms / totals.total_requests as f64;

        if backoff_delay_ms > 0 {
            totals.retry_attempts += 1;
            totals.total_backoff_ms += backoff_delay_ms;
        }

        if sample.success {
            if sample.attempt > 1 {
                totals.successful_retries += 1;
            }
            totals.consecutive_failures.current = 0;
        } else {
            totals.failed_requests += 1;
            let streak = &mut totals.consecutive_failures;
            streak.current += 1;
            streak.max = streak.max.max(streak.current);
            if let Some(error_type) = &sample.error_type {
                *totals.errors_by_type.entry(error_type.clone()).or_default() += 1;
            }
        }

        if sample.is_empty {
            totals.empty_responses += 1;
        }

        metrics.request_times.push(RequestSample {
            timestamp: Utc::now(),
            duration_ms,
            success: sample.success,
            error_type: sample.error_type.clone(),
            is_empty: sample.is_empty,
            retry_attempt: sample.attempt,
            backoff_delay_ms,
        });
    }

    pub fn records_by_outcome(&self, outcome: RecordOutcome) -> Vec<&RecordEntry> {
        self.records.values().filter(|r| r.outcome == outcome).collect()
    }

    pub fn records_by_field_change(&self, field: &str) -> Vec<&RecordEntry> {
        self.records
            .values()
            .filter(|r| r.changes.iter().any(|c| c.field == field))
            .collect()
    }

    pub fn summary(&self) -> SummarySnapshot {
        SummarySnapshot {
            total: self.summary.total,
            by_outcome: self.summary.by_outcome.clone(),
            by_field_change: self.summary.by_field_change.clone(),
            processing_time: self.summary.processing_time.totals.clone(),
            network_metrics: self.summary.network_metrics.totals.clone(),
        }
    }

    pub fn network_analysis(&self) -> NetworkAnalysis {
        let metrics = &self.summary.network_metrics;
        let totals = &metrics.totals;
        let rate = |n: u64| {
            if totals.total_requests == 0 {
                0.0
            } else {
                n as f64 / totals.total_requests as f64
            }
        };
        let empty_response_rate = rate(totals.empty_responses);

        let mut recommendations = Vec::new();
        if empty_response_rate > EMPTY_RATE_THRESHOLD {
            recommendations.push(
                "High rate of empty responses - consider increasing delay between requests".to_string(),
            );
        }
        if totals.consecutive_failures.max > CONSECUTIVE_FAILURE_THRESHOLD {
            recommendations
                .push("Consider implementing exponential backoff due to consecutive failures".to_string());
        }
        if totals.average_request_time_ms > SLOW_AVERAGE_MS {
            recommendations.push(
                "High average request time detected - may need to reduce concurrent requests".to_string(),
            );
        }

        let durations = metrics.request_times.iter().map(|s| s.duration_ms).collect::<Vec<_>>();
        NetworkAnalysis {
            metrics: totals.clone(),
            failure_rate: rate(totals.failed_requests),
            empty_response_rate,
            request_time_percentiles: Percentiles::from_samples(&durations),
            recommendations,
        }
    }

    /// Changes whose field passes `keep`, as `(identifier, change)` pairs.
    pub fn changes_where(&self, keep: impl Fn(&str) -> bool) -> Vec<(&str, &Change)> {
        self.records_by_outcome(RecordOutcome::Changed)
            .into_iter()
            .flat_map(|r| r.changes.iter().map(move |c| (r.identifier.as_str(), c)))
            .filter(|(_, c)| keep(&c.field))
            .collect()
    }

    /// Machine-readable form: records, full summary and network analysis.
    pub fn to_json(&self) -> Result<Value, ReportError> {
        Ok(serde_json::json!({
            "records": serde_json::to_value(&self.records)?,
            "summary": serde_json::to_value(&self.summary)?,
            "network_analysis": serde_json::to_value(self.network_analysis())?,
        }))
    }

    /// Plain-text staff report. Output depends only on the report and `now`.
    pub fn render_text(&self, now: DateTime<Utc>) -> String {
        let summary = self.summary();
        let mut out = String::new();

        let _ = writeln!(out, "{REPORT_TITLE}");
        let _ = writeln!(out, "{}", now.format("%B %-d, %Y %H:%M UTC"));
        out.push('\n');

        out.push_str("SUMMARY\n");
        let _ = writeln!(out, "- Total Records: {}", summary.total);
        out.push_str("- By Outcome:\n");
        for (outcome, count) in &summary.by_outcome {
            let _ = writeln!(out, "    - {outcome}: {count}");
        }
        if !summary.by_field_change.is_empty() {
            out.push_str("- By Field Change:\n");
            for (field, count) in &summary.by_field_change {
                let _ = writeln!(out, "    - {field}: {count}");
            }
        }
        out.push('\n');

        let changed = self.records_by_outcome(RecordOutcome::Changed);
        if !changed.is_empty() {
            out.push_str("CHANGED\n");
            let mut by_field: BTreeMap<&str, Vec<(&str, &Change)>> = BTreeMap::new();
            for record in &changed {
                for change in &record.changes {
                    by_field
                        .entry(change.field.as_str())
                        .or_default()
                        .push((record.identifier.as_str(), change));
                }
            }
            for (field, changes) in by_field {
                let _ = writeln!(out, "Field: {field}");
                for (identifier, change) in changes {
                    let _ = writeln!(
                        out,
                        "- {identifier}: {}, previously {}",
                        display_value(&change.new_value),
                        display_value(&change.old_value)
                    );
                }
                out.push('\n');
            }
        }

        for outcome in RecordOutcome::ALL {
            if outcome == RecordOutcome::Changed {
                continue;
            }
            let records = self.records_by_outcome(outcome);
            if records.is_empty() {
                continue;
            }
            let _ = writeln!(out, "{outcome}");
            let identifiers = records.iter().map(|r| r.identifier.as_str()).collect::<Vec<_>>();
            let _ = writeln!(out, "{}", identifiers.join(", "));
            out.push('\n');
        }

        out
    }
}

pub fn display_value(value: &Value) -> String {
    match value {
        Value::Null => "(empty)".to_string(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(display_value).collect::<Vec<_>>().join(", "),
        other => other.to_string(),
    }
}

/// Report shared by the in-flight reconciliations of a batch.
#[derive(Debug, Clone, Default)]
pub struct SharedReport(Arc<Mutex<Report>>);

impl SharedReport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Report> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut Report) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn snapshot(&self) -> Report {
        self.lock().clone()
    }
}

impl AttemptObserver for SharedReport {
    fn observe(&self, sample: AttemptSample) {
        self.lock().add_network_metric(&sample);
    }
}
