//! Fixed-size batches, concurrent within a batch, strictly sequential across batches.

use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use recon_core::{RecordOutcome, StoredRecord};
use tracing::{error, info, info_span, Instrument};

use crate::engine::Reconciler;
use crate::report::SharedReport;

/// Contiguous `[start, end)` slices of at most `batch_size` covering `0..total`.
pub fn batch_ranges(total: usize, batch_size: usize) -> Vec<Range<usize>> {
    let size = batch_size.max(1);
    (0..total)
        .step_by(size)
        .map(|start| start..(start + size).min(total))
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchRunStats {
    pub batches: usize,
    pub records: usize,
}

/// Reconcile `records` batch by batch into `report`.
///
/// Every record of a batch finishes before the next batch starts, and
/// `batch_delay` is slept between batches but not after the last one.
pub async fn run_batches(
    reconciler: Arc<Reconciler>,
    records: Vec<StoredRecord>,
    batch_size: usize,
    batch_delay: Duration,
    report: &SharedReport,
) -> BatchRunStats {
    let total = records.len();
    let ranges = batch_ranges(total, batch_size);
    let batch_count = ranges.len();
    let records = Arc::new(records);

    for (batch_index, range) in ranges.into_iter().enumerate() {
        let span = info_span!("batch", batch_index);
        let started = Utc::now();
        info!(parent: &span, batch_index, start = range.start, size = range.len(), "processing batch");

        let mut handles = Vec::with_capacity(range.len());
        for index in range {
            let reconciler = Arc::clone(&reconciler);
            let records = Arc::clone(&records);
            let report = report.clone();
            let handle = tokio::spawn(
                async move {
                    let record = &records[index];
                    info!(
                        identifier = %reconciler.identifier_of(record),
                        progress = %format!("{}/{}", index + 1, total),
                        "processing identifier"
                    );
                    reconciler.reconcile(record, &report).await
                }
                .instrument(span.clone()),
            );
            handles.push((index, handle));
        }

        for (index, handle) in handles {
            if let Err(join_error) = handle.await {
                let record = &records[index];
                let identifier = reconciler.identifier_of(record);
                error!(record_id = %record.id, %identifier, error = %join_error, "record task aborted");
                report.with(|r| {
                    r.add_record(
                        &record.id,
                        &identifier,
                        RecordOutcome::ProcessingError,
                        format!("processing aborted: {join_error}"),
                        Vec::new(),
                    )
                });
            }
        }

        let finished = Utc::now();
        report.with(|r| r.add_batch_time(batch_index, started, finished));
        info!(
            parent: &span,
            batch_index,
            seconds = (finished - started).num_milliseconds() as f64 / 1000.0,
            "batch complete"
        );

        if batch_index + 1 < batch_count && !batch_delay.is_zero() {
            info!(delay_ms = batch_delay.as_millis() as u64, "pausing before next batch");
            tokio::time::sleep(batch_delay).await;
        }
    }

    BatchRunStats {
        batches: batch_count,
        records: total,
    }
}
