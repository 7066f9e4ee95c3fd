use crate::config::{ID_FIELD, PROGRESS_INTERVAL, TIMESTAMP_FIELD};
use crate::error::ParseError;
use crate::index::IndexService;
use crate::models::{Document, Record};
use crate::rules::RuleSet;
use crate::stats::LoadStats;
use crate::transform::map_record;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

/// What the caller gets back from a load run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadOutcome {
    /// One flag per flushed batch, in flush order.
    pub batch_results: Vec<bool>,
    /// False if any batch, input or the final commit failed.
    pub success: bool,
    /// Written into every document; scopes the linker to this run.
    pub load_timestamp: String,
}

/// Milliseconds since the epoch, as written into `indexTimestamp_str`.
pub fn new_load_timestamp() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    millis.to_string()
}

/// Maps one record and stamps it for this run. `None` when no id can be found.
pub fn to_document(record: &Record, rules: &RuleSet, load_timestamp: &str) -> Option<Document> {
    let mut doc = map_record(record, rules);
    if doc.id().is_none() {
        let id = record.id.clone().or_else(|| record.fallback_id())?;
        doc.set(ID_FIELD, vec![id]);
    }
    doc.set(TIMESTAMP_FIELD, vec![load_timestamp.to_string()]);
    Some(doc)
}

pub struct BatchLoader<'a> {
    rules: &'a RuleSet,
    index: &'a dyn IndexService,
    flush_threshold: usize,
    load_timestamp: String,
    batch: Vec<Record>,
    batch_results: Vec<bool>,
    input_failed: bool,
    stats: LoadStats,
    pb: ProgressBar,
}

impl<'a> BatchLoader<'a> {
    pub fn new(rules: &'a RuleSet, index: &'a dyn IndexService, flush_threshold: usize, load_timestamp: &str) -> Self {
        Self {
            rules,
            index,
            flush_threshold: flush_threshold.max(1),
            load_timestamp: load_timestamp.to_string(),
            batch: Vec::with_capacity(flush_threshold.max(1)),
            batch_results: Vec::new(),
            input_failed: false,
            stats: LoadStats::new(),
            pb: make_spinner("Loading records"),
        }
    }

    pub fn load_timestamp(&self) -> &str {
        &self.load_timestamp
    }

    pub fn stats(&self) -> &LoadStats {
        &self.stats
    }

    /// Adds one record and flushes when the batch is full.
    pub fn push(&mut self, record: Record) {
        self.batch.push(record);
        self.stats.inc_records();
        if self.stats.records() % PROGRESS_INTERVAL == 0 {
            self.pb.set_message(format!("Loading records: {}", self.stats.records()));
        }
        if self.batch.len() >= self.flush_threshold {
            self.flush();
        }
    }

    /// Drains a record stream. A parse error ends this stream; records read so
    /// far stay batched and the run is marked failed.
    pub fn consume<I>(&mut self, records: I)
    where
        I: IntoIterator<Item = Result<Record, ParseError>>,
    {
        for record in records {
            match record {
                Ok(record) => self.push(record),
                Err(e) => {
                    error!(error = %e, "Input unreadable, rest of file skipped");
                    self.input_failed = true;
                    return;
                }
            }
        }
    }

    /// Records malformed elements reported by the reader.
    pub fn note_malformed(&self, count: u64) {
        self.stats.add_malformed(count);
    }

    /// Maps and submits the current batch; a failed submission is logged and the
    /// batch is dropped.
    pub fn flush(&mut self) {
        if self.batch.is_empty() {
            return;
        }
        let batch_no = self.batch_results.len() + 1;
        let records = std::mem::take(&mut self.batch);
        let mut docs = Vec::with_capacity(records.len());
        for record in &records {
            match to_document(record, self.rules, &self.load_timestamp) {
                Some(doc) => docs.push(doc),
                None => {
                    self.stats.inc_without_id();
                    warn!(batch = batch_no, "Record without id skipped");
                }
            }
        }

        let ok = if docs.is_empty() {
            true
        } else {
            match self.index.add(&docs) {
                Ok(()) => {
                    self.stats.add_submitted(docs.len() as u64);
                    debug!(batch = batch_no, docs = docs.len(), "Batch submitted");
                    true
                }
                Err(e) => {
                    self.stats.inc_failed_batches();
                    error!(batch = batch_no, docs = docs.len(), error = %e, "Batch submission failed, batch abandoned");
                    false
                }
            }
        };
        self.stats.inc_batches();
        self.batch_results.push(ok);
        self.pb.tick();
    }

    /// Flushes the remainder and commits.
    pub fn finish(mut self) -> LoadOutcome {
        self.flush();
        let committed = match self.index.commit() {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "Commit after load failed");
                false
            }
        };
        self.pb.finish_and_clear();

        let success = committed && !self.input_failed && self.batch_results.iter().all(|ok| *ok);
        info!(
            timestamp = %self.load_timestamp,
            stats = %self.stats,
            success,
            "Load finished"
        );
        LoadOutcome {
            batch_results: self.batch_results,
            success,
            load_timestamp: self.load_timestamp,
        }
    }
}

/// Loads one record stream end to end.
pub fn load<I>(
    records: I,
    rules: &RuleSet,
    index: &dyn IndexService,
    flush_threshold: usize,
    load_timestamp: &str,
) -> LoadOutcome
where
    I: IntoIterator<Item = Result<Record, ParseError>>,
{
    let mut loader = BatchLoader::new(rules, index, flush_threshold, load_timestamp);
    loader.consume(records);
    loader.finish()
}

pub fn make_spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
        pb.set_style(style);
    }
    pb.enable_steady_tick(Duration::from_millis(100));
    pb.set_message(msg.to_string());
    pb
}
