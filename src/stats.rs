use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters collected while loading records
#[derive(Debug, Default)]
pub struct LoadStats {
    pub records_parsed: AtomicU64,
    pub malformed_skipped: AtomicU64,
    pub docs_submitted: AtomicU64,
    pub docs_without_id: AtomicU64,
    pub batches_flushed: AtomicU64,
    pub batches_failed: AtomicU64,
}

impl LoadStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_records(&self) {
        self.records_parsed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_malformed(&self, count: u64) {
        self.malformed_skipped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_submitted(&self, count: u64) {
        self.docs_submitted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_without_id(&self) {
        self.docs_without_id.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_batches(&self) {
        self.batches_flushed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failed_batches(&self) {
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn records(&self) -> u64 {
        self.records_parsed.load(Ordering::Relaxed)
    }

    pub fn malformed(&self) -> u64 {
        self.malformed_skipped.load(Ordering::Relaxed)
    }

    pub fn submitted(&self) -> u64 {
        self.docs_submitted.load(Ordering::Relaxed)
    }

    pub fn without_id(&self) -> u64 {
        self.docs_without_id.load(Ordering::Relaxed)
    }

    pub fn batches(&self) -> u64 {
        self.batches_flushed.load(Ordering::Relaxed)
    }

    pub fn failed_batches(&self) -> u64 {
        self.batches_failed.load(Ordering::Relaxed)
    }
}

impl fmt::Display for LoadStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} records, {} documents submitted in {} batches ({} failed), {} without id, {} malformed elements",
            self.records(),
            self.submitted(),
            self.batches(),
            self.failed_batches(),
            self.without_id(),
            self.malformed()
        )
    }
}

/// Counters collected while linking
#[derive(Debug, Default)]
pub struct LinkStats {
    pub docs_scanned: AtomicU64,
    pub link_docs_written: AtomicU64,
    pub parents_missing: AtomicU64,
    pub phases_failed: AtomicU64,
}

impl LinkStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_scanned(&self, count: u64) {
        self.docs_scanned.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_written(&self, count: u64) {
        self.link_docs_written.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_parents_missing(&self) {
        self.parents_missing.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failed_phases(&self) {
        self.phases_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn scanned(&self) -> u64 {
        self.docs_scanned.load(Ordering::Relaxed)
    }

    pub fn written(&self) -> u64 {
        self.link_docs_written.load(Ordering::Relaxed)
    }

    pub fn parents_missing(&self) -> u64 {
        self.parents_missing.load(Ordering::Relaxed)
    }

    pub fn failed_phases(&self) -> u64 {
        self.phases_failed.load(Ordering::Relaxed)
    }
}

impl fmt::Display for LinkStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} documents scanned, {} updates written, {} parents not found, {} phases failed",
            self.scanned(),
            self.written(),
            self.parents_missing(),
            self.failed_phases()
        )
    }
}
