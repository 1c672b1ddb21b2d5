use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    RwLock,
};

/// Per-connection message counters.
///
/// All counters are lock-free; only the "last" timestamps take a short write lock.
#[derive(Debug, Default)]
pub struct ConnectionMetrics {
    /// Messages consumed from sources
    pub consumed: AtomicU64,
    /// Signals produced by inbound mapping
    pub mapped: AtomicU64,
    /// Mapper invocations that produced nothing (blocked, condition false or empty)
    pub dropped: AtomicU64,
    /// Mapper invocations that failed
    pub mapping_errors: AtomicU64,
    /// Outbound messages dropped by a topic filter
    pub filtered: AtomicU64,
    /// Successful extra-field lookups
    pub enriched: AtomicU64,
    pub enrichment_failures: AtomicU64,
    pub published: AtomicU64,
    pub publish_failures: AtomicU64,
    pub acks_positive: AtomicU64,
    pub acks_negative: AtomicU64,
    pub last_consumed: RwLock<Option<DateTime<Utc>>>,
    pub last_published: RwLock<Option<DateTime<Utc>>>,
    pub last_error: RwLock<Option<DateTime<Utc>>>,
}

fn touch(slot: &RwLock<Option<DateTime<Utc>>>) {
    if let Ok(mut guard) = slot.write() {
        *guard = Some(Utc::now());
    }
}

fn read(slot: &RwLock<Option<DateTime<Utc>>>) -> Option<DateTime<Utc>> {
    slot.read().ok().and_then(|guard| *guard)
}

impl ConnectionMetrics {
    #[inline]
    pub fn increment_consumed(&self) {
        self.consumed.fetch_add(1, Ordering::Relaxed);
        touch(&self.last_consumed);
    }

    #[inline]
    pub fn increment_mapped(&self) {
        self.mapped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn increment_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn increment_mapping_errors(&self) {
        self.mapping_errors.fetch_add(1, Ordering::Relaxed);
        touch(&self.last_error);
    }

    #[inline]
    pub fn increment_filtered(&self) {
        self.filtered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn increment_enriched(&self) {
        self.enriched.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn increment_enrichment_failures(&self) {
        self.enrichment_failures.fetch_add(1, Ordering::Relaxed);
        touch(&self.last_error);
    }

    #[inline]
    pub fn increment_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
        touch(&self.last_published);
    }

    #[inline]
    pub fn increment_publish_failures(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
        touch(&self.last_error);
    }

    #[inline]
    pub fn record_ack(&self, success: bool) {
        if success {
            self.acks_positive.fetch_add(1, Ordering::Relaxed);
        } else {
            self.acks_negative.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> ConnectionMetricsSnapshot {
        ConnectionMetricsSnapshot {
            consumed: self.consumed.load(Ordering::Relaxed),
            mapped: self.mapped.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            mapping_errors: self.mapping_errors.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            enriched: self.enriched.load(Ordering::Relaxed),
            enrichment_failures: self.enrichment_failures.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            acks_positive: self.acks_positive.load(Ordering::Relaxed),
            acks_negative: self.acks_negative.load(Ordering::Relaxed),
            last_consumed: read(&self.last_consumed),
            last_published: read(&self.last_published),
            last_error: read(&self.last_error),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionMetricsSnapshot {
    pub consumed: u64,
    pub mapped: u64,
    pub dropped: u64,
    pub mapping_errors: u64,
    pub filtered: u64,
    pub enriched: u64,
    pub enrichment_failures: u64,
    pub published: u64,
    pub publish_failures: u64,
    pub acks_positive: u64,
    pub acks_negative: u64,
    pub last_consumed: Option<DateTime<Utc>>,
    pub last_published: Option<DateTime<Utc>>,
    pub last_error: Option<DateTime<Utc>>,
}

impl ConnectionMetricsSnapshot {
    /// Sums counters of several client replicas.
    pub fn merge(mut self, other: &ConnectionMetricsSnapshot) -> Self {
        self.consumed += other.consumed;
        self.mapped += other.mapped;
        self.dropped += other.dropped;
        self.mapping_errors += other.mapping_errors;
        self.filtered += other.filtered;
        self.enriched += other.enriched;
        self.enrichment_failures += other.enrichment_failures;
        self.published += other.published;
        self.publish_failures += other.publish_failures;
        self.acks_positive += other.acks_positive;
        self.acks_negative += other.acks_negative;
        self.last_consumed = self.last_consumed.max(other.last_consumed);
        self.last_published = self.last_published.max(other.last_published);
        self.last_error = self.last_error.max(other.last_error);
        self
    }
}
