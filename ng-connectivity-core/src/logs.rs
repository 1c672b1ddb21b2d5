//! Bounded, in-memory log of what happened on one connection.
//!
//! Entries complement the service log: they are scoped to a connection and can be
//! retrieved by operators through the connection status.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogCategory {
    Source,
    Target,
    Response,
    Connection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogType {
    Consumed,
    Mapped,
    Dropped,
    Enriched,
    Filtered,
    Published,
    Acknowledged,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub category: LogCategory,
    pub log_type: LogType,
    pub level: LogLevel,
    pub message: String,
    pub correlation_id: Option<String>,
    pub address: Option<String>,
    pub entity_id: Option<String>,
}

impl LogEntry {
    pub fn success(category: LogCategory, log_type: LogType, message: impl Into<String>) -> Self {
        Self::new(category, log_type, LogLevel::Success, message)
    }

    pub fn failure(category: LogCategory, log_type: LogType, message: impl Into<String>) -> Self {
        Self::new(category, log_type, LogLevel::Failure, message)
    }

    fn new(category: LogCategory, log_type: LogType, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            category,
            log_type,
            level,
            message: message.into(),
            correlation_id: None,
            address: None,
            entity_id: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: Option<&str>) -> Self {
        self.correlation_id = correlation_id.map(String::from);
        self
    }

    pub fn with_address(mut self, address: Option<&str>) -> Self {
        self.address = address.map(String::from);
        self
    }

    pub fn with_entity_id(mut self, entity_id: Option<String>) -> Self {
        self.entity_id = entity_id;
        self
    }
}

/// Ring buffer of [`LogEntry`]; the oldest entry is evicted when full.
#[derive(Debug, Clone)]
pub struct ConnectionLogger {
    capacity: usize,
    entries: Arc<Mutex<VecDeque<LogEntry>>>,
}

impl ConnectionLogger {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.max(1)))),
        }
    }

    pub fn log(&self, entry: LogEntry) {
        let mut entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        let entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.iter().cloned().collect()
    }

    pub fn failures(&self) -> Vec<LogEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.level == LogLevel::Failure)
            .collect()
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_entries() {
        let logger = ConnectionLogger::new(2);
        for i in 0..3 {
            logger.log(LogEntry::success(LogCategory::Source, LogType::Consumed, format!("m{i}")));
        }
        let messages: Vec<_> = logger.entries().into_iter().map(|e| e.message).collect();
        assert_eq!(messages, ["m1", "m2"]);
        logger.log(LogEntry::failure(LogCategory::Target, LogType::Published, "boom").with_address(Some("t/1")));
        assert_eq!(logger.failures().len(), 1);
        assert_eq!(logger.failures()[0].address.as_deref(), Some("t/1"));
    }
}
