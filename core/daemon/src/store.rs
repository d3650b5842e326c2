//! Bounded in-memory event history with a best-effort JSONL journal.
//!
//! The ring is the source of truth for queries; the journal is an
//! append-only convenience for offline inspection. Journal failures never
//! surface to producers, they are counted for `/health` and warned about
//! at a bounded rate.

use beacon_protocol::Envelope;
use chrono::{DateTime, Utc};
use fs_err as fs;
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::warn;

const JOURNAL_MAX_BYTES: u64 = 10 * 1024 * 1024;
const JOURNAL_KEEP: u32 = 5;
const PERSIST_WARN_INTERVAL: Duration = Duration::from_secs(30);

pub const DEFAULT_CAPACITY: usize = 1000;

/// Composable filters for [`EventStore::query`]. Filters apply in order:
/// type, then strict `timestamp > since`, then the trailing `limit`.
#[derive(Debug, Default, Clone)]
pub struct QueryFilter {
    pub event_type: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

pub struct EventStore {
    slots: Vec<Envelope>,
    cursor: usize,
    capacity: usize,
    journal: Option<Journal>,
    persist_errors: u64,
    last_persist_warn: Option<Instant>,
}

impl EventStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            cursor: 0,
            capacity: capacity.max(1),
            journal: None,
            persist_errors: 0,
            last_persist_warn: None,
        }
    }

    pub fn with_journal(capacity: usize, path: PathBuf) -> Self {
        let mut store = Self::new(capacity);
        store.journal = Some(Journal::new(path, JOURNAL_MAX_BYTES));
        store
    }

    /// Insert at the write cursor, evicting the single oldest entry once
    /// at capacity, then append to the journal if one is configured.
    pub fn push(&mut self, envelope: Envelope) {
        if self.slots.len() < self.capacity {
            self.slots.push(envelope.clone());
        } else {
            self.slots[self.cursor] = envelope.clone();
        }
        self.cursor = (self.cursor + 1) % self.capacity;

        if let Some(journal) = &self.journal {
            if let Err(err) = journal.append(&envelope) {
                self.persist_errors += 1;
                let due = self
                    .last_persist_warn
                    .map(|at| at.elapsed() >= PERSIST_WARN_INTERVAL)
                    .unwrap_or(true);
                if due {
                    warn!(
                        error = %err,
                        persist_errors = self.persist_errors,
                        "Failed to append event to journal"
                    );
                    self.last_persist_warn = Some(Instant::now());
                }
            }
        }
    }

    /// Chronologically ordered slice of history matching the filter.
    pub fn query(&self, filter: &QueryFilter) -> Vec<Envelope> {
        if let Some(limit) = filter.limit {
            if limit <= 0 {
                return Vec::new();
            }
        }

        let matching: Vec<&Envelope> = self
            .iter_chronological()
            .filter(|envelope| match filter.event_type.as_deref() {
                Some(event_type) => envelope.event_type == event_type,
                None => true,
            })
            .filter(|envelope| match filter.since {
                Some(since) => envelope
                    .timestamp_utc()
                    .map(|ts| ts > since)
                    .unwrap_or(false),
                None => true,
            })
            .collect();

        let skip = match filter.limit {
            Some(limit) => matching.len().saturating_sub(limit as usize),
            None => 0,
        };
        matching.into_iter().skip(skip).cloned().collect()
    }

    /// The newest `n` envelopes in chronological order.
    pub fn last(&self, n: usize) -> Vec<Envelope> {
        let skip = self.slots.len().saturating_sub(n);
        self.iter_chronological().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn type_counts(&self) -> HashMap<String, u64> {
        let mut counts = HashMap::new();
        for envelope in self.iter_chronological() {
            *counts.entry(envelope.event_type.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Distinct event types currently retained, sorted.
    pub fn distinct_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .type_counts()
            .into_keys()
            .collect();
        types.sort();
        types
    }

    /// Distinct app labels currently retained, sorted.
    pub fn distinct_apps(&self) -> Vec<String> {
        let mut apps: Vec<String> = self
            .iter_chronological()
            .map(|envelope| envelope.app.clone())
            .collect();
        apps.sort();
        apps.dedup();
        apps
    }

    pub fn persist_errors(&self) -> u64 {
        self.persist_errors
    }

    fn iter_chronological(&self) -> impl Iterator<Item = &Envelope> {
        let split = if self.slots.len() < self.capacity {
            0
        } else {
            self.cursor
        };
        self.slots[split..].iter().chain(self.slots[..split].iter())
    }
}

/// Append-only JSONL file with size-based rotation. Rotation failures are
/// absorbed; the journal keeps appending until the next threshold.
struct Journal {
    path: PathBuf,
    max_bytes: u64,
}

impl Journal {
    fn new(path: PathBuf, max_bytes: u64) -> Self {
        Self { path, max_bytes }
    }

    fn append(&self, envelope: &Envelope) -> Result<(), String> {
        self.rotate_if_needed();

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| format!("failed to create journal directory: {}", err))?;
        }

        let line = serde_json::to_string(envelope)
            .map_err(|err| format!("failed to serialize envelope: {}", err))?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| format!("failed to open journal: {}", err))?;
        file.write_all(line.as_bytes())
            .and_then(|_| file.write_all(b"\n"))
            .map_err(|err| format!("failed to append to journal: {}", err))
    }

    fn rotate_if_needed(&self) {
        let size = fs::metadata(&self.path).map(|meta| meta.len()).unwrap_or(0);
        if size < self.max_bytes {
            return;
        }

        let _ = fs::remove_file(self.rotated(JOURNAL_KEEP));
        for index in (1..JOURNAL_KEEP).rev() {
            let _ = fs::rename(self.rotated(index), self.rotated(index + 1));
        }
        let _ = fs::rename(&self.path, self.rotated(1));
    }

    fn rotated(&self, index: u32) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(format!(".{}", index));
        PathBuf::from(name)
    }
}
