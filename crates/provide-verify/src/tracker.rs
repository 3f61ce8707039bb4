//! Classifier and progress tracker.
//!
//! All advertisement bookkeeping lives in one [`ProgressState`] behind one
//! mutex. A record is applied under a single lock acquisition, so readers
//! never observe half of a record.

use crate::identifier::Identifier;
use crate::membership::{Category, MembershipIndex};
use crate::parser::{ProviderRecord, parse_line};
use crate::supervisor::StallDiagnostic;
use crate::tailer::LineBuffer;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Aggregate advertisement state of one run.
#[derive(Debug, Clone, Default)]
pub struct ProgressState {
    root_advertised: HashSet<Identifier>,
    other_advertised: HashSet<Identifier>,
    sentinel_advertised: bool,
    unknown_advertised: BTreeSet<Identifier>,
    /// Times each tracked identifier was advertised.
    advertisement_counts: HashMap<Identifier, u64>,
    total_records: u64,
    malformed_keys: u64,
    newly_advertised: u64,
    observed_prefixes: BTreeSet<String>,
}

/// What one record changed. Rendered as the per-record progress line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordSummary {
    /// 1-based record number.
    pub record_number: u64,
    /// DHT prefix of the record.
    pub prefix: String,
    /// Keys in the payload, including malformed ones.
    pub keys: usize,
    /// Root keys in the record.
    pub root: usize,
    /// Root keys seen for the first time.
    pub new_root: usize,
    /// Other keys in the record.
    pub other: usize,
    /// Sentinel keys in the record.
    pub sentinel: usize,
    /// Unknown keys in the record.
    pub unknown: usize,
    /// Keys that were not valid base64.
    pub malformed: usize,
    /// Distinct roots advertised so far.
    pub root_advertised: usize,
    /// Size of the root universe.
    pub root_total: usize,
}

impl fmt::Display for RecordSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[provide #{}] prefix={} keys={}",
            self.record_number, self.prefix, self.keys
        )?;
        if self.root > 0 {
            write!(f, " root={}(new={})", self.root, self.new_root)?;
        }
        if self.other > 0 {
            write!(f, " other={}", self.other)?;
        }
        if self.sentinel > 0 {
            write!(f, " sentinel={}", self.sentinel)?;
        }
        if self.unknown > 0 {
            write!(f, " unknown={}", self.unknown)?;
        }
        if self.malformed > 0 {
            write!(f, " malformed={}", self.malformed)?;
        }
        write!(
            f,
            "  | root progress: {}/{}",
            self.root_advertised, self.root_total
        )
    }
}

/// Counter-only view of the progress state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    /// Distinct roots advertised.
    pub root_advertised: usize,
    /// Size of the root universe.
    pub root_total: usize,
    /// Distinct other items advertised.
    pub other_advertised: usize,
    /// Number of other items.
    pub other_total: usize,
    /// Whether the sentinel was advertised.
    pub sentinel_advertised: bool,
    /// Distinct unknown identifiers advertised.
    pub unknown: usize,
    /// Provider records observed.
    pub total_records: u64,
}

impl ProgressSnapshot {
    /// Every root has been advertised (and there is at least one).
    pub fn is_complete(&self) -> bool {
        self.root_total > 0 && self.root_advertised >= self.root_total
    }
}

impl fmt::Display for ProgressSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "root={}/{}  other={}/{}  sentinel={}  unknown={}  records={}",
            self.root_advertised,
            self.root_total,
            self.other_advertised,
            self.other_total,
            if self.sentinel_advertised { "yes" } else { "no" },
            self.unknown,
            self.total_records
        )
    }
}

impl ProgressState {
    /// Empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify every key of `record` and fold it into the state.
    pub fn apply(&mut self, index: &MembershipIndex, record: &ProviderRecord) -> RecordSummary {
        let mut summary = RecordSummary {
            prefix: record.prefix.clone(),
            keys: record.key_count(),
            malformed: record.malformed_keys,
            ..Default::default()
        };

        for key in &record.keys {
            let category = index.classify(key);
            let first_seen = match category {
                Category::Root => {
                    summary.root += 1;
                    let inserted = self.root_advertised.insert(key.clone());
                    if inserted {
                        summary.new_root += 1;
                    }
                    inserted
                }
                Category::Other => {
                    summary.other += 1;
                    self.other_advertised.insert(key.clone())
                }
                Category::Sentinel => {
                    summary.sentinel += 1;
                    !std::mem::replace(&mut self.sentinel_advertised, true)
                }
                Category::Unknown => {
                    summary.unknown += 1;
                    self.unknown_advertised.insert(key.clone())
                }
            };
            if first_seen {
                self.newly_advertised += 1;
            }
            if category != Category::Unknown {
                *self.advertisement_counts.entry(key.clone()).or_insert(0) += 1;
            }
        }

        self.malformed_keys += record.malformed_keys as u64;
        self.total_records += 1;
        self.observed_prefixes.insert(record.prefix.clone());

        summary.record_number = self.total_records;
        summary.root_advertised = self.root_advertised.len();
        summary.root_total = index.root_count();
        summary
    }

    /// Counter view.
    pub fn snapshot(&self, index: &MembershipIndex) -> ProgressSnapshot {
        ProgressSnapshot {
            root_advertised: self.root_advertised.len(),
            root_total: index.root_count(),
            other_advertised: self.other_advertised.len(),
            other_total: index.other_count(),
            sentinel_advertised: self.sentinel_advertised,
            unknown: self.unknown_advertised.len(),
            total_records: self.total_records,
        }
    }

    /// Roots not yet advertised.
    pub fn missing_roots<'a>(&self, index: &'a MembershipIndex) -> Vec<&'a Identifier> {
        index
            .root_universe()
            .filter(|id| !self.is_root_advertised(id))
            .collect()
    }

    /// Whether `id` has been advertised as a root.
    pub fn is_root_advertised(&self, id: &Identifier) -> bool {
        self.root_advertised.contains(id)
    }

    /// Distinct roots advertised.
    pub fn root_advertised(&self) -> usize {
        self.root_advertised.len()
    }

    /// Distinct other items advertised.
    pub fn other_advertised(&self) -> usize {
        self.other_advertised.len()
    }

    /// Whether the sentinel was advertised.
    pub fn sentinel_advertised(&self) -> bool {
        self.sentinel_advertised
    }

    /// Unknown identifiers, sorted.
    pub fn unknown_advertised(&self) -> &BTreeSet<Identifier> {
        &self.unknown_advertised
    }

    /// Provider records observed.
    pub fn total_records(&self) -> u64 {
        self.total_records
    }

    /// Keys skipped for bad encoding.
    pub fn malformed_keys(&self) -> u64 {
        self.malformed_keys
    }

    /// First appearances across all categories.
    pub fn newly_advertised(&self) -> u64 {
        self.newly_advertised
    }

    /// Distinct DHT prefixes seen in records.
    pub fn observed_prefixes(&self) -> &BTreeSet<String> {
        &self.observed_prefixes
    }

    /// Times `id` was advertised (tracked identifiers only).
    pub fn advertisement_count(&self, id: &Identifier) -> u64 {
        self.advertisement_counts.get(id).copied().unwrap_or(0)
    }

    /// Advertisement count → number of tracked identifiers advertised that
    /// often. Never-advertised identifiers land under 0.
    pub fn advertisement_distribution(&self, index: &MembershipIndex) -> BTreeMap<u64, usize> {
        let mut distribution = BTreeMap::new();
        for id in index.tracked_identifiers() {
            *distribution.entry(self.advertisement_count(id)).or_insert(0) += 1;
        }
        distribution
    }
}

/// Shared handle to the progress state of one run.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    index: Arc<MembershipIndex>,
    state: Arc<Mutex<ProgressState>>,
}

impl ProgressTracker {
    /// Tracker with empty state.
    pub fn new(index: Arc<MembershipIndex>) -> Self {
        Self {
            index,
            state: Arc::new(Mutex::new(ProgressState::new())),
        }
    }

    /// The membership index.
    pub fn index(&self) -> &MembershipIndex {
        &self.index
    }

    /// Apply one record atomically.
    pub async fn apply(&self, record: &ProviderRecord) -> RecordSummary {
        let mut state = self.state.lock().await;
        state.apply(&self.index, record)
    }

    /// Current counters.
    pub async fn snapshot(&self) -> ProgressSnapshot {
        self.state.lock().await.snapshot(&self.index)
    }

    /// Missing roots grouped by keyspace prefix.
    pub async fn stall_diagnostic(&self, prefix_bits: u8) -> StallDiagnostic {
        let state = self.state.lock().await;
        StallDiagnostic::from_state(&self.index, &state, prefix_bits)
    }

    /// Counters plus the advertisement-count distribution, under one lock.
    pub async fn distribution(&self) -> (ProgressSnapshot, BTreeMap<u64, usize>) {
        let state = self.state.lock().await;
        (
            state.snapshot(&self.index),
            state.advertisement_distribution(&self.index),
        )
    }

    /// Copy of the state for final reporting.
    pub async fn freeze(&self) -> ProgressState {
        self.state.lock().await.clone()
    }
}

/// Scan the diagnostic buffer in order, feeding provider records to `tracker`.
///
/// Ends once the buffer is closed and fully consumed; returns the number of
/// lines scanned.
pub fn spawn_record_monitor(
    buffer: LineBuffer,
    tracker: ProgressTracker,
    marker: String,
    scan_interval: Duration,
) -> JoinHandle<usize> {
    tokio::spawn(async move {
        let mut offset = 0;
        loop {
            let batch = buffer.read_from(offset).await;
            if batch.dropped > 0 {
                warn!(
                    "{} log lines were evicted before they could be scanned",
                    batch.dropped
                );
            }

            for line in &batch.lines {
                if let Some(record) = parse_line(line, &marker) {
                    let summary = tracker.apply(&record).await;
                    info!("  {}", summary);
                }
            }
            offset = batch.next_offset;

            if batch.lines.is_empty() {
                if batch.closed {
                    break;
                }
                tokio::time::sleep(scan_interval).await;
            }
        }
        debug!("Record monitor finished after {} lines", offset);
        offset
    })
}
