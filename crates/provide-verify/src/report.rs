//! Final reconciliation report.

use crate::membership::MembershipIndex;
use crate::tracker::ProgressState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every root item was advertised.
    Complete,
    /// The node exited first.
    NodeExited {
        /// Exit status description.
        exit: String,
    },
    /// Interrupted by the user.
    Cancelled,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Complete => write!(f, "complete"),
            Self::NodeExited { exit } => write!(f, "node exited ({exit})"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Advertised/total pair for one category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryCount {
    /// Distinct identifiers advertised.
    pub advertised: usize,
    /// Identifiers in the category.
    pub total: usize,
}

impl fmt::Display for CategoryCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.advertised, self.total)
    }
}

/// Summary of one verification run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationReport {
    /// Unique run id.
    pub run_id: Uuid,
    /// When monitoring started.
    pub started_at: DateTime<Utc>,
    /// Time from monitoring start to report.
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    /// How the run ended.
    pub outcome: RunOutcome,
    /// Root items.
    pub root: CategoryCount,
    /// Other local items.
    pub other: CategoryCount,
    /// Whether a sentinel was tracked.
    pub sentinel_tracked: bool,
    /// Whether the sentinel was advertised.
    pub sentinel_advertised: bool,
    /// Advertised identifiers outside every known category, hex, sorted.
    pub unknown: Vec<String>,
    /// Provider records observed.
    pub total_records: u64,
    /// Keys that failed to decode.
    pub malformed_keys: u64,
    /// Distinct DHT prefixes observed.
    pub observed_prefixes: usize,
    /// Advertisement count → number of tracked identifiers advertised that often.
    pub advertisement_distribution: BTreeMap<u64, usize>,
}

impl VerificationReport {
    /// Freeze `state` into a report.
    #[must_use]
    pub fn from_state(
        index: &MembershipIndex,
        state: &ProgressState,
        outcome: RunOutcome,
        started_at: DateTime<Utc>,
        elapsed: Duration,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at,
            elapsed,
            outcome,
            root: CategoryCount {
                advertised: state.root_advertised(),
                total: index.root_count(),
            },
            other: CategoryCount {
                advertised: state.other_advertised(),
                total: index.other_count(),
            },
            sentinel_tracked: index.has_sentinel(),
            sentinel_advertised: state.sentinel_advertised(),
            // BTreeSet iteration is already sorted by bytes, which matches hex order.
            unknown: state.unknown_advertised().iter().map(|id| id.to_hex()).collect(),
            total_records: state.total_records(),
            malformed_keys: state.malformed_keys(),
            observed_prefixes: state.observed_prefixes().len(),
            advertisement_distribution: state.advertisement_distribution(index),
        }
    }

    /// Every root item was advertised.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.root.total > 0 && self.root.advertised >= self.root.total
    }

    /// Unknown identifiers were advertised.
    #[must_use]
    pub fn has_anomalies(&self) -> bool {
        !self.unknown.is_empty()
    }
}

impl fmt::Display for VerificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Provide verification report ===")?;
        writeln!(f, "Run:        {}", self.run_id)?;
        writeln!(f, "Started:    {}", self.started_at.format("%Y-%m-%d %H:%M:%S UTC"))?;
        writeln!(f, "Elapsed:    {}s", self.elapsed.as_secs())?;
        writeln!(f, "Outcome:    {}", self.outcome)?;
        writeln!(f, "Records:    {} ({} DHT prefixes)", self.total_records, self.observed_prefixes)?;
        writeln!(f)?;
        writeln!(f, "  root:     {}", self.root)?;
        writeln!(f, "  other:    {}", self.other)?;
        if self.sentinel_tracked {
            writeln!(
                f,
                "  sentinel: {}",
                if self.sentinel_advertised { "advertised" } else { "not advertised" }
            )?;
        }
        writeln!(f, "  unknown:  {}", self.unknown.len())?;
        if self.malformed_keys > 0 {
            writeln!(f, "  malformed keys: {}", self.malformed_keys)?;
        }

        if !self.advertisement_distribution.is_empty() {
            writeln!(f)?;
            writeln!(f, "Advertisements per tracked item:")?;
            for (times, items) in &self.advertisement_distribution {
                writeln!(f, "  {times:>4}x  {items}")?;
            }
        }

        if self.has_anomalies() {
            writeln!(f)?;
            writeln!(
                f,
                "ANOMALY: {} advertised identifiers are not held locally:",
                self.unknown.len()
            )?;
            for hex in &self.unknown {
                writeln!(f, "  {hex}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::Identifier;
    use crate::parser::ProviderRecord;

    fn id(byte: u8) -> Identifier {
        Identifier::from_bytes(vec![0x12, 0x20, byte])
    }

    fn record(keys: &[Identifier]) -> ProviderRecord {
        ProviderRecord {
            prefix: "01".to_string(),
            keys: keys.to_vec(),
            malformed_keys: 0,
        }
    }

    fn index() -> MembershipIndex {
        MembershipIndex::build(
            vec![(id(1), "a".to_string()), (id(2), "b".to_string())],
            vec![id(1), id(2), id(3)],
            Some(id(9)),
        )
    }

    #[test]
    fn test_unknown_keys_are_listed_sorted() {
        let index = index();
        let mut state = ProgressState::new();
        state.apply(&index, &record(&[id(1), id(0x50), id(0x40)]));

        let report = VerificationReport::from_state(
            &index,
            &state,
            RunOutcome::Cancelled,
            Utc::now(),
            Duration::from_secs(3),
        );

        assert!(report.has_anomalies());
        assert_eq!(report.unknown, vec![id(0x40).to_hex(), id(0x50).to_hex()]);
        assert_eq!(report.root, CategoryCount { advertised: 1, total: 2 });
        assert!(!report.is_complete());

        let text = report.to_string();
        assert!(text.contains("ANOMALY: 2 advertised identifiers"));
        assert!(text.contains(&id(0x40).to_hex()));
    }

    #[test]
    fn test_complete_run_without_anomalies() {
        let index = index();
        let mut state = ProgressState::new();
        state.apply(&index, &record(&[id(1), id(2), id(3), id(9)]));
        state.apply(&index, &record(&[id(1)]));

        let report = VerificationReport::from_state(
            &index,
            &state,
            RunOutcome::Complete,
            Utc::now(),
            Duration::from_secs(42),
        );

        assert!(report.is_complete());
        assert!(!report.has_anomalies());
        assert!(report.sentinel_advertised);
        assert_eq!(report.other, CategoryCount { advertised: 1, total: 1 });
        assert_eq!(report.total_records, 2);
        assert_eq!(report.observed_prefixes, 1);
        // id(1) twice; id(2), id(3), id(9) once
        assert_eq!(
            report.advertisement_distribution,
            BTreeMap::from([(1, 3), (2, 1)])
        );
        assert!(!report.to_string().contains("ANOMALY"));
    }

    #[test]
    fn test_json_rendering() {
        let index = index();
        let report = VerificationReport::from_state(
            &index,
            &ProgressState::new(),
            RunOutcome::NodeExited {
                exit: "exit status: 1".to_string(),
            },
            Utc::now(),
            Duration::from_millis(1500),
        );

        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["outcome"]["kind"], "node_exited");
        assert_eq!(value["root"]["total"], 2);
        assert_eq!(value["elapsed"], "1s 500ms");
        assert_eq!(value["advertisement_distribution"]["0"], 4);
    }
}
