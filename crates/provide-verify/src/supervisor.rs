//! Stall supervisor.
//!
//! Polls the tracker at a fixed cadence and drives a three-state machine:
//!
//! ```text
//!            progress                 all roots advertised
//!   ┌──────────────────────┐      ┌─────────────────────────┐
//!   ▼                      │      │                         ▼
//! WAITING ── no progress ─► STALLED                      COMPLETE
//!   │      for threshold                                    ▲
//!   └───────────────────────────────────────────────────────┘
//! ```
//!
//! Entering `STALLED` emits one diagnostic of the missing roots grouped by
//! keyspace prefix. A stall never ends the run.
//!
//! After `COMPLETE`, [`keep_monitoring`] can keep sampling to show how often
//! each tracked item gets re-advertised.

use crate::config::VerifierConfig;
use crate::daemon::{NodeExit, wait_exit};
use crate::identifier::{Identifier, KadId, format_prefix};
use crate::membership::MembershipIndex;
use crate::tracker::{ProgressSnapshot, ProgressState, ProgressTracker};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{info, warn};

/// Supervisor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Progress is being made, or the stall threshold has not elapsed yet.
    Waiting,
    /// No new root advertisement for longer than the threshold.
    Stalled,
    /// Every root has been advertised.
    Complete,
}

/// Result of one poll tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// No change worth reporting.
    Idle,
    /// New roots were advertised since the previous tick.
    Progressed {
        /// Distinct roots advertised now.
        advertised: usize,
        /// The progress ended a stall episode.
        recovered: bool,
    },
    /// A stall episode started on this tick.
    Stalled,
    /// Every root has been advertised.
    Complete,
}

/// Pure stall-detection state machine.
#[derive(Debug, Clone)]
pub struct StallSupervisor {
    state: SupervisorState,
    root_total: usize,
    stall_threshold: Duration,
    last_progress_count: usize,
    last_progress_at: Instant,
    stall_episodes: usize,
}

impl StallSupervisor {
    /// Start in `Waiting` at `start`.
    pub fn new(root_total: usize, stall_threshold: Duration, start: Instant) -> Self {
        Self {
            state: SupervisorState::Waiting,
            root_total,
            stall_threshold,
            last_progress_count: 0,
            last_progress_at: start,
            stall_episodes: 0,
        }
    }

    /// Current state.
    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Number of stall episodes entered so far.
    pub fn stall_episodes(&self) -> usize {
        self.stall_episodes
    }

    /// Advance the machine with the current root count.
    pub fn tick(&mut self, advertised: usize, now: Instant) -> TickOutcome {
        if self.state == SupervisorState::Complete {
            return TickOutcome::Complete;
        }

        let mut outcome = TickOutcome::Idle;
        if advertised > self.last_progress_count {
            self.last_progress_count = advertised;
            self.last_progress_at = now;
            let recovered = self.state == SupervisorState::Stalled;
            self.state = SupervisorState::Waiting;
            outcome = TickOutcome::Progressed {
                advertised,
                recovered,
            };
        }

        if self.root_total > 0 && advertised >= self.root_total {
            self.state = SupervisorState::Complete;
            return TickOutcome::Complete;
        }

        if self.state != SupervisorState::Stalled
            && now.saturating_duration_since(self.last_progress_at) > self.stall_threshold
        {
            self.state = SupervisorState::Stalled;
            self.stall_episodes += 1;
            return TickOutcome::Stalled;
        }

        outcome
    }
}

/// A missing root item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingItem {
    /// Diagnostic label.
    pub label: String,
    /// Multihash.
    pub identifier: Identifier,
    /// Keyspace position.
    pub kad_id: KadId,
}

/// Missing roots grouped by keyspace prefix, plus the DHT prefixes observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StallDiagnostic {
    /// Bits used for grouping.
    pub prefix_bits: u8,
    /// Missing roots keyed by prefix value. Groups are disjoint.
    pub groups: BTreeMap<u32, Vec<MissingItem>>,
    /// Number of missing roots.
    pub missing_total: usize,
    /// Size of the root universe.
    pub root_total: usize,
    /// DHT prefixes seen in provider records so far.
    pub observed_prefixes: Vec<String>,
}

impl StallDiagnostic {
    /// Compute the diagnostic from a progress state.
    pub fn from_state(index: &MembershipIndex, state: &ProgressState, prefix_bits: u8) -> Self {
        let mut groups: BTreeMap<u32, Vec<MissingItem>> = BTreeMap::new();
        let missing = state.missing_roots(index);
        let missing_total = missing.len();

        for id in missing {
            let (label, kad_id) = match index.root(id) {
                Some(entry) => (entry.label.clone(), entry.kad_id),
                None => (id.to_hex(), id.kad_id()),
            };
            groups
                .entry(kad_id.prefix(prefix_bits))
                .or_default()
                .push(MissingItem {
                    label,
                    identifier: id.clone(),
                    kad_id,
                });
        }
        for items in groups.values_mut() {
            items.sort_by(|a, b| a.kad_id.cmp(&b.kad_id));
        }

        Self {
            prefix_bits,
            groups,
            missing_total,
            root_total: index.root_count(),
            observed_prefixes: state.observed_prefixes().iter().cloned().collect(),
        }
    }
}

impl fmt::Display for StallDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "*** STALL DIAGNOSTIC: {}/{} root items not yet advertised ***",
            self.missing_total, self.root_total
        )?;
        writeln!(
            f,
            "Missing root items by {}-bit Kademlia prefix ({} groups):",
            self.prefix_bits,
            self.groups.len()
        )?;
        for (prefix, items) in &self.groups {
            for item in items {
                writeln!(
                    f,
                    "  prefix={}  kadID={}  multihash={}  {}",
                    format_prefix(*prefix, self.prefix_bits),
                    item.kad_id,
                    item.identifier,
                    item.label
                )?;
            }
        }
        writeln!(
            f,
            "Provide prefixes seen ({} total):",
            self.observed_prefixes.len()
        )?;
        for prefix in &self.observed_prefixes {
            writeln!(f, "  {}", prefix)?;
        }
        Ok(())
    }
}

/// Periodic keep-monitoring status: how often each tracked item was advertised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributionStatus {
    /// Time since keep-monitoring started.
    pub elapsed: Duration,
    /// Current counters.
    pub snapshot: ProgressSnapshot,
    /// Advertisement count → number of tracked items advertised that often.
    pub distribution: BTreeMap<u64, usize>,
}

impl fmt::Display for DistributionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- STATUS (monitoring for {}s) ---", self.elapsed.as_secs())?;
        writeln!(f, "Provider records: {}", self.snapshot.total_records)?;
        writeln!(
            f,
            "Root items advertised: {}/{}",
            self.snapshot.root_advertised, self.snapshot.root_total
        )?;
        writeln!(f, "Advertisement count distribution:")?;
        for (times, items) in &self.distribution {
            writeln!(f, "  {times}x: {items} items")?;
        }
        Ok(())
    }
}

/// Something the supervision loop wants surfaced.
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    /// Periodic status line.
    Status {
        /// Current counters.
        snapshot: ProgressSnapshot,
        /// Time since supervision started.
        elapsed: Duration,
    },
    /// A stall episode started. Not an error; polling continues.
    Stalled(StallDiagnostic),
    /// Progress resumed after a stall.
    Recovered {
        /// Distinct roots advertised now.
        advertised: usize,
    },
    /// Keep-monitoring sample.
    Distribution(DistributionStatus),
}

/// Why the supervision loop returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisionOutcome {
    /// Every root was advertised.
    Complete,
    /// The node process exited first.
    NodeExited(NodeExit),
    /// `cancel` resolved.
    Cancelled,
}

/// Poll `tracker` until completion, node exit or cancellation.
///
/// `node_exit` is observed for a `Some` value; `cancel` is an arbitrary
/// future (Ctrl-C in the binary). Cancellation wins when several of these
/// are ready at once.
pub async fn supervise<C, F>(
    tracker: &ProgressTracker,
    config: &VerifierConfig,
    node_exit: watch::Receiver<Option<NodeExit>>,
    cancel: C,
    mut on_event: F,
) -> SupervisionOutcome
where
    C: Future<Output = ()>,
    F: FnMut(SupervisorEvent),
{
    let start = Instant::now();
    let mut supervisor =
        StallSupervisor::new(tracker.index().root_count(), config.stall_threshold, start);
    let mut interval = tokio::time::interval(config.poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(cancel);

    loop {
        tokio::select! {
            biased;
            _ = &mut cancel => {
                info!("Cancellation requested while {:?}", supervisor.state());
                return SupervisionOutcome::Cancelled;
            }
            exit = wait_exit(node_exit.clone()) => {
                return SupervisionOutcome::NodeExited(exit);
            }
            _ = interval.tick() => {
                let snapshot = tracker.snapshot().await;
                let now = Instant::now();
                match supervisor.tick(snapshot.root_advertised, now) {
                    TickOutcome::Complete => {
                        info!(
                            "All {} root items advertised in {:.0?}",
                            snapshot.root_total,
                            now - start
                        );
                        return SupervisionOutcome::Complete;
                    }
                    TickOutcome::Stalled => {
                        let diagnostic = tracker.stall_diagnostic(config.prefix_bits).await;
                        warn!(
                            "Verification stalled: no new root advertisement for {:?} ({} missing, episode {})",
                            config.stall_threshold,
                            diagnostic.missing_total,
                            supervisor.stall_episodes()
                        );
                        on_event(SupervisorEvent::Stalled(diagnostic));
                    }
                    TickOutcome::Progressed { advertised, recovered: true } => {
                        info!("Progress resumed after stall: {} root items advertised", advertised);
                        on_event(SupervisorEvent::Recovered { advertised });
                    }
                    TickOutcome::Progressed { .. } | TickOutcome::Idle => {}
                }
                on_event(SupervisorEvent::Status {
                    snapshot,
                    elapsed: now - start,
                });
            }
        }
    }
}

/// Keep sampling after completion, emitting a [`DistributionStatus`] every
/// `distribution_interval`, until the node exits or `cancel` resolves.
///
/// Returns [`SupervisionOutcome::Cancelled`] or
/// [`SupervisionOutcome::NodeExited`].
pub async fn keep_monitoring<C, F>(
    tracker: &ProgressTracker,
    config: &VerifierConfig,
    node_exit: watch::Receiver<Option<NodeExit>>,
    cancel: C,
    mut on_event: F,
) -> SupervisionOutcome
where
    C: Future<Output = ()>,
    F: FnMut(SupervisorEvent),
{
    let start = Instant::now();
    let period = config.distribution_interval;
    let mut interval = tokio::time::interval_at(start + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(cancel);
    info!(
        "Monitoring re-advertisements every {:?}, Ctrl-C to stop",
        period
    );

    loop {
        tokio::select! {
            biased;
            _ = &mut cancel => {
                info!("Monitoring stopped");
                return SupervisionOutcome::Cancelled;
            }
            exit = wait_exit(node_exit.clone()) => {
                warn!("Node exited while monitoring: {}", exit);
                return SupervisionOutcome::NodeExited(exit);
            }
            _ = interval.tick() => {
                let (snapshot, distribution) = tracker.distribution().await;
                on_event(SupervisorEvent::Distribution(DistributionStatus {
                    elapsed: start.elapsed(),
                    snapshot,
                    distribution,
                }));
            }
        }
    }
}
