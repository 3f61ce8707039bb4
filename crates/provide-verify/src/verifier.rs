//! Run orchestration.
//!
//! Starts the node, waits for its readiness marker, feeds the diagnostic
//! channel through the parser into the tracker, and supervises until every
//! root is advertised, the node exits, or the run is cancelled. With
//! `keep_monitoring` a complete run keeps the node up and reports
//! re-advertisements until Ctrl-C. The node is torn down exactly once and the
//! accumulated state is frozen into a report.

use crate::config::VerifierConfig;
use crate::daemon::{NodeCommand, NodeProcess};
use crate::error::{Result, VerifyError};
use crate::membership::MembershipIndex;
use crate::report::{RunOutcome, VerificationReport};
use crate::supervisor::{SupervisionOutcome, SupervisorEvent, keep_monitoring, supervise};
use crate::tailer::{LineBuffer, Readiness, spawn_ready_tailer, spawn_tailer};
use crate::tracker::{ProgressTracker, spawn_record_monitor};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Verification harness for one node run.
#[derive(Debug, Clone)]
pub struct Verifier {
    config: VerifierConfig,
    index: Arc<MembershipIndex>,
}

impl Verifier {
    /// Harness over a prepared membership index.
    pub fn new(config: VerifierConfig, index: MembershipIndex) -> Self {
        Self {
            config,
            index: Arc::new(index),
        }
    }

    /// Run until completion, node exit, or Ctrl-C.
    pub async fn run(&self, command: &NodeCommand) -> Result<VerificationReport> {
        self.run_with_cancel(command, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Ctrl-C handler unavailable: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Run until completion, node exit, or `cancel` resolves.
    ///
    /// # Errors
    ///
    /// - [`VerifyError::Config`] when there are no root items to verify
    /// - [`VerifyError::Spawn`] when the node cannot be started
    /// - [`VerifyError::DaemonStartupFailed`] when readiness is never signalled
    /// - [`VerifyError::DaemonExitedEarly`] when the node exits before completion
    /// - [`VerifyError::UserCancelled`] when `cancel` resolves first
    pub async fn run_with_cancel<C>(
        &self,
        command: &NodeCommand,
        cancel: C,
    ) -> Result<VerificationReport>
    where
        C: Future<Output = ()>,
    {
        if self.index.root_count() == 0 {
            return Err(VerifyError::Config(
                "no root items to verify; the run could never complete".to_string(),
            ));
        }

        let command = command
            .clone()
            .env(&self.config.log_level_env, self.config.log_level_directive());
        info!(
            "Verifying {} root items, {} other items, sentinel {}",
            self.index.root_count(),
            self.index.other_count(),
            if self.index.has_sentinel() { "tracked" } else { "not tracked" }
        );

        let (mut node, streams) = NodeProcess::spawn(&command)?;
        let stdout_buffer = LineBuffer::with_retention(self.config.max_buffered_lines);
        let stderr_buffer = LineBuffer::with_retention(self.config.max_buffered_lines);
        let (stdout_task, ready) = spawn_ready_tailer(
            streams.stdout,
            stdout_buffer,
            self.config.ready_marker.clone(),
            self.config.max_line_length,
        );
        let stderr_task = spawn_tailer(
            streams.stderr,
            stderr_buffer.clone(),
            self.config.max_line_length,
        );

        let tracker = ProgressTracker::new(Arc::clone(&self.index));
        let started_at = Utc::now();
        let start = Instant::now();
        tokio::pin!(cancel);

        let readiness = tokio::select! {
            biased;
            _ = &mut cancel => {
                info!("Cancelled while waiting for the node to start");
                node.shutdown(self.config.shutdown_grace).await;
                let state = tracker.freeze().await;
                return Err(VerifyError::UserCancelled {
                    report: Box::new(VerificationReport::from_state(
                        &self.index,
                        &state,
                        RunOutcome::Cancelled,
                        started_at,
                        start.elapsed(),
                    )),
                });
            }
            r = tokio::time::timeout(self.config.ready_timeout, ready) => r,
        };

        let failure = match readiness {
            Ok(Ok(Readiness::Ready)) => None,
            Ok(Ok(Readiness::EndOfStream)) | Ok(Err(_)) => Some(format!(
                "readiness channel closed before {:?} appeared",
                self.config.ready_marker
            )),
            Err(_) => Some(format!(
                "no {:?} within {:?}",
                self.config.ready_marker, self.config.ready_timeout
            )),
        };
        if let Some(reason) = failure {
            tokio::time::sleep(self.config.startup_settle).await;
            let exit = node.shutdown(self.config.shutdown_grace).await;
            let _ = tokio::time::timeout(self.config.shutdown_grace, stderr_task).await;
            return Err(VerifyError::DaemonStartupFailed {
                reason: format!("{reason} ({exit})"),
                diagnostics: stderr_buffer.contents().await,
            });
        }
        info!("Node is ready, monitoring provider records");

        let mut monitor = spawn_record_monitor(
            stderr_buffer.clone(),
            tracker.clone(),
            self.config.provide_marker.clone(),
            self.config.scan_interval,
        );

        let outcome = supervise(
            &tracker,
            &self.config,
            node.exit_receiver(),
            cancel.as_mut(),
            emit,
        )
        .await;

        // The monitor drains whatever the node wrote before exiting.
        let outcome = match outcome {
            SupervisionOutcome::NodeExited(exit) => {
                if tokio::time::timeout(self.config.shutdown_grace, &mut monitor)
                    .await
                    .is_err()
                {
                    warn!("Diagnostic channel still open after node exit");
                }
                if tracker.snapshot().await.is_complete() {
                    info!("Every root was advertised before the node exited");
                    RunOutcome::Complete
                } else {
                    RunOutcome::NodeExited {
                        exit: exit.to_string(),
                    }
                }
            }
            SupervisionOutcome::Complete if self.config.keep_monitoring => {
                // Ctrl-C or a node exit both end an already complete run.
                keep_monitoring(
                    &tracker,
                    &self.config,
                    node.exit_receiver(),
                    cancel.as_mut(),
                    emit,
                )
                .await;
                RunOutcome::Complete
            }
            SupervisionOutcome::Complete => RunOutcome::Complete,
            SupervisionOutcome::Cancelled => RunOutcome::Cancelled,
        };

        node.shutdown(self.config.shutdown_grace).await;
        if !monitor.is_finished()
            && tokio::time::timeout(self.config.shutdown_grace, &mut monitor)
                .await
                .is_err()
        {
            monitor.abort();
        }
        stdout_task.abort();
        stderr_task.abort();

        let state = tracker.freeze().await;
        let report = VerificationReport::from_state(
            &self.index,
            &state,
            outcome.clone(),
            started_at,
            start.elapsed(),
        );
        debug!(
            "Run finished: {} ({} first advertisements, {} diagnostic lines)",
            outcome,
            state.newly_advertised(),
            stderr_buffer.len().await
        );

        match outcome {
            RunOutcome::Complete => Ok(report),
            RunOutcome::NodeExited { exit } => Err(VerifyError::DaemonExitedEarly {
                exit,
                report: Box::new(report),
            }),
            RunOutcome::Cancelled => Err(VerifyError::UserCancelled {
                report: Box::new(report),
            }),
        }
    }
}

fn emit(event: SupervisorEvent) {
    match event {
        SupervisorEvent::Status { snapshot, elapsed } => {
            info!("[{:>5}s] {}", elapsed.as_secs(), snapshot);
        }
        SupervisorEvent::Stalled(diagnostic) => println!("{diagnostic}"),
        SupervisorEvent::Distribution(status) => println!("{status}"),
        SupervisorEvent::Recovered { .. } => {}
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::identifier::Identifier;
    use std::time::Duration;

    fn id(byte: u8) -> Identifier {
        Identifier::from_bytes(vec![0x12, 0x20, byte, 0xaa])
    }

    fn fast_config() -> VerifierConfig {
        VerifierConfig {
            poll_interval: Duration::from_millis(50),
            scan_interval: Duration::from_millis(10),
            stall_threshold: Duration::from_secs(60),
            startup_settle: Duration::from_millis(50),
            shutdown_grace: Duration::from_secs(2),
            ready_timeout: Duration::from_secs(10),
            ..Default::default()
        }
    }

    fn record_line(prefix: &str, keys: &[Identifier]) -> String {
        let keys: Vec<String> = keys.iter().map(|k| format!("\"{}\"", k.to_base64())).collect();
        format!(
            "echo 'DEBUG dht/provider sent provider record {{\"prefix\": \"{prefix}\", \"keys\": [{}]}}' >&2",
            keys.join(", ")
        )
    }

    fn node(script: &[String]) -> NodeCommand {
        NodeCommand::new("sh").arg("-c").arg(script.join("\n"))
    }

    fn verifier() -> Verifier {
        let index = MembershipIndex::build(
            vec![(id(1), "A".to_string()), (id(2), "B".to_string())],
            vec![id(1), id(2), id(3)],
            None,
        );
        Verifier::new(fast_config(), index)
    }

    #[tokio::test]
    async fn test_all_roots_advertised() {
        let script = vec![
            "echo 'Initializing daemon...'".to_string(),
            "echo 'Daemon is ready'".to_string(),
            record_line("00", &[id(1), id(3)]),
            "echo 'unrelated noise' >&2".to_string(),
            record_line("01", &[id(2), id(0x77)]),
            "exec sleep 30".to_string(),
        ];

        let report = verifier()
            .run_with_cancel(&node(&script), std::future::pending())
            .await
            .unwrap();

        assert_eq!(report.outcome, RunOutcome::Complete);
        assert!(report.is_complete());
        assert_eq!(report.other.advertised, 1);
        assert_eq!(report.unknown, vec![id(0x77).to_hex()]);
        assert_eq!(report.total_records, 2);
    }

    #[tokio::test]
    async fn test_node_exit_before_completion() {
        let script = vec![
            "echo 'Daemon is ready'".to_string(),
            record_line("00", &[id(1)]),
            "sleep 0.2".to_string(),
            "exit 2".to_string(),
        ];

        let err = verifier()
            .run_with_cancel(&node(&script), std::future::pending())
            .await
            .unwrap_err();

        let VerifyError::DaemonExitedEarly { exit, report } = err else {
            panic!("expected DaemonExitedEarly, got {err:?}");
        };
        assert!(exit.contains('2'));
        assert_eq!(report.root.advertised, 1);
        assert_eq!(report.root.total, 2);
    }

    #[tokio::test]
    async fn test_completion_seen_only_after_exit_counts() {
        let script = vec![
            "echo 'Daemon is ready'".to_string(),
            record_line("00", &[id(1), id(2)]),
            "exit 0".to_string(),
        ];

        let report = verifier()
            .run_with_cancel(&node(&script), std::future::pending())
            .await
            .unwrap();
        assert!(report.is_complete());
    }

    #[tokio::test]
    async fn test_startup_failure_carries_diagnostics() {
        let script = vec![
            "echo 'Error: lock held by another daemon' >&2".to_string(),
            "exit 1".to_string(),
        ];

        let err = verifier()
            .run_with_cancel(&node(&script), std::future::pending())
            .await
            .unwrap_err();

        match err {
            VerifyError::DaemonStartupFailed { diagnostics, .. } => {
                assert!(diagnostics.contains("lock held by another daemon"));
            }
            other => panic!("expected DaemonStartupFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_readiness_timeout_stops_node_and_keeps_diagnostics() {
        let script = vec!["echo booting >&2".to_string(), "exec sleep 30".to_string()];
        let mut verifier = verifier();
        verifier.config.ready_timeout = Duration::from_millis(300);

        let err = verifier
            .run_with_cancel(&node(&script), std::future::pending())
            .await
            .unwrap_err();

        let VerifyError::DaemonStartupFailed {
            reason,
            diagnostics,
        } = err
        else {
            panic!("expected DaemonStartupFailed, got {err:?}");
        };
        assert!(
            reason.starts_with(r#"no "Daemon is ready" within 300ms ("#),
            "{reason}"
        );
        assert!(reason.contains("SIGTERM"), "{reason}");
        assert!(diagnostics.contains("booting"));
    }

    #[tokio::test]
    async fn test_keep_monitoring_cancel_returns_complete_report() {
        // Root A keeps being re-advertised after completion
        let script = vec![
            "echo 'Daemon is ready'".to_string(),
            record_line("00", &[id(1), id(2)]),
            "sleep 0.3".to_string(),
            record_line("00", &[id(1)]),
            record_line("00", &[id(1)]),
            "exec sleep 30".to_string(),
        ];
        let mut verifier = verifier();
        verifier.config.keep_monitoring = true;
        verifier.config.distribution_interval = Duration::from_millis(100);

        let report = verifier
            .run_with_cancel(&node(&script), tokio::time::sleep(Duration::from_millis(1500)))
            .await
            .unwrap();

        assert_eq!(report.outcome, RunOutcome::Complete);
        assert_eq!(report.total_records, 3);
        // id(3) is tracked but never advertised
        assert_eq!(
            report.advertisement_distribution,
            std::collections::BTreeMap::from([(0, 1), (1, 1), (3, 1)])
        );
    }

    #[tokio::test]
    async fn test_cancellation_returns_partial_report() {
        let script = vec![
            "echo 'Daemon is ready'".to_string(),
            record_line("00", &[id(2)]),
            "exec sleep 30".to_string(),
        ];

        let err = verifier()
            .run_with_cancel(
                &node(&script),
                tokio::time::sleep(Duration::from_millis(500)),
            )
            .await
            .unwrap_err();

        let report = err.partial_report().unwrap();
        assert_eq!(report.outcome, RunOutcome::Cancelled);
        assert_eq!(report.root.advertised, 1);
    }

    #[tokio::test]
    async fn test_empty_root_universe_is_rejected() {
        let verifier = Verifier::new(fast_config(), MembershipIndex::build(vec![], vec![id(3)], None));
        let err = verifier
            .run_with_cancel(&NodeCommand::new("true"), std::future::pending())
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::Config(_)));
    }
}
