//! Error taxonomy for the verification harness.
//!
//! Per-line and per-key failures (`UnparseableLogLine`, `MalformedKeyEncoding`)
//! and index-build failures (`MalformedIdentifier`) are contained by the
//! component that hits them. Only process lifecycle failures and explicit
//! cancellation abort a run, and those that happen after monitoring started
//! carry the partial report.

use crate::report::VerificationReport;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = VerifyError> = std::result::Result<T, E>;

/// Errors produced by the verification harness.
#[derive(Debug, Error)]
pub enum VerifyError {
    /// A content identifier could not be decoded into a multihash.
    #[error("malformed identifier {input:?}: {reason}")]
    MalformedIdentifier {
        /// The offending input.
        input: String,
        /// Decoder message.
        reason: String,
    },

    /// A log line carried the provider marker but no decodable payload.
    #[error("unparseable provider record payload: {0}")]
    UnparseableLogLine(String),

    /// A single key inside a provider record was not valid base64.
    #[error("malformed key encoding: {0}")]
    MalformedKeyEncoding(String),

    /// The node never signalled readiness.
    #[error("daemon failed to start: {reason}\ncaptured diagnostic output:\n{diagnostics}")]
    DaemonStartupFailed {
        /// Why startup was considered failed.
        reason: String,
        /// Diagnostic-channel output captured so far.
        diagnostics: String,
    },

    /// The node exited before every root item was advertised.
    #[error("daemon exited before verification completed ({exit})")]
    DaemonExitedEarly {
        /// Exit status description.
        exit: String,
        /// Report built from the partial progress state.
        report: Box<VerificationReport>,
    },

    /// The run was interrupted by the user.
    #[error("verification cancelled by user")]
    UserCancelled {
        /// Report built from the partial progress state.
        report: Box<VerificationReport>,
    },

    /// The node process could not be spawned.
    #[error("failed to spawn {program}: {reason}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// OS error message.
        reason: String,
    },

    /// A setup command run against the node's repository failed.
    #[error("command `{command}` failed: {stderr}")]
    NodeCommand {
        /// Rendered command line.
        command: String,
        /// Captured stderr.
        stderr: String,
    },

    /// Invalid configuration or input.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl VerifyError {
    /// The partial report carried by a run-aborting error, if any.
    pub fn partial_report(&self) -> Option<&VerificationReport> {
        match self {
            Self::DaemonExitedEarly { report, .. } | Self::UserCancelled { report } => {
                Some(report)
            }
            _ => None,
        }
    }
}
