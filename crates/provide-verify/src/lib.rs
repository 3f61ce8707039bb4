//! DHT Provide Verification Harness
//!
//! Verifies that a DHT node (a Kubo/IPFS daemon in the usual deployment)
//! advertises every content item it holds within an operational time budget,
//! and diagnoses which items were missed when advertisement stalls.
//!
//! - **Membership Index**: every locally known multihash is classified as
//!   `root`, `other`, `sentinel` or `unknown` before the node starts
//! - **Stream Tailer**: the node's readiness and diagnostic channels are
//!   drained concurrently so the node never blocks on a full pipe
//! - **Provider-Record Parser**: `sent provider record` events are extracted
//!   from free-form debug log lines
//! - **Progress Tracker**: advertisement counters shared with the supervisor
//! - **Stall Supervisor**: missing roots are grouped by Kademlia keyspace
//!   prefix once progress stops
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐ stdout  ┌────────────────┐  Ready
//! │              │────────►│ ready tailer   │──────────────┐
//! │  node (ipfs  │         └────────────────┘              ▼
//! │   daemon)    │ stderr  ┌────────────────┐    ┌──────────────────┐
//! │              │────────►│ stderr tailer  │    │    Verifier      │
//! └──────┬───────┘         └───────┬────────┘    └────────┬─────────┘
//!        │ exit                    │ LineBuffer           │
//!        │                         ▼                      ▼
//!        │                 ┌────────────────┐    ┌──────────────────┐
//!        │                 │ record monitor │    │ stall supervisor │
//!        │                 │ parse+classify │    │  (poll loop)     │
//!        │                 └───────┬────────┘    └────────┬─────────┘
//!        │                         ▼                      │
//!        │                 ┌────────────────┐   snapshot  │
//!        └────────────────►│ ProgressState  │◄────────────┘
//!            watch         └───────┬────────┘
//!                                  ▼
//!                         VerificationReport
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use provide_verify::{MembershipIndex, NodeCommand, Verifier, VerifierConfig};
//!
//! let (index, _skipped) = MembershipIndex::from_content_ids(&roots, &locals, None);
//! let verifier = Verifier::new(VerifierConfig::default(), index);
//! let report = verifier.run(&NodeCommand::new("ipfs").arg("daemon")).await?;
//! println!("{report}");
//! ```

pub mod config;
pub mod daemon;
pub mod error;
pub mod identifier;
pub mod kubo;
pub mod logging;
pub mod membership;
pub mod parser;
pub mod report;
pub mod supervisor;
pub mod tailer;
pub mod tracker;
pub mod verifier;

pub use config::{KuboConfig, KuboIdentity, VerifierConfig};
pub use daemon::{NodeCommand, NodeExit, NodeProcess};
pub use error::{Result, VerifyError};
pub use identifier::{Identifier, KadId};
pub use kubo::{AddedContent, KuboRepo};
pub use membership::{Category, CidEntry, MembershipIndex, one_per_prefix, parse_cid_list};
pub use parser::ProviderRecord;
pub use report::{RunOutcome, VerificationReport};
pub use supervisor::{
    DistributionStatus, StallDiagnostic, StallSupervisor, SupervisionOutcome, SupervisorEvent,
};
pub use tracker::{ProgressSnapshot, ProgressState, ProgressTracker};
pub use verifier::Verifier;
