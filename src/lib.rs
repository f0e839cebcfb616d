//! Milestone-based scholarship escrow.
//!
//! A donor deposits a scholarship into escrow, split into milestones. The
//! student claims each milestone, an authorized verifier accepts or rejects
//! the claim, and every accepted milestone releases its tranche. When a
//! scholarship cannot finish (donor cancellation, a deadline passing or a
//! milestone rejected too often) the undisbursed balance goes to the
//! recovery address.
//!
//! The crate is organised around one [`EscrowEngine`] with its operations
//! split by component:
//!
//! * [`registry`]: scholarship records, creation and cancellation.
//! * [`verifier`]: completion claims and verdicts.
//! * [`disbursement`]: per-milestone releases.
//! * [`recovery`]: returning escrow to the recovery address.
//! * [`query`]: read projections for callers.
//!
//! Custody and storage belong to a [`LedgerPrimitive`]. The engine only
//! ever commits whole transactions against it, so several engines can share
//! one ledger and race safely. [`InMemoryLedger`] is the bundled
//! implementation used by the `microsponsor` binary and the tests.

pub mod clock;
pub mod config;
pub mod disbursement;
pub mod engine;
pub mod error;
pub mod labels;
pub mod ledger;
pub mod query;
pub mod recovery;
pub mod registry;
pub mod verifier;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, EscrowConfig, Network};
pub use disbursement::ReleaseOutcome;
pub use engine::EscrowEngine;
pub use error::{ErrorKind, EscrowError, Target};
pub use ledger::{InMemoryLedger, LedgerError, LedgerPrimitive};
pub use query::{MilestoneView, ScholarshipFilter, ScholarshipView, StudentStatus, StudentSummary};
pub use recovery::RecoveryOutcome;
pub use registry::{
    Category, MilestoneState, NewScholarship, RecoveryTrigger, ReleasePolicy, ScholarshipId,
    ScholarshipState, Verdict,
};
pub use verifier::{ClaimReceipt, DecisionOutcome};
