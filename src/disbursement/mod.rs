//! Fund disbursement: pays a verified milestone's tranche to the student.

use serde::Serialize;
use tracing::info;

use crate::engine::EscrowEngine;
use crate::error::{EscrowError, Target};
use crate::ledger::{AccountId, Amount, LedgerMutation, LedgerPrimitive, TxId};
use crate::registry::{
    Milestone, MilestoneIndex, MilestoneState, ReleaseRecord, Scholarship, ScholarshipId,
    ScholarshipState,
};

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct ReleaseOutcome {
    pub scholarship_id: ScholarshipId,
    pub index: MilestoneIndex,
    pub amount: Amount,
    pub recipient: AccountId,
    pub tx: TxId,
    pub released_at: u64,
    /// This release was the scholarship's last outstanding milestone.
    pub completed: bool,
    /// The milestone had already been released; nothing moved this time.
    pub replayed: bool,
}

impl ReleaseOutcome {
    fn from_record(scholarship: &Scholarship, milestone: &Milestone, record: &ReleaseRecord, replayed: bool) -> Self {
        Self {
            scholarship_id: scholarship.id,
            index: milestone.index,
            amount: record.amount,
            recipient: record.recipient.clone(),
            tx: record.tx,
            released_at: record.released_at,
            completed: scholarship.state == ScholarshipState::Completed,
            replayed,
        }
    }
}

pub(crate) fn release_tx_id(id: ScholarshipId, index: MilestoneIndex) -> TxId {
    TxId::derive("release", &[&id.to_le_bytes(), &index.to_le_bytes()])
}

impl<L: LedgerPrimitive> EscrowEngine<L> {
    /// Re-runs the release of a milestone left `Verified` by a failed
    /// transfer. Safe to call any number of times.
    pub fn retry_release(&self, id: ScholarshipId, index: MilestoneIndex) -> Result<ReleaseOutcome, EscrowError> {
        self.release(id, index)
    }

    /// Transfers the milestone's allocation and marks it `Released` in the
    /// same commit. A milestone that is already released yields its
    /// recorded outcome. If the transfer fails the milestone stays
    /// `Verified`.
    pub(crate) fn release(&self, id: ScholarshipId, index: MilestoneIndex) -> Result<ReleaseOutcome, EscrowError> {
        let loaded = self.load(id)?;
        let current = &loaded.scholarship;
        let target = Target::Milestone(id, index);
        let milestone = current.milestone(index)?;

        if milestone.state == MilestoneState::Released {
            let record = milestone.release.as_ref().ok_or_else(|| EscrowError::CorruptRecord {
                target,
                reason: "released milestone without a release record".into(),
            })?;
            return Ok(ReleaseOutcome::from_record(current, milestone, record, true));
        }
        current.require_active("release")?;
        if milestone.state != MilestoneState::Verified {
            return Err(EscrowError::InvalidState {
                target,
                action: "release",
                found: milestone.state.to_string(),
            });
        }

        let amount = milestone.allocated_amount;
        let released_after = current.total_released().checked_add(amount);
        if released_after.map_or(true, |total| total > current.total_amount) {
            return Err(EscrowError::CorruptRecord {
                target,
                reason: format!(
                    "releasing {amount} would exceed total {} (already released {})",
                    current.total_amount,
                    current.total_released()
                ),
            });
        }

        let now = self.now();
        let tx = release_tx_id(id, index);
        let record = ReleaseRecord {
            amount,
            recipient: current.student.clone(),
            tx,
            released_at: now,
        };
        let mut next = current.clone();
        {
            let milestone = next.milestone_mut(index)?;
            milestone.transition(id, "release", MilestoneState::Released)?;
            milestone.released_amount = amount;
            milestone.release = Some(record.clone());
        }
        if next.released_count() == next.milestones.len() {
            next.transition("complete", ScholarshipState::Completed)?;
        }

        let transfer = LedgerMutation::Transfer {
            escrow: next.escrow.clone(),
            to: record.recipient.clone(),
            amount,
            memo: Some(format!("scholarship:{id} milestone:{index}")),
        };
        let receipt = self.commit_record(&loaded, &next, tx, vec![transfer], target, now)?;

        let completed = next.state == ScholarshipState::Completed;
        info!(
            scholarship_id = id,
            milestone = index,
            amount,
            student = %record.recipient,
            completed,
            "milestone released"
        );
        let milestone = next.milestone(index)?;
        Ok(ReleaseOutcome::from_record(&next, milestone, &record, receipt.replayed))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{EscrowConfig, Network};
    use crate::ledger::{Fault, InMemoryLedger};
    use crate::registry::{Category, NewScholarship, ReleasePolicy};

    fn engine() -> EscrowEngine<Arc<InMemoryLedger>> {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.fund(&"donor".into(), 1_000, 0).unwrap();
        let config = EscrowConfig {
            network: Network::Devnet,
            ..EscrowConfig::default()
        }
        .with_verifier("registrar");
        EscrowEngine::with_clock(ledger, config, Arc::new(ManualClock::new(5)))
    }

    fn open(engine: &EscrowEngine<Arc<InMemoryLedger>>, allocations: Vec<Amount>) -> ScholarshipId {
        engine
            .create_scholarship(NewScholarship {
                request_key: TxId::random().to_hex(),
                donor: "donor".into(),
                student: "student".into(),
                recovery_address: "donor".into(),
                category: Category::Technology,
                total_amount: allocations.iter().sum(),
                allocations,
                release_policy: Some(ReleasePolicy::Unordered),
                term_secs: None,
            })
            .unwrap()
            .id
    }

    #[test]
    fn release_requires_a_verified_milestone() {
        let engine = engine();
        let id = open(&engine, vec![40, 60]);
        let err = engine.retry_release(id, 0).unwrap_err();
        assert!(matches!(err, EscrowError::InvalidState { action: "release", .. }));

        engine.submit_claim(id, 0, &"student".into(), "ipfs://proof").unwrap();
        let err = engine.retry_release(id, 0).unwrap_err();
        assert!(matches!(err, EscrowError::InvalidState { ref found, .. } if found == "claimed"));
        assert!(matches!(
            engine.retry_release(id, 7),
            Err(EscrowError::NotFound { target: Target::Milestone(_, 7) })
        ));
        assert_eq!(engine.ledger().balance(&"student".into()).unwrap(), 0);
    }

    #[test]
    fn failed_transfer_leaves_milestone_verified_and_retry_pays_once() {
        let engine = engine();
        let id = open(&engine, vec![40, 60]);
        engine.submit_claim(id, 1, &"student".into(), "ipfs://proof").unwrap();
        engine.ledger().inject_fault(Fault::Pass).unwrap();
        engine.ledger().inject_fault(Fault::Unavailable).unwrap();

        let outcome = engine
            .decide(id, 1, crate::registry::Verdict::Accept, &"registrar".into())
            .unwrap();
        match outcome {
            crate::verifier::DecisionOutcome::ReleaseDeferred { fault, .. } => {
                assert!(matches!(fault, EscrowError::PrimitiveUnavailable { .. }));
            }
            other => panic!("expected deferred release, got {other:?}"),
        }
        assert_eq!(
            engine.get_milestone(id, 1).unwrap().state,
            MilestoneState::Verified
        );

        let first = engine.retry_release(id, 1).unwrap();
        assert!(!first.replayed);
        assert!(!first.completed);
        let second = engine.retry_release(id, 1).unwrap();
        assert!(second.replayed);
        assert_eq!(second.tx, first.tx);
        assert_eq!(engine.ledger().balance(&"student".into()).unwrap(), 60);
    }

    #[test]
    fn lost_reply_is_resolved_by_reading_back() {
        let engine = engine();
        let id = open(&engine, vec![100]);
        engine.submit_claim(id, 0, &"student".into(), "ipfs://thesis").unwrap();
        engine.ledger().inject_fault(Fault::Pass).unwrap();
        engine.ledger().inject_fault(Fault::UnavailableAfterCommit).unwrap();
        let outcome = engine
            .decide(id, 0, crate::registry::Verdict::Accept, &"registrar".into())
            .unwrap();
        assert!(matches!(
            outcome,
            crate::verifier::DecisionOutcome::ReleaseDeferred { .. }
        ));

        let view = engine.get_scholarship(id).unwrap();
        assert_eq!(view.state, ScholarshipState::Completed);
        let retried = engine.retry_release(id, 0).unwrap();
        assert!(retried.replayed);
        assert!(retried.completed);
        assert_eq!(engine.ledger().balance(&"student".into()).unwrap(), 100);
    }
}
