//! Milestone verifier: admits completion claims and applies verdicts.

use serde::Serialize;
use tracing::{info, warn};

use crate::disbursement::ReleaseOutcome;
use crate::engine::EscrowEngine;
use crate::error::{EscrowError, Target};
use crate::ledger::{AccountId, LedgerPrimitive, TxId};
use crate::registry::{
    ClaimRecord, MilestoneIndex, MilestoneState, RecoveryTrigger, ScholarshipId, ScholarshipState,
    Verdict,
};

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct ClaimReceipt {
    pub scholarship_id: ScholarshipId,
    pub index: MilestoneIndex,
    /// 1-based claim attempt on this milestone.
    pub attempt: u32,
    pub tx: TxId,
}

/// Result of a verdict that was recorded.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DecisionOutcome {
    Released(ReleaseOutcome),
    /// Accepted and stored as `Verified`, but the transfer did not go
    /// through. Retry with [`EscrowEngine::retry_release`].
    ReleaseDeferred {
        scholarship_id: ScholarshipId,
        index: MilestoneIndex,
        #[serde(serialize_with = "display")]
        fault: EscrowError,
    },
    Rejected {
        scholarship_id: ScholarshipId,
        index: MilestoneIndex,
        rejections: u32,
        retries_left: u32,
    },
}

fn display<S: serde::Serializer>(err: &EscrowError, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(err)
}

impl<L: LedgerPrimitive> EscrowEngine<L> {
    /// Files a completion claim. Only the scholarship's student may claim,
    /// and only for a milestone that is `Locked` or `Rejected` and allowed
    /// by the release policy.
    pub fn submit_claim(
        &self,
        id: ScholarshipId,
        index: MilestoneIndex,
        claimant: &AccountId,
        evidence_ref: &str,
    ) -> Result<ClaimReceipt, EscrowError> {
        let loaded = self.load(id)?;
        let current = &loaded.scholarship;
        let target = Target::Milestone(id, index);
        if claimant != &current.student {
            return Err(EscrowError::Unauthorized {
                target,
                actor: claimant.clone(),
                action: "claim",
            });
        }
        current.ensure_claimable(index)?;

        let now = self.now();
        let mut next = current.clone();
        let attempt = {
            let milestone = next.milestone_mut(index)?;
            milestone.transition(id, "claim", MilestoneState::Claimed)?;
            milestone.claimant.get_or_insert_with(|| claimant.clone());
            let attempt = milestone.attempts() + 1;
            milestone.claims.push(ClaimRecord {
                attempt,
                claimant: claimant.clone(),
                evidence_ref: evidence_ref.to_string(),
                submitted_at: now,
                verdict: None,
                verifier: None,
                decided_at: None,
            });
            attempt
        };

        let tx = TxId::derive(
            "claim",
            &[&id.to_le_bytes(), &index.to_le_bytes(), &attempt.to_le_bytes()],
        );
        self.commit_record(&loaded, &next, tx, Vec::new(), target, now)?;
        info!(scholarship_id = id, milestone = index, attempt, evidence = evidence_ref, "claim submitted");
        Ok(ClaimReceipt {
            scholarship_id: id,
            index,
            attempt,
            tx,
        })
    }

    /// Applies `verdict` to the open claim on milestone `index`.
    ///
    /// An accept stores `Verified` and then releases the tranche; if the
    /// release fails the verdict stands and the fault comes back as
    /// [`DecisionOutcome::ReleaseDeferred`]. A reject that takes the
    /// milestone past the rejection limit recovers the remaining escrow in
    /// the same commit and returns `RetryLimitExceeded`.
    pub fn decide(
        &self,
        id: ScholarshipId,
        index: MilestoneIndex,
        verdict: Verdict,
        verifier: &AccountId,
    ) -> Result<DecisionOutcome, EscrowError> {
        let loaded = self.load(id)?;
        let current = &loaded.scholarship;
        let target = Target::Milestone(id, index);
        if !self.config.verifiers.contains(verifier) || verifier == &current.student {
            return Err(EscrowError::Unauthorized {
                target,
                actor: verifier.clone(),
                action: "verify",
            });
        }
        current.require_active("verify")?;

        let now = self.now();
        let mut next = current.clone();
        let (attempt, rejections) = {
            let milestone = next.milestone_mut(index)?;
            let resolved = match verdict {
                Verdict::Accept => MilestoneState::Verified,
                Verdict::Reject => MilestoneState::Rejected,
            };
            milestone.transition(id, "verify", resolved)?;
            if verdict == Verdict::Reject {
                milestone.rejections = milestone.rejections.saturating_add(1);
            }
            let rejections = milestone.rejections;
            let claim = milestone.open_claim_mut().ok_or_else(|| EscrowError::CorruptRecord {
                target,
                reason: "claimed milestone has no open claim".into(),
            })?;
            claim.verdict = Some(verdict);
            claim.verifier = Some(verifier.clone());
            claim.decided_at = Some(now);
            (claim.attempt, rejections)
        };
        let tx = TxId::derive(
            "decide",
            &[&id.to_le_bytes(), &index.to_le_bytes(), &attempt.to_le_bytes()],
        );

        match verdict {
            Verdict::Accept => {
                self.commit_record(&loaded, &next, tx, Vec::new(), target, now)?;
                info!(scholarship_id = id, milestone = index, attempt, %verifier, "milestone verified");
                match self.release(id, index) {
                    Ok(outcome) => Ok(DecisionOutcome::Released(outcome)),
                    Err(fault) => {
                        warn!(scholarship_id = id, milestone = index, error = %fault, "release deferred");
                        Ok(DecisionOutcome::ReleaseDeferred {
                            scholarship_id: id,
                            index,
                            fault,
                        })
                    }
                }
            }
            Verdict::Reject if rejections > next.max_rejections => {
                let limit = next.max_rejections;
                next.transition("recover", ScholarshipState::Recovered)?;
                let recovery = self.commit_recovery(&loaded, next, RecoveryTrigger::VerificationExhausted, now)?;
                warn!(
                    scholarship_id = id,
                    milestone = index,
                    rejections,
                    limit,
                    recovered = recovery.amount,
                    "rejection limit exceeded"
                );
                Err(EscrowError::RetryLimitExceeded {
                    target,
                    rejections,
                    limit,
                })
            }
            Verdict::Reject => {
                self.commit_record(&loaded, &next, tx, Vec::new(), target, now)?;
                // rejections <= max_rejections on this branch.
                let retries_left = (next.max_rejections - rejections).saturating_add(1);
                info!(scholarship_id = id, milestone = index, rejections, retries_left, "claim rejected");
                Ok(DecisionOutcome::Rejected {
                    scholarship_id: id,
                    index,
                    rejections,
                    retries_left,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{EscrowConfig, Network};
    use crate::ledger::InMemoryLedger;
    use crate::registry::{Category, NewScholarship, ReleasePolicy};

    fn engine(max_rejections: u32) -> EscrowEngine<Arc<InMemoryLedger>> {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.fund(&"donor".into(), 1_000, 0).unwrap();
        let config = EscrowConfig {
            network: Network::Devnet,
            max_rejections,
            ..EscrowConfig::default()
        }
        .with_verifier("registrar")
        .with_verifier("student");
        EscrowEngine::with_clock(ledger, config, Arc::new(ManualClock::new(1_000)))
    }

    fn open(engine: &EscrowEngine<Arc<InMemoryLedger>>, policy: ReleasePolicy) -> ScholarshipId {
        engine
            .create_scholarship(NewScholarship {
                request_key: TxId::random().to_hex(),
                donor: "donor".into(),
                student: "student".into(),
                recovery_address: "donor".into(),
                category: Category::Academic,
                total_amount: 90,
                allocations: vec![30, 30, 30],
                release_policy: Some(policy),
                term_secs: None,
            })
            .unwrap()
            .id
    }

    #[test]
    fn only_the_student_may_claim() {
        let engine = engine(3);
        let id = open(&engine, ReleasePolicy::Sequential);
        let err = engine.submit_claim(id, 0, &"donor".into(), "ipfs://x").unwrap_err();
        assert!(matches!(err, EscrowError::Unauthorized { action: "claim", .. }));
        let receipt = engine.submit_claim(id, 0, &"student".into(), "ipfs://x").unwrap();
        assert_eq!(receipt.attempt, 1);
    }

    #[test]
    fn sequential_policy_blocks_later_milestones() {
        let engine = engine(3);
        let id = open(&engine, ReleasePolicy::Sequential);
        let err = engine.submit_claim(id, 1, &"student".into(), "ipfs://x").unwrap_err();
        assert!(matches!(err, EscrowError::InvalidState { ref found, .. } if found == "milestone 0 locked"));

        let unordered = open(&engine, ReleasePolicy::Unordered);
        engine.submit_claim(unordered, 2, &"student".into(), "ipfs://x").unwrap();
    }

    #[test]
    fn double_claim_is_refused() {
        let engine = engine(3);
        let id = open(&engine, ReleasePolicy::Sequential);
        engine.submit_claim(id, 0, &"student".into(), "ipfs://a").unwrap();
        let err = engine.submit_claim(id, 0, &"student".into(), "ipfs://b").unwrap_err();
        assert!(matches!(err, EscrowError::InvalidState { ref found, .. } if found == "claimed"));
    }

    #[test]
    fn verifier_role_is_enforced() {
        let engine = engine(3);
        let id = open(&engine, ReleasePolicy::Sequential);
        engine.submit_claim(id, 0, &"student".into(), "ipfs://a").unwrap();
        for actor in ["donor", "student"] {
            let err = engine.decide(id, 0, Verdict::Accept, &actor.into()).unwrap_err();
            assert!(matches!(err, EscrowError::Unauthorized { action: "verify", .. }), "{actor}");
        }
    }

    #[test]
    fn verdict_needs_an_open_claim() {
        let engine = engine(3);
        let id = open(&engine, ReleasePolicy::Sequential);
        let err = engine.decide(id, 0, Verdict::Accept, &"registrar".into()).unwrap_err();
        assert!(matches!(err, EscrowError::InvalidState { ref found, .. } if found == "locked"));
    }

    #[test]
    fn rejected_claim_can_be_resubmitted() {
        let engine = engine(3);
        let id = open(&engine, ReleasePolicy::Sequential);
        engine.submit_claim(id, 0, &"student".into(), "ipfs://draft").unwrap();
        let outcome = engine.decide(id, 0, Verdict::Reject, &"registrar".into()).unwrap();
        assert_eq!(
            outcome,
            DecisionOutcome::Rejected {
                scholarship_id: id,
                index: 0,
                rejections: 1,
                retries_left: 3,
            }
        );
        let receipt = engine.submit_claim(id, 0, &"student".into(), "ipfs://final").unwrap();
        assert_eq!(receipt.attempt, 2);
        match engine.decide(id, 0, Verdict::Accept, &"registrar".into()).unwrap() {
            DecisionOutcome::Released(release) => assert_eq!(release.amount, 30),
            other => panic!("unexpected {other:?}"),
        }

        let milestone = engine.load(id).unwrap().scholarship.milestones[0].clone();
        assert_eq!(milestone.claims.len(), 2);
        assert_eq!(milestone.claims[0].verdict, Some(Verdict::Reject));
        assert_eq!(milestone.claims[1].verifier.as_deref(), Some("registrar"));
        assert_eq!(milestone.claimant.as_deref(), Some("student"));
    }

    #[test]
    fn exceeding_the_rejection_limit_recovers_the_escrow() {
        let engine = engine(1);
        let id = open(&engine, ReleasePolicy::Sequential);
        engine.submit_claim(id, 0, &"student".into(), "ipfs://1").unwrap();
        engine.decide(id, 0, Verdict::Reject, &"registrar".into()).unwrap();
        engine.submit_claim(id, 0, &"student".into(), "ipfs://2").unwrap();
        let err = engine.decide(id, 0, Verdict::Reject, &"registrar".into()).unwrap_err();
        assert!(matches!(
            err,
            EscrowError::RetryLimitExceeded {
                rejections: 2,
                limit: 1,
                ..
            }
        ));

        let scholarship = engine.load(id).unwrap().scholarship;
        assert_eq!(scholarship.state, ScholarshipState::Recovered);
        let recovery = scholarship.recovery.unwrap();
        assert_eq!(recovery.trigger, RecoveryTrigger::VerificationExhausted);
        assert_eq!(recovery.amount, 90);
        assert_eq!(engine.ledger().balance(&"donor".into()).unwrap(), 1_000);

        let err = engine.submit_claim(id, 0, &"student".into(), "ipfs://3").unwrap_err();
        assert!(matches!(err, EscrowError::InvalidState { .. }));
    }

    #[test]
    fn unbounded_rejection_limit_counts_down_without_overflow() {
        let engine = engine(u32::MAX);
        let id = open(&engine, ReleasePolicy::Sequential);
        engine.submit_claim(id, 0, &"student".into(), "ipfs://draft").unwrap();
        let outcome = engine.decide(id, 0, Verdict::Reject, &"registrar".into()).unwrap();
        assert!(matches!(
            outcome,
            DecisionOutcome::Rejected { rejections: 1, retries_left: u32::MAX, .. }
        ));
    }
}
