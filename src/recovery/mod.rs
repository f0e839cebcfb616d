//! Recovery handler: returns undisbursed escrow to the recovery address when
//! a scholarship cannot finish normally.

use serde::Serialize;
use tracing::{info, warn};

use crate::engine::EscrowEngine;
use crate::error::{EscrowError, Target};
use crate::ledger::{AccountId, Amount, LedgerMutation, LedgerPrimitive, TxId};
use crate::registry::{
    Loaded, RecoveryRecord, RecoveryTrigger, Scholarship, ScholarshipId, ScholarshipState,
};

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct RecoveryOutcome {
    pub scholarship_id: ScholarshipId,
    pub trigger: RecoveryTrigger,
    pub amount: Amount,
    pub recipient: AccountId,
    pub tx: TxId,
    pub recovered_at: u64,
    pub state: ScholarshipState,
    /// The recovery had already happened; nothing moved this time.
    pub replayed: bool,
}

impl RecoveryOutcome {
    pub(crate) fn from_record(scholarship: &Scholarship, record: &RecoveryRecord, replayed: bool) -> Self {
        Self {
            scholarship_id: scholarship.id,
            trigger: record.trigger,
            amount: record.amount,
            recipient: record.recipient.clone(),
            tx: record.tx,
            recovered_at: record.recovered_at,
            state: scholarship.state,
            replayed,
        }
    }
}

pub(crate) fn recovery_tx_id(id: ScholarshipId) -> TxId {
    TxId::derive("recover", &[&id.to_le_bytes()])
}

impl<L: LedgerPrimitive> EscrowEngine<L> {
    /// Recovers the remaining escrow of `id`. The trigger has to be backed
    /// by the stored record: an elapsed deadline for `ExpiryTimeout`, a
    /// milestone past its rejection limit for `VerificationExhausted`.
    /// Donor cancellations go through [`EscrowEngine::cancel_scholarship`].
    ///
    /// Once a scholarship has been recovered, every further call returns the
    /// original outcome with `replayed` set.
    pub fn recover(&self, id: ScholarshipId, trigger: RecoveryTrigger) -> Result<RecoveryOutcome, EscrowError> {
        let loaded = self.load(id)?;
        let current = &loaded.scholarship;
        if let Some(record) = &current.recovery {
            return Ok(RecoveryOutcome::from_record(current, record, true));
        }

        let now = self.now();
        let target = Target::Scholarship(id);
        match trigger {
            RecoveryTrigger::DonorCancel => {
                return Err(EscrowError::InvalidState {
                    target,
                    action: "recover for a donor cancellation of",
                    found: format!("{} with no cancellation on record", current.state),
                });
            }
            RecoveryTrigger::ExpiryTimeout => {
                current.require_active("expire")?;
                if !current.is_expired(now) {
                    return Err(EscrowError::InvalidState {
                        target,
                        action: "expire",
                        found: match current.expires_at {
                            Some(deadline) => format!("active until {deadline}"),
                            None => "active with no deadline".into(),
                        },
                    });
                }
            }
            RecoveryTrigger::VerificationExhausted => {
                current.require_active("recover")?;
                if current.exhausted_milestone().is_none() {
                    return Err(EscrowError::InvalidState {
                        target,
                        action: "recover",
                        found: "no milestone past its rejection limit".into(),
                    });
                }
            }
        }

        let mut next = current.clone();
        next.transition("recover", ScholarshipState::Recovered)?;
        self.commit_recovery(&loaded, next, trigger, now)
    }

    /// Expires every active scholarship whose deadline has passed. One
    /// failure does not stop the sweep; each id reports its own result.
    pub fn expire_due(&self) -> Result<Vec<(ScholarshipId, Result<RecoveryOutcome, EscrowError>)>, EscrowError> {
        let now = self.now();
        let mut results = Vec::new();
        for id in self.scholarship_ids()? {
            let loaded = match self.load(id) {
                Ok(loaded) => loaded,
                Err(err) => {
                    results.push((id, Err(err)));
                    continue;
                }
            };
            let scholarship = &loaded.scholarship;
            if scholarship.state == ScholarshipState::Active && scholarship.is_expired(now) {
                results.push((id, self.recover(id, RecoveryTrigger::ExpiryTimeout)));
            }
        }
        Ok(results)
    }

    /// Records the recovery on `next` (already in its terminal state) and
    /// commits it with the transfer of whatever escrow remains.
    pub(crate) fn commit_recovery(
        &self,
        loaded: &Loaded,
        mut next: Scholarship,
        trigger: RecoveryTrigger,
        now: u64,
    ) -> Result<RecoveryOutcome, EscrowError> {
        let id = next.id;
        let amount = next.remaining();
        let tx = recovery_tx_id(id);
        let record = RecoveryRecord {
            trigger,
            amount,
            recipient: next.recovery_address.clone(),
            tx,
            recovered_at: now,
        };
        let mut mutations = Vec::new();
        if amount > 0 {
            mutations.push(LedgerMutation::Transfer {
                escrow: next.escrow.clone(),
                to: record.recipient.clone(),
                amount,
                memo: Some(format!("scholarship:{id} recovery:{trigger}")),
            });
        }
        next.recovery = Some(record.clone());

        let receipt = self
            .commit_record(loaded, &next, tx, mutations, Target::Scholarship(id), now)
            .map_err(|err| {
                warn!(scholarship_id = id, %trigger, error = %err, "recovery not committed");
                err
            })?;
        info!(
            scholarship_id = id,
            %trigger,
            amount,
            recipient = %record.recipient,
            state = %next.state,
            "escrow recovered"
        );
        Ok(RecoveryOutcome::from_record(&next, &record, receipt.replayed))
    }
}
