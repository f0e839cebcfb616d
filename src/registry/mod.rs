//! Scholarship registry: the only writer of scholarship records.
//!
//! Records live in the ledger's contract storage as JSON under
//! `scholarship/<id>`. Every write is a `Put` guarded by the version the
//! caller read, so two writers racing on one scholarship cannot both win.
//! Other components build the next record and hand it to
//! [`EscrowEngine::commit_record`] together with the transfers it implies.

mod model;

pub use model::*;

use std::ops::Range;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::engine::EscrowEngine;
use crate::error::{ErrorKind, EscrowError, Target};
use crate::ledger::{
    AccountId, Amount, CommitReceipt, EscrowRef, LedgerMutation, LedgerPrimitive,
    LedgerTransaction, StateKey, StoredValue, TxId, Version,
};
use crate::recovery::RecoveryOutcome;

pub(crate) const NEXT_ID_KEY: &str = "meta/next_scholarship_id";

pub(crate) fn record_key(id: ScholarshipId) -> StateKey {
    format!("scholarship/{id}")
}

fn request_entry_key(donor: &AccountId, request_key: &str) -> StateKey {
    format!("request/{donor}/{request_key}")
}

const MAX_REQUEST_KEY_LEN: usize = 64;

/// Parameters of `create-scholarship`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewScholarship {
    /// Caller-chosen idempotency key, unique per donor. Repeating a create
    /// with the same key and terms returns the scholarship it opened.
    pub request_key: String,
    pub donor: AccountId,
    pub student: AccountId,
    pub recovery_address: AccountId,
    pub category: Category,
    pub total_amount: Amount,
    pub allocations: Vec<Amount>,
    /// Falls back to the configured policy.
    pub release_policy: Option<ReleasePolicy>,
    /// Seconds until the scholarship may be expired; falls back to the
    /// configured term.
    pub term_secs: Option<u64>,
}

impl NewScholarship {
    /// Hex digest of every term except the request key.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for field in [
            self.donor.as_str(),
            self.student.as_str(),
            self.recovery_address.as_str(),
            self.category.as_str(),
            self.release_policy.map_or("", |policy| policy.as_str()),
        ] {
            hasher.update((field.len() as u64).to_le_bytes());
            hasher.update(field.as_bytes());
        }
        hasher.update(self.total_amount.to_le_bytes());
        hasher.update((self.allocations.len() as u64).to_le_bytes());
        for amount in &self.allocations {
            hasher.update(amount.to_le_bytes());
        }
        match self.term_secs {
            Some(secs) => {
                hasher.update([1u8]);
                hasher.update(secs.to_le_bytes());
            }
            None => hasher.update([0u8]),
        }
        hex::encode(hasher.finalize())
    }
}

/// Stored under `request/<donor>/<key>`; binds a request key to the
/// scholarship it opened.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
struct RequestEntry {
    id: ScholarshipId,
    fingerprint: String,
}

/// A record together with the version it was read at.
#[derive(Clone, Debug)]
pub(crate) struct Loaded {
    pub(crate) scholarship: Scholarship,
    pub(crate) version: Version,
}

fn decode_record(id: ScholarshipId, stored: &StoredValue) -> Result<Scholarship, EscrowError> {
    let target = Target::Scholarship(id);
    let scholarship: Scholarship =
        serde_json::from_slice(&stored.value).map_err(|err| EscrowError::CorruptRecord {
            target,
            reason: err.to_string(),
        })?;
    if scholarship.id != id {
        return Err(EscrowError::CorruptRecord {
            target,
            reason: format!("record carries id {}", scholarship.id),
        });
    }
    scholarship
        .check_invariants()
        .map_err(|reason| EscrowError::CorruptRecord { target, reason })?;
    Ok(scholarship)
}

fn encode_json<T: Serialize>(value: &T) -> Result<Vec<u8>, EscrowError> {
    serde_json::to_vec(value).map_err(|err| EscrowError::CorruptRecord {
        target: Target::Request,
        reason: err.to_string(),
    })
}

fn encode_record(scholarship: &Scholarship, target: Target) -> Result<Vec<u8>, EscrowError> {
    serde_json::to_vec(scholarship).map_err(|err| EscrowError::CorruptRecord {
        target,
        reason: err.to_string(),
    })
}

impl<L: LedgerPrimitive> EscrowEngine<L> {
    /// Opens a scholarship and moves `total_amount` from the donor into its
    /// escrow in one ledger transaction. Nothing is stored if the escrow
    /// deposit fails.
    ///
    /// The same transaction claims `request/<donor>/<key>`, so a create
    /// retried after a lost reply returns the scholarship it already opened
    /// instead of escrowing a second time.
    pub fn create_scholarship(&self, request: NewScholarship) -> Result<Scholarship, EscrowError> {
        self.validate_request(&request)?;
        let fingerprint = request.fingerprint();
        let entry_key = request_entry_key(&request.donor, &request.request_key);
        if let Some(existing) = self.find_request(&request, &entry_key, &fingerprint)? {
            return Ok(existing);
        }

        let (id, next_id_version) = self.load_next_id()?;
        let now = self.now();
        let term = request.term_secs.or(self.config.default_term_secs);
        let tx_id = TxId::derive(
            "create",
            &[request.donor.as_bytes(), request.request_key.as_bytes()],
        );

        let mut scholarship = Scholarship {
            id,
            donor: request.donor.clone(),
            student: request.student.clone(),
            recovery_address: request.recovery_address.clone(),
            category: request.category,
            total_amount: request.total_amount,
            release_policy: request.release_policy.unwrap_or(self.config.release_policy),
            max_rejections: self.config.max_rejections,
            escrow: EscrowRef::for_scholarship(id),
            state: ScholarshipState::Pending,
            milestones: request
                .allocations
                .iter()
                .enumerate()
                .map(|(index, amount)| Milestone::locked(index as MilestoneIndex, *amount))
                .collect(),
            created_at: now,
            expires_at: term.map(|secs| now.saturating_add(secs)),
            recovery: None,
        };

        // The deposit commits with the record, so the scholarship is active
        // as soon as it exists.
        let deposit = LedgerMutation::Escrow {
            from: scholarship.donor.clone(),
            escrow: scholarship.escrow.clone(),
            amount: scholarship.total_amount,
        };
        scholarship.transition("activate", ScholarshipState::Active)?;

        let tx = LedgerTransaction::new(tx_id)
            .with(LedgerMutation::Put {
                key: entry_key.clone(),
                expected: Version::ABSENT,
                value: encode_json(&RequestEntry { id, fingerprint: fingerprint.clone() })?,
            })
            .with(LedgerMutation::Put {
                key: NEXT_ID_KEY.to_string(),
                expected: next_id_version,
                value: encode_json(&(id + 1))?,
            })
            .with(LedgerMutation::Put {
                key: record_key(id),
                expected: Version::ABSENT,
                value: encode_record(&scholarship, Target::Request)?,
            })
            .with(deposit);
        if let Err(err) = self.ledger.commit(&tx, now) {
            let err = EscrowError::from_ledger(Target::Request, err);
            // A racer with the same key may have opened it first.
            if err.kind() == ErrorKind::Conflict {
                if let Some(existing) = self.find_request(&request, &entry_key, &fingerprint)? {
                    return Ok(existing);
                }
            }
            warn!(donor = %scholarship.donor, request_key = %request.request_key, error = %err, "scholarship creation failed");
            return Err(err);
        }

        info!(
            scholarship_id = id,
            donor = %scholarship.donor,
            student = %scholarship.student,
            amount = scholarship.total_amount,
            milestones = scholarship.milestones.len(),
            "scholarship created"
        );
        Ok(scholarship)
    }

    /// The scholarship a previous create with this key opened, if any.
    fn find_request(
        &self,
        request: &NewScholarship,
        entry_key: &StateKey,
        fingerprint: &str,
    ) -> Result<Option<Scholarship>, EscrowError> {
        let stored = self
            .ledger
            .read_state(entry_key)
            .map_err(|err| EscrowError::from_ledger(Target::Request, err))?;
        let Some(stored) = stored else {
            return Ok(None);
        };
        let entry: RequestEntry =
            serde_json::from_slice(&stored.value).map_err(|err| EscrowError::CorruptRecord {
                target: Target::Request,
                reason: format!("{entry_key}: {err}"),
            })?;
        if entry.fingerprint != fingerprint {
            return Err(EscrowError::DuplicateRequest {
                donor: request.donor.clone(),
                key: request.request_key.clone(),
                existing: entry.id,
            });
        }
        let existing = self.load(entry.id)?.scholarship;
        info!(
            scholarship_id = existing.id,
            request_key = %request.request_key,
            "create replayed"
        );
        Ok(Some(existing))
    }

    /// Donor-initiated cancellation. Returns the full undisbursed balance to
    /// the recovery address in the same transaction. Repeating a successful
    /// cancellation returns the original outcome.
    pub fn cancel_scholarship(
        &self,
        id: ScholarshipId,
        requester: &AccountId,
    ) -> Result<RecoveryOutcome, EscrowError> {
        let loaded = self.load(id)?;
        let current = &loaded.scholarship;
        if requester != &current.donor {
            return Err(EscrowError::Unauthorized {
                target: Target::Scholarship(id),
                actor: requester.clone(),
                action: "cancel",
            });
        }
        if let Some(record) = &current.recovery {
            if current.state == ScholarshipState::Cancelled {
                return Ok(RecoveryOutcome::from_record(current, record, true));
            }
        }
        if !matches!(current.state, ScholarshipState::Pending | ScholarshipState::Active) {
            return Err(current.invalid_state("cancel"));
        }
        if let Some(paid) = current
            .milestones
            .iter()
            .find(|m| matches!(m.state, MilestoneState::Verified | MilestoneState::Released))
        {
            return Err(EscrowError::InvalidState {
                target: Target::Milestone(id, paid.index),
                action: "cancel",
                found: paid.state.to_string(),
            });
        }

        let mut next = current.clone();
        next.transition("cancel", ScholarshipState::Cancelled)?;
        self.commit_recovery(&loaded, next, RecoveryTrigger::DonorCancel, self.now())
    }

    fn validate_request(&self, request: &NewScholarship) -> Result<(), EscrowError> {
        let key = &request.request_key;
        let reason = if key.is_empty() {
            Some("empty")
        } else if key.len() > MAX_REQUEST_KEY_LEN {
            Some("longer than 64 characters")
        } else if !key.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')) {
            Some("only ASCII letters, digits, '-', '_' and '.' are allowed")
        } else {
            None
        };
        if let Some(reason) = reason {
            return Err(EscrowError::InvalidRequestKey {
                key: key.clone(),
                reason,
            });
        }

        let network = self.config.network;
        for address in [&request.donor, &request.student, &request.recovery_address] {
            if !network.is_valid_address(address) {
                return Err(EscrowError::InvalidAddress {
                    address: address.clone(),
                    network,
                });
            }
        }

        let count = request.allocations.len();
        if count == 0 || count > self.config.max_milestones {
            return Err(EscrowError::InvalidMilestoneCount {
                count,
                max: Some(self.config.max_milestones),
            });
        }

        let mut sum: Amount = 0;
        for (index, amount) in request.allocations.iter().enumerate() {
            if *amount == 0 {
                return Err(EscrowError::InvalidAllocation {
                    reason: format!("milestone {index} has a zero allocation"),
                });
            }
            sum = sum.checked_add(*amount).ok_or_else(|| EscrowError::InvalidAllocation {
                reason: "allocations overflow".into(),
            })?;
        }
        if sum != request.total_amount {
            return Err(EscrowError::InvalidAllocation {
                reason: format!("allocations sum to {sum}, total is {}", request.total_amount),
            });
        }
        if request.total_amount < self.config.min_total_amount
            || request.total_amount > self.config.max_total_amount
        {
            return Err(EscrowError::InvalidAllocation {
                reason: format!(
                    "total {} outside {}..={}",
                    request.total_amount, self.config.min_total_amount, self.config.max_total_amount
                ),
            });
        }
        Ok(())
    }

    pub(crate) fn load(&self, id: ScholarshipId) -> Result<Loaded, EscrowError> {
        let target = Target::Scholarship(id);
        let stored = self
            .ledger
            .read_state(&record_key(id))
            .map_err(|err| EscrowError::from_ledger(target, err))?
            .ok_or(EscrowError::NotFound { target })?;
        Ok(Loaded {
            scholarship: decode_record(id, &stored)?,
            version: stored.version,
        })
    }

    fn load_next_id(&self) -> Result<(ScholarshipId, Version), EscrowError> {
        let stored = self
            .ledger
            .read_state(&NEXT_ID_KEY.to_string())
            .map_err(|err| EscrowError::from_ledger(Target::Request, err))?;
        match stored {
            None => Ok((1, Version::ABSENT)),
            Some(stored) => {
                let next: ScholarshipId =
                    serde_json::from_slice(&stored.value).map_err(|err| EscrowError::CorruptRecord {
                        target: Target::Request,
                        reason: format!("{NEXT_ID_KEY}: {err}"),
                    })?;
                Ok((next, stored.version))
            }
        }
    }

    /// Every id handed out so far.
    pub(crate) fn scholarship_ids(&self) -> Result<Range<ScholarshipId>, EscrowError> {
        let (next, _) = self.load_next_id()?;
        Ok(1..next)
    }

    /// Writes `next` over the record in `loaded`, guarded by its version,
    /// together with `mutations` in a single ledger transaction.
    pub(crate) fn commit_record(
        &self,
        loaded: &Loaded,
        next: &Scholarship,
        tx_id: TxId,
        mutations: Vec<LedgerMutation>,
        target: Target,
        now: u64,
    ) -> Result<CommitReceipt, EscrowError> {
        next.check_invariants()
            .map_err(|reason| EscrowError::CorruptRecord { target, reason })?;
        let mut tx = LedgerTransaction::new(tx_id).with(LedgerMutation::Put {
            key: record_key(next.id),
            expected: loaded.version,
            value: encode_record(next, target)?,
        });
        tx.mutations.extend(mutations);
        self.ledger.commit(&tx, now).map_err(|err| {
            let err = EscrowError::from_ledger(target, err).with_prior(loaded.scholarship.state);
            warn!(
                scholarship_id = next.id,
                milestone = ?target.milestone(),
                prior_state = %loaded.scholarship.state,
                error = %err,
                "commit refused"
            );
            err
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::ManualClock;
    use crate::config::EscrowConfig;
    use crate::ledger::{Fault, InMemoryLedger};

    fn engine() -> EscrowEngine<Arc<InMemoryLedger>> {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.fund(&"donor".into(), 10_000, 0).unwrap();
        let config = EscrowConfig {
            network: crate::config::Network::Devnet,
            default_term_secs: Some(3_600),
            ..EscrowConfig::default()
        };
        EscrowEngine::with_clock(ledger, config, Arc::new(ManualClock::new(1_000)))
    }

    fn request(total: Amount, allocations: Vec<Amount>) -> NewScholarship {
        NewScholarship {
            request_key: TxId::random().to_hex(),
            donor: "donor".into(),
            student: "student".into(),
            recovery_address: "fallback".into(),
            category: Category::Academic,
            total_amount: total,
            allocations,
            release_policy: None,
            term_secs: None,
        }
    }

    #[test]
    fn create_escrows_funds_and_assigns_sequential_ids() {
        let engine = engine();
        let first = engine.create_scholarship(request(500, vec![200, 150, 150])).unwrap();
        let second = engine.create_scholarship(request(100, vec![100])).unwrap();
        assert_eq!((first.id, second.id), (1, 2));
        assert_eq!(first.state, ScholarshipState::Active);
        assert_eq!(first.expires_at, Some(4_600));
        assert_eq!(first.release_policy, ReleasePolicy::Sequential);
        assert_eq!(engine.ledger().balance(&"donor".into()).unwrap(), 9_400);
        assert_eq!(engine.ledger().escrow_balance(&first.escrow).unwrap(), 500);
        assert_eq!(engine.load(1).unwrap().scholarship, first);
        assert_eq!(engine.scholarship_ids().unwrap(), 1..3);
    }

    #[test]
    fn create_rejects_bad_allocations() {
        let engine = engine();
        assert!(matches!(
            engine.create_scholarship(request(500, vec![200, 200])),
            Err(EscrowError::InvalidAllocation { .. })
        ));
        assert!(matches!(
            engine.create_scholarship(request(500, vec![500, 0])),
            Err(EscrowError::InvalidAllocation { .. })
        ));
        assert!(matches!(
            engine.create_scholarship(request(0, vec![])),
            Err(EscrowError::InvalidMilestoneCount { count: 0, .. })
        ));
        assert!(matches!(
            engine.create_scholarship(request(21, vec![1; 21])),
            Err(EscrowError::InvalidMilestoneCount { count: 21, max: Some(20) })
        ));
        let mut blank = request(10, vec![10]);
        blank.student = " ".into();
        assert!(matches!(
            engine.create_scholarship(blank),
            Err(EscrowError::InvalidAddress { .. })
        ));
    }

    #[test]
    fn failed_escrow_creates_nothing() {
        let engine = engine();
        let err = engine.create_scholarship(request(20_000, vec![20_000])).unwrap_err();
        assert!(matches!(err, EscrowError::TransferFailed { target: Target::Request, .. }));
        assert!(matches!(engine.load(1), Err(EscrowError::NotFound { .. })));

        engine.ledger().inject_fault(Fault::Unavailable).unwrap();
        let err = engine.create_scholarship(request(100, vec![100])).unwrap_err();
        assert!(matches!(err, EscrowError::PrimitiveUnavailable { .. }));
        assert!(err.is_retryable());
        assert_eq!(engine.scholarship_ids().unwrap(), 1..1);
        assert_eq!(engine.ledger().balance(&"donor".into()).unwrap(), 10_000);
    }

    #[test]
    fn cancel_requires_donor_and_is_idempotent() {
        let engine = engine();
        let scholarship = engine.create_scholarship(request(100, vec![50, 50])).unwrap();
        let err = engine.cancel_scholarship(scholarship.id, &"student".into()).unwrap_err();
        assert!(matches!(err, EscrowError::Unauthorized { action: "cancel", .. }));

        let outcome = engine.cancel_scholarship(scholarship.id, &"donor".into()).unwrap();
        assert_eq!(outcome.amount, 100);
        assert_eq!(outcome.recipient, "fallback");
        assert_eq!(outcome.state, ScholarshipState::Cancelled);
        assert!(!outcome.replayed);

        let again = engine.cancel_scholarship(scholarship.id, &"donor".into()).unwrap();
        assert!(again.replayed);
        assert_eq!(again.tx, outcome.tx);
        assert_eq!(engine.ledger().balance(&"fallback".into()).unwrap(), 100);
    }

    #[test]
    fn corrupt_record_is_reported_not_parsed() {
        let engine = engine();
        engine
            .ledger()
            .commit(
                &LedgerTransaction::new(TxId::random()).with(LedgerMutation::Put {
                    key: record_key(1),
                    expected: Version::ABSENT,
                    value: br#"{"id":1,"state":"active"}"#.to_vec(),
                }),
                1,
            )
            .unwrap();
        assert!(matches!(
            engine.load(1),
            Err(EscrowError::CorruptRecord { target: Target::Scholarship(1), .. })
        ));
    }

    #[test]
    fn create_retried_after_lost_reply_escrows_once() {
        let engine = engine();
        let first = request(100, vec![50, 50]);
        engine.ledger().inject_fault(Fault::UnavailableAfterCommit).unwrap();
        let err = engine.create_scholarship(first.clone()).unwrap_err();
        assert!(matches!(err, EscrowError::PrimitiveUnavailable { .. }));
        assert!(err.is_retryable());

        let retried = engine.create_scholarship(first.clone()).unwrap();
        assert_eq!(retried.id, 1);
        assert_eq!(retried.total_amount, 100);
        assert_eq!(engine.ledger().balance(&"donor".into()).unwrap(), 9_900);
        assert_eq!(engine.scholarship_ids().unwrap(), 1..2);

        let mut changed = first.clone();
        changed.student = "someone-else".into();
        let err = engine.create_scholarship(changed).unwrap_err();
        assert!(matches!(err, EscrowError::DuplicateRequest { existing: 1, .. }));
        assert!(!err.is_retryable());

        let mut other_donor = first;
        other_donor.donor = "second-donor".into();
        engine.ledger().fund(&"second-donor".into(), 100, 0).unwrap();
        assert_eq!(engine.create_scholarship(other_donor).unwrap().id, 2);
    }

    #[test]
    fn malformed_request_key_is_refused() {
        let engine = engine();
        for key in ["", "has space", "a/b", "k".repeat(65).as_str()] {
            let mut bad = request(10, vec![10]);
            bad.request_key = key.to_string();
            assert!(matches!(
                engine.create_scholarship(bad),
                Err(EscrowError::InvalidRequestKey { .. })
            ));
        }
    }

    #[test]
    fn stale_writer_conflict_reports_the_state_it_read() {
        let engine = engine();
        let id = engine.create_scholarship(request(100, vec![100])).unwrap().id;
        let stale = engine.load(id).unwrap();
        engine.submit_claim(id, 0, &"student".into(), "ipfs://work").unwrap();

        let err = engine
            .commit_record(&stale, &stale.scholarship, TxId::random(), Vec::new(), Target::Scholarship(id), 2_000)
            .unwrap_err();
        assert!(matches!(
            err,
            EscrowError::StateConflict {
                target: Target::Scholarship(1),
                prior: Some(ScholarshipState::Active),
                ..
            }
        ));
    }
}
