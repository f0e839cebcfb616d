//! Read-only projections for callers. Every call reads the latest committed
//! record; nothing is cached.

use serde::Serialize;

use crate::engine::EscrowEngine;
use crate::error::EscrowError;
use crate::ledger::{AccountId, Amount, LedgerPrimitive};
use crate::registry::{
    Category, ClaimRecord, Milestone, MilestoneIndex, MilestoneState, RecoveryRecord,
    ReleasePolicy, ReleaseRecord, Scholarship, ScholarshipId, ScholarshipState,
};

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct MilestoneView {
    pub scholarship_id: ScholarshipId,
    pub index: MilestoneIndex,
    pub allocated_amount: Amount,
    pub released_amount: Amount,
    pub state: MilestoneState,
    pub claimant: Option<AccountId>,
    pub rejections: u32,
    pub claims: Vec<ClaimRecord>,
    pub release: Option<ReleaseRecord>,
}

impl MilestoneView {
    fn new(scholarship_id: ScholarshipId, milestone: &Milestone) -> Self {
        Self {
            scholarship_id,
            index: milestone.index,
            allocated_amount: milestone.allocated_amount,
            released_amount: milestone.released_amount,
            state: milestone.state,
            claimant: milestone.claimant.clone(),
            rejections: milestone.rejections,
            claims: milestone.claims.clone(),
            release: milestone.release.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct ScholarshipView {
    pub id: ScholarshipId,
    pub donor: AccountId,
    pub student: AccountId,
    pub recovery_address: AccountId,
    pub category: Category,
    pub title: &'static str,
    pub total_amount: Amount,
    pub total_released: Amount,
    pub remaining: Amount,
    pub release_policy: ReleasePolicy,
    pub state: ScholarshipState,
    /// Cancelled-with-refund and Recovered both report `true`.
    pub recovered: bool,
    pub milestone_count: usize,
    pub milestones_completed: usize,
    pub progress_percent: u8,
    pub created_at: u64,
    pub expires_at: Option<u64>,
    pub recovery: Option<RecoveryRecord>,
    pub milestones: Vec<MilestoneView>,
}

impl From<&Scholarship> for ScholarshipView {
    fn from(scholarship: &Scholarship) -> Self {
        let completed = scholarship.released_count();
        let count = scholarship.milestones.len();
        let remaining = if scholarship.is_recovered() {
            0
        } else {
            scholarship.remaining()
        };
        Self {
            id: scholarship.id,
            donor: scholarship.donor.clone(),
            student: scholarship.student.clone(),
            recovery_address: scholarship.recovery_address.clone(),
            category: scholarship.category,
            title: scholarship.category.title(),
            total_amount: scholarship.total_amount,
            total_released: scholarship.total_released(),
            remaining,
            release_policy: scholarship.release_policy,
            state: scholarship.state,
            recovered: scholarship.is_recovered(),
            milestone_count: count,
            milestones_completed: completed,
            progress_percent: progress_percent(completed, count),
            created_at: scholarship.created_at,
            expires_at: scholarship.expires_at,
            recovery: scholarship.recovery.clone(),
            milestones: scholarship
                .milestones
                .iter()
                .map(|m| MilestoneView::new(scholarship.id, m))
                .collect(),
        }
    }
}

/// `completed / total` as a whole percentage, rounding halves up.
pub fn progress_percent(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    let scaled = (completed.min(total) * 200 + total) / (total * 2);
    scaled as u8
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StudentStatus {
    /// At least one scholarship is still paying out.
    Active,
    /// Everything awarded has finished and at least one completed.
    Completed,
    Inactive,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct StudentSummary {
    pub student: AccountId,
    pub scholarships: Vec<ScholarshipId>,
    pub total_awarded: Amount,
    pub total_received: Amount,
    pub milestones_completed: usize,
    pub milestones_total: usize,
    pub status: StudentStatus,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScholarshipFilter {
    pub donor: Option<AccountId>,
    pub student: Option<AccountId>,
    pub state: Option<ScholarshipState>,
}

impl ScholarshipFilter {
    pub fn matches(&self, scholarship: &Scholarship) -> bool {
        self.donor.as_ref().map_or(true, |d| d == &scholarship.donor)
            && self.student.as_ref().map_or(true, |s| s == &scholarship.student)
            && self.state.map_or(true, |s| s == scholarship.state)
    }
}

impl<L: LedgerPrimitive> EscrowEngine<L> {
    pub fn get_scholarship(&self, id: ScholarshipId) -> Result<ScholarshipView, EscrowError> {
        Ok(ScholarshipView::from(&self.load(id)?.scholarship))
    }

    pub fn get_milestone(&self, id: ScholarshipId, index: MilestoneIndex) -> Result<MilestoneView, EscrowError> {
        let scholarship = self.load(id)?.scholarship;
        Ok(MilestoneView::new(id, scholarship.milestone(index)?))
    }

    /// Aggregates every scholarship awarded to `student`. A student with no
    /// scholarships gets an all-zero, inactive summary.
    pub fn get_student_info(&self, student: &AccountId) -> Result<StudentSummary, EscrowError> {
        let filter = ScholarshipFilter {
            student: Some(student.clone()),
            ..ScholarshipFilter::default()
        };
        let mut summary = StudentSummary {
            student: student.clone(),
            scholarships: Vec::new(),
            total_awarded: 0,
            total_received: 0,
            milestones_completed: 0,
            milestones_total: 0,
            status: StudentStatus::Inactive,
        };
        let mut any_active = false;
        let mut any_completed = false;
        for scholarship in self.scan(&filter)? {
            summary.scholarships.push(scholarship.id);
            summary.total_awarded = summary.total_awarded.saturating_add(scholarship.total_amount);
            summary.total_received = summary.total_received.saturating_add(scholarship.total_released());
            summary.milestones_completed += scholarship.released_count();
            summary.milestones_total += scholarship.milestones.len();
            any_active |= scholarship.state == ScholarshipState::Active;
            any_completed |= scholarship.state == ScholarshipState::Completed;
        }
        summary.status = if any_active {
            StudentStatus::Active
        } else if any_completed {
            StudentStatus::Completed
        } else {
            StudentStatus::Inactive
        };
        Ok(summary)
    }

    /// Dashboard listing in id order.
    pub fn list_scholarships(&self, filter: &ScholarshipFilter) -> Result<Vec<ScholarshipView>, EscrowError> {
        Ok(self.scan(filter)?.iter().map(ScholarshipView::from).collect())
    }

    fn scan(&self, filter: &ScholarshipFilter) -> Result<Vec<Scholarship>, EscrowError> {
        let mut found = Vec::new();
        for id in self.scholarship_ids()? {
            let scholarship = self.load(id)?.scholarship;
            if filter.matches(&scholarship) {
                found.push(scholarship);
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{EscrowConfig, Network};
    use crate::error::Target;
    use crate::ledger::InMemoryLedger;
    use crate::registry::{NewScholarship, Verdict};

    fn engine() -> EscrowEngine<Arc<InMemoryLedger>> {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.fund(&"ana".into(), 10_000, 0).unwrap();
        ledger.fund(&"ben".into(), 10_000, 0).unwrap();
        let config = EscrowConfig {
            network: Network::Devnet,
            ..EscrowConfig::default()
        }
        .with_verifier("registrar");
        EscrowEngine::with_clock(ledger, config, Arc::new(ManualClock::new(0)))
    }

    fn open(engine: &EscrowEngine<Arc<InMemoryLedger>>, donor: &str, student: &str, allocations: Vec<Amount>) -> ScholarshipId {
        engine
            .create_scholarship(NewScholarship {
                request_key: crate::ledger::TxId::random().to_hex(),
                donor: donor.into(),
                student: student.into(),
                recovery_address: donor.into(),
                category: Category::Arts,
                total_amount: allocations.iter().sum(),
                allocations,
                release_policy: None,
                term_secs: None,
            })
            .unwrap()
            .id
    }

    fn pay(engine: &EscrowEngine<Arc<InMemoryLedger>>, id: ScholarshipId, index: MilestoneIndex) {
        engine.submit_claim(id, index, &engine.load(id).unwrap().scholarship.student, "ipfs://ok").unwrap();
        engine.decide(id, index, Verdict::Accept, &"registrar".into()).unwrap();
    }

    #[test]
    fn progress_rounds_half_up() {
        assert_eq!(progress_percent(0, 3), 0);
        assert_eq!(progress_percent(1, 3), 33);
        assert_eq!(progress_percent(2, 3), 67);
        assert_eq!(progress_percent(1, 8), 13);
        assert_eq!(progress_percent(3, 3), 100);
        assert_eq!(progress_percent(0, 0), 0);
    }

    #[test]
    fn views_report_totals_and_progress() {
        let engine = engine();
        let id = open(&engine, "ana", "sam", vec![200, 150, 150]);
        pay(&engine, id, 0);
        let view = engine.get_scholarship(id).unwrap();
        assert_eq!(view.title, "Arts and Culture");
        assert_eq!(view.total_released, 200);
        assert_eq!(view.remaining, 300);
        assert_eq!(view.milestones_completed, 1);
        assert_eq!(view.progress_percent, 33);
        assert!(!view.recovered);

        let milestone = engine.get_milestone(id, 0).unwrap();
        assert_eq!(milestone.state, MilestoneState::Released);
        assert_eq!(milestone.release.unwrap().amount, 200);
        assert!(matches!(
            engine.get_milestone(id, 3),
            Err(EscrowError::NotFound { target: Target::Milestone(_, 3) })
        ));
        assert!(matches!(engine.get_scholarship(99), Err(EscrowError::NotFound { .. })));
    }

    #[test]
    fn cancelled_scholarship_reads_as_recovered() {
        let engine = engine();
        let id = open(&engine, "ana", "sam", vec![50, 50]);
        engine.cancel_scholarship(id, &"ana".into()).unwrap();
        let view = engine.get_scholarship(id).unwrap();
        assert_eq!(view.state, ScholarshipState::Cancelled);
        assert!(view.recovered);
        assert_eq!(view.remaining, 0);
    }

    #[test]
    fn student_info_aggregates_across_scholarships() {
        let engine = engine();
        let first = open(&engine, "ana", "sam", vec![100]);
        let second = open(&engine, "ben", "sam", vec![40, 60]);
        open(&engine, "ben", "kim", vec![10]);
        pay(&engine, first, 0);
        pay(&engine, second, 0);

        let info = engine.get_student_info(&"sam".into()).unwrap();
        assert_eq!(info.scholarships, vec![first, second]);
        assert_eq!(info.total_awarded, 200);
        assert_eq!(info.total_received, 140);
        assert_eq!(info.milestones_completed, 2);
        assert_eq!(info.milestones_total, 3);
        assert_eq!(info.status, StudentStatus::Active);

        pay(&engine, second, 1);
        let info = engine.get_student_info(&"sam".into()).unwrap();
        assert_eq!(info.status, StudentStatus::Completed);

        let nobody = engine.get_student_info(&"zed".into()).unwrap();
        assert!(nobody.scholarships.is_empty());
        assert_eq!(nobody.total_received, 0);
        assert_eq!(nobody.status, StudentStatus::Inactive);
    }

    #[test]
    fn listing_filters_by_donor_and_state() {
        let engine = engine();
        let a = open(&engine, "ana", "sam", vec![10]);
        let b = open(&engine, "ben", "sam", vec![10]);
        let c = open(&engine, "ben", "kim", vec![10]);
        pay(&engine, c, 0);

        let all = engine.list_scholarships(&ScholarshipFilter::default()).unwrap();
        assert_eq!(all.iter().map(|v| v.id).collect::<Vec<_>>(), vec![a, b, c]);

        let ben_active = engine
            .list_scholarships(&ScholarshipFilter {
                donor: Some("ben".into()),
                state: Some(ScholarshipState::Active),
                ..ScholarshipFilter::default()
            })
            .unwrap();
        assert_eq!(ben_active.len(), 1);
        assert_eq!(ben_active[0].id, b);
    }
}
