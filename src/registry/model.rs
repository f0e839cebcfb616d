use serde::{Deserialize, Serialize};

use crate::error::{EscrowError, Target};
use crate::labels::string_enum;
pub use crate::labels::ParseError;
use crate::ledger::{AccountId, Amount, EscrowRef, TxId};

pub type ScholarshipId = u64;
pub type MilestoneIndex = u32;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Academic,
    Sports,
    Arts,
    Technology,
}

string_enum!(Category, "category", {
    Academic => "academic",
    Sports => "sports",
    Arts => "arts",
    Technology => "technology",
});

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Academic,
        Category::Sports,
        Category::Arts,
        Category::Technology,
    ];

    pub fn title(&self) -> &'static str {
        match self {
            Category::Academic => "Academic Excellence",
            Category::Sports => "Sports Achievement",
            Category::Arts => "Arts and Culture",
            Category::Technology => "Technology and Innovation",
        }
    }
}

/// Whether milestones must be released in index order.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReleasePolicy {
    #[default]
    Sequential,
    Unordered,
}

string_enum!(ReleasePolicy, "release policy", {
    Sequential => "sequential",
    Unordered => "unordered",
});

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScholarshipState {
    Pending,
    Active,
    Completed,
    Cancelled,
    Recovered,
}

string_enum!(ScholarshipState, "scholarship state", {
    Pending => "pending",
    Active => "active",
    Completed => "completed",
    Cancelled => "cancelled",
    Recovered => "recovered",
});

impl ScholarshipState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScholarshipState::Completed | ScholarshipState::Cancelled | ScholarshipState::Recovered
        )
    }

    pub fn can_transition_to(&self, next: ScholarshipState) -> bool {
        use ScholarshipState::*;
        matches!(
            (self, next),
            (Pending, Active) | (Pending, Cancelled) | (Active, Completed) | (Active, Cancelled) | (Active, Recovered)
        )
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneState {
    Locked,
    Claimed,
    Verified,
    Released,
    Rejected,
}

string_enum!(MilestoneState, "milestone state", {
    Locked => "locked",
    Claimed => "claimed",
    Verified => "verified",
    Released => "released",
    Rejected => "rejected",
});

impl MilestoneState {
    pub fn can_transition_to(&self, next: MilestoneState) -> bool {
        use MilestoneState::*;
        matches!(
            (self, next),
            (Locked, Claimed) | (Rejected, Claimed) | (Claimed, Verified) | (Claimed, Rejected) | (Verified, Released)
        )
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Accept,
    Reject,
}

string_enum!(Verdict, "verdict", {
    Accept => "accept",
    Reject => "reject",
});

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryTrigger {
    DonorCancel,
    VerificationExhausted,
    ExpiryTimeout,
}

string_enum!(RecoveryTrigger, "recovery trigger", {
    DonorCancel => "donor_cancel",
    VerificationExhausted => "verification_exhausted",
    ExpiryTimeout => "expiry_timeout",
});

/// One completion claim and, once decided, its verdict.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClaimRecord {
    pub attempt: u32,
    pub claimant: AccountId,
    pub evidence_ref: String,
    pub submitted_at: u64,
    pub verdict: Option<Verdict>,
    pub verifier: Option<AccountId>,
    pub decided_at: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReleaseRecord {
    pub amount: Amount,
    pub recipient: AccountId,
    pub tx: TxId,
    pub released_at: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecoveryRecord {
    pub trigger: RecoveryTrigger,
    pub amount: Amount,
    pub recipient: AccountId,
    pub tx: TxId,
    pub recovered_at: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Milestone {
    pub index: MilestoneIndex,
    pub allocated_amount: Amount,
    pub released_amount: Amount,
    pub state: MilestoneState,
    pub claimant: Option<AccountId>,
    pub rejections: u32,
    pub claims: Vec<ClaimRecord>,
    pub release: Option<ReleaseRecord>,
}

impl Milestone {
    pub fn locked(index: MilestoneIndex, allocated_amount: Amount) -> Self {
        Self {
            index,
            allocated_amount,
            released_amount: 0,
            state: MilestoneState::Locked,
            claimant: None,
            rejections: 0,
            claims: Vec::new(),
            release: None,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.claims.len() as u32
    }

    pub(crate) fn transition(
        &mut self,
        scholarship_id: ScholarshipId,
        action: &'static str,
        next: MilestoneState,
    ) -> Result<(), EscrowError> {
        if !self.state.can_transition_to(next) {
            return Err(EscrowError::InvalidState {
                target: Target::Milestone(scholarship_id, self.index),
                action,
                found: self.state.to_string(),
            });
        }
        self.state = next;
        Ok(())
    }

    pub(crate) fn open_claim_mut(&mut self) -> Option<&mut ClaimRecord> {
        self.claims.last_mut().filter(|claim| claim.verdict.is_none())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Scholarship {
    pub id: ScholarshipId,
    pub donor: AccountId,
    pub student: AccountId,
    pub recovery_address: AccountId,
    pub category: Category,
    pub total_amount: Amount,
    pub release_policy: ReleasePolicy,
    /// Reject verdicts one milestone may absorb before recovery.
    pub max_rejections: u32,
    pub escrow: EscrowRef,
    pub state: ScholarshipState,
    pub milestones: Vec<Milestone>,
    pub created_at: u64,
    pub expires_at: Option<u64>,
    pub recovery: Option<RecoveryRecord>,
}

impl Scholarship {
    pub fn total_released(&self) -> Amount {
        self.milestones.iter().map(|m| m.released_amount).sum()
    }

    pub fn remaining(&self) -> Amount {
        self.total_amount.saturating_sub(self.total_released())
    }

    pub fn released_count(&self) -> usize {
        self.milestones
            .iter()
            .filter(|m| m.state == MilestoneState::Released)
            .count()
    }

    /// Cancelled with funds returned counts as recovered.
    pub fn is_recovered(&self) -> bool {
        self.recovery.is_some()
    }

    /// First milestone whose rejections went past the stored limit.
    pub fn exhausted_milestone(&self) -> Option<&Milestone> {
        self.milestones
            .iter()
            .find(|m| m.rejections > self.max_rejections)
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at.map_or(false, |deadline| now >= deadline)
    }

    pub fn milestone(&self, index: MilestoneIndex) -> Result<&Milestone, EscrowError> {
        self.milestones
            .get(index as usize)
            .ok_or(EscrowError::NotFound {
                target: Target::Milestone(self.id, index),
            })
    }

    pub(crate) fn milestone_mut(&mut self, index: MilestoneIndex) -> Result<&mut Milestone, EscrowError> {
        let id = self.id;
        self.milestones
            .get_mut(index as usize)
            .ok_or(EscrowError::NotFound {
                target: Target::Milestone(id, index),
            })
    }

    pub(crate) fn transition(&mut self, action: &'static str, next: ScholarshipState) -> Result<(), EscrowError> {
        if !self.state.can_transition_to(next) {
            return Err(self.invalid_state(action));
        }
        self.state = next;
        Ok(())
    }

    pub(crate) fn invalid_state(&self, action: &'static str) -> EscrowError {
        EscrowError::InvalidState {
            target: Target::Scholarship(self.id),
            action,
            found: self.state.to_string(),
        }
    }

    pub(crate) fn require_active(&self, action: &'static str) -> Result<(), EscrowError> {
        if self.state != ScholarshipState::Active {
            return Err(self.invalid_state(action));
        }
        Ok(())
    }

    /// Checks that `index` may receive a new claim under the stored policy.
    pub(crate) fn ensure_claimable(&self, index: MilestoneIndex) -> Result<(), EscrowError> {
        self.require_active("claim")?;
        let milestone = self.milestone(index)?;
        if !milestone.state.can_transition_to(MilestoneState::Claimed) {
            return Err(EscrowError::InvalidState {
                target: Target::Milestone(self.id, index),
                action: "claim",
                found: milestone.state.to_string(),
            });
        }
        if self.release_policy == ReleasePolicy::Sequential {
            if let Some(blocker) = self.milestones[..index as usize]
                .iter()
                .find(|m| m.state != MilestoneState::Released)
            {
                return Err(EscrowError::InvalidState {
                    target: Target::Milestone(self.id, index),
                    action: "claim",
                    found: format!("milestone {} {}", blocker.index, blocker.state),
                });
            }
        }
        Ok(())
    }

    /// Structural invariants every stored record must satisfy.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.milestones.is_empty() {
            return Err("scholarship has no milestones".into());
        }
        let mut allocated: Amount = 0;
        for (position, milestone) in self.milestones.iter().enumerate() {
            if milestone.index as usize != position {
                return Err(format!("milestone at position {position} has index {}", milestone.index));
            }
            if milestone.released_amount > milestone.allocated_amount {
                return Err(format!("milestone {position} released more than allocated"));
            }
            let released = milestone.state == MilestoneState::Released;
            if released != (milestone.released_amount == milestone.allocated_amount && milestone.release.is_some()) {
                return Err(format!("milestone {position} release bookkeeping inconsistent"));
            }
            allocated = allocated
                .checked_add(milestone.allocated_amount)
                .ok_or("allocation overflow")?;
        }
        if allocated != self.total_amount {
            return Err(format!("allocations sum to {allocated}, total is {}", self.total_amount));
        }
        if self.total_released() > self.total_amount {
            return Err("released exceeds total".into());
        }
        let all_released = self.released_count() == self.milestones.len();
        if (self.state == ScholarshipState::Completed) != all_released {
            return Err(format!("state {} disagrees with {} released milestones", self.state, self.released_count()));
        }
        if self.state == ScholarshipState::Recovered && self.recovery.is_none() {
            return Err("recovered scholarship has no recovery record".into());
        }
        Ok(())
    }
}

/// Splits `total` into `count` positive tranches; the last one absorbs the
/// remainder.
pub fn even_split(total: Amount, count: usize) -> Result<Vec<Amount>, EscrowError> {
    if count == 0 {
        return Err(EscrowError::InvalidMilestoneCount { count, max: None });
    }
    let base = total / count as u64;
    if base == 0 {
        return Err(EscrowError::InvalidAllocation {
            reason: format!("{total} cannot be split into {count} positive tranches"),
        });
    }
    let mut allocations = vec![base; count];
    if let Some(last) = allocations.last_mut() {
        *last += total - base * count as u64;
    }
    Ok(allocations)
}
