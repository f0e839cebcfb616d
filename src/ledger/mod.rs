//! Ledger primitive consumed by the escrow engine.
//!
//! The engine never holds balances itself. It describes what should happen
//! as a [`LedgerTransaction`] (escrow deposits, escrow transfers and
//! version-guarded writes to contract storage) and hands it to a
//! [`LedgerPrimitive`], which applies the whole list or nothing.
//!
//! [`InMemoryLedger`] is the reference implementation used by the CLI and the
//! tests. It can be snapshotted to JSON and carries a small fault plan so
//! callers can exercise timeouts and rejected transfers deterministically.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use tracing::debug;

pub type AccountId = String;
pub type Amount = u64;

/// Storage key inside the contract's key/value space.
pub type StateKey = String;

/// 1 STX = 1e6 micro-STX.
pub const MICRO_PER_TOKEN: u64 = 1_000_000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("insufficient funds in account {account}")]
    InsufficientAccountFunds { account: AccountId },
    #[error("insufficient funds in escrow {escrow}")]
    InsufficientEscrowFunds { escrow: EscrowRef },
    #[error("unknown account {account}")]
    UnknownAccount { account: AccountId },
    #[error("unknown escrow {escrow}")]
    UnknownEscrow { escrow: EscrowRef },
    #[error("transfer to {account} rejected: {reason}")]
    TransferRejected { account: AccountId, reason: String },
    #[error("version mismatch on {key}: expected {expected}, found {found}")]
    VersionMismatch {
        key: StateKey,
        expected: Version,
        found: Version,
    },
    #[error("transaction {tx} already committed with different mutations")]
    DuplicateTransaction { tx: TxId },
    #[error("ledger unavailable: {reason}")]
    Unavailable { reason: String },
    #[error("amount overflow")]
    Overflow,
    #[error("snapshot state root mismatch")]
    CorruptSnapshot,
}

/// Monotonic per-key version. `Version::ABSENT` guards a key that must not
/// exist yet.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(transparent)]
pub struct Version(pub u64);

impl Version {
    pub const ABSENT: Version = Version(0);

    pub fn next(self) -> Version {
        Version(self.0 + 1)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// 32-byte transaction identifier, rendered as hex.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxId(pub [u8; 32]);

impl TxId {
    /// Deterministic id for operations that must collapse on replay.
    pub fn derive(domain: &str, parts: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"microsponsor-tx");
        hasher.update(domain.as_bytes());
        for part in parts {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        TxId(hasher.finalize().into())
    }

    pub fn random() -> Self {
        TxId(rand::random())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxId({})", &self.to_hex()[..16])
    }
}

impl Serialize for TxId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for TxId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;
        let encoded = String::deserialize(deserializer)?;
        let bytes = hex::decode(&encoded).map_err(D::Error::custom)?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| D::Error::custom("transaction id must be 32 bytes"))?;
        Ok(TxId(array))
    }
}

/// Handle on funds held by the ledger on behalf of one scholarship.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct EscrowRef(pub String);

impl EscrowRef {
    pub fn for_scholarship(id: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"microsponsor-escrow");
        hasher.update(id.to_le_bytes());
        let digest = hasher.finalize();
        EscrowRef(format!("escrow-{}", hex::encode(&digest[..10])))
    }
}

impl fmt::Display for EscrowRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AccountBalance {
    pub available: Amount,
    /// Funds this account has placed in escrows that are still held.
    pub escrowed: Amount,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EscrowAccount {
    pub id: EscrowRef,
    pub funder: AccountId,
    pub funded: Amount,
    pub held: Amount,
}

impl EscrowAccount {
    pub fn debit(&mut self, amount: Amount) -> Result<(), LedgerError> {
        if self.held < amount {
            return Err(LedgerError::InsufficientEscrowFunds {
                escrow: self.id.clone(),
            });
        }
        self.held -= amount;
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredValue {
    pub version: Version,
    #[serde(with = "hex_bytes")]
    pub value: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SnapshotMetadata {
    pub height: u64,
    pub timestamp: u64,
    pub last_tx: Option<TxId>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    Emission {
        to: AccountId,
        amount: Amount,
        reason: String,
    },
    EscrowFunded {
        from: AccountId,
        escrow: EscrowRef,
        amount: Amount,
    },
    EscrowReleased {
        escrow: EscrowRef,
        to: AccountId,
        amount: Amount,
        memo: Option<String>,
    },
    StateWritten {
        key: StateKey,
        version: Version,
    },
}

impl LedgerEvent {
    fn absorb(&self, hasher: &mut Sha256) {
        match self {
            LedgerEvent::Emission { to, amount, reason } => {
                hasher.update(b"emission");
                absorb_str(hasher, to);
                hasher.update(amount.to_le_bytes());
                absorb_str(hasher, reason);
            }
            LedgerEvent::EscrowFunded {
                from,
                escrow,
                amount,
            } => {
                hasher.update(b"funded");
                absorb_str(hasher, from);
                absorb_str(hasher, &escrow.0);
                hasher.update(amount.to_le_bytes());
            }
            LedgerEvent::EscrowReleased {
                escrow,
                to,
                amount,
                memo,
            } => {
                hasher.update(b"released");
                absorb_str(hasher, &escrow.0);
                absorb_str(hasher, to);
                hasher.update(amount.to_le_bytes());
                match memo {
                    Some(memo) => {
                        hasher.update([1u8]);
                        absorb_str(hasher, memo);
                    }
                    None => hasher.update([0u8]),
                }
            }
            LedgerEvent::StateWritten { key, version } => {
                hasher.update(b"written");
                absorb_str(hasher, key);
                hasher.update(version.0.to_le_bytes());
            }
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerMutation {
    /// Mint into an account. Only the local CLI faucet uses this.
    Emit {
        to: AccountId,
        amount: Amount,
        reason: String,
    },
    /// Move funds from an account into an escrow, opening it if needed.
    Escrow {
        from: AccountId,
        escrow: EscrowRef,
        amount: Amount,
    },
    /// Pay out of an escrow.
    Transfer {
        escrow: EscrowRef,
        to: AccountId,
        amount: Amount,
        memo: Option<String>,
    },
    /// Compare-and-set write into contract storage.
    Put {
        key: StateKey,
        expected: Version,
        #[serde(with = "hex_bytes")]
        value: Vec<u8>,
    },
}

impl LedgerMutation {
    fn absorb(&self, hasher: &mut Sha256) {
        match self {
            LedgerMutation::Emit { to, amount, reason } => {
                hasher.update(b"emit");
                absorb_str(hasher, to);
                hasher.update(amount.to_le_bytes());
                absorb_str(hasher, reason);
            }
            LedgerMutation::Escrow {
                from,
                escrow,
                amount,
            } => {
                hasher.update(b"escrow");
                absorb_str(hasher, from);
                absorb_str(hasher, &escrow.0);
                hasher.update(amount.to_le_bytes());
            }
            LedgerMutation::Transfer {
                escrow,
                to,
                amount,
                memo,
            } => {
                hasher.update(b"transfer");
                absorb_str(hasher, &escrow.0);
                absorb_str(hasher, to);
                hasher.update(amount.to_le_bytes());
                absorb_str(hasher, memo.as_deref().unwrap_or_default());
            }
            LedgerMutation::Put {
                key,
                expected,
                value,
            } => {
                hasher.update(b"put");
                absorb_str(hasher, key);
                hasher.update(expected.0.to_le_bytes());
                hasher.update((value.len() as u64).to_le_bytes());
                hasher.update(value);
            }
        }
    }
}

fn absorb_str(hasher: &mut Sha256, value: &str) {
    hasher.update((value.len() as u64).to_le_bytes());
    hasher.update(value.as_bytes());
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerTransaction {
    pub id: TxId,
    pub mutations: Vec<LedgerMutation>,
}

impl LedgerTransaction {
    pub fn new(id: TxId) -> Self {
        Self {
            id,
            mutations: Vec::new(),
        }
    }

    pub fn with(mut self, mutation: LedgerMutation) -> Self {
        self.mutations.push(mutation);
        self
    }

    /// Commitment over the mutation list, used to tell a replay from a
    /// reused id.
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.id.0);
        hasher.update((self.mutations.len() as u64).to_le_bytes());
        for mutation in &self.mutations {
            mutation.absorb(&mut hasher);
        }
        hasher.finalize().into()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommitReceipt {
    pub tx: TxId,
    pub height: u64,
    pub timestamp: u64,
    /// New versions of every key the transaction wrote.
    pub versions: BTreeMap<StateKey, Version>,
    #[serde(default)]
    pub replayed: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
struct CommitRecord {
    #[serde(with = "hex_array")]
    digest: [u8; 32],
    receipt: CommitReceipt,
}

/// The interface the escrow engine consumes. Implementations must apply a
/// transaction atomically and in a total order with every other commit.
pub trait LedgerPrimitive: Send + Sync {
    fn read_state(&self, key: &StateKey) -> Result<Option<StoredValue>, LedgerError>;

    fn commit(&self, tx: &LedgerTransaction, timestamp: u64) -> Result<CommitReceipt, LedgerError>;

    fn balance(&self, account: &AccountId) -> Result<Amount, LedgerError>;

    fn escrow_balance(&self, escrow: &EscrowRef) -> Result<Amount, LedgerError>;
}

impl<L: LedgerPrimitive + ?Sized> LedgerPrimitive for Arc<L> {
    fn read_state(&self, key: &StateKey) -> Result<Option<StoredValue>, LedgerError> {
        (**self).read_state(key)
    }

    fn commit(&self, tx: &LedgerTransaction, timestamp: u64) -> Result<CommitReceipt, LedgerError> {
        (**self).commit(tx, timestamp)
    }

    fn balance(&self, account: &AccountId) -> Result<Amount, LedgerError> {
        (**self).balance(account)
    }

    fn escrow_balance(&self, escrow: &EscrowRef) -> Result<Amount, LedgerError> {
        (**self).escrow_balance(escrow)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub meta: SnapshotMetadata,
    pub accounts: BTreeMap<AccountId, AccountBalance>,
    pub escrows: BTreeMap<EscrowRef, EscrowAccount>,
    pub entries: BTreeMap<StateKey, StoredValue>,
    pub events: Vec<LedgerEvent>,
    committed: BTreeMap<TxId, CommitRecord>,
    #[serde(with = "hex_array")]
    pub state_root: [u8; 32],
}

#[derive(Clone, Default)]
pub struct LedgerState {
    pub meta: SnapshotMetadata,
    pub accounts: BTreeMap<AccountId, AccountBalance>,
    pub escrows: BTreeMap<EscrowRef, EscrowAccount>,
    pub entries: BTreeMap<StateKey, StoredValue>,
    pub events: Vec<LedgerEvent>,
    committed: BTreeMap<TxId, CommitRecord>,
}

impl LedgerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            meta: self.meta.clone(),
            accounts: self.accounts.clone(),
            escrows: self.escrows.clone(),
            entries: self.entries.clone(),
            events: self.events.clone(),
            committed: self.committed.clone(),
            state_root: self.state_root(),
        }
    }

    pub fn from_snapshot(snapshot: LedgerSnapshot) -> Result<Self, LedgerError> {
        let claimed = snapshot.state_root;
        let state = Self {
            meta: snapshot.meta,
            accounts: snapshot.accounts,
            escrows: snapshot.escrows,
            entries: snapshot.entries,
            events: snapshot.events,
            committed: snapshot.committed,
        };
        if state.state_root() != claimed {
            return Err(LedgerError::CorruptSnapshot);
        }
        Ok(state)
    }

    /// Merkle root over balances, escrows, storage, the event log, the
    /// commit table and the chain metadata.
    pub fn state_root(&self) -> [u8; 32] {
        let mut leaves: Vec<[u8; 32]> = Vec::new();
        for (account, balance) in &self.accounts {
            let mut hasher = Sha256::new();
            hasher.update(b"acct");
            absorb_str(&mut hasher, account);
            hasher.update(balance.available.to_le_bytes());
            hasher.update(balance.escrowed.to_le_bytes());
            leaves.push(hasher.finalize().into());
        }
        for (escrow_id, escrow) in &self.escrows {
            let mut hasher = Sha256::new();
            hasher.update(b"escrow");
            absorb_str(&mut hasher, &escrow_id.0);
            absorb_str(&mut hasher, &escrow.funder);
            hasher.update(escrow.funded.to_le_bytes());
            hasher.update(escrow.held.to_le_bytes());
            leaves.push(hasher.finalize().into());
        }
        for (key, stored) in &self.entries {
            let mut hasher = Sha256::new();
            hasher.update(b"entry");
            absorb_str(&mut hasher, key);
            hasher.update(stored.version.0.to_le_bytes());
            hasher.update(&stored.value);
            leaves.push(hasher.finalize().into());
        }
        for (tx, record) in &self.committed {
            let mut hasher = Sha256::new();
            hasher.update(b"commit");
            hasher.update(tx.0);
            hasher.update(record.digest);
            hasher.update(record.receipt.height.to_le_bytes());
            hasher.update(record.receipt.timestamp.to_le_bytes());
            leaves.push(hasher.finalize().into());
        }

        let mut hasher = Sha256::new();
        hasher.update(b"events");
        hasher.update((self.events.len() as u64).to_le_bytes());
        for event in &self.events {
            event.absorb(&mut hasher);
        }
        leaves.push(hasher.finalize().into());

        let mut hasher = Sha256::new();
        hasher.update(b"meta");
        hasher.update(self.meta.height.to_le_bytes());
        hasher.update(self.meta.timestamp.to_le_bytes());
        hasher.update(self.meta.last_tx.map_or([0; 32], |tx| tx.0));
        leaves.push(hasher.finalize().into());

        build_merkle(leaves)
    }

    /// Applies every mutation or none. Mutations run against an overlay of
    /// the touched accounts, escrows and keys, which is merged back only
    /// once the whole list succeeded.
    pub fn apply_transaction(
        &mut self,
        tx: &LedgerTransaction,
        timestamp: u64,
        rejecting: &BTreeSet<AccountId>,
    ) -> Result<CommitReceipt, LedgerError> {
        let digest = tx.digest();
        if let Some(prior) = self.committed.get(&tx.id) {
            if prior.digest != digest {
                return Err(LedgerError::DuplicateTransaction { tx: tx.id });
            }
            let mut receipt = prior.receipt.clone();
            receipt.replayed = true;
            return Ok(receipt);
        }

        let mut overlay = Overlay::new(self);
        for mutation in &tx.mutations {
            overlay.apply(mutation, rejecting)?;
        }
        let Overlay {
            accounts,
            escrows,
            entries,
            events,
            versions,
            ..
        } = overlay;
        self.accounts.extend(accounts);
        self.escrows.extend(escrows);
        self.entries.extend(entries);
        self.events.extend(events);

        self.meta.height += 1;
        self.meta.timestamp = timestamp;
        self.meta.last_tx = Some(tx.id);
        let receipt = CommitReceipt {
            tx: tx.id,
            height: self.meta.height,
            timestamp,
            versions,
            replayed: false,
        };
        self.committed.insert(
            tx.id,
            CommitRecord {
                digest,
                receipt: receipt.clone(),
            },
        );
        Ok(receipt)
    }
}

/// Pending writes of one transaction over a borrowed [`LedgerState`].
struct Overlay<'a> {
    base: &'a LedgerState,
    accounts: BTreeMap<AccountId, AccountBalance>,
    escrows: BTreeMap<EscrowRef, EscrowAccount>,
    entries: BTreeMap<StateKey, StoredValue>,
    events: Vec<LedgerEvent>,
    versions: BTreeMap<StateKey, Version>,
}

impl<'a> Overlay<'a> {
    fn new(base: &'a LedgerState) -> Self {
        Self {
            base,
            accounts: BTreeMap::new(),
            escrows: BTreeMap::new(),
            entries: BTreeMap::new(),
            events: Vec::new(),
            versions: BTreeMap::new(),
        }
    }

    fn account(&mut self, account: &AccountId) -> Option<&mut AccountBalance> {
        if !self.accounts.contains_key(account) {
            let current = self.base.accounts.get(account)?.clone();
            self.accounts.insert(account.clone(), current);
        }
        self.accounts.get_mut(account)
    }

    fn account_or_default(&mut self, account: &AccountId) -> &mut AccountBalance {
        let base = self.base;
        self.accounts
            .entry(account.clone())
            .or_insert_with(|| base.accounts.get(account).cloned().unwrap_or_default())
    }

    fn escrow(&mut self, escrow: &EscrowRef) -> Option<&mut EscrowAccount> {
        if !self.escrows.contains_key(escrow) {
            let current = self.base.escrows.get(escrow)?.clone();
            self.escrows.insert(escrow.clone(), current);
        }
        self.escrows.get_mut(escrow)
    }

    fn version(&self, key: &StateKey) -> Version {
        self.entries
            .get(key)
            .or_else(|| self.base.entries.get(key))
            .map(|stored| stored.version)
            .unwrap_or(Version::ABSENT)
    }

    fn credit(&mut self, account: &AccountId, amount: Amount) -> Result<(), LedgerError> {
        let balance = self.account_or_default(account);
        balance.available = balance
            .available
            .checked_add(amount)
            .ok_or(LedgerError::Overflow)?;
        Ok(())
    }

    fn debit(&mut self, account: &AccountId, amount: Amount) -> Result<(), LedgerError> {
        let balance = self
            .account(account)
            .ok_or_else(|| LedgerError::UnknownAccount {
                account: account.clone(),
            })?;
        if balance.available < amount {
            return Err(LedgerError::InsufficientAccountFunds {
                account: account.clone(),
            });
        }
        balance.available -= amount;
        Ok(())
    }

    fn apply(&mut self, mutation: &LedgerMutation, rejecting: &BTreeSet<AccountId>) -> Result<(), LedgerError> {
        match mutation {
            LedgerMutation::Emit { to, amount, reason } => {
                self.credit(to, *amount)?;
                self.events.push(LedgerEvent::Emission {
                    to: to.clone(),
                    amount: *amount,
                    reason: reason.clone(),
                });
            }
            LedgerMutation::Escrow {
                from,
                escrow,
                amount,
            } => {
                self.debit(from, *amount)?;
                if self.escrow(escrow).is_none() {
                    self.escrows.insert(
                        escrow.clone(),
                        EscrowAccount {
                            id: escrow.clone(),
                            funder: from.clone(),
                            funded: 0,
                            held: 0,
                        },
                    );
                }
                let account = self.escrow(escrow).ok_or_else(|| LedgerError::UnknownEscrow {
                    escrow: escrow.clone(),
                })?;
                account.funded = account.funded.checked_add(*amount).ok_or(LedgerError::Overflow)?;
                account.held = account.held.checked_add(*amount).ok_or(LedgerError::Overflow)?;
                if let Some(balance) = self.account(from) {
                    balance.escrowed = balance.escrowed.saturating_add(*amount);
                }
                self.events.push(LedgerEvent::EscrowFunded {
                    from: from.clone(),
                    escrow: escrow.clone(),
                    amount: *amount,
                });
            }
            LedgerMutation::Transfer {
                escrow,
                to,
                amount,
                memo,
            } => {
                if rejecting.contains(to) {
                    return Err(LedgerError::TransferRejected {
                        account: to.clone(),
                        reason: "destination refuses incoming transfers".into(),
                    });
                }
                let account = self.escrow(escrow).ok_or_else(|| LedgerError::UnknownEscrow {
                    escrow: escrow.clone(),
                })?;
                account.debit(*amount)?;
                let funder = account.funder.clone();
                if let Some(balance) = self.account(&funder) {
                    balance.escrowed = balance.escrowed.saturating_sub(*amount);
                }
                self.credit(to, *amount)?;
                self.events.push(LedgerEvent::EscrowReleased {
                    escrow: escrow.clone(),
                    to: to.clone(),
                    amount: *amount,
                    memo: memo.clone(),
                });
            }
            LedgerMutation::Put {
                key,
                expected,
                value,
            } => {
                let found = self.version(key);
                if found != *expected {
                    return Err(LedgerError::VersionMismatch {
                        key: key.clone(),
                        expected: *expected,
                        found,
                    });
                }
                let version = found.next();
                self.entries.insert(
                    key.clone(),
                    StoredValue {
                        version,
                        value: value.clone(),
                    },
                );
                self.versions.insert(key.clone(), version);
                self.events.push(LedgerEvent::StateWritten {
                    key: key.clone(),
                    version,
                });
            }
        }
        Ok(())
    }
}

/// Injected failure for the next commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fault {
    /// Let the commit through untouched, so a later fault lands on a later commit.
    Pass,
    /// Refuse the commit as if the ledger timed out before accepting it.
    Unavailable,
    /// Apply the commit but report a timeout, as when the reply is lost.
    UnavailableAfterCommit,
}

#[derive(Default)]
struct FaultPlan {
    pending: VecDeque<Fault>,
    rejecting: BTreeSet<AccountId>,
}

#[derive(Default)]
struct Inner {
    state: LedgerState,
    faults: FaultPlan,
}

/// Process-local ledger. A single mutex gives the total commit order.
#[derive(Default)]
pub struct InMemoryLedger {
    inner: Mutex<Inner>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: LedgerSnapshot) -> Result<Self, LedgerError> {
        Ok(Self {
            inner: Mutex::new(Inner {
                state: LedgerState::from_snapshot(snapshot)?,
                faults: FaultPlan::default(),
            }),
        })
    }

    pub fn snapshot(&self) -> Result<LedgerSnapshot, LedgerError> {
        Ok(self.lock()?.state.snapshot())
    }

    pub fn events(&self) -> Result<Vec<LedgerEvent>, LedgerError> {
        Ok(self.lock()?.state.events.clone())
    }

    /// Credits `account` outside of any escrow flow.
    pub fn fund(&self, account: &AccountId, amount: Amount, timestamp: u64) -> Result<CommitReceipt, LedgerError> {
        let tx = LedgerTransaction::new(TxId::random()).with(LedgerMutation::Emit {
            to: account.clone(),
            amount,
            reason: "faucet".into(),
        });
        self.commit(&tx, timestamp)
    }

    pub fn inject_fault(&self, fault: Fault) -> Result<(), LedgerError> {
        self.lock()?.faults.pending.push_back(fault);
        Ok(())
    }

    /// Every transfer into `account` fails until [`InMemoryLedger::clear_faults`].
    pub fn reject_transfers_to(&self, account: &AccountId) -> Result<(), LedgerError> {
        self.lock()?.faults.rejecting.insert(account.clone());
        Ok(())
    }

    pub fn clear_faults(&self) -> Result<(), LedgerError> {
        self.lock()?.faults = FaultPlan::default();
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, LedgerError> {
        self.inner.lock().map_err(|_| LedgerError::Unavailable {
            reason: "ledger lock poisoned".into(),
        })
    }
}

impl LedgerPrimitive for InMemoryLedger {
    fn read_state(&self, key: &StateKey) -> Result<Option<StoredValue>, LedgerError> {
        Ok(self.lock()?.state.entries.get(key).cloned())
    }

    fn commit(&self, tx: &LedgerTransaction, timestamp: u64) -> Result<CommitReceipt, LedgerError> {
        let mut inner = self.lock()?;
        let fault = inner.faults.pending.pop_front();
        if fault == Some(Fault::Unavailable) {
            return Err(LedgerError::Unavailable {
                reason: "commit timed out".into(),
            });
        }
        let Inner { state, faults } = &mut *inner;
        let receipt = state.apply_transaction(tx, timestamp, &faults.rejecting)?;
        debug!(tx = %receipt.tx, height = receipt.height, replayed = receipt.replayed, "ledger commit");
        if fault == Some(Fault::UnavailableAfterCommit) {
            return Err(LedgerError::Unavailable {
                reason: "commit accepted but reply lost".into(),
            });
        }
        Ok(receipt)
    }

    fn balance(&self, account: &AccountId) -> Result<Amount, LedgerError> {
        Ok(self
            .lock()?
            .state
            .accounts
            .get(account)
            .map(|balance| balance.available)
            .unwrap_or(0))
    }

    fn escrow_balance(&self, escrow: &EscrowRef) -> Result<Amount, LedgerError> {
        let inner = self.lock()?;
        inner
            .state
            .escrows
            .get(escrow)
            .map(|account| account.held)
            .ok_or_else(|| LedgerError::UnknownEscrow {
                escrow: escrow.clone(),
            })
    }
}

fn build_merkle(mut leaves: Vec<[u8; 32]>) -> [u8; 32] {
    if leaves.is_empty() {
        return Sha256::digest(b"microsponsor-ledger-empty").into();
    }
    while leaves.len() > 1 {
        let mut next = Vec::with_capacity((leaves.len() + 1) / 2);
        for chunk in leaves.chunks(2) {
            let mut hasher = Sha256::new();
            hasher.update(b"node");
            hasher.update(chunk[0]);
            if chunk.len() == 2 {
                hasher.update(chunk[1]);
            } else {
                hasher.update(chunk[0]);
            }
            next.push(hasher.finalize().into());
        }
        leaves = next;
    }
    leaves[0]
}

mod hex_bytes {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        hex::decode(&encoded).map_err(D::Error::custom)
    }
}

mod hex_array {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let bytes = hex::decode(&encoded).map_err(D::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| D::Error::custom("expected 32 bytes"))
    }
}
