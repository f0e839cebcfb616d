use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::config::EscrowConfig;
use crate::ledger::LedgerPrimitive;

/// Entry point for every escrow operation.
///
/// The engine keeps no scholarship state of its own: each call reads the
/// current record from the ledger and commits its change as a
/// version-guarded transaction. Several engines may share one ledger, and
/// races between them surface as `StateConflict` rather than being
/// serialized in process.
///
/// Operations live next to the component that owns them: creation,
/// cancellation and record access in [`crate::registry`], claims and
/// verdicts in [`crate::verifier`], releases in [`crate::disbursement`],
/// recovery in [`crate::recovery`] and read projections in [`crate::query`].
pub struct EscrowEngine<L> {
    pub(crate) ledger: L,
    pub(crate) config: EscrowConfig,
    pub(crate) clock: Arc<dyn Clock>,
}

impl<L: LedgerPrimitive> EscrowEngine<L> {
    pub fn new(ledger: L, config: EscrowConfig) -> Self {
        Self::with_clock(ledger, config, Arc::new(SystemClock))
    }

    pub fn with_clock(ledger: L, config: EscrowConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            ledger,
            config,
            clock,
        }
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn config(&self) -> &EscrowConfig {
        &self.config
    }

    pub(crate) fn now(&self) -> u64 {
        self.clock.now()
    }
}
