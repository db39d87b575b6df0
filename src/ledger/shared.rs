use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{Amount, Event, Ledger, LedgerError, LedgerSnapshot, Principal};

/// A ledger that can be shared between threads.
///
/// Each operation holds the lock across its whole read-check-write sequence,
/// so no observer sees supply and balances out of step.
#[derive(Clone)]
pub struct SharedLedger {
    inner: Arc<Mutex<Ledger>>,
}

impl SharedLedger {
    pub fn new(ledger: Ledger) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ledger)),
        }
    }

    // Operations validate before mutating, so a poisoned lock still guards a
    // consistent ledger.
    fn lock(&self) -> MutexGuard<'_, Ledger> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn issue(
        &self,
        caller: &Principal,
        amount: Amount,
        recipient: &Principal,
    ) -> Result<Event, LedgerError> {
        self.lock().issue(caller, amount, recipient)
    }

    pub fn transfer(
        &self,
        caller: &Principal,
        amount: Amount,
        sender: &Principal,
        recipient: &Principal,
        memo: Option<&str>,
    ) -> Result<Event, LedgerError> {
        self.lock().transfer(caller, amount, sender, recipient, memo)
    }

    pub fn burn(&self, caller: &Principal, amount: Amount) -> Result<Event, LedgerError> {
        self.lock().burn(caller, amount)
    }

    pub fn balance(&self, principal: &Principal) -> Amount {
        self.lock().balance(principal)
    }

    pub fn total_supply(&self) -> Amount {
        self.lock().total_supply()
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        self.lock().snapshot()
    }

    /// Runs `f` with exclusive access, for multi-step reads that must agree.
    pub fn with<R>(&self, f: impl FnOnce(&Ledger) -> R) -> R {
        f(&self.lock())
    }
}
