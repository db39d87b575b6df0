use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use tracing::warn;

use crate::ledger::{
    serde_digest, Amount, Digest, Event, EventKind, Ledger, LedgerError, Principal,
};

mod signed;

pub use signed::{SignedCall, VerificationError};

/// A request submitted to the ledger by the hosting environment.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Call {
    Issue {
        amount: Amount,
        recipient: Principal,
    },
    Transfer {
        amount: Amount,
        sender: Principal,
        recipient: Principal,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        memo: Option<String>,
    },
    Burn {
        amount: Amount,
    },
    GetBalance {
        principal: Principal,
    },
    GetTotalSupply,
}

impl Call {
    pub fn is_query(&self) -> bool {
        matches!(self, Call::GetBalance { .. } | Call::GetTotalSupply)
    }

    pub(crate) fn commit(&self, hasher: &mut Sha256) {
        match self {
            Call::Issue { amount, recipient } => {
                hasher.update(b"issue");
                hasher.update(amount.to_le_bytes());
                commit_str(hasher, recipient.as_str());
            }
            Call::Transfer {
                amount,
                sender,
                recipient,
                memo,
            } => {
                hasher.update(b"transfer");
                hasher.update(amount.to_le_bytes());
                commit_str(hasher, sender.as_str());
                commit_str(hasher, recipient.as_str());
                match memo {
                    Some(memo) => {
                        hasher.update([1u8]);
                        commit_str(hasher, memo);
                    }
                    None => hasher.update([0u8]),
                }
            }
            Call::Burn { amount } => {
                hasher.update(b"burn");
                hasher.update(amount.to_le_bytes());
            }
            Call::GetBalance { principal } => {
                hasher.update(b"get-balance");
                commit_str(hasher, principal.as_str());
            }
            Call::GetTotalSupply => hasher.update(b"get-total-supply"),
        }
    }
}

fn commit_str(hasher: &mut Sha256, value: &str) {
    hasher.update((value.len() as u64).to_le_bytes());
    hasher.update(value.as_bytes());
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallValue {
    Unit,
    Uint(Amount),
}

/// `ok`/`err` result as surfaced to the outside world.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Ok { value: CallValue, events: Vec<Event> },
    Err { code: u32, reason: String },
}

impl Outcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok { .. })
    }

    pub fn events(&self) -> &[Event] {
        match self {
            Outcome::Ok { events, .. } => events,
            Outcome::Err { .. } => &[],
        }
    }

    fn commit(&self, hasher: &mut Sha256) {
        match self {
            Outcome::Ok { value, events } => {
                hasher.update(b"ok");
                match value {
                    CallValue::Unit => hasher.update([0u8]),
                    CallValue::Uint(n) => {
                        hasher.update([1u8]);
                        hasher.update(n.to_le_bytes());
                    }
                }
                hasher.update((events.len() as u64).to_le_bytes());
                for event in events {
                    hasher.update(match event.kind {
                        EventKind::Issued => b"I",
                        EventKind::Transferred => b"T",
                        EventKind::Destroyed => b"D",
                    });
                    commit_str(hasher, &event.asset);
                    hasher.update(event.amount.to_le_bytes());
                    commit_str(hasher, event.from.as_ref().map_or("", |p| p.as_str()));
                    commit_str(hasher, event.to.as_ref().map_or("", |p| p.as_str()));
                }
            }
            Outcome::Err { code, reason } => {
                hasher.update(b"err");
                hasher.update(code.to_le_bytes());
                commit_str(hasher, reason);
            }
        }
    }
}

impl From<Result<Option<Event>, LedgerError>> for Outcome {
    fn from(result: Result<Option<Event>, LedgerError>) -> Self {
        match result {
            Ok(event) => Outcome::Ok {
                value: CallValue::Unit,
                events: event.into_iter().collect(),
            },
            Err(err) => Outcome::Err {
                code: err.code(),
                reason: err.to_string(),
            },
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Receipt {
    /// Ledger height after the call was applied.
    pub height: u64,
    pub caller: Principal,
    pub call: Call,
    pub outcome: Outcome,
    /// Digest of the signed envelope, when the call arrived signed.
    #[serde(default, with = "serde_digest::option", skip_serializing_if = "Option::is_none")]
    pub call_id: Option<Digest>,
}

impl Receipt {
    pub fn digest(&self) -> Digest {
        let mut hasher = Sha256::new();
        hasher.update(b"ramu-receipt");
        hasher.update(self.height.to_le_bytes());
        commit_str(&mut hasher, self.caller.as_str());
        self.call.commit(&mut hasher);
        self.outcome.commit(&mut hasher);
        if let Some(id) = &self.call_id {
            hasher.update(id);
        }
        hasher.finalize().into()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error(transparent)]
    Verification(#[from] VerificationError),
    #[error("call {0} was already applied")]
    DuplicateCall(String),
    #[error("call targets asset {found}, this ledger holds {expected}")]
    AssetMismatch { expected: String, found: String },
}

/// Serialized executor in front of a [`Ledger`].
///
/// The host resolves caller identities, turns ledger results into receipts
/// and refuses to apply the same signed call twice.
pub struct Host {
    ledger: Ledger,
    applied: BTreeSet<Digest>,
}

impl Host {
    pub fn new(ledger: Ledger) -> Self {
        Self {
            ledger,
            applied: BTreeSet::new(),
        }
    }

    /// Seeds the replay guard from previously journaled receipts.
    pub fn with_history<'a>(
        ledger: Ledger,
        receipts: impl IntoIterator<Item = &'a Receipt>,
    ) -> Self {
        let applied = receipts.into_iter().filter_map(|r| r.call_id).collect();
        Self { ledger, applied }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn into_ledger(self) -> Ledger {
        self.ledger
    }

    pub fn execute(&mut self, caller: &Principal, call: Call) -> Receipt {
        self.apply(caller, call, None)
    }

    pub fn submit(&mut self, signed: &SignedCall) -> Result<Receipt, HostError> {
        let asset = &self.ledger.config().asset;
        if signed.asset != *asset {
            return Err(HostError::AssetMismatch {
                expected: asset.clone(),
                found: signed.asset.clone(),
            });
        }
        let caller = signed.verify()?;
        let id = signed.digest();
        if self.applied.contains(&id) {
            return Err(HostError::DuplicateCall(hex::encode(id)));
        }
        let receipt = self.apply(&caller, signed.call.clone(), Some(id));
        self.applied.insert(id);
        Ok(receipt)
    }

    fn apply(&mut self, caller: &Principal, call: Call, call_id: Option<Digest>) -> Receipt {
        let outcome = match &call {
            Call::GetBalance { principal } => Outcome::Ok {
                value: CallValue::Uint(self.ledger.balance(principal)),
                events: Vec::new(),
            },
            Call::GetTotalSupply => Outcome::Ok {
                value: CallValue::Uint(self.ledger.total_supply()),
                events: Vec::new(),
            },
            Call::Issue { amount, recipient } => {
                self.ledger.issue(caller, *amount, recipient).map(Some).into()
            }
            Call::Transfer {
                amount,
                sender,
                recipient,
                memo,
            } => self
                .ledger
                .transfer(caller, *amount, sender, recipient, memo.as_deref())
                .map(Some)
                .into(),
            Call::Burn { amount } => self.ledger.burn(caller, *amount).map(Some).into(),
        };
        if let Outcome::Err { code, reason } = &outcome {
            warn!(%caller, code, reason = %reason, "call rejected");
        }
        let receipt = Receipt {
            height: self.ledger.height(),
            caller: caller.clone(),
            call,
            outcome,
            call_id,
        };
        if !receipt.call.is_query() && receipt.outcome.is_ok() {
            self.ledger.record_receipt(receipt.digest());
        }
        receipt
    }
}
