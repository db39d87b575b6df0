use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use tracing::debug;

mod shared;

pub use shared::SharedLedger;

pub type Amount = u128;
pub type Digest = [u8; 32];

pub const DEFAULT_ASSET: &str = "ramu-fungible-token";

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("insufficient funds in account {principal}: balance {balance}, requested {requested}")]
    InsufficientFunds {
        principal: Principal,
        balance: Amount,
        requested: Amount,
    },
    #[error("{caller} is not authorized to {operation}")]
    Unauthorized {
        caller: Principal,
        operation: Operation,
    },
    #[error("issuing {requested} would overflow total supply {supply}")]
    SupplyOverflow { supply: Amount, requested: Amount },
    #[error("corrupt snapshot: {0}")]
    CorruptSnapshot(String),
}

impl LedgerError {
    /// Stable numeric code surfaced to hosts as `err(code)`.
    pub fn code(&self) -> u32 {
        match self {
            LedgerError::InsufficientFunds { .. } => 1,
            LedgerError::Unauthorized { .. } => 2,
            LedgerError::SupplyOverflow { .. } => 3,
            LedgerError::CorruptSnapshot(_) => 100,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Issue,
    Transfer,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Issue => "issue",
            Operation::Transfer => "transfer",
        })
    }
}

/// Opaque account identity. The ledger only compares and orders principals.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Principal(String);

impl Principal {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derives the address of an ed25519 key holder: `ST` followed by the hex
    /// of the first 20 bytes of SHA-256 over the public key.
    pub fn from_verifying_key(key: &ed25519_dalek::VerifyingKey) -> Self {
        let hash = Sha256::digest(key.as_bytes());
        Self(format!("ST{}", hex::encode_upper(&hash[..20])))
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Principal {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Principal {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl FromStr for Principal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("principal must not be empty".to_string());
        }
        Ok(Self::new(s))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerConfig {
    #[serde(default = "default_asset")]
    pub asset: String,
    /// The only principal allowed to issue new supply.
    pub authority: Principal,
}

fn default_asset() -> String {
    DEFAULT_ASSET.to_string()
}

impl LedgerConfig {
    pub fn new(authority: Principal) -> Self {
        Self {
            asset: default_asset(),
            authority,
        }
    }

    pub fn with_asset(mut self, asset: impl Into<String>) -> Self {
        self.asset = asset.into();
        self
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventKind {
    #[serde(rename = "ft-mint")]
    Issued,
    #[serde(rename = "ft-transfer")]
    Transferred,
    #[serde(rename = "ft-burn")]
    Destroyed,
}

/// Record of one completed state change.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub asset: String,
    pub amount: Amount,
    #[serde(rename = "sender", default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Principal>,
    #[serde(rename = "recipient", default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Principal>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SnapshotMetadata {
    /// Number of mutations applied since creation.
    pub height: u64,
    #[serde(default, with = "serde_digest::option")]
    pub previous_receipt: Option<Digest>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub meta: SnapshotMetadata,
    pub config: LedgerConfig,
    pub balances: BTreeMap<Principal, Amount>,
    pub total_supply: Amount,
    #[serde(with = "serde_digest")]
    pub state_root: Digest,
}

/// Balance table plus supply counter for a single asset.
///
/// Every mutating operation validates all preconditions before touching
/// state, so a failed call leaves the ledger exactly as it was.
#[derive(Clone, Debug)]
pub struct Ledger {
    config: LedgerConfig,
    meta: SnapshotMetadata,
    balances: BTreeMap<Principal, Amount>,
    total_supply: Amount,
}

impl Ledger {
    pub fn new(config: LedgerConfig) -> Self {
        Self {
            config,
            meta: SnapshotMetadata::default(),
            balances: BTreeMap::new(),
            total_supply: 0,
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn height(&self) -> u64 {
        self.meta.height
    }

    pub fn is_authority(&self, caller: &Principal) -> bool {
        *caller == self.config.authority
    }

    pub fn balance(&self, principal: &Principal) -> Amount {
        self.balances.get(principal).copied().unwrap_or(0)
    }

    pub fn total_supply(&self) -> Amount {
        self.total_supply
    }

    pub fn holders(&self) -> impl Iterator<Item = (&Principal, Amount)> {
        self.balances.iter().map(|(p, a)| (p, *a))
    }

    pub fn issue(
        &mut self,
        caller: &Principal,
        amount: Amount,
        recipient: &Principal,
    ) -> Result<Event, LedgerError> {
        if !self.is_authority(caller) {
            return Err(LedgerError::Unauthorized {
                caller: caller.clone(),
                operation: Operation::Issue,
            });
        }
        let supply = self
            .total_supply
            .checked_add(amount)
            .ok_or(LedgerError::SupplyOverflow {
                supply: self.total_supply,
                requested: amount,
            })?;
        // Any single balance is bounded by the supply, so this cannot overflow.
        *self.balances.entry(recipient.clone()).or_default() += amount;
        self.total_supply = supply;
        self.meta.height += 1;
        debug!(%recipient, amount, supply, "issued");
        Ok(self.event(EventKind::Issued, amount, None, Some(recipient.clone())))
    }

    pub fn transfer(
        &mut self,
        caller: &Principal,
        amount: Amount,
        sender: &Principal,
        recipient: &Principal,
        memo: Option<&str>,
    ) -> Result<Event, LedgerError> {
        if caller != sender {
            return Err(LedgerError::Unauthorized {
                caller: caller.clone(),
                operation: Operation::Transfer,
            });
        }
        self.ensure_funds(sender, amount)?;
        if sender != recipient {
            self.debit(sender, amount);
            *self.balances.entry(recipient.clone()).or_default() += amount;
        }
        self.meta.height += 1;
        debug!(%sender, %recipient, amount, memo = memo.unwrap_or(""), "transferred");
        Ok(self.event(
            EventKind::Transferred,
            amount,
            Some(sender.clone()),
            Some(recipient.clone()),
        ))
    }

    /// Destroys `amount` from the caller's own balance.
    pub fn burn(&mut self, caller: &Principal, amount: Amount) -> Result<Event, LedgerError> {
        self.ensure_funds(caller, amount)?;
        self.debit(caller, amount);
        self.total_supply -= amount;
        self.meta.height += 1;
        debug!(%caller, amount, supply = self.total_supply, "burned");
        Ok(self.event(EventKind::Destroyed, amount, Some(caller.clone()), None))
    }

    pub fn check_invariants(&self) -> Result<(), LedgerError> {
        let sum = sum_balances(&self.balances)?;
        if sum != self.total_supply {
            return Err(LedgerError::CorruptSnapshot(format!(
                "total supply {} does not match sum of balances {}",
                self.total_supply, sum
            )));
        }
        Ok(())
    }

    pub fn state_root(&self) -> Digest {
        compute_state_root(&self.config, &self.balances, self.total_supply)
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            meta: self.meta.clone(),
            config: self.config.clone(),
            balances: self.balances.clone(),
            total_supply: self.total_supply,
            state_root: self.state_root(),
        }
    }

    pub fn from_snapshot(snapshot: LedgerSnapshot) -> Result<Self, LedgerError> {
        let ledger = Self {
            config: snapshot.config,
            meta: snapshot.meta,
            balances: snapshot.balances,
            total_supply: snapshot.total_supply,
        };
        ledger.check_invariants()?;
        let root = ledger.state_root();
        if root != snapshot.state_root {
            return Err(LedgerError::CorruptSnapshot(format!(
                "state root mismatch: stored {}, computed {}",
                hex::encode(snapshot.state_root),
                hex::encode(root)
            )));
        }
        Ok(ledger)
    }

    pub(crate) fn record_receipt(&mut self, digest: Digest) {
        self.meta.previous_receipt = Some(digest);
    }

    fn ensure_funds(&self, principal: &Principal, amount: Amount) -> Result<(), LedgerError> {
        let balance = self.balance(principal);
        if balance < amount {
            return Err(LedgerError::InsufficientFunds {
                principal: principal.clone(),
                balance,
                requested: amount,
            });
        }
        Ok(())
    }

    // Callers must have checked funds first.
    fn debit(&mut self, principal: &Principal, amount: Amount) {
        let balance = self.balances.entry(principal.clone()).or_default();
        *balance -= amount;
    }

    fn event(
        &self,
        kind: EventKind,
        amount: Amount,
        from: Option<Principal>,
        to: Option<Principal>,
    ) -> Event {
        Event {
            kind,
            asset: self.config.asset.clone(),
            amount,
            from,
            to,
        }
    }
}

fn sum_balances(balances: &BTreeMap<Principal, Amount>) -> Result<Amount, LedgerError> {
    balances.values().try_fold(0u128, |acc, amount| {
        acc.checked_add(*amount).ok_or_else(|| {
            LedgerError::CorruptSnapshot("sum of balances overflows".to_string())
        })
    })
}

fn compute_state_root(
    config: &LedgerConfig,
    balances: &BTreeMap<Principal, Amount>,
    total_supply: Amount,
) -> Digest {
    let mut leaves: Vec<Digest> = Vec::with_capacity(balances.len() + 2);
    for (principal, amount) in balances {
        let mut hasher = Sha256::new();
        hasher.update(b"acct");
        hasher.update((principal.as_str().len() as u64).to_le_bytes());
        hasher.update(principal.as_str().as_bytes());
        hasher.update(amount.to_le_bytes());
        leaves.push(hasher.finalize().into());
    }
    let mut hasher = Sha256::new();
    hasher.update(b"supply");
    hasher.update(total_supply.to_le_bytes());
    leaves.push(hasher.finalize().into());

    let mut hasher = Sha256::new();
    hasher.update(b"config");
    for field in [config.asset.as_str(), config.authority.as_str()] {
        hasher.update((field.len() as u64).to_le_bytes());
        hasher.update(field.as_bytes());
    }
    leaves.push(hasher.finalize().into());
    build_merkle(leaves)
}

fn build_merkle(mut leaves: Vec<Digest>) -> Digest {
    while leaves.len() > 1 {
        let mut next = Vec::with_capacity(leaves.len().div_ceil(2));
        for chunk in leaves.chunks(2) {
            let mut hasher = Sha256::new();
            hasher.update(b"node");
            hasher.update(chunk[0]);
            hasher.update(chunk.get(1).unwrap_or(&chunk[0]));
            next.push(hasher.finalize().into());
        }
        leaves = next;
    }
    leaves[0]
}

/// Hex encoding for 32-byte digests.
pub(crate) mod serde_digest {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    use super::Digest;

    pub fn serialize<S>(value: &Digest, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Digest, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        decode(&encoded).map_err(D::Error::custom)
    }

    pub(crate) fn decode(encoded: &str) -> Result<Digest, String> {
        let bytes = hex::decode(encoded).map_err(|e| e.to_string())?;
        bytes
            .try_into()
            .map_err(|b: Vec<u8>| format!("expected 32 bytes, got {}", b.len()))
    }

    pub mod option {
        use serde::{de::Error, Deserialize, Deserializer, Serializer};

        use super::Digest;

        pub fn serialize<S>(value: &Option<Digest>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match value {
                Some(digest) => serializer.serialize_some(&hex::encode(digest)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Digest>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Option::<String>::deserialize(deserializer)?
                .map(|encoded| super::decode(&encoded).map_err(D::Error::custom))
                .transpose()
        }
    }
}
