//! Fungible-token ledger for the ramu asset, with signed calls, receipts and
//! file-backed snapshots.

pub mod host;
pub mod ledger;
pub mod store;

pub use host::{Call, CallValue, Host, HostError, Outcome, Receipt, SignedCall};
pub use ledger::{
    Amount, Event, EventKind, Ledger, LedgerConfig, LedgerError, LedgerSnapshot, Principal,
    SharedLedger, DEFAULT_ASSET,
};
