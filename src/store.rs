//! File persistence for ledger snapshots and the receipt journal.
//!
//! The journal is written ahead of the snapshot. A successful receipt whose
//! height the snapshot never reached was not applied and is dropped on the
//! next locked access.

use std::{
    ffi::OsString,
    fs::{self, OpenOptions},
    io::{self, BufRead, BufReader, Write},
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::{
    host::{Host, Receipt},
    ledger::{Amount, Digest, Ledger, LedgerConfig, LedgerError, LedgerSnapshot},
};

const LOCK_TIMEOUT: Duration = Duration::from_secs(10);
const LOCK_POLL: Duration = Duration::from_millis(5);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed json in {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("journal {} line {line}: {source}", path.display())]
    JournalLine {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("{} is locked by another process (remove it if no writer is running)", .0.display())]
    Locked(PathBuf),
    #[error("{} already exists (use --force to overwrite)", .0.display())]
    AlreadyInitialized(PathBuf),
    #[error("journal does not match snapshot: {0}")]
    JournalMismatch(String),
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> StoreError {
    let path = path.to_path_buf();
    move |source| StoreError::Io { path, source }
}

fn json_err(path: &Path) -> impl FnOnce(serde_json::Error) -> StoreError {
    let path = path.to_path_buf();
    move |source| StoreError::Json { path, source }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn parent_dir(path: &Path) -> &Path {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
}

pub fn load_snapshot(path: &Path) -> Result<LedgerSnapshot, StoreError> {
    let bytes = fs::read(path).map_err(io_err(path))?;
    serde_json::from_slice(&bytes).map_err(json_err(path))
}

/// Loads a snapshot and rebuilds the ledger, verifying supply and state root.
pub fn load_ledger(path: &Path) -> Result<Ledger, StoreError> {
    let ledger = Ledger::from_snapshot(load_snapshot(path)?)?;
    debug!(path = %path.display(), height = ledger.height(), "ledger loaded");
    Ok(ledger)
}

/// Replaces the snapshot through a uniquely named temp file in the same
/// directory.
pub fn save_snapshot(path: &Path, snapshot: &LedgerSnapshot) -> Result<(), StoreError> {
    let dir = parent_dir(path);
    fs::create_dir_all(dir).map_err(io_err(dir))?;
    let bytes = serde_json::to_vec_pretty(snapshot).map_err(json_err(path))?;
    let mut tmp = NamedTempFile::new_in(dir).map_err(io_err(dir))?;
    tmp.write_all(&bytes).map_err(io_err(tmp.path()))?;
    tmp.as_file().sync_all().map_err(io_err(tmp.path()))?;
    tmp.persist(path).map_err(|e| io_err(path)(e.error))?;
    debug!(path = %path.display(), height = snapshot.meta.height, "snapshot saved");
    Ok(())
}

pub fn append_receipt(path: &Path, receipt: &Receipt) -> Result<(), StoreError> {
    let mut line = serde_json::to_vec(receipt).map_err(json_err(path))?;
    line.push(b'\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(io_err(path))?;
    file.write_all(&line).map_err(io_err(path))?;
    file.sync_data().map_err(io_err(path))
}

/// Reads the whole journal. A missing file is an empty journal.
pub fn read_receipts(path: &Path) -> Result<Vec<Receipt>, StoreError> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(io_err(path)(err)),
    };
    let mut receipts = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(io_err(path))?;
        if line.trim().is_empty() {
            continue;
        }
        let receipt = serde_json::from_str(&line).map_err(|source| StoreError::JournalLine {
            path: path.to_path_buf(),
            line: idx + 1,
            source,
        })?;
        receipts.push(receipt);
    }
    Ok(receipts)
}

fn write_receipts(path: &Path, receipts: &[Receipt]) -> Result<(), StoreError> {
    let dir = parent_dir(path);
    let mut tmp = NamedTempFile::new_in(dir).map_err(io_err(dir))?;
    for receipt in receipts {
        serde_json::to_writer(&mut tmp, receipt).map_err(json_err(path))?;
        tmp.write_all(b"\n").map_err(io_err(tmp.path()))?;
    }
    tmp.as_file().sync_all().map_err(io_err(tmp.path()))?;
    tmp.persist(path).map_err(|e| io_err(path)(e.error))?;
    Ok(())
}

fn is_applied(receipt: &Receipt) -> bool {
    !receipt.call.is_query() && receipt.outcome.is_ok()
}

/// Splits off the journal tail the snapshot never absorbed: everything from
/// the first applied receipt above `height`.
fn split_unabsorbed(mut receipts: Vec<Receipt>, height: u64) -> (Vec<Receipt>, Vec<Receipt>) {
    let cut = receipts
        .iter()
        .position(|r| is_applied(r) && r.height > height)
        .unwrap_or(receipts.len());
    let tail = receipts.split_off(cut);
    (receipts, tail)
}

/// Exclusive hold on a state file; released on drop.
#[derive(Debug)]
pub struct StateLock {
    path: PathBuf,
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), %err, "failed to release state lock");
        }
    }
}

/// Result of checking a snapshot against its journal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Verification {
    pub height: u64,
    pub holders: usize,
    pub total_supply: Amount,
    pub state_root: Digest,
    /// Journaled receipts whose mutation never reached the snapshot.
    pub unabsorbed: usize,
}

/// A snapshot file and its receipt journal, mutated only under [`StateLock`].
#[derive(Clone, Debug)]
pub struct StateFiles {
    pub state: PathBuf,
    pub journal: PathBuf,
}

impl StateFiles {
    /// Uses `<state>.journal.jsonl` as the journal.
    pub fn new(state: impl Into<PathBuf>) -> Self {
        let state = state.into();
        let journal = sibling(&state, ".journal.jsonl");
        Self { state, journal }
    }

    pub fn with_journal(mut self, journal: impl Into<PathBuf>) -> Self {
        self.journal = journal.into();
        self
    }

    pub fn lock_path(&self) -> PathBuf {
        sibling(&self.state, ".lock")
    }

    pub fn lock(&self) -> Result<StateLock, StoreError> {
        let path = self.lock_path();
        let dir = parent_dir(&path);
        fs::create_dir_all(dir).map_err(io_err(dir))?;
        let started = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(StateLock { path }),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    if started.elapsed() >= LOCK_TIMEOUT {
                        return Err(StoreError::Locked(path));
                    }
                    thread::sleep(LOCK_POLL);
                }
                Err(err) => return Err(io_err(&path)(err)),
            }
        }
    }

    pub fn init(&self, config: LedgerConfig, force: bool) -> Result<Ledger, StoreError> {
        let _lock = self.lock()?;
        if self.state.exists() && !force {
            return Err(StoreError::AlreadyInitialized(self.state.clone()));
        }
        let ledger = Ledger::new(config);
        save_snapshot(&self.state, &ledger.snapshot())?;
        match fs::remove_file(&self.journal) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(io_err(&self.journal)(err)),
        }
        info!(
            path = %self.state.display(),
            authority = %ledger.config().authority,
            asset = %ledger.config().asset,
            "ledger initialized"
        );
        Ok(ledger)
    }

    /// Loads the ledger, runs one call and persists its effect, all under
    /// the state lock. Queries touch neither file.
    pub fn apply<E>(&self, call: impl FnOnce(&mut Host) -> Result<Receipt, E>) -> Result<Receipt, E>
    where
        E: From<StoreError>,
    {
        self.apply_with(call, save_snapshot)
    }

    fn apply_with<E>(
        &self,
        call: impl FnOnce(&mut Host) -> Result<Receipt, E>,
        save: impl FnOnce(&Path, &LedgerSnapshot) -> Result<(), StoreError>,
    ) -> Result<Receipt, E>
    where
        E: From<StoreError>,
    {
        let _lock = self.lock()?;
        let ledger = load_ledger(&self.state)?;
        let (history, dropped) = split_unabsorbed(read_receipts(&self.journal)?, ledger.height());
        if !dropped.is_empty() {
            warn!(count = dropped.len(), "discarding journal receipts the snapshot never absorbed");
            write_receipts(&self.journal, &history)?;
        }
        let mut host = Host::with_history(ledger, &history);

        let receipt = call(&mut host)?;
        if !receipt.call.is_query() {
            append_receipt(&self.journal, &receipt)?;
            if receipt.outcome.is_ok() {
                save(&self.state, &host.ledger().snapshot())?;
            }
        }
        Ok(receipt)
    }

    /// Receipts the snapshot has absorbed, oldest first.
    pub fn history(&self) -> Result<Vec<Receipt>, StoreError> {
        let _lock = self.lock()?;
        let ledger = load_ledger(&self.state)?;
        Ok(split_unabsorbed(read_receipts(&self.journal)?, ledger.height()).0)
    }

    /// Checks snapshot invariants and that the journal's applied receipts
    /// account for exactly the snapshot's height and last receipt.
    pub fn verify(&self) -> Result<Verification, StoreError> {
        let _lock = self.lock()?;
        let snapshot = load_ledger(&self.state)?.snapshot();
        let (history, dropped) =
            split_unabsorbed(read_receipts(&self.journal)?, snapshot.meta.height);
        let applied: Vec<&Receipt> = history.iter().filter(|r| is_applied(r)).collect();
        if applied.len() as u64 != snapshot.meta.height {
            return Err(StoreError::JournalMismatch(format!(
                "{} applied receipts, snapshot height {}",
                applied.len(),
                snapshot.meta.height
            )));
        }
        if applied.last().map(|r| r.digest()) != snapshot.meta.previous_receipt {
            return Err(StoreError::JournalMismatch(
                "last receipt digest differs from snapshot".to_string(),
            ));
        }
        Ok(Verification {
            height: snapshot.meta.height,
            holders: snapshot.balances.len(),
            total_supply: snapshot.total_supply,
            state_root: snapshot.state_root,
            unabsorbed: dropped.len(),
        })
    }
}
