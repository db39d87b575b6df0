use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    process::ExitCode,
};

use clap::{Args, Parser, Subcommand};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::{rngs::OsRng, RngCore};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ramu_token::{
    host::{Call, Host, HostError, Receipt, SignedCall},
    ledger::{Amount, LedgerConfig, Principal, DEFAULT_ASSET},
    store::{StateFiles, StoreError},
};

#[derive(Parser)]
#[command(name = "ramu-token", version, about = "Fungible-token ledger for the ramu asset")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct StateArgs {
    /// Snapshot file holding balances, supply and configuration.
    #[arg(long, default_value = "ledger.json")]
    state: PathBuf,
    /// Receipt journal (JSON lines). Defaults to `<state>.journal.jsonl`.
    #[arg(long)]
    journal: Option<PathBuf>,
}

impl StateArgs {
    fn files(&self) -> StateFiles {
        let files = StateFiles::new(&self.state);
        match &self.journal {
            Some(journal) => files.with_journal(journal),
            None => files,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Create an empty ledger.
    Init {
        #[command(flatten)]
        state: StateArgs,
        /// Principal allowed to issue new supply.
        #[arg(long)]
        authority: Principal,
        #[arg(long, default_value = DEFAULT_ASSET)]
        asset: String,
        /// Overwrite an existing state file.
        #[arg(long)]
        force: bool,
    },
    /// Issue new supply to a recipient (authority only).
    Issue {
        #[command(flatten)]
        state: StateArgs,
        #[arg(long)]
        caller: Principal,
        #[arg(long)]
        amount: Amount,
        #[arg(long)]
        recipient: Principal,
    },
    /// Move funds from the caller to a recipient.
    Transfer {
        #[command(flatten)]
        state: StateArgs,
        #[arg(long)]
        caller: Principal,
        #[arg(long)]
        amount: Amount,
        /// Defaults to the caller.
        #[arg(long)]
        sender: Option<Principal>,
        #[arg(long)]
        recipient: Principal,
        #[arg(long)]
        memo: Option<String>,
    },
    /// Destroy funds from the caller's own balance.
    Burn {
        #[command(flatten)]
        state: StateArgs,
        #[arg(long)]
        caller: Principal,
        #[arg(long)]
        amount: Amount,
    },
    /// Print the balance of a principal.
    Balance {
        #[command(flatten)]
        state: StateArgs,
        principal: Principal,
        #[arg(long, default_value = "anonymous")]
        caller: Principal,
    },
    /// Print the total supply.
    Supply {
        #[command(flatten)]
        state: StateArgs,
        #[arg(long, default_value = "anonymous")]
        caller: Principal,
    },
    /// Check the snapshot invariants and that the journal matches it.
    Verify {
        #[command(flatten)]
        state: StateArgs,
    },
    /// Print the receipt journal.
    History {
        #[command(flatten)]
        state: StateArgs,
    },
    /// Generate an ed25519 keypair (sk.hex, pk.hex) and print its principal.
    Keygen {
        #[arg(long)]
        out_dir: PathBuf,
    },
    /// Print the principal derived from a public key.
    Principal {
        #[arg(long)]
        pk_hex: String,
    },
    /// Sign a call given as JSON, e.g. '{"burn":{"amount":3}}'.
    Sign {
        #[arg(long)]
        sk_hex: String,
        #[arg(long)]
        call: String,
        #[arg(long, default_value_t = 0)]
        nonce: u64,
        #[arg(long, default_value = DEFAULT_ASSET)]
        asset: String,
        /// Write the envelope here instead of stdout.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Verify and apply a signed call envelope.
    Submit {
        #[command(flatten)]
        state: StateArgs,
        /// Path of a JSON envelope produced by `sign`.
        signed: PathBuf,
    },
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Host(#[from] HostError),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    #[error("i/o error on {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error("invalid {name}: {reason}")]
    InvalidArg { name: &'static str, reason: String },
}

//==================== helpers ====================//

fn print_json<T: Serialize>(value: &T) -> Result<(), CliError> {
    let mut out = io::stdout().lock();
    serde_json::to_writer_pretty(&mut out, value)?;
    writeln!(out).map_err(|source| CliError::Io {
        path: PathBuf::from("<stdout>"),
        source,
    })
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<(), CliError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| CliError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    fs::write(path, bytes).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn decode_key<const N: usize>(name: &'static str, value: &str) -> Result<[u8; N], CliError> {
    let bytes = hex::decode(value.trim()).map_err(|e| CliError::InvalidArg {
        name,
        reason: e.to_string(),
    })?;
    bytes.try_into().map_err(|b: Vec<u8>| CliError::InvalidArg {
        name,
        reason: format!("expected {} bytes ({} hex chars), got {}", N, N * 2, b.len()),
    })
}

//==================== ledger commands ====================//

fn exit_status(receipt: &Receipt) -> u8 {
    if receipt.outcome.is_ok() {
        0
    } else {
        1
    }
}

/// Applies one call against the state files and prints the receipt.
fn apply(
    state: &StateArgs,
    receipt_of: impl FnOnce(&mut Host) -> Result<Receipt, CliError>,
) -> Result<ExitCode, CliError> {
    let receipt = state.files().apply(receipt_of)?;
    print_json(&receipt)?;
    Ok(ExitCode::from(exit_status(&receipt)))
}

fn execute(state: &StateArgs, caller: &Principal, call: Call) -> Result<ExitCode, CliError> {
    apply(state, |host| Ok(host.execute(caller, call)))
}

fn init_cmd(
    state: &StateArgs,
    authority: Principal,
    asset: String,
    force: bool,
) -> Result<ExitCode, CliError> {
    let ledger = state
        .files()
        .init(LedgerConfig::new(authority).with_asset(asset), force)?;
    print_json(&ledger.snapshot())?;
    Ok(ExitCode::SUCCESS)
}

fn verify_cmd(state: &StateArgs) -> Result<ExitCode, CliError> {
    let verified = state.files().verify()?;
    info!(
        height = verified.height,
        unabsorbed = verified.unabsorbed,
        "snapshot and journal agree"
    );
    print_json(&serde_json::json!({
        "height": verified.height,
        "holders": verified.holders,
        "total_supply": verified.total_supply.to_string(),
        "state_root": hex::encode(verified.state_root),
        "unabsorbed": verified.unabsorbed,
    }))?;
    Ok(ExitCode::SUCCESS)
}

fn history_cmd(state: &StateArgs) -> Result<ExitCode, CliError> {
    let mut out = io::stdout().lock();
    for receipt in state.files().history()? {
        serde_json::to_writer(&mut out, &receipt)?;
        writeln!(out).map_err(|source| CliError::Io {
            path: PathBuf::from("<stdout>"),
            source,
        })?;
    }
    Ok(ExitCode::SUCCESS)
}

//==================== keys and signed calls ====================//

fn keygen_cmd(out_dir: &Path) -> Result<ExitCode, CliError> {
    let mut sk_bytes = [0u8; 32];
    OsRng.fill_bytes(&mut sk_bytes);
    let sk = SigningKey::from_bytes(&sk_bytes);
    let pk = sk.verifying_key();

    write_file(&out_dir.join("sk.hex"), hex::encode(sk_bytes).as_bytes())?;
    write_file(&out_dir.join("pk.hex"), hex::encode(pk.as_bytes()).as_bytes())?;
    info!(dir = %out_dir.display(), "keypair written");
    println!("{}", Principal::from_verifying_key(&pk));
    Ok(ExitCode::SUCCESS)
}

fn principal_cmd(pk_hex: &str) -> Result<ExitCode, CliError> {
    let bytes = decode_key::<32>("--pk-hex", pk_hex)?;
    let key = VerifyingKey::from_bytes(&bytes).map_err(|e| CliError::InvalidArg {
        name: "--pk-hex",
        reason: e.to_string(),
    })?;
    println!("{}", Principal::from_verifying_key(&key));
    Ok(ExitCode::SUCCESS)
}

fn sign_cmd(
    sk_hex: &str,
    call: &str,
    nonce: u64,
    asset: &str,
    out: Option<&Path>,
) -> Result<ExitCode, CliError> {
    let sk = SigningKey::from_bytes(&decode_key::<32>("--sk-hex", sk_hex)?);
    let call: Call = serde_json::from_str(call).map_err(|e| CliError::InvalidArg {
        name: "--call",
        reason: e.to_string(),
    })?;
    let signed = SignedCall::sign(asset, call, nonce, &sk);
    match out {
        Some(path) => {
            write_file(path, &serde_json::to_vec_pretty(&signed)?)?;
            info!(path = %path.display(), nonce, "signed call written");
        }
        None => print_json(&signed)?,
    }
    Ok(ExitCode::SUCCESS)
}

fn submit_cmd(state: &StateArgs, signed: &Path) -> Result<ExitCode, CliError> {
    let bytes = fs::read(signed).map_err(|source| CliError::Io {
        path: signed.to_path_buf(),
        source,
    })?;
    let envelope: SignedCall = serde_json::from_slice(&bytes)?;
    apply(state, |host| Ok(host.submit(&envelope)?))
}

//==================== main ====================//

fn run(cli: Cli) -> Result<ExitCode, CliError> {
    match cli.command {
        Command::Init {
            state,
            authority,
            asset,
            force,
        } => init_cmd(&state, authority, asset, force),
        Command::Issue {
            state,
            caller,
            amount,
            recipient,
        } => execute(&state, &caller, Call::Issue { amount, recipient }),
        Command::Transfer {
            state,
            caller,
            amount,
            sender,
            recipient,
            memo,
        } => {
            let sender = sender.unwrap_or_else(|| caller.clone());
            execute(
                &state,
                &caller,
                Call::Transfer {
                    amount,
                    sender,
                    recipient,
                    memo,
                },
            )
        }
        Command::Burn {
            state,
            caller,
            amount,
        } => execute(&state, &caller, Call::Burn { amount }),
        Command::Balance {
            state,
            principal,
            caller,
        } => execute(&state, &caller, Call::GetBalance { principal }),
        Command::Supply { state, caller } => execute(&state, &caller, Call::GetTotalSupply),
        Command::Verify { state } => verify_cmd(&state),
        Command::History { state } => history_cmd(&state),
        Command::Keygen { out_dir } => keygen_cmd(&out_dir),
        Command::Principal { pk_hex } => principal_cmd(&pk_hex),
        Command::Sign {
            sk_hex,
            call,
            nonce,
            asset,
            out,
        } => sign_cmd(&sk_hex, &call, nonce, &asset, out.as_deref()),
        Command::Submit { state, signed } => submit_cmd(&state, &signed),
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(env_filter)
        .init();
}

fn main() -> ExitCode {
    init_tracing();
    match run(Cli::parse()) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(2)
        }
    }
}
