use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

use microsponsor_escrow::config::NETWORK_ENV;
use microsponsor_escrow::ledger::{AccountId, Amount, LedgerSnapshot, MICRO_PER_TOKEN};
use microsponsor_escrow::registry::{even_split, MilestoneIndex};
use microsponsor_escrow::{
    Category, ConfigError, EscrowConfig, EscrowEngine, EscrowError, InMemoryLedger, LedgerError,
    LedgerPrimitive, NewScholarship, RecoveryTrigger, ReleasePolicy, ScholarshipFilter,
    ScholarshipId, ScholarshipState, Verdict,
};

/// Exit status for failures that may succeed when retried (EX_TEMPFAIL).
const EXIT_RETRYABLE: u8 = 75;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Escrow(#[from] EscrowError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cannot access state file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("state file {path} is not a ledger snapshot: {source}")]
    Snapshot {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("cannot encode output: {0}")]
    Output(#[from] serde_json::Error),
    #[error("{0}")]
    Usage(String),
}

impl CliError {
    fn exit_code(&self) -> ExitCode {
        match self {
            CliError::Escrow(err) if err.is_retryable() => ExitCode::from(EXIT_RETRYABLE),
            _ => ExitCode::FAILURE,
        }
    }
}

//==================== arguments ====================//

/// Milestone-based scholarship escrow over a local ledger snapshot.
#[derive(Debug, Parser)]
#[command(name = "microsponsor", version, about)]
struct Cli {
    /// Ledger snapshot file; created on first write.
    #[arg(long, global = true, env = "MICROSPONSOR_STATE", default_value = "microsponsor-state.json")]
    state: PathBuf,

    /// JSON engine configuration.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Overrides the configured network and `MICROSPONSOR_NETWORK`.
    #[arg(long, global = true)]
    network: Option<microsponsor_escrow::Network>,

    /// Adds an account to the verifier set for this invocation.
    #[arg(long = "verifier-role", global = true)]
    verifier_roles: Vec<AccountId>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Credit an account with fresh funds (micro units).
    Fund { account: AccountId, amount: Amount },
    /// Open a scholarship and escrow its total.
    Create(CreateArgs),
    /// Cancel as the donor and refund the recovery address.
    Cancel {
        id: ScholarshipId,
        #[arg(long)]
        donor: AccountId,
    },
    /// Submit a completion claim as the student.
    Claim {
        id: ScholarshipId,
        index: MilestoneIndex,
        #[arg(long)]
        student: AccountId,
        #[arg(long)]
        evidence: String,
    },
    /// Accept or reject the open claim on a milestone.
    Decide {
        id: ScholarshipId,
        index: MilestoneIndex,
        verdict: Verdict,
        #[arg(long)]
        verifier: AccountId,
    },
    /// Retry the release of a verified milestone.
    Release { id: ScholarshipId, index: MilestoneIndex },
    /// Recover the remaining escrow for a recorded trigger.
    Recover { id: ScholarshipId, trigger: RecoveryTrigger },
    /// Recover every active scholarship past its deadline.
    Expire,
    /// Show a scholarship, or one of its milestones.
    Show {
        id: ScholarshipId,
        index: Option<MilestoneIndex>,
    },
    /// Summarise a student's scholarships.
    Student { student: AccountId },
    /// List scholarships, optionally filtered.
    List {
        #[arg(long)]
        donor: Option<AccountId>,
        #[arg(long)]
        student: Option<AccountId>,
        #[arg(long = "status")]
        state: Option<ScholarshipState>,
    },
    /// Print an account balance, or the whole ledger snapshot.
    Ledger { account: Option<AccountId> },
}

#[derive(Debug, Args)]
struct CreateArgs {
    #[arg(long)]
    donor: AccountId,
    #[arg(long)]
    student: AccountId,
    /// Defaults to the student.
    #[arg(long)]
    recovery: Option<AccountId>,
    #[arg(long, default_value = "academic")]
    category: Category,
    /// Total in micro units.
    #[arg(long)]
    total: Amount,
    /// Split the total evenly over this many milestones.
    #[arg(long, conflicts_with = "allocations", required_unless_present = "allocations")]
    milestones: Option<usize>,
    /// Comma-separated tranche amounts.
    #[arg(long, value_delimiter = ',')]
    allocations: Option<Vec<Amount>>,
    #[arg(long)]
    policy: Option<ReleasePolicy>,
    /// Seconds until the scholarship can be expired.
    #[arg(long)]
    term_secs: Option<u64>,
    /// Idempotency key. Defaults to a digest of the other arguments, so
    /// re-running an identical create returns the scholarship it opened.
    #[arg(long)]
    request_key: Option<String>,
}

impl Command {
    fn mutates(&self) -> bool {
        !matches!(
            self,
            Command::Show { .. } | Command::Student { .. } | Command::List { .. } | Command::Ledger { .. }
        )
    }
}

//==================== state file ====================//

fn load_ledger(path: &Path) -> Result<InMemoryLedger, CliError> {
    if !path.exists() {
        debug!(path = %path.display(), "no state file, starting empty ledger");
        return Ok(InMemoryLedger::new());
    }
    let bytes = fs::read(path).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let snapshot: LedgerSnapshot = serde_json::from_slice(&bytes).map_err(|source| CliError::Snapshot {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(InMemoryLedger::from_snapshot(snapshot)?)
}

fn save_ledger(path: &Path, ledger: &InMemoryLedger) -> Result<(), CliError> {
    let bytes = serde_json::to_vec_pretty(&ledger.snapshot()?)?;
    let tmp = path.with_extension("json.tmp");
    let io_err = |source| CliError::Io {
        path: path.to_path_buf(),
        source,
    };
    fs::write(&tmp, bytes).map_err(io_err)?;
    fs::rename(&tmp, path).map_err(io_err)
}

fn load_config(cli: &Cli) -> Result<EscrowConfig, CliError> {
    let mut config = match &cli.config {
        Some(path) => EscrowConfig::from_json_file(path)?,
        None => EscrowConfig::default(),
    };
    config.apply_env()?;
    if let Some(network) = cli.network {
        config.network = network;
    }
    for verifier in &cli.verifier_roles {
        config.verifiers.insert(verifier.clone());
    }
    config.validate()?;
    debug!(network = %config.network, env = NETWORK_ENV, "configuration loaded");
    Ok(config)
}

//==================== commands ====================//

fn emit<T: Serialize>(value: &T) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn create(engine: &EscrowEngine<InMemoryLedger>, args: CreateArgs) -> Result<(), CliError> {
    let allocations = match (args.allocations, args.milestones) {
        (Some(allocations), _) => allocations,
        (None, Some(count)) => even_split(args.total, count)?,
        (None, None) => return Err(CliError::Usage("either --milestones or --allocations is required".into())),
    };
    let recovery_address = args.recovery.unwrap_or_else(|| args.student.clone());
    let mut request = NewScholarship {
        request_key: String::new(),
        donor: args.donor,
        student: args.student,
        recovery_address,
        category: args.category,
        total_amount: args.total,
        allocations,
        release_policy: args.policy,
        term_secs: args.term_secs,
    };
    request.request_key = args.request_key.unwrap_or_else(|| request.fingerprint());
    let scholarship = engine.create_scholarship(request)?;
    emit(&engine.get_scholarship(scholarship.id)?)
}

fn dispatch(engine: &EscrowEngine<InMemoryLedger>, command: Command) -> Result<(), CliError> {
    match command {
        Command::Fund { account, amount } => {
            let receipt = engine.ledger().fund(&account, amount, now())?;
            emit(&json!({
                "account": account,
                "credited": amount,
                "balance": engine.ledger().balance(&account)?,
                "tx": receipt.tx,
            }))
        }
        Command::Create(args) => create(engine, args),
        Command::Cancel { id, donor } => emit(&engine.cancel_scholarship(id, &donor)?),
        Command::Claim {
            id,
            index,
            student,
            evidence,
        } => emit(&engine.submit_claim(id, index, &student, &evidence)?),
        Command::Decide {
            id,
            index,
            verdict,
            verifier,
        } => emit(&engine.decide(id, index, verdict, &verifier)?),
        Command::Release { id, index } => emit(&engine.retry_release(id, index)?),
        Command::Recover { id, trigger } => emit(&engine.recover(id, trigger)?),
        Command::Expire => {
            let results: Vec<_> = engine
                .expire_due()?
                .into_iter()
                .map(|(id, result)| match result {
                    Ok(outcome) => json!({ "id": id, "recovered": outcome }),
                    Err(err) => {
                        error!(scholarship_id = id, error = %err, "expiry failed");
                        json!({ "id": id, "error": err.to_string(), "retryable": err.is_retryable() })
                    }
                })
                .collect();
            emit(&results)
        }
        Command::Show { id, index: Some(index) } => emit(&engine.get_milestone(id, index)?),
        Command::Show { id, index: None } => emit(&engine.get_scholarship(id)?),
        Command::Student { student } => emit(&engine.get_student_info(&student)?),
        Command::List { donor, student, state } => emit(&engine.list_scholarships(&ScholarshipFilter {
            donor,
            student,
            state,
        })?),
        Command::Ledger { account: Some(account) } => {
            let balance = engine.ledger().balance(&account)?;
            emit(&json!({
                "account": account,
                "balance": balance,
                "tokens": balance as f64 / MICRO_PER_TOKEN as f64,
            }))
        }
        Command::Ledger { account: None } => emit(&engine.ledger().snapshot()?),
    }
}

fn now() -> u64 {
    use microsponsor_escrow::Clock;
    microsponsor_escrow::SystemClock.now()
}

fn run(cli: Cli) -> Result<(), CliError> {
    let config = load_config(&cli)?;
    let ledger = load_ledger(&cli.state)?;
    let engine = EscrowEngine::new(ledger, config);
    let mutates = cli.command.mutates();
    let result = dispatch(&engine, cli.command);
    // Some failures still commit (an exceeded rejection limit recovers the
    // escrow), so the snapshot is written either way.
    if mutates {
        save_ledger(&cli.state, engine.ledger())?;
    }
    result
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            err.exit_code()
        }
    }
}
