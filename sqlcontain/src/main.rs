//! SQL containment command-line tool.
//!
//! Hardens a SQL Server instance and database against an untrusted SQL
//! producer, and exposes the static mutation scanner and the read-only
//! request gate for use in pipelines.
//!
//! # Security Guarantees
//! - Passwords are read from the environment or an interactive prompt, never
//!   from the command line
//! - No credentials stored or logged
//! - Hardening is fail-closed unless a relaxation flag is passed

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use sqlcontain_core::{
    AuthMode, CancellationToken, ContainError, Credentials, HardenerOptions, LogSink, RunOutcome, Scope,
    gate::{self, GateError},
    logging::init_logging,
    scan,
};
use tracing::{error, info, warn};
use zeroize::Zeroizing;

/// Environment variable consulted for the SQL login password.
const PASSWORD_ENV: &str = "SQLCONTAIN_PASSWORD";

/// Exit code for SQL rejected by `scan` or `check`.
const EXIT_REJECTED: i32 = 2;

#[derive(Parser)]
#[command(name = "sqlcontain")]
#[command(about = "SQL containment for SQL Server")]
#[command(version)]
#[command(long_about = "
SqlContain - lock down SQL Server for untrusted SQL producers

Commands:
- harden: configure the instance and database so that dangerous surface
  (external scripts, CLR, OLE automation, xp_cmdshell, ad hoc distributed
  queries, external libraries and assemblies) is disabled and blocked
- scan: report SQL text that is likely to mutate state
- check: validate an <SqlXmlRequest> envelope in read-only mode

SECURITY FEATURES:
- Fail-closed: unverified DENYs or triggers fail the run
- Credentials read from SQLCONTAIN_PASSWORD or an interactive prompt
- Trigger probing always rolls back and cleans up

EXIT CODES:
  0  success / no findings
  1  hardening failed or runtime error
  2  SQL rejected by scan or check

EXAMPLES:
  sqlcontain harden --server localhost --database AgentSandbox --scope both
  sqlcontain harden --server db01\\SQL2022 --auth sql --user admin --database Sandbox
  echo \"DELETE FROM t\" | sqlcontain scan
  sqlcontain check --file reply.txt
")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Option<Command>,

    /// Apply only the outbound firewall rule and exit
    #[arg(long = "internal-firewall-only", hide = true)]
    pub internal_firewall_only: bool,

    /// Server binary targeted by the outbound firewall rule
    #[arg(
        long = "sqlservr-path",
        global = true,
        help = "Path to sqlservr.exe for the outbound firewall rule"
    )]
    pub sqlservr_path: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Harden a SQL Server instance and/or database
    Harden(HardenArgs),
    /// Scan SQL text for likely mutations
    Scan(ScanArgs),
    /// Validate a request envelope in read-only mode
    Check(CheckArgs),
}

#[derive(Args)]
pub struct HardenArgs {
    /// Server address
    #[arg(
        short,
        long,
        env = "SQLCONTAIN_SERVER",
        help = "Server address: host, host,port or host\\instance"
    )]
    pub server: String,

    /// Explicit TCP port
    #[arg(long, help = "TCP port (overrides host,port)")]
    pub port: Option<u16>,

    /// Target database
    #[arg(short, long, env = "SQLCONTAIN_DATABASE", help = "Database to harden")]
    pub database: Option<String>,

    /// Breadth of the run
    #[arg(long, default_value = "database", value_parser = parse_scope, help = "instance, database or both")]
    pub scope: Scope,

    /// Authentication mode
    #[arg(long, default_value = "trusted", value_parser = parse_auth, help = "trusted or sql")]
    pub auth: AuthMode,

    /// SQL login name
    #[arg(short, long, env = "SQLCONTAIN_USER", help = "SQL login (password from SQLCONTAIN_PASSWORD or prompt)")]
    pub user: Option<String>,

    /// Tolerate unconfirmed DENY statements
    #[arg(long, help = "Continue when a DENY can neither be applied nor confirmed")]
    pub allow_skipped_deny: bool,

    /// Tolerate a missing database trigger
    #[arg(long, help = "Continue when the edition supports no blocking trigger events")]
    pub allow_missing_trigger: bool,

    /// Permit USE of other databases in executed batches
    #[arg(long, help = "Allow batches to USE a different database")]
    pub allow_use: bool,

    /// Request the elevated firewall step
    #[arg(long, help = "Block outbound traffic from sqlservr.exe after hardening (Windows)")]
    pub firewall: bool,

    /// Skip certificate validation
    #[arg(long, help = "Trust the server certificate without validation")]
    pub trust_server_certificate: bool,

    /// Connect timeout in seconds
    #[arg(long, default_value = "30", help = "Connect and login timeout in seconds")]
    pub connect_timeout: u64,
}

#[derive(Args)]
pub struct ScanArgs {
    /// SQL text to scan
    #[arg(help = "SQL text to scan (stdin when omitted)")]
    pub sql: Option<String>,

    /// Read SQL from a file
    #[arg(short, long, conflicts_with = "sql", help = "Read SQL from a file")]
    pub file: Option<PathBuf>,

    /// Pretty-print JSON output
    #[arg(long, help = "Pretty-print the JSON findings")]
    pub pretty: bool,
}

#[derive(Args)]
pub struct CheckArgs {
    /// Read the request from a file
    #[arg(short, long, help = "Read the request text from a file (stdin when omitted)")]
    pub file: Option<PathBuf>,
}

#[derive(Args)]
pub struct GlobalArgs {
    /// Increase verbosity
    #[arg(
        short,
        long,
        action = clap::ArgAction::Count,
        help = "Increase verbosity (-v, -vv, -vvv)"
    )]
    pub verbose: u8,

    /// Suppress output
    #[arg(short, long, help = "Suppress all output except errors")]
    pub quiet: bool,
}

fn parse_scope(value: &str) -> std::result::Result<Scope, String> {
    value.parse().map_err(|e: ContainError| e.to_string())
}

fn parse_auth(value: &str) -> std::result::Result<AuthMode, String> {
    value.parse().map_err(|e: ContainError| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.global.verbose, cli.global.quiet)?;

    let code = dispatch(&cli).await?;
    if code != 0 {
        std::process::exit(code);
    }

    Ok(())
}

async fn dispatch(cli: &Cli) -> Result<i32> {
    // Elevated relaunch of ourselves: firewall rule only.
    if cli.internal_firewall_only {
        let options = HardenerOptions {
            internal_firewall_only: true,
            sqlservr_path: cli.sqlservr_path.clone(),
            ..Default::default()
        };
        return run_harden(&options, cli.global.quiet).await;
    }

    match &cli.command {
        Some(Command::Harden(args)) => {
            let mut options = build_options(args, cli.sqlservr_path.clone())?;
            if options.auth == AuthMode::Sql {
                let user = options.credentials.username().to_string();
                let password = read_password()?;
                options.credentials = Credentials::new(user, password.as_str());
            }
            run_harden(&options, cli.global.quiet).await
        }
        Some(Command::Scan(args)) => scan_sql(args),
        Some(Command::Check(args)) => check_request(args),
        None => {
            eprintln!("Error: a command is required");
            eprintln!("Use --help for usage information");
            Ok(1)
        }
    }
}

/// Builds hardening options from CLI arguments.
///
/// The password is filled in separately so that argument handling never
/// touches it.
fn build_options(args: &HardenArgs, sqlservr_path: Option<PathBuf>) -> Result<HardenerOptions> {
    let mut options = HardenerOptions::new(args.server.trim())
        .with_database(args.database.clone().unwrap_or_default())
        .with_scope(args.scope);

    options.port = args.port;
    options.auth = args.auth;
    options.allow_skipped_deny = args.allow_skipped_deny;
    options.allow_missing_trigger = args.allow_missing_trigger;
    options.disallow_use = !args.allow_use;
    options.firewall = args.firewall;
    options.sqlservr_path = sqlservr_path;
    options.trust_server_certificate = args.trust_server_certificate;
    options.connect_timeout = std::time::Duration::from_secs(args.connect_timeout);

    if args.auth == AuthMode::Sql {
        let user = args
            .user
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| ContainError::configuration("user", "--user is required with --auth sql"))?;
        options.credentials = Credentials::new(user, "");
    } else if args.user.is_some() {
        warn!("--user is ignored with trusted authentication");
    }

    if args.firewall && options.sqlservr_path.is_none() {
        warn!("--firewall without --sqlservr-path; the firewall step will be skipped");
    }

    options.validate()?;
    Ok(options)
}

/// Reads the SQL login password from the environment or the terminal.
fn read_password() -> Result<Zeroizing<String>> {
    if let Ok(value) = std::env::var(PASSWORD_ENV) {
        let password = Zeroizing::new(value);
        if !password.is_empty() {
            return Ok(password);
        }
    }

    eprint!("Password: ");
    io::stderr()
        .flush()
        .context("Failed to flush stderr before reading password")?;
    let password = Zeroizing::new(rpassword::read_password().context("Failed to read password")?);

    if password.is_empty() {
        anyhow::bail!("Password cannot be empty");
    }

    Ok(password)
}

/// Runs one hardening invocation, cancelling on Ctrl+C.
async fn run_harden(options: &HardenerOptions, quiet: bool) -> Result<i32> {
    info!("Target: {}", options);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; stopping after the current statement");
            on_interrupt.cancel();
        }
    });

    let print = |line: &str| println!("{}", line);
    let sink: Option<LogSink<'_>> = if quiet { None } else { Some(&print) };

    match harden_with_driver(options, sink, &cancel).await {
        Ok(outcome) => Ok(outcome.exit_code()),
        Err(e) => {
            report_failure(&e);
            Ok(RunOutcome::Failed.exit_code())
        }
    }
}

#[cfg(feature = "mssql")]
async fn harden_with_driver(
    options: &HardenerOptions,
    sink: Option<LogSink<'_>>,
    cancel: &CancellationToken,
) -> sqlcontain_core::Result<RunOutcome> {
    let connector = sqlcontain_core::TiberiusConnector::new(options);
    sqlcontain_core::run_with_connector(&connector, options, sink, cancel).await
}

#[cfg(not(feature = "mssql"))]
async fn harden_with_driver(
    _options: &HardenerOptions,
    _sink: Option<LogSink<'_>>,
    _cancel: &CancellationToken,
) -> sqlcontain_core::Result<RunOutcome> {
    Err(ContainError::configuration(
        "driver",
        "built without SQL Server support (enable the mssql feature)",
    ))
}

/// Prints the structured details of a failed run to stderr.
fn report_failure(err: &ContainError) {
    error!(error = %err, "Hardening failed");

    if let ContainError::Aggregate(agg) = err {
        eprintln!("Options: {}", agg.options_summary);
        for cause in &agg.causes {
            eprintln!("  cause: {}", cause);
        }
    }
    for sql in err.skipped_deny() {
        eprintln!("  unconfirmed: {}", sql);
    }
}

fn read_input(inline: Option<&str>, file: Option<&Path>) -> Result<String> {
    if let Some(text) = inline {
        return Ok(text.to_string());
    }
    if let Some(path) = file {
        return std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()));
    }

    let mut text = String::new();
    io::stdin()
        .read_to_string(&mut text)
        .context("Failed to read stdin")?;
    Ok(text)
}

/// Scans SQL text and prints the findings as JSON.
fn scan_sql(args: &ScanArgs) -> Result<i32> {
    let sql = read_input(args.sql.as_deref(), args.file.as_deref())?;
    let findings = scan(&sql);

    let json = if args.pretty {
        serde_json::to_string_pretty(&findings)
    } else {
        serde_json::to_string(&findings)
    }
    .context("Failed to serialize findings")?;
    println!("{}", json);

    if findings.is_empty() {
        info!("No mutation findings");
        Ok(0)
    } else {
        info!("{} mutation finding(s)", findings.len());
        Ok(EXIT_REJECTED)
    }
}

/// Runs the read-only gate over a request and prints the verdict as JSON.
fn check_request(args: &CheckArgs) -> Result<i32> {
    let text = read_input(None, args.file.as_deref())?;

    let (verdict, code) = match gate::check_read_only(&text) {
        Ok(request) => (serde_json::json!({ "accepted": true, "request": request }), 0),
        Err(GateError::MutationDetected(findings)) => (
            serde_json::json!({
                "accepted": false,
                "error": "mutation detected",
                "findings": findings,
            }),
            EXIT_REJECTED,
        ),
        Err(e) => (
            serde_json::json!({ "accepted": false, "error": e.to_string() }),
            EXIT_REJECTED,
        ),
    };

    println!(
        "{}",
        serde_json::to_string_pretty(&verdict).context("Failed to serialize verdict")?
    );
    Ok(code)
}
