//! `echidna` — streaming record-level parallelizer CLI.
//!
//! Wires [`clap`] argument parsing to [`echidna_router`], converting a
//! fatal [`EchidnaError`] into a single `echidna: `-prefixed stderr line
//! and process exit code 1, matching the original program's own error
//! reporting convention.

use clap::Parser;
use echidna_error::EchidnaError;
use echidna_router::RouterConfig;
use echidna_worker::CommandSpec;
use tracing_subscriber::EnvFilter;

/// A streaming record-level parallelizer for FASTQ/FASTA data.
#[derive(Parser, Debug)]
#[command(name = "echidna", about = "Fan out FASTQ/FASTA records across worker processes and merge their output")]
struct Cli {
    /// Number of worker processes.
    #[arg(short = 'p', long = "processes", default_value_t = 4)]
    processes: usize,

    /// Invoke each worker as `sh -c STRING` instead of a direct exec.
    /// Takes precedence over a trailing COMMAND if both are given.
    #[arg(short = 'c', long = "command")]
    command: Option<String>,

    /// Increase log verbosity (`-v` for info, `-vv` for debug).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// Program and arguments to exec directly per worker, e.g. `-- tr a-z A-Z`.
    #[arg(trailing_var_arg = true)]
    trailing: Vec<String>,
}

impl Cli {
    fn command_spec(&self) -> Result<CommandSpec, EchidnaError> {
        if let Some(s) = &self.command {
            Ok(CommandSpec::Shell(s.clone()))
        } else if !self.trailing.is_empty() {
            Ok(CommandSpec::Exec(self.trailing.clone()))
        } else {
            Err(EchidnaError::MissingCommand)
        }
    }
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();
}

fn try_main() -> Result<(), EchidnaError> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if cli.processes < 1 {
        return Err(EchidnaError::InvalidProcessCount(cli.processes.to_string()));
    }
    let command = cli.command_spec()?;

    echidna_router::run(RouterConfig::new(cli.processes, command))
}

fn main() {
    if let Err(err) = try_main() {
        eprintln!("echidna: {err}");
        std::process::exit(err.exit_code());
    }
}
