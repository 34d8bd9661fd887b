//! The `qbc` command-line entry point.
//!
//! Thin clap wrapper over the driver library: `run`, `build`, `check`,
//! `tokenize`, `parse` and `repl`.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// QBasic compiler and bytecode virtual machine.
#[derive(Parser, Debug)]
#[command(name = "qbc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "QBasic compiler and bytecode VM", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose phase logging
    #[arg(short, long, global = true, env = "QBC_VERBOSE")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compile and execute a program
    Run {
        /// Source file
        file: PathBuf,
    },
    /// Compile a program and write its bytecode image
    Build {
        /// Source file
        file: PathBuf,
        /// Output path (default: `<file>.qbx`)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Compile a program and report diagnostics without running it
    Check {
        /// Source file
        file: PathBuf,
    },
    /// Dump the token stream
    Tokenize {
        /// Source file
        file: PathBuf,
    },
    /// Dump the syntax tree
    Parse {
        /// Source file
        file: PathBuf,
    },
    /// Interactive prompt
    Repl,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Commands::Run { file } => qbc_drv::run(&file),
        Commands::Build { file, output } => qbc_drv::build(&file, output.as_deref()),
        Commands::Check { file } => qbc_drv::check(&file),
        Commands::Tokenize { file } => qbc_drv::tokenize_dump(&file),
        Commands::Parse { file } => qbc_drv::parse_dump(&file),
        Commands::Repl => qbc_drv::repl(),
    };

    match result {
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(qbc_drv::EXIT_DIAGNOSTICS as u8)
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("qbc=debug,qbc_drv=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .try_init();
}
