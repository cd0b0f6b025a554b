/*!
 * Command-line interface for kvbackup
 */

use std::io;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kvbackup::commands;
use kvbackup::config::{Args, Command, Config};
use kvbackup::error::Result;

/// Exit code when some files could not be backed up
const EXIT_PARTIAL: u8 = 1;
/// Exit code when the invocation itself failed
const EXIT_FATAL: u8 = 2;

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("kvbackup={}", default_level)));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr).with_target(false))
        .with(filter)
        .init();
}

fn run(args: Args) -> Result<ExitCode> {
    if let Command::Completions { shell } = &args.command {
        commands::completions(*shell, &mut io::stdout());
        return Ok(ExitCode::SUCCESS);
    }

    let config = Config::from_args(&args)?;
    config.validate()?;
    tracing::debug!("home {}, ledger {}", config.home.display(), config.ledger_path.display());

    let store = if args.command.needs_store() {
        Some(commands::open_store(&config)?)
    } else {
        None
    };
    // Held until the command returns; dropping it removes the marker.
    let _lock = if args.command.needs_lock() {
        commands::acquire_lock(&config)?
    } else {
        None
    };

    let mut ledger = commands::load_ledger(&config)?;
    if ledger.skipped_lines() > 0 {
        tracing::warn!(
            "{} ledger lines could not be read and were skipped",
            ledger.skipped_lines()
        );
    }

    match (&args.command, store.as_deref()) {
        (Command::Keys, Some(store)) => {
            commands::keys(store)?;
        }
        (Command::Sync, Some(store)) => {
            let mut writer = commands::ledger_writer(&config);
            let added = commands::sync(store, &mut ledger, &mut writer)?;
            println!("Added {} entries from the remote store", added);
        }
        (Command::Upload { .. }, Some(store)) => {
            let mut writer = commands::ledger_writer(&config);
            let summary = commands::upload(&config, store, &mut ledger, &mut writer)?;
            if !summary.is_success() {
                return Ok(ExitCode::from(EXIT_PARTIAL));
            }
        }
        (Command::Download { hash, output }, Some(store)) => {
            let target = commands::download(&config, store, &ledger, hash, output.as_deref())?;
            println!("{}", target.display());
        }
        (Command::Search { pattern }, _) => {
            let found = commands::search(&ledger, pattern)?;
            commands::print_entries(&found);
        }
        (Command::ListAllFiles, _) => {
            let entries = commands::list_all_files(&mut ledger);
            commands::print_entries(&entries);
        }
        (Command::ListRecentFiles, _) => {
            let entries = commands::list_recent_files(&ledger);
            commands::print_entries(&entries);
        }
        (command, _) => {
            tracing::error!("{:?} has no store handle", command);
            return Ok(ExitCode::from(EXIT_FATAL));
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn main() -> ExitCode {
    // Parse command line arguments
    let args = Args::parse();
    init_tracing(args.verbose);

    match run(args) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("Error: {}", e);
            ExitCode::from(EXIT_FATAL)
        }
    }
}
