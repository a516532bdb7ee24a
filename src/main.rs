//! ctxhub entry point.

use anyhow::Context;
use clap::Parser;
use ctxhub::cli::commands;
use ctxhub::cli::{Cli, Commands};
use ctxhub::error::Error;
use std::process::ExitCode;

fn main() -> ExitCode {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.quiet);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<Error>() {
                Some(err) if cli.json => eprintln!("{}", err.to_structured_json()),
                Some(err) => match err.hint() {
                    Some(hint) => eprintln!("Error: {e:#}\n  Hint: {hint}"),
                    None => eprintln!("Error: {e:#}"),
                },
                None => eprintln!("Error: {e:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: u8, quiet: bool) {
    use tracing_subscriber::EnvFilter;

    if quiet {
        return;
    }

    // Honor RUST_LOG if set, otherwise use verbosity flag
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match verbose {
            0 => EnvFilter::new("warn"),
            1 => EnvFilter::new("info"),
            2 => EnvFilter::new("debug,rusqlite=info"),
            _ => EnvFilter::new("trace"),
        }
    };

    // stdout carries responses; logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    match &cli.command {
        Commands::Serve(args) => commands::serve::execute(args).context("serve failed")?,
        Commands::Migrate {
            db,
            backup_dir,
            command,
        } => commands::migrate::execute(command, db.as_ref(), backup_dir.as_ref(), cli.json)?,
        Commands::Version => commands::version::execute(cli.json)?,
    }
    Ok(())
}
