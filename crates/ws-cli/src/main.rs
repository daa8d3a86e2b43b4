use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use ws_cli::commands::{
    adjust, checkout, import, incident, live, report, reviews, serve, status, sweep, timeline,
    util,
};
use ws_cli::{Cli, Commands, Config};
use ws_db::Database;

/// Load config, ensuring the database's parent directory exists.
fn load_config(config_path: Option<&Path>) -> Result<Config> {
    let config = Config::load_from(config_path).context("failed to load configuration")?;
    tracing::debug!(?config, "loaded configuration");

    if let Some(parent) = config.database_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).context("failed to create database directory")?;
        }
    }
    Ok(config)
}

/// Load config and open database with the configured engine settings.
fn open_database(config_path: Option<&Path>) -> Result<(Database, Config)> {
    let config = load_config(config_path)?;
    let settings = config.engine_settings()?;
    let db = Database::open(&config.database_path)
        .context("failed to open database")?
        .with_settings(settings);
    Ok((db, config))
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Initialize tracing with verbose flag support
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    // Use try_init to avoid panic if tracing is already initialized (e.g., in tests)
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    let config_path = cli.config.as_deref();
    let mut stdout = std::io::stdout().lock();

    match &cli.command {
        Some(Commands::Import) => {
            let (mut db, _config) = open_database(config_path)?;
            import::run(std::io::stdin().lock(), &mut stdout, &mut db)?;
        }
        Some(Commands::Report { employee, at }) => {
            let (mut db, _config) = open_database(config_path)?;
            let code = util::employee_code(employee)?;
            let now = util::time_or_now(at.as_deref())?;
            let accepted = report::run(std::io::stdin().lock(), &mut stdout, &mut db, &code, now)?;
            if !accepted {
                return Ok(ExitCode::FAILURE);
            }
        }
        Some(Commands::Serve) => {
            let config = load_config(config_path)?;
            drop(stdout);
            serve::run(&config)?;
        }
        Some(Commands::Sweep { at }) => {
            let (mut db, _config) = open_database(config_path)?;
            let now = util::time_or_now(at.as_deref())?;
            sweep::run(&mut stdout, &mut db, now)?;
        }
        Some(Commands::Adjust(action)) => {
            let (mut db, _config) = open_database(config_path)?;
            adjust::run(&mut stdout, &mut db, action, chrono::Utc::now())?;
        }
        Some(Commands::Incident(action)) => {
            let (mut db, _config) = open_database(config_path)?;
            incident::run(&mut stdout, &mut db, action, chrono::Utc::now())?;
        }
        Some(Commands::Stats { employee, date }) => {
            let (db, _config) = open_database(config_path)?;
            let date = util::date_or_today(date.as_deref(), &db.settings().utc_offset)?;
            timeline::stats(&mut stdout, &db, &util::employee_code(employee)?, date)?;
        }
        Some(Commands::Segments { employee, date }) => {
            let (db, _config) = open_database(config_path)?;
            let date = util::date_or_today(date.as_deref(), &db.settings().utc_offset)?;
            timeline::segments(&mut stdout, &db, &util::employee_code(employee)?, date)?;
        }
        Some(Commands::Offline { date }) => {
            let (db, _config) = open_database(config_path)?;
            let date = util::date_or_today(date.as_deref(), &db.settings().utc_offset)?;
            timeline::offline(&mut stdout, &db, date)?;
        }
        Some(Commands::Live { at }) => {
            let (db, _config) = open_database(config_path)?;
            live::run(&mut stdout, &db, util::time_or_now(at.as_deref())?)?;
        }
        Some(Commands::Reviews { from, to, id }) => {
            let (db, _config) = open_database(config_path)?;
            let selection = match id {
                Some(id) => reviews::Selection::One(*id),
                None => reviews::Selection::Range {
                    from: from.as_deref().map(util::parse_date).transpose()?,
                    to: util::date_or_today(to.as_deref(), &db.settings().utc_offset)?,
                },
            };
            reviews::run(&mut stdout, &db, selection)?;
        }
        Some(Commands::Checkout { employee }) => {
            let (db, _config) = open_database(config_path)?;
            checkout::run(&mut stdout, &db, &util::employee_code(employee)?)?;
        }
        Some(Commands::Status) => {
            let config = load_config(config_path)?;
            status::run(&mut stdout, &config)?;
        }
        None => {
            // No subcommand, show help
            use clap::CommandFactory;
            Cli::command().print_help()?;
            println!();
        }
    }

    Ok(ExitCode::SUCCESS)
}
