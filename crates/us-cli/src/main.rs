use std::io;
use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::Directive;

use us_cli::commands::sessions::SessionsRequest;
use us_cli::commands::util::resolve_window;
use us_cli::commands::{init, sessions, site};
use us_cli::{Cli, Commands, Config};
use us_core::EventQuery;

fn load_config(config_path: Option<&Path>) -> Result<Config> {
    let config = Config::load_from(config_path).context("failed to load configuration")?;
    tracing::debug!(?config, "loaded configuration");
    Ok(config)
}

/// Log filter for this invocation. `sessions --trace` always shows the
/// aggregation decisions.
fn log_filter(cli: &Cli) -> Result<EnvFilter> {
    if cli.verbose {
        return Ok(EnvFilter::new("debug"));
    }
    let filter = EnvFilter::from_default_env();
    if matches!(cli.command, Some(Commands::Sessions { trace: true, .. })) {
        let directive: Directive = "us_core=debug".parse()?;
        return Ok(filter.add_directive(directive));
    }
    Ok(filter)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = log_filter(&cli)?;
    // try_init: tests may have installed a subscriber already
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    let mut stdout = io::stdout().lock();
    match &cli.command {
        Some(Commands::Sessions {
            users,
            course,
            from,
            to,
            json,
            dimension,
            trace,
        }) => {
            let config = load_config(cli.config.as_deref())?;
            let (from, to) = resolve_window(from.as_deref(), to.as_deref())?;
            let request = SessionsRequest {
                users: users.clone(),
                course_id: *course,
                from,
                to,
                dimension: *dimension,
                trace: *trace,
            };
            sessions::run(&mut stdout, &config, &request, *json)?;
        }
        Some(Commands::Site {
            users,
            courses,
            from,
            to,
            dimensions,
            json,
        }) => {
            let config = load_config(cli.config.as_deref())?;
            let (from, to) = resolve_window(from.as_deref(), to.as_deref())?;
            let query = EventQuery {
                from,
                to,
                users: users.clone(),
                courses: courses.clone(),
            };
            site::run(&mut stdout, &config, &query, *dimensions, *json)?;
        }
        Some(Commands::Init) => {
            let config = load_config(cli.config.as_deref())?;
            init::run(&mut stdout, &config)?;
        }
        None => {
            use clap::CommandFactory;
            Cli::command().print_help()?;
            println!();
        }
    }

    Ok(())
}
