use anyhow::Context;
use clap::{Arg, ArgAction, ArgMatches, Command};
use common::config::Settings;
use std::process;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "config/etl.toml";

fn config_arg() -> Arg {
    Arg::new("config")
        .short('c')
        .long("config")
        .value_name("FILE")
        .default_value(DEFAULT_CONFIG)
        .help("Sets a custom config file")
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_settings(matches: &ArgMatches) -> anyhow::Result<Settings> {
    let config_path = matches
        .get_one::<String>("config")
        .map(|s| s.as_str())
        .unwrap_or(DEFAULT_CONFIG);
    Settings::new(config_path).with_context(|| format!("Failed to load config from {}", config_path))
}

async fn run(matches: ArgMatches) -> anyhow::Result<()> {
    match matches.subcommand() {
        Some(("create-tables", sub_matches)) => {
            let settings = load_settings(sub_matches)?;
            let created = etl::run_create_tables(&settings)
                .await
                .context("Creating tables failed")?;
            info!(tables = created.len(), "Tables created");
        }
        Some(("etl", sub_matches)) => {
            let settings = load_settings(sub_matches)?;
            let summary = etl::run_etl(&settings)
                .await
                .context("ETL pipeline failed")?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        _ => anyhow::bail!("Please specify a valid subcommand"),
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let matches = Command::new("Sparkify ETL")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Loads Sparkify song and log data into a star schema")
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON"),
        )
        .subcommand(
            Command::new("create-tables")
                .about("Drop and recreate the star-schema tables")
                .arg(config_arg()),
        )
        .subcommand(
            Command::new("etl")
                .about("Run the ETL pipeline")
                .arg(config_arg()),
        )
        .get_matches();

    init_tracing(matches.get_flag("json-logs"));

    if let Err(e) = run(matches).await {
        error!("{:#}", e);
        process::exit(1);
    }
}
