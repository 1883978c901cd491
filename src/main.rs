mod app;
mod i18n;

use anyhow::Context;
use clap::{Parser, Subcommand};
use flash_station_lib::{ConfigKey, ConfigStore, Station, SystemPorts};
use i18n::{get_dict, Language};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

/// ESP32 factory flash station.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Station configuration file.
    #[arg(long, default_value = "flash-station.json")]
    config: PathBuf,

    #[arg(long, value_enum, default_value_t = Language::En)]
    lang: Language,

    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand)]
enum Cmd {
    /// Interactive station (default).
    Run,
    /// List candidate serial ports.
    Ports,
    /// Connect and flash one board, then exit.
    Flash,
    /// Show or edit the configuration.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Show,
    Set { key: String, value: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Init logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let lang = cli.lang;
    let dict = get_dict(lang);
    let store = Arc::new(ConfigStore::new(&cli.config));

    match cli.command.unwrap_or(Cmd::Run) {
        Cmd::Run => {
            let (station, events) = Station::builder(store).spawn();
            app::run(station, events, &SystemPorts, &dict).await?;
        }
        Cmd::Ports => app::print_ports(&SystemPorts, &dict),
        Cmd::Flash => {
            let (station, mut events) = Station::builder(store).spawn();
            let printer = tokio::spawn(async move {
                let dict = get_dict(lang);
                while let Some(event) = events.recv().await {
                    app::render(&event, &dict);
                }
            });
            let result = station.flash().await;
            station.shutdown().await;
            // The handle holds the last event sender.
            drop(station);
            printer.await.context("event printer failed")?;
            if result.is_err() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Cmd::Config { action } => match action {
            ConfigAction::Show => {
                let config = store.try_load()?;
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
            ConfigAction::Set { key, value } => {
                let key: ConfigKey = key.parse()?;
                let config = store
                    .update(key, &value)
                    .with_context(|| format!("updating {}", store.path().display()))?;
                println!("{} = {}", key, serde_json::to_value(&config)?[key.name()]);
            }
        },
    }
    Ok(ExitCode::SUCCESS)
}
