//! ftmsbridge command line.
//!
//! Scans for FTMS machines, records a session from one of them and writes
//! the FIT activity file; also lists and re-exports stored workouts.

use anyhow::{anyhow, Context};
use chrono::Local;
use clap::{value_parser, Arg, ArgMatches, Command};
use ftmsbridge::bridge::Bridge;
use ftmsbridge::recording::exporter_fit::write_activity_file;
use ftmsbridge::recording::recorder::SessionRecorder;
use ftmsbridge::sensors::manager::ConnectionManager;
use ftmsbridge::sensors::platform::BtleplugBackend;
use ftmsbridge::sensors::types::{DeviceKind, LinkState};
use ftmsbridge::storage::config::{load_config, AppConfig};
use ftmsbridge::storage::database::Database;
use ftmsbridge::storage::store::{shared, SharedStore, WorkoutStore};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

/// Interval between live status lines while riding
const STATUS_INTERVAL: Duration = Duration::from_secs(10);

fn cli() -> Command {
    let kind_arg = Arg::new("kind")
        .long("kind")
        .help("Only consider this machine kind (bike or rower)")
        .value_parser(value_parser!(DeviceKind))
        .action(clap::ArgAction::Set);
    let out_arg = Arg::new("out")
        .long("out")
        .help("Directory for activity files")
        .value_parser(value_parser!(PathBuf))
        .action(clap::ArgAction::Set);

    Command::new("ftmsbridge")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Record FTMS bikes and rowers to FIT activity files")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .help("Configuration file (TOML)")
                .value_parser(value_parser!(PathBuf))
                .action(clap::ArgAction::Set),
        )
        .subcommand(
            Command::new("scan")
                .about("List nearby fitness machines")
                .arg(kind_arg.clone()),
        )
        .subcommand(
            Command::new("ride")
                .about("Connect, record until Ctrl-C and write a FIT file")
                .arg(
                    Arg::new("address")
                        .long("address")
                        .help("Connect to this device instead of the strongest one")
                        .action(clap::ArgAction::Set),
                )
                .arg(kind_arg)
                .arg(out_arg.clone()),
        )
        .subcommand(
            Command::new("export")
                .about("Write the FIT file for a stored workout")
                .arg(
                    Arg::new("id")
                        .help("Workout id")
                        .required(true)
                        .value_parser(value_parser!(Uuid))
                        .action(clap::ArgAction::Set),
                )
                .arg(out_arg),
        )
        .subcommand(
            Command::new("list").about("List stored workouts").arg(
                Arg::new("limit")
                    .long("limit")
                    .help("Maximum number of workouts")
                    .default_value("20")
                    .value_parser(value_parser!(u32))
                    .action(clap::ArgAction::Set),
            ),
        )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting ftmsbridge v{}", env!("CARGO_PKG_VERSION"));

    let matches = cli().get_matches();
    let config_path = matches.get_one::<PathBuf>("config").map(PathBuf::as_path);
    let mut config = load_config(config_path).context("loading configuration")?;
    apply_host_offset(&mut config);

    match matches.subcommand() {
        Some(("scan", sub)) => {
            apply_kind(&mut config, sub);
            scan(&config).await
        }
        Some(("ride", sub)) => {
            apply_kind(&mut config, sub);
            ride(&config, sub).await
        }
        Some(("export", sub)) => export(&config, sub),
        Some(("list", sub)) => list(&config, sub),
        Some((other, _)) => Err(anyhow!("unknown command '{}'", other)),
        None => Err(anyhow!("no command given")),
    }
}

fn apply_kind(config: &mut AppConfig, matches: &ArgMatches) {
    if let Some(kind) = matches.get_one::<DeviceKind>("kind") {
        config.connection.device_kind = Some(*kind);
    }
}

/// Use the host's UTC offset for activity local time unless configured.
fn apply_host_offset(config: &mut AppConfig) {
    if config.export.utc_offset_minutes.is_none() {
        let offset = Local::now().offset().local_minus_utc() / 60;
        config.export.utc_offset_minutes = Some(offset);
    }
}

fn output_dir(config: &AppConfig, matches: &ArgMatches) -> PathBuf {
    matches
        .get_one::<PathBuf>("out")
        .cloned()
        .or_else(|| config.export.output_dir.clone())
        .unwrap_or_else(|| PathBuf::from("."))
}

async fn scan(config: &AppConfig) -> anyhow::Result<()> {
    let backend = BtleplugBackend::new().await?;
    let mut manager = ConnectionManager::new(config.connection.clone(), backend);

    let devices = manager.discover(config.connection.scan_timeout()).await?;
    if devices.is_empty() {
        println!("No fitness machines found");
    }
    for device in devices {
        let rssi = device
            .rssi
            .map(|r| format!("{} dBm", r))
            .unwrap_or_else(|| "unknown".to_string());
        println!("{}  {:<6} {:>9}  {}", device.address, device.kind, rssi, device.name);
    }
    Ok(())
}

fn open_store(config: &AppConfig) -> Option<SharedStore> {
    let path = config.database_path();
    match Database::open(&path) {
        Ok(db) => Some(shared(db)),
        Err(e) => {
            tracing::warn!("Workout database unavailable at {}: {}", path.display(), e);
            None
        }
    }
}

async fn ride(config: &AppConfig, matches: &ArgMatches) -> anyhow::Result<()> {
    let backend = BtleplugBackend::new().await?;
    let mut manager = ConnectionManager::new(config.connection.clone(), backend);

    let devices = manager.discover(config.connection.scan_timeout()).await?;
    let device = match matches.get_one::<String>("address") {
        Some(address) => devices
            .into_iter()
            .find(|d| d.address.eq_ignore_ascii_case(address))
            .ok_or_else(|| anyhow!("device {} not found", address))?,
        None => devices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("no fitness machine found"))?,
    };
    manager.connect(&device).await?;

    let store = open_store(config);
    let recorder = match &store {
        Some(store) => SessionRecorder::with_store(config.session.clone(), store.clone()),
        None => SessionRecorder::new(config.session.clone()),
    };
    let bridge = Bridge::launch(manager, recorder, config.export.clone(), store);

    let session_id = bridge.start_session().await?;
    println!("Recording session {} on {} ({})", session_id, device.name, device.kind);
    println!("Press Ctrl-C to finish");

    let mut link_state = bridge.subscribe_link_state();
    let mut finished = bridge.subscribe_records();
    let mut ticker = tokio::time::interval(STATUS_INTERVAL);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            failed = link_state.wait_for(|s| *s == LinkState::Failed) => {
                if failed.is_ok() {
                    tracing::error!("Link to {} failed, finishing session", device.address);
                }
                break;
            }
            record = finished.recv() => match record {
                Ok(record) if record.id == session_id => {
                    tracing::info!("Session reached its maximum duration");
                    break;
                }
                Err(broadcast::error::RecvError::Closed) => break,
                _ => {}
            },
            _ = ticker.tick() => {
                if let Ok(status) = bridge.status().await {
                    if let Some(sample) = status.last_sample {
                        tracing::info!(
                            link = %status.link,
                            state = ?status.session.state,
                            samples = status.session.sample_count,
                            power = ?sample.power_watts,
                            cadence = ?sample.cadence_like(),
                            distance = ?sample.distance_m,
                            "Live"
                        );
                    }
                }
            }
        }
    }

    let record = bridge.finish_session(session_id).await?;
    bridge.shutdown().await;

    if record.samples.is_empty() {
        println!("No data recorded, no activity file written");
        return Ok(());
    }

    let path = write_activity_file(&record, &config.export, &output_dir(config, matches))?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn export(config: &AppConfig, matches: &ArgMatches) -> anyhow::Result<()> {
    let id = matches
        .get_one::<Uuid>("id")
        .copied()
        .ok_or_else(|| anyhow!("workout id required"))?;

    let db = Database::open(&config.database_path())?;
    let record = db
        .get_workout(id)?
        .ok_or_else(|| anyhow!("workout {} not found", id))?;

    let path = write_activity_file(&record, &config.export, &output_dir(config, matches))?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn list(config: &AppConfig, matches: &ArgMatches) -> anyhow::Result<()> {
    let limit = matches.get_one::<u32>("limit").copied();
    let db = Database::open(&config.database_path())?;

    for workout in db.list_workouts(limit, None)? {
        let elapsed = workout
            .summary
            .as_ref()
            .map(|s| format_duration(s.total_elapsed_secs))
            .unwrap_or_else(|| "-".to_string());
        let distance = workout
            .summary
            .as_ref()
            .and_then(|s| s.total_distance_m)
            .map(|d| format!("{} m", d))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}  {}  {:<5}  {:<9}  {:>8}  {:>9}  {} samples",
            workout.id,
            workout.started_at.format("%Y-%m-%d %H:%M"),
            workout.kind,
            workout.state.as_str(),
            elapsed,
            distance,
            workout.sample_count
        );
    }
    Ok(())
}

fn format_duration(secs: f64) -> String {
    let total = secs.max(0.0) as u64;
    format!("{}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}
