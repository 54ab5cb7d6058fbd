use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use vitalwatch::backend::{Backend, BackendMode, BackendSelector, ServerAddress, SharedAddress};
use vitalwatch::config::Settings;
use vitalwatch::data::duration::parse_duration;
use vitalwatch::data::{Connectivity, LocationRecord, PatientStatus, VitalsSample};
use vitalwatch::feed::{Subscription, VitalsFeed};
use vitalwatch::poller::LocationPoller;
use vitalwatch::source::{
    LiveBeaconSource, LiveVitalsSource, MockLocationSource, NoiseSource, RandomNoise, SharedNoise,
    TcpVitalsTransport,
};
use vitalwatch::store::JsonFileStore;

#[derive(Parser, Debug)]
#[command(name = "vitalwatch")]
#[command(about = "Patient vitals classification and presence polling with live/mock backends")]
struct Args {
    /// Settings file (TOML). Defaults to ./vitalwatch.toml when present
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// File persisting the backend mode and live server address
    #[arg(short, long, default_value = "vitalwatch-state.json")]
    store: PathBuf,

    /// Switch the backend ("live" or "mock") and exit
    #[arg(long)]
    set_mode: Option<BackendMode>,

    /// Test, then persist a new live server address (host:port) and exit
    #[arg(long)]
    set_address: Option<String>,

    /// Save the address given with --set-address even if it is unreachable
    #[arg(long, requires = "set_address")]
    force: bool,

    /// Probe the live beacon server and exit
    #[arg(long, conflicts_with_all = ["set_mode", "set_address"])]
    test_connection: bool,

    /// Location polling interval (e.g., "1s", "500ms")
    #[arg(short, long)]
    interval: Option<String>,

    /// Stop after this long (e.g., "30s"). Runs until Ctrl-C otherwise
    #[arg(short, long)]
    duration: Option<String>,

    /// Export current statuses and locations to a JSON file on exit
    #[arg(short, long)]
    export: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let mut settings = Settings::load(args.config.as_deref())?;
    if let Some(interval) = &args.interval {
        settings.poller.interval = parse_duration(interval)?;
        settings.validate()?;
    }
    let duration = args.duration.as_deref().map(parse_duration).transpose()?;

    let address = SharedAddress::new(ServerAddress::parse(&settings.live.address)?);
    let live = live_backend(&settings, address.clone())?;
    let mock = mock_backend(&settings);
    let store = Arc::new(JsonFileStore::new(&args.store));
    let selector = Arc::new(BackendSelector::load(store, address, live, mock).await?);
    let poller = LocationPoller::new(selector.clone(), settings.poller.clone());

    if args.test_connection {
        let address = selector.server_address();
        if !poller.test_connection(None).await {
            bail!("Beacon server at {} is not reachable", address);
        }
        println!("Beacon server at {} is reachable", address);
        return Ok(());
    }

    if let Some(addr) = &args.set_address {
        if !args.force && !poller.test_connection(Some(addr)).await {
            bail!("{} is not reachable (use --force to save it anyway)", addr);
        }
        let saved = selector.set_server_address(addr).await?;
        println!("Live server address set to {}", saved);
    }

    if let Some(mode) = args.set_mode {
        selector.set_mode(mode).await?;
        println!("Backend mode set to {}", mode);
    }

    if args.set_address.is_some() || args.set_mode.is_some() {
        return Ok(());
    }

    run(&settings, selector, poller, duration, args.export.as_deref()).await
}

/// Live sources reading the shared server address.
fn live_backend(settings: &Settings, address: SharedAddress) -> Result<Backend> {
    let vitals = LiveVitalsSource::new(TcpVitalsTransport::new(
        address.clone(),
        settings.live.connect_timeout,
    ));
    let beacons = LiveBeaconSource::builder()
        .address(address)
        .request_timeout(settings.live.request_timeout)
        .probe_timeout(settings.live.probe_timeout)
        .build()?;

    Ok(Backend::new(Arc::new(vitals), Arc::new(beacons)))
}

/// Simulated sources sharing one noise generator.
fn mock_backend(settings: &Settings) -> Backend {
    let noise: Box<dyn NoiseSource> = Box::new(match settings.mock.seed {
        Some(seed) => RandomNoise::seeded(seed),
        None => RandomNoise::from_entropy(),
    });
    let noise: SharedNoise = Arc::new(Mutex::new(noise));

    Backend::new(
        Arc::new(settings.mock_vitals(noise.clone())),
        Arc::new(MockLocationSource::with_shared_noise(
            settings.mock.zones.clone(),
            noise,
        )),
    )
}

/// Follow every configured patient until Ctrl-C or `duration` elapses.
async fn run(
    settings: &Settings,
    selector: Arc<BackendSelector>,
    poller: LocationPoller,
    duration: Option<Duration>,
    export: Option<&Path>,
) -> Result<()> {
    if settings.patients.is_empty() {
        warn!("No patients configured, add [[patients]] entries to the settings file");
    }

    let backend = selector.backend();
    info!(
        "Running on the {} backend ({}, {})",
        selector.mode(),
        backend.vitals.description(),
        backend.locations.description()
    );

    let feed = VitalsFeed::new(selector.clone(), settings.feed_settings());
    let subscriptions: Vec<Subscription> = settings
        .patients
        .iter()
        .map(|patient| {
            let id = patient.id.clone();
            feed.subscribe(
                &patient.id,
                Arc::new(move |s: &VitalsSample| {
                    debug!(
                        "{}: HR {:.0} SpO2 {:.0}% RR {:.0} steps {}",
                        id, s.heart_rate, s.oxygen_saturation, s.respiratory_rate, s.step_count
                    );
                }),
            )
        })
        .collect();

    let handle = poller.start(
        |records: &[LocationRecord]| {
            let in_range = records
                .iter()
                .filter(|r| r.connectivity == Connectivity::InRange)
                .count();
            info!("Locations: {}/{} in range", in_range, records.len());
            for r in records {
                debug!(
                    "{}: {:?} {}",
                    r.name,
                    r.connectivity,
                    r.zone.as_deref().unwrap_or("-")
                );
            }
        },
        settings.tracked_patients(),
        settings.poller.interval,
    );

    match duration {
        Some(duration) => {
            tokio::select! {
                _ = tokio::time::sleep(duration) => {}
                result = tokio::signal::ctrl_c() => result?,
            }
        }
        None => tokio::signal::ctrl_c().await?,
    }

    handle.stop();
    for subscription in &subscriptions {
        subscription.unsubscribe();
    }

    if let Some(path) = export {
        export_to_file(&feed, &poller, &selector, path)?;
    }

    Ok(())
}

/// Export current statuses and locations to a JSON file
fn export_to_file(
    feed: &VitalsFeed,
    poller: &LocationPoller,
    selector: &BackendSelector,
    export_path: &Path,
) -> Result<()> {
    let thresholds = &feed.settings().thresholds;
    let patients = feed.patients();
    let statuses: Vec<PatientStatus> = patients.iter().map(|id| feed.status(id)).collect();

    let count = |f: fn(&PatientStatus) -> bool| statuses.iter().filter(|s| f(s)).count();
    let summary = serde_json::json!({
        "backend": selector.mode(),
        "server_address": selector.server_address().to_string(),
        "connection": poller.connection_state(),
        "total_patients": patients.len(),
        "in_range": count(|s| *s == PatientStatus::InRange),
        "out_of_range": count(|s| matches!(s, PatientStatus::OutOfRange(_))),
        "critical": count(PatientStatus::is_critical),
        "offline": count(PatientStatus::is_offline),
    });

    let vitals: Vec<serde_json::Value> = patients
        .iter()
        .zip(&statuses)
        .map(|(id, status)| {
            let latest = feed.latest(id);
            let grades = latest.as_ref().map(|s| {
                let g = thresholds.assess_vitals(s);
                serde_json::json!({
                    "heart_rate": g.heart_rate,
                    "oxygen_saturation": g.oxygen_saturation,
                    "respiratory_rate": g.respiratory_rate,
                })
            });
            serde_json::json!({
                "patient_id": id,
                "status": status,
                "latest": latest,
                "grades": grades,
                "samples": feed.history(id).len(),
                "heart_rate_trend": feed.heart_rate_trend(id),
            })
        })
        .collect();

    let export = serde_json::json!({
        "summary": summary,
        "patients": vitals,
        "locations": poller.latest(),
    });

    let json = serde_json::to_string_pretty(&export)?;
    let mut file = std::fs::File::create(export_path)?;
    file.write_all(json.as_bytes())?;

    println!("Exported to {}", export_path.display());
    Ok(())
}
