mod api;
mod hardware;
mod reporting;
mod storage;
mod telemetry;

use std::{future::IntoFuture, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{net::TcpListener, sync::mpsc, sync::Mutex};
use tracing::{info, warn};

use hopper_common::{
    AdcScale, BatteryMonitor, BatterySource, ConfigStore, DistanceSampler, EchoPins,
    HopperMonitor, Loaded, SnapshotStorage,
};

use api::{AppState, RestartReason};
use hardware::{SimulatedBattery, SimulatedEcho};
use storage::FileStorage;
use telemetry::MqttPublisher;

pub(crate) type Monitor = HopperMonitor<
    Box<dyn EchoPins + Send>,
    Box<dyn BatterySource + Send>,
    Box<dyn SnapshotStorage + Send>,
>;
pub(crate) type SharedMonitor = Arc<Mutex<Monitor>>;

const RESTART_GRACE: Duration = Duration::from_millis(250);

/// Runs `f` against the monitor on the blocking pool. Echo sampling
/// busy-polls for up to the sampler timeout, which must not stall a runtime
/// worker; the lock is held for the whole call.
pub(crate) async fn with_monitor_blocking<R, F>(monitor: &SharedMonitor, f: F) -> anyhow::Result<R>
where
    R: Send + 'static,
    F: FnOnce(&mut Monitor) -> R + Send + 'static,
{
    let mut guard = monitor.clone().lock_owned().await;
    tokio::task::spawn_blocking(move || f(&mut guard))
        .await
        .context("monitor task failed")
}

/// Process-level knobs for running the firmware on a workstation.
struct HostEnv {
    data_dir: PathBuf,
    http_port: u16,
    sim_distance_cm: f32,
    sim_battery_raw: u16,
}

impl HostEnv {
    fn from_env() -> Self {
        Self {
            data_dir: std::env::var("HOPPER_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./.hopper")),
            http_port: env_parsed("HOPPER_HTTP_PORT").unwrap_or(8080),
            sim_distance_cm: env_parsed("HOPPER_SIM_DISTANCE_CM").unwrap_or(42.5),
            sim_battery_raw: env_parsed("HOPPER_SIM_BATTERY_RAW").unwrap_or(45_000),
        }
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|value| value.parse().ok())
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let env = HostEnv::from_env();
    loop {
        let reason = boot(&env).await?;
        info!("restarting after {reason:?}");
    }
}

/// Brings the device up from persisted state and serves until a restart is
/// requested through the control surface.
async fn boot(env: &HostEnv) -> anyhow::Result<RestartReason> {
    let storage = FileStorage::new(env.data_dir.join("config.json"));
    let path = storage.path().display().to_string();
    let backing: Box<dyn SnapshotStorage + Send> = Box::new(storage);
    let (store, loaded) = ConfigStore::open(backing);
    match loaded {
        Loaded::Stored => info!("settings loaded from {path}"),
        Loaded::FirstBoot => info!("no settings at {path}; defaults written"),
        Loaded::Recovered(err) => warn!("settings at {path} unusable, running on defaults: {err}"),
    }

    let echo: Box<dyn EchoPins + Send> = Box::new(SimulatedEcho::new(env.sim_distance_cm));
    let battery: Box<dyn BatterySource + Send> =
        Box::new(SimulatedBattery::new(env.sim_battery_raw));
    let monitor: SharedMonitor = Arc::new(Mutex::new(HopperMonitor::new(
        DistanceSampler::new(echo),
        BatteryMonitor::new(battery, AdcScale::default()),
        store,
    )));

    let reporting = tokio::spawn(reporting::run(monitor.clone(), MqttPublisher::default()));

    let (restart, mut restarts) = mpsc::channel(1);
    let app = api::router(AppState { monitor, restart });

    let addr = SocketAddr::from(([0, 0, 0, 0], env.http_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind hopper server at {addr}"))?;
    info!("hopper monitor listening on http://{addr}");

    let outcome = tokio::select! {
        served = axum::serve(listener, app).into_future() => served
            .context("hopper server stopped")
            .and_then(|()| Err(anyhow::anyhow!("hopper server exited without a restart request"))),
        Some(reason) = restarts.recv() => {
            // Let the response that asked for the restart reach the client.
            tokio::time::sleep(RESTART_GRACE).await;
            Ok(reason)
        }
    };

    reporting.abort();
    outcome
}
