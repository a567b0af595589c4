use std::{
    ffi::{c_void, CString},
    sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError},
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    adc::{
        attenuation::DB_11,
        oneshot::{config::AdcChannelConfig, AdcChannelDriver, AdcDriver},
        ADC1,
    },
    delay::Ets,
    gpio::{AnyInputPin, AnyOutputPin, Gpio34, Input, InputPin, Output, OutputPin, PinDriver},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::server::{Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request},
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    sys,
    wifi::{BlockingWifi, EspWifi},
};
use log::{debug, info, warn};

use hopper_common::{
    AdcScale, BatteryMonitor, BatterySource, CaptureError, ConfigError, ConfigStore,
    CycleOutcome, DistanceSampler, EchoPins, HopperMonitor, Loaded, NetworkSettings,
    OperatingMode, ReferenceLevel, SettingsGroup, SnapshotStorage, StorageError, Telemetry,
    TelemetryError, MQTT_CLIENT_ID, MQTT_KEEP_ALIVE_SECS,
};

const NVS_NAMESPACE: &str = "hopper";
const NVS_SETTINGS_KEY: &str = "settings_json";
const NVS_BUFFER_LEN: usize = 4096;

const SETUP_AP_SSID: &str = "HopperHawk";
const MAX_HTTP_BODY: usize = 2048;
const WIFI_CONNECT_ATTEMPTS: u32 = 3;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const MQTT_SESSION_TIMEOUT: Duration = Duration::from_secs(10);
const RESTART_DELAY_MS: u64 = 500;
const NO_MATCHING_ROUTE: &str = "No matching route";

type EspMonitor = HopperMonitor<EspEcho, AdcBattery, NvsStorage>;
type SharedMonitor = Arc<Mutex<EspMonitor>>;
type HttpRequest<'r, 'c> = Request<&'r mut EspHttpConnection<'c>>;

/// HC-SR04 wired to GPIO5 (trigger) and GPIO18 (echo, level shifted).
struct EspEcho {
    trigger: PinDriver<'static, AnyOutputPin, Output>,
    echo: PinDriver<'static, AnyInputPin, Input>,
}

impl EchoPins for EspEcho {
    fn set_trigger(&mut self, high: bool) {
        let result = if high {
            self.trigger.set_high()
        } else {
            self.trigger.set_low()
        };
        if let Err(err) = result {
            warn!("trigger pin write failed: {err:?}");
        }
    }

    fn echo_is_high(&mut self) -> bool {
        self.echo.is_high()
    }

    fn delay_us(&mut self, us: u32) {
        Ets::delay_us(us);
    }

    fn now_us(&mut self) -> u64 {
        let now = unsafe { esp_idf_svc::sys::esp_timer_get_time() };
        now.max(0) as u64
    }
}

/// Battery tap behind a 2:1 divider on GPIO34.
struct AdcBattery {
    channel: AdcChannelDriver<'static, Gpio34, AdcDriver<'static, ADC1>>,
}

impl BatterySource for AdcBattery {
    fn read_raw(&mut self) -> u16 {
        self.channel.read_raw().unwrap_or_else(|err| {
            warn!("battery adc read failed: {err:?}");
            0
        })
    }
}

/// Settings document kept as a single NVS string; one `set_str` replaces it.
struct NvsStorage {
    nvs: EspNvs<NvsDefault>,
}

impl SnapshotStorage for NvsStorage {
    fn load(&mut self) -> Result<Option<Vec<u8>>, StorageError> {
        let mut buffer = vec![0_u8; NVS_BUFFER_LEN];
        match self.nvs.get_str(NVS_SETTINGS_KEY, &mut buffer) {
            Ok(value) => Ok(value.map(|value| value.as_bytes().to_vec())),
            Err(err) => Err(StorageError::Io(format!("nvs read failed: {err:?}"))),
        }
    }

    fn save(&mut self, snapshot: &[u8]) -> Result<(), StorageError> {
        let document = std::str::from_utf8(snapshot)
            .map_err(|err| StorageError::Io(format!("settings document is not utf-8: {err}")))?;
        self.nvs
            .set_str(NVS_SETTINGS_KEY, document)
            .map_err(|err| StorageError::Io(format!("nvs write failed: {err:?}")))
    }
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let Peripherals {
        modem, pins, adc1, ..
    } = Peripherals::take()?;

    let nvs = EspNvs::new(nvs_partition.clone(), NVS_NAMESPACE, true)
        .context("failed to open settings namespace")?;
    let (store, loaded) = ConfigStore::open(NvsStorage { nvs });
    match loaded {
        Loaded::Stored => info!("settings loaded from nvs"),
        Loaded::FirstBoot => info!("first boot; default settings written"),
        Loaded::Recovered(err) => warn!("stored settings unusable, running on defaults: {err}"),
    }

    let echo = EspEcho {
        trigger: PinDriver::output(pins.gpio5.downgrade_output())?,
        echo: PinDriver::input(pins.gpio18.downgrade_input())?,
    };
    let adc = AdcDriver::new(adc1)?;
    let channel_config = AdcChannelConfig {
        attenuation: DB_11,
        ..Default::default()
    };
    let battery = AdcBattery {
        channel: AdcChannelDriver::new(adc, pins.gpio34, &channel_config)?,
    };

    let network = store.settings().network.clone();
    let monitor: SharedMonitor = Arc::new(Mutex::new(HopperMonitor::new(
        DistanceSampler::new(echo),
        BatteryMonitor::new(battery, AdcScale::U12_HALF_DIVIDER),
        store,
    )));

    let _wifi =
        start_wifi(modem, sys_loop, nvs_partition, &network).context("wifi startup failed")?;
    let _server = create_http_server(monitor.clone())?;

    thread::Builder::new()
        .name("reporting".to_string())
        .stack_size(8192)
        .spawn(move || report_forever(monitor))
        .context("failed to spawn reporting thread")?;

    // Keep the network and server alive for the program lifetime.
    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn lock(monitor: &SharedMonitor) -> MutexGuard<'_, EspMonitor> {
    monitor.lock().unwrap_or_else(PoisonError::into_inner)
}

fn report_forever(monitor: SharedMonitor) {
    info!("reporting thread started");
    loop {
        // Mode check and sampling happen under one lock acquisition.
        let outcome = lock(&monitor).run_cycle();
        match outcome {
            CycleOutcome::Suspended => debug!("calibration mode active; cycle skipped"),
            CycleOutcome::SensorFailed(err) => {
                warn!("level sample failed, keeping previous level: {err}")
            }
            CycleOutcome::Measured {
                raw_cm,
                level,
                telemetry,
            } => {
                info!("hopper level {level}% ({raw_cm:.1} cm)");
                if let Some(telemetry) = telemetry {
                    if let Err(err) = publish(&telemetry) {
                        warn!("telemetry dropped: {err}");
                    }
                }
            }
        }

        let interval = lock(&monitor).poll_interval();
        thread::sleep(interval);
    }
}

type Handshake = Result<(), TelemetryError>;

/// Raw esp-mqtt client. The typed wrapper does not surface the CONNACK
/// return code of a refused connection, which tells credential failures apart.
struct MqttSession {
    handle: sys::esp_mqtt_client_handle_t,
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        // Stops the client task; no event callback runs after this returns.
        unsafe { sys::esp_mqtt_client_destroy(self.handle) };
    }
}

unsafe extern "C" fn on_mqtt_event(
    handler_args: *mut c_void,
    _base: sys::esp_event_base_t,
    event_id: i32,
    event_data: *mut c_void,
) {
    let handshake = &*(handler_args as *const mpsc::SyncSender<Handshake>);
    let event = &*(event_data as *const sys::esp_mqtt_event_t);
    let outcome = if event_id == sys::esp_mqtt_event_id_t_MQTT_EVENT_CONNECTED as i32 {
        Ok(())
    } else if event_id == sys::esp_mqtt_event_id_t_MQTT_EVENT_ERROR as i32 {
        Err(classify_mqtt_error(event.error_handle.as_ref()))
    } else {
        return;
    };
    let _ = handshake.try_send(outcome);
}

fn classify_mqtt_error(codes: Option<&sys::esp_mqtt_error_codes_t>) -> TelemetryError {
    match codes {
        Some(codes)
            if codes.error_type
                == sys::esp_mqtt_error_type_t_MQTT_ERROR_TYPE_CONNECTION_REFUSED =>
        {
            TelemetryError::refused(codes.connect_return_code as u8)
        }
        Some(codes) => TelemetryError::Connection(format!("mqtt error type {}", codes.error_type)),
        None => TelemetryError::Connection("mqtt error without details".to_string()),
    }
}

fn c_string(value: impl Into<Vec<u8>>) -> Result<CString, TelemetryError> {
    CString::new(value)
        .map_err(|_| TelemetryError::Connection("broker setting contains a NUL byte".to_string()))
}

fn esp_connection_error(err: sys::EspError) -> TelemetryError {
    TelemetryError::Connection(format!("{err:?}"))
}

/// One broker session per reading; the client is destroyed (and the session
/// closed) before returning.
fn publish(telemetry: &Telemetry) -> Result<(), TelemetryError> {
    let broker = &telemetry.broker;
    let uri = c_string(format!("mqtt://{}:{}", broker.host, broker.port))?;
    let client_id = c_string(MQTT_CLIENT_ID)?;
    let user = c_string(broker.user.as_str())?;
    let password = c_string(broker.password.as_str())?;

    let mut conf = sys::esp_mqtt_client_config_t::default();
    conf.broker.address.uri = uri.as_ptr();
    conf.credentials.client_id = client_id.as_ptr();
    if !broker.user.is_empty() {
        conf.credentials.username = user.as_ptr();
        conf.credentials.authentication.password = password.as_ptr();
    }
    conf.session.keepalive = MQTT_KEEP_ALIVE_SECS as _;

    // Declared before the session so it outlives the client task.
    let (handshake_tx, handshake_rx) = mpsc::sync_channel::<Handshake>(1);

    let handle = unsafe { sys::esp_mqtt_client_init(&conf) };
    if handle.is_null() {
        return Err(TelemetryError::Connection(
            "mqtt client init failed".to_string(),
        ));
    }
    let session = MqttSession { handle };

    sys::esp!(unsafe {
        sys::esp_mqtt_client_register_event(
            session.handle,
            sys::esp_mqtt_event_id_t_MQTT_EVENT_ANY,
            Some(on_mqtt_event),
            &handshake_tx as *const mpsc::SyncSender<Handshake> as *mut c_void,
        )
    })
    .map_err(esp_connection_error)?;
    sys::esp!(unsafe { sys::esp_mqtt_client_start(session.handle) })
        .map_err(esp_connection_error)?;

    handshake_rx
        .recv_timeout(MQTT_SESSION_TIMEOUT)
        .map_err(|_| TelemetryError::Timeout(MQTT_SESSION_TIMEOUT.as_millis() as u64))??;

    for (topic, payload) in telemetry.messages() {
        let topic = c_string(topic)?;
        // QoS 0, not retained.
        let message_id = unsafe {
            sys::esp_mqtt_client_publish(
                session.handle,
                topic.as_ptr(),
                payload.as_ptr().cast(),
                payload.len() as _,
                0,
                0,
            )
        };
        if message_id < 0 {
            return Err(TelemetryError::Connection(format!(
                "publish to {} failed",
                topic.to_string_lossy()
            )));
        }
    }
    Ok(())
}

fn start_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkSettings,
) -> anyhow::Result<EspWifi<'static>> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    if !network.enabled {
        info!("network join disabled; starting setup access point");
        start_setup_ap(&mut wifi)?;
        return Ok(esp_wifi);
    }

    let auth_method = if network.password.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };
    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .password
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;
    wifi.start()?;

    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("joined `{}` on attempt {attempt}", network.ssid);
                return Ok(esp_wifi);
            }
            Err(err) => {
                warn!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS} failed: {err:#}");
                let _ = wifi.disconnect();
                thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
            }
        }
    }

    warn!("could not join `{}`; falling back to setup access point", network.ssid);
    let _ = wifi.stop();
    start_setup_ap(&mut wifi)?;
    Ok(esp_wifi)
}

fn start_setup_ap(wifi: &mut BlockingWifi<&mut EspWifi<'static>>) -> anyhow::Result<()> {
    wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
        ssid: SETUP_AP_SSID
            .try_into()
            .map_err(|_| anyhow!("setup AP SSID too long"))?,
        auth_method: AuthMethod::None,
        ..Default::default()
    }))?;
    wifi.start()?;
    wifi.wait_netif_up()?;
    info!("setup access point `{SETUP_AP_SSID}` is up");
    Ok(())
}

fn create_http_server(monitor: SharedMonitor) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 12 * 1024,
        uri_match_wildcard: true,
        max_uri_handlers: 16,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;

    server.fn_handler("/alive", Method::Get, |req| write_text(req, 200, "1"))?;

    {
        let monitor = monitor.clone();
        server.fn_handler("/pelletlevel", Method::Get, move |req| {
            let level = lock(&monitor).level();
            write_text(req, 200, &level.to_string())
        })?;
    }

    {
        let monitor = monitor.clone();
        server.fn_handler("/sys/*", Method::Post, move |req| {
            let action = path_tail(req.uri(), "/sys/").to_string();
            match action.as_str() {
                "reboot" => {}
                "reset" => {
                    if let Err(err) = lock(&monitor).store_mut().reset_all() {
                        warn!("factory reset failed: {err}");
                        return write_error(req, 500, &err.to_string());
                    }
                }
                _ => return write_text(req, 404, NO_MATCHING_ROUTE),
            }
            schedule_restart()?;
            write_text(req, 200, if action == "reset" { "resetting" } else { "rebooting" })
        })?;
    }

    {
        let monitor = monitor.clone();
        server.fn_handler("/calibrate/*", Method::Get, move |req| {
            let target = path_tail(req.uri(), "/calibrate/").to_string();
            if target == "mode" {
                let mode = lock(&monitor).mode();
                return write_text(req, 200, mode.as_str());
            }
            let Ok(level) = target.parse::<ReferenceLevel>() else {
                return write_text(req, 404, NO_MATCHING_ROUTE);
            };
            let points = lock(&monitor).store().calibration();
            write_text(req, 200, &points.get(level).to_string())
        })?;
    }

    {
        let monitor = monitor.clone();
        server.fn_handler("/calibrate/*", Method::Post, move |req| {
            let target = path_tail(req.uri(), "/calibrate/").to_string();
            if let Some(mode) = target.strip_prefix("mode/") {
                let Ok(mode) = mode.parse::<OperatingMode>() else {
                    return write_text(req, 404, NO_MATCHING_ROUTE);
                };
                lock(&monitor).set_mode(mode);
                info!("operating mode set to {mode}");
                return write_text(req, 200, mode.as_str());
            }
            let Ok(level) = target.parse::<ReferenceLevel>() else {
                return write_text(req, 404, NO_MATCHING_ROUTE);
            };

            let captured = lock(&monitor).capture_reference(level);
            match captured {
                Ok(raw_cm) => {
                    info!("captured {level} reference at {raw_cm:.1} cm");
                    write_text(req, 200, &raw_cm.to_string())
                }
                Err(CaptureError::Sensor(err)) => write_error(req, 503, &err.to_string()),
                Err(CaptureError::Config(err)) => write_config_error(req, &err),
            }
        })?;
    }

    {
        let monitor = monitor.clone();
        server.fn_handler("/configure/*", Method::Get, move |req| {
            let Ok(group) = path_tail(req.uri(), "/configure/").parse::<SettingsGroup>() else {
                return write_text(req, 404, NO_MATCHING_ROUTE);
            };
            let settings = lock(&monitor).store().get_json(group);
            write_json(req, &settings)
        })?;
    }

    {
        let monitor = monitor.clone();
        server.fn_handler::<anyhow::Error, _>("/configure/*", Method::Post, move |mut req| {
            let Ok(group) = path_tail(req.uri(), "/configure/").parse::<SettingsGroup>() else {
                return write_text(req, 404, NO_MATCHING_ROUTE);
            };
            let body = read_request_body(&mut req)?;
            let updated = lock(&monitor).store_mut().set_json(group, &body);
            match updated {
                Ok(()) => {
                    info!("{group} settings updated");
                    write_text(req, 200, &format!("saved_{group}_settings"))
                }
                Err(err) => {
                    warn!("{group} settings rejected: {err}");
                    write_config_error(req, &err)
                }
            }
        })?;
    }

    // Registered last so every known path wins; a known path with another
    // method lands here too.
    for method in [
        Method::Get,
        Method::Post,
        Method::Put,
        Method::Delete,
        Method::Patch,
        Method::Head,
        Method::Options,
    ] {
        server.fn_handler("/*", method, |req| write_text(req, 404, NO_MATCHING_ROUTE))?;
    }

    Ok(server)
}

fn path_tail<'u>(uri: &'u str, prefix: &str) -> &'u str {
    let path = uri.split('?').next().unwrap_or_default();
    path.strip_prefix(prefix)
        .unwrap_or_default()
        .trim_end_matches('/')
}

fn schedule_restart() -> anyhow::Result<()> {
    thread::Builder::new()
        .name("restart-request".into())
        .spawn(|| {
            thread::sleep(Duration::from_millis(RESTART_DELAY_MS));
            unsafe { esp_idf_svc::sys::esp_restart() };
        })
        .context("failed to spawn restart thread")?;
    Ok(())
}

fn read_request_body(req: &mut HttpRequest<'_, '_>) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_text(req: HttpRequest<'_, '_>, status: u16, body: &str) -> anyhow::Result<()> {
    req.into_response(status, None, &[("Content-Type", "text/plain; charset=utf-8")])?
        .write_all(body.as_bytes())?;
    Ok(())
}

fn write_json(req: HttpRequest<'_, '_>, payload: &serde_json::Value) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(req: HttpRequest<'_, '_>, status: u16, message: &str) -> anyhow::Result<()> {
    let payload = serde_json::json!({ "error": message });
    let body = serde_json::to_vec(&payload)?;
    req.into_response(
        status,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_config_error(req: HttpRequest<'_, '_>, err: &ConfigError) -> anyhow::Result<()> {
    let status = match err {
        ConfigError::Invalid { .. } => 400,
        ConfigError::Persistence(_) => 500,
    };
    write_error(req, status, &err.to_string())
}
