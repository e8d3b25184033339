use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, OnceLock, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::{DateTime, Datelike, Utc};
use chrono_tz::Tz;
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{Output, PinDriver};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{gpio::AnyOutputPin, modem::Modem, prelude::Peripherals},
    http::server::{Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request},
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs},
    sntp::EspSntp,
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use serde::Serialize;

use pump_common::{
    api::{applied_reply, status_reply},
    clock::wrap_ms,
    ApiReply, CommandInterpreter, ControllerStatus, HardwareConfig, HardwareFault, HealthStatus,
    IrrigationTrigger, NetworkConfig, PumpConfig, PumpOutput, PumpScheduler, RuntimeConfig,
    Schedule, TimeStatus, TimezoneUpdate, SERVICE_NAME,
};

const NVS_NAMESPACE: &str = "pump";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const NVS_SCHEDULE_KEY: &str = "schedule_json";
const MAX_SCHEDULE_BODY: usize = 4096;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const WIFI_RESTART_GRACE_MS: u64 = 300_000;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
/// SNTP has not set the clock before this year.
const MIN_SYNCED_YEAR: i32 = 2024;

const INDEX_HTML: &str = include_str!("../web/index.html");
const APP_JS: &str = include_str!("../web/app.js");
const STYLE_CSS: &str = include_str!("../web/style.css");

type HttpRequest<'r, 'c> = Request<&'r mut EspHttpConnection<'c>>;

/// Relay line on a GPIO pin.
struct GpioPump {
    pin: PinDriver<'static, AnyOutputPin, Output>,
    hardware: HardwareConfig,
}

impl PumpOutput for GpioPump {
    fn write(&mut self, engaged: bool) -> Result<(), HardwareFault> {
        let result = if self.hardware.pin_level(engaged) {
            self.pin.set_high()
        } else {
            self.pin.set_low()
        };

        result.map_err(|err| HardwareFault(format!("GPIO{}: {err}", self.hardware.pump_pin)))
    }
}

#[derive(Clone)]
struct SharedState {
    pump: Arc<Mutex<PumpScheduler<GpioPump>>>,
    interpreter: CommandInterpreter,
    schedule: Arc<Mutex<Schedule>>,
    trigger: Arc<Mutex<IrrigationTrigger>>,
    timezone: Arc<Mutex<String>>,
    time_synced: Arc<AtomicBool>,
    config: PumpConfig,
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();
    ensure_wifi_defaults(&mut runtime);

    info!(
        "NVS config loaded: ssid=`{}`, pump GPIO{} (active {}), tick {}ms",
        runtime.network.wifi_ssid,
        runtime.hardware.pump_pin,
        if runtime.hardware.active_high { "high" } else { "low" },
        runtime.pump.tick_interval_ms,
    );

    // The relay must be released before anything slow (Wi-Fi) runs.
    let output = init_pump_output(&runtime.hardware)?;
    let pump = PumpScheduler::new(output).context("failed to release pump at boot")?;
    info!("pump output released on GPIO{}", runtime.hardware.pump_pin);

    let Peripherals { modem, .. } = Peripherals::take()?;
    let wifi = match connect_wifi(modem, sys_loop, nvs_partition, &runtime.network) {
        Ok(wifi) => wifi,
        Err(err) => {
            restart_device(&format!("wifi startup failed: {err:#}"));
            return Err(err);
        }
    };
    disable_wifi_power_save();

    let _sntp = EspSntp::new_default().context("failed to start SNTP")?;
    info!("SNTP initialized");

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    let mut schedule = nvs_store.load_schedule().unwrap_or_else(|err| {
        warn!("failed to load schedule from NVS: {err:#}");
        Schedule::default()
    });
    schedule.normalize(runtime.pump.max_duration_ms);

    let shared_state = SharedState {
        pump: Arc::new(Mutex::new(pump)),
        interpreter: CommandInterpreter::new(runtime.pump.max_duration_ms),
        schedule: Arc::new(Mutex::new(schedule)),
        trigger: Arc::new(Mutex::new(IrrigationTrigger::default())),
        timezone: Arc::new(Mutex::new(runtime.timezone.clone())),
        time_synced: Arc::new(AtomicBool::new(false)),
        config: runtime.pump.clone(),
    };

    spawn_control_loop(shared_state.clone())?;
    let server = create_http_server(shared_state, nvs_store, runtime.network.http_port)?;
    info!("HTTP server listening on port {}", runtime.network.http_port);

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _server = server;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn ensure_wifi_defaults(runtime: &mut RuntimeConfig) {
    if runtime.network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            runtime.network.wifi_ssid = ssid.to_string();
        }
    }

    if runtime.network.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            runtime.network.wifi_pass = pass.to_string();
        }
    }
}

fn init_pump_output(hardware: &HardwareConfig) -> anyhow::Result<GpioPump> {
    let pin = unsafe { PinDriver::output(AnyOutputPin::new(hardware.pump_pin)) }
        .with_context(|| format!("failed to claim pump GPIO{}", hardware.pump_pin))?;

    Ok(GpioPump {
        pin,
        hardware: hardware.clone(),
    })
}

fn create_http_server(
    state: SharedState,
    nvs_store: NvsStore,
    port: u16,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 10 * 1024,
        http_port: port,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    server.fn_handler::<anyhow::Error, _>("/", Method::Get, move |req| {
        req.into_ok_response()?.write_all(INDEX_HTML.as_bytes())?;
        Ok(())
    })?;

    server.fn_handler::<anyhow::Error, _>("/app.js", Method::Get, move |req| {
        req.into_response(200, None, &[("Content-Type", "text/javascript")])?
            .write_all(APP_JS.as_bytes())?;
        Ok(())
    })?;

    server.fn_handler::<anyhow::Error, _>("/style.css", Method::Get, move |req| {
        req.into_response(200, None, &[("Content-Type", "text/css")])?
            .write_all(STYLE_CSS.as_bytes())?;
        Ok(())
    })?;

    {
        let state = state.clone();
        server.fn_handler("/status", Method::Get, move |req| {
            let reply = status_reply(&*lock(&state.pump));
            write_reply(req, &reply)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/status/detail", Method::Get, move |req| {
            let status = build_status(&state);
            write_json(req, &status)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/pump", Method::Post, move |mut req| {
            let Some(body) = read_request_body(&mut req, state.config.max_body_bytes)? else {
                return write_reply(req, &ApiReply::payload_too_large());
            };

            let command = match state.interpreter.interpret(&body) {
                Ok(command) => command,
                Err(err) => {
                    warn!("rejected pump command: {err}");
                    return write_reply(req, &ApiReply::from(&err));
                }
            };

            let (result, event) = {
                let mut pump = lock(&state.pump);
                let result = pump.apply(command, monotonic_ms());
                (result, pump.last_event())
            };
            match &result {
                Ok(snapshot) => info!("pump {}: {event:?}", snapshot.state.as_str()),
                Err(err) => warn!("pump command {command:?} failed: {err}"),
            }

            write_reply(req, &applied_reply(&result))
        })?;
    }

    // Each method is one URI handler slot; the server default is 32.
    for method in [
        Method::Get,
        Method::Head,
        Method::Put,
        Method::Delete,
        Method::Patch,
        Method::Options,
        Method::Trace,
        Method::Connect,
    ] {
        server.fn_handler("/pump", method, move |req| {
            write_reply(req, &ApiReply::method_not_allowed())
        })?;
    }

    server.fn_handler("/health", Method::Get, move |req| {
        let payload = HealthStatus {
            ok: true,
            service: SERVICE_NAME,
            uptime_ms: uptime_ms(),
        };
        write_json(req, &payload)
    })?;

    {
        let state = state.clone();
        server.fn_handler("/schedule", Method::Get, move |req| {
            let schedule = lock(&state.schedule).clone();
            write_json(req, &schedule)
        })?;
    }

    {
        let state = state.clone();
        let nvs_store = nvs_store.clone();
        server.fn_handler::<anyhow::Error, _>("/schedule", Method::Put, move |mut req| {
            let Some(body) = read_request_body(&mut req, MAX_SCHEDULE_BODY)? else {
                return write_reply(req, &ApiReply::payload_too_large());
            };
            let Ok(mut schedule) = serde_json::from_slice::<Schedule>(&body) else {
                return write_reply(req, &ApiReply::invalid_json());
            };
            schedule.normalize(state.config.max_duration_ms);

            if let Err(err) = nvs_store.save_schedule(&schedule) {
                warn!("failed to persist schedule update: {err:#}");
                return write_error(req, 500, "Failed to persist schedule");
            }

            *lock(&state.schedule) = schedule.clone();
            lock(&state.trigger).reset();

            info!("schedule updated: {} entries", schedule.entries.len());
            write_json(req, &schedule)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/time", Method::Get, move |req| {
            write_json(req, &build_time_status(&state))
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/timezone", Method::Put, move |mut req| {
            let Some(body) = read_request_body(&mut req, state.config.max_body_bytes)? else {
                return write_reply(req, &ApiReply::payload_too_large());
            };
            let Ok(update) = serde_json::from_slice::<TimezoneUpdate>(&body) else {
                return write_reply(req, &ApiReply::invalid_json());
            };

            if update.timezone.parse::<Tz>().is_err() {
                return write_error(req, 400, "Invalid timezone value");
            }

            if let Err(err) = persist_timezone(&nvs_store, &update.timezone) {
                warn!("failed to persist timezone update: {err:#}");
                return write_error(req, 500, "Failed to persist runtime settings");
            }

            *lock(&state.timezone) = update.timezone;
            lock(&state.trigger).reset();

            write_json(req, &build_time_status(&state))
        })?;
    }

    Ok(server)
}

/// `Ok(None)` when the declared body exceeds `limit`.
fn read_request_body(
    req: &mut HttpRequest<'_, '_>,
    limit: usize,
) -> anyhow::Result<Option<Vec<u8>>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > limit {
        return Ok(None);
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)
            .map_err(|err| anyhow!("failed to read request body: {err:?}"))?;
    }
    Ok(Some(body))
}

fn write_reply(req: HttpRequest<'_, '_>, reply: &ApiReply) -> anyhow::Result<()> {
    req.into_response(
        reply.status,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&reply.to_bytes())?;
    Ok(())
}

fn write_json<T: Serialize>(req: HttpRequest<'_, '_>, payload: &T) -> anyhow::Result<()> {
    write_reply(req, &ApiReply::ok(payload))
}

fn write_error(req: HttpRequest<'_, '_>, status_code: u16, message: &str) -> anyhow::Result<()> {
    write_reply(req, &ApiReply::error(status_code, message))
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<EspWifi<'static>> {
    let ssid = network.wifi_ssid.trim();
    if ssid.is_empty() {
        return Err(anyhow!("wifi credentials missing; build with WIFI_SSID set"));
    }

    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: ssid
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{ssid}`");

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected and netif up on attempt {attempt}");
                last_err = None;
                break;
            }
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    match last_err {
        None => Ok(esp_wifi),
        Some(err) => Err(anyhow!(
            "all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed; last error: {err:#}"
        )),
    }
}

fn spawn_control_loop(state: SharedState) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("control-loop".into())
        .stack_size(8 * 1024)
        .spawn(move || {
            if let Err(err) = add_current_task_to_watchdog() {
                warn!("failed to register control loop with watchdog: {err:#}");
            }

            let tick = Duration::from_millis(state.config.tick_interval_ms);
            let mut wifi_disconnected_since_ms: Option<u64> = None;

            loop {
                feed_watchdog();
                check_wifi(&mut wifi_disconnected_since_ms);

                let timezone = lock(&state.timezone).clone();
                let now_in_tz = now_in_timezone(&timezone);
                state
                    .time_synced
                    .store(now_in_tz.is_some(), Ordering::Relaxed);

                let now_ms = monotonic_ms();
                if let Some(now) = now_in_tz {
                    let run = {
                        let schedule = lock(&state.schedule);
                        lock(&state.trigger).poll(&schedule, now.fixed_offset())
                    };

                    if let Some(run) = run {
                        match lock(&state.pump).apply(run.command(), now_ms) {
                            Ok(_) => info!(
                                "scheduled irrigation started at minute {} for {}ms",
                                run.start_minutes, run.duration_ms
                            ),
                            Err(err) => warn!("scheduled irrigation failed: {err}"),
                        }
                    }
                }

                let result = lock(&state.pump).tick(now_ms);
                match result {
                    Ok(Some(event)) => info!("pump event: {event:?}"),
                    Ok(None) => {}
                    Err(err) => warn!("pump tick failed: {err}"),
                }

                thread::sleep(tick);
            }
        })
        .context("failed to spawn control loop thread")?;

    Ok(())
}

fn check_wifi(disconnected_since_ms: &mut Option<u64>) {
    if is_wifi_station_connected() {
        *disconnected_since_ms = None;
        return;
    }

    let now_ms = uptime_ms();
    match *disconnected_since_ms {
        Some(since_ms) if now_ms.saturating_sub(since_ms) >= WIFI_RESTART_GRACE_MS => {
            restart_device(&format!(
                "wifi disconnected for {}s",
                WIFI_RESTART_GRACE_MS / 1000
            ));
        }
        Some(_) => {}
        None => {
            warn!("wifi station disconnected");
            *disconnected_since_ms = Some(now_ms);
        }
    }
}

fn build_status(state: &SharedState) -> ControllerStatus {
    let now_ms = monotonic_ms();
    let timezone = lock(&state.timezone).clone();

    let (schedule_enabled, next_schedule_event_epoch) = {
        let schedule = lock(&state.schedule);
        (
            schedule.enabled,
            now_in_timezone(&timezone).and_then(|now| schedule.next_event_epoch(now)),
        )
    };

    let pump = lock(&state.pump).status(now_ms);

    ControllerStatus {
        pump,
        schedule_enabled,
        next_schedule_event_epoch,
        time_synced: state.time_synced.load(Ordering::Relaxed),
        timezone,
        uptime_ms: uptime_ms(),
    }
}

fn build_time_status(state: &SharedState) -> TimeStatus {
    TimeStatus {
        time_synced: state.time_synced.load(Ordering::Relaxed),
        timezone: lock(&state.timezone).clone(),
        now_epoch: Utc::now().timestamp(),
    }
}

fn persist_timezone(nvs_store: &NvsStore, timezone: &str) -> anyhow::Result<()> {
    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("replacing unreadable runtime config: {err:#}");
        RuntimeConfig::default()
    });
    runtime.timezone = timezone.to_string();
    nvs_store.save_runtime_config(&runtime)
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = lock(&self.lock);
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 2048];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }

    fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = lock(&self.lock);
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let payload = serde_json::to_string(runtime)?;
        nvs.set_str(NVS_RUNTIME_KEY, &payload)?;
        Ok(())
    }

    fn load_schedule(&self) -> anyhow::Result<Schedule> {
        let _guard = lock(&self.lock);
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; MAX_SCHEDULE_BODY];

        match nvs.get_str(NVS_SCHEDULE_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<Schedule>(value)?),
            None => Ok(Schedule::default()),
        }
    }

    fn save_schedule(&self, schedule: &Schedule) -> anyhow::Result<()> {
        let _guard = lock(&self.lock);
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let payload = serde_json::to_string(schedule)?;
        nvs.set_str(NVS_SCHEDULE_KEY, &payload)?;
        Ok(())
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
}

/// The pump output is already released at boot, so a reset never leaves it
/// energized.
fn restart_device(reason: &str) {
    warn!("{reason}; restarting device for recovery");
    thread::sleep(Duration::from_millis(100));
    unsafe { esp_idf_svc::sys::esp_restart() };
}

/// Local time, or `None` until SNTP has set the clock.
fn now_in_timezone(timezone: &str) -> Option<DateTime<Tz>> {
    let utc = Utc::now();
    if utc.year() < MIN_SYNCED_YEAR {
        return None;
    }

    let tz: Tz = timezone.parse().ok()?;
    Some(utc.with_timezone(&tz))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn start_instant() -> Instant {
    static START: OnceLock<Instant> = OnceLock::new();
    *START.get_or_init(Instant::now)
}

/// Wraps every ~49.7 days like the hardware millisecond counter.
fn monotonic_ms() -> u32 {
    wrap_ms(start_instant().elapsed().as_millis())
}

fn uptime_ms() -> u64 {
    start_instant()
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
