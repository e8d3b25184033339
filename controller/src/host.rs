use std::{
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, FixedOffset, Utc};
use chrono_tz::Tz;
use tokio::{net::TcpListener, sync::Mutex};
use tower_http::services::ServeDir;
use tracing::{info, warn};

use pump_common::{
    api::{applied_reply, status_reply},
    clock::wrap_ms,
    ApiReply, CommandInterpreter, ControllerStatus, HardwareFault, HealthStatus,
    IrrigationTrigger, PumpCommand, PumpConfig, PumpOutput, PumpScheduler, RuntimeConfig,
    Schedule, TimeStatus, TimezoneUpdate, SERVICE_NAME,
};

/// Stand-in for the relay line; records the level and logs every write.
#[derive(Debug, Default)]
struct SimulatedPump {
    engaged: bool,
}

impl PumpOutput for SimulatedPump {
    fn write(&mut self, engaged: bool) -> Result<(), HardwareFault> {
        if self.engaged != engaged {
            info!(engaged, "simulated pump output changed");
        }
        self.engaged = engaged;
        Ok(())
    }
}

#[derive(Clone)]
struct AppState {
    pump: Arc<Mutex<PumpScheduler<SimulatedPump>>>,
    interpreter: CommandInterpreter,
    schedule: Arc<Mutex<Schedule>>,
    trigger: Arc<Mutex<IrrigationTrigger>>,
    timezone: Arc<Mutex<String>>,
    time_synced: Arc<AtomicBool>,
    store: AppStore,
    config: PumpConfig,
}

#[derive(Clone)]
struct AppStore {
    runtime_path: Arc<PathBuf>,
    schedule_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = std::env::var("PUMP_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.pump"));
    let store = AppStore::new(data_dir);

    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();

    let mut schedule = store.load_schedule().await.unwrap_or_else(|err| {
        warn!("failed to load schedule from store: {err:#}");
        Schedule::default()
    });
    schedule.normalize(runtime.pump.max_duration_ms);

    let state = AppState::new(runtime, schedule, store)?;
    spawn_control_loop(state.clone());

    let web_root = format!("{}/web", env!("CARGO_MANIFEST_DIR"));
    let app = router(state.clone(), web_root);

    let port = std::env::var("PUMP_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind pump server at {addr}"))?;

    info!("pump controller listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Never leave the simulated relay energized after exit.
    if let Err(err) = state.pump.lock().await.apply(PumpCommand::off(), monotonic_ms()) {
        warn!("failed to release pump on shutdown: {err}");
    }
    info!("pump controller stopped");
    Ok(())
}

impl AppState {
    fn new(runtime: RuntimeConfig, schedule: Schedule, store: AppStore) -> anyhow::Result<Self> {
        let pump = PumpScheduler::new(SimulatedPump::default())
            .context("failed to drive pump output low at startup")?;

        Ok(Self {
            pump: Arc::new(Mutex::new(pump)),
            interpreter: CommandInterpreter::new(runtime.pump.max_duration_ms),
            schedule: Arc::new(Mutex::new(schedule)),
            trigger: Arc::new(Mutex::new(IrrigationTrigger::default())),
            timezone: Arc::new(Mutex::new(runtime.timezone)),
            time_synced: Arc::new(AtomicBool::new(false)),
            store,
            config: runtime.pump,
        })
    }
}

fn router(state: AppState, web_root: String) -> Router {
    Router::new()
        .route("/status", get(handle_get_status))
        .route("/status/detail", get(handle_get_status_detail))
        .route(
            "/pump",
            post(handle_post_pump).fallback(handle_method_not_allowed),
        )
        .route("/health", get(handle_get_health))
        .route(
            "/schedule",
            get(handle_get_schedule).put(handle_put_schedule),
        )
        .route("/time", get(handle_get_time))
        .route("/timezone", put(handle_put_timezone))
        .fallback_service(ServeDir::new(web_root))
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
}

fn spawn_control_loop(state: AppState) {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_millis(state.config.tick_interval_ms));

        loop {
            interval.tick().await;

            let timezone = { state.timezone.lock().await.clone() };
            let now_in_tz = now_in_timezone(&timezone);
            state
                .time_synced
                .store(now_in_tz.is_some(), Ordering::Relaxed);

            let now_fixed = now_in_tz.map(|now| now.fixed_offset());
            control_step(&state, monotonic_ms(), now_fixed).await;
        }
    });
}

/// One control loop iteration: fire a due irrigation run, then enforce the
/// auto-off deadline.
async fn control_step(state: &AppState, now_ms: u32, now_in_tz: Option<DateTime<FixedOffset>>) {
    if let Some(now) = now_in_tz {
        let run = {
            let schedule = state.schedule.lock().await;
            state.trigger.lock().await.poll(&schedule, now)
        };

        if let Some(run) = run {
            let result = state.pump.lock().await.apply(run.command(), now_ms);
            match result {
                Ok(_) => info!(
                    start_minutes = run.start_minutes,
                    duration_ms = run.duration_ms,
                    "scheduled irrigation started"
                ),
                Err(err) => warn!("scheduled irrigation failed: {err}"),
            }
        }
    }

    let result = state.pump.lock().await.tick(now_ms);
    match result {
        Ok(Some(event)) => info!(?event, "pump event"),
        Ok(None) => {}
        Err(err) => warn!("pump tick failed: {err}"),
    }
}

async fn handle_get_status(State(state): State<AppState>) -> Response {
    let reply = status_reply(&*state.pump.lock().await);
    reply_response(reply)
}

async fn handle_get_status_detail(State(state): State<AppState>) -> impl IntoResponse {
    Json(build_status(&state).await)
}

async fn handle_post_pump(State(state): State<AppState>, body: Bytes) -> Response {
    if body.len() > state.config.max_body_bytes {
        return reply_response(ApiReply::payload_too_large());
    }

    let command = match state.interpreter.interpret(&body) {
        Ok(command) => command,
        Err(err) => {
            warn!("rejected pump command: {err}");
            return reply_response((&err).into());
        }
    };

    let (result, event) = {
        let mut pump = state.pump.lock().await;
        let result = pump.apply(command, monotonic_ms());
        (result, pump.last_event())
    };
    match &result {
        Ok(snapshot) => info!(?event, state = snapshot.state.as_str(), "pump command applied"),
        Err(err) => warn!(?command, "pump command failed: {err}"),
    }

    reply_response(applied_reply(&result))
}

async fn handle_method_not_allowed() -> Response {
    reply_response(ApiReply::method_not_allowed())
}

async fn handle_get_health() -> impl IntoResponse {
    Json(HealthStatus {
        ok: true,
        service: SERVICE_NAME,
        uptime_ms: uptime_ms(),
    })
}

async fn handle_get_schedule(State(state): State<AppState>) -> impl IntoResponse {
    let schedule = state.schedule.lock().await.clone();
    Json(schedule)
}

async fn handle_put_schedule(State(state): State<AppState>, body: Bytes) -> Response {
    let Ok(mut schedule) = serde_json::from_slice::<Schedule>(&body) else {
        return reply_response(ApiReply::invalid_json());
    };
    schedule.normalize(state.config.max_duration_ms);

    if let Err(err) = state.store.save_schedule(&schedule).await {
        warn!("failed to persist schedule update: {err:#}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to persist schedule",
        );
    }

    {
        let mut active = state.schedule.lock().await;
        *active = schedule.clone();
    }
    state.trigger.lock().await.reset();

    info!(entries = schedule.entries.len(), "schedule updated");
    Json(schedule).into_response()
}

async fn handle_get_time(State(state): State<AppState>) -> impl IntoResponse {
    let timezone = state.timezone.lock().await.clone();
    Json(TimeStatus {
        time_synced: state.time_synced.load(Ordering::Relaxed),
        timezone,
        now_epoch: Utc::now().timestamp(),
    })
}

async fn handle_put_timezone(State(state): State<AppState>, body: Bytes) -> Response {
    let Ok(update) = serde_json::from_slice::<TimezoneUpdate>(&body) else {
        return reply_response(ApiReply::invalid_json());
    };
    if update.timezone.parse::<Tz>().is_err() {
        return error_response(StatusCode::BAD_REQUEST, "Invalid timezone value");
    }

    if let Err(err) = persist_timezone(&state.store, &update.timezone).await {
        warn!("failed to persist timezone update: {err:#}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to persist runtime settings",
        );
    }

    {
        let mut timezone = state.timezone.lock().await;
        *timezone = update.timezone;
    }
    state.trigger.lock().await.reset();

    handle_get_time(State(state)).await.into_response()
}

async fn build_status(state: &AppState) -> ControllerStatus {
    let now_ms = monotonic_ms();
    let timezone = state.timezone.lock().await.clone();

    let (schedule_enabled, next_schedule) = {
        let schedule = state.schedule.lock().await;
        (
            schedule.enabled,
            now_in_timezone(&timezone).and_then(|now| schedule.next_event_epoch(now)),
        )
    };

    let pump = state.pump.lock().await.status(now_ms);

    ControllerStatus {
        pump,
        schedule_enabled,
        next_schedule_event_epoch: next_schedule,
        time_synced: state.time_synced.load(Ordering::Relaxed),
        timezone,
        uptime_ms: uptime_ms(),
    }
}

impl AppStore {
    fn new(data_dir: PathBuf) -> Self {
        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            schedule_path: Arc::new(data_dir.join("schedule.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)
                .context("runtime.json is not valid")?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.runtime_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(runtime)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }

    async fn load_schedule(&self) -> anyhow::Result<Schedule> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.schedule_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<Schedule>(&raw)
                .context("schedule.json is not valid")?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Schedule::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_schedule(&self, schedule: &Schedule) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.schedule_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(schedule)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }
}

/// An unreadable runtime.json is replaced, the same way boot falls back to
/// defaults.
async fn persist_timezone(store: &AppStore, timezone: &str) -> anyhow::Result<()> {
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("replacing unreadable runtime config: {err:#}");
        RuntimeConfig::default()
    });
    runtime.timezone = timezone.to_string();
    store.save_runtime_config(&runtime).await
}

fn now_in_timezone(timezone: &str) -> Option<DateTime<Tz>> {
    let tz: Tz = timezone.parse().ok()?;
    Some(Utc::now().with_timezone(&tz))
}

fn reply_response(reply: ApiReply) -> Response {
    let status =
        StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(reply.body)).into_response()
}

fn error_response(status: StatusCode, message: &str) -> Response {
    reply_response(ApiReply::error(status.as_u16(), message))
}

fn start_instant() -> Instant {
    static START: OnceLock<Instant> = OnceLock::new();
    *START.get_or_init(Instant::now)
}

/// Millisecond counter with the same 32-bit rollover as the firmware clock.
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
