use std::{
    collections::HashMap,
    fs,
    io::ErrorKind,
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    str::FromStr,
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::Mutex, time::MissedTickBehavior};
use tracing::{debug, info, warn};

use meterclock_common::{
    api::{parse_flag, SettingsChange, SettingsUpdate, SettingsView},
    error::{NtpError, RtcError, StoreError},
    lighting::LED_COUNT,
    meter::clamp_duty,
    types::{LocalTime, METER_COUNT},
    ClockService, ConfigStore, HardwareRtc, KvBackend, LightingOutput, MemoryBackend, Meter,
    MeterClock, MeterOutput, NetworkStatus, NtpClient, PosixTz, Rgb, ServiceError, StoredValue,
    SystemClock, TimeSource, ValueKind,
};

const DEFAULT_HTTP_PORT: u16 = 8080;
const DEFAULT_DATA_DIR: &str = "./.meterclock";
const CONTROL_LOOP_INTERVAL_MS: u64 = 5;
/// How long the simulated NTP client takes to answer after starting.
const SIMULATED_NTP_DELAY_MS: u64 = 2_000;
const NTP_PORT: u16 = 123;

const INDEX_HTML: &str = include_str!("../web/index.html");

type HostService = ClockService<JsonFileBackend, HostClock, SimulatedNtp, SimulatedRtc>;

#[derive(Clone)]
struct AppState {
    service: Arc<Mutex<HostService>>,
    network: HostNetwork,
    utc_switch: Arc<AtomicBool>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct SettingsUpdateResponse {
    #[serde(flatten)]
    change: SettingsChange,
    settings: SettingsView,
}

#[derive(Debug, Serialize)]
struct ManualTimeResponse {
    utc: String,
    #[serde(rename = "useNtp")]
    use_ntp: bool,
}

struct HostConfig {
    http_port: u16,
    data_dir: PathBuf,
    offline: bool,
    rtc_present: bool,
}

impl HostConfig {
    fn from_env() -> anyhow::Result<Self> {
        let http_port = match std::env::var("METERCLOCK_HTTP_PORT") {
            Ok(value) => value
                .parse()
                .with_context(|| format!("invalid METERCLOCK_HTTP_PORT `{value}`"))?,
            Err(_) => DEFAULT_HTTP_PORT,
        };
        let data_dir = std::env::var("METERCLOCK_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_DATA_DIR));

        Ok(Self {
            http_port,
            data_dir,
            offline: env_flag("METERCLOCK_OFFLINE"),
            rtc_present: !env_flag("METERCLOCK_NO_RTC"),
        })
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .ok()
        .and_then(|value| parse_flag(&value))
        .unwrap_or(false)
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = HostConfig::from_env()?;
    let backend = JsonFileBackend::open(config.data_dir.join("settings.json"))
        .context("failed to open settings store")?;
    let store = ConfigStore::load(backend);

    let time_base = TimeBase::unset();
    let clock = MeterClock::new(TimeSource::new(
        HostClock::new(time_base.clone()),
        SimulatedNtp::new(time_base, config.offline),
        SimulatedRtc::open(config.data_dir.join("rtc.json"), config.rtc_present),
    ));
    let mut service = ClockService::new(store, clock);
    service.start(monotonic_ms());
    spawn_ntp_lookups(service.active_ntp_servers(), !config.offline);

    let app_state = AppState {
        service: Arc::new(Mutex::new(service)),
        network: HostNetwork {
            connected: !config.offline,
        },
        utc_switch: Arc::new(AtomicBool::new(false)),
    };

    spawn_control_loop(app_state.clone());

    let app = Router::new()
        .route("/", get(handle_index))
        .route("/api/status", get(handle_get_status))
        .route(
            "/api/settings",
            get(handle_get_settings).put(handle_put_settings),
        )
        .route("/api/calibration", post(handle_set_calibration))
        .route("/api/calibration/preview", post(handle_calibration_preview))
        .route("/api/time/manual", post(handle_manual_time))
        .route("/api/time/ntp", post(handle_set_ntp))
        .route("/api/utc-switch", post(handle_utc_switch))
        .route("/api/ota", post(handle_post_ota))
        .with_state(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("meter clock simulator listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

fn spawn_control_loop(app_state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(CONTROL_LOOP_INTERVAL_MS));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut meters = LoggingMeters::default();
        let mut strip = LoggingStrip::default();

        loop {
            interval.tick().await;
            let now_ms = monotonic_ms();
            let utc_switch = app_state.utc_switch.load(Ordering::Relaxed);

            let mut service = app_state.service.lock().await;
            service.tick(
                now_ms,
                utc_switch,
                &app_state.network,
                &mut meters,
                &mut strip,
            );
        }
    });
}

async fn handle_index() -> impl IntoResponse {
    Html(INDEX_HTML)
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let service = state.service.lock().await;
    Json(service.status(state.network.is_connected()))
}

async fn handle_get_settings(State(state): State<AppState>) -> impl IntoResponse {
    let service = state.service.lock().await;
    Json(SettingsView::from_settings(service.settings()))
}

async fn handle_put_settings(
    State(state): State<AppState>,
    Json(update): Json<SettingsUpdate>,
) -> impl IntoResponse {
    let mut service = state.service.lock().await;
    match service.update_settings(&update) {
        Ok(change) => {
            if change.ntp_changed {
                spawn_ntp_lookups(service.active_ntp_servers(), state.network.is_connected());
            }
            Json(SettingsUpdateResponse {
                change,
                settings: SettingsView::from_settings(service.settings()),
            })
            .into_response()
        }
        Err(err) => service_error_response(&err),
    }
}

async fn handle_set_calibration(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(active) = params.get("active").and_then(|value| parse_flag(value)) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing or invalid 'active' parameter");
    };

    let mut service = state.service.lock().await;
    service.set_calibration_active(active);
    Json(service.calibration().snapshot()).into_response()
}

async fn handle_calibration_preview(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let index = match required_param::<usize>(&params, "index") {
        Ok(index) => index,
        Err(response) => return response,
    };
    let value = match required_param::<i32>(&params, "value") {
        Ok(value) => value,
        Err(response) => return response,
    };

    let mut service = state.service.lock().await;
    match service.preview_calibration(index, value) {
        Ok(()) => Json(service.calibration().snapshot()).into_response(),
        Err(err) => service_error_response(&err),
    }
}

async fn handle_manual_time(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let epoch = match required_param::<i64>(&params, "epoch") {
        Ok(epoch) => epoch,
        Err(response) => return response,
    };

    let mut service = state.service.lock().await;
    match service.set_manual_time(epoch, monotonic_ms()) {
        Ok(utc) => Json(ManualTimeResponse {
            utc: utc.to_string(),
            use_ntp: service.settings().use_ntp,
        })
        .into_response(),
        Err(err) => service_error_response(&err),
    }
}

async fn handle_set_ntp(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(enabled) = params.get("enabled").and_then(|value| parse_flag(value)) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing or invalid 'enabled' parameter");
    };

    let mut service = state.service.lock().await;
    if let Err(err) = service.set_use_ntp(enabled) {
        return service_error_response(&err);
    }
    spawn_ntp_lookups(service.active_ntp_servers(), state.network.is_connected());
    Json(service.status(state.network.is_connected())).into_response()
}

/// Logs where each NTP server resolves. The lookups run on their own task
/// and never touch the service, so the lock is not held across DNS.
fn spawn_ntp_lookups(servers: Vec<String>, online: bool) {
    if servers.is_empty() {
        return;
    }
    if !online {
        debug!("offline; skipping NTP server lookups");
        return;
    }
    tokio::spawn(async move {
        for server in servers {
            match resolve_ntp_server(&server).await {
                Ok(addr) => info!("NTP server {server} resolved to {addr}"),
                Err(err) => warn!("{err}; the client will keep retrying"),
            }
        }
    });
}

async fn resolve_ntp_server(host: &str) -> Result<IpAddr, NtpError> {
    tokio::net::lookup_host((host, NTP_PORT))
        .await
        .ok()
        .and_then(|mut addrs| addrs.next())
        .map(|addr| addr.ip())
        .ok_or_else(|| NtpError::Resolve(host.to_string()))
}

/// Stands in for the GPIO switch the device reads every loop.
async fn handle_utc_switch(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(enabled) = params.get("enabled").and_then(|value| parse_flag(value)) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing or invalid 'enabled' parameter");
    };
    state.utc_switch.store(enabled, Ordering::Relaxed);
    StatusCode::NO_CONTENT.into_response()
}

async fn handle_post_ota() -> impl IntoResponse {
    error_response(
        StatusCode::NOT_IMPLEMENTED,
        "Firmware upload is only available in ESP32 builds",
    )
}

fn required_param<T: FromStr>(
    params: &HashMap<String, String>,
    key: &str,
) -> Result<T, axum::response::Response> {
    let Some(raw) = params.get(key) else {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            &format!("Missing '{key}' parameter"),
        ));
    };
    raw.trim().parse().map_err(|_| {
        error_response(
            StatusCode::BAD_REQUEST,
            &format!("Invalid '{key}' parameter"),
        )
    })
}

fn service_error_response(err: &ServiceError) -> axum::response::Response {
    if matches!(err, ServiceError::Store(_)) {
        warn!("request failed: {err}");
    }
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    error_response(status, &err.to_string())
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

/// Offset between the simulated system clock and the host's real clock.
/// Starts at the Unix epoch, like a board that has just booted.
#[derive(Debug, Clone)]
struct TimeBase {
    offset_ms: Arc<AtomicI64>,
}

impl TimeBase {
    fn unset() -> Self {
        Self {
            offset_ms: Arc::new(AtomicI64::new(-Utc::now().timestamp_millis())),
        }
    }

    fn now(&self) -> NaiveDateTime {
        let millis = Utc::now().timestamp_millis() + self.offset_ms.load(Ordering::Relaxed);
        DateTime::from_timestamp_millis(millis)
            .map(|utc| utc.naive_utc())
            .unwrap_or_default()
    }

    fn set(&self, utc: NaiveDateTime) {
        let offset = utc.and_utc().timestamp_millis() - Utc::now().timestamp_millis();
        self.offset_ms.store(offset, Ordering::Relaxed);
    }

    fn sync_to_host(&self) {
        self.offset_ms.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug)]
struct HostClock {
    base: TimeBase,
    tz: PosixTz,
}

impl HostClock {
    fn new(base: TimeBase) -> Self {
        Self {
            base,
            tz: PosixTz::utc(),
        }
    }
}

impl SystemClock for HostClock {
    fn now_utc(&self) -> NaiveDateTime {
        self.base.now()
    }

    fn local_now(&self) -> LocalTime {
        self.tz.to_local(&self.base.now())
    }

    fn set_utc(&mut self, utc: NaiveDateTime) {
        self.base.set(utc);
    }

    fn apply_timezone(&mut self, posix: &str) {
        self.tz = PosixTz::parse(posix).unwrap_or_else(|err| {
            warn!("invalid timezone `{posix}` ({err}); using UTC");
            PosixTz::utc()
        });
        info!("timezone set to {}", self.tz);
    }
}

/// Pretends to be an SNTP client: once started, it snaps the simulated
/// clock to host time after a short delay unless running offline.
#[derive(Debug)]
struct SimulatedNtp {
    base: TimeBase,
    offline: bool,
    started_at_ms: Option<u64>,
    synced: bool,
}

impl SimulatedNtp {
    fn new(base: TimeBase, offline: bool) -> Self {
        Self {
            base,
            offline,
            started_at_ms: None,
            synced: false,
        }
    }
}

impl NtpClient for SimulatedNtp {
    fn start(&mut self, servers: &[&str]) -> Result<(), NtpError> {
        debug!("simulated NTP using {servers:?}");
        self.started_at_ms = Some(monotonic_ms());
        self.synced = false;
        Ok(())
    }

    fn stop(&mut self) {
        self.started_at_ms = None;
    }

    fn is_running(&self) -> bool {
        self.started_at_ms.is_some()
    }

    fn take_first_sync(&mut self) -> bool {
        let Some(started_at_ms) = self.started_at_ms else {
            return false;
        };
        if self.offline
            || self.synced
            || monotonic_ms().saturating_sub(started_at_ms) < SIMULATED_NTP_DELAY_MS
        {
            return false;
        }
        self.base.sync_to_host();
        self.synced = true;
        true
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RtcFile {
    #[serde(rename = "offsetSecs")]
    offset_secs: i64,
}

/// Battery-backed RTC stand-in. Keeps its offset from host time in a file
/// so the simulated clock survives restarts the way a DS3231 would.
#[derive(Debug)]
struct SimulatedRtc {
    path: PathBuf,
    present: bool,
    offset_secs: Option<i64>,
}

impl SimulatedRtc {
    fn open(path: PathBuf, present: bool) -> Self {
        let offset_secs = fs::read(&path)
            .ok()
            .and_then(|raw| serde_json::from_slice::<RtcFile>(&raw).ok())
            .map(|file| file.offset_secs);
        Self {
            path,
            present,
            offset_secs,
        }
    }
}

impl HardwareRtc for SimulatedRtc {
    fn probe(&mut self) -> bool {
        self.present
    }

    fn lost_power(&mut self) -> Result<bool, RtcError> {
        Ok(self.offset_secs.is_none())
    }

    /// A DS3231 that lost power restarts at 2000-01-01.
    fn read_utc(&mut self) -> Result<NaiveDateTime, RtcError> {
        match self.offset_secs {
            Some(offset) => DateTime::from_timestamp(Utc::now().timestamp() + offset, 0)
                .map(|utc| utc.naive_utc())
                .ok_or(RtcError::InvalidDateTime),
            None => NaiveDate::from_ymd_opt(2000, 1, 1)
                .and_then(|date| date.and_hms_opt(0, 0, 0))
                .ok_or(RtcError::InvalidDateTime),
        }
    }

    fn write_utc(&mut self, utc: NaiveDateTime) -> Result<(), RtcError> {
        let offset_secs = utc.and_utc().timestamp() - Utc::now().timestamp();
        write_json_file(&self.path, &RtcFile { offset_secs })
            .map_err(|err| RtcError::Bus(format!("{err:#}")))?;
        self.offset_secs = Some(offset_secs);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct LoggingMeters {
    duty: [u16; METER_COUNT],
}

impl MeterOutput for LoggingMeters {
    fn set_value(&mut self, meter: Meter, value: i32) {
        let duty = clamp_duty(value);
        let slot = &mut self.duty[meter.index()];
        if *slot != duty {
            *slot = duty;
            debug!(meter = meter.as_str(), duty, "meter updated");
        }
    }
}

#[derive(Debug, Default)]
struct LoggingStrip {
    staged: [Rgb; LED_COUNT],
    brightness: u8,
    shown: Option<([Rgb; LED_COUNT], u8)>,
}

impl LightingOutput for LoggingStrip {
    fn set_all(&mut self, color: Rgb) {
        self.staged = [color; LED_COUNT];
    }

    fn set_pixel(&mut self, index: usize, color: Rgb) {
        if let Some(pixel) = self.staged.get_mut(index) {
            *pixel = color;
        }
    }

    fn set_brightness(&mut self, brightness: u8) {
        self.brightness = brightness;
    }

    fn present(&mut self) {
        let frame = (self.staged, self.brightness);
        if self.shown == Some(frame) {
            return;
        }
        let pixels: Vec<String> = self
            .staged
            .iter()
            .map(|pixel| pixel.scale(self.brightness).to_hex())
            .collect();
        debug!(brightness = self.brightness, ?pixels, "strip updated");
        self.shown = Some(frame);
    }
}

#[derive(Debug, Clone, Copy)]
struct HostNetwork {
    connected: bool,
}

impl NetworkStatus for HostNetwork {
    fn is_connected(&self) -> bool {
        self.connected
    }
}

/// Settings partition stand-in: the typed key/value map as one JSON file,
/// rewritten on every set.
#[derive(Debug)]
struct JsonFileBackend {
    path: PathBuf,
    values: MemoryBackend,
}

impl JsonFileBackend {
    fn open(path: PathBuf) -> anyhow::Result<Self> {
        let values = match fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw)
                .with_context(|| format!("invalid settings file {}", path.display()))?,
            Err(err) if err.kind() == ErrorKind::NotFound => MemoryBackend::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self { path, values })
    }
}

impl KvBackend for JsonFileBackend {
    fn get(&self, key: &str, kind: ValueKind) -> Result<Option<StoredValue>, StoreError> {
        self.values.get(key, kind)
    }

    fn set(&mut self, key: &str, value: &StoredValue) -> Result<(), StoreError> {
        self.values.set(key, value)?;
        write_json_file(&self.path, &self.values).map_err(|err| StoreError::Backend {
            key: key.to_string(),
            message: format!("{err:#}"),
        })
    }
}

fn write_json_file<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let payload = serde_json::to_vec_pretty(value)?;
    fs::write(path, payload).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("meterclock-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn settings_file_survives_reopen() {
        let path = scratch_dir("settings").join("settings.json");
        let mut backend = JsonFileBackend::open(path.clone()).unwrap();
        backend
            .set("tz", &StoredValue::Str("EST5EDT".into()))
            .unwrap();
        backend.set("12h", &StoredValue::Bool(false)).unwrap();

        let reopened = JsonFileBackend::open(path).unwrap();
        assert_eq!(
            reopened.get("tz", ValueKind::Str).unwrap(),
            Some(StoredValue::Str("EST5EDT".into()))
        );
        assert_eq!(
            reopened.get("12h", ValueKind::Bool).unwrap(),
            Some(StoredValue::Bool(false))
        );
    }

    #[test]
    fn unwritten_rtc_reports_power_loss() {
        let path = scratch_dir("rtc").join("rtc.json");
        let mut rtc = SimulatedRtc::open(path.clone(), true);
        assert!(rtc.lost_power().unwrap());
        assert_eq!(rtc.read_utc().unwrap().and_utc().timestamp(), 946_684_800);

        let target = NaiveDate::from_ymd_opt(2030, 6, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        rtc.write_utc(target).unwrap();

        let mut reopened = SimulatedRtc::open(path, true);
        assert!(!reopened.lost_power().unwrap());
        let drift = (reopened.read_utc().unwrap() - target).num_seconds().abs();
        assert!(drift <= 2);
    }

    #[test]
    fn time_base_starts_at_epoch_and_follows_sets() {
        let base = TimeBase::unset();
        assert!(base.now().and_utc().timestamp() < 60);

        let target = NaiveDate::from_ymd_opt(2027, 3, 14)
            .unwrap()
            .and_hms_opt(1, 59, 26)
            .unwrap();
        base.set(target);
        assert!((base.now() - target).num_seconds().abs() <= 1);

        base.sync_to_host();
        assert!((base.now() - Utc::now().naive_utc()).num_seconds().abs() <= 1);
    }

    #[test]
    fn offline_ntp_never_syncs() {
        let mut ntp = SimulatedNtp::new(TimeBase::unset(), true);
        ntp.start(&["time.google.com"]).unwrap();
        assert!(ntp.is_running());
        assert!(!ntp.take_first_sync());
    }

    #[tokio::test]
    async fn ntp_lookup_accepts_literal_addresses() {
        assert_eq!(
            resolve_ntp_server("192.0.2.7").await.unwrap(),
            IpAddr::from([192, 0, 2, 7])
        );
    }
}
