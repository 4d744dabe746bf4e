use core::convert::TryInto;
use std::{
    net::{IpAddr, ToSocketAddrs},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, OnceLock, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::{NaiveDateTime, Utc};
use ds323x::{interface::I2cInterface, ic::DS3231, DateTimeAccess, Ds323x};
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    gpio::{Gpio4, Input, PinDriver, Pull},
    i2c::{I2cConfig, I2cDriver},
    ledc::{config::TimerConfig, LedcDriver, LedcTimerDriver, Resolution},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::*},
    http::server::{Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request},
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    ota::EspOta,
    sntp::{EspSntp, SntpConf},
    wifi::{BlockingWifi, EspWifi},
};
use log::{debug, info, warn};
use serde::Serialize;
use sha2::{Digest, Sha256};
use smart_leds_trait::{SmartLedsWrite, RGB8};
use ws2812_esp32_rmt_driver::{driver::color::LedPixelColorGrb24, LedPixelEsp32Rmt};

use meterclock_common::{
    api::{parse_flag, parse_query, SettingsChange, SettingsUpdate, SettingsView},
    config::{credentials_fit, MAX_STR_LEN, NVS_NAMESPACE},
    ports::FirstSyncLatch,
    error::{NtpError, RtcError, StoreError},
    lighting::LED_COUNT,
    meter::clamp_duty,
    types::{LocalTime, METER_COUNT},
    ClockService, ClockSettings, ConfigStore, HardwareRtc, KvBackend, LightingOutput, Meter,
    MeterClock, MeterOutput, NetworkStatus, NtpClient, PosixTz, Rgb, ServiceError, StoredValue,
    SystemClock, TimeSource, ValueKind,
};

const MAX_HTTP_BODY: usize = 4096;
const MAX_NVS_STR: usize = MAX_STR_LEN + 1;
const OTA_CHUNK_SIZE: usize = 4096;
const CONFIG_AP_SSID: &str = "MeterClock_Config";
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const WIFI_CONNECT_ATTEMPTS: u32 = 15;
const WIFI_RETRY_DELAY_MS: u64 = 500;
const CONTROL_LOOP_SLEEP_MS: u64 = 10;
const RESTART_DELAY_MS: u64 = 800;
const METER_PWM_KHZ: u32 = 5;
const RTC_I2C_KHZ: u32 = 100;
const NTP_PORT: u16 = 123;

const INDEX_HTML: &str = include_str!("../web/index.html");

type Rtc = Ds323x<I2cInterface<I2cDriver<'static>>, DS3231>;
type DeviceService = ClockService<NvsBackend, EspSystemClock, EspNtp, Ds3231Rtc>;
type HttpRequest<'r, 'c> = Request<&'r mut EspHttpConnection<'c>>;

#[derive(Clone)]
struct SharedState {
    service: Arc<Mutex<DeviceService>>,
    wifi_connected: Arc<AtomicBool>,
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

#[derive(Debug, Serialize)]
struct OtaResponse {
    #[serde(rename = "bytesWritten")]
    bytes_written: u64,
    sha256: String,
    rebooting: bool,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let backend = NvsBackend::open(nvs_partition.clone())?;
    let store = ConfigStore::load(backend);

    info!(
        "settings loaded: ssid=`{}`, tz=`{}`, ntp=`{}` (enabled={})",
        store.settings().wifi_ssid,
        store.settings().timezone,
        store.settings().ntp_server,
        store.settings().use_ntp,
    );

    let peripherals = Peripherals::take()?;
    let pins = peripherals.pins;

    let ledc = peripherals.ledc;
    let timer_config = TimerConfig::default()
        .frequency(METER_PWM_KHZ.kHz().into())
        .resolution(Resolution::Bits10);
    let meters = LedcMeters::new([
        LedcDriver::new(
            ledc.channel0,
            LedcTimerDriver::new(ledc.timer0, &timer_config)?,
            pins.gpio25,
        )?,
        LedcDriver::new(
            ledc.channel1,
            LedcTimerDriver::new(ledc.timer1, &timer_config)?,
            pins.gpio26,
        )?,
        LedcDriver::new(
            ledc.channel2,
            LedcTimerDriver::new(ledc.timer2, &timer_config)?,
            pins.gpio27,
        )?,
    ])
    .context("failed to initialize meter PWM")?;

    let strip = match LedPixelEsp32Rmt::<RGB8, LedPixelColorGrb24>::new(
        peripherals.rmt.channel0,
        pins.gpio13,
    ) {
        Ok(driver) => Ws2812Strip::new(Some(driver)),
        Err(err) => {
            warn!("failed to initialize LED strip, running without lighting: {err:?}");
            Ws2812Strip::new(None)
        }
    };

    let mut utc_switch = PinDriver::input(pins.gpio4)?;
    utc_switch.set_pull(Pull::Up)?;

    let rtc = match I2cDriver::new(
        peripherals.i2c0,
        pins.gpio21,
        pins.gpio22,
        &I2cConfig::new().baudrate(RTC_I2C_KHZ.kHz().into()),
    ) {
        Ok(i2c) => Ds3231Rtc::new(Some(Ds323x::new_ds3231(i2c))),
        Err(err) => {
            warn!("failed to initialize I2C bus for RTC: {err}");
            Ds3231Rtc::new(None)
        }
    };

    let (wifi, wifi_connected) = connect_wifi(
        peripherals.modem,
        sys_loop,
        nvs_partition,
        store.settings(),
    )
    .context("wifi startup failed")?;
    if wifi_connected {
        disable_wifi_power_save();
    }

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    if let Ok(mut ota) = EspOta::new() {
        if let Err(err) = ota.mark_running_slot_valid() {
            warn!("failed to mark running OTA slot valid: {err:?}");
        }
    }

    let clock = MeterClock::new(TimeSource::new(
        EspSystemClock::new(),
        EspNtp::default(),
        rtc,
    ));
    let mut service = ClockService::new(store, clock);
    service.start(monotonic_ms());
    if wifi_connected {
        spawn_ntp_lookups(service.active_ntp_servers());
    }

    let shared_state = SharedState {
        service: Arc::new(Mutex::new(service)),
        wifi_connected: Arc::new(AtomicBool::new(wifi_connected)),
    };

    spawn_control_loop(shared_state.clone(), meters, strip, utc_switch);

    let server = create_http_server(shared_state)?;

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _server = server;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn lock(service: &Mutex<DeviceService>) -> MutexGuard<'_, DeviceService> {
    service.lock().unwrap_or_else(PoisonError::into_inner)
}

fn spawn_control_loop(
    state: SharedState,
    mut meters: LedcMeters,
    mut strip: Ws2812Strip,
    utc_switch: PinDriver<'static, Gpio4, Input>,
) {
    thread::Builder::new()
        .name("control-loop".into())
        .stack_size(12 * 1024)
        .spawn(move || {
            if let Err(err) = add_current_task_to_watchdog() {
                warn!("failed to register control loop with watchdog: {err:#}");
            }

            let network = EspNetwork;
            loop {
                feed_watchdog();
                let now_ms = monotonic_ms();
                let connected = network.is_connected();
                state.wifi_connected.store(connected, Ordering::Relaxed);

                // Switch pulls the input to ground.
                let utc_selected = utc_switch.is_low();

                lock(&state.service).tick(
                    now_ms,
                    utc_selected,
                    &network,
                    &mut meters,
                    &mut strip,
                );

                thread::sleep(Duration::from_millis(CONTROL_LOOP_SLEEP_MS));
            }
        })
        .expect("failed to spawn control loop thread");
}

fn create_http_server(state: SharedState) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    server.fn_handler::<anyhow::Error, _>("/", Method::Get, move |req| {
        req.into_ok_response()?.write_all(INDEX_HTML.as_bytes())?;
        Ok(())
    })?;

    {
        let state = state.clone();
        server.fn_handler("/api/status", Method::Get, move |req| {
            let connected = state.wifi_connected.load(Ordering::Relaxed);
            let status = lock(&state.service).status(connected);
            write_json(req, &status)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/settings", Method::Get, move |req| {
            let view = SettingsView::from_settings(lock(&state.service).settings());
            write_json(req, &view)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/api/settings", Method::Put, move |mut req| {
            let body = read_request_body(&mut req)?;
            let Ok(update) = serde_json::from_slice::<SettingsUpdate>(&body) else {
                return write_error(req, 400, "Invalid settings payload");
            };

            let (result, ntp_servers) = {
                let mut service = lock(&state.service);
                let result = service.update_settings(&update).map(|change| SettingsUpdateResponse {
                    change,
                    settings: SettingsView::from_settings(service.settings()),
                });
                let ntp_changed = result.as_ref().is_ok_and(|payload| payload.change.ntp_changed);
                let servers = if ntp_changed {
                    service.active_ntp_servers()
                } else {
                    Vec::new()
                };
                (result, servers)
            };
            if state.wifi_connected.load(Ordering::Relaxed) {
                spawn_ntp_lookups(ntp_servers);
            }

            match result {
                Ok(payload) => {
                    let restart = payload.change.restart_required;
                    write_json(req, &payload)?;
                    if restart {
                        info!("network settings changed; restarting");
                        schedule_restart();
                    }
                    Ok(())
                }
                Err(err) => write_service_error(req, &err),
            }
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/calibration", Method::Post, move |req| {
            let params = parse_query(req.uri());
            let Some(active) = params.get("active").and_then(|value| parse_flag(value)) else {
                return write_error(req, 400, "Missing or invalid 'active' parameter");
            };

            let snapshot = {
                let mut service = lock(&state.service);
                service.set_calibration_active(active);
                service.calibration().snapshot()
            };
            write_json(req, &snapshot)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/calibration/preview", Method::Post, move |req| {
            let params = parse_query(req.uri());
            let index = params.get("index").and_then(|value| value.parse::<usize>().ok());
            let value = params.get("value").and_then(|value| value.parse::<i32>().ok());
            let (Some(index), Some(value)) = (index, value) else {
                return write_error(req, 400, "Missing or invalid 'index'/'value' parameters");
            };

            let result = {
                let mut service = lock(&state.service);
                service
                    .preview_calibration(index, value)
                    .map(|()| service.calibration().snapshot())
            };
            match result {
                Ok(snapshot) => write_json(req, &snapshot),
                Err(err) => write_service_error(req, &err),
            }
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/time/manual", Method::Post, move |req| {
            let params = parse_query(req.uri());
            let Some(epoch) = params.get("epoch").and_then(|value| value.parse::<i64>().ok())
            else {
                return write_error(req, 400, "Missing or invalid 'epoch' parameter");
            };

            let result = {
                let mut service = lock(&state.service);
                service
                    .set_manual_time(epoch, monotonic_ms())
                    .map(|utc| ManualTimeResponse {
                        utc: utc.to_string(),
                        use_ntp: service.settings().use_ntp,
                    })
            };
            match result {
                Ok(payload) => write_json(req, &payload),
                Err(err) => write_service_error(req, &err),
            }
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/time/ntp", Method::Post, move |req| {
            let params = parse_query(req.uri());
            let Some(enabled) = params.get("enabled").and_then(|value| parse_flag(value)) else {
                return write_error(req, 400, "Missing or invalid 'enabled' parameter");
            };

            let connected = state.wifi_connected.load(Ordering::Relaxed);
            let result = {
                let mut service = lock(&state.service);
                service
                    .set_use_ntp(enabled)
                    .map(|()| (service.status(connected), service.active_ntp_servers()))
            };
            let result = result.map(|(status, servers)| {
                if connected {
                    spawn_ntp_lookups(servers);
                }
                status
            });
            match result {
                Ok(status) => write_json(req, &status),
                Err(err) => write_service_error(req, &err),
            }
        })?;
    }

    server.fn_handler::<anyhow::Error, _>("/api/ota", Method::Post, move |mut req| {
        let params = parse_query(req.uri());
        let expected_sha256 = params
            .get("sha256")
            .map(|value| value.trim().to_ascii_lowercase());

        match receive_firmware(&mut req, expected_sha256.as_deref()) {
            Ok((bytes_written, sha256)) => {
                info!("firmware upload complete ({bytes_written} bytes)");
                write_json(
                    req,
                    &OtaResponse {
                        bytes_written,
                        sha256,
                        rebooting: true,
                    },
                )?;
                schedule_restart();
                Ok(())
            }
            Err(err) => {
                warn!("firmware upload failed: {err:#}");
                write_error(req, 400, &err.to_string())
            }
        }
    })?;

    Ok(server)
}

fn receive_firmware(
    req: &mut HttpRequest<'_, '_>,
    expected_sha256: Option<&str>,
) -> anyhow::Result<(u64, String)> {
    let mut ota = EspOta::new().map_err(|err| anyhow!("failed to acquire OTA: {err:?}"))?;
    let mut update = ota
        .initiate_update()
        .map_err(|err| anyhow!("failed to initiate OTA update: {err:?}"))?;

    let mut hasher = Sha256::new();
    let mut total_written = 0_u64;
    let mut chunk = vec![0_u8; OTA_CHUNK_SIZE];

    loop {
        let read = req.read(&mut chunk).map_err(|e| anyhow!("{e:?}"))?;
        if read == 0 {
            break;
        }

        update
            .write(&chunk[..read])
            .map_err(|err| anyhow!("failed writing OTA data: {err:?}"))?;
        hasher.update(&chunk[..read]);
        total_written = total_written.saturating_add(read as u64);
    }

    if total_written == 0 {
        return Err(anyhow!("firmware upload body is empty"));
    }

    let digest = hasher.finalize();
    let mut digest_hex = String::with_capacity(64);
    for byte in digest {
        use core::fmt::Write as _;
        let _ = write!(&mut digest_hex, "{byte:02x}");
    }

    if let Some(expected) = expected_sha256 {
        if digest_hex != expected {
            return Err(anyhow!(
                "sha256 mismatch (expected {expected}, got {digest_hex})"
            ));
        }
    }

    update
        .complete()
        .map_err(|err| anyhow!("failed finalizing OTA image: {err:?}"))?;
    drop(ota);

    Ok((total_written, digest_hex))
}

/// Logs where each NTP server resolves. getaddrinfo blocks for the whole
/// DNS timeout, so it runs on its own thread with the service unlocked.
fn spawn_ntp_lookups(servers: Vec<String>) {
    if servers.is_empty() {
        return;
    }
    let spawned = thread::Builder::new()
        .name("ntp-lookup".into())
        .stack_size(6 * 1024)
        .spawn(move || {
            for server in servers {
                match resolve_ntp_server(&server) {
                    Ok(addr) => info!("NTP server {server} resolved to {addr}"),
                    Err(err) => warn!("{err}; the client will keep retrying"),
                }
            }
        });
    if let Err(err) = spawned {
        warn!("failed to start NTP lookup: {err}");
    }
}

fn resolve_ntp_server(host: &str) -> Result<IpAddr, NtpError> {
    (host, NTP_PORT)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .map(|addr| addr.ip())
        .ok_or_else(|| NtpError::Resolve(host.to_string()))
}

fn schedule_restart() {
    let spawned = thread::Builder::new()
        .name("restart".into())
        .stack_size(4 * 1024)
        .spawn(|| {
            thread::sleep(Duration::from_millis(RESTART_DELAY_MS));
            unsafe { esp_idf_svc::sys::esp_restart() };
        });
    if let Err(err) = spawned {
        warn!("failed to schedule restart: {err}");
    }
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

fn write_json<T: Serialize>(req: HttpRequest<'_, '_>, payload: &T) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_service_error(req: HttpRequest<'_, '_>, err: &ServiceError) -> anyhow::Result<()> {
    if matches!(err, ServiceError::Store(_)) {
        warn!("request failed: {err}");
    }
    write_error(req, err.http_status(), &err.to_string())
}

fn write_error(req: HttpRequest<'_, '_>, status_code: u16, message: &str) -> anyhow::Result<()> {
    let payload = serde_json::json!({ "error": message });
    let body = serde_json::to_vec(&payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

/// Credentials from NVS, falling back to the ones baked in at build time.
fn station_credentials(settings: &ClockSettings) -> Option<(String, String)> {
    if settings.has_station_credentials() {
        return Some((settings.wifi_ssid.clone(), settings.wifi_pass.clone()));
    }
    let ssid = option_env!("WIFI_SSID").filter(|ssid| !ssid.is_empty())?;
    Some((ssid.to_string(), option_env!("WIFI_PASS").unwrap_or_default().to_string()))
}

/// Returns the driver and whether the station link came up. On failure the
/// open configuration access point is started instead.
fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    settings: &ClockSettings,
) -> anyhow::Result<(EspWifi<'static>, bool)> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let Some((ssid, pass)) = station_credentials(settings) else {
        warn!("wifi credentials missing; starting configuration AP");
        start_config_ap(&mut wifi)?;
        return Ok((esp_wifi, false));
    };
    if !credentials_fit(&ssid, &pass) {
        warn!("wifi credentials exceed radio limits; starting configuration AP");
        start_config_ap(&mut wifi)?;
        return Ok((esp_wifi, false));
    }

    let auth_method = if pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: pass
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
        debug!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
        match wifi.connect() {
            Ok(()) => match wifi.wait_netif_up() {
                Ok(()) => {
                    info!("wifi connected and netif up on attempt {attempt}");
                    last_err = None;
                    break;
                }
                Err(err) => {
                    warn!("wifi netif up failed on attempt {attempt}: {err:#}");
                    last_err = Some(err);
                }
            },
            Err(err) => {
                debug!("wifi connect failed on attempt {attempt}: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    match last_err {
        None => Ok((esp_wifi, true)),
        Some(err) => {
            warn!("all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed; last error: {err:#}");
            let _ = wifi.disconnect();
            let _ = wifi.stop();
            start_config_ap(&mut wifi)?;
            Ok((esp_wifi, false))
        }
    }
}

fn start_config_ap(wifi: &mut BlockingWifi<&mut EspWifi<'static>>) -> anyhow::Result<()> {
    wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
        ssid: CONFIG_AP_SSID
            .try_into()
            .map_err(|_| anyhow!("configuration AP SSID too long"))?,
        auth_method: AuthMethod::None,
        channel: 1,
        ..Default::default()
    }))?;
    wifi.start()?;
    wifi.wait_netif_up()?;
    info!("configuration AP started on `{CONFIG_AP_SSID}`");
    Ok(())
}

/// Newlib clock plus the zone rules used for local time.
struct EspSystemClock {
    tz: PosixTz,
}

impl EspSystemClock {
    fn new() -> Self {
        Self { tz: PosixTz::utc() }
    }
}

impl SystemClock for EspSystemClock {
    fn now_utc(&self) -> NaiveDateTime {
        Utc::now().naive_utc()
    }

    fn local_now(&self) -> LocalTime {
        self.tz.to_local(&self.now_utc())
    }

    fn set_utc(&mut self, utc: NaiveDateTime) {
        let tv = esp_idf_svc::sys::timeval {
            tv_sec: utc.and_utc().timestamp() as _,
            tv_usec: 0,
        };
        let rc = unsafe { esp_idf_svc::sys::settimeofday(&tv, core::ptr::null()) };
        if rc != 0 {
            warn!("settimeofday failed with code {rc}");
        }
    }

    fn apply_timezone(&mut self, posix: &str) {
        self.tz = PosixTz::parse(posix).unwrap_or_else(|err| {
            warn!("invalid timezone `{posix}` ({err}); using UTC");
            PosixTz::utc()
        });
        std::env::set_var("TZ", self.tz.source());
        unsafe { esp_idf_svc::sys::tzset() };
        info!("timezone set to {}", self.tz);
    }
}

#[derive(Default)]
struct EspNtp {
    sntp: Option<EspSntp<'static>>,
    first_sync: FirstSyncLatch,
}

impl NtpClient for EspNtp {
    fn start(&mut self, servers: &[&str]) -> Result<(), NtpError> {
        // Only one SNTP instance may exist at a time.
        self.sntp = None;
        self.first_sync = FirstSyncLatch::default();

        let mut conf = SntpConf::default();
        for (slot, server) in conf.servers.iter_mut().zip(servers) {
            *slot = *server;
        }

        let synced = self.first_sync.notifier();
        let sntp = EspSntp::new_with_callback(&conf, move |_| {
            synced.store(true, Ordering::Release);
        })
        .map_err(|err| NtpError::Start(err.to_string()))?;
        self.sntp = Some(sntp);
        Ok(())
    }

    fn stop(&mut self) {
        self.sntp = None;
    }

    fn is_running(&self) -> bool {
        self.sntp.is_some()
    }

    fn take_first_sync(&mut self) -> bool {
        self.sntp.is_some() && self.first_sync.take()
    }
}

/// DS3231 on the default I2C pins.
struct Ds3231Rtc {
    device: Option<Rtc>,
}

impl Ds3231Rtc {
    fn new(device: Option<Rtc>) -> Self {
        Self { device }
    }

    fn device(&mut self) -> Result<&mut Rtc, RtcError> {
        self.device
            .as_mut()
            .ok_or_else(|| RtcError::Bus("I2C bus unavailable".into()))
    }
}

impl HardwareRtc for Ds3231Rtc {
    fn probe(&mut self) -> bool {
        match self.device() {
            Ok(device) => device.has_been_stopped().is_ok(),
            Err(_) => false,
        }
    }

    fn lost_power(&mut self) -> Result<bool, RtcError> {
        self.device()?
            .has_been_stopped()
            .map_err(|err| RtcError::Bus(format!("{err:?}")))
    }

    fn read_utc(&mut self) -> Result<NaiveDateTime, RtcError> {
        self.device()?.datetime().map_err(|err| match err {
            ds323x::Error::InvalidDeviceState => RtcError::InvalidDateTime,
            other => RtcError::Bus(format!("{other:?}")),
        })
    }

    fn write_utc(&mut self, utc: NaiveDateTime) -> Result<(), RtcError> {
        let device = self.device()?;
        device
            .set_datetime(&utc)
            .map_err(|err| RtcError::Bus(format!("{err:?}")))?;
        device
            .clear_has_been_stopped_flag()
            .map_err(|err| RtcError::Bus(format!("{err:?}")))
    }
}

/// One LEDC channel and timer per meter.
struct LedcMeters {
    channels: [LedcDriver<'static>; METER_COUNT],
    duty: [Option<u16>; METER_COUNT],
}

impl LedcMeters {
    fn new(mut channels: [LedcDriver<'static>; METER_COUNT]) -> anyhow::Result<Self> {
        for channel in &mut channels {
            channel.set_duty(0)?;
        }
        Ok(Self {
            channels,
            duty: [None; METER_COUNT],
        })
    }
}

impl MeterOutput for LedcMeters {
    fn set_value(&mut self, meter: Meter, value: i32) {
        let duty = clamp_duty(value);
        let index = meter.index();
        if self.duty[index] == Some(duty) {
            return;
        }
        match self.channels[index].set_duty(u32::from(duty)) {
            Ok(()) => self.duty[index] = Some(duty),
            Err(err) => warn!("failed to set {} meter duty: {err}", meter.as_str()),
        }
    }
}

struct Ws2812Strip {
    driver: Option<LedPixelEsp32Rmt<'static, RGB8, LedPixelColorGrb24>>,
    staged: [Rgb; LED_COUNT],
    brightness: u8,
    shown: Option<[Rgb; LED_COUNT]>,
}

impl Ws2812Strip {
    fn new(driver: Option<LedPixelEsp32Rmt<'static, RGB8, LedPixelColorGrb24>>) -> Self {
        Self {
            driver,
            staged: [Rgb::BLACK; LED_COUNT],
            brightness: 0,
            shown: None,
        }
    }
}

impl LightingOutput for Ws2812Strip {
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
        let frame = self.staged.map(|pixel| pixel.scale(self.brightness));
        if self.shown == Some(frame) {
            return;
        }
        let Some(driver) = self.driver.as_mut() else {
            return;
        };
        let pixels = frame.map(|pixel| RGB8::new(pixel.r, pixel.g, pixel.b));
        match driver.write(pixels) {
            Ok(()) => self.shown = Some(frame),
            Err(err) => warn!("failed to write LED strip: {err:?}"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct EspNetwork;

impl NetworkStatus for EspNetwork {
    fn is_connected(&self) -> bool {
        is_wifi_station_connected()
    }
}

/// Typed NVS slots under the settings namespace.
struct NvsBackend {
    nvs: EspNvs<NvsDefault>,
}

impl NvsBackend {
    fn open(partition: EspDefaultNvsPartition) -> anyhow::Result<Self> {
        let nvs = EspNvs::new(partition, NVS_NAMESPACE, true)
            .with_context(|| format!("failed to open NVS namespace `{NVS_NAMESPACE}`"))?;
        Ok(Self { nvs })
    }
}

fn nvs_error(key: &str, kind: ValueKind, err: esp_idf_svc::sys::EspError) -> StoreError {
    if err.code() == esp_idf_svc::sys::ESP_ERR_NVS_TYPE_MISMATCH as i32 {
        StoreError::TypeMismatch {
            key: key.to_string(),
            expected: kind,
        }
    } else {
        StoreError::Backend {
            key: key.to_string(),
            message: err.to_string(),
        }
    }
}

impl KvBackend for NvsBackend {
    fn get(&self, key: &str, kind: ValueKind) -> Result<Option<StoredValue>, StoreError> {
        let value = match kind {
            ValueKind::Str => {
                let mut buffer = [0_u8; MAX_NVS_STR];
                self.nvs
                    .get_str(key, &mut buffer)
                    .map(|value| value.map(|value| StoredValue::Str(value.to_string())))
            }
            ValueKind::Bool => self
                .nvs
                .get_u8(key)
                .map(|value| value.map(|value| StoredValue::Bool(value != 0))),
            ValueKind::U8 => self.nvs.get_u8(key).map(|value| value.map(StoredValue::U8)),
            ValueKind::U16 => self.nvs.get_u16(key).map(|value| value.map(StoredValue::U16)),
            ValueKind::U32 => self.nvs.get_u32(key).map(|value| value.map(StoredValue::U32)),
            ValueKind::U64 => self.nvs.get_u64(key).map(|value| value.map(StoredValue::U64)),
        };
        value.map_err(|err| nvs_error(key, kind, err))
    }

    fn set(&mut self, key: &str, value: &StoredValue) -> Result<(), StoreError> {
        let result = match value {
            StoredValue::Str(value) => self.nvs.set_str(key, value),
            StoredValue::Bool(value) => self.nvs.set_u8(key, u8::from(*value)),
            StoredValue::U8(value) => self.nvs.set_u8(key, *value),
            StoredValue::U16(value) => self.nvs.set_u16(key, *value),
            StoredValue::U32(value) => self.nvs.set_u32(key, *value),
            StoredValue::U64(value) => self.nvs.set_u64(key, *value),
        };
        result.map_err(|err| nvs_error(key, value.kind(), err))
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

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
