use std::{
    collections::HashMap,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use serde::Serialize;
use tokio::{net::TcpListener, sync::Mutex, task::JoinHandle, time::MissedTickBehavior};
use tracing::{info, warn};

use lampctl_common::{
    topic, ActuatorError, Clock, ControllerConfig, ControllerStatus, DeviceState, Gpio,
    IndicatorDriver, IndicatorInputs, IntentSource, LampController, MemoryGpio, MqttConfig,
    OutputAction, PinLevel, ScheduleState, SharedSnapshot, SystemClock, TOPIC_CMD_POWER,
    TOPIC_CMD_SCHEDULE, TOPIC_STATE,
};

use crate::{
    actuator::{ActuatorDiagnostics, CommandRunner},
    sysfs::SysfsGpio,
};

const DEFAULT_CONFIG_PATH: &str = "./lampctl.json";
const DEFAULT_GPIO_ROOT: &str = "/sys/class/gpio";
const DEFAULT_HTTP_PORT: u16 = 8080;
const STATE_PUBLISH_INTERVAL: Duration = Duration::from_secs(10);
const MAX_MQTT_PAYLOAD_BYTES: usize = 512;

#[derive(Clone)]
struct MqttLink {
    client: AsyncClient,
    prefix: String,
}

#[derive(Clone)]
struct AppState {
    controller: Arc<Mutex<LampController>>,
    snapshot: Arc<SharedSnapshot>,
    gpio: Arc<dyn Gpio>,
    runner: Arc<CommandRunner>,
    clock: Arc<dyn Clock>,
    mqtt: Option<MqttLink>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct StatusView {
    #[serde(flatten)]
    controller: ControllerStatus,
    actuators: ActuatorDiagnostics,
    #[serde(rename = "nowEpoch")]
    now_epoch: i64,
}

#[derive(Debug, Serialize)]
struct DeviceStateView {
    state: DeviceState,
}

#[derive(Debug, Serialize)]
struct ScheduleStateView {
    state: ScheduleState,
}

/// Drives the notification pin, writing only when the level changes.
struct IndicatorOutput {
    pin: u8,
    driver: IndicatorDriver,
    last: Option<PinLevel>,
    failing: bool,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let lookup = |key: &str| std::env::var(key).ok();
    let config_path = lookup("LAMPCTL_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let mut config = load_config(&config_path).await?;
    apply_env_overrides(&mut config, lookup);
    let controller = LampController::from_config(&config)
        .with_context(|| format!("invalid configuration in {}", config_path.display()))?;
    info!(
        "{}: loaded {} schedule rule(s), schedule {}",
        config.name,
        config.schedule.as_ref().map_or(0, |schedule| schedule.events.len()),
        ScheduleState::from(controller.schedule_enabled()).as_str()
    );

    let gpio_root = lookup("LAMPCTL_GPIO_ROOT").unwrap_or_else(|| DEFAULT_GPIO_ROOT.to_string());
    let gpio = open_gpio(&config, Path::new(&gpio_root))?;
    let runner = Arc::new(CommandRunner::new(Duration::from_millis(
        config.command_timeout_ms,
    )));

    let (mqtt_link, eventloop) = match config.mqtt.as_ref().map(connect_mqtt) {
        Some((link, eventloop)) => (Some(link), Some(eventloop)),
        None => (None, None),
    };

    let indicator = controller.indicator();
    let notification_pin = controller.notification_pin();
    let state = AppState::new(controller, gpio, runner, Arc::new(SystemClock), mqtt_link);
    state.update(|controller| controller.initial_actions()).await;

    let mut loops = vec![spawn_control_loop(
        state.clone(),
        Duration::from_millis(config.control_tick_ms),
    )];
    if let Some(pin) = notification_pin {
        loops.push(spawn_indicator_loop(
            state.clone(),
            IndicatorOutput::new(pin, indicator),
            Duration::from_millis(config.indicator_tick_ms),
        ));
    }
    if let Some(eventloop) = eventloop {
        loops.push(spawn_mqtt_loop(state.clone(), eventloop));
        loops.push(spawn_state_publish_loop(state.clone()));
    }

    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/state", get(handle_get_state).post(handle_set_state))
        .route(
            "/api/schedule/state",
            get(handle_get_schedule_state).post(handle_set_schedule_state),
        )
        .with_state(state.clone());

    let port = http_port(lookup);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    for handle in loops {
        handle.abort();
    }
    shutdown(&state, notification_pin, Duration::from_millis(config.command_timeout_ms)).await;
    Ok(())
}

async fn load_config(path: &Path) -> anyhow::Result<ControllerConfig> {
    let raw = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read config {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("failed to parse config {}", path.display()))
}

fn apply_env_overrides(config: &mut ControllerConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(host) = lookup("MQTT_HOST").filter(|host| !host.trim().is_empty()) {
        match config.mqtt.as_mut() {
            Some(mqtt) => mqtt.host = host,
            None => config.mqtt = Some(MqttConfig::new(host)),
        }
    }

    let Some(mqtt) = config.mqtt.as_mut() else {
        return;
    };
    if let Some(port) = lookup("MQTT_PORT").and_then(|value| value.parse::<u16>().ok()) {
        mqtt.port = port;
    }
    if let Some(user) = lookup("MQTT_USER").filter(|user| !user.is_empty()) {
        mqtt.user = Some(user);
    }
    if let Some(pass) = lookup("MQTT_PASS") {
        mqtt.pass = Some(pass);
    }
}

fn http_port(lookup: impl Fn(&str) -> Option<String>) -> u16 {
    lookup("LAMPCTL_HTTP_PORT")
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(DEFAULT_HTTP_PORT)
}

fn open_gpio(config: &ControllerConfig, root: &Path) -> anyhow::Result<Arc<dyn Gpio>> {
    if !root.exists() {
        warn!("{} not found; pins are simulated in memory", root.display());
        return Ok(Arc::new(MemoryGpio::new()));
    }

    let gpio = SysfsGpio::new(root);
    for pin in [config.output_pin, config.notification_pin].into_iter().flatten() {
        gpio.setup_output(pin)?;
    }
    if let Some(pin) = config.input_pin {
        gpio.setup_input(pin)?;
    }
    info!("using sysfs gpio at {}", gpio.root().display());
    Ok(Arc::new(gpio))
}

fn connect_mqtt(mqtt: &MqttConfig) -> (MqttLink, EventLoop) {
    let client_id = mqtt
        .client_id
        .clone()
        .unwrap_or_else(|| "lampctl-controller".to_string());
    let mut options = MqttOptions::new(client_id, mqtt.host.clone(), mqtt.port);
    options.set_keep_alive(Duration::from_secs(30));
    if let Some(user) = &mqtt.user {
        options.set_credentials(user.clone(), mqtt.pass.clone().unwrap_or_default());
    }

    let (client, eventloop) = AsyncClient::new(options, 64);
    (
        MqttLink {
            client,
            prefix: mqtt.topic_prefix.clone(),
        },
        eventloop,
    )
}

impl AppState {
    fn new(
        controller: LampController,
        gpio: Arc<dyn Gpio>,
        runner: Arc<CommandRunner>,
        clock: Arc<dyn Clock>,
        mqtt: Option<MqttLink>,
    ) -> Self {
        let snapshot = Arc::new(SharedSnapshot::new(controller.indicator_inputs()));
        Self {
            controller: Arc::new(Mutex::new(controller)),
            snapshot,
            gpio,
            runner,
            clock,
            mqtt,
        }
    }

    /// Runs `f` under the controller lock, republishes the indicator snapshot
    /// and executes the resulting actions before releasing the lock.
    async fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut LampController) -> Vec<OutputAction>,
    {
        let mut controller = self.controller.lock().await;
        let actions = f(&mut *controller);
        self.snapshot.store(controller.indicator_inputs());
        self.execute_actions(actions).await;
    }

    async fn execute_actions(&self, actions: Vec<OutputAction>) {
        for action in actions {
            match action {
                OutputAction::SetPin { pin, high } => {
                    let result = self
                        .gpio
                        .write_output(pin, high)
                        .map_err(ActuatorError::from);
                    if let Err(err) = &result {
                        warn!("output write failed: {err}");
                    }
                    self.runner.record("output pin", &result).await;
                }
                OutputAction::PulsePin { pin, low_ms } => {
                    self.runner.pulse(self.gpio.clone(), pin, low_ms).await;
                }
                OutputAction::RunCommand { command, purpose } => {
                    self.runner.run(command, purpose).await;
                }
            }
        }
    }

    async fn control_step(&self) {
        let now_ms = self.clock.now_ms();
        let now_utc = self.clock.now_utc();
        self.update(|controller| {
            let raw_input = controller.read_input(self.gpio.as_ref());
            controller.tick(now_ms, now_utc, raw_input)
        })
        .await;
    }

    async fn status(&self) -> StatusView {
        let now_utc = self.clock.now_utc();
        let controller = self.controller.lock().await.status(now_utc);
        StatusView {
            controller,
            actuators: self.runner.diagnostics().await,
            now_epoch: now_utc.timestamp(),
        }
    }

    async fn publish_state(&self) {
        let Some(mqtt) = &self.mqtt else {
            return;
        };
        let payload = serde_json::to_vec(&self.controller.lock().await.state_payload());
        match payload {
            Ok(body) => {
                if let Err(err) = mqtt
                    .client
                    .publish(topic(&mqtt.prefix, TOPIC_STATE), QoS::AtLeastOnce, true, body)
                    .await
                {
                    warn!("state publish failed: {err}");
                }
            }
            Err(err) => warn!("state serialization failed: {err}"),
        }
    }
}

impl IndicatorOutput {
    fn new(pin: u8, driver: IndicatorDriver) -> Self {
        Self {
            pin,
            driver,
            last: None,
            failing: false,
        }
    }

    /// Returns the level written, if any.
    fn refresh(&mut self, gpio: &dyn Gpio, now_ms: u64, inputs: IndicatorInputs) -> Option<PinLevel> {
        let level = self.driver.render(now_ms, inputs);
        if self.last == Some(level) {
            return None;
        }
        match gpio.write_output(self.pin, level.is_high()) {
            Ok(()) => {
                self.last = Some(level);
                self.failing = false;
                Some(level)
            }
            Err(err) => {
                if !self.failing {
                    warn!("indicator write failed: {err}");
                    self.failing = true;
                }
                None
            }
        }
    }
}

fn spawn_control_loop(state: AppState, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            state.control_step().await;
        }
    })
}

fn spawn_indicator_loop(
    state: AppState,
    mut output: IndicatorOutput,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            output.refresh(state.gpio.as_ref(), state.clock.now_ms(), state.snapshot.load());
        }
    })
}

fn spawn_mqtt_loop(state: AppState, mut eventloop: EventLoop) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    handle_mqtt_message(&state, &message.topic, &message.payload).await;
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    if let Err(err) = subscribe_topics(&state).await {
                        warn!("mqtt subscribe failed: {err:#}");
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    })
}

fn spawn_state_publish_loop(state: AppState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATE_PUBLISH_INTERVAL);
        loop {
            interval.tick().await;
            state.publish_state().await;
        }
    })
}

async fn subscribe_topics(state: &AppState) -> anyhow::Result<()> {
    let Some(mqtt) = &state.mqtt else {
        return Ok(());
    };
    for suffix in [TOPIC_CMD_POWER, TOPIC_CMD_SCHEDULE] {
        mqtt.client
            .subscribe(topic(&mqtt.prefix, suffix), QoS::AtMostOnce)
            .await?;
    }
    Ok(())
}

async fn handle_mqtt_message(state: &AppState, message_topic: &str, payload: &[u8]) {
    let Some(mqtt) = &state.mqtt else {
        return;
    };
    if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
        warn!(
            "dropping oversized MQTT payload on topic {message_topic} ({} bytes)",
            payload.len()
        );
        return;
    }
    let Ok(message) = std::str::from_utf8(payload) else {
        warn!("dropping non utf8 MQTT payload on topic {message_topic}");
        return;
    };

    if message_topic == topic(&mqtt.prefix, TOPIC_CMD_POWER) {
        match DeviceState::parse_command(message) {
            Some(target) => {
                state
                    .update(|controller| controller.set_device_state(target, IntentSource::Host))
                    .await;
            }
            None => warn!("ignoring power command `{message}`"),
        }
    } else if message_topic == topic(&mqtt.prefix, TOPIC_CMD_SCHEDULE) {
        match ScheduleState::parse_command(message) {
            Some(schedule) => {
                state
                    .update(|controller| {
                        controller.set_schedule_enabled(schedule.is_enabled());
                        Vec::new()
                    })
                    .await;
            }
            None => warn!("ignoring schedule command `{message}`"),
        }
    } else {
        return;
    }
    state.publish_state().await;
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.status().await)
}

async fn handle_get_state(State(state): State<AppState>) -> impl IntoResponse {
    let device = state.controller.lock().await.device_state();
    Json(DeviceStateView { state: device })
}

async fn handle_set_state(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let Some(target) = DeviceState::parse_command(value) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid state. Use 'on' or 'off'");
    };

    state
        .update(|controller| controller.set_device_state(target, IntentSource::Host))
        .await;
    state.publish_state().await;
    handle_get_state(State(state)).await.into_response()
}

async fn handle_get_schedule_state(State(state): State<AppState>) -> impl IntoResponse {
    let enabled = state.controller.lock().await.schedule_enabled();
    Json(ScheduleStateView {
        state: ScheduleState::from(enabled),
    })
}

async fn handle_set_schedule_state(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let Some(schedule) = ScheduleState::parse_command(value) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Invalid schedule state. Use 'enabled' or 'disabled'",
        );
    };

    state
        .update(|controller| {
            controller.set_schedule_enabled(schedule.is_enabled());
            Vec::new()
        })
        .await;
    state.publish_state().await;
    handle_get_schedule_state(State(state)).await.into_response()
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

async fn shutdown(state: &AppState, notification_pin: Option<u8>, grace: Duration) {
    state.update(|controller| controller.shutdown_actions()).await;
    if let Some(pin) = notification_pin {
        if let Err(err) = state.gpio.write_output(pin, false) {
            warn!("failed to clear indicator: {err}");
        }
    }
    let abandoned = state.runner.shutdown(grace).await;
    if abandoned > 0 {
        warn!("{abandoned} actuator task(s) abandoned at shutdown");
    }
    if let Some(mqtt) = &state.mqtt {
        if let Err(err) = mqtt.client.disconnect().await {
            warn!("mqtt disconnect failed: {err}");
        }
    }
    info!("controller stopped");
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

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use chrono::{DateTime, TimeZone, Utc};
    use lampctl_common::{BlinkPattern, ScheduleConfig, ScheduleEventConfig, SwitchPressState};

    use super::*;

    struct ManualClock {
        ms: AtomicU64,
        utc: DateTime<Utc>,
    }

    impl Clock for ManualClock {
        fn now_ms(&self) -> u64 {
            self.ms.load(Ordering::Acquire)
        }

        fn now_utc(&self) -> DateTime<Utc> {
            self.utc
        }
    }

    fn config() -> ControllerConfig {
        ControllerConfig {
            name: "Desk Lamp".to_string(),
            output_pin: Some(5),
            input_pin: Some(13),
            notification_pin: Some(11),
            ..ControllerConfig::default()
        }
    }

    fn app(config: &ControllerConfig) -> (AppState, Arc<MemoryGpio>, Arc<ManualClock>) {
        let gpio = Arc::new(MemoryGpio::new());
        let clock = Arc::new(ManualClock {
            ms: AtomicU64::new(0),
            utc: Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap(),
        });
        let controller = LampController::from_config(config).unwrap();
        let state = AppState::new(
            controller,
            gpio.clone(),
            Arc::new(CommandRunner::new(Duration::from_secs(1))),
            clock.clone(),
            None,
        );
        (state, gpio, clock)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn query(value: &str) -> Query<HashMap<String, String>> {
        Query(HashMap::from([("value".to_string(), value.to_string())]))
    }

    #[tokio::test]
    async fn loads_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lampctl.json");
        tokio::fs::write(&path, r#"{"name": "Porch", "output_pin": 4}"#)
            .await
            .unwrap();

        let config = load_config(&path).await.unwrap();
        assert_eq!(config.name, "Porch");
        assert_eq!(config.output_pin, Some(4));

        tokio::fs::write(&path, "{not json").await.unwrap();
        let err = load_config(&path).await.unwrap_err();
        assert!(format!("{err:#}").contains("failed to parse config"));
    }

    #[test]
    fn env_overrides_create_mqtt_section() {
        let mut config = config();
        let env = HashMap::from([
            ("MQTT_HOST", "broker.local"),
            ("MQTT_PORT", "1884"),
            ("MQTT_USER", "lamp"),
            ("LAMPCTL_HTTP_PORT", "9090"),
        ]);
        let lookup = |key: &str| env.get(key).map(|value| value.to_string());

        apply_env_overrides(&mut config, lookup);

        let mqtt = config.mqtt.unwrap();
        assert_eq!(mqtt.host, "broker.local");
        assert_eq!(mqtt.port, 1884);
        assert_eq!(mqtt.user.as_deref(), Some("lamp"));
        assert_eq!(mqtt.topic_prefix, "lampctl");
        assert_eq!(http_port(lookup), 9090);
        assert_eq!(http_port(|_| None), DEFAULT_HTTP_PORT);
    }

    #[tokio::test]
    async fn set_state_drives_output_pin() {
        let (state, gpio, _) = app(&config());

        let response = handle_set_state(State(state.clone()), query("on"))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["state"], "ON");
        assert!(gpio.output(5));

        let response = handle_set_state(State(state), query("dim"))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(gpio.output(5));
    }

    #[tokio::test]
    async fn schedule_state_round_trip() {
        let (state, _, _) = app(&config());

        let response = handle_set_schedule_state(State(state.clone()), query("enabled"))
            .await
            .into_response();
        assert_eq!(body_json(response).await["state"], "ENABLED");
        assert!(state.snapshot.load().schedule_enabled);

        let response = handle_set_schedule_state(
            State(state.clone()),
            Query(HashMap::new()),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn control_step_samples_switch_and_publishes_snapshot() {
        let (state, gpio, clock) = app(&config());
        gpio.set_input(13, true);

        for ms in (0..=100).step_by(20) {
            clock.ms.store(ms, Ordering::Release);
            state.control_step().await;
        }
        assert_eq!(state.snapshot.load().press, SwitchPressState::PressedShort);

        gpio.set_input(13, false);
        clock.ms.store(120, Ordering::Release);
        state.control_step().await;

        assert!(gpio.output(5));
        assert_eq!(state.snapshot.load().device, DeviceState::On);
    }

    #[tokio::test]
    async fn status_includes_actuator_diagnostics() {
        let mut config = config();
        config.schedule = Some(ScheduleConfig {
            events: vec![ScheduleEventConfig {
                trigger: "18:05".to_string(),
                random: 0,
                value: true,
            }],
            ..ScheduleConfig::default()
        });
        let (state, _, _) = app(&config);
        state.control_step().await;

        let body = body_json(handle_get_status(State(state)).await.into_response()).await;
        assert_eq!(body["name"], "Desk Lamp");
        assert_eq!(body["schedule"], "ENABLED");
        assert_eq!(body["actuators"]["failed"], 0);
        assert_eq!(body["rules"][0]["trigger"], "18:05:00");
        assert_eq!(
            body["nowEpoch"],
            Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap().timestamp()
        );
    }

    #[test]
    fn indicator_writes_only_on_level_change() {
        let gpio = MemoryGpio::new();
        let mut output = IndicatorOutput::new(
            11,
            IndicatorDriver::new(BlinkPattern::new(50, 1_500), BlinkPattern::new(40, 80)),
        );
        let scheduled = IndicatorInputs {
            device: DeviceState::Off,
            schedule_enabled: true,
            press: SwitchPressState::Released,
        };

        assert_eq!(output.refresh(&gpio, 0, scheduled), Some(PinLevel::High));
        assert_eq!(output.refresh(&gpio, 10, scheduled), None);
        assert_eq!(output.refresh(&gpio, 60, scheduled), Some(PinLevel::Low));
        assert_eq!(output.refresh(&gpio, 1_000, scheduled), None);
        assert_eq!(gpio.write_count(), 2);
        assert!(!gpio.output(11));
    }

    #[tokio::test]
    async fn shutdown_turns_lamp_off() {
        let (state, gpio, _) = app(&config());
        state
            .update(|controller| controller.set_device_state(DeviceState::On, IntentSource::Host))
            .await;
        gpio.write_output(11, true).unwrap();

        shutdown(&state, Some(11), Duration::from_millis(100)).await;

        assert!(!gpio.output(5));
        assert!(!gpio.output(11));
        assert_eq!(state.controller.lock().await.device_state(), DeviceState::Off);
    }
}
