use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread,
    time::Duration,
};

use anyhow::{anyhow, bail, Context};
use chrono::{DateTime, Datelike, Utc};
use embedded_svc::{
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    gpio::{AnyIOPin, AnyOutputPin, Input, Output, PinDriver, Pull},
    modem::Modem,
    prelude::Peripherals,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    sntp::EspSntp,
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use serde::Deserialize;

use lampctl_common::{
    topic, ActuatorError, Clock, ControllerConfig, DeviceState, Gpio, GpioError, InputPull,
    IntentSource, LampController, LongPressAction, MqttConfig, OutputAction, ScheduleState,
    SensorReadError, SharedSnapshot, SystemClock, TOPIC_CMD_POWER, TOPIC_CMD_SCHEDULE,
    TOPIC_STATE,
};

const NVS_NAMESPACE: &str = "lampctl";
const NVS_CONFIG_KEY: &str = "config_json";
const NVS_WIFI_KEY: &str = "wifi_json";
const MAX_MQTT_PAYLOAD_BYTES: usize = 512;
const STATE_PUBLISH_INTERVAL_MS: u64 = 10_000;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const DEFAULT_RELAY_PIN: u8 = 4;
const DEFAULT_SWITCH_PIN: u8 = 0;
const DEFAULT_STATUS_LED_PIN: u8 = 48;
/// Earliest year a synced clock can report; anything before means SNTP has not run yet.
const MIN_VALID_YEAR: i32 = 2024;

#[derive(Debug, Deserialize)]
struct WifiCredentials {
    ssid: String,
    #[serde(default)]
    pass: String,
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

/// On-chip GPIO. Pins are claimed once at startup.
struct EspGpio {
    outputs: Mutex<HashMap<u8, PinDriver<'static, AnyOutputPin, Output>>>,
    inputs: Mutex<HashMap<u8, PinDriver<'static, AnyIOPin, Input>>>,
}

#[derive(Clone)]
struct SharedState {
    controller: Arc<Mutex<LampController>>,
    snapshot: Arc<SharedSnapshot>,
    gpio: Arc<EspGpio>,
    mqtt: Option<Arc<Mutex<EspMqttClient<'static>>>>,
    prefix: String,
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

    let config = nvs_store.load_config().unwrap_or_else(|err| {
        warn!("failed to load config from NVS, using board defaults: {err:#}");
        default_board_config()
    });
    ensure_supported(&config)?;
    let controller = LampController::from_config(&config).context("invalid configuration")?;

    let gpio = Arc::new(EspGpio::new());
    for pin in [config.output_pin, config.notification_pin].into_iter().flatten() {
        gpio.claim_output(pin)?;
    }
    if let Some(pin) = config.input_pin {
        gpio.claim_input(pin, config.input_pull)?;
    }

    let Peripherals { modem, .. } = Peripherals::take()?;
    let credentials = nvs_store.load_wifi().unwrap_or_else(|err| {
        warn!("failed to load wifi credentials from NVS: {err:#}");
        None
    });
    let wifi = match credentials {
        Some(credentials) => connect_wifi(modem, sys_loop, nvs_partition, &credentials)
            .unwrap_or_else(|err| {
                warn!("wifi unavailable, running offline: {err:#}");
                None
            }),
        None => {
            warn!("no wifi credentials stored; schedule waits for a valid clock");
            None
        }
    };

    let _sntp = if wifi.is_some() {
        Some(EspSntp::new_default().context("failed to start SNTP")?)
    } else {
        None
    };

    let mqtt = match (&wifi, &config.mqtt) {
        (Some(_), Some(mqtt)) => Some(create_mqtt_client(mqtt)?),
        _ => None,
    };
    let (mqtt_client, mqtt_conn) = match mqtt {
        Some((client, conn)) => (Some(Arc::new(Mutex::new(client))), Some(conn)),
        None => (None, None),
    };

    let state = SharedState {
        snapshot: Arc::new(SharedSnapshot::new(controller.indicator_inputs())),
        controller: Arc::new(Mutex::new(controller)),
        gpio,
        mqtt: mqtt_client,
        prefix: config
            .mqtt
            .as_ref()
            .map_or_else(|| "lampctl".to_string(), |mqtt| mqtt.topic_prefix.clone()),
    };
    state.update(|controller| controller.initial_actions());

    if let Some(conn) = mqtt_conn {
        spawn_mqtt_receiver(state.clone(), conn)?;
    }
    spawn_control_loop(state.clone(), Duration::from_millis(config.control_tick_ms))?;
    spawn_indicator_loop(state, Duration::from_millis(config.indicator_tick_ms))?;

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn default_board_config() -> ControllerConfig {
    ControllerConfig {
        output_pin: Some(DEFAULT_RELAY_PIN),
        input_pin: Some(DEFAULT_SWITCH_PIN),
        input_pull: InputPull::Up,
        notification_pin: Some(DEFAULT_STATUS_LED_PIN),
        long_press_interval_ms: Some(3_000),
        long_press_action: Some(LongPressAction::ToggleSchedule),
        ..ControllerConfig::default()
    }
}

fn ensure_supported(config: &ControllerConfig) -> anyhow::Result<()> {
    if config.output_commands.is_some() {
        bail!(ActuatorError::Unsupported);
    }
    if matches!(config.long_press_action, Some(LongPressAction::Command(_))) {
        bail!("long press command: {}", ActuatorError::Unsupported);
    }
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn clock_is_valid(now: DateTime<Utc>) -> bool {
    now.year() >= MIN_VALID_YEAR
}

impl SharedState {
    fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut LampController) -> Vec<OutputAction>,
    {
        let mut controller = lock(&self.controller);
        let actions = f(&mut *controller);
        self.snapshot.store(controller.indicator_inputs());
        self.execute_actions(actions);
    }

    fn execute_actions(&self, actions: Vec<OutputAction>) {
        for action in actions {
            match action {
                OutputAction::SetPin { pin, high } => {
                    if let Err(err) = self.gpio.write_output(pin, high) {
                        warn!("output write failed: {err}");
                    }
                }
                OutputAction::PulsePin { pin, low_ms } => self.pulse(pin, low_ms),
                OutputAction::RunCommand { purpose, .. } => {
                    warn!("{} command skipped: {}", purpose.as_str(), ActuatorError::Unsupported);
                }
            }
        }
    }

    fn pulse(&self, pin: u8, low_ms: u64) {
        let gpio = self.gpio.clone();
        let spawned = thread::Builder::new()
            .name("relay-pulse".into())
            .stack_size(4 * 1024)
            .spawn(move || {
                if let Err(err) = gpio.write_output(pin, false) {
                    warn!("relay pulse on pin {pin} failed: {err}");
                    return;
                }
                thread::sleep(Duration::from_millis(low_ms));
                if let Err(err) = gpio.write_output(pin, true) {
                    warn!("relay pulse release on pin {pin} failed: {err}");
                }
            });
        if let Err(err) = spawned {
            warn!("failed to spawn relay pulse thread: {err}");
        }
    }

    fn publish_state(&self) -> anyhow::Result<()> {
        let Some(mqtt) = &self.mqtt else {
            return Ok(());
        };
        let payload = serde_json::to_vec(&lock(&self.controller).state_payload())?;
        lock(mqtt).publish(&topic(&self.prefix, TOPIC_STATE), QoS::AtLeastOnce, true, &payload)?;
        Ok(())
    }
}

impl EspGpio {
    fn new() -> Self {
        Self {
            outputs: Mutex::new(HashMap::new()),
            inputs: Mutex::new(HashMap::new()),
        }
    }

    fn claim_output(&self, pin: u8) -> anyhow::Result<()> {
        let driver = unsafe { PinDriver::output(AnyOutputPin::new(i32::from(pin))) }
            .with_context(|| format!("failed to claim GPIO{pin} as output"))?;
        lock(&self.outputs).insert(pin, driver);
        Ok(())
    }

    fn claim_input(&self, pin: u8, pull: InputPull) -> anyhow::Result<()> {
        let mut driver = unsafe { PinDriver::input(AnyIOPin::new(i32::from(pin))) }
            .with_context(|| format!("failed to claim GPIO{pin} as input"))?;
        driver
            .set_pull(match pull {
                InputPull::Down => Pull::Down,
                InputPull::Up => Pull::Up,
            })
            .with_context(|| format!("failed to set pull on GPIO{pin}"))?;
        lock(&self.inputs).insert(pin, driver);
        Ok(())
    }
}

impl Gpio for EspGpio {
    fn read_input(&self, pin: u8) -> Result<bool, SensorReadError> {
        lock(&self.inputs)
            .get(&pin)
            .map(|driver| driver.is_high())
            .ok_or_else(|| SensorReadError {
                pin,
                reason: "pin not claimed as input".to_string(),
            })
    }

    fn write_output(&self, pin: u8, high: bool) -> Result<(), GpioError> {
        let mut outputs = lock(&self.outputs);
        let driver = outputs.get_mut(&pin).ok_or_else(|| GpioError {
            pin,
            reason: "pin not claimed as output".to_string(),
        })?;
        let result = if high { driver.set_high() } else { driver.set_low() };
        result.map_err(|err| GpioError {
            pin,
            reason: err.to_string(),
        })
    }
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    credentials: &WifiCredentials,
) -> anyhow::Result<Option<EspWifi<'static>>> {
    if credentials.ssid.trim().is_empty() {
        return Ok(None);
    }

    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let auth_method = if credentials.pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };
    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: credentials
            .ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: credentials
            .pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", credentials.ssid);

    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected on attempt {attempt}");
                drop(wifi);
                return Ok(Some(esp_wifi));
            }
            Err(err) => warn!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS} failed: {err:#}"),
        }
        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    let _ = wifi.stop();
    Err(anyhow!("all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed"))
}

fn create_mqtt_client(
    mqtt: &MqttConfig,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let url = format!("mqtt://{}:{}", mqtt.host, mqtt.port);
    let conf = MqttClientConfiguration {
        client_id: Some(mqtt.client_id.as_deref().unwrap_or("lampctl-controller")),
        username: mqtt.user.as_deref(),
        password: mqtt.pass.as_deref(),
        ..Default::default()
    };
    Ok(EspMqttClient::new(url.as_str(), &conf)?)
}

fn subscribe_topics(state: &SharedState) -> anyhow::Result<()> {
    let Some(mqtt) = &state.mqtt else {
        return Ok(());
    };
    let mut client = lock(mqtt);
    for suffix in [TOPIC_CMD_POWER, TOPIC_CMD_SCHEDULE] {
        client.subscribe(&topic(&state.prefix, suffix), QoS::AtMostOnce)?;
    }
    Ok(())
}

fn spawn_mqtt_receiver(state: SharedState, mut conn: EspMqttConnection) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(8 * 1024)
        .spawn(move || loop {
            match conn.next() {
                Ok(event) => match event.payload() {
                    EventPayload::Connected(_) => {
                        info!("mqtt connected");
                        if let Err(err) = subscribe_topics(&state) {
                            warn!("mqtt subscribe failed: {err:#}");
                        }
                    }
                    EventPayload::Received {
                        topic: Some(message_topic),
                        data,
                        details: Details::Complete,
                        ..
                    } => {
                        if data.len() > MAX_MQTT_PAYLOAD_BYTES {
                            warn!(
                                "dropping oversized MQTT payload on topic {message_topic} ({} bytes)",
                                data.len()
                            );
                            continue;
                        }
                        match core::str::from_utf8(data) {
                            Ok(message) => handle_mqtt_message(&state, message_topic, message),
                            Err(_) => {
                                warn!("dropping non utf8 MQTT payload on topic {message_topic}");
                            }
                        }
                    }
                    _ => {}
                },
                Err(err) => {
                    warn!("mqtt receive loop error: {err:?}");
                    thread::sleep(Duration::from_secs(2));
                }
            }
        })
        .context("failed to spawn mqtt receiver thread")?;
    Ok(())
}

fn handle_mqtt_message(state: &SharedState, message_topic: &str, message: &str) {
    if message_topic == topic(&state.prefix, TOPIC_CMD_POWER) {
        let Some(target) = DeviceState::parse_command(message) else {
            warn!("ignoring power command `{message}`");
            return;
        };
        state.update(|controller| controller.set_device_state(target, IntentSource::Host));
    } else if message_topic == topic(&state.prefix, TOPIC_CMD_SCHEDULE) {
        let Some(schedule) = ScheduleState::parse_command(message) else {
            warn!("ignoring schedule command `{message}`");
            return;
        };
        state.update(|controller| {
            controller.set_schedule_enabled(schedule.is_enabled());
            Vec::new()
        });
    } else {
        return;
    }
    if let Err(err) = state.publish_state() {
        warn!("state publish failed: {err:#}");
    }
}

fn spawn_control_loop(state: SharedState, period: Duration) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("control-loop".into())
        .stack_size(12 * 1024)
        .spawn(move || {
            let clock = SystemClock;
            let mut clock_synced = false;
            let mut last_state_publish_ms = 0_u64;

            loop {
                let now_ms = clock.now_ms();
                let now_utc = clock.now_utc();
                if !clock_synced && clock_is_valid(now_utc) {
                    info!("wall clock synced: {now_utc}");
                    clock_synced = true;
                }

                state.update(|controller| {
                    let raw_input = controller.read_input(state.gpio.as_ref());
                    if clock_synced {
                        controller.tick(now_ms, now_utc, raw_input)
                    } else {
                        controller.tick_without_clock(now_ms, raw_input)
                    }
                });

                if now_ms.saturating_sub(last_state_publish_ms) >= STATE_PUBLISH_INTERVAL_MS {
                    last_state_publish_ms = now_ms;
                    if let Err(err) = state.publish_state() {
                        warn!("state publish failed: {err:#}");
                    }
                }

                thread::sleep(period);
            }
        })
        .context("failed to spawn control loop thread")?;
    Ok(())
}

fn spawn_indicator_loop(state: SharedState, period: Duration) -> anyhow::Result<()> {
    let (driver, pin) = {
        let controller = lock(&state.controller);
        (controller.indicator(), controller.notification_pin())
    };
    let Some(pin) = pin else {
        return Ok(());
    };

    thread::Builder::new()
        .name("indicator".into())
        .stack_size(4 * 1024)
        .spawn(move || {
            let clock = SystemClock;
            let mut lit = None;
            loop {
                let level = driver.render(clock.now_ms(), state.snapshot.load());
                if lit != Some(level) {
                    match state.gpio.write_output(pin, level.is_high()) {
                        Ok(()) => lit = Some(level),
                        Err(err) => warn!("failed to drive indicator: {err}"),
                    }
                }
                thread::sleep(period);
            }
        })
        .context("failed to spawn indicator thread")?;
    Ok(())
}

impl NvsStore {
    fn load_str(&self, key: &str) -> anyhow::Result<Option<String>> {
        let _guard = lock(&self.lock);
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 4096];
        Ok(nvs.get_str(key, &mut buffer)?.map(str::to_string))
    }

    fn load_config(&self) -> anyhow::Result<ControllerConfig> {
        let raw = self
            .load_str(NVS_CONFIG_KEY)?
            .ok_or_else(|| anyhow!("no `{NVS_CONFIG_KEY}` entry"))?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn load_wifi(&self) -> anyhow::Result<Option<WifiCredentials>> {
        match self.load_str(NVS_WIFI_KEY)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}
