use chrono::{DateTime, Utc};
use rand::{rngs::StdRng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    config::{ControllerConfig, InputPull, LongPressAction, Precedence},
    error::{ConfigError, SensorReadError},
    hal::Gpio,
    indicator::{IndicatorDriver, IndicatorInputs},
    output::{CommandPurpose, OutputAction, OutputController},
    schedule::{RuleStatus, Scheduler},
    solar::SunCalculator,
    switch::SwitchMonitor,
    types::{
        DeviceState, IndicatorPattern, IntentSource, ScheduleIntent, ScheduleState, SwitchEvent,
        SwitchPressState,
    },
};

#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub name: String,
    pub state: DeviceState,
    pub schedule: ScheduleState,
    #[serde(rename = "scheduleName")]
    pub schedule_name: String,
    #[serde(rename = "pressState")]
    pub press_state: SwitchPressState,
    pub indicator: IndicatorPattern,
    #[serde(rename = "inputFault")]
    pub input_fault: bool,
    pub timezone: String,
    #[serde(rename = "nextScheduleEventEpoch")]
    pub next_schedule_event_epoch: Option<i64>,
    pub rules: Vec<RuleStatus>,
}

/// Compact state published to MQTT.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StatePayload {
    pub state: DeviceState,
    pub schedule: ScheduleState,
}

/// Composition of switch, scheduler and output for one lamp.
///
/// Every method takes the current time explicitly; the platform layer owns
/// the loop cadence and executes the returned [`OutputAction`]s.
#[derive(Debug)]
pub struct LampController {
    name: String,
    schedule_name: String,
    input: Option<(u8, InputPull)>,
    notification_pin: Option<u8>,
    switch: SwitchMonitor,
    scheduler: Scheduler,
    output: OutputController,
    indicator: IndicatorDriver,
    long_press_action: Option<LongPressAction>,
    precedence: Precedence,
    turn_off_on_shutdown: bool,
    input_fault: bool,
}

impl LampController {
    pub fn from_config(config: &ControllerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let sun = config.sun_calculator()?;
        Self::build(config, sun, StdRng::from_entropy())
    }

    /// Builds with an injected solar calculator and random source.
    pub fn with_parts(
        config: &ControllerConfig,
        sun: Box<dyn SunCalculator>,
        rng: StdRng,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Self::build(config, sun, rng)
    }

    fn build(
        config: &ControllerConfig,
        sun: Box<dyn SunCalculator>,
        rng: StdRng,
    ) -> Result<Self, ConfigError> {
        let scheduler = Scheduler::with_rng(
            config.schedule_rules()?,
            config.timezone()?,
            sun,
            config.schedule_enabled(),
            rng,
        );
        let schedule_name = config
            .schedule
            .as_ref()
            .and_then(|schedule| schedule.name.clone())
            .unwrap_or_else(|| format!("{} Schedule", config.name));

        Ok(Self {
            name: config.name.clone(),
            schedule_name,
            input: config.input_pin.map(|pin| (pin, config.input_pull)),
            notification_pin: config.notification_pin,
            switch: SwitchMonitor::new(config.debounce_ms, config.long_press_interval_ms),
            scheduler,
            output: OutputController::new(
                config.name.clone(),
                config.output_driver()?,
                config.initial_state,
            ),
            indicator: IndicatorDriver::new(config.slow_blink, config.fast_blink),
            long_press_action: config.long_press_action.clone(),
            precedence: config.switch_precedence,
            turn_off_on_shutdown: config.turn_off_on_shutdown,
            input_fault: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn notification_pin(&self) -> Option<u8> {
        self.notification_pin
    }

    pub fn indicator(&self) -> IndicatorDriver {
        self.indicator
    }

    pub fn initial_actions(&self) -> Vec<OutputAction> {
        self.output.initial_actions()
    }

    /// Raw switch level for this tick, or `None` when no input pin is configured.
    pub fn read_input(&self, gpio: &dyn Gpio) -> Option<Result<bool, SensorReadError>> {
        self.input.map(|(pin, _)| gpio.read_input(pin))
    }

    /// One control step: sample the switch, evaluate the schedule and apply
    /// the resulting intents in precedence order.
    pub fn tick(
        &mut self,
        now_ms: u64,
        now_utc: DateTime<Utc>,
        raw_input: Option<Result<bool, SensorReadError>>,
    ) -> Vec<OutputAction> {
        let switch_event = self.sample_switch(now_ms, raw_input);
        let intents = self.scheduler.tick(now_utc);

        let mut actions = Vec::new();
        match self.precedence {
            Precedence::SwitchFirst => {
                self.handle_switch(switch_event, &mut actions);
                self.handle_schedule(&intents, &mut actions);
            }
            Precedence::ScheduleFirst => {
                self.handle_schedule(&intents, &mut actions);
                self.handle_switch(switch_event, &mut actions);
            }
        }
        actions
    }

    /// Control step while wall-clock time is not yet trustworthy. The switch is
    /// serviced and the schedule is left untouched.
    pub fn tick_without_clock(
        &mut self,
        now_ms: u64,
        raw_input: Option<Result<bool, SensorReadError>>,
    ) -> Vec<OutputAction> {
        let switch_event = self.sample_switch(now_ms, raw_input);
        let mut actions = Vec::new();
        self.handle_switch(switch_event, &mut actions);
        actions
    }

    pub fn device_state(&self) -> DeviceState {
        self.output.current_state()
    }

    pub fn set_device_state(&mut self, state: DeviceState, source: IntentSource) -> Vec<OutputAction> {
        self.output.apply_intent(state, source)
    }

    pub fn schedule_enabled(&self) -> bool {
        self.scheduler.is_enabled()
    }

    pub fn set_schedule_enabled(&mut self, enabled: bool) {
        if self.scheduler.set_enabled(enabled) {
            info!(
                "{}: {}",
                self.schedule_name,
                ScheduleState::from(enabled).as_str()
            );
        }
    }

    pub fn press_state(&self) -> SwitchPressState {
        self.switch.press_state()
    }

    pub fn indicator_inputs(&self) -> IndicatorInputs {
        IndicatorInputs {
            device: self.device_state(),
            schedule_enabled: self.schedule_enabled(),
            press: self.press_state(),
        }
    }

    pub fn indicator_pattern(&self) -> IndicatorPattern {
        IndicatorDriver::select_pattern(self.indicator_inputs())
    }

    /// Final actions before exit. Drives the output off when configured to.
    pub fn shutdown_actions(&mut self) -> Vec<OutputAction> {
        self.switch.reset();
        if !self.turn_off_on_shutdown {
            return Vec::new();
        }
        self.output.apply_intent(DeviceState::Off, IntentSource::Shutdown)
    }

    pub fn status(&self, now_utc: DateTime<Utc>) -> ControllerStatus {
        ControllerStatus {
            name: self.name.clone(),
            state: self.device_state(),
            schedule: ScheduleState::from(self.schedule_enabled()),
            schedule_name: self.schedule_name.clone(),
            press_state: self.press_state(),
            indicator: self.indicator_pattern(),
            input_fault: self.input_fault,
            timezone: self.scheduler.timezone().name().to_string(),
            next_schedule_event_epoch: self.scheduler.next_event_epoch(now_utc),
            rules: self.scheduler.status(),
        }
    }

    pub fn state_payload(&self) -> StatePayload {
        StatePayload {
            state: self.device_state(),
            schedule: ScheduleState::from(self.schedule_enabled()),
        }
    }

    fn sample_switch(
        &mut self,
        now_ms: u64,
        raw_input: Option<Result<bool, SensorReadError>>,
    ) -> Option<SwitchEvent> {
        let (_, pull) = self.input?;
        match raw_input? {
            Ok(high) => {
                if self.input_fault {
                    info!("{}: switch input readable again", self.name);
                    self.input_fault = false;
                }
                self.switch.sample(now_ms, pull.is_active(high))
            }
            Err(err) => {
                if !self.input_fault {
                    warn!("{}: {err}", self.name);
                    self.input_fault = true;
                }
                None
            }
        }
    }

    fn handle_switch(&mut self, event: Option<SwitchEvent>, actions: &mut Vec<OutputAction>) {
        match event {
            None => {}
            Some(SwitchEvent::ToggleRequested) => {
                let target = self.device_state().toggled();
                actions.extend(self.output.apply_intent(target, IntentSource::Switch));
            }
            Some(SwitchEvent::LongPressFired) => match self.long_press_action.clone() {
                Some(LongPressAction::ToggleSchedule) => {
                    let enabled = !self.schedule_enabled();
                    self.set_schedule_enabled(enabled);
                }
                Some(LongPressAction::Command(command)) => {
                    actions.push(OutputAction::RunCommand {
                        command,
                        purpose: CommandPurpose::LongPress,
                    });
                }
                None => debug!("{}: long press with no action configured", self.name),
            },
        }
    }

    fn handle_schedule(&mut self, intents: &[ScheduleIntent], actions: &mut Vec<OutputAction>) {
        for intent in intents {
            actions.extend(self.output.apply_intent(intent.action, IntentSource::Schedule));
        }
    }
}
