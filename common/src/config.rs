use std::collections::HashSet;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::{
    error::ConfigError,
    indicator::BlinkPattern,
    output::OutputDriver,
    schedule::ScheduleRule,
    solar::{AstronomicalSun, NoSun, SunCalculator},
    types::DeviceState,
};

pub const MAX_PIN: u8 = 63;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    #[default]
    Level,
    Pulse,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputPull {
    /// Pulled down, switch drives the pin high.
    #[default]
    Down,
    /// Pulled up, switch drives the pin low.
    Up,
}

impl InputPull {
    pub fn is_active(self, high: bool) -> bool {
        match self {
            Self::Down => high,
            Self::Up => !high,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LongPressAction {
    #[serde(alias = "toggle_paired_device")]
    ToggleSchedule,
    Command(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precedence {
    #[default]
    SwitchFirst,
    ScheduleFirst,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEventConfig {
    pub trigger: String,
    /// Randomisation window in minutes.
    #[serde(default)]
    pub random: u32,
    pub value: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub events: Vec<ScheduleEventConfig>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            name: None,
            enabled: true,
            timezone: default_timezone(),
            latitude: None,
            longitude: None,
            events: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub pass: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
}

impl MqttConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_mqtt_port(),
            user: None,
            pass: None,
            client_id: None,
            topic_prefix: default_topic_prefix(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub name: String,
    pub initial_state: DeviceState,
    pub output_pin: Option<u8>,
    /// `[on, off]` shell commands, used instead of `output_pin`.
    pub output_commands: Option<Vec<String>>,
    pub output_mode: OutputMode,
    pub pulse_ms: u64,
    pub input_pin: Option<u8>,
    pub input_pull: InputPull,
    pub notification_pin: Option<u8>,
    pub debounce_ms: u64,
    pub long_press_interval_ms: Option<u64>,
    pub long_press_action: Option<LongPressAction>,
    pub switch_precedence: Precedence,
    pub control_tick_ms: u64,
    pub indicator_tick_ms: u64,
    pub slow_blink: BlinkPattern,
    pub fast_blink: BlinkPattern,
    pub command_timeout_ms: u64,
    pub turn_off_on_shutdown: bool,
    pub schedule: Option<ScheduleConfig>,
    pub mqtt: Option<MqttConfig>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            name: "Lamp".to_string(),
            initial_state: DeviceState::Off,
            output_pin: None,
            output_commands: None,
            output_mode: OutputMode::Level,
            pulse_ms: 100,
            input_pin: None,
            input_pull: InputPull::Down,
            notification_pin: None,
            debounce_ms: 50,
            long_press_interval_ms: None,
            long_press_action: None,
            switch_precedence: Precedence::SwitchFirst,
            control_tick_ms: 20,
            indicator_tick_ms: 10,
            slow_blink: BlinkPattern::new(50, 1_500),
            fast_blink: BlinkPattern::new(40, 80),
            command_timeout_ms: 10_000,
            turn_off_on_shutdown: true,
            schedule: None,
            mqtt: None,
        }
    }
}

impl ControllerConfig {
    /// Checks every constraint that the components rely on. Call before
    /// building anything from this configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.output_driver()?;

        if let Some(interval) = self.long_press_interval_ms {
            if self.long_press_action.is_none() {
                return Err(ConfigError::MissingLongPressAction);
            }
            if interval <= self.debounce_ms {
                return Err(ConfigError::LongPressTooShort {
                    debounce_ms: self.debounce_ms,
                });
            }
        }

        let mut seen = HashSet::new();
        for pin in [self.output_pin, self.input_pin, self.notification_pin]
            .into_iter()
            .flatten()
        {
            if pin > MAX_PIN {
                return Err(ConfigError::PinOutOfRange(pin));
            }
            if !seen.insert(pin) {
                return Err(ConfigError::DuplicatePin(pin));
            }
        }

        let durations = [
            ("control_tick_ms", self.control_tick_ms),
            ("indicator_tick_ms", self.indicator_tick_ms),
            ("slow_blink.on_ms", self.slow_blink.on_ms),
            ("slow_blink.off_ms", self.slow_blink.off_ms),
            ("fast_blink.on_ms", self.fast_blink.on_ms),
            ("fast_blink.off_ms", self.fast_blink.off_ms),
            ("command_timeout_ms", self.command_timeout_ms),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::ZeroDuration(*name));
        }
        if self.output_mode == OutputMode::Pulse && self.pulse_ms == 0 {
            return Err(ConfigError::ZeroDuration("pulse_ms"));
        }

        self.timezone()?;
        self.sun_calculator()?;
        Ok(())
    }

    pub fn output_driver(&self) -> Result<OutputDriver, ConfigError> {
        match (self.output_pin, &self.output_commands) {
            (None, None) => Err(ConfigError::MissingOutput),
            (Some(_), Some(_)) => Err(ConfigError::ConflictingOutputs),
            (Some(pin), None) => Ok(match self.output_mode {
                OutputMode::Level => OutputDriver::Level { pin },
                OutputMode::Pulse => OutputDriver::Pulse {
                    pin,
                    pulse_ms: self.pulse_ms,
                },
            }),
            (None, Some(_)) if self.output_mode == OutputMode::Pulse => {
                Err(ConfigError::PulseWithoutPin)
            }
            (None, Some(commands)) => match commands.as_slice() {
                [on, off] if !on.trim().is_empty() && !off.trim().is_empty() => {
                    Ok(OutputDriver::Commands {
                        on: on.clone(),
                        off: off.clone(),
                    })
                }
                _ => Err(ConfigError::OutputCommandCount(commands.len())),
            },
        }
    }

    pub fn schedule_rules(&self) -> Result<Vec<ScheduleRule>, ConfigError> {
        let Some(schedule) = &self.schedule else {
            return Ok(Vec::new());
        };
        schedule
            .events
            .iter()
            .map(|event| {
                ScheduleRule::parse(&event.trigger, event.random, DeviceState::from(event.value))
            })
            .collect()
    }

    pub fn schedule_enabled(&self) -> bool {
        self.schedule.as_ref().is_some_and(|schedule| schedule.enabled)
    }

    pub fn timezone(&self) -> Result<Tz, ConfigError> {
        let name = self
            .schedule
            .as_ref()
            .map_or("UTC", |schedule| schedule.timezone.as_str());
        name.parse::<Tz>()
            .map_err(|_| ConfigError::UnknownTimezone(name.to_string()))
    }

    /// Solar calculator for the configured coordinates. Coordinates are only
    /// required when a rule is anchored to sunrise or sunset.
    pub fn sun_calculator(&self) -> Result<Box<dyn SunCalculator>, ConfigError> {
        let rules = self.schedule_rules()?;
        let coordinates = self
            .schedule
            .as_ref()
            .and_then(|schedule| schedule.latitude.zip(schedule.longitude));

        match coordinates {
            Some((latitude, longitude)) => AstronomicalSun::new(latitude, longitude)
                .map(|sun| Box::new(sun) as Box<dyn SunCalculator>)
                .ok_or(ConfigError::InvalidCoordinates {
                    latitude,
                    longitude,
                }),
            None => match rules.iter().find(|rule| rule.needs_coordinates()) {
                Some(rule) => Err(ConfigError::MissingCoordinates(rule.anchor.to_string())),
                None => Ok(Box::new(NoSun)),
            },
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_topic_prefix() -> String {
    "lampctl".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const BEDROOM: &str = r#"{
        "name": "Bedroom Light",
        "output_commands": ["lamp-on", "lamp-off"],
        "input_pin": 13,
        "input_pull": "up",
        "notification_pin": 11,
        "long_press_interval_ms": 800,
        "long_press_action": "toggle_paired_device",
        "schedule": {
            "timezone": "US/Eastern",
            "latitude": 40.44,
            "longitude": -79.94,
            "events": [
                {"trigger": "sunset-20", "random": 20, "value": true},
                {"trigger": "22:10", "value": false}
            ]
        }
    }"#;

    fn pin_config() -> ControllerConfig {
        ControllerConfig {
            output_pin: Some(5),
            ..ControllerConfig::default()
        }
    }

    #[test]
    fn parses_full_config_with_defaults() {
        let config: ControllerConfig = serde_json::from_str(BEDROOM).unwrap();

        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.name, "Bedroom Light");
        assert_eq!(config.debounce_ms, 50);
        assert_eq!(config.slow_blink, BlinkPattern::new(50, 1_500));
        assert_eq!(config.long_press_action, Some(LongPressAction::ToggleSchedule));
        assert_eq!(config.timezone(), Ok(chrono_tz::US::Eastern));
        assert!(config.schedule_enabled());
        assert_eq!(
            config.output_driver(),
            Ok(OutputDriver::Commands {
                on: "lamp-on".to_string(),
                off: "lamp-off".to_string(),
            })
        );

        let rules = config.schedule_rules().unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].to_string(), "sunset-20 -> ON (+0..20min)");
        assert_eq!(rules[1].action, DeviceState::Off);
    }

    #[test]
    fn long_press_command_action() {
        let action: LongPressAction =
            serde_json::from_str(r#"{"command": "curl -X POST http://hub/scene"}"#).unwrap();
        assert_eq!(
            action,
            LongPressAction::Command("curl -X POST http://hub/scene".to_string())
        );
    }

    #[test]
    fn output_mechanism_must_be_exactly_one() {
        assert_eq!(
            ControllerConfig::default().validate(),
            Err(ConfigError::MissingOutput)
        );

        let both = ControllerConfig {
            output_commands: Some(vec!["a".to_string(), "b".to_string()]),
            ..pin_config()
        };
        assert_eq!(both.validate(), Err(ConfigError::ConflictingOutputs));

        let single = ControllerConfig {
            output_commands: Some(vec!["only-on".to_string()]),
            ..ControllerConfig::default()
        };
        assert_eq!(single.validate(), Err(ConfigError::OutputCommandCount(1)));

        let blank = ControllerConfig {
            output_commands: Some(vec!["on".to_string(), "  ".to_string()]),
            ..ControllerConfig::default()
        };
        assert_eq!(blank.validate(), Err(ConfigError::OutputCommandCount(2)));
    }

    #[test]
    fn pulse_mode_requires_pin() {
        let config = ControllerConfig {
            output_commands: Some(vec!["on".to_string(), "off".to_string()]),
            output_mode: OutputMode::Pulse,
            ..ControllerConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::PulseWithoutPin));

        let pulse = ControllerConfig {
            output_mode: OutputMode::Pulse,
            ..pin_config()
        };
        assert_eq!(
            pulse.output_driver(),
            Ok(OutputDriver::Pulse {
                pin: 5,
                pulse_ms: 100
            })
        );
    }

    #[test]
    fn long_press_needs_action_and_must_outlast_debounce() {
        let missing = ControllerConfig {
            long_press_interval_ms: Some(800),
            ..pin_config()
        };
        assert_eq!(missing.validate(), Err(ConfigError::MissingLongPressAction));

        let short = ControllerConfig {
            long_press_interval_ms: Some(50),
            long_press_action: Some(LongPressAction::ToggleSchedule),
            ..pin_config()
        };
        assert_eq!(
            short.validate(),
            Err(ConfigError::LongPressTooShort { debounce_ms: 50 })
        );
    }

    #[test]
    fn pins_must_be_in_range_and_distinct() {
        let shared = ControllerConfig {
            input_pin: Some(5),
            ..pin_config()
        };
        assert_eq!(shared.validate(), Err(ConfigError::DuplicatePin(5)));

        let wide = ControllerConfig {
            notification_pin: Some(64),
            ..pin_config()
        };
        assert_eq!(wide.validate(), Err(ConfigError::PinOutOfRange(64)));
    }

    #[test]
    fn zero_durations_are_rejected() {
        let config = ControllerConfig {
            fast_blink: BlinkPattern::new(40, 0),
            ..pin_config()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroDuration("fast_blink.off_ms"))
        );
    }

    #[test]
    fn schedule_errors_surface_at_validation() {
        let mut config = pin_config();
        config.schedule = Some(ScheduleConfig {
            events: vec![ScheduleEventConfig {
                trigger: "sunrise+15".to_string(),
                random: 0,
                value: true,
            }],
            ..ScheduleConfig::default()
        });
        assert_eq!(
            config.validate(),
            Err(ConfigError::MissingCoordinates("sunrise+15".to_string()))
        );

        if let Some(schedule) = config.schedule.as_mut() {
            schedule.latitude = Some(91.0);
            schedule.longitude = Some(0.0);
        }
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidCoordinates {
                latitude: 91.0,
                longitude: 0.0
            })
        );

        if let Some(schedule) = config.schedule.as_mut() {
            schedule.latitude = Some(40.44);
            schedule.timezone = "Mars/Olympus".to_string();
        }
        assert_eq!(
            config.validate(),
            Err(ConfigError::UnknownTimezone("Mars/Olympus".to_string()))
        );

        if let Some(schedule) = config.schedule.as_mut() {
            schedule.timezone = "UTC".to_string();
            schedule.events[0].trigger = "25:00".to_string();
        }
        assert_eq!(
            config.validate(),
            Err(ConfigError::IllegalTrigger("25:00".to_string()))
        );
    }

    #[test]
    fn pull_direction_sets_active_level() {
        assert!(InputPull::Down.is_active(true));
        assert!(!InputPull::Down.is_active(false));
        assert!(InputPull::Up.is_active(false));
        assert!(!InputPull::Up.is_active(true));
    }
}
