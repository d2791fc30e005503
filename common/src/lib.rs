pub mod config;
pub mod controller;
pub mod error;
pub mod hal;
pub mod indicator;
pub mod output;
pub mod schedule;
pub mod solar;
pub mod switch;
pub mod topics;
pub mod types;

pub use config::{
    ControllerConfig, InputPull, LongPressAction, MqttConfig, OutputMode, Precedence,
    ScheduleConfig, ScheduleEventConfig,
};
pub use controller::{ControllerStatus, LampController, StatePayload};
pub use error::{ActuatorError, ConfigError, GpioError, SensorReadError, SolarError};
pub use hal::{Gpio, MemoryGpio};
pub use indicator::{BlinkPattern, IndicatorDriver, IndicatorInputs, SharedSnapshot};
pub use output::{CommandPurpose, OutputAction, OutputController, OutputDriver};
pub use schedule::{Anchor, RuleStatus, ScheduleRule, Scheduler};
pub use solar::{AstronomicalSun, Clock, FixedSun, NoSun, SunCalculator, SunEvent, SystemClock};
pub use switch::SwitchMonitor;
pub use topics::*;
pub use types::{
    DeviceState, IndicatorPattern, IntentSource, PinLevel, ScheduleIntent, ScheduleState,
    SwitchEvent, SwitchPressState,
};
