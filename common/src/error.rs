//! Error kinds for the lamp controller.
//!
//! Only [`ConfigError`] is fatal. Everything else is recovered inside the
//! control loop: logged, counted, and retried implicitly on the next tick.

use chrono::NaiveDate;
use thiserror::Error;

/// Invalid or inconsistent configuration. Raised before the control loop starts.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("must specify output_pin or output_commands")]
    MissingOutput,

    #[error("cannot specify both output_pin and output_commands")]
    ConflictingOutputs,

    #[error("output_commands must contain exactly two non-empty commands (on, off), got {0}")]
    OutputCommandCount(usize),

    #[error("pulse output mode requires output_pin")]
    PulseWithoutPin,

    #[error("long_press_action required when long_press_interval_ms is set")]
    MissingLongPressAction,

    #[error("long_press_interval_ms must be greater than debounce_ms ({debounce_ms})")]
    LongPressTooShort { debounce_ms: u64 },

    #[error("pin {0} is out of range [0, 63]")]
    PinOutOfRange(u8),

    #[error("pin {0} is assigned more than once")]
    DuplicatePin(u8),

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("unknown timezone: {0}")]
    UnknownTimezone(String),

    #[error("illegal schedule trigger: {0}")]
    IllegalTrigger(String),

    #[error("schedule random window of {0} minutes exceeds one day")]
    WindowTooLarge(u32),

    #[error("sunrise/sunset trigger {0} requires latitude and longitude")]
    MissingCoordinates(String),

    #[error("coordinates ({latitude}, {longitude}) are out of range")]
    InvalidCoordinates { latitude: f64, longitude: f64 },
}

/// An external on/off or long-press command did not complete.
#[derive(Debug, Error)]
pub enum ActuatorError {
    #[error("command is empty")]
    EmptyCommand,

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {status}")]
    ExitStatus { command: String, status: String },

    #[error("`{command}` timed out after {timeout_ms}ms")]
    Timeout { command: String, timeout_ms: u64 },

    #[error("external commands are not supported on this target")]
    Unsupported,

    #[error("output pin write failed: {0}")]
    Pin(#[from] GpioError),
}

/// The switch input could not be read this tick.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("failed to read input pin {pin}: {reason}")]
pub struct SensorReadError {
    pub pin: u8,
    pub reason: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("gpio {pin}: {reason}")]
pub struct GpioError {
    pub pin: u8,
    pub reason: String,
}

/// Astronomical computation failed for one date.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SolarError {
    #[error("no sunrise or sunset on {date} at latitude {latitude} (polar day or night)")]
    NoSolarEvent { date: NaiveDate, latitude: f64 },

    #[error("coordinates are not configured")]
    MissingCoordinates,

    #[error("coordinates ({latitude}, {longitude}) are out of range")]
    InvalidCoordinates { latitude: f64, longitude: f64 },

    #[error("computed solar time {0} is not near the requested date")]
    OutOfRange(String),
}
