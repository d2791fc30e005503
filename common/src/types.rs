use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeviceState {
    On,
    Off,
}

impl DeviceState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::On => "ON",
            Self::Off => "OFF",
        }
    }

    pub fn is_on(self) -> bool {
        self == Self::On
    }

    pub fn toggled(self) -> Self {
        match self {
            Self::On => Self::Off,
            Self::Off => Self::On,
        }
    }

    /// Parses the command words accepted on the host surfaces.
    pub fn parse_command(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "on" | "true" | "1" => Some(Self::On),
            "off" | "false" | "0" => Some(Self::Off),
            _ => None,
        }
    }
}

impl From<bool> for DeviceState {
    fn from(on: bool) -> Self {
        if on {
            Self::On
        } else {
            Self::Off
        }
    }
}

/// Who asked for a device transition. Only used for logging and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentSource {
    Switch,
    Schedule,
    Host,
    Shutdown,
}

impl IntentSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Switch => "button press",
            Self::Schedule => "schedule event",
            Self::Host => "host command",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Host-facing view of the schedule enable flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ScheduleState {
    Enabled,
    Disabled,
}

impl ScheduleState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Enabled => "ENABLED",
            Self::Disabled => "DISABLED",
        }
    }

    pub fn is_enabled(self) -> bool {
        self == Self::Enabled
    }

    pub fn parse_command(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "enabled" | "enable" | "on" | "true" | "1" => Some(Self::Enabled),
            "disabled" | "disable" | "off" | "false" | "0" => Some(Self::Disabled),
            _ => None,
        }
    }
}

impl From<bool> for ScheduleState {
    fn from(enabled: bool) -> Self {
        if enabled {
            Self::Enabled
        } else {
            Self::Disabled
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchEvent {
    ToggleRequested,
    LongPressFired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SwitchPressState {
    Released,
    /// Accepted press with no long-press interval configured.
    PressedShort,
    /// Accepted press still inside the long-press interval.
    PressedLongPending,
    PressedLongFired,
}

impl SwitchPressState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Released => "RELEASED",
            Self::PressedShort => "PRESSED_SHORT",
            Self::PressedLongPending => "PRESSED_LONG_PENDING",
            Self::PressedLongFired => "PRESSED_LONG_FIRED",
        }
    }

    pub fn is_pressed(self) -> bool {
        self != Self::Released
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IndicatorPattern {
    Off,
    On,
    SlowBlink,
    FastBlink,
}

impl IndicatorPattern {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::On => "ON",
            Self::SlowBlink => "SLOW_BLINK",
            Self::FastBlink => "FAST_BLINK",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinLevel {
    Low,
    High,
}

impl PinLevel {
    pub fn is_high(self) -> bool {
        self == Self::High
    }
}

impl From<bool> for PinLevel {
    fn from(high: bool) -> Self {
        if high {
            Self::High
        } else {
            Self::Low
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleIntent {
    pub rule_id: usize,
    pub action: DeviceState,
}
