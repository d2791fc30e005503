//! Notification LED patterns.
//!
//! ## Priority (highest first)
//!
//! 1. Press held past the long-press interval: fast blink
//! 2. Press held inside the short interval: steady on
//! 3. Schedule enabled: slow blink, whatever the device state
//! 4. Otherwise the LED mirrors the device state
//!
//! Blink phase is derived from `now_ms` alone, so the render loop keeps no
//! history and resynchronises immediately after a restart.

use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

use crate::types::{DeviceState, IndicatorPattern, PinLevel, SwitchPressState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlinkPattern {
    pub on_ms: u64,
    pub off_ms: u64,
}

impl BlinkPattern {
    pub const fn new(on_ms: u64, off_ms: u64) -> Self {
        Self { on_ms, off_ms }
    }

    pub fn period_ms(&self) -> u64 {
        self.on_ms.saturating_add(self.off_ms)
    }

    pub fn level_at(&self, now_ms: u64) -> PinLevel {
        let period = self.period_ms();
        if period == 0 {
            return PinLevel::High;
        }
        PinLevel::from(now_ms % period < self.on_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IndicatorInputs {
    pub device: DeviceState,
    #[serde(rename = "scheduleEnabled")]
    pub schedule_enabled: bool,
    pub press: SwitchPressState,
}

#[derive(Debug, Clone, Copy)]
pub struct IndicatorDriver {
    slow: BlinkPattern,
    fast: BlinkPattern,
}

impl IndicatorDriver {
    pub fn new(slow: BlinkPattern, fast: BlinkPattern) -> Self {
        Self { slow, fast }
    }

    pub fn select_pattern(inputs: IndicatorInputs) -> IndicatorPattern {
        match (inputs.press, inputs.schedule_enabled, inputs.device) {
            (SwitchPressState::PressedLongFired, _, _) => IndicatorPattern::FastBlink,
            (SwitchPressState::PressedShort | SwitchPressState::PressedLongPending, _, _) => {
                IndicatorPattern::On
            }
            (SwitchPressState::Released, true, _) => IndicatorPattern::SlowBlink,
            (SwitchPressState::Released, false, DeviceState::On) => IndicatorPattern::On,
            (SwitchPressState::Released, false, DeviceState::Off) => IndicatorPattern::Off,
        }
    }

    pub fn level_for(&self, pattern: IndicatorPattern, now_ms: u64) -> PinLevel {
        match pattern {
            IndicatorPattern::Off => PinLevel::Low,
            IndicatorPattern::On => PinLevel::High,
            IndicatorPattern::SlowBlink => self.slow.level_at(now_ms),
            IndicatorPattern::FastBlink => self.fast.level_at(now_ms),
        }
    }

    pub fn render(&self, now_ms: u64, inputs: IndicatorInputs) -> PinLevel {
        self.level_for(Self::select_pattern(inputs), now_ms)
    }
}

/// Lock-free snapshot of the state the indicator loop reads.
///
/// Written only by the control loop (or a host command holding the controller
/// lock); any number of readers.
#[derive(Debug)]
pub struct SharedSnapshot(AtomicU8);

const DEVICE_ON: u8 = 0b0000_0001;
const SCHEDULE_ENABLED: u8 = 0b0000_0010;
const PRESS_SHIFT: u8 = 2;

impl SharedSnapshot {
    pub fn new(inputs: IndicatorInputs) -> Self {
        Self(AtomicU8::new(encode(inputs)))
    }

    pub fn store(&self, inputs: IndicatorInputs) {
        self.0.store(encode(inputs), Ordering::Release);
    }

    pub fn load(&self) -> IndicatorInputs {
        decode(self.0.load(Ordering::Acquire))
    }
}

fn encode(inputs: IndicatorInputs) -> u8 {
    let press = match inputs.press {
        SwitchPressState::Released => 0,
        SwitchPressState::PressedShort => 1,
        SwitchPressState::PressedLongPending => 2,
        SwitchPressState::PressedLongFired => 3,
    };
    let mut bits = press << PRESS_SHIFT;
    if inputs.device.is_on() {
        bits |= DEVICE_ON;
    }
    if inputs.schedule_enabled {
        bits |= SCHEDULE_ENABLED;
    }
    bits
}

fn decode(bits: u8) -> IndicatorInputs {
    let press = match (bits >> PRESS_SHIFT) & 0b11 {
        0 => SwitchPressState::Released,
        1 => SwitchPressState::PressedShort,
        2 => SwitchPressState::PressedLongPending,
        _ => SwitchPressState::PressedLongFired,
    };
    IndicatorInputs {
        device: DeviceState::from(bits & DEVICE_ON != 0),
        schedule_enabled: bits & SCHEDULE_ENABLED != 0,
        press,
    }
}
