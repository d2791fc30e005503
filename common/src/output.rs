use tracing::{debug, info};

use crate::types::{DeviceState, IntentSource};

/// How the device is physically switched. Fixed at configuration time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputDriver {
    /// Pin held high while ON, low while OFF.
    Level { pin: u8 },
    /// Toggle-type relay: each transition pulls the pin low for `pulse_ms`.
    Pulse { pin: u8, pulse_ms: u64 },
    /// One external command per transition direction.
    Commands { on: String, off: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandPurpose {
    TurnOn,
    TurnOff,
    LongPress,
}

impl CommandPurpose {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TurnOn => "on",
            Self::TurnOff => "off",
            Self::LongPress => "long press",
        }
    }
}

/// Side effect requested by the core. The platform layer executes these;
/// commands must not block the control loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputAction {
    SetPin { pin: u8, high: bool },
    PulsePin { pin: u8, low_ms: u64 },
    RunCommand { command: String, purpose: CommandPurpose },
}

/// Owner of the authoritative device state.
///
/// State is updated before the returned actions run and is never rolled back
/// if they fail: the real actuator state is unknown at that point, and the
/// indicator stays consistent with the last command attempted.
#[derive(Debug, Clone)]
pub struct OutputController {
    name: String,
    driver: OutputDriver,
    state: DeviceState,
}

impl OutputController {
    pub fn new(name: impl Into<String>, driver: OutputDriver, initial: DeviceState) -> Self {
        Self {
            name: name.into(),
            driver,
            state: initial,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn driver(&self) -> &OutputDriver {
        &self.driver
    }

    pub fn current_state(&self) -> DeviceState {
        self.state
    }

    /// Pin setup to run once at startup so hardware matches the initial state.
    pub fn initial_actions(&self) -> Vec<OutputAction> {
        match self.driver {
            OutputDriver::Level { pin } => vec![OutputAction::SetPin {
                pin,
                high: self.state.is_on(),
            }],
            OutputDriver::Pulse { pin, .. } => vec![OutputAction::SetPin { pin, high: true }],
            OutputDriver::Commands { .. } => Vec::new(),
        }
    }

    /// Applies an intent. Re-applying the current state succeeds without any action.
    pub fn apply_intent(&mut self, intent: DeviceState, source: IntentSource) -> Vec<OutputAction> {
        if intent == self.state {
            debug!(
                "{}: already {} on {}",
                self.name,
                intent.as_str(),
                source.as_str()
            );
            return Vec::new();
        }

        self.state = intent;
        info!("{}: Turned {} on {}", self.name, intent.as_str(), source.as_str());

        match &self.driver {
            OutputDriver::Level { pin } => vec![OutputAction::SetPin {
                pin: *pin,
                high: intent.is_on(),
            }],
            OutputDriver::Pulse { pin, pulse_ms } => vec![OutputAction::PulsePin {
                pin: *pin,
                low_ms: *pulse_ms,
            }],
            OutputDriver::Commands { on, off } => {
                let (command, purpose) = match intent {
                    DeviceState::On => (on.clone(), CommandPurpose::TurnOn),
                    DeviceState::Off => (off.clone(), CommandPurpose::TurnOff),
                };
                vec![OutputAction::RunCommand { command, purpose }]
            }
        }
    }
}
