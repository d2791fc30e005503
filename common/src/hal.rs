use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{GpioError, SensorReadError};

/// Digital pin access provided by the platform.
pub trait Gpio: Send + Sync {
    /// Raw electrical level of an input pin (true = high).
    fn read_input(&self, pin: u8) -> Result<bool, SensorReadError>;

    fn write_output(&self, pin: u8, high: bool) -> Result<(), GpioError>;
}

/// Pins held in memory. Used by tests and by hosts without GPIO hardware.
#[derive(Debug, Default)]
pub struct MemoryGpio {
    inputs: AtomicU64,
    outputs: AtomicU64,
    writes: AtomicU64,
}

impl MemoryGpio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drives the simulated electrical level of an input pin.
    pub fn set_input(&self, pin: u8, high: bool) {
        set_bit(&self.inputs, pin, high);
    }

    pub fn output(&self, pin: u8) -> bool {
        self.outputs.load(Ordering::Acquire) & mask(pin) != 0
    }

    /// Total number of output writes, including writes that did not change the level.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Acquire)
    }
}

impl Gpio for MemoryGpio {
    fn read_input(&self, pin: u8) -> Result<bool, SensorReadError> {
        if pin >= 64 {
            return Err(SensorReadError {
                pin,
                reason: "no such pin".to_string(),
            });
        }
        Ok(self.inputs.load(Ordering::Acquire) & mask(pin) != 0)
    }

    fn write_output(&self, pin: u8, high: bool) -> Result<(), GpioError> {
        if pin >= 64 {
            return Err(GpioError {
                pin,
                reason: "no such pin".to_string(),
            });
        }
        set_bit(&self.outputs, pin, high);
        self.writes.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

fn mask(pin: u8) -> u64 {
    1_u64.checked_shl(u32::from(pin)).unwrap_or(0)
}

fn set_bit(bits: &AtomicU64, pin: u8, high: bool) {
    if high {
        bits.fetch_or(mask(pin), Ordering::AcqRel);
    } else {
        bits.fetch_and(!mask(pin), Ordering::AcqRel);
    }
}
