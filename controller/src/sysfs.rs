use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use tracing::info;

use lampctl_common::{Gpio, GpioError, SensorReadError};

/// Linux sysfs GPIO (`/sys/class/gpio`).
#[derive(Debug, Clone)]
pub struct SysfsGpio {
    root: PathBuf,
}

impl SysfsGpio {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn setup_output(&self, pin: u8) -> anyhow::Result<()> {
        self.export(pin)?;
        self.write_attr(pin, "direction", "out")
            .with_context(|| format!("failed to configure gpio{pin} as output"))
    }

    pub fn setup_input(&self, pin: u8) -> anyhow::Result<()> {
        self.export(pin)?;
        self.write_attr(pin, "direction", "in")
            .with_context(|| format!("failed to configure gpio{pin} as input"))
    }

    fn pin_dir(&self, pin: u8) -> PathBuf {
        self.root.join(format!("gpio{pin}"))
    }

    fn export(&self, pin: u8) -> anyhow::Result<()> {
        if self.pin_dir(pin).exists() {
            return Ok(());
        }
        fs::write(self.root.join("export"), pin.to_string())
            .with_context(|| format!("failed to export gpio{pin}"))?;
        info!("exported gpio{pin}");
        Ok(())
    }

    fn write_attr(&self, pin: u8, attr: &str, value: &str) -> std::io::Result<()> {
        fs::write(self.pin_dir(pin).join(attr), value)
    }
}

impl Gpio for SysfsGpio {
    fn read_input(&self, pin: u8) -> Result<bool, SensorReadError> {
        let raw = fs::read_to_string(self.pin_dir(pin).join("value")).map_err(|err| {
            SensorReadError {
                pin,
                reason: err.to_string(),
            }
        })?;
        match raw.trim() {
            "1" => Ok(true),
            "0" => Ok(false),
            other => Err(SensorReadError {
                pin,
                reason: format!("unexpected value `{other}`"),
            }),
        }
    }

    fn write_output(&self, pin: u8, high: bool) -> Result<(), GpioError> {
        self.write_attr(pin, "value", if high { "1" } else { "0" })
            .map_err(|err| GpioError {
                pin,
                reason: err.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_root() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for pin in [5, 13] {
            fs::create_dir(dir.path().join(format!("gpio{pin}"))).unwrap();
        }
        dir
    }

    #[test]
    fn configures_and_writes_output() {
        let dir = fake_root();
        let gpio = SysfsGpio::new(dir.path());

        gpio.setup_output(5).unwrap();
        gpio.write_output(5, true).unwrap();

        let pin = dir.path().join("gpio5");
        assert_eq!(fs::read_to_string(pin.join("direction")).unwrap(), "out");
        assert_eq!(fs::read_to_string(pin.join("value")).unwrap(), "1");
    }

    #[test]
    fn reads_input_levels() {
        let dir = fake_root();
        let gpio = SysfsGpio::new(dir.path());
        gpio.setup_input(13).unwrap();

        fs::write(dir.path().join("gpio13/value"), "1\n").unwrap();
        assert_eq!(gpio.read_input(13), Ok(true));

        fs::write(dir.path().join("gpio13/value"), "x").unwrap();
        assert!(gpio.read_input(13).is_err());
    }

    #[test]
    fn exports_missing_pin() {
        let dir = fake_root();
        let gpio = SysfsGpio::new(dir.path());

        // The fake root has no kernel behind it, so the pin directory never appears.
        assert!(gpio.setup_output(20).is_err());
        assert_eq!(fs::read_to_string(dir.path().join("export")).unwrap(), "20");
    }

    #[test]
    fn missing_value_file_is_a_read_error() {
        let dir = fake_root();
        let gpio = SysfsGpio::new(dir.path());
        let err = gpio.read_input(5).unwrap_err();
        assert_eq!(err.pin, 5);
    }
}
