//! Reset line for power-cycling the reader.
//!
//! The reader's reset pin is driven through the legacy sysfs GPIO interface
//! (`/sys/class/gpio`). Pulling it low holds the microcontroller in reset;
//! driving it high again lets it boot.

use std::fs;
use std::io;
use std::path::PathBuf;
use tracing::{debug, info};

/// Default sysfs GPIO root.
pub const DEFAULT_SYSFS_BASE: &str = "/sys/class/gpio";

/// An output line wired to the reader's reset pin.
pub trait ResetLine: Send + Sync {
    /// Drive the line high (`true`) or low (`false`).
    fn set_level(&self, high: bool) -> io::Result<()>;

    /// Human-readable description, for logs.
    fn describe(&self) -> String;
}

/// Reset line driven through `/sys/class/gpio/gpioN`.
#[derive(Debug, Clone)]
pub struct SysfsResetLine {
    base_path: PathBuf,
    pin: u32,
}

impl SysfsResetLine {
    pub fn new(pin: u32, base_path: Option<PathBuf>) -> Self {
        Self {
            base_path: base_path.unwrap_or_else(|| PathBuf::from(DEFAULT_SYSFS_BASE)),
            pin,
        }
    }

    fn pin_dir(&self) -> PathBuf {
        self.base_path.join(format!("gpio{}", self.pin))
    }

    /// Export the pin if needed and configure it as an output held high.
    pub fn init(&self) -> io::Result<()> {
        if !self.pin_dir().exists() {
            fs::write(self.base_path.join("export"), self.pin.to_string())?;
            debug!(pin = self.pin, "Exported GPIO pin");
        }
        // "high" sets direction out with an initial high level in one write
        fs::write(self.pin_dir().join("direction"), "high")?;
        info!(pin = self.pin, "Reset line ready");
        Ok(())
    }
}

impl ResetLine for SysfsResetLine {
    fn set_level(&self, high: bool) -> io::Result<()> {
        fs::write(self.pin_dir().join("value"), if high { "1" } else { "0" })
    }

    fn describe(&self) -> String {
        format!("gpio{} ({})", self.pin, self.base_path.display())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Fake sysfs tree: writing `export` is what creates the pin directory
    /// on a real kernel, so the test creates it up front.
    fn fake_sysfs(pin: u32) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("export"), "").unwrap();
        fs::create_dir_all(dir.path().join(format!("gpio{pin}"))).unwrap();
        dir
    }

    #[test]
    fn test_init_sets_direction_high() {
        let dir = fake_sysfs(2);
        let line = SysfsResetLine::new(2, Some(dir.path().to_path_buf()));
        line.init().unwrap();
        let direction = fs::read_to_string(dir.path().join("gpio2/direction")).unwrap();
        assert_eq!(direction, "high");
    }

    #[test]
    fn test_set_level_writes_value() {
        let dir = fake_sysfs(17);
        let line = SysfsResetLine::new(17, Some(dir.path().to_path_buf()));
        line.set_level(false).unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("gpio17/value")).unwrap(), "0");
        line.set_level(true).unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("gpio17/value")).unwrap(), "1");
    }

    #[test]
    fn test_init_exports_missing_pin() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("export"), "").unwrap();
        let line = SysfsResetLine::new(5, Some(dir.path().to_path_buf()));
        // no kernel behind the fake tree, so the direction write fails after export
        assert!(line.init().is_err());
        assert_eq!(fs::read_to_string(dir.path().join("export")).unwrap(), "5");
    }

    #[test]
    fn test_describe_names_pin() {
        let line = SysfsResetLine::new(2, None);
        assert_eq!(line.describe(), "gpio2 (/sys/class/gpio)");
    }
}
