//! Digital pin access: Linux sysfs GPIO, and an in-memory pin for tests.

use log::debug;
use snafu::{ensure, ResultExt, Snafu};

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::types::{Direction, Level};

/// Error type for this module
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("GPIO access to {} failed: {}", path.display(), source))]
    Sysfs {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Unexpected value {:?} in {}", contents, path.display()))]
    BadValue { path: PathBuf, contents: String },
    #[snafu(display("Pin is not configured as an output"))]
    NotOutput,
    #[snafu(display("Pin {} is unavailable", pin))]
    Unavailable { pin: String },
}

/// A single GPIO line.
pub trait DigitalPin {
    fn read(&mut self) -> Result<Level, Error>;
    fn write(&mut self, level: Level) -> Result<(), Error>;
    fn set_direction(&mut self, direction: Direction) -> Result<(), Error>;

    /// Claim the pin from the OS, if that is needed before use.
    fn export(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn unexport(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/// Default root of the sysfs GPIO interface.
pub const SYSFS_GPIO_ROOT: &str = "/sys/class/gpio";

/// A pin driven through the Linux sysfs GPIO interface.
#[derive(Debug, Clone)]
pub struct SysfsPin {
    root: PathBuf,
    number: u32,
}

impl SysfsPin {
    pub fn new(number: u32) -> Self {
        Self::with_root(SYSFS_GPIO_ROOT, number)
    }

    /// Use a different sysfs root, e.g. a scratch directory in tests.
    pub fn with_root(root: impl Into<PathBuf>, number: u32) -> Self {
        Self {
            root: root.into(),
            number,
        }
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    fn pin_dir(&self) -> PathBuf {
        self.root.join(format!("gpio{}", self.number))
    }

    fn write_file(path: &Path, contents: &str) -> Result<(), Error> {
        fs::write(path, contents).context(SysfsSnafu { path })
    }
}

impl DigitalPin for SysfsPin {
    fn read(&mut self) -> Result<Level, Error> {
        let path = self.pin_dir().join("value");
        let contents = fs::read(&path).context(SysfsSnafu { path: &path })?;
        match contents.first() {
            Some(b'0') => Ok(Level::Low),
            Some(b'1') => Ok(Level::High),
            _ => BadValueSnafu {
                path,
                contents: String::from_utf8_lossy(&contents),
            }
            .fail(),
        }
    }

    fn write(&mut self, level: Level) -> Result<(), Error> {
        let path = self.pin_dir().join("value");
        Self::write_file(&path, if level.is_high() { "1" } else { "0" })
    }

    fn set_direction(&mut self, direction: Direction) -> Result<(), Error> {
        let path = self.pin_dir().join("direction");
        let contents = match direction {
            Direction::In => "in",
            Direction::Out(Level::High) => "high",
            Direction::Out(Level::Low) => "low",
        };
        Self::write_file(&path, contents)
    }

    /// Export the pin, unless it already is.
    fn export(&mut self) -> Result<(), Error> {
        if self.pin_dir().exists() {
            debug!("GPIO {} already exported", self.number);
            return Ok(());
        }
        Self::write_file(&self.root.join("export"), &self.number.to_string())
    }

    fn unexport(&mut self) -> Result<(), Error> {
        Self::write_file(&self.root.join("unexport"), &self.number.to_string())
    }
}

/// An in-memory pin. Clones share the line level, so a clone used as
/// transmitter output and another as receiver input form a loopback.
/// Direction is per clone.
#[derive(Debug, Clone)]
pub struct MockPin {
    level: Arc<AtomicBool>,
    failing: Arc<AtomicBool>,
    direction: Direction,
}

impl MockPin {
    /// A new line at the given level, with this end configured as input.
    pub fn new(level: Level) -> Self {
        Self {
            level: Arc::new(AtomicBool::new(level.is_high())),
            failing: Arc::new(AtomicBool::new(false)),
            direction: Direction::In,
        }
    }

    /// Current line level, regardless of direction.
    pub fn level(&self) -> Level {
        Level::from(self.level.load(Ordering::SeqCst))
    }

    /// Drive the line from outside, e.g. to simulate a remote transmitter.
    pub fn set_level(&self, level: Level) {
        self.level.store(level.is_high(), Ordering::SeqCst);
    }

    /// Make every access on this line fail, for all clones.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), Error> {
        ensure!(
            !self.failing.load(Ordering::SeqCst),
            UnavailableSnafu { pin: "mock" }
        );
        Ok(())
    }
}

impl DigitalPin for MockPin {
    fn read(&mut self) -> Result<Level, Error> {
        self.check()?;
        Ok(self.level())
    }

    fn write(&mut self, level: Level) -> Result<(), Error> {
        self.check()?;
        ensure!(
            matches!(self.direction, Direction::Out(_)),
            NotOutputSnafu
        );
        self.set_level(level);
        Ok(())
    }

    fn set_direction(&mut self, direction: Direction) -> Result<(), Error> {
        self.check()?;
        self.direction = direction;
        if let Direction::Out(level) = direction {
            self.set_level(level);
        }
        Ok(())
    }
}
