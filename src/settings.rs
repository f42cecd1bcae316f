//! Settings for the board manager, the boards and the upload task.
//!
//! Use the [builder](https://doc.rust-lang.org/1.0.0/style/ownership/builders.html)
//! pattern to set the configurable values.

use std::time::Duration;

// =============================================================================
// Public Interface
// =============================================================================

/// Groups all the tunable values used by `boardctl` and acts as a
/// [builder](https://doc.rust-lang.org/1.0.0/style/ownership/builders.html)
/// for the settings.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Settings {
    /// How long a board whose device vanished is kept `Closed`, waiting for
    /// it to come back, before it is dropped.
    pub drop_delay: Duration,
    /// Maximum time to wait for the bootloader after a reboot request.
    pub reboot_timeout: Duration,
    /// Maximum time to wait for the user to start the bootloader manually.
    pub manual_reboot_timeout: Duration,
    /// Maximum time to wait for the application to come back after a reset.
    pub reset_timeout: Duration,
    /// Maximum time to wait for a bootloader answer to one command.
    pub io_timeout: Duration,
    /// How many times a failed flash block is retried.
    pub transfer_retries: usize,
    /// Line rate used when opening a board running its application.
    pub serial_rate: u32,
    /// Period of the hotplug monitor of the serial platform.
    pub poll_interval: Duration,
    /// Select a board by serial number, location, path or tag.
    pub board_tag: Option<String>,

    /// Restrict creation of `Settings` instances unless through the
    /// `SettingsBuilder`.
    #[doc(hidden)]
    _private_use_builder: (),
}

impl Default for Settings {
    fn default() -> Self {
        SettingsBuilder::new().finalize()
    }
}

/// The builder for the `Settings` values.
///
/// All values are optional and have default values that will be used if not
/// explicitly set.
///
/// **Example**
///
/// ```
/// use std::time::Duration;
///
/// let settings = boardctl::SettingsBuilder::new()
///     .reboot_timeout(Duration::from_secs(10))
///     .board_tag("1234")
///     .finalize();
/// assert_eq!(settings.board_tag.as_deref(), Some("1234"));
/// ```
pub struct SettingsBuilder {
    settings: Settings,
}

impl Default for SettingsBuilder {
    fn default() -> Self {
        SettingsBuilder::new()
    }
}

impl SettingsBuilder {
    /// Start building the settings using default values.
    pub fn new() -> Self {
        SettingsBuilder {
            settings: Settings {
                drop_delay: Duration::from_millis(3000),
                reboot_timeout: Duration::from_millis(8000),
                manual_reboot_timeout: Duration::from_secs(60),
                reset_timeout: Duration::from_millis(4000),
                io_timeout: Duration::from_millis(1000),
                transfer_retries: 3,
                serial_rate: 115_200,
                poll_interval: Duration::from_millis(250),
                board_tag: None,
                _private_use_builder: (),
            },
        }
    }

    /// Set how long a vanished board waits to reappear before being dropped
    pub fn drop_delay(mut self, delay: Duration) -> Self {
        self.settings.drop_delay = delay;
        self
    }

    /// Set the maximum wait for the bootloader after a reboot request
    pub fn reboot_timeout(mut self, timeout: Duration) -> Self {
        self.settings.reboot_timeout = timeout;
        self
    }

    /// Set the maximum wait for a manually started bootloader
    pub fn manual_reboot_timeout(mut self, timeout: Duration) -> Self {
        self.settings.manual_reboot_timeout = timeout;
        self
    }

    /// Set the maximum wait for the application after a reset
    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.settings.reset_timeout = timeout;
        self
    }

    /// Set the maximum wait for one bootloader answer
    pub fn io_timeout(mut self, timeout: Duration) -> Self {
        self.settings.io_timeout = timeout;
        self
    }

    /// Set the number of retries for a failed flash block
    pub fn transfer_retries(mut self, retries: usize) -> Self {
        self.settings.transfer_retries = retries;
        self
    }

    /// Set the line rate used in application mode
    pub fn serial_rate(mut self, rate: u32) -> Self {
        self.settings.serial_rate = rate;
        self
    }

    /// Set the period of the hotplug monitor
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.settings.poll_interval = interval;
        self
    }

    /// Select the board to work with
    pub fn board_tag<'a>(mut self, tag: impl Into<std::borrow::Cow<'a, str>>) -> Self {
        self.settings.board_tag = Some(tag.into().as_ref().to_owned());
        self
    }

    pub fn finalize(self) -> Settings {
        self.settings
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn all_default() {
    let settings = SettingsBuilder::new().finalize();
    assert_eq!(
        settings,
        Settings {
            drop_delay: Duration::from_millis(3000),
            reboot_timeout: Duration::from_millis(8000),
            manual_reboot_timeout: Duration::from_secs(60),
            reset_timeout: Duration::from_millis(4000),
            io_timeout: Duration::from_millis(1000),
            transfer_retries: 3,
            serial_rate: 115_200,
            poll_interval: Duration::from_millis(250),
            board_tag: None,
            _private_use_builder: (),
        }
    );
    assert_eq!(settings, Settings::default());
    assert_eq!(SettingsBuilder::default().finalize(), settings);
}

#[test]
fn timeouts() {
    let settings = SettingsBuilder::new()
        .drop_delay(Duration::from_millis(10))
        .reboot_timeout(Duration::from_millis(20))
        .manual_reboot_timeout(Duration::from_millis(30))
        .reset_timeout(Duration::from_millis(40))
        .io_timeout(Duration::from_millis(50))
        .finalize();
    assert_eq!(settings.drop_delay, Duration::from_millis(10));
    assert_eq!(settings.reboot_timeout, Duration::from_millis(20));
    assert_eq!(settings.manual_reboot_timeout, Duration::from_millis(30));
    assert_eq!(settings.reset_timeout, Duration::from_millis(40));
    assert_eq!(settings.io_timeout, Duration::from_millis(50));
}

#[test]
fn transfer_retries() {
    let settings = SettingsBuilder::new().transfer_retries(7).finalize();
    assert_eq!(settings.transfer_retries, 7);
}

#[test]
fn serial_rate() {
    let rate = 9_600;
    let settings = SettingsBuilder::new().serial_rate(rate).finalize();
    assert_eq!(settings.serial_rate, rate);
}

#[test]
fn poll_interval() {
    let interval = Duration::from_millis(500);
    let settings = SettingsBuilder::new().poll_interval(interval).finalize();
    assert_eq!(settings.poll_interval, interval);
}

#[test]
fn board_tag() {
    let settings = SettingsBuilder::new().board_tag("usb-1-2").finalize();
    assert_eq!(settings.board_tag.unwrap(), "usb-1-2");
}
