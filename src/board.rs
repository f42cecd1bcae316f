//! One physical board as currently known to the board manager.
//!
//! A [`Board`] is shared as an `Arc<Board>` between the manager registry and
//! any number of external holders. Its serial number never changes. The
//! model, mode and capabilities are reclassified in place when the board
//! re-enumerates in another mode, so holders keep a valid reference across a
//! reboot into the bootloader and back.
//!
//! ```text
//!            open             release / device changed / missing
//!   Closed --------> Online ------------------------------------> Closed
//!     |                |                                            |
//!     '----------------'------------ missing for drop_delay ------> Dropped
//! ```
//!
//! The device handle is owned by the board and is present iff the board is
//! `Online`. Two locks guard a board: the handle lock serializes hardware
//! operations, the info lock protects the description. When both are needed
//! the handle lock is always taken first.

use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::capability::{Capabilities, Capability};
use crate::caterina::{Caterina, FlashObserver, TOUCH_RATE};
use crate::descriptor::Descriptor;
use crate::error::{Error, Result};
use crate::firmware::Firmware;
use crate::platform::{write_all, DeviceHandle, RawDevice};
use crate::registry::{self, BoardMode, BoardModel};

// =============================================================================
// Public Interface
// =============================================================================

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BoardState {
    /// The device is open and operations are permitted per capability.
    Online,
    /// The device is known but not open.
    Closed,
    /// The device is gone for good. Terminal.
    Dropped,
}

impl fmt::Display for BoardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BoardState::Online => "online",
            BoardState::Closed => "closed",
            BoardState::Dropped => "dropped",
        })
    }
}

/// Notification fired by the board manager when it reconciles a board.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BoardEvent {
    Added,
    Changed,
    Closed,
    Dropped,
}

impl fmt::Display for BoardEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BoardEvent::Added => "added",
            BoardEvent::Changed => "changed",
            BoardEvent::Closed => "closed",
            BoardEvent::Dropped => "dropped",
        })
    }
}

pub struct Board {
    serial: u64,
    io_timeout: Duration,
    handle: Mutex<Option<Box<dyn DeviceHandle>>>,
    info: Mutex<BoardInfo>,
}

impl Board {
    pub fn serial_number(&self) -> u64 {
        self.serial
    }

    pub fn state(&self) -> BoardState {
        self.info().state
    }

    pub fn model(&self) -> Option<&'static BoardModel> {
        self.info().model
    }

    pub fn mode(&self) -> &'static BoardMode {
        self.info().mode
    }

    pub fn capabilities(&self) -> Capabilities {
        self.info().capabilities
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.info().capabilities.contains(capability)
    }

    /// USB topology path of the port the board is plugged in.
    pub fn location(&self) -> String {
        self.info().device.location.clone()
    }

    /// Path of the device node currently presented by the board.
    pub fn path(&self) -> String {
        self.info().device.path.clone()
    }

    /// Identifier of the board, `<serial>-<model>`.
    pub fn tag(&self) -> String {
        let info = self.info();
        format_tag(self.serial, info.model)
    }

    /// `true` when `tag` is the serial number, the location, the device path
    /// or the full tag of this board.
    pub fn matches_tag(&self, tag: &str) -> bool {
        let info = self.info();
        tag == self.serial.to_string()
            || tag == info.device.location
            || tag == info.device.path
            || tag == format_tag(self.serial, info.model)
    }

    /// Read serial data, waiting at most `timeout`. Returns `Ok(0)` when
    /// nothing arrived in time.
    pub fn read_serial(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let mut handle = self.handle();
        let handle = self.online_handle(&mut handle, Capability::Serial)?;
        handle.read(buf, timeout)
    }

    /// Write all of `buf` to the board serial port.
    pub fn write_serial(&self, buf: &[u8]) -> Result<usize> {
        let mut handle = self.handle();
        let handle = self.online_handle(&mut handle, Capability::Serial)?;
        write_all(handle, buf)?;
        Ok(buf.len())
    }

    /// Change the serial line rate and the DTR signal.
    pub fn control_serial(&self, rate: u32, dtr: bool) -> Result<()> {
        let mut handle = self.handle();
        let handle = self.online_handle(&mut handle, Capability::Serial)?;
        handle.set_control(rate, dtr)
    }

    /// Ask the application to restart into the bootloader.
    ///
    /// The board is released: it stays `Closed` until the device
    /// re-enumerates.
    pub fn reboot(&self) -> Result<()> {
        let mut guard = self.handle();
        let handle = self.online_handle(&mut guard, Capability::Reboot)?;
        info!("Rebooting board {} into its bootloader", self.tag());
        handle.set_control(TOUCH_RATE, false)?;
        self.release_locked(&mut guard);
        Ok(())
    }

    /// Leave the bootloader and start the application.
    ///
    /// The board is released: it stays `Closed` until the device
    /// re-enumerates.
    pub fn reset(&self) -> Result<()> {
        let mut guard = self.handle();
        let handle = self.online_handle(&mut guard, Capability::Reset)?;
        info!("Resetting board {}", self.tag());
        Caterina::new(handle, self.io_timeout).exit()?;
        self.release_locked(&mut guard);
        Ok(())
    }

    /// Close the device without it disappearing. The board stays `Closed`
    /// until the device re-enumerates.
    pub fn release(&self) {
        let mut guard = self.handle();
        self.release_locked(&mut guard);
    }

    /// Readiness of incoming serial data, while the board is online.
    pub fn descriptor(&self) -> Option<Descriptor> {
        self.handle().as_ref().map(|handle| handle.descriptor())
    }
}

impl fmt::Debug for Board {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let info = self.info();
        f.debug_struct("Board")
            .field("serial", &self.serial)
            .field("state", &info.state)
            .field("model", &info.model.map(|m| m.name))
            .field("mode", &info.mode.name)
            .field("device", &info.device)
            .finish()
    }
}

impl fmt::Display for Board {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag())
    }
}

// =============================================================================
// Crate-Public Interface
// =============================================================================

impl Board {
    /// A new board, `Closed` until the manager opens it.
    pub(crate) fn new(
        serial: u64,
        model: Option<&'static BoardModel>,
        mode: &'static BoardMode,
        device: RawDevice,
        io_timeout: Duration,
    ) -> Self {
        Board {
            serial,
            io_timeout,
            handle: Mutex::new(None),
            info: Mutex::new(BoardInfo {
                state: BoardState::Closed,
                model,
                mode,
                capabilities: registry::capabilities(model, mode),
                device,
                parked_since: None,
                missing_since: None,
                holds: 0,
                last_event: None,
            }),
        }
    }

    pub(crate) fn device(&self) -> RawDevice {
        self.info().device.clone()
    }

    /// Update the identification after a re-enumeration.
    pub(crate) fn reclassify(
        &self,
        model: Option<&'static BoardModel>,
        mode: &'static BoardMode,
        device: RawDevice,
    ) {
        let mut info = self.info();
        if info.mode != mode || info.model != model {
            debug!(
                "Board {} is now {} in {} mode",
                self.serial,
                model.map_or("unknown", |m| m.name),
                mode
            );
        }
        info.model = model;
        info.mode = mode;
        info.capabilities = registry::capabilities(model, mode);
        info.device = device;
    }

    /// Take ownership of a freshly opened handle.
    pub(crate) fn attach(&self, handle: Box<dyn DeviceHandle>) {
        let mut guard = self.handle();
        *guard = Some(handle);
        let mut info = self.info();
        info.state = BoardState::Online;
        info.parked_since = None;
        info.missing_since = None;
    }

    /// Close the handle, if any, because the device went away or changed.
    pub(crate) fn close(&self) {
        let mut guard = self.handle();
        guard.take();
        let mut info = self.info();
        if info.state == BoardState::Online {
            info.state = BoardState::Closed;
        }
        info.parked_since = None;
    }

    /// Record that the device is absent from the enumeration, returning
    /// since when.
    pub(crate) fn mark_missing(&self, now: Instant) -> Instant {
        self.close();
        *self.info().missing_since.get_or_insert(now)
    }

    /// The device shows up in the enumeration again, whether or not it can
    /// be reopened.
    pub(crate) fn mark_present(&self) {
        self.info().missing_since = None;
    }

    /// Keep the board from being dropped while the returned guard lives.
    /// Waits expecting the device to re-enumerate hold the board.
    pub(crate) fn hold(&self) -> BoardHold<'_> {
        self.info().holds += 1;
        BoardHold { board: self }
    }

    pub(crate) fn is_held(&self) -> bool {
        self.info().holds > 0
    }

    pub(crate) fn mark_dropped(&self) {
        let mut guard = self.handle();
        guard.take();
        self.info().state = BoardState::Dropped;
    }

    pub(crate) fn missing_since(&self) -> Option<Instant> {
        self.info().missing_since
    }

    pub(crate) fn parked_since(&self) -> Option<Instant> {
        self.info().parked_since
    }

    pub(crate) fn last_event(&self) -> Option<BoardEvent> {
        self.info().last_event
    }

    pub(crate) fn set_last_event(&self, event: BoardEvent) {
        self.info().last_event = Some(event);
    }

    /// Erase, write and verify `firmware` through the bootloader.
    pub(crate) fn flash(
        &self,
        firmware: &Firmware,
        retries: usize,
        observer: &mut dyn FlashObserver,
    ) -> Result<&'static BoardModel> {
        let mut guard = self.handle();
        let handle = self.online_handle(&mut guard, Capability::Upload)?;
        let model = self
            .model()
            .ok_or_else(|| Error::Unsupported(format!("board {} has no known model", self.serial)))?;
        info!(
            "Uploading '{}' ({} bytes) to board {}",
            firmware.name(),
            firmware.size(),
            format_tag(self.serial, Some(model))
        );
        Caterina::new(handle, self.io_timeout).flash(model, firmware, retries, observer)?;
        Ok(model)
    }
}

// =============================================================================
// Private stuff
// =============================================================================

struct BoardInfo {
    state: BoardState,
    model: Option<&'static BoardModel>,
    mode: &'static BoardMode,
    /// Only ever computed by `registry::capabilities`.
    capabilities: Capabilities,
    device: RawDevice,
    /// Set while the board is released waiting for a re-enumeration.
    parked_since: Option<Instant>,
    /// Set while the device is absent from the enumeration.
    missing_since: Option<Instant>,
    /// Number of live `BoardHold`s.
    holds: usize,
    last_event: Option<BoardEvent>,
}

pub(crate) struct BoardHold<'a> {
    board: &'a Board,
}

impl Drop for BoardHold<'_> {
    fn drop(&mut self) {
        let mut info = self.board.info();
        info.holds = info.holds.saturating_sub(1);
    }
}

type HandleGuard<'a> = MutexGuard<'a, Option<Box<dyn DeviceHandle>>>;

impl Board {
    fn info(&self) -> MutexGuard<'_, BoardInfo> {
        self.info.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn handle(&self) -> HandleGuard<'_> {
        self.handle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn online_handle<'g>(
        &self,
        guard: &'g mut HandleGuard<'_>,
        capability: Capability,
    ) -> Result<&'g mut dyn DeviceHandle> {
        {
            let info = self.info();
            if !info.capabilities.contains(capability) {
                return Err(Error::Unsupported(format!(
                    "board {} does not support '{}' in {} mode",
                    format_tag(self.serial, info.model),
                    capability,
                    info.mode
                )));
            }
            if info.state == BoardState::Dropped {
                return Err(Error::NotFound(format!(
                    "board {} is gone",
                    format_tag(self.serial, info.model)
                )));
            }
        }
        match guard.as_mut() {
            Some(handle) => Ok(handle.as_mut()),
            None => Err(Error::Io(format!("board {} is not online", self.serial))),
        }
    }

    fn release_locked(&self, guard: &mut HandleGuard<'_>) {
        if guard.take().is_none() {
            return;
        }
        let mut info = self.info();
        info.state = BoardState::Closed;
        info.parked_since = Some(Instant::now());
        debug!("Board {} released", self.serial);
    }
}

fn format_tag(serial: u64, model: Option<&BoardModel>) -> String {
    format!("{}-{}", serial, model.map_or("unknown", |m| m.name))
}

// =============================================================================
// Unit Tests
// =============================================================================
