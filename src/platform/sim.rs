//! Simulated platform.
//!
//! A [`SimulatedPlatform`] is driven through its [`SimController`]: boards are
//! plugged and unplugged, and each simulated board behaves like a Caterina
//! board. Touching its serial port at 1200 baud with DTR low reboots it into
//! the bootloader, which answers the AVR109 commands used by
//! [`caterina`](crate::caterina) and keeps the flashed image in memory. The
//! bootloader `E` command brings the board back to application mode.
//!
//! Faults can be injected to exercise the recovery paths: a board that never
//! reboots, dropped block acknowledgements, a device that vanishes in the
//! middle of a transfer, slow re-enumeration, a bootloader refusing to exit
//! and failing enumerations or opens.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, trace};

use super::{DeviceHandle, Platform, RawDevice};
use crate::caterina::TOUCH_RATE;
use crate::descriptor::{Descriptor, Pollable, Signal};
use crate::error::{Error, Result};
use crate::registry::BoardModel;

/// Most bytes a simulated device accepts in one write.
const MAX_WRITE: usize = 64;

// =============================================================================
// Public Interface
// =============================================================================

/// Platform half of the simulator, owned by the board manager.
pub struct SimulatedPlatform {
    bus: Arc<Mutex<Bus>>,
    signal: Arc<Signal>,
}

/// Scripting half of the simulator, kept by the test or demo.
#[derive(Clone)]
pub struct SimController {
    bus: Arc<Mutex<Bus>>,
    signal: Arc<Signal>,
}

/// Create a connected simulated platform and its controller.
pub fn simulator() -> (SimulatedPlatform, SimController) {
    let bus = Arc::new(Mutex::new(Bus::default()));
    let signal = Signal::new();
    (
        SimulatedPlatform {
            bus: bus.clone(),
            signal: signal.clone(),
        },
        SimController { bus, signal },
    )
}

impl Platform for SimulatedPlatform {
    fn enumerate(&mut self) -> Result<Vec<RawDevice>> {
        self.signal.clear();
        let mut bus = lock(&self.bus);
        bus.enumerations += 1;
        if bus.fail_enumeration {
            return Err(Error::System("simulated enumeration failure".into()));
        }
        let mut devices = vec![];
        for board in bus.boards.iter_mut() {
            if !board.attached || board.hidden() {
                continue;
            }
            devices.push(board.raw());
        }
        devices.extend(bus.extra.iter().cloned());
        Ok(devices)
    }

    fn descriptor(&self) -> Descriptor {
        self.signal.descriptor()
    }

    fn open(&self, device: &RawDevice, rate: u32) -> Result<Box<dyn DeviceHandle>> {
        let mut bus = lock(&self.bus);
        let deny = bus.deny_open;
        let index = bus
            .find_visible(device)
            .ok_or_else(|| Error::NotFound(format!("no device at {}", device.path)))?;
        let board = &mut bus.boards[index];
        board.opened += 1;
        if deny {
            return Err(Error::Access(device.path.clone()));
        }
        debug!("Simulated open of {} at {} baud", device, rate);
        Ok(Box::new(SimHandle {
            bus: self.bus.clone(),
            signal: self.signal.clone(),
            index,
            generation: board.generation,
            rate,
            dtr: true,
        }))
    }
}

impl SimController {
    /// Attach a board running its application, reporting `serial`.
    pub fn plug(&self, model: &'static BoardModel, serial: &str, location: &str) {
        let mut bus = lock(&self.bus);
        if let Some(board) = bus.boards.iter_mut().find(|b| b.location == location) {
            board.model = model;
            board.serial = serial.to_owned();
            board.attached = true;
            board.bootloader = false;
            board.hidden_until = None;
            board.generation += 1;
        } else {
            let path = format!("/dev/ttySIM{}", bus.boards.len());
            bus.boards.push(SimBoard::new(model, serial, location, path));
        }
        drop(bus);
        self.signal.raise();
    }

    /// Attach a board that is already waiting in its bootloader.
    pub fn plug_bootloader(&self, model: &'static BoardModel, serial: &str, location: &str) {
        self.plug(model, serial, location);
        self.with_board(location, |board| board.bootloader = true);
        self.signal.raise();
    }

    /// Detach the board at `location`.
    pub fn unplug(&self, location: &str) {
        self.with_board(location, |board| {
            board.attached = false;
            board.generation += 1;
        });
        self.signal.raise();
    }

    /// Simulate the user pressing the reset button: the board re-enumerates
    /// in its bootloader.
    pub fn press_button(&self, location: &str) {
        let delay = self.with_board(location, |board| {
            board.enter_bootloader();
            board.delay
        });
        announce(&self.signal, delay.unwrap_or_default());
    }

    /// Attach a raw device that is not a simulated board (e.g. an unrelated
    /// device or a second device claiming an existing serial number).
    pub fn plug_raw(&self, device: RawDevice) {
        lock(&self.bus).extra.push(device);
        self.signal.raise();
    }

    /// Keep the board at `location` away from the bus for `delay` whenever
    /// it re-enumerates. The hotplug descriptor is raised again when it
    /// shows up.
    pub fn set_reenumeration_delay(&self, location: &str, delay: Duration) {
        self.with_board(location, |board| board.delay = delay);
    }

    /// Make the bootloader refuse the `E` command.
    pub fn reject_exit(&self, location: &str, reject: bool) {
        self.with_board(location, |board| board.reject_exit = reject);
    }

    /// Make the board ignore reboot requests.
    pub fn set_stuck(&self, location: &str, stuck: bool) {
        self.with_board(location, |board| board.stuck = stuck);
    }

    /// Drop the acknowledgement of the next `count` block writes.
    pub fn drop_block_acks(&self, location: &str, count: usize) {
        self.with_board(location, |board| board.drop_acks = count);
    }

    /// Make the device vanish after `count` more blocks were written.
    pub fn vanish_after_blocks(&self, location: &str, count: usize) {
        self.with_board(location, |board| board.vanish_after = Some(count));
    }

    pub fn set_enumeration_failure(&self, fail: bool) {
        lock(&self.bus).fail_enumeration = fail;
    }

    pub fn set_deny_open(&self, deny: bool) {
        lock(&self.bus).deny_open = deny;
    }

    /// Queue data the application on the board prints on its serial port.
    pub fn print(&self, location: &str, data: &[u8]) {
        self.with_board(location, |board| board.output.extend(data.iter().copied()));
    }

    /// Data written to the board while it ran its application.
    pub fn received(&self, location: &str) -> Vec<u8> {
        self.with_board(location, |board| board.received.clone())
            .unwrap_or_default()
    }

    /// The flash content written through the bootloader.
    pub fn flash(&self, location: &str) -> Vec<u8> {
        self.with_board(location, |board| board.flash.clone())
            .unwrap_or_default()
    }

    pub fn in_bootloader(&self, location: &str) -> bool {
        self.with_board(location, |board| board.bootloader)
            .unwrap_or(false)
    }

    /// Number of block writes the bootloader acknowledged.
    pub fn blocks_written(&self, location: &str) -> usize {
        self.with_board(location, |board| board.blocks).unwrap_or(0)
    }

    /// Number of times the board was touched at 1200 baud.
    pub fn reboot_requests(&self, location: &str) -> usize {
        self.with_board(location, |board| board.touches).unwrap_or(0)
    }

    /// Number of attempts to open a handle to the board, failed ones
    /// included.
    pub fn open_count(&self, location: &str) -> usize {
        self.with_board(location, |board| board.opened).unwrap_or(0)
    }

    pub fn enumerations(&self) -> usize {
        lock(&self.bus).enumerations
    }

    /// Raise the hotplug descriptor without changing anything.
    pub fn notify(&self) {
        self.signal.raise();
    }

    fn with_board<T>(&self, location: &str, f: impl FnOnce(&mut SimBoard) -> T) -> Option<T> {
        let mut bus = lock(&self.bus);
        bus.boards
            .iter_mut()
            .find(|board| board.location == location)
            .map(f)
    }
}

// =============================================================================
// Private stuff
// =============================================================================

#[derive(Default)]
struct Bus {
    boards: Vec<SimBoard>,
    extra: Vec<RawDevice>,
    enumerations: usize,
    fail_enumeration: bool,
    deny_open: bool,
}

impl Bus {
    fn find_visible(&self, device: &RawDevice) -> Option<usize> {
        self.boards
            .iter()
            .position(|b| b.attached && !b.hidden() && b.path == device.path)
    }
}

struct SimBoard {
    model: &'static BoardModel,
    serial: String,
    location: String,
    path: String,
    attached: bool,
    bootloader: bool,
    /// The bootloader acknowledged `E` and restarts the application once
    /// the acknowledgement is read or the port closed.
    exit_pending: bool,
    /// Bumped each time the device re-enumerates; stale handles fail.
    generation: u64,
    /// Not visible on the bus before this instant.
    hidden_until: Option<Instant>,
    delay: Duration,

    stuck: bool,
    reject_exit: bool,
    drop_acks: usize,
    vanish_after: Option<usize>,

    touches: usize,
    opened: usize,
    blocks: usize,

    flash: Vec<u8>,
    address: usize,
    output: VecDeque<u8>,
    received: Vec<u8>,
    pending: Vec<u8>,
}

impl SimBoard {
    fn new(model: &'static BoardModel, serial: &str, location: &str, path: String) -> Self {
        SimBoard {
            model,
            serial: serial.to_owned(),
            location: location.to_owned(),
            path,
            attached: true,
            bootloader: false,
            exit_pending: false,
            generation: 0,
            hidden_until: None,
            delay: Duration::from_secs(0),
            stuck: false,
            reject_exit: false,
            drop_acks: 0,
            vanish_after: None,
            touches: 0,
            opened: 0,
            blocks: 0,
            flash: vec![0xff; model.code_size],
            address: 0,
            output: VecDeque::new(),
            received: vec![],
            pending: vec![],
        }
    }

    fn raw(&self) -> RawDevice {
        let (id, serial) = if self.bootloader {
            (self.model.bootloader_id, None)
        } else {
            (self.model.application_id, Some(self.serial.clone()))
        };
        RawDevice {
            vid: id.vid,
            pid: id.pid,
            serial,
            location: self.location.clone(),
            path: self.path.clone(),
        }
    }

    fn reenumerate(&mut self, bootloader: bool) {
        self.bootloader = bootloader;
        self.exit_pending = false;
        self.generation += 1;
        self.hidden_until = if self.delay > Duration::from_secs(0) {
            Some(Instant::now() + self.delay)
        } else {
            None
        };
        self.output.clear();
        self.pending.clear();
    }

    fn enter_bootloader(&mut self) {
        debug!("Simulated board at {} enters its bootloader", self.location);
        self.address = 0;
        self.reenumerate(true);
    }

    fn exit_bootloader(&mut self) {
        debug!("Simulated board at {} starts its application", self.location);
        self.reenumerate(false);
    }

    fn alive(&self, generation: u64) -> bool {
        self.attached && self.generation == generation && !self.hidden()
    }

    fn hidden(&self) -> bool {
        self.hidden_until.map_or(false, |until| Instant::now() < until)
    }

    /// Feed bytes to the AVR109 command interpreter.
    fn bootloader_input(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
        loop {
            let consumed = match self.pending.first() {
                None => break,
                Some(b'P') | Some(b'L') | Some(b'e') => {
                    if self.pending[0] == b'e' {
                        self.flash.iter_mut().for_each(|b| *b = 0xff);
                    }
                    self.output.push_back(b'\r');
                    1
                }
                Some(b'E') if self.reject_exit => {
                    self.output.push_back(b'?');
                    1
                }
                Some(b'E') => {
                    self.output.push_back(b'\r');
                    self.exit_pending = true;
                    1
                }
                Some(b'A') => {
                    if self.pending.len() < 3 {
                        break;
                    }
                    let word = u16::from_be_bytes([self.pending[1], self.pending[2]]);
                    self.address = word as usize * 2;
                    self.output.push_back(b'\r');
                    3
                }
                Some(b'B') => {
                    if self.pending.len() < 4 {
                        break;
                    }
                    let size = u16::from_be_bytes([self.pending[1], self.pending[2]]) as usize;
                    if self.pending.len() < 4 + size {
                        break;
                    }
                    let start = std::cmp::min(self.address, self.flash.len());
                    let end = std::cmp::min(self.address + size, self.flash.len());
                    self.flash[start..end].copy_from_slice(&self.pending[4..4 + end - start]);
                    self.address += size;
                    self.blocks += 1;
                    if self.drop_acks > 0 {
                        trace!("Dropping block acknowledgement");
                        self.drop_acks -= 1;
                    } else {
                        self.output.push_back(b'\r');
                    }
                    if let Some(left) = self.vanish_after.as_mut() {
                        *left = left.saturating_sub(1);
                        if *left == 0 {
                            self.vanish_after = None;
                            self.attached = false;
                            self.generation += 1;
                        }
                    }
                    4 + size
                }
                Some(b'g') => {
                    if self.pending.len() < 4 {
                        break;
                    }
                    let size = u16::from_be_bytes([self.pending[1], self.pending[2]]) as usize;
                    for offset in 0..size {
                        let byte = self.flash.get(self.address + offset).copied();
                        self.output.push_back(byte.unwrap_or(0xff));
                    }
                    self.address += size;
                    4
                }
                Some(_) => {
                    self.output.push_back(b'?');
                    1
                }
            };
            self.pending.drain(..consumed);
        }
    }

    /// Restart the application if `E` was acknowledged. Returns `true` when
    /// the board re-enumerated.
    fn complete_exit(&mut self) -> bool {
        if self.exit_pending && self.output.is_empty() {
            self.exit_bootloader();
            return true;
        }
        false
    }
}

struct SimHandle {
    bus: Arc<Mutex<Bus>>,
    signal: Arc<Signal>,
    index: usize,
    generation: u64,
    rate: u32,
    dtr: bool,
}

impl SimHandle {
    fn board<'a>(&self, bus: &'a mut MutexGuard<'_, Bus>) -> Result<&'a mut SimBoard> {
        let generation = self.generation;
        bus.boards
            .get_mut(self.index)
            .filter(|board| board.alive(generation))
            .ok_or_else(|| Error::Io("device disconnected".into()))
    }
}

impl DeviceHandle for SimHandle {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let (n, exited) = {
            let mut bus = lock(&self.bus);
            let board = self.board(&mut bus)?;
            let n = std::cmp::min(buf.len(), board.output.len());
            for (slot, byte) in buf.iter_mut().zip(board.output.drain(..n)) {
                *slot = byte;
            }
            (n, board.complete_exit().then(|| board.delay))
        };
        if let Some(delay) = exited {
            announce(&self.signal, delay);
        }
        if n == 0 {
            thread::sleep(std::cmp::min(timeout, Duration::from_millis(1)));
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let n = std::cmp::min(buf.len(), MAX_WRITE);
        let mut bus = lock(&self.bus);
        let board = self.board(&mut bus)?;
        if board.bootloader {
            board.bootloader_input(&buf[..n]);
        } else {
            board.received.extend_from_slice(&buf[..n]);
        }
        Ok(n)
    }

    fn set_control(&mut self, rate: u32, dtr: bool) -> Result<()> {
        let mut bus = lock(&self.bus);
        let board = self.board(&mut bus)?;
        if rate == TOUCH_RATE && !board.bootloader {
            board.touches += 1;
        }
        self.rate = rate;
        self.dtr = dtr;
        Ok(())
    }

    fn descriptor(&self) -> Descriptor {
        Descriptor::new(Arc::new(SimReadiness {
            bus: self.bus.clone(),
            index: self.index,
            generation: self.generation,
        }))
    }
}

impl Drop for SimHandle {
    /// Closing the port while it is set to 1200 baud with DTR low is the
    /// Caterina reboot request. Closing it after `E` restarts the
    /// application right away.
    fn drop(&mut self) {
        let touched = self.rate == TOUCH_RATE && !self.dtr;
        let reenumerated = {
            let mut bus = lock(&self.bus);
            match self.board(&mut bus) {
                Ok(board) if board.exit_pending => {
                    board.exit_bootloader();
                    Some(board.delay)
                }
                Ok(board) if touched && !board.stuck && !board.bootloader => {
                    board.enter_bootloader();
                    Some(board.delay)
                }
                _ => None,
            }
        };
        if let Some(delay) = reenumerated {
            announce(&self.signal, delay);
        }
    }
}

struct SimReadiness {
    bus: Arc<Mutex<Bus>>,
    index: usize,
    generation: u64,
}

impl Pollable for SimReadiness {
    fn is_ready(&self) -> bool {
        let bus = lock(&self.bus);
        bus.boards
            .get(self.index)
            .map_or(true, |b| !b.alive(self.generation) || !b.output.is_empty())
    }
}

/// Raise the hotplug descriptor now, and again once a device kept away for
/// `delay` shows up.
fn announce(signal: &Arc<Signal>, delay: Duration) {
    signal.raise();
    if delay > Duration::from_secs(0) {
        let signal = signal.clone();
        thread::spawn(move || {
            thread::sleep(delay);
            signal.raise();
        });
    }
}

fn lock(bus: &Mutex<Bus>) -> MutexGuard<'_, Bus> {
    bus.lock().unwrap_or_else(|e| e.into_inner())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MODELS;
    use pretty_assertions::assert_eq;

    fn open_first(platform: &mut SimulatedPlatform) -> Box<dyn DeviceHandle> {
        let devices = platform.enumerate().unwrap();
        platform.open(&devices[0], 115_200).unwrap()
    }

    #[test]
    fn touch_reboots_into_the_bootloader() {
        let (mut platform, sim) = simulator();
        sim.plug(&MODELS[0], "1234", "1-1");

        let mut handle = open_first(&mut platform);
        handle.set_control(TOUCH_RATE, false).unwrap();
        drop(handle);

        assert!(sim.in_bootloader("1-1"));
        assert_eq!(sim.reboot_requests("1-1"), 1);
        let devices = platform.enumerate().unwrap();
        assert_eq!(devices[0].serial, None);
        assert_eq!(devices[0].pid, MODELS[0].bootloader_id.pid);
    }

    #[test]
    fn stuck_board_ignores_the_touch() {
        let (mut platform, sim) = simulator();
        sim.plug(&MODELS[0], "1234", "1-1");
        sim.set_stuck("1-1", true);

        let mut handle = open_first(&mut platform);
        handle.set_control(TOUCH_RATE, false).unwrap();
        drop(handle);

        assert!(!sim.in_bootloader("1-1"));
        assert_eq!(sim.reboot_requests("1-1"), 1);
    }

    #[test]
    fn application_serial_traffic() {
        let (mut platform, sim) = simulator();
        sim.plug(&MODELS[0], "1234", "1-1");
        sim.print("1-1", b"hello");

        let mut handle = open_first(&mut platform);
        let mut buf = [0u8; 16];
        let n = handle.read(&mut buf, Duration::from_millis(10)).unwrap();
        assert_eq!(&buf[..n], b"hello");

        handle.write(b"ping").unwrap();
        assert_eq!(sim.received("1-1"), b"ping".to_vec());
    }

    #[test]
    fn bootloader_exit_waits_for_the_acknowledgement() {
        let (mut platform, sim) = simulator();
        sim.plug_bootloader(&MODELS[0], "1234", "1-1");

        let mut handle = open_first(&mut platform);
        handle.write(b"E").unwrap();
        assert!(sim.in_bootloader("1-1"));

        let mut buf = [0u8; 1];
        assert_eq!(handle.read(&mut buf, Duration::from_millis(10)).unwrap(), 1);
        assert_eq!(buf[0], b'\r');
        assert!(!sim.in_bootloader("1-1"));
        assert!(handle.read(&mut buf, Duration::from_millis(10)).is_err());
    }

    #[test]
    fn unknown_commands_are_rejected() {
        let (mut platform, sim) = simulator();
        sim.plug_bootloader(&MODELS[0], "1234", "1-1");

        let mut handle = open_first(&mut platform);
        handle.write(b"Z").unwrap();
        let mut buf = [0u8; 1];
        handle.read(&mut buf, Duration::from_millis(10)).unwrap();
        assert_eq!(buf[0], b'?');
    }

    #[test]
    fn reenumeration_delay_hides_the_device() {
        let (mut platform, sim) = simulator();
        sim.plug(&MODELS[0], "1234", "1-1");
        sim.set_reenumeration_delay("1-1", Duration::from_millis(50));
        sim.press_button("1-1");

        assert!(platform.enumerate().unwrap().is_empty());
        let descriptor = platform.descriptor();
        assert!(!descriptor.is_ready());

        thread::sleep(Duration::from_millis(80));
        assert!(descriptor.is_ready());
        assert_eq!(platform.enumerate().unwrap().len(), 1);
        assert_eq!(sim.enumerations(), 2);
    }

    #[test]
    fn rejected_exit_keeps_the_bootloader() {
        let (mut platform, sim) = simulator();
        sim.plug_bootloader(&MODELS[0], "1234", "1-1");
        sim.reject_exit("1-1", true);

        let mut handle = open_first(&mut platform);
        handle.write(b"E").unwrap();
        let mut buf = [0u8; 1];
        handle.read(&mut buf, Duration::from_millis(10)).unwrap();
        assert_eq!(buf[0], b'?');
        drop(handle);
        assert!(sim.in_bootloader("1-1"));
    }

    #[test]
    fn failed_opens_are_counted() {
        let (mut platform, sim) = simulator();
        sim.plug(&MODELS[0], "1234", "1-1");
        sim.set_deny_open(true);

        let devices = platform.enumerate().unwrap();
        let err = platform.open(&devices[0], 115_200).err().unwrap();
        assert_eq!(err.kind(), crate::ErrorKind::Access);
        assert_eq!(sim.open_count("1-1"), 1);
    }
}
