//! Board manager: reconciles the platform device list into [`Board`]s and
//! notifies observers.
//!
//! The manager itself is single-threaded. [`BoardManager::refresh`] runs
//! synchronously on the calling thread and [`BoardManager::wait`] is the only
//! call that blocks, bounded by its timeout. Share it as a
//! [`SharedManager`] when another thread (an upload task) needs to refresh it
//! too.
//!
//! Each refresh fires at most one event per discrepancy, in discovery order.
//! The events of one board always follow
//! `Added (Closed? Changed)* Closed? Dropped?`.
//!
//! **Example**
//! ```
//! use boardctl::platform::sim::simulator;
//! use boardctl::registry::find_model;
//! use boardctl::{BoardEvent, BoardManager, Settings};
//!
//! let (platform, controller) = simulator();
//! let mut manager = BoardManager::new(Box::new(platform), Settings::default());
//! manager.register_callback(|board, event| {
//!     println!("{} {}", board.tag(), event);
//!     0
//! });
//!
//! controller.plug(find_model("micro").unwrap(), "17", "usb-1-1");
//! assert_eq!(manager.refresh().unwrap(), 1);
//! assert!(manager.find("17").is_some());
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};

use crate::board::{Board, BoardEvent, BoardState};
use crate::capability::Capability;
use crate::descriptor::{DescriptorSet, Timeout};
use crate::error::{Error, Result};
use crate::platform::serial::SerialPlatform;
use crate::platform::{Platform, RawDevice};
use crate::registry::{self, BoardMode, BoardModel};
use crate::settings::Settings;

/// Longest slice [`wait_for`] holds the manager lock for.
const WAIT_SLICE: Duration = Duration::from_millis(50);

// =============================================================================
// Public Interface
// =============================================================================

/// Observer of board events. A negative return value stops the remaining
/// observers from seeing the event.
pub type Callback = dyn FnMut(&Arc<Board>, BoardEvent) -> i32 + Send;

/// A board manager shared between threads.
pub type SharedManager = Arc<Mutex<BoardManager>>;

/// The registered observers of a manager.
///
/// It is a cheap handle to the list, which allows a callback to deregister
/// itself or other observers while an event is being dispatched. A dispatch
/// works on the list as it was when the event was fired.
#[derive(Clone, Default)]
pub struct Callbacks {
    inner: Arc<Mutex<CallbackList>>,
}

impl Callbacks {
    /// Register `callback` and return its id.
    pub fn register<F>(&self, callback: F) -> u32
    where
        F: FnMut(&Arc<Board>, BoardEvent) -> i32 + Send + 'static,
    {
        let mut list = self.list();
        list.next_id += 1;
        let id = list.next_id;
        list.entries.push((id, Arc::new(Mutex::new(Box::new(callback)))));
        id
    }

    /// Remove the observer `id`. Returns `false` when no such observer exists.
    pub fn deregister(&self, id: u32) -> bool {
        let mut list = self.list();
        let before = list.entries.len();
        list.entries.retain(|(entry, _)| *entry != id);
        list.entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.list().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn dispatch(&self, board: &Arc<Board>, event: BoardEvent) {
        let snapshot: Vec<_> = self.list().entries.iter().cloned().collect();
        for (id, callback) in snapshot {
            let mut callback = callback.lock().unwrap_or_else(|e| e.into_inner());
            let status = (*callback)(board, event);
            if status < 0 {
                trace!("Observer {} stopped dispatch of {} ({})", id, event, status);
                break;
            }
        }
    }

    fn list(&self) -> MutexGuard<'_, CallbackList> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct BoardManager {
    platform: Box<dyn Platform>,
    settings: Settings,
    boards: Vec<Arc<Board>>,
    /// Last serial number seen at each USB location, for devices that cannot
    /// report it in their current mode.
    locations: HashMap<String, u64>,
    callbacks: Callbacks,
}

impl BoardManager {
    pub fn new(platform: Box<dyn Platform>, settings: Settings) -> Self {
        BoardManager {
            platform,
            settings,
            boards: vec![],
            locations: HashMap::new(),
            callbacks: Callbacks::default(),
        }
    }

    /// A manager for the USB serial ports of this system.
    pub fn with_serial_ports(settings: Settings) -> Result<Self> {
        let platform = SerialPlatform::new(&settings)?;
        Ok(BoardManager::new(Box::new(platform), settings))
    }

    /// Wrap the manager for use from several threads.
    pub fn shared(self) -> SharedManager {
        Arc::new(Mutex::new(self))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn register_callback<F>(&self, callback: F) -> u32
    where
        F: FnMut(&Arc<Board>, BoardEvent) -> i32 + Send + 'static,
    {
        self.callbacks.register(callback)
    }

    pub fn deregister_callback(&self, id: u32) -> bool {
        self.callbacks.deregister(id)
    }

    /// Handle to the observer list, usable from inside a callback.
    pub fn callbacks(&self) -> Callbacks {
        self.callbacks.clone()
    }

    /// Re-enumerate the attached devices and reconcile them with the known
    /// boards, firing one event per discrepancy.
    ///
    /// Returns the number of known boards.
    pub fn refresh(&mut self) -> Result<usize> {
        self.reconcile()?;
        Ok(self.boards.len())
    }

    /// Wait for a hotplug notification, then refresh.
    ///
    /// With [`Timeout::Poll`] the descriptors are checked once. Otherwise the
    /// call returns as soon as a refresh fires at least one event, or when
    /// the timeout expires. Returns the number of events fired; zero on
    /// timeout.
    pub fn wait(&mut self, timeout: Timeout) -> Result<usize> {
        let mut set = DescriptorSet::new();
        self.get_descriptors(&mut set, 1);

        if let Timeout::Poll = timeout {
            return match set.poll(Timeout::Poll) {
                Some(_) => self.reconcile(),
                None => Ok(0),
            };
        }

        let deadline = timeout.deadline(Instant::now());
        let mut swept = false;
        loop {
            let now = Instant::now();
            let remaining = match deadline {
                Some(deadline) if deadline <= now => return Ok(0),
                Some(deadline) => Some(deadline - now),
                None => None,
            };
            // Wake up in time to drop boards whose grace period expires. A
            // deadline already in the past only gets one refresh.
            let pending_drop = match self.next_drop_deadline() {
                Some(drop_at) if drop_at > now => Some(drop_at - now),
                Some(_) if !swept => Some(Duration::from_secs(0)),
                _ => None,
            };
            let slice = match (remaining, pending_drop) {
                (Some(a), Some(b)) => Timeout::After(a.min(b)),
                (Some(a), None) => Timeout::After(a),
                (None, Some(b)) => Timeout::After(b),
                (None, None) => Timeout::Infinite,
            };

            let ready = set.poll(slice).is_some();
            if ready || pending_drop.is_some() {
                swept = true;
                let events = self.reconcile()?;
                if events > 0 {
                    return Ok(events);
                }
            }
        }
    }

    /// Call `f` once per known board, in registry order.
    pub fn list<F: FnMut(&Arc<Board>)>(&self, mut f: F) {
        for board in &self.boards {
            f(board);
        }
    }

    pub fn boards(&self) -> Vec<Arc<Board>> {
        self.boards.clone()
    }

    /// The first board matching `tag`; see [`Board::matches_tag`].
    pub fn find(&self, tag: &str) -> Option<Arc<Board>> {
        self.boards.iter().find(|b| b.matches_tag(tag)).cloned()
    }

    /// Add the manager's hotplug descriptors to `set`, tagged with `id`.
    pub fn get_descriptors(&self, set: &mut DescriptorSet, id: i32) {
        set.add(self.platform.descriptor(), id);
    }
}

impl fmt::Debug for BoardManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoardManager")
            .field("boards", &self.boards)
            .field("observers", &self.callbacks.len())
            .finish()
    }
}

/// Block until `board` is online with `capability`.
///
/// The manager is refreshed in short slices, and its lock released between
/// them, so other threads keep access to it. `cancel` is checked at every
/// slice. The board is not dropped while it is awaited, however long its
/// device stays away.
pub fn wait_for(
    manager: &Mutex<BoardManager>,
    board: &Arc<Board>,
    capability: Capability,
    timeout: Duration,
    cancel: &AtomicBool,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let _hold = board.hold();
    loop {
        if cancel.load(Ordering::SeqCst) {
            return Err(Error::Cancelled { written: 0 });
        }
        match board.state() {
            BoardState::Dropped => {
                return Err(Error::NotFound(format!("board {} disappeared", board.tag())))
            }
            BoardState::Online if board.has_capability(capability) => return Ok(()),
            _ => {}
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(Error::UploadTimeout(format!(
                "board {} to be ready for '{}'",
                board.tag(),
                capability
            )));
        }
        let slice = WAIT_SLICE.min(deadline - now);
        lock_manager(manager).wait(Timeout::After(slice))?;
    }
}

// =============================================================================
// Crate-Public Interface
// =============================================================================

pub(crate) fn lock_manager(manager: &Mutex<BoardManager>) -> MutexGuard<'_, BoardManager> {
    manager.lock().unwrap_or_else(|e| e.into_inner())
}

/// Serial number from a USB serial string: decimal, else hexadecimal, else
/// a hash of the string.
pub(crate) fn parse_serial(serial: &str) -> u64 {
    let serial = serial.trim();
    if let Ok(n) = serial.parse::<u64>() {
        return n;
    }
    if !serial.is_empty() && serial.len() <= 16 && serial.chars().all(|c| c.is_ascii_hexdigit()) {
        if let Ok(n) = u64::from_str_radix(serial, 16) {
            return n;
        }
    }
    fnv1a(serial.as_bytes())
}

/// Stand-in serial number for a device at `location` that never reported
/// one. The high bit keeps it apart from parsed serial numbers of real
/// boards.
pub(crate) fn synthetic_serial(location: &str) -> u64 {
    fnv1a(location.as_bytes()) | (1 << 63)
}

// =============================================================================
// Private stuff
// =============================================================================

#[derive(Default)]
struct CallbackList {
    next_id: u32,
    entries: Vec<(u32, Arc<Mutex<Box<Callback>>>)>,
}

fn fnv1a(data: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    data.iter().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(PRIME)
    })
}

struct Sighting {
    serial: u64,
    model: &'static BoardModel,
    mode: &'static BoardMode,
    device: RawDevice,
}

impl BoardManager {
    /// One reconciliation pass. Returns the number of events fired.
    fn reconcile(&mut self) -> Result<usize> {
        let devices = self.platform.enumerate()?;
        let now = Instant::now();
        trace!("Enumerated {} devices", devices.len());

        let mut claimed = HashSet::new();
        let mut sightings = vec![];
        for device in devices {
            let (model, mode) = match registry::identify(&device) {
                Some(found) => found,
                None => {
                    trace!("Ignoring unknown device {}", device);
                    continue;
                }
            };
            let serial = self.resolve_serial(&device, mode);
            if !claimed.insert(serial) {
                warn!(
                    "Ignoring {}: serial number {} is already claimed by another device",
                    device, serial
                );
                continue;
            }
            sightings.push(Sighting {
                serial,
                model,
                mode,
                device,
            });
        }

        let mut events = 0;
        for sighting in sightings {
            let known = self
                .boards
                .iter()
                .find(|b| b.serial_number() == sighting.serial)
                .cloned();
            events += match known {
                Some(board) => self.update_board(&board, sighting, now),
                None => self.add_board(sighting),
            };
        }

        let mut dropped = vec![];
        for board in &self.boards {
            if claimed.contains(&board.serial_number()) {
                continue;
            }
            let since = board.mark_missing(now);
            events += self.announce_closed(board);
            if now.saturating_duration_since(since) >= self.settings.drop_delay {
                if board.is_held() {
                    trace!("Keeping board {}, it is awaited", board.tag());
                    continue;
                }
                board.mark_dropped();
                self.emit(board, BoardEvent::Dropped);
                events += 1;
                dropped.push(board.serial_number());
            }
        }
        self.boards.retain(|b| !dropped.contains(&b.serial_number()));

        Ok(events)
    }

    fn add_board(&mut self, sighting: Sighting) -> usize {
        let board = Arc::new(Board::new(
            sighting.serial,
            Some(sighting.model),
            sighting.mode,
            sighting.device.clone(),
            self.settings.io_timeout,
        ));
        self.open_board(&board, &sighting.device);
        self.boards.push(board.clone());
        self.emit(&board, BoardEvent::Added);
        1
    }

    fn update_board(&self, board: &Arc<Board>, sighting: Sighting, now: Instant) -> usize {
        let changed = board.device() != sighting.device
            || board.mode() != sighting.mode
            || board.model() != Some(sighting.model);
        let returned = board.missing_since().is_some();
        board.mark_present();

        match board.state() {
            BoardState::Online if !changed => return 0,
            BoardState::Online => board.close(),
            BoardState::Closed => {
                let parked = board
                    .parked_since()
                    .map_or(false, |t| now.saturating_duration_since(t) < self.settings.drop_delay);
                if parked && !changed && !returned {
                    return self.announce_closed(board);
                }
            }
            BoardState::Dropped => return 0,
        }

        let mut events = self.announce_closed(board);
        board.reclassify(Some(sighting.model), sighting.mode, sighting.device.clone());
        if self.open_board(board, &sighting.device) {
            self.emit(board, BoardEvent::Changed);
            events += 1;
        }
        events
    }

    /// Fire `Closed` once for a board that left the `Online` state.
    fn announce_closed(&self, board: &Arc<Board>) -> usize {
        match board.last_event() {
            Some(BoardEvent::Closed) | Some(BoardEvent::Dropped) => 0,
            _ => {
                self.emit(board, BoardEvent::Closed);
                1
            }
        }
    }

    fn open_board(&self, board: &Board, device: &RawDevice) -> bool {
        match self.platform.open(device, self.settings.serial_rate) {
            Ok(handle) => {
                board.attach(handle);
                true
            }
            Err(err) => {
                warn!("Cannot open {} for board {}: {}", device, board.serial_number(), err);
                false
            }
        }
    }

    fn emit(&self, board: &Arc<Board>, event: BoardEvent) {
        info!("Board {} {} ({})", board.tag(), event, board.mode());
        board.set_last_event(event);
        self.callbacks.dispatch(board, event);
    }

    fn resolve_serial(&mut self, device: &RawDevice, mode: &BoardMode) -> u64 {
        if mode.self_identifying {
            if let Some(serial) = device.serial.as_deref() {
                let serial = parse_serial(serial);
                self.locations.insert(device.location.clone(), serial);
                return serial;
            }
        }
        if let Some(serial) = self.locations.get(&device.location) {
            return *serial;
        }
        let serial = synthetic_serial(&device.location);
        warn!(
            "{} does not report a serial number, using {:#018x}",
            device, serial
        );
        self.locations.insert(device.location.clone(), serial);
        serial
    }

    fn next_drop_deadline(&self) -> Option<Instant> {
        self.boards
            .iter()
            .filter(|b| !b.is_held())
            .filter_map(|b| b.missing_since())
            .map(|since| since + self.settings.drop_delay)
            .min()
    }
}

impl Drop for BoardManager {
    fn drop(&mut self) {
        debug!("Closing {} boards", self.boards.len());
        for board in &self.boards {
            board.close();
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::sim::{simulator, SimController};
    use crate::registry::find_model;
    use crate::settings::SettingsBuilder;
    use pretty_assertions::assert_eq;

    type Log = Arc<Mutex<Vec<(u64, BoardEvent)>>>;

    fn manager(drop_delay: Duration) -> (BoardManager, SimController, Log) {
        let (platform, controller) = simulator();
        let settings = SettingsBuilder::new().drop_delay(drop_delay).finalize();
        let manager = BoardManager::new(Box::new(platform), settings);
        let log: Log = Arc::default();
        let sink = log.clone();
        manager.register_callback(move |board, event| {
            sink.lock().unwrap().push((board.serial_number(), event));
            0
        });
        (manager, controller, log)
    }

    fn events(log: &Log) -> Vec<(u64, BoardEvent)> {
        std::mem::take(&mut *log.lock().unwrap())
    }

    #[test]
    fn serial_numbers() {
        assert_eq!(parse_serial("12345"), 12345);
        assert_eq!(parse_serial("8D3A1F"), 0x8d3a1f);
        assert_eq!(parse_serial("HIDFG"), fnv1a(b"HIDFG"));
        assert_eq!(fnv1a(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a(b"a"), 0xaf63_dc4c_8601_ec8c);
        assert!(synthetic_serial("usb-1-2") & (1 << 63) != 0);
    }

    #[test]
    fn board_lifecycle_events() {
        let (mut manager, controller, log) = manager(Duration::from_millis(0));
        let leonardo = find_model("leonardo").unwrap();

        controller.plug(leonardo, "42", "usb-1");
        assert_eq!(manager.refresh().unwrap(), 1);
        assert_eq!(events(&log), vec![(42, BoardEvent::Added)]);
        let board = manager.find("42").unwrap();
        assert_eq!(board.state(), BoardState::Online);

        assert_eq!(manager.refresh().unwrap(), 1);
        assert_eq!(events(&log), vec![]);

        controller.unplug("usb-1");
        assert_eq!(manager.refresh().unwrap(), 0);
        assert_eq!(
            events(&log),
            vec![(42, BoardEvent::Closed), (42, BoardEvent::Dropped)]
        );
        assert_eq!(board.state(), BoardState::Dropped);

        manager.refresh().unwrap();
        assert_eq!(events(&log), vec![]);
    }

    #[test]
    fn grace_period_keeps_the_board() {
        let (mut manager, controller, log) = manager(Duration::from_secs(60));
        let micro = find_model("micro").unwrap();

        controller.plug(micro, "7", "usb-2");
        manager.refresh().unwrap();
        let board = manager.find("7").unwrap();

        controller.unplug("usb-2");
        assert_eq!(manager.refresh().unwrap(), 1);
        assert_eq!(board.state(), BoardState::Closed);

        controller.plug(micro, "7", "usb-2");
        manager.refresh().unwrap();
        assert_eq!(board.state(), BoardState::Online);
        assert!(Arc::ptr_eq(&board, &manager.find("7").unwrap()));
        assert_eq!(
            events(&log),
            vec![
                (7, BoardEvent::Added),
                (7, BoardEvent::Closed),
                (7, BoardEvent::Changed)
            ]
        );
    }

    #[test]
    fn bootloader_keeps_the_board_identity() {
        let (mut manager, controller, log) = manager(Duration::from_secs(60));
        let leonardo = find_model("leonardo").unwrap();

        controller.plug(leonardo, "1001", "usb-3");
        manager.refresh().unwrap();
        let board = manager.find("1001").unwrap();

        controller.press_button("usb-3");
        manager.refresh().unwrap();
        assert_eq!(board.mode().name, "bootloader");
        assert!(board.has_capability(Capability::Upload));

        board.reset().unwrap();
        manager.refresh().unwrap();
        assert_eq!(board.mode().name, "application");
        assert_eq!(board.state(), BoardState::Online);
        assert_eq!(manager.boards().len(), 1);
        assert!(Arc::ptr_eq(&board, &manager.find("1001").unwrap()));

        assert_eq!(
            events(&log),
            vec![
                (1001, BoardEvent::Added),
                (1001, BoardEvent::Closed),
                (1001, BoardEvent::Changed),
                (1001, BoardEvent::Closed),
                (1001, BoardEvent::Changed),
            ]
        );
    }

    #[test]
    fn duplicate_serial_first_wins() {
        let (mut manager, controller, log) = manager(Duration::from_secs(60));
        let leonardo = find_model("leonardo").unwrap();

        controller.plug(leonardo, "5", "usb-1");
        controller.plug_raw(RawDevice {
            vid: 0x2341,
            pid: 0x8036,
            serial: Some("5".into()),
            location: "usb-9".into(),
            path: "/dev/ttyDUP".into(),
        });
        assert_eq!(manager.refresh().unwrap(), 1);
        assert_eq!(manager.find("5").unwrap().path(), "/dev/ttySIM0");
        assert_eq!(events(&log), vec![(5, BoardEvent::Added)]);
    }

    #[test]
    fn unknown_devices_are_ignored() {
        let (mut manager, controller, log) = manager(Duration::from_secs(60));
        controller.plug_raw(RawDevice {
            vid: 0x1a86,
            pid: 0x7523,
            serial: None,
            location: "usb-4".into(),
            path: "/dev/ttyUSB0".into(),
        });
        assert_eq!(manager.refresh().unwrap(), 0);
        assert_eq!(events(&log), vec![]);
    }

    #[test]
    fn enumeration_failure_is_reported() {
        let (mut manager, controller, _log) = manager(Duration::from_secs(60));
        controller.set_enumeration_failure(true);
        assert_eq!(manager.refresh().unwrap_err().kind(), crate::ErrorKind::System);
    }

    #[test]
    fn open_failure_leaves_the_board_closed() {
        let (mut manager, controller, log) = manager(Duration::from_secs(60));
        controller.set_deny_open(true);
        controller.plug(find_model("esplora").unwrap(), "3", "usb-5");
        manager.refresh().unwrap();
        let board = manager.find("3").unwrap();
        assert_eq!(board.state(), BoardState::Closed);
        assert_eq!(controller.open_count("usb-5"), 1);

        // One new attempt per refresh
        manager.refresh().unwrap();
        assert_eq!(controller.open_count("usb-5"), 2);
        assert_eq!(board.state(), BoardState::Closed);

        controller.set_deny_open(false);
        manager.refresh().unwrap();
        assert_eq!(controller.open_count("usb-5"), 3);
        assert_eq!(board.state(), BoardState::Online);
        assert_eq!(
            events(&log),
            vec![
                (3, BoardEvent::Added),
                (3, BoardEvent::Closed),
                (3, BoardEvent::Changed)
            ]
        );
    }

    /// Unplug, then plug the board back while it cannot be opened.
    fn replug_unopenable(manager: &mut BoardManager, controller: &SimController) -> Arc<Board> {
        let micro = find_model("micro").unwrap();
        controller.plug(micro, "21", "usb-1");
        manager.refresh().unwrap();
        let board = manager.find("21").unwrap();
        controller.unplug("usb-1");
        manager.refresh().unwrap();
        controller.set_deny_open(true);
        controller.plug(micro, "21", "usb-1");
        manager.refresh().unwrap();
        assert_eq!(board.state(), BoardState::Closed);
        board
    }

    #[test]
    fn failed_reopen_restarts_the_grace_period() {
        let (mut manager, controller, log) = manager(Duration::from_millis(200));
        let board = replug_unopenable(&mut manager, &controller);

        std::thread::sleep(Duration::from_millis(300));
        controller.unplug("usb-1");
        manager.refresh().unwrap();
        assert_eq!(board.state(), BoardState::Closed);
        assert!(manager.find("21").is_some());
        assert_eq!(
            events(&log),
            vec![(21, BoardEvent::Added), (21, BoardEvent::Closed)]
        );

        std::thread::sleep(Duration::from_millis(250));
        manager.refresh().unwrap();
        assert_eq!(events(&log), vec![(21, BoardEvent::Dropped)]);
        assert_eq!(board.state(), BoardState::Dropped);
    }

    #[test]
    fn present_but_unopenable_board_does_not_spin_wait() {
        let (mut manager, controller, _log) = manager(Duration::from_millis(50));
        replug_unopenable(&mut manager, &controller);
        std::thread::sleep(Duration::from_millis(100));

        let before = controller.enumerations();
        let start = Instant::now();
        assert_eq!(manager.wait(Timeout::After(Duration::from_millis(200))).unwrap(), 0);
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert!(controller.enumerations() - before <= 1);
    }

    #[test]
    fn awaited_board_outlives_the_grace_period() {
        let (manager, controller, log) = manager(Duration::from_millis(20));
        controller.plug(find_model("leonardo").unwrap(), "31", "usb-1");
        controller.set_reenumeration_delay("usb-1", Duration::from_millis(150));
        let manager = Mutex::new(manager);
        lock_manager(&manager).refresh().unwrap();
        let board = lock_manager(&manager).find("31").unwrap();
        let cancel = AtomicBool::new(false);

        board.reboot().unwrap();
        wait_for(&manager, &board, Capability::Upload, Duration::from_secs(2), &cancel).unwrap();

        assert!(Arc::ptr_eq(&board, &lock_manager(&manager).find("31").unwrap()));
        assert_eq!(
            events(&log),
            vec![
                (31, BoardEvent::Added),
                (31, BoardEvent::Closed),
                (31, BoardEvent::Changed)
            ]
        );

        // Without a waiter, the grace period applies again.
        controller.unplug("usb-1");
        lock_manager(&manager).refresh().unwrap();
        std::thread::sleep(Duration::from_millis(40));
        lock_manager(&manager).refresh().unwrap();
        assert_eq!(board.state(), BoardState::Dropped);
    }

    #[test]
    fn scripted_hotplug_sequences_follow_the_event_grammar() {
        let (platform, controller) = simulator();
        let settings = SettingsBuilder::new()
            .drop_delay(Duration::from_millis(5))
            .finalize();
        let mut manager = BoardManager::new(Box::new(platform), settings);
        let log: Arc<Mutex<Vec<(Arc<Board>, BoardEvent)>>> = Arc::default();
        let sink = log.clone();
        manager.register_callback(move |board, event| {
            sink.lock().unwrap().push((board.clone(), event));
            0
        });

        let models = ["leonardo", "micro", "esplora"];
        let locations = ["usb-1", "usb-2", "usb-3"];
        // xorshift64, fixed seed for a reproducible script
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        let mut next = |bound: u64| {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed % bound
        };
        for _ in 0..400 {
            let slot = next(3) as usize;
            let model = find_model(models[slot]).unwrap();
            let location = locations[slot];
            match next(7) {
                0 | 1 => controller.plug(model, &(slot + 1).to_string(), location),
                2 => controller.unplug(location),
                3 => controller.press_button(location),
                4 => {
                    if let Some(board) = manager.find(location) {
                        board.release();
                    }
                }
                5 => controller.set_deny_open(next(4) == 0),
                _ => std::thread::sleep(Duration::from_millis(6)),
            }
            manager.refresh().unwrap();
        }

        let log = log.lock().unwrap();
        let mut streams: Vec<(Arc<Board>, Vec<BoardEvent>)> = vec![];
        for (board, event) in log.iter() {
            match streams.iter_mut().find(|(known, _)| Arc::ptr_eq(known, board)) {
                Some((_, stream)) => stream.push(*event),
                None => streams.push((board.clone(), vec![*event])),
            }
        }
        assert!(streams.len() >= 3, "{} boards seen", streams.len());

        for (board, stream) in &streams {
            assert_eq!(stream[0], BoardEvent::Added, "{}: {:?}", board, stream);
            for pair in stream.windows(2) {
                match (pair[0], pair[1]) {
                    (BoardEvent::Dropped, _) => panic!("{}: event after Dropped {:?}", board, stream),
                    (_, BoardEvent::Added) => panic!("{}: Added twice {:?}", board, stream),
                    (BoardEvent::Closed, BoardEvent::Closed) => {
                        panic!("{}: Closed twice in a row {:?}", board, stream)
                    }
                    _ => {}
                }
            }
            let dropped = stream.iter().filter(|e| **e == BoardEvent::Dropped).count();
            assert!(dropped <= 1, "{}: {:?}", board, stream);
            assert_eq!(dropped == 1, board.state() == BoardState::Dropped);
        }
        for board in manager.boards() {
            assert_ne!(board.state(), BoardState::Dropped);
        }
    }

    #[test]
    fn negative_callback_stops_the_chain() {
        let (mut manager, controller, log) = manager(Duration::from_secs(60));
        let second: Log = Arc::default();
        let sink = second.clone();
        let blocker = manager.register_callback(|_, _| -1);
        manager.register_callback(move |board, event| {
            sink.lock().unwrap().push((board.serial_number(), event));
            0
        });

        controller.plug(find_model("micro").unwrap(), "9", "usb-6");
        manager.refresh().unwrap();
        assert_eq!(events(&log), vec![(9, BoardEvent::Added)]);
        assert_eq!(events(&second), vec![]);

        assert!(manager.deregister_callback(blocker));
        assert!(!manager.deregister_callback(blocker));
        controller.unplug("usb-6");
        manager.refresh().unwrap();
        assert_eq!(events(&second), vec![(9, BoardEvent::Closed)]);
    }

    #[test]
    fn deregistering_during_dispatch() {
        let (mut manager, controller, _log) = manager(Duration::from_secs(60));
        let callbacks = manager.callbacks();
        let calls = Arc::new(Mutex::new(0));

        let counter = calls.clone();
        let victim = Arc::new(Mutex::new(0u32));
        let victim_id = victim.clone();
        manager.register_callback(move |_, _| {
            callbacks.deregister(*victim_id.lock().unwrap());
            0
        });
        let id = manager.register_callback(move |_, _| {
            *counter.lock().unwrap() += 1;
            0
        });
        *victim.lock().unwrap() = id;

        let micro = find_model("micro").unwrap();
        controller.plug(micro, "1", "usb-7");
        controller.plug(micro, "2", "usb-8");
        manager.refresh().unwrap();

        // The first event is still delivered to the observer removed during
        // its dispatch, the second one is not.
        assert_eq!(*calls.lock().unwrap(), 1);
        assert_eq!(manager.callbacks().len(), 2);
    }

    #[test]
    fn wait_poll_returns_immediately() {
        let (mut manager, controller, _log) = manager(Duration::from_secs(60));
        let start = Instant::now();
        assert_eq!(manager.wait(Timeout::Poll).unwrap(), 0);
        assert!(start.elapsed() < Duration::from_millis(50));
        assert_eq!(controller.enumerations(), 0);

        controller.plug(find_model("micro").unwrap(), "11", "usb-1");
        assert_eq!(manager.wait(Timeout::Poll).unwrap(), 1);
    }

    #[test]
    fn wait_times_out_without_events() {
        let (mut manager, _controller, _log) = manager(Duration::from_secs(60));
        let start = Instant::now();
        assert_eq!(manager.wait(Timeout::After(Duration::from_millis(30))).unwrap(), 0);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn wait_infinite_returns_on_event() {
        let (mut manager, controller, _log) = manager(Duration::from_secs(60));
        let plugger = controller.clone();
        let thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            plugger.notify();
            std::thread::sleep(Duration::from_millis(20));
            plugger.plug(find_model("leonardo").unwrap(), "77", "usb-1");
        });
        assert_eq!(manager.wait(Timeout::Infinite).unwrap(), 1);
        assert!(manager.find("77").is_some());
        thread.join().unwrap();
    }

    #[test]
    fn wait_wakes_up_for_pending_drops() {
        let (mut manager, controller, log) = manager(Duration::from_millis(20));
        controller.plug(find_model("micro").unwrap(), "8", "usb-1");
        manager.refresh().unwrap();
        controller.unplug("usb-1");
        manager.refresh().unwrap();
        events(&log);

        assert_eq!(manager.wait(Timeout::After(Duration::from_secs(5))).unwrap(), 1);
        assert_eq!(events(&log), vec![(8, BoardEvent::Dropped)]);
    }

    #[test]
    fn descriptors_are_tagged() {
        let (manager, controller, _log) = manager(Duration::from_secs(60));
        let mut set = DescriptorSet::new();
        manager.get_descriptors(&mut set, 7);
        assert_eq!(set.poll(Timeout::Poll), None);
        controller.notify();
        assert_eq!(set.poll(Timeout::Poll), Some(7));
    }

    #[test]
    fn wait_for_capability() {
        let (manager, controller, _log) = manager(Duration::from_secs(60));
        let manager = Mutex::new(manager);
        controller.plug(find_model("leonardo").unwrap(), "12", "usb-1");
        lock_manager(&manager).refresh().unwrap();
        let board = lock_manager(&manager).find("12").unwrap();
        let cancel = AtomicBool::new(false);

        wait_for(&manager, &board, Capability::Serial, Duration::from_millis(10), &cancel).unwrap();

        let err = wait_for(&manager, &board, Capability::Upload, Duration::from_millis(30), &cancel)
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::UploadTimeout);

        board.reboot().unwrap();
        wait_for(&manager, &board, Capability::Upload, Duration::from_secs(1), &cancel).unwrap();

        cancel.store(true, Ordering::SeqCst);
        let err = wait_for(&manager, &board, Capability::Serial, Duration::from_secs(1), &cancel)
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Cancelled);
    }
}
