//! Firmware upload task.
//!
//! [`upload`] validates its inputs on the calling thread, without touching
//! the hardware, then runs the upload sequence (reboot, wait for the
//! bootloader, flash and verify, reset) on a background thread. The returned
//! [`UploadTask`] can be polled, cancelled and joined.
//!
//! **Example**
//! ```no_run
//! use boardctl::{upload, BoardManager, Firmware, Settings, UploadOptions};
//!
//! let mut manager = BoardManager::with_serial_ports(Settings::default())?;
//! manager.refresh()?;
//! let board = manager.find("1234").expect("no such board");
//! let manager = manager.shared();
//!
//! let firmware = Firmware::load_binary("blink.bin")?;
//! let task = upload(&manager, &board, vec![firmware], UploadOptions::default())?;
//! let report = task.join()?;
//! println!("{} bytes written to a {}", report.size, report.model.desc);
//! # Ok::<(), boardctl::Error>(())
//! ```

mod events;
mod state_machine;
mod states;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::{debug, warn};

use crate::board::{Board, BoardState};
use crate::error::{Error, Result};
use crate::firmware::Firmware;
use crate::manager::{lock_manager, SharedManager};
use crate::registry::{self, BoardModel};
use crate::settings::Settings;

/// Most candidate images accepted by one upload.
pub const MAX_FIRMWARES: usize = 4;

// =============================================================================
// Public Interface
// =============================================================================

/// Flags of an upload.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct UploadOptions {
    /// Pick the first image built for the board model. When unset, the first
    /// image is flashed as is.
    pub check: bool,
    /// Restart the application once the image is verified.
    pub reset: bool,
    /// Do not reboot the board; wait for the user to start the bootloader.
    pub wait: bool,
}

impl Default for UploadOptions {
    fn default() -> Self {
        UploadOptions {
            check: true,
            reset: true,
            wait: false,
        }
    }
}

impl UploadOptions {
    pub fn no_check(mut self) -> Self {
        self.check = false;
        self
    }

    pub fn no_reset(mut self) -> Self {
        self.reset = false;
        self
    }

    pub fn wait_for_bootloader(mut self) -> Self {
        self.wait = true;
        self
    }
}

/// What happened after the image was verified.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ResetOutcome {
    /// The board came back in application mode.
    Confirmed,
    /// The reset was sent but the board did not come back in time.
    Unconfirmed,
    /// No reset was requested, or the task was cancelled before it.
    Skipped,
}

/// Summary of a successful upload.
#[derive(Debug, Clone)]
pub struct UploadReport {
    pub firmware: String,
    pub model: &'static BoardModel,
    pub size: usize,
    pub reset: ResetOutcome,
}

/// Progress of an upload task.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum UploadStatus {
    Pending,
    Rebooting,
    Uploading { written: usize, total: usize },
    Resetting,
    Finished,
    Failed,
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadStatus::Pending => f.write_str("pending"),
            UploadStatus::Rebooting => f.write_str("rebooting"),
            UploadStatus::Uploading { written, total } => {
                write!(f, "uploading ({}/{} bytes)", written, total)
            }
            UploadStatus::Resetting => f.write_str("resetting"),
            UploadStatus::Finished => f.write_str("finished"),
            UploadStatus::Failed => f.write_str("failed"),
        }
    }
}

/// A running upload.
///
/// Dropping the task without joining it cancels it and waits for the
/// background thread to stop.
pub struct UploadTask {
    cancel: Arc<AtomicBool>,
    status: Arc<Mutex<UploadStatus>>,
    thread: Option<JoinHandle<Result<UploadReport>>>,
}

impl UploadTask {
    /// Ask the task to stop. Hardware operations in progress finish their
    /// current block or wait slice; a partial transfer is not undone.
    pub fn cancel(&self) {
        debug!("Cancelling upload");
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn status(&self) -> UploadStatus {
        *lock_status(&self.status)
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.status(), UploadStatus::Finished | UploadStatus::Failed)
    }

    /// Block until the task completes and return its outcome.
    pub fn join(mut self) -> Result<UploadReport> {
        self.wait_thread()
    }

    fn wait_thread(&mut self) -> Result<UploadReport> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .unwrap_or_else(|_| Err(Error::System("upload task panicked".into()))),
            None => Err(Error::System("upload task already joined".into())),
        }
    }
}

impl Drop for UploadTask {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.cancel();
            if let Err(err) = self.wait_thread() {
                debug!("Dropped upload task ended with: {}", err);
            }
        }
    }
}

/// Start uploading one of `firmwares` to `board`.
///
/// Only the first [`MAX_FIRMWARES`] candidates are considered, the others
/// are ignored with a warning. Fails right away, without any hardware side
/// effect, when the candidate list is empty, when the board is gone, or when
/// no image is compatible with the board model (unless the check is
/// disabled).
pub fn upload(
    manager: &SharedManager,
    board: &Arc<Board>,
    mut firmwares: Vec<Firmware>,
    options: UploadOptions,
) -> Result<UploadTask> {
    if firmwares.is_empty() {
        return Err(Error::Param("no firmware to upload".into()));
    }
    if firmwares.len() > MAX_FIRMWARES {
        warn!(
            "Too many firmwares, considering only the first {} of {}",
            MAX_FIRMWARES,
            firmwares.len()
        );
        firmwares.truncate(MAX_FIRMWARES);
    }
    if board.state() == BoardState::Dropped {
        return Err(Error::NotFound(format!("board {} disappeared", board.tag())));
    }

    let firmware = if options.check {
        select_firmware(board, firmwares)?
    } else {
        firmwares.into_iter().next().ok_or_else(|| Error::Param("no firmware to upload".into()))?
    };

    let cancel = Arc::new(AtomicBool::new(false));
    let status = Arc::new(Mutex::new(UploadStatus::Pending));
    let context = UploadContext {
        settings: lock_manager(manager).settings().clone(),
        manager: manager.clone(),
        board: board.clone(),
        firmware: Arc::new(firmware),
        options,
        cancel: cancel.clone(),
        status: status.clone(),
    };

    let thread = thread::Builder::new()
        .name("boardctl-upload".into())
        .spawn(move || state_machine::execute(context))
        .map_err(|e| Error::System(format!("cannot start upload task: {}", e)))?;

    Ok(UploadTask {
        cancel,
        status,
        thread: Some(thread),
    })
}

// =============================================================================
// Private stuff
// =============================================================================

/// Everything the upload states share.
#[derive(Clone)]
pub(crate) struct UploadContext {
    pub settings: Settings,
    pub manager: SharedManager,
    pub board: Arc<Board>,
    pub firmware: Arc<Firmware>,
    pub options: UploadOptions,
    pub cancel: Arc<AtomicBool>,
    pub status: Arc<Mutex<UploadStatus>>,
}

impl UploadContext {
    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn set_status(&self, status: UploadStatus) {
        *lock_status(&self.status) = status;
    }
}

impl fmt::Debug for UploadContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadContext")
            .field("board", &self.board)
            .field("firmware", &self.firmware.name())
            .field("options", &self.options)
            .field("cancelled", &self.cancelled())
            .finish()
    }
}

fn lock_status(status: &Mutex<UploadStatus>) -> std::sync::MutexGuard<'_, UploadStatus> {
    status.lock().unwrap_or_else(|e| e.into_inner())
}

fn select_firmware(board: &Board, firmwares: Vec<Firmware>) -> Result<Firmware> {
    let model = board.model();
    let model_name = model.map_or("unknown", |m| m.name);
    for firmware in firmwares {
        match registry::test_firmware(&firmware) {
            Some(target) if Some(target) == model => return Ok(firmware),
            Some(target) => debug!(
                "'{}' targets {}, not {}",
                firmware.name(),
                target.name,
                model_name
            ),
            None => warn!("'{}' does not target any known model", firmware.name()),
        }
    }
    Err(Error::IncompatibleFirmware {
        model: model_name.to_owned(),
    })
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::BoardEvent;
    use crate::manager::BoardManager;
    use crate::platform::sim::{simulator, SimController};
    use crate::registry::find_model;
    use crate::settings::SettingsBuilder;
    use std::time::Duration;

    fn image_for(model: &str, len: usize) -> Firmware {
        let marker = find_model(model).unwrap().application_id.descriptor_marker();
        let mut image: Vec<u8> = (0..len).map(|i| (i % 199) as u8).collect();
        image[16..20].copy_from_slice(&marker);
        Firmware::new(format!("{}.bin", model), image)
    }

    fn setup(settings: Settings) -> (SharedManager, SimController, Arc<Board>) {
        let (platform, controller) = simulator();
        let mut manager = BoardManager::new(Box::new(platform), settings);
        controller.plug(find_model("leonardo").unwrap(), "4242", "usb-1-4");
        manager.refresh().unwrap();
        let board = manager.find("4242").unwrap();
        (manager.shared(), controller, board)
    }

    fn fast_settings() -> Settings {
        SettingsBuilder::new()
            .reboot_timeout(Duration::from_millis(300))
            .reset_timeout(Duration::from_secs(2))
            .io_timeout(Duration::from_millis(50))
            .finalize()
    }

    #[test]
    fn full_upload_sequence() {
        let (manager, controller, board) = setup(fast_settings());
        let firmware = image_for("leonardo", 1000);
        let expected = firmware.image().to_vec();

        let task = upload(&manager, &board, vec![firmware], UploadOptions::default()).unwrap();
        let report = task.join().unwrap();

        assert_eq!(report.model.name, "leonardo");
        assert_eq!(report.size, 1000);
        assert_eq!(report.reset, ResetOutcome::Confirmed);
        assert_eq!(&controller.flash("usb-1-4")[..1000], &expected[..]);
        assert_eq!(controller.reboot_requests("usb-1-4"), 1);
        assert!(!controller.in_bootloader("usb-1-4"));
        assert_eq!(board.mode().name, "application");
        assert!(Arc::ptr_eq(&board, &lock_manager(&manager).find("4242").unwrap()));
    }

    #[test]
    fn incompatible_firmware_touches_nothing() {
        let (manager, controller, board) = setup(fast_settings());
        let err = upload(
            &manager,
            &board,
            vec![image_for("micro", 512), image_for("esplora", 512)],
            UploadOptions::default(),
        )
        .err()
        .unwrap();
        assert_eq!(err.kind(), crate::ErrorKind::IncompatibleFirmware);
        assert_eq!(controller.reboot_requests("usb-1-4"), 0);
        assert_eq!(controller.blocks_written("usb-1-4"), 0);
    }

    #[test]
    fn first_compatible_firmware_is_selected() {
        let (manager, _controller, board) = setup(fast_settings());
        let task = upload(
            &manager,
            &board,
            vec![image_for("micro", 256), image_for("leonardo", 384)],
            UploadOptions::default().no_reset(),
        )
        .unwrap();
        let report = task.join().unwrap();
        assert_eq!(report.firmware, "leonardo.bin");
        assert_eq!(report.reset, ResetOutcome::Skipped);
        assert_eq!(board.mode().name, "bootloader");
    }

    #[test]
    fn no_check_flashes_the_first_image() {
        let (manager, controller, board) = setup(fast_settings());
        let blank = Firmware::new("blank.bin", vec![0x55; 200]);
        let report = upload(&manager, &board, vec![blank], UploadOptions::default().no_check())
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(report.firmware, "blank.bin");
        assert_eq!(&controller.flash("usb-1-4")[..200], &[0x55; 200][..]);
    }

    #[test]
    fn extra_candidates_are_ignored() {
        let (manager, controller, board) = setup(fast_settings());
        let err = upload(&manager, &board, vec![], UploadOptions::default()).err().unwrap();
        assert_eq!(err.kind(), crate::ErrorKind::Param);

        // The only leonardo image comes after the first MAX_FIRMWARES ones.
        let mut many: Vec<_> = (0..MAX_FIRMWARES).map(|_| image_for("micro", 64)).collect();
        many.push(image_for("leonardo", 64));
        let err = upload(&manager, &board, many, UploadOptions::default()).err().unwrap();
        assert_eq!(err.kind(), crate::ErrorKind::IncompatibleFirmware);
        assert_eq!(controller.reboot_requests("usb-1-4"), 0);

        let mut many: Vec<_> = (0..MAX_FIRMWARES).map(|_| image_for("leonardo", 64)).collect();
        many.push(image_for("micro", 64));
        let report = upload(&manager, &board, many, UploadOptions::default().no_reset())
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(report.firmware, "leonardo.bin");
    }

    #[test]
    fn slow_bootloader_keeps_the_board_identity() {
        let settings = SettingsBuilder::new()
            .drop_delay(Duration::from_millis(100))
            .reboot_timeout(Duration::from_secs(3))
            .reset_timeout(Duration::from_secs(3))
            .io_timeout(Duration::from_millis(50))
            .finalize();
        let (platform, controller) = simulator();
        let mut manager = BoardManager::new(Box::new(platform), settings);
        let log: Arc<Mutex<Vec<BoardEvent>>> = Arc::default();
        let sink = log.clone();
        manager.register_callback(move |_, event| {
            sink.lock().unwrap().push(event);
            0
        });
        controller.plug(find_model("leonardo").unwrap(), "4242", "usb-1-4");
        controller.set_reenumeration_delay("usb-1-4", Duration::from_millis(400));
        manager.refresh().unwrap();
        let board = manager.find("4242").unwrap();
        let manager = manager.shared();

        let report = upload(
            &manager,
            &board,
            vec![image_for("leonardo", 512)],
            UploadOptions::default(),
        )
        .unwrap()
        .join()
        .unwrap();

        assert_eq!(report.reset, ResetOutcome::Confirmed);
        assert_eq!(board.state(), BoardState::Online);
        assert_eq!(board.mode().name, "application");
        assert!(Arc::ptr_eq(&board, &lock_manager(&manager).find("4242").unwrap()));
        assert_eq!(lock_manager(&manager).boards().len(), 1);
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                BoardEvent::Added,
                BoardEvent::Closed,
                BoardEvent::Changed,
                BoardEvent::Closed,
                BoardEvent::Changed,
            ]
        );
    }

    #[test]
    fn failed_reset_reports_the_verified_image() {
        let (manager, controller, board) = setup(fast_settings());
        controller.reject_exit("usb-1-4", true);

        let err = upload(
            &manager,
            &board,
            vec![image_for("leonardo", 256)],
            UploadOptions::default(),
        )
        .unwrap()
        .join()
        .unwrap_err();

        assert_eq!(err.kind(), crate::ErrorKind::Io);
        assert!(!err.is_partial());
        assert!(err.to_string().contains("written and verified"));
        assert!(controller.in_bootloader("usb-1-4"));
    }

    #[test]
    fn stuck_board_times_out() {
        let (manager, controller, board) = setup(fast_settings());
        controller.set_stuck("usb-1-4", true);

        let task = upload(
            &manager,
            &board,
            vec![image_for("leonardo", 256)],
            UploadOptions::default(),
        )
        .unwrap();
        let err = task.join().unwrap_err();

        assert_eq!(err.kind(), crate::ErrorKind::UploadTimeout);
        assert_eq!(controller.reboot_requests("usb-1-4"), 1);
        assert_eq!(controller.blocks_written("usb-1-4"), 0);
        assert_eq!(board.mode().name, "application");
        assert_ne!(board.state(), BoardState::Dropped);
    }

    #[test]
    fn cancelled_while_waiting_for_the_user() {
        let settings = SettingsBuilder::new()
            .manual_reboot_timeout(Duration::from_secs(10))
            .finalize();
        let (manager, controller, board) = setup(settings);

        let task = upload(
            &manager,
            &board,
            vec![image_for("leonardo", 256)],
            UploadOptions::default().wait_for_bootloader(),
        )
        .unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(task.status(), UploadStatus::Rebooting);
        task.cancel();

        let err = task.join().unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Cancelled);
        assert!(!err.is_partial());
        assert_eq!(controller.reboot_requests("usb-1-4"), 0);
    }

    #[test]
    fn waits_for_a_manual_bootloader_start() {
        let (manager, controller, board) = setup(fast_settings());
        let task = upload(
            &manager,
            &board,
            vec![image_for("leonardo", 256)],
            UploadOptions::default().wait_for_bootloader(),
        )
        .unwrap();
        std::thread::sleep(Duration::from_millis(50));
        controller.press_button("usb-1-4");

        let report = task.join().unwrap();
        assert_eq!(report.reset, ResetOutcome::Confirmed);
        assert_eq!(controller.reboot_requests("usb-1-4"), 0);
    }

    #[test]
    fn partial_transfer_is_reported() {
        let (manager, controller, board) = setup(fast_settings());
        controller.vanish_after_blocks("usb-1-4", 3);

        let task = upload(
            &manager,
            &board,
            vec![image_for("leonardo", 1024)],
            UploadOptions::default(),
        )
        .unwrap();
        let err = task.join().unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::TransferFailed);
        assert!(err.is_partial());
    }

    #[test]
    fn status_ends_finished() {
        let (manager, _controller, board) = setup(fast_settings());
        let task = upload(
            &manager,
            &board,
            vec![image_for("leonardo", 300)],
            UploadOptions::default(),
        )
        .unwrap();
        while !task.is_finished() {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(task.status(), UploadStatus::Finished);
        task.join().unwrap();
    }
}
