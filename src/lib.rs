//! `boardctl` keeps a live view of the USB microcontroller boards attached to
//! the system and uploads firmware to them.
//!
//! Boards running the Caterina bootloader (Arduino Leonardo, Micro, Esplora,
//! Adafruit Feather 32u4) present two USB personalities: their application,
//! and the bootloader they reboot into to be flashed. Each personality
//! enumerates as a different USB device, and only the application reports a
//! serial number. The [`BoardManager`] reconciles this stream of devices into
//! stable [`Board`] objects: the board you hold before a reboot is the same
//! one you hold after it.
//!
//! The crate is organized as follows:
//!
//! * [`registry`] is the static catalog of board models and modes,
//! * [`platform`] is the boundary with the operating system (USB serial
//!   ports) and also provides a simulator for tests and demos,
//! * [`BoardManager`] enumerates devices, tracks [`Board`]s and notifies
//!   observers with [`BoardEvent`]s,
//! * [`upload`] runs the reboot, flash, verify and reset sequence as a
//!   cancellable background [`UploadTask`].
//!
//! Like the rest of the crate, the upload sequence is implemented as a state
//! machine with the following characteristics:
//!
//! * Can only be in one state at any time.
//! * Each state can have its own associated data if needed.
//! * Data shared by all states travels with the state machine itself.
//! * Transitions between states are triggered via typed **events**, and only
//!   the transitions for which a `From<Event>` implementation exists are
//!   possible. Anything else is detected at compile time.
//! * Transitioning from one state to another consumes the original state.
//!
//! **Example** - Listing boards as they come and go:
//! ```no_run
//! use boardctl::{BoardManager, Settings, Timeout};
//!
//! let mut manager = BoardManager::with_serial_ports(Settings::default())?;
//! manager.register_callback(|board, event| {
//!     println!("{} {} ({})", board.tag(), event, board.mode());
//!     0
//! });
//! loop {
//!     manager.wait(Timeout::Infinite)?;
//! }
//! # Ok::<(), boardctl::Error>(())
//! ```

mod board;
mod capability;
mod caterina;
mod descriptor;
mod error;
mod firmware;
mod manager;
pub mod platform;
pub mod registry;
mod settings;
pub mod upload;

pub use board::{Board, BoardEvent, BoardState};
pub use capability::{Capabilities, Capability};
pub use descriptor::{Descriptor, DescriptorSet, Pollable, Signal, Timeout, MAX_DESCRIPTORS};
pub use error::{Error, ErrorKind, Result};
pub use firmware::Firmware;
pub use manager::{wait_for, BoardManager, Callback, Callbacks, SharedManager};
pub use settings::{Settings, SettingsBuilder};
pub use upload::{
    upload, ResetOutcome, UploadOptions, UploadReport, UploadStatus, UploadTask, MAX_FIRMWARES,
};
