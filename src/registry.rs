//! Static catalog of the known board models and modes.
//!
//! All boards handled here are ATmega32u4 boards running the Caterina
//! bootloader. In application mode they enumerate with the application
//! VID:PID of their model; once rebooted into the bootloader they
//! re-enumerate with a different PID and no serial string. Both personalities
//! are CDC serial devices.
//!
//! Everything in this module is a pure lookup against fixed tables.

use std::fmt;

use crate::capability::{Capabilities, Capability};
use crate::firmware::Firmware;
use crate::platform::RawDevice;

/// USB vendor and product identifiers.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct UsbId {
    pub vid: u16,
    pub pid: u16,
}

impl UsbId {
    pub const fn new(vid: u16, pid: u16) -> Self {
        UsbId { vid, pid }
    }

    /// The marker left in a firmware image by the USB device descriptor,
    /// which stores `idVendor` and `idProduct` as consecutive little endian
    /// words.
    pub fn descriptor_marker(&self) -> [u8; 4] {
        let vid = self.vid.to_le_bytes();
        let pid = self.pid.to_le_bytes();
        [vid[0], vid[1], pid[0], pid[1]]
    }
}

impl fmt::Display for UsbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vid, self.pid)
    }
}

/// Which firmware a board is currently running.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ModeKind {
    Application,
    Bootloader,
}

/// A USB personality a board can present.
#[derive(Debug, Eq, PartialEq)]
pub struct BoardMode {
    pub name: &'static str,
    pub desc: &'static str,
    pub kind: ModeKind,
    /// `true` when the device reports its serial number in this mode.
    pub self_identifying: bool,
}

impl fmt::Display for BoardMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// A known hardware variant.
#[derive(Debug, Eq, PartialEq)]
pub struct BoardModel {
    pub name: &'static str,
    pub mcu: &'static str,
    pub desc: &'static str,
    /// Bytes of flash available to the application.
    pub code_size: usize,
    /// Size of one bootloader flash write.
    pub block_size: usize,
    pub application_id: UsbId,
    pub bootloader_id: UsbId,
}

impl BoardModel {
    /// The USB identifiers the model uses while running in `mode`.
    pub fn usb_id(&self, mode: &BoardMode) -> UsbId {
        match mode.kind {
            ModeKind::Application => self.application_id,
            ModeKind::Bootloader => self.bootloader_id,
        }
    }
}

impl fmt::Display for BoardModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

// -----------------------------------------------------------------------------
// Tables
// -----------------------------------------------------------------------------

pub static APPLICATION_MODE: BoardMode = BoardMode {
    name: "application",
    desc: "User firmware (CDC serial)",
    kind: ModeKind::Application,
    self_identifying: true,
};

pub static BOOTLOADER_MODE: BoardMode = BoardMode {
    name: "bootloader",
    desc: "Caterina bootloader (AVR109)",
    kind: ModeKind::Bootloader,
    self_identifying: false,
};

pub static MODES: [&BoardMode; 2] = [&APPLICATION_MODE, &BOOTLOADER_MODE];

const ATMEGA32U4_CODE_SIZE: usize = 28_672;
const ATMEGA32U4_BLOCK_SIZE: usize = 128;

pub static MODELS: [BoardModel; 4] = [
    BoardModel {
        name: "leonardo",
        mcu: "atmega32u4",
        desc: "Arduino Leonardo",
        code_size: ATMEGA32U4_CODE_SIZE,
        block_size: ATMEGA32U4_BLOCK_SIZE,
        application_id: UsbId::new(0x2341, 0x8036),
        bootloader_id: UsbId::new(0x2341, 0x0036),
    },
    BoardModel {
        name: "micro",
        mcu: "atmega32u4",
        desc: "Arduino Micro",
        code_size: ATMEGA32U4_CODE_SIZE,
        block_size: ATMEGA32U4_BLOCK_SIZE,
        application_id: UsbId::new(0x2341, 0x8037),
        bootloader_id: UsbId::new(0x2341, 0x0037),
    },
    BoardModel {
        name: "esplora",
        mcu: "atmega32u4",
        desc: "Arduino Esplora",
        code_size: ATMEGA32U4_CODE_SIZE,
        block_size: ATMEGA32U4_BLOCK_SIZE,
        application_id: UsbId::new(0x2341, 0x803c),
        bootloader_id: UsbId::new(0x2341, 0x003c),
    },
    BoardModel {
        name: "feather32u4",
        mcu: "atmega32u4",
        desc: "Adafruit Feather 32u4",
        code_size: ATMEGA32U4_CODE_SIZE,
        block_size: ATMEGA32U4_BLOCK_SIZE,
        application_id: UsbId::new(0x239a, 0x800c),
        bootloader_id: UsbId::new(0x239a, 0x000c),
    },
];

// -----------------------------------------------------------------------------
// Lookups
// -----------------------------------------------------------------------------

/// Find a model by its canonical name (case-insensitive).
pub fn find_model(name: &str) -> Option<&'static BoardModel> {
    MODELS.iter().find(|m| m.name.eq_ignore_ascii_case(name))
}

/// Find a mode by its name (case-insensitive).
pub fn find_mode(name: &str) -> Option<&'static BoardMode> {
    MODES
        .iter()
        .copied()
        .find(|m| m.name.eq_ignore_ascii_case(name))
}

/// Resolve the model and mode of a raw device from its USB identifiers.
pub fn identify(device: &RawDevice) -> Option<(&'static BoardModel, &'static BoardMode)> {
    let id = UsbId::new(device.vid, device.pid);
    MODELS.iter().find_map(|model| {
        MODES
            .iter()
            .copied()
            .find(|mode| model.usb_id(mode) == id)
            .map(|mode| (model, mode))
    })
}

/// The capabilities of a board running `mode`, identified as `model`.
///
/// This is the only place where a board's capability set is computed.
pub fn capabilities(model: Option<&BoardModel>, mode: &BoardMode) -> Capabilities {
    let set = match mode.kind {
        ModeKind::Application => Capabilities::empty()
            .with(Capability::Serial)
            .with(Capability::Reboot),
        ModeKind::Bootloader => Capabilities::empty()
            .with(Capability::Upload)
            .with(Capability::Reset),
    };
    let set = if mode.self_identifying {
        set.with(Capability::Identify)
    } else {
        set
    };
    match model {
        Some(_) => set,
        // Flashing or rebooting needs to know the target geometry and ids.
        None => set
            .without(Capability::Upload)
            .without(Capability::Reboot),
    }
}

/// Find the most specific model a firmware image was built for.
///
/// An image is compatible with a model when it embeds the model's
/// application USB descriptor marker and fits in its flash.
pub fn test_firmware(firmware: &Firmware) -> Option<&'static BoardModel> {
    MODELS.iter().find(|model| {
        firmware.size() <= model.code_size
            && firmware.contains(&model.application_id.descriptor_marker())
    })
}

// =============================================================================
// Unit Tests
// =============================================================================
