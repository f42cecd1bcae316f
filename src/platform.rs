//! Boundary with the operating system: device enumeration, hotplug
//! notifications and open device handles.
//!
//! The board manager only talks to the platform through the [`Platform`] and
//! [`DeviceHandle`] traits. Two implementations are provided:
//!
//! * [`serial::SerialPlatform`] enumerates real USB serial ports,
//! * [`sim::SimulatedPlatform`] scripts attach/detach sequences and simulated
//!   bootloaders for tests and demos.

pub mod serial;
pub mod sim;

use std::fmt;
use std::time::Duration;

use crate::descriptor::Descriptor;
use crate::error::Result;

/// Raw identification of one attached USB device, as reported by the
/// platform enumeration.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct RawDevice {
    pub vid: u16,
    pub pid: u16,
    /// USB serial string, if the device reports one.
    pub serial: Option<String>,
    /// Topology path (bus and ports), stable for a physical USB port.
    pub location: String,
    /// Path used to open the device.
    pub path: String,
}

impl fmt::Display for RawDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{:04x}:{:04x}] at {}",
            self.path, self.vid, self.pid, self.location
        )
    }
}

/// An open connection to one device.
///
/// Reads and writes never promise to transfer the whole buffer; callers
/// retry under their own timeout discipline. Dropping the handle closes the
/// device.
pub trait DeviceHandle: Send {
    /// Read whatever is available, waiting at most `timeout`. Returns `Ok(0)`
    /// when nothing arrived in time.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Write some prefix of `buf`, returning how many bytes were accepted.
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Change the line rate and the DTR signal.
    fn set_control(&mut self, rate: u32, dtr: bool) -> Result<()>;

    /// Readiness of incoming data, for use in a multiplexed wait.
    fn descriptor(&self) -> Descriptor;
}

/// Source of attached devices and hotplug notifications.
pub trait Platform: Send {
    /// List the devices currently attached, in a stable discovery order.
    ///
    /// Any pending hotplug notification is consumed by this call.
    fn enumerate(&mut self) -> Result<Vec<RawDevice>>;

    /// Becomes ready when the set of attached devices may have changed.
    fn descriptor(&self) -> Descriptor;

    /// Open `device` at the given line rate.
    fn open(&self, device: &RawDevice, rate: u32) -> Result<Box<dyn DeviceHandle>>;
}

/// Write all of `buf`, retrying short writes.
pub(crate) fn write_all(handle: &mut dyn DeviceHandle, mut buf: &[u8]) -> Result<()> {
    while !buf.is_empty() {
        let written = handle.write(buf)?;
        if written == 0 {
            return Err(crate::Error::Io("device accepted no data".into()));
        }
        buf = &buf[written..];
    }
    Ok(())
}
