//! USB serial port platform.
//!
//! Devices are enumerated with [`serialport::available_ports`]. The crate has
//! no portable hotplug API, so a monitor thread re-enumerates the ports every
//! `poll_interval` and raises the hotplug descriptor whenever the list of
//! ports changes.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, trace, warn};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, SerialPortType, StopBits};

use super::{DeviceHandle, Platform, RawDevice};
use crate::descriptor::{Descriptor, Pollable, Signal};
use crate::error::{Error, Result};
use crate::settings::Settings;

//==============================================================================
// Public Interface
//==============================================================================

pub struct SerialPlatform {
    signal: Arc<Signal>,
    stop: Arc<AtomicBool>,
    monitor: Option<JoinHandle<()>>,
}

impl SerialPlatform {
    /// Start the platform and its hotplug monitor thread.
    pub fn new(settings: &Settings) -> Result<Self> {
        let signal = Signal::new();
        // Report the devices already attached on the first wait.
        signal.raise();
        let stop = Arc::new(AtomicBool::new(false));
        let poll_interval = settings.poll_interval;

        let monitor = {
            let signal = signal.clone();
            let stop = stop.clone();
            thread::Builder::new()
                .name("boardctl-hotplug".into())
                .spawn(move || monitor_ports(signal, stop, poll_interval))
                .map_err(|e| Error::System(format!("cannot start hotplug monitor: {}", e)))?
        };

        Ok(SerialPlatform {
            signal,
            stop,
            monitor: Some(monitor),
        })
    }
}

impl Drop for SerialPlatform {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(monitor) = self.monitor.take() {
            if monitor.join().is_err() {
                warn!("Hotplug monitor thread panicked");
            }
        }
    }
}

impl Platform for SerialPlatform {
    fn enumerate(&mut self) -> Result<Vec<RawDevice>> {
        self.signal.clear();
        enumerate_usb_serial_ports()
    }

    fn descriptor(&self) -> Descriptor {
        self.signal.descriptor()
    }

    fn open(&self, device: &RawDevice, rate: u32) -> Result<Box<dyn DeviceHandle>> {
        let port = open_and_setup_port(&device.path, rate)?;
        Ok(Box::new(SerialHandle {
            port: Arc::new(Mutex::new(port)),
        }))
    }
}

/// An open USB serial port.
pub struct SerialHandle {
    port: Arc<Mutex<Box<dyn SerialPort>>>,
}

impl DeviceHandle for SerialHandle {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let mut port = lock_port(&self.port);
        port.set_timeout(timeout)?;
        match port.read(buf) {
            Ok(n) => {
                trace!("{} bytes read from {:?}", n, port.name());
                Ok(n)
            }
            Err(err) if err.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let mut port = lock_port(&self.port);
        match port.write(buf) {
            Ok(n) => {
                trace!("{} bytes written to {:?}", n, port.name());
                Ok(n)
            }
            Err(err) if err.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    fn set_control(&mut self, rate: u32, dtr: bool) -> Result<()> {
        let mut port = lock_port(&self.port);
        debug!("Setting {:?} to {} baud, DTR {}", port.name(), rate, dtr);
        port.set_baud_rate(rate)?;
        port.write_data_terminal_ready(dtr)?;
        Ok(())
    }

    fn descriptor(&self) -> Descriptor {
        Descriptor::new(Arc::new(PortReadiness {
            port: self.port.clone(),
        }))
    }
}

//==============================================================================
// Private stuff
//==============================================================================

struct PortReadiness {
    port: Arc<Mutex<Box<dyn SerialPort>>>,
}

impl Pollable for PortReadiness {
    fn is_ready(&self) -> bool {
        // A failing port is reported ready so that the next read surfaces the
        // error to whoever waits on it.
        lock_port(&self.port).bytes_to_read().map_or(true, |n| n > 0)
    }
}

fn lock_port(port: &Mutex<Box<dyn SerialPort>>) -> std::sync::MutexGuard<'_, Box<dyn SerialPort>> {
    port.lock().unwrap_or_else(|e| e.into_inner())
}

fn monitor_ports(signal: Arc<Signal>, stop: Arc<AtomicBool>, poll_interval: Duration) {
    let mut last = port_fingerprint();
    while !stop.load(Ordering::SeqCst) {
        thread::sleep(poll_interval);
        let current = port_fingerprint();
        if current != last {
            debug!("Serial port list changed");
            signal.raise();
            last = current;
        }
    }
}

fn port_fingerprint() -> Vec<RawDevice> {
    enumerate_usb_serial_ports().unwrap_or_default()
}

/// Enumerates serial devices of type USB on the system.
fn enumerate_usb_serial_ports() -> Result<Vec<RawDevice>> {
    let mut devices = vec![];
    for p in serialport::available_ports()? {
        if let SerialPortType::UsbPort(info) = p.port_type {
            devices.push(RawDevice {
                vid: info.vid,
                pid: info.pid,
                serial: info.serial_number.filter(|s| !s.is_empty()),
                location: usb_location(&p.port_name),
                path: p.port_name,
            });
        }
    }
    devices.sort_by(|a, b| a.location.cmp(&b.location).then(a.path.cmp(&b.path)));
    Ok(devices)
}

/// Resolve the USB topology path (e.g. `usb-1-2.3`) of a tty by walking up
/// its sysfs device tree to the USB interface node.
#[cfg(target_os = "linux")]
fn usb_location(port_name: &str) -> String {
    use std::path::Path;

    let tty = match Path::new(port_name).file_name() {
        Some(tty) => tty.to_owned(),
        None => return port_name.to_owned(),
    };
    let real = match std::fs::canonicalize(Path::new("/sys/class/tty").join(tty).join("device")) {
        Ok(real) => real,
        Err(_) => return port_name.to_owned(),
    };
    // The interface node is named `<bus>-<ports>:<config>.<interface>`.
    real.file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.split(':').next())
        .map(|topology| format!("usb-{}", topology))
        .unwrap_or_else(|| port_name.to_owned())
}

#[cfg(not(target_os = "linux"))]
fn usb_location(port_name: &str) -> String {
    port_name.to_owned()
}

fn open_and_setup_port(path: &str, rate: u32) -> Result<Box<dyn SerialPort>> {
    use retry::{delay, retry_with_index};

    let result = retry_with_index(
        delay::Fixed::from_millis(100).take(4),
        |index| -> std::result::Result<Box<dyn SerialPort>, serialport::Error> {
            debug!("Trying to open {} ({})", path, index);
            serialport::new(path, rate)
                .data_bits(DataBits::Eight)
                .stop_bits(StopBits::One)
                .parity(Parity::None)
                .flow_control(FlowControl::None)
                .timeout(Duration::from_millis(100))
                .open()
        },
    );
    match result {
        Ok(port) => {
            port.clear(ClearBuffer::All)?;
            info!("Opened {} at {} baud", path, rate);
            Ok(port)
        }
        Err(retry::Error::Operation {
            error,
            total_delay,
            tries,
        }) => {
            info!(
                "Failed to open {} after {:?} and {} tries: {}",
                path, total_delay, tries, error,
            );
            Err(error.into())
        }
        Err(retry::Error::Internal(msg)) => Err(Error::System(format!(
            "internal error while retrying to open {}: {}",
            path, msg
        ))),
    }
}
