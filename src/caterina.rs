//! Caterina bootloader protocol (AVR109 subset) over an open device handle.
//!
//! Every command is answered with a carriage return, except the block read
//! which answers with the requested bytes. Flash addresses are sent as big
//! endian word addresses.

use std::time::{Duration, Instant};

use log::{debug, log_enabled, trace, warn, Level::Trace};

use crate::error::{Error, Result};
use crate::firmware::Firmware;
use crate::platform::{write_all, DeviceHandle};
use crate::registry::BoardModel;

/// Rate that asks a Caterina application to reboot into its bootloader.
pub const TOUCH_RATE: u32 = 1200;

const ACK: u8 = b'\r';
const MEMORY_FLASH: u8 = b'F';

/// Block-level progress of a flash operation.
pub(crate) trait FlashObserver {
    /// Called after each acknowledged block.
    fn progress(&mut self, written: usize, total: usize);
    /// Polled before each block; `true` aborts the transfer.
    fn cancelled(&self) -> bool;
}

pub(crate) struct Caterina<'a> {
    handle: &'a mut dyn DeviceHandle,
    timeout: Duration,
}

impl<'a> Caterina<'a> {
    pub fn new(handle: &'a mut dyn DeviceHandle, timeout: Duration) -> Self {
        Caterina { handle, timeout }
    }

    /// Erase, write and verify `firmware`, then leave programming mode.
    ///
    /// A block that fails with a transient error is sent again, up to
    /// `retries` times. Errors after the first acknowledged block are
    /// reported as a partial transfer.
    pub fn flash(
        &mut self,
        model: &BoardModel,
        firmware: &Firmware,
        retries: usize,
        observer: &mut dyn FlashObserver,
    ) -> Result<()> {
        let image = firmware.image();
        let total = image.len();
        if total > model.code_size {
            return Err(Error::Param(format!(
                "'{}' is {} bytes, {} holds at most {}",
                firmware.name(),
                total,
                model.name,
                model.code_size
            )));
        }

        let failed = |written: usize, err: Error| Error::TransferFailed {
            written,
            total,
            reason: err.to_string(),
        };

        self.command(&[b'P']).map_err(|e| failed(0, e))?;
        self.command(&[b'e']).map_err(|e| failed(0, e))?;

        let mut written = 0;
        for block in image.chunks(model.block_size) {
            if observer.cancelled() {
                return Err(Error::Cancelled { written });
            }
            let mut attempt = 0;
            loop {
                match self.write_block(written, block) {
                    Ok(()) => break,
                    Err(err) if err.is_transient() && attempt < retries => {
                        attempt += 1;
                        warn!(
                            "Block at {:#06x} failed ({}), retry {}/{}",
                            written, err, attempt, retries
                        );
                        self.drain();
                    }
                    Err(err) => return Err(failed(written, err)),
                }
            }
            written += block.len();
            observer.progress(written, total);
        }

        debug!("Verifying {} bytes", total);
        for (index, block) in image.chunks(model.block_size).enumerate() {
            if observer.cancelled() {
                return Err(Error::Cancelled { written });
            }
            let offset = index * model.block_size;
            let data = self.read_block(offset, block.len()).map_err(|e| failed(written, e))?;
            if data != block {
                return Err(failed(
                    written,
                    Error::Io(format!("verification mismatch in block at {:#06x}", offset)),
                ));
            }
        }

        self.command(&[b'L']).map_err(|e| failed(written, e))?;
        Ok(())
    }

    /// Leave the bootloader and start the application.
    pub fn exit(&mut self) -> Result<()> {
        self.command(&[b'E'])
    }

    fn write_block(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        self.set_address(offset)?;
        let size = (data.len() as u16).to_be_bytes();
        let mut frame = Vec::with_capacity(data.len() + 4);
        frame.extend_from_slice(&[b'B', size[0], size[1], MEMORY_FLASH]);
        frame.extend_from_slice(data);
        self.command(&frame)
    }

    fn read_block(&mut self, offset: usize, len: usize) -> Result<Vec<u8>> {
        self.set_address(offset)?;
        let size = (len as u16).to_be_bytes();
        write_all(self.handle, &[b'g', size[0], size[1], MEMORY_FLASH])?;
        let mut data = vec![0; len];
        self.read_exact(&mut data)?;
        Ok(data)
    }

    fn set_address(&mut self, offset: usize) -> Result<()> {
        let word = ((offset / 2) as u16).to_be_bytes();
        self.command(&[b'A', word[0], word[1]])
    }

    /// Send one command and wait for its acknowledgement.
    fn command(&mut self, frame: &[u8]) -> Result<()> {
        trace!("=> '{}' ({} bytes)", frame[0] as char, frame.len());
        write_all(self.handle, frame)?;
        let mut answer = [0u8; 1];
        self.read_exact(&mut answer)?;
        if answer[0] != ACK {
            return Err(Error::Io(format!(
                "unexpected answer {:#04x} to '{}'",
                answer[0], frame[0] as char
            )));
        }
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        let mut filled = 0;
        while filled < buf.len() {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Io(format!(
                    "bootloader answered {} of {} bytes in time",
                    filled,
                    buf.len()
                )));
            }
            filled += self.handle.read(&mut buf[filled..], deadline - now)?;
        }
        if log_enabled!(Trace) {
            trace!("<= {:02x?}", buf);
        }
        Ok(())
    }

    /// Discard late answers left over by a failed command.
    fn drain(&mut self) {
        let mut scratch = [0u8; 64];
        while let Ok(n) = self.handle.read(&mut scratch, Duration::from_millis(0)) {
            if n == 0 {
                break;
            }
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::sim::simulator;
    use crate::platform::Platform;
    use crate::registry::find_model;

    struct Recorder {
        progress: Vec<usize>,
        cancel_at: Option<usize>,
    }

    impl FlashObserver for Recorder {
        fn progress(&mut self, written: usize, _total: usize) {
            self.progress.push(written);
        }
        fn cancelled(&self) -> bool {
            self.cancel_at
                .map_or(false, |at| self.progress.last().copied().unwrap_or(0) >= at)
        }
    }

    fn recorder() -> Recorder {
        Recorder {
            progress: vec![],
            cancel_at: None,
        }
    }

    fn image(len: usize) -> Firmware {
        Firmware::new("test.bin", (0..len).map(|i| (i % 251) as u8).collect())
    }

    fn open_bootloader(
        location: &str,
    ) -> (Box<dyn DeviceHandle>, crate::platform::sim::SimController) {
        let (mut platform, controller) = simulator();
        let leonardo = find_model("leonardo").unwrap();
        controller.plug_bootloader(leonardo, "42", location);
        let devices = platform.enumerate().unwrap();
        let handle = platform.open(&devices[0], 57_600).unwrap();
        (handle, controller)
    }

    #[test]
    fn flash_writes_and_verifies() {
        let (mut handle, controller) = open_bootloader("usb-1");
        let leonardo = find_model("leonardo").unwrap();
        let fw = image(300);
        let mut observer = recorder();

        Caterina::new(handle.as_mut(), Duration::from_millis(100))
            .flash(leonardo, &fw, 0, &mut observer)
            .unwrap();

        assert_eq!(observer.progress, vec![128, 256, 300]);
        assert_eq!(&controller.flash("usb-1")[..300], fw.image());
        assert_eq!(controller.blocks_written("usb-1"), 3);
    }

    #[test]
    fn lost_acknowledgement_is_retried() {
        let (mut handle, controller) = open_bootloader("usb-1");
        controller.drop_block_acks("usb-1", 1);
        let leonardo = find_model("leonardo").unwrap();
        let fw = image(256);

        Caterina::new(handle.as_mut(), Duration::from_millis(20))
            .flash(leonardo, &fw, 2, &mut recorder())
            .unwrap();
        assert_eq!(&controller.flash("usb-1")[..256], fw.image());
        assert_eq!(controller.blocks_written("usb-1"), 3);
    }

    #[test]
    fn retries_are_bounded() {
        let (mut handle, controller) = open_bootloader("usb-1");
        controller.drop_block_acks("usb-1", 10);
        let leonardo = find_model("leonardo").unwrap();

        let err = Caterina::new(handle.as_mut(), Duration::from_millis(10))
            .flash(leonardo, &image(256), 2, &mut recorder())
            .unwrap_err();
        match err {
            Error::TransferFailed { written, total, .. } => {
                assert_eq!(written, 0);
                assert_eq!(total, 256);
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(controller.blocks_written("usb-1"), 3);
    }

    #[test]
    fn vanishing_device_is_a_partial_transfer() {
        let (mut handle, controller) = open_bootloader("usb-1");
        controller.vanish_after_blocks("usb-1", 2);
        let leonardo = find_model("leonardo").unwrap();

        let err = Caterina::new(handle.as_mut(), Duration::from_millis(10))
            .flash(leonardo, &image(512), 1, &mut recorder())
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::TransferFailed);
        assert!(err.is_partial());
    }

    #[test]
    fn cancellation_stops_between_blocks() {
        let (mut handle, controller) = open_bootloader("usb-1");
        let leonardo = find_model("leonardo").unwrap();
        let mut observer = Recorder {
            progress: vec![],
            cancel_at: Some(128),
        };

        let err = Caterina::new(handle.as_mut(), Duration::from_millis(100))
            .flash(leonardo, &image(512), 0, &mut observer)
            .unwrap_err();
        match err {
            Error::Cancelled { written } => assert_eq!(written, 128),
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(controller.blocks_written("usb-1"), 1);
    }

    #[test]
    fn oversized_image_is_rejected_before_any_write() {
        let (mut handle, controller) = open_bootloader("usb-1");
        let leonardo = find_model("leonardo").unwrap();

        let err = Caterina::new(handle.as_mut(), Duration::from_millis(100))
            .flash(leonardo, &image(leonardo.code_size + 1), 0, &mut recorder())
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Param);
        assert_eq!(controller.blocks_written("usb-1"), 0);
    }
}
