//! Parsed firmware images.
//!
//! Decoding of firmware file formats happens outside of this crate. A
//! [`Firmware`] is the already-parsed flat image, starting at flash address
//! zero, together with a name used in logs and reports.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use log::debug;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Firmware {
    name: String,
    image: Vec<u8>,
}

impl Firmware {
    pub fn new<'a>(name: impl Into<std::borrow::Cow<'a, str>>, image: Vec<u8>) -> Self {
        Firmware {
            name: name.into().into_owned(),
            image,
        }
    }

    /// Load a raw binary image from disk.
    pub fn load_binary<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut image = Vec::new();
        File::open(path)?.read_to_end(&mut image)?;
        if image.is_empty() {
            return Err(Error::Param(format!(
                "firmware '{}' is empty",
                path.display()
            )));
        }
        debug!("Loaded {} bytes from '{}'", image.len(), path.display());

        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Firmware { name, image })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn image(&self) -> &[u8] {
        &self.image
    }

    pub fn size(&self) -> usize {
        self.image.len()
    }

    /// `true` if `marker` occurs anywhere in the image.
    pub fn contains(&self, marker: &[u8]) -> bool {
        !marker.is_empty() && self.image.windows(marker.len()).any(|w| w == marker)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn marker_search() {
    let fw = Firmware::new("blink", vec![0x0c, 0x94, 0x41, 0x23, 0x36, 0x80, 0x00]);
    assert!(fw.contains(&[0x41, 0x23, 0x36, 0x80]));
    assert!(!fw.contains(&[0x41, 0x23, 0x37, 0x80]));
    assert!(!fw.contains(&[]));
    assert_eq!(fw.size(), 7);
    assert_eq!(fw.name(), "blink");
}

#[test]
fn load_missing_file() {
    let err = Firmware::load_binary("/nonexistent/boardctl/firmware.bin").unwrap_err();
    assert_eq!(err.kind(), crate::ErrorKind::NotFound);
}
