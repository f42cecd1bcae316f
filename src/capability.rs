//! Board capabilities.
//!
//! Internally a board's capabilities are a small set of [`Capability`] tags.
//! The historical bitmask (`Identify=1, Upload=2, Reset=4, Serial=8,
//! Reboot=16`) is only produced at the external boundary through
//! [`Capabilities::bits`], because front ends branch on it directly.

use std::fmt;

/// A class of operation a board may permit in its current mode.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Capability {
    Identify,
    Upload,
    Reset,
    Serial,
    Reboot,
}

impl Capability {
    pub const ALL: [Capability; 5] = [
        Capability::Identify,
        Capability::Upload,
        Capability::Reset,
        Capability::Serial,
        Capability::Reboot,
    ];

    /// Stable wire value of the capability.
    pub fn bit(self) -> u32 {
        match self {
            Capability::Identify => 1,
            Capability::Upload => 2,
            Capability::Reset => 4,
            Capability::Serial => 8,
            Capability::Reboot => 16,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Capability::Identify => "identify",
            Capability::Upload => "upload",
            Capability::Reset => "reset",
            Capability::Serial => "serial",
            Capability::Reboot => "reboot",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An immutable set of capabilities.
///
/// There is no way to insert into an existing set: a board's set is rebuilt
/// from its model and mode every time one of them changes.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash)]
pub struct Capabilities {
    bits: u32,
}

impl Capabilities {
    pub const fn empty() -> Self {
        Capabilities { bits: 0 }
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.bits & capability.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// Returns a new set with `capability` added.
    pub fn with(self, capability: Capability) -> Self {
        Capabilities {
            bits: self.bits | capability.bit(),
        }
    }

    /// Returns a new set with `capability` removed.
    pub fn without(self, capability: Capability) -> Self {
        Capabilities {
            bits: self.bits & !capability.bit(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        Capability::ALL
            .iter()
            .copied()
            .filter(move |capability| self.contains(*capability))
    }

    /// External bitmask representation.
    pub fn bits(&self) -> u32 {
        self.bits
    }
}

impl std::iter::FromIterator<Capability> for Capabilities {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Capabilities::empty(), |set, capability| set.with(capability))
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("(none)");
        }
        let names: Vec<&str> = self.iter().map(Capability::name).collect();
        f.write_str(&names.join(", "))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn wire_values_are_stable() {
    let all: Capabilities = Capability::ALL.iter().copied().collect();
    assert_eq!(all.bits(), 31);
    assert_eq!(Capability::Identify.bit(), 1);
    assert_eq!(Capability::Upload.bit(), 2);
    assert_eq!(Capability::Reset.bit(), 4);
    assert_eq!(Capability::Serial.bit(), 8);
    assert_eq!(Capability::Reboot.bit(), 16);
}

#[test]
fn set_operations() {
    let set = Capabilities::empty()
        .with(Capability::Upload)
        .with(Capability::Reset);
    assert!(set.contains(Capability::Upload));
    assert!(!set.contains(Capability::Serial));
    assert_eq!(set.bits(), 6);
    assert_eq!(set.without(Capability::Upload).bits(), 4);
    assert_eq!(set.to_string(), "upload, reset");
    assert_eq!(Capabilities::empty().to_string(), "(none)");
}
