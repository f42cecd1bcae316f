//! Waitable readiness sources.
//!
//! Hotplug notifications and device handles expose [`Descriptor`]s. A caller
//! groups descriptors coming from different sources in a [`DescriptorSet`],
//! tagging each one with an id, and then blocks on the whole set with
//! [`DescriptorSet::poll`], which returns the id of the first ready source.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

/// Maximum number of descriptors in one set.
pub const MAX_DESCRIPTORS: usize = 64;

/// Slice used to re-check sources that cannot wake a waiter by themselves.
const POLL_SLICE: Duration = Duration::from_millis(10);

/// Anything that can tell whether it is ready to be serviced.
pub trait Pollable: Send + Sync {
    fn is_ready(&self) -> bool;

    /// Block until the source is ready or `deadline` passes (never when
    /// `None`), and report whether it is ready.
    ///
    /// The default implementation re-checks [`is_ready`](Pollable::is_ready)
    /// in short slices. Sources able to wake their waiters override it.
    fn wait_ready(&self, deadline: Option<Instant>) -> bool {
        loop {
            if self.is_ready() {
                return true;
            }
            match next_slice(deadline) {
                Some(slice) => thread::sleep(slice),
                None => return false,
            }
        }
    }
}

/// A clonable, shareable readiness source.
#[derive(Clone)]
pub struct Descriptor {
    source: Arc<dyn Pollable>,
}

impl Descriptor {
    pub fn new(source: Arc<dyn Pollable>) -> Self {
        Descriptor { source }
    }

    pub fn is_ready(&self) -> bool {
        self.source.is_ready()
    }

    fn wait_ready(&self, deadline: Option<Instant>) -> bool {
        self.source.wait_ready(deadline)
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Descriptor")
            .field(&self.source.is_ready())
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Signal
// -----------------------------------------------------------------------------

/// A level-triggered flag, raised by a producer (e.g. a hotplug monitor
/// thread) and cleared by the consumer once it has handled the change.
/// Raising it wakes the threads blocked on it right away.
#[derive(Default)]
pub struct Signal {
    raised: Mutex<bool>,
    wakeup: Condvar,
}

impl Signal {
    pub fn new() -> Arc<Self> {
        Arc::new(Signal::default())
    }

    pub fn raise(&self) {
        *self.flag() = true;
        self.wakeup.notify_all();
    }

    pub fn clear(&self) {
        *self.flag() = false;
    }

    pub fn descriptor(self: &Arc<Self>) -> Descriptor {
        Descriptor::new(self.clone())
    }

    fn flag(&self) -> MutexGuard<'_, bool> {
        self.raised.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Pollable for Signal {
    fn is_ready(&self) -> bool {
        *self.flag()
    }

    fn wait_ready(&self, deadline: Option<Instant>) -> bool {
        let mut raised = self.flag();
        while !*raised {
            raised = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    self.wakeup
                        .wait_timeout(raised, deadline - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0
                }
                None => self
                    .wakeup
                    .wait(raised)
                    .unwrap_or_else(|e| e.into_inner()),
            };
        }
        true
    }
}

// -----------------------------------------------------------------------------
// DescriptorSet
// -----------------------------------------------------------------------------

/// How long a blocking call may suspend the caller.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Timeout {
    /// Check once and return immediately.
    Poll,
    /// Wait at most this long.
    After(Duration),
    /// Wait until something happens.
    Infinite,
}

impl Timeout {
    /// Convert the historical millisecond convention: negative means
    /// infinite, zero means poll once.
    pub fn from_millis(ms: i64) -> Self {
        if ms < 0 {
            Timeout::Infinite
        } else if ms == 0 {
            Timeout::Poll
        } else {
            Timeout::After(Duration::from_millis(ms as u64))
        }
    }

    pub(crate) fn deadline(&self, start: Instant) -> Option<Instant> {
        match self {
            Timeout::Poll => Some(start),
            Timeout::After(d) => Some(start + *d),
            Timeout::Infinite => None,
        }
    }
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        if d == Duration::from_secs(0) {
            Timeout::Poll
        } else {
            Timeout::After(d)
        }
    }
}

/// A set of descriptors, each tagged with a caller-chosen id.
#[derive(Debug, Default, Clone)]
pub struct DescriptorSet {
    entries: Vec<(Descriptor, i32)>,
}

impl DescriptorSet {
    pub fn new() -> Self {
        DescriptorSet::default()
    }

    /// Add a descriptor tagged with `id`. Descriptors beyond
    /// [`MAX_DESCRIPTORS`] are rejected.
    pub fn add(&mut self, descriptor: Descriptor, id: i32) -> bool {
        if self.entries.len() >= MAX_DESCRIPTORS {
            log::warn!("Descriptor set is full, ignoring descriptor {}", id);
            return false;
        }
        self.entries.push((descriptor, id));
        true
    }

    pub fn extend(&mut self, other: &DescriptorSet) {
        for (descriptor, id) in &other.entries {
            self.add(descriptor.clone(), *id);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn ready_id(&self) -> Option<i32> {
        self.entries
            .iter()
            .find(|(descriptor, _)| descriptor.is_ready())
            .map(|(_, id)| *id)
    }

    /// Block until one of the descriptors is ready or `timeout` elapses.
    ///
    /// Returns the id of the first ready descriptor, in insertion order, or
    /// `None` on timeout. A set holding a single descriptor blocks on the
    /// source itself; larger sets are re-checked in short slices.
    pub fn poll(&self, timeout: Timeout) -> Option<i32> {
        let deadline = timeout.deadline(Instant::now());
        if let [(descriptor, id)] = self.entries.as_slice() {
            return if descriptor.wait_ready(deadline) {
                Some(*id)
            } else {
                None
            };
        }
        loop {
            if let Some(id) = self.ready_id() {
                return Some(id);
            }
            thread::sleep(next_slice(deadline)?);
        }
    }
}

/// How long to sleep before re-checking a source, `None` once `deadline`
/// has passed.
fn next_slice(deadline: Option<Instant>) -> Option<Duration> {
    match deadline {
        Some(deadline) => {
            let now = Instant::now();
            if now >= deadline {
                None
            } else {
                Some(std::cmp::min(deadline - now, POLL_SLICE))
            }
        }
        None => Some(POLL_SLICE),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_returns_first_ready_id() {
        let a = Signal::new();
        let b = Signal::new();
        let mut set = DescriptorSet::new();
        set.add(a.descriptor(), 1);
        set.add(b.descriptor(), 2);

        assert_eq!(set.poll(Timeout::Poll), None);
        b.raise();
        assert_eq!(set.poll(Timeout::Poll), Some(2));
        a.raise();
        assert_eq!(set.poll(Timeout::Poll), Some(1));
        a.clear();
        b.clear();
        assert_eq!(set.poll(Timeout::Poll), None);
    }

    #[test]
    fn poll_times_out() {
        let signal = Signal::new();
        let mut set = DescriptorSet::new();
        set.add(signal.descriptor(), 7);

        let start = Instant::now();
        assert_eq!(set.poll(Timeout::After(Duration::from_millis(50))), None);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn poll_wakes_on_raise_from_another_thread() {
        let signal = Signal::new();
        let mut set = DescriptorSet::new();
        set.add(signal.descriptor(), 3);

        let producer = {
            let signal = signal.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                signal.raise();
            })
        };
        assert_eq!(set.poll(Timeout::Infinite), Some(3));
        producer.join().unwrap();
    }

    #[test]
    fn raise_wakes_a_blocked_waiter_at_once() {
        let signal = Signal::new();
        let mut set = DescriptorSet::new();
        set.add(signal.descriptor(), 4);

        let producer = {
            let signal = signal.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                signal.raise();
                Instant::now()
            })
        };
        assert_eq!(set.poll(Timeout::After(Duration::from_secs(5))), Some(4));
        let woken = Instant::now();
        let raised = producer.join().unwrap();
        assert!(woken.saturating_duration_since(raised) < Duration::from_millis(8));
    }

    #[test]
    fn millisecond_convention() {
        assert_eq!(Timeout::from_millis(-1), Timeout::Infinite);
        assert_eq!(Timeout::from_millis(0), Timeout::Poll);
        assert_eq!(
            Timeout::from_millis(250),
            Timeout::After(Duration::from_millis(250))
        );
    }

    #[test]
    fn set_is_bounded() {
        let signal = Signal::new();
        let mut set = DescriptorSet::new();
        for id in 0..MAX_DESCRIPTORS as i32 {
            assert!(set.add(signal.descriptor(), id));
        }
        assert!(!set.add(signal.descriptor(), 99));
        assert_eq!(set.len(), MAX_DESCRIPTORS);
    }
}
