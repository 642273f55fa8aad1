//! Waiting for freshly written files to stop growing.
//!
//! The instrument closes files whenever it pleases, so before a file is
//! copied or classified its size is polled until two consecutive samples
//! agree. The delay between polls follows `(2/π)·atan(i/6 + 0.1)` seconds:
//! about 60 ms for the first poll, approaching one second asymptotically.

use std::f64::consts::FRAC_2_PI;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;

/// Delay before the `attempt`-th size poll (0 based).
pub fn poll_delay(attempt: u32) -> Duration {
    let seconds = FRAC_2_PI * (f64::from(attempt) / 6.0 + 0.1).atan();
    Duration::from_secs_f64(seconds)
}

/// Source of file sizes, swapped out in tests.
pub trait SizeProbe: Send + Sync {
    fn size(&self, path: &Path) -> io::Result<u64>;
}

/// Reads sizes from file metadata.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsSizeProbe;

impl SizeProbe for FsSizeProbe {
    fn size(&self, path: &Path) -> io::Result<u64> {
        std::fs::metadata(path).map(|m| m.len())
    }
}

/// How a wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stability {
    /// Two consecutive polls returned the same size.
    Stable { size: u64, polls: u32 },
    /// The file disappeared while waiting; the caller decides what that means.
    Vanished,
    /// Still growing after the configured number of polls.
    GaveUp { polls: u32 },
}

/// Blocks until a file's size stops changing.
#[derive(Clone)]
pub struct StabilityWaiter {
    clock: Arc<dyn Clock>,
    probe: Arc<dyn SizeProbe>,
    max_polls: u32,
}

impl std::fmt::Debug for StabilityWaiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StabilityWaiter")
            .field("max_polls", &self.max_polls)
            .finish()
    }
}

impl StabilityWaiter {
    pub fn new(clock: Arc<dyn Clock>, max_polls: u32) -> Self {
        Self::with_probe(clock, Arc::new(FsSizeProbe), max_polls)
    }

    pub fn with_probe(clock: Arc<dyn Clock>, probe: Arc<dyn SizeProbe>, max_polls: u32) -> Self {
        Self {
            clock,
            probe,
            max_polls: max_polls.max(1),
        }
    }

    /// Poll `path` until its size settles.
    pub fn wait_until_stable(&self, path: &Path) -> Stability {
        let mut previous: Option<u64> = None;

        for attempt in 0..self.max_polls {
            let size = match self.probe.size(path) {
                Ok(size) => size,
                Err(e) => {
                    crate::debug_event!("stability", "vanished", "{}: {e}", path.display());
                    return Stability::Vanished;
                }
            };

            if previous == Some(size) {
                return Stability::Stable {
                    size,
                    polls: attempt + 1,
                };
            }

            previous = Some(size);
            self.clock.sleep(poll_delay(attempt));
        }

        tracing::warn!(
            "[stability] {} still changing after {} polls",
            path.display(),
            self.max_polls
        );
        Stability::GaveUp {
            polls: self.max_polls,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Returns scripted sizes, then `NotFound` once exhausted.
    struct ScriptedProbe(Mutex<VecDeque<u64>>);

    impl ScriptedProbe {
        fn new(sizes: &[u64]) -> Arc<Self> {
            Arc::new(Self(Mutex::new(sizes.iter().copied().collect())))
        }
    }

    impl SizeProbe for ScriptedProbe {
        fn size(&self, _path: &Path) -> io::Result<u64> {
            self.0
                .lock()
                .pop_front()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "gone"))
        }
    }

    #[test]
    fn test_poll_delay_curve() {
        let first = poll_delay(0).as_secs_f64();
        assert!((first - 0.0635).abs() < 0.001, "first delay {first}");

        let mut last = Duration::ZERO;
        for attempt in 0..200 {
            let delay = poll_delay(attempt);
            assert!(delay > last, "delay must grow monotonically");
            assert!(delay < Duration::from_secs(1));
            last = delay;
        }
        assert!(poll_delay(1000) > Duration::from_millis(990));
    }

    #[test]
    fn test_closed_file_settles_after_two_polls() {
        let clock = Arc::new(ManualClock::new());
        let waiter = StabilityWaiter::with_probe(clock.clone(), ScriptedProbe::new(&[42, 42]), 10);

        assert_eq!(
            waiter.wait_until_stable(Path::new("/root/a.tif")),
            Stability::Stable { size: 42, polls: 2 }
        );
        assert_eq!(clock.sleeps(), vec![poll_delay(0)]);
    }

    #[test]
    fn test_growing_file_keeps_polling() {
        let clock = Arc::new(ManualClock::new());
        let probe = ScriptedProbe::new(&[0, 100, 200, 200]);
        let waiter = StabilityWaiter::with_probe(clock.clone(), probe, 10);

        assert_eq!(
            waiter.wait_until_stable(Path::new("/root/a.tif")),
            Stability::Stable { size: 200, polls: 4 }
        );
        assert_eq!(clock.sleeps(), vec![poll_delay(0), poll_delay(1), poll_delay(2)]);
    }

    #[test]
    fn test_vanished_file_returns_quietly() {
        let clock = Arc::new(ManualClock::new());
        let waiter = StabilityWaiter::with_probe(clock, ScriptedProbe::new(&[10]), 10);

        assert_eq!(waiter.wait_until_stable(Path::new("/root/a.tif")), Stability::Vanished);
    }

    #[test]
    fn test_gives_up_after_max_polls() {
        let clock = Arc::new(ManualClock::new());
        let waiter = StabilityWaiter::with_probe(clock.clone(), ScriptedProbe::new(&[1, 2, 3, 4]), 3);

        assert_eq!(
            waiter.wait_until_stable(Path::new("/root/a.tif")),
            Stability::GaveUp { polls: 3 }
        );
        assert_eq!(clock.sleeps().len(), 3);
    }

    #[test]
    fn test_real_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img.tif");
        std::fs::write(&path, b"II*\0data").unwrap();

        let waiter = StabilityWaiter::new(Arc::new(ManualClock::new()), 10);
        assert!(matches!(
            waiter.wait_until_stable(&path),
            Stability::Stable { size: 8, .. }
        ));
    }
}
