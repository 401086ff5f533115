//! Timeframe clock: maps orbit counters (or wall clock) to monotonic
//! timeframe ids.
//!
//! The first orbit seen by an equipment anchors its timeframe numbering
//! and is published to a process-wide counter so that all equipments can
//! be cross-checked against the same origin.

use crate::block::{UNDEFINED_ORBIT, UNDEFINED_TIMEFRAME_ID};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// LHC orbit rate in Hz (299792458 / 26659).
pub const LHC_ORBIT_RATE: u32 = 11246;
/// Number of bunches per LHC orbit.
pub const LHC_BUNCHES: u32 = 3564;
/// Default timeframe length, in orbits.
pub const DEFAULT_TF_PERIOD_ORBITS: u32 = 128;

/// Process-wide first-orbit cell. Zero (the undefined orbit) means unset.
pub type SharedFirstOrbit = Arc<AtomicU64>;

const FIRST_ORBIT_UNSET: u64 = u64::MAX;

/// Creates an unset shared first-orbit cell.
pub fn shared_first_orbit() -> SharedFirstOrbit {
    Arc::new(AtomicU64::new(FIRST_ORBIT_UNSET))
}

/// Reads the published first orbit, if any equipment set it already.
pub fn published_first_orbit(cell: &SharedFirstOrbit) -> Option<u32> {
    match cell.load(Ordering::Acquire) {
        FIRST_ORBIT_UNSET => None,
        v => Some(v as u32),
    }
}

/// Per-equipment orbit-to-timeframe converter.
pub struct TimeframeClock {
    name: String,
    tf_period_orbits: u32,
    first_orbit: u32,
    first_orbit_defined: bool,
    shared: SharedFirstOrbit,
    /// When set, a first-orbit mismatch across equipments is an error;
    /// otherwise it is only a warning.
    check_first_orbit: bool,
}

impl TimeframeClock {
    pub fn new(name: &str, tf_period_orbits: u32, shared: SharedFirstOrbit, check_first_orbit: bool) -> Self {
        Self {
            name: name.to_string(),
            tf_period_orbits: tf_period_orbits.max(1),
            first_orbit: UNDEFINED_ORBIT,
            first_orbit_defined: false,
            shared,
            check_first_orbit,
        }
    }

    pub fn tf_period_orbits(&self) -> u32 {
        self.tf_period_orbits
    }

    /// Timeframe id for the given orbit; timeframe 1 starts at the first
    /// orbit ever seen by this clock.
    ///
    /// On first call the local anchor is published to the shared cell; if
    /// another equipment already published a different value, the local
    /// value is kept and the disagreement reported.
    pub fn tf_from_orbit(&mut self, orbit: u32) -> u64 {
        if !self.first_orbit_defined {
            self.first_orbit = orbit;
            self.first_orbit_defined = true;
            let published = self
                .shared
                .compare_exchange(FIRST_ORBIT_UNSET, orbit as u64, Ordering::AcqRel, Ordering::Acquire);
            info!("equipment {}: first orbit = 0x{:X}", self.name, orbit);
            if let Err(other) = published {
                if other != orbit as u64 {
                    if self.check_first_orbit {
                        error!(
                            "equipment {}: first orbit 0x{:X} differs from other equipments (0x{:X})",
                            self.name, orbit, other
                        );
                    } else {
                        warn!(
                            "equipment {}: first orbit 0x{:X} differs from other equipments (0x{:X})",
                            self.name, orbit, other
                        );
                    }
                }
            }
        }
        1 + (orbit.wrapping_sub(self.first_orbit) as u64) / self.tf_period_orbits as u64
    }

    /// Orbit range `[min, max]` covered by a timeframe; `None` until the
    /// first orbit is known or for the undefined timeframe.
    pub fn orbit_range(&self, tf_id: u64) -> Option<(u32, u32)> {
        if tf_id == UNDEFINED_TIMEFRAME_ID || !self.first_orbit_defined {
            return None;
        }
        let min = self
            .first_orbit
            .wrapping_add(((tf_id - 1) * self.tf_period_orbits as u64) as u32);
        let max = min.wrapping_add(self.tf_period_orbits - 1);
        Some((min, max))
    }
}

/// Wall-clock timeframe source for equipments without packet headers:
/// the id increments every `tf_period / orbit_rate` seconds.
pub struct SoftwareTfClock {
    period: Duration,
    next_tick: Instant,
    current_tf: u64,
}

impl SoftwareTfClock {
    /// `tf_rate_hz` is `orbit_rate / tf_period_orbits`.
    pub fn new(tf_rate_hz: f64) -> Self {
        let period = Duration::from_secs_f64(1.0 / tf_rate_hz.max(1e-9));
        Self {
            period,
            next_tick: Instant::now() + period,
            current_tf: 1,
        }
    }

    /// Rate for the given timeframe length.
    pub fn rate_for_period(tf_period_orbits: u32) -> f64 {
        LHC_ORBIT_RATE as f64 / tf_period_orbits.max(1) as f64
    }

    /// Advances the id if the period elapsed; call once per loop.
    pub fn tick(&mut self) {
        let now = Instant::now();
        while now >= self.next_tick {
            self.current_tf += 1;
            self.next_tick += self.period;
        }
    }

    pub fn current(&self) -> u64 {
        self.current_tf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_orbit_anchors_tf_one() {
        let shared = shared_first_orbit();
        let mut clk = TimeframeClock::new("eq", 128, shared.clone(), true);
        assert_eq!(clk.tf_from_orbit(1000), 1);
        assert_eq!(clk.tf_from_orbit(1127), 1);
        assert_eq!(clk.tf_from_orbit(1128), 2);
        assert_eq!(clk.tf_from_orbit(1000 + 128 * 9), 10);
        assert_eq!(published_first_orbit(&shared), Some(1000));
    }

    #[test]
    fn orbit_range_reverses_mapping() {
        let mut clk = TimeframeClock::new("eq", 128, shared_first_orbit(), true);
        clk.tf_from_orbit(500);
        assert_eq!(clk.orbit_range(1), Some((500, 627)));
        assert_eq!(clk.orbit_range(3), Some((756, 883)));
        assert_eq!(clk.orbit_range(UNDEFINED_TIMEFRAME_ID), None);
    }

    #[test]
    fn range_is_none_before_first_orbit() {
        let clk = TimeframeClock::new("eq", 128, shared_first_orbit(), true);
        assert_eq!(clk.orbit_range(1), None);
    }

    #[test]
    fn second_equipment_keeps_local_anchor() {
        let shared = shared_first_orbit();
        let mut a = TimeframeClock::new("a", 128, shared.clone(), false);
        let mut b = TimeframeClock::new("b", 128, shared.clone(), false);
        assert_eq!(a.tf_from_orbit(100), 1);
        // b disagrees; mismatch is reported but local anchoring wins
        assert_eq!(b.tf_from_orbit(228), 1);
        assert_eq!(published_first_orbit(&shared), Some(100));
    }

    #[test]
    fn orbit_wraparound() {
        let shared = shared_first_orbit();
        let mut clk = TimeframeClock::new("eq", 128, shared, true);
        assert_eq!(clk.tf_from_orbit(u32::MAX - 63), 1);
        // 128 orbits later, past the wrap
        assert_eq!(clk.tf_from_orbit(64), 2);
    }

    #[test]
    fn software_clock_ticks() {
        let mut clk = SoftwareTfClock::new(1000.0);
        assert_eq!(clk.current(), 1);
        std::thread::sleep(Duration::from_millis(5));
        clk.tick();
        let tf = clk.current();
        assert!(tf >= 4 && tf <= 9, "tf = {}", tf);
    }
}
