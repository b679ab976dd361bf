//! Wall clock expressed in slots.
//!
//! Slot 0 starts at genesis. Times before genesis map to slot 0.
//!
//! Gossip and range sync accept blocks up to [`SlotTiming::maximum_clock_disparity`] early,
//! so [`SlotClock::current_slot_bounds`] widens the current slot by that amount in both directions.

use core::time::Duration;
use std::{sync::Arc, time::SystemTime};

use anyhow::Result;
use parking_lot::Mutex;
use types::{
    config::Config,
    consts::GENESIS_SLOT,
    primitives::{Slot, UnixSeconds},
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SlotTiming {
    pub genesis_time: UnixSeconds,
    pub slot_duration: Duration,
    pub maximum_clock_disparity: Duration,
}

impl SlotTiming {
    #[must_use]
    pub fn new(config: &Config, genesis_time: UnixSeconds) -> Self {
        Self {
            genesis_time,
            slot_duration: Duration::from_secs(config.seconds_per_slot.get()),
            maximum_clock_disparity: Duration::from_millis(
                config.maximum_gossip_clock_disparity_millis,
            ),
        }
    }

    /// Slot containing the instant `since_unix_epoch`.
    #[must_use]
    pub fn slot_at(self, since_unix_epoch: Duration) -> Slot {
        let genesis = Duration::from_secs(self.genesis_time);

        // `Duration` does not implement `Div<Duration>`, so we have to do arithmetic on nanoseconds.
        let nanos_since_genesis = since_unix_epoch.saturating_sub(genesis).as_nanos();
        let nanos_per_slot = self.slot_duration.as_nanos().max(1);
        let slots_since_genesis = nanos_since_genesis / nanos_per_slot;

        GENESIS_SLOT.saturating_add(Slot::try_from(slots_since_genesis).unwrap_or(Slot::MAX))
    }

    #[must_use]
    pub fn slot_start(self, slot: Slot) -> Duration {
        let slots_since_genesis = u32::try_from(slot - GENESIS_SLOT).unwrap_or(u32::MAX);

        Duration::from_secs(self.genesis_time)
            .saturating_add(self.slot_duration.saturating_mul(slots_since_genesis))
    }
}

/// Slots that may be considered current given clock disparity between nodes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SlotBounds {
    pub earliest: Slot,
    pub latest: Slot,
}

impl SlotBounds {
    #[must_use]
    pub const fn contains(self, slot: Slot) -> bool {
        self.earliest <= slot && slot <= self.latest
    }
}

pub trait SlotClock: Send + Sync {
    /// Time elapsed since the Unix epoch.
    fn now(&self) -> Result<Duration>;

    fn timing(&self) -> SlotTiming;

    fn current_slot(&self) -> Result<Slot> {
        Ok(self.timing().slot_at(self.now()?))
    }

    fn current_slot_bounds(&self) -> Result<SlotBounds> {
        let timing = self.timing();
        let now = self.now()?;

        Ok(SlotBounds {
            earliest: timing.slot_at(now.saturating_sub(timing.maximum_clock_disparity)),
            latest: timing.slot_at(now.saturating_add(timing.maximum_clock_disparity)),
        })
    }
}

impl<C: SlotClock + ?Sized> SlotClock for &C {
    fn now(&self) -> Result<Duration> {
        (**self).now()
    }

    fn timing(&self) -> SlotTiming {
        (**self).timing()
    }
}

impl<C: SlotClock + ?Sized> SlotClock for Arc<C> {
    fn now(&self) -> Result<Duration> {
        self.as_ref().now()
    }

    fn timing(&self) -> SlotTiming {
        self.as_ref().timing()
    }
}

pub struct SystemSlotClock {
    timing: SlotTiming,
}

impl SystemSlotClock {
    #[must_use]
    pub fn new(config: &Config, genesis_time: UnixSeconds) -> Self {
        Self {
            timing: SlotTiming::new(config, genesis_time),
        }
    }
}

impl SlotClock for SystemSlotClock {
    fn now(&self) -> Result<Duration> {
        Ok(SystemTime::now().duration_since(SystemTime::UNIX_EPOCH)?)
    }

    fn timing(&self) -> SlotTiming {
        self.timing
    }
}

/// Clock that only moves when told to.
pub struct ManualSlotClock {
    timing: SlotTiming,
    now: Mutex<Duration>,
}

impl ManualSlotClock {
    /// Creates a clock stopped at the start of `slot`.
    #[must_use]
    pub fn at_slot(config: &Config, genesis_time: UnixSeconds, slot: Slot) -> Self {
        let timing = SlotTiming::new(config, genesis_time);

        Self {
            timing,
            now: Mutex::new(timing.slot_start(slot)),
        }
    }

    pub fn set_slot(&self, slot: Slot) {
        *self.now.lock() = self.timing.slot_start(slot);
    }

    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.lock();
        *now = now.saturating_add(duration);
    }
}

impl SlotClock for ManualSlotClock {
    fn now(&self) -> Result<Duration> {
        Ok(*self.now.lock())
    }

    fn timing(&self) -> SlotTiming {
        self.timing
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    const GENESIS_TIME: UnixSeconds = 1_606_824_023;

    #[test_case(0 => 0; "before genesis")]
    #[test_case(GENESIS_TIME => 0; "at genesis")]
    #[test_case(GENESIS_TIME + 11 => 0; "end of first slot")]
    #[test_case(GENESIS_TIME + 12 => 1; "start of second slot")]
    #[test_case(GENESIS_TIME + 12 * 32 + 5 => 32; "second epoch")]
    fn slot_at_mainnet(seconds: u64) -> Slot {
        SlotTiming::new(&Config::mainnet(), GENESIS_TIME).slot_at(Duration::from_secs(seconds))
    }

    #[test]
    fn slot_start_is_inverse_of_slot_at() {
        let timing = SlotTiming::new(&Config::minimal(), GENESIS_TIME);

        for slot in [0, 1, 7, 8, 1000] {
            assert_eq!(timing.slot_at(timing.slot_start(slot)), slot);
        }
    }

    #[test]
    fn manual_clock_moves_only_when_told() -> Result<()> {
        let clock = ManualSlotClock::at_slot(&Config::mainnet(), GENESIS_TIME, 10);

        assert_eq!(clock.current_slot()?, 10);

        clock.advance(Duration::from_secs(11));

        assert_eq!(clock.current_slot()?, 10);

        clock.advance(Duration::from_secs(1));

        assert_eq!(clock.current_slot()?, 11);

        clock.set_slot(3);

        assert_eq!(clock.current_slot()?, 3);

        Ok(())
    }

    #[test]
    fn bounds_extend_into_neighboring_slots_near_boundaries() -> Result<()> {
        let clock = ManualSlotClock::at_slot(&Config::mainnet(), GENESIS_TIME, 10);

        assert_eq!(
            clock.current_slot_bounds()?,
            SlotBounds {
                earliest: 9,
                latest: 10,
            },
        );

        clock.advance(Duration::from_secs(6));

        let bounds = clock.current_slot_bounds()?;

        assert_eq!(
            bounds,
            SlotBounds {
                earliest: 10,
                latest: 10,
            },
        );
        assert!(bounds.contains(10));
        assert!(!bounds.contains(11));

        clock.advance(Duration::from_millis(5700));

        assert_eq!(clock.current_slot_bounds()?.latest, 11);

        Ok(())
    }

    #[test]
    fn system_clock_is_past_genesis() -> Result<()> {
        let clock = SystemSlotClock::new(&Config::mainnet(), GENESIS_TIME);

        assert!(clock.current_slot()? > 0);

        Ok(())
    }
}
