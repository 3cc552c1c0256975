//! Outgoing presentation clock for synthetic tracks

use std::time::Duration;

use crate::{Error, Result};

/// Monotonic presentation-timestamp generator
///
/// Every call to [`OutgoingClock::tick`] advances by exactly one frame
/// period expressed in clock units, starting at zero. The sequence is
/// strictly increasing no matter what timestamps the relayed frames carried.
#[derive(Debug, Clone)]
pub struct OutgoingClock {
    clock_rate: u32,
    framerate: u32,
    step: i64,
    next: i64,
    ticks: u64,
}

impl OutgoingClock {
    /// Create a clock for the given rate (e.g. 90 kHz) and framerate
    pub fn new(clock_rate: u32, framerate: u32) -> Result<Self> {
        if framerate == 0 {
            return Err(Error::InvalidConfig(
                "outgoing framerate must be greater than 0".to_string(),
            ));
        }
        if clock_rate < framerate {
            return Err(Error::InvalidConfig(format!(
                "clock rate {} cannot represent {} fps",
                clock_rate, framerate
            )));
        }

        Ok(Self {
            clock_rate,
            framerate,
            step: i64::from(clock_rate / framerate),
            next: 0,
            ticks: 0,
        })
    }

    /// Timestamp for the next outgoing frame
    pub fn tick(&mut self) -> i64 {
        let pts = self.next;
        self.next += self.step;
        self.ticks += 1;
        pts
    }

    /// Clock units per frame
    pub fn step(&self) -> i64 {
        self.step
    }

    /// Wall-clock duration of one frame
    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.framerate))
    }

    /// Wall-clock offset of a timestamp from the clock origin
    pub fn offset_of(&self, pts: i64) -> Duration {
        Duration::from_secs_f64(pts.max(0) as f64 / f64::from(self.clock_rate))
    }

    /// Number of timestamps handed out
    pub fn ticks(&self) -> u64 {
        self.ticks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::VIDEO_CLOCK_RATE;

    #[test]
    fn test_step_at_30fps() {
        let mut clock = OutgoingClock::new(VIDEO_CLOCK_RATE, 30).unwrap();
        assert_eq!(clock.step(), 3000);
        assert_eq!(clock.tick(), 0);
        assert_eq!(clock.tick(), 3000);
        assert_eq!(clock.tick(), 6000);
        assert_eq!(clock.ticks(), 3);
    }

    #[test]
    fn test_offset_of() {
        let clock = OutgoingClock::new(VIDEO_CLOCK_RATE, 30).unwrap();
        assert_eq!(clock.offset_of(90_000), Duration::from_secs(1));
    }

    #[test]
    fn test_invalid_framerate() {
        assert!(OutgoingClock::new(VIDEO_CLOCK_RATE, 0).is_err());
        assert!(OutgoingClock::new(10, 30).is_err());
    }
}
