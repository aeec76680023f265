/// How a received counter relates to the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SequenceEvent {
    /// Nothing was seen before this counter
    First,
    /// Exactly one past the previous counter, including across the wrap
    Next,
    /// `lost` counters were skipped
    Gap { lost: u32 },
    /// Same counter as the previous one
    Duplicate,
    /// Behind the previous counter, e.g. a late or reordered datagram
    Stale,
}

/// Consecutive stale counters, each one ahead of the one before, after which
/// the sender is taken to have moved more than half the range ahead.
pub const RESYNC_AFTER_STALE: u32 = 3;

/// Tracks a wrapping packet counter and detects loss with modulo arithmetic.
///
/// Differences are taken modulo `2^bits`, so 65535 followed by 0 on a 16-bit
/// counter is the next packet and not a gap. A forward distance of more than
/// half the range is treated as the counter going backwards, until
/// [`RESYNC_AFTER_STALE`] such counters advance in a row. The tracker then
/// re-anchors on the newest one and reports the skipped counters as a gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SequenceTracker {
    mask: u32,
    last: Option<u32>,
    lost: u64,
    stale_run: u32,
    stale_tail: Option<u32>,
}

impl SequenceTracker {
    /// `bits` is clamped to 1..=32.
    pub const fn new(bits: u32) -> Self {
        let bits = if bits == 0 {
            1
        } else if bits > 32 {
            32
        } else {
            bits
        };

        let mask = if bits == 32 {
            u32::MAX
        } else {
            (1 << bits) - 1
        };

        Self {
            mask,
            last: None,
            lost: 0,
            stale_run: 0,
            stale_tail: None,
        }
    }

    /// Counter width in bits
    pub const fn bits(&self) -> u32 {
        self.mask.count_ones()
    }

    pub fn last(&self) -> Option<u32> {
        self.last
    }

    /// Total counters skipped so far
    pub fn lost(&self) -> u64 {
        self.lost
    }

    /// Forward distance from `from` to `to` modulo the counter range.
    pub fn distance(&self, from: u32, to: u32) -> u32 {
        to.wrapping_sub(from) & self.mask
    }

    pub fn observe(&mut self, counter: u32) -> SequenceEvent {
        let counter = counter & self.mask;

        let Some(last) = self.last else {
            self.last = Some(counter);
            return SequenceEvent::First;
        };

        let distance = self.distance(last, counter);

        if distance >= self.half() {
            return self.stale(last, counter);
        }

        self.stale_run = 0;
        self.stale_tail = None;

        match distance {
            0 => SequenceEvent::Duplicate,
            1 => {
                self.last = Some(counter);
                SequenceEvent::Next
            }
            d => {
                self.last = Some(counter);
                self.lost += u64::from(d - 1);
                SequenceEvent::Gap { lost: d - 1 }
            }
        }
    }

    pub fn reset(&mut self) {
        self.last = None;
        self.lost = 0;
        self.stale_run = 0;
        self.stale_tail = None;
    }

    fn half(&self) -> u32 {
        self.mask / 2 + 1
    }

    fn stale(&mut self, last: u32, counter: u32) -> SequenceEvent {
        let advancing = self.stale_tail.is_some_and(|tail| {
            let step = self.distance(tail, counter);
            step > 0 && step < self.half()
        });

        self.stale_run = if advancing { self.stale_run + 1 } else { 1 };
        self.stale_tail = Some(counter);

        if self.stale_run < RESYNC_AFTER_STALE {
            return SequenceEvent::Stale;
        }

        // The counters of the run itself were delivered
        let lost = self.distance(last, counter).saturating_sub(self.stale_run);

        self.last = Some(counter);
        self.lost += u64::from(lost);
        self.stale_run = 0;
        self.stale_tail = None;

        SequenceEvent::Gap { lost }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_is_not_loss() {
        let mut tracker = SequenceTracker::new(16);

        assert_eq!(tracker.observe(65534), SequenceEvent::First);
        assert_eq!(tracker.observe(65535), SequenceEvent::Next);
        assert_eq!(tracker.observe(0), SequenceEvent::Next);
        assert_eq!(tracker.observe(1), SequenceEvent::Next);
        assert_eq!(tracker.lost(), 0);
    }

    #[test]
    fn gaps_across_the_wrap() {
        let mut tracker = SequenceTracker::new(8);

        tracker.observe(250);
        assert_eq!(tracker.observe(3), SequenceEvent::Gap { lost: 8 });
        assert_eq!(tracker.last(), Some(3));
        assert_eq!(tracker.lost(), 8);
    }

    #[test]
    fn duplicates_and_stale() {
        let mut tracker = SequenceTracker::new(16);

        tracker.observe(100);
        assert_eq!(tracker.observe(100), SequenceEvent::Duplicate);
        assert_eq!(tracker.observe(99), SequenceEvent::Stale);
        assert_eq!(tracker.last(), Some(100));
        assert_eq!(tracker.observe(101), SequenceEvent::Next);
        assert_eq!(tracker.lost(), 0);
    }

    #[test]
    fn long_outage_resyncs() {
        let mut tracker = SequenceTracker::new(8);

        tracker.observe(0);
        assert_eq!(tracker.observe(200), SequenceEvent::Stale);
        assert_eq!(tracker.observe(201), SequenceEvent::Stale);
        assert_eq!(tracker.observe(202), SequenceEvent::Gap { lost: 199 });
        assert_eq!(tracker.last(), Some(202));

        for counter in 203..=257u32 {
            assert_eq!(tracker.observe(counter), SequenceEvent::Next);
        }
        assert_eq!(tracker.lost(), 199);
    }

    #[test]
    fn scattered_stale_counters_do_not_resync() {
        let mut tracker = SequenceTracker::new(16);

        tracker.observe(100);
        assert_eq!(tracker.observe(99), SequenceEvent::Stale);
        assert_eq!(tracker.observe(99), SequenceEvent::Stale);
        assert_eq!(tracker.observe(98), SequenceEvent::Stale);
        assert_eq!(tracker.observe(101), SequenceEvent::Next);
        assert_eq!(tracker.observe(97), SequenceEvent::Stale);
        assert_eq!(tracker.last(), Some(101));
        assert_eq!(tracker.lost(), 0);
    }

    #[test]
    fn full_width_counter() {
        let mut tracker = SequenceTracker::new(32);
        assert_eq!(tracker.bits(), 32);

        tracker.observe(u32::MAX);
        assert_eq!(tracker.observe(0), SequenceEvent::Next);
        assert_eq!(tracker.observe(5), SequenceEvent::Gap { lost: 4 });
    }

    #[test]
    fn counters_are_masked() {
        let mut tracker = SequenceTracker::new(8);

        tracker.observe(0x1FF);
        assert_eq!(tracker.last(), Some(0xFF));
        assert_eq!(tracker.observe(0x100), SequenceEvent::Next);

        tracker.reset();
        assert_eq!(tracker.last(), None);
    }
}
