//! Progress tracking for flash operations

/// Progress update callbacks
pub trait ProgressCallbacks {
    /// Initialize the progress report for the segment at `index`
    fn init(&mut self, index: usize, addr: u32, total: usize);
    /// Update the number of bytes written for the current segment
    fn update(&mut self, current: usize);
    /// Finish the progress report for the current segment
    fn finish(&mut self);
}

/// Percentage reached once preparation is done and writing starts
pub const WRITE_START: u8 = 10;
/// Ceiling for the write phase
pub const WRITE_END: u8 = 90;
/// Percentage reported while verifying
pub const VERIFYING: u8 = 95;
/// Percentage reported once the device has been reset
pub const COMPLETE: u8 = 100;

/// Overall percentage of a single flash attempt
///
/// The first 10% cover preparation, the next 80% are split evenly between the
/// segments and the last 10% cover verification and reset. The reported value
/// never decreases and never exceeds 90% before verification starts.
#[derive(Debug, Clone)]
pub struct FlashProgress {
    segments: usize,
    current: u8,
}

impl FlashProgress {
    pub fn new(segments: usize) -> Self {
        FlashProgress {
            segments,
            current: 0,
        }
    }

    /// The last reported percentage
    pub fn current(&self) -> u8 {
        self.current
    }

    /// Writing has started
    pub fn write_started(&mut self) -> u8 {
        self.advance(WRITE_START)
    }

    /// `written` of `total` bytes of segment `index` have been written
    pub fn segment(&mut self, index: usize, written: usize, total: usize) -> u8 {
        let span = u64::from(WRITE_END - WRITE_START);
        let segments = self.segments.max(1) as u64;
        let (written, total) = match total {
            0 => (1, 1),
            total => (written.min(total) as u64, total as u64),
        };

        let done = (index as u64 * total + written) * span / (segments * total);
        let value = (u64::from(WRITE_START) + done).min(u64::from(WRITE_END));

        self.advance(value as u8)
    }

    /// The write has completed and is being verified
    pub fn verifying(&mut self) -> u8 {
        self.advance(VERIFYING)
    }

    /// The device has been reset
    pub fn complete(&mut self) -> u8 {
        self.advance(COMPLETE)
    }

    fn advance(&mut self, value: u8) -> u8 {
        self.current = self.current.max(value.min(COMPLETE));
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_phase_is_split_between_segments() {
        let mut progress = FlashProgress::new(2);

        assert_eq!(progress.write_started(), 10);
        assert_eq!(progress.segment(0, 50, 100), 30);
        assert_eq!(progress.segment(0, 100, 100), 50);
        assert_eq!(progress.segment(1, 0, 100), 50);
        assert_eq!(progress.segment(1, 100, 100), 90);
    }

    #[test]
    fn never_regresses() {
        let mut progress = FlashProgress::new(3);
        progress.write_started();
        progress.segment(1, 50, 100);

        let before = progress.current();
        assert_eq!(progress.segment(0, 10, 100), before);
        assert_eq!(progress.write_started(), before);
    }

    #[test]
    fn stays_below_verification_until_write_returns() {
        let mut progress = FlashProgress::new(1);
        progress.write_started();

        // Over-reporting from a programmer is clamped
        assert_eq!(progress.segment(0, 500, 100), WRITE_END);
        assert_eq!(progress.segment(4, 100, 100), WRITE_END);
        assert_eq!(progress.verifying(), VERIFYING);
        assert_eq!(progress.complete(), COMPLETE);
    }

    #[test]
    fn empty_segments_count_as_done() {
        let mut progress = FlashProgress::new(2);
        assert_eq!(progress.segment(0, 0, 0), 50);
    }

    #[test]
    fn uniform_throughput_over_uneven_segments() {
        let sizes = [100usize, 200, 300];
        let mut progress = FlashProgress::new(sizes.len());
        let mut seen = vec![progress.current()];

        seen.push(progress.write_started());
        assert_eq!(progress.current(), 10);

        for (index, total) in sizes.iter().copied().enumerate() {
            for written in (0..=total).step_by(10) {
                seen.push(progress.segment(index, written, total));
            }
        }
        assert!(progress.current() <= WRITE_END);

        seen.push(progress.verifying());
        seen.push(progress.complete());

        assert!(seen.windows(2).all(|pair| pair[0] <= pair[1]));
        assert!(seen.iter().all(|value| *value <= 100));
        assert_eq!(seen.last(), Some(&100));
    }
}
