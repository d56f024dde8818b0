use crate::config::PipelineConfig;
use crate::frame::{FrameBuffer, HEADER_SIZE, MAGIC_WORD};

/// Per-source frame counter tracking.
///
/// Counters are cyclic `u16`. The first frame from a source only seeds its
/// counter; afterwards a step of `k > 1` means `k - 1` frames went missing.
/// Repeated counters are not counted.
#[derive(Debug, Clone)]
pub struct SequenceTracker {
    last: [Option<u16>; 256],
}

impl Default for SequenceTracker {
    fn default() -> Self {
        Self { last: [None; 256] }
    }
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `counter` for `source_id` and return the number of frames lost
    /// since the previous one.
    pub fn observe(&mut self, source_id: u8, counter: u16) -> u64 {
        let previous = self.last[usize::from(source_id)].replace(counter);
        match previous {
            Some(last) => {
                let delta = counter.wrapping_sub(last);
                if delta > 1 {
                    u64::from(delta - 1)
                } else {
                    0
                }
            }
            None => 0,
        }
    }

    pub fn last_counter(&self, source_id: u8) -> Option<u16> {
        self.last[usize::from(source_id)]
    }

    pub fn reset(&mut self) {
        self.last = [None; 256];
    }
}

/// What to do with a frame after checking it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Not a frame from this stream; do not look further.
    Skip,
    /// Payload cannot be interpreted; counted, not forwarded.
    Discard,
    /// Convert and forward.
    Normalize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCheck {
    pub disposition: Disposition,
    pub lost: u64,
    pub bad: bool,
    pub broken: bool,
}

impl FrameCheck {
    fn skipped() -> Self {
        Self {
            disposition: Disposition::Skip,
            lost: 0,
            bad: true,
            broken: false,
        }
    }
}

/// Sequence and corruption checks against the configured nominal frame shape.
#[derive(Debug, Clone)]
pub struct FrameValidator {
    nominal_payload_bytes: usize,
    nominal_frame_bytes: usize,
    sequence: SequenceTracker,
}

impl FrameValidator {
    pub fn new(nominal_payload_bytes: usize) -> Self {
        Self {
            nominal_payload_bytes,
            nominal_frame_bytes: HEADER_SIZE + nominal_payload_bytes,
            sequence: SequenceTracker::new(),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.nominal_payload_bytes())
    }

    pub fn sequence(&self) -> &SequenceTracker {
        &self.sequence
    }

    /// Check a frame of which `bytes_read` bytes were actually delivered.
    pub fn check(&mut self, frame: &FrameBuffer, bytes_read: usize) -> FrameCheck {
        if bytes_read < HEADER_SIZE || frame.magic_word() != MAGIC_WORD {
            return FrameCheck::skipped();
        }

        let lost = self.sequence.observe(frame.source_id(), frame.frame_counter());
        let bad = frame.payload_size() as usize != self.nominal_payload_bytes
            || bytes_read != self.nominal_frame_bytes;

        let delivered = bytes_read.min(frame.total_size()) - HEADER_SIZE;
        let (disposition, broken) = match frame.payload_type().element_width() {
            Some(width) => (Disposition::Normalize, delivered % width != 0),
            None => (Disposition::Discard, true),
        };

        FrameCheck {
            disposition,
            lost,
            bad,
            broken,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PayloadType;
    use proptest::prelude::*;

    fn frame(counter: u16, source_id: u8) -> FrameBuffer {
        let mut frame = FrameBuffer::with_type(PayloadType::I16, 4);
        frame.set_magic_word(MAGIC_WORD);
        frame.set_frame_counter(counter);
        frame.set_source_id(source_id);
        frame
    }

    const FULL: usize = HEADER_SIZE + 8;

    #[test]
    fn first_frame_seeds_without_loss() {
        let mut seq = SequenceTracker::new();
        assert_eq!(seq.observe(0, 500), 0);
        assert_eq!(seq.last_counter(0), Some(500));
        assert_eq!(seq.observe(0, 501), 0);
        assert_eq!(seq.observe(0, 505), 3);
    }

    #[test]
    fn counter_wraps_cleanly() {
        let mut seq = SequenceTracker::new();
        seq.observe(1, 65_534);
        assert_eq!(seq.observe(1, 65_535), 0);
        assert_eq!(seq.observe(1, 0), 0);
        assert_eq!(seq.observe(1, 2), 1);
    }

    #[test]
    fn duplicate_counter_is_not_loss() {
        let mut seq = SequenceTracker::new();
        seq.observe(2, 10);
        assert_eq!(seq.observe(2, 10), 0);
    }

    #[test]
    fn sources_are_tracked_independently() {
        let mut seq = SequenceTracker::new();
        assert_eq!(seq.observe(1, 10), 0);
        assert_eq!(seq.observe(2, 900), 0);
        assert_eq!(seq.observe(1, 11), 0);
        assert_eq!(seq.observe(2, 901), 0);

        seq.reset();
        assert_eq!(seq.last_counter(1), None);
    }

    proptest! {
        #[test]
        fn loss_equals_sum_of_gaps(start in any::<u16>(), steps in prop::collection::vec(1u16..=u16::MAX, 1..50)) {
            let mut seq = SequenceTracker::new();
            seq.observe(0, start);
            let mut counter = start;
            let mut expected = 0u64;
            let mut lost = 0u64;
            for step in steps {
                counter = counter.wrapping_add(step);
                expected += u64::from(step - 1);
                lost += seq.observe(0, counter);
            }
            prop_assert_eq!(lost, expected);
        }
    }

    #[test]
    fn well_formed_frame_passes() {
        let mut v = FrameValidator::new(8);
        let check = v.check(&frame(1, 0), FULL);
        assert_eq!(check.disposition, Disposition::Normalize);
        assert!(!check.bad);
        assert!(!check.broken);
        assert_eq!(check.lost, 0);
    }

    #[test]
    fn wrong_magic_or_short_header_is_skipped() {
        let mut v = FrameValidator::new(8);
        let mut f = frame(1, 0);
        f.set_magic_word(0xDEAD);
        assert_eq!(v.check(&f, FULL), FrameCheck::skipped());
        assert_eq!(v.check(&frame(1, 0), HEADER_SIZE - 1), FrameCheck::skipped());
        assert_eq!(v.sequence().last_counter(0), None);
    }

    #[test]
    fn size_mismatch_is_bad_once() {
        let mut v = FrameValidator::new(8);
        let mut f = frame(1, 0);
        f.set_payload_size(6);
        let check = v.check(&f, HEADER_SIZE + 6);
        assert!(check.bad);
        assert!(!check.broken);
        assert_eq!(check.disposition, Disposition::Normalize);
    }

    #[test]
    fn odd_delivery_is_broken() {
        let mut v = FrameValidator::new(8);
        let check = v.check(&frame(1, 0), HEADER_SIZE + 3);
        assert!(check.bad);
        assert!(check.broken);
        assert_eq!(check.disposition, Disposition::Normalize);
    }

    #[test]
    fn unsupported_type_is_discarded() {
        let mut v = FrameValidator::new(8);
        let mut f = frame(1, 0);
        f.set_payload_type(PayloadType::Unsupported);
        let check = v.check(&f, FULL);
        assert_eq!(check.disposition, Disposition::Discard);
        assert!(check.broken);
        assert!(!check.bad);
    }

    #[test]
    fn from_config_uses_nominal_sizes() {
        let config = PipelineConfig {
            payload_type: PayloadType::I16,
            elements_per_frame: 4,
            ..PipelineConfig::default()
        };
        let mut v = FrameValidator::from_config(&config);
        assert!(!v.check(&frame(0, 0), FULL).bad);
    }
}
