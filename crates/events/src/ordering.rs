//! Score derivation for ordered cache indexes.
//!
//! A score is `millis + slot / 2^FRACTION_BITS` where the slot packs the entry
//! sequence (high bits) and the sub-index (low bits). All values involved are
//! exactly representable in an `f64` while `millis < 2^41`.

use crate::id::StreamEntryId;
use std::error::Error;
use std::fmt::{Display, Formatter};

const FRACTION_BITS: u32 = 12;
const SUB_INDEX_BITS: u32 = 4;
// Entries from sequence 255 on within one millisecond share the last slot:
// their scores tie and the cache orders tied members by member id.
const SEQ_BITS: u32 = FRACTION_BITS - SUB_INDEX_BITS;
const SEQ_SLOTS: u64 = 1 << SEQ_BITS;
const FRACTION_SCALE: f64 = (1u64 << FRACTION_BITS) as f64;

/// Upper bound on sub-records a single stream entry may expand into.
pub const MAX_FANOUT: usize = 1 << SUB_INDEX_BITS;

/// Largest millisecond component that still yields exact scores.
pub const MAX_EXACT_MILLIS: u64 = (1u64 << (f64::MANTISSA_DIGITS - FRACTION_BITS)) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderingError {
    FanoutExceeded { requested: usize },
}

impl Display for OrderingError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FanoutExceeded { requested } => write!(
                f,
                "entry expands into {} sub-records, maximum is {}",
                requested, MAX_FANOUT
            ),
        }
    }
}

impl Error for OrderingError {}

/// Score of a stream entry that maps to a single ordered record.
pub fn score(id: &StreamEntryId) -> f64 {
    compose(id, 0)
}

/// Score of the `sub_index`-th record produced by one stream entry.
///
/// Scores strictly increase with `sub_index` and stay below the score of the
/// entry's successor.
pub fn sub_score(id: &StreamEntryId, sub_index: usize) -> Result<f64, OrderingError> {
    if sub_index >= MAX_FANOUT {
        return Err(OrderingError::FanoutExceeded {
            requested: sub_index + 1,
        });
    }
    Ok(compose(id, sub_index as u64))
}

/// Validates that an entry expanding into `count` records can be scored.
pub fn check_fanout(count: usize) -> Result<(), OrderingError> {
    if count > MAX_FANOUT {
        return Err(OrderingError::FanoutExceeded { requested: count });
    }
    Ok(())
}

fn compose(id: &StreamEntryId, sub_index: u64) -> f64 {
    // sequences past the last slot tie instead of spilling into the next millisecond
    let seq = id.seq.min(SEQ_SLOTS - 1);
    let slot = (seq << SUB_INDEX_BITS) | sub_index;
    id.millis as f64 + slot as f64 / FRACTION_SCALE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sequence_is_integral() {
        assert_eq!(score(&StreamEntryId::new(1700, 0)), 1700.0);
    }

    #[test]
    fn later_entries_score_higher() {
        let ids = [
            StreamEntryId::new(1700, 0),
            StreamEntryId::new(1700, 1),
            StreamEntryId::new(1700, 2),
            StreamEntryId::new(1700, 10),
            StreamEntryId::new(1700, 254),
            StreamEntryId::new(1701, 0),
            StreamEntryId::new(1_760_000_000_000, 0),
            StreamEntryId::new(1_760_000_000_000, 1),
        ];
        for pair in ids.windows(2) {
            assert!(
                score(&pair[0]) < score(&pair[1]),
                "{} should sort before {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn sub_records_stay_between_entries() {
        let id = StreamEntryId::new(1_760_000_000_123, 4);
        let next = StreamEntryId::new(1_760_000_000_123, 5);
        let mut previous = score(&id);
        assert_eq!(sub_score(&id, 0).unwrap(), previous);
        for index in 1..MAX_FANOUT {
            let current = sub_score(&id, index).unwrap();
            assert!(current > previous);
            assert!(current < score(&next));
            previous = current;
        }
        assert!(sub_score(&id, MAX_FANOUT).is_err());
    }

    #[test]
    fn saturated_sequences_never_cross_millisecond() {
        let late = StreamEntryId::new(1700, 100_000);
        assert!(score(&late) < score(&StreamEntryId::new(1701, 0)));
        assert!(score(&late) >= score(&StreamEntryId::new(1700, 254)));
    }

    #[test]
    fn sequences_past_last_slot_tie() {
        let last = score(&StreamEntryId::new(1700, SEQ_SLOTS - 1));
        assert_eq!(score(&StreamEntryId::new(1700, 255)), last);
        assert_eq!(score(&StreamEntryId::new(1700, 300)), last);
        assert!(score(&StreamEntryId::new(1700, 254)) < last);
        assert_eq!(
            sub_score(&StreamEntryId::new(1700, 300), 3).unwrap(),
            sub_score(&StreamEntryId::new(1700, 255), 3).unwrap()
        );
    }

    #[test]
    fn fanout_bound_is_checked() {
        assert!(check_fanout(MAX_FANOUT).is_ok());
        assert_eq!(
            check_fanout(MAX_FANOUT + 1),
            Err(OrderingError::FanoutExceeded {
                requested: MAX_FANOUT + 1
            })
        );
    }

    #[test]
    fn exact_up_to_bound() {
        let id = StreamEntryId::new(MAX_EXACT_MILLIS, SEQ_SLOTS - 1);
        let value = sub_score(&id, MAX_FANOUT - 1).unwrap();
        assert!(value < (MAX_EXACT_MILLIS + 1) as f64);
        assert!(value > sub_score(&id, MAX_FANOUT - 2).unwrap());
    }
}
