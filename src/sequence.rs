//! Record Sequence Numbers
//!
//! Generates time-ordered 64-bit sequence numbers for map records so that
//! records written by different cluster members can be ordered on replay
//! without coordination.
//!
//! Layout (64 bits):
//! - 1 bit: unused (sign bit)
//! - 41 bits: milliseconds since `SEQUENCE_EPOCH`
//! - 10 bits: member ID (0-1023)
//! - 12 bits: counter (0-4095 per millisecond)

use std::sync::atomic::{AtomicU64, Ordering};

use crate::wal::record::SeqNo;

/// 2024-01-01 00:00:00 UTC
const SEQUENCE_EPOCH: u64 = 1_704_067_200_000;

const MEMBER_BITS: u64 = 10;
const COUNTER_BITS: u64 = 12;

const MAX_MEMBER: u64 = (1 << MEMBER_BITS) - 1;
const MAX_COUNTER: u64 = (1 << COUNTER_BITS) - 1;

const MEMBER_SHIFT: u64 = COUNTER_BITS;
const TIME_SHIFT: u64 = MEMBER_BITS + COUNTER_BITS;

/// Decompose a sequence number into (unix millis, member, counter)
pub fn decompose(seq: SeqNo) -> (u64, u16, u16) {
    (
        (seq >> TIME_SHIFT) + SEQUENCE_EPOCH,
        ((seq >> MEMBER_SHIFT) & MAX_MEMBER) as u16,
        (seq & MAX_COUNTER) as u16,
    )
}

/// Lock-free generator of strictly increasing sequence numbers for one member
pub struct SequenceGenerator {
    member: u64,
    /// upper bits = last millisecond, lower 12 bits = counter
    state: AtomicU64,
}

impl SequenceGenerator {
    /// Create a generator for `member`; IDs above 1023 wrap into range
    pub fn new(member: u16) -> Self {
        Self {
            member: member as u64 & MAX_MEMBER,
            state: AtomicU64::new(0),
        }
    }

    /// Create a generator whose output is always greater than `last`
    ///
    /// Used when a member restarts and must not reissue numbers it already
    /// logged, even if the wall clock moved backwards in between.
    pub fn resume_after(member: u16, last: SeqNo) -> Self {
        let generator = Self::new(member);
        let millis = last >> TIME_SHIFT;
        let counter = last & MAX_COUNTER;
        generator
            .state
            .store((millis << COUNTER_BITS) | counter, Ordering::SeqCst);
        generator
    }

    /// Next sequence number
    pub fn next(&self) -> SeqNo {
        loop {
            let now = Self::now_millis();
            let old = self.state.load(Ordering::Relaxed);
            let last_millis = old >> COUNTER_BITS;
            let last_counter = old & MAX_COUNTER;

            let (millis, counter) = if now > last_millis {
                (now, 0)
            } else if last_counter < MAX_COUNTER {
                // same millisecond, or the clock stepped back
                (last_millis, last_counter + 1)
            } else {
                std::thread::yield_now();
                if now < last_millis {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
                continue;
            };

            let new = (millis << COUNTER_BITS) | counter;
            if self
                .state
                .compare_exchange(old, new, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                return (millis << TIME_SHIFT) | (self.member << MEMBER_SHIFT) | counter;
            }
        }
    }

    fn now_millis() -> u64 {
        (chrono::Utc::now().timestamp_millis() as u64).saturating_sub(SEQUENCE_EPOCH)
    }

    /// Derive a member ID from a node name (e.g. "member-5" -> 5)
    pub fn parse_member(name: &str) -> u16 {
        let digits: String = name
            .chars()
            .rev()
            .take_while(|c| c.is_ascii_digit())
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();

        match digits.parse::<u64>() {
            Ok(n) => (n & MAX_MEMBER) as u16,
            Err(_) => {
                let hash = name
                    .bytes()
                    .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
                (hash & MAX_MEMBER) as u16
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_strictly_increasing() {
        let gen = SequenceGenerator::new(1);
        let mut last = 0;
        for _ in 0..5000 {
            let seq = gen.next();
            assert!(seq > last, "sequence must increase: {} <= {}", seq, last);
            last = seq;
        }
    }

    #[test]
    fn test_concurrent_generation_is_unique() {
        let gen = Arc::new(SequenceGenerator::new(3));
        let mut handles = vec![];

        for _ in 0..4 {
            let gen = Arc::clone(&gen);
            handles.push(thread::spawn(move || {
                (0..1000).map(|_| gen.next()).collect::<Vec<_>>()
            }));
        }

        let mut all = HashSet::new();
        for handle in handles {
            for seq in handle.join().unwrap() {
                assert!(all.insert(seq), "duplicate sequence {}", seq);
            }
        }
        assert_eq!(all.len(), 4000);
    }

    #[test]
    fn test_resume_after_future_sequence() {
        // a sequence number an hour ahead of the local clock
        let ahead = SequenceGenerator::new(2).next() + (3_600_000 << TIME_SHIFT);
        let gen = SequenceGenerator::resume_after(2, ahead);
        assert!(gen.next() > ahead);
    }

    #[test]
    fn test_decompose() {
        let seq = SequenceGenerator::new(42).next();
        let (millis, member, counter) = decompose(seq);
        assert_eq!(member, 42);
        assert!(millis > SEQUENCE_EPOCH);
        assert_eq!(counter, 0);
    }

    #[test]
    fn test_parse_member() {
        assert_eq!(SequenceGenerator::parse_member("member-5"), 5);
        assert_eq!(SequenceGenerator::parse_member("node42"), 42);
        assert_ne!(
            SequenceGenerator::parse_member("alpha"),
            SequenceGenerator::parse_member("beta")
        );
    }
}
