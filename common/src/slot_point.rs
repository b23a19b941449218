//! Slot Point
//!
//! A slot position inside the SFN cycle with wrap-aware arithmetic.

use crate::utils::time::{slots_per_frame_for_numerology, NOF_SFNS};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

/// Slot position as (numerology, slot count since SFN 0 slot 0)
///
/// The count wraps after `NOF_SFNS * slots_per_frame` slots. Comparisons and
/// differences take the shortest distance across that wrap, so two points
/// less than half a cycle apart compare the way their real time order does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SlotPoint {
    numerology: u8,
    count: u32,
}

impl SlotPoint {
    /// Create a slot point from SFN and slot index within the frame
    pub fn new(numerology: u8, sfn: u32, slot: u32) -> Self {
        let spf = slots_per_frame_for_numerology(numerology);
        assert!(sfn < NOF_SFNS, "Invalid SFN: {}", sfn);
        assert!(slot < spf, "Invalid slot index {} for numerology {}", slot, numerology);
        Self {
            numerology,
            count: sfn * spf + slot,
        }
    }

    /// Create a slot point from a raw slot count, reduced modulo the cycle
    pub fn from_count(numerology: u8, count: u32) -> Self {
        let cycle = Self::cycle_len(numerology);
        Self {
            numerology,
            count: count % cycle,
        }
    }

    /// Number of slots in one full SFN cycle for a numerology
    pub fn cycle_len(numerology: u8) -> u32 {
        NOF_SFNS * slots_per_frame_for_numerology(numerology)
    }

    /// Numerology (mu)
    pub fn numerology(&self) -> u8 {
        self.numerology
    }

    /// Slot count since SFN 0 slot 0
    pub fn count(&self) -> u32 {
        self.count
    }

    /// System frame number
    pub fn sfn(&self) -> u32 {
        self.count / self.nof_slots_per_frame()
    }

    /// Slot index within the frame
    pub fn slot_index(&self) -> u32 {
        self.count % self.nof_slots_per_frame()
    }

    /// Slots per 10 ms frame
    pub fn nof_slots_per_frame(&self) -> u32 {
        slots_per_frame_for_numerology(self.numerology)
    }

    fn cycle(&self) -> i64 {
        Self::cycle_len(self.numerology) as i64
    }
}

impl Add<i32> for SlotPoint {
    type Output = SlotPoint;

    fn add(self, rhs: i32) -> SlotPoint {
        let cycle = self.cycle();
        let count = (self.count as i64 + rhs as i64).rem_euclid(cycle);
        SlotPoint {
            numerology: self.numerology,
            count: count as u32,
        }
    }
}

impl AddAssign<i32> for SlotPoint {
    fn add_assign(&mut self, rhs: i32) {
        *self = *self + rhs;
    }
}

impl Sub<i32> for SlotPoint {
    type Output = SlotPoint;

    fn sub(self, rhs: i32) -> SlotPoint {
        self + (-rhs)
    }
}

impl SubAssign<i32> for SlotPoint {
    fn sub_assign(&mut self, rhs: i32) {
        *self = *self - rhs;
    }
}

/// Signed distance in slots, taking the shortest path across the SFN wrap
impl Sub<SlotPoint> for SlotPoint {
    type Output = i32;

    fn sub(self, rhs: SlotPoint) -> i32 {
        debug_assert_eq!(self.numerology, rhs.numerology, "Mixed numerologies");
        let cycle = self.cycle();
        let mut diff = self.count as i64 - rhs.count as i64;
        if diff >= cycle / 2 {
            diff -= cycle;
        } else if diff < -cycle / 2 {
            diff += cycle;
        }
        diff as i32
    }
}

impl PartialOrd for SlotPoint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.numerology != other.numerology {
            return None;
        }
        Some((*self - *other).cmp(&0))
    }
}

impl fmt::Display for SlotPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.sfn(), self.slot_index())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sfn_and_slot() {
        let sl = SlotPoint::new(1, 3, 7);
        assert_eq!(sl.sfn(), 3);
        assert_eq!(sl.slot_index(), 7);
        assert_eq!(sl.count(), 67);
        assert_eq!(sl.to_string(), "3.7");
    }

    #[test]
    fn test_add_crosses_frame() {
        let sl = SlotPoint::new(0, 5, 9) + 1;
        assert_eq!(sl.sfn(), 6);
        assert_eq!(sl.slot_index(), 0);
    }

    #[test]
    fn test_wrap_around_sfn_cycle() {
        let last = SlotPoint::new(0, 1023, 9);
        let first = last + 1;
        assert_eq!(first.count(), 0);
        assert_eq!(first - last, 1);
        assert_eq!(last - first, -1);
        assert!(first > last);
        assert_eq!(first - 1, last);
    }

    #[test]
    fn test_ordering() {
        let a = SlotPoint::new(1, 10, 0);
        let b = a + 40;
        assert!(a < b);
        assert!(b > a);
        assert_eq!(b - a, 40);
        assert_eq!(a.partial_cmp(&a), Some(Ordering::Equal));
    }

    #[test]
    fn test_from_count_reduces() {
        let cycle = SlotPoint::cycle_len(0);
        assert_eq!(cycle, 10240);
        assert_eq!(SlotPoint::from_count(0, cycle + 5).count(), 5);
    }
}
