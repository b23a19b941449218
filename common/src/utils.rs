//! Common Utilities
//!
//! Provides utility functions used across the GNodeB implementation

/// Round up to next power of 2
pub fn next_power_of_2(n: u32) -> u32 {
    if n == 0 {
        return 1;
    }

    let mut v = n;
    v -= 1;
    v |= v >> 1;
    v |= v >> 2;
    v |= v >> 4;
    v |= v >> 8;
    v |= v >> 16;
    v + 1
}

/// Time utilities for slot/frame calculations
pub mod time {
    /// Number of system frames before the SFN wraps
    pub const NOF_SFNS: u32 = 1024;

    /// Slot duration in microseconds for different SCS
    pub fn slot_duration_us(scs_khz: u16) -> u32 {
        match scs_khz {
            15 => 1000,    // 1 ms
            30 => 500,     // 0.5 ms
            60 => 250,     // 0.25 ms
            120 => 125,    // 0.125 ms
            240 => 62,     // 0.0625 ms (approximated)
            _ => panic!("Invalid SCS: {}", scs_khz),
        }
    }

    /// Number of slots per frame (10ms)
    pub fn slots_per_frame(scs_khz: u16) -> u16 {
        match scs_khz {
            15 => 10,
            30 => 20,
            60 => 40,
            120 => 80,
            240 => 160,
            _ => panic!("Invalid SCS: {}", scs_khz),
        }
    }

    /// Number of slots per frame (10ms) for a numerology index
    pub fn slots_per_frame_for_numerology(numerology: u8) -> u32 {
        assert!(numerology <= 4, "Invalid numerology: {}", numerology);
        10 << numerology
    }
}
