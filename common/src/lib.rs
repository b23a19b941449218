//! Common Utilities and Types Library
//! 
//! This crate provides shared types and utilities used across the GNodeB implementation.

pub mod slot_point;
pub mod types;
pub mod utils;

// Re-export commonly used items
pub use slot_point::SlotPoint;
pub use types::*;
pub use utils::*;
