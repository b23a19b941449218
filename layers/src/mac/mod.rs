//! Medium Access Control (MAC) Layer Implementation
//! 
//! Implements the 5G NR MAC layer according to 3GPP TS 38.321

pub mod harq;

pub use harq::{
    CellHarqManager, DlHarqProcessHandle, HarqConfig, HarqTimeoutNotifier, UeHarqEntity,
    UlHarqProcessHandle,
};
