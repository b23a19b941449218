//! HARQ Process Management
//!
//! Tracks every DL and UL HARQ process of every UE in a cell, as per
//! TS 38.321 section 5.3.2 / 5.4.2. Processes move between `Empty`,
//! `WaitingAck` and `PendingRetx`; a slot-indexed timeout wheel resolves
//! processes whose feedback never arrives, and a cross-UE FIFO keeps the
//! processes due for retransmission in the order they were NACKed.
//!
//! The subsystem is single-threaded and slot-synchronous. The manager is
//! ticked once per slot with [`CellHarqManager::slot_indication`]; every other
//! call is made from the same thread while the slot is being scheduled.

pub mod config;
pub mod grant;
pub mod handle;
mod list;
pub mod manager;
pub mod ntn;
pub mod process;
pub mod repository;
pub mod ue_entity;

use common::{DuUeIndex, HarqId};
use std::fmt;
use thiserror::Error;

pub use config::HarqConfig;
pub use grant::{
    DciDlFormat, DciUlFormat, DlHarqAllocContext, DlHarqGrantParams, LcSchedInfo, PdschGrant,
    PuschGrant, UlHarqAllocContext, UlHarqGrantParams, VrbInterval,
};
pub use handle::{DlHarqProcessHandle, HarqHandle, UlHarqProcessHandle};
pub use manager::{
    CellHarqManager, HarqTimeoutNotifier, NoopHarqTimeoutNotifier, PendingRetxIter, PendingRetxs,
};
pub use ntn::NtnHarqSnapshot;
pub use process::{Dl, DlHarqExtra, HarqDirection, HarqProcess, Ul, UlHarqExtra};
pub use repository::{CellHarqRepository, DlHarqRepository, UeHarqTable, UlHarqRepository};
pub use ue_entity::UeHarqEntity;

/// Upper bound of HARQ processes per UE and direction
pub const MAX_NOF_HARQS: usize = 32;

/// Timeout applied once one of several expected PUCCH reports has arrived
pub const SHORT_ACK_TIMEOUT_DTX: u32 = 8;

/// Largest PDSCH-to-ACK (k1) or PDCCH-to-PUSCH (k2) delay a grant may use
pub const MAX_FEEDBACK_DELAY_SLOTS: u32 = 64;

/// Largest timeout wheel. Powers of two up to this size divide every SFN cycle length.
pub const MAX_TIMEOUT_WHEEL_SIZE: usize = 2048;

/// Slots after the expected feedback slot at which a HARQ-disabled process is flushed
pub const HARQ_DISABLED_FLUSH_SLOTS: u32 = 1;

/// Extra slots a flushed NTN process stays in the history past its feedback slot
pub const NTN_HISTORY_GRACE_SLOTS: u32 = 10;

/// Maximum number of snapshots kept in the NTN history of one repository
pub const NTN_HISTORY_MAX_ENTRIES: usize = 1024;

/// Stable reference to one HARQ process record of a repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HarqRef {
    /// Owning UE
    pub ue_index: DuUeIndex,
    /// HARQ process id
    pub h_id: HarqId,
}

impl HarqRef {
    /// Create a new record reference
    pub fn new(ue_index: DuUeIndex, h_id: HarqId) -> Self {
        Self { ue_index, h_id }
    }
}

impl fmt::Display for HarqRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ue={} h_id={}", self.ue_index, self.h_id)
    }
}

/// HARQ process state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HarqState {
    /// Free, available for a new transmission
    #[default]
    Empty,
    /// A grant is outstanding and its feedback is awaited
    WaitingAck,
    /// Feedback was negative and a retransmission is due
    PendingRetx,
}

/// HARQ-ACK bit value decoded from a PUCCH or PUSCH UCI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HarqAckStatus {
    /// Positive acknowledgement
    Ack,
    /// Negative acknowledgement
    Nack,
    /// Nothing detected
    #[default]
    Dtx,
}

impl HarqAckStatus {
    /// Rank used when several reports exist for the same process (ack > nack > dtx)
    pub fn strength(&self) -> u8 {
        match self {
            HarqAckStatus::Ack => 2,
            HarqAckStatus::Nack => 1,
            HarqAckStatus::Dtx => 0,
        }
    }
}

/// Result of feeding a DL HARQ-ACK report into a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarqStatusUpdate {
    /// The transport block was acknowledged and the process emptied
    Acked,
    /// The transport block was not acknowledged
    Nacked,
    /// More PUCCH reports are expected before the outcome is known
    NoUpdate,
    /// The process was not waiting for feedback (stale report)
    Error,
}

/// Result of feeding a PUSCH CRC indication into a UL process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UlCrcOutcome {
    /// CRC passed; carries the transport block size of the last grant
    Acked { tbs_bytes: u32 },
    /// CRC failed
    Nacked,
    /// The process was not waiting for feedback (stale report)
    Error,
}

/// HARQ entity management errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HarqError {
    #[error("UE index {ue_index} exceeds the cell capacity of {max_ues} UEs")]
    UeIndexOutOfRange { ue_index: DuUeIndex, max_ues: usize },

    #[error("UE {0} already has HARQ entities")]
    UeAlreadyExists(DuUeIndex),

    #[error("Invalid number of HARQ processes: {requested} (allowed 1..={max})")]
    InvalidHarqCount { requested: usize, max: usize },
}
